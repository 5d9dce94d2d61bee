//! Conflict detection and automatic resolution.
//!
//! A pure decision function: no I/O, no store access. The engine applies
//! the winning copy to the losing side.

use calbridge_core::event::Event;
use calbridge_core::types::{ConflictPolicy, EventSource};
use chrono::{DateTime, Utc};

/// Which side's copy survives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    Google,
    CalDav,
}

impl Winner {
    #[must_use]
    pub const fn source(self) -> EventSource {
        match self {
            Self::Google => EventSource::Google,
            Self::CalDav => EventSource::CalDav,
        }
    }
}

/// A resolution with its audit trail reason
#[derive(Debug, Clone)]
pub struct Resolution {
    pub winner: Winner,
    pub reason: String,
}

/// ## Summary
/// Declares a conflict only when the content hashes differ and both sides
/// moved after the mapping's last successful sync. Equal hashes never
/// conflict.
#[must_use]
pub fn is_conflict(a: &Event, b: &Event, last_synced_at: Option<DateTime<Utc>>) -> bool {
    let Some(last_synced) = last_synced_at else {
        return false;
    };
    a.updated > last_synced && b.updated > last_synced && a.content_hash() != b.content_hash()
}

/// ## Summary
/// Resolves a conflict between the two sides' copies.
///
/// Order of precedence: higher iCalendar SEQUENCE wins outright; otherwise
/// the policy decides, with `manual` promoted to `latest_wins` for headless
/// operation and an exact `updated` tie broken toward Google for stability.
#[must_use]
pub fn resolve(google: &Event, caldav: &Event, policy: ConflictPolicy) -> Resolution {
    if google.sequence != caldav.sequence {
        return if google.sequence > caldav.sequence {
            Resolution {
                winner: Winner::Google,
                reason: format!(
                    "google sequence higher ({} > {})",
                    google.sequence, caldav.sequence
                ),
            }
        } else {
            Resolution {
                winner: Winner::CalDav,
                reason: format!(
                    "caldav sequence higher ({} > {})",
                    caldav.sequence, google.sequence
                ),
            }
        };
    }

    let policy = match policy {
        ConflictPolicy::Manual => ConflictPolicy::LatestWins,
        other => other,
    };

    match policy {
        ConflictPolicy::GoogleWins => Resolution {
            winner: Winner::Google,
            reason: "google wins policy".to_string(),
        },
        ConflictPolicy::CalDavWins => Resolution {
            winner: Winner::CalDav,
            reason: "caldav wins policy".to_string(),
        },
        ConflictPolicy::Manual | ConflictPolicy::LatestWins => {
            if caldav.updated > google.updated {
                Resolution {
                    winner: Winner::CalDav,
                    reason: format!(
                        "caldav more recent ({} > {})",
                        caldav.updated, google.updated
                    ),
                }
            } else if google.updated > caldav.updated {
                Resolution {
                    winner: Winner::Google,
                    reason: format!(
                        "google more recent ({} > {})",
                        google.updated, caldav.updated
                    ),
                }
            } else {
                Resolution {
                    winner: Winner::Google,
                    reason: "equal timestamps, google wins tiebreak".to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use calbridge_core::event::EventStatus;
    use chrono::TimeZone;

    fn event(source: EventSource, summary: &str, sequence: i32, updated_min: u32) -> Event {
        Event {
            uid: "u@example.com".to_string(),
            native_id: "n".to_string(),
            source,
            summary: summary.to_string(),
            description: None,
            location: None,
            start: Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap(),
            all_day: false,
            timezone: None,
            created: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            updated: Utc.with_ymd_and_hms(2026, 2, 1, 10, updated_min, 0).unwrap(),
            etag: None,
            sequence,
            status: EventStatus::Confirmed,
            rrule: None,
            overrides: Vec::new(),
            master_native_id: None,
            organizer: None,
            attendees: Vec::new(),
            raw: None,
        }
    }

    #[test]
    fn higher_sequence_wins_regardless_of_policy() {
        let google = event(EventSource::Google, "A1", 2, 0);
        let caldav = event(EventSource::CalDav, "B1", 1, 30);
        let resolution = resolve(&google, &caldav, ConflictPolicy::CalDavWins);
        assert_eq!(resolution.winner, Winner::Google);
    }

    #[test]
    fn latest_wins_compares_updated() {
        let google = event(EventSource::Google, "A1", 0, 0);
        let caldav = event(EventSource::CalDav, "B1", 0, 30);
        let resolution = resolve(&google, &caldav, ConflictPolicy::LatestWins);
        assert_eq!(resolution.winner, Winner::CalDav);
    }

    #[test]
    fn manual_promotes_to_latest_wins() {
        let google = event(EventSource::Google, "A1", 0, 30);
        let caldav = event(EventSource::CalDav, "B1", 0, 0);
        let resolution = resolve(&google, &caldav, ConflictPolicy::Manual);
        assert_eq!(resolution.winner, Winner::Google);
    }

    #[test]
    fn exact_tie_goes_to_google() {
        let google = event(EventSource::Google, "A1", 0, 15);
        let caldav = event(EventSource::CalDav, "B1", 0, 15);
        let resolution = resolve(&google, &caldav, ConflictPolicy::LatestWins);
        assert_eq!(resolution.winner, Winner::Google);
    }

    #[test]
    fn fixed_side_policies_apply() {
        let google = event(EventSource::Google, "A1", 0, 30);
        let caldav = event(EventSource::CalDav, "B1", 0, 0);
        assert_eq!(
            resolve(&google, &caldav, ConflictPolicy::CalDavWins).winner,
            Winner::CalDav
        );
        assert_eq!(
            resolve(&google, &caldav, ConflictPolicy::GoogleWins).winner,
            Winner::Google
        );
    }

    #[test]
    fn conflict_requires_both_sides_moved_and_hash_delta() {
        let last_synced = Some(Utc.with_ymd_and_hms(2026, 2, 1, 10, 10, 0).unwrap());
        let google = event(EventSource::Google, "A1", 0, 20);
        let caldav = event(EventSource::CalDav, "B1", 0, 25);
        assert!(is_conflict(&google, &caldav, last_synced));

        // Only one side moved
        let stale_caldav = event(EventSource::CalDav, "B1", 0, 5);
        assert!(!is_conflict(&google, &stale_caldav, last_synced));

        // Equal hashes never conflict
        let same = event(EventSource::CalDav, "A1", 0, 25);
        assert!(!is_conflict(&google, &same, last_synced));

        // No prior sync, no conflict
        assert!(!is_conflict(&google, &caldav, None));
    }
}
