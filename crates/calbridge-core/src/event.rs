//! Canonical, source-neutral calendar event model.
//!
//! Both adapters translate their wire formats into [`Event`]; everything the
//! sync engine does (hashing, conflict detection, recurrence grouping) is
//! expressed over this type.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CoreError, CoreResult};
use crate::types::EventSource;

/// iCalendar STATUS as far as the engine cares
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    #[default]
    Confirmed,
    Cancelled,
}

/// Event organizer info
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organizer {
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// A single attendee entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attendee {
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub response_status: Option<String>,
    #[serde(default)]
    pub organizer: bool,
}

/// Recurrence deviation attached to an event.
///
/// `RDate`/`ExDate` live on a master; `RecurrenceId` marks the carrying
/// event as an override of a same-UID master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecurrenceOverride {
    RDate {
        dates: Vec<DateTime<Utc>>,
    },
    ExDate {
        dates: Vec<DateTime<Utc>>,
    },
    RecurrenceId {
        instant: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        original_start: Option<DateTime<Utc>>,
    },
}

/// Canonical calendar event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Stable cross-system id: the iCalendar UID when a side supplies one,
    /// else synthesized as `{source}-{native_id}`
    pub uid: String,
    /// Per-source opaque id (event id for Google, resource href for CalDAV)
    pub native_id: String,
    pub source: EventSource,
    pub summary: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub start: DateTime<Utc>,
    /// Exclusive end; for all-day events the exclusive day boundary
    pub end: DateTime<Utc>,
    pub all_day: bool,
    /// Original IANA timezone for non-all-day events
    pub timezone: Option<String>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    /// Opaque per-source version tag
    pub etag: Option<String>,
    /// iCalendar SEQUENCE, defaults to 0
    pub sequence: i32,
    pub status: EventStatus,
    /// RFC 5545 RRULE text, without the `RRULE:` prefix
    pub rrule: Option<String>,
    pub overrides: Vec<RecurrenceOverride>,
    /// Native id of the recurring master when this event is an override
    pub master_native_id: Option<String>,
    pub organizer: Option<Organizer>,
    pub attendees: Vec<Attendee>,
    /// Provider payload kept only for diagnostics
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
}

impl Event {
    /// Synthesizes the canonical UID for an event whose source supplied none.
    #[must_use]
    pub fn synthesize_uid(source: EventSource, native_id: &str) -> String {
        format!("{source}-{native_id}")
    }

    /// ## Summary
    /// Checks the timing invariant: `end > start` for timed events, and the
    /// all-day `end` is an exclusive day boundary strictly after `start`.
    ///
    /// ## Errors
    /// Returns a validation error when the invariant does not hold.
    pub fn validate(&self) -> CoreResult<()> {
        if self.end <= self.start {
            return Err(CoreError::ValidationError(format!(
                "end ({}) must be after start ({}) for event {}",
                self.end, self.start, self.uid
            )));
        }
        Ok(())
    }

    /// ## Summary
    /// Deterministic digest of the user-visible fields, used for
    /// skip-if-unchanged decisions and mapping freshness.
    ///
    /// Volatile fields (etag, sequence, server timestamps, native ids) are
    /// excluded so the same content hashes identically on both sides.
    #[must_use]
    pub fn content_hash(&self) -> String {
        let mut attendees: Vec<&Attendee> = self.attendees.iter().collect();
        attendees.sort_by(|a, b| a.email.cmp(&b.email));

        // serde_json's default map is ordered, so key order is canonical
        let content = serde_json::json!({
            "uid": self.uid,
            "summary": self.summary,
            "description": self.description.as_deref().unwrap_or(""),
            "location": self.location.as_deref().unwrap_or(""),
            "start": self.canonical_instant(self.start),
            "end": self.canonical_instant(self.end),
            "all_day": self.all_day,
            "timezone": self.timezone,
            "rrule": self.rrule,
            "organizer": self.organizer,
            "attendees": attendees,
        });

        let mut hasher = Sha256::new();
        hasher.update(content.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    fn canonical_instant(&self, instant: DateTime<Utc>) -> String {
        if self.all_day {
            instant.format("%Y-%m-%d").to_string()
        } else {
            instant.to_rfc3339_opts(SecondsFormat::Secs, true)
        }
    }

    /// Preferred deduplication key: UID when present, else the content hash
    #[must_use]
    pub fn dedup_key(&self) -> String {
        if self.uid.is_empty() {
            self.content_hash()
        } else {
            self.uid.clone()
        }
    }

    /// Whether this event is a single-instance deviation from a recurrence
    #[must_use]
    pub fn is_recurrence_override(&self) -> bool {
        self.master_native_id.is_some()
            || self
                .overrides
                .iter()
                .any(|o| matches!(o, RecurrenceOverride::RecurrenceId { .. }))
    }

    /// Whether this event is a recurring master
    #[must_use]
    pub fn is_recurrence_master(&self) -> bool {
        self.rrule.is_some() && !self.is_recurrence_override()
    }

    /// The RECURRENCE-ID instant when this event is an override
    #[must_use]
    pub fn recurrence_id(&self) -> Option<DateTime<Utc>> {
        self.overrides.iter().find_map(|o| match o {
            RecurrenceOverride::RecurrenceId { instant, .. } => Some(*instant),
            _ => None,
        })
    }

    /// The original occurrence start the override replaces, falling back to
    /// the RECURRENCE-ID instant and finally this event's own start
    #[must_use]
    pub fn original_start(&self) -> DateTime<Utc> {
        self.overrides
            .iter()
            .find_map(|o| match o {
                RecurrenceOverride::RecurrenceId {
                    instant,
                    original_start,
                } => Some(original_start.unwrap_or(*instant)),
                _ => None,
            })
            .unwrap_or(self.start)
    }

    /// ## Summary
    /// Demotes an orphaned override to a standalone event by clearing the
    /// master-reference fields, so no broken recurrence exception is
    /// synthesized on the target side.
    pub fn demote_to_standalone(&mut self) {
        self.master_native_id = None;
        self.overrides
            .retain(|o| !matches!(o, RecurrenceOverride::RecurrenceId { .. }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_event() -> Event {
        Event {
            uid: "abc-123@example.com".to_string(),
            native_id: "evt1".to_string(),
            source: EventSource::Google,
            summary: "Standup".to_string(),
            description: Some("Daily".to_string()),
            location: None,
            start: Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2026, 3, 2, 9, 30, 0).unwrap(),
            all_day: false,
            timezone: Some("Europe/Berlin".to_string()),
            created: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            updated: Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap(),
            etag: Some("\"e1\"".to_string()),
            sequence: 0,
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
    fn content_hash_ignores_volatile_fields() {
        let a = sample_event();
        let mut b = sample_event();
        b.etag = Some("\"e2\"".to_string());
        b.sequence = 4;
        b.native_id = "other-native-id".to_string();
        b.updated = Utc.with_ymd_and_hms(2026, 2, 2, 0, 0, 0).unwrap();
        assert_eq!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn content_hash_tracks_user_visible_fields() {
        let a = sample_event();
        let mut b = sample_event();
        b.summary = "Standup (moved)".to_string();
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn content_hash_is_attendee_order_independent() {
        let mut a = sample_event();
        let mut b = sample_event();
        let alice = Attendee {
            email: "alice@example.com".to_string(),
            display_name: None,
            response_status: Some("accepted".to_string()),
            organizer: false,
        };
        let bob = Attendee {
            email: "bob@example.com".to_string(),
            display_name: None,
            response_status: Some("needsAction".to_string()),
            organizer: false,
        };
        a.attendees = vec![alice.clone(), bob.clone()];
        b.attendees = vec![bob, alice];
        assert_eq!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn validate_rejects_inverted_times() {
        let mut ev = sample_event();
        ev.end = ev.start;
        assert!(ev.validate().is_err());
    }

    #[test]
    fn override_predicates() {
        let mut ev = sample_event();
        assert!(!ev.is_recurrence_override());
        assert!(!ev.is_recurrence_master());

        ev.rrule = Some("FREQ=DAILY;COUNT=5".to_string());
        assert!(ev.is_recurrence_master());

        let mut inst = sample_event();
        inst.master_native_id = Some("evt1".to_string());
        inst.overrides.push(RecurrenceOverride::RecurrenceId {
            instant: inst.start,
            original_start: None,
        });
        assert!(inst.is_recurrence_override());
        assert_eq!(inst.recurrence_id(), Some(inst.start));

        inst.demote_to_standalone();
        assert!(!inst.is_recurrence_override());
        assert!(inst.master_native_id.is_none());
    }

    #[test]
    fn synthesized_uid_names_the_source() {
        assert_eq!(
            Event::synthesize_uid(EventSource::Google, "xyz"),
            "google-xyz"
        );
    }
}
