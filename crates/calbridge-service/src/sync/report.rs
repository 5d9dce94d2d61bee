//! In-memory pass report mirrored into the session audit at completion.

use calbridge_core::types::{EventSource, OperationKind};
use calbridge_db::db::query::audit::SessionCounters;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// One operation outcome retained for the report
#[derive(Debug, Clone)]
pub struct OperationOutcome {
    pub kind: OperationKind,
    pub source: EventSource,
    pub target: EventSource,
    pub native_id: String,
    pub summary: Option<String>,
    pub success: bool,
    pub error: Option<String>,
}

/// Conflict summary retained for the report
#[derive(Debug, Clone)]
pub struct ConflictOutcome {
    pub google_native_id: Option<String>,
    pub caldav_native_id: Option<String>,
    pub reason: String,
    pub resolution: Option<String>,
}

/// Comprehensive result of one engine run
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub dry_run: bool,
    counters: SessionCounters,
    pub results: Vec<OperationOutcome>,
    pub conflicts: Vec<ConflictOutcome>,
    pub errors: Vec<String>,
}

impl SyncReport {
    #[must_use]
    pub fn new(session_id: Uuid, started_at: DateTime<Utc>, dry_run: bool) -> Self {
        Self {
            session_id,
            started_at,
            completed_at: None,
            dry_run,
            counters: SessionCounters::default(),
            results: Vec::new(),
            conflicts: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Records one outcome and bumps the matching direction counter
    pub fn record(&mut self, outcome: OperationOutcome) {
        if outcome.success {
            let counter = match (outcome.source, outcome.kind) {
                (EventSource::Google, OperationKind::Create) => {
                    &mut self.counters.google_to_caldav_created
                }
                (EventSource::Google, OperationKind::Update) => {
                    &mut self.counters.google_to_caldav_updated
                }
                (EventSource::Google, OperationKind::Delete) => {
                    &mut self.counters.google_to_caldav_deleted
                }
                (EventSource::Google, OperationKind::Skip) => {
                    &mut self.counters.google_to_caldav_skipped
                }
                (EventSource::CalDav, OperationKind::Create) => {
                    &mut self.counters.caldav_to_google_created
                }
                (EventSource::CalDav, OperationKind::Update) => {
                    &mut self.counters.caldav_to_google_updated
                }
                (EventSource::CalDav, OperationKind::Delete) => {
                    &mut self.counters.caldav_to_google_deleted
                }
                (EventSource::CalDav, OperationKind::Skip) => {
                    &mut self.counters.caldav_to_google_skipped
                }
            };
            *counter += 1;
        }
        self.results.push(outcome);
    }

    /// Final counters as written to the session row
    #[must_use]
    pub const fn counters(&self) -> SessionCounters {
        self.counters
    }

    #[must_use]
    pub fn total_operations(&self) -> usize {
        self.results.len()
    }

    #[must_use]
    pub fn successful_operations(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    /// Fraction of successful operations; 1.0 for an empty pass
    #[must_use]
    #[expect(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        if self.results.is_empty() {
            return 1.0;
        }
        // Operation counts stay far below f64's exact integer range
        self.successful_operations() as f64 / self.results.len() as f64
    }

    /// Whether the session made any progress worth calling completed
    #[must_use]
    pub fn made_progress(&self) -> bool {
        self.errors.is_empty() || self.successful_operations() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(source: EventSource, kind: OperationKind, success: bool) -> OperationOutcome {
        OperationOutcome {
            kind,
            source,
            target: source.opposite(),
            native_id: "n".to_string(),
            summary: None,
            success,
            error: None,
        }
    }

    #[test]
    fn counters_follow_direction_and_kind() {
        let mut report = SyncReport::new(Uuid::new_v4(), Utc::now(), false);
        report.record(outcome(EventSource::Google, OperationKind::Create, true));
        report.record(outcome(EventSource::Google, OperationKind::Skip, true));
        report.record(outcome(EventSource::CalDav, OperationKind::Delete, true));
        report.record(outcome(EventSource::CalDav, OperationKind::Update, false));

        let counters = report.counters();
        assert_eq!(counters.google_to_caldav_created, 1);
        assert_eq!(counters.google_to_caldav_skipped, 1);
        assert_eq!(counters.caldav_to_google_deleted, 1);
        // Failures do not count
        assert_eq!(counters.caldav_to_google_updated, 0);
        assert_eq!(report.total_operations(), 4);
    }

    #[test]
    fn success_rate_of_empty_report_is_one() {
        let report = SyncReport::new(Uuid::new_v4(), Utc::now(), false);
        assert!((report.success_rate() - 1.0).abs() < f64::EPSILON);
        assert!(report.made_progress());
    }
}
