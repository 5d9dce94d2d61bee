//! Uniform capability contract both remote services are wrapped behind.
//!
//! Adapters hide wire formats and translate to and from the canonical
//! event model; the engine only ever speaks this trait.

use std::future::Future;

use calbridge_core::event::Event;
use calbridge_core::types::{CalendarInfo, ChangeSet, EventSource};
use chrono::{DateTime, TimeDelta, Utc};

use crate::error::AdapterResult;

pub mod caldav;
pub mod google;

/// Snapshot window used when no token is in effect
#[derive(Debug, Clone, Copy)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// `[now - past_days, now + future_days]`
    #[must_use]
    pub fn around_now(past_days: i64, future_days: i64) -> Self {
        let now = Utc::now();
        Self {
            start: now - TimeDelta::days(past_days),
            end: now + TimeDelta::days(future_days),
        }
    }

    /// Narrow probe window used by race verification
    #[must_use]
    pub fn probe(session_start: DateTime<Utc>, slack: TimeDelta) -> Self {
        Self {
            start: session_start - slack,
            end: Utc::now() + slack,
        }
    }
}

/// Capability set shared by both services.
///
/// Mutating calls that carry a client-supplied id and all reads are
/// idempotent; adapters internally enforce rate limiting and bounded
/// backoff.
pub trait CalendarAdapter: Send + Sync {
    /// Which side of a pair this adapter serves
    fn source(&self) -> EventSource;

    /// Lists calendars visible to the authenticated account
    fn list_calendars(&self) -> impl Future<Output = AdapterResult<Vec<CalendarInfo>>> + Send;

    /// Establishes an initial continuation token for later incremental
    /// calls; may traverse all pages to reach it
    fn get_sync_token(&self, calendar_id: &str)
    -> impl Future<Output = AdapterResult<String>> + Send;

    /// Returns all server-side changes since `since_token`, or a `window`
    /// snapshot when the token is absent. A rejected token is reported via
    /// `ChangeSet::invalidated_token` together with a snapshot result.
    fn get_change_set(
        &self,
        calendar_id: &str,
        since_token: Option<&str>,
        window: TimeWindow,
        max_events: usize,
    ) -> impl Future<Output = AdapterResult<ChangeSet>> + Send;

    fn get_event(
        &self,
        calendar_id: &str,
        native_id: &str,
    ) -> impl Future<Output = AdapterResult<Event>> + Send;

    /// Creates the event, using a deterministic client-supplied identity so
    /// retries and cross-direction propagation cannot duplicate it
    fn create_event(
        &self,
        calendar_id: &str,
        event: &Event,
    ) -> impl Future<Output = AdapterResult<Event>> + Send;

    fn update_event(
        &self,
        calendar_id: &str,
        native_id: &str,
        event: &Event,
    ) -> impl Future<Output = AdapterResult<Event>> + Send;

    fn delete_event(
        &self,
        calendar_id: &str,
        native_id: &str,
    ) -> impl Future<Output = AdapterResult<()>> + Send;

    /// Applies a recurrence override on this side without creating a second
    /// object carrying the master's UID: merged into the master resource on
    /// CalDAV, applied to the matching instance on the token API. Falls back
    /// to a standalone create when no master is reachable.
    fn apply_recurrence_override(
        &self,
        calendar_id: &str,
        master_native_id: Option<&str>,
        master_uid: &str,
        event: &Event,
    ) -> impl Future<Output = AdapterResult<Event>> + Send;

    /// Resolves a single instance of a recurring master by its original
    /// occurrence start
    fn find_instance(
        &self,
        calendar_id: &str,
        master_native_id: &str,
        occurrence_start: DateTime<Utc>,
    ) -> impl Future<Output = AdapterResult<Option<Event>>> + Send;
}
