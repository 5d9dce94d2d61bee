//! Persistence seam between the engine and the state store.
//!
//! The store owns all persisted rows; the engine borrows them for the
//! duration of a pair pass and writes back through this trait. The
//! production implementation is [`pg::PgStore`]; engine tests drive an
//! in-memory double.

use std::future::Future;

use calbridge_core::types::{ConflictPolicy, EventSource, OperationKind, SyncDirection};
use calbridge_db::db::enums::{MappingStatus, SessionStatus};
use calbridge_db::db::query::audit::SessionCounters;
use calbridge_db::model::mapping::EventMapping;
use calbridge_db::model::pair::CalendarPair;
use calbridge_db::model::session::SyncSession;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::ServiceResult;

pub mod pg;

/// Materialization request for a new pair row
#[derive(Debug, Clone)]
pub struct PairDraft {
    pub google_calendar_id: String,
    pub caldav_calendar_id: String,
    pub google_calendar_name: Option<String>,
    pub caldav_calendar_name: Option<String>,
    pub direction: SyncDirection,
    pub enabled: bool,
    pub conflict_policy: Option<ConflictPolicy>,
}

/// Insert request carrying a mapping's full identity columns
#[derive(Debug, Clone, Default)]
pub struct MappingDraft {
    pub pair_id: Uuid,
    pub google_event_id: Option<String>,
    pub caldav_event_id: Option<String>,
    pub google_ical_uid: Option<String>,
    pub caldav_uid: Option<String>,
    pub canonical_uid: Option<String>,
    pub caldav_resource_href: Option<String>,
    pub google_self_link: Option<String>,
    pub google_etag: Option<String>,
    pub caldav_etag: Option<String>,
    pub google_sequence: i32,
    pub caldav_sequence: i32,
    pub content_hash: String,
    pub sync_direction: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// Volatile-column refresh applied after a successful propagation
#[derive(Debug, Clone, Default)]
pub struct MappingRefresh {
    pub content_hash: String,
    pub google_etag: Option<String>,
    pub caldav_etag: Option<String>,
    pub google_sequence: Option<i32>,
    pub caldav_sequence: Option<i32>,
    pub sync_direction: Option<String>,
}

/// Identity rebind for one side of a mapping after target recreation
#[derive(Debug, Clone)]
pub struct SideRebind {
    pub native_id: String,
    pub uid: Option<String>,
    /// Self link (Google) or resource href (CalDAV)
    pub link: Option<String>,
    pub etag: Option<String>,
    pub sequence: i32,
}

/// One audit operation row
#[derive(Debug, Clone)]
pub struct OperationRecord {
    pub session_id: Uuid,
    pub mapping_id: Option<Uuid>,
    pub kind: OperationKind,
    pub source: EventSource,
    pub target: EventSource,
    pub native_id: String,
    pub summary: Option<String>,
    pub success: bool,
    pub error: Option<String>,
}

/// One audit conflict row with both sides' serialized payloads
#[derive(Debug, Clone)]
pub struct ConflictRecord {
    pub session_id: Uuid,
    pub mapping_id: Option<Uuid>,
    pub google_event_id: Option<String>,
    pub caldav_event_id: Option<String>,
    pub google_payload: Option<serde_json::Value>,
    pub caldav_payload: Option<serde_json::Value>,
    pub conflict_kind: String,
    pub resolution: Option<String>,
}

pub trait SyncStore: Send + Sync {
    fn list_enabled_pairs(
        &self,
    ) -> impl Future<Output = ServiceResult<Vec<CalendarPair>>> + Send;

    fn find_pair(
        &self,
        google_calendar_id: &str,
        caldav_calendar_id: &str,
    ) -> impl Future<Output = ServiceResult<Option<CalendarPair>>> + Send;

    fn insert_pair(
        &self,
        draft: PairDraft,
    ) -> impl Future<Output = ServiceResult<CalendarPair>> + Send;

    fn update_pair_names(
        &self,
        pair_id: Uuid,
        google_name: Option<String>,
        caldav_name: Option<String>,
    ) -> impl Future<Output = ServiceResult<()>> + Send;

    /// Atomic with `last_synced_at`; the final write of a pair pass
    fn persist_tokens(
        &self,
        pair_id: Uuid,
        google_sync_token: Option<String>,
        caldav_sync_token: Option<String>,
    ) -> impl Future<Output = ServiceResult<()>> + Send;

    fn clear_google_token(&self, pair_id: Uuid)
    -> impl Future<Output = ServiceResult<()>> + Send;

    fn clear_caldav_token(&self, pair_id: Uuid)
    -> impl Future<Output = ServiceResult<()>> + Send;

    fn clear_tokens(&self, pair_id: Uuid) -> impl Future<Output = ServiceResult<()>> + Send;

    fn load_mappings(
        &self,
        pair_id: Uuid,
    ) -> impl Future<Output = ServiceResult<Vec<EventMapping>>> + Send;

    fn find_mapping_by_native(
        &self,
        pair_id: Uuid,
        source: EventSource,
        native_id: &str,
    ) -> impl Future<Output = ServiceResult<Option<EventMapping>>> + Send;

    fn find_mapping_by_uid(
        &self,
        pair_id: Uuid,
        canonical_uid: &str,
    ) -> impl Future<Output = ServiceResult<Option<EventMapping>>> + Send;

    fn insert_mapping(
        &self,
        draft: MappingDraft,
    ) -> impl Future<Output = ServiceResult<EventMapping>> + Send;

    fn refresh_mapping(
        &self,
        mapping_id: Uuid,
        refresh: MappingRefresh,
    ) -> impl Future<Output = ServiceResult<()>> + Send;

    /// Rebinds one side's identity and refreshes the volatile columns in a
    /// single transaction, so no observer sees a mapping with inconsistent
    /// identity columns
    fn rebind_and_refresh(
        &self,
        mapping_id: Uuid,
        side: EventSource,
        rebind: SideRebind,
        refresh: MappingRefresh,
    ) -> impl Future<Output = ServiceResult<()>> + Send;

    fn set_mapping_status(
        &self,
        mapping_id: Uuid,
        status: MappingStatus,
    ) -> impl Future<Output = ServiceResult<()>> + Send;

    fn create_session(
        &self,
        dry_run: bool,
    ) -> impl Future<Output = ServiceResult<SyncSession>> + Send;

    fn complete_session(
        &self,
        session_id: Uuid,
        status: SessionStatus,
        error_message: Option<String>,
        counters: SessionCounters,
    ) -> impl Future<Output = ServiceResult<()>> + Send;

    fn record_operation(
        &self,
        record: OperationRecord,
    ) -> impl Future<Output = ServiceResult<()>> + Send;

    fn record_conflict(
        &self,
        record: ConflictRecord,
    ) -> impl Future<Output = ServiceResult<()>> + Send;
}
