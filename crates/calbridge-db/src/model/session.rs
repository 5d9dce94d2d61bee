use diesel::{pg::Pg, prelude::*};

use crate::db::{enums::SessionStatus, schema};

/// Append-only audit record of one engine run
#[derive(Debug, Clone, PartialEq, Eq, Queryable, Selectable, Identifiable)]
#[diesel(table_name = schema::sync_sessions)]
#[diesel(check_for_backend(Pg))]
pub struct SyncSession {
    pub id: uuid::Uuid,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub dry_run: bool,
    pub status: SessionStatus,
    pub error_message: Option<String>,
    pub google_to_caldav_created: i32,
    pub google_to_caldav_updated: i32,
    pub google_to_caldav_deleted: i32,
    pub google_to_caldav_skipped: i32,
    pub caldav_to_google_created: i32,
    pub caldav_to_google_updated: i32,
    pub caldav_to_google_deleted: i32,
    pub caldav_to_google_skipped: i32,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = schema::sync_sessions)]
pub struct NewSyncSession {
    pub id: uuid::Uuid,
    pub dry_run: bool,
    pub status: SessionStatus,
}

/// One propagated (or skipped/failed) operation inside a session
#[derive(Debug, Clone, PartialEq, Eq, Queryable, Selectable, Identifiable, Associations)]
#[diesel(table_name = schema::sync_operations)]
#[diesel(check_for_backend(Pg))]
#[diesel(belongs_to(SyncSession, foreign_key = session_id))]
pub struct SyncOperation {
    pub id: uuid::Uuid,
    pub session_id: uuid::Uuid,
    pub mapping_id: Option<uuid::Uuid>,
    pub kind: String,
    pub source: String,
    pub target: String,
    pub native_id: String,
    pub summary: Option<String>,
    pub success: bool,
    pub error_message: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = schema::sync_operations)]
pub struct NewSyncOperation<'a> {
    pub id: uuid::Uuid,
    pub session_id: uuid::Uuid,
    pub mapping_id: Option<uuid::Uuid>,
    pub kind: &'a str,
    pub source: &'a str,
    pub target: &'a str,
    pub native_id: &'a str,
    pub summary: Option<&'a str>,
    pub success: bool,
    pub error_message: Option<&'a str>,
}
