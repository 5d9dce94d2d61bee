//! Session, operation, and conflict audit writes.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::RunQueryDsl;

use crate::db::connection::DbConnection;
use crate::db::enums::SessionStatus;
use crate::db::schema::{conflicts, sync_operations, sync_sessions};
use crate::error::DbResult;
use crate::model::conflict::NewConflict;
use crate::model::session::{NewSyncOperation, NewSyncSession, SyncOperation, SyncSession};

/// Final per-direction counters written when a session completes
#[derive(Debug, Clone, Copy, Default, AsChangeset)]
#[diesel(table_name = sync_sessions)]
pub struct SessionCounters {
    pub google_to_caldav_created: i32,
    pub google_to_caldav_updated: i32,
    pub google_to_caldav_deleted: i32,
    pub google_to_caldav_skipped: i32,
    pub caldav_to_google_created: i32,
    pub caldav_to_google_updated: i32,
    pub caldav_to_google_deleted: i32,
    pub caldav_to_google_skipped: i32,
}

/// ## Summary
/// Opens a new audit session row in `running` state.
///
/// ## Errors
/// Returns an error when the insert fails.
pub async fn create_session(
    conn: &mut DbConnection<'_>,
    new_session: &NewSyncSession,
) -> DbResult<SyncSession> {
    Ok(diesel::insert_into(sync_sessions::table)
        .values(new_session)
        .returning(SyncSession::as_returning())
        .get_result(conn)
        .await?)
}

/// ## Summary
/// Closes a session with its outcome, final counters, and optional error.
///
/// ## Errors
/// Returns an error when the update fails.
pub async fn complete_session(
    conn: &mut DbConnection<'_>,
    session_id: uuid::Uuid,
    status: SessionStatus,
    error_message: Option<&str>,
    counters: SessionCounters,
    now: DateTime<Utc>,
) -> DbResult<()> {
    diesel::update(sync_sessions::table.filter(sync_sessions::id.eq(session_id)))
        .set((
            sync_sessions::status.eq(status),
            sync_sessions::error_message.eq(error_message),
            sync_sessions::completed_at.eq(now),
            counters,
        ))
        .execute(conn)
        .await?;
    Ok(())
}

/// ## Summary
/// Appends one operation to the session audit.
///
/// ## Errors
/// Returns an error when the insert fails.
pub async fn insert_operation(
    conn: &mut DbConnection<'_>,
    operation: &NewSyncOperation<'_>,
) -> DbResult<()> {
    diesel::insert_into(sync_operations::table)
        .values(operation)
        .execute(conn)
        .await?;
    Ok(())
}

/// ## Summary
/// Appends a conflict record with both sides' payloads.
///
/// ## Errors
/// Returns an error when the insert fails.
pub async fn insert_conflict(
    conn: &mut DbConnection<'_>,
    conflict: &NewConflict<'_>,
) -> DbResult<()> {
    diesel::insert_into(conflicts::table)
        .values(conflict)
        .execute(conn)
        .await?;
    Ok(())
}

/// ## Summary
/// Loads the most recent sessions for status reporting.
///
/// ## Errors
/// Returns an error when the query fails.
pub async fn recent_sessions(
    conn: &mut DbConnection<'_>,
    limit: i64,
) -> DbResult<Vec<SyncSession>> {
    Ok(sync_sessions::table
        .order(sync_sessions::started_at.desc())
        .limit(limit)
        .select(SyncSession::as_select())
        .load(conn)
        .await?)
}

/// ## Summary
/// Loads a session's operations in timestamp order.
///
/// ## Errors
/// Returns an error when the query fails.
pub async fn operations_for_session(
    conn: &mut DbConnection<'_>,
    session_id: uuid::Uuid,
) -> DbResult<Vec<SyncOperation>> {
    Ok(sync_operations::table
        .filter(sync_operations::session_id.eq(session_id))
        .order(sync_operations::timestamp.asc())
        .select(SyncOperation::as_select())
        .load(conn)
        .await?)
}
