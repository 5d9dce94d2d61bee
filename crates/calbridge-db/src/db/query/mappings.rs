//! Queries over event mapping rows.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::RunQueryDsl;

use crate::db::connection::DbConnection;
use crate::db::enums::MappingStatus;
use crate::db::schema::event_mappings;
use crate::error::DbResult;
use crate::model::mapping::{EventMapping, NewEventMapping};

/// ## Summary
/// Returns a query to select all mappings.
#[must_use]
pub fn all() -> event_mappings::BoxedQuery<'static, diesel::pg::Pg> {
    event_mappings::table.into_boxed()
}

/// ## Summary
/// Returns a query over one pair's mappings.
#[must_use]
pub fn for_pair(pair_id: uuid::Uuid) -> event_mappings::BoxedQuery<'static, diesel::pg::Pg> {
    all().filter(event_mappings::pair_id.eq(pair_id))
}

/// ## Summary
/// Loads every mapping of a pair; the engine re-reads these per pass.
///
/// ## Errors
/// Returns an error when the query fails.
pub async fn load_for_pair(
    conn: &mut DbConnection<'_>,
    pair_id: uuid::Uuid,
) -> DbResult<Vec<EventMapping>> {
    Ok(for_pair(pair_id)
        .order(event_mappings::created_at.asc())
        .select(EventMapping::as_select())
        .load(conn)
        .await?)
}

/// ## Summary
/// Finds a mapping by its Google-side native id.
///
/// ## Errors
/// Returns an error when the query fails.
pub async fn find_by_google_event(
    conn: &mut DbConnection<'_>,
    pair_id: uuid::Uuid,
    google_event_id: &str,
) -> DbResult<Option<EventMapping>> {
    Ok(for_pair(pair_id)
        .filter(event_mappings::google_event_id.eq(google_event_id))
        .select(EventMapping::as_select())
        .first(conn)
        .await
        .optional()?)
}

/// ## Summary
/// Finds a mapping by its CalDAV-side native id.
///
/// ## Errors
/// Returns an error when the query fails.
pub async fn find_by_caldav_event(
    conn: &mut DbConnection<'_>,
    pair_id: uuid::Uuid,
    caldav_event_id: &str,
) -> DbResult<Option<EventMapping>> {
    Ok(for_pair(pair_id)
        .filter(event_mappings::caldav_event_id.eq(caldav_event_id))
        .select(EventMapping::as_select())
        .first(conn)
        .await
        .optional()?)
}

/// ## Summary
/// Finds a mapping by canonical UID, the preferred deduplication key.
///
/// ## Errors
/// Returns an error when the query fails.
pub async fn find_by_canonical_uid(
    conn: &mut DbConnection<'_>,
    pair_id: uuid::Uuid,
    canonical_uid: &str,
) -> DbResult<Option<EventMapping>> {
    Ok(for_pair(pair_id)
        .filter(event_mappings::canonical_uid.eq(canonical_uid))
        .select(EventMapping::as_select())
        .first(conn)
        .await
        .optional()?)
}

/// ## Summary
/// Inserts a mapping with its full identity columns in one statement.
///
/// ## Errors
/// Returns an error when the insert fails, including unique violations on
/// `(pair_id, google_event_id)` / `(pair_id, caldav_event_id)`.
pub async fn insert(
    conn: &mut DbConnection<'_>,
    new_mapping: &NewEventMapping<'_>,
) -> DbResult<EventMapping> {
    Ok(diesel::insert_into(event_mappings::table)
        .values(new_mapping)
        .returning(EventMapping::as_returning())
        .get_result(conn)
        .await?)
}

/// Post-propagation refresh of the volatile columns on a mapping
#[derive(Debug, Clone, AsChangeset)]
#[diesel(table_name = event_mappings)]
pub struct PropagationRefresh<'a> {
    pub content_hash: &'a str,
    pub google_etag: Option<&'a str>,
    pub caldav_etag: Option<&'a str>,
    pub google_sequence: Option<i32>,
    pub caldav_sequence: Option<i32>,
    pub sync_direction: Option<&'a str>,
    pub updated_at: DateTime<Utc>,
    pub last_synced_at: DateTime<Utc>,
}

/// ## Summary
/// Refreshes a mapping after a successful propagation (new hash, version
/// tags, direction, timestamps) in a single statement.
///
/// ## Errors
/// Returns an error when the update fails.
pub async fn refresh_propagation(
    conn: &mut DbConnection<'_>,
    mapping_id: uuid::Uuid,
    refresh: &PropagationRefresh<'_>,
) -> DbResult<()> {
    diesel::update(event_mappings::table.filter(event_mappings::id.eq(mapping_id)))
        .set(refresh)
        .execute(conn)
        .await?;
    Ok(())
}

/// ## Summary
/// Rebinds the Google side of a mapping after the target event was
/// recreated (the previous id returned not-found).
///
/// ## Errors
/// Returns an error when the update fails.
#[expect(clippy::too_many_arguments)]
pub async fn rebind_google_identity(
    conn: &mut DbConnection<'_>,
    mapping_id: uuid::Uuid,
    google_event_id: &str,
    google_ical_uid: Option<&str>,
    google_self_link: Option<&str>,
    google_etag: Option<&str>,
    google_sequence: i32,
    now: DateTime<Utc>,
) -> DbResult<()> {
    diesel::update(event_mappings::table.filter(event_mappings::id.eq(mapping_id)))
        .set((
            event_mappings::google_event_id.eq(google_event_id),
            event_mappings::google_ical_uid.eq(google_ical_uid),
            event_mappings::google_self_link.eq(google_self_link),
            event_mappings::google_etag.eq(google_etag),
            event_mappings::google_sequence.eq(google_sequence),
            event_mappings::updated_at.eq(now),
        ))
        .execute(conn)
        .await?;
    Ok(())
}

/// ## Summary
/// Rebinds the CalDAV side of a mapping after the target resource was
/// recreated (the previous href returned not-found).
///
/// ## Errors
/// Returns an error when the update fails.
#[expect(clippy::too_many_arguments)]
pub async fn rebind_caldav_identity(
    conn: &mut DbConnection<'_>,
    mapping_id: uuid::Uuid,
    caldav_event_id: &str,
    caldav_uid: Option<&str>,
    caldav_resource_href: Option<&str>,
    caldav_etag: Option<&str>,
    caldav_sequence: i32,
    now: DateTime<Utc>,
) -> DbResult<()> {
    diesel::update(event_mappings::table.filter(event_mappings::id.eq(mapping_id)))
        .set((
            event_mappings::caldav_event_id.eq(caldav_event_id),
            event_mappings::caldav_uid.eq(caldav_uid),
            event_mappings::caldav_resource_href.eq(caldav_resource_href),
            event_mappings::caldav_etag.eq(caldav_etag),
            event_mappings::caldav_sequence.eq(caldav_sequence),
            event_mappings::updated_at.eq(now),
        ))
        .execute(conn)
        .await?;
    Ok(())
}

/// ## Summary
/// Moves a mapping into a new lifecycle state.
///
/// ## Errors
/// Returns an error when the update fails.
pub async fn set_status(
    conn: &mut DbConnection<'_>,
    mapping_id: uuid::Uuid,
    status: MappingStatus,
    now: DateTime<Utc>,
) -> DbResult<()> {
    diesel::update(event_mappings::table.filter(event_mappings::id.eq(mapping_id)))
        .set((
            event_mappings::status.eq(status),
            event_mappings::updated_at.eq(now),
        ))
        .execute(conn)
        .await?;
    Ok(())
}
