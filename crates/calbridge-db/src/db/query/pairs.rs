//! Queries over calendar pair rows.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::RunQueryDsl;

use crate::db::connection::DbConnection;
use crate::db::schema::calendar_pairs;
use crate::error::DbResult;
use crate::model::pair::{CalendarPair, NewCalendarPair};

/// ## Summary
/// Returns a query to select all pairs.
#[must_use]
pub fn all() -> calendar_pairs::BoxedQuery<'static, diesel::pg::Pg> {
    calendar_pairs::table.into_boxed()
}

/// ## Summary
/// Returns a query to find enabled pairs.
#[must_use]
pub fn enabled() -> calendar_pairs::BoxedQuery<'static, diesel::pg::Pg> {
    all().filter(calendar_pairs::enabled.eq(true))
}

/// ## Summary
/// Lists every enabled pair, oldest first so pass ordering is stable.
///
/// ## Errors
/// Returns an error when the query fails.
pub async fn list_enabled(conn: &mut DbConnection<'_>) -> DbResult<Vec<CalendarPair>> {
    Ok(enabled()
        .order(calendar_pairs::created_at.asc())
        .select(CalendarPair::as_select())
        .load(conn)
        .await?)
}

/// ## Summary
/// Lists all pairs regardless of enablement.
///
/// ## Errors
/// Returns an error when the query fails.
pub async fn list_all(conn: &mut DbConnection<'_>) -> DbResult<Vec<CalendarPair>> {
    Ok(all()
        .order(calendar_pairs::created_at.asc())
        .select(CalendarPair::as_select())
        .load(conn)
        .await?)
}

/// ## Summary
/// Finds the pair for a concrete calendar combination.
///
/// ## Errors
/// Returns an error when the query fails.
pub async fn find_by_calendars(
    conn: &mut DbConnection<'_>,
    google_calendar_id: &str,
    caldav_calendar_id: &str,
) -> DbResult<Option<CalendarPair>> {
    Ok(all()
        .filter(calendar_pairs::google_calendar_id.eq(google_calendar_id))
        .filter(calendar_pairs::caldav_calendar_id.eq(caldav_calendar_id))
        .select(CalendarPair::as_select())
        .first(conn)
        .await
        .optional()?)
}

/// ## Summary
/// Reloads one pair row by id.
///
/// ## Errors
/// Returns an error when the query fails or the row is gone.
pub async fn find_by_id(
    conn: &mut DbConnection<'_>,
    pair_id: uuid::Uuid,
) -> DbResult<CalendarPair> {
    Ok(all()
        .filter(calendar_pairs::id.eq(pair_id))
        .select(CalendarPair::as_select())
        .first(conn)
        .await?)
}

/// ## Summary
/// Inserts a new pair row (tokens null, so the first pass arms them).
///
/// ## Errors
/// Returns an error when the insert fails, including the unique violation
/// for a duplicate calendar combination.
pub async fn insert(
    conn: &mut DbConnection<'_>,
    new_pair: &NewCalendarPair<'_>,
) -> DbResult<CalendarPair> {
    Ok(diesel::insert_into(calendar_pairs::table)
        .values(new_pair)
        .returning(CalendarPair::as_returning())
        .get_result(conn)
        .await?)
}

/// ## Summary
/// Persists fresh tokens atomically with the last-synced timestamps; the
/// last write of a successful pair pass.
///
/// ## Errors
/// Returns an error when the update fails.
pub async fn persist_tokens(
    conn: &mut DbConnection<'_>,
    pair_id: uuid::Uuid,
    google_sync_token: Option<&str>,
    caldav_sync_token: Option<&str>,
    now: DateTime<Utc>,
) -> DbResult<()> {
    diesel::update(calendar_pairs::table.filter(calendar_pairs::id.eq(pair_id)))
        .set((
            calendar_pairs::google_sync_token.eq(google_sync_token),
            calendar_pairs::caldav_sync_token.eq(caldav_sync_token),
            calendar_pairs::google_last_synced_at.eq(now),
            calendar_pairs::caldav_last_synced_at.eq(now),
            calendar_pairs::updated_at.eq(now),
        ))
        .execute(conn)
        .await?;
    Ok(())
}

/// ## Summary
/// Clears the Google token after the server rejected it.
///
/// ## Errors
/// Returns an error when the update fails.
pub async fn clear_google_token(
    conn: &mut DbConnection<'_>,
    pair_id: uuid::Uuid,
    now: DateTime<Utc>,
) -> DbResult<()> {
    diesel::update(calendar_pairs::table.filter(calendar_pairs::id.eq(pair_id)))
        .set((
            calendar_pairs::google_sync_token.eq(None::<String>),
            calendar_pairs::google_last_synced_at.eq(None::<DateTime<Utc>>),
            calendar_pairs::updated_at.eq(now),
        ))
        .execute(conn)
        .await?;
    Ok(())
}

/// ## Summary
/// Clears the CalDAV token after the server rejected it.
///
/// ## Errors
/// Returns an error when the update fails.
pub async fn clear_caldav_token(
    conn: &mut DbConnection<'_>,
    pair_id: uuid::Uuid,
    now: DateTime<Utc>,
) -> DbResult<()> {
    diesel::update(calendar_pairs::table.filter(calendar_pairs::id.eq(pair_id)))
        .set((
            calendar_pairs::caldav_sync_token.eq(None::<String>),
            calendar_pairs::caldav_last_synced_at.eq(None::<DateTime<Utc>>),
            calendar_pairs::updated_at.eq(now),
        ))
        .execute(conn)
        .await?;
    Ok(())
}

/// ## Summary
/// Clears both tokens, forcing the next pass to run as a snapshot. Used by
/// race recovery after the post-processing probe confirms concurrent writes.
///
/// ## Errors
/// Returns an error when the update fails.
pub async fn clear_tokens(
    conn: &mut DbConnection<'_>,
    pair_id: uuid::Uuid,
    now: DateTime<Utc>,
) -> DbResult<()> {
    diesel::update(calendar_pairs::table.filter(calendar_pairs::id.eq(pair_id)))
        .set((
            calendar_pairs::google_sync_token.eq(None::<String>),
            calendar_pairs::caldav_sync_token.eq(None::<String>),
            calendar_pairs::updated_at.eq(now),
        ))
        .execute(conn)
        .await?;
    Ok(())
}

/// ## Summary
/// Stores the display names discovered for a pair's calendars.
///
/// ## Errors
/// Returns an error when the update fails.
pub async fn update_names(
    conn: &mut DbConnection<'_>,
    pair_id: uuid::Uuid,
    google_name: Option<&str>,
    caldav_name: Option<&str>,
    now: DateTime<Utc>,
) -> DbResult<()> {
    diesel::update(calendar_pairs::table.filter(calendar_pairs::id.eq(pair_id)))
        .set((
            calendar_pairs::google_calendar_name.eq(google_name),
            calendar_pairs::caldav_calendar_name.eq(caldav_name),
            calendar_pairs::updated_at.eq(now),
        ))
        .execute(conn)
        .await?;
    Ok(())
}
