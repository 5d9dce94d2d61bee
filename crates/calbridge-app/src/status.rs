//! Sync status reporting from the audit tables.

use calbridge_db::db::connection::DbPool;
use calbridge_db::db::query::audit;
use calbridge_db::error::DbError;

/// ## Summary
/// Prints the most recent sessions with their per-direction counters.
///
/// ## Errors
/// Returns an error when the audit tables cannot be read.
pub async fn print_recent_sessions(pool: &DbPool, limit: i64) -> anyhow::Result<()> {
    let mut conn = pool.get().await.map_err(DbError::from)?;
    let sessions = audit::recent_sessions(&mut conn, limit).await?;

    if sessions.is_empty() {
        println!("No sync sessions recorded yet.");
        return Ok(());
    }

    for session in sessions {
        let completed = session
            .completed_at
            .map_or_else(|| "-".to_string(), |t| t.to_rfc3339());
        println!(
            "{} started={} completed={} status={}{}",
            session.id,
            session.started_at.to_rfc3339(),
            completed,
            session.status,
            if session.dry_run { " (dry run)" } else { "" },
        );
        println!(
            "  google→caldav: {} created, {} updated, {} deleted, {} skipped",
            session.google_to_caldav_created,
            session.google_to_caldav_updated,
            session.google_to_caldav_deleted,
            session.google_to_caldav_skipped,
        );
        println!(
            "  caldav→google: {} created, {} updated, {} deleted, {} skipped",
            session.caldav_to_google_created,
            session.caldav_to_google_updated,
            session.caldav_to_google_deleted,
            session.caldav_to_google_skipped,
        );
        if let Some(error) = &session.error_message {
            println!("  error: {error}");
        }
    }
    Ok(())
}
