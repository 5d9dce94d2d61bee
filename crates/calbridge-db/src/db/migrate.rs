//! Embedded schema migrations.

use diesel::Connection;
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};

use crate::error::{DbError, DbResult};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

/// ## Summary
/// Applies any pending migrations over a short-lived synchronous connection.
///
/// ## Errors
/// Returns an error when connecting or applying a migration fails.
#[tracing::instrument(skip(database_url))]
pub fn run_migrations(database_url: &str) -> DbResult<()> {
    let mut conn = diesel::pg::PgConnection::establish(database_url)?;
    let applied = conn
        .run_pending_migrations(MIGRATIONS)
        .map_err(|e| DbError::MigrationError(e.to_string()))?;
    if !applied.is_empty() {
        tracing::info!(count = applied.len(), "Applied pending migrations");
    }
    Ok(())
}
