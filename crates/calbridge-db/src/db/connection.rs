//! Connection pooling for the sync state store.

use diesel_async::AsyncPgConnection;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::pooled_connection::bb8::{Pool, PooledConnection};

pub type DbPool = Pool<AsyncPgConnection>;
pub type DbConnection<'pool> = PooledConnection<'pool, AsyncPgConnection>;

/// ## Summary
/// Builds the shared connection pool. Store access happens in short
/// checkouts (one query or one transaction), so a small pool suffices.
///
/// ## Errors
/// Returns an error when the pool cannot be established against the
/// database URL.
pub async fn create_pool(database_url: &str, size: u32) -> anyhow::Result<DbPool> {
    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
    let pool = Pool::builder().max_size(size).build(manager).await?;
    tracing::debug!(pool_size = size, "Database pool ready");
    Ok(pool)
}
