//! Short write transactions over pooled connections.

use diesel_async::{AsyncConnection, scoped_futures::ScopedBoxFuture};

use crate::db::connection::DbConnection;
use crate::error::{DbError, DbResult};

/// ## Summary
/// Runs `writes` inside one transaction. Multi-statement updates to a
/// single mapping row (an identity rebind plus the volatile-column
/// refresh) go through here so observers never see the row half-written.
///
/// ## Errors
/// Returns the closure's error, or errors raised while starting or
/// committing the transaction; either way the writes are rolled back.
pub async fn in_transaction<'borrow, 'pool, T, F>(
    conn: &'borrow mut DbConnection<'pool>,
    writes: F,
) -> DbResult<T>
where
    F: for<'r> FnOnce(&'r mut DbConnection<'pool>) -> ScopedBoxFuture<'borrow, 'r, DbResult<T>>
        + Send
        + 'borrow,
    T: Send + 'borrow,
{
    conn.transaction::<_, DbError, _>(writes).await
}
