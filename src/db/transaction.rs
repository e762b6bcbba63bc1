/*!
 * Transaction helper
 *
 * Runs a closure inside a database transaction with commit on `Ok` and
 * rollback on `Err`, keeping the service error intact.
 */

use crate::errors::ServiceError;
use metrics::counter;
use sea_orm::{DatabaseConnection, DatabaseTransaction, TransactionError, TransactionTrait};
use std::future::Future;
use std::pin::Pin;
use tracing::warn;

/// Type alias for boxed future used in transactions
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Execute a function within a database transaction
///
/// # Example
///
/// ```rust,ignore
/// let report = with_transaction(&db, |txn| {
///     Box::pin(async move {
///         let totals = aggregate(txn, event_id).await?;
///         upsert_snapshot(txn, totals).await
///     })
/// })
/// .await?;
/// ```
pub async fn with_transaction<F, T>(db: &DatabaseConnection, f: F) -> Result<T, ServiceError>
where
    F: for<'c> FnOnce(&'c DatabaseTransaction) -> BoxFuture<'c, Result<T, ServiceError>> + Send,
    T: Send,
{
    db.transaction::<F, T, ServiceError>(f)
        .await
        .map_err(|e| {
            counter!("eventpay_db.transaction.rolled_back", 1);
            match e {
                TransactionError::Connection(db_err) => {
                    warn!(error = %db_err, "transaction failed at connection level");
                    ServiceError::DatabaseError(db_err)
                }
                TransactionError::Transaction(err) => err,
            }
        })
}
