// ABOUTME: Upload cycle for locally-queued writes, one transaction at a time
// ABOUTME: Classifies server errors: a closed fatal set is discarded, the rest retried

use thiserror::Error;

use crate::db::SyncDatabase;
use crate::error::SyncError;
use crate::storage::crud::CrudTransaction;

/// Failure while uploading local writes.
///
/// The first three variants form the closed set of server-declared
/// error classes that retrying can never resolve; the connector discards
/// the failing transaction for them instead of spinning forever.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("data exception: {message}")]
    DataException { message: String },

    #[error("integrity constraint violation: {message}")]
    IntegrityConstraintViolation { message: String },

    #[error("insufficient privilege: {message}")]
    InsufficientPrivilege { message: String },

    #[error("network error: {message}")]
    Network { message: String },

    #[error("service error: {message}")]
    Service { message: String },

    #[error(transparent)]
    Storage(#[from] SyncError),
}

impl UploadError {
    /// Classify a server-reported SQLSTATE-style code. Class 22 is a
    /// data exception, class 23 an integrity constraint violation, and
    /// 42501 insufficient privilege; everything else is treated as a
    /// transient service failure.
    pub fn from_error_code(code: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        if code.starts_with("22") {
            UploadError::DataException { message }
        } else if code.starts_with("23") {
            UploadError::IntegrityConstraintViolation { message }
        } else if code == "42501" {
            UploadError::InsufficientPrivilege { message }
        } else {
            UploadError::Service { message }
        }
    }

    /// Whether the caller should retry the whole upload after a delay.
    pub fn retryable(&self) -> bool {
        !matches!(
            self,
            UploadError::DataException { .. }
                | UploadError::IntegrityConstraintViolation { .. }
                | UploadError::InsufficientPrivilege { .. }
        )
    }
}

/// The application-provided bridge to the remote service. Out of scope
/// itself; this is its contract with the engine.
pub trait BackendConnector: Send + Sync {
    /// Upload one local transaction. On success, optionally return the
    /// server's write-checkpoint token for it.
    fn upload_transaction(
        &self,
        transaction: &CrudTransaction,
    ) -> impl std::future::Future<Output = Result<Option<i64>, UploadError>> + Send;
}

/// Outcome of one upload cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadStats {
    pub transactions_uploaded: usize,
    pub entries_uploaded: usize,
    pub transactions_discarded: usize,
    /// Messages of discarded-transaction errors, kept for observability.
    pub errors: Vec<String>,
}

/// Drain the CRUD queue through the connector, earliest transaction
/// first.
///
/// Retryable failures propagate with no state mutated, so the caller's
/// retry loop re-uploads from the same queue position. Fatal failures
/// discard exactly the failing transaction (completing it without
/// upload) and the cycle continues. At most one cycle runs per database
/// handle; a second concurrent call returns immediately.
pub async fn upload_pending_writes<C: BackendConnector>(
    db: &SyncDatabase,
    connector: &C,
) -> Result<UploadStats, UploadError> {
    let Some(_guard) = db.try_begin_upload() else {
        tracing::debug!("upload cycle already in flight; skipping");
        return Ok(UploadStats::default());
    };

    let mut stats = UploadStats::default();
    db.set_uploading(true);
    let result = run_cycle(db, connector, &mut stats).await;
    db.set_uploading(false);
    result.map(|_| stats)
}

async fn run_cycle<C: BackendConnector>(
    db: &SyncDatabase,
    connector: &C,
    stats: &mut UploadStats,
) -> Result<(), UploadError> {
    while let Some(transaction) = db.get_next_crud_transaction().await? {
        match connector.upload_transaction(&transaction).await {
            Ok(write_checkpoint) => {
                db.complete_crud(transaction.last_op_id(), write_checkpoint)
                    .await?;
                stats.transactions_uploaded += 1;
                stats.entries_uploaded += transaction.entries.len();
            }
            Err(err) if err.retryable() => {
                tracing::warn!("upload failed, leaving queue for retry: {err:?}");
                return Err(err);
            }
            Err(err) => {
                // Retrying can never succeed; accept the local data loss
                // and surface the error.
                tracing::error!(
                    "discarding transaction {:?} ({} entries) after unrecoverable upload error: {err:?}",
                    transaction.tx_id,
                    transaction.entries.len(),
                );
                db.complete_crud(transaction.last_op_id(), None).await?;
                stats.transactions_discarded += 1;
                stats.errors.push(err.to_string());
            }
        }
    }
    Ok(())
}
