pub mod memory_store;
pub mod sql_store;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::engine::types::*;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("A job with idempotency key '{0}' already exists")]
    DuplicateKey(String),

    #[error("Execution id {0} is already attached to another job")]
    DuplicateExecutionId(Uuid),

    #[error("Corrupt job record '{key}': {reason}")]
    Corrupt { key: String, reason: String },

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Encoding(#[from] serde_json::Error),
}

/// Durable job lifecycle records.
///
/// The `*_if_running` updates are the only way a job leaves `RUNNING`, and
/// each must be a single atomic conditional write: when several callers race
/// to finish the same job, exactly one of them observes `true`.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a RUNNING job with no execution id.
    async fn insert_pending(&self, key: &str) -> Result<Job, StoreError>;

    /// Record the remote execution id. Unknown keys are ignored.
    async fn attach_execution_id(&self, key: &str, execution_id: Uuid) -> Result<(), StoreError>;

    /// Move a RUNNING job to COMPLETED. Returns whether the transition applied.
    async fn complete_if_running(
        &self,
        key: &str,
        execution_id: Uuid,
        result: &serde_json::Value,
    ) -> Result<bool, StoreError>;

    /// Move a RUNNING job to FAILED. Returns whether the transition applied.
    async fn fail_if_running(
        &self,
        key: &str,
        execution_id: Uuid,
        failure: &FailureInfo,
    ) -> Result<bool, StoreError>;

    async fn find_by_key(&self, key: &str) -> Result<Option<Job>, StoreError>;

    async fn find_by_execution_id(&self, execution_id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Jobs in the given status, oldest first.
    async fn find_all_by_status(&self, status: JobStatus) -> Result<Vec<Job>, StoreError>;

    /// Delete every job. Administrative use only.
    async fn remove_all(&self) -> Result<u64, StoreError>;
}

/// Open the store named by a database URL. `memory` selects the in-process
/// store; anything else goes through sqlx.
pub async fn connect(database_url: &str) -> Result<Arc<dyn JobStore>, StoreError> {
    if database_url == "memory" {
        return Ok(Arc::new(memory_store::MemoryJobStore::new()));
    }
    Ok(Arc::new(sql_store::SqlJobStore::connect(database_url).await?))
}
