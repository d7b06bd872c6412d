use std::sync::Arc;

use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::engine::types::*;
use crate::error::FlowError;
use crate::gateway::FlowGateway;
use crate::storage::JobStore;

/// Wire view of a job's outcome.
///
/// `result_json` is the stored JSON text of the flow's return value, so it
/// serializes as a string containing JSON.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeResponse {
    pub status: JobStatus,
    pub result_json: Option<String>,
    pub exception_digest: Option<FailureInfo>,
}

impl From<&Job> for OutcomeResponse {
    fn from(job: &Job) -> Self {
        Self {
            status: job.status(),
            result_json: job.result_json().map(str::to_string),
            exception_digest: job.failure().cloned(),
        }
    }
}

/// Read side of job tracking, plus the engine kill switch.
pub struct FlowOutcomeService {
    store: Arc<dyn JobStore>,
    gateway: Arc<dyn FlowGateway>,
}

impl FlowOutcomeService {
    pub fn new(store: Arc<dyn JobStore>, gateway: Arc<dyn FlowGateway>) -> Self {
        Self { store, gateway }
    }

    pub async fn get_by_key(&self, idempotency_key: &str) -> Result<OutcomeResponse, FlowError> {
        self.store
            .find_by_key(idempotency_key)
            .await?
            .map(|job| OutcomeResponse::from(&job))
            .ok_or_else(|| FlowError::NotFound(format!("client id {}", idempotency_key)))
    }

    pub async fn get_by_execution_id(&self, execution_id: Uuid) -> Result<OutcomeResponse, FlowError> {
        self.store
            .find_by_execution_id(execution_id)
            .await?
            .map(|job| OutcomeResponse::from(&job))
            .ok_or_else(|| FlowError::NotFound(format!("flow id {}", execution_id)))
    }

    /// Ask the engine to kill a flow. The job record is untouched; whatever
    /// the engine reports afterwards arrives through the outcome watcher.
    pub async fn kill_flow(&self, execution_id: Uuid) -> Result<bool, FlowError> {
        let killed = self.gateway.cancel(execution_id).await?;
        info!(flow_id = %execution_id, killed, "Kill requested");
        Ok(killed)
    }

    /// Execution ids of jobs still RUNNING, oldest first.
    pub async fn list_active(&self) -> Result<Vec<Uuid>, FlowError> {
        let running = self.store.find_all_by_status(JobStatus::Running).await?;
        Ok(running.into_iter().filter_map(|job| job.execution_id).collect())
    }
}
