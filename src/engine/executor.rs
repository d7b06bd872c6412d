use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::types::*;
use crate::error::FlowError;
use crate::flows::{FlowRegistry, bind};
use crate::gateway::{ExecutionHandle, FlowGateway, FlowOutcome};
use crate::storage::JobStore;

/// Counts from one startup reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Jobs whose execution was found again and is being watched.
    pub reattached: usize,
    /// Jobs the engine no longer knows about. They stay RUNNING.
    pub unknown: usize,
    /// Jobs whose re-attach call failed.
    pub failed: usize,
}

/// Starts flows on the remote engine and keeps the job store in step with
/// their outcomes.
pub struct FlowExecutor {
    registry: Arc<FlowRegistry>,
    store: Arc<dyn JobStore>,
    gateway: Arc<dyn FlowGateway>,
}

impl FlowExecutor {
    pub fn new(
        registry: Arc<FlowRegistry>,
        store: Arc<dyn JobStore>,
        gateway: Arc<dyn FlowGateway>,
    ) -> Self {
        Self {
            registry,
            store,
            gateway,
        }
    }

    pub fn registry(&self) -> &Arc<FlowRegistry> {
        &self.registry
    }

    /// Flow types the remote engine reports as runnable.
    pub async fn registered_flows(&self) -> Result<Vec<String>, FlowError> {
        Ok(self.gateway.list_flow_types().await?)
    }

    pub async fn protocol_version(&self) -> Result<i64, FlowError> {
        Ok(self.gateway.protocol_version().await?)
    }

    /// Start `flow_name` under `idempotency_key` and return as soon as the
    /// engine has assigned an execution id. The outcome is recorded later by a
    /// background watcher.
    pub async fn start_flow(
        &self,
        idempotency_key: &str,
        flow_name: &str,
        parameters: &Map<String, Value>,
    ) -> Result<StartedFlow, FlowError> {
        let flow = self.registry.resolve(flow_name).await?;
        let args = bind(&flow, parameters)?;

        self.store.insert_pending(idempotency_key).await?;
        info!(client_id = %idempotency_key, flow = %flow_name, "Starting flow");

        let handle = match self.gateway.invoke(idempotency_key, &flow.name, args).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(
                    client_id = %idempotency_key,
                    error = %e,
                    "Flow invocation failed, job left RUNNING without an execution id"
                );
                return Err(e.into());
            }
        };

        let execution_id = handle.execution_id();
        self.watch(idempotency_key.to_string(), handle);
        self.store
            .attach_execution_id(idempotency_key, execution_id)
            .await?;

        info!(client_id = %idempotency_key, flow_id = %execution_id, "Flow started");
        Ok(StartedFlow {
            idempotency_key: idempotency_key.to_string(),
            execution_id,
        })
    }

    /// Re-attach to every job left RUNNING by a previous process. A failure on
    /// one job is logged and counted; it never stops the pass.
    pub async fn reconcile(&self) -> Result<ReconcileReport, FlowError> {
        let running = self.store.find_all_by_status(JobStatus::Running).await?;
        let mut report = ReconcileReport::default();

        info!(jobs = running.len(), "Reconciling running jobs");

        for job in running {
            let key = job.idempotency_key;
            match self.gateway.reattach(&key).await {
                Ok(Some(handle)) => {
                    debug!(client_id = %key, flow_id = %handle.execution_id(), "Re-attached to flow");
                    self.watch(key, handle);
                    report.reattached += 1;
                }
                Ok(None) => {
                    warn!(client_id = %key, "Engine has no record of job, leaving it RUNNING");
                    report.unknown += 1;
                }
                Err(e) => {
                    warn!(client_id = %key, error = %e, "Re-attach failed");
                    report.failed += 1;
                }
            }
        }

        info!(
            reattached = report.reattached,
            unknown = report.unknown,
            failed = report.failed,
            "Reconciliation complete"
        );
        Ok(report)
    }

    fn watch(&self, idempotency_key: String, handle: ExecutionHandle) {
        let store = self.store.clone();
        let gateway = self.gateway.clone();
        let (execution_id, outcome) = handle.into_parts();

        tokio::spawn(async move {
            match outcome.await {
                Some(outcome) => {
                    record_and_forget(
                        store.as_ref(),
                        gateway.as_ref(),
                        &idempotency_key,
                        execution_id,
                        outcome,
                    )
                    .await
                }
                None => debug!(
                    client_id = %idempotency_key,
                    flow_id = %execution_id,
                    "No outcome delivered, job left RUNNING"
                ),
            }
        });
    }
}

/// Parse the `parametersInJson` string a client supplies into a parameter map.
pub fn parse_parameters(raw: &str) -> Result<Map<String, Value>, FlowError> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(FlowError::MalformedParameters(format!(
            "expected an object, got {}",
            json_type(&other)
        ))),
        Err(e) => Err(FlowError::MalformedParameters(e.to_string())),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Write a terminal outcome, then release the engine's record of the key.
/// Only the write that actually moved the job out of RUNNING issues the forget.
async fn record_and_forget(
    store: &dyn JobStore,
    gateway: &dyn FlowGateway,
    key: &str,
    execution_id: Uuid,
    outcome: FlowOutcome,
) {
    let written = match &outcome {
        Ok(result) => store.complete_if_running(key, execution_id, result).await,
        Err(failure) => store.fail_if_running(key, execution_id, failure).await,
    };

    match written {
        Ok(true) => {
            info!(
                client_id = %key,
                flow_id = %execution_id,
                success = outcome.is_ok(),
                "Recorded flow outcome"
            );
            if let Err(e) = gateway.forget(key).await {
                warn!(client_id = %key, error = %e, "Failed to release engine client id");
            }
        }
        Ok(false) => debug!(client_id = %key, "Job already finished, outcome ignored"),
        Err(e) => error!(
            client_id = %key,
            flow_id = %execution_id,
            error = %e,
            "Failed to record flow outcome"
        ),
    }
}
