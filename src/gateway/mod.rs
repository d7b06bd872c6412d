pub mod connection;
pub mod http;

use std::future::Future;

use async_trait::async_trait;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::engine::types::FailureInfo;

pub use connection::{RpcConnection, RpcSettings};
pub use http::HttpFlowGateway;

/// Terminal result of a remote flow: its return value, or a failure digest.
pub type FlowOutcome = Result<serde_json::Value, FailureInfo>;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// The engine could not be reached.
    #[error("RPC connection to flow engine failed: {0}")]
    Connection(String),

    #[error("Flow engine rejected the request: {0}")]
    Rejected(String),

    #[error("Unexpected response from flow engine: {0}")]
    Protocol(String),
}

/// A started (or re-attached) remote execution.
///
/// The outcome future resolves exactly once. It yields `None` when the
/// connection goes away before the engine reports an outcome.
pub struct ExecutionHandle {
    execution_id: Uuid,
    outcome: BoxFuture<'static, Option<FlowOutcome>>,
}

impl ExecutionHandle {
    pub fn new<F>(execution_id: Uuid, outcome: F) -> Self
    where
        F: Future<Output = Option<FlowOutcome>> + Send + 'static,
    {
        Self {
            execution_id,
            outcome: outcome.boxed(),
        }
    }

    /// Handle whose outcome is delivered through a oneshot channel. Dropping
    /// the sender resolves the outcome to `None`.
    pub fn from_receiver(execution_id: Uuid, receiver: oneshot::Receiver<FlowOutcome>) -> Self {
        Self::new(execution_id, async move { receiver.await.ok() })
    }

    /// Handle for an execution that has already finished.
    pub fn ready(execution_id: Uuid, outcome: FlowOutcome) -> Self {
        Self::new(execution_id, async move { Some(outcome) })
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    pub fn into_parts(self) -> (Uuid, BoxFuture<'static, Option<FlowOutcome>>) {
        (self.execution_id, self.outcome)
    }
}

impl std::fmt::Debug for ExecutionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionHandle")
            .field("execution_id", &self.execution_id)
            .finish_non_exhaustive()
    }
}

/// RPC surface of the remote flow engine.
#[async_trait]
pub trait FlowGateway: Send + Sync {
    /// Flow types the engine can run.
    async fn list_flow_types(&self) -> Result<Vec<String>, GatewayError>;

    async fn protocol_version(&self) -> Result<i64, GatewayError>;

    /// Start a flow under the client's idempotency key with positional arguments.
    async fn invoke(
        &self,
        idempotency_key: &str,
        flow_type: &str,
        args: Vec<serde_json::Value>,
    ) -> Result<ExecutionHandle, GatewayError>;

    /// Recover the handle of a flow started earlier under `idempotency_key`.
    /// `None` when the engine no longer tracks that key.
    async fn reattach(&self, idempotency_key: &str) -> Result<Option<ExecutionHandle>, GatewayError>;

    /// Best-effort kill. Returns whether the engine cancelled the flow.
    async fn cancel(&self, execution_id: Uuid) -> Result<bool, GatewayError>;

    /// Release the engine's bookkeeping for a key whose outcome has been
    /// durably recorded.
    async fn forget(&self, idempotency_key: &str) -> Result<(), GatewayError>;
}
