use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::engine::types::{FailureInfo, JobStatus};
use crate::gateway::connection::RpcConnection;
use crate::gateway::{ExecutionHandle, FlowGateway, FlowOutcome, GatewayError};

const RPC: [&str; 2] = ["rpc", "v1"];

/// Failure kind reported when the engine has no outcome for a flow it started.
pub const OUTCOME_UNAVAILABLE: &str = "FlowOutcomeUnavailable";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StartFlowBody<'a> {
    client_id: &'a str,
    flow_type: &'a str,
    args: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FlowHandleBody {
    flow_id: Uuid,
}

#[derive(Deserialize)]
struct ProtocolVersionBody {
    version: i64,
}

#[derive(Deserialize)]
struct OutcomeBody {
    status: JobStatus,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<FailureInfo>,
}

fn path<'a>(tail: &[&'a str]) -> Vec<&'a str> {
    RPC.iter().copied().chain(tail.iter().copied()).collect()
}

/// `FlowGateway` speaking JSON over HTTP to the flow engine.
///
/// Outcomes are observed by a background task per execution that polls the
/// engine until the flow finishes or the connection is closed.
pub struct HttpFlowGateway {
    conn: Arc<RpcConnection>,
}

impl HttpFlowGateway {
    pub fn new(conn: Arc<RpcConnection>) -> Self {
        Self { conn }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, GatewayError> {
        if self.conn.is_closed() {
            return Err(GatewayError::Connection("connection closed".to_string()));
        }
        request
            .send()
            .await
            .map_err(|e| GatewayError::Connection(e.to_string()))
    }

    /// Spawns a detached polling task for `execution_id`. The task ends when an
    /// outcome arrives or when the owning `RpcConnection` is closed.
    fn watch(&self, execution_id: Uuid) -> ExecutionHandle {
        let (tx, rx) = oneshot::channel();
        let conn = self.conn.clone();

        tokio::spawn(async move {
            if let Some(outcome) = poll_outcome(&conn, execution_id).await {
                let _ = tx.send(outcome);
            }
        });

        ExecutionHandle::from_receiver(execution_id, rx)
    }
}

async fn expect_success(response: Response) -> Result<Response, GatewayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(GatewayError::Rejected(format!("{}: {}", status, body.trim())))
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, GatewayError> {
    response
        .json::<T>()
        .await
        .map_err(|e| GatewayError::Protocol(e.to_string()))
}

async fn poll_outcome(conn: &RpcConnection, execution_id: Uuid) -> Option<FlowOutcome> {
    let id = execution_id.to_string();
    let mut closed = conn.closed();

    loop {
        if *closed.borrow() {
            debug!(flow_id = %execution_id, "Connection closed, outcome watcher stopped");
            return None;
        }

        match fetch_outcome(conn, &id).await {
            Ok(Some(outcome)) => return Some(outcome),
            Ok(None) => {}
            Err(e) => warn!(flow_id = %execution_id, error = %e, "Outcome poll failed"),
        }

        tokio::select! {
            _ = tokio::time::sleep(conn.poll_interval()) => {}
            changed = closed.changed() => {
                if changed.is_err() {
                    return None;
                }
            }
        }
    }
}

async fn fetch_outcome(conn: &RpcConnection, id: &str) -> Result<Option<FlowOutcome>, GatewayError> {
    let response = conn
        .request(Method::GET, &path(&["flows", id, "outcome"]))
        .send()
        .await
        .map_err(|e| GatewayError::Connection(e.to_string()))?;

    if response.status() == StatusCode::NOT_FOUND {
        return Ok(Some(Err(FailureInfo::new(
            OUTCOME_UNAVAILABLE,
            Some(format!("Flow engine has no record of flow {}", id)),
        ))));
    }

    let body: OutcomeBody = decode(expect_success(response).await?).await?;
    Ok(match body.status {
        JobStatus::Running => None,
        JobStatus::Completed => Some(Ok(body.result.unwrap_or(serde_json::Value::Null))),
        JobStatus::Failed => Some(Err(body
            .error
            .unwrap_or_else(|| FailureInfo::new("FlowFailed", None)))),
    })
}

#[async_trait]
impl FlowGateway for HttpFlowGateway {
    async fn list_flow_types(&self) -> Result<Vec<String>, GatewayError> {
        let response = self
            .send(self.conn.request(Method::GET, &path(&["flows"])))
            .await?;
        decode(expect_success(response).await?).await
    }

    async fn protocol_version(&self) -> Result<i64, GatewayError> {
        let response = self
            .send(self.conn.request(Method::GET, &path(&["protocol-version"])))
            .await?;
        let body: ProtocolVersionBody = decode(expect_success(response).await?).await?;
        Ok(body.version)
    }

    async fn invoke(
        &self,
        idempotency_key: &str,
        flow_type: &str,
        args: Vec<serde_json::Value>,
    ) -> Result<ExecutionHandle, GatewayError> {
        let body = StartFlowBody {
            client_id: idempotency_key,
            flow_type,
            args,
        };
        let response = self
            .send(
                self.conn
                    .request(Method::POST, &path(&["flows", "start"]))
                    .json(&body),
            )
            .await?;
        let handle: FlowHandleBody = decode(expect_success(response).await?).await?;

        debug!(client_id = %idempotency_key, flow_id = %handle.flow_id, "Flow started on engine");
        Ok(self.watch(handle.flow_id))
    }

    async fn reattach(&self, idempotency_key: &str) -> Result<Option<ExecutionHandle>, GatewayError> {
        let response = self
            .send(
                self.conn
                    .request(Method::GET, &path(&["clients", idempotency_key])),
            )
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let handle: FlowHandleBody = decode(expect_success(response).await?).await?;
        Ok(Some(self.watch(handle.flow_id)))
    }

    async fn cancel(&self, execution_id: Uuid) -> Result<bool, GatewayError> {
        let id = execution_id.to_string();
        let response = self
            .send(self.conn.request(Method::POST, &path(&["flows", &id, "kill"])))
            .await?;
        decode(expect_success(response).await?).await
    }

    async fn forget(&self, idempotency_key: &str) -> Result<(), GatewayError> {
        let response = self
            .send(
                self.conn
                    .request(Method::DELETE, &path(&["clients", idempotency_key])),
            )
            .await?;
        let removed: bool = decode(expect_success(response).await?).await?;
        debug!(client_id = %idempotency_key, removed, "Released engine client id");
        Ok(())
    }
}
