//! Shared fixtures: a scriptable in-process `FlowGateway` and polling helpers.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

use flowgate::engine::types::{Job, JobStatus};
use flowgate::flows::{FlowDescriptor, FlowRegistry, ParamSpec, ParamType};
use flowgate::gateway::{ExecutionHandle, FlowGateway, FlowOutcome, GatewayError};
use flowgate::storage::JobStore;

/// What `reattach` does for a given key.
pub enum Reattach {
    /// Hand back a handle whose outcome is already known.
    Finished(Uuid, FlowOutcome),
    /// Hand back a handle whose outcome the test delivers later with `finish`.
    Pending(Uuid),
    Unknown,
    Fail,
}

#[derive(Debug, Clone)]
pub struct Invocation {
    pub key: String,
    pub flow_type: String,
    pub args: Vec<Value>,
}

#[derive(Default)]
pub struct FakeGateway {
    pub flow_types: Vec<String>,
    pub fail_invoke: Mutex<Option<GatewayError>>,
    pub fail_forget: Mutex<bool>,
    pub cancel_result: Mutex<bool>,
    pub invocations: Mutex<Vec<Invocation>>,
    pub forgotten: Mutex<Vec<String>>,
    pub cancelled: Mutex<Vec<Uuid>>,
    reattach: Mutex<HashMap<String, Reattach>>,
    pending: Mutex<HashMap<String, oneshot::Sender<FlowOutcome>>>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self {
            flow_types: vec!["com.example.flows.EchoFlow".to_string()],
            ..Default::default()
        }
    }

    pub fn script_reattach(&self, key: &str, behaviour: Reattach) {
        self.reattach
            .lock()
            .unwrap()
            .insert(key.to_string(), behaviour);
    }

    pub fn fail_next_invoke(&self, error: GatewayError) {
        *self.fail_invoke.lock().unwrap() = Some(error);
    }

    /// Deliver the outcome of a flow started (or re-attached) under `key`.
    pub fn finish(&self, key: &str, outcome: FlowOutcome) {
        let sender = self
            .pending
            .lock()
            .unwrap()
            .remove(key)
            .expect("no pending flow for key");
        sender.send(outcome).expect("outcome receiver dropped");
    }

    /// Drop the outcome channel, as a closed connection would.
    pub fn disconnect(&self, key: &str) {
        self.pending.lock().unwrap().remove(key);
    }

    pub fn forgotten(&self) -> Vec<String> {
        self.forgotten.lock().unwrap().clone()
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().unwrap().clone()
    }

    fn pending_handle(&self, key: &str, execution_id: Uuid) -> ExecutionHandle {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(key.to_string(), tx);
        ExecutionHandle::from_receiver(execution_id, rx)
    }
}

#[async_trait]
impl FlowGateway for FakeGateway {
    async fn list_flow_types(&self) -> Result<Vec<String>, GatewayError> {
        Ok(self.flow_types.clone())
    }

    async fn protocol_version(&self) -> Result<i64, GatewayError> {
        Ok(4)
    }

    async fn invoke(
        &self,
        idempotency_key: &str,
        flow_type: &str,
        args: Vec<Value>,
    ) -> Result<ExecutionHandle, GatewayError> {
        if let Some(err) = self.fail_invoke.lock().unwrap().take() {
            return Err(err);
        }
        self.invocations.lock().unwrap().push(Invocation {
            key: idempotency_key.to_string(),
            flow_type: flow_type.to_string(),
            args,
        });
        Ok(self.pending_handle(idempotency_key, Uuid::new_v4()))
    }

    async fn reattach(&self, idempotency_key: &str) -> Result<Option<ExecutionHandle>, GatewayError> {
        let scripted = self.reattach.lock().unwrap().remove(idempotency_key);
        match scripted {
            Some(Reattach::Finished(id, outcome)) => Ok(Some(ExecutionHandle::ready(id, outcome))),
            Some(Reattach::Pending(id)) => Ok(Some(self.pending_handle(idempotency_key, id))),
            Some(Reattach::Fail) => Err(GatewayError::Connection("engine unreachable".to_string())),
            Some(Reattach::Unknown) | None => Ok(None),
        }
    }

    async fn cancel(&self, execution_id: Uuid) -> Result<bool, GatewayError> {
        self.cancelled.lock().unwrap().push(execution_id);
        Ok(*self.cancel_result.lock().unwrap())
    }

    async fn forget(&self, idempotency_key: &str) -> Result<(), GatewayError> {
        self.forgotten
            .lock()
            .unwrap()
            .push(idempotency_key.to_string());
        if *self.fail_forget.lock().unwrap() {
            return Err(GatewayError::Connection("engine unreachable".to_string()));
        }
        Ok(())
    }
}

/// Registry with the flow types the tests start.
pub fn test_registry() -> FlowRegistry {
    let mut registry = FlowRegistry::new();
    registry.register(FlowDescriptor::new(
        "com.example.flows.EchoFlow",
        vec![
            ParamSpec::new("a", ParamType::String),
            ParamSpec::new("b", ParamType::Int),
            ParamSpec::new("c", ParamType::String),
        ],
    ));
    registry.register(FlowDescriptor::new("com.example.flows.PingFlow", vec![]));
    registry
}

/// Poll the store until the job reaches `status`, or panic after two seconds.
pub async fn wait_for_status(store: &dyn JobStore, key: &str, status: JobStatus) -> Job {
    for _ in 0..200 {
        if let Some(job) = store.find_by_key(key).await.unwrap()
            && job.status() == status
        {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job '{}' never reached {}", key, status);
}

/// Poll until the gateway has been asked to forget `key`.
pub async fn wait_for_forget(gateway: &FakeGateway, key: &str) {
    for _ in 0..200 {
        if gateway.forgotten().iter().any(|k| k == key) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("gateway never forgot '{}'", key);
}
