mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use serde_json::json;
use uuid::Uuid;

use common::{FakeGateway, Reattach, test_registry, wait_for_forget, wait_for_status};
use flowgate::engine::types::*;
use flowgate::engine::{FlowExecutor, ReconcileReport, parse_parameters};
use flowgate::error::FlowError;
use flowgate::flows::{BindError, ResolveError};
use flowgate::gateway::GatewayError;
use flowgate::storage::memory_store::MemoryJobStore;
use flowgate::storage::{JobStore, StoreError};

fn setup() -> (FlowExecutor, Arc<MemoryJobStore>, Arc<FakeGateway>) {
    let store = Arc::new(MemoryJobStore::new());
    let gateway = Arc::new(FakeGateway::new());
    let executor = FlowExecutor::new(Arc::new(test_registry()), store.clone(), gateway.clone());
    (executor, store, gateway)
}

fn echo_params() -> serde_json::Map<String, serde_json::Value> {
    parse_parameters(r#"{"c":"y","a":"x","b":5}"#).unwrap()
}

#[tokio::test]
async fn start_flow_records_running_job_with_execution_id() {
    let (executor, store, gateway) = setup();

    let started = executor
        .start_flow("k1", "com.example.flows.EchoFlow", &echo_params())
        .await
        .unwrap();

    assert_eq!(started.idempotency_key, "k1");

    let job = store.find_by_key("k1").await.unwrap().unwrap();
    assert_eq!(job.status(), JobStatus::Running);
    assert_eq!(job.execution_id, Some(started.execution_id));

    let calls = gateway.invocations();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].flow_type, "com.example.flows.EchoFlow");
    assert_eq!(calls[0].args, vec![json!("x"), json!(5), json!("y")]);
}

#[tokio::test]
async fn completion_is_recorded_then_key_is_forgotten() {
    let (executor, store, gateway) = setup();

    let started = executor
        .start_flow("k1", "com.example.flows.EchoFlow", &echo_params())
        .await
        .unwrap();
    gateway.finish("k1", Ok(json!({"value1": "v", "value2": 7})));

    let job = wait_for_status(store.as_ref(), "k1", JobStatus::Completed).await;
    assert_eq!(job.result_json(), Some(r#"{"value1":"v","value2":7}"#));
    assert_eq!(job.execution_id, Some(started.execution_id));

    wait_for_forget(&gateway, "k1").await;
    assert_eq!(gateway.forgotten(), vec!["k1".to_string()]);
}

#[tokio::test]
async fn failure_is_recorded_with_digest() {
    let (executor, store, gateway) = setup();

    executor
        .start_flow("k1", "com.example.flows.PingFlow", &Default::default())
        .await
        .unwrap();
    gateway.finish(
        "k1",
        Err(FailureInfo::new("FlowException", Some("boom".to_string()))),
    );

    let job = wait_for_status(store.as_ref(), "k1", JobStatus::Failed).await;
    let failure = job.failure().unwrap();
    assert_eq!(failure.kind, "FlowException");
    assert_eq!(failure.message.as_deref(), Some("boom"));
    assert!(job.result_json().is_none());

    wait_for_forget(&gateway, "k1").await;
}

#[tokio::test]
async fn unknown_flow_type_is_rejected_before_any_write() {
    let (executor, store, gateway) = setup();

    let err = executor
        .start_flow("k1", "com.example.flows.Missing", &Default::default())
        .await
        .unwrap_err();

    assert!(matches!(err, FlowError::Resolve(ResolveError::FlowClassNotFound(ref n)) if n == "com.example.flows.Missing"));
    assert!(store.find_by_key("k1").await.unwrap().is_none());
    assert!(gateway.invocations().is_empty());
}

#[tokio::test]
async fn binding_error_is_rejected_before_any_write() {
    let (executor, store, _gateway) = setup();

    let params = parse_parameters(r#"{"a":"x","b":5}"#).unwrap();
    let err = executor
        .start_flow("k1", "com.example.flows.EchoFlow", &params)
        .await
        .unwrap_err();

    match err {
        FlowError::Bind(BindError::MissingParameters { missing, .. }) => {
            assert_eq!(missing, vec!["c".to_string()])
        }
        other => panic!("expected missing parameters, got {:?}", other),
    }
    assert!(store.find_by_key("k1").await.unwrap().is_none());
}

#[tokio::test]
async fn duplicate_key_is_rejected_without_second_invocation() {
    let (executor, store, gateway) = setup();

    executor
        .start_flow("k1", "com.example.flows.PingFlow", &Default::default())
        .await
        .unwrap();
    let err = executor
        .start_flow("k1", "com.example.flows.PingFlow", &Default::default())
        .await
        .unwrap_err();

    assert!(matches!(err, FlowError::Store(StoreError::DuplicateKey(_))));
    assert_eq!(gateway.invocations().len(), 1);
    assert_eq!(
        store.find_all_by_status(JobStatus::Running).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn failed_invocation_leaves_orphaned_running_job() {
    let (executor, store, gateway) = setup();
    gateway.fail_next_invoke(GatewayError::Rejected("400 Bad Request: no such flow".to_string()));

    let err = executor
        .start_flow("k1", "com.example.flows.PingFlow", &Default::default())
        .await
        .unwrap_err();

    assert!(matches!(err, FlowError::Gateway(GatewayError::Rejected(_))));
    let job = store.find_by_key("k1").await.unwrap().unwrap();
    assert_eq!(job.status(), JobStatus::Running);
    assert!(job.execution_id.is_none());
}

#[tokio::test]
async fn closed_connection_leaves_job_running_and_key_unforgotten() {
    let (executor, store, gateway) = setup();

    executor
        .start_flow("k1", "com.example.flows.PingFlow", &Default::default())
        .await
        .unwrap();
    gateway.disconnect("k1");

    tokio::time::sleep(Duration::from_millis(50)).await;
    let job = store.find_by_key("k1").await.unwrap().unwrap();
    assert_eq!(job.status(), JobStatus::Running);
    assert!(gateway.forgotten().is_empty());
}

#[tokio::test]
async fn forget_failure_does_not_undo_recorded_outcome() {
    let (executor, store, gateway) = setup();
    *gateway.fail_forget.lock().unwrap() = true;

    executor
        .start_flow("k1", "com.example.flows.PingFlow", &Default::default())
        .await
        .unwrap();
    gateway.finish("k1", Ok(json!(true)));

    wait_for_forget(&gateway, "k1").await;
    let job = wait_for_status(store.as_ref(), "k1", JobStatus::Completed).await;
    assert_eq!(job.result_json(), Some("true"));
}

#[tokio::test]
async fn reconcile_isolates_a_failing_reattach() {
    let (executor, store, gateway) = setup();
    for key in ["job-1", "job-2", "job-3"] {
        store.insert_pending(key).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let first = Uuid::new_v4();
    let third = Uuid::new_v4();
    gateway.script_reattach("job-1", Reattach::Finished(first, Ok(json!({"n": 1}))));
    gateway.script_reattach("job-2", Reattach::Fail);
    gateway.script_reattach(
        "job-3",
        Reattach::Finished(third, Err(FailureInfo::new("FlowException", None))),
    );

    let report = executor.reconcile().await.unwrap();
    assert_eq!(
        report,
        ReconcileReport {
            reattached: 2,
            unknown: 0,
            failed: 1,
        }
    );

    let job1 = wait_for_status(store.as_ref(), "job-1", JobStatus::Completed).await;
    assert_eq!(job1.execution_id, Some(first));
    let job3 = wait_for_status(store.as_ref(), "job-3", JobStatus::Failed).await;
    assert_eq!(job3.execution_id, Some(third));

    let job2 = store.find_by_key("job-2").await.unwrap().unwrap();
    assert_eq!(job2.status(), JobStatus::Running);

    wait_for_forget(&gateway, "job-1").await;
    wait_for_forget(&gateway, "job-3").await;
    assert!(!gateway.forgotten().contains(&"job-2".to_string()));
}

#[tokio::test]
async fn reconcile_counts_keys_the_engine_forgot() {
    let (executor, store, gateway) = setup();
    store.insert_pending("gone").await.unwrap();
    gateway.script_reattach("gone", Reattach::Unknown);

    let report = executor.reconcile().await.unwrap();

    assert_eq!(report.unknown, 1);
    assert_eq!(report.reattached, 0);
    let job = store.find_by_key("gone").await.unwrap().unwrap();
    assert_eq!(job.status(), JobStatus::Running);
}

#[tokio::test]
async fn reconcile_skips_terminal_jobs() {
    let (executor, store, gateway) = setup();
    let id = Uuid::new_v4();
    store.insert_pending("done").await.unwrap();
    store
        .complete_if_running("done", id, &json!("ok"))
        .await
        .unwrap();

    let report = executor.reconcile().await.unwrap();

    assert_eq!(report, ReconcileReport::default());
    assert!(gateway.forgotten().is_empty());
}

#[tokio::test]
async fn live_callback_and_reattach_race_forget_once() {
    let (executor, store, gateway) = setup();

    let started = executor
        .start_flow("k1", "com.example.flows.PingFlow", &Default::default())
        .await
        .unwrap();

    // A reconciliation pass sees the same flow finish while the live watcher
    // is still waiting.
    gateway.script_reattach(
        "k1",
        Reattach::Finished(started.execution_id, Ok(json!("from-reattach"))),
    );
    executor.reconcile().await.unwrap();
    wait_for_status(store.as_ref(), "k1", JobStatus::Completed).await;

    gateway.finish("k1", Ok(json!("from-callback")));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let job = store.find_by_key("k1").await.unwrap().unwrap();
    assert_eq!(job.result_json(), Some(r#""from-reattach""#));
    assert_eq!(gateway.forgotten(), vec!["k1".to_string()]);
}

#[tokio::test]
async fn registered_flows_and_protocol_version_pass_through() {
    let (executor, _store, _gateway) = setup();

    assert_eq!(
        executor.registered_flows().await.unwrap(),
        vec!["com.example.flows.EchoFlow".to_string()]
    );
    assert_eq!(executor.protocol_version().await.unwrap(), 4);
}

#[test]
fn parse_parameters_requires_an_object() {
    assert!(parse_parameters("{}").unwrap().is_empty());
    assert!(matches!(
        parse_parameters("[1, 2]"),
        Err(FlowError::MalformedParameters(_))
    ));
    assert!(matches!(
        parse_parameters("{not json"),
        Err(FlowError::MalformedParameters(_))
    ));
}

/// Delegates to a memory store but refuses every terminal write.
struct RejectingTerminalStore {
    inner: MemoryJobStore,
    attempts: AtomicUsize,
}

impl RejectingTerminalStore {
    fn refuse(&self, key: &str) -> StoreError {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        StoreError::Corrupt {
            key: key.to_string(),
            reason: "disk full".to_string(),
        }
    }
}

#[async_trait]
impl JobStore for RejectingTerminalStore {
    async fn insert_pending(&self, key: &str) -> Result<Job, StoreError> {
        self.inner.insert_pending(key).await
    }

    async fn attach_execution_id(&self, key: &str, execution_id: Uuid) -> Result<(), StoreError> {
        self.inner.attach_execution_id(key, execution_id).await
    }

    async fn complete_if_running(
        &self,
        key: &str,
        _execution_id: Uuid,
        _result: &serde_json::Value,
    ) -> Result<bool, StoreError> {
        Err(self.refuse(key))
    }

    async fn fail_if_running(
        &self,
        key: &str,
        _execution_id: Uuid,
        _failure: &FailureInfo,
    ) -> Result<bool, StoreError> {
        Err(self.refuse(key))
    }

    async fn find_by_key(&self, key: &str) -> Result<Option<Job>, StoreError> {
        self.inner.find_by_key(key).await
    }

    async fn find_by_execution_id(&self, execution_id: Uuid) -> Result<Option<Job>, StoreError> {
        self.inner.find_by_execution_id(execution_id).await
    }

    async fn find_all_by_status(&self, status: JobStatus) -> Result<Vec<Job>, StoreError> {
        self.inner.find_all_by_status(status).await
    }

    async fn remove_all(&self) -> Result<u64, StoreError> {
        self.inner.remove_all().await
    }
}

#[tokio::test]
async fn failed_completion_write_is_swallowed_and_key_is_kept() {
    let store = Arc::new(RejectingTerminalStore {
        inner: MemoryJobStore::new(),
        attempts: AtomicUsize::new(0),
    });
    let gateway = Arc::new(FakeGateway::new());
    let executor = FlowExecutor::new(Arc::new(test_registry()), store.clone(), gateway.clone());

    executor
        .start_flow("k1", "com.example.flows.EchoFlow", &echo_params())
        .await
        .unwrap();
    gateway.finish("k1", Ok(json!(1)));

    for _ in 0..200 {
        if store.attempts.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(store.attempts.load(Ordering::SeqCst), 1);
    // Give a stray forget time to show up
    tokio::time::sleep(Duration::from_millis(50)).await;

    let job = store.find_by_key("k1").await.unwrap().unwrap();
    assert_eq!(job.status(), JobStatus::Running);
    assert!(gateway.forgotten().is_empty());

    let second = executor
        .start_flow("k2", "com.example.flows.PingFlow", &serde_json::Map::new())
        .await
        .unwrap();
    assert_eq!(second.idempotency_key, "k2");
}
