use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::engine::types::*;
use crate::storage::{JobStore, StoreError};

/// In-memory job store. Holds jobs only for the lifetime of the instance.
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<String, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

fn held_elsewhere(jobs: &HashMap<String, Job>, key: &str, execution_id: Uuid) -> bool {
    jobs.values()
        .any(|j| j.idempotency_key != key && j.execution_id == Some(execution_id))
}

impl MemoryJobStore {
    async fn finish_if_running(
        &self,
        key: &str,
        execution_id: Uuid,
        state: JobState,
    ) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.lock().await;
        let running = matches!(jobs.get(key), Some(job) if job.state == JobState::Running);
        if !running {
            return Ok(false);
        }
        if held_elsewhere(&jobs, key, execution_id) {
            return Err(StoreError::DuplicateExecutionId(execution_id));
        }
        let Some(job) = jobs.get_mut(key) else {
            return Ok(false);
        };
        job.execution_id = Some(execution_id);
        job.state = state;
        job.updated = Utc::now();
        Ok(true)
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert_pending(&self, key: &str) -> Result<Job, StoreError> {
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(key) {
            return Err(StoreError::DuplicateKey(key.to_string()));
        }
        let job = Job::pending(key);
        jobs.insert(key.to_string(), job.clone());
        Ok(job)
    }

    async fn attach_execution_id(&self, key: &str, execution_id: Uuid) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().await;
        if held_elsewhere(&jobs, key, execution_id) {
            return Err(StoreError::DuplicateExecutionId(execution_id));
        }
        if let Some(job) = jobs.get_mut(key) {
            job.execution_id = Some(execution_id);
            job.updated = Utc::now();
        }
        Ok(())
    }

    async fn complete_if_running(
        &self,
        key: &str,
        execution_id: Uuid,
        result: &serde_json::Value,
    ) -> Result<bool, StoreError> {
        let result_json = serde_json::to_string(result)?;
        self.finish_if_running(key, execution_id, JobState::Completed { result_json })
            .await
    }

    async fn fail_if_running(
        &self,
        key: &str,
        execution_id: Uuid,
        failure: &FailureInfo,
    ) -> Result<bool, StoreError> {
        self.finish_if_running(key, execution_id, JobState::Failed(failure.clone()))
            .await
    }

    async fn find_by_key(&self, key: &str) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.lock().await.get(key).cloned())
    }

    async fn find_by_execution_id(&self, execution_id: Uuid) -> Result<Option<Job>, StoreError> {
        let jobs = self.jobs.lock().await;
        Ok(jobs
            .values()
            .find(|j| j.execution_id == Some(execution_id))
            .cloned())
    }

    async fn find_all_by_status(&self, status: JobStatus) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.lock().await;
        let mut matching: Vec<Job> = jobs
            .values()
            .filter(|j| j.status() == status)
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            a.created
                .cmp(&b.created)
                .then_with(|| a.idempotency_key.cmp(&b.idempotency_key))
        });
        Ok(matching)
    }

    async fn remove_all(&self) -> Result<u64, StoreError> {
        let mut jobs = self.jobs.lock().await;
        let removed = jobs.len() as u64;
        jobs.clear();
        Ok(removed)
    }
}
