use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a tracked job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "RUNNING" => Ok(JobStatus::Running),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            _ => Err(format!(
                "Invalid status '{}'. Use: running, completed, failed",
                s
            )),
        }
    }
}

/// Digest of a flow failure, as reported by the remote engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureInfo {
    #[serde(rename = "exceptionType")]
    pub kind: String,
    pub message: Option<String>,
}

impl FailureInfo {
    pub fn new(kind: impl Into<String>, message: Option<String>) -> Self {
        Self {
            kind: kind.into(),
            message,
        }
    }
}

/// Status and payload of a job. The payload only exists for the matching
/// terminal status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Running,
    /// Canonical JSON serialization of the flow's return value.
    Completed { result_json: String },
    Failed(FailureInfo),
}

impl JobState {
    pub fn status(&self) -> JobStatus {
        match self {
            JobState::Running => JobStatus::Running,
            JobState::Completed { .. } => JobStatus::Completed,
            JobState::Failed(_) => JobStatus::Failed,
        }
    }
}

/// Durable record of one flow invocation, keyed by the client's idempotency key.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub idempotency_key: String,
    pub execution_id: Option<Uuid>,
    pub state: JobState,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Job {
    pub fn pending(idempotency_key: &str) -> Self {
        let now = Utc::now();
        Self {
            idempotency_key: idempotency_key.to_string(),
            execution_id: None,
            state: JobState::Running,
            created: now,
            updated: now,
        }
    }

    pub fn status(&self) -> JobStatus {
        self.state.status()
    }

    pub fn result_json(&self) -> Option<&str> {
        match &self.state {
            JobState::Completed { result_json } => Some(result_json),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<&FailureInfo> {
        match &self.state {
            JobState::Failed(info) => Some(info),
            _ => None,
        }
    }
}

/// What a caller gets back from starting a flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedFlow {
    pub idempotency_key: String,
    pub execution_id: Uuid,
}
