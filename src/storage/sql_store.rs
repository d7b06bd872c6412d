use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use tracing::{debug, info};
use uuid::Uuid;

use crate::engine::types::*;
use crate::storage::{JobStore, StoreError};

const COLUMNS: &str = "idempotency_key, execution_id, status, result_json, failure_kind, failure_message, created_at, updated_at";

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS flow_jobs (
        idempotency_key TEXT PRIMARY KEY,
        execution_id TEXT,
        status TEXT NOT NULL,
        result_json TEXT,
        failure_kind TEXT,
        failure_message TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS flow_jobs_execution_id
        ON flow_jobs (execution_id) WHERE execution_id IS NOT NULL",
    "CREATE INDEX IF NOT EXISTS flow_jobs_status ON flow_jobs (status)",
];

/// Job store backed by any database sqlx is compiled with (SQLite by default,
/// Postgres with the `postgres` feature).
pub struct SqlJobStore {
    pool: AnyPool,
}

impl SqlJobStore {
    /// Connect and make sure the schema exists.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        // Install any drivers that are compiled in
        sqlx::any::install_default_drivers();

        // An in-memory SQLite database lives and dies with its connection
        let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let options = if in_memory {
            AnyPoolOptions::new()
                .max_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>)
        } else {
            AnyPoolOptions::new().max_connections(8)
        };

        let pool = options.connect(database_url).await?;
        let store = Self { pool };
        store.migrate().await?;

        info!("Job store ready");
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn finish_if_running(
        &self,
        key: &str,
        execution_id: Uuid,
        state: &JobState,
    ) -> Result<bool, StoreError> {
        let (result_json, failure_kind, failure_message) = match state {
            JobState::Running => (None, None, None),
            JobState::Completed { result_json } => (Some(result_json.as_str()), None, None),
            JobState::Failed(info) => (None, Some(info.kind.as_str()), info.message.as_deref()),
        };

        let result = sqlx::query(
            "UPDATE flow_jobs
             SET status = $1, execution_id = $2, result_json = $3,
                 failure_kind = $4, failure_message = $5, updated_at = $6
             WHERE idempotency_key = $7 AND status = 'RUNNING'",
        )
        .bind(state.status().as_str())
        .bind(execution_id.to_string())
        .bind(result_json)
        .bind(failure_kind)
        .bind(failure_message)
        .bind(timestamp(Utc::now()))
        .bind(key)
        .execute(&self.pool)
        .await
        .map_err(|e| map_execution_id_conflict(e, execution_id))?;

        let applied = result.rows_affected() > 0;
        debug!(client_id = %key, status = %state.status(), applied, "Terminal update");
        Ok(applied)
    }

    async fn fetch_one_where(&self, predicate: &str, value: String) -> Result<Option<Job>, StoreError> {
        let query = format!("SELECT {} FROM flow_jobs WHERE {} = $1", COLUMNS, predicate);
        let row = sqlx::query(&query)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_row).transpose()
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn corrupt(key: &str, reason: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
        key: key.to_string(),
        reason: reason.into(),
    }
}

fn parse_timestamp(key: &str, column: &str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| corrupt(key, format!("{}: {}", column, e)))
}

fn map_row(row: &AnyRow) -> Result<Job, StoreError> {
    let key: String = row.try_get("idempotency_key")?;

    let execution_id = row
        .try_get::<Option<String>, _>("execution_id")?
        .map(|raw| Uuid::parse_str(&raw))
        .transpose()
        .map_err(|e| corrupt(&key, format!("execution_id: {}", e)))?;

    let status: JobStatus = row
        .try_get::<String, _>("status")?
        .parse()
        .map_err(|e: String| corrupt(&key, e))?;

    let state = match status {
        JobStatus::Running => JobState::Running,
        JobStatus::Completed => JobState::Completed {
            result_json: row
                .try_get::<Option<String>, _>("result_json")?
                .ok_or_else(|| corrupt(&key, "completed job has no result"))?,
        },
        JobStatus::Failed => JobState::Failed(FailureInfo {
            kind: row
                .try_get::<Option<String>, _>("failure_kind")?
                .ok_or_else(|| corrupt(&key, "failed job has no failure kind"))?,
            message: row.try_get("failure_message")?,
        }),
    };

    let created = parse_timestamp(&key, "created_at", &row.try_get::<String, _>("created_at")?)?;
    let updated = parse_timestamp(&key, "updated_at", &row.try_get::<String, _>("updated_at")?)?;

    Ok(Job {
        idempotency_key: key,
        execution_id,
        state,
        created,
        updated,
    })
}

fn map_execution_id_conflict(err: sqlx::Error, execution_id: Uuid) -> StoreError {
    let conflict = err
        .as_database_error()
        .is_some_and(|db| db.is_unique_violation());
    if conflict {
        StoreError::DuplicateExecutionId(execution_id)
    } else {
        StoreError::Database(err)
    }
}

#[async_trait]
impl JobStore for SqlJobStore {
    async fn insert_pending(&self, key: &str) -> Result<Job, StoreError> {
        let job = Job::pending(key);

        let result = sqlx::query(
            "INSERT INTO flow_jobs (idempotency_key, status, created_at, updated_at)
             VALUES ($1, 'RUNNING', $2, $3)
             ON CONFLICT (idempotency_key) DO NOTHING",
        )
        .bind(key)
        .bind(timestamp(job.created))
        .bind(timestamp(job.updated))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::DuplicateKey(key.to_string()));
        }
        Ok(job)
    }

    async fn attach_execution_id(&self, key: &str, execution_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("UPDATE flow_jobs SET execution_id = $1, updated_at = $2 WHERE idempotency_key = $3")
            .bind(execution_id.to_string())
            .bind(timestamp(Utc::now()))
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| map_execution_id_conflict(e, execution_id))?;
        Ok(())
    }

    async fn complete_if_running(
        &self,
        key: &str,
        execution_id: Uuid,
        result: &serde_json::Value,
    ) -> Result<bool, StoreError> {
        let result_json = serde_json::to_string(result)?;
        self.finish_if_running(key, execution_id, &JobState::Completed { result_json })
            .await
    }

    async fn fail_if_running(
        &self,
        key: &str,
        execution_id: Uuid,
        failure: &FailureInfo,
    ) -> Result<bool, StoreError> {
        self.finish_if_running(key, execution_id, &JobState::Failed(failure.clone()))
            .await
    }

    async fn find_by_key(&self, key: &str) -> Result<Option<Job>, StoreError> {
        self.fetch_one_where("idempotency_key", key.to_string()).await
    }

    async fn find_by_execution_id(&self, execution_id: Uuid) -> Result<Option<Job>, StoreError> {
        self.fetch_one_where("execution_id", execution_id.to_string())
            .await
    }

    async fn find_all_by_status(&self, status: JobStatus) -> Result<Vec<Job>, StoreError> {
        let query = format!(
            "SELECT {} FROM flow_jobs WHERE status = $1 ORDER BY created_at, idempotency_key",
            COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_row).collect()
    }

    async fn remove_all(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM flow_jobs")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
