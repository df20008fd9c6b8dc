//! SQLite job store
//!
//! Queryable columns are denormalized next to the full job record (JSON), so
//! the record format can grow without schema migrations.

use super::JobStore;
use crate::error::{OrchestratorError, Result};
use crate::job::{Job, JobId, JobStatus};
use async_trait::async_trait;
use chrono::SecondsFormat;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Executor, Row};
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id              TEXT PRIMARY KEY,
    repo_id         TEXT NOT NULL,
    snapshot_id     TEXT NOT NULL,
    priority        INTEGER NOT NULL,
    state           TEXT NOT NULL,
    retry_count     INTEGER NOT NULL,
    error_category  TEXT,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    record          TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_jobs_queue ON jobs (state, priority DESC, created_at);
CREATE INDEX IF NOT EXISTS idx_jobs_snapshot ON jobs (repo_id, snapshot_id);
"#;

/// Fixed-width timestamps so text order is time order
fn timestamp(t: &chrono::DateTime<chrono::Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Open (or create) a database file
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    /// Private in-memory database (single connection)
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            // the database lives only as long as its connection
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    pub async fn with_pool(pool: SqlitePool) -> Result<Self> {
        pool.execute(SCHEMA).await?;
        debug!("SQLite job store ready");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    fn row_to_job(row: &SqliteRow) -> Result<Job> {
        let record: String = row.try_get("record")?;
        serde_json::from_str(&record).map_err(OrchestratorError::serialization)
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn insert(&self, job: &Job) -> Result<()> {
        sqlx::query(
            "INSERT INTO jobs (id, repo_id, snapshot_id, priority, state, retry_count, \
             error_category, created_at, updated_at, record) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(job.id.to_string())
        .bind(job.repo_id.as_str())
        .bind(job.snapshot_id.as_str())
        .bind(job.priority)
        .bind(job.status().as_str())
        .bind(job.retry_count as i64)
        .bind(job.last_error.as_ref().map(|e| e.category.as_str()))
        .bind(timestamp(&job.created_at))
        .bind(timestamp(&job.updated_at))
        .bind(serde_json::to_string(job)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update(&self, job: &Job) -> Result<()> {
        let result = sqlx::query(
            "UPDATE jobs SET priority = ?, state = ?, retry_count = ?, error_category = ?, \
             updated_at = ?, record = ? WHERE id = ?",
        )
        .bind(job.priority)
        .bind(job.status().as_str())
        .bind(job.retry_count as i64)
        .bind(job.last_error.as_ref().map(|e| e.category.as_str()))
        .bind(timestamp(&job.updated_at))
        .bind(serde_json::to_string(job)?)
        .bind(job.id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::JobNotFound(job.id.to_string()));
        }
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT record FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_job).transpose()
    }

    async fn next_queued(&self) -> Result<Option<Job>> {
        let row = sqlx::query(
            "SELECT record FROM jobs WHERE state = ? \
             ORDER BY priority DESC, created_at ASC, id ASC LIMIT 1",
        )
        .bind(JobStatus::Queued.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_job).transpose()
    }

    async fn list_by_state(&self, status: JobStatus) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            "SELECT record FROM jobs WHERE state = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_job).collect()
    }

    async fn list(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query("SELECT record FROM jobs ORDER BY created_at ASC, id ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_job).collect()
    }
}
