//! Job persistence
//!
//! Jobs are never deleted by the orchestrator; records stay for audit.

mod sqlite;

pub use sqlite::SqliteJobStore;

use crate::error::{OrchestratorError, Result};
use crate::job::{Job, JobId, JobStatus};
use async_trait::async_trait;
use dashmap::DashMap;
use std::cmp::Reverse;

/// Repository interface for job records
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job; fails if the id exists
    async fn insert(&self, job: &Job) -> Result<()>;

    /// Replace an existing job record
    async fn update(&self, job: &Job) -> Result<()>;

    async fn get(&self, id: JobId) -> Result<Option<Job>>;

    /// Highest-priority queued job (oldest first within a priority)
    async fn next_queued(&self) -> Result<Option<Job>>;

    async fn list_by_state(&self, status: JobStatus) -> Result<Vec<Job>>;

    /// All jobs, oldest first
    async fn list(&self) -> Result<Vec<Job>>;
}

fn queue_order(job: &Job) -> (Reverse<i32>, chrono::DateTime<chrono::Utc>, JobId) {
    (Reverse(job.priority), job.created_at, job.id)
}

/// In-process job store
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: DashMap<JobId, Job>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: &Job) -> Result<()> {
        use dashmap::mapref::entry::Entry;

        match self.jobs.entry(job.id) {
            Entry::Occupied(_) => Err(OrchestratorError::Other(anyhow::anyhow!(
                "job {} already exists",
                job.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(job.clone());
                Ok(())
            }
        }
    }

    async fn update(&self, job: &Job) -> Result<()> {
        match self.jobs.get_mut(&job.id) {
            Some(mut existing) => {
                *existing = job.clone();
                Ok(())
            }
            None => Err(OrchestratorError::JobNotFound(job.id.to_string())),
        }
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.jobs.get(&id).map(|job| job.clone()))
    }

    async fn next_queued(&self) -> Result<Option<Job>> {
        Ok(self
            .jobs
            .iter()
            .filter(|entry| entry.status() == JobStatus::Queued)
            .min_by_key(|entry| queue_order(entry.value()))
            .map(|entry| entry.value().clone()))
    }

    async fn list_by_state(&self, status: JobStatus) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .jobs
            .iter()
            .filter(|entry| entry.status() == status)
            .map(|entry| entry.value().clone())
            .collect();
        jobs.sort_by_key(|job| (job.created_at, job.id));
        Ok(jobs)
    }

    async fn list(&self) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self.jobs.iter().map(|entry| entry.value().clone()).collect();
        jobs.sort_by_key(|job| (job.created_at, job.id));
        Ok(jobs)
    }
}
