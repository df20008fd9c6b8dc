use crate::config::error::validate_identifier;
use crate::error::{ErrorCategory, OrchestratorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeSet;
use std::path::PathBuf;
use uuid::Uuid;

/// Job identifier
pub type JobId = Uuid;

/// Stage identifier
///
/// Stages are declared in configuration, so the id is string-backed; the
/// default pipeline's stages are available as constants.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageId(Cow<'static, str>);

impl StageId {
    pub const IR: StageId = StageId(Cow::Borrowed("ir"));
    pub const LEXICAL: StageId = StageId(Cow::Borrowed("lexical"));
    pub const CHUNKS: StageId = StageId(Cow::Borrowed("chunks"));
    pub const VECTOR: StageId = StageId(Cow::Borrowed("vector"));

    pub fn new(id: impl Into<String>) -> Self {
        StageId(Cow::Owned(id.into()))
    }

    pub const fn from_static(id: &'static str) -> Self {
        StageId(Cow::Borrowed(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<&str> for StageId {
    fn from(s: &str) -> Self {
        StageId::new(s)
    }
}

/// Job submission request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobRequest {
    pub repo_id: String,
    pub snapshot_id: String,
    pub changed_files: Option<Vec<PathBuf>>,
    pub previous_snapshot_id: Option<String>,
    pub priority: Option<i32>,
}

impl JobRequest {
    /// Full rebuild of one snapshot
    pub fn full(repo_id: impl Into<String>, snapshot_id: impl Into<String>) -> Self {
        Self {
            repo_id: repo_id.into(),
            snapshot_id: snapshot_id.into(),
            ..Default::default()
        }
    }

    /// Incremental update relative to a previous snapshot
    pub fn incremental(
        repo_id: impl Into<String>,
        snapshot_id: impl Into<String>,
        changed_files: Vec<PathBuf>,
        previous_snapshot_id: impl Into<String>,
    ) -> Self {
        Self {
            repo_id: repo_id.into(),
            snapshot_id: snapshot_id.into(),
            changed_files: Some(changed_files),
            previous_snapshot_id: Some(previous_snapshot_id.into()),
            priority: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn validate(&self) -> Result<()> {
        let check = |field: &str, value: &str| {
            validate_identifier(field, value)
                .map_err(|e| OrchestratorError::InvalidIdentifier(e.to_string()))
        };

        check("repo_id", &self.repo_id)?;
        check("snapshot_id", &self.snapshot_id)?;
        if let Some(previous) = &self.previous_snapshot_id {
            check("previous_snapshot_id", previous)?;
        }
        Ok(())
    }
}

/// Last error recorded on a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub message: String,
    pub category: ErrorCategory,
    pub stage: Option<StageId>,
    /// Checkpoint that must be regenerated
    pub cache_key: Option<String>,
}

impl JobError {
    pub fn new(message: impl Into<String>, category: ErrorCategory) -> Self {
        Self {
            message: message.into(),
            category,
            stage: None,
            cache_key: None,
        }
    }

    pub fn at_stage(mut self, stage: StageId, cache_key: impl Into<String>) -> Self {
        self.stage = Some(stage);
        self.cache_key = Some(cache_key.into());
        self
    }
}

/// Job state enum
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobState {
    Queued {
        queued_at: DateTime<Utc>,
    },
    Running {
        started_at: DateTime<Utc>,
        worker_id: String,
        phase_index: usize,
        /// Stages of the current phase that have not finished yet
        pending_stages: BTreeSet<StageId>,
    },
    Completed {
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        duration_ms: u64,
        files_processed: usize,
    },
    Failed {
        started_at: Option<DateTime<Utc>>,
        failed_at: DateTime<Utc>,
        error: JobError,
    },
    Cancelled {
        cancelled_at: DateTime<Utc>,
        reason: String,
    },
}

/// State discriminant, for queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            _ => Err(OrchestratorError::parse(format!("Invalid job status: {}", s))),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl JobState {
    pub fn status(&self) -> JobStatus {
        match self {
            JobState::Queued { .. } => JobStatus::Queued,
            JobState::Running { .. } => JobStatus::Running,
            JobState::Completed { .. } => JobStatus::Completed,
            JobState::Failed { .. } => JobStatus::Failed,
            JobState::Cancelled { .. } => JobStatus::Cancelled,
        }
    }

    pub fn state_name(&self) -> &'static str {
        self.status().as_str()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed { .. } | JobState::Failed { .. } | JobState::Cancelled { .. }
        )
    }
}

/// One lifecycle transition (audit trail)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub state: String,
    pub at: DateTime<Utc>,
}

/// Job model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub repo_id: String,
    pub snapshot_id: String,
    pub priority: i32,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub retry_count: u32,
    pub last_error: Option<JobError>,
    pub transitions: Vec<StateTransition>,

    // Incremental update metadata
    pub changed_files: Option<BTreeSet<PathBuf>>,
    pub previous_snapshot_id: Option<String>,

    /// Stages whose checkpoints failed verification during recovery
    pub invalidated_stages: BTreeSet<StageId>,
}

impl Job {
    /// Create a new queued job (full rebuild)
    pub fn new_queued(repo_id: String, snapshot_id: String, priority: i32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            repo_id,
            snapshot_id,
            priority,
            state: JobState::Queued { queued_at: now },
            created_at: now,
            updated_at: now,
            retry_count: 0,
            last_error: None,
            transitions: vec![StateTransition {
                state: "queued".to_string(),
                at: now,
            }],
            changed_files: None,
            previous_snapshot_id: None,
            invalidated_stages: BTreeSet::new(),
        }
    }

    /// Create a new queued job with incremental update metadata
    pub fn new_incremental(
        repo_id: String,
        snapshot_id: String,
        priority: i32,
        changed_files: BTreeSet<PathBuf>,
        previous_snapshot_id: Option<String>,
    ) -> Self {
        let mut job = Self::new_queued(repo_id, snapshot_id, priority);
        job.changed_files = Some(changed_files);
        job.previous_snapshot_id = previous_snapshot_id;
        job
    }

    pub fn from_request(request: JobRequest) -> Result<Self> {
        request.validate()?;
        let priority = request.priority.unwrap_or(0);

        Ok(match request.changed_files {
            Some(changed) => Self::new_incremental(
                request.repo_id,
                request.snapshot_id,
                priority,
                changed.into_iter().collect(),
                request.previous_snapshot_id,
            ),
            None => {
                let mut job = Self::new_queued(request.repo_id, request.snapshot_id, priority);
                job.previous_snapshot_id = request.previous_snapshot_id;
                job
            }
        })
    }

    /// Check if this is an incremental job
    pub fn is_incremental(&self) -> bool {
        self.changed_files.is_some()
    }

    pub fn state_name(&self) -> &'static str {
        self.state.state_name()
    }

    pub fn status(&self) -> JobStatus {
        self.state.status()
    }
}

/// Job state machine for transitions
pub struct JobStateMachine {
    job: Job,
}

impl JobStateMachine {
    pub fn new(job: Job) -> Self {
        Self { job }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn into_job(self) -> Job {
        self.job
    }

    fn invalid(&self, to: &str) -> OrchestratorError {
        OrchestratorError::InvalidStateTransition {
            from: self.job.state.state_name().to_string(),
            to: to.to_string(),
        }
    }

    fn set_state(&mut self, state: JobState, now: DateTime<Utc>) {
        self.job.transitions.push(StateTransition {
            state: state.state_name().to_string(),
            at: now,
        });
        self.job.state = state;
        self.job.updated_at = now;
    }

    /// Transition: QUEUED → RUNNING
    pub fn start(&mut self, worker_id: String) -> Result<()> {
        match &self.job.state {
            JobState::Queued { .. } => {
                let now = Utc::now();
                self.set_state(
                    JobState::Running {
                        started_at: now,
                        worker_id,
                        phase_index: 0,
                        pending_stages: BTreeSet::new(),
                    },
                    now,
                );
                Ok(())
            }
            _ => Err(self.invalid("running")),
        }
    }

    /// Enter a phase (running jobs only)
    pub fn enter_phase(&mut self, index: usize, stages: BTreeSet<StageId>) -> Result<()> {
        match &mut self.job.state {
            JobState::Running {
                phase_index,
                pending_stages,
                ..
            } => {
                *phase_index = index;
                *pending_stages = stages;
                self.job.updated_at = Utc::now();
                Ok(())
            }
            _ => Err(self.invalid("enter_phase")),
        }
    }

    /// Mark one stage of the current phase as finished
    pub fn finish_stage(&mut self, stage: &StageId) -> Result<()> {
        match &mut self.job.state {
            JobState::Running { pending_stages, .. } => {
                pending_stages.remove(stage);
                self.job.invalidated_stages.remove(stage);
                self.job.updated_at = Utc::now();
                Ok(())
            }
            _ => Err(self.invalid("finish_stage")),
        }
    }

    pub fn record_retry(&mut self) {
        self.job.retry_count += 1;
        self.job.updated_at = Utc::now();
    }

    /// Transition: RUNNING → COMPLETED
    pub fn complete(&mut self, files_processed: usize) -> Result<()> {
        match &self.job.state {
            JobState::Running { started_at, .. } => {
                let now = Utc::now();
                let started_at = *started_at;
                let duration_ms = (now - started_at).num_milliseconds().max(0) as u64;

                self.set_state(
                    JobState::Completed {
                        started_at,
                        completed_at: now,
                        duration_ms,
                        files_processed,
                    },
                    now,
                );
                Ok(())
            }
            _ => Err(self.invalid("completed")),
        }
    }

    /// Transition: QUEUED | RUNNING → FAILED
    pub fn fail(&mut self, error: JobError) -> Result<()> {
        let started_at = match &self.job.state {
            JobState::Running { started_at, .. } => Some(*started_at),
            JobState::Queued { .. } => None,
            _ => return Err(self.invalid("failed")),
        };

        let now = Utc::now();
        self.job.last_error = Some(error.clone());
        self.set_state(
            JobState::Failed {
                started_at,
                failed_at: now,
                error,
            },
            now,
        );
        Ok(())
    }

    /// Transition: RUNNING | FAILED → QUEUED
    ///
    /// Used for crash recovery and explicit resubmission. Permanent failures
    /// stay failed.
    pub fn requeue(&mut self) -> Result<()> {
        match &self.job.state {
            JobState::Running { .. } => {}
            JobState::Failed { error, .. } if error.category != ErrorCategory::Permanent => {}
            _ => return Err(self.invalid("queued (retry)")),
        }

        let now = Utc::now();
        self.set_state(JobState::Queued { queued_at: now }, now);
        Ok(())
    }

    /// Transition: * → CANCELLED
    pub fn cancel(&mut self, reason: String) -> Result<()> {
        if self.job.state.is_terminal() {
            return Err(self.invalid("cancelled"));
        }

        let now = Utc::now();
        self.set_state(
            JobState::Cancelled {
                cancelled_at: now,
                reason,
            },
            now,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running_machine() -> JobStateMachine {
        let job = Job::new_queued("repo-1".to_string(), "snap-1".to_string(), 0);
        let mut sm = JobStateMachine::new(job);
        sm.start("worker-1".to_string()).unwrap();
        sm
    }

    #[test]
    fn test_stage_id_constants() {
        assert_eq!(StageId::IR.as_str(), "ir");
        assert_eq!(StageId::new("ir"), StageId::IR);
        assert_eq!(StageId::from("chunks"), StageId::CHUNKS);
    }

    #[test]
    fn test_stage_id_serde_is_plain_string() {
        let json = serde_json::to_string(&StageId::VECTOR).unwrap();
        assert_eq!(json, "\"vector\"");
        let back: StageId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, StageId::VECTOR);
    }

    #[test]
    fn test_job_state_transition_queued_to_running() {
        let sm = running_machine();
        assert!(matches!(sm.job().state, JobState::Running { .. }));
        assert_eq!(sm.job().transitions.len(), 2);
    }

    #[test]
    fn test_job_state_transition_running_to_completed() {
        let mut sm = running_machine();
        sm.complete(100).unwrap();

        match &sm.job().state {
            JobState::Completed {
                files_processed, ..
            } => {
                assert_eq!(*files_processed, 100);
            }
            _ => panic!("Expected Completed state"),
        }
    }

    #[test]
    fn test_job_state_transition_running_to_failed() {
        let mut sm = running_machine();
        let error = JobError::new("test error", ErrorCategory::Transient)
            .at_stage(StageId::IR, "ir:repo-1:snap-1");
        sm.fail(error.clone()).unwrap();

        match &sm.job().state {
            JobState::Failed { error: e, .. } => assert_eq!(e, &error),
            _ => panic!("Expected Failed state"),
        }
        assert_eq!(sm.job().last_error.as_ref(), Some(&error));
    }

    #[test]
    fn test_phase_tracking() {
        let mut sm = running_machine();
        sm.enter_phase(1, BTreeSet::from([StageId::IR, StageId::LEXICAL]))
            .unwrap();
        sm.finish_stage(&StageId::IR).unwrap();

        match &sm.job().state {
            JobState::Running {
                phase_index,
                pending_stages,
                ..
            } => {
                assert_eq!(*phase_index, 1);
                assert_eq!(pending_stages, &BTreeSet::from([StageId::LEXICAL]));
            }
            _ => panic!("Expected Running state"),
        }
    }

    #[test]
    fn test_requeue_transient_failure() {
        let mut sm = running_machine();
        sm.fail(JobError::new("timeout", ErrorCategory::Transient))
            .unwrap();
        sm.requeue().unwrap();
        assert!(matches!(sm.job().state, JobState::Queued { .. }));
        // last error stays queryable after requeue
        assert!(sm.job().last_error.is_some());
    }

    #[test]
    fn test_no_requeue_for_permanent_error() {
        let mut sm = running_machine();
        sm.fail(JobError::new("parse error", ErrorCategory::Permanent))
            .unwrap();
        assert!(sm.requeue().is_err());
    }

    #[test]
    fn test_job_cancel_from_queued() {
        let job = Job::new_queued("repo-1".to_string(), "snap-1".to_string(), 0);
        let mut sm = JobStateMachine::new(job);

        sm.cancel("user requested".to_string()).unwrap();

        match &sm.job().state {
            JobState::Cancelled { reason, .. } => {
                assert_eq!(reason, "user requested");
            }
            _ => panic!("Expected Cancelled state"),
        }
    }

    #[test]
    fn test_cannot_cancel_completed_job() {
        let mut sm = running_machine();
        sm.complete(100).unwrap();

        assert!(sm.cancel("too late".to_string()).is_err());
    }

    #[test]
    fn test_cannot_start_twice() {
        let mut sm = running_machine();
        assert!(sm.start("worker-2".to_string()).is_err());
    }

    #[test]
    fn test_request_validation() {
        assert!(Job::from_request(JobRequest::full("repo", "snap")).is_ok());
        assert!(Job::from_request(JobRequest::full("re:po", "snap")).is_err());
        assert!(Job::from_request(JobRequest::full("repo", "")).is_err());
    }

    #[test]
    fn test_request_incremental_and_priority() {
        let job = Job::from_request(
            JobRequest::incremental("repo", "snap-2", vec![PathBuf::from("a.py")], "snap-1")
                .with_priority(5),
        )
        .unwrap();

        assert!(job.is_incremental());
        assert_eq!(job.priority, 5);
        assert_eq!(job.previous_snapshot_id.as_deref(), Some("snap-1"));
    }

    #[test]
    fn test_job_json_roundtrip_keeps_state() {
        let sm = running_machine();
        let json = serde_json::to_string(sm.job()).unwrap();
        let back: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(back.state, sm.job().state);
        assert_eq!(back.id, sm.job().id);
    }
}
