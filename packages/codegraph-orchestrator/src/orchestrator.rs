use crate::checkpoint::{CheckpointStore, PruneReport, RecoveryReport};
use crate::config::{MissingIndexPolicy, OrchestratorConfig};
use crate::dag::{CacheKey, CacheKeyManager, PipelineDAG, StageNode};
use crate::dependency_graph::{DependencyIndexes, ReverseDependencyIndex, INDEX_STAGE};
use crate::error::{ErrorCategory, OrchestratorError, Result, StageError};
use crate::files::FileSource;
use crate::job::{Job, JobError, JobId, JobRequest, JobState, JobStateMachine, JobStatus, StageId};
use crate::job_store::{JobStore, SqliteJobStore};
use crate::pipeline::{HandlerRegistry, StageConfig, StageContext, StageHandler, StageInput, StageMetrics};
use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pipeline result (aggregated metrics from all stages)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub job_id: JobId,
    pub status: JobStatus,
    pub files_processed: usize,
    pub items_created: usize,
    pub duration_ms: u64,
    /// Stages whose handler ran and whose output was persisted
    pub executed: Vec<StageId>,
    /// Stages satisfied by a valid checkpoint
    pub skipped: Vec<StageId>,
    /// Failed optional stages and their dependents
    pub skipped_optional: Vec<StageId>,
    /// Size of the affected set (incremental jobs)
    pub affected_files: Option<usize>,
    pub stage_metrics: BTreeMap<StageId, StageMetrics>,
    pub warnings: Vec<String>,
    pub error: Option<JobError>,
}

impl PipelineResult {
    fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            status: JobStatus::Running,
            files_processed: 0,
            items_created: 0,
            duration_ms: 0,
            executed: Vec::new(),
            skipped: Vec::new(),
            skipped_optional: Vec::new(),
            affected_files: None,
            stage_metrics: BTreeMap::new(),
            warnings: Vec::new(),
            error: None,
        }
    }

    pub fn merge_metrics(&mut self, stage: &StageId, metrics: &StageMetrics) {
        self.files_processed += metrics.files_processed;
        self.items_created += metrics.items_created;
        self.warnings
            .extend(metrics.warnings.iter().map(|w| format!("{}: {}", stage, w)));
        self.stage_metrics.insert(stage.clone(), metrics.clone());
    }
}

/// Outcome of `Orchestrator::recover`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartupRecovery {
    pub checkpoints: RecoveryReport,
    /// Jobs left running by the previous process, now queued again
    pub requeued: Vec<JobId>,
    /// Jobs that had stages marked for re-execution
    pub marked: Vec<JobId>,
}

/// Why a job stopped before completing
enum Abort {
    Failed(JobError),
    Cancelled(String),
}

impl From<OrchestratorError> for Abort {
    fn from(e: OrchestratorError) -> Self {
        Abort::Failed(JobError::new(e.to_string(), e.category()))
    }
}

/// A job's dependency index and affected set
struct PreparedIndex {
    index: Arc<ReverseDependencyIndex>,
    affected: Option<BTreeSet<PathBuf>>,
    /// Neither in memory nor restored from a checkpoint
    fresh: bool,
}

impl PreparedIndex {
    fn restored(job: &Job, index: Arc<ReverseDependencyIndex>) -> Self {
        Self {
            affected: affected_set(job, &index),
            index,
            fresh: false,
        }
    }

    fn fresh(index: Arc<ReverseDependencyIndex>) -> Self {
        Self {
            index,
            affected: None,
            fresh: true,
        }
    }
}

enum StageOutcome {
    Completed(StageMetrics),
    Failed(JobError),
    Cancelled,
}

struct StageRun {
    stage: StageId,
    retries: u32,
    outcome: StageOutcome,
}

/// Cancellation handle of a running job
#[derive(Default)]
struct RunHandle {
    token: CancellationToken,
    reason: Mutex<Option<String>>,
}

impl RunHandle {
    fn reason(&self) -> String {
        self.reason
            .lock()
            .clone()
            .unwrap_or_else(|| "cancelled".to_string())
    }
}

/// Releases a `(repository, snapshot)` claim and the run handle
struct RunGuard<'a> {
    orchestrator: &'a Orchestrator,
    snapshot: (String, String),
    job_id: JobId,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.orchestrator.active_snapshots.remove(&self.snapshot);
        self.orchestrator.running.remove(&self.job_id);
    }
}

/// Pipeline orchestrator with DAG execution
///
/// Owns the per-repository dependency indexes; stage handlers reach them
/// through `StageContext::dependency_index`.
pub struct Orchestrator {
    config: OrchestratorConfig,
    dag: Arc<PipelineDAG>,
    handlers: HandlerRegistry,
    store: Arc<CheckpointStore>,
    jobs: Arc<dyn JobStore>,
    files: Arc<dyn FileSource>,
    indexes: DependencyIndexes,
    stage_slots: Arc<Semaphore>,
    running: DashMap<JobId, Arc<RunHandle>>,
    /// (repository, snapshot) → job currently running it
    active_snapshots: DashMap<(String, String), JobId>,
    /// Serializes load → transition → persist sequences
    transitions: tokio::sync::Mutex<()>,
}

impl Orchestrator {
    /// Build an orchestrator; every DAG stage must have a handler.
    pub fn new(
        config: OrchestratorConfig,
        handlers: HandlerRegistry,
        store: Arc<CheckpointStore>,
        jobs: Arc<dyn JobStore>,
        files: Arc<dyn FileSource>,
    ) -> Result<Self> {
        let dag = config.build_dag()?;
        handlers.validate_against(&dag)?;

        info!("Execution plan:\n{}", dag.execution_plan());

        Ok(Self {
            stage_slots: Arc::new(Semaphore::new(config.execution.effective_concurrency())),
            config,
            dag: Arc::new(dag),
            handlers,
            store,
            jobs,
            files,
            indexes: DependencyIndexes::new(),
            running: DashMap::new(),
            active_snapshots: DashMap::new(),
            transitions: tokio::sync::Mutex::new(()),
        })
    }

    /// Open the checkpoint store and a SQLite job database under `storage.root`
    pub async fn open(
        config: OrchestratorConfig,
        handlers: HandlerRegistry,
        files: Arc<dyn FileSource>,
    ) -> Result<Self> {
        let store = CheckpointStore::open(&config.storage).await?;
        let jobs = SqliteJobStore::open(config.storage.root.join("jobs.db")).await?;
        Self::new(config, handlers, Arc::new(store), Arc::new(jobs), files)
    }

    /// Share dependency indexes with another component
    pub fn with_indexes(mut self, indexes: DependencyIndexes) -> Self {
        self.indexes = indexes;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn dag(&self) -> &PipelineDAG {
        &self.dag
    }

    pub fn store(&self) -> &Arc<CheckpointStore> {
        &self.store
    }

    pub fn job_store(&self) -> &Arc<dyn JobStore> {
        &self.jobs
    }

    pub fn indexes(&self) -> &DependencyIndexes {
        &self.indexes
    }

    /// Accept a job request; the job starts queued
    pub async fn submit(&self, request: JobRequest) -> Result<JobId> {
        let job = Job::from_request(request)?;
        self.jobs.insert(&job).await?;

        info!(
            job_id = %job.id,
            repo_id = %job.repo_id,
            snapshot_id = %job.snapshot_id,
            incremental = job.is_incremental(),
            "Job submitted"
        );
        Ok(job.id)
    }

    pub async fn job(&self, id: JobId) -> Result<Job> {
        self.jobs
            .get(id)
            .await?
            .ok_or_else(|| OrchestratorError::JobNotFound(id.to_string()))
    }

    /// Run the highest-priority queued job, if any
    pub async fn run_next(&self) -> Result<Option<PipelineResult>> {
        match self.jobs.next_queued().await? {
            Some(job) => Ok(Some(self.run_job(job.id).await?)),
            None => Ok(None),
        }
    }

    /// Run queued jobs until the queue is empty
    pub async fn drain(&self) -> Result<Vec<PipelineResult>> {
        let mut results = Vec::new();
        while let Some(result) = self.run_next().await? {
            results.push(result);
        }
        Ok(results)
    }

    /// Cancel a job.
    ///
    /// Queued jobs are cancelled immediately; running jobs stop at the next
    /// phase boundary.
    pub async fn cancel(&self, id: JobId, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        let _lock = self.transitions.lock().await;

        if let Some(handle) = self.running.get(&id) {
            *handle.reason.lock() = Some(reason.clone());
            handle.token.cancel();
            info!(job_id = %id, reason = %reason, "Cancellation requested");
            return Ok(());
        }

        let mut sm = JobStateMachine::new(self.job(id).await?);
        sm.cancel(reason.clone())?;
        self.jobs.update(sm.job()).await?;
        info!(job_id = %id, reason = %reason, "Queued job cancelled");
        Ok(())
    }

    /// Failed → Queued for non-permanent failures
    pub async fn requeue(&self, id: JobId) -> Result<()> {
        let _lock = self.transitions.lock().await;

        let mut sm = JobStateMachine::new(self.job(id).await?);
        sm.requeue()?;
        self.jobs.update(sm.job()).await?;
        info!(job_id = %id, "Job requeued");
        Ok(())
    }

    /// Startup recovery.
    ///
    /// Settles the checkpoint store, marks invalidated stages on the jobs
    /// that own them, and requeues jobs a crash left running.
    pub async fn recover(&self) -> Result<StartupRecovery> {
        let _lock = self.transitions.lock().await;
        let report = self.store.recover().await?;

        let mut jobs: HashMap<JobId, Job> = self
            .jobs
            .list()
            .await?
            .into_iter()
            .map(|job| (job.id, job))
            .collect();

        let index_builders = self.handlers.index_builders();
        let mut marked = BTreeSet::new();
        for invalidated in &report.invalidated {
            let Ok(key) = CacheKey::parse(&invalidated.cache_key) else {
                continue;
            };
            // a lost index is regenerated by the stages that build it
            let stages: Vec<StageId> = if key.stage == INDEX_STAGE {
                index_builders.iter().cloned().collect()
            } else {
                vec![key.stage.clone()]
            };

            for job in jobs.values_mut() {
                let owner = invalidated.job_id == Some(job.id);
                let same_snapshot = job.repo_id == key.repo_id
                    && job.snapshot_id == key.snapshot_id
                    && !job.state.is_terminal();
                if !(owner || same_snapshot) {
                    continue;
                }
                for stage in &stages {
                    if job.invalidated_stages.insert(stage.clone()) {
                        marked.insert(job.id);
                    }
                }
            }
        }

        let mut requeued = Vec::new();
        for job in jobs.into_values() {
            let id = job.id;
            let was_marked = marked.contains(&id);

            if matches!(job.state, JobState::Running { .. }) {
                let mut sm = JobStateMachine::new(job);
                sm.requeue()?;
                self.jobs.update(sm.job()).await?;
                warn!(job_id = %id, "Job interrupted by restart; requeued");
                requeued.push(id);
            } else if was_marked {
                self.jobs.update(&job).await?;
            }
        }
        requeued.sort();

        for id in &marked {
            info!(job_id = %id, "Stages marked for re-execution after recovery");
        }

        Ok(StartupRecovery {
            checkpoints: report,
            requeued,
            marked: marked.into_iter().collect(),
        })
    }

    /// Apply the configured retention policy
    pub async fn prune(&self) -> Result<PruneReport> {
        self.store.prune(&self.config.retention).await
    }

    /// Claim the job and its snapshot, then transition Queued → Running
    async fn start_job(&self, id: JobId) -> Result<(JobStateMachine, RunGuard<'_>, Arc<RunHandle>)> {
        use dashmap::mapref::entry::Entry;

        let _lock = self.transitions.lock().await;
        let job = self.job(id).await?;
        if !matches!(job.state, JobState::Queued { .. }) {
            return Err(OrchestratorError::InvalidStateTransition {
                from: job.state_name().to_string(),
                to: "running".to_string(),
            });
        }

        let snapshot = (job.repo_id.clone(), job.snapshot_id.clone());
        match self.active_snapshots.entry(snapshot.clone()) {
            Entry::Occupied(holder) => {
                return Err(OrchestratorError::SnapshotBusy {
                    repo_id: snapshot.0,
                    snapshot_id: snapshot.1,
                    job_id: holder.get().to_string(),
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(id);
            }
        }

        let handle = Arc::new(RunHandle::default());
        self.running.insert(id, Arc::clone(&handle));
        let guard = RunGuard {
            orchestrator: self,
            snapshot,
            job_id: id,
        };

        let mut sm = JobStateMachine::new(job);
        sm.start(self.config.execution.worker_id.clone())?;
        self.jobs.update(sm.job()).await?;

        Ok((sm, guard, handle))
    }

    /// Execute a queued job to a terminal state (main entry point)
    pub async fn run_job(&self, id: JobId) -> Result<PipelineResult> {
        let start_time = Instant::now();
        let (mut sm, _guard, handle) = self.start_job(id).await?;

        info!(
            job_id = %id,
            repo_id = %sm.job().repo_id,
            snapshot_id = %sm.job().snapshot_id,
            "Starting job"
        );

        let mut result = PipelineResult::new(id);
        let outcome = match self.execute(&mut sm, &handle, &mut result).await {
            Ok(prepared) => self.persist_index(sm.job(), &prepared, &result).await,
            Err(abort) => Err(abort),
        };
        result.duration_ms = start_time.elapsed().as_millis() as u64;

        match outcome {
            Ok(()) => {
                sm.complete(result.files_processed)?;
                info!(
                    job_id = %id,
                    executed = result.executed.len(),
                    skipped = result.skipped.len(),
                    files_processed = result.files_processed,
                    duration_ms = result.duration_ms,
                    "Job completed"
                );
            }
            Err(Abort::Failed(error)) => {
                if error.category == ErrorCategory::Infrastructure {
                    error!(
                        job_id = %id,
                        alarm = true,
                        stage = ?error.stage,
                        cache_key = ?error.cache_key,
                        "Job failed on infrastructure: {}",
                        error.message
                    );
                } else {
                    error!(
                        job_id = %id,
                        category = %error.category,
                        stage = ?error.stage,
                        "Job failed: {}",
                        error.message
                    );
                }
                result.error = Some(error.clone());
                sm.fail(error)?;
            }
            Err(Abort::Cancelled(reason)) => {
                info!(job_id = %id, reason = %reason, "Job cancelled");
                sm.cancel(reason)?;
            }
        }

        self.jobs.update(sm.job()).await?;
        result.status = sm.job().status();
        Ok(result)
    }

    /// Resolve the job's dependency index and affected set
    async fn prepare_index(
        &self,
        job: &Job,
    ) -> std::result::Result<PreparedIndex, Abort> {
        if let Some(index) = self.indexes.get(&job.repo_id) {
            return Ok(PreparedIndex::restored(job, index));
        }

        // No in-memory index: incremental jobs load the previous snapshot's,
        // full jobs reuse their own snapshot's if it exists.
        let source_snapshot = match (&job.changed_files, &job.previous_snapshot_id) {
            (Some(_), Some(previous)) => Some(previous.as_str()),
            (Some(_), None) => None,
            (None, _) => Some(job.snapshot_id.as_str()),
        };

        if let Some(snapshot) = source_snapshot {
            let key = CacheKey::new(INDEX_STAGE, job.repo_id.clone(), snapshot);
            match self.store.read(&key).await {
                Ok(Some(bytes)) => match ReverseDependencyIndex::import(&bytes) {
                    Ok(index) => {
                        info!(
                            job_id = %job.id,
                            cache_key = %key,
                            edges = index.edge_count(),
                            "Dependency index loaded from checkpoint"
                        );
                        let index = self.indexes.get_or_insert(job.repo_id.clone(), index);
                        return Ok(PreparedIndex::restored(job, index));
                    }
                    Err(e) => warn!(cache_key = %key, "Dependency index unreadable: {}", e),
                },
                Ok(None) => {}
                Err(e) => warn!(cache_key = %key, "Dependency index unreadable: {}", e),
            }
        }

        if !job.is_incremental() {
            return Ok(PreparedIndex::fresh(self.indexes.get_or_create(&job.repo_id)));
        }

        match self.config.incremental.on_missing_index {
            MissingIndexPolicy::Fail => {
                let e = OrchestratorError::DependencyIndexUnavailable(format!(
                    "{} (previous snapshot {})",
                    job.repo_id,
                    job.previous_snapshot_id.as_deref().unwrap_or("none")
                ));
                Err(Abort::Failed(JobError::new(e.to_string(), e.category())))
            }
            MissingIndexPolicy::FullRebuild => {
                warn!(
                    job_id = %job.id,
                    repo_id = %job.repo_id,
                    "No dependency index; running full rebuild as configured"
                );
                Ok(PreparedIndex::fresh(self.indexes.get_or_create(&job.repo_id)))
            }
        }
    }

    /// Run every phase of the plan
    async fn execute(
        &self,
        sm: &mut JobStateMachine,
        handle: &RunHandle,
        result: &mut PipelineResult,
    ) -> std::result::Result<PreparedIndex, Abort> {
        let job = sm.job().clone();
        let mut prepared = self.prepare_index(&job).await?;
        let affected = prepared.affected.take();

        // Builders re-run over a fresh index even with valid checkpoints,
        // otherwise the index persisted for this snapshot would be empty.
        let rebuild_index = if prepared.fresh {
            self.handlers.index_builders()
        } else {
            BTreeSet::new()
        };
        if !rebuild_index.is_empty() {
            info!(
                job_id = %job.id,
                repo_id = %job.repo_id,
                stages = ?rebuild_index,
                "No dependency index to restore; index stages will run"
            );
        }

        match &affected {
            Some(affected) => {
                info!(
                    job_id = %job.id,
                    changed = job.changed_files.as_ref().map(BTreeSet::len).unwrap_or(0),
                    affected = affected.len(),
                    "Incremental mode"
                );
                result.affected_files = Some(affected.len());
            }
            None => info!(job_id = %job.id, "Full rebuild mode"),
        }

        let files = self.files.list_files(&job.repo_id, &job.snapshot_id)?;
        debug!(job_id = %job.id, files = files.len(), "Files enumerated");

        let base_ctx = StageContext {
            job_id: job.id,
            repo_id: job.repo_id.clone(),
            snapshot_id: job.snapshot_id.clone(),
            cache_keys: CacheKeyManager::new(job.repo_id.clone(), job.snapshot_id.clone()),
            previous_snapshot_id: job.previous_snapshot_id.clone(),
            dependency_index: Arc::clone(&prepared.index),
            files: Arc::clone(&self.files),
            attempt: 1,
            cancellation: handle.token.clone(),
        };
        let base_input = StageInput {
            files,
            affected_files: affected,
            changed_files: job.changed_files.clone().filter(|_| result.affected_files.is_some()),
            dependencies: HashMap::new(),
            previous_output: None,
            config: StageConfig::default(),
        };

        let mut optional_skips: BTreeSet<StageId> = BTreeSet::new();

        for (phase_idx, phase) in self.dag.execution_order().iter().enumerate() {
            if handle.token.is_cancelled() {
                return Err(Abort::Cancelled(handle.reason()));
            }

            let mut to_execute = Vec::new();
            for stage_id in phase {
                if optional_skips.contains(stage_id) {
                    continue;
                }
                let key = base_ctx.cache_keys.key_for_stage(stage_id);
                let must_run =
                    job.invalidated_stages.contains(stage_id) || rebuild_index.contains(stage_id);
                if !must_run && self.store.is_valid(&key).await {
                    info!(job_id = %job.id, stage = %stage_id, "Stage skipped (valid checkpoint)");
                    result.skipped.push(stage_id.clone());
                    continue;
                }
                to_execute.push(stage_id.clone());
            }

            sm.enter_phase(phase_idx, to_execute.iter().cloned().collect())?;
            self.jobs.update(sm.job()).await?;

            if to_execute.is_empty() {
                debug!(job_id = %job.id, phase = phase_idx + 1, "Phase already complete");
                continue;
            }

            info!(
                job_id = %job.id,
                phase = phase_idx + 1,
                stages = to_execute.len(),
                "Dispatching phase{}",
                if to_execute.len() > 1 { " (parallel)" } else { "" }
            );

            let mut tasks: FuturesUnordered<_> = to_execute
                .iter()
                .map(|stage_id| self.run_stage(stage_id.clone(), &base_ctx, &base_input))
                .collect();

            // Siblings run to completion; no further phase starts after a failure
            let mut failure: Option<JobError> = None;
            let mut interrupted = false;
            while let Some(run) = tasks.next().await {
                for _ in 0..run.retries {
                    sm.record_retry();
                }

                match run.outcome {
                    StageOutcome::Completed(metrics) => {
                        result.merge_metrics(&run.stage, &metrics);
                        result.executed.push(run.stage.clone());
                        sm.finish_stage(&run.stage)?;
                    }
                    StageOutcome::Failed(error) if self.is_optional(&run.stage) => {
                        warn!(
                            job_id = %job.id,
                            stage = %run.stage,
                            "Optional stage failed, skipping it and its dependents: {}",
                            error.message
                        );
                        result
                            .warnings
                            .push(format!("{}: optional stage failed: {}", run.stage, error.message));
                        optional_skips.insert(run.stage.clone());
                        optional_skips.extend(self.dag.dependents_closure(&run.stage));
                        sm.finish_stage(&run.stage)?;
                    }
                    StageOutcome::Failed(error) => {
                        failure.get_or_insert(error);
                    }
                    StageOutcome::Cancelled => interrupted = true,
                }
                self.jobs.update(sm.job()).await?;
            }

            if let Some(error) = failure {
                return Err(Abort::Failed(error));
            }
            if interrupted {
                return Err(Abort::Cancelled(handle.reason()));
            }
        }

        result.skipped_optional = optional_skips.into_iter().collect();
        Ok(prepared)
    }

    fn is_optional(&self, stage: &StageId) -> bool {
        self.dag.get_stage(stage).map(|s| s.optional).unwrap_or(false)
    }

    /// Fetch inputs, then execute with timeout and retries, then persist
    async fn run_stage(
        &self,
        stage_id: StageId,
        base_ctx: &StageContext,
        base_input: &StageInput,
    ) -> StageRun {
        let mut run = StageRun {
            stage: stage_id.clone(),
            retries: 0,
            outcome: StageOutcome::Cancelled,
        };

        let (node, handler) = match (self.dag.get_stage(&stage_id), self.handlers.get(&stage_id)) {
            (Some(node), Some(handler)) => (node.clone(), handler),
            _ => {
                let e = OrchestratorError::HandlerNotRegistered(stage_id.to_string());
                run.outcome = StageOutcome::Failed(JobError::new(e.to_string(), e.category()));
                return run;
            }
        };
        let output_key = handler.output_cache_key(base_ctx);
        let fail_at = |error: JobError| {
            StageOutcome::Failed(error.at_stage(stage_id.clone(), output_key.to_string()))
        };

        let input = match self.stage_input(&node, handler.as_ref(), base_ctx, base_input).await {
            Ok(input) => input,
            Err(e) => {
                run.outcome = fail_at(JobError::new(e.to_string(), e.category()));
                return run;
            }
        };

        let policy = self.config.retry;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let mut ctx = base_ctx.clone();
            ctx.attempt = attempt;

            let error = match self.attempt_stage(&node, &handler, input.clone(), ctx).await {
                Ok(output) => {
                    // Persist failures are never retried
                    if let Err(e) = self.store.write(&output_key, base_ctx.job_id, &output.data).await {
                        run.outcome = fail_at(JobError::new(
                            format!("failed to persist checkpoint: {}", e),
                            ErrorCategory::Infrastructure,
                        ));
                        return run;
                    }

                    let mut metrics = output.metrics;
                    metrics.attempts = attempt;
                    info!(
                        job_id = %base_ctx.job_id,
                        stage = %stage_id,
                        cache_key = %output_key,
                        files = metrics.files_processed,
                        items = metrics.items_created,
                        duration_ms = metrics.duration_ms,
                        "Stage completed"
                    );
                    run.outcome = StageOutcome::Completed(metrics);
                    return run;
                }
                Err(error) => error,
            };

            let category = error.category();
            if category.is_retryable() && policy.allows_another(attempt) {
                if base_ctx.cancellation.is_cancelled() {
                    run.outcome = StageOutcome::Cancelled;
                    return run;
                }

                let delay = policy.backoff(attempt - 1);
                warn!(
                    job_id = %base_ctx.job_id,
                    stage = %stage_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Stage failed, retrying: {}",
                    error
                );
                run.retries += 1;
                tokio::time::sleep(delay).await;
                continue;
            }

            if category == ErrorCategory::Infrastructure {
                error!(
                    job_id = %base_ctx.job_id,
                    stage = %stage_id,
                    alarm = true,
                    "Stage failed on infrastructure: {}",
                    error
                );
            } else {
                error!(
                    job_id = %base_ctx.job_id,
                    stage = %stage_id,
                    category = %category,
                    attempts = attempt,
                    "Stage failed: {}",
                    error
                );
            }
            run.outcome = fail_at(JobError::new(error.to_string(), category));
            return run;
        }
    }

    /// One handler invocation, isolated in its own task
    async fn attempt_stage(
        &self,
        node: &StageNode,
        handler: &Arc<dyn StageHandler>,
        input: StageInput,
        ctx: StageContext,
    ) -> std::result::Result<crate::pipeline::StageOutput, StageError> {
        let permit = Arc::clone(&self.stage_slots)
            .acquire_owned()
            .await
            .map_err(StageError::infrastructure)?;

        let handler = Arc::clone(handler);
        let timeout_ms = node.timeout_ms;
        let joined = tokio::spawn(async move {
            let _permit = permit;
            match tokio::time::timeout(
                Duration::from_millis(timeout_ms),
                handler.execute(input, &ctx),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(StageError::Timeout(timeout_ms)),
            }
        })
        .await;

        match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(StageError::transient(format!("stage panicked: {}", e))),
            Err(e) => Err(StageError::transient(e)),
        }
    }

    /// Dependency checkpoints and the previous snapshot's output
    async fn stage_input(
        &self,
        node: &StageNode,
        handler: &dyn StageHandler,
        ctx: &StageContext,
        base: &StageInput,
    ) -> Result<StageInput> {
        let mut input = base.clone();

        for key in handler.required_cache_keys(ctx, &node.dependencies) {
            match self.store.read(&key).await? {
                Some(bytes) => {
                    debug!(stage = %node.id, cache_key = %key, bytes = bytes.len(), "Dependency loaded");
                    input.dependencies.insert(key.stage.clone(), bytes);
                }
                None => {
                    return Err(OrchestratorError::MissingDependency(format!(
                        "{} requires {}",
                        node.id, key
                    )));
                }
            }
        }

        if let Some(previous) = &ctx.previous_snapshot_id {
            let key = ctx.cache_keys.key_for_snapshot(&node.id, previous);
            match self.store.read(&key).await {
                Ok(output) => input.previous_output = output,
                Err(e) => warn!(cache_key = %key, "Previous output unreadable: {}", e),
            }
        }

        Ok(input)
    }

    /// Persist the repository index for the job's snapshot
    async fn persist_index(
        &self,
        job: &Job,
        prepared: &PreparedIndex,
        result: &PipelineResult,
    ) -> std::result::Result<(), Abort> {
        let key = CacheKey::new(INDEX_STAGE, job.repo_id.clone(), job.snapshot_id.clone());
        if result.executed.is_empty() && self.store.is_valid(&key).await {
            return Ok(());
        }

        // A fresh index that no builder filled would hide every import edge
        let builders = self.handlers.index_builders();
        if prepared.fresh
            && !builders.is_empty()
            && !result.executed.iter().any(|stage| builders.contains(stage))
        {
            warn!(
                job_id = %job.id,
                cache_key = %key,
                "Dependency index was not rebuilt; leaving it unpersisted"
            );
            return Ok(());
        }

        let index = &prepared.index;
        let infra = |e: OrchestratorError| {
            Abort::Failed(
                JobError::new(
                    format!("failed to persist dependency index: {}", e),
                    ErrorCategory::Infrastructure,
                )
                .at_stage(INDEX_STAGE, key.to_string()),
            )
        };

        let bytes = index.export().map_err(infra)?;
        self.store.write(&key, job.id, &bytes).await.map_err(infra)?;
        debug!(cache_key = %key, edges = index.edge_count(), "Dependency index persisted");
        Ok(())
    }
}

fn affected_set(job: &Job, index: &ReverseDependencyIndex) -> Option<BTreeSet<PathBuf>> {
    job.changed_files
        .as_ref()
        .map(|changed| index.compute_affected(changed.iter().cloned()).into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::StaticFileSource;
    use crate::job_store::InMemoryJobStore;
    use crate::pipeline::StageOutput;
    use crate::retry::RetryPolicy;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    struct CountingStage {
        id: StageId,
        calls: Arc<AtomicU32>,
        fail_first: u32,
        error: fn() -> StageError,
        maintains_index: bool,
    }

    impl CountingStage {
        fn ok(id: &str) -> (Self, Arc<AtomicU32>) {
            let calls = Arc::new(AtomicU32::new(0));
            (
                Self {
                    id: StageId::new(id),
                    calls: Arc::clone(&calls),
                    fail_first: 0,
                    error: || StageError::transient("unused"),
                    maintains_index: false,
                },
                calls,
            )
        }
    }

    #[async_trait]
    impl StageHandler for CountingStage {
        fn stage_id(&self) -> StageId {
            self.id.clone()
        }

        async fn execute(
            &self,
            input: StageInput,
            _ctx: &StageContext,
        ) -> std::result::Result<StageOutput, StageError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_first {
                return Err((self.error)());
            }
            Ok(StageOutput {
                data: format!("{}:{}", self.id, input.dependencies.len()).into_bytes(),
                metrics: StageMetrics {
                    files_processed: input.files_to_process().len(),
                    ..Default::default()
                },
            })
        }

        fn maintains_dependency_index(&self) -> bool {
            self.maintains_index
        }
    }

    fn linear_config(root: &std::path::Path) -> OrchestratorConfig {
        OrchestratorConfig::with_storage_root(root)
            .stages(vec![
                StageNode::new(StageId::new("a"), "A", vec![], false, 5_000),
                StageNode::new(StageId::new("b"), "B", vec![StageId::new("a")], false, 5_000),
            ])
            .retry(RetryPolicy {
                max_attempts: 3,
                base_delay_ms: 1,
                max_delay_ms: 5,
            })
    }

    async fn orchestrator(
        config: OrchestratorConfig,
        handlers: HandlerRegistry,
    ) -> Orchestrator {
        let store = CheckpointStore::open(&config.storage).await.unwrap();
        let files = StaticFileSource::new().with_file("repo", "a.py", "");
        Orchestrator::new(
            config,
            handlers,
            Arc::new(store),
            Arc::new(InMemoryJobStore::new()),
            Arc::new(files),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_missing_handler_rejected_at_startup() {
        let dir = TempDir::new().unwrap();
        let config = linear_config(dir.path());
        let store = CheckpointStore::open(&config.storage).await.unwrap();
        let (a, _) = CountingStage::ok("a");

        let result = Orchestrator::new(
            config,
            HandlerRegistry::new().with(a).unwrap(),
            Arc::new(store),
            Arc::new(InMemoryJobStore::new()),
            Arc::new(StaticFileSource::new()),
        );
        assert!(matches!(result, Err(OrchestratorError::HandlerNotRegistered(_))));
    }

    #[tokio::test]
    async fn test_run_job_passes_dependencies() {
        let dir = TempDir::new().unwrap();
        let (a, a_calls) = CountingStage::ok("a");
        let (b, b_calls) = CountingStage::ok("b");
        let orch = orchestrator(
            linear_config(dir.path()),
            HandlerRegistry::new().with(a).unwrap().with(b).unwrap(),
        )
        .await;

        let id = orch.submit(JobRequest::full("repo", "s1")).await.unwrap();
        let result = orch.run_job(id).await.unwrap();

        assert_eq!(result.status, JobStatus::Completed);
        assert_eq!(result.executed, vec![StageId::new("a"), StageId::new("b")]);
        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
        assert_eq!(b_calls.load(Ordering::SeqCst), 1);

        let b_key = CacheKey::new(StageId::new("b"), "repo", "s1");
        assert_eq!(orch.store().read(&b_key).await.unwrap().unwrap(), b"b:1".to_vec());
        let index_key = CacheKey::new(INDEX_STAGE, "repo", "s1");
        assert!(orch.store().is_valid(&index_key).await);
    }

    #[tokio::test]
    async fn test_transient_failure_retried() {
        let dir = TempDir::new().unwrap();
        let (mut a, a_calls) = CountingStage::ok("a");
        a.fail_first = 2;
        let (b, _) = CountingStage::ok("b");
        let orch = orchestrator(
            linear_config(dir.path()),
            HandlerRegistry::new().with(a).unwrap().with(b).unwrap(),
        )
        .await;

        let id = orch.submit(JobRequest::full("repo", "s1")).await.unwrap();
        let result = orch.run_job(id).await.unwrap();

        assert_eq!(result.status, JobStatus::Completed);
        assert_eq!(a_calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.stage_metrics[&StageId::new("a")].attempts, 3);
        assert_eq!(orch.job(id).await.unwrap().retry_count, 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let dir = TempDir::new().unwrap();
        let (mut a, a_calls) = CountingStage::ok("a");
        a.fail_first = u32::MAX;
        a.error = || StageError::permanent("malformed input");
        let (b, b_calls) = CountingStage::ok("b");
        let orch = orchestrator(
            linear_config(dir.path()),
            HandlerRegistry::new().with(a).unwrap().with(b).unwrap(),
        )
        .await;

        let id = orch.submit(JobRequest::full("repo", "s1")).await.unwrap();
        let result = orch.run_job(id).await.unwrap();

        assert_eq!(result.status, JobStatus::Failed);
        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
        assert_eq!(b_calls.load(Ordering::SeqCst), 0);

        let job = orch.job(id).await.unwrap();
        let error = job.last_error.unwrap();
        assert_eq!(error.category, ErrorCategory::Permanent);
        assert_eq!(error.stage, Some(StageId::new("a")));
        assert_eq!(error.cache_key.as_deref(), Some("a:repo:s1"));
        assert!(orch.requeue(id).await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_queued_job() {
        let dir = TempDir::new().unwrap();
        let (a, a_calls) = CountingStage::ok("a");
        let (b, _) = CountingStage::ok("b");
        let orch = orchestrator(
            linear_config(dir.path()),
            HandlerRegistry::new().with(a).unwrap().with(b).unwrap(),
        )
        .await;

        let id = orch.submit(JobRequest::full("repo", "s1")).await.unwrap();
        orch.cancel(id, "superseded").await.unwrap();

        assert_eq!(orch.job(id).await.unwrap().status(), JobStatus::Cancelled);
        assert!(orch.run_job(id).await.is_err());
        assert!(orch.drain().await.unwrap().is_empty());
        assert_eq!(a_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_incremental_without_index_fails_by_default() {
        let dir = TempDir::new().unwrap();
        let (a, a_calls) = CountingStage::ok("a");
        let (b, _) = CountingStage::ok("b");
        let orch = orchestrator(
            linear_config(dir.path()),
            HandlerRegistry::new().with(a).unwrap().with(b).unwrap(),
        )
        .await;

        let request = JobRequest::incremental("repo", "s2", vec!["a.py".into()], "s1");
        let id = orch.submit(request).await.unwrap();
        let result = orch.run_job(id).await.unwrap();

        assert_eq!(result.status, JobStatus::Failed);
        assert_eq!(result.error.unwrap().category, ErrorCategory::Permanent);
        assert_eq!(a_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_incremental_without_index_full_rebuild_when_configured() {
        let dir = TempDir::new().unwrap();
        let mut config = linear_config(dir.path());
        config.incremental.on_missing_index = MissingIndexPolicy::FullRebuild;
        let (a, a_calls) = CountingStage::ok("a");
        let (b, _) = CountingStage::ok("b");
        let orch = orchestrator(config, HandlerRegistry::new().with(a).unwrap().with(b).unwrap()).await;

        let request = JobRequest::incremental("repo", "s2", vec!["a.py".into()], "s1");
        let id = orch.submit(request).await.unwrap();
        let result = orch.run_job(id).await.unwrap();

        assert_eq!(result.status, JobStatus::Completed);
        assert_eq!(result.affected_files, None);
        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_lost_index_reruns_index_stage() {
        let dir = TempDir::new().unwrap();
        let (mut a, a_calls) = CountingStage::ok("a");
        a.maintains_index = true;
        let (b, b_calls) = CountingStage::ok("b");
        let orch = orchestrator(
            linear_config(dir.path()),
            HandlerRegistry::new().with(a).unwrap().with(b).unwrap(),
        )
        .await;

        let id = orch.submit(JobRequest::full("repo", "s1")).await.unwrap();
        orch.run_job(id).await.unwrap();

        // index gone from memory and disk, stage checkpoints intact
        let index_key = CacheKey::new(INDEX_STAGE, "repo", "s1");
        orch.indexes().remove("repo");
        assert!(orch.store().invalidate(&index_key).await.unwrap());

        let id = orch.submit(JobRequest::full("repo", "s1")).await.unwrap();
        let result = orch.run_job(id).await.unwrap();

        assert_eq!(result.status, JobStatus::Completed);
        assert_eq!(result.executed, vec![StageId::new("a")]);
        assert_eq!(result.skipped, vec![StageId::new("b")]);
        assert_eq!(a_calls.load(Ordering::SeqCst), 2);
        assert_eq!(b_calls.load(Ordering::SeqCst), 1);
        assert!(orch.store().is_valid(&index_key).await);
    }

    #[tokio::test]
    async fn test_unbuilt_index_not_persisted() {
        let dir = TempDir::new().unwrap();
        let mut optional_a = StageNode::new(StageId::new("a"), "A", vec![], false, 5_000);
        optional_a.optional = true;
        let config = linear_config(dir.path()).stages(vec![
            optional_a,
            StageNode::new(StageId::new("b"), "B", vec![StageId::new("a")], false, 5_000),
        ]);
        let (mut a, _) = CountingStage::ok("a");
        a.maintains_index = true;
        a.fail_first = u32::MAX;
        a.error = || StageError::permanent("malformed input");
        let (b, b_calls) = CountingStage::ok("b");
        let orch = orchestrator(config, HandlerRegistry::new().with(a).unwrap().with(b).unwrap()).await;

        let id = orch.submit(JobRequest::full("repo", "s1")).await.unwrap();
        let result = orch.run_job(id).await.unwrap();

        assert_eq!(result.status, JobStatus::Completed);
        assert_eq!(result.skipped_optional, vec![StageId::new("a"), StageId::new("b")]);
        assert_eq!(b_calls.load(Ordering::SeqCst), 0);
        assert!(!orch.store().is_valid(&CacheKey::new(INDEX_STAGE, "repo", "s1")).await);
    }
}
