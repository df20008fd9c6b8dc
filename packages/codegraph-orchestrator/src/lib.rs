/*
 * Codegraph Orchestrator - Incremental Dependency-Aware Pipeline Orchestration
 *
 * Runs code-analysis stages over repository snapshots and re-runs only the
 * work a change invalidates.
 *
 * Architecture:
 * - DAG Resolver (stage metadata → parallel phases)
 * - Reverse Dependency Index + BFS affected-set computation
 * - Durable checkpoints (WAL intent → temp file → atomic rename)
 * - Crash recovery and retention
 * - Job State Machine (in-memory or SQLite job store)
 * - Pipeline Stages (pluggable handlers, registry checked at startup)
 */

// Public modules
pub mod checkpoint;
pub mod config;
pub mod dag;
pub mod dependency_graph;
pub mod error;
pub mod files;
pub mod job;
pub mod job_store;
pub mod logging;
pub mod orchestrator;
pub mod pipeline;
pub mod retry;
pub mod stages;
pub mod wal;

// Re-exports
pub use checkpoint::{
    Checkpoint, CheckpointHeader, CheckpointStore, InvalidatedCheckpoint, PendingWrite,
    PruneReport, RecoveryReport,
};
pub use config::{ConfigError, MissingIndexPolicy, OrchestratorConfig, RetentionPolicy};
pub use dag::{CacheKey, CacheKeyManager, ExecutionPlan, PipelineDAG, StageNode};
pub use dependency_graph::{
    compute_affected_files, DependencyIndexes, FileId, ReverseDependencyIndex, INDEX_STAGE,
};
pub use error::{ErrorCategory, OrchestratorError, Result, StageError};
pub use files::{DirectoryFileSource, FileSource, StaticFileSource};
pub use job::{Job, JobError, JobId, JobRequest, JobState, JobStateMachine, JobStatus, StageId};
pub use job_store::{InMemoryJobStore, JobStore, SqliteJobStore};
pub use orchestrator::{Orchestrator, PipelineResult, StartupRecovery};
pub use pipeline::{
    HandlerRegistry, StageConfig, StageContext, StageHandler, StageInput, StageMetrics,
    StageOutput,
};
pub use retry::RetryPolicy;
pub use stages::{ImportScanOutput, ImportScanStage};
