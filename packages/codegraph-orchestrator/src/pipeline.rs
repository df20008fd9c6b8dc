use crate::dag::{CacheKey, CacheKeyManager, PipelineDAG};
use crate::dependency_graph::ReverseDependencyIndex;
use crate::error::{OrchestratorError, Result, StageError};
use crate::files::FileSource;
use crate::job::StageId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Stage context passed to handlers
#[derive(Clone)]
pub struct StageContext {
    pub job_id: Uuid,
    pub repo_id: String,
    pub snapshot_id: String,
    pub cache_keys: CacheKeyManager,
    /// Previous snapshot ID (for incremental delta)
    pub previous_snapshot_id: Option<String>,
    /// This repository's reverse dependency index
    pub dependency_index: Arc<ReverseDependencyIndex>,
    pub files: Arc<dyn FileSource>,
    /// 1-based attempt number
    pub attempt: u32,
    /// Fires when the job is cancelled; handlers may stop early
    pub cancellation: CancellationToken,
}

/// Stage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    pub parallel_workers: usize,
    pub batch_size: usize,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            parallel_workers: (num_cpus::get() * 3 / 4).max(1), // 75% of cores
            batch_size: 100,
        }
    }
}

/// Stage input
#[derive(Debug, Clone, Default)]
pub struct StageInput {
    /// All files of the snapshot
    pub files: Vec<PathBuf>,
    /// Incremental mode: changed files plus everything that transitively imports them
    pub affected_files: Option<BTreeSet<PathBuf>>,
    /// Changed files that triggered the update
    pub changed_files: Option<BTreeSet<PathBuf>>,
    /// Raw checkpoint bytes of each declared dependency
    pub dependencies: HashMap<StageId, Vec<u8>>,
    /// This stage's own output for the previous snapshot, if any
    pub previous_output: Option<Vec<u8>>,
    pub config: StageConfig,
}

impl StageInput {
    pub fn is_incremental(&self) -> bool {
        self.affected_files.is_some()
    }

    /// Files this stage should (re)process
    pub fn files_to_process(&self) -> Vec<PathBuf> {
        match &self.affected_files {
            Some(affected) => self
                .files
                .iter()
                .filter(|f| affected.contains(*f))
                .cloned()
                .collect(),
            None => self.files.clone(),
        }
    }

    pub fn dependency(&self, stage: &StageId) -> Option<&[u8]> {
        self.dependencies.get(stage).map(Vec::as_slice)
    }
}

/// Stage output
#[derive(Debug, Clone)]
pub struct StageOutput {
    /// Serialized output, persisted as the stage's checkpoint
    pub data: Vec<u8>,
    pub metrics: StageMetrics,
}

/// Stage metrics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageMetrics {
    pub files_processed: usize,
    pub items_created: usize,
    pub duration_ms: u64,
    /// Attempts used, set by the orchestrator
    pub attempts: u32,
    pub warnings: Vec<String>,
}

/// Stage handler trait (pluggable stages)
#[async_trait]
pub trait StageHandler: Send + Sync {
    /// Stage identifier
    fn stage_id(&self) -> StageId;

    /// Execute stage
    async fn execute(
        &self,
        input: StageInput,
        ctx: &StageContext,
    ) -> std::result::Result<StageOutput, StageError>;

    /// Checkpoints fetched into `StageInput::dependencies`
    fn required_cache_keys(&self, ctx: &StageContext, declared: &[StageId]) -> Vec<CacheKey> {
        declared
            .iter()
            .map(|stage| ctx.cache_keys.key_for_stage(stage))
            .collect()
    }

    /// Output cache key
    fn output_cache_key(&self, ctx: &StageContext) -> CacheKey {
        ctx.cache_keys.key_for_stage(&self.stage_id())
    }

    /// Whether this stage records edges in `StageContext::dependency_index`.
    ///
    /// Such stages re-run whenever the repository's index could not be
    /// restored, even if their own checkpoint is valid.
    fn maintains_dependency_index(&self) -> bool {
        false
    }
}

/// Stage id → handler, checked against the DAG once at startup
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<StageId, Arc<dyn StageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn StageHandler>) -> Result<()> {
        let id = handler.stage_id();
        if self.handlers.contains_key(&id) {
            return Err(OrchestratorError::Other(anyhow::anyhow!(
                "handler for stage {} registered twice",
                id
            )));
        }
        self.handlers.insert(id, handler);
        Ok(())
    }

    pub fn with(mut self, handler: impl StageHandler + 'static) -> Result<Self> {
        self.register(Arc::new(handler))?;
        Ok(self)
    }

    pub fn get(&self, stage: &StageId) -> Option<Arc<dyn StageHandler>> {
        self.handlers.get(stage).cloned()
    }

    /// Stages whose handlers build the dependency index
    pub fn index_builders(&self) -> BTreeSet<StageId> {
        self.handlers
            .iter()
            .filter(|(_, handler)| handler.maintains_dependency_index())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Every DAG stage has a handler and every handler has a stage.
    pub fn validate_against(&self, dag: &PipelineDAG) -> Result<()> {
        let mut missing: Vec<&StageId> = dag
            .stage_ids()
            .filter(|id| !self.handlers.contains_key(*id))
            .collect();
        missing.sort();
        if let Some(first) = missing.first() {
            return Err(OrchestratorError::HandlerNotRegistered(first.to_string()));
        }

        let mut unknown: Vec<&StageId> = self
            .handlers
            .keys()
            .filter(|id| dag.get_stage(id).is_none())
            .collect();
        unknown.sort();
        if let Some(first) = unknown.first() {
            return Err(OrchestratorError::StageNotFound(first.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::StageNode;
    use crate::files::StaticFileSource;

    struct MockStage {
        id: StageId,
    }

    #[async_trait]
    impl StageHandler for MockStage {
        fn stage_id(&self) -> StageId {
            self.id.clone()
        }

        async fn execute(
            &self,
            input: StageInput,
            _ctx: &StageContext,
        ) -> std::result::Result<StageOutput, StageError> {
            Ok(StageOutput {
                data: vec![1, 2, 3],
                metrics: StageMetrics {
                    files_processed: input.files_to_process().len(),
                    items_created: 10,
                    ..Default::default()
                },
            })
        }
    }

    fn context() -> StageContext {
        StageContext {
            job_id: Uuid::new_v4(),
            repo_id: "repo1".to_string(),
            snapshot_id: "snap1".to_string(),
            cache_keys: CacheKeyManager::new("repo1".to_string(), "snap1".to_string()),
            previous_snapshot_id: None,
            dependency_index: Arc::new(ReverseDependencyIndex::new()),
            files: Arc::new(StaticFileSource::new()),
            attempt: 1,
            cancellation: CancellationToken::new(),
        }
    }

    #[test]
    fn test_stage_config_default() {
        let config = StageConfig::default();
        assert!(config.parallel_workers > 0);
        assert_eq!(config.batch_size, 100);
    }

    #[test]
    fn test_files_to_process_incremental() {
        let input = StageInput {
            files: vec![PathBuf::from("a.py"), PathBuf::from("b.py"), PathBuf::from("c.py")],
            affected_files: Some(BTreeSet::from([PathBuf::from("b.py"), PathBuf::from("gone.py")])),
            ..Default::default()
        };
        assert!(input.is_incremental());
        assert_eq!(input.files_to_process(), vec![PathBuf::from("b.py")]);
    }

    #[tokio::test]
    async fn test_mock_stage_execution() {
        let stage = MockStage { id: StageId::IR };
        let input = StageInput {
            files: vec![PathBuf::from("test.py")],
            ..Default::default()
        };

        let output = stage.execute(input, &context()).await.unwrap();
        assert_eq!(output.metrics.files_processed, 1);
        assert_eq!(output.data, vec![1, 2, 3]);
    }

    #[test]
    fn test_default_cache_keys() {
        let stage = MockStage { id: StageId::CHUNKS };
        let ctx = context();

        assert_eq!(stage.output_cache_key(&ctx).to_string(), "chunks:repo1:snap1");
        let deps = stage.required_cache_keys(&ctx, &[StageId::IR]);
        assert_eq!(deps[0].to_string(), "ir:repo1:snap1");
    }

    #[test]
    fn test_registry_validation() {
        let dag = PipelineDAG::new(vec![
            StageNode::new(StageId::new("a"), "A", vec![], false, 1_000),
            StageNode::new(StageId::new("b"), "B", vec![StageId::new("a")], false, 1_000),
        ])
        .unwrap();

        let partial = HandlerRegistry::new()
            .with(MockStage { id: StageId::new("a") })
            .unwrap();
        assert!(matches!(
            partial.validate_against(&dag),
            Err(OrchestratorError::HandlerNotRegistered(ref s)) if s == "b"
        ));

        let full = partial.with(MockStage { id: StageId::new("b") }).unwrap();
        assert!(full.validate_against(&dag).is_ok());

        let extra = full.with(MockStage { id: StageId::new("z") }).unwrap();
        assert!(matches!(
            extra.validate_against(&dag),
            Err(OrchestratorError::StageNotFound(_))
        ));
    }

    struct IndexingStage;

    #[async_trait]
    impl StageHandler for IndexingStage {
        fn stage_id(&self) -> StageId {
            StageId::IR
        }

        async fn execute(
            &self,
            _input: StageInput,
            _ctx: &StageContext,
        ) -> std::result::Result<StageOutput, StageError> {
            Ok(StageOutput {
                data: Vec::new(),
                metrics: StageMetrics::default(),
            })
        }

        fn maintains_dependency_index(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_index_builders() {
        let registry = HandlerRegistry::new()
            .with(IndexingStage)
            .unwrap()
            .with(MockStage { id: StageId::CHUNKS })
            .unwrap();

        assert_eq!(registry.index_builders(), BTreeSet::from([StageId::IR]));
        assert!(HandlerRegistry::new().index_builders().is_empty());
    }

    #[test]
    fn test_duplicate_handler_rejected() {
        let registry = HandlerRegistry::new()
            .with(MockStage { id: StageId::IR })
            .unwrap();
        assert!(registry.with(MockStage { id: StageId::IR }).is_err());
    }
}
