//! Orchestrator configuration
//!
//! Programmatic defaults, YAML v1 loading (`io`), environment overrides and
//! per-section validation (`validation`).

pub mod error;
pub mod io;
pub mod validation;

pub use error::{ConfigError, ConfigResult};
pub use validation::Validatable;

use crate::dag::{PipelineDAG, StageNode};
use crate::error::Result;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const ENV_STORAGE_ROOT: &str = "CODEGRAPH_STORAGE_ROOT";
pub const ENV_MAX_ATTEMPTS: &str = "CODEGRAPH_MAX_ATTEMPTS";

/// Checkpoint store location
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    pub root: PathBuf,
    /// fsync payloads, WAL appends and directory entries
    pub fsync: bool,
    /// Settled WAL records before the log is compacted (0 = only at recovery)
    pub wal_compact_after: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".codegraph/orchestrator"),
            fsync: true,
            wal_compact_after: crate::wal::DEFAULT_COMPACT_AFTER,
        }
    }
}

/// Checkpoint retention
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetentionPolicy {
    /// Snapshots kept per (repository, stage) lineage
    pub keep_last: usize,
    pub max_age_secs: Option<u64>,
    /// Cache keys never pruned
    pub pinned: Vec<String>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            keep_last: 3,
            max_age_secs: None,
            pinned: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutionConfig {
    /// 0 = number of CPUs
    pub max_concurrent_stages: usize,
    pub worker_id: String,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_stages: 0,
            worker_id: format!("worker-{}", std::process::id()),
        }
    }
}

impl ExecutionConfig {
    pub fn effective_concurrency(&self) -> usize {
        if self.max_concurrent_stages == 0 {
            num_cpus::get().max(1)
        } else {
            self.max_concurrent_stages
        }
    }
}

/// What an incremental job does when no dependency index exists for its repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingIndexPolicy {
    #[default]
    Fail,
    FullRebuild,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IncrementalConfig {
    pub on_missing_index: MissingIndexPolicy,
}

/// Source files considered by the directory file source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub extensions: Vec<String>,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            extensions: vec!["py".to_string()],
        }
    }
}

impl FileConfig {
    pub fn matches(&self, path: &std::path::Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|ext| {
                self.extensions
                    .iter()
                    .any(|wanted| wanted.trim_start_matches('.') == ext)
            })
            .unwrap_or(false)
    }
}

/// Complete orchestrator configuration
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrchestratorConfig {
    pub storage: StorageConfig,
    pub retry: RetryPolicy,
    pub retention: RetentionPolicy,
    pub execution: ExecutionConfig,
    pub incremental: IncrementalConfig,
    pub files: FileConfig,
    /// `None` = default pipeline
    pub stages: Option<Vec<StageNode>>,
}

impl OrchestratorConfig {
    /// Defaults with checkpoints stored under `root`
    pub fn with_storage_root(root: impl Into<PathBuf>) -> Self {
        let mut config = Self::default();
        config.storage.root = root.into();
        config
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn stages(mut self, stages: Vec<StageNode>) -> Self {
        self.stages = Some(stages);
        self
    }

    pub fn max_concurrent_stages(mut self, n: usize) -> Self {
        self.execution.max_concurrent_stages = n;
        self
    }

    /// Apply `CODEGRAPH_*` overrides from the process environment
    pub fn apply_env(self) -> ConfigResult<Self> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    pub fn apply_env_from<F>(mut self, lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup(ENV_STORAGE_ROOT) {
            self.storage.root = PathBuf::from(root);
        }

        if let Some(raw) = lookup(ENV_MAX_ATTEMPTS) {
            self.retry.max_attempts = raw.trim().parse().map_err(|_| {
                ConfigError::Custom(format!("{} must be an integer, got '{}'", ENV_MAX_ATTEMPTS, raw))
            })?;
        }

        self.validate()?;
        Ok(self)
    }

    /// Resolve the stage DAG (declared stages or the default pipeline)
    pub fn build_dag(&self) -> Result<PipelineDAG> {
        match &self.stages {
            Some(stages) => PipelineDAG::new(stages.clone()),
            None => PipelineDAG::default_pipeline(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::StageId;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = OrchestratorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.incremental.on_missing_index, MissingIndexPolicy::Fail);
        assert!(config.execution.effective_concurrency() >= 1);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_STORAGE_ROOT, "/var/lib/codegraph"),
            (ENV_MAX_ATTEMPTS, "5"),
        ]
        .into_iter()
        .collect();

        let config = OrchestratorConfig::default()
            .apply_env_from(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.storage.root, PathBuf::from("/var/lib/codegraph"));
        assert_eq!(config.retry.max_attempts, 5);
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let result = OrchestratorConfig::default().apply_env_from(|k| {
            (k == ENV_MAX_ATTEMPTS).then(|| "lots".to_string())
        });
        assert!(matches!(result, Err(ConfigError::Custom(_))));
    }

    #[test]
    fn test_build_dag_default() {
        let dag = OrchestratorConfig::default().build_dag().unwrap();
        assert_eq!(dag.len(), 4);
        assert!(dag.get_stage(&StageId::VECTOR).unwrap().optional);
    }

    #[test]
    fn test_file_extension_match() {
        let files = FileConfig {
            extensions: vec![".py".to_string(), "pyi".to_string()],
        };
        assert!(files.matches(std::path::Path::new("pkg/mod.py")));
        assert!(files.matches(std::path::Path::new("pkg/mod.pyi")));
        assert!(!files.matches(std::path::Path::new("README")));
    }
}
