//! Configuration I/O (YAML loading)

use super::error::{ConfigError, ConfigResult};
use super::validation::Validatable;
use super::{
    ExecutionConfig, FileConfig, IncrementalConfig, OrchestratorConfig, RetentionPolicy,
    StorageConfig,
};
use crate::dag::StageNode;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const SUPPORTED_VERSIONS: &[u32] = &[1];

/// YAML Schema v1
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFileV1 {
    /// Schema version (always 1 for v1)
    pub version: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention: Option<RetentionPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incremental: Option<IncrementalConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<FileConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stages: Option<Vec<StageNode>>,
}

impl From<ConfigFileV1> for OrchestratorConfig {
    fn from(file: ConfigFileV1) -> Self {
        Self {
            storage: file.storage.unwrap_or_default(),
            retry: file.retry.unwrap_or_default(),
            retention: file.retention.unwrap_or_default(),
            execution: file.execution.unwrap_or_default(),
            incremental: file.incremental.unwrap_or_default(),
            files: file.files.unwrap_or_default(),
            stages: file.stages,
        }
    }
}

impl OrchestratorConfig {
    /// Load from a YAML file
    pub fn from_yaml(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> ConfigResult<Self> {
        let value: serde_yaml::Value = serde_yaml::from_str(content)?;

        let version = match value.get("version") {
            Some(v) => v
                .as_u64()
                .ok_or_else(|| ConfigError::Custom("'version' must be an integer".to_string()))?
                as u32,
            None => return Err(ConfigError::MissingVersion),
        };

        if !SUPPORTED_VERSIONS.contains(&version) {
            return Err(ConfigError::UnsupportedVersion {
                found: version,
                supported: SUPPORTED_VERSIONS.to_vec(),
            });
        }

        let file: ConfigFileV1 = serde_yaml::from_value(value)?;
        let config = OrchestratorConfig::from(file);
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> ConfigResult<String> {
        let file = ConfigFileV1 {
            version: 1,
            storage: Some(self.storage.clone()),
            retry: Some(self.retry),
            retention: Some(self.retention.clone()),
            execution: Some(self.execution.clone()),
            incremental: Some(self.incremental.clone()),
            files: Some(self.files.clone()),
            stages: self.stages.clone(),
        };
        Ok(serde_yaml::to_string(&file)?)
    }
}
