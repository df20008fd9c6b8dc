//! Configuration validation

use super::error::{validate_identifier, ConfigError, ConfigResult};
use super::{ExecutionConfig, FileConfig, OrchestratorConfig, RetentionPolicy, StorageConfig};
use crate::dag::{CacheKey, StageNode};
use crate::retry::RetryPolicy;
use std::collections::HashSet;

/// Trait for validatable configuration objects
pub trait Validatable {
    /// Returns `Ok(())` if valid, `Err(ConfigError)` with details if invalid.
    fn validate(&self) -> ConfigResult<()>;

    /// Get the configuration name for error messages
    fn config_name(&self) -> &'static str {
        "Config"
    }
}

impl<T: Validatable> Validatable for Vec<T> {
    fn validate(&self) -> ConfigResult<()> {
        for config in self {
            config.validate()?;
        }
        Ok(())
    }
}

impl<T: Validatable> Validatable for Option<T> {
    fn validate(&self) -> ConfigResult<()> {
        if let Some(config) = self {
            config.validate()?;
        }
        Ok(())
    }
}

impl Validatable for StorageConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.root.as_os_str().is_empty() {
            return Err(ConfigError::Custom("storage.root must not be empty".to_string()));
        }
        Ok(())
    }

    fn config_name(&self) -> &'static str {
        "storage"
    }
}

impl Validatable for RetryPolicy {
    fn validate(&self) -> ConfigResult<()> {
        if !(1..=20).contains(&self.max_attempts) {
            return Err(ConfigError::range_with_hint(
                "retry.max_attempts",
                self.max_attempts,
                1,
                20,
                "Use 1 to disable retries",
            ));
        }

        if self.base_delay_ms > self.max_delay_ms {
            return Err(ConfigError::range_with_hint(
                "retry.base_delay_ms",
                self.base_delay_ms,
                0,
                self.max_delay_ms,
                "base_delay_ms must not exceed max_delay_ms",
            ));
        }
        Ok(())
    }

    fn config_name(&self) -> &'static str {
        "retry"
    }
}

impl Validatable for RetentionPolicy {
    fn validate(&self) -> ConfigResult<()> {
        if !(1..=10_000).contains(&self.keep_last) {
            return Err(ConfigError::range_with_hint(
                "retention.keep_last",
                self.keep_last,
                1,
                10_000,
                "At least the newest checkpoint of each lineage is always kept",
            ));
        }

        for key in &self.pinned {
            CacheKey::parse(key).map_err(|_| {
                ConfigError::Custom(format!(
                    "retention.pinned entry '{}' is not a stage:repository:snapshot key",
                    key
                ))
            })?;
        }
        Ok(())
    }

    fn config_name(&self) -> &'static str {
        "retention"
    }
}

impl Validatable for ExecutionConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.max_concurrent_stages > 1024 {
            return Err(ConfigError::range_with_hint(
                "execution.max_concurrent_stages",
                self.max_concurrent_stages,
                0,
                1024,
                "Use 0 for one slot per CPU",
            ));
        }

        if self.worker_id.trim().is_empty() {
            return Err(ConfigError::Custom(
                "execution.worker_id must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    fn config_name(&self) -> &'static str {
        "execution"
    }
}

impl Validatable for FileConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.extensions.iter().any(|e| e.trim_start_matches('.').is_empty()) {
            return Err(ConfigError::Custom(
                "files.extensions must not contain empty entries".to_string(),
            ));
        }
        Ok(())
    }

    fn config_name(&self) -> &'static str {
        "files"
    }
}

impl Validatable for StageNode {
    fn validate(&self) -> ConfigResult<()> {
        validate_identifier("stage id", self.id.as_str())?;

        if self.timeout_ms == 0 {
            return Err(ConfigError::range_with_hint(
                format!("stages.{}.timeout_ms", self.id),
                0,
                1,
                u64::MAX,
                "Timeouts are per attempt, in milliseconds",
            ));
        }
        Ok(())
    }

    fn config_name(&self) -> &'static str {
        "stage"
    }
}

impl Validatable for OrchestratorConfig {
    fn validate(&self) -> ConfigResult<()> {
        self.storage.validate()?;
        self.retry.validate()?;
        self.retention.validate()?;
        self.execution.validate()?;
        self.files.validate()?;

        if let Some(stages) = &self.stages {
            stages.validate()?;

            let declared: HashSet<_> = stages.iter().map(|s| &s.id).collect();
            for stage in stages {
                if let Some(dep) = stage.dependencies.iter().find(|d| !declared.contains(d)) {
                    return Err(ConfigError::UnknownStage {
                        stage: stage.id.to_string(),
                        dependency: dep.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    fn config_name(&self) -> &'static str {
        "orchestrator"
    }
}
