//! Agent configuration
//!
//! Every field is optional in the JSON file; missing ones fall back to the
//! built-in defaults.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::engine::retry::RetryPolicy;
use crate::resync::UnwantedPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub engine: EngineConfig,
    pub dump: DumpConfig,
    pub resync: ResyncConfig,
    pub unwanted: UnwantedPolicies,
}

impl AgentConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.max_parallel_ops == 0 {
            return Err(ConfigError::Invalid(
                "engine.max_parallel_ops must be at least 1".into(),
            ));
        }
        if self.dump.max_workers == 0 {
            return Err(ConfigError::Invalid("dump.max_workers must be at least 1".into()));
        }
        if self.dump.min_units_per_worker == 0 {
            return Err(ConfigError::Invalid(
                "dump.min_units_per_worker must be at least 1".into(),
            ));
        }
        if self.resync.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "resync.interval_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on CRUD operations running at once.
    pub max_parallel_ops: usize,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_ops: 8,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DumpConfig {
    /// Upper bound on dump workers per descriptor.
    pub max_workers: usize,
    /// Units a worker should have before another worker is worth starting.
    pub min_units_per_worker: usize,
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            max_workers: 10,
            min_units_per_worker: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResyncConfig {
    pub interval_secs: u64,
    /// Run a full resync as soon as the agent loop starts.
    pub on_startup: bool,
}

impl ResyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for ResyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            on_startup: true,
        }
    }
}

/// What to do with discovered objects nobody asked for, per descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnwantedPolicies {
    pub default: UnwantedPolicy,
    pub descriptors: HashMap<String, UnwantedPolicy>,
}

impl UnwantedPolicies {
    pub fn policy_for(&self, descriptor: &str) -> UnwantedPolicy {
        self.descriptors
            .get(descriptor)
            .copied()
            .unwrap_or(self.default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::retry::BackoffStrategy;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.engine.max_parallel_ops, 8);
        assert_eq!(config.dump.max_workers, 10);
        assert_eq!(config.dump.min_units_per_worker, 3);
        assert_eq!(config.resync.interval(), Duration::from_secs(60));
        assert_eq!(config.unwanted.policy_for("linux-route"), UnwantedPolicy::Remove);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_partial() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "engine": {{"max_parallel_ops": 2, "retry": {{"strategy": "fixed"}}}},
                "unwanted": {{"descriptors": {{"linux-route": "ignore"}}}}
            }}"#
        )
        .unwrap();

        let config = AgentConfig::from_file(file.path()).unwrap();
        assert_eq!(config.engine.max_parallel_ops, 2);
        assert_eq!(config.engine.retry.strategy, BackoffStrategy::Fixed);
        assert_eq!(config.dump, DumpConfig::default());
        assert_eq!(config.unwanted.policy_for("linux-route"), UnwantedPolicy::Ignore);
        assert_eq!(config.unwanted.policy_for("vpp-punt-to-host"), UnwantedPolicy::Remove);
    }

    #[test]
    fn test_from_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            AgentConfig::from_file(dir.path().join("missing.json")),
            Err(ConfigError::Read { .. })
        ));

        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            AgentConfig::from_file(&path),
            Err(ConfigError::Parse { .. })
        ));

        std::fs::write(&path, r#"{"dump": {"max_workers": 0}}"#).unwrap();
        assert!(matches!(
            AgentConfig::from_file(&path),
            Err(ConfigError::Invalid(_))
        ));
    }
}
