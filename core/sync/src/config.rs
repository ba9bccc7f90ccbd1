//! Sync engine configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

use syncbridge_common::{Error, Result};

use crate::conflict::{EntityPolicy, PolicyMap};
use crate::queue::QueueConfig;
use crate::retry::RetryConfig;
use crate::scheduler::SyncMode;

/// Declared entity types and their conflict policies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Every entity type the engine may see.
    pub entity_types: Vec<String>,
    /// Conflict policy per declared entity type.
    pub policies: BTreeMap<String, EntityPolicy>,
}

/// Configuration for the sync orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Number of concurrent sync workers.
    pub worker_count: usize,
    /// Maximum local operations drained per sync cycle.
    pub batch_size: usize,
    /// Backoff and attempt ceiling for transient failures.
    pub retry: RetryConfig,
    /// Scheduling round parameters.
    pub queue: QueueConfig,
    /// Remote polling mode.
    pub mode: SyncMode,
    pub policies: PolicyConfig,
    /// Buffered outcomes per local subscriber.
    pub broadcast_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            batch_size: 100,
            retry: RetryConfig::default(),
            queue: QueueConfig::default(),
            mode: SyncMode::Manual,
            policies: PolicyConfig::default(),
            broadcast_capacity: 64,
        }
    }
}

impl SyncConfig {
    /// Read a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_json(&raw)?;
        debug!("Loaded sync config from {}", path.as_ref().display());
        Ok(config)
    }

    /// Parse from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Check consistency and build the policy map.
    ///
    /// Every declared entity type must have a policy and every policy must
    /// name a declared type, so a missing strategy is caught here rather
    /// than at the first conflict.
    ///
    /// # Errors
    /// - `Config` describing the first inconsistency found
    pub fn validate(&self) -> Result<PolicyMap> {
        if self.worker_count == 0 {
            return Err(Error::Config("worker_count must be at least 1".to_string()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".to_string()));
        }
        if self.broadcast_capacity == 0 {
            return Err(Error::Config(
                "broadcast_capacity must be at least 1".to_string(),
            ));
        }
        self.retry.validate()?;
        self.queue.validate()?;
        self.mode.validate()?;

        let mut map = PolicyMap::new();
        for entity_type in &self.policies.entity_types {
            if entity_type.is_empty() {
                return Err(Error::Config("Entity type names cannot be empty".to_string()));
            }
            let policy = self.policies.policies.get(entity_type).ok_or_else(|| {
                Error::Config(format!(
                    "Entity type '{}' has no conflict policy",
                    entity_type
                ))
            })?;
            map.insert(entity_type.clone(), *policy);
        }

        for entity_type in self.policies.policies.keys() {
            if !self.policies.entity_types.contains(entity_type) {
                return Err(Error::Config(format!(
                    "Conflict policy for undeclared entity type '{}'",
                    entity_type
                )));
            }
        }

        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::ConflictStrategy;
    use std::time::Duration;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"{
        "worker_count": 2,
        "retry": { "max_attempts": 5 },
        "mode": { "Periodic": { "interval": { "secs": 30, "nanos": 0 } } },
        "policies": {
            "entity_types": ["assignment", "topic"],
            "policies": {
                "assignment": { "strategy": "PreferSystemA" },
                "topic": { "strategy": "MergePreferSystemB", "delete_wins": false }
            }
        }
    }"#;

    #[test]
    fn test_default_is_valid() {
        let config = SyncConfig::default();
        assert!(config.validate().unwrap().is_empty());
    }

    #[test]
    fn test_parse_and_validate() {
        let config = SyncConfig::from_json(SAMPLE).unwrap();
        assert_eq!(config.worker_count, 2);
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(
            config.mode,
            SyncMode::Periodic {
                interval: Duration::from_secs(30)
            }
        );

        let policies = config.validate().unwrap();
        assert_eq!(policies.len(), 2);
        let topic = policies.get("topic").unwrap();
        assert_eq!(topic.strategy, ConflictStrategy::MergePreferSystemB);
        assert!(!topic.delete_wins);
        assert!(policies.get("assignment").unwrap().delete_wins);
    }

    #[test]
    fn test_declared_type_without_policy_fails() {
        let mut config = SyncConfig::default();
        config.policies.entity_types.push("course".to_string());
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_policy_for_undeclared_type_fails() {
        let mut config = SyncConfig::default();
        config.policies.policies.insert(
            "course".to_string(),
            EntityPolicy::new(ConflictStrategy::Manual),
        );
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_zero_workers_fails() {
        let config = SyncConfig {
            worker_count: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("sync.json");
        let original = SyncConfig::from_json(SAMPLE).unwrap();
        std::fs::write(&path, original.to_json().unwrap()).unwrap();

        assert_eq!(SyncConfig::load(&path).unwrap(), original);
        assert!(matches!(
            SyncConfig::load(temp.path().join("missing.json")),
            Err(Error::Io(_))
        ));
    }
}
