use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::MeshError;
use crate::signing::VerificationPolicy;

/// Per-node tuning, stored as `node.toml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Directory for the sled store; in-memory when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    /// Attempts for a write or pull that hits `TransactionConflict`
    pub max_txn_retries: u32,
    /// Sleep between conflict retries
    pub retry_backoff_ms: u64,
    /// Event bus buffer per subscriber
    pub event_capacity: usize,
    /// Timeout for a single peer request
    pub request_timeout_ms: u64,
    /// Interval of the replicator retry task
    pub replicator_retry_interval_ms: u64,
    /// Give up on a failed replicator push after this many retries
    pub replicator_retry_attempts: u32,
    /// Bound of the inbound request queue
    pub inbox_capacity: usize,
    /// Check of inbound envelope signatures
    pub verification: VerificationPolicy,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            max_txn_retries: 5,
            retry_backoff_ms: 100,
            event_capacity: 1024,
            request_timeout_ms: 5000,
            replicator_retry_interval_ms: 500,
            replicator_retry_attempts: 10,
            inbox_capacity: 256,
            verification: VerificationPolicy::default(),
        }
    }
}

impl NodeConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn replicator_retry_interval(&self) -> Duration {
        Duration::from_millis(self.replicator_retry_interval_ms)
    }

    /// Check values that would make the node unusable
    pub fn validate(&self) -> Result<(), MeshError> {
        if self.max_txn_retries == 0 {
            return Err(MeshError::InvalidArgs(
                "max_txn_retries must be at least 1".to_string(),
            ));
        }
        if self.event_capacity == 0 || self.inbox_capacity == 0 {
            return Err(MeshError::InvalidArgs(
                "event_capacity and inbox_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load node config from `<dir>/node.toml`, falling back to defaults
pub fn load_node_config(dir: &Path) -> Result<NodeConfig, MeshError> {
    let config_path = dir.join("node.toml");
    if !config_path.exists() {
        return Ok(NodeConfig::default());
    }
    let content = std::fs::read_to_string(&config_path)?;
    let config: NodeConfig = toml::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

/// Save node config to `<dir>/node.toml`
pub fn save_node_config(dir: &Path, config: &NodeConfig) -> Result<(), MeshError> {
    std::fs::create_dir_all(dir)?;
    let content = toml::to_string_pretty(config)?;
    std::fs::write(dir.join("node.toml"), content)?;
    Ok(())
}

/// Sled directory of a named node under a data root
pub fn node_sled_path(data_root: &Path, node: &str) -> PathBuf {
    data_root.join(node).join("sled")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_node_config_roundtrip() {
        let dir = tempdir().unwrap();
        let config = NodeConfig {
            data_dir: Some(dir.path().join("data")),
            max_txn_retries: 3,
            retry_backoff_ms: 5,
            verification: VerificationPolicy::Warn,
            ..NodeConfig::default()
        };

        save_node_config(dir.path(), &config).unwrap();
        let loaded = load_node_config(dir.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let loaded = load_node_config(dir.path()).unwrap();
        assert_eq!(loaded, NodeConfig::default());
        assert_eq!(loaded.retry_backoff(), Duration::from_millis(100));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("node.toml"), "max_txn_retries = 9\n").unwrap();
        let loaded = load_node_config(dir.path()).unwrap();
        assert_eq!(loaded.max_txn_retries, 9);
        assert_eq!(loaded.event_capacity, 1024);
    }

    #[test]
    fn test_zero_retries_rejected() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("node.toml"), "max_txn_retries = 0\n").unwrap();
        assert!(matches!(
            load_node_config(dir.path()),
            Err(MeshError::InvalidArgs(_))
        ));
    }

    #[test]
    fn test_node_sled_path() {
        let path = node_sled_path(Path::new("/tmp/mesh"), "node0");
        assert_eq!(path, PathBuf::from("/tmp/mesh/node0/sled"));
    }
}
