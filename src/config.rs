use crate::error::{Error, Result};
use crate::storage::properties::StorageProperties;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Timing and batching settings for one raft group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfiguration {
    /// Lower bound of the randomized election timeout, in milliseconds
    pub min_election_timeout_ms: u64,

    /// Upper bound of the randomized election timeout, in milliseconds
    pub max_election_timeout_ms: u64,

    /// Idle time after which the leader sends an empty heartbeat
    pub heartbeat_timeout_ms: u64,

    /// Maximum number of log entries in one AppendEntries request
    pub max_entries_per_batch: usize,

    /// Maximum number of unacknowledged entries in flight to one follower
    pub flow_buffer: u64,

    /// Maximum number of unacknowledged snapshot chunks in flight to one follower
    pub snapshot_flow_buffer: u64,

    /// Maximum number of snapshot chunks sent per replicator poll
    pub max_snapshot_chunks_per_batch: usize,

    /// Drop applied log segments from the replicated log
    pub log_compaction_enabled: bool,

    /// Number of applied entries always kept when compacting
    pub retained_log_entries: u64,

    /// Entries per file of the file backed log store
    pub log_segment_size: u64,
}

impl Default for RaftConfiguration {
    fn default() -> Self {
        Self {
            min_election_timeout_ms: 1000,
            max_election_timeout_ms: 2500,
            heartbeat_timeout_ms: 100,
            max_entries_per_batch: 10,
            flow_buffer: 1000,
            snapshot_flow_buffer: 500,
            max_snapshot_chunks_per_batch: 1000,
            log_compaction_enabled: true,
            retained_log_entries: 10_000,
            log_segment_size: 4096,
        }
    }
}

impl RaftConfiguration {
    pub fn min_election_timeout(&self) -> Duration {
        Duration::from_millis(self.min_election_timeout_ms)
    }

    pub fn max_election_timeout(&self) -> Duration {
        Duration::from_millis(self.max_election_timeout_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_election_timeout_ms == 0
            || self.min_election_timeout_ms > self.max_election_timeout_ms
        {
            return Err(Error::Config(format!(
                "invalid election timeout range {}..{}",
                self.min_election_timeout_ms, self.max_election_timeout_ms
            )));
        }
        if self.heartbeat_timeout_ms >= self.min_election_timeout_ms {
            return Err(Error::Config(
                "heartbeat timeout must be below the minimum election timeout".to_string(),
            ));
        }
        if self.max_entries_per_batch == 0 || self.flow_buffer == 0 || self.snapshot_flow_buffer == 0
        {
            return Err(Error::Config(
                "batch size and flow buffers must be positive".to_string(),
            ));
        }
        if self.log_segment_size == 0 {
            return Err(Error::Config("log segment size must be positive".to_string()));
        }
        Ok(())
    }
}

/// A cluster member as known from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberConfig {
    pub id: String,
    pub host: String,
    pub port: u16,
}

impl MemberConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    pub members: Vec<MemberConfig>,
}

/// Top level settings of one node process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_id: String,
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
    #[serde(default)]
    pub raft: RaftConfiguration,
    #[serde(default)]
    pub storage: StorageProperties,
}

impl NodeConfig {
    /// Reads and validates a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config: NodeConfig = serde_json::from_str(&contents)
            .map_err(|e| Error::Config(format!("{}: {}", path.as_ref().display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            return Err(Error::Config("node id must not be empty".to_string()));
        }
        self.raft.validate()?;
        for group in &self.groups {
            if group.name.is_empty() {
                return Err(Error::Config("group name must not be empty".to_string()));
            }
            if !group.members.iter().any(|m| m.id == self.node_id) {
                return Err(Error::Config(format!(
                    "node {} is not a member of group {}",
                    self.node_id, group.name
                )));
            }
            let mut ids: Vec<&str> = group.members.iter().map(|m| m.id.as_str()).collect();
            ids.sort_unstable();
            ids.dedup();
            if ids.len() != group.members.len() {
                return Err(Error::Config(format!(
                    "duplicate member in group {}",
                    group.name
                )));
            }
        }
        if self.storage.segment_size < 1024 {
            return Err(Error::Config("segment size must be at least 1024 bytes".to_string()));
        }
        Ok(())
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Directory holding the replicated log and raft state of a group.
    pub fn group_dir(&self, group: &str) -> PathBuf {
        self.data_dir.join("raft").join(group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn sample_json() -> &'static str {
        r#"{
            "node_id": "node-1",
            "host": "localhost",
            "port": 8224,
            "data_dir": "/tmp/node-1",
            "groups": [
                {
                    "name": "default",
                    "members": [
                        {"id": "node-1", "host": "localhost", "port": 8224},
                        {"id": "node-2", "host": "localhost", "port": 8225}
                    ]
                }
            ],
            "raft": {"heartbeat_timeout_ms": 50}
        }"#
    }

    #[test]
    fn test_raft_defaults() {
        let config = RaftConfiguration::default();
        assert_eq!(config.min_election_timeout(), Duration::from_millis(1000));
        assert_eq!(config.max_election_timeout(), Duration::from_millis(2500));
        assert_eq!(config.max_entries_per_batch, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_node_config() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(sample_json().as_bytes()).unwrap();

        let config = NodeConfig::load(file.path()).unwrap();
        assert_eq!(config.node_id, "node-1");
        assert_eq!(config.raft.heartbeat_timeout_ms, 50);
        assert_eq!(config.raft.flow_buffer, 1000);
        assert_eq!(config.groups[0].members[1].address(), "localhost:8225");
        assert_eq!(config.group_dir("default"), PathBuf::from("/tmp/node-1/raft/default"));
    }

    #[test]
    fn test_validate_rejects_foreign_group() {
        let mut config: NodeConfig = serde_json::from_str(sample_json()).unwrap();
        config.groups[0].members.remove(0);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_bad_timeouts() {
        let config = RaftConfiguration {
            min_election_timeout_ms: 3000,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
