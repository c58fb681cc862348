//! Node configuration.
//!
//! Settings come from an optional YAML file and are then overridden by
//! command-line flags.

use crate::error::{NodeError, Result};
use clap::Parser;
use grove_consensus::{EngineConfig, RetryPolicy};
use grove_pubqueue::PublishQueueConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Grove Node - multi-group BFT replication
#[derive(Parser, Debug, Default)]
#[command(name = "grove-node")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Data directory
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Peer name, also the name of the node's storage directory
    #[arg(long)]
    pub peer_name: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    pub json_logs: bool,

    /// Log every grove subsystem at debug level
    #[arg(long)]
    pub debug: bool,

    /// Acknowledge publish-queue entries as soon as they are dispatched
    #[arg(long)]
    pub auto_ack: bool,

    /// Directory of group seeds (*.json) to import at startup
    #[arg(long)]
    pub seed_dir: Option<PathBuf>,
}

/// Block and group-metadata storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// Nothing survives a restart.
    Memory,
    /// One JSON file per record.
    #[default]
    File,
    /// RocksDB column families.
    #[cfg(feature = "rocksdb-backend")]
    Rocksdb,
}

/// Consensus engine settings as written in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Round timeout of round 0, in milliseconds.
    pub base_timeout_ms: u64,
    /// Maximum exponent of the timeout backoff.
    pub timeout_backoff_cap: u32,
    /// Maximum transactions per block.
    pub max_trxs_per_block: usize,
    /// Engine mailbox capacity.
    pub mailbox_size: usize,
    /// Buffered messages for later heights or rounds.
    pub future_buffer_limit: usize,
    /// Attempts to persist a committed block.
    pub storage_retry_attempts: u32,
    /// Delay before the first storage retry, in milliseconds.
    pub storage_retry_delay_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        let engine = EngineConfig::default();
        let retry = engine.storage_retry;
        Self {
            base_timeout_ms: engine.base_timeout.as_millis() as u64,
            timeout_backoff_cap: engine.timeout_backoff_cap,
            max_trxs_per_block: engine.max_trxs_per_block,
            mailbox_size: engine.mailbox_size,
            future_buffer_limit: engine.future_buffer_limit,
            storage_retry_attempts: retry.max_attempts,
            storage_retry_delay_ms: retry.initial_delay.as_millis() as u64,
        }
    }
}

impl EngineSettings {
    /// Builds the engine configuration.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            base_timeout: Duration::from_millis(self.base_timeout_ms),
            timeout_backoff_cap: self.timeout_backoff_cap,
            max_trxs_per_block: self.max_trxs_per_block,
            mailbox_size: self.mailbox_size,
            future_buffer_limit: self.future_buffer_limit,
            storage_retry: RetryPolicy::new(
                self.storage_retry_attempts,
                Duration::from_millis(self.storage_retry_delay_ms),
            ),
            ..Default::default()
        }
    }
}

/// Configuration for a Grove node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Name of this peer.
    pub peer_name: String,
    /// Root data directory.
    pub data_dir: PathBuf,
    /// Hex-encoded Ed25519 secret key file; `<peer dir>/node.key` when unset.
    pub key_file: Option<PathBuf>,
    /// Directory of group seeds imported at startup.
    pub seed_dir: Option<PathBuf>,
    /// Storage backend for blocks and group metadata.
    pub storage: StorageBackend,
    /// Log level.
    pub log_level: String,
    /// Emit logs as JSON.
    pub json_logs: bool,
    /// Log every grove subsystem at debug level.
    pub debug: bool,
    /// Interval of the group health report, in seconds (0 disables it).
    pub health_report_secs: u64,
    /// Consensus engine settings.
    pub engine: EngineSettings,
    /// Publish queue settings.
    pub queue: PublishQueueConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            peer_name: "peer".to_string(),
            data_dir: PathBuf::from("./data"),
            key_file: None,
            seed_dir: None,
            storage: StorageBackend::default(),
            log_level: "info".to_string(),
            json_logs: false,
            debug: false,
            health_report_secs: 60,
            engine: EngineSettings::default(),
            queue: PublishQueueConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Parses a YAML configuration.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: NodeConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads the file named by `--config`, if any, and applies the flags.
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut config = match &cli.config {
            Some(path) => Self::from_yaml(&std::fs::read_to_string(path)?)?,
            None => Self::default(),
        };
        config.apply(cli);
        config.validate()?;
        Ok(config)
    }

    /// Overrides settings with command-line flags.
    pub fn apply(&mut self, cli: &Cli) {
        if let Some(dir) = &cli.data_dir {
            self.data_dir = dir.clone();
        }
        if let Some(name) = &cli.peer_name {
            self.peer_name = name.clone();
        }
        if let Some(level) = &cli.log_level {
            self.log_level = level.clone();
        }
        if let Some(dir) = &cli.seed_dir {
            self.seed_dir = Some(dir.clone());
        }
        self.json_logs |= cli.json_logs;
        self.debug |= cli.debug;
        self.queue.auto_ack |= cli.auto_ack;
    }

    /// Checks the settings are usable.
    pub fn validate(&self) -> Result<()> {
        let name = self.peer_name.as_str();
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(NodeError::Config(format!("invalid peer name {:?}", name)));
        }
        if self.engine.base_timeout_ms == 0 {
            return Err(NodeError::Config("engine.base_timeout_ms must be positive".into()));
        }
        if self.engine.storage_retry_attempts == 0 {
            return Err(NodeError::Config("engine.storage_retry_attempts must be positive".into()));
        }
        if self.queue.max_attempts == 0 {
            return Err(NodeError::Config("queue.max_attempts must be positive".into()));
        }
        if self.queue.dispatch_interval.is_zero() {
            return Err(NodeError::Config("queue.dispatch_interval must be positive".into()));
        }
        Ok(())
    }

    /// Directory holding the block and group stores.
    pub fn peer_dir(&self) -> PathBuf {
        self.data_dir.join(&self.peer_name)
    }

    /// Directory holding the durable publish queue.
    pub fn queue_dir(&self) -> PathBuf {
        self.data_dir.join(format!("{}_pubqueue", self.peer_name))
    }

    /// Path of the node key.
    pub fn key_path(&self) -> PathBuf {
        self.key_file
            .clone()
            .unwrap_or_else(|| self.peer_dir().join("node.key"))
    }

    /// Tracing filter directives for these settings.
    pub fn log_filter(&self) -> String {
        if self.debug {
            return "grove_consensus=debug,grove_pubqueue=debug,grove_node=debug,grove_storage=debug"
                .to_string();
        }
        format!("grove={level},grove_consensus={level},grove_pubqueue={level},grove_node={level},grove_storage={level}",
            level = self.log_level)
    }
}

/// Returns true if the path looks like a seed file.
pub(crate) fn is_seed_file(path: &Path) -> bool {
    path.is_file() && path.extension().is_some_and(|ext| ext == "json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_overrides_defaults() {
        let config = NodeConfig::from_yaml(
            r#"
peer_name: alice
data_dir: /var/lib/grove
storage: memory
engine:
  base_timeout_ms: 500
queue:
  ack_timeout: 10000
  auto_ack: true
"#,
        )
        .unwrap();

        assert_eq!(config.peer_name, "alice");
        assert_eq!(config.storage, StorageBackend::Memory);
        assert_eq!(config.engine.engine_config().base_timeout, Duration::from_millis(500));
        assert_eq!(config.queue.ack_timeout, Duration::from_secs(10));
        assert!(config.queue.auto_ack);
        assert_eq!(config.queue.max_attempts, 5);
        assert_eq!(config.peer_dir(), PathBuf::from("/var/lib/grove/alice"));
        assert_eq!(config.queue_dir(), PathBuf::from("/var/lib/grove/alice_pubqueue"));
        assert_eq!(config.key_path(), PathBuf::from("/var/lib/grove/alice/node.key"));
    }

    #[test]
    fn test_flags_win_over_file() {
        let mut config = NodeConfig::default();
        let cli = Cli::parse_from([
            "grove-node",
            "--peer-name",
            "bob",
            "--data-dir",
            "/tmp/g",
            "--auto-ack",
            "--debug",
        ]);
        config.apply(&cli);

        assert_eq!(config.peer_name, "bob");
        assert_eq!(config.data_dir, PathBuf::from("/tmp/g"));
        assert!(config.queue.auto_ack);
        assert!(config.log_filter().contains("grove_consensus=debug"));
    }

    #[test]
    fn test_rejects_bad_settings() {
        let config = NodeConfig {
            peer_name: "../escape".into(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(NodeError::Config(_))));

        let mut config = NodeConfig::default();
        config.queue.max_attempts = 0;
        assert!(config.validate().is_err());

        assert!(NodeConfig::from_yaml("peer_name: [").is_err());
    }

    #[test]
    fn test_level_filter() {
        let config = NodeConfig {
            log_level: "warn".into(),
            ..Default::default()
        };
        assert!(config.log_filter().starts_with("grove=warn"));
    }
}
