use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use vaultkeep_reduce::{ChunkerConfig, CompressorConfig, EncryptionAlgorithm};

use crate::error::BackupError;

/// Engine-wide settings. Jobs carry their own per-run options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Where snapshots and manifests are persisted
    pub state_dir: PathBuf,
    /// Worker count for file processing; 0 means available cores
    pub parallelism: usize,
    /// Per-destination bound on each artifact write
    pub replication_timeout_secs: u64,
    /// Capacity of the queue between file workers and the block writer
    pub write_queue_depth: usize,
    /// Treat equal size, mtime, ctime and inode as unchanged without re-reading content
    pub trust_metadata: bool,
    /// Files whose metadata changed within this many milliseconds of the
    /// baseline scan are re-read even when their metadata matches
    pub racy_window_ms: u64,
    /// FastCDC bounds
    pub chunker: ChunkerConfig,
    /// Adaptive compression policy
    pub compression: CompressorConfig,
    /// Cipher for jobs with encryption enabled
    pub encryption_algorithm: EncryptionAlgorithm,
    /// Broadcast buffer for the event bus
    pub event_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/lib/vaultkeep"),
            parallelism: 0,
            replication_timeout_secs: 300,
            write_queue_depth: 64,
            trust_metadata: true,
            racy_window_ms: 2000,
            chunker: ChunkerConfig::default(),
            compression: CompressorConfig::default(),
            encryption_algorithm: EncryptionAlgorithm::default(),
            event_buffer: 256,
        }
    }
}

impl EngineConfig {
    /// Default settings with state kept under `state_dir`.
    pub fn with_state_dir(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            ..Self::default()
        }
    }

    /// Load from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> Result<Self, BackupError> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: EngineConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| BackupError::Config(e.to_string()))?,
            "json" => serde_json::from_str(&contents)?,
            _ => {
                return Err(BackupError::Config(format!(
                    "Unsupported config file extension: {}",
                    ext
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), BackupError> {
        self.chunker.validate()?;
        if self.write_queue_depth == 0 {
            return Err(BackupError::Config("write_queue_depth must be > 0".into()));
        }
        if self.replication_timeout_secs == 0 {
            return Err(BackupError::Config(
                "replication_timeout_secs must be > 0".into(),
            ));
        }
        if self.event_buffer == 0 {
            return Err(BackupError::Config("event_buffer must be > 0".into()));
        }
        Ok(())
    }

    /// Resolved worker count
    pub fn effective_parallelism(&self) -> usize {
        if self.parallelism > 0 {
            self.parallelism
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        }
    }

    /// Per-destination write timeout
    pub fn replication_timeout(&self) -> Duration {
        Duration::from_secs(self.replication_timeout_secs)
    }

    /// Racy-clean window for metadata trust
    pub fn racy_window(&self) -> Duration {
        Duration::from_millis(self.racy_window_ms)
    }

    pub(crate) fn snapshots_dir(&self) -> PathBuf {
        self.state_dir.join("snapshots")
    }

    pub(crate) fn manifests_dir(&self) -> PathBuf {
        self.state_dir.join("manifests")
    }

    pub(crate) fn verifications_dir(&self) -> PathBuf {
        self.state_dir.join("verifications")
    }
}
