//! Error types for the backup engine.

use std::path::PathBuf;

use thiserror::Error;
use vaultkeep_reduce::ReduceError;
use vaultkeep_storage::StorageError;

/// Result type alias for engine operations.
pub type BackupResultT<T> = Result<T, BackupError>;

/// Error variants for backup, restore and verification.
#[derive(Debug, Error)]
pub enum BackupError {
    /// A source root is missing or cannot be listed. Aborts the whole run.
    #[error("Source unreadable: {path}: {reason}")]
    SourceUnreadable {
        /// The offending root.
        path: PathBuf,
        /// Description of the failure.
        reason: String,
    },

    /// The job cannot run as configured. Aborts the whole run.
    #[error("Invalid job configuration: {0}")]
    InvalidJobConfig(String),

    /// One file could not be read; the file is skipped.
    #[error("Block read error on {path}: {reason}")]
    BlockRead {
        /// The file being read.
        path: PathBuf,
        /// Description of the failure.
        reason: String,
    },

    /// No job with this id is registered.
    #[error("Unknown job: {0}")]
    UnknownJob(String),

    /// No snapshot with this name exists.
    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    /// Snapshots are immutable; the name is taken.
    #[error("Snapshot already exists: {0}")]
    SnapshotExists(String),

    /// No manifest is stored for this backup id.
    #[error("Manifest not found: {0}")]
    ManifestNotFound(String),

    /// A snapshot name or backup id that cannot be used as a file name.
    #[error("Invalid name: {0:?}")]
    InvalidName(String),

    /// A persisted document has a format version this build cannot read.
    #[error("Unsupported format version {found} in {path} (supported: {supported})")]
    UnsupportedFormat {
        /// The document.
        path: PathBuf,
        /// Version found.
        found: u32,
        /// Version this build writes.
        supported: u32,
    },

    /// A restore target could not be resolved or written.
    #[error("Restore failed for {target}: {reason}")]
    Restore {
        /// The requested source path.
        target: String,
        /// Description of the failure.
        reason: String,
    },

    /// Engine configuration file problem.
    #[error("Config error: {0}")]
    Config(String),

    /// Persisted JSON could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The run was cancelled between work units.
    #[error("Operation cancelled")]
    Cancelled,

    /// Chunking, compression or encryption failure.
    #[error(transparent)]
    Reduce(#[from] ReduceError),

    /// Destination failure.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackupError {
    /// True for errors that make a whole backup run meaningless.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BackupError::SourceUnreadable { .. }
                | BackupError::InvalidJobConfig(_)
                | BackupError::UnknownJob(_)
                | BackupError::Cancelled
        )
    }
}
