//! Error types for the storage subsystem.

use thiserror::Error;

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Error variants for storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Artifact id is empty, absolute, or escapes the destination root.
    #[error("Invalid artifact id: {id:?}")]
    InvalidArtifactId {
        /// The rejected id.
        id: String,
    },

    /// The artifact does not exist on the destination.
    #[error("Artifact not found on {destination}: {id}")]
    NotFound {
        /// Destination that was asked.
        destination: String,
        /// Artifact id.
        id: String,
    },

    /// The destination could not complete the operation.
    #[error("Destination {destination} unavailable: {reason}")]
    DestinationUnavailable {
        /// Destination name.
        destination: String,
        /// Description of the failure.
        reason: String,
    },

    /// No destination with this name is registered.
    #[error("Unknown destination: {0}")]
    UnknownDestination(String),

    /// A destination with this name is already registered.
    #[error("Destination already registered: {0}")]
    DuplicateDestination(String),

    /// No factory is registered for the remote protocol.
    #[error("Unsupported destination protocol: {0}")]
    UnsupportedProtocol(String),

    /// A replication or read was requested with an empty destination list.
    #[error("No destinations given")]
    NoDestinations,

    /// The backend does not implement an optional operation.
    #[error("Destination {destination} does not support {operation}")]
    Unsupported {
        /// Destination name.
        destination: String,
        /// Operation that was requested.
        operation: String,
    },

    /// The destination did not answer within its deadline.
    #[error("Destination {destination} timed out after {seconds}s")]
    Timeout {
        /// Destination name.
        destination: String,
        /// Deadline that elapsed.
        seconds: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_display() {
        let err = StorageError::DestinationUnavailable {
            destination: "offsite".to_string(),
            reason: "disk full".to_string(),
        };
        assert_eq!(err.to_string(), "Destination offsite unavailable: disk full");
    }

    #[test]
    fn timeout_display() {
        let err = StorageError::Timeout {
            destination: "slow".to_string(),
            seconds: 300,
        };
        assert_eq!(err.to_string(), "Destination slow timed out after 300s");
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: StorageError = io.into();
        assert!(matches!(err, StorageError::Io(_)));
    }
}
