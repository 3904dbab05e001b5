//! Error types for the vaultkeep-reduce subsystem

/// All errors that can occur during data reduction operations
#[derive(Debug, thiserror::Error)]
pub enum ReduceError {
    /// Chunker or compressor configuration is out of range
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    /// Compression operation failed
    #[error("Compression failed: {0}")]
    CompressionFailed(String),
    /// Decompression operation failed
    #[error("Decompression failed: {0}")]
    DecompressionFailed(String),
    /// Encryption operation failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),
    /// Authentication tag mismatch, wrong passphrase or malformed blob
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),
    /// A stored block payload could not be parsed
    #[error("Invalid block envelope: {0}")]
    InvalidEnvelope(String),
    /// Decoded block content does not hash to the expected value
    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch {
        /// Hash recorded when the block was written
        expected: String,
        /// Hash of the bytes that were decoded
        actual: String,
    },
    /// Encrypted payload found but no passphrase was configured
    #[error("Missing encryption key: payload is encrypted but no passphrase was set")]
    MissingKey,
    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_mismatch_display() {
        let err = ReduceError::HashMismatch {
            expected: "aa".to_string(),
            actual: "bb".to_string(),
        };
        assert_eq!(err.to_string(), "Hash mismatch: expected aa, got bb");
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: ReduceError = io.into();
        assert!(matches!(err, ReduceError::Io(_)));
    }
}
