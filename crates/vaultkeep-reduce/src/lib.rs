#![warn(missing_docs)]

//! vaultkeep reduction subsystem: content-defined chunking (FastCDC/BLAKE3), block dedupe,
//! adaptive compression (LZ4/Zstd), passphrase encryption (AES-GCM / ChaCha20-Poly1305)
//!
//! Write path: File → Chunk (FastCDC) → Fingerprint (BLAKE3) → Dedupe → Compress → Encrypt → Frame
//! Read path:  Frame → Decrypt → Decompress → Verify hash → Data

pub mod compression;
pub mod dedupe;
pub mod encryption;
pub mod envelope;
pub mod error;
pub mod fingerprint;
pub mod metrics;
pub mod pipeline;

pub use compression::{
    AdaptiveCompressor, CompressionAlgorithm, CompressionResult, CompressionUsage,
    CompressorConfig,
};
pub use dedupe::{BlockClass, CasIndex, Chunk, Chunker, ChunkerConfig, DeduplicationStats, Deduplicator};
pub use encryption::{
    decrypt_data, derive_key_from_passphrase, EncryptedBlob, EncryptionAlgorithm, EncryptionKey,
    Encryptor, PBKDF2_ITERATIONS,
};
pub use envelope::BlockEnvelope;
pub use error::ReduceError;
pub use fingerprint::{blake3_hash, hash_reader, ChunkHash, ContentHasher};
pub use metrics::{MetricsSnapshot, ReductionMetrics};
pub use pipeline::{PipelineConfig, ReducedBlock, ReductionPipeline};
