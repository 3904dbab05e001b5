//! Per-block reduction: compress → encrypt → frame, and the inverse for restore

use crate::{
    compression::{AdaptiveCompressor, CompressionAlgorithm},
    dedupe::Chunk,
    encryption::{EncryptedBlob, Encryptor},
    envelope::BlockEnvelope,
    error::ReduceError,
    fingerprint::{blake3_hash, ChunkHash},
    metrics::ReductionMetrics,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Which reduction stages run for new blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Run the adaptive compressor
    pub compression_enabled: bool,
    /// Encrypt (requires an [`Encryptor`])
    pub encryption_enabled: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            compression_enabled: true,
            encryption_enabled: false,
        }
    }
}

/// A block ready to hand to storage
#[derive(Debug, Clone)]
pub struct ReducedBlock {
    /// BLAKE3 hash of the original block (CAS key)
    pub hash: ChunkHash,
    /// Original block size
    pub original_size: usize,
    /// Framed payload as written to destinations
    pub stored: Bytes,
    /// Compression applied before encryption
    pub compression: CompressionAlgorithm,
    /// Payload is encrypted
    pub encrypted: bool,
}

/// The block reduction pipeline. Stateless per block, safe to share across worker threads.
pub struct ReductionPipeline {
    config: PipelineConfig,
    compressor: AdaptiveCompressor,
    encryptor: Option<Arc<Encryptor>>,
    metrics: Arc<ReductionMetrics>,
}

impl ReductionPipeline {
    /// Create with no encryptor
    pub fn new(config: PipelineConfig, compressor: AdaptiveCompressor) -> Self {
        Self {
            config,
            compressor,
            encryptor: None,
            metrics: Arc::new(ReductionMetrics::new()),
        }
    }

    /// Attach the encryptor used for writing and for reading encrypted payloads
    pub fn with_encryptor(mut self, encryptor: Arc<Encryptor>) -> Self {
        self.encryptor = Some(encryptor);
        self
    }

    /// Share a metrics instance with other components
    pub fn with_metrics(mut self, metrics: Arc<ReductionMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Active configuration
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Shared metrics
    pub fn metrics(&self) -> &Arc<ReductionMetrics> {
        &self.metrics
    }

    /// Compress and encrypt one block according to the config.
    #[instrument(skip_all, fields(hash = %chunk.hash, size = chunk.len()))]
    pub fn reduce_block(&self, chunk: &Chunk) -> Result<ReducedBlock, ReduceError> {
        let (compression, compressed) = if self.config.compression_enabled {
            let r = self.compressor.compress_data(&chunk.data);
            (r.algorithm, r.data)
        } else {
            (CompressionAlgorithm::None, chunk.data.to_vec())
        };

        let body = if self.config.encryption_enabled {
            let enc = self.encryptor.as_ref().ok_or(ReduceError::MissingKey)?;
            enc.encrypt_data(&compressed)?.to_bytes()
        } else {
            compressed
        };

        let stored = BlockEnvelope {
            compression,
            encrypted: self.config.encryption_enabled,
            original_len: chunk.len() as u64,
            body,
        }
        .encode();
        self.metrics
            .record_block(chunk.len() as u64, stored.len() as u64);
        debug!(algorithm = %compression, stored = stored.len(), "block reduced");

        Ok(ReducedBlock {
            hash: chunk.hash,
            original_size: chunk.len(),
            stored: Bytes::from(stored),
            compression,
            encrypted: self.config.encryption_enabled,
        })
    }

    /// Decode a stored payload and check it against the expected block hash.
    pub fn restore_block(&self, stored: &[u8], expected: &ChunkHash) -> Result<Vec<u8>, ReduceError> {
        let env = BlockEnvelope::decode(stored)?;
        let compressed = if env.encrypted {
            self.decrypt_body(&env.body)?
        } else {
            env.body.clone()
        };
        self.check_content(&env, &compressed, expected)
    }

    /// Re-encrypt a stored payload for `target`, keeping its compression.
    /// The content is checked against `expected` first. Unencrypted payloads
    /// return `None`.
    pub fn reencrypt_block(
        &self,
        stored: &[u8],
        expected: &ChunkHash,
        target: &Encryptor,
    ) -> Result<Option<Vec<u8>>, ReduceError> {
        let env = BlockEnvelope::decode(stored)?;
        if !env.encrypted {
            return Ok(None);
        }
        let compressed = self.decrypt_body(&env.body)?;
        self.check_content(&env, &compressed, expected)?;
        let body = target.encrypt_data(&compressed)?.to_bytes();
        Ok(Some(BlockEnvelope { body, ..env }.encode()))
    }

    fn decrypt_body(&self, body: &[u8]) -> Result<Vec<u8>, ReduceError> {
        let enc = self.encryptor.as_ref().ok_or(ReduceError::MissingKey)?;
        enc.decrypt(&EncryptedBlob::from_bytes(body)?)
    }

    fn check_content(
        &self,
        env: &BlockEnvelope,
        compressed: &[u8],
        expected: &ChunkHash,
    ) -> Result<Vec<u8>, ReduceError> {
        let data = self.compressor.decompress_data(compressed, env.compression)?;
        if data.len() as u64 != env.original_len {
            return Err(ReduceError::InvalidEnvelope(format!(
                "decoded {} bytes, header says {}",
                data.len(),
                env.original_len
            )));
        }
        let actual = blake3_hash(&data);
        if &actual != expected {
            return Err(ReduceError::HashMismatch {
                expected: expected.to_hex(),
                actual: actual.to_hex(),
            });
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedupe::Chunker;
    use crate::encryption::EncryptionAlgorithm;

    fn plain() -> ReductionPipeline {
        ReductionPipeline::new(PipelineConfig::default(), AdaptiveCompressor::default())
    }

    #[test]
    fn roundtrip_no_encryption() {
        let p = plain();
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let mut out = Vec::new();
        for chunk in Chunker::new().chunk(&data) {
            let reduced = p.reduce_block(&chunk).unwrap();
            assert!(!reduced.encrypted);
            out.extend(p.restore_block(&reduced.stored, &chunk.hash).unwrap());
        }
        assert_eq!(out, data);
    }

    #[test]
    fn roundtrip_with_encryption() {
        let enc = Arc::new(Encryptor::new("pw", EncryptionAlgorithm::AesGcm256));
        let config = PipelineConfig {
            compression_enabled: true,
            encryption_enabled: true,
        };
        let p = ReductionPipeline::new(config, AdaptiveCompressor::default()).with_encryptor(enc);
        let data = b"Hello vaultkeep!".repeat(10_000);
        let mut out = Vec::new();
        let mut stored = 0;
        for chunk in Chunker::new().chunk(&data) {
            let reduced = p.reduce_block(&chunk).unwrap();
            assert!(reduced.encrypted);
            stored += reduced.stored.len();
            out.extend(p.restore_block(&reduced.stored, &chunk.hash).unwrap());
        }
        assert_eq!(out, data);
        assert!(stored < data.len());
    }

    #[test]
    fn reencrypt_moves_block_to_new_passphrase() {
        let config = PipelineConfig {
            compression_enabled: true,
            encryption_enabled: true,
        };
        let old = ReductionPipeline::new(config, AdaptiveCompressor::default())
            .with_encryptor(Arc::new(Encryptor::new("old", EncryptionAlgorithm::AesGcm256)));
        let new_enc = Arc::new(Encryptor::new("new", EncryptionAlgorithm::AesGcm256));
        let new = ReductionPipeline::new(config, AdaptiveCompressor::default())
            .with_encryptor(Arc::clone(&new_enc));

        let chunk = Chunker::new().chunk(&b"rotate me ".repeat(500)).remove(0);
        let reduced = old.reduce_block(&chunk).unwrap();
        let rotated = old
            .reencrypt_block(&reduced.stored, &chunk.hash, &new_enc)
            .unwrap()
            .unwrap();
        assert_eq!(
            BlockEnvelope::decode(&rotated).unwrap().compression,
            reduced.compression
        );
        assert_eq!(new.restore_block(&rotated, &chunk.hash).unwrap(), chunk.data.to_vec());
        assert!(matches!(
            old.restore_block(&rotated, &chunk.hash),
            Err(ReduceError::DecryptionFailed(_))
        ));
        // Already rotated content no longer opens with the old key.
        assert!(old.reencrypt_block(&rotated, &chunk.hash, &new_enc).is_err());

        let plain_block = plain().reduce_block(&chunk).unwrap();
        assert!(old
            .reencrypt_block(&plain_block.stored, &chunk.hash, &new_enc)
            .unwrap()
            .is_none());
    }

    #[test]
    fn missing_key_error() {
        let config = PipelineConfig {
            compression_enabled: true,
            encryption_enabled: true,
        };
        let p = ReductionPipeline::new(config, AdaptiveCompressor::default());
        let chunk = Chunker::new().chunk(b"test").remove(0);
        assert!(matches!(p.reduce_block(&chunk), Err(ReduceError::MissingKey)));
    }

    #[test]
    fn wrong_hash_detected() {
        let p = plain();
        let chunk = Chunker::new().chunk(&vec![7u8; 5000]).remove(0);
        let reduced = p.reduce_block(&chunk).unwrap();
        let other = blake3_hash(b"something else");
        assert!(matches!(
            p.restore_block(&reduced.stored, &other),
            Err(ReduceError::HashMismatch { .. })
        ));
    }

    #[test]
    fn compression_disabled_stores_raw() {
        let config = PipelineConfig {
            compression_enabled: false,
            encryption_enabled: false,
        };
        let p = ReductionPipeline::new(config, AdaptiveCompressor::default());
        let chunk = Chunker::new().chunk(&vec![b'X'; 10_000]).remove(0);
        let reduced = p.reduce_block(&chunk).unwrap();
        assert_eq!(reduced.compression, CompressionAlgorithm::None);
        assert_eq!(
            reduced.stored.len(),
            10_000 + crate::envelope::ENVELOPE_HEADER_LEN
        );
    }

    #[test]
    fn metrics_record_each_block() {
        let p = plain();
        for chunk in Chunker::new().chunk(&vec![1u8; 300_000]) {
            p.reduce_block(&chunk).unwrap();
        }
        let snap = p.metrics().snapshot();
        assert!(snap.blocks_reduced >= 1);
        assert_eq!(snap.bytes_in, 300_000);
        assert!(snap.bytes_out < snap.bytes_in);
    }
}
