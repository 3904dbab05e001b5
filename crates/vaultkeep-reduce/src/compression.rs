//! LZ4 and Zstd compression with per-payload algorithm selection

use crate::error::ReduceError;
use crate::metrics::ReductionMetrics;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Compression algorithm selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    /// No compression (passthrough)
    #[default]
    None,
    /// LZ4 block format with prepended size, fast path
    Lz4,
    /// Zstandard, higher ratio
    Zstd,
}

impl CompressionAlgorithm {
    /// One-byte code used in stored block envelopes
    pub fn code(self) -> u8 {
        match self {
            CompressionAlgorithm::None => 0,
            CompressionAlgorithm::Lz4 => 1,
            CompressionAlgorithm::Zstd => 2,
        }
    }

    /// Inverse of [`CompressionAlgorithm::code`]
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(CompressionAlgorithm::None),
            1 => Some(CompressionAlgorithm::Lz4),
            2 => Some(CompressionAlgorithm::Zstd),
            _ => None,
        }
    }
}

impl std::fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Lz4 => "lz4",
            CompressionAlgorithm::Zstd => "zstd",
        };
        f.write_str(name)
    }
}

/// Compress data with the given algorithm. Returns compressed bytes.
pub fn compress(
    data: &[u8],
    algo: CompressionAlgorithm,
    zstd_level: i32,
) -> Result<Vec<u8>, ReduceError> {
    match algo {
        CompressionAlgorithm::None => Ok(data.to_vec()),
        CompressionAlgorithm::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        CompressionAlgorithm::Zstd => zstd::encode_all(data, zstd_level)
            .map_err(|e| ReduceError::CompressionFailed(e.to_string())),
    }
}

/// Decompress data using the algorithm that was used for compression.
pub fn decompress(data: &[u8], algo: CompressionAlgorithm) -> Result<Vec<u8>, ReduceError> {
    match algo {
        CompressionAlgorithm::None => Ok(data.to_vec()),
        CompressionAlgorithm::Lz4 => lz4_flex::decompress_size_prepended(data)
            .map_err(|e| ReduceError::DecompressionFailed(e.to_string())),
        CompressionAlgorithm::Zstd => {
            zstd::decode_all(data).map_err(|e| ReduceError::DecompressionFailed(e.to_string()))
        }
    }
}

/// LZ4 output size over input size for the first `sample_size` bytes.
pub fn sample_ratio(data: &[u8], sample_size: usize) -> f64 {
    let sample = &data[..data.len().min(sample_size.max(1))];
    if sample.is_empty() {
        return 1.0;
    }
    let compressed = lz4_flex::compress_prepend_size(sample);
    compressed.len() as f64 / sample.len() as f64
}

/// Selection policy for [`AdaptiveCompressor`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressorConfig {
    /// Payloads shorter than this are stored raw
    pub min_size: usize,
    /// Bytes sampled by the LZ4 sample
    pub sample_size: usize,
    /// Sample ratio at or above which data is treated as incompressible
    pub incompressible_ratio: f64,
    /// Sample ratio at or below which Zstd is chosen even for large payloads
    pub high_ratio: f64,
    /// Payloads of at least this size prefer LZ4 unless the sample compresses very well
    pub large_payload: usize,
    /// Zstd level (1 fastest, 19 best ratio)
    pub zstd_level: i32,
}

impl Default for CompressorConfig {
    fn default() -> Self {
        Self {
            min_size: 64,
            sample_size: 4096,
            incompressible_ratio: 0.95,
            high_ratio: 0.5,
            large_payload: 1024 * 1024,
            zstd_level: 3,
        }
    }
}

/// Result of compressing one payload
#[derive(Debug, Clone, PartialEq)]
pub struct CompressionResult {
    /// Input length
    pub original_size: usize,
    /// Output length
    pub compressed_size: usize,
    /// original_size / compressed_size (1.0 for empty payloads)
    pub compression_ratio: f64,
    /// Algorithm to pass to [`decompress`]
    pub algorithm: CompressionAlgorithm,
    /// Output bytes
    pub data: Vec<u8>,
}

impl CompressionResult {
    fn new(original_size: usize, algorithm: CompressionAlgorithm, data: Vec<u8>) -> Self {
        let compressed_size = data.len();
        let compression_ratio = if compressed_size == 0 {
            1.0
        } else {
            original_size as f64 / compressed_size as f64
        };
        Self {
            original_size,
            compressed_size,
            compression_ratio,
            algorithm,
            data,
        }
    }

    fn raw(data: &[u8]) -> Self {
        Self::new(data.len(), CompressionAlgorithm::None, data.to_vec())
    }
}

/// How often each algorithm was chosen
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionUsage {
    /// Payloads stored raw
    pub none: u64,
    /// Payloads compressed with LZ4
    pub lz4: u64,
    /// Payloads compressed with Zstd
    pub zstd: u64,
}

/// Compressor that picks an algorithm per payload and never stores a payload
/// larger than its input.
#[derive(Debug, Default)]
pub struct AdaptiveCompressor {
    config: CompressorConfig,
    usage: [AtomicU64; 3],
    metrics: Option<Arc<ReductionMetrics>>,
}

impl AdaptiveCompressor {
    /// Create with the given policy
    pub fn new(config: CompressorConfig) -> Self {
        Self {
            config,
            usage: Default::default(),
            metrics: None,
        }
    }

    /// Record compressor sizes into shared metrics
    pub fn with_metrics(mut self, metrics: Arc<ReductionMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Active policy
    pub fn config(&self) -> &CompressorConfig {
        &self.config
    }

    /// Pick the algorithm the policy would use for `data`.
    pub fn select_algorithm(&self, data: &[u8]) -> CompressionAlgorithm {
        if data.len() < self.config.min_size {
            return CompressionAlgorithm::None;
        }
        let ratio = sample_ratio(data, self.config.sample_size);
        if ratio >= self.config.incompressible_ratio {
            CompressionAlgorithm::None
        } else if data.len() < self.config.large_payload || ratio <= self.config.high_ratio {
            CompressionAlgorithm::Zstd
        } else {
            CompressionAlgorithm::Lz4
        }
    }

    /// Compress with the selected algorithm. Falls back to raw storage when the
    /// output would not be smaller or the compressor fails.
    pub fn compress_data(&self, data: &[u8]) -> CompressionResult {
        let algo = self.select_algorithm(data);
        let result = match algo {
            CompressionAlgorithm::None => CompressionResult::raw(data),
            _ => match compress(data, algo, self.config.zstd_level) {
                Ok(out) if out.len() < data.len() => {
                    CompressionResult::new(data.len(), algo, out)
                }
                Ok(out) => {
                    debug!(
                        algorithm = %algo,
                        original = data.len(),
                        compressed = out.len(),
                        "compression did not shrink payload, storing raw"
                    );
                    CompressionResult::raw(data)
                }
                Err(e) => {
                    warn!(algorithm = %algo, error = %e, "compression failed, storing raw");
                    CompressionResult::raw(data)
                }
            },
        };
        self.record(&result);
        result
    }

    /// Compress with a caller-chosen algorithm, without the raw fallback.
    pub fn compress_with(
        &self,
        data: &[u8],
        algo: CompressionAlgorithm,
    ) -> Result<CompressionResult, ReduceError> {
        let out = compress(data, algo, self.config.zstd_level)?;
        let result = CompressionResult::new(data.len(), algo, out);
        self.record(&result);
        Ok(result)
    }

    /// Exact inverse of [`AdaptiveCompressor::compress_data`].
    pub fn decompress_data(
        &self,
        data: &[u8],
        algo: CompressionAlgorithm,
    ) -> Result<Vec<u8>, ReduceError> {
        decompress(data, algo)
    }

    /// Per-algorithm counts since creation
    pub fn usage(&self) -> CompressionUsage {
        CompressionUsage {
            none: self.usage[0].load(Ordering::Relaxed),
            lz4: self.usage[1].load(Ordering::Relaxed),
            zstd: self.usage[2].load(Ordering::Relaxed),
        }
    }

    fn record(&self, result: &CompressionResult) {
        self.usage[result.algorithm.code() as usize].fetch_add(1, Ordering::Relaxed);
        if let Some(m) = &self.metrics {
            m.record_compress(result.original_size as u64, result.compressed_size as u64);
        }
    }
}
