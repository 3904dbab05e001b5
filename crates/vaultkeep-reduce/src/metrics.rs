//! Counters for the block reduction path.
//!
//! All counters are atomics so the blocking worker pool can record into one
//! shared instance without locking.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Thread-safe counters for chunking, dedupe, compression and encryption.
#[derive(Debug, Default)]
pub struct ReductionMetrics {
    blocks_reduced: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    dedup_hits: AtomicU64,
    dedup_misses: AtomicU64,
    compress_bytes_in: AtomicU64,
    compress_bytes_out: AtomicU64,
    encrypt_ops: AtomicU64,
    decrypt_ops: AtomicU64,
    decrypt_failures: AtomicU64,
}

/// Point-in-time copy of [`ReductionMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Blocks that went through compress/encrypt
    pub blocks_reduced: u64,
    /// Raw block bytes entering the reduction path
    pub bytes_in: u64,
    /// Stored payload bytes leaving the reduction path
    pub bytes_out: u64,
    /// Blocks already present in the index
    pub dedup_hits: u64,
    /// Blocks seen for the first time
    pub dedup_misses: u64,
    /// Bytes handed to a compressor
    pub compress_bytes_in: u64,
    /// Bytes produced by the compressor
    pub compress_bytes_out: u64,
    /// Blobs encrypted
    pub encrypt_ops: u64,
    /// Blobs decrypted successfully
    pub decrypt_ops: u64,
    /// Blobs rejected during decryption
    pub decrypt_failures: u64,
}

impl ReductionMetrics {
    /// Create a new instance with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one block leaving the reduction path.
    #[inline]
    pub fn record_block(&self, bytes_in: u64, bytes_out: u64) {
        self.blocks_reduced.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes_in, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes_out, Ordering::Relaxed);
    }

    /// Record a block already present in the index.
    #[inline]
    pub fn record_dedup_hit(&self) {
        self.dedup_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a block seen for the first time.
    #[inline]
    pub fn record_dedup_miss(&self) {
        self.dedup_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Record compressor input and output sizes.
    #[inline]
    pub fn record_compress(&self, bytes_in: u64, bytes_out: u64) {
        self.compress_bytes_in.fetch_add(bytes_in, Ordering::Relaxed);
        self.compress_bytes_out.fetch_add(bytes_out, Ordering::Relaxed);
    }

    /// Record one blob encrypted.
    #[inline]
    pub fn record_encrypt(&self) {
        self.encrypt_ops.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a decryption attempt and whether the tag verified.
    #[inline]
    pub fn record_decrypt(&self, ok: bool) {
        if ok {
            self.decrypt_ops.fetch_add(1, Ordering::Relaxed);
        } else {
            self.decrypt_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Fraction of classified blocks that were duplicates. 0.0 before any classification.
    pub fn dedup_ratio(&self) -> f64 {
        let hits = self.dedup_hits.load(Ordering::Relaxed);
        let total = hits + self.dedup_misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Compressor input over output. 1.0 before any compression.
    pub fn compression_ratio(&self) -> f64 {
        let bytes_in = self.compress_bytes_in.load(Ordering::Relaxed);
        let bytes_out = self.compress_bytes_out.load(Ordering::Relaxed);
        if bytes_out == 0 {
            1.0
        } else {
            bytes_in as f64 / bytes_out as f64
        }
    }

    /// Copy the current counter values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            blocks_reduced: self.blocks_reduced.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            dedup_hits: self.dedup_hits.load(Ordering::Relaxed),
            dedup_misses: self.dedup_misses.load(Ordering::Relaxed),
            compress_bytes_in: self.compress_bytes_in.load(Ordering::Relaxed),
            compress_bytes_out: self.compress_bytes_out.load(Ordering::Relaxed),
            encrypt_ops: self.encrypt_ops.load(Ordering::Relaxed),
            decrypt_ops: self.decrypt_ops.load(Ordering::Relaxed),
            decrypt_failures: self.decrypt_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn ratios_default_when_idle() {
        let m = ReductionMetrics::new();
        assert_eq!(m.dedup_ratio(), 0.0);
        assert_eq!(m.compression_ratio(), 1.0);
    }

    #[test]
    fn dedup_ratio_counts_hits() {
        let m = ReductionMetrics::new();
        m.record_dedup_hit();
        m.record_dedup_miss();
        m.record_dedup_miss();
        m.record_dedup_miss();
        assert!((m.dedup_ratio() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn concurrent_recording() {
        let m = Arc::new(ReductionMetrics::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let m = Arc::clone(&m);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        m.record_block(100, 40);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let snap = m.snapshot();
        assert_eq!(snap.blocks_reduced, 4000);
        assert_eq!(snap.bytes_in, 400_000);
        assert_eq!(snap.bytes_out, 160_000);
    }

    #[test]
    fn decrypt_failures_tracked_separately() {
        let m = ReductionMetrics::new();
        m.record_decrypt(true);
        m.record_decrypt(false);
        m.record_decrypt(false);
        let snap = m.snapshot();
        assert_eq!(snap.decrypt_ops, 1);
        assert_eq!(snap.decrypt_failures, 2);
    }
}
