//! Content-defined chunking (FastCDC) and content-addressable block deduplication

use crate::error::ReduceError;
use crate::fingerprint::{blake3_hash, ChunkHash};
use crate::metrics::ReductionMetrics;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use fastcdc::v2020::{FastCDC, StreamCDC};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

/// A content-defined block produced by the FastCDC chunker
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Block content
    pub data: Bytes,
    /// BLAKE3 hash of the block content (CAS key)
    pub hash: ChunkHash,
    /// Byte offset of this block in the original data stream
    pub offset: u64,
}

impl Chunk {
    fn from_bytes(data: Bytes, offset: u64) -> Self {
        let hash = blake3_hash(&data);
        Self { data, hash, offset }
    }

    /// Block size in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True for a zero-length block (never produced by the chunker)
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Configuration for the FastCDC chunker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkerConfig {
    /// Minimum block size in bytes
    pub min_size: usize,
    /// Average (target) block size in bytes
    pub avg_size: usize,
    /// Maximum block size in bytes
    pub max_size: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            min_size: 16 * 1024,
            avg_size: 64 * 1024,
            max_size: 256 * 1024,
        }
    }
}

impl ChunkerConfig {
    /// Check the sizes against the FastCDC v2020 bounds.
    pub fn validate(&self) -> Result<(), ReduceError> {
        use fastcdc::v2020::{
            AVERAGE_MAX, AVERAGE_MIN, MAXIMUM_MAX, MAXIMUM_MIN, MINIMUM_MAX, MINIMUM_MIN,
        };
        let check = |name: &str, v: usize, lo: u32, hi: u32| {
            if v >= lo as usize && v <= hi as usize {
                Ok(())
            } else {
                Err(ReduceError::InvalidConfig(format!(
                    "{} {} outside {}..={}",
                    name, v, lo, hi
                )))
            }
        };
        check("min_size", self.min_size, MINIMUM_MIN, MINIMUM_MAX)?;
        check("avg_size", self.avg_size, AVERAGE_MIN, AVERAGE_MAX)?;
        check("max_size", self.max_size, MAXIMUM_MIN, MAXIMUM_MAX)?;
        if self.min_size > self.avg_size || self.avg_size > self.max_size {
            return Err(ReduceError::InvalidConfig(format!(
                "sizes must satisfy min <= avg <= max (got {}/{}/{})",
                self.min_size, self.avg_size, self.max_size
            )));
        }
        Ok(())
    }
}

/// Content-defined chunker using the FastCDC algorithm
#[derive(Debug, Clone, Default)]
pub struct Chunker {
    config: ChunkerConfig,
}

impl Chunker {
    /// Create a chunker with default sizes
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a chunker with custom configuration
    pub fn with_config(config: ChunkerConfig) -> Result<Self, ReduceError> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Active configuration
    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Chunk an in-memory buffer and compute a BLAKE3 hash per block.
    /// Concatenating all chunk.data bytes reconstructs the original data.
    pub fn chunk(&self, data: &[u8]) -> Vec<Chunk> {
        if data.is_empty() {
            return Vec::new();
        }
        FastCDC::new(
            data,
            self.config.min_size as u32,
            self.config.avg_size as u32,
            self.config.max_size as u32,
        )
        .map(|c| {
            let end = c.offset + c.length;
            Chunk::from_bytes(Bytes::copy_from_slice(&data[c.offset..end]), c.offset as u64)
        })
        .collect()
    }

    /// Chunk a reader without buffering it whole. Produces the same blocks
    /// as [`Chunker::chunk`] over the same bytes.
    pub fn chunk_reader<R: Read>(&self, reader: R) -> ChunkStream<R> {
        ChunkStream {
            inner: StreamCDC::new(
                reader,
                self.config.min_size as u32,
                self.config.avg_size as u32,
                self.config.max_size as u32,
            ),
        }
    }
}

/// Iterator returned by [`Chunker::chunk_reader`]
pub struct ChunkStream<R: Read> {
    inner: StreamCDC<R>,
}

impl<R: Read> Iterator for ChunkStream<R> {
    type Item = Result<Chunk, ReduceError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.inner.next()? {
            Ok(c) => Some(Ok(Chunk::from_bytes(Bytes::from(c.data), c.offset))),
            Err(fastcdc::v2020::Error::Empty) => None,
            Err(fastcdc::v2020::Error::IoError(e)) => Some(Err(ReduceError::Io(e))),
            Err(other) => Some(Err(ReduceError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("chunker: {:?}", other),
            )))),
        }
    }
}

/// Outcome of looking a block up in the index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockClass {
    /// First occurrence of this hash
    Unique,
    /// Hash already indexed
    Duplicate,
}

#[derive(Debug, Clone, Copy)]
struct CasEntry {
    size: u64,
    refs: u64,
}

/// Concurrent CAS index mapping block hash to size and reference count.
/// Lookup-and-insert is atomic per hash.
#[derive(Debug, Default)]
pub struct CasIndex {
    entries: DashMap<ChunkHash, CasEntry>,
    total_blocks: AtomicU64,
    duplicated_blocks: AtomicU64,
    duplicated_bytes: AtomicU64,
}

impl CasIndex {
    /// Create a new empty CAS index
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one occurrence of `hash` and report whether it was seen before.
    pub fn classify(&self, hash: ChunkHash, size: u64) -> BlockClass {
        self.total_blocks.fetch_add(1, Ordering::Relaxed);
        match self.entries.entry(hash) {
            Entry::Occupied(mut e) => {
                e.get_mut().refs += 1;
                self.duplicated_blocks.fetch_add(1, Ordering::Relaxed);
                self.duplicated_bytes.fetch_add(size, Ordering::Relaxed);
                BlockClass::Duplicate
            }
            Entry::Vacant(e) => {
                e.insert(CasEntry { size, refs: 1 });
                BlockClass::Unique
            }
        }
    }

    /// Returns true if this hash is already indexed
    pub fn lookup(&self, hash: &ChunkHash) -> bool {
        self.entries.contains_key(hash)
    }

    /// Current reference count (0 if not present)
    pub fn refcount(&self, hash: &ChunkHash) -> u64 {
        self.entries.get(hash).map(|e| e.refs).unwrap_or(0)
    }

    /// Drop one reference. Returns true if the hash is no longer referenced.
    pub fn release(&self, hash: &ChunkHash) -> bool {
        match self.entries.entry(*hash) {
            Entry::Occupied(mut e) if e.get().refs > 1 => {
                e.get_mut().refs -= 1;
                false
            }
            Entry::Occupied(e) => {
                e.remove();
                true
            }
            Entry::Vacant(_) => false,
        }
    }

    /// Number of unique blocks tracked
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Is the index empty?
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes held by unique blocks
    pub fn unique_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }

    /// Summary of everything classified so far
    pub fn stats(&self) -> DeduplicationStats {
        let total = self.total_blocks.load(Ordering::Relaxed);
        let duplicated = self.duplicated_blocks.load(Ordering::Relaxed);
        DeduplicationStats {
            total_blocks: total,
            unique_blocks: total - duplicated,
            duplicated_blocks: duplicated,
            space_saved: self.duplicated_bytes.load(Ordering::Relaxed),
            ..Default::default()
        }
    }
}

/// Result of a deduplication pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeduplicationStats {
    /// Blocks seen
    pub total_blocks: u64,
    /// Blocks seen for the first time
    pub unique_blocks: u64,
    /// Blocks whose hash was already indexed
    pub duplicated_blocks: u64,
    /// Bytes of duplicate blocks that need not be stored again
    pub space_saved: u64,
    /// Files chunked to completion
    pub files_processed: u64,
    /// Files skipped because they could not be read
    pub files_failed: u64,
    /// One message per skipped file or directory entry
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl DeduplicationStats {
    /// Unique blocks over total blocks. 1.0 for an empty pass.
    pub fn dedup_ratio(&self) -> f64 {
        if self.total_blocks == 0 {
            1.0
        } else {
            self.unique_blocks as f64 / self.total_blocks as f64
        }
    }
}

#[derive(Default)]
struct PassCounters {
    total: AtomicU64,
    duplicated: AtomicU64,
    duplicated_bytes: AtomicU64,
    files_ok: AtomicU64,
    errors: Mutex<Vec<String>>,
}

/// Block deduplicator: a chunker plus a shared CAS index.
pub struct Deduplicator {
    chunker: Chunker,
    index: CasIndex,
    parallelism: usize,
    metrics: Option<Arc<ReductionMetrics>>,
}

impl Deduplicator {
    /// Create a deduplicator with an empty index
    pub fn new(chunker: Chunker) -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            chunker,
            index: CasIndex::new(),
            parallelism,
            metrics: None,
        }
    }

    /// Number of files chunked concurrently by [`Deduplicator::deduplicate_directory`]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Record dedup hits/misses into shared metrics
    pub fn with_metrics(mut self, metrics: Arc<ReductionMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The chunker used for files
    pub fn chunker(&self) -> &Chunker {
        &self.chunker
    }

    /// The shared index
    pub fn index(&self) -> &CasIndex {
        &self.index
    }

    /// Classify one block against the shared index
    pub fn classify(&self, chunk: &Chunk) -> BlockClass {
        let class = self.index.classify(chunk.hash, chunk.len() as u64);
        if let Some(m) = &self.metrics {
            match class {
                BlockClass::Unique => m.record_dedup_miss(),
                BlockClass::Duplicate => m.record_dedup_hit(),
            }
        }
        class
    }

    /// Summary of every block classified since creation
    pub fn stats(&self) -> DeduplicationStats {
        self.index.stats()
    }

    /// Chunk every regular file below `path` and classify its blocks.
    ///
    /// Files are chunked in parallel; the returned stats cover this pass only.
    /// Unreadable files are skipped and reported in `files_failed`.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub fn deduplicate_directory(&self, path: &Path) -> Result<DeduplicationStats, ReduceError> {
        let meta = std::fs::metadata(path)?;
        if !meta.is_dir() {
            return Err(ReduceError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a directory", path.display()),
            )));
        }

        let counters = PassCounters::default();
        let mut files = Vec::new();
        for entry in WalkDir::new(path).follow_links(false).sort_by_file_name() {
            match entry {
                Ok(e) if e.file_type().is_file() => files.push(e.into_path()),
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "skipping unreadable directory entry");
                    counters.errors.lock().push(e.to_string());
                }
            }
        }
        let walk_errors = counters.errors.lock().len() as u64;

        let queue = Mutex::new(files.into_iter());
        let workers = self.parallelism.max(1);
        std::thread::scope(|s| {
            for _ in 0..workers {
                s.spawn(|| loop {
                    let next = queue.lock().next();
                    let Some(file) = next else { break };
                    match self.dedupe_file(&file, &counters) {
                        Ok(()) => {
                            counters.files_ok.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            warn!(file = %file.display(), error = %e, "skipping unreadable file");
                            counters
                                .errors
                                .lock()
                                .push(format!("{}: {}", file.display(), e));
                        }
                    }
                });
            }
        });

        let total = counters.total.load(Ordering::Relaxed);
        let duplicated = counters.duplicated.load(Ordering::Relaxed);
        let errors = counters.errors.into_inner();
        let stats = DeduplicationStats {
            total_blocks: total,
            unique_blocks: total - duplicated,
            duplicated_blocks: duplicated,
            space_saved: counters.duplicated_bytes.load(Ordering::Relaxed),
            files_processed: counters.files_ok.load(Ordering::Relaxed),
            files_failed: errors.len() as u64 - walk_errors,
            errors,
        };
        info!(
            total_blocks = stats.total_blocks,
            duplicated = stats.duplicated_blocks,
            space_saved = stats.space_saved,
            "deduplication pass complete"
        );
        Ok(stats)
    }

    fn dedupe_file(&self, file: &Path, counters: &PassCounters) -> Result<(), ReduceError> {
        let reader = File::open(file)?;
        for chunk in self.chunker.chunk_reader(reader) {
            let chunk = chunk?;
            counters.total.fetch_add(1, Ordering::Relaxed);
            if self.classify(&chunk) == BlockClass::Duplicate {
                counters.duplicated.fetch_add(1, Ordering::Relaxed);
                counters
                    .duplicated_bytes
                    .fetch_add(chunk.len() as u64, Ordering::Relaxed);
            }
        }
        debug!(file = %file.display(), "file deduplicated");
        Ok(())
    }
}
