//! Granular restore of files and directories from a snapshot.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use vaultkeep_reduce::{ContentHasher, ReductionPipeline};
use vaultkeep_storage::{filesystem_capacity, StorageManager};

use crate::error::{BackupError, BackupResultT};
use crate::layout::block_artifact_id;
use crate::scan::key_to_path;
use crate::snapshot::{FileRecord, Snapshot, SnapshotStore};

/// One requested restore
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreTarget {
    /// Snapshot to restore from
    pub snapshot_name: String,
    /// Snapshot key of a file or directory, or an absolute path under one of the
    /// snapshot's roots. Empty restores the whole snapshot.
    pub source_path: String,
    /// Where the file, or the directory's contents, should land
    pub target_path: PathBuf,
}

impl RestoreTarget {
    /// Convenience constructor
    pub fn new(
        snapshot_name: impl Into<String>,
        source_path: impl Into<String>,
        target_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            snapshot_name: snapshot_name.into(),
            source_path: source_path.into(),
            target_path: target_path.into(),
        }
    }
}

/// A file a target resolves to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedFile {
    /// Snapshot key
    pub source: String,
    /// Output path
    pub destination: PathBuf,
    /// Bytes that will be written
    pub size: u64,
}

/// Outcome of a restore batch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RestoreResult {
    /// Files written and verified
    pub files_restored: u64,
    /// Bytes written
    pub total_size_restored: u64,
    /// One message per failed target or file
    pub errors: Vec<String>,
}

impl RestoreResult {
    /// No target or file failed
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

struct FileJob {
    record: FileRecord,
    destination: PathBuf,
    destinations: Arc<Vec<String>>,
}

/// Materializes snapshot content from storage destinations.
pub struct GranularRestorer {
    snapshots: Arc<SnapshotStore>,
    storage: Arc<StorageManager>,
    pipeline: Arc<ReductionPipeline>,
    parallelism: usize,
    cancel: CancellationToken,
}

impl GranularRestorer {
    /// The pipeline must carry the passphrase for encrypted snapshots.
    pub fn new(
        snapshots: Arc<SnapshotStore>,
        storage: Arc<StorageManager>,
        pipeline: Arc<ReductionPipeline>,
        parallelism: usize,
    ) -> Self {
        Self {
            snapshots,
            storage,
            pipeline,
            parallelism: parallelism.max(1),
            cancel: CancellationToken::new(),
        }
    }

    /// Share a cancellation token with the caller
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Files a target would write, without reading any content.
    pub fn preview_restore(&self, target: &RestoreTarget) -> BackupResultT<Vec<PlannedFile>> {
        let snapshot = self.snapshots.load(&target.snapshot_name)?;
        Ok(resolve(&snapshot, target)?
            .into_iter()
            .map(|(record, destination)| PlannedFile {
                source: record.path.clone(),
                destination,
                size: record.size,
            })
            .collect())
    }

    /// Problems that would stop `target` from restoring: an unknown snapshot,
    /// a source path it does not hold, no registered destination with its
    /// content, or an output location that cannot be created, written or fit.
    /// Missing output directories are created. Empty means ready.
    pub fn validate_restore_target(&self, target: &RestoreTarget) -> Vec<String> {
        let mut problems = Vec::new();
        let snapshot = match self.snapshots.load(&target.snapshot_name) {
            Ok(s) => s,
            Err(e) => {
                problems.push(e.to_string());
                return problems;
            }
        };
        if snapshot.destinations.is_empty() {
            problems.push("snapshot has no stored content".to_string());
        } else if !snapshot.destinations.iter().any(|d| self.storage.contains(d)) {
            problems.push(format!(
                "none of the snapshot's destinations ({}) is registered",
                snapshot.destinations.join(", ")
            ));
        }
        let planned = match resolve(&snapshot, target) {
            Ok(p) => p,
            Err(e) => {
                problems.push(e.to_string());
                return problems;
            }
        };

        let single_file = planned.len() == 1 && planned[0].1 == target.target_path;
        let out_dir = if single_file {
            if target.target_path.is_dir() {
                problems.push(format!(
                    "{} is a directory, a file is to be restored there",
                    target.target_path.display()
                ));
            }
            target
                .target_path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(Path::new("."))
                .to_path_buf()
        } else {
            target.target_path.clone()
        };
        if let Err(e) = check_writable(&out_dir) {
            problems.push(format!("{} is not writable: {}", out_dir.display(), e));
            return problems;
        }
        let needed: u64 = planned.iter().map(|(r, _)| r.size).sum();
        if let Some(cap) = filesystem_capacity(&out_dir) {
            if cap.free_bytes < needed {
                problems.push(format!(
                    "{} bytes needed, {} free at {}",
                    needed,
                    cap.free_bytes,
                    out_dir.display()
                ));
            }
        }
        problems
    }

    /// Restore every target. Failures are collected per target and per file;
    /// nothing in the batch aborts the rest.
    #[instrument(skip_all, fields(targets = targets.len()))]
    pub async fn restore_files(&self, targets: &[RestoreTarget]) -> RestoreResult {
        let mut result = RestoreResult::default();
        let mut jobs = Vec::new();

        for target in targets {
            match self.plan_target(target) {
                Ok(mut planned) => jobs.append(&mut planned),
                Err(e) => {
                    warn!(snapshot = %target.snapshot_name, source = %target.source_path, error = %e, "restore target rejected");
                    result.errors.push(format!(
                        "{}:{}: {}",
                        target.snapshot_name, target.source_path, e
                    ));
                }
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let mut handles = Vec::with_capacity(jobs.len());
        for job in jobs {
            let sem = Arc::clone(&semaphore);
            let storage = Arc::clone(&self.storage);
            let pipeline = Arc::clone(&self.pipeline);
            let cancel = self.cancel.clone();
            let label = job.record.path.clone();
            handles.push((
                label,
                tokio::spawn(async move {
                    let _permit = sem
                        .acquire_owned()
                        .await
                        .map_err(|_| BackupError::Cancelled)?;
                    restore_one(&storage, &pipeline, &job, &cancel).await
                }),
            ));
        }

        for (label, handle) in handles {
            match handle.await {
                Ok(Ok(size)) => {
                    result.files_restored += 1;
                    result.total_size_restored += size;
                }
                Ok(Err(e)) => {
                    warn!(file = %label, error = %e, "restore failed");
                    result.errors.push(format!("{}: {}", label, e));
                }
                Err(e) => result.errors.push(format!("{}: {}", label, e)),
            }
        }

        info!(
            files = result.files_restored,
            bytes = result.total_size_restored,
            errors = result.errors.len(),
            "restore finished"
        );
        result
    }

    fn plan_target(&self, target: &RestoreTarget) -> BackupResultT<Vec<FileJob>> {
        let snapshot = self.snapshots.load(&target.snapshot_name)?;
        if snapshot.destinations.is_empty() {
            return Err(BackupError::Restore {
                target: target.source_path.clone(),
                reason: "snapshot has no stored content".into(),
            });
        }
        let destinations = Arc::new(snapshot.destinations.clone());
        Ok(resolve(&snapshot, target)?
            .into_iter()
            .map(|(record, destination)| FileJob {
                record: record.clone(),
                destination,
                destinations: Arc::clone(&destinations),
            })
            .collect())
    }
}

/// Create `dir` if needed and write then remove a scratch file in it.
fn check_writable(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let scratch = dir.join(format!(".vaultkeep-write-check-{}", uuid::Uuid::new_v4().simple()));
    std::fs::write(&scratch, b"")?;
    std::fs::remove_file(&scratch)
}

/// Map a target onto snapshot records and their output paths.
fn resolve<'a>(
    snapshot: &'a Snapshot,
    target: &RestoreTarget,
) -> BackupResultT<Vec<(&'a FileRecord, PathBuf)>> {
    let fail = |reason: &str| BackupError::Restore {
        target: target.source_path.clone(),
        reason: reason.to_string(),
    };
    let key = snapshot_key(snapshot, &target.source_path)
        .ok_or_else(|| fail("not under any snapshot root"))?;

    if let Some(record) = snapshot.files.get(&key) {
        return Ok(vec![(record, target.target_path.clone())]);
    }
    let records = snapshot.select(&key);
    if records.is_empty() {
        return Err(fail("not found in snapshot"));
    }
    let mut out = Vec::with_capacity(records.len());
    for record in records {
        let rel = if key.is_empty() {
            record.path.as_str()
        } else {
            record
                .path
                .strip_prefix(key.as_str())
                .and_then(|r| r.strip_prefix('/'))
                .unwrap_or(record.path.as_str())
        };
        let rel = key_to_path(rel).ok_or_else(|| fail("snapshot key escapes target"))?;
        out.push((record, target.target_path.join(rel)));
    }
    Ok(out)
}

/// Snapshot key for a source path: absolute paths are mapped through the roots.
fn snapshot_key(snapshot: &Snapshot, source: &str) -> Option<String> {
    let path = Path::new(source);
    if !path.is_absolute() {
        return Some(source.trim_matches('/').to_string());
    }
    snapshot.roots.iter().find_map(|root| {
        let rel = path.strip_prefix(&root.path).ok()?;
        let rel_key = crate::scan::path_to_key(rel);
        Some(match (&root.label, rel_key.is_empty()) {
            (Some(label), true) => label.clone(),
            (Some(label), false) => format!("{}/{}", label, rel_key),
            (None, _) => rel_key,
        })
    })
}

/// Stream one file's blocks into a temporary file, verify, then rename into place.
async fn restore_one(
    storage: &StorageManager,
    pipeline: &Arc<ReductionPipeline>,
    job: &FileJob,
    cancel: &CancellationToken,
) -> BackupResultT<u64> {
    let dest = &job.destination;
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file_name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| BackupError::Restore {
            target: job.record.path.clone(),
            reason: format!("{} has no file name", dest.display()),
        })?;
    let tmp = dest.with_file_name(format!(".{}.restore-{}", file_name, uuid::Uuid::new_v4()));

    let outcome = write_blocks(storage, pipeline, job, cancel, &tmp).await;
    match outcome {
        Ok(written) => {
            if let Err(e) = tokio::fs::rename(&tmp, dest).await {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(e.into());
            }
            debug!(file = %job.record.path, bytes = written, "file restored");
            Ok(written)
        }
        Err(e) => {
            let _ = tokio::fs::remove_file(&tmp).await;
            Err(e)
        }
    }
}

async fn write_blocks(
    storage: &StorageManager,
    pipeline: &Arc<ReductionPipeline>,
    job: &FileJob,
    cancel: &CancellationToken,
    tmp: &Path,
) -> BackupResultT<u64> {
    let mut out = tokio::fs::File::create(tmp).await?;
    let mut hasher = ContentHasher::new();

    for hash in &job.record.blocks {
        if cancel.is_cancelled() {
            return Err(BackupError::Cancelled);
        }
        let (_, stored) = storage
            .read_any(&block_artifact_id(hash), &job.destinations)
            .await?;
        let data = decode_block(pipeline, stored, *hash).await?;
        hasher.update(&data);
        out.write_all(&data).await?;
    }
    out.flush().await?;
    out.sync_all().await?;

    let actual = hasher.finalize();
    if actual != job.record.content_hash || hasher.len() != job.record.size {
        return Err(BackupError::Reduce(vaultkeep_reduce::ReduceError::HashMismatch {
            expected: job.record.content_hash.to_hex(),
            actual: actual.to_hex(),
        }));
    }
    Ok(hasher.len())
}

pub(crate) async fn decode_block(
    pipeline: &Arc<ReductionPipeline>,
    stored: Bytes,
    hash: vaultkeep_reduce::ChunkHash,
) -> BackupResultT<Vec<u8>> {
    let pipeline = Arc::clone(pipeline);
    tokio::task::spawn_blocking(move || pipeline.restore_block(&stored, &hash))
        .await
        .map_err(|e| BackupError::Io(std::io::Error::other(e.to_string())))?
        .map_err(BackupError::from)
}
