//! Manifest creation and manifest-vs-disk verification.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use vaultkeep_reduce::ChunkHash;

use crate::error::{BackupError, BackupResultT};
use crate::manifest::{BackupManifest, ManifestEntry, ManifestStore};
use crate::persist::{self, FORMAT_VERSION};
use crate::scan::{self, Discovery, SourceRoot};
use crate::workers::map_blocking;

/// Outcome for one path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    /// Hash and size match the manifest
    Valid,
    /// Present with different content
    Corrupted,
    /// In the manifest, absent on disk
    Missing,
    /// On disk, absent from the manifest
    Extra,
    /// Present but could not be read
    Unreadable,
}

/// One verified path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCheck {
    /// Snapshot key
    pub path: String,
    /// Classification
    pub status: CheckStatus,
    /// Hash recorded in the manifest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<ChunkHash>,
    /// Hash found on disk
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<ChunkHash>,
    /// Read error for unreadable files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Manifest-vs-disk comparison.
///
/// `total_files` counts manifest entries; extra files are reported but do not
/// lower the health score.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct VerificationResult {
    pub backup_id: String,
    pub total_files: u64,
    pub valid_files: u64,
    pub corrupted_files: u64,
    pub missing_files: u64,
    pub extra_files: u64,
    pub unreadable_files: u64,
    /// Every path examined, sorted by path
    pub checks: Vec<FileCheck>,
}

impl VerificationResult {
    /// Valid over total; 1.0 for an empty manifest.
    pub fn health_score(&self) -> f64 {
        if self.total_files == 0 {
            1.0
        } else {
            self.valid_files as f64 / self.total_files as f64
        }
    }

    /// Every manifest entry verified and no extras
    pub fn is_clean(&self) -> bool {
        self.valid_files == self.total_files && self.extra_files == 0
    }

    /// Paths with a given status
    pub fn paths_with(&self, status: CheckStatus) -> Vec<&str> {
        self.checks
            .iter()
            .filter(|c| c.status == status)
            .map(|c| c.path.as_str())
            .collect()
    }

    fn push(&mut self, check: FileCheck) {
        match check.status {
            CheckStatus::Valid => self.valid_files += 1,
            CheckStatus::Corrupted => self.corrupted_files += 1,
            CheckStatus::Missing => self.missing_files += 1,
            CheckStatus::Extra => self.extra_files += 1,
            CheckStatus::Unreadable => self.unreadable_files += 1,
        }
        self.checks.push(check);
    }
}

/// Counts from one past verification run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct VerificationRecord {
    pub backup_id: String,
    pub verified_at: DateTime<Utc>,
    pub total_files: u64,
    pub valid_files: u64,
    pub corrupted_files: u64,
    pub missing_files: u64,
    pub extra_files: u64,
    pub unreadable_files: u64,
    pub health_score: f64,
    /// Wall time of the run in milliseconds
    pub elapsed_ms: u64,
}

impl VerificationRecord {
    fn of(result: &VerificationResult, verified_at: DateTime<Utc>, elapsed_ms: u64) -> Self {
        Self {
            backup_id: result.backup_id.clone(),
            verified_at,
            total_files: result.total_files,
            valid_files: result.valid_files,
            corrupted_files: result.corrupted_files,
            missing_files: result.missing_files,
            extra_files: result.extra_files,
            unreadable_files: result.unreadable_files,
            health_score: result.health_score(),
            elapsed_ms,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct VerificationLog {
    format_version: u32,
    backup_id: String,
    records: Vec<VerificationRecord>,
}

/// Per-backup verification logs persisted as `<dir>/<backup_id>.json`,
/// oldest record first and capped at a fixed length.
pub struct VerificationHistory {
    dir: PathBuf,
    max_records: usize,
    // Appends are read-modify-write.
    write_lock: Mutex<()>,
}

impl VerificationHistory {
    /// Records kept per backup by default
    pub const DEFAULT_MAX_RECORDS: usize = 100;

    /// History rooted at `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_records: Self::DEFAULT_MAX_RECORDS,
            write_lock: Mutex::new(()),
        }
    }

    fn path_for(&self, backup_id: &str) -> BackupResultT<PathBuf> {
        persist::validate_name(backup_id)?;
        Ok(self.dir.join(format!("{}.json", backup_id)))
    }

    fn load(&self, backup_id: &str) -> BackupResultT<Vec<VerificationRecord>> {
        let path = self.path_for(backup_id)?;
        Ok(persist::read_document::<VerificationLog>(&path)?
            .map(|log| log.records)
            .unwrap_or_default())
    }

    /// Add a record, dropping the oldest beyond the cap.
    pub fn append(&self, record: VerificationRecord) -> BackupResultT<()> {
        let _guard = self.write_lock.lock();
        let backup_id = record.backup_id.clone();
        let path = self.path_for(&backup_id)?;
        let mut records = self.load(&backup_id)?;
        records.push(record);
        let excess = records.len().saturating_sub(self.max_records);
        records.drain(..excess);
        let log = VerificationLog {
            format_version: FORMAT_VERSION,
            backup_id,
            records,
        };
        persist::write_document(&path, &log)?;
        debug!(backup_id = %log.backup_id, kept = log.records.len(), "verification recorded");
        Ok(())
    }

    /// Newest first, at most `limit`, for one backup or for all of them.
    pub fn recent(
        &self,
        backup_id: Option<&str>,
        limit: usize,
    ) -> BackupResultT<Vec<VerificationRecord>> {
        let mut records = match backup_id {
            Some(id) => self.load(id)?,
            None => {
                let mut all = Vec::new();
                for id in persist::list_documents(&self.dir)? {
                    all.extend(self.load(&id)?);
                }
                all
            }
        };
        records.sort_by(|a, b| b.verified_at.cmp(&a.verified_at));
        records.truncate(limit);
        Ok(records)
    }

    /// Forget a backup's history; a missing log is ignored.
    pub fn delete(&self, backup_id: &str) -> BackupResultT<()> {
        let _guard = self.write_lock.lock();
        match std::fs::remove_file(self.path_for(backup_id)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Builds manifests from live trees and checks trees against them.
pub struct IntegrityVerifier {
    store: Arc<ManifestStore>,
    history: Option<Arc<VerificationHistory>>,
    parallelism: usize,
    cancel: CancellationToken,
}

impl IntegrityVerifier {
    /// Verifier over a manifest store
    pub fn new(store: Arc<ManifestStore>, parallelism: usize) -> Self {
        Self {
            store,
            history: None,
            parallelism: parallelism.max(1),
            cancel: CancellationToken::new(),
        }
    }

    /// Record a summary of every verification in `history`
    pub fn with_history(mut self, history: Arc<VerificationHistory>) -> Self {
        self.history = Some(history);
        self
    }

    /// Past verifications, newest first. Empty when no history is attached.
    pub fn verification_history(
        &self,
        backup_id: Option<&str>,
        limit: usize,
    ) -> BackupResultT<Vec<VerificationRecord>> {
        match &self.history {
            Some(h) => h.recent(backup_id, limit),
            None => Ok(Vec::new()),
        }
    }

    /// Share a cancellation token with the caller
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Hash every file under `path` and persist the manifest under `backup_id`.
    pub async fn create_backup_manifest(
        &self,
        backup_id: &str,
        path: &Path,
    ) -> BackupResultT<BackupManifest> {
        self.create_backup_manifest_of(backup_id, vec![SourceRoot::new(path)])
            .await
    }

    /// Multi-root form of [`IntegrityVerifier::create_backup_manifest`].
    #[instrument(skip(self, roots))]
    pub async fn create_backup_manifest_of(
        &self,
        backup_id: &str,
        roots: Vec<SourceRoot>,
    ) -> BackupResultT<BackupManifest> {
        let discovery = scan::discover_async(roots).await?;
        let hashed = self.hash_all(&discovery).await?;
        let mut entries = Vec::with_capacity(hashed.len());
        for (key, result) in hashed {
            match result {
                Ok((hash, size)) => entries.push(ManifestEntry {
                    path: key,
                    hash,
                    size,
                }),
                Err(e) => warn!(file = %key, error = %e, "left out of manifest"),
            }
        }
        let manifest = BackupManifest::new(backup_id, discovery.roots, entries);
        self.store.save(&manifest)?;
        info!(backup_id, files = manifest.total_files, "manifest created");
        Ok(manifest)
    }

    /// Persist a manifest built elsewhere.
    pub fn record_manifest(&self, manifest: &BackupManifest) -> BackupResultT<()> {
        self.store.save(manifest).map(|_| ())
    }

    /// Load a stored manifest
    pub fn load_manifest(&self, backup_id: &str) -> BackupResultT<BackupManifest> {
        self.store.load(backup_id)
    }

    /// Stored backup ids
    pub fn list_manifests(&self) -> BackupResultT<Vec<String>> {
        self.store.list()
    }

    /// Re-hash the tree at `path` and compare it with the stored manifest.
    pub async fn verify_backup_integrity(
        &self,
        backup_id: &str,
        path: &Path,
    ) -> BackupResultT<VerificationResult> {
        let manifest = self.store.load(backup_id)?;
        let roots = match manifest.roots.as_slice() {
            [only] => vec![SourceRoot {
                label: only.label.clone(),
                path: path.to_path_buf(),
            }],
            _ => vec![SourceRoot::new(path)],
        };
        self.verify_against(&manifest, roots).await
    }

    /// Compare the manifest's own recorded roots with their current content.
    pub async fn verify(&self, backup_id: &str) -> BackupResultT<VerificationResult> {
        let manifest = self.store.load(backup_id)?;
        let roots = manifest.roots.clone();
        if roots.is_empty() {
            return Err(BackupError::InvalidJobConfig(format!(
                "manifest {} records no source roots",
                backup_id
            )));
        }
        self.verify_against(&manifest, roots).await
    }

    #[instrument(skip(self, manifest, roots), fields(backup_id = %manifest.backup_id))]
    async fn verify_against(
        &self,
        manifest: &BackupManifest,
        roots: Vec<SourceRoot>,
    ) -> BackupResultT<VerificationResult> {
        let started = Instant::now();
        let verified_at = Utc::now();
        let discovery = scan::discover_async(roots).await?;
        let mut on_disk: BTreeMap<String, Result<(ChunkHash, u64), String>> = self
            .hash_all(&discovery)
            .await?
            .into_iter()
            .collect();

        let mut result = VerificationResult {
            backup_id: manifest.backup_id.clone(),
            total_files: manifest.entries.len() as u64,
            ..VerificationResult::default()
        };

        for entry in &manifest.entries {
            let check = match on_disk.remove(&entry.path) {
                None => FileCheck {
                    path: entry.path.clone(),
                    status: CheckStatus::Missing,
                    expected: Some(entry.hash),
                    actual: None,
                    error: None,
                },
                Some(Err(e)) => FileCheck {
                    path: entry.path.clone(),
                    status: CheckStatus::Unreadable,
                    expected: Some(entry.hash),
                    actual: None,
                    error: Some(e),
                },
                Some(Ok((hash, size))) => FileCheck {
                    path: entry.path.clone(),
                    status: if hash == entry.hash && size == entry.size {
                        CheckStatus::Valid
                    } else {
                        CheckStatus::Corrupted
                    },
                    expected: Some(entry.hash),
                    actual: Some(hash),
                    error: None,
                },
            };
            result.push(check);
        }

        for (path, found) in on_disk {
            result.push(FileCheck {
                path,
                status: CheckStatus::Extra,
                expected: None,
                actual: found.ok().map(|(h, _)| h),
                error: None,
            });
        }
        result.checks.sort_by(|a, b| a.path.cmp(&b.path));

        if result.is_clean() {
            info!(files = result.total_files, "verification passed");
        } else {
            warn!(
                valid = result.valid_files,
                corrupted = result.corrupted_files,
                missing = result.missing_files,
                extra = result.extra_files,
                unreadable = result.unreadable_files,
                "verification found problems"
            );
        }
        if let Some(history) = &self.history {
            let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            let record = VerificationRecord::of(&result, verified_at, elapsed_ms);
            if let Err(e) = history.append(record) {
                warn!(error = %e, "verification history not updated");
            }
        }
        Ok(result)
    }

    async fn hash_all(
        &self,
        discovery: &Discovery,
    ) -> BackupResultT<Vec<(String, Result<(ChunkHash, u64), String>)>> {
        let files = discovery.files.clone();
        let keys: Vec<String> = files.iter().map(|f| f.key.clone()).collect();
        let results = map_blocking(files, self.parallelism, &self.cancel, |file| {
            scan::hash_file(&file.abs_path)
        })
        .await;

        let mut out = Vec::with_capacity(keys.len());
        for (key, result) in keys.into_iter().zip(results) {
            let hashed = match result {
                Ok(Ok(v)) => Ok(v),
                Ok(Err(e)) => Err(e.to_string()),
                Err(BackupError::Cancelled) => return Err(BackupError::Cancelled),
                Err(e) => Err(e.to_string()),
            };
            out.push((key, hashed));
        }
        Ok(out)
    }
}
