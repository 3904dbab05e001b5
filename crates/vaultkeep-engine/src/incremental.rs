//! Snapshot creation and change detection against a baseline.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use vaultkeep_reduce::Chunker;

use crate::error::{BackupError, BackupResultT};
use crate::scan::{self, DiscoveredFile, Discovery, SourceRoot};
use crate::snapshot::{FileRecord, Snapshot, SnapshotStore, SnapshotSummary};
use crate::workers::map_blocking;

/// How a file differs from the baseline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// Not in the baseline
    New,
    /// In the baseline with different content
    Modified,
    /// In the baseline, gone now
    Deleted,
}

/// One changed path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    /// Snapshot key
    pub path: String,
    /// Kind of change
    pub kind: ChangeKind,
    /// Size in the baseline
    pub old_size: Option<u64>,
    /// Size now
    pub new_size: Option<u64>,
}

/// Difference between a baseline snapshot and the live tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    /// Baseline snapshot name; `None` means everything is new
    pub baseline: Option<String>,
    /// Files present now
    pub total_files: u64,
    /// Files absent from the baseline
    pub new_files: u64,
    /// Files whose size or content hash differs from the baseline
    pub modified_files: u64,
    /// Baseline files no longer present; not part of `changed_files`
    pub deleted_files: u64,
    /// Files identical to the baseline
    pub unchanged_files: u64,
    /// `new_files + modified_files`
    pub changed_files: u64,
    /// Current size of new and modified files
    pub total_size_changed: u64,
    /// Every new, modified and deleted path, sorted by path
    pub changes: Vec<FileChange>,
    /// Records for every file present now
    #[serde(skip)]
    pub current: BTreeMap<String, FileRecord>,
    /// Files that could not be read; neither changed nor deleted
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl ChangeSet {
    /// Compare current records with a baseline.
    ///
    /// `unreadable` keys are left out of the deleted set: a file that exists but
    /// could not be read this time has not been deleted.
    pub fn classify(
        baseline: Option<&Snapshot>,
        current: BTreeMap<String, FileRecord>,
        unreadable: &BTreeSet<String>,
    ) -> Self {
        let mut set = ChangeSet {
            baseline: baseline.map(|b| b.name.clone()),
            total_files: current.len() as u64,
            ..ChangeSet::default()
        };

        for (key, record) in &current {
            let old = baseline.and_then(|b| b.files.get(key));
            let kind = match old {
                None => ChangeKind::New,
                Some(old) if old.content_hash != record.content_hash || old.size != record.size => {
                    ChangeKind::Modified
                }
                Some(_) => {
                    set.unchanged_files += 1;
                    continue;
                }
            };
            match kind {
                ChangeKind::New => set.new_files += 1,
                _ => set.modified_files += 1,
            }
            set.total_size_changed += record.size;
            set.changes.push(FileChange {
                path: key.clone(),
                kind,
                old_size: old.map(|o| o.size),
                new_size: Some(record.size),
            });
        }

        if let Some(base) = baseline {
            for (key, old) in &base.files {
                if current.contains_key(key) || unreadable.contains(key) {
                    continue;
                }
                set.deleted_files += 1;
                set.changes.push(FileChange {
                    path: key.clone(),
                    kind: ChangeKind::Deleted,
                    old_size: Some(old.size),
                    new_size: None,
                });
            }
        }

        set.changes.sort_by(|a, b| a.path.cmp(&b.path));
        set.changed_files = set.new_files + set.modified_files;
        set.current = current;
        set
    }

    /// Paths of new and modified files
    pub fn changed_paths(&self) -> impl Iterator<Item = &str> {
        self.changes
            .iter()
            .filter(|c| c.kind != ChangeKind::Deleted)
            .map(|c| c.path.as_str())
    }

    /// Whether `path` is listed as new, modified or deleted
    pub fn contains(&self, path: &str) -> bool {
        self.changes.iter().any(|c| c.path == path)
    }

    /// Counters only
    pub fn summary(&self) -> ChangeSummary {
        ChangeSummary {
            baseline: self.baseline.clone(),
            total_files: self.total_files,
            new_files: self.new_files,
            modified_files: self.modified_files,
            deleted_files: self.deleted_files,
            unchanged_files: self.unchanged_files,
            changed_files: self.changed_files,
            total_size_changed: self.total_size_changed,
        }
    }
}

/// Counter view of a [`ChangeSet`], carried in backup results
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct ChangeSummary {
    pub baseline: Option<String>,
    pub total_files: u64,
    pub new_files: u64,
    pub modified_files: u64,
    pub deleted_files: u64,
    pub unchanged_files: u64,
    pub changed_files: u64,
    pub total_size_changed: u64,
}

/// Split of a discovery against a baseline before any content is read.
#[derive(Debug, Clone, Default)]
pub struct ChangePlan {
    /// Baseline records whose size and mtime still match
    pub reused: Vec<FileRecord>,
    /// Files whose content must be read
    pub candidates: Vec<DiscoveredFile>,
}

/// Default span before a baseline scan inside which metadata is not trusted
pub const DEFAULT_RACY_WINDOW: Duration = Duration::from_secs(2);

/// Decide which discovered files need reading. Without a baseline, or with
/// `trust_metadata` off, every file is a candidate.
///
/// A baseline record is reused only when size, mtime, ctime and inode all
/// match and the file's last metadata change lies at least `racy_window`
/// before the baseline scan began. Anything changed closer to the scan could
/// have been rewritten within the same timestamp tick and is read again.
pub fn plan_changes(
    baseline: Option<&Snapshot>,
    discovery: &Discovery,
    trust_metadata: bool,
    racy_window: Duration,
) -> ChangePlan {
    let window_ns = i64::try_from(racy_window.as_nanos()).unwrap_or(i64::MAX);
    let cutoff = baseline
        .map(|b| b.scan_cutoff_ns().saturating_sub(window_ns))
        .unwrap_or(i64::MIN);
    let mut plan = ChangePlan::default();
    for file in &discovery.files {
        let old = baseline
            .filter(|_| trust_metadata)
            .and_then(|b| b.files.get(&file.key))
            .filter(|old| old.metadata_matches(file) && file.changed_ns() < cutoff);
        match old {
            Some(old) => plan.reused.push(old.clone()),
            None => plan.candidates.push(file.clone()),
        }
    }
    plan
}

/// Result of fingerprinting a batch of files
#[derive(Debug, Default)]
pub(crate) struct FingerprintBatch {
    pub records: Vec<FileRecord>,
    pub unreadable: BTreeSet<String>,
    pub errors: Vec<String>,
}

/// Creates snapshots and diffs live trees against them.
pub struct IncrementalEngine {
    store: Arc<SnapshotStore>,
    chunker: Arc<Chunker>,
    parallelism: usize,
    trust_metadata: bool,
    racy_window: Duration,
    cancel: CancellationToken,
}

impl IncrementalEngine {
    /// Engine over a snapshot store.
    pub fn new(store: Arc<SnapshotStore>, chunker: Arc<Chunker>, parallelism: usize) -> Self {
        Self {
            store,
            chunker,
            parallelism: parallelism.max(1),
            trust_metadata: true,
            racy_window: DEFAULT_RACY_WINDOW,
            cancel: CancellationToken::new(),
        }
    }

    /// Toggle the size+mtime shortcut in [`IncrementalEngine::analyze_changes`]
    pub fn with_trust_metadata(mut self, trust: bool) -> Self {
        self.trust_metadata = trust;
        self
    }

    /// Span before a baseline scan inside which metadata is re-verified by content
    pub fn with_racy_window(mut self, window: Duration) -> Self {
        self.racy_window = window;
        self
    }

    /// Share a cancellation token with the caller
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Underlying store
    pub fn store(&self) -> &Arc<SnapshotStore> {
        &self.store
    }

    /// Snapshot a single tree and persist it under `name`.
    pub async fn create_snapshot(&self, name: &str, path: &Path) -> BackupResultT<Snapshot> {
        self.create_snapshot_of(name, vec![SourceRoot::new(path)]).await
    }

    /// Snapshot several trees into one snapshot.
    #[instrument(skip(self, roots), fields(roots = roots.len()))]
    pub async fn create_snapshot_of(
        &self,
        name: &str,
        roots: Vec<SourceRoot>,
    ) -> BackupResultT<Snapshot> {
        if self.store.exists(name)? {
            return Err(BackupError::SnapshotExists(name.to_string()));
        }
        let discovery = scan::discover_async(roots).await?;
        let batch = self.fingerprint(discovery.files.clone()).await?;

        let mut snapshot = Snapshot::new(name, discovery.roots);
        snapshot.scanned_at = Some(discovery.started_at);
        for record in batch.records {
            snapshot.insert(record);
        }
        self.store.save(&snapshot)?;
        info!(
            snapshot = name,
            files = snapshot.file_count(),
            skipped = batch.errors.len(),
            "snapshot created"
        );
        Ok(snapshot)
    }

    /// Diff the tree at `path` against a stored snapshot.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn analyze_changes(&self, baseline_name: &str, path: &Path) -> BackupResultT<ChangeSet> {
        let baseline = self.store.load(baseline_name)?;
        let roots = match baseline.roots.as_slice() {
            [only] => vec![SourceRoot {
                label: only.label.clone(),
                path: path.to_path_buf(),
            }],
            _ => vec![SourceRoot::new(path)],
        };
        let discovery = scan::discover_async(roots).await?;
        let set = self.diff(Some(&baseline), &discovery).await?;
        info!(
            baseline = baseline_name,
            new = set.new_files,
            modified = set.modified_files,
            deleted = set.deleted_files,
            unchanged = set.unchanged_files,
            "changes analyzed"
        );
        Ok(set)
    }

    /// Diff an existing discovery against an optional baseline.
    pub async fn diff(
        &self,
        baseline: Option<&Snapshot>,
        discovery: &Discovery,
    ) -> BackupResultT<ChangeSet> {
        let plan = plan_changes(baseline, discovery, self.trust_metadata, self.racy_window);
        let batch = self.fingerprint(plan.candidates).await?;

        let mut current: BTreeMap<String, FileRecord> = plan
            .reused
            .into_iter()
            .map(|r| (r.path.clone(), r))
            .collect();
        for record in batch.records {
            current.insert(record.path.clone(), record);
        }
        let mut set = ChangeSet::classify(baseline, current, &batch.unreadable);
        set.errors = discovery.errors.clone();
        set.errors.extend(batch.errors);
        Ok(set)
    }

    /// Stored snapshots, oldest first
    pub fn list_snapshots(&self) -> BackupResultT<Vec<SnapshotSummary>> {
        self.store.list()
    }

    /// Load a stored snapshot
    pub fn get_snapshot(&self, name: &str) -> BackupResultT<Snapshot> {
        self.store.load(name)
    }

    /// Remove a stored snapshot
    pub fn delete_snapshot(&self, name: &str) -> BackupResultT<()> {
        self.store.delete(name)
    }

    pub(crate) async fn fingerprint(
        &self,
        files: Vec<DiscoveredFile>,
    ) -> BackupResultT<FingerprintBatch> {
        let keys: Vec<String> = files.iter().map(|f| f.key.clone()).collect();
        let chunker = Arc::clone(&self.chunker);
        let results = map_blocking(files, self.parallelism, &self.cancel, move |file| {
            scan::fingerprint_file(&file, &chunker)
        })
        .await;

        let mut batch = FingerprintBatch::default();
        for (key, result) in keys.into_iter().zip(results) {
            match result.and_then(|r| r) {
                Ok(record) => batch.records.push(record),
                Err(BackupError::Cancelled) => return Err(BackupError::Cancelled),
                Err(e) => {
                    warn!(file = %key, error = %e, "file skipped");
                    batch.errors.push(format!("{}: {}", key, e));
                    batch.unreadable.insert(key);
                }
            }
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use vaultkeep_reduce::{blake3_hash, ChunkerConfig};

    fn engine(dir: &Path) -> IncrementalEngine {
        let chunker = Chunker::with_config(ChunkerConfig {
            min_size: 256,
            avg_size: 1024,
            max_size: 4096,
        })
        .unwrap();
        IncrementalEngine::new(
            Arc::new(SnapshotStore::new(dir.join("state"))),
            Arc::new(chunker),
            4,
        )
    }

    fn rec(path: &str, body: &[u8]) -> FileRecord {
        FileRecord {
            path: path.into(),
            size: body.len() as u64,
            mtime_ns: 0,
            ctime_ns: 0,
            inode: 0,
            content_hash: blake3_hash(body),
            blocks: vec![],
        }
    }

    #[test]
    fn test_classify_counts() {
        let mut base = Snapshot::new("base", vec![]);
        base.insert(rec("a", b"1"));
        base.insert(rec("b", b"2"));
        base.insert(rec("gone", b"3"));
        base.insert(rec("locked", b"4"));

        let current: BTreeMap<_, _> = [rec("a", b"changed"), rec("b", b"2"), rec("c", b"new")]
            .into_iter()
            .map(|r| (r.path.clone(), r))
            .collect();
        let unreadable: BTreeSet<String> = ["locked".to_string()].into();
        let set = ChangeSet::classify(Some(&base), current, &unreadable);

        assert_eq!(set.total_files, 3);
        assert_eq!(set.new_files, 1);
        assert_eq!(set.modified_files, 1);
        assert_eq!(set.unchanged_files, 1);
        assert_eq!(set.deleted_files, 1);
        assert_eq!(set.changed_files, 2);
        assert_eq!(set.total_size_changed, 7 + 3);
        assert!(!set.contains("b"));
        assert!(!set.contains("locked"));
        let changed: Vec<&str> = set.changed_paths().collect();
        assert_eq!(changed, vec!["a", "c"]);
    }

    #[test]
    fn test_classify_without_baseline() {
        let current: BTreeMap<_, _> = [rec("x", b"1"), rec("y", b"22")]
            .into_iter()
            .map(|r| (r.path.clone(), r))
            .collect();
        let set = ChangeSet::classify(None, current, &BTreeSet::new());
        assert_eq!(set.new_files, 2);
        assert_eq!(set.changed_files, 2);
        assert_eq!(set.deleted_files, 0);
        assert!(set.baseline.is_none());
    }

    #[tokio::test]
    async fn test_snapshot_then_analyze() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("a"), b"original a").unwrap();
        fs::write(src.join("b"), b"original b").unwrap();
        fs::write(src.join("d"), b"doomed").unwrap();

        let engine = engine(dir.path());
        let snap = engine.create_snapshot("base", &src).await.unwrap();
        assert_eq!(snap.file_count(), 3);

        fs::write(src.join("a"), b"a was modified and grew").unwrap();
        fs::write(src.join("c"), b"brand new").unwrap();
        fs::remove_file(src.join("d")).unwrap();

        let set = engine.analyze_changes("base", &src).await.unwrap();
        assert_eq!(set.new_files, 1);
        assert_eq!(set.modified_files, 1);
        assert_eq!(set.deleted_files, 1);
        assert_eq!(set.changed_files, 2);
        assert!(!set.contains("b"));
        assert_eq!(set.current.len(), 3);
    }

    #[tokio::test]
    async fn test_metadata_untrusted_rehashes() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("a"), b"same").unwrap();

        let engine = engine(dir.path()).with_trust_metadata(false);
        engine.create_snapshot("base", &src).await.unwrap();
        let set = engine.analyze_changes("base", &src).await.unwrap();
        assert_eq!(set.unchanged_files, 1);
        assert_eq!(set.changed_files, 0);
    }

    #[tokio::test]
    async fn test_same_size_rewrite_with_restored_mtime_is_modified() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(&src).unwrap();
        let path = src.join("f");
        fs::write(&path, b"aaaa").unwrap();
        let mtime = fs::metadata(&path).unwrap().modified().unwrap();

        let engine = engine(dir.path());
        engine.create_snapshot("base", &src).await.unwrap();

        fs::write(&path, b"bbbb").unwrap();
        fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(mtime)
            .unwrap();

        let set = engine.analyze_changes("base", &src).await.unwrap();
        assert_eq!(set.modified_files, 1);
        assert!(set.contains("f"));
    }

    #[tokio::test]
    async fn test_replaced_inode_is_modified_outside_racy_window() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(&src).unwrap();
        let path = src.join("f");
        fs::write(&path, b"aaaa").unwrap();
        let mtime = fs::metadata(&path).unwrap().modified().unwrap();

        let engine = engine(dir.path()).with_racy_window(Duration::ZERO);
        engine.create_snapshot("base", &src).await.unwrap();

        let staged = dir.path().join("staged");
        fs::write(&staged, b"bbbb").unwrap();
        fs::File::options()
            .write(true)
            .open(&staged)
            .unwrap()
            .set_modified(mtime)
            .unwrap();
        fs::rename(&staged, &path).unwrap();

        let set = engine.analyze_changes("base", &src).await.unwrap();
        assert_eq!(set.modified_files, 1);
    }

    #[test]
    fn test_plan_reuses_only_settled_files() {
        let file = |key: &str, changed: i64| DiscoveredFile {
            key: key.into(),
            abs_path: key.into(),
            size: 1,
            mtime_ns: changed,
            ctime_ns: changed,
            inode: 7,
        };
        let mut base = Snapshot::new("base", vec![]);
        base.scanned_at = Some(base.created_at);
        let cutoff = base.scan_cutoff_ns();
        for f in [file("old", cutoff - 10_000_000_000), file("racy", cutoff - 1)] {
            base.insert(FileRecord::captured(&f, 1, blake3_hash(b"x"), vec![]));
        }
        let discovery = Discovery {
            roots: vec![],
            files: vec![file("old", cutoff - 10_000_000_000), file("racy", cutoff - 1)],
            errors: vec![],
            started_at: base.created_at,
        };

        let plan = plan_changes(Some(&base), &discovery, true, DEFAULT_RACY_WINDOW);
        let reused: Vec<&str> = plan.reused.iter().map(|r| r.path.as_str()).collect();
        let read: Vec<&str> = plan.candidates.iter().map(|f| f.key.as_str()).collect();
        assert_eq!(reused, vec!["old"]);
        assert_eq!(read, vec!["racy"]);

        let plan = plan_changes(Some(&base), &discovery, false, DEFAULT_RACY_WINDOW);
        assert!(plan.reused.is_empty());
    }

    #[tokio::test]
    async fn test_existing_name_rejected_before_scan() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(&src).unwrap();
        let engine = engine(dir.path());
        engine.create_snapshot("once", &src).await.unwrap();
        let err = engine.create_snapshot("once", &src).await.unwrap_err();
        assert!(matches!(err, BackupError::SnapshotExists(_)));
        assert_eq!(engine.list_snapshots().unwrap().len(), 1);
        engine.delete_snapshot("once").unwrap();
        assert!(engine.get_snapshot("once").is_err());
    }

    #[tokio::test]
    async fn test_missing_baseline() {
        let dir = tempfile::tempdir().unwrap();
        let err = engine(dir.path())
            .analyze_changes("nope", dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::SnapshotNotFound(_)));
    }
}
