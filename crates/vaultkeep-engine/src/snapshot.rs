//! Immutable point-in-time file inventories and their on-disk store.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use vaultkeep_reduce::ChunkHash;

use crate::error::{BackupError, BackupResultT};
use crate::persist::{self, FORMAT_VERSION};
use crate::scan::{DiscoveredFile, SourceRoot};

/// One file as captured in a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Snapshot key
    pub path: String,
    /// Content length in bytes
    pub size: u64,
    /// Modification time in nanoseconds since the Unix epoch
    pub mtime_ns: i64,
    /// Status change time in nanoseconds since the Unix epoch
    #[serde(default)]
    pub ctime_ns: i64,
    /// Inode number at capture
    #[serde(default)]
    pub inode: u64,
    /// BLAKE3 of the whole content
    pub content_hash: ChunkHash,
    /// Block hashes in file order
    pub blocks: Vec<ChunkHash>,
}

impl FileRecord {
    /// Record for content read from `file`
    pub fn captured(
        file: &DiscoveredFile,
        size: u64,
        content_hash: ChunkHash,
        blocks: Vec<ChunkHash>,
    ) -> Self {
        Self {
            path: file.key.clone(),
            size,
            mtime_ns: file.mtime_ns,
            ctime_ns: file.ctime_ns,
            inode: file.inode,
            content_hash,
            blocks,
        }
    }

    /// Same size, modification time, change time and inode as a freshly
    /// discovered file
    pub fn metadata_matches(&self, file: &DiscoveredFile) -> bool {
        self.size == file.size
            && self.mtime_ns == file.mtime_ns
            && self.ctime_ns == file.ctime_ns
            && self.inode == file.inode
    }
}

/// A named, immutable record of a set of trees at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Persisted document version
    pub format_version: u32,
    /// Unique name, also the file stem
    pub name: String,
    /// Creation time (UTC)
    pub created_at: DateTime<Utc>,
    /// Job that produced it, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    /// Trees captured
    pub roots: Vec<SourceRoot>,
    /// Destinations the blocks were written to; empty for metadata-only snapshots
    #[serde(default)]
    pub destinations: Vec<String>,
    /// Destinations that missed at least one block of this snapshot
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub incomplete_destinations: Vec<String>,
    /// When the source walk began; metadata changed after this is not trusted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scanned_at: Option<DateTime<Utc>>,
    /// Records by key
    pub files: BTreeMap<String, FileRecord>,
}

impl Snapshot {
    /// Empty snapshot stamped now
    pub fn new(name: impl Into<String>, roots: Vec<SourceRoot>) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            name: name.into(),
            created_at: Utc::now(),
            job_id: None,
            roots,
            destinations: Vec::new(),
            incomplete_destinations: Vec::new(),
            scanned_at: None,
            files: BTreeMap::new(),
        }
    }

    /// Nanosecond instant from which file metadata can no longer vouch for
    /// content captured by this snapshot.
    pub fn scan_cutoff_ns(&self) -> i64 {
        self.scanned_at
            .unwrap_or(self.created_at)
            .timestamp_nanos_opt()
            .unwrap_or(i64::MIN)
    }

    /// Add or replace a record under its own key.
    pub fn insert(&mut self, record: FileRecord) {
        self.files.insert(record.path.clone(), record);
    }

    /// Number of files
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Sum of file sizes
    pub fn total_size(&self) -> u64 {
        self.files.values().map(|f| f.size).sum()
    }

    /// Records at `key` or below it when `key` names a directory.
    /// An empty key selects everything.
    pub fn select(&self, key: &str) -> Vec<&FileRecord> {
        let key = key.trim_matches('/');
        if key.is_empty() {
            return self.files.values().collect();
        }
        if let Some(record) = self.files.get(key) {
            return vec![record];
        }
        let prefix = format!("{}/", key);
        self.files
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(_, r)| r)
            .collect()
    }

    /// Serialized form, as persisted and replicated
    pub fn to_json(&self) -> BackupResultT<Vec<u8>> {
        persist::encode_document(self)
    }

    /// Summary for listings
    pub fn summary(&self) -> SnapshotSummary {
        SnapshotSummary {
            name: self.name.clone(),
            created_at: self.created_at,
            job_id: self.job_id.clone(),
            file_count: self.file_count(),
            total_size: self.total_size(),
        }
    }
}

/// Listing entry for a stored snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct SnapshotSummary {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub job_id: Option<String>,
    pub file_count: usize,
    pub total_size: u64,
}

/// Snapshots persisted as `<dir>/<name>.json`.
pub struct SnapshotStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl SnapshotStore {
    /// Store rooted at `dir`; created on first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Directory holding the documents
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> BackupResultT<PathBuf> {
        persist::validate_name(name)?;
        Ok(self.dir.join(format!("{}.json", name)))
    }

    /// Whether a snapshot with this name is stored
    pub fn exists(&self, name: &str) -> BackupResultT<bool> {
        Ok(self.path_for(name)?.is_file())
    }

    /// Persist a new snapshot. Existing names are never overwritten.
    pub fn save(&self, snapshot: &Snapshot) -> BackupResultT<PathBuf> {
        let path = self.path_for(&snapshot.name)?;
        let _guard = self.write_lock.lock();
        if path.exists() {
            return Err(BackupError::SnapshotExists(snapshot.name.clone()));
        }
        persist::write_document(&path, snapshot)?;
        info!(
            snapshot = %snapshot.name,
            files = snapshot.file_count(),
            bytes = snapshot.total_size(),
            "snapshot saved"
        );
        Ok(path)
    }

    /// Read a stored snapshot.
    pub fn load(&self, name: &str) -> BackupResultT<Snapshot> {
        let path = self.path_for(name)?;
        persist::read_document(&path)?.ok_or_else(|| BackupError::SnapshotNotFound(name.to_string()))
    }

    /// Every stored snapshot, oldest first
    pub fn list(&self) -> BackupResultT<Vec<SnapshotSummary>> {
        let mut out = Vec::new();
        for name in persist::list_documents(&self.dir)? {
            if persist::validate_name(&name).is_err() {
                continue;
            }
            out.push(self.load(&name)?.summary());
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        Ok(out)
    }

    /// Snapshots produced by one job, oldest first
    pub fn list_for_job(&self, job_id: &str) -> BackupResultT<Vec<SnapshotSummary>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|s| s.job_id.as_deref() == Some(job_id))
            .collect())
    }

    /// Most recent snapshot produced by `job_id`
    pub fn latest_for_job(&self, job_id: &str) -> BackupResultT<Option<Snapshot>> {
        match self.list_for_job(job_id)?.pop() {
            Some(summary) => self.load(&summary.name).map(Some),
            None => Ok(None),
        }
    }

    /// Remove a stored snapshot.
    pub fn delete(&self, name: &str) -> BackupResultT<()> {
        let path = self.path_for(name)?;
        let _guard = self.write_lock.lock();
        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!(snapshot = name, "snapshot deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BackupError::SnapshotNotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vaultkeep_reduce::blake3_hash;

    fn record(path: &str, body: &[u8]) -> FileRecord {
        FileRecord {
            path: path.into(),
            size: body.len() as u64,
            mtime_ns: 1,
            ctime_ns: 0,
            inode: 0,
            content_hash: blake3_hash(body),
            blocks: vec![blake3_hash(body)],
        }
    }

    fn sample(name: &str) -> Snapshot {
        let mut snap = Snapshot::new(name, vec![SourceRoot::new("/data")]);
        snap.insert(record("a.txt", b"a"));
        snap.insert(record("dir/b.txt", b"bb"));
        snap.insert(record("dir/sub/c.txt", b"ccc"));
        snap.insert(record("dirx/d.txt", b"dddd"));
        snap
    }

    #[test]
    fn test_select_file_dir_and_all() {
        let snap = sample("s");
        assert_eq!(snap.select("a.txt").len(), 1);
        let dir: Vec<&str> = snap.select("dir").iter().map(|r| r.path.as_str()).collect();
        assert_eq!(dir, vec!["dir/b.txt", "dir/sub/c.txt"]);
        assert_eq!(snap.select("/").len(), 4);
        assert!(snap.select("nope").is_empty());
        assert_eq!(snap.total_size(), 10);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("snapshots"));
        let snap = sample("first");
        store.save(&snap).unwrap();
        assert!(store.exists("first").unwrap());
        assert_eq!(store.load("first").unwrap(), snap);
    }

    #[test]
    fn test_snapshots_are_immutable() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        store.save(&sample("fixed")).unwrap();
        let err = store.save(&sample("fixed")).unwrap_err();
        assert!(matches!(err, BackupError::SnapshotExists(n) if n == "fixed"));
    }

    #[test]
    fn test_missing_and_invalid_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        assert!(matches!(
            store.load("ghost"),
            Err(BackupError::SnapshotNotFound(_))
        ));
        assert!(matches!(
            store.load("../escape"),
            Err(BackupError::InvalidName(_))
        ));
        assert!(matches!(
            store.delete("ghost"),
            Err(BackupError::SnapshotNotFound(_))
        ));
    }

    #[test]
    fn test_latest_for_job() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let mut older = sample("job-a-1");
        older.job_id = Some("job-a".into());
        older.created_at = Utc::now() - chrono::Duration::hours(1);
        let mut newer = sample("job-a-2");
        newer.job_id = Some("job-a".into());
        let mut other = sample("job-b-1");
        other.job_id = Some("job-b".into());
        for s in [&newer, &older, &other] {
            store.save(s).unwrap();
        }

        assert_eq!(store.list().unwrap().len(), 3);
        assert_eq!(store.list_for_job("job-a").unwrap().len(), 2);
        let latest = store.latest_for_job("job-a").unwrap().unwrap();
        assert_eq!(latest.name, "job-a-2");
        assert!(store.latest_for_job("job-c").unwrap().is_none());

        store.delete("job-a-2").unwrap();
        let latest = store.latest_for_job("job-a").unwrap().unwrap();
        assert_eq!(latest.name, "job-a-1");
    }
}
