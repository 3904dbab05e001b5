//! Durable per-backup content manifests.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use vaultkeep_reduce::ChunkHash;

use crate::error::{BackupError, BackupResultT};
use crate::persist::{self, FORMAT_VERSION};
use crate::scan::SourceRoot;
use crate::snapshot::Snapshot;

/// `(path, hash, size)` for one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Snapshot key
    pub path: String,
    /// BLAKE3 of the content when the manifest was written
    pub hash: ChunkHash,
    /// Content length
    pub size: u64,
}

/// Ground truth for verification: what every file looked like when a backup completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupManifest {
    /// Persisted document version
    pub format_version: u32,
    /// Backup the manifest describes
    pub backup_id: String,
    /// When it was written
    pub created_at: DateTime<Utc>,
    /// Trees the entries were taken from
    #[serde(default)]
    pub roots: Vec<SourceRoot>,
    /// Entries sorted by path
    pub entries: Vec<ManifestEntry>,
    /// Entry count
    pub total_files: u64,
    /// Sum of entry sizes
    pub total_size: u64,
}

impl BackupManifest {
    /// Build a manifest, sorting entries and computing totals.
    pub fn new(
        backup_id: impl Into<String>,
        roots: Vec<SourceRoot>,
        mut entries: Vec<ManifestEntry>,
    ) -> Self {
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Self {
            format_version: FORMAT_VERSION,
            backup_id: backup_id.into(),
            created_at: Utc::now(),
            roots,
            total_files: entries.len() as u64,
            total_size: entries.iter().map(|e| e.size).sum(),
            entries,
        }
    }

    /// Manifest mirroring every record of a snapshot.
    pub fn from_snapshot(backup_id: impl Into<String>, snapshot: &Snapshot) -> Self {
        let entries = snapshot
            .files
            .values()
            .map(|r| ManifestEntry {
                path: r.path.clone(),
                hash: r.content_hash,
                size: r.size,
            })
            .collect();
        Self::new(backup_id, snapshot.roots.clone(), entries)
    }

    /// Entry for a path
    pub fn get(&self, path: &str) -> Option<&ManifestEntry> {
        self.entries
            .binary_search_by(|e| e.path.as_str().cmp(path))
            .ok()
            .map(|i| &self.entries[i])
    }

    /// Serialized form, as persisted and replicated
    pub fn to_json(&self) -> BackupResultT<Vec<u8>> {
        persist::encode_document(self)
    }
}

/// Manifests persisted as `<dir>/<backup_id>.json`.
pub struct ManifestStore {
    dir: PathBuf,
}

impl ManifestStore {
    /// Store rooted at `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, backup_id: &str) -> BackupResultT<PathBuf> {
        persist::validate_name(backup_id)?;
        Ok(self.dir.join(format!("{}.json", backup_id)))
    }

    /// Write or replace the manifest for its backup id.
    pub fn save(&self, manifest: &BackupManifest) -> BackupResultT<PathBuf> {
        let path = self.path_for(&manifest.backup_id)?;
        persist::write_document(&path, manifest)?;
        debug!(backup_id = %manifest.backup_id, entries = manifest.entries.len(), "manifest saved");
        Ok(path)
    }

    /// Read a manifest back.
    pub fn load(&self, backup_id: &str) -> BackupResultT<BackupManifest> {
        let path = self.path_for(backup_id)?;
        persist::read_document(&path)?
            .ok_or_else(|| BackupError::ManifestNotFound(backup_id.to_string()))
    }

    /// Stored backup ids, sorted
    pub fn list(&self) -> BackupResultT<Vec<String>> {
        persist::list_documents(&self.dir)
    }

    /// Remove a manifest; missing ones are ignored.
    pub fn delete(&self, backup_id: &str) -> BackupResultT<()> {
        let path = self.path_for(backup_id)?;
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Directory holding the documents
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::FileRecord;
    use vaultkeep_reduce::blake3_hash;

    fn entry(path: &str, body: &[u8]) -> ManifestEntry {
        ManifestEntry {
            path: path.into(),
            hash: blake3_hash(body),
            size: body.len() as u64,
        }
    }

    #[test]
    fn test_totals_and_lookup() {
        let m = BackupManifest::new(
            "b1",
            vec![],
            vec![entry("z", b"zz"), entry("a", b"a"), entry("m/n", b"mmm")],
        );
        assert_eq!(m.total_files, 3);
        assert_eq!(m.total_size, 6);
        assert_eq!(m.entries[0].path, "a");
        assert_eq!(m.get("m/n").unwrap().size, 3);
        assert!(m.get("q").is_none());
    }

    #[test]
    fn test_from_snapshot() {
        let mut snap = Snapshot::new("s", vec![SourceRoot::new("/data")]);
        snap.insert(FileRecord {
            path: "f".into(),
            size: 4,
            mtime_ns: 9,
            ctime_ns: 0,
            inode: 0,
            content_hash: blake3_hash(b"four"),
            blocks: vec![blake3_hash(b"four")],
        });
        let m = BackupManifest::from_snapshot("b", &snap);
        assert_eq!(m.entries, vec![entry("f", b"four")]);
        assert_eq!(m.roots, snap.roots);
    }

    #[test]
    fn test_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::new(dir.path().join("manifests"));
        let m = BackupManifest::new("job-1", vec![], vec![entry("a", b"a")]);
        store.save(&m).unwrap();
        assert_eq!(store.load("job-1").unwrap(), m);
        assert_eq!(store.list().unwrap(), vec!["job-1"]);
        store.delete("job-1").unwrap();
        assert!(matches!(
            store.load("job-1"),
            Err(BackupError::ManifestNotFound(_))
        ));
        store.delete("job-1").unwrap();
    }
}
