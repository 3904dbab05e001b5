//! Local-filesystem destination.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::atomic_write::write_file_atomic_async;
use crate::destination::{validate_artifact_id, ArtifactInfo, Capacity, Destination};
use crate::error::{StorageError, StorageResult};

/// Stores each artifact as a file below a root directory.
#[derive(Debug, Clone)]
pub struct LocalDestination {
    name: String,
    root: PathBuf,
}

impl LocalDestination {
    /// The root is created lazily on first write.
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
        }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem path an artifact id maps to
    pub fn artifact_path(&self, id: &str) -> StorageResult<PathBuf> {
        validate_artifact_id(id)?;
        Ok(id.split('/').fold(self.root.clone(), |p, seg| p.join(seg)))
    }

    /// Every artifact below the root whose id starts with `prefix`. Hidden
    /// entries (in-progress atomic writes) are left out.
    pub fn scan_artifacts(&self, prefix: &str) -> StorageResult<Vec<ArtifactInfo>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut found = Vec::new();
        let walker = walkdir::WalkDir::new(&self.root)
            .min_depth(1)
            .into_iter()
            .filter_entry(|e| !e.file_name().to_string_lossy().starts_with('.'));
        for entry in walker {
            let entry = entry.map_err(|e| self.unavailable(e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let id = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if !id.starts_with(prefix) {
                continue;
            }
            let meta = entry.metadata().map_err(|e| self.unavailable(e.into()))?;
            found.push(ArtifactInfo {
                id,
                size: meta.len(),
                modified: meta.modified().ok(),
            });
        }
        Ok(found)
    }

    fn unavailable(&self, e: io::Error) -> StorageError {
        StorageError::DestinationUnavailable {
            destination: self.name.clone(),
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl Destination for LocalDestination {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&self, id: &str, data: Bytes) -> StorageResult<()> {
        let path = self.artifact_path(id)?;
        let len = data.len();
        write_file_atomic_async(path, data)
            .await
            .map_err(|e| self.unavailable(e))?;
        debug!(destination = %self.name, id, bytes = len, "artifact written");
        Ok(())
    }

    async fn read(&self, id: &str) -> StorageResult<Bytes> {
        let path = self.artifact_path(id)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StorageError::NotFound {
                destination: self.name.clone(),
                id: id.to_string(),
            }),
            Err(e) => Err(self.unavailable(e)),
        }
    }

    async fn exists(&self, id: &str) -> StorageResult<bool> {
        let path = self.artifact_path(id)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(self.unavailable(e)),
        }
    }

    async fn delete(&self, id: &str) -> StorageResult<()> {
        let path = self.artifact_path(id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.unavailable(e)),
        }
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<ArtifactInfo>> {
        let this = self.clone();
        let prefix = prefix.to_string();
        tokio::task::spawn_blocking(move || this.scan_artifacts(&prefix))
            .await
            .map_err(|e| self.unavailable(io::Error::other(e.to_string())))?
    }

    async fn capacity(&self) -> StorageResult<Option<Capacity>> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || filesystem_capacity(&root))
            .await
            .map_err(|e| self.unavailable(io::Error::other(e.to_string())))
    }
}

/// Free and total bytes of the filesystem holding `path` (or its nearest
/// existing ancestor), via `statvfs`.
#[cfg(unix)]
pub fn filesystem_capacity(path: &Path) -> Option<Capacity> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    // The root may not exist until the first write.
    let existing = path.ancestors().find(|p| p.exists())?;
    let c_path = CString::new(existing.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if ret != 0 {
        debug!(path = %existing.display(), error = %io::Error::last_os_error(), "statvfs failed");
        return None;
    }
    // Field widths differ between Linux and macOS.
    #[allow(clippy::unnecessary_cast)]
    let (frsize, avail, blocks) = (stat.f_frsize as u64, stat.f_bavail as u64, stat.f_blocks as u64);
    Some(Capacity {
        free_bytes: avail.saturating_mul(frsize),
        total_bytes: blocks.saturating_mul(frsize),
    })
}

/// Space figures are not collected on this platform.
#[cfg(not(unix))]
pub fn filesystem_capacity(_path: &Path) -> Option<Capacity> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_read_exists_delete() {
        let dir = tempfile::tempdir().unwrap();
        let dest = LocalDestination::new("local", dir.path().join("store"));
        let id = "blocks/ab/abcdef";
        assert!(!dest.exists(id).await.unwrap());
        dest.write(id, Bytes::from_static(b"payload")).await.unwrap();
        assert!(dest.exists(id).await.unwrap());
        assert_eq!(dest.read(id).await.unwrap(), Bytes::from_static(b"payload"));
        assert!(dir.path().join("store/blocks/ab/abcdef").is_file());
        dest.delete(id).await.unwrap();
        assert!(!dest.exists(id).await.unwrap());
        dest.delete(id).await.unwrap();
    }

    #[tokio::test]
    async fn missing_artifact_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let dest = LocalDestination::new("local", dir.path());
        assert!(matches!(
            dest.read("nope").await,
            Err(StorageError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn root_is_a_file_fails_write() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("not-a-dir");
        std::fs::write(&root, b"x").unwrap();
        let dest = LocalDestination::new("broken", &root);
        let err = dest
            .write("artifact", Bytes::from_static(b"data"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::DestinationUnavailable { .. }));
    }

    #[tokio::test]
    async fn list_filters_by_prefix_and_skips_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let dest = LocalDestination::new("local", dir.path().join("store"));
        assert!(dest.list("").await.unwrap().is_empty());
        dest.write("blocks/ab/ab01", Bytes::from_static(b"one")).await.unwrap();
        dest.write("blocks/cd/cd02", Bytes::from_static(b"two!")).await.unwrap();
        dest.write("snapshots/s.json", Bytes::from_static(b"{}")).await.unwrap();
        std::fs::write(dir.path().join("store/blocks/ab/.ab03.tmp-x"), b"partial").unwrap();

        let mut blocks = dest.list("blocks/").await.unwrap();
        blocks.sort_by(|a, b| a.id.cmp(&b.id));
        let ids: Vec<&str> = blocks.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["blocks/ab/ab01", "blocks/cd/cd02"]);
        assert_eq!(blocks[1].size, 4);
        assert!(blocks[0].modified.is_some());
        assert_eq!(dest.list("").await.unwrap().len(), 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn capacity_reported_before_first_write() {
        let dir = tempfile::tempdir().unwrap();
        let dest = LocalDestination::new("local", dir.path().join("not/yet"));
        let cap = dest.capacity().await.unwrap().unwrap();
        assert!(cap.total_bytes > 0);
        assert!(cap.free_bytes <= cap.total_bytes);
    }

    #[tokio::test]
    async fn traversal_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let dest = LocalDestination::new("local", dir.path());
        assert!(matches!(
            dest.write("../escape", Bytes::new()).await,
            Err(StorageError::InvalidArtifactId { .. })
        ));
    }
}
