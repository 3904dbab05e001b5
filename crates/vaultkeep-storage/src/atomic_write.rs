//! Crash-safe whole-file writes.
//!
//! Content goes to a hidden temporary file next to the target, is synced,
//! and is then renamed over the target. Readers see the old file or the new
//! one, never a prefix.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::debug;

fn temp_path_for(path: &Path) -> io::Result<PathBuf> {
    let name = path.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} has no file name", path.display()),
        )
    })?;
    let tmp_name = format!(
        ".{}.tmp-{}",
        name.to_string_lossy(),
        uuid::Uuid::new_v4().simple()
    );
    Ok(path.with_file_name(tmp_name))
}

/// Write `data` to `path` atomically, creating parent directories.
pub fn write_file_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let tmp = temp_path_for(path)?;
    let result = (|| {
        let mut file = File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    } else {
        debug!(path = %path.display(), bytes = data.len(), "atomic write complete");
    }
    result
}

/// Async wrapper around [`write_file_atomic`] that runs on the blocking pool.
pub async fn write_file_atomic_async(path: PathBuf, data: Bytes) -> io::Result<()> {
    tokio::task::spawn_blocking(move || write_file_atomic(&path, &data))
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("write task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leftovers(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.contains(".tmp-"))
            .collect()
    }

    #[test]
    fn writes_and_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/artifact");
        write_file_atomic(&path, b"first").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"first");
        write_file_atomic(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");
        assert!(leftovers(path.parent().unwrap()).is_empty());
    }

    #[test]
    fn failure_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        // Target is an existing directory, so the rename fails.
        let target = dir.path().join("occupied");
        fs::create_dir(&target).unwrap();
        fs::write(target.join("inner"), b"x").unwrap();
        assert!(write_file_atomic(&target, b"data").is_err());
        assert!(leftovers(dir.path()).is_empty());
    }

    #[test]
    fn parent_is_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"not a dir").unwrap();
        assert!(write_file_atomic(&blocker.join("child"), b"data").is_err());
    }

    #[tokio::test]
    async fn async_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("async");
        write_file_atomic_async(path.clone(), Bytes::from_static(b"hello"))
            .await
            .unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"hello");
    }
}
