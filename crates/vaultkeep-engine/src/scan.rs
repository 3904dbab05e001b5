//! Source tree discovery and per-file fingerprinting.

use std::collections::HashSet;
use std::fs::File;
use std::io::BufReader;
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use walkdir::WalkDir;

use vaultkeep_reduce::{ChunkHash, Chunker, ContentHasher, ReduceError};

use crate::error::{BackupError, BackupResultT};
use crate::snapshot::FileRecord;

/// One directory tree being captured.
///
/// File keys of a labelled root are prefixed with `<label>/` so several roots
/// can share one snapshot without colliding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRoot {
    /// Key prefix; `None` for a single-root snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Absolute directory path
    pub path: PathBuf,
}

impl SourceRoot {
    /// Unlabelled root
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            label: None,
            path: path.into(),
        }
    }

    /// Build roots for a job's source list. A single path is unlabelled; several
    /// paths are labelled by their final component, which must be unique.
    pub fn for_sources(paths: &[PathBuf]) -> BackupResultT<Vec<SourceRoot>> {
        if paths.is_empty() {
            return Err(BackupError::InvalidJobConfig("no source paths".into()));
        }
        if paths.len() == 1 {
            return Ok(vec![SourceRoot::new(paths[0].clone())]);
        }
        let mut seen = HashSet::new();
        let mut roots = Vec::with_capacity(paths.len());
        for path in paths {
            let label = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| {
                    BackupError::InvalidJobConfig(format!(
                        "source {} has no final component to label it",
                        path.display()
                    ))
                })?;
            if !seen.insert(label.clone()) {
                return Err(BackupError::InvalidJobConfig(format!(
                    "two sources share the name {:?}",
                    label
                )));
            }
            roots.push(SourceRoot {
                label: Some(label),
                path: path.clone(),
            });
        }
        Ok(roots)
    }

    /// Snapshot key for a path relative to this root
    pub fn key_for(&self, rel: &Path) -> String {
        let rel = path_to_key(rel);
        match &self.label {
            Some(label) => format!("{}/{}", label, rel),
            None => rel,
        }
    }

    /// Strip this root's label from a key; `None` if the key belongs elsewhere.
    /// Returns an empty string for the label itself.
    pub fn strip_key<'a>(&self, key: &'a str) -> Option<&'a str> {
        match &self.label {
            None => Some(key),
            Some(label) => {
                let rest = key.strip_prefix(label.as_str())?;
                if rest.is_empty() {
                    Some(rest)
                } else {
                    rest.strip_prefix('/')
                }
            }
        }
    }
}

/// A regular file found under a source root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFile {
    /// Snapshot key (`/`-separated, relative)
    pub key: String,
    /// Where to read it
    pub abs_path: PathBuf,
    /// Size at discovery time
    pub size: u64,
    /// Modification time in nanoseconds since the Unix epoch
    pub mtime_ns: i64,
    /// Status change time in nanoseconds since the Unix epoch; 0 where unsupported
    pub ctime_ns: i64,
    /// Inode number; 0 where unsupported
    pub inode: u64,
}

impl DiscoveredFile {
    /// Latest of the modification and status change times
    pub fn changed_ns(&self) -> i64 {
        self.mtime_ns.max(self.ctime_ns)
    }
}

/// Everything found under a set of roots
#[derive(Debug, Clone)]
pub struct Discovery {
    /// Roots that were walked
    pub roots: Vec<SourceRoot>,
    /// Regular files, sorted by key
    pub files: Vec<DiscoveredFile>,
    /// Entries below a root that could not be listed
    pub errors: Vec<String>,
    /// When the walk began
    pub started_at: DateTime<Utc>,
}

impl Discovery {
    /// Sum of file sizes
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

/// Walk every root. Symlinks are not followed. A root that is missing or not a
/// directory fails the whole discovery; unreadable entries below it are recorded.
pub fn discover(roots: &[SourceRoot]) -> BackupResultT<Discovery> {
    let mut discovery = Discovery {
        roots: roots.to_vec(),
        files: Vec::new(),
        errors: Vec::new(),
        started_at: Utc::now(),
    };

    for root in roots {
        let meta = std::fs::metadata(&root.path).map_err(|e| BackupError::SourceUnreadable {
            path: root.path.clone(),
            reason: e.to_string(),
        })?;
        if !meta.is_dir() {
            return Err(BackupError::SourceUnreadable {
                path: root.path.clone(),
                reason: "not a directory".into(),
            });
        }

        for entry in WalkDir::new(&root.path)
            .follow_links(false)
            .sort_by_file_name()
        {
            let entry = match entry {
                Ok(e) => e,
                Err(e) if e.depth() == 0 => {
                    return Err(BackupError::SourceUnreadable {
                        path: root.path.clone(),
                        reason: e.to_string(),
                    })
                }
                Err(e) => {
                    warn!(error = %e, "skipping unreadable entry");
                    discovery.errors.push(e.to_string());
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let meta = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    discovery
                        .errors
                        .push(format!("{}: {}", entry.path().display(), e));
                    continue;
                }
            };
            let rel = entry
                .path()
                .strip_prefix(&root.path)
                .unwrap_or_else(|_| entry.path());
            discovery.files.push(DiscoveredFile {
                key: root.key_for(rel),
                abs_path: entry.path().to_path_buf(),
                size: meta.len(),
                mtime_ns: mtime_ns(&meta),
                ctime_ns: ctime_ns(&meta),
                inode: inode(&meta),
            });
        }
    }

    discovery.files.sort_by(|a, b| a.key.cmp(&b.key));
    debug!(
        roots = roots.len(),
        files = discovery.files.len(),
        errors = discovery.errors.len(),
        "discovery complete"
    );
    Ok(discovery)
}

/// [`discover`] on the blocking pool.
pub async fn discover_async(roots: Vec<SourceRoot>) -> BackupResultT<Discovery> {
    tokio::task::spawn_blocking(move || discover(&roots))
        .await
        .map_err(|e| BackupError::Io(std::io::Error::other(e.to_string())))?
}

/// Nanoseconds since the epoch; 0 where the platform has no mtime.
pub fn mtime_ns(meta: &std::fs::Metadata) -> i64 {
    meta.modified().map(epoch_ns).unwrap_or(0)
}

/// Signed nanoseconds relative to the epoch, saturating at the `i64` range.
pub fn epoch_ns(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(after) => i64::try_from(after.as_nanos()).unwrap_or(i64::MAX),
        Err(before) => i64::try_from(before.duration().as_nanos())
            .map(|n| -n)
            .unwrap_or(i64::MIN),
    }
}

/// Status change time in nanoseconds since the epoch.
#[cfg(unix)]
pub fn ctime_ns(meta: &std::fs::Metadata) -> i64 {
    use std::os::unix::fs::MetadataExt;
    meta.ctime()
        .saturating_mul(1_000_000_000)
        .saturating_add(meta.ctime_nsec())
}

/// Status change time; unavailable off Unix.
#[cfg(not(unix))]
pub fn ctime_ns(_meta: &std::fs::Metadata) -> i64 {
    0
}

/// Inode number.
#[cfg(unix)]
pub fn inode(meta: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.ino()
}

/// Inode number; unavailable off Unix.
#[cfg(not(unix))]
pub fn inode(_meta: &std::fs::Metadata) -> u64 {
    0
}

/// Read a file once, producing its content hash and block list.
pub fn fingerprint_file(file: &DiscoveredFile, chunker: &Chunker) -> BackupResultT<FileRecord> {
    let block_read = |reason: String| BackupError::BlockRead {
        path: file.abs_path.clone(),
        reason,
    };
    let handle = File::open(&file.abs_path).map_err(|e| block_read(e.to_string()))?;
    let mut hasher = ContentHasher::new();
    let mut blocks = Vec::new();
    for chunk in chunker.chunk_reader(BufReader::new(handle)) {
        let chunk = chunk.map_err(|e| match e {
            ReduceError::Io(io) => block_read(io.to_string()),
            other => BackupError::Reduce(other),
        })?;
        hasher.update(&chunk.data);
        blocks.push(chunk.hash);
    }
    Ok(FileRecord::captured(file, hasher.len(), hasher.finalize(), blocks))
}

/// Whole-file BLAKE3 digest and length.
pub fn hash_file(path: &Path) -> std::io::Result<(ChunkHash, u64)> {
    let file = File::open(path)?;
    vaultkeep_reduce::hash_reader(BufReader::new(file))
}

/// `/`-joined normal components of a relative path.
pub fn path_to_key(rel: &Path) -> String {
    rel.components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Relative filesystem path for a key; rejects keys that would escape their base.
pub fn key_to_path(key: &str) -> Option<PathBuf> {
    if key.is_empty() {
        return Some(PathBuf::new());
    }
    let mut out = PathBuf::new();
    for seg in key.split('/') {
        if seg.is_empty() || seg == "." || seg == ".." || seg.contains('\\') {
            return None;
        }
        out.push(seg);
    }
    Some(out)
}
