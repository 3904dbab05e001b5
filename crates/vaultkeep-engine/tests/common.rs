//! Shared fixtures for engine integration tests.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;
use vaultkeep_engine::{BackupEngine, BackupJob, EngineConfig};
use vaultkeep_storage::{StorageDestination, StorageManager};

/// A source tree, a state directory and a storage manager under one temp dir
pub struct TestEnv {
    pub dir: TempDir,
    pub storage: Arc<StorageManager>,
}

#[allow(dead_code)]
impl TestEnv {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        Self {
            dir,
            storage: Arc::new(StorageManager::default()),
        }
    }

    pub fn src(&self) -> PathBuf {
        self.dir.path().join("src")
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    pub fn write(&self, rel: &str, data: &[u8]) {
        let path = self.src().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, data).unwrap();
    }

    /// Local destination rooted at `<tmp>/<name>`
    pub fn add_local(&self, name: &str) -> PathBuf {
        let root = self.path(name);
        self.storage
            .add_destination(StorageDestination::local(name, &root))
            .unwrap();
        root
    }

    /// Local destination whose root is a regular file, so every write fails
    pub fn add_broken(&self, name: &str) {
        let root = self.path(name);
        std::fs::write(&root, b"not a directory").unwrap();
        self.storage
            .add_destination(StorageDestination::local(name, &root))
            .unwrap();
    }

    /// Turn a destination created by [`TestEnv::add_broken`] into a working one
    pub fn repair(&self, name: &str) -> PathBuf {
        let root = self.path(name);
        std::fs::remove_file(&root).unwrap();
        std::fs::create_dir_all(&root).unwrap();
        root
    }

    pub fn engine(&self, passphrase: Option<&str>) -> BackupEngine {
        let mut config = EngineConfig::with_state_dir(self.path("state"));
        config.parallelism = 4;
        // Fixtures are written right before each run.
        config.racy_window_ms = 0;
        let engine = BackupEngine::new(config, Arc::clone(&self.storage)).unwrap();
        match passphrase {
            Some(p) => engine.with_passphrase(p),
            None => engine,
        }
    }

    pub fn job(&self, job_id: &str, destinations: &[&str]) -> BackupJob {
        BackupJob::new(
            job_id,
            job_id,
            vec![self.src()],
            destinations.iter().map(|d| d.to_string()).collect(),
        )
    }
}

#[allow(dead_code)]
pub fn read(path: &Path) -> Vec<u8> {
    std::fs::read(path).unwrap()
}
