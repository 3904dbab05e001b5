//! Storage manager: destination registry and parallel replication.
//!
//! A write to N destinations spawns one task per destination, each under its
//! own deadline. Every requested destination gets exactly one
//! [`ReplicationResult`], in request order; a failure on one never affects the
//! others.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::destination::{
    validate_artifact_id, ArtifactInfo, Destination, DestinationFactory, DestinationKind,
    StorageDestination,
};
use crate::error::{StorageError, StorageResult};
use crate::local::LocalDestination;

/// Default per-destination deadline
pub const DEFAULT_REPLICATION_TIMEOUT: Duration = Duration::from_secs(300);

/// Outcome of writing one artifact to one destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationResult {
    /// Destination name
    pub destination: String,
    /// Artifact is on the destination after this call
    pub success: bool,
    /// Artifact was already present and not rewritten
    pub skipped: bool,
    /// Bytes written (0 when skipped or failed)
    pub bytes_transferred: u64,
    /// Wall time spent on this destination
    pub elapsed: Duration,
    /// Failure description
    pub error: Option<String>,
}

impl ReplicationResult {
    fn failed(destination: &str, error: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            destination: destination.to_string(),
            success: false,
            skipped: false,
            bytes_transferred: 0,
            elapsed,
            error: Some(error.into()),
        }
    }
}

/// Aggregate view of one replication call.
#[derive(Debug, Clone, Default)]
pub struct ReplicationSummary {
    /// Per-destination results in request order
    pub results: Vec<ReplicationResult>,
}

impl ReplicationSummary {
    /// Wrap per-destination results
    pub fn new(results: Vec<ReplicationResult>) -> Self {
        Self { results }
    }

    /// Destinations that hold the artifact
    pub fn successful(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    /// Destinations that failed
    pub fn failed(&self) -> usize {
        self.results.len() - self.successful()
    }

    /// True if every destination succeeded
    pub fn all_succeeded(&self) -> bool {
        !self.results.is_empty() && self.failed() == 0
    }

    /// True if at least one destination holds the artifact
    pub fn any_succeeded(&self) -> bool {
        self.successful() > 0
    }

    /// Names of destinations that failed
    pub fn failed_destinations(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| !r.success)
            .map(|r| r.destination.as_str())
            .collect()
    }
}

/// Health and space of one registered destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationStatus {
    /// Destination name
    pub name: String,
    /// `local` or the remote protocol name
    pub kind: String,
    /// Registration flag
    pub enabled: bool,
    /// A write, read back and delete round trip succeeded
    pub reachable: bool,
    /// Time the round trip took
    pub latency: Duration,
    /// Why the round trip failed
    pub error: Option<String>,
    /// Bytes available, when the backend reports it
    pub free_bytes: Option<u64>,
    /// Backing store size, when the backend reports it
    pub total_bytes: Option<u64>,
}

/// What [`StorageManager::cleanup_destination`] removed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Artifacts listed under the prefix
    pub examined: u64,
    /// Artifacts deleted
    pub removed: u64,
    /// Stored bytes those artifacts occupied
    pub bytes_freed: u64,
    /// Ids whose delete failed, with the reason
    pub failures: Vec<String>,
}

struct Registered {
    spec: StorageDestination,
    backend: Arc<dyn Destination>,
}

/// Registry of named destinations plus the replication logic.
pub struct StorageManager {
    destinations: RwLock<BTreeMap<String, Registered>>,
    factories: RwLock<HashMap<String, Arc<dyn DestinationFactory>>>,
    timeout: Duration,
}

impl Default for StorageManager {
    fn default() -> Self {
        Self::new(DEFAULT_REPLICATION_TIMEOUT)
    }
}

impl StorageManager {
    /// Create an empty registry with the given per-destination deadline.
    pub fn new(timeout: Duration) -> Self {
        Self {
            destinations: RwLock::new(BTreeMap::new()),
            factories: RwLock::new(HashMap::new()),
            timeout,
        }
    }

    /// Per-destination deadline
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register the factory used for `Remote` destinations of its protocol.
    pub fn register_factory(&self, factory: Arc<dyn DestinationFactory>) {
        self.factories
            .write()
            .insert(factory.protocol().to_string(), factory);
    }

    /// Register a named destination. Local destinations are built directly,
    /// remote ones through the factory for their protocol.
    pub fn add_destination(&self, dest: StorageDestination) -> StorageResult<()> {
        let backend: Arc<dyn Destination> = match &dest.kind {
            DestinationKind::Local { path } => {
                Arc::new(LocalDestination::new(dest.name.clone(), path.clone()))
            }
            DestinationKind::Remote { protocol, .. } => {
                let factory = self
                    .factories
                    .read()
                    .get(protocol)
                    .cloned()
                    .ok_or_else(|| StorageError::UnsupportedProtocol(protocol.clone()))?;
                factory.create(&dest)?
            }
        };
        self.add_backend(dest, backend)
    }

    /// Register a destination with a caller-built backend.
    pub fn add_backend(
        &self,
        dest: StorageDestination,
        backend: Arc<dyn Destination>,
    ) -> StorageResult<()> {
        let mut map = self.destinations.write();
        if map.contains_key(&dest.name) {
            return Err(StorageError::DuplicateDestination(dest.name));
        }
        debug!(name = %dest.name, kind = dest.type_name(), "destination registered");
        map.insert(dest.name.clone(), Registered { spec: dest, backend });
        Ok(())
    }

    /// Unregister a destination. Returns true if it was present.
    pub fn remove_destination(&self, name: &str) -> bool {
        self.destinations.write().remove(name).is_some()
    }

    /// Registration records, sorted by name
    pub fn list_destinations(&self) -> Vec<StorageDestination> {
        self.destinations
            .read()
            .values()
            .map(|r| r.spec.clone())
            .collect()
    }

    /// True if a destination with this name is registered
    pub fn contains(&self, name: &str) -> bool {
        self.destinations.read().contains_key(name)
    }

    fn backend(&self, name: &str) -> Result<Arc<dyn Destination>, String> {
        match self.destinations.read().get(name) {
            Some(r) if r.spec.enabled => Ok(Arc::clone(&r.backend)),
            Some(_) => Err("destination is disabled".to_string()),
            None => Err("destination is not registered".to_string()),
        }
    }

    fn backend_or_err(&self, name: &str) -> StorageResult<Arc<dyn Destination>> {
        self.backend(name)
            .map_err(|reason| StorageError::DestinationUnavailable {
                destination: name.to_string(),
                reason,
            })
    }

    async fn bounded<T>(
        &self,
        name: &str,
        op: impl std::future::Future<Output = StorageResult<T>>,
    ) -> StorageResult<T> {
        tokio::time::timeout(self.timeout, op)
            .await
            .map_err(|_| StorageError::Timeout {
                destination: name.to_string(),
                seconds: self.timeout.as_secs(),
            })?
    }

    /// Write a health-check artifact, read it back and delete it.
    pub async fn test_destination(&self, name: &str) -> ReplicationResult {
        let start = Instant::now();
        let backend = match self.backend(name) {
            Ok(b) => b,
            Err(e) => return ReplicationResult::failed(name, e, start.elapsed()),
        };
        let id = format!("healthcheck/{}", uuid::Uuid::new_v4().simple());
        let payload = Bytes::from_static(b"vaultkeep destination health check");
        let round_trip = async {
            backend.write(&id, payload.clone()).await?;
            let back = backend.read(&id).await?;
            backend.delete(&id).await?;
            if back != payload {
                return Err(StorageError::DestinationUnavailable {
                    destination: name.to_string(),
                    reason: "health check read back different bytes".to_string(),
                });
            }
            Ok::<(), StorageError>(())
        };
        match tokio::time::timeout(self.timeout, round_trip).await {
            Ok(Ok(())) => ReplicationResult {
                destination: name.to_string(),
                success: true,
                skipped: false,
                bytes_transferred: payload.len() as u64,
                elapsed: start.elapsed(),
                error: None,
            },
            Ok(Err(e)) => ReplicationResult::failed(name, e.to_string(), start.elapsed()),
            Err(_) => ReplicationResult::failed(
                name,
                format!("timed out after {}s", self.timeout.as_secs()),
                start.elapsed(),
            ),
        }
    }

    /// Round-trip health plus space figures for one destination.
    pub async fn destination_status(&self, name: &str) -> StorageResult<DestinationStatus> {
        let spec = self
            .destinations
            .read()
            .get(name)
            .map(|r| r.spec.clone())
            .ok_or_else(|| StorageError::UnknownDestination(name.to_string()))?;
        let check = self.test_destination(name).await;
        let capacity = match self.backend(name) {
            Ok(backend) => match self.bounded(name, backend.capacity()).await {
                Ok(c) => c,
                Err(e) => {
                    debug!(destination = name, error = %e, "capacity unavailable");
                    None
                }
            },
            Err(_) => None,
        };
        Ok(DestinationStatus {
            name: spec.name.clone(),
            kind: spec.type_name().to_string(),
            enabled: spec.enabled,
            reachable: check.success,
            latency: check.elapsed,
            error: check.error,
            free_bytes: capacity.map(|c| c.free_bytes),
            total_bytes: capacity.map(|c| c.total_bytes),
        })
    }

    /// Enumerate a destination's artifacts under `prefix`.
    pub async fn list_artifacts(&self, name: &str, prefix: &str) -> StorageResult<Vec<ArtifactInfo>> {
        let backend = self.backend_or_err(name)?;
        self.bounded(name, backend.list(prefix)).await
    }

    /// Read an artifact from one named destination.
    pub async fn read_from(&self, name: &str, id: &str) -> StorageResult<Bytes> {
        let backend = self.backend_or_err(name)?;
        self.bounded(name, backend.read(id)).await
    }

    /// Check whether one named destination holds an artifact.
    pub async fn exists_on(&self, name: &str, id: &str) -> StorageResult<bool> {
        let backend = self.backend_or_err(name)?;
        self.bounded(name, backend.exists(id)).await
    }

    /// Delete artifacts under `prefix` on one destination unless `keep` claims
    /// them or they were written after `written_before`.
    #[instrument(skip(self, keep))]
    pub async fn cleanup_destination(
        &self,
        name: &str,
        prefix: &str,
        written_before: SystemTime,
        keep: &(dyn Fn(&str) -> bool + Send + Sync),
    ) -> StorageResult<CleanupReport> {
        let backend = self.backend_or_err(name)?;
        let artifacts = self.bounded(name, backend.list(prefix)).await?;
        let mut report = CleanupReport {
            examined: artifacts.len() as u64,
            ..CleanupReport::default()
        };
        for artifact in artifacts {
            // Unknown age counts as old.
            let recent = artifact.modified.is_some_and(|m| m >= written_before);
            if recent || keep(&artifact.id) {
                continue;
            }
            match self.bounded(name, backend.delete(&artifact.id)).await {
                Ok(()) => {
                    report.removed += 1;
                    report.bytes_freed += artifact.size;
                }
                Err(e) => {
                    warn!(destination = name, id = %artifact.id, error = %e, "cleanup delete failed");
                    report.failures.push(format!("{}: {}", artifact.id, e));
                }
            }
        }
        info!(
            destination = name,
            examined = report.examined,
            removed = report.removed,
            bytes = report.bytes_freed,
            "destination cleaned"
        );
        Ok(report)
    }

    /// Write an artifact to every named destination concurrently.
    #[instrument(skip(self, data), fields(bytes = data.len()))]
    pub async fn replicate_artifact(
        &self,
        id: &str,
        data: Bytes,
        destinations: &[String],
    ) -> Vec<ReplicationResult> {
        self.fan_out(id, data, destinations, false).await
    }

    /// Like [`StorageManager::replicate_artifact`], but destinations that
    /// already hold `id` are reported as skipped successes when `skip_existing` is set.
    pub async fn store_block(
        &self,
        id: &str,
        data: Bytes,
        destinations: &[String],
        skip_existing: bool,
    ) -> Vec<ReplicationResult> {
        self.fan_out(id, data, destinations, skip_existing).await
    }

    /// Copy a local file to every named destination, stored under its file name.
    pub async fn replicate_file(
        &self,
        path: &Path,
        destinations: &[String],
    ) -> StorageResult<Vec<ReplicationResult>> {
        if destinations.is_empty() {
            return Err(StorageError::NoDestinations);
        }
        let id = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| StorageError::InvalidArtifactId {
                id: path.display().to_string(),
            })?;
        validate_artifact_id(&id)?;
        let data = tokio::fs::read(path).await?;
        Ok(self.replicate_artifact(&id, Bytes::from(data), destinations).await)
    }

    async fn fan_out(
        &self,
        id: &str,
        data: Bytes,
        destinations: &[String],
        skip_existing: bool,
    ) -> Vec<ReplicationResult> {
        let mut handles = Vec::with_capacity(destinations.len());
        for name in destinations {
            let name = name.clone();
            let backend = self.backend(&name);
            let id = id.to_string();
            let data = data.clone();
            let timeout = self.timeout;
            handles.push(tokio::spawn(async move {
                let start = Instant::now();
                let backend = match backend {
                    Ok(b) => b,
                    Err(e) => return ReplicationResult::failed(&name, e, start.elapsed()),
                };
                let len = data.len() as u64;
                let op = async {
                    if skip_existing && backend.exists(&id).await? {
                        return Ok(true);
                    }
                    backend.write(&id, data).await?;
                    Ok::<bool, StorageError>(false)
                };
                match tokio::time::timeout(timeout, op).await {
                    Ok(Ok(skipped)) => ReplicationResult {
                        destination: name,
                        success: true,
                        skipped,
                        bytes_transferred: if skipped { 0 } else { len },
                        elapsed: start.elapsed(),
                        error: None,
                    },
                    Ok(Err(e)) => ReplicationResult::failed(&name, e.to_string(), start.elapsed()),
                    Err(_) => ReplicationResult::failed(
                        &name,
                        StorageError::Timeout {
                            destination: name.clone(),
                            seconds: timeout.as_secs(),
                        }
                        .to_string(),
                        start.elapsed(),
                    ),
                }
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for (handle, name) in handles.into_iter().zip(destinations) {
            let result = handle.await.unwrap_or_else(|e| {
                ReplicationResult::failed(name, format!("replication task failed: {}", e), Duration::ZERO)
            });
            if let Some(err) = &result.error {
                warn!(destination = %result.destination, id, error = %err, "replication failed");
            }
            results.push(result);
        }
        results
    }

    /// Read an artifact from the first destination that has it, trying them in order.
    /// Returns the destination name it was read from.
    pub async fn read_any(&self, id: &str, destinations: &[String]) -> StorageResult<(String, Bytes)> {
        if destinations.is_empty() {
            return Err(StorageError::NoDestinations);
        }
        let mut last_err = None;
        for name in destinations {
            let backend = match self.backend(name) {
                Ok(b) => b,
                Err(reason) => {
                    last_err = Some(StorageError::DestinationUnavailable {
                        destination: name.clone(),
                        reason,
                    });
                    continue;
                }
            };
            match tokio::time::timeout(self.timeout, backend.read(id)).await {
                Ok(Ok(data)) => return Ok((name.clone(), data)),
                Ok(Err(e)) => {
                    debug!(destination = %name, id, error = %e, "read failed, trying next replica");
                    last_err = Some(e);
                }
                Err(_) => {
                    last_err = Some(StorageError::Timeout {
                        destination: name.clone(),
                        seconds: self.timeout.as_secs(),
                    })
                }
            }
        }
        Err(last_err.unwrap_or(StorageError::NoDestinations))
    }

    /// Delete an artifact from every named destination, ignoring failures.
    /// Returns the number of destinations where the delete succeeded.
    pub async fn delete_everywhere(&self, id: &str, destinations: &[String]) -> usize {
        let mut deleted = 0;
        for name in destinations {
            if let Ok(backend) = self.backend(name) {
                match backend.delete(id).await {
                    Ok(()) => deleted += 1,
                    Err(e) => warn!(destination = %name, id, error = %e, "delete failed"),
                }
            }
        }
        deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SlowDestination {
        name: String,
    }

    #[async_trait]
    impl Destination for SlowDestination {
        fn name(&self) -> &str {
            &self.name
        }
        async fn write(&self, _id: &str, _data: Bytes) -> StorageResult<()> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
        async fn read(&self, id: &str) -> StorageResult<Bytes> {
            Err(StorageError::NotFound {
                destination: self.name.clone(),
                id: id.to_string(),
            })
        }
        async fn exists(&self, _id: &str) -> StorageResult<bool> {
            Ok(false)
        }
        async fn delete(&self, _id: &str) -> StorageResult<()> {
            Ok(())
        }
    }

    struct CountingFactory {
        created: AtomicUsize,
    }

    impl DestinationFactory for CountingFactory {
        fn protocol(&self) -> &str {
            "mem"
        }
        fn create(&self, dest: &StorageDestination) -> StorageResult<Arc<dyn Destination>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(SlowDestination {
                name: dest.name.clone(),
            }))
        }
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn replicate_to_two_local() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = StorageManager::default();
        mgr.add_destination(StorageDestination::local("a", dir.path().join("a")))
            .unwrap();
        mgr.add_destination(StorageDestination::local("b", dir.path().join("b")))
            .unwrap();
        let results = mgr
            .replicate_artifact("x/y", Bytes::from_static(b"data"), &names(&["a", "b"]))
            .await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.success && r.bytes_transferred == 4));
        assert!(dir.path().join("a/x/y").is_file());
        assert!(dir.path().join("b/x/y").is_file());
    }

    #[tokio::test]
    async fn unknown_and_disabled_reported_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = StorageManager::default();
        let mut off = StorageDestination::local("off", dir.path().join("off"));
        off.enabled = false;
        mgr.add_destination(off).unwrap();
        mgr.add_destination(StorageDestination::local("ok", dir.path().join("ok")))
            .unwrap();
        let results = mgr
            .replicate_artifact("id", Bytes::from_static(b"z"), &names(&["ghost", "ok", "off"]))
            .await;
        let summary = ReplicationSummary::new(results);
        assert_eq!(
            summary
                .results
                .iter()
                .map(|r| r.destination.as_str())
                .collect::<Vec<_>>(),
            vec!["ghost", "ok", "off"]
        );
        assert_eq!(summary.successful(), 1);
        assert_eq!(summary.failed_destinations(), vec!["ghost", "off"]);
        assert!(summary.any_succeeded());
        assert!(!summary.all_succeeded());
    }

    #[tokio::test]
    async fn slow_destination_times_out_without_blocking_others() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = StorageManager::new(Duration::from_millis(200));
        mgr.add_backend(
            StorageDestination::remote("slow", "mem", "nowhere"),
            Arc::new(SlowDestination {
                name: "slow".to_string(),
            }),
        )
        .unwrap();
        mgr.add_destination(StorageDestination::local("fast", dir.path()))
            .unwrap();
        let start = std::time::Instant::now();
        let results = mgr
            .replicate_artifact("blob", Bytes::from_static(b"1"), &names(&["slow", "fast"]))
            .await;
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(!results[0].success);
        assert!(results[0].error.as_deref().unwrap().contains("timed out"));
        assert!(results[1].success);
    }

    #[tokio::test]
    async fn skip_existing_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = StorageManager::default();
        mgr.add_destination(StorageDestination::local("a", dir.path()))
            .unwrap();
        let dests = names(&["a"]);
        let first = mgr
            .store_block("blocks/aa/aa", Bytes::from_static(b"b"), &dests, true)
            .await;
        assert!(first[0].success && !first[0].skipped);
        let second = mgr
            .store_block("blocks/aa/aa", Bytes::from_static(b"b"), &dests, true)
            .await;
        assert!(second[0].success && second[0].skipped);
        assert_eq!(second[0].bytes_transferred, 0);
    }

    #[tokio::test]
    async fn replicate_file_errors() {
        let mgr = StorageManager::default();
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            mgr.replicate_file(&dir.path().join("f"), &[]).await,
            Err(StorageError::NoDestinations)
        ));
        assert!(matches!(
            mgr.replicate_file(&dir.path().join("missing"), &names(&["a"])).await,
            Err(StorageError::Io(_))
        ));
    }

    #[tokio::test]
    async fn read_any_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = StorageManager::default();
        mgr.add_destination(StorageDestination::local("empty", dir.path().join("e")))
            .unwrap();
        mgr.add_destination(StorageDestination::local("full", dir.path().join("f")))
            .unwrap();
        mgr.replicate_artifact("k", Bytes::from_static(b"v"), &names(&["full"]))
            .await;
        let (from, data) = mgr.read_any("k", &names(&["empty", "full"])).await.unwrap();
        assert_eq!(from, "full");
        assert_eq!(data, Bytes::from_static(b"v"));
        assert!(matches!(
            mgr.read_any("nope", &names(&["empty"])).await,
            Err(StorageError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn remote_requires_factory() {
        let mgr = StorageManager::default();
        let dest = StorageDestination::remote("r", "mem", "x");
        assert!(matches!(
            mgr.add_destination(dest.clone()),
            Err(StorageError::UnsupportedProtocol(_))
        ));
        let factory = Arc::new(CountingFactory {
            created: AtomicUsize::new(0),
        });
        mgr.register_factory(factory.clone());
        mgr.add_destination(dest.clone()).unwrap();
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
        assert!(matches!(
            mgr.add_destination(dest),
            Err(StorageError::DuplicateDestination(_))
        ));
        assert_eq!(mgr.list_destinations().len(), 1);
        assert!(mgr.remove_destination("r"));
        assert!(!mgr.contains("r"));
    }

    #[tokio::test]
    async fn status_reports_reachability_and_space() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = StorageManager::default();
        mgr.add_destination(StorageDestination::local("ok", dir.path().join("ok")))
            .unwrap();
        let broken_root = dir.path().join("broken");
        std::fs::write(&broken_root, b"file").unwrap();
        mgr.add_destination(StorageDestination::local("broken", &broken_root))
            .unwrap();

        let ok = mgr.destination_status("ok").await.unwrap();
        assert!(ok.reachable && ok.enabled);
        assert_eq!(ok.kind, "local");
        assert!(ok.error.is_none());
        #[cfg(unix)]
        assert!(ok.total_bytes.unwrap() > 0);
        assert!(mgr.list_artifacts("ok", "").await.unwrap().is_empty());

        let broken = mgr.destination_status("broken").await.unwrap();
        assert!(!broken.reachable);
        assert!(broken.error.is_some());
        assert!(matches!(
            mgr.destination_status("ghost").await,
            Err(StorageError::UnknownDestination(_))
        ));
    }

    #[tokio::test]
    async fn cleanup_keeps_claimed_and_recent_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = StorageManager::default();
        mgr.add_destination(StorageDestination::local("a", dir.path()))
            .unwrap();
        let dests = names(&["a"]);
        for id in ["blocks/aa/aa1", "blocks/bb/bb2", "snapshots/s.json"] {
            mgr.replicate_artifact(id, Bytes::from_static(b"12345"), &dests)
                .await;
        }

        let keep = |id: &str| id == "blocks/aa/aa1";
        let none = mgr
            .cleanup_destination("a", "blocks/", SystemTime::UNIX_EPOCH, &keep)
            .await
            .unwrap();
        assert_eq!(none.examined, 2);
        assert_eq!(none.removed, 0);

        let later = SystemTime::now() + Duration::from_secs(60);
        let report = mgr
            .cleanup_destination("a", "blocks/", later, &keep)
            .await
            .unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(report.bytes_freed, 5);
        assert!(report.failures.is_empty());
        assert!(dir.path().join("blocks/aa/aa1").is_file());
        assert!(!dir.path().join("blocks/bb/bb2").exists());
        assert!(dir.path().join("snapshots/s.json").is_file());
    }

    #[tokio::test]
    async fn read_from_names_one_destination() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = StorageManager::default();
        mgr.add_destination(StorageDestination::local("a", dir.path().join("a")))
            .unwrap();
        mgr.add_destination(StorageDestination::local("b", dir.path().join("b")))
            .unwrap();
        mgr.replicate_artifact("k", Bytes::from_static(b"v"), &names(&["a"]))
            .await;
        assert_eq!(mgr.read_from("a", "k").await.unwrap(), Bytes::from_static(b"v"));
        assert!(matches!(
            mgr.read_from("b", "k").await,
            Err(StorageError::NotFound { .. })
        ));
        assert!(mgr.exists_on("a", "k").await.unwrap());
        assert!(!mgr.exists_on("b", "k").await.unwrap());
    }

    #[tokio::test]
    async fn unsupported_listing_is_an_error() {
        let mgr = StorageManager::default();
        mgr.add_backend(
            StorageDestination::remote("slow", "mem", "nowhere"),
            Arc::new(SlowDestination {
                name: "slow".to_string(),
            }),
        )
        .unwrap();
        assert!(matches!(
            mgr.list_artifacts("slow", "").await,
            Err(StorageError::Unsupported { .. })
        ));
    }

    #[tokio::test]
    async fn health_check_local_destination() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = StorageManager::default();
        mgr.add_destination(StorageDestination::local("a", dir.path()))
            .unwrap();
        assert!(mgr.test_destination("a").await.success);
        assert!(!mgr.test_destination("missing").await.success);
    }
}
