//! Backup orchestration: the job registry, the backup pipeline, and the entry
//! points for restore, verification and retention.
//!
//! Run pipeline:
//! discover → plan against the job's latest snapshot → per-file chunk / classify /
//! compress / encrypt on the blocking pool → bounded queue → block writer fanning
//! out to every destination → snapshot + manifest → verification → events.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use vaultkeep_reduce::{
    AdaptiveCompressor, BlockClass, ChunkHash, Chunker, ContentHasher, Deduplicator, Encryptor,
    MetricsSnapshot, PipelineConfig, ReduceError, ReductionMetrics, ReductionPipeline,
};
use vaultkeep_storage::{
    CleanupReport, DestinationStatus, ReplicationResult, StorageError, StorageManager,
};

use crate::config::EngineConfig;
use crate::error::{BackupError, BackupResultT};
use crate::events::{BackupEvent, BackupEventKind, EventBus, EventSink};
use crate::incremental::{plan_changes, ChangeSet, IncrementalEngine};
use crate::job::{BackupJob, BackupResult, DestinationReport};
use crate::layout::{block_artifact_id, manifest_artifact_id, snapshot_artifact_id};
use crate::manifest::{BackupManifest, ManifestStore};
use crate::restore::{decode_block, GranularRestorer, RestoreResult, RestoreTarget};
use crate::scan::{self, DiscoveredFile, SourceRoot};
use crate::snapshot::{FileRecord, Snapshot, SnapshotStore};
use crate::verifier::{
    IntegrityVerifier, VerificationHistory, VerificationRecord, VerificationResult,
};
use crate::workers::map_blocking;

/// What a retention pass removed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneReport {
    /// Snapshots (and their manifests) deleted
    pub snapshots_removed: Vec<String>,
    /// Blocks no remaining snapshot referenced
    pub blocks_removed: u64,
}

/// What [`BackupEngine::repair_backup`] found and fixed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairReport {
    /// Backup that was checked
    pub backup_id: String,
    /// Distinct blocks examined
    pub blocks_checked: u64,
    /// Block copies rewritten from a healthy replica
    pub blocks_repaired: u64,
    /// Snapshot and manifest copies put back
    pub documents_repaired: u64,
    /// Blocks with no intact copy on any destination
    pub unrecoverable: Vec<String>,
    /// Destinations that could not be read or written
    pub errors: Vec<String>,
}

impl RepairReport {
    /// Every destination now holds an intact copy of every block
    pub fn is_complete(&self) -> bool {
        self.unrecoverable.is_empty() && self.errors.is_empty()
    }
}

/// What [`BackupEngine::change_passphrase`] rewrote
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RekeyReport {
    /// Block copies re-encrypted under the new passphrase
    pub blocks_rewritten: u64,
    /// Copies an earlier, interrupted change already rewrote
    pub blocks_already_current: u64,
    /// Copies stored without encryption
    pub blocks_unencrypted: u64,
    /// Copies left under the old passphrase, with the reason
    pub failures: Vec<String>,
}

impl RekeyReport {
    /// The new passphrase now opens every block
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

enum Rekeyed {
    Rewritten(Vec<u8>),
    AlreadyCurrent,
    Plain,
}

/// The backup engine. Holds the job registry and shared state; every
/// operation runs against the configured state directory and storage manager.
pub struct BackupEngine {
    config: EngineConfig,
    storage: Arc<StorageManager>,
    snapshots: Arc<SnapshotStore>,
    manifests: Arc<ManifestStore>,
    chunker: Arc<Chunker>,
    history: Arc<VerificationHistory>,
    metrics: Arc<ReductionMetrics>,
    encryptor: RwLock<Option<Arc<Encryptor>>>,
    events: Arc<dyn EventSink>,
    bus: Option<Arc<EventBus>>,
    jobs: RwLock<BTreeMap<String, BackupJob>>,
    cancel: Mutex<CancellationToken>,
    // Backups hold it shared, pruning exclusively, so blocks are never
    // reclaimed while a run may be relying on them.
    run_gate: tokio::sync::RwLock<()>,
}

impl BackupEngine {
    /// Engine with an [`EventBus`] as its event sink and no passphrase.
    pub fn new(config: EngineConfig, storage: Arc<StorageManager>) -> BackupResultT<Self> {
        config.validate()?;
        let chunker = Chunker::with_config(config.chunker.clone())?;
        let bus = Arc::new(EventBus::new(config.event_buffer));
        Ok(Self {
            snapshots: Arc::new(SnapshotStore::new(config.snapshots_dir())),
            manifests: Arc::new(ManifestStore::new(config.manifests_dir())),
            history: Arc::new(VerificationHistory::new(config.verifications_dir())),
            chunker: Arc::new(chunker),
            metrics: Arc::new(ReductionMetrics::new()),
            encryptor: RwLock::new(None),
            events: bus.clone(),
            bus: Some(bus),
            jobs: RwLock::new(BTreeMap::new()),
            cancel: Mutex::new(CancellationToken::new()),
            run_gate: tokio::sync::RwLock::new(()),
            storage,
            config,
        })
    }

    /// Passphrase for encrypting jobs and for restoring encrypted snapshots.
    pub fn with_passphrase(mut self, passphrase: impl AsRef<[u8]>) -> Self {
        let encryptor = self.new_encryptor(passphrase);
        *self.encryptor.get_mut() = Some(encryptor);
        self
    }

    fn new_encryptor(&self, passphrase: impl AsRef<[u8]>) -> Arc<Encryptor> {
        Arc::new(
            Encryptor::new(passphrase, self.config.encryption_algorithm)
                .with_metrics(Arc::clone(&self.metrics)),
        )
    }

    /// Replace the built-in event bus with another sink.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self.bus = None;
        self
    }

    /// Subscribe to engine events; `None` when a custom sink replaced the bus.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<BackupEvent>> {
        self.bus.as_ref().map(|b| b.subscribe())
    }

    /// Active configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Storage manager used for every artifact
    pub fn storage(&self) -> &Arc<StorageManager> {
        &self.storage
    }

    /// Reduction counters accumulated since the engine was created
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Register or replace a job.
    pub fn register_job(&self, job: BackupJob) -> BackupResultT<()> {
        job.validate()?;
        info!(job_id = %job.job_id, name = %job.name, "job registered");
        self.jobs.write().insert(job.job_id.clone(), job);
        Ok(())
    }

    /// Registered job by id
    pub fn get_job(&self, job_id: &str) -> Option<BackupJob> {
        self.jobs.read().get(job_id).cloned()
    }

    /// Every registered job, sorted by id
    pub fn list_jobs(&self) -> Vec<BackupJob> {
        self.jobs.read().values().cloned().collect()
    }

    /// Unregister a job. Its snapshots stay.
    pub fn remove_job(&self, job_id: &str) -> Option<BackupJob> {
        self.jobs.write().remove(job_id)
    }

    /// Cancel every operation currently running. Later operations start fresh.
    pub fn cancel(&self) {
        let mut token = self.cancel.lock();
        token.cancel();
        *token = CancellationToken::new();
        info!("running operations cancelled");
    }

    fn token(&self) -> CancellationToken {
        self.cancel.lock().clone()
    }

    fn emit(&self, kind: BackupEventKind) {
        self.events.emit(BackupEvent::new(kind));
    }

    /// Snapshot and diff operations over the engine's snapshot store
    pub fn incremental_engine(&self) -> IncrementalEngine {
        IncrementalEngine::new(
            Arc::clone(&self.snapshots),
            Arc::clone(&self.chunker),
            self.config.effective_parallelism(),
        )
        .with_trust_metadata(self.config.trust_metadata)
        .with_racy_window(self.config.racy_window())
        .with_cancel(self.token())
    }

    /// Manifest operations over the engine's manifest store
    pub fn verifier(&self) -> IntegrityVerifier {
        IntegrityVerifier::new(
            Arc::clone(&self.manifests),
            self.config.effective_parallelism(),
        )
        .with_history(Arc::clone(&self.history))
        .with_cancel(self.token())
    }

    /// Restorer reading from the engine's storage with its passphrase
    pub fn restorer(&self) -> GranularRestorer {
        GranularRestorer::new(
            Arc::clone(&self.snapshots),
            Arc::clone(&self.storage),
            Arc::new(self.pipeline(true, false)),
            self.config.effective_parallelism(),
        )
        .with_cancel(self.token())
    }

    fn pipeline(&self, compression: bool, encryption: bool) -> ReductionPipeline {
        let encryptor = self.encryptor.read().clone();
        self.pipeline_with(compression, encryption, encryptor)
    }

    fn pipeline_with(
        &self,
        compression: bool,
        encryption: bool,
        encryptor: Option<Arc<Encryptor>>,
    ) -> ReductionPipeline {
        let compressor = AdaptiveCompressor::new(self.config.compression.clone())
            .with_metrics(Arc::clone(&self.metrics));
        let mut pipeline = ReductionPipeline::new(
            PipelineConfig {
                compression_enabled: compression,
                encryption_enabled: encryption,
            },
            compressor,
        )
        .with_metrics(Arc::clone(&self.metrics));
        if let Some(enc) = encryptor {
            pipeline = pipeline.with_encryptor(enc);
        }
        pipeline
    }

    /// Run a registered job once. Always returns a result; top-level failures
    /// set `success = false` and `error_message`.
    #[instrument(skip(self))]
    pub async fn run_backup_job(&self, job_id: &str) -> BackupResult {
        let started_at = Utc::now();
        let backup_id = format!(
            "{}-{}-{}",
            job_id,
            started_at.format("%Y%m%dT%H%M%SZ"),
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let mut result = BackupResult::new(job_id, &backup_id, started_at);
        self.emit(BackupEventKind::JobStarted {
            job_id: job_id.to_string(),
            backup_id: backup_id.clone(),
        });

        let outcome = match self.get_job(job_id) {
            Some(job) => {
                let _gate = self.run_gate.read().await;
                self.execute(&job, &mut result).await
            }
            None => Err(BackupError::UnknownJob(job_id.to_string())),
        };
        match outcome {
            Ok(()) => result.success = true,
            Err(e) => {
                warn!(job_id, backup_id = %backup_id, error = %e, "backup failed");
                result.success = false;
                result.error_message = Some(e.to_string());
            }
        }
        result.finished_at = Utc::now();

        let failed: Vec<String> = result
            .failed_destinations()
            .into_iter()
            .map(String::from)
            .collect();
        if result.success && !failed.is_empty() {
            self.emit(BackupEventKind::ReplicationFailure {
                backup_id: backup_id.clone(),
                destinations: failed,
            });
        }
        self.emit(BackupEventKind::JobCompleted {
            job_id: job_id.to_string(),
            backup_id: backup_id.clone(),
            success: result.success,
            total_files: result.total_files,
            total_size: result.total_size,
            error: result.error_message.clone(),
        });
        info!(
            job_id,
            backup_id = %backup_id,
            success = result.success,
            files = result.total_files,
            bytes = result.total_size,
            stored = result.compressed_size,
            failed = result.files_failed,
            "backup finished"
        );
        result
    }

    async fn execute(&self, job: &BackupJob, result: &mut BackupResult) -> BackupResultT<()> {
        job.validate()?;
        if let Some(missing) = job.destinations.iter().find(|d| !self.storage.contains(d)) {
            return Err(BackupError::InvalidJobConfig(format!(
                "destination {:?} is not registered",
                missing
            )));
        }
        if job.encryption && self.encryptor.read().is_none() {
            return Err(BackupError::InvalidJobConfig(
                "encryption is enabled but no passphrase is configured".into(),
            ));
        }
        let cancel = self.token();
        let parallelism = self.config.effective_parallelism();

        let roots = SourceRoot::for_sources(&job.source_paths)?;
        let discovery = scan::discover_async(roots).await?;
        result.errors.extend(discovery.errors.iter().cloned());

        let previous = self.snapshots.latest_for_job(&job.job_id)?;
        // Reused records point at blocks a destination that missed the
        // previous run may not hold, so such a run re-sends everything.
        let backfill = previous
            .as_ref()
            .map(|p| p.incomplete_destinations.clone())
            .unwrap_or_default();
        if !backfill.is_empty() {
            info!(destinations = ?backfill, "previous run left destinations incomplete, sending every block");
        }
        let baseline = previous.as_ref().filter(|p| {
            job.incremental
                && p.incomplete_destinations.is_empty()
                && p.destinations == job.destinations
                && p.roots == discovery.roots
        });
        let plan = plan_changes(
            baseline,
            &discovery,
            self.config.trust_metadata,
            self.config.racy_window(),
        );
        debug!(
            reused = plan.reused.len(),
            candidates = plan.candidates.len(),
            baseline = baseline.map(|b| b.name.as_str()),
            "backup planned"
        );

        let dedup = job.deduplication.then(|| {
            Arc::new(
                Deduplicator::new((*self.chunker).clone())
                    .with_metrics(Arc::clone(&self.metrics)),
            )
        });
        let failed_blocks = Arc::new(Mutex::new(HashSet::new()));
        let (tx, rx) = mpsc::channel(self.config.write_queue_depth);

        let writer = tokio::spawn(run_block_writer(
            Arc::clone(&self.storage),
            Arc::clone(&self.events),
            job.destinations.clone(),
            job.deduplication,
            rx,
            Arc::clone(&failed_blocks),
            parallelism,
            cancel.clone(),
        ));

        let keys: Vec<String> = plan.candidates.iter().map(|f| f.key.clone()).collect();
        let ctx = Arc::new(FileContext {
            chunker: Arc::clone(&self.chunker),
            dedup: dedup.clone(),
            pipeline: Arc::new(self.pipeline(job.compression, job.encryption)),
            tx,
            failed_blocks: Arc::clone(&failed_blocks),
            cancel: cancel.clone(),
        });
        let outcomes = map_blocking(plan.candidates, parallelism, &cancel, move |file| {
            ctx.process(&file)
        })
        .await;

        let tally = writer
            .await
            .map_err(|e| BackupError::Io(std::io::Error::other(e.to_string())))?;
        if cancel.is_cancelled() {
            return Err(BackupError::Cancelled);
        }
        result.replication = job
            .destinations
            .iter()
            .map(|d| {
                tally
                    .reports
                    .get(d)
                    .cloned()
                    .unwrap_or_else(|| DestinationReport::new(d))
            })
            .collect();
        if let Some(reason) = tally.aborted {
            return Err(BackupError::Io(std::io::Error::other(reason)));
        }

        let failed_blocks = failed_blocks.lock().clone();
        let mut current: BTreeMap<String, FileRecord> = plan
            .reused
            .into_iter()
            .map(|r| (r.path.clone(), r))
            .collect();
        let mut unreadable = BTreeSet::new();
        let mut cancelled = false;
        for (key, outcome) in keys.into_iter().zip(outcomes) {
            match outcome.and_then(|r| r) {
                Ok(record) if record.blocks.iter().any(|h| failed_blocks.contains(h)) => {
                    result.files_failed += 1;
                    result
                        .errors
                        .push(format!("{}: not stored on any destination", key));
                    unreadable.insert(key);
                }
                Ok(record) => {
                    result.total_files += 1;
                    result.total_size += record.size;
                    current.insert(key, record);
                }
                Err(BackupError::Cancelled) => cancelled = true,
                Err(e) => {
                    warn!(file = %key, error = %e, "file skipped");
                    result.files_failed += 1;
                    result.errors.push(format!("{}: {}", key, e));
                    unreadable.insert(key);
                }
            }
        }
        if cancelled || cancel.is_cancelled() {
            return Err(BackupError::Cancelled);
        }
        if tally.blocks_sent > 0
            && result
                .replication
                .iter()
                .all(|r| r.blocks_written + r.blocks_skipped == 0)
        {
            return Err(BackupError::Storage(StorageError::DestinationUnavailable {
                destination: job.destinations.join(","),
                reason: "no destination accepted any block".into(),
            }));
        }

        result.compressed_size = tally.compressed_size;
        result.compression_ratio = if result.total_size == 0 {
            1.0
        } else {
            result.compressed_size as f64 / result.total_size as f64
        };
        if let Some(dedup) = &dedup {
            let mut stats = dedup.stats();
            stats.files_processed = result.total_files;
            stats.files_failed = result.files_failed;
            result.deduplication_stats = Some(stats);
        }

        let changes = ChangeSet::classify(previous.as_ref(), current, &unreadable);
        result.change_set = changes.summary();

        let mut snapshot = Snapshot::new(&result.backup_id, discovery.roots);
        snapshot.job_id = Some(job.job_id.clone());
        snapshot.scanned_at = Some(discovery.started_at);
        snapshot.destinations = job.destinations.clone();
        snapshot.incomplete_destinations = result
            .replication
            .iter()
            .filter(|r| r.blocks_failed > 0)
            .map(|r| r.destination.clone())
            .collect();
        snapshot.files = changes.current;
        self.snapshots.save(&snapshot)?;
        let manifest = BackupManifest::from_snapshot(&result.backup_id, &snapshot);
        self.manifests.save(&manifest)?;

        self.replicate_documents(&snapshot, &manifest, &job.destinations, result)
            .await?;

        if job.verify_integrity {
            match self.verifier().verify(&result.backup_id).await {
                Ok(v) => {
                    self.emit(BackupEventKind::VerificationCompleted {
                        backup_id: result.backup_id.clone(),
                        health_score: v.health_score(),
                    });
                    result.verification = Some(v);
                }
                Err(BackupError::Cancelled) => return Err(BackupError::Cancelled),
                Err(e) => result.errors.push(format!("verification: {}", e)),
            }
        }
        Ok(())
    }

    async fn replicate_documents(
        &self,
        snapshot: &Snapshot,
        manifest: &BackupManifest,
        destinations: &[String],
        result: &mut BackupResult,
    ) -> BackupResultT<()> {
        let snapshot_json = Bytes::from(snapshot.to_json()?);
        let manifest_json = Bytes::from(manifest.to_json()?);
        let snapshot_id = snapshot_artifact_id(&snapshot.name);
        let manifest_id = manifest_artifact_id(&manifest.backup_id);
        let (snapshot_copies, manifest_copies) = tokio::join!(
            self.storage.replicate_artifact(
                &snapshot_id,
                snapshot_json,
                destinations
            ),
            self.storage.replicate_artifact(
                &manifest_id,
                manifest_json,
                destinations
            ),
        );

        let mut stored: HashMap<&str, bool> = HashMap::new();
        for copy in snapshot_copies.iter().chain(manifest_copies.iter()) {
            let ok = stored.entry(copy.destination.as_str()).or_insert(true);
            *ok &= copy.success;
            if let Some(report) = result
                .replication
                .iter_mut()
                .find(|r| r.destination == copy.destination)
            {
                report.bytes_transferred += copy.bytes_transferred;
                if let Some(err) = &copy.error {
                    report.record_error(format!("metadata: {}", err));
                }
            }
        }
        for report in &mut result.replication {
            report.documents_stored = stored.get(report.destination.as_str()).copied().unwrap_or(false);
        }
        Ok(())
    }

    /// Restore targets from stored snapshots.
    pub async fn restore_files(&self, targets: &[RestoreTarget]) -> RestoreResult {
        let result = self.restorer().restore_files(targets).await;
        self.emit(BackupEventKind::RestoreCompleted {
            files_restored: result.files_restored,
            total_size_restored: result.total_size_restored,
            errors: result.errors.len(),
        });
        result
    }

    /// Verify a backup's manifest against its source roots as they are now.
    pub async fn verify_backup(&self, backup_id: &str) -> BackupResultT<VerificationResult> {
        let result = self.verifier().verify(backup_id).await?;
        self.emit(BackupEventKind::VerificationCompleted {
            backup_id: backup_id.to_string(),
            health_score: result.health_score(),
        });
        Ok(result)
    }

    /// Past verifications, newest first, for one backup or all of them.
    pub fn verification_history(
        &self,
        backup_id: Option<&str>,
        limit: usize,
    ) -> BackupResultT<Vec<VerificationRecord>> {
        self.history.recent(backup_id, limit)
    }

    /// Problems that would stop a restore target; empty means ready.
    pub fn validate_restore_target(&self, target: &RestoreTarget) -> Vec<String> {
        self.restorer().validate_restore_target(target)
    }

    /// Reachability and space of a registered destination.
    pub async fn destination_status(&self, name: &str) -> BackupResultT<DestinationStatus> {
        Ok(self.storage.destination_status(name).await?)
    }

    /// Check every copy of a backup's blocks and documents, rewriting missing
    /// or damaged copies from an intact replica.
    #[instrument(skip(self))]
    pub async fn repair_backup(&self, backup_id: &str) -> BackupResultT<RepairReport> {
        let _gate = self.run_gate.read().await;
        let snapshot = self.snapshots.load(backup_id)?;
        let cancel = self.token();
        let pipeline = Arc::new(self.pipeline(true, false));
        let mut report = RepairReport {
            backup_id: backup_id.to_string(),
            ..RepairReport::default()
        };

        let mut seen = HashSet::new();
        for hash in snapshot.files.values().flat_map(|r| r.blocks.iter()) {
            if !seen.insert(*hash) {
                continue;
            }
            if cancel.is_cancelled() {
                return Err(BackupError::Cancelled);
            }
            report.blocks_checked += 1;
            let id = block_artifact_id(hash);
            let mut intact: Option<Bytes> = None;
            let mut damaged = Vec::new();
            for dest in &snapshot.destinations {
                match self.storage.read_from(dest, &id).await {
                    Ok(stored) => match decode_block(&pipeline, stored.clone(), *hash).await {
                        Ok(_) => {
                            intact.get_or_insert(stored);
                        }
                        Err(BackupError::Reduce(ReduceError::MissingKey)) => {
                            return Err(ReduceError::MissingKey.into())
                        }
                        Err(e) => {
                            warn!(destination = %dest, block = %id, error = %e, "damaged block copy");
                            damaged.push(dest.clone());
                        }
                    },
                    Err(StorageError::NotFound { .. }) => damaged.push(dest.clone()),
                    Err(e) => report.errors.push(format!("{}: {}: {}", dest, id, e)),
                }
            }
            match intact {
                Some(stored) if !damaged.is_empty() => {
                    for copy in self.storage.replicate_artifact(&id, stored, &damaged).await {
                        if copy.success {
                            report.blocks_repaired += 1;
                        } else {
                            report.errors.push(format!(
                                "{}: {}: {}",
                                copy.destination,
                                id,
                                copy.error.unwrap_or_default()
                            ));
                        }
                    }
                }
                Some(_) => {}
                None => report.unrecoverable.push(id),
            }
        }

        let mut documents = vec![(
            snapshot_artifact_id(&snapshot.name),
            Bytes::from(snapshot.to_json()?),
        )];
        match self.manifests.load(backup_id) {
            Ok(m) => documents.push((manifest_artifact_id(backup_id), Bytes::from(m.to_json()?))),
            Err(BackupError::ManifestNotFound(_)) => {}
            Err(e) => return Err(e),
        }
        for (id, body) in documents {
            let mut missing = Vec::new();
            for dest in &snapshot.destinations {
                match self.storage.exists_on(dest, &id).await {
                    Ok(true) => {}
                    Ok(false) => missing.push(dest.clone()),
                    Err(e) => report.errors.push(format!("{}: {}: {}", dest, id, e)),
                }
            }
            if missing.is_empty() {
                continue;
            }
            for copy in self.storage.replicate_artifact(&id, body.clone(), &missing).await {
                if copy.success {
                    report.documents_repaired += 1;
                } else {
                    report.errors.push(format!(
                        "{}: {}: {}",
                        copy.destination,
                        id,
                        copy.error.unwrap_or_default()
                    ));
                }
            }
        }

        info!(
            backup_id,
            checked = report.blocks_checked,
            repaired = report.blocks_repaired,
            documents = report.documents_repaired,
            unrecoverable = report.unrecoverable.len(),
            "repair finished"
        );
        Ok(report)
    }

    /// Delete artifacts on a destination that no local snapshot references
    /// and that are older than `min_age`. Runs exclusively with backups.
    #[instrument(skip(self))]
    pub async fn cleanup_destination(
        &self,
        name: &str,
        min_age: Duration,
    ) -> BackupResultT<CleanupReport> {
        if !self.storage.contains(name) {
            return Err(StorageError::UnknownDestination(name.to_string()).into());
        }
        let _gate = self.run_gate.write().await;

        let mut referenced: HashSet<String> = HashSet::new();
        for summary in self.snapshots.list()? {
            let snap = self.snapshots.load(&summary.name)?;
            if !snap.destinations.iter().any(|d| d == name) {
                continue;
            }
            referenced.insert(snapshot_artifact_id(&snap.name));
            referenced.insert(manifest_artifact_id(&snap.name));
            for hash in snap.files.values().flat_map(|r| r.blocks.iter()) {
                referenced.insert(block_artifact_id(hash));
            }
        }

        let written_before = SystemTime::now()
            .checked_sub(min_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let keep = |id: &str| referenced.contains(id);
        let mut total = CleanupReport::default();
        for prefix in ["blocks/", "snapshots/", "manifests/"] {
            let part = self
                .storage
                .cleanup_destination(name, prefix, written_before, &keep)
                .await?;
            total.examined += part.examined;
            total.removed += part.removed;
            total.bytes_freed += part.bytes_freed;
            total.failures.extend(part.failures);
        }
        Ok(total)
    }

    /// Re-encrypt every stored block under a new passphrase. The engine
    /// switches to the new passphrase only when every copy was rewritten;
    /// otherwise the old one stays active and the call can be repeated.
    #[instrument(skip_all)]
    pub async fn change_passphrase(
        &self,
        new_passphrase: impl AsRef<[u8]>,
    ) -> BackupResultT<RekeyReport> {
        let current = self.encryptor.read().clone().ok_or_else(|| {
            BackupError::InvalidJobConfig("no passphrase is configured".into())
        })?;
        let target = self.new_encryptor(new_passphrase);
        let _gate = self.run_gate.write().await;
        let cancel = self.token();
        let old = Arc::new(self.pipeline_with(true, false, Some(current)));
        let new = Arc::new(self.pipeline_with(true, false, Some(Arc::clone(&target))));

        let mut report = RekeyReport::default();
        let mut done: HashSet<(String, ChunkHash)> = HashSet::new();
        for summary in self.snapshots.list()? {
            let snap = self.snapshots.load(&summary.name)?;
            for hash in snap.files.values().flat_map(|r| r.blocks.iter()) {
                for dest in &snap.destinations {
                    if !done.insert((dest.clone(), *hash)) {
                        continue;
                    }
                    if cancel.is_cancelled() {
                        return Err(BackupError::Cancelled);
                    }
                    let id = block_artifact_id(hash);
                    let outcome = match self.storage.read_from(dest, &id).await {
                        Ok(stored) => {
                            rekey_block(&old, &new, &target, stored, *hash).await
                        }
                        Err(e) => Err(e.into()),
                    };
                    match outcome {
                        Ok(Rekeyed::Rewritten(body)) => {
                            let copies = self
                                .storage
                                .replicate_artifact(&id, Bytes::from(body), std::slice::from_ref(dest))
                                .await;
                            match copies.into_iter().find(|c| !c.success) {
                                None => report.blocks_rewritten += 1,
                                Some(c) => report.failures.push(format!(
                                    "{}: {}: {}",
                                    dest,
                                    id,
                                    c.error.unwrap_or_default()
                                )),
                            }
                        }
                        Ok(Rekeyed::AlreadyCurrent) => report.blocks_already_current += 1,
                        Ok(Rekeyed::Plain) => report.blocks_unencrypted += 1,
                        Err(e) => report.failures.push(format!("{}: {}: {}", dest, id, e)),
                    }
                }
            }
        }

        if report.is_complete() {
            *self.encryptor.write() = Some(target);
            info!(rewritten = report.blocks_rewritten, "passphrase changed");
        } else {
            warn!(
                rewritten = report.blocks_rewritten,
                failed = report.failures.len(),
                "passphrase change incomplete, old passphrase still active"
            );
        }
        Ok(report)
    }

    /// Delete a job's snapshots older than its retention window, always keeping
    /// the latest, then reclaim blocks no remaining snapshot references.
    #[instrument(skip(self))]
    pub async fn prune_snapshots(&self, job_id: &str) -> BackupResultT<PruneReport> {
        let job = self
            .get_job(job_id)
            .ok_or_else(|| BackupError::UnknownJob(job_id.to_string()))?;
        let mut report = PruneReport::default();
        if job.retention_days == 0 {
            return Ok(report);
        }
        let _gate = self.run_gate.write().await;

        let cutoff = Utc::now() - chrono::Duration::days(i64::from(job.retention_days));
        let mut history = self.snapshots.list_for_job(job_id)?;
        history.pop();
        let mut expired = Vec::new();
        for summary in history.into_iter().filter(|s| s.created_at < cutoff) {
            expired.push(self.snapshots.load(&summary.name)?);
        }
        if expired.is_empty() {
            return Ok(report);
        }

        for snap in &expired {
            self.snapshots.delete(&snap.name)?;
            self.manifests.delete(&snap.name)?;
            self.history.delete(&snap.name)?;
            self.storage
                .delete_everywhere(&snapshot_artifact_id(&snap.name), &snap.destinations)
                .await;
            self.storage
                .delete_everywhere(&manifest_artifact_id(&snap.name), &snap.destinations)
                .await;
            report.snapshots_removed.push(snap.name.clone());
        }

        let mut live: HashSet<ChunkHash> = HashSet::new();
        for summary in self.snapshots.list()? {
            let snap = self.snapshots.load(&summary.name)?;
            for record in snap.files.values() {
                live.extend(record.blocks.iter().copied());
            }
        }
        let mut reclaimed: HashSet<ChunkHash> = HashSet::new();
        for snap in &expired {
            for hash in snap.files.values().flat_map(|r| r.blocks.iter()) {
                if live.contains(hash) || !reclaimed.insert(*hash) {
                    continue;
                }
                self.storage
                    .delete_everywhere(&block_artifact_id(hash), &snap.destinations)
                    .await;
            }
        }
        report.blocks_removed = reclaimed.len() as u64;
        info!(
            job_id,
            snapshots = report.snapshots_removed.len(),
            blocks = report.blocks_removed,
            "retention applied"
        );
        Ok(report)
    }
}

/// Move one stored copy to the new passphrase on the blocking pool. A copy
/// that only the new passphrase opens was rewritten by an earlier attempt.
async fn rekey_block(
    old: &Arc<ReductionPipeline>,
    new: &Arc<ReductionPipeline>,
    target: &Arc<Encryptor>,
    stored: Bytes,
    hash: ChunkHash,
) -> BackupResultT<Rekeyed> {
    let (old, new, target) = (Arc::clone(old), Arc::clone(new), Arc::clone(target));
    tokio::task::spawn_blocking(move || match old.reencrypt_block(&stored, &hash, &target) {
        Ok(Some(body)) => Ok(Rekeyed::Rewritten(body)),
        Ok(None) => Ok(Rekeyed::Plain),
        Err(ReduceError::DecryptionFailed(reason)) => new
            .restore_block(&stored, &hash)
            .map(|_| Rekeyed::AlreadyCurrent)
            .map_err(|_| ReduceError::DecryptionFailed(reason)),
        Err(e) => Err(e),
    })
    .await
    .map_err(|e| BackupError::Io(std::io::Error::other(e.to_string())))?
    .map_err(BackupError::from)
}

/// A reduced block on its way to the writer
struct BlockWrite {
    hash: ChunkHash,
    stored: Bytes,
}

/// Shared state of the per-file workers
struct FileContext {
    chunker: Arc<Chunker>,
    dedup: Option<Arc<Deduplicator>>,
    pipeline: Arc<ReductionPipeline>,
    tx: mpsc::Sender<BlockWrite>,
    failed_blocks: Arc<Mutex<HashSet<ChunkHash>>>,
    cancel: CancellationToken,
}

impl FileContext {
    /// Chunk, classify and reduce one file, queueing new blocks for the writer.
    fn process(&self, file: &DiscoveredFile) -> BackupResultT<FileRecord> {
        let block_read = |reason: String| BackupError::BlockRead {
            path: file.abs_path.clone(),
            reason,
        };
        let handle = File::open(&file.abs_path).map_err(|e| block_read(e.to_string()))?;
        let mut hasher = ContentHasher::new();
        let mut blocks = Vec::new();

        for chunk in self.chunker.chunk_reader(BufReader::new(handle)) {
            if self.cancel.is_cancelled() {
                return Err(BackupError::Cancelled);
            }
            let chunk = chunk.map_err(|e| match e {
                ReduceError::Io(io) => block_read(io.to_string()),
                other => BackupError::Reduce(other),
            })?;
            hasher.update(&chunk.data);
            blocks.push(chunk.hash);

            if let Some(dedup) = &self.dedup {
                if dedup.classify(&chunk) == BlockClass::Duplicate {
                    continue;
                }
            }
            let reduced = match self.pipeline.reduce_block(&chunk) {
                Ok(r) => r,
                Err(e) => {
                    self.failed_blocks.lock().insert(chunk.hash);
                    return Err(e.into());
                }
            };
            let write = BlockWrite {
                hash: reduced.hash,
                stored: reduced.stored,
            };
            if self.tx.blocking_send(write).is_err() {
                self.failed_blocks.lock().insert(chunk.hash);
                return Err(BackupError::Io(std::io::Error::other("block writer stopped")));
            }
        }

        Ok(FileRecord::captured(
            file,
            hasher.len(),
            hasher.finalize(),
            blocks,
        ))
    }
}

/// Per-destination accounting of the block writer
#[derive(Default)]
struct WriteTally {
    reports: HashMap<String, DestinationReport>,
    compressed_size: u64,
    blocks_sent: u64,
    aborted: Option<String>,
}

type StoredBlock = (ChunkHash, Vec<ReplicationResult>);

impl WriteTally {
    fn settle(
        &mut self,
        done: Result<StoredBlock, JoinError>,
        failed_blocks: &Mutex<HashSet<ChunkHash>>,
        events: &dyn EventSink,
    ) {
        match done {
            Ok((hash, results)) => self.absorb(hash, results, failed_blocks, events),
            Err(e) => self.aborted = Some(format!("block write task failed: {}", e)),
        }
    }

    fn absorb(
        &mut self,
        hash: ChunkHash,
        results: Vec<ReplicationResult>,
        failed_blocks: &Mutex<HashSet<ChunkHash>>,
        events: &dyn EventSink,
    ) {
        let mut stored_anywhere = false;
        for r in results {
            let report = self
                .reports
                .entry(r.destination.clone())
                .or_insert_with(|| DestinationReport::new(&r.destination));
            if r.success {
                stored_anywhere = true;
                if r.skipped {
                    report.blocks_skipped += 1;
                } else {
                    report.blocks_written += 1;
                    report.bytes_transferred += r.bytes_transferred;
                }
                continue;
            }
            report.blocks_failed += 1;
            let reason = r.error.unwrap_or_else(|| "unknown error".into());
            if report.errors.is_empty() {
                events.emit(BackupEvent::new(BackupEventKind::StorageFailure {
                    destination: r.destination.clone(),
                    reason: reason.clone(),
                }));
            }
            report.record_error(format!("{}: {}", block_artifact_id(&hash), reason));
        }
        if !stored_anywhere {
            failed_blocks.lock().insert(hash);
        }
    }
}

/// Drain the block queue, storing up to `max_inflight` blocks concurrently.
/// Cancellation aborts the writes in flight and closes the queue.
#[allow(clippy::too_many_arguments)]
async fn run_block_writer(
    storage: Arc<StorageManager>,
    events: Arc<dyn EventSink>,
    destinations: Vec<String>,
    skip_existing: bool,
    mut rx: mpsc::Receiver<BlockWrite>,
    failed_blocks: Arc<Mutex<HashSet<ChunkHash>>>,
    max_inflight: usize,
    cancel: CancellationToken,
) -> WriteTally {
    let mut tally = WriteTally::default();
    for d in &destinations {
        tally.reports.insert(d.clone(), DestinationReport::new(d));
    }
    let destinations = Arc::new(destinations);
    let mut inflight = JoinSet::new();

    loop {
        let block = tokio::select! {
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(block) => block,
                None => break,
            },
        };
        while inflight.len() >= max_inflight.max(1) && !cancel.is_cancelled() {
            tokio::select! {
                _ = cancel.cancelled() => {}
                Some(done) = inflight.join_next() => {
                    tally.settle(done, &failed_blocks, events.as_ref());
                }
            }
        }
        if cancel.is_cancelled() {
            break;
        }
        tally.compressed_size += block.stored.len() as u64;
        tally.blocks_sent += 1;
        let storage = Arc::clone(&storage);
        let destinations = Arc::clone(&destinations);
        inflight.spawn(async move {
            let id = block_artifact_id(&block.hash);
            let results = storage
                .store_block(&id, block.stored, &destinations, skip_existing)
                .await;
            (block.hash, results)
        });
    }
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                inflight.shutdown().await;
                debug!(blocks = tally.blocks_sent, "block writer cancelled");
                return tally;
            }
            done = inflight.join_next() => match done {
                Some(done) => tally.settle(done, &failed_blocks, events.as_ref()),
                None => break,
            },
        }
    }
    debug!(blocks = tally.blocks_sent, bytes = tally.compressed_size, "block writer drained");
    tally
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio::sync::Notify;
    use vaultkeep_storage::{Destination, StorageDestination, StorageResult};

    /// Accepts writes and never finishes them
    struct StallingDestination {
        entered: Arc<Notify>,
    }

    #[async_trait]
    impl Destination for StallingDestination {
        fn name(&self) -> &str {
            "stall"
        }
        async fn write(&self, _id: &str, _data: Bytes) -> StorageResult<()> {
            self.entered.notify_one();
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok(())
        }
        async fn read(&self, id: &str) -> StorageResult<Bytes> {
            Err(StorageError::NotFound {
                destination: "stall".into(),
                id: id.into(),
            })
        }
        async fn exists(&self, _id: &str) -> StorageResult<bool> {
            Ok(false)
        }
        async fn delete(&self, _id: &str) -> StorageResult<()> {
            Ok(())
        }
    }

    fn engine(dir: &std::path::Path) -> BackupEngine {
        let storage = Arc::new(StorageManager::default());
        storage
            .add_destination(StorageDestination::local("primary", dir.join("dest")))
            .unwrap();
        BackupEngine::new(EngineConfig::with_state_dir(dir.join("state")), storage).unwrap()
    }

    #[test]
    fn test_job_registry() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let job = BackupJob::new("j1", "J1", vec![dir.path().to_path_buf()], vec!["primary".into()]);
        engine.register_job(job.clone()).unwrap();
        assert_eq!(engine.get_job("j1"), Some(job));
        assert_eq!(engine.list_jobs().len(), 1);
        assert!(engine.remove_job("j1").is_some());
        assert!(engine.get_job("j1").is_none());

        let bad = BackupJob::new("j2", "J2", vec![], vec!["primary".into()]);
        assert!(engine.register_job(bad).is_err());
    }

    #[tokio::test]
    async fn test_unknown_job_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let mut events = engine.subscribe().unwrap();
        let result = engine.run_backup_job("ghost").await;
        assert!(!result.success);
        assert!(result.error_message.unwrap().contains("ghost"));
        assert!(matches!(
            events.recv().await.unwrap().kind,
            BackupEventKind::JobStarted { .. }
        ));
        assert!(matches!(
            events.recv().await.unwrap().kind,
            BackupEventKind::JobCompleted { success: false, .. }
        ));
    }

    #[tokio::test]
    async fn test_encryption_requires_passphrase() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        let engine = engine(dir.path());
        engine
            .register_job(BackupJob::new("enc", "Enc", vec![src], vec!["primary".into()]))
            .unwrap();
        let result = engine.run_backup_job("enc").await;
        assert!(!result.success);
        assert!(result.error_message.unwrap().contains("passphrase"));
    }

    #[tokio::test]
    async fn test_unregistered_destination_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let mut job = BackupJob::new(
            "j",
            "J",
            vec![PathBuf::from("/tmp")],
            vec!["primary".into(), "nowhere".into()],
        );
        job.encryption = false;
        engine.register_job(job).unwrap();
        let result = engine.run_backup_job("j").await;
        assert!(!result.success);
        assert!(result.error_message.unwrap().contains("nowhere"));
    }

    #[tokio::test]
    async fn test_missing_source_is_top_level_failure() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let mut job = BackupJob::new(
            "j",
            "J",
            vec![dir.path().join("absent")],
            vec!["primary".into()],
        );
        job.encryption = false;
        engine.register_job(job).unwrap();
        let result = engine.run_backup_job("j").await;
        assert!(!result.success);
        assert!(result.error_message.unwrap().starts_with("Source unreadable"));
        assert!(engine.incremental_engine().list_snapshots().unwrap().is_empty());
    }

    #[test]
    fn test_cancel_replaces_token() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let running = engine.token();
        engine.cancel();
        assert!(running.is_cancelled());
        assert!(!engine.token().is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_interrupts_block_writes() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        for i in 0..8 {
            std::fs::write(src.join(format!("f{}", i)), vec![i as u8; 8192]).unwrap();
        }
        let entered = Arc::new(Notify::new());
        let storage = Arc::new(StorageManager::default());
        storage
            .add_backend(
                StorageDestination::remote("stall", "mem", "nowhere"),
                Arc::new(StallingDestination {
                    entered: Arc::clone(&entered),
                }),
            )
            .unwrap();
        let engine =
            BackupEngine::new(EngineConfig::with_state_dir(dir.path().join("state")), storage)
                .unwrap();
        let mut job = BackupJob::new("c", "C", vec![src], vec!["stall".into()]);
        job.encryption = false;
        engine.register_job(job).unwrap();

        let (result, ()) = tokio::time::timeout(Duration::from_secs(30), async {
            tokio::join!(engine.run_backup_job("c"), async {
                entered.notified().await;
                engine.cancel();
            })
        })
        .await
        .unwrap();

        assert!(!result.success);
        assert_eq!(result.error_message.as_deref(), Some("Operation cancelled"));
        assert!(engine.incremental_engine().list_snapshots().unwrap().is_empty());
        assert!(engine.verifier().list_manifests().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_prune_keeps_latest_and_reclaims_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("f"), b"first version").unwrap();
        let engine = engine(dir.path());
        let mut job = BackupJob::new("p", "P", vec![src.clone()], vec!["primary".into()]);
        job.encryption = false;
        job.retention_days = 1;
        engine.register_job(job).unwrap();

        let first = engine.run_backup_job("p").await;
        assert!(first.success, "{:?}", first.error_message);
        std::fs::write(src.join("f"), b"second version, longer").unwrap();
        let second = engine.run_backup_job("p").await;
        assert!(second.success, "{:?}", second.error_message);

        // Age the first snapshot past the retention window.
        let store = SnapshotStore::new(dir.path().join("state/snapshots"));
        let mut old = store.load(&first.backup_id).unwrap();
        old.created_at = Utc::now() - chrono::Duration::days(3);
        store.delete(&old.name).unwrap();
        store.save(&old).unwrap();

        let report = engine.prune_snapshots("p").await.unwrap();
        assert_eq!(report.snapshots_removed, vec![first.backup_id.clone()]);
        assert_eq!(report.blocks_removed, 1);
        assert!(store.load(&second.backup_id).is_ok());
        assert!(!dir
            .path()
            .join("dest/snapshots")
            .join(format!("{}.json", first.backup_id))
            .exists());
    }
}
