#![warn(missing_docs)]

//! vaultkeep engine: snapshots, incremental change detection, integrity
//! verification, granular restore and backup orchestration
//!
//! A [`BackupEngine`] runs registered [`BackupJob`]s: source trees are chunked and
//! reduced through `vaultkeep-reduce`, blocks fan out to every destination through
//! `vaultkeep-storage`, and each run leaves a [`Snapshot`] and a [`BackupManifest`]
//! named by its backup id.

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod incremental;
pub mod job;
pub mod layout;
pub mod manifest;
pub mod persist;
pub mod restore;
pub mod scan;
pub mod snapshot;
pub mod telemetry;
pub mod verifier;
mod workers;

pub use config::EngineConfig;
pub use engine::{BackupEngine, PruneReport, RekeyReport, RepairReport};
pub use error::{BackupError, BackupResultT};
pub use events::{BackupEvent, BackupEventKind, EventBus, EventSink, NullSink};
pub use incremental::{ChangeKind, ChangePlan, ChangeSet, ChangeSummary, FileChange, IncrementalEngine};
pub use job::{BackupJob, BackupResult, DestinationReport};
pub use manifest::{BackupManifest, ManifestEntry, ManifestStore};
pub use persist::FORMAT_VERSION;
pub use restore::{GranularRestorer, PlannedFile, RestoreResult, RestoreTarget};
pub use scan::{DiscoveredFile, Discovery, SourceRoot};
pub use snapshot::{FileRecord, Snapshot, SnapshotStore, SnapshotSummary};
pub use telemetry::init_tracing;
pub use verifier::{
    CheckStatus, FileCheck, IntegrityVerifier, VerificationHistory, VerificationRecord,
    VerificationResult,
};
