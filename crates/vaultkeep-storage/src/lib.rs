#![warn(missing_docs)]

//! vaultkeep storage subsystem: backup destinations and replication
//!
//! Destinations are named write targets behind the [`Destination`] capability.
//! The local filesystem is built in; remote protocols plug in through
//! [`DestinationFactory`]. [`StorageManager`] fans each artifact out to every
//! requested destination concurrently and reports per-destination outcomes.

pub mod atomic_write;
pub mod destination;
pub mod error;
pub mod local;
pub mod replication;

pub use atomic_write::{write_file_atomic, write_file_atomic_async};
pub use destination::{
    validate_artifact_id, ArtifactInfo, Capacity, Destination, DestinationFactory,
    DestinationKind, StorageDestination,
};
pub use error::{StorageError, StorageResult};
pub use local::{filesystem_capacity, LocalDestination};
pub use replication::{
    CleanupReport, DestinationStatus, ReplicationResult, ReplicationSummary, StorageManager,
    DEFAULT_REPLICATION_TIMEOUT,
};
