//! Destination capability and registration records.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};

/// A place backup artifacts can be written to and read back from.
///
/// Artifact ids are `/`-separated relative paths such as `blocks/ab/ab12...`.
#[async_trait]
pub trait Destination: Send + Sync {
    /// Registered name
    fn name(&self) -> &str;

    /// Store an artifact, replacing any previous content with the same id.
    /// Must never leave a partially written artifact visible under `id`.
    async fn write(&self, id: &str, data: Bytes) -> StorageResult<()>;

    /// Fetch an artifact.
    async fn read(&self, id: &str) -> StorageResult<Bytes>;

    /// Check whether an artifact is present.
    async fn exists(&self, id: &str) -> StorageResult<bool>;

    /// Remove an artifact. Removing a missing artifact is not an error.
    async fn delete(&self, id: &str) -> StorageResult<()>;

    /// Artifacts whose id starts with `prefix`, in no particular order.
    async fn list(&self, prefix: &str) -> StorageResult<Vec<ArtifactInfo>> {
        let _ = prefix;
        Err(StorageError::Unsupported {
            destination: self.name().to_string(),
            operation: "list".to_string(),
        })
    }

    /// Space on the backing store, when the backend can tell.
    async fn capacity(&self) -> StorageResult<Option<Capacity>> {
        Ok(None)
    }
}

/// An artifact as enumerated by [`Destination::list`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactInfo {
    /// Artifact id
    pub id: String,
    /// Stored length in bytes
    pub size: u64,
    /// Last write, if the backend records one
    pub modified: Option<SystemTime>,
}

/// Space figures for a destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacity {
    /// Bytes available to an unprivileged writer
    pub free_bytes: u64,
    /// Size of the backing filesystem or bucket quota
    pub total_bytes: u64,
}

/// Where a destination lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DestinationKind {
    /// Directory on a locally mounted filesystem
    Local {
        /// Root directory for artifacts
        path: PathBuf,
    },
    /// Remote store served by a registered [`DestinationFactory`]
    Remote {
        /// Factory key, e.g. `s3` or `sftp`
        protocol: String,
        /// Protocol-specific location
        endpoint: String,
    },
}

/// A named write target as registered with the storage manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageDestination {
    /// Unique name jobs refer to
    pub name: String,
    /// Location
    #[serde(flatten)]
    pub kind: DestinationKind,
    /// Disabled destinations are skipped with a failed result
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Free-form options passed to remote factories
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

fn default_enabled() -> bool {
    true
}

impl StorageDestination {
    /// Enabled local destination rooted at `path`
    pub fn local(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            kind: DestinationKind::Local { path: path.into() },
            enabled: true,
            options: BTreeMap::new(),
        }
    }

    /// Enabled remote destination
    pub fn remote(
        name: impl Into<String>,
        protocol: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: DestinationKind::Remote {
                protocol: protocol.into(),
                endpoint: endpoint.into(),
            },
            enabled: true,
            options: BTreeMap::new(),
        }
    }

    /// `local` or the remote protocol name
    pub fn type_name(&self) -> &str {
        match &self.kind {
            DestinationKind::Local { .. } => "local",
            DestinationKind::Remote { protocol, .. } => protocol,
        }
    }
}

/// Builds destinations for one remote protocol.
pub trait DestinationFactory: Send + Sync {
    /// Protocol this factory handles
    fn protocol(&self) -> &str;

    /// Construct a live destination for the registration record.
    fn create(&self, dest: &StorageDestination) -> StorageResult<Arc<dyn Destination>>;
}

/// Check that an artifact id is a non-empty relative path without `.`/`..` segments.
pub fn validate_artifact_id(id: &str) -> StorageResult<()> {
    let bad = id.is_empty()
        || id.starts_with('/')
        || id.contains('\\')
        || id
            .split('/')
            .any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if bad {
        return Err(StorageError::InvalidArtifactId { id: id.to_string() });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_id_validation() {
        assert!(validate_artifact_id("blocks/ab/abcdef").is_ok());
        assert!(validate_artifact_id("snapshots/job-1.json").is_ok());
        for bad in ["", "/abs", "a/../b", "a//b", "./a", "a/", "a\\b"] {
            assert!(validate_artifact_id(bad).is_err(), "{:?} accepted", bad);
        }
    }

    #[test]
    fn destination_serde_shape() {
        let json = r#"{"name":"nas","type":"local","path":"/mnt/nas"}"#;
        let dest: StorageDestination = serde_json::from_str(json).unwrap();
        assert_eq!(dest, StorageDestination::local("nas", "/mnt/nas"));
        assert!(dest.enabled);
        assert_eq!(dest.type_name(), "local");

        let remote = StorageDestination::remote("offsite", "s3", "s3://bucket/prefix");
        let back: StorageDestination =
            serde_json::from_str(&serde_json::to_string(&remote).unwrap()).unwrap();
        assert_eq!(back, remote);
        assert_eq!(back.type_name(), "s3");
    }
}
