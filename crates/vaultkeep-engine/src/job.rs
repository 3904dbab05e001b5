//! Backup job definitions and per-run results.

use std::collections::HashSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use vaultkeep_reduce::DeduplicationStats;

use crate::error::{BackupError, BackupResultT};
use crate::incremental::ChangeSummary;
use crate::persist;
use crate::verifier::VerificationResult;

fn yes() -> bool {
    true
}

fn default_retention_days() -> u32 {
    30
}

/// A configured backup. Built and persisted by callers, registered with the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupJob {
    /// Unique id; also the prefix of every backup id the job produces
    pub job_id: String,
    /// Display name
    pub name: String,
    /// Directories to capture
    pub source_paths: Vec<PathBuf>,
    /// Registered destination names, primary first
    pub destinations: Vec<String>,
    /// Compress blocks adaptively
    #[serde(default = "yes")]
    pub compression: bool,
    /// Requires the engine to hold a passphrase
    #[serde(default = "yes")]
    pub encryption: bool,
    /// Store each distinct block once
    #[serde(default = "yes")]
    pub deduplication: bool,
    /// Reuse the job's latest snapshot as a baseline
    #[serde(default = "yes")]
    pub incremental: bool,
    /// Check the finished backup against its manifest
    #[serde(default = "yes")]
    pub verify_integrity: bool,
    /// Snapshots older than this are pruned; 0 keeps everything
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl BackupJob {
    /// Job with every feature enabled and 30-day retention.
    pub fn new(
        job_id: impl Into<String>,
        name: impl Into<String>,
        source_paths: Vec<PathBuf>,
        destinations: Vec<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            name: name.into(),
            source_paths,
            destinations,
            compression: true,
            encryption: true,
            deduplication: true,
            incremental: true,
            verify_integrity: true,
            retention_days: default_retention_days(),
        }
    }

    /// Structural checks that need no engine state.
    pub fn validate(&self) -> BackupResultT<()> {
        persist::validate_name(&self.job_id)
            .map_err(|_| BackupError::InvalidJobConfig(format!("invalid job id {:?}", self.job_id)))?;
        if self.source_paths.is_empty() {
            return Err(BackupError::InvalidJobConfig("no source paths".into()));
        }
        if let Some(p) = self.source_paths.iter().find(|p| !p.is_absolute()) {
            return Err(BackupError::InvalidJobConfig(format!(
                "source path {} is not absolute",
                p.display()
            )));
        }
        if self.destinations.is_empty() {
            return Err(BackupError::InvalidJobConfig("no destinations".into()));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = self.destinations.iter().find(|d| !seen.insert(d.as_str())) {
            return Err(BackupError::InvalidJobConfig(format!(
                "destination {:?} listed twice",
                dup
            )));
        }
        Ok(())
    }
}

/// What one destination received during a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DestinationReport {
    /// Destination name
    pub destination: String,
    /// Blocks written
    pub blocks_written: u64,
    /// Blocks already present
    pub blocks_skipped: u64,
    /// Blocks rejected or timed out
    pub blocks_failed: u64,
    /// Payload bytes sent
    pub bytes_transferred: u64,
    /// Snapshot and manifest copies stored
    pub documents_stored: bool,
    /// First few failures, for diagnosis
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl DestinationReport {
    const MAX_ERRORS: usize = 16;

    pub(crate) fn new(destination: &str) -> Self {
        Self {
            destination: destination.to_string(),
            ..Self::default()
        }
    }

    pub(crate) fn record_error(&mut self, error: String) {
        if self.errors.len() < Self::MAX_ERRORS {
            self.errors.push(error);
        }
    }

    /// Holds a complete copy of this run
    pub fn success(&self) -> bool {
        self.blocks_failed == 0 && self.documents_stored
    }
}

/// Outcome of one job run. Always returned, never an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupResult {
    /// Job that ran
    pub job_id: String,
    /// Also the name of the snapshot and manifest
    pub backup_id: String,
    /// False only for top-level failures
    pub success: bool,
    /// Run start
    pub started_at: DateTime<Utc>,
    /// Run end
    pub finished_at: DateTime<Utc>,
    /// Files read and stored in this run
    pub total_files: u64,
    /// Source bytes of those files
    pub total_size: u64,
    /// Stored payload bytes of newly written blocks
    pub compressed_size: u64,
    /// `compressed_size / total_size`; 1.0 when nothing was read
    pub compression_ratio: f64,
    /// Present when the job deduplicates
    pub deduplication_stats: Option<DeduplicationStats>,
    /// Comparison with the previous snapshot
    pub change_set: ChangeSummary,
    /// One report per job destination, in job order
    pub replication: Vec<DestinationReport>,
    /// Present when verification ran
    pub verification: Option<VerificationResult>,
    /// Files skipped because they could not be read or stored
    pub files_failed: u64,
    /// Per-file and per-destination problems
    pub errors: Vec<String>,
    /// Top-level failure
    pub error_message: Option<String>,
}

impl BackupResult {
    pub(crate) fn new(job_id: &str, backup_id: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            job_id: job_id.to_string(),
            backup_id: backup_id.to_string(),
            success: false,
            started_at,
            finished_at: started_at,
            total_files: 0,
            total_size: 0,
            compressed_size: 0,
            compression_ratio: 1.0,
            deduplication_stats: None,
            change_set: ChangeSummary::default(),
            replication: Vec::new(),
            verification: None,
            files_failed: 0,
            errors: Vec::new(),
            error_message: None,
        }
    }

    /// Destinations without a complete copy
    pub fn failed_destinations(&self) -> Vec<&str> {
        self.replication
            .iter()
            .filter(|r| !r.success())
            .map(|r| r.destination.as_str())
            .collect()
    }

    /// Wall-clock duration
    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> BackupJob {
        BackupJob::new(
            "nightly",
            "Nightly",
            vec![PathBuf::from("/data")],
            vec!["nas".into()],
        )
    }

    #[test]
    fn test_defaults_from_json() {
        let json = r#"{
            "job_id": "nightly",
            "name": "Nightly",
            "source_paths": ["/data"],
            "destinations": ["nas", "offsite"]
        }"#;
        let parsed: BackupJob = serde_json::from_str(json).unwrap();
        assert!(parsed.compression && parsed.encryption && parsed.deduplication);
        assert!(parsed.incremental && parsed.verify_integrity);
        assert_eq!(parsed.retention_days, 30);
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn test_validation_failures() {
        let mut j = job();
        j.destinations.clear();
        assert!(matches!(j.validate(), Err(BackupError::InvalidJobConfig(_))));

        let mut j = job();
        j.source_paths = vec![PathBuf::from("relative")];
        assert!(j.validate().is_err());

        let mut j = job();
        j.destinations = vec!["nas".into(), "nas".into()];
        assert!(j.validate().is_err());

        let mut j = job();
        j.job_id = "bad/id".into();
        assert!(j.validate().is_err());
    }

    #[test]
    fn test_destination_report_success() {
        let mut r = DestinationReport::new("nas");
        assert!(!r.success());
        r.documents_stored = true;
        assert!(r.success());
        r.blocks_failed = 1;
        assert!(!r.success());
        for i in 0..40 {
            r.record_error(format!("e{}", i));
        }
        assert_eq!(r.errors.len(), 16);
    }
}
