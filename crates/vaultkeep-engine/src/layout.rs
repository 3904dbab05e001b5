//! Artifact ids on destinations.

use vaultkeep_reduce::ChunkHash;

/// `blocks/<first 2 hex>/<64 hex>`
pub fn block_artifact_id(hash: &ChunkHash) -> String {
    let hex = hash.to_hex();
    format!("blocks/{}/{}", &hex[..2], hex)
}

/// `snapshots/<name>.json`
pub fn snapshot_artifact_id(name: &str) -> String {
    format!("snapshots/{}.json", name)
}

/// `manifests/<backup_id>.json`
pub fn manifest_artifact_id(backup_id: &str) -> String {
    format!("manifests/{}.json", backup_id)
}
