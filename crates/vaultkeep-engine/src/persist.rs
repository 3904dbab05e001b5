//! Versioned JSON documents on disk.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{BackupError, BackupResultT};

/// Version written into every persisted document
pub const FORMAT_VERSION: u32 = 1;

const MAX_NAME_LEN: usize = 200;

/// Snapshot names and backup ids become file names: ASCII alphanumerics plus
/// `-`, `_` and `.`, not starting with `.`.
pub fn validate_name(name: &str) -> BackupResultT<()> {
    let ok = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(BackupError::InvalidName(name.to_string()))
    }
}

pub(crate) fn encode_document<T: Serialize>(doc: &T) -> BackupResultT<Vec<u8>> {
    Ok(serde_json::to_vec_pretty(doc)?)
}

/// Parse a document, rejecting any `format_version` other than [`FORMAT_VERSION`].
pub(crate) fn decode_document<T: DeserializeOwned>(path: &Path, bytes: &[u8]) -> BackupResultT<T> {
    let value: serde_json::Value = serde_json::from_slice(bytes)?;
    let found = value
        .get("format_version")
        .and_then(|v| v.as_u64())
        .unwrap_or(0) as u32;
    if found != FORMAT_VERSION {
        return Err(BackupError::UnsupportedFormat {
            path: path.to_path_buf(),
            found,
            supported: FORMAT_VERSION,
        });
    }
    Ok(serde_json::from_value(value)?)
}

pub(crate) fn write_document<T: Serialize>(path: &Path, doc: &T) -> BackupResultT<()> {
    let bytes = encode_document(doc)?;
    vaultkeep_storage::write_file_atomic(path, &bytes)?;
    Ok(())
}

/// `Ok(None)` when the file does not exist.
pub(crate) fn read_document<T: DeserializeOwned>(path: &Path) -> BackupResultT<Option<T>> {
    match std::fs::read(path) {
        Ok(bytes) => decode_document(path, &bytes).map(Some),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Stems of the `*.json` files in `dir`, sorted. A missing directory is empty.
pub(crate) fn list_documents(dir: &Path) -> BackupResultT<Vec<String>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut names = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            names.push(stem.to_string());
        }
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Doc {
        format_version: u32,
        body: String,
    }

    #[test]
    fn test_name_validation() {
        for ok in ["nightly", "job-1.2024-01-01T00", "a_b"] {
            assert!(validate_name(ok).is_ok(), "{}", ok);
        }
        for bad in ["", ".hidden", "a/b", "..", "a b", "x\\y"] {
            assert!(validate_name(bad).is_err(), "{:?}", bad);
        }
        assert!(validate_name(&"x".repeat(201)).is_err());
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docs/one.json");
        let doc = Doc {
            format_version: FORMAT_VERSION,
            body: "hello".into(),
        };
        write_document(&path, &doc).unwrap();
        let back: Option<Doc> = read_document(&path).unwrap();
        assert_eq!(back, Some(doc));
        assert_eq!(list_documents(&dir.path().join("docs")).unwrap(), vec!["one"]);
        let missing: Option<Doc> = read_document(&dir.path().join("nope.json")).unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_future_version_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("future.json");
        std::fs::write(&path, br#"{"format_version": 7, "body": "x"}"#).unwrap();
        let err = read_document::<Doc>(&path).unwrap_err();
        assert!(matches!(
            err,
            BackupError::UnsupportedFormat { found: 7, supported: 1, .. }
        ));
    }

    #[test]
    fn test_list_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(list_documents(&dir.path().join("absent")).unwrap().is_empty());
    }
}
