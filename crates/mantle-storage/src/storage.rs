// SPDX-License-Identifier: MIT OR Apache-2.0
//! Byte storage boundary.
//!
//! The contract covers both object stores and the local filesystem; the
//! shipped backend is the local one. Keys are content-prefixed:
//! `<sha256-hex>_<sanitized filename>` under a per-workspace folder.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;

/// Result of storing a byte payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObject {
    /// Key for later reads and deletes.
    pub storage_key: String,
    /// Hex SHA-256 of the payload.
    pub sha256: String,
    /// Payload size in bytes.
    pub size: usize,
    /// Bucket the object landed in.
    pub bucket: String,
    /// Local path, when the backend is filesystem-based.
    #[serde(default)]
    pub path: Option<String>,
}

/// Storage backend contract.
pub trait Storage: Send + Sync {
    /// Store bytes under a content-derived key.
    ///
    /// # Errors
    ///
    /// Backend IO failures.
    fn store_bytes(
        &self,
        workspace: &str,
        filename: &str,
        data: &[u8],
        mime_type: Option<&str>,
        bucket: Option<&str>,
    ) -> anyhow::Result<StoredObject>;

    /// Read bytes back by key.
    ///
    /// # Errors
    ///
    /// Backend IO failures, including missing keys.
    fn read_bytes(&self, workspace: &str, storage_key: &str, bucket: Option<&str>)
    -> anyhow::Result<Vec<u8>>;

    /// Delete by key. Missing keys are fine during cleanup; returns
    /// whether the delete is effective.
    fn delete_storage(&self, workspace: &str, storage_key: &str, bucket: Option<&str>) -> bool;
}

/// Default bucket name.
pub const ATTACHMENTS_BUCKET: &str = "attachments";

fn sanitize_filename(filename: &str) -> String {
    filename.replace("..", "_").replace('/', "_")
}

/// Local-filesystem storage rooted at a directory.
#[derive(Debug)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    /// Create a backend rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, workspace: &str, storage_key: &str) -> PathBuf {
        self.root.join(workspace).join(storage_key)
    }
}

impl Storage for LocalStorage {
    fn store_bytes(
        &self,
        workspace: &str,
        filename: &str,
        data: &[u8],
        _mime_type: Option<&str>,
        bucket: Option<&str>,
    ) -> anyhow::Result<StoredObject> {
        let digest = {
            let mut hasher = Sha256::new();
            hasher.update(data);
            format!("{:x}", hasher.finalize())
        };
        let storage_key = format!("{digest}_{}", sanitize_filename(filename));
        let path = self.object_path(workspace, &storage_key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create storage dir {}", parent.display()))?;
        }
        std::fs::write(&path, data)
            .with_context(|| format!("write object to {}", path.display()))?;
        Ok(StoredObject {
            storage_key,
            sha256: digest,
            size: data.len(),
            bucket: bucket.unwrap_or(ATTACHMENTS_BUCKET).to_string(),
            path: Some(path.display().to_string()),
        })
    }

    fn read_bytes(
        &self,
        workspace: &str,
        storage_key: &str,
        _bucket: Option<&str>,
    ) -> anyhow::Result<Vec<u8>> {
        let path = self.object_path(workspace, storage_key);
        std::fs::read(&path).with_context(|| format!("read object from {}", path.display()))
    }

    fn delete_storage(&self, workspace: &str, storage_key: &str, _bucket: Option<&str>) -> bool {
        let path = self.object_path(workspace, storage_key);
        match std::fs::remove_file(&path) {
            Ok(()) => true,
            Err(err) => err.kind() == std::io::ErrorKind::NotFound,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_read_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        let stored = storage
            .store_bytes("w1", "report.pdf", b"hello", Some("application/pdf"), None)
            .unwrap();
        assert_eq!(stored.size, 5);
        assert!(stored.storage_key.ends_with("_report.pdf"));
        assert_eq!(stored.bucket, ATTACHMENTS_BUCKET);

        let bytes = storage.read_bytes("w1", &stored.storage_key, None).unwrap();
        assert_eq!(bytes, b"hello");

        assert!(storage.delete_storage("w1", &stored.storage_key, None));
        assert!(storage.read_bytes("w1", &stored.storage_key, None).is_err());
        // Deleting again is fine during cleanup.
        assert!(storage.delete_storage("w1", &stored.storage_key, None));
    }

    #[test]
    fn filenames_are_sanitized() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        let stored = storage
            .store_bytes("w1", "../../etc/passwd", b"x", None, None)
            .unwrap();
        assert!(!stored.storage_key.contains(".."));
        assert!(!stored.storage_key.contains('/'));
    }
}
