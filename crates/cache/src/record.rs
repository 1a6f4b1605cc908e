//! Cached record metadata

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

/// One cached artifact: where its bytes live and how large they are.
///
/// A record is only valid while `file_path` names an existing file. Records
/// whose file has been removed externally are stale and get purged on the
/// next read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedRecord {
    /// Stable identity, see [`crate::key`]
    pub key: String,
    /// Absolute path to the product bytes
    pub file_path: PathBuf,
    /// Byte length of the product when it was cached
    pub size_bytes: u64,
    /// Milliseconds since the epoch of the last insert; the LRU ordering key
    #[serde(default)]
    pub last_touched_millis: i64,
}

impl CachedRecord {
    /// Create a record for a product that was written to `file_path`
    #[must_use]
    pub fn new(key: impl Into<String>, file_path: impl Into<PathBuf>, size_bytes: u64) -> Self {
        Self {
            key: key.into(),
            file_path: file_path.into(),
            size_bytes,
            last_touched_millis: 0,
        }
    }

    /// Create a record sized from the file currently at `file_path`
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file metadata cannot be read.
    pub fn from_file(key: impl Into<String>, file_path: impl Into<PathBuf>) -> Result<Self> {
        let file_path = file_path.into();
        let size_bytes = fs::metadata(&file_path)
            .map_err(|e| Error::io(e, &file_path, "metadata"))?
            .len();
        Ok(Self::new(key, file_path, size_bytes))
    }

    /// Set `last_touched_millis` to the current time
    pub fn touch(&mut self) {
        self.last_touched_millis = now_millis();
    }

    /// Whether the product file still exists as a regular file
    #[must_use]
    pub fn file_exists(&self) -> bool {
        self.file_path.is_file()
    }

    /// Path of the product file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.file_path
    }

    /// Delete the product bytes. A missing file is fine; other failures
    /// leave an orphan file behind and are only logged.
    pub(crate) fn delete_product_file(&self) {
        match fs::remove_file(&self.file_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                key = %self.key,
                path = %self.file_path.display(),
                error = %e,
                "Failed to delete product file"
            ),
        }
    }
}

static LAST_MILLIS: AtomicI64 = AtomicI64::new(0);

/// Current wall-clock time in milliseconds, never lower than a previous call
pub(crate) fn now_millis() -> i64 {
    let now = chrono::Utc::now().timestamp_millis();
    let prev = LAST_MILLIS.fetch_max(now, Ordering::AcqRel);
    prev.max(now)
}
