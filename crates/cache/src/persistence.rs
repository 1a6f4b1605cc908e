//! Durable storage for cache entries
//!
//! Each logical cache owns one directory. Every entry is serialized to
//! `<dir>/<escaped key>.blob`, written to a temporary file first and renamed
//! into place so readers never observe a half-written blob.
//!
//! ```text
//! <persistence dir>/Product_Cache/
//!   src1-rec1.blob
//!   src1-rec1_OptionArgument-thumbnail.blob
//!   src2-urn%3Auuid%3A42.blob
//! ```
//!
//! Failures never propagate out of the provider. The in-memory map stays
//! authoritative for the running process, so a failed write only costs
//! durability across restarts.

use crate::record::CachedRecord;
use crate::{Error, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// File extension of persisted entries
pub const BLOB_EXTENSION: &str = "blob";

/// Storage backend that keeps cache values across process restarts.
///
/// Implementations must tolerate concurrent calls for different keys. Calls
/// for the same key may race; the last writer wins.
pub trait PersistenceProvider<V = CachedRecord>: Send + Sync + std::fmt::Debug {
    /// Persist `value` under `key`, replacing any previous value
    fn store(&self, key: &str, value: &V);

    /// Remove the value for `key`; absent keys are a no-op
    fn delete(&self, key: &str);

    /// Keys currently present in durable storage
    fn load_all_keys(&self) -> HashSet<String>;

    /// Load the requested keys, skipping any that are missing or unreadable
    fn load_all(&self, keys: &[String]) -> HashMap<String, V>;

    /// Remove every persisted value
    fn clear(&self);
}

/// [`PersistenceProvider`] writing JSON blobs into a directory
pub struct FilePersistence<V = CachedRecord> {
    dir: PathBuf,
    tmp_seq: AtomicU64,
    _value: PhantomData<fn() -> V>,
}

impl<V> std::fmt::Debug for FilePersistence<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilePersistence")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl<V> FilePersistence<V> {
    /// Create a provider for the cache named `cache_name` under `root`
    #[must_use]
    pub fn new(root: impl AsRef<Path>, cache_name: &str) -> Self {
        Self::with_dir(root.as_ref().join(escape_key(cache_name)))
    }

    /// Create a provider that uses `dir` directly
    #[must_use]
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            tmp_seq: AtomicU64::new(0),
            _value: PhantomData,
        }
    }

    /// Directory holding the blobs
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the blob for `key`
    #[must_use]
    pub fn blob_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.{BLOB_EXTENSION}", escape_key(key)))
    }

    fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| Error::io(e, &self.dir, "create_dir_all"))?;

        // Unique per write so concurrent stores of one key never share a temp file
        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        let tmp_path = path.with_extension(format!(
            "{BLOB_EXTENSION}.{}.{seq}.tmp",
            std::process::id()
        ));

        let result = write_then_rename(&tmp_path, path, data);
        if result.is_err() {
            let _ = fs::remove_file(&tmp_path);
        }
        result
    }

    fn try_load_all_keys(&self) -> Result<HashSet<String>> {
        let mut keys = HashSet::new();
        if !self.dir.exists() {
            return Ok(keys);
        }

        for entry in fs::read_dir(&self.dir).map_err(|e| Error::io(e, &self.dir, "read_dir"))? {
            let entry = entry.map_err(|e| Error::io(e, &self.dir, "read_dir_entry"))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some(BLOB_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match unescape_key(stem) {
                Some(key) => {
                    keys.insert(key);
                }
                None => tracing::warn!(
                    path = %path.display(),
                    "Ignoring blob with an undecodable file name"
                ),
            }
        }

        Ok(keys)
    }

    fn try_clear(&self) -> Result<usize> {
        if !self.dir.exists() {
            return Ok(0);
        }
        let mut removed = 0usize;
        for entry in fs::read_dir(&self.dir).map_err(|e| Error::io(e, &self.dir, "read_dir"))? {
            let entry = entry.map_err(|e| Error::io(e, &self.dir, "read_dir_entry"))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            fs::remove_file(&path).map_err(|e| Error::io(e, &path, "remove_file"))?;
            removed += 1;
        }
        Ok(removed)
    }
}

impl<V> PersistenceProvider<V> for FilePersistence<V>
where
    V: Serialize + DeserializeOwned,
{
    fn store(&self, key: &str, value: &V) {
        let path = self.blob_path(key);
        let written = serde_json::to_vec(value)
            .map_err(|e| Error::serialization(format!("cache entry {key}: {e}")))
            .and_then(|data| self.write_atomic(&path, &data));
        match written {
            Ok(()) => tracing::trace!(key = %key, path = %path.display(), "Persisted cache entry"),
            Err(e) => tracing::warn!(key = %key, error = %e, "Failed to persist cache entry"),
        }
    }

    fn delete(&self, key: &str) {
        let path = self.blob_path(key);
        match fs::remove_file(&path) {
            Ok(()) => tracing::trace!(key = %key, "Deleted persisted cache entry"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                key = %key,
                path = %path.display(),
                error = %e,
                "Failed to delete persisted cache entry"
            ),
        }
    }

    fn load_all_keys(&self) -> HashSet<String> {
        self.try_load_all_keys().unwrap_or_else(|e| {
            tracing::warn!(dir = %self.dir.display(), error = %e, "Failed to list persisted keys");
            HashSet::new()
        })
    }

    fn load_all(&self, keys: &[String]) -> HashMap<String, V> {
        let mut loaded = HashMap::with_capacity(keys.len());
        for key in keys {
            let path = self.blob_path(key);
            let data = match fs::read(&path) {
                Ok(data) => data,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::debug!(key = %key, "No persisted entry for key");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Failed to read persisted entry");
                    continue;
                }
            };
            match serde_json::from_slice(&data) {
                Ok(value) => {
                    loaded.insert(key.clone(), value);
                }
                Err(e) => tracing::warn!(
                    key = %key,
                    path = %path.display(),
                    error = %e,
                    "Skipping corrupt persisted entry"
                ),
            }
        }
        loaded
    }

    fn clear(&self) {
        match self.try_clear() {
            Ok(removed) => tracing::debug!(dir = %self.dir.display(), removed, "Cleared persisted entries"),
            Err(e) => tracing::warn!(dir = %self.dir.display(), error = %e, "Failed to clear persisted entries"),
        }
    }
}

fn write_then_rename(tmp_path: &Path, path: &Path, data: &[u8]) -> Result<()> {
    let mut file = fs::File::create(tmp_path).map_err(|e| Error::io(e, tmp_path, "create"))?;
    file.write_all(data)
        .map_err(|e| Error::io(e, tmp_path, "write"))?;
    file.sync_all()
        .map_err(|e| Error::io(e, tmp_path, "sync"))?;
    drop(file);
    fs::rename(tmp_path, path).map_err(|e| Error::io(e, path, "rename"))
}

fn is_plain(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_')
}

/// Map a key to a file-name-safe string.
///
/// Bytes outside `[A-Za-z0-9_-]` become `%XX`. `.` is escaped too, so the
/// only dot in a blob file name is the one before the extension.
#[must_use]
pub fn escape_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for &b in key.as_bytes() {
        if is_plain(b) {
            out.push(char::from(b));
        } else {
            out.push('%');
            out.push_str(&hex::encode_upper([b]));
        }
    }
    out
}

/// Inverse of [`escape_key`]; `None` if `name` is not a valid escape
#[must_use]
pub fn unescape_key(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let pair = bytes.get(i + 1..i + 3)?;
                let decoded = hex::decode(pair).ok()?;
                out.extend_from_slice(&decoded);
                i += 3;
            }
            b if is_plain(b) => {
                out.push(b);
                i += 1;
            }
            _ => return None,
        }
    }
    String::from_utf8(out).ok()
}
