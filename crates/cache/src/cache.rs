//! The resource cache facade
//!
//! [`ResourceCache`] wires a [`CacheStore`], its [`EvictionListener`] and a
//! [`PendingSet`] together. Downloaders mark a key pending before fetching,
//! write the product to [`ResourceCache::product_path`] and hand the finished
//! record to [`ResourceCache::put`]. Readers call [`ResourceCache::get`] and
//! treat both `CacheMiss` and `StaleEntry` as "fetch again".

use crate::config::{ResolvedConfig, megabytes_to_bytes};
use crate::eviction::{EvictionListener, EvictionReport};
use crate::pending::PendingSet;
use crate::persistence::{FilePersistence, PersistenceProvider, escape_key};
use crate::record::CachedRecord;
use crate::store::CacheStore;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// What a caller expects a cached product to look like
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpectedProduct {
    /// Expected byte length
    pub size_bytes: Option<u64>,
    /// Expected lowercase hex SHA-256 of the product bytes
    pub sha256: Option<String>,
}

/// Point-in-time view of cache occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Entries loaded in memory
    pub entries: usize,
    /// Bytes accounted by the eviction counter
    pub total_bytes: u64,
    /// Ceiling in bytes; 0 means unbounded
    pub max_bytes: u64,
    /// Keys currently marked pending
    pub pending: usize,
    /// Entries evicted since open
    pub evictions: u64,
}

/// Size-bounded, disk-backed cache of downloaded products
#[derive(Debug)]
pub struct ResourceCache {
    product_dir: PathBuf,
    store: CacheStore,
    eviction: Arc<EvictionListener>,
    pending: PendingSet,
}

impl ResourceCache {
    /// Open the cache described by `config`, persisting entry metadata as
    /// files under its persistence directory
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the product directory cannot be created.
    pub fn open(config: &ResolvedConfig) -> Result<Self> {
        let persistence: Arc<dyn PersistenceProvider> = Arc::new(
            FilePersistence::<CachedRecord>::new(&config.persistence_directory, &config.cache_name),
        );
        Self::with_persistence(config, persistence)
    }

    /// Open the cache with a caller-supplied persistence provider
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the product directory cannot be created.
    pub fn with_persistence(
        config: &ResolvedConfig,
        persistence: Arc<dyn PersistenceProvider>,
    ) -> Result<Self> {
        let product_dir = config.product_cache_directory.clone();
        fs::create_dir_all(&product_dir).map_err(|e| Error::io(e, &product_dir, "create_dir"))?;

        let store = CacheStore::open(config.cache_name.clone(), persistence);
        let eviction = Arc::new(EvictionListener::new(
            config.max_bytes,
            config.eviction_page_size,
        ));
        store.subscribe(eviction.clone());

        if config.eager_load {
            let loaded = store.hydrate_all();
            tracing::info!(
                cache = %config.cache_name,
                loaded,
                total_bytes = eviction.total_bytes(),
                "Loaded persisted cache entries"
            );
        }

        Ok(Self {
            product_dir,
            store,
            eviction,
            pending: PendingSet::with_ttl(config.pending_ttl),
        })
    }

    /// Whether a download for `key` is in flight
    #[must_use]
    pub fn is_pending(&self, key: &str) -> bool {
        self.pending.contains(key)
    }

    /// Mark `key` as being downloaded.
    ///
    /// Does nothing if the key is already pending or already cached. Returns
    /// whether a new mark was recorded.
    pub fn add_pending_cache_entry(&self, key: &str) -> bool {
        if self.contains(key) {
            tracing::warn!(key = %key, "Not marking cached key as pending");
            return false;
        }
        if !self.pending.insert(key) {
            tracing::warn!(key = %key, "Key is already pending");
            return false;
        }
        // A put may have landed between the check and the insert; its
        // clear_pending ran before our mark existed
        if self.contains(key) {
            self.pending.remove(key);
            tracing::debug!(key = %key, "Key was cached while marking; dropped pending mark");
            return false;
        }
        tracing::debug!(key = %key, "Marked key pending");
        true
    }

    /// Clear the pending mark for `key`. Returns whether a mark existed
    pub fn remove_pending_cache_entry(&self, key: &str) -> bool {
        let removed = self.clear_pending(key);
        if !removed {
            tracing::warn!(key = %key, "No pending mark to clear");
        }
        removed
    }

    fn clear_pending(&self, key: &str) -> bool {
        let removed = self.pending.remove(key);
        if removed {
            tracing::debug!(key = %key, "Cleared pending mark");
        }
        removed
    }

    /// Cache a downloaded product and clear its pending mark.
    ///
    /// The insert may trigger an eviction sweep on this thread.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the record has an empty key or
    /// file path.
    pub fn put(&self, record: CachedRecord) -> Result<()> {
        if record.key.trim().is_empty() {
            return Err(Error::invalid_argument("record key must not be empty"));
        }
        if record.file_path.as_os_str().is_empty() {
            return Err(Error::invalid_argument(format!(
                "record {} has no file path",
                record.key
            )));
        }

        let key = record.key.clone();
        self.store.put(&key, record);
        self.clear_pending(&key);
        Ok(())
    }

    /// Look up a cached product whose file still exists.
    ///
    /// Reads do not refresh the LRU position.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CacheMiss`] for an empty or unknown key, and
    /// [`Error::StaleEntry`] if the product file is gone. A stale entry is
    /// purged before returning.
    pub fn get(&self, key: &str) -> Result<CachedRecord> {
        if key.is_empty() {
            return Err(Error::cache_miss(key));
        }
        let record = self.store.get(key).ok_or_else(|| Error::cache_miss(key))?;

        if !record.file_exists() {
            tracing::warn!(
                key = %key,
                path = %record.file_path.display(),
                "Cached product file is missing; purging entry"
            );
            self.store.purge_if(key, |current| *current == record, false);
            return Err(Error::stale_entry(key, &record.file_path));
        }

        tracing::debug!(key = %key, size = record.size_bytes, "Cache hit");
        Ok(record)
    }

    /// Like [`Self::get`], and also check the product against `expected`
    /// and the recorded size.
    ///
    /// # Errors
    ///
    /// Everything [`Self::get`] returns, plus [`Error::StaleEntry`] on a size
    /// or checksum mismatch, after purging the entry and its product file.
    /// An I/O error is returned if the product cannot be read for hashing.
    pub fn get_valid(&self, key: &str, expected: &ExpectedProduct) -> Result<CachedRecord> {
        let record = self.get(key)?;
        let path = record.path();

        let on_disk = fs::metadata(path)
            .map_err(|e| Error::io(e, path, "metadata"))?
            .len();
        let size_ok = on_disk == record.size_bytes
            && expected.size_bytes.is_none_or(|size| size == on_disk);

        let checksum_ok = match &expected.sha256 {
            Some(want) if size_ok => sha256_file(path)?.eq_ignore_ascii_case(want.trim()),
            _ => true,
        };

        if size_ok && checksum_ok {
            return Ok(record);
        }

        tracing::warn!(
            key = %key,
            recorded_size = record.size_bytes,
            on_disk_size = on_disk,
            size_ok,
            checksum_ok,
            "Cached product does not match expectation; purging entry"
        );
        self.store.purge_if(key, |current| *current == record, true);
        Err(Error::stale_entry(key, path))
    }

    /// Whether the store holds an entry for `key`, stale or not
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        !key.is_empty() && self.store.contains(key)
    }

    /// Remove `key` together with its persisted metadata and product file.
    /// Returns false if there was no entry.
    pub fn remove(&self, key: &str) -> bool {
        !key.is_empty() && self.store.purge_if(key, |_| true, true).is_some()
    }

    /// Change the size ceiling. Lowering it below current usage evicts
    /// right away.
    pub fn set_max_size_megabytes(&self, megabytes: u64) -> Option<EvictionReport> {
        self.eviction
            .set_max_bytes(&self.store, megabytes_to_bytes(megabytes))
    }

    /// Current occupancy
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.store.len(),
            total_bytes: self.eviction.total_bytes(),
            max_bytes: self.eviction.max_bytes(),
            pending: self.pending.len(),
            evictions: self.eviction.evictions(),
        }
    }

    /// Drop every entry, its persisted metadata and product file, and all
    /// pending marks
    pub fn clear(&self) {
        let removed = self.store.clear();
        for record in &removed {
            record.delete_product_file();
        }
        self.pending.clear();
        tracing::info!(cache = %self.store.name(), removed = removed.len(), "Cache cleared");
    }

    /// Where the product for `key` should be written
    #[must_use]
    pub fn product_path(&self, key: &str) -> PathBuf {
        self.product_dir.join(escape_key(key))
    }

    /// Directory holding product files
    #[must_use]
    pub fn product_dir(&self) -> &Path {
        &self.product_dir
    }

    /// Underlying store
    #[must_use]
    pub const fn store(&self) -> &CacheStore {
        &self.store
    }

    /// Eviction listener enforcing the size ceiling
    #[must_use]
    pub fn eviction(&self) -> &EvictionListener {
        &self.eviction
    }
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| Error::io(e, path, "open"))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).map_err(|e| Error::io(e, path, "read"))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
