//! Size-bounded, disk-backed cache for downloaded catalog resources
//!
//! This crate keeps track of products fetched from remote sources:
//! - Deterministic cache keys derived from a catalog record and its request
//! - A concurrent record map with add/remove notifications
//! - Least-recently-touched eviction under a byte ceiling
//! - File persistence so entries survive restarts
//! - Pending-download tracking to avoid duplicate fetches
//!
//! # Overview
//!
//! [`ResourceCache`] is the entry point. A downloader marks a key pending,
//! writes the product to [`ResourceCache::product_path`], then calls
//! [`ResourceCache::put`]. Readers call [`ResourceCache::get`], which fails
//! with [`Error::CacheMiss`] or [`Error::StaleEntry`] when the product has to
//! be fetched again.
//!
//! ```no_run
//! use resource_cache::{CacheConfig, CacheKey, CachedRecord, ResourceCache};
//!
//! # fn main() -> resource_cache::Result<()> {
//! let config = CacheConfig::default().with_env_overrides()?.resolve("/opt/catalog")?;
//! let cache = ResourceCache::open(&config)?;
//!
//! let key = CacheKey::new("src1", "rec1")?.to_string();
//! if !cache.contains(&key) && cache.add_pending_cache_entry(&key) {
//!     let path = cache.product_path(&key);
//!     std::fs::write(&path, b"...").expect("download");
//!     cache.put(CachedRecord::from_file(&key, path)?)?;
//! }
//! let record = cache.get(&key)?;
//! # let _ = record;
//! # Ok(())
//! # }
//! ```

mod cache;
pub mod config;
mod error;
pub mod eviction;
pub mod key;
pub mod pending;
pub mod persistence;
pub mod record;
pub mod store;

// Re-export error types at crate root
pub use error::{Error, Result};

// Re-export main types
pub use cache::{CacheStats, ExpectedProduct, ResourceCache};
pub use config::{CacheConfig, ResolvedConfig};
pub use eviction::{EvictionListener, EvictionReport, EvictionState};
pub use key::{CacheKey, OPTION_ARGUMENT, generate_key};
pub use pending::PendingSet;
pub use persistence::{FilePersistence, PersistenceProvider, escape_key, unescape_key};
pub use record::CachedRecord;
pub use store::{CacheListener, CacheStore, TryRemove, Values};
