//! Cache configuration
//!
//! Field names follow the external configuration keys, so a TOML file reads:
//!
//! ```toml
//! productCacheDirectory = "data/product-cache"
//! cacheDirMaxSizeMegabytes = 10240
//! ```

use crate::store::DEFAULT_PAGE_SIZE;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default product directory, relative to the installation root
pub const DEFAULT_PRODUCT_CACHE_DIRECTORY: &str = "data/product-cache";

/// Default size ceiling in megabytes
pub const DEFAULT_MAX_SIZE_MEGABYTES: u64 = 10 * 1024;

/// Default logical cache name
pub const DEFAULT_CACHE_NAME: &str = "Product_Cache";

/// Environment variable overriding `productCacheDirectory`
pub const ENV_CACHE_DIR: &str = "RESOURCE_CACHE_DIR";

/// Environment variable overriding `cacheDirMaxSizeMegabytes`
pub const ENV_MAX_SIZE_MB: &str = "RESOURCE_CACHE_MAX_SIZE_MB";

const BYTES_PER_MEGABYTE: u64 = 1024 * 1024;

/// User-facing cache configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Directory that downloaded products are written into
    pub product_cache_directory: PathBuf,

    /// Size ceiling for the product directory; 0 disables eviction
    pub cache_dir_max_size_megabytes: u64,

    /// Logical cache name, used as the persistence subdirectory
    pub cache_name: String,

    /// Where entry metadata is persisted. Defaults to
    /// `<productCacheDirectory>/persistence`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persistence_directory: Option<PathBuf>,

    /// Records fetched per page while scanning for eviction candidates
    pub eviction_page_size: usize,

    /// Seconds after which a pending download mark counts as abandoned
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_ttl_secs: Option<u64>,

    /// Load every persisted entry at open instead of on first access
    pub eager_load: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            product_cache_directory: PathBuf::from(DEFAULT_PRODUCT_CACHE_DIRECTORY),
            cache_dir_max_size_megabytes: DEFAULT_MAX_SIZE_MEGABYTES,
            cache_name: DEFAULT_CACHE_NAME.to_string(),
            persistence_directory: None,
            eviction_page_size: DEFAULT_PAGE_SIZE,
            pending_ttl_secs: None,
            eager_load: false,
        }
    }
}

impl CacheConfig {
    /// Parse a TOML document
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] on syntax errors or unknown keys.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| Error::configuration(format!("Invalid cache configuration: {e}")))
    }

    /// Read and parse a TOML file
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be read, or
    /// [`Error::Configuration`] if it does not parse.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| Error::io(e, path, "read"))?;
        Self::from_toml_str(&content)
    }

    /// Apply overrides from the process environment
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if an override does not parse.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value.
    /// Blank values are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if an override does not parse.
    pub fn with_overrides_from<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_blank = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(dir) = non_blank(ENV_CACHE_DIR) {
            self.product_cache_directory = PathBuf::from(dir.trim());
        }
        if let Some(mb) = non_blank(ENV_MAX_SIZE_MB) {
            self.cache_dir_max_size_megabytes = mb.trim().parse().map_err(|e| {
                Error::configuration(format!("{ENV_MAX_SIZE_MB}={mb} is not a size in megabytes: {e}"))
            })?;
        }
        Ok(self)
    }

    /// Resolve relative directories against `install_root` and validate
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for an empty cache name or a zero
    /// page size.
    pub fn resolve(&self, install_root: impl AsRef<Path>) -> Result<ResolvedConfig> {
        let install_root = install_root.as_ref();
        if self.cache_name.trim().is_empty() {
            return Err(Error::configuration("cacheName must not be empty"));
        }
        if self.eviction_page_size == 0 {
            return Err(Error::configuration("evictionPageSize must be at least 1"));
        }

        let product_cache_directory = absolutize(install_root, &self.product_cache_directory);
        let persistence_directory = self.persistence_directory.as_ref().map_or_else(
            || product_cache_directory.join("persistence"),
            |dir| absolutize(install_root, dir),
        );

        Ok(ResolvedConfig {
            product_cache_directory,
            persistence_directory,
            cache_name: self.cache_name.clone(),
            max_bytes: megabytes_to_bytes(self.cache_dir_max_size_megabytes),
            eviction_page_size: self.eviction_page_size,
            pending_ttl: self.pending_ttl_secs.map(Duration::from_secs),
            eager_load: self.eager_load,
        })
    }
}

/// Validated configuration with absolute directories and byte limits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConfig {
    /// Directory that downloaded products are written into
    pub product_cache_directory: PathBuf,
    /// Root of the persistence directories
    pub persistence_directory: PathBuf,
    /// Logical cache name
    pub cache_name: String,
    /// Ceiling in bytes; 0 disables eviction
    pub max_bytes: u64,
    /// Eviction scan page size
    pub eviction_page_size: usize,
    /// Pending-mark expiry
    pub pending_ttl: Option<Duration>,
    /// Load all persisted entries at open
    pub eager_load: bool,
}

impl ResolvedConfig {
    /// Resolved defaults rooted at `install_root`
    #[must_use]
    pub fn with_install_root(install_root: impl AsRef<Path>) -> Self {
        let install_root = install_root.as_ref();
        let product_cache_directory = install_root.join(DEFAULT_PRODUCT_CACHE_DIRECTORY);
        Self {
            persistence_directory: product_cache_directory.join("persistence"),
            product_cache_directory,
            cache_name: DEFAULT_CACHE_NAME.to_string(),
            max_bytes: megabytes_to_bytes(DEFAULT_MAX_SIZE_MEGABYTES),
            eviction_page_size: DEFAULT_PAGE_SIZE,
            pending_ttl: None,
            eager_load: false,
        }
    }
}

/// Convert a megabyte count to bytes, saturating on overflow
#[must_use]
pub const fn megabytes_to_bytes(megabytes: u64) -> u64 {
    megabytes.saturating_mul(BYTES_PER_MEGABYTE)
}

fn absolutize(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}
