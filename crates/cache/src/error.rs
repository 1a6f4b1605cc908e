//! Error types for the resource cache

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

/// Error type for resource cache operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// A key, record or configuration value was empty or malformed
    #[error("Invalid argument: {message}")]
    #[diagnostic(code(resource_cache::invalid_argument))]
    InvalidArgument {
        /// Description of the rejected argument
        message: String,
    },

    /// No entry exists for the key
    #[error("Cache miss: {key}")]
    #[diagnostic(
        code(resource_cache::miss),
        help("The resource was never cached or has been evicted; fetch it again")
    )]
    CacheMiss {
        /// The key that was looked up
        key: String,
    },

    /// The entry exists but its product file is gone or no longer matches
    #[error("Stale cache entry {key}: {}", path.display())]
    #[diagnostic(
        code(resource_cache::stale),
        help("The entry has been purged; fetch the resource again")
    )]
    StaleEntry {
        /// The key of the purged entry
        key: String,
        /// Product file the entry pointed at
        path: Box<Path>,
    },

    /// I/O error while persisting or deleting cache state
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(
        code(resource_cache::io),
        help("Check file permissions and free space in the cache directory")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error, if available
        path: Option<Box<Path>>,
        /// Operation that failed (e.g., "write", "rename", "remove_file")
        operation: String,
    },

    /// Serialization error
    #[error("Serialization error: {message}")]
    #[diagnostic(code(resource_cache::serialization))]
    Serialization {
        /// Error message describing the serialization issue
        message: String,
    },

    /// Configuration or validation error
    #[error("Cache configuration error: {message}")]
    #[diagnostic(code(resource_cache::config))]
    Configuration {
        /// Error message describing the configuration issue
        message: String,
    },
}

impl Error {
    /// Create an invalid argument error
    #[must_use]
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: msg.into(),
        }
    }

    /// Create a cache miss error
    #[must_use]
    pub fn cache_miss(key: impl Into<String>) -> Self {
        Self::CacheMiss { key: key.into() }
    }

    /// Create a stale entry error
    #[must_use]
    pub fn stale_entry(key: impl Into<String>, path: impl AsRef<Path>) -> Self {
        Self::StaleEntry {
            key: key.into(),
            path: path.as_ref().into(),
        }
    }

    /// Create an I/O error with path context
    #[must_use]
    pub fn io(
        source: std::io::Error,
        path: impl AsRef<Path>,
        operation: impl Into<String>,
    ) -> Self {
        Self::Io {
            source,
            path: Some(path.as_ref().into()),
            operation: operation.into(),
        }
    }

    /// Create a serialization error
    #[must_use]
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create a configuration error
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// True for [`Error::CacheMiss`] and [`Error::StaleEntry`].
    ///
    /// Both mean "fetch the resource again"; callers should not branch on
    /// which one occurred.
    #[must_use]
    pub const fn is_miss(&self) -> bool {
        matches!(self, Self::CacheMiss { .. } | Self::StaleEntry { .. })
    }
}

/// Result type for resource cache operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_miss_and_stale_are_both_misses() {
        assert!(Error::cache_miss("src1-abc").is_miss());
        assert!(Error::stale_entry("src1-abc", "/tmp/gone").is_miss());
        assert!(!Error::invalid_argument("empty key").is_miss());
        assert!(!Error::configuration("bad").is_miss());
    }

    #[test]
    fn test_io_error_display_includes_path() {
        let err = Error::io(
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
            "/var/cache/x.blob",
            "write",
        );
        let msg = err.to_string();
        assert!(msg.contains("I/O write failed"));
        assert!(msg.contains("/var/cache/x.blob"));
    }

    #[test]
    fn test_stale_entry_display() {
        let err = Error::stale_entry("src1-abc123", "/data/product-cache/src1-abc123");
        assert!(err.to_string().contains("src1-abc123"));
        assert!(err.to_string().contains("/data/product-cache"));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Error>();
    }
}
