//! Size-bounded LRU eviction
//!
//! [`EvictionListener`] keeps a running total of the bytes referenced by the
//! store and, whenever an insert pushes that total above the ceiling, removes
//! least-recently-touched entries until it fits again. The sweep runs on the
//! thread whose insert triggered it.
//!
//! Removals made by the sweep are marked before the store reports them, so
//! the generic "removed" notification does not subtract the same bytes a
//! second time.

use crate::record::CachedRecord;
use crate::store::{CacheListener, CacheStore, TryRemove};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Phase of the listener, for observability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionState {
    /// Nothing in progress
    Idle,
    /// Applying an add or remove to the counter
    Counting,
    /// At least one eviction sweep is running
    Evicting,
}

/// Summary of one eviction sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EvictionReport {
    /// Entries removed by the sweep
    pub evicted: usize,
    /// Bytes subtracted from the counter
    pub bytes_freed: u64,
    /// Counter value when the sweep stopped
    pub remaining_bytes: u64,
}

/// Store listener that enforces the byte ceiling
#[derive(Debug)]
pub struct EvictionListener {
    max_bytes: AtomicU64,
    total_bytes: AtomicU64,
    page_size: usize,
    manually_evicted: Mutex<HashSet<String>>,
    evictions: AtomicU64,
    counting: AtomicUsize,
    sweeps: AtomicUsize,
}

/// Decrements an in-progress gauge when dropped
struct Gauge<'a>(&'a AtomicUsize);

impl<'a> Gauge<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for Gauge<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl EvictionListener {
    /// Create a listener with a ceiling of `max_bytes` (0 disables eviction)
    /// that scans candidates `page_size` records at a time
    #[must_use]
    pub fn new(max_bytes: u64, page_size: usize) -> Self {
        Self {
            max_bytes: AtomicU64::new(max_bytes),
            total_bytes: AtomicU64::new(0),
            page_size: page_size.max(1),
            manually_evicted: Mutex::new(HashSet::new()),
            evictions: AtomicU64::new(0),
            counting: AtomicUsize::new(0),
            sweeps: AtomicUsize::new(0),
        }
    }

    /// Bytes currently accounted to cached entries
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Acquire)
    }

    /// Configured ceiling in bytes; 0 means unbounded
    #[must_use]
    pub fn max_bytes(&self) -> u64 {
        self.max_bytes.load(Ordering::Acquire)
    }

    /// Entries evicted since the listener was created
    #[must_use]
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Current phase
    #[must_use]
    pub fn state(&self) -> EvictionState {
        if self.sweeps.load(Ordering::Acquire) > 0 {
            EvictionState::Evicting
        } else if self.counting.load(Ordering::Acquire) > 0 {
            EvictionState::Counting
        } else {
            EvictionState::Idle
        }
    }

    fn over_ceiling(&self) -> bool {
        let max = self.max_bytes();
        max > 0 && self.total_bytes() > max
    }

    fn add_bytes(&self, bytes: u64) {
        self.total_bytes.fetch_add(bytes, Ordering::AcqRel);
    }

    fn sub_bytes(&self, bytes: u64) {
        // Saturate rather than wrap if accounting ever drifts below zero
        let _ = self
            .total_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(bytes))
            });
    }

    /// Change the ceiling. Lowering it below the current total runs a sweep
    /// right away.
    pub fn set_max_bytes(&self, store: &CacheStore, max_bytes: u64) -> Option<EvictionReport> {
        self.max_bytes.store(max_bytes, Ordering::Release);
        tracing::info!(cache = %store.name(), max_bytes, "Cache size ceiling changed");
        self.over_ceiling().then(|| self.evict(store, None))
    }

    /// Evict least-recently-touched entries until the total fits under the
    /// ceiling or no candidates remain. `protect` is never evicted.
    pub fn evict(&self, store: &CacheStore, protect: Option<&str>) -> EvictionReport {
        let _sweep = Gauge::enter(&self.sweeps);
        let mut report = EvictionReport::default();

        for candidate in store.values(self.page_size) {
            if !self.over_ceiling() {
                break;
            }
            if protect == Some(candidate.key.as_str()) {
                continue;
            }

            let outcome = store.try_remove_with(&candidate.key, |_| {
                self.manually_evicted.lock().insert(candidate.key.clone());
            });
            let TryRemove::Removed(record) = outcome else {
                // Gone already, or being rewritten by another thread
                continue;
            };

            store.persistence().delete(&record.key);
            record.delete_product_file();
            self.sub_bytes(record.size_bytes);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            report.evicted += 1;
            report.bytes_freed += record.size_bytes;
            tracing::debug!(
                cache = %store.name(),
                key = %record.key,
                size = record.size_bytes,
                "Evicted least recently touched entry"
            );
        }

        report.remaining_bytes = self.total_bytes();
        if self.over_ceiling() {
            tracing::warn!(
                cache = %store.name(),
                total_bytes = report.remaining_bytes,
                max_bytes = self.max_bytes(),
                "Eviction ran out of candidates above the size ceiling"
            );
        } else if report.evicted > 0 {
            tracing::info!(
                cache = %store.name(),
                evicted = report.evicted,
                bytes_freed = report.bytes_freed,
                total_bytes = report.remaining_bytes,
                "Eviction pass complete"
            );
        }
        report
    }
}

impl CacheListener for EvictionListener {
    fn entry_added(
        &self,
        store: &CacheStore,
        key: &str,
        record: &CachedRecord,
        replaced: Option<&CachedRecord>,
    ) {
        {
            let _counting = Gauge::enter(&self.counting);
            self.add_bytes(record.size_bytes);
            if let Some(previous) = replaced {
                self.sub_bytes(previous.size_bytes);
            }
        }

        if self.over_ceiling() {
            self.evict(store, Some(key));
        }
    }

    fn entry_removed(&self, _store: &CacheStore, key: &str, record: &CachedRecord) {
        if self.manually_evicted.lock().remove(key) {
            return;
        }
        let _counting = Gauge::enter(&self.counting);
        self.sub_bytes(record.size_bytes);
    }
}
