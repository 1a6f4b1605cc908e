//! Concurrent key → record map with lifecycle notifications
//!
//! [`CacheStore`] is the authoritative in-process view of the cache. Every
//! insert and removal is announced to registered [`CacheListener`]s on the
//! calling thread. Mutations of one key, together with their notifications,
//! run under that key's lock stripe, so listeners observe the add/remove
//! history of a key in order. Different keys proceed in parallel.
//!
//! Entries are also ordered by `(last_touched_millis, insertion sequence)`,
//! which is what [`CacheStore::values`] walks for least-recently-touched
//! candidates.
//!
//! On open only the persisted key set is read. Values are pulled from the
//! [`PersistenceProvider`] the first time a key is asked for.

use crate::persistence::PersistenceProvider;
use crate::record::CachedRecord;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::ops::Bound;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

const LOCK_STRIPES: usize = 64;

/// Default number of records fetched per page by [`CacheStore::values`]
pub const DEFAULT_PAGE_SIZE: usize = 10;

/// Position of an entry in least-recently-touched order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OrderKey {
    last_touched_millis: i64,
    seq: u64,
}

/// Observer of store lifecycle events.
///
/// Callbacks run on the thread that mutated the store while it still holds
/// the key's lock stripe. A listener may remove *other* entries only through
/// [`CacheStore::try_remove_with`], which never blocks on a stripe.
pub trait CacheListener: Send + Sync {
    /// An entry was inserted. `replaced` is the previous record for the key
    fn entry_added(
        &self,
        store: &CacheStore,
        key: &str,
        record: &CachedRecord,
        replaced: Option<&CachedRecord>,
    );

    /// An entry was removed, by eviction or by an explicit call
    fn entry_removed(&self, store: &CacheStore, key: &str, record: &CachedRecord);
}

/// Outcome of [`CacheStore::try_remove_with`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TryRemove {
    /// The entry was removed and listeners were notified
    Removed(CachedRecord),
    /// No entry for the key
    Absent,
    /// Another thread is mutating the key right now
    Busy,
}

#[derive(Debug)]
struct Slot {
    record: CachedRecord,
    position: OrderKey,
}

#[derive(Debug, Default)]
struct StoreState {
    entries: HashMap<String, Slot>,
    order: BTreeMap<OrderKey, String>,
}

impl StoreState {
    fn insert(&mut self, key: &str, record: CachedRecord, position: OrderKey) -> Option<CachedRecord> {
        self.order.insert(position, key.to_string());
        let previous = self
            .entries
            .insert(key.to_string(), Slot { record, position })?;
        self.order.remove(&previous.position);
        Some(previous.record)
    }

    fn remove(&mut self, key: &str) -> Option<CachedRecord> {
        let slot = self.entries.remove(key)?;
        self.order.remove(&slot.position);
        Some(slot.record)
    }
}

/// The authoritative concurrent map of cached records
pub struct CacheStore {
    name: String,
    state: RwLock<StoreState>,
    stripes: Box<[ReentrantMutex<()>]>,
    listeners: RwLock<Vec<Arc<dyn CacheListener>>>,
    persistence: Arc<dyn PersistenceProvider>,
    /// Keys present in persistence but not yet loaded into `state`
    unloaded: Mutex<HashSet<String>>,
    next_seq: AtomicU64,
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("name", &self.name)
            .field("entries", &self.len())
            .field("unloaded", &self.unloaded.lock().len())
            .field("persistence", &self.persistence)
            .finish_non_exhaustive()
    }
}

impl CacheStore {
    /// Open a store backed by `persistence`.
    ///
    /// Only the persisted key set is read here; values load on first access.
    #[must_use]
    pub fn open(name: impl Into<String>, persistence: Arc<dyn PersistenceProvider>) -> Self {
        let name = name.into();
        let unloaded = persistence.load_all_keys();
        if !unloaded.is_empty() {
            tracing::info!(cache = %name, keys = unloaded.len(), "Discovered persisted cache entries");
        }
        Self {
            name,
            state: RwLock::new(StoreState::default()),
            stripes: (0..LOCK_STRIPES).map(|_| ReentrantMutex::new(())).collect(),
            listeners: RwLock::new(Vec::new()),
            persistence,
            unloaded: Mutex::new(unloaded),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Name of the logical cache
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Persistence provider backing this store
    #[must_use]
    pub fn persistence(&self) -> &Arc<dyn PersistenceProvider> {
        &self.persistence
    }

    /// Register a listener for add/remove notifications
    pub fn subscribe(&self, listener: Arc<dyn CacheListener>) {
        self.listeners.write().push(listener);
    }

    fn stripe(&self, key: &str) -> &ReentrantMutex<()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = usize::try_from(hasher.finish() % LOCK_STRIPES as u64).unwrap_or(0);
        &self.stripes[index]
    }

    fn position(&self, last_touched_millis: i64) -> OrderKey {
        OrderKey {
            last_touched_millis,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        }
    }

    fn listeners(&self) -> Vec<Arc<dyn CacheListener>> {
        self.listeners.read().clone()
    }

    fn notify_added(&self, key: &str, record: &CachedRecord, replaced: Option<&CachedRecord>) {
        for listener in self.listeners() {
            listener.entry_added(self, key, record, replaced);
        }
    }

    fn notify_removed(&self, key: &str, record: &CachedRecord) {
        for listener in self.listeners() {
            listener.entry_removed(self, key, record);
        }
    }

    /// Insert or overwrite the record for `key`.
    ///
    /// The record's `last_touched_millis` is refreshed, it is written through
    /// to persistence, and listeners get an "added" notification before this
    /// returns. Returns the record that was replaced, if any.
    pub fn put(&self, key: &str, mut record: CachedRecord) -> Option<CachedRecord> {
        let _guard = self.stripe(key).lock();
        record.touch();
        if record.key != key {
            record.key = key.to_string();
        }

        // A fresh value supersedes anything still waiting on disk. That value
        // was never announced, so it is not reported as replaced either.
        self.unloaded.lock().remove(key);
        let position = self.position(record.last_touched_millis);
        let replaced = self.state.write().insert(key, record.clone(), position);

        self.persistence.store(key, &record);
        tracing::debug!(
            cache = %self.name,
            key = %key,
            size = record.size_bytes,
            replaced = replaced.is_some(),
            "Stored cache entry"
        );
        self.notify_added(key, &record, replaced.as_ref());
        replaced
    }

    /// Look up the record for `key`, loading it from persistence if needed
    #[must_use]
    pub fn get(&self, key: &str) -> Option<CachedRecord> {
        if let Some(slot) = self.state.read().entries.get(key) {
            return Some(slot.record.clone());
        }
        self.hydrate(key)
    }

    /// Whether the store holds an entry for `key`. File existence is not checked
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        let loaded = self.state.read().entries.contains_key(key);
        loaded || self.hydrate(key).is_some()
    }

    fn hydrate(&self, key: &str) -> Option<CachedRecord> {
        if !self.unloaded.lock().contains(key) {
            return None;
        }

        let _guard = self.stripe(key).lock();
        if let Some(slot) = self.state.read().entries.get(key) {
            return Some(slot.record.clone());
        }
        if !self.unloaded.lock().remove(key) {
            return None;
        }

        let mut loaded = self.persistence.load_all(&[key.to_string()]);
        let mut record = loaded.remove(key)?;
        record.key = key.to_string();
        // Keep the persisted timestamp so LRU order survives restarts
        let position = self.position(record.last_touched_millis);
        self.state.write().insert(key, record.clone(), position);

        tracing::debug!(cache = %self.name, key = %key, size = record.size_bytes, "Loaded persisted cache entry");
        self.notify_added(key, &record, None);
        Some(record)
    }

    /// Load every persisted entry that is not in memory yet.
    ///
    /// Returns the number of entries loaded.
    pub fn hydrate_all(&self) -> usize {
        let pending: Vec<String> = self.unloaded.lock().iter().cloned().collect();
        pending
            .iter()
            .filter(|key| self.hydrate(key).is_some())
            .count()
    }

    /// Remove the entry for `key` and notify listeners.
    ///
    /// A persisted entry that was not loaded yet is loaded first, so it is
    /// returned like any other. The product file and the persisted blob are
    /// left alone.
    pub fn remove(&self, key: &str) -> Option<CachedRecord> {
        self.remove_if(key, |_| true)
    }

    /// Remove the entry for `key` only if `predicate` accepts the current
    /// record. The check and the removal happen under the key's stripe, so a
    /// concurrent `put` cannot slip in between.
    pub fn remove_if<F>(&self, key: &str, predicate: F) -> Option<CachedRecord>
    where
        F: FnOnce(&CachedRecord) -> bool,
    {
        let _guard = self.stripe(key).lock();
        self.hydrate(key);
        let current = self.state.read().entries.get(key).map(|slot| slot.record.clone())?;
        if !predicate(&current) {
            return None;
        }
        let record = self.state.write().remove(key)?;
        tracing::debug!(cache = %self.name, key = %key, "Removed cache entry");
        self.notify_removed(key, &record);
        Some(record)
    }

    /// Like [`Self::remove_if`], and also delete the persisted blob and,
    /// when `delete_product` is set, the product file. All of it happens
    /// under the key's stripe, so a concurrent `put` of a fresh product for
    /// the same key is never touched.
    pub fn purge_if<F>(
        &self,
        key: &str,
        predicate: F,
        delete_product: bool,
    ) -> Option<CachedRecord>
    where
        F: FnOnce(&CachedRecord) -> bool,
    {
        let _guard = self.stripe(key).lock();
        let record = self.remove_if(key, predicate)?;
        self.persistence.delete(key);
        if delete_product {
            record.delete_product_file();
        }
        Some(record)
    }

    /// Remove the entry for `key` without waiting on another thread.
    ///
    /// `before_notify` runs after the entry left the map and before listeners
    /// are told, while the key's stripe is still held.
    pub fn try_remove_with<F>(&self, key: &str, before_notify: F) -> TryRemove
    where
        F: FnOnce(&CachedRecord),
    {
        let Some(_guard) = self.stripe(key).try_lock() else {
            return TryRemove::Busy;
        };
        let Some(record) = self.state.write().remove(key) else {
            return TryRemove::Absent;
        };
        before_notify(&record);
        self.notify_removed(key, &record);
        TryRemove::Removed(record)
    }

    /// Records in ascending `last_touched_millis` order, read `page_size` at
    /// a time. Entries inserted or removed while iterating may or may not
    /// be observed.
    #[must_use]
    pub fn values(&self, page_size: usize) -> Values<'_> {
        Values {
            store: self,
            page_size: page_size.max(1),
            cursor: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    fn page_after(&self, cursor: Option<OrderKey>, limit: usize) -> Vec<(OrderKey, CachedRecord)> {
        let state = self.state.read();
        let lower = cursor.map_or(Bound::Unbounded, Bound::Excluded);
        state
            .order
            .range((lower, Bound::Unbounded))
            .filter_map(|(position, key)| {
                state
                    .entries
                    .get(key)
                    .map(|slot| (*position, slot.record.clone()))
            })
            .take(limit)
            .collect()
    }

    /// Remove every entry, notifying listeners, and clear persistence.
    ///
    /// Returns the removed records so callers can delete product files.
    /// Persisted entries that were never loaded are included but produce no
    /// notification, since listeners never saw them added.
    pub fn clear(&self) -> Vec<CachedRecord> {
        let unloaded: Vec<String> = self.unloaded.lock().drain().collect();
        let keys: Vec<String> = self.state.read().entries.keys().cloned().collect();
        let mut removed: Vec<CachedRecord> =
            keys.iter().filter_map(|key| self.remove(key)).collect();
        removed.extend(self.persistence.load_all(&unloaded).into_values());
        self.persistence.clear();
        removed
    }

    /// Number of entries loaded in memory
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    /// Whether no entries are loaded in memory
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.read().entries.is_empty()
    }

    /// Number of persisted keys not yet loaded
    #[must_use]
    pub fn unloaded_len(&self) -> usize {
        self.unloaded.lock().len()
    }

    /// Sum of `size_bytes` over loaded entries, computed by a full scan
    #[must_use]
    pub fn resident_bytes(&self) -> u64 {
        self.state
            .read()
            .entries
            .values()
            .map(|slot| slot.record.size_bytes)
            .sum()
    }
}

/// Paged iterator returned by [`CacheStore::values`]
#[derive(Debug)]
pub struct Values<'a> {
    store: &'a CacheStore,
    page_size: usize,
    cursor: Option<OrderKey>,
    buffer: VecDeque<CachedRecord>,
    exhausted: bool,
}

impl Iterator for Values<'_> {
    type Item = CachedRecord;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            let page = self.store.page_after(self.cursor, self.page_size);
            if page.len() < self.page_size {
                self.exhausted = true;
            }
            if let Some((position, _)) = page.last() {
                self.cursor = Some(*position);
            }
            self.buffer.extend(page.into_iter().map(|(_, record)| record));
        }
        self.buffer.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::FilePersistence;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl CacheListener for Recorder {
        fn entry_added(
            &self,
            _store: &CacheStore,
            key: &str,
            record: &CachedRecord,
            replaced: Option<&CachedRecord>,
        ) {
            self.events.lock().push(format!(
                "added {key} {} replaced={}",
                record.size_bytes,
                replaced.map_or(0, |r| r.size_bytes)
            ));
        }

        fn entry_removed(&self, _store: &CacheStore, key: &str, _record: &CachedRecord) {
            self.events.lock().push(format!("removed {key}"));
        }
    }

    fn open(tmp: &TempDir) -> CacheStore {
        let persistence: Arc<dyn PersistenceProvider> =
            Arc::new(FilePersistence::<CachedRecord>::new(tmp.path(), "test"));
        CacheStore::open("test", persistence)
    }

    fn record(key: &str, size: u64) -> CachedRecord {
        CachedRecord::new(key, format!("/products/{key}"), size)
    }

    #[test]
    fn test_put_get_remove() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);

        assert!(store.put("a", record("a", 10)).is_none());
        let got = store.get("a").unwrap();
        assert_eq!(got.size_bytes, 10);
        assert!(got.last_touched_millis > 0);
        assert!(store.contains("a"));

        assert_eq!(store.remove("a").unwrap().key, "a");
        assert!(store.get("a").is_none());
        assert!(store.remove("a").is_none());
    }

    #[test]
    fn test_notifications_in_order() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        let recorder = Arc::new(Recorder::default());
        store.subscribe(recorder.clone());

        store.put("a", record("a", 10));
        store.put("a", record("a", 15));
        store.remove("a");

        assert_eq!(
            *recorder.events.lock(),
            vec![
                "added a 10 replaced=0".to_string(),
                "added a 15 replaced=10".to_string(),
                "removed a".to_string(),
            ]
        );
    }

    #[test]
    fn test_values_ascending_across_pages() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        for i in 0..25 {
            let key = format!("k{i:02}");
            store.put(&key, record(&key, 1));
        }

        let keys: Vec<String> = store.values(DEFAULT_PAGE_SIZE).map(|r| r.key).collect();
        let expected: Vec<String> = (0..25).map(|i| format!("k{i:02}")).collect();
        assert_eq!(keys, expected);
    }

    #[test]
    fn test_overwrite_moves_entry_to_back() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        store.put("a", record("a", 1));
        store.put("b", record("b", 1));
        store.put("a", record("a", 2));

        let keys: Vec<String> = store.values(1).map(|r| r.key).collect();
        assert_eq!(keys, vec!["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn test_values_tolerates_removal_during_iteration() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        for i in 0..12 {
            let key = format!("k{i:02}");
            store.put(&key, record(&key, 1));
        }

        let mut seen = Vec::new();
        for r in store.values(5) {
            store.remove(&r.key);
            seen.push(r.key);
        }
        assert_eq!(seen.len(), 12);
        assert!(store.is_empty());
    }

    #[test]
    fn test_lazy_hydration_after_reopen() {
        let tmp = TempDir::new().unwrap();
        let first_touch = {
            let store = open(&tmp);
            store.put("a", record("a", 7));
            store.put("b", record("b", 9));
            store.get("a").unwrap().last_touched_millis
        };

        let store = open(&tmp);
        let recorder = Arc::new(Recorder::default());
        store.subscribe(recorder.clone());
        assert_eq!(store.len(), 0);
        assert_eq!(store.unloaded_len(), 2);

        let a = store.get("a").unwrap();
        assert_eq!(a.size_bytes, 7);
        assert_eq!(a.last_touched_millis, first_touch);
        assert_eq!(store.len(), 1);
        assert_eq!(store.unloaded_len(), 1);
        assert_eq!(*recorder.events.lock(), vec!["added a 7 replaced=0".to_string()]);

        assert_eq!(store.hydrate_all(), 1);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_put_over_unloaded_supersedes_disk_value() {
        let tmp = TempDir::new().unwrap();
        {
            let store = open(&tmp);
            store.put("a", record("a", 7));
        }
        let store = open(&tmp);
        assert!(store.put("a", record("a", 3)).is_none());
        assert_eq!(store.unloaded_len(), 0);
        assert_eq!(store.get("a").unwrap().size_bytes, 3);
    }

    #[test]
    fn test_try_remove_with_runs_hook_before_notify() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        let recorder = Arc::new(Recorder::default());
        store.subscribe(recorder.clone());
        store.put("a", record("a", 1));

        let mut hook_saw_events = 0;
        let outcome = store.try_remove_with("a", |_| {
            hook_saw_events = recorder.events.lock().len();
        });
        assert!(matches!(outcome, TryRemove::Removed(_)));
        assert_eq!(hook_saw_events, 1);
        assert_eq!(store.try_remove_with("a", |_| {}), TryRemove::Absent);
    }

    #[test]
    fn test_try_remove_with_is_busy_when_other_thread_holds_key() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        store.put("a", record("a", 1));

        let guard = store.stripe("a").lock();
        std::thread::scope(|s| {
            let outcome = s.spawn(|| store.try_remove_with("a", |_| {})).join().unwrap();
            assert_eq!(outcome, TryRemove::Busy);
        });
        drop(guard);
        assert!(store.contains("a"));
    }

    #[test]
    fn test_clear_notifies_and_wipes_persistence() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        let recorder = Arc::new(Recorder::default());
        store.subscribe(recorder.clone());
        store.put("a", record("a", 1));
        store.put("b", record("b", 2));

        let removed = store.clear();
        assert_eq!(removed.len(), 2);
        assert!(store.is_empty());
        assert!(store.persistence().load_all_keys().is_empty());
        assert_eq!(
            recorder
                .events
                .lock()
                .iter()
                .filter(|e| e.starts_with("removed"))
                .count(),
            2
        );
    }

    #[test]
    fn test_remove_loads_unloaded_entry_first() {
        let tmp = TempDir::new().unwrap();
        {
            let store = open(&tmp);
            store.put("a", record("a", 7));
        }
        let store = open(&tmp);
        let recorder = Arc::new(Recorder::default());
        store.subscribe(recorder.clone());

        let removed = store.remove("a").unwrap();
        assert_eq!(removed.size_bytes, 7);
        assert_eq!(store.unloaded_len(), 0);
        assert_eq!(
            *recorder.events.lock(),
            vec!["added a 7 replaced=0".to_string(), "removed a".to_string()]
        );
    }

    #[test]
    fn test_remove_if_respects_predicate() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        store.put("a", record("a", 1));
        let seen = store.get("a").unwrap();
        store.put("a", record("a", 2));

        assert!(store.remove_if("a", |current| *current == seen).is_none());
        assert_eq!(store.get("a").unwrap().size_bytes, 2);

        let current = store.get("a").unwrap();
        assert!(store.remove_if("a", |r| *r == current).is_some());
        assert!(!store.contains("a"));
        assert!(store.remove_if("a", |_| true).is_none());
    }

    #[test]
    fn test_purge_if_deletes_blob_and_product() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        let product = tmp.path().join("a.bin");
        std::fs::write(&product, b"abc").unwrap();
        store.put("a", CachedRecord::new("a", &product, 3));

        assert!(store.purge_if("a", |r| r.size_bytes == 99, true).is_none());
        assert!(product.exists());
        assert!(store.persistence().load_all_keys().contains("a"));

        assert!(store.purge_if("a", |r| r.size_bytes == 3, true).is_some());
        assert!(!product.exists());
        assert!(store.persistence().load_all_keys().is_empty());
    }

    #[test]
    fn test_clear_returns_unloaded_records_silently() {
        let tmp = TempDir::new().unwrap();
        {
            let store = open(&tmp);
            store.put("a", record("a", 1));
            store.put("b", record("b", 2));
        }
        let store = open(&tmp);
        let recorder = Arc::new(Recorder::default());
        store.subscribe(recorder.clone());
        assert!(store.get("a").is_some());

        let mut removed: Vec<String> = store.clear().into_iter().map(|r| r.key).collect();
        removed.sort();
        assert_eq!(removed, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(store.unloaded_len(), 0);
        assert!(!store.contains("b"));
        assert!(store.persistence().load_all_keys().is_empty());
        assert_eq!(
            *recorder.events.lock(),
            vec!["added a 1 replaced=0".to_string(), "removed a".to_string()]
        );
    }

    #[test]
    fn test_resident_bytes() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        store.put("a", record("a", 100));
        store.put("b", record("b", 250));
        assert_eq!(store.resident_bytes(), 350);
    }
}
