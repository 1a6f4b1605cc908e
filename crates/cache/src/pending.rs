//! Keys whose download is in flight
//!
//! The set is process-local and never persisted. With a TTL configured, a
//! mark older than the TTL counts as abandoned and is dropped the next time
//! it is looked at.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Concurrency-safe set of pending keys
#[derive(Debug, Default)]
pub struct PendingSet {
    marks: Mutex<HashMap<String, Instant>>,
    ttl: Option<Duration>,
}

impl PendingSet {
    /// Create a set whose marks never expire
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a set whose marks expire after `ttl`
    #[must_use]
    pub fn with_ttl(ttl: Option<Duration>) -> Self {
        Self {
            marks: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    fn expired(&self, marked_at: Instant) -> bool {
        self.ttl.is_some_and(|ttl| marked_at.elapsed() >= ttl)
    }

    /// Whether `key` is marked and the mark has not expired
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        let mut marks = self.marks.lock();
        match marks.get(key).copied() {
            Some(marked_at) if self.expired(marked_at) => {
                marks.remove(key);
                tracing::warn!(key = %key, "Dropping abandoned pending download mark");
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Mark `key` as pending. Returns false if a live mark already exists
    pub fn insert(&self, key: &str) -> bool {
        let mut marks = self.marks.lock();
        if let Some(marked_at) = marks.get(key).copied() {
            if !self.expired(marked_at) {
                return false;
            }
            tracing::warn!(key = %key, "Replacing abandoned pending download mark");
        }
        marks.insert(key.to_string(), Instant::now());
        true
    }

    /// Clear the mark for `key`. Returns false if there was none
    pub fn remove(&self, key: &str) -> bool {
        self.marks.lock().remove(key).is_some()
    }

    /// Number of marks, expired ones included
    #[must_use]
    pub fn len(&self) -> usize {
        self.marks.lock().len()
    }

    /// Whether there are no marks
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.marks.lock().is_empty()
    }

    /// Drop every mark
    pub fn clear(&self) {
        self.marks.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_insert_is_idempotent() {
        let set = PendingSet::new();
        assert!(set.insert("k"));
        assert!(!set.insert("k"));
        assert!(set.contains("k"));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_remove() {
        let set = PendingSet::new();
        set.insert("k");
        assert!(set.remove("k"));
        assert!(!set.remove("k"));
        assert!(!set.contains("k"));
        assert!(set.is_empty());
    }

    #[test]
    fn test_ttl_expires_marks() {
        let set = PendingSet::with_ttl(Some(Duration::from_millis(200)));
        set.insert("k");
        assert!(set.contains("k"));
        thread::sleep(Duration::from_millis(300));
        assert!(!set.contains("k"));
        assert!(set.is_empty());
    }

    #[test]
    fn test_ttl_allows_reinsert_of_abandoned_mark() {
        let set = PendingSet::with_ttl(Some(Duration::from_millis(200)));
        assert!(set.insert("k"));
        thread::sleep(Duration::from_millis(300));
        assert!(set.insert("k"));
        assert!(set.contains("k"));
    }

    #[test]
    fn test_concurrent_insert_single_winner() {
        let set = Arc::new(PendingSet::new());
        let winners: usize = (0..16)
            .map(|_| {
                let set = Arc::clone(&set);
                thread::spawn(move || usize::from(set.insert("shared")))
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .sum();
        assert_eq!(winners, 1);
        assert_eq!(set.len(), 1);
    }
}
