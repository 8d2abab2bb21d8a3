// src/registry/watched.rs

//! Observer-notifying keyed containers
//!
//! Every collection that makes up the registry state is a [`WatchedMap`]:
//! a `BTreeMap` instrumented so that every structural mutation reports to
//! a single registered [`ChangeObserver`] before the call returns. The
//! observer is how the snapshot cache learns that its cached copy is
//! stale; a dropped notification would mean a reader could be handed a
//! snapshot that silently misses a committed change.

use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::ops::Deref;
use std::sync::Arc;

/// Receiver for watched-collection change notifications
///
/// Implementations must be fast and non-blocking: the callback runs inside
/// the write path, synchronously, for every mutation. It must not take
/// locks and must not panic.
pub trait ChangeObserver: Send + Sync {
    /// Called after a structural mutation of the named collection
    fn on_change(&self, collection: &str);
}

/// A keyed container that notifies an observer on every mutation
///
/// Read access goes through `Deref` to the inner `BTreeMap`. All mutating
/// operations notify; `get_mut` notifies pessimistically when handing out
/// the reference, since the mutation happens after the call returns.
pub struct WatchedMap<K, V> {
    inner: BTreeMap<K, V>,
    observer: Arc<dyn ChangeObserver>,
    name: &'static str,
}

impl<K: std::fmt::Debug, V: std::fmt::Debug> std::fmt::Debug for WatchedMap<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchedMap")
            .field("name", &self.name)
            .field("inner", &self.inner)
            .finish()
    }
}

impl<K: Ord, V> WatchedMap<K, V> {
    pub fn new(name: &'static str, observer: Arc<dyn ChangeObserver>) -> Self {
        Self {
            inner: BTreeMap::new(),
            observer,
            name,
        }
    }

    fn notify(&self) {
        self.observer.on_change(self.name);
    }

    /// Insert a value, notifying the observer
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let prior = self.inner.insert(key, value);
        self.notify();
        prior
    }

    /// Remove a key, notifying the observer only if something was removed
    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let removed = self.inner.remove(key);
        if removed.is_some() {
            self.notify();
        }
        removed
    }

    /// Mutable access to a value
    ///
    /// Handing out the reference counts as a mutation: the observer is
    /// notified even if the caller ends up not writing through it.
    pub fn get_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        if self.inner.contains_key(key) {
            self.notify();
        }
        self.inner.get_mut(key)
    }

    /// Keep only entries the predicate accepts, notifying if any were dropped
    pub fn retain<F>(&mut self, f: F)
    where
        F: FnMut(&K, &mut V) -> bool,
    {
        let before = self.inner.len();
        self.inner.retain(f);
        if self.inner.len() != before {
            self.notify();
        }
    }

    /// Remove all entries, notifying if the map was non-empty
    pub fn clear(&mut self) {
        if !self.inner.is_empty() {
            self.inner.clear();
            self.notify();
        }
    }
}

impl<K: Ord + Clone, V: Clone> WatchedMap<K, V> {
    /// Deep-copy the contents for snapshot construction
    pub fn clone_inner(&self) -> BTreeMap<K, V> {
        self.inner.clone()
    }
}

impl<K: Ord, V> Deref for WatchedMap<K, V> {
    type Target = BTreeMap<K, V>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingObserver {
        changes: AtomicUsize,
    }

    impl ChangeObserver for CountingObserver {
        fn on_change(&self, _collection: &str) {
            self.changes.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn make_map() -> (WatchedMap<String, u32>, Arc<CountingObserver>) {
        let observer = Arc::new(CountingObserver::default());
        let map = WatchedMap::new("test", observer.clone() as Arc<dyn ChangeObserver>);
        (map, observer)
    }

    #[test]
    fn test_insert_and_remove_notify() {
        let (mut map, observer) = make_map();

        map.insert("a".to_string(), 1);
        assert_eq!(observer.changes.load(Ordering::Relaxed), 1);

        map.remove(&"a".to_string());
        assert_eq!(observer.changes.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_remove_missing_does_not_notify() {
        let (mut map, observer) = make_map();

        map.remove(&"missing".to_string());
        assert_eq!(observer.changes.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_get_mut_notifies_pessimistically() {
        let (mut map, observer) = make_map();
        map.insert("a".to_string(), 1);

        // Present key notifies even without a write
        let _ = map.get_mut(&"a".to_string());
        assert_eq!(observer.changes.load(Ordering::Relaxed), 2);

        // Absent key does not
        assert!(map.get_mut(&"b".to_string()).is_none());
        assert_eq!(observer.changes.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_retain_notifies_only_on_removal() {
        let (mut map, observer) = make_map();
        map.insert("a".to_string(), 1);
        map.insert("b".to_string(), 2);
        let before = observer.changes.load(Ordering::Relaxed);

        map.retain(|_, v| *v > 0);
        assert_eq!(observer.changes.load(Ordering::Relaxed), before);

        map.retain(|_, v| *v > 1);
        assert_eq!(observer.changes.load(Ordering::Relaxed), before + 1);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_read_access_through_deref() {
        let (mut map, observer) = make_map();
        map.insert("a".to_string(), 1);
        let before = observer.changes.load(Ordering::Relaxed);

        assert_eq!(map.get("a"), Some(&1));
        assert_eq!(map.len(), 1);
        assert!(map.contains_key("a"));
        assert_eq!(observer.changes.load(Ordering::Relaxed), before);
    }

    #[test]
    fn test_clone_inner_is_detached() {
        let (mut map, _observer) = make_map();
        map.insert("a".to_string(), 1);

        let copy = map.clone_inner();
        map.insert("b".to_string(), 2);

        assert_eq!(copy.len(), 1);
        assert_eq!(map.len(), 2);
    }
}
