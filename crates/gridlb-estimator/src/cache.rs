//! Bounded least-recently-used cache.
//!
//! An `IndexMap` keeps entries in recency order (oldest first); a hit moves
//! the entry to the back and an insert past capacity evicts the front. A
//! single mutex guards both the map and its order, so concurrent
//! get/insert/evict cannot tear the recency list.

use std::hash::Hash;

use indexmap::IndexMap;
use parking_lot::Mutex;

pub struct LruCache<K, V> {
    entries: Mutex<IndexMap<K, V>>,
    capacity: usize,
}

impl<K: Hash + Eq, V: Clone> LruCache<K, V> {
    /// Create a cache holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(IndexMap::with_capacity(capacity.min(4096))),
            capacity,
        }
    }

    /// Look up `key`, marking it most recently used.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut entries = self.entries.lock();
        let idx = entries.get_index_of(key)?;
        let last = entries.len() - 1;
        entries.move_index(idx, last);
        entries.get_index(last).map(|(_, v)| v.clone())
    }

    /// Insert or overwrite `key`, evicting the least recently used entry
    /// when over capacity.
    pub fn insert(&self, key: K, value: V) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = self.entries.lock();
        entries.shift_remove(&key);
        entries.insert(key, value);
        while entries.len() > self.capacity {
            entries.shift_remove_index(0);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
