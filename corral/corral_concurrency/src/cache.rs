//! Keyed compute-if-absent cache.
//!
//! Values are created while holding the cache lock, so each key's factory
//! runs at most once no matter how many threads ask for it concurrently.
//! Factories must not access the same cache.

use std::collections::HashMap;
use std::hash::Hash;

use crate::sync::{Atomic, Mutex, Synchronized};

/// A thread-safe map with lazily created values
pub struct Cache<K, V, L = Mutex> {
    entries: Atomic<HashMap<K, V>, L>,
}

impl<K: Eq + Hash, V: Clone> Cache<K, V> {
    /// Create an empty cache guarded by its own mutex
    pub fn new() -> Self {
        Self::with_lock(Mutex::normal())
    }
}

impl<K: Eq + Hash, V: Clone> Default for Cache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash, V: Clone, L: Synchronized> Cache<K, V, L> {
    /// Create an empty cache guarded by `lock`
    pub fn with_lock(lock: L) -> Self {
        Self {
            entries: Atomic::new(lock, HashMap::new()),
        }
    }

    /// Get a copy of the value stored under `key`
    pub fn get(&self, key: &K) -> Option<V> {
        self.entries.update(|entries| entries.get(key).cloned())
    }

    /// Store `value` under `key`, returning the previous value
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.entries.update(|entries| entries.insert(key, value))
    }

    /// Remove and return the value stored under `key`
    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries.update(|entries| entries.remove(key))
    }

    /// Remove every entry
    pub fn clear(&self) {
        self.entries.update(HashMap::clear);
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.update(|entries| entries.len())
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return the value under `key`, creating it with `f` if absent
    pub fn get_or_insert_with(&self, key: K, f: impl FnOnce() -> V) -> V {
        self.entries
            .update(|entries| entries.entry(key).or_insert_with(f).clone())
    }

    /// Like [`Cache::get_or_insert_with`], storing nothing if `f` fails
    pub fn try_get_or_insert_with<E>(
        &self,
        key: K,
        f: impl FnOnce() -> Result<V, E>,
    ) -> Result<V, E> {
        self.entries.update(|entries| -> Result<V, E> {
            if let Some(value) = entries.get(&key) {
                return Ok(value.clone());
            }

            let value = f()?;
            entries.insert(key, value.clone());
            Ok(value)
        })
    }
}
