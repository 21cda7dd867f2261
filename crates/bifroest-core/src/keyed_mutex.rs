//! Per-key reader/writer lock with automatic cleanup of unused keys.
//!
//! Each key gets its own `tokio::sync::RwLock` the first time it is acquired.
//! Entries carry a holder count (including callers still waiting for the lock);
//! the entry is removed from the map when the count returns to zero, so memory
//! is bounded by the number of keys currently in use.
//!
//! The map itself sits behind a short-held `std::sync::RwLock`. Holder counts
//! only increase while that lock is held (read side), and removal re-checks the
//! count under the write side, so a release that drops the last holder cannot
//! race a concurrent acquisition of the same key.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard};

#[derive(Default)]
struct Entry {
    lock: Arc<tokio::sync::RwLock<()>>,
    holders: AtomicI64,
}

/// A map of independent reader/writer locks, one per key.
pub struct KeyedMutex<K> {
    entries: RwLock<HashMap<K, Arc<Entry>>>,
}

impl<K> Default for KeyedMutex<K> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> KeyedMutex<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire exclusive access to `key`.
    pub async fn lock(&self, key: K) -> KeyedGuard<'_, K> {
        let mut guard = self.register(key);
        let held = guard.entry.lock.clone().write_owned().await;
        guard.held = Some(Held::Write(held));
        guard
    }

    /// Acquire shared access to `key`.
    pub async fn read(&self, key: K) -> KeyedGuard<'_, K> {
        let mut guard = self.register(key);
        let held = guard.entry.lock.clone().read_owned().await;
        guard.held = Some(Held::Read(held));
        guard
    }

    /// Number of keys that currently have holders or waiters.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Count one more holder for `key`, creating its entry on first use.
    ///
    /// The returned guard releases the count when dropped, also when the
    /// caller is cancelled while still waiting for the lock.
    fn register(&self, key: K) -> KeyedGuard<'_, K> {
        let existing = {
            let map = self.entries.read().unwrap_or_else(|e| e.into_inner());
            map.get(&key).map(|entry| {
                entry.holders.fetch_add(1, Ordering::AcqRel);
                entry.clone()
            })
        };
        let entry = match existing {
            Some(entry) => entry,
            None => {
                let mut map = self.entries.write().unwrap_or_else(|e| e.into_inner());
                let entry = map.entry(key.clone()).or_default().clone();
                entry.holders.fetch_add(1, Ordering::AcqRel);
                entry
            }
        };
        KeyedGuard {
            owner: self,
            key,
            entry,
            held: None,
        }
    }

    /// Drop one holder of `key`; removes the entry once nobody holds it.
    ///
    /// # Panics
    ///
    /// Panics when the holder count would become negative. That means a key
    /// was released more often than it was acquired, which leaves the lock
    /// table in an undefined state.
    fn release(&self, key: &K, entry: &Arc<Entry>) {
        let previous = entry.holders.fetch_sub(1, Ordering::AcqRel);
        if previous <= 0 {
            panic!("keyed mutex holder count went negative ({})", previous - 1);
        }
        if previous > 1 {
            return;
        }

        let mut map = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let removable = map.get(key).is_some_and(|current| {
            Arc::ptr_eq(current, entry) && current.holders.load(Ordering::Acquire) == 0
        });
        if removable {
            map.remove(key);
        }
    }
}

enum Held {
    Read(#[allow(dead_code)] OwnedRwLockReadGuard<()>),
    Write(#[allow(dead_code)] OwnedRwLockWriteGuard<()>),
}

/// Unlocks its key when dropped.
pub struct KeyedGuard<'a, K: Eq + Hash + Clone> {
    owner: &'a KeyedMutex<K>,
    key: K,
    entry: Arc<Entry>,
    held: Option<Held>,
}

impl<K: Eq + Hash + Clone> KeyedGuard<'_, K> {
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Whether this guard grants exclusive access.
    pub fn is_exclusive(&self) -> bool {
        matches!(self.held, Some(Held::Write(_)))
    }
}

impl<K: Eq + Hash + Clone> Drop for KeyedGuard<'_, K> {
    fn drop(&mut self) {
        self.held.take();
        self.owner.release(&self.key, &self.entry);
    }
}
