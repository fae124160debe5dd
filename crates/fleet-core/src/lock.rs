//! Keyed mutual exclusion for per-entity serialization.
//!
//! A [`KeyedLock`] hands out one async mutex per key. Holders of different
//! keys never contend; holders of the same key are queued in FIFO order by
//! `tokio::sync::Mutex`.
//!
//! Entries are reference counted: the table keeps only a weak handle, so a
//! key's mutex is freed once the last guard and waiter drop it.
//!
//! # Example
//!
//! ```rust,ignore
//! use fleet_core::lock::KeyedLock;
//!
//! let locks: KeyedLock<&'static str> = KeyedLock::new();
//! let guard = locks.acquire("node-a").await;
//! // "node-b" is independent and does not wait on "node-a".
//! let other = locks.acquire("node-b").await;
//! drop((guard, other));
//! ```

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Number of acquisitions between sweeps of dead table entries.
const PRUNE_INTERVAL: u64 = 256;

/// Guard proving exclusive access to one key.
///
/// The lock is released when the guard is dropped.
pub struct KeyedGuard<K> {
    key: K,
    _guard: OwnedMutexGuard<()>,
}

impl<K> KeyedGuard<K> {
    /// Returns the key this guard holds.
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K: fmt::Debug> fmt::Debug for KeyedGuard<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedGuard").field("key", &self.key).finish()
    }
}

struct Table<K> {
    entries: HashMap<K, Weak<AsyncMutex<()>>>,
    acquisitions: u64,
}

/// A table of async mutexes, one per key.
pub struct KeyedLock<K> {
    table: Mutex<Table<K>>,
}

impl<K> Default for KeyedLock<K> {
    fn default() -> Self {
        Self {
            table: Mutex::new(Table {
                entries: HashMap::new(),
                acquisitions: 0,
            }),
        }
    }
}

impl<K> fmt::Debug for KeyedLock<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedLock").finish_non_exhaustive()
    }
}

impl<K> KeyedLock<K>
where
    K: Eq + Hash + Clone,
{
    /// Creates an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `key`.
    pub async fn acquire(&self, key: K) -> KeyedGuard<K> {
        let mutex = self.mutex_for(&key);
        let guard = mutex.lock_owned().await;
        KeyedGuard { key, _guard: guard }
    }

    /// Returns the number of keys with a live mutex.
    #[must_use]
    pub fn active_keys(&self) -> usize {
        self.table
            .lock()
            .map(|t| t.entries.values().filter(|w| w.strong_count() > 0).count())
            .unwrap_or(0)
    }

    fn mutex_for(&self, key: &K) -> Arc<AsyncMutex<()>> {
        // The map stays consistent across a poisoning panic.
        let mut table = self
            .table
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        table.acquisitions = table.acquisitions.wrapping_add(1);
        if table.acquisitions % PRUNE_INTERVAL == 0 {
            table.entries.retain(|_, weak| weak.strong_count() > 0);
        }

        if let Some(existing) = table.entries.get(key).and_then(Weak::upgrade) {
            return existing;
        }

        let fresh = Arc::new(AsyncMutex::new(()));
        table.entries.insert(key.clone(), Arc::downgrade(&fresh));
        fresh
    }
}
