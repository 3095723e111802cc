//! Ordered multi-key row locks.
//!
//! Keys are always acquired in ascending order, so two callers locking
//! overlapping key sets can never wait on each other in a cycle. A caller that
//! cannot take every key before its deadline releases whatever it already
//! holds and gets [`StoreError::LockTimeout`]. Locks are not reentrant.

use crate::error::{StoreError, StoreResult};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeSet, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct LockTable<K> {
    name: &'static str,
    held: Mutex<HashSet<K>>,
    released: Condvar,
}

impl<K> LockTable<K>
where
    K: Ord + Hash + Clone + Debug,
{
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            held: Mutex::new(HashSet::new()),
            released: Condvar::new(),
        })
    }

    /// Acquire every key in `keys`, in sorted order.
    pub fn lock_all(
        self: &Arc<Self>,
        keys: impl IntoIterator<Item = K>,
        timeout: Duration,
    ) -> StoreResult<LockGuard<K>> {
        let sorted: BTreeSet<K> = keys.into_iter().collect();
        let deadline = Instant::now() + timeout;
        let mut acquired = Vec::with_capacity(sorted.len());
        let mut held = self.held.lock();

        for key in sorted {
            while held.contains(&key) {
                if self.released.wait_until(&mut held, deadline).timed_out() && held.contains(&key)
                {
                    for taken in &acquired {
                        held.remove(taken);
                    }
                    drop(held);
                    self.released.notify_all();
                    return Err(StoreError::LockTimeout {
                        what: format!("{} {:?}", self.name, key),
                        waited_ms: timeout.as_millis() as u64,
                    });
                }
            }
            held.insert(key.clone());
            acquired.push(key);
        }

        Ok(LockGuard {
            table: Arc::clone(self),
            keys: acquired,
        })
    }

    pub fn is_locked(&self, key: &K) -> bool {
        self.held.lock().contains(key)
    }
}

/// Releases its keys when dropped.
pub struct LockGuard<K>
where
    K: Ord + Hash + Clone + Debug,
{
    table: Arc<LockTable<K>>,
    keys: Vec<K>,
}

impl<K> LockGuard<K>
where
    K: Ord + Hash + Clone + Debug,
{
    pub fn keys(&self) -> &[K] {
        &self.keys
    }
}

impl<K> Drop for LockGuard<K>
where
    K: Ord + Hash + Clone + Debug,
{
    fn drop(&mut self) {
        {
            let mut held = self.table.held.lock();
            for key in &self.keys {
                held.remove(key);
            }
        }
        self.table.released.notify_all();
    }
}
