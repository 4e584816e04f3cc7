use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::StorageError;

/// Registry of integer-keyed exclusive locks shared by every unit of work of
/// one store. A key is held by at most one guard at a time.
#[derive(Debug, Default)]
pub struct AdvisoryLocks {
    held: Mutex<HashSet<i64>>,
    released: Condvar,
}

impl AdvisoryLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until `key` is free or `timeout` elapses.
    pub fn acquire(
        self: &Arc<Self>,
        key: i64,
        timeout: Duration,
    ) -> Result<AdvisoryGuard, StorageError> {
        let started = Instant::now();
        let mut held = self.lock_set()?;
        while held.contains(&key) {
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(StorageError::LockTimeout {
                    key,
                    waited_ms: elapsed.as_millis() as u64,
                });
            }
            let (next, _) = self
                .released
                .wait_timeout(held, timeout - elapsed)
                .map_err(|_| StorageError::LockPoisoned)?;
            held = next;
        }
        held.insert(key);

        Ok(AdvisoryGuard {
            locks: Arc::clone(self),
            key,
        })
    }

    pub fn is_held(&self, key: i64) -> bool {
        self.held
            .lock()
            .map(|held| held.contains(&key))
            .unwrap_or(false)
    }

    fn lock_set(&self) -> Result<MutexGuard<'_, HashSet<i64>>, StorageError> {
        self.held.lock().map_err(|_| StorageError::LockPoisoned)
    }

    fn release(&self, key: i64) {
        // A poisoned set still has to give the key back.
        let mut held = match self.held.lock() {
            Ok(held) => held,
            Err(poisoned) => poisoned.into_inner(),
        };
        held.remove(&key);
        drop(held);
        self.released.notify_all();
    }
}

/// Releases its key on drop.
#[derive(Debug)]
pub struct AdvisoryGuard {
    locks: Arc<AdvisoryLocks>,
    key: i64,
}

impl AdvisoryGuard {
    pub fn key(&self) -> i64 {
        self.key
    }
}

impl Drop for AdvisoryGuard {
    fn drop(&mut self) {
        self.locks.release(self.key);
    }
}
