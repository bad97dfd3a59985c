//! Per-key locks held for the duration of a script
//!
//! Scripts that declare disjoint keys run in parallel; scripts whose key sets
//! overlap run one after the other. A lock request is all or nothing, so two
//! scripts can never deadlock by each holding part of the other's keys.

use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::{DatabaseIndex, Key, KeyLocker};

/// Key lock acquisition failure
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LockError {
    #[error("timed out after {0:?} waiting for script keys")]
    Timeout(Duration),

    #[error("key lock table poisoned")]
    Poisoned,
}

/// Releases locked keys on drop
#[must_use = "keys are unlocked as soon as the guard is dropped"]
pub struct KeyLockGuard {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl KeyLockGuard {
    /// Guard that runs `release` when dropped
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        KeyLockGuard {
            release: Some(Box::new(release)),
        }
    }

    /// Guard holding nothing
    pub fn empty() -> Self {
        KeyLockGuard { release: None }
    }
}

impl Drop for KeyLockGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for KeyLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyLockGuard")
            .field("held", &self.release.is_some())
            .finish()
    }
}

struct LockState {
    held: Mutex<HashSet<(DatabaseIndex, Key)>>,
    released: Condvar,
}

impl LockState {
    fn held(&self) -> Result<MutexGuard<'_, HashSet<(DatabaseIndex, Key)>>, LockError> {
        self.held.lock().map_err(|_| LockError::Poisoned)
    }

    fn release(&self, keys: &[(DatabaseIndex, Key)]) {
        // release must happen even after a panic elsewhere poisoned the mutex
        let mut held = match self.held.lock() {
            Ok(held) => held,
            Err(poisoned) => poisoned.into_inner(),
        };
        for key in keys {
            held.remove(key);
        }
        drop(held);
        self.released.notify_all();
    }
}

/// In-process key lock table
#[derive(Clone)]
pub struct KeyLockTable {
    state: Arc<LockState>,
}

impl KeyLockTable {
    pub fn new() -> Self {
        KeyLockTable {
            state: Arc::new(LockState {
                held: Mutex::new(HashSet::new()),
                released: Condvar::new(),
            }),
        }
    }

    /// Number of keys currently locked
    pub fn locked_count(&self) -> usize {
        self.state.held().map(|held| held.len()).unwrap_or(0)
    }
}

impl Default for KeyLockTable {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyLocker for KeyLockTable {
    fn lock_keys(
        &self,
        db: DatabaseIndex,
        keys: &[Key],
        timeout: Option<Duration>,
    ) -> Result<KeyLockGuard, LockError> {
        let mut wanted: Vec<(DatabaseIndex, Key)> = keys.iter().map(|k| (db, k.clone())).collect();
        wanted.sort();
        wanted.dedup();
        if wanted.is_empty() {
            return Ok(KeyLockGuard::empty());
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut held = self.state.held()?;
        while wanted.iter().any(|key| held.contains(key)) {
            held = match deadline {
                None => self.state.released.wait(held).map_err(|_| LockError::Poisoned)?,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(LockError::Timeout(timeout.unwrap_or_default()));
                    }
                    let (guard, _) = self
                        .state
                        .released
                        .wait_timeout(held, deadline - now)
                        .map_err(|_| LockError::Poisoned)?;
                    guard
                }
            };
        }
        held.extend(wanted.iter().cloned());
        drop(held);

        tracing::trace!(db, keys = wanted.len(), "script keys locked");
        let state = Arc::clone(&self.state);
        Ok(KeyLockGuard::new(move || state.release(&wanted)))
    }
}
