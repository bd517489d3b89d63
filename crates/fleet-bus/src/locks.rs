use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use crate::error::{BusError, Result};

/// Process-wide named mutual exclusion.
///
/// A single-node stand-in for a distributed mutex: acquiring never blocks, it
/// either succeeds or fails with [`BusError::AlreadyLocked`].
#[derive(Debug, Default)]
pub struct NamedLocks {
    /// key -> when it was acquired
    held: DashMap<String, Instant>,
}

impl NamedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_lock(&self, key: &str) -> Result<()> {
        match self.held.entry(key.to_string()) {
            Entry::Occupied(_) => Err(BusError::AlreadyLocked {
                key: key.to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(Instant::now());
                Ok(())
            }
        }
    }

    /// Release `key`. Releasing an unheld key is a no-op.
    pub fn unlock(&self, key: &str) {
        if let Some((_, since)) = self.held.remove(key) {
            debug!(key, held_ms = since.elapsed().as_millis() as u64, "lock released");
        }
    }

    /// Acquire `key` and release it when the returned guard drops, including
    /// during unwinding.
    pub fn try_guard(self: &Arc<Self>, key: &str) -> Result<LockGuard> {
        self.try_lock(key)?;
        Ok(LockGuard {
            locks: Arc::clone(self),
            key: key.to_string(),
        })
    }

    pub fn is_locked(&self, key: &str) -> bool {
        self.held.contains_key(key)
    }

    /// How long `key` has been held, or `None` if it is free.
    pub fn held_for(&self, key: &str) -> Option<Duration> {
        self.held.get(key).map(|since| since.elapsed())
    }

    /// Number of keys currently held.
    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

/// RAII handle for a key taken with [`NamedLocks::try_guard`].
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    locks: Arc<NamedLocks>,
    key: String,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.locks.unlock(&self.key);
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").field("key", &self.key).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_lock_fails_until_unlocked() {
        let locks = NamedLocks::new();
        locks.try_lock("job-1").unwrap();
        assert!(matches!(
            locks.try_lock("job-1"),
            Err(BusError::AlreadyLocked { .. })
        ));
        // Other keys are independent.
        locks.try_lock("job-2").unwrap();

        locks.unlock("job-1");
        locks.try_lock("job-1").unwrap();
    }

    #[test]
    fn unlock_of_unheld_key_is_noop() {
        let locks = NamedLocks::new();
        locks.unlock("nobody");
        assert!(locks.is_empty());
    }

    #[test]
    fn guard_releases_on_drop_and_panic() {
        let locks = Arc::new(NamedLocks::new());
        {
            let guard = locks.try_guard("a").unwrap();
            assert_eq!(guard.key(), "a");
            assert!(locks.is_locked("a"));
            assert!(locks.held_for("a").is_some());
        }
        assert!(!locks.is_locked("a"));

        let inner = Arc::clone(&locks);
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = inner.try_guard("b").unwrap();
            panic!("boom");
        }));
        assert!(outcome.is_err());
        assert!(!locks.is_locked("b"));
        assert_eq!(locks.held_for("b"), None);
    }
}
