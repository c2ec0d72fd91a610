//! Lock Service
//!
//! Mutual exclusion across concurrent workers with a bounded wait and a
//! TTL. An [`AcquiredLock`] releases itself when dropped, so every exit
//! path of the holder gives the lock back.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::error::{OrchestrationError, Result};

/// Distributed lock service.
pub trait PersistentLocker: Send + Sync {
    /// Waits up to `max_wait` for `resource_key`.
    ///
    /// Returns `Ok(None)` when the lock stayed busy for the whole wait, and
    /// `Err` when the lock service itself failed. A granted lock expires
    /// after `lock_ttl` even if never released.
    fn wait_to_acquire_lock(
        &self,
        resource_key: &str,
        max_wait: Duration,
        lock_ttl: Duration,
    ) -> Result<Option<AcquiredLock>>;
}

/// A held lock. Dropping it releases the lock.
pub struct AcquiredLock {
    resource_key: String,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl AcquiredLock {
    /// Wraps a lock together with the action that releases it.
    pub fn new(resource_key: impl Into<String>, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            resource_key: resource_key.into(),
            release: Some(Box::new(release)),
        }
    }

    pub fn resource_key(&self) -> &str {
        &self.resource_key
    }

    /// Releases the lock now.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(release) = self.release.take() {
            release();
            debug!("Released lock {}", self.resource_key);
        }
    }
}

impl Drop for AcquiredLock {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl fmt::Debug for AcquiredLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcquiredLock")
            .field("resource_key", &self.resource_key)
            .field("held", &self.release.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
struct LockEntry {
    token: u64,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct LockTable {
    locks: Mutex<HashMap<String, LockEntry>>,
    released: Condvar,
}

impl LockTable {
    fn locks(&self) -> Result<MutexGuard<'_, HashMap<String, LockEntry>>> {
        self.locks
            .lock()
            .map_err(|_| OrchestrationError::Lock("lock table poisoned".to_string()))
    }

    fn release(&self, resource_key: &str, token: u64) {
        let Ok(mut locks) = self.locks.lock() else {
            warn!("Could not release lock {}: lock table poisoned", resource_key);
            return;
        };
        match locks.get(resource_key) {
            Some(entry) if entry.token == token => {
                locks.remove(resource_key);
            }
            // Expired and taken over by someone else; nothing to give back.
            Some(_) | None => {
                debug!("Lock {} no longer held by token {}", resource_key, token);
            }
        }
        drop(locks);
        self.released.notify_all();
    }
}

/// Process-local lock service.
///
/// Locks whose TTL has passed may be taken over by a new acquirer; the
/// stale holder's release then becomes a no-op.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLocker {
    table: Arc<LockTable>,
    next_token: Arc<AtomicU64>,
}

impl InMemoryLocker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if `resource_key` is currently held and not expired.
    pub fn is_locked(&self, resource_key: &str) -> bool {
        self.table
            .locks()
            .map(|locks| {
                locks
                    .get(resource_key)
                    .map_or(false, |entry| entry.expires_at > Instant::now())
            })
            .unwrap_or(false)
    }
}

impl PersistentLocker for InMemoryLocker {
    fn wait_to_acquire_lock(
        &self,
        resource_key: &str,
        max_wait: Duration,
        lock_ttl: Duration,
    ) -> Result<Option<AcquiredLock>> {
        let deadline = Instant::now() + max_wait;
        let mut locks = self.table.locks()?;

        loop {
            let now = Instant::now();
            let free = match locks.get(resource_key) {
                None => true,
                Some(entry) => entry.expires_at <= now,
            };

            if free {
                let token = self.next_token.fetch_add(1, Ordering::Relaxed);
                locks.insert(
                    resource_key.to_string(),
                    LockEntry {
                        token,
                        expires_at: now + lock_ttl,
                    },
                );
                debug!("Acquired lock {} (ttl {:?})", resource_key, lock_ttl);

                let table = Arc::clone(&self.table);
                let key = resource_key.to_string();
                return Ok(Some(AcquiredLock::new(resource_key, move || {
                    table.release(&key, token)
                })));
            }

            if now >= deadline {
                warn!("Timed out after {:?} waiting for lock {}", max_wait, resource_key);
                return Ok(None);
            }

            // Wake up for a release, the holder's expiry, or our deadline.
            let holder_expiry = locks
                .get(resource_key)
                .map_or(deadline, |entry| entry.expires_at);
            let wait_for = deadline.min(holder_expiry).saturating_duration_since(now);

            let (guard, _) = self
                .table
                .released
                .wait_timeout(locks, wait_for.max(Duration::from_millis(1)))
                .map_err(|_| OrchestrationError::Lock("lock table poisoned".to_string()))?;
            locks = guard;
        }
    }
}
