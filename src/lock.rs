//! Key Locks
//!
//! The one lock primitive used by the stampede guard and the revalidation
//! scheduler: acquire-with-TTL, release, is-held. Every lock carries an
//! expiry, so an owner that crashes mid-fetch can only block a key for at
//! most one lock TTL.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cache::{CacheKey, CacheMetrics};
use crate::domain::ports::LockStore;
use crate::error::Result;

/// A held lock record, as kept by a [`LockStore`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    /// Lock name
    pub key: String,
    /// Acquisition token of the holder
    pub owner: String,
    /// Hard expiry; past this the lock is free
    pub expires_at: DateTime<Utc>,
}

impl Lock {
    pub fn new(key: impl Into<String>, owner: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            owner: owner.into(),
            expires_at,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Proof of a successful acquisition; hand it back to [`KeyLock::release`].
///
/// Dropping the guard without releasing (a cancelled caller) leaves the lock
/// to its TTL but still takes it off the active-lock gauge.
#[must_use = "a lock guard must be released"]
pub struct LockGuard {
    name: String,
    token: String,
    metrics: Arc<CacheMetrics>,
}

impl LockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.metrics.lock_released();
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").field("name", &self.name).finish_non_exhaustive()
    }
}

/// Per-key advisory lock over a [`LockStore`]
#[derive(Clone)]
pub struct KeyLock {
    store: Arc<dyn LockStore>,
    namespace: String,
    ttl: Duration,
    metrics: Arc<CacheMetrics>,
}

impl KeyLock {
    /// Create a lock family; names are `{namespace}:{pattern}:{key}`
    pub fn new(
        store: Arc<dyn LockStore>,
        namespace: impl Into<String>,
        ttl: Duration,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            ttl,
            metrics,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn name_for(&self, key: &CacheKey) -> String {
        format!("{}:{}", self.namespace, key.storage_key())
    }

    /// Try to acquire the lock for `key` without waiting
    pub async fn acquire(&self, key: &CacheKey) -> Result<Option<LockGuard>> {
        let name = self.name_for(key);
        let token = uuid::Uuid::new_v4().to_string();

        if self.store.try_acquire(&name, &token, self.ttl).await? {
            self.metrics.lock_acquired();
            debug!(lock = %name, "lock acquired");
            Ok(Some(LockGuard {
                name,
                token,
                metrics: Arc::clone(&self.metrics),
            }))
        } else {
            Ok(None)
        }
    }

    /// Release a held lock. Returns false if it had already expired and been taken over.
    pub async fn release(&self, guard: LockGuard) -> Result<bool> {
        let released = self.store.release(&guard.name, &guard.token).await?;
        if !released {
            warn!(lock = %guard.name, "lock expired before release");
        }
        Ok(released)
    }

    /// Release, logging instead of failing
    pub async fn release_quietly(&self, guard: LockGuard) {
        let name = guard.name.clone();
        if let Err(e) = self.release(guard).await {
            warn!(lock = %name, error = %e, "lock release failed, relying on TTL expiry");
        }
    }

    /// Whether anyone currently holds the lock for `key`
    pub async fn is_held(&self, key: &CacheKey) -> Result<bool> {
        self.store.is_held(&self.name_for(key)).await
    }

    /// Poll until the lock for `key` is free or `timeout` elapses.
    ///
    /// Returns true if the lock was observed free within the bound.
    pub async fn wait_for_release(
        &self,
        key: &CacheKey,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.is_held(key).await? {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
