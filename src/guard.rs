//! Stampede Guard
//!
//! Single-flight protection for source fetches. Concurrent misses on the
//! same key collapse into one upstream call: the first caller takes the key
//! lock and fetches, everyone else waits (bounded) for the lock to clear and
//! re-reads the cache.
//!
//! Stampede protection is a latency optimization, never an availability
//! blocker. If the lock store is unreachable, or the wait times out, the
//! caller fetches directly.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::cache::{CacheKey, CacheMetrics, EntryState, TieredCache, Ttl};
use crate::config::CacheSettings;
use crate::domain::ports::Fetcher;
use crate::error::{Error, Result};
use crate::lock::KeyLock;
use crate::pool::WorkerPool;

// =============================================================================
// Configuration
// =============================================================================

/// How a fetched value is written back
#[derive(Debug, Clone, PartialEq)]
pub struct EntryPolicy {
    /// Fresh and stale windows
    pub ttl: Ttl,
    /// Dependency tags for cascading invalidation
    pub tags: BTreeSet<String>,
}

impl EntryPolicy {
    pub fn new(ttl: Ttl) -> Self {
        Self {
            ttl,
            tags: BTreeSet::new(),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }
}

/// Stampede guard timing
#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// Bounded wait on a lock held by another caller
    pub lock_wait_timeout: Duration,
    /// Poll cadence while waiting
    pub lock_poll_interval: Duration,
    /// Upper bound on one fetcher call
    pub fetch_timeout: Duration,
    /// Fraction of fresh lifetime after which an early refresh starts
    pub early_refresh_threshold: f64,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self::from(&CacheSettings::default())
    }
}

impl From<&CacheSettings> for GuardConfig {
    fn from(settings: &CacheSettings) -> Self {
        Self {
            lock_wait_timeout: settings.lock_wait_timeout(),
            lock_poll_interval: settings.lock_poll_interval(),
            fetch_timeout: settings.fetch_timeout(),
            early_refresh_threshold: settings.early_refresh_threshold_fraction,
        }
    }
}

// =============================================================================
// Stampede Guard
// =============================================================================

/// Single-flight wrapper around source fetches
#[derive(Clone)]
pub struct StampedeGuard {
    cache: Arc<TieredCache>,
    lock: KeyLock,
    pool: Arc<WorkerPool>,
    config: GuardConfig,
    /// Keys with an early refresh queued or running in this process
    refreshing: Arc<DashSet<CacheKey>>,
}

impl StampedeGuard {
    pub fn new(
        cache: Arc<TieredCache>,
        lock: KeyLock,
        pool: Arc<WorkerPool>,
        config: GuardConfig,
    ) -> Self {
        Self {
            cache,
            lock,
            pool,
            config,
            refreshing: Arc::new(DashSet::new()),
        }
    }

    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    fn metrics(&self) -> &Arc<CacheMetrics> {
        self.cache.metrics()
    }

    /// Fetch-or-wait for `key`, writing the fetched value through the cache
    #[instrument(skip_all, fields(key = %key))]
    pub async fn protect(
        &self,
        key: &CacheKey,
        fetcher: &Fetcher,
        policy: &EntryPolicy,
    ) -> Result<Arc<Value>> {
        match self.lock.acquire(key).await {
            Ok(Some(guard)) => {
                // Another caller may have filled the key while we raced for the lock
                let lookup = self.cache.inspect(key).await;
                let result = match lookup.value() {
                    Some(value) if lookup.is_fresh() => {
                        debug!("filled by a concurrent caller");
                        Ok(value)
                    }
                    _ => self.fetch_and_store(key, fetcher, policy).await,
                };
                self.lock.release_quietly(guard).await;
                result
            }
            Ok(None) => {
                self.metrics().record_stampede_prevented();
                if let Some(value) = self.wait_for_holder(key).await {
                    return Ok(value);
                }
                self.fetch_and_store(key, fetcher, policy).await
            }
            Err(e) => {
                warn!(error = %e, "lock store unavailable, fetching without stampede protection");
                self.fetch_and_store(key, fetcher, policy).await
            }
        }
    }

    /// Wait for the lock holder to finish; returns its value if it stored one
    async fn wait_for_holder(&self, key: &CacheKey) -> Option<Arc<Value>> {
        let released = self
            .lock
            .wait_for_release(key, self.config.lock_wait_timeout, self.config.lock_poll_interval)
            .await;

        match released {
            Ok(true) => {
                let lookup = self.cache.inspect(key).await;
                match lookup.value() {
                    Some(value) if lookup.state == EntryState::Fresh => Some(value),
                    _ => {
                        debug!("lock holder did not store a value, fetching directly");
                        None
                    }
                }
            }
            Ok(false) => {
                self.metrics().record_lock_timeout();
                let err = Error::LockTimeout {
                    key: key.to_string(),
                    waited: self.config.lock_wait_timeout,
                };
                warn!(error = %err, "falling back to direct fetch");
                None
            }
            Err(e) => {
                warn!(error = %e, "lost contact with lock store while waiting, fetching directly");
                None
            }
        }
    }

    /// Call the fetcher under the fetch timeout and write through on success
    pub(crate) async fn fetch_and_store(
        &self,
        key: &CacheKey,
        fetcher: &Fetcher,
        policy: &EntryPolicy,
    ) -> Result<Arc<Value>> {
        let value = self.fetch(key, fetcher).await?;
        let outcome = self
            .cache
            .set(key, value, policy.ttl, policy.tags.clone())
            .await;
        Ok(outcome.value)
    }

    /// Call the fetcher under the fetch timeout without caching the result
    pub(crate) async fn fetch(&self, key: &CacheKey, fetcher: &Fetcher) -> Result<Value> {
        self.metrics().record_source_fetch();
        match tokio::time::timeout(self.config.fetch_timeout, fetcher()).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => {
                self.metrics().record_source_failure();
                Err(Error::source_fetch(key.to_string(), source))
            }
            Err(_) => {
                self.metrics().record_source_failure();
                Err(Error::FetchTimeout {
                    key: key.to_string(),
                    timeout: self.config.fetch_timeout,
                })
            }
        }
    }

    /// Refresh `key` only if nobody else is; never waits.
    ///
    /// Returns false when another caller holds the lock.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn try_refresh(
        &self,
        key: &CacheKey,
        fetcher: &Fetcher,
        policy: &EntryPolicy,
    ) -> Result<bool> {
        let guard = match self.lock.acquire(key).await {
            Ok(Some(guard)) => Some(guard),
            Ok(None) => {
                debug!("refresh already in progress elsewhere");
                return Ok(false);
            }
            Err(e) => {
                warn!(error = %e, "lock store unavailable, refreshing unguarded");
                None
            }
        };

        let result = self.fetch_and_store(key, fetcher, policy).await;
        if let Some(guard) = guard {
            self.lock.release_quietly(guard).await;
        }
        result.map(|_| true)
    }

    /// Like [`protect`](Self::protect), but a fresh hit past the early-refresh
    /// threshold also queues a background refresh so the key never goes cold
    #[instrument(skip_all, fields(key = %key))]
    pub async fn protect_with_early_refresh(
        &self,
        key: &CacheKey,
        fetcher: &Fetcher,
        policy: &EntryPolicy,
    ) -> Result<Arc<Value>> {
        let lookup = self.cache.get(key).await;
        match (&lookup.entry, lookup.state) {
            (Some(entry), EntryState::Fresh) => {
                let now = self.cache.clock().now();
                if entry.fresh_elapsed_fraction(now) >= self.config.early_refresh_threshold {
                    self.schedule_early_refresh(key, fetcher, policy);
                }
                Ok(Arc::clone(entry.value()))
            }
            _ => self.protect(key, fetcher, policy).await,
        }
    }

    fn schedule_early_refresh(&self, key: &CacheKey, fetcher: &Fetcher, policy: &EntryPolicy) {
        if !self.refreshing.insert(key.clone()) {
            return;
        }
        self.metrics().record_early_refresh();
        debug!(%key, "scheduling early refresh");

        let guard = self.clone();
        let task_key = key.clone();
        let fetcher = Arc::clone(fetcher);
        let policy = policy.clone();
        let submitted = self.pool.submit(async move {
            if let Err(e) = guard.try_refresh(&task_key, &fetcher, &policy).await {
                warn!(key = %task_key, error = %e, "early refresh failed");
            }
            guard.refreshing.remove(&task_key);
        });

        if let Err(e) = submitted {
            self.refreshing.remove(key);
            debug!(%key, error = %e, "early refresh not scheduled");
        }
    }

    /// Whether an early refresh for `key` is queued or running
    pub fn is_refreshing(&self, key: &CacheKey) -> bool {
        self.refreshing.contains(key)
    }
}

// =============================================================================
// Tests
// =============================================================================
