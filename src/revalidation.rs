//! Revalidation Scheduler
//!
//! Stale-while-revalidate on top of the tiered cache and the stampede guard.
//!
//! ```text
//! FRESH ──(fresh ttl)──▶ STALE ──(stale ttl)──▶ ABSENT
//!   │                      │                      │
//!   return                 return stale,          block on
//!                          refresh in background  StampedeGuard::protect
//! ```
//!
//! At most one background refresh per key is in flight in this process,
//! tracked by a [`RevalidationTicket`]. A failed refresh is retried after a
//! fixed delay up to the retry limit and then dropped; the next stale read
//! schedules a new one.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::cache::{CacheKey, CacheMetrics, EntryState, Ttl};
use crate::config::CacheSettings;
use crate::domain::ports::Fetcher;
use crate::error::Result;
use crate::guard::{EntryPolicy, StampedeGuard};
use crate::pool::WorkerPool;

/// In-flight background refresh for one key
#[derive(Debug, Clone, Serialize)]
pub struct RevalidationTicket {
    pub key: CacheKey,
    pub started_at: DateTime<Utc>,
    /// Refresh attempts made so far
    pub attempts: u32,
}

/// Per-call options for [`RevalidationScheduler::get`]
#[derive(Debug, Clone)]
pub struct GetOptions {
    pub policy: EntryPolicy,
    /// Refresh stale hits in the background
    pub revalidate_in_background: bool,
}

impl GetOptions {
    pub fn new(ttl: Ttl) -> Self {
        Self {
            policy: EntryPolicy::new(ttl),
            revalidate_in_background: true,
        }
    }

    pub fn with_policy(policy: EntryPolicy) -> Self {
        Self {
            policy,
            revalidate_in_background: true,
        }
    }

    /// Serve stale values without scheduling a refresh
    pub fn without_background_refresh(mut self) -> Self {
        self.revalidate_in_background = false;
        self
    }
}

/// Value returned by the scheduler
#[derive(Debug, Clone)]
pub struct Revalidated {
    pub value: Arc<Value>,
    /// Served from the stale window
    pub stale: bool,
    /// A background refresh for the key is in flight
    pub revalidating: bool,
    /// Caller-supplied fallback was served
    pub from_fallback: bool,
}

impl Revalidated {
    fn fresh(value: Arc<Value>) -> Self {
        Self {
            value,
            stale: false,
            revalidating: false,
            from_fallback: false,
        }
    }
}

/// Scheduler timing
#[derive(Debug, Clone)]
pub struct RevalidationConfig {
    /// Retries after a failed background refresh
    pub retry_limit: u32,
    /// Fixed delay before each retry
    pub retry_delay: Duration,
    /// TTL for cached fallback values
    pub fallback_ttl: Ttl,
}

impl From<&CacheSettings> for RevalidationConfig {
    fn from(settings: &CacheSettings) -> Self {
        Self {
            retry_limit: settings.revalidation_retry_limit,
            retry_delay: settings.revalidation_retry_delay(),
            fallback_ttl: settings.fallback_ttl(),
        }
    }
}

impl Default for RevalidationConfig {
    fn default() -> Self {
        Self::from(&CacheSettings::default())
    }
}

/// Stale-while-revalidate front end
#[derive(Clone)]
pub struct RevalidationScheduler {
    guard: StampedeGuard,
    pool: Arc<WorkerPool>,
    tickets: Arc<DashMap<CacheKey, RevalidationTicket>>,
    config: RevalidationConfig,
}

impl RevalidationScheduler {
    pub fn new(guard: StampedeGuard, pool: Arc<WorkerPool>, config: RevalidationConfig) -> Self {
        Self {
            guard,
            pool,
            tickets: Arc::new(DashMap::new()),
            config,
        }
    }

    fn metrics(&self) -> &Arc<CacheMetrics> {
        self.guard.cache().metrics()
    }

    /// Read `key`, serving stale data while a refresh runs in the background.
    ///
    /// Only an absent key blocks on the upstream fetch, and only that path
    /// can return an error.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn get(
        &self,
        key: &CacheKey,
        fetcher: &Fetcher,
        options: &GetOptions,
    ) -> Result<Revalidated> {
        let lookup = self.guard.cache().get(key).await;

        match (lookup.value(), lookup.state) {
            (Some(value), EntryState::Fresh) => Ok(Revalidated::fresh(value)),
            (Some(value), EntryState::Stale) => {
                let revalidating = if options.revalidate_in_background {
                    self.schedule(key, fetcher, &options.policy)
                } else {
                    self.tickets.contains_key(key)
                };
                Ok(Revalidated {
                    value,
                    stale: true,
                    revalidating,
                    from_fallback: false,
                })
            }
            _ => {
                debug!("miss, fetching through stampede guard");
                let value = self.guard.protect(key, fetcher, &options.policy).await?;
                Ok(Revalidated::fresh(value))
            }
        }
    }

    /// Like [`get`](Self::get), but a failed fetch on an absent key serves
    /// `fallback` instead, caching it briefly so repeated failures do not
    /// hammer the source.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn get_with_fallback(
        &self,
        key: &CacheKey,
        fetcher: &Fetcher,
        options: &GetOptions,
        fallback: Value,
    ) -> Revalidated {
        match self.get(key, fetcher, options).await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "source fetch failed, serving fallback");
                self.metrics().record_fallback_served();
                let outcome = self
                    .guard
                    .cache()
                    .set(key, fallback, self.config.fallback_ttl, options.policy.tags.clone())
                    .await;
                Revalidated {
                    value: outcome.value,
                    stale: false,
                    revalidating: false,
                    from_fallback: true,
                }
            }
        }
    }

    /// Start a background refresh unless one is already in flight.
    /// Returns whether a refresh is now in flight.
    fn schedule(&self, key: &CacheKey, fetcher: &Fetcher, policy: &EntryPolicy) -> bool {
        match self.tickets.entry(key.clone()) {
            Entry::Occupied(_) => return true,
            Entry::Vacant(slot) => {
                slot.insert(RevalidationTicket {
                    key: key.clone(),
                    started_at: self.guard.cache().clock().now(),
                    attempts: 0,
                });
            }
        }

        self.metrics().record_revalidation_started();
        debug!(%key, "scheduling background revalidation");

        let scheduler = self.clone();
        let task_key = key.clone();
        let fetcher = Arc::clone(fetcher);
        let policy = policy.clone();
        let submitted = self.pool.submit(async move {
            scheduler.refresh(&task_key, &fetcher, &policy).await;
            scheduler.tickets.remove(&task_key);
        });

        match submitted {
            Ok(()) => true,
            Err(e) => {
                self.tickets.remove(key);
                debug!(%key, error = %e, "background revalidation not scheduled");
                false
            }
        }
    }

    async fn refresh(&self, key: &CacheKey, fetcher: &Fetcher, policy: &EntryPolicy) {
        let max_attempts = self.config.retry_limit + 1;

        for attempt in 1..=max_attempts {
            if let Some(mut ticket) = self.tickets.get_mut(key) {
                ticket.attempts = attempt;
            }

            match self.guard.try_refresh(key, fetcher, policy).await {
                Ok(true) => {
                    debug!(%key, attempt, "background revalidation complete");
                    return;
                }
                Ok(false) => {
                    debug!(%key, "key already being refreshed elsewhere");
                    return;
                }
                Err(e) if attempt < max_attempts => {
                    debug!(%key, attempt, error = %e, "background revalidation failed, retrying");
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                Err(e) => {
                    self.metrics().record_revalidation_failed();
                    warn!(%key, attempt, error = %e, "background revalidation gave up");
                }
            }
        }
    }

    /// Current ticket for `key`, if a refresh is in flight
    pub fn ticket(&self, key: &CacheKey) -> Option<RevalidationTicket> {
        self.tickets.get(key).map(|t| t.value().clone())
    }

    /// Number of keys with a refresh in flight
    pub fn in_flight(&self) -> usize {
        self.tickets.len()
    }

    /// Wait for queued and running refreshes to finish
    pub async fn wait_idle(&self) {
        self.pool.wait_idle().await;
    }
}

// =============================================================================
// Tests
// =============================================================================
