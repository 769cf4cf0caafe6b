//! Subsystem Wiring
//!
//! [`CacheSubsystem`] builds every component from one [`CacheSettings`] and
//! owns their lifecycle. Components are constructed explicitly here; none of
//! them reach for global state.
//!
//! ```text
//!                   ┌──────────────────────────┐
//!   callers ───────▶│  RevalidationScheduler   │
//!                   └────────────┬─────────────┘
//!                                ▼
//!   WarmingEngine ─────▶  StampedeGuard  ◀──── KeyLock (LockStore)
//!                                │
//!                                ▼
//!   InvalidationRouter ─▶  TieredCache  ────▶ SharedTier
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

use crate::adapters::{InMemorySharedTier, StaticServiceRegistry};
use crate::cache::{
    CacheKey, CacheMetrics, EntryCodec, LocalTierConfig, MetricsSnapshot, TieredCache,
};
use crate::clock::{Clock, SystemClock};
use crate::config::{CacheSettings, WarmingItemSettings};
use crate::domain::events::{InvalidationEvent, InvalidationMetadata, InvalidationReason, ServiceEvent};
use crate::domain::ports::{Fetcher, LockStore, ServiceRegistry, SharedTier};
use crate::error::Result;
use crate::guard::{EntryPolicy, GuardConfig, StampedeGuard};
use crate::health::{HealthInputs, HealthReport};
use crate::invalidation::{InvalidationOutcome, InvalidationRouter, InvalidationRule};
use crate::lock::KeyLock;
use crate::pool::WorkerPool;
use crate::revalidation::{GetOptions, Revalidated, RevalidationConfig, RevalidationScheduler};
use crate::warming::{WarmingConfig, WarmingEngine, WarmingItem};

/// Lock names are `{LOCK_NAMESPACE}:{pattern}:{key}`
const LOCK_NAMESPACE: &str = "couchecache:lock";

// =============================================================================
// Builder
// =============================================================================

/// Collaborators for a [`CacheSubsystem`]; anything left unset gets an
/// in-process default
pub struct CacheSubsystemBuilder {
    settings: CacheSettings,
    clock: Option<Arc<dyn Clock>>,
    shared: Option<(Arc<dyn SharedTier>, Arc<dyn LockStore>)>,
    registry: Option<Arc<dyn ServiceRegistry>>,
    rules: Option<Vec<InvalidationRule>>,
}

impl CacheSubsystemBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Shared tier and the lock store used for stampede locks
    pub fn shared_tier(mut self, shared: Arc<dyn SharedTier>, locks: Arc<dyn LockStore>) -> Self {
        self.shared = Some((shared, locks));
        self
    }

    pub fn registry(mut self, registry: Arc<dyn ServiceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn invalidation_rules(mut self, rules: Vec<InvalidationRule>) -> Self {
        self.rules = Some(rules);
        self
    }

    pub fn build(self) -> Result<CacheSubsystem> {
        let settings = self.settings;
        settings.validate()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let (shared, locks) = match self.shared {
            Some(pair) => pair,
            None => {
                let memory = Arc::new(InMemorySharedTier::new(Arc::clone(&clock)));
                let shared: Arc<dyn SharedTier> = memory.clone();
                let locks: Arc<dyn LockStore> = memory;
                (shared, locks)
            }
        };
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(StaticServiceRegistry::new()));

        let cancel = CancellationToken::new();
        let metrics = Arc::new(CacheMetrics::new());

        let cache = Arc::new(TieredCache::new(
            LocalTierConfig::with_capacity(settings.local_capacity_bytes),
            shared,
            EntryCodec::new(settings.compression_threshold_bytes).with_max_decoded_bytes(
                usize::try_from(settings.local_capacity_bytes).unwrap_or(usize::MAX),
            ),
            clock,
            Arc::clone(&metrics),
        ));

        let lock = KeyLock::new(locks, LOCK_NAMESPACE, settings.lock_ttl(), Arc::clone(&metrics));
        let refresh_pool = Arc::new(WorkerPool::new(
            "revalidation",
            settings.max_background_refreshes,
            &cancel,
        ));

        let guard = StampedeGuard::new(
            Arc::clone(&cache),
            lock,
            Arc::clone(&refresh_pool),
            GuardConfig::from(&settings),
        );
        let scheduler = RevalidationScheduler::new(
            guard.clone(),
            Arc::clone(&refresh_pool),
            RevalidationConfig::from(&settings),
        );
        let warming = Arc::new(WarmingEngine::new(
            guard.clone(),
            registry,
            WarmingConfig::from(&settings),
        ));
        let router = Arc::new(InvalidationRouter::with_rules(
            Arc::clone(&cache),
            settings.size_pressure_threshold_bytes,
            self.rules.unwrap_or_else(InvalidationRule::defaults),
        ));

        info!(
            fresh_ttl = settings.fresh_ttl_seconds,
            local_capacity = settings.local_capacity_bytes,
            warming_workers = settings.max_concurrent_warming_workers,
            background_refreshes = settings.max_background_refreshes,
            "cache subsystem initialized"
        );

        Ok(CacheSubsystem {
            settings,
            metrics,
            cache,
            guard,
            scheduler,
            warming,
            router,
            refresh_pool,
            cancel,
            tasks: TaskTracker::new(),
        })
    }
}

// =============================================================================
// Subsystem
// =============================================================================

/// Fully wired caching subsystem
pub struct CacheSubsystem {
    settings: CacheSettings,
    metrics: Arc<CacheMetrics>,
    cache: Arc<TieredCache>,
    guard: StampedeGuard,
    scheduler: RevalidationScheduler,
    warming: Arc<WarmingEngine>,
    router: Arc<InvalidationRouter>,
    refresh_pool: Arc<WorkerPool>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl CacheSubsystem {
    pub fn builder(settings: CacheSettings) -> CacheSubsystemBuilder {
        CacheSubsystemBuilder {
            settings,
            clock: None,
            shared: None,
            registry: None,
            rules: None,
        }
    }

    /// Subsystem with in-process defaults for every collaborator
    pub fn new(settings: CacheSettings) -> Result<Self> {
        Self::builder(settings).build()
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    pub fn guard(&self) -> &StampedeGuard {
        &self.guard
    }

    pub fn scheduler(&self) -> &RevalidationScheduler {
        &self.scheduler
    }

    pub fn warming(&self) -> &Arc<WarmingEngine> {
        &self.warming
    }

    pub fn router(&self) -> &Arc<InvalidationRouter> {
        &self.router
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Options using the configured default TTL pair
    pub fn default_options(&self) -> GetOptions {
        GetOptions::new(self.settings.default_ttl())
    }

    // -------------------------------------------------------------------------
    // Request path
    // -------------------------------------------------------------------------

    /// Stale-while-revalidate read with the default TTL
    pub async fn get(&self, pattern: &str, key: &str, fetcher: &Fetcher) -> Result<Revalidated> {
        let options = self.default_options();
        self.scheduler
            .get(&CacheKey::new(pattern, key), fetcher, &options)
            .await
    }

    /// Read that never fails: a source failure on a cold key serves `fallback`
    pub async fn get_with_fallback(
        &self,
        pattern: &str,
        key: &str,
        fetcher: &Fetcher,
        fallback: Value,
    ) -> Revalidated {
        let options = self.default_options();
        self.scheduler
            .get_with_fallback(&CacheKey::new(pattern, key), fetcher, &options, fallback)
            .await
    }

    pub async fn invalidate(
        &self,
        pattern: &str,
        key: &str,
        reason: InvalidationReason,
        metadata: &InvalidationMetadata,
    ) -> InvalidationOutcome {
        self.router
            .invalidate(&CacheKey::new(pattern, key), reason, metadata)
            .await
    }

    pub async fn invalidate_by_service_event(&self, event: &ServiceEvent) -> InvalidationOutcome {
        self.router.invalidate_by_service_event(event).await
    }

    // -------------------------------------------------------------------------
    // Background tasks
    // -------------------------------------------------------------------------

    /// Register the configured warming catalog; `source` builds each item's
    /// fetcher. Returns the number of items registered.
    pub fn register_warming_catalog<F>(&self, source: F) -> usize
    where
        F: Fn(&WarmingItemSettings) -> Fetcher,
    {
        let catalog = &self.settings.warming;
        let item = |entry: &WarmingItemSettings| {
            let ttl = entry
                .fresh_ttl_seconds
                .map(|secs| self.settings.ttl_for(Duration::from_secs(secs)))
                .unwrap_or_else(|| self.settings.default_ttl());
            WarmingItem::new(&entry.pattern, &entry.key, entry.priority, source(entry))
                .with_policy(EntryPolicy::new(ttl).with_tags(entry.tags.iter().cloned()))
        };

        for entry in &catalog.critical {
            self.warming.register_critical(item(entry));
        }
        for (name, items) in &catalog.sources {
            self.warming.register_source(name, items.iter().map(item).collect());
        }
        for (signal, items) in &catalog.predictive {
            self.warming.register_predictive(*signal, items.iter().map(item).collect());
        }

        let registered = catalog.len();
        info!(
            registered,
            sources = catalog.sources.len(),
            "warming catalog registered"
        );
        registered
    }

    /// Start the warming sweep and health loops
    pub fn spawn_warming(&self) {
        let engine = Arc::clone(&self.warming);
        self.tasks.spawn(engine.run(self.cancel.child_token()));
    }

    /// Start consuming pushed invalidation events; returns the producer side
    pub fn spawn_invalidation_consumer(&self, capacity: usize) -> mpsc::Sender<InvalidationEvent> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let router = Arc::clone(&self.router);
        self.tasks.spawn(router.consume(rx, self.cancel.child_token()));
        tx
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Readiness: shared tier reachability, cascade state and queue sizes
    pub async fn health(&self) -> HealthReport {
        let inputs = HealthInputs {
            shared_tier_reachable: self.cache.shared_tier_available().await,
            cascading_failure: self.warming.in_cascade(),
            shut_down: self.cancel.is_cancelled(),
            pending_deletes: self.cache.pending_delete_count(),
            warming_queue_depth: self.warming.queue_depth(),
            revalidations_in_flight: self.scheduler.in_flight(),
            local_entries: self.cache.local_len(),
            local_utilization: self.cache.local_utilization(),
            refreshes_running: self.refresh_pool.running(),
        };
        HealthReport::evaluate(inputs, self.metrics.snapshot())
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel background loops and in-flight refreshes, then wait for them
    pub async fn shutdown(&self) {
        info!("shutting down cache subsystem");
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        self.refresh_pool.shutdown().await;
        info!("cache subsystem stopped");
    }
}

// =============================================================================
// Tests
// =============================================================================
