//! Warming Engine
//!
//! Populates the cache ahead of demand.
//!
//! - **Queue**: priority-ordered (critical > high > medium > low, FIFO within
//!   a priority), drained by a fixed number of workers that skip keys which
//!   already hold a fresh entry.
//! - **Health-gated**: per-source items are only queued while the source's
//!   service reports healthy.
//! - **Predictive**: coarse usage signals (morning peak, weekend, ...) map to
//!   fixed item lists.
//! - **Emergency**: the critical list is refreshed immediately, bypassing the
//!   queue, when the registry recovers from a cascading failure.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cache::{CacheKey, CacheMetrics, TieredCache};
use crate::config::CacheSettings;
use crate::domain::ports::{Fetcher, ServiceRegistry};
use crate::guard::{EntryPolicy, StampedeGuard};

// =============================================================================
// Configuration
// =============================================================================

/// Warming engine configuration
#[derive(Debug, Clone)]
pub struct WarmingConfig {
    /// Concurrent warming workers
    pub workers: usize,
    /// Policy for items that do not carry their own
    pub default_policy: EntryPolicy,
    /// Cadence of the critical-key sweep
    pub critical_sweep_interval: Duration,
    /// Cadence of registry health polling
    pub health_check_interval: Duration,
    /// Unhealthy-source ratio treated as a cascading failure
    pub cascading_failure_ratio: f64,
}

impl From<&CacheSettings> for WarmingConfig {
    fn from(settings: &CacheSettings) -> Self {
        Self {
            workers: settings.max_concurrent_warming_workers,
            default_policy: EntryPolicy::new(settings.default_ttl()),
            critical_sweep_interval: settings.critical_sweep_interval(),
            health_check_interval: settings.health_check_interval(),
            cascading_failure_ratio: settings.cascading_failure_ratio,
        }
    }
}

impl Default for WarmingConfig {
    fn default() -> Self {
        Self::from(&CacheSettings::default())
    }
}

// =============================================================================
// Warming Items
// =============================================================================

/// Warming priority; higher variants are processed first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WarmingPriority {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for WarmingPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WarmingPriority::Low => "low",
            WarmingPriority::Medium => "medium",
            WarmingPriority::High => "high",
            WarmingPriority::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// A key to populate ahead of demand
#[derive(Clone)]
pub struct WarmingItem {
    pub pattern: String,
    pub key: String,
    pub priority: WarmingPriority,
    /// Upstream service the fetcher depends on
    pub source: Option<String>,
    /// Overrides the engine's default policy
    pub policy: Option<EntryPolicy>,
    pub fetcher: Fetcher,
}

impl WarmingItem {
    pub fn new(
        pattern: impl Into<String>,
        key: impl Into<String>,
        priority: WarmingPriority,
        fetcher: Fetcher,
    ) -> Self {
        Self {
            pattern: pattern.into(),
            key: key.into(),
            priority,
            source: None,
            policy: None,
            fetcher,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_policy(mut self, policy: EntryPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn cache_key(&self) -> CacheKey {
        CacheKey::new(&self.pattern, &self.key)
    }
}

impl fmt::Debug for WarmingItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WarmingItem")
            .field("pattern", &self.pattern)
            .field("key", &self.key)
            .field("priority", &self.priority)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

/// Queue slot: priority first, then insertion order
struct Queued {
    seq: u64,
    item: WarmingItem,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.item
            .priority
            .cmp(&other.item.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

// =============================================================================
// Usage Signals
// =============================================================================

/// Coarse temporal demand signal for predictive warming
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageSignal {
    MorningPeak,
    LunchPeak,
    EveningPeak,
    WeekendPeak,
}

impl UsageSignal {
    /// Signals active at `at` (UTC hours)
    pub fn active_at(at: DateTime<Utc>) -> Vec<UsageSignal> {
        let mut signals = Vec::new();
        match at.hour() {
            7..=9 => signals.push(UsageSignal::MorningPeak),
            11..=13 => signals.push(UsageSignal::LunchPeak),
            17..=20 => signals.push(UsageSignal::EveningPeak),
            _ => {}
        }
        if matches!(at.weekday(), Weekday::Sat | Weekday::Sun) {
            signals.push(UsageSignal::WeekendPeak);
        }
        signals
    }
}

// =============================================================================
// Reports
// =============================================================================

/// Outcome counts of a warming pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WarmingReport {
    pub warmed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl WarmingReport {
    pub fn total(&self) -> usize {
        self.warmed + self.skipped + self.failed
    }

    fn record(&mut self, outcome: WarmOutcome) {
        match outcome {
            WarmOutcome::Warmed => self.warmed += 1,
            WarmOutcome::Skipped => self.skipped += 1,
            WarmOutcome::Failed => self.failed += 1,
        }
    }

    fn merge(mut self, other: WarmingReport) -> Self {
        self.warmed += other.warmed;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WarmOutcome {
    Warmed,
    Skipped,
    Failed,
}

/// Registry health across catalogued sources
#[derive(Debug, Clone, Default, Serialize)]
pub struct SourceHealth {
    pub healthy: Vec<String>,
    pub unhealthy: Vec<String>,
}

impl SourceHealth {
    pub fn unhealthy_ratio(&self) -> f64 {
        let total = self.healthy.len() + self.unhealthy.len();
        if total == 0 {
            0.0
        } else {
            self.unhealthy.len() as f64 / total as f64
        }
    }
}

// =============================================================================
// Catalog
// =============================================================================

/// Known warming items, registered at startup
#[derive(Default)]
struct WarmingCatalog {
    critical: Vec<WarmingItem>,
    by_source: HashMap<String, Vec<WarmingItem>>,
    predictive: HashMap<UsageSignal, Vec<WarmingItem>>,
}

// =============================================================================
// Warming Engine
// =============================================================================

/// Proactive cache population
pub struct WarmingEngine {
    guard: StampedeGuard,
    registry: Arc<dyn ServiceRegistry>,
    config: WarmingConfig,
    queue: Mutex<BinaryHeap<Queued>>,
    seq: AtomicU64,
    catalog: RwLock<WarmingCatalog>,
    /// Set while the registry reports a cascading failure
    in_cascade: AtomicBool,
}

impl WarmingEngine {
    pub fn new(
        guard: StampedeGuard,
        registry: Arc<dyn ServiceRegistry>,
        config: WarmingConfig,
    ) -> Self {
        Self {
            guard,
            registry,
            config,
            queue: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
            catalog: RwLock::new(WarmingCatalog::default()),
            in_cascade: AtomicBool::new(false),
        }
    }

    fn cache(&self) -> &Arc<TieredCache> {
        self.guard.cache()
    }

    fn metrics(&self) -> &Arc<CacheMetrics> {
        self.cache().metrics()
    }

    // -------------------------------------------------------------------------
    // Catalog
    // -------------------------------------------------------------------------

    /// Register an item for the scheduled sweep and emergency warming
    pub fn register_critical(&self, item: WarmingItem) {
        self.catalog.write().critical.push(item);
    }

    /// Register items that depend on an upstream service
    pub fn register_source(&self, source: &str, items: Vec<WarmingItem>) {
        let items = items.into_iter().map(|i| i.with_source(source));
        self.catalog
            .write()
            .by_source
            .entry(source.to_string())
            .or_default()
            .extend(items);
    }

    /// Register items warmed while a usage signal is active
    pub fn register_predictive(&self, signal: UsageSignal, items: Vec<WarmingItem>) {
        self.catalog
            .write()
            .predictive
            .entry(signal)
            .or_default()
            .extend(items);
    }

    pub fn sources(&self) -> Vec<String> {
        self.catalog.read().by_source.keys().cloned().collect()
    }

    // -------------------------------------------------------------------------
    // Queue
    // -------------------------------------------------------------------------

    /// Add items to the warming queue
    pub fn enqueue(&self, items: impl IntoIterator<Item = WarmingItem>) {
        let mut queue = self.queue.lock();
        for item in items {
            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            queue.push(Queued { seq, item });
        }
        self.metrics().set_queue_depth(queue.len());
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.lock().len()
    }

    fn pop(&self) -> Option<WarmingItem> {
        let mut queue = self.queue.lock();
        let next = queue.pop().map(|q| q.item);
        self.metrics().set_queue_depth(queue.len());
        next
    }

    /// Drain the queue with the configured number of workers
    #[instrument(skip(self))]
    pub async fn process_queue(&self) -> WarmingReport {
        let mut workers = FuturesUnordered::new();
        for _ in 0..self.config.workers.max(1) {
            workers.push(self.drain());
        }

        let mut report = WarmingReport::default();
        while let Some(worker) = workers.next().await {
            report = report.merge(worker);
        }

        if report.total() > 0 {
            info!(
                warmed = report.warmed,
                skipped = report.skipped,
                failed = report.failed,
                "warming queue processed"
            );
        }
        report
    }

    /// One worker: pop until the queue is empty
    async fn drain(&self) -> WarmingReport {
        let mut report = WarmingReport::default();
        while let Some(item) = self.pop() {
            report.record(self.warm_item(item, false).await);
        }
        report
    }

    async fn warm_item(&self, item: WarmingItem, force: bool) -> WarmOutcome {
        let key = item.cache_key();

        if !force && self.cache().inspect(&key).await.is_fresh() {
            debug!(%key, "already fresh, skipping");
            self.metrics().record_warming_skipped();
            return WarmOutcome::Skipped;
        }

        let policy = item.policy.unwrap_or_else(|| self.config.default_policy.clone());
        match self.guard.try_refresh(&key, &item.fetcher, &policy).await {
            Ok(true) => {
                debug!(%key, priority = %item.priority, "warmed");
                self.metrics().record_warmed();
                WarmOutcome::Warmed
            }
            Ok(false) => {
                self.metrics().record_warming_skipped();
                WarmOutcome::Skipped
            }
            Err(e) => {
                warn!(%key, priority = %item.priority, error = %e, "warming failed");
                self.metrics().record_warming_failure();
                WarmOutcome::Failed
            }
        }
    }

    // -------------------------------------------------------------------------
    // Strategies
    // -------------------------------------------------------------------------

    /// Query the registry for every catalogued source
    pub async fn source_health(&self) -> SourceHealth {
        let mut health = SourceHealth::default();
        for source in self.sources() {
            match self.registry.is_healthy(&source).await {
                Ok(true) => health.healthy.push(source),
                Ok(false) => health.unhealthy.push(source),
                Err(e) => {
                    warn!(%source, error = %e, "health lookup failed, treating as unhealthy");
                    health.unhealthy.push(source);
                }
            }
        }
        health
    }

    /// Queue items only for sources that currently report healthy, then drain
    #[instrument(skip(self))]
    pub async fn warm_based_on_health(&self) -> WarmingReport {
        let health = self.source_health().await;
        if !health.unhealthy.is_empty() {
            info!(unhealthy = ?health.unhealthy, "skipping warming for unhealthy sources");
        }

        let items: Vec<WarmingItem> = {
            let catalog = self.catalog.read();
            health
                .healthy
                .iter()
                .filter_map(|source| catalog.by_source.get(source))
                .flatten()
                .cloned()
                .collect()
        };
        self.enqueue(items);
        self.process_queue().await
    }

    /// Queue the items mapped to the given usage signals, then drain
    #[instrument(skip(self))]
    pub async fn warm_predictively(&self, signals: &[UsageSignal]) -> WarmingReport {
        let items: Vec<WarmingItem> = {
            let catalog = self.catalog.read();
            let mut seen = HashSet::new();
            signals
                .iter()
                .filter_map(|signal| catalog.predictive.get(signal))
                .flatten()
                .filter(|item| seen.insert(item.cache_key()))
                .cloned()
                .collect()
        };
        debug!(items = items.len(), "predictive warming");
        self.enqueue(items);
        self.process_queue().await
    }

    /// Refresh every critical item now, bypassing the queue
    #[instrument(skip(self))]
    pub async fn emergency_warm(&self) -> WarmingReport {
        let items: Vec<WarmingItem> = self.catalog.read().critical.clone();
        warn!(items = items.len(), "emergency warming critical keys");

        let limit = self.config.workers.max(1);
        let mut pending = items.into_iter();
        let mut in_flight = FuturesUnordered::new();
        for item in pending.by_ref().take(limit) {
            in_flight.push(self.warm_item(item, true));
        }

        let mut report = WarmingReport::default();
        while let Some(outcome) = in_flight.next().await {
            report.record(outcome);
            if let Some(item) = pending.next() {
                in_flight.push(self.warm_item(item, true));
            }
        }

        info!(warmed = report.warmed, failed = report.failed, "emergency warming complete");
        report
    }

    /// Scheduled sweep: critical keys, active usage signals, healthy sources
    pub async fn sweep(&self) -> WarmingReport {
        let critical = self.catalog.read().critical.clone();
        self.enqueue(critical);

        let signals = UsageSignal::active_at(self.cache().clock().now());
        let predictive = self.warm_predictively(&signals).await;
        predictive.merge(self.warm_based_on_health().await)
    }

    /// Poll registry health; run emergency warming on recovery from a cascade.
    ///
    /// Returns the emergency report when one ran.
    pub async fn check_health(&self) -> Option<WarmingReport> {
        let health = self.source_health().await;
        let ratio = health.unhealthy_ratio();
        let cascading = !health.unhealthy.is_empty() && ratio >= self.config.cascading_failure_ratio;

        if cascading {
            if !self.in_cascade.swap(true, Ordering::SeqCst) {
                warn!(ratio, unhealthy = ?health.unhealthy, "cascading upstream failure detected");
            }
            None
        } else if self.in_cascade.swap(false, Ordering::SeqCst) {
            info!(ratio, "upstream sources recovered, pre-loading critical keys");
            Some(self.emergency_warm().await)
        } else {
            None
        }
    }

    pub fn in_cascade(&self) -> bool {
        self.in_cascade.load(Ordering::SeqCst)
    }

    /// Run the sweep and health loops until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut sweep = interval(self.config.critical_sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut health = interval(self.config.health_check_interval);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            sweep_interval = ?self.config.critical_sweep_interval,
            health_interval = ?self.config.health_check_interval,
            "warming engine started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sweep.tick() => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.sweep() => {}
                    }
                }
                _ = health.tick() => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.check_health() => {}
                    }
                }
            }
        }

        info!("warming engine stopped");
    }
}

// =============================================================================
// Tests
// =============================================================================
