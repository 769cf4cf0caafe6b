//! Cache Metrics Collection
//!
//! Read-only counters polled by an external exporter. All counters are
//! lock-free atomics shared by every component of the subsystem.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::domain::events::InvalidationReason;

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    // Lookup outcomes
    fresh_hits: AtomicU64,
    stale_hits: AtomicU64,
    misses: AtomicU64,
    local_hits: AtomicU64,
    shared_hits: AtomicU64,

    // Upstream
    source_fetches: AtomicU64,
    source_failures: AtomicU64,
    stampede_prevented: AtomicU64,
    lock_timeouts: AtomicU64,
    early_refreshes: AtomicU64,
    fallbacks_served: AtomicU64,

    // Background revalidation
    revalidations_started: AtomicU64,
    revalidations_failed: AtomicU64,

    // Shared tier health
    shared_tier_errors: AtomicU64,
    shared_read_latency_us: AtomicU64,

    // Invalidation, indexed by reason
    invalidations: [AtomicU64; 4],
    lazy_removals: AtomicU64,

    // Warming
    warmed: AtomicU64,
    warming_failures: AtomicU64,
    warming_skipped: AtomicU64,

    // Gauges
    queue_depth: AtomicU64,
    active_locks: AtomicU64,
    cached_bytes: AtomicU64,
}

fn reason_index(reason: InvalidationReason) -> usize {
    match reason {
        InvalidationReason::DataUpdated => 0,
        InvalidationReason::LowUsage => 1,
        InvalidationReason::SizePressure => 2,
        InvalidationReason::DependencyChange => 3,
    }
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_fresh_hit(&self) {
        self.fresh_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_hit(&self) {
        self.stale_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_local_hit(&self) {
        self.local_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_shared_hit(&self) {
        self.shared_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_source_fetch(&self) {
        self.source_fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_source_failure(&self) {
        self.source_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stampede_prevented(&self) {
        self.stampede_prevented.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_timeout(&self) {
        self.lock_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_early_refresh(&self) {
        self.early_refreshes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback_served(&self) {
        self.fallbacks_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_revalidation_started(&self) {
        self.revalidations_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_revalidation_failed(&self) {
        self.revalidations_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_shared_tier_error(&self) {
        self.shared_tier_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalidation(&self, reason: InvalidationReason) {
        self.invalidations[reason_index(reason)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lazy_removal(&self) {
        self.lazy_removals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_warmed(&self) {
        self.warmed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_warming_failure(&self) {
        self.warming_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_warming_skipped(&self) {
        self.warming_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.store(depth as u64, Ordering::Relaxed);
    }

    pub fn lock_acquired(&self) {
        self.active_locks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn lock_released(&self) {
        // Saturating: a lock lost to TTL expiry may be released twice
        let _ = self
            .active_locks
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }

    pub fn set_cached_bytes(&self, bytes: u64) {
        self.cached_bytes.store(bytes, Ordering::Relaxed);
    }

    pub fn record_shared_read_latency(&self, duration: Duration) {
        let new_us = duration.as_micros() as u64;
        let alpha = 0.1; // EMA smoothing factor

        loop {
            let current = self.shared_read_latency_us.load(Ordering::Relaxed);
            let updated = if current == 0 {
                new_us
            } else {
                ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
            };

            if self
                .shared_read_latency_us
                .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    pub fn fresh_hits(&self) -> u64 {
        self.fresh_hits.load(Ordering::Relaxed)
    }

    pub fn stale_hits(&self) -> u64 {
        self.stale_hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn source_fetches(&self) -> u64 {
        self.source_fetches.load(Ordering::Relaxed)
    }

    pub fn stampede_prevented(&self) -> u64 {
        self.stampede_prevented.load(Ordering::Relaxed)
    }

    pub fn revalidations_started(&self) -> u64 {
        self.revalidations_started.load(Ordering::Relaxed)
    }

    pub fn invalidations(&self, reason: InvalidationReason) -> u64 {
        self.invalidations[reason_index(reason)].load(Ordering::Relaxed)
    }

    pub fn active_locks(&self) -> u64 {
        self.active_locks.load(Ordering::Relaxed)
    }

    pub fn queue_depth(&self) -> u64 {
        self.queue_depth.load(Ordering::Relaxed)
    }

    pub fn shared_read_latency(&self) -> Duration {
        Duration::from_micros(self.shared_read_latency_us.load(Ordering::Relaxed))
    }

    /// Servable hits over all lookups
    pub fn hit_ratio(&self) -> f64 {
        let hits = (self.fresh_hits() + self.stale_hits()) as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            fresh_hits: self.fresh_hits(),
            stale_hits: self.stale_hits(),
            misses: self.misses(),
            local_hits: load(&self.local_hits),
            shared_hits: load(&self.shared_hits),
            hit_ratio: self.hit_ratio(),

            source_fetches: self.source_fetches(),
            source_failures: load(&self.source_failures),
            stampede_prevented: self.stampede_prevented(),
            lock_timeouts: load(&self.lock_timeouts),
            early_refreshes: load(&self.early_refreshes),
            fallbacks_served: load(&self.fallbacks_served),

            revalidations_started: self.revalidations_started(),
            revalidations_failed: load(&self.revalidations_failed),

            shared_tier_errors: load(&self.shared_tier_errors),
            shared_read_latency_us: load(&self.shared_read_latency_us),

            invalidations_data_updated: self.invalidations(InvalidationReason::DataUpdated),
            invalidations_low_usage: self.invalidations(InvalidationReason::LowUsage),
            invalidations_size_pressure: self.invalidations(InvalidationReason::SizePressure),
            invalidations_dependency_change: self
                .invalidations(InvalidationReason::DependencyChange),
            lazy_removals: load(&self.lazy_removals),

            warmed: load(&self.warmed),
            warming_failures: load(&self.warming_failures),
            warming_skipped: load(&self.warming_skipped),

            queue_depth: self.queue_depth(),
            active_locks: self.active_locks(),
            cached_bytes: load(&self.cached_bytes),
        }
    }
}

/// Snapshot of all cache metrics
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    // Lookups
    pub fresh_hits: u64,
    pub stale_hits: u64,
    pub misses: u64,
    pub local_hits: u64,
    pub shared_hits: u64,
    pub hit_ratio: f64,

    // Upstream
    pub source_fetches: u64,
    pub source_failures: u64,
    pub stampede_prevented: u64,
    pub lock_timeouts: u64,
    pub early_refreshes: u64,
    pub fallbacks_served: u64,

    // Revalidation
    pub revalidations_started: u64,
    pub revalidations_failed: u64,

    // Shared tier
    pub shared_tier_errors: u64,
    pub shared_read_latency_us: u64,

    // Invalidation
    pub invalidations_data_updated: u64,
    pub invalidations_low_usage: u64,
    pub invalidations_size_pressure: u64,
    pub invalidations_dependency_change: u64,
    pub lazy_removals: u64,

    // Warming
    pub warmed: u64,
    pub warming_failures: u64,
    pub warming_skipped: u64,

    // Gauges
    pub queue_depth: u64,
    pub active_locks: u64,
    pub cached_bytes: u64,
}

/// Latency tracker helper
pub struct LatencyTracker {
    start: Instant,
}

impl LatencyTracker {
    /// Start tracking latency
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

// =============================================================================
// Tests
// =============================================================================
