//! Prometheus Exporter
//!
//! Mirrors [`MetricsSnapshot`]s into a private prometheus registry and
//! renders the text exposition format for `/metrics`.

use prometheus::{
    Encoder, Gauge, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

use crate::cache::MetricsSnapshot;
use crate::error::Result;

const NAMESPACE: &str = "couchecache";

/// Prometheus view of the cache counters
pub struct PrometheusExporter {
    registry: Registry,

    lookups: IntCounterVec,
    tier_hits: IntCounterVec,
    source_fetches: IntCounter,
    source_failures: IntCounter,
    stampede_prevented: IntCounter,
    lock_timeouts: IntCounter,
    early_refreshes: IntCounter,
    fallbacks_served: IntCounter,
    revalidations: IntCounterVec,
    shared_tier_errors: IntCounter,
    invalidations: IntCounterVec,
    lazy_removals: IntCounter,
    warming: IntCounterVec,

    hit_ratio: Gauge,
    shared_read_latency: Gauge,
    queue_depth: IntGauge,
    active_locks: IntGauge,
    cached_bytes: IntGauge,
}

fn opts(name: &str, help: &str) -> Opts {
    Opts::new(name, help).namespace(NAMESPACE)
}

impl PrometheusExporter {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let lookups = IntCounterVec::new(
            opts("lookups_total", "Cache lookups by result"),
            &["result"],
        )?;
        let tier_hits = IntCounterVec::new(
            opts("tier_hits_total", "Cache hits by serving tier"),
            &["tier"],
        )?;
        let source_fetches = IntCounter::with_opts(opts(
            "source_fetches_total",
            "Calls made to upstream fetchers",
        ))?;
        let source_failures = IntCounter::with_opts(opts(
            "source_failures_total",
            "Upstream fetcher calls that failed or timed out",
        ))?;
        let stampede_prevented = IntCounter::with_opts(opts(
            "stampede_prevented_total",
            "Callers that waited on another caller's fetch",
        ))?;
        let lock_timeouts = IntCounter::with_opts(opts(
            "lock_timeouts_total",
            "Lock waits that timed out and fell through to a direct fetch",
        ))?;
        let early_refreshes = IntCounter::with_opts(opts(
            "early_refreshes_total",
            "Background refreshes triggered before fresh expiry",
        ))?;
        let fallbacks_served = IntCounter::with_opts(opts(
            "fallbacks_served_total",
            "Fallback values served after a source failure",
        ))?;
        let revalidations = IntCounterVec::new(
            opts("revalidations_total", "Background revalidations by outcome"),
            &["outcome"],
        )?;
        let shared_tier_errors = IntCounter::with_opts(opts(
            "shared_tier_errors_total",
            "Failed shared tier operations",
        ))?;
        let invalidations = IntCounterVec::new(
            opts("invalidations_total", "Invalidations by reason"),
            &["reason"],
        )?;
        let lazy_removals = IntCounter::with_opts(opts(
            "lazy_removals_total",
            "Lazily invalidated entries removed on access",
        ))?;
        let warming = IntCounterVec::new(
            opts("warming_total", "Warming attempts by outcome"),
            &["outcome"],
        )?;

        let hit_ratio = Gauge::with_opts(opts("hit_ratio", "Fresh and stale hits over lookups"))?;
        let shared_read_latency = Gauge::with_opts(opts(
            "shared_read_latency_seconds",
            "Moving average of shared tier read latency",
        ))?;
        let queue_depth = IntGauge::with_opts(opts("warming_queue_depth", "Queued warming items"))?;
        let active_locks = IntGauge::with_opts(opts("active_locks", "Stampede locks held"))?;
        let cached_bytes = IntGauge::with_opts(opts(
            "local_cached_bytes",
            "Approximate bytes held in the local tier",
        ))?;

        registry.register(Box::new(lookups.clone()))?;
        registry.register(Box::new(tier_hits.clone()))?;
        registry.register(Box::new(source_fetches.clone()))?;
        registry.register(Box::new(source_failures.clone()))?;
        registry.register(Box::new(stampede_prevented.clone()))?;
        registry.register(Box::new(lock_timeouts.clone()))?;
        registry.register(Box::new(early_refreshes.clone()))?;
        registry.register(Box::new(fallbacks_served.clone()))?;
        registry.register(Box::new(revalidations.clone()))?;
        registry.register(Box::new(shared_tier_errors.clone()))?;
        registry.register(Box::new(invalidations.clone()))?;
        registry.register(Box::new(lazy_removals.clone()))?;
        registry.register(Box::new(warming.clone()))?;
        registry.register(Box::new(hit_ratio.clone()))?;
        registry.register(Box::new(shared_read_latency.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(active_locks.clone()))?;
        registry.register(Box::new(cached_bytes.clone()))?;

        Ok(Self {
            registry,
            lookups,
            tier_hits,
            source_fetches,
            source_failures,
            stampede_prevented,
            lock_timeouts,
            early_refreshes,
            fallbacks_served,
            revalidations,
            shared_tier_errors,
            invalidations,
            lazy_removals,
            warming,
            hit_ratio,
            shared_read_latency,
            queue_depth,
            active_locks,
            cached_bytes,
        })
    }

    /// Bring every exported series up to date with `snapshot`
    pub fn update(&self, snapshot: &MetricsSnapshot) {
        advance(&self.lookups.with_label_values(&["fresh"]), snapshot.fresh_hits);
        advance(&self.lookups.with_label_values(&["stale"]), snapshot.stale_hits);
        advance(&self.lookups.with_label_values(&["miss"]), snapshot.misses);
        advance(&self.tier_hits.with_label_values(&["local"]), snapshot.local_hits);
        advance(&self.tier_hits.with_label_values(&["shared"]), snapshot.shared_hits);

        advance(&self.source_fetches, snapshot.source_fetches);
        advance(&self.source_failures, snapshot.source_failures);
        advance(&self.stampede_prevented, snapshot.stampede_prevented);
        advance(&self.lock_timeouts, snapshot.lock_timeouts);
        advance(&self.early_refreshes, snapshot.early_refreshes);
        advance(&self.fallbacks_served, snapshot.fallbacks_served);

        advance(&self.revalidations.with_label_values(&["started"]), snapshot.revalidations_started);
        advance(&self.revalidations.with_label_values(&["failed"]), snapshot.revalidations_failed);
        advance(&self.shared_tier_errors, snapshot.shared_tier_errors);

        let by_reason = [
            ("data_updated", snapshot.invalidations_data_updated),
            ("low_usage", snapshot.invalidations_low_usage),
            ("size_pressure", snapshot.invalidations_size_pressure),
            ("dependency_change", snapshot.invalidations_dependency_change),
        ];
        for (reason, value) in by_reason {
            advance(&self.invalidations.with_label_values(&[reason]), value);
        }
        advance(&self.lazy_removals, snapshot.lazy_removals);

        advance(&self.warming.with_label_values(&["warmed"]), snapshot.warmed);
        advance(&self.warming.with_label_values(&["failed"]), snapshot.warming_failures);
        advance(&self.warming.with_label_values(&["skipped"]), snapshot.warming_skipped);

        self.hit_ratio.set(snapshot.hit_ratio);
        self.shared_read_latency
            .set(snapshot.shared_read_latency_us as f64 / 1_000_000.0);
        self.queue_depth.set(clamp(snapshot.queue_depth));
        self.active_locks.set(clamp(snapshot.active_locks));
        self.cached_bytes.set(clamp(snapshot.cached_bytes));
    }

    /// Render the text exposition format
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| crate::error::Error::Internal(format!("Non UTF-8 metrics output: {}", e)))
    }

    pub fn content_type(&self) -> &'static str {
        prometheus::TEXT_FORMAT
    }
}

/// Move a counter forward to `value`; counters never go backwards
fn advance(counter: &IntCounter, value: u64) {
    let current = counter.get();
    if value > current {
        counter.inc_by(value - current);
    }
}

fn clamp(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

impl std::fmt::Debug for PrometheusExporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusExporter").finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
