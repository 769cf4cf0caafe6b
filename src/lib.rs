//! CoucheCache - Multi-Tier Adaptive Caching
//!
//! Serves frequently-read, expensive-to-compute data with low latency while
//! protecting the source of truth from overload.
//!
//! # Architecture
//!
//! ```text
//! Revalidation Scheduler → Stampede Guard → Tiered Cache Core
//!        (stale-while-revalidate)  (single-flight)   (local + shared)
//!
//! Warming Engine ──────────┘        Invalidation Router ──┘
//! ```
//!
//! # Features
//!
//! - Two-tier cache with independent fresh and stale windows
//! - Single-flight fetches through TTL-bounded key locks
//! - Background revalidation with bounded retries and fallbacks
//! - Priority, health-gated, predictive and emergency warming
//! - Immediate, lazy, size-selective and cascading invalidation
//! - Redis shared tier with LZ4-compressed payloads
//! - Prometheus metrics
//!
//! # Modules
//!
//! - [`adapters`] - Redis and in-memory shared tiers, HTTP sources, service registries, Prometheus exporter
//! - [`cache`] - Tiered cache core, entries, codec, counters
//! - [`clock`] - Injectable time source
//! - [`config`] - Subsystem settings
//! - [`domain`] - Ports and events
//! - [`error`] - Error types
//! - [`guard`] - Stampede guard
//! - [`health`] - Readiness reporting
//! - [`ingress`] - Pushed invalidations over HTTP
//! - [`invalidation`] - Invalidation router
//! - [`lock`] - Distributed key lock
//! - [`pool`] - Bounded background worker pool
//! - [`revalidation`] - Revalidation scheduler
//! - [`subsystem`] - Component wiring and lifecycle
//! - [`warming`] - Warming engine

pub mod adapters;
pub mod cache;
pub mod clock;
pub mod config;
pub mod domain;
pub mod error;
pub mod guard;
pub mod health;
pub mod ingress;
pub mod invalidation;
pub mod lock;
pub mod pool;
pub mod revalidation;
pub mod subsystem;
pub mod warming;

// Re-export commonly used types
pub use cache::{CacheKey, EntryState, MetricsSnapshot, TieredCache, Ttl};
pub use config::CacheSettings;
pub use domain::{fetcher, Fetcher, InvalidationEvent, InvalidationReason, ServiceEvent};
pub use error::{Error, Result};
pub use guard::{EntryPolicy, StampedeGuard};
pub use health::{HealthReport, HealthStatus};
pub use invalidation::{InvalidationOutcome, InvalidationRouter, InvalidationRule};
pub use revalidation::{GetOptions, Revalidated, RevalidationScheduler};
pub use subsystem::CacheSubsystem;
pub use warming::{WarmingEngine, WarmingItem, WarmingPriority};
