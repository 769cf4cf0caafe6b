//! Tiered Cache Core
//!
//! Two-level cache with per-entry fresh/stale expiry.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        TieredCache                            │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Local Tier (in-process)      │  Shared Tier (out-of-process) │
//! │  ┌────────────────────────┐   │  ┌─────────────────────────┐  │
//! │  │ DashMap + byte budget  │   │  │ SharedTier port          │  │
//! │  │ watermark eviction     │   │  │ LZ4 envelope (codec)     │  │
//! │  └────────────────────────┘   │  └─────────────────────────┘  │
//! │              ▲  back-fill on shared hit  │                     │
//! │              └───────────────────────────┘                     │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Entry lifecycle: `Fresh → (fresh ttl) → Stale → (stale ttl) → Absent`.

mod codec;
mod entry;
mod local;
mod metrics;
mod tiered;

pub use codec::{CompressionAlgorithm, EntryCodec};
pub use entry::{glob_match, CacheEntry, CacheKey, EntryState, Ttl};
pub use local::{LocalTier, LocalTierConfig};
pub use metrics::{CacheMetrics, LatencyTracker, MetricsSnapshot};
pub use tiered::{Lookup, TieredCache, Tier, WriteOutcome};
