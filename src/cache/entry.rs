//! Cache Entry Types
//!
//! Keys, TTL pairs, and entries with their fresh/stale expiry metadata.

use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock;

/// Cache key - composite of a logical pattern (namespace) and an opaque key
#[derive(Clone, Debug, Eq, Serialize, Deserialize)]
pub struct CacheKey {
    /// Logical namespace, e.g. "user" or "event"
    pattern: String,
    /// Opaque identifier within the namespace
    key: String,
}

impl CacheKey {
    /// Create a new cache key
    pub fn new(pattern: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            key: key.into(),
        }
    }

    /// Get the pattern (namespace)
    #[inline]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Get the key within the pattern
    #[inline]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Flat storage form `pattern:key`, used for shared-tier addressing and lock names
    pub fn storage_key(&self) -> String {
        format!("{}:{}", self.pattern, self.key)
    }

    /// Entity tag for this key; entries depending on it carry this tag
    pub fn entity_tag(&self) -> String {
        self.storage_key()
    }

    /// Check the key against a pattern expression (`*` matches any run of characters)
    pub fn matches(&self, pattern_expr: &str) -> bool {
        glob_match(pattern_expr, &self.pattern)
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern && self.key == other.key
    }
}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.pattern.hash(state);
        self.key.hash(state);
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.pattern, self.key)
    }
}

/// Match `text` against a glob with `*` wildcards
pub fn glob_match(glob: &str, text: &str) -> bool {
    if !glob.contains('*') {
        return glob == text;
    }

    let parts: Vec<&str> = glob.split('*').collect();
    let (first, rest) = match parts.split_first() {
        Some(split) => split,
        None => return text.is_empty(),
    };
    let Some(mut remaining) = text.strip_prefix(first) else {
        return false;
    };
    let (last, middle) = match rest.split_last() {
        Some(split) => split,
        None => return remaining.is_empty(),
    };

    for part in middle {
        if part.is_empty() {
            continue;
        }
        match remaining.find(part) {
            Some(idx) => remaining = &remaining[idx + part.len()..],
            None => return false,
        }
    }

    remaining.len() >= last.len() && remaining.ends_with(last)
}

// =============================================================================
// TTL
// =============================================================================

/// Fresh and stale windows, both measured from the write time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ttl {
    /// Entry is fresh for this long after being written
    pub fresh: Duration,
    /// Entry is servable (fresh or stale) for this long after being written
    pub stale: Duration,
}

impl Ttl {
    /// Create a TTL pair; the stale window is never shorter than the fresh window
    pub fn new(fresh: Duration, stale: Duration) -> Self {
        Self {
            fresh,
            stale: stale.max(fresh),
        }
    }

    /// Stale window derived as fresh × multiplier
    pub fn with_multiplier(fresh: Duration, multiplier: f64) -> Self {
        let stale = fresh.mul_f64(multiplier.max(1.0));
        Self::new(fresh, stale)
    }

    /// Seconds-based constructor
    pub fn secs(fresh: u64, stale: u64) -> Self {
        Self::new(Duration::from_secs(fresh), Duration::from_secs(stale))
    }
}

/// Freshness classification of a lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    /// Before fresh expiry; serve without side effects
    Fresh,
    /// Between fresh and stale expiry; serve but revalidate
    Stale,
    /// Past stale expiry or never written
    Absent,
}

impl std::fmt::Display for EntryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryState::Fresh => write!(f, "fresh"),
            EntryState::Stale => write!(f, "stale"),
            EntryState::Absent => write!(f, "absent"),
        }
    }
}

// =============================================================================
// Cache Entry
// =============================================================================

/// A cached value with its expiry metadata
#[derive(Debug)]
pub struct CacheEntry {
    /// Cached payload
    value: Arc<Value>,
    /// End of the fresh window
    fresh_expiry: DateTime<Utc>,
    /// End of the stale window (>= fresh_expiry)
    stale_expiry: DateTime<Utc>,
    /// Write time
    written_at: DateTime<Utc>,
    /// Approximate size in bytes (serialized length)
    size_bytes: u64,
    /// Dependency identifiers for cascading invalidation
    tags: BTreeSet<String>,
    /// Last access (millis since epoch), for local-tier eviction
    last_access_ms: AtomicI64,
    /// Access count, for local-tier eviction
    access_count: AtomicU32,
    /// Lazily invalidated: the next read removes it instead of serving it
    marked: bool,
}

impl CacheEntry {
    /// Create an entry written at `now` with the given TTL pair
    pub fn new(value: Value, ttl: Ttl, now: DateTime<Utc>, tags: BTreeSet<String>) -> Self {
        let size_bytes = serde_json::to_vec(&value)
            .map(|v| v.len() as u64)
            .unwrap_or(0);
        Self::from_parts(
            Arc::new(value),
            now,
            clock::add(now, ttl.fresh),
            clock::add(now, ttl.stale),
            size_bytes,
            tags,
        )
    }

    /// Rebuild an entry from stored parts (shared-tier back-fill)
    pub fn from_parts(
        value: Arc<Value>,
        written_at: DateTime<Utc>,
        fresh_expiry: DateTime<Utc>,
        stale_expiry: DateTime<Utc>,
        size_bytes: u64,
        tags: BTreeSet<String>,
    ) -> Self {
        Self {
            value,
            written_at,
            fresh_expiry,
            stale_expiry: stale_expiry.max(fresh_expiry),
            size_bytes,
            tags,
            last_access_ms: AtomicI64::new(written_at.timestamp_millis()),
            access_count: AtomicU32::new(0),
            marked: false,
        }
    }

    /// Same entry with the lazy-removal mark set or cleared
    pub fn with_mark(mut self, marked: bool) -> Self {
        self.marked = marked;
        self
    }

    #[inline]
    pub fn is_marked(&self) -> bool {
        self.marked
    }

    /// Classify the entry at `now`
    pub fn state_at(&self, now: DateTime<Utc>) -> EntryState {
        if now < self.fresh_expiry {
            EntryState::Fresh
        } else if now < self.stale_expiry {
            EntryState::Stale
        } else {
            EntryState::Absent
        }
    }

    /// Fraction of the fresh lifetime that has elapsed at `now` (0.0 at write, 1.0 at fresh expiry)
    pub fn fresh_elapsed_fraction(&self, now: DateTime<Utc>) -> f64 {
        let lifetime = (self.fresh_expiry - self.written_at).num_milliseconds();
        if lifetime <= 0 {
            return 1.0;
        }
        let elapsed = (now - self.written_at).num_milliseconds().max(0);
        elapsed as f64 / lifetime as f64
    }

    /// Time left in the stale window at `now`
    pub fn remaining_servable(&self, now: DateTime<Utc>) -> Duration {
        (self.stale_expiry - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// Cached payload
    #[inline]
    pub fn value(&self) -> &Arc<Value> {
        &self.value
    }

    #[inline]
    pub fn fresh_expiry(&self) -> DateTime<Utc> {
        self.fresh_expiry
    }

    #[inline]
    pub fn stale_expiry(&self) -> DateTime<Utc> {
        self.stale_expiry
    }

    #[inline]
    pub fn written_at(&self) -> DateTime<Utc> {
        self.written_at
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size_bytes
    }

    #[inline]
    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    /// Record an access and return the new count
    #[inline]
    pub fn record_access(&self, now: DateTime<Utc>) -> u32 {
        self.last_access_ms
            .store(now.timestamp_millis(), Ordering::Relaxed);
        self.access_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[inline]
    pub fn access_count(&self) -> u32 {
        self.access_count.load(Ordering::Relaxed)
    }

    /// Eviction score at `now` (higher = more evictable): idle time over frequency
    pub fn eviction_score(&self, now: DateTime<Utc>) -> f64 {
        let idle_ms = (now.timestamp_millis() - self.last_access_ms.load(Ordering::Relaxed)).max(0);
        idle_ms as f64 / (self.access_count() as f64 + 1.0)
    }
}

impl Clone for CacheEntry {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
            fresh_expiry: self.fresh_expiry,
            stale_expiry: self.stale_expiry,
            written_at: self.written_at,
            size_bytes: self.size_bytes,
            tags: self.tags.clone(),
            last_access_ms: AtomicI64::new(self.last_access_ms.load(Ordering::Relaxed)),
            access_count: AtomicU32::new(self.access_count.load(Ordering::Relaxed)),
            marked: self.marked,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
