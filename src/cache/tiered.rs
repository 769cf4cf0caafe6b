//! Tiered Cache Core
//!
//! Two-level read/write path: local tier → shared tier → absent.
//!
//! # Read path
//!
//! 1. Local tier (in-process, never suspends)
//! 2. Shared tier (out-of-process); a servable hit back-fills the local tier
//!    with the original fresh/stale expiry decoded from the envelope
//! 3. Absent
//!
//! # Write path
//!
//! Local first, shared second. Neither failure is fatal: a value that does
//! not fit locally is still written to the shared tier, and a shared-tier
//! failure leaves the local write standing.
//!
//! Shared-tier deletes that fail are remembered and retried before the next
//! write-through.
//!
//! # Lazy removal
//!
//! A lazily invalidated entry keeps its place in both tiers with a mark in
//! its envelope. Whichever instance reads it next deletes it and reports a
//! miss; an unread mark expires together with its entry.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use dashmap::DashSet;
use serde_json::Value;
use tracing::{debug, warn};

use super::codec::EntryCodec;
use super::entry::{CacheEntry, CacheKey, EntryState, Ttl};
use super::local::{LocalTier, LocalTierConfig};
use super::metrics::{CacheMetrics, LatencyTracker};
use crate::clock::Clock;
use crate::domain::ports::SharedTier;
use crate::error::{Error, Result};

/// Tier that satisfied a lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Local,
    Shared,
}

/// Result of a core lookup
#[derive(Debug, Clone)]
pub struct Lookup {
    pub state: EntryState,
    pub entry: Option<CacheEntry>,
    pub tier: Option<Tier>,
}

impl Lookup {
    fn absent() -> Self {
        Self {
            state: EntryState::Absent,
            entry: None,
            tier: None,
        }
    }

    fn hit(entry: CacheEntry, state: EntryState, tier: Tier) -> Self {
        Self {
            state,
            entry: Some(entry),
            tier: Some(tier),
        }
    }

    /// Cached value, if servable
    pub fn value(&self) -> Option<Arc<Value>> {
        self.entry.as_ref().map(|e| Arc::clone(e.value()))
    }

    pub fn is_fresh(&self) -> bool {
        self.state == EntryState::Fresh
    }

    pub fn is_stale(&self) -> bool {
        self.state == EntryState::Stale
    }

    pub fn is_absent(&self) -> bool {
        self.state == EntryState::Absent
    }
}

/// Result of a write-through
#[derive(Debug, Clone)]
pub struct WriteOutcome {
    /// The value as now cached
    pub value: Arc<Value>,
    /// Stored in the local tier
    pub local: bool,
    /// Stored in the shared tier
    pub shared: bool,
}

/// The two-tier cache. Sole owner of entry lifecycle.
pub struct TieredCache {
    local: LocalTier,
    shared: Arc<dyn SharedTier>,
    codec: EntryCodec,
    clock: Arc<dyn Clock>,
    metrics: Arc<CacheMetrics>,
    /// Shared-tier deletes to retry on the next write
    pending_deletes: DashSet<CacheKey>,
}

impl TieredCache {
    pub fn new(
        local_config: LocalTierConfig,
        shared: Arc<dyn SharedTier>,
        codec: EntryCodec,
        clock: Arc<dyn Clock>,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        Self {
            local: LocalTier::with_config(local_config),
            shared,
            codec,
            clock,
            metrics,
            pending_deletes: DashSet::new(),
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    /// Look up a key through both tiers, recording hit/miss metrics
    pub async fn get(&self, key: &CacheKey) -> Lookup {
        let lookup = self.lookup(key).await;
        match lookup.state {
            EntryState::Fresh => self.metrics.record_fresh_hit(),
            EntryState::Stale => self.metrics.record_stale_hit(),
            EntryState::Absent => self.metrics.record_miss(),
        }
        match lookup.tier {
            Some(Tier::Local) => self.metrics.record_local_hit(),
            Some(Tier::Shared) => self.metrics.record_shared_hit(),
            None => {}
        }
        lookup
    }

    /// Look up a key without touching hit/miss metrics (internal re-checks)
    pub async fn inspect(&self, key: &CacheKey) -> Lookup {
        self.lookup(key).await
    }

    async fn lookup(&self, key: &CacheKey) -> Lookup {
        let now = self.clock.now();
        if let Some(entry) = self.local.get(key, now) {
            if entry.is_marked() {
                return self.remove_marked(key).await;
            }
            let state = entry.state_at(now);
            debug!(%key, %state, "local tier hit");
            return Lookup::hit(entry, state, Tier::Local);
        }

        match self.read_shared(key).await {
            Ok(Some(entry)) => {
                let state = entry.state_at(now);
                if state == EntryState::Absent {
                    return Lookup::absent();
                }
                if entry.is_marked() {
                    return self.remove_marked(key).await;
                }
                debug!(%key, %state, "shared tier hit, back-filling local tier");
                self.local.put(key.clone(), entry.clone(), now);
                self.update_size_gauge();
                Lookup::hit(entry, state, Tier::Shared)
            }
            Ok(None) => Lookup::absent(),
            Err(e) => {
                self.metrics.record_shared_tier_error();
                warn!(%key, error = %e, "shared tier read failed, continuing local-only");
                Lookup::absent()
            }
        }
    }

    async fn remove_marked(&self, key: &CacheKey) -> Lookup {
        debug!(%key, "removing lazily invalidated entry on access");
        if let Err(e) = self.delete(key).await {
            warn!(%key, error = %e, "lazy removal incomplete");
        }
        self.metrics.record_lazy_removal();
        Lookup::absent()
    }

    async fn read_shared(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let tracker = LatencyTracker::start();
        let payload = self.shared.get(key).await?;
        self.metrics.record_shared_read_latency(tracker.elapsed());

        let Some(payload) = payload else {
            return Ok(None);
        };
        match self.codec.decode(&payload) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                warn!(%key, error = %e, "discarding undecodable shared tier entry");
                Ok(None)
            }
        }
    }

    /// Servable entry from the local tier only
    pub fn get_from_local_tier(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.local.get(key, self.clock.now())
    }

    /// Servable entry from the shared tier only, without back-fill
    pub async fn get_from_shared_tier(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let now = self.clock.now();
        Ok(self
            .read_shared(key)
            .await?
            .filter(|entry| entry.state_at(now) != EntryState::Absent))
    }

    /// Write a value through both tiers
    pub async fn set(
        &self,
        key: &CacheKey,
        value: Value,
        ttl: Ttl,
        tags: BTreeSet<String>,
    ) -> WriteOutcome {
        self.retry_pending_deletes().await;
        self.pending_deletes.remove(key);

        let now = self.clock.now();
        let entry = CacheEntry::new(value, ttl, now, tags);
        let value = Arc::clone(entry.value());

        let local = self.local.put(key.clone(), entry.clone(), now);
        if !local {
            warn!(%key, size = entry.size(), "entry exceeds local tier capacity, shared tier only");
        }
        self.update_size_gauge();

        let shared = match self.write_shared(key, &entry, ttl).await {
            Ok(()) => true,
            Err(e) => {
                self.metrics.record_shared_tier_error();
                warn!(%key, error = %e, "shared tier write failed, local copy stands");
                false
            }
        };

        debug!(%key, local, shared, "write-through complete");
        WriteOutcome {
            value,
            local,
            shared,
        }
    }

    async fn write_shared(&self, key: &CacheKey, entry: &CacheEntry, ttl: Ttl) -> Result<()> {
        let payload = self.codec.encode(entry)?;
        self.shared.set(key, payload, ttl.stale, entry.tags()).await
    }

    /// Remove a key from both tiers.
    ///
    /// A failed shared-tier delete is queued for retry and reported as
    /// [`Error::InvalidationFailed`]; the local copy is gone either way.
    pub async fn delete(&self, key: &CacheKey) -> Result<bool> {
        let local = self.local.remove(key).is_some();
        self.update_size_gauge();

        match self.shared.delete(key).await {
            Ok(shared) => {
                self.pending_deletes.remove(key);
                Ok(local || shared)
            }
            Err(e) => {
                self.metrics.record_shared_tier_error();
                self.pending_deletes.insert(key.clone());
                Err(Error::InvalidationFailed {
                    key: key.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Remove every entry whose pattern matches a glob expression.
    /// Returns the number of keys removed.
    pub async fn delete_matching(&self, pattern_expr: &str) -> usize {
        let mut keys: HashSet<CacheKey> = self.local.keys_matching(pattern_expr).into_iter().collect();
        match self.shared.keys_matching(pattern_expr).await {
            Ok(shared) => keys.extend(shared),
            Err(e) => {
                self.metrics.record_shared_tier_error();
                warn!(pattern = pattern_expr, error = %e, "shared tier scan failed, clearing local matches only");
            }
        }
        self.delete_all(keys).await
    }

    /// Keys of entries carrying `tag`, from both tiers
    pub async fn keys_tagged(&self, tag: &str) -> Vec<CacheKey> {
        let mut keys: HashSet<CacheKey> = self.local.keys_tagged(tag).into_iter().collect();
        match self.shared.keys_tagged(tag).await {
            Ok(shared) => keys.extend(shared),
            Err(e) => {
                self.metrics.record_shared_tier_error();
                warn!(tag, error = %e, "shared tier tag lookup failed, using local index only");
            }
        }
        keys.into_iter().collect()
    }

    /// Delete a set of keys, logging failures. Returns the number removed.
    pub async fn delete_all(&self, keys: impl IntoIterator<Item = CacheKey>) -> usize {
        let mut removed = 0;
        for key in keys {
            match self.delete(&key).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => {
                    // Local copy is gone; the shared delete is retried later
                    removed += 1;
                    warn!(%key, error = %e, "shared tier delete failed, queued for retry");
                }
            }
        }
        removed
    }

    /// Mark a servable entry for removal on its next read, in both tiers.
    ///
    /// Returns false when there is nothing to mark: the key is absent in
    /// both tiers or already marked.
    pub async fn mark_lazy(&self, key: &CacheKey) -> bool {
        let now = self.clock.now();
        let servable = |entry: &CacheEntry| entry.state_at(now) != EntryState::Absent;

        let local = self.local.peek(key).filter(servable);
        let entry = match &local {
            Some(entry) => Some(entry.clone()),
            None => match self.read_shared(key).await {
                Ok(entry) => entry.filter(servable),
                Err(e) => {
                    self.metrics.record_shared_tier_error();
                    warn!(%key, error = %e, "shared tier read failed while marking");
                    None
                }
            },
        };
        let Some(entry) = entry else {
            return false;
        };
        if entry.is_marked() {
            return false;
        }

        let marked = entry.with_mark(true);
        if local.is_some() {
            self.local.put(key.clone(), marked.clone(), now);
        }

        let remaining = marked.remaining_servable(now);
        let payload = self.codec.encode(&marked);
        let written = match payload {
            Ok(payload) => self.shared.set(key, payload, remaining, marked.tags()).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            self.metrics.record_shared_tier_error();
            warn!(%key, error = %e, "shared tier mark failed, other instances keep serving");
        }
        true
    }

    /// Whether either tier holds a marked, unexpired entry for `key`
    pub async fn is_marked_lazy(&self, key: &CacheKey) -> bool {
        let now = self.clock.now();
        if let Some(entry) = self.local.peek(key) {
            if entry.state_at(now) != EntryState::Absent {
                return entry.is_marked();
            }
        }
        matches!(
            self.read_shared(key).await,
            Ok(Some(entry)) if entry.is_marked() && entry.state_at(now) != EntryState::Absent
        )
    }

    /// Recorded size of an entry in either tier, without back-filling
    pub async fn entry_size(&self, key: &CacheKey) -> Option<u64> {
        if let Some(entry) = self.local.peek(key) {
            return Some(entry.size());
        }
        match self.read_shared(key).await {
            Ok(entry) => entry.map(|e| e.size()),
            Err(e) => {
                warn!(%key, error = %e, "shared tier size lookup failed");
                None
            }
        }
    }

    /// Retry queued shared-tier deletes. Returns how many succeeded.
    pub async fn retry_pending_deletes(&self) -> usize {
        if self.pending_deletes.is_empty() {
            return 0;
        }
        let pending: Vec<CacheKey> = self.pending_deletes.iter().map(|k| k.key().clone()).collect();
        let mut cleared = 0;
        for key in pending {
            match self.shared.delete(&key).await {
                Ok(_) => {
                    self.pending_deletes.remove(&key);
                    cleared += 1;
                }
                Err(e) => {
                    debug!(%key, error = %e, "pending delete still failing");
                    break;
                }
            }
        }
        if cleared > 0 {
            debug!(cleared, "retried pending shared tier deletes");
        }
        cleared
    }

    pub fn pending_delete_count(&self) -> usize {
        self.pending_deletes.len()
    }

    /// Approximate bytes held in the local tier
    pub fn size(&self) -> u64 {
        self.local.size()
    }

    pub fn local_len(&self) -> usize {
        self.local.len()
    }

    /// Local tier bytes over its budget (0.0 - 1.0)
    pub fn local_utilization(&self) -> f64 {
        self.local.utilization()
    }

    /// Whether the shared tier answers
    pub async fn shared_tier_available(&self) -> bool {
        self.shared.ping().await.is_ok()
    }

    fn update_size_gauge(&self) {
        self.metrics.set_cached_bytes(self.local.size());
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemorySharedTier;
    use crate::clock::ManualClock;
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        clock: Arc<ManualClock>,
        shared: Arc<InMemorySharedTier>,
        cache: TieredCache,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new());
        let shared = Arc::new(InMemorySharedTier::new(clock.clone()));
        let cache = TieredCache::new(
            LocalTierConfig::default(),
            shared.clone(),
            EntryCodec::default(),
            clock.clone(),
            Arc::new(CacheMetrics::new()),
        );
        Fixture {
            clock,
            shared,
            cache,
        }
    }

    fn tags(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|t| t.to_string()).collect()
    }

    #[tokio::test]
    async fn test_set_then_get_is_fresh() {
        let f = fixture();
        let key = CacheKey::new("event", "e1");

        let outcome = f.cache.set(&key, json!({"title": "Launch"}), Ttl::secs(60, 120), tags(&[])).await;
        assert!(outcome.local && outcome.shared);

        let lookup = f.cache.get(&key).await;
        assert!(lookup.is_fresh());
        assert_eq!(lookup.tier, Some(Tier::Local));
        assert_eq!(lookup.value().unwrap().as_ref(), &json!({"title": "Launch"}));
        assert_eq!(f.cache.metrics().fresh_hits(), 1);
    }

    #[tokio::test]
    async fn test_stale_then_absent() {
        let f = fixture();
        let key = CacheKey::new("event", "e1");
        f.cache.set(&key, json!({"title": "Launch"}), Ttl::secs(60, 120), tags(&[])).await;

        f.clock.advance(Duration::from_secs(90));
        let lookup = f.cache.get(&key).await;
        assert!(lookup.is_stale());
        assert_eq!(lookup.value().unwrap().as_ref(), &json!({"title": "Launch"}));

        f.clock.advance(Duration::from_secs(40));
        assert!(f.cache.get(&key).await.is_absent());
        assert_eq!(f.cache.metrics().misses(), 1);
    }

    #[tokio::test]
    async fn test_shared_hit_backfills_with_original_expiry() {
        let f = fixture();
        let key = CacheKey::new("user", "u1");
        f.cache.set(&key, json!("alice"), Ttl::secs(60, 120), tags(&["org:42"])).await;

        // Simulate another instance: the local copy is gone
        f.cache.local.clear();
        f.clock.advance(Duration::from_secs(90));

        let lookup = f.cache.get(&key).await;
        assert_eq!(lookup.tier, Some(Tier::Shared));
        assert!(lookup.is_stale(), "stale window must survive local eviction");
        assert!(lookup.entry.unwrap().tags().contains("org:42"));

        // Back-filled
        assert!(f.cache.get_from_local_tier(&key).is_some());
        assert_eq!(f.cache.get(&key).await.tier, Some(Tier::Local));
    }

    #[tokio::test]
    async fn test_shared_outage_degrades_to_local() {
        let f = fixture();
        let key = CacheKey::new("user", "u1");
        f.shared.set_available(false);

        let outcome = f.cache.set(&key, json!("alice"), Ttl::secs(60, 120), tags(&[])).await;
        assert!(outcome.local);
        assert!(!outcome.shared);
        assert!(f.cache.get(&key).await.is_fresh());

        assert!(f.cache.get(&CacheKey::new("user", "u2")).await.is_absent());
        assert!(f.cache.metrics().snapshot().shared_tier_errors >= 2);
        assert!(!f.cache.shared_tier_available().await);
    }

    #[tokio::test]
    async fn test_delete_removes_both_tiers() {
        let f = fixture();
        let key = CacheKey::new("user", "u1");
        f.cache.set(&key, json!("alice"), Ttl::secs(60, 120), tags(&[])).await;

        assert!(f.cache.delete(&key).await.unwrap());
        assert!(f.cache.get_from_local_tier(&key).is_none());
        assert!(f.cache.get_from_shared_tier(&key).await.unwrap().is_none());

        // Deleting an absent key is a no-op
        assert!(!f.cache.delete(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_delete_retried_on_next_write() {
        let f = fixture();
        let key = CacheKey::new("user", "u1");
        f.cache.set(&key, json!("alice"), Ttl::secs(60, 120), tags(&[])).await;

        f.shared.set_fail_deletes(true);
        let err = f.cache.delete(&key).await.unwrap_err();
        assert!(matches!(err, Error::InvalidationFailed { .. }));
        assert_eq!(f.cache.pending_delete_count(), 1);
        assert!(f.shared.contains(&key));

        f.shared.set_fail_deletes(false);
        f.cache
            .set(&CacheKey::new("user", "u2"), json!("bob"), Ttl::secs(60, 120), tags(&[]))
            .await;
        assert_eq!(f.cache.pending_delete_count(), 0);
        assert!(!f.shared.contains(&key));
    }

    #[tokio::test]
    async fn test_lazy_mark_removes_on_next_read() {
        let f = fixture();
        let key = CacheKey::new("media", "m1");
        f.cache.set(&key, json!("thumb"), Ttl::secs(60, 120), tags(&[])).await;

        assert!(f.cache.mark_lazy(&key).await);
        assert!(f.cache.is_marked_lazy(&key).await);
        assert!(f.cache.get_from_local_tier(&key).is_some());

        assert!(f.cache.get(&key).await.is_absent());
        assert!(!f.shared.contains(&key));
        assert!(f.cache.get(&key).await.is_absent());
        assert_eq!(f.cache.metrics().snapshot().lazy_removals, 1);
    }

    #[tokio::test]
    async fn test_lazy_mark_needs_an_entry() {
        let f = fixture();
        let ghost = CacheKey::new("user", "ghost");

        assert!(!f.cache.mark_lazy(&ghost).await);
        assert!(!f.cache.is_marked_lazy(&ghost).await);

        // Marking twice is a no-op the second time
        let key = CacheKey::new("media", "m1");
        f.cache.set(&key, json!("thumb"), Ttl::secs(60, 120), tags(&[])).await;
        assert!(f.cache.mark_lazy(&key).await);
        assert!(!f.cache.mark_lazy(&key).await);
    }

    #[tokio::test]
    async fn test_lazy_mark_expires_with_entry() {
        let f = fixture();
        let key = CacheKey::new("media", "m1");
        f.cache.set(&key, json!("thumb"), Ttl::secs(60, 120), tags(&[])).await;
        f.clock.advance(Duration::from_secs(30));
        assert!(f.cache.mark_lazy(&key).await);

        f.clock.advance(Duration::from_secs(90));
        assert!(!f.cache.is_marked_lazy(&key).await);
        assert!(!f.shared.contains(&key));
        assert!(f.cache.get(&key).await.is_absent());
        assert_eq!(f.cache.metrics().snapshot().lazy_removals, 0);
    }

    #[tokio::test]
    async fn test_lazy_mark_is_seen_by_other_instances() {
        let f = fixture();
        let other = TieredCache::new(
            LocalTierConfig::default(),
            f.shared.clone(),
            EntryCodec::default(),
            f.clock.clone(),
            Arc::new(CacheMetrics::new()),
        );
        let key = CacheKey::new("media", "m1");
        f.cache.set(&key, json!("thumb"), Ttl::secs(60, 120), tags(&[])).await;

        assert!(f.cache.mark_lazy(&key).await);
        assert!(other.get(&key).await.is_absent());
        assert!(!f.shared.contains(&key));
        assert_eq!(other.metrics().snapshot().lazy_removals, 1);
    }

    #[tokio::test]
    async fn test_write_clears_lazy_mark() {
        let f = fixture();
        let key = CacheKey::new("media", "m1");
        f.cache.set(&key, json!("old"), Ttl::secs(60, 120), tags(&[])).await;
        assert!(f.cache.mark_lazy(&key).await);

        f.cache.set(&key, json!("thumb"), Ttl::secs(60, 120), tags(&[])).await;
        assert!(!f.cache.is_marked_lazy(&key).await);
        assert!(f.cache.get(&key).await.is_fresh());
    }

    #[tokio::test]
    async fn test_delete_matching_and_tags() {
        let f = fixture();
        let ttl = Ttl::secs(60, 120);
        f.cache.set(&CacheKey::new("event-list", "today"), json!([]), ttl, tags(&["org:42"])).await;
        f.cache.set(&CacheKey::new("event-list", "week"), json!([]), ttl, tags(&[])).await;
        f.cache.set(&CacheKey::new("user", "u1"), json!("a"), ttl, tags(&["org:42"])).await;

        assert_eq!(f.cache.keys_tagged("org:42").await.len(), 2);
        assert_eq!(f.cache.delete_matching("event*").await, 2);
        assert!(f.cache.get(&CacheKey::new("user", "u1")).await.is_fresh());
        assert_eq!(f.cache.keys_tagged("org:42").await, vec![CacheKey::new("user", "u1")]);
    }

    #[tokio::test]
    async fn test_size_accounting() {
        let f = fixture();
        let key = CacheKey::new("user", "u1");
        f.cache.set(&key, json!("alice"), Ttl::secs(60, 120), tags(&[])).await;
        assert_eq!(f.cache.size(), 7);
        assert_eq!(f.cache.metrics().snapshot().cached_bytes, 7);
        assert!(f.cache.local_utilization() > 0.0);
        assert_eq!(f.cache.entry_size(&key).await, Some(7));

        f.cache.delete(&key).await.unwrap();
        assert_eq!(f.cache.size(), 0);
        assert_eq!(f.cache.entry_size(&key).await, None);
    }
}
