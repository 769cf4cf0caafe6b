//! Invalidation Router
//!
//! Maps change notifications onto cache removals. The reason carried by an
//! invalidation selects the strategy:
//!
//! | Reason              | Strategy                                              |
//! |---------------------|-------------------------------------------------------|
//! | `data_updated`      | delete from both tiers now                            |
//! | `low_usage`         | mark; removed on the next read or replaced on write   |
//! | `size_pressure`     | delete only when the size exceeds the threshold       |
//! | `dependency_change` | delete, then delete every entry tagged with it        |
//!
//! Generic [`ServiceEvent`]s are translated through an [`InvalidationRule`]
//! table (event type → affected pattern).

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cache::{glob_match, CacheKey, CacheMetrics, TieredCache};
use crate::domain::events::{
    InvalidationEvent, InvalidationMetadata, InvalidationReason, ServiceEvent,
};
use crate::error::Result;

// =============================================================================
// Rules
// =============================================================================

/// Which entries of a pattern an event affects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleScope {
    /// Only the entry keyed by the event's entity id
    Entity,
    /// Every entry of the pattern
    All,
}

/// One row of the event-type → pattern table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationRule {
    /// Event type, `*` wildcards allowed (e.g. `"*.deleted"`)
    pub event_type: String,
    /// Affected cache pattern; a glob when the scope is `all`
    pub pattern: String,
    pub scope: RuleScope,
    pub reason: InvalidationReason,
}

impl InvalidationRule {
    pub fn new(
        event_type: impl Into<String>,
        pattern: impl Into<String>,
        scope: RuleScope,
        reason: InvalidationReason,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            pattern: pattern.into(),
            scope,
            reason,
        }
    }

    fn applies_to(&self, event_type: &str) -> bool {
        glob_match(&self.event_type, event_type)
    }

    /// Built-in table for user, event, media and organization changes
    pub fn defaults() -> Vec<InvalidationRule> {
        use InvalidationReason::*;
        use RuleScope::*;

        vec![
            Self::new("user.updated", "user", Entity, DataUpdated),
            Self::new("user.profile_updated", "user_profile", Entity, DataUpdated),
            Self::new("user.deleted", "user", Entity, DependencyChange),
            Self::new("event.created", "event_list", All, DataUpdated),
            Self::new("event.updated", "event", Entity, DataUpdated),
            Self::new("event.updated", "event_list", All, DataUpdated),
            Self::new("event.deleted", "event", Entity, DependencyChange),
            Self::new("event.deleted", "event_list", All, DataUpdated),
            Self::new("media.uploaded", "media_list", All, DataUpdated),
            Self::new("media.updated", "media", Entity, DataUpdated),
            Self::new("media.deleted", "media", Entity, DependencyChange),
            Self::new("organization.updated", "org", Entity, DependencyChange),
        ]
    }

    /// Parse a rule table from YAML (`rules:` list)
    pub fn from_yaml(yaml: &str) -> Result<Vec<InvalidationRule>> {
        #[derive(Deserialize)]
        struct RuleFile {
            #[serde(default)]
            rules: Vec<InvalidationRule>,
        }

        let file: RuleFile = serde_yaml::from_str(yaml)?;
        Ok(file.rules)
    }
}

// =============================================================================
// Outcome
// =============================================================================

/// Result of an invalidation request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InvalidationOutcome {
    /// False only when a removal failed; no-ops are successful
    pub success: bool,
    /// Entries removed, including cascaded dependents
    pub removed: usize,
    /// Removal postponed to the next access
    pub deferred: bool,
}

impl InvalidationOutcome {
    fn removed(removed: usize) -> Self {
        Self {
            success: true,
            removed,
            deferred: false,
        }
    }

    fn deferred() -> Self {
        Self {
            success: true,
            removed: 0,
            deferred: true,
        }
    }

    fn failed(removed: usize) -> Self {
        Self {
            success: false,
            removed,
            deferred: false,
        }
    }

    fn noop() -> Self {
        Self::removed(0)
    }

    fn merge(self, other: InvalidationOutcome) -> Self {
        Self {
            success: self.success && other.success,
            removed: self.removed + other.removed,
            deferred: self.deferred || other.deferred,
        }
    }
}

// =============================================================================
// Router
// =============================================================================

/// Applies invalidation strategies against the tiered cache
pub struct InvalidationRouter {
    cache: Arc<TieredCache>,
    size_threshold: u64,
    rules: RwLock<Vec<InvalidationRule>>,
}

impl InvalidationRouter {
    pub fn new(cache: Arc<TieredCache>, size_threshold: u64) -> Self {
        Self::with_rules(cache, size_threshold, InvalidationRule::defaults())
    }

    pub fn with_rules(
        cache: Arc<TieredCache>,
        size_threshold: u64,
        rules: Vec<InvalidationRule>,
    ) -> Self {
        Self {
            cache,
            size_threshold,
            rules: RwLock::new(rules),
        }
    }

    fn metrics(&self) -> &Arc<CacheMetrics> {
        self.cache.metrics()
    }

    /// Replace the event-type table
    pub fn set_rules(&self, rules: Vec<InvalidationRule>) {
        *self.rules.write() = rules;
    }

    pub fn rules(&self) -> Vec<InvalidationRule> {
        self.rules.read().clone()
    }

    /// Invalidate a single entry. Never fails; errors are logged and
    /// reported through `success`.
    #[instrument(skip_all, fields(key = %key, reason = %reason))]
    pub async fn invalidate(
        &self,
        key: &CacheKey,
        reason: InvalidationReason,
        metadata: &InvalidationMetadata,
    ) -> InvalidationOutcome {
        let outcome = match reason {
            InvalidationReason::DataUpdated => self.immediate(key).await,
            InvalidationReason::LowUsage => {
                if self.cache.mark_lazy(key).await {
                    debug!("marked for removal on next access");
                    InvalidationOutcome::deferred()
                } else {
                    InvalidationOutcome::noop()
                }
            }
            InvalidationReason::SizePressure => self.selective(key, metadata).await,
            InvalidationReason::DependencyChange => self.cascading(key, metadata).await,
        };

        if outcome.removed > 0 || outcome.deferred {
            self.metrics().record_invalidation(reason);
        }
        outcome
    }

    /// Apply a pushed invalidation event
    pub async fn apply(&self, event: &InvalidationEvent) -> InvalidationOutcome {
        self.invalidate(&event.cache_key(), event.reason, &event.metadata)
            .await
    }

    async fn immediate(&self, key: &CacheKey) -> InvalidationOutcome {
        match self.cache.delete(key).await {
            Ok(removed) => {
                debug!(removed, "invalidated");
                InvalidationOutcome::removed(usize::from(removed))
            }
            Err(e) => {
                // Local copy is gone; the shared delete retries on the next write
                warn!(error = %e, "invalidation incomplete");
                InvalidationOutcome::failed(1)
            }
        }
    }

    async fn selective(&self, key: &CacheKey, metadata: &InvalidationMetadata) -> InvalidationOutcome {
        let size = match metadata.size {
            Some(size) => Some(size),
            None => self.cache.entry_size(key).await,
        };

        match size {
            Some(size) if size > self.size_threshold => {
                debug!(size, threshold = self.size_threshold, "size above threshold");
                self.immediate(key).await
            }
            size => {
                debug!(?size, threshold = self.size_threshold, "size within threshold, keeping entry");
                InvalidationOutcome::noop()
            }
        }
    }

    async fn cascading(&self, key: &CacheKey, metadata: &InvalidationMetadata) -> InvalidationOutcome {
        let mut tags = self.entry_tags(key).await;
        tags.insert(key.entity_tag());
        if let Some(dependency) = &metadata.dependency {
            tags.insert(dependency.clone());
        }

        let own = self.immediate(key).await;

        let mut dependents = HashSet::new();
        for tag in &tags {
            dependents.extend(self.cache.keys_tagged(tag).await);
        }
        dependents.remove(key);

        let cascaded = self.cache.delete_all(dependents).await;
        if cascaded > 0 {
            info!(cascaded, tags = ?tags, "cascading invalidation");
        }
        own.merge(InvalidationOutcome::removed(cascaded))
    }

    async fn entry_tags(&self, key: &CacheKey) -> BTreeSet<String> {
        if let Some(entry) = self.cache.get_from_local_tier(key) {
            return entry.tags().clone();
        }
        match self.cache.get_from_shared_tier(key).await {
            Ok(Some(entry)) => entry.tags().clone(),
            Ok(None) => BTreeSet::new(),
            Err(e) => {
                warn!(error = %e, "could not read tags from shared tier");
                BTreeSet::new()
            }
        }
    }

    /// Translate an upstream change notification through the rule table
    #[instrument(skip_all, fields(event_type = %event.event_type))]
    pub async fn invalidate_by_service_event(&self, event: &ServiceEvent) -> InvalidationOutcome {
        let rules: Vec<InvalidationRule> = self
            .rules
            .read()
            .iter()
            .filter(|rule| rule.applies_to(&event.event_type))
            .cloned()
            .collect();

        if rules.is_empty() {
            debug!("no invalidation rule for event type");
            return InvalidationOutcome::noop();
        }

        let mut outcome = InvalidationOutcome::noop();
        for rule in rules {
            let step = match (rule.scope, &event.entity_id) {
                (RuleScope::Entity, Some(id)) => {
                    let key = CacheKey::new(&rule.pattern, id);
                    self.invalidate(&key, rule.reason, &event.metadata).await
                }
                (RuleScope::Entity, None) => {
                    debug!(pattern = %rule.pattern, "entity rule without entity id, skipping");
                    InvalidationOutcome::noop()
                }
                (RuleScope::All, _) => {
                    let removed = self.cache.delete_matching(&rule.pattern).await;
                    if removed > 0 {
                        self.metrics().record_invalidation(rule.reason);
                    }
                    InvalidationOutcome::removed(removed)
                }
            };
            outcome = outcome.merge(step);
        }

        debug!(removed = outcome.removed, success = outcome.success, "service event applied");
        outcome
    }

    /// Consume pushed events until the channel closes or `cancel` fires
    pub async fn consume(
        self: Arc<Self>,
        mut events: mpsc::Receiver<InvalidationEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => {
                        self.apply(&event).await;
                    }
                    None => break,
                },
            }
        }
        debug!("invalidation consumer stopped");
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemorySharedTier;
    use crate::cache::{EntryCodec, LocalTierConfig, Ttl};
    use crate::clock::ManualClock;
    use assert_matches::assert_matches;
    use serde_json::json;

    struct Fixture {
        shared: Arc<InMemorySharedTier>,
        cache: Arc<TieredCache>,
        router: InvalidationRouter,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new());
        let shared = Arc::new(InMemorySharedTier::new(clock.clone()));
        let cache = Arc::new(TieredCache::new(
            LocalTierConfig::default(),
            shared.clone(),
            EntryCodec::default(),
            clock,
            Arc::new(CacheMetrics::new()),
        ));
        let router = InvalidationRouter::new(cache.clone(), 1024);
        Fixture {
            shared,
            cache,
            router,
        }
    }

    async fn put(cache: &TieredCache, pattern: &str, key: &str, tags: &[&str]) -> CacheKey {
        let key = CacheKey::new(pattern, key);
        let tags = tags.iter().map(|t| t.to_string()).collect();
        cache.set(&key, json!({ "id": key.key() }), Ttl::secs(60, 120), tags).await;
        key
    }

    #[tokio::test]
    async fn test_data_updated_deletes_both_tiers() {
        let f = fixture();
        let key = put(&f.cache, "user", "u1", &[]).await;

        let outcome = f
            .router
            .invalidate(&key, InvalidationReason::DataUpdated, &InvalidationMetadata::default())
            .await;
        assert_eq!(outcome, InvalidationOutcome::removed(1));
        assert!(f.cache.get_from_local_tier(&key).is_none());
        assert!(!f.shared.contains(&key));
        assert_eq!(f.cache.metrics().invalidations(InvalidationReason::DataUpdated), 1);
    }

    #[tokio::test]
    async fn test_absent_key_is_idempotent() {
        let f = fixture();
        let key = CacheKey::new("user", "missing");
        let meta = InvalidationMetadata::default();

        for _ in 0..2 {
            let outcome = f.router.invalidate(&key, InvalidationReason::DataUpdated, &meta).await;
            assert!(outcome.success);
            assert_eq!(outcome.removed, 0);
        }
    }

    #[tokio::test]
    async fn test_low_usage_is_lazy() {
        let f = fixture();
        let key = put(&f.cache, "media", "m1", &[]).await;

        let outcome = f
            .router
            .invalidate(&key, InvalidationReason::LowUsage, &InvalidationMetadata::default())
            .await;
        assert!(outcome.deferred);
        // Still present until read
        assert!(f.shared.contains(&key));

        assert!(f.cache.get(&key).await.is_absent());
        assert!(!f.shared.contains(&key));
        assert!(f.cache.get(&key).await.is_absent());
    }

    #[tokio::test]
    async fn test_low_usage_on_absent_key_is_not_counted() {
        let f = fixture();
        let ghost = CacheKey::new("user", "ghost");
        let meta = InvalidationMetadata::default();

        for _ in 0..2 {
            let outcome = f.router.invalidate(&ghost, InvalidationReason::LowUsage, &meta).await;
            assert_eq!(outcome, InvalidationOutcome::noop());
        }
        assert_eq!(f.cache.metrics().invalidations(InvalidationReason::LowUsage), 0);
        assert!(!f.cache.is_marked_lazy(&ghost).await);
    }

    #[tokio::test]
    async fn test_low_usage_mark_cleared_by_write() {
        let f = fixture();
        let key = put(&f.cache, "media", "m1", &[]).await;
        f.router
            .invalidate(&key, InvalidationReason::LowUsage, &InvalidationMetadata::default())
            .await;

        put(&f.cache, "media", "m1", &[]).await;
        assert!(f.cache.get(&key).await.is_fresh());
    }

    #[tokio::test]
    async fn test_size_pressure_threshold() {
        let f = fixture();
        let key = put(&f.cache, "event", "e1", &[]).await;

        let small = f
            .router
            .invalidate(&key, InvalidationReason::SizePressure, &InvalidationMetadata::with_size(512))
            .await;
        assert_eq!(small, InvalidationOutcome::noop());
        assert!(f.cache.get_from_local_tier(&key).is_some());

        let at_threshold = f
            .router
            .invalidate(&key, InvalidationReason::SizePressure, &InvalidationMetadata::with_size(1024))
            .await;
        assert_eq!(at_threshold.removed, 0);

        let large = f
            .router
            .invalidate(&key, InvalidationReason::SizePressure, &InvalidationMetadata::with_size(4096))
            .await;
        assert_eq!(large.removed, 1);
        assert!(f.cache.get_from_local_tier(&key).is_none());
    }

    #[tokio::test]
    async fn test_size_pressure_uses_entry_size() {
        let f = fixture();
        let key = CacheKey::new("media", "big");
        let blob = "x".repeat(4096);
        f.cache
            .set(&key, json!({ "blob": blob }), Ttl::secs(60, 120), BTreeSet::new())
            .await;

        let outcome = f
            .router
            .invalidate(&key, InvalidationReason::SizePressure, &InvalidationMetadata::default())
            .await;
        assert_eq!(outcome.removed, 1);
    }

    #[tokio::test]
    async fn test_dependency_change_cascades() {
        let f = fixture();
        let user = put(&f.cache, "user", "u1", &["org:42"]).await;
        let roster = put(&f.cache, "org_members", "42", &["org:42"]).await;
        let feed = put(&f.cache, "feed", "u1", &["user:u1"]).await;
        let other = put(&f.cache, "user", "u2", &["org:7"]).await;

        let outcome = f
            .router
            .invalidate(&user, InvalidationReason::DependencyChange, &InvalidationMetadata::default())
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.removed, 3);

        assert!(f.cache.inspect(&roster).await.is_absent());
        assert!(f.cache.inspect(&feed).await.is_absent());
        assert!(f.cache.inspect(&other).await.is_fresh());
    }

    #[tokio::test]
    async fn test_dependency_from_metadata() {
        let f = fixture();
        let list = put(&f.cache, "event_list", "org-7", &["venue:9"]).await;

        let outcome = f
            .router
            .invalidate(
                &CacheKey::new("venue", "9-details"),
                InvalidationReason::DependencyChange,
                &InvalidationMetadata::with_dependency("venue:9"),
            )
            .await;
        assert_eq!(outcome.removed, 1);
        assert!(f.cache.inspect(&list).await.is_absent());
    }

    #[tokio::test]
    async fn test_failed_shared_delete_reports_failure() {
        let f = fixture();
        let key = put(&f.cache, "user", "u1", &[]).await;
        f.shared.set_fail_deletes(true);

        let outcome = f
            .router
            .invalidate(&key, InvalidationReason::DataUpdated, &InvalidationMetadata::default())
            .await;
        assert!(!outcome.success);
        assert_eq!(f.cache.pending_delete_count(), 1);

        f.shared.set_fail_deletes(false);
        put(&f.cache, "user", "other", &[]).await;
        assert_eq!(f.cache.pending_delete_count(), 0);
    }

    #[tokio::test]
    async fn test_service_event_entity_and_all_scopes() {
        let f = fixture();
        let event = put(&f.cache, "event", "e1", &[]).await;
        let list_a = put(&f.cache, "event_list", "today", &[]).await;
        let list_b = put(&f.cache, "event_list", "weekend", &[]).await;
        let unrelated = put(&f.cache, "user", "e1", &[]).await;

        let outcome = f
            .router
            .invalidate_by_service_event(&ServiceEvent::new("event.updated", Some("e1".into())))
            .await;
        assert_eq!(outcome.removed, 3);
        for key in [&event, &list_a, &list_b] {
            assert!(f.cache.inspect(key).await.is_absent());
        }
        assert!(f.cache.inspect(&unrelated).await.is_fresh());
    }

    #[tokio::test]
    async fn test_unknown_service_event_is_noop() {
        let f = fixture();
        put(&f.cache, "user", "u1", &[]).await;

        let outcome = f
            .router
            .invalidate_by_service_event(&ServiceEvent::new("billing.charged", Some("u1".into())))
            .await;
        assert_eq!(outcome, InvalidationOutcome::noop());
        assert_eq!(f.cache.local_len(), 1);
    }

    #[test]
    fn test_rules_from_yaml() {
        let rules = InvalidationRule::from_yaml(
            r#"
rules:
  - eventType: "*.archived"
    pattern: "archive_*"
    scope: all
    reason: data_updated
  - eventType: venue.updated
    pattern: venue
    scope: entity
    reason: dependency_change
"#,
        )
        .unwrap();

        assert_eq!(rules.len(), 2);
        assert!(rules[0].applies_to("event.archived"));
        assert_eq!(rules[1].scope, RuleScope::Entity);
        assert_eq!(rules[1].reason, InvalidationReason::DependencyChange);

        assert_matches!(
            InvalidationRule::from_yaml("rules: [{ eventType: x }]"),
            Err(crate::error::Error::Yaml(_))
        );
    }

    #[tokio::test]
    async fn test_consume_applies_pushed_events() {
        let f = fixture();
        let key = put(&f.cache, "user", "u1", &[]).await;
        let router = Arc::new(f.router);
        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(Arc::clone(&router).consume(rx, CancellationToken::new()));

        tx.send(InvalidationEvent::new("user", "u1", InvalidationReason::DataUpdated))
            .await
            .unwrap();
        drop(tx);
        handle.await.unwrap();

        assert!(f.cache.get_from_local_tier(&key).is_none());
    }
}
