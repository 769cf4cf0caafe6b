//! CoucheCache Integration Tests
//!
//! End-to-end behaviour through the public API:
//! - Tiered lookups and the fresh / stale / absent lifecycle
//! - Stale-while-revalidate and single-flight fetching
//! - Lock expiry and lock-timeout fallthrough
//! - Invalidation strategies and service-event routing
//! - Warming and degraded shared-tier operation
//! - Several instances over one shared tier

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::Semaphore;

use couchecache::adapters::{InMemorySharedTier, StaticServiceRegistry};
use couchecache::cache::{CacheKey, EntryState, Ttl};
use couchecache::clock::ManualClock;
use couchecache::domain::events::{InvalidationMetadata, InvalidationReason, ServiceEvent};
use couchecache::domain::ports::{fetcher, Fetcher, LockStore};
use couchecache::health::HealthStatus;
use couchecache::{CacheSettings, CacheSubsystem, GetOptions};

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    clock: Arc<ManualClock>,
    shared: Arc<InMemorySharedTier>,
    registry: Arc<StaticServiceRegistry>,
    subsystem: Arc<CacheSubsystem>,
}

fn settings() -> CacheSettings {
    CacheSettings {
        fresh_ttl_seconds: 60,
        stale_ttl_multiplier: 2.0,
        lock_wait_timeout_ms: 2_000,
        lock_poll_interval_ms: 5,
        revalidation_retry_delay_ms: 10,
        ..Default::default()
    }
}

fn harness_with(settings: CacheSettings) -> Harness {
    let clock = Arc::new(ManualClock::new());
    let shared = Arc::new(InMemorySharedTier::new(clock.clone()));
    let registry = Arc::new(StaticServiceRegistry::new());
    let subsystem = CacheSubsystem::builder(settings)
        .clock(clock.clone())
        .shared_tier(shared.clone(), shared.clone())
        .registry(registry.clone())
        .build()
        .unwrap();
    Harness {
        clock,
        shared,
        registry,
        subsystem: Arc::new(subsystem),
    }
}

fn harness() -> Harness {
    harness_with(settings())
}

/// Second instance over the same shared tier, locks and clock
fn peer(h: &Harness) -> Arc<CacheSubsystem> {
    let subsystem = CacheSubsystem::builder(settings())
        .clock(h.clock.clone())
        .shared_tier(h.shared.clone(), h.shared.clone())
        .registry(h.registry.clone())
        .build()
        .unwrap();
    Arc::new(subsystem)
}

/// Fetcher returning `value` and counting invocations
fn counting(calls: &Arc<AtomicUsize>, value: Value) -> Fetcher {
    let calls = Arc::clone(calls);
    fetcher(move || {
        let calls = Arc::clone(&calls);
        let value = value.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(value)
        }
    })
}

/// Fetcher that blocks until a permit is added to `gate`
fn gated(calls: &Arc<AtomicUsize>, gate: &Arc<Semaphore>, value: Value) -> Fetcher {
    let calls = Arc::clone(calls);
    let gate = Arc::clone(gate);
    fetcher(move || {
        let calls = Arc::clone(&calls);
        let gate = Arc::clone(&gate);
        let value = value.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            gate.acquire().await?.forget();
            Ok(value)
        }
    })
}

fn failing() -> Fetcher {
    fetcher(|| async { Err(anyhow::anyhow!("source unavailable")) })
}

async fn seed(h: &Harness, pattern: &str, key: &str, value: Value, tags: &[&str]) -> CacheKey {
    let key = CacheKey::new(pattern, key);
    let tags: BTreeSet<String> = tags.iter().map(|t| t.to_string()).collect();
    h.subsystem
        .cache()
        .set(&key, value, Ttl::secs(60, 120), tags)
        .await;
    key
}

// =============================================================================
// Entry Lifecycle
// =============================================================================

mod lifecycle_tests {
    use super::*;

    #[tokio::test]
    async fn test_fresh_then_stale_then_absent() {
        let h = harness();
        let key = seed(&h, "event", "e1", json!({ "title": "Launch" }), &[]).await;

        let lookup = h.subsystem.cache().get(&key).await;
        assert_eq!(lookup.state, EntryState::Fresh);
        assert_eq!(*lookup.value().unwrap(), json!({ "title": "Launch" }));

        h.clock.advance(Duration::from_secs(90));
        let lookup = h.subsystem.cache().get(&key).await;
        assert_eq!(lookup.state, EntryState::Stale);
        assert_eq!(*lookup.value().unwrap(), json!({ "title": "Launch" }));

        h.clock.advance(Duration::from_secs(40));
        assert!(h.subsystem.cache().get(&key).await.is_absent());
    }

    #[tokio::test]
    async fn test_fresh_read_never_calls_fetcher() {
        let h = harness();
        seed(&h, "event", "e1", json!({ "title": "Launch" }), &[]).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let fetch = counting(&calls, json!({ "title": "Other" }));

        for _ in 0..5 {
            let result = h.subsystem.get("event", "e1", &fetch).await.unwrap();
            assert!(!result.stale);
            assert_eq!(*result.value, json!({ "title": "Launch" }));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.subsystem.metrics().fresh_hits, 5);
    }

    #[tokio::test]
    async fn test_stale_window_survives_local_eviction() {
        let h = harness();
        let key = seed(&h, "event", "e1", json!({ "title": "Launch" }), &[]).await;

        // A second process sharing the tier sees the same windows
        let peer = CacheSubsystem::builder(settings())
            .clock(h.clock.clone())
            .shared_tier(h.shared.clone(), h.shared.clone())
            .build()
            .unwrap();

        h.clock.advance(Duration::from_secs(90));
        let lookup = peer.cache().get(&key).await;
        assert_eq!(lookup.state, EntryState::Stale);
        assert!(peer.cache().get_from_local_tier(&key).is_some());
    }
}

// =============================================================================
// Stale-While-Revalidate
// =============================================================================

mod revalidation_tests {
    use super::*;

    #[tokio::test]
    async fn test_stale_read_schedules_one_refresh() {
        let h = harness();
        let key = seed(&h, "event", "e1", json!({ "title": "Launch" }), &[]).await;
        h.clock.advance(Duration::from_secs(90));

        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Semaphore::new(0));
        let fetch = gated(&calls, &gate, json!({ "title": "Launch v2" }));

        let first = h.subsystem.get("event", "e1", &fetch).await.unwrap();
        assert!(first.stale);
        assert!(first.revalidating);
        assert_eq!(*first.value, json!({ "title": "Launch" }));

        let second = h.subsystem.get("event", "e1", &fetch).await.unwrap();
        assert!(second.stale);
        assert!(second.revalidating);
        assert!(h.subsystem.scheduler().ticket(&key).is_some());

        gate.add_permits(1);
        h.subsystem.scheduler().wait_idle().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.subsystem.metrics().revalidations_started, 1);
        assert!(h.subsystem.scheduler().ticket(&key).is_none());

        let refreshed = h.subsystem.get("event", "e1", &fetch).await.unwrap();
        assert!(!refreshed.stale);
        assert_eq!(*refreshed.value, json!({ "title": "Launch v2" }));
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_serving_stale() {
        let h = harness();
        seed(&h, "user", "u1", json!({ "name": "Ada" }), &[]).await;
        h.clock.advance(Duration::from_secs(90));

        let result = h.subsystem.get("user", "u1", &failing()).await.unwrap();
        assert!(result.stale);
        h.subsystem.scheduler().wait_idle().await;

        let again = h.subsystem.get("user", "u1", &failing()).await.unwrap();
        assert!(again.stale);
        assert_eq!(*again.value, json!({ "name": "Ada" }));
        h.subsystem.scheduler().wait_idle().await;

        assert!(h.subsystem.metrics().revalidations_failed >= 1);
    }

    #[tokio::test]
    async fn test_cold_failure_propagates_without_fallback() {
        let h = harness();
        let err = h.subsystem.get("user", "missing", &failing()).await.unwrap_err();
        assert!(err.is_source_failure());
    }

    #[tokio::test]
    async fn test_cold_failure_serves_fallback() {
        let h = harness();
        let fallback = json!({ "name": "Unknown" });

        let result = h
            .subsystem
            .get_with_fallback("user", "missing", &failing(), fallback.clone())
            .await;
        assert!(result.from_fallback);
        assert_eq!(*result.value, fallback);

        // Cached briefly so the source is not hammered
        let calls = Arc::new(AtomicUsize::new(0));
        let cached = h
            .subsystem
            .get("user", "missing", &counting(&calls, json!({ "name": "Ada" })))
            .await
            .unwrap();
        assert_eq!(*cached.value, fallback);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.subsystem.metrics().fallbacks_served, 1);
    }

    #[tokio::test]
    async fn test_background_refresh_can_be_disabled() {
        let h = harness();
        let key = seed(&h, "event", "e1", json!({ "title": "Launch" }), &[]).await;
        h.clock.advance(Duration::from_secs(90));

        let calls = Arc::new(AtomicUsize::new(0));
        let options = GetOptions::new(Ttl::secs(60, 120)).without_background_refresh();
        let result = h
            .subsystem
            .scheduler()
            .get(&key, &counting(&calls, json!({})), &options)
            .await
            .unwrap();

        assert!(result.stale);
        assert!(!result.revalidating);
        h.subsystem.scheduler().wait_idle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}

// =============================================================================
// Single-Flight and Locks
// =============================================================================

mod stampede_tests {
    use super::*;

    #[tokio::test]
    async fn test_concurrent_misses_fetch_once() {
        let h = harness();
        h.clock.advance(Duration::from_secs(130));

        let calls = Arc::new(AtomicUsize::new(0));
        let fetch = fetcher({
            let calls = Arc::clone(&calls);
            move || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(json!({ "title": "Launch" }))
                }
            }
        });

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let subsystem = Arc::clone(&h.subsystem);
                let fetch = Arc::clone(&fetch);
                tokio::spawn(async move { subsystem.get("event", "e1", &fetch).await })
            })
            .collect();

        for handle in futures::future::join_all(handles).await {
            let result = handle.unwrap().unwrap();
            assert_eq!(*result.value, json!({ "title": "Launch" }));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(h.subsystem.metrics().stampede_prevented >= 1);
    }

    #[tokio::test]
    async fn test_abandoned_lock_expires() {
        let h = harness();
        let name = "couchecache:lock:event:e1";

        assert!(h.shared.try_acquire(name, "crashed-owner", Duration::from_secs(30)).await.unwrap());
        assert!(h.shared.is_held(name).await.unwrap());
        assert!(!h.shared.try_acquire(name, "other", Duration::from_secs(30)).await.unwrap());

        h.clock.advance(Duration::from_secs(31));
        assert!(!h.shared.is_held(name).await.unwrap());
        assert!(h.shared.try_acquire(name, "other", Duration::from_secs(30)).await.unwrap());
    }

    #[tokio::test]
    async fn test_held_lock_falls_through_after_wait_timeout() {
        let h = harness_with(CacheSettings {
            lock_wait_timeout_ms: 50,
            ..settings()
        });
        h.shared
            .try_acquire("couchecache:lock:event:e1", "crashed-owner", Duration::from_secs(30))
            .await
            .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let result = h
            .subsystem
            .get("event", "e1", &counting(&calls, json!({ "title": "Launch" })))
            .await
            .unwrap();

        assert_eq!(*result.value, json!({ "title": "Launch" }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.subsystem.metrics().lock_timeouts, 1);
    }

    #[tokio::test]
    async fn test_lock_store_outage_still_serves() {
        let h = harness();
        h.shared.set_available(false);

        let calls = Arc::new(AtomicUsize::new(0));
        let fetch = counting(&calls, json!({ "name": "Ada" }));
        let result = h.subsystem.get("user", "u1", &fetch).await.unwrap();
        assert_eq!(*result.value, json!({ "name": "Ada" }));

        // Local tier still serves while the shared tier is down
        let again = h.subsystem.get("user", "u1", &fetch).await.unwrap();
        assert!(!again.stale);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.subsystem.health().await.status, HealthStatus::Degraded);
    }
}

// =============================================================================
// Invalidation
// =============================================================================

mod invalidation_tests {
    use super::*;

    #[tokio::test]
    async fn test_dependency_change_removes_tagged_entries() {
        let h = harness();
        let user = seed(&h, "user", "u1", json!({ "name": "Ada" }), &["org:42"]).await;
        let members = seed(&h, "org_members", "42", json!([]), &["org:42"]).await;
        let events = seed(&h, "event_list", "org-42", json!([]), &["org:42"]).await;
        let other = seed(&h, "user", "u2", json!({ "name": "Bob" }), &["org:7"]).await;

        let outcome = h
            .subsystem
            .invalidate("user", "u1", InvalidationReason::DependencyChange, &InvalidationMetadata::default())
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.removed, 3);

        for key in [&user, &members, &events] {
            assert!(h.subsystem.cache().inspect(key).await.is_absent());
            assert!(!h.shared.contains(key));
        }
        assert!(h.subsystem.cache().inspect(&other).await.is_fresh());
    }

    #[tokio::test]
    async fn test_invalidating_absent_key_twice_is_noop() {
        let h = harness();
        for _ in 0..2 {
            for reason in InvalidationReason::ALL {
                let outcome = h
                    .subsystem
                    .invalidate("user", "ghost", reason, &InvalidationMetadata::default())
                    .await;
                assert!(outcome.success, "{reason} failed on absent key");
                assert_eq!(outcome.removed, 0);
            }
        }
    }

    #[tokio::test]
    async fn test_lazy_invalidation_removed_on_next_read() {
        let h = harness();
        let key = seed(&h, "media", "m1", json!({ "url": "a.png" }), &[]).await;

        let outcome = h
            .subsystem
            .invalidate("media", "m1", InvalidationReason::LowUsage, &InvalidationMetadata::default())
            .await;
        assert!(outcome.deferred);
        assert!(h.shared.contains(&key));

        let calls = Arc::new(AtomicUsize::new(0));
        let result = h
            .subsystem
            .get("media", "m1", &counting(&calls, json!({ "url": "b.png" })))
            .await
            .unwrap();
        assert_eq!(*result.value, json!({ "url": "b.png" }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.subsystem.metrics().lazy_removals, 1);
    }

    #[tokio::test]
    async fn test_low_usage_on_absent_key_is_not_deferred() {
        let h = harness();

        let outcome = h
            .subsystem
            .invalidate("media", "ghost", InvalidationReason::LowUsage, &InvalidationMetadata::default())
            .await;
        assert!(outcome.success);
        assert!(!outcome.deferred);
        assert_eq!(h.subsystem.metrics().invalidations_low_usage, 0);
        assert!(!h.subsystem.cache().is_marked_lazy(&CacheKey::new("media", "ghost")).await);
    }

    #[tokio::test]
    async fn test_service_event_routing() {
        let h = harness();
        let user = seed(&h, "user", "u1", json!({ "name": "Ada" }), &[]).await;
        let list = seed(&h, "event_list", "today", json!([]), &[]).await;

        let outcome = h
            .subsystem
            .invalidate_by_service_event(&ServiceEvent::new("user.updated", Some("u1".into())))
            .await;
        assert_eq!(outcome.removed, 1);
        assert!(h.subsystem.cache().inspect(&user).await.is_absent());
        assert!(h.subsystem.cache().inspect(&list).await.is_fresh());

        let outcome = h
            .subsystem
            .invalidate_by_service_event(&ServiceEvent::new("event.created", None))
            .await;
        assert_eq!(outcome.removed, 1);
        assert!(h.subsystem.cache().inspect(&list).await.is_absent());
    }

    #[tokio::test]
    async fn test_failed_delete_retried_on_next_write() {
        let h = harness();
        let key = seed(&h, "user", "u1", json!({ "name": "Ada" }), &[]).await;
        h.shared.set_fail_deletes(true);

        let outcome = h
            .subsystem
            .invalidate("user", "u1", InvalidationReason::DataUpdated, &InvalidationMetadata::default())
            .await;
        assert!(!outcome.success);
        assert!(h.shared.contains(&key));

        h.shared.set_fail_deletes(false);
        seed(&h, "user", "u2", json!({ "name": "Bob" }), &[]).await;
        assert!(!h.shared.contains(&key));
        assert_eq!(h.subsystem.cache().pending_delete_count(), 0);
    }
}

// =============================================================================
// Warming
// =============================================================================

mod warming_tests {
    use super::*;
    use couchecache::{WarmingItem, WarmingPriority};

    #[tokio::test]
    async fn test_health_gated_warming_populates_cache() {
        let h = harness();
        let calls = Arc::new(AtomicUsize::new(0));
        let warming = h.subsystem.warming();

        warming.register_source(
            "event-service",
            vec![WarmingItem::new(
                "event_list",
                "today",
                WarmingPriority::High,
                counting(&calls, json!([{ "id": "e1" }])),
            )],
        );

        h.registry.set_health("event-service", false);
        assert_eq!(warming.warm_based_on_health().await.warmed, 0);

        h.registry.set_health("event-service", true);
        assert_eq!(warming.warm_based_on_health().await.warmed, 1);

        let lookup = h
            .subsystem
            .cache()
            .get(&CacheKey::new("event_list", "today"))
            .await;
        assert!(lookup.is_fresh());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.subsystem.metrics().warmed, 1);
    }

    #[tokio::test]
    async fn test_spawned_warming_loop_fills_critical_keys() {
        let h = harness();
        let calls = Arc::new(AtomicUsize::new(0));
        h.subsystem.warming().register_critical(WarmingItem::new(
            "event_list",
            "homepage",
            WarmingPriority::Critical,
            counting(&calls, json!([{ "id": "e1" }])),
        ));

        h.subsystem.spawn_warming();

        let key = CacheKey::new("event_list", "homepage");
        for _ in 0..200 {
            if h.subsystem.cache().get_from_local_tier(&key).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(h.subsystem.cache().get_from_local_tier(&key).is_some());
        assert!(h.shared.contains(&key));
        assert!(calls.load(Ordering::SeqCst) >= 1);

        h.subsystem.shutdown().await;
    }
}

// =============================================================================
// Multiple Instances
// =============================================================================

mod multi_instance_tests {
    use super::*;

    #[tokio::test]
    async fn test_lock_excludes_fetch_across_instances() {
        let h = harness();
        let other = peer(&h);

        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Semaphore::new(0));
        let fetch = gated(&calls, &gate, json!({ "title": "Launch" }));

        let first = {
            let subsystem = Arc::clone(&h.subsystem);
            let fetch = Arc::clone(&fetch);
            tokio::spawn(async move { subsystem.get("event", "e1", &fetch).await })
        };
        while calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let second = {
            let subsystem = Arc::clone(&other);
            let fetch = Arc::clone(&fetch);
            tokio::spawn(async move { subsystem.get("event", "e1", &fetch).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        gate.add_permits(1);

        for handle in [first, second] {
            let result = handle.await.unwrap().unwrap();
            assert_eq!(*result.value, json!({ "title": "Launch" }));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(other.metrics().stampede_prevented >= 1);
    }

    #[tokio::test]
    async fn test_peer_back_fills_from_shared_tier() {
        let h = harness();
        let other = peer(&h);
        let key = seed(&h, "user", "u1", json!({ "name": "Ada" }), &[]).await;
        assert!(other.cache().get_from_local_tier(&key).is_none());

        let calls = Arc::new(AtomicUsize::new(0));
        let result = other
            .get("user", "u1", &counting(&calls, json!({ "name": "Bob" })))
            .await
            .unwrap();
        assert_eq!(*result.value, json!({ "name": "Ada" }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(other.cache().get_from_local_tier(&key).is_some());
        assert_eq!(other.metrics().shared_hits, 1);
    }

    #[tokio::test]
    async fn test_lazy_mark_reaches_peer() {
        let h = harness();
        let other = peer(&h);
        let key = seed(&h, "media", "m1", json!({ "url": "a.png" }), &[]).await;

        let outcome = h
            .subsystem
            .invalidate("media", "m1", InvalidationReason::LowUsage, &InvalidationMetadata::default())
            .await;
        assert!(outcome.deferred);
        assert!(other.cache().is_marked_lazy(&key).await);

        let calls = Arc::new(AtomicUsize::new(0));
        let result = other
            .get("media", "m1", &counting(&calls, json!({ "url": "b.png" })))
            .await
            .unwrap();
        assert_eq!(*result.value, json!({ "url": "b.png" }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(other.metrics().lazy_removals, 1);
    }
}
