//! In-Memory Shared Tier
//!
//! Process-local stand-in for an out-of-process shared cache (and its lock
//! keyspace). Entries and locks expire against the injected clock. The tier
//! can be switched offline to exercise the degraded paths.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::cache::CacheKey;
use crate::clock::{self, Clock, SystemClock};
use crate::domain::ports::{LockStore, SharedTier};
use crate::error::{Error, Result};
use crate::lock::Lock;

#[derive(Debug, Clone)]
struct StoredItem {
    payload: Bytes,
    expires_at: DateTime<Utc>,
    tags: BTreeSet<String>,
}

/// In-memory shared tier and lock store
pub struct InMemorySharedTier {
    storage: DashMap<CacheKey, StoredItem>,
    locks: DashMap<String, Lock>,
    clock: Arc<dyn Clock>,
    available: AtomicBool,
    fail_deletes: AtomicBool,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl InMemorySharedTier {
    /// Create a shared tier expiring against `clock`
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            storage: DashMap::new(),
            locks: DashMap::new(),
            clock,
            available: AtomicBool::new(true),
            fail_deletes: AtomicBool::new(false),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        }
    }

    /// Take the tier offline (every call fails) or bring it back
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make deletes fail while reads and writes keep working
    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Whether an unexpired entry exists
    pub fn contains(&self, key: &CacheKey) -> bool {
        let now = self.clock.now();
        self.storage
            .get(key)
            .map(|item| item.expires_at > now)
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn deletes(&self) -> u64 {
        self.deletes.load(Ordering::Relaxed)
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::SharedTierUnavailable("connection refused".into()))
        }
    }

    fn live_keys<F>(&self, filter: F) -> Vec<CacheKey>
    where
        F: Fn(&CacheKey, &StoredItem) -> bool,
    {
        let now = self.clock.now();
        self.storage
            .iter()
            .filter(|e| e.value().expires_at > now && filter(e.key(), e.value()))
            .map(|e| e.key().clone())
            .collect()
    }
}

impl Default for InMemorySharedTier {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

#[async_trait]
impl SharedTier for InMemorySharedTier {
    async fn get(&self, key: &CacheKey) -> Result<Option<Bytes>> {
        self.check_available()?;
        self.reads.fetch_add(1, Ordering::Relaxed);

        let now = self.clock.now();
        let expired = match self.storage.get(key) {
            Some(item) if item.expires_at > now => return Ok(Some(item.payload.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.storage.remove_if(key, |_, item| item.expires_at <= now);
        }
        Ok(None)
    }

    async fn set(
        &self,
        key: &CacheKey,
        payload: Bytes,
        ttl: Duration,
        tags: &BTreeSet<String>,
    ) -> Result<()> {
        self.check_available()?;
        self.writes.fetch_add(1, Ordering::Relaxed);

        let item = StoredItem {
            payload,
            expires_at: clock::add(self.clock.now(), ttl),
            tags: tags.clone(),
        };
        self.storage.insert(key.clone(), item);
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool> {
        self.check_available()?;
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(Error::SharedTierUnavailable("delete rejected".into()));
        }
        self.deletes.fetch_add(1, Ordering::Relaxed);
        Ok(self.storage.remove(key).is_some())
    }

    async fn keys_tagged(&self, tag: &str) -> Result<Vec<CacheKey>> {
        self.check_available()?;
        Ok(self.live_keys(|_, item| item.tags.contains(tag)))
    }

    async fn keys_matching(&self, pattern_expr: &str) -> Result<Vec<CacheKey>> {
        self.check_available()?;
        Ok(self.live_keys(|key, _| key.matches(pattern_expr)))
    }

    async fn ping(&self) -> Result<()> {
        self.check_available()
    }
}

#[async_trait]
impl LockStore for InMemorySharedTier {
    async fn try_acquire(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool> {
        self.check_available()?;
        let now = self.clock.now();
        let lock = Lock::new(name, owner, clock::add(now, ttl));

        match self.locks.entry(name.to_string()) {
            Entry::Occupied(mut held) => {
                if held.get().is_expired_at(now) {
                    held.insert(lock);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(lock);
                Ok(true)
            }
        }
    }

    async fn release(&self, name: &str, owner: &str) -> Result<bool> {
        self.check_available()?;
        Ok(self
            .locks
            .remove_if(name, |_, lock| lock.owner == owner)
            .is_some())
    }

    async fn is_held(&self, name: &str) -> Result<bool> {
        self.check_available()?;
        let now = self.clock.now();
        Ok(self
            .locks
            .get(name)
            .map(|lock| !lock.is_expired_at(now))
            .unwrap_or(false))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn tier() -> (Arc<ManualClock>, InMemorySharedTier) {
        let clock = Arc::new(ManualClock::new());
        let tier = InMemorySharedTier::new(clock.clone());
        (clock, tier)
    }

    fn tags(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|t| t.to_string()).collect()
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let (_, tier) = tier();
        let key = CacheKey::new("user", "u1");

        tier.set(&key, Bytes::from_static(b"payload"), Duration::from_secs(60), &tags(&[]))
            .await
            .unwrap();
        assert_eq!(tier.get(&key).await.unwrap(), Some(Bytes::from_static(b"payload")));

        assert!(tier.delete(&key).await.unwrap());
        assert!(!tier.delete(&key).await.unwrap());
        assert_eq!(tier.get(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let (clock, tier) = tier();
        let key = CacheKey::new("event", "e1");
        tier.set(&key, Bytes::from_static(b"x"), Duration::from_secs(120), &tags(&[]))
            .await
            .unwrap();

        clock.advance(Duration::from_secs(119));
        assert!(tier.get(&key).await.unwrap().is_some());

        clock.advance(Duration::from_secs(1));
        assert!(tier.get(&key).await.unwrap().is_none());
        assert!(tier.is_empty());
    }

    #[tokio::test]
    async fn test_tag_and_pattern_lookup() {
        let (_, tier) = tier();
        let ttl = Duration::from_secs(60);
        tier.set(&CacheKey::new("user", "u1"), Bytes::new(), ttl, &tags(&["org:42"]))
            .await
            .unwrap();
        tier.set(&CacheKey::new("event-list", "today"), Bytes::new(), ttl, &tags(&["org:42"]))
            .await
            .unwrap();
        tier.set(&CacheKey::new("user", "u2"), Bytes::new(), ttl, &tags(&[]))
            .await
            .unwrap();

        assert_eq!(tier.keys_tagged("org:42").await.unwrap().len(), 2);
        assert_eq!(tier.keys_matching("user").await.unwrap().len(), 2);
        assert_eq!(tier.keys_matching("event*").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_tier_errors() {
        let (_, tier) = tier();
        tier.set_available(false);

        let key = CacheKey::new("user", "u1");
        assert!(matches!(tier.get(&key).await, Err(Error::SharedTierUnavailable(_))));
        assert!(tier.ping().await.is_err());

        tier.set_available(true);
        assert!(tier.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_lock_exclusive_until_released() {
        let (_, tier) = tier();
        let ttl = Duration::from_secs(30);

        assert!(tier.try_acquire("lock:user:u1", "a", ttl).await.unwrap());
        assert!(!tier.try_acquire("lock:user:u1", "b", ttl).await.unwrap());
        assert!(tier.is_held("lock:user:u1").await.unwrap());

        // Only the owner can release
        assert!(!tier.release("lock:user:u1", "b").await.unwrap());
        assert!(tier.release("lock:user:u1", "a").await.unwrap());
        assert!(!tier.is_held("lock:user:u1").await.unwrap());
        assert!(tier.try_acquire("lock:user:u1", "b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_abandoned_lock_expires() {
        let (clock, tier) = tier();
        let ttl = Duration::from_secs(30);

        assert!(tier.try_acquire("lock:event:e1", "crashed", ttl).await.unwrap());
        clock.advance(Duration::from_secs(29));
        assert!(!tier.try_acquire("lock:event:e1", "next", ttl).await.unwrap());

        clock.advance(Duration::from_secs(1));
        assert!(!tier.is_held("lock:event:e1").await.unwrap());
        assert!(tier.try_acquire("lock:event:e1", "next", ttl).await.unwrap());

        // The crashed owner can no longer release the new holder's lock
        assert!(!tier.release("lock:event:e1", "crashed").await.unwrap());
        assert!(tier.is_held("lock:event:e1").await.unwrap());
    }
}
