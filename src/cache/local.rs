//! Local Tier - In-Process Cache
//!
//! Process-owned tier that never suspends. Entries are kept until their stale
//! expiry; the byte budget is enforced with high/low watermark eviction that
//! drops expired entries first and then the most idle, least used ones.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::entry::{CacheEntry, CacheKey, EntryState};

/// Local tier configuration
#[derive(Debug, Clone)]
pub struct LocalTierConfig {
    /// Maximum capacity in bytes
    pub capacity: u64,
    /// High watermark fraction (trigger eviction)
    pub high_watermark: f64,
    /// Low watermark fraction (stop eviction)
    pub low_watermark: f64,
    /// Maximum entries evicted per pass
    pub eviction_batch_size: usize,
}

impl Default for LocalTierConfig {
    fn default() -> Self {
        Self {
            capacity: 256 * 1024 * 1024,
            high_watermark: 0.90,
            low_watermark: 0.80,
            eviction_batch_size: 1000,
        }
    }
}

impl LocalTierConfig {
    /// Default watermarks with a custom byte budget
    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            capacity,
            ..Default::default()
        }
    }
}

/// Local tier - in-process map with byte accounting
pub struct LocalTier {
    storage: DashMap<CacheKey, CacheEntry>,
    config: LocalTierConfig,
    current_size: AtomicU64,
    evictions: AtomicU64,
}

impl LocalTier {
    /// Create a new local tier with default configuration
    pub fn new() -> Self {
        Self::with_config(LocalTierConfig::default())
    }

    /// Create a new local tier with custom configuration
    pub fn with_config(config: LocalTierConfig) -> Self {
        Self {
            storage: DashMap::new(),
            config,
            current_size: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Get a servable entry; entries past their stale expiry are dropped
    pub fn get(&self, key: &CacheKey, now: DateTime<Utc>) -> Option<CacheEntry> {
        let entry = {
            let guard = self.storage.get(key)?;
            if guard.state_at(now) == EntryState::Absent {
                None
            } else {
                guard.record_access(now);
                Some(guard.value().clone())
            }
        };

        if entry.is_none() {
            self.remove(key);
        }
        entry
    }

    /// Insert or replace an entry. Returns false if it can never fit the budget.
    pub fn put(&self, key: CacheKey, entry: CacheEntry, now: DateTime<Utc>) -> bool {
        let size = entry.size();

        if size > self.config.capacity {
            return false;
        }

        if self.should_evict(size) {
            self.evict(now);
        }

        match self.storage.insert(key, entry) {
            Some(old) => {
                let old_size = old.size();
                if size > old_size {
                    self.current_size
                        .fetch_add(size - old_size, Ordering::Relaxed);
                } else {
                    self.current_size
                        .fetch_sub(old_size - size, Ordering::Relaxed);
                }
            }
            None => {
                self.current_size.fetch_add(size, Ordering::Relaxed);
            }
        }

        true
    }

    /// Remove an entry
    pub fn remove(&self, key: &CacheKey) -> Option<CacheEntry> {
        let (_, removed) = self.storage.remove(key)?;
        self.current_size
            .fetch_sub(removed.size(), Ordering::Relaxed);
        Some(removed)
    }

    /// Check presence regardless of freshness
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.storage.contains_key(key)
    }

    /// Peek at an entry without touching access statistics or expiry
    pub fn peek(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.storage.get(key).map(|e| e.value().clone())
    }

    /// Keys whose pattern matches the expression
    pub fn keys_matching(&self, pattern_expr: &str) -> Vec<CacheKey> {
        self.storage
            .iter()
            .filter(|e| e.key().matches(pattern_expr))
            .map(|e| e.key().clone())
            .collect()
    }

    /// Keys whose entry carries the tag
    pub fn keys_tagged(&self, tag: &str) -> Vec<CacheKey> {
        self.storage
            .iter()
            .filter(|e| e.value().tags().contains(tag))
            .map(|e| e.key().clone())
            .collect()
    }

    fn should_evict(&self, incoming: u64) -> bool {
        let projected = (self.current_size.load(Ordering::Relaxed) + incoming) as f64;
        projected / self.config.capacity as f64 >= self.config.high_watermark
    }

    fn should_continue_eviction(&self) -> bool {
        let current = self.current_size.load(Ordering::Relaxed) as f64;
        current / self.config.capacity as f64 > self.config.low_watermark
    }

    /// Evict entries until the low watermark is reached
    fn evict(&self, now: DateTime<Utc>) {
        let mut candidates: Vec<(CacheKey, f64)> = self
            .storage
            .iter()
            .map(|e| {
                let score = if e.state_at(now) == EntryState::Absent {
                    f64::MAX
                } else {
                    e.eviction_score(now)
                };
                (e.key().clone(), score)
            })
            .collect();

        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut evicted = 0;
        for (key, score) in candidates {
            // Expired entries always go, live ones only while above the low watermark
            if score != f64::MAX && !self.should_continue_eviction() {
                break;
            }
            if self.remove(&key).is_some() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                evicted += 1;
                if evicted >= self.config.eviction_batch_size {
                    break;
                }
            }
        }

        tracing::debug!(evicted, size = self.size(), "local tier eviction pass");
    }

    /// Current size in bytes
    pub fn size(&self) -> u64 {
        self.current_size.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> u64 {
        self.config.capacity
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.storage.clear();
        self.current_size.store(0, Ordering::Relaxed);
    }

    /// Utilization fraction (0.0 - 1.0)
    pub fn utilization(&self) -> f64 {
        self.size() as f64 / self.capacity() as f64
    }
}

impl Default for LocalTier {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
