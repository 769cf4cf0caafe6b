//! Domain Ports (Port/Adapter Pattern)
//!
//! Abstractions over the collaborators the caching subsystem talks to.
//! Adapters in [`crate::adapters`] provide concrete implementations.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    Caching Subsystem                      │
//! │   SharedTier  │  LockStore  │  ServiceRegistry │ Fetcher  │
//! └──────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                    │
//! │  InMemorySharedTier │ StaticServiceRegistry │ HttpRegistry │
//! └──────────────────────────────────────────────────────────┘
//! ```

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;

use crate::cache::CacheKey;
use crate::error::Result;

// =============================================================================
// Upstream Source
// =============================================================================

/// Caller-supplied source fetch for a single (pattern, key).
///
/// Fetchers are cheap to clone and may be invoked more than once (retries,
/// lock-timeout fallback), so they must be `Fn`, not `FnOnce`.
pub type Fetcher = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Wrap an async closure as a [`Fetcher`].
///
/// ```ignore
/// let fetch = fetcher(move || {
///     let db = db.clone();
///     async move { db.load_user("u1").await }
/// });
/// ```
pub fn fetcher<F, Fut>(f: F) -> Fetcher
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

// =============================================================================
// Shared Tier
// =============================================================================

/// Port for the shared, out-of-process cache tier.
///
/// Multi-reader/multi-writer across process instances. Implementations are
/// expected to expire entries on their own once `ttl` elapses; the subsystem
/// always passes the full stale window as `ttl`.
#[async_trait]
pub trait SharedTier: Send + Sync {
    /// Fetch an encoded entry.
    async fn get(&self, key: &CacheKey) -> Result<Option<Bytes>>;

    /// Store an encoded entry with its dependency tags.
    async fn set(
        &self,
        key: &CacheKey,
        payload: Bytes,
        ttl: Duration,
        tags: &BTreeSet<String>,
    ) -> Result<()>;

    /// Remove an entry. Returns whether anything was removed.
    async fn delete(&self, key: &CacheKey) -> Result<bool>;

    /// Keys of entries carrying `tag`.
    async fn keys_tagged(&self, tag: &str) -> Result<Vec<CacheKey>>;

    /// Keys whose pattern matches a glob expression.
    async fn keys_matching(&self, pattern_expr: &str) -> Result<Vec<CacheKey>>;

    /// Check reachability.
    async fn ping(&self) -> Result<()>;
}

// =============================================================================
// Locks
// =============================================================================

/// Port for advisory, TTL-bounded mutual exclusion.
///
/// A lock always carries an expiry; once it passes, the lock is acquirable
/// by anyone regardless of whether its owner released it.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Acquire `name` for `owner` if free or expired.
    async fn try_acquire(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool>;

    /// Release `name` if still held by `owner`.
    async fn release(&self, name: &str, owner: &str) -> Result<bool>;

    /// Whether `name` is currently held by anyone.
    async fn is_held(&self, name: &str) -> Result<bool>;
}

// =============================================================================
// Service Registry
// =============================================================================

/// Port for the external service registry, consulted read-only.
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// Whether the named upstream service currently reports healthy.
    async fn is_healthy(&self, service: &str) -> Result<bool>;
}

// =============================================================================
// Tests
// =============================================================================
