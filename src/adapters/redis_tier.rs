//! Redis Shared Tier
//!
//! The out-of-process tier shared by every instance, and the keyspace for
//! stampede locks. Expiry is left to Redis (`PX`), so entries and locks
//! age out even when no instance is running.
//!
//! Keyspace, under a configurable prefix:
//!
//! | Key                                   | Holds                            |
//! |---------------------------------------|----------------------------------|
//! | `{prefix}:entry:{pattern}:{key}`      | encoded envelope                 |
//! | `{prefix}:tag:{tag}`                  | set of entry keys carrying `tag` |
//! | lock names (already namespaced)       | owner token                      |
//!
//! Pattern and key are percent-encoded so a `:` inside either cannot shift
//! the split when keys are read back from a scan.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use deadpool_redis::{Config, Pool, PoolConfig, Runtime};
use redis::{AsyncCommands, Script};
use tracing::{debug, info, warn};

use crate::cache::CacheKey;
use crate::config::CacheSettings;
use crate::domain::ports::{LockStore, SharedTier};
use crate::error::{Error, Result};

/// Writes the entry and adds it to each tag set; a tag set lives as long
/// as its longest-lived member.
const SET_WITH_TAGS: &str = r#"
redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
local ttl = tonumber(ARGV[2])
for i = 2, #KEYS do
  redis.call('SADD', KEYS[i], KEYS[1])
  if redis.call('PTTL', KEYS[i]) < ttl then
    redis.call('PEXPIRE', KEYS[i], ttl)
  end
end
return 1
"#;

/// Deletes the lock only while it still carries the caller's token
const RELEASE_IF_OWNER: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

const SCAN_BATCH: usize = 500;

/// Shared tier and lock store backed by a Redis connection pool
#[derive(Clone)]
pub struct RedisSharedTier {
    pool: Pool,
    prefix: String,
    set_with_tags: Script,
    release_if_owner: Script,
}

impl RedisSharedTier {
    /// Wrap an existing pool
    pub fn new(pool: Pool, prefix: impl Into<String>) -> Self {
        Self {
            pool,
            prefix: prefix.into(),
            set_with_tags: Script::new(SET_WITH_TAGS),
            release_if_owner: Script::new(RELEASE_IF_OWNER),
        }
    }

    /// Build a pool from `url` and check that the server answers
    pub async fn connect(url: &str, settings: &CacheSettings) -> Result<Self> {
        let timeout = Duration::from_millis(settings.redis_timeout_ms);

        let mut pool_config = PoolConfig::new(settings.redis_pool_size.max(1));
        pool_config.timeouts.wait = Some(timeout);
        pool_config.timeouts.create = Some(timeout);
        pool_config.timeouts.recycle = Some(timeout);

        let mut config = Config::from_url(url);
        config.pool = Some(pool_config);

        let pool = config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| Error::Config(format!("Invalid Redis configuration: {}", e)))?;

        let tier = Self::new(pool, settings.redis_key_prefix.clone());
        tier.ping().await?;
        info!(prefix = %tier.prefix, "connected to Redis shared tier");
        Ok(tier)
    }

    fn entry_key(&self, key: &CacheKey) -> String {
        format!(
            "{}:entry:{}:{}",
            self.prefix,
            urlencoding::encode(key.pattern()),
            urlencoding::encode(key.key())
        )
    }

    fn tag_key(&self, tag: &str) -> String {
        format!("{}:tag:{}", self.prefix, tag)
    }

    /// Inverse of [`Self::entry_key`]
    fn parse_entry_key(&self, raw: &str) -> Option<CacheKey> {
        let rest = raw.strip_prefix(&self.prefix)?.strip_prefix(":entry:")?;
        let (pattern, key) = rest.split_once(':')?;
        let pattern = urlencoding::decode(pattern).ok()?;
        let key = urlencoding::decode(key).ok()?;
        Some(CacheKey::new(pattern.into_owned(), key.into_owned()))
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection> {
        Ok(self.pool.get().await?)
    }

    /// Every live entry key, via incremental `SCAN`
    async fn scan_entries(&self) -> Result<Vec<String>> {
        let mut conn = self.connection().await?;
        let pattern = format!("{}:entry:*", self.prefix);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }
}

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl SharedTier for RedisSharedTier {
    async fn get(&self, key: &CacheKey) -> Result<Option<Bytes>> {
        let mut conn = self.connection().await?;
        let payload: Option<Vec<u8>> = conn.get(self.entry_key(key)).await?;
        Ok(payload.map(Bytes::from))
    }

    async fn set(
        &self,
        key: &CacheKey,
        payload: Bytes,
        ttl: Duration,
        tags: &BTreeSet<String>,
    ) -> Result<()> {
        let mut conn = self.connection().await?;
        let mut invocation = self.set_with_tags.key(self.entry_key(key));
        for tag in tags {
            invocation.key(self.tag_key(tag));
        }
        let _: i64 = invocation
            .arg(payload.as_ref())
            .arg(millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool> {
        let mut conn = self.connection().await?;
        let removed: i64 = conn.del(self.entry_key(key)).await?;
        Ok(removed > 0)
    }

    async fn keys_tagged(&self, tag: &str) -> Result<Vec<CacheKey>> {
        let mut conn = self.connection().await?;
        let tag_key = self.tag_key(tag);
        let members: Vec<String> = conn.smembers(&tag_key).await?;

        let mut live = Vec::with_capacity(members.len());
        for member in members {
            let exists: bool = conn.exists(&member).await?;
            match self.parse_entry_key(&member) {
                Some(key) if exists => live.push(key),
                _ => {
                    // Entry expired or was deleted since it was tagged
                    let _: i64 = conn.srem(&tag_key, &member).await?;
                }
            }
        }
        debug!(tag, live = live.len(), "tag index lookup");
        Ok(live)
    }

    async fn keys_matching(&self, pattern_expr: &str) -> Result<Vec<CacheKey>> {
        let raw = self.scan_entries().await?;
        Ok(raw
            .iter()
            .filter_map(|raw| {
                let parsed = self.parse_entry_key(raw);
                if parsed.is_none() {
                    warn!(key = %raw, "skipping unparseable shared tier key");
                }
                parsed
            })
            .filter(|key| key.matches(pattern_expr))
            .collect())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl LockStore for RedisSharedTier {
    async fn try_acquire(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(name)
            .arg(owner)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn release(&self, name: &str, owner: &str) -> Result<bool> {
        let mut conn = self.connection().await?;
        let removed: i64 = self
            .release_if_owner
            .key(name)
            .arg(owner)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn is_held(&self, name: &str) -> Result<bool> {
        let mut conn = self.connection().await?;
        Ok(conn.exists(name).await?)
    }
}

// =============================================================================
// Tests
// =============================================================================
