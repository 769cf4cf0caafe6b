//! Subsystem Configuration
//!
//! All recognized cache options with their defaults. Settings can be built in
//! code, deserialized from YAML, or overridden from the command line.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::Ttl;
use crate::error::{Error, Result};
use crate::warming::{UsageSignal, WarmingPriority};

/// Recognized configuration options for the caching subsystem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheSettings {
    /// Default fresh window in seconds
    pub fresh_ttl_seconds: u64,
    /// Stale window = fresh window × multiplier
    pub stale_ttl_multiplier: f64,
    /// TTL on stampede and refresh locks
    pub lock_ttl_seconds: u64,
    /// Bounded wait on a lock held by another caller
    pub lock_wait_timeout_ms: u64,
    /// Poll cadence while waiting on a held lock
    pub lock_poll_interval_ms: u64,
    /// Upper bound on a single fetcher call
    pub fetch_timeout_seconds: u64,
    /// Warming worker pool size
    pub max_concurrent_warming_workers: usize,
    /// Background revalidation worker pool size
    pub max_background_refreshes: usize,
    /// Retries after a failed background refresh
    pub revalidation_retry_limit: u32,
    /// Fixed delay before a background refresh retry
    pub revalidation_retry_delay_ms: u64,
    /// Fraction of the fresh lifetime after which an early refresh is triggered
    pub early_refresh_threshold_fraction: f64,
    /// Fresh window for cached fallback values
    pub fallback_ttl_seconds: u64,
    /// Byte budget for the local tier
    pub local_capacity_bytes: u64,
    /// Minimum reported size for size-pressure invalidation to proceed
    pub size_pressure_threshold_bytes: u64,
    /// Shared-tier payloads larger than this are compressed
    pub compression_threshold_bytes: usize,
    /// Cadence of the scheduled critical-key sweep
    pub critical_sweep_interval_seconds: u64,
    /// Cadence of service registry health polling
    pub health_check_interval_seconds: u64,
    /// Unhealthy-source ratio treated as a cascading failure
    pub cascading_failure_ratio: f64,
    /// Namespace for every key the shared tier writes
    pub redis_key_prefix: String,
    /// Connections kept to the shared tier
    pub redis_pool_size: usize,
    /// Connect, checkout and recycle timeout for shared-tier connections
    pub redis_timeout_ms: u64,
    /// Items warmed by the background sweeps
    pub warming: WarmingCatalogSettings,
}

/// A catalogued warming item, fetched from `url` (JSON body)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmingItemSettings {
    pub pattern: String,
    pub key: String,
    #[serde(default = "default_priority")]
    pub priority: WarmingPriority,
    pub url: String,
    /// Overrides `freshTtlSeconds` for this item
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fresh_ttl_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

fn default_priority() -> WarmingPriority {
    WarmingPriority::Medium
}

/// Warming catalog: critical keys, per-source keys and predictive keys
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WarmingCatalogSettings {
    pub critical: Vec<WarmingItemSettings>,
    /// Keyed by the upstream service the items depend on
    pub sources: BTreeMap<String, Vec<WarmingItemSettings>>,
    pub predictive: HashMap<UsageSignal, Vec<WarmingItemSettings>>,
}

impl WarmingCatalogSettings {
    pub fn len(&self) -> usize {
        self.items().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn items(&self) -> impl Iterator<Item = &WarmingItemSettings> {
        self.critical
            .iter()
            .chain(self.sources.values().flatten())
            .chain(self.predictive.values().flatten())
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            fresh_ttl_seconds: 300,
            stale_ttl_multiplier: 2.0,
            lock_ttl_seconds: 30,
            lock_wait_timeout_ms: 5_000,
            lock_poll_interval_ms: 20,
            fetch_timeout_seconds: 10,
            max_concurrent_warming_workers: 5,
            max_background_refreshes: 16,
            revalidation_retry_limit: 1,
            revalidation_retry_delay_ms: 1_000,
            early_refresh_threshold_fraction: 0.9,
            fallback_ttl_seconds: 30,
            local_capacity_bytes: 256 * 1024 * 1024,
            size_pressure_threshold_bytes: 1024 * 1024,
            compression_threshold_bytes: 4 * 1024,
            critical_sweep_interval_seconds: 300,
            health_check_interval_seconds: 30,
            cascading_failure_ratio: 0.5,
            redis_key_prefix: "couchecache".to_string(),
            redis_pool_size: 16,
            redis_timeout_ms: 500,
            warming: WarmingCatalogSettings::default(),
        }
    }
}

impl CacheSettings {
    /// Parse settings from a YAML document
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let settings: CacheSettings = serde_yaml::from_str(yaml)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&raw)
    }

    /// Reject inconsistent settings
    pub fn validate(&self) -> Result<()> {
        if self.fresh_ttl_seconds == 0 {
            return Err(Error::Config("freshTtlSeconds must be positive".into()));
        }
        if !(self.stale_ttl_multiplier >= 1.0) {
            return Err(Error::Config(format!(
                "staleTtlMultiplier must be >= 1.0, got {}",
                self.stale_ttl_multiplier
            )));
        }
        if self.lock_ttl_seconds <= self.fetch_timeout_seconds {
            return Err(Error::Config(format!(
                "lockTtlSeconds ({}) must exceed fetchTimeoutSeconds ({})",
                self.lock_ttl_seconds, self.fetch_timeout_seconds
            )));
        }
        if self.lock_poll_interval_ms == 0 || self.lock_wait_timeout_ms == 0 {
            return Err(Error::Config(
                "lock wait timeout and poll interval must be positive".into(),
            ));
        }
        if self.max_concurrent_warming_workers == 0 || self.max_background_refreshes == 0 {
            return Err(Error::Config("worker pool sizes must be positive".into()));
        }
        if !(self.early_refresh_threshold_fraction > 0.0
            && self.early_refresh_threshold_fraction <= 1.0)
        {
            return Err(Error::Config(format!(
                "earlyRefreshThresholdFraction must be in (0, 1], got {}",
                self.early_refresh_threshold_fraction
            )));
        }
        if self.critical_sweep_interval_seconds == 0 || self.health_check_interval_seconds == 0 {
            return Err(Error::Config("warming intervals must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.cascading_failure_ratio) {
            return Err(Error::Config(format!(
                "cascadingFailureRatio must be in [0, 1], got {}",
                self.cascading_failure_ratio
            )));
        }
        if self.redis_pool_size == 0 || self.redis_timeout_ms == 0 {
            return Err(Error::Config(
                "redisPoolSize and redisTimeoutMs must be positive".into(),
            ));
        }
        if let Some(item) = self
            .warming
            .items()
            .find(|item| item.url.is_empty() || item.fresh_ttl_seconds == Some(0))
        {
            return Err(Error::Config(format!(
                "warming item {}:{} needs a url and a positive freshTtlSeconds",
                item.pattern, item.key
            )));
        }
        Ok(())
    }

    /// Default TTL pair derived from the fresh window and stale multiplier
    pub fn default_ttl(&self) -> Ttl {
        Ttl::with_multiplier(self.fresh_ttl(), self.stale_ttl_multiplier)
    }

    /// TTL pair for a caller-chosen fresh window, stale window derived
    pub fn ttl_for(&self, fresh: Duration) -> Ttl {
        Ttl::with_multiplier(fresh, self.stale_ttl_multiplier)
    }

    pub fn fresh_ttl(&self) -> Duration {
        Duration::from_secs(self.fresh_ttl_seconds)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_seconds)
    }

    pub fn lock_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_wait_timeout_ms)
    }

    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_interval_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_seconds)
    }

    pub fn revalidation_retry_delay(&self) -> Duration {
        Duration::from_millis(self.revalidation_retry_delay_ms)
    }

    /// Fallback values get a short fresh window and no extra stale window
    pub fn fallback_ttl(&self) -> Ttl {
        let ttl = Duration::from_secs(self.fallback_ttl_seconds);
        Ttl::new(ttl, ttl)
    }

    pub fn critical_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.critical_sweep_interval_seconds)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_seconds)
    }
}

// =============================================================================
// Tests
// =============================================================================
