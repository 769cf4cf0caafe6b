//! Service Registry Adapters
//!
//! Read-only health lookups for upstream services, consulted by the warming
//! engine before it spends capacity on a source.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::Client;
use tracing::{debug, instrument, warn};

use crate::domain::ports::ServiceRegistry;
use crate::error::{Error, Result};

// =============================================================================
// Static Registry
// =============================================================================

/// Registry backed by an in-process table; unknown services are unhealthy
#[derive(Debug, Default)]
pub struct StaticServiceRegistry {
    services: DashMap<String, bool>,
}

impl StaticServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry where every named service is healthy
    pub fn healthy<I, S>(services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let registry = Self::new();
        for service in services {
            registry.set_health(service, true);
        }
        registry
    }

    pub fn set_health(&self, service: impl Into<String>, healthy: bool) {
        self.services.insert(service.into(), healthy);
    }
}

#[async_trait]
impl ServiceRegistry for StaticServiceRegistry {
    async fn is_healthy(&self, service: &str) -> Result<bool> {
        Ok(self.services.get(service).map(|h| *h).unwrap_or(false))
    }
}

// =============================================================================
// HTTP Registry
// =============================================================================

/// Registry reached over HTTP: `GET {base}/services/{name}/health`.
///
/// Any 2xx is healthy. Non-2xx responses and transport errors are unhealthy.
pub struct HttpServiceRegistry {
    base_url: String,
    client: Client,
    last_known: DashMap<String, bool>,
}

impl HttpServiceRegistry {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Registry(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            last_known: DashMap::new(),
        })
    }

    fn health_url(&self, service: &str) -> String {
        format!(
            "{}/services/{}/health",
            self.base_url,
            urlencoding::encode(service)
        )
    }

    /// Most recent answer for `service`, without a network call
    pub fn last_known(&self, service: &str) -> Option<bool> {
        self.last_known.get(service).map(|h| *h)
    }
}

#[async_trait]
impl ServiceRegistry for HttpServiceRegistry {
    #[instrument(skip(self))]
    async fn is_healthy(&self, service: &str) -> Result<bool> {
        let url = self.health_url(service);

        let healthy = match self.client.get(&url).send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                debug!(status = %response.status(), "service reported unhealthy");
                false
            }
            Err(e) => {
                warn!(error = %e, "service registry unreachable");
                false
            }
        };

        self.last_known.insert(service.to_string(), healthy);
        Ok(healthy)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_registry() {
        let registry = StaticServiceRegistry::healthy(["user-service", "event-service"]);
        registry.set_health("event-service", false);

        tokio_test::block_on(async {
            assert!(tokio_test::assert_ok!(registry.is_healthy("user-service").await));
            assert!(!tokio_test::assert_ok!(registry.is_healthy("event-service").await));
            assert!(!tokio_test::assert_ok!(registry.is_healthy("unknown").await));
        });
    }

    #[test]
    fn test_health_url_encodes_service_name() {
        let registry =
            HttpServiceRegistry::new("http://registry:8500/", Duration::from_secs(1)).unwrap();
        assert_eq!(
            registry.health_url("media service"),
            "http://registry:8500/services/media%20service/health"
        );
    }

    #[tokio::test]
    async fn test_unreachable_registry_is_unhealthy() {
        let registry =
            HttpServiceRegistry::new("http://127.0.0.1:1", Duration::from_millis(500)).unwrap();

        assert!(!registry.is_healthy("user-service").await.unwrap());
        assert_eq!(registry.last_known("user-service"), Some(false));
        assert_eq!(registry.last_known("event-service"), None);
    }
}
