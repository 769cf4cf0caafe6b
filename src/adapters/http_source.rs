//! HTTP Source
//!
//! Builds fetchers for catalogued warming items: `GET {url}`, any 2xx with a
//! JSON body is the value.

use std::time::Duration;

use anyhow::Context;
use reqwest::Client;
use serde_json::Value;

use crate::domain::ports::{fetcher, Fetcher};
use crate::error::{Error, Result};

/// Shared HTTP client for upstream reads
#[derive(Clone)]
pub struct HttpSource {
    client: Client,
}

impl HttpSource {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    /// Fetcher reading `url`
    pub fn fetcher(&self, url: impl Into<String>) -> Fetcher {
        let client = self.client.clone();
        let url = url.into();
        fetcher(move || {
            let client = client.clone();
            let url = url.clone();
            async move {
                let response = client
                    .get(&url)
                    .send()
                    .await
                    .with_context(|| format!("GET {}", url))?
                    .error_for_status()?;
                let value: Value = response
                    .json()
                    .await
                    .with_context(|| format!("decoding JSON from {}", url))?;
                Ok(value)
            }
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
