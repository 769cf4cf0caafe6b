//! Invalidation Ingress
//!
//! Entry points for change notifications pushed over HTTP:
//!
//! - `POST /invalidate`: an [`InvalidationEvent`], queued for the consumer
//!   task; answers `202` or `503` when the queue is full or closed
//! - `POST /events`: a [`ServiceEvent`], routed through the rule table now;
//!   answers with the merged [`InvalidationOutcome`](crate::InvalidationOutcome)

use std::sync::Arc;

use hyper::StatusCode;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::domain::events::{InvalidationEvent, ServiceEvent};
use crate::subsystem::CacheSubsystem;

/// Largest accepted request body
pub const MAX_BODY_BYTES: usize = 64 * 1024;

/// Status and JSON body of an ingress call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressReply {
    pub status: StatusCode,
    pub body: String,
}

impl IngressReply {
    fn new(status: StatusCode, body: serde_json::Value) -> Self {
        Self {
            status,
            body: body.to_string(),
        }
    }

    fn error(status: StatusCode, message: impl std::fmt::Display) -> Self {
        Self::new(status, serde_json::json!({ "error": message.to_string() }))
    }
}

/// Accepts pushed invalidations for one subsystem
#[derive(Clone)]
pub struct Ingress {
    subsystem: Arc<CacheSubsystem>,
    events: mpsc::Sender<InvalidationEvent>,
}

impl Ingress {
    pub fn new(subsystem: Arc<CacheSubsystem>, events: mpsc::Sender<InvalidationEvent>) -> Self {
        Self { subsystem, events }
    }

    /// `POST /invalidate`
    pub fn invalidate(&self, body: &[u8]) -> IngressReply {
        let event: InvalidationEvent = match serde_json::from_slice(body) {
            Ok(event) => event,
            Err(e) => return IngressReply::error(StatusCode::BAD_REQUEST, e),
        };
        let key = event.cache_key();

        match self.events.try_send(event) {
            Ok(()) => {
                debug!(%key, "invalidation queued");
                IngressReply::new(StatusCode::ACCEPTED, serde_json::json!({ "queued": true }))
            }
            Err(TrySendError::Full(_)) => {
                warn!(%key, "invalidation queue full, rejecting");
                IngressReply::error(StatusCode::SERVICE_UNAVAILABLE, "invalidation queue full")
            }
            Err(TrySendError::Closed(_)) => {
                IngressReply::error(StatusCode::SERVICE_UNAVAILABLE, "shutting down")
            }
        }
    }

    /// `POST /events`
    pub async fn service_event(&self, body: &[u8]) -> IngressReply {
        let event: ServiceEvent = match serde_json::from_slice(body) {
            Ok(event) => event,
            Err(e) => return IngressReply::error(StatusCode::BAD_REQUEST, e),
        };
        if self.subsystem.is_shut_down() {
            return IngressReply::error(StatusCode::SERVICE_UNAVAILABLE, "shutting down");
        }

        let outcome = self.subsystem.invalidate_by_service_event(&event).await;
        match serde_json::to_value(outcome) {
            Ok(body) => IngressReply::new(StatusCode::OK, body),
            Err(e) => IngressReply::error(StatusCode::INTERNAL_SERVER_ERROR, e),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
