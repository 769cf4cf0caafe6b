//! Infrastructure Adapters
//!
//! Implementations of the domain ports, following the Port/Adapter
//! (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │      SharedTier  │  LockStore  │  ServiceRegistry           │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ RedisSharedTier │ InMemorySharedTier │ StaticServiceRegistry │ │
//! │  │ HttpServiceRegistry │ PrometheusExporter                    │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use couchecache::adapters::{InMemorySharedTier, StaticServiceRegistry};
//! use couchecache::domain::ports::{SharedTier, ServiceRegistry};
//!
//! let shared = Arc::new(InMemorySharedTier::default());
//! let registry = StaticServiceRegistry::healthy(["user-service"]);
//!
//! assert!(registry.is_healthy("user-service").await?);
//! shared.ping().await?;
//! ```

mod exporter;
mod http_source;
mod memory;
mod redis_tier;
mod registry;

pub use exporter::PrometheusExporter;
pub use http_source::HttpSource;
pub use memory::InMemorySharedTier;
pub use redis_tier::RedisSharedTier;
pub use registry::{HttpServiceRegistry, StaticServiceRegistry};
