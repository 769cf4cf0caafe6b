//! Domain Layer
//!
//! - **Ports** (`ports.rs`) - trait abstractions for the shared tier, the lock
//!   store, the service registry, and upstream fetchers
//! - **Events** (`events.rs`) - invalidation requests and upstream change events

pub mod events;
pub mod ports;

pub use events::{InvalidationEvent, InvalidationMetadata, InvalidationReason, ServiceEvent};
pub use ports::{fetcher, Fetcher, LockStore, ServiceRegistry, SharedTier};
