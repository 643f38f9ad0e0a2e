//! mnem-core - Client-side resilience core for mnem
//!
//! This crate provides everything the `mnem` CLI needs to talk to the memory
//! service reliably:
//!
//! - **credentials**: Opaque key-value credential storage
//! - **session**: TTL-cached credential validation with failure backoff
//! - **transport**: Protocol endpoint selection, heartbeat and direct-API fallback
//! - **lifecycle**: Memory state machine, bulk transitions and audit history
//! - **api**: Remote memory API client (`client` feature)
//! - **retry**: Shared backoff policy and retry loop
//! - **context**: Composition root wiring the above together

pub mod api;
pub mod config;
pub mod context;
pub mod credentials;
pub mod error;
pub mod lifecycle;
pub mod retry;
pub mod session;
pub mod transport;
pub mod types;

// Re-export commonly used types
pub use config::MnemConfig;
pub use context::{ContextParts, MnemContext};
pub use error::{Error, Result};
