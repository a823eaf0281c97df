//! Signloom Core Library
//!
//! This crate provides the multimodal request dispatch layer for Signloom:
//! - Typed request routing by (request type, modality) pair
//! - Per-route circuit breakers with half-open probing
//! - Bounded retry with exponential backoff and jitter
//! - Multi-level, multi-policy result caching with TTL
//! - Per-handler load and latency statistics with trend alerts
//! - Background maintenance (breaker upkeep, window pruning, cache sweeps)
//!
//! Feature modules (translation, expression generation, tutoring) plug in as
//! [`registry::RequestHandler`] implementations; the dispatcher itself knows
//! nothing about what a handler computes.

pub mod breaker;
pub mod cache;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod maintenance;
pub mod metrics;
pub mod registry;
pub mod request;
pub mod retry;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cache::{Cache, CacheLevel, CacheStore, ReplacementPolicy, SharedCache};
    pub use crate::config::DispatchConfig;
    pub use crate::dispatch::{DispatchOutcome, RequestDispatcher, RequestDispatcherBuilder};
    pub use crate::error::{Error, Result};
    pub use crate::registry::{RequestHandler, RouteConfig};
    pub use crate::request::{DispatchRequest, Modality, Priority};
}
