//! HTTP adapter glue for Conduit
//!
//! Routes `reqwest` requests through a [`ResilienceOrchestrator`], classifies
//! HTTP failures for retry, honours `Retry-After` and keeps per-route rate
//! limit buckets in sync with what the server reports.
//!
//! [`ResilienceOrchestrator`]: conduit_resilience::ResilienceOrchestrator

pub mod client;
pub mod config;
pub mod errors;
pub mod retry_after;

// Re-export main types for convenience
pub use client::ResilientClient;
pub use config::HttpConfig;
pub use errors::HttpError;
pub use retry_after::{parse_retry_after, retry_after_from_headers};
