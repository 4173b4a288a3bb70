//! Domain-driven configuration management for Conduit
//!
//! This crate provides modular configuration split by functional domains,
//! with validation, defaults, and environment variable support. The
//! resilience domain describes retry, circuit breaker and rate limit settings
//! per remote provider; the runtime types in `conduit-resilience` are built
//! from it.

pub mod error;
pub mod loader;
pub mod validation;

// Domain-specific configuration modules
pub mod domains;

// Re-export main types
pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;

// Re-export domain configurations
pub use domains::{
    logging::LoggingConfig,
    resilience::{
        CircuitBreakerConfig, RateLimitConfig, ResilienceConfig, ResilienceProfile,
        RetryConfig, RouteLimitConfig,
    },
    ConduitConfig,
};
