//! Resilience patterns for Conduit adapters
//!
//! This crate protects outbound calls to remote services with retry
//! policies, circuit breakers and two rate limiting disciplines, composed
//! by [`ResilienceOrchestrator`] into a single call path.

pub mod backoff;
pub mod circuit_breaker;
pub mod error;
pub mod hooks;
pub mod orchestrator;
pub mod rate_limit;
pub mod registry;
pub mod retry;

// Re-export commonly used types
pub use backoff::BackoffCalculator;
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerBuilder, CircuitBreakerConfig, CircuitMetrics, CircuitPermit,
    CircuitState,
};
pub use error::{CircuitOpenError, Classifier, LimitError, ResilienceError, Retryable};
pub use hooks::{Hook, HookRegistry, ResilienceEvent};
pub use orchestrator::{CallOptions, OrchestratorBuilder, ResilienceOrchestrator};
pub use rate_limit::{
    Admission, AdmissionRequest, Bucket, BucketRateLimiter, RateLimitHeaders, RateLimiter,
    RateLimiterConfig, RateLimiterState, RouteLimitConfig,
};
pub use registry::ResilienceRegistry;
pub use retry::{RetryExecutor, RetryPolicy};

pub use tokio_util::sync::CancellationToken;
