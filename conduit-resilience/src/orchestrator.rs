//! Composition of rate limiting, circuit breaking and retry into one call path
//!
//! Every call passes the layers in a fixed order:
//!
//! 1. rate limiter admission (may suspend)
//! 2. circuit breaker admission (fails fast while open)
//! 3. retry executor around the operation
//!
//! The breaker therefore sees only the aggregate outcome of all retry
//! attempts: a failure recovered by a retry is never counted, and a failure
//! that survives every retry counts exactly once.

use log::debug;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::error::{Classifier, ResilienceError, Retryable};
use crate::hooks::HookRegistry;
use crate::rate_limit::{
    Admission, AdmissionRequest, BucketRateLimiter, RateLimiter, RateLimiterConfig,
    RouteLimitConfig,
};
use crate::retry::{RetryExecutor, RetryPolicy};

/// Per-call options
pub struct CallOptions<E> {
    classifier: Classifier<E>,
    route: Option<String>,
    estimated_cost: Option<u64>,
    cancel: CancellationToken,
}

impl<E> CallOptions<E> {
    pub fn new(classifier: Classifier<E>) -> Self {
        Self {
            classifier,
            route: None,
            estimated_cost: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Route key for the per-route limiter
    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }

    /// Estimated token cost charged against the window budget
    pub fn with_estimated_cost(mut self, cost: u64) -> Self {
        self.estimated_cost = Some(cost);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_classifier(mut self, classifier: Classifier<E>) -> Self {
        self.classifier = classifier;
        self
    }
}

impl<E: Retryable> Default for CallOptions<E> {
    fn default() -> Self {
        Self::new(Classifier::retryable())
    }
}

/// Single entry point protecting every outbound call to one target
pub struct ResilienceOrchestrator {
    name: String,
    retry: RetryExecutor,
    breaker: CircuitBreaker,
    rate_limiter: Option<Arc<RateLimiter>>,
    route_limiter: Option<Arc<BucketRateLimiter>>,
    admissions: Vec<Arc<dyn Admission>>,
    hooks: HookRegistry,
}

impl ResilienceOrchestrator {
    pub fn builder(name: impl Into<String>) -> OrchestratorBuilder {
        OrchestratorBuilder::new(name)
    }

    /// Build an orchestrator from a configuration profile
    pub fn from_profile(
        name: impl Into<String>,
        profile: &conduit_config::ResilienceProfile,
        hooks: HookRegistry,
    ) -> Self {
        let mut builder = Self::builder(name)
            .retry_policy(RetryPolicy::from(&profile.retry))
            .circuit_breaker(CircuitBreakerConfig::from(&profile.circuit_breaker))
            .hooks(hooks);

        if let Some(ref rate_limit) = profile.rate_limit {
            builder = builder.rate_limit(RateLimiterConfig::from(rate_limit));
        }
        if let Some(ref route_limits) = profile.route_limits {
            builder = builder.route_limits(RouteLimitConfig::from(route_limits));
        }

        builder.build()
    }

    /// Run `operation` with the error type's own retry classification
    pub async fn execute<F, Fut, T, E>(&self, mut operation: F) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        self.execute_with(CallOptions::default(), |_attempt| operation())
            .await
    }

    /// Run `operation` through every layer
    ///
    /// `operation` receives the 1-based attempt number. Cancellation at any
    /// suspension point resolves to [`ResilienceError::Cancelled`] and leaves
    /// the circuit breaker's counters untouched.
    pub async fn execute_with<F, Fut, T, E>(
        &self,
        options: CallOptions<E>,
        operation: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let CallOptions {
            classifier,
            route,
            estimated_cost,
            cancel,
        } = options;

        let request = AdmissionRequest {
            route: route.as_deref(),
            cost: estimated_cost,
        };
        for admission in &self.admissions {
            admission.admit(&request, &cancel).await?;
        }

        let permit = self.breaker.try_acquire()?;

        match self
            .retry
            .execute_with_context(operation, &classifier, &cancel)
            .await
        {
            Ok(value) => {
                permit.record_success();
                Ok(value)
            }
            Err(ResilienceError::Cancelled) => {
                debug!("{}: call cancelled, circuit breaker not updated", self.name);
                drop(permit);
                Err(ResilienceError::Cancelled)
            }
            Err(error) => {
                permit.record_failure();
                Err(error)
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        self.retry.policy()
    }

    /// Provider-wide fixed-window limiter, when configured
    pub fn rate_limiter(&self) -> Option<&Arc<RateLimiter>> {
        self.rate_limiter.as_ref()
    }

    /// Per-route limiter, when configured; feed it response headers
    pub fn route_limiter(&self) -> Option<&Arc<BucketRateLimiter>> {
        self.route_limiter.as_ref()
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }
}

impl std::fmt::Debug for ResilienceOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceOrchestrator")
            .field("name", &self.name)
            .field("retry", self.retry.policy())
            .field("breaker", &self.breaker)
            .field("rate_limiter", &self.rate_limiter)
            .field("route_limiter", &self.route_limiter)
            .field("admissions", &self.admissions.len())
            .finish()
    }
}

/// Builder for [`ResilienceOrchestrator`]
pub struct OrchestratorBuilder {
    name: String,
    retry_policy: RetryPolicy,
    breaker_config: CircuitBreakerConfig,
    rate_limit: Option<RateLimiterConfig>,
    route_limits: Option<RouteLimitConfig>,
    extra_admissions: Vec<Arc<dyn Admission>>,
    hooks: HookRegistry,
}

impl OrchestratorBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            retry_policy: RetryPolicy::default(),
            breaker_config: CircuitBreakerConfig::default(),
            rate_limit: None,
            route_limits: None,
            extra_admissions: Vec::new(),
            hooks: HookRegistry::new(),
        }
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker_config = config;
        self
    }

    pub fn rate_limit(mut self, config: RateLimiterConfig) -> Self {
        self.rate_limit = Some(config);
        self
    }

    pub fn route_limits(mut self, config: RouteLimitConfig) -> Self {
        self.route_limits = Some(config);
        self
    }

    /// Add a custom admission gate, consulted after the built-in limiters
    pub fn admission(mut self, admission: Arc<dyn Admission>) -> Self {
        self.extra_admissions.push(admission);
        self
    }

    /// Hook registry shared by every layer
    pub fn hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn build(self) -> ResilienceOrchestrator {
        let rate_limiter = self.rate_limit.map(|config| {
            Arc::new(RateLimiter::new(self.name.clone(), config).with_hooks(self.hooks.clone()))
        });
        let route_limiter = self.route_limits.map(|config| {
            Arc::new(BucketRateLimiter::new(config).with_hooks(self.hooks.clone()))
        });

        let mut admissions: Vec<Arc<dyn Admission>> = Vec::new();
        if let Some(ref limiter) = rate_limiter {
            admissions.push(limiter.clone());
        }
        if let Some(ref limiter) = route_limiter {
            admissions.push(limiter.clone());
        }
        admissions.extend(self.extra_admissions);

        ResilienceOrchestrator {
            retry: RetryExecutor::new(self.retry_policy)
                .with_target(self.name.clone())
                .with_hooks(self.hooks.clone()),
            breaker: CircuitBreaker::new(self.name.clone(), self.breaker_config)
                .with_hooks(self.hooks.clone()),
            name: self.name,
            rate_limiter,
            route_limiter,
            admissions,
            hooks: self.hooks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;
    use crate::error::LimitError;
    use async_trait::async_trait;
    use std::fmt;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    struct CallError(&'static str);

    impl fmt::Display for CallError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.0)
        }
    }

    impl Retryable for CallError {
        fn is_retryable(&self) -> bool {
            self.0 == "transient"
        }
    }

    fn orchestrator(max_attempts: u32, failure_threshold: u32) -> ResilienceOrchestrator {
        ResilienceOrchestrator::builder("crm")
            .retry_policy(RetryPolicy {
                max_attempts,
                ..RetryPolicy::default().without_jitter()
            })
            .circuit_breaker(CircuitBreakerConfig {
                failure_threshold,
                ..CircuitBreakerConfig::default()
            })
            .build()
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovered_failure_not_counted() {
        let orchestrator = orchestrator(3, 1);
        let calls = AtomicU32::new(0);

        let result = orchestrator
            .execute(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(CallError("transient"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 1);
        let metrics = orchestrator.circuit_breaker().metrics();
        assert_eq!(metrics.state, CircuitState::Closed);
        assert_eq!(metrics.failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_count_once() {
        let orchestrator = orchestrator(3, 5);
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = orchestrator
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(CallError("transient")) }
            })
            .await;

        assert_eq!(result.unwrap_err().into_inner(), Some(CallError("transient")));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(orchestrator.circuit_breaker().metrics().failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_skips_operation_but_uses_limiter_token() {
        let orchestrator = ResilienceOrchestrator::builder("llm")
            .retry_policy(RetryPolicy::no_retry())
            .circuit_breaker(CircuitBreakerConfig {
                failure_threshold: 1,
                ..CircuitBreakerConfig::default()
            })
            .rate_limit(RateLimiterConfig {
                requests_per_window: 10,
                ..RateLimiterConfig::default()
            })
            .build();
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            let _: Result<(), _> = orchestrator
                .execute(|| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(CallError("permanent")) }
                })
                .await;
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // one token per call, none extra for the fast-failed ones
        let limiter = orchestrator.rate_limiter().unwrap();
        assert_eq!(limiter.state().request_tokens, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_leaves_breaker_untouched() {
        let orchestrator = Arc::new(orchestrator(3, 1));
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let task = {
            let orchestrator = orchestrator.clone();
            let calls = calls.clone();
            let options = CallOptions::<CallError>::default().with_cancel(cancel.clone());
            tokio::spawn(async move {
                orchestrator
                    .execute_with(options, |_| {
                        calls.fetch_add(1, Ordering::SeqCst);
                        async { Err::<(), _>(CallError("transient")) }
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        assert!(task.await.unwrap().unwrap_err().is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let metrics = orchestrator.circuit_breaker().metrics();
        assert_eq!(metrics.state, CircuitState::Closed);
        assert_eq!(metrics.failure_count, 0);
        assert_eq!(metrics.total_requests, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_rate_limited_never_runs_operation() {
        let orchestrator = Arc::new(
            ResilienceOrchestrator::builder("chat")
                .rate_limit(RateLimiterConfig {
                    requests_per_window: 1,
                    ..RateLimiterConfig::default()
                })
                .build(),
        );
        orchestrator
            .execute(|| async { Ok::<_, CallError>(()) })
            .await
            .unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let task = {
            let orchestrator = orchestrator.clone();
            let calls = calls.clone();
            let options = CallOptions::<CallError>::default().with_cancel(cancel.clone());
            tokio::spawn(async move {
                orchestrator
                    .execute_with(options, |_| {
                        calls.fetch_add(1, Ordering::SeqCst);
                        async { Ok(()) }
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();

        assert!(task.await.unwrap().unwrap_err().is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(orchestrator.circuit_breaker().metrics().total_requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_route_limiter_and_custom_admission() {
        struct Deny;

        #[async_trait]
        impl Admission for Deny {
            async fn admit(
                &self,
                request: &AdmissionRequest<'_>,
                _cancel: &CancellationToken,
            ) -> Result<(), LimitError> {
                match request.route {
                    Some("POST /blocked") => Err(LimitError::QueueFull {
                        route: "POST /blocked".to_string(),
                        capacity: 0,
                    }),
                    _ => Ok(()),
                }
            }
        }

        let orchestrator = ResilienceOrchestrator::builder("chat")
            .route_limits(RouteLimitConfig::default())
            .admission(Arc::new(Deny))
            .build();

        let ok = orchestrator
            .execute_with(
                CallOptions::<CallError>::default().with_route("GET /open"),
                |_| async { Ok("sent") },
            )
            .await;
        assert_eq!(ok.unwrap(), "sent");
        assert!(orchestrator.route_limiter().is_some());

        let denied = orchestrator
            .execute_with(
                CallOptions::<CallError>::default().with_route("POST /blocked"),
                |_| async { Ok("sent") },
            )
            .await;
        assert!(denied.unwrap_err().is_fast_fail());
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_classifier_per_call() {
        let orchestrator = orchestrator(3, 5);
        let calls = AtomicU32::new(0);

        let options = CallOptions::new(Classifier::always());
        let _: Result<(), _> = orchestrator
            .execute_with(options, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(CallError("permanent")) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_from_profile() {
        let mut profile = conduit_config::ResilienceProfile::default();
        profile.rate_limit = Some(conduit_config::RateLimitConfig::default());

        let orchestrator =
            ResilienceOrchestrator::from_profile("vector-store", &profile, HookRegistry::new());

        assert_eq!(orchestrator.name(), "vector-store");
        assert_eq!(orchestrator.retry_policy().max_attempts, 3);
        assert!(orchestrator.rate_limiter().is_some());
        assert!(orchestrator.route_limiter().is_none());
        assert_eq!(orchestrator.circuit_breaker().name(), "vector-store");
    }
}
