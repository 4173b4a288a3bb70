//! Circuit breaker pattern implementation

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{CircuitOpenError, ResilienceError};
use crate::hooks::{HookRegistry, ResilienceEvent};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed, requests pass through normally
    Closed,
    /// Circuit is open, requests are blocked
    Open,
    /// Circuit is half-open, limited requests allowed to test recovery
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures while closed before opening the circuit
    pub failure_threshold: u32,

    /// Number of successes in half-open state before closing
    pub success_threshold: u32,

    /// Time to wait before transitioning from open to half-open
    #[serde(with = "humantime_serde")]
    pub open_duration: Duration,

    /// Concurrent probes admitted while half-open
    pub half_open_max_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_duration: Duration::from_secs(60),
            half_open_max_requests: 1,
        }
    }
}

impl From<&conduit_config::CircuitBreakerConfig> for CircuitBreakerConfig {
    fn from(config: &conduit_config::CircuitBreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            success_threshold: config.success_threshold,
            open_duration: Duration::from_millis(config.open_duration_ms),
            half_open_max_requests: config.half_open_max_requests,
        }
    }
}

impl From<conduit_config::CircuitBreakerConfig> for CircuitBreakerConfig {
    fn from(config: conduit_config::CircuitBreakerConfig) -> Self {
        Self::from(&config)
    }
}

/// Circuit breaker metrics
#[derive(Debug, Clone)]
pub struct CircuitMetrics {
    pub state: CircuitState,
    /// Consecutive failures observed in the current state
    pub failure_count: u32,
    /// Successes observed in the current half-open period
    pub success_count: u32,
    pub last_transition: Instant,
    /// Outcomes recorded through permits
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    /// Number of requests rejected due to open circuit
    pub total_rejected: u64,
}

impl CircuitMetrics {
    fn new(now: Instant) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_transition: now,
            total_requests: 0,
            total_successes: 0,
            total_failures: 0,
            total_rejected: 0,
        }
    }
}

/// Thread-safe circuit breaker implementation
///
/// Clones share state. The lazy Open -> HalfOpen transition and the probe
/// accounting happen under one lock, so callers racing at the end of the
/// cooldown can never exceed `half_open_max_requests`.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: Arc<CircuitBreakerConfig>,
    state: Arc<Mutex<CircuitBreakerState>>,
    hooks: HookRegistry,
}

struct CircuitBreakerState {
    metrics: CircuitMetrics,
    /// Half-open probes currently holding a permit
    probes_in_flight: u32,
    /// Bumped on every transition; permits from older generations are stale
    generation: u64,
}

type Transition = (CircuitState, CircuitState);

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name: String = name.into();
        Self {
            name: Arc::from(name),
            config: Arc::new(config),
            state: Arc::new(Mutex::new(CircuitBreakerState {
                metrics: CircuitMetrics::new(Instant::now()),
                probes_in_flight: 0,
                generation: 0,
            })),
            hooks: HookRegistry::new(),
        }
    }

    /// Create with default configuration
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    pub fn with_hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get the current state
    pub fn state(&self) -> CircuitState {
        self.metrics().state
    }

    /// Get current metrics
    pub fn metrics(&self) -> CircuitMetrics {
        let (metrics, transition) = {
            let mut state = self.state.lock();
            let transition = self.update_state(&mut state, Instant::now());
            (state.metrics.clone(), transition)
        };

        self.notify(transition);
        metrics
    }

    /// Ask to run one call through the breaker
    ///
    /// The returned permit must be settled with
    /// [`CircuitPermit::record_success`] or [`CircuitPermit::record_failure`].
    /// Dropping it unsettled (e.g. the call was cancelled) leaves every
    /// counter untouched and frees its half-open probe slot.
    pub fn try_acquire(&self) -> Result<CircuitPermit, CircuitOpenError> {
        let now = Instant::now();

        let (result, transition) = {
            let mut state = self.state.lock();
            let transition = self.update_state(&mut state, now);

            let result = match state.metrics.state {
                CircuitState::Closed => Ok(self.permit(state.generation, false)),
                CircuitState::HalfOpen => {
                    if state.probes_in_flight < self.config.half_open_max_requests {
                        state.probes_in_flight += 1;
                        Ok(self.permit(state.generation, true))
                    } else {
                        state.metrics.total_rejected += 1;
                        Err(self.open_error(Duration::ZERO))
                    }
                }
                CircuitState::Open => {
                    state.metrics.total_rejected += 1;
                    let reopen_at = state.metrics.last_transition + self.config.open_duration;
                    Err(self.open_error(reopen_at.saturating_duration_since(now)))
                }
            };

            (result, transition)
        };

        self.notify(transition);

        if let Err(ref rejection) = result {
            log::debug!(
                "Circuit breaker '{}' rejected call, retry in {:?}",
                self.name,
                rejection.retry_in
            );
        }

        result
    }

    /// Run `f` if the breaker admits it and record its outcome
    pub async fn execute<F, Fut, T, E>(&self, f: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.try_acquire()?;

        match f().await {
            Ok(value) => {
                permit.record_success();
                Ok(value)
            }
            Err(error) => {
                permit.record_failure();
                Err(ResilienceError::Operation(error))
            }
        }
    }

    /// Reset the circuit breaker to closed state
    pub fn reset(&self) {
        let transition = {
            let mut state = self.state.lock();
            let from = state.metrics.state;
            self.transition(&mut state, CircuitState::Closed, Instant::now());
            state.metrics.failure_count = 0;
            (from != CircuitState::Closed).then_some((from, CircuitState::Closed))
        };

        log::info!("Circuit breaker '{}' reset", self.name);
        self.notify(transition);
    }

    // Internal methods

    fn permit(&self, generation: u64, probe: bool) -> CircuitPermit {
        CircuitPermit {
            breaker: self.clone(),
            generation,
            probe,
            settled: false,
        }
    }

    fn open_error(&self, retry_in: Duration) -> CircuitOpenError {
        CircuitOpenError {
            target: self.name.to_string(),
            retry_in,
        }
    }

    fn record_success(&self, generation: u64, probe: bool) {
        let transition = {
            let mut state = self.state.lock();
            state.metrics.total_requests += 1;
            state.metrics.total_successes += 1;

            if state.generation != generation {
                return;
            }

            match state.metrics.state {
                CircuitState::Closed => {
                    state.metrics.failure_count = 0;
                    None
                }
                CircuitState::HalfOpen => {
                    if probe {
                        state.probes_in_flight = state.probes_in_flight.saturating_sub(1);
                    }
                    state.metrics.success_count += 1;

                    if state.metrics.success_count >= self.config.success_threshold {
                        self.transition(&mut state, CircuitState::Closed, Instant::now());
                        log::info!(
                            "Circuit breaker '{}' closed after successful recovery",
                            self.name
                        );
                        Some((CircuitState::HalfOpen, CircuitState::Closed))
                    } else {
                        None
                    }
                }
                CircuitState::Open => None,
            }
        };

        self.notify(transition);
    }

    fn record_failure(&self, generation: u64, probe: bool) {
        let transition = {
            let mut state = self.state.lock();
            state.metrics.total_requests += 1;
            state.metrics.total_failures += 1;

            if state.generation != generation {
                return;
            }

            match state.metrics.state {
                CircuitState::Closed => {
                    state.metrics.failure_count += 1;

                    if state.metrics.failure_count >= self.config.failure_threshold {
                        let failures = state.metrics.failure_count;
                        self.transition(&mut state, CircuitState::Open, Instant::now());
                        state.metrics.failure_count = failures;
                        log::warn!(
                            "Circuit breaker '{}' opened after {} consecutive failures",
                            self.name,
                            failures
                        );
                        Some((CircuitState::Closed, CircuitState::Open))
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen => {
                    if probe {
                        state.probes_in_flight = state.probes_in_flight.saturating_sub(1);
                    }
                    self.transition(&mut state, CircuitState::Open, Instant::now());
                    state.metrics.failure_count = 1;
                    log::warn!(
                        "Circuit breaker '{}' reopened after a failed half-open probe",
                        self.name
                    );
                    Some((CircuitState::HalfOpen, CircuitState::Open))
                }
                CircuitState::Open => None,
            }
        };

        self.notify(transition);
    }

    fn release(&self, generation: u64, probe: bool) {
        if !probe {
            return;
        }

        let mut state = self.state.lock();
        if state.generation == generation {
            state.probes_in_flight = state.probes_in_flight.saturating_sub(1);
        }
    }

    fn update_state(&self, state: &mut CircuitBreakerState, now: Instant) -> Option<Transition> {
        if state.metrics.state == CircuitState::Open
            && now.saturating_duration_since(state.metrics.last_transition)
                >= self.config.open_duration
        {
            self.transition(state, CircuitState::HalfOpen, now);
            log::info!(
                "Circuit breaker '{}' transitioned to half-open state",
                self.name
            );
            return Some((CircuitState::Open, CircuitState::HalfOpen));
        }

        None
    }

    fn transition(&self, state: &mut CircuitBreakerState, to: CircuitState, now: Instant) {
        state.metrics.state = to;
        state.metrics.failure_count = 0;
        state.metrics.success_count = 0;
        state.metrics.last_transition = now;
        state.probes_in_flight = 0;
        state.generation += 1;
    }

    // Hooks run without the state lock held
    fn notify(&self, transition: Option<Transition>) {
        if let Some((from, to)) = transition {
            self.hooks.emit(&ResilienceEvent::CircuitStateChanged {
                target: self.name.to_string(),
                from,
                to,
            });
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state.lock().metrics.state)
            .finish()
    }
}

/// Admission to run one call through a [`CircuitBreaker`]
#[must_use = "an unsettled permit records nothing"]
pub struct CircuitPermit {
    breaker: CircuitBreaker,
    generation: u64,
    probe: bool,
    settled: bool,
}

impl CircuitPermit {
    /// Whether this call is a half-open recovery probe
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn record_success(mut self) {
        self.settled = true;
        self.breaker.record_success(self.generation, self.probe);
    }

    pub fn record_failure(mut self) {
        self.settled = true;
        self.breaker.record_failure(self.generation, self.probe);
    }
}

impl Drop for CircuitPermit {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release(self.generation, self.probe);
        }
    }
}

/// Builder for circuit breaker configuration
pub struct CircuitBreakerBuilder {
    name: String,
    config: CircuitBreakerConfig,
    hooks: HookRegistry,
}

impl CircuitBreakerBuilder {
    /// Create a new builder with default config
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: CircuitBreakerConfig::default(),
            hooks: HookRegistry::new(),
        }
    }

    /// Set failure threshold
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    /// Set success threshold for recovery
    pub fn success_threshold(mut self, threshold: u32) -> Self {
        self.config.success_threshold = threshold;
        self
    }

    /// Set cooldown before attempting recovery
    pub fn open_duration(mut self, duration: Duration) -> Self {
        self.config.open_duration = duration;
        self
    }

    /// Set the number of concurrent half-open probes
    pub fn half_open_max_requests(mut self, max: u32) -> Self {
        self.config.half_open_max_requests = max;
        self
    }

    pub fn hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = hooks;
        self
    }

    /// Build the circuit breaker
    pub fn build(self) -> CircuitBreaker {
        CircuitBreaker::new(self.name, self.config).with_hooks(self.hooks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker(failure_threshold: u32, success_threshold: u32) -> CircuitBreaker {
        CircuitBreakerBuilder::new("test")
            .failure_threshold(failure_threshold)
            .success_threshold(success_threshold)
            .open_duration(Duration::from_secs(30))
            .build()
    }

    async fn fail(cb: &CircuitBreaker) {
        let _ = cb.execute(|| async { Err::<(), _>("boom") }).await;
    }

    async fn succeed(cb: &CircuitBreaker) {
        let _ = cb.execute(|| async { Ok::<_, &str>(()) }).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_exactly_threshold_failures() {
        let cb = breaker(3, 1);

        fail(&cb).await;
        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.metrics().failure_count, 2);

        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let cb = breaker(3, 1);

        fail(&cb).await;
        fail(&cb).await;
        succeed(&cb).await;

        let metrics = cb.metrics();
        assert_eq!(metrics.state, CircuitState::Closed);
        assert_eq!(metrics.failure_count, 0);

        fail(&cb).await;
        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_fails_fast() {
        let cb = breaker(1, 1);
        let calls = AtomicU32::new(0);

        fail(&cb).await;
        tokio::time::advance(Duration::from_secs(10)).await;

        for _ in 0..5 {
            let result = cb
                .execute(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, &str>(())
                })
                .await;

            match result {
                Err(ResilienceError::CircuitOpen { target, retry_in }) => {
                    assert_eq!(target, "test");
                    assert_eq!(retry_in, Duration::from_secs(20));
                }
                other => panic!("expected CircuitOpen, got {:?}", other),
            }
        }

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(cb.metrics().total_rejected, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_recovery() {
        let cb = breaker(1, 2);
        fail(&cb).await;

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        succeed(&cb).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.metrics().success_count, 1);

        succeed(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_and_resets_timer() {
        let cb = breaker(1, 2);
        fail(&cb).await;

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        tokio::time::advance(Duration::from_secs(5)).await;
        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        // the cooldown restarts from the reopening, not the first opening
        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(cb.state(), CircuitState::Open);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_probe_cap() {
        let cb = CircuitBreakerBuilder::new("probe")
            .failure_threshold(1)
            .open_duration(Duration::from_secs(1))
            .half_open_max_requests(2)
            .build();
        fail(&cb).await;
        tokio::time::advance(Duration::from_secs(1)).await;

        let first = cb.try_acquire().unwrap();
        let second = cb.try_acquire().unwrap();
        assert!(first.is_probe() && second.is_probe());
        assert!(cb.try_acquire().is_err());

        // an abandoned probe frees its slot without recording anything
        drop(first);
        let third = cb.try_acquire().unwrap();
        let metrics = cb.metrics();
        assert_eq!(metrics.total_requests, 1);
        assert_eq!(metrics.total_rejected, 1);
        assert_eq!(metrics.state, CircuitState::HalfOpen);

        second.record_success();
        third.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_concurrent_probes_at_transition_instant() {
        let cb = CircuitBreakerBuilder::new("race")
            .failure_threshold(1)
            .open_duration(Duration::ZERO)
            .half_open_max_requests(1)
            .build();
        cb.try_acquire().unwrap().record_failure();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cb = cb.clone();
                std::thread::spawn(move || cb.try_acquire().ok())
            })
            .collect();

        // permits are held until every thread has raced for one
        let permits: Vec<CircuitPermit> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();

        assert_eq!(permits.len(), 1);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.metrics().total_rejected, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_permit_leaves_counters_untouched() {
        let cb = breaker(2, 1);
        fail(&cb).await;

        let before = cb.metrics();
        drop(cb.try_acquire().unwrap());
        let after = cb.metrics();

        assert_eq!(after.failure_count, before.failure_count);
        assert_eq!(after.total_requests, before.total_requests);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_permit_does_not_drive_transitions() {
        let cb = breaker(1, 1);

        let early = cb.try_acquire().unwrap();
        let late = cb.try_acquire().unwrap();

        early.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        // admitted while closed, settled after the circuit opened
        late.record_success();
        let metrics = cb.metrics();
        assert_eq!(metrics.state, CircuitState::Open);
        assert_eq!(metrics.total_successes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_change_hooks() {
        let hooks = HookRegistry::new();
        let changes = Arc::new(Mutex::new(Vec::new()));
        let sink = changes.clone();
        hooks.on_state_change(move |_, from, to| sink.lock().push((from, to)));

        let cb = CircuitBreakerBuilder::new("hooked")
            .failure_threshold(1)
            .success_threshold(1)
            .open_duration(Duration::from_secs(1))
            .hooks(hooks)
            .build();

        fail(&cb).await;
        tokio::time::advance(Duration::from_secs(1)).await;
        succeed(&cb).await;

        assert_eq!(
            *changes.lock(),
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset() {
        let cb = breaker(1, 1);
        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire().is_ok());
    }

    #[test]
    fn test_config_from_domain_config() {
        let domain = conduit_config::CircuitBreakerConfig {
            failure_threshold: 4,
            success_threshold: 3,
            open_duration_ms: 1_500,
            half_open_max_requests: 2,
        };
        let config = CircuitBreakerConfig::from(&domain);
        assert_eq!(config.open_duration, Duration::from_millis(1_500));
        assert_eq!(config.half_open_max_requests, 2);
    }
}
