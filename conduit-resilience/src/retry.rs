//! Retry policy and executor

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::backoff::BackoffCalculator;
use crate::error::{Classifier, ResilienceError};
use crate::hooks::{HookRegistry, ResilienceEvent};

/// Retry policy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first call
    pub max_attempts: u32,

    /// Initial delay between retries
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Growth factor applied per attempt
    pub multiplier: f64,

    /// Jitter as a fraction of the computed delay, in `[0, 1]`
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Create a conservative retry policy for critical operations
    pub fn conservative() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            multiplier: 1.5,
            jitter: 0.2,
        }
    }

    /// Create an aggressive retry policy for fast operations
    pub fn aggressive() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            multiplier: 1.2,
            jitter: 0.2,
        }
    }

    /// A single attempt, never retried
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Same policy with jitter disabled, giving deterministic delays
    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    pub fn calculator(&self) -> BackoffCalculator {
        BackoffCalculator::new(self.initial_delay, self.max_delay, self.multiplier)
            .with_jitter(self.jitter)
    }

    /// Calculate delay for a specific attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.calculator().calculate_delay(attempt)
    }
}

impl From<&conduit_config::RetryConfig> for RetryPolicy {
    fn from(config: &conduit_config::RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier,
            jitter: config.jitter,
        }
    }
}

impl From<conduit_config::RetryConfig> for RetryPolicy {
    fn from(config: conduit_config::RetryConfig) -> Self {
        Self::from(&config)
    }
}

/// Retry executor
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    target: String,
    hooks: HookRegistry,
}

impl RetryExecutor {
    /// Create a new retry executor with the given policy
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            target: "default".to_string(),
            hooks: HookRegistry::new(),
        }
    }

    /// Create with default policy
    pub fn with_default_policy() -> Self {
        Self::new(RetryPolicy::default())
    }

    /// Name used in logs and hook events
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    pub fn with_hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute a function with retry logic
    pub async fn execute<F, Fut, T, E>(
        &self,
        mut f: F,
        classifier: &Classifier<E>,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let cancel = CancellationToken::new();
        self.execute_with_context(|_attempt| f(), classifier, &cancel)
            .await
    }

    /// Execute a function with retry logic, stopping when `cancel` fires
    pub async fn execute_cancellable<F, Fut, T, E>(
        &self,
        mut f: F,
        classifier: &Classifier<E>,
        cancel: &CancellationToken,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.execute_with_context(|_attempt| f(), classifier, cancel)
            .await
    }

    /// Execute a function with retry logic and attempt context
    ///
    /// The final error is returned as [`ResilienceError::Operation`] without
    /// any wrapping of its own. Cancellation while an attempt or a backoff
    /// sleep is pending resolves to [`ResilienceError::Cancelled`].
    pub async fn execute_with_context<F, Fut, T, E>(
        &self,
        mut f: F,
        classifier: &Classifier<E>,
        cancel: &CancellationToken,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let backoff = self.policy.calculator();
        let mut attempt = 1;

        loop {
            if cancel.is_cancelled() {
                debug!("{}: cancelled before attempt {}", self.target, attempt);
                return Err(ResilienceError::Cancelled);
            }

            debug!(
                "{}: executing attempt {} of {}",
                self.target, attempt, max_attempts
            );

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ResilienceError::Cancelled),
                outcome = f(attempt) => outcome,
            };

            let error = match outcome {
                Ok(result) => {
                    if attempt > 1 {
                        info!(
                            "{}: operation succeeded after {} attempts",
                            self.target, attempt
                        );
                    }
                    return Ok(result);
                }
                Err(error) => error,
            };

            if attempt >= max_attempts {
                warn!(
                    "{}: operation failed after {} attempts: {}",
                    self.target, attempt, error
                );
                self.hooks.emit(&ResilienceEvent::Exhausted {
                    target: self.target.clone(),
                    attempts: attempt,
                    error: error.to_string(),
                });
                return Err(ResilienceError::Operation(error));
            }

            if !classifier.is_retryable(&error) {
                warn!(
                    "{}: operation failed with non-retryable error: {}",
                    self.target, error
                );
                return Err(ResilienceError::Operation(error));
            }

            // Server-specified backoff wins over the computed delay
            let delay = match classifier.retry_after(&error) {
                Some(delay) => {
                    debug!("{}: server requested a delay of {:?}", self.target, delay);
                    delay
                }
                None => backoff.calculate_delay(attempt),
            };

            warn!(
                "{}: attempt {} failed: {}. Retrying in {:?}",
                self.target, attempt, error, delay
            );
            self.hooks.emit(&ResilienceEvent::Retry {
                target: self.target.clone(),
                attempt,
                delay,
                error: error.to_string(),
            });

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("{}: cancelled during backoff", self.target);
                    return Err(ResilienceError::Cancelled);
                }
                _ = sleep(delay) => {}
            }

            attempt += 1;
        }
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::with_default_policy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Retryable;
    use parking_lot::Mutex;
    use std::fmt;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    #[derive(Debug, Clone, PartialEq)]
    struct TestError {
        retryable: bool,
        retry_after: Option<Duration>,
    }

    impl TestError {
        fn transient() -> Self {
            Self {
                retryable: true,
                retry_after: None,
            }
        }

        fn permanent() -> Self {
            Self {
                retryable: false,
                retry_after: None,
            }
        }
    }

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "test error (retryable: {})", self.retryable)
        }
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            self.retryable
        }

        fn retry_after(&self) -> Option<Duration> {
            self.retry_after
        }
    }

    fn deterministic(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    fn recorded_delays(hooks: &HookRegistry) -> Arc<Mutex<Vec<Duration>>> {
        let delays = Arc::new(Mutex::new(Vec::new()));
        let sink = delays.clone();
        hooks.on_retry(move |_, delay| sink.lock().push(delay));
        delays
    }

    #[tokio::test(start_paused = true)]
    async fn test_deterministic_delay_sequence() {
        let hooks = HookRegistry::new();
        let delays = recorded_delays(&hooks);
        let executor = RetryExecutor::new(deterministic(5)).with_hooks(hooks);

        let start = Instant::now();
        let result: Result<(), _> = executor
            .execute(|| async { Err(TestError::transient()) }, &Classifier::default())
            .await;

        assert!(matches!(result, Err(ResilienceError::Operation(_))));
        assert_eq!(
            *delays.lock(),
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(300),
                Duration::from_millis(300),
            ]
        );
        assert_eq!(start.elapsed(), Duration::from_millis(900));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_attempt_policy() {
        let calls = AtomicU32::new(0);
        let executor = RetryExecutor::new(RetryPolicy::no_retry());

        let result: Result<(), _> = executor
            .execute(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(TestError::transient()) }
                },
                &Classifier::default(),
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_retries() {
        let calls = AtomicU32::new(0);
        let executor = RetryExecutor::new(deterministic(3));

        let result = executor
            .execute_with_context(
                |attempt| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if attempt < 3 {
                            Err(TestError::transient())
                        } else {
                            Ok(attempt)
                        }
                    }
                },
                &Classifier::default(),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_returned_unchanged() {
        let calls = AtomicU32::new(0);
        let hooks = HookRegistry::new();
        let exhausted = Arc::new(AtomicU32::new(0));
        let counter = exhausted.clone();
        hooks.on_exhausted(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let executor = RetryExecutor::new(deterministic(5)).with_hooks(hooks);

        let result: Result<(), _> = executor
            .execute(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(TestError::permanent()) }
                },
                &Classifier::default(),
            )
            .await;

        assert_eq!(result.unwrap_err().into_inner(), Some(TestError::permanent()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(exhausted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_hook_fires_once() {
        let hooks = HookRegistry::new();
        let exhausted = Arc::new(Mutex::new(Vec::new()));
        let sink = exhausted.clone();
        hooks.on_exhausted(move |attempts, _| sink.lock().push(attempts));
        let executor = RetryExecutor::new(deterministic(3)).with_hooks(hooks);

        let _: Result<(), _> = executor
            .execute(|| async { Err(TestError::transient()) }, &Classifier::default())
            .await;

        assert_eq!(*exhausted.lock(), vec![3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_overrides_backoff() {
        let hooks = HookRegistry::new();
        let delays = recorded_delays(&hooks);
        let executor = RetryExecutor::new(deterministic(2)).with_hooks(hooks);
        let calls = AtomicU32::new(0);

        let start = Instant::now();
        let result = executor
            .execute(
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n == 0 {
                            Err(TestError {
                                retryable: true,
                                retry_after: Some(Duration::from_secs(5)),
                            })
                        } else {
                            Ok("done")
                        }
                    }
                },
                &Classifier::default(),
            )
            .await;

        assert_eq!(result.unwrap(), "done");
        // not capped by max_delay
        assert_eq!(*delays.lock(), vec![Duration::from_secs(5)]);
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_classifier_overrides_error() {
        let calls = AtomicU32::new(0);
        let executor = RetryExecutor::new(deterministic(3));

        let _: Result<(), _> = executor
            .execute(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(TestError::permanent()) }
                },
                &Classifier::always(),
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let executor = RetryExecutor::new(RetryPolicy {
            initial_delay: Duration::from_secs(10),
            ..deterministic(3)
        });

        let task = {
            let calls = calls.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                executor
                    .execute_cancellable(
                        || {
                            calls.fetch_add(1, Ordering::SeqCst);
                            async { Err::<(), _>(TestError::transient()) }
                        },
                        &Classifier::default(),
                        &cancel,
                    )
                    .await
            })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(ResilienceError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_first_attempt() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<(), _> = RetryExecutor::default()
            .execute_cancellable(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok::<(), TestError>(()) }
                },
                &Classifier::default(),
                &cancel,
            )
            .await;

        assert!(matches!(result, Err(ResilienceError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_policy_from_config() {
        let config = conduit_config::RetryConfig {
            max_attempts: 4,
            initial_delay_ms: 250,
            max_delay_ms: 2_000,
            multiplier: 3.0,
            jitter: 0.0,
        };
        let policy = RetryPolicy::from(&config);

        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(250));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(750));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(2_000));
    }

    #[test]
    fn test_policy_presets() {
        assert_eq!(RetryPolicy::no_retry().max_attempts, 1);
        assert!(RetryPolicy::conservative().initial_delay > RetryPolicy::aggressive().initial_delay);
        assert_eq!(RetryPolicy::default().without_jitter().jitter, 0.0);
    }

    #[test]
    fn test_policy_serde_uses_humantime() {
        let yaml = "max_attempts: 2\ninitial_delay: 250ms\nmax_delay: 5s\nmultiplier: 2.0\njitter: 0.1\n";
        let policy: RetryPolicy = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(policy.initial_delay, Duration::from_millis(250));
        assert_eq!(policy.max_delay, Duration::from_secs(5));
    }
}
