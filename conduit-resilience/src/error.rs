//! Error types and retry classification shared by every resilience layer

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Trait for errors that can be retried
pub trait Retryable {
    /// Whether this error is retryable
    fn is_retryable(&self) -> bool;

    /// Server-mandated delay before the next attempt (e.g. `Retry-After`)
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Rejection produced by a rate limiter before the operation runs
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LimitError {
    #[error("rate limited on '{route}' (global: {global}), retry after {retry_after:?}")]
    RateLimited {
        route: String,
        retry_after: Duration,
        global: bool,
    },

    #[error("rate limit queue for '{route}' is full ({capacity} waiting)")]
    QueueFull { route: String, capacity: usize },

    #[error("timed out after {waited:?} waiting for rate limit on '{route}'")]
    QueueTimeout { route: String, waited: Duration },

    #[error("estimated cost {cost} exceeds the window token budget of {budget}")]
    CostExceedsBudget { cost: u64, budget: u64 },

    #[error("cancelled while waiting for rate limit")]
    Cancelled,
}

/// Rejection produced by an open circuit breaker
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circuit breaker '{target}' is open, retry in {retry_in:?}")]
pub struct CircuitOpenError {
    pub target: String,
    pub retry_in: Duration,
}

/// Terminal error of a protected call
///
/// `Operation` carries the underlying error exactly as the operation
/// returned it. Every other variant is synthetic: the operation was not
/// (or no longer) attempted.
#[derive(Debug, Error)]
pub enum ResilienceError<E> {
    #[error("{0}")]
    Operation(E),

    #[error("circuit breaker '{target}' is open, retry in {retry_in:?}")]
    CircuitOpen { target: String, retry_in: Duration },

    #[error("rate limited on '{route}' (global: {global}), retry after {retry_after:?}")]
    RateLimited {
        route: String,
        retry_after: Duration,
        global: bool,
    },

    #[error("rate limit queue for '{route}' is full ({capacity} waiting)")]
    QueueFull { route: String, capacity: usize },

    #[error("timed out after {waited:?} waiting for rate limit on '{route}'")]
    QueueTimeout { route: String, waited: Duration },

    #[error("estimated cost {cost} exceeds the window token budget of {budget}")]
    CostExceedsBudget { cost: u64, budget: u64 },

    #[error("operation cancelled")]
    Cancelled,
}

impl<E> ResilienceError<E> {
    /// The underlying operation error, if the operation produced one
    pub fn into_inner(self) -> Option<E> {
        match self {
            ResilienceError::Operation(error) => Some(error),
            _ => None,
        }
    }

    /// Borrow the underlying operation error
    pub fn inner(&self) -> Option<&E> {
        match self {
            ResilienceError::Operation(error) => Some(error),
            _ => None,
        }
    }

    /// Whether the call was refused without attempting the operation
    pub fn is_fast_fail(&self) -> bool {
        matches!(
            self,
            ResilienceError::CircuitOpen { .. }
                | ResilienceError::QueueFull { .. }
                | ResilienceError::QueueTimeout { .. }
                | ResilienceError::CostExceedsBudget { .. }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ResilienceError::Cancelled)
    }

    /// Delay after which the caller may try again, when one is known
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ResilienceError::CircuitOpen { retry_in, .. } => Some(*retry_in),
            ResilienceError::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Convert the operation error, keeping synthetic variants as they are
    pub fn map_operation<F>(self, f: impl FnOnce(E) -> F) -> ResilienceError<F> {
        match self {
            ResilienceError::Operation(error) => ResilienceError::Operation(f(error)),
            ResilienceError::CircuitOpen { target, retry_in } => {
                ResilienceError::CircuitOpen { target, retry_in }
            }
            ResilienceError::RateLimited {
                route,
                retry_after,
                global,
            } => ResilienceError::RateLimited {
                route,
                retry_after,
                global,
            },
            ResilienceError::QueueFull { route, capacity } => {
                ResilienceError::QueueFull { route, capacity }
            }
            ResilienceError::QueueTimeout { route, waited } => {
                ResilienceError::QueueTimeout { route, waited }
            }
            ResilienceError::CostExceedsBudget { cost, budget } => {
                ResilienceError::CostExceedsBudget { cost, budget }
            }
            ResilienceError::Cancelled => ResilienceError::Cancelled,
        }
    }
}

impl<E> From<LimitError> for ResilienceError<E> {
    fn from(error: LimitError) -> Self {
        match error {
            LimitError::RateLimited {
                route,
                retry_after,
                global,
            } => ResilienceError::RateLimited {
                route,
                retry_after,
                global,
            },
            LimitError::QueueFull { route, capacity } => {
                ResilienceError::QueueFull { route, capacity }
            }
            LimitError::QueueTimeout { route, waited } => {
                ResilienceError::QueueTimeout { route, waited }
            }
            LimitError::CostExceedsBudget { cost, budget } => {
                ResilienceError::CostExceedsBudget { cost, budget }
            }
            LimitError::Cancelled => ResilienceError::Cancelled,
        }
    }
}

impl<E> From<CircuitOpenError> for ResilienceError<E> {
    fn from(error: CircuitOpenError) -> Self {
        ResilienceError::CircuitOpen {
            target: error.target,
            retry_in: error.retry_in,
        }
    }
}

type RetryPredicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;
type RetryAfterExtractor<E> = Arc<dyn Fn(&E) -> Option<Duration> + Send + Sync>;

/// Per-call retry classification
///
/// Decides whether an error is worth another attempt and whether the
/// server dictated how long to wait. Defaults to the error's
/// [`Retryable`] implementation.
pub struct Classifier<E> {
    is_retryable: RetryPredicate<E>,
    retry_after: RetryAfterExtractor<E>,
}

impl<E> Classifier<E> {
    pub fn new<F>(is_retryable: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        Self {
            is_retryable: Arc::new(is_retryable),
            retry_after: Arc::new(|_| None),
        }
    }

    /// Attach a server-mandated delay extractor; its value overrides backoff
    pub fn with_retry_after<F>(mut self, retry_after: F) -> Self
    where
        F: Fn(&E) -> Option<Duration> + Send + Sync + 'static,
    {
        self.retry_after = Arc::new(retry_after);
        self
    }

    /// Retry every error
    pub fn always() -> Self {
        Self::new(|_| true)
    }

    /// Never retry
    pub fn never() -> Self {
        Self::new(|_| false)
    }

    pub fn is_retryable(&self, error: &E) -> bool {
        (self.is_retryable)(error)
    }

    pub fn retry_after(&self, error: &E) -> Option<Duration> {
        (self.retry_after)(error)
    }
}

impl<E: Retryable> Classifier<E> {
    /// Classify through the error's own [`Retryable`] implementation
    pub fn retryable() -> Self {
        Self::new(|error: &E| error.is_retryable()).with_retry_after(|error: &E| error.retry_after())
    }
}

impl<E: Retryable> Default for Classifier<E> {
    fn default() -> Self {
        Self::retryable()
    }
}

impl<E> Clone for Classifier<E> {
    fn clone(&self) -> Self {
        Self {
            is_retryable: Arc::clone(&self.is_retryable),
            retry_after: Arc::clone(&self.retry_after),
        }
    }
}

impl<E> fmt::Debug for Classifier<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Classifier").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Upstream {
        status: u16,
    }

    impl fmt::Display for Upstream {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "upstream returned {}", self.status)
        }
    }

    impl Retryable for Upstream {
        fn is_retryable(&self) -> bool {
            self.status >= 500 || self.status == 429
        }

        fn retry_after(&self) -> Option<Duration> {
            (self.status == 429).then(|| Duration::from_secs(2))
        }
    }

    #[test]
    fn test_operation_error_is_surfaced_verbatim() {
        let err: ResilienceError<Upstream> = ResilienceError::Operation(Upstream { status: 503 });
        assert_eq!(err.to_string(), "upstream returned 503");
        assert!(!err.is_fast_fail());
        assert_eq!(err.into_inner(), Some(Upstream { status: 503 }));
    }

    #[test]
    fn test_limit_errors_convert() {
        let err: ResilienceError<Upstream> = LimitError::QueueFull {
            route: "GET /channels".to_string(),
            capacity: 4,
        }
        .into();
        assert!(err.is_fast_fail());
        assert!(err.inner().is_none());

        let err: ResilienceError<Upstream> = LimitError::RateLimited {
            route: "POST /messages".to_string(),
            retry_after: Duration::from_millis(1500),
            global: true,
        }
        .into();
        assert!(!err.is_fast_fail());
        assert_eq!(err.retry_after(), Some(Duration::from_millis(1500)));

        let err: ResilienceError<Upstream> = LimitError::Cancelled.into();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_circuit_open_converts() {
        let err: ResilienceError<Upstream> = CircuitOpenError {
            target: "crm".to_string(),
            retry_in: Duration::from_secs(30),
        }
        .into();
        assert!(err.is_fast_fail());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));
        assert!(err.to_string().contains("crm"));
    }

    #[test]
    fn test_default_classifier_uses_retryable() {
        let classifier = Classifier::<Upstream>::default();
        assert!(classifier.is_retryable(&Upstream { status: 502 }));
        assert!(!classifier.is_retryable(&Upstream { status: 404 }));
        assert_eq!(
            classifier.retry_after(&Upstream { status: 429 }),
            Some(Duration::from_secs(2))
        );
        assert_eq!(classifier.retry_after(&Upstream { status: 500 }), None);
    }

    #[test]
    fn test_custom_classifier() {
        let classifier = Classifier::<Upstream>::new(|e| e.status == 404)
            .with_retry_after(|_| Some(Duration::from_millis(10)));
        assert!(classifier.is_retryable(&Upstream { status: 404 }));
        assert!(!classifier.clone().is_retryable(&Upstream { status: 500 }));
        assert!(Classifier::<Upstream>::never().retry_after(&Upstream { status: 429 }).is_none());
    }

    #[test]
    fn test_map_operation() {
        let err: ResilienceError<Upstream> = ResilienceError::Operation(Upstream { status: 500 });
        let mapped = err.map_operation(|e| e.status);
        assert!(matches!(mapped, ResilienceError::Operation(500)));

        let err: ResilienceError<Upstream> = ResilienceError::Cancelled;
        assert!(err.map_operation(|e| e.status).is_cancelled());
    }
}
