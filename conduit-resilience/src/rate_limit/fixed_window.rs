//! Fixed-window request and token budget

use async_trait::async_trait;
use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use super::{Admission, AdmissionRequest};
use crate::error::LimitError;
use crate::hooks::{HookRegistry, ResilienceEvent};

/// Fixed-window limiter configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    pub requests_per_window: u32,

    #[serde(with = "humantime_serde")]
    pub window: Duration,

    /// Token budget per window; cost accounting is disabled when `None`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_per_window: Option<u64>,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            requests_per_window: 60,
            window: Duration::from_secs(60),
            tokens_per_window: None,
        }
    }
}

impl From<&conduit_config::RateLimitConfig> for RateLimiterConfig {
    fn from(config: &conduit_config::RateLimitConfig) -> Self {
        Self {
            requests_per_window: config.requests_per_window,
            window: Duration::from_millis(config.window_ms),
            tokens_per_window: config.tokens_per_window,
        }
    }
}

impl From<conduit_config::RateLimitConfig> for RateLimiterConfig {
    fn from(config: conduit_config::RateLimitConfig) -> Self {
        Self::from(&config)
    }
}

/// Snapshot of the remaining quota in the current window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterState {
    pub request_tokens: u32,
    /// `None` when no token budget is configured
    pub token_budget: Option<u64>,
    pub last_refill: Instant,
}

struct WindowState {
    request_tokens: u32,
    token_budget: Option<u64>,
    last_refill: Instant,
    /// Low-quota warning already emitted for this window
    warned: bool,
}

/// Request/token budget that fully resets once per window
///
/// Waiters are served first-in-first-out: each caller queues on a fair
/// async mutex and only the head of the queue sleeps until the window
/// boundary. Refill is a discrete reset to the configured maxima, never a
/// partial leak.
pub struct RateLimiter {
    name: String,
    config: RateLimiterConfig,
    state: Mutex<WindowState>,
    queue: tokio::sync::Mutex<()>,
    hooks: HookRegistry,
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, config: RateLimiterConfig) -> Self {
        let state = WindowState {
            request_tokens: config.requests_per_window,
            token_budget: config.tokens_per_window,
            last_refill: Instant::now(),
            warned: false,
        };

        Self {
            name: name.into(),
            config,
            state: Mutex::new(state),
            queue: tokio::sync::Mutex::new(()),
            hooks: HookRegistry::new(),
        }
    }

    pub fn with_hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Wait until one request (and `estimated_cost` budget units) is available
    pub async fn acquire(&self, estimated_cost: Option<u64>) -> Result<(), LimitError> {
        self.acquire_cancellable(estimated_cost, &CancellationToken::new())
            .await
    }

    /// Like [`acquire`](Self::acquire), giving up when `cancel` fires
    ///
    /// A cancelled waiter consumes nothing.
    pub async fn acquire_cancellable(
        &self,
        estimated_cost: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<(), LimitError> {
        let cost = self.checked_cost(estimated_cost)?;

        let _turn = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LimitError::Cancelled),
            turn = self.queue.lock() => turn,
        };

        loop {
            let window_end = {
                let mut state = self.state.lock();
                let now = Instant::now();
                self.refill(&mut state, now);

                if self.take(&mut state, cost) {
                    None
                } else {
                    Some(state.last_refill + self.config.window)
                }
            };

            let Some(window_end) = window_end else {
                self.warn_if_low();
                return Ok(());
            };

            debug!(
                "Rate limiter '{}' exhausted, waiting {:?} for the next window",
                self.name,
                window_end.saturating_duration_since(Instant::now())
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(LimitError::Cancelled),
                _ = sleep_until(window_end) => {}
            }
        }
    }

    /// Take quota without waiting
    ///
    /// Fails with [`LimitError::RateLimited`] when the window is exhausted or
    /// other callers are already queued.
    pub fn try_acquire(&self, estimated_cost: Option<u64>) -> Result<(), LimitError> {
        let cost = self.checked_cost(estimated_cost)?;

        let acquired = {
            let _turn = self.queue.try_lock().map_err(|_| self.limited(Instant::now()))?;
            let mut state = self.state.lock();
            let now = Instant::now();
            self.refill(&mut state, now);

            if self.take(&mut state, cost) {
                Ok(())
            } else {
                Err(self.limited_at(state.last_refill + self.config.window, now))
            }
        };

        if acquired.is_ok() {
            self.warn_if_low();
        }
        acquired
    }

    /// Reconcile the token budget once the real cost of a call is known
    ///
    /// The budget never goes below zero nor above the configured maximum.
    pub fn record_usage(&self, estimated: u64, actual: u64) {
        let Some(max) = self.config.tokens_per_window else {
            return;
        };

        {
            let mut state = self.state.lock();
            if let Some(budget) = state.token_budget {
                state.token_budget = Some(budget.saturating_add(estimated).saturating_sub(actual).min(max));
            }
        }

        if actual > estimated {
            debug!(
                "Rate limiter '{}' underestimated cost by {} tokens",
                self.name,
                actual - estimated
            );
        }
        self.warn_if_low();
    }

    /// Remaining quota in the current window
    pub fn state(&self) -> RateLimiterState {
        let mut state = self.state.lock();
        self.refill(&mut state, Instant::now());

        RateLimiterState {
            request_tokens: state.request_tokens,
            token_budget: state.token_budget,
            last_refill: state.last_refill,
        }
    }

    /// Restore the configured maxima and start a new window
    pub fn reset(&self) {
        let mut state = self.state.lock();
        self.restore(&mut state, Instant::now());
    }

    fn checked_cost(&self, estimated_cost: Option<u64>) -> Result<u64, LimitError> {
        let cost = estimated_cost.unwrap_or(0);

        match self.config.tokens_per_window {
            Some(budget) if cost > budget => Err(LimitError::CostExceedsBudget { cost, budget }),
            _ => Ok(cost),
        }
    }

    fn refill(&self, state: &mut WindowState, now: Instant) {
        if now.saturating_duration_since(state.last_refill) >= self.config.window {
            self.restore(state, now);
        }
    }

    fn restore(&self, state: &mut WindowState, now: Instant) {
        state.request_tokens = self.config.requests_per_window;
        state.token_budget = self.config.tokens_per_window;
        state.last_refill = now;
        state.warned = false;
    }

    fn take(&self, state: &mut WindowState, cost: u64) -> bool {
        let budget_ok = state.token_budget.map_or(true, |budget| budget >= cost);
        if state.request_tokens == 0 || !budget_ok {
            return false;
        }

        state.request_tokens -= 1;
        if let Some(budget) = state.token_budget.as_mut() {
            *budget -= cost;
        }
        true
    }

    fn limited(&self, now: Instant) -> LimitError {
        let window_end = self.state.lock().last_refill + self.config.window;
        self.limited_at(window_end, now)
    }

    fn limited_at(&self, window_end: Instant, now: Instant) -> LimitError {
        LimitError::RateLimited {
            route: self.name.clone(),
            retry_after: window_end.saturating_duration_since(now),
            global: false,
        }
    }

    // Warns once per window when less than 10% of either quota remains
    fn warn_if_low(&self) {
        let message = {
            let mut state = self.state.lock();
            if state.warned {
                return;
            }

            let requests_low =
                u64::from(state.request_tokens) * 10 < u64::from(self.config.requests_per_window);
            let budget_low = match (state.token_budget, self.config.tokens_per_window) {
                (Some(remaining), Some(max)) => remaining.saturating_mul(10) < max,
                _ => false,
            };

            if !requests_low && !budget_low {
                return;
            }
            state.warned = true;

            match state.token_budget {
                Some(budget) => format!(
                    "rate limit '{}' nearly exhausted: {} requests and {} tokens left in window",
                    self.name, state.request_tokens, budget
                ),
                None => format!(
                    "rate limit '{}' nearly exhausted: {} requests left in window",
                    self.name, state.request_tokens
                ),
            }
        };

        warn!("{}", message);
        self.hooks.emit(&ResilienceEvent::Warning {
            target: self.name.clone(),
            message,
        });
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Admission for RateLimiter {
    async fn admit(
        &self,
        request: &AdmissionRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), LimitError> {
        self.acquire_cancellable(request.cost, cancel).await
    }
}
