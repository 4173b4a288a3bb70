//! Resilience configuration for outbound calls
//!
//! A [`ResilienceProfile`] bundles the retry, circuit breaker and rate limit
//! settings applied to one remote provider. Providers without an explicit
//! entry fall back to `defaults`.

use crate::error::ConfigResult;
use crate::validation::{validate_fraction, validate_positive, validate_required_string, Validatable};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Resilience configuration for all providers
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Profile used by providers without their own entry
    #[serde(default)]
    pub defaults: ResilienceProfile,

    /// Per-provider profiles keyed by provider name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub providers: BTreeMap<String, ResilienceProfile>,
}

/// Retry, circuit breaker and rate limit settings for one provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ResilienceProfile {
    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Provider-wide fixed-window quota
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitConfig>,

    /// Server-driven per-route buckets
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_limits: Option<RouteLimitConfig>,
}

/// Retry policy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first call
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Backoff multiplier for exponential backoff
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Jitter as a fraction of the computed delay
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// Cooldown before the first half-open probe, in milliseconds
    #[serde(default = "default_open_duration_ms")]
    pub open_duration_ms: u64,

    #[serde(default = "default_half_open_max_requests")]
    pub half_open_max_requests: u32,
}

/// Fixed-window rate limit configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    #[serde(default = "default_requests_per_window")]
    pub requests_per_window: u32,

    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Optional token budget per window (LLM providers)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_per_window: Option<u64>,
}

/// Per-route bucket configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteLimitConfig {
    /// Maximum callers queued on a single route
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// How long a caller may wait for its route before giving up, in milliseconds
    #[serde(default = "default_queue_timeout_ms")]
    pub queue_timeout_ms: u64,
}

impl ResilienceConfig {
    /// Profile for a provider, falling back to the defaults
    pub fn profile_for(&self, provider: &str) -> &ResilienceProfile {
        self.providers.get(provider).unwrap_or(&self.defaults)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            open_duration_ms: default_open_duration_ms(),
            half_open_max_requests: default_half_open_max_requests(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_window: default_requests_per_window(),
            window_ms: default_window_ms(),
            tokens_per_window: None,
        }
    }
}

impl Default for RouteLimitConfig {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            queue_timeout_ms: default_queue_timeout_ms(),
        }
    }
}

impl Validatable for ResilienceConfig {
    fn validate(&self) -> ConfigResult<()> {
        self.defaults.validate()?;

        for (name, profile) in &self.providers {
            validate_required_string(name, "provider name", self.domain_name())?;
            profile.validate().map_err(|e| {
                self.validation_error(format!("provider '{}': {}", name, e))
            })?;
        }

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "resilience"
    }
}

impl Validatable for ResilienceProfile {
    fn validate(&self) -> ConfigResult<()> {
        self.retry.validate()?;
        self.circuit_breaker.validate()?;

        if let Some(ref rate_limit) = self.rate_limit {
            rate_limit.validate()?;
        }

        if let Some(ref route_limits) = self.route_limits {
            route_limits.validate()?;
        }

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "resilience.profile"
    }
}

impl Validatable for RetryConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_positive(self.max_attempts, "max_attempts", self.domain_name())?;
        validate_positive(self.initial_delay_ms, "initial_delay_ms", self.domain_name())?;

        if self.max_delay_ms < self.initial_delay_ms {
            return Err(self.validation_error(
                "max_delay_ms must be greater than or equal to initial_delay_ms",
            ));
        }

        if !self.multiplier.is_finite() {
            return Err(self.validation_error("multiplier must be a finite number"));
        }
        validate_positive(self.multiplier, "multiplier", self.domain_name())?;
        validate_fraction(self.jitter, "jitter", self.domain_name())?;

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "resilience.retry"
    }
}

impl Validatable for CircuitBreakerConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_positive(self.failure_threshold, "failure_threshold", self.domain_name())?;
        validate_positive(self.success_threshold, "success_threshold", self.domain_name())?;
        validate_positive(
            self.half_open_max_requests,
            "half_open_max_requests",
            self.domain_name(),
        )?;

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "resilience.circuit_breaker"
    }
}

impl Validatable for RateLimitConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_positive(
            self.requests_per_window,
            "requests_per_window",
            self.domain_name(),
        )?;
        validate_positive(self.window_ms, "window_ms", self.domain_name())?;

        if let Some(tokens) = self.tokens_per_window {
            validate_positive(tokens, "tokens_per_window", self.domain_name())?;
        }

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "resilience.rate_limit"
    }
}

impl Validatable for RouteLimitConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_positive(self.max_queue_size, "max_queue_size", self.domain_name())?;
        validate_positive(self.queue_timeout_ms, "queue_timeout_ms", self.domain_name())?;
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "resilience.route_limits"
    }
}

// Default value functions
fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.2
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_open_duration_ms() -> u64 {
    60_000
}

fn default_half_open_max_requests() -> u32 {
    1
}

fn default_requests_per_window() -> u32 {
    60
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_max_queue_size() -> usize {
    64
}

fn default_queue_timeout_ms() -> u64 {
    30_000
}
