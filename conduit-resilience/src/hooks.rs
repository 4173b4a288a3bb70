//! Observer callbacks for resilience events
//!
//! Hooks run synchronously, in registration order, at the point where the
//! event happens. A panicking hook is caught and logged; it never unwinds
//! into the retry loop, breaker or limiter that emitted the event.

use log::error;
use parking_lot::RwLock;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use crate::circuit_breaker::CircuitState;

/// Event delivered to registered hooks
#[derive(Debug, Clone, PartialEq)]
pub enum ResilienceEvent {
    /// A failed attempt will be retried after `delay`
    Retry {
        target: String,
        attempt: u32,
        delay: Duration,
        error: String,
    },
    /// The last permitted attempt failed
    Exhausted {
        target: String,
        attempts: u32,
        error: String,
    },
    /// Something worth surfacing that is not a failure (e.g. low quota)
    Warning { target: String, message: String },
    CircuitStateChanged {
        target: String,
        from: CircuitState,
        to: CircuitState,
    },
    /// A server reported a rate limit
    RateLimited {
        route: String,
        retry_after: Duration,
        global: bool,
    },
}

impl ResilienceEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ResilienceEvent::Retry { .. } => "retry",
            ResilienceEvent::Exhausted { .. } => "exhausted",
            ResilienceEvent::Warning { .. } => "warning",
            ResilienceEvent::CircuitStateChanged { .. } => "circuit_state_changed",
            ResilienceEvent::RateLimited { .. } => "rate_limited",
        }
    }
}

pub type Hook = Arc<dyn Fn(&ResilienceEvent) + Send + Sync>;

/// Ordered, shared list of hooks
///
/// Clones share the same list, so a registry handed to several components
/// sees hooks registered through any of them.
#[derive(Clone, Default)]
pub struct HookRegistry {
    hooks: Arc<RwLock<Vec<Hook>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook for every event
    pub fn register<F>(&self, hook: F)
    where
        F: Fn(&ResilienceEvent) + Send + Sync + 'static,
    {
        self.hooks.write().push(Arc::new(hook));
    }

    /// Register a hook called with `(attempt, delay)` before each retry
    pub fn on_retry<F>(&self, hook: F)
    where
        F: Fn(u32, Duration) + Send + Sync + 'static,
    {
        self.register(move |event| {
            if let ResilienceEvent::Retry { attempt, delay, .. } = event {
                hook(*attempt, *delay);
            }
        });
    }

    /// Register a hook called with `(attempts, error)` when retries run out
    pub fn on_exhausted<F>(&self, hook: F)
    where
        F: Fn(u32, &str) + Send + Sync + 'static,
    {
        self.register(move |event| {
            if let ResilienceEvent::Exhausted { attempts, error, .. } = event {
                hook(*attempts, error);
            }
        });
    }

    pub fn on_warning<F>(&self, hook: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.register(move |event| {
            if let ResilienceEvent::Warning { message, .. } = event {
                hook(message);
            }
        });
    }

    /// Register a hook called with `(target, from, to)` on breaker transitions
    pub fn on_state_change<F>(&self, hook: F)
    where
        F: Fn(&str, CircuitState, CircuitState) + Send + Sync + 'static,
    {
        self.register(move |event| {
            if let ResilienceEvent::CircuitStateChanged { target, from, to } = event {
                hook(target, *from, *to);
            }
        });
    }

    /// Deliver an event to every hook in registration order
    pub fn emit(&self, event: &ResilienceEvent) {
        // Snapshot so a hook may register further hooks without deadlocking
        let hooks = self.hooks.read().clone();

        for (index, hook) in hooks.iter().enumerate() {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| hook(event))) {
                error!(
                    "Resilience hook #{} panicked while handling {} event: {}",
                    index,
                    event.kind(),
                    panic_message(payload.as_ref())
                );
            }
        }
    }

    pub fn len(&self) -> usize {
        self.hooks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.read().is_empty()
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistry")
            .field("hooks", &self.len())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
