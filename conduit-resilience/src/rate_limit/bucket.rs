//! Per-route buckets corrected from server responses

use async_trait::async_trait;
use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use super::{Admission, AdmissionRequest, RateLimitHeaders};
use crate::error::LimitError;
use crate::hooks::{HookRegistry, ResilienceEvent};

/// Longest reset a server may impose; larger reports are capped to this
const MAX_SERVER_RESET: Duration = Duration::from_secs(86_400 * 365);

fn reset_deadline(now: Instant, after: Duration) -> Instant {
    now.checked_add(after.min(MAX_SERVER_RESET)).unwrap_or(now)
}

/// Queueing limits for per-route waiters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteLimitConfig {
    /// Callers allowed to wait on one route at a time
    pub max_queue_size: usize,

    /// How long a caller may wait before failing with a queue timeout
    #[serde(with = "humantime_serde")]
    pub queue_timeout: Duration,
}

impl Default for RouteLimitConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 64,
            queue_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&conduit_config::RouteLimitConfig> for RouteLimitConfig {
    fn from(config: &conduit_config::RouteLimitConfig) -> Self {
        Self {
            max_queue_size: config.max_queue_size,
            queue_timeout: Duration::from_millis(config.queue_timeout_ms),
        }
    }
}

impl From<conduit_config::RouteLimitConfig> for RouteLimitConfig {
    fn from(config: conduit_config::RouteLimitConfig) -> Self {
        Self::from(&config)
    }
}

/// Last known quota of one route
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bucket {
    /// `None` until the server first reports a value (unbounded)
    pub remaining: Option<u64>,
    pub limit: Option<u64>,
    pub reset_at: Option<Instant>,
    pub bucket_id: Option<String>,
}

impl Bucket {
    /// True when quota remains or the reported reset time has passed
    pub fn can_proceed(&self, now: Instant) -> bool {
        self.blocked_until(now).is_none()
    }

    fn blocked_until(&self, now: Instant) -> Option<Instant> {
        match (self.remaining, self.reset_at) {
            (Some(0), Some(reset_at)) if now < reset_at => Some(reset_at),
            _ => None,
        }
    }

    // Local reservation until the next server report overwrites it
    fn reserve(&mut self) {
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
        }
    }
}

struct RouteEntry {
    bucket: Bucket,
    gate: Arc<tokio::sync::Mutex<()>>,
    queued: Arc<AtomicUsize>,
}

impl RouteEntry {
    fn new() -> Self {
        Self {
            bucket: Bucket::default(),
            gate: Arc::new(tokio::sync::Mutex::new(())),
            queued: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[derive(Default)]
struct Routes {
    entries: HashMap<String, RouteEntry>,
    /// Set by a global rate limit; blocks every route
    global_until: Option<Instant>,
}

impl Routes {
    fn entry(&mut self, route: &str) -> &mut RouteEntry {
        self.entries
            .entry(route.to_string())
            .or_insert_with(RouteEntry::new)
    }
}

/// Rate limiter keyed by route, where the server is authoritative
///
/// Buckets start unbounded and are overwritten by every
/// [`update_from_headers`](Self::update_from_headers) call. Callers on the
/// same route wait in FIFO order; the queue is bounded in both length and
/// waiting time.
pub struct BucketRateLimiter {
    config: RouteLimitConfig,
    routes: Mutex<Routes>,
    hooks: HookRegistry,
}

impl BucketRateLimiter {
    pub fn new(config: RouteLimitConfig) -> Self {
        Self {
            config,
            routes: Mutex::new(Routes::default()),
            hooks: HookRegistry::new(),
        }
    }

    pub fn with_hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn config(&self) -> &RouteLimitConfig {
        &self.config
    }

    /// Current bucket for `route`, created unbounded on first use
    pub fn get_bucket(&self, route: &str) -> Bucket {
        self.routes.lock().entry(route).bucket.clone()
    }

    /// Overwrite the route's bucket from raw response headers
    pub fn update_from_headers(&self, route: &str, headers: &http::HeaderMap) {
        let parsed = RateLimitHeaders::from_headers(headers);
        if !parsed.is_empty() {
            self.update(route, &parsed);
        }
    }

    /// Overwrite the route's bucket with server-reported values
    pub fn update(&self, route: &str, headers: &RateLimitHeaders) {
        let now = Instant::now();
        let mut routes = self.routes.lock();
        let bucket = &mut routes.entry(route).bucket;

        if let Some(remaining) = headers.remaining {
            bucket.remaining = Some(remaining);
        }
        if let Some(limit) = headers.limit {
            bucket.limit = Some(limit);
        }
        if let Some(reset_after) = headers.reset_after {
            bucket.reset_at = Some(reset_deadline(now, reset_after));
        }
        if let Some(ref id) = headers.bucket {
            bucket.bucket_id = Some(id.clone());
        }

        debug!(
            "Route '{}' bucket updated: remaining={:?} reset_in={:?}",
            route,
            bucket.remaining,
            bucket.reset_at.map(|at| at.saturating_duration_since(now))
        );
    }

    /// Record a rate limit response and produce the error for the caller
    ///
    /// A global limit blocks every route until it expires; otherwise only
    /// `route` is drained until `retry_after` has passed.
    pub fn handle_rate_limit(&self, route: &str, retry_after: Duration, global: bool) -> LimitError {
        let until = reset_deadline(Instant::now(), retry_after);

        {
            let mut routes = self.routes.lock();
            if global {
                routes.global_until = Some(routes.global_until.map_or(until, |current| current.max(until)));
            } else {
                let bucket = &mut routes.entry(route).bucket;
                bucket.remaining = Some(0);
                bucket.reset_at = Some(until);
            }
        }

        warn!(
            "Rate limited on route '{}' (global: {}), retry after {:?}",
            route, global, retry_after
        );
        self.hooks.emit(&ResilienceEvent::RateLimited {
            route: route.to_string(),
            retry_after,
            global,
        });

        LimitError::RateLimited {
            route: route.to_string(),
            retry_after,
            global,
        }
    }

    /// Wait until `route` may send one request
    pub async fn acquire(&self, route: &str) -> Result<(), LimitError> {
        self.acquire_cancellable(route, &CancellationToken::new())
            .await
    }

    /// Like [`acquire`](Self::acquire), giving up when `cancel` fires
    pub async fn acquire_cancellable(
        &self,
        route: &str,
        cancel: &CancellationToken,
    ) -> Result<(), LimitError> {
        let (gate, queued) = {
            let mut routes = self.routes.lock();
            let entry = routes.entry(route);
            (entry.gate.clone(), entry.queued.clone())
        };

        let Some(_slot) = QueueSlot::enter(&queued, self.config.max_queue_size) else {
            warn!(
                "Rate limit queue for route '{}' is full ({} waiting)",
                route, self.config.max_queue_size
            );
            return Err(LimitError::QueueFull {
                route: route.to_string(),
                capacity: self.config.max_queue_size,
            });
        };

        let started = Instant::now();
        let wait = async {
            let _turn = gate.lock().await;
            self.wait_for_capacity(route).await;
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(LimitError::Cancelled),
            waited = tokio::time::timeout(self.config.queue_timeout, wait) => match waited {
                Ok(()) => Ok(()),
                Err(_) => {
                    let waited = started.elapsed();
                    warn!("Timed out after {:?} waiting on route '{}'", waited, route);
                    Err(LimitError::QueueTimeout {
                        route: route.to_string(),
                        waited,
                    })
                }
            },
        }
    }

    async fn wait_for_capacity(&self, route: &str) {
        loop {
            let blocked_until = {
                let mut guard = self.routes.lock();
                let routes = &mut *guard;
                let now = Instant::now();

                match routes.global_until {
                    Some(until) if now < until => Some(until),
                    _ => {
                        routes.global_until = None;
                        let bucket = &mut routes.entry(route).bucket;
                        let blocked = bucket.blocked_until(now);
                        if blocked.is_none() {
                            bucket.reserve();
                        }
                        blocked
                    }
                }
            };

            let Some(until) = blocked_until else {
                return;
            };

            debug!(
                "Route '{}' exhausted, waiting {:?} for reset",
                route,
                until.saturating_duration_since(Instant::now())
            );
            sleep_until(until).await;
        }
    }
}

impl Default for BucketRateLimiter {
    fn default() -> Self {
        Self::new(RouteLimitConfig::default())
    }
}

impl std::fmt::Debug for BucketRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketRateLimiter")
            .field("config", &self.config)
            .field("routes", &self.routes.lock().entries.len())
            .finish()
    }
}

#[async_trait]
impl Admission for BucketRateLimiter {
    async fn admit(
        &self,
        request: &AdmissionRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), LimitError> {
        match request.route {
            Some(route) => self.acquire_cancellable(route, cancel).await,
            None => Ok(()),
        }
    }
}

/// Occupies one place in a route's queue until dropped
struct QueueSlot<'a> {
    queued: &'a AtomicUsize,
}

impl<'a> QueueSlot<'a> {
    fn enter(queued: &'a AtomicUsize, capacity: usize) -> Option<Self> {
        queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < capacity).then_some(n + 1)
            })
            .ok()
            .map(|_| Self { queued })
    }
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.queued.fetch_sub(1, Ordering::AcqRel);
    }
}
