//! Rate limiting disciplines
//!
//! [`RateLimiter`] enforces a provider-wide quota that fully resets once per
//! window. [`BucketRateLimiter`] keeps per-route buckets whose state is
//! overwritten by what the server reports in its response headers.

mod bucket;
mod fixed_window;
mod headers;

pub use bucket::{Bucket, BucketRateLimiter, RouteLimitConfig};
pub use fixed_window::{RateLimiter, RateLimiterConfig, RateLimiterState};
pub use headers::RateLimitHeaders;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::LimitError;

/// What a caller is about to spend
#[derive(Debug, Clone, Copy, Default)]
pub struct AdmissionRequest<'a> {
    /// Route key for per-route limiters
    pub route: Option<&'a str>,
    /// Estimated token cost for budgeted limiters
    pub cost: Option<u64>,
}

/// A gate a call must pass before it is attempted
///
/// Implementations may suspend until capacity is available and must return
/// [`LimitError::Cancelled`] promptly once `cancel` fires.
#[async_trait]
pub trait Admission: Send + Sync {
    async fn admit(
        &self,
        request: &AdmissionRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), LimitError>;
}
