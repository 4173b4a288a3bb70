//! Resilient HTTP client

use crate::config::HttpConfig;
use crate::errors::HttpError;
use crate::retry_after::retry_after_from_headers;
use chrono::Utc;
use conduit_resilience::{
    BucketRateLimiter, CallOptions, LimitError, RateLimitHeaders, ResilienceError,
    ResilienceOrchestrator,
};
use reqwest::{Client, Request, RequestBuilder, Response, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Delay used when a 429 carries neither `Retry-After` nor a reset time
const DEFAULT_RATE_LIMIT_DELAY: Duration = Duration::from_secs(1);

/// HTTP client whose calls go through a [`ResilienceOrchestrator`]
///
/// Every response feeds its rate limit headers back into the orchestrator's
/// route limiter, so later calls on the same route wait for the bucket the
/// server reported.
#[derive(Clone)]
pub struct ResilientClient {
    client: Client,
    orchestrator: Arc<ResilienceOrchestrator>,
}

impl ResilientClient {
    /// Create a client with default HTTP settings
    pub fn new(orchestrator: Arc<ResilienceOrchestrator>) -> Result<Self, HttpError> {
        Self::with_config(&HttpConfig::default(), orchestrator)
    }

    pub fn with_config(
        config: &HttpConfig,
        orchestrator: Arc<ResilienceOrchestrator>,
    ) -> Result<Self, HttpError> {
        Ok(Self::from_client(config.build_client()?, orchestrator))
    }

    /// Wrap an existing `reqwest` client
    pub fn from_client(client: Client, orchestrator: Arc<ResilienceOrchestrator>) -> Self {
        Self {
            client,
            orchestrator,
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn orchestrator(&self) -> &Arc<ResilienceOrchestrator> {
        &self.orchestrator
    }

    /// Start a GET request; hand it to [`send`](Self::send) to execute
    pub fn get(&self, url: &str) -> RequestBuilder {
        self.client.get(url)
    }

    /// Start a POST request; hand it to [`send`](Self::send) to execute
    pub fn post(&self, url: &str) -> RequestBuilder {
        self.client.post(url)
    }

    /// Send `request` on `route` with default call options
    pub async fn send(
        &self,
        route: &str,
        request: RequestBuilder,
    ) -> Result<Response, ResilienceError<HttpError>> {
        self.send_with(route, request, CallOptions::default()).await
    }

    /// Send `request` on `route` through the orchestrator
    ///
    /// Non-2xx responses become [`HttpError`]s so the retry layer can
    /// classify them. The request is cloned for every attempt; requests with
    /// streaming bodies fail with [`HttpError::InvalidRequest`].
    pub async fn send_with(
        &self,
        route: &str,
        request: RequestBuilder,
        options: CallOptions<HttpError>,
    ) -> Result<Response, ResilienceError<HttpError>> {
        let request = request
            .build()
            .map_err(|e| ResilienceError::Operation(HttpError::InvalidRequest(e.to_string())))?;

        let client = &self.client;
        let limiter = self.orchestrator.route_limiter();
        let request = &request;

        self.orchestrator
            .execute_with(options.with_route(route), |attempt| async move {
                let attempt_request = clone_request(request)?;
                debug!(
                    "{} {} (route: {}, attempt {})",
                    attempt_request.method(),
                    attempt_request.url(),
                    route,
                    attempt
                );

                let response = client.execute(attempt_request).await?;
                check_response(route, response, limiter.map(Arc::as_ref)).await
            })
            .await
    }
}

fn clone_request(request: &Request) -> Result<Request, HttpError> {
    request.try_clone().ok_or_else(|| {
        HttpError::InvalidRequest("request body cannot be replayed for retry".to_string())
    })
}

async fn check_response(
    route: &str,
    response: Response,
    limiter: Option<&BucketRateLimiter>,
) -> Result<Response, HttpError> {
    let status = response.status();
    if let Some(limiter) = limiter {
        limiter.update_from_headers(route, response.headers());
    }

    if status.is_success() {
        debug!("{} -> {}", route, status);
        return Ok(response);
    }

    let retry_after = retry_after_from_headers(response.headers(), Utc::now());

    if status == StatusCode::TOO_MANY_REQUESTS {
        let reported = RateLimitHeaders::from_headers(response.headers());
        let delay = retry_after
            .or(reported.reset_after)
            .unwrap_or(DEFAULT_RATE_LIMIT_DELAY);

        warn!(
            "{} rate limited (global: {}), retry after {:?}",
            route, reported.global, delay
        );
        if let Some(limiter) = limiter {
            if let LimitError::RateLimited {
                route,
                retry_after,
                global,
            } = limiter.handle_rate_limit(route, delay, reported.global)
            {
                return Err(HttpError::RateLimited {
                    route,
                    retry_after,
                    global,
                });
            }
        }

        return Err(HttpError::RateLimited {
            route: route.to_string(),
            retry_after: delay,
            global: reported.global,
        });
    }

    let body = match response.text().await {
        Ok(body) => body,
        Err(error) => {
            debug!("{} -> {}: failed to read body: {}", route, status, error);
            String::new()
        }
    };
    debug!("{} -> {}: {}", route, status, body);
    Err(HttpError::Status {
        status,
        retry_after,
        body,
    })
}
