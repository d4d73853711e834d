//! Retrying Graph API client
//!
//! Wraps a [`GraphTransport`] with the upstream retry policy:
//! rate limits wait a fixed long delay, transient errors and network
//! failures back off exponentially, everything else returns at once.
//! The final upstream response is always handed back to the caller.

use async_trait::async_trait;
use http::Method;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::errors::{ErrorClass, classify_response};
use crate::config::RetryConfig;
use crate::metrics::{GRAPH_REQUEST_DURATION_SECONDS, GRAPH_REQUESTS_TOTAL, GRAPH_RETRIES_TOTAL};

// =============================================================================
// Transport
// =============================================================================

/// One outbound Graph API request
#[derive(Debug, Clone, PartialEq)]
pub struct GraphRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub form: Option<Vec<(String, String)>>,
}

impl GraphRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            query: Vec::new(),
            form: None,
        }
    }

    pub fn post_form(url: impl Into<String>, form: Vec<(String, String)>) -> Self {
        Self {
            method: Method::POST,
            url: url.into(),
            query: Vec::new(),
            form: Some(form),
        }
    }

    pub fn query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }

    /// URL without query string, safe to log.
    pub fn log_target(&self) -> &str {
        self.url.split('?').next().unwrap_or(&self.url)
    }
}

/// Raw upstream response
#[derive(Debug, Clone, PartialEq)]
pub struct GraphResponse {
    pub status: u16,
    pub body: String,
}

impl GraphResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.body)
    }
}

/// Failure below HTTP: DNS, connect, reset, timeout
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct TransportError(pub String);

/// Sends a single request with no retry logic
#[async_trait]
pub trait GraphTransport: Send + Sync {
    async fn send(&self, request: GraphRequest) -> Result<GraphResponse, TransportError>;
}

/// Production transport backed by reqwest
pub struct ReqwestTransport {
    client: Arc<reqwest::Client>,
}

impl ReqwestTransport {
    pub fn new(client: Arc<reqwest::Client>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl GraphTransport for ReqwestTransport {
    async fn send(&self, request: GraphRequest) -> Result<GraphResponse, TransportError> {
        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .query(&request.query);
        if let Some(form) = &request.form {
            builder = builder.form(form);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| TransportError(e.without_url().to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| TransportError(e.without_url().to_string()))?;

        Ok(GraphResponse { status, body })
    }
}

// =============================================================================
// Sleeper
// =============================================================================

/// Source of delays, replaceable in tests
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

// =============================================================================
// Retry
// =============================================================================

/// Result of a retried request
///
/// `Exhausted` still carries the last upstream response so callers can
/// read the structured error instead of an opaque failure.
#[derive(Debug)]
pub enum RetryOutcome {
    /// 2xx response
    Success(GraphResponse),
    /// Error response that is not retryable; returned on first sight
    Rejected(GraphResponse),
    /// Retryable error response still failing after the last attempt
    Exhausted(GraphResponse),
    /// No response was ever received
    NetworkFailure(TransportError),
}

impl RetryOutcome {
    fn label(&self) -> &'static str {
        match self {
            RetryOutcome::Success(_) => "success",
            RetryOutcome::Rejected(_) => "rejected",
            RetryOutcome::Exhausted(_) => "exhausted",
            RetryOutcome::NetworkFailure(_) => "network_failure",
        }
    }
}

/// Backoff parameters
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub rate_limit_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: config.initial_delay(),
            max_delay: config.max_delay(),
            rate_limit_delay: config.rate_limit_delay(),
        }
    }

    /// `initial_delay * 2^attempt`, capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Graph API client with retry and backoff
pub struct RetryingClient {
    transport: Arc<dyn GraphTransport>,
    sleeper: Arc<dyn Sleeper>,
    policy: RetryPolicy,
}

impl RetryingClient {
    pub fn new(
        transport: Arc<dyn GraphTransport>,
        sleeper: Arc<dyn Sleeper>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            sleeper,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn sleeper(&self) -> Arc<dyn Sleeper> {
        self.sleeper.clone()
    }

    /// Send with the configured policy.
    pub async fn request(&self, request: GraphRequest) -> RetryOutcome {
        self.request_with(
            request,
            self.policy.max_retries,
            self.policy.initial_delay,
        )
        .await
    }

    /// Send, retrying at most `max_retries` times after the first attempt.
    pub async fn request_with(
        &self,
        request: GraphRequest,
        max_retries: u32,
        initial_delay: Duration,
    ) -> RetryOutcome {
        let policy = RetryPolicy {
            max_retries,
            initial_delay,
            ..self.policy
        };
        let started = Instant::now();
        let outcome = self.run(&request, &policy).await;

        let label = outcome.label();
        GRAPH_REQUESTS_TOTAL.with_label_values(&[label]).inc();
        GRAPH_REQUEST_DURATION_SECONDS
            .with_label_values(&[label])
            .observe(started.elapsed().as_secs_f64());

        outcome
    }

    async fn run(&self, request: &GraphRequest, policy: &RetryPolicy) -> RetryOutcome {
        let mut last_response: Option<GraphResponse> = None;
        let mut attempt: u32 = 0;

        loop {
            let can_retry = attempt < policy.max_retries;

            let (delay, reason) = match self.transport.send(request.clone()).await {
                Ok(response) => match classify_response(&response) {
                    None => return RetryOutcome::Success(response),
                    Some(ErrorClass::RateLimited) => {
                        if !can_retry {
                            return RetryOutcome::Exhausted(response);
                        }
                        last_response = Some(response);
                        (policy.rate_limit_delay, "rate_limited")
                    }
                    Some(ErrorClass::Transient) => {
                        if !can_retry {
                            return RetryOutcome::Exhausted(response);
                        }
                        last_response = Some(response);
                        (policy.backoff(attempt), "transient")
                    }
                    Some(class) => {
                        tracing::debug!(
                            target_url = request.log_target(),
                            status = response.status,
                            ?class,
                            "Graph API error is not retryable"
                        );
                        return RetryOutcome::Rejected(response);
                    }
                },
                Err(error) => {
                    if !can_retry {
                        return match last_response {
                            Some(response) => RetryOutcome::Exhausted(response),
                            None => RetryOutcome::NetworkFailure(error),
                        };
                    }
                    tracing::debug!(%error, target_url = request.log_target(), "Graph API network error");
                    (policy.backoff(attempt), "network")
                }
            };

            GRAPH_RETRIES_TOTAL.with_label_values(&[reason]).inc();
            tracing::warn!(
                target_url = request.log_target(),
                attempt = attempt + 1,
                max_retries = policy.max_retries,
                delay_ms = delay.as_millis() as u64,
                reason,
                "Retrying Graph API request"
            );

            self.sleeper.sleep(delay).await;
            attempt += 1;
        }
    }
}
