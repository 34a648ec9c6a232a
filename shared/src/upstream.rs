//! Client for the RUZ upstream API.
//!
//! All traffic to RUZ goes through [`UpstreamClient`], which owns a pooled
//! `reqwest` client and applies a [`RetryPolicy`] to every GET. Consumers depend
//! on the [`Upstream`] trait so they can be exercised against fakes.

use crate::metrics_defs::{UPSTREAM_REQUEST_DURATION, UPSTREAM_RETRIES};
use crate::{counter, histogram};
use async_trait::async_trait;
use http::StatusCode;
use http::header::HeaderMap;
use serde_json::Value;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use url::Url;

const POOL_MAX_IDLE_PER_HOST: usize = 32;
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum UpstreamError {
    #[error("upstream returned status {}", .0.as_u16())]
    Status(StatusCode),
    #[error("upstream request timed out")]
    Timeout,
    #[error("upstream request failed: {0}")]
    Request(String),
    #[error("upstream returned invalid JSON: {0}")]
    InvalidJson(String),
    #[error("invalid upstream URL: {0}")]
    InvalidUrl(String),
}

impl UpstreamError {
    /// Status code surfaced to clients once retries are exhausted.
    pub fn client_status(&self) -> StatusCode {
        match self {
            UpstreamError::Status(status) => *status,
            UpstreamError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            UpstreamError::Timeout
        } else {
            UpstreamError::Request(err.to_string())
        }
    }
}

/// Bounded exponential backoff for idempotent upstream requests.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub base_delay: Duration,
    pub multiplier: f64,
    pub retryable_statuses: Vec<StatusCode>,
}

impl RetryPolicy {
    /// Policy for live traffic: short delays, three attempts.
    pub fn live(max_attempts: u32) -> Self {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(200),
            multiplier: 2.0,
            retryable_statuses: Self::gateway_statuses(),
        }
    }

    /// Policy for offline jobs, which can afford to wait for a flaky upstream.
    pub fn batch(max_attempts: u32) -> Self {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1500),
            multiplier: 1.5,
            retryable_statuses: Self::gateway_statuses(),
        }
    }

    fn gateway_statuses() -> Vec<StatusCode> {
        vec![
            StatusCode::BAD_GATEWAY,         // 502
            StatusCode::SERVICE_UNAVAILABLE, // 503
            StatusCode::GATEWAY_TIMEOUT,     // 504
        ]
    }

    pub fn should_retry(&self, err: &UpstreamError) -> bool {
        match err {
            UpstreamError::Status(status) => self.retryable_statuses.contains(status),
            UpstreamError::Timeout | UpstreamError::Request(_) | UpstreamError::InvalidJson(_) => {
                true
            }
            UpstreamError::InvalidUrl(_) => false,
        }
    }

    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as i32;
        self.base_delay.mul_f64(self.multiplier.powi(exponent))
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. `op` receives the 1-based attempt number.
    pub async fn run<F, Fut, T>(&self, mut op: F) -> Result<T, UpstreamError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < max_attempts && self.should_retry(&err) => {
                    let delay = self.delay_for(attempt);
                    tracing::debug!(attempt, ?delay, error = %err, "retrying upstream request");
                    counter!(UPSTREAM_RETRIES).increment(1);
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// A successful (2xx) upstream answer with its decoded JSON body.
#[derive(Clone, Debug, PartialEq)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub payload: Value,
}

impl UpstreamResponse {
    pub fn ok(payload: Value) -> Self {
        UpstreamResponse {
            status: StatusCode::OK,
            payload,
        }
    }
}

#[async_trait]
pub trait Upstream: Send + Sync {
    /// GETs `url` and decodes the body as JSON. Non-2xx answers are errors.
    async fn fetch_json(&self, url: &Url) -> Result<UpstreamResponse, UpstreamError>;
}

/// Builds `base` + `/segment/...`, percent-encoding each segment.
pub fn endpoint_url(base: &Url, segments: &[&str]) -> Result<Url, UpstreamError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| UpstreamError::InvalidUrl(base.to_string()))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

pub fn search_url(base: &Url, term: &str) -> Result<Url, UpstreamError> {
    let mut url = endpoint_url(base, &["api", "search"])?;
    url.query_pairs_mut().append_pair("term", term);
    Ok(url)
}

pub fn schedule_url(
    base: &Url,
    group_id: &str,
    start: &str,
    finish: &str,
    lng: &str,
) -> Result<Url, UpstreamError> {
    let mut url = endpoint_url(base, &["api", "schedule", "group", group_id])?;
    url.query_pairs_mut()
        .append_pair("start", start)
        .append_pair("finish", finish)
        .append_pair("lng", lng);
    Ok(url)
}

pub fn dictionary_url(base: &Url) -> Result<Url, UpstreamError> {
    endpoint_url(base, &["api", "dictionary", "groups"])
}

#[derive(Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl UpstreamClient {
    pub fn new(
        timeout: Duration,
        retry: RetryPolicy,
        default_headers: HeaderMap,
    ) -> Result<Self, UpstreamError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .default_headers(default_headers)
            .build()?;

        Ok(UpstreamClient { client, retry })
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    async fn fetch_once(&self, url: &Url) -> Result<UpstreamResponse, UpstreamError> {
        let started = Instant::now();
        let result = self.send(url).await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(UpstreamError::Status(_)) => "status",
            Err(UpstreamError::Timeout) => "timeout",
            Err(UpstreamError::InvalidJson(_)) => "invalid_json",
            Err(_) => "error",
        };
        histogram!(UPSTREAM_REQUEST_DURATION, "outcome" => outcome)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn send(&self, url: &Url) -> Result<UpstreamResponse, UpstreamError> {
        let response = self.client.get(url.clone()).send().await?;

        let status = response.status();
        if !status.is_success() {
            tracing::debug!(%url, status = status.as_u16(), "upstream returned an error status");
            return Err(UpstreamError::Status(status));
        }

        let body = response.bytes().await?;
        let payload =
            serde_json::from_slice(&body).map_err(|e| UpstreamError::InvalidJson(e.to_string()))?;
        Ok(UpstreamResponse { status, payload })
    }
}

#[async_trait]
impl Upstream for UpstreamClient {
    async fn fetch_json(&self, url: &Url) -> Result<UpstreamResponse, UpstreamError> {
        self.retry.run(|_| self.fetch_once(url)).await
    }
}
