//! Bounded-concurrency HTTP executor with retry and backoff
//!
//! One pool per target host. At most `max_concurrent_requests` calls run at
//! once; callers beyond that wait on a fair semaphore, so admission order
//! matches submission order. An admitted request is attempted up to
//! `max_retries` times, retrying only what `transient` says is transient.
//! A `Retry-After` hint can lengthen the backoff but never shorten it, and
//! the wait stays within `max_delay_ms`.
//!
//! HTTP error statuses are returned as responses, not errors. Only transport
//! failures (after retries) surface as `PoolError::Network`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use reqwest::Method;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::backoff::calculate_backoff;
use crate::error::{PoolError, Result};
use crate::transient::{NetworkErrorKind, classify_reqwest_error, is_retryable_status};

const SUCCESS_RATE_UNHEALTHY: f64 = 0.80;
const SUCCESS_RATE_DEGRADED: f64 = 0.95;
const QUEUE_DEPTH_UNHEALTHY: u64 = 50;
const QUEUE_DEPTH_DEGRADED: u64 = 10;
const RETRY_RATE_UNHEALTHY: f64 = 0.50;
const RETRY_RATE_DEGRADED: f64 = 0.10;
const LATENCY_UNHEALTHY_MS: f64 = 10_000.0;
const LATENCY_DEGRADED_MS: f64 = 5_000.0;

/// Pool limits and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_concurrent_requests: usize,
    /// Total attempts per request, first try included
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Per-attempt timeout unless the request carries its own
    pub request_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 10,
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
            request_timeout_secs: 30,
        }
    }
}

impl PoolConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn validate(&self) -> common::Result<()> {
        if self.max_concurrent_requests == 0 {
            return Err(common::Error::Config(
                "max_concurrent_requests must be greater than 0".into(),
            ));
        }
        if self.max_retries == 0 {
            return Err(common::Error::Config(
                "max_retries must be at least 1 (the first attempt)".into(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(common::Error::Config(
                "request_timeout_secs must be greater than 0".into(),
            ));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(common::Error::Config(format!(
                "base_delay_ms ({}) must not exceed max_delay_ms ({})",
                self.base_delay_ms, self.max_delay_ms
            )));
        }
        Ok(())
    }
}

/// Request body variants.
#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Bytes(Bytes),
    Form(Vec<(String, String)>),
    Json(serde_json::Value),
}

/// Description of one outbound call, replayable across attempts.
#[derive(Debug, Clone)]
pub struct PoolRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: RequestBody,
    pub timeout: Option<Duration>,
}

impl PoolRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
            timeout: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn form(mut self, fields: Vec<(String, String)>) -> Self {
        self.body = RequestBody::Form(fields);
        self
    }

    pub fn json(mut self, value: serde_json::Value) -> Self {
        self.body = RequestBody::Json(value);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Final response after retries.
#[derive(Debug, Clone)]
pub struct PoolResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub elapsed: Duration,
    pub attempts: u32,
}

impl PoolResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn label(self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

/// Counter snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub target: String,
    pub active_requests: u64,
    pub queued_requests: u64,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub retry_count: u64,
    pub average_response_time_ms: f64,
    pub success_rate: f64,
    pub config: PoolConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolHealth {
    pub target: String,
    pub status: HealthStatus,
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
    pub metrics: PoolStatus,
}

#[derive(Debug, Default)]
struct PoolCounters {
    total_requests: AtomicU64,
    active_requests: AtomicU64,
    queued_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    retry_count: AtomicU64,
    completed_requests: AtomicU64,
    total_response_ms: AtomicU64,
}

/// Decrements a gauge-style counter when dropped, so cancelled callers
/// never leave the queue or active counts inflated.
struct GaugeGuard<'a>(&'a AtomicU64);

impl<'a> GaugeGuard<'a> {
    fn enter(counter: &'a AtomicU64) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Connection pool for one target host.
#[derive(Debug)]
pub struct ConnectionPool {
    target: String,
    config: PoolConfig,
    client: reqwest::Client,
    permits: Semaphore,
    counters: PoolCounters,
}

impl ConnectionPool {
    pub fn new(target: impl Into<String>, config: PoolConfig, client: reqwest::Client) -> Self {
        let target = target.into();
        debug!(target = %target, ?config, "connection pool created");
        Self {
            permits: Semaphore::new(config.max_concurrent_requests),
            target,
            config,
            client,
            counters: PoolCounters::default(),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Execute `request`, waiting for a slot first if the pool is full.
    pub async fn execute(&self, request: PoolRequest) -> Result<PoolResponse> {
        self.counters.total_requests.fetch_add(1, Ordering::SeqCst);
        metrics::counter!("connection_pool_requests_total", "target" => self.target.clone())
            .increment(1);

        let permit = {
            let _queued = GaugeGuard::enter(&self.counters.queued_requests);
            self.permits
                .acquire()
                .await
                .map_err(|_| PoolError::Closed(self.target.clone()))?
        };
        let active = GaugeGuard::enter(&self.counters.active_requests);

        let start = Instant::now();
        let result = self.run_with_retries(&request).await;
        self.record_completion(&result, start.elapsed());

        drop(active);
        drop(permit);
        result
    }

    /// Counter snapshot.
    pub fn status(&self) -> PoolStatus {
        let c = &self.counters;
        let total = c.total_requests.load(Ordering::SeqCst);
        let successful = c.successful_requests.load(Ordering::SeqCst);
        let failed = c.failed_requests.load(Ordering::SeqCst);
        let completed = c.completed_requests.load(Ordering::SeqCst);
        let average = if completed == 0 {
            0.0
        } else {
            c.total_response_ms.load(Ordering::SeqCst) as f64 / completed as f64
        };
        let success_rate = if successful + failed == 0 {
            1.0
        } else {
            successful as f64 / (successful + failed) as f64
        };

        PoolStatus {
            target: self.target.clone(),
            active_requests: c.active_requests.load(Ordering::SeqCst),
            queued_requests: c.queued_requests.load(Ordering::SeqCst),
            total_requests: total,
            successful_requests: successful,
            failed_requests: failed,
            retry_count: c.retry_count.load(Ordering::SeqCst),
            average_response_time_ms: average,
            success_rate,
            config: self.config.clone(),
        }
    }

    /// Grade success rate, queue depth, retry rate and latency.
    ///
    /// Any issue makes the pool unhealthy; warnings alone make it degraded.
    pub fn health_assessment(&self) -> PoolHealth {
        let status = self.status();
        let mut issues = Vec::new();
        let mut warnings = Vec::new();

        let completed = status.successful_requests + status.failed_requests;
        if completed > 0 {
            let pct = status.success_rate * 100.0;
            if status.success_rate < SUCCESS_RATE_UNHEALTHY {
                issues.push(format!("success rate {pct:.1}% is below 80%"));
            } else if status.success_rate < SUCCESS_RATE_DEGRADED {
                warnings.push(format!("success rate {pct:.1}% is below 95%"));
            }
        }

        if status.queued_requests > QUEUE_DEPTH_UNHEALTHY {
            issues.push(format!("{} requests queued", status.queued_requests));
        } else if status.queued_requests > QUEUE_DEPTH_DEGRADED {
            warnings.push(format!("{} requests queued", status.queued_requests));
        }

        if status.total_requests > 0 {
            let retry_rate = status.retry_count as f64 / status.total_requests as f64;
            let pct = retry_rate * 100.0;
            if retry_rate > RETRY_RATE_UNHEALTHY {
                issues.push(format!("retry rate {pct:.1}% is above 50%"));
            } else if retry_rate > RETRY_RATE_DEGRADED {
                warnings.push(format!("retry rate {pct:.1}% is above 10%"));
            }
        }

        let latency = status.average_response_time_ms;
        if latency > LATENCY_UNHEALTHY_MS {
            issues.push(format!("average response time {latency:.0}ms is above 10000ms"));
        } else if latency > LATENCY_DEGRADED_MS {
            warnings.push(format!("average response time {latency:.0}ms is above 5000ms"));
        }

        let grade = if !issues.is_empty() {
            HealthStatus::Unhealthy
        } else if !warnings.is_empty() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        PoolHealth {
            target: self.target.clone(),
            status: grade,
            issues,
            warnings,
            metrics: status,
        }
    }

    /// Zero the cumulative counters. In-flight and queued gauges are live
    /// values and are left alone.
    pub fn reset(&self) {
        let c = &self.counters;
        c.total_requests.store(0, Ordering::SeqCst);
        c.successful_requests.store(0, Ordering::SeqCst);
        c.failed_requests.store(0, Ordering::SeqCst);
        c.retry_count.store(0, Ordering::SeqCst);
        c.completed_requests.store(0, Ordering::SeqCst);
        c.total_response_ms.store(0, Ordering::SeqCst);
        debug!(target = %self.target, "connection pool counters reset");
    }

    async fn run_with_retries(&self, request: &PoolRequest) -> Result<PoolResponse> {
        if let Err(e) = reqwest::Url::parse(&request.url) {
            return Err(PoolError::InvalidRequest {
                target: self.target.clone(),
                message: format!("invalid url {}: {e}", request.url),
            });
        }

        let max_attempts = self.config.max_retries.max(1);
        let mut attempt = 1;

        loop {
            let outcome = self.send_once(request).await;

            let retryable = match &outcome {
                Ok(response) => is_retryable_status(response.status),
                Err((kind, _)) => kind.is_transient(),
            };

            if retryable && attempt < max_attempts {
                self.counters.retry_count.fetch_add(1, Ordering::SeqCst);
                metrics::counter!("connection_pool_retries_total", "target" => self.target.clone())
                    .increment(1);

                let mut delay =
                    calculate_backoff(attempt, self.config.base_delay(), self.config.max_delay());
                if let Ok(response) = &outcome {
                    if let Some(retry_after) = retry_after(&response.headers) {
                        delay = delay.max(retry_after).min(self.config.max_delay());
                    }
                }

                match &outcome {
                    Ok(response) => warn!(
                        target = %self.target,
                        attempt,
                        status = response.status,
                        delay_ms = delay.as_millis() as u64,
                        "retryable status, backing off"
                    ),
                    Err((kind, message)) => warn!(
                        target = %self.target,
                        attempt,
                        error_kind = %kind,
                        error = %message,
                        delay_ms = delay.as_millis() as u64,
                        "transient network error, backing off"
                    ),
                }

                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }

            return match outcome {
                Ok(mut response) => {
                    response.attempts = attempt;
                    Ok(response)
                }
                Err((kind, message)) => Err(PoolError::Network {
                    target: self.target.clone(),
                    kind,
                    attempts: attempt,
                    message,
                }),
            };
        }
    }

    async fn send_once(
        &self,
        request: &PoolRequest,
    ) -> std::result::Result<PoolResponse, (NetworkErrorKind, String)> {
        let timeout = request.timeout.unwrap_or_else(|| self.config.request_timeout());
        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .headers(request.headers.clone())
            .timeout(timeout);

        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Bytes(bytes) => builder.body(bytes.clone()),
            RequestBody::Form(fields) => builder.form(fields),
            RequestBody::Json(value) => builder.json(value),
        };

        let start = Instant::now();
        let response = builder
            .send()
            .await
            .map_err(|e| (classify_reqwest_error(&e), e.to_string()))?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| (classify_reqwest_error(&e), e.to_string()))?;

        Ok(PoolResponse {
            status,
            headers,
            body,
            elapsed: start.elapsed(),
            attempts: 1,
        })
    }

    fn record_completion(&self, result: &Result<PoolResponse>, elapsed: Duration) {
        let c = &self.counters;
        let success = matches!(result, Ok(response) if response.status < 400);
        if success {
            c.successful_requests.fetch_add(1, Ordering::SeqCst);
        } else {
            c.failed_requests.fetch_add(1, Ordering::SeqCst);
        }
        c.completed_requests.fetch_add(1, Ordering::SeqCst);
        c.total_response_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::SeqCst);

        let outcome = if success { "success" } else { "failure" };
        metrics::histogram!(
            "connection_pool_request_duration_seconds",
            "target" => self.target.clone(),
            "outcome" => outcome
        )
        .record(elapsed.as_secs_f64());
    }
}

/// Retry-After in delta-seconds form. HTTP-date values are ignored.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}
