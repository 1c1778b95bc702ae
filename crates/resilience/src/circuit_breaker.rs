//! Circuit breaker for outbound targets
//!
//! One breaker guards one logical target ("airtable-oauth", "notion-api").
//!
//! ```text
//! Closed   → Open:     failure_count reaches failure_threshold
//! Open     → HalfOpen: first call after next_attempt_at
//! HalfOpen → Closed:   success_threshold consecutive successes
//! HalfOpen → Open:     any failure
//! ```
//!
//! Every transition, including `reset()` and `force_state()`, goes through
//! `transition()` so the per-state counters are always reset together. The
//! state lock is never held across an `await`; the wrapped operation runs
//! unlocked and its outcome is recorded afterwards.
//!
//! State changes and rejections are published on a broadcast channel;
//! observers call `subscribe()` instead of registering callbacks.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use common::Clock;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::BreakerError;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Label used in logs and the status API.
    pub fn label(self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }

    /// Gauge encoding: 0 closed, 1 open, 2 half-open.
    fn gauge_value(self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::Open => 1.0,
            CircuitState::HalfOpen => 2.0,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for CircuitState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "closed" => Ok(CircuitState::Closed),
            "open" => Ok(CircuitState::Open),
            "half_open" | "half-open" => Ok(CircuitState::HalfOpen),
            other => Err(format!("unknown circuit state: {other}")),
        }
    }
}

/// Breaker thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures in CLOSED before opening
    pub failure_threshold: u32,
    /// Consecutive successes in HALF_OPEN before closing
    pub success_threshold: u32,
    /// How long OPEN rejects calls before allowing a trial
    pub reset_timeout_secs: u64,
    /// Trial calls admitted while HALF_OPEN
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout_secs: 60,
            half_open_max_calls: 3,
        }
    }
}

impl BreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_secs(self.reset_timeout_secs)
    }

    /// Reject thresholds that would wedge the state machine.
    ///
    /// `success_threshold` above `half_open_max_calls` could never close the
    /// circuit, since no more trial calls would be admitted.
    pub fn validate(&self) -> common::Result<()> {
        if self.failure_threshold == 0 {
            return Err(common::Error::Config(
                "failure_threshold must be greater than 0".into(),
            ));
        }
        if self.success_threshold == 0 {
            return Err(common::Error::Config(
                "success_threshold must be greater than 0".into(),
            ));
        }
        if self.half_open_max_calls == 0 {
            return Err(common::Error::Config(
                "half_open_max_calls must be greater than 0".into(),
            ));
        }
        if self.success_threshold > self.half_open_max_calls {
            return Err(common::Error::Config(format!(
                "success_threshold ({}) must not exceed half_open_max_calls ({})",
                self.success_threshold, self.half_open_max_calls
            )));
        }
        if self.reset_timeout_secs == 0 {
            return Err(common::Error::Config(
                "reset_timeout_secs must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Event published to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakerEvent {
    StateChanged {
        name: String,
        from: CircuitState,
        to: CircuitState,
        at_millis: u64,
    },
    Rejected {
        name: String,
        state: CircuitState,
    },
}

/// Cumulative counters, never reset by transitions.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BreakerMetrics {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    pub circuit_open_count: u64,
    pub last_state_change: u64,
}

/// Point-in-time view for the status API.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub half_open_calls: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_time: Option<u64>,
    pub metrics: BreakerMetrics,
    pub config: BreakerConfig,
}

/// Health summary: healthy iff CLOSED.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerHealth {
    pub name: String,
    pub healthy: bool,
    pub state: CircuitState,
    pub recommendation: String,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    half_open_calls: u32,
    next_attempt_at: Option<u64>,
    last_failure_time: Option<u64>,
    metrics: BreakerMetrics,
}

/// Circuit breaker wrapping async operations against one target.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
    events: broadcast::Sender<BreakerEvent>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let name = name.into();
        let now = clock.now_millis();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        metrics::gauge!("circuit_breaker_state", "breaker" => name.clone())
            .set(CircuitState::Closed.gauge_value());
        debug!(breaker = %name, ?config, "circuit breaker created");
        Self {
            name,
            config,
            clock,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                half_open_calls: 0,
                next_attempt_at: None,
                last_failure_time: None,
                metrics: BreakerMetrics {
                    last_state_change: now,
                    ..BreakerMetrics::default()
                },
            }),
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Receive state-change and rejection events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<BreakerEvent> {
        self.events.subscribe()
    }

    /// Run `operation` through the breaker; every error counts as a failure.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_classified(operation, |_| true).await
    }

    /// Run `operation` through the breaker; only errors for which
    /// `is_failure` returns true count against the target.
    ///
    /// Errors that do not count (an authoritative rejection from a healthy
    /// service) are returned unchanged and leave the breaker's counters as
    /// they were, apart from `total_calls`.
    pub async fn execute_classified<T, E, F, Fut, P>(
        &self,
        operation: F,
        is_failure: P,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnOnce(&E) -> bool,
    {
        if let Err((state, retry_after_ms)) = self.try_acquire() {
            metrics::counter!("circuit_breaker_rejections_total", "breaker" => self.name.clone())
                .increment(1);
            let _ = self.events.send(BreakerEvent::Rejected {
                name: self.name.clone(),
                state,
            });
            debug!(breaker = %self.name, %state, retry_after_ms, "call rejected");
            return Err(BreakerError::Open {
                name: self.name.clone(),
                state,
                retry_after_ms,
            });
        }

        let mut guard = CallGuard {
            breaker: self,
            settled: false,
        };
        let result = operation().await;
        guard.settled = true;

        match result {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                if is_failure(&e) {
                    self.record_failure();
                } else {
                    self.release_trial_slot();
                }
                Err(BreakerError::Inner(e))
            }
        }
    }

    /// Snapshot for the status endpoint.
    pub fn status(&self) -> BreakerStatus {
        let inner = self.inner.lock();
        BreakerStatus {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            half_open_calls: inner.half_open_calls,
            next_attempt_at: inner.next_attempt_at,
            last_failure_time: inner.last_failure_time,
            metrics: inner.metrics.clone(),
            config: self.config.clone(),
        }
    }

    pub fn health_assessment(&self) -> BreakerHealth {
        let now = self.clock.now_millis();
        let inner = self.inner.lock();
        let recommendation = match inner.state {
            CircuitState::Closed if inner.failure_count == 0 => "operating normally".to_string(),
            CircuitState::Closed => format!(
                "{} recent failure(s), circuit opens at {}; monitor {}",
                inner.failure_count, self.config.failure_threshold, self.name
            ),
            CircuitState::Open => {
                let remaining = inner
                    .next_attempt_at
                    .map(|at| at.saturating_sub(now))
                    .unwrap_or(0);
                format!(
                    "{} is failing; calls rejected for another {}s, check the upstream service",
                    self.name,
                    remaining.div_ceil(1000)
                )
            }
            CircuitState::HalfOpen => format!(
                "testing recovery: {}/{} trial calls succeeded",
                inner.success_count, self.config.success_threshold
            ),
        };
        BreakerHealth {
            name: self.name.clone(),
            healthy: inner.state == CircuitState::Closed,
            state: inner.state,
            recommendation,
        }
    }

    /// Return to CLOSED with all per-state counters cleared.
    pub fn reset(&self) {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock();
        inner.last_failure_time = None;
        self.transition(&mut inner, CircuitState::Closed, now);
        info!(breaker = %self.name, "circuit breaker reset");
    }

    /// Move to `state` with the same side effects a natural transition has.
    pub fn force_state(&self, state: CircuitState) {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock();
        self.transition(&mut inner, state, now);
        warn!(breaker = %self.name, %state, "circuit breaker state forced");
    }

    /// Admission check. Returns the rejecting state and ms until the next
    /// trial when the call must fail fast.
    fn try_acquire(&self) -> Result<(), (CircuitState, u64)> {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock();
        inner.metrics.total_calls += 1;

        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let next_attempt_at = inner.next_attempt_at.unwrap_or(now);
                if now >= next_attempt_at {
                    self.transition(&mut inner, CircuitState::HalfOpen, now);
                    inner.half_open_calls += 1;
                    Ok(())
                } else {
                    inner.metrics.rejected_calls += 1;
                    Err((CircuitState::Open, next_attempt_at - now))
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_calls < self.config.half_open_max_calls {
                    inner.half_open_calls += 1;
                    Ok(())
                } else {
                    inner.metrics.rejected_calls += 1;
                    Err((CircuitState::HalfOpen, 0))
                }
            }
        }
    }

    fn record_success(&self) {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock();
        inner.metrics.successful_calls += 1;
        inner.success_count += 1;
        inner.failure_count = 0;

        if inner.state == CircuitState::HalfOpen
            && inner.success_count >= self.config.success_threshold
        {
            self.transition(&mut inner, CircuitState::Closed, now);
        }
    }

    fn record_failure(&self) {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock();
        inner.metrics.failed_calls += 1;
        inner.failure_count += 1;
        inner.success_count = 0;
        inner.last_failure_time = Some(now);

        match inner.state {
            CircuitState::HalfOpen => self.transition(&mut inner, CircuitState::Open, now),
            CircuitState::Closed if inner.failure_count >= self.config.failure_threshold => {
                self.transition(&mut inner, CircuitState::Open, now)
            }
            _ => {}
        }
    }

    /// Give back a HALF_OPEN trial slot for a call that neither passed nor
    /// failed (ignored error or cancelled future).
    fn release_trial_slot(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.half_open_calls = inner.half_open_calls.saturating_sub(1);
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState, now: u64) {
        let from = inner.state;
        inner.state = to;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.half_open_calls = 0;
        inner.metrics.last_state_change = now;

        if to == CircuitState::Open {
            let reset_timeout = self.config.reset_timeout().as_millis() as u64;
            inner.next_attempt_at = Some(now + reset_timeout);
            inner.metrics.circuit_open_count += 1;
        } else {
            inner.next_attempt_at = None;
        }

        metrics::gauge!("circuit_breaker_state", "breaker" => self.name.clone())
            .set(to.gauge_value());
        metrics::counter!(
            "circuit_breaker_transitions_total",
            "breaker" => self.name.clone(),
            "to" => to.label()
        )
        .increment(1);

        if to == CircuitState::Open {
            warn!(breaker = %self.name, %from, %to, "circuit opened");
        } else {
            info!(breaker = %self.name, %from, %to, "circuit state changed");
        }

        let _ = self.events.send(BreakerEvent::StateChanged {
            name: self.name.clone(),
            from,
            to,
            at_millis: now,
        });
    }
}

/// Returns the trial slot if the operation future is dropped before it
/// settles (caller-side timeout).
struct CallGuard<'a> {
    breaker: &'a CircuitBreaker,
    settled: bool,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release_trial_slot();
        }
    }
}
