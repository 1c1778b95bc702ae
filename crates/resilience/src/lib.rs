//! Outbound resilience for third-party calls
//!
//! Every call the gateway makes to a third party (OAuth token endpoints
//! included) runs inside a `CircuitBreaker` keyed by target service and is
//! executed by a `ConnectionPool` keyed by target host:
//!
//! ```text
//! breaker.execute(|| pool.execute(request))
//!   → fail fast while the target's circuit is open
//!   → wait for a pool slot (FIFO)
//!   → attempt, retrying transient failures with jittered backoff
//! ```
//!
//! What counts as transient is decided once, in `transient`.

pub mod backoff;
pub mod circuit_breaker;
pub mod connection_pool;
pub mod error;
pub mod registry;
pub mod transient;

pub use backoff::calculate_backoff;
pub use circuit_breaker::{
    BreakerConfig, BreakerEvent, BreakerHealth, BreakerMetrics, BreakerStatus, CircuitBreaker,
    CircuitState,
};
pub use connection_pool::{
    ConnectionPool, HealthStatus, PoolConfig, PoolHealth, PoolRequest, PoolResponse, PoolStatus,
    RequestBody,
};
pub use error::{BreakerError, PoolError, Result};
pub use registry::{BreakerRegistry, PoolRegistry, target_host};
pub use transient::{NetworkErrorKind, classify_reqwest_error, is_retryable_status};
