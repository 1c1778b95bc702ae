//! Error types for outbound resilience

use std::fmt;

use crate::circuit_breaker::CircuitState;
use crate::transient::NetworkErrorKind;

/// Error returned by `CircuitBreaker::execute`.
///
/// `Open` is the fast-fail path: the wrapped operation was never invoked.
/// `Inner` carries the operation's own error untouched.
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    #[error("circuit breaker '{name}' is {state}, retry after {retry_after_ms}ms")]
    Open {
        name: String,
        state: CircuitState,
        retry_after_ms: u64,
    },

    #[error("{0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    /// Whether the call was rejected without running the operation.
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }

    /// The operation's error, if it ran.
    pub fn into_inner(self) -> Option<E> {
        match self {
            BreakerError::Inner(e) => Some(e),
            BreakerError::Open { .. } => None,
        }
    }
}

/// Errors from connection pool execution.
///
/// HTTP error statuses are not errors here: the final response is returned
/// as-is so callers can classify it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PoolError {
    #[error("{kind} calling {target} after {attempts} attempt(s): {message}")]
    Network {
        target: String,
        kind: NetworkErrorKind,
        attempts: u32,
        message: String,
    },

    #[error("invalid request for {target}: {message}")]
    InvalidRequest { target: String, message: String },

    #[error("connection pool '{0}' is closed")]
    Closed(String),
}

impl PoolError {
    /// Network class for transport failures, `None` otherwise.
    pub fn network_kind(&self) -> Option<NetworkErrorKind> {
        match self {
            PoolError::Network { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

impl fmt::Display for NetworkErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_error_names_breaker_and_state() {
        let err: BreakerError<std::io::Error> = BreakerError::Open {
            name: "airtable-oauth".into(),
            state: CircuitState::Open,
            retry_after_ms: 1500,
        };
        let msg = err.to_string();
        assert!(msg.contains("airtable-oauth"), "got: {msg}");
        assert!(msg.contains("OPEN"), "got: {msg}");
        assert!(err.is_open());
        assert!(err.into_inner().is_none());
    }

    #[test]
    fn inner_error_is_passed_through() {
        let err: BreakerError<String> = BreakerError::Inner("upstream 502".into());
        assert_eq!(err.to_string(), "upstream 502");
        assert!(!err.is_open());
        assert_eq!(err.into_inner().as_deref(), Some("upstream 502"));
    }

    #[test]
    fn network_error_display() {
        let err = PoolError::Network {
            target: "api.notion.com".into(),
            kind: NetworkErrorKind::ConnectionRefused,
            attempts: 3,
            message: "tcp connect error".into(),
        };
        assert_eq!(
            err.to_string(),
            "connection_refused calling api.notion.com after 3 attempt(s): tcp connect error"
        );
        assert_eq!(err.network_kind(), Some(NetworkErrorKind::ConnectionRefused));
    }
}
