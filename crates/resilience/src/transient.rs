//! Transient failure table
//!
//! One place decides which outbound failures are worth retrying. The
//! connection pool drives its retry loop from it, and the OAuth error type
//! derives both its classification and its breaker failure predicate from
//! it, so pool and breaker never disagree about what "transient" means.

use std::error::Error as StdError;
use std::io;

use serde::Serialize;

/// Transport-level failure classes seen on outbound calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkErrorKind {
    Timeout,
    ConnectionReset,
    ConnectionRefused,
    Dns,
    Aborted,
    /// Anything else (TLS, malformed response, builder errors)
    Other,
}

impl NetworkErrorKind {
    /// Whether this failure class is retryable.
    pub fn is_transient(self) -> bool {
        !matches!(self, NetworkErrorKind::Other)
    }

    /// Label for logs and metrics.
    pub fn label(self) -> &'static str {
        match self {
            NetworkErrorKind::Timeout => "timeout",
            NetworkErrorKind::ConnectionReset => "connection_reset",
            NetworkErrorKind::ConnectionRefused => "connection_refused",
            NetworkErrorKind::Dns => "dns",
            NetworkErrorKind::Aborted => "aborted",
            NetworkErrorKind::Other => "other",
        }
    }
}

/// HTTP statuses that are retried: every 5xx plus 429.
pub fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..=599).contains(&status)
}

/// Classify a reqwest transport error.
///
/// Walks the source chain looking for an `io::Error` first, since the
/// connector reports reset/refused/aborted there. Connect failures with no
/// io cause are resolver failures.
pub fn classify_reqwest_error(err: &reqwest::Error) -> NetworkErrorKind {
    if err.is_timeout() {
        return NetworkErrorKind::Timeout;
    }

    let mut source: Option<&(dyn StdError + 'static)> = err.source();
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            if let Some(kind) = classify_io_kind(io_err.kind()) {
                return kind;
            }
        }
        source = cause.source();
    }

    if err.is_connect() {
        return NetworkErrorKind::Dns;
    }
    NetworkErrorKind::Other
}

fn classify_io_kind(kind: io::ErrorKind) -> Option<NetworkErrorKind> {
    match kind {
        io::ErrorKind::TimedOut => Some(NetworkErrorKind::Timeout),
        io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => {
            Some(NetworkErrorKind::ConnectionReset)
        }
        io::ErrorKind::ConnectionRefused => Some(NetworkErrorKind::ConnectionRefused),
        io::ErrorKind::ConnectionAborted | io::ErrorKind::UnexpectedEof => {
            Some(NetworkErrorKind::Aborted)
        }
        _ => None,
    }
}
