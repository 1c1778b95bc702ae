//! Refresh failure classification
//!
//! | kind | requires reauth | transient |
//! |---|---|---|
//! | `INVALID_REFRESH_TOKEN` | yes | no |
//! | `INVALID_CLIENT_CREDENTIALS` | yes | no |
//! | `INVALID_REQUEST` | no | no |
//! | `NETWORK_ERROR` | no | yes |
//! | `SERVICE_UNAVAILABLE` | no | yes |
//! | `UNKNOWN_ERROR` | no | no |

use std::fmt;

use resilience::{NetworkErrorKind, is_retryable_status};
use serde::{Deserialize, Serialize};

/// Why a refresh failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RefreshError {
    #[error("refresh token rejected: {description}")]
    InvalidRefreshToken { description: String },

    #[error("client credentials rejected: {description}")]
    InvalidClientCredentials { description: String },

    #[error("token request rejected as malformed: {description}")]
    InvalidRequest { description: String },

    #[error("network error ({kind}): {message}")]
    Network {
        kind: NetworkErrorKind,
        message: String,
    },

    #[error("token service unavailable: {message}")]
    ServiceUnavailable { status: Option<u16>, message: String },

    #[error("unexpected token endpoint response: {message}")]
    Unknown { status: Option<u16>, message: String },
}

/// Stable error type name reported in refresh results and audit records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefreshErrorKind {
    InvalidRefreshToken,
    InvalidClientCredentials,
    InvalidRequest,
    NetworkError,
    ServiceUnavailable,
    UnknownError,
}

impl RefreshErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RefreshErrorKind::InvalidRefreshToken => "INVALID_REFRESH_TOKEN",
            RefreshErrorKind::InvalidClientCredentials => "INVALID_CLIENT_CREDENTIALS",
            RefreshErrorKind::InvalidRequest => "INVALID_REQUEST",
            RefreshErrorKind::NetworkError => "NETWORK_ERROR",
            RefreshErrorKind::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            RefreshErrorKind::UnknownError => "UNKNOWN_ERROR",
        }
    }

    /// The user must go through the OAuth authorization flow again.
    pub fn requires_reauth(self) -> bool {
        matches!(
            self,
            RefreshErrorKind::InvalidRefreshToken | RefreshErrorKind::InvalidClientCredentials
        )
    }
}

impl fmt::Display for RefreshErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RefreshError {
    pub fn kind(&self) -> RefreshErrorKind {
        match self {
            RefreshError::InvalidRefreshToken { .. } => RefreshErrorKind::InvalidRefreshToken,
            RefreshError::InvalidClientCredentials { .. } => {
                RefreshErrorKind::InvalidClientCredentials
            }
            RefreshError::InvalidRequest { .. } => RefreshErrorKind::InvalidRequest,
            RefreshError::Network { .. } => RefreshErrorKind::NetworkError,
            RefreshError::ServiceUnavailable { .. } => RefreshErrorKind::ServiceUnavailable,
            RefreshError::Unknown { .. } => RefreshErrorKind::UnknownError,
        }
    }

    pub fn requires_reauth(&self) -> bool {
        self.kind().requires_reauth()
    }

    /// Failure of the provider rather than of this request. Only these count
    /// against the endpoint's circuit breaker.
    pub fn is_transient(&self) -> bool {
        match self {
            RefreshError::Network { kind, .. } => kind.is_transient(),
            RefreshError::ServiceUnavailable { .. } => true,
            _ => false,
        }
    }
}

/// RFC 6749 §5.2 error body.
#[derive(Debug, Deserialize)]
struct OAuthErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Classify a non-2xx token endpoint response.
///
/// The OAuth `error` code wins when the body carries one; otherwise the
/// status decides.
pub fn classify_token_error(status: u16, body: &str) -> RefreshError {
    let parsed = serde_json::from_str::<OAuthErrorBody>(body).ok();

    if let Some(err) = &parsed {
        let description = err
            .error_description
            .clone()
            .unwrap_or_else(|| err.error.clone());
        match err.error.as_str() {
            "invalid_grant" => return RefreshError::InvalidRefreshToken { description },
            "invalid_client" | "unauthorized_client" => {
                return RefreshError::InvalidClientCredentials { description };
            }
            "invalid_request" | "unsupported_grant_type" | "invalid_scope" => {
                return RefreshError::InvalidRequest { description };
            }
            "temporarily_unavailable" | "server_error" => {
                return RefreshError::ServiceUnavailable {
                    status: Some(status),
                    message: description,
                };
            }
            _ => {}
        }
    }

    let message = match &parsed {
        Some(err) => format!("{status}: {}", err.error),
        None => format!("{status}: {}", truncate(body, 200)),
    };
    match status {
        400 => RefreshError::InvalidRequest {
            description: message,
        },
        401 => RefreshError::InvalidClientCredentials {
            description: message,
        },
        s if is_retryable_status(s) => RefreshError::ServiceUnavailable {
            status: Some(s),
            message,
        },
        s => RefreshError::Unknown {
            status: Some(s),
            message,
        },
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
