//! Error types for credential storage and resolution

use credential_cache::CredentialStatus;
use oauth_provider::RefreshErrorKind;
use uuid::Uuid;

/// Errors from a `CredentialStore`.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("credential parse error: {0}")]
    Parse(String),

    #[error("instance {0} not in credential store")]
    NotFound(Uuid),
}

/// Why a credential could not be resolved for an instance.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("instance {0} not found")]
    NotFound(Uuid),

    #[error("instance {instance_id} is {}", .status.label())]
    Inactive {
        instance_id: Uuid,
        status: CredentialStatus,
    },

    #[error("instance {instance_id} must re-authenticate: {reason}")]
    ReauthRequired { instance_id: Uuid, reason: String },

    #[error("credentials for {instance_id} temporarily unavailable: {message}")]
    Unavailable { instance_id: Uuid, message: String },

    #[error("token refresh for {instance_id} failed with {error_type}")]
    RefreshFailed {
        instance_id: Uuid,
        error_type: RefreshErrorKind,
    },

    #[error("credential store: {0}")]
    Store(#[from] StoreError),
}

impl ResolveError {
    /// Status code to answer the proxied request with.
    pub fn http_status(&self) -> u16 {
        match self {
            ResolveError::NotFound(_) => 404,
            ResolveError::Inactive { .. } => 403,
            ResolveError::ReauthRequired { .. } => 401,
            ResolveError::Unavailable { .. } | ResolveError::Store(_) => 503,
            ResolveError::RefreshFailed { .. } => 502,
        }
    }
}
