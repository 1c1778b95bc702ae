//! Credential resolution and OAuth token refresh
//!
//! Resolution flow for one instance:
//! 1. `CredentialResolver::resolve` checks the `CredentialCache`
//! 2. On a miss it loads the instance from the `CredentialStore`
//! 3. An expired (or nearly expired) token goes to the orchestrator
//! 4. `TokenRefreshOrchestrator::perform_refresh` tries the primary token
//!    endpoint, falls back once when it is unavailable, then writes the new
//!    tokens to the store and the cache
//!
//! Every refresh attempt is reported to an `AuditSink`.

pub mod audit;
pub mod error;
pub mod orchestrator;
pub mod resolver;
pub mod store;

pub use audit::{AuditSink, RefreshAuditRecord, RefreshMethod, TracingAuditSink};
pub use error::{ResolveError, StoreError};
pub use orchestrator::{RefreshFailure, RefreshRequest, RefreshResult, TokenRefreshOrchestrator};
pub use resolver::{CredentialResolver, CredentialSource, ResolvedCredential};
pub use store::{CredentialStore, FileCredentialStore, InstanceCredentials, OAuthStatusUpdate};
