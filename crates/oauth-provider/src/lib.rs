//! OAuth token endpoint client
//!
//! Refreshes access tokens against a provider's token endpoint and turns
//! every failure into a `RefreshError` at the call boundary:
//!
//! 1. `HttpTokenEndpoint::refresh` POSTs `grant_type=refresh_token`
//! 2. The call runs inside the endpoint's circuit breaker and connection pool
//! 3. Non-2xx responses go through `classify_token_error`
//! 4. Only transient failures count against the breaker
//!
//! `TokenEndpoint` is the seam the refresh orchestrator depends on, so tests
//! can swap in scripted endpoints.

pub mod error;
pub mod http;
pub mod token;

pub use error::{RefreshError, RefreshErrorKind, classify_token_error};
pub use http::HttpTokenEndpoint;
pub use resilience::NetworkErrorKind;
pub use token::{ClientCredentials, TokenEndpoint, TokenResponse};
