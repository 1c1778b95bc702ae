//! Token endpoint contract

use std::future::Future;
use std::pin::Pin;

use common::Secret;
use serde::Deserialize;

use crate::error::RefreshError;

/// Successful refresh response.
///
/// `expires_in` is a delta in seconds from the response time; `None` means
/// the provider issued a non-expiring token. A missing `refresh_token` means
/// the provider did not rotate it and the old one stays valid.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: Secret<String>,
    #[serde(default)]
    pub refresh_token: Option<Secret<String>>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

impl TokenResponse {
    /// Absolute expiry in unix milliseconds, given the time of the response.
    pub fn expires_at(&self, now_millis: u64) -> Option<u64> {
        self.expires_in
            .map(|secs| now_millis.saturating_add(secs.saturating_mul(1000)))
    }
}

/// OAuth client registered with the provider.
#[derive(Debug, Clone)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: Secret<String>,
}

/// A token endpoint that can exchange a refresh token for a new access token.
///
/// Uses `Pin<Box<dyn Future>>` return types so it can be held as
/// `Arc<dyn TokenEndpoint>`.
pub trait TokenEndpoint: Send + Sync {
    /// Name for logging, e.g. "airtable-oauth".
    fn name(&self) -> &str;

    fn refresh<'a>(
        &'a self,
        refresh_token: &'a str,
        client: &'a ClientCredentials,
    ) -> Pin<Box<dyn Future<Output = Result<TokenResponse, RefreshError>> + Send + 'a>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_response_deserializes() {
        let json = r#"{
            "access_token": "at_abc",
            "refresh_token": "rt_def",
            "expires_in": 3600,
            "token_type": "bearer"
        }"#;
        let token: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(token.access_token.expose(), "at_abc");
        assert_eq!(token.refresh_token.unwrap().expose(), "rt_def");
        assert_eq!(token.expires_in, Some(3600));
    }

    #[test]
    fn refresh_token_and_expiry_are_optional() {
        let token: TokenResponse = serde_json::from_str(r#"{"access_token":"at"}"#).unwrap();
        assert!(token.refresh_token.is_none());
        assert_eq!(token.expires_at(1_000), None);
    }

    #[test]
    fn expires_at_is_absolute() {
        let token: TokenResponse =
            serde_json::from_str(r#"{"access_token":"at","expires_in":60}"#).unwrap();
        assert_eq!(token.expires_at(1_000), Some(61_000));
    }
}
