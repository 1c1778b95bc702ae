//! Token endpoint over HTTP, behind a circuit breaker and connection pool

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{ACCEPT, HeaderValue};
use resilience::{BreakerError, CircuitBreaker, ConnectionPool, PoolError, PoolRequest};
use tracing::{debug, warn};

use crate::error::{RefreshError, classify_token_error};
use crate::token::{ClientCredentials, TokenEndpoint, TokenResponse};

#[derive(Debug)]
pub struct HttpTokenEndpoint {
    name: String,
    token_url: String,
    timeout: Duration,
    breaker: Arc<CircuitBreaker>,
    pool: Arc<ConnectionPool>,
}

impl HttpTokenEndpoint {
    pub fn new(
        name: impl Into<String>,
        token_url: impl Into<String>,
        timeout: Duration,
        breaker: Arc<CircuitBreaker>,
        pool: Arc<ConnectionPool>,
    ) -> Self {
        Self {
            name: name.into(),
            token_url: token_url.into(),
            timeout,
            breaker,
            pool,
        }
    }

    pub fn token_url(&self) -> &str {
        &self.token_url
    }

    async fn call(&self, request: PoolRequest) -> Result<TokenResponse, RefreshError> {
        let response = self.pool.execute(request).await.map_err(from_pool_error)?;

        if !response.is_success() {
            let err = classify_token_error(response.status, &response.text());
            debug!(
                endpoint = %self.name,
                status = response.status,
                error_type = %err.kind(),
                "token endpoint rejected refresh"
            );
            return Err(err);
        }

        response.json::<TokenResponse>().map_err(|e| RefreshError::Unknown {
            status: Some(response.status),
            message: format!("invalid token response: {e}"),
        })
    }
}

impl TokenEndpoint for HttpTokenEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn refresh<'a>(
        &'a self,
        refresh_token: &'a str,
        client: &'a ClientCredentials,
    ) -> Pin<Box<dyn Future<Output = Result<TokenResponse, RefreshError>> + Send + 'a>> {
        Box::pin(async move {
            let request = PoolRequest::post(&self.token_url)
                .header(ACCEPT, HeaderValue::from_static("application/json"))
                .form(vec![
                    ("grant_type".into(), "refresh_token".into()),
                    ("refresh_token".into(), refresh_token.into()),
                    ("client_id".into(), client.client_id.clone()),
                    ("client_secret".into(), client.client_secret.expose().clone()),
                ])
                .timeout(self.timeout);

            let outcome = self
                .breaker
                .execute_classified(|| self.call(request), RefreshError::is_transient)
                .await;

            match outcome {
                Ok(token) => Ok(token),
                Err(BreakerError::Inner(e)) => Err(e),
                Err(BreakerError::Open {
                    name,
                    state,
                    retry_after_ms,
                }) => {
                    warn!(
                        endpoint = %self.name,
                        breaker = %name,
                        %state,
                        retry_after_ms,
                        "token endpoint circuit open"
                    );
                    Err(RefreshError::ServiceUnavailable {
                        status: None,
                        message: format!("circuit '{name}' is {state}"),
                    })
                }
            }
        })
    }
}

fn from_pool_error(err: PoolError) -> RefreshError {
    match err {
        PoolError::Network { kind, message, .. } => RefreshError::Network { kind, message },
        PoolError::InvalidRequest { message, .. } => RefreshError::InvalidRequest {
            description: message,
        },
        PoolError::Closed(target) => RefreshError::ServiceUnavailable {
            status: None,
            message: format!("connection pool '{target}' is closed"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RefreshErrorKind;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::post;
    use common::ManualClock;
    use resilience::{BreakerConfig, CircuitState, PoolConfig};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
        format!("http://{addr}/oauth/token")
    }

    fn endpoint(url: &str, failure_threshold: u32) -> HttpTokenEndpoint {
        let breaker = Arc::new(CircuitBreaker::new(
            "test-oauth",
            BreakerConfig {
                failure_threshold,
                ..BreakerConfig::default()
            },
            Arc::new(ManualClock::new(1_700_000_000_000)),
        ));
        let pool = Arc::new(ConnectionPool::new(
            "127.0.0.1",
            PoolConfig {
                max_retries: 2,
                base_delay_ms: 1,
                max_delay_ms: 5,
                ..PoolConfig::default()
            },
            reqwest::Client::new(),
        ));
        HttpTokenEndpoint::new("test-oauth", url, Duration::from_secs(5), breaker, pool)
    }

    fn client() -> ClientCredentials {
        ClientCredentials {
            client_id: "client-1".into(),
            client_secret: "shh".into(),
        }
    }

    #[tokio::test]
    async fn refresh_posts_form_and_parses_tokens() {
        let router = Router::new().route(
            "/oauth/token",
            post(|axum::Form(form): axum::Form<HashMap<String, String>>| async move {
                assert_eq!(form["grant_type"], "refresh_token");
                assert_eq!(form["refresh_token"], "rt_old");
                assert_eq!(form["client_id"], "client-1");
                assert_eq!(form["client_secret"], "shh");
                axum::Json(serde_json::json!({
                    "access_token": "at_new",
                    "refresh_token": "rt_new",
                    "expires_in": 3600
                }))
            }),
        );
        let url = serve(router).await;

        let token = endpoint(&url, 5).refresh("rt_old", &client()).await.unwrap();
        assert_eq!(token.access_token.expose(), "at_new");
        assert_eq!(token.refresh_token.unwrap().expose(), "rt_new");
        assert_eq!(token.expires_in, Some(3600));
    }

    #[tokio::test]
    async fn invalid_grant_does_not_trip_breaker() {
        let router = Router::new().route(
            "/oauth/token",
            post(|| async {
                (
                    StatusCode::BAD_REQUEST,
                    axum::Json(serde_json::json!({"error": "invalid_grant"})),
                )
            }),
        );
        let url = serve(router).await;
        let ep = endpoint(&url, 1);

        for _ in 0..3 {
            let err = ep.refresh("rt_revoked", &client()).await.unwrap_err();
            assert_eq!(err.kind(), RefreshErrorKind::InvalidRefreshToken);
        }
        assert_eq!(ep.breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn unavailable_endpoint_opens_breaker_and_fails_fast() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let router = Router::new().route(
            "/oauth/token",
            post(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    StatusCode::SERVICE_UNAVAILABLE
                }
            }),
        );
        let url = serve(router).await;
        let ep = endpoint(&url, 1);

        let err = ep.refresh("rt", &client()).await.unwrap_err();
        assert_eq!(err.kind(), RefreshErrorKind::ServiceUnavailable);
        // Pool retried once before giving up.
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(ep.breaker.state(), CircuitState::Open);

        let err = ep.refresh("rt", &client()).await.unwrap_err();
        assert_eq!(err.kind(), RefreshErrorKind::ServiceUnavailable);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn malformed_success_body_is_unknown() {
        let router = Router::new().route("/oauth/token", post(|| async { "not json" }));
        let url = serve(router).await;

        let err = endpoint(&url, 5).refresh("rt", &client()).await.unwrap_err();
        assert_eq!(err.kind(), RefreshErrorKind::UnknownError);
    }

    #[tokio::test]
    async fn refused_connection_is_network_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = endpoint(&format!("http://{addr}/oauth/token"), 5)
            .refresh("rt", &client())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), RefreshErrorKind::NetworkError);
        assert!(err.is_transient());
    }
}
