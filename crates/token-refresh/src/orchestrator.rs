//! Primary/fallback OAuth token refresh
//!
//! `perform_refresh` never fails: every outcome, including a revoked refresh
//! token or both endpoints being down, is a `RefreshResult`.
//!
//! Decision table for the primary endpoint's outcome:
//! - success: persist, cache, done (`method = primary`)
//! - `SERVICE_UNAVAILABLE`: one attempt against the fallback, if configured
//! - anything else: fail without fallback
//!
//! A failure that requires re-authentication clears the stored tokens, marks
//! the instance expired and evicts it from the cache.

use std::sync::Arc;

use common::{Clock, Secret};
use credential_cache::{CredentialCache, CredentialData};
use oauth_provider::{
    ClientCredentials, RefreshError, RefreshErrorKind, TokenEndpoint, TokenResponse,
};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{AuditSink, RefreshAuditRecord, RefreshMethod};
use crate::store::{CredentialStore, OAuthStatusUpdate};

/// Inputs for one refresh.
#[derive(Debug, Clone, Copy)]
pub struct RefreshRequest<'a> {
    pub instance_id: Uuid,
    pub user_id: &'a str,
    /// Lapse time of the instance, carried into the cache entry.
    pub instance_expires_at: Option<u64>,
    pub refresh_token: &'a str,
    pub client: &'a ClientCredentials,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshFailure {
    pub error_type: RefreshErrorKind,
    pub message: String,
    pub requires_reauth: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshResult {
    pub success: bool,
    /// Endpoint that produced the final outcome.
    pub method: RefreshMethod,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RefreshFailure>,
}

pub struct TokenRefreshOrchestrator {
    primary: Arc<dyn TokenEndpoint>,
    fallback: Option<Arc<dyn TokenEndpoint>>,
    store: Arc<dyn CredentialStore>,
    cache: Arc<CredentialCache>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
}

impl TokenRefreshOrchestrator {
    pub fn new(
        primary: Arc<dyn TokenEndpoint>,
        fallback: Option<Arc<dyn TokenEndpoint>>,
        store: Arc<dyn CredentialStore>,
        cache: Arc<CredentialCache>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            primary,
            fallback,
            store,
            cache,
            audit,
            clock,
        }
    }

    pub async fn perform_refresh(&self, request: RefreshRequest<'_>) -> RefreshResult {
        let instance_id = request.instance_id;
        let started_at = self.clock.now_millis();

        // Absent entries are normal here: the resolver refreshes on cache miss.
        if let Ok(attempts) = self.cache.record_refresh_attempt(&instance_id).await {
            debug!(%instance_id, attempts, "refresh attempt recorded");
        }

        let (method, outcome) = self.refresh_with_fallback(&request).await;
        let finished_at = self.clock.now_millis();

        let result = match outcome {
            Ok(token) => {
                self.apply_tokens(&request, token, finished_at).await;
                info!(%instance_id, method = method.label(), "token refreshed");
                RefreshResult {
                    success: true,
                    method,
                    duration_ms: finished_at.saturating_sub(started_at),
                    error: None,
                }
            }
            Err(err) => {
                if err.requires_reauth() {
                    self.require_reauth(&instance_id).await;
                }
                warn!(
                    %instance_id,
                    method = method.label(),
                    error_type = %err.kind(),
                    error = %err,
                    "token refresh failed"
                );
                RefreshResult {
                    success: false,
                    method,
                    duration_ms: finished_at.saturating_sub(started_at),
                    error: Some(RefreshFailure {
                        error_type: err.kind(),
                        message: err.to_string(),
                        requires_reauth: err.requires_reauth(),
                    }),
                }
            }
        };

        self.audit.record_refresh(&RefreshAuditRecord {
            instance_id,
            method,
            success: result.success,
            error_type: result.error.as_ref().map(|e| e.error_type),
            started_at,
            finished_at,
        });
        result
    }

    async fn refresh_with_fallback(
        &self,
        request: &RefreshRequest<'_>,
    ) -> (RefreshMethod, Result<TokenResponse, RefreshError>) {
        let primary = self
            .primary
            .refresh(request.refresh_token, request.client)
            .await;

        let unavailable = matches!(
            &primary,
            Err(err) if err.kind() == RefreshErrorKind::ServiceUnavailable
        );
        let fallback = match &self.fallback {
            Some(fallback) if unavailable => fallback,
            _ => return (RefreshMethod::Primary, primary),
        };

        warn!(
            instance_id = %request.instance_id,
            primary = self.primary.name(),
            fallback = fallback.name(),
            "primary token endpoint unavailable, trying fallback"
        );
        let outcome = fallback
            .refresh(request.refresh_token, request.client)
            .await;
        (RefreshMethod::Fallback, outcome)
    }

    async fn apply_tokens(&self, request: &RefreshRequest<'_>, token: TokenResponse, now: u64) {
        let instance_id = request.instance_id;
        let expires_at = token.expires_at(now);
        // Providers that do not rotate refresh tokens omit the field.
        let refresh_token = token
            .refresh_token
            .unwrap_or_else(|| Secret::from(request.refresh_token));

        let update = OAuthStatusUpdate {
            status: credential_cache::CredentialStatus::Active,
            access_token: Some(token.access_token.clone()),
            refresh_token: Some(refresh_token.clone()),
            token_expires_at: expires_at,
        };
        if let Err(e) = self.store.update_oauth_status(&instance_id, update).await {
            warn!(%instance_id, error = %e, "failed to persist refreshed tokens");
        }

        self.cache
            .set(
                instance_id,
                CredentialData {
                    bearer_token: token.access_token,
                    refresh_token: Some(refresh_token),
                    expires_at,
                    instance_expires_at: request.instance_expires_at,
                    user_id: request.user_id.to_string(),
                },
            )
            .await;
    }

    async fn require_reauth(&self, instance_id: &Uuid) {
        if let Err(e) = self
            .store
            .update_oauth_status(instance_id, OAuthStatusUpdate::reauth_required())
            .await
        {
            warn!(%instance_id, error = %e, "failed to clear revoked tokens");
        }
        self.cache.remove(instance_id).await;
        info!(%instance_id, "instance requires re-authentication");
    }
}
