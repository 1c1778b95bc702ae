//! Credential lookup for proxied requests
//!
//! cache → store → refresh. Concurrent resolutions of one instance are
//! single-flighted: the first caller holds the instance's lock while it loads
//! or refreshes, and the others find the fresh entry in the cache once they
//! get the lock.
//!
//! Cache entries carry the instance's own `expires_at`, so a lapsed instance
//! drops out of the cache at the same moment the store starts reporting it
//! expired. The expiry skew applied to a cached token is at most half the
//! lifetime it was cached with; a provider issuing tokens shorter than the
//! skew would otherwise be asked for a new one on every request.

use std::sync::Arc;
use std::time::Duration;

use common::{Clock, Secret};
use credential_cache::{
    CachedCredential, CredentialCache, CredentialData, CredentialStatus, KeyedLock,
    MetadataUpdate,
};
use oauth_provider::{ClientCredentials, RefreshErrorKind};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::ResolveError;
use crate::orchestrator::{RefreshRequest, RefreshResult, TokenRefreshOrchestrator};
use crate::store::{CredentialStore, InstanceCredentials};

/// Where a resolved credential came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialSource {
    Cache,
    Store,
    Refresh,
}

#[derive(Debug, Clone)]
pub struct ResolvedCredential {
    pub instance_id: Uuid,
    pub bearer_token: Secret<String>,
    pub user_id: String,
    pub expires_at: Option<u64>,
    pub source: CredentialSource,
}

impl ResolvedCredential {
    fn from_cached(entry: CachedCredential, source: CredentialSource) -> Self {
        Self {
            instance_id: entry.instance_id,
            bearer_token: entry.bearer_token,
            user_id: entry.user_id,
            expires_at: entry.expires_at,
            source,
        }
    }
}

pub struct CredentialResolver {
    cache: Arc<CredentialCache>,
    store: Arc<dyn CredentialStore>,
    orchestrator: Arc<TokenRefreshOrchestrator>,
    locks: KeyedLock<Uuid>,
    clock: Arc<dyn Clock>,
    expiry_skew: Duration,
}

impl CredentialResolver {
    pub fn new(
        cache: Arc<CredentialCache>,
        store: Arc<dyn CredentialStore>,
        orchestrator: Arc<TokenRefreshOrchestrator>,
        clock: Arc<dyn Clock>,
        expiry_skew: Duration,
    ) -> Self {
        Self {
            cache,
            store,
            orchestrator,
            locks: KeyedLock::new(),
            clock,
            expiry_skew,
        }
    }

    /// Bearer token (or API key) to call the third party with.
    pub async fn resolve(&self, instance_id: Uuid) -> Result<ResolvedCredential, ResolveError> {
        if let Some(hit) = self.fresh_from_cache(&instance_id) {
            return Ok(hit);
        }

        let _guard = self.locks.lock(&instance_id).await;
        // Another caller may have loaded or refreshed it while we waited.
        if let Some(hit) = self.fresh_from_cache(&instance_id) {
            return Ok(hit);
        }

        let stored = self.load_active(&instance_id).await?;

        if let Some(token) = &stored.access_token {
            if !self.is_expiring(stored.token_expires_at, self.skew_millis()) {
                self.cache
                    .set(
                        instance_id,
                        CredentialData {
                            bearer_token: token.clone(),
                            refresh_token: stored.refresh_token.clone(),
                            expires_at: stored.token_expires_at,
                            instance_expires_at: stored.expires_at,
                            user_id: stored.user_id.clone(),
                        },
                    )
                    .await;
                debug!(%instance_id, "credential loaded from store");
                return Ok(ResolvedCredential {
                    instance_id,
                    bearer_token: token.clone(),
                    user_id: stored.user_id,
                    expires_at: stored.token_expires_at,
                    source: CredentialSource::Store,
                });
            }
        }

        debug!(%instance_id, "stored token expired, refreshing");
        let result = self.refresh_stored(&instance_id, &stored).await?;
        if !result.success {
            return Err(failure_to_error(instance_id, &result));
        }

        self.cache
            .get(&instance_id)
            .map(|entry| ResolvedCredential::from_cached(entry, CredentialSource::Refresh))
            .ok_or_else(|| ResolveError::Unavailable {
                instance_id,
                message: "refreshed token expired before use".into(),
            })
    }

    /// Refresh now, whatever the current token's expiry.
    pub async fn force_refresh(&self, instance_id: Uuid) -> Result<RefreshResult, ResolveError> {
        let _guard = self.locks.lock(&instance_id).await;
        let stored = self.load_active(&instance_id).await?;
        info!(%instance_id, "forced token refresh");
        self.refresh_stored(&instance_id, &stored).await
    }

    fn fresh_from_cache(&self, instance_id: &Uuid) -> Option<ResolvedCredential> {
        self.cache
            .get(instance_id)
            .filter(|entry| !self.is_expiring(entry.expires_at, self.cached_skew_millis(entry)))
            .map(|entry| ResolvedCredential::from_cached(entry, CredentialSource::Cache))
    }

    fn skew_millis(&self) -> u64 {
        self.expiry_skew.as_millis() as u64
    }

    /// Skew for a cached token: never more than half its cached lifetime.
    fn cached_skew_millis(&self, entry: &CachedCredential) -> u64 {
        match entry.expires_at {
            Some(at) => self.skew_millis().min(at.saturating_sub(entry.cached_at) / 2),
            None => self.skew_millis(),
        }
    }

    fn is_expiring(&self, expires_at: Option<u64>, skew_millis: u64) -> bool {
        let horizon = self.clock.now_millis().saturating_add(skew_millis);
        expires_at.is_some_and(|at| at <= horizon)
    }

    async fn load_active(&self, instance_id: &Uuid) -> Result<InstanceCredentials, ResolveError> {
        let stored = self
            .store
            .get_instance_credentials(instance_id)
            .await?
            .ok_or(ResolveError::NotFound(*instance_id))?;

        let now = self.clock.now_millis();
        let status = match stored.expires_at {
            Some(at) if at <= now => CredentialStatus::Expired,
            _ => stored.status,
        };
        if status != CredentialStatus::Active {
            let update = MetadataUpdate {
                status: Some(status),
                ..Default::default()
            };
            // Absent entries are fine: nothing to evict.
            let _ = self.cache.update_metadata(instance_id, update).await;
            return Err(ResolveError::Inactive {
                instance_id: *instance_id,
                status,
            });
        }
        Ok(stored)
    }

    async fn refresh_stored(
        &self,
        instance_id: &Uuid,
        stored: &InstanceCredentials,
    ) -> Result<RefreshResult, ResolveError> {
        let (Some(refresh_token), Some(client_id), Some(client_secret)) = (
            &stored.refresh_token,
            &stored.client_id,
            &stored.client_secret,
        ) else {
            return Err(ResolveError::ReauthRequired {
                instance_id: *instance_id,
                reason: "no refresh token or client credentials on file".into(),
            });
        };

        let client = ClientCredentials {
            client_id: client_id.clone(),
            client_secret: client_secret.clone(),
        };
        Ok(self
            .orchestrator
            .perform_refresh(RefreshRequest {
                instance_id: *instance_id,
                user_id: &stored.user_id,
                instance_expires_at: stored.expires_at,
                refresh_token: refresh_token.expose(),
                client: &client,
            })
            .await)
    }
}

fn failure_to_error(instance_id: Uuid, result: &RefreshResult) -> ResolveError {
    let Some(failure) = &result.error else {
        return ResolveError::RefreshFailed {
            instance_id,
            error_type: RefreshErrorKind::UnknownError,
        };
    };
    match failure.error_type {
        kind if kind.requires_reauth() => ResolveError::ReauthRequired {
            instance_id,
            reason: kind.to_string(),
        },
        RefreshErrorKind::NetworkError | RefreshErrorKind::ServiceUnavailable => {
            ResolveError::Unavailable {
                instance_id,
                message: failure.message.clone(),
            }
        }
        error_type => ResolveError::RefreshFailed {
            instance_id,
            error_type,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::tests::{
        Harness, ScriptedEndpoint, T0, invalid_grant, stored_instance, token, unavailable,
    };
    use crate::store::FileCredentialStore;

    const SKEW: Duration = Duration::from_secs(60);

    fn resolver(h: &Harness, primary: Arc<ScriptedEndpoint>) -> Arc<CredentialResolver> {
        Arc::new(CredentialResolver::new(
            h.cache.clone(),
            h.store.clone(),
            Arc::new(h.orchestrator(primary, None)),
            h.clock.clone(),
            SKEW,
        ))
    }

    #[tokio::test]
    async fn valid_stored_token_is_cached() {
        let h = Harness::new(Some(T0 + 3_600_000)).await;
        let primary = ScriptedEndpoint::new("primary", vec![]);
        let r = resolver(&h, primary.clone());

        let first = r.resolve(h.instance_id).await.unwrap();
        assert_eq!(first.source, CredentialSource::Store);
        assert_eq!(first.bearer_token.expose(), "at_old");

        let second = r.resolve(h.instance_id).await.unwrap();
        assert_eq!(second.source, CredentialSource::Cache);
        assert_eq!(second.user_id, "user-1");
        assert_eq!(primary.calls(), 0);
    }

    #[tokio::test]
    async fn expired_token_is_refreshed() {
        let h = Harness::new(Some(T0 - 1)).await;
        let primary = ScriptedEndpoint::new(
            "primary",
            vec![Ok(token("at_new", Some("rt_new"), Some(3600)))],
        );
        let r = resolver(&h, primary.clone());

        let resolved = r.resolve(h.instance_id).await.unwrap();
        assert_eq!(resolved.source, CredentialSource::Refresh);
        assert_eq!(resolved.bearer_token.expose(), "at_new");
        assert_eq!(resolved.expires_at, Some(T0 + 3_600_000));
        assert_eq!(primary.calls(), 1);
    }

    #[tokio::test]
    async fn token_inside_skew_window_is_refreshed() {
        let h = Harness::new(Some(T0 + 30_000)).await;
        let primary = ScriptedEndpoint::new("primary", vec![Ok(token("at_new", None, Some(3600)))]);
        let r = resolver(&h, primary.clone());

        let resolved = r.resolve(h.instance_id).await.unwrap();
        assert_eq!(resolved.source, CredentialSource::Refresh);
        assert_eq!(primary.calls(), 1);
    }

    #[tokio::test]
    async fn concurrent_resolves_refresh_once() {
        let h = Harness::new(Some(T0 - 1)).await;
        let primary = ScriptedEndpoint::with_delay(
            "primary",
            vec![Ok(token("at_new", None, Some(3600)))],
            Duration::from_millis(50),
        );
        let r = resolver(&h, primary.clone());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let r = r.clone();
                let id = h.instance_id;
                tokio::spawn(async move { r.resolve(id).await })
            })
            .collect();
        for handle in handles {
            let resolved = handle.await.unwrap().unwrap();
            assert_eq!(resolved.bearer_token.expose(), "at_new");
        }
        assert_eq!(primary.calls(), 1);
    }

    #[tokio::test]
    async fn unknown_instance_is_not_found() {
        let h = Harness::new(None).await;
        let r = resolver(&h, ScriptedEndpoint::new("primary", vec![]));
        let err = r.resolve(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.http_status(), 404);
    }

    #[tokio::test]
    async fn inactive_instance_is_forbidden() {
        let h = Harness::new(None).await;
        let id = Uuid::new_v4();
        let mut inactive = stored_instance(None);
        inactive.status = CredentialStatus::Inactive;
        h.store.insert(id, inactive).await.unwrap();

        let r = resolver(&h, ScriptedEndpoint::new("primary", vec![]));
        let err = r.resolve(id).await.unwrap_err();
        assert_eq!(err.http_status(), 403);
    }

    #[tokio::test]
    async fn lapsed_instance_is_expired() {
        let h = Harness::new(None).await;
        let id = Uuid::new_v4();
        let mut lapsed = stored_instance(None);
        lapsed.expires_at = Some(T0 - 1);
        h.store.insert(id, lapsed).await.unwrap();

        let r = resolver(&h, ScriptedEndpoint::new("primary", vec![]));
        let err = r.resolve(id).await.unwrap_err();
        assert!(matches!(
            err,
            ResolveError::Inactive {
                status: CredentialStatus::Expired,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn cached_credential_stops_when_instance_lapses() {
        let h = Harness::new(None).await;
        let id = Uuid::new_v4();
        let mut lapsing = stored_instance(Some(T0 + 24 * 3_600_000));
        lapsing.expires_at = Some(T0 + 10_000);
        h.store.insert(id, lapsing).await.unwrap();
        let r = resolver(&h, ScriptedEndpoint::new("primary", vec![]));

        let first = r.resolve(id).await.unwrap();
        assert_eq!(first.source, CredentialSource::Store);
        assert_eq!(r.resolve(id).await.unwrap().source, CredentialSource::Cache);

        h.clock.advance(Duration::from_secs(3600));
        let err = r.resolve(id).await.unwrap_err();
        assert!(matches!(
            err,
            ResolveError::Inactive {
                status: CredentialStatus::Expired,
                ..
            }
        ));
        assert!(h.cache.is_empty());
    }

    #[tokio::test]
    async fn refreshed_instance_keeps_its_lapse_time() {
        let h = Harness::new(None).await;
        let id = Uuid::new_v4();
        let mut lapsing = stored_instance(Some(T0 - 1));
        lapsing.expires_at = Some(T0 + 10_000);
        h.store.insert(id, lapsing).await.unwrap();
        let primary = ScriptedEndpoint::new("primary", vec![Ok(token("at_new", None, Some(3600)))]);
        let r = resolver(&h, primary);

        assert_eq!(r.resolve(id).await.unwrap().source, CredentialSource::Refresh);
        assert_eq!(
            h.cache.get(&id).unwrap().instance_expires_at,
            Some(T0 + 10_000)
        );

        h.clock.advance(Duration::from_secs(11));
        assert_eq!(r.resolve(id).await.unwrap_err().http_status(), 403);
    }

    #[tokio::test]
    async fn deactivated_instance_is_evicted_from_cache() {
        let h = Harness::new(Some(T0 + 3_600_000)).await;
        let r = resolver(&h, ScriptedEndpoint::new("primary", vec![]));
        r.resolve(h.instance_id).await.unwrap();
        assert!(h.cache.is_cached(&h.instance_id));

        let mut inactive = stored_instance(Some(T0 + 3_600_000));
        inactive.status = CredentialStatus::Inactive;
        h.store.insert(h.instance_id, inactive).await.unwrap();

        // The cached entry is served until the store is read again.
        let cached = r.resolve(h.instance_id).await.unwrap();
        assert_eq!(cached.source, CredentialSource::Cache);

        r.force_refresh(h.instance_id).await.unwrap_err();
        assert!(!h.cache.is_cached(&h.instance_id));
        assert_eq!(r.resolve(h.instance_id).await.unwrap_err().http_status(), 403);
    }

    #[tokio::test]
    async fn short_lived_tokens_are_not_refreshed_on_every_resolve() {
        let h = Harness::new(Some(T0 - 1)).await;
        let primary = ScriptedEndpoint::new(
            "primary",
            vec![
                Ok(token("at_1", None, Some(30))),
                Ok(token("at_2", None, Some(30))),
                Ok(token("at_3", None, Some(30))),
            ],
        );
        let r = resolver(&h, primary.clone());

        assert_eq!(r.resolve(h.instance_id).await.unwrap().source, CredentialSource::Refresh);
        for _ in 0..2 {
            let resolved = r.resolve(h.instance_id).await.unwrap();
            assert_eq!(resolved.source, CredentialSource::Cache);
            assert_eq!(resolved.bearer_token.expose(), "at_1");
        }
        assert_eq!(primary.calls(), 1);

        // Past half its lifetime the token is renewed.
        h.clock.advance(Duration::from_secs(16));
        let renewed = r.resolve(h.instance_id).await.unwrap();
        assert_eq!(renewed.bearer_token.expose(), "at_2");
        assert_eq!(primary.calls(), 2);
    }

    #[tokio::test]
    async fn revoked_refresh_token_requires_reauth() {
        let h = Harness::new(Some(T0 - 1)).await;
        let r = resolver(&h, ScriptedEndpoint::new("primary", vec![Err(invalid_grant())]));

        let err = r.resolve(h.instance_id).await.unwrap_err();
        assert_eq!(err.http_status(), 401);

        // Stored instance is now expired.
        let err = r.resolve(h.instance_id).await.unwrap_err();
        assert_eq!(err.http_status(), 403);
    }

    #[tokio::test]
    async fn unavailable_provider_is_503() {
        let h = Harness::new(Some(T0 - 1)).await;
        let r = resolver(&h, ScriptedEndpoint::new("primary", vec![Err(unavailable())]));
        let err = r.resolve(h.instance_id).await.unwrap_err();
        assert_eq!(err.http_status(), 503);
    }

    #[tokio::test]
    async fn api_key_without_refresh_token_needs_reauth_once_expired() {
        let h = Harness::new(None).await;
        let id = Uuid::new_v4();
        let mut key = stored_instance(Some(T0 - 1));
        key.refresh_token = None;
        h.store.insert(id, key).await.unwrap();

        let r = resolver(&h, ScriptedEndpoint::new("primary", vec![]));
        let err = r.resolve(id).await.unwrap_err();
        assert!(matches!(err, ResolveError::ReauthRequired { .. }));
    }

    #[tokio::test]
    async fn force_refresh_ignores_expiry() {
        let h = Harness::new(Some(T0 + 3_600_000)).await;
        let primary =
            ScriptedEndpoint::new("primary", vec![Ok(token("at_forced", None, Some(60)))]);
        let r = resolver(&h, primary.clone());

        let result = r.force_refresh(h.instance_id).await.unwrap();
        assert!(result.success);
        assert_eq!(primary.calls(), 1);
        assert_eq!(
            h.cache.get(&h.instance_id).unwrap().bearer_token.expose(),
            "at_forced"
        );
    }

    #[tokio::test]
    async fn refresh_succeeds_when_store_cannot_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("instances.json");
        let store = FileCredentialStore::load(path).await.unwrap();
        let id = Uuid::new_v4();
        store.insert(id, stored_instance(Some(T0 - 1))).await.unwrap();
        // Writes now fail: the directory is gone.
        drop(dir);

        let h = Harness::new(None).await;
        let store = Arc::new(store);
        let orchestrator = Arc::new(TokenRefreshOrchestrator::new(
            ScriptedEndpoint::new("primary", vec![Ok(token("at_new", None, Some(3600)))]),
            None,
            store.clone(),
            h.cache.clone(),
            h.sink.clone(),
            h.clock.clone(),
        ));
        let r =
            CredentialResolver::new(h.cache.clone(), store, orchestrator, h.clock.clone(), SKEW);

        let resolved = r.resolve(id).await.unwrap();
        assert_eq!(resolved.bearer_token.expose(), "at_new");
    }
}
