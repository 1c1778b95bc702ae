//! Background sweep of stale cache entries
//!
//! Reads already refuse expired entries; the sweep reclaims the ones that
//! are never read again. It makes no network calls.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

use crate::cache::CredentialCache;

/// Spawn the sweep loop. It runs every `interval` until `shutdown` flips to
/// `true` (or its sender is dropped) or the handle is aborted.
pub fn spawn_watcher(
    cache: Arc<CredentialCache>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // First tick fires immediately; nothing can be stale yet.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    sweep_once(&cache).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("credential watcher stopping");
                        break;
                    }
                }
            }
        }
    })
}

/// Evict every expired or deactivated entry. Returns how many were removed.
pub async fn sweep_once(cache: &CredentialCache) -> usize {
    let ids = cache.entries_snapshot();
    let mut evicted = 0;
    for id in &ids {
        if cache.evict_if_stale(id).await {
            evicted += 1;
        }
    }

    if evicted > 0 {
        info!(evicted, remaining = cache.len(), "swept stale credentials");
    } else {
        debug!(checked = ids.len(), "credential sweep found nothing stale");
    }
    evicted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CredentialData;
    use common::ManualClock;
    use uuid::Uuid;

    const T0: u64 = 1_700_000_000_000;

    fn data(expires_at: Option<u64>) -> CredentialData {
        CredentialData {
            bearer_token: "tok".into(),
            refresh_token: None,
            expires_at,
            instance_expires_at: None,
            user_id: "user".into(),
        }
    }

    #[tokio::test]
    async fn sweep_removes_only_expired() {
        let clock = Arc::new(ManualClock::new(T0));
        let cache = CredentialCache::new(clock.clone());
        let expiring = Uuid::new_v4();
        let fresh = Uuid::new_v4();
        let api_key = Uuid::new_v4();
        cache.set(expiring, data(Some(T0 + 1_000))).await;
        cache.set(fresh, data(Some(T0 + 3_600_000))).await;
        cache.set(api_key, data(None)).await;

        assert_eq!(sweep_once(&cache).await, 0);

        clock.advance(Duration::from_secs(5));
        assert_eq!(sweep_once(&cache).await, 1);
        assert_eq!(cache.len(), 2);
        assert!(cache.is_cached(&fresh));
        assert!(cache.is_cached(&api_key));

        // Idempotent.
        assert_eq!(sweep_once(&cache).await, 0);
    }

    #[tokio::test]
    async fn sweep_removes_lapsed_instances() {
        let clock = Arc::new(ManualClock::new(T0));
        let cache = CredentialCache::new(clock.clone());
        let lapsing = Uuid::new_v4();
        cache
            .set(
                lapsing,
                CredentialData {
                    instance_expires_at: Some(T0 + 1_000),
                    ..data(None)
                },
            )
            .await;

        clock.advance(Duration::from_secs(5));
        assert_eq!(sweep_once(&cache).await, 1);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn watcher_sweeps_on_interval() {
        let clock = Arc::new(ManualClock::new(T0));
        let cache = Arc::new(CredentialCache::new(clock.clone()));
        let id = Uuid::new_v4();
        cache.set(id, data(Some(T0 + 1_000))).await;
        clock.advance(Duration::from_secs(2));

        let (_tx, rx) = watch::channel(false);
        let handle = spawn_watcher(cache.clone(), Duration::from_secs(60), rx);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(cache.is_empty());
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn watcher_stops_on_shutdown() {
        let cache = Arc::new(CredentialCache::new(Arc::new(ManualClock::new(T0))));
        let (tx, rx) = watch::channel(false);
        let handle = spawn_watcher(cache, Duration::from_secs(60), rx);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("watcher did not stop")
            .unwrap();
    }
}
