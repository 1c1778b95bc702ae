//! Credential cache keyed by instance id
//!
//! Entries live in a `DashMap`. Every write (`set`, `update_metadata`,
//! `record_refresh_attempt`, removal) first takes the instance's `KeyedLock`
//! so writes for one instance are totally ordered, and then mutates the map
//! without awaiting. Reads skip the keyed lock: an entry is replaced as a
//! whole, so a reader sees either the old value or the new one.
//!
//! Expired entries are never returned. `get` removes them on the spot; the
//! watcher sweeps the ones nobody asks for.

use std::sync::Arc;
use std::time::Duration;

use common::{Clock, Secret};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::keyed_lock::KeyedLock;

const RECENT_USE_WINDOW: Duration = Duration::from_secs(3600);

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("no cached credential for instance {0}")]
    NotFound(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialStatus {
    Active,
    Inactive,
    Expired,
}

impl CredentialStatus {
    pub fn label(self) -> &'static str {
        match self {
            CredentialStatus::Active => "active",
            CredentialStatus::Inactive => "inactive",
            CredentialStatus::Expired => "expired",
        }
    }
}

/// One cached credential. Timestamps are unix milliseconds.
#[derive(Debug, Clone)]
pub struct CachedCredential {
    pub instance_id: Uuid,
    pub bearer_token: Secret<String>,
    pub refresh_token: Option<Secret<String>>,
    /// `None` for credential types that never expire (API keys).
    pub expires_at: Option<u64>,
    /// When the instance itself lapses, whatever its token says.
    pub instance_expires_at: Option<u64>,
    pub user_id: String,
    pub last_used_at: u64,
    pub cached_at: u64,
    pub last_modified_at: u64,
    pub refresh_attempts: u32,
    pub status: CredentialStatus,
}

impl CachedCredential {
    pub fn is_expired(&self, now_millis: u64) -> bool {
        self.expires_at.is_some_and(|at| at <= now_millis)
    }

    pub fn is_lapsed(&self, now_millis: u64) -> bool {
        self.instance_expires_at.is_some_and(|at| at <= now_millis)
    }

    /// Token expired, instance lapsed, or no longer active.
    pub fn is_stale(&self, now_millis: u64) -> bool {
        self.is_expired(now_millis)
            || self.is_lapsed(now_millis)
            || self.status != CredentialStatus::Active
    }

    fn approximate_size(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.bearer_token.expose().len()
            + self.refresh_token.as_ref().map_or(0, |t| t.expose().len())
            + self.user_id.len()
    }
}

/// Input to `CredentialCache::set`.
#[derive(Debug, Clone)]
pub struct CredentialData {
    pub bearer_token: Secret<String>,
    pub refresh_token: Option<Secret<String>>,
    pub expires_at: Option<u64>,
    pub instance_expires_at: Option<u64>,
    pub user_id: String,
}

/// Partial update; only `Some` fields are applied.
#[derive(Debug, Clone, Default)]
pub struct MetadataUpdate {
    pub status: Option<CredentialStatus>,
    pub expires_at: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStatistics {
    pub total_entries: usize,
    pub expired_entries: usize,
    pub recently_used: usize,
    pub approximate_memory_bytes: usize,
}

#[derive(Debug)]
pub struct CredentialCache {
    entries: DashMap<Uuid, CachedCredential>,
    locks: KeyedLock<Uuid>,
    clock: Arc<dyn Clock>,
}

impl CredentialCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            locks: KeyedLock::new(),
            clock,
        }
    }

    /// Cached credential for `instance_id`, if present and still valid.
    pub fn get(&self, instance_id: &Uuid) -> Option<CachedCredential> {
        let now = self.clock.now_millis();

        if let Some(mut entry) = self.entries.get_mut(instance_id) {
            if !entry.is_stale(now) {
                entry.last_used_at = now;
                metrics::counter!("credential_cache_hits_total").increment(1);
                return Some(entry.clone());
            }
        }

        if self
            .entries
            .remove_if(instance_id, |_, entry| entry.is_stale(now))
            .is_some()
        {
            debug!(%instance_id, "evicted stale credential on read");
            metrics::counter!("credential_cache_evictions_total", "reason" => "read").increment(1);
        }
        metrics::counter!("credential_cache_misses_total").increment(1);
        None
    }

    /// Replace or create the entry for `instance_id`.
    pub async fn set(&self, instance_id: Uuid, data: CredentialData) {
        let _guard = self.locks.lock(&instance_id).await;
        let now = self.clock.now_millis();

        let last_modified_at = self
            .entries
            .get(&instance_id)
            .map_or(now, |prev| prev.last_modified_at.max(now));

        self.entries.insert(
            instance_id,
            CachedCredential {
                instance_id,
                bearer_token: data.bearer_token,
                refresh_token: data.refresh_token,
                expires_at: data.expires_at,
                instance_expires_at: data.instance_expires_at,
                user_id: data.user_id,
                last_used_at: now,
                cached_at: now,
                last_modified_at,
                refresh_attempts: 0,
                status: CredentialStatus::Active,
            },
        );
        debug!(%instance_id, "credential cached");
    }

    /// Merge `update` into an existing entry. Moving the entry to inactive or
    /// expired removes it.
    pub async fn update_metadata(
        &self,
        instance_id: &Uuid,
        update: MetadataUpdate,
    ) -> Result<(), CacheError> {
        let _guard = self.locks.lock(instance_id).await;
        let now = self.clock.now_millis();

        if let Some(status) = update.status.filter(|s| *s != CredentialStatus::Active) {
            return match self.entries.remove(instance_id) {
                Some(_) => {
                    info!(
                        %instance_id,
                        status = status.label(),
                        "credential deactivated, evicting"
                    );
                    metrics::counter!("credential_cache_evictions_total", "reason" => "status")
                        .increment(1);
                    Ok(())
                }
                None => Err(CacheError::NotFound(*instance_id)),
            };
        }

        let mut entry = self
            .entries
            .get_mut(instance_id)
            .ok_or(CacheError::NotFound(*instance_id))?;
        if let Some(status) = update.status {
            entry.status = status;
        }
        if let Some(expires_at) = update.expires_at {
            entry.expires_at = Some(expires_at);
        }
        entry.last_modified_at = entry.last_modified_at.max(now);
        Ok(())
    }

    /// Increment the refresh attempt counter; returns the new count.
    pub async fn record_refresh_attempt(&self, instance_id: &Uuid) -> Result<u32, CacheError> {
        let _guard = self.locks.lock(instance_id).await;
        let mut entry = self
            .entries
            .get_mut(instance_id)
            .ok_or(CacheError::NotFound(*instance_id))?;
        entry.refresh_attempts += 1;
        Ok(entry.refresh_attempts)
    }

    /// Drop the entry for `instance_id`. Returns whether one existed.
    pub async fn remove(&self, instance_id: &Uuid) -> bool {
        let _guard = self.locks.lock(instance_id).await;
        let removed = self.entries.remove(instance_id).is_some();
        if removed {
            debug!(%instance_id, "credential removed from cache");
        }
        removed
    }

    /// Remove the entry only if it is still stale once the lock is held.
    pub(crate) async fn evict_if_stale(&self, instance_id: &Uuid) -> bool {
        let _guard = self.locks.lock(instance_id).await;
        let now = self.clock.now_millis();
        let evicted = self
            .entries
            .remove_if(instance_id, |_, entry| entry.is_stale(now))
            .is_some();
        if evicted {
            metrics::counter!("credential_cache_evictions_total", "reason" => "sweep").increment(1);
        }
        evicted
    }

    pub fn is_cached(&self, instance_id: &Uuid) -> bool {
        let now = self.clock.now_millis();
        self.entries
            .get(instance_id)
            .is_some_and(|entry| !entry.is_stale(now))
    }

    /// Ids of every entry, stale ones included.
    pub fn entries_snapshot(&self) -> Vec<Uuid> {
        self.entries.iter().map(|e| *e.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn statistics(&self) -> CacheStatistics {
        let now = self.clock.now_millis();
        let recent_cutoff = now.saturating_sub(RECENT_USE_WINDOW.as_millis() as u64);

        let mut stats = CacheStatistics {
            total_entries: 0,
            expired_entries: 0,
            recently_used: 0,
            approximate_memory_bytes: 0,
        };
        for entry in self.entries.iter() {
            stats.total_entries += 1;
            if entry.is_expired(now) || entry.is_lapsed(now) {
                stats.expired_entries += 1;
            }
            if entry.last_used_at >= recent_cutoff {
                stats.recently_used += 1;
            }
            stats.approximate_memory_bytes += entry.approximate_size();
        }
        stats
    }
}
