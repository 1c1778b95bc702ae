//! Persistent instance credentials
//!
//! `CredentialStore` is the contract the resolver and orchestrator need from
//! wherever instance credentials actually live. `FileCredentialStore` keeps
//! them in a JSON file keyed by instance id. All writes use atomic temp-file
//! + rename, and a tokio Mutex serializes them. Changes are made to a copy
//! of the map that replaces the in-memory state only once it is on disk, so
//! a failed write leaves both unchanged.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use common::Secret;
use credential_cache::CredentialStatus;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::StoreError;

type Result<T> = std::result::Result<T, StoreError>;

/// Stored credentials of one instance. Timestamps are unix milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceCredentials {
    pub status: CredentialStatus,
    /// When the instance itself lapses, independent of its token.
    #[serde(default)]
    pub expires_at: Option<u64>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<Secret<String>>,
    /// OAuth access token, or the API key for key-based services.
    #[serde(default)]
    pub access_token: Option<Secret<String>>,
    #[serde(default)]
    pub refresh_token: Option<Secret<String>>,
    #[serde(default)]
    pub token_expires_at: Option<u64>,
    pub user_id: String,
}

/// Replaces the OAuth fields of a stored instance.
#[derive(Debug, Clone)]
pub struct OAuthStatusUpdate {
    pub status: CredentialStatus,
    pub access_token: Option<Secret<String>>,
    pub refresh_token: Option<Secret<String>>,
    pub token_expires_at: Option<u64>,
}

impl OAuthStatusUpdate {
    /// Mark the instance expired and drop its tokens.
    pub fn reauth_required() -> Self {
        Self {
            status: CredentialStatus::Expired,
            access_token: None,
            refresh_token: None,
            token_expires_at: None,
        }
    }
}

/// Source of truth for instance credentials.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn CredentialStore>`).
pub trait CredentialStore: Send + Sync {
    fn get_instance_credentials<'a>(
        &'a self,
        instance_id: &'a Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<Option<InstanceCredentials>>> + Send + 'a>>;

    fn update_oauth_status<'a>(
        &'a self,
        instance_id: &'a Uuid,
        update: OAuthStatusUpdate,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

pub struct FileCredentialStore {
    path: PathBuf,
    state: Mutex<HashMap<Uuid, InstanceCredentials>>,
}

impl FileCredentialStore {
    /// Load the store from `path`, creating an empty file if it is missing.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if tokio::fs::try_exists(&path)
            .await
            .map_err(|e| StoreError::Io(format!("checking credential file: {e}")))?
        {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| StoreError::Io(format!("reading credential file: {e}")))?;
            let instances: HashMap<Uuid, InstanceCredentials> = serde_json::from_str(&contents)
                .map_err(|e| StoreError::Parse(format!("parsing credential file: {e}")))?;
            info!(
                path = %path.display(),
                instances = instances.len(),
                "loaded instance credentials"
            );
            instances
        } else {
            info!(path = %path.display(), "credential file not found, starting with empty store");
            let state = HashMap::new();
            write_atomic(&path, &state).await?;
            state
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get(&self, instance_id: &Uuid) -> Option<InstanceCredentials> {
        self.state.lock().await.get(instance_id).cloned()
    }

    /// Add or replace an instance and persist.
    pub async fn insert(&self, instance_id: Uuid, credentials: InstanceCredentials) -> Result<()> {
        self.commit(|instances| {
            instances.insert(instance_id, credentials);
            Ok(())
        })
        .await?;
        debug!(%instance_id, "stored instance credentials");
        Ok(())
    }

    pub async fn remove(&self, instance_id: &Uuid) -> Result<Option<InstanceCredentials>> {
        let removed = self
            .commit(|instances| {
                instances
                    .remove(instance_id)
                    .ok_or(StoreError::NotFound(*instance_id))
            })
            .await;
        match removed {
            Ok(credentials) => {
                debug!(%instance_id, "removed instance credentials");
                Ok(Some(credentials))
            }
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn instance_ids(&self) -> Vec<Uuid> {
        self.state.lock().await.keys().copied().collect()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn apply_update(&self, instance_id: &Uuid, update: OAuthStatusUpdate) -> Result<()> {
        let status = update.status;
        self.commit(|instances| {
            let entry = instances
                .get_mut(instance_id)
                .ok_or(StoreError::NotFound(*instance_id))?;
            entry.status = update.status;
            entry.access_token = update.access_token;
            entry.refresh_token = update.refresh_token;
            entry.token_expires_at = update.token_expires_at;
            Ok(())
        })
        .await?;
        debug!(%instance_id, status = status.label(), "updated oauth status");
        Ok(())
    }

    /// Apply `change` to a copy of the map, persist the copy, then publish it.
    async fn commit<T>(
        &self,
        change: impl FnOnce(&mut HashMap<Uuid, InstanceCredentials>) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let out = change(&mut next)?;
        write_atomic(&self.path, &next).await?;
        *state = next;
        Ok(out)
    }
}

impl CredentialStore for FileCredentialStore {
    fn get_instance_credentials<'a>(
        &'a self,
        instance_id: &'a Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<Option<InstanceCredentials>>> + Send + 'a>> {
        Box::pin(async move { Ok(self.get(instance_id).await) })
    }

    fn update_oauth_status<'a>(
        &'a self,
        instance_id: &'a Uuid,
        update: OAuthStatusUpdate,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(self.apply_update(instance_id, update))
    }
}

/// Write the instance map atomically with 0600 permissions.
async fn write_atomic(path: &Path, data: &HashMap<Uuid, InstanceCredentials>) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| StoreError::Parse(format!("serializing credentials: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| StoreError::Io("credential path has no parent directory".into()))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("credentials");
    let tmp_path = dir.join(format!(".{file_name}.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| StoreError::Io(format!("writing temp credential file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(|e| StoreError::Io(format!("setting credential file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| StoreError::Io(format!("renaming temp credential file: {e}")))?;

    debug!(path = %path.display(), "persisted instance credentials");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oauth_instance(suffix: &str) -> InstanceCredentials {
        InstanceCredentials {
            status: CredentialStatus::Active,
            expires_at: None,
            client_id: Some("client".into()),
            client_secret: Some("secret".into()),
            access_token: Some(format!("at_{suffix}").into()),
            refresh_token: Some(format!("rt_{suffix}").into()),
            token_expires_at: Some(1_735_500_000_000),
            user_id: format!("user_{suffix}"),
        }
    }

    #[tokio::test]
    async fn load_creates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("instances.json");

        let store = FileCredentialStore::load(path.clone()).await.unwrap();
        assert!(store.is_empty().await);
        assert_eq!(std::fs::read_to_string(&path).unwrap().trim(), "{}");
    }

    #[tokio::test]
    async fn insert_persists_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("instances.json");
        let id = Uuid::new_v4();

        let store = FileCredentialStore::load(path.clone()).await.unwrap();
        store.insert(id, oauth_instance("a")).await.unwrap();

        let reloaded = FileCredentialStore::load(path).await.unwrap();
        let creds = reloaded.get(&id).await.unwrap();
        assert_eq!(creds.access_token.unwrap().expose(), "at_a");
        assert_eq!(creds.user_id, "user_a");
        assert_eq!(creds.status, CredentialStatus::Active);
    }

    #[tokio::test]
    async fn update_replaces_oauth_fields() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::load(dir.path().join("instances.json"))
            .await
            .unwrap();
        let id = Uuid::new_v4();
        store.insert(id, oauth_instance("a")).await.unwrap();

        store
            .update_oauth_status(&id, OAuthStatusUpdate::reauth_required())
            .await
            .unwrap();

        let creds = store.get_instance_credentials(&id).await.unwrap().unwrap();
        assert_eq!(creds.status, CredentialStatus::Expired);
        assert!(creds.refresh_token.is_none());
        assert!(creds.access_token.is_none());
        assert_eq!(creds.client_id.as_deref(), Some("client"));
    }

    #[tokio::test]
    async fn failed_write_leaves_memory_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::load(dir.path().join("instances.json"))
            .await
            .unwrap();
        let id = Uuid::new_v4();
        store.insert(id, oauth_instance("a")).await.unwrap();
        // Writes now fail: the directory is gone.
        drop(dir);

        let err = store
            .update_oauth_status(&id, OAuthStatusUpdate::reauth_required())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));
        let creds = store.get(&id).await.unwrap();
        assert_eq!(creds.status, CredentialStatus::Active);
        assert_eq!(creds.access_token.as_ref().unwrap().expose(), "at_a");

        let other = Uuid::new_v4();
        assert!(store.insert(other, oauth_instance("b")).await.is_err());
        assert!(store.get(&other).await.is_none());

        assert!(store.remove(&id).await.is_err());
        assert!(store.get(&id).await.is_some());
    }

    #[tokio::test]
    async fn update_unknown_instance_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::load(dir.path().join("instances.json"))
            .await
            .unwrap();
        let err = store
            .update_oauth_status(&Uuid::new_v4(), OAuthStatusUpdate::reauth_required())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn api_key_instances_parse_without_oauth_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("instances.json");
        let id = Uuid::new_v4();
        std::fs::write(
            &path,
            format!(
                r#"{{"{id}": {{"status": "active", "access_token": "key_123", "user_id": "u1"}}}}"#
            ),
        )
        .unwrap();

        let store = FileCredentialStore::load(path).await.unwrap();
        let creds = store.get(&id).await.unwrap();
        assert!(creds.refresh_token.is_none());
        assert!(creds.token_expires_at.is_none());
        assert_eq!(creds.access_token.unwrap().expose(), "key_123");
    }

    #[tokio::test]
    async fn remove_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("instances.json");
        let id = Uuid::new_v4();
        let store = FileCredentialStore::load(path.clone()).await.unwrap();
        store.insert(id, oauth_instance("a")).await.unwrap();

        assert!(store.remove(&id).await.unwrap().is_some());
        assert!(store.remove(&id).await.unwrap().is_none());
        assert!(FileCredentialStore::load(path).await.unwrap().is_empty().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("instances.json");
        let store = FileCredentialStore::load(path.clone()).await.unwrap();
        store.insert(Uuid::new_v4(), oauth_instance("a")).await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
