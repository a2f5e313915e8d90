//! Credential storage seam.
//!
//! The vault itself is a separate subsystem; the run manager only needs to
//! fetch and update credentials through this trait.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A stored credential for one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub provider: String,
    pub token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub meta: HashMap<String, String>,
}

#[derive(Debug, Error)]
pub enum CredError {
    #[error("{0} is not configured")]
    NotConfigured(String),

    #[error("encryption key changed")]
    EncryptionKeyChanged,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt credential store: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Marker error surfaced when the upstream provider has revoked a token.
/// Refresh errors that wrap this are permanent; the refresh loop stops
/// retrying the affected target.
#[derive(Debug, Error)]
#[error("token revoked")]
pub struct TokenRevoked;

/// Whether an error chain contains [`TokenRevoked`].
pub fn is_revoked(err: &anyhow::Error) -> bool {
    err.chain().any(|c| c.downcast_ref::<TokenRevoked>().is_some())
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, provider: &str) -> Result<Credential, CredError>;

    async fn put(&self, cred: &Credential) -> Result<(), CredError>;
}

/// JSON-file credential store at `<dir>/credentials.json`.
pub struct FileCredentialStore {
    path: PathBuf,
    creds: Mutex<HashMap<String, Credential>>,
}

impl FileCredentialStore {
    pub fn load(dir: impl Into<PathBuf>) -> Result<Self, CredError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("credentials.json");

        let creds = if path.exists() {
            serde_json::from_slice(&std::fs::read(&path)?)?
        } else {
            HashMap::new()
        };

        Ok(Self {
            path,
            creds: Mutex::new(creds),
        })
    }

    fn flush(&self, creds: &HashMap<String, Credential>) -> Result<(), CredError> {
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(creds)?)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn get(&self, provider: &str) -> Result<Credential, CredError> {
        self.creds
            .lock()
            .get(provider)
            .cloned()
            .ok_or_else(|| CredError::NotConfigured(provider.to_string()))
    }

    async fn put(&self, cred: &Credential) -> Result<(), CredError> {
        let mut creds = self.creds.lock();
        creds.insert(cred.provider.clone(), cred.clone());
        self.flush(&creds)
    }
}

/// In-memory credential store for tests.
#[derive(Default)]
pub struct MemoryCredentialStore {
    creds: Mutex<HashMap<String, Credential>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(provider: &str, token: &str) -> Self {
        let store = Self::new();
        store.creds.lock().insert(
            provider.to_string(),
            Credential {
                provider: provider.to_string(),
                token: token.to_string(),
                refresh_token: None,
                expires_at: None,
                meta: HashMap::new(),
            },
        );
        store
    }

    pub fn insert(&self, cred: Credential) {
        self.creds.lock().insert(cred.provider.clone(), cred);
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get(&self, provider: &str) -> Result<Credential, CredError> {
        self.creds
            .lock()
            .get(provider)
            .cloned()
            .ok_or_else(|| CredError::NotConfigured(provider.to_string()))
    }

    async fn put(&self, cred: &Credential) -> Result<(), CredError> {
        self.creds.lock().insert(cred.provider.clone(), cred.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::load(dir.path()).unwrap();

        let cred = Credential {
            provider: "github".to_string(),
            token: "ghu_token".to_string(),
            refresh_token: Some("ghr_refresh".to_string()),
            expires_at: None,
            meta: HashMap::new(),
        };
        store.put(&cred).await.unwrap();

        let reloaded = FileCredentialStore::load(dir.path()).unwrap();
        let got = reloaded.get("github").await.unwrap();
        assert_eq!(got.token, "ghu_token");
        assert_eq!(got.refresh_token.as_deref(), Some("ghr_refresh"));
    }

    #[tokio::test]
    async fn test_missing_credential() {
        let store = MemoryCredentialStore::new();
        assert!(matches!(
            store.get("github").await,
            Err(CredError::NotConfigured(_))
        ));
    }

    #[test]
    fn test_is_revoked_walks_the_chain() {
        let inner = anyhow::Error::from(TokenRevoked);
        let wrapped = inner.context("refreshing github token");
        assert!(is_revoked(&wrapped));

        let plain = anyhow::anyhow!("network unreachable");
        assert!(!is_revoked(&plain));
    }
}
