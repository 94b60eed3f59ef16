//! Credential persistence as a JSON file next to the database.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use cloudshelf_common::{Credential, Error, Result};
use cloudshelf_remote::CredentialStore;

/// Stores one credential as pretty-printed JSON.
///
/// Writes go to a temporary sibling first and are renamed into place, so a
/// crash never leaves a truncated file behind.
pub struct JsonCredentialStore {
    path: PathBuf,
}

impl JsonCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the stored credential, if any.
    ///
    /// # Errors
    /// - `Serialization` if the file exists but does not parse
    pub async fn load(&self) -> Result<Option<Credential>> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let credential = serde_json::from_str(&text)
            .map_err(|e| Error::Serialization(format!("credential file: {}", e)))?;
        Ok(Some(credential))
    }
}

#[async_trait]
impl CredentialStore for JsonCredentialStore {
    async fn save(&self, credential: &Credential) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let text = serde_json::to_string_pretty(credential)
            .map_err(|e| Error::Serialization(e.to_string()))?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, text).await?;
        fs::rename(&tmp, &self.path).await?;

        debug!("Saved credential '{}' ({})", credential.name, credential.state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudshelf_common::CredentialState;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_load_missing_is_none() {
        let temp = TempDir::new().unwrap();
        let store = JsonCredentialStore::new(temp.path().join("credential.json"));

        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let temp = TempDir::new().unwrap();
        let store = JsonCredentialStore::new(temp.path().join("state").join("credential.json"));

        let mut credential = Credential::new("default", "client", "secret");
        credential.state = CredentialState::Authorized;
        credential.refresh_token = Some("refresh".to_string());
        store.save(&credential).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.name, "default");
        assert_eq!(loaded.state, CredentialState::Authorized);
        assert_eq!(loaded.refresh_token.as_deref(), Some("refresh"));
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("credential.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = JsonCredentialStore::new(path).load().await.unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
