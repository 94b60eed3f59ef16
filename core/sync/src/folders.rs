//! Destination folder resolution.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use cloudshelf_common::{AccessToken, BackoffExecutor, Result};
use cloudshelf_remote::RemoteStore;

/// Looks up or creates the remote folder of each model config and caches
/// the resulting ids.
///
/// With a root folder configured, folders are resolved as direct children
/// of that root. Without one the whole account is searched by exact name
/// and the first hit wins, so two folders sharing a name cannot be told
/// apart.
pub struct FolderResolver {
    root: Option<String>,
    /// Held across lookup and create so concurrent batches do not create
    /// the same folder twice.
    cache: Mutex<HashMap<String, String>>,
}

impl FolderResolver {
    pub fn new(root: Option<String>) -> Self {
        Self {
            root,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Folder id for `folder_name`. `None` means the account root.
    pub async fn resolve(
        &self,
        remote: &Arc<dyn RemoteStore>,
        token: &AccessToken,
        backoff: &BackoffExecutor,
        folder_name: &str,
    ) -> Result<Option<String>> {
        let folder_name = folder_name.trim();
        if folder_name.is_empty() {
            return Ok(self.root.clone());
        }

        let mut cache = self.cache.lock().await;
        if let Some(id) = cache.get(folder_name) {
            return Ok(Some(id.clone()));
        }

        let parent = self.root.as_deref();
        let existing = backoff
            .execute("find folder", || {
                let remote = remote.clone();
                async move { remote.find_folder(token, folder_name, parent).await }
            })
            .await?;

        let id = match existing {
            Some(folder) => {
                debug!("Found remote folder '{}' ({})", folder_name, folder.id);
                folder.id
            }
            None => {
                let folder = backoff
                    .execute("create folder", || {
                        let remote = remote.clone();
                        async move { remote.create_folder(token, folder_name, parent).await }
                    })
                    .await?;
                info!("Created remote folder '{}' ({})", folder_name, folder.id);
                folder.id
            }
        };

        cache.insert(folder_name.to_string(), id.clone());
        Ok(Some(id))
    }

    /// Drop a cached id, e.g. after the folder was deleted remotely.
    pub async fn forget(&self, folder_name: &str) {
        self.cache.lock().await.remove(folder_name.trim());
    }
}
