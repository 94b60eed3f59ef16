//! Directory-backed file adapter.

use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::debug;

use cloudshelf_common::{Error, FileRef, Result};

use crate::ports::{CandidateQuery, FileAdapter};
use crate::sqlite::SqliteStore;

/// File adapter storing bytes under `<root>/<entity_type>/<file_id>`.
///
/// Records live in the [`SqliteStore`]; this adapter only owns the bytes.
pub struct FilestoreAdapter {
    entity_type: String,
    root: PathBuf,
    store: Arc<SqliteStore>,
}

impl FilestoreAdapter {
    /// Create an adapter for one entity type.
    ///
    /// # Postconditions
    /// - The entity directory exists under `root`
    ///
    /// # Errors
    /// - Permission denied or invalid path
    pub fn new(
        entity_type: impl Into<String>,
        root: impl AsRef<Path>,
        store: Arc<SqliteStore>,
    ) -> Result<Self> {
        let entity_type = entity_type.into();
        let root = root.as_ref().join(&entity_type);

        if !root.exists() {
            std::fs::create_dir_all(&root)?;
        }

        Ok(Self {
            entity_type,
            root,
            store,
        })
    }

    fn path_for(&self, file: &FileRef) -> PathBuf {
        self.root.join(file.id.to_string())
    }

    /// Store bytes for a new attachment and register it as `local`.
    pub async fn import(
        &self,
        entity_id: i64,
        name: &str,
        data: &[u8],
        mime_type: Option<&str>,
    ) -> Result<FileRef> {
        let file = self.store.create_file(
            &self.entity_type,
            entity_id,
            name,
            data.len() as u64,
            mime_type,
        )?;
        fs::write(self.path_for(&file), data).await?;

        debug!(file_id = %file.id, "Imported {} ({} bytes)", name, data.len());
        Ok(file)
    }
}

#[async_trait]
impl FileAdapter for FilestoreAdapter {
    fn entity_type(&self) -> &str {
        &self.entity_type
    }

    async fn list_candidates(&self, query: &CandidateQuery) -> Result<Vec<FileRef>> {
        if query.entity_type != self.entity_type {
            return Ok(Vec::new());
        }
        self.store.list_candidates(query)
    }

    async fn read_local_bytes(&self, file: &FileRef) -> Result<Bytes> {
        match fs::read(self.path_for(file)).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::NotFound(format!(
                "local bytes of file {}",
                file.id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn clear_local_bytes(&self, file: &FileRef) -> Result<u64> {
        let path = self.path_for(file);
        let size = match fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        fs::remove_file(&path).await?;
        debug!(file_id = %file.id, "Cleared {} local bytes", size);
        Ok(size)
    }
}
