//! Where the proxy gets bytes from on a cache miss.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;

use cloudshelf_common::{BackoffExecutor, Error, FileRef, Result};
use cloudshelf_host::AdapterRegistry;
use cloudshelf_remote::{ByteRange, RemoteStore, TokenManager};

/// Content access port composed by the proxy.
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Fetch the object behind `file`, or only `range` of it.
    ///
    /// # Errors
    /// - `NotFound` if neither a remote copy nor local bytes exist
    /// - `Auth` / `TransientNetwork` / `PermanentRemote` from the remote path
    async fn get_content(&self, file: &FileRef, range: Option<ByteRange>) -> Result<Bytes>;

    /// Whether `get_content` can fetch a range without the whole object.
    fn supports_partial_fetch(&self, file: &FileRef) -> bool;
}

/// Serves synced files from the remote store and everything else from the
/// host's local bytes.
pub struct HostContentSource {
    tokens: Arc<TokenManager>,
    remote: Arc<dyn RemoteStore>,
    registry: Arc<AdapterRegistry>,
    backoff: BackoffExecutor,
}

impl HostContentSource {
    pub fn new(
        tokens: Arc<TokenManager>,
        remote: Arc<dyn RemoteStore>,
        registry: Arc<AdapterRegistry>,
        backoff: BackoffExecutor,
    ) -> Self {
        Self {
            tokens,
            remote,
            registry,
            backoff,
        }
    }

    async fn fetch_remote(&self, remote_id: &str, range: Option<ByteRange>) -> Result<Bytes> {
        let token = self.tokens.ensure_valid_token().await?;
        let fetch = range.filter(|_| self.remote.supports_partial_fetch());

        let data = self
            .backoff
            .execute("download", || self.remote.download(&token, remote_id, fetch))
            .await?;

        // Stores that ignore ranges hand back everything.
        Ok(match range {
            Some(range) if data.len() as u64 > range.len() => slice(data, range),
            _ => data,
        })
    }
}

#[async_trait]
impl ContentSource for HostContentSource {
    async fn get_content(&self, file: &FileRef, range: Option<ByteRange>) -> Result<Bytes> {
        if let Some(remote_id) = &file.remote_file_id {
            debug!("Fetching file {} from remote object {}", file.id, remote_id);
            return self.fetch_remote(remote_id, range).await;
        }

        if !file.local_bytes_present {
            return Err(Error::NotFound(format!(
                "File {} has neither a remote copy nor local bytes",
                file.id
            )));
        }

        debug!("Reading file {} from local storage", file.id);
        let adapter = self.registry.resolve(&file.entity_type)?;
        let data = adapter.read_local_bytes(file).await?;
        Ok(match range {
            Some(range) => slice(data, range),
            None => data,
        })
    }

    fn supports_partial_fetch(&self, file: &FileRef) -> bool {
        file.remote_file_id.is_none() || self.remote.supports_partial_fetch()
    }
}

/// Cut `range` out of a whole object, clamped to its length.
fn slice(data: Bytes, range: ByteRange) -> Bytes {
    let len = data.len() as u64;
    if range.start >= len {
        return Bytes::new();
    }
    let end = range.end.min(len - 1);
    data.slice(range.start as usize..=end as usize)
}
