//! Shared fixture for the proxy tests.

use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;

use cloudshelf_common::{
    sha256_hex, AccessMode, BackoffConfig, BackoffExecutor, Credential, CredentialState, FileRef,
    SyncStatus,
};
use cloudshelf_host::{AdapterRegistry, MemoryHost};
use cloudshelf_remote::{MemoryRemote, MemoryTokenEndpoint, TokenManager};

use crate::cache::DiskCache;
use crate::content::HostContentSource;
use crate::service::{FileProxy, ServeBody};

pub(crate) struct Harness {
    pub host: MemoryHost,
    pub remote: Arc<MemoryRemote>,
    pub endpoint: Arc<MemoryTokenEndpoint>,
    pub tokens: Arc<TokenManager>,
    pub proxy: Arc<FileProxy>,
    _dir: TempDir,
}

impl Harness {
    /// Roomy cache, credential with an hour left.
    pub async fn new() -> Self {
        Self::build(10_000, ChronoDuration::hours(1)).await
    }

    pub async fn build(budget_bytes: u64, token_lifetime: ChronoDuration) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let host = MemoryHost::new();
        let remote = Arc::new(MemoryRemote::new());
        let endpoint = Arc::new(MemoryTokenEndpoint::new());
        let backoff = BackoffExecutor::new(
            BackoffConfig::new(3)
                .with_base_delay(Duration::from_millis(1))
                .with_max_delay(Duration::from_millis(5)),
        );

        let mut credential = Credential::new("main", "client", "secret");
        credential.state = CredentialState::Authorized;
        credential.access_token = Some("access".to_string());
        credential.refresh_token = Some("refresh".to_string());
        credential.token_expiry = Some(Utc::now() + token_lifetime);
        let tokens = Arc::new(TokenManager::new(credential, endpoint.clone(), backoff.clone()));

        let mut registry = AdapterRegistry::new();
        registry
            .register(host.adapter("invoice"))
            .expect("fresh registry");
        let content =
            HostContentSource::new(tokens.clone(), remote.clone(), Arc::new(registry), backoff);

        let cache = DiskCache::open(dir.path(), budget_bytes, Duration::from_secs(3600))
            .await
            .expect("cache dir");
        let proxy = Arc::new(FileProxy::new(
            Arc::new(host.clone()),
            Arc::new(host.clone()),
            Arc::new(host.clone()),
            Arc::new(content),
            Arc::new(cache),
        ));

        Self {
            host,
            remote,
            endpoint,
            tokens,
            proxy,
            _dir: dir,
        }
    }

    /// A synced file whose bytes only exist remotely.
    pub fn synced_file(&self, name: &str, data: &[u8]) -> FileRef {
        let remote_id = self.remote.put_object(name, None, Bytes::copy_from_slice(data));
        let mut file = self.host.add_file("invoice", 1, name, data);
        file.remote_file_id = Some(remote_id);
        file.content_hash = Some(sha256_hex(data));
        file.sync_status = SyncStatus::Synced;
        file.local_bytes_present = false;
        file.access_mode = AccessMode::RemoteRedirect;
        self.host.insert(file.clone(), None);
        file
    }
}

pub(crate) async fn read_body(body: ServeBody) -> Vec<u8> {
    match body {
        ServeBody::Empty => Vec::new(),
        ServeBody::Bytes(data) => data.to_vec(),
        ServeBody::Blob(mut reader) => {
            let mut out = Vec::new();
            reader.read_to_end(&mut out).await.expect("blob read");
            out
        }
    }
}
