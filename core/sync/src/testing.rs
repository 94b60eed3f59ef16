//! Shared fixture for the sync tests.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;

use cloudshelf_common::{
    BackoffConfig, BackoffExecutor, Credential, CredentialState, FileTypeConfig, ModelConfig,
    SyncConfig,
};
use cloudshelf_host::{AdapterRegistry, MemoryHost};
use cloudshelf_remote::{MemoryRemote, MemoryTokenEndpoint, TokenManager};

use crate::context::SyncContext;
use crate::orchestrator::Orchestrator;

pub(crate) struct Fixture {
    pub host: MemoryHost,
    pub remote: Arc<MemoryRemote>,
    pub endpoint: Arc<MemoryTokenEndpoint>,
    pub ctx: SyncContext,
}

impl Fixture {
    /// Authorized credential with an hour left; one `invoice` adapter.
    pub fn new() -> Self {
        Self::build(ChronoDuration::hours(1))
    }

    /// Credential that must refresh before its first use.
    pub fn with_expiring_token() -> Self {
        Self::build(ChronoDuration::minutes(1))
    }

    fn build(expires_in: ChronoDuration) -> Self {
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
        credential.access_token = Some("access-0".to_string());
        credential.refresh_token = Some("refresh".to_string());
        credential.token_expiry = Some(Utc::now() + expires_in);
        let tokens = Arc::new(TokenManager::new(credential, endpoint.clone(), backoff.clone()));

        let mut registry = AdapterRegistry::new();
        registry
            .register(host.adapter("invoice"))
            .expect("fresh registry");

        let ctx = SyncContext {
            tokens,
            remote: remote.clone(),
            registry: Arc::new(registry),
            store: Arc::new(host.clone()),
            audit: Arc::new(host.clone()),
            backoff,
        };

        Self {
            host,
            remote,
            endpoint,
            ctx,
        }
    }

    pub fn orchestrator(&self, config: SyncConfig, file_types: &[FileTypeConfig]) -> Orchestrator {
        Orchestrator::new(
            self.ctx.clone(),
            config,
            vec![ModelConfig::new("invoice", "Invoices")],
            file_types,
        )
        .expect("valid file types")
    }

    pub fn default_orchestrator(&self) -> Orchestrator {
        self.orchestrator(SyncConfig::default(), &FileTypeConfig::defaults())
    }
}
