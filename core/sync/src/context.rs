//! Collaborators shared by the orchestrator and reconciliation.

use std::sync::Arc;

use cloudshelf_common::BackoffExecutor;
use cloudshelf_host::{AdapterRegistry, AuditLog, FileStatusStore};
use cloudshelf_remote::{RemoteStore, TokenManager};

/// Handles every sync component needs. Cheap to clone.
#[derive(Clone)]
pub struct SyncContext {
    /// Credential used for every remote call.
    pub tokens: Arc<TokenManager>,
    pub remote: Arc<dyn RemoteStore>,
    pub registry: Arc<AdapterRegistry>,
    pub store: Arc<dyn FileStatusStore>,
    pub audit: Arc<dyn AuditLog>,
    pub backoff: BackoffExecutor,
}
