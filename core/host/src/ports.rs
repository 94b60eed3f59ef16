//! Interfaces the host application provides to the sync engine and proxy.
//!
//! The host owns its file records, the bytes behind them and its access
//! rules. CloudShelf only sees them through these traits.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashSet;

use cloudshelf_common::{
    AccessLogEntry, AccessMode, CallerIdentity, FileId, FileRef, FileTypeWhitelist,
    ReconcileLogEntry, Result, SyncLogEntry, SyncSession, SyncStatus,
};

/// Filter for selecting files to sync.
#[derive(Debug, Clone)]
pub struct CandidateQuery {
    pub entity_type: String,
    pub statuses: Vec<SyncStatus>,
    pub whitelist: FileTypeWhitelist,
    /// Files already handled earlier in the same session.
    pub exclude: HashSet<FileId>,
    pub limit: usize,
}

impl CandidateQuery {
    /// Whether `file` passes every filter except the limit.
    ///
    /// Files without local bytes never qualify: there is nothing to upload.
    pub fn matches(&self, file: &FileRef) -> bool {
        file.entity_type == self.entity_type
            && file.local_bytes_present
            && self.statuses.contains(&file.sync_status)
            && self.whitelist.allows(&file.extension, file.size_bytes)
            && !self.exclude.contains(&file.id)
    }
}

/// Filter for selecting files to reconcile.
#[derive(Debug, Clone)]
pub struct ReconcileQuery {
    /// Files last checked before this instant (or never) are due.
    pub checked_before: DateTime<Utc>,
    /// Also select files whose access pointer is not yet redirected.
    pub include_unredirected: bool,
    pub limit: usize,
}

impl ReconcileQuery {
    /// Whether `file` is due for reconciliation.
    pub fn matches(&self, file: &FileRef) -> bool {
        if file.sync_status != SyncStatus::Synced || file.remote_file_id.is_none() {
            return false;
        }
        let stale = file.last_checked_at.map_or(true, |at| at < self.checked_before);
        let unredirected =
            self.include_unredirected && file.access_mode != AccessMode::RemoteRedirect;
        stale || unredirected
    }
}

/// Outcome of a verified upload.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncedUpdate {
    pub remote_file_id: String,
    /// `None` when the remote reported no checksum to verify against.
    pub content_hash: Option<String>,
    pub synced_at: DateTime<Utc>,
    pub access_mode: AccessMode,
}

/// Host-side access to the bytes of one entity type.
#[async_trait]
pub trait FileAdapter: Send + Sync {
    /// Entity type this adapter serves.
    fn entity_type(&self) -> &str;

    /// Files eligible for upload, at most `query.limit` of them.
    async fn list_candidates(&self, query: &CandidateQuery) -> Result<Vec<FileRef>>;

    /// Read the locally stored bytes.
    ///
    /// # Errors
    /// - `NotFound` if the bytes are gone
    async fn read_local_bytes(&self, file: &FileRef) -> Result<Bytes>;

    /// Delete the locally stored bytes. Returns the number of bytes freed.
    async fn clear_local_bytes(&self, file: &FileRef) -> Result<u64>;
}

/// Shared record of file sync state.
///
/// Every transition out of `local`/`error` goes through [`claim`], an atomic
/// compare-and-set, so concurrent batches never process a file twice.
///
/// [`claim`]: FileStatusStore::claim
#[async_trait]
pub trait FileStatusStore: Send + Sync {
    /// Get a file record by id.
    async fn get(&self, id: FileId) -> Result<Option<FileRef>>;

    /// Atomically move `{local, error} -> processing`.
    ///
    /// # Returns
    /// `true` if this caller won the claim.
    async fn claim(&self, id: FileId) -> Result<bool>;

    /// Record a verified upload; clears the claim.
    async fn mark_synced(&self, id: FileId, update: SyncedUpdate) -> Result<()>;

    /// Move to `error`; clears the claim. The remote id is left untouched.
    async fn mark_error(&self, id: FileId) -> Result<()>;

    /// Record that the local bytes were deleted.
    async fn mark_local_cleared(&self, id: FileId) -> Result<()>;

    /// Back to `local`: remote id, hash and sync time are cleared and the
    /// access pointer returns to the host.
    async fn reset_to_local(&self, id: FileId) -> Result<()>;

    /// Switch the host access pointer.
    async fn set_access_mode(&self, id: FileId, mode: AccessMode) -> Result<()>;

    /// Stamp the last reconciliation time.
    async fn mark_checked(&self, id: FileId, at: DateTime<Utc>) -> Result<()>;

    /// Files due for reconciliation.
    async fn reconcile_candidates(&self, query: &ReconcileQuery) -> Result<Vec<FileRef>>;

    /// Files stuck in `processing` since before `claimed_before`.
    async fn stale_claims(
        &self,
        claimed_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<FileRef>>;

    /// Atomically move `processing -> error` if the claim is still older
    /// than `claimed_before`.
    async fn release_claim(&self, id: FileId, claimed_before: DateTime<Utc>) -> Result<bool>;
}

/// Host access rules.
#[async_trait]
pub trait AccessControl: Send + Sync {
    /// Whether `caller` may read `file`.
    async fn can_access(&self, caller: &CallerIdentity, file: &FileRef) -> Result<bool>;
}

/// Append-only audit trail.
#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn record_sync(&self, entry: SyncLogEntry) -> Result<()>;

    async fn record_access(&self, entry: AccessLogEntry) -> Result<()>;

    async fn record_reconcile(&self, entry: ReconcileLogEntry) -> Result<()>;

    /// Insert or update a complete-sync session.
    async fn record_session(&self, session: &SyncSession) -> Result<()>;
}
