//! In-memory host for testing.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use cloudshelf_common::{
    AccessLogEntry, AccessMode, CallerIdentity, Error, FileId, FileRef, ReconcileLogEntry, Result,
    SyncLogEntry, SyncSession, SyncStatus,
};

use crate::ports::{
    AccessControl, AuditLog, CandidateQuery, FileAdapter, FileStatusStore, ReconcileQuery,
    SyncedUpdate,
};

#[derive(Default)]
struct HostState {
    files: BTreeMap<FileId, FileRef>,
    bytes: HashMap<FileId, Bytes>,
    read_failures: HashSet<FileId>,
    clear_mark_failures: HashSet<FileId>,
    grants: HashSet<(String, FileId)>,
    allow_all: bool,
    sync_log: Vec<SyncLogEntry>,
    access_log: Vec<AccessLogEntry>,
    reconcile_log: Vec<ReconcileLogEntry>,
    sessions: Vec<SyncSession>,
    next_id: i64,
}

impl HostState {
    fn file_mut(&mut self, id: FileId) -> Result<&mut FileRef> {
        self.files
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("file {id}")))
    }
}

/// Host double: status store, audit log, ACL and file adapters in one.
///
/// Clones share state, so a test keeps one handle for assertions while the
/// engine holds others.
#[derive(Clone, Default)]
pub struct MemoryHost {
    state: Arc<Mutex<HostState>>,
}

impl MemoryHost {
    /// Create an empty host.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a `local` file with its bytes and return the record.
    pub fn add_file(&self, entity_type: &str, entity_id: i64, name: &str, data: &[u8]) -> FileRef {
        let mut state = self.state();
        state.next_id += 1;
        let id = FileId(state.next_id);
        let file = FileRef::new_local(id, entity_type, entity_id, name, data.len() as u64);
        state.files.insert(id, file.clone());
        state.bytes.insert(id, Bytes::copy_from_slice(data));
        file
    }

    /// Insert a record in an arbitrary state.
    pub fn insert(&self, file: FileRef, data: Option<Bytes>) {
        let mut state = self.state();
        state.next_id = state.next_id.max(file.id.0);
        if let Some(data) = data {
            state.bytes.insert(file.id, data);
        }
        state.files.insert(file.id, file);
    }

    /// Mutate a record in place.
    pub fn update(&self, id: FileId, f: impl FnOnce(&mut FileRef)) {
        if let Some(file) = self.state().files.get_mut(&id) {
            f(file);
        }
    }

    pub fn file(&self, id: FileId) -> Option<FileRef> {
        self.state().files.get(&id).cloned()
    }

    pub fn local_bytes(&self, id: FileId) -> Option<Bytes> {
        self.state().bytes.get(&id).cloned()
    }

    /// Make reads of this file's local bytes fail.
    pub fn set_read_failure(&self, id: FileId) {
        self.state().read_failures.insert(id);
    }

    /// Make recording cleared local bytes for this file fail.
    pub fn set_clear_mark_failure(&self, id: FileId) {
        self.state().clear_mark_failures.insert(id);
    }

    /// Let `caller` read `id`.
    pub fn grant(&self, caller: &str, id: FileId) {
        self.state().grants.insert((caller.to_string(), id));
    }

    /// Let every caller read every file.
    pub fn allow_all(&self) {
        self.state().allow_all = true;
    }

    pub fn sync_log(&self) -> Vec<SyncLogEntry> {
        self.state().sync_log.clone()
    }

    pub fn access_log(&self) -> Vec<AccessLogEntry> {
        self.state().access_log.clone()
    }

    pub fn reconcile_log(&self) -> Vec<ReconcileLogEntry> {
        self.state().reconcile_log.clone()
    }

    pub fn sessions(&self) -> Vec<SyncSession> {
        self.state().sessions.clone()
    }

    /// File adapter for one entity type backed by this host.
    pub fn adapter(&self, entity_type: &str) -> Arc<dyn FileAdapter> {
        Arc::new(MemoryAdapter {
            entity_type: entity_type.to_string(),
            host: self.clone(),
        })
    }
}

struct MemoryAdapter {
    entity_type: String,
    host: MemoryHost,
}

#[async_trait]
impl FileAdapter for MemoryAdapter {
    fn entity_type(&self) -> &str {
        &self.entity_type
    }

    async fn list_candidates(&self, query: &CandidateQuery) -> Result<Vec<FileRef>> {
        let state = self.host.state();
        Ok(state
            .files
            .values()
            .filter(|file| file.entity_type == self.entity_type && query.matches(file))
            .take(query.limit)
            .cloned()
            .collect())
    }

    async fn read_local_bytes(&self, file: &FileRef) -> Result<Bytes> {
        let state = self.host.state();
        if state.read_failures.contains(&file.id) {
            return Err(Error::CacheIo(std::io::Error::other("simulated read failure")));
        }
        state
            .bytes
            .get(&file.id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("local bytes of file {}", file.id)))
    }

    async fn clear_local_bytes(&self, file: &FileRef) -> Result<u64> {
        Ok(self
            .host
            .state()
            .bytes
            .remove(&file.id)
            .map_or(0, |data| data.len() as u64))
    }
}

#[async_trait]
impl FileStatusStore for MemoryHost {
    async fn get(&self, id: FileId) -> Result<Option<FileRef>> {
        Ok(self.file(id))
    }

    async fn claim(&self, id: FileId) -> Result<bool> {
        let mut state = self.state();
        let file = state.file_mut(id)?;
        if !SyncStatus::CLAIMABLE.contains(&file.sync_status) {
            return Ok(false);
        }
        file.sync_status = SyncStatus::Processing;
        file.claimed_at = Some(Utc::now());
        Ok(true)
    }

    async fn mark_synced(&self, id: FileId, update: SyncedUpdate) -> Result<()> {
        let mut state = self.state();
        let file = state.file_mut(id)?;
        file.sync_status = SyncStatus::Synced;
        file.remote_file_id = Some(update.remote_file_id);
        file.content_hash = update.content_hash;
        file.synced_at = Some(update.synced_at);
        file.last_checked_at = Some(update.synced_at);
        file.access_mode = update.access_mode;
        file.claimed_at = None;
        Ok(())
    }

    async fn mark_error(&self, id: FileId) -> Result<()> {
        let mut state = self.state();
        let file = state.file_mut(id)?;
        file.sync_status = SyncStatus::Error;
        file.claimed_at = None;
        Ok(())
    }

    async fn mark_local_cleared(&self, id: FileId) -> Result<()> {
        let mut state = self.state();
        if state.clear_mark_failures.contains(&id) {
            return Err(Error::Store("simulated write failure".to_string()));
        }
        state.file_mut(id)?.local_bytes_present = false;
        Ok(())
    }

    async fn reset_to_local(&self, id: FileId) -> Result<()> {
        let mut state = self.state();
        let file = state.file_mut(id)?;
        file.sync_status = SyncStatus::Local;
        file.remote_file_id = None;
        file.content_hash = None;
        file.synced_at = None;
        file.access_mode = AccessMode::Local;
        file.claimed_at = None;
        Ok(())
    }

    async fn set_access_mode(&self, id: FileId, mode: AccessMode) -> Result<()> {
        self.state().file_mut(id)?.access_mode = mode;
        Ok(())
    }

    async fn mark_checked(&self, id: FileId, at: DateTime<Utc>) -> Result<()> {
        self.state().file_mut(id)?.last_checked_at = Some(at);
        Ok(())
    }

    async fn reconcile_candidates(&self, query: &ReconcileQuery) -> Result<Vec<FileRef>> {
        let state = self.state();
        let mut due: Vec<FileRef> = state
            .files
            .values()
            .filter(|file| query.matches(file))
            .cloned()
            .collect();
        due.sort_by_key(|file| (file.last_checked_at.is_some(), file.last_checked_at, file.id));
        due.truncate(query.limit);
        Ok(due)
    }

    async fn stale_claims(
        &self,
        claimed_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<FileRef>> {
        Ok(self
            .state()
            .files
            .values()
            .filter(|file| {
                file.sync_status == SyncStatus::Processing
                    && file.claimed_at.map_or(true, |at| at < claimed_before)
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn release_claim(&self, id: FileId, claimed_before: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state();
        let file = state.file_mut(id)?;
        let stale = file.sync_status == SyncStatus::Processing
            && file.claimed_at.map_or(true, |at| at < claimed_before);
        if stale {
            file.sync_status = SyncStatus::Error;
            file.claimed_at = None;
        }
        Ok(stale)
    }
}

#[async_trait]
impl AuditLog for MemoryHost {
    async fn record_sync(&self, entry: SyncLogEntry) -> Result<()> {
        self.state().sync_log.push(entry);
        Ok(())
    }

    async fn record_access(&self, entry: AccessLogEntry) -> Result<()> {
        self.state().access_log.push(entry);
        Ok(())
    }

    async fn record_reconcile(&self, entry: ReconcileLogEntry) -> Result<()> {
        self.state().reconcile_log.push(entry);
        Ok(())
    }

    async fn record_session(&self, session: &SyncSession) -> Result<()> {
        let mut state = self.state();
        match state.sessions.iter_mut().find(|s| s.id == session.id) {
            Some(existing) => *existing = session.clone(),
            None => state.sessions.push(session.clone()),
        }
        Ok(())
    }
}

#[async_trait]
impl AccessControl for MemoryHost {
    async fn can_access(&self, caller: &CallerIdentity, file: &FileRef) -> Result<bool> {
        let state = self.state();
        Ok(state.allow_all || state.grants.contains(&(caller.as_str().to_string(), file.id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[tokio::test]
    async fn test_concurrent_claims_single_winner() {
        let host = MemoryHost::new();
        let file = host.add_file("invoice", 1, "a.pdf", b"data");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let host = host.clone();
            handles.push(tokio::spawn(async move { host.claim(file.id).await.unwrap() }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(host.file(file.id).unwrap().sync_status, SyncStatus::Processing);
    }

    #[tokio::test]
    async fn test_adapter_reads_and_clears() {
        let host = MemoryHost::new();
        let file = host.add_file("invoice", 1, "a.pdf", b"data");
        let adapter = host.adapter("invoice");

        assert_eq!(adapter.read_local_bytes(&file).await.unwrap(), Bytes::from_static(b"data"));
        assert_eq!(adapter.clear_local_bytes(&file).await.unwrap(), 4);
        assert!(host.local_bytes(file.id).is_none());
        assert!(adapter.read_local_bytes(&file).await.is_err());
    }

    #[tokio::test]
    async fn test_adapter_candidates_use_query() {
        let host = MemoryHost::new();
        host.add_file("invoice", 1, "a.pdf", b"a");
        host.add_file("invoice", 1, "b.pdf", b"b");
        host.add_file("partner", 1, "c.pdf", b"c");

        let query = CandidateQuery {
            entity_type: "invoice".to_string(),
            statuses: SyncStatus::CLAIMABLE.to_vec(),
            whitelist: cloudshelf_common::FileTypeWhitelist::from_configs(&[
                cloudshelf_common::FileTypeConfig::new("pdf", 1.0),
            ])
            .unwrap(),
            exclude: HashSet::new(),
            limit: 1,
        };
        let found = host.adapter("invoice").list_candidates(&query).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "a.pdf");
    }

    #[tokio::test]
    async fn test_grants() {
        let host = MemoryHost::new();
        let file = host.add_file("invoice", 1, "a.pdf", b"a");
        let alice = CallerIdentity::new("alice");

        assert!(!host.can_access(&alice, &file).await.unwrap());
        host.grant("alice", file.id);
        assert!(host.can_access(&alice, &file).await.unwrap());
    }

    #[tokio::test]
    async fn test_session_upsert() {
        let host = MemoryHost::new();
        let mut session = SyncSession::start("s1");
        host.record_session(&session).await.unwrap();
        session.batches = 3;
        host.record_session(&session).await.unwrap();

        let sessions = host.sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].batches, 3);
    }
}
