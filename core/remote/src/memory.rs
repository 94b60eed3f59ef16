//! In-memory remote store and token endpoint for testing.
//!
//! Both doubles support fault injection: queued [`RemoteError`]s are returned
//! by the next calls before normal behavior resumes.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use cloudshelf_common::{sha256_hex, AccessToken, Credential, RemoteError, RemoteResult, Result};

use crate::store::{AccountInfo, ByteRange, RemoteObject, RemoteStore, UploadRequest};
use crate::token::{TokenEndpoint, TokenGrant};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
struct StoredObject {
    name: String,
    parent: Option<String>,
    mime_type: String,
    data: Bytes,
    is_folder: bool,
    trashed: bool,
}

impl StoredObject {
    fn to_remote(&self, id: &str, report_checksum: bool) -> RemoteObject {
        RemoteObject {
            id: id.to_string(),
            name: self.name.clone(),
            size: (!self.is_folder).then_some(self.data.len() as u64),
            mime_type: Some(self.mime_type.clone()),
            sha256: (report_checksum && !self.is_folder).then(|| sha256_hex(&self.data)),
            trashed: self.trashed,
        }
    }
}

/// In-memory remote store.
///
/// Useful for testing and development. All data is stored in memory and
/// lost on drop.
pub struct MemoryRemote {
    objects: Mutex<HashMap<String, StoredObject>>,
    faults: Mutex<VecDeque<RemoteError>>,
    next_id: AtomicU64,
    uploads: AtomicU32,
    downloads: AtomicU32,
    report_checksums: AtomicBool,
    corrupt_uploads: AtomicBool,
    partial_fetch: AtomicBool,
}

impl MemoryRemote {
    /// Create a new empty memory remote.
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            faults: Mutex::new(VecDeque::new()),
            next_id: AtomicU64::new(1),
            uploads: AtomicU32::new(0),
            downloads: AtomicU32::new(0),
            report_checksums: AtomicBool::new(true),
            corrupt_uploads: AtomicBool::new(false),
            partial_fetch: AtomicBool::new(true),
        }
    }

    /// Make the next call fail with `error`.
    pub fn inject_failure(&self, error: RemoteError) {
        lock(&self.faults).push_back(error);
    }

    /// Make the next `count` calls fail with `error`.
    pub fn inject_failures(&self, count: usize, error: RemoteError) {
        let mut faults = lock(&self.faults);
        for _ in 0..count {
            faults.push_back(error.clone());
        }
    }

    /// Stop (or resume) reporting SHA-256 checksums.
    pub fn set_report_checksums(&self, report: bool) {
        self.report_checksums.store(report, Ordering::SeqCst);
    }

    /// Store uploads with one flipped bit, as a lossy transfer would.
    pub fn set_corrupt_uploads(&self, corrupt: bool) {
        self.corrupt_uploads.store(corrupt, Ordering::SeqCst);
    }

    /// Advertise (or not) byte-range downloads.
    pub fn set_partial_fetch(&self, supported: bool) {
        self.partial_fetch.store(supported, Ordering::SeqCst);
    }

    /// Store an object directly, bypassing fault injection.
    pub fn put_object(&self, name: &str, parent: Option<&str>, data: impl Into<Bytes>) -> String {
        let id = self.allocate_id();
        lock(&self.objects).insert(
            id.clone(),
            StoredObject {
                name: name.to_string(),
                parent: parent.map(String::from),
                mime_type: "application/octet-stream".to_string(),
                data: data.into(),
                is_folder: false,
                trashed: false,
            },
        );
        id
    }

    /// Delete an object, as a user cleaning up the remote would.
    pub fn remove(&self, id: &str) -> bool {
        lock(&self.objects).remove(id).is_some()
    }

    /// Move an object to the trash.
    pub fn trash(&self, id: &str) {
        if let Some(object) = lock(&self.objects).get_mut(id) {
            object.trashed = true;
        }
    }

    /// Replace an object's content without changing its id.
    pub fn overwrite(&self, id: &str, data: impl Into<Bytes>) {
        if let Some(object) = lock(&self.objects).get_mut(id) {
            object.data = data.into();
        }
    }

    /// Content of a stored object.
    pub fn object_data(&self, id: &str) -> Option<Bytes> {
        lock(&self.objects).get(id).map(|o| o.data.clone())
    }

    /// Parent folder of a stored object.
    pub fn parent_of(&self, id: &str) -> Option<String> {
        lock(&self.objects).get(id).and_then(|o| o.parent.clone())
    }

    /// Number of folders with this exact name.
    pub fn folder_count(&self, name: &str) -> usize {
        lock(&self.objects)
            .values()
            .filter(|o| o.is_folder && o.name == name)
            .count()
    }

    /// Number of stored files (folders excluded).
    pub fn file_count(&self) -> usize {
        lock(&self.objects).values().filter(|o| !o.is_folder).count()
    }

    /// Upload attempts, failed ones included.
    pub fn upload_count(&self) -> u32 {
        self.uploads.load(Ordering::SeqCst)
    }

    /// Download attempts, failed ones included.
    pub fn download_count(&self) -> u32 {
        self.downloads.load(Ordering::SeqCst)
    }

    fn allocate_id(&self) -> String {
        format!("obj-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn take_fault(&self) -> RemoteResult<()> {
        match lock(&self.faults).pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn check_token(token: &AccessToken) -> RemoteResult<()> {
        if token.secret().is_empty() {
            return Err(RemoteError::unauthorized("Missing access token"));
        }
        Ok(())
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    fn name(&self) -> &str {
        "memory"
    }

    async fn find_folder(
        &self,
        token: &AccessToken,
        name: &str,
        parent: Option<&str>,
    ) -> RemoteResult<Option<RemoteObject>> {
        Self::check_token(token)?;
        self.take_fault()?;

        let objects = lock(&self.objects);
        let mut matches: Vec<(&String, &StoredObject)> = objects
            .iter()
            .filter(|(_, o)| o.is_folder && !o.trashed && o.name == name)
            .filter(|(_, o)| parent.is_none() || o.parent.as_deref() == parent)
            .collect();
        matches.sort_by(|a, b| a.0.cmp(b.0));

        Ok(matches.first().map(|(id, o)| o.to_remote(id, false)))
    }

    async fn create_folder(
        &self,
        token: &AccessToken,
        name: &str,
        parent: Option<&str>,
    ) -> RemoteResult<RemoteObject> {
        Self::check_token(token)?;
        self.take_fault()?;

        let mut objects = lock(&self.objects);
        if let Some(parent_id) = parent {
            match objects.get(parent_id) {
                Some(p) if p.is_folder => {}
                _ => {
                    return Err(RemoteError::not_found(format!(
                        "Parent folder {} not found",
                        parent_id
                    )))
                }
            }
        }

        let id = self.allocate_id();
        let folder = StoredObject {
            name: name.to_string(),
            parent: parent.map(String::from),
            mime_type: "application/vnd.google-apps.folder".to_string(),
            data: Bytes::new(),
            is_folder: true,
            trashed: false,
        };
        let remote = folder.to_remote(&id, false);
        objects.insert(id, folder);
        Ok(remote)
    }

    async fn upload(
        &self,
        token: &AccessToken,
        request: UploadRequest,
    ) -> RemoteResult<RemoteObject> {
        Self::check_token(token)?;
        self.uploads.fetch_add(1, Ordering::SeqCst);
        self.take_fault()?;

        let mut objects = lock(&self.objects);
        if let Some(folder_id) = &request.folder_id {
            match objects.get(folder_id) {
                Some(f) if f.is_folder && !f.trashed => {}
                _ => return Err(RemoteError::not_found(format!("Folder {} not found", folder_id))),
            }
        }

        let mut data = request.data.to_vec();
        if self.corrupt_uploads.load(Ordering::SeqCst) {
            if let Some(first) = data.first_mut() {
                *first ^= 0x01;
            } else {
                data.push(0);
            }
        }

        let id = self.allocate_id();
        let object = StoredObject {
            name: request.name,
            parent: request.folder_id,
            mime_type: request.mime_type,
            data: Bytes::from(data),
            is_folder: false,
            trashed: false,
        };
        let remote = object.to_remote(&id, self.report_checksums.load(Ordering::SeqCst));
        objects.insert(id, object);
        Ok(remote)
    }

    async fn download(
        &self,
        token: &AccessToken,
        file_id: &str,
        range: Option<ByteRange>,
    ) -> RemoteResult<Bytes> {
        Self::check_token(token)?;
        self.downloads.fetch_add(1, Ordering::SeqCst);
        self.take_fault()?;

        let objects = lock(&self.objects);
        let object = objects
            .get(file_id)
            .filter(|o| !o.is_folder && !o.trashed)
            .ok_or_else(|| RemoteError::not_found(format!("File {} not found", file_id)))?;

        match range {
            Some(range) if self.supports_partial_fetch() => {
                let len = object.data.len() as u64;
                if range.start >= len {
                    return Err(RemoteError::rejected("Requested range not satisfiable"));
                }
                let end = range.end.min(len - 1);
                Ok(object.data.slice(range.start as usize..=end as usize))
            }
            _ => Ok(object.data.clone()),
        }
    }

    async fn metadata(
        &self,
        token: &AccessToken,
        file_id: &str,
    ) -> RemoteResult<Option<RemoteObject>> {
        Self::check_token(token)?;
        self.take_fault()?;

        let report = self.report_checksums.load(Ordering::SeqCst);
        Ok(lock(&self.objects).get(file_id).map(|o| o.to_remote(file_id, report)))
    }

    async fn account(&self, token: &AccessToken) -> RemoteResult<AccountInfo> {
        Self::check_token(token)?;
        self.take_fault()?;

        Ok(AccountInfo {
            display_name: Some("Memory".to_string()),
            email: Some("memory@example.com".to_string()),
        })
    }

    fn supports_partial_fetch(&self) -> bool {
        self.partial_fetch.load(Ordering::SeqCst)
    }
}

/// In-memory OAuth2 server.
///
/// Accepts any authorization code except `bad-code` and issues numbered
/// access tokens valid for one hour.
pub struct MemoryTokenEndpoint {
    exchanges: AtomicU32,
    refreshes: AtomicU32,
    issued: AtomicU32,
    revoked: AtomicBool,
    refresh_faults: Mutex<VecDeque<RemoteError>>,
    latency: Duration,
    lifetime: Duration,
}

impl MemoryTokenEndpoint {
    /// Create an endpoint issuing one-hour tokens.
    pub fn new() -> Self {
        Self {
            exchanges: AtomicU32::new(0),
            refreshes: AtomicU32::new(0),
            issued: AtomicU32::new(0),
            revoked: AtomicBool::new(false),
            refresh_faults: Mutex::new(VecDeque::new()),
            latency: Duration::ZERO,
            lifetime: Duration::from_secs(3600),
        }
    }

    /// Delay every exchange and refresh.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Issue tokens with a different lifetime.
    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    /// Reject every further refresh with `invalid_grant`.
    pub fn revoke(&self) {
        self.revoked.store(true, Ordering::SeqCst);
    }

    /// Fail the next `count` refresh calls with `error`.
    pub fn fail_next_refreshes(&self, count: usize, error: RemoteError) {
        let mut faults = lock(&self.refresh_faults);
        for _ in 0..count {
            faults.push_back(error.clone());
        }
    }

    /// Code exchanges attempted.
    pub fn exchange_count(&self) -> u32 {
        self.exchanges.load(Ordering::SeqCst)
    }

    /// Refresh calls attempted, failed ones included.
    pub fn refresh_count(&self) -> u32 {
        self.refreshes.load(Ordering::SeqCst)
    }

    fn grant(&self, refresh_token: Option<String>) -> TokenGrant {
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        TokenGrant {
            access_token: format!("access-{}", n),
            refresh_token,
            expires_in: self.lifetime,
        }
    }
}

impl Default for MemoryTokenEndpoint {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenEndpoint for MemoryTokenEndpoint {
    fn authorization_url(
        &self,
        credential: &Credential,
        redirect_uri: &str,
        nonce: &str,
    ) -> Result<String> {
        Ok(format!(
            "https://auth.example/authorize?client_id={}&redirect_uri={}&state={}",
            credential.client_id, redirect_uri, nonce
        ))
    }

    async fn exchange_code(
        &self,
        _credential: &Credential,
        code: &str,
        _redirect_uri: &str,
    ) -> RemoteResult<TokenGrant> {
        self.exchanges.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if code == "bad-code" {
            return Err(RemoteError::rejected("invalid_request: malformed code"));
        }
        Ok(self.grant(Some("refresh-token".to_string())))
    }

    async fn refresh(
        &self,
        _credential: &Credential,
        _refresh_token: &str,
    ) -> RemoteResult<TokenGrant> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if let Some(err) = lock(&self.refresh_faults).pop_front() {
            return Err(err);
        }
        if self.revoked.load(Ordering::SeqCst) {
            return Err(RemoteError::unauthorized(
                "invalid_grant: Token has been expired or revoked.",
            ));
        }
        Ok(self.grant(None))
    }
}
