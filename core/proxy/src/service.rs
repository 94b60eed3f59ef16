//! Authorized, cached file serving.

use bytes::Bytes;
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use cloudshelf_common::digest::digests_match;
use cloudshelf_common::{
    sha256_hex, AccessLogEntry, CallerIdentity, Error, FileId, FileRef, Result,
};
use cloudshelf_host::{AccessControl, AuditLog, FileStatusStore};
use cloudshelf_remote::ByteRange;

use crate::cache::{BlobReader, DiskCache};
use crate::content::ContentSource;
use crate::range::{content_range, resolve_range, unsatisfied_range, RangeOutcome};

/// `Retry-After` sent with 503 responses, in seconds.
pub const RETRY_AFTER_SECS: u64 = 30;

/// Version tag of the bytes a cache entry holds for `file`.
///
/// Changes whenever the file is pointed at another remote object or its
/// recorded content hash changes, which retires any older entry.
pub(crate) fn cache_source(file: &FileRef) -> String {
    format!(
        "{}#{}",
        file.remote_file_id.as_deref().unwrap_or("local"),
        file.content_hash.as_deref().unwrap_or_default()
    )
}

/// HTTP status for an error surfaced by the proxy.
pub fn status_for(err: &Error) -> u16 {
    match err {
        Error::NotFound(_) => 404,
        Error::AccessDenied(_) => 403,
        Error::Validation(_) => 400,
        Error::Auth(_) | Error::TransientNetwork(_) => 503,
        Error::PermanentRemote(_) | Error::Integrity { .. } => 502,
        Error::CacheIo(_) | Error::Store(_) | Error::Serialization(_) => 500,
    }
}

/// Bytes of a response.
pub enum ServeBody {
    Empty,
    Bytes(Bytes),
    /// Streamed from a cached blob.
    Blob(BlobReader),
}

/// Outcome of [`FileProxy::serve`], ready to be turned into HTTP.
pub struct ServeResponse {
    pub status: u16,
    pub body: ServeBody,
    pub content_type: Option<String>,
    pub content_length: u64,
    pub content_range: Option<String>,
    /// Seconds, for 503.
    pub retry_after: Option<u64>,
    /// Name to advertise in `Content-Disposition`.
    pub file_name: Option<String>,
}

impl ServeResponse {
    fn status(status: u16) -> Self {
        Self {
            status,
            body: ServeBody::Empty,
            content_type: None,
            content_length: 0,
            content_range: None,
            retry_after: None,
            file_name: None,
        }
    }

    fn failure(err: &Error) -> Self {
        let status = status_for(err);
        let mut response = Self::status(status);
        if status == 503 {
            response.retry_after = Some(RETRY_AFTER_SECS);
        }
        response
    }

    fn not_satisfiable(total: u64) -> Self {
        let mut response = Self::status(416);
        response.content_range = Some(unsatisfied_range(total));
        response
    }

    fn content(
        file: &FileRef,
        content_type: &str,
        body: ServeBody,
        len: u64,
        range: Option<ByteRange>,
        total: u64,
    ) -> Self {
        Self {
            status: if range.is_some() { 206 } else { 200 },
            body,
            content_type: Some(content_type.to_string()),
            content_length: len,
            content_range: range.map(|range| content_range(range, total)),
            retry_after: None,
            file_name: Some(file.name.clone()),
        }
    }

    fn from_bytes(
        file: &FileRef,
        content_type: &str,
        data: Bytes,
        range: Option<ByteRange>,
        total: u64,
    ) -> Self {
        let len = data.len() as u64;
        Self::content(file, content_type, ServeBody::Bytes(data), len, range, total)
    }

    /// Whether bytes are being delivered.
    pub fn is_success(&self) -> bool {
        self.status == 200 || self.status == 206
    }
}

/// Serves host files to authorized callers through the disk cache.
///
/// The proxy reads file records but never changes their sync state.
pub struct FileProxy {
    store: Arc<dyn FileStatusStore>,
    acl: Arc<dyn AccessControl>,
    audit: Arc<dyn AuditLog>,
    content: Arc<dyn ContentSource>,
    cache: Arc<DiskCache>,
}

impl FileProxy {
    pub fn new(
        store: Arc<dyn FileStatusStore>,
        acl: Arc<dyn AccessControl>,
        audit: Arc<dyn AuditLog>,
        content: Arc<dyn ContentSource>,
        cache: Arc<DiskCache>,
    ) -> Self {
        Self {
            store,
            acl,
            audit,
            content,
            cache,
        }
    }

    pub fn cache(&self) -> &Arc<DiskCache> {
        &self.cache
    }

    /// Serve `file_id` to `caller`, honoring an optional raw `Range` header.
    ///
    /// Never fails: every error is mapped to a status. Each call leaves one
    /// access log entry.
    pub async fn serve(
        &self,
        file_id: FileId,
        caller: &CallerIdentity,
        range: Option<&str>,
    ) -> ServeResponse {
        let started = Instant::now();
        let (response, cache_hit) = self.respond(file_id, caller, range).await;

        let entry = AccessLogEntry {
            timestamp: Utc::now(),
            file_id,
            caller: caller.clone(),
            cache_hit,
            bytes_served: if response.is_success() {
                response.content_length
            } else {
                0
            },
            duration_ms: started.elapsed().as_millis() as u64,
            http_status: response.status,
            range: range.map(String::from),
        };
        if let Err(e) = self.audit.record_access(entry).await {
            warn!("Failed to record access to file {}: {}", file_id, e);
        }

        response
    }

    async fn respond(
        &self,
        file_id: FileId,
        caller: &CallerIdentity,
        range: Option<&str>,
    ) -> (ServeResponse, bool) {
        let file = match self.store.get(file_id).await {
            Ok(Some(file)) => file,
            Ok(None) => return (ServeResponse::status(404), false),
            Err(e) => {
                error!("Failed to load file {}: {}", file_id, e);
                return (ServeResponse::failure(&e), false);
            }
        };

        match self.acl.can_access(caller, &file).await {
            Ok(true) => {}
            Ok(false) => {
                info!("Caller {} denied access to file {}", caller.as_str(), file_id);
                return (ServeResponse::status(403), false);
            }
            Err(e) => {
                error!("Access check for file {} failed: {}", file_id, e);
                return (ServeResponse::failure(&e), false);
            }
        }

        if let Some(response) = self.serve_cached(&file, range).await {
            return (response, true);
        }

        match self.serve_miss(&file, range).await {
            Ok(response) => (response, false),
            Err(e) => {
                warn!("Serving file {} failed: {}", file_id, e);
                (ServeResponse::failure(&e), false)
            }
        }
    }

    async fn serve_cached(&self, file: &FileRef, range: Option<&str>) -> Option<ServeResponse> {
        let blob = self.cache.get(file.id)?;
        if blob.source() != cache_source(file) {
            debug!("Cached copy of file {} is outdated, dropping it", file.id);
            drop(blob);
            self.cache.remove(file.id);
            return None;
        }
        let total = blob.size();
        let range = match resolve_range(range, total) {
            RangeOutcome::Full => None,
            RangeOutcome::Partial(range) => Some(range),
            RangeOutcome::NotSatisfiable => return Some(ServeResponse::not_satisfiable(total)),
        };

        match blob.open(range).await {
            Ok(reader) => {
                debug!("Serving file {} from cache", file.id);
                let len = reader.len();
                Some(ServeResponse::content(
                    file,
                    blob.content_type(),
                    ServeBody::Blob(reader),
                    len,
                    range,
                    total,
                ))
            }
            Err(e) => {
                warn!("Cache read for file {} failed, fetching directly: {}", file.id, e);
                self.cache.remove(file.id);
                None
            }
        }
    }

    async fn serve_miss(&self, file: &FileRef, range: Option<&str>) -> Result<ServeResponse> {
        let content_type = file.content_type();

        if self.cache.fits(file.size_bytes) {
            let data = self.content.get_content(file, None).await?;
            if let Some(expected) = file.content_hash.as_deref() {
                let actual = sha256_hex(&data);
                if !digests_match(expected, &actual) {
                    error!("Fetched bytes of file {} do not match its content hash", file.id);
                    return Err(Error::Integrity {
                        expected: expected.to_string(),
                        actual,
                    });
                }
            }
            let total = data.len() as u64;
            if self.cache.fits(total) {
                let source = cache_source(file);
                if let Err(e) = self.cache.insert(file.id, &source, &data, &content_type).await {
                    warn!("Failed to cache file {}: {}", file.id, e);
                }
            }
            return Ok(Self::whole(file, &content_type, data, range));
        }

        // Over budget: never cached, fetched by range when possible.
        let total = file.size_bytes;
        match resolve_range(range, total) {
            RangeOutcome::NotSatisfiable => Ok(ServeResponse::not_satisfiable(total)),
            RangeOutcome::Partial(requested) if self.content.supports_partial_fetch(file) => {
                let data = self.content.get_content(file, Some(requested)).await?;
                if data.is_empty() {
                    return Ok(ServeResponse::not_satisfiable(total));
                }
                let served = ByteRange {
                    start: requested.start,
                    end: requested.start + data.len() as u64 - 1,
                };
                Ok(ServeResponse::from_bytes(file, &content_type, data, Some(served), total))
            }
            _ => {
                let data = self.content.get_content(file, None).await?;
                Ok(Self::whole(file, &content_type, data, range))
            }
        }
    }

    /// Respond from a complete object, slicing out the requested range.
    fn whole(
        file: &FileRef,
        content_type: &str,
        data: Bytes,
        range: Option<&str>,
    ) -> ServeResponse {
        let total = data.len() as u64;
        match resolve_range(range, total) {
            RangeOutcome::Full => ServeResponse::from_bytes(file, content_type, data, None, total),
            RangeOutcome::Partial(range) => {
                let part = data.slice(range.start as usize..=range.end as usize);
                ServeResponse::from_bytes(file, content_type, part, Some(range), total)
            }
            RangeOutcome::NotSatisfiable => ServeResponse::not_satisfiable(total),
        }
    }
}
