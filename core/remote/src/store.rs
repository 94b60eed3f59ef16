//! Remote object store trait definition.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use cloudshelf_common::{AccessToken, RemoteResult};

/// Metadata of an object in the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteObject {
    /// Provider-specific identifier.
    pub id: String,
    /// Name of the object.
    pub name: String,
    /// Size in bytes (None for folders).
    pub size: Option<u64>,
    /// MIME type reported by the provider.
    pub mime_type: Option<String>,
    /// SHA-256 of the content as reported by the provider, hex encoded.
    pub sha256: Option<String>,
    /// Object sits in the provider's trash.
    pub trashed: bool,
}

/// Identity of the account a token belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub display_name: Option<String>,
    pub email: Option<String>,
}

/// Inclusive byte range within an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Number of bytes covered by the range.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Value for an HTTP `Range` request header.
    pub fn to_header(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

/// Object to store remotely.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub name: String,
    pub mime_type: String,
    /// Destination folder; `None` means the account root.
    pub folder_id: Option<String>,
    pub data: Bytes,
}

/// Remote object store used by sync, reconciliation and the proxy.
///
/// Every call takes the access token explicitly and reports failures as a
/// classified [`RemoteError`](cloudshelf_common::RemoteError), so callers can
/// wrap it in the backoff executor. Implementations do no retrying of their own.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Get the store name (e.g., "gdrive", "memory").
    fn name(&self) -> &str;

    /// Find a folder by exact name.
    ///
    /// With `parent`, only direct children of that folder are searched.
    /// Without it the search covers the whole account and the first match
    /// wins, so two folders sharing a name are indistinguishable.
    async fn find_folder(
        &self,
        token: &AccessToken,
        name: &str,
        parent: Option<&str>,
    ) -> RemoteResult<Option<RemoteObject>>;

    /// Create a folder.
    ///
    /// # Postconditions
    /// - Returns metadata of the created folder
    async fn create_folder(
        &self,
        token: &AccessToken,
        name: &str,
        parent: Option<&str>,
    ) -> RemoteResult<RemoteObject>;

    /// Upload a complete object.
    ///
    /// # Postconditions
    /// - Returns metadata of the stored object, including its checksum when
    ///   the provider reports one
    ///
    /// # Errors
    /// - `Rejected` if the destination folder does not accept the object
    /// - retryable kinds for rate limits and server failures
    async fn upload(
        &self,
        token: &AccessToken,
        request: UploadRequest,
    ) -> RemoteResult<RemoteObject>;

    /// Download an object, optionally only a byte range of it.
    ///
    /// # Errors
    /// - `NotFound` if the object does not exist
    async fn download(
        &self,
        token: &AccessToken,
        file_id: &str,
        range: Option<ByteRange>,
    ) -> RemoteResult<Bytes>;

    /// Get metadata for an object. `Ok(None)` when it does not exist.
    async fn metadata(
        &self,
        token: &AccessToken,
        file_id: &str,
    ) -> RemoteResult<Option<RemoteObject>>;

    /// Identity of the account the token belongs to.
    async fn account(&self, token: &AccessToken) -> RemoteResult<AccountInfo>;

    /// Whether `download` honors byte ranges.
    fn supports_partial_fetch(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_range_len_and_header() {
        let range = ByteRange { start: 100, end: 199 };
        assert_eq!(range.len(), 100);
        assert_eq!(range.to_header(), "bytes=100-199");
    }

    #[test]
    fn test_remote_object_serialization() {
        let object = RemoteObject {
            id: "abc".to_string(),
            name: "scan.pdf".to_string(),
            size: Some(1024),
            mime_type: Some("application/pdf".to_string()),
            sha256: Some("00ff".to_string()),
            trashed: false,
        };

        let json = serde_json::to_string(&object).unwrap();
        let deserialized: RemoteObject = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, object);
    }
}
