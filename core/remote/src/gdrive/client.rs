//! Google Drive API client.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{header, Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use cloudshelf_common::{AccessToken, Error, RemoteError, RemoteErrorKind, RemoteResult, Result};

use crate::store::{AccountInfo, ByteRange, RemoteObject, RemoteStore, UploadRequest};

/// Google Drive API base URL.
const DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";
/// Google Drive upload API base URL.
const DRIVE_UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";
/// Fields requested for every file resource.
const FILE_FIELDS: &str = "id,name,mimeType,size,parents,sha256Checksum,trashed";
/// MIME type Drive uses for folders.
const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";
/// Objects above this size use a resumable upload session.
const MULTIPART_LIMIT: usize = 5 * 1024 * 1024;
/// Chunk size for resumable uploads (must be a multiple of 256KB).
const CHUNK_SIZE: usize = 8 * 256 * 1024;

/// Google Drive file metadata from API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    /// File ID.
    pub id: String,
    /// File name.
    pub name: String,
    /// MIME type.
    pub mime_type: String,
    /// File size in bytes (only for files, not folders).
    #[serde(default)]
    pub size: Option<String>,
    /// Parent folder IDs.
    #[serde(default)]
    pub parents: Vec<String>,
    /// SHA-256 checksum (only for binary files).
    #[serde(default)]
    pub sha256_checksum: Option<String>,
    /// Trashed status.
    #[serde(default)]
    pub trashed: bool,
}

impl DriveFile {
    /// Check if this is a folder.
    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME_TYPE
    }

    /// Get size as u64.
    pub fn size_bytes(&self) -> Option<u64> {
        self.size.as_ref().and_then(|s| s.parse().ok())
    }
}

impl From<DriveFile> for RemoteObject {
    fn from(file: DriveFile) -> Self {
        let size = file.size_bytes();
        RemoteObject {
            id: file.id,
            name: file.name,
            size,
            mime_type: Some(file.mime_type),
            sha256: file.sha256_checksum,
            trashed: file.trashed,
        }
    }
}

/// Response from listing files.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileListResponse {
    files: Vec<DriveFile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AboutResponse {
    user: AboutUser,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AboutUser {
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    email_address: Option<String>,
}

/// Google Drive API client.
pub struct DriveClient {
    http: Client,
}

impl DriveClient {
    /// Create a new Drive client.
    ///
    /// # Errors
    /// - `Validation` if the HTTP client cannot be built
    pub fn new() -> Result<Self> {
        let http = Client::builder()
            .user_agent("CloudShelf/0.1")
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Validation(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { http })
    }

    fn bearer(token: &AccessToken) -> String {
        format!("Bearer {}", token.secret())
    }

    /// Escape a value for use inside a Drive query string literal.
    fn quote(value: &str) -> String {
        value.replace('\\', "\\\\").replace('\'', "\\'")
    }

    async fn upload_multipart(
        &self,
        token: &AccessToken,
        request: &UploadRequest,
    ) -> RemoteResult<DriveFile> {
        let url = format!("{}/files", DRIVE_UPLOAD_BASE);
        let metadata_json = serde_json::to_string(&Self::file_metadata(request))
            .map_err(|e| RemoteError::rejected(format!("Failed to serialize metadata: {}", e)))?;

        // Build multipart request
        let boundary = "CloudShelfBoundary";
        let mut body = Vec::with_capacity(request.data.len() + metadata_json.len() + 256);

        // Metadata part
        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
        body.extend_from_slice(metadata_json.as_bytes());
        body.extend_from_slice(b"\r\n");

        // Data part
        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(format!("Content-Type: {}\r\n\r\n", request.mime_type).as_bytes());
        body.extend_from_slice(&request.data);
        body.extend_from_slice(b"\r\n");

        // End boundary
        body.extend_from_slice(format!("--{}--", boundary).as_bytes());

        let response = self
            .http
            .post(&url)
            .header(header::AUTHORIZATION, Self::bearer(token))
            .header(
                header::CONTENT_TYPE,
                format!("multipart/related; boundary={}", boundary),
            )
            .query(&[("uploadType", "multipart"), ("fields", FILE_FIELDS)])
            .body(body)
            .send()
            .await
            .map_err(|e| RemoteError::network(format!("Failed to upload file: {}", e)))?;

        handle_response(response).await
    }

    /// Start a resumable upload session and return its URI.
    async fn start_resumable_upload(
        &self,
        token: &AccessToken,
        request: &UploadRequest,
    ) -> RemoteResult<String> {
        let url = format!("{}/files", DRIVE_UPLOAD_BASE);

        let response = self
            .http
            .post(&url)
            .header(header::AUTHORIZATION, Self::bearer(token))
            .header("X-Upload-Content-Type", request.mime_type.as_str())
            .header("X-Upload-Content-Length", request.data.len().to_string())
            .query(&[("uploadType", "resumable"), ("fields", FILE_FIELDS)])
            .json(&Self::file_metadata(request))
            .send()
            .await
            .map_err(|e| RemoteError::network(format!("Failed to start resumable upload: {}", e)))?;

        if let Some(err) = classify_failure(&response) {
            let body = response.text().await.unwrap_or_default();
            return Err(err.with_body(&body));
        }

        // Extract upload URI from Location header
        response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .ok_or_else(|| RemoteError::server("No upload URI in response"))
    }

    /// Upload one chunk. Returns the file once the last chunk is accepted.
    async fn upload_chunk(
        &self,
        upload_uri: &str,
        data: Bytes,
        start_byte: u64,
        total_size: u64,
    ) -> RemoteResult<Option<DriveFile>> {
        let end_byte = start_byte + data.len() as u64 - 1;
        let content_range = format!("bytes {}-{}/{}", start_byte, end_byte, total_size);

        let response = self
            .http
            .put(upload_uri)
            .header(header::CONTENT_LENGTH, data.len().to_string())
            .header(header::CONTENT_RANGE, content_range)
            .body(data)
            .send()
            .await
            .map_err(|e| RemoteError::network(format!("Failed to upload chunk: {}", e)))?;

        // 308 Resume Incomplete: more chunks needed
        if response.status() == StatusCode::PERMANENT_REDIRECT {
            return Ok(None);
        }

        handle_response(response).await.map(Some)
    }

    async fn upload_resumable(
        &self,
        token: &AccessToken,
        request: &UploadRequest,
    ) -> RemoteResult<DriveFile> {
        let upload_uri = self.start_resumable_upload(token, request).await?;
        let total_size = request.data.len() as u64;

        let mut offset = 0usize;
        while offset < request.data.len() {
            let end = (offset + CHUNK_SIZE).min(request.data.len());
            let chunk = request.data.slice(offset..end);
            if let Some(file) = self
                .upload_chunk(&upload_uri, chunk, offset as u64, total_size)
                .await?
            {
                return Ok(file);
            }
            offset = end;
        }

        Err(RemoteError::server("Upload did not complete"))
    }

    fn file_metadata(request: &UploadRequest) -> serde_json::Value {
        let mut metadata = serde_json::json!({
            "name": request.name,
            "mimeType": request.mime_type,
        });
        if let Some(folder) = &request.folder_id {
            metadata["parents"] = serde_json::json!([folder]);
        }
        metadata
    }
}

/// Trait for attaching a response body to an error message.
trait WithBody {
    fn with_body(self, body: &str) -> Self;
}

impl WithBody for RemoteError {
    fn with_body(mut self, body: &str) -> Self {
        // Drive reports quota exhaustion as 403 with a rate-limit reason.
        if self.kind == RemoteErrorKind::Rejected
            && (body.contains("rateLimitExceeded") || body.contains("userRateLimitExceeded"))
        {
            self.kind = RemoteErrorKind::RateLimited;
        }
        if !body.is_empty() {
            self.message = format!("{} - {}", self.message, body);
        }
        self
    }
}

/// Classify a non-success response, picking up any `Retry-After` hint.
fn classify_failure(response: &Response) -> Option<RemoteError> {
    let status = response.status();
    let mut err = RemoteError::from_status(status.as_u16(), format!("API error: {}", status))?;
    if let Some(secs) = response
        .headers()
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
    {
        err = err.with_retry_after(Duration::from_secs(secs));
    }
    Some(err)
}

/// Handle API response with error checking.
async fn handle_response<T: serde::de::DeserializeOwned>(response: Response) -> RemoteResult<T> {
    if let Some(err) = classify_failure(&response) {
        let body = response.text().await.unwrap_or_default();
        return Err(err.with_body(&body));
    }

    response
        .json()
        .await
        .map_err(|e| RemoteError::server(format!("Failed to parse response: {}", e)))
}

#[async_trait]
impl RemoteStore for DriveClient {
    fn name(&self) -> &str {
        "gdrive"
    }

    async fn find_folder(
        &self,
        token: &AccessToken,
        name: &str,
        parent: Option<&str>,
    ) -> RemoteResult<Option<RemoteObject>> {
        let url = format!("{}/files", DRIVE_API_BASE);
        let mut query = format!(
            "name = '{}' and mimeType = '{}' and trashed = false",
            Self::quote(name),
            FOLDER_MIME_TYPE
        );
        if let Some(parent_id) = parent {
            query.push_str(&format!(" and '{}' in parents", Self::quote(parent_id)));
        }
        let fields = format!("files({})", FILE_FIELDS);

        let response = self
            .http
            .get(&url)
            .header(header::AUTHORIZATION, Self::bearer(token))
            .query(&[
                ("q", query.as_str()),
                ("fields", fields.as_str()),
                ("orderBy", "createdTime"),
                ("pageSize", "1"),
            ])
            .send()
            .await
            .map_err(|e| RemoteError::network(format!("Failed to find folder: {}", e)))?;

        let list: FileListResponse = handle_response(response).await?;
        Ok(list.files.into_iter().next().map(RemoteObject::from))
    }

    async fn create_folder(
        &self,
        token: &AccessToken,
        name: &str,
        parent: Option<&str>,
    ) -> RemoteResult<RemoteObject> {
        let url = format!("{}/files", DRIVE_API_BASE);

        let mut metadata = serde_json::json!({
            "name": name,
            "mimeType": FOLDER_MIME_TYPE
        });
        if let Some(parent_id) = parent {
            metadata["parents"] = serde_json::json!([parent_id]);
        }

        let response = self
            .http
            .post(&url)
            .header(header::AUTHORIZATION, Self::bearer(token))
            .query(&[("fields", FILE_FIELDS)])
            .json(&metadata)
            .send()
            .await
            .map_err(|e| RemoteError::network(format!("Failed to create folder: {}", e)))?;

        let folder: DriveFile = handle_response(response).await?;
        Ok(folder.into())
    }

    async fn upload(
        &self,
        token: &AccessToken,
        request: UploadRequest,
    ) -> RemoteResult<RemoteObject> {
        let file = if request.data.len() <= MULTIPART_LIMIT {
            self.upload_multipart(token, &request).await?
        } else {
            self.upload_resumable(token, &request).await?
        };
        Ok(file.into())
    }

    async fn download(
        &self,
        token: &AccessToken,
        file_id: &str,
        range: Option<ByteRange>,
    ) -> RemoteResult<Bytes> {
        let url = format!("{}/files/{}", DRIVE_API_BASE, file_id);

        let mut request = self
            .http
            .get(&url)
            .header(header::AUTHORIZATION, Self::bearer(token))
            .query(&[("alt", "media")]);
        if let Some(range) = range {
            request = request.header(header::RANGE, range.to_header());
        }

        let response = request
            .send()
            .await
            .map_err(|e| RemoteError::network(format!("Failed to download file: {}", e)))?;

        if let Some(err) = classify_failure(&response) {
            let body = response.text().await.unwrap_or_default();
            return Err(err.with_body(&body));
        }

        let ranged = response.status() == StatusCode::PARTIAL_CONTENT;
        let data = response
            .bytes()
            .await
            .map_err(|e| RemoteError::network(format!("Failed to read download response: {}", e)))?;

        // Server ignored the Range header: cut the slice ourselves.
        match range {
            Some(range) if !ranged => {
                let len = data.len() as u64;
                if range.start >= len {
                    return Err(RemoteError::rejected("Requested range not satisfiable"));
                }
                let end = range.end.min(len - 1);
                Ok(data.slice(range.start as usize..=end as usize))
            }
            _ => Ok(data),
        }
    }

    async fn metadata(
        &self,
        token: &AccessToken,
        file_id: &str,
    ) -> RemoteResult<Option<RemoteObject>> {
        let url = format!("{}/files/{}", DRIVE_API_BASE, file_id);

        let response = self
            .http
            .get(&url)
            .header(header::AUTHORIZATION, Self::bearer(token))
            .query(&[("fields", FILE_FIELDS)])
            .send()
            .await
            .map_err(|e| RemoteError::network(format!("Failed to get file: {}", e)))?;

        match handle_response::<DriveFile>(response).await {
            Ok(file) => Ok(Some(file.into())),
            Err(err) if err.kind == RemoteErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn account(&self, token: &AccessToken) -> RemoteResult<AccountInfo> {
        let url = format!("{}/about", DRIVE_API_BASE);

        let response = self
            .http
            .get(&url)
            .header(header::AUTHORIZATION, Self::bearer(token))
            .query(&[("fields", "user(displayName,emailAddress)")])
            .send()
            .await
            .map_err(|e| RemoteError::network(format!("Failed to get account info: {}", e)))?;

        let about: AboutResponse = handle_response(response).await?;
        Ok(AccountInfo {
            display_name: about.user.display_name,
            email: about.user.email_address,
        })
    }
}
