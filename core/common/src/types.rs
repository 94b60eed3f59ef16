//! Domain types shared by the sync engine, reconciliation and the proxy.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use zeroize::Zeroize;

use crate::{Error, Result};

/// Access tokens are treated as expired this long before their real expiry.
pub const TOKEN_REFRESH_MARGIN_SECS: i64 = 300;

/// Identifier of a host file record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(pub i64);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for FileId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse::<i64>()
            .map(FileId)
            .map_err(|_| Error::Validation(format!("invalid file id: {s}")))
    }
}

/// Opaque identity of whoever asks the proxy for bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallerIdentity(String);

impl CallerIdentity {
    /// Wrap a caller name.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identity used when the request carries none.
    pub fn anonymous() -> Self {
        Self("anonymous".to_string())
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Bearer token handed to remote calls. Zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize)]
#[zeroize(drop)]
pub struct AccessToken(String);

impl AccessToken {
    /// Wrap a raw token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Raw token for the `Authorization` header.
    pub fn secret(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccessToken([REDACTED])")
    }
}

/// Lifecycle state of a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialState {
    /// Client id/secret entered, never authorized.
    Draft,
    /// Authorization URL issued, waiting for the callback.
    Pending,
    /// Tokens present and usable.
    Authorized,
    /// Access token stale, refresh pending.
    Expired,
    /// Refresh failed; a human must re-authorize.
    Error,
}

impl fmt::Display for CredentialState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CredentialState::Draft => "draft",
            CredentialState::Pending => "pending",
            CredentialState::Authorized => "authorized",
            CredentialState::Expired => "expired",
            CredentialState::Error => "error",
        };
        f.write_str(s)
    }
}

/// OAuth client registration plus the tokens it obtained.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credential {
    /// Name the host refers to this credential by.
    pub name: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_expiry: Option<DateTime<Utc>>,
    pub state: CredentialState,
    /// One-time nonce issued by the last authorization request.
    #[serde(default)]
    pub pending_nonce: Option<String>,
    /// Redirect URI the pending authorization was issued for.
    #[serde(default)]
    pub redirect_uri: Option<String>,
}

impl Credential {
    /// Create a draft credential.
    pub fn new(
        name: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            access_token: None,
            refresh_token: None,
            token_expiry: None,
            state: CredentialState::Draft,
            pending_nonce: None,
            redirect_uri: None,
        }
    }

    /// Seconds until the access token expires. Negative once expired,
    /// zero when there is no token.
    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> i64 {
        match (&self.access_token, self.token_expiry) {
            (Some(_), Some(expiry)) => (expiry - now).num_seconds(),
            _ => 0,
        }
    }

    /// Whether the access token can be used without refreshing.
    pub fn token_is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.state == CredentialState::Authorized
            && self.remaining_seconds(now) > TOKEN_REFRESH_MARGIN_SECS
    }

    /// Whether client id and secret are both filled in.
    pub fn has_client_registration(&self) -> bool {
        !self.client_id.trim().is_empty() && !self.client_secret.trim().is_empty()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("name", &self.name)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("access_token", &self.access_token.as_ref().map(|_| "[REDACTED]"))
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("token_expiry", &self.token_expiry)
            .field("state", &self.state)
            .finish()
    }
}

/// Global sync settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Name of the credential used for every remote call.
    pub credential_ref: String,
    pub is_active: bool,
    pub auto_sync: bool,
    /// Interval between automatic runs, in seconds.
    pub sync_frequency_secs: u64,
    pub delete_local_after_sync: bool,
    pub replace_local_with_remote_urls: bool,
    /// Remote folder under which per-model folders are created.
    pub remote_root_folder_id: Option<String>,
}

impl SyncConfig {
    /// Interval between automatic runs.
    pub fn sync_frequency(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sync_frequency_secs.max(60))
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            credential_ref: "default".to_string(),
            is_active: true,
            auto_sync: false,
            sync_frequency_secs: 86_400,
            delete_local_after_sync: false,
            replace_local_with_remote_urls: false,
            remote_root_folder_id: None,
        }
    }
}

/// Which host entity type gets synced and where.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub entity_type: String,
    #[serde(default = "default_attachment_field")]
    pub attachment_field_name: String,
    /// Child folder under the remote root. Empty means the root itself.
    #[serde(default)]
    pub remote_folder_name: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_attachment_field() -> String {
    "attachment_ids".to_string()
}

fn default_true() -> bool {
    true
}

impl ModelConfig {
    /// Active model config storing files under `remote_folder_name`.
    pub fn new(entity_type: impl Into<String>, remote_folder_name: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            attachment_field_name: default_attachment_field(),
            remote_folder_name: remote_folder_name.into(),
            is_active: true,
        }
    }
}

/// Whitelisted file extension with a size cap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileTypeConfig {
    pub extension: String,
    pub max_size_mb: f64,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub description: String,
}

impl FileTypeConfig {
    /// Create an active entry; the extension is normalized.
    pub fn new(extension: &str, max_size_mb: f64) -> Self {
        Self {
            extension: normalize_extension(extension),
            max_size_mb,
            is_active: true,
            description: String::new(),
        }
    }

    /// Attach a description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Size cap in bytes.
    pub fn max_size_bytes(&self) -> u64 {
        (self.max_size_mb * 1024.0 * 1024.0) as u64
    }

    /// Seed whitelist used when nothing is configured.
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::new("pdf", 50.0).with_description("PDF documents"),
            Self::new("doc", 25.0).with_description("Word documents (legacy)"),
            Self::new("docx", 25.0).with_description("Word documents"),
            Self::new("xls", 25.0).with_description("Excel spreadsheets (legacy)"),
            Self::new("xlsx", 25.0).with_description("Excel spreadsheets"),
            Self::new("jpg", 10.0).with_description("JPEG images"),
            Self::new("jpeg", 10.0).with_description("JPEG images"),
            Self::new("png", 10.0).with_description("PNG images"),
            Self::new("txt", 5.0).with_description("Text files"),
        ]
    }
}

/// Lower-case an extension and strip any leading dots.
pub fn normalize_extension(ext: &str) -> String {
    ext.trim().trim_start_matches('.').to_lowercase()
}

/// Extension of a file name, normalized. Empty when there is none.
pub fn extension_of(name: &str) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => normalize_extension(ext),
        _ => String::new(),
    }
}

/// Active extension whitelist resolved to byte limits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileTypeWhitelist {
    limits: HashMap<String, u64>,
}

impl FileTypeWhitelist {
    /// Build the whitelist from configured entries, ignoring inactive ones.
    ///
    /// # Errors
    /// - `Validation` if an extension is empty, a size cap is not positive,
    ///   or an extension appears twice
    pub fn from_configs(configs: &[FileTypeConfig]) -> Result<Self> {
        let mut limits = HashMap::new();
        for config in configs.iter().filter(|c| c.is_active) {
            let ext = normalize_extension(&config.extension);
            if ext.is_empty() {
                return Err(Error::Validation("file type extension is empty".to_string()));
            }
            if config.max_size_mb <= 0.0 {
                return Err(Error::Validation(format!(
                    "max size for .{ext} must be positive"
                )));
            }
            if limits.insert(ext.clone(), config.max_size_bytes()).is_some() {
                return Err(Error::Validation(format!(
                    "extension .{ext} is configured twice"
                )));
            }
        }
        Ok(Self { limits })
    }

    /// Whether a file with this extension and size may be synced.
    pub fn allows(&self, extension: &str, size_bytes: u64) -> bool {
        self.limits
            .get(&normalize_extension(extension))
            .is_some_and(|max| size_bytes <= *max)
    }

    /// Allowed extensions with their byte limits.
    pub fn limits(&self) -> &HashMap<String, u64> {
        &self.limits
    }

    pub fn is_empty(&self) -> bool {
        self.limits.is_empty()
    }
}

/// Sync lifecycle of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Local,
    Processing,
    Synced,
    Error,
}

impl SyncStatus {
    /// Statuses a sync batch may claim from.
    pub const CLAIMABLE: [SyncStatus; 2] = [SyncStatus::Local, SyncStatus::Error];

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Local => "local",
            SyncStatus::Processing => "processing",
            SyncStatus::Synced => "synced",
            SyncStatus::Error => "error",
        }
    }
}

impl FromStr for SyncStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(SyncStatus::Local),
            "processing" => Ok(SyncStatus::Processing),
            "synced" => Ok(SyncStatus::Synced),
            "error" => Ok(SyncStatus::Error),
            other => Err(Error::Serialization(format!("unknown sync status: {other}"))),
        }
    }
}

/// Where the host points readers of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    /// Host serves its own bytes.
    Local,
    /// Host redirects readers to the proxy endpoint.
    RemoteRedirect,
}

impl AccessMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessMode::Local => "local",
            AccessMode::RemoteRedirect => "remote_redirect",
        }
    }
}

impl FromStr for AccessMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(AccessMode::Local),
            "remote_redirect" => Ok(AccessMode::RemoteRedirect),
            other => Err(Error::Serialization(format!("unknown access mode: {other}"))),
        }
    }
}

/// Host file record as seen by the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRef {
    pub id: FileId,
    pub entity_type: String,
    pub entity_id: i64,
    pub name: String,
    pub extension: String,
    pub size_bytes: u64,
    pub mime_type: Option<String>,
    pub local_bytes_present: bool,
    pub remote_file_id: Option<String>,
    /// SHA-256 of the content, hex encoded, once verified against the remote.
    pub content_hash: Option<String>,
    pub sync_status: SyncStatus,
    pub synced_at: Option<DateTime<Utc>>,
    pub access_mode: AccessMode,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub claimed_at: Option<DateTime<Utc>>,
}

impl FileRef {
    /// A freshly stored local file that has never been synced.
    pub fn new_local(
        id: FileId,
        entity_type: impl Into<String>,
        entity_id: i64,
        name: impl Into<String>,
        size_bytes: u64,
    ) -> Self {
        let name = name.into();
        Self {
            id,
            entity_type: entity_type.into(),
            entity_id,
            extension: extension_of(&name),
            name,
            size_bytes,
            mime_type: None,
            local_bytes_present: true,
            remote_file_id: None,
            content_hash: None,
            sync_status: SyncStatus::Local,
            synced_at: None,
            access_mode: AccessMode::Local,
            last_checked_at: None,
            claimed_at: None,
        }
    }

    /// Size in megabytes, for logs.
    pub fn size_mb(&self) -> f64 {
        self.size_bytes as f64 / (1024.0 * 1024.0)
    }

    /// Content type to advertise, falling back to a guess from the extension.
    pub fn content_type(&self) -> String {
        if let Some(mime) = &self.mime_type {
            return mime.clone();
        }
        match self.extension.as_str() {
            "pdf" => "application/pdf",
            "doc" => "application/msword",
            "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
            "xls" => "application/vnd.ms-excel",
            "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
            "jpg" | "jpeg" => "image/jpeg",
            "png" => "image/png",
            "txt" => "text/plain",
            _ => "application/octet-stream",
        }
        .to_string()
    }
}

/// What triggered a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncType {
    Manual,
    Automatic,
    CompleteBatch,
}

impl SyncType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncType::Manual => "manual",
            SyncType::Automatic => "automatic",
            SyncType::CompleteBatch => "complete_batch",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    Success,
    Error,
}

/// One per-file sync attempt. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncLogEntry {
    pub timestamp: DateTime<Utc>,
    pub file_id: FileId,
    pub file_name: String,
    pub entity_type: String,
    pub sync_type: SyncType,
    pub outcome: SyncOutcome,
    pub error_message: Option<String>,
    pub size_mb: f64,
    pub remote_file_id: Option<String>,
}

impl SyncLogEntry {
    /// Successful upload of `file`.
    pub fn success(file: &FileRef, sync_type: SyncType, remote_file_id: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            file_id: file.id,
            file_name: file.name.clone(),
            entity_type: file.entity_type.clone(),
            sync_type,
            outcome: SyncOutcome::Success,
            error_message: None,
            size_mb: file.size_mb(),
            remote_file_id: Some(remote_file_id.to_string()),
        }
    }

    /// Failed attempt on `file`.
    pub fn failure(file: &FileRef, sync_type: SyncType, error: &Error) -> Self {
        Self {
            timestamp: Utc::now(),
            file_id: file.id,
            file_name: file.name.clone(),
            entity_type: file.entity_type.clone(),
            sync_type,
            outcome: SyncOutcome::Error,
            error_message: Some(error.to_string()),
            size_mb: file.size_mb(),
            remote_file_id: None,
        }
    }
}

/// One proxy request, whatever its outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessLogEntry {
    pub timestamp: DateTime<Utc>,
    pub file_id: FileId,
    pub caller: CallerIdentity,
    pub cache_hit: bool,
    pub bytes_served: u64,
    pub duration_ms: u64,
    pub http_status: u16,
    pub range: Option<String>,
}

/// Corrective action taken by reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileAction {
    /// Remote copy missing; file goes back to `local` for re-upload.
    ResetToLocal,
    /// Remote copy missing and local bytes already cleared.
    RemoteLost,
    /// Host access pointer switched to the proxy.
    RedirectFlipped,
    /// Remote checksum no longer matches and nothing can be repaired.
    IntegrityAlert,
    /// Claim left behind by an interrupted batch was released.
    ClaimReleased,
}

impl ReconcileAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileAction::ResetToLocal => "reset_to_local",
            ReconcileAction::RemoteLost => "remote_lost",
            ReconcileAction::RedirectFlipped => "redirect_flipped",
            ReconcileAction::IntegrityAlert => "integrity_alert",
            ReconcileAction::ClaimReleased => "claim_released",
        }
    }
}

/// Logged corrective action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileLogEntry {
    pub timestamp: DateTime<Utc>,
    pub file_id: FileId,
    pub action: ReconcileAction,
    pub detail: String,
}

impl ReconcileLogEntry {
    pub fn new(file_id: FileId, action: ReconcileAction, detail: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            file_id,
            action,
            detail: detail.into(),
        }
    }
}

/// Progress of a complete sync session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    InProgress,
    Completed,
    /// Stopped early because the credential became unusable.
    Aborted,
}

/// Batch-by-batch record of a complete sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSession {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub batches: u32,
    pub total_processed: u64,
    pub total_success: u64,
    pub total_errors: u64,
    pub bytes_freed: u64,
}

impl SyncSession {
    /// Start a session.
    pub fn start(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            started_at: Utc::now(),
            ended_at: None,
            status: SessionStatus::InProgress,
            batches: 0,
            total_processed: 0,
            total_success: 0,
            total_errors: 0,
            bytes_freed: 0,
        }
    }

    /// Close the session with a final status.
    pub fn finish(&mut self, status: SessionStatus) {
        self.status = status;
        self.ended_at = Some(Utc::now());
    }
}

/// Convert a std duration into a chrono one, saturating.
pub fn chrono_duration(duration: std::time::Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or(ChronoDuration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_extension() {
        assert_eq!(normalize_extension(".PDF"), "pdf");
        assert_eq!(normalize_extension("  ..Docx "), "docx");
        assert_eq!(normalize_extension("txt"), "txt");
    }

    #[test]
    fn test_extension_of() {
        assert_eq!(extension_of("report.final.PDF"), "pdf");
        assert_eq!(extension_of("README"), "");
        assert_eq!(extension_of(".bashrc"), "");
    }

    #[test]
    fn test_whitelist_limits() {
        let whitelist = FileTypeWhitelist::from_configs(&[
            FileTypeConfig::new(".pdf", 1.0),
            FileTypeConfig {
                is_active: false,
                ..FileTypeConfig::new("docx", 10.0)
            },
        ])
        .unwrap();

        assert!(whitelist.allows("PDF", 1024 * 1024));
        assert!(!whitelist.allows("pdf", 1024 * 1024 + 1));
        assert!(!whitelist.allows("docx", 10));
        assert!(!whitelist.allows("exe", 10));
    }

    #[test]
    fn test_whitelist_rejects_duplicates() {
        let result = FileTypeWhitelist::from_configs(&[
            FileTypeConfig::new("pdf", 1.0),
            FileTypeConfig::new(".PDF", 2.0),
        ]);
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn test_whitelist_rejects_non_positive_size() {
        let result = FileTypeWhitelist::from_configs(&[FileTypeConfig::new("pdf", 0.0)]);
        assert!(result.is_err());
    }

    #[test]
    fn test_default_file_types_are_valid() {
        let whitelist = FileTypeWhitelist::from_configs(&FileTypeConfig::defaults()).unwrap();
        assert!(whitelist.allows("pdf", 50 * 1024 * 1024));
        assert!(!whitelist.allows("txt", 6 * 1024 * 1024));
    }

    #[test]
    fn test_credential_freshness() {
        let now = Utc::now();
        let mut cred = Credential::new("main", "id", "secret");
        assert!(!cred.token_is_fresh(now));

        cred.state = CredentialState::Authorized;
        cred.access_token = Some("token".to_string());
        cred.token_expiry = Some(now + ChronoDuration::minutes(2));
        assert!(!cred.token_is_fresh(now));

        cred.token_expiry = Some(now + ChronoDuration::minutes(30));
        assert!(cred.token_is_fresh(now));
        assert!(cred.remaining_seconds(now) > 1700);
    }

    #[test]
    fn test_credential_debug_redacts_secrets() {
        let mut cred = Credential::new("main", "id", "hunter2");
        cred.access_token = Some("tok-123".to_string());
        let debug = format!("{:?}", cred);
        assert!(!debug.contains("hunter2"));
        assert!(!debug.contains("tok-123"));
    }

    #[test]
    fn test_sync_status_round_trip_str() {
        for status in [
            SyncStatus::Local,
            SyncStatus::Processing,
            SyncStatus::Synced,
            SyncStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<SyncStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<SyncStatus>().is_err());
    }

    #[test]
    fn test_file_id_parse() {
        assert_eq!("42".parse::<FileId>().unwrap(), FileId(42));
        assert!("abc".parse::<FileId>().is_err());
    }

    #[test]
    fn test_file_ref_content_type_guess() {
        let file = FileRef::new_local(FileId(1), "invoice", 7, "scan.PNG", 10);
        assert_eq!(file.extension, "png");
        assert_eq!(file.content_type(), "image/png");
    }
}
