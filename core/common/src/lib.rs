//! Common utilities and types shared across CloudShelf crates.
//!
//! This crate provides the error taxonomy, the domain model and the backoff
//! executor that wraps every remote call.

pub mod digest;
pub mod error;
pub mod retry;
pub mod types;

pub use digest::sha256_hex;
pub use error::{Error, RemoteError, RemoteErrorKind, RemoteResult, Result};
pub use retry::{BackoffConfig, BackoffExecutor};
pub use types::{
    AccessLogEntry, AccessMode, AccessToken, CallerIdentity, Credential, CredentialState, FileId,
    FileRef, FileTypeConfig, FileTypeWhitelist, ModelConfig, ReconcileAction, ReconcileLogEntry,
    SessionStatus, SyncConfig, SyncLogEntry, SyncOutcome, SyncSession, SyncStatus, SyncType,
};
