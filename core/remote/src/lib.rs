//! Remote object store abstraction for CloudShelf.
//!
//! This crate provides the [`RemoteStore`] trait used by sync, reconciliation
//! and the proxy, the Google Drive implementation of it, and the
//! [`TokenManager`] that keeps the credential for those calls valid.
//!
//! # Design Principles
//! - Explicit credentials: every remote call receives its access token
//! - Typed failures: calls return a classified `RemoteError`, retries happen
//!   in the backoff executor, never inside a client
//! - Test doubles: [`MemoryRemote`] and [`MemoryTokenEndpoint`] with fault
//!   injection

pub mod gdrive;
pub mod memory;
pub mod store;
pub mod token;

pub use memory::{MemoryRemote, MemoryTokenEndpoint};
pub use store::{AccountInfo, ByteRange, RemoteObject, RemoteStore, UploadRequest};
pub use token::{CredentialStore, TokenEndpoint, TokenGrant, TokenManager, TokenStatus};
