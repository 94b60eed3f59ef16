//! Google Drive remote store.
//!
//! - OAuth2 token endpoint for the credential lifecycle
//! - Multipart uploads for small files, resumable sessions for large ones
//! - SHA-256 checksums reported with every uploaded file

pub mod client;
pub mod oauth;

pub use client::{DriveClient, DriveFile};
pub use oauth::GoogleOAuth;
