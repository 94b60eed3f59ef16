//! CloudShelf file-serving proxy.
//!
//! Serves host attachments to authorized callers, whether their bytes still
//! live on the host or were moved to the remote store. Remote objects are
//! kept in a size-bounded disk cache and byte ranges are honored.

pub mod cache;
pub mod content;
pub mod range;
pub mod routes;
pub mod service;

#[cfg(test)]
mod testing;

pub use cache::{BlobReader, CacheConfig, CacheStats, CachedBlob, DiskCache};
pub use content::{ContentSource, HostContentSource};
pub use range::{parse_range, resolve_range, RangeOutcome, RangeSpec};
pub use routes::{router, serve, AppState, CALLER_HEADER};
pub use service::{status_for, FileProxy, ServeBody, ServeResponse, RETRY_AFTER_SECS};
