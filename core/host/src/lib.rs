//! Host application seams for CloudShelf.
//!
//! The sync engine and the proxy never touch host records directly. They go
//! through the ports defined here:
//! - File adapters: read and clear local bytes per entity type
//! - Status store: atomic claims and sync state transitions
//! - Access control and audit trail
//!
//! A SQLite status store and a filesystem adapter cover standalone
//! deployments; `MemoryHost` backs tests.

pub mod acl;
pub mod filestore;
pub mod memory;
pub mod ports;
pub mod registry;
pub mod sqlite;

pub use acl::AllowListAcl;
pub use filestore::FilestoreAdapter;
pub use memory::MemoryHost;
pub use ports::{
    AccessControl, AuditLog, CandidateQuery, FileAdapter, FileStatusStore, ReconcileQuery,
    SyncedUpdate,
};
pub use registry::AdapterRegistry;
pub use sqlite::SqliteStore;
