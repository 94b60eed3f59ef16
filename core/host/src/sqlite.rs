//! SQLite-backed status store and audit log.
//!
//! Reference host store for standalone deployments. File records, sync
//! state and the audit tables live in one database file.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use cloudshelf_common::{
    AccessLogEntry, AccessMode, Error, FileId, FileRef, ReconcileLogEntry, Result, SyncLogEntry,
    SyncSession, SyncStatus,
};

use crate::ports::{AuditLog, CandidateQuery, FileStatusStore, ReconcileQuery, SyncedUpdate};

const FILE_COLUMNS: &str = "id, entity_type, entity_id, name, extension, size_bytes, mime_type, \
     local_bytes_present, remote_file_id, content_hash, sync_status, synced_at, access_mode, \
     last_checked_at, claimed_at";

/// Status store and audit log on top of SQLite.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Create or open a store database.
    ///
    /// # Errors
    /// - Database creation or migration failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path).map_err(store_err)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS file_refs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_type TEXT NOT NULL,
                entity_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                extension TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                mime_type TEXT,
                local_bytes_present INTEGER NOT NULL DEFAULT 1,
                remote_file_id TEXT,
                content_hash TEXT,
                sync_status TEXT NOT NULL DEFAULT 'local',
                synced_at TEXT,
                access_mode TEXT NOT NULL DEFAULT 'local',
                last_checked_at TEXT,
                claimed_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_file_refs_status
                ON file_refs(entity_type, sync_status);

            CREATE TABLE IF NOT EXISTS sync_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                file_id INTEGER NOT NULL,
                file_name TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                sync_type TEXT NOT NULL,
                outcome TEXT NOT NULL,
                error_message TEXT,
                size_mb REAL NOT NULL,
                remote_file_id TEXT
            );

            CREATE TABLE IF NOT EXISTS access_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                file_id INTEGER NOT NULL,
                caller TEXT NOT NULL,
                cache_hit INTEGER NOT NULL,
                bytes_served INTEGER NOT NULL,
                duration_ms INTEGER NOT NULL,
                http_status INTEGER NOT NULL,
                range TEXT
            );

            CREATE TABLE IF NOT EXISTS reconcile_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                file_id INTEGER NOT NULL,
                action TEXT NOT NULL,
                detail TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sync_sessions (
                id TEXT PRIMARY KEY,
                started_at TEXT NOT NULL,
                ended_at TEXT,
                status TEXT NOT NULL,
                batches INTEGER NOT NULL,
                total_processed INTEGER NOT NULL,
                total_success INTEGER NOT NULL,
                total_errors INTEGER NOT NULL,
                bytes_freed INTEGER NOT NULL
            );
            "#,
        )
        .map_err(store_err)?;

        info!("Status store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Store("status store lock poisoned".to_string()))
    }

    /// Register a new local file and return its record with the assigned id.
    pub fn create_file(
        &self,
        entity_type: &str,
        entity_id: i64,
        name: &str,
        size_bytes: u64,
        mime_type: Option<&str>,
    ) -> Result<FileRef> {
        let mut file = FileRef::new_local(FileId(0), entity_type, entity_id, name, size_bytes);
        file.mime_type = mime_type.map(str::to_string);

        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO file_refs (entity_type, entity_id, name, extension, size_bytes, mime_type)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                file.entity_type,
                file.entity_id,
                file.name,
                file.extension,
                file.size_bytes as i64,
                file.mime_type,
            ],
        )
        .map_err(store_err)?;
        file.id = FileId(conn.last_insert_rowid());

        debug!(file_id = %file.id, "Registered file {}", file.name);
        Ok(file)
    }

    /// Insert or replace a complete record.
    pub fn upsert_file(&self, file: &FileRef) -> Result<()> {
        self.conn()?
            .execute(
                &format!(
                    "INSERT OR REPLACE INTO file_refs ({FILE_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
                ),
                params![
                    file.id.0,
                    file.entity_type,
                    file.entity_id,
                    file.name,
                    file.extension,
                    file.size_bytes as i64,
                    file.mime_type,
                    file.local_bytes_present,
                    file.remote_file_id,
                    file.content_hash,
                    file.sync_status.as_str(),
                    file.synced_at.map(to_sql_time),
                    file.access_mode.as_str(),
                    file.last_checked_at.map(to_sql_time),
                    file.claimed_at.map(to_sql_time),
                ],
            )
            .map_err(store_err)?;
        Ok(())
    }

    /// Candidate selection pushed down into SQL.
    pub fn list_candidates(&self, query: &CandidateQuery) -> Result<Vec<FileRef>> {
        if query.whitelist.is_empty() || query.statuses.is_empty() || query.limit == 0 {
            return Ok(Vec::new());
        }

        let mut values: Vec<Value> = vec![Value::Text(query.entity_type.clone())];
        let statuses = query
            .statuses
            .iter()
            .map(|status| {
                values.push(Value::Text(status.as_str().to_string()));
                "?"
            })
            .collect::<Vec<_>>()
            .join(", ");

        let mut limits: Vec<(&String, &u64)> = query.whitelist.limits().iter().collect();
        limits.sort();
        let types = limits
            .into_iter()
            .map(|(ext, max)| {
                values.push(Value::Text(ext.clone()));
                values.push(Value::Integer(*max as i64));
                "(extension = ? AND size_bytes <= ?)"
            })
            .collect::<Vec<_>>()
            .join(" OR ");

        let mut sql = format!(
            "SELECT {FILE_COLUMNS} FROM file_refs \
             WHERE entity_type = ? AND local_bytes_present = 1 \
             AND sync_status IN ({statuses}) AND ({types})"
        );
        if !query.exclude.is_empty() {
            let mut excluded: Vec<&FileId> = query.exclude.iter().collect();
            excluded.sort();
            let marks = excluded
                .into_iter()
                .map(|id| {
                    values.push(Value::Integer(id.0));
                    "?"
                })
                .collect::<Vec<_>>()
                .join(", ");
            sql.push_str(&format!(" AND id NOT IN ({marks})"));
        }
        sql.push_str(" ORDER BY id LIMIT ?");
        values.push(Value::Integer(query.limit as i64));

        self.query_files(&sql, values)
    }

    fn query_files(&self, sql: &str, values: Vec<Value>) -> Result<Vec<FileRef>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql).map_err(store_err)?;
        let rows = stmt
            .query_map(params_from_iter(values), RawFile::from_row)
            .map_err(store_err)?;

        let mut files = Vec::new();
        for row in rows {
            files.push(row.map_err(store_err)?.into_file_ref()?);
        }
        Ok(files)
    }

    /// Execute an update against one file; a missing row is `NotFound`.
    fn update_file(&self, id: FileId, sql: &str, values: Vec<Value>) -> Result<()> {
        let changed = self
            .conn()?
            .execute(sql, params_from_iter(values))
            .map_err(store_err)?;
        if changed == 0 {
            return Err(Error::NotFound(format!("file {id}")));
        }
        Ok(())
    }

    /// Most recent sync log entries, newest first.
    pub fn recent_sync_log(&self, limit: usize) -> Result<Vec<SyncLogEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT timestamp, file_id, file_name, entity_type, sync_type, outcome,
                       error_message, size_mb, remote_file_id
                FROM sync_log ORDER BY id DESC LIMIT ?1
                "#,
            )
            .map_err(store_err)?;
        let rows = stmt
            .query_map([limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, f64>(7)?,
                    row.get::<_, Option<String>>(8)?,
                ))
            })
            .map_err(store_err)?;

        let mut entries = Vec::new();
        for row in rows {
            let (
                timestamp,
                file_id,
                file_name,
                entity_type,
                sync_type,
                outcome,
                error_message,
                size_mb,
                remote_file_id,
            ) = row.map_err(store_err)?;
            entries.push(SyncLogEntry {
                timestamp: from_sql_time(&timestamp)?,
                file_id: FileId(file_id),
                file_name,
                entity_type,
                sync_type: parse_enum(&sync_type)?,
                outcome: parse_enum(&outcome)?,
                error_message,
                size_mb,
                remote_file_id,
            });
        }
        Ok(entries)
    }

    /// Reconciliation actions for one file, oldest first.
    pub fn reconcile_history(&self, id: FileId) -> Result<Vec<ReconcileLogEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT timestamp, action, detail FROM reconcile_log
                 WHERE file_id = ?1 ORDER BY id",
            )
            .map_err(store_err)?;
        let rows = stmt
            .query_map([id.0], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(store_err)?;

        let mut entries = Vec::new();
        for row in rows {
            let (timestamp, action, detail) = row.map_err(store_err)?;
            entries.push(ReconcileLogEntry {
                timestamp: from_sql_time(&timestamp)?,
                file_id: id,
                action: parse_enum(&action)?,
                detail,
            });
        }
        Ok(entries)
    }

    /// Number of access log rows.
    pub fn access_log_count(&self) -> Result<u64> {
        let count: i64 = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM access_log", [], |row| row.get(0))
            .map_err(store_err)?;
        Ok(count as u64)
    }

    /// Load a complete-sync session.
    pub fn session(&self, id: &str) -> Result<Option<SyncSession>> {
        let row = self
            .conn()?
            .query_row(
                r#"
                SELECT started_at, ended_at, status, batches, total_processed,
                       total_success, total_errors, bytes_freed
                FROM sync_sessions WHERE id = ?1
                "#,
                [id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, i64>(7)?,
                    ))
                },
            )
            .optional()
            .map_err(store_err)?;

        let Some((started_at, ended_at, status, batches, processed, success, errors, freed)) = row
        else {
            return Ok(None);
        };
        Ok(Some(SyncSession {
            id: id.to_string(),
            started_at: from_sql_time(&started_at)?,
            ended_at: ended_at.as_deref().map(from_sql_time).transpose()?,
            status: parse_enum(&status)?,
            batches: batches as u32,
            total_processed: processed as u64,
            total_success: success as u64,
            total_errors: errors as u64,
            bytes_freed: freed as u64,
        }))
    }
}

#[async_trait]
impl FileStatusStore for SqliteStore {
    async fn get(&self, id: FileId) -> Result<Option<FileRef>> {
        let sql = format!("SELECT {FILE_COLUMNS} FROM file_refs WHERE id = ?");
        Ok(self.query_files(&sql, vec![Value::Integer(id.0)])?.pop())
    }

    async fn claim(&self, id: FileId) -> Result<bool> {
        let changed = self
            .conn()?
            .execute(
                r#"
                UPDATE file_refs SET sync_status = 'processing', claimed_at = ?2
                WHERE id = ?1 AND sync_status IN ('local', 'error')
                "#,
                params![id.0, to_sql_time(Utc::now())],
            )
            .map_err(store_err)?;
        Ok(changed == 1)
    }

    async fn mark_synced(&self, id: FileId, update: SyncedUpdate) -> Result<()> {
        let synced_at = to_sql_time(update.synced_at);
        self.update_file(
            id,
            r#"
            UPDATE file_refs SET sync_status = 'synced', remote_file_id = ?, content_hash = ?,
                synced_at = ?, last_checked_at = ?, access_mode = ?, claimed_at = NULL
            WHERE id = ?
            "#,
            vec![
                Value::Text(update.remote_file_id),
                update.content_hash.map_or(Value::Null, Value::Text),
                Value::Text(synced_at.clone()),
                Value::Text(synced_at),
                Value::Text(update.access_mode.as_str().to_string()),
                Value::Integer(id.0),
            ],
        )
    }

    async fn mark_error(&self, id: FileId) -> Result<()> {
        self.update_file(
            id,
            "UPDATE file_refs SET sync_status = 'error', claimed_at = NULL WHERE id = ?",
            vec![Value::Integer(id.0)],
        )
    }

    async fn mark_local_cleared(&self, id: FileId) -> Result<()> {
        self.update_file(
            id,
            "UPDATE file_refs SET local_bytes_present = 0 WHERE id = ?",
            vec![Value::Integer(id.0)],
        )
    }

    async fn reset_to_local(&self, id: FileId) -> Result<()> {
        self.update_file(
            id,
            r#"
            UPDATE file_refs SET sync_status = 'local', remote_file_id = NULL,
                content_hash = NULL, synced_at = NULL, access_mode = 'local',
                claimed_at = NULL
            WHERE id = ?
            "#,
            vec![Value::Integer(id.0)],
        )
    }

    async fn set_access_mode(&self, id: FileId, mode: AccessMode) -> Result<()> {
        self.update_file(
            id,
            "UPDATE file_refs SET access_mode = ? WHERE id = ?",
            vec![Value::Text(mode.as_str().to_string()), Value::Integer(id.0)],
        )
    }

    async fn mark_checked(&self, id: FileId, at: DateTime<Utc>) -> Result<()> {
        self.update_file(
            id,
            "UPDATE file_refs SET last_checked_at = ? WHERE id = ?",
            vec![Value::Text(to_sql_time(at)), Value::Integer(id.0)],
        )
    }

    async fn reconcile_candidates(&self, query: &ReconcileQuery) -> Result<Vec<FileRef>> {
        let sql = format!(
            "SELECT {FILE_COLUMNS} FROM file_refs \
             WHERE sync_status = 'synced' AND remote_file_id IS NOT NULL \
             AND (last_checked_at IS NULL OR last_checked_at < ? \
                  OR (? = 1 AND access_mode != 'remote_redirect')) \
             ORDER BY last_checked_at IS NOT NULL, last_checked_at, id LIMIT ?"
        );
        self.query_files(
            &sql,
            vec![
                Value::Text(to_sql_time(query.checked_before)),
                Value::Integer(query.include_unredirected as i64),
                Value::Integer(query.limit as i64),
            ],
        )
    }

    async fn stale_claims(
        &self,
        claimed_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<FileRef>> {
        let sql = format!(
            "SELECT {FILE_COLUMNS} FROM file_refs \
             WHERE sync_status = 'processing' AND (claimed_at IS NULL OR claimed_at < ?) \
             ORDER BY id LIMIT ?"
        );
        self.query_files(
            &sql,
            vec![
                Value::Text(to_sql_time(claimed_before)),
                Value::Integer(limit as i64),
            ],
        )
    }

    async fn release_claim(&self, id: FileId, claimed_before: DateTime<Utc>) -> Result<bool> {
        let changed = self
            .conn()?
            .execute(
                r#"
                UPDATE file_refs SET sync_status = 'error', claimed_at = NULL
                WHERE id = ?1 AND sync_status = 'processing'
                  AND (claimed_at IS NULL OR claimed_at < ?2)
                "#,
                params![id.0, to_sql_time(claimed_before)],
            )
            .map_err(store_err)?;
        Ok(changed == 1)
    }
}

#[async_trait]
impl AuditLog for SqliteStore {
    async fn record_sync(&self, entry: SyncLogEntry) -> Result<()> {
        self.conn()?
            .execute(
                r#"
                INSERT INTO sync_log (timestamp, file_id, file_name, entity_type, sync_type,
                    outcome, error_message, size_mb, remote_file_id)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
                params![
                    to_sql_time(entry.timestamp),
                    entry.file_id.0,
                    entry.file_name,
                    entry.entity_type,
                    entry.sync_type.as_str(),
                    enum_str(&entry.outcome)?,
                    entry.error_message,
                    entry.size_mb,
                    entry.remote_file_id,
                ],
            )
            .map_err(store_err)?;
        Ok(())
    }

    async fn record_access(&self, entry: AccessLogEntry) -> Result<()> {
        self.conn()?
            .execute(
                r#"
                INSERT INTO access_log (timestamp, file_id, caller, cache_hit, bytes_served,
                    duration_ms, http_status, range)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    to_sql_time(entry.timestamp),
                    entry.file_id.0,
                    entry.caller.as_str(),
                    entry.cache_hit,
                    entry.bytes_served as i64,
                    entry.duration_ms as i64,
                    entry.http_status,
                    entry.range,
                ],
            )
            .map_err(store_err)?;
        Ok(())
    }

    async fn record_reconcile(&self, entry: ReconcileLogEntry) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT INTO reconcile_log (timestamp, file_id, action, detail)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    to_sql_time(entry.timestamp),
                    entry.file_id.0,
                    entry.action.as_str(),
                    entry.detail,
                ],
            )
            .map_err(store_err)?;
        Ok(())
    }

    async fn record_session(&self, session: &SyncSession) -> Result<()> {
        self.conn()?
            .execute(
                r#"
                INSERT OR REPLACE INTO sync_sessions (id, started_at, ended_at, status, batches,
                    total_processed, total_success, total_errors, bytes_freed)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
                params![
                    session.id,
                    to_sql_time(session.started_at),
                    session.ended_at.map(to_sql_time),
                    enum_str(&session.status)?,
                    session.batches,
                    session.total_processed as i64,
                    session.total_success as i64,
                    session.total_errors as i64,
                    session.bytes_freed as i64,
                ],
            )
            .map_err(store_err)?;
        Ok(())
    }
}

/// A `file_refs` row before its text columns are parsed.
struct RawFile {
    id: i64,
    entity_type: String,
    entity_id: i64,
    name: String,
    extension: String,
    size_bytes: i64,
    mime_type: Option<String>,
    local_bytes_present: bool,
    remote_file_id: Option<String>,
    content_hash: Option<String>,
    sync_status: String,
    synced_at: Option<String>,
    access_mode: String,
    last_checked_at: Option<String>,
    claimed_at: Option<String>,
}

impl RawFile {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            entity_type: row.get(1)?,
            entity_id: row.get(2)?,
            name: row.get(3)?,
            extension: row.get(4)?,
            size_bytes: row.get(5)?,
            mime_type: row.get(6)?,
            local_bytes_present: row.get(7)?,
            remote_file_id: row.get(8)?,
            content_hash: row.get(9)?,
            sync_status: row.get(10)?,
            synced_at: row.get(11)?,
            access_mode: row.get(12)?,
            last_checked_at: row.get(13)?,
            claimed_at: row.get(14)?,
        })
    }

    fn into_file_ref(self) -> Result<FileRef> {
        Ok(FileRef {
            id: FileId(self.id),
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            name: self.name,
            extension: self.extension,
            size_bytes: self.size_bytes.max(0) as u64,
            mime_type: self.mime_type,
            local_bytes_present: self.local_bytes_present,
            remote_file_id: self.remote_file_id,
            content_hash: self.content_hash,
            sync_status: self.sync_status.parse::<SyncStatus>()?,
            synced_at: self.synced_at.as_deref().map(from_sql_time).transpose()?,
            access_mode: self.access_mode.parse::<AccessMode>()?,
            last_checked_at: self.last_checked_at.as_deref().map(from_sql_time).transpose()?,
            claimed_at: self.claimed_at.as_deref().map(from_sql_time).transpose()?,
        })
    }
}

fn store_err(err: rusqlite::Error) -> Error {
    Error::Store(err.to_string())
}

/// Fixed-width UTC text, so lexical order matches time order.
fn to_sql_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn from_sql_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Serialization(format!("bad timestamp {s}: {e}")))
}

fn enum_str<T: serde::Serialize>(value: &T) -> Result<String> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(s) => Ok(s),
        other => Err(Error::Serialization(format!("expected string tag, got {other}"))),
    }
}

fn parse_enum<T: DeserializeOwned>(s: &str) -> Result<T> {
    Ok(serde_json::from_value(serde_json::Value::String(s.to_string()))?)
}
