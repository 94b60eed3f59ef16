//! Batch upload of host attachments to the remote store.

use bytes::Bytes;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use cloudshelf_common::digest::digests_match;
use cloudshelf_common::{
    sha256_hex, AccessMode, Error, FileId, FileRef, FileTypeConfig, FileTypeWhitelist,
    ModelConfig, Result, SessionStatus, SyncConfig, SyncLogEntry, SyncSession, SyncStatus,
    SyncType,
};
use cloudshelf_host::{CandidateQuery, FileAdapter, SyncedUpdate};
use cloudshelf_remote::UploadRequest;

use crate::context::SyncContext;
use crate::folders::FolderResolver;

/// Default bound of a manual run.
pub const DEFAULT_MANUAL_LIMIT: usize = 500;

/// Default batch size of a complete sync.
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Outcome of one sync run.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSummary {
    pub sync_type: SyncType,
    /// Files claimed and attempted.
    pub processed: usize,
    pub succeeded: usize,
    pub errored: usize,
    /// Candidates another batch claimed first.
    pub skipped: usize,
    pub bytes_freed: u64,
    /// Set when a credential error stopped the run early.
    pub aborted: Option<String>,
    pub duration: Duration,
}

impl SyncSummary {
    fn new(sync_type: SyncType) -> Self {
        Self {
            sync_type,
            processed: 0,
            succeeded: 0,
            errored: 0,
            skipped: 0,
            bytes_freed: 0,
            aborted: None,
            duration: Duration::ZERO,
        }
    }

    fn absorb(&mut self, other: &SyncSummary) {
        self.processed += other.processed;
        self.succeeded += other.succeeded;
        self.errored += other.errored;
        self.skipped += other.skipped;
        self.bytes_freed += other.bytes_freed;
        if other.aborted.is_some() {
            self.aborted = other.aborted.clone();
        }
    }
}

/// Complete sync result: the session record plus the summed counters.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub session: SyncSession,
    pub summary: SyncSummary,
}

enum FileOutcome {
    Synced { bytes_freed: u64 },
    Failed(Error),
    Skipped,
}

/// Drives batch uploads for every active model config.
pub struct Orchestrator {
    ctx: SyncContext,
    config: SyncConfig,
    models: Vec<ModelConfig>,
    whitelist: FileTypeWhitelist,
    folders: FolderResolver,
}

impl Orchestrator {
    /// Create an orchestrator.
    ///
    /// # Errors
    /// - `Validation` if the file type list is inconsistent
    pub fn new(
        ctx: SyncContext,
        config: SyncConfig,
        models: Vec<ModelConfig>,
        file_types: &[FileTypeConfig],
    ) -> Result<Self> {
        let whitelist = FileTypeWhitelist::from_configs(file_types)?;
        let folders = FolderResolver::new(config.remote_root_folder_id.clone());
        Ok(Self {
            ctx,
            config,
            models,
            whitelist,
            folders,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Sync at most `limit` files on behalf of a user.
    ///
    /// # Errors
    /// - `Validation` if the sync config is inactive
    pub async fn manual_sync(&self, limit: Option<usize>) -> Result<SyncSummary> {
        self.require_active()?;
        let limit = limit.unwrap_or(DEFAULT_MANUAL_LIMIT);
        let (summary, _) = self.run(SyncType::Manual, Some(limit), &HashSet::new()).await;
        Ok(summary)
    }

    /// Scheduled run. Does nothing unless the config is active with
    /// `auto_sync` on.
    pub async fn automatic_sync(&self) -> SyncSummary {
        if !self.config.is_active || !self.config.auto_sync {
            debug!("Automatic sync disabled");
            return SyncSummary::new(SyncType::Automatic);
        }
        let (summary, _) = self.run(SyncType::Automatic, None, &HashSet::new()).await;
        summary
    }

    /// Drain every pending file in batches of `batch_size`.
    ///
    /// Files attempted earlier in the session are not picked up again, so a
    /// file that keeps failing cannot stall the session.
    ///
    /// # Errors
    /// - `Validation` if the sync config is inactive
    pub async fn complete_sync(&self, batch_size: usize) -> Result<SessionReport> {
        self.require_active()?;
        let batch_size = batch_size.max(1);
        let started = Instant::now();

        let mut session = SyncSession::start(Uuid::new_v4().to_string());
        self.save_session(&session).await;
        info!("Starting complete sync session {}", session.id);

        let mut attempted: HashSet<FileId> = HashSet::new();
        let mut total = SyncSummary::new(SyncType::CompleteBatch);

        loop {
            let (batch, considered) = self
                .run(SyncType::CompleteBatch, Some(batch_size), &attempted)
                .await;
            if considered.is_empty() {
                if let Some(reason) = batch.aborted {
                    total.aborted = Some(reason);
                    session.finish(SessionStatus::Aborted);
                }
                break;
            }
            let drained = considered.len() < batch_size;
            attempted.extend(considered);

            session.batches += 1;
            session.total_processed += batch.processed as u64;
            session.total_success += batch.succeeded as u64;
            session.total_errors += batch.errored as u64;
            session.bytes_freed += batch.bytes_freed;
            total.absorb(&batch);
            info!(
                "Session {} batch {}: {} processed, {} errors",
                session.id, session.batches, batch.processed, batch.errored
            );

            if batch.aborted.is_some() {
                session.finish(SessionStatus::Aborted);
                break;
            }
            self.save_session(&session).await;
            if drained {
                break;
            }
        }

        if session.status == SessionStatus::InProgress {
            session.finish(SessionStatus::Completed);
        }
        self.save_session(&session).await;
        total.duration = started.elapsed();

        info!(
            "Complete sync session {} finished after {} batches: {} synced, {} errors",
            session.id, session.batches, session.total_success, session.total_errors
        );
        Ok(SessionReport {
            session,
            summary: total,
        })
    }

    /// Sync a single file on demand.
    ///
    /// # Errors
    /// - `NotFound` if the file does not exist
    /// - `Validation` if no active model config covers it, its type is not
    ///   whitelisted, or it has no local bytes
    pub async fn sync_file(&self, id: FileId) -> Result<SyncSummary> {
        self.require_active()?;
        let started = Instant::now();

        let file = self
            .ctx
            .store
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("file {id}")))?;
        let model = self
            .models
            .iter()
            .find(|m| m.is_active && m.entity_type == file.entity_type)
            .ok_or_else(|| {
                Error::Validation(format!("No active model config for '{}'", file.entity_type))
            })?;
        if !self.whitelist.allows(&file.extension, file.size_bytes) {
            return Err(Error::Validation(format!(
                "File type .{} is not allowed or the file is too large",
                file.extension
            )));
        }
        if !file.local_bytes_present {
            return Err(Error::Validation(format!("File {id} has no local bytes")));
        }
        let adapter = self.ctx.registry.resolve(&model.entity_type)?;

        let mut summary = SyncSummary::new(SyncType::Manual);
        self.tally(&mut summary, self.sync_one(&adapter, model, &file, SyncType::Manual).await);
        summary.duration = started.elapsed();
        Ok(summary)
    }

    fn require_active(&self) -> Result<()> {
        if !self.config.is_active {
            return Err(Error::Validation("Sync configuration is not active".to_string()));
        }
        Ok(())
    }

    /// One pass over the active model configs. Returns the summary and the
    /// ids of every candidate considered.
    async fn run(
        &self,
        sync_type: SyncType,
        limit: Option<usize>,
        exclude: &HashSet<FileId>,
    ) -> (SyncSummary, Vec<FileId>) {
        let started = Instant::now();
        let mut summary = SyncSummary::new(sync_type);
        let mut considered = Vec::new();

        if self.whitelist.is_empty() {
            info!("No active file types; nothing to sync");
            return (summary, considered);
        }

        // Fail fast on an unusable credential before claiming anything.
        if let Err(e) = self.ctx.tokens.ensure_valid_token().await {
            warn!("{} sync not started: {}", sync_type.as_str(), e);
            summary.aborted = Some(e.to_string());
            return (summary, considered);
        }

        let mut budget = limit.unwrap_or(usize::MAX);
        debug!("Starting {} sync", sync_type.as_str());

        'models: for model in self.models.iter().filter(|m| m.is_active) {
            if budget == 0 {
                break;
            }
            let adapter = match self.ctx.registry.resolve(&model.entity_type) {
                Ok(adapter) => adapter,
                Err(e) => {
                    warn!("Skipping model config '{}': {}", model.entity_type, e);
                    continue;
                }
            };

            let query = CandidateQuery {
                entity_type: model.entity_type.clone(),
                statuses: SyncStatus::CLAIMABLE.to_vec(),
                whitelist: self.whitelist.clone(),
                exclude: exclude.clone(),
                limit: budget,
            };
            let candidates = match adapter.list_candidates(&query).await {
                Ok(files) => files,
                Err(e) => {
                    error!("Listing candidates for '{}' failed: {}", model.entity_type, e);
                    continue;
                }
            };

            for file in candidates.iter().filter(|f| query.matches(f)).take(budget) {
                budget -= 1;
                considered.push(file.id);

                let outcome = self.sync_one(&adapter, model, file, sync_type).await;
                if self.tally(&mut summary, outcome) {
                    warn!(
                        "Aborting {} sync: {}",
                        sync_type.as_str(),
                        summary.aborted.as_deref().unwrap_or_default()
                    );
                    break 'models;
                }
            }
        }

        summary.duration = started.elapsed();
        info!(
            "{} sync completed in {:?}: {} synced, {} errors, {} skipped, {} bytes freed",
            sync_type.as_str(),
            summary.duration,
            summary.succeeded,
            summary.errored,
            summary.skipped,
            summary.bytes_freed
        );
        (summary, considered)
    }

    /// Add one outcome to the counters. Returns `true` when a credential
    /// error means the run must stop.
    fn tally(&self, summary: &mut SyncSummary, outcome: FileOutcome) -> bool {
        match outcome {
            FileOutcome::Skipped => summary.skipped += 1,
            FileOutcome::Synced { bytes_freed } => {
                summary.processed += 1;
                summary.succeeded += 1;
                summary.bytes_freed += bytes_freed;
            }
            FileOutcome::Failed(err) => {
                summary.processed += 1;
                summary.errored += 1;
                if err.is_auth() {
                    summary.aborted = Some(err.to_string());
                    return true;
                }
            }
        }
        false
    }

    /// Claim, upload and verify one file. Never returns an error: failures
    /// are recorded on the file and in the sync log.
    async fn sync_one(
        &self,
        adapter: &Arc<dyn FileAdapter>,
        model: &ModelConfig,
        file: &FileRef,
        sync_type: SyncType,
    ) -> FileOutcome {
        match self.ctx.store.claim(file.id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(file_id = %file.id, "Already claimed, skipping");
                return FileOutcome::Skipped;
            }
            Err(e) => {
                error!(file_id = %file.id, "Claim failed: {}", e);
                return FileOutcome::Skipped;
            }
        }

        match self.upload_claimed(adapter, model, file, sync_type).await {
            Ok(bytes_freed) => FileOutcome::Synced { bytes_freed },
            Err(err) => {
                error!(file_id = %file.id, "Failed to sync {}: {}", file.name, err);
                if let Err(e) = self.ctx.store.mark_error(file.id).await {
                    error!(file_id = %file.id, "Could not record sync error: {}", e);
                }
                self.log(SyncLogEntry::failure(file, sync_type, &err)).await;
                FileOutcome::Failed(err)
            }
        }
    }

    /// Upload a claimed file. Returns the number of local bytes freed.
    async fn upload_claimed(
        &self,
        adapter: &Arc<dyn FileAdapter>,
        model: &ModelConfig,
        file: &FileRef,
        sync_type: SyncType,
    ) -> Result<u64> {
        let data: Bytes = adapter.read_local_bytes(file).await?;
        let local_hash = sha256_hex(&data);

        let token = self.ctx.tokens.ensure_valid_token().await?;
        let folder_id = self
            .folders
            .resolve(&self.ctx.remote, &token, &self.ctx.backoff, &model.remote_folder_name)
            .await?;

        let request = UploadRequest {
            name: file.name.clone(),
            mime_type: file.content_type(),
            folder_id: folder_id.clone(),
            data,
        };
        debug!(file_id = %file.id, "Uploading {} ({:.2} MB)", file.name, file.size_mb());

        let uploaded = self
            .ctx
            .backoff
            .execute("upload", || {
                let remote = self.ctx.remote.clone();
                let token = token.clone();
                let request = request.clone();
                async move { remote.upload(&token, request).await }
            })
            .await;
        let object = match uploaded {
            Ok(object) => object,
            Err(err @ Error::NotFound(_)) if folder_id.is_some() => {
                // Folder vanished remotely; resolve it afresh next time.
                self.folders.forget(&model.remote_folder_name).await;
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        let access_mode = if self.config.replace_local_with_remote_urls {
            AccessMode::RemoteRedirect
        } else {
            AccessMode::Local
        };

        let verified = match object.sha256.as_deref() {
            Some(remote_hash) if digests_match(remote_hash, &local_hash) => true,
            Some(remote_hash) => {
                return Err(Error::Integrity {
                    expected: local_hash,
                    actual: remote_hash.to_string(),
                });
            }
            None => {
                warn!(
                    file_id = %file.id,
                    "Remote reported no checksum for {}; keeping local bytes", file.name
                );
                false
            }
        };

        self.ctx
            .store
            .mark_synced(
                file.id,
                SyncedUpdate {
                    remote_file_id: object.id.clone(),
                    content_hash: verified.then(|| local_hash.clone()),
                    synced_at: Utc::now(),
                    access_mode,
                },
            )
            .await?;

        let mut bytes_freed = 0;
        if verified && self.config.delete_local_after_sync {
            match adapter.clear_local_bytes(file).await {
                Ok(freed) => {
                    // The bytes are gone either way; the upload stands.
                    if let Err(e) = self.ctx.store.mark_local_cleared(file.id).await {
                        error!(
                            file_id = %file.id,
                            "Cleared local bytes but could not record it: {}", e
                        );
                    }
                    bytes_freed = freed;
                }
                Err(e) => warn!(file_id = %file.id, "Could not clear local bytes: {}", e),
            }
        }

        self.log(SyncLogEntry::success(file, sync_type, &object.id)).await;
        debug!(file_id = %file.id, "Synced {} as {}", file.name, object.id);
        Ok(bytes_freed)
    }

    async fn log(&self, entry: SyncLogEntry) {
        if let Err(e) = self.ctx.audit.record_sync(entry).await {
            warn!("Could not write sync log: {}", e);
        }
    }

    async fn save_session(&self, session: &SyncSession) {
        if let Err(e) = self.ctx.audit.record_session(session).await {
            warn!("Could not save sync session {}: {}", session.id, e);
        }
    }
}
