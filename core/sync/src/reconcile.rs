//! Drift detection between host records and the remote store.
//!
//! Reconciliation repairs what the orchestrator cannot see happen: remote
//! copies deleted or trashed by hand, content changed behind our back,
//! access pointers left on the host copy, and claims orphaned by a crashed
//! batch. Every corrective action is logged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use cloudshelf_common::digest::digests_match;
use cloudshelf_common::types::chrono_duration;
use cloudshelf_common::{
    AccessMode, AccessToken, FileRef, ReconcileAction, ReconcileLogEntry, Result, SyncConfig,
};
use cloudshelf_host::ReconcileQuery;

use crate::context::SyncContext;

/// Default bound of one reconciliation pass.
pub const DEFAULT_RECONCILE_LIMIT: usize = 200;

/// Reconciliation thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Synced files not checked for this long are checked again.
    pub staleness_secs: u64,
    /// Claims older than this belong to an interrupted batch.
    pub claim_timeout_secs: u64,
}

impl ReconcileConfig {
    pub fn staleness(&self) -> Duration {
        Duration::from_secs(self.staleness_secs)
    }

    pub fn claim_timeout(&self) -> Duration {
        Duration::from_secs(self.claim_timeout_secs)
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            staleness_secs: 24 * 3600,
            claim_timeout_secs: 3600,
        }
    }
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    pub examined: usize,
    pub actions: Vec<ReconcileLogEntry>,
    pub errors: usize,
}

/// Periodic drift repair.
pub struct Reconciler {
    ctx: SyncContext,
    sync_config: SyncConfig,
    config: ReconcileConfig,
}

impl Reconciler {
    pub fn new(ctx: SyncContext, sync_config: SyncConfig, config: ReconcileConfig) -> Self {
        Self {
            ctx,
            sync_config,
            config,
        }
    }

    /// Check up to `limit` synced files against the remote store.
    ///
    /// # Errors
    /// - Status store failures while selecting files
    /// - `Auth` if the credential cannot produce a token
    pub async fn reconcile(&self, limit: usize) -> Result<ReconcileReport> {
        let now = Utc::now();
        let mut report = ReconcileReport::default();

        self.release_stale_claims(now, limit, &mut report).await?;

        let query = ReconcileQuery {
            checked_before: now - chrono_duration(self.config.staleness()),
            include_unredirected: self.sync_config.replace_local_with_remote_urls,
            limit,
        };
        let files = self.ctx.store.reconcile_candidates(&query).await?;
        if files.is_empty() {
            debug!("Nothing to reconcile");
            return Ok(report);
        }

        let token = self.ctx.tokens.ensure_valid_token().await?;
        info!("Reconciling {} files", files.len());

        for file in &files {
            report.examined += 1;
            match self.check_file(&token, file, now).await {
                Ok(actions) => {
                    for action in actions {
                        self.record(&mut report, action).await;
                    }
                }
                Err(e) if e.is_auth() => {
                    error!("Reconciliation stopped: {}", e);
                    report.errors += 1;
                    break;
                }
                Err(e) => {
                    error!(file_id = %file.id, "Reconciliation failed: {}", e);
                    report.errors += 1;
                }
            }
        }

        info!(
            "Reconciliation examined {} files: {} actions, {} errors",
            report.examined,
            report.actions.len(),
            report.errors
        );
        Ok(report)
    }

    async fn release_stale_claims(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let cutoff = now - chrono_duration(self.config.claim_timeout());
        for file in self.ctx.store.stale_claims(cutoff, limit).await? {
            if self.ctx.store.release_claim(file.id, cutoff).await? {
                warn!(file_id = %file.id, "Released stale claim on {}", file.name);
                let detail = match file.claimed_at {
                    Some(at) => format!("claim taken at {} released", at.to_rfc3339()),
                    None => "claim without timestamp released".to_string(),
                };
                self.record(
                    report,
                    ReconcileLogEntry::new(file.id, ReconcileAction::ClaimReleased, detail),
                )
                .await;
            }
        }
        Ok(())
    }

    /// Compare one file with its remote copy and repair drift.
    async fn check_file(
        &self,
        token: &AccessToken,
        file: &FileRef,
        now: DateTime<Utc>,
    ) -> Result<Vec<ReconcileLogEntry>> {
        let Some(remote_id) = file.remote_file_id.as_deref() else {
            return Ok(Vec::new());
        };
        let store = &self.ctx.store;

        let object = self
            .ctx
            .backoff
            .execute("metadata", || {
                let remote = self.ctx.remote.clone();
                async move { remote.metadata(token, remote_id).await }
            })
            .await?
            .filter(|object| !object.trashed);

        let mut actions = Vec::new();
        match object {
            None if file.local_bytes_present => {
                store.reset_to_local(file.id).await?;
                actions.push(ReconcileLogEntry::new(
                    file.id,
                    ReconcileAction::ResetToLocal,
                    format!("remote copy {remote_id} missing; queued for re-upload"),
                ));
            }
            None => {
                store.mark_error(file.id).await?;
                actions.push(ReconcileLogEntry::new(
                    file.id,
                    ReconcileAction::RemoteLost,
                    format!("remote copy {remote_id} missing and local bytes already cleared"),
                ));
            }
            Some(object) => {
                let drifted = match (object.sha256.as_deref(), file.content_hash.as_deref()) {
                    (Some(remote_hash), Some(local_hash)) => {
                        !digests_match(remote_hash, local_hash)
                    }
                    _ => false,
                };

                if drifted && file.local_bytes_present {
                    store.reset_to_local(file.id).await?;
                    actions.push(ReconcileLogEntry::new(
                        file.id,
                        ReconcileAction::ResetToLocal,
                        format!("remote copy {remote_id} changed; queued for re-upload"),
                    ));
                } else {
                    if drifted {
                        actions.push(ReconcileLogEntry::new(
                            file.id,
                            ReconcileAction::IntegrityAlert,
                            format!(
                                "remote copy {remote_id} changed and no local bytes remain \
                                 (expected {}, remote {})",
                                file.content_hash.as_deref().unwrap_or_default(),
                                object.sha256.as_deref().unwrap_or_default()
                            ),
                        ));
                    }
                    if self.sync_config.replace_local_with_remote_urls
                        && file.access_mode != AccessMode::RemoteRedirect
                    {
                        store.set_access_mode(file.id, AccessMode::RemoteRedirect).await?;
                        actions.push(ReconcileLogEntry::new(
                            file.id,
                            ReconcileAction::RedirectFlipped,
                            "access pointer moved to the proxy",
                        ));
                    }
                }
            }
        }

        store.mark_checked(file.id, now).await?;
        Ok(actions)
    }

    async fn record(&self, report: &mut ReconcileReport, entry: ReconcileLogEntry) {
        debug!(file_id = %entry.file_id, "Reconcile action: {}", entry.action.as_str());
        if let Err(e) = self.ctx.audit.record_reconcile(entry.clone()).await {
            warn!("Could not write reconcile log: {}", e);
        }
        report.actions.push(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;
    use bytes::Bytes;
    use chrono::Duration as ChronoDuration;
    use cloudshelf_common::{sha256_hex, FileId, FileTypeConfig, RemoteError, SyncStatus};

    /// A synced file whose remote copy holds `data`.
    fn synced_file(fx: &Fixture, id: i64, data: &'static [u8], local: bool) -> FileRef {
        let remote_id = fx.remote.put_object("a.pdf", None, Bytes::from_static(data));
        let mut file = FileRef::new_local(FileId(id), "invoice", 1, "a.pdf", data.len() as u64);
        file.sync_status = SyncStatus::Synced;
        file.remote_file_id = Some(remote_id);
        file.content_hash = Some(sha256_hex(data));
        file.synced_at = Some(Utc::now());
        file.local_bytes_present = local;
        fx.host.insert(file.clone(), local.then(|| Bytes::from_static(data)));
        file
    }

    fn reconciler(fx: &Fixture, replace: bool) -> Reconciler {
        let sync_config = SyncConfig {
            replace_local_with_remote_urls: replace,
            ..SyncConfig::default()
        };
        Reconciler::new(fx.ctx.clone(), sync_config, ReconcileConfig::default())
    }

    #[tokio::test]
    async fn test_missing_remote_resets_to_local() {
        let fx = Fixture::new();
        let file = synced_file(&fx, 1, b"data", true);
        fx.remote.remove(file.remote_file_id.as_deref().unwrap());

        let report = reconciler(&fx, false).reconcile(10).await.unwrap();

        assert_eq!(report.actions.len(), 1);
        assert_eq!(report.actions[0].action, ReconcileAction::ResetToLocal);
        let reset = fx.host.file(file.id).unwrap();
        assert_eq!(reset.sync_status, SyncStatus::Local);
        assert!(reset.remote_file_id.is_none());
        assert_eq!(fx.host.reconcile_log().len(), 1);
    }

    #[tokio::test]
    async fn test_trashed_remote_without_local_bytes_is_remote_lost() {
        let fx = Fixture::new();
        let file = synced_file(&fx, 1, b"data", false);
        fx.remote.trash(file.remote_file_id.as_deref().unwrap());

        let report = reconciler(&fx, false).reconcile(10).await.unwrap();

        assert_eq!(report.actions[0].action, ReconcileAction::RemoteLost);
        assert_eq!(fx.host.file(file.id).unwrap().sync_status, SyncStatus::Error);
    }

    #[tokio::test]
    async fn test_redirect_flip() {
        let fx = Fixture::new();
        let file = synced_file(&fx, 1, b"data", true);
        fx.host.update(file.id, |f| f.last_checked_at = Some(Utc::now()));

        let report = reconciler(&fx, true).reconcile(10).await.unwrap();

        assert_eq!(report.actions.len(), 1);
        assert_eq!(report.actions[0].action, ReconcileAction::RedirectFlipped);
        assert_eq!(
            fx.host.file(file.id).unwrap().access_mode,
            AccessMode::RemoteRedirect
        );
    }

    #[tokio::test]
    async fn test_checksum_drift() {
        let fx = Fixture::new();
        let with_local = synced_file(&fx, 1, b"original", true);
        let without_local = synced_file(&fx, 2, b"original", false);
        fx.remote.overwrite(with_local.remote_file_id.as_deref().unwrap(), "tampered");
        fx.remote.overwrite(without_local.remote_file_id.as_deref().unwrap(), "tampered");

        let report = reconciler(&fx, false).reconcile(10).await.unwrap();

        let actions: Vec<(FileId, ReconcileAction)> =
            report.actions.iter().map(|a| (a.file_id, a.action)).collect();
        assert!(actions.contains(&(with_local.id, ReconcileAction::ResetToLocal)));
        assert!(actions.contains(&(without_local.id, ReconcileAction::IntegrityAlert)));
        assert_eq!(fx.host.file(with_local.id).unwrap().sync_status, SyncStatus::Local);
        assert_eq!(fx.host.file(without_local.id).unwrap().sync_status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_second_run_is_idempotent() {
        let fx = Fixture::new();
        let gone = synced_file(&fx, 1, b"a", true);
        synced_file(&fx, 2, b"b", true);
        let drifted = synced_file(&fx, 3, b"c", false);
        fx.remote.remove(gone.remote_file_id.as_deref().unwrap());
        fx.remote.overwrite(drifted.remote_file_id.as_deref().unwrap(), "x");

        let reconciler = reconciler(&fx, true);
        let first = reconciler.reconcile(10).await.unwrap();
        assert!(!first.actions.is_empty());

        let second = reconciler.reconcile(10).await.unwrap();
        assert!(second.actions.is_empty());
    }

    #[tokio::test]
    async fn test_matching_file_is_only_stamped() {
        let fx = Fixture::new();
        let file = synced_file(&fx, 1, b"same", true);

        let report = reconciler(&fx, false).reconcile(10).await.unwrap();

        assert_eq!(report.examined, 1);
        assert!(report.actions.is_empty());
        assert!(fx.host.file(file.id).unwrap().last_checked_at.is_some());
    }

    #[tokio::test]
    async fn test_per_file_errors_do_not_block_scan() {
        let fx = Fixture::new();
        synced_file(&fx, 1, b"a", true);
        let second = synced_file(&fx, 2, b"b", true);
        fx.remote.remove(second.remote_file_id.as_deref().unwrap());
        fx.remote.inject_failure(RemoteError::rejected("400 bad request"));

        let report = reconciler(&fx, false).reconcile(10).await.unwrap();

        assert_eq!(report.examined, 2);
        assert_eq!(report.errors, 1);
        assert_eq!(report.actions.len(), 1);
        assert_eq!(fx.host.file(second.id).unwrap().sync_status, SyncStatus::Local);
    }

    #[tokio::test]
    async fn test_stale_claims_are_released() {
        let fx = Fixture::new();
        let stale = fx.host.add_file("invoice", 1, "a.pdf", b"a");
        let fresh = fx.host.add_file("invoice", 1, "b.pdf", b"b");
        fx.host.update(stale.id, |f| {
            f.sync_status = SyncStatus::Processing;
            f.claimed_at = Some(Utc::now() - ChronoDuration::hours(2));
        });
        fx.host.update(fresh.id, |f| {
            f.sync_status = SyncStatus::Processing;
            f.claimed_at = Some(Utc::now());
        });

        let report = reconciler(&fx, false).reconcile(10).await.unwrap();

        assert_eq!(report.actions.len(), 1);
        assert_eq!(report.actions[0].action, ReconcileAction::ClaimReleased);
        assert_eq!(fx.host.file(stale.id).unwrap().sync_status, SyncStatus::Error);
        assert_eq!(fx.host.file(fresh.id).unwrap().sync_status, SyncStatus::Processing);

        // The released file is picked up by the next batch.
        let summary = fx
            .orchestrator(SyncConfig::default(), &FileTypeConfig::defaults())
            .manual_sync(None)
            .await
            .unwrap();
        assert_eq!(summary.succeeded, 1);
    }
}
