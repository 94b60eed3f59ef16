//! Sync engine: orchestrator and reconciliation behind one request API.

use std::sync::Arc;

use cloudshelf_common::{FileTypeConfig, ModelConfig, Result, SyncConfig};

use crate::context::SyncContext;
use crate::orchestrator::Orchestrator;
use crate::reconcile::{ReconcileConfig, Reconciler};
use crate::scheduler::{Schedule, SyncRequest, SyncResponse, SyncScheduler};

/// Main entry point for hosts: owns the orchestrator and the reconciler and
/// dispatches [`SyncRequest`]s to them.
pub struct SyncEngine {
    orchestrator: Orchestrator,
    reconciler: Reconciler,
}

impl SyncEngine {
    /// Create an engine.
    ///
    /// # Errors
    /// - `Validation` if the file type list is inconsistent
    pub fn new(
        ctx: SyncContext,
        config: SyncConfig,
        models: Vec<ModelConfig>,
        file_types: &[FileTypeConfig],
        reconcile: ReconcileConfig,
    ) -> Result<Self> {
        let reconciler = Reconciler::new(ctx.clone(), config.clone(), reconcile);
        let orchestrator = Orchestrator::new(ctx, config, models, file_types)?;
        Ok(Self {
            orchestrator,
            reconciler,
        })
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Process one request.
    pub async fn process_request(&self, request: SyncRequest) -> Result<SyncResponse> {
        match request {
            SyncRequest::Manual { limit } => self
                .orchestrator
                .manual_sync(limit)
                .await
                .map(SyncResponse::Batch),
            SyncRequest::Automatic => Ok(SyncResponse::Batch(
                self.orchestrator.automatic_sync().await,
            )),
            SyncRequest::Complete { batch_size } => self
                .orchestrator
                .complete_sync(batch_size)
                .await
                .map(SyncResponse::Session),
            SyncRequest::File(id) => self
                .orchestrator
                .sync_file(id)
                .await
                .map(SyncResponse::Batch),
            SyncRequest::Reconcile { limit } => self
                .reconciler
                .reconcile(limit)
                .await
                .map(SyncResponse::Reconcile),
            SyncRequest::Shutdown => Ok(SyncResponse::Stopped),
        }
    }

    /// Spawn a scheduler loop feeding this engine.
    ///
    /// Automatic ticks are only scheduled when `auto_sync` is on.
    pub fn start_scheduler(
        self: &Arc<Self>,
        mut schedule: Schedule,
    ) -> (SyncScheduler, tokio::task::JoinHandle<()>) {
        let config = self.orchestrator.config();
        if !(config.is_active && config.auto_sync) {
            schedule.automatic_every = None;
        }

        let (scheduler, handle) = SyncScheduler::new(schedule);
        let engine = Arc::clone(self);
        let task = tokio::spawn(handle.run(move |request| {
            let engine = engine.clone();
            async move { engine.process_request(request).await }
        }));
        (scheduler, task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;
    use cloudshelf_common::SyncStatus;
    use std::time::Duration;

    fn engine(fx: &Fixture, config: SyncConfig) -> Arc<SyncEngine> {
        Arc::new(
            SyncEngine::new(
                fx.ctx.clone(),
                config,
                vec![ModelConfig::new("invoice", "Invoices")],
                &FileTypeConfig::defaults(),
                ReconcileConfig::default(),
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_requests_through_scheduler() {
        let fx = Fixture::new();
        let file = fx.host.add_file("invoice", 1, "a.pdf", b"x");
        let engine = engine(&fx, SyncConfig::default());

        let (scheduler, task) = engine.start_scheduler(Schedule::default());
        let response = scheduler.request_manual(None).await.unwrap();
        assert!(matches!(response, SyncResponse::Batch(s) if s.succeeded == 1));
        assert_eq!(fx.host.file(file.id).unwrap().sync_status, SyncStatus::Synced);

        let response = scheduler.request_reconcile(10).await.unwrap();
        assert!(matches!(response, SyncResponse::Reconcile(r) if r.actions.is_empty()));

        scheduler.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_automatic_ticks_follow_auto_sync_flag() {
        let fx = Fixture::new();
        let file = fx.host.add_file("invoice", 1, "a.pdf", b"x");
        let schedule = Schedule {
            automatic_every: Some(Duration::from_millis(10)),
            ..Schedule::default()
        };

        let (scheduler, task) =
            engine(&fx, SyncConfig::default()).start_scheduler(schedule.clone());
        tokio::time::sleep(Duration::from_millis(40)).await;
        scheduler.shutdown().await;
        task.await.unwrap();
        assert_eq!(fx.host.file(file.id).unwrap().sync_status, SyncStatus::Local);

        let config = SyncConfig {
            auto_sync: true,
            ..SyncConfig::default()
        };
        let (scheduler, task) = engine(&fx, config).start_scheduler(schedule);
        tokio::time::sleep(Duration::from_millis(40)).await;
        scheduler.shutdown().await;
        task.await.unwrap();
        assert_eq!(fx.host.file(file.id).unwrap().sync_status, SyncStatus::Synced);
    }
}
