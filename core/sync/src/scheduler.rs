//! Sync scheduling: on-demand requests and periodic ticks.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, error, info};

use cloudshelf_common::{Error, FileId, Result};

use crate::orchestrator::{SessionReport, SyncSummary};
use crate::reconcile::ReconcileReport;

/// Work the scheduler can be asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncRequest {
    Manual { limit: Option<usize> },
    Automatic,
    Complete { batch_size: usize },
    File(FileId),
    Reconcile { limit: usize },
    /// Stop the scheduler loop.
    Shutdown,
}

/// Result of a processed request.
#[derive(Debug, Clone)]
pub enum SyncResponse {
    Batch(SyncSummary),
    Session(SessionReport),
    Reconcile(ReconcileReport),
    Stopped,
}

/// Periodic triggers. `None` disables a trigger.
#[derive(Debug, Clone, Default)]
pub struct Schedule {
    pub automatic_every: Option<Duration>,
    pub reconcile_every: Option<Duration>,
    /// Files checked per periodic reconciliation.
    pub reconcile_limit: usize,
}

type Envelope = (SyncRequest, oneshot::Sender<Result<SyncResponse>>);

/// Client side of the scheduler; cheap to clone.
#[derive(Clone)]
pub struct SyncScheduler {
    request_tx: mpsc::Sender<Envelope>,
    shutdown: Arc<AtomicBool>,
}

impl SyncScheduler {
    /// Create a scheduler and the handle that runs its loop.
    pub fn new(schedule: Schedule) -> (Self, SyncSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(100);
        let shutdown = Arc::new(AtomicBool::new(false));

        let scheduler = Self {
            request_tx,
            shutdown: shutdown.clone(),
        };
        let handle = SyncSchedulerHandle {
            schedule,
            request_rx,
            shutdown,
        };

        (scheduler, handle)
    }

    /// Submit a request and wait for its result.
    ///
    /// # Errors
    /// - `Validation` if the scheduler loop is not running
    pub async fn request(&self, request: SyncRequest) -> Result<SyncResponse> {
        let (response_tx, response_rx) = oneshot::channel();

        self.request_tx
            .send((request, response_tx))
            .await
            .map_err(|_| Error::Validation("Scheduler not running".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::Validation("Failed to receive sync result".to_string()))?
    }

    /// Request a manual sync.
    pub async fn request_manual(&self, limit: Option<usize>) -> Result<SyncResponse> {
        self.request(SyncRequest::Manual { limit }).await
    }

    /// Request a reconciliation pass.
    pub async fn request_reconcile(&self, limit: usize) -> Result<SyncResponse> {
        self.request(SyncRequest::Reconcile { limit }).await
    }

    /// Stop the scheduler loop.
    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);

        let (response_tx, _) = oneshot::channel();
        let _ = self
            .request_tx
            .send((SyncRequest::Shutdown, response_tx))
            .await;
    }
}

/// Handle for the scheduler background task.
pub struct SyncSchedulerHandle {
    schedule: Schedule,
    request_rx: mpsc::Receiver<Envelope>,
    shutdown: Arc<AtomicBool>,
}

impl SyncSchedulerHandle {
    /// Run the scheduler loop until shutdown.
    ///
    /// This should be spawned in a tokio task. `handler` processes both
    /// submitted requests and periodic ticks, one at a time.
    pub async fn run<F, Fut>(mut self, handler: F)
    where
        F: Fn(SyncRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<SyncResponse>> + Send,
    {
        let mut automatic = Self::periodic(self.schedule.automatic_every);
        let mut reconcile = Self::periodic(self.schedule.reconcile_every);

        info!("Sync scheduler started");

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                info!("Sync scheduler shutting down");
                break;
            }

            tokio::select! {
                received = self.request_rx.recv() => {
                    let Some((request, response_tx)) = received else {
                        info!("All scheduler clients dropped");
                        break;
                    };
                    if request == SyncRequest::Shutdown {
                        info!("Received shutdown request");
                        let _ = response_tx.send(Ok(SyncResponse::Stopped));
                        break;
                    }
                    debug!("Processing sync request: {:?}", request);
                    let _ = response_tx.send(handler(request).await);
                }

                _ = Self::tick(&mut automatic) => {
                    debug!("Triggering automatic sync");
                    Self::log_periodic("Automatic sync", handler(SyncRequest::Automatic).await);
                }

                _ = Self::tick(&mut reconcile) => {
                    debug!("Triggering reconciliation");
                    let request = SyncRequest::Reconcile { limit: self.schedule.reconcile_limit };
                    Self::log_periodic("Reconciliation", handler(request).await);
                }
            }
        }
    }

    fn periodic(every: Option<Duration>) -> Option<Interval> {
        every.map(|period| {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        })
    }

    async fn tick(ticker: &mut Option<Interval>) {
        match ticker {
            Some(ticker) => {
                ticker.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }

    fn log_periodic(what: &str, result: Result<SyncResponse>) {
        match result {
            Ok(SyncResponse::Batch(summary)) => info!(
                "{} completed: {} synced, {} errors, {} bytes freed",
                what, summary.succeeded, summary.errored, summary.bytes_freed
            ),
            Ok(SyncResponse::Reconcile(report)) => info!(
                "{} completed: {} examined, {} actions",
                what,
                report.examined,
                report.actions.len()
            ),
            Ok(_) => info!("{} completed", what),
            Err(e) => error!("{} failed: {}", what, e),
        }
    }
}
