//! Periodic background reconciliation

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::engine::ReconciliationEngine;
use crate::coordination::ShutdownToken;
use crate::domain::SyncStatus;
use crate::error::SyncError;

/// Runs `sync_all` on a fixed interval.
///
/// A tick that lands while a run is still in progress is skipped rather
/// than queued behind it.
pub struct SyncScheduler {
    engine: Arc<ReconciliationEngine>,
    interval: Duration,
    stop_tx: tokio::sync::watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SyncScheduler {
    pub fn new(engine: Arc<ReconciliationEngine>, interval: Duration) -> Self {
        let (stop_tx, _) = tokio::sync::watch::channel(false);
        Self {
            engine,
            interval,
            stop_tx,
            handle: Mutex::new(None),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.handle
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Spawn the timer task; a second call while running is a no-op
    pub async fn start(&self, mut shutdown: ShutdownToken) {
        let mut handle = self.handle.lock().await;
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            debug!("Sync scheduler already running");
            return;
        }

        self.stop_tx.send_replace(false);
        let mut stop_rx = self.stop_tx.subscribe();
        let engine = self.engine.clone();
        let interval = self.interval;

        info!("Sync scheduler started (interval: {}s)", interval.as_secs());

        *handle = Some(tokio::spawn(async move {
            let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = timer.tick() => {}
                    _ = async { stop_rx.wait_for(|stop| *stop).await.is_ok() } => break,
                    _ = shutdown.cancelled() => break,
                }

                match engine.sync_all().await {
                    Ok(result) if result.status == SyncStatus::Failed => warn!(
                        error = result.error_message.as_deref().unwrap_or(""),
                        "Scheduled reconciliation failed"
                    ),
                    Ok(result) => debug!(
                        status = %result.status,
                        created = result.created_queues,
                        deleted = result.deleted_queues,
                        "Scheduled reconciliation finished"
                    ),
                    Err(SyncError::AlreadyRunning(_)) => {
                        debug!("Reconciliation in progress, skipping tick")
                    }
                    Err(e) => warn!(error = %e, "Scheduled reconciliation error"),
                }
            }

            info!("Sync scheduler stopped");
        }));
    }

    /// Signal the task and wait for it; an in-flight run finishes first
    pub async fn stop(&self) {
        self.stop_tx.send_replace(true);
        if let Some(handle) = self.handle.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Sync scheduler task ended abnormally");
            }
        }
    }
}
