//! Graceful Shutdown Handler
//!
//! Fans a single shutdown signal out to every long-running task and drives
//! the ordered stop sequence: scheduler, then listeners, then the broker
//! connection.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SyncError};

/// Shutdown signal types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// Normal graceful shutdown (SIGTERM, SIGINT)
    Graceful,
    /// Urgent shutdown - shorter timeouts
    Urgent,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Graceful => write!(f, "graceful"),
            ShutdownSignal::Urgent => write!(f, "urgent"),
        }
    }
}

/// Configuration for graceful shutdown
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Total timeout for the whole sequence (default: 30s)
    pub total_timeout_secs: u64,
    /// Time allowed for the sync scheduler to finish its current run (default: 10s)
    pub scheduler_stop_timeout_secs: u64,
    /// Time allowed for all listeners to exit (default: 15s)
    pub listener_drain_timeout_secs: u64,
    /// Time allowed for the broker disconnect (default: 5s)
    pub disconnect_timeout_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            total_timeout_secs: 30,
            scheduler_stop_timeout_secs: 10,
            listener_drain_timeout_secs: 15,
            disconnect_timeout_secs: 5,
        }
    }
}

/// Shutdown phase tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Running,
    StoppingScheduler,
    StoppingListeners,
    Disconnecting,
    Complete,
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownPhase::Running => write!(f, "running"),
            ShutdownPhase::StoppingScheduler => write!(f, "stopping_scheduler"),
            ShutdownPhase::StoppingListeners => write!(f, "stopping_listeners"),
            ShutdownPhase::Disconnecting => write!(f, "disconnecting"),
            ShutdownPhase::Complete => write!(f, "complete"),
        }
    }
}

/// Boxed step of the shutdown sequence
pub type ShutdownStep = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Graceful shutdown coordinator
pub struct GracefulShutdown {
    config: ShutdownConfig,
    shutdown_requested: AtomicBool,
    signal_tx: watch::Sender<Option<ShutdownSignal>>,
    phase: watch::Sender<ShutdownPhase>,
}

impl GracefulShutdown {
    pub fn new(config: ShutdownConfig) -> Self {
        let (signal_tx, _) = watch::channel(None);
        let (phase, _) = watch::channel(ShutdownPhase::Running);

        Self {
            config,
            shutdown_requested: AtomicBool::new(false),
            signal_tx,
            phase,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ShutdownConfig::default())
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    pub fn current_phase(&self) -> ShutdownPhase {
        *self.phase.borrow()
    }

    pub fn phase_receiver(&self) -> watch::Receiver<ShutdownPhase> {
        self.phase.subscribe()
    }

    /// Request shutdown with specified signal type
    pub fn request_shutdown(&self, signal: ShutdownSignal) {
        if self.shutdown_requested.swap(true, Ordering::SeqCst) {
            warn!("Shutdown already requested, ignoring duplicate signal: {}", signal);
            return;
        }

        info!("Shutdown requested: {}", signal);
        self.signal_tx.send_replace(Some(signal));
    }

    fn set_phase(&self, phase: ShutdownPhase) {
        self.phase.send_replace(phase);
        info!("Shutdown phase: {}", phase);
    }

    /// Token observed by tasks that must stop on shutdown
    pub fn token(&self) -> ShutdownToken {
        ShutdownToken {
            signal_rx: self.signal_tx.subscribe(),
        }
    }

    /// Execute the stop sequence
    ///
    /// Each step gets its own timeout; a step that overruns is logged and
    /// the sequence moves on so the broker session is always released.
    pub async fn execute(
        &self,
        stop_scheduler: ShutdownStep,
        stop_listeners: ShutdownStep,
        disconnect: ShutdownStep,
    ) -> std::result::Result<(), ShutdownError> {
        let start = std::time::Instant::now();
        let urgent = *self.signal_tx.borrow() == Some(ShutdownSignal::Urgent);
        let scale = if urgent { 2 } else { 1 };
        let total_timeout = Duration::from_secs(self.config.total_timeout_secs / scale);

        info!(
            "Starting graceful shutdown (timeout: {}s)",
            total_timeout.as_secs()
        );

        self.set_phase(ShutdownPhase::StoppingScheduler);
        let timeout = Duration::from_secs(self.config.scheduler_stop_timeout_secs / scale);
        if tokio::time::timeout(timeout, stop_scheduler).await.is_err() {
            warn!("Scheduler stop timeout after {}s", timeout.as_secs());
        }

        self.set_phase(ShutdownPhase::StoppingListeners);
        let timeout = Duration::from_secs(self.config.listener_drain_timeout_secs / scale);
        match tokio::time::timeout(timeout, stop_listeners).await {
            Ok(()) => debug!("All listeners stopped"),
            Err(_) => warn!(
                "Listener drain timeout after {}s, proceeding anyway",
                timeout.as_secs()
            ),
        }

        self.set_phase(ShutdownPhase::Disconnecting);
        let timeout = Duration::from_secs(self.config.disconnect_timeout_secs);
        if tokio::time::timeout(timeout, disconnect).await.is_err() {
            warn!("Broker disconnect timeout after {}s", timeout.as_secs());
        }

        self.set_phase(ShutdownPhase::Complete);

        let elapsed = start.elapsed();
        if elapsed > total_timeout {
            error!("Total shutdown timeout exceeded ({:?})", elapsed);
            return Err(ShutdownError::Timeout);
        }

        info!("Graceful shutdown completed in {:?}", elapsed);
        Ok(())
    }
}

/// Cancellation handle for async tasks
#[derive(Clone)]
pub struct ShutdownToken {
    signal_rx: watch::Receiver<Option<ShutdownSignal>>,
}

impl ShutdownToken {
    /// Token that is never cancelled
    pub fn never() -> Self {
        let (_, signal_rx) = watch::channel(None);
        Self { signal_rx }
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal_rx.borrow().is_some()
    }

    /// Resolves once shutdown is requested; pends forever on a `never` token
    pub async fn cancelled(&mut self) -> ShutdownSignal {
        loop {
            if let Some(signal) = *self.signal_rx.borrow_and_update() {
                return signal;
            }
            if self.signal_rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Sleep that fails with `Cancelled` when shutdown interrupts it
    pub async fn sleep(&mut self, duration: Duration) -> Result<()> {
        if self.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.cancelled() => Err(SyncError::Cancelled),
        }
    }
}

/// Shutdown errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ShutdownError {
    #[error("shutdown timed out")]
    Timeout,
}

/// Helper to install OS signal handlers
pub async fn install_signal_handlers(shutdown: Arc<GracefulShutdown>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        for (kind, name, level) in [
            (SignalKind::terminate(), "SIGTERM", ShutdownSignal::Graceful),
            (SignalKind::interrupt(), "SIGINT", ShutdownSignal::Graceful),
            (SignalKind::quit(), "SIGQUIT", ShutdownSignal::Urgent),
        ] {
            let shutdown = shutdown.clone();
            match signal(kind) {
                Ok(mut stream) => {
                    tokio::spawn(async move {
                        stream.recv().await;
                        info!("Received {}", name);
                        shutdown.request_shutdown(level);
                    });
                }
                Err(e) => error!("Failed to install {} handler: {}", name, e),
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received Ctrl+C");
                    shutdown.request_shutdown(ShutdownSignal::Graceful);
                }
                Err(e) => error!("Failed to install Ctrl+C handler: {}", e),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_phase_display() {
        assert_eq!(ShutdownPhase::Running.to_string(), "running");
        assert_eq!(ShutdownPhase::StoppingListeners.to_string(), "stopping_listeners");
        assert_eq!(ShutdownPhase::Complete.to_string(), "complete");
    }

    #[tokio::test]
    async fn test_token_observes_request() {
        let shutdown = GracefulShutdown::with_defaults();
        let mut token = shutdown.token();
        assert!(!token.is_cancelled());

        shutdown.request_shutdown(ShutdownSignal::Graceful);
        assert!(shutdown.is_shutdown_requested());
        assert!(token.is_cancelled());
        assert_eq!(token.cancelled().await, ShutdownSignal::Graceful);
    }

    #[tokio::test]
    async fn test_duplicate_request_keeps_first_signal() {
        let shutdown = GracefulShutdown::with_defaults();
        let mut token = shutdown.token();
        shutdown.request_shutdown(ShutdownSignal::Graceful);
        shutdown.request_shutdown(ShutdownSignal::Urgent);
        assert_eq!(token.cancelled().await, ShutdownSignal::Graceful);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_is_interrupted() {
        let shutdown = Arc::new(GracefulShutdown::with_defaults());
        let mut token = shutdown.token();

        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.request_shutdown(ShutdownSignal::Graceful);
        });

        let result = token.sleep(Duration::from_secs(60)).await;
        assert!(matches!(result, Err(SyncError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_token_sleeps_normally() {
        let mut token = ShutdownToken::never();
        assert!(token.sleep(Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_execute_runs_every_phase() {
        let shutdown = GracefulShutdown::with_defaults();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let step = |name: &'static str| -> ShutdownStep {
            let order = order.clone();
            Box::pin(async move {
                order.lock().unwrap().push(name);
            })
        };

        shutdown
            .execute(step("scheduler"), step("listeners"), step("disconnect"))
            .await
            .unwrap();

        assert_eq!(
            *order.lock().unwrap(),
            vec!["scheduler", "listeners", "disconnect"]
        );
        assert_eq!(shutdown.current_phase(), ShutdownPhase::Complete);
    }
}
