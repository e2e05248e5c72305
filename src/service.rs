//! Service assembly
//!
//! Wires the connection supervisor, reconciliation engine, listener
//! supervisor and correlation tracker around one broker adapter and drives
//! the startup and shutdown sequences.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::broker::BrokerAdapter;
use crate::config::AppConfig;
use crate::connection::ConnectionSupervisor;
use crate::coordination::{
    install_signal_handlers, GracefulShutdown, LifecycleManager, ShutdownError, ShutdownStep,
};
use crate::correlation::CorrelationTracker;
use crate::domain::{BrokerEnvironment, SyncStatus};
use crate::error::Result;
use crate::persistence::{MessageStore, QueueRegistryStore};
use crate::reconcile::{ReconciliationEngine, SyncScheduler};
use crate::supervisor::{ListenerEvent, ListenerSupervisor};

pub const CONNECTION: &str = "connection";
pub const INITIAL_SYNC: &str = "initial_sync";
pub const LISTENERS: &str = "listeners";
pub const SCHEDULER: &str = "scheduler";

pub struct Service {
    config: AppConfig,
    connection: Arc<ConnectionSupervisor>,
    engine: Arc<ReconciliationEngine>,
    scheduler: Arc<SyncScheduler>,
    listeners: Arc<ListenerSupervisor>,
    tracker: Arc<CorrelationTracker>,
    lifecycle: LifecycleManager,
    shutdown: Arc<GracefulShutdown>,
}

impl Service {
    pub fn new(
        config: AppConfig,
        adapter: Arc<dyn BrokerAdapter>,
        registry: Arc<dyn QueueRegistryStore>,
        messages: Arc<dyn MessageStore>,
    ) -> Self {
        let shutdown = Arc::new(GracefulShutdown::with_defaults());
        let connection = Arc::new(
            ConnectionSupervisor::new(adapter.clone(), config.broker.clone())
                .with_shutdown(shutdown.token()),
        );
        let engine = Arc::new(ReconciliationEngine::new(connection.clone(), registry.clone()));
        let scheduler = Arc::new(SyncScheduler::new(
            engine.clone(),
            Duration::from_secs(config.sync.interval_secs),
        ));
        let tracker = Arc::new(CorrelationTracker::new(
            messages,
            adapter.clone(),
            BrokerEnvironment::for_host(&config.broker.host),
        ));
        let listeners = Arc::new(
            ListenerSupervisor::new(adapter, config.listener.clone())
                .with_sink(tracker.clone())
                .with_registry(registry),
        );

        Self {
            config,
            connection,
            engine,
            scheduler,
            listeners,
            tracker,
            lifecycle: LifecycleManager::with_defaults(),
            shutdown,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn connection(&self) -> &Arc<ConnectionSupervisor> {
        &self.connection
    }

    pub fn engine(&self) -> &Arc<ReconciliationEngine> {
        &self.engine
    }

    pub fn listeners(&self) -> &Arc<ListenerSupervisor> {
        &self.listeners
    }

    pub fn tracker(&self) -> &Arc<CorrelationTracker> {
        &self.tracker
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    pub fn shutdown_handle(&self) -> Arc<GracefulShutdown> {
        self.shutdown.clone()
    }

    /// Connect, reconcile, start listeners, then the scheduler.
    ///
    /// Steps disabled in config are not registered. If any step fails the
    /// steps that already started are stopped again before the error is
    /// returned.
    pub async fn start(&self) -> Result<()> {
        self.lifecycle.register(CONNECTION, 0).await;
        if self.config.sync.run_on_startup {
            self.lifecycle.register(INITIAL_SYNC, 1).await;
        }
        if self.config.listener.auto_start {
            self.lifecycle.register(LISTENERS, 2).await;
        }
        if self.config.sync.interval_secs > 0 {
            self.lifecycle.register(SCHEDULER, 3).await;
        }

        if let Err(e) = self
            .lifecycle
            .start_all(|name| self.start_component(name))
            .await
        {
            self.lifecycle
                .stop_all(|name| self.stop_component(name), "startup failed")
                .await;
            return Err(e);
        }
        Ok(())
    }

    async fn start_component(&self, name: String) -> Result<()> {
        match name.as_str() {
            CONNECTION => {
                self.connection.connect_with_retry().await?;
                self.connection
                    .wait_until_connected(self.config.broker.timeout())
                    .await
            }
            INITIAL_SYNC => {
                let result = self.engine.sync_all_blocking().await;
                // the scheduler retries; a bad first run does not block startup
                if result.status == SyncStatus::Failed {
                    warn!(
                        error = result.error_message.as_deref().unwrap_or_default(),
                        "Initial reconciliation failed"
                    );
                } else {
                    info!(
                        status = %result.status,
                        total = result.total_queues,
                        created = result.created_queues,
                        updated = result.updated_queues,
                        deleted = result.deleted_queues,
                        "Initial reconciliation finished"
                    );
                }
                Ok(())
            }
            LISTENERS => {
                let outcome = self.listeners.start_all_listeners().await?;
                for (queue, result) in &outcome {
                    if let Err(e) = result {
                        warn!(queue = %queue, error = %e, "Listener did not start");
                    }
                }
                info!(
                    running = self.listeners.running_count(),
                    requested = outcome.len(),
                    "Listeners started"
                );
                Ok(())
            }
            SCHEDULER => {
                self.scheduler.start(self.shutdown.token()).await;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn stop_component(&self, name: String) {
        match name.as_str() {
            CONNECTION => {
                if let Err(e) = self.connection.disconnect().await {
                    warn!(error = %e, "Broker disconnect failed");
                }
            }
            LISTENERS => {
                self.listeners.stop_all_listeners().await;
            }
            SCHEDULER => self.scheduler.stop().await,
            _ => {}
        }
    }

    /// Log listener and connection events until shutdown
    pub fn spawn_event_monitor(&self) -> JoinHandle<()> {
        let mut listener_events = self.listeners.subscribe();
        let mut connection_events = self.connection.subscribe();
        let mut token = self.shutdown.token();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = listener_events.recv() => match event {
                        Ok(ListenerEvent::SelfStopped { queue, error }) => {
                            error!(queue = %queue, error = %error, "Listener stopped after repeated failures");
                        }
                        Ok(ListenerEvent::DeliveryFailed { queue, message_id, error }) => {
                            error!(queue = %queue, message_id = %message_id, error = %error, "Inbound message was not recorded");
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "Listener event monitor lagged");
                        }
                        Err(_) => break,
                    },
                    event = connection_events.recv() => match event {
                        Ok(transition) => info!(
                            from = %transition.from,
                            to = %transition.to,
                            reason = transition.reason.as_deref().unwrap_or_default(),
                            "Broker connection state changed"
                        ),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                        Err(_) => break,
                    },
                }
            }
        })
    }

    /// Stop the scheduler, then the listeners, then release the broker
    pub async fn stop(&self) -> std::result::Result<(), ShutdownError> {
        let scheduler = self.scheduler.clone();
        let listeners = self.listeners.clone();
        let connection = self.connection.clone();

        let stop_scheduler: ShutdownStep = Box::pin(async move { scheduler.stop().await });
        let stop_listeners: ShutdownStep = Box::pin(async move {
            listeners.stop_all_listeners().await;
        });
        let disconnect: ShutdownStep = Box::pin(async move {
            if let Err(e) = connection.disconnect().await {
                warn!(error = %e, "Broker disconnect failed");
            }
        });

        self.shutdown
            .execute(stop_scheduler, stop_listeners, disconnect)
            .await
    }

    /// Start, then block until a termination signal and stop
    pub async fn run(&self) -> Result<()> {
        install_signal_handlers(self.shutdown.clone()).await;
        self.start().await?;
        let monitor = self.spawn_event_monitor();

        let mut token = self.shutdown.token();
        let signal = token.cancelled().await;
        info!(%signal, "Shutdown requested");

        if let Err(e) = self.stop().await {
            warn!(error = %e, "Shutdown did not complete in time");
        }
        monitor.abort();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::coordination::{ComponentState, ShutdownSignal};
    use crate::domain::ConnectionState;
    use crate::persistence::{InMemoryMessageStore, InMemoryQueueRegistry};

    fn service(broker: Arc<InMemoryBroker>, config: AppConfig) -> Service {
        Service::new(
            config,
            broker,
            Arc::new(InMemoryQueueRegistry::new()),
            Arc::new(InMemoryMessageStore::new()),
        )
    }

    fn config() -> AppConfig {
        let mut config = AppConfig::default_config(".");
        config.broker.reconnect_delay_ms = 10;
        config.listener.poll_timeout_ms = 20;
        config.listener.queues = vec!["inbox".into()];
        config
    }

    #[tokio::test]
    async fn full_startup_and_shutdown() {
        let broker = Arc::new(InMemoryBroker::with_queues(["inbox", "outbox"]));
        let service = service(broker, config());

        service.start().await.unwrap();
        assert!(service.lifecycle().all_running().await);
        assert_eq!(service.connection().state(), ConnectionState::Connected);
        assert!(service.listeners().is_listener_running("inbox"));
        assert_eq!(service.engine().statistics().await.unwrap().active_queues, 2);

        service.shutdown_handle().request_shutdown(ShutdownSignal::Graceful);
        service.stop().await.unwrap();
        assert_eq!(service.listeners().running_count(), 0);
        assert_eq!(service.connection().state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn unreachable_broker_aborts_startup() {
        let broker = Arc::new(InMemoryBroker::with_queues(["inbox"]));
        broker.set_connect_failure(Some("host unreachable"));
        let mut config = config();
        config.broker.retry_attempts = 2;
        let service = service(broker, config);

        assert!(service.start().await.is_err());
        assert_eq!(
            service.lifecycle().get_state(CONNECTION).await,
            Some(ComponentState::Failed)
        );
        assert_eq!(
            service.lifecycle().get_state(LISTENERS).await,
            Some(ComponentState::Stopped)
        );
        assert_eq!(service.listeners().running_count(), 0);
    }

    #[tokio::test]
    async fn disabled_steps_are_skipped() {
        let broker = Arc::new(InMemoryBroker::with_queues(["inbox"]));
        let mut config = config();
        config.sync.run_on_startup = false;
        config.listener.auto_start = false;
        config.sync.interval_secs = 0;
        let service = service(broker.clone(), config);

        service.start().await.unwrap();
        assert_eq!(service.lifecycle().startup_order().await, vec![CONNECTION]);
        assert_eq!(service.listeners().running_count(), 0);
        assert_eq!(service.engine().statistics().await.unwrap().total_runs, 0);
    }
}
