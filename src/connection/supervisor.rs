//! Broker connection state machine
//!
//! One supervisor owns the process's view of the broker session. Mutating
//! operations are serialized on `op_lock`; readers take a copy of the
//! published snapshot and never block on an in-flight connect.

use chrono::Utc;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, instrument, warn};

use crate::broker::BrokerAdapter;
use crate::config::BrokerConfig;
use crate::coordination::ShutdownToken;
use crate::domain::{ConnectionState, ConnectionStatus, ConnectionTransition};
use crate::error::{Result, SyncError};

/// Transitions kept in the in-memory journal
const JOURNAL_CAPACITY: usize = 128;

/// Event broadcast on every state change
pub type ConnectionEvent = ConnectionTransition;

/// Armed while a connect or disconnect is in flight. If the owning future
/// is dropped before `settle`, the transient state is moved to ERROR so the
/// next operation starts from a state it can leave.
struct InFlight<'a> {
    supervisor: &'a ConnectionSupervisor,
    operation: &'static str,
    settled: bool,
}

impl<'a> InFlight<'a> {
    fn new(supervisor: &'a ConnectionSupervisor, operation: &'static str) -> Self {
        Self {
            supervisor,
            operation,
            settled: false,
        }
    }

    fn settle(mut self) {
        self.settled = true;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let state = self.supervisor.state();
        if matches!(state, ConnectionState::Connecting | ConnectionState::Disconnecting) {
            let reason = format!("{} interrupted", self.operation);
            warn!(state = %state, "Broker {} was cancelled mid-flight", self.operation);
            let _ = self.supervisor.transition(ConnectionState::Error, Some(reason.clone()), |s| {
                s.last_error = Some(reason.clone());
            });
        }
    }
}

pub struct ConnectionSupervisor {
    adapter: Arc<dyn BrokerAdapter>,
    config: BrokerConfig,
    op_lock: tokio::sync::Mutex<()>,
    status_tx: watch::Sender<ConnectionStatus>,
    event_tx: broadcast::Sender<ConnectionEvent>,
    journal: Mutex<VecDeque<ConnectionTransition>>,
    shutdown: ShutdownToken,
}

impl ConnectionSupervisor {
    pub fn new(adapter: Arc<dyn BrokerAdapter>, config: BrokerConfig) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus {
            state: ConnectionState::Disconnected,
            host: config.host.clone(),
            port: config.port,
            retry_count: 0,
            last_connected_at: None,
            last_error: None,
        });
        let (event_tx, _) = broadcast::channel(64);

        Self {
            adapter,
            config,
            op_lock: tokio::sync::Mutex::new(()),
            status_tx,
            event_tx,
            journal: Mutex::new(VecDeque::with_capacity(JOURNAL_CAPACITY)),
            shutdown: ShutdownToken::never(),
        }
    }

    /// Interrupt backoff delays when this token is cancelled
    pub fn with_shutdown(mut self, shutdown: ShutdownToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn adapter(&self) -> Arc<dyn BrokerAdapter> {
        self.adapter.clone()
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Immutable snapshot of the current connection
    pub fn get_status(&self) -> ConnectionStatus {
        self.status_tx.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.status_tx.borrow().state
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.event_tx.subscribe()
    }

    pub fn status_receiver(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    /// Recorded transitions, oldest first
    pub fn transitions(&self) -> Vec<ConnectionTransition> {
        self.lock_journal().iter().cloned().collect()
    }

    fn lock_journal(&self) -> std::sync::MutexGuard<'_, VecDeque<ConnectionTransition>> {
        self.journal.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply one validated transition and publish it.
    /// Callers must hold `op_lock`.
    fn transition(
        &self,
        to: ConnectionState,
        reason: Option<String>,
        update: impl FnOnce(&mut ConnectionStatus),
    ) -> Result<()> {
        let from = self.state();
        if !from.can_transition_to(to) {
            return Err(SyncError::InvalidStateTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        self.status_tx.send_modify(|status| {
            status.state = to;
            update(status);
        });

        let event = ConnectionTransition::new(from, to, reason);
        debug!(from = %from, to = %to, "Connection transition");
        {
            let mut journal = self.lock_journal();
            if journal.len() == JOURNAL_CAPACITY {
                journal.pop_front();
            }
            journal.push_back(event.clone());
        }
        let _ = self.event_tx.send(event);
        Ok(())
    }

    /// Open the broker session
    ///
    /// Always passes through CONNECTING and counts the attempt. A failure
    /// leaves the supervisor in ERROR and surfaces as `SyncError::Connection`.
    #[instrument(skip(self), fields(host = %self.config.host))]
    pub async fn connect(&self) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        self.connect_locked().await
    }

    async fn connect_locked(&self) -> Result<()> {
        if self.state() == ConnectionState::Connected {
            debug!("Already connected");
            return Ok(());
        }

        self.transition(ConnectionState::Connecting, None, |s| s.retry_count += 1)?;
        let in_flight = InFlight::new(self, "connect");

        let timeout = self.config.timeout();
        let outcome = match tokio::time::timeout(timeout, self.adapter.connect()).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::BrokerTimeout {
                operation: "connect".into(),
                elapsed_ms: timeout.as_millis() as u64,
            }),
        };
        in_flight.settle();

        match outcome {
            Ok(()) => {
                let now = Utc::now();
                self.transition(ConnectionState::Connected, None, |s| {
                    s.last_connected_at = Some(now);
                    s.last_error = None;
                })?;
                info!(host = %self.config.host, port = self.config.port, "Connected to broker");
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                warn!(host = %self.config.host, error = %message, "Broker connect failed");
                self.transition(ConnectionState::Error, Some(message.clone()), |s| {
                    s.last_error = Some(message.clone());
                })?;
                Err(SyncError::Connection(message))
            }
        }
    }

    /// Close the session; a no-op when already disconnected
    #[instrument(skip(self))]
    pub async fn disconnect(&self) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        self.disconnect_locked().await
    }

    async fn disconnect_locked(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Disconnected => return Ok(()),
            ConnectionState::Connected | ConnectionState::Error => {}
            other => {
                return Err(SyncError::InvalidStateTransition {
                    from: other.to_string(),
                    to: ConnectionState::Disconnecting.to_string(),
                })
            }
        }

        self.transition(ConnectionState::Disconnecting, None, |_| {})?;
        let in_flight = InFlight::new(self, "disconnect");
        if let Err(e) = self.adapter.disconnect().await {
            // the session is abandoned either way
            warn!(error = %e, "Broker disconnect reported an error");
        }
        in_flight.settle();
        self.transition(ConnectionState::Disconnected, None, |_| {})?;
        info!("Disconnected from broker");
        Ok(())
    }

    /// Disconnect, wait the reconnect delay, connect again.
    /// A shutdown during the delay returns `SyncError::Cancelled`.
    pub async fn reconnect(&self) -> Result<()> {
        if let Err(e) = self.disconnect().await {
            warn!(error = %e, "Disconnect before reconnect failed");
        }

        let mut shutdown = self.shutdown.clone();
        shutdown.sleep(self.config.reconnect_delay()).await?;

        self.connect().await
    }

    /// Connect with up to `retry_attempts` tries and a fixed delay between them
    pub async fn connect_with_retry(&self) -> Result<()> {
        let attempts = self.config.retry_attempts.max(1);
        let mut shutdown = self.shutdown.clone();
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(attempt, attempts, error = %e, "Connect attempt failed");
                    last_error = Some(e);
                }
            }
            if attempt < attempts {
                shutdown.sleep(self.config.reconnect_delay()).await?;
            }
        }

        Err(last_error.unwrap_or_else(|| SyncError::Connection("no connect attempt made".into())))
    }

    /// Live check: cached CONNECTED state confirmed by an adapter probe.
    /// A failed probe moves the supervisor to ERROR.
    pub async fn is_connected(&self) -> bool {
        if self.state() != ConnectionState::Connected {
            return false;
        }

        let alive = tokio::time::timeout(self.config.timeout(), self.adapter.is_connected())
            .await
            .unwrap_or(false);
        if alive {
            return true;
        }

        let _guard = self.op_lock.lock().await;
        if self.state() == ConnectionState::Connected {
            let reason = "broker session dropped".to_string();
            warn!(host = %self.config.host, "Liveness probe failed, marking connection as errored");
            let _ = self.transition(ConnectionState::Error, Some(reason.clone()), |s| {
                s.last_error = Some(reason.clone());
            });
        }
        false
    }

    /// Make sure the session is live, reconnecting once if it is not
    pub async fn ensure_connected(&self) -> Result<()> {
        if self.is_connected().await {
            return Ok(());
        }
        self.connect().await
    }

    /// Readiness signal: resolves when the state becomes CONNECTED
    pub async fn wait_until_connected(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.status_tx.subscribe();
        let ready = tokio::time::timeout(timeout, async {
            rx.wait_for(|s| s.state == ConnectionState::Connected)
                .await
                .is_ok()
        })
        .await;

        match ready {
            Ok(true) => Ok(()),
            Ok(false) => Err(SyncError::Cancelled),
            Err(_) => Err(SyncError::Connection(format!(
                "broker not ready after {}ms",
                timeout.as_millis()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerCall, InMemoryBroker, MockBrokerAdapter};
    use crate::coordination::{GracefulShutdown, ShutdownSignal};

    fn config() -> BrokerConfig {
        BrokerConfig {
            reconnect_delay_ms: 50,
            ..BrokerConfig::default()
        }
    }

    fn supervisor(broker: Arc<InMemoryBroker>) -> ConnectionSupervisor {
        ConnectionSupervisor::new(broker, config())
    }

    #[tokio::test]
    async fn connect_passes_through_connecting() {
        let broker = Arc::new(InMemoryBroker::new());
        let sup = supervisor(broker);

        sup.connect().await.unwrap();

        let states: Vec<_> = sup.transitions().iter().map(|t| t.to).collect();
        assert_eq!(
            states,
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
        let status = sup.get_status();
        assert_eq!(status.state, ConnectionState::Connected);
        assert_eq!(status.retry_count, 1);
        assert!(status.last_connected_at.is_some());
    }

    #[tokio::test]
    async fn failed_connect_lands_in_error() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.set_connect_failure(Some("access denied"));
        let sup = supervisor(broker.clone());

        let err = sup.connect().await.unwrap_err();
        assert!(matches!(err, SyncError::Connection(_)));
        assert_eq!(sup.state(), ConnectionState::Error);
        assert!(sup.get_status().last_error.unwrap().contains("access denied"));

        // ERROR -> CONNECTING -> CONNECTED once the broker recovers
        broker.set_connect_failure(None);
        sup.connect().await.unwrap();
        assert_eq!(sup.get_status().retry_count, 2);
        assert!(sup.get_status().last_error.is_none());
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let broker = Arc::new(InMemoryBroker::new());
        let sup = supervisor(broker.clone());

        sup.disconnect().await.unwrap();
        assert!(sup.transitions().is_empty());

        sup.connect().await.unwrap();
        sup.disconnect().await.unwrap();
        sup.disconnect().await.unwrap();

        let states: Vec<_> = sup.transitions().iter().map(|t| t.to).collect();
        assert_eq!(
            states,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnecting,
                ConnectionState::Disconnected,
            ]
        );
        assert_eq!(broker.call_count(|c| *c == BrokerCall::Disconnect), 1);
    }

    #[tokio::test]
    async fn is_connected_detects_silent_drop() {
        let broker = Arc::new(InMemoryBroker::new());
        let sup = supervisor(broker.clone());
        sup.connect().await.unwrap();
        assert!(sup.is_connected().await);

        broker.drop_session();
        assert!(!sup.is_connected().await);
        assert_eq!(sup.state(), ConnectionState::Error);
    }

    #[tokio::test]
    async fn is_connected_probes_the_adapter() {
        let mut mock = MockBrokerAdapter::new();
        mock.expect_connect().times(1).returning(|| Ok(()));
        mock.expect_is_connected().times(1).returning(|| true);

        let sup = ConnectionSupervisor::new(Arc::new(mock), config());
        sup.connect().await.unwrap();
        assert!(sup.is_connected().await);
    }

    #[tokio::test]
    async fn is_connected_skips_probe_when_not_connected() {
        let mut mock = MockBrokerAdapter::new();
        mock.expect_is_connected().times(0);

        let sup = ConnectionSupervisor::new(Arc::new(mock), config());
        assert!(!sup.is_connected().await);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_with_retry_is_bounded() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.set_connect_failure(Some("refused"));
        let sup = supervisor(broker.clone());

        assert!(sup.connect_with_retry().await.is_err());
        assert_eq!(
            broker.call_count(|c| *c == BrokerCall::Connect),
            config().retry_attempts as usize
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_is_cancelled_by_shutdown() {
        let shutdown = GracefulShutdown::with_defaults();
        let broker = Arc::new(InMemoryBroker::new());
        let sup = ConnectionSupervisor::new(broker.clone(), config()).with_shutdown(shutdown.token());
        sup.connect().await.unwrap();

        shutdown.request_shutdown(ShutdownSignal::Graceful);
        let err = sup.reconnect().await.unwrap_err();
        assert!(matches!(err, SyncError::Cancelled));
        assert_eq!(sup.state(), ConnectionState::Disconnected);
        assert_eq!(broker.call_count(|c| *c == BrokerCall::Connect), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_until_connected_signals_readiness() {
        let broker = Arc::new(InMemoryBroker::new());
        let sup = Arc::new(supervisor(broker));

        let waiter = {
            let sup = sup.clone();
            tokio::spawn(async move { sup.wait_until_connected(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        sup.connect().await.unwrap();

        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_until_connected_times_out() {
        let sup = supervisor(Arc::new(InMemoryBroker::new()));
        let result = sup.wait_until_connected(Duration::from_millis(100)).await;
        assert!(matches!(result, Err(SyncError::Connection(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_connect_leaves_a_recoverable_state() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.set_connect_latency(Some(Duration::from_secs(10)));
        let sup = supervisor(broker.clone());

        let cancelled = tokio::time::timeout(Duration::from_millis(50), sup.connect()).await;
        assert!(cancelled.is_err());
        assert_eq!(sup.state(), ConnectionState::Error);
        assert_eq!(
            sup.get_status().last_error.as_deref(),
            Some("connect interrupted")
        );

        broker.set_connect_latency(None);
        sup.connect().await.unwrap();
        assert_eq!(sup.state(), ConnectionState::Connected);
        sup.disconnect().await.unwrap();
        assert_eq!(sup.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn events_are_broadcast() {
        let sup = supervisor(Arc::new(InMemoryBroker::new()));
        let mut events = sup.subscribe();
        sup.connect().await.unwrap();

        let first = events.recv().await.unwrap();
        assert_eq!(first.from, ConnectionState::Disconnected);
        assert_eq!(first.to, ConnectionState::Connecting);
        let second = events.recv().await.unwrap();
        assert_eq!(second.to, ConnectionState::Connected);
    }
}
