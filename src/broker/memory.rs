//! In-process broker used by tests and dry runs.
//!
//! Behaves like a single broker host: queues hold FIFO messages, peek and
//! receive block until a message arrives or the timeout elapses, and every
//! failure mode the engine has to survive can be injected.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use super::addressing::QueueAddress;
use super::traits::{BrokerAdapter, BrokerMessage, QueueListing, SendRequest};
use crate::domain::QueueInfo;
use crate::error::{Result, SyncError};

/// Journal entry for a call made against the fake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerCall {
    Connect,
    Disconnect,
    Probe,
    List(String),
    Peek(String),
    Receive(String),
    Send(String),
}

#[derive(Default)]
struct BrokerState {
    connected: bool,
    queues: BTreeMap<String, VecDeque<BrokerMessage>>,
    connect_failure: Option<String>,
    listing_failure: Option<String>,
    unreadable: HashMap<String, String>,
    read_failures: HashMap<String, u32>,
    send_failures: HashSet<String>,
    connect_latency: Option<Duration>,
    send_latency: Option<Duration>,
    calls: Vec<BrokerCall>,
}

/// Thread-safe in-memory broker
pub struct InMemoryBroker {
    host: String,
    state: Mutex<BrokerState>,
    arrivals: Notify,
    sequence: AtomicU64,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_host(".")
    }

    pub fn with_host(host: &str) -> Self {
        Self {
            host: host.to_string(),
            state: Mutex::new(BrokerState::default()),
            arrivals: Notify::new(),
            sequence: AtomicU64::new(1),
        }
    }

    /// Broker pre-populated with empty queues
    pub fn with_queues<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let broker = Self::new();
        for name in names {
            broker.add_queue(name.as_ref());
        }
        broker
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_queue(&self, name: &str) {
        self.lock().queues.entry(name.to_string()).or_default();
    }

    pub fn remove_queue(&self, name: &str) {
        self.lock().queues.remove(name);
    }

    /// Put a message on a queue as if a remote party had sent it
    pub fn push_message(&self, queue: &str, message: BrokerMessage) {
        self.lock()
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(message);
        self.arrivals.notify_waiters();
    }

    pub fn message_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, VecDeque::len)
    }

    pub fn messages(&self, queue: &str) -> Vec<BrokerMessage> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Make the next connect attempts fail (None clears)
    pub fn set_connect_failure(&self, error: Option<&str>) {
        self.lock().connect_failure = error.map(String::from);
    }

    /// Make whole-host enumeration fail (None clears)
    pub fn set_listing_failure(&self, error: Option<&str>) {
        self.lock().listing_failure = error.map(String::from);
    }

    /// Report a queue as present but unreadable during enumeration
    pub fn set_unreadable(&self, queue: &str, error: Option<&str>) {
        let mut state = self.lock();
        match error {
            Some(e) => {
                state.unreadable.insert(queue.to_string(), e.to_string());
            }
            None => {
                state.unreadable.remove(queue);
            }
        }
    }

    /// Fail the next `count` peek/receive calls on a queue
    pub fn fail_reads(&self, queue: &str, count: u32) {
        self.lock().read_failures.insert(queue.to_string(), count);
        self.arrivals.notify_waiters();
    }

    /// Make sends to a queue fail until cleared
    pub fn set_send_failure(&self, queue: &str, failing: bool) {
        let mut state = self.lock();
        if failing {
            state.send_failures.insert(queue.to_string());
        } else {
            state.send_failures.remove(queue);
        }
    }

    /// Delay every connect by this long before it resolves
    pub fn set_connect_latency(&self, latency: Option<Duration>) {
        self.lock().connect_latency = latency;
    }

    /// Delay the acknowledgement of every send; the message is already
    /// queued while the sender waits
    pub fn set_send_latency(&self, latency: Option<Duration>) {
        self.lock().send_latency = latency;
    }

    /// Drop the session without telling anyone, as a broker restart would
    pub fn drop_session(&self) {
        self.lock().connected = false;
        self.arrivals.notify_waiters();
    }

    pub fn calls(&self) -> Vec<BrokerCall> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self, matches: impl Fn(&BrokerCall) -> bool) -> usize {
        self.lock().calls.iter().filter(|c| matches(c)).count()
    }

    fn next_message_id(&self) -> String {
        format!(
            "{}\\{}",
            Uuid::new_v4(),
            self.sequence.fetch_add(1, Ordering::Relaxed)
        )
    }

    fn info_for(&self, name: &str, depth: usize) -> QueueInfo {
        let address = QueueAddress::new(&self.host, "private$", name);
        QueueInfo::new(name, address.path()).with_count(depth as i64)
    }

    /// Shared peek/receive loop: check, then wait for an arrival until the deadline
    async fn wait_for_head(
        &self,
        queue: &str,
        timeout: Duration,
        remove: bool,
    ) -> Result<Option<BrokerMessage>> {
        let deadline = Instant::now() + timeout;
        let mut first = true;

        loop {
            let notified = self.arrivals.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if first {
                    state.calls.push(if remove {
                        BrokerCall::Receive(queue.to_string())
                    } else {
                        BrokerCall::Peek(queue.to_string())
                    });
                    first = false;
                }
                if !state.connected {
                    return Err(SyncError::Connection("broker session is closed".into()));
                }
                if let Some(remaining) = state.read_failures.get_mut(queue) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        return Err(SyncError::Broker(format!(
                            "read failure injected on {}",
                            queue
                        )));
                    }
                }
                let Some(messages) = state.queues.get_mut(queue) else {
                    return Err(SyncError::Broker(format!("queue not found: {}", queue)));
                };
                let head = if remove {
                    messages.pop_front()
                } else {
                    messages.front().cloned()
                };
                if head.is_some() {
                    return Ok(head);
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return Ok(None);
            }
        }
    }
}

#[async_trait]
impl BrokerAdapter for InMemoryBroker {
    async fn connect(&self) -> Result<()> {
        let latency = {
            let mut state = self.lock();
            state.calls.push(BrokerCall::Connect);
            state.connect_latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.lock();
        if let Some(err) = &state.connect_failure {
            return Err(SyncError::Connection(err.clone()));
        }
        state.connected = true;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(BrokerCall::Disconnect);
        state.connected = false;
        drop(state);
        self.arrivals.notify_waiters();
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        let mut state = self.lock();
        state.calls.push(BrokerCall::Probe);
        state.connected
    }

    async fn list_queues(&self, host: &str) -> Result<QueueListing> {
        let mut state = self.lock();
        state.calls.push(BrokerCall::List(host.to_string()));
        if !state.connected {
            return Err(SyncError::Connection("broker session is closed".into()));
        }
        if let Some(err) = &state.listing_failure {
            return Err(SyncError::Broker(err.clone()));
        }

        let mut listing = QueueListing::default();
        for (name, messages) in &state.queues {
            match state.unreadable.get(name) {
                Some(err) => listing.unreadable.push((name.clone(), err.clone())),
                None => listing.queues.push(self.info_for(name, messages.len())),
            }
        }
        Ok(listing)
    }

    async fn peek(&self, queue: &str, timeout: Duration) -> Result<Option<BrokerMessage>> {
        self.wait_for_head(queue, timeout, false).await
    }

    async fn receive(&self, queue: &str, timeout: Duration) -> Result<Option<BrokerMessage>> {
        self.wait_for_head(queue, timeout, true).await
    }

    async fn send(&self, queue: &str, request: &SendRequest) -> Result<String> {
        let id = self.next_message_id();
        let latency = {
            let mut state = self.lock();
            state.calls.push(BrokerCall::Send(queue.to_string()));
            if !state.connected {
                return Err(SyncError::Connection("broker session is closed".into()));
            }
            if state.send_failures.contains(queue) {
                return Err(SyncError::Broker(format!("send rejected by {}", queue)));
            }
            let Some(messages) = state.queues.get_mut(queue) else {
                return Err(SyncError::Broker(format!("queue not found: {}", queue)));
            };
            messages.push_back(BrokerMessage {
                id: id.clone(),
                label: request.label.clone(),
                body: request.body.clone(),
                correlation_id: request.correlation_id.clone(),
                priority: request.priority,
                arrived_at: Some(Utc::now()),
            });
            state.send_latency
        };
        self.arrivals.notify_waiters();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        Ok(id)
    }
}
