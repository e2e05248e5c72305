//! Poll loop run by each queue listener

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerAdapter, BrokerMessage};
use crate::config::ListenerConfig;
use crate::error::Result;

/// Sink attempts per message before the delivery is counted as failed
const DELIVERY_ATTEMPTS: u32 = 3;

/// Receives every message a listener pulls off its queue
#[async_trait]
pub trait InboundSink: Send + Sync {
    async fn on_message(&self, queue: &str, message: &BrokerMessage, peeked: bool) -> Result<()>;
}

/// Per-queue listener statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerStatus {
    pub running: bool,
    /// Failures since the current handle was started
    pub retry_count: u32,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub messages_received: u64,
    /// Messages the sink could not record after every attempt
    pub delivery_failures: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
}

/// Event emitted by listeners
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    Started {
        queue: String,
    },
    Stopped {
        queue: String,
    },
    MessageReceived {
        queue: String,
        message_id: String,
    },
    PollFailed {
        queue: String,
        error: String,
        consecutive: u32,
    },
    /// The sink rejected a message on every attempt
    DeliveryFailed {
        queue: String,
        message_id: String,
        error: String,
    },
    /// Listener gave up after too many consecutive failures
    SelfStopped {
        queue: String,
        error: String,
    },
}

/// Status cell shared between a worker and its supervisor
#[derive(Debug, Default)]
pub(crate) struct SharedStatus(Mutex<ListenerStatus>);

impl SharedStatus {
    pub fn lock(&self) -> MutexGuard<'_, ListenerStatus> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> ListenerStatus {
        self.lock().clone()
    }
}

/// Tunables copied out of the listener config
#[derive(Debug, Clone)]
pub(crate) struct WorkerSettings {
    pub poll_timeout: Duration,
    pub peek_only: bool,
    pub max_consecutive_failures: u32,
    pub failure_backoff: Duration,
}

impl From<&ListenerConfig> for WorkerSettings {
    fn from(config: &ListenerConfig) -> Self {
        Self {
            poll_timeout: config.poll_timeout(),
            peek_only: config.peek_only,
            max_consecutive_failures: config.max_consecutive_failures.max(1),
            failure_backoff: config.failure_backoff(),
        }
    }
}

pub(crate) struct Worker {
    pub queue: String,
    pub adapter: Arc<dyn BrokerAdapter>,
    pub sink: Option<Arc<dyn InboundSink>>,
    pub settings: WorkerSettings,
    pub status: Arc<SharedStatus>,
    pub events: broadcast::Sender<ListenerEvent>,
    pub stop_rx: watch::Receiver<bool>,
}

enum Pause {
    Elapsed,
    Stopped,
}

impl Worker {
    fn stop_requested(&self) -> bool {
        *self.stop_rx.borrow()
    }

    /// Sleep unless the stop signal arrives first
    async fn pause(&mut self, duration: Duration) -> Pause {
        let stop = async { self.stop_rx.wait_for(|stop| *stop).await.is_ok() };
        tokio::select! {
            _ = tokio::time::sleep(duration) => Pause::Elapsed,
            _ = stop => Pause::Stopped,
        }
    }

    /// Run until stopped or until the failure threshold is reached.
    ///
    /// An in-flight peek or receive is allowed to finish; the stop signal is
    /// checked between calls, so shutdown latency is bounded by the poll
    /// timeout.
    pub async fn run(mut self) {
        info!(queue = %self.queue, peek_only = self.settings.peek_only, "Listener started");
        let mut last_peeked: Option<String> = None;

        while !self.stop_requested() {
            let polled = if self.settings.peek_only {
                self.adapter.peek(&self.queue, self.settings.poll_timeout).await
            } else {
                self.adapter.receive(&self.queue, self.settings.poll_timeout).await
            };

            match polled {
                Ok(Some(message)) => {
                    self.status.lock().consecutive_failures = 0;

                    if self.settings.peek_only && last_peeked.as_deref() == Some(message.id.as_str()) {
                        // head unchanged since last peek
                        if let Pause::Stopped = self.pause(self.settings.poll_timeout).await {
                            break;
                        }
                        continue;
                    }
                    if self.settings.peek_only {
                        last_peeked = Some(message.id.clone());
                    }
                    self.deliver(&message).await;
                }
                Ok(None) => {
                    self.status.lock().consecutive_failures = 0;
                }
                Err(e) => {
                    let error = e.to_string();
                    let consecutive = {
                        let mut status = self.status.lock();
                        status.retry_count += 1;
                        status.consecutive_failures += 1;
                        status.last_error = Some(error.clone());
                        status.consecutive_failures
                    };
                    warn!(queue = %self.queue, consecutive, error = %error, "Listener poll failed");
                    let _ = self.events.send(ListenerEvent::PollFailed {
                        queue: self.queue.clone(),
                        error: error.clone(),
                        consecutive,
                    });

                    if consecutive >= self.settings.max_consecutive_failures {
                        error!(
                            queue = %self.queue,
                            consecutive,
                            "Listener reached failure threshold, stopping"
                        );
                        self.finish();
                        let _ = self.events.send(ListenerEvent::SelfStopped {
                            queue: self.queue.clone(),
                            error,
                        });
                        return;
                    }

                    if let Pause::Stopped = self.pause(self.settings.failure_backoff).await {
                        break;
                    }
                }
            }
        }

        self.finish();
        info!(queue = %self.queue, "Listener stopped");
        let _ = self.events.send(ListenerEvent::Stopped {
            queue: self.queue.clone(),
        });
    }

    async fn deliver(&mut self, message: &BrokerMessage) {
        self.status.lock().messages_received += 1;
        debug!(queue = %self.queue, message_id = %message.id, "Message received");

        if let Some(sink) = self.sink.clone() {
            let mut failure = None;
            for attempt in 1..=DELIVERY_ATTEMPTS {
                match sink
                    .on_message(&self.queue, message, self.settings.peek_only)
                    .await
                {
                    Ok(()) => {
                        failure = None;
                        break;
                    }
                    Err(e) => {
                        warn!(
                            queue = %self.queue,
                            message_id = %message.id,
                            attempt,
                            error = %e,
                            "Inbound message could not be recorded"
                        );
                        failure = Some(e.to_string());
                        if attempt < DELIVERY_ATTEMPTS {
                            if let Pause::Stopped = self.pause(self.settings.failure_backoff).await {
                                break;
                            }
                        }
                    }
                }
            }
            if let Some(error) = failure {
                self.delivery_failed(message, error);
            }
        }

        let _ = self.events.send(ListenerEvent::MessageReceived {
            queue: self.queue.clone(),
            message_id: message.id.clone(),
        });
    }

    /// The message may already be gone from the broker; keep the failure visible
    fn delivery_failed(&self, message: &BrokerMessage, error: String) {
        {
            let mut status = self.status.lock();
            status.delivery_failures += 1;
            status.last_error = Some(format!("delivery of {} failed: {}", message.id, error));
        }
        error!(
            queue = %self.queue,
            message_id = %message.id,
            consumed = !self.settings.peek_only,
            error = %error,
            "Inbound message dropped after {} attempts",
            DELIVERY_ATTEMPTS
        );
        let _ = self.events.send(ListenerEvent::DeliveryFailed {
            queue: self.queue.clone(),
            message_id: message.id.clone(),
            error,
        });
    }

    fn finish(&self) {
        let mut status = self.status.lock();
        status.running = false;
        status.stopped_at = Some(Utc::now());
    }
}
