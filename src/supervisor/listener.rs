//! Queue listener supervision
//!
//! Listeners live in an arena keyed by queue name. Each entry has its own
//! async mutex, so start/stop/restart on one queue are serialized while
//! operations on different queues never wait on each other. Status reads go
//! through a separate std mutex and never wait on a start or stop.
//!
//! A listener that stops itself keeps its entry so its failure counters stay
//! visible; an explicit stop removes the entry.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::worker::{InboundSink, ListenerEvent, ListenerStatus, SharedStatus, Worker, WorkerSettings};
use crate::broker::BrokerAdapter;
use crate::config::ListenerConfig;
use crate::error::Result;
use crate::persistence::QueueRegistryStore;
use crate::validation::validate_queue_name;

/// Extra time allowed past the poll timeout for a worker to exit
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Identity of one started listener instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerHandle {
    pub id: u64,
    pub queue_name: String,
    pub started_at: DateTime<Utc>,
}

/// Per-queue outcome of a bulk start or stop
pub type BulkOutcome<T> = BTreeMap<String, std::result::Result<T, String>>;

#[derive(Default)]
struct ListenerControl {
    handle: Option<ListenerHandle>,
    task: Option<JoinHandle<()>>,
    stop_tx: Option<watch::Sender<bool>>,
}

impl ListenerControl {
    fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

#[derive(Default)]
struct ListenerSlot {
    control: Mutex<ListenerControl>,
    status: Arc<SharedStatus>,
}

pub struct ListenerSupervisor {
    adapter: Arc<dyn BrokerAdapter>,
    config: ListenerConfig,
    sink: Option<Arc<dyn InboundSink>>,
    registry: Option<Arc<dyn QueueRegistryStore>>,
    slots: DashMap<String, Arc<ListenerSlot>>,
    event_tx: broadcast::Sender<ListenerEvent>,
    next_id: AtomicU64,
}

impl ListenerSupervisor {
    pub fn new(adapter: Arc<dyn BrokerAdapter>, config: ListenerConfig) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            adapter,
            config,
            sink: None,
            registry: None,
            slots: DashMap::new(),
            event_tx,
            next_id: AtomicU64::new(1),
        }
    }

    /// Forward received messages to this sink
    pub fn with_sink(mut self, sink: Arc<dyn InboundSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Registry consulted by `start_all_listeners` when no queues are configured
    pub fn with_registry(mut self, registry: Arc<dyn QueueRegistryStore>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ListenerEvent> {
        self.event_tx.subscribe()
    }

    fn slot(&self, queue: &str) -> Arc<ListenerSlot> {
        self.slots.entry(queue.to_string()).or_default().clone()
    }

    fn existing_slot(&self, queue: &str) -> Option<Arc<ListenerSlot>> {
        self.slots.get(queue).map(|s| s.value().clone())
    }

    /// Start a listener; returns the running handle if one exists already
    #[instrument(skip(self))]
    pub async fn start_listener(&self, queue: &str) -> Result<ListenerHandle> {
        validate_queue_name(queue)?;
        let slot = self.slot(queue);
        let mut control = slot.control.lock().await;
        self.start_locked(queue, &slot, &mut control)
    }

    fn start_locked(
        &self,
        queue: &str,
        slot: &ListenerSlot,
        control: &mut ListenerControl,
    ) -> Result<ListenerHandle> {
        // a self-stopped worker may still be unwinding; its status says so
        if control.is_running() && slot.status.lock().running {
            if let Some(handle) = &control.handle {
                debug!(queue, "Listener already running");
                return Ok(handle.clone());
            }
        }

        let handle = ListenerHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            queue_name: queue.to_string(),
            started_at: Utc::now(),
        };
        *slot.status.lock() = ListenerStatus {
            running: true,
            started_at: Some(handle.started_at),
            ..Default::default()
        };

        let (stop_tx, stop_rx) = watch::channel(false);
        let worker = Worker {
            queue: queue.to_string(),
            adapter: self.adapter.clone(),
            sink: self.sink.clone(),
            settings: WorkerSettings::from(&self.config),
            status: slot.status.clone(),
            events: self.event_tx.clone(),
            stop_rx,
        };

        control.task = Some(tokio::spawn(worker.run()));
        control.stop_tx = Some(stop_tx);
        control.handle = Some(handle.clone());

        let _ = self.event_tx.send(ListenerEvent::Started {
            queue: queue.to_string(),
        });
        Ok(handle)
    }

    /// Stop a listener; returns false if it was not running
    #[instrument(skip(self))]
    pub async fn stop_listener(&self, queue: &str) -> Result<bool> {
        let Some(slot) = self.existing_slot(queue) else {
            return Ok(false);
        };
        let stopped = {
            let mut control = slot.control.lock().await;
            self.stop_locked(queue, &slot, &mut control).await
        };

        // only the map and this call hold the slot: no start is pending on it
        self.slots
            .remove_if(queue, |_, s| Arc::ptr_eq(s, &slot) && Arc::strong_count(s) == 2);
        stopped
    }

    async fn stop_locked(
        &self,
        queue: &str,
        slot: &ListenerSlot,
        control: &mut ListenerControl,
    ) -> Result<bool> {
        let was_running = control.is_running();
        if let Some(stop_tx) = control.stop_tx.take() {
            stop_tx.send_replace(true);
        }
        control.handle = None;

        let Some(mut task) = control.task.take() else {
            return Ok(false);
        };

        let bound = self.config.poll_timeout() + STOP_GRACE;
        match tokio::time::timeout(bound, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(queue, error = %e, "Listener task ended abnormally"),
            Err(_) => {
                warn!(queue, "Listener did not stop within {:?}, aborting", bound);
                task.abort();
                let mut status = slot.status.lock();
                status.running = false;
                status.stopped_at = Some(Utc::now());
            }
        }

        if was_running {
            info!(queue, "Listener stopped by supervisor");
        }
        Ok(was_running)
    }

    /// Stop then start, as one serialized operation on the queue
    pub async fn restart_listener(&self, queue: &str) -> Result<ListenerHandle> {
        validate_queue_name(queue)?;
        let slot = self.slot(queue);
        let mut control = slot.control.lock().await;
        self.stop_locked(queue, &slot, &mut control).await?;
        self.start_locked(queue, &slot, &mut control)
    }

    /// Queues a bulk start applies to: the configured list, or else every
    /// active registry entry that receives inbound traffic
    pub async fn monitored_queues(&self) -> Result<Vec<String>> {
        if !self.config.queues.is_empty() {
            return Ok(self.config.queues.clone());
        }
        let Some(registry) = &self.registry else {
            return Ok(Vec::new());
        };
        Ok(registry
            .list_all()
            .await?
            .into_iter()
            .filter(|e| e.active && e.direction.accepts_inbound())
            .map(|e| e.name)
            .collect())
    }

    /// Start every monitored queue independently
    pub async fn start_all_listeners(&self) -> Result<BulkOutcome<ListenerHandle>> {
        let queues = self.monitored_queues().await?;
        let results = join_all(queues.iter().map(|q| self.start_listener(q))).await;

        let outcome: BulkOutcome<ListenerHandle> = queues
            .into_iter()
            .zip(results)
            .map(|(q, r)| (q, r.map_err(|e| e.to_string())))
            .collect();
        let failed = outcome.values().filter(|r| r.is_err()).count();
        if failed > 0 {
            warn!(failed, total = outcome.len(), "Some listeners failed to start");
        } else {
            info!(total = outcome.len(), "All listeners started");
        }
        Ok(outcome)
    }

    /// Stop every known listener independently
    pub async fn stop_all_listeners(&self) -> BulkOutcome<bool> {
        let queues: Vec<String> = self.slots.iter().map(|e| e.key().clone()).collect();
        let results = join_all(queues.iter().map(|q| self.stop_listener(q))).await;

        queues
            .into_iter()
            .zip(results)
            .map(|(q, r)| (q, r.map_err(|e| e.to_string())))
            .collect()
    }

    pub fn is_listener_running(&self, queue: &str) -> bool {
        self.existing_slot(queue)
            .is_some_and(|slot| slot.status.lock().running)
    }

    /// Queue name to running flag
    pub fn get_listener_status(&self) -> HashMap<String, bool> {
        self.slots
            .iter()
            .map(|e| (e.key().clone(), e.value().status.lock().running))
            .collect()
    }

    /// Queue name to failure count of its current handle
    pub fn get_retry_counters(&self) -> HashMap<String, u32> {
        self.slots
            .iter()
            .map(|e| (e.key().clone(), e.value().status.lock().retry_count))
            .collect()
    }

    pub fn listener_details(&self, queue: &str) -> Option<ListenerStatus> {
        self.existing_slot(queue).map(|slot| slot.status.snapshot())
    }

    pub fn all_listener_details(&self) -> BTreeMap<String, ListenerStatus> {
        self.slots
            .iter()
            .map(|e| (e.key().clone(), e.value().status.snapshot()))
            .collect()
    }

    pub fn running_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|e| e.value().status.lock().running)
            .count()
    }
}
