use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain::QueueInfo;
use crate::error::Result;

/// A message as handed back by the broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerMessage {
    pub id: String,
    pub label: Option<String>,
    pub body: String,
    pub correlation_id: Option<String>,
    pub priority: u8,
    pub arrived_at: Option<DateTime<Utc>>,
}

/// Outbound message parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRequest {
    pub body: String,
    pub label: Option<String>,
    /// 0 (lowest) ..= 7 (highest)
    pub priority: u8,
    pub correlation_id: Option<String>,
}

impl SendRequest {
    pub const DEFAULT_PRIORITY: u8 = 3;

    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            label: None,
            priority: Self::DEFAULT_PRIORITY,
            correlation_id: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.min(7);
        self
    }
}

/// Result of enumerating a broker host.
///
/// `unreadable` lists queues known to exist whose details could not be read;
/// callers must neither create nor retire registry rows for them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueListing {
    pub queues: Vec<QueueInfo>,
    pub unreadable: Vec<(String, String)>,
}

impl QueueListing {
    pub fn contains(&self, name: &str) -> bool {
        self.queues.iter().any(|q| q.name == name)
            || self.unreadable.iter().any(|(n, _)| n == name)
    }

    pub fn get(&self, name: &str) -> Option<&QueueInfo> {
        self.queues.iter().find(|q| q.name == name)
    }
}

/// Capability set the engine consumes from a message broker
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    /// Open a session with the configured broker
    async fn connect(&self) -> Result<()>;

    /// Close the session; closing an already closed session is not an error
    async fn disconnect(&self) -> Result<()>;

    /// Live probe of the session
    async fn is_connected(&self) -> bool;

    /// Enumerate queues on a host ("." for the local machine)
    async fn list_queues(&self, host: &str) -> Result<QueueListing>;

    /// Look at the head message without removing it, waiting up to `timeout`
    async fn peek(&self, queue: &str, timeout: Duration) -> Result<Option<BrokerMessage>>;

    /// Remove and return the head message, waiting up to `timeout`
    async fn receive(&self, queue: &str, timeout: Duration) -> Result<Option<BrokerMessage>>;

    /// Send a message, returning the broker-assigned message id
    async fn send(&self, queue: &str, request: &SendRequest) -> Result<String>;

    /// Whether a named queue exists on the host
    async fn queue_exists(&self, host: &str, name: &str) -> Result<bool> {
        Ok(self.list_queues(host).await?.contains(name))
    }
}
