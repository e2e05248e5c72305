use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which way traffic flows through a queue from this system's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueDirection {
    IncomingOnly,
    OutgoingOnly,
    Bidirectional,
}

impl QueueDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueDirection::IncomingOnly => "INCOMING_ONLY",
            QueueDirection::OutgoingOnly => "OUTGOING_ONLY",
            QueueDirection::Bidirectional => "BIDIRECTIONAL",
        }
    }

    /// Listeners only make sense on queues we read from
    pub fn accepts_inbound(&self) -> bool {
        !matches!(self, QueueDirection::OutgoingOnly)
    }

    /// Derive a direction from naming conventions
    pub fn classify(name: &str) -> Self {
        let lower = short_name(name).to_ascii_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

        if lower.ends_with("_in") || lower.ends_with(".in") || has(&["incoming", "inbound", "recv"])
        {
            QueueDirection::IncomingOnly
        } else if lower.ends_with("_out")
            || lower.ends_with(".out")
            || has(&["outgoing", "outbound", "send"])
        {
            QueueDirection::OutgoingOnly
        } else {
            QueueDirection::Bidirectional
        }
    }
}

impl fmt::Display for QueueDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for QueueDirection {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_uppercase().as_str() {
            "INCOMING_ONLY" => Ok(QueueDirection::IncomingOnly),
            "OUTGOING_ONLY" => Ok(QueueDirection::OutgoingOnly),
            "BIDIRECTIONAL" => Ok(QueueDirection::Bidirectional),
            _ => Err(format!("Unknown queue direction: {}", s)),
        }
    }
}

/// Business classification tag for a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueuePurpose {
    Settlement,
    Notification,
    System,
    General,
}

impl QueuePurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueuePurpose::Settlement => "settlement",
            QueuePurpose::Notification => "notification",
            QueuePurpose::System => "system",
            QueuePurpose::General => "general",
        }
    }

    pub fn classify(name: &str) -> Self {
        let lower = short_name(name).to_ascii_lowercase();
        if ["settle", "rece", "deli", "trade"]
            .iter()
            .any(|n| lower.contains(n))
        {
            QueuePurpose::Settlement
        } else if ["notif", "alert", "mail", "event"]
            .iter()
            .any(|n| lower.contains(n))
        {
            QueuePurpose::Notification
        } else if ["system", "admin", "dead", "journal", "health"]
            .iter()
            .any(|n| lower.contains(n))
        {
            QueuePurpose::System
        } else {
            QueuePurpose::General
        }
    }
}

impl fmt::Display for QueuePurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for QueuePurpose {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "settlement" => Ok(QueuePurpose::Settlement),
            "notification" => Ok(QueuePurpose::Notification),
            "system" => Ok(QueuePurpose::System),
            "general" => Ok(QueuePurpose::General),
            _ => Err(format!("Unknown queue purpose: {}", s)),
        }
    }
}

/// One queue as reported by a live broker listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueInfo {
    pub name: String,
    pub path: String,
    pub approx_message_count: i64,
    pub queue_type: String,
}

impl QueueInfo {
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            approx_message_count: 0,
            queue_type: "private".to_string(),
        }
    }

    pub fn with_count(mut self, count: i64) -> Self {
        self.approx_message_count = count;
        self
    }
}

/// Persisted registry row for a broker queue, keyed by name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueRegistryEntry {
    pub name: String,
    pub path: String,
    pub queue_type: String,
    pub direction: QueueDirection,
    pub purpose: QueuePurpose,
    pub message_count: i64,
    pub active: bool,
    pub last_sync_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl QueueRegistryEntry {
    /// New active entry for a queue first seen in a live listing
    pub fn from_live(info: &QueueInfo, now: DateTime<Utc>) -> Self {
        Self {
            name: info.name.clone(),
            path: info.path.clone(),
            queue_type: info.queue_type.clone(),
            direction: QueueDirection::classify(&info.name),
            purpose: QueuePurpose::classify(&info.name),
            message_count: info.approx_message_count,
            active: true,
            last_sync_time: now,
            created_at: now,
        }
    }

    /// Refresh from a live listing; returns true when an attribute other than
    /// the sync timestamp changed
    pub fn refresh_from(&mut self, info: &QueueInfo, now: DateTime<Utc>) -> bool {
        let changed = self.path != info.path
            || self.queue_type != info.queue_type
            || self.message_count != info.approx_message_count
            || !self.active;

        self.path = info.path.clone();
        self.queue_type = info.queue_type.clone();
        self.message_count = info.approx_message_count;
        self.active = true;
        self.last_sync_time = now;
        changed
    }
}

/// Strip a `host\private$\` style prefix, leaving the bare queue name
pub fn short_name(name: &str) -> &str {
    name.rsplit(['\\', '/']).next().unwrap_or(name)
}
