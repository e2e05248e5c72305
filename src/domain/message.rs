use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Settlement movement a message represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MovementType {
    /// Credit / receive leg
    Rece,
    /// Debit / deliver leg
    Deli,
    General,
    System,
}

impl MovementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MovementType::Rece => "RECE",
            MovementType::Deli => "DELI",
            MovementType::General => "GENERAL",
            MovementType::System => "SYSTEM",
        }
    }

    /// The other leg of a settlement pair
    pub fn counterpart(&self) -> Option<MovementType> {
        match self {
            MovementType::Rece => Some(MovementType::Deli),
            MovementType::Deli => Some(MovementType::Rece),
            _ => None,
        }
    }

    pub fn is_leg(&self) -> bool {
        self.counterpart().is_some()
    }
}

impl fmt::Display for MovementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for MovementType {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_uppercase().as_str() {
            "RECE" => Ok(MovementType::Rece),
            "DELI" => Ok(MovementType::Deli),
            "GENERAL" => Ok(MovementType::General),
            "SYSTEM" => Ok(MovementType::System),
            _ => Err(format!("Unknown movement type: {}", s)),
        }
    }
}

/// Message lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageStatus {
    Created,
    Sent,
    Received,
    Peeked,
    Processed,
    Failed,
}

impl MessageStatus {
    pub const ALL: [MessageStatus; 6] = [
        MessageStatus::Created,
        MessageStatus::Sent,
        MessageStatus::Received,
        MessageStatus::Peeked,
        MessageStatus::Processed,
        MessageStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Created => "CREATED",
            MessageStatus::Sent => "SENT",
            MessageStatus::Received => "RECEIVED",
            MessageStatus::Peeked => "PEEKED",
            MessageStatus::Processed => "PROCESSED",
            MessageStatus::Failed => "FAILED",
        }
    }

    /// PROCESSED and FAILED are never left once reached
    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Processed | MessageStatus::Failed)
    }

    /// Check if this status can move to another status
    pub fn can_transition_to(&self, target: MessageStatus) -> bool {
        use MessageStatus::*;

        if self.is_terminal() {
            return false;
        }

        match (self, target) {
            (_, Failed) => true,
            (Created, Sent) => true,
            (Sent, Received) | (Sent, Peeked) => true,
            // a peeked message is later consumed
            (Peeked, Received) => true,
            (Received, Processed) | (Peeked, Processed) => true,
            _ => false,
        }
    }

    /// Get valid next statuses from the current status
    pub fn valid_transitions(&self) -> Vec<MessageStatus> {
        MessageStatus::ALL
            .into_iter()
            .filter(|s| self.can_transition_to(*s))
            .collect()
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl TryFrom<&str> for MessageStatus {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_uppercase().as_str() {
            "CREATED" => Ok(MessageStatus::Created),
            "SENT" => Ok(MessageStatus::Sent),
            "RECEIVED" => Ok(MessageStatus::Received),
            "PEEKED" => Ok(MessageStatus::Peeked),
            "PROCESSED" => Ok(MessageStatus::Processed),
            "FAILED" => Ok(MessageStatus::Failed),
            _ => Err(format!("Unknown message status: {}", s)),
        }
    }
}

/// Where the broker holding the message lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerEnvironment {
    Local,
    Remote,
}

impl BrokerEnvironment {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrokerEnvironment::Local => "local",
            BrokerEnvironment::Remote => "remote",
        }
    }

    pub fn for_host(host: &str) -> Self {
        if crate::broker::is_local_host(host) {
            BrokerEnvironment::Local
        } else {
            BrokerEnvironment::Remote
        }
    }
}

impl fmt::Display for BrokerEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for BrokerEnvironment {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(BrokerEnvironment::Local),
            "remote" => Ok(BrokerEnvironment::Remote),
            _ => Err(format!("Unknown environment: {}", s)),
        }
    }
}

/// Audit record of one message sent to or received from the broker.
///
/// Records are never deleted. `version` increments on every persisted
/// mutation and guards read-modify-write updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub message_id: Option<String>,
    pub transaction_id: String,
    pub linked_transaction_id: Option<String>,
    pub common_reference_id: Option<String>,
    pub movement_type: MovementType,
    pub status: MessageStatus,
    pub environment: BrokerEnvironment,
    pub queue_name: String,
    pub body: String,
    pub error_message: Option<String>,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub received_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl MessageRecord {
    pub fn new(
        transaction_id: impl Into<String>,
        movement_type: MovementType,
        environment: BrokerEnvironment,
        queue_name: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            message_id: None,
            transaction_id: transaction_id.into(),
            linked_transaction_id: None,
            common_reference_id: None,
            movement_type,
            status: MessageStatus::Created,
            environment,
            queue_name: queue_name.into(),
            body: body.into(),
            error_message: None,
            version: 0,
            created_at: Utc::now(),
            sent_at: None,
            received_at: None,
            processed_at: None,
        }
    }

    pub fn with_link(mut self, linked_transaction_id: &str, common_reference_id: &str) -> Self {
        self.linked_transaction_id = Some(linked_transaction_id.to_string());
        self.common_reference_id = Some(common_reference_id.to_string());
        self
    }

    /// Apply a status change in place, stamping the matching timestamp.
    /// Does not touch `version`; stores own that.
    pub fn apply_status(
        &mut self,
        status: MessageStatus,
        error_message: Option<&str>,
        at: DateTime<Utc>,
    ) -> crate::error::Result<()> {
        if !self.status.can_transition_to(status) {
            return Err(crate::error::SyncError::InvalidStateTransition {
                from: self.status.to_string(),
                to: status.to_string(),
            });
        }

        self.status = status;
        match status {
            MessageStatus::Sent => self.sent_at = Some(at),
            MessageStatus::Received | MessageStatus::Peeked => {
                self.received_at.get_or_insert(at);
            }
            MessageStatus::Processed => self.processed_at = Some(at),
            MessageStatus::Created | MessageStatus::Failed => {}
        }
        if let Some(err) = error_message {
            self.error_message = Some(err.to_string());
        }
        Ok(())
    }
}
