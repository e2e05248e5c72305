use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::domain::{MessageRecord, MessageStatus, QueueRegistryEntry};
use crate::error::Result;

/// One registry write in a reconciliation batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryChange {
    Upsert(QueueRegistryEntry),
    Deactivate { name: String },
}

/// Persisted queue registry, keyed by unique queue name
#[async_trait]
pub trait QueueRegistryStore: Send + Sync {
    async fn list_all(&self) -> Result<Vec<QueueRegistryEntry>>;

    async fn get(&self, name: &str) -> Result<Option<QueueRegistryEntry>>;

    async fn upsert(&self, entry: &QueueRegistryEntry) -> Result<()>;

    /// Apply every change or none of them
    async fn apply_batch(&self, changes: &[RegistryChange]) -> Result<()>;

    /// Returns false when no active row with that name exists
    async fn mark_inactive(&self, name: &str) -> Result<bool>;

    /// Hard-delete inactive rows last synced before the cutoff
    async fn purge_inactive(&self, older_than: DateTime<Utc>) -> Result<u64>;

    /// Entries whose last sync time is older than `since`
    async fn find_stale(&self, since: DateTime<Utc>) -> Result<Vec<QueueRegistryEntry>>;
}

/// Outcome of a compare-and-swap write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    Applied,
    NotFound(String),
    Conflict(String),
}

/// Persisted message audit trail, keyed by unique transaction id
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Fails with `DuplicateTransaction` if the transaction id exists
    async fn insert(&self, record: &MessageRecord) -> Result<()>;

    /// Insert both legs of a pair in one unit
    async fn insert_pair(&self, first: &MessageRecord, second: &MessageRecord) -> Result<()>;

    async fn get_by_transaction_id(&self, transaction_id: &str) -> Result<Option<MessageRecord>>;

    async fn get_by_message_id(&self, message_id: &str) -> Result<Option<MessageRecord>>;

    async fn find_by_common_reference_id(&self, reference_id: &str) -> Result<Vec<MessageRecord>>;

    /// Write all records if every stored version still equals the record's
    /// `version`; stored versions become `version + 1`. All or nothing.
    async fn compare_and_swap(&self, records: &[MessageRecord]) -> Result<CasOutcome>;

    async fn list_by_status(&self, status: MessageStatus, limit: i64) -> Result<Vec<MessageRecord>>;

    async fn count_by_status(&self) -> Result<HashMap<MessageStatus, i64>>;
}
