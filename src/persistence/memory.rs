//! RwLock-backed stores with the same constraints as the SQL schema

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use super::traits::{CasOutcome, MessageStore, QueueRegistryStore, RegistryChange};
use crate::domain::{MessageRecord, MessageStatus, MovementType, QueueRegistryEntry};
use crate::error::{Result, SyncError};

#[derive(Default)]
pub struct InMemoryQueueRegistry {
    entries: RwLock<BTreeMap<String, QueueRegistryEntry>>,
}

impl InMemoryQueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl QueueRegistryStore for InMemoryQueueRegistry {
    async fn list_all(&self) -> Result<Vec<QueueRegistryEntry>> {
        Ok(self.entries.read().await.values().cloned().collect())
    }

    async fn get(&self, name: &str) -> Result<Option<QueueRegistryEntry>> {
        Ok(self.entries.read().await.get(name).cloned())
    }

    async fn upsert(&self, entry: &QueueRegistryEntry) -> Result<()> {
        let mut entries = self.entries.write().await;
        upsert_entry(&mut entries, entry);
        Ok(())
    }

    async fn apply_batch(&self, changes: &[RegistryChange]) -> Result<()> {
        let mut entries = self.entries.write().await;
        for change in changes {
            match change {
                RegistryChange::Upsert(entry) => upsert_entry(&mut entries, entry),
                RegistryChange::Deactivate { name } => {
                    if let Some(existing) = entries.get_mut(name) {
                        existing.active = false;
                    }
                }
            }
        }
        Ok(())
    }

    async fn mark_inactive(&self, name: &str) -> Result<bool> {
        let mut entries = self.entries.write().await;
        match entries.get_mut(name) {
            Some(entry) if entry.active => {
                entry.active = false;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn purge_inactive(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.active || e.last_sync_time >= older_than);
        Ok((before - entries.len()) as u64)
    }

    async fn find_stale(&self, since: DateTime<Utc>) -> Result<Vec<QueueRegistryEntry>> {
        Ok(self
            .entries
            .read()
            .await
            .values()
            .filter(|e| e.last_sync_time < since)
            .cloned()
            .collect())
    }
}

/// Upsert keeps the original creation time, like `ON CONFLICT DO UPDATE`
fn upsert_entry(entries: &mut BTreeMap<String, QueueRegistryEntry>, entry: &QueueRegistryEntry) {
    match entries.get_mut(&entry.name) {
        Some(existing) => {
            let created_at = existing.created_at;
            *existing = entry.clone();
            existing.created_at = created_at;
        }
        None => {
            entries.insert(entry.name.clone(), entry.clone());
        }
    }
}

#[derive(Default)]
pub struct InMemoryMessageStore {
    records: RwLock<HashMap<String, MessageRecord>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn all(&self) -> Vec<MessageRecord> {
        let mut all: Vec<_> = self.records.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.transaction_id.cmp(&b.transaction_id));
        all
    }
}

/// One RECE and one DELI per correlation id, like the partial unique index
fn check_leg_slot(records: &HashMap<String, MessageRecord>, record: &MessageRecord) -> Result<()> {
    if !matches!(record.movement_type, MovementType::Rece | MovementType::Deli) {
        return Ok(());
    }
    let Some(correlation) = record.common_reference_id.as_deref() else {
        return Ok(());
    };
    let taken = records.values().any(|r| {
        r.movement_type == record.movement_type
            && r.common_reference_id.as_deref() == Some(correlation)
    });
    if taken {
        return Err(SyncError::Correlation(format!(
            "correlation id already in use: {}",
            correlation
        )));
    }
    Ok(())
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn insert(&self, record: &MessageRecord) -> Result<()> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.transaction_id) {
            return Err(SyncError::DuplicateTransaction(record.transaction_id.clone()));
        }
        check_leg_slot(&records, record)?;
        records.insert(record.transaction_id.clone(), record.clone());
        Ok(())
    }

    async fn insert_pair(&self, first: &MessageRecord, second: &MessageRecord) -> Result<()> {
        let mut records = self.records.write().await;
        for r in [first, second] {
            if records.contains_key(&r.transaction_id) {
                return Err(SyncError::DuplicateTransaction(r.transaction_id.clone()));
            }
        }
        if first.transaction_id == second.transaction_id {
            return Err(SyncError::DuplicateTransaction(first.transaction_id.clone()));
        }
        check_leg_slot(&records, first)?;
        check_leg_slot(&records, second)?;
        records.insert(first.transaction_id.clone(), first.clone());
        records.insert(second.transaction_id.clone(), second.clone());
        Ok(())
    }

    async fn get_by_transaction_id(&self, transaction_id: &str) -> Result<Option<MessageRecord>> {
        Ok(self.records.read().await.get(transaction_id).cloned())
    }

    async fn get_by_message_id(&self, message_id: &str) -> Result<Option<MessageRecord>> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .find(|r| r.message_id.as_deref() == Some(message_id))
            .cloned())
    }

    async fn find_by_common_reference_id(&self, reference_id: &str) -> Result<Vec<MessageRecord>> {
        let mut found: Vec<_> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.common_reference_id.as_deref() == Some(reference_id))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.transaction_id.cmp(&b.transaction_id));
        Ok(found)
    }

    async fn compare_and_swap(&self, updates: &[MessageRecord]) -> Result<CasOutcome> {
        let mut records = self.records.write().await;
        for update in updates {
            match records.get(&update.transaction_id) {
                None => return Ok(CasOutcome::NotFound(update.transaction_id.clone())),
                Some(current) if current.version != update.version => {
                    return Ok(CasOutcome::Conflict(update.transaction_id.clone()))
                }
                Some(_) => {}
            }
        }
        for update in updates {
            let mut stored = update.clone();
            stored.version += 1;
            records.insert(stored.transaction_id.clone(), stored);
        }
        Ok(CasOutcome::Applied)
    }

    async fn list_by_status(&self, status: MessageStatus, limit: i64) -> Result<Vec<MessageRecord>> {
        let mut found: Vec<_> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        found.sort_by_key(|r| r.created_at);
        found.truncate(limit.max(0) as usize);
        Ok(found)
    }

    async fn count_by_status(&self) -> Result<HashMap<MessageStatus, i64>> {
        let mut counts = HashMap::new();
        for record in self.records.read().await.values() {
            *counts.entry(record.status).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BrokerEnvironment, MovementType, QueueInfo};

    fn record(tx: &str) -> MessageRecord {
        MessageRecord::new(tx, MovementType::General, BrokerEnvironment::Local, "q", "{}")
    }

    #[tokio::test]
    async fn insert_enforces_unique_transaction_id() {
        let store = InMemoryMessageStore::new();
        store.insert(&record("T1")).await.unwrap();
        assert!(matches!(
            store.insert(&record("T1")).await,
            Err(SyncError::DuplicateTransaction(_))
        ));
    }

    #[tokio::test]
    async fn correlation_id_holds_one_leg_of_each_kind() {
        let store = InMemoryMessageStore::new();
        let leg = |tx: &str, movement: MovementType| {
            MessageRecord::new(tx, movement, BrokerEnvironment::Local, "q", "{}")
                .with_link("other", "TRADE-1")
        };
        store
            .insert_pair(&leg("A-R", MovementType::Rece), &leg("A-D", MovementType::Deli))
            .await
            .unwrap();

        let err = store
            .insert_pair(&leg("B-R", MovementType::Rece), &leg("B-D", MovementType::Deli))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Correlation(_)));
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn compare_and_swap_detects_stale_versions() {
        let store = InMemoryMessageStore::new();
        store.insert(&record("T1")).await.unwrap();

        let mut first = store.get_by_transaction_id("T1").await.unwrap().unwrap();
        let second = first.clone();

        first.status = MessageStatus::Sent;
        assert_eq!(
            store.compare_and_swap(&[first]).await.unwrap(),
            CasOutcome::Applied
        );
        assert_eq!(
            store.compare_and_swap(&[second]).await.unwrap(),
            CasOutcome::Conflict("T1".into())
        );

        let stored = store.get_by_transaction_id("T1").await.unwrap().unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.status, MessageStatus::Sent);
    }

    #[tokio::test]
    async fn compare_and_swap_is_all_or_nothing() {
        let store = InMemoryMessageStore::new();
        store.insert(&record("A")).await.unwrap();

        let mut a = record("A");
        a.status = MessageStatus::Sent;
        let missing = record("B");
        assert_eq!(
            store.compare_and_swap(&[a, missing]).await.unwrap(),
            CasOutcome::NotFound("B".into())
        );
        let stored = store.get_by_transaction_id("A").await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Created);
    }

    #[tokio::test]
    async fn purge_only_removes_old_inactive_rows() {
        let registry = InMemoryQueueRegistry::new();
        let old = Utc::now() - chrono::Duration::days(60);
        let mut gone = QueueRegistryEntry::from_live(&QueueInfo::new("gone", "p"), old);
        gone.active = false;
        let alive = QueueRegistryEntry::from_live(&QueueInfo::new("alive", "p"), old);
        registry.upsert(&gone).await.unwrap();
        registry.upsert(&alive).await.unwrap();

        let purged = registry
            .purge_inactive(Utc::now() - chrono::Duration::days(30))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(registry.get("gone").await.unwrap().is_none());
        assert!(registry.get("alive").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn upsert_preserves_created_at() {
        let registry = InMemoryQueueRegistry::new();
        let t0 = Utc::now() - chrono::Duration::hours(1);
        let info = QueueInfo::new("q", "p");
        registry
            .upsert(&QueueRegistryEntry::from_live(&info, t0))
            .await
            .unwrap();
        registry
            .upsert(&QueueRegistryEntry::from_live(&info, Utc::now()))
            .await
            .unwrap();
        assert_eq!(registry.get("q").await.unwrap().unwrap().created_at, t0);
    }
}
