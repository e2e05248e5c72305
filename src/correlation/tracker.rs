//! Paired message tracking
//!
//! Every status change is a read-modify-write guarded by the record's
//! `version`. Writes that touch a correlated record additionally hold the
//! per-correlation-id lock, so a paired update and a single-leg update on
//! the same pair never interleave.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::ids::{self, PairIds, INBOUND_PREFIX};
use crate::broker::{BrokerAdapter, BrokerMessage, SendRequest};
use crate::domain::{
    BrokerEnvironment, MessageRecord, MessageStatus, MovementType, SettlementRequest,
};
use crate::error::{Result, SyncError};
use crate::persistence::{CasOutcome, MessageStore};
use crate::supervisor::InboundSink;
use crate::validation::{validate_queue_name, validate_settlement_request};

/// Read-modify-write attempts before giving up on a contended record
const MAX_UPDATE_ATTEMPTS: u32 = 5;

/// Result of sending one leg of a pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegResult {
    pub transaction_id: String,
    pub movement_type: MovementType,
    pub status: MessageStatus,
    pub message_id: Option<String>,
    pub error: Option<String>,
}

impl LegResult {
    fn from_record(record: &MessageRecord) -> Self {
        Self {
            transaction_id: record.transaction_id.clone(),
            movement_type: record.movement_type,
            status: record.status,
            message_id: record.message_id.clone(),
            error: record.error_message.clone(),
        }
    }

    pub fn is_sent(&self) -> bool {
        self.status == MessageStatus::Sent
    }
}

/// Result of `create_paired`; each leg reports its own outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairedResult {
    pub correlation_id: String,
    pub rece: LegResult,
    pub deli: LegResult,
}

impl PairedResult {
    pub fn is_complete(&self) -> bool {
        self.rece.is_sent() && self.deli.is_sent()
    }

    pub fn failed_legs(&self) -> Vec<&LegResult> {
        [&self.rece, &self.deli]
            .into_iter()
            .filter(|leg| leg.status == MessageStatus::Failed)
            .collect()
    }
}

/// Outcome of a status update on one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated(MessageRecord),
    /// Already in the requested status; nothing written
    Unchanged(MessageRecord),
    NotFound,
    /// The state machine forbids the move
    Rejected {
        current: MessageStatus,
        requested: MessageStatus,
    },
}

impl UpdateOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, UpdateOutcome::Updated(_) | UpdateOutcome::Unchanged(_))
    }

    pub fn record(&self) -> Option<&MessageRecord> {
        match self {
            UpdateOutcome::Updated(r) | UpdateOutcome::Unchanged(r) => Some(r),
            _ => None,
        }
    }
}

/// Outcome of a paired status update.
///
/// Either every leg is applied or nothing is written; `legs` says which
/// leg blocked the update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairedUpdate {
    pub correlation_id: String,
    pub applied: bool,
    pub legs: BTreeMap<String, UpdateOutcome>,
}

impl PairedUpdate {
    pub fn failed_legs(&self) -> Vec<&str> {
        self.legs
            .iter()
            .filter(|(_, o)| !o.is_applied())
            .map(|(tx, _)| tx.as_str())
            .collect()
    }
}

pub struct CorrelationTracker {
    store: Arc<dyn MessageStore>,
    adapter: Arc<dyn BrokerAdapter>,
    environment: BrokerEnvironment,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl CorrelationTracker {
    pub fn new(
        store: Arc<dyn MessageStore>,
        adapter: Arc<dyn BrokerAdapter>,
        environment: BrokerEnvironment,
    ) -> Self {
        Self {
            store,
            adapter,
            environment,
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, correlation_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(correlation_id.to_string())
            .or_default()
            .clone()
    }

    fn release_lock(&self, correlation_id: &str, lock: Arc<Mutex<()>>) {
        drop(lock);
        self.locks
            .remove_if(correlation_id, |_, l| Arc::strong_count(l) == 1);
    }

    // ==================== Creation ====================

    /// Persist and send both legs of a settlement.
    ///
    /// Both records are stored as CREATED before anything is sent, so the
    /// audit trail exists even if the process dies mid-send. Each leg then
    /// moves to SENT or FAILED on its own. The correlation lock is held from
    /// the uniqueness check until both legs are settled.
    #[instrument(skip(self, request), fields(security = %request.security_id, queue = %request.queue_name))]
    pub async fn create_paired(&self, request: &SettlementRequest) -> Result<PairedResult> {
        validate_settlement_request(request)?;

        let ids = PairIds::generate(Utc::now().date_naive(), request.correlation_id.as_deref());
        let lock = self.lock_for(&ids.correlation);
        let result = {
            let _guard = lock.lock().await;
            self.create_paired_locked(request, &ids).await
        };
        self.release_lock(&ids.correlation, lock);

        let result = result?;
        if !result.is_complete() {
            warn!(
                correlation = %result.correlation_id,
                failed = result.failed_legs().len(),
                "Settlement pair partially sent"
            );
        }
        Ok(result)
    }

    async fn create_paired_locked(
        &self,
        request: &SettlementRequest,
        ids: &PairIds,
    ) -> Result<PairedResult> {
        if !self
            .store
            .find_by_common_reference_id(&ids.correlation)
            .await?
            .is_empty()
        {
            return Err(SyncError::Correlation(format!(
                "correlation id already in use: {}",
                ids.correlation
            )));
        }

        let rece = self.leg_record(request, ids, MovementType::Rece)?;
        let deli = self.leg_record(request, ids, MovementType::Deli)?;
        self.store.insert_pair(&rece, &deli).await?;
        info!(
            rece = %ids.rece,
            deli = %ids.deli,
            correlation = %ids.correlation,
            "Settlement pair created"
        );

        Ok(PairedResult {
            correlation_id: ids.correlation.clone(),
            rece: self.send_leg(rece).await,
            deli: self.send_leg(deli).await,
        })
    }

    fn leg_record(
        &self,
        request: &SettlementRequest,
        ids: &PairIds,
        movement: MovementType,
    ) -> Result<MessageRecord> {
        let (own, other) = match movement {
            MovementType::Rece => (&ids.rece, &ids.deli),
            _ => (&ids.deli, &ids.rece),
        };
        let body = serde_json::to_string(&request.instruction(movement, own, other, &ids.correlation))?;

        Ok(
            MessageRecord::new(own.as_str(), movement, self.environment, request.queue_name.as_str(), body)
                .with_link(other, &ids.correlation),
        )
    }

    /// Send one leg; an error is reported on the leg, never raised.
    /// Caller holds the pair's correlation lock.
    async fn send_leg(&self, record: MessageRecord) -> LegResult {
        let tx = record.transaction_id.clone();
        let error = match self.send_record(record.clone()).await {
            Ok(sent) => return LegResult::from_record(&sent),
            Err(e) => e.to_string(),
        };
        warn!(tx = %tx, error = %error, "Settlement leg outcome could not be recorded");

        // best effort: the store may be what failed
        let status = match self
            .update_single(&tx, MessageStatus::Failed, Some(&error))
            .await
        {
            Ok(UpdateOutcome::Updated(r)) | Ok(UpdateOutcome::Unchanged(r)) => r.status,
            Ok(UpdateOutcome::Rejected { current, .. }) => current,
            Ok(UpdateOutcome::NotFound) | Err(_) => record.status,
        };
        LegResult {
            transaction_id: tx,
            movement_type: record.movement_type,
            status,
            message_id: None,
            error: Some(error),
        }
    }

    /// Send a stored CREATED record and persist SENT or FAILED
    async fn send_record(&self, record: MessageRecord) -> Result<MessageRecord> {
        let mut request = SendRequest::new(record.body.clone())
            .with_label(record.transaction_id.clone());
        if let Some(correlation) = &record.common_reference_id {
            request = request.with_correlation_id(correlation.clone());
        }

        let outcome = match self.adapter.send(&record.queue_name, &request).await {
            Ok(message_id) => {
                debug!(tx = %record.transaction_id, message_id = %message_id, "Message sent");
                Ok(message_id)
            }
            Err(e) => {
                warn!(tx = %record.transaction_id, error = %e, "Message send failed");
                Err(e.to_string())
            }
        };
        self.record_send_outcome(record, &outcome).await
    }

    /// Persist a send outcome. A listener may have advanced the record in
    /// the meantime; on conflict the outcome is merged into the fresh copy.
    async fn record_send_outcome(
        &self,
        mut record: MessageRecord,
        outcome: &std::result::Result<String, String>,
    ) -> Result<MessageRecord> {
        let tx = record.transaction_id.clone();
        let now = Utc::now();

        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            if attempt > 1 {
                record = self
                    .store
                    .get_by_transaction_id(&tx)
                    .await?
                    .ok_or_else(|| SyncError::Correlation(format!("record vanished during send: {}", tx)))?;
            }
            if !merge_send_outcome(&mut record, outcome, now)? {
                return Ok(record);
            }

            match self.store.compare_and_swap(std::slice::from_ref(&record)).await? {
                CasOutcome::Applied => {
                    record.version += 1;
                    return Ok(record);
                }
                CasOutcome::Conflict(_) => {
                    debug!(tx = %tx, attempt, "Record moved during send, merging");
                }
                CasOutcome::NotFound(_) => {
                    return Err(SyncError::Correlation(format!(
                        "record vanished during send: {}",
                        tx
                    )))
                }
            }
        }

        Err(SyncError::VersionConflict { transaction_id: tx })
    }

    /// Send a single uncorrelated message and track it as GENERAL
    #[instrument(skip(self, body))]
    pub async fn send_message(&self, queue_name: &str, body: &str) -> Result<MessageRecord> {
        validate_queue_name(queue_name)?;

        let transaction_id = ids::generate_base(Utc::now().date_naive());
        let record = MessageRecord::new(
            transaction_id,
            MovementType::General,
            self.environment,
            queue_name,
            body,
        );
        self.store.insert(&record).await?;
        self.send_record(record).await
    }

    // ==================== Status updates ====================

    /// Advance one record. Unknown ids yield `UpdateOutcome::NotFound`.
    #[instrument(skip(self, error_message))]
    pub async fn update_status(
        &self,
        transaction_id: &str,
        status: MessageStatus,
        error_message: Option<&str>,
    ) -> Result<UpdateOutcome> {
        let Some(record) = self.store.get_by_transaction_id(transaction_id).await? else {
            return Ok(UpdateOutcome::NotFound);
        };

        match record.common_reference_id.clone() {
            Some(correlation) => {
                let lock = self.lock_for(&correlation);
                let outcome = {
                    let _guard = lock.lock().await;
                    self.update_single(transaction_id, status, error_message).await
                };
                self.release_lock(&correlation, lock);
                outcome
            }
            None => self.update_single(transaction_id, status, error_message).await,
        }
    }

    async fn update_single(
        &self,
        transaction_id: &str,
        status: MessageStatus,
        error_message: Option<&str>,
    ) -> Result<UpdateOutcome> {
        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let Some(mut record) = self.store.get_by_transaction_id(transaction_id).await? else {
                return Ok(UpdateOutcome::NotFound);
            };
            if let Some(outcome) = check_transition(&record, status) {
                return Ok(outcome);
            }

            record.apply_status(status, error_message, Utc::now())?;
            match self.store.compare_and_swap(std::slice::from_ref(&record)).await? {
                CasOutcome::Applied => {
                    record.version += 1;
                    info!(tx = %transaction_id, status = %status, "Message status updated");
                    return Ok(UpdateOutcome::Updated(record));
                }
                CasOutcome::NotFound(_) => return Ok(UpdateOutcome::NotFound),
                CasOutcome::Conflict(_) => {
                    debug!(tx = %transaction_id, attempt, "Version conflict, retrying");
                }
            }
        }

        Err(SyncError::VersionConflict {
            transaction_id: transaction_id.to_string(),
        })
    }

    /// Advance every leg sharing a correlation id, all or nothing
    #[instrument(skip(self, error_message))]
    pub async fn update_paired_status(
        &self,
        correlation_id: &str,
        status: MessageStatus,
        error_message: Option<&str>,
    ) -> Result<PairedUpdate> {
        let lock = self.lock_for(correlation_id);
        let outcome = {
            let _guard = lock.lock().await;
            self.update_paired_locked(correlation_id, status, error_message)
                .await
        };
        self.release_lock(correlation_id, lock);
        outcome
    }

    async fn update_paired_locked(
        &self,
        correlation_id: &str,
        status: MessageStatus,
        error_message: Option<&str>,
    ) -> Result<PairedUpdate> {
        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let legs = self.store.find_by_common_reference_id(correlation_id).await?;
            let mut outcomes = BTreeMap::new();
            let mut pending = Vec::new();

            for mut leg in legs {
                match check_transition(&leg, status) {
                    Some(outcome) => {
                        outcomes.insert(leg.transaction_id.clone(), outcome);
                    }
                    None => {
                        leg.apply_status(status, error_message, Utc::now())?;
                        pending.push(leg);
                    }
                }
            }

            let blocked = outcomes.values().any(|o| !o.is_applied());
            if outcomes.is_empty() && pending.is_empty() {
                return Ok(PairedUpdate {
                    correlation_id: correlation_id.to_string(),
                    applied: false,
                    legs: outcomes,
                });
            }
            if blocked || pending.is_empty() {
                for leg in pending {
                    outcomes.insert(
                        leg.transaction_id.clone(),
                        UpdateOutcome::Unchanged(leg),
                    );
                }
                if blocked {
                    warn!(correlation = %correlation_id, status = %status, "Paired update rejected");
                }
                return Ok(PairedUpdate {
                    correlation_id: correlation_id.to_string(),
                    applied: !blocked,
                    legs: outcomes,
                });
            }

            match self.store.compare_and_swap(&pending).await? {
                CasOutcome::Applied => {
                    for mut leg in pending {
                        leg.version += 1;
                        outcomes.insert(leg.transaction_id.clone(), UpdateOutcome::Updated(leg));
                    }
                    info!(correlation = %correlation_id, status = %status, "Paired status updated");
                    return Ok(PairedUpdate {
                        correlation_id: correlation_id.to_string(),
                        applied: true,
                        legs: outcomes,
                    });
                }
                CasOutcome::Conflict(tx) | CasOutcome::NotFound(tx) => {
                    debug!(correlation = %correlation_id, tx = %tx, attempt, "Paired update raced, retrying");
                }
            }
        }

        Err(SyncError::VersionConflict {
            transaction_id: correlation_id.to_string(),
        })
    }

    // ==================== Inbound ====================

    /// Record a message pulled off a queue by a listener.
    ///
    /// Known messages (matched by broker message id, then by label as
    /// transaction id) advance to RECEIVED or PEEKED. Anything else is kept
    /// as a new GENERAL record so no inbound traffic goes unrecorded.
    pub async fn record_inbound(
        &self,
        queue: &str,
        message: &BrokerMessage,
        peeked: bool,
    ) -> Result<MessageRecord> {
        let target = if peeked {
            MessageStatus::Peeked
        } else {
            MessageStatus::Received
        };

        let known = match self.store.get_by_message_id(&message.id).await? {
            Some(record) => Some(record),
            None => match message.label.as_deref() {
                Some(label) if !label.is_empty() => {
                    self.store.get_by_transaction_id(label).await?
                }
                _ => None,
            },
        };

        if let Some(record) = known {
            return self.advance_inbound(record, target).await;
        }

        let now = Utc::now();
        let mut record = MessageRecord::new(
            format!("{}{}", INBOUND_PREFIX, ids::generate_base(now.date_naive())),
            MovementType::General,
            self.environment,
            queue,
            message.body.clone(),
        );
        // a correlation id on an unmatched message names someone else's
        // pair; attaching it would make this record a third leg
        record.message_id = Some(message.id.clone());
        record.status = target;
        record.received_at = Some(message.arrived_at.unwrap_or(now));
        self.store.insert(&record).await?;

        info!(
            queue,
            tx = %record.transaction_id,
            message_id = %message.id,
            correlation = message.correlation_id.as_deref().unwrap_or_default(),
            "Unmatched inbound message recorded"
        );
        Ok(record)
    }

    async fn advance_inbound(
        &self,
        record: MessageRecord,
        target: MessageStatus,
    ) -> Result<MessageRecord> {
        let tx = record.transaction_id.clone();

        // our own send may not have been recorded as SENT yet
        if record.status == MessageStatus::Created {
            self.update_status(&tx, MessageStatus::Sent, None).await?;
        }

        match self.update_status(&tx, target, None).await? {
            UpdateOutcome::Updated(r) | UpdateOutcome::Unchanged(r) => Ok(r),
            UpdateOutcome::Rejected { current, .. } => {
                debug!(tx = %tx, current = %current, requested = %target, "Inbound status not applicable");
                self.store
                    .get_by_transaction_id(&tx)
                    .await?
                    .ok_or_else(|| SyncError::Correlation(format!("unknown transaction id: {}", tx)))
            }
            UpdateOutcome::NotFound => Err(SyncError::Correlation(format!(
                "unknown transaction id: {}",
                tx
            ))),
        }
    }

    // ==================== Lookups ====================

    pub async fn find_by_transaction_id(&self, transaction_id: &str) -> Result<Option<MessageRecord>> {
        self.store.get_by_transaction_id(transaction_id).await
    }

    pub async fn find_by_common_reference_id(&self, correlation_id: &str) -> Result<Vec<MessageRecord>> {
        self.store.find_by_common_reference_id(correlation_id).await
    }

    /// The other leg of a settlement pair
    pub async fn find_paired(&self, transaction_id: &str) -> Result<Option<MessageRecord>> {
        let Some(record) = self.store.get_by_transaction_id(transaction_id).await? else {
            return Ok(None);
        };
        match record.linked_transaction_id {
            Some(linked) => self.store.get_by_transaction_id(&linked).await,
            None => Ok(None),
        }
    }

    pub async fn list_by_status(&self, status: MessageStatus, limit: i64) -> Result<Vec<MessageRecord>> {
        self.store.list_by_status(status, limit).await
    }

    pub async fn status_counts(&self) -> Result<HashMap<MessageStatus, i64>> {
        self.store.count_by_status().await
    }
}

/// Fold a send outcome into `record`; false when nothing changed
fn merge_send_outcome(
    record: &mut MessageRecord,
    outcome: &std::result::Result<String, String>,
    at: chrono::DateTime<Utc>,
) -> Result<bool> {
    match outcome {
        Ok(message_id) => {
            let mut changed = false;
            if record.message_id.is_none() {
                record.message_id = Some(message_id.clone());
                changed = true;
            }
            if record.status == MessageStatus::Created {
                record.apply_status(MessageStatus::Sent, None, at)?;
                changed = true;
            } else if record.sent_at.is_none() {
                record.sent_at = Some(at);
                changed = true;
            }
            Ok(changed)
        }
        Err(error) if record.status == MessageStatus::Created => {
            record.apply_status(MessageStatus::Failed, Some(error), at)?;
            Ok(true)
        }
        Err(_) => Ok(false),
    }
}

/// `Some` when no write is needed or allowed
fn check_transition(record: &MessageRecord, status: MessageStatus) -> Option<UpdateOutcome> {
    if record.status == status {
        return Some(UpdateOutcome::Unchanged(record.clone()));
    }
    if !record.status.can_transition_to(status) {
        return Some(UpdateOutcome::Rejected {
            current: record.status,
            requested: status,
        });
    }
    None
}

#[async_trait]
impl InboundSink for CorrelationTracker {
    async fn on_message(&self, queue: &str, message: &BrokerMessage, peeked: bool) -> Result<()> {
        self.record_inbound(queue, message, peeked).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::persistence::InMemoryMessageStore;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// In-memory store that yields inside lookups and can fail CAS writes
    #[derive(Default)]
    struct FlakyStore {
        inner: InMemoryMessageStore,
        failing_swaps: AtomicU32,
    }

    #[async_trait]
    impl MessageStore for FlakyStore {
        async fn insert(&self, record: &MessageRecord) -> Result<()> {
            self.inner.insert(record).await
        }

        async fn insert_pair(&self, first: &MessageRecord, second: &MessageRecord) -> Result<()> {
            self.inner.insert_pair(first, second).await
        }

        async fn get_by_transaction_id(&self, transaction_id: &str) -> Result<Option<MessageRecord>> {
            self.inner.get_by_transaction_id(transaction_id).await
        }

        async fn get_by_message_id(&self, message_id: &str) -> Result<Option<MessageRecord>> {
            self.inner.get_by_message_id(message_id).await
        }

        async fn find_by_common_reference_id(&self, reference_id: &str) -> Result<Vec<MessageRecord>> {
            let found = self.inner.find_by_common_reference_id(reference_id).await;
            tokio::task::yield_now().await;
            found
        }

        async fn compare_and_swap(&self, records: &[MessageRecord]) -> Result<CasOutcome> {
            let remaining = self.failing_swaps.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failing_swaps.store(remaining - 1, Ordering::SeqCst);
                return Err(SyncError::Internal("store unavailable".into()));
            }
            self.inner.compare_and_swap(records).await
        }

        async fn list_by_status(&self, status: MessageStatus, limit: i64) -> Result<Vec<MessageRecord>> {
            self.inner.list_by_status(status, limit).await
        }

        async fn count_by_status(&self) -> Result<HashMap<MessageStatus, i64>> {
            self.inner.count_by_status().await
        }
    }

    async fn flaky_setup() -> (Arc<InMemoryBroker>, Arc<FlakyStore>, CorrelationTracker) {
        let broker = Arc::new(InMemoryBroker::with_queues(["settle_out"]));
        broker.connect().await.unwrap();
        let store = Arc::new(FlakyStore::default());
        let tracker = CorrelationTracker::new(store.clone(), broker.clone(), BrokerEnvironment::Local);
        (broker, store, tracker)
    }

    async fn setup() -> (Arc<InMemoryBroker>, Arc<InMemoryMessageStore>, CorrelationTracker) {
        let broker = Arc::new(InMemoryBroker::with_queues(["settle_out", "notify"]));
        broker.connect().await.unwrap();
        let store = Arc::new(InMemoryMessageStore::new());
        let tracker = CorrelationTracker::new(store.clone(), broker.clone(), BrokerEnvironment::Local);
        (broker, store, tracker)
    }

    fn request() -> SettlementRequest {
        SettlementRequest::new(
            "HK0000069689",
            dec!(10),
            "588990",
            "593129",
            "settle_out",
            NaiveDate::from_ymd_opt(2024, 5, 2).unwrap(),
        )
    }

    #[tokio::test]
    async fn paired_legs_are_cross_linked() {
        let (broker, _, tracker) = setup().await;
        let result = tracker.create_paired(&request()).await.unwrap();

        assert!(result.is_complete());
        assert_ne!(result.rece.transaction_id, result.deli.transaction_id);

        let rece = tracker
            .find_by_transaction_id(&result.rece.transaction_id)
            .await
            .unwrap()
            .unwrap();
        let deli = tracker
            .find_paired(&rece.transaction_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rece.linked_transaction_id.as_deref(), Some(deli.transaction_id.as_str()));
        assert_eq!(deli.linked_transaction_id.as_deref(), Some(rece.transaction_id.as_str()));
        assert_eq!(rece.common_reference_id, deli.common_reference_id);
        assert_eq!(rece.movement_type, MovementType::Rece);
        assert_eq!(deli.movement_type, MovementType::Deli);
        assert_eq!(broker.message_count("settle_out"), 2);
    }

    #[tokio::test]
    async fn invalid_request_never_reaches_broker() {
        let (broker, store, tracker) = setup().await;
        let mut req = request();
        req.quantity = dec!(-1);

        assert!(matches!(
            tracker.create_paired(&req).await,
            Err(SyncError::Validation(_))
        ));
        assert_eq!(store.len().await, 0);
        assert_eq!(broker.message_count("settle_out"), 0);
    }

    #[tokio::test]
    async fn failed_send_is_reported_per_leg() {
        let (broker, _, tracker) = setup().await;
        broker.set_send_failure("settle_out", true);

        let result = tracker.create_paired(&request()).await.unwrap();
        assert!(!result.is_complete());
        assert_eq!(result.failed_legs().len(), 2);
        assert!(result.rece.error.is_some());
    }

    #[tokio::test]
    async fn duplicate_correlation_id_is_rejected() {
        let (_, _, tracker) = setup().await;
        let req = request().with_correlation_id("TRADE-1");
        tracker.create_paired(&req).await.unwrap();
        assert!(matches!(
            tracker.create_paired(&req).await,
            Err(SyncError::Correlation(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_pairs_cannot_share_a_correlation_id() {
        let (_, store, tracker) = flaky_setup().await;
        let req = request().with_correlation_id("TRADE-1");

        let (a, b) = tokio::join!(tracker.create_paired(&req), tracker.create_paired(&req));
        let rejected = [&a, &b]
            .iter()
            .filter(|r| matches!(r, Err(SyncError::Correlation(_))))
            .count();
        assert_eq!(rejected, 1);
        assert!(a.is_ok() || b.is_ok());
        assert_eq!(
            store.find_by_common_reference_id("TRADE-1").await.unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn store_failure_on_one_leg_still_sends_the_other() {
        let (broker, store, tracker) = flaky_setup().await;
        store.failing_swaps.store(1, Ordering::SeqCst);

        let result = tracker.create_paired(&request()).await.unwrap();
        assert!(!result.is_complete());
        assert_eq!(result.rece.status, MessageStatus::Failed);
        assert!(result.rece.error.as_deref().unwrap().contains("store unavailable"));
        assert_eq!(result.deli.status, MessageStatus::Sent);
        assert!(result.deli.message_id.is_some());
        assert_eq!(broker.message_count("settle_out"), 2);

        let rece = store
            .get_by_transaction_id(&result.rece.transaction_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rece.status, MessageStatus::Failed);
    }

    #[tokio::test]
    async fn unknown_transaction_is_not_an_error() {
        let (_, _, tracker) = setup().await;
        let outcome = tracker
            .update_status("nope", MessageStatus::Processed, None)
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::NotFound);

        let paired = tracker
            .update_paired_status("CR-nope", MessageStatus::Processed, None)
            .await
            .unwrap();
        assert!(!paired.applied);
        assert!(paired.legs.is_empty());
    }

    #[tokio::test]
    async fn terminal_status_is_final() {
        let (_, _, tracker) = setup().await;
        let record = tracker.send_message("notify", "{}").await.unwrap();
        let tx = record.transaction_id;

        tracker.update_status(&tx, MessageStatus::Failed, Some("bounced")).await.unwrap();
        let outcome = tracker
            .update_status(&tx, MessageStatus::Processed, None)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            UpdateOutcome::Rejected {
                current: MessageStatus::Failed,
                requested: MessageStatus::Processed
            }
        );
    }

    #[tokio::test]
    async fn paired_update_is_all_or_nothing() {
        let (_, _, tracker) = setup().await;
        let result = tracker.create_paired(&request()).await.unwrap();

        tracker
            .update_status(&result.rece.transaction_id, MessageStatus::Failed, Some("rejected"))
            .await
            .unwrap();

        let update = tracker
            .update_paired_status(&result.correlation_id, MessageStatus::Received, None)
            .await
            .unwrap();
        assert!(!update.applied);
        assert_eq!(update.failed_legs(), vec![result.rece.transaction_id.as_str()]);

        let deli = tracker
            .find_by_transaction_id(&result.deli.transaction_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(deli.status, MessageStatus::Sent);
    }

    #[tokio::test]
    async fn paired_update_advances_both_legs() {
        let (_, _, tracker) = setup().await;
        let result = tracker.create_paired(&request()).await.unwrap();

        let update = tracker
            .update_paired_status(&result.correlation_id, MessageStatus::Received, None)
            .await
            .unwrap();
        assert!(update.applied);
        for leg in tracker
            .find_by_common_reference_id(&result.correlation_id)
            .await
            .unwrap()
        {
            assert_eq!(leg.status, MessageStatus::Received);
            assert!(leg.received_at.is_some());
        }
    }

    #[tokio::test]
    async fn inbound_known_message_advances() {
        let (broker, _, tracker) = setup().await;
        let sent = tracker.send_message("notify", "ping").await.unwrap();

        let message = broker
            .receive("notify", std::time::Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        let record = tracker.record_inbound("notify", &message, false).await.unwrap();
        assert_eq!(record.transaction_id, sent.transaction_id);
        assert_eq!(record.status, MessageStatus::Received);
    }

    #[tokio::test]
    async fn inbound_unknown_message_is_kept() {
        let (_, store, tracker) = setup().await;
        let message = BrokerMessage {
            id: "ext-1".into(),
            label: None,
            body: "<xml/>".into(),
            correlation_id: None,
            priority: 3,
            arrived_at: None,
        };

        let record = tracker.record_inbound("notify", &message, true).await.unwrap();
        assert!(record.transaction_id.starts_with(INBOUND_PREFIX));
        assert_eq!(record.status, MessageStatus::Peeked);
        assert_eq!(record.movement_type, MovementType::General);
        assert_eq!(store.len().await, 1);

        // a later receive of the same message advances it
        let again = tracker.record_inbound("notify", &message, false).await.unwrap();
        assert_eq!(again.transaction_id, record.transaction_id);
        assert_eq!(again.status, MessageStatus::Received);
    }

    #[tokio::test]
    async fn unmatched_reply_does_not_join_the_pair() {
        let (_, _, tracker) = setup().await;
        let result = tracker.create_paired(&request()).await.unwrap();

        let reply = BrokerMessage {
            id: "ack-1".into(),
            label: None,
            body: "<ack/>".into(),
            correlation_id: Some(result.correlation_id.clone()),
            priority: 3,
            arrived_at: None,
        };
        let record = tracker.record_inbound("notify", &reply, false).await.unwrap();
        assert!(record.transaction_id.starts_with(INBOUND_PREFIX));
        assert!(record.common_reference_id.is_none());

        let legs = tracker
            .find_by_common_reference_id(&result.correlation_id)
            .await
            .unwrap();
        assert_eq!(legs.len(), 2);
        assert!(legs.iter().all(|l| l.movement_type != MovementType::General));

        let update = tracker
            .update_paired_status(&result.correlation_id, MessageStatus::Received, None)
            .await
            .unwrap();
        assert!(update.applied);
        assert_eq!(update.legs.len(), 2);
    }
}
