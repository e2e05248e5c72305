use brokersync::broker::InMemoryBroker;
use brokersync::config::ListenerConfig;
use brokersync::correlation::UpdateOutcome;
use brokersync::domain::{BrokerEnvironment, MessageStatus, MovementType, SettlementRequest};
use brokersync::persistence::{InMemoryMessageStore, MessageStore};
use brokersync::{BrokerAdapter, CorrelationTracker, ListenerSupervisor, SyncError};
use chrono::NaiveDate;
use rust_decimal_macros::dec;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

async fn setup() -> (Arc<InMemoryBroker>, Arc<InMemoryMessageStore>, Arc<CorrelationTracker>) {
    let broker = Arc::new(InMemoryBroker::with_queues(["settle_out", "settle_in"]));
    broker.connect().await.unwrap();
    let store = Arc::new(InMemoryMessageStore::new());
    let tracker = Arc::new(CorrelationTracker::new(
        store.clone(),
        broker.clone(),
        BrokerEnvironment::Local,
    ));
    (broker, store, tracker)
}

fn settlement() -> SettlementRequest {
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
async fn legs_are_distinct_and_cross_referenced() {
    let (_, store, tracker) = setup().await;
    let result = tracker.create_paired(&settlement()).await.unwrap();

    assert_ne!(result.rece.transaction_id, result.deli.transaction_id);

    let legs = store
        .find_by_common_reference_id(&result.correlation_id)
        .await
        .unwrap();
    assert_eq!(legs.len(), 2);

    let movements: HashSet<MovementType> = legs.iter().map(|l| l.movement_type).collect();
    assert_eq!(movements, HashSet::from([MovementType::Rece, MovementType::Deli]));

    let (a, b) = (&legs[0], &legs[1]);
    assert_eq!(a.linked_transaction_id.as_deref(), Some(b.transaction_id.as_str()));
    assert_eq!(b.linked_transaction_id.as_deref(), Some(a.transaction_id.as_str()));
    assert!(legs
        .iter()
        .all(|l| l.common_reference_id.as_deref() == Some(result.correlation_id.as_str())));
}

#[tokio::test]
async fn leg_bodies_carry_the_instruction() {
    let (broker, _, tracker) = setup().await;
    tracker.create_paired(&settlement()).await.unwrap();

    let sent = broker.messages("settle_out");
    assert_eq!(sent.len(), 2);
    for message in &sent {
        let body: serde_json::Value = serde_json::from_str(&message.body).unwrap();
        assert_eq!(body["security_id"], "HK0000069689");
        assert_eq!(body["quantity"], "10");
        assert_eq!(body["transaction_id"].as_str(), message.label.as_deref());
    }
}

#[tokio::test]
async fn terminal_states_never_change() {
    let (_, _, tracker) = setup().await;
    let result = tracker.create_paired(&settlement()).await.unwrap();
    let rece = &result.rece.transaction_id;
    let deli = &result.deli.transaction_id;

    for status in [MessageStatus::Received, MessageStatus::Processed] {
        tracker.update_status(rece, status, None).await.unwrap();
    }
    tracker
        .update_status(deli, MessageStatus::Failed, Some("counterparty rejected"))
        .await
        .unwrap();

    for target in [
        MessageStatus::Created,
        MessageStatus::Sent,
        MessageStatus::Peeked,
        MessageStatus::Received,
        MessageStatus::Failed,
    ] {
        let outcome = tracker.update_status(rece, target, None).await.unwrap();
        assert!(matches!(outcome, UpdateOutcome::Rejected { current: MessageStatus::Processed, .. }));
    }
    let outcome = tracker
        .update_status(deli, MessageStatus::Processed, None)
        .await
        .unwrap();
    assert!(matches!(outcome, UpdateOutcome::Rejected { current: MessageStatus::Failed, .. }));

    let deli_record = tracker.find_by_transaction_id(deli).await.unwrap().unwrap();
    assert_eq!(deli_record.status, MessageStatus::Failed);
    assert_eq!(deli_record.error_message.as_deref(), Some("counterparty rejected"));
}

#[tokio::test]
async fn validation_runs_before_the_broker_is_touched() {
    let (broker, store, tracker) = setup().await;
    let mut request = settlement();
    request.buyer = request.seller.clone();
    request.security_id = String::new();

    let err = tracker.create_paired(&request).await.unwrap_err();
    match err {
        SyncError::Validation(message) => {
            assert!(message.contains("seller"));
            assert!(message.contains("security"));
        }
        other => panic!("expected validation error, got {other}"),
    }
    assert!(broker.messages("settle_out").is_empty());
    assert_eq!(store.len().await, 0);
}

#[tokio::test]
async fn concurrent_updates_keep_versions_consistent() {
    let (_, _, tracker) = setup().await;
    let result = tracker.create_paired(&settlement()).await.unwrap();
    let tx = result.rece.transaction_id.clone();

    let mut tasks = Vec::new();
    for status in [MessageStatus::Peeked, MessageStatus::Received, MessageStatus::Received] {
        let tracker = tracker.clone();
        let tx = tx.clone();
        tasks.push(tokio::spawn(async move {
            tracker.update_status(&tx, status, None).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let record = tracker.find_by_transaction_id(&tx).await.unwrap().unwrap();
    assert_eq!(record.status, MessageStatus::Received);
    // SENT plus at most PEEKED and RECEIVED
    assert!(record.version >= 2 && record.version <= 3);
}

#[tokio::test]
async fn listener_delivery_advances_sent_legs() {
    let (broker, _, tracker) = setup().await;
    let listeners = ListenerSupervisor::new(
        broker.clone(),
        ListenerConfig {
            poll_timeout_ms: 20,
            ..ListenerConfig::default()
        },
    )
    .with_sink(tracker.clone());

    let result = tracker.create_paired(&settlement()).await.unwrap();
    listeners.start_listener("settle_out").await.unwrap();

    let legs = [result.rece.transaction_id.clone(), result.deli.transaction_id.clone()];
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let mut received = 0;
            for tx in &legs {
                let record = tracker.find_by_transaction_id(tx).await.unwrap().unwrap();
                if record.status == MessageStatus::Received {
                    received += 1;
                }
            }
            if received == legs.len() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let paired = tracker
        .update_paired_status(&result.correlation_id, MessageStatus::Processed, None)
        .await
        .unwrap();
    assert!(paired.applied);
    listeners.stop_all_listeners().await;

    let counts = tracker.status_counts().await.unwrap();
    assert_eq!(counts.get(&MessageStatus::Processed), Some(&2));
}

#[tokio::test]
async fn slow_send_acknowledgement_keeps_the_delivered_state() {
    let (broker, _, tracker) = setup().await;
    broker.set_send_latency(Some(Duration::from_millis(200)));
    let listeners = ListenerSupervisor::new(
        broker.clone(),
        ListenerConfig {
            poll_timeout_ms: 20,
            ..ListenerConfig::default()
        },
    )
    .with_sink(tracker.clone());
    listeners.start_listener("settle_in").await.unwrap();

    // the listener consumes the message before the send call returns
    let sent = tracker.send_message("settle_in", "ping").await.unwrap();
    let message_id = sent.message_id.clone().expect("message id recorded");

    let stored = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let record = tracker
                .find_by_transaction_id(&sent.transaction_id)
                .await
                .unwrap()
                .unwrap();
            if record.status == MessageStatus::Received {
                break record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    listeners.stop_all_listeners().await;

    assert_eq!(stored.message_id.as_deref(), Some(message_id.as_str()));
    assert!(stored.sent_at.is_some());
    assert_eq!(broker.message_count("settle_in"), 0);
}
