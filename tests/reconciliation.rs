use brokersync::broker::InMemoryBroker;
use brokersync::config::BrokerConfig;
use brokersync::domain::{QueueRegistryEntry, SyncStatus};
use brokersync::persistence::{InMemoryQueueRegistry, QueueRegistryStore};
use brokersync::{BrokerAdapter, ConnectionSupervisor, ReconciliationEngine};
use std::sync::Arc;

struct Fixture {
    broker: Arc<InMemoryBroker>,
    registry: Arc<InMemoryQueueRegistry>,
    engine: ReconciliationEngine,
}

async fn fixture(live: &[&str]) -> Fixture {
    let broker = Arc::new(InMemoryBroker::with_queues(live.iter().copied()));
    let registry = Arc::new(InMemoryQueueRegistry::new());
    let connection = Arc::new(ConnectionSupervisor::new(
        broker.clone(),
        BrokerConfig::default(),
    ));
    connection.connect().await.unwrap();
    let engine = ReconciliationEngine::new(connection, registry.clone());
    Fixture {
        broker,
        registry,
        engine,
    }
}

#[tokio::test]
async fn second_run_without_changes_creates_and_deletes_nothing() {
    let f = fixture(&["orders_in", "orders_out", "audit"]).await;

    let first = f.engine.sync_all().await.unwrap();
    assert_eq!(first.status, SyncStatus::Success);
    assert_eq!(first.created_queues, 3);

    let second = f.engine.sync_all().await.unwrap();
    assert_eq!(second.status, SyncStatus::Success);
    assert_eq!(second.created_queues, 0);
    assert_eq!(second.deleted_queues, 0);
    assert_eq!(f.registry.len().await, 3);
}

#[tokio::test]
async fn new_live_queue_is_created_existing_are_updated() {
    let f = fixture(&["A", "B"]).await;
    f.engine.sync_all().await.unwrap();

    f.broker.add_queue("C");
    let result = f.engine.sync_all().await.unwrap();

    assert_eq!(result.created_queues, 1);
    assert_eq!(result.updated_queues, 2);
    assert_eq!(result.deleted_queues, 0);
    assert_eq!(result.total_queues, 3);
    assert!(f.registry.get("C").await.unwrap().is_some());
}

#[tokio::test]
async fn vanished_queue_is_deactivated_not_deleted() {
    let f = fixture(&["A", "B"]).await;
    f.engine.sync_all().await.unwrap();

    f.broker.remove_queue("B");
    let result = f.engine.sync_all().await.unwrap();

    assert_eq!(result.deleted_queues, 1);
    let b = f.registry.get("B").await.unwrap().unwrap();
    assert!(!b.active);

    // reappearing reactivates the same row
    f.broker.add_queue("B");
    f.engine.sync_all().await.unwrap();
    assert!(f.registry.get("B").await.unwrap().unwrap().active);
}

#[tokio::test]
async fn unknown_queue_is_reported_without_a_row() {
    let f = fixture(&["A"]).await;

    assert!(!f.engine.sync_one("does-not-exist").await.unwrap());
    assert!(f.registry.get("does-not-exist").await.unwrap().is_none());
    assert!(f.engine.sync_one("A").await.unwrap());
}

#[tokio::test]
async fn unreadable_queue_gives_partial_success_and_keeps_its_row() {
    let f = fixture(&["A", "B"]).await;
    f.engine.sync_all().await.unwrap();

    f.broker.set_unreadable("B", Some("access denied"));
    let result = f.engine.sync_all().await.unwrap();

    assert_eq!(result.status, SyncStatus::PartialSuccess);
    assert!(result.error_message.unwrap().contains("access denied"));
    assert_eq!(result.deleted_queues, 0);
    assert!(f.registry.get("B").await.unwrap().unwrap().active);
}

#[tokio::test]
async fn lost_broker_fails_the_run_without_touching_the_registry() {
    let f = fixture(&["A", "B"]).await;
    f.engine.sync_all().await.unwrap();
    let before: Vec<QueueRegistryEntry> = f.registry.list_all().await.unwrap();

    f.broker.set_listing_failure(Some("RPC server unavailable"));
    let result = f.engine.sync_all().await.unwrap();

    assert_eq!(result.status, SyncStatus::Failed);
    assert!(result.error_message.is_some());
    assert_eq!(f.registry.list_all().await.unwrap(), before);

    let stats = f.engine.statistics().await.unwrap();
    assert_eq!(stats.total_runs, 2);
    assert_eq!(stats.failed_runs, 1);
}

#[tokio::test]
async fn broker_listing_matches_registry_after_sync() {
    let f = fixture(&["x1", "x2"]).await;
    f.engine.sync_all().await.unwrap();

    let live = f.broker.list_queues(".").await.unwrap();
    for info in &live.queues {
        let entry = f.registry.get(&info.name).await.unwrap().unwrap();
        assert_eq!(entry.path, info.path);
        assert!(entry.active);
    }
}
