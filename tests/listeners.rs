use brokersync::broker::{BrokerMessage, InMemoryBroker};
use brokersync::config::ListenerConfig;
use brokersync::supervisor::ListenerEvent;
use brokersync::{BrokerAdapter, ListenerSupervisor};
use std::sync::Arc;
use std::time::Duration;

fn config() -> ListenerConfig {
    ListenerConfig {
        poll_timeout_ms: 20,
        failure_backoff_ms: 10,
        max_consecutive_failures: 3,
        ..ListenerConfig::default()
    }
}

async fn connected(queues: &[&str]) -> Arc<InMemoryBroker> {
    let broker = Arc::new(InMemoryBroker::with_queues(queues.iter().copied()));
    broker.connect().await.unwrap();
    broker
}

fn message(id: &str) -> BrokerMessage {
    BrokerMessage {
        id: id.to_string(),
        label: None,
        body: "payload".to_string(),
        correlation_id: None,
        priority: 3,
        arrived_at: None,
    }
}

#[tokio::test]
async fn starting_twice_yields_one_handle() {
    let broker = connected(&["q"]).await;
    let supervisor = ListenerSupervisor::new(broker, config());

    let first = supervisor.start_listener("q").await.unwrap();
    let second = supervisor.start_listener("q").await.unwrap();

    assert_eq!(first, second);
    assert_eq!(supervisor.running_count(), 1);
    assert_eq!(supervisor.get_retry_counters()["q"], 0);
    supervisor.stop_all_listeners().await;
}

#[tokio::test]
async fn one_failing_queue_does_not_affect_the_others() {
    let broker = connected(&["good", "bad"]).await;
    broker.fail_reads("bad", u32::MAX);
    let supervisor = ListenerSupervisor::new(broker.clone(), config());
    let mut events = supervisor.subscribe();

    supervisor.start_listener("good").await.unwrap();
    supervisor.start_listener("bad").await.unwrap();

    let stopped = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(ListenerEvent::SelfStopped { queue, .. }) = events.recv().await {
                break queue;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(stopped, "bad");

    let status = supervisor.get_listener_status();
    assert!(status["good"]);
    assert!(!status["bad"]);
    assert_eq!(supervisor.get_retry_counters()["bad"], 3);
    assert!(supervisor.listener_details("bad").unwrap().last_error.is_some());

    // a fresh start begins with a clean counter
    broker.fail_reads("bad", 0);
    supervisor.start_listener("bad").await.unwrap();
    assert_eq!(supervisor.get_retry_counters()["bad"], 0);
    assert!(supervisor.is_listener_running("bad"));

    let stopped = supervisor.stop_all_listeners().await;
    assert_eq!(stopped.len(), 2);
    assert!(stopped.values().all(|r| matches!(r, Ok(true))));
}

#[tokio::test]
async fn received_messages_are_counted() {
    let broker = connected(&["inbox"]).await;
    let supervisor = ListenerSupervisor::new(broker.clone(), config());
    supervisor.start_listener("inbox").await.unwrap();

    broker.push_message("inbox", message("m-1"));
    broker.push_message("inbox", message("m-2"));

    tokio::time::timeout(Duration::from_secs(5), async {
        while broker.message_count("inbox") > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    // the count is bumped before the message leaves the poll loop
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(supervisor.listener_details("inbox").unwrap().messages_received, 2);
    assert!(supervisor.stop_listener("inbox").await.unwrap());
    assert!(!supervisor.stop_listener("inbox").await.unwrap());
}

#[tokio::test]
async fn restart_replaces_the_handle() {
    let broker = connected(&["q"]).await;
    let supervisor = ListenerSupervisor::new(broker, config());

    let first = supervisor.start_listener("q").await.unwrap();
    let second = supervisor.restart_listener("q").await.unwrap();

    assert_ne!(first.id, second.id);
    assert_eq!(supervisor.running_count(), 1);
    supervisor.stop_all_listeners().await;
    assert_eq!(supervisor.running_count(), 0);
}

#[tokio::test]
async fn interleaved_start_stop_leaves_a_consistent_state() {
    let broker = connected(&["q"]).await;
    let supervisor = Arc::new(ListenerSupervisor::new(broker, config()));

    let mut tasks = Vec::new();
    for i in 0..20 {
        let supervisor = supervisor.clone();
        tasks.push(tokio::spawn(async move {
            if i % 2 == 0 {
                supervisor.start_listener("q").await.map(|_| ())
            } else {
                supervisor.stop_listener("q").await.map(|_| ())
            }
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    supervisor.start_listener("q").await.unwrap();
    assert_eq!(supervisor.running_count(), 1);
    supervisor.stop_all_listeners().await;
}
