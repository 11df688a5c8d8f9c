mod common;

use std::{sync::atomic::Ordering, time::Duration};

use assert_matches::assert_matches;
use futures::StreamExt;
use warren_connection::{
    ConnectionConfig, ConnectionEvent, ConnectionState, Endpoint, EventKind, FieldTable,
    QueueDeclareOptions, RecoveryConfig, ShutdownSource,
};
use warren_primitives::{Method, constants::CONNECTION_FORCED};
use warren_test_utils::{FakeBroker, wait_until};

use crate::common::{collect_events, config, connect, connect_with, count_events};

#[tokio::test]
async fn test_replays_topology_after_transport_drop() {
    let broker = FakeBroker::new();
    let (connection, _) = connect(&broker).await;
    let succeeded = count_events(&connection, EventKind::RecoverySucceeded);
    let renamed = collect_events(&connection, EventKind::QueueNameChanged);

    let channel = connection.create_channel().await.unwrap();
    let second = connection.create_channel().await.unwrap();
    channel
        .exchange_declare("orders", "direct", Default::default(), FieldTable::new())
        .await
        .unwrap();
    channel
        .queue_declare("jobs", Default::default(), FieldTable::new())
        .await
        .unwrap();
    let private = channel
        .queue_declare(
            "",
            QueueDeclareOptions {
                exclusive: true,
                ..Default::default()
            },
            FieldTable::new(),
        )
        .await
        .unwrap();
    channel
        .queue_bind("jobs", "orders", "new", FieldTable::new())
        .await
        .unwrap();
    let open_before = connection.connection().open_channel_count();

    broker.last_session().unwrap().reset();
    wait_until(|| succeeded.load(Ordering::SeqCst) == 1).await;

    assert_eq!(broker.session_count(), 2);
    let replay = broker.last_session().unwrap();
    assert_eq!(replay.count("exchange.declare"), 1);
    assert_eq!(replay.count("queue.declare"), 2);
    assert_eq!(replay.count("queue.bind"), 1);
    assert_eq!(connection.connection().open_channel_count(), open_before);
    assert_eq!(connection.state(), ConnectionState::Open);
    assert_eq!((channel.id(), second.id()), (1, 2));
    assert!(channel.is_open() && second.is_open());

    let renamed = renamed.lock().clone();
    assert_matches!(
        renamed.as_slice(),
        [ConnectionEvent::QueueNameChanged { old, new }] if *old == private.queue && *new != private.queue
    );
    let queues: Vec<_> = connection
        .registry()
        .snapshot()
        .queues
        .into_iter()
        .map(|q| q.name)
        .collect();
    assert!(queues.contains(&"jobs".to_string()));
    assert!(!queues.contains(&private.queue));

    // The handles now drive the replacement channels.
    channel
        .queue_declare("more", Default::default(), FieldTable::new())
        .await
        .unwrap();
    assert_eq!(replay.count("queue.declare"), 3);
}

#[tokio::test]
async fn test_consumers_survive_recovery() {
    let broker = FakeBroker::new();
    let (connection, _) = connect(&broker).await;
    let succeeded = count_events(&connection, EventKind::RecoverySucceeded);
    let retagged = collect_events(&connection, EventKind::ConsumerTagChanged);

    let channel = connection.create_channel().await.unwrap();
    channel.basic_qos(10, false).await.unwrap();
    channel
        .queue_declare("jobs", Default::default(), FieldTable::new())
        .await
        .unwrap();
    let mut consumer = channel
        .basic_consume("jobs", "", Default::default(), FieldTable::new())
        .await
        .unwrap();
    let old_tag = consumer.tag().to_string();

    let first = broker.last_session().unwrap();
    first.deliver(1, &old_tag, 1, "before");
    assert_eq!(consumer.next().await.unwrap().body, "before");

    first.reset();
    wait_until(|| succeeded.load(Ordering::SeqCst) == 1).await;

    let new_tag = match retagged.lock().as_slice() {
        [ConnectionEvent::ConsumerTagChanged { old, new }] => {
            assert_eq!(*old, old_tag);
            new.clone()
        }
        other => panic!("unexpected events: {other:?}"),
    };
    assert_ne!(new_tag, old_tag);

    let replay = broker.last_session().unwrap();
    assert!(replay.methods().iter().any(|(channel, method)| {
        *channel == 1 && matches!(method, Method::BasicQos { prefetch_count: 10, .. })
    }));
    assert_eq!(replay.count("basic.consume"), 1);

    // Deliveries on the replacement consumer arrive on the stream the application holds.
    replay.deliver(1, &new_tag, 1, "after");
    let delivery = consumer.next().await.unwrap();
    assert_eq!(delivery.body, "after");
    assert_eq!(delivery.consumer_tag, new_tag);

    channel.basic_cancel(&new_tag).await.unwrap();
    assert!(connection.registry().snapshot().consumers.is_empty());
}

#[tokio::test]
async fn test_application_close_does_not_recover() {
    let broker = FakeBroker::new();
    let (connection, _) = connect(&broker).await;
    let succeeded = count_events(&connection, EventKind::RecoverySucceeded);
    let failed = count_events(&connection, EventKind::RecoveryFailed);
    let channel = connection.create_channel().await.unwrap();

    connection.close().await.unwrap();
    let reason = connection.closed().await;

    assert!(reason.is_application_initiated());
    assert_eq!(connection.state(), ConnectionState::Closed);
    assert_eq!(connection.close_reason(), Some(reason));
    assert!(!channel.is_open());
    assert_eq!(connection.recorded_channel_count(), 0);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(broker.session_count(), 1);
    assert_eq!(succeeded.load(Ordering::SeqCst), 0);
    assert_eq!(failed.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_closing_the_inner_connection_does_not_recover() {
    let broker = FakeBroker::new();
    let (connection, _) = connect(&broker).await;

    connection.connection().close().await.unwrap();

    assert!(connection.closed().await.is_application_initiated());
    assert_eq!(broker.session_count(), 1);
}

#[tokio::test]
async fn test_peer_close_triggers_recovery() {
    let broker = FakeBroker::new();
    let (connection, _) = connect(&broker).await;
    let succeeded = count_events(&connection, EventKind::RecoverySucceeded);
    let shutdowns = collect_events(&connection, EventKind::Shutdown);

    broker
        .last_session()
        .unwrap()
        .close_connection(CONNECTION_FORCED, "CONNECTION_FORCED - broker restart");
    wait_until(|| succeeded.load(Ordering::SeqCst) == 1).await;

    assert_eq!(broker.session_count(), 2);
    assert!(connection.is_open());
    assert_eq!(connection.close_reason(), None);
    // Shutdown listeners hear about every connection that went down.
    assert_matches!(
        shutdowns.lock().as_slice(),
        [ConnectionEvent::Shutdown(reason)] if reason.reply_code() == CONNECTION_FORCED
    );
}

#[tokio::test(start_paused = true)]
async fn test_retries_with_backoff_until_broker_accepts() {
    let broker = FakeBroker::new();
    let (connection, connector) = connect(&broker).await;
    let recovered = collect_events(&connection, EventKind::RecoverySucceeded);

    connector.refuse_next(2);
    broker.last_session().unwrap().reset();
    wait_until(|| !recovered.lock().is_empty()).await;

    assert_matches!(
        recovered.lock().as_slice(),
        [ConnectionEvent::RecoverySucceeded { attempts: 3, .. }]
    );
    // One initial connect and three recovery attempts.
    assert_eq!(connector.attempts().len(), 4);
    assert!(connection.is_open());
}

#[tokio::test(start_paused = true)]
async fn test_recovery_failure_is_terminal() {
    let broker = FakeBroker::new();
    let (connection, connector) = connect(&broker).await;
    let failures = collect_events(&connection, EventKind::RecoveryFailed);
    let succeeded = count_events(&connection, EventKind::RecoverySucceeded);

    let channel = connection.create_channel().await.unwrap();
    let mut consumer = channel
        .basic_consume("jobs", "", Default::default(), FieldTable::new())
        .await
        .unwrap();

    connector.refuse_all(true);
    broker.last_session().unwrap().reset();
    let reason = connection.closed().await;

    assert_eq!(reason.source(), ShutdownSource::Transport);
    assert_eq!(connection.state(), ConnectionState::Closed);
    assert_eq!(connector.attempts().len(), 4);
    assert_eq!(succeeded.load(Ordering::SeqCst), 0);
    wait_until(|| !failures.lock().is_empty()).await;
    assert_matches!(
        failures.lock().as_slice(),
        [ConnectionEvent::RecoveryFailed { error }] if error.contains("3 attempt")
    );
    // Giving up releases the consumer streams.
    assert!(consumer.next().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_close_cancels_recovery() {
    let broker = FakeBroker::new();
    let (connection, connector) = connect_with(
        &broker,
        config().with_recovery(RecoveryConfig {
            interval: Duration::from_secs(5),
            max_attempts: 10,
            ..RecoveryConfig::default()
        }),
    )
    .await;
    let failed = count_events(&connection, EventKind::RecoveryFailed);

    connector.refuse_all(true);
    broker.last_session().unwrap().reset();
    wait_until(|| connection.is_recovering()).await;
    assert_eq!(connection.state(), ConnectionState::Connecting);
    let shutdowns = count_events(&connection, EventKind::Shutdown);

    connection.close().await.unwrap();
    connection.closed().await;
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    assert!(!connection.is_recovering());
    assert_eq!(connection.state(), ConnectionState::Closed);
    assert_eq!(failed.load(Ordering::SeqCst), 0);
    assert!(connector.attempts().len() <= 2);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_listener_added_during_failed_recovery_fires() {
    let broker = FakeBroker::new();
    let (connection, connector) = connect_with(
        &broker,
        config().with_recovery(RecoveryConfig {
            interval: Duration::from_secs(1),
            max_attempts: 2,
            ..RecoveryConfig::default()
        }),
    )
    .await;
    let failed = count_events(&connection, EventKind::RecoveryFailed);

    connector.refuse_all(true);
    broker.last_session().unwrap().reset();
    wait_until(|| connection.is_recovering()).await;
    let shutdowns = collect_events(&connection, EventKind::Shutdown);

    let reason = connection.closed().await;
    wait_until(|| failed.load(Ordering::SeqCst) == 1).await;

    assert_matches!(
        shutdowns.lock().as_slice(),
        [ConnectionEvent::Shutdown(heard)] if *heard == reason && heard.source() == ShutdownSource::Transport
    );
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_listener_added_during_recovery_waits_for_the_replacement() {
    let broker = FakeBroker::new();
    let (connection, connector) = connect_with(
        &broker,
        config().with_recovery(RecoveryConfig {
            interval: Duration::from_secs(1),
            ..RecoveryConfig::default()
        }),
    )
    .await;
    let succeeded = count_events(&connection, EventKind::RecoverySucceeded);

    connector.refuse_next(1);
    broker.last_session().unwrap().reset();
    wait_until(|| connection.is_recovering()).await;
    let shutdowns = count_events(&connection, EventKind::Shutdown);
    wait_until(|| succeeded.load(Ordering::SeqCst) == 1).await;
    assert_eq!(shutdowns.load(Ordering::SeqCst), 0);

    connection.close().await.unwrap();
    assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_recovery_walks_endpoints() {
    let broker = FakeBroker::new();
    let primary = Endpoint::new("rabbit-1", 5672);
    let secondary = Endpoint::new("rabbit-2", 5672);
    let (connection, connector) = connect_with(
        &broker,
        config().with_endpoints([primary.clone(), secondary.clone()]),
    )
    .await;
    let recovered = collect_events(&connection, EventKind::RecoverySucceeded);
    assert_eq!(connection.connection().endpoint(), &primary);

    connector.refuse_endpoint(primary.clone());
    broker.last_session().unwrap().reset();
    wait_until(|| !recovered.lock().is_empty()).await;

    assert_matches!(
        recovered.lock().as_slice(),
        [ConnectionEvent::RecoverySucceeded { endpoint, attempts: 1 }] if *endpoint == secondary
    );
    assert_eq!(connection.connection().endpoint(), &secondary);
    assert_eq!(connector.attempts(), vec![primary.clone(), primary, secondary]);
}

#[tokio::test]
async fn test_recovery_disabled() {
    let broker = FakeBroker::new();
    let (connection, _) = connect_with(
        &broker,
        ConnectionConfig::default().with_recovery(RecoveryConfig::disabled()),
    )
    .await;

    broker.last_session().unwrap().reset();
    let reason = connection.closed().await;

    assert!(reason.is_transport_failure());
    assert_eq!(connection.state(), ConnectionState::Closed);
    assert_eq!(broker.session_count(), 1);
}

#[tokio::test]
async fn test_deleted_topology_is_not_replayed() {
    let broker = FakeBroker::new();
    let (connection, _) = connect(&broker).await;
    let succeeded = count_events(&connection, EventKind::RecoverySucceeded);

    let channel = connection.create_channel().await.unwrap();
    channel
        .exchange_declare("orders", "topic", Default::default(), FieldTable::new())
        .await
        .unwrap();
    channel
        .queue_declare("jobs", Default::default(), FieldTable::new())
        .await
        .unwrap();
    channel
        .queue_bind("jobs", "orders", "#", FieldTable::new())
        .await
        .unwrap();
    channel.queue_delete("jobs", false, false).await.unwrap();
    channel.exchange_delete("orders", false).await.unwrap();
    assert!(connection.registry().snapshot().is_empty());

    broker.last_session().unwrap().reset();
    wait_until(|| succeeded.load(Ordering::SeqCst) == 1).await;

    let replay = broker.last_session().unwrap();
    assert_eq!(replay.count("exchange.declare"), 0);
    assert_eq!(replay.count("queue.declare"), 0);
    assert_eq!(replay.count("queue.bind"), 0);
    // Only the application's channel is reopened.
    assert_eq!(replay.count("channel.open"), 1);
}

#[tokio::test]
async fn test_channels_closed_before_the_drop_stay_closed() {
    let broker = FakeBroker::new();
    let (connection, _) = connect(&broker).await;
    let succeeded = count_events(&connection, EventKind::RecoverySucceeded);

    let kept = connection.create_channel().await.unwrap();
    let closed_by_app = connection.create_channel().await.unwrap();
    let closed_by_broker = connection.create_channel().await.unwrap();
    closed_by_app.close().await.unwrap();
    let session = broker.last_session().unwrap();
    session.close_channel(closed_by_broker.id(), 406, "PRECONDITION_FAILED - unknown delivery tag");
    wait_until(|| !closed_by_broker.is_open()).await;

    session.reset();
    wait_until(|| succeeded.load(Ordering::SeqCst) == 1).await;

    assert_eq!(connection.recorded_channel_count(), 1);
    assert_eq!(connection.connection().channel_ids(), vec![kept.id()]);
    assert!(kept.is_open());
    assert!(!closed_by_broker.is_open());
}
