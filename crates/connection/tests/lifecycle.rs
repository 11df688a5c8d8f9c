mod common;

use std::{sync::Arc, time::Duration};

use assert_matches::assert_matches;
use warren_connection::{
    Connection, ConnectionError, ConnectionState, Credentials, Endpoint, SaslNegotiator,
    ShutdownInitiator, ShutdownSource,
};
use warren_primitives::{
    HandshakeError, Method, Tuning,
    constants::{CHANNEL_ERROR, CONNECTION_FORCED},
};
use warren_test_utils::{FakeBroker, FakeConnector, init_tracing, wait_until};

use crate::common::{config, connect, connect_with, session};

#[tokio::test]
async fn test_open_negotiates_tuning() {
    let broker = FakeBroker::new().with_tuning(Tuning {
        channel_max: 64,
        frame_max: 65536,
        heartbeat: 0,
    });
    let connection = connect(&broker).await;

    assert_eq!(connection.state(), ConnectionState::Open);
    assert_eq!(connection.channel_max(), 64);
    assert_eq!(connection.frame_max(), 65536);
    // The client asked for 60s and the broker has no preference.
    assert_eq!(connection.heartbeat(), Duration::from_secs(60));
    assert_eq!(connection.mechanism(), "PLAIN");
    assert_eq!(
        connection.server_properties().get_str("product"),
        Some("fake-broker")
    );

    let methods = session(&broker).methods();
    assert_matches!(
        &methods[..],
        [
            (0, Method::ConnectionStartOk { mechanism, .. }),
            (0, Method::ConnectionTuneOk { channel_max: 64, frame_max: 65536, heartbeat: 60 }),
            (0, Method::ConnectionOpen { virtual_host }),
        ] if mechanism == "PLAIN" && virtual_host == "/"
    );
}

#[tokio::test]
async fn test_open_tries_endpoints_in_order() {
    init_tracing();
    let broker = FakeBroker::new();
    let connector = Arc::new(FakeConnector::new(broker.clone()));
    let primary = Endpoint::new("rabbit-1", 5672);
    let secondary = Endpoint::new("rabbit-2", 5672);
    connector.refuse_endpoint(primary.clone());

    let connection = Connection::open(
        config().with_endpoints([primary.clone(), secondary.clone()]),
        connector.clone(),
        Arc::new(SaslNegotiator::default()),
    )
    .await
    .unwrap();

    assert_eq!(connection.endpoint(), &secondary);
    assert_eq!(connector.attempts(), vec![primary, secondary]);
}

#[tokio::test]
async fn test_open_fails_when_mechanism_not_offered() {
    init_tracing();
    let broker = FakeBroker::new().with_mechanisms("AMQPLAIN");
    let result = Connection::open(
        config(),
        Arc::new(FakeConnector::new(broker)),
        Arc::new(SaslNegotiator::default()),
    )
    .await;

    assert_matches!(
        result,
        Err(ConnectionError::ConnectFailed { attempts: 1, last })
            if matches!(*last, ConnectionError::Handshake(HandshakeError::MechanismNotOffered { .. }))
    );
}

#[tokio::test]
async fn test_channel_numbers_reused_lowest_first() {
    let broker = FakeBroker::new();
    let connection = connect(&broker).await;

    let first = connection.create_channel().await.unwrap();
    let second = connection.create_channel().await.unwrap();
    let third = connection.create_channel().await.unwrap();
    assert_eq!((first.id(), second.id(), third.id()), (1, 2, 3));

    second.close().await.unwrap();
    assert!(second.close_reason().unwrap().is_application_initiated());
    assert_eq!(connection.channel_ids(), vec![1, 3]);

    let reused = connection.create_channel().await.unwrap();
    assert_eq!(reused.id(), 2);
    assert_eq!(connection.open_channel_count(), 3);
}

#[tokio::test]
async fn test_explicit_channel_numbers() {
    let broker = FakeBroker::new().with_tuning(Tuning {
        channel_max: 3,
        frame_max: 131072,
        heartbeat: 0,
    });
    let connection = connect(&broker).await;

    let channel = connection.open_channel(Some(3)).await.unwrap();
    assert_eq!(channel.id(), 3);
    assert_matches!(
        connection.open_channel(Some(3)).await,
        Err(ConnectionError::ChannelInUse(3))
    );
    assert_matches!(
        connection.open_channel(Some(4)).await,
        Err(ConnectionError::ChannelOutOfRange { requested: 4, max: 3 })
    );
    assert_matches!(
        connection.open_channel(Some(0)).await,
        Err(ConnectionError::ChannelOutOfRange { requested: 0, .. })
    );

    connection.create_channel().await.unwrap();
    connection.create_channel().await.unwrap();
    assert_matches!(
        connection.create_channel().await,
        Err(ConnectionError::ChannelLimitExceeded { max: 3 })
    );
}

#[tokio::test]
async fn test_frame_for_unknown_channel_closes_connection() {
    let broker = FakeBroker::new();
    let connection = connect(&broker).await;
    let session = session(&broker);

    session.send_method(9, Method::ChannelOpenOk);
    let reason = connection.closed().await;

    assert_eq!(reason.reply_code(), CHANNEL_ERROR);
    assert_eq!(reason.channel(), Some(9));
    assert_eq!(reason.source(), ShutdownSource::Multiplexer);
    assert!(!reason.is_application_initiated());
    assert!(session.methods().iter().any(|(channel, method)| {
        *channel == 0
            && matches!(method, Method::ConnectionClose { reply_code, .. } if *reply_code == CHANNEL_ERROR)
    }));
}

#[tokio::test(start_paused = true)]
async fn test_rpc_timeout_keeps_connection_open() {
    let broker = FakeBroker::new();
    let connection = connect_with(
        &broker,
        warren_connection::ConnectionConfig {
            rpc_timeout: Duration::from_secs(2),
            ..config()
        },
    )
    .await;
    let channel = connection.create_channel().await.unwrap();

    broker.ignore("queue.declare");
    assert_matches!(
        channel.queue_declare("jobs", Default::default(), Default::default()).await,
        Err(ConnectionError::RpcTimeout { method: "queue.declare", timeout }) if timeout == Duration::from_secs(2)
    );
    assert!(connection.is_open());
    assert!(channel.is_open());

    broker.unignore("queue.declare");
    let declared = channel
        .queue_declare("jobs", Default::default(), Default::default())
        .await
        .unwrap();
    assert_eq!(declared.queue, "jobs");
}

#[tokio::test(start_paused = true)]
async fn test_late_reply_goes_to_no_one_after_timeout() {
    let broker = FakeBroker::new();
    let connection = connect_with(
        &broker,
        warren_connection::ConnectionConfig {
            rpc_timeout: Duration::from_secs(2),
            ..config()
        },
    )
    .await;
    let channel = connection.create_channel().await.unwrap();
    let broker_side = session(&broker);

    broker.ignore("queue.declare");
    assert_matches!(
        channel.queue_declare("first", Default::default(), Default::default()).await,
        Err(ConnectionError::RpcTimeout { .. })
    );

    let second = tokio::spawn({
        let channel = channel.clone();
        async move {
            channel
                .queue_declare("second", Default::default(), Default::default())
                .await
        }
    });
    wait_until(|| broker_side.count("queue.declare") == 2).await;

    for queue in ["first", "second"] {
        broker_side.send_method(
            1,
            Method::QueueDeclareOk {
                queue: queue.to_string(),
                message_count: 0,
                consumer_count: 0,
            },
        );
    }

    let declared = second.await.unwrap().unwrap();
    assert_eq!(declared.queue, "second");
    assert!(connection.is_open());
    assert!(channel.is_open());
}

#[tokio::test(start_paused = true)]
async fn test_late_reply_of_another_kind_keeps_connection_open() {
    let broker = FakeBroker::new();
    let connection = connect_with(
        &broker,
        warren_connection::ConnectionConfig {
            rpc_timeout: Duration::from_secs(2),
            ..config()
        },
    )
    .await;
    let channel = connection.create_channel().await.unwrap();
    let broker_side = session(&broker);

    broker.ignore("queue.bind");
    assert_matches!(
        channel.queue_bind("jobs", "orders", "new", Default::default()).await,
        Err(ConnectionError::RpcTimeout { method: "queue.bind", .. })
    );

    broker.ignore("basic.qos");
    let qos = tokio::spawn({
        let channel = channel.clone();
        async move { channel.basic_qos(10, false).await }
    });
    wait_until(|| broker_side.count("basic.qos") == 1).await;
    broker_side.send_method(1, Method::QueueBindOk);
    broker_side.send_method(1, Method::BasicQosOk);

    qos.await.unwrap().unwrap();
    assert!(connection.is_open());
    assert!(channel.is_open());
}

#[tokio::test]
async fn test_broker_channel_error_keeps_connection_open() {
    let broker = FakeBroker::new();
    let connection = connect(&broker).await;
    let channel = connection.create_channel().await.unwrap();

    broker.reject("queue.declare", 404, "NOT_FOUND - no queue 'missing'");
    let err = channel
        .queue_declare("missing", Default::default(), Default::default())
        .await
        .unwrap_err();
    assert_matches!(
        &err,
        ConnectionError::ChannelClosed { channel: 1, reason }
            if reason.reply_code() == 404 && reason.cause() == Some((50, 10))
    );
    assert!(!channel.is_open());
    assert!(connection.is_open());

    // The broker's close was acknowledged and the number freed.
    wait_until(|| session(&broker).count("channel.close-ok") == 1).await;
    assert_eq!(connection.create_channel().await.unwrap().id(), 1);
}

#[tokio::test]
async fn test_update_secret() {
    let broker = FakeBroker::new();
    let connection = connect(&broker).await;
    connection.update_secret("fresh-token", "token rotation").await.unwrap();
    assert_eq!(broker.count("connection.update-secret"), 1);

    let external = Connection::open(
        config(),
        Arc::new(FakeConnector::new(broker.clone())),
        Arc::new(SaslNegotiator::new(Credentials::External)),
    )
    .await
    .unwrap();
    assert_matches!(
        external.update_secret("fresh-token", "token rotation").await,
        Err(ConnectionError::Unsupported(_))
    );
    assert_eq!(broker.count("connection.update-secret"), 1);
}

#[tokio::test]
async fn test_broker_initiated_close() {
    let broker = FakeBroker::new();
    let connection = connect(&broker).await;
    let channel = connection.create_channel().await.unwrap();
    let session = session(&broker);

    session.close_connection(CONNECTION_FORCED, "CONNECTION_FORCED - broker shutdown");
    let reason = connection.closed().await;

    assert_eq!(reason.reply_code(), CONNECTION_FORCED);
    assert_eq!(reason.initiator(), ShutdownInitiator::Peer);
    assert_eq!(connection.state(), ConnectionState::Closed);
    assert!(!channel.is_open());
    assert_eq!(channel.close_reason(), Some(reason));
    wait_until(|| session.count("connection.close-ok") == 1).await;
}

#[tokio::test]
async fn test_transport_failure_fails_pending_requests() {
    let broker = FakeBroker::new();
    let connection = connect(&broker).await;
    let channel = connection.create_channel().await.unwrap();

    broker.ignore("queue.declare");
    let pending = tokio::spawn({
        let channel = channel.clone();
        async move {
            channel
                .queue_declare("jobs", Default::default(), Default::default())
                .await
        }
    });
    wait_until(|| broker.count("queue.declare") == 1).await;
    session(&broker).reset();

    assert_matches!(
        pending.await.unwrap(),
        Err(ConnectionError::NotOpen(reason)) if reason.is_transport_failure()
    );
    let reason = connection.closed().await;
    assert_eq!(reason.source(), ShutdownSource::Transport);
    assert!(connection.shutdown_report().is_empty());
}
