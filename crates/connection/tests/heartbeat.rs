mod common;

use std::time::Duration;

use warren_connection::{ConnectionState, MISSED_HEARTBEAT_MULTIPLIER, ShutdownSource};
use warren_primitives::Tuning;
use warren_test_utils::{FakeBroker, HEARTBEAT};

use crate::common::{connect, session};

fn broker_with_heartbeat(seconds: u16) -> FakeBroker {
    FakeBroker::new().with_tuning(Tuning {
        channel_max: 2047,
        frame_max: 131072,
        heartbeat: seconds,
    })
}

#[tokio::test(start_paused = true)]
async fn test_heartbeats_keep_idle_connection_alive() {
    let broker = broker_with_heartbeat(2);
    let connection = connect(&broker).await;
    assert_eq!(connection.heartbeat(), Duration::from_secs(2));

    tokio::time::sleep(Duration::from_secs(30)).await;

    assert!(connection.is_open());
    // One heartbeat per interval of outbound silence, give or take a tick.
    let sent = session(&broker).count(HEARTBEAT);
    assert!((12..=15).contains(&sent), "sent {sent} heartbeats");
}

#[tokio::test(start_paused = true)]
async fn test_silent_peer_declared_dead() {
    let broker = broker_with_heartbeat(5);
    broker.ignore(HEARTBEAT);
    let connection = connect(&broker).await;
    let started = tokio::time::Instant::now();

    let reason = connection.closed().await;

    assert_eq!(reason.source(), ShutdownSource::Heartbeat);
    assert!(reason.is_transport_failure());
    assert!(reason.reply_text().contains("missed heartbeats"));
    assert_eq!(connection.state(), ConnectionState::Closed);

    let deadline = Duration::from_secs(5) * MISSED_HEARTBEAT_MULTIPLIER;
    let elapsed = started.elapsed();
    assert!(elapsed >= deadline, "declared dead after {elapsed:?}");
    assert!(elapsed <= deadline + Duration::from_secs(3), "declared dead after {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn test_heartbeats_disabled_when_both_sides_opt_out() {
    let broker = broker_with_heartbeat(0);
    let connection = crate::common::connect_with(
        &broker,
        crate::common::config().with_heartbeat(Duration::ZERO),
    )
    .await;
    assert_eq!(connection.heartbeat(), Duration::ZERO);

    tokio::time::sleep(Duration::from_secs(600)).await;

    assert!(connection.is_open());
    assert_eq!(session(&broker).count(HEARTBEAT), 0);
}
