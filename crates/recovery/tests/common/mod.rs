#![allow(dead_code)]

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use warren_connection::{
    ConnectionConfig, ConnectionEvent, Credentials, EventKind, RecoveryConfig, SaslNegotiator,
};
use warren_recovery::RecoveringConnection;
use warren_test_utils::{FakeBroker, FakeConnector, init_tracing};

pub fn config() -> ConnectionConfig {
    ConnectionConfig {
        rpc_timeout: Duration::from_secs(5),
        shutdown_timeout: Duration::from_secs(5),
        ..ConnectionConfig::default()
    }
    .with_recovery(RecoveryConfig {
        interval: Duration::from_millis(50),
        max_interval: Duration::from_millis(200),
        max_attempts: 3,
        ..RecoveryConfig::default()
    })
}

pub async fn connect(broker: &FakeBroker) -> (RecoveringConnection, Arc<FakeConnector>) {
    connect_with(broker, config()).await
}

pub async fn connect_with(
    broker: &FakeBroker,
    config: ConnectionConfig,
) -> (RecoveringConnection, Arc<FakeConnector>) {
    init_tracing();
    let connector = Arc::new(FakeConnector::new(broker.clone()));
    let connection = RecoveringConnection::open(
        config,
        connector.clone(),
        Arc::new(SaslNegotiator::new(Credentials::default())),
    )
    .await
    .unwrap();
    (connection, connector)
}

/// Count the events of `kind`.
pub fn count_events(connection: &RecoveringConnection, kind: EventKind) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    connection.add_listener(kind, {
        let count = count.clone();
        move |_| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });
    count
}

/// Collect the events of `kind`.
pub fn collect_events(
    connection: &RecoveringConnection,
    kind: EventKind,
) -> Arc<Mutex<Vec<ConnectionEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    connection.add_listener(kind, {
        let events = events.clone();
        move |event| {
            events.lock().push(event.clone());
            Ok(())
        }
    });
    events
}
