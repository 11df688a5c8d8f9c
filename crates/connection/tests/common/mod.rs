#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use warren_connection::{Connection, ConnectionConfig, Credentials, RecoveryConfig, SaslNegotiator};
use warren_test_utils::{BrokerSession, FakeBroker, FakeConnector, init_tracing};

pub fn config() -> ConnectionConfig {
    ConnectionConfig {
        rpc_timeout: Duration::from_secs(5),
        shutdown_timeout: Duration::from_secs(5),
        ..ConnectionConfig::default()
    }
    .with_recovery(RecoveryConfig::disabled())
}

pub async fn connect(broker: &FakeBroker) -> Connection {
    connect_with(broker, config()).await
}

pub async fn connect_with(broker: &FakeBroker, config: ConnectionConfig) -> Connection {
    init_tracing();
    Connection::open(
        config,
        Arc::new(FakeConnector::new(broker.clone())),
        Arc::new(SaslNegotiator::new(Credentials::default())),
    )
    .await
    .unwrap()
}

pub fn session(broker: &FakeBroker) -> BrokerSession {
    broker.last_session().unwrap()
}
