//! Test utilities for warren crates.
//!
//! - [`memory_transport`] - a framed transport backed by in-memory queues
//! - [`FakeBroker`] - answers the client like a broker and records what it receives
//! - [`FakeConnector`] - a [`Connector`](warren_primitives::Connector) dialling a fake broker

use std::time::Duration;

use tracing_subscriber::EnvFilter;

mod broker;
mod connector;
mod transport;

pub use broker::{BrokerSession, FakeBroker, HEARTBEAT};
pub use connector::FakeConnector;
pub use transport::{Faults, Inbound, MemoryPeer, MemoryReader, MemoryWriter, memory_transport};

/// Install a test-friendly subscriber honouring `RUST_LOG`. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `condition` until it holds.
///
/// # Panics
///
/// If the condition does not hold within ten seconds (of tokio time).
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    const LIMIT: Duration = Duration::from_secs(10);
    let poll = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    if tokio::time::timeout(LIMIT, poll).await.is_err() {
        panic!("condition not met within {LIMIT:?}");
    }
}
