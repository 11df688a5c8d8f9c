use std::{
    collections::HashSet,
    io,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use warren_primitives::{Connector, Endpoint, FramedTransport};

use crate::FakeBroker;

/// [`Connector`] that dials a [`FakeBroker`], with switches for refusing connections.
#[derive(Debug)]
pub struct FakeConnector {
    broker: FakeBroker,
    refuse_all: AtomicBool,
    refuse_next: AtomicUsize,
    refused: Mutex<HashSet<Endpoint>>,
    attempts: Mutex<Vec<Endpoint>>,
}

impl FakeConnector {
    pub fn new(broker: FakeBroker) -> Self {
        Self {
            broker,
            refuse_all: AtomicBool::new(false),
            refuse_next: AtomicUsize::new(0),
            refused: Mutex::new(HashSet::new()),
            attempts: Mutex::new(Vec::new()),
        }
    }

    pub fn broker(&self) -> &FakeBroker {
        &self.broker
    }

    /// Refuse every connection until switched off.
    pub fn refuse_all(&self, refuse: bool) {
        self.refuse_all.store(refuse, Ordering::Release);
    }

    /// Refuse the next `count` connections, whatever the endpoint.
    pub fn refuse_next(&self, count: usize) {
        self.refuse_next.store(count, Ordering::Release);
    }

    /// Refuse connections to one endpoint.
    pub fn refuse_endpoint(&self, endpoint: Endpoint) {
        self.refused.lock().insert(endpoint);
    }

    pub fn allow_endpoint(&self, endpoint: &Endpoint) {
        self.refused.lock().remove(endpoint);
    }

    /// Every endpoint dialled so far, refused or not.
    pub fn attempts(&self) -> Vec<Endpoint> {
        self.attempts.lock().clone()
    }

    fn should_refuse(&self, endpoint: &Endpoint) -> bool {
        if self.refuse_all.load(Ordering::Acquire) || self.refused.lock().contains(endpoint) {
            return true;
        }
        self.refuse_next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, endpoint: &Endpoint) -> io::Result<FramedTransport> {
        self.attempts.lock().push(endpoint.clone());
        if self.should_refuse(endpoint) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("connection to {endpoint} refused"),
            ));
        }
        Ok(self.broker.accept())
    }
}
