//! Lifecycle events and the listener registry.
//!
//! Listeners run synchronously on the task that raised the event, in registration order. A
//! listener that returns an error or panics is isolated: the failure is wrapped into a
//! [`ConnectionEvent::CallbackException`] and delivered to the callback-exception listeners,
//! while the remaining listeners for the original event still run. Failures inside
//! callback-exception listeners are logged and swallowed.
//!
//! Every event is also emitted on a broadcast channel for subscribers that prefer an async
//! stream; slow subscribers drop events independently.

use std::{
    any::Any,
    collections::HashMap,
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use metrics::Counter;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use warren_primitives::{Endpoint, ShutdownReason};

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// The eight kinds of lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Shutdown,
    Blocked,
    Unblocked,
    RecoverySucceeded,
    RecoveryFailed,
    ConsumerTagChanged,
    QueueNameChanged,
    CallbackException,
}

/// A lifecycle notification.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// The connection reached the closed state.
    Shutdown(ShutdownReason),
    /// The broker stopped accepting publishes.
    Blocked { reason: String },
    Unblocked,
    /// A replacement connection is open and topology has been replayed.
    RecoverySucceeded { endpoint: Endpoint, attempts: u32 },
    /// Recovery gave up; the connection stays closed.
    RecoveryFailed { error: String },
    /// A server-generated consumer tag changed during replay.
    ConsumerTagChanged { old: String, new: String },
    /// A server-named queue got a new name during replay.
    QueueNameChanged { old: String, new: String },
    /// A listener for `kind` returned an error or panicked.
    CallbackException { kind: EventKind, error: String },
}

impl ConnectionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Shutdown(_) => EventKind::Shutdown,
            Self::Blocked { .. } => EventKind::Blocked,
            Self::Unblocked => EventKind::Unblocked,
            Self::RecoverySucceeded { .. } => EventKind::RecoverySucceeded,
            Self::RecoveryFailed { .. } => EventKind::RecoveryFailed,
            Self::ConsumerTagChanged { .. } => EventKind::ConsumerTagChanged,
            Self::QueueNameChanged { .. } => EventKind::QueueNameChanged,
            Self::CallbackException { .. } => EventKind::CallbackException,
        }
    }
}

/// Error type listeners may return.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// A registered callback.
pub type Listener = Arc<dyn Fn(&ConnectionEvent) -> Result<(), ListenerError> + Send + Sync>;

/// Handle returned by registration, used to remove the listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// Listener registry and dispatcher.
///
/// One dispatcher can outlive a single connection: the recovery layer hands the same instance
/// to every replacement connection so registrations survive recovery.
pub struct EventDispatcher {
    next_id: AtomicU64,
    listeners: Mutex<HashMap<EventKind, Vec<(ListenerId, Listener)>>>,
    tx: broadcast::Sender<ConnectionEvent>,
    /// Listener invocations that failed or panicked
    failures: Counter,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(DEFAULT_CHANNEL_CAPACITY);
        Self {
            next_id: AtomicU64::new(1),
            listeners: Mutex::new(HashMap::new()),
            tx,
            failures: metrics::counter!("amqp.connection.callback_failures_total"),
        }
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self.listeners.lock();
        f.debug_struct("EventDispatcher")
            .field("listeners", &listeners.values().map(Vec::len).sum::<usize>())
            .field("subscribers", &self.tx.receiver_count())
            .finish()
    }
}

impl EventDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `listener` for `kind`. Listeners run in registration order.
    pub fn add_listener<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&ConnectionEvent) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.register(kind, Arc::new(listener))
    }

    pub(crate) fn register(&self, kind: EventKind, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .entry(kind)
            .or_default()
            .push((id, listener));
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        for registered in listeners.values_mut() {
            if let Some(pos) = registered.iter().position(|(lid, _)| *lid == id) {
                registered.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.lock().get(&kind).map_or(0, Vec::len)
    }

    /// Subscribe to every event as an async stream.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.tx.subscribe()
    }

    /// Deliver `event` to every listener registered for its kind.
    pub fn dispatch(&self, event: &ConnectionEvent) {
        let listeners = self.snapshot(event.kind());
        self.deliver(&listeners, event);
    }

    /// Deliver `event` only to those of `ids` still registered for its kind.
    ///
    /// Subscribers of the broadcast stream are not notified again.
    pub fn dispatch_to(&self, ids: &[ListenerId], event: &ConnectionEvent) {
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .get(&event.kind())
            .map(|registered| {
                registered
                    .iter()
                    .filter(|(id, _)| ids.contains(id))
                    .map(|(_, l)| l.clone())
                    .collect()
            })
            .unwrap_or_default();
        self.notify(&listeners, event);
    }

    /// Copy of the listeners for `kind`, taken under the registry lock.
    pub(crate) fn snapshot(&self, kind: EventKind) -> Vec<Listener> {
        self.listeners
            .lock()
            .get(&kind)
            .map(|registered| registered.iter().map(|(_, l)| l.clone()).collect())
            .unwrap_or_default()
    }

    /// Deliver `event` to an already-taken snapshot of listeners.
    pub(crate) fn deliver(&self, listeners: &[Listener], event: &ConnectionEvent) {
        debug!(kind = ?event.kind(), listeners = listeners.len(), "Dispatching event");
        let _ = self.tx.send(event.clone());
        self.notify(listeners, event);
    }

    /// Invoke a single listener outside the registry, with the same fault isolation.
    pub(crate) fn deliver_to(&self, listener: &Listener, event: &ConnectionEvent) {
        self.notify(std::slice::from_ref(listener), event);
    }

    fn notify(&self, listeners: &[Listener], event: &ConnectionEvent) {
        let kind = event.kind();
        for listener in listeners {
            let Err(error) = invoke(listener, event) else {
                continue;
            };
            self.failures.increment(1);
            if kind == EventKind::CallbackException {
                warn!(%error, "Callback-exception listener failed; swallowing");
                continue;
            }
            warn!(?kind, %error, "Listener failed");
            self.dispatch(&ConnectionEvent::CallbackException { kind, error });
        }
    }
}

/// Run one listener, turning errors and panics into a message.
fn invoke(listener: &Listener, event: &ConnectionEvent) -> Result<(), String> {
    match catch_unwind(AssertUnwindSafe(|| listener(event))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(panic) => Err(panic_message(panic.as_ref())),
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("listener panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("listener panicked: {s}")
    } else {
        "listener panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use assert_matches::assert_matches;

    use super::*;

    fn recorder(
        log: &Arc<Mutex<Vec<String>>>,
        name: &'static str,
    ) -> impl Fn(&ConnectionEvent) -> Result<(), ListenerError> + Send + Sync + 'static {
        let log = log.clone();
        move |_| {
            log.lock().push(name.to_string());
            Ok(())
        }
    }

    #[test]
    fn test_registration_order() {
        let dispatcher = EventDispatcher::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        dispatcher.add_listener(EventKind::Unblocked, recorder(&log, "first"));
        dispatcher.add_listener(EventKind::Unblocked, recorder(&log, "second"));
        dispatcher.add_listener(EventKind::Blocked, recorder(&log, "other"));

        dispatcher.dispatch(&ConnectionEvent::Unblocked);
        assert_eq!(*log.lock(), vec!["first", "second"]);
    }

    #[test]
    fn test_dispatch_to_selected_listeners() {
        let dispatcher = EventDispatcher::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        dispatcher.add_listener(EventKind::Shutdown, recorder(&log, "earlier"));
        let late = dispatcher.add_listener(EventKind::Shutdown, recorder(&log, "late"));
        let removed = dispatcher.add_listener(EventKind::Shutdown, recorder(&log, "removed"));
        dispatcher.remove_listener(removed);

        dispatcher.dispatch_to(&[late, removed], &ConnectionEvent::Shutdown(ShutdownReason::normal()));
        assert_eq!(*log.lock(), vec!["late"]);
    }

    #[test]
    fn test_failing_listener_is_isolated() {
        let dispatcher = EventDispatcher::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        let exceptions = Arc::new(Mutex::new(Vec::new()));

        dispatcher.add_listener(EventKind::Shutdown, |_| Err("boom".into()));
        dispatcher.add_listener(EventKind::Shutdown, recorder(&log, "second"));
        let seen = exceptions.clone();
        dispatcher.add_listener(EventKind::CallbackException, move |event| {
            seen.lock().push(event.clone());
            Ok(())
        });

        dispatcher.dispatch(&ConnectionEvent::Shutdown(ShutdownReason::normal()));

        assert_eq!(*log.lock(), vec!["second"]);
        let exceptions = exceptions.lock();
        assert_eq!(exceptions.len(), 1);
        assert_matches!(
            &exceptions[0],
            ConnectionEvent::CallbackException { kind: EventKind::Shutdown, error } if error == "boom"
        );
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let dispatcher = EventDispatcher::default();
        let count = Arc::new(AtomicUsize::new(0));

        dispatcher.add_listener(EventKind::Blocked, |_| panic!("listener bug"));
        let exceptions = count.clone();
        dispatcher.add_listener(EventKind::CallbackException, move |event| {
            assert_matches!(event, ConnectionEvent::CallbackException { error, .. } if error.contains("listener bug"));
            exceptions.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        dispatcher.dispatch(&ConnectionEvent::Blocked {
            reason: "low on memory".into(),
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_exception_failures_do_not_recurse() {
        let dispatcher = EventDispatcher::default();
        let calls = Arc::new(AtomicUsize::new(0));

        dispatcher.add_listener(EventKind::Unblocked, |_| Err("first failure".into()));
        let counter = calls.clone();
        dispatcher.add_listener(EventKind::CallbackException, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err("failure while handling failure".into())
        });

        dispatcher.dispatch(&ConnectionEvent::Unblocked);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_listener() {
        let dispatcher = EventDispatcher::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        let id = dispatcher.add_listener(EventKind::Unblocked, recorder(&log, "removed"));
        dispatcher.add_listener(EventKind::Unblocked, recorder(&log, "kept"));

        assert!(dispatcher.remove_listener(id));
        assert!(!dispatcher.remove_listener(id));
        assert_eq!(dispatcher.listener_count(EventKind::Unblocked), 1);

        dispatcher.dispatch(&ConnectionEvent::Unblocked);
        assert_eq!(*log.lock(), vec!["kept"]);
    }

    #[tokio::test]
    async fn test_subscribe() {
        let dispatcher = EventDispatcher::default();
        let mut rx = dispatcher.subscribe();

        dispatcher.dispatch(&ConnectionEvent::QueueNameChanged {
            old: "amq.gen-1".into(),
            new: "amq.gen-2".into(),
        });

        assert_matches!(
            rx.recv().await,
            Ok(ConnectionEvent::QueueNameChanged { old, new }) if old == "amq.gen-1" && new == "amq.gen-2"
        );
    }
}
