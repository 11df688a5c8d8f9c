//! A connection handle that survives connection loss.
//!
//! [`RecoveringConnection`] wraps the current [`Connection`] and watches it. When it closes
//! for any reason other than an application request, the recovery engine opens a
//! replacement, replays the recorded topology onto it and swaps it in. Listeners live on one
//! [`EventDispatcher`] shared by every replacement, so registrations survive recovery.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{Instrument, debug, error, info, info_span, warn};
use warren_connection::{
    ChannelId, Connection, ConnectionConfig, ConnectionEvent, ConnectionState,
    EventDispatcher, EventKind, ListenerError, ListenerId, Result, ShutdownReason,
};
use warren_primitives::{Connector, Negotiator, constants::REPLY_SUCCESS};

use crate::{
    channel::RecoverableChannel,
    engine::{Recovered, RecoveryEngine},
    error::RecoveryError,
    metrics::RecoveryMetrics,
    policy::RetryPolicy,
    record::{RecordedChannel, RecoveryRecord},
    topology::{TopologyRecorder, TopologyRegistry},
};

pub(crate) struct Inner {
    engine: RecoveryEngine,
    registry: Arc<dyn TopologyRegistry>,
    record: RecoveryRecord,
    /// The live connection; replaced wholesale by recovery.
    current: RwLock<Connection>,
    recovering: AtomicBool,
    /// Set once the application asked to close.
    closing: watch::Sender<bool>,
    /// Set once the connection is closed for good.
    finished: watch::Sender<Option<ShutdownReason>>,
    /// Shutdown listeners registered while recovering. `Some` only during a recovery run.
    late_shutdown: Mutex<Option<Vec<ListenerId>>>,
}

impl Inner {
    pub(crate) fn current(&self) -> Connection {
        self.current.read().clone()
    }

    pub(crate) fn registry(&self) -> &dyn TopologyRegistry {
        self.registry.as_ref()
    }

    /// Stop recovering a channel and the consumers registered on it.
    pub(crate) fn forget_channel(&self, recorded: &Arc<RecordedChannel>) {
        if self.record.remove(recorded) {
            self.registry.forget_channel(recorded.id());
        }
    }

    /// Watch `connection` and recover it if it closes unexpectedly.
    fn supervise(self: &Arc<Self>, connection: Connection) {
        let inner = self.clone();
        let span = info_span!("recovery", endpoint = %connection.endpoint());
        tokio::spawn(
            async move {
                let reason = connection.closed().await;
                if reason.is_application_initiated() || *inner.closing.borrow() {
                    inner.finish(reason);
                    return;
                }
                if !inner.engine.is_enabled() {
                    info!(%reason, "Connection lost, automatic recovery disabled");
                    inner.finish(reason);
                    return;
                }
                inner.recover(reason).await;
            }
            .instrument(span),
        );
    }

    async fn recover(self: Arc<Self>, reason: ShutdownReason) {
        warn!(%reason, "Connection lost, recovering");
        *self.late_shutdown.lock() = Some(Vec::new());
        self.recovering.store(true, Ordering::Release);
        self.prune_closed_channels(&reason);

        let mut cancel = self.closing.subscribe();
        let result = match self
            .engine
            .recover(self.registry(), &self.record, &mut cancel)
            .await
        {
            Ok(recovered) => self.install(recovered).await,
            Err(e) => Err(e),
        };
        self.recovering.store(false, Ordering::Release);
        if result.is_ok() {
            // They fire when the replacement shuts down.
            self.late_shutdown.lock().take();
        }

        match result {
            Ok(Recovered {
                connection,
                attempts,
            }) => {
                self.engine.metrics.succeeded_total.increment(1);
                info!(endpoint = %connection.endpoint(), attempts, "Connection recovered");
                self.engine
                    .events
                    .dispatch(&ConnectionEvent::RecoverySucceeded {
                        endpoint: connection.endpoint().clone(),
                        attempts,
                    });
                self.supervise(connection);
            }
            // The application's close finishes the connection.
            Err(RecoveryError::Cancelled) => debug!("Recovery cancelled"),
            Err(error) => {
                self.engine.metrics.failed_total.increment(1);
                error!(%error, "Recovery failed");
                self.finish(reason);
                self.engine.events.dispatch(&ConnectionEvent::RecoveryFailed {
                    error: error.to_string(),
                });
            }
        }
    }

    /// Swap in the replacement, unless the application closed in the meantime.
    async fn install(&self, recovered: Recovered) -> Result<Recovered, RecoveryError> {
        let installed = {
            let mut current = self.current.write();
            let closing = *self.closing.borrow();
            if !closing {
                *current = recovered.connection.clone();
            }
            !closing
        };
        if !installed {
            let _ = recovered.connection.abort().await;
            return Err(RecoveryError::Cancelled);
        }
        Ok(recovered)
    }

    /// Channels that closed on their own before the connection went down are not reopened.
    fn prune_closed_channels(&self, reason: &ShutdownReason) {
        for recorded in self.record.channels() {
            let channel = recorded.channel();
            if channel.close_reason().is_some_and(|closed| &closed != reason) {
                debug!(channel = channel.id(), "Channel closed before the connection; not recovering it");
                self.forget_channel(&recorded);
            }
        }
    }

    /// Mark the connection closed for good and end every consumer stream.
    ///
    /// Shutdown listeners registered during an unfinished recovery missed the connection's
    /// shutdown event and get it now.
    fn finish(&self, reason: ShutdownReason) {
        for channel in self.record.clear() {
            self.registry.forget_channel(channel);
        }
        let finished = self.finished.send_if_modified(|finished| {
            if finished.is_some() {
                return false;
            }
            *finished = Some(reason.clone());
            true
        });
        let late = self.late_shutdown.lock().take();
        if let Some(ids) = late.filter(|ids| finished && !ids.is_empty()) {
            debug!(listeners = ids.len(), "Delivering shutdown to listeners registered during recovery");
            self.engine.events.dispatch_to(&ids, &ConnectionEvent::Shutdown(reason));
        }
    }

    /// Register a shutdown listener on the shared dispatcher if a recovery run is open.
    fn add_late_shutdown_listener<F>(&self, listener: F) -> std::result::Result<ListenerId, F>
    where
        F: Fn(&ConnectionEvent) -> std::result::Result<(), ListenerError> + Send + Sync + 'static,
    {
        let mut late = self.late_shutdown.lock();
        let Some(ids) = late.as_mut() else {
            return Err(listener);
        };
        let id = self.engine.events.add_listener(EventKind::Shutdown, listener);
        ids.push(id);
        Ok(id)
    }
}

/// A connection that recovers automatically from unexpected loss.
///
/// Cloning is cheap; all clones share the same underlying connection. Channels opened here
/// are [`RecoverableChannel`]s: their declarations are recorded and replayed after recovery.
#[derive(Clone)]
pub struct RecoveringConnection {
    inner: Arc<Inner>,
}

impl fmt::Debug for RecoveringConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveringConnection")
            .field("connection", &self.inner.current())
            .field("recovering", &self.is_recovering())
            .field("channels", &self.inner.record.len())
            .finish_non_exhaustive()
    }
}

impl RecoveringConnection {
    /// Connect, recording topology in a [`TopologyRecorder`].
    ///
    /// A failure here is returned as is; recovery only applies to connections that opened.
    pub async fn open(
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
        negotiator: Arc<dyn Negotiator>,
    ) -> Result<Self> {
        Self::open_with_registry(config, connector, negotiator, Arc::new(TopologyRecorder::new()))
            .await
    }

    /// Connect, recording topology in `registry`.
    pub async fn open_with_registry(
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
        negotiator: Arc<dyn Negotiator>,
        registry: Arc<dyn TopologyRegistry>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let events = EventDispatcher::new();
        let connection = Connection::open_with_events(
            config.clone(),
            connector.clone(),
            negotiator.clone(),
            events.clone(),
        )
        .await?;

        let policy = RetryPolicy::from(&config.recovery);
        let inner = Arc::new(Inner {
            engine: RecoveryEngine {
                config,
                connector,
                negotiator,
                events,
                policy,
                metrics: RecoveryMetrics::default(),
            },
            registry,
            record: RecoveryRecord::default(),
            current: RwLock::new(connection.clone()),
            recovering: AtomicBool::new(false),
            closing: watch::Sender::new(false),
            finished: watch::Sender::new(None),
            late_shutdown: Mutex::new(None),
        });
        inner.supervise(connection);
        Ok(Self { inner })
    }

    /// The connection currently in use. Replaced after every recovery.
    pub fn connection(&self) -> Connection {
        self.inner.current()
    }

    pub async fn create_channel(&self) -> Result<RecoverableChannel> {
        self.open_channel(None).await
    }

    /// Open a channel, on a specific number if given. Recovery reopens it on the same number
    /// when the new connection allows.
    pub async fn open_channel(&self, id: Option<ChannelId>) -> Result<RecoverableChannel> {
        let channel = self.inner.current().open_channel(id).await?;
        let recorded = self.inner.record.add(channel);
        Ok(RecoverableChannel::new(self.inner.clone(), recorded))
    }

    pub async fn update_secret(&self, new_secret: impl Into<Bytes>, reason: &str) -> Result<()> {
        self.inner.current().update_secret(new_secret, reason).await
    }

    pub async fn close(&self) -> Result<()> {
        self.close_with(REPLY_SUCCESS, "OK", None).await
    }

    pub async fn close_with_timeout(&self, timeout: Duration) -> Result<()> {
        self.close_with(REPLY_SUCCESS, "OK", Some(timeout)).await
    }

    /// Close for good. Cancels a recovery in progress.
    pub async fn close_with(
        &self,
        reply_code: u16,
        reply_text: &str,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let connection = self.begin_close();
        let result = connection.close_with(reply_code, reply_text, timeout).await;
        self.inner
            .finish(connection.close_reason().unwrap_or_else(ShutdownReason::normal));
        result
    }

    pub async fn abort(&self) -> Result<()> {
        let connection = self.begin_close();
        let result = connection.abort().await;
        self.inner
            .finish(connection.close_reason().unwrap_or_else(ShutdownReason::normal));
        result
    }

    fn begin_close(&self) -> Connection {
        let current = self.inner.current.write();
        self.inner.closing.send_replace(true);
        current.clone()
    }

    /// Resolves once the connection is closed for good: by the application, after a failed
    /// recovery, or on loss with recovery disabled.
    pub async fn closed(&self) -> ShutdownReason {
        let mut finished = self.inner.finished.subscribe();
        let reason = finished
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|reason| reason.clone());
        reason.unwrap_or_else(ShutdownReason::normal)
    }

    /// Register a listener on the dispatcher shared by every replacement connection.
    pub fn add_listener<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&ConnectionEvent) -> std::result::Result<(), ListenerError> + Send + Sync + 'static,
    {
        if kind != EventKind::Shutdown {
            return self.inner.engine.events.add_listener(kind, listener);
        }
        // A closed connection that is about to be replaced has not shut down for good.
        match self.inner.add_late_shutdown_listener(listener) {
            Ok(id) => id,
            Err(listener) => self.inner.current().add_listener(kind, listener),
        }
    }

    pub fn on_shutdown<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ConnectionEvent) -> std::result::Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.add_listener(EventKind::Shutdown, listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.engine.events.remove_listener(id)
    }

    pub fn events(&self) -> &Arc<EventDispatcher> {
        &self.inner.engine.events
    }

    pub fn registry(&self) -> &Arc<dyn TopologyRegistry> {
        &self.inner.registry
    }

    /// `Connecting` while recovery is running, otherwise the current connection's state.
    pub fn state(&self) -> ConnectionState {
        if self.is_recovering() {
            return ConnectionState::Connecting;
        }
        self.inner.current().state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn is_recovering(&self) -> bool {
        self.inner.recovering.load(Ordering::Acquire)
    }

    /// Why the connection closed for good. `None` while open or recovering.
    pub fn close_reason(&self) -> Option<ShutdownReason> {
        self.inner.finished.borrow().clone()
    }

    /// Channels that recovery would reopen.
    pub fn recorded_channel_count(&self) -> usize {
        self.inner.record.len()
    }

    pub fn config(&self) -> &Arc<ConnectionConfig> {
        &self.inner.engine.config
    }
}
