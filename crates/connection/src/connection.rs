//! The connection state machine.
//!
//! `Connecting -> Open -> Closing -> Closed`. A [`Connection`] only exists once the handshake
//! has succeeded, so instances start in `Open`. The read task is the only path that routes
//! inbound frames; the write task is the only path that touches the transport's write half.

use std::{io, sync::Arc, time::Duration};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::{
    sync::{oneshot, watch},
    task::AbortHandle,
};
use tracing::{Instrument, Span, debug, info, info_span, trace, warn};
use warren_primitives::{
    CONTROL_CHANNEL, ChannelId, Connector, Endpoint, FieldTable, Frame, FrameReader,
    FramedTransport, HandshakeError, Method, Negotiated, Negotiator, ShutdownInitiator,
    ShutdownReason, ShutdownSource,
    constants::{COMMAND_INVALID, MAX_CHANNELS_CEILING, REPLY_SUCCESS, UNEXPECTED_FRAME},
};

use crate::{
    channel::{Channel, ChannelInner, Routed},
    config::{ConfigError, ConnectionConfig},
    error::{ConnectionError, Result},
    events::{ConnectionEvent, EventDispatcher, EventKind, Listener, ListenerError, ListenerId},
    flow::{FlowGate, Submitted},
    heartbeat::{self, HeartbeatMonitor},
    io::{Outlet, run_writer},
    metrics::ConnectionMetrics,
    multiplexer::ChannelTable,
    shutdown::{self, CloseMode, ShutdownReportEntry},
};

const PRODUCT: &str = "warren";

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Transport connect and handshake in progress.
    Connecting,
    Open,
    /// A close handshake is running.
    Closing,
    /// Terminal.
    Closed,
}

#[derive(Debug)]
struct Lifecycle {
    state: ConnectionState,
    /// Set on entering `Closing`, after every channel has been closed.
    close_reason: Option<ShutdownReason>,
}

impl Lifecycle {
    fn not_open(&self) -> ConnectionError {
        let reason = self.close_reason.clone().unwrap_or_else(|| {
            ShutdownReason::new(
                REPLY_SUCCESS,
                "connection not open",
                ShutdownInitiator::Local,
                ShutdownSource::StateMachine,
            )
        });
        ConnectionError::NotOpen(reason)
    }
}

/// State shared by the application handles and the connection's tasks.
pub(crate) struct Shared {
    config: Arc<ConnectionConfig>,
    endpoint: Endpoint,
    negotiated: Negotiated,
    channel_max: ChannelId,
    lifecycle: Mutex<Lifecycle>,
    channels: Mutex<ChannelTable<Arc<ChannelInner>>>,
    outlet: Outlet,
    gate: FlowGate,
    heartbeat: Arc<HeartbeatMonitor>,
    events: Arc<EventDispatcher>,
    /// Continuation for `connection.update-secret-ok`.
    control: Mutex<Option<oneshot::Sender<Result<()>>>>,
    control_lock: tokio::sync::Mutex<()>,
    closed: watch::Sender<Option<ShutdownReason>>,
    report: Mutex<Vec<ShutdownReportEntry>>,
    close_error: Mutex<Option<io::Error>>,
    tasks: Mutex<Vec<AbortHandle>>,
    metrics: ConnectionMetrics,
}

impl Shared {
    pub(crate) fn state(&self) -> ConnectionState {
        self.lifecycle.lock().state
    }

    pub(crate) fn close_reason(&self) -> Option<ShutdownReason> {
        self.lifecycle.lock().close_reason.clone()
    }

    pub(crate) fn rpc_timeout(&self) -> Duration {
        self.config.rpc_timeout
    }

    pub(crate) fn frame_max(&self) -> u32 {
        self.negotiated.tuning.frame_max
    }

    fn ensure_open(&self) -> Result<()> {
        let lifecycle = self.lifecycle.lock();
        match lifecycle.state {
            ConnectionState::Open => Ok(()),
            _ => Err(lifecycle.not_open()),
        }
    }

    /// Queue channel frames behind the flow-control gate.
    pub(crate) fn submit(&self, frames: Vec<Frame>) -> Result<()> {
        self.ensure_open()?;
        match self.gate.submit(frames, &self.outlet)? {
            Submitted::Sent => {}
            Submitted::Held => {
                self.metrics.publishes_held_total.increment(1);
                trace!("Connection blocked; write held");
            }
        }
        Ok(())
    }

    /// Send a control-channel frame, bypassing flow control.
    pub(crate) fn send_control(&self, frame: Frame) -> io::Result<()> {
        self.outlet.send_one(frame)
    }

    pub(crate) fn subscribe_closed(&self) -> watch::Receiver<Option<ShutdownReason>> {
        self.closed.subscribe()
    }

    pub(crate) fn record(&self, entry: ShutdownReportEntry) {
        debug!(%entry, "Shutdown report entry");
        self.report.lock().push(entry);
    }

    pub(crate) fn set_close_error(&self, error: io::Error) {
        self.close_error.lock().get_or_insert(error);
    }

    pub(crate) fn take_close_error(&self) -> Option<io::Error> {
        self.close_error.lock().take()
    }

    fn allocate_channel(&self, requested: Option<ChannelId>) -> Result<Arc<ChannelInner>> {
        let lifecycle = self.lifecycle.lock();
        if lifecycle.state != ConnectionState::Open {
            return Err(lifecycle.not_open());
        }
        let (_, inner) = self.channels.lock().allocate(requested, ChannelInner::new)?;
        self.metrics.channels_open.increment(1.0);
        Ok(inner)
    }

    fn release_channel(&self, id: ChannelId) {
        if self.channels.lock().release(id).is_some() {
            self.metrics.channels_closed(1);
            trace!(channel = id, "Channel number released");
        }
    }

    /// Open -> Closing. Force-closes every channel before recording the reason.
    ///
    /// Returns false if the connection was not open; only the first trigger proceeds.
    pub(crate) fn begin_closing(&self, reason: ShutdownReason) -> bool {
        let teardowns = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state != ConnectionState::Open {
                return false;
            }
            lifecycle.state = ConnectionState::Closing;
            let channels = self.channels.lock().drain();
            self.metrics.channels_closed(channels.len());
            let teardowns: Vec<_> = channels
                .iter()
                .filter_map(|channel| channel.force_close(reason.clone()))
                .collect();
            lifecycle.close_reason = Some(reason.clone());
            teardowns
        };
        debug!(%reason, channels = teardowns.len(), "Connection closing");

        for teardown in teardowns {
            let channel = teardown.channel();
            for error in teardown.complete() {
                self.record(ShutdownReportEntry::ChannelCloseFailed { channel, error });
            }
        }
        if let Some(pending) = self.control.lock().take() {
            let _ = pending.send(Err(ConnectionError::NotOpen(reason)));
        }
        let discarded = self.gate.discard();
        if discarded > 0 {
            debug!(discarded, "Dropped writes held by flow control");
        }
        true
    }

    /// Closing -> Closed: release the transport and notify shutdown listeners. Idempotent.
    pub(crate) async fn finish(&self) {
        let (reason, listeners) = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state == ConnectionState::Closed {
                return;
            }
            lifecycle.state = ConnectionState::Closed;
            let reason = lifecycle
                .close_reason
                .get_or_insert_with(ShutdownReason::normal)
                .clone();
            // Snapshot under the lifecycle lock: later registrations fire immediately instead.
            (reason, self.events.snapshot(EventKind::Shutdown))
        };

        match tokio::time::timeout(self.config.shutdown_timeout, self.outlet.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.record(ShutdownReportEntry::TransportError {
                    error: e.to_string(),
                });
                self.set_close_error(e);
            }
            Err(_) => self.record(ShutdownReportEntry::TransportError {
                error: "timed out releasing transport".to_string(),
            }),
        }

        info!(%reason, "Connection closed");
        // Listeners run before close() callers are released.
        self.events
            .deliver(&listeners, &ConnectionEvent::Shutdown(reason.clone()));
        self.closed.send_replace(Some(reason));

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Fatal transport-level failure: tear down without a handshake.
    pub(crate) async fn fail(&self, reason: ShutdownReason) {
        if self.begin_closing(reason.clone()) {
            warn!(%reason, "Connection lost");
        } else if self.state() == ConnectionState::Closing {
            self.record(ShutdownReportEntry::TransportError {
                error: reason.reply_text().to_string(),
            });
        } else {
            return;
        }
        self.finish().await;
    }

    /// Close the connection for a protocol violation detected on the read path.
    fn violation(self: &Arc<Self>, reason: ShutdownReason) {
        warn!(%reason, "Protocol violation; closing connection");
        if shutdown::initiate(self, reason) {
            let shared = self.clone();
            let timeout = self.config.shutdown_timeout;
            tokio::spawn(
                async move { shutdown::complete(&shared, Some(timeout)).await }
                    .instrument(Span::current()),
            );
        }
    }

    /// Route one inbound frame. Returns false once the read path should stop.
    async fn dispatch(self: &Arc<Self>, frame: Frame) -> bool {
        let channel = frame.channel();
        if channel == CONTROL_CHANNEL {
            return match frame {
                Frame::Heartbeat => true,
                Frame::Method { method, .. } if method.is_connection_class() => {
                    self.handle_control(method).await
                }
                other => {
                    self.violation(ShutdownReason::protocol_violation(
                        UNEXPECTED_FRAME,
                        format!("{} on channel 0", other.describe()),
                        ShutdownSource::StateMachine,
                    ));
                    true
                }
            };
        }

        if self.state() != ConnectionState::Open {
            trace!(channel, frame = %frame.describe(), "Discarding frame while closing");
            return true;
        }
        let Some(inner) = self.channels.lock().get(channel) else {
            self.violation(ShutdownReason::unknown_channel(channel));
            return true;
        };

        match inner.handle_frame(frame) {
            Routed::Handled => {}
            Routed::Reply(method) => {
                let _ = self.submit(vec![Frame::method(channel, method)]);
            }
            Routed::Finished { reply, teardown } => {
                if let Some(method) = reply {
                    let _ = self.submit(vec![Frame::method(channel, method)]);
                }
                self.release_channel(channel);
                teardown.complete();
            }
            Routed::Violation(reason) => self.violation(reason),
        }
        true
    }

    async fn handle_control(self: &Arc<Self>, method: Method) -> bool {
        match method {
            Method::ConnectionClose {
                reply_code,
                ref reply_text,
                ..
            } => {
                let reason = ShutdownReason::peer(reply_code, reply_text.clone(), method.close_cause());
                info!(%reason, "Connection closed by broker");
                // Already closing if both sides closed at once; answer either way.
                self.begin_closing(reason);
                let _ = self.send_control(Frame::method(CONTROL_CHANNEL, Method::ConnectionCloseOk));
                self.finish().await;
                false
            }
            Method::ConnectionCloseOk => {
                if self.state() == ConnectionState::Closing {
                    self.finish().await;
                    return false;
                }
                warn!("Unsolicited connection.close-ok");
                true
            }
            Method::ConnectionBlocked { reason } => {
                if self.gate.block(reason.clone()) {
                    info!(%reason, "Connection blocked by broker");
                    self.events.dispatch(&ConnectionEvent::Blocked { reason });
                }
                true
            }
            Method::ConnectionUnblocked => {
                match self.gate.unblock(&self.outlet) {
                    Ok(Some(flushed)) => {
                        info!(flushed, "Connection unblocked");
                        self.events.dispatch(&ConnectionEvent::Unblocked);
                    }
                    Ok(None) => {}
                    Err(e) => debug!(error = %e, "Writer gone while flushing held writes"),
                }
                true
            }
            Method::ConnectionUpdateSecretOk => {
                match self.control.lock().take() {
                    Some(pending) => {
                        let _ = pending.send(Ok(()));
                    }
                    None => debug!("Dropping update-secret-ok with no waiting caller"),
                }
                true
            }
            other => {
                self.violation(ShutdownReason::protocol_violation(
                    COMMAND_INVALID,
                    format!("unexpected {} on an open connection", other.name()),
                    ShutdownSource::StateMachine,
                ));
                true
            }
        }
    }
}

/// Drain the transport's read half into [`Shared::dispatch`].
async fn run_reader(shared: Arc<Shared>, mut reader: Box<dyn FrameReader>) {
    let mut closed = shared.subscribe_closed();
    loop {
        let next = tokio::select! {
            biased;
            _ = closed.wait_for(Option::is_some) => break,
            next = reader.read_frame() => next,
        };
        match next {
            Ok(Some(frame)) => {
                shared.heartbeat.mark_received();
                shared.metrics.frames_received_total.increment(1);
                trace!(channel = frame.channel(), frame = %frame.describe(), "Received frame");
                if !shared.dispatch(frame).await {
                    break;
                }
            }
            Ok(None) => {
                shared
                    .fail(ShutdownReason::transport(
                        ShutdownSource::Transport,
                        "connection closed by peer",
                    ))
                    .await;
                break;
            }
            Err(e) => {
                shared
                    .fail(ShutdownReason::transport(
                        ShutdownSource::Transport,
                        format!("read failed: {e}"),
                    ))
                    .await;
                break;
            }
        }
    }
    debug!("Reader stopped");
}

/// A connection to a broker.
///
/// Cloning is cheap; all clones share one connection. Dropping the handles does not close
/// it: call [`Connection::close`] or one of its variants.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.shared.endpoint)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Connect to the first endpoint that accepts and completes the handshake.
    pub async fn open(
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
        negotiator: Arc<dyn Negotiator>,
    ) -> Result<Self> {
        Self::open_with_events(Arc::new(config), connector, negotiator, EventDispatcher::new())
            .await
    }

    /// Like [`Connection::open`], delivering events through an existing dispatcher.
    pub async fn open_with_events(
        config: Arc<ConnectionConfig>,
        connector: Arc<dyn Connector>,
        negotiator: Arc<dyn Negotiator>,
        events: Arc<EventDispatcher>,
    ) -> Result<Self> {
        config.validate()?;

        let mut last = None;
        for endpoint in &config.endpoints {
            match Self::connect_to(&config, endpoint, connector.as_ref(), negotiator.as_ref(), &events)
                .await
            {
                Ok(connection) => return Ok(connection),
                Err(e) => {
                    warn!(%endpoint, error = %e, "Connect attempt failed");
                    last = Some(e);
                }
            }
        }
        let Some(last) = last else {
            return Err(ConfigError::NoEndpoints.into());
        };
        Err(ConnectionError::ConnectFailed {
            attempts: config.endpoints.len(),
            last: Box::new(last),
        })
    }

    async fn connect_to(
        config: &Arc<ConnectionConfig>,
        endpoint: &Endpoint,
        connector: &dyn Connector,
        negotiator: &dyn Negotiator,
        events: &Arc<EventDispatcher>,
    ) -> Result<Self> {
        let span = info_span!(
            "connection",
            %endpoint,
            name = config.connection_name.as_deref().unwrap_or_default()
        );

        let handshake = async {
            debug!("Connecting");
            let mut transport = connector.connect(endpoint).await?;
            let negotiated = negotiator
                .negotiate(
                    &mut transport,
                    config.requested_tuning(),
                    client_properties(config),
                    &config.virtual_host,
                )
                .await?;
            Ok::<_, HandshakeError>((transport, negotiated))
        };
        let (transport, negotiated) = tokio::time::timeout(config.handshake_timeout, handshake)
            .instrument(span.clone())
            .await
            .map_err(|_| HandshakeError::Timeout)??;

        let connection = Self::start(
            config.clone(),
            endpoint.clone(),
            transport,
            negotiated,
            events.clone(),
            span.clone(),
        );
        span.in_scope(|| {
            info!(
                channel_max = connection.channel_max(),
                frame_max = connection.frame_max(),
                heartbeat = connection.heartbeat().as_secs(),
                "Connection open"
            )
        });
        Ok(connection)
    }

    /// Take over a negotiated transport and spawn the connection's tasks.
    fn start(
        config: Arc<ConnectionConfig>,
        endpoint: Endpoint,
        transport: FramedTransport,
        negotiated: Negotiated,
        events: Arc<EventDispatcher>,
        span: Span,
    ) -> Self {
        let FramedTransport { reader, writer } = transport;
        let tuning = negotiated.tuning;
        let channel_max = match tuning.channel_max {
            0 => MAX_CHANNELS_CEILING,
            n => n,
        };
        let heartbeat = Arc::new(HeartbeatMonitor::new(Duration::from_secs(
            tuning.heartbeat.into(),
        )));
        let (outlet, outbound) = Outlet::new();
        let (closed, _) = watch::channel(None);
        let metrics = ConnectionMetrics::default();

        let shared = Arc::new(Shared {
            config,
            endpoint,
            negotiated,
            channel_max,
            lifecycle: Mutex::new(Lifecycle {
                state: ConnectionState::Open,
                close_reason: None,
            }),
            channels: Mutex::new(ChannelTable::new(channel_max)),
            outlet,
            gate: FlowGate::default(),
            heartbeat: heartbeat.clone(),
            events,
            control: Mutex::new(None),
            control_lock: tokio::sync::Mutex::new(()),
            closed,
            report: Mutex::new(Vec::new()),
            close_error: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            metrics: metrics.clone(),
        });

        let writer_task = tokio::spawn({
            let shared = shared.clone();
            async move {
                if let Some(e) = run_writer(writer, outbound, heartbeat, metrics).await {
                    let reason = ShutdownReason::transport(
                        ShutdownSource::Transport,
                        format!("write failed: {e}"),
                    );
                    if shared.state() == ConnectionState::Closing {
                        shared.set_close_error(e);
                    }
                    shared.fail(reason).await;
                }
            }
            .instrument(span.clone())
        });
        tokio::spawn(run_reader(shared.clone(), reader).instrument(span.clone()));

        let mut tasks = vec![writer_task.abort_handle()];
        if shared.heartbeat.is_enabled() {
            let heartbeat_task = tokio::spawn({
                let shared = shared.clone();
                async move {
                    if let Some(silence) = heartbeat::run(&shared.heartbeat, &shared.outlet).await {
                        shared.metrics.heartbeats_missed_total.increment(1);
                        let reason = ShutdownReason::transport(
                            ShutdownSource::Heartbeat,
                            format!(
                                "missed heartbeats from server, timeout: {}s",
                                silence.as_secs()
                            ),
                        );
                        shared.fail(reason).await;
                    }
                }
                .instrument(span)
            });
            tasks.push(heartbeat_task.abort_handle());
        }
        shared.tasks.lock().extend(tasks);

        Self { shared }
    }

    /// Open a channel on the lowest free number.
    pub async fn create_channel(&self) -> Result<Channel> {
        self.open_channel(None).await
    }

    /// Open a channel, on a specific number if given.
    ///
    /// Waits for the broker's `channel.open-ok`.
    pub async fn open_channel(&self, id: Option<ChannelId>) -> Result<Channel> {
        let inner = self.shared.allocate_channel(id)?;
        let channel = Channel::new(inner, self.shared.clone());
        if let Err(e) = channel.open().await {
            debug!(channel = channel.id(), error = %e, "Channel open failed");
            channel.abandon();
            return Err(e);
        }
        self.shared.metrics.channels_opened_total.increment(1);
        debug!(channel = channel.id(), "Channel open");
        Ok(channel)
    }

    /// Handle to an existing channel.
    pub fn channel(&self, id: ChannelId) -> Option<Channel> {
        self.shared
            .channels
            .lock()
            .get(id)
            .map(|inner| Channel::new(inner, self.shared.clone()))
    }

    /// Refresh the credentials of an open connection.
    pub async fn update_secret(&self, new_secret: impl Into<Bytes>, reason: &str) -> Result<()> {
        self.shared.ensure_open()?;
        if !self.shared.negotiated.supports_secret_update {
            return Err(ConnectionError::Unsupported(format!(
                "mechanism {} cannot update its secret",
                self.shared.negotiated.mechanism
            )));
        }

        let _guard = self.shared.control_lock.lock().await;
        let (tx, rx) = oneshot::channel();
        *self.shared.control.lock() = Some(tx);
        // Closing may have started before the slot was set.
        if let Err(e) = self.shared.ensure_open() {
            self.shared.control.lock().take();
            return Err(e);
        }

        let update = Method::ConnectionUpdateSecret {
            new_secret: new_secret.into(),
            reason: reason.to_string(),
        };
        if let Err(e) = self.shared.send_control(Frame::method(CONTROL_CHANNEL, update)) {
            self.shared.control.lock().take();
            return Err(e.into());
        }

        let timeout = self.shared.rpc_timeout();
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => self.shared.ensure_open(),
            Err(_) => {
                self.shared.control.lock().take();
                Err(ConnectionError::RpcTimeout {
                    method: "connection.update-secret",
                    timeout,
                })
            }
        }
    }

    /// Close normally, waiting as long as the handshake takes.
    pub async fn close(&self) -> Result<()> {
        self.close_with(REPLY_SUCCESS, "OK", None).await
    }

    /// Close normally, forcing the transport closed if the broker does not answer in time.
    pub async fn close_with_timeout(&self, timeout: Duration) -> Result<()> {
        self.close_with(REPLY_SUCCESS, "OK", Some(timeout)).await
    }

    /// Close with a specific reply code and text.
    pub async fn close_with(
        &self,
        reply_code: u16,
        reply_text: &str,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let reason = ShutdownReason::application(reply_code, reply_text);
        shutdown::close(&self.shared, reason, timeout, CloseMode::Close).await
    }

    /// Close without surfacing I/O errors hit while closing.
    pub async fn abort(&self) -> Result<()> {
        self.abort_with_timeout(None).await
    }

    /// Abort, waiting at most `timeout` for close-ok (without limit if `None`).
    pub async fn abort_with_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        shutdown::close(&self.shared, ShutdownReason::normal(), timeout, CloseMode::Abort).await
    }

    /// Resolves with the shutdown reason once the connection is closed.
    pub async fn closed(&self) -> ShutdownReason {
        let mut closed = self.shared.subscribe_closed();
        let reason = closed.wait_for(Option::is_some).await.ok().and_then(|r| r.clone());
        reason
            .or_else(|| self.shared.close_reason())
            .unwrap_or_else(ShutdownReason::normal)
    }

    /// Register a lifecycle listener.
    ///
    /// A shutdown listener registered after the connection closed fires immediately with the
    /// recorded reason.
    pub fn add_listener<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&ConnectionEvent) -> std::result::Result<(), ListenerError> + Send + Sync + 'static,
    {
        if kind != EventKind::Shutdown {
            return self.shared.events.add_listener(kind, listener);
        }

        let listener: Listener = Arc::new(listener);
        let lifecycle = self.shared.lifecycle.lock();
        let id = self.shared.events.register(kind, listener.clone());
        if lifecycle.state != ConnectionState::Closed {
            return id;
        }
        let reason = lifecycle
            .close_reason
            .clone()
            .unwrap_or_else(ShutdownReason::normal);
        drop(lifecycle);

        self.shared
            .events
            .deliver_to(&listener, &ConnectionEvent::Shutdown(reason));
        id
    }

    pub fn on_shutdown<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ConnectionEvent) -> std::result::Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.add_listener(EventKind::Shutdown, listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.shared.events.remove_listener(id)
    }

    pub fn events(&self) -> &Arc<EventDispatcher> {
        &self.shared.events
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Why the connection left `Open`. `None` while open.
    pub fn close_reason(&self) -> Option<ShutdownReason> {
        self.shared.close_reason()
    }

    /// Secondary errors recorded while shutting down, in order.
    pub fn shutdown_report(&self) -> Vec<ShutdownReportEntry> {
        self.shared.report.lock().clone()
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.shared.endpoint
    }

    pub fn name(&self) -> Option<&str> {
        self.shared.config.connection_name.as_deref()
    }

    pub fn config(&self) -> &Arc<ConnectionConfig> {
        &self.shared.config
    }

    /// Highest usable channel number.
    pub fn channel_max(&self) -> ChannelId {
        self.shared.channel_max
    }

    pub fn frame_max(&self) -> u32 {
        self.shared.frame_max()
    }

    /// Negotiated heartbeat interval; zero when disabled.
    pub fn heartbeat(&self) -> Duration {
        self.shared.heartbeat.interval()
    }

    pub fn server_properties(&self) -> &FieldTable {
        &self.shared.negotiated.server_properties
    }

    pub fn mechanism(&self) -> &str {
        &self.shared.negotiated.mechanism
    }

    /// Numbers of channels currently allocated, in order.
    pub fn channel_ids(&self) -> Vec<ChannelId> {
        self.shared.channels.lock().ids()
    }

    pub fn open_channel_count(&self) -> usize {
        self.shared.channels.lock().len()
    }

    pub fn is_blocked(&self) -> bool {
        self.shared.gate.is_blocked()
    }

    pub fn blocked_reason(&self) -> Option<String> {
        self.shared.gate.blocked_reason()
    }
}

/// Properties announced in `connection.start-ok`.
pub fn client_properties(config: &ConnectionConfig) -> FieldTable {
    let capabilities = FieldTable::new()
        .with("publisher_confirms", true)
        .with("exchange_exchange_bindings", true)
        .with("basic.nack", true)
        .with("consumer_cancel_notify", true)
        .with("connection.blocked", true)
        .with("authentication_failure_close", true);

    let mut properties = FieldTable::new()
        .with("product", PRODUCT)
        .with("version", env!("CARGO_PKG_VERSION"))
        .with("platform", "Rust")
        .with("capabilities", capabilities);
    if let Some(name) = &config.connection_name {
        properties.insert("connection_name", name.as_str());
    }
    properties
}
