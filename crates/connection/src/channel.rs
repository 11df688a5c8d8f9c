//! Channels multiplexed over a connection.
//!
//! Each channel carries at most one synchronous request at a time. The caller parks a
//! single-slot continuation ([`PendingRpc`]) before sending and the read path resolves it when
//! the matching reply arrives. Every continuation carries a tag so a reply that arrives after
//! the caller gave up is recognised and dropped instead of resolving a later request.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll},
};

use bytes::{Bytes, BytesMut};
use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};
use warren_primitives::{
    ChannelId, ClassMethod, ConsumeOptions, ExchangeDeclareOptions, FieldTable, Frame, Method,
    QueueDeclareOptions, ShutdownReason, ShutdownSource,
    constants::{COMMAND_INVALID, FRAME_ERROR, REPLY_SUCCESS, UNEXPECTED_FRAME},
};

use crate::{
    config::max_body_chunk,
    connection::Shared,
    error::{ConnectionError, Result},
    events::{ListenerError, panic_message},
};

const BASIC_CLASS: u16 = 60;

/// Channel lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Open,
    /// `channel.close` sent, waiting for `channel.close-ok`.
    Closing,
    Closed,
}

/// Lifecycle plus close reason, kept consistent: a reason is recorded exactly when the
/// channel is closed.
#[derive(Debug)]
pub(crate) struct ChannelStatus {
    state: ChannelState,
    closing: Option<ShutdownReason>,
    close_reason: Option<ShutdownReason>,
}

impl ChannelStatus {
    pub(crate) fn new() -> Self {
        Self {
            state: ChannelState::Open,
            closing: None,
            close_reason: None,
        }
    }

    pub(crate) fn state(&self) -> ChannelState {
        self.state
    }

    pub(crate) fn close_reason(&self) -> Option<&ShutdownReason> {
        self.close_reason.as_ref()
    }

    /// Reason passed to [`ChannelStatus::begin_close`], while closing.
    pub(crate) fn closing_reason(&self) -> Option<&ShutdownReason> {
        self.closing.as_ref()
    }

    /// Open -> Closing. Returns false in any other state.
    pub(crate) fn begin_close(&mut self, reason: ShutdownReason) -> bool {
        if self.state != ChannelState::Open {
            return false;
        }
        self.state = ChannelState::Closing;
        self.closing = Some(reason);
        true
    }

    /// Any state -> Closed. Returns false if already closed.
    pub(crate) fn mark_closed(&mut self, reason: ShutdownReason) -> bool {
        if self.state == ChannelState::Closed {
            return false;
        }
        self.state = ChannelState::Closed;
        self.closing = None;
        self.close_reason = Some(reason);
        true
    }
}

/// A message delivered to a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub channel: ChannelId,
    pub consumer_tag: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    /// Encoded content properties, as produced by the codec.
    pub properties: Bytes,
    pub body: Bytes,
}

/// Where a consumer's deliveries are sent. Cloning lets a sink survive channel replacement.
pub type DeliverySink = mpsc::UnboundedSender<Delivery>;

/// Create a sink and the receiver half a [`Consumer`] reads from.
pub fn delivery_channel() -> (DeliverySink, mpsc::UnboundedReceiver<Delivery>) {
    mpsc::unbounded_channel()
}

/// Stream of deliveries for one consumer.
///
/// The stream ends once every sink for it is gone: the consumer was cancelled, its channel
/// closed, or the connection shut down.
#[derive(Debug)]
pub struct Consumer {
    tag: String,
    channel: ChannelId,
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl Consumer {
    pub fn new(tag: String, channel: ChannelId, rx: mpsc::UnboundedReceiver<Delivery>) -> Self {
        Self { tag, channel, rx }
    }

    /// Consumer tag at registration time.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel
    }

    pub async fn next_delivery(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }
}

impl Stream for Consumer {
    type Item = Delivery;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Result of `queue.declare`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDeclareOk {
    /// Actual queue name. Differs from the request for server-named queues.
    pub queue: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Flags for `basic.publish`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PublishOptions {
    pub mandatory: bool,
    pub immediate: bool,
}

/// Callback run once when a channel closes.
pub type ChannelListener =
    Arc<dyn Fn(ChannelId, &ShutdownReason) -> Result<(), ListenerError> + Send + Sync>;

/// The single in-flight synchronous request of a channel.
struct PendingRpc {
    tag: u64,
    request: &'static str,
    expected: ClassMethod,
    reply: oneshot::Sender<Result<Method>>,
    /// Sink registered atomically with `basic.consume-ok`, before any delivery is routed.
    consumer: Option<DeliverySink>,
}

/// A delivery whose content frames are still arriving.
struct IncomingContent {
    delivery: Delivery,
    body_size: Option<u64>,
    body: BytesMut,
}

struct ChannelCore {
    status: ChannelStatus,
    pending: Option<PendingRpc>,
    /// Replies still owed to callers that gave up waiting, in request order.
    stale: VecDeque<ClassMethod>,
    consumers: HashMap<String, DeliverySink>,
    incoming: Option<IncomingContent>,
    close_listeners: Vec<ChannelListener>,
}

/// What the read path must do after routing a frame to a channel.
#[derive(Debug)]
pub(crate) enum Routed {
    Handled,
    /// Send this method back on the channel.
    Reply(Method),
    /// The channel reached `Closed`; optionally reply, then release its number.
    Finished {
        reply: Option<Method>,
        teardown: Teardown,
    },
    /// The frame breaks the protocol; the connection must close.
    Violation(ShutdownReason),
}

/// Side effects of closing a channel, run after the channel lock is released.
pub(crate) struct Teardown {
    channel: ChannelId,
    reason: ShutdownReason,
    connection_wide: bool,
    /// Our own close was acknowledged with `channel.close-ok`.
    acknowledged: bool,
    pending: Option<PendingRpc>,
    listeners: Vec<ChannelListener>,
}

impl std::fmt::Debug for Teardown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Teardown")
            .field("channel", &self.channel)
            .field("reason", &self.reason)
            .field("connection_wide", &self.connection_wide)
            .field("acknowledged", &self.acknowledged)
            .finish_non_exhaustive()
    }
}

impl Teardown {
    pub(crate) fn channel(&self) -> ChannelId {
        self.channel
    }

    /// Fail the pending request and run close listeners. Returns listener failures.
    pub(crate) fn complete(self) -> Vec<String> {
        if let Some(pending) = self.pending {
            let reply = if self.acknowledged
                && pending.expected == Method::ChannelCloseOk.class_method()
            {
                Ok(Method::ChannelCloseOk)
            } else if self.connection_wide {
                Err(ConnectionError::NotOpen(self.reason.clone()))
            } else {
                Err(ConnectionError::ChannelClosed {
                    channel: self.channel,
                    reason: self.reason.clone(),
                })
            };
            let _ = pending.reply.send(reply);
        }

        let mut failures = Vec::new();
        for listener in &self.listeners {
            if let Err(error) = run_listener(listener, self.channel, &self.reason) {
                warn!(channel = self.channel, %error, "Channel close listener failed");
                failures.push(error);
            }
        }
        failures
    }
}

fn run_listener(
    listener: &ChannelListener,
    channel: ChannelId,
    reason: &ShutdownReason,
) -> std::result::Result<(), String> {
    match catch_unwind(AssertUnwindSafe(|| listener(channel, reason))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(panic) => Err(panic_message(panic.as_ref())),
    }
}

impl ChannelCore {
    fn close(&mut self, channel: ChannelId, reason: ShutdownReason, connection_wide: bool) -> Teardown {
        self.status.mark_closed(reason.clone());
        self.consumers.clear();
        self.incoming = None;
        Teardown {
            channel,
            reason,
            connection_wide,
            acknowledged: false,
            pending: self.pending.take(),
            listeners: std::mem::take(&mut self.close_listeners),
        }
    }
}

/// Channel state shared between the application handle and the read path.
pub(crate) struct ChannelInner {
    id: ChannelId,
    core: Mutex<ChannelCore>,
    rpc_lock: tokio::sync::Mutex<()>,
    next_tag: AtomicU64,
}

impl fmt::Debug for ChannelInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelInner")
            .field("id", &self.id)
            .field("state", &self.core.lock().status.state())
            .finish_non_exhaustive()
    }
}

impl ChannelInner {
    pub(crate) fn new(id: ChannelId) -> Arc<Self> {
        Arc::new(Self {
            id,
            core: Mutex::new(ChannelCore {
                status: ChannelStatus::new(),
                pending: None,
                stale: VecDeque::new(),
                consumers: HashMap::new(),
                incoming: None,
                close_listeners: Vec::new(),
            }),
            rpc_lock: tokio::sync::Mutex::new(()),
            next_tag: AtomicU64::new(1),
        })
    }

    pub(crate) fn id(&self) -> ChannelId {
        self.id
    }

    pub(crate) fn state(&self) -> ChannelState {
        self.core.lock().status.state()
    }

    pub(crate) fn close_reason(&self) -> Option<ShutdownReason> {
        self.core.lock().status.close_reason().cloned()
    }

    /// Park a continuation for `expected`. Fails with the close reason if the channel is not open.
    fn begin_rpc(
        &self,
        request: &'static str,
        expected: ClassMethod,
        consumer: Option<DeliverySink>,
    ) -> std::result::Result<(u64, oneshot::Receiver<Result<Method>>), Option<ShutdownReason>> {
        let mut core = self.core.lock();
        if core.status.state() != ChannelState::Open {
            let reason = core.status.close_reason().or(core.status.closing_reason());
            return Err(reason.cloned());
        }
        // A caller that was cancelled mid-request still has a reply on the way.
        if let Some(abandoned) = core.pending.take() {
            core.stale.push_back(abandoned.expected);
        }
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();
        core.pending = Some(PendingRpc {
            tag,
            request,
            expected,
            reply,
            consumer,
        });
        Ok((tag, rx))
    }

    /// Drop the continuation if it still belongs to request `tag`.
    fn clear_pending(&self, tag: u64) -> bool {
        self.core.lock().pending.take_if(|p| p.tag == tag).is_some()
    }

    /// Give up on request `tag` whose reply may still arrive. That reply is discarded.
    fn abandon_pending(&self, tag: u64) -> bool {
        let mut core = self.core.lock();
        let Some(abandoned) = core.pending.take_if(|p| p.tag == tag) else {
            return false;
        };
        core.stale.push_back(abandoned.expected);
        true
    }

    /// Start the local close handshake and park a continuation for `channel.close-ok`.
    fn begin_close(
        &self,
        reason: ShutdownReason,
    ) -> Option<(u64, oneshot::Receiver<Result<Method>>)> {
        let mut core = self.core.lock();
        if !core.status.begin_close(reason) {
            return None;
        }
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();
        core.pending = Some(PendingRpc {
            tag,
            request: "channel.close",
            expected: Method::ChannelCloseOk.class_method(),
            reply,
            consumer: None,
        });
        Some((tag, rx))
    }

    /// Close without a handshake because the whole connection is going away.
    pub(crate) fn force_close(&self, reason: ShutdownReason) -> Option<Teardown> {
        let mut core = self.core.lock();
        if core.status.state() == ChannelState::Closed {
            return None;
        }
        Some(core.close(self.id, reason, true))
    }

    fn add_close_listener(&self, listener: ChannelListener) -> Option<ShutdownReason> {
        let mut core = self.core.lock();
        match core.status.close_reason() {
            Some(reason) => Some(reason.clone()),
            None => {
                core.close_listeners.push(listener);
                None
            }
        }
    }

    /// Route an inbound frame. Runs on the read path only.
    pub(crate) fn handle_frame(&self, frame: Frame) -> Routed {
        let mut core = self.core.lock();
        match core.status.state() {
            ChannelState::Open => {}
            ChannelState::Closing => return self.handle_while_closing(&mut core, frame),
            ChannelState::Closed => return Routed::Violation(ShutdownReason::unknown_channel(self.id)),
        }

        match frame {
            Frame::Method { method, .. } => self.handle_method(&mut core, method),
            Frame::Header {
                class_id,
                body_size,
                properties,
                ..
            } => self.handle_header(&mut core, class_id, body_size, properties),
            Frame::Body { payload, .. } => self.handle_body(&mut core, payload),
            Frame::Heartbeat => Routed::Handled,
        }
    }

    fn handle_method(&self, core: &mut ChannelCore, method: Method) -> Routed {
        if core.incoming.is_some() {
            return self.violation(
                UNEXPECTED_FRAME,
                format!("{} received while content was expected", method.name()),
            );
        }

        match method {
            Method::ChannelClose {
                reply_code,
                ref reply_text,
                ..
            } => {
                let reason =
                    ShutdownReason::peer(reply_code, reply_text.clone(), method.close_cause())
                        .with_channel(self.id);
                debug!(channel = self.id, %reason, "Channel closed by peer");
                Routed::Finished {
                    reply: Some(Method::ChannelCloseOk),
                    teardown: core.close(self.id, reason, false),
                }
            }
            Method::ChannelFlow { active } => {
                debug!(channel = self.id, active, "Channel flow");
                Routed::Reply(Method::ChannelFlowOk { active })
            }
            Method::BasicDeliver {
                consumer_tag,
                delivery_tag,
                redelivered,
                exchange,
                routing_key,
            } => {
                core.incoming = Some(IncomingContent {
                    delivery: Delivery {
                        channel: self.id,
                        consumer_tag,
                        delivery_tag,
                        redelivered,
                        exchange,
                        routing_key,
                        properties: Bytes::new(),
                        body: Bytes::new(),
                    },
                    body_size: None,
                    body: BytesMut::new(),
                });
                Routed::Handled
            }
            Method::BasicCancel { consumer_tag } => {
                debug!(channel = self.id, %consumer_tag, "Consumer cancelled by broker");
                core.consumers.remove(&consumer_tag);
                Routed::Handled
            }
            Method::BasicAck { .. } | Method::BasicNack { .. } | Method::BasicReject { .. } => {
                trace!(channel = self.id, method = method.name(), "Ignoring confirm");
                Routed::Handled
            }
            reply => self.resolve(core, reply),
        }
    }

    fn resolve(&self, core: &mut ChannelCore, reply: Method) -> Routed {
        let id = reply.class_method();
        if core.stale.front() == Some(&id) {
            core.stale.pop_front();
            debug!(channel = self.id, method = reply.name(), "Dropping late reply to a timed-out request");
            return Routed::Handled;
        }
        let Some(pending) = core.pending.take_if(|p| p.expected == id) else {
            if let Some(pending) = &core.pending {
                return self.violation(
                    COMMAND_INVALID,
                    format!("{} does not answer {}", reply.name(), pending.request),
                );
            }
            debug!(channel = self.id, method = reply.name(), "Dropping reply with no waiting caller");
            return Routed::Handled;
        };

        match (&reply, pending.consumer) {
            (Method::BasicConsumeOk { consumer_tag }, Some(sink)) => {
                core.consumers.insert(consumer_tag.clone(), sink);
            }
            (Method::BasicCancelOk { consumer_tag }, _) => {
                core.consumers.remove(consumer_tag);
            }
            _ => {}
        }
        let _ = pending.reply.send(Ok(reply));
        Routed::Handled
    }

    fn handle_header(
        &self,
        core: &mut ChannelCore,
        class_id: u16,
        body_size: u64,
        properties: Bytes,
    ) -> Routed {
        let Some(incoming) = core.incoming.as_mut().filter(|c| c.body_size.is_none()) else {
            return self.violation(UNEXPECTED_FRAME, "content header without a delivery");
        };
        if class_id != BASIC_CLASS {
            return self.violation(
                UNEXPECTED_FRAME,
                format!("content header for class {class_id}"),
            );
        }
        incoming.body_size = Some(body_size);
        incoming.delivery.properties = properties;
        if body_size == 0 {
            self.complete_delivery(core);
        }
        Routed::Handled
    }

    fn handle_body(&self, core: &mut ChannelCore, payload: Bytes) -> Routed {
        let Some(incoming) = core.incoming.as_mut() else {
            return self.violation(UNEXPECTED_FRAME, "content body without a delivery");
        };
        let Some(body_size) = incoming.body_size else {
            return self.violation(UNEXPECTED_FRAME, "content body before content header");
        };
        incoming.body.extend_from_slice(&payload);
        let received = incoming.body.len() as u64;
        if received > body_size {
            return self.violation(
                FRAME_ERROR,
                format!("content body of {received} bytes exceeds declared {body_size}"),
            );
        }
        if received == body_size {
            self.complete_delivery(core);
        }
        Routed::Handled
    }

    fn complete_delivery(&self, core: &mut ChannelCore) {
        let Some(IncomingContent {
            mut delivery, body, ..
        }) = core.incoming.take()
        else {
            return;
        };
        delivery.body = body.freeze();
        let tag = delivery.consumer_tag.clone();
        match core.consumers.get(&tag) {
            Some(sink) => {
                if sink.send(delivery).is_err() {
                    debug!(channel = self.id, consumer_tag = %tag, "Consumer dropped; forgetting it");
                    core.consumers.remove(&tag);
                }
            }
            None => debug!(channel = self.id, consumer_tag = %tag, "Delivery for unknown consumer"),
        }
    }

    fn handle_while_closing(&self, core: &mut ChannelCore, frame: Frame) -> Routed {
        match frame {
            Frame::Method {
                method: Method::ChannelCloseOk,
                ..
            } => {
                let reason = core
                    .status
                    .closing_reason()
                    .cloned()
                    .unwrap_or_else(|| ShutdownReason::normal().with_channel(self.id));
                // The caller is answered from the teardown, after the number is released.
                let mut teardown = core.close(self.id, reason, false);
                teardown.acknowledged = true;
                Routed::Finished {
                    reply: None,
                    teardown,
                }
            }
            Frame::Method {
                method:
                    Method::ChannelClose {
                        reply_code,
                        reply_text,
                        class_id,
                        method_id,
                    },
                ..
            } => {
                // Both sides closed at once; the peer's reason wins.
                let cause = (class_id != 0).then_some((class_id, method_id));
                let reason =
                    ShutdownReason::peer(reply_code, reply_text, cause).with_channel(self.id);
                Routed::Finished {
                    reply: Some(Method::ChannelCloseOk),
                    teardown: core.close(self.id, reason, false),
                }
            }
            other => {
                trace!(channel = self.id, frame = %other.describe(), "Discarding frame on closing channel");
                Routed::Handled
            }
        }
    }

    fn violation(&self, code: u16, text: impl Into<String>) -> Routed {
        Routed::Violation(
            ShutdownReason::protocol_violation(code, text, ShutdownSource::Multiplexer)
                .with_channel(self.id),
        )
    }
}

/// Application handle to an open channel.
///
/// Cloning is cheap; all clones refer to the same channel. Requests on one channel are
/// serialized internally, so a handle may be shared between tasks.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
    conn: Arc<Shared>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Channel {
    pub(crate) fn new(inner: Arc<ChannelInner>, conn: Arc<Shared>) -> Self {
        Self { inner, conn }
    }

    pub fn id(&self) -> ChannelId {
        self.inner.id
    }

    pub fn state(&self) -> ChannelState {
        self.inner.state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// Why the channel closed, once it has.
    pub fn close_reason(&self) -> Option<ShutdownReason> {
        self.inner.close_reason()
    }

    /// Register a callback for when this channel closes. Runs immediately if it already has.
    pub fn on_close<F>(&self, listener: F)
    where
        F: Fn(ChannelId, &ShutdownReason) -> std::result::Result<(), ListenerError>
            + Send
            + Sync
            + 'static,
    {
        let listener: ChannelListener = Arc::new(listener);
        if let Some(reason) = self.inner.add_close_listener(listener.clone()) {
            if let Err(error) = run_listener(&listener, self.id(), &reason) {
                warn!(channel = self.id(), %error, "Channel close listener failed");
            }
        }
    }

    /// Error for an operation on a channel that is no longer open.
    fn closed_error(&self, reason: Option<ShutdownReason>) -> ConnectionError {
        if let Some(reason) = self.conn.close_reason() {
            return ConnectionError::NotOpen(reason);
        }
        ConnectionError::ChannelClosed {
            channel: self.id(),
            reason: reason
                .unwrap_or_else(|| ShutdownReason::application(REPLY_SUCCESS, "closing").with_channel(self.id())),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        match self.inner.state() {
            ChannelState::Open => Ok(()),
            _ => Err(self.closed_error(self.inner.close_reason())),
        }
    }

    /// Send a synchronous request and wait for its reply.
    async fn call(&self, method: Method, consumer: Option<DeliverySink>) -> Result<Method> {
        let request = method.name();
        let Some(expected) = method.expects_reply() else {
            return Err(ConnectionError::Unsupported(format!(
                "{request} is not a synchronous request"
            )));
        };

        let _guard = self.inner.rpc_lock.lock().await;
        let (tag, rx) = self
            .inner
            .begin_rpc(request, expected, consumer)
            .map_err(|reason| self.closed_error(reason))?;

        trace!(channel = self.id(), request, "Sending request");
        if let Err(e) = self.conn.submit(vec![Frame::method(self.id(), method)]) {
            self.inner.clear_pending(tag);
            return Err(e);
        }

        let timeout = self.conn.rpc_timeout();
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(self.closed_error(self.inner.close_reason())),
            Err(_) => {
                self.inner.abandon_pending(tag);
                warn!(channel = self.id(), request, ?timeout, "Request timed out");
                Err(ConnectionError::RpcTimeout {
                    method: request,
                    timeout,
                })
            }
        }
    }

    /// Open handshake, run once by the connection right after allocation.
    pub(crate) async fn open(&self) -> Result<()> {
        match self.call(Method::ChannelOpen, None).await? {
            Method::ChannelOpenOk => Ok(()),
            other => Err(unexpected("channel.open", &other)),
        }
    }

    /// Close the channel with a normal reply code.
    pub async fn close(&self) -> Result<()> {
        self.close_with(REPLY_SUCCESS, "OK").await
    }

    /// Close the channel. A no-op if it is already closing or closed.
    pub async fn close_with(&self, reply_code: u16, reply_text: &str) -> Result<()> {
        let reason = ShutdownReason::application(reply_code, reply_text).with_channel(self.id());
        let _guard = self.inner.rpc_lock.lock().await;
        let Some((tag, rx)) = self.inner.begin_close(reason) else {
            return Ok(());
        };

        let close = Method::ChannelClose {
            reply_code,
            reply_text: reply_text.to_string(),
            class_id: 0,
            method_id: 0,
        };
        if let Err(e) = self.conn.submit(vec![Frame::method(self.id(), close)]) {
            self.inner.clear_pending(tag);
            return match e {
                ConnectionError::NotOpen(_) => Ok(()),
                e => Err(e),
            };
        }

        let timeout = self.conn.rpc_timeout();
        match tokio::time::timeout(timeout, rx).await {
            // Closed either way, whether by our handshake, the peer or the connection.
            Ok(_) => Ok(()),
            Err(_) => {
                self.inner.clear_pending(tag);
                warn!(channel = self.id(), ?timeout, "No close-ok from broker");
                Err(ConnectionError::RpcTimeout {
                    method: "channel.close",
                    timeout,
                })
            }
        }
    }

    /// Send `channel.close` without waiting, after a failed open.
    pub(crate) fn abandon(&self) {
        let reason = ShutdownReason::application(REPLY_SUCCESS, "open failed").with_channel(self.id());
        if let Some((tag, _)) = self.inner.begin_close(reason) {
            self.inner.clear_pending(tag);
            let close = Method::ChannelClose {
                reply_code: REPLY_SUCCESS,
                reply_text: "open failed".to_string(),
                class_id: 0,
                method_id: 0,
            };
            let _ = self.conn.submit(vec![Frame::method(self.id(), close)]);
        }
    }

    pub async fn exchange_declare(
        &self,
        exchange: &str,
        kind: &str,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<()> {
        let method = Method::ExchangeDeclare {
            exchange: exchange.to_string(),
            kind: kind.to_string(),
            options,
            arguments,
        };
        match self.call(method, None).await? {
            Method::ExchangeDeclareOk => Ok(()),
            other => Err(unexpected("exchange.declare", &other)),
        }
    }

    pub async fn exchange_delete(&self, exchange: &str, if_unused: bool) -> Result<()> {
        let method = Method::ExchangeDelete {
            exchange: exchange.to_string(),
            if_unused,
        };
        match self.call(method, None).await? {
            Method::ExchangeDeleteOk => Ok(()),
            other => Err(unexpected("exchange.delete", &other)),
        }
    }

    /// Bind exchange `destination` to exchange `source`.
    pub async fn exchange_bind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<()> {
        let method = Method::ExchangeBind {
            destination: destination.to_string(),
            source: source.to_string(),
            routing_key: routing_key.to_string(),
            arguments,
        };
        match self.call(method, None).await? {
            Method::ExchangeBindOk => Ok(()),
            other => Err(unexpected("exchange.bind", &other)),
        }
    }

    /// Declare a queue. An empty name asks the broker to generate one.
    pub async fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<QueueDeclareOk> {
        let method = Method::QueueDeclare {
            queue: queue.to_string(),
            options,
            arguments,
        };
        match self.call(method, None).await? {
            Method::QueueDeclareOk {
                queue,
                message_count,
                consumer_count,
            } => Ok(QueueDeclareOk {
                queue,
                message_count,
                consumer_count,
            }),
            other => Err(unexpected("queue.declare", &other)),
        }
    }

    pub async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<()> {
        let method = Method::QueueBind {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            arguments,
        };
        match self.call(method, None).await? {
            Method::QueueBindOk => Ok(()),
            other => Err(unexpected("queue.bind", &other)),
        }
    }

    pub async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<()> {
        let method = Method::QueueUnbind {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            arguments,
        };
        match self.call(method, None).await? {
            Method::QueueUnbindOk => Ok(()),
            other => Err(unexpected("queue.unbind", &other)),
        }
    }

    /// Returns the number of messages purged.
    pub async fn queue_purge(&self, queue: &str) -> Result<u32> {
        let method = Method::QueuePurge {
            queue: queue.to_string(),
        };
        match self.call(method, None).await? {
            Method::QueuePurgeOk { message_count } => Ok(message_count),
            other => Err(unexpected("queue.purge", &other)),
        }
    }

    /// Returns the number of messages deleted with the queue.
    pub async fn queue_delete(&self, queue: &str, if_unused: bool, if_empty: bool) -> Result<u32> {
        let method = Method::QueueDelete {
            queue: queue.to_string(),
            if_unused,
            if_empty,
        };
        match self.call(method, None).await? {
            Method::QueueDeleteOk { message_count } => Ok(message_count),
            other => Err(unexpected("queue.delete", &other)),
        }
    }

    pub async fn basic_qos(&self, prefetch_count: u16, global: bool) -> Result<()> {
        let method = Method::BasicQos {
            prefetch_size: 0,
            prefetch_count,
            global,
        };
        match self.call(method, None).await? {
            Method::BasicQosOk => Ok(()),
            other => Err(unexpected("basic.qos", &other)),
        }
    }

    /// Start a consumer. An empty tag asks the broker to generate one.
    pub async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
        arguments: FieldTable,
    ) -> Result<Consumer> {
        let (sink, rx) = delivery_channel();
        let tag = self
            .basic_consume_with_sink(queue, consumer_tag, options, arguments, sink)
            .await?;
        Ok(Consumer::new(tag, self.id(), rx))
    }

    /// Start a consumer that feeds an existing sink. Returns the consumer tag.
    pub async fn basic_consume_with_sink(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
        arguments: FieldTable,
        sink: DeliverySink,
    ) -> Result<String> {
        let method = Method::BasicConsume {
            queue: queue.to_string(),
            consumer_tag: consumer_tag.to_string(),
            options,
            arguments,
        };
        match self.call(method, Some(sink)).await? {
            Method::BasicConsumeOk { consumer_tag } => Ok(consumer_tag),
            other => Err(unexpected("basic.consume", &other)),
        }
    }

    pub async fn basic_cancel(&self, consumer_tag: &str) -> Result<()> {
        let method = Method::BasicCancel {
            consumer_tag: consumer_tag.to_string(),
        };
        match self.call(method, None).await? {
            Method::BasicCancelOk { .. } => Ok(()),
            other => Err(unexpected("basic.cancel", &other)),
        }
    }

    /// Publish a message.
    ///
    /// The body is split into frames that fit the negotiated frame size. While the broker has
    /// the connection blocked the publish is queued and written once it is unblocked.
    pub fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: PublishOptions,
        properties: Bytes,
        body: Bytes,
    ) -> Result<()> {
        self.ensure_open()?;
        let channel = self.id();
        let mut frames = vec![
            Frame::method(
                channel,
                Method::BasicPublish {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    mandatory: options.mandatory,
                    immediate: options.immediate,
                },
            ),
            Frame::Header {
                channel,
                class_id: BASIC_CLASS,
                body_size: body.len() as u64,
                properties,
            },
        ];
        frames.extend(split_body(channel, body, max_body_chunk(self.conn.frame_max())));
        self.conn.submit(frames)
    }

    pub fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<()> {
        self.send_async(Method::BasicAck {
            delivery_tag,
            multiple,
        })
    }

    pub fn basic_nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<()> {
        self.send_async(Method::BasicNack {
            delivery_tag,
            multiple,
            requeue,
        })
    }

    pub fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.send_async(Method::BasicReject {
            delivery_tag,
            requeue,
        })
    }

    fn send_async(&self, method: Method) -> Result<()> {
        self.ensure_open()?;
        self.conn.submit(vec![Frame::method(self.id(), method)])
    }
}

fn unexpected(request: &'static str, got: &Method) -> ConnectionError {
    ConnectionError::UnexpectedReply {
        request,
        got: got.name(),
    }
}

/// Body frames for `body`, each at most `chunk` bytes. `None` means no size limit.
fn split_body(channel: ChannelId, mut body: Bytes, chunk: Option<usize>) -> Vec<Frame> {
    let mut frames = Vec::new();
    let chunk = chunk.unwrap_or(usize::MAX).max(1);
    while !body.is_empty() {
        let payload = body.split_to(chunk.min(body.len()));
        frames.push(Frame::Body { channel, payload });
    }
    frames
}
