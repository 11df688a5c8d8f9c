//! A scriptable in-memory broker.
//!
//! Each accepted connection gets a [`BrokerSession`] and a task that answers the client the
//! way a well-behaved broker would: handshake, channel lifecycle, topology and consumer RPCs.
//! Tests steer it by ignoring or rejecting methods by name, and drive broker-initiated traffic
//! (blocking, deliveries, closes, resets) through the session handles.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    io,
    sync::Arc,
};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use warren_primitives::{
    CONTROL_CHANNEL, ChannelId, FieldTable, Frame, FramedTransport, Method, Tuning,
    constants::PROTOCOL_VERSION,
};

use crate::transport::{Faults, Inbound, memory_transport};

/// Pseudo method name matching heartbeat frames in [`FakeBroker::ignore`].
pub const HEARTBEAT: &str = "heartbeat";

const BASIC_CLASS: u16 = 60;

#[derive(Debug)]
struct Settings {
    tuning: Tuning,
    mechanisms: String,
    server_properties: FieldTable,
    ignored: HashSet<String>,
    rejected: HashMap<String, (u16, String)>,
}

impl Default for Settings {
    fn default() -> Self {
        let capabilities = FieldTable::new()
            .with("publisher_confirms", true)
            .with("consumer_cancel_notify", true)
            .with("connection.blocked", true)
            .with("authentication_failure_close", true);
        Self {
            tuning: Tuning {
                channel_max: 2047,
                frame_max: 131072,
                heartbeat: 0,
            },
            mechanisms: "PLAIN EXTERNAL".to_string(),
            server_properties: FieldTable::new()
                .with("product", "fake-broker")
                .with("capabilities", capabilities),
            ignored: HashSet::new(),
            rejected: HashMap::new(),
        }
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    sessions: Vec<BrokerSession>,
    next_queue: u64,
    next_tag: u64,
}

#[derive(Debug, Default)]
struct BrokerInner {
    settings: Mutex<Settings>,
    state: Mutex<BrokerState>,
}

/// Shared fake broker. Clones refer to the same broker.
#[derive(Debug, Clone, Default)]
pub struct FakeBroker {
    inner: Arc<BrokerInner>,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tuning proposed in `connection.tune`. Heartbeats are off unless set here.
    pub fn with_tuning(self, tuning: Tuning) -> Self {
        self.inner.settings.lock().tuning = tuning;
        self
    }

    /// Space-separated SASL mechanisms offered in `connection.start`.
    pub fn with_mechanisms(self, mechanisms: &str) -> Self {
        self.inner.settings.lock().mechanisms = mechanisms.to_string();
        self
    }

    /// Stop answering a method (by dotted name, or [`HEARTBEAT`]). It is still recorded.
    pub fn ignore(&self, method: &str) {
        self.inner.settings.lock().ignored.insert(method.to_string());
    }

    pub fn unignore(&self, method: &str) {
        self.inner.settings.lock().ignored.remove(method);
    }

    /// Answer a method with a channel (or, on channel 0, connection) close instead.
    pub fn reject(&self, method: &str, reply_code: u16, reply_text: &str) {
        self.inner
            .settings
            .lock()
            .rejected
            .insert(method.to_string(), (reply_code, reply_text.to_string()));
    }

    pub fn unreject(&self, method: &str) {
        self.inner.settings.lock().rejected.remove(method);
    }

    /// Accept a new client connection and start serving it.
    pub fn accept(&self) -> FramedTransport {
        let (transport, peer) = memory_transport();
        let session = {
            let mut state = self.inner.state.lock();
            let session = BrokerSession::new(state.sessions.len(), peer.tx, peer.faults);
            state.sessions.push(session.clone());
            session
        };
        debug!(session = session.id(), "Accepted connection");
        tokio::spawn(self.clone().serve(session, peer.rx));
        transport
    }

    pub fn session_count(&self) -> usize {
        self.inner.state.lock().sessions.len()
    }

    pub fn session(&self, index: usize) -> Option<BrokerSession> {
        self.inner.state.lock().sessions.get(index).cloned()
    }

    pub fn last_session(&self) -> Option<BrokerSession> {
        self.inner.state.lock().sessions.last().cloned()
    }

    /// How many times a method was received across all sessions.
    pub fn count(&self, method: &str) -> usize {
        self.inner
            .state
            .lock()
            .sessions
            .iter()
            .map(|session| session.count(method))
            .sum()
    }

    fn is_ignored(&self, method: &str) -> bool {
        self.inner.settings.lock().ignored.contains(method)
    }

    fn rejection(&self, method: &str) -> Option<(u16, String)> {
        self.inner.settings.lock().rejected.get(method).cloned()
    }

    fn generate(&self, prefix: &str) -> String {
        let mut state = self.inner.state.lock();
        let counter = match prefix {
            "amq.ctag" => &mut state.next_tag,
            _ => &mut state.next_queue,
        };
        *counter += 1;
        format!("{prefix}-{counter}")
    }

    async fn serve(self, session: BrokerSession, mut rx: mpsc::UnboundedReceiver<Frame>) {
        let start = {
            let settings = self.inner.settings.lock();
            Method::ConnectionStart {
                version_major: PROTOCOL_VERSION.0,
                version_minor: PROTOCOL_VERSION.1,
                server_properties: settings.server_properties.clone(),
                mechanisms: settings.mechanisms.clone(),
                locales: "en_US".to_string(),
            }
        };
        session.send_method(CONTROL_CHANNEL, start);

        while let Some(frame) = rx.recv().await {
            session.record(frame.clone());
            let (channel, method) = match frame {
                Frame::Method { channel, method } => (channel, method),
                Frame::Heartbeat => {
                    if !self.is_ignored(HEARTBEAT) {
                        session.send(Frame::Heartbeat);
                    }
                    continue;
                }
                Frame::Header { .. } | Frame::Body { .. } => continue,
            };

            if self.is_ignored(method.name()) {
                trace!(session = session.id(), channel, method = method.name(), "Ignoring");
                continue;
            }
            if let Some((reply_code, reply_text)) = self.rejection(method.name()) {
                let (class_id, method_id) = method.class_method();
                let close = if channel == CONTROL_CHANNEL {
                    Method::ConnectionClose {
                        reply_code,
                        reply_text,
                        class_id,
                        method_id,
                    }
                } else {
                    session.inner.open_channels.lock().remove(&channel);
                    Method::ChannelClose {
                        reply_code,
                        reply_text,
                        class_id,
                        method_id,
                    }
                };
                session.send_method(channel, close);
                continue;
            }

            let hang_up = matches!(method, Method::ConnectionCloseOk);
            if let Some(reply) = self.reply(&session, channel, method) {
                session.send_method(channel, reply);
            }
            if hang_up {
                session.hang_up();
            }
        }
        debug!(session = session.id(), "Client went away");
    }

    fn reply(&self, session: &BrokerSession, channel: ChannelId, method: Method) -> Option<Method> {
        let reply = match method {
            Method::ConnectionStartOk { .. } => {
                let tuning = self.inner.settings.lock().tuning;
                Method::ConnectionTune {
                    channel_max: tuning.channel_max,
                    frame_max: tuning.frame_max,
                    heartbeat: tuning.heartbeat,
                }
            }
            Method::ConnectionOpen { .. } => Method::ConnectionOpenOk,
            Method::ConnectionClose { .. } => Method::ConnectionCloseOk,
            Method::ConnectionUpdateSecret { .. } => Method::ConnectionUpdateSecretOk,

            Method::ChannelOpen => {
                session.inner.open_channels.lock().insert(channel);
                Method::ChannelOpenOk
            }
            Method::ChannelClose { .. } => {
                session.inner.open_channels.lock().remove(&channel);
                Method::ChannelCloseOk
            }
            Method::ChannelCloseOk => {
                session.inner.open_channels.lock().remove(&channel);
                return None;
            }
            Method::ChannelFlow { active } => Method::ChannelFlowOk { active },

            Method::ExchangeDeclare { .. } => Method::ExchangeDeclareOk,
            Method::ExchangeDelete { .. } => Method::ExchangeDeleteOk,
            Method::ExchangeBind { .. } => Method::ExchangeBindOk,

            Method::QueueDeclare { queue, .. } => Method::QueueDeclareOk {
                queue: if queue.is_empty() {
                    self.generate("amq.gen")
                } else {
                    queue
                },
                message_count: 0,
                consumer_count: 0,
            },
            Method::QueueBind { .. } => Method::QueueBindOk,
            Method::QueueUnbind { .. } => Method::QueueUnbindOk,
            Method::QueuePurge { .. } => Method::QueuePurgeOk { message_count: 0 },
            Method::QueueDelete { .. } => Method::QueueDeleteOk { message_count: 0 },

            Method::BasicQos { .. } => Method::BasicQosOk,
            Method::BasicConsume { consumer_tag, .. } => Method::BasicConsumeOk {
                consumer_tag: if consumer_tag.is_empty() {
                    self.generate("amq.ctag")
                } else {
                    consumer_tag
                },
            },
            Method::BasicCancel { consumer_tag } => Method::BasicCancelOk { consumer_tag },
            _ => return None,
        };
        Some(reply)
    }
}

#[derive(Debug)]
struct SessionInner {
    id: usize,
    outbound: Mutex<Option<mpsc::UnboundedSender<Inbound>>>,
    received: Mutex<Vec<Frame>>,
    open_channels: Mutex<BTreeSet<ChannelId>>,
    faults: Faults,
}

/// Handle to one accepted client connection.
#[derive(Debug, Clone)]
pub struct BrokerSession {
    inner: Arc<SessionInner>,
}

impl BrokerSession {
    fn new(id: usize, outbound: mpsc::UnboundedSender<Inbound>, faults: Faults) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id,
                outbound: Mutex::new(Some(outbound)),
                received: Mutex::new(Vec::new()),
                open_channels: Mutex::new(BTreeSet::new()),
                faults,
            }),
        }
    }

    pub fn id(&self) -> usize {
        self.inner.id
    }

    /// Send a frame to the client. Returns false once the session is hung up.
    pub fn send(&self, frame: Frame) -> bool {
        match self.inner.outbound.lock().as_ref() {
            Some(tx) => tx.send(Ok(frame)).is_ok(),
            None => false,
        }
    }

    pub fn send_method(&self, channel: ChannelId, method: Method) -> bool {
        self.send(Frame::method(channel, method))
    }

    pub fn block(&self, reason: &str) {
        self.send_method(
            CONTROL_CHANNEL,
            Method::ConnectionBlocked {
                reason: reason.to_string(),
            },
        );
    }

    pub fn unblock(&self) {
        self.send_method(CONTROL_CHANNEL, Method::ConnectionUnblocked);
    }

    /// Start a broker-initiated connection close.
    pub fn close_connection(&self, reply_code: u16, reply_text: &str) {
        self.send_method(
            CONTROL_CHANNEL,
            Method::ConnectionClose {
                reply_code,
                reply_text: reply_text.to_string(),
                class_id: 0,
                method_id: 0,
            },
        );
    }

    /// Close a channel from the broker side.
    pub fn close_channel(&self, channel: ChannelId, reply_code: u16, reply_text: &str) {
        self.inner.open_channels.lock().remove(&channel);
        self.send_method(
            channel,
            Method::ChannelClose {
                reply_code,
                reply_text: reply_text.to_string(),
                class_id: 0,
                method_id: 0,
            },
        );
    }

    /// Deliver a message to a consumer.
    pub fn deliver(
        &self,
        channel: ChannelId,
        consumer_tag: &str,
        delivery_tag: u64,
        body: impl Into<Bytes>,
    ) {
        let body = body.into();
        self.send_method(
            channel,
            Method::BasicDeliver {
                consumer_tag: consumer_tag.to_string(),
                delivery_tag,
                redelivered: false,
                exchange: String::new(),
                routing_key: String::new(),
            },
        );
        self.send(Frame::Header {
            channel,
            class_id: BASIC_CLASS,
            body_size: body.len() as u64,
            properties: Bytes::new(),
        });
        if !body.is_empty() {
            self.send(Frame::Body {
                channel,
                payload: body,
            });
        }
    }

    /// Fail the client's reader with a connection reset, then hang up.
    pub fn reset(&self) {
        if let Some(tx) = self.inner.outbound.lock().take() {
            let _ = tx.send(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection reset by broker",
            )));
        }
    }

    /// Close the socket without a close handshake. The client reads EOF.
    pub fn hang_up(&self) {
        self.inner.outbound.lock().take();
    }

    pub fn is_hung_up(&self) -> bool {
        self.inner.outbound.lock().is_none()
    }

    pub fn faults(&self) -> &Faults {
        &self.inner.faults
    }

    /// Every frame the client wrote on this session, in order.
    pub fn received(&self) -> Vec<Frame> {
        self.inner.received.lock().clone()
    }

    /// Methods received on this session as `(channel, method)` pairs.
    pub fn methods(&self) -> Vec<(ChannelId, Method)> {
        self.inner
            .received
            .lock()
            .iter()
            .filter_map(|frame| match frame {
                Frame::Method { channel, method } => Some((*channel, method.clone())),
                _ => None,
            })
            .collect()
    }

    /// How many times a method (or [`HEARTBEAT`]) was received.
    pub fn count(&self, method: &str) -> usize {
        self.inner
            .received
            .lock()
            .iter()
            .filter(|frame| match frame {
                Frame::Method { method: m, .. } => m.name() == method,
                Frame::Heartbeat => method == HEARTBEAT,
                _ => false,
            })
            .count()
    }

    /// Channels the client currently has open according to this session.
    pub fn open_channels(&self) -> Vec<ChannelId> {
        self.inner.open_channels.lock().iter().copied().collect()
    }

    fn record(&self, frame: Frame) {
        self.inner.received.lock().push(frame);
    }
}
