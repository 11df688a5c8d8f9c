//! Decoded AMQP 0-9-1 methods.
//!
//! Only the identity and arguments of each method are modelled here; the codec owns the wire
//! encoding. The connection core uses [`Method::class_method`] and [`Method::expects_reply`] to
//! pair synchronous requests with their replies.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::FieldTable;

/// `(class-id, method-id)` pair identifying a method on the wire.
pub type ClassMethod = (u16, u16);

const CONNECTION: u16 = 10;
const CHANNEL: u16 = 20;
const EXCHANGE: u16 = 40;
const QUEUE: u16 = 50;
const BASIC: u16 = 60;

/// Flags for `exchange.declare`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExchangeDeclareOptions {
    pub passive: bool,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
}

/// Flags for `queue.declare`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueDeclareOptions {
    pub passive: bool,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

/// Flags for `basic.consume`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConsumeOptions {
    pub no_local: bool,
    pub no_ack: bool,
    pub exclusive: bool,
}

/// A decoded method frame payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Method {
    ConnectionStart {
        version_major: u8,
        version_minor: u8,
        server_properties: FieldTable,
        mechanisms: String,
        locales: String,
    },
    ConnectionStartOk {
        client_properties: FieldTable,
        mechanism: String,
        response: Bytes,
        locale: String,
    },
    ConnectionTune {
        channel_max: u16,
        frame_max: u32,
        heartbeat: u16,
    },
    ConnectionTuneOk {
        channel_max: u16,
        frame_max: u32,
        heartbeat: u16,
    },
    ConnectionOpen {
        virtual_host: String,
    },
    ConnectionOpenOk,
    ConnectionClose {
        reply_code: u16,
        reply_text: String,
        class_id: u16,
        method_id: u16,
    },
    ConnectionCloseOk,
    ConnectionBlocked {
        reason: String,
    },
    ConnectionUnblocked,
    ConnectionUpdateSecret {
        new_secret: Bytes,
        reason: String,
    },
    ConnectionUpdateSecretOk,

    ChannelOpen,
    ChannelOpenOk,
    ChannelFlow {
        active: bool,
    },
    ChannelFlowOk {
        active: bool,
    },
    ChannelClose {
        reply_code: u16,
        reply_text: String,
        class_id: u16,
        method_id: u16,
    },
    ChannelCloseOk,

    ExchangeDeclare {
        exchange: String,
        kind: String,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    },
    ExchangeDeclareOk,
    ExchangeDelete {
        exchange: String,
        if_unused: bool,
    },
    ExchangeDeleteOk,
    ExchangeBind {
        destination: String,
        source: String,
        routing_key: String,
        arguments: FieldTable,
    },
    ExchangeBindOk,

    QueueDeclare {
        queue: String,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    },
    QueueDeclareOk {
        queue: String,
        message_count: u32,
        consumer_count: u32,
    },
    QueueBind {
        queue: String,
        exchange: String,
        routing_key: String,
        arguments: FieldTable,
    },
    QueueBindOk,
    QueuePurge {
        queue: String,
    },
    QueuePurgeOk {
        message_count: u32,
    },
    QueueDelete {
        queue: String,
        if_unused: bool,
        if_empty: bool,
    },
    QueueDeleteOk {
        message_count: u32,
    },
    QueueUnbind {
        queue: String,
        exchange: String,
        routing_key: String,
        arguments: FieldTable,
    },
    QueueUnbindOk,

    BasicQos {
        prefetch_size: u32,
        prefetch_count: u16,
        global: bool,
    },
    BasicQosOk,
    BasicConsume {
        queue: String,
        consumer_tag: String,
        options: ConsumeOptions,
        arguments: FieldTable,
    },
    BasicConsumeOk {
        consumer_tag: String,
    },
    BasicCancel {
        consumer_tag: String,
    },
    BasicCancelOk {
        consumer_tag: String,
    },
    BasicPublish {
        exchange: String,
        routing_key: String,
        mandatory: bool,
        immediate: bool,
    },
    BasicDeliver {
        consumer_tag: String,
        delivery_tag: u64,
        redelivered: bool,
        exchange: String,
        routing_key: String,
    },
    BasicAck {
        delivery_tag: u64,
        multiple: bool,
    },
    BasicNack {
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    },
    BasicReject {
        delivery_tag: u64,
        requeue: bool,
    },
}

impl Method {
    /// Wire identity of this method.
    pub fn class_method(&self) -> ClassMethod {
        match self {
            Self::ConnectionStart { .. } => (CONNECTION, 10),
            Self::ConnectionStartOk { .. } => (CONNECTION, 11),
            Self::ConnectionTune { .. } => (CONNECTION, 30),
            Self::ConnectionTuneOk { .. } => (CONNECTION, 31),
            Self::ConnectionOpen { .. } => (CONNECTION, 40),
            Self::ConnectionOpenOk => (CONNECTION, 41),
            Self::ConnectionClose { .. } => (CONNECTION, 50),
            Self::ConnectionCloseOk => (CONNECTION, 51),
            Self::ConnectionBlocked { .. } => (CONNECTION, 60),
            Self::ConnectionUnblocked => (CONNECTION, 61),
            Self::ConnectionUpdateSecret { .. } => (CONNECTION, 70),
            Self::ConnectionUpdateSecretOk => (CONNECTION, 71),

            Self::ChannelOpen => (CHANNEL, 10),
            Self::ChannelOpenOk => (CHANNEL, 11),
            Self::ChannelFlow { .. } => (CHANNEL, 20),
            Self::ChannelFlowOk { .. } => (CHANNEL, 21),
            Self::ChannelClose { .. } => (CHANNEL, 40),
            Self::ChannelCloseOk => (CHANNEL, 41),

            Self::ExchangeDeclare { .. } => (EXCHANGE, 10),
            Self::ExchangeDeclareOk => (EXCHANGE, 11),
            Self::ExchangeDelete { .. } => (EXCHANGE, 20),
            Self::ExchangeDeleteOk => (EXCHANGE, 21),
            Self::ExchangeBind { .. } => (EXCHANGE, 30),
            Self::ExchangeBindOk => (EXCHANGE, 31),

            Self::QueueDeclare { .. } => (QUEUE, 10),
            Self::QueueDeclareOk { .. } => (QUEUE, 11),
            Self::QueueBind { .. } => (QUEUE, 20),
            Self::QueueBindOk => (QUEUE, 21),
            Self::QueuePurge { .. } => (QUEUE, 30),
            Self::QueuePurgeOk { .. } => (QUEUE, 31),
            Self::QueueDelete { .. } => (QUEUE, 40),
            Self::QueueDeleteOk { .. } => (QUEUE, 41),
            Self::QueueUnbind { .. } => (QUEUE, 50),
            Self::QueueUnbindOk => (QUEUE, 51),

            Self::BasicQos { .. } => (BASIC, 10),
            Self::BasicQosOk => (BASIC, 11),
            Self::BasicConsume { .. } => (BASIC, 20),
            Self::BasicConsumeOk { .. } => (BASIC, 21),
            Self::BasicCancel { .. } => (BASIC, 30),
            Self::BasicCancelOk { .. } => (BASIC, 31),
            Self::BasicPublish { .. } => (BASIC, 40),
            Self::BasicDeliver { .. } => (BASIC, 60),
            Self::BasicAck { .. } => (BASIC, 80),
            Self::BasicReject { .. } => (BASIC, 90),
            Self::BasicNack { .. } => (BASIC, 120),
        }
    }

    /// Dotted method name, e.g. `queue.declare-ok`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConnectionStart { .. } => "connection.start",
            Self::ConnectionStartOk { .. } => "connection.start-ok",
            Self::ConnectionTune { .. } => "connection.tune",
            Self::ConnectionTuneOk { .. } => "connection.tune-ok",
            Self::ConnectionOpen { .. } => "connection.open",
            Self::ConnectionOpenOk => "connection.open-ok",
            Self::ConnectionClose { .. } => "connection.close",
            Self::ConnectionCloseOk => "connection.close-ok",
            Self::ConnectionBlocked { .. } => "connection.blocked",
            Self::ConnectionUnblocked => "connection.unblocked",
            Self::ConnectionUpdateSecret { .. } => "connection.update-secret",
            Self::ConnectionUpdateSecretOk => "connection.update-secret-ok",
            Self::ChannelOpen => "channel.open",
            Self::ChannelOpenOk => "channel.open-ok",
            Self::ChannelFlow { .. } => "channel.flow",
            Self::ChannelFlowOk { .. } => "channel.flow-ok",
            Self::ChannelClose { .. } => "channel.close",
            Self::ChannelCloseOk => "channel.close-ok",
            Self::ExchangeDeclare { .. } => "exchange.declare",
            Self::ExchangeDeclareOk => "exchange.declare-ok",
            Self::ExchangeDelete { .. } => "exchange.delete",
            Self::ExchangeDeleteOk => "exchange.delete-ok",
            Self::ExchangeBind { .. } => "exchange.bind",
            Self::ExchangeBindOk => "exchange.bind-ok",
            Self::QueueDeclare { .. } => "queue.declare",
            Self::QueueDeclareOk { .. } => "queue.declare-ok",
            Self::QueueBind { .. } => "queue.bind",
            Self::QueueBindOk => "queue.bind-ok",
            Self::QueuePurge { .. } => "queue.purge",
            Self::QueuePurgeOk { .. } => "queue.purge-ok",
            Self::QueueDelete { .. } => "queue.delete",
            Self::QueueDeleteOk { .. } => "queue.delete-ok",
            Self::QueueUnbind { .. } => "queue.unbind",
            Self::QueueUnbindOk => "queue.unbind-ok",
            Self::BasicQos { .. } => "basic.qos",
            Self::BasicQosOk => "basic.qos-ok",
            Self::BasicConsume { .. } => "basic.consume",
            Self::BasicConsumeOk { .. } => "basic.consume-ok",
            Self::BasicCancel { .. } => "basic.cancel",
            Self::BasicCancelOk { .. } => "basic.cancel-ok",
            Self::BasicPublish { .. } => "basic.publish",
            Self::BasicDeliver { .. } => "basic.deliver",
            Self::BasicAck { .. } => "basic.ack",
            Self::BasicNack { .. } => "basic.nack",
            Self::BasicReject { .. } => "basic.reject",
        }
    }

    /// The reply a synchronous request waits for, or `None` for asynchronous methods.
    pub fn expects_reply(&self) -> Option<ClassMethod> {
        let reply = match self {
            Self::ConnectionOpen { .. } => (CONNECTION, 41),
            Self::ConnectionClose { .. } => (CONNECTION, 51),
            Self::ConnectionUpdateSecret { .. } => (CONNECTION, 71),
            Self::ChannelOpen => (CHANNEL, 11),
            Self::ChannelFlow { .. } => (CHANNEL, 21),
            Self::ChannelClose { .. } => (CHANNEL, 41),
            Self::ExchangeDeclare { .. } => (EXCHANGE, 11),
            Self::ExchangeDelete { .. } => (EXCHANGE, 21),
            Self::ExchangeBind { .. } => (EXCHANGE, 31),
            Self::QueueDeclare { .. } => (QUEUE, 11),
            Self::QueueBind { .. } => (QUEUE, 21),
            Self::QueuePurge { .. } => (QUEUE, 31),
            Self::QueueDelete { .. } => (QUEUE, 41),
            Self::QueueUnbind { .. } => (QUEUE, 51),
            Self::BasicQos { .. } => (BASIC, 11),
            Self::BasicConsume { .. } => (BASIC, 21),
            Self::BasicCancel { .. } => (BASIC, 31),
            _ => return None,
        };
        Some(reply)
    }

    /// Methods followed by a content header and body frames.
    pub fn carries_content(&self) -> bool {
        matches!(self, Self::BasicPublish { .. } | Self::BasicDeliver { .. })
    }

    /// Methods belonging to the connection class (only valid on channel 0).
    pub fn is_connection_class(&self) -> bool {
        self.class_method().0 == CONNECTION
    }

    /// Close methods carry the offending method's identity; this recovers it.
    pub fn close_cause(&self) -> Option<ClassMethod> {
        match self {
            Self::ConnectionClose {
                class_id,
                method_id,
                ..
            }
            | Self::ChannelClose {
                class_id,
                method_id,
                ..
            } if *class_id != 0 => Some((*class_id, *method_id)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_requests_pair_with_replies() {
        let declare = Method::QueueDeclare {
            queue: String::new(),
            options: QueueDeclareOptions::default(),
            arguments: FieldTable::new(),
        };
        let ok = Method::QueueDeclareOk {
            queue: "amq.gen-1".into(),
            message_count: 0,
            consumer_count: 0,
        };
        assert_eq!(declare.expects_reply(), Some(ok.class_method()));
        assert_eq!(Method::ChannelOpen.expects_reply(), Some((20, 11)));
        assert_eq!(
            Method::BasicAck {
                delivery_tag: 1,
                multiple: false
            }
            .expects_reply(),
            None
        );
    }

    #[test]
    fn test_content_and_connection_classification() {
        let publish = Method::BasicPublish {
            exchange: String::new(),
            routing_key: "q".into(),
            mandatory: false,
            immediate: false,
        };
        assert!(publish.carries_content());
        assert!(!publish.is_connection_class());
        assert!(Method::ConnectionUnblocked.is_connection_class());
        assert_eq!(Method::ConnectionUnblocked.name(), "connection.unblocked");
    }

    #[test]
    fn test_close_cause() {
        let close = Method::ChannelClose {
            reply_code: 404,
            reply_text: "NOT_FOUND".into(),
            class_id: 50,
            method_id: 10,
        };
        assert_eq!(close.close_cause(), Some((50, 10)));

        let normal = Method::ConnectionClose {
            reply_code: 200,
            reply_text: "bye".into(),
            class_id: 0,
            method_id: 0,
        };
        assert_eq!(normal.close_cause(), None);
    }
}
