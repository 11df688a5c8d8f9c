//! AMQP 0-9-1 client connection core.
//!
//! One [`Connection`] owns a framed transport and multiplexes numbered [`Channel`]s over it.
//! Around that sit the pieces every long-lived client needs:
//!
//! - a connection state machine (`Connecting -> Open -> Closing -> Closed`)
//! - heartbeat emission and missed-heartbeat detection
//! - a flow-control gate that holds outbound channel traffic while the broker blocks us
//! - an event dispatcher for shutdown, blocked/unblocked and recovery notifications
//! - the close handshake, with timeouts, abort and a report of secondary failures
//!
//! Frame encoding, the socket and SASL are external: see the seams in [`warren_primitives`].
//! Automatic recovery lives in `warren-recovery`, built on the public API here.
//!
//! # Flow
//!
//! 1. [`Connection::open`] dials each configured endpoint and runs the handshake
//! 2. [`Connection::create_channel`] allocates the lowest free channel number
//! 3. [`Connection::close`] runs `connection.close / close-ok` and tears everything down

mod channel;
mod config;
mod connection;
mod error;
mod events;
mod flow;
mod heartbeat;
mod io;
mod metrics;
mod multiplexer;
mod negotiate;
mod shutdown;

pub use channel::{
    Channel, ChannelListener, ChannelState, Consumer, Delivery, DeliverySink, PublishOptions,
    QueueDeclareOk, delivery_channel,
};
pub use config::{ConfigError, ConnectionConfig, RecoveryConfig};
pub use connection::{Connection, ConnectionState, client_properties};
pub use error::{ConnectionError, Result};
pub use events::{ConnectionEvent, EventDispatcher, EventKind, Listener, ListenerError, ListenerId};
pub use heartbeat::MISSED_HEARTBEAT_MULTIPLIER;
pub use negotiate::{Credentials, SaslNegotiator};
pub use shutdown::ShutdownReportEntry;

pub use warren_primitives::{
    ChannelId, ConsumeOptions, Endpoint, ExchangeDeclareOptions, FieldTable, FieldValue,
    QueueDeclareOptions, ShutdownInitiator, ShutdownReason, ShutdownSource,
};
