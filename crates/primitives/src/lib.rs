//! Shared primitives for the warren AMQP 0-9-1 connection core.
//!
//! This crate holds everything the connection, recovery and test crates agree on
//! without depending on each other:
//!
//! - [`Frame`] and [`Method`] - the decoded frame model handed over by the codec
//! - [`FieldTable`] - AMQP argument/property tables
//! - [`ShutdownReason`] - the immutable record attached to closed connections and channels
//! - [`FrameReader`], [`FrameWriter`], [`Connector`], [`Negotiator`] - the seams to the
//!   externally supplied codec, transport and authentication layers
//!
//! Byte layout is deliberately absent: encoding frames is the codec's job.

pub mod constants;
mod error;
mod frame;
mod method;
mod shutdown;
mod table;
pub mod transport;

pub use error::HandshakeError;
pub use frame::{CONTROL_CHANNEL, ChannelId, FRAME_OVERHEAD, Frame};
pub use method::{
    ClassMethod, ConsumeOptions, ExchangeDeclareOptions, Method, QueueDeclareOptions,
};
pub use shutdown::{ShutdownInitiator, ShutdownReason, ShutdownSource};
pub use table::{FieldTable, FieldValue};
pub use transport::{
    Connector, Endpoint, EndpointParseError, FrameReader, FrameWriter, FramedTransport,
    Negotiated, Negotiator, Tuning,
};
