//! Seams to the externally supplied codec, transport and negotiation layers.
//!
//! The connection core never touches sockets or bytes. A [`Connector`] produces a
//! [`FramedTransport`] (a codec already layered on a connected byte stream), and a
//! [`Negotiator`] runs the opening handshake on it before the core takes over.

use std::{fmt, io, str::FromStr};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{FieldTable, Frame, HandshakeError};

/// Read half of a framed transport.
#[async_trait]
pub trait FrameReader: Send + 'static {
    /// Read the next decoded frame. `Ok(None)` signals an orderly end of stream.
    async fn read_frame(&mut self) -> io::Result<Option<Frame>>;
}

/// Write half of a framed transport.
#[async_trait]
pub trait FrameWriter: Send + 'static {
    async fn write_frame(&mut self, frame: Frame) -> io::Result<()>;

    async fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Release the underlying stream. Called exactly once, after the close handshake.
    async fn close(&mut self) -> io::Result<()>;
}

/// A connected, framed duplex stream split into independently owned halves.
pub struct FramedTransport {
    pub reader: Box<dyn FrameReader>,
    pub writer: Box<dyn FrameWriter>,
}

impl FramedTransport {
    pub fn new(reader: impl FrameReader, writer: impl FrameWriter) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

impl fmt::Debug for FramedTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramedTransport").finish_non_exhaustive()
    }
}

/// Opens transports to broker endpoints. Called once per connect attempt.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, endpoint: &Endpoint) -> io::Result<FramedTransport>;
}

/// Runs the opening handshake (protocol header, SASL exchange, tuning, vhost open).
#[async_trait]
pub trait Negotiator: Send + Sync + 'static {
    async fn negotiate(
        &self,
        transport: &mut FramedTransport,
        requested: Tuning,
        client_properties: FieldTable,
        virtual_host: &str,
    ) -> Result<Negotiated, HandshakeError>;
}

/// Connection tuning parameters. Zero means "no limit" (or "disabled" for heartbeats).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tuning {
    pub channel_max: u16,
    pub frame_max: u32,
    /// Heartbeat interval in seconds.
    pub heartbeat: u16,
}

impl Tuning {
    /// Combine client and server proposals.
    ///
    /// Limits take the smaller non-zero value; zero only when both sides are unlimited.
    pub fn negotiate(client: Tuning, server: Tuning) -> Tuning {
        Tuning {
            channel_max: min_non_zero(client.channel_max, server.channel_max),
            frame_max: min_non_zero(client.frame_max, server.frame_max),
            heartbeat: min_non_zero(client.heartbeat, server.heartbeat),
        }
    }
}

fn min_non_zero<T: Ord + Default + Copy>(a: T, b: T) -> T {
    let zero = T::default();
    if a == zero || b == zero {
        a.max(b)
    } else {
        a.min(b)
    }
}

/// Result of a successful handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct Negotiated {
    pub tuning: Tuning,
    pub server_properties: FieldTable,
    pub mechanism: String,
    /// Whether the negotiated mechanism can refresh credentials via `connection.update-secret`.
    pub supports_secret_update: bool,
}

/// A broker address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub const DEFAULT_PORT: u16 = 5672;

    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Invalid `host[:port]` string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid endpoint {0:?}")]
pub struct EndpointParseError(pub String);

impl FromStr for Endpoint {
    type Err = EndpointParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = match s.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| EndpointParseError(s.to_string()))?;
                (host, port)
            }
            None => (s, Self::DEFAULT_PORT),
        };
        if host.is_empty() {
            return Err(EndpointParseError(s.to_string()));
        }
        Ok(Self::new(host, port))
    }
}

impl TryFrom<String> for Endpoint {
    type Error = EndpointParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Endpoint> for String {
    fn from(value: Endpoint) -> Self {
        value.to_string()
    }
}
