//! SASL negotiation for the opening handshake.
//!
//! Runs `start / start-ok / tune / tune-ok / open / open-ok` over an already-connected
//! transport. Sending the protocol header is the connector's job, so the first frame read here
//! is `connection.start`.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;
use warren_primitives::{
    CONTROL_CHANNEL, FieldTable, Frame, FramedTransport, HandshakeError, Method, Negotiated,
    Negotiator, Tuning, constants::PROTOCOL_VERSION,
};

const DEFAULT_LOCALE: &str = "en_US";

/// Credentials for a SASL mechanism.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// `PLAIN`: username and password.
    Plain { username: String, password: String },
    /// `EXTERNAL`: identity comes from the transport (e.g. a TLS client certificate).
    External,
}

impl Credentials {
    pub fn plain(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Plain {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn mechanism(&self) -> &'static str {
        match self {
            Self::Plain { .. } => "PLAIN",
            Self::External => "EXTERNAL",
        }
    }

    /// Initial SASL response.
    fn response(&self) -> Bytes {
        match self {
            Self::Plain { username, password } => {
                Bytes::from(format!("\0{username}\0{password}").into_bytes())
            }
            Self::External => Bytes::new(),
        }
    }

    /// Whether `connection.update-secret` can refresh these credentials.
    pub fn supports_secret_update(&self) -> bool {
        matches!(self, Self::Plain { .. })
    }
}

impl Default for Credentials {
    fn default() -> Self {
        Self::plain("guest", "guest")
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain { username, .. } => f
                .debug_struct("Plain")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Self::External => f.write_str("External"),
        }
    }
}

/// [`Negotiator`] implementing the AMQP 0-9-1 SASL handshake.
#[derive(Debug, Clone, Default)]
pub struct SaslNegotiator {
    credentials: Credentials,
}

impl SaslNegotiator {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }

    pub fn plain(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::new(Credentials::plain(username, password))
    }
}

#[async_trait]
impl Negotiator for SaslNegotiator {
    async fn negotiate(
        &self,
        transport: &mut FramedTransport,
        requested: Tuning,
        client_properties: FieldTable,
        virtual_host: &str,
    ) -> Result<Negotiated, HandshakeError> {
        let (server_properties, mechanisms) = match next_method(transport).await? {
            Method::ConnectionStart {
                version_major,
                version_minor,
                server_properties,
                mechanisms,
                ..
            } => {
                if (version_major, version_minor) != PROTOCOL_VERSION {
                    return Err(HandshakeError::UnsupportedVersion {
                        major: version_major,
                        minor: version_minor,
                    });
                }
                (server_properties, mechanisms)
            }
            other => return Err(unexpected("connection.start", &other)),
        };

        let mechanism = self.credentials.mechanism();
        if !mechanisms.split_whitespace().any(|m| m == mechanism) {
            return Err(HandshakeError::MechanismNotOffered {
                mechanism: mechanism.to_string(),
                offered: mechanisms,
            });
        }
        send(
            transport,
            Method::ConnectionStartOk {
                client_properties,
                mechanism: mechanism.to_string(),
                response: self.credentials.response(),
                locale: DEFAULT_LOCALE.to_string(),
            },
        )
        .await?;

        let server = match next_method(transport).await? {
            Method::ConnectionTune {
                channel_max,
                frame_max,
                heartbeat,
            } => Tuning {
                channel_max,
                frame_max,
                heartbeat,
            },
            other => return Err(unexpected("connection.tune", &other)),
        };
        let tuning = Tuning::negotiate(requested, server);
        debug!(?requested, ?server, ?tuning, "Tuning negotiated");
        send(
            transport,
            Method::ConnectionTuneOk {
                channel_max: tuning.channel_max,
                frame_max: tuning.frame_max,
                heartbeat: tuning.heartbeat,
            },
        )
        .await?;

        send(
            transport,
            Method::ConnectionOpen {
                virtual_host: virtual_host.to_string(),
            },
        )
        .await?;
        match next_method(transport).await? {
            Method::ConnectionOpenOk => {}
            other => return Err(unexpected("connection.open-ok", &other)),
        }

        Ok(Negotiated {
            tuning,
            server_properties,
            mechanism: mechanism.to_string(),
            supports_secret_update: self.credentials.supports_secret_update(),
        })
    }
}

async fn send(transport: &mut FramedTransport, method: Method) -> Result<(), HandshakeError> {
    transport
        .writer
        .write_frame(Frame::method(CONTROL_CHANNEL, method))
        .await?;
    transport.writer.flush().await?;
    Ok(())
}

/// Next connection-class method, skipping heartbeats. A broker close becomes an error.
async fn next_method(transport: &mut FramedTransport) -> Result<Method, HandshakeError> {
    loop {
        match transport.reader.read_frame().await? {
            None => return Err(HandshakeError::ConnectionClosed),
            Some(Frame::Heartbeat) => continue,
            Some(Frame::Method {
                channel: CONTROL_CHANNEL,
                method:
                    Method::ConnectionClose {
                        reply_code,
                        reply_text,
                        ..
                    },
            }) => {
                return Err(HandshakeError::Closed {
                    code: reply_code,
                    text: reply_text,
                });
            }
            Some(Frame::Method {
                channel: CONTROL_CHANNEL,
                method,
            }) => return Ok(method),
            Some(other) => {
                return Err(HandshakeError::UnexpectedFrame {
                    expected: "connection method",
                    got: other.describe(),
                });
            }
        }
    }
}

fn unexpected(expected: &'static str, got: &Method) -> HandshakeError {
    HandshakeError::UnexpectedFrame {
        expected,
        got: got.name().to_string(),
    }
}
