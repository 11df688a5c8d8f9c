//! Error types for the opening handshake.

/// Failure while connecting and negotiating a connection.
///
/// Handshake failures are always fatal and never trigger automatic recovery.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("Timeout")]
    Timeout,
    #[error("Connection closed during handshake")]
    ConnectionClosed,
    #[error("Unexpected frame: expected {expected}, got {got}")]
    UnexpectedFrame { expected: &'static str, got: String },
    #[error("Unsupported protocol version {major}-{minor}")]
    UnsupportedVersion { major: u8, minor: u8 },
    #[error("Mechanism {mechanism} not offered by server (offered: {offered})")]
    MechanismNotOffered { mechanism: String, offered: String },
    #[error("Server closed connection: {code} {text}")]
    Closed { code: u16, text: String },
    #[error("Stream error: {0}")]
    Stream(#[from] std::io::Error),
}
