//! Connection error types.

use std::time::Duration;

use warren_primitives::{ChannelId, HandshakeError, ShutdownReason};

use crate::config::ConfigError;

/// Errors surfaced to callers of the connection API.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The connection has left the open state.
    #[error("Connection not open: {0}")]
    NotOpen(ShutdownReason),

    /// The channel is closed or was never opened.
    #[error("Channel {channel} closed: {reason}")]
    ChannelClosed {
        channel: ChannelId,
        reason: ShutdownReason,
    },

    /// Every channel number up to the negotiated maximum is taken.
    #[error("Channel limit exceeded: all {max} channels in use")]
    ChannelLimitExceeded { max: ChannelId },

    /// The requested channel number is already allocated.
    #[error("Channel {0} already in use")]
    ChannelInUse(ChannelId),

    #[error("Channel number {requested} outside 1..={max}")]
    ChannelOutOfRange { requested: ChannelId, max: ChannelId },

    /// A synchronous request got no reply in time. The connection stays usable.
    #[error("No reply to {method} within {timeout:?}")]
    RpcTimeout {
        method: &'static str,
        timeout: Duration,
    },

    #[error("Reply {got} does not answer {request}")]
    UnexpectedReply {
        request: &'static str,
        got: &'static str,
    },

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    /// No endpoint in the list accepted a connection.
    #[error("Failed to connect to any of {attempts} endpoint(s): {last}")]
    ConnectFailed {
        attempts: usize,
        last: Box<ConnectionError>,
    },

    #[error("Stream error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

impl ConnectionError {
    /// The shutdown reason behind a closed-connection or closed-channel error.
    pub fn shutdown_reason(&self) -> Option<&ShutdownReason> {
        match self {
            Self::NotOpen(reason) | Self::ChannelClosed { reason, .. } => Some(reason),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::RpcTimeout { .. } | Self::Handshake(HandshakeError::Timeout)
        )
    }
}

pub type Result<T, E = ConnectionError> = std::result::Result<T, E>;
