//! Shutdown reasons attached to closed connections and channels.

use std::fmt;

use crate::{
    ChannelId, ClassMethod,
    constants::{CHANNEL_ERROR, CONNECTION_FORCED, REPLY_SUCCESS},
};

/// Which side started the shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShutdownInitiator {
    /// This client, either the application or the library itself.
    Local,
    /// The broker sent a close method.
    Peer,
    /// The transport failed (I/O error, EOF, missed heartbeats).
    Transport,
}

/// The component that raised the shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShutdownSource {
    Application,
    StateMachine,
    Multiplexer,
    Heartbeat,
    ShutdownProtocol,
    Broker,
    Transport,
}

/// Immutable record of why a connection or channel closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReason {
    reply_code: u16,
    reply_text: String,
    initiator: ShutdownInitiator,
    source: ShutdownSource,
    channel: Option<ChannelId>,
    cause: Option<ClassMethod>,
}

impl ShutdownReason {
    pub fn new(
        reply_code: u16,
        reply_text: impl Into<String>,
        initiator: ShutdownInitiator,
        source: ShutdownSource,
    ) -> Self {
        Self {
            reply_code,
            reply_text: reply_text.into(),
            initiator,
            source,
            channel: None,
            cause: None,
        }
    }

    /// Close requested by application code.
    pub fn application(reply_code: u16, reply_text: impl Into<String>) -> Self {
        Self::new(
            reply_code,
            reply_text,
            ShutdownInitiator::Local,
            ShutdownSource::Application,
        )
    }

    /// The default reason for a plain `close()`.
    pub fn normal() -> Self {
        Self::application(REPLY_SUCCESS, "OK")
    }

    /// Close method received from the broker.
    pub fn peer(reply_code: u16, reply_text: impl Into<String>, cause: Option<ClassMethod>) -> Self {
        Self {
            cause,
            ..Self::new(
                reply_code,
                reply_text,
                ShutdownInitiator::Peer,
                ShutdownSource::Broker,
            )
        }
    }

    /// Transport-level failure raised by `source`.
    pub fn transport(source: ShutdownSource, reply_text: impl Into<String>) -> Self {
        Self::new(
            CONNECTION_FORCED,
            reply_text,
            ShutdownInitiator::Transport,
            source,
        )
    }

    /// The library detected a protocol violation and is closing the connection.
    pub fn protocol_violation(
        reply_code: u16,
        reply_text: impl Into<String>,
        source: ShutdownSource,
    ) -> Self {
        Self::new(reply_code, reply_text, ShutdownInitiator::Local, source)
    }

    /// A frame arrived for a channel that is not open.
    pub fn unknown_channel(channel: ChannelId) -> Self {
        Self::protocol_violation(
            CHANNEL_ERROR,
            format!("frame received for unknown channel {channel}"),
            ShutdownSource::Multiplexer,
        )
        .with_channel(channel)
    }

    pub fn with_channel(mut self, channel: ChannelId) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn with_cause(mut self, cause: ClassMethod) -> Self {
        self.cause = Some(cause);
        self
    }

    pub fn reply_code(&self) -> u16 {
        self.reply_code
    }

    pub fn reply_text(&self) -> &str {
        &self.reply_text
    }

    pub fn initiator(&self) -> ShutdownInitiator {
        self.initiator
    }

    pub fn source(&self) -> ShutdownSource {
        self.source
    }

    /// Channel the reason is scoped to, if any.
    pub fn channel(&self) -> Option<ChannelId> {
        self.channel
    }

    /// Method that provoked the close, when the peer reported one.
    pub fn cause(&self) -> Option<ClassMethod> {
        self.cause
    }

    /// True only for closes requested by application code. Everything else is eligible for
    /// automatic recovery.
    pub fn is_application_initiated(&self) -> bool {
        self.initiator == ShutdownInitiator::Local && self.source == ShutdownSource::Application
    }

    pub fn is_transport_failure(&self) -> bool {
        self.initiator == ShutdownInitiator::Transport
    }

    pub fn is_peer_initiated(&self) -> bool {
        self.initiator == ShutdownInitiator::Peer
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let who = match self.initiator {
            ShutdownInitiator::Local => "clean local shutdown",
            ShutdownInitiator::Peer => "peer shutdown",
            ShutdownInitiator::Transport => "transport failure",
        };
        write!(f, "{who}; code={}, text={:?}", self.reply_code, self.reply_text)?;
        if let Some(channel) = self.channel {
            write!(f, ", channel={channel}")?;
        }
        if let Some((class_id, method_id)) = self.cause {
            write!(f, ", class-id={class_id}, method-id={method_id}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_application_closes_skip_recovery() {
        assert!(ShutdownReason::normal().is_application_initiated());
        assert!(!ShutdownReason::unknown_channel(9).is_application_initiated());
        assert!(!ShutdownReason::peer(320, "forced", None).is_application_initiated());
        assert!(
            !ShutdownReason::transport(ShutdownSource::Heartbeat, "missed heartbeats")
                .is_application_initiated()
        );
    }

    #[test]
    fn test_display() {
        let reason = ShutdownReason::peer(404, "NOT_FOUND - no queue 'q'", Some((50, 20)))
            .with_channel(3);
        assert_eq!(
            reason.to_string(),
            "peer shutdown; code=404, text=\"NOT_FOUND - no queue 'q'\", channel=3, class-id=50, method-id=20"
        );
    }

    #[test]
    fn test_unknown_channel_reason() {
        let reason = ShutdownReason::unknown_channel(42);
        assert_eq!(reason.reply_code(), CHANNEL_ERROR);
        assert_eq!(reason.channel(), Some(42));
        assert_eq!(reason.source(), ShutdownSource::Multiplexer);
        assert_eq!(reason.initiator(), ShutdownInitiator::Local);
    }
}
