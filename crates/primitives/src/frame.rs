use bytes::Bytes;

use crate::Method;

/// Channel number. Channel 0 carries connection-level control methods.
pub type ChannelId = u16;

/// The connection-level control channel.
pub const CONTROL_CHANNEL: ChannelId = 0;

/// Bytes of framing around every frame payload (type, channel, size, end marker).
pub const FRAME_OVERHEAD: u32 = 8;

/// A decoded frame as produced by the codec.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A method call or reply.
    Method { channel: ChannelId, method: Method },
    /// Content header following a content-carrying method.
    Header {
        channel: ChannelId,
        class_id: u16,
        body_size: u64,
        properties: Bytes,
    },
    /// A fragment of content body.
    Body { channel: ChannelId, payload: Bytes },
    /// Liveness frame, always on channel 0.
    Heartbeat,
}

impl Frame {
    pub fn method(channel: ChannelId, method: Method) -> Self {
        Self::Method { channel, method }
    }

    /// The channel this frame is addressed to.
    pub fn channel(&self) -> ChannelId {
        match self {
            Self::Method { channel, .. }
            | Self::Header { channel, .. }
            | Self::Body { channel, .. } => *channel,
            Self::Heartbeat => CONTROL_CHANNEL,
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Self::Heartbeat)
    }

    /// Short description for logs.
    pub fn describe(&self) -> String {
        match self {
            Self::Method { method, .. } => method.name().to_string(),
            Self::Header { body_size, .. } => format!("content-header({body_size})"),
            Self::Body { payload, .. } => format!("content-body({})", payload.len()),
            Self::Heartbeat => "heartbeat".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_channel() {
        assert_eq!(Frame::Heartbeat.channel(), CONTROL_CHANNEL);
        assert_eq!(Frame::method(3, Method::ChannelOpen).channel(), 3);
        assert_eq!(
            Frame::Body {
                channel: 7,
                payload: Bytes::from_static(b"x"),
            }
            .channel(),
            7
        );
    }

    #[test]
    fn test_frame_describe() {
        assert_eq!(Frame::Heartbeat.describe(), "heartbeat");
        assert_eq!(
            Frame::method(1, Method::ChannelOpenOk).describe(),
            "channel.open-ok"
        );
    }
}
