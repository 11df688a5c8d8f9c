//! AMQP 0-9-1 reply codes and protocol constants.

/// Normal close.
pub const REPLY_SUCCESS: u16 = 200;
/// Content too large for the negotiated limits.
pub const CONTENT_TOO_LARGE: u16 = 311;
/// The operator or a peer forced the connection closed.
pub const CONNECTION_FORCED: u16 = 320;
/// Client tried to work with an unknown virtual host.
pub const INVALID_PATH: u16 = 402;
/// Authentication was refused.
pub const ACCESS_REFUSED: u16 = 403;
/// Entity does not exist.
pub const NOT_FOUND: u16 = 404;
/// Exclusive resource is locked by another connection.
pub const RESOURCE_LOCKED: u16 = 405;
/// Malformed frame.
pub const FRAME_ERROR: u16 = 501;
/// Frame contained illegal field values.
pub const SYNTAX_ERROR: u16 = 502;
/// Method not valid in the current state.
pub const COMMAND_INVALID: u16 = 503;
/// Frame referenced a channel that is not open.
pub const CHANNEL_ERROR: u16 = 504;
/// Frame arrived where a different frame type was expected.
pub const UNEXPECTED_FRAME: u16 = 505;
/// Server could not complete the method for lack of resources.
pub const RESOURCE_ERROR: u16 = 506;
/// Operation forbidden by the peer's configuration.
pub const NOT_ALLOWED: u16 = 530;
/// Functionality not implemented by the peer.
pub const NOT_IMPLEMENTED: u16 = 540;
/// Internal error in the peer.
pub const INTERNAL_ERROR: u16 = 541;

/// Protocol version announced in the protocol header.
pub const PROTOCOL_VERSION: (u8, u8) = (0, 9);

/// Channel ceiling imposed by the client when the server declares no limit.
pub const MAX_CHANNELS_CEILING: u16 = 2047;

/// Smallest frame-max a peer may negotiate.
pub const FRAME_MIN_SIZE: u32 = 4096;

/// Returns true for reply codes AMQP 0-9-1 classifies as hard (connection) errors.
pub fn is_hard_error(code: u16) -> bool {
    matches!(
        code,
        CONNECTION_FORCED
            | INVALID_PATH
            | FRAME_ERROR
            | SYNTAX_ERROR
            | COMMAND_INVALID
            | CHANNEL_ERROR
            | UNEXPECTED_FRAME
            | RESOURCE_ERROR
            | NOT_ALLOWED
            | NOT_IMPLEMENTED
            | INTERNAL_ERROR
    )
}
