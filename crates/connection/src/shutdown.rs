//! Connection close handshake.
//!
//! The closing side sends `connection.close`, the peer answers `connection.close-ok`, and only
//! then is the transport released. Every channel is force-closed as soon as the handshake
//! starts; secondary failures along the way land in the shutdown report instead of aborting
//! the close.

use std::{fmt, sync::Arc, time::Duration};

use tracing::{debug, warn};
use warren_primitives::{CONTROL_CHANNEL, ChannelId, Frame, Method, ShutdownReason};

use crate::{
    connection::Shared,
    error::{ConnectionError, Result},
};

/// A secondary problem encountered while shutting down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReportEntry {
    /// The peer did not acknowledge the close in time; the transport was closed anyway.
    ForcedClose { timeout: Duration },
    /// A channel's close listener failed during forced teardown.
    ChannelCloseFailed { channel: ChannelId, error: String },
    /// The transport failed while closing.
    TransportError { error: String },
}

impl fmt::Display for ShutdownReportEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ForcedClose { timeout } => {
                write!(f, "close handshake not acknowledged within {timeout:?}; forced")
            }
            Self::ChannelCloseFailed { channel, error } => {
                write!(f, "closing channel {channel} failed: {error}")
            }
            Self::TransportError { error } => write!(f, "transport error while closing: {error}"),
        }
    }
}

/// Whether close-time I/O errors reach the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseMode {
    Close,
    Abort,
}

/// Run the full close: start the handshake, wait for it, force it on timeout.
///
/// A no-op returning success if the connection is already closing or closed.
pub(crate) async fn close(
    shared: &Arc<Shared>,
    reason: ShutdownReason,
    timeout: Option<Duration>,
    mode: CloseMode,
) -> Result<()> {
    if !initiate(shared, reason) {
        return Ok(());
    }
    complete(shared, timeout).await;

    match (mode, shared.take_close_error()) {
        (CloseMode::Close, Some(e)) => Err(ConnectionError::Io(e)),
        (CloseMode::Abort, Some(e)) => {
            debug!(error = %e, "Suppressed I/O error during abort");
            Ok(())
        }
        (_, None) => Ok(()),
    }
}

/// Enter `Closing` and send `connection.close`. Returns false if another close won the race.
pub(crate) fn initiate(shared: &Shared, reason: ShutdownReason) -> bool {
    if !shared.begin_closing(reason.clone()) {
        return false;
    }
    let (class_id, method_id) = reason.cause().unwrap_or((0, 0));
    let close = Method::ConnectionClose {
        reply_code: reason.reply_code(),
        reply_text: reason.reply_text().to_string(),
        class_id,
        method_id,
    };
    if let Err(e) = shared.send_control(Frame::method(CONTROL_CHANNEL, close)) {
        shared.set_close_error(e);
    }
    true
}

/// Wait for the read path to observe `connection.close-ok`, or force the close on timeout.
pub(crate) async fn complete(shared: &Arc<Shared>, timeout: Option<Duration>) {
    let mut closed = shared.subscribe_closed();
    let acknowledged = closed.wait_for(Option::is_some);
    match timeout {
        None => {
            let _ = acknowledged.await;
        }
        Some(timeout) => {
            if tokio::time::timeout(timeout, acknowledged).await.is_err() {
                warn!(?timeout, "Close not acknowledged; forcing transport closed");
                shared.record(ShutdownReportEntry::ForcedClose { timeout });
                shared.finish().await;
            }
        }
    }
}
