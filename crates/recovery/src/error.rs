//! Recovery error types.

use warren_connection::ConnectionError;

/// Why a recovery run gave up.
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    /// Every connect attempt allowed by the retry policy failed.
    #[error("Reconnect failed after {attempts} attempt(s): {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: ConnectionError,
    },

    /// The replacement connection opened but replaying recorded state failed.
    #[error("Failed to recover {entity}: {source}")]
    Replay {
        entity: String,
        source: ConnectionError,
    },

    /// The application closed the connection while recovery was running.
    #[error("Recovery cancelled by application close")]
    Cancelled,

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

impl RecoveryError {
    pub(crate) fn replay(entity: impl Into<String>) -> impl FnOnce(ConnectionError) -> Self {
        let entity = entity.into();
        move |source| Self::Replay { entity, source }
    }
}

pub type Result<T, E = RecoveryError> = std::result::Result<T, E>;
