//! Recovery metrics

use metrics::Counter;

/// Recovery metrics, shared by every recovering connection in the process.
#[derive(Clone, Debug)]
pub(crate) struct RecoveryMetrics {
    /// Reconnect attempts, successful or not
    pub(crate) attempts_total: Counter,
    /// Recoveries that reconnected and replayed everything
    pub(crate) succeeded_total: Counter,
    /// Recoveries that gave up
    pub(crate) failed_total: Counter,
}

impl Default for RecoveryMetrics {
    fn default() -> Self {
        Self {
            attempts_total: metrics::counter!("amqp.connection.recovery.attempts_total"),
            succeeded_total: metrics::counter!("amqp.connection.recovery.succeeded_total"),
            failed_total: metrics::counter!("amqp.connection.recovery.failed_total"),
        }
    }
}
