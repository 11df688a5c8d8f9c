//! Connection metrics

use metrics::{Counter, Gauge};

/// Connection metrics, shared by every connection in the process.
#[derive(Clone, Debug)]
pub(crate) struct ConnectionMetrics {
    /// Frames decoded from the transport
    pub(crate) frames_received_total: Counter,
    /// Frames handed to the transport
    pub(crate) frames_sent_total: Counter,
    /// Connections declared dead by the heartbeat monitor
    pub(crate) heartbeats_missed_total: Counter,
    /// Channels opened successfully
    pub(crate) channels_opened_total: Counter,
    /// Channels currently open
    pub(crate) channels_open: Gauge,
    /// Publishes held while the broker blocked the connection
    pub(crate) publishes_held_total: Counter,
}

impl Default for ConnectionMetrics {
    fn default() -> Self {
        Self {
            frames_received_total: metrics::counter!("amqp.connection.frames_received_total"),
            frames_sent_total: metrics::counter!("amqp.connection.frames_sent_total"),
            heartbeats_missed_total: metrics::counter!(
                "amqp.connection.heartbeats_missed_total"
            ),
            channels_opened_total: metrics::counter!("amqp.connection.channels_opened_total"),
            channels_open: metrics::gauge!("amqp.connection.channels_open"),
            publishes_held_total: metrics::counter!("amqp.connection.publishes_held_total"),
        }
    }
}

impl ConnectionMetrics {
    pub(crate) fn channels_closed(&self, count: usize) {
        self.channels_open.decrement(count as f64);
    }
}
