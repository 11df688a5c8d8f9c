//! Automatic recovery for warren connections.
//!
//! [`RecoveringConnection`] opens a regular [`Connection`](warren_connection::Connection) and
//! replaces it when it is lost for any reason other than an application close:
//!
//! 1. Wait out the [`RetryPolicy`] backoff, then reconnect, walking the endpoint list on
//!    every attempt.
//! 2. Redeclare the recorded exchanges, queues and bindings, in that order.
//! 3. Reopen the application's channels on their old numbers and restore their prefetch.
//! 4. Re-register consumers, feeding the streams the application already holds.
//!
//! Renamed server-named queues and regenerated consumer tags are reported as
//! [`ConnectionEvent::QueueNameChanged`](warren_connection::ConnectionEvent::QueueNameChanged)
//! and `ConsumerTagChanged`; the outcome as `RecoverySucceeded` or `RecoveryFailed`.

mod channel;
mod connection;
mod engine;
mod error;
mod metrics;
mod policy;
mod record;
mod topology;

pub use channel::RecoverableChannel;
pub use connection::RecoveringConnection;
pub use error::{RecoveryError, Result};
pub use policy::RetryPolicy;
pub use topology::{
    BindingDestination, RecordedBinding, RecordedConsumer, RecordedExchange, RecordedQueue,
    TopologyRecorder, TopologyRegistry, TopologySnapshot,
};
