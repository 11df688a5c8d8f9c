//! Per-connection recovery record: which channels the application holds open and the
//! per-channel settings to restore on them.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use warren_connection::{Channel, ChannelId};

/// `basic.qos` settings to reapply on a recovered channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Prefetch {
    pub(crate) count: u16,
    pub(crate) global: bool,
}

/// A channel opened through the recovering connection.
///
/// The slot is shared with every [`RecoverableChannel`](crate::RecoverableChannel) handle, so
/// swapping in the replacement channel re-points all of them at once.
#[derive(Debug)]
pub(crate) struct RecordedChannel {
    current: RwLock<Channel>,
    prefetch: Mutex<Option<Prefetch>>,
}

impl RecordedChannel {
    pub(crate) fn new(channel: Channel) -> Self {
        Self {
            current: RwLock::new(channel),
            prefetch: Mutex::new(None),
        }
    }

    pub(crate) fn channel(&self) -> Channel {
        self.current.read().clone()
    }

    pub(crate) fn id(&self) -> ChannelId {
        self.current.read().id()
    }

    pub(crate) fn replace(&self, channel: Channel) {
        *self.current.write() = channel;
    }

    pub(crate) fn prefetch(&self) -> Option<Prefetch> {
        *self.prefetch.lock()
    }

    pub(crate) fn set_prefetch(&self, prefetch: Prefetch) {
        *self.prefetch.lock() = Some(prefetch);
    }
}

/// The channels to reopen after a reconnect, in ascending number order.
#[derive(Debug, Default)]
pub(crate) struct RecoveryRecord {
    channels: Mutex<Vec<Arc<RecordedChannel>>>,
}

impl RecoveryRecord {
    pub(crate) fn add(&self, channel: Channel) -> Arc<RecordedChannel> {
        let recorded = Arc::new(RecordedChannel::new(channel));
        let mut channels = self.channels.lock();
        channels.push(recorded.clone());
        channels.sort_by_key(|c| c.id());
        recorded
    }

    pub(crate) fn remove(&self, recorded: &Arc<RecordedChannel>) -> bool {
        let mut channels = self.channels.lock();
        let before = channels.len();
        channels.retain(|c| !Arc::ptr_eq(c, recorded));
        channels.len() != before
    }

    /// Forget every channel, returning their last numbers.
    pub(crate) fn clear(&self) -> Vec<ChannelId> {
        self.channels.lock().drain(..).map(|c| c.id()).collect()
    }

    pub(crate) fn channels(&self) -> Vec<Arc<RecordedChannel>> {
        self.channels.lock().clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.channels.lock().len()
    }

    /// Lowest number no recorded channel uses, for the temporary replay channel.
    pub(crate) fn free_number(&self, channel_max: ChannelId) -> Option<ChannelId> {
        let used: Vec<_> = self.channels.lock().iter().map(|c| c.id()).collect();
        (1..=channel_max).find(|id| !used.contains(id))
    }

    /// Keep numbers ascending after a channel was reopened elsewhere.
    pub(crate) fn resort(&self) {
        self.channels.lock().sort_by_key(|c| c.id());
    }
}
