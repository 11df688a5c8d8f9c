//! Channel number allocation and lookup.

use std::collections::BTreeMap;

use warren_primitives::ChannelId;

use crate::error::ConnectionError;

/// Table of live channels keyed by number.
///
/// Numbers run from 1 to `channel_max`; 0 is the control channel. Allocation always hands out
/// the lowest free number. A number is only freed by [`ChannelTable::release`], once the close
/// handshake for that channel has finished or the connection is torn down.
#[derive(Debug)]
pub(crate) struct ChannelTable<T> {
    channels: BTreeMap<ChannelId, T>,
    channel_max: ChannelId,
}

impl<T: Clone> ChannelTable<T> {
    pub(crate) fn new(channel_max: ChannelId) -> Self {
        Self {
            channels: BTreeMap::new(),
            channel_max,
        }
    }

    pub(crate) fn channel_max(&self) -> ChannelId {
        self.channel_max
    }

    /// Reserve `requested`, or the lowest free number when `None`, for `make(id)`.
    pub(crate) fn allocate(
        &mut self,
        requested: Option<ChannelId>,
        make: impl FnOnce(ChannelId) -> T,
    ) -> Result<(ChannelId, T), ConnectionError> {
        let id = match requested {
            Some(id) if id == 0 || id > self.channel_max => {
                return Err(ConnectionError::ChannelOutOfRange {
                    requested: id,
                    max: self.channel_max,
                });
            }
            Some(id) if self.channels.contains_key(&id) => {
                return Err(ConnectionError::ChannelInUse(id));
            }
            Some(id) => id,
            None => self.lowest_free().ok_or(ConnectionError::ChannelLimitExceeded {
                max: self.channel_max,
            })?,
        };
        let value = make(id);
        self.channels.insert(id, value.clone());
        Ok((id, value))
    }

    /// First gap in the sorted key sequence starting at 1.
    fn lowest_free(&self) -> Option<ChannelId> {
        let mut candidate: ChannelId = 1;
        for &id in self.channels.keys() {
            if id != candidate {
                break;
            }
            candidate = candidate.checked_add(1)?;
        }
        (candidate <= self.channel_max).then_some(candidate)
    }

    pub(crate) fn get(&self, id: ChannelId) -> Option<T> {
        self.channels.get(&id).cloned()
    }

    pub(crate) fn release(&mut self, id: ChannelId) -> Option<T> {
        self.channels.remove(&id)
    }

    /// Remove every channel, in number order.
    pub(crate) fn drain(&mut self) -> Vec<T> {
        std::mem::take(&mut self.channels).into_values().collect()
    }

    pub(crate) fn ids(&self) -> Vec<ChannelId> {
        self.channels.keys().copied().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.channels.len()
    }
}
