//! Broker-driven flow control.
//!
//! `connection.blocked` closes the gate and `connection.unblocked` opens it. While closed,
//! channel writes are accepted and queued in call order; opening the gate hands them to the
//! writer before anything submitted afterwards. Control frames on channel 0 (heartbeats,
//! close handshake) bypass the gate.
//!
//! Every channel frame is held, not only publishes: writes are never reordered, so a
//! `queue.declare` or `basic.ack` issued after a held publish waits behind it. A synchronous
//! request made while blocked therefore completes after unblock or fails with
//! [`ConnectionError::RpcTimeout`](crate::ConnectionError::RpcTimeout).

use std::{collections::VecDeque, io};

use parking_lot::Mutex;
use warren_primitives::Frame;

use crate::io::Outlet;

#[derive(Debug, Default)]
struct GateState {
    blocked: Option<String>,
    held: VecDeque<Vec<Frame>>,
}

#[derive(Debug, Default)]
pub(crate) struct FlowGate {
    state: Mutex<GateState>,
}

/// What happened to a submitted batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Submitted {
    Sent,
    Held,
}

impl FlowGate {
    /// Write `frames` now, or queue them if the gate is closed.
    pub(crate) fn submit(&self, frames: Vec<Frame>, outlet: &Outlet) -> io::Result<Submitted> {
        let mut state = self.state.lock();
        if state.blocked.is_some() {
            state.held.push_back(frames);
            return Ok(Submitted::Held);
        }
        // Sent under the lock so an unblock drain cannot interleave.
        outlet.send(frames)?;
        Ok(Submitted::Sent)
    }

    /// Close the gate. Returns false if it was already closed.
    pub(crate) fn block(&self, reason: String) -> bool {
        let mut state = self.state.lock();
        let was_open = state.blocked.is_none();
        state.blocked = Some(reason);
        was_open
    }

    /// Open the gate and flush held writes in order.
    ///
    /// Returns the number of flushed batches, or `None` if the gate was already open.
    pub(crate) fn unblock(&self, outlet: &Outlet) -> io::Result<Option<usize>> {
        let mut state = self.state.lock();
        if state.blocked.take().is_none() {
            return Ok(None);
        }
        let flushed = state.held.len();
        while let Some(frames) = state.held.pop_front() {
            outlet.send(frames)?;
        }
        Ok(Some(flushed))
    }

    pub(crate) fn is_blocked(&self) -> bool {
        self.state.lock().blocked.is_some()
    }

    pub(crate) fn blocked_reason(&self) -> Option<String> {
        self.state.lock().blocked.clone()
    }

    /// Drop held writes at teardown. Returns how many batches were discarded.
    pub(crate) fn discard(&self) -> usize {
        let mut state = self.state.lock();
        let discarded = state.held.len();
        state.held.clear();
        discarded
    }
}
