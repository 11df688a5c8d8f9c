//! Heartbeat monitor.
//!
//! Two timers driven by one ticker: a heartbeat frame goes out after `h` of outbound
//! silence, and [`MISSED_HEARTBEAT_MULTIPLIER`]` × h` of inbound silence declares the peer
//! dead. Any frame in either direction resets the matching timer.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{trace, warn};
use warren_primitives::Frame;

use crate::io::Outlet;

/// Intervals of inbound silence tolerated before the connection is considered dead.
pub const MISSED_HEARTBEAT_MULTIPLIER: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HeartbeatCheck {
    Idle,
    SendHeartbeat,
    Dead { silence: Duration },
}

#[derive(Debug)]
pub(crate) struct HeartbeatMonitor {
    interval: Duration,
    epoch: Instant,
    /// Milliseconds since `epoch`.
    last_sent: AtomicU64,
    last_received: AtomicU64,
}

impl HeartbeatMonitor {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            interval,
            epoch: Instant::now(),
            last_sent: AtomicU64::new(0),
            last_received: AtomicU64::new(0),
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        !self.interval.is_zero()
    }

    pub(crate) fn interval(&self) -> Duration {
        self.interval
    }

    pub(crate) fn mark_sent(&self) {
        self.last_sent.store(self.elapsed_ms(Instant::now()), Ordering::Relaxed);
    }

    pub(crate) fn mark_received(&self) {
        self.last_received
            .store(self.elapsed_ms(Instant::now()), Ordering::Relaxed);
    }

    pub(crate) fn check_at(&self, now: Instant) -> HeartbeatCheck {
        if !self.is_enabled() {
            return HeartbeatCheck::Idle;
        }
        let now_ms = self.elapsed_ms(now);
        let inbound_silence =
            Duration::from_millis(now_ms.saturating_sub(self.last_received.load(Ordering::Relaxed)));
        if inbound_silence >= self.interval * MISSED_HEARTBEAT_MULTIPLIER {
            return HeartbeatCheck::Dead {
                silence: inbound_silence,
            };
        }
        let outbound_silence =
            Duration::from_millis(now_ms.saturating_sub(self.last_sent.load(Ordering::Relaxed)));
        if outbound_silence >= self.interval {
            HeartbeatCheck::SendHeartbeat
        } else {
            HeartbeatCheck::Idle
        }
    }

    fn elapsed_ms(&self, now: Instant) -> u64 {
        u64::try_from(now.saturating_duration_since(self.epoch).as_millis()).unwrap_or(u64::MAX)
    }
}

/// Drive the monitor until the peer goes silent or the writer goes away.
///
/// Returns the observed inbound silence when the peer is declared dead.
pub(crate) async fn run(monitor: &HeartbeatMonitor, outlet: &Outlet) -> Option<Duration> {
    let mut ticker = interval(monitor.interval() / 2);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        match monitor.check_at(Instant::now()) {
            HeartbeatCheck::Idle => {}
            HeartbeatCheck::SendHeartbeat => {
                trace!("Sending heartbeat");
                if outlet.send_one(Frame::Heartbeat).is_err() {
                    return None;
                }
            }
            HeartbeatCheck::Dead { silence } => {
                warn!(?silence, interval = ?monitor.interval(), "Missed heartbeats from server");
                return Some(silence);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::io::Outbound;

    #[tokio::test(start_paused = true)]
    async fn test_check_timers() {
        let monitor = HeartbeatMonitor::new(Duration::from_secs(10));
        let start = Instant::now();

        assert_eq!(monitor.check_at(start), HeartbeatCheck::Idle);
        assert_eq!(
            monitor.check_at(start + Duration::from_secs(10)),
            HeartbeatCheck::SendHeartbeat
        );

        tokio::time::advance(Duration::from_secs(15)).await;
        monitor.mark_received();
        monitor.mark_sent();
        assert_eq!(monitor.check_at(Instant::now()), HeartbeatCheck::Idle);

        assert_matches!(
            monitor.check_at(Instant::now() + Duration::from_secs(20)),
            HeartbeatCheck::Dead { silence } if silence == Duration::from_secs(20)
        );
    }

    #[test]
    fn test_disabled_monitor_is_idle() {
        let monitor = HeartbeatMonitor::new(Duration::ZERO);
        assert!(!monitor.is_enabled());
        assert_eq!(
            monitor.check_at(Instant::now() + Duration::from_secs(3600)),
            HeartbeatCheck::Idle
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_sends_heartbeats_then_declares_dead() {
        let monitor = HeartbeatMonitor::new(Duration::from_secs(2));
        let (outlet, mut rx) = Outlet::new();

        let silence = run(&monitor, &outlet).await;

        assert_matches!(silence, Some(s) if s >= Duration::from_secs(4));
        assert_matches!(rx.try_recv(), Ok(Outbound::Frames(frames)) if frames == vec![Frame::Heartbeat]);
    }
}
