//! Outbound frame queue and the writer task.
//!
//! All writes go through one unbounded queue drained by a single writer task, so frames
//! submitted together (a publish's method, header and body frames) reach the transport
//! back-to-back and in submission order.

use std::{io, sync::Arc};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};
use warren_primitives::{Frame, FrameWriter};

use crate::{heartbeat::HeartbeatMonitor, metrics::ConnectionMetrics};

#[derive(Debug)]
pub(crate) enum Outbound {
    /// Frames written back-to-back, then flushed.
    Frames(Vec<Frame>),
    /// Close the transport once everything queued before it is written.
    Close(oneshot::Sender<io::Result<()>>),
}

/// Sending half of the outbound queue.
#[derive(Clone, Debug)]
pub(crate) struct Outlet {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl Outlet {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub(crate) fn send(&self, frames: Vec<Frame>) -> io::Result<()> {
        self.tx
            .send(Outbound::Frames(frames))
            .map_err(|_| writer_stopped())
    }

    pub(crate) fn send_one(&self, frame: Frame) -> io::Result<()> {
        self.send(vec![frame])
    }

    /// Ask the writer to close the transport and wait for the outcome.
    pub(crate) async fn close(&self) -> io::Result<()> {
        let (done, rx) = oneshot::channel();
        if self.tx.send(Outbound::Close(done)).is_err() {
            // Writer already exited and released the transport.
            return Ok(());
        }
        rx.await.unwrap_or(Ok(()))
    }
}

fn writer_stopped() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "connection writer stopped")
}

/// Drain the outbound queue into the transport.
///
/// Returns the write error that stopped the task, or `None` after an orderly close.
pub(crate) async fn run_writer(
    mut writer: Box<dyn FrameWriter>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    heartbeat: Arc<HeartbeatMonitor>,
    metrics: ConnectionMetrics,
) -> Option<io::Error> {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            Outbound::Frames(frames) => {
                if let Err(e) = write_batch(writer.as_mut(), frames, &heartbeat, &metrics).await {
                    debug!(error = %e, "Write failed");
                    let _ = writer.close().await;
                    return Some(e);
                }
            }
            Outbound::Close(done) => {
                let result = writer.close().await;
                debug!(ok = result.is_ok(), "Transport closed");
                let _ = done.send(result);
                return None;
            }
        }
    }
    let _ = writer.close().await;
    None
}

async fn write_batch(
    writer: &mut dyn FrameWriter,
    frames: Vec<Frame>,
    heartbeat: &HeartbeatMonitor,
    metrics: &ConnectionMetrics,
) -> io::Result<()> {
    for frame in frames {
        trace!(channel = frame.channel(), frame = %frame.describe(), "Sending frame");
        writer.write_frame(frame).await?;
        metrics.frames_sent_total.increment(1);
    }
    writer.flush().await?;
    heartbeat.mark_sent();
    Ok(())
}
