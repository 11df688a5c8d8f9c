//! In-memory framed transport.
//!
//! The client half is a regular [`FramedTransport`]; the other half ([`MemoryPeer`]) plays the
//! broker's socket. Dropping every peer sender looks like an orderly EOF to the client.

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use tokio::sync::mpsc;
use warren_primitives::{Frame, FrameReader, FrameWriter, FramedTransport};

/// What the client's reader sees next: a frame or a transport error.
pub type Inbound = io::Result<Frame>;

/// Client read half.
#[derive(Debug)]
pub struct MemoryReader {
    rx: mpsc::UnboundedReceiver<Inbound>,
}

#[async_trait]
impl FrameReader for MemoryReader {
    async fn read_frame(&mut self) -> io::Result<Option<Frame>> {
        match self.rx.recv().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

/// Client write half.
#[derive(Debug)]
pub struct MemoryWriter {
    tx: Option<mpsc::UnboundedSender<Frame>>,
    faults: Faults,
}

#[async_trait]
impl FrameWriter for MemoryWriter {
    async fn write_frame(&mut self, frame: Frame) -> io::Result<()> {
        if self.faults.fail_writes.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "injected write failure"));
        }
        let Some(tx) = &self.tx else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "writer closed"));
        };
        tx.send(frame)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer went away"))
    }

    async fn close(&mut self) -> io::Result<()> {
        self.faults.writer_closed.store(true, Ordering::Release);
        self.tx = None;
        if self.faults.fail_close.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "injected close failure"));
        }
        Ok(())
    }
}

/// Switches shared between the client's writer and the peer.
#[derive(Debug, Clone, Default)]
pub struct Faults {
    fail_writes: Arc<AtomicBool>,
    fail_close: Arc<AtomicBool>,
    writer_closed: Arc<AtomicBool>,
}

impl Faults {
    /// Make every subsequent client write fail.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }

    /// Make the client's final `close` of the writer fail.
    pub fn fail_close(&self, fail: bool) {
        self.fail_close.store(fail, Ordering::Release);
    }

    /// Whether the client released its write half.
    pub fn writer_closed(&self) -> bool {
        self.writer_closed.load(Ordering::Acquire)
    }
}

/// The broker's end of a memory transport.
#[derive(Debug)]
pub struct MemoryPeer {
    /// Frames (or errors) delivered to the client's reader.
    pub tx: mpsc::UnboundedSender<Inbound>,
    /// Frames written by the client.
    pub rx: mpsc::UnboundedReceiver<Frame>,
    pub faults: Faults,
}

/// Create a connected client transport and its peer.
pub fn memory_transport() -> (FramedTransport, MemoryPeer) {
    let (to_client, client_rx) = mpsc::unbounded_channel();
    let (client_tx, from_client) = mpsc::unbounded_channel();
    let faults = Faults::default();
    let transport = FramedTransport::new(
        MemoryReader { rx: client_rx },
        MemoryWriter {
            tx: Some(client_tx),
            faults: faults.clone(),
        },
    );
    let peer = MemoryPeer {
        tx: to_client,
        rx: from_client,
        faults,
    };
    (transport, peer)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use warren_primitives::Method;

    use super::*;

    #[tokio::test]
    async fn test_frames_cross_both_ways() {
        let (mut transport, mut peer) = memory_transport();

        transport
            .writer
            .write_frame(Frame::method(1, Method::ChannelOpen))
            .await
            .unwrap();
        assert_eq!(peer.rx.recv().await, Some(Frame::method(1, Method::ChannelOpen)));

        peer.tx.send(Ok(Frame::Heartbeat)).unwrap();
        assert_eq!(transport.reader.read_frame().await.unwrap(), Some(Frame::Heartbeat));

        drop(peer);
        assert_eq!(transport.reader.read_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let (mut transport, peer) = memory_transport();

        peer.faults.fail_writes(true);
        assert_matches!(transport.writer.write_frame(Frame::Heartbeat).await, Err(e) if e.kind() == io::ErrorKind::BrokenPipe);

        peer.tx
            .send(Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")))
            .unwrap();
        assert_matches!(transport.reader.read_frame().await, Err(e) if e.kind() == io::ErrorKind::ConnectionReset);

        transport.writer.close().await.unwrap();
        assert!(peer.faults.writer_closed());
    }
}
