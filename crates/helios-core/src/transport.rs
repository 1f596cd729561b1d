//! Transport seam.
//!
//! The engine never touches sockets. A transport adapter (WebSocket server,
//! test harness, ...) implements [`Transport`] for each physical connection
//! and feeds the `Helios::on_*` callbacks.

use crate::error::TransportError;
use crate::message::Frame;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, watch};

/// Opaque identifier of one physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportHandle(u64);

impl TransportHandle {
    /// Allocate a process-unique handle.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transport#{}", self.0)
    }
}

/// Data supplied by the peer when the connection was opened.
#[derive(Debug, Clone, Default)]
pub struct Handshake {
    /// Recovery token from a previous session.
    pub recover: Option<String>,
    /// Remote address, for logging.
    pub remote_addr: Option<String>,
}

impl Handshake {
    pub fn recovering(token: impl Into<String>) -> Self {
        Self {
            recover: Some(token.into()),
            remote_addr: None,
        }
    }
}

/// One physical, full-duplex connection to a peer.
pub trait Transport: Send + Sync + 'static {
    fn handle(&self) -> TransportHandle;

    /// Queue a frame for sending. Must not block.
    fn send(&self, frame: Frame) -> Result<(), TransportError>;

    /// Ask the adapter to close the connection.
    fn close(&self, _code: u16, _reason: &str) {}
}

/// Why a transport was closed by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

/// Transport backed by an unbounded channel.
///
/// The adapter owns the receiving end and writes frames to the socket;
/// dropping the receiver makes further sends fail with `Closed`. Adapters
/// watch [`ChannelTransport::close_signal`] to learn when the engine wants
/// the socket closed.
#[derive(Debug)]
pub struct ChannelTransport {
    handle: TransportHandle,
    tx: mpsc::UnboundedSender<Frame>,
    closed: watch::Sender<Option<CloseReason>>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(None);
        (
            Self {
                handle: TransportHandle::next(),
                tx,
                closed,
            },
            rx,
        )
    }

    pub fn is_open(&self) -> bool {
        self.closed.borrow().is_none() && !self.tx.is_closed()
    }

    /// Resolves once the engine closes this transport.
    pub fn close_signal(&self) -> watch::Receiver<Option<CloseReason>> {
        self.closed.subscribe()
    }
}

impl Transport for ChannelTransport {
    fn handle(&self) -> TransportHandle {
        self.handle
    }

    fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if self.closed.borrow().is_some() {
            return Err(TransportError::Closed);
        }
        self.tx.send(frame).map_err(|_| TransportError::Closed)
    }

    fn close(&self, code: u16, reason: &str) {
        self.closed.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(CloseReason {
                code,
                reason: reason.to_string(),
            });
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_are_unique() {
        let a = TransportHandle::next();
        let b = TransportHandle::next();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_channel_transport_delivers_frames() {
        let (transport, mut rx) = ChannelTransport::new();
        transport.send(Frame::Text("hi".into())).unwrap();
        assert_eq!(rx.recv().await, Some(Frame::Text("hi".into())));
    }

    #[test]
    fn test_channel_transport_fails_after_close() {
        let (transport, _rx) = ChannelTransport::new();
        transport.close(1000, "bye");
        assert!(!transport.is_open());
        assert_eq!(
            transport.send(Frame::Text("late".into())),
            Err(TransportError::Closed)
        );
    }

    #[tokio::test]
    async fn test_close_signal_fires_once() {
        let (transport, _rx) = ChannelTransport::new();
        let mut signal = transport.close_signal();

        transport.close(4000, "superseded");
        transport.close(1000, "again");

        let reason = signal.wait_for(Option::is_some).await.unwrap().clone();
        assert_eq!(
            reason,
            Some(CloseReason {
                code: 4000,
                reason: "superseded".into()
            })
        );
    }

    #[test]
    fn test_channel_transport_fails_when_receiver_dropped() {
        let (transport, rx) = ChannelTransport::new();
        drop(rx);
        assert_eq!(
            transport.send(Frame::Binary(vec![1])),
            Err(TransportError::Closed)
        );
    }
}
