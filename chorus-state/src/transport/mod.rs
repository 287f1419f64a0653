//! Connection plumbing underneath the client.
//!
//! The engine never touches a socket. It owns a [`Transport`] handle and
//! consumes a stream of [`TransportEvent`]s:
//!
//! ```text
//!              emit / request            TransportEvent
//! engine ──────────────────────► link ────────────────► engine queue
//!                                 │
//!                 Up    socket established (again)
//!                 Down  socket lost, reconnect pending
//!                 Frame decoded inbound message
//! ```
//!
//! Contract:
//! - frames emitted while the link is down are dropped, not queued —
//!   the rejoin handshake rebuilds state after every `Up`
//! - `request` correlates one reply by ack id; pending requests die
//!   with the socket that carried them
//! - `close` is final: the link shuts down and no further event is
//!   delivered
//!
//! [`ws`] provides the production WebSocket link with reconnection;
//! [`Transport::pair`] provides an in-memory link driven directly by
//! tests.

pub mod ws;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::protocol::Frame;

/// Link lifecycle notifications interleaved with inbound frames.
#[derive(Debug)]
pub enum TransportEvent {
    /// Socket established; a join handshake should follow.
    Up,
    /// Socket lost; the link keeps reconnecting.
    Down,
    Frame(Frame),
}

pub(crate) enum OutboundItem {
    Frame {
        frame: Frame,
        ack: Option<oneshot::Sender<Value>>,
    },
    Shutdown,
}

// ───────────────────────────────────────────────────────────────────
// Handle
// ───────────────────────────────────────────────────────────────────

/// Engine-side handle of a link.
pub struct Transport {
    outbound: mpsc::UnboundedSender<OutboundItem>,
    events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    connected: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    next_ack: Arc<AtomicU64>,
}

impl Transport {
    pub(crate) fn from_parts(
        outbound: mpsc::UnboundedSender<OutboundItem>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        connected: Arc<AtomicBool>,
    ) -> Self {
        Self {
            outbound,
            events: Some(events),
            connected,
            closed: Arc::new(AtomicBool::new(false)),
            next_ack: Arc::new(AtomicU64::new(0)),
        }
    }

    /// In-memory link plus the far end that drives it. The peer starts
    /// down; call [`PeerEnd::go_up`] to simulate an established socket.
    pub fn pair() -> (Self, PeerEnd) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));
        let transport = Self::from_parts(out_tx, event_rx, connected.clone());
        let peer = PeerEnd {
            outbound: out_rx,
            events: event_tx,
            connected,
            pending: HashMap::new(),
        };
        (transport, peer)
    }

    /// Fire-and-forget send. Dropped silently once the link is closed
    /// or its driver is gone.
    pub fn emit(&self, frame: Frame) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if self
            .outbound
            .send(OutboundItem::Frame { frame, ack: None })
            .is_err()
        {
            log::debug!("Transport driver gone; outbound frame dropped");
        }
    }

    /// Send a frame tagged with a fresh ack id and return the receiver
    /// for its reply. The receiver errors when the link closes, the
    /// socket carrying the request is lost, or the link was already
    /// closed.
    pub fn request(&self, mut frame: Frame) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        if self.closed.load(Ordering::SeqCst) {
            return rx;
        }
        let id = self.next_ack.fetch_add(1, Ordering::SeqCst) + 1;
        frame.ack = Some(id);
        let _ = self.outbound.send(OutboundItem::Frame {
            frame,
            ack: Some(tx),
        });
        rx
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Take the inbound event stream. Yields once; the consumer owns it.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events.take()
    }

    /// Shut the link down for good.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.outbound.send(OutboundItem::Shutdown);
    }
}

// ───────────────────────────────────────────────────────────────────
// Test peer
// ───────────────────────────────────────────────────────────────────

/// Far end of an in-memory link: plays the server role in tests.
pub struct PeerEnd {
    outbound: mpsc::UnboundedReceiver<OutboundItem>,
    events: mpsc::UnboundedSender<TransportEvent>,
    connected: Arc<AtomicBool>,
    pending: HashMap<u64, oneshot::Sender<Value>>,
}

impl PeerEnd {
    /// Mark the link established and notify the engine.
    pub fn go_up(&self) {
        self.connected.store(true, Ordering::SeqCst);
        let _ = self.events.send(TransportEvent::Up);
    }

    /// Mark the link lost and notify the engine.
    pub fn go_down(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.events.send(TransportEvent::Down);
    }

    /// Next frame the engine sent, or `None` once the link was closed.
    /// Requests made via [`Transport::request`] surface here with their
    /// ack id set; answer them with [`PeerEnd::push`].
    pub async fn recv(&mut self) -> Option<Frame> {
        match self.outbound.recv().await? {
            OutboundItem::Frame { frame, ack } => {
                if let (Some(id), Some(tx)) = (frame.ack, ack) {
                    self.pending.insert(id, tx);
                }
                Some(frame)
            }
            OutboundItem::Shutdown => None,
        }
    }

    /// Deliver a frame to the engine. A frame whose ack id matches a
    /// pending request resolves that request instead of becoming an
    /// event.
    pub fn push(&mut self, frame: Frame) {
        if let Some(id) = frame.ack {
            if let Some(tx) = self.pending.remove(&id) {
                let _ = tx.send(frame.data);
                return;
            }
        }
        let _ = self.events.send(TransportEvent::Frame(frame));
    }
}

// ===================================================================
// Tests
// ===================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_pair_carries_frames_both_ways() {
        let (mut transport, mut peer) = Transport::pair();
        let mut events = transport.take_events().unwrap();

        peer.go_up();
        assert!(transport.is_connected());
        assert!(matches!(events.recv().await, Some(TransportEvent::Up)));

        transport.emit(Frame::new("ping", json!(1)));
        let frame = peer.recv().await.unwrap();
        assert_eq!(frame.event, "ping");

        peer.push(Frame::new("pong", json!(2)));
        match events.recv().await {
            Some(TransportEvent::Frame(frame)) => assert_eq!(frame.event, "pong"),
            other => panic!("Expected frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_request_resolves_on_matching_ack() {
        let (transport, mut peer) = Transport::pair();
        peer.go_up();

        let reply = transport.request(Frame::new("lookup", json!({"q": 1})));
        let frame = peer.recv().await.unwrap();
        let id = frame.ack.unwrap();

        let mut response = Frame::new("reply", json!({"answer": 42}));
        response.ack = Some(id);
        peer.push(response);

        assert_eq!(reply.await.unwrap(), json!({"answer": 42}));
    }

    #[tokio::test]
    async fn test_go_down_flips_connected_and_notifies() {
        let (mut transport, peer) = Transport::pair();
        let mut events = transport.take_events().unwrap();

        peer.go_up();
        peer.go_down();
        assert!(!transport.is_connected());

        assert!(matches!(events.recv().await, Some(TransportEvent::Up)));
        assert!(matches!(events.recv().await, Some(TransportEvent::Down)));
    }

    #[tokio::test]
    async fn test_close_ends_peer_stream() {
        let (transport, mut peer) = Transport::pair();
        transport.close();
        assert!(peer.recv().await.is_none());

        // Frames after close go nowhere
        transport.emit(Frame::new("late", json!(null)));
        assert!(peer.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_request_after_close_errors() {
        let (transport, _peer) = Transport::pair();
        transport.close();
        assert!(transport.request(Frame::new("lookup", json!(null))).await.is_err());
    }
}
