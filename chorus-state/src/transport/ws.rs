//! WebSocket link with automatic reconnection.
//!
//! One supervisor task owns the socket for the lifetime of the link:
//!
//! ```text
//! supervise ── dial ──► pump (socket live)
//!     ▲                   │ socket lost → Down, backoff, redial
//!     │                   │ handle closed → shut down for good
//!     └── sleep(backoff) ◄┘
//! ```
//!
//! While the link is down the supervisor keeps draining the outbound
//! queue and drops every frame, so a sender never blocks on a dead
//! socket. Pending request acks die with their socket; the reply
//! receivers error out and callers retry after the next `Up`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::{OutboundItem, Transport, TransportEvent};
use crate::protocol::Frame;

/// Reconnection tuning for [`connect`].
#[derive(Debug, Clone)]
pub struct WsOptions {
    /// Redial after a lost socket. When off, the first loss is final.
    pub reconnection: bool,
    /// First retry delay; doubles per attempt.
    pub reconnect_initial: Duration,
    /// Cap for the doubled delay.
    pub reconnect_max: Duration,
}

impl Default for WsOptions {
    fn default() -> Self {
        Self {
            reconnection: true,
            reconnect_initial: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(30),
        }
    }
}

/// Open a supervised WebSocket link.
///
/// Returns immediately; the dial happens on a background task and the
/// first [`TransportEvent::Up`] reports success. Must be called within
/// a Tokio runtime.
pub fn connect(url: &str, options: WsOptions) -> Transport {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let connected = Arc::new(AtomicBool::new(false));
    tokio::spawn(supervise(
        url.to_string(),
        options,
        out_rx,
        event_tx,
        connected.clone(),
    ));
    Transport::from_parts(out_tx, event_rx, connected)
}

enum PumpEnd {
    SocketLost,
    HandleClosed,
}

async fn supervise(
    url: String,
    options: WsOptions,
    mut out_rx: mpsc::UnboundedReceiver<OutboundItem>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    connected: Arc<AtomicBool>,
) {
    let mut backoff = options.reconnect_initial;

    loop {
        // Drain outbound traffic during the dial too: a frame queued
        // here would otherwise ride out on the fresh socket ahead of
        // that session's join. A closed handle ends the supervisor
        // mid-dial.
        let dial = connect_async(&url);
        tokio::pin!(dial);
        let dialed = loop {
            tokio::select! {
                result = &mut dial => break result,
                item = out_rx.recv() => match item {
                    Some(OutboundItem::Frame { frame, .. }) => {
                        log::debug!("Dropping {} frame while link is down", frame.event);
                    }
                    Some(OutboundItem::Shutdown) | None => return,
                },
            }
        };

        match dialed {
            Ok((socket, _response)) => {
                log::info!("Link to {url} established");
                backoff = options.reconnect_initial;
                connected.store(true, Ordering::SeqCst);
                let _ = event_tx.send(TransportEvent::Up);

                let end = pump(socket, &mut out_rx, &event_tx).await;
                connected.store(false, Ordering::SeqCst);

                match end {
                    PumpEnd::HandleClosed => return,
                    PumpEnd::SocketLost => {
                        log::warn!("Link to {url} lost");
                        let _ = event_tx.send(TransportEvent::Down);
                        if !options.reconnection {
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                log::warn!("Link dial to {url} failed: {e}");
                if !options.reconnection {
                    return;
                }
            }
        }

        // Wait out the backoff. Outbound traffic keeps flowing into the
        // queue meanwhile; frames sent while down are dropped, and a
        // closed handle ends the supervisor here too.
        log::debug!("Redialing {url} in {backoff:?}");
        let sleep = tokio::time::sleep(backoff);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                item = out_rx.recv() => match item {
                    Some(OutboundItem::Frame { frame, .. }) => {
                        log::debug!("Dropping {} frame while link is down", frame.event);
                    }
                    Some(OutboundItem::Shutdown) | None => return,
                },
            }
        }
        backoff = (backoff * 2).min(options.reconnect_max);
    }
}

/// Drive one live socket until it is lost or the handle closes.
async fn pump(
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    out_rx: &mut mpsc::UnboundedReceiver<OutboundItem>,
    event_tx: &mpsc::UnboundedSender<TransportEvent>,
) -> PumpEnd {
    let (mut sink, mut source) = socket.split();
    let mut pending: HashMap<u64, oneshot::Sender<Value>> = HashMap::new();

    loop {
        tokio::select! {
            item = out_rx.recv() => match item {
                Some(OutboundItem::Frame { frame, ack }) => {
                    let encoded = match frame.encode() {
                        Ok(text) => text,
                        Err(e) => {
                            log::error!("Dropping unencodable frame: {e}");
                            continue;
                        }
                    };
                    if let (Some(id), Some(tx)) = (frame.ack, ack) {
                        pending.insert(id, tx);
                    }
                    if sink.send(Message::Text(encoded.into())).await.is_err() {
                        return PumpEnd::SocketLost;
                    }
                }
                Some(OutboundItem::Shutdown) | None => {
                    let _ = sink.close().await;
                    return PumpEnd::HandleClosed;
                }
            },
            message = source.next() => match message {
                Some(Ok(Message::Text(text))) => match Frame::decode(&text) {
                    Ok(frame) => {
                        if let Some(id) = frame.ack {
                            if let Some(tx) = pending.remove(&id) {
                                let _ = tx.send(frame.data);
                                continue;
                            }
                        }
                        let _ = event_tx.send(TransportEvent::Frame(frame));
                    }
                    Err(e) => log::warn!("Discarding undecodable frame: {e}"),
                },
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    return PumpEnd::SocketLost;
                }
                Some(Ok(_)) => {} // binary/ping/pong: not part of the protocol
            },
        }
    }
}

// ===================================================================
// Tests
// ===================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_default_to_reconnecting() {
        let options = WsOptions::default();
        assert!(options.reconnection);
        assert_eq!(options.reconnect_initial, Duration::from_millis(500));
        assert_eq!(options.reconnect_max, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_connect_starts_down_and_closes_cleanly() {
        // Nothing listens on this port; the handle is still usable.
        let transport = connect(
            "ws://127.0.0.1:9",
            WsOptions {
                reconnection: false,
                ..WsOptions::default()
            },
        );
        assert!(!transport.is_connected());
        transport.close();
    }
}
