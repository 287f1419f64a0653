//! # chorus-state — Client library for server-authoritative shared state
//!
//! Keeps a local mirror of a shared key/value dictionary plus per-agent
//! presence, synchronized over a persistent WebSocket session. The
//! server owns the data; every local write is a request, and the mirror
//! only moves when the authoritative echo comes back.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   JSON frames    ┌──────────────┐
//! │ SharedState  │ ◄──────────────► │ state server │
//! │ (per agent)  │    WebSocket     │ (authority)  │
//! └──────┬───────┘                  └──────────────┘
//!        │ engine task (one FIFO queue)
//!        ▼
//! ┌──────────────┐    ┌──────────────┐    ┌──────────────┐
//! │ StateStore   │    │ PresenceStore│    │ Dispatcher   │
//! │ (mirror+diff)│    │ (agents)     │    │ (5 channels) │
//! └──────────────┘    └──────────────┘    └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`client`] — session handle: handshake, writes, subscriptions
//! - [`readystate`] — connection lifecycle cell (`Connecting`/`Open`/`Closed`)
//! - [`dispatch`] — callback channels with replay for late subscribers
//! - [`store`] — mirror stores and the batch diff engine
//! - [`protocol`] — JSON wire frames and payloads
//! - [`transport`] — WebSocket link with reconnection, in-memory test link
//! - [`error`] — error taxonomy and the error sink
//!
//! ## Performance Targets
//!
//! | Metric | Target |
//! |--------|--------|
//! | Frame encode/decode | <2µs |
//! | Apply 100-entry batch | <100µs |
//! | Fan-out to 100 handlers | <50µs |
//! | Replay 1K-key mirror | <1ms |

pub mod client;
pub mod dispatch;
pub mod error;
pub mod protocol;
pub mod readystate;
pub mod store;
pub mod transport;

// Re-exports for convenience
pub use client::{LogSink, SharedState, StateConfig};
pub use dispatch::{Channel, ChangeKind, Dispatcher, Event, Handler};
pub use error::{ErrorSink, StateError};
pub use protocol::{ChangeItem, ChangeOp, Frame, ProtocolError};
pub use readystate::{ReadyState, ReadyStateCell};
pub use store::{PresenceStore, StateStore};
pub use transport::ws::WsOptions;
pub use transport::{PeerEnd, Transport, TransportEvent};
