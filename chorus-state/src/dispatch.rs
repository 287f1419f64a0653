//! Callback channels with replay-on-subscribe.
//!
//! Five channels fan engine events out to application handlers:
//!
//! ```text
//! on(channel, handler)
//!       │  append registration, mark "awaiting replay"
//!       ▼
//! engine queue ── Replay { channel, handler } ──┐
//!                                               ▼
//!                        handler still registered?
//!                          no  → nothing (off() won the race)
//!                          yes → clear flag, deliver current mirror
//!
//! live event ──► every registration on the channel,
//!                skipping those still awaiting replay
//! ```
//!
//! The deferral means `on` never invokes the handler inside the caller's
//! stack, and the awaiting flag means a handler never observes a live
//! event older than its replay — the mirror content is computed when the
//! replay task actually runs, so nothing suppressed in between is lost.
//!
//! Registrations are identified by `Arc` pointer, so the same closure
//! allocation can be registered once and removed precisely. All
//! bookkeeping here is synchronous; the owner collects [`Delivery`]
//! values under its lock and invokes them after releasing it, which lets
//! handlers reenter the public API.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{ErrorSink, StateError};
use crate::readystate::ReadyState;

// ───────────────────────────────────────────────────────────────────
// Channels and events
// ───────────────────────────────────────────────────────────────────

/// Subscription channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// A key was added to or updated in the shared state.
    Change,
    /// A key was removed from the shared state.
    Remove,
    /// An agent's presence changed.
    Presence,
    /// The connection lifecycle moved.
    ReadyStateChange,
    /// Terminator fired once after every applied remote batch.
    ChangeSet,
}

impl Channel {
    pub const ALL: [Channel; 5] = [
        Channel::Change,
        Channel::Remove,
        Channel::Presence,
        Channel::ReadyStateChange,
        Channel::ChangeSet,
    ];

    /// Canonical lowercase name, also accepted by `from_str`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Change => "change",
            Channel::Remove => "remove",
            Channel::Presence => "presence",
            Channel::ReadyStateChange => "readystatechange",
            Channel::ChangeSet => "changeset",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "change" => Ok(Channel::Change),
            "remove" => Ok(Channel::Remove),
            "presence" => Ok(Channel::Presence),
            "readystatechange" => Ok(Channel::ReadyStateChange),
            "changeset" => Ok(Channel::ChangeSet),
            other => Err(StateError::UnsupportedChannel(other.to_string())),
        }
    }
}

/// How a `change` event relates to the previous mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Key was absent before the batch.
    Add,
    /// Key existed with a different value.
    Update,
}

/// Payload delivered to subscribers, one variant per channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Change {
        key: String,
        value: Value,
        kind: ChangeKind,
    },
    /// Carries the last value the key held.
    Remove { key: String, value: Value },
    /// `None` means the agent's presence was cleared.
    Presence {
        agent_id: String,
        value: Option<String>,
    },
    ReadyStateChange(ReadyState),
    ChangeSet,
}

impl Event {
    /// The channel this event is delivered on.
    pub fn channel(&self) -> Channel {
        match self {
            Event::Change { .. } => Channel::Change,
            Event::Remove { .. } => Channel::Remove,
            Event::Presence { .. } => Channel::Presence,
            Event::ReadyStateChange(_) => Channel::ReadyStateChange,
            Event::ChangeSet => Channel::ChangeSet,
        }
    }
}

/// Subscriber callback.
///
/// Invoked on the engine task (and once more, for the final `Closed`
/// notification, on the thread that calls `destroy`). Panics are caught
/// per invocation and reported as [`StateError::HandlerFault`].
pub type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

// ───────────────────────────────────────────────────────────────────
// Registry
// ───────────────────────────────────────────────────────────────────

struct Registration {
    callback: Handler,
    /// Set between `on` and the replay delivery. Live fan-out skips the
    /// handler while this holds.
    awaiting_replay: bool,
}

/// A planned handler invocation, built under the owner's lock and run
/// outside it.
pub struct Delivery {
    handler: Handler,
    channel: Channel,
    event: Event,
}

/// Per-channel subscriber registries.
pub struct Dispatcher {
    slots: [Vec<Registration>; 5],
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| Vec::new()),
        }
    }

    /// Register a handler. Returns `false` when the same `Arc` is already
    /// registered on the channel (the call is then a complete no-op, and
    /// no replay should be scheduled for it).
    pub fn subscribe(&mut self, channel: Channel, handler: &Handler, replay: bool) -> bool {
        let slot = &mut self.slots[channel.index()];
        if slot.iter().any(|r| Arc::ptr_eq(&r.callback, handler)) {
            return false;
        }
        slot.push(Registration {
            callback: handler.clone(),
            awaiting_replay: replay,
        });
        true
    }

    /// Remove a handler by pointer identity. Unknown handlers are ignored.
    pub fn unsubscribe(&mut self, channel: Channel, handler: &Handler) {
        self.slots[channel.index()].retain(|r| !Arc::ptr_eq(&r.callback, handler));
    }

    /// Drop every registration on every channel.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            slot.clear();
        }
    }

    pub fn subscriber_count(&self, channel: Channel) -> usize {
        self.slots[channel.index()].len()
    }

    /// Plan fan-out of one live event: every subscriber on its channel in
    /// registration order, skipping those still awaiting their replay.
    pub fn live(&self, event: &Event) -> Vec<Delivery> {
        let channel = event.channel();
        self.slots[channel.index()]
            .iter()
            .filter(|r| !r.awaiting_replay)
            .map(|r| Delivery {
                handler: r.callback.clone(),
                channel,
                event: event.clone(),
            })
            .collect()
    }

    /// Plan fan-out of a whole event sequence, preserving order.
    pub fn live_all(&self, events: &[Event]) -> Vec<Delivery> {
        let mut deliveries = Vec::new();
        for event in events {
            deliveries.extend(self.live(event));
        }
        deliveries
    }

    /// Plan a replay for one handler.
    ///
    /// Checks that the handler is still registered — `off` between the
    /// `on` call and this point suppresses the replay entirely — then
    /// clears its awaiting flag and targets every supplied event at it.
    /// The flag is cleared even when `events` is empty, so a handler
    /// registered against an empty mirror starts receiving live events.
    pub fn replay(
        &mut self,
        channel: Channel,
        target: &Handler,
        events: Vec<Event>,
    ) -> Vec<Delivery> {
        let slot = &mut self.slots[channel.index()];
        let registration = match slot.iter_mut().find(|r| Arc::ptr_eq(&r.callback, target)) {
            Some(r) => r,
            None => return Vec::new(),
        };
        registration.awaiting_replay = false;
        events
            .into_iter()
            .map(|event| Delivery {
                handler: target.clone(),
                channel,
                event,
            })
            .collect()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

// ───────────────────────────────────────────────────────────────────
// Invocation
// ───────────────────────────────────────────────────────────────────

/// Invoke planned deliveries in order.
///
/// Each handler call is unwind-isolated: a panicking subscriber is
/// reported to the error sink and the remaining deliveries still run.
pub fn run(deliveries: Vec<Delivery>, errors: &ErrorSink) {
    for delivery in deliveries {
        let result = catch_unwind(AssertUnwindSafe(|| {
            (delivery.handler)(&delivery.event);
        }));
        if let Err(payload) = result {
            errors(&StateError::HandlerFault {
                channel: delivery.channel,
                reason: panic_reason(payload),
            });
        }
    }
}

fn panic_reason(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ===================================================================
// Tests
// ===================================================================
