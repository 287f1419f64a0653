//! Connection readiness lifecycle.
//!
//! ```text
//!             link up + joined            destroy()
//! Connecting ─────────────────► Open ─────────────► Closed
//!     ▲                          │                    ▲
//!     └──────────────────────────┘                    │
//!             link lost                  destroy() ───┘
//! ```
//!
//! A dropped link never closes the handle — it falls back to `Connecting`
//! while the transport redials. `Closed` is reserved for deliberate
//! teardown and is final: once entered, every further transition request
//! is ignored.

use std::fmt;
use std::str::FromStr;

use crate::error::StateError;

/// Connection readiness as observed through `readystatechange` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadyState {
    /// Link down or handshake in progress. Reads serve the last mirror;
    /// writes are rejected.
    Connecting,
    /// Handshake complete. Writes are accepted.
    Open,
    /// Torn down by `destroy`. Final.
    Closed,
}

impl ReadyState {
    /// Canonical lowercase name, also accepted by `from_str`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadyState::Connecting => "connecting",
            ReadyState::Open => "open",
            ReadyState::Closed => "closed",
        }
    }
}

impl fmt::Display for ReadyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReadyState {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connecting" => Ok(ReadyState::Connecting),
            "open" => Ok(ReadyState::Open),
            "closed" => Ok(ReadyState::Closed),
            other => Err(StateError::IllegalArgument(format!(
                "illegal readystate value: {other}"
            ))),
        }
    }
}

/// Transition cell guarding the lifecycle rules.
///
/// All state changes go through [`set`](ReadyStateCell::set), which reports
/// whether a transition actually committed so the owner can emit exactly
/// one `readystatechange` per change.
#[derive(Debug)]
pub struct ReadyStateCell {
    current: ReadyState,
}

impl ReadyStateCell {
    pub fn new() -> Self {
        Self {
            current: ReadyState::Connecting,
        }
    }

    pub fn get(&self) -> ReadyState {
        self.current
    }

    /// Request a transition. Returns the committed state, or `None` when
    /// the request was suppressed (same state, or already `Closed`).
    pub fn set(&mut self, next: ReadyState) -> Option<ReadyState> {
        if self.current == ReadyState::Closed || self.current == next {
            return None;
        }
        self.current = next;
        Some(next)
    }
}

impl Default for ReadyStateCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_connecting() {
        let cell = ReadyStateCell::new();
        assert_eq!(cell.get(), ReadyState::Connecting);
    }

    #[test]
    fn test_transition_reports_new_state() {
        let mut cell = ReadyStateCell::new();
        assert_eq!(cell.set(ReadyState::Open), Some(ReadyState::Open));
        assert_eq!(cell.get(), ReadyState::Open);
    }

    #[test]
    fn test_same_state_suppressed() {
        let mut cell = ReadyStateCell::new();
        cell.set(ReadyState::Open);
        assert_eq!(cell.set(ReadyState::Open), None);
        assert_eq!(cell.get(), ReadyState::Open);
    }

    #[test]
    fn test_open_back_to_connecting() {
        let mut cell = ReadyStateCell::new();
        cell.set(ReadyState::Open);
        assert_eq!(
            cell.set(ReadyState::Connecting),
            Some(ReadyState::Connecting)
        );
    }

    #[test]
    fn test_closed_is_final() {
        let mut cell = ReadyStateCell::new();
        cell.set(ReadyState::Open);
        assert_eq!(cell.set(ReadyState::Closed), Some(ReadyState::Closed));

        // No way back out
        assert_eq!(cell.set(ReadyState::Open), None);
        assert_eq!(cell.set(ReadyState::Connecting), None);
        assert_eq!(cell.get(), ReadyState::Closed);
    }

    #[test]
    fn test_string_roundtrip() {
        for state in [ReadyState::Connecting, ReadyState::Open, ReadyState::Closed] {
            assert_eq!(state.as_str().parse::<ReadyState>().unwrap(), state);
        }
    }

    #[test]
    fn test_unknown_name_rejected() {
        let err = "offline".parse::<ReadyState>().unwrap_err();
        assert!(matches!(err, StateError::IllegalArgument(_)));
    }

    #[test]
    fn test_display() {
        assert_eq!(ReadyState::Connecting.to_string(), "connecting");
        assert_eq!(ReadyState::Open.to_string(), "open");
        assert_eq!(ReadyState::Closed.to_string(), "closed");
    }
}
