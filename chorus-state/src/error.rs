//! Crate-wide error taxonomy.
//!
//! Two delivery paths:
//! - argument and readiness violations return synchronously from the call
//!   that caused them;
//! - `Remote` and `HandlerFault` originate outside any caller's stack and
//!   are routed to the configured error sink instead of being raised.
//!
//! Nothing here is fatal. A failed write leaves the mirror untouched, and
//! the engine never tears itself down on error — only `destroy` does.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::dispatch::Channel;
use crate::readystate::ReadyState;

/// Consumer of engine-side failures. Defaults to `log::error!`.
pub type ErrorSink = Arc<dyn Fn(&StateError) + Send + Sync>;

#[derive(Debug, Error)]
pub enum StateError {
    /// A key, presence string, or readystate name failed validation.
    #[error("Illegal argument: {0}")]
    IllegalArgument(String),

    /// Unknown channel name given to a string-based subscription call.
    #[error("Unsupported callback channel: {0}")]
    UnsupportedChannel(String),

    /// A write was attempted while the connection was not open.
    #[error("Not possible: connection is {0}")]
    NotReady(ReadyState),

    /// Failure reported by the remote authority.
    #[error("Remote error: {0}")]
    Remote(Value),

    /// A subscriber panicked while handling an event. Caught per handler;
    /// delivery to the remaining subscribers continues.
    #[error("Handler fault on {channel}: {reason}")]
    HandlerFault { channel: Channel, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let e = StateError::IllegalArgument("key must not be empty".into());
        assert_eq!(e.to_string(), "Illegal argument: key must not be empty");

        let e = StateError::NotReady(ReadyState::Connecting);
        assert_eq!(e.to_string(), "Not possible: connection is connecting");

        let e = StateError::UnsupportedChannel("changes".into());
        assert_eq!(e.to_string(), "Unsupported callback channel: changes");
    }

    #[test]
    fn test_handler_fault_message() {
        let e = StateError::HandlerFault {
            channel: Channel::Change,
            reason: "boom".into(),
        };
        assert_eq!(e.to_string(), "Handler fault on change: boom");
    }
}
