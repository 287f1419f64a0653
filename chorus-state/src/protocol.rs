//! Wire protocol for the state-synchronization session.
//!
//! Every frame on the socket is one JSON object:
//!
//! ```text
//! { "event": "<name>", "data": <payload>, "ack": <id>? }
//! ```
//!
//! A session, from the client's side:
//!
//! ```text
//! client                                server
//!   │ join {agentID, sendInitState}       │
//!   │ ────────────────────────────────►   │
//!   │              joined {agentID, ...}  │
//!   │ ◄────────────────────────────────   │
//!   │ getInitState            (if needed) │
//!   │ ────────────────────────────────►   │
//!   │  initState [ {type, key, value} ]   │
//!   │ ◄────────────────────────────────   │
//!   │ changeState [ {type, key, value} ]  │
//!   │ ────────────────────────────────►   │
//!   │     changeState / status / ssError  │
//!   │ ◄────────────────────────────────   │
//! ```
//!
//! Provides:
//! - [`Frame`] — envelope with encode/decode and typed payload access
//! - [`ChangeItem`] / [`ChangeOp`] — entries of an outbound write batch
//! - [`JoinPayload`] / [`JoinedPayload`] / [`StatusPayload`] — handshake
//!   and presence payloads
//!
//! Field names follow the server's camelCase convention via serde
//! renames; the Rust side stays snake_case throughout.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Frame event names.
pub mod events {
    pub const JOIN: &str = "join";
    pub const JOINED: &str = "joined";
    pub const GET_INIT_STATE: &str = "getInitState";
    pub const INIT_STATE: &str = "initState";
    pub const GET_STATE: &str = "getState";
    pub const CHANGE_STATE: &str = "changeState";
    pub const CHANGE_PRESENCE: &str = "changePresence";
    pub const STATUS: &str = "status";
    pub const SS_ERROR: &str = "ssError";
}

/// Errors from frame serialization.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Frame encoding failed: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("Frame decoding failed: {0}")]
    Decode(#[source] serde_json::Error),
}

// ───────────────────────────────────────────────────────────────────
// Envelope
// ───────────────────────────────────────────────────────────────────

/// One message on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Frame {
    pub event: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    /// Correlates a request with its reply; absent on plain events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<u64>,
}

impl Frame {
    pub fn new(event: &str, data: Value) -> Self {
        Self {
            event: event.to_string(),
            data,
            ack: None,
        }
    }

    pub fn join(payload: &JoinPayload) -> Self {
        Self::new(
            events::JOIN,
            serde_json::to_value(payload).unwrap_or(Value::Null),
        )
    }

    pub fn get_init_state() -> Self {
        Self::new(events::GET_INIT_STATE, Value::Array(Vec::new()))
    }

    pub fn get_state() -> Self {
        Self::new(events::GET_STATE, Value::Array(Vec::new()))
    }

    pub fn change_state(items: &[ChangeItem]) -> Self {
        Self::new(
            events::CHANGE_STATE,
            serde_json::to_value(items).unwrap_or(Value::Null),
        )
    }

    pub fn change_presence(agent_id: &str, presence: &str) -> Self {
        let payload = ChangePresencePayload {
            agent_id: agent_id.to_string(),
            presence: presence.to_string(),
        };
        Self::new(
            events::CHANGE_PRESENCE,
            serde_json::to_value(&payload).unwrap_or(Value::Null),
        )
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(ProtocolError::Decode)
    }

    /// Parse `data` into a typed payload.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(self.data.clone()).map_err(ProtocolError::Decode)
    }
}

// ───────────────────────────────────────────────────────────────────
// Payloads
// ───────────────────────────────────────────────────────────────────

/// Operation of one [`ChangeItem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeOp {
    #[serde(rename = "set")]
    Set,
    /// Compare-and-set: applied only if the server still holds `oldValue`.
    #[serde(rename = "setCas")]
    SetCas,
    /// Insert-only: applied only if the key is absent on the server.
    #[serde(rename = "setInsert")]
    SetInsert,
    #[serde(rename = "remove")]
    Remove,
}

/// One entry of an outbound `changeState` batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeItem {
    #[serde(rename = "type")]
    pub op: ChangeOp,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(
        rename = "oldValue",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub old_value: Option<Value>,
}

impl ChangeItem {
    pub fn set(key: &str, value: Value) -> Self {
        Self {
            op: ChangeOp::Set,
            key: key.to_string(),
            value: Some(value),
            old_value: None,
        }
    }

    pub fn set_cas(key: &str, value: Value, old_value: Value) -> Self {
        Self {
            op: ChangeOp::SetCas,
            key: key.to_string(),
            value: Some(value),
            old_value: Some(old_value),
        }
    }

    pub fn set_insert(key: &str, value: Value) -> Self {
        Self {
            op: ChangeOp::SetInsert,
            key: key.to_string(),
            value: Some(value),
            old_value: None,
        }
    }

    pub fn remove(key: &str) -> Self {
        Self {
            op: ChangeOp::Remove,
            key: key.to_string(),
            value: None,
            old_value: None,
        }
    }
}

/// `join` request payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JoinPayload {
    #[serde(rename = "agentID")]
    pub agent_id: String,
    #[serde(rename = "userId", default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(
        rename = "sendInitState",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub send_init_state: Option<bool>,
}

/// `joined` confirmation payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JoinedPayload {
    #[serde(rename = "agentID")]
    pub agent_id: String,
    /// Server promises to push `initState` unprompted.
    #[serde(
        rename = "initStateComing",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub init_state_coming: Option<bool>,
}

/// `changePresence` request payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangePresencePayload {
    #[serde(rename = "agentID")]
    pub agent_id: String,
    pub presence: String,
}

/// One agent's entry in a `status` payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresenceItem {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// `status` broadcast payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusPayload {
    pub presence: Vec<PresenceItem>,
}

// ===================================================================
// Tests
// ===================================================================
