//! Local mirrors of the server-authoritative state.
//!
//! Two stores, both plain ordered maps, both written only from the
//! engine task:
//!
//! - [`StateStore`] — the shared key/value dictionary. Authoritative
//!   batches are diffed against the mirror here: every item is
//!   classified as add, update, removal, or no-op, and the events for
//!   one batch are emitted together followed by a single changeset
//!   terminator.
//! - [`PresenceStore`] — per-agent presence strings, diffed the same
//!   way one agent at a time.
//!
//! ```text
//! batch [ set a=1 · remove b · set c=2 ]
//!        │ diff against mirror
//!        ▼
//! change(a, add) · remove(b) · change(c, update) · changeset
//! ```
//!
//! Neither store talks to the network; they turn authoritative frames
//! into mirror mutations plus the event sequence the dispatcher fans
//! out. Replay snapshots for late subscribers are generated from the
//! same maps.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::dispatch::{ChangeKind, Event};
use crate::protocol::{ChangeItem, ChangeOp};

// ───────────────────────────────────────────────────────────────────
// Shared state
// ───────────────────────────────────────────────────────────────────

/// Mirror of the shared key/value state.
///
/// Removal is an explicit batch item, so any JSON value — `null`
/// included — can live in the mirror.
pub struct StateStore {
    entries: BTreeMap<String, Value>,
}

impl StateStore {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Apply one authoritative batch and return the events it produces,
    /// in item order.
    ///
    /// Items that match the mirror (same value, or removal of an absent
    /// key) produce no event. Conditional-write tags never appear in
    /// authoritative batches (the server resolves them to plain sets),
    /// so they are skipped. A non-empty batch always terminates with
    /// [`Event::ChangeSet`], even when every item was suppressed.
    pub fn apply_batch(&mut self, items: &[ChangeItem]) -> Vec<Event> {
        let mut events = Vec::new();

        for item in items {
            match item.op {
                ChangeOp::Set => {
                    if item.key.is_empty() {
                        continue;
                    }
                    // An absent value field diffs and stores as null.
                    let value = item.value.clone().unwrap_or(Value::Null);
                    let kind = match self.entries.get(&item.key) {
                        Some(current) if *current == value => continue,
                        Some(_) => ChangeKind::Update,
                        None => ChangeKind::Add,
                    };
                    self.entries.insert(item.key.clone(), value.clone());
                    events.push(Event::Change {
                        key: item.key.clone(),
                        value,
                        kind,
                    });
                }
                ChangeOp::Remove => {
                    if let Some(prior) = self.entries.remove(&item.key) {
                        events.push(Event::Remove {
                            key: item.key.clone(),
                            value: prior,
                        });
                    }
                }
                ChangeOp::SetCas | ChangeOp::SetInsert => {}
            }
        }

        if !items.is_empty() {
            events.push(Event::ChangeSet);
        }
        events
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Replay sequence for a late `change` subscriber: one update-flavored
    /// event per mirrored key.
    pub fn replay_events(&self) -> Vec<Event> {
        self.entries
            .iter()
            .map(|(key, value)| Event::Change {
                key: key.clone(),
                value: value.clone(),
                kind: ChangeKind::Update,
            })
            .collect()
    }

    /// Whole mirror as one JSON object, for diagnostics.
    pub fn snapshot(&self) -> Value {
        Value::Object(
            self.entries
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

// ───────────────────────────────────────────────────────────────────
// Presence
// ───────────────────────────────────────────────────────────────────

/// Mirror of per-agent presence.
///
/// An empty or absent presence string clears the agent's entry, so the
/// mirror only ever holds non-empty values.
pub struct PresenceStore {
    agents: BTreeMap<String, String>,
}

impl PresenceStore {
    pub fn new() -> Self {
        Self {
            agents: BTreeMap::new(),
        }
    }

    /// Apply one agent's authoritative presence. Returns the event to
    /// fan out, or `None` when the mirror already agreed.
    pub fn apply_status(&mut self, agent_id: &str, value: Option<&str>) -> Option<Event> {
        let normalized = value.filter(|v| !v.is_empty());
        match normalized {
            None => self.agents.remove(agent_id).map(|_| Event::Presence {
                agent_id: agent_id.to_string(),
                value: None,
            }),
            Some(next) => {
                if self.agents.get(agent_id).map(String::as_str) == Some(next) {
                    return None;
                }
                self.agents.insert(agent_id.to_string(), next.to_string());
                Some(Event::Presence {
                    agent_id: agent_id.to_string(),
                    value: Some(next.to_string()),
                })
            }
        }
    }

    pub fn get(&self, agent_id: &str) -> Option<&str> {
        self.agents.get(agent_id).map(String::as_str)
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }

    /// Agent ids with known presence, in sorted order.
    pub fn agent_ids(&self) -> Vec<String> {
        self.agents.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn clear(&mut self) {
        self.agents.clear();
    }

    /// Replay sequence for a late `presence` subscriber.
    pub fn replay_events(&self) -> Vec<Event> {
        self.agents
            .iter()
            .map(|(agent_id, value)| Event::Presence {
                agent_id: agent_id.clone(),
                value: Some(value.clone()),
            })
            .collect()
    }

    /// Presence table as one JSON object, for diagnostics.
    pub fn snapshot(&self) -> Value {
        Value::Object(
            self.agents
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect(),
        )
    }
}

impl Default for PresenceStore {
    fn default() -> Self {
        Self::new()
    }
}

// ===================================================================
// Tests
// ===================================================================
