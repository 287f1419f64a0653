//! Client for server-authoritative shared state.
//!
//! Provides:
//! - Connection lifecycle (join handshake, rejoin after loss, destroy)
//! - Local mirror reads and batched writes
//! - Presence publication and observation
//! - Subscriptions with replay for late handlers
//! - Autoclean sweep for orphaned per-agent meta keys
//!
//! Everything that mutates the mirror funnels through one engine task:
//!
//! ```text
//! link events ──► pump ──┐
//! on(channel)  Replay ───┤
//! autoclean    Sweep ────┼──► engine task ──► handler fan-out
//! diagnostics  Dump ─────┘    (mirror + dispatcher under one lock,
//!                              handlers invoked outside it)
//! ```
//!
//! so handlers observe batches in server order and replay snapshots are
//! consistent. Public reads and writes lock the same state directly;
//! they never wait on the queue.
//!
//! Reference: Kleppmann, Chapter 5 — Replication

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::dispatch::{self, Channel, Delivery, Dispatcher, Event, Handler};
use crate::error::{ErrorSink, StateError};
use crate::protocol::{events, ChangeItem, Frame, JoinPayload, JoinedPayload, StatusPayload};
use crate::readystate::{ReadyState, ReadyStateCell};
use crate::store::{PresenceStore, StateStore};
use crate::transport::ws::{self, WsOptions};
use crate::transport::{Transport, TransportEvent};

/// Sink for diagnostic dump lines.
pub type LogSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Prefix of per-agent bookkeeping keys targeted by the autoclean sweep.
const META_PREFIX: &str = "__meta__";

// ───────────────────────────────────────────────────────────────────
// Configuration
// ───────────────────────────────────────────────────────────────────

/// Client tuning. `StateConfig::default()` is a sensible production
/// setup; override fields with struct update syntax.
#[derive(Clone)]
pub struct StateConfig {
    /// Identity announced in the join handshake. Generated (UUID v4)
    /// when absent.
    pub agent_id: Option<String>,
    /// Optional user identity forwarded alongside the agent id.
    pub user_id: Option<String>,
    /// Ask the server for the full state during the handshake and defer
    /// `Open` until it arrived.
    pub fetch_initial_state: bool,
    /// Publish presence `"online"` automatically on every `Open`.
    pub auto_presence: bool,
    /// Periodically sweep meta keys of agents without presence.
    pub auto_clean: bool,
    pub autoclean_interval: Duration,
    /// Periodically dump mirror contents to the log sink.
    pub diagnostic_interval: Option<Duration>,
    /// Receives remote errors and handler faults. Defaults to `log::error!`.
    pub error_sink: Option<ErrorSink>,
    /// Receives diagnostic dumps. Defaults to `log::debug!`.
    pub log_sink: Option<LogSink>,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            agent_id: None,
            user_id: None,
            fetch_initial_state: true,
            auto_presence: true,
            auto_clean: false,
            autoclean_interval: Duration::from_secs(15),
            diagnostic_interval: None,
            error_sink: None,
            log_sink: None,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Engine
// ───────────────────────────────────────────────────────────────────

enum Task {
    Link(TransportEvent),
    Replay { channel: Channel, handler: Handler },
    AutocleanSweep,
    DiagnosticDump,
}

/// Mirror, dispatcher and write bracket, all behind one lock.
struct Engine {
    readystate: ReadyStateCell,
    state: StateStore,
    presence: PresenceStore,
    dispatcher: Dispatcher,
    /// Open write batch, keyed for last-write-wins coalescing.
    bracket: Option<BTreeMap<String, ChangeItem>>,
    destroyed: bool,
}

impl Engine {
    fn new() -> Self {
        Self {
            readystate: ReadyStateCell::new(),
            state: StateStore::new(),
            presence: PresenceStore::new(),
            dispatcher: Dispatcher::new(),
            bracket: None,
            destroyed: false,
        }
    }

    fn set_readystate(&mut self, next: ReadyState) -> Vec<Delivery> {
        match self.readystate.set(next) {
            Some(reached) => self.dispatcher.live(&Event::ReadyStateChange(reached)),
            None => Vec::new(),
        }
    }
}

struct Shared {
    agent_id: String,
    user_id: Option<String>,
    fetch_initial_state: bool,
    auto_presence: bool,
    engine: Mutex<Engine>,
    tasks: mpsc::UnboundedSender<Task>,
    transport: Transport,
    error_sink: ErrorSink,
    log_sink: LogSink,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ───────────────────────────────────────────────────────────────────
// Handle
// ───────────────────────────────────────────────────────────────────

/// Handle to one shared-state session. Clones address the same session.
#[derive(Clone)]
pub struct SharedState {
    shared: Arc<Shared>,
}

impl SharedState {
    /// Connect over WebSocket with default reconnection tuning.
    pub fn connect(url: &str, config: StateConfig) -> Self {
        Self::connect_with(url, config, WsOptions::default())
    }

    /// Connect over WebSocket with explicit reconnection tuning.
    pub fn connect_with(url: &str, config: StateConfig, options: WsOptions) -> Self {
        Self::new(ws::connect(url, options), config)
    }

    /// Run a session over an already-built link. Must be called within
    /// a Tokio runtime.
    pub fn new(mut transport: Transport, config: StateConfig) -> Self {
        let agent_id = config
            .agent_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let error_sink: ErrorSink = config
            .error_sink
            .clone()
            .unwrap_or_else(|| Arc::new(|e: &StateError| log::error!("{e}")));
        let log_sink: LogSink = config
            .log_sink
            .clone()
            .unwrap_or_else(|| Arc::new(|line: &str| log::debug!("{line}")));

        let (task_tx, task_rx) = mpsc::unbounded_channel();
        let link_events = transport.take_events();

        let shared = Arc::new(Shared {
            agent_id,
            user_id: config.user_id.clone(),
            fetch_initial_state: config.fetch_initial_state,
            auto_presence: config.auto_presence,
            engine: Mutex::new(Engine::new()),
            tasks: task_tx.clone(),
            transport,
            error_sink,
            log_sink,
            handles: Mutex::new(Vec::new()),
        });

        let mut handles = Vec::new();

        if let Some(mut events) = link_events {
            let tasks = task_tx.clone();
            handles.push(tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    if tasks.send(Task::Link(event)).is_err() {
                        break;
                    }
                }
            }));
        }

        handles.push(tokio::spawn(drive(shared.clone(), task_rx)));

        if config.auto_clean {
            handles.push(spawn_ticker(config.autoclean_interval, task_tx.clone(), || {
                Task::AutocleanSweep
            }));
        }
        if let Some(interval) = config.diagnostic_interval {
            handles.push(spawn_ticker(interval, task_tx, || Task::DiagnosticDump));
        }

        *lock(&shared.handles) = handles;
        Self { shared }
    }

    // ── Mirror reads ─────────────────────────────────────────────

    /// Current value of a key in the local mirror.
    pub fn get_item(&self, key: &str) -> Option<Value> {
        lock(&self.shared.engine).state.get(key).cloned()
    }

    /// Every key currently mirrored, in sorted order.
    pub fn keys(&self) -> Vec<String> {
        lock(&self.shared.engine).state.keys()
    }

    /// Current presence of one agent.
    pub fn get_presence(&self, agent_id: &str) -> Option<String> {
        lock(&self.shared.engine)
            .presence
            .get(agent_id)
            .map(str::to_string)
    }

    /// Every agent id with known presence, in sorted order.
    pub fn get_presence_list(&self) -> Vec<String> {
        lock(&self.shared.engine).presence.agent_ids()
    }

    pub fn ready_state(&self) -> ReadyState {
        lock(&self.shared.engine).readystate.get()
    }

    pub fn agent_id(&self) -> &str {
        &self.shared.agent_id
    }

    // ── Writes ───────────────────────────────────────────────────

    /// Set a key. Inside a bracket the write is batched; otherwise it
    /// goes out immediately and requires an open connection.
    pub fn set_item<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StateError> {
        check_key(key)?;
        let value = to_value(value)?;
        let mut engine = lock(&self.shared.engine);
        self.submit(&mut engine, key, ChangeItem::set(key, value))
    }

    /// Set a key only if the server still holds the value this mirror
    /// holds. With no mirrored value the write degrades to insert-only.
    pub fn set_cas<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StateError> {
        check_key(key)?;
        let value = to_value(value)?;
        let mut engine = lock(&self.shared.engine);
        let item = match engine.state.get(key) {
            Some(prior) => ChangeItem::set_cas(key, value, prior.clone()),
            None => ChangeItem::set_insert(key, value),
        };
        self.submit(&mut engine, key, item)
    }

    /// Set a key only if it is absent on the server.
    pub fn set_insert<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
    ) -> Result<(), StateError> {
        check_key(key)?;
        let value = to_value(value)?;
        let mut engine = lock(&self.shared.engine);
        self.submit(&mut engine, key, ChangeItem::set_insert(key, value))
    }

    /// Remove a key. Outside a bracket the key must exist in the mirror
    /// and the connection must be open.
    pub fn remove_item(&self, key: &str) -> Result<(), StateError> {
        check_key(key)?;
        let mut engine = lock(&self.shared.engine);
        if let Some(bracket) = engine.bracket.as_mut() {
            bracket.insert(key.to_string(), ChangeItem::remove(key));
            return Ok(());
        }
        let readystate = engine.readystate.get();
        if readystate != ReadyState::Open {
            return Err(StateError::NotReady(readystate));
        }
        if !engine.state.contains_key(key) {
            return Err(StateError::IllegalArgument(format!("unknown key: {key}")));
        }
        self.shared
            .transport
            .emit(Frame::change_state(&[ChangeItem::remove(key)]));
        Ok(())
    }

    /// Open a write bracket. Writes until [`send`](Self::send) coalesce
    /// per key, last write wins. Reopening an open bracket is a no-op.
    pub fn request(&self) {
        let mut engine = lock(&self.shared.engine);
        if engine.bracket.is_none() {
            engine.bracket = Some(BTreeMap::new());
        }
    }

    /// Close the bracket and flush it as one batch. Fails while the
    /// connection is not open, leaving the bracket intact.
    pub fn send(&self) -> Result<(), StateError> {
        let mut engine = lock(&self.shared.engine);
        let readystate = engine.readystate.get();
        if readystate != ReadyState::Open {
            return Err(StateError::NotReady(readystate));
        }
        let items: Vec<ChangeItem> = match engine.bracket.take() {
            Some(bracket) => bracket.into_values().collect(),
            None => return Ok(()),
        };
        if !items.is_empty() {
            self.shared.transport.emit(Frame::change_state(&items));
        }
        Ok(())
    }

    /// Publish this agent's presence.
    pub fn set_presence(&self, presence: &str) -> Result<(), StateError> {
        if presence.is_empty() {
            return Err(StateError::IllegalArgument(
                "presence must be a non-empty string".into(),
            ));
        }
        let engine = lock(&self.shared.engine);
        let readystate = engine.readystate.get();
        if readystate != ReadyState::Open {
            return Err(StateError::NotReady(readystate));
        }
        self.shared
            .transport
            .emit(Frame::change_presence(&self.shared.agent_id, presence));
        Ok(())
    }

    /// Ask the server to resend the full state. The reply is applied as
    /// a regular diff.
    pub fn refresh(&self) {
        self.shared.transport.emit(Frame::get_state());
    }

    // ── Subscriptions ────────────────────────────────────────────

    /// Subscribe a handler to a channel.
    ///
    /// The handler first receives a replay of the current mirror (on
    /// the engine task, never inside this call), then live events. Live
    /// events racing ahead of the replay are suppressed for this
    /// handler so it never sees anything older than its replay.
    /// Registering the same `Arc` twice is a no-op.
    pub fn on(&self, channel: &str, handler: &Handler) -> Result<(), StateError> {
        let channel: Channel = channel.parse()?;
        let mut engine = lock(&self.shared.engine);
        if engine.destroyed {
            return Ok(());
        }
        if engine.dispatcher.subscribe(channel, handler, true) {
            let _ = self.shared.tasks.send(Task::Replay {
                channel,
                handler: handler.clone(),
            });
        }
        Ok(())
    }

    /// Subscribe a handler to a channel without the initial replay. The
    /// handler receives live events only, starting with the next one.
    pub fn on_without_replay(&self, channel: &str, handler: &Handler) -> Result<(), StateError> {
        let channel: Channel = channel.parse()?;
        let mut engine = lock(&self.shared.engine);
        if engine.destroyed {
            return Ok(());
        }
        engine.dispatcher.subscribe(channel, handler, false);
        Ok(())
    }

    /// Unsubscribe a handler. Cancels a not-yet-delivered replay.
    pub fn off(&self, channel: &str, handler: &Handler) -> Result<(), StateError> {
        let channel: Channel = channel.parse()?;
        lock(&self.shared.engine)
            .dispatcher
            .unsubscribe(channel, handler);
        Ok(())
    }

    // ── Teardown ─────────────────────────────────────────────────

    /// Tear the session down: readystate goes `Closed` (its subscribers
    /// are notified once), every store and registration is dropped, and
    /// the link shuts down. Idempotent; the session cannot be reopened.
    pub fn destroy(&self) {
        let deliveries = {
            let mut engine = lock(&self.shared.engine);
            if engine.destroyed {
                return;
            }
            engine.destroyed = true;
            let deliveries = engine.set_readystate(ReadyState::Closed);
            engine.dispatcher.clear();
            engine.state.clear();
            engine.presence.clear();
            engine.bracket = None;
            deliveries
        };
        self.shared.transport.close();
        dispatch::run(deliveries, &self.shared.error_sink);
        for handle in lock(&self.shared.handles).drain(..) {
            handle.abort();
        }
    }

    fn submit(
        &self,
        engine: &mut Engine,
        key: &str,
        item: ChangeItem,
    ) -> Result<(), StateError> {
        if let Some(bracket) = engine.bracket.as_mut() {
            bracket.insert(key.to_string(), item);
            return Ok(());
        }
        let readystate = engine.readystate.get();
        if readystate != ReadyState::Open {
            return Err(StateError::NotReady(readystate));
        }
        self.shared
            .transport
            .emit(Frame::change_state(std::slice::from_ref(&item)));
        Ok(())
    }
}

fn check_key(key: &str) -> Result<(), StateError> {
    if key.is_empty() {
        return Err(StateError::IllegalArgument(
            "key must be a non-empty string".into(),
        ));
    }
    Ok(())
}

fn to_value<T: Serialize + ?Sized>(value: &T) -> Result<Value, StateError> {
    serde_json::to_value(value)
        .map_err(|e| StateError::IllegalArgument(format!("value is not serializable: {e}")))
}

fn spawn_ticker(
    interval: Duration,
    tasks: mpsc::UnboundedSender<Task>,
    make: fn() -> Task,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if interval.is_zero() {
            log::warn!("Ignoring zero ticker interval");
            return;
        }
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // swallow the immediate first tick
        loop {
            ticker.tick().await;
            if tasks.send(make()).is_err() {
                break;
            }
        }
    })
}

// ───────────────────────────────────────────────────────────────────
// Engine task
// ───────────────────────────────────────────────────────────────────

async fn drive(shared: Arc<Shared>, mut tasks: mpsc::UnboundedReceiver<Task>) {
    while let Some(task) = tasks.recv().await {
        let deliveries = {
            let mut engine = lock(&shared.engine);
            if engine.destroyed {
                break;
            }
            handle_task(&shared, &mut engine, task)
        };
        dispatch::run(deliveries, &shared.error_sink);
    }
}

fn handle_task(shared: &Shared, engine: &mut Engine, task: Task) -> Vec<Delivery> {
    match task {
        Task::Link(TransportEvent::Up) => on_link_up(shared),
        Task::Link(TransportEvent::Down) => engine.set_readystate(ReadyState::Connecting),
        Task::Link(TransportEvent::Frame(frame)) => on_frame(shared, engine, frame),
        Task::Replay { channel, handler } => {
            let events = replay_events(engine, channel);
            engine.dispatcher.replay(channel, &handler, events)
        }
        Task::AutocleanSweep => {
            sweep(shared, engine);
            Vec::new()
        }
        Task::DiagnosticDump => {
            dump(shared, engine);
            Vec::new()
        }
    }
}

fn on_link_up(shared: &Shared) -> Vec<Delivery> {
    let payload = JoinPayload {
        agent_id: shared.agent_id.clone(),
        user_id: shared.user_id.clone(),
        send_init_state: shared.fetch_initial_state.then_some(true),
    };
    shared.transport.emit(Frame::join(&payload));
    Vec::new()
}

fn on_frame(shared: &Shared, engine: &mut Engine, frame: Frame) -> Vec<Delivery> {
    match frame.event.as_str() {
        events::JOINED => on_joined(shared, engine, &frame),
        events::INIT_STATE => {
            // A snapshot always reasserts Open and the auto presence;
            // the readystate cell swallows repeat transitions.
            let mut deliveries = apply_state_batch(engine, &frame);
            deliveries.extend(open_up(shared, engine));
            deliveries
        }
        events::CHANGE_STATE => apply_state_batch(engine, &frame),
        events::STATUS => on_status(engine, &frame),
        events::SS_ERROR => {
            (shared.error_sink)(&StateError::Remote(frame.data));
            Vec::new()
        }
        other => {
            log::debug!("Ignoring unknown frame event {other:?}");
            Vec::new()
        }
    }
}

fn on_joined(shared: &Shared, engine: &mut Engine, frame: &Frame) -> Vec<Delivery> {
    let payload: JoinedPayload = match frame.data_as() {
        Ok(payload) => payload,
        Err(e) => {
            log::warn!("Malformed joined payload: {e}");
            return Vec::new();
        }
    };
    if payload.agent_id != shared.agent_id {
        log::debug!("Ignoring joined for foreign agent {}", payload.agent_id);
        return Vec::new();
    }
    if shared.fetch_initial_state {
        // Open happens when initState lands
        if payload.init_state_coming != Some(true) {
            shared.transport.emit(Frame::get_init_state());
        }
        Vec::new()
    } else {
        open_up(shared, engine)
    }
}

fn open_up(shared: &Shared, engine: &mut Engine) -> Vec<Delivery> {
    let deliveries = engine.set_readystate(ReadyState::Open);
    if shared.auto_presence {
        shared
            .transport
            .emit(Frame::change_presence(&shared.agent_id, "online"));
    }
    deliveries
}

fn apply_state_batch(engine: &mut Engine, frame: &Frame) -> Vec<Delivery> {
    if frame.data.is_null() {
        return Vec::new();
    }
    let items: Vec<ChangeItem> = match frame.data_as() {
        Ok(items) => items,
        Err(e) => {
            log::warn!("Malformed state batch: {e}");
            return Vec::new();
        }
    };
    let events = engine.state.apply_batch(&items);
    engine.dispatcher.live_all(&events)
}

fn on_status(engine: &mut Engine, frame: &Frame) -> Vec<Delivery> {
    let payload: StatusPayload = match frame.data_as() {
        Ok(payload) => payload,
        Err(e) => {
            log::warn!("Malformed status payload: {e}");
            return Vec::new();
        }
    };
    let mut events = Vec::new();
    for item in &payload.presence {
        if item.key.is_empty() {
            continue;
        }
        if let Some(event) = engine.presence.apply_status(&item.key, item.value.as_deref()) {
            events.push(event);
        }
    }
    engine.dispatcher.live_all(&events)
}

fn replay_events(engine: &Engine, channel: Channel) -> Vec<Event> {
    match channel {
        Channel::Change => engine.state.replay_events(),
        Channel::Presence => engine.presence.replay_events(),
        Channel::ReadyStateChange => vec![Event::ReadyStateChange(engine.readystate.get())],
        Channel::ChangeSet => vec![Event::ChangeSet],
        // Nothing meaningful to restate for removals
        Channel::Remove => Vec::new(),
    }
}

/// Remove meta keys left behind by agents that no longer have presence.
///
/// A key `__meta__<agent>` marks `<agent>`'s bookkeeping. When the
/// agent has no presence entry, every key starting with `__` and
/// containing `__<agent>` (the marker key itself included) gets an
/// immediate removal frame, one per key, bypassing any open bracket;
/// the authoritative removals come back like any other change.
fn sweep(shared: &Shared, engine: &mut Engine) {
    if engine.readystate.get() != ReadyState::Open {
        return;
    }
    let keys = engine.state.keys();
    let orphaned: Vec<&str> = keys
        .iter()
        .filter_map(|key| key.strip_prefix(META_PREFIX))
        .filter(|agent_id| !agent_id.is_empty() && !engine.presence.contains(agent_id))
        .collect();

    let mut doomed: Vec<&String> = Vec::new();
    for agent_id in orphaned {
        let marker = format!("__{agent_id}");
        for key in &keys {
            if key.starts_with("__") && key.contains(&marker) && !doomed.contains(&key) {
                doomed.push(key);
            }
        }
    }

    if doomed.is_empty() {
        return;
    }
    log::info!("Autoclean requesting removal of {} orphaned keys", doomed.len());
    for key in doomed {
        shared
            .transport
            .emit(Frame::change_state(&[ChangeItem::remove(key)]));
    }
}

fn dump(shared: &Shared, engine: &Engine) {
    let line = json!({
        "readystate": engine.readystate.get().as_str(),
        "state": engine.state.snapshot(),
        "presence": engine.presence.snapshot(),
    });
    (shared.log_sink)(&line.to_string());
}

// ===================================================================
// Tests
// ===================================================================
