//! # chorus-lookup — Name lookup over a shared-state link
//!
//! Thin request/reply client for the mapping service that answers
//! "where does this app/user/group live" questions. It rides the same
//! frame transport as `chorus-state` but keeps no mirror: every lookup
//! is one acknowledged round trip, raced against a timeout.
//!
//! ```text
//! get_user_mapping("files", [User, UserApp])
//!   │  getMapping { appId, user: true, userApp: true, userId? }  ack=n
//!   ▼
//! mapping service ── { user: "/u/1", userApp: "/u/1/files" } ack=n ──►
//!   │
//!   ▼
//! Mapping { user: "<base_url>/u/1", user_app: "<base_url>/u/1/files" }
//! ```
//!
//! Replies carrying an `error` field are surfaced as [`LookupError::Nack`];
//! a reply that never arrives inside `max_timeout` becomes
//! [`LookupError::Timeout`]. The readystate of the underlying link is
//! observable through [`MappingClient::on`], with the same
//! replay-on-subscribe contract as the state client.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use chorus_state::dispatch::{self, Channel, Delivery, Dispatcher, Event, Handler};
use chorus_state::transport::ws;
use chorus_state::{
    ErrorSink, Frame, ReadyState, ReadyStateCell, Transport, TransportEvent, WsOptions,
};

/// Frame event names understood by the mapping service. User and group
/// lookups share the one wire event; the payload shape tells them apart.
mod events {
    pub const GET_MAPPING: &str = "getMapping";
}

/// Errors from lookup calls.
#[derive(Debug, Error)]
pub enum LookupError {
    #[error("Illegal argument: {0}")]
    IllegalArgument(String),
    #[error("Lookup timed out after {0:?}")]
    Timeout(Duration),
    #[error("Lookup rejected: {0}")]
    Nack(String),
    #[error("Link closed before the reply arrived")]
    ChannelClosed,
}

/// Scopes a user mapping can be requested for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    User,
    App,
    UserApp,
}

impl Scope {
    fn field_name(self) -> &'static str {
        match self {
            Scope::User => "user",
            Scope::App => "app",
            Scope::UserApp => "userApp",
        }
    }
}

/// Resolved locations, one per scope the service answered. Paths come
/// back service-relative and are prefixed with the configured base URL
/// verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mapping {
    pub user: Option<String>,
    pub app: Option<String>,
    pub user_app: Option<String>,
    pub group: Option<String>,
}

/// Client tuning.
#[derive(Clone)]
pub struct LookupConfig {
    /// Prefix glued onto every returned path.
    pub base_url: String,
    /// Per-lookup reply deadline.
    pub max_timeout: Duration,
    /// Forwarded with user mapping requests when set.
    pub user_id: Option<String>,
}

impl LookupConfig {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
            max_timeout: Duration::from_secs(2),
            user_id: None,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Client
// ───────────────────────────────────────────────────────────────────

enum Task {
    Link(TransportEvent),
    Replay(Handler),
}

struct Cell {
    readystate: ReadyStateCell,
    dispatcher: Dispatcher,
    destroyed: bool,
}

struct Inner {
    config: LookupConfig,
    cell: Mutex<Cell>,
    tasks: mpsc::UnboundedSender<Task>,
    transport: Transport,
    error_sink: ErrorSink,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to the mapping service. Clones address the same session.
#[derive(Clone)]
pub struct MappingClient {
    inner: Arc<Inner>,
}

impl MappingClient {
    /// Connect over WebSocket with default reconnection tuning.
    pub fn connect(url: &str, config: LookupConfig) -> Self {
        Self::new(ws::connect(url, WsOptions::default()), config)
    }

    /// Run the client over an already-built link. Must be called within
    /// a Tokio runtime.
    pub fn new(mut transport: Transport, config: LookupConfig) -> Self {
        let (task_tx, task_rx) = mpsc::unbounded_channel();
        let link_events = transport.take_events();
        let error_sink: ErrorSink = Arc::new(|e| log::error!("{e}"));

        let inner = Arc::new(Inner {
            config,
            cell: Mutex::new(Cell {
                readystate: ReadyStateCell::new(),
                dispatcher: Dispatcher::new(),
                destroyed: false,
            }),
            tasks: task_tx.clone(),
            transport,
            error_sink,
            handles: Mutex::new(Vec::new()),
        });

        let mut handles = Vec::new();
        if let Some(mut events) = link_events {
            let tasks = task_tx;
            handles.push(tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    if tasks.send(Task::Link(event)).is_err() {
                        break;
                    }
                }
            }));
        }
        handles.push(tokio::spawn(drive(inner.clone(), task_rx)));
        *lock(&inner.handles) = handles;

        Self { inner }
    }

    pub fn ready_state(&self) -> ReadyState {
        lock(&self.inner.cell).readystate.get()
    }

    /// Subscribe to readystate changes. The handler first receives a
    /// replay of the current state, then live transitions.
    pub fn on(&self, handler: &Handler) {
        let mut cell = lock(&self.inner.cell);
        if cell.destroyed {
            return;
        }
        if cell
            .dispatcher
            .subscribe(Channel::ReadyStateChange, handler, true)
        {
            let _ = self.inner.tasks.send(Task::Replay(handler.clone()));
        }
    }

    pub fn off(&self, handler: &Handler) {
        lock(&self.inner.cell)
            .dispatcher
            .unsubscribe(Channel::ReadyStateChange, handler);
    }

    /// Resolve the locations of `app_id` for the requested scopes. An
    /// empty scope list is allowed; the service then answers with
    /// whatever it defaults to.
    pub async fn get_user_mapping(
        &self,
        app_id: &str,
        scopes: &[Scope],
    ) -> Result<Mapping, LookupError> {
        if app_id.is_empty() {
            return Err(LookupError::IllegalArgument(
                "app id must be a non-empty string".into(),
            ));
        }
        let mut data = Map::new();
        data.insert("appId".to_string(), Value::String(app_id.to_string()));
        for scope in scopes {
            data.insert(scope.field_name().to_string(), Value::Bool(true));
        }
        if let Some(user_id) = &self.inner.config.user_id {
            data.insert("userId".to_string(), Value::String(user_id.clone()));
        }
        let reply = self
            .round_trip(Frame::new(events::GET_MAPPING, Value::Object(data)))
            .await?;
        Ok(self.parse_mapping(&reply))
    }

    /// Resolve the location of a group.
    pub async fn get_group_mapping(&self, group_id: &str) -> Result<Mapping, LookupError> {
        if group_id.is_empty() {
            return Err(LookupError::IllegalArgument(
                "group id must be a non-empty string".into(),
            ));
        }
        let mut data = Map::new();
        data.insert("groupId".to_string(), Value::String(group_id.to_string()));
        let reply = self
            .round_trip(Frame::new(events::GET_MAPPING, Value::Object(data)))
            .await?;
        Ok(self.parse_mapping(&reply))
    }

    /// Tear the client down. Readystate goes `Closed`, subscribers are
    /// notified once, pending lookups fail with [`LookupError::ChannelClosed`].
    pub fn destroy(&self) {
        let deliveries = {
            let mut cell = lock(&self.inner.cell);
            if cell.destroyed {
                return;
            }
            cell.destroyed = true;
            let deliveries = set_readystate(&mut cell, ReadyState::Closed);
            cell.dispatcher.clear();
            deliveries
        };
        self.inner.transport.close();
        dispatch::run(deliveries, &self.inner.error_sink);
        for handle in lock(&self.inner.handles).drain(..) {
            handle.abort();
        }
    }

    async fn round_trip(&self, frame: Frame) -> Result<Value, LookupError> {
        let deadline = self.inner.config.max_timeout;
        let reply = self.inner.transport.request(frame);
        let value = match tokio::time::timeout(deadline, reply).await {
            Ok(Ok(value)) => value,
            Ok(Err(_)) => return Err(LookupError::ChannelClosed),
            Err(_) => return Err(LookupError::Timeout(deadline)),
        };
        if let Some(error) = value.get("error") {
            let reason = error
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            return Err(LookupError::Nack(reason));
        }
        Ok(value)
    }

    fn parse_mapping(&self, value: &Value) -> Mapping {
        let base = &self.inner.config.base_url;
        let field = |name: &str| {
            value
                .get(name)
                .and_then(Value::as_str)
                .map(|path| format!("{base}{path}"))
        };
        // A group answer is exclusive; user/app paths riding along are
        // ignored
        if let Some(group) = field("group") {
            return Mapping {
                group: Some(group),
                ..Mapping::default()
            };
        }
        Mapping {
            user: field("user"),
            app: field("app"),
            user_app: field("userApp"),
            group: None,
        }
    }
}

fn set_readystate(cell: &mut Cell, next: ReadyState) -> Vec<Delivery> {
    match cell.readystate.set(next) {
        Some(reached) => cell.dispatcher.live(&Event::ReadyStateChange(reached)),
        None => Vec::new(),
    }
}

async fn drive(inner: Arc<Inner>, mut tasks: mpsc::UnboundedReceiver<Task>) {
    while let Some(task) = tasks.recv().await {
        let deliveries = {
            let mut cell = lock(&inner.cell);
            if cell.destroyed {
                break;
            }
            match task {
                Task::Link(TransportEvent::Up) => set_readystate(&mut cell, ReadyState::Open),
                Task::Link(TransportEvent::Down) => {
                    set_readystate(&mut cell, ReadyState::Connecting)
                }
                Task::Link(TransportEvent::Frame(frame)) => {
                    // Replies arrive through request acks; anything else
                    // is unexpected chatter
                    log::debug!("Ignoring unsolicited frame {:?}", frame.event);
                    Vec::new()
                }
                Task::Replay(handler) => {
                    let current = Event::ReadyStateChange(cell.readystate.get());
                    cell.dispatcher
                        .replay(Channel::ReadyStateChange, &handler, vec![current])
                }
            }
        };
        dispatch::run(deliveries, &inner.error_sink);
    }
}

// ===================================================================
// Tests
// ===================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_state::PeerEnd;
    use serde_json::json;
    use tokio::time::timeout;

    fn pair_client(config: LookupConfig) -> (MappingClient, PeerEnd) {
        let (transport, peer) = Transport::pair();
        (MappingClient::new(transport, config), peer)
    }

    async fn recv_frame(peer: &mut PeerEnd) -> Frame {
        timeout(Duration::from_secs(2), peer.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("link closed unexpectedly")
    }

    fn reply_to(request: &Frame, data: Value) -> Frame {
        let mut frame = Frame::new("reply", data);
        frame.ack = request.ack;
        frame
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("handler channel closed")
    }

    #[tokio::test]
    async fn test_empty_ids_rejected() {
        let (client, _peer) = pair_client(LookupConfig::new("https://maps.example"));
        assert!(matches!(
            client.get_user_mapping("", &[Scope::User]).await,
            Err(LookupError::IllegalArgument(_))
        ));
        assert!(matches!(
            client.get_group_mapping("").await,
            Err(LookupError::IllegalArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_user_mapping_round_trip() {
        let mut config = LookupConfig::new("https://maps.example");
        config.user_id = Some("u7".into());
        let (client, mut peer) = pair_client(config);

        let authority = tokio::spawn(async move {
            let request = recv_frame(&mut peer).await;
            assert_eq!(request.event, "getMapping");
            assert_eq!(
                request.data,
                json!({"appId": "files", "user": true, "userApp": true, "userId": "u7"})
            );
            peer.push(reply_to(
                &request,
                json!({"user": "/u/7", "userApp": "/u/7/files"}),
            ));
        });

        let mapping = client
            .get_user_mapping("files", &[Scope::User, Scope::UserApp])
            .await
            .unwrap();
        assert_eq!(mapping.user.as_deref(), Some("https://maps.example/u/7"));
        assert_eq!(
            mapping.user_app.as_deref(),
            Some("https://maps.example/u/7/files")
        );
        assert_eq!(mapping.app, None);
        assert_eq!(mapping.group, None);
        authority.await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_scope_list_is_allowed() {
        let (client, mut peer) = pair_client(LookupConfig::new(""));

        let authority = tokio::spawn(async move {
            let request = recv_frame(&mut peer).await;
            assert_eq!(request.data, json!({"appId": "files"}));
            peer.push(reply_to(&request, json!({})));
        });

        let mapping = client.get_user_mapping("files", &[]).await.unwrap();
        assert_eq!(mapping, Mapping::default());
        authority.await.unwrap();
    }

    #[tokio::test]
    async fn test_group_mapping_round_trip() {
        let (client, mut peer) = pair_client(LookupConfig::new("https://maps.example"));

        let authority = tokio::spawn(async move {
            let request = recv_frame(&mut peer).await;
            assert_eq!(request.event, "getMapping");
            assert_eq!(request.data, json!({"groupId": "g9"}));
            peer.push(reply_to(&request, json!({"group": "/g/9"})));
        });

        let mapping = client.get_group_mapping("g9").await.unwrap();
        assert_eq!(mapping.group.as_deref(), Some("https://maps.example/g/9"));
        authority.await.unwrap();
    }

    #[tokio::test]
    async fn test_group_reply_shadows_other_paths() {
        let (client, mut peer) = pair_client(LookupConfig::new("https://maps.example"));

        let authority = tokio::spawn(async move {
            let request = recv_frame(&mut peer).await;
            peer.push(reply_to(
                &request,
                json!({"group": "/g/9", "user": "/u/7", "app": "/apps/files"}),
            ));
        });

        let mapping = client.get_group_mapping("g9").await.unwrap();
        assert_eq!(
            mapping,
            Mapping {
                group: Some("https://maps.example/g/9".into()),
                ..Mapping::default()
            }
        );
        authority.await.unwrap();
    }

    #[tokio::test]
    async fn test_error_reply_becomes_nack() {
        let (client, mut peer) = pair_client(LookupConfig::new(""));

        let authority = tokio::spawn(async move {
            let request = recv_frame(&mut peer).await;
            peer.push(reply_to(&request, json!({"error": "no such app"})));
        });

        match client.get_user_mapping("ghost", &[Scope::App]).await {
            Err(LookupError::Nack(reason)) => assert_eq!(reason, "no such app"),
            other => panic!("Expected Nack, got {other:?}"),
        }
        authority.await.unwrap();
    }

    #[tokio::test]
    async fn test_silent_service_times_out() {
        let mut config = LookupConfig::new("");
        config.max_timeout = Duration::from_millis(50);
        let (client, mut peer) = pair_client(config);

        let authority = tokio::spawn(async move {
            // Swallow the request, never answer; keep the peer alive so
            // the reply channel stays open past the deadline
            let _request = recv_frame(&mut peer).await;
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(peer);
        });

        match client.get_user_mapping("files", &[Scope::User]).await {
            Err(LookupError::Timeout(deadline)) => {
                assert_eq!(deadline, Duration::from_millis(50));
            }
            other => panic!("Expected Timeout, got {other:?}"),
        }
        authority.abort();
    }

    #[tokio::test]
    async fn test_readystate_follows_the_link() {
        let (client, peer) = pair_client(LookupConfig::new(""));
        assert_eq!(client.ready_state(), ReadyState::Connecting);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler: Handler = Arc::new(move |event: &Event| {
            let _ = tx.send(event.clone());
        });
        client.on(&handler);

        assert_eq!(
            next_event(&mut rx).await,
            Event::ReadyStateChange(ReadyState::Connecting)
        );

        peer.go_up();
        assert_eq!(
            next_event(&mut rx).await,
            Event::ReadyStateChange(ReadyState::Open)
        );

        peer.go_down();
        assert_eq!(
            next_event(&mut rx).await,
            Event::ReadyStateChange(ReadyState::Connecting)
        );

        client.destroy();
        assert_eq!(
            next_event(&mut rx).await,
            Event::ReadyStateChange(ReadyState::Closed)
        );
        assert_eq!(client.ready_state(), ReadyState::Closed);
    }

    #[tokio::test]
    async fn test_destroy_closes_the_link() {
        let (client, mut peer) = pair_client(LookupConfig::new(""));
        client.destroy();
        assert!(timeout(Duration::from_secs(2), peer.recv())
            .await
            .expect("timed out waiting for link close")
            .is_none());
    }
}
