// src/realtime/channel.rs
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;
use uuid::Uuid;

use crate::errors::OkadaError;
use crate::models::connection::ConnectionState;

/// Event names exchanged with the realtime backend.
pub mod events {
    pub const NEW_DRIVER_POSITION: &str = "new_driver_position";
    pub const CHANGE_DRIVER_POSITION: &str = "change_driver_position";
    pub const DRIVER_DISCONNECTED: &str = "driver_disconnected";
    pub const NEW_CLIENT_REQUEST: &str = "new_client_request";
    pub const NEW_DRIVER_ASSIGNED: &str = "new_driver_assigned";
    pub const UPDATE_STATUS_TRIP: &str = "update_status_trip";

    pub fn created_driver_offer(trip_id: i64) -> String {
        format!("created_driver_offer/{}", trip_id)
    }

    pub fn new_status_trip(trip_id: i64) -> String {
        format!("new_status_trip/{}", trip_id)
    }

    pub fn trip_new_driver_position(rider_id: i64) -> String {
        format!("trip_new_driver_position/{}", rider_id)
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("not connected")]
    NotConnected,

    #[error("send failed: {0}")]
    Send(String),

    #[error("bad frame: {0}")]
    BadFrame(#[from] serde_json::Error),
}

impl From<ChannelError> for OkadaError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::NotConnected => OkadaError::ChannelClosed,
            other => OkadaError::Connection(other.to_string()),
        }
    }
}

/// Handle for one named-event subscription. Holds the receiving end; the
/// sender side is detached from the channel's registry when this is dropped,
/// so a screen unmount cannot leak a live handler.
pub struct EventSubscription {
    id: u64,
    event: String,
    rx: mpsc::UnboundedReceiver<Value>,
    registry: Arc<SubscriptionRegistry>,
}

impl EventSubscription {
    pub async fn next(&mut self) -> Option<Value> {
        self.rx.recv().await
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.registry.unsubscribe(&self.event, self.id);
    }
}

/// Persistent full-duplex message channel to the realtime backend.
///
/// `connect` resolves `Ok(false)` when no confirmation arrives within the
/// transport's own bound; callers must check the flag (or race an explicit
/// confirmation) instead of assuming success.
#[async_trait]
pub trait RealtimeChannel: Send + Sync {
    async fn connect(&self, token: &str) -> Result<bool, ChannelError>;

    async fn disconnect(&self);

    fn connection_state(&self) -> ConnectionState;

    fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Registers interest in a named event. Subscriptions on the same
    /// channel are independent; adding or dropping one never disturbs the
    /// others.
    fn on(&self, event: &str) -> EventSubscription;

    /// Eagerly releases a subscription (dropping the handle does the same).
    fn off(&self, subscription: &EventSubscription);

    async fn emit(&self, event: &str, payload: Value) -> Result<(), ChannelError>;

    /// Swaps the bearer token used by the next connect.
    fn set_token(&self, token: &str);
}

/// Fan-out table from event name to live subscriber senders.
pub(crate) struct SubscriptionRegistry {
    next_id: AtomicU64,
    senders: Mutex<HashMap<String, Vec<(u64, mpsc::UnboundedSender<Value>)>>>,
}

impl SubscriptionRegistry {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            senders: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn subscribe(registry: &Arc<Self>, event: &str) -> EventSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = registry.next_id.fetch_add(1, Ordering::Relaxed);
        registry
            .senders
            .lock()
            .unwrap()
            .entry(event.to_string())
            .or_default()
            .push((id, tx));
        EventSubscription {
            id,
            event: event.to_string(),
            rx,
            registry: Arc::clone(registry),
        }
    }

    pub(crate) fn unsubscribe(&self, event: &str, id: u64) {
        let mut senders = self.senders.lock().unwrap();
        if let Some(list) = senders.get_mut(event) {
            list.retain(|(sub_id, _)| *sub_id != id);
            if list.is_empty() {
                senders.remove(event);
            }
        }
    }

    /// Delivers a payload to every subscriber of `event`, pruning receivers
    /// that have gone away. Returns how many subscribers got the message.
    pub(crate) fn dispatch(&self, event: &str, payload: Value) -> usize {
        let mut senders = self.senders.lock().unwrap();
        let Some(list) = senders.get_mut(event) else {
            return 0;
        };
        list.retain(|(_, tx)| tx.send(payload.clone()).is_ok());
        let delivered = list.len();
        if list.is_empty() {
            senders.remove(event);
        }
        delivered
    }

    pub(crate) fn active_events(&self) -> Vec<String> {
        self.senders.lock().unwrap().keys().cloned().collect()
    }
}

/// Wire envelope: `{"event": "...", "data": ...}` in both directions.
#[derive(Debug, Serialize, Deserialize)]
struct WireFrame {
    event: String,
    data: Value,
}

type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// WebSocket-backed channel. A read-pump task fans incoming frames out to the
/// subscription registry; a writer task drains an outbound queue into the
/// socket. The registry survives reconnects, so a fresh socket picks up
/// existing subscriptions via the subscribe announcement sent on connect.
pub struct WsChannel {
    endpoint: String,
    connect_timeout: std::time::Duration,
    token: Mutex<String>,
    state: Arc<Mutex<ConnectionState>>,
    registry: Arc<SubscriptionRegistry>,
    outbound: Mutex<Option<mpsc::UnboundedSender<WireFrame>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
}

impl WsChannel {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            connect_timeout: std::time::Duration::from_millis(5000),
            token: Mutex::new(String::new()),
            state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
            registry: SubscriptionRegistry::new(),
            outbound: Mutex::new(None),
            reader_task: Mutex::new(None),
            writer_task: Mutex::new(None),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state;
    }

    fn connect_url(&self, token: &str) -> Result<Url, ChannelError> {
        let mut url =
            Url::parse(&self.endpoint).map_err(|e| ChannelError::Connect(e.to_string()))?;
        url.query_pairs_mut().append_pair("token", token);
        Ok(url)
    }

    fn spawn_read_pump(&self, mut reader: WsReader) {
        let registry = Arc::clone(&self.registry);
        let state = Arc::clone(&self.state);
        let handle = tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<WireFrame>(&text) {
                        Ok(wire) => {
                            let delivered = registry.dispatch(&wire.event, wire.data);
                            tracing::trace!("dispatched {} to {} subscribers", wire.event, delivered);
                        }
                        Err(e) => tracing::debug!("dropping unparseable frame: {}", e),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!("websocket read error: {}", e);
                        break;
                    }
                }
            }
            // Socket is gone; the supervisor's health probe notices and
            // drives reconnection.
            *state.lock().unwrap() = ConnectionState::Disconnected;
            tracing::info!("realtime socket closed");
        });
        if let Some(old) = self.reader_task.lock().unwrap().replace(handle) {
            old.abort();
        }
    }

    fn spawn_writer(&self, mut sink: WsWriter, mut queue: mpsc::UnboundedReceiver<WireFrame>) {
        let state = Arc::clone(&self.state);
        let handle = tokio::spawn(async move {
            while let Some(frame) = queue.recv().await {
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::debug!("unencodable outbound frame: {}", e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text)).await {
                    tracing::debug!("websocket write error: {}", e);
                    *state.lock().unwrap() = ConnectionState::Disconnected;
                    break;
                }
            }
            let _ = sink.send(Message::Close(None)).await;
        });
        if let Some(old) = self.writer_task.lock().unwrap().replace(handle) {
            old.abort();
        }
    }

    fn queue_frame(&self, frame: WireFrame) -> Result<(), ChannelError> {
        let outbound = self.outbound.lock().unwrap();
        let tx = outbound.as_ref().ok_or(ChannelError::NotConnected)?;
        tx.send(frame).map_err(|_| ChannelError::NotConnected)
    }
}

#[async_trait]
impl RealtimeChannel for WsChannel {
    async fn connect(&self, token: &str) -> Result<bool, ChannelError> {
        self.set_token(token);
        self.set_state(ConnectionState::Connecting);

        let attempt_id = Uuid::new_v4();
        let url = self.connect_url(token)?;
        tracing::debug!("opening websocket, attempt {}", attempt_id);

        let connected = match timeout(self.connect_timeout, connect_async(url.as_str())).await {
            Err(_) => {
                tracing::warn!("websocket connect timed out, attempt {}", attempt_id);
                self.set_state(ConnectionState::Disconnected);
                return Ok(false);
            }
            Ok(Err(e)) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(ChannelError::Connect(e.to_string()));
            }
            Ok(Ok((stream, _response))) => stream,
        };

        let (writer, reader) = connected.split();

        let (tx, rx) = mpsc::unbounded_channel();
        self.spawn_writer(writer, rx);
        self.spawn_read_pump(reader);
        *self.outbound.lock().unwrap() = Some(tx);
        self.set_state(ConnectionState::Connected);

        // Re-announce interest accumulated while offline so the server
        // resumes pushing without waiting for each owner to resubscribe.
        let active = self.registry.active_events();
        if !active.is_empty() {
            self.queue_frame(WireFrame {
                event: "subscribe".to_string(),
                data: serde_json::json!({ "events": active }),
            })?;
        }

        tracing::info!("realtime socket connected, attempt {}", attempt_id);
        Ok(true)
    }

    async fn disconnect(&self) {
        if let Some(task) = self.reader_task.lock().unwrap().take() {
            task.abort();
        }
        // Dropping the queue sender lets the writer task flush and close.
        self.outbound.lock().unwrap().take();
        self.writer_task.lock().unwrap().take();
        self.set_state(ConnectionState::Disconnected);
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    fn on(&self, event: &str) -> EventSubscription {
        let subscription = SubscriptionRegistry::subscribe(&self.registry, event);
        // Announce the new interest if a socket is up; if not, the next
        // connect announces everything at once.
        if self.is_connected() {
            let announced = self.queue_frame(WireFrame {
                event: "subscribe".to_string(),
                data: serde_json::json!({ "events": [event] }),
            });
            if let Err(e) = announced {
                tracing::debug!("subscribe announcement failed: {}", e);
            }
        }
        subscription
    }

    fn off(&self, subscription: &EventSubscription) {
        self.registry
            .unsubscribe(subscription.event(), subscription.id());
    }

    async fn emit(&self, event: &str, payload: Value) -> Result<(), ChannelError> {
        self.queue_frame(WireFrame {
            event: event.to_string(),
            data: payload,
        })
    }

    fn set_token(&self, token: &str) {
        *self.token.lock().unwrap() = token.to_string();
    }
}

/// In-process channel for tests and offline development. `push` plays the
/// server role; connect outcomes are scriptable per attempt.
pub struct InMemoryChannel {
    registry: Arc<SubscriptionRegistry>,
    state: Mutex<ConnectionState>,
    token: Mutex<String>,
    connect_script: Mutex<Vec<bool>>,
    connect_calls: AtomicU32,
    emitted: Mutex<Vec<(String, Value)>>,
}

impl InMemoryChannel {
    pub fn new() -> Self {
        Self {
            registry: SubscriptionRegistry::new(),
            state: Mutex::new(ConnectionState::Disconnected),
            token: Mutex::new(String::new()),
            connect_script: Mutex::new(Vec::new()),
            connect_calls: AtomicU32::new(0),
            emitted: Mutex::new(Vec::new()),
        }
    }

    /// Pre-loads outcomes for successive `connect` calls; once the script is
    /// exhausted every connect succeeds.
    pub fn script_connect_results(&self, outcomes: impl IntoIterator<Item = bool>) {
        let mut script = self.connect_script.lock().unwrap();
        script.clear();
        script.extend(outcomes);
    }

    pub fn connect_attempts(&self) -> u32 {
        self.connect_calls.load(Ordering::Relaxed)
    }

    pub fn current_token(&self) -> String {
        self.token.lock().unwrap().clone()
    }

    /// Simulates a server push. Returns the number of subscribers reached.
    pub fn push(&self, event: &str, payload: Value) -> usize {
        self.registry.dispatch(event, payload)
    }

    pub fn emitted(&self) -> Vec<(String, Value)> {
        self.emitted.lock().unwrap().clone()
    }

    pub fn force_disconnect(&self) {
        *self.state.lock().unwrap() = ConnectionState::Disconnected;
    }
}

impl Default for InMemoryChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RealtimeChannel for InMemoryChannel {
    async fn connect(&self, token: &str) -> Result<bool, ChannelError> {
        self.connect_calls.fetch_add(1, Ordering::Relaxed);
        *self.token.lock().unwrap() = token.to_string();

        let outcome = {
            let mut script = self.connect_script.lock().unwrap();
            if script.is_empty() {
                true
            } else {
                script.remove(0)
            }
        };

        *self.state.lock().unwrap() = if outcome {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        };
        Ok(outcome)
    }

    async fn disconnect(&self) {
        *self.state.lock().unwrap() = ConnectionState::Disconnected;
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    fn on(&self, event: &str) -> EventSubscription {
        SubscriptionRegistry::subscribe(&self.registry, event)
    }

    fn off(&self, subscription: &EventSubscription) {
        self.registry
            .unsubscribe(subscription.event(), subscription.id());
    }

    async fn emit(&self, event: &str, payload: Value) -> Result<(), ChannelError> {
        if !self.is_connected() {
            return Err(ChannelError::NotConnected);
        }
        self.emitted
            .lock()
            .unwrap()
            .push((event.to_string(), payload));
        Ok(())
    }

    fn set_token(&self, token: &str) {
        *self.token.lock().unwrap() = token.to_string();
    }
}
