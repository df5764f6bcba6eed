/// Websocket adapter for the backend's row change stream
///
/// Every channel shares one socket speaking Phoenix channel framing:
/// - `phx_join` per channel topic with its `postgres_changes` listeners
/// - `heartbeat` on the `phoenix` topic at a fixed interval
/// - `postgres_changes` frames, routed to the channel named by their topic
/// - `access_token` on every joined topic when the session changes
///
/// The socket opens with the first subscription and closes once the last
/// one is released. Dropped connections are retried after the reconnect
/// interval; every channel then receives `Resync` since changes may have
/// been missed while offline.
use crate::{
    backend::{ChangeEvent, ChangeFilter, ChangeKind, Realtime, Row, Subscription},
    config::RealtimeConfig,
    error::WallResult,
    model::Session,
};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Deserialize)]
struct Frame {
    #[serde(default)]
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Deserialize)]
struct ChangeData {
    #[serde(rename = "type")]
    kind: String,
    table: String,
    #[serde(default)]
    record: Option<Row>,
    #[serde(default)]
    old_record: Option<Row>,
}

/// Instruction from subscription handles to the socket task
#[derive(Debug, PartialEq)]
enum Command {
    Join(String),
    Leave(String),
}

/// Why a connection ended
enum Disconnect {
    /// No channel is left; stop for good
    Idle,
    /// Connection lost; reconnect
    Dropped,
}

struct Channel {
    name: String,
    listeners: Vec<ChangeFilter>,
    sender: mpsc::Sender<ChangeEvent>,
}

/// Channels registered on the shared socket, keyed by topic
#[derive(Default)]
struct Channels {
    by_topic: HashMap<String, Channel>,
    /// Inbox of the running socket task, if any
    commands: Option<mpsc::UnboundedSender<Command>>,
}

impl Channels {
    /// Topic for channel `name`; suffixed when the plain topic is taken
    fn free_topic(&self, name: &str) -> String {
        let base = format!("realtime:{}", name);
        if !self.by_topic.contains_key(&base) {
            return base;
        }
        let mut n = 2;
        loop {
            let topic = format!("{}#{}", base, n);
            if !self.by_topic.contains_key(&topic) {
                return topic;
            }
            n += 1;
        }
    }

    /// Channel sender and event for a text frame, if it is a change for a
    /// registered channel
    ///
    /// Row predicates were applied by the server when it routed the change
    /// to this topic; only the kind and collection are checked here.
    fn route(&self, text: &str) -> Option<(mpsc::Sender<ChangeEvent>, ChangeEvent)> {
        let (topic, event) = parse_frame(text)?;
        let Some(channel) = self.by_topic.get(&topic) else {
            debug!("Change for released topic {}", topic);
            return None;
        };
        if !channel.listeners.iter().any(|l| l.covers(&event)) {
            debug!("Unexpected {:?} change on channel {}", event.kind(), channel.name);
            return None;
        }
        Some((channel.sender.clone(), event))
    }

    /// Drop channels whose receiver is gone; when none remain, detach the
    /// socket task and report that it should stop
    fn retire_if_idle(&mut self) -> bool {
        self.by_topic.retain(|_, c| !c.sender.is_closed());
        if self.by_topic.is_empty() {
            self.commands = None;
            true
        } else {
            false
        }
    }
}

fn release(channels: &Weak<Mutex<Channels>>, topic: String) {
    let Some(shared) = channels.upgrade() else {
        return;
    };
    let mut channels = shared.lock();
    if let Some(channel) = channels.by_topic.remove(&topic) {
        debug!("Releasing realtime channel {}", channel.name);
        if let Some(commands) = &channels.commands {
            let _ = commands.send(Command::Leave(topic));
        }
    }
}

/// Realtime client for the hosted backend
pub struct RealtimeClient {
    socket_url: String,
    config: RealtimeConfig,
    session: watch::Receiver<Option<Session>>,
    channels: Arc<Mutex<Channels>>,
}

impl RealtimeClient {
    pub fn new(
        base_url: &str,
        anon_key: &str,
        config: RealtimeConfig,
        session: watch::Receiver<Option<Session>>,
    ) -> Self {
        Self {
            socket_url: socket_url(base_url, anon_key),
            config,
            session,
            channels: Arc::new(Mutex::new(Channels::default())),
        }
    }

    /// Number of channels currently registered on the socket
    pub fn channel_count(&self) -> usize {
        self.channels.lock().by_topic.len()
    }

    fn spawn_connection(&self) -> mpsc::UnboundedSender<Command> {
        let (commands, inbox) = mpsc::unbounded_channel();
        let connection = Connection {
            socket_url: self.socket_url.clone(),
            config: self.config.clone(),
            session: self.session.clone(),
            channels: self.channels.clone(),
            next_ref: 0,
        };
        tokio::spawn(connection.run(inbox));
        commands
    }
}

/// Socket task shared by every channel of a client
struct Connection {
    socket_url: String,
    config: RealtimeConfig,
    session: watch::Receiver<Option<Session>>,
    channels: Arc<Mutex<Channels>>,
    next_ref: u64,
}

impl Connection {
    fn next_ref(&mut self) -> u64 {
        self.next_ref += 1;
        self.next_ref
    }

    fn access_token(&self) -> Option<String> {
        self.session.borrow().as_ref().map(|s| s.access_token.clone())
    }

    fn join(&mut self, topic: &str) -> Option<Value> {
        let listeners = self
            .channels
            .lock()
            .by_topic
            .get(topic)
            .map(|c| c.listeners.clone())?;
        let token = self.access_token();
        let join_ref = self.next_ref();
        Some(join_frame(topic, &listeners, token.as_deref(), join_ref))
    }

    fn retire_if_idle(&self) -> bool {
        self.channels.lock().retire_if_idle()
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut connected_before = false;

        loop {
            if self.retire_if_idle() {
                debug!("No realtime channels left");
                return;
            }
            info!("Connecting realtime socket");

            match connect_async(self.socket_url.as_str()).await {
                Ok((socket, _)) => {
                    info!("Realtime socket connected");
                    if connected_before {
                        self.resync_all().await;
                    }
                    connected_before = true;

                    if let Disconnect::Idle = self.stream(socket, &mut commands).await {
                        debug!("Realtime socket closed after the last channel left");
                        return;
                    }
                    info!("Realtime socket disconnected");
                }
                Err(e) => {
                    error!("Failed to connect realtime socket: {}", e);
                }
            }

            if self.retire_if_idle() {
                return;
            }
            info!(
                "Reconnecting realtime socket in {} seconds...",
                self.config.reconnect_interval_secs
            );
            tokio::time::sleep(Duration::from_secs(self.config.reconnect_interval_secs)).await;
        }
    }

    async fn resync_all(&self) {
        let senders: Vec<(String, mpsc::Sender<ChangeEvent>)> = self
            .channels
            .lock()
            .by_topic
            .values()
            .map(|c| (c.name.clone(), c.sender.clone()))
            .collect();
        for (name, sender) in senders {
            debug!("Resyncing realtime channel {}", name);
            let _ = sender.send(ChangeEvent::Resync).await;
        }
    }

    async fn stream(
        &mut self,
        socket: Socket,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> Disconnect {
        let (mut sink, mut source) = socket.split();

        // Queued joins are covered by joining every registered channel now
        let topics: Vec<String> = {
            let channels = self.channels.lock();
            while commands.try_recv().is_ok() {}
            channels.by_topic.keys().cloned().collect()
        };
        for topic in topics {
            let Some(join) = self.join(&topic) else {
                continue;
            };
            if let Err(e) = sink.send(Message::Text(join.to_string())).await {
                error!("Failed to join {}: {}", topic, e);
                return Disconnect::Dropped;
            }
        }

        let period = Duration::from_secs(self.config.heartbeat_interval_secs.max(1));
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let mut session_open = true;

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let frame = match command {
                        Some(Command::Join(topic)) => self.join(&topic),
                        Some(Command::Leave(topic)) => Some(json!({
                            "topic": topic,
                            "event": "phx_leave",
                            "payload": {},
                            "ref": self.next_ref().to_string(),
                        })),
                        None => None,
                    };
                    if let Some(frame) = frame {
                        if let Err(e) = sink.send(Message::Text(frame.to_string())).await {
                            error!("Failed to send channel command: {}", e);
                            return Disconnect::Dropped;
                        }
                    }
                    if self.retire_if_idle() {
                        let _ = sink.send(Message::Close(None)).await;
                        return Disconnect::Idle;
                    }
                }
                _ = heartbeat.tick() => {
                    let beat = json!({
                        "topic": "phoenix",
                        "event": "heartbeat",
                        "payload": {},
                        "ref": self.next_ref().to_string(),
                    });
                    if let Err(e) = sink.send(Message::Text(beat.to_string())).await {
                        error!("Failed to send heartbeat: {}", e);
                        return Disconnect::Dropped;
                    }
                }
                changed = self.session.changed(), if session_open => {
                    if changed.is_err() {
                        session_open = false;
                        continue;
                    }
                    let Some(token) = self.access_token() else {
                        continue;
                    };
                    let topics: Vec<String> = self.channels.lock().by_topic.keys().cloned().collect();
                    for topic in topics {
                        let frame = json!({
                            "topic": topic,
                            "event": "access_token",
                            "payload": { "access_token": token },
                            "ref": self.next_ref().to_string(),
                        });
                        if let Err(e) = sink.send(Message::Text(frame.to_string())).await {
                            error!("Failed to refresh token on {}: {}", topic, e);
                            return Disconnect::Dropped;
                        }
                    }
                }
                msg = source.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            let delivery = self.channels.lock().route(&text);
                            if let Some((sender, event)) = delivery {
                                // A closed sender was released while the frame was in flight
                                let _ = sender.send(event).await;
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = sink.send(Message::Pong(data)).await {
                                error!("Failed to send pong: {}", e);
                                return Disconnect::Dropped;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => return Disconnect::Dropped,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!("Realtime socket error: {}", e);
                            return Disconnect::Dropped;
                        }
                    }
                }
            }
        }
    }
}

/// Websocket endpoint derived from the backend's HTTP base URL
fn socket_url(base_url: &str, anon_key: &str) -> String {
    let ws_base = base_url
        .trim_end_matches('/')
        .replace("https://", "wss://")
        .replace("http://", "ws://");
    format!(
        "{}/realtime/v1/websocket?apikey={}&vsn=1.0.0",
        ws_base,
        urlencoding::encode(anon_key)
    )
}

/// `phx_join` frame registering the channel's listeners
fn join_frame(
    topic: &str,
    listeners: &[ChangeFilter],
    access_token: Option<&str>,
    join_ref: u64,
) -> Value {
    let changes: Vec<Value> = listeners
        .iter()
        .map(|l| {
            let mut entry = json!({
                "event": l.event.as_str(),
                "schema": "public",
                "table": l.collection,
            });
            if let Some(filter) = &l.filter {
                entry["filter"] = json!(format!("{}=eq.{}", filter.column, filter.value));
            }
            entry
        })
        .collect();

    let mut payload = json!({
        "config": {
            "broadcast": { "self": false },
            "presence": { "key": "" },
            "postgres_changes": changes,
        }
    });
    if let Some(token) = access_token {
        payload["access_token"] = json!(token);
    }

    json!({
        "topic": topic,
        "event": "phx_join",
        "payload": payload,
        "ref": join_ref.to_string(),
        "join_ref": join_ref.to_string(),
    })
}

/// Decode a text frame into its topic and change event, ignoring control
/// traffic
pub fn parse_frame(text: &str) -> Option<(String, ChangeEvent)> {
    let frame: Frame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("Failed to parse realtime frame: {}", e);
            return None;
        }
    };

    match frame.event.as_str() {
        "postgres_changes" => {}
        "phx_reply" => {
            if frame.payload.get("status").and_then(Value::as_str) == Some("error") {
                warn!("Realtime join rejected on {}: {}", frame.topic, frame.payload);
            }
            return None;
        }
        "system" | "presence_state" | "presence_diff" | "phx_close" | "phx_error" => {
            debug!("Realtime {} on {}", frame.event, frame.topic);
            return None;
        }
        other => {
            debug!("Ignoring realtime event {}", other);
            return None;
        }
    }

    let data: ChangeData = match frame
        .payload
        .get("data")
        .cloned()
        .map(serde_json::from_value)
    {
        Some(Ok(data)) => data,
        Some(Err(e)) => {
            warn!("Malformed change payload on {}: {}", frame.topic, e);
            return None;
        }
        None => return None,
    };

    let kind = match data.kind.as_str() {
        "INSERT" => ChangeKind::Insert,
        "UPDATE" => ChangeKind::Update,
        "DELETE" => ChangeKind::Delete,
        other => {
            warn!("Unknown change type {}", other);
            return None;
        }
    };

    let empty = || Value::Object(Default::default());
    let event = match kind {
        ChangeKind::Insert => ChangeEvent::Insert {
            collection: data.table,
            record: data.record.unwrap_or_else(empty),
        },
        ChangeKind::Update => ChangeEvent::Update {
            collection: data.table,
            record: data.record.unwrap_or_else(empty),
            old_record: data.old_record.unwrap_or_else(empty),
        },
        _ => ChangeEvent::Delete {
            collection: data.table,
            old_record: data.old_record.unwrap_or_else(empty),
        },
    };
    Some((frame.topic, event))
}

#[async_trait]
impl Realtime for RealtimeClient {
    async fn subscribe(
        &self,
        channel: &str,
        listeners: Vec<ChangeFilter>,
    ) -> WallResult<Subscription<ChangeEvent>> {
        let (sender, receiver) = mpsc::channel(self.config.buffer_size.max(1));

        let topic = {
            let mut channels = self.channels.lock();
            let topic = channels.free_topic(channel);
            channels.by_topic.insert(
                topic.clone(),
                Channel {
                    name: channel.to_string(),
                    listeners,
                    sender,
                },
            );
            let commands = match &channels.commands {
                Some(commands) if !commands.is_closed() => commands.clone(),
                _ => {
                    let commands = self.spawn_connection();
                    channels.commands = Some(commands.clone());
                    commands
                }
            };
            // Sent under the lock so a connecting socket never joins twice
            let _ = commands.send(Command::Join(topic.clone()));
            topic
        };
        debug!("Realtime channel {} registered as {}", channel, topic);

        let channels = Arc::downgrade(&self.channels);
        Ok(Subscription::new(receiver, move || release(&channels, topic)))
    }
}
