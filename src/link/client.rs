//! Connection manager for the editor link.
//!
//! `EditorLink` is a cheap, cloneable handle. All connection state lives in
//! a single background task that owns the socket, the pending table and the
//! reconnection scheduler; handles talk to it over a channel and get their
//! answers back on one-shot channels. Deadline and retry timers post events
//! into the same task, so every state change is serialized through it.
//!
//! The task never awaits a socket write. Outgoing frames are queued to a
//! per-connection writer task, and a failed write comes back as an event.

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use super::backoff::ReconnectScheduler;
use super::error::LinkError;
use super::pending::{PendingRequest, PendingTable, ReplySender};
use super::timer::ScheduledEvent;
use super::transport::{self, EditorSocket};
use crate::config::LinkConfig;
use crate::protocol::{self, CommandEnvelope, Params};

/// Prefix of every correlation id generated by this side.
const COMMAND_ID_PREFIX: &str = "cmd_";

/// How long a released connection may take to flush and close.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

type SocketReader = SplitStream<EditorSocket>;
type SocketWriter = SplitSink<EditorSocket, Message>;

/// Lifecycle of the editor connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of the link.
#[derive(Debug, Clone, Serialize)]
pub struct LinkStatus {
    pub state: ConnectionState,
    pub endpoint: String,
    /// Commands waiting for a reply.
    pub pending: usize,
    /// Connection attempts that failed since the last successful connect.
    pub failed_attempts: u32,
    /// Delay of the armed retry timer, if one is armed.
    pub retry_in_ms: Option<u64>,
    /// Whether the link will reconnect on its own after a drop.
    pub reconnect_enabled: bool,
    pub connected_since: Option<DateTime<Utc>>,
}

/// Requests from handles to the link task.
enum LinkCommand {
    Connect {
        reply: oneshot::Sender<Result<(), LinkError>>,
    },
    Send {
        kind: String,
        params: Params,
        reply: ReplySender,
    },
    Disconnect,
    Status {
        reply: oneshot::Sender<LinkStatus>,
    },
}

/// Notifications the link task posts to itself.
enum LinkEvent {
    DeadlineElapsed(String),
    ReconnectDue {
        generation: u64,
    },
    ConnectFinished {
        generation: u64,
        result: Result<EditorSocket, LinkError>,
    },
    WriteFailed {
        generation: u64,
        command_id: Option<String>,
        reason: String,
    },
}

/// Handle to the shared editor connection.
///
/// Create one per process with [`EditorLink::new`] and clone it into every
/// caller; all clones share the same socket and correlation counter.
///
/// # Example
///
/// ```ignore
/// use editor_link::{EditorLink, LinkConfig};
/// use serde_json::json;
///
/// let link = EditorLink::new(LinkConfig::default());
/// link.connect().await?;
/// let tree = link.send_command("get_scene_tree", json!({})).await?;
/// ```
#[derive(Clone)]
pub struct EditorLink {
    commands: mpsc::UnboundedSender<LinkCommand>,
    state: watch::Receiver<ConnectionState>,
}

impl EditorLink {
    /// Spawn the link task. Starts `Disconnected`; nothing is opened until
    /// [`connect`](Self::connect) is called.
    ///
    /// Must be called from within a tokio runtime. The task exits once every
    /// handle has been dropped.
    pub fn new(config: LinkConfig) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let task = LinkTask::new(config, commands_rx, state_tx);
        tokio::spawn(task.run());

        Self {
            commands: commands_tx,
            state: state_rx,
        }
    }

    /// Open the connection.
    ///
    /// Returns immediately if already connected. If an attempt is in
    /// progress, waits for its outcome instead of starting another. A failed
    /// attempt is reported here once; retries after that happen in the
    /// background.
    pub async fn connect(&self) -> Result<(), LinkError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(LinkCommand::Connect { reply })
            .map_err(|_| LinkError::Shutdown)?;
        rx.await.map_err(|_| LinkError::Shutdown)?
    }

    /// Close the connection and stop reconnecting.
    ///
    /// Outstanding commands fail with [`LinkError::ConnectionClosed`].
    /// Calling it again is a no-op; a later [`connect`](Self::connect)
    /// re-enables reconnection.
    pub fn disconnect(&self) {
        // A closed channel means the task is already gone.
        let _ = self.commands.send(LinkCommand::Disconnect);
    }

    /// Send a command and wait for the editor's reply.
    ///
    /// `params` must serialize to a JSON object; `()` or `Value::Null` send
    /// an empty object. Fails with [`LinkError::NotConnected`] without
    /// connecting if the link is not connected.
    pub async fn send_command(
        &self,
        kind: &str,
        params: impl Serialize,
    ) -> Result<Value, LinkError> {
        let params = into_params(params)?;
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(LinkCommand::Send {
                kind: kind.to_string(),
                params,
                reply,
            })
            .map_err(|_| LinkError::Shutdown)?;
        rx.await.map_err(|_| LinkError::Shutdown)?
    }

    /// Send a command and deserialize its result.
    pub async fn call<R: DeserializeOwned>(
        &self,
        kind: &str,
        params: impl Serialize,
    ) -> Result<R, LinkError> {
        let value = self.send_command(kind, params).await?;
        serde_json::from_value(value).map_err(|e| LinkError::InvalidResult(e.to_string()))
    }

    /// Snapshot of the connection, pending commands and retry state.
    pub async fn status(&self) -> Result<LinkStatus, LinkError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(LinkCommand::Status { reply })
            .map_err(|_| LinkError::Shutdown)?;
        rx.await.map_err(|_| LinkError::Shutdown)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Receiver that observes every state transition.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }
}

fn into_params(params: impl Serialize) -> Result<Params, LinkError> {
    match serde_json::to_value(params).map_err(|e| LinkError::InvalidParams(e.to_string()))? {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Params::new()),
        other => Err(LinkError::InvalidParams(format!(
            "expected a JSON object, got {}",
            other
        ))),
    }
}

/// Frame queued for the writer task.
struct Outbound {
    message: Message,
    /// Set for command frames, so a failed write can fail that command.
    command_id: Option<String>,
}

/// An open connection. The link task reads from `reader`; everything it
/// sends goes through `outbox` to the writer task, so a peer that stops
/// reading can only stall the writer.
struct Connection {
    reader: SocketReader,
    outbox: mpsc::UnboundedSender<Outbound>,
    writer: JoinHandle<()>,
}

impl Connection {
    fn open(
        socket: EditorSocket,
        events: mpsc::UnboundedSender<LinkEvent>,
        generation: u64,
    ) -> Self {
        let (sink, reader) = socket.split();
        let (outbox, queued) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_frames(sink, queued, events, generation));
        Self {
            reader,
            outbox,
            writer,
        }
    }

    fn queue(&self, message: Message, command_id: Option<String>) -> bool {
        self.outbox
            .send(Outbound {
                message,
                command_id,
            })
            .is_ok()
    }

    /// Let the writer finish and send a close frame, then read until the
    /// peer finishes the close handshake. Gives up after `CLOSE_GRACE`.
    fn release(self) {
        let Connection {
            mut reader,
            outbox,
            mut writer,
        } = self;
        drop(outbox);

        tokio::spawn(async move {
            let finished = tokio::time::timeout(CLOSE_GRACE, async {
                let _ = (&mut writer).await;
                while let Some(Ok(_)) = reader.next().await {}
            })
            .await;
            if finished.is_err() {
                debug!("Connection did not close within {}ms", CLOSE_GRACE.as_millis());
                writer.abort();
            }
        });
    }
}

/// Writer task: sends queued frames in order until the outbox closes, then
/// closes the sink. The first failed write is reported and ends the task.
async fn write_frames(
    mut sink: SocketWriter,
    mut queued: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<LinkEvent>,
    generation: u64,
) {
    while let Some(Outbound {
        message,
        command_id,
    }) = queued.recv().await
    {
        if let Err(e) = sink.send(message).await {
            let _ = events.send(LinkEvent::WriteFailed {
                generation,
                command_id,
                reason: e.to_string(),
            });
            return;
        }
    }

    if let Err(e) = sink.close().await {
        debug!("Close handshake did not complete: {}", e);
    }
}

/// The task that owns the connection.
struct LinkTask {
    config: LinkConfig,
    commands: mpsc::UnboundedReceiver<LinkCommand>,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    events: mpsc::UnboundedReceiver<LinkEvent>,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    connection: Option<Connection>,
    heartbeat: Option<Interval>,
    pending: PendingTable,
    reconnect: ReconnectScheduler,
    /// Cleared by `disconnect()`, set again by `connect()`.
    should_reconnect: bool,
    /// Never reset, so ids stay unique across reconnections.
    next_command_id: u64,
    /// Bumped on every attempt and on disconnect; stale attempt results,
    /// write failures and retry timers carry an older value and are ignored.
    generation: u64,
    attempt: Option<JoinHandle<()>>,
    connect_waiters: Vec<oneshot::Sender<Result<(), LinkError>>>,
    connected_since: Option<DateTime<Utc>>,
}

impl LinkTask {
    fn new(
        config: LinkConfig,
        commands: mpsc::UnboundedReceiver<LinkCommand>,
        state_tx: watch::Sender<ConnectionState>,
    ) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        let reconnect = ReconnectScheduler::new(config.reconnect.clone());
        Self {
            config,
            commands,
            events_tx,
            events,
            state: ConnectionState::Disconnected,
            state_tx,
            connection: None,
            heartbeat: None,
            pending: PendingTable::new(),
            reconnect,
            should_reconnect: true,
            next_command_id: 0,
            generation: 0,
            attempt: None,
            connect_waiters: Vec::new(),
            connected_since: None,
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = self.events.recv() => self.handle_event(event),
                frame = next_frame(&mut self.connection) => self.handle_frame(frame),
                _ = next_tick(&mut self.heartbeat) => self.send_heartbeat(),
            }
        }

        debug!("All editor link handles dropped; shutting down");
        self.handle_disconnect();
    }

    fn handle_command(&mut self, command: LinkCommand) {
        match command {
            LinkCommand::Connect { reply } => self.handle_connect(reply),
            LinkCommand::Send {
                kind,
                params,
                reply,
            } => self.handle_send(kind, params, reply),
            LinkCommand::Disconnect => self.handle_disconnect(),
            LinkCommand::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
    }

    fn handle_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::DeadlineElapsed(id) => {
                if self.pending.expire(&id, self.config.command_timeout) {
                    warn!(
                        "Command {} timed out after {}ms",
                        id,
                        self.config.command_timeout.as_millis()
                    );
                }
            }
            LinkEvent::ReconnectDue { generation } => {
                if generation != self.generation {
                    return;
                }
                self.reconnect.fired();
                if self.should_reconnect && self.state == ConnectionState::Disconnected {
                    debug!(
                        "Reconnecting to {} (attempt {})",
                        self.config.endpoint,
                        self.reconnect.failed_attempts() + 1
                    );
                    self.start_attempt();
                }
            }
            LinkEvent::ConnectFinished { generation, result } => {
                self.finish_attempt(generation, result)
            }
            LinkEvent::WriteFailed {
                generation,
                command_id,
                reason,
            } => {
                if generation == self.generation && self.state == ConnectionState::Connected {
                    self.handle_write_failure(command_id, reason);
                }
            }
        }
    }

    fn handle_connect(&mut self, reply: oneshot::Sender<Result<(), LinkError>>) {
        self.should_reconnect = true;
        match self.state {
            ConnectionState::Connected => {
                let _ = reply.send(Ok(()));
            }
            ConnectionState::Connecting => self.connect_waiters.push(reply),
            ConnectionState::Disconnected => {
                self.connect_waiters.push(reply);
                self.start_attempt();
            }
        }
    }

    fn start_attempt(&mut self) {
        self.reconnect.cancel();
        self.generation += 1;
        self.set_state(ConnectionState::Connecting);

        let generation = self.generation;
        let endpoint = self.config.endpoint.clone();
        let subprotocol = self.config.subprotocol.clone();
        let timeout = self.config.connect_timeout;
        let events = self.events_tx.clone();
        self.attempt = Some(tokio::spawn(async move {
            let result = transport::open(&endpoint, subprotocol.as_deref(), timeout).await;
            let _ = events.send(LinkEvent::ConnectFinished { generation, result });
        }));
    }

    fn finish_attempt(&mut self, generation: u64, result: Result<EditorSocket, LinkError>) {
        if generation != self.generation || self.state != ConnectionState::Connecting {
            if let Ok(socket) = result {
                debug!("Closing socket from a superseded connection attempt");
                Connection::open(socket, self.events_tx.clone(), generation).release();
            }
            return;
        }
        self.attempt = None;

        match result {
            Ok(socket) => {
                self.connection = Some(Connection::open(
                    socket,
                    self.events_tx.clone(),
                    generation,
                ));
                self.heartbeat = self.config.heartbeat_interval.map(|every| {
                    let mut interval = tokio::time::interval_at(Instant::now() + every, every);
                    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    interval
                });
                self.connected_since = Some(Utc::now());
                self.reconnect.connected();
                self.set_state(ConnectionState::Connected);
                info!("Connected to editor at {}", self.config.endpoint);

                for waiter in self.connect_waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
            }
            Err(err) => {
                self.set_state(ConnectionState::Disconnected);
                if self.connect_waiters.is_empty() {
                    debug!("Reconnection to {} failed: {}", self.config.endpoint, err);
                } else {
                    warn!("Connection to {} failed: {}", self.config.endpoint, err);
                }

                for waiter in self.connect_waiters.drain(..) {
                    let _ = waiter.send(Err(err.clone()));
                }
                self.schedule_reconnect();
            }
        }
    }

    fn handle_send(&mut self, kind: String, params: Params, reply: ReplySender) {
        if self.state != ConnectionState::Connected || self.connection.is_none() {
            let _ = reply.send(Err(LinkError::NotConnected));
            return;
        }

        let command_id = format!("{}{}", COMMAND_ID_PREFIX, self.next_command_id);
        self.next_command_id += 1;

        let envelope = CommandEnvelope::new(kind, params, command_id.clone());
        let frame = match protocol::encode(&envelope) {
            Ok(frame) => frame,
            Err(e) => {
                let _ = reply.send(Err(LinkError::Encode(e.to_string())));
                return;
            }
        };

        let deadline = ScheduledEvent::start(
            self.config.command_timeout,
            self.events_tx.clone(),
            LinkEvent::DeadlineElapsed(command_id.clone()),
        );
        self.pending.insert(
            command_id.clone(),
            PendingRequest::new(envelope.kind.clone(), reply, deadline),
        );

        debug!("Sending {} ({})", envelope.kind, command_id);
        let queued = self
            .connection
            .as_ref()
            .is_some_and(|c| c.queue(Message::Text(frame.into()), Some(command_id.clone())));
        if !queued {
            self.handle_write_failure(Some(command_id), "writer stopped".to_string());
        }
    }

    /// Fail the command whose frame could not be written, then treat the
    /// connection as lost.
    fn handle_write_failure(&mut self, command_id: Option<String>, reason: String) {
        if let Some(id) = command_id {
            if self.pending.resolve(&id, Err(LinkError::ConnectionClosed)) {
                warn!("Failed to send {}: {}", id, reason);
            }
        }
        self.handle_close(format!("write failed: {}", reason));
    }

    fn handle_frame(&mut self, frame: Option<Result<Message, WsError>>) {
        match frame {
            Some(Ok(Message::Text(text))) => self.route_reply(text.as_bytes()),
            Some(Ok(Message::Binary(data))) => self.route_reply(&data),
            Some(Ok(Message::Close(close))) => {
                let reason = close
                    .map(|c| format!("closed by editor ({}) {}", c.code, c.reason))
                    .unwrap_or_else(|| "closed by editor".to_string());
                self.handle_close(reason);
            }
            // Pings are answered by the WebSocket layer; pongs need nothing.
            Some(Ok(_)) => {}
            Some(Err(e)) => self.handle_close(format!("socket error: {}", e)),
            None => self.handle_close("stream ended".to_string()),
        }
    }

    fn route_reply(&mut self, frame: &[u8]) {
        let mut envelope = match protocol::decode(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping malformed frame from editor: {}", e);
                return;
            }
        };

        let Some(id) = envelope.command_id.take() else {
            debug!("Dropping frame without commandId");
            return;
        };
        let outcome = envelope.into_outcome().map_err(LinkError::RemoteError);
        if !self.pending.resolve(&id, outcome) {
            debug!("Dropping reply for unknown or expired command {}", id);
        }
    }

    fn handle_close(&mut self, reason: String) {
        if let Some(connection) = self.connection.take() {
            connection.release();
        }
        self.heartbeat = None;
        self.connected_since = None;

        if self.state == ConnectionState::Connected {
            self.set_state(ConnectionState::Disconnected);
            warn!("Connection to editor lost: {}", reason);
        }

        if !self.pending.is_empty() {
            let failed = self.pending.fail_all(LinkError::ConnectionClosed);
            warn!("Failed {} pending command(s) after connection loss", failed);
        }
        self.schedule_reconnect();
    }

    fn handle_disconnect(&mut self) {
        self.should_reconnect = false;
        self.reconnect.cancel();
        self.generation += 1;
        if let Some(attempt) = self.attempt.take() {
            attempt.abort();
        }

        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(LinkError::ConnectionClosed));
        }
        let failed = self.pending.fail_all(LinkError::ConnectionClosed);
        if failed > 0 {
            debug!("Failed {} pending command(s) on disconnect", failed);
        }

        self.heartbeat = None;
        self.connected_since = None;
        if let Some(connection) = self.connection.take() {
            info!("Disconnecting from editor at {}", self.config.endpoint);
            connection.release();
        }
        self.set_state(ConnectionState::Disconnected);
    }

    fn send_heartbeat(&mut self) {
        let Some(connection) = self.connection.as_ref() else {
            return;
        };
        if !connection.queue(Message::Ping(Vec::<u8>::new().into()), None) {
            self.handle_write_failure(None, "heartbeat not queued".to_string());
        }
    }

    fn schedule_reconnect(&mut self) {
        if !self.should_reconnect {
            return;
        }
        let event = LinkEvent::ReconnectDue {
            generation: self.generation,
        };
        if let Some(delay) = self.reconnect.schedule(self.events_tx.clone(), event) {
            info!(
                "Retrying connection to {} in {}ms",
                self.config.endpoint,
                delay.as_millis()
            );
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!("Editor link state: {} -> {}", self.state, state);
        }
        self.state = state;
        self.state_tx.send_replace(state);
    }

    fn status(&self) -> LinkStatus {
        LinkStatus {
            state: self.state,
            endpoint: self.config.endpoint.to_string(),
            pending: self.pending.len(),
            failed_attempts: self.reconnect.failed_attempts(),
            retry_in_ms: self
                .reconnect
                .scheduled_delay()
                .map(|delay| delay.as_millis() as u64),
            reconnect_enabled: self.should_reconnect,
            connected_since: self.connected_since,
        }
    }
}

/// Next frame from the socket, or never if there is no connection.
async fn next_frame(connection: &mut Option<Connection>) -> Option<Result<Message, WsError>> {
    match connection.as_mut() {
        Some(connection) => connection.reader.next().await,
        None => std::future::pending().await,
    }
}

/// Next heartbeat tick, or never if heartbeats are off or not connected.
async fn next_tick(heartbeat: &mut Option<Interval>) {
    match heartbeat.as_mut() {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
