//! Client implementation.
//!
//! The client maintains:
//! - One WebSocket to the server, read by a background task
//! - The identity handshake, completed inside `connect`
//! - Request/reply correlation (ack ids or callback names, per transport)
//! - A backlog of pushed events and a snapshot history

use std::collections::VecDeque;
use std::time::Duration;

use anyhow::{bail, Context};
use bytes::Bytes;
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use realm_shared::{
    codec::{decode_envelope, decode_room, encode_envelope, encode_room, Envelope, Frame, RoomFrame},
    config::{Codec, TransportKind},
    ids::{ConnectionId, UserId, WorldId},
    protocol::{
        ChangeWorldReply, Command, ControlsPayload, LeaveWorldReply, PendingIdentity, ReplyTo,
        ServerEvent, CHANGE_WORLD_CALLBACK, IDENTITY_ACK, LEAVE_WORLD_CALLBACK, UPDATE_CALLBACK,
    },
    snapshot::Snapshot,
};
use serde_json::{json, Value};
use tokio::{net::TcpStream, sync::mpsc, task::JoinHandle, time::Instant};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use crate::interp::SnapshotBuffer;

/// How long `connect` waits for the server to assign an identity.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// Default wait for a correlated reply.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// What the reader task hands to the client.
#[derive(Debug)]
enum Incoming {
    Event(ServerEvent),
    Reply { to: ReplyTo, payload: Value },
    Closed { code: u16, reason: String },
}

/// Client connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientState {
    /// Identity confirmed, socket open.
    Connected,
    /// The server closed the socket (code, reason), or it dropped.
    Closed { code: u16, reason: String },
}

/// Headless session client.
pub struct RealmClient {
    pub kind: TransportKind,
    pub codec: Codec,
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    /// World the server picked at connect time, if any.
    pub assigned_world: Option<WorldId>,
    pub state: ClientState,
    pub snaps: SnapshotBuffer,

    sink: WsSink,
    incoming: mpsc::Receiver<Incoming>,
    reader: JoinHandle<()>,
    backlog: VecDeque<ServerEvent>,
    next_ack: u64,
    request_timeout: Duration,
}

impl RealmClient {
    /// Connects to `url` (e.g. `ws://127.0.0.1:3000`) and completes the
    /// identity handshake.
    pub async fn connect(url: &str, kind: TransportKind, codec: Codec) -> anyhow::Result<Self> {
        info!(server = %url, transport = ?kind, "Connecting to server");
        let (ws, _) = connect_async(url)
            .await
            .with_context(|| format!("connect {url}"))?;
        let (sink, source) = ws.split();
        let (tx, incoming) = mpsc::channel(256);
        let reader = tokio::spawn(read_loop(source, kind, tx));

        let mut client = Self {
            kind,
            codec,
            connection_id: ConnectionId::new(""),
            user_id: UserId::new(""),
            assigned_world: None,
            state: ClientState::Connected,
            snaps: SnapshotBuffer::new(32),
            sink,
            incoming,
            reader,
            backlog: VecDeque::new(),
            next_ack: IDENTITY_ACK + 1,
            request_timeout: REQUEST_TIMEOUT,
        };
        let pending = client.await_identity().await?;
        client.confirm_identity(pending).await?;
        info!(
            connection = %client.connection_id,
            user = %client.user_id,
            world = ?client.assigned_world,
            "Connected to server"
        );
        Ok(client)
    }

    pub fn set_request_timeout(&mut self, timeout: Duration) {
        self.request_timeout = timeout;
    }

    async fn await_identity(&mut self) -> anyhow::Result<PendingIdentity> {
        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
        loop {
            match self.recv_until(deadline).await? {
                Some(Incoming::Event(ServerEvent::IdentityAssigned(pending))) => return Ok(pending),
                Some(Incoming::Event(other)) => self.absorb(other),
                Some(Incoming::Reply { to, .. }) => debug!(?to, "reply before handshake"),
                Some(Incoming::Closed { code, reason }) => {
                    bail!("closed during handshake: {code} {reason}")
                }
                None => bail!("no identity assigned within {HANDSHAKE_TIMEOUT:?}"),
            }
        }
    }

    async fn confirm_identity(&mut self, pending: PendingIdentity) -> anyhow::Result<()> {
        self.connection_id = pending.connection_id;
        self.user_id = UserId::from_sequence(pending.sequence_counter);
        self.assigned_world = pending.world_id;
        let confirm = Command::IdentityConfirm {
            user_id: self.user_id.clone(),
        };
        match self.kind {
            TransportKind::Rooms => {
                let frame = RoomFrame::reply(IDENTITY_ACK, json!({ "userId": self.user_id }));
                self.write(encode_room(&frame)?).await
            }
            TransportKind::Manual => self.send(&confirm).await,
        }
    }

    /// Sends a command without waiting for anything back.
    pub async fn send(&mut self, command: &Command) -> anyhow::Result<()> {
        let frame = match self.kind {
            TransportKind::Rooms => {
                let (name, data) = command.to_parts(&self.connection_id)?;
                encode_room(&RoomFrame::event(name, data))?
            }
            TransportKind::Manual => {
                let envelope = Envelope::from_command(command, &self.connection_id)?;
                encode_envelope(self.codec, &envelope)?
            }
        };
        self.write(frame).await
    }

    /// Sends a command and waits for its correlated reply.
    pub async fn request(&mut self, command: &Command) -> anyhow::Result<Value> {
        let key = match self.kind {
            TransportKind::Rooms => {
                let ack = self.next_ack;
                self.next_ack += 1;
                let (name, data) = command.to_parts(&self.connection_id)?;
                self.write(encode_room(&RoomFrame::request(name, data, ack))?)
                    .await?;
                ReplyTo::Ack(ack)
            }
            TransportKind::Manual => {
                let callback = command
                    .callback_name()
                    .with_context(|| format!("{} has no reply", command.name()))?;
                self.send(command).await?;
                ReplyTo::Event(callback)
            }
        };

        let deadline = Instant::now() + self.request_timeout;
        loop {
            match self.recv_until(deadline).await? {
                Some(Incoming::Reply { to, payload }) if to == key => return Ok(payload),
                Some(Incoming::Reply { to, .. }) => debug!(?to, "stale reply dropped"),
                Some(Incoming::Event(event)) => self.absorb(event),
                Some(Incoming::Closed { code, reason }) => {
                    self.state = ClientState::Closed {
                        code,
                        reason: reason.clone(),
                    };
                    bail!("connection closed: {code} {reason}");
                }
                None => bail!("no reply to {} within {:?}", command.name(), self.request_timeout),
            }
        }
    }

    /// Heartbeat. Returns the snapshot when the server answers with one.
    pub async fn update(&mut self, ping: Option<f64>) -> anyhow::Result<Option<Snapshot>> {
        let reply = self
            .request(&Command::Update {
                timestamp: Some(chrono::Utc::now().timestamp_millis()),
                ping,
            })
            .await?;
        if reply.as_object().map_or(true, |m| m.is_empty()) {
            return Ok(None);
        }
        let snapshot: Snapshot = serde_json::from_value(reply).context("decode snapshot reply")?;
        self.snaps.push(snapshot.clone());
        Ok(Some(snapshot))
    }

    pub async fn change_world(&mut self, world: &WorldId) -> anyhow::Result<ChangeWorldReply> {
        let reply = self
            .request(&Command::ChangeWorld {
                world_id: world.clone(),
            })
            .await?;
        serde_json::from_value(reply).context("decode changeWorld reply")
    }

    pub async fn change_world_finish(&mut self, world: &WorldId) -> anyhow::Result<()> {
        self.send(&Command::ChangeWorldFinish {
            world_id: world.clone(),
        })
        .await
    }

    /// `changeWorld` followed by `changeWorldFinish`.
    pub async fn enter_world(&mut self, world: &WorldId) -> anyhow::Result<ChangeWorldReply> {
        let reply = self.change_world(world).await?;
        self.change_world_finish(world).await?;
        Ok(reply)
    }

    pub async fn leave_world(&mut self) -> anyhow::Result<LeaveWorldReply> {
        let reply = self.request(&Command::LeaveWorld { world_id: None }).await?;
        serde_json::from_value(reply).context("decode leaveWorld reply")
    }

    pub async fn set_map(&mut self, map: &str) -> anyhow::Result<()> {
        self.send(&Command::SetMap {
            map_name: map.to_string(),
        })
        .await
    }

    pub async fn set_scenario(&mut self, scenario: &str) -> anyhow::Result<()> {
        self.send(&Command::SetScenario {
            scenario_name: scenario.to_string(),
        })
        .await
    }

    pub async fn chat(&mut self, message: &str) -> anyhow::Result<()> {
        self.send(&Command::ChatMessage {
            message: message.to_string(),
        })
        .await
    }

    pub async fn controls(&mut self, controls: ControlsPayload) -> anyhow::Result<()> {
        self.send(&Command::Controls {
            kind: controls.kind,
            data: controls.data,
        })
        .await
    }

    /// Next pushed event, waiting up to `timeout`. `Ok(None)` on timeout or
    /// once the socket is closed.
    pub async fn next_event(&mut self, timeout: Duration) -> anyhow::Result<Option<ServerEvent>> {
        if let Some(event) = self.backlog.pop_front() {
            return Ok(Some(event));
        }
        let deadline = Instant::now() + timeout;
        loop {
            match self.recv_until(deadline).await? {
                Some(Incoming::Event(event)) => {
                    if let ServerEvent::StateUpdate(snapshot) = &event {
                        self.snaps.push(snapshot.clone());
                    }
                    return Ok(Some(event));
                }
                Some(Incoming::Reply { to, .. }) => debug!(?to, "unexpected reply dropped"),
                Some(Incoming::Closed { code, reason }) => {
                    self.state = ClientState::Closed { code, reason };
                    return Ok(None);
                }
                None => return Ok(None),
            }
        }
    }

    /// Skips events until one matches `pred`, or `timeout` runs out.
    pub async fn wait_for<F>(&mut self, timeout: Duration, mut pred: F) -> anyhow::Result<Option<ServerEvent>>
    where
        F: FnMut(&ServerEvent) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.next_event(left).await? {
                Some(event) if pred(&event) => return Ok(Some(event)),
                Some(_) => continue,
                None => return Ok(None),
            }
        }
    }

    /// Closes the socket and waits for the reader to stop.
    pub async fn close(mut self) -> anyhow::Result<()> {
        let frame = Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "bye".into(),
        }));
        if let Err(e) = self.sink.send(frame).await {
            debug!(error = %e, "close frame not sent");
        }
        let _ = self.sink.close().await;
        let _ = self.reader.await;
        Ok(())
    }

    /// Queues a pushed event that arrived while waiting for something else.
    fn absorb(&mut self, event: ServerEvent) {
        if let ServerEvent::StateUpdate(snapshot) = &event {
            self.snaps.push(snapshot.clone());
        }
        self.backlog.push_back(event);
    }

    async fn recv_until(&mut self, deadline: Instant) -> anyhow::Result<Option<Incoming>> {
        if let ClientState::Closed { code, reason } = &self.state {
            bail!("connection closed: {code} {reason}");
        }
        match tokio::time::timeout_at(deadline, self.incoming.recv()).await {
            Ok(Some(incoming)) => Ok(Some(incoming)),
            Ok(None) => Ok(Some(Incoming::Closed {
                code: u16::from(CloseCode::Abnormal),
                reason: "socket dropped".into(),
            })),
            Err(_) => Ok(None),
        }
    }

    async fn write(&mut self, frame: Frame) -> anyhow::Result<()> {
        let msg = match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Binary(bytes) => Message::Binary(bytes.to_vec().into()),
            Frame::Close { code, reason } => Message::Close(Some(CloseFrame {
                code: CloseCode::from(code),
                reason: reason.into(),
            })),
        };
        self.sink.send(msg).await.context("websocket send")
    }
}

async fn read_loop(
    mut source: futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
    kind: TransportKind,
    tx: mpsc::Sender<Incoming>,
) {
    while let Some(msg) = source.next().await {
        let frame = match msg {
            Ok(Message::Text(text)) => Frame::Text(text.to_string()),
            Ok(Message::Binary(bin)) => Frame::Binary(Bytes::from(bin.to_vec())),
            Ok(Message::Close(close)) => {
                let (code, reason) = close
                    .map(|f| (u16::from(f.code), f.reason.to_string()))
                    .unwrap_or((u16::from(CloseCode::Normal), String::new()));
                let _ = tx.send(Incoming::Closed { code, reason }).await;
                return;
            }
            Ok(_) => continue,
            Err(e) => {
                debug!(error = %e, "socket read failed");
                break;
            }
        };
        match decode_incoming(kind, &frame) {
            Ok(Some(incoming)) => {
                if tx.send(incoming).await.is_err() {
                    return;
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "undecodable server frame"),
        }
    }
}

/// Manual replies are envelopes named after the request's callback.
fn callback_of(kind: &str) -> Option<&'static str> {
    [UPDATE_CALLBACK, CHANGE_WORLD_CALLBACK, LEAVE_WORLD_CALLBACK]
        .into_iter()
        .find(|cb| *cb == kind)
}

fn decode_incoming(kind: TransportKind, frame: &Frame) -> anyhow::Result<Option<Incoming>> {
    match kind {
        TransportKind::Rooms => {
            let room = decode_room(frame)?;
            match (room.event, room.ack) {
                (Some(name), _) => Ok(Some(Incoming::Event(ServerEvent::from_parts(&name, room.data)?))),
                (None, Some(ack)) => Ok(Some(Incoming::Reply {
                    to: ReplyTo::Ack(ack),
                    payload: room.data,
                })),
                (None, None) => Ok(None),
            }
        }
        TransportKind::Manual => {
            let envelope = decode_envelope(frame)?;
            if let Some(callback) = callback_of(&envelope.kind) {
                return Ok(Some(Incoming::Reply {
                    to: ReplyTo::Event(callback),
                    payload: envelope.params,
                }));
            }
            Ok(Some(Incoming::Event(ServerEvent::from_parts(
                &envelope.kind,
                envelope.params,
            )?)))
        }
    }
}
