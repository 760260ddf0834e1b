//! Transport adapter.
//!
//! The session layer talks to clients only through `Transport`. Two
//! implementations exist and one is picked at startup:
//! - `RoomsTransport`: transport-assigned ids, native rooms, ack-correlated
//!   requests.
//! - `ManualTransport`: `soc_<n>` ids, `{type, params}` envelopes, fan-out by
//!   iterating the world's member list.
//!
//! Sends never block the hub: each connection has a bounded outbox drained by
//! its socket task, and a full outbox drops the frame.

use std::collections::BTreeMap;

use realm_shared::{
    codec::Frame,
    config::{ServerConfig, TransportKind},
    ids::{ConnectionId, WorldId},
    protocol::{Command, DecodeError, ReplyTo, ServerEvent},
};
use serde_json::Value;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

pub mod manual;
pub mod rooms;
pub mod ws;

pub use manual::ManualTransport;
pub use rooms::RoomsTransport;

/// Who receives a world broadcast. Room-based transports address `group`,
/// list-based ones iterate `members`.
#[derive(Debug, Clone, Copy)]
pub struct Audience<'a> {
    pub group: &'a WorldId,
    pub members: &'a [ConnectionId],
}

/// Outbound capability used by the session layer.
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    /// Registers the outbox of a freshly accepted connection.
    fn attach(&mut self, connection: ConnectionId, outbox: mpsc::Sender<Frame>);
    /// Forgets a connection. Later sends to it are dropped.
    fn detach(&mut self, connection: &ConnectionId);

    fn send_to(&mut self, connection: &ConnectionId, event: &ServerEvent);
    fn broadcast(&mut self, audience: Audience<'_>, event: &ServerEvent);

    fn join_group(&mut self, connection: &ConnectionId, group: &WorldId);
    fn leave_group(&mut self, connection: &ConnectionId, group: &WorldId);

    /// Answers a correlated request.
    fn reply(&mut self, connection: &ConnectionId, to: ReplyTo, payload: Value);

    fn close(&mut self, connection: &ConnectionId, code: u16, reason: &str);
    fn close_all(&mut self, code: u16, reason: &str);
}

/// Builds the transport selected by the config.
pub fn for_config(cfg: &ServerConfig) -> Box<dyn Transport> {
    match cfg.transport {
        TransportKind::Rooms => Box::new(RoomsTransport::new()),
        TransportKind::Manual => Box::new(ManualTransport::new(cfg.codec)),
    }
}

/// Allocates the id of a new connection the way the transport names them.
pub fn allocate_connection_id(kind: TransportKind) -> ConnectionId {
    match kind {
        TransportKind::Rooms => rooms::random_connection_id(),
        TransportKind::Manual => ConnectionId::next_manual(),
    }
}

/// A decoded client command plus where its reply goes.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub origin: ConnectionId,
    pub command: Command,
    pub reply: Option<ReplyTo>,
}

/// Decodes one inbound frame. `Ok(None)` means the frame was valid but
/// carries nothing to dispatch.
pub fn decode_inbound(
    kind: TransportKind,
    origin: &ConnectionId,
    frame: &Frame,
) -> Result<Option<Inbound>, DecodeError> {
    match kind {
        TransportKind::Rooms => rooms::decode(origin, frame),
        TransportKind::Manual => manual::decode(origin, frame).map(Some),
    }
}

/// Per-connection outboxes shared by both transports.
#[derive(Debug, Default)]
pub(crate) struct Outboxes {
    senders: BTreeMap<ConnectionId, mpsc::Sender<Frame>>,
}

impl Outboxes {
    pub(crate) fn insert(&mut self, connection: ConnectionId, outbox: mpsc::Sender<Frame>) {
        self.senders.insert(connection, outbox);
    }

    pub(crate) fn remove(&mut self, connection: &ConnectionId) -> bool {
        self.senders.remove(connection).is_some()
    }

    /// Queues a frame. Returns false if it was dropped.
    pub(crate) fn push(&self, connection: &ConnectionId, frame: Frame) -> bool {
        let Some(tx) = self.senders.get(connection) else {
            debug!(connection = %connection, "send to detached connection dropped");
            return false;
        };
        match tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(connection = %connection, "outbox full, frame dropped");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(connection = %connection, "outbox closed, frame dropped");
                false
            }
        }
    }

    pub(crate) fn close(&mut self, connection: &ConnectionId, code: u16, reason: &str) {
        self.push(
            connection,
            Frame::Close {
                code,
                reason: reason.to_string(),
            },
        );
        self.senders.remove(connection);
    }

    pub(crate) fn close_all(&mut self, code: u16, reason: &str) {
        let all: Vec<ConnectionId> = self.senders.keys().cloned().collect();
        for connection in &all {
            self.close(connection, code, reason);
        }
    }
}
