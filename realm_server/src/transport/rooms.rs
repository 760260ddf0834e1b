//! Grouped-room transport.
//!
//! Frames are JSON `{event, data, ack}` objects. The server keeps room
//! membership itself and addresses broadcasts by room. The identity request
//! goes out with ack `IDENTITY_ACK`; the client's answer to it is the
//! identity confirmation.

use std::collections::{BTreeMap, BTreeSet};

use rand::{distributions::Alphanumeric, Rng};
use realm_shared::{
    codec::{decode_room, encode_room, Frame, RoomFrame},
    config::TransportKind,
    ids::{ConnectionId, WorldId},
    protocol::{check_claim, Command, DecodeError, ReplyTo, ServerEvent, IDENTITY_ACK},
};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{Audience, Inbound, Outboxes, Transport};

const CONNECTION_ID_LEN: usize = 20;

/// Random alphanumeric id, in the style room servers hand out.
pub fn random_connection_id() -> ConnectionId {
    let id: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(CONNECTION_ID_LEN)
        .map(char::from)
        .collect();
    ConnectionId(id)
}

#[derive(Debug, Default)]
pub struct RoomsTransport {
    outboxes: Outboxes,
    rooms: BTreeMap<WorldId, BTreeSet<ConnectionId>>,
}

impl RoomsTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn room_members(&self, room: &WorldId) -> Option<&BTreeSet<ConnectionId>> {
        self.rooms.get(room)
    }

    fn encode_event(event: &ServerEvent) -> Option<Frame> {
        let frame = match event {
            ServerEvent::IdentityAssigned(_) => event
                .to_parts()
                .map(|(name, data)| RoomFrame::request(name, data, IDENTITY_ACK)),
            _ => RoomFrame::from_event(event),
        };
        match frame.and_then(|f| encode_room(&f)) {
            Ok(frame) => Some(frame),
            Err(e) => {
                warn!(event = event.name(), error = %e, "failed to encode room frame");
                None
            }
        }
    }
}

impl Transport for RoomsTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Rooms
    }

    fn attach(&mut self, connection: ConnectionId, outbox: mpsc::Sender<Frame>) {
        self.outboxes.insert(connection, outbox);
    }

    fn detach(&mut self, connection: &ConnectionId) {
        self.outboxes.remove(connection);
        self.rooms.retain(|_, members| {
            members.remove(connection);
            !members.is_empty()
        });
    }

    fn send_to(&mut self, connection: &ConnectionId, event: &ServerEvent) {
        if let Some(frame) = Self::encode_event(event) {
            self.outboxes.push(connection, frame);
        }
    }

    fn broadcast(&mut self, audience: Audience<'_>, event: &ServerEvent) {
        let Some(members) = self.rooms.get(audience.group) else {
            return;
        };
        let Some(frame) = Self::encode_event(event) else {
            return;
        };
        for connection in members {
            self.outboxes.push(connection, frame.clone());
        }
    }

    fn join_group(&mut self, connection: &ConnectionId, group: &WorldId) {
        self.rooms
            .entry(group.clone())
            .or_default()
            .insert(connection.clone());
    }

    fn leave_group(&mut self, connection: &ConnectionId, group: &WorldId) {
        if let Some(members) = self.rooms.get_mut(group) {
            members.remove(connection);
            if members.is_empty() {
                self.rooms.remove(group);
            }
        }
    }

    fn reply(&mut self, connection: &ConnectionId, to: ReplyTo, payload: Value) {
        let frame = match to {
            ReplyTo::Ack(ack) => RoomFrame::reply(ack, payload),
            ReplyTo::Event(name) => RoomFrame::event(name, payload),
        };
        match encode_room(&frame) {
            Ok(frame) => {
                self.outboxes.push(connection, frame);
            }
            Err(e) => warn!(connection = %connection, error = %e, "failed to encode reply"),
        }
    }

    fn close(&mut self, connection: &ConnectionId, code: u16, reason: &str) {
        self.outboxes.close(connection, code, reason);
    }

    fn close_all(&mut self, code: u16, reason: &str) {
        self.outboxes.close_all(code, reason);
        self.rooms.clear();
    }
}

pub(super) fn decode(origin: &ConnectionId, frame: &Frame) -> Result<Option<Inbound>, DecodeError> {
    let frame = decode_room(frame)?;
    check_claim(origin, &frame.data)?;
    match frame.event {
        Some(name) => {
            let command = Command::from_parts(&name, frame.data)?;
            Ok(Some(Inbound {
                origin: origin.clone(),
                command,
                reply: frame.ack.map(ReplyTo::Ack),
            }))
        }
        None if frame.ack == Some(IDENTITY_ACK) => {
            let command = Command::from_parts("identityConfirm", frame.data)?;
            Ok(Some(Inbound {
                origin: origin.clone(),
                command,
                reply: None,
            }))
        }
        None => {
            debug!(connection = %origin, ack = ?frame.ack, "stray reply ignored");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use realm_shared::{ids::UserId, protocol::PeerInfo};

    fn attached(t: &mut RoomsTransport, id: &str) -> (ConnectionId, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(8);
        let conn = ConnectionId::new(id);
        t.attach(conn.clone(), tx);
        (conn, rx)
    }

    fn room_frame(rx: &mut mpsc::Receiver<Frame>) -> RoomFrame {
        let frame = rx.try_recv().unwrap();
        decode_room(&frame).unwrap()
    }

    #[test]
    fn ids_are_twenty_alphanumerics() {
        let id = random_connection_id();
        assert_eq!(id.as_str().len(), CONNECTION_ID_LEN);
        assert!(id.as_str().chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn broadcast_reaches_room_only() {
        let mut t = RoomsTransport::new();
        let (a, mut rx_a) = attached(&mut t, "a");
        let (_b, mut rx_b) = attached(&mut t, "b");
        let world = WorldId::new("World_a");
        t.join_group(&a, &world);

        let event = ServerEvent::AddClient(PeerInfo {
            connection_id: ConnectionId::new("c"),
            user_id: UserId::new("user_3"),
        });
        t.broadcast(
            Audience {
                group: &world,
                members: &[],
            },
            &event,
        );
        let got = room_frame(&mut rx_a);
        assert_eq!(got.event.as_deref(), Some("addClient"));
        assert!(rx_b.try_recv().is_err());

        t.detach(&a);
        assert!(t.room_members(&world).is_none());
    }

    #[test]
    fn identity_request_carries_reserved_ack() {
        let mut t = RoomsTransport::new();
        let (a, mut rx) = attached(&mut t, "a");
        t.send_to(
            &a,
            &ServerEvent::IdentityAssigned(realm_shared::protocol::PendingIdentity {
                connection_id: a.clone(),
                sequence_counter: 1,
                world_id: None,
            }),
        );
        let got = room_frame(&mut rx);
        assert_eq!(got.ack, Some(IDENTITY_ACK));
        assert_eq!(got.data["sequenceCounter"], 1);
    }
}
