//! Manual transport.
//!
//! Every message is a `{type, params}` envelope, JSON text or binary per the
//! configured codec. There are no native groups: broadcasts walk the member
//! list the world registry hands in. Replies go out as envelopes named after
//! the request's callback.

use realm_shared::{
    codec::{decode_envelope, encode_envelope, Envelope, Frame},
    config::{Codec, TransportKind},
    ids::{ConnectionId, WorldId},
    protocol::{check_claim, Command, DecodeError, ReplyTo, ServerEvent},
};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{Audience, Inbound, Outboxes, Transport};

#[derive(Debug)]
pub struct ManualTransport {
    codec: Codec,
    outboxes: Outboxes,
}

impl ManualTransport {
    pub fn new(codec: Codec) -> Self {
        Self {
            codec,
            outboxes: Outboxes::default(),
        }
    }

    fn encode(&self, envelope: &Envelope) -> Option<Frame> {
        match encode_envelope(self.codec, envelope) {
            Ok(frame) => Some(frame),
            Err(e) => {
                warn!(kind = %envelope.kind, error = %e, "failed to encode envelope");
                None
            }
        }
    }

    fn encode_event(&self, event: &ServerEvent) -> Option<Frame> {
        match Envelope::from_event(event) {
            Ok(envelope) => self.encode(&envelope),
            Err(e) => {
                warn!(event = event.name(), error = %e, "failed to serialize event");
                None
            }
        }
    }
}

impl Transport for ManualTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Manual
    }

    fn attach(&mut self, connection: ConnectionId, outbox: mpsc::Sender<Frame>) {
        self.outboxes.insert(connection, outbox);
    }

    fn detach(&mut self, connection: &ConnectionId) {
        self.outboxes.remove(connection);
    }

    fn send_to(&mut self, connection: &ConnectionId, event: &ServerEvent) {
        if let Some(frame) = self.encode_event(event) {
            self.outboxes.push(connection, frame);
        }
    }

    fn broadcast(&mut self, audience: Audience<'_>, event: &ServerEvent) {
        if audience.members.is_empty() {
            return;
        }
        let Some(frame) = self.encode_event(event) else {
            return;
        };
        for connection in audience.members {
            self.outboxes.push(connection, frame.clone());
        }
    }

    fn join_group(&mut self, connection: &ConnectionId, group: &WorldId) {
        debug!(connection = %connection, world = %group, "manual group join");
    }

    fn leave_group(&mut self, connection: &ConnectionId, group: &WorldId) {
        debug!(connection = %connection, world = %group, "manual group leave");
    }

    fn reply(&mut self, connection: &ConnectionId, to: ReplyTo, payload: Value) {
        let ReplyTo::Event(name) = to else {
            warn!(connection = %connection, "ack reply on manual transport dropped");
            return;
        };
        if let Some(frame) = self.encode(&Envelope::new(name, payload)) {
            self.outboxes.push(connection, frame);
        }
    }

    fn close(&mut self, connection: &ConnectionId, code: u16, reason: &str) {
        self.outboxes.close(connection, code, reason);
    }

    fn close_all(&mut self, code: u16, reason: &str) {
        self.outboxes.close_all(code, reason);
    }
}

pub(super) fn decode(origin: &ConnectionId, frame: &Frame) -> Result<Inbound, DecodeError> {
    let envelope = decode_envelope(frame)?;
    check_claim(origin, &envelope.params)?;
    let command = Command::from_parts(&envelope.kind, envelope.params)?;
    let reply = command.callback_name().map(ReplyTo::Event);
    Ok(Inbound {
        origin: origin.clone(),
        command,
        reply,
    })
}
