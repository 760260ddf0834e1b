//! Dispatch router.
//!
//! Maps each decoded command onto session operations and answers the three
//! correlated requests. Handlers never fail: missing players, worlds or
//! identities end in a no-op inside the operation itself.

use realm_shared::{
    config::BroadcastMode,
    protocol::{Command, ControlsPayload, LeaveWorldReply},
};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::{session::Session, snapshot::Scope, transport::Inbound};

pub fn dispatch(session: &mut Session, inbound: Inbound) {
    let Inbound {
        origin,
        command,
        reply,
    } = inbound;
    debug!(connection = %origin, command = command.name(), "dispatch");

    let answer: Option<Value> = match command {
        Command::IdentityConfirm { user_id } => {
            session.confirm_identity(&origin, user_id);
            None
        }
        Command::Update { timestamp, ping } => {
            if !session.players.contains(&origin) {
                debug!(connection = %origin, "update from unknown player");
                return;
            }
            session.heartbeat(&origin, timestamp, ping);
            Some(update_reply(session, &origin))
        }
        Command::Controls { kind, data } => {
            session.set_controls(
                &origin,
                ControlsPayload {
                    kind,
                    connection_id: None,
                    data,
                },
            );
            None
        }
        Command::ChangeWorld { world_id } => session
            .change_world(&origin, &world_id)
            .and_then(|r| to_value(&r)),
        Command::ChangeWorldFinish { world_id } => {
            session.change_world_finish(&origin, &world_id);
            None
        }
        Command::LeaveWorld { .. } => {
            if !session.players.contains(&origin) {
                return;
            }
            session.leave(&origin);
            session.status_pass();
            to_value(&LeaveWorldReply { world_id: None })
        }
        Command::SetMap { map_name } => {
            session.set_map(&origin, &map_name);
            None
        }
        Command::SetScenario { scenario_name } => {
            session.set_scenario(&origin, &scenario_name);
            None
        }
        Command::ChatMessage { message } => {
            session.chat(&origin, &message);
            None
        }
    };

    if let (Some(to), Some(payload)) = (reply, answer) {
        session.transport.reply(&origin, to, payload);
    }
}

/// `update` answer: the caller's snapshot under request/reply broadcasting,
/// an empty ack otherwise.
fn update_reply(session: &mut Session, origin: &realm_shared::ids::ConnectionId) -> Value {
    if session.config.broadcast != BroadcastMode::RequestReply {
        return json!({});
    }
    let Some(player) = session.players.get(origin) else {
        return json!({});
    };
    if !player.is_confirmed() {
        return json!({});
    }
    let snapshot = match player.world.clone() {
        Some(world) => session.snapshot(Scope::World(&world)),
        None => session.snapshot(Scope::Lobby),
    };
    to_value(&snapshot).unwrap_or_else(|| json!({}))
}

fn to_value<T: serde::Serialize>(value: &T) -> Option<Value> {
    match serde_json::to_value(value) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(error = %e, "failed to serialize reply");
            None
        }
    }
}
