//! Wire protocol.
//!
//! Both transports carry the same logical `{type, params}` messages:
//! - `Command`: client -> server, a closed set of nine commands.
//! - `ServerEvent`: server -> client pushes.
//! - Replies to correlated requests (`update`, `changeWorld`, `leaveWorld`),
//!   routed either by ack id (rooms) or by a callback envelope name (manual).
//!
//! Connection ids are not part of `Command`: the transport knows which
//! connection a frame arrived on, and a `connectionId` claimed in params is
//! only checked against it.

use std::fmt;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{
    ids::{ConnectionId, UserId, WorldId},
    snapshot::Snapshot,
};

/// Manual-transport envelope name for the `update` reply.
pub const UPDATE_CALLBACK: &str = "updateCallBack";
/// Manual-transport envelope name for the `changeWorld` reply.
pub const CHANGE_WORLD_CALLBACK: &str = "changeWorldCallBack";
/// Manual-transport envelope name for the `leaveWorld` reply.
pub const LEAVE_WORLD_CALLBACK: &str = "leaveWorldCallBack";

/// Ack id reserved for the identity request the rooms transport issues on connect.
pub const IDENTITY_ACK: u64 = 0;

/// Provisional identity handed to a freshly connected client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingIdentity {
    pub connection_id: ConnectionId,
    pub sequence_counter: u64,
    /// World the creation policy picked, if any.
    pub world_id: Option<WorldId>,
}

/// A connection and its confirmed user id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
}

/// Reply to `changeWorld`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeWorldReply {
    pub world_id: WorldId,
    pub last_map_id: Option<String>,
    pub last_scenario_id: Option<String>,
    /// Members of the target world before the requester joined it.
    pub players: Vec<PeerInfo>,
}

/// Reply to `leaveWorld`. `world_id` is always `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveWorldReply {
    pub world_id: Option<WorldId>,
}

/// Input event piggy-backed outside the tick loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlsPayload {
    #[serde(rename = "type")]
    pub kind: String,
    /// Stamped by the server before re-broadcast.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<ConnectionId>,
    #[serde(default)]
    pub data: Value,
}

/// Chat line as delivered to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPayload {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub message: String,
}

/// Server -> client push events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "params", rename_all = "camelCase")]
pub enum ServerEvent {
    IdentityAssigned(PendingIdentity),
    AddClient(PeerInfo),
    #[serde(rename_all = "camelCase")]
    RemoveClient {
        connection_id: ConnectionId,
    },
    Controls(ControlsPayload),
    MapChanged {
        map: String,
    },
    ScenarioChanged {
        scenario: String,
    },
    ChatMessage(ChatPayload),
    StateUpdate(Snapshot),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::IdentityAssigned(_) => "identityAssigned",
            ServerEvent::AddClient(_) => "addClient",
            ServerEvent::RemoveClient { .. } => "removeClient",
            ServerEvent::Controls(_) => "controls",
            ServerEvent::MapChanged { .. } => "mapChanged",
            ServerEvent::ScenarioChanged { .. } => "scenarioChanged",
            ServerEvent::ChatMessage(_) => "chatMessage",
            ServerEvent::StateUpdate(_) => "stateUpdate",
        }
    }

    /// Splits the event into its `type` name and `params` value.
    pub fn to_parts(&self) -> anyhow::Result<(String, Value)> {
        split_tagged(serde_json::to_value(self).context("serialize event")?)
    }

    pub fn from_parts(kind: &str, params: Value) -> anyhow::Result<Self> {
        serde_json::from_value(json!({ "type": kind, "params": params }))
            .with_context(|| format!("decode event {kind}"))
    }
}

/// Client -> server commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "params", rename_all = "camelCase")]
pub enum Command {
    #[serde(rename_all = "camelCase")]
    IdentityConfirm { user_id: UserId },
    /// Heartbeat. Replies with a snapshot under request/reply broadcasting.
    #[serde(rename_all = "camelCase")]
    Update {
        #[serde(default)]
        timestamp: Option<i64>,
        #[serde(default)]
        ping: Option<f64>,
    },
    #[serde(rename_all = "camelCase")]
    Controls {
        #[serde(rename = "type")]
        kind: String,
        #[serde(default)]
        data: Value,
    },
    #[serde(rename_all = "camelCase")]
    ChangeWorld { world_id: WorldId },
    #[serde(rename_all = "camelCase")]
    ChangeWorldFinish { world_id: WorldId },
    #[serde(rename_all = "camelCase")]
    LeaveWorld {
        #[serde(default)]
        world_id: Option<WorldId>,
    },
    #[serde(rename_all = "camelCase")]
    SetMap { map_name: String },
    #[serde(rename_all = "camelCase")]
    SetScenario { scenario_name: String },
    #[serde(rename_all = "camelCase")]
    ChatMessage { message: String },
}

impl Command {
    /// Every command name the router accepts.
    pub const NAMES: [&'static str; 9] = [
        "identityConfirm",
        "update",
        "controls",
        "changeWorld",
        "changeWorldFinish",
        "leaveWorld",
        "setMap",
        "setScenario",
        "chatMessage",
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Command::IdentityConfirm { .. } => "identityConfirm",
            Command::Update { .. } => "update",
            Command::Controls { .. } => "controls",
            Command::ChangeWorld { .. } => "changeWorld",
            Command::ChangeWorldFinish { .. } => "changeWorldFinish",
            Command::LeaveWorld { .. } => "leaveWorld",
            Command::SetMap { .. } => "setMap",
            Command::SetScenario { .. } => "setScenario",
            Command::ChatMessage { .. } => "chatMessage",
        }
    }

    /// Envelope name of the reply under the manual transport, for commands
    /// that have one.
    pub fn callback_name(&self) -> Option<&'static str> {
        match self {
            Command::Update { .. } => Some(UPDATE_CALLBACK),
            Command::ChangeWorld { .. } => Some(CHANGE_WORLD_CALLBACK),
            Command::LeaveWorld { .. } => Some(LEAVE_WORLD_CALLBACK),
            _ => None,
        }
    }

    /// Decodes a command from its `type` name and `params`.
    pub fn from_parts(kind: &str, params: Value) -> Result<Self, DecodeError> {
        if !Self::NAMES.contains(&kind) {
            return Err(DecodeError::Unrecognized(kind.to_string()));
        }
        let params = if params.is_null() { json!({}) } else { params };
        serde_json::from_value(json!({ "type": kind, "params": params })).map_err(|e| {
            DecodeError::InvalidParams {
                command: kind.to_string(),
                reason: e.to_string(),
            }
        })
    }

    /// Splits the command into its `type` name and `params`, stamping the
    /// sender's connection id into params.
    pub fn to_parts(&self, connection: &ConnectionId) -> anyhow::Result<(String, Value)> {
        let (kind, mut params) =
            split_tagged(serde_json::to_value(self).context("serialize command")?)?;
        if let Value::Object(map) = &mut params {
            map.insert("connectionId".into(), Value::String(connection.0.clone()));
        }
        Ok((kind, params))
    }
}

/// Where a reply to a correlated request is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyTo {
    /// Rooms transport: answer the request carrying this ack id.
    Ack(u64),
    /// Manual transport: push an envelope with this type name.
    Event(&'static str),
}

/// Why an inbound frame was dropped.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// Not a valid frame for the transport at all.
    Malformed(String),
    /// Frame is fine but names no known command.
    Unrecognized(String),
    InvalidParams { command: String, reason: String },
    /// Params claim a connection id other than the one the frame arrived on.
    ForeignConnection { claimed: ConnectionId },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Malformed(reason) => write!(f, "malformed frame: {reason}"),
            DecodeError::Unrecognized(name) => write!(f, "unrecognized command: {name}"),
            DecodeError::InvalidParams { command, reason } => {
                write!(f, "invalid params for {command}: {reason}")
            }
            DecodeError::ForeignConnection { claimed } => {
                write!(f, "params claim foreign connection {claimed}")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

/// Reads the connection id a client claims in params (`connectionId`, or
/// the legacy `sID`).
pub fn claimed_connection(params: &Value) -> Option<ConnectionId> {
    params
        .get("connectionId")
        .or_else(|| params.get("sID"))
        .and_then(Value::as_str)
        .map(ConnectionId::new)
}

/// Rejects params that claim a different connection than `origin`.
pub fn check_claim(origin: &ConnectionId, params: &Value) -> Result<(), DecodeError> {
    match claimed_connection(params) {
        Some(claimed) if &claimed != origin => Err(DecodeError::ForeignConnection { claimed }),
        _ => Ok(()),
    }
}

fn split_tagged(value: Value) -> anyhow::Result<(String, Value)> {
    let Value::Object(mut map) = value else {
        anyhow::bail!("tagged value is not an object");
    };
    let kind = match map.remove("type") {
        Some(Value::String(kind)) => kind,
        _ => anyhow::bail!("tagged value has no type"),
    };
    let params = map.remove("params").unwrap_or(Value::Null);
    Ok((kind, params))
}
