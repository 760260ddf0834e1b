//! Configuration system.
//!
//! Loads server configuration from JSON strings (file IO left to app). The
//! value is built once at startup and handed to each component by value.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Which socket protocol the process speaks. Fixed for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Transport-assigned ids, native rooms, ack-correlated requests.
    Rooms,
    /// Server-generated `soc_<n>` ids, `{type, params}` envelopes, manual fan-out.
    #[default]
    Manual,
}

/// Envelope codec for the manual transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Codec {
    /// JSON text frames.
    #[default]
    Json,
    /// Length-prefixed type name plus JSON params in a binary frame.
    Binary,
}

/// How a newly connected player is placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorldCreation {
    /// Every new player gets a dedicated world named after its connection.
    #[default]
    OneForEach,
    /// Reuse the first existing world, creating one only when none exist.
    AtLeastOne,
    /// New players start worldless and must ask to join.
    Unassigned,
}

/// Who drives state delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastMode {
    /// Server pushes snapshots on its own timers.
    #[default]
    IntervalPush,
    /// Snapshots only go out as replies to client `update` requests.
    RequestReply,
}

/// Root server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address, e.g. `0.0.0.0`.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Listen port. Zero binds an ephemeral port.
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default)]
    pub codec: Codec,
    #[serde(default)]
    pub world_creation: WorldCreation,
    #[serde(default)]
    pub broadcast: BroadcastMode,
    /// Period of the worldless (lobby) broadcast tick.
    #[serde(default = "default_lobby_tick_ms")]
    pub lobby_tick_ms: u64,
    /// Resolution of the disconnect grace window.
    #[serde(default = "default_grace_poll_ms")]
    pub grace_poll_ms: u64,
    /// Number of grace polls before a releasing player is torn down.
    #[serde(default = "default_grace_polls")]
    pub grace_polls: u32,
    /// Chat entries kept per world.
    #[serde(default = "default_chat_history")]
    pub chat_history: usize,
    /// Capacity of the hub inbox.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    /// Worlds created at startup, before any player arrives.
    #[serde(default)]
    pub worlds: Vec<String>,
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_lobby_tick_ms() -> u64 {
    100
}

fn default_grace_poll_ms() -> u64 {
    15
}

fn default_grace_polls() -> u32 {
    300
}

fn default_chat_history() -> usize {
    64
}

fn default_queue_depth() -> usize {
    1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            port: default_port(),
            transport: TransportKind::default(),
            codec: Codec::default(),
            world_creation: WorldCreation::default(),
            broadcast: BroadcastMode::default(),
            lobby_tick_ms: default_lobby_tick_ms(),
            grace_poll_ms: default_grace_poll_ms(),
            grace_polls: default_grace_polls(),
            chat_history: default_chat_history(),
            queue_depth: default_queue_depth(),
            worlds: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// `bind_addr:port`, ready for `TcpListener::bind`.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }

    pub fn lobby_tick(&self) -> Duration {
        Duration::from_millis(self.lobby_tick_ms)
    }

    /// Total grace window: `grace_polls` polls of `grace_poll_ms` each.
    pub fn grace_window(&self) -> Duration {
        Duration::from_millis(self.grace_poll_ms * u64::from(self.grace_polls))
    }
}
