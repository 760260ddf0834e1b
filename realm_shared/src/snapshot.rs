//! Snapshot types.
//!
//! A snapshot is a flat map keyed by world id, connection id or entity id.
//! Each record carries a `msgType` tag so clients can sort them. Clients rely
//! on key presence only; the map is ordered so equal registry states
//! serialize identically.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{
    ids::{ConnectionId, UserId, WorldId},
    math::Vec3,
};

/// Default time scale for players outside any world.
pub const DEFAULT_TIME_SCALE: f32 = 1.0;

/// Camera pitch given to a player placed on a scenario spawn slot.
pub const SPAWN_CAMERA_PHI: f32 = 15.0;

/// Sun placement, copied onto each player record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SunConfig {
    pub elevation: f32,
    pub azimuth: f32,
}

impl Default for SunConfig {
    fn default() -> Self {
        Self {
            elevation: 60.0,
            azimuth: 45.0,
        }
    }
}

/// Orbit camera angles in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraAngles {
    pub theta: f32,
    pub phi: f32,
}

impl Default for CameraAngles {
    fn default() -> Self {
        Self {
            theta: 0.0,
            phi: SPAWN_CAMERA_PHI,
        }
    }
}

/// One record per world: id plus confirmed member user ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorldSummary {
    pub world_id: WorldId,
    pub users: Vec<UserId>,
}

/// Client-visible state of one confirmed player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerState {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub world_id: Option<WorldId>,
    /// Client timestamp from the last heartbeat.
    pub timestamp: i64,
    /// Round-trip time the client last reported.
    pub ping: f64,
    pub time_scale_target: f32,
    pub sun: SunConfig,
    pub camera: CameraAngles,
    pub spawn_point: Option<Vec3>,
}

/// Kind of simulated entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Character,
    Vehicle,
    Prop,
}

/// Replicated state of one simulated entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityState {
    pub id: String,
    pub kind: EntityKind,
    pub position: Vec3,
    /// Yaw in radians.
    pub heading: f32,
    pub controlled_by: Option<UserId>,
    /// Server time (ms) this entity was last replicated.
    pub timestamp: i64,
    /// Milliseconds between the two most recent replications.
    pub ping: i64,
}

impl EntityState {
    pub fn new(id: impl Into<String>, kind: EntityKind, position: Vec3) -> Self {
        Self {
            id: id.into(),
            kind,
            position,
            heading: 0.0,
            controlled_by: None,
            timestamp: 0,
            ping: 0,
        }
    }

    /// Recomputes `ping` from the previous timestamp, then moves the
    /// timestamp to `now_ms`.
    pub fn stamp(&mut self, now_ms: i64) {
        self.ping = if self.timestamp == 0 {
            0
        } else {
            (now_ms - self.timestamp).max(0)
        };
        self.timestamp = now_ms;
    }
}

/// A single snapshot entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msgType")]
pub enum SnapshotRecord {
    World(WorldSummary),
    Player(PlayerState),
    Entity(EntityState),
}

/// The state bundle pushed on each tick or returned on `update`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot {
    pub records: BTreeMap<String, SnapshotRecord>,
}

impl Snapshot {
    pub fn insert(&mut self, key: impl Into<String>, record: SnapshotRecord) {
        self.records.insert(key.into(), record);
    }

    pub fn get(&self, key: &str) -> Option<&SnapshotRecord> {
        self.records.get(key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn worlds(&self) -> impl Iterator<Item = &WorldSummary> {
        self.records.values().filter_map(|r| match r {
            SnapshotRecord::World(w) => Some(w),
            _ => None,
        })
    }

    pub fn players(&self) -> impl Iterator<Item = &PlayerState> {
        self.records.values().filter_map(|r| match r {
            SnapshotRecord::Player(p) => Some(p),
            _ => None,
        })
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntityState> {
        self.records.values().filter_map(|r| match r {
            SnapshotRecord::Entity(e) => Some(e),
            _ => None,
        })
    }

    /// User ids of every player record.
    pub fn user_ids(&self) -> BTreeSet<UserId> {
        self.players().map(|p| p.user_id.clone()).collect()
    }
}
