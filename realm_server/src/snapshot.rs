//! Snapshot assembly.
//!
//! Record order is fixed by the ordered maps underneath: worlds by id, then
//! players by connection id, then entities in simulation order.

use chrono::Utc;
use realm_shared::{
    ids::WorldId,
    snapshot::{
        PlayerState, Snapshot, SnapshotRecord, SunConfig, WorldSummary, DEFAULT_TIME_SCALE,
    },
};

use crate::session::Session;

/// What a snapshot covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope<'a> {
    /// World summaries plus every confirmed player outside a world.
    Lobby,
    /// World summaries plus the world's confirmed members and its entities.
    World(&'a WorldId),
}

impl Session {
    /// Builds a snapshot. Entities in scope are re-stamped, which is the
    /// only mutation.
    pub fn snapshot(&mut self, scope: Scope<'_>) -> Snapshot {
        let now = Utc::now().timestamp_millis();
        let mut snapshot = Snapshot::default();

        for world in self.worlds.iter() {
            let users = world
                .members
                .iter()
                .filter_map(|c| self.players.user_of(c).cloned())
                .collect();
            snapshot.insert(
                world.id.as_str(),
                SnapshotRecord::World(WorldSummary {
                    world_id: world.id.clone(),
                    users,
                }),
            );
        }

        for player in self.players.iter() {
            let Some(user) = &player.user_id else {
                continue;
            };
            let in_scope = match scope {
                Scope::Lobby => player.world.is_none(),
                Scope::World(id) => player.world.as_ref() == Some(id),
            };
            if !in_scope {
                continue;
            }
            let (time_scale_target, sun) = player
                .world
                .as_ref()
                .and_then(|id| self.worlds.get(id))
                .map(|w| (w.sim.time_scale_target(), w.sim.sun()))
                .unwrap_or((DEFAULT_TIME_SCALE, SunConfig::default()));
            snapshot.insert(
                player.connection_id.as_str(),
                SnapshotRecord::Player(PlayerState {
                    connection_id: player.connection_id.clone(),
                    user_id: user.clone(),
                    world_id: player.world.clone(),
                    timestamp: player.last_heartbeat,
                    ping: player.ping,
                    time_scale_target,
                    sun,
                    camera: player.camera,
                    spawn_point: player.spawn_point,
                }),
            );
        }

        if let Scope::World(id) = scope {
            if let Some(world) = self.worlds.get_mut(id) {
                for entity in world.sim.entities_mut() {
                    entity.stamp(now);
                    snapshot.insert(entity.id.clone(), SnapshotRecord::Entity(entity.clone()));
                }
            }
        }
        snapshot
    }
}
