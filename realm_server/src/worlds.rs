//! World registry.
//!
//! Worlds are keyed by id in an ordered map, so "the first world" is the
//! lexicographically smallest id. A world's tick runs exactly while it has
//! members.

use std::{
    collections::{BTreeMap, BTreeSet},
    time::Duration,
};

use realm_shared::{
    chat::{ChatEntry, ChatLog},
    ids::{ConnectionId, WorldId},
    protocol::{ChangeWorldReply, ChatPayload, PeerInfo, ServerEvent},
    sim::{spawn_point, WorldSim},
    snapshot::{CameraAngles, SPAWN_CAMERA_PHI},
};
use tracing::{debug, info, warn};

use crate::{
    players::PlayerRegistry,
    scheduler::{spawn_world_tick, TickHandle},
    session::{LifecycleEvent, Session},
    transport::Audience,
};

/// One world instance.
pub struct World {
    pub id: WorldId,
    pub sim: Box<dyn WorldSim>,
    pub members: BTreeSet<ConnectionId>,
    pub(crate) tick: Option<TickHandle>,
    pub chat: ChatLog,
}

impl World {
    pub fn member_list(&self) -> Vec<ConnectionId> {
        self.members.iter().cloned().collect()
    }

    pub fn tick_generation(&self) -> Option<u64> {
        self.tick.as_ref().map(TickHandle::generation)
    }

    pub fn is_ticking(&self) -> bool {
        self.tick.is_some()
    }

    fn tick_period(&self) -> Duration {
        Duration::from_secs_f32(self.sim.physics_frame_time().max(0.001))
    }
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("id", &self.id)
            .field("members", &self.members)
            .field("ticking", &self.tick.is_some())
            .field("map", &self.sim.last_map_id())
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct WorldRegistry {
    worlds: BTreeMap<WorldId, World>,
}

impl WorldRegistry {
    pub fn get(&self, id: &WorldId) -> Option<&World> {
        self.worlds.get(id)
    }

    pub fn get_mut(&mut self, id: &WorldId) -> Option<&mut World> {
        self.worlds.get_mut(id)
    }

    pub fn contains(&self, id: &WorldId) -> bool {
        self.worlds.contains_key(id)
    }

    pub fn first_id(&self) -> Option<WorldId> {
        self.worlds.keys().next().cloned()
    }

    pub fn len(&self) -> usize {
        self.worlds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.worlds.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &World> {
        self.worlds.values()
    }

    pub fn ids(&self) -> Vec<WorldId> {
        self.worlds.keys().cloned().collect()
    }

    fn insert(&mut self, world: World) {
        self.worlds.insert(world.id.clone(), world);
    }

    fn remove(&mut self, id: &WorldId) -> Option<World> {
        self.worlds.remove(id)
    }

    pub(crate) fn clear(&mut self) {
        self.worlds.clear();
    }
}

/// Why a join did not happen. All of these are benign races.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinRejected {
    UnknownPlayer,
    Unconfirmed,
    UnknownWorld,
}

/// Lowest spawn slot no member of `members` holds.
fn free_slot(players: &PlayerRegistry, members: &BTreeSet<ConnectionId>) -> usize {
    let taken: BTreeSet<usize> = members
        .iter()
        .filter_map(|m| players.get(m).and_then(|p| p.spawn_slot))
        .collect();
    (0..=taken.len())
        .find(|slot| !taken.contains(slot))
        .unwrap_or(taken.len())
}

impl Session {
    /// Creates a world and launches its first map. Returns false if the id
    /// is taken.
    pub fn create_world(&mut self, id: WorldId) -> bool {
        if self.worlds.contains(&id) {
            return false;
        }
        let mut sim = self.factory.create(&id);
        let map = sim.map_names().into_iter().next();
        if let Some(map) = &map {
            sim.launch_map(map);
        }
        self.worlds.insert(World {
            id: id.clone(),
            sim,
            members: BTreeSet::new(),
            tick: None,
            chat: ChatLog::new(self.config.chat_history),
        });
        info!(world = %id, map = ?map, "world created");
        self.publish(LifecycleEvent::WorldCreated { world_id: id });
        true
    }

    /// Adds a confirmed player to a world, leaving its current one first.
    pub fn join(&mut self, connection: &ConnectionId, world_id: &WorldId) -> Result<(), JoinRejected> {
        let player = self
            .players
            .get(connection)
            .ok_or(JoinRejected::UnknownPlayer)?;
        let user = player.user_id.clone().ok_or(JoinRejected::Unconfirmed)?;
        if !self.worlds.contains(world_id) {
            return Err(JoinRejected::UnknownWorld);
        }
        if player.world.as_ref() == Some(world_id) {
            return Ok(());
        }
        if player.world.is_some() {
            self.leave(connection);
        }

        let Some(world) = self.worlds.get_mut(world_id) else {
            return Err(JoinRejected::UnknownWorld);
        };
        let slot = free_slot(&self.players, &world.members);
        let placement = spawn_point(world.sim.as_ref(), slot);
        let existing = world.member_list();
        self.transport.broadcast(
            Audience {
                group: world_id,
                members: &existing,
            },
            &ServerEvent::AddClient(PeerInfo {
                connection_id: connection.clone(),
                user_id: user.clone(),
            }),
        );
        self.transport.join_group(connection, world_id);
        world.members.insert(connection.clone());
        if world.tick.is_none() {
            world.tick = Some(spawn_world_tick(
                world_id.clone(),
                world.tick_period(),
                self.events.clone(),
            ));
        }

        if let Some(player) = self.players.get_mut(connection) {
            player.world = Some(world_id.clone());
            player.assigned_world = None;
            player.spawn_point = placement.map(|(point, _)| point);
            player.spawn_slot = Some(slot);
            player.camera = CameraAngles {
                theta: placement.map_or(0.0, |(_, theta)| theta),
                phi: SPAWN_CAMERA_PHI,
            };
        }
        info!(connection = %connection, user = %user, world = %world_id, "joined world");
        Ok(())
    }

    /// Removes a player from its world. Returns the world it left.
    pub fn leave(&mut self, connection: &ConnectionId) -> Option<WorldId> {
        let player = self.players.get_mut(connection)?;
        let world_id = player.world.take()?;
        player.spawn_point = None;
        player.spawn_slot = None;
        let user = player.user_id.clone();

        if let Some(world) = self.worlds.get_mut(&world_id) {
            world.members.remove(connection);
            if let Some(user) = &user {
                world.sim.remove_user(user);
            }
            self.transport.leave_group(connection, &world_id);
            let remaining = world.member_list();
            self.transport.broadcast(
                Audience {
                    group: &world_id,
                    members: &remaining,
                },
                &ServerEvent::RemoveClient {
                    connection_id: connection.clone(),
                },
            );
            if world.members.is_empty() && world.tick.take().is_some() {
                debug!(world = %world_id, "world tick stopped");
            }
        }
        info!(connection = %connection, world = %world_id, "left world");
        Some(world_id)
    }

    /// Moves a player to `target`. The reply lists the target's members
    /// from before the move.
    pub fn change_world(&mut self, connection: &ConnectionId, target: &WorldId) -> Option<ChangeWorldReply> {
        if !self.worlds.contains(target) {
            debug!(connection = %connection, world = %target, "change to unknown world");
            return None;
        }
        if !self.players.get(connection)?.is_confirmed() {
            debug!(connection = %connection, "change world before identity confirm");
            return None;
        }

        self.leave(connection);
        let world = self.worlds.get(target)?;
        let players = world
            .members
            .iter()
            .filter_map(|c| {
                self.players.user_of(c).map(|u| PeerInfo {
                    connection_id: c.clone(),
                    user_id: u.clone(),
                })
            })
            .collect();
        let reply = ChangeWorldReply {
            world_id: target.clone(),
            last_map_id: world.sim.last_map_id(),
            last_scenario_id: world.sim.last_scenario_id(),
            players,
        };

        if let Err(reason) = self.join(connection, target) {
            debug!(connection = %connection, world = %target, ?reason, "change world join failed");
            return None;
        }
        self.status_pass();
        Some(reply)
    }

    /// The client is ready in its new world: spawn its character. Ignored
    /// while the player still has one.
    pub fn change_world_finish(&mut self, connection: &ConnectionId, world_id: &WorldId) {
        let Some(player) = self.players.get(connection) else {
            debug!(connection = %connection, "change world finish for unknown player");
            return;
        };
        let Some(user) = player.user_id.clone() else {
            return;
        };
        if player.world.as_ref() != Some(world_id) {
            debug!(connection = %connection, world = %world_id, "change world finish for another world");
            return;
        }
        let spawn = player.spawn_point;
        let Some(world) = self.worlds.get_mut(world_id) else {
            return;
        };
        if world.sim.has_character(&user) {
            debug!(connection = %connection, "character already spawned");
            return;
        }
        world.sim.add_user(&user, spawn);
        info!(connection = %connection, user = %user, world = %world_id, "character spawned");
    }

    pub fn set_map(&mut self, connection: &ConnectionId, map: &str) {
        let Some(world_id) = self.world_of(connection) else {
            debug!(connection = %connection, "set map outside a world");
            return;
        };
        let Some(world) = self.worlds.get_mut(&world_id) else {
            return;
        };
        if !world.sim.launch_map(map) {
            warn!(connection = %connection, map, "unknown map");
            return;
        }
        info!(world = %world_id, map, "map changed");
        let members = world.member_list();
        self.transport.broadcast(
            Audience {
                group: &world_id,
                members: &members,
            },
            &ServerEvent::MapChanged {
                map: map.to_string(),
            },
        );
    }

    pub fn set_scenario(&mut self, connection: &ConnectionId, scenario: &str) {
        let Some(world_id) = self.world_of(connection) else {
            debug!(connection = %connection, "set scenario outside a world");
            return;
        };
        let Some(world) = self.worlds.get_mut(&world_id) else {
            return;
        };
        if !world.sim.launch_scenario(scenario) {
            warn!(connection = %connection, scenario, "unknown scenario");
            return;
        }
        info!(world = %world_id, scenario, "scenario changed");
        let members = world.member_list();
        self.transport.broadcast(
            Audience {
                group: &world_id,
                members: &members,
            },
            &ServerEvent::ScenarioChanged {
                scenario: scenario.to_string(),
            },
        );
    }

    /// Logs and relays a chat line. Outside a world it is only echoed back.
    pub fn chat(&mut self, connection: &ConnectionId, message: &str) {
        let Some(player) = self.players.get(connection) else {
            debug!(connection = %connection, "chat from unknown player");
            return;
        };
        let Some(user) = player.user_id.clone() else {
            debug!(connection = %connection, "chat before identity confirm");
            return;
        };
        let entry = ChatEntry::new(user.clone(), message);
        let event = ServerEvent::ChatMessage(ChatPayload {
            connection_id: connection.clone(),
            user_id: user,
            message: entry.message.clone(),
        });

        let world = player
            .world
            .clone()
            .and_then(|id| self.worlds.get_mut(&id));
        match world {
            Some(world) => {
                world.chat.push(entry);
                let members = world.member_list();
                let group = world.id.clone();
                self.transport.broadcast(
                    Audience {
                        group: &group,
                        members: &members,
                    },
                    &event,
                );
            }
            None => self.transport.send_to(connection, &event),
        }
    }

    /// Drops dead members, then removes worlds that are empty and that no
    /// player still points at.
    pub fn garbage_collect(&mut self) -> Vec<WorldId> {
        for world in self.worlds.worlds.values_mut() {
            world.members.retain(|c| self.players.contains(c));
            if world.members.is_empty() {
                world.tick = None;
            }
        }
        let doomed: Vec<WorldId> = self
            .worlds
            .iter()
            .filter(|w| w.members.is_empty())
            .filter(|w| !self.players.iter().any(|p| p.references(&w.id)))
            .map(|w| w.id.clone())
            .collect();
        for id in &doomed {
            self.worlds.remove(id);
            info!(world = %id, "world removed");
            self.publish(LifecycleEvent::WorldRemoved {
                world_id: id.clone(),
            });
        }
        doomed
    }

    fn world_of(&self, connection: &ConnectionId) -> Option<WorldId> {
        self.players.get(connection)?.world.clone()
    }
}

#[cfg(test)]
mod tests {
    use realm_shared::config::{ServerConfig, WorldCreation};

    use super::*;
    use crate::testing::{harness, Delivery};

    fn shared_config() -> ServerConfig {
        ServerConfig {
            world_creation: WorldCreation::AtLeastOne,
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn at_least_one_shares_the_first_world() {
        let mut h = harness(shared_config());
        let a = h.connect("soc_1");
        let b = h.connect("soc_2");
        let c = h.connect("soc_3");
        for (conn, user) in [(&a, "user_1"), (&b, "user_2"), (&c, "user_3")] {
            h.confirm(conn, user);
        }
        assert_eq!(h.session.worlds.len(), 1);
        let world = h.session.worlds.get(&WorldId::new("World_soc_1")).unwrap();
        assert_eq!(world.members.len(), 3);
    }

    #[tokio::test]
    async fn join_notifies_only_existing_members() {
        let mut h = harness(shared_config());
        let a = h.connect("soc_1");
        h.confirm(&a, "user_1");
        let b = h.connect("soc_2");
        h.recorder.take();
        h.confirm(&b, "user_2");

        let sent = h.recorder.take();
        let adds: Vec<_> = sent
            .iter()
            .filter_map(|d| match d {
                Delivery::Event {
                    to,
                    event: ServerEvent::AddClient(peer),
                } => Some((to.clone(), peer.connection_id.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(adds, vec![(a.clone(), b.clone())]);
    }

    #[tokio::test]
    async fn join_then_leave_restores_membership() {
        let mut h = harness(shared_config());
        let a = h.connect("soc_1");
        h.confirm(&a, "user_1");
        let b = h.connect("soc_2");
        h.confirm(&b, "user_2");
        let world = WorldId::new("World_soc_1");
        h.session.leave(&b);
        let before = h.session.worlds.get(&world).unwrap().members.clone();

        h.session.join(&b, &world).unwrap();
        h.session.leave(&b);
        assert_eq!(h.session.worlds.get(&world).unwrap().members, before);
        assert!(h.session.players.get(&b).unwrap().world.is_none());
    }

    #[tokio::test]
    async fn rejoin_takes_the_freed_spawn_slot() {
        let mut h = harness(shared_config());
        let ids: Vec<_> = ["soc_1", "soc_2", "soc_3", "soc_4"]
            .into_iter()
            .map(|id| h.connect(id))
            .collect();
        for (i, conn) in ids[..3].iter().enumerate() {
            h.confirm(conn, &format!("user_{}", i + 1));
        }
        let first_spawn = h.session.players.get(&ids[0]).unwrap().spawn_point;
        h.session.leave(&ids[0]);
        h.confirm(&ids[3], "user_4");

        let newcomer = h.session.players.get(&ids[3]).unwrap();
        assert_eq!(newcomer.spawn_slot, Some(0));
        assert_eq!(newcomer.spawn_point, first_spawn);
        let spawns: BTreeSet<_> = ids[1..]
            .iter()
            .map(|c| h.session.players.get(c).unwrap().spawn_slot)
            .collect();
        assert_eq!(spawns.len(), 3, "two players share a spawn slot");
    }

    #[tokio::test]
    async fn unconfirmed_players_cannot_join() {
        let mut h = harness(shared_config());
        let a = h.connect("soc_1");
        let world = WorldId::new("World_soc_1");
        assert_eq!(h.session.join(&a, &world), Err(JoinRejected::Unconfirmed));
        assert_eq!(
            h.session.join(&ConnectionId::new("soc_9"), &world),
            Err(JoinRejected::UnknownPlayer)
        );
        h.confirm(&a, "user_1");
        assert_eq!(
            h.session.join(&a, &WorldId::new("nowhere")),
            Err(JoinRejected::UnknownWorld)
        );
    }

    #[tokio::test]
    async fn change_world_moves_and_reports_prior_members() {
        let mut h = harness(ServerConfig::default());
        let a = h.connect("soc_1");
        let b = h.connect("soc_2");
        h.confirm(&a, "user_1");
        h.confirm(&b, "user_2");

        let w1 = WorldId::new("World_soc_1");
        let w2 = WorldId::new("World_soc_2");
        let reply = h.session.change_world(&a, &w2).unwrap();

        assert_eq!(reply.world_id, w2);
        assert_eq!(reply.players.len(), 1);
        assert_eq!(reply.players[0].connection_id, b);
        assert_eq!(reply.last_map_id.as_deref(), Some("stub_map"));
        assert!(h.session.worlds.get(&w2).unwrap().members.contains(&a));
        // The emptied world is collected on the status pass.
        assert!(!h.session.worlds.contains(&w1));
    }

    #[tokio::test]
    async fn change_to_unknown_world_does_nothing() {
        let mut h = harness(ServerConfig::default());
        let a = h.connect("soc_1");
        h.confirm(&a, "user_1");
        assert!(h.session.change_world(&a, &WorldId::new("World_x")).is_none());
        assert_eq!(
            h.session.players.get(&a).unwrap().world.as_ref().map(WorldId::as_str),
            Some("World_soc_1")
        );
    }

    #[tokio::test]
    async fn change_world_finish_spawns_once() {
        let mut h = harness(ServerConfig::default());
        let a = h.connect("soc_1");
        h.confirm(&a, "user_1");
        let w = WorldId::new("World_soc_1");
        h.session.change_world_finish(&a, &w);
        h.session.change_world_finish(&a, &w);
        assert_eq!(h.stub.spawns(), 1);
        h.session.change_world_finish(&a, &WorldId::new("World_other"));
        assert_eq!(h.stub.spawns(), 1);
    }

    #[tokio::test]
    async fn gc_keeps_worlds_still_referenced() {
        let mut h = harness(ServerConfig::default());
        let a = h.connect("soc_1");
        // Unconfirmed: the assignment alone keeps the world alive.
        assert!(h.session.garbage_collect().is_empty());
        assert!(h.session.worlds.contains(&WorldId::new("World_soc_1")));

        h.confirm(&a, "user_1");
        h.session.leave(&a);
        assert_eq!(
            h.session.garbage_collect(),
            vec![WorldId::new("World_soc_1")]
        );
    }

    #[tokio::test]
    async fn worldless_chat_is_echoed_only() {
        let mut h = harness(ServerConfig {
            world_creation: WorldCreation::Unassigned,
            ..ServerConfig::default()
        });
        let a = h.connect("soc_1");
        let _b = h.connect("soc_2");
        h.confirm(&a, "user_1");
        h.recorder.take();

        h.session.chat(&a, "hello");
        match h.recorder.take().as_slice() {
            [Delivery::Event {
                to,
                event: ServerEvent::ChatMessage(msg),
            }] => {
                assert_eq!(to, &a);
                assert_eq!(msg.message, "hello");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn world_chat_is_logged_and_broadcast() {
        let mut h = harness(shared_config());
        let a = h.connect("soc_1");
        let b = h.connect("soc_2");
        h.confirm(&a, "user_1");
        h.confirm(&b, "user_2");
        h.recorder.take();

        h.session.chat(&b, "hi all");
        let world = h.session.worlds.get(&WorldId::new("World_soc_1")).unwrap();
        assert_eq!(world.chat.len(), 1);
        assert_eq!(world.chat.last().unwrap().from.as_str(), "user_2");
        assert_eq!(h.recorder.take().len(), 2);
    }

    #[tokio::test]
    async fn map_change_is_broadcast() {
        let mut h = harness(ServerConfig::default());
        let a = h.connect("soc_1");
        h.confirm(&a, "user_1");
        h.recorder.take();

        h.session.set_map(&a, "bogus");
        assert!(h.recorder.take().is_empty());
        h.session.set_map(&a, "stub_map");
        assert!(matches!(
            h.recorder.take().as_slice(),
            [Delivery::Event {
                event: ServerEvent::MapChanged { .. },
                ..
            }]
        ));
    }
}
