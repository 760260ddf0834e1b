//! Connection registry.
//!
//! One `Player` per live connection, keyed by connection id. Every operation
//! here tolerates an unknown connection: disconnects race with everything
//! else, so a missing player is a debug line, never an error.

use std::collections::BTreeMap;

use chrono::Utc;
use realm_shared::{
    codec::Frame,
    config::WorldCreation,
    ids::{ConnectionId, UserId, WorldId},
    math::Vec3,
    protocol::{ControlsPayload, PendingIdentity, ServerEvent},
    snapshot::CameraAngles,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    scheduler::GraceTimer,
    session::{LifecycleEvent, Session},
    transport::Audience,
};

/// Server-side state of one connection.
#[derive(Debug)]
pub struct Player {
    pub connection_id: ConnectionId,
    /// Set once the client confirms its identity.
    pub user_id: Option<UserId>,
    pub sequence: u64,
    /// Current world. Only ever set for confirmed players.
    pub world: Option<WorldId>,
    /// World picked by the creation policy, joined on confirmation.
    pub assigned_world: Option<WorldId>,
    pub last_heartbeat: i64,
    pub ping: f64,
    pub spawn_point: Option<Vec3>,
    /// Spawn slot held in the current world.
    pub spawn_slot: Option<usize>,
    pub camera: CameraAngles,
    /// Running while a disconnected player waits for its entity release.
    pub(crate) grace: Option<GraceTimer>,
}

impl Player {
    pub fn new(connection_id: ConnectionId, sequence: u64, assigned_world: Option<WorldId>) -> Self {
        Self {
            connection_id,
            user_id: None,
            sequence,
            world: None,
            assigned_world,
            last_heartbeat: 0,
            ping: 0.0,
            spawn_point: None,
            spawn_slot: None,
            camera: CameraAngles::default(),
            grace: None,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.user_id.is_some()
    }

    /// True between the socket closing and the player's removal.
    pub fn in_grace(&self) -> bool {
        self.grace.is_some()
    }

    /// Whether this player keeps `world` alive for garbage collection.
    pub fn references(&self, world: &WorldId) -> bool {
        self.world.as_ref() == Some(world) || self.assigned_world.as_ref() == Some(world)
    }
}

#[derive(Debug, Default)]
pub struct PlayerRegistry {
    players: BTreeMap<ConnectionId, Player>,
}

impl PlayerRegistry {
    pub fn insert(&mut self, player: Player) {
        self.players.insert(player.connection_id.clone(), player);
    }

    pub fn remove(&mut self, connection: &ConnectionId) -> Option<Player> {
        self.players.remove(connection)
    }

    pub fn get(&self, connection: &ConnectionId) -> Option<&Player> {
        self.players.get(connection)
    }

    pub fn get_mut(&mut self, connection: &ConnectionId) -> Option<&mut Player> {
        self.players.get_mut(connection)
    }

    pub fn contains(&self, connection: &ConnectionId) -> bool {
        self.players.contains_key(connection)
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Player> {
        self.players.values()
    }

    pub fn find_user(&self, user: &UserId) -> Option<&Player> {
        self.players
            .values()
            .find(|p| p.user_id.as_ref() == Some(user))
    }

    /// Confirmed user id of a connection.
    pub fn user_of(&self, connection: &ConnectionId) -> Option<&UserId> {
        self.get(connection).and_then(|p| p.user_id.as_ref())
    }
}

impl Session {
    /// A socket was accepted: create the player, place it per policy and
    /// hand out a provisional identity.
    pub fn on_connect(&mut self, connection: ConnectionId, outbox: mpsc::Sender<Frame>) {
        if self.players.contains(&connection) {
            warn!(connection = %connection, "duplicate connection id ignored");
            return;
        }
        self.transport.attach(connection.clone(), outbox);

        self.next_sequence += 1;
        let sequence = self.next_sequence;
        let assigned = self.assign_world(&connection);
        self.players
            .insert(Player::new(connection.clone(), sequence, assigned.clone()));

        let identity = PendingIdentity {
            connection_id: connection.clone(),
            sequence_counter: sequence,
            world_id: assigned.clone(),
        };
        self.transport
            .send_to(&connection, &ServerEvent::IdentityAssigned(identity));

        info!(
            connection = %connection,
            sequence,
            world = ?assigned.as_ref().map(WorldId::as_str),
            "player connected"
        );
        self.publish(LifecycleEvent::Connected {
            connection_id: connection,
        });
        self.status_pass();
    }

    fn assign_world(&mut self, connection: &ConnectionId) -> Option<WorldId> {
        match self.config.world_creation {
            WorldCreation::OneForEach => {
                let id = WorldId::for_connection(connection);
                self.create_world(id.clone());
                Some(id)
            }
            WorldCreation::AtLeastOne => match self.worlds.first_id() {
                Some(id) => Some(id),
                None => {
                    let id = WorldId::for_connection(connection);
                    self.create_world(id.clone());
                    Some(id)
                }
            },
            WorldCreation::Unassigned => None,
        }
    }

    /// The client echoed its identity back. Joins the assigned world, if any.
    pub fn confirm_identity(&mut self, connection: &ConnectionId, user: UserId) {
        let Some(player) = self.players.get(connection) else {
            debug!(connection = %connection, "identity confirm for unknown player");
            return;
        };
        if let Some(current) = &player.user_id {
            if current != &user {
                warn!(connection = %connection, current = %current, requested = %user, "identity already confirmed");
            }
            return;
        }
        if let Some(other) = self.players.find_user(&user) {
            warn!(
                connection = %connection,
                user = %user,
                holder = %other.connection_id,
                "user id already in use"
            );
            return;
        }

        let Some(player) = self.players.get_mut(connection) else {
            return;
        };
        player.user_id = Some(user.clone());
        let assigned = player.assigned_world.clone();
        info!(connection = %connection, user = %user, "identity confirmed");

        if let Some(world) = assigned {
            if let Err(reason) = self.join(connection, &world) {
                debug!(connection = %connection, world = %world, ?reason, "assigned world join skipped");
            }
        }
    }

    /// Records a heartbeat.
    pub fn heartbeat(&mut self, connection: &ConnectionId, timestamp: Option<i64>, ping: Option<f64>) {
        let Some(player) = self.players.get_mut(connection) else {
            debug!(connection = %connection, "heartbeat from unknown player");
            return;
        };
        player.last_heartbeat = timestamp.unwrap_or_else(|| Utc::now().timestamp_millis());
        if let Some(ping) = ping {
            player.ping = ping;
        }
    }

    /// Hands input to the world simulation and relays it to the world,
    /// stamped with the sender's connection id.
    pub fn set_controls(&mut self, connection: &ConnectionId, mut controls: ControlsPayload) {
        let Some(player) = self.players.get(connection) else {
            debug!(connection = %connection, "controls from unknown player");
            return;
        };
        let (Some(user), Some(world_id)) = (player.user_id.clone(), player.world.clone()) else {
            debug!(connection = %connection, "controls outside a world ignored");
            return;
        };
        let Some(world) = self.worlds.get_mut(&world_id) else {
            return;
        };
        controls.connection_id = Some(connection.clone());
        world.sim.apply_controls(&user, &controls);

        let members = world.member_list();
        self.transport.broadcast(
            Audience {
                group: &world_id,
                members: &members,
            },
            &ServerEvent::Controls(controls),
        );
    }

    /// The socket is gone. Players still driving something get a grace
    /// window for the release to finish; everyone else is removed now.
    pub fn on_disconnect(&mut self, connection: &ConnectionId) {
        self.transport.detach(connection);
        let Some(player) = self.players.get(connection) else {
            debug!(connection = %connection, "disconnect for unknown player");
            return;
        };
        if player.in_grace() {
            return;
        }

        let controlling = match (&player.user_id, &player.world) {
            (Some(user), Some(world_id)) => self
                .worlds
                .get_mut(world_id)
                .filter(|w| w.sim.is_controlling(user))
                .map(|w| {
                    w.sim.release_control(user);
                    true
                })
                .unwrap_or(false),
            _ => false,
        };
        if !controlling {
            self.finish_disconnect(connection);
            return;
        }

        let window = self.config.grace_window();
        let timer = GraceTimer::start(connection.clone(), window, self.events.clone());
        if let Some(player) = self.players.get_mut(connection) {
            player.grace = Some(timer);
        }
        info!(
            connection = %connection,
            window_ms = window.as_millis() as u64,
            "grace period started"
        );
    }

    /// Removes grace players of `world_id` whose release has completed.
    pub(crate) fn settle_grace(&mut self, world_id: &WorldId) {
        let Some(world) = self.worlds.get(world_id) else {
            return;
        };
        let released: Vec<ConnectionId> = world
            .members
            .iter()
            .filter_map(|c| self.players.get(c))
            .filter(|p| p.in_grace())
            .filter(|p| {
                p.user_id
                    .as_ref()
                    .map_or(true, |u| !world.sim.is_controlling(u))
            })
            .map(|p| p.connection_id.clone())
            .collect();
        for connection in released {
            info!(connection = %connection, "entity released, finishing disconnect");
            self.finish_disconnect(&connection);
        }
    }

    pub fn on_grace_expired(&mut self, connection: &ConnectionId) {
        match self.players.get(connection) {
            Some(player) if player.in_grace() => {
                info!(connection = %connection, "grace expired, forcing teardown");
                self.finish_disconnect(connection);
            }
            _ => debug!(connection = %connection, "stale grace expiry"),
        }
    }

    /// Final teardown: leave the world, drop the player, report.
    pub(crate) fn finish_disconnect(&mut self, connection: &ConnectionId) {
        self.leave(connection);
        self.transport.detach(connection);
        if self.players.remove(connection).is_none() {
            return;
        }
        info!(connection = %connection, "player disconnected");
        self.publish(LifecycleEvent::Disconnected {
            connection_id: connection.clone(),
        });
        self.status_pass();
    }
}
