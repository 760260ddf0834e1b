//! Session state.
//!
//! `Session` owns both registries and the transport. Only the hub task
//! touches it, one event at a time, so every operation runs to completion
//! without interleaving.

use std::sync::Arc;

use realm_shared::{
    config::{BroadcastMode, ServerConfig, WorldCreation},
    ids::{ConnectionId, WorldId},
    protocol::ServerEvent,
    sim::WorldFactory,
};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::{
    hub::HubEvent,
    players::PlayerRegistry,
    router,
    scheduler::{spawn_lobby_tick, TickHandle},
    snapshot::Scope,
    transport::{decode_inbound, Transport},
    worlds::WorldRegistry,
};

/// Close code sent to every client on shutdown.
pub const SHUTDOWN_CLOSE_CODE: u16 = 4000;
pub const SHUTDOWN_CLOSE_REASON: &str = "server closed";
/// Close code for operator kicks.
pub const KICK_CLOSE_CODE: u16 = 4001;

/// Capacity of the lifecycle broadcast channel.
pub const LIFECYCLE_CAPACITY: usize = 256;

/// Notifications for in-process observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Connected { connection_id: ConnectionId },
    Disconnected { connection_id: ConnectionId },
    WorldCreated { world_id: WorldId },
    WorldRemoved { world_id: WorldId },
}

pub struct Session {
    pub(crate) config: ServerConfig,
    pub(crate) players: PlayerRegistry,
    pub(crate) worlds: WorldRegistry,
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) factory: Arc<dyn WorldFactory>,
    /// Where timers post their events.
    pub(crate) events: mpsc::Sender<HubEvent>,
    lifecycle: broadcast::Sender<LifecycleEvent>,
    pub(crate) next_sequence: u64,
    lobby_tick: Option<TickHandle>,
}

impl Session {
    /// Builds the session, creates the configured startup worlds and starts
    /// the lobby tick. Must run inside a tokio runtime.
    pub fn new(
        config: ServerConfig,
        transport: Box<dyn Transport>,
        factory: Arc<dyn WorldFactory>,
        events: mpsc::Sender<HubEvent>,
        lifecycle: broadcast::Sender<LifecycleEvent>,
    ) -> Self {
        let lobby_tick = match config.broadcast {
            BroadcastMode::IntervalPush => {
                Some(spawn_lobby_tick(config.lobby_tick(), events.clone()))
            }
            BroadcastMode::RequestReply => None,
        };
        let startup_worlds = config.worlds.clone();
        let mut session = Self {
            config,
            players: PlayerRegistry::default(),
            worlds: WorldRegistry::default(),
            transport,
            factory,
            events,
            lifecycle,
            next_sequence: 0,
            lobby_tick,
        };
        for id in startup_worlds {
            session.create_world(WorldId::new(id));
        }
        session
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn players(&self) -> &PlayerRegistry {
        &self.players
    }

    pub fn worlds(&self) -> &WorldRegistry {
        &self.worlds
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle.subscribe()
    }

    pub(crate) fn publish(&self, event: LifecycleEvent) {
        // No subscribers is fine.
        let _ = self.lifecycle.send(event);
    }

    /// Applies one hub event.
    pub fn handle(&mut self, event: HubEvent) {
        match event {
            HubEvent::Connected { connection, outbox } => self.on_connect(connection, outbox),
            HubEvent::Disconnected { connection } => self.on_disconnect(&connection),
            HubEvent::Frame { connection, frame } => {
                match decode_inbound(self.transport.kind(), &connection, &frame) {
                    Ok(Some(inbound)) => router::dispatch(self, inbound),
                    Ok(None) => {}
                    Err(e) => warn!(connection = %connection, error = %e, "inbound frame dropped"),
                }
            }
            HubEvent::WorldTick { world, generation } => self.on_world_tick(&world, generation),
            HubEvent::LobbyTick => self.on_lobby_tick(),
            HubEvent::GraceExpired(connection) => self.on_grace_expired(&connection),
            HubEvent::Console { line, reply } => {
                let _ = reply.send(self.exec_console(&line));
            }
            HubEvent::Shutdown => self.shutdown(),
        }
    }

    /// Steps a world, settles finished releases and pushes its snapshot.
    pub fn on_world_tick(&mut self, world_id: &WorldId, generation: u64) {
        let Some(world) = self.worlds.get_mut(world_id) else {
            debug!(world = %world_id, "tick for removed world");
            return;
        };
        if world.tick_generation() != Some(generation) {
            debug!(world = %world_id, generation, "stale world tick");
            return;
        }
        let dt = world.sim.physics_frame_time();
        world.sim.update(dt);
        self.settle_grace(world_id);

        if self.config.broadcast != BroadcastMode::IntervalPush {
            return;
        }
        let Some(world) = self.worlds.get(world_id) else {
            return;
        };
        let members = world.member_list();
        if members.is_empty() {
            return;
        }
        let snapshot = self.snapshot(Scope::World(world_id));
        self.transport.broadcast(
            crate::transport::Audience {
                group: world_id,
                members: &members,
            },
            &ServerEvent::StateUpdate(snapshot),
        );
    }

    /// Pushes the lobby snapshot to every confirmed player outside a world.
    pub fn on_lobby_tick(&mut self) {
        if self.config.broadcast != BroadcastMode::IntervalPush {
            return;
        }
        let recipients: Vec<ConnectionId> = self
            .players
            .iter()
            .filter(|p| p.is_confirmed() && p.world.is_none() && !p.in_grace())
            .map(|p| p.connection_id.clone())
            .collect();
        if recipients.is_empty() {
            return;
        }
        let event = ServerEvent::StateUpdate(self.snapshot(Scope::Lobby));
        for connection in &recipients {
            self.transport.send_to(connection, &event);
        }
    }

    /// Collects garbage (one world per player only) and logs counts.
    pub fn status_pass(&mut self) {
        if self.config.world_creation == WorldCreation::OneForEach {
            self.garbage_collect();
        }
        info!(users = self.players.len(), worlds = self.worlds.len(), "status");
        for world in self.worlds.iter() {
            debug!(
                world = %world.id,
                members = world.members.len(),
                ticking = world.is_ticking(),
                users = ?world.members.iter().map(ConnectionId::as_str).collect::<Vec<_>>(),
                "world status"
            );
        }
    }

    /// Executes an operator console command.
    pub fn exec_console(&mut self, line: &str) -> Vec<String> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(command) = tokens.first() else {
            return Vec::new();
        };
        match *command {
            "status" => {
                self.status_pass();
                let mut out = vec![
                    format!("Transport: {:?}", self.transport.kind()),
                    format!("Users: {}", self.players.len()),
                    format!("Worlds: {}", self.worlds.len()),
                ];
                for p in self.players.iter() {
                    out.push(format!(
                        "  {}: user={} world={} grace={}",
                        p.connection_id,
                        p.user_id.as_ref().map_or("-", |u| u.as_str()),
                        p.world.as_ref().map_or("-", |w| w.as_str()),
                        p.in_grace()
                    ));
                }
                out
            }
            "worlds" => {
                let mut out = vec![format!("Worlds: {}", self.worlds.len())];
                for w in self.worlds.iter() {
                    out.push(format!(
                        "  {}: members={} map={} scenario={} ticking={} chat={}",
                        w.id,
                        w.members.len(),
                        w.sim.last_map_id().unwrap_or_else(|| "-".into()),
                        w.sim.last_scenario_id().unwrap_or_else(|| "-".into()),
                        w.is_ticking(),
                        w.chat.len()
                    ));
                }
                out
            }
            "kick" => {
                let Some(id) = tokens.get(1) else {
                    return vec!["Usage: kick <connectionId>".to_string()];
                };
                let connection = ConnectionId::new(*id);
                let Some(player) = self.players.get(&connection) else {
                    return vec![format!("No such connection: {id}")];
                };
                if player.in_grace() {
                    // Socket is already gone; skip the rest of the window.
                    self.finish_disconnect(&connection);
                } else {
                    self.transport.close(&connection, KICK_CLOSE_CODE, "kicked");
                    self.on_disconnect(&connection);
                }
                info!(connection = %connection, "kicked");
                vec![format!("Kicked {id}")]
            }
            "create" => {
                let Some(id) = tokens.get(1) else {
                    return vec!["Usage: create <worldId>".to_string()];
                };
                if self.create_world(WorldId::new(*id)) {
                    vec![format!("World '{id}' created")]
                } else {
                    vec![format!("World '{id}' already exists")]
                }
            }
            other => vec![format!("Unknown command: {other}")],
        }
    }

    /// Closes every connection and drops all state. Timers die with their
    /// handles.
    pub fn shutdown(&mut self) {
        info!(
            users = self.players.len(),
            worlds = self.worlds.len(),
            "session shutting down"
        );
        self.transport
            .close_all(SHUTDOWN_CLOSE_CODE, SHUTDOWN_CLOSE_REASON);
        self.lobby_tick = None;
        self.worlds.clear();
        self.players = PlayerRegistry::default();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use realm_shared::{
        codec::{encode_envelope, Envelope, Frame},
        config::{Codec, ServerConfig},
        ids::WorldId,
    };
    use serde_json::json;

    use super::*;
    use crate::testing::{harness, pump, Delivery};

    #[tokio::test]
    async fn startup_worlds_exist_before_players() {
        let h = harness(ServerConfig {
            world_creation: WorldCreation::Unassigned,
            worlds: vec!["lobby".into(), "arena".into()],
            ..ServerConfig::default()
        });
        assert_eq!(
            h.session.worlds.ids(),
            vec![WorldId::new("arena"), WorldId::new("lobby")]
        );
    }

    #[tokio::test]
    async fn undecodable_frames_are_dropped() {
        let mut h = harness(ServerConfig::default());
        let conn = h.connect("soc_1");
        h.recorder.take();
        h.session.handle(HubEvent::Frame {
            connection: conn.clone(),
            frame: Frame::Text("not json".into()),
        });
        let frame = encode_envelope(Codec::Json, &Envelope::new("dance", json!({}))).unwrap();
        h.session.handle(HubEvent::Frame {
            connection: conn.clone(),
            frame,
        });
        assert!(h.recorder.take().is_empty());
        assert!(h.session.players.contains(&conn));
    }

    #[tokio::test(start_paused = true)]
    async fn world_tick_pushes_state_to_members() {
        let mut h = harness(ServerConfig::default());
        let conn = h.connect("soc_1");
        h.confirm(&conn, "user_1");
        h.recorder.take();

        tokio::time::sleep(Duration::from_millis(60)).await;
        pump(&mut h.session, &mut h.events);
        let updates = h
            .recorder
            .take()
            .into_iter()
            .filter(|d| {
                matches!(
                    d,
                    Delivery::Event {
                        event: ServerEvent::StateUpdate(_),
                        ..
                    }
                )
            })
            .count();
        assert!(updates >= 1);
        assert!(h.stub.updates() >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn lobby_tick_reaches_only_worldless_players() {
        let mut h = harness(ServerConfig {
            world_creation: WorldCreation::Unassigned,
            ..ServerConfig::default()
        });
        let a = h.connect("soc_1");
        let _unconfirmed = h.connect("soc_2");
        h.confirm(&a, "user_1");
        h.recorder.take();

        tokio::time::sleep(Duration::from_millis(110)).await;
        pump(&mut h.session, &mut h.events);
        let sent = h.recorder.take();
        assert!(!sent.is_empty());
        assert!(sent.iter().all(|d| matches!(
            d,
            Delivery::Event { to, event: ServerEvent::StateUpdate(_) } if to == &a
        )));
    }

    #[tokio::test]
    async fn request_reply_mode_pushes_nothing() {
        let mut h = harness(ServerConfig {
            broadcast: BroadcastMode::RequestReply,
            ..ServerConfig::default()
        });
        let conn = h.connect("soc_1");
        h.confirm(&conn, "user_1");
        h.recorder.take();
        let world = WorldId::new("World_soc_1");
        let generation = h.session.worlds.get(&world).unwrap().tick_generation().unwrap();
        h.session.on_world_tick(&world, generation);
        h.session.on_lobby_tick();
        assert!(h.recorder.take().is_empty());
        assert_eq!(h.stub.updates(), 1);
    }

    #[tokio::test]
    async fn shutdown_closes_everyone() {
        let mut h = harness(ServerConfig::default());
        let a = h.connect("soc_1");
        let b = h.connect("soc_2");
        h.recorder.take();
        h.session.handle(HubEvent::Shutdown);
        let closes: Vec<_> = h
            .recorder
            .take()
            .into_iter()
            .filter_map(|d| match d {
                Delivery::Close { to, code, reason } => Some((to, code, reason)),
                _ => None,
            })
            .collect();
        assert_eq!(closes.len(), 2);
        assert!(closes
            .iter()
            .all(|(_, code, reason)| *code == 4000 && reason == "server closed"));
        assert!(closes.iter().any(|(to, _, _)| to == &a));
        assert!(closes.iter().any(|(to, _, _)| to == &b));
        assert!(h.session.players.is_empty());
        assert!(h.session.worlds.is_empty());
    }

    #[tokio::test]
    async fn console_lists_and_kicks() {
        let mut h = harness(ServerConfig::default());
        let a = h.connect("soc_1");
        h.confirm(&a, "user_1");

        let status = h.session.exec_console("status");
        assert!(status.iter().any(|l| l.contains("soc_1") && l.contains("user_1")));
        let worlds = h.session.exec_console("worlds");
        assert!(worlds.iter().any(|l| l.contains("World_soc_1")));

        let out = h.session.exec_console("kick soc_1");
        assert_eq!(out, vec!["Kicked soc_1".to_string()]);
        assert!(!h.session.players.contains(&a));
        assert_eq!(
            h.session.exec_console("kick soc_1"),
            vec!["No such connection: soc_1".to_string()]
        );
        assert_eq!(
            h.session.exec_console("create extra"),
            vec!["World 'extra' created".to_string()]
        );
        assert!(h.session.exec_console("frobnicate")[0].starts_with("Unknown command"));
    }

    #[tokio::test]
    async fn kick_ends_a_grace_window() {
        let mut h = harness(ServerConfig::default());
        let conn = h.connect("soc_1");
        h.confirm(&conn, "user_1");
        h.stub.set_controlling(true);
        h.stub.set_release_completes(false);
        h.session.on_disconnect(&conn);
        assert!(h.session.players.get(&conn).unwrap().in_grace());

        assert_eq!(h.session.exec_console("kick soc_1"), vec!["Kicked soc_1".to_string()]);
        assert!(!h.session.players.contains(&conn));
        assert_eq!(h.stub.releases(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_from_a_replaced_handle_are_ignored() {
        let mut h = harness(ServerConfig::default());
        let conn = h.connect("soc_1");
        h.confirm(&conn, "user_1");
        let world = WorldId::new("World_soc_1");
        let stale = h.session.worlds.get(&world).unwrap().tick_generation().unwrap();

        h.session.leave(&conn);
        h.session.join(&conn, &world).unwrap();
        let current = h.session.worlds.get(&world).unwrap().tick_generation().unwrap();
        assert_ne!(stale, current);

        h.session.handle(HubEvent::WorldTick {
            world: world.clone(),
            generation: stale,
        });
        assert_eq!(h.stub.updates(), 0);
        h.session.handle(HubEvent::WorldTick {
            world,
            generation: current,
        });
        assert_eq!(h.stub.updates(), 1);
    }
}
