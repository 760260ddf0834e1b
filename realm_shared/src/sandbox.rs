//! Built-in sandbox world.
//!
//! Deterministic stand-in for a physics world: characters walk on a plane,
//! vehicles can be entered and left, and leaving a vehicle takes
//! `EXIT_DURATION` seconds of simulated time.

use std::collections::BTreeMap;

use tracing::debug;

use crate::{
    ecs::{EntityId, EntityStore},
    ids::{UserId, WorldId},
    math::Vec3,
    protocol::ControlsPayload,
    sim::{ScenarioInfo, SpawnSlot, WorldFactory, WorldSim},
    snapshot::{EntityKind, EntityState, SunConfig, DEFAULT_TIME_SCALE},
};

/// Seconds a character needs to climb out of a vehicle.
pub const EXIT_DURATION: f32 = 0.6;
pub const WALK_SPEED: f32 = 4.0;
pub const DRIVE_SPEED: f32 = 10.0;
/// How close a character must be to enter a vehicle.
pub const ENTER_RANGE: f32 = 6.0;

const PHYSICS_FRAME_TIME: f32 = 1.0 / 60.0;

struct MapDef {
    name: &'static str,
    scenarios: &'static [ScenarioDef],
}

struct ScenarioDef {
    name: &'static str,
    spawn: Option<(Vec3, f32, u32)>,
    camera: f32,
    vehicles: &'static [Vec3],
}

static MAPS: &[MapDef] = &[
    MapDef {
        name: "sandbox",
        scenarios: &[
            ScenarioDef {
                name: "default",
                spawn: Some((Vec3::new(0.0, 0.0, 0.0), 2.0, 4)),
                camera: 0.0,
                vehicles: &[Vec3::new(6.0, 0.0, 0.0)],
            },
            ScenarioDef {
                name: "convoy",
                spawn: Some((Vec3::new(10.0, 0.0, 10.0), 3.0, 2)),
                camera: 90.0,
                vehicles: &[Vec3::new(14.0, 0.0, 10.0), Vec3::new(14.0, 0.0, 16.0)],
            },
        ],
    },
    MapDef {
        name: "test2",
        scenarios: &[
            ScenarioDef {
                name: "default",
                spawn: Some((Vec3::new(0.0, 0.0, -20.0), 2.5, 3)),
                camera: 180.0,
                vehicles: &[],
            },
            ScenarioDef {
                name: "empty",
                spawn: None,
                camera: 0.0,
                vehicles: &[],
            },
        ],
    },
];

fn find_map(name: &str) -> Option<&'static MapDef> {
    MAPS.iter().find(|m| m.name == name)
}

#[derive(Debug, Clone, Copy, Default)]
struct Velocity(Vec3);

/// On a character: the vehicle it drives.
#[derive(Debug, Clone, Copy)]
struct Driving(EntityId);

/// On a character: exit animation in progress.
#[derive(Debug, Clone, Copy)]
struct Exiting {
    remaining: f32,
}

#[derive(Debug, Clone, Copy)]
struct Vehicle;

/// Sandbox implementation of `WorldSim`.
#[derive(Default)]
pub struct SandboxWorld {
    store: EntityStore,
    map: Option<&'static MapDef>,
    scenario: Option<&'static ScenarioDef>,
    characters: BTreeMap<UserId, EntityId>,
    next_vehicle: u32,
}

impl SandboxWorld {
    pub fn new() -> Self {
        Self::default()
    }

    fn character(&self, user: &UserId) -> Option<EntityId> {
        self.characters.get(user).copied()
    }

    fn position(&self, entity: EntityId) -> Option<Vec3> {
        self.store.get::<EntityState>(entity).map(|e| e.position)
    }

    fn set_position(&mut self, entity: EntityId, position: Vec3) {
        if let Some(state) = self.store.get_mut::<EntityState>(entity) {
            state.position = position;
        }
    }

    fn set_controller(&mut self, entity: EntityId, user: Option<UserId>) {
        if let Some(state) = self.store.get_mut::<EntityState>(entity) {
            state.controlled_by = user;
        }
    }

    fn spawn_vehicles(&mut self) {
        let Some(scenario) = self.scenario else {
            return;
        };
        for pos in scenario.vehicles {
            self.next_vehicle += 1;
            let id = self.store.spawn();
            let name = format!("vehicle_{}", self.next_vehicle);
            self.store
                .insert(id, EntityState::new(name, EntityKind::Vehicle, *pos));
            self.store.insert(id, Velocity::default());
            self.store.insert(id, Vehicle);
        }
    }

    fn clear_vehicles(&mut self) {
        let users: Vec<UserId> = self.characters.keys().cloned().collect();
        for user in &users {
            self.drop_vehicle(user);
        }
        let vehicles: Vec<EntityId> = self.store.iter::<Vehicle>().map(|(id, _)| id).collect();
        for id in vehicles {
            self.store.despawn(id);
        }
    }

    /// Puts every character on the current scenario's spawn grid.
    fn place_characters(&mut self) {
        let slot = self.current_slot();
        let placed: Vec<(usize, EntityId)> = self.characters.values().copied().enumerate().collect();
        for (index, id) in placed {
            let pos = slot.map(|s| s.position(index)).unwrap_or(Vec3::ZERO);
            self.set_position(id, pos);
            if let Some(v) = self.store.get_mut::<Velocity>(id) {
                v.0 = Vec3::ZERO;
            }
        }
    }

    fn current_slot(&self) -> Option<SpawnSlot> {
        let (origin, spacing, columns) = self.scenario?.spawn?;
        Some(SpawnSlot {
            origin,
            spacing,
            columns,
        })
    }

    fn activate(&mut self, scenario: &'static ScenarioDef) {
        self.clear_vehicles();
        self.scenario = Some(scenario);
        self.spawn_vehicles();
        self.place_characters();
    }

    /// Leaves the vehicle immediately, without animation.
    fn drop_vehicle(&mut self, user: &UserId) {
        let Some(character) = self.character(user) else {
            return;
        };
        self.store.remove::<Exiting>(character);
        if let Some(Driving(vehicle)) = self.store.remove::<Driving>(character) {
            self.set_controller(vehicle, None);
            if let Some(v) = self.store.get_mut::<Velocity>(vehicle) {
                v.0 = Vec3::ZERO;
            }
            if let Some(pos) = self.position(vehicle) {
                self.set_position(character, pos.add(Vec3::new(2.0, 0.0, 0.0)));
            }
        }
    }

    fn enter_vehicle(&mut self, user: &UserId, requested: Option<&str>) {
        let Some(character) = self.character(user) else {
            return;
        };
        if self.store.get::<Driving>(character).is_some() {
            return;
        }
        let Some(here) = self.position(character) else {
            return;
        };
        let mut best: Option<(f32, EntityId)> = None;
        for (id, _) in self.store.iter::<Vehicle>() {
            let Some(state) = self.store.get::<EntityState>(id) else {
                continue;
            };
            if state.controlled_by.is_some() {
                continue;
            }
            if let Some(want) = requested {
                if state.id != want {
                    continue;
                }
            }
            let dist = state.position.add(here.scale(-1.0)).len_sq();
            if dist > ENTER_RANGE * ENTER_RANGE {
                continue;
            }
            if best.map_or(true, |(d, _)| dist < d) {
                best = Some((dist, id));
            }
        }
        if let Some((_, vehicle)) = best {
            self.store.insert(character, Driving(vehicle));
            self.set_controller(vehicle, Some(user.clone()));
            if let Some(v) = self.store.get_mut::<Velocity>(character) {
                v.0 = Vec3::ZERO;
            }
            debug!(user = %user, "entered vehicle");
        }
    }

    fn steer(&mut self, user: &UserId, data: &serde_json::Value) {
        let Some(character) = self.character(user) else {
            return;
        };
        let x = data.get("x").and_then(|v| v.as_f64()).unwrap_or(0.0) as f32;
        let z = data.get("z").and_then(|v| v.as_f64()).unwrap_or(0.0) as f32;
        let mut dir = Vec3::new(x, 0.0, z);
        if dir.len_sq() > 1.0 {
            dir = dir.scale(1.0 / dir.len_sq().sqrt());
        }
        let (target, speed) = match self.store.get::<Driving>(character) {
            Some(_) if self.store.get::<Exiting>(character).is_some() => return,
            Some(Driving(vehicle)) => (*vehicle, DRIVE_SPEED),
            None => (character, WALK_SPEED),
        };
        if let Some(v) = self.store.get_mut::<Velocity>(target) {
            v.0 = dir.scale(speed);
        }
    }
}

impl WorldSim for SandboxWorld {
    fn update(&mut self, dt: f32) {
        let mut finished = Vec::new();
        for (id, exiting) in self.store.iter_mut::<Exiting>() {
            exiting.remaining -= dt;
            if exiting.remaining <= 0.0 {
                finished.push(id);
            }
        }
        for character in finished {
            let user = self
                .characters
                .iter()
                .find(|(_, id)| **id == character)
                .map(|(u, _)| u.clone());
            if let Some(user) = user {
                self.drop_vehicle(&user);
                debug!(user = %user, "exited vehicle");
            }
        }

        let moving: Vec<(EntityId, Vec3)> = self
            .store
            .iter::<Velocity>()
            .filter(|(_, v)| v.0.len_sq() > 0.0)
            .map(|(id, v)| (id, v.0))
            .collect();
        for (id, velocity) in moving {
            if let Some(state) = self.store.get_mut::<EntityState>(id) {
                state.position = state.position.add(velocity.scale(dt));
                state.heading = velocity.heading();
            }
        }

        // Drivers ride along.
        let riders: Vec<(EntityId, EntityId)> = self
            .store
            .iter::<Driving>()
            .map(|(id, d)| (id, d.0))
            .collect();
        for (character, vehicle) in riders {
            if let Some(pos) = self.position(vehicle) {
                self.set_position(character, pos);
            }
        }
    }

    fn map_names(&self) -> Vec<String> {
        MAPS.iter().map(|m| m.name.to_string()).collect()
    }

    fn launch_map(&mut self, name: &str) -> bool {
        let Some(map) = find_map(name) else {
            return false;
        };
        self.map = Some(map);
        match map.scenarios.first() {
            Some(scenario) => self.activate(scenario),
            None => {
                self.clear_vehicles();
                self.scenario = None;
            }
        }
        true
    }

    fn launch_scenario(&mut self, name: &str) -> bool {
        let Some(scenario) = self
            .map
            .and_then(|m| m.scenarios.iter().find(|s| s.name == name))
        else {
            return false;
        };
        self.activate(scenario);
        true
    }

    fn last_map_id(&self) -> Option<String> {
        self.map.map(|m| m.name.to_string())
    }

    fn last_scenario_id(&self) -> Option<String> {
        self.scenario.map(|s| s.name.to_string())
    }

    fn scenarios(&self) -> Vec<ScenarioInfo> {
        let Some(map) = self.map else {
            return Vec::new();
        };
        map.scenarios
            .iter()
            .map(|s| ScenarioInfo {
                name: s.name.to_string(),
                spawn: s.spawn.map(|(origin, spacing, columns)| SpawnSlot {
                    origin,
                    spacing,
                    columns,
                }),
                initial_camera_angle: s.camera,
            })
            .collect()
    }

    fn physics_frame_time(&self) -> f32 {
        PHYSICS_FRAME_TIME
    }

    fn time_scale_target(&self) -> f32 {
        DEFAULT_TIME_SCALE
    }

    fn sun(&self) -> SunConfig {
        SunConfig::default()
    }

    fn add_user(&mut self, user: &UserId, spawn: Option<Vec3>) {
        self.remove_user(user);
        let id = self.store.spawn();
        let mut state = EntityState::new(
            format!("character_{user}"),
            EntityKind::Character,
            spawn.unwrap_or(Vec3::ZERO),
        );
        state.controlled_by = Some(user.clone());
        self.store.insert(id, state);
        self.store.insert(id, Velocity::default());
        self.characters.insert(user.clone(), id);
    }

    fn remove_user(&mut self, user: &UserId) {
        self.drop_vehicle(user);
        if let Some(id) = self.characters.remove(user) {
            self.store.despawn(id);
        }
    }

    fn has_character(&self, user: &UserId) -> bool {
        self.characters.contains_key(user)
    }

    fn is_controlling(&self, user: &UserId) -> bool {
        self.character(user)
            .is_some_and(|c| self.store.get::<Driving>(c).is_some())
    }

    fn release_control(&mut self, user: &UserId) {
        let Some(character) = self.character(user) else {
            return;
        };
        if self.store.get::<Driving>(character).is_none()
            || self.store.get::<Exiting>(character).is_some()
        {
            return;
        }
        if let Some(Driving(vehicle)) = self.store.get::<Driving>(character).copied() {
            if let Some(v) = self.store.get_mut::<Velocity>(vehicle) {
                v.0 = Vec3::ZERO;
            }
        }
        self.store.insert(
            character,
            Exiting {
                remaining: EXIT_DURATION,
            },
        );
    }

    fn apply_controls(&mut self, user: &UserId, controls: &ControlsPayload) {
        match controls.kind.as_str() {
            "enterVehicle" => {
                let requested = controls.data.get("vehicleId").and_then(|v| v.as_str());
                self.enter_vehicle(user, requested);
            }
            "exitVehicle" => self.release_control(user),
            "move" => self.steer(user, &controls.data),
            _ => {}
        }
    }

    fn entities_mut(&mut self) -> Box<dyn Iterator<Item = &mut EntityState> + '_> {
        Box::new(self.store.iter_mut::<EntityState>().map(|(_, e)| e))
    }
}

/// Creates a `SandboxWorld` per world.
#[derive(Debug, Default, Clone, Copy)]
pub struct SandboxFactory;

impl WorldFactory for SandboxFactory {
    fn create(&self, world: &WorldId) -> Box<dyn WorldSim> {
        debug!(world = %world, "sandbox world created");
        Box::new(SandboxWorld::new())
    }
}
