//! World simulation collaborator.
//!
//! The session layer never simulates anything itself. Each world owns a
//! `WorldSim` that it steps on its tick and asks for replicated entities.

use serde::{Deserialize, Serialize};

use crate::{
    ids::{UserId, WorldId},
    math::{grid_position, Vec3},
    protocol::ControlsPayload,
    snapshot::{EntityState, SunConfig},
};

/// Grid of spawn points declared by a scenario.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpawnSlot {
    pub origin: Vec3,
    pub spacing: f32,
    pub columns: u32,
}

impl SpawnSlot {
    pub fn position(&self, index: usize) -> Vec3 {
        grid_position(self.origin, self.spacing, self.columns, index)
    }
}

/// A scenario a map offers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioInfo {
    pub name: String,
    /// Player spawn grid. Scenarios without one spawn players nowhere in particular.
    pub spawn: Option<SpawnSlot>,
    /// Initial camera yaw (degrees) for players spawned here.
    pub initial_camera_angle: f32,
}

/// One simulated world.
pub trait WorldSim: Send {
    /// Steps the simulation by `dt` seconds.
    fn update(&mut self, dt: f32);

    fn map_names(&self) -> Vec<String>;

    /// Loads a map and its default scenario. Returns false for unknown maps.
    fn launch_map(&mut self, name: &str) -> bool;

    /// Switches scenario within the current map. Returns false if the map
    /// has no such scenario.
    fn launch_scenario(&mut self, name: &str) -> bool;

    fn last_map_id(&self) -> Option<String>;
    fn last_scenario_id(&self) -> Option<String>;

    /// Scenarios of the current map.
    fn scenarios(&self) -> Vec<ScenarioInfo>;

    /// Fixed step of the world tick, in seconds.
    fn physics_frame_time(&self) -> f32;
    fn time_scale_target(&self) -> f32;
    fn sun(&self) -> SunConfig;

    /// Spawns (or respawns) the user's character.
    fn add_user(&mut self, user: &UserId, spawn: Option<Vec3>);
    /// Removes the user's character, releasing whatever it controls.
    fn remove_user(&mut self, user: &UserId);
    fn has_character(&self, user: &UserId) -> bool;

    /// True while the user drives some entity (including while its release
    /// is still in progress).
    fn is_controlling(&self, user: &UserId) -> bool;
    /// Starts releasing whatever the user controls. Completion shows up as
    /// `is_controlling` turning false after some updates.
    fn release_control(&mut self, user: &UserId);

    fn apply_controls(&mut self, user: &UserId, controls: &ControlsPayload);

    /// Replicated entities, mutable so the caller can stamp them.
    fn entities_mut(&mut self) -> Box<dyn Iterator<Item = &mut EntityState> + '_>;
}

/// Builds the simulation for a newly created world.
pub trait WorldFactory: Send + Sync {
    fn create(&self, world: &WorldId) -> Box<dyn WorldSim>;
}

/// Finds the spawn point for slot `index` of the current scenario.
pub fn spawn_point(sim: &dyn WorldSim, index: usize) -> Option<(Vec3, f32)> {
    let current = sim.last_scenario_id()?;
    let scenario = sim.scenarios().into_iter().find(|s| s.name == current)?;
    let slot = scenario.spawn?;
    Some((slot.position(index), scenario.initial_camera_angle))
}
