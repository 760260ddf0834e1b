//! Input handling.
//!
//! Turns sampled movement input into the `move` controls the sandbox world
//! understands.

use realm_shared::protocol::ControlsPayload;
use serde_json::json;

/// User input state at a moment in time.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InputState {
    pub forward: f32,
    pub right: f32,
}

impl InputState {
    pub fn is_idle(self) -> bool {
        self.forward == 0.0 && self.right == 0.0
    }
}

/// Builds a `move` controls payload. The server stamps the sender.
pub fn build_controls(input: InputState) -> ControlsPayload {
    ControlsPayload {
        kind: "move".into(),
        connection_id: None,
        data: json!({ "x": input.right, "z": input.forward }),
    }
}

/// Asks the character to board a vehicle, the nearest one when `vehicle` is `None`.
pub fn enter_vehicle(vehicle: Option<&str>) -> ControlsPayload {
    let data = match vehicle {
        Some(id) => json!({ "vehicleId": id }),
        None => json!({}),
    };
    ControlsPayload {
        kind: "enterVehicle".into(),
        connection_id: None,
        data,
    }
}

pub fn exit_vehicle() -> ControlsPayload {
    ControlsPayload {
        kind: "exitVehicle".into(),
        connection_id: None,
        data: json!({}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn move_controls_map_axes() {
        let c = build_controls(InputState {
            forward: 1.0,
            right: -0.5,
        });
        assert_eq!(c.kind, "move");
        assert_eq!(c.data, json!({ "x": -0.5, "z": 1.0 }));
        assert!(InputState::default().is_idle());
    }
}
