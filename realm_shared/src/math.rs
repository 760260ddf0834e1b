//! Positions and spawn-grid layout.

use serde::{Deserialize, Serialize};

/// World-space position or velocity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Self = Self {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }

    pub fn scale(self, s: f32) -> Self {
        Self::new(self.x * s, self.y * s, self.z * s)
    }

    pub fn len_sq(self) -> f32 {
        self.x * self.x + self.y * self.y + self.z * self.z
    }

    /// Yaw in radians, measured from +z toward +x.
    pub fn heading(self) -> f32 {
        self.x.atan2(self.z)
    }

    pub fn lerp(self, to: Self, t: f32) -> Self {
        let t = t.clamp(0.0, 1.0);
        Self::new(
            self.x + (to.x - self.x) * t,
            self.y + (to.y - self.y) * t,
            self.z + (to.z - self.z) * t,
        )
    }
}

/// Position of slot `index` on a spawn grid laid out row by row along +x/+z.
pub fn grid_position(origin: Vec3, spacing: f32, columns: u32, index: usize) -> Vec3 {
    let columns = columns.max(1) as usize;
    let col = (index % columns) as f32;
    let row = (index / columns) as f32;
    origin.add(Vec3::new(col * spacing, 0.0, row * spacing))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lerp_clamps_past_the_target() {
        let from = Vec3::new(0.0, 0.0, 2.0);
        let to = Vec3::new(4.0, 0.0, 2.0);
        assert_eq!(from.lerp(to, 0.25), Vec3::new(1.0, 0.0, 2.0));
        assert_eq!(from.lerp(to, 3.0), to);
    }

    #[test]
    fn heading_follows_x_then_z() {
        assert_eq!(Vec3::new(0.0, 0.0, 1.0).heading(), 0.0);
        let east = Vec3::new(1.0, 0.0, 0.0).heading();
        assert!((east - std::f32::consts::FRAC_PI_2).abs() < 1e-6);
    }

    #[test]
    fn grid_wraps_rows() {
        let origin = Vec3::new(1.0, 0.0, 1.0);
        assert_eq!(grid_position(origin, 2.0, 3, 0), origin);
        assert_eq!(grid_position(origin, 2.0, 3, 2), Vec3::new(5.0, 0.0, 1.0));
        assert_eq!(grid_position(origin, 2.0, 3, 3), Vec3::new(1.0, 0.0, 3.0));
    }
}
