//! Interpolation.
//!
//! The server pushes discrete snapshots on its world tick. The client renders
//! at its own rate and interpolates entity positions between the last two.

use std::collections::VecDeque;

use realm_shared::{
    math::Vec3,
    snapshot::{EntityState, Snapshot, SnapshotRecord},
};

/// Buffered snapshot history for interpolation.
#[derive(Debug, Default)]
pub struct SnapshotBuffer {
    history: VecDeque<Snapshot>,
    max: usize,
}

impl SnapshotBuffer {
    pub fn new(max: usize) -> Self {
        Self {
            history: VecDeque::new(),
            max,
        }
    }

    pub fn push(&mut self, snap: Snapshot) {
        self.history.push_back(snap);
        while self.history.len() > self.max {
            self.history.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Interpolated position of an entity between the two newest snapshots.
    ///
    /// `alpha` should be in $[0,1]$ where 0 = older snapshot, 1 = newer.
    pub fn interp_entity(&self, id: &str, alpha: f32) -> Option<Vec3> {
        if self.history.len() < 2 {
            return None;
        }
        let a = &self.history[self.history.len() - 2];
        let b = &self.history[self.history.len() - 1];
        let pa = find_entity(a, id)?.position;
        let pb = find_entity(b, id)?.position;
        Some(pa.lerp(pb, alpha.clamp(0.0, 1.0)))
    }

    pub fn last_snapshot(&self) -> Option<&Snapshot> {
        self.history.back()
    }
}

/// Convenience: find entity state in a snapshot.
pub fn find_entity<'a>(snap: &'a Snapshot, id: &str) -> Option<&'a EntityState> {
    match snap.get(id) {
        Some(SnapshotRecord::Entity(e)) => Some(e),
        _ => None,
    }
}
