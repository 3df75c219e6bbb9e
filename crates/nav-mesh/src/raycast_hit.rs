//! Raycast result types

use super::{PolyRef, Status};

/// Result of casting a 2D ray along the walkable surface
#[derive(Debug, Clone)]
pub struct RaycastHit {
    /// Hit parameter along `[start, end]`. `f32::MAX` when the ray
    /// reached the end position without hitting a wall.
    pub t: f32,
    /// Normal of the wall that was hit, on the xz-plane. Undefined when
    /// no wall was hit.
    pub hit_normal: [f32; 3],
    /// Index of the polygon edge that was hit, -1 for none
    pub hit_edge_index: i32,
    /// Polygons visited along the ray, in order
    pub path: Vec<PolyRef>,
    /// Accumulated filter cost; only filled when the raycast was asked
    /// to track costs
    pub path_cost: f32,
    /// Outcome, including truncation details
    pub status: Status,
}

impl RaycastHit {
    pub(crate) fn new() -> Self {
        Self {
            t: 0.0,
            hit_normal: [0.0; 3],
            hit_edge_index: -1,
            path: Vec::new(),
            path_cost: 0.0,
            status: Status::SUCCESS,
        }
    }

    /// True when the ray hit a wall before reaching the end position
    #[inline]
    pub fn hit_wall(&self) -> bool {
        self.t < f32::MAX
    }
}

impl Default for RaycastHit {
    fn default() -> Self {
        Self::new()
    }
}
