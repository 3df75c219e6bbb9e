//! Polygon filtering and traversal cost policy

use super::nav_mesh::{MeshTile, Poly};
use super::{PolyRef, MAX_AREAS};
use nav_common::vdist;

/// Policy deciding which polygons a query may enter and what traversing
/// them costs
///
/// Implementations must keep costs at or above the Euclidean distance
/// between the two positions, or A* loses admissibility and paths stop
/// being optimal.
pub trait QueryFilter {
    /// Returns true if the polygon may be entered
    fn pass_filter(&self, poly_ref: PolyRef, tile: &MeshTile, poly: &Poly) -> bool;

    /// Cost of moving from `pa` to `pb` across the polygon `cur`,
    /// having arrived from `prev` and continuing into `next`
    fn get_cost(
        &self,
        pa: &[f32; 3],
        pb: &[f32; 3],
        prev: Option<&Poly>,
        cur: &Poly,
        next: Option<&Poly>,
    ) -> f32;
}

/// Flag-mask filter with a per-area cost table
#[derive(Debug, Clone)]
pub struct StandardFilter {
    /// Any of these flags must be set for a polygon to pass
    pub include_flags: u16,
    /// None of these flags may be set for a polygon to pass
    pub exclude_flags: u16,
    /// Cost multiplier per area code
    pub area_cost: [f32; MAX_AREAS],
}

impl Default for StandardFilter {
    fn default() -> Self {
        Self {
            include_flags: 0xffff,
            exclude_flags: 0,
            area_cost: [1.0; MAX_AREAS],
        }
    }
}

impl StandardFilter {
    pub fn new(include_flags: u16, exclude_flags: u16) -> Self {
        Self {
            include_flags,
            exclude_flags,
            ..Default::default()
        }
    }

    pub fn set_area_cost(&mut self, area: usize, cost: f32) {
        if area < MAX_AREAS {
            self.area_cost[area] = cost;
        }
    }

    pub fn area_cost(&self, area: usize) -> f32 {
        if area < MAX_AREAS {
            self.area_cost[area]
        } else {
            1.0
        }
    }
}

impl QueryFilter for StandardFilter {
    fn pass_filter(&self, _poly_ref: PolyRef, _tile: &MeshTile, poly: &Poly) -> bool {
        (poly.flags & self.include_flags) != 0 && (poly.flags & self.exclude_flags) == 0
    }

    fn get_cost(
        &self,
        pa: &[f32; 3],
        pb: &[f32; 3],
        _prev: Option<&Poly>,
        cur: &Poly,
        _next: Option<&Poly>,
    ) -> f32 {
        vdist(pa, pb) * self.area_cost[(cur.area as usize) & (MAX_AREAS - 1)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PolyType;

    fn poly_with(flags: u16, area: u8) -> Poly {
        let mut p = Poly::new(area, PolyType::Ground, flags);
        p.vert_count = 3;
        p
    }

    #[test]
    fn test_pass_filter_masks() {
        let tile = MeshTile::new();
        let filter = StandardFilter::new(0x0001, 0x0008);

        assert!(filter.pass_filter(PolyRef::new(1), &tile, &poly_with(0x0001, 0)));
        assert!(!filter.pass_filter(PolyRef::new(1), &tile, &poly_with(0x0002, 0)));
        // Excluded flag wins even when an included flag is present.
        assert!(!filter.pass_filter(PolyRef::new(1), &tile, &poly_with(0x0009, 0)));
    }

    #[test]
    fn test_default_cost_is_weighted_distance() {
        let mut filter = StandardFilter::default();
        filter.set_area_cost(3, 2.5);

        let pa = [0.0, 0.0, 0.0];
        let pb = [4.0, 0.0, 3.0];
        let cur = poly_with(1, 3);
        let cost = filter.get_cost(&pa, &pb, None, &cur, None);
        assert!((cost - 12.5).abs() < 1e-5);

        let plain = poly_with(1, 0);
        let cost = filter.get_cost(&pa, &pb, None, &plain, None);
        assert!((cost - 5.0).abs() < 1e-5);
    }
}
