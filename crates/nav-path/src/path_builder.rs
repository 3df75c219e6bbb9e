//! Path construction over a navigation mesh query
//!
//! Turns one start/end request into a polygon corridor and a point path.
//! The corridor comes from A*; the point path either string-pulls it in
//! one go or walks it iteratively with the surface-constrained smoother.

use glam::Vec3;
use tracing::debug;

use nav_common::{vdist, vdist_2d_sqr, vdist_sqr, vdot, vmad, vsub};
use nav_mesh::{NavMeshQuery, PolyRef, StandardFilter, StraightPathFlags, StraightPathOptions};

use super::{
    MAX_PATH_LENGTH, NAV_GROUND, NAV_GROUND_STEEP, NAV_MAGMA_SLIME, NAV_WATER,
    SMOOTH_PATH_SLOP, SMOOTH_PATH_STEP_SIZE,
};

/// Snap box used when matching endpoints to polygons; taller than wide
/// so vertical misses are forgiven more than horizontal ones
const ENDPOINT_EXTENTS: [f32; 3] = [3.0, 5.0, 3.0];

/// Endpoints further than this from their polygon make the path
/// incomplete
const FAR_FROM_POLY: f32 = 7.0;

/// Most polygons one surface-move step may visit
const MAX_VISIT_POLY: usize = 16;

/// Steer-path probe depth
const MAX_STEER_POINTS: usize = 3;

/// Classification of a built path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathType {
    /// Nothing built yet
    Blank,
    /// Corridor reaches the requested destination
    Normal,
    /// Straight line ignoring the mesh; used when no path exists or the
    /// mesh is absent
    Shortcut,
    /// Corridor ends short of the destination; following it gets closer
    Incomplete,
    /// No usable path and no endpoints on the mesh
    NoPath,
}

/// Builds paths between two world positions on one map
///
/// Borrows a query for the duration of one request; the query's pools
/// carry no state between requests.
pub struct PathFinder<'a> {
    query: &'a mut NavMeshQuery,

    poly_path: Vec<PolyRef>,
    path_points: Vec<Vec3>,
    path_type: PathType,

    use_straight_path: bool,
    force_destination: bool,
    point_path_limit: usize,

    start_position: Vec3,
    end_position: Vec3,
    actual_end_position: Vec3,

    filter: StandardFilter,
}

/// World position (z up) to mesh position (y up)
#[inline]
fn to_mesh(v: Vec3) -> [f32; 3] {
    [v.y, v.z, v.x]
}

/// Mesh position (y up) to world position (z up)
#[inline]
fn from_mesh(p: &[f32; 3]) -> Vec3 {
    Vec3::new(p[2], p[0], p[1])
}

impl<'a> PathFinder<'a> {
    pub fn new(query: &'a mut NavMeshQuery) -> Self {
        Self {
            query,
            poly_path: Vec::new(),
            path_points: Vec::new(),
            path_type: PathType::Blank,
            use_straight_path: false,
            force_destination: false,
            point_path_limit: super::MAX_POINT_PATH_LENGTH,
            start_position: Vec3::ZERO,
            end_position: Vec3::ZERO,
            actual_end_position: Vec3::ZERO,
            filter: StandardFilter::new(NAV_GROUND | NAV_GROUND_STEEP, 0),
        }
    }

    /// Chooses between string-pulled and smoothed point paths
    pub fn set_use_straight_path(&mut self, use_straight_path: bool) {
        self.use_straight_path = use_straight_path;
    }

    /// Caps the point path; distances longer than
    /// `limit * SMOOTH_PATH_STEP_SIZE` get truncated
    pub fn set_path_length_limit(&mut self, distance: f32) {
        self.point_path_limit = ((distance / SMOOTH_PATH_STEP_SIZE) as usize)
            .min(super::MAX_POINT_PATH_LENGTH)
            .max(2);
    }

    pub fn start_position(&self) -> Vec3 {
        self.start_position
    }

    pub fn end_position(&self) -> Vec3 {
        self.end_position
    }

    /// Closest point to the requested destination the path actually
    /// reaches
    pub fn actual_end_position(&self) -> Vec3 {
        self.actual_end_position
    }

    pub fn path(&self) -> &[Vec3] {
        &self.path_points
    }

    pub fn take_path(&mut self) -> Vec<Vec3> {
        std::mem::take(&mut self.path_points)
    }

    pub fn path_type(&self) -> PathType {
        self.path_type
    }

    /// Builds a path from `origin` to `dest`
    ///
    /// Always produces some path; when the mesh cannot serve the request
    /// the result is a straight-line shortcut and the type records why.
    pub fn calculate(&mut self, origin: Vec3, dest: Vec3, force_dest: bool, swimming: bool) {
        self.start_position = origin;
        self.end_position = dest;
        self.actual_end_position = dest;
        self.force_destination = force_dest;

        self.update_filter(swimming);

        // Without tiles under both endpoints the mesh cannot help.
        if !self.have_tile(origin) || !self.have_tile(dest) {
            self.build_shortcut();
            self.path_type = PathType::Normal;
            return;
        }

        self.build_poly_path(origin, dest);
        debug!(
            path_type = ?self.path_type,
            corridor = self.poly_path.len(),
            points = self.path_points.len(),
            "path built"
        );
    }

    fn update_filter(&mut self, swimming: bool) {
        let mut include = NAV_GROUND | NAV_GROUND_STEEP;
        if swimming {
            include |= NAV_WATER | NAV_MAGMA_SLIME;
        }
        self.filter = StandardFilter::new(include, 0);
    }

    fn have_tile(&self, p: Vec3) -> bool {
        let point = to_mesh(p);
        let (tx, ty) = self.query.nav_mesh().calc_tile_loc(&point);
        !self.query.nav_mesh().get_tiles_at(tx, ty, 1).is_empty()
    }

    /// Finds the corridor polygon closest to a position, preferring the
    /// current corridor before querying the mesh
    fn get_path_poly_by_position(
        &self,
        path: &[PolyRef],
        point: &[f32; 3],
    ) -> (PolyRef, f32) {
        let mut nearest = PolyRef::NULL;
        let mut min_dist_2d = f32::MAX;
        let mut min_dist_3d = 0.0f32;

        for &poly_ref in path {
            let Ok((closest, _)) = self.query.closest_point_on_poly(poly_ref, point) else {
                continue;
            };
            let d = vdist_2d_sqr(point, &closest);
            if d < min_dist_2d {
                min_dist_2d = d;
                nearest = poly_ref;
                min_dist_3d = vdist_sqr(point, &closest);
            }
        }

        // Anything further than 3 units sideways does not count as "on
        // the corridor".
        if min_dist_2d < 9.0 {
            (nearest, min_dist_3d.sqrt())
        } else {
            (PolyRef::NULL, 0.0)
        }
    }

    fn get_poly_by_location(&self, point: &[f32; 3]) -> (PolyRef, f32) {
        let (poly_ref, dist) = self.get_path_poly_by_position(&self.poly_path, point);
        if !poly_ref.is_null() {
            return (poly_ref, dist);
        }

        match self
            .query
            .find_nearest_poly(point, &ENDPOINT_EXTENTS, &self.filter)
        {
            Ok((nearest, closest)) if !nearest.is_null() => {
                (nearest, vdist(&closest, point))
            }
            _ => (PolyRef::NULL, 0.0),
        }
    }

    fn build_poly_path(&mut self, start: Vec3, end: Vec3) {
        let start_point = to_mesh(start);
        let end_point = to_mesh(end);

        let (start_poly, dist_to_start) = self.get_poly_by_location(&start_point);
        let (end_poly, dist_to_end) = self.get_poly_by_location(&end_point);

        if start_poly.is_null() || end_poly.is_null() {
            debug!("endpoint snapping failed, building shortcut");
            self.build_shortcut();
            self.path_type = PathType::NoPath;
            return;
        }

        // An endpoint that only loosely matched its polygon makes the
        // whole path an approximation.
        let far_from_poly = dist_to_start > FAR_FROM_POLY || dist_to_end > FAR_FROM_POLY;
        if far_from_poly {
            if dist_to_end > FAR_FROM_POLY {
                if let Ok((closest, _)) = self.query.closest_point_on_poly(end_poly, &end_point) {
                    self.actual_end_position = from_mesh(&closest);
                }
            }
            self.path_type = PathType::Incomplete;
        }

        // Trivial case, same polygon.
        if start_poly == end_poly {
            self.poly_path = vec![start_poly];
            if !far_from_poly {
                self.path_type = PathType::Normal;
            }
            self.build_point_path(&start_point, &end_point);
            return;
        }

        match self.query.find_path(
            start_poly,
            end_poly,
            &start_point,
            &end_point,
            &self.filter,
            MAX_PATH_LENGTH,
        ) {
            Ok(result) if !result.path.is_empty() => {
                self.poly_path = result.path;
            }
            _ => {
                self.build_shortcut();
                self.path_type = PathType::NoPath;
                return;
            }
        }

        if *self.poly_path.last().unwrap() == end_poly {
            if self.path_type != PathType::Incomplete {
                self.path_type = PathType::Normal;
            }
        } else {
            self.path_type = PathType::Incomplete;
            // Aim for the closest reachable spot instead.
            if let Some(&last) = self.poly_path.last() {
                if let Ok((closest, _)) = self.query.closest_point_on_poly(last, &end_point) {
                    self.actual_end_position = from_mesh(&closest);
                }
            }
        }

        self.build_point_path(&start_point, &end_point);
    }

    fn build_point_path(&mut self, start_point: &[f32; 3], end_point: &[f32; 3]) {
        let points = if self.use_straight_path {
            self.build_straight_path(start_point, end_point)
        } else {
            self.find_smooth_path(start_point, end_point)
        };

        let points = match points {
            Some(p) if p.len() >= 2 => p,
            _ => {
                self.build_shortcut();
                self.path_type = PathType::NoPath;
                return;
            }
        };

        self.path_points = points.iter().map(from_mesh).collect();

        // Endpoints snap exactly to the request.
        let n = self.path_points.len();
        self.path_points[0] = self.start_position;
        self.path_points[n - 1] = self.actual_end_position;

        // Callers that insist on the literal destination get it, by
        // shortcut if necessary.
        if self.force_destination
            && (self.path_type != PathType::Normal
                || !in_range(
                    self.end_position,
                    self.actual_end_position,
                    1.0,
                    1.0,
                ))
        {
            if in_range(
                self.end_position,
                *self.path_points.last().unwrap(),
                1.0,
                1.0,
            ) {
                let n = self.path_points.len();
                self.path_points[n - 1] = self.end_position;
            } else {
                self.actual_end_position = self.end_position;
                self.build_shortcut();
            }
            self.path_type = PathType::Normal;
        }
    }

    fn build_straight_path(
        &mut self,
        start_point: &[f32; 3],
        end_point: &[f32; 3],
    ) -> Option<Vec<[f32; 3]>> {
        let result = self
            .query
            .find_straight_path(
                start_point,
                end_point,
                &self.poly_path,
                self.point_path_limit,
                StraightPathOptions::default(),
            )
            .ok()?;
        Some(result.verts.iter().map(|v| v.pos).collect())
    }

    fn build_shortcut(&mut self) {
        self.poly_path.clear();
        self.path_points = vec![self.start_position, self.actual_end_position];
        self.path_type = PathType::Shortcut;
    }

    /// Finds the next point to steer toward: the first string-pulled
    /// vertex further than `min_target_dist` away, or an off-mesh
    /// connection, or the end
    fn get_steer_target(
        &mut self,
        start_pos: &[f32; 3],
        end_pos: &[f32; 3],
        min_target_dist: f32,
        path: &[PolyRef],
    ) -> Option<([f32; 3], StraightPathFlags, PolyRef)> {
        let steer = self
            .query
            .find_straight_path(
                start_pos,
                end_pos,
                path,
                MAX_STEER_POINTS,
                StraightPathOptions::default(),
            )
            .ok()?;
        if steer.verts.is_empty() {
            return None;
        }

        let mut ns = 0;
        while ns < steer.verts.len() {
            let v = &steer.verts[ns];
            // Stop at an off-mesh connection or the first point that is
            // actually worth moving toward.
            if v.flags.contains(StraightPathFlags::OFFMESH_CONNECTION)
                || !in_range_mesh(&v.pos, start_pos, min_target_dist, 1000.0)
            {
                break;
            }
            ns += 1;
        }
        if ns >= steer.verts.len() {
            return None;
        }

        let v = &steer.verts[ns];
        let mut steer_pos = v.pos;
        steer_pos[1] = start_pos[1];
        Some((steer_pos, v.flags, v.poly))
    }

    /// Splices the freshly visited polygons into the corridor, keeping
    /// the tail past the furthest polygon both have in common
    fn fixup_corridor(path: &mut Vec<PolyRef>, visited: &[PolyRef]) {
        let mut furthest_path = None;
        let mut furthest_visited = None;

        'outer: for i in (0..path.len()).rev() {
            for j in 0..visited.len() {
                if path[i] == visited[j] {
                    furthest_path = Some(i);
                    furthest_visited = Some(j);
                    break 'outer;
                }
            }
        }

        let (Some(fp), Some(fv)) = (furthest_path, furthest_visited) else {
            return;
        };

        // The visited set, reversed, becomes the new corridor head.
        let mut fixed: Vec<PolyRef> = visited[fv..].iter().rev().copied().collect();
        fixed.extend_from_slice(&path[(fp + 1).min(path.len())..]);
        fixed.truncate(MAX_PATH_LENGTH);
        *path = fixed;
    }

    /// Walks the corridor in surface-constrained steps, emitting a point
    /// per step
    fn find_smooth_path(
        &mut self,
        start_pos: &[f32; 3],
        end_pos: &[f32; 3],
    ) -> Option<Vec<[f32; 3]>> {
        let mut polys = self.poly_path.clone();

        let mut iter_pos = self
            .query
            .closest_point_on_poly_boundary(*polys.first()?, start_pos)
            .ok()?;
        let target_pos = self
            .query
            .closest_point_on_poly_boundary(*polys.last()?, end_pos)
            .ok()?;

        let mut smooth = Vec::with_capacity(self.point_path_limit);
        smooth.push(iter_pos);

        while !polys.is_empty() && smooth.len() < self.point_path_limit {
            let Some((steer_pos, steer_flags, steer_ref)) =
                self.get_steer_target(&iter_pos, &target_pos, SMOOTH_PATH_SLOP, &polys)
            else {
                break;
            };

            let end_of_path = steer_flags.contains(StraightPathFlags::END);
            let off_mesh_connection =
                steer_flags.contains(StraightPathFlags::OFFMESH_CONNECTION);

            // Step toward the steer point, but never past it when it is
            // the end or an off-mesh link.
            let mut delta = [0.0f32; 3];
            vsub(&mut delta, &steer_pos, &iter_pos);
            let mut len = vdot(&delta, &delta).sqrt();
            if (end_of_path || off_mesh_connection) && len < SMOOTH_PATH_STEP_SIZE {
                len = 1.0;
            } else {
                len = SMOOTH_PATH_STEP_SIZE / len;
            }
            let mut move_tgt = [0.0f32; 3];
            vmad(&mut move_tgt, &iter_pos, &delta, len);

            let moved = self
                .query
                .move_along_surface(polys[0], &iter_pos, &move_tgt, &self.filter, MAX_VISIT_POLY)
                .ok()?;

            Self::fixup_corridor(&mut polys, &moved.visited);

            iter_pos = moved.result_pos;
            if let Ok(h) = self.query.get_poly_height(polys[0], &iter_pos) {
                iter_pos[1] = h;
            }

            if end_of_path && in_range_mesh(&iter_pos, &steer_pos, SMOOTH_PATH_SLOP, 2.0) {
                // Reached the end of the path.
                iter_pos = target_pos;
                if smooth.len() < self.point_path_limit {
                    smooth.push(iter_pos);
                }
                break;
            } else if off_mesh_connection
                && in_range_mesh(&iter_pos, &steer_pos, SMOOTH_PATH_SLOP, 2.0)
            {
                // Advance the corridor up to and over the connection.
                let mut prev_ref = PolyRef::NULL;
                let mut poly_ref = polys[0];
                let mut npos = 0;
                while npos < polys.len() && poly_ref != steer_ref {
                    prev_ref = poly_ref;
                    poly_ref = polys[npos];
                    npos += 1;
                }
                polys.drain(..npos);

                if let Ok((con_start, con_end)) = self
                    .query
                    .nav_mesh()
                    .get_off_mesh_connection_poly_end_points(prev_ref, poly_ref)
                {
                    if smooth.len() < self.point_path_limit {
                        smooth.push(con_start);
                    }
                    // Teleport to the far side of the connection.
                    iter_pos = con_end;
                    if let Some(&first) = polys.first() {
                        if let Ok(h) = self.query.get_poly_height(first, &iter_pos) {
                            iter_pos[1] = h;
                        }
                    }
                }
            }

            if smooth.len() < self.point_path_limit {
                smooth.push(iter_pos);
            }
        }

        Some(smooth)
    }
}

/// Cylinder proximity test in world space (z up)
fn in_range(a: Vec3, b: Vec3, r: f32, h: f32) -> bool {
    let dx = b.x - a.x;
    let dy = b.y - a.y;
    let dz = b.z - a.z;
    (dx * dx + dy * dy) < r * r && dz.abs() < h
}

/// Cylinder proximity test in mesh space (y up)
fn in_range_mesh(v1: &[f32; 3], v2: &[f32; 3], r: f32, h: f32) -> bool {
    let dx = v2[0] - v1[0];
    let dy = v2[1] - v1[1];
    let dz = v2[2] - v1[2];
    (dx * dx + dz * dz) < r * r && dy.abs() < h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mesh_swizzle_round_trip() {
        let world = Vec3::new(1.0, 2.0, 3.0);
        let mesh = to_mesh(world);
        // World z is mesh up.
        assert_eq!(mesh, [2.0, 3.0, 1.0]);
        assert_eq!(from_mesh(&mesh), world);
    }

    #[test]
    fn test_in_range_uses_vertical_cutoff() {
        let a = Vec3::new(0.0, 0.0, 0.0);
        assert!(in_range(a, Vec3::new(0.5, 0.0, 0.0), 1.0, 1.0));
        assert!(!in_range(a, Vec3::new(0.5, 0.0, 5.0), 1.0, 1.0));
        assert!(!in_range(a, Vec3::new(2.0, 0.0, 0.0), 1.0, 1.0));
    }

    #[test]
    fn test_fixup_corridor_splices_visited() {
        let p = |i: u64| PolyRef::new(i);
        let mut path = vec![p(1), p(2), p(3), p(4), p(5)];
        // Moved through 1 -> 2 and strayed onto 9.
        let visited = vec![p(1), p(2), p(9)];
        PathFinder::fixup_corridor(&mut path, &visited);
        assert_eq!(path, vec![p(9), p(2), p(3), p(4), p(5)]);

        // Disjoint visited set leaves the corridor untouched.
        let mut path2 = vec![p(1), p(2)];
        PathFinder::fixup_corridor(&mut path2, &[p(7), p(8)]);
        assert_eq!(path2, vec![p(1), p(2)]);
    }
}
