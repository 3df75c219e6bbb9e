//! Graph searches over a navigation mesh
//!
//! A [`NavMeshQuery`] owns the node pools and open list used by every
//! search, so one query serves one caller at a time. The mesh itself is
//! shared read-only.

use std::sync::Arc;

use nav_common::{
    distance_pt_poly_edges_sqr, dist_pt_seg_sqr_2d, intersect_seg_seg_2d,
    intersect_segment_poly_2d, overlap_quant_bounds, point_in_polygon,
    random_point_in_convex_poly, sqr, tri_area_2d, vdist, vdist_sqr, vequal, vlerp, vmad,
    vnormalize, vsub,
};

use super::nav_mesh::{MeshTile, NavMesh, Poly};
use super::node_pool::{NodeFlags, NodeIndex, NodePool, NodeQueue};
use super::query_filter::QueryFilter;
use super::raycast_hit::RaycastHit;
use super::{
    FindPathOptions, PolyRef, PolyType, RaycastOptions, Status, StatusResult, StraightPathFlags,
    StraightPathOptions, EXT_LINK, H_SCALE, NULL_LINK, RAY_CAST_LIMIT_PROPORTIONS,
    VERTS_PER_POLYGON,
};

/// Hard cap on candidate polygons considered by `find_nearest_poly`;
/// queries with very large extents are unreliable past this
const MAX_NEAREST_CANDIDATES: usize = 128;

/// Maximum breadth of the `move_along_surface` flood
const MAX_SURFACE_STACK: usize = 48;

/// Size of the tiny node pool used by short local searches
const TINY_NODE_POOL_SIZE: usize = 64;

/// Polygon corridor produced by a path search
#[derive(Debug, Clone)]
pub struct FindPathResult {
    /// Corridor from start to end (or to the closest reachable polygon)
    pub path: Vec<PolyRef>,
    /// `SUCCESS` plus detail bits such as `PARTIAL_RESULT`
    pub status: Status,
}

/// One vertex of a straightened path
#[derive(Debug, Clone, Copy)]
pub struct StraightPathVertex {
    pub pos: [f32; 3],
    pub flags: StraightPathFlags,
    /// Polygon being entered at this vertex; null at the end point
    pub poly: PolyRef,
}

/// Result of string-pulling a corridor
#[derive(Debug, Clone)]
pub struct StraightPathResult {
    pub verts: Vec<StraightPathVertex>,
    pub status: Status,
}

/// Result of a constrained surface move
#[derive(Debug, Clone)]
pub struct MoveAlongSurfaceResult {
    /// Final position, constrained by walls
    pub result_pos: [f32; 3],
    /// Polygons visited by the flood, start first
    pub visited: Vec<PolyRef>,
    pub status: Status,
}

/// Result of a Dijkstra expansion around a circle or shape
#[derive(Debug, Clone)]
pub struct PolysAroundResult {
    /// Polygons in non-decreasing cost order
    pub refs: Vec<PolyRef>,
    /// Parent of each polygon in the search tree, null for the start
    pub parents: Vec<PolyRef>,
    /// Cost from the center to each polygon
    pub costs: Vec<f32>,
    pub status: Status,
}

/// Result of a wall distance search
#[derive(Debug, Clone, Copy)]
pub struct DistanceToWallResult {
    /// Distance to the nearest wall edge
    pub distance: f32,
    /// Closest point on that wall
    pub hit_pos: [f32; 3],
    /// Direction from the wall back toward the center
    pub hit_normal: [f32; 3],
    pub status: Status,
}

/// Progress report of `update_sliced_find_path`
#[derive(Debug, Clone, Copy)]
pub struct SlicedPathUpdate {
    /// Iterations actually spent
    pub done_iters: i32,
    pub status: Status,
}

/// State of an in-flight sliced path query
struct SlicedQueryState {
    status: Status,
    start_ref: PolyRef,
    end_ref: PolyRef,
    start_pos: [f32; 3],
    end_pos: [f32; 3],
    filter: Option<Arc<dyn QueryFilter>>,
    options: FindPathOptions,
    raycast_limit_sqr: f32,
    last_best_node: NodeIndex,
    last_best_node_cost: f32,
}

impl Default for SlicedQueryState {
    fn default() -> Self {
        Self {
            // The sentinel: no sliced query active.
            status: Status::FAILURE,
            start_ref: PolyRef::NULL,
            end_ref: PolyRef::NULL,
            start_pos: [0.0; 3],
            end_pos: [0.0; 3],
            filter: None,
            options: FindPathOptions::default(),
            raycast_limit_sqr: f32::MAX,
            last_best_node: 0,
            last_best_node_cost: 0.0,
        }
    }
}

/// Query object running searches over a shared [`NavMesh`]
///
/// Not safe to share between threads; give each concurrent caller its
/// own query.
pub struct NavMeshQuery {
    nav: Arc<NavMesh>,
    node_pool: NodePool,
    /// Small separate pool for local searches, so they do not disturb an
    /// in-flight sliced query
    tiny_node_pool: NodePool,
    open_list: NodeQueue,
    query: SlicedQueryState,
}

impl NavMeshQuery {
    /// Creates a query with search capacity for `max_nodes` nodes
    pub fn new(nav: Arc<NavMesh>, max_nodes: usize) -> StatusResult<Self> {
        if max_nodes == 0 || max_nodes > NodeIndex::MAX as usize {
            return Err(Status::FAILURE | Status::INVALID_PARAM);
        }
        let hash_size = nav_common::next_pow2((max_nodes as u32 / 4).max(1)) as usize;
        Ok(Self {
            nav,
            node_pool: NodePool::new(max_nodes, hash_size),
            tiny_node_pool: NodePool::new(TINY_NODE_POOL_SIZE, 32),
            open_list: NodeQueue::new(max_nodes),
            query: SlicedQueryState::default(),
        })
    }

    /// The mesh this query runs over
    pub fn nav_mesh(&self) -> &NavMesh {
        &self.nav
    }

    /// Mutating searches refuse to run while a sliced query is active;
    /// they would corrupt its node pool.
    fn guard_sliced(&self) -> StatusResult<()> {
        if self.query.status.is_in_progress() {
            return Err(Status::FAILURE);
        }
        Ok(())
    }

    // Spatial queries

    /// Finds the polygon nearest to `center` within the search box
    ///
    /// Returns a null ref (with `SUCCESS`) when no polygon intersects the
    /// box. Unsuitable for very large extents; only the first
    /// 128 candidates are considered.
    pub fn find_nearest_poly(
        &self,
        center: &[f32; 3],
        half_extents: &[f32; 3],
        filter: &dyn QueryFilter,
    ) -> StatusResult<(PolyRef, [f32; 3])> {
        let polys = self.query_polygons(center, half_extents, filter, MAX_NEAREST_CANDIDATES)?;

        let mut nearest = PolyRef::NULL;
        let mut nearest_pt = *center;
        let mut nearest_dist_sqr = f32::MAX;

        for &poly_ref in &polys {
            let (closest, pos_over_poly) = self.closest_point_on_poly(poly_ref, center)?;
            let mut diff = [0.0f32; 3];
            vsub(&mut diff, center, &closest);

            // A point directly over a polygon within climb reach is a
            // better match than one merely closer in space.
            let d = if pos_over_poly {
                let (tile, _) = self.nav.get_tile_and_poly_by_ref_unchecked(poly_ref);
                let climb = tile.header.map(|h| h.walkable_climb).unwrap_or(0.0);
                let dy = diff[1].abs() - climb;
                if dy > 0.0 {
                    dy * dy
                } else {
                    0.0
                }
            } else {
                nav_common::vlen_sqr(&diff)
            };

            if d < nearest_dist_sqr {
                nearest_pt = closest;
                nearest_dist_sqr = d;
                nearest = poly_ref;
            }
        }

        Ok((nearest, nearest_pt))
    }

    /// Collects polygons intersecting the search box, up to `max_polys`
    pub fn query_polygons(
        &self,
        center: &[f32; 3],
        half_extents: &[f32; 3],
        filter: &dyn QueryFilter,
        max_polys: usize,
    ) -> StatusResult<Vec<PolyRef>> {
        if !nav_common::visfinite(center) || !nav_common::visfinite(half_extents) {
            return Err(Status::FAILURE | Status::INVALID_PARAM);
        }

        let bmin = [
            center[0] - half_extents[0],
            center[1] - half_extents[1],
            center[2] - half_extents[2],
        ];
        let bmax = [
            center[0] + half_extents[0],
            center[1] + half_extents[1],
            center[2] + half_extents[2],
        ];

        // Find tiles the query touches.
        let (min_x, min_y) = self.nav.calc_tile_loc(&bmin);
        let (max_x, max_y) = self.nav.calc_tile_loc(&bmax);

        let mut polys = Vec::new();
        for y in min_y..=max_y {
            for x in min_x..=max_x {
                for tile in self.nav.get_tiles_at(x, y, 32) {
                    if polys.len() >= max_polys {
                        return Ok(polys);
                    }
                    self.query_polygons_in_tile(tile, &bmin, &bmax, filter, &mut polys, max_polys);
                }
            }
        }

        Ok(polys)
    }

    /// Collects polygons of one tile intersecting the box
    ///
    /// Walks the tile's BV-tree when it has one, otherwise scans
    /// linearly. Off-mesh connection polygons never match.
    pub fn query_polygons_in_tile(
        &self,
        tile: &MeshTile,
        qmin: &[f32; 3],
        qmax: &[f32; 3],
        filter: &dyn QueryFilter,
        out: &mut Vec<PolyRef>,
        max_polys: usize,
    ) {
        let Some(header) = tile.header else {
            return;
        };
        let base = self.nav.get_poly_ref_base(tile);

        if !tile.bv_tree.is_empty() {
            let tbmin = header.bmin;
            let tbmax = header.bmax;
            let qfac = header.bv_quant_factor;

            // Clamp the query box into the tile and quantize it the same
            // way the tree was built.
            let minx = qmin[0].clamp(tbmin[0], tbmax[0]) - tbmin[0];
            let miny = qmin[1].clamp(tbmin[1], tbmax[1]) - tbmin[1];
            let minz = qmin[2].clamp(tbmin[2], tbmax[2]) - tbmin[2];
            let maxx = qmax[0].clamp(tbmin[0], tbmax[0]) - tbmin[0];
            let maxy = qmax[1].clamp(tbmin[1], tbmax[1]) - tbmin[1];
            let maxz = qmax[2].clamp(tbmin[2], tbmax[2]) - tbmin[2];

            let bmin = [
                (qfac * minx) as u16 & 0xfffe,
                (qfac * miny) as u16 & 0xfffe,
                (qfac * minz) as u16 & 0xfffe,
            ];
            let bmax = [
                (qfac * maxx + 1.0) as u16 | 1,
                (qfac * maxy + 1.0) as u16 | 1,
                (qfac * maxz + 1.0) as u16 | 1,
            ];

            let node_count = header.bv_node_count as usize;
            let mut i = 0usize;
            while i < node_count {
                let node = &tile.bv_tree[i];
                let overlap = overlap_quant_bounds(&bmin, &bmax, &node.bmin, &node.bmax);
                let is_leaf = node.i >= 0;

                if is_leaf && overlap {
                    let poly_ref = PolyRef(base.0 | node.i as u64);
                    if filter.pass_filter(poly_ref, tile, &tile.polys[node.i as usize])
                        && out.len() < max_polys
                    {
                        out.push(poly_ref);
                    }
                }

                if overlap || is_leaf {
                    i += 1;
                } else {
                    // Negative index is the escape offset past the
                    // node's subtree.
                    i += (-node.i) as usize;
                }
            }
        } else {
            for (i, poly) in tile.polys.iter().enumerate() {
                if poly.poly_type == PolyType::OffMeshConnection {
                    continue;
                }
                let poly_ref = PolyRef(base.0 | i as u64);
                if !filter.pass_filter(poly_ref, tile, poly) {
                    continue;
                }
                // Polygon bounds.
                let v = tile.vert(poly.verts[0] as usize);
                let mut pbmin = [v[0], v[1], v[2]];
                let mut pbmax = pbmin;
                for j in 1..poly.vert_count as usize {
                    let v = tile.vert(poly.verts[j] as usize);
                    nav_common::vmin(&mut pbmin, v);
                    nav_common::vmax(&mut pbmax, v);
                }
                if nav_common::overlap_bounds(qmin, qmax, &pbmin, &pbmax) && out.len() < max_polys {
                    out.push(poly_ref);
                }
            }
        }
    }

    /// Closest point on a polygon, with detail-mesh height
    ///
    /// The boolean is true when `pos` projects onto the polygon in xz.
    pub fn closest_point_on_poly(
        &self,
        poly_ref: PolyRef,
        pos: &[f32; 3],
    ) -> StatusResult<([f32; 3], bool)> {
        let (tile, _) = self.nav.get_tile_and_poly_by_ref(poly_ref)?;
        let (_, _, ip) = self.nav.decode_poly_id(poly_ref);
        Ok(self
            .nav
            .closest_point_on_poly_in_tile(tile, ip as usize, pos))
    }

    /// Closest point on the polygon's boundary, ignoring height detail
    ///
    /// Much cheaper than [`NavMeshQuery::closest_point_on_poly`]; when
    /// `pos` is inside the polygon in xz the result equals `pos`.
    pub fn closest_point_on_poly_boundary(
        &self,
        poly_ref: PolyRef,
        pos: &[f32; 3],
    ) -> StatusResult<[f32; 3]> {
        let (tile, poly) = self.nav.get_tile_and_poly_by_ref(poly_ref)?;

        let nv = poly.vert_count as usize;
        let mut verts = [0.0f32; VERTS_PER_POLYGON * 3];
        let mut edged = [0.0f32; VERTS_PER_POLYGON];
        let mut edget = [0.0f32; VERTS_PER_POLYGON];
        for i in 0..nv {
            let v = tile.vert(poly.verts[i] as usize);
            verts[i * 3] = v[0];
            verts[i * 3 + 1] = v[1];
            verts[i * 3 + 2] = v[2];
        }

        if distance_pt_poly_edges_sqr(pos, &verts, nv, &mut edged, &mut edget) {
            return Ok(*pos);
        }

        let mut dmin = f32::MAX;
        let mut imin = 0;
        for (i, &d) in edged.iter().take(nv).enumerate() {
            if d < dmin {
                dmin = d;
                imin = i;
            }
        }
        let va = &verts[imin * 3..imin * 3 + 3];
        let vb = &verts[((imin + 1) % nv) * 3..((imin + 1) % nv) * 3 + 3];
        let mut closest = [0.0f32; 3];
        vlerp(&mut closest, va, vb, edget[imin]);
        Ok(closest)
    }

    /// Height of the mesh surface under a position on a polygon
    ///
    /// Fails with `INVALID_PARAM` when the position does not project onto
    /// any detail triangle of the polygon.
    pub fn get_poly_height(&self, poly_ref: PolyRef, pos: &[f32; 3]) -> StatusResult<f32> {
        let (tile, _) = self.nav.get_tile_and_poly_by_ref(poly_ref)?;
        let (_, _, ip) = self.nav.decode_poly_id(poly_ref);
        self.nav
            .get_poly_height_in_tile(tile, ip as usize, pos)
            .ok_or(Status::FAILURE | Status::INVALID_PARAM)
    }

    // Portals

    /// Left and right vertices of the portal from one polygon into a
    /// linked neighbor
    ///
    /// For off-mesh connections both points collapse to the connection
    /// endpoint, producing a degenerate portal the funnel passes through
    /// exactly.
    pub fn get_portal_points(
        &self,
        from: PolyRef,
        to: PolyRef,
    ) -> StatusResult<([f32; 3], [f32; 3], PolyType, PolyType)> {
        let (from_tile, from_poly) = self.nav.get_tile_and_poly_by_ref(from)?;
        let (to_tile, to_poly) = self.nav.get_tile_and_poly_by_ref(to)?;
        let (left, right) =
            self.portal_points(from, from_poly, from_tile, to, to_poly, to_tile)?;
        Ok((left, right, from_poly.poly_type, to_poly.poly_type))
    }

    fn portal_points(
        &self,
        from: PolyRef,
        from_poly: &Poly,
        from_tile: &MeshTile,
        to: PolyRef,
        to_poly: &Poly,
        to_tile: &MeshTile,
    ) -> StatusResult<([f32; 3], [f32; 3])> {
        // Find the link leading to the neighbor.
        let mut link = None;
        let mut i = from_poly.first_link;
        while i != NULL_LINK {
            if from_tile.links[i as usize].target == to {
                link = Some(from_tile.links[i as usize]);
                break;
            }
            i = from_tile.links[i as usize].next;
        }
        let link = link.ok_or(Status::FAILURE | Status::INVALID_PARAM)?;

        // Off-mesh connections are entered and left through a single
        // point.
        if from_poly.poly_type == PolyType::OffMeshConnection {
            let v = from_tile.vert(from_poly.verts[link.edge as usize] as usize);
            let p = [v[0], v[1], v[2]];
            return Ok((p, p));
        }
        if to_poly.poly_type == PolyType::OffMeshConnection {
            let mut i = to_poly.first_link;
            while i != NULL_LINK {
                let l = &to_tile.links[i as usize];
                if l.target == from {
                    let v = to_tile.vert(to_poly.verts[l.edge as usize] as usize);
                    let p = [v[0], v[1], v[2]];
                    return Ok((p, p));
                }
                i = l.next;
            }
            return Err(Status::FAILURE | Status::INVALID_PARAM);
        }

        // Portal is the shared edge.
        let v0 = from_tile.vert(from_poly.verts[link.edge as usize] as usize);
        let v1 = from_tile.vert(
            from_poly.verts[(link.edge as usize + 1) % from_poly.vert_count as usize] as usize,
        );
        let mut left = [v0[0], v0[1], v0[2]];
        let mut right = [v1[0], v1[1], v1[2]];

        // Boundary links may only span part of the edge.
        if link.side != 0xff && (link.bmin != 0 || link.bmax != 255) {
            let s = 1.0 / 255.0;
            let tmin = link.bmin as f32 * s;
            let tmax = link.bmax as f32 * s;
            let mut l = [0.0f32; 3];
            let mut r = [0.0f32; 3];
            vlerp(&mut l, v0, v1, tmin);
            vlerp(&mut r, v0, v1, tmax);
            left = l;
            right = r;
        }

        Ok((left, right))
    }

    /// Midpoint of the portal between two linked polygons
    pub fn get_edge_mid_point(&self, from: PolyRef, to: PolyRef) -> StatusResult<[f32; 3]> {
        let (left, right, _, _) = self.get_portal_points(from, to)?;
        Ok([
            (left[0] + right[0]) * 0.5,
            (left[1] + right[1]) * 0.5,
            (left[2] + right[2]) * 0.5,
        ])
    }

    fn edge_mid_point(
        &self,
        from: PolyRef,
        from_poly: &Poly,
        from_tile: &MeshTile,
        to: PolyRef,
        to_poly: &Poly,
        to_tile: &MeshTile,
    ) -> StatusResult<[f32; 3]> {
        let (left, right) = self.portal_points(from, from_poly, from_tile, to, to_poly, to_tile)?;
        Ok([
            (left[0] + right[0]) * 0.5,
            (left[1] + right[1]) * 0.5,
            (left[2] + right[2]) * 0.5,
        ])
    }

    // Pathfinding

    /// Finds a polygon corridor between two positions with weighted A*
    ///
    /// Node positions are portal midpoints. When the open list drains
    /// without reaching the end, the corridor to the best-heuristic node
    /// is returned with `PARTIAL_RESULT` set. A corridor longer than
    /// `max_path` is truncated from the end and flagged
    /// `BUFFER_TOO_SMALL`.
    pub fn find_path(
        &mut self,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: &[f32; 3],
        end_pos: &[f32; 3],
        filter: &dyn QueryFilter,
        max_path: usize,
    ) -> StatusResult<FindPathResult> {
        self.guard_sliced()?;
        let nav = Arc::clone(&self.nav);

        if max_path == 0 {
            return Err(Status::FAILURE | Status::INVALID_PARAM);
        }
        if !nav.is_valid_poly_ref(start_ref) || !nav.is_valid_poly_ref(end_ref) {
            return Err(Status::FAILURE | Status::INVALID_PARAM);
        }
        if !nav_common::visfinite(start_pos) || !nav_common::visfinite(end_pos) {
            return Err(Status::FAILURE | Status::INVALID_PARAM);
        }

        if start_ref == end_ref {
            return Ok(FindPathResult {
                path: vec![start_ref],
                status: Status::SUCCESS,
            });
        }

        self.node_pool.clear();
        self.open_list.clear();

        let start_idx = self.node_pool.get_node(start_ref, 0).unwrap();
        {
            let node = self.node_pool.node_mut(start_idx).unwrap();
            node.pos = *start_pos;
            node.pidx = 0;
            node.cost = 0.0;
            node.total = vdist(start_pos, end_pos) * H_SCALE;
            node.id = start_ref;
            node.flags = NodeFlags::OPEN;
        }
        self.open_list.push(start_idx, &self.node_pool);

        let mut last_best = start_idx;
        let mut last_best_cost = self.node_pool.node(start_idx).unwrap().total;
        let mut status = Status::SUCCESS;

        while let Some(best_idx) = self.open_list.pop(&self.node_pool) {
            {
                let node = self.node_pool.node_mut(best_idx).unwrap();
                node.flags.remove(NodeFlags::OPEN);
                node.flags.insert(NodeFlags::CLOSED);
            }

            let (best_ref, best_pos, best_cost, best_pidx) = {
                let node = self.node_pool.node(best_idx).unwrap();
                (node.id, node.pos, node.cost, node.pidx)
            };

            if best_ref == end_ref {
                last_best = best_idx;
                break;
            }

            // Input was validated; internal refs are trusted from here.
            let (best_tile, best_poly) = nav.get_tile_and_poly_by_ref_unchecked(best_ref);

            let parent_ref = self
                .node_pool
                .node(best_pidx)
                .map(|n| n.id)
                .unwrap_or(PolyRef::NULL);
            let parent_poly = if parent_ref.is_null() {
                None
            } else {
                Some(nav.get_tile_and_poly_by_ref_unchecked(parent_ref).1)
            };

            let mut i = best_poly.first_link;
            while i != NULL_LINK {
                let link = best_tile.links[i as usize];
                i = link.next;
                let neighbour_ref = link.target;

                // Do not expand back to where we came from.
                if neighbour_ref.is_null() || neighbour_ref == parent_ref {
                    continue;
                }

                let (neighbour_tile, neighbour_poly) =
                    nav.get_tile_and_poly_by_ref_unchecked(neighbour_ref);
                if !filter.pass_filter(neighbour_ref, neighbour_tile, neighbour_poly) {
                    continue;
                }

                // Arrivals through different boundary sides get distinct
                // nodes.
                let cross_side = if link.side != 0xff { link.side >> 1 } else { 0 };

                let Some(neighbour_idx) = self.node_pool.get_node(neighbour_ref, cross_side)
                else {
                    status |= Status::OUT_OF_NODES;
                    continue;
                };

                // First visit: place the node at the portal midpoint.
                if self.node_pool.node(neighbour_idx).unwrap().flags.is_empty() {
                    if let Ok(mid) = self.edge_mid_point(
                        best_ref,
                        best_poly,
                        best_tile,
                        neighbour_ref,
                        neighbour_poly,
                        neighbour_tile,
                    ) {
                        self.node_pool.node_mut(neighbour_idx).unwrap().pos = mid;
                    }
                }

                let neighbour_pos = self.node_pool.node(neighbour_idx).unwrap().pos;

                let (cost, heuristic) = if neighbour_ref == end_ref {
                    let cur_cost = filter.get_cost(
                        &best_pos,
                        &neighbour_pos,
                        parent_poly,
                        best_poly,
                        Some(neighbour_poly),
                    );
                    let end_cost = filter.get_cost(
                        &neighbour_pos,
                        end_pos,
                        Some(best_poly),
                        neighbour_poly,
                        None,
                    );
                    (best_cost + cur_cost + end_cost, 0.0)
                } else {
                    let cur_cost = filter.get_cost(
                        &best_pos,
                        &neighbour_pos,
                        parent_poly,
                        best_poly,
                        Some(neighbour_poly),
                    );
                    (
                        best_cost + cur_cost,
                        vdist(&neighbour_pos, end_pos) * H_SCALE,
                    )
                };
                let total = cost + heuristic;

                let (nflags, ntotal) = {
                    let n = self.node_pool.node(neighbour_idx).unwrap();
                    (n.flags, n.total)
                };
                // Skip when a previous visit was at least as good.
                if nflags.contains(NodeFlags::OPEN) && total >= ntotal {
                    continue;
                }
                if nflags.contains(NodeFlags::CLOSED) && total >= ntotal {
                    continue;
                }

                {
                    let node = self.node_pool.node_mut(neighbour_idx).unwrap();
                    node.pidx = best_idx;
                    node.id = neighbour_ref;
                    node.flags.remove(NodeFlags::CLOSED);
                    node.cost = cost;
                    node.total = total;
                }

                if nflags.contains(NodeFlags::OPEN) {
                    self.open_list.modify(neighbour_idx, &self.node_pool);
                } else {
                    self.node_pool
                        .node_mut(neighbour_idx)
                        .unwrap()
                        .flags
                        .insert(NodeFlags::OPEN);
                    self.open_list.push(neighbour_idx, &self.node_pool);
                }

                if heuristic < last_best_cost {
                    last_best_cost = heuristic;
                    last_best = neighbour_idx;
                }
            }
        }

        if self.node_pool.node(last_best).unwrap().id != end_ref {
            status |= Status::PARTIAL_RESULT;
        }

        let mut path = Vec::new();
        let mut idx = last_best;
        while idx != 0 {
            let node = self.node_pool.node(idx).unwrap();
            path.push(node.id);
            idx = node.pidx;
        }
        path.reverse();

        if path.len() > max_path {
            path.truncate(max_path);
            status |= Status::BUFFER_TOO_SMALL;
        }

        Ok(FindPathResult { path, status })
    }

    // Sliced pathfinding

    /// Starts a cooperative path search
    ///
    /// The search owns the node pool until one of the finalize calls
    /// resets it; other pool-mutating queries fail while it is in
    /// progress. With [`FindPathOptions::ANY_ANGLE`] the expansion tries
    /// raycast shortcuts to the grandparent within a radius scaled from
    /// the tile's agent radius.
    pub fn init_sliced_find_path(
        &mut self,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: &[f32; 3],
        end_pos: &[f32; 3],
        filter: Arc<dyn QueryFilter>,
        options: FindPathOptions,
    ) -> Status {
        self.query = SlicedQueryState {
            status: Status::FAILURE,
            start_ref,
            end_ref,
            start_pos: *start_pos,
            end_pos: *end_pos,
            filter: Some(filter),
            options,
            raycast_limit_sqr: f32::MAX,
            last_best_node: 0,
            last_best_node_cost: 0.0,
        };

        if !self.nav.is_valid_poly_ref(start_ref) || !self.nav.is_valid_poly_ref(end_ref) {
            return Status::FAILURE | Status::INVALID_PARAM;
        }

        // Bound shortcut attempts to several times the agent radius;
        // the first tile's value is representative enough.
        if options.contains(FindPathOptions::ANY_ANGLE) {
            let (tile, _) = self.nav.get_tile_and_poly_by_ref_unchecked(start_ref);
            let agent_radius = tile.header.map(|h| h.walkable_radius).unwrap_or(0.0);
            self.query.raycast_limit_sqr = sqr(agent_radius * RAY_CAST_LIMIT_PROPORTIONS);
        }

        if start_ref == end_ref {
            self.query.status = Status::SUCCESS;
            return Status::SUCCESS;
        }

        self.node_pool.clear();
        self.open_list.clear();

        let start_idx = self.node_pool.get_node(start_ref, 0).unwrap();
        {
            let node = self.node_pool.node_mut(start_idx).unwrap();
            node.pos = *start_pos;
            node.pidx = 0;
            node.cost = 0.0;
            node.total = vdist(start_pos, end_pos) * H_SCALE;
            node.id = start_ref;
            node.flags = NodeFlags::OPEN;
        }
        self.open_list.push(start_idx, &self.node_pool);

        self.query.status = Status::IN_PROGRESS;
        self.query.last_best_node = start_idx;
        self.query.last_best_node_cost = self.node_pool.node(start_idx).unwrap().total;

        self.query.status
    }

    /// Runs up to `max_iter` expansions of the sliced search
    pub fn update_sliced_find_path(&mut self, max_iter: i32) -> SlicedPathUpdate {
        if !self.query.status.is_in_progress() {
            return SlicedPathUpdate {
                done_iters: 0,
                status: self.query.status,
            };
        }

        // The request may have been invalidated by tile changes.
        if !self.nav.is_valid_poly_ref(self.query.start_ref)
            || !self.nav.is_valid_poly_ref(self.query.end_ref)
        {
            self.query.status = Status::FAILURE;
            return SlicedPathUpdate {
                done_iters: 0,
                status: Status::FAILURE,
            };
        }

        let nav = Arc::clone(&self.nav);
        let filter = self.query.filter.clone().expect("sliced query has a filter");
        let end_ref = self.query.end_ref;
        let end_pos = self.query.end_pos;
        let try_any_angle = self.query.options.contains(FindPathOptions::ANY_ANGLE);

        let mut iter = 0;
        while iter < max_iter && !self.open_list.is_empty() {
            iter += 1;

            let best_idx = self.open_list.pop(&self.node_pool).unwrap();
            {
                let node = self.node_pool.node_mut(best_idx).unwrap();
                node.flags.remove(NodeFlags::OPEN);
                node.flags.insert(NodeFlags::CLOSED);
            }

            let (best_ref, best_pos, best_cost, best_pidx) = {
                let node = self.node_pool.node(best_idx).unwrap();
                (node.id, node.pos, node.cost, node.pidx)
            };

            if best_ref == end_ref {
                self.query.last_best_node = best_idx;
                let details = Status(self.query.status.0 & Status::DETAIL_MASK);
                self.query.status = Status::SUCCESS | details;
                return SlicedPathUpdate {
                    done_iters: iter,
                    status: self.query.status,
                };
            }

            // Tiles may be removed mid-search; a vanished polygon fails
            // the whole query.
            let Ok((best_tile, best_poly)) = nav.get_tile_and_poly_by_ref(best_ref) else {
                self.query.status = Status::FAILURE;
                return SlicedPathUpdate {
                    done_iters: iter,
                    status: Status::FAILURE,
                };
            };

            let parent_ref;
            let grandpa_ref;
            let parent_pos;
            let parent_cost;
            let parent_pidx;
            if best_pidx != 0 {
                let p = self.node_pool.node(best_pidx).unwrap();
                parent_ref = p.id;
                parent_pos = p.pos;
                parent_cost = p.cost;
                parent_pidx = best_pidx;
                grandpa_ref = self
                    .node_pool
                    .node(p.pidx)
                    .map(|n| n.id)
                    .unwrap_or(PolyRef::NULL);
            } else {
                parent_ref = PolyRef::NULL;
                parent_pos = [0.0; 3];
                parent_cost = 0.0;
                parent_pidx = 0;
                grandpa_ref = PolyRef::NULL;
            }

            let mut parent_poly = None;
            if !parent_ref.is_null() {
                let invalid_parent = match nav.get_tile_and_poly_by_ref(parent_ref) {
                    Ok((_, p)) => {
                        parent_poly = Some(p);
                        false
                    }
                    Err(_) => true,
                };
                if invalid_parent
                    || (!grandpa_ref.is_null() && !nav.is_valid_poly_ref(grandpa_ref))
                {
                    self.query.status = Status::FAILURE;
                    return SlicedPathUpdate {
                        done_iters: iter,
                        status: Status::FAILURE,
                    };
                }
            }

            // Consider raycast shortcuts only near the parent.
            let try_los = try_any_angle
                && !parent_ref.is_null()
                && vdist_sqr(&parent_pos, &best_pos) < self.query.raycast_limit_sqr;

            let mut i = best_poly.first_link;
            while i != NULL_LINK {
                let link = best_tile.links[i as usize];
                i = link.next;
                let neighbour_ref = link.target;

                if neighbour_ref.is_null() || neighbour_ref == parent_ref {
                    continue;
                }

                let (neighbour_tile, neighbour_poly) =
                    nav.get_tile_and_poly_by_ref_unchecked(neighbour_ref);
                if !filter.pass_filter(neighbour_ref, neighbour_tile, neighbour_poly) {
                    continue;
                }

                let Some(neighbour_idx) = self.node_pool.get_node(neighbour_ref, 0) else {
                    self.query.status |= Status::OUT_OF_NODES;
                    continue;
                };

                // Do not expand to nodes already visited from this
                // parent.
                {
                    let n = self.node_pool.node(neighbour_idx).unwrap();
                    if n.pidx != 0 && n.pidx == best_pidx {
                        continue;
                    }
                }

                if self.node_pool.node(neighbour_idx).unwrap().flags.is_empty() {
                    if let Ok(mid) = self.edge_mid_point(
                        best_ref,
                        best_poly,
                        best_tile,
                        neighbour_ref,
                        neighbour_poly,
                        neighbour_tile,
                    ) {
                        self.node_pool.node_mut(neighbour_idx).unwrap().pos = mid;
                    }
                }

                let neighbour_pos = self.node_pool.node(neighbour_idx).unwrap().pos;

                // Shortcut past the current polygon when the parent has
                // line of sight to the neighbor.
                let mut found_shortcut = false;
                let mut ray_cost = 0.0;
                if try_los {
                    if let Ok(hit) = self.raycast(
                        parent_ref,
                        &parent_pos,
                        &neighbour_pos,
                        filter.as_ref(),
                        RaycastOptions::USE_COSTS,
                        grandpa_ref,
                        0,
                    ) {
                        found_shortcut = hit.t >= 1.0;
                        ray_cost = hit.path_cost;
                    }
                }

                let mut cost = if found_shortcut {
                    parent_cost + ray_cost
                } else {
                    let cur_cost = filter.get_cost(
                        &best_pos,
                        &neighbour_pos,
                        parent_poly,
                        best_poly,
                        Some(neighbour_poly),
                    );
                    best_cost + cur_cost
                };

                let heuristic = if neighbour_ref == end_ref {
                    let end_cost = filter.get_cost(
                        &neighbour_pos,
                        &end_pos,
                        Some(best_poly),
                        neighbour_poly,
                        None,
                    );
                    cost += end_cost;
                    0.0
                } else {
                    vdist(&neighbour_pos, &end_pos) * H_SCALE
                };
                let total = cost + heuristic;

                let (nflags, ntotal) = {
                    let n = self.node_pool.node(neighbour_idx).unwrap();
                    (n.flags, n.total)
                };
                if nflags.contains(NodeFlags::OPEN) && total >= ntotal {
                    continue;
                }
                if nflags.contains(NodeFlags::CLOSED) && total >= ntotal {
                    continue;
                }

                {
                    let node = self.node_pool.node_mut(neighbour_idx).unwrap();
                    node.pidx = if found_shortcut { parent_pidx } else { best_idx };
                    node.id = neighbour_ref;
                    node.flags.remove(NodeFlags::CLOSED);
                    node.flags.remove(NodeFlags::PARENT_DETACHED);
                    node.cost = cost;
                    node.total = total;
                    if found_shortcut {
                        node.flags.insert(NodeFlags::PARENT_DETACHED);
                    }
                }

                if nflags.contains(NodeFlags::OPEN) {
                    self.open_list.modify(neighbour_idx, &self.node_pool);
                } else {
                    self.node_pool
                        .node_mut(neighbour_idx)
                        .unwrap()
                        .flags
                        .insert(NodeFlags::OPEN);
                    self.open_list.push(neighbour_idx, &self.node_pool);
                }

                if heuristic < self.query.last_best_node_cost {
                    self.query.last_best_node_cost = heuristic;
                    self.query.last_best_node = neighbour_idx;
                }
            }
        }

        // Open list drained: the search is done, possibly short of the
        // goal.
        if self.open_list.is_empty() {
            let details = Status(self.query.status.0 & Status::DETAIL_MASK);
            self.query.status = Status::SUCCESS | details;
        }

        SlicedPathUpdate {
            done_iters: iter,
            status: self.query.status,
        }
    }

    /// Finishes the sliced search and reconstructs the corridor
    pub fn finalize_sliced_find_path(&mut self, max_path: usize) -> StatusResult<FindPathResult> {
        if max_path == 0 {
            self.query = SlicedQueryState::default();
            return Err(Status::FAILURE | Status::INVALID_PARAM);
        }
        if self.query.status.is_failure() {
            // Reset query.
            self.query = SlicedQueryState::default();
            return Err(Status::FAILURE);
        }

        let mut status = self.query.status.detail();
        let mut path = Vec::new();

        if self.query.start_ref == self.query.end_ref {
            path.push(self.query.start_ref);
        } else {
            if self
                .node_pool
                .node(self.query.last_best_node)
                .map(|n| n.id)
                != Some(self.query.end_ref)
            {
                status |= Status::PARTIAL_RESULT;
            }
            let (reconstructed, rstatus) =
                self.reconstruct_sliced_path(self.query.last_best_node, max_path);
            path = reconstructed;
            status |= rstatus.detail();
        }

        // Reset query.
        self.query = SlicedQueryState::default();

        Ok(FindPathResult {
            path,
            status: Status::SUCCESS | status,
        })
    }

    /// Finishes the sliced search toward the furthest already-known
    /// corridor polygon the search visited
    ///
    /// Used to patch an existing corridor when the search was cut short.
    pub fn finalize_sliced_find_path_partial(
        &mut self,
        existing: &[PolyRef],
        max_path: usize,
    ) -> StatusResult<FindPathResult> {
        if existing.is_empty() || max_path == 0 {
            self.query = SlicedQueryState::default();
            return Err(Status::FAILURE | Status::INVALID_PARAM);
        }
        if self.query.status.is_failure() {
            self.query = SlicedQueryState::default();
            return Err(Status::FAILURE);
        }

        let mut status = self.query.status.detail();
        let mut path = Vec::new();

        if self.query.start_ref == self.query.end_ref {
            path.push(self.query.start_ref);
        } else {
            // Find the furthest existing polygon the search visited.
            let mut node = 0;
            for &r in existing.iter().rev() {
                if let Some(found) = self.node_pool.find_nodes(r, 1).first() {
                    node = *found;
                    break;
                }
            }
            if node == 0 {
                status |= Status::PARTIAL_RESULT;
                node = self.query.last_best_node;
            }

            let (reconstructed, rstatus) = self.reconstruct_sliced_path(node, max_path);
            path = reconstructed;
            status |= rstatus.detail();
        }

        self.query = SlicedQueryState::default();

        Ok(FindPathResult {
            path,
            status: Status::SUCCESS | status,
        })
    }

    /// Walks parent links from `end_idx` back to the start and emits the
    /// corridor start-first, ray-tracing across detached parents
    fn reconstruct_sliced_path(
        &mut self,
        end_idx: NodeIndex,
        max_path: usize,
    ) -> (Vec<PolyRef>, Status) {
        let filter = self.query.filter.clone().expect("sliced query has a filter");
        let mut status = Status::SUCCESS;

        let mut chain = Vec::new();
        let mut idx = end_idx;
        while idx != 0 {
            chain.push(idx);
            idx = self.node_pool.node(idx).unwrap().pidx;
        }
        chain.reverse();

        let mut path: Vec<PolyRef> = Vec::new();
        for w in 0..chain.len() {
            if path.len() >= max_path {
                status |= Status::BUFFER_TOO_SMALL;
                break;
            }

            let (id, pos) = {
                let n = self.node_pool.node(chain[w]).unwrap();
                (n.id, n.pos)
            };

            // A detached successor means the polygons between this node
            // and the next were skipped by a raycast shortcut; recover
            // them by tracing the same ray.
            let detached_next = chain.get(w + 1).map_or(false, |&ni| {
                self.node_pool
                    .node(ni)
                    .unwrap()
                    .flags
                    .contains(NodeFlags::PARENT_DETACHED)
            });

            if detached_next {
                let (next_id, next_pos) = {
                    let n = self.node_pool.node(chain[w + 1]).unwrap();
                    (n.id, n.pos)
                };
                match self.raycast(
                    id,
                    &pos,
                    &next_pos,
                    filter.as_ref(),
                    RaycastOptions::default(),
                    PolyRef::NULL,
                    max_path - path.len(),
                ) {
                    Ok(hit) => {
                        path.extend(hit.path);
                        // The ray ends on the next polygon's boundary and
                        // may already include it.
                        if path.last() == Some(&next_id) {
                            path.pop();
                        }
                        if hit.status.detail().0 != 0 {
                            status |= hit.status.detail();
                            break;
                        }
                    }
                    Err(e) => {
                        status |= e.detail();
                        break;
                    }
                }
            } else {
                path.push(id);
                if path.len() >= max_path && w + 1 < chain.len() {
                    status |= Status::BUFFER_TOO_SMALL;
                    break;
                }
            }
        }

        (path, status)
    }

    // Raycast

    /// Walks the mesh along the 2D segment `[start_pos, end_pos]`
    ///
    /// `t == f32::MAX` means the end was reached. `prev_ref` biases cost
    /// attribution at the first polygon for any-angle shortcuts.
    /// `max_path` bounds the recorded corridor; 0 records none.
    #[allow(clippy::too_many_arguments)]
    pub fn raycast(
        &self,
        start_ref: PolyRef,
        start_pos: &[f32; 3],
        end_pos: &[f32; 3],
        filter: &dyn QueryFilter,
        options: RaycastOptions,
        prev_ref: PolyRef,
        max_path: usize,
    ) -> StatusResult<RaycastHit> {
        if !self.nav.is_valid_poly_ref(start_ref) {
            return Err(Status::FAILURE | Status::INVALID_PARAM);
        }
        if !prev_ref.is_null() && !self.nav.is_valid_poly_ref(prev_ref) {
            return Err(Status::FAILURE | Status::INVALID_PARAM);
        }

        let mut hit = RaycastHit::new();
        let mut status = Status::SUCCESS;

        let mut dir = [0.0f32; 3];
        let mut cur_pos = *start_pos;
        vsub(&mut dir, end_pos, start_pos);

        let mut verts = [0.0f32; VERTS_PER_POLYGON * 3];

        let use_costs = options.contains(RaycastOptions::USE_COSTS);

        let mut cur_ref = start_ref;
        let mut prev_ref = prev_ref;

        while !cur_ref.is_null() {
            let (tile, poly) = self.nav.get_tile_and_poly_by_ref_unchecked(cur_ref);

            // Collect current polygon vertices.
            let nv = poly.vert_count as usize;
            for i in 0..nv {
                let v = tile.vert(poly.verts[i] as usize);
                verts[i * 3] = v[0];
                verts[i * 3 + 1] = v[1];
                verts[i * 3 + 2] = v[2];
            }

            let Some((_, tmax, _, seg_max)) =
                intersect_segment_poly_2d(start_pos, end_pos, &verts, nv)
            else {
                // Could not hit the polygon, keep the old t and report
                // the hit.
                hit.status = status;
                return Ok(hit);
            };

            if tmax > hit.t {
                hit.t = tmax;
            }

            if hit.path.len() < max_path {
                hit.path.push(cur_ref);
            } else {
                status |= Status::BUFFER_TOO_SMALL;
            }

            // The segment ends inside the current polygon.
            if seg_max == -1 {
                hit.t = f32::MAX;
                if use_costs {
                    let prev_poly = if prev_ref.is_null() {
                        None
                    } else {
                        Some(self.nav.get_tile_and_poly_by_ref_unchecked(prev_ref).1)
                    };
                    hit.path_cost +=
                        filter.get_cost(&cur_pos, end_pos, prev_poly, poly, Some(poly));
                }
                hit.status = status;
                return Ok(hit);
            }

            // Find the link crossing the exit edge.
            let mut next_ref = PolyRef::NULL;
            let mut next_poly_opt = None;
            let mut i = poly.first_link;
            while i != NULL_LINK {
                let link = tile.links[i as usize];
                i = link.next;

                if link.edge as i32 != seg_max {
                    continue;
                }

                let (next_tile, next_poly) =
                    self.nav.get_tile_and_poly_by_ref_unchecked(link.target);

                // Rays never enter off-mesh connections.
                if next_poly.poly_type == PolyType::OffMeshConnection {
                    continue;
                }
                if !filter.pass_filter(link.target, next_tile, next_poly) {
                    continue;
                }

                // Internal edges accept the whole edge span.
                if link.side == 0xff {
                    next_ref = link.target;
                    next_poly_opt = Some(next_poly);
                    break;
                }
                if link.bmin == 0 && link.bmax == 255 {
                    next_ref = link.target;
                    next_poly_opt = Some(next_poly);
                    break;
                }

                // Partially connected boundary edge: the crossing point
                // must lie within the connected span.
                let v0 = poly.verts[link.edge as usize] as usize;
                let v1 = poly.verts[(link.edge as usize + 1) % nv] as usize;
                let left = tile.vert(v0);
                let right = tile.vert(v1);

                let s = 1.0 / 255.0;
                if link.side == 0 || link.side == 4 {
                    let mut lmin = left[2] + (right[2] - left[2]) * (link.bmin as f32 * s);
                    let mut lmax = left[2] + (right[2] - left[2]) * (link.bmax as f32 * s);
                    if lmin > lmax {
                        std::mem::swap(&mut lmin, &mut lmax);
                    }
                    let z = start_pos[2] + (end_pos[2] - start_pos[2]) * tmax;
                    if z >= lmin && z <= lmax {
                        next_ref = link.target;
                        next_poly_opt = Some(next_poly);
                        break;
                    }
                } else if link.side == 2 || link.side == 6 {
                    let mut lmin = left[0] + (right[0] - left[0]) * (link.bmin as f32 * s);
                    let mut lmax = left[0] + (right[0] - left[0]) * (link.bmax as f32 * s);
                    if lmin > lmax {
                        std::mem::swap(&mut lmin, &mut lmax);
                    }
                    let x = start_pos[0] + (end_pos[0] - start_pos[0]) * tmax;
                    if x >= lmin && x <= lmax {
                        next_ref = link.target;
                        next_poly_opt = Some(next_poly);
                        break;
                    }
                }
            }

            if use_costs {
                // Move the cost cursor to the exit point, re-projecting
                // its height onto the exit edge since the walk is 2D.
                let last_pos = cur_pos;
                let mut advanced = [0.0f32; 3];
                vmad(&mut advanced, start_pos, &dir, hit.t);
                cur_pos = advanced;

                let e1s = seg_max as usize;
                let e2s = (seg_max as usize + 1) % nv;
                let e1 = [verts[e1s * 3], verts[e1s * 3 + 1], verts[e1s * 3 + 2]];
                let e2 = [verts[e2s * 3], verts[e2s * 3 + 1], verts[e2s * 3 + 2]];
                let mut e_dir = [0.0f32; 3];
                let mut diff = [0.0f32; 3];
                vsub(&mut e_dir, &e2, &e1);
                vsub(&mut diff, &cur_pos, &e1);
                let s = if sqr(e_dir[0]) > sqr(e_dir[2]) {
                    diff[0] / e_dir[0]
                } else {
                    diff[2] / e_dir[2]
                };
                cur_pos[1] = e1[1] + e_dir[1] * s;

                let prev_poly = if prev_ref.is_null() {
                    None
                } else {
                    Some(self.nav.get_tile_and_poly_by_ref_unchecked(prev_ref).1)
                };
                hit.path_cost +=
                    filter.get_cost(&last_pos, &cur_pos, prev_poly, poly, next_poly_opt);
            }

            if next_ref.is_null() {
                // No accepting neighbor: the ray hit a wall. The normal
                // is the edge's xz-perpendicular pointing back at the
                // ray.
                let a = seg_max as usize;
                let b = (seg_max as usize + 1) % nv;
                let va = [verts[a * 3], verts[a * 3 + 1], verts[a * 3 + 2]];
                let vb = [verts[b * 3], verts[b * 3 + 1], verts[b * 3 + 2]];
                let dx = vb[0] - va[0];
                let dz = vb[2] - va[2];
                hit.hit_normal = [dz, 0.0, -dx];
                vnormalize(&mut hit.hit_normal);
                hit.hit_edge_index = seg_max;
                hit.status = status;
                return Ok(hit);
            }

            // Advance to the neighbor polygon.
            prev_ref = cur_ref;
            cur_ref = next_ref;
        }

        hit.status = status;
        Ok(hit)
    }

    // Straight path

    fn append_vertex(
        verts: &mut Vec<StraightPathVertex>,
        pos: &[f32; 3],
        flags: StraightPathFlags,
        poly: PolyRef,
        max_straight_path: usize,
    ) -> Status {
        if let Some(last) = verts.last_mut() {
            if vequal(&last.pos, pos) {
                // The vertices are equal; update flags and poly.
                last.flags = flags;
                last.poly = poly;
                return Status::IN_PROGRESS;
            }
        }

        verts.push(StraightPathVertex {
            pos: *pos,
            flags,
            poly,
        });

        if flags == StraightPathFlags::END || verts.len() >= max_straight_path {
            let mut stat = Status::SUCCESS;
            if verts.len() >= max_straight_path {
                stat |= Status::BUFFER_TOO_SMALL;
            }
            return stat;
        }
        Status::IN_PROGRESS
    }

    #[allow(clippy::too_many_arguments)]
    fn append_portals(
        &self,
        start_idx: usize,
        end_idx: usize,
        end_pos: &[f32; 3],
        path: &[PolyRef],
        verts: &mut Vec<StraightPathVertex>,
        max_straight_path: usize,
        options: StraightPathOptions,
    ) -> StatusResult<Status> {
        let start_pos = verts.last().map(|v| v.pos).unwrap_or(*end_pos);

        for i in start_idx..end_idx {
            let from = path[i];
            let (from_tile, from_poly) = self
                .nav
                .get_tile_and_poly_by_ref(from)
                .map_err(|_| Status::FAILURE | Status::INVALID_PARAM)?;

            let to = path[i + 1];
            let (to_tile, to_poly) = self
                .nav
                .get_tile_and_poly_by_ref(to)
                .map_err(|_| Status::FAILURE | Status::INVALID_PARAM)?;

            let Ok((left, right)) =
                self.portal_points(from, from_poly, from_tile, to, to_poly, to_tile)
            else {
                break;
            };

            if options.contains(StraightPathOptions::AREA_CROSSINGS)
                && !options.contains(StraightPathOptions::ALL_CROSSINGS)
                && from_poly.area == to_poly.area
            {
                // Only area boundaries are of interest.
                continue;
            }

            if let Some((_, t)) = intersect_seg_seg_2d(&start_pos, end_pos, &left, &right) {
                if (0.0..=1.0).contains(&t) {
                    let mut pt = [0.0f32; 3];
                    vlerp(&mut pt, &left, &right, t);
                    let stat = Self::append_vertex(
                        verts,
                        &pt,
                        StraightPathFlags::NONE,
                        path[i + 1],
                        max_straight_path,
                    );
                    if stat != Status::IN_PROGRESS {
                        return Ok(stat);
                    }
                }
            }
        }
        Ok(Status::IN_PROGRESS)
    }

    /// String-pulls a corridor into a taut sequence of waypoints
    ///
    /// Start and end are clamped to the corridor's first and last
    /// polygons. Vertices are flagged with start/end/off-mesh markers
    /// and the polygon entered at each point. A corridor that turns out
    /// invalid mid-way yields the truncated path with `PARTIAL_RESULT`.
    pub fn find_straight_path(
        &self,
        start_pos: &[f32; 3],
        end_pos: &[f32; 3],
        path: &[PolyRef],
        max_straight_path: usize,
        options: StraightPathOptions,
    ) -> StatusResult<StraightPathResult> {
        if max_straight_path == 0 || path.is_empty() || path[0].is_null() {
            return Err(Status::FAILURE | Status::INVALID_PARAM);
        }

        let mut verts: Vec<StraightPathVertex> = Vec::new();

        let closest_start = self.closest_point_on_poly_boundary(path[0], start_pos)?;
        let mut closest_end =
            self.closest_point_on_poly_boundary(path[path.len() - 1], end_pos)?;

        let stat = Self::append_vertex(
            &mut verts,
            &closest_start,
            StraightPathFlags::START,
            path[0],
            max_straight_path,
        );
        if stat != Status::IN_PROGRESS {
            return Ok(StraightPathResult {
                verts,
                status: stat,
            });
        }

        if path.len() > 1 {
            let mut portal_apex = closest_start;
            let mut portal_left = portal_apex;
            let mut portal_right = portal_apex;
            let mut apex_index = 0usize;
            let mut left_index = 0usize;
            let mut right_index = 0usize;

            let mut left_poly_type = PolyType::Ground;
            let mut right_poly_type = PolyType::Ground;

            let mut left_poly_ref = path[0];
            let mut right_poly_ref = path[0];

            // Explicit cursor; funnel restarts rewind it to the apex.
            let mut i = 0usize;
            while i < path.len() {
                let left;
                let right;
                let to_type;

                if i + 1 < path.len() {
                    match self.get_portal_points(path[i], path[i + 1]) {
                        Ok((l, r, _, t)) => {
                            left = l;
                            right = r;
                            to_type = t;
                        }
                        Err(_) => {
                            // path[i+1] is invalid; clamp the end to
                            // path[i] and return what we have.
                            closest_end = self
                                .closest_point_on_poly_boundary(path[i], end_pos)
                                .map_err(|_| Status::FAILURE | Status::INVALID_PARAM)?;

                            if options.any_crossings() {
                                let _ = self.append_portals(
                                    apex_index,
                                    i,
                                    &closest_end,
                                    path,
                                    &mut verts,
                                    max_straight_path,
                                    options,
                                )?;
                            }

                            let _ = Self::append_vertex(
                                &mut verts,
                                &closest_end,
                                StraightPathFlags::NONE,
                                path[i],
                                max_straight_path,
                            );

                            let mut status = Status::SUCCESS | Status::PARTIAL_RESULT;
                            if verts.len() >= max_straight_path {
                                status |= Status::BUFFER_TOO_SMALL;
                            }
                            return Ok(StraightPathResult { verts, status });
                        }
                    }

                    // Starting on the portal itself: skip the first one.
                    if i == 0 {
                        let (d, _) = dist_pt_seg_sqr_2d(&portal_apex, &left, &right);
                        if d < sqr(0.001) {
                            i += 1;
                            continue;
                        }
                    }
                } else {
                    // End of the path acts as a degenerate final portal.
                    left = closest_end;
                    right = closest_end;
                    to_type = PolyType::Ground;
                }

                // Right side of the funnel.
                if tri_area_2d(&portal_apex, &portal_right, &right) <= 0.0 {
                    if vequal(&portal_apex, &portal_right)
                        || tri_area_2d(&portal_apex, &portal_left, &right) > 0.0
                    {
                        portal_right = right;
                        right_poly_ref = if i + 1 < path.len() {
                            path[i + 1]
                        } else {
                            PolyRef::NULL
                        };
                        right_poly_type = to_type;
                        right_index = i;
                    } else {
                        // The right leg crossed the left one: emit the
                        // left vertex and restart from it.
                        if options.any_crossings() {
                            let stat = self.append_portals(
                                apex_index,
                                left_index,
                                &portal_left,
                                path,
                                &mut verts,
                                max_straight_path,
                                options,
                            )?;
                            if stat != Status::IN_PROGRESS {
                                return Ok(StraightPathResult {
                                    verts,
                                    status: stat,
                                });
                            }
                        }

                        portal_apex = portal_left;
                        apex_index = left_index;

                        let flags = if left_poly_ref.is_null() {
                            StraightPathFlags::END
                        } else if left_poly_type == PolyType::OffMeshConnection {
                            StraightPathFlags::OFFMESH_CONNECTION
                        } else {
                            StraightPathFlags::NONE
                        };

                        let stat = Self::append_vertex(
                            &mut verts,
                            &portal_apex,
                            flags,
                            left_poly_ref,
                            max_straight_path,
                        );
                        if stat != Status::IN_PROGRESS {
                            return Ok(StraightPathResult {
                                verts,
                                status: stat,
                            });
                        }

                        portal_left = portal_apex;
                        portal_right = portal_apex;
                        left_index = apex_index;
                        right_index = apex_index;

                        // Restart the scan after the new apex.
                        i = apex_index + 1;
                        continue;
                    }
                }

                // Left side of the funnel.
                if tri_area_2d(&portal_apex, &portal_left, &left) >= 0.0 {
                    if vequal(&portal_apex, &portal_left)
                        || tri_area_2d(&portal_apex, &portal_right, &left) < 0.0
                    {
                        portal_left = left;
                        left_poly_ref = if i + 1 < path.len() {
                            path[i + 1]
                        } else {
                            PolyRef::NULL
                        };
                        left_poly_type = to_type;
                        left_index = i;
                    } else {
                        if options.any_crossings() {
                            let stat = self.append_portals(
                                apex_index,
                                right_index,
                                &portal_right,
                                path,
                                &mut verts,
                                max_straight_path,
                                options,
                            )?;
                            if stat != Status::IN_PROGRESS {
                                return Ok(StraightPathResult {
                                    verts,
                                    status: stat,
                                });
                            }
                        }

                        portal_apex = portal_right;
                        apex_index = right_index;

                        let flags = if right_poly_ref.is_null() {
                            StraightPathFlags::END
                        } else if right_poly_type == PolyType::OffMeshConnection {
                            StraightPathFlags::OFFMESH_CONNECTION
                        } else {
                            StraightPathFlags::NONE
                        };

                        let stat = Self::append_vertex(
                            &mut verts,
                            &portal_apex,
                            flags,
                            right_poly_ref,
                            max_straight_path,
                        );
                        if stat != Status::IN_PROGRESS {
                            return Ok(StraightPathResult {
                                verts,
                                status: stat,
                            });
                        }

                        portal_left = portal_apex;
                        portal_right = portal_apex;
                        left_index = apex_index;
                        right_index = apex_index;

                        i = apex_index + 1;
                        continue;
                    }
                }

                i += 1;
            }

            if options.any_crossings() {
                let stat = self.append_portals(
                    apex_index,
                    path.len() - 1,
                    &closest_end,
                    path,
                    &mut verts,
                    max_straight_path,
                    options,
                )?;
                if stat != Status::IN_PROGRESS {
                    return Ok(StraightPathResult {
                        verts,
                        status: stat,
                    });
                }
            }
        }

        let _ = Self::append_vertex(
            &mut verts,
            &closest_end,
            StraightPathFlags::END,
            PolyRef::NULL,
            max_straight_path,
        );

        let mut status = Status::SUCCESS;
        if verts.len() >= max_straight_path {
            status |= Status::BUFFER_TOO_SMALL;
        }
        Ok(StraightPathResult { verts, status })
    }

    // Surface movement

    /// Slides from `start_pos` toward `end_pos` along the surface,
    /// constrained by walls
    ///
    /// Floods at most 48 polygons within a band around the segment. The
    /// visited list is the sub-corridor actually walked, start first.
    pub fn move_along_surface(
        &mut self,
        start_ref: PolyRef,
        start_pos: &[f32; 3],
        end_pos: &[f32; 3],
        filter: &dyn QueryFilter,
        max_visited: usize,
    ) -> StatusResult<MoveAlongSurfaceResult> {
        if !self.nav.is_valid_poly_ref(start_ref) {
            return Err(Status::FAILURE | Status::INVALID_PARAM);
        }
        let nav = Arc::clone(&self.nav);

        let mut status = Status::SUCCESS;

        self.tiny_node_pool.clear();

        let start_idx = self.tiny_node_pool.get_node(start_ref, 0).unwrap();
        {
            let node = self.tiny_node_pool.node_mut(start_idx).unwrap();
            node.pidx = 0;
            node.cost = 0.0;
            node.total = 0.0;
            node.id = start_ref;
            node.flags = NodeFlags::CLOSED;
        }

        let mut stack: Vec<NodeIndex> = Vec::with_capacity(MAX_SURFACE_STACK);
        stack.push(start_idx);

        let mut best_pos = *start_pos;
        let mut best_dist = f32::MAX;
        let mut best_node = 0 as NodeIndex;

        // Search constraint: a band around the middle of the move.
        let mut search_pos = [0.0f32; 3];
        vlerp(&mut search_pos, start_pos, end_pos, 0.5);
        let search_rad_sqr = sqr(vdist(start_pos, end_pos) / 2.0 + 0.001);

        let mut verts = [0.0f32; VERTS_PER_POLYGON * 3];

        while !stack.is_empty() {
            // Pop front.
            let cur_idx = stack.remove(0);
            let cur_ref = self.tiny_node_pool.node(cur_idx).unwrap().id;
            let (cur_tile, cur_poly) = nav.get_tile_and_poly_by_ref_unchecked(cur_ref);

            let nv = cur_poly.vert_count as usize;
            for i in 0..nv {
                let v = cur_tile.vert(cur_poly.verts[i] as usize);
                verts[i * 3] = v[0];
                verts[i * 3 + 1] = v[1];
                verts[i * 3 + 2] = v[2];
            }

            // Arrived: the target lies inside this polygon.
            if point_in_polygon(end_pos, &verts, nv) {
                best_node = cur_idx;
                best_pos = *end_pos;
                break;
            }

            // Walk edges: walls clamp the best position, portals extend
            // the flood.
            let mut j = nv - 1;
            for i in 0..nv {
                let mut neis: Vec<PolyRef> = Vec::with_capacity(8);
                if (cur_poly.neis[j] & EXT_LINK) != 0 {
                    // Tile border: collect all links on this edge.
                    let mut k = cur_poly.first_link;
                    while k != NULL_LINK {
                        let link = cur_tile.links[k as usize];
                        k = link.next;
                        if link.edge as usize == j && !link.target.is_null() {
                            let (nei_tile, nei_poly) =
                                nav.get_tile_and_poly_by_ref_unchecked(link.target);
                            if filter.pass_filter(link.target, nei_tile, nei_poly)
                                && neis.len() < 8
                            {
                                neis.push(link.target);
                            }
                        }
                    }
                } else if cur_poly.neis[j] != 0 {
                    let idx = (cur_poly.neis[j] - 1) as usize;
                    let nei_ref = PolyRef(nav.get_poly_ref_base(cur_tile).0 | idx as u64);
                    let (nei_tile, nei_poly) = nav.get_tile_and_poly_by_ref_unchecked(nei_ref);
                    if filter.pass_filter(nei_ref, nei_tile, nei_poly) {
                        neis.push(nei_ref);
                    }
                }

                if neis.is_empty() {
                    // Wall edge: try to clamp the target to it.
                    let vj = [verts[j * 3], verts[j * 3 + 1], verts[j * 3 + 2]];
                    let vi = [verts[i * 3], verts[i * 3 + 1], verts[i * 3 + 2]];
                    let (dist_sqr, tseg) = dist_pt_seg_sqr_2d(end_pos, &vj, &vi);
                    if dist_sqr < best_dist {
                        let mut p = [0.0f32; 3];
                        vlerp(&mut p, &vj, &vi, tseg);
                        best_pos = p;
                        best_dist = dist_sqr;
                        best_node = cur_idx;
                    }
                } else {
                    for nei_ref in neis {
                        let Some(nei_idx) = self.tiny_node_pool.get_node(nei_ref, 0) else {
                            continue;
                        };
                        if self
                            .tiny_node_pool
                            .node(nei_idx)
                            .unwrap()
                            .flags
                            .contains(NodeFlags::CLOSED)
                        {
                            continue;
                        }

                        // Skip portals outside the search band.
                        let vj = [verts[j * 3], verts[j * 3 + 1], verts[j * 3 + 2]];
                        let vi = [verts[i * 3], verts[i * 3 + 1], verts[i * 3 + 2]];
                        let (dist_sqr, _) = dist_pt_seg_sqr_2d(&search_pos, &vj, &vi);
                        if dist_sqr > search_rad_sqr {
                            continue;
                        }

                        if stack.len() < MAX_SURFACE_STACK {
                            let node = self.tiny_node_pool.node_mut(nei_idx).unwrap();
                            node.pidx = cur_idx;
                            node.flags.insert(NodeFlags::CLOSED);
                            stack.push(nei_idx);
                        }
                    }
                }
                j = i;
            }
        }

        let mut visited = Vec::new();
        if best_node != 0 {
            let mut chain = Vec::new();
            let mut idx = best_node;
            while idx != 0 {
                chain.push(self.tiny_node_pool.node(idx).unwrap().id);
                idx = self.tiny_node_pool.node(idx).unwrap().pidx;
            }
            chain.reverse();
            if chain.len() > max_visited {
                chain.truncate(max_visited);
                status |= Status::BUFFER_TOO_SMALL;
            }
            visited = chain;
        }

        Ok(MoveAlongSurfaceResult {
            result_pos: best_pos,
            visited,
            status,
        })
    }

    // Dijkstra expansions

    /// Collects polygons reachable within a circle, cheapest first
    pub fn find_polys_around_circle(
        &mut self,
        start_ref: PolyRef,
        center_pos: &[f32; 3],
        radius: f32,
        filter: &dyn QueryFilter,
        max_result: usize,
    ) -> StatusResult<PolysAroundResult> {
        self.dijkstra_around(start_ref, center_pos, filter, max_result, |va, vb| {
            let (dist_sqr, _) = dist_pt_seg_sqr_2d(center_pos, va, vb);
            dist_sqr <= sqr(radius)
        })
    }

    /// Collects polygons reachable inside a convex shape, cheapest first
    pub fn find_polys_around_shape(
        &mut self,
        start_ref: PolyRef,
        verts: &[f32],
        filter: &dyn QueryFilter,
        max_result: usize,
    ) -> StatusResult<PolysAroundResult> {
        let nverts = verts.len() / 3;
        if nverts < 3 {
            return Err(Status::FAILURE | Status::INVALID_PARAM);
        }

        // Cost accumulation starts at the shape centroid.
        let mut center_pos = [0.0f32; 3];
        for i in 0..nverts {
            center_pos[0] += verts[i * 3];
            center_pos[1] += verts[i * 3 + 1];
            center_pos[2] += verts[i * 3 + 2];
        }
        let scale = 1.0 / nverts as f32;
        center_pos[0] *= scale;
        center_pos[1] *= scale;
        center_pos[2] *= scale;

        self.dijkstra_around(start_ref, &center_pos, filter, max_result, |va, vb| {
            match intersect_segment_poly_2d(va, vb, verts, nverts) {
                Some((tmin, tmax, _, _)) => !(tmin > 1.0 || tmax < 0.0),
                None => false,
            }
        })
    }

    /// Shared Dijkstra skeleton for the circle and shape variants; the
    /// closure decides whether a portal segment stays inside the search
    /// region
    fn dijkstra_around(
        &mut self,
        start_ref: PolyRef,
        center_pos: &[f32; 3],
        filter: &dyn QueryFilter,
        max_result: usize,
        portal_in_range: impl Fn(&[f32; 3], &[f32; 3]) -> bool,
    ) -> StatusResult<PolysAroundResult> {
        self.guard_sliced()?;
        if !self.nav.is_valid_poly_ref(start_ref) {
            return Err(Status::FAILURE | Status::INVALID_PARAM);
        }
        let nav = Arc::clone(&self.nav);

        self.node_pool.clear();
        self.open_list.clear();

        let start_idx = self.node_pool.get_node(start_ref, 0).unwrap();
        {
            let node = self.node_pool.node_mut(start_idx).unwrap();
            node.pos = *center_pos;
            node.pidx = 0;
            node.cost = 0.0;
            node.total = 0.0;
            node.id = start_ref;
            node.flags = NodeFlags::OPEN;
        }
        self.open_list.push(start_idx, &self.node_pool);

        let mut status = Status::SUCCESS;
        let mut refs = Vec::new();
        let mut parents = Vec::new();
        let mut costs = Vec::new();

        if refs.len() < max_result {
            refs.push(start_ref);
            parents.push(PolyRef::NULL);
            costs.push(0.0);
        } else {
            status |= Status::BUFFER_TOO_SMALL;
        }

        while let Some(best_idx) = self.open_list.pop(&self.node_pool) {
            {
                let node = self.node_pool.node_mut(best_idx).unwrap();
                node.flags.remove(NodeFlags::OPEN);
                node.flags.insert(NodeFlags::CLOSED);
            }

            let (best_ref, best_pos, best_total, best_pidx) = {
                let node = self.node_pool.node(best_idx).unwrap();
                (node.id, node.pos, node.total, node.pidx)
            };
            let (best_tile, best_poly) = nav.get_tile_and_poly_by_ref_unchecked(best_ref);

            let parent_ref = self
                .node_pool
                .node(best_pidx)
                .map(|n| n.id)
                .unwrap_or(PolyRef::NULL);

            let mut i = best_poly.first_link;
            while i != NULL_LINK {
                let link = best_tile.links[i as usize];
                i = link.next;
                let neighbour_ref = link.target;

                if neighbour_ref.is_null() || neighbour_ref == parent_ref {
                    continue;
                }

                let (neighbour_tile, neighbour_poly) =
                    nav.get_tile_and_poly_by_ref_unchecked(neighbour_ref);
                if !filter.pass_filter(neighbour_ref, neighbour_tile, neighbour_poly) {
                    continue;
                }

                // Prune by the crossing portal.
                let Ok((va, vb)) = self.portal_points(
                    best_ref,
                    best_poly,
                    best_tile,
                    neighbour_ref,
                    neighbour_poly,
                    neighbour_tile,
                ) else {
                    continue;
                };
                if !portal_in_range(&va, &vb) {
                    continue;
                }

                let Some(neighbour_idx) = self.node_pool.get_node(neighbour_ref, 0) else {
                    status |= Status::OUT_OF_NODES;
                    continue;
                };

                if self
                    .node_pool
                    .node(neighbour_idx)
                    .unwrap()
                    .flags
                    .contains(NodeFlags::CLOSED)
                {
                    continue;
                }

                if self.node_pool.node(neighbour_idx).unwrap().flags.is_empty() {
                    let mut mid = [0.0f32; 3];
                    vlerp(&mut mid, &va, &vb, 0.5);
                    self.node_pool.node_mut(neighbour_idx).unwrap().pos = mid;
                }

                let neighbour_pos = self.node_pool.node(neighbour_idx).unwrap().pos;
                let total = best_total + vdist(&best_pos, &neighbour_pos);

                let (nflags, ntotal) = {
                    let n = self.node_pool.node(neighbour_idx).unwrap();
                    (n.flags, n.total)
                };
                if nflags.contains(NodeFlags::OPEN) && total >= ntotal {
                    continue;
                }

                {
                    let node = self.node_pool.node_mut(neighbour_idx).unwrap();
                    node.id = neighbour_ref;
                    node.pidx = best_idx;
                    node.total = total;
                }

                if nflags.contains(NodeFlags::OPEN) {
                    self.open_list.modify(neighbour_idx, &self.node_pool);
                } else {
                    if refs.len() < max_result {
                        refs.push(neighbour_ref);
                        parents.push(best_ref);
                        costs.push(total);
                    } else {
                        status |= Status::BUFFER_TOO_SMALL;
                    }
                    let node = self.node_pool.node_mut(neighbour_idx).unwrap();
                    node.flags.insert(NodeFlags::OPEN);
                    self.open_list.push(neighbour_idx, &self.node_pool);
                }
            }
        }

        Ok(PolysAroundResult {
            refs,
            parents,
            costs,
            status,
        })
    }

    // Wall distance

    /// Distance from a point to the nearest wall reachable within
    /// `max_radius`
    pub fn find_distance_to_wall(
        &mut self,
        start_ref: PolyRef,
        center_pos: &[f32; 3],
        max_radius: f32,
        filter: &dyn QueryFilter,
    ) -> StatusResult<DistanceToWallResult> {
        self.guard_sliced()?;
        if !self.nav.is_valid_poly_ref(start_ref) {
            return Err(Status::FAILURE | Status::INVALID_PARAM);
        }
        let nav = Arc::clone(&self.nav);

        self.node_pool.clear();
        self.open_list.clear();

        let start_idx = self.node_pool.get_node(start_ref, 0).unwrap();
        {
            let node = self.node_pool.node_mut(start_idx).unwrap();
            node.pos = *center_pos;
            node.pidx = 0;
            node.cost = 0.0;
            node.total = 0.0;
            node.id = start_ref;
            node.flags = NodeFlags::OPEN;
        }
        self.open_list.push(start_idx, &self.node_pool);

        let mut radius_sqr = sqr(max_radius);
        let mut hit_pos = [0.0f32; 3];
        let mut status = Status::SUCCESS;

        while let Some(best_idx) = self.open_list.pop(&self.node_pool) {
            {
                let node = self.node_pool.node_mut(best_idx).unwrap();
                node.flags.remove(NodeFlags::OPEN);
                node.flags.insert(NodeFlags::CLOSED);
            }

            let (best_ref, best_pos, best_total, best_pidx) = {
                let node = self.node_pool.node(best_idx).unwrap();
                (node.id, node.pos, node.total, node.pidx)
            };
            let (best_tile, best_poly) = nav.get_tile_and_poly_by_ref_unchecked(best_ref);

            let parent_ref = self
                .node_pool
                .node(best_pidx)
                .map(|n| n.id)
                .unwrap_or(PolyRef::NULL);

            // Hit test the polygon's wall edges.
            let nv = best_poly.vert_count as usize;
            let mut j = nv - 1;
            for i in 0..nv {
                let solid = if (best_poly.neis[j] & EXT_LINK) != 0 {
                    // Tile border edge counts as solid unless some link
                    // crosses it.
                    let mut solid = true;
                    let mut k = best_poly.first_link;
                    while k != NULL_LINK {
                        let link = best_tile.links[k as usize];
                        k = link.next;
                        if link.edge as usize == j {
                            if !link.target.is_null() {
                                let (nei_tile, nei_poly) =
                                    nav.get_tile_and_poly_by_ref_unchecked(link.target);
                                if filter.pass_filter(link.target, nei_tile, nei_poly) {
                                    solid = false;
                                }
                            }
                            break;
                        }
                    }
                    solid
                } else if best_poly.neis[j] != 0 {
                    // Internal edge: solid only when the neighbor is
                    // filtered out.
                    let idx = (best_poly.neis[j] - 1) as usize;
                    let nei_ref = PolyRef(nav.get_poly_ref_base(best_tile).0 | idx as u64);
                    !filter.pass_filter(nei_ref, best_tile, &best_tile.polys[idx])
                } else {
                    true
                };

                if solid {
                    let vj = best_tile.vert(best_poly.verts[j] as usize);
                    let vi = best_tile.vert(best_poly.verts[i] as usize);
                    let (dist_sqr, tseg) = dist_pt_seg_sqr_2d(center_pos, vj, vi);
                    if dist_sqr <= radius_sqr {
                        // Tighten the search to the new nearest wall.
                        radius_sqr = dist_sqr;
                        hit_pos[0] = vj[0] + (vi[0] - vj[0]) * tseg;
                        hit_pos[1] = vj[1] + (vi[1] - vj[1]) * tseg;
                        hit_pos[2] = vj[2] + (vi[2] - vj[2]) * tseg;
                    }
                }
                j = i;
            }

            let mut i = best_poly.first_link;
            while i != NULL_LINK {
                let link = best_tile.links[i as usize];
                i = link.next;
                let neighbour_ref = link.target;

                if neighbour_ref.is_null() || neighbour_ref == parent_ref {
                    continue;
                }

                let (neighbour_tile, neighbour_poly) =
                    nav.get_tile_and_poly_by_ref_unchecked(neighbour_ref);

                if neighbour_poly.poly_type == PolyType::OffMeshConnection {
                    continue;
                }

                // Prune by distance to the connecting edge.
                let va = best_tile.vert(best_poly.verts[link.edge as usize] as usize);
                let vb = best_tile.vert(
                    best_poly.verts[(link.edge as usize + 1) % nv] as usize,
                );
                let (dist_sqr, _) = dist_pt_seg_sqr_2d(center_pos, va, vb);
                if dist_sqr > radius_sqr {
                    continue;
                }

                if !filter.pass_filter(neighbour_ref, neighbour_tile, neighbour_poly) {
                    continue;
                }

                let Some(neighbour_idx) = self.node_pool.get_node(neighbour_ref, 0) else {
                    status |= Status::OUT_OF_NODES;
                    continue;
                };

                if self
                    .node_pool
                    .node(neighbour_idx)
                    .unwrap()
                    .flags
                    .contains(NodeFlags::CLOSED)
                {
                    continue;
                }

                if self.node_pool.node(neighbour_idx).unwrap().flags.is_empty() {
                    if let Ok(mid) = self.edge_mid_point(
                        best_ref,
                        best_poly,
                        best_tile,
                        neighbour_ref,
                        neighbour_poly,
                        neighbour_tile,
                    ) {
                        self.node_pool.node_mut(neighbour_idx).unwrap().pos = mid;
                    }
                }

                let neighbour_pos = self.node_pool.node(neighbour_idx).unwrap().pos;
                let total = best_total + vdist(&best_pos, &neighbour_pos);

                let (nflags, ntotal) = {
                    let n = self.node_pool.node(neighbour_idx).unwrap();
                    (n.flags, n.total)
                };
                if nflags.contains(NodeFlags::OPEN) && total >= ntotal {
                    continue;
                }

                {
                    let node = self.node_pool.node_mut(neighbour_idx).unwrap();
                    node.id = neighbour_ref;
                    node.pidx = best_idx;
                    node.total = total;
                }

                if nflags.contains(NodeFlags::OPEN) {
                    self.open_list.modify(neighbour_idx, &self.node_pool);
                } else {
                    let node = self.node_pool.node_mut(neighbour_idx).unwrap();
                    node.flags.insert(NodeFlags::OPEN);
                    self.open_list.push(neighbour_idx, &self.node_pool);
                }
            }
        }

        let mut hit_normal = [0.0f32; 3];
        vsub(&mut hit_normal, center_pos, &hit_pos);
        vnormalize(&mut hit_normal);

        Ok(DistanceToWallResult {
            distance: radius_sqr.sqrt(),
            hit_pos,
            hit_normal,
            status,
        })
    }

    // Random points

    /// Picks a random walkable point over the whole mesh, weighted by
    /// polygon area
    pub fn find_random_point(
        &self,
        filter: &dyn QueryFilter,
        frand: &mut dyn FnMut() -> f32,
    ) -> StatusResult<(PolyRef, [f32; 3])> {
        // Pick a tile by reservoir sampling, assuming similar coverage
        // per tile.
        let mut chosen_tile = None;
        let mut tsum = 0.0f32;
        for i in 0..self.nav.max_tiles() {
            let Some(tile) = self.nav.tile(i) else {
                continue;
            };
            let area = 1.0;
            tsum += area;
            let u = frand();
            if u * tsum <= area {
                chosen_tile = Some(tile);
            }
        }
        let tile = chosen_tile.ok_or(Status::FAILURE)?;

        // Pick a polygon weighted by area.
        let base = self.nav.get_poly_ref_base(tile);
        let mut chosen_poly = None;
        let mut area_sum = 0.0f32;
        for (i, poly) in tile.polys.iter().enumerate() {
            if poly.poly_type != PolyType::Ground {
                continue;
            }
            let poly_ref = PolyRef(base.0 | i as u64);
            if !filter.pass_filter(poly_ref, tile, poly) {
                continue;
            }

            let mut poly_area = 0.0f32;
            for j in 2..poly.vert_count as usize {
                let va = tile.vert(poly.verts[0] as usize);
                let vb = tile.vert(poly.verts[j - 1] as usize);
                let vc = tile.vert(poly.verts[j] as usize);
                poly_area += tri_area_2d(va, vb, vc);
            }

            area_sum += poly_area;
            let u = frand();
            if u * area_sum <= poly_area {
                chosen_poly = Some((poly_ref, poly));
            }
        }
        let (poly_ref, poly) = chosen_poly.ok_or(Status::FAILURE)?;

        let pt = self.random_point_in_poly(tile, poly, frand);
        let h = self.get_poly_height(poly_ref, &pt)?;
        Ok((poly_ref, [pt[0], h, pt[2]]))
    }

    /// Picks a random walkable point reachable from `start_ref` within a
    /// circle
    ///
    /// Candidate polygons come from a Dijkstra flood pruned at the
    /// circle, so an overlapping but unreachable polygon is never
    /// chosen.
    pub fn find_random_point_around_circle(
        &mut self,
        start_ref: PolyRef,
        center_pos: &[f32; 3],
        radius: f32,
        filter: &dyn QueryFilter,
        frand: &mut dyn FnMut() -> f32,
    ) -> StatusResult<(PolyRef, [f32; 3])> {
        self.guard_sliced()?;
        if !self.nav.is_valid_poly_ref(start_ref) {
            return Err(Status::FAILURE | Status::INVALID_PARAM);
        }
        let nav = Arc::clone(&self.nav);

        {
            let (start_tile, start_poly) = nav.get_tile_and_poly_by_ref_unchecked(start_ref);
            if !filter.pass_filter(start_ref, start_tile, start_poly) {
                return Err(Status::FAILURE | Status::INVALID_PARAM);
            }
        }

        self.node_pool.clear();
        self.open_list.clear();

        let start_idx = self.node_pool.get_node(start_ref, 0).unwrap();
        {
            let node = self.node_pool.node_mut(start_idx).unwrap();
            node.pos = *center_pos;
            node.pidx = 0;
            node.cost = 0.0;
            node.total = 0.0;
            node.id = start_ref;
            node.flags = NodeFlags::OPEN;
        }
        self.open_list.push(start_idx, &self.node_pool);

        let radius_sqr = sqr(radius);
        let mut area_sum = 0.0f32;
        let mut chosen: Option<PolyRef> = None;

        while let Some(best_idx) = self.open_list.pop(&self.node_pool) {
            {
                let node = self.node_pool.node_mut(best_idx).unwrap();
                node.flags.remove(NodeFlags::OPEN);
                node.flags.insert(NodeFlags::CLOSED);
            }

            let (best_ref, best_pos, best_total, best_pidx) = {
                let node = self.node_pool.node(best_idx).unwrap();
                (node.id, node.pos, node.total, node.pidx)
            };
            let (best_tile, best_poly) = nav.get_tile_and_poly_by_ref_unchecked(best_ref);

            // Only ground polygons can host the random point.
            if best_poly.poly_type == PolyType::Ground {
                let mut poly_area = 0.0f32;
                for j in 2..best_poly.vert_count as usize {
                    let va = best_tile.vert(best_poly.verts[0] as usize);
                    let vb = best_tile.vert(best_poly.verts[j - 1] as usize);
                    let vc = best_tile.vert(best_poly.verts[j] as usize);
                    poly_area += tri_area_2d(va, vb, vc);
                }
                area_sum += poly_area;
                let u = frand();
                if u * area_sum <= poly_area {
                    chosen = Some(best_ref);
                }
            }

            let parent_ref = self
                .node_pool
                .node(best_pidx)
                .map(|n| n.id)
                .unwrap_or(PolyRef::NULL);

            let mut i = best_poly.first_link;
            while i != NULL_LINK {
                let link = best_tile.links[i as usize];
                i = link.next;
                let neighbour_ref = link.target;

                if neighbour_ref.is_null() || neighbour_ref == parent_ref {
                    continue;
                }

                let (neighbour_tile, neighbour_poly) =
                    nav.get_tile_and_poly_by_ref_unchecked(neighbour_ref);
                if !filter.pass_filter(neighbour_ref, neighbour_tile, neighbour_poly) {
                    continue;
                }

                let Ok((va, vb)) = self.portal_points(
                    best_ref,
                    best_poly,
                    best_tile,
                    neighbour_ref,
                    neighbour_poly,
                    neighbour_tile,
                ) else {
                    continue;
                };

                let (dist_sqr, _) = dist_pt_seg_sqr_2d(center_pos, &va, &vb);
                if dist_sqr > radius_sqr {
                    continue;
                }

                let Some(neighbour_idx) = self.node_pool.get_node(neighbour_ref, 0) else {
                    continue;
                };

                if self
                    .node_pool
                    .node(neighbour_idx)
                    .unwrap()
                    .flags
                    .contains(NodeFlags::CLOSED)
                {
                    continue;
                }

                if self.node_pool.node(neighbour_idx).unwrap().flags.is_empty() {
                    let mut mid = [0.0f32; 3];
                    vlerp(&mut mid, &va, &vb, 0.5);
                    self.node_pool.node_mut(neighbour_idx).unwrap().pos = mid;
                }

                let neighbour_pos = self.node_pool.node(neighbour_idx).unwrap().pos;
                let total = best_total + vdist(&best_pos, &neighbour_pos);

                let (nflags, ntotal) = {
                    let n = self.node_pool.node(neighbour_idx).unwrap();
                    (n.flags, n.total)
                };
                if nflags.contains(NodeFlags::OPEN) && total >= ntotal {
                    continue;
                }

                {
                    let node = self.node_pool.node_mut(neighbour_idx).unwrap();
                    node.id = neighbour_ref;
                    node.pidx = best_idx;
                    node.total = total;
                }

                if nflags.contains(NodeFlags::OPEN) {
                    self.open_list.modify(neighbour_idx, &self.node_pool);
                } else {
                    let node = self.node_pool.node_mut(neighbour_idx).unwrap();
                    node.flags.insert(NodeFlags::OPEN);
                    self.open_list.push(neighbour_idx, &self.node_pool);
                }
            }
        }

        let poly_ref = chosen.ok_or(Status::FAILURE)?;
        let (tile, poly) = nav.get_tile_and_poly_by_ref_unchecked(poly_ref);
        let pt = self.random_point_in_poly(tile, poly, frand);
        // Surface the height query's own status instead of silently
        // keeping the unprojected point.
        let h = self.get_poly_height(poly_ref, &pt)?;
        Ok((poly_ref, [pt[0], h, pt[2]]))
    }

    fn random_point_in_poly(
        &self,
        tile: &MeshTile,
        poly: &Poly,
        frand: &mut dyn FnMut() -> f32,
    ) -> [f32; 3] {
        let mut verts = [0.0f32; VERTS_PER_POLYGON * 3];
        let mut areas = [0.0f32; VERTS_PER_POLYGON];
        for j in 0..poly.vert_count as usize {
            let v = tile.vert(poly.verts[j] as usize);
            verts[j * 3] = v[0];
            verts[j * 3 + 1] = v[1];
            verts[j * 3 + 2] = v[2];
        }

        let s = frand();
        let t = frand();
        let mut pt = [0.0f32; 3];
        random_point_in_convex_poly(
            &verts,
            poly.vert_count as usize,
            &mut areas,
            s,
            t,
            &mut pt,
        );
        pt
    }

    // Validation

    /// True when the ref resolves against the mesh and passes the filter
    pub fn is_valid_poly_ref(&self, poly_ref: PolyRef, filter: &dyn QueryFilter) -> bool {
        match self.nav.get_tile_and_poly_by_ref(poly_ref) {
            Ok((tile, poly)) => filter.pass_filter(poly_ref, tile, poly),
            Err(_) => false,
        }
    }

    /// True when the polygon was fully expanded by the previous search
    pub fn is_in_closed_list(&self, poly_ref: PolyRef) -> bool {
        self.node_pool
            .find_nodes(poly_ref, 4)
            .iter()
            .any(|&i| {
                self.node_pool
                    .node(i)
                    .map(|n| n.flags.contains(NodeFlags::CLOSED))
                    .unwrap_or(false)
            })
    }
}
