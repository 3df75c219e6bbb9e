//! End-to-end query scenarios over programmatically built grid meshes

use std::sync::Arc;

use super::test_mesh_helpers::*;
use super::{
    FindPathOptions, NavMeshQuery, PolyRef, RaycastOptions, StandardFilter, Status,
    StraightPathFlags, StraightPathOptions, NULL_LINK,
};

/// Simple deterministic unit RNG for the random point queries
struct Lcg(u32);

impl Lcg {
    fn next_f32(&mut self) -> f32 {
        self.0 = self.0.wrapping_mul(1103515245).wrapping_add(12345);
        (self.0 & 0x7fffffff) as f32 / 2147483647.0
    }
}

/// Asserts every consecutive corridor pair is linked and free of
/// duplicates
fn assert_connected_corridor(query: &NavMeshQuery, path: &[PolyRef]) {
    for w in path.windows(2) {
        assert_ne!(w[0], w[1], "corridor repeats a polygon");
        let (tile, poly) = query.nav_mesh().get_tile_and_poly_by_ref(w[0]).unwrap();
        let mut linked = false;
        let mut i = poly.first_link;
        while i != NULL_LINK {
            if tile.links[i as usize].target == w[1] {
                linked = true;
                break;
            }
            i = tile.links[i as usize].next;
        }
        assert!(linked, "{} and {} are not linked", w[0], w[1]);
    }
}

#[test]
fn test_open_grid_path_and_straight_path() {
    // S1: 10x10 grid of unit quads, fully walkable.
    let mesh = single_tile_mesh(10, &|_, _| false);
    let (mut query, filter) = query_for(&mesh);

    let start_pos = [0.5, 0.0, 0.5];
    let end_pos = [9.5, 0.0, 9.5];

    let start = poly_at(&query, &filter, start_pos);
    let end = poly_at(&query, &filter, end_pos);

    // The nearest polygon really is the quad under the point.
    let (closest, over) = query.closest_point_on_poly(start, &start_pos).unwrap();
    assert!(over);
    assert!((closest[0] - 0.5).abs() < 1e-5 && (closest[2] - 0.5).abs() < 1e-5);

    let result = query
        .find_path(start, end, &start_pos, &end_pos, &filter, 256)
        .unwrap();
    assert!(result.status.is_success());
    assert!(!result.status.has_detail(Status::PARTIAL_RESULT));
    assert_eq!(result.path[0], start);
    assert_eq!(*result.path.last().unwrap(), end);
    assert_connected_corridor(&query, &result.path);
    // A diagonal corridor cannot be longer than one quad per row and
    // column.
    assert!(result.path.len() <= 20);

    // The pulled string is the straight segment; corners the funnel
    // touches along the exact diagonal may appear but must be on it.
    let straight = query
        .find_straight_path(
            &start_pos,
            &end_pos,
            &result.path,
            64,
            StraightPathOptions::default(),
        )
        .unwrap();
    assert!(straight.verts.len() >= 2);
    let first = straight.verts.first().unwrap();
    let last = straight.verts.last().unwrap();
    assert!(first.flags.contains(StraightPathFlags::START));
    assert!(last.flags.contains(StraightPathFlags::END));
    assert_eq!(first.pos, start_pos);
    assert_eq!(last.pos, end_pos);
    for v in &straight.verts {
        // Collinear with the segment and monotone along it.
        let cross = (v.pos[0] - start_pos[0]) * (end_pos[2] - start_pos[2])
            - (v.pos[2] - start_pos[2]) * (end_pos[0] - start_pos[0]);
        assert!(cross.abs() < 1e-3, "vertex {:?} off the straight line", v.pos);
    }
    for w in straight.verts.windows(2) {
        assert!(w[1].pos[0] >= w[0].pos[0] - 1e-5);
    }
}

#[test]
fn test_wall_forces_detour() {
    // S2: wall along x = 5 except the top row.
    let mesh = single_tile_mesh(10, &|qx, qz| qx == 5 && qz != 9);
    let (mut query, filter) = query_for(&mesh);

    let start_pos = [0.5, 0.0, 0.5];
    let end_pos = [9.5, 0.0, 0.5];
    let start = poly_at(&query, &filter, start_pos);
    let end = poly_at(&query, &filter, end_pos);

    let result = query
        .find_path(start, end, &start_pos, &end_pos, &filter, 256)
        .unwrap();
    assert!(result.status.is_success());
    assert!(!result.status.has_detail(Status::PARTIAL_RESULT));
    assert_eq!(*result.path.last().unwrap(), end);
    assert_connected_corridor(&query, &result.path);

    // The corridor must detour through the top row.
    let goes_through_top = result.path.iter().any(|&r| {
        let (closest, _) = query.closest_point_on_poly(r, &[5.5, 0.0, 9.5]).unwrap();
        (closest[0] - 5.5).abs() < 0.51 && (closest[2] - 9.5).abs() < 0.51
    });
    assert!(goes_through_top, "corridor did not use the top row gap");

    // The funnel emits corner vertices where the detour bends.
    let straight = query
        .find_straight_path(
            &start_pos,
            &end_pos,
            &result.path,
            64,
            StraightPathOptions::default(),
        )
        .unwrap();
    assert!(straight.verts.len() > 2);
    // Some corner must be near the wall.
    assert!(straight
        .verts
        .iter()
        .any(|v| (v.pos[0] - 5.0).abs() < 1.1 || (v.pos[0] - 6.0).abs() < 1.1));
}

#[test]
fn test_disconnected_components_partial_result() {
    // S3: column x = 5 removed entirely; two islands.
    let mesh = single_tile_mesh(10, &|qx, _| qx == 5);
    let (mut query, filter) = query_for(&mesh);

    let start_pos = [0.5, 0.0, 5.5];
    let end_pos = [9.5, 0.0, 5.5];
    let start = poly_at(&query, &filter, start_pos);
    let end = poly_at(&query, &filter, end_pos);

    let result = query
        .find_path(start, end, &start_pos, &end_pos, &filter, 256)
        .unwrap();
    assert!(result.status.is_success());
    assert!(result.status.has_detail(Status::PARTIAL_RESULT));

    // The corridor stays on the start island and ends at its edge
    // toward the goal.
    let last = *result.path.last().unwrap();
    let (closest, _) = query.closest_point_on_poly(last, &end_pos).unwrap();
    assert!(closest[0] < 5.0 + 1e-3);
    assert!((closest[0] - 5.0).abs() < 1.1, "did not reach the gap edge");
}

#[test]
fn test_raycast_hits_wall() {
    // S4: missing column turns the gap boundary into a wall.
    let mesh = single_tile_mesh(10, &|qx, _| qx == 5);
    let (query, filter) = query_for(&mesh);

    let start_pos = [2.5, 0.0, 5.5];
    let end_pos = [8.5, 0.0, 5.5];
    let start = poly_at(&query, &filter, start_pos);

    let hit = query
        .raycast(
            start,
            &start_pos,
            &end_pos,
            &filter,
            RaycastOptions::default(),
            PolyRef::NULL,
            64,
        )
        .unwrap();

    assert!(hit.t > 0.0 && hit.t < 1.0, "expected a wall hit, t = {}", hit.t);
    // Hit is at the x = 5 boundary.
    let hit_x = start_pos[0] + (end_pos[0] - start_pos[0]) * hit.t;
    assert!((hit_x - 5.0).abs() < 1e-4);
    // Normal is horizontal, perpendicular to the wall, pointing back.
    assert_eq!(hit.hit_normal[1], 0.0);
    assert!((hit.hit_normal[0] + 1.0).abs() < 1e-4);
    assert!(hit.hit_normal[2].abs() < 1e-4);
    // Path covers the polygons walked before the wall.
    assert_eq!(hit.path.len(), 3);
    assert_eq!(hit.path[0], start);
}

#[test]
fn test_raycast_to_same_position_reports_no_hit() {
    let mesh = single_tile_mesh(4, &|_, _| false);
    let (query, filter) = query_for(&mesh);

    let pos = [1.5, 0.0, 1.5];
    let start = poly_at(&query, &filter, pos);
    let hit = query
        .raycast(
            start,
            &pos,
            &pos,
            &filter,
            RaycastOptions::default(),
            PolyRef::NULL,
            16,
        )
        .unwrap();
    assert_eq!(hit.t, f32::MAX);
    assert_eq!(hit.path, vec![start]);
}

#[test]
fn test_raycast_cost_bounded_below_by_distance() {
    let mesh = single_tile_mesh(10, &|_, _| false);
    let (query, filter) = query_for(&mesh);

    let start_pos = [0.5, 0.0, 0.5];
    let end_pos = [7.5, 0.0, 3.5];
    let start = poly_at(&query, &filter, start_pos);

    let hit = query
        .raycast(
            start,
            &start_pos,
            &end_pos,
            &filter,
            RaycastOptions::USE_COSTS,
            PolyRef::NULL,
            64,
        )
        .unwrap();
    assert_eq!(hit.t, f32::MAX);
    let dist = nav_common::vdist_2d(&start_pos, &end_pos);
    assert!(
        hit.path_cost >= dist - 1e-3,
        "cost {} below distance {}",
        hit.path_cost,
        dist
    );
}

#[test]
fn test_random_point_around_circle_stays_reachable() {
    // S5: points sampled in a circle come from graph-reachable polygons.
    let mesh = single_tile_mesh(10, &|_, _| false);
    let (mut query, filter) = query_for(&mesh);

    let center = [0.0, 0.0, 0.0];
    let start = poly_at(&query, &filter, [0.5, 0.0, 0.5]);

    let around = query
        .find_polys_around_circle(start, &center, 5.0, &filter, 128)
        .unwrap();

    let mut rng = Lcg(7);
    for _ in 0..16 {
        let (poly_ref, pt) = query
            .find_random_point_around_circle(start, &center, 5.0, &filter, &mut || {
                rng.next_f32()
            })
            .unwrap();
        // Within the circle, up to one polygon diagonal of slack.
        let d = (pt[0] - center[0]).hypot(pt[2] - center[2]);
        assert!(d <= 5.0 + 1.5, "point {pt:?} too far: {d}");
        assert!(
            around.refs.contains(&poly_ref),
            "polygon {poly_ref} not reachable within the circle"
        );
    }
}

#[test]
fn test_sliced_any_angle_not_longer_than_plain() {
    // S6: iterate the sliced search one expansion at a time.
    let mesh = single_tile_mesh(10, &|_, _| false);
    let (mut query, filter) = query_for(&mesh);

    let start_pos = [0.5, 0.0, 0.5];
    let end_pos = [9.5, 0.0, 8.5];
    let start = poly_at(&query, &filter, start_pos);
    let end = poly_at(&query, &filter, end_pos);

    let plain = query
        .find_path(start, end, &start_pos, &end_pos, &filter, 256)
        .unwrap();

    let status = query.init_sliced_find_path(
        start,
        end,
        &start_pos,
        &end_pos,
        Arc::new(StandardFilter::default()),
        FindPathOptions::ANY_ANGLE,
    );
    assert!(status.is_in_progress());

    let mut guard = 0;
    loop {
        let update = query.update_sliced_find_path(1);
        if !update.status.is_in_progress() {
            assert!(update.status.is_success());
            break;
        }
        guard += 1;
        assert!(guard < 10_000, "sliced search did not terminate");
    }

    let sliced = query.finalize_sliced_find_path(256).unwrap();
    assert!(sliced.status.is_success());
    assert_eq!(*sliced.path.last().unwrap(), end);
    assert!(
        sliced.path.len() <= plain.path.len(),
        "any-angle corridor longer than plain one"
    );
}

#[test]
fn test_sliced_search_blocks_other_queries_until_finalized() {
    let mesh = single_tile_mesh(6, &|_, _| false);
    let (mut query, filter) = query_for(&mesh);

    let a = poly_at(&query, &filter, [0.5, 0.0, 0.5]);
    let b = poly_at(&query, &filter, [5.5, 0.0, 5.5]);

    query.init_sliced_find_path(
        a,
        b,
        &[0.5, 0.0, 0.5],
        &[5.5, 0.0, 5.5],
        Arc::new(StandardFilter::default()),
        FindPathOptions::default(),
    );

    // Pool-mutating calls must hard-fail while the slice is active.
    let err = query
        .find_path(a, b, &[0.5, 0.0, 0.5], &[5.5, 0.0, 5.5], &filter, 16)
        .unwrap_err();
    assert!(err.is_failure());

    // Finishing the slice unblocks them.
    while query.update_sliced_find_path(8).status.is_in_progress() {}
    query.finalize_sliced_find_path(64).unwrap();
    assert!(query
        .find_path(a, b, &[0.5, 0.0, 0.5], &[5.5, 0.0, 5.5], &filter, 64)
        .is_ok());
}

#[test]
fn test_sliced_finalize_partial_follows_existing_corridor() {
    let mesh = single_tile_mesh(10, &|_, _| false);
    let (mut query, filter) = query_for(&mesh);

    let start_pos = [0.5, 0.0, 0.5];
    let end_pos = [9.5, 0.0, 0.5];
    let start = poly_at(&query, &filter, start_pos);
    let end = poly_at(&query, &filter, end_pos);

    // A full corridor from an earlier search.
    let existing = query
        .find_path(start, end, &start_pos, &end_pos, &filter, 64)
        .unwrap()
        .path;

    query.init_sliced_find_path(
        start,
        end,
        &start_pos,
        &end_pos,
        Arc::new(StandardFilter::default()),
        FindPathOptions::default(),
    );
    // Only a few iterations; the search will not have reached the end.
    query.update_sliced_find_path(3);

    let partial = query
        .finalize_sliced_find_path_partial(&existing, 64)
        .unwrap();
    assert!(partial.status.is_success());
    assert_eq!(partial.path[0], start);
    // The reconstructed prefix stays on the known corridor.
    assert!(partial.path.iter().all(|r| existing.contains(r)));
}

#[test]
fn test_find_path_boundary_cases() {
    let mesh = single_tile_mesh(4, &|_, _| false);
    let (mut query, filter) = query_for(&mesh);

    let pos = [1.5, 0.0, 1.5];
    let here = poly_at(&query, &filter, pos);

    // Start equals end.
    let r = query
        .find_path(here, here, &pos, &pos, &filter, 8)
        .unwrap();
    assert_eq!(r.path, vec![here]);
    assert_eq!(r.status, Status::SUCCESS);

    // Zero-capacity output.
    let err = query
        .find_path(here, here, &pos, &pos, &filter, 0)
        .unwrap_err();
    assert!(err.is_failure());
    assert!(err.has_detail(Status::INVALID_PARAM));

    // Null refs.
    let err = query
        .find_path(PolyRef::NULL, here, &pos, &pos, &filter, 8)
        .unwrap_err();
    assert!(err.has_detail(Status::INVALID_PARAM));
}

#[test]
fn test_straight_path_single_polygon() {
    let mesh = single_tile_mesh(4, &|_, _| false);
    let (query, filter) = query_for(&mesh);

    let start_pos = [1.2, 0.0, 1.2];
    let end_pos = [1.8, 0.0, 1.8];
    let here = poly_at(&query, &filter, start_pos);

    let r = query
        .find_straight_path(
            &start_pos,
            &end_pos,
            &[here],
            8,
            StraightPathOptions::default(),
        )
        .unwrap();
    assert_eq!(r.verts.len(), 2);
    assert!(r.verts[0].flags.contains(StraightPathFlags::START));
    assert!(r.verts[1].flags.contains(StraightPathFlags::END));
}

#[test]
fn test_straight_path_all_crossings_is_monotone() {
    let mesh = single_tile_mesh(6, &|_, _| false);
    let (mut query, filter) = query_for(&mesh);

    let start_pos = [0.5, 0.0, 2.5];
    let end_pos = [5.5, 0.0, 2.5];
    let start = poly_at(&query, &filter, start_pos);
    let end = poly_at(&query, &filter, end_pos);

    let corridor = query
        .find_path(start, end, &start_pos, &end_pos, &filter, 64)
        .unwrap()
        .path;

    let r = query
        .find_straight_path(
            &start_pos,
            &end_pos,
            &corridor,
            64,
            StraightPathOptions::ALL_CROSSINGS,
        )
        .unwrap();

    // One vertex per crossed portal plus the endpoints.
    assert_eq!(r.verts.len(), corridor.len() + 1);
    // Progress along x never reverses.
    for w in r.verts.windows(2) {
        assert!(w[1].pos[0] >= w[0].pos[0] - 1e-5);
    }
}

#[test]
fn test_nearest_poly_contained_in_query_polygons() {
    let mesh = single_tile_mesh(8, &|_, _| false);
    let (query, filter) = query_for(&mesh);

    let center = [3.3, 0.0, 4.7];
    let extents = [1.0, 1.0, 1.0];

    let (nearest, _) = query.find_nearest_poly(&center, &extents, &filter).unwrap();
    assert!(!nearest.is_null());

    let polys = query
        .query_polygons(&center, &extents, &filter, 128)
        .unwrap();
    assert!(polys.contains(&nearest));

    // A box far outside the mesh matches nothing but still succeeds.
    let (none, _) = query
        .find_nearest_poly(&[100.0, 0.0, 100.0], &extents, &filter)
        .unwrap();
    assert!(none.is_null());
}

#[test]
fn test_polys_around_circle_costs_non_decreasing() {
    let mesh = single_tile_mesh(10, &|_, _| false);
    let (mut query, filter) = query_for(&mesh);

    let center = [5.5, 0.0, 5.5];
    let start = poly_at(&query, &filter, center);

    let r = query
        .find_polys_around_circle(start, &center, 3.0, &filter, 128)
        .unwrap();
    assert!(r.refs.len() > 1);
    assert_eq!(r.refs.len(), r.costs.len());
    assert_eq!(r.refs[0], start);
    assert_eq!(r.parents[0], PolyRef::NULL);
    for w in r.costs.windows(2) {
        assert!(w[1] >= w[0], "Dijkstra emitted out of cost order");
    }
}

#[test]
fn test_polys_around_shape_prunes_outside() {
    let mesh = single_tile_mesh(10, &|_, _| false);
    let (mut query, filter) = query_for(&mesh);

    let start = poly_at(&query, &filter, [1.5, 0.0, 1.5]);
    // Narrow rectangle along the x axis.
    let shape = [
        0.0, 0.0, 1.0, //
        0.0, 0.0, 2.9, //
        6.0, 0.0, 2.9, //
        6.0, 0.0, 1.0,
    ];

    let r = query
        .find_polys_around_shape(start, &shape, &filter, 128)
        .unwrap();
    assert!(!r.refs.is_empty());
    for &poly_ref in &r.refs {
        let (closest, _) = query
            .closest_point_on_poly(poly_ref, &[3.0, 0.0, 2.0])
            .unwrap();
        // Every reported polygon touches the shape band.
        assert!(closest[2] < 4.0, "polygon {poly_ref} outside the band");
    }
    for w in r.costs.windows(2) {
        assert!(w[1] >= w[0]);
    }
}

#[test]
fn test_distance_to_wall() {
    let mesh = single_tile_mesh(10, &|_, _| false);
    let (mut query, filter) = query_for(&mesh);

    let center = [2.5, 0.0, 5.5];
    let start = poly_at(&query, &filter, center);

    let r = query
        .find_distance_to_wall(start, &center, 6.0, &filter)
        .unwrap();
    // Closest wall is the x = 0 mesh border.
    assert!((r.distance - 2.5).abs() < 1e-4);
    assert!((r.hit_pos[0] - 0.0).abs() < 1e-4);
    // Normal points from the wall back to the center.
    assert!(r.hit_normal[0] > 0.99);
}

#[test]
fn test_move_along_surface_clamps_at_walls() {
    let mesh = single_tile_mesh(10, &|_, _| false);
    let (mut query, filter) = query_for(&mesh);

    let start_pos = [5.5, 0.0, 5.5];
    let start = poly_at(&query, &filter, start_pos);

    // Target far outside the mesh; movement stops at the border.
    let r = query
        .move_along_surface(start, &start_pos, &[15.0, 0.0, 5.5], &filter, 32)
        .unwrap();
    assert!(r.result_pos[0] <= 10.0 + 1e-4);
    assert!(!r.visited.is_empty());
    assert_eq!(r.visited[0], start);

    // Target within the same polygon is reached exactly.
    let r = query
        .move_along_surface(start, &start_pos, &[5.9, 0.0, 5.9], &filter, 32)
        .unwrap();
    assert_eq!(r.result_pos, [5.9, 0.0, 5.9]);
    assert_eq!(r.visited, vec![start]);
}

#[test]
fn test_find_random_point_on_mesh() {
    let mesh = single_tile_mesh(6, &|_, _| false);
    let (query, filter) = query_for(&mesh);

    let mut rng = Lcg(42);
    let (poly_ref, pt) = query
        .find_random_point(&filter, &mut || rng.next_f32())
        .unwrap();
    assert!(!poly_ref.is_null());
    assert!((0.0..=6.0).contains(&pt[0]));
    assert!((0.0..=6.0).contains(&pt[2]));
    // The point is projected onto the surface.
    assert!(pt[1].abs() < 1e-4);
}
