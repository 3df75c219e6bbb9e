//! End-to-end path building through on-disk map data
//!
//! Builds a small map the way the tile baker would lay it out on disk,
//! then drives the manager's public surface over it. World coordinates
//! are z-up; the mesh under it is y-up.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use glam::Vec3;

use nav_mesh::{
    write_tile_data, MmapTileHeader, NavMeshParams, Poly, PolyDetail, PolyType, TileData,
    TileHeader, EXT_LINK,
};
use nav_path::{MapSetManager, PathType, NAV_GROUND, SMOOTH_PATH_STEP_SIZE};

const GRID: usize = 8;

/// Builds one flat `GRID`x`GRID` tile of unit quads in mesh space,
/// skipping the cells where `skip` returns true
fn build_tile(tx: i32, ty: i32, skip: &dyn Fn(usize, usize) -> bool) -> TileData {
    let n = GRID;
    let ox = tx as f32 * n as f32;
    let oz = ty as f32 * n as f32;

    let side = n + 1;
    let mut verts = Vec::new();
    for z in 0..side {
        for x in 0..side {
            verts.extend_from_slice(&[ox + x as f32, 0.0, oz + z as f32]);
        }
    }
    let vid = |x: usize, z: usize| (z * side + x) as u16;

    let mut cell_poly = HashMap::new();
    for qz in 0..n {
        for qx in 0..n {
            if !skip(qx, qz) {
                let idx = cell_poly.len();
                cell_poly.insert((qx, qz), idx);
            }
        }
    }

    let mut polys = Vec::new();
    let mut detail_meshes = Vec::new();
    let mut detail_tris = Vec::new();

    for qz in 0..n {
        for qx in 0..n {
            if skip(qx, qz) {
                continue;
            }
            let mut poly = Poly::new(0, PolyType::Ground, NAV_GROUND);
            poly.vert_count = 4;
            poly.verts = [
                vid(qx, qz),
                vid(qx, qz + 1),
                vid(qx + 1, qz + 1),
                vid(qx + 1, qz),
                0,
                0,
            ];

            let neighbors = [
                (qx.checked_sub(1).map(|x| (x, qz)), 4u16),
                (if qz + 1 < n { Some((qx, qz + 1)) } else { None }, 2),
                (if qx + 1 < n { Some((qx + 1, qz)) } else { None }, 0),
                (qz.checked_sub(1).map(|z| (qx, z)), 6),
            ];
            for (j, (cell, side_code)) in neighbors.iter().enumerate() {
                poly.neis[j] = match cell {
                    Some(c) => cell_poly.get(c).map_or(0, |&i| i as u16 + 1),
                    None => EXT_LINK | side_code,
                };
            }

            detail_meshes.push(PolyDetail {
                vert_base: 0,
                tri_base: (detail_tris.len() / 4) as u32,
                vert_count: 0,
                tri_count: 2,
            });
            detail_tris.extend_from_slice(&[0, 1, 2, 0, 0, 2, 3, 0]);
            polys.push(poly);
        }
    }

    let poly_count = polys.len() as i32;
    TileData {
        header: TileHeader {
            x: tx,
            y: ty,
            layer: 0,
            user_id: 0,
            poly_count,
            vert_count: (side * side) as i32,
            max_link_count: poly_count * 6,
            detail_mesh_count: poly_count,
            detail_vert_count: 0,
            detail_tri_count: poly_count * 2,
            bv_node_count: 0,
            off_mesh_con_count: 0,
            off_mesh_base: poly_count,
            walkable_height: 2.0,
            walkable_radius: 0.6,
            walkable_climb: 0.5,
            bmin: [ox, -1.0, oz],
            bmax: [ox + n as f32, 1.0, oz + n as f32],
            bv_quant_factor: 0.0,
        },
        verts,
        polys,
        detail_meshes,
        detail_verts: Vec::new(),
        detail_tris,
        bv_tree: Vec::new(),
        off_mesh_cons: Vec::new(),
    }
}

/// Writes a map header and tiles into `dir` the way the baker does
fn write_map(dir: &Path, map_id: u32, tiles: &[TileData]) {
    let params = NavMeshParams {
        origin: [0.0, 0.0, 0.0],
        tile_width: GRID as f32,
        tile_height: GRID as f32,
        max_tiles: 64,
        max_polys: 1024,
    };
    let mut f = File::create(dir.join(format!("{map_id:03}.mmap"))).unwrap();
    params.write_to(&mut f).unwrap();

    for tile in tiles {
        let blob = write_tile_data(tile).unwrap();
        let name = format!("{map_id:03}{:02}{:02}.mmtile", tile.header.x, tile.header.y);
        let mut f = File::create(dir.join(name)).unwrap();
        MmapTileHeader::new(blob.len() as u32, false)
            .write_to(&mut f)
            .unwrap();
        use std::io::Write;
        f.write_all(&blob).unwrap();
    }
}

#[test]
fn test_straight_path_over_open_map() {
    let dir = tempfile::tempdir().unwrap();
    write_map(dir.path(), 1, &[build_tile(0, 0, &|_, _| false)]);

    let mut mgr = MapSetManager::new(dir.path());
    // World x runs along mesh z, world y along mesh x; world z is up.
    let start = Vec3::new(0.5, 0.5, 0.0);
    let end = Vec3::new(7.5, 7.5, 0.0);

    let result = mgr.calculate_path(1, start, end, true).unwrap();
    assert_eq!(result.path_type, PathType::Normal);
    assert!(result.points.len() >= 2);
    assert_eq!(result.points[0], start);
    assert_eq!(*result.points.last().unwrap(), end);
    assert_eq!(result.actual_end, end);
}

#[test]
fn test_smooth_path_steps_along_surface() {
    let dir = tempfile::tempdir().unwrap();
    write_map(dir.path(), 2, &[build_tile(0, 0, &|_, _| false)]);

    let mut mgr = MapSetManager::new(dir.path());
    let start = Vec3::new(0.5, 0.5, 0.0);
    let end = Vec3::new(7.5, 7.5, 0.0);

    let result = mgr.calculate_path(2, start, end, false).unwrap();
    assert_eq!(result.path_type, PathType::Normal);
    assert!(result.points.len() > 2, "smoother emitted no waypoints");
    assert_eq!(result.points[0], start);
    assert_eq!(*result.points.last().unwrap(), end);

    // Steps never exceed the smoother's stride, and stay on the
    // surface.
    for w in result.points.windows(2) {
        assert!(w[0].distance(w[1]) <= SMOOTH_PATH_STEP_SIZE + 0.5);
    }
    for p in &result.points {
        assert!(p.z.abs() < 0.1, "waypoint {p} left the surface");
    }
}

#[test]
fn test_wall_detour_keeps_path_on_mesh() {
    // Wall across mesh x = 4 (world y), open only at the far end.
    let dir = tempfile::tempdir().unwrap();
    write_map(
        dir.path(),
        3,
        &[build_tile(0, 0, &|qx, qz| qx == 4 && qz != 7)],
    );

    let mut mgr = MapSetManager::new(dir.path());
    let start = Vec3::new(0.5, 0.5, 0.0);
    let end = Vec3::new(0.5, 7.5, 0.0);

    let result = mgr.calculate_path(3, start, end, false).unwrap();
    assert_eq!(result.path_type, PathType::Normal);
    // The detour passes the gap near world x = 7.5 (mesh z).
    assert!(
        result.points.iter().any(|p| p.x > 6.5),
        "path did not detour through the gap"
    );
}

#[test]
fn test_split_map_yields_incomplete_path() {
    // Full wall; destination unreachable.
    let dir = tempfile::tempdir().unwrap();
    write_map(dir.path(), 4, &[build_tile(0, 0, &|qx, _| qx == 4)]);

    let mut mgr = MapSetManager::new(dir.path());
    let start = Vec3::new(4.5, 0.5, 0.0);
    let end = Vec3::new(4.5, 7.5, 0.0);

    let result = mgr.calculate_path(4, start, end, false).unwrap();
    assert_eq!(result.path_type, PathType::Incomplete);
    // The reachable end stops at the near side of the wall.
    assert!(result.actual_end.y < 4.1);
    assert_eq!(*result.points.last().unwrap(), result.actual_end);
}

#[test]
fn test_endpoint_off_the_map_builds_shortcut() {
    let dir = tempfile::tempdir().unwrap();
    write_map(dir.path(), 5, &[build_tile(0, 0, &|_, _| false)]);

    let mut mgr = MapSetManager::new(dir.path());
    let start = Vec3::new(0.5, 0.5, 0.0);
    // Outside every tile.
    let end = Vec3::new(100.0, 100.0, 0.0);

    let result = mgr.calculate_path(5, start, end, false).unwrap();
    assert_eq!(result.path_type, PathType::Normal);
    assert_eq!(result.points, vec![start, end]);
}

#[test]
fn test_paths_cross_tile_boundary() {
    let dir = tempfile::tempdir().unwrap();
    write_map(
        dir.path(),
        6,
        &[build_tile(0, 0, &|_, _| false), build_tile(0, 1, &|_, _| false)],
    );

    let mut mgr = MapSetManager::new(dir.path());
    // Mesh z (world x) spans both tiles: 0..16.
    let start = Vec3::new(0.5, 4.5, 0.0);
    let end = Vec3::new(15.5, 4.5, 0.0);

    let result = mgr.calculate_path(6, start, end, false).unwrap();
    assert_eq!(result.path_type, PathType::Normal);
    assert_eq!(*result.points.last().unwrap(), end);

    // The second request reuses the memoized query and tiles.
    let again = mgr.calculate_path(6, end, start, true).unwrap();
    assert_eq!(again.path_type, PathType::Normal);
    assert_eq!(again.points[0], end);
}
