//! Programmatic tile builders for tests
//!
//! Builds square grids of 1x1 quads in mesh space so scenarios can
//! construct meshes without tile files. Quad vertices are wound the way
//! the tile baker outputs them (fan triangles with positive area).

use std::collections::HashMap;
use std::sync::Arc;

use super::nav_mesh::{NavMesh, NavMeshParams, OffMeshConnection, Poly, PolyDetail, TileData, TileHeader};
use super::{NavMeshQuery, PolyRef, PolyType, QueryFilter, StandardFilter, EXT_LINK};

/// Flags set on every walkable test polygon
pub const TEST_WALKABLE: u16 = 0x01;

/// Mesh parameters for a world of `n`-by-`n` unit tiles
pub fn grid_params(n: usize) -> NavMeshParams {
    NavMeshParams {
        origin: [0.0, 0.0, 0.0],
        tile_width: n as f32,
        tile_height: n as f32,
        max_tiles: 16,
        max_polys: 1024,
    }
}

/// Builds one tile at grid cell `(tx, ty)` holding an `n`-by-`n` quad
/// grid, skipping cells where `skip` returns true
///
/// Boundary edges carry portal markers so adjacent tiles stitch when
/// added to the same mesh.
pub fn build_grid_tile(
    n: usize,
    tx: i32,
    ty: i32,
    skip: &dyn Fn(usize, usize) -> bool,
) -> TileData {
    let ox = tx as f32 * n as f32;
    let oz = ty as f32 * n as f32;

    // Shared vertex grid.
    let side = n + 1;
    let mut verts = Vec::with_capacity(side * side * 3);
    for z in 0..side {
        for x in 0..side {
            verts.push(ox + x as f32);
            verts.push(0.0);
            verts.push(oz + z as f32);
        }
    }
    let vid = |x: usize, z: usize| (z * side + x) as u16;

    // Map surviving cells to polygon indices.
    let mut cell_poly = HashMap::new();
    for qz in 0..n {
        for qx in 0..n {
            if !skip(qx, qz) {
                let idx = cell_poly.len();
                cell_poly.insert((qx, qz), idx);
            }
        }
    }

    let mut polys = Vec::with_capacity(cell_poly.len());
    let mut detail_meshes = Vec::with_capacity(cell_poly.len());
    let mut detail_tris = Vec::new();

    for qz in 0..n {
        for qx in 0..n {
            if skip(qx, qz) {
                continue;
            }

            let mut poly = Poly::new(0, PolyType::Ground, TEST_WALKABLE);
            poly.vert_count = 4;
            poly.verts = [
                vid(qx, qz),
                vid(qx, qz + 1),
                vid(qx + 1, qz + 1),
                vid(qx + 1, qz),
                0,
                0,
            ];

            // Edge 0 runs along x = qx, edge 1 along z = qz + 1,
            // edge 2 along x = qx + 1, edge 3 along z = qz.
            let neighbors = [
                (qx.checked_sub(1).map(|x| (x, qz)), 4u16),
                (if qz + 1 < n { Some((qx, qz + 1)) } else { None }, 2),
                (if qx + 1 < n { Some((qx + 1, qz)) } else { None }, 0),
                (qz.checked_sub(1).map(|z| (qx, z)), 6),
            ];

            for (j, (cell, side_code)) in neighbors.iter().enumerate() {
                poly.neis[j] = match cell {
                    Some(c) => match cell_poly.get(c) {
                        Some(&idx) => idx as u16 + 1,
                        None => 0,
                    },
                    // Tile border edge; marked for stitching.
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

/// Mesh holding a single `n`-by-`n` grid tile
pub fn single_tile_mesh(n: usize, skip: &dyn Fn(usize, usize) -> bool) -> Arc<NavMesh> {
    let mut mesh = NavMesh::new(&grid_params(n)).unwrap();
    mesh.add_tile(build_grid_tile(n, 0, 0, skip)).unwrap();
    Arc::new(mesh)
}

/// Mesh holding a full grid tile at every listed cell
pub fn multi_tile_mesh(n: usize, cells: &[(i32, i32)]) -> Arc<NavMesh> {
    let mut mesh = NavMesh::new(&grid_params(n)).unwrap();
    for &(tx, ty) in cells {
        mesh.add_tile(build_grid_tile(n, tx, ty, &|_, _| false))
            .unwrap();
    }
    Arc::new(mesh)
}

/// Appends an off-mesh connection between two points to a grid tile
///
/// Adds the two endpoint vertices and the degenerate two-vertex polygon
/// the connection travels through.
pub fn add_off_mesh_connection(data: &mut TileData, start: [f32; 3], end: [f32; 3], rad: f32) {
    let vert_base = (data.verts.len() / 3) as u16;
    data.verts.extend_from_slice(&start);
    data.verts.extend_from_slice(&end);

    let mut poly = Poly::new(0, PolyType::OffMeshConnection, TEST_WALKABLE);
    poly.vert_count = 2;
    poly.verts[0] = vert_base;
    poly.verts[1] = vert_base + 1;
    let poly_idx = data.polys.len() as u16;
    data.polys.push(poly);

    data.off_mesh_cons.push(OffMeshConnection {
        pos: [start[0], start[1], start[2], end[0], end[1], end[2]],
        rad,
        poly: poly_idx,
        flags: super::OFFMESH_CON_BIDIR,
        side: 0xff,
        user_id: 0,
    });

    data.header.poly_count = data.polys.len() as i32;
    data.header.vert_count = (data.verts.len() / 3) as i32;
    data.header.off_mesh_con_count = data.off_mesh_cons.len() as i32;
    data.header.max_link_count += 4;
}

/// Query plus default filter over a mesh
pub fn query_for(mesh: &Arc<NavMesh>) -> (NavMeshQuery, StandardFilter) {
    (
        NavMeshQuery::new(Arc::clone(mesh), 2048).unwrap(),
        StandardFilter::default(),
    )
}

/// Ref of the polygon under a point, panicking when none is close
pub fn poly_at(query: &NavMeshQuery, filter: &dyn QueryFilter, pos: [f32; 3]) -> PolyRef {
    let (nearest, _) = query
        .find_nearest_poly(&pos, &[0.4, 1.0, 0.4], filter)
        .unwrap();
    assert!(!nearest.is_null(), "no polygon under {pos:?}");
    nearest
}
