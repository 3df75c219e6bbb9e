//! Navigation mesh container
//!
//! Owns the tile table and the polygon adjacency graph. Tiles reference
//! each other only through packed [`PolyRef`] handles, so unloading a tile
//! invalidates stale handles by bumping the slot's salt.

use std::collections::HashMap;

use nav_common::{
    clamp, closest_height_point_triangle, distance_pt_poly_edges_sqr, ilog2, next_pow2,
    opposite_tile_side, overlap_bounds, sqr, vcopy, vdist_2d, vlerp, vmax, vmin,
};

use super::{
    PolyRef, PolyType, Status, StatusResult, TileRef, EXT_LINK, NULL_LINK, OFFMESH_CON_BIDIR,
    VERTS_PER_POLYGON,
};

/// Configuration of a navigation mesh, read from the map header file
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NavMeshParams {
    /// World-space origin of the tile grid
    pub origin: [f32; 3],
    /// Width of each tile along the x-axis
    pub tile_width: f32,
    /// Height of each tile along the z-axis
    pub tile_height: f32,
    /// Maximum number of tiles the mesh can hold
    pub max_tiles: i32,
    /// Maximum number of polygons per tile
    pub max_polys: i32,
}

/// Directed adjacency between two polygons
#[derive(Debug, Clone, Copy)]
pub struct Link {
    /// Polygon the link leads to
    pub target: PolyRef,
    /// Index of the next link in the owning polygon's list, [`NULL_LINK`]
    /// for the last
    pub next: u32,
    /// Polygon edge the link crosses; 0xff for links that do not cross an
    /// edge (landing links of off-mesh connections)
    pub edge: u8,
    /// Boundary side the link crosses, 0xff for internal links
    pub side: u8,
    /// Start of the usable sub-range of the edge, 0..255
    pub bmin: u8,
    /// End of the usable sub-range of the edge, 0..255
    pub bmax: u8,
}

impl Link {
    fn new() -> Self {
        Self {
            target: PolyRef::NULL,
            next: NULL_LINK,
            edge: 0,
            side: 0xff,
            bmin: 0,
            bmax: 0,
        }
    }
}

/// Polygon in a navigation mesh tile
#[derive(Debug, Clone)]
pub struct Poly {
    /// First link in the polygon's link list, [`NULL_LINK`] for none
    pub first_link: u32,
    /// Indices into the tile vertex array
    pub verts: [u16; VERTS_PER_POLYGON],
    /// Per-edge neighbor data: 0 for a wall, neighbor polygon index plus
    /// one for internal edges, [`EXT_LINK`] with a side code for tile
    /// boundary edges
    pub neis: [u16; VERTS_PER_POLYGON],
    /// Flags consumed by query filters
    pub flags: u16,
    /// Number of vertices used
    pub vert_count: u8,
    /// Area code, 0..63
    pub area: u8,
    /// Polygon classification
    pub poly_type: PolyType,
}

impl Poly {
    pub fn new(area: u8, poly_type: PolyType, flags: u16) -> Self {
        Self {
            first_link: NULL_LINK,
            verts: [0; VERTS_PER_POLYGON],
            neis: [0; VERTS_PER_POLYGON],
            flags,
            vert_count: 0,
            area,
            poly_type,
        }
    }
}

/// Per-polygon slice of the tile's detail triangulation
#[derive(Debug, Clone, Copy, Default)]
pub struct PolyDetail {
    /// First detail vertex
    pub vert_base: u32,
    /// First detail triangle
    pub tri_base: u32,
    /// Number of detail vertices
    pub vert_count: u8,
    /// Number of detail triangles
    pub tri_count: u8,
}

/// Node of the tile's bounding volume tree, quantized to 16 bits
#[derive(Debug, Clone, Copy, Default)]
pub struct BvNode {
    pub bmin: [u16; 3],
    pub bmax: [u16; 3],
    /// Polygon index for leaves, negative escape offset for internal
    /// nodes
    pub i: i32,
}

/// Two-point connection bridging polygons that do not share an edge
#[derive(Debug, Clone, Copy)]
pub struct OffMeshConnection {
    /// Endpoints, `[sx, sy, sz, ex, ey, ez]`
    pub pos: [f32; 6],
    /// Snap radius around the endpoints
    pub rad: f32,
    /// Index of the connection's polygon within the tile
    pub poly: u16,
    /// Direction flags; [`OFFMESH_CON_BIDIR`] for two-way traversal
    pub flags: u8,
    /// Boundary side the far endpoint lies beyond, 0xff for inside the
    /// tile
    pub side: u8,
    /// Id assigned by the tile builder
    pub user_id: u32,
}

/// Header of a loaded tile
#[derive(Debug, Clone, Copy)]
pub struct TileHeader {
    pub x: i32,
    pub y: i32,
    pub layer: i32,
    pub user_id: u32,
    pub poly_count: i32,
    pub vert_count: i32,
    pub max_link_count: i32,
    pub detail_mesh_count: i32,
    pub detail_vert_count: i32,
    pub detail_tri_count: i32,
    pub bv_node_count: i32,
    pub off_mesh_con_count: i32,
    /// Index of the first off-mesh connection polygon
    pub off_mesh_base: i32,
    pub walkable_height: f32,
    pub walkable_radius: f32,
    pub walkable_climb: f32,
    pub bmin: [f32; 3],
    pub bmax: [f32; 3],
    /// Factor quantizing world coordinates into the BV-tree's 16-bit
    /// space
    pub bv_quant_factor: f32,
}

/// One tile slot of the navigation mesh
///
/// A slot without a header is unused. The salt survives unload/load
/// cycles so stale refs into a reused slot fail validation.
#[derive(Debug, Clone)]
pub struct MeshTile {
    /// Generation counter for handle validation
    pub salt: u32,
    /// Slot index within the mesh
    pub index: usize,
    pub header: Option<TileHeader>,
    pub verts: Vec<f32>,
    pub polys: Vec<Poly>,
    pub links: Vec<Link>,
    pub detail_meshes: Vec<PolyDetail>,
    pub detail_verts: Vec<f32>,
    pub detail_tris: Vec<u8>,
    pub bv_tree: Vec<BvNode>,
    pub off_mesh_cons: Vec<OffMeshConnection>,
    /// Head of the free list inside `links`
    links_free_list: u32,
    /// Next free slot, when the slot is unused
    next_free: Option<usize>,
}

impl MeshTile {
    pub fn new() -> Self {
        Self {
            salt: 1,
            index: 0,
            header: None,
            verts: Vec::new(),
            polys: Vec::new(),
            links: Vec::new(),
            detail_meshes: Vec::new(),
            detail_verts: Vec::new(),
            detail_tris: Vec::new(),
            bv_tree: Vec::new(),
            off_mesh_cons: Vec::new(),
            links_free_list: NULL_LINK,
            next_free: None,
        }
    }

    /// Vertex position by vertex index
    #[inline]
    pub fn vert(&self, i: usize) -> &[f32] {
        &self.verts[i * 3..i * 3 + 3]
    }

    /// Grabs a link slot from the free list, growing the array when
    /// exhausted
    fn alloc_link(&mut self) -> u32 {
        if self.links_free_list != NULL_LINK {
            let idx = self.links_free_list;
            self.links_free_list = self.links[idx as usize].next;
            return idx;
        }
        self.links.push(Link::new());
        (self.links.len() - 1) as u32
    }

    /// Returns a link slot to the free list
    fn free_link(&mut self, idx: u32) {
        self.links[idx as usize].next = self.links_free_list;
        self.links[idx as usize].target = PolyRef::NULL;
        self.links_free_list = idx;
    }

    fn reset(&mut self) {
        self.header = None;
        self.verts = Vec::new();
        self.polys = Vec::new();
        self.links = Vec::new();
        self.detail_meshes = Vec::new();
        self.detail_verts = Vec::new();
        self.detail_tris = Vec::new();
        self.bv_tree = Vec::new();
        self.off_mesh_cons = Vec::new();
        self.links_free_list = NULL_LINK;
    }
}

impl Default for MeshTile {
    fn default() -> Self {
        Self::new()
    }
}

/// Parsed payload of one tile, ready to be added to a mesh
#[derive(Debug, Clone)]
pub struct TileData {
    pub header: TileHeader,
    pub verts: Vec<f32>,
    pub polys: Vec<Poly>,
    pub detail_meshes: Vec<PolyDetail>,
    pub detail_verts: Vec<f32>,
    pub detail_tris: Vec<u8>,
    pub bv_tree: Vec<BvNode>,
    pub off_mesh_cons: Vec<OffMeshConnection>,
}

/// Planned external link, collected before mutation
struct ExtLinkPlan {
    poly: usize,
    edge: u8,
    side: u8,
    target: PolyRef,
    bmin: u8,
    bmax: u8,
}

/// Tiled navigation mesh
pub struct NavMesh {
    params: NavMeshParams,
    origin: [f32; 3],
    tile_width: f32,
    tile_height: f32,
    max_tiles: usize,
    tiles: Vec<MeshTile>,
    /// Head of the free slot list
    free_list: Option<usize>,
    /// Slot indices per grid cell; stacked tiles share a cell
    pos_lookup: HashMap<(i32, i32), Vec<usize>>,
    salt_bits: u32,
    tile_bits: u32,
    poly_bits: u32,
}

impl NavMesh {
    /// Creates an empty mesh for the given parameters
    ///
    /// The [`PolyRef`] bit partition is fixed here: enough bits for the
    /// polygon and tile counts, the remainder as salt.
    pub fn new(params: &NavMeshParams) -> StatusResult<Self> {
        if !params.origin.iter().all(|v| v.is_finite()) {
            return Err(Status::FAILURE | Status::INVALID_PARAM);
        }
        if params.tile_width <= 0.0 || params.tile_height <= 0.0 {
            return Err(Status::FAILURE | Status::INVALID_PARAM);
        }
        if params.max_tiles <= 0 || params.max_polys <= 0 {
            return Err(Status::FAILURE | Status::INVALID_PARAM);
        }

        let tile_bits = ilog2(next_pow2(params.max_tiles as u32));
        let poly_bits = ilog2(next_pow2(params.max_polys as u32));
        let salt_bits = (64 - tile_bits - poly_bits).min(31);
        if salt_bits < 10 {
            return Err(Status::FAILURE | Status::INVALID_PARAM);
        }

        let max_tiles = params.max_tiles as usize;
        let mut tiles = Vec::with_capacity(max_tiles);
        for i in 0..max_tiles {
            let mut tile = MeshTile::new();
            tile.index = i;
            tile.next_free = if i + 1 < max_tiles { Some(i + 1) } else { None };
            tiles.push(tile);
        }

        Ok(Self {
            origin: params.origin,
            tile_width: params.tile_width,
            tile_height: params.tile_height,
            max_tiles,
            params: *params,
            tiles,
            free_list: Some(0),
            pos_lookup: HashMap::new(),
            salt_bits,
            tile_bits,
            poly_bits,
        })
    }

    /// Mesh parameters as given at creation
    pub fn params(&self) -> &NavMeshParams {
        &self.params
    }

    pub fn origin(&self) -> [f32; 3] {
        self.origin
    }

    pub fn tile_width(&self) -> f32 {
        self.tile_width
    }

    pub fn tile_height(&self) -> f32 {
        self.tile_height
    }

    pub fn max_tiles(&self) -> usize {
        self.max_tiles
    }

    // Handle packing

    #[inline]
    pub(crate) fn encode_poly_id(&self, salt: u32, it: u32, ip: u32) -> PolyRef {
        PolyRef(
            ((salt as u64) << (self.poly_bits + self.tile_bits))
                | ((it as u64) << self.poly_bits)
                | ip as u64,
        )
    }

    #[inline]
    pub(crate) fn decode_poly_id(&self, reference: PolyRef) -> (u32, u32, u32) {
        let salt_mask = (1u64 << self.salt_bits) - 1;
        let tile_mask = (1u64 << self.tile_bits) - 1;
        let poly_mask = (1u64 << self.poly_bits) - 1;
        let salt = ((reference.0 >> (self.poly_bits + self.tile_bits)) & salt_mask) as u32;
        let it = ((reference.0 >> self.poly_bits) & tile_mask) as u32;
        let ip = (reference.0 & poly_mask) as u32;
        (salt, it, ip)
    }

    /// Base reference of a tile: its ref with polygon index zero
    #[inline]
    pub fn get_poly_ref_base(&self, tile: &MeshTile) -> PolyRef {
        self.encode_poly_id(tile.salt, tile.index as u32, 0)
    }

    /// Handle of a loaded tile
    #[inline]
    pub fn get_tile_ref(&self, tile: &MeshTile) -> TileRef {
        TileRef(self.get_poly_ref_base(tile).0)
    }

    // Tile lookup

    /// Grid cell containing a world position
    pub fn calc_tile_loc(&self, pos: &[f32; 3]) -> (i32, i32) {
        let tx = ((pos[0] - self.origin[0]) / self.tile_width).floor() as i32;
        let ty = ((pos[2] - self.origin[2]) / self.tile_height).floor() as i32;
        (tx, ty)
    }

    /// Tile at the given grid cell and layer
    pub fn get_tile_at(&self, x: i32, y: i32, layer: i32) -> Option<&MeshTile> {
        let cell = self.pos_lookup.get(&(x, y))?;
        cell.iter()
            .map(|&i| &self.tiles[i])
            .find(|t| t.header.map_or(false, |h| h.layer == layer))
    }

    /// All tiles stacked in the given grid cell, up to `max_tiles` of
    /// them
    pub fn get_tiles_at(&self, x: i32, y: i32, max_tiles: usize) -> Vec<&MeshTile> {
        match self.pos_lookup.get(&(x, y)) {
            Some(cell) => cell
                .iter()
                .take(max_tiles)
                .map(|&i| &self.tiles[i])
                .collect(),
            None => Vec::new(),
        }
    }

    /// Tiles in the grid cells neighboring `(x, y)` on the given side
    fn get_neighbour_tiles_at(&self, x: i32, y: i32, side: u8, max_tiles: usize) -> Vec<&MeshTile> {
        let (nx, ny) = match side {
            0 => (x + 1, y),
            1 => (x + 1, y + 1),
            2 => (x, y + 1),
            3 => (x - 1, y + 1),
            4 => (x - 1, y),
            5 => (x - 1, y - 1),
            6 => (x, y - 1),
            7 => (x + 1, y - 1),
            _ => (x, y),
        };
        self.get_tiles_at(nx, ny, max_tiles)
    }

    /// Tile slot by index
    pub fn tile(&self, index: usize) -> Option<&MeshTile> {
        let t = self.tiles.get(index)?;
        t.header.map(|_| t)
    }

    /// Tile by handle
    pub fn get_tile_by_ref(&self, reference: TileRef) -> Option<&MeshTile> {
        if reference.is_null() {
            return None;
        }
        let (salt, it, _) = self.decode_poly_id(PolyRef(reference.0));
        let tile = self.tiles.get(it as usize)?;
        if tile.salt != salt || tile.header.is_none() {
            return None;
        }
        Some(tile)
    }

    /// Validates a polygon handle against the current tile table
    pub fn is_valid_poly_ref(&self, reference: PolyRef) -> bool {
        if reference.is_null() {
            return false;
        }
        let (salt, it, ip) = self.decode_poly_id(reference);
        let Some(tile) = self.tiles.get(it as usize) else {
            return false;
        };
        if tile.salt != salt {
            return false;
        }
        match tile.header {
            Some(h) => (ip as i32) < h.poly_count,
            None => false,
        }
    }

    /// Resolves a polygon handle, validating salt and indices
    pub fn get_tile_and_poly_by_ref(&self, reference: PolyRef) -> StatusResult<(&MeshTile, &Poly)> {
        if reference.is_null() {
            return Err(Status::FAILURE | Status::INVALID_PARAM);
        }
        let (salt, it, ip) = self.decode_poly_id(reference);
        let tile = self
            .tiles
            .get(it as usize)
            .ok_or(Status::FAILURE | Status::INVALID_PARAM)?;
        if tile.salt != salt {
            return Err(Status::FAILURE | Status::INVALID_PARAM);
        }
        let header = tile
            .header
            .as_ref()
            .ok_or(Status::FAILURE | Status::INVALID_PARAM)?;
        if ip as i32 >= header.poly_count {
            return Err(Status::FAILURE | Status::INVALID_PARAM);
        }
        Ok((tile, &tile.polys[ip as usize]))
    }

    /// Resolves a polygon handle without validation
    ///
    /// Only call with a handle that passed a validity check against this
    /// mesh earlier in the same operation.
    #[inline]
    pub fn get_tile_and_poly_by_ref_unchecked(&self, reference: PolyRef) -> (&MeshTile, &Poly) {
        let (_, it, ip) = self.decode_poly_id(reference);
        let tile = &self.tiles[it as usize];
        (tile, &tile.polys[ip as usize])
    }

    // Tile management

    /// Adds a parsed tile to the mesh, wiring internal, boundary and
    /// off-mesh links
    pub fn add_tile(&mut self, data: TileData) -> StatusResult<TileRef> {
        let header = data.header;
        if header.poly_count as usize != data.polys.len()
            || header.vert_count as usize * 3 != data.verts.len()
        {
            return Err(Status::FAILURE | Status::INVALID_PARAM);
        }

        // Reject duplicate locations.
        if self
            .get_tile_at(header.x, header.y, header.layer)
            .is_some()
        {
            return Err(Status::FAILURE | Status::ALREADY_OCCUPIED);
        }

        let Some(slot) = self.free_list else {
            return Err(Status::FAILURE | Status::OUT_OF_MEMORY);
        };
        self.free_list = self.tiles[slot].next_free;
        self.tiles[slot].next_free = None;

        {
            let tile = &mut self.tiles[slot];
            tile.header = Some(header);
            tile.verts = data.verts;
            tile.polys = data.polys;
            tile.links = Vec::with_capacity(header.max_link_count.max(0) as usize);
            tile.detail_meshes = data.detail_meshes;
            tile.detail_verts = data.detail_verts;
            tile.detail_tris = data.detail_tris;
            tile.bv_tree = data.bv_tree;
            tile.off_mesh_cons = data.off_mesh_cons;
            tile.links_free_list = NULL_LINK;
        }

        self.pos_lookup
            .entry((header.x, header.y))
            .or_default()
            .push(slot);

        // Build links within the tile, including connections landing in
        // their own tile.
        self.connect_int_links(slot);
        self.base_off_mesh_links(slot);
        self.connect_ext_off_mesh_links(slot, slot, None);

        // Connect with layers in the current cell.
        let same_cell: Vec<usize> = self
            .get_tiles_at(header.x, header.y, 32)
            .iter()
            .map(|t| t.index)
            .filter(|&i| i != slot)
            .collect();
        for nei in same_cell {
            self.connect_ext_links(slot, nei, None);
            self.connect_ext_links(nei, slot, None);
            self.connect_ext_off_mesh_links(slot, nei, None);
            self.connect_ext_off_mesh_links(nei, slot, None);
        }

        // Connect with neighbour tiles on all 8 sides.
        for side in 0..8u8 {
            let neis: Vec<usize> = self
                .get_neighbour_tiles_at(header.x, header.y, side, 32)
                .iter()
                .map(|t| t.index)
                .collect();
            for nei in neis {
                self.connect_ext_links(slot, nei, Some(side));
                self.connect_ext_links(nei, slot, Some(opposite_tile_side(side)));
                self.connect_ext_off_mesh_links(slot, nei, Some(side));
                self.connect_ext_off_mesh_links(nei, slot, Some(opposite_tile_side(side)));
            }
        }

        Ok(self.get_tile_ref(&self.tiles[slot]))
    }

    /// Removes a tile, unlinking it from its neighbors and bumping the
    /// slot salt
    pub fn remove_tile(&mut self, reference: TileRef) -> StatusResult<()> {
        if reference.is_null() {
            return Err(Status::FAILURE | Status::INVALID_PARAM);
        }
        let (salt, it, _) = self.decode_poly_id(PolyRef(reference.0));
        let slot = it as usize;
        if slot >= self.max_tiles {
            return Err(Status::FAILURE | Status::INVALID_PARAM);
        }
        let (x, y) = {
            let tile = &self.tiles[slot];
            if tile.salt != salt {
                return Err(Status::FAILURE | Status::INVALID_PARAM);
            }
            let Some(h) = tile.header else {
                return Err(Status::FAILURE | Status::INVALID_PARAM);
            };
            (h.x, h.y)
        };

        // Remove from the grid cell.
        if let Some(cell) = self.pos_lookup.get_mut(&(x, y)) {
            cell.retain(|&i| i != slot);
            if cell.is_empty() {
                self.pos_lookup.remove(&(x, y));
            }
        }

        // Drop links pointing at this tile from stacked and adjacent
        // neighbors.
        let mut neighbors: Vec<usize> = self
            .get_tiles_at(x, y, 32)
            .iter()
            .map(|t| t.index)
            .collect();
        for side in 0..8u8 {
            neighbors.extend(
                self.get_neighbour_tiles_at(x, y, side, 32)
                    .iter()
                    .map(|t| t.index),
            );
        }
        for nei in neighbors {
            if nei != slot {
                self.unconnect_links(nei, slot);
            }
        }

        let tile = &mut self.tiles[slot];
        tile.reset();

        // Invalidate outstanding refs into the slot.
        tile.salt = (tile.salt + 1) & ((1 << self.salt_bits) - 1);
        if tile.salt == 0 {
            tile.salt += 1;
        }

        tile.next_free = self.free_list;
        self.free_list = Some(slot);

        Ok(())
    }

    /// Endpoints of an off-mesh connection, ordered for travel out of
    /// `prev_ref`
    pub fn get_off_mesh_connection_poly_end_points(
        &self,
        prev_ref: PolyRef,
        poly_ref: PolyRef,
    ) -> StatusResult<([f32; 3], [f32; 3])> {
        let (tile, poly) = self.get_tile_and_poly_by_ref(poly_ref)?;
        if poly.poly_type != PolyType::OffMeshConnection {
            return Err(Status::FAILURE | Status::INVALID_PARAM);
        }

        // The connection is entered from its first vertex unless we came
        // from the polygon its second vertex lands on.
        let (mut idx0, mut idx1) = (0usize, 1usize);
        let mut i = poly.first_link;
        while i != NULL_LINK {
            if tile.links[i as usize].target == prev_ref {
                idx0 = 1;
                idx1 = 0;
                break;
            }
            i = tile.links[i as usize].next;
        }

        let mut start = [0.0f32; 3];
        let mut end = [0.0f32; 3];
        vcopy(&mut start, tile.vert(poly.verts[idx0] as usize));
        vcopy(&mut end, tile.vert(poly.verts[idx1] as usize));
        Ok((start, end))
    }

    // Link wiring

    /// Builds links for edges shared between polygons of one tile
    fn connect_int_links(&mut self, slot: usize) {
        let base = self.get_poly_ref_base(&self.tiles[slot]);
        let tile = &mut self.tiles[slot];
        let poly_count = tile.polys.len();

        for i in 0..poly_count {
            tile.polys[i].first_link = NULL_LINK;
            if tile.polys[i].poly_type == PolyType::OffMeshConnection {
                continue;
            }

            // Build links backwards so the list runs from the lowest
            // edge index to the highest.
            for j in (0..tile.polys[i].vert_count as usize).rev() {
                let nei = tile.polys[i].neis[j];
                if nei == 0 || (nei & EXT_LINK) != 0 {
                    continue;
                }
                let idx = tile.alloc_link();
                let link = &mut tile.links[idx as usize];
                link.target = PolyRef(base.0 | (nei as u64 - 1));
                link.edge = j as u8;
                link.side = 0xff;
                link.bmin = 0;
                link.bmax = 0;
                link.next = tile.polys[i].first_link;
                tile.polys[i].first_link = idx;
            }
        }
    }

    /// Connects the start side of each off-mesh connection to the ground
    /// polygon it stands on
    fn base_off_mesh_links(&mut self, slot: usize) {
        let base = self.get_poly_ref_base(&self.tiles[slot]);
        let con_count = self.tiles[slot].off_mesh_cons.len();

        for ci in 0..con_count {
            let (con_poly, rad, start_pos) = {
                let con = &self.tiles[slot].off_mesh_cons[ci];
                (
                    con.poly as usize,
                    con.rad,
                    [con.pos[0], con.pos[1], con.pos[2]],
                )
            };
            let climb = self.tiles[slot].header.map(|h| h.walkable_climb).unwrap_or(0.0);
            let ext = [rad, climb, rad];

            let (nearest_ref, nearest_pt) =
                self.find_nearest_poly_in_tile(slot, &start_pos, &ext);
            if nearest_ref.is_null() {
                continue;
            }
            // The nearest-point search is box-based; enforce the radius.
            if sqr(nearest_pt[0] - start_pos[0]) + sqr(nearest_pt[2] - start_pos[2]) > sqr(rad) {
                continue;
            }

            let (_, _, land_poly_idx) = self.decode_poly_id(nearest_ref);

            let tile = &mut self.tiles[slot];

            // Snap the connection's start vertex onto the mesh.
            let v = tile.polys[con_poly].verts[0] as usize * 3;
            tile.verts[v] = nearest_pt[0];
            tile.verts[v + 1] = nearest_pt[1];
            tile.verts[v + 2] = nearest_pt[2];

            // Connection to ground.
            let idx = tile.alloc_link();
            {
                let link = &mut tile.links[idx as usize];
                link.target = nearest_ref;
                link.edge = 0;
                link.side = 0xff;
                link.bmin = 0;
                link.bmax = 0;
                link.next = tile.polys[con_poly].first_link;
            }
            tile.polys[con_poly].first_link = idx;

            // Ground back to connection.
            let tidx = tile.alloc_link();
            {
                let link = &mut tile.links[tidx as usize];
                link.target = PolyRef(base.0 | con_poly as u64);
                link.edge = 0xff;
                link.side = 0xff;
                link.bmin = 0;
                link.bmax = 0;
                link.next = tile.polys[land_poly_idx as usize].first_link;
            }
            tile.polys[land_poly_idx as usize].first_link = tidx;
        }
    }

    /// Connects boundary edges of `slot` to polygons of `target`
    ///
    /// `side` limits the wiring to one boundary direction; `None` matches
    /// every direction (stacked tiles in the same cell).
    fn connect_ext_links(&mut self, slot: usize, target: usize, side: Option<u8>) {
        if self.tiles[slot].header.is_none() || self.tiles[target].header.is_none() {
            return;
        }

        let mut plans: Vec<ExtLinkPlan> = Vec::new();

        {
            let tile = &self.tiles[slot];
            for (pi, poly) in tile.polys.iter().enumerate() {
                let nv = poly.vert_count as usize;
                for j in 0..nv {
                    if (poly.neis[j] & EXT_LINK) == 0 {
                        continue;
                    }
                    let dir = (poly.neis[j] & 0xff) as u8;
                    if let Some(s) = side {
                        if dir != s {
                            continue;
                        }
                    }

                    let va = tile.vert(poly.verts[j] as usize);
                    let vb = tile.vert(poly.verts[(j + 1) % nv] as usize);
                    let connecting =
                        self.find_connecting_polys(va, vb, target, opposite_tile_side(dir));

                    for (nei_ref, span) in connecting {
                        // Compress the connected portion of the edge to
                        // byte range.
                        let (bmin, bmax) = if dir == 0 || dir == 4 {
                            let mut tmin = (span[0] - va[2]) / (vb[2] - va[2]);
                            let mut tmax = (span[1] - va[2]) / (vb[2] - va[2]);
                            if tmin > tmax {
                                std::mem::swap(&mut tmin, &mut tmax);
                            }
                            (
                                (clamp(tmin, 0.0, 1.0) * 255.0) as u8,
                                (clamp(tmax, 0.0, 1.0) * 255.0) as u8,
                            )
                        } else if dir == 2 || dir == 6 {
                            let mut tmin = (span[0] - va[0]) / (vb[0] - va[0]);
                            let mut tmax = (span[1] - va[0]) / (vb[0] - va[0]);
                            if tmin > tmax {
                                std::mem::swap(&mut tmin, &mut tmax);
                            }
                            (
                                (clamp(tmin, 0.0, 1.0) * 255.0) as u8,
                                (clamp(tmax, 0.0, 1.0) * 255.0) as u8,
                            )
                        } else {
                            (0, 255)
                        };

                        plans.push(ExtLinkPlan {
                            poly: pi,
                            edge: j as u8,
                            side: dir,
                            target: nei_ref,
                            bmin,
                            bmax,
                        });
                    }
                }
            }
        }

        let tile = &mut self.tiles[slot];
        for plan in plans {
            let idx = tile.alloc_link();
            let link = &mut tile.links[idx as usize];
            link.target = plan.target;
            link.edge = plan.edge;
            link.side = plan.side;
            link.bmin = plan.bmin;
            link.bmax = plan.bmax;
            link.next = tile.polys[plan.poly].first_link;
            tile.polys[plan.poly].first_link = idx;
        }
    }

    /// Connects off-mesh connections of `target` that land inside `slot`
    fn connect_ext_off_mesh_links(&mut self, slot: usize, target: usize, side: Option<u8>) {
        if self.tiles[slot].header.is_none() || self.tiles[target].header.is_none() {
            return;
        }

        let opposite = side.map(opposite_tile_side).unwrap_or(0xff);
        let link_side = side.unwrap_or(0xff);
        let target_base = self.get_poly_ref_base(&self.tiles[target]);
        let con_count = self.tiles[target].off_mesh_cons.len();

        for ci in 0..con_count {
            let (con_poly, rad, end_pos, con_side, con_flags) = {
                let con = &self.tiles[target].off_mesh_cons[ci];
                (
                    con.poly as usize,
                    con.rad,
                    [con.pos[3], con.pos[4], con.pos[5]],
                    con.side,
                    con.flags,
                )
            };
            if con_side != opposite {
                continue;
            }
            // Skip connections whose start never linked to the ground.
            if self.tiles[target].polys[con_poly].first_link == NULL_LINK {
                continue;
            }

            let climb = self.tiles[target]
                .header
                .map(|h| h.walkable_climb)
                .unwrap_or(0.0);
            let ext = [rad, climb, rad];
            let (nearest_ref, nearest_pt) = self.find_nearest_poly_in_tile(slot, &end_pos, &ext);
            if nearest_ref.is_null() {
                continue;
            }
            if sqr(nearest_pt[0] - end_pos[0]) + sqr(nearest_pt[2] - end_pos[2]) > sqr(rad) {
                continue;
            }

            // Snap the landing vertex onto the target mesh.
            {
                let target_tile = &mut self.tiles[target];
                let v = target_tile.polys[con_poly].verts[1] as usize * 3;
                target_tile.verts[v] = nearest_pt[0];
                target_tile.verts[v + 1] = nearest_pt[1];
                target_tile.verts[v + 2] = nearest_pt[2];
            }

            // Connection to the landing polygon.
            {
                let target_tile = &mut self.tiles[target];
                let idx = target_tile.alloc_link();
                let link = &mut target_tile.links[idx as usize];
                link.target = nearest_ref;
                link.edge = 1;
                link.side = link_side;
                link.bmin = 0;
                link.bmax = 0;
                link.next = target_tile.polys[con_poly].first_link;
                target_tile.polys[con_poly].first_link = idx;
            }

            // Landing polygon back to the connection when bidirectional.
            if (con_flags & OFFMESH_CON_BIDIR) != 0 {
                let (_, _, land_idx) = self.decode_poly_id(nearest_ref);
                let tile = &mut self.tiles[slot];
                let idx = tile.alloc_link();
                let link = &mut tile.links[idx as usize];
                link.target = PolyRef(target_base.0 | con_poly as u64);
                link.edge = 0xff;
                link.side = opposite;
                link.bmin = 0;
                link.bmax = 0;
                link.next = tile.polys[land_idx as usize].first_link;
                tile.polys[land_idx as usize].first_link = idx;
            }
        }
    }

    /// Removes every link of `slot` that points into `target`
    fn unconnect_links(&mut self, slot: usize, target: usize) {
        if self.tiles[slot].header.is_none() {
            return;
        }
        let target_num = target as u32;
        let tile = &mut self.tiles[slot];
        let poly_count = tile.polys.len();
        let tile_mask = (1u64 << self.tile_bits) - 1;

        for i in 0..poly_count {
            let mut j = tile.polys[i].first_link;
            let mut pj = NULL_LINK;
            while j != NULL_LINK {
                let link_tile =
                    ((tile.links[j as usize].target.0 >> self.poly_bits) & tile_mask) as u32;
                if link_tile == target_num {
                    let nj = tile.links[j as usize].next;
                    if pj == NULL_LINK {
                        tile.polys[i].first_link = nj;
                    } else {
                        tile.links[pj as usize].next = nj;
                    }
                    tile.free_link(j);
                    j = nj;
                } else {
                    pj = j;
                    j = tile.links[j as usize].next;
                }
            }
        }
    }

    /// Finds border polygons of `target` whose edge overlaps the segment
    /// `[va, vb]` on the given side
    ///
    /// Returns the matching polygon refs with the overlapping coordinate
    /// span of each.
    fn find_connecting_polys(
        &self,
        va: &[f32],
        vb: &[f32],
        target: usize,
        side: u8,
    ) -> Vec<(PolyRef, [f32; 2])> {
        let tile = &self.tiles[target];
        let Some(header) = tile.header else {
            return Vec::new();
        };

        let mut amin = [0.0f32; 2];
        let mut amax = [0.0f32; 2];
        calc_slab_end_points(va, vb, &mut amin, &mut amax, side);
        let apos = get_slab_coord(va, side);

        let m = EXT_LINK | side as u16;
        let base = self.get_poly_ref_base(tile);
        let mut out = Vec::new();

        for (i, poly) in tile.polys.iter().enumerate() {
            let nv = poly.vert_count as usize;
            for j in 0..nv {
                if poly.neis[j] != m {
                    continue;
                }
                let vc = tile.vert(poly.verts[j] as usize);
                let vd = tile.vert(poly.verts[(j + 1) % nv] as usize);
                let bpos = get_slab_coord(vc, side);

                // Segments are not in the same boundary plane.
                if (apos - bpos).abs() > 0.01 {
                    continue;
                }

                let mut bmin = [0.0f32; 2];
                let mut bmax = [0.0f32; 2];
                calc_slab_end_points(vc, vd, &mut bmin, &mut bmax, side);

                if !overlap_slabs(&amin, &amax, &bmin, &bmax, 0.01, header.walkable_climb) {
                    continue;
                }

                out.push((
                    PolyRef(base.0 | i as u64),
                    [amin[0].max(bmin[0]), amax[0].min(bmax[0])],
                ));
                break;
            }
        }
        out
    }

    // Local spatial queries used while wiring off-mesh connections

    /// Nearest polygon of one tile to a point, searching a box around it
    fn find_nearest_poly_in_tile(
        &self,
        slot: usize,
        center: &[f32; 3],
        half_extents: &[f32; 3],
    ) -> (PolyRef, [f32; 3]) {
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

        let polys = self.query_polygons_in_tile_local(slot, &bmin, &bmax);

        let mut nearest = PolyRef::NULL;
        let mut nearest_pt = [0.0f32; 3];
        let mut nearest_dist = f32::MAX;
        for ref_ in polys {
            let (_, _, ip) = self.decode_poly_id(ref_);
            let (pt, _) = self.closest_point_on_poly_in_tile(&self.tiles[slot], ip as usize, center);
            let d = nav_common::vdist_sqr(center, &pt);
            if d < nearest_dist {
                nearest_pt = pt;
                nearest_dist = d;
                nearest = ref_;
            }
        }
        (nearest, nearest_pt)
    }

    /// Ground polygons of one tile intersecting a bounding box; linear
    /// scan, used only during tile wiring
    fn query_polygons_in_tile_local(
        &self,
        slot: usize,
        qmin: &[f32; 3],
        qmax: &[f32; 3],
    ) -> Vec<PolyRef> {
        let tile = &self.tiles[slot];
        let base = self.get_poly_ref_base(tile);
        let mut out = Vec::new();

        for (i, poly) in tile.polys.iter().enumerate() {
            if poly.poly_type == PolyType::OffMeshConnection {
                continue;
            }
            let v = tile.vert(poly.verts[0] as usize);
            let mut bmin = [v[0], v[1], v[2]];
            let mut bmax = bmin;
            for j in 1..poly.vert_count as usize {
                let v = tile.vert(poly.verts[j] as usize);
                vmin(&mut bmin, v);
                vmax(&mut bmax, v);
            }
            if overlap_bounds(qmin, qmax, &bmin, &bmax) {
                out.push(PolyRef(base.0 | i as u64));
            }
        }
        out
    }

    /// Closest point on one polygon of a tile, with the detail-mesh
    /// height applied when the point projects onto it
    pub(crate) fn closest_point_on_poly_in_tile(
        &self,
        tile: &MeshTile,
        ip: usize,
        pos: &[f32; 3],
    ) -> ([f32; 3], bool) {
        let poly = &tile.polys[ip];

        // Off-mesh connections collapse to the segment between their
        // endpoints.
        if poly.poly_type == PolyType::OffMeshConnection {
            let v0 = tile.vert(poly.verts[0] as usize);
            let v1 = tile.vert(poly.verts[1] as usize);
            let d0 = nav_common::vdist(pos, v0);
            let d1 = nav_common::vdist(pos, v1);
            let u = d0 / (d0 + d1);
            let mut closest = [0.0f32; 3];
            vlerp(&mut closest, v0, v1, u);
            return (closest, false);
        }

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

        let mut closest = *pos;
        let inside = distance_pt_poly_edges_sqr(pos, &verts, nv, &mut edged, &mut edget);
        if !inside {
            // Clamp to the nearest edge.
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
            let mut c = [0.0f32; 3];
            vlerp(&mut c, va, vb, edget[imin]);
            closest = c;
        }

        // Project onto the detail surface.
        if let Some(detail) = tile.detail_meshes.get(ip) {
            for j in 0..detail.tri_count as usize {
                let t = &tile.detail_tris[(detail.tri_base as usize + j) * 4..];
                let mut tri = [[0.0f32; 3]; 3];
                for k in 0..3 {
                    let vi = t[k] as usize;
                    let v = if vi < poly.vert_count as usize {
                        tile.vert(poly.verts[vi] as usize)
                    } else {
                        let di = detail.vert_base as usize + (vi - poly.vert_count as usize);
                        &tile.detail_verts[di * 3..di * 3 + 3]
                    };
                    tri[k] = [v[0], v[1], v[2]];
                }
                if let Some(h) = closest_height_point_triangle(&closest, &tri[0], &tri[1], &tri[2])
                {
                    closest[1] = h;
                    break;
                }
            }
        }

        (closest, inside)
    }

    /// Height of the polygon surface under a position, from the detail
    /// mesh
    pub(crate) fn get_poly_height_in_tile(
        &self,
        tile: &MeshTile,
        ip: usize,
        pos: &[f32; 3],
    ) -> Option<f32> {
        let poly = &tile.polys[ip];

        if poly.poly_type == PolyType::OffMeshConnection {
            let v0 = tile.vert(poly.verts[0] as usize);
            let v1 = tile.vert(poly.verts[1] as usize);
            let d0 = vdist_2d(pos, v0);
            let d1 = vdist_2d(pos, v1);
            let u = d0 / (d0 + d1);
            return Some(v0[1] + (v1[1] - v0[1]) * u);
        }

        let detail = tile.detail_meshes.get(ip)?;
        for j in 0..detail.tri_count as usize {
            let t = &tile.detail_tris[(detail.tri_base as usize + j) * 4..];
            let mut tri = [[0.0f32; 3]; 3];
            for k in 0..3 {
                let vi = t[k] as usize;
                let v = if vi < poly.vert_count as usize {
                    tile.vert(poly.verts[vi] as usize)
                } else {
                    let di = detail.vert_base as usize + (vi - poly.vert_count as usize);
                    &tile.detail_verts[di * 3..di * 3 + 3]
                };
                tri[k] = [v[0], v[1], v[2]];
            }
            if let Some(h) = closest_height_point_triangle(pos, &tri[0], &tri[1], &tri[2]) {
                return Some(h);
            }
        }
        None
    }
}

// Boundary slab matching.
//
// Edges on a tile boundary are compared as 1D spans along the boundary
// (x for north/south sides, z for east/west) plus height, so tiles baked
// at different resolutions still connect across the shared border.

fn get_slab_coord(va: &[f32], side: u8) -> f32 {
    if side == 0 || side == 4 {
        va[0]
    } else if side == 2 || side == 6 {
        va[2]
    } else {
        0.0
    }
}

fn calc_slab_end_points(va: &[f32], vb: &[f32], bmin: &mut [f32; 2], bmax: &mut [f32; 2], side: u8) {
    if side == 0 || side == 4 {
        if va[2] < vb[2] {
            bmin[0] = va[2];
            bmin[1] = va[1];
            bmax[0] = vb[2];
            bmax[1] = vb[1];
        } else {
            bmin[0] = vb[2];
            bmin[1] = vb[1];
            bmax[0] = va[2];
            bmax[1] = va[1];
        }
    } else if side == 2 || side == 6 {
        if va[0] < vb[0] {
            bmin[0] = va[0];
            bmin[1] = va[1];
            bmax[0] = vb[0];
            bmax[1] = vb[1];
        } else {
            bmin[0] = vb[0];
            bmin[1] = vb[1];
            bmax[0] = va[0];
            bmax[1] = va[1];
        }
    }
}

fn overlap_slabs(amin: &[f32; 2], amax: &[f32; 2], bmin: &[f32; 2], bmax: &[f32; 2], px: f32, py: f32) -> bool {
    // Check horizontal overlap, slightly shrunken to avoid touching
    // endpoints counting as overlap.
    let minx = (amin[0] + px).max(bmin[0] + px);
    let maxx = (amax[0] - px).min(bmax[0] - px);
    if minx > maxx {
        return false;
    }

    // Interpolate both segment heights at the overlap bounds.
    let ad = (amax[1] - amin[1]) / (amax[0] - amin[0]);
    let ak = amin[1] - ad * amin[0];
    let bd = (bmax[1] - bmin[1]) / (bmax[0] - bmin[0]);
    let bk = bmin[1] - bd * bmin[0];
    let aminy = ad * minx + ak;
    let amaxy = ad * maxx + ak;
    let bminy = bd * minx + bk;
    let bmaxy = bd * maxx + bk;
    let dmin = bminy - aminy;
    let dmax = bmaxy - amaxy;

    // Crossing segments always overlap.
    if dmin * dmax < 0.0 {
        return true;
    }

    // Otherwise the endpoints must be within climbing reach.
    let thr = sqr(py * 2.0);
    dmin * dmin <= thr || dmax * dmax <= thr
}
