//! Tiled navigation mesh container and query engine
//!
//! A navigation mesh is a set of convex polygons describing the walkable
//! surface of a world, partitioned into square tiles that can be loaded and
//! unloaded independently. [`NavMesh`] owns the tiles and the adjacency
//! graph between their polygons; [`NavMeshQuery`] runs graph searches
//! (A*, Dijkstra expansion, raycasts, string pulling) over it.
//!
//! A single `NavMesh` is read-only after its tiles are loaded and may be
//! shared between queries. A `NavMeshQuery` carries mutable search state
//! and must not be shared between threads.

mod nav_mesh;
mod nav_mesh_query;
mod node_pool;
mod query_filter;
mod raycast_hit;
mod status;
mod tile_data;

#[cfg(test)]
mod test_mesh_helpers;


#[cfg(test)]
mod scenario_tests;

pub use nav_mesh::{
    BvNode, Link, MeshTile, NavMesh, NavMeshParams, OffMeshConnection, Poly, PolyDetail, TileData,
    TileHeader,
};
pub use nav_mesh_query::{
    DistanceToWallResult, FindPathResult, MoveAlongSurfaceResult, NavMeshQuery, PolysAroundResult,
    SlicedPathUpdate, StraightPathResult, StraightPathVertex,
};
pub use node_pool::{Node, NodeFlags, NodeIndex, NodePool, NodeQueue};
pub use query_filter::{QueryFilter, StandardFilter};
pub use raycast_hit::RaycastHit;
pub use status::{Status, StatusResult};
pub use tile_data::{read_tile_data, write_tile_data, MmapTileHeader, MMAP_MAGIC, MMAP_VERSION};

/// Maximum number of vertices per navigation polygon
pub const VERTS_PER_POLYGON: usize = 6;

/// Number of distinct area codes a query filter can weigh
pub const MAX_AREAS: usize = 64;

/// Magic number of a serialized tile blob ('DNAV' little-endian)
pub const NAV_MESH_MAGIC: u32 = 0x5641_4e44;

/// Version of the serialized tile layout
pub const NAV_MESH_VERSION: u32 = 7;

/// Edge flag marking a polygon edge that crosses a tile boundary
pub const EXT_LINK: u16 = 0x8000;

/// Sentinel for "no link" in a polygon's link list
pub const NULL_LINK: u32 = u32::MAX;

/// Off-mesh connection traversable in both directions
pub const OFFMESH_CON_BIDIR: u8 = 1;

/// Heuristic scale for A* searches. Slightly below straight-line distance
/// keeps expansion greedy while still accepting optimal detours.
pub const H_SCALE: f32 = 0.999;

/// Multiplier applied to the agent radius to bound any-angle raycast
/// shortcut attempts
pub const RAY_CAST_LIMIT_PROPORTIONS: f32 = 50.0;

/// Handle to a polygon of one tile of a [`NavMesh`]
///
/// Packs a tile-generation salt, a tile slot index and a polygon index
/// using the bit partition chosen when the mesh was created. `0` is the
/// null reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PolyRef(pub u64);

impl PolyRef {
    pub const NULL: PolyRef = PolyRef(0);

    #[inline]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[inline]
    pub const fn id(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for PolyRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Handle to a loaded tile; the tile's base [`PolyRef`] with a zero
/// polygon index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TileRef(pub u64);

impl TileRef {
    pub const NULL: TileRef = TileRef(0);

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Polygon classification stored in the tile data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PolyType {
    /// Ordinary walkable polygon
    #[default]
    Ground,
    /// Two-vertex connection teleporting between its endpoints
    OffMeshConnection,
}

impl PolyType {
    #[inline]
    pub fn from_u8(v: u8) -> Self {
        if v == 1 {
            PolyType::OffMeshConnection
        } else {
            PolyType::Ground
        }
    }

    #[inline]
    pub fn to_u8(self) -> u8 {
        match self {
            PolyType::Ground => 0,
            PolyType::OffMeshConnection => 1,
        }
    }
}

/// Option flags for `find_path` and the sliced variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FindPathOptions(pub u32);

impl FindPathOptions {
    /// Allow the sliced search to shortcut with raycasts, producing
    /// paths not constrained to portal midpoints
    pub const ANY_ANGLE: FindPathOptions = FindPathOptions(0x02);

    #[inline]
    pub fn contains(self, other: FindPathOptions) -> bool {
        self.0 & other.0 != 0
    }
}

/// Option flags for `find_straight_path`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StraightPathOptions(pub u32);

impl StraightPathOptions {
    /// Emit a vertex at every portal where the area code changes
    pub const AREA_CROSSINGS: StraightPathOptions = StraightPathOptions(0x01);
    /// Emit a vertex at every portal crossing
    pub const ALL_CROSSINGS: StraightPathOptions = StraightPathOptions(0x02);

    #[inline]
    pub fn contains(self, other: StraightPathOptions) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub fn any_crossings(self) -> bool {
        self.0 & (Self::AREA_CROSSINGS.0 | Self::ALL_CROSSINGS.0) != 0
    }
}

/// Option flags for `raycast`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RaycastOptions(pub u32);

impl RaycastOptions {
    /// Accumulate filter costs along the ray
    pub const USE_COSTS: RaycastOptions = RaycastOptions(0x01);

    #[inline]
    pub fn contains(self, other: RaycastOptions) -> bool {
        self.0 & other.0 != 0
    }
}

/// Flags attached to vertices returned by `find_straight_path`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StraightPathFlags(pub u8);

impl StraightPathFlags {
    pub const NONE: StraightPathFlags = StraightPathFlags(0);
    /// The vertex is the path start
    pub const START: StraightPathFlags = StraightPathFlags(0x01);
    /// The vertex is the path end
    pub const END: StraightPathFlags = StraightPathFlags(0x02);
    /// The vertex enters an off-mesh connection
    pub const OFFMESH_CONNECTION: StraightPathFlags = StraightPathFlags(0x04);

    #[inline]
    pub fn contains(self, other: StraightPathFlags) -> bool {
        self.0 & other.0 != 0
    }
}
