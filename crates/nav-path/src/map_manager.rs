//! Map-set management: loading mmap headers and tiles, owning one
//! navmesh and its query handles per map

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use glam::Vec3;
use tracing::{debug, info, warn};

use nav_mesh::{
    read_tile_data, MmapTileHeader, NavMesh, NavMeshParams, NavMeshQuery, Status, TileRef,
    MMAP_MAGIC, MMAP_VERSION, NAV_MESH_VERSION,
};

use super::path_builder::{PathFinder, PathType};

/// Node budget for each query handle
const QUERY_MAX_NODES: usize = 65535;

/// Instance id used by the plain `calculate_path` surface
const DEFAULT_INSTANCE: u32 = 1;

/// Errors surfaced by map and tile loading
#[derive(thiserror::Error, Debug)]
pub enum PathError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{path} is not a tile file (bad magic)")]
    BadMagic { path: PathBuf },

    #[error("{path} has an unsupported version")]
    BadVersion { path: PathBuf },

    #[error("tile {path} is truncated")]
    Truncated { path: PathBuf },

    #[error("navmesh rejected data: {0}")]
    Mesh(Status),

    #[error("map {0:03} has no loaded data")]
    MapNotLoaded(u32),

    #[error("map {0:03} is already serving queries; tiles can no longer be added")]
    MeshBusy(u32),
}

/// A built path handed back to the caller
#[derive(Debug, Clone)]
pub struct PathResult {
    /// Waypoints in world space, start first
    pub points: Vec<Vec3>,
    pub path_type: PathType,
    /// Where the path actually ends; differs from the request for
    /// incomplete paths
    pub actual_end: Vec3,
}

struct MapSlot {
    nav_mesh: Arc<NavMesh>,
    /// `(x << 16) | y` to the tile handle it loaded as
    loaded_tiles: HashMap<u32, TileRef>,
    /// One query handle per caller instance
    queries: HashMap<u32, NavMeshQuery>,
}

/// Owns every loaded map's navmesh, tiles and query handles
///
/// Not reentrant; callers serialize access. Tile file reads block on
/// first use of a map and are memoized afterwards.
pub struct MapSetManager {
    mmaps_dir: PathBuf,
    maps: HashMap<u32, MapSlot>,
    /// Maps whose tile directory scan already ran
    loaded_zones: HashSet<u32>,
}

#[inline]
fn pack_tile_id(x: i32, y: i32) -> u32 {
    ((x as u32) << 16) | (y as u32 & 0xffff)
}

impl MapSetManager {
    /// Creates a manager reading from the given `mmaps` directory
    pub fn new(mmaps_dir: impl Into<PathBuf>) -> Self {
        Self {
            mmaps_dir: mmaps_dir.into(),
            maps: HashMap::new(),
            loaded_zones: HashSet::new(),
        }
    }

    fn map_file_path(&self, map_id: u32) -> PathBuf {
        self.mmaps_dir.join(format!("{map_id:03}.mmap"))
    }

    fn tile_file_path(&self, map_id: u32, x: i32, y: i32) -> PathBuf {
        self.mmaps_dir.join(format!("{map_id:03}{x:02}{y:02}.mmtile"))
    }

    /// Loads the map header and creates the empty navmesh for a map
    pub fn load_map_data(&mut self, map_id: u32) -> Result<(), PathError> {
        if self.maps.contains_key(&map_id) {
            return Ok(());
        }

        let path = self.map_file_path(map_id);
        let mut file = File::open(&path).map_err(|source| PathError::Io {
            path: path.clone(),
            source,
        })?;
        let params = NavMeshParams::read_from(&mut file).map_err(|source| PathError::Io {
            path: path.clone(),
            source,
        })?;

        let nav_mesh = NavMesh::new(&params).map_err(PathError::Mesh)?;
        info!(map_id, ?path, "loaded map header");

        self.maps.insert(
            map_id,
            MapSlot {
                nav_mesh: Arc::new(nav_mesh),
                loaded_tiles: HashMap::new(),
                queries: HashMap::new(),
            },
        );
        Ok(())
    }

    /// Loads one tile of a map, adding it to the navmesh
    pub fn load_tile(&mut self, map_id: u32, x: i32, y: i32) -> Result<(), PathError> {
        self.load_map_data(map_id)?;

        let key = pack_tile_id(x, y);
        if self.maps[&map_id].loaded_tiles.contains_key(&key) {
            return Ok(());
        }

        let path = self.tile_file_path(map_id, x, y);
        let mut file = File::open(&path).map_err(|source| PathError::Io {
            path: path.clone(),
            source,
        })?;

        let header = MmapTileHeader::read_from(&mut file).map_err(|source| PathError::Io {
            path: path.clone(),
            source,
        })?;
        if header.mmap_magic != MMAP_MAGIC {
            return Err(PathError::BadMagic { path });
        }
        if header.mmap_version != MMAP_VERSION || header.dt_version != NAV_MESH_VERSION {
            return Err(PathError::BadVersion { path });
        }

        let mut blob = vec![0u8; header.size as usize];
        file.read_exact(&mut blob)
            .map_err(|_| PathError::Truncated { path: path.clone() })?;

        let data = read_tile_data(&blob).map_err(PathError::Mesh)?;

        let slot = self.maps.get_mut(&map_id).expect("map data just loaded");

        // Tiles can only be added while the mesh is not shared with
        // query handles yet.
        let nav_mesh =
            Arc::get_mut(&mut slot.nav_mesh).ok_or(PathError::MeshBusy(map_id))?;
        let tile_ref = nav_mesh.add_tile(data).map_err(PathError::Mesh)?;

        slot.loaded_tiles.insert(key, tile_ref);
        debug!(map_id, x, y, "loaded tile");
        Ok(())
    }

    /// Loads every tile file of a map by scanning the mmaps directory
    ///
    /// The scan runs once per map id; later calls are no-ops.
    pub fn ensure_map_loaded(&mut self, map_id: u32) -> Result<(), PathError> {
        if self.loaded_zones.contains(&map_id) {
            return Ok(());
        }

        let prefix = format!("{map_id:03}");
        let entries = std::fs::read_dir(&self.mmaps_dir).map_err(|source| PathError::Io {
            path: self.mmaps_dir.clone(),
            source,
        })?;

        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.ends_with(".mmtile") || !name.starts_with(&prefix) || name.len() < 14 {
                continue;
            }

            // <id:3><x:2><y:2>.mmtile
            let (Ok(x), Ok(y)) = (name[3..5].parse::<i32>(), name[5..7].parse::<i32>()) else {
                continue;
            };

            // A bad tile should not keep the rest of the map from
            // loading.
            if let Err(err) = self.load_tile(map_id, x, y) {
                warn!(map_id, x, y, %err, "skipping tile");
            }
        }

        self.loaded_zones.insert(map_id);
        Ok(())
    }

    /// The navmesh of a loaded map
    pub fn get_nav_mesh(&self, map_id: u32) -> Option<&NavMesh> {
        self.maps.get(&map_id).map(|slot| slot.nav_mesh.as_ref())
    }

    /// The memoized query handle for `(map, instance)`, created on first
    /// use
    pub fn get_query(
        &mut self,
        map_id: u32,
        instance_id: u32,
    ) -> Result<&mut NavMeshQuery, PathError> {
        let slot = self
            .maps
            .get_mut(&map_id)
            .ok_or(PathError::MapNotLoaded(map_id))?;

        if !slot.queries.contains_key(&instance_id) {
            let query = NavMeshQuery::new(Arc::clone(&slot.nav_mesh), QUERY_MAX_NODES)
                .map_err(PathError::Mesh)?;
            slot.queries.insert(instance_id, query);
        }
        Ok(slot.queries.get_mut(&instance_id).unwrap())
    }

    /// Builds a path on a map, loading its tiles on first use
    pub fn calculate_path(
        &mut self,
        map_id: u32,
        start: Vec3,
        end: Vec3,
        straight: bool,
    ) -> Result<PathResult, PathError> {
        self.ensure_map_loaded(map_id)?;

        // A map without mesh data still gets an answer: the straight
        // segment between the endpoints.
        if !self.maps.contains_key(&map_id) {
            return Ok(PathResult {
                points: vec![start, end],
                path_type: PathType::Normal,
                actual_end: end,
            });
        }

        let query = self.get_query(map_id, DEFAULT_INSTANCE)?;
        let mut finder = PathFinder::new(query);
        finder.set_use_straight_path(straight);
        finder.calculate(start, end, false, false);

        Ok(PathResult {
            actual_end: finder.actual_end_position(),
            path_type: finder.path_type(),
            points: finder.take_path(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_tile_id() {
        assert_eq!(pack_tile_id(0, 0), 0);
        assert_eq!(pack_tile_id(1, 2), (1 << 16) | 2);
        assert_eq!(pack_tile_id(63, 63), (63 << 16) | 63);
    }

    #[test]
    fn test_missing_map_file_is_typed() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = MapSetManager::new(dir.path());
        let err = mgr.load_map_data(1).unwrap_err();
        assert!(matches!(err, PathError::Io { .. }));
    }

    #[test]
    fn test_rejects_wrong_magic_tile() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();

        // Minimal valid map header.
        let params = NavMeshParams {
            origin: [0.0, 0.0, 0.0],
            tile_width: 10.0,
            tile_height: 10.0,
            max_tiles: 8,
            max_polys: 128,
        };
        let mut f = std::fs::File::create(dir.path().join("001.mmap")).unwrap();
        params.write_to(&mut f).unwrap();

        // Tile file with a corrupted frame magic.
        let mut frame = Vec::new();
        MmapTileHeader::new(0, false).write_to(&mut frame).unwrap();
        frame[0] ^= 0xff;
        let mut f = std::fs::File::create(dir.path().join("0010203.mmtile")).unwrap();
        f.write_all(&frame).unwrap();

        let mut mgr = MapSetManager::new(dir.path());
        let err = mgr.load_tile(1, 2, 3).unwrap_err();
        assert!(matches!(err, PathError::BadMagic { .. }));

        // The directory scan tolerates the bad tile.
        mgr.ensure_map_loaded(1).unwrap();
        assert!(mgr.get_nav_mesh(1).is_some());
    }
}
