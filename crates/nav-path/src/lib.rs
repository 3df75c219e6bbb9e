//! Path building and map-set management
//!
//! Sits on top of the navmesh query engine: [`MapSetManager`] loads the
//! per-map tile files and hands out memoized query handles, and
//! [`PathFinder`] turns a start/end request into a corridor plus a
//! smoothed or straightened sequence of waypoints.
//!
//! World positions use the host convention (z up); the mesh stores
//! y-up coordinates, so positions are swizzled at this boundary.

mod map_manager;
mod path_builder;

pub use map_manager::{MapSetManager, PathError, PathResult};
pub use path_builder::{PathFinder, PathType};

/// Walkable ground baked into the mesh
pub const NAV_GROUND: u16 = 0x01;
/// Steep but still walkable ground
pub const NAV_GROUND_STEEP: u16 = 0x02;
/// Swimmable water volumes
pub const NAV_WATER: u16 = 0x04;
/// Magma and slime volumes
pub const NAV_MAGMA_SLIME: u16 = 0x08;

/// Longest polygon corridor a path request will consider
pub const MAX_PATH_LENGTH: usize = 740;
/// Longest point path a request will emit
pub const MAX_POINT_PATH_LENGTH: usize = 740;
/// Step length of the iterative path smoother
pub const SMOOTH_PATH_STEP_SIZE: f32 = 4.0;
/// Distance at which the smoother considers a steer point reached
pub const SMOOTH_PATH_SLOP: f32 = 0.3;
