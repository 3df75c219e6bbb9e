//! Common math and geometry utilities shared by the navigation mesh crates

mod geometry;
mod math;
mod vector;

pub use geometry::*;
pub use math::*;
pub use vector::*;

/// Represents a 3D position
pub type Vec3 = glam::Vec3;
