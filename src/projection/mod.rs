//! Coordinate reference systems and vector transformation.

pub mod coordinate;
pub mod crs;
pub mod geometry;
pub mod transformer;

pub use coordinate::Coordinate;
pub use crs::{epsg, Crs};
pub use geometry::{round_geometry, transform_geometry, Geometry, Position};
pub use transformer::{transform_bounds, transform_points, CoordinateTransformer};
