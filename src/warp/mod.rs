//! Raster reprojection built on the engine's warper.
//!
//! Either side of a reprojection may be an ndarray buffer with explicit
//! georeferencing or an existing dataset. Buffers are materialized as scratch
//! datasets for the duration of the call.

pub mod estimate;
pub mod nodata;
pub mod reproject;
pub mod scratch;

pub use estimate::{aligned_target, estimate_transform, EstimateOptions, TransformEstimate};
pub use nodata::{NodataPolicy, ResolvedNodata, DEFAULT_DST_NODATA};
pub use reproject::{reproject, ReprojectParams, APPROX_MAX_ERROR};
pub use scratch::{DestinationRaster, Georeference, SourceRaster};
