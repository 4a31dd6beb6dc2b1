//! rasterbridge - ndarray buffers, raster bands and reprojection
//!
//! rasterbridge moves pixel data between strided ndarray buffers and raster
//! bands, and reprojects rasters and vector geometries between coordinate
//! reference systems. The raster work is delegated to a [`RasterEngine`]:
//! [`GdalEngine`] runs it through GDAL, while [`MemEngine`] is an in-memory
//! engine used as a test double.
//!
//! # Examples
//!
//! ## Reprojecting a buffer
//!
//! ```
//! use ndarray::Array3;
//! use rasterbridge::{
//!     reproject, Crs, DestinationRaster, Env, Georeference, MemEngine, ReprojectParams,
//!     Resampling, SourceRaster,
//! };
//!
//! let engine = MemEngine::new();
//! let _env = Env::new(&engine);
//!
//! let georef = Georeference::new([0.0, 1.0, 0.0, 4.0, 0.0, -1.0], Crs::from_epsg(4326)?);
//! let src = Array3::<u8>::from_elem((1, 4, 4), 7).into_dyn();
//! let mut dst = Array3::<u8>::zeros((1, 4, 4)).into_dyn();
//!
//! reproject(
//!     &engine,
//!     &SourceRaster::Buffer { data: src.view(), georef: georef.clone() },
//!     &mut DestinationRaster::Buffer { data: dst.view_mut(), georef },
//!     &ReprojectParams::new(Resampling::Nearest),
//! )?;
//! assert_eq!(dst, src);
//! # Ok::<(), rasterbridge::Error>(())
//! ```
//!
//! ## Estimating an output grid
//!
//! ```
//! use rasterbridge::{estimate_transform, Bounds, Crs, EstimateOptions, Env, MemEngine};
//!
//! let engine = MemEngine::new();
//! let _env = Env::new(&engine);
//! let crs = Crs::from_epsg(4326)?;
//!
//! let options = EstimateOptions::from_bounds(Bounds::new(0.0, 0.0, 4.0, 4.0));
//! let estimate = estimate_transform(&engine, &crs, &crs, 4, 4, &options)?;
//! assert_eq!((estimate.width, estimate.height), (4, 4));
//! # Ok::<(), rasterbridge::Error>(())
//! ```
//!
//! ## Rounding a geometry
//!
//! ```
//! use rasterbridge::{transform_geometry, Crs, Geometry};
//!
//! let crs = Crs::from_epsg(4326)?;
//! let point = Geometry::from_json(r#"{"type": "Point", "coordinates": [0.001, 0.004]}"#)?;
//! let out = transform_geometry(&crs, &crs, &point, false, 10.0, 2)?;
//! assert_eq!(out, Geometry::Point { coordinates: vec![0.0, 0.0] });
//! # Ok::<(), rasterbridge::Error>(())
//! ```

pub mod config;
pub mod engine;
pub mod env;
pub mod error;
pub mod io;
pub mod projection;
pub mod types;
pub mod warp;

pub use config::{EngineConfig, OptionList, Resampling, WarpConfig};
pub use engine::{
    BandBuffer, BandH, DatasetH, GdalEngine, IoMode, MemEngine, MultiBandBuffer, RasterEngine,
    TransformerH, MEM_DRIVER,
};
pub use env::{Env, ErrorCapture, ScopedConfigOption};
pub use error::{Error, ErrorClass, ErrorCode, NativeError, Result};
pub use io::{
    clear_nodata, transfer_band, transfer_multi_band, transfer_multi_mask, DatasetSource,
    RasterRef,
};
pub use projection::{
    round_geometry, transform_bounds, transform_geometry, transform_points, Coordinate,
    CoordinateTransformer, Crs, Geometry,
};
pub use types::{Bounds, DataType, Dimensions, Gcp, GeoTransform, Pixel, Window};
pub use warp::{
    aligned_target, estimate_transform, reproject, DestinationRaster, EstimateOptions,
    Georeference, NodataPolicy, ReprojectParams, SourceRaster, TransformEstimate,
};
