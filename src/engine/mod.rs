//! The native raster layer the bridge drives.
//!
//! [`RasterEngine`] is the seam between the orchestration code in this crate
//! and whatever storage/warp library performs the actual pixel work. Every
//! resource it hands out is an opaque `Copy` handle with an explicit
//! create/destroy pair, so callers can audit ownership. [`GdalEngine`] drives
//! GDAL itself; [`MemEngine`] is a pure-Rust in-memory engine used as a test
//! double and for environments without a GDAL install.

mod gdal_engine;
mod mem;
mod resample;
mod transformer;
mod warp;

pub use gdal_engine::GdalEngine;
pub use mem::MemEngine;

use ndarray::{ArrayView2, ArrayView3, ArrayViewMut2, ArrayViewMut3, Axis};

use crate::config::{OptionList, Resampling};
use crate::error::{NativeError, Result};
use crate::projection::Crs;
use crate::types::{DataType, Dimensions, Gcp, GeoTransform, Pixel, Window};

/// Name of the in-memory storage driver
pub const MEM_DRIVER: &str = "MEM";

/// Raster I/O status: success
pub const IO_OK: i32 = 0;

/// Opaque reference to a dataset held by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DatasetH(pub(crate) u64);

impl DatasetH {
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Opaque reference to one band (or the mask of one band) of a dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BandH {
    pub dataset: DatasetH,
    /// 1-based band index
    pub index: usize,
    pub mask: bool,
}

/// Opaque reference to a coordinate transformer held by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransformerH(pub(crate) u64);

impl TransformerH {
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Direction of a raster transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
    Read,
    Write,
}

/// A 2-D buffer paired with the direction it is transferred in
#[derive(Debug)]
pub enum BandBuffer<'a, T> {
    Read(ArrayViewMut2<'a, T>),
    Write(ArrayView2<'a, T>),
}

impl<'a, T> BandBuffer<'a, T> {
    pub fn mode(&self) -> IoMode {
        match self {
            BandBuffer::Read(_) => IoMode::Read,
            BandBuffer::Write(_) => IoMode::Write,
        }
    }

    /// (rows, cols)
    pub fn shape(&self) -> (usize, usize) {
        match self {
            BandBuffer::Read(v) => v.dim(),
            BandBuffer::Write(v) => v.dim(),
        }
    }
}

/// A band-major 3-D buffer paired with the direction it is transferred in
#[derive(Debug)]
pub enum MultiBandBuffer<'a, T> {
    Read(ArrayViewMut3<'a, T>),
    Write(ArrayView3<'a, T>),
}

impl<'a, T> MultiBandBuffer<'a, T> {
    pub fn mode(&self) -> IoMode {
        match self {
            MultiBandBuffer::Read(_) => IoMode::Read,
            MultiBandBuffer::Write(_) => IoMode::Write,
        }
    }

    /// (bands, rows, cols)
    pub fn shape(&self) -> (usize, usize, usize) {
        match self {
            MultiBandBuffer::Read(v) => v.dim(),
            MultiBandBuffer::Write(v) => v.dim(),
        }
    }

    /// Borrows the slice of band `i` along the leading axis
    pub fn band(&mut self, i: usize) -> Option<BandBuffer<'_, T>> {
        if i >= self.shape().0 {
            return None;
        }
        Some(match self {
            MultiBandBuffer::Read(v) => BandBuffer::Read(v.index_axis_mut(Axis(0), i)),
            MultiBandBuffer::Write(v) => BandBuffer::Write(v.index_axis(Axis(0), i)),
        })
    }
}

/// Everything a single warp call needs
#[derive(Debug, Clone)]
pub struct WarpOptions {
    pub src: DatasetH,
    pub dst: DatasetH,
    /// Transformer mapping destination pixels to source pixels (and back)
    pub transformer: TransformerH,
    pub resampling: Resampling,
    /// 1-based source bands, paired positionally with `dst_bands`
    pub src_bands: Vec<usize>,
    pub dst_bands: Vec<usize>,
    pub src_nodata_real: Option<Vec<f64>>,
    pub src_nodata_imag: Option<Vec<f64>>,
    pub dst_nodata_real: Option<Vec<f64>>,
    pub dst_nodata_imag: Option<Vec<f64>>,
    /// `INIT_DEST`, `UNIFIED_SRC_NODATA`, `NUM_THREADS` and anything else
    pub options: OptionList,
}

impl WarpOptions {
    pub fn new(src: DatasetH, dst: DatasetH, transformer: TransformerH) -> Self {
        Self {
            src,
            dst,
            transformer,
            resampling: Resampling::Nearest,
            src_bands: Vec::new(),
            dst_bands: Vec::new(),
            src_nodata_real: None,
            src_nodata_imag: None,
            dst_nodata_real: None,
            dst_nodata_imag: None,
            options: OptionList::new(),
        }
    }
}

/// Best-fit output grid computed by [`RasterEngine::suggested_warp_output`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SuggestedWarpOutput {
    pub geo_transform: GeoTransform,
    pub width: usize,
    pub height: usize,
}

/// The collaborating native raster layer.
///
/// Fallible calls return the translated native report and also leave it on the
/// calling thread's error stack (see [`RasterEngine::error_reports`]). Raster
/// I/O instead returns a raw status code: `0` on success, `1..=4` for the
/// native error classes, anything else is unrecognized.
pub trait RasterEngine: Send + Sync {
    /// Makes the engine's storage drivers available
    fn register_drivers(&self);

    fn has_driver(&self, name: &str) -> bool;

    fn create_dataset(
        &self,
        driver: &str,
        name: &str,
        width: usize,
        height: usize,
        count: usize,
        dtype: DataType,
    ) -> Result<DatasetH>;

    fn close_dataset(&self, ds: DatasetH);

    fn dataset_size(&self, ds: DatasetH) -> Option<Dimensions>;

    fn band_count(&self, ds: DatasetH) -> usize;

    fn set_geo_transform(&self, ds: DatasetH, transform: &GeoTransform) -> Result<()>;

    fn geo_transform(&self, ds: DatasetH) -> Option<GeoTransform>;

    /// Sets ground control points and the CRS their X/Y are expressed in
    fn set_gcps(&self, ds: DatasetH, gcps: &[Gcp], crs: Option<&Crs>) -> Result<()>;

    fn gcps(&self, ds: DatasetH) -> Vec<Gcp>;

    fn set_crs(&self, ds: DatasetH, crs: &Crs) -> Result<()>;

    fn crs(&self, ds: DatasetH) -> Option<Crs>;

    /// Resolves a 1-based band index
    fn band(&self, ds: DatasetH, index: usize) -> Option<BandH>;

    fn band_dtype(&self, band: BandH) -> Option<DataType>;

    fn band_nodata(&self, band: BandH) -> Option<f64>;

    fn set_band_nodata(&self, band: BandH, value: f64) -> Result<()>;

    /// Removes the nodata annotation; may fail with a NotSupported report
    fn delete_band_nodata(&self, band: BandH) -> Result<()>;

    /// Returns the per-band validity mask, if one exists
    fn mask_band(&self, band: BandH) -> Option<BandH>;

    fn create_mask_band(&self, band: BandH) -> Result<BandH>;

    /// Copies `window` of `band` to or from `buffer`, resampling when shapes differ
    fn band_io<T: Pixel>(
        &self,
        band: BandH,
        window: Window,
        buffer: BandBuffer<'_, T>,
        resampling: Resampling,
    ) -> i32;

    /// Copies `window` of the selected bands to or from a band-major buffer
    fn dataset_io<T: Pixel>(
        &self,
        ds: DatasetH,
        window: Window,
        buffer: MultiBandBuffer<'_, T>,
        bands: &[usize],
        resampling: Resampling,
    ) -> i32;

    /// Creates an exact pixel-to-pixel transformer from `src` to `dst`.
    ///
    /// Without `dst` the transformer maps source pixels to georeferenced
    /// coordinates of the destination CRS (`DST_SRS` option).
    fn create_gen_img_proj_transformer(
        &self,
        src: DatasetH,
        dst: Option<DatasetH>,
        options: &OptionList,
    ) -> Result<TransformerH>;

    /// Wraps `inner` in a tolerance-bounded approximation.
    ///
    /// On success the new transformer owns `inner`; destroying it destroys both.
    fn create_approx_transformer(&self, inner: TransformerH, max_error: f64) -> Result<TransformerH>;

    fn destroy_transformer(&self, transformer: TransformerH);

    /// Transforms points in place, returning per-point success
    fn transform(
        &self,
        transformer: TransformerH,
        dst_to_src: bool,
        xs: &mut [f64],
        ys: &mut [f64],
    ) -> Vec<bool>;

    /// Warps `window` of the destination on the calling thread
    fn chunk_and_warp_image(&self, options: &WarpOptions, window: Window) -> Result<()>;

    /// Warps `window` of the destination with `NUM_THREADS` workers
    fn chunk_and_warp_multi(&self, options: &WarpOptions, window: Window) -> Result<()>;

    fn suggested_warp_output(
        &self,
        ds: DatasetH,
        transformer: TransformerH,
        max_error: f64,
    ) -> Result<SuggestedWarpOutput>;

    fn config_option(&self, key: &str) -> Option<String>;

    /// Sets (or with `None`, unsets) a process-wide config option
    fn set_config_option(&self, key: &str, value: Option<&str>);

    /// Reports raised on the calling thread and not yet discarded, oldest first
    fn error_reports(&self) -> Vec<NativeError>;

    /// Discards the calling thread's reports past the first `len`
    fn truncate_error_reports(&self, len: usize);

    fn clear_error_reports(&self) {
        self.truncate_error_reports(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn test_multi_band_buffer_slices() {
        let mut data = Array3::<u8>::zeros((2, 3, 4));
        let mut buffer = MultiBandBuffer::Read(data.view_mut());
        assert_eq!(buffer.mode(), IoMode::Read);
        assert_eq!(buffer.shape(), (2, 3, 4));

        let band = buffer.band(1).unwrap();
        assert_eq!(band.shape(), (3, 4));
        assert!(buffer.band(2).is_none());
    }

    #[test]
    fn test_warp_options_defaults() {
        let options = WarpOptions::new(DatasetH(1), DatasetH(2), TransformerH(3));
        assert_eq!(options.resampling, Resampling::Nearest);
        assert!(options.src_nodata_real.is_none());
        assert!(options.options.is_empty());
    }
}
