//! Raster reprojection.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{OptionList, Resampling, WarpConfig};
use crate::engine::{MultiBandBuffer, RasterEngine, WarpOptions};
use crate::env::ErrorCapture;
use crate::error::{Error, Result};
use crate::io::{as_bands_mut, transfer_multi_band};
use crate::types::{Pixel, Window};
use crate::warp::nodata::NodataPolicy;
use crate::warp::scratch::{DestinationRaster, SourceRaster, TransformerGuard};

/// Tolerance of the approximate transformer, in pixels
pub const APPROX_MAX_ERROR: f64 = 0.125;

/// Parameters of [`reproject`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReprojectParams {
    pub resampling: Resampling,
    pub nodata: NodataPolicy,
    pub warp: WarpConfig,
}

impl ReprojectParams {
    pub fn new(resampling: Resampling) -> Self {
        Self {
            resampling,
            ..Self::default()
        }
    }

    pub fn with_nodata(mut self, src: Option<f64>, dst: Option<f64>) -> Self {
        self.nodata = NodataPolicy::new(src, dst);
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.warp.threads = threads;
        self
    }

    /// Adds an option forwarded to both the transformer and the warper
    pub fn with_option(mut self, key: &str, value: impl ToString) -> Self {
        self.warp.options.set(key, value);
        self
    }
}

/// Warps `source` onto the grid of `destination`.
///
/// Buffer sides are backed by scratch datasets that are closed before
/// returning; dataset sides are read and written in place but never closed.
/// Configuration is validated before any engine resource is acquired, and
/// every resource acquired is released on all exit paths.
pub fn reproject<E, T, U>(
    engine: &E,
    source: &SourceRaster<'_, T>,
    destination: &mut DestinationRaster<'_, U>,
    params: &ReprojectParams,
) -> Result<()>
where
    E: RasterEngine,
    T: Pixel,
    U: Pixel,
{
    params.warp.validate()?;
    if !params.resampling.supports_warp() {
        return Err(Error::Unsupported(format!(
            "{} resampling is not available for warping",
            params.resampling
        )));
    }

    let src_info = source.info(engine)?;
    let dst_info = destination.info(engine)?;
    if src_info.count != dst_info.count {
        return Err(Error::InvalidInput(format!(
            "destination has {} bands but source has {}",
            dst_info.count, src_info.count
        )));
    }
    let nodata = params
        .nodata
        .resolve(src_info.nodata, src_info.dtype, dst_info.dtype)?;

    let capture = ErrorCapture::new(engine);

    let src = source.resolve(engine)?;
    let dst = destination.resolve(engine)?;

    let mut transformer_options = params.warp.options.clone();
    transformer_options.set_bool("GCPS_OK", true);
    let exact = engine.create_gen_img_proj_transformer(src.handle, Some(dst.handle), &transformer_options)?;
    let mut exact_guard = TransformerGuard::new(engine, exact);
    let approx = engine.create_approx_transformer(exact, APPROX_MAX_ERROR)?;
    // the approximate transformer owns the exact one from here on
    exact_guard.disarm();
    let _approx_guard = TransformerGuard::new(engine, approx);

    let mut warp_options = WarpOptions::new(src.handle, dst.handle, approx);
    warp_options.resampling = params.resampling;
    warp_options.src_bands = src.bands.clone();
    warp_options.dst_bands = dst.bands.clone();
    let count = src.bands.len();
    if let Some(value) = nodata.src {
        warp_options.src_nodata_real = Some(vec![value; count]);
        warp_options.src_nodata_imag = Some(vec![0.0; count]);
    }
    warp_options.dst_nodata_real = Some(vec![nodata.dst; count]);
    warp_options.dst_nodata_imag = Some(vec![0.0; count]);
    warp_options.options = warp_engine_options(params, nodata.src.is_some());

    let size = engine
        .dataset_size(dst.handle)
        .ok_or_else(|| Error::NullChannel("destination dataset vanished".to_string()))?;
    let window = Window::full(size);

    debug!(
        src_scratch = src.is_scratch(),
        dst_scratch = dst.is_scratch(),
        bands = count,
        threads = params.warp.threads,
        resampling = %params.resampling,
        "reprojecting"
    );
    if params.warp.threads > 1 {
        engine.chunk_and_warp_multi(&warp_options, window)?;
    } else {
        engine.chunk_and_warp_image(&warp_options, window)?;
    }
    capture.check()?;

    if let DestinationRaster::Buffer { data, .. } = destination {
        let view = as_bands_mut(data.view_mut())?;
        transfer_multi_band(
            engine,
            dst.handle,
            window,
            MultiBandBuffer::Read(view),
            &dst.bands,
            Resampling::Nearest,
        )?;
    }
    debug!("reprojection finished");
    Ok(())
}

fn warp_engine_options(params: &ReprojectParams, unified_nodata: bool) -> OptionList {
    let mut options = params.warp.options.clone();
    if params.warp.init_dest_nodata {
        options.set("INIT_DEST", "NO_DATA");
    }
    if unified_nodata {
        options.set_bool("UNIFIED_SRC_NODATA", true);
    }
    options.set("NUM_THREADS", params.warp.threads);
    if let Some(limit) = params.warp.warp_memory_limit {
        options.set("WARP_MEMORY_LIMIT", limit);
    }
    options
}
