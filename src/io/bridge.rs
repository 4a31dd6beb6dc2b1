//! Transfers between strided buffers and raster bands.
//!
//! The resampling algorithm is an explicit argument of every call rather than
//! a process-wide option, so concurrent transfers do not interfere.

use tracing::trace;

use crate::config::Resampling;
use crate::engine::{BandBuffer, BandH, DatasetH, MultiBandBuffer, RasterEngine};
use crate::env::ErrorCapture;
use crate::error::{Error, ErrorClass, Result};
use crate::types::{Pixel, Window};

/// Copies `window` of one band to or from a 2-D buffer.
///
/// When the buffer shape differs from the window, a read resamples with
/// `resampling` and a write replicates or decimates.
pub fn transfer_band<E: RasterEngine, T: Pixel>(
    engine: &E,
    band: BandH,
    window: Window,
    buffer: BandBuffer<'_, T>,
    resampling: Resampling,
) -> Result<()> {
    let capture = ErrorCapture::new(engine);
    trace!(?band, ?window, mode = ?buffer.mode(), shape = ?buffer.shape(), "band transfer");
    let status = engine.band_io(band, window, buffer, resampling);
    check_status(&capture, status)
}

/// Copies `window` of the selected bands to or from a band-major 3-D buffer
pub fn transfer_multi_band<E: RasterEngine, T: Pixel>(
    engine: &E,
    dataset: DatasetH,
    window: Window,
    buffer: MultiBandBuffer<'_, T>,
    bands: &[usize],
    resampling: Resampling,
) -> Result<()> {
    if bands.is_empty() {
        return Err(Error::InvalidInput("band selection is empty".to_string()));
    }
    let count = buffer.shape().0;
    if count != bands.len() {
        return Err(Error::InvalidInput(format!(
            "buffer has {} bands but {} were selected",
            count,
            bands.len()
        )));
    }

    let capture = ErrorCapture::new(engine);
    let status = engine.dataset_io(dataset, window, buffer, bands, resampling);
    check_status(&capture, status)
}

/// Copies `window` of the validity masks of the selected bands.
///
/// Bands are processed in selection order and the first failure stops the
/// transfer; masks already transferred keep their data.
pub fn transfer_multi_mask<E: RasterEngine>(
    engine: &E,
    dataset: DatasetH,
    window: Window,
    mut buffer: MultiBandBuffer<'_, u8>,
    bands: &[usize],
    resampling: Resampling,
) -> Result<()> {
    if bands.is_empty() {
        return Err(Error::InvalidInput("band selection is empty".to_string()));
    }

    for (i, &index) in bands.iter().enumerate() {
        let band = engine
            .band(dataset, index)
            .ok_or_else(|| Error::NullChannel(format!("band {} could not be resolved", index)))?;
        let mask = engine
            .mask_band(band)
            .ok_or_else(|| Error::NullChannel(format!("band {} has no mask band", index)))?;
        let slice = buffer
            .band(i)
            .ok_or_else(|| Error::NullChannel(format!("no buffer slice for band {}", index)))?;
        transfer_band(engine, mask, window, slice, resampling)?;
    }
    Ok(())
}

/// Removes the nodata annotation of `band`.
///
/// Fails with [`Error::Unsupported`] on engines that cannot delete nodata.
pub fn clear_nodata<E: RasterEngine>(engine: &E, band: BandH) -> Result<()> {
    let _capture = ErrorCapture::new(engine);
    engine.delete_band_nodata(band)
}

fn check_status<E: RasterEngine>(capture: &ErrorCapture<'_, E>, status: i32) -> Result<()> {
    match ErrorClass::from_code(status) {
        Some(ErrorClass::None) => Ok(()),
        Some(class) => Err(Error::Io(capture.last_message().unwrap_or_else(|| {
            format!("raster I/O failed with {:?} status {}", class, status)
        }))),
        None => Err(Error::Io(format!("unrecognized raster I/O status {}", status))),
    }
}
