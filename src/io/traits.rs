//! Core raster source traits

use crate::engine::{DatasetH, RasterEngine};
use crate::error::{Error, Result};

/// A pre-existing raster owned by the caller's dataset object model.
///
/// Reprojection reads and writes through the handle but never closes it.
pub trait DatasetSource {
    /// The engine handle of the dataset
    fn handle(&self) -> DatasetH;

    /// Stored nodata value, if any
    fn nodata(&self) -> Option<f64>;

    /// Number of bands
    fn count(&self) -> usize;
}

/// A plain [`DatasetSource`] describing an engine dataset
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RasterRef {
    handle: DatasetH,
    nodata: Option<f64>,
    count: usize,
}

impl RasterRef {
    /// Reads band count and the first band's nodata from the engine
    pub fn open<E: RasterEngine>(engine: &E, handle: DatasetH) -> Result<Self> {
        if engine.dataset_size(handle).is_none() {
            return Err(Error::NullChannel(format!(
                "dataset {} does not exist",
                handle.id()
            )));
        }
        let nodata = engine
            .band(handle, 1)
            .and_then(|band| engine.band_nodata(band));
        Ok(Self {
            handle,
            nodata,
            count: engine.band_count(handle),
        })
    }

    /// Overrides the nodata value reported to reprojection
    pub fn with_nodata(mut self, nodata: Option<f64>) -> Self {
        self.nodata = nodata;
        self
    }
}

impl DatasetSource for RasterRef {
    fn handle(&self) -> DatasetH {
        self.handle
    }

    fn nodata(&self) -> Option<f64> {
        self.nodata
    }

    fn count(&self) -> usize {
        self.count
    }
}
