//! Scratch datasets backing buffer sides of a warp.

use std::sync::atomic::{AtomicU64, Ordering};

use ndarray::{ArrayViewD, ArrayViewMutD};
use tracing::debug;

use crate::config::Resampling;
use crate::engine::{DatasetH, MultiBandBuffer, RasterEngine, TransformerH, MEM_DRIVER};
use crate::error::{Error, Result};
use crate::io::{as_bands, fill_masked, transfer_multi_band, DatasetSource};
use crate::projection::Crs;
use crate::types::{DataType, Gcp, GeoTransform, Pixel, Window};

static SCRATCH_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Georeferencing of a buffer side
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Georeference {
    pub transform: Option<GeoTransform>,
    pub gcps: Vec<Gcp>,
    pub crs: Option<Crs>,
}

impl Georeference {
    pub fn new(transform: GeoTransform, crs: Crs) -> Self {
        Self {
            transform: Some(transform),
            gcps: Vec::new(),
            crs: Some(crs),
        }
    }

    /// Georeferencing by ground control points expressed in `crs`
    pub fn from_gcps(gcps: Vec<Gcp>, crs: Crs) -> Self {
        Self {
            transform: None,
            gcps,
            crs: Some(crs),
        }
    }
}

/// Source side of a reprojection
pub enum SourceRaster<'a, T> {
    /// A 2-D (rows, cols) or 3-D (bands, rows, cols) buffer
    Buffer {
        data: ArrayViewD<'a, T>,
        georef: Georeference,
    },
    /// A buffer whose `true` mask cells are invalid; they are written as
    /// `fill_value`, which also becomes the inherited source nodata
    Masked {
        data: ArrayViewD<'a, T>,
        mask: ArrayViewD<'a, bool>,
        fill_value: T,
        georef: Georeference,
    },
    /// Bands of an existing dataset; `None` selects all bands
    Handle {
        source: &'a dyn DatasetSource,
        bands: Option<Vec<usize>>,
    },
}

/// Destination side of a reprojection
pub enum DestinationRaster<'a, U> {
    /// Receives the warped pixels; its current contents seed the destination
    Buffer {
        data: ArrayViewMutD<'a, U>,
        georef: Georeference,
    },
    Handle {
        source: &'a dyn DatasetSource,
        bands: Option<Vec<usize>>,
    },
}

/// Shape and type of one side, known before any dataset exists
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SideInfo {
    pub count: usize,
    pub dtype: DataType,
    pub nodata: Option<f64>,
}

fn handle_bands(source: &dyn DatasetSource, bands: &Option<Vec<usize>>) -> Vec<usize> {
    bands
        .clone()
        .unwrap_or_else(|| (1..=source.count()).collect())
}

fn handle_info<E: RasterEngine>(
    engine: &E,
    source: &dyn DatasetSource,
    bands: &Option<Vec<usize>>,
) -> Result<SideInfo> {
    let bands = handle_bands(source, bands);
    let first = bands
        .first()
        .ok_or_else(|| Error::InvalidInput("band selection is empty".to_string()))?;
    let dtype = engine
        .band(source.handle(), *first)
        .and_then(|band| engine.band_dtype(band))
        .ok_or_else(|| Error::NullChannel(format!("band {} could not be resolved", first)))?;
    Ok(SideInfo {
        count: bands.len(),
        dtype,
        nodata: source.nodata(),
    })
}

impl<'a, T: Pixel> SourceRaster<'a, T> {
    pub(crate) fn info<E: RasterEngine>(&self, engine: &E) -> Result<SideInfo> {
        match self {
            SourceRaster::Buffer { data, .. } => Ok(SideInfo {
                count: as_bands(data.view())?.dim().0,
                dtype: T::DATA_TYPE,
                nodata: None,
            }),
            SourceRaster::Masked {
                data, fill_value, ..
            } => Ok(SideInfo {
                count: as_bands(data.view())?.dim().0,
                dtype: T::DATA_TYPE,
                nodata: Some(fill_value.to_f64()),
            }),
            SourceRaster::Handle { source, bands } => handle_info(engine, *source, bands),
        }
    }

    /// Resolves to a dataset, writing buffer contents into a scratch dataset
    pub(crate) fn resolve<'e, E: RasterEngine>(&self, engine: &'e E) -> Result<ResolvedRaster<'e, E>> {
        match self {
            SourceRaster::Buffer { data, georef } => {
                let data = as_bands(data.view())?;
                ResolvedRaster::from_buffer(engine, data, georef)
            }
            SourceRaster::Masked {
                data,
                mask,
                fill_value,
                georef,
            } => {
                let filled = fill_masked(as_bands(data.view())?, mask.view(), *fill_value)?;
                ResolvedRaster::from_buffer(engine, filled.view(), georef)
            }
            SourceRaster::Handle { source, bands } => Ok(ResolvedRaster::from_handle(*source, bands)),
        }
    }
}

impl<'a, U: Pixel> DestinationRaster<'a, U> {
    pub(crate) fn info<E: RasterEngine>(&self, engine: &E) -> Result<SideInfo> {
        match self {
            DestinationRaster::Buffer { data, .. } => Ok(SideInfo {
                count: as_bands(data.view())?.dim().0,
                dtype: U::DATA_TYPE,
                nodata: None,
            }),
            DestinationRaster::Handle { source, bands } => handle_info(engine, *source, bands),
        }
    }

    pub(crate) fn resolve<'e, E: RasterEngine>(&self, engine: &'e E) -> Result<ResolvedRaster<'e, E>> {
        match self {
            DestinationRaster::Buffer { data, georef } => {
                let data = as_bands(data.view())?;
                ResolvedRaster::from_buffer(engine, data, georef)
            }
            DestinationRaster::Handle { source, bands } => {
                Ok(ResolvedRaster::from_handle(*source, bands))
            }
        }
    }
}

/// One side of a warp as seen by the engine
pub(crate) struct ResolvedRaster<'e, E: RasterEngine> {
    pub handle: DatasetH,
    pub bands: Vec<usize>,
    /// Keeps a scratch dataset alive; `None` for caller-owned datasets
    pub scratch: Option<ScratchDataset<'e, E>>,
}

impl<'e, E: RasterEngine> ResolvedRaster<'e, E> {
    fn from_buffer<T: Pixel>(
        engine: &'e E,
        data: ndarray::ArrayView3<'_, T>,
        georef: &Georeference,
    ) -> Result<Self> {
        let (count, rows, cols) = data.dim();
        let scratch = ScratchDataset::create(engine, cols, rows, count, T::DATA_TYPE, georef)?;
        let bands: Vec<usize> = (1..=count).collect();
        transfer_multi_band(
            engine,
            scratch.handle(),
            Window::new(0, 0, cols, rows),
            MultiBandBuffer::Write(data),
            &bands,
            Resampling::Nearest,
        )?;
        Ok(Self {
            handle: scratch.handle(),
            bands,
            scratch: Some(scratch),
        })
    }

    /// True if the dataset was created for this operation
    pub(crate) fn is_scratch(&self) -> bool {
        self.scratch.is_some()
    }

    fn from_handle(source: &dyn DatasetSource, bands: &Option<Vec<usize>>) -> Self {
        Self {
            handle: source.handle(),
            bands: handle_bands(source, bands),
            scratch: None,
        }
    }
}

/// An in-memory dataset closed when the guard drops
pub(crate) struct ScratchDataset<'e, E: RasterEngine> {
    engine: &'e E,
    handle: DatasetH,
    name: String,
}

impl<'e, E: RasterEngine> ScratchDataset<'e, E> {
    /// Creates a uniquely named dataset and applies `georef`.
    ///
    /// A geotransform takes precedence over GCPs.
    pub(crate) fn create(
        engine: &'e E,
        width: usize,
        height: usize,
        count: usize,
        dtype: DataType,
        georef: &Georeference,
    ) -> Result<Self> {
        if !engine.has_driver(MEM_DRIVER) {
            return Err(Error::DriverUnavailable(format!(
                "{} driver is not registered; run inside an initialized environment",
                MEM_DRIVER
            )));
        }

        let name = format!(
            "rasterbridge_scratch_{}",
            SCRATCH_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let handle = engine.create_dataset(MEM_DRIVER, &name, width, height, count, dtype)?;
        let scratch = Self {
            engine,
            handle,
            name,
        };
        debug!(name = %scratch.name, width, height, count, %dtype, "created scratch dataset");

        if let Some(transform) = &georef.transform {
            engine.set_geo_transform(handle, transform)?;
        } else if !georef.gcps.is_empty() {
            engine.set_gcps(handle, &georef.gcps, georef.crs.as_ref())?;
        }
        if let Some(crs) = &georef.crs {
            engine.set_crs(handle, crs)?;
        }
        Ok(scratch)
    }

    pub(crate) fn handle(&self) -> DatasetH {
        self.handle
    }
}

impl<E: RasterEngine> Drop for ScratchDataset<'_, E> {
    fn drop(&mut self) {
        self.engine.close_dataset(self.handle);
        debug!(name = %self.name, "closed scratch dataset");
    }
}

/// Destroys a transformer when dropped, unless disarmed
pub(crate) struct TransformerGuard<'e, E: RasterEngine> {
    engine: &'e E,
    handle: Option<TransformerH>,
}

impl<'e, E: RasterEngine> TransformerGuard<'e, E> {
    pub(crate) fn new(engine: &'e E, handle: TransformerH) -> Self {
        Self {
            engine,
            handle: Some(handle),
        }
    }

    /// Gives up ownership, e.g. after another transformer took it over
    pub(crate) fn disarm(&mut self) {
        self.handle = None;
    }
}

impl<E: RasterEngine> Drop for TransformerGuard<'_, E> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.engine.destroy_transformer(handle);
        }
    }
}
