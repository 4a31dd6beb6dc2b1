//! In-memory implementation of [`RasterEngine`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};

use dashmap::{DashMap, DashSet};
use ndarray::{ArrayView2, ArrayViewMut2};
use rayon::prelude::*;
use tracing::{debug, trace};

use crate::config::{parse_bool, OptionList, Resampling};
use crate::engine::resample::{sample, Grid};
use crate::engine::transformer::{GenImgProj, LiveTransformer, TransformerKind};
use crate::engine::warp::{estimate_scale, suggest_output, RowSamples, SourceBand, WarpJob};
use crate::engine::{
    BandBuffer, BandH, DatasetH, IoMode, MultiBandBuffer, RasterEngine, SuggestedWarpOutput,
    TransformerH, WarpOptions, IO_OK, MEM_DRIVER,
};
use crate::error::{Error, ErrorClass, ErrorCode, NativeError, Result};
use crate::projection::Crs;
use crate::types::{DataType, Dimensions, Gcp, GeoTransform, Pixel, Window};

struct MemBand {
    dtype: DataType,
    data: Vec<f64>,
    nodata: Option<f64>,
    /// 0 = invalid, 255 = valid
    mask: Option<Vec<f64>>,
}

struct MemDataset {
    name: String,
    width: usize,
    height: usize,
    bands: Vec<MemBand>,
    geo_transform: Option<GeoTransform>,
    gcps: Vec<Gcp>,
    gcp_crs: Option<Crs>,
    crs: Option<Crs>,
}

/// Georeferencing of a dataset as seen by transformer construction
struct GeorefInfo {
    transform: Option<GeoTransform>,
    gcps: Vec<Gcp>,
    gcp_crs: Option<Crs>,
    crs: Option<Crs>,
}

/// A pure-Rust raster engine keeping every dataset in memory.
///
/// Drivers must be registered (see [`crate::env::Env`]) before datasets can be
/// created. Error reports are kept per calling thread.
pub struct MemEngine {
    drivers: DashSet<String>,
    datasets: DashMap<u64, MemDataset>,
    transformers: DashMap<u64, TransformerKind>,
    config: DashMap<String, String>,
    errors: DashMap<ThreadId, Vec<NativeError>>,
    next_id: AtomicU64,
    nodata_deletion: bool,
}

impl Default for MemEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemEngine {
    pub fn new() -> Self {
        Self {
            drivers: DashSet::new(),
            datasets: DashMap::new(),
            transformers: DashMap::new(),
            config: DashMap::new(),
            errors: DashMap::new(),
            next_id: AtomicU64::new(1),
            nodata_deletion: true,
        }
    }

    /// An engine that cannot delete nodata annotations, like older native versions
    pub fn without_nodata_deletion() -> Self {
        Self {
            nodata_deletion: false,
            ..Self::new()
        }
    }

    /// Number of datasets currently open
    pub fn open_dataset_count(&self) -> usize {
        self.datasets.len()
    }

    /// Number of live transformer handles
    pub fn transformer_count(&self) -> usize {
        self.transformers.len()
    }

    /// Name a dataset was created with
    pub fn dataset_name(&self, ds: DatasetH) -> Option<String> {
        self.datasets.get(&ds.0).map(|d| d.name.clone())
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn push_report(&self, report: NativeError) {
        trace!(%report, "native report");
        self.errors
            .entry(thread::current().id())
            .or_default()
            .push(report);
    }

    /// Records `report` on the error stack and translates it
    fn fail(&self, report: NativeError) -> Error {
        self.push_report(report.clone());
        report.into()
    }

    fn no_dataset(&self, ds: DatasetH) -> Error {
        self.fail(NativeError::failure(
            ErrorCode::ObjectNull,
            format!("dataset {} does not exist", ds.0),
        ))
    }

    fn with_dataset<R>(&self, ds: DatasetH, f: impl FnOnce(&MemDataset) -> R) -> Result<R> {
        match self.datasets.get(&ds.0) {
            Some(d) => Ok(f(&d)),
            None => Err(self.no_dataset(ds)),
        }
    }

    fn with_dataset_mut<R>(&self, ds: DatasetH, f: impl FnOnce(&mut MemDataset) -> R) -> Result<R> {
        match self.datasets.get_mut(&ds.0) {
            Some(mut d) => Ok(f(&mut d)),
            None => Err(self.no_dataset(ds)),
        }
    }

    fn with_band_mut<R>(&self, band: BandH, f: impl FnOnce(&mut MemBand) -> R) -> Result<R> {
        let found = self.with_dataset_mut(band.dataset, |d| {
            band.index
                .checked_sub(1)
                .and_then(|i| d.bands.get_mut(i))
                .map(f)
        })?;
        found.ok_or_else(|| {
            self.fail(NativeError::failure(
                ErrorCode::ObjectNull,
                format!("band {} does not exist", band.index),
            ))
        })
    }

    fn georef_info(&self, ds: DatasetH) -> Result<GeorefInfo> {
        self.with_dataset(ds, |d| GeorefInfo {
            transform: d.geo_transform,
            gcps: d.gcps.clone(),
            gcp_crs: d.gcp_crs.clone(),
            crs: d.crs.clone(),
        })
    }

    fn parse_crs_option(&self, options: &OptionList, key: &str) -> Result<Option<Crs>> {
        match options.get(key) {
            Some(definition) => Crs::from_user_input(definition).map(Some).map_err(|e| {
                self.push_report(NativeError::failure(ErrorCode::AppDefined, e.to_string()));
                e
            }),
            None => Ok(None),
        }
    }

    fn failed_io(&self, code: ErrorCode, message: String) -> i32 {
        self.push_report(NativeError::failure(code, message));
        ErrorClass::Failure.code()
    }

    fn thread_count(options: &OptionList) -> usize {
        match options.get("NUM_THREADS") {
            Some(v) if v.eq_ignore_ascii_case("ALL_CPUS") => {
                thread::available_parallelism().map_or(1, |n| n.get())
            }
            Some(v) => v.parse::<usize>().unwrap_or(1).max(1),
            None => 1,
        }
    }

    fn warp(&self, options: &WarpOptions, window: Window, threads: usize) -> Result<()> {
        if !options.resampling.supports_warp() {
            return Err(self.fail(NativeError::failure(
                ErrorCode::NotSupported,
                format!("{} resampling is not supported by the warper", options.resampling),
            )));
        }
        if options.src_bands.is_empty() || options.src_bands.len() != options.dst_bands.len() {
            return Err(self.fail(NativeError::failure(
                ErrorCode::IllegalArg,
                format!(
                    "{} source bands cannot be paired with {} destination bands",
                    options.src_bands.len(),
                    options.dst_bands.len()
                ),
            )));
        }

        let kind = match self.transformers.get(&options.transformer.0) {
            Some(k) => k.clone(),
            None => {
                return Err(self.fail(NativeError::failure(
                    ErrorCode::ObjectNull,
                    format!("transformer {} does not exist", options.transformer.0),
                )))
            }
        };

        let (src_width, src_height, sources) = self
            .with_dataset(options.src, |d| {
                let bands: Option<Vec<SourceBand>> = options
                    .src_bands
                    .iter()
                    .map(|&i| {
                        let band = d.bands.get(i.checked_sub(1)?)?;
                        Some(SourceBand {
                            data: band.data.clone(),
                            mask: band.mask.clone(),
                        })
                    })
                    .collect();
                (d.width, d.height, bands)
            })?;
        let sources = sources.ok_or_else(|| {
            self.fail(NativeError::failure(ErrorCode::IllegalArg, "invalid source band index"))
        })?;

        let (dst_width, dst_height, targets) = self.with_dataset(options.dst, |d| {
            let bands: Option<Vec<(DataType, Vec<f64>)>> = options
                .dst_bands
                .iter()
                .map(|&i| {
                    let band = d.bands.get(i.checked_sub(1)?)?;
                    Some((band.dtype, band.data.clone()))
                })
                .collect();
            (d.width, d.height, bands)
        })?;
        let mut targets = targets.ok_or_else(|| {
            self.fail(NativeError::failure(ErrorCode::IllegalArg, "invalid destination band index"))
        })?;

        if !window.fits(Dimensions::new(dst_width, dst_height)) {
            return Err(self.fail(NativeError::failure(
                ErrorCode::IllegalArg,
                "warp window is outside the destination",
            )));
        }

        if let Some(init) = options.options.get("INIT_DEST") {
            for (b, (dtype, data)) in targets.iter_mut().enumerate() {
                let value = if init.eq_ignore_ascii_case("NO_DATA") {
                    options
                        .dst_nodata_real
                        .as_ref()
                        .and_then(|n| n.get(b).copied())
                        .unwrap_or(0.0)
                } else {
                    init.parse().unwrap_or(0.0)
                };
                let value = dtype.coerce(value);
                for row in window.y_offset..window.y_offset + window.height {
                    let start = row * dst_width + window.x_offset;
                    data[start..start + window.width].fill(value);
                }
            }
        }

        let live = LiveTransformer::new(&kind).map_err(|e| {
            self.push_report(NativeError::failure(ErrorCode::AppDefined, e.to_string()));
            e
        })?;
        let job = WarpJob {
            src_width,
            src_height,
            sources,
            src_nodata: options.src_nodata_real.clone(),
            unified_nodata: options
                .options
                .get_bool("UNIFIED_SRC_NODATA")
                .unwrap_or(false),
            resampling: options.resampling,
            window,
            scale: estimate_scale(&live, window),
        };

        debug!(
            src = options.src.0,
            dst = options.dst.0,
            threads,
            width = window.width,
            height = window.height,
            resampling = %options.resampling,
            "warping"
        );

        let rows: Vec<RowSamples> = if threads > 1 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()
                .map_err(|e| {
                    self.fail(NativeError::failure(
                        ErrorCode::AppDefined,
                        format!("failed to start warp workers: {}", e),
                    ))
                })?;
            // PROJ contexts are per worker
            pool.install(|| {
                (0..window.height)
                    .into_par_iter()
                    .map_init(
                        || LiveTransformer::new(&kind),
                        |live, row| match live {
                            Ok(live) => Ok(job.warp_row(live, row)),
                            Err(e) => Err(e.clone()),
                        },
                    )
                    .collect::<Result<Vec<_>>>()
            })?
        } else {
            (0..window.height).map(|row| job.warp_row(&live, row)).collect()
        };

        for (row, samples) in rows.iter().enumerate() {
            let start = (window.y_offset + row) * dst_width + window.x_offset;
            for ((dtype, data), band_samples) in targets.iter_mut().zip(samples) {
                for (col, value) in band_samples.iter().enumerate() {
                    if let Some(v) = value {
                        data[start + col] = dtype.coerce(*v);
                    }
                }
            }
        }

        self.with_dataset_mut(options.dst, |d| {
            for (&i, (_, data)) in options.dst_bands.iter().zip(targets) {
                d.bands[i - 1].data = data;
            }
        })?;
        debug!(dst = options.dst.0, "warp finished");
        Ok(())
    }
}

fn read_window<T: Pixel>(
    values: &[f64],
    width: usize,
    height: usize,
    nodata: Option<f64>,
    window: Window,
    mut view: ArrayViewMut2<'_, T>,
    resampling: Resampling,
) {
    let (rows, cols) = view.dim();
    if rows == window.height && cols == window.width {
        for ((r, c), out) in view.indexed_iter_mut() {
            *out = T::from_f64(values[(window.y_offset + r) * width + window.x_offset + c]);
        }
        return;
    }

    let grid = Grid::new(values, width, height).with_nodata(nodata);
    let sx = window.width as f64 / cols as f64;
    let sy = window.height as f64 / rows as f64;
    for ((r, c), out) in view.indexed_iter_mut() {
        let x = window.x_offset as f64 + (c as f64 + 0.5) * sx;
        let y = window.y_offset as f64 + (r as f64 + 0.5) * sy;
        let value = sample(&grid, resampling, x, y, (sx, sy))
            .or_else(|| grid.raw(x.floor() as i64, y.floor() as i64))
            .unwrap_or(0.0);
        *out = T::from_f64(value);
    }
}

fn write_window<T: Pixel>(
    values: &mut [f64],
    width: usize,
    dtype: DataType,
    window: Window,
    view: ArrayView2<'_, T>,
) {
    let (rows, cols) = view.dim();
    if rows == 0 || cols == 0 {
        return;
    }
    // nearest neighbour replication when shapes differ
    let pick = |i: usize, out_len: usize, in_len: usize| -> usize {
        if out_len == in_len {
            i
        } else {
            (((i as f64 + 0.5) * in_len as f64 / out_len as f64) as usize).min(in_len - 1)
        }
    };
    for wr in 0..window.height {
        let br = pick(wr, window.height, rows);
        for wc in 0..window.width {
            let bc = pick(wc, window.width, cols);
            values[(window.y_offset + wr) * width + window.x_offset + wc] =
                dtype.coerce(view[[br, bc]].to_f64());
        }
    }
}

impl RasterEngine for MemEngine {
    fn register_drivers(&self) {
        if self.drivers.insert(MEM_DRIVER.to_string()) {
            debug!(driver = MEM_DRIVER, "registered driver");
        }
    }

    fn has_driver(&self, name: &str) -> bool {
        self.drivers.contains(&name.to_uppercase())
    }

    fn create_dataset(
        &self,
        driver: &str,
        name: &str,
        width: usize,
        height: usize,
        count: usize,
        dtype: DataType,
    ) -> Result<DatasetH> {
        if !self.has_driver(driver) {
            return Err(self.fail(NativeError::failure(
                ErrorCode::OpenFailed,
                format!("driver {} is not registered", driver),
            )));
        }
        if width == 0 || height == 0 {
            return Err(self.fail(NativeError::failure(
                ErrorCode::IllegalArg,
                format!("invalid dataset size {}x{}", width, height),
            )));
        }

        let bands = (0..count)
            .map(|_| MemBand {
                dtype,
                data: vec![0.0; width * height],
                nodata: None,
                mask: None,
            })
            .collect();
        let id = self.next_id();
        self.datasets.insert(
            id,
            MemDataset {
                name: name.to_string(),
                width,
                height,
                bands,
                geo_transform: None,
                gcps: Vec::new(),
                gcp_crs: None,
                crs: None,
            },
        );
        trace!(id, name, width, height, count, %dtype, "created dataset");
        Ok(DatasetH(id))
    }

    fn close_dataset(&self, ds: DatasetH) {
        if self.datasets.remove(&ds.0).is_none() {
            trace!(id = ds.0, "close of unknown dataset ignored");
        }
    }

    fn dataset_size(&self, ds: DatasetH) -> Option<Dimensions> {
        self.datasets
            .get(&ds.0)
            .map(|d| Dimensions::new(d.width, d.height))
    }

    fn band_count(&self, ds: DatasetH) -> usize {
        self.datasets.get(&ds.0).map_or(0, |d| d.bands.len())
    }

    fn set_geo_transform(&self, ds: DatasetH, transform: &GeoTransform) -> Result<()> {
        self.with_dataset_mut(ds, |d| d.geo_transform = Some(*transform))
    }

    fn geo_transform(&self, ds: DatasetH) -> Option<GeoTransform> {
        self.datasets.get(&ds.0).and_then(|d| d.geo_transform)
    }

    fn set_gcps(&self, ds: DatasetH, gcps: &[Gcp], crs: Option<&Crs>) -> Result<()> {
        self.with_dataset_mut(ds, |d| {
            d.gcps = gcps.to_vec();
            d.gcp_crs = crs.cloned();
        })
    }

    fn gcps(&self, ds: DatasetH) -> Vec<Gcp> {
        self.datasets
            .get(&ds.0)
            .map(|d| d.gcps.clone())
            .unwrap_or_default()
    }

    fn set_crs(&self, ds: DatasetH, crs: &Crs) -> Result<()> {
        self.with_dataset_mut(ds, |d| d.crs = Some(crs.clone()))
    }

    fn crs(&self, ds: DatasetH) -> Option<Crs> {
        self.datasets.get(&ds.0).and_then(|d| d.crs.clone())
    }

    fn band(&self, ds: DatasetH, index: usize) -> Option<BandH> {
        let count = self.datasets.get(&ds.0)?.bands.len();
        (index >= 1 && index <= count).then_some(BandH {
            dataset: ds,
            index,
            mask: false,
        })
    }

    fn band_dtype(&self, band: BandH) -> Option<DataType> {
        if band.mask {
            return Some(DataType::U8);
        }
        let d = self.datasets.get(&band.dataset.0)?;
        d.bands.get(band.index.checked_sub(1)?).map(|b| b.dtype)
    }

    fn band_nodata(&self, band: BandH) -> Option<f64> {
        if band.mask {
            return None;
        }
        let d = self.datasets.get(&band.dataset.0)?;
        d.bands.get(band.index.checked_sub(1)?)?.nodata
    }

    fn set_band_nodata(&self, band: BandH, value: f64) -> Result<()> {
        self.with_band_mut(band, |b| b.nodata = Some(value))
    }

    fn delete_band_nodata(&self, band: BandH) -> Result<()> {
        if !self.nodata_deletion {
            return Err(self.fail(NativeError::failure(
                ErrorCode::NotSupported,
                "this engine cannot delete nodata values",
            )));
        }
        self.with_band_mut(band, |b| b.nodata = None)
    }

    fn mask_band(&self, band: BandH) -> Option<BandH> {
        if band.mask {
            return None;
        }
        let d = self.datasets.get(&band.dataset.0)?;
        let b = d.bands.get(band.index.checked_sub(1)?)?;
        b.mask.as_ref().map(|_| BandH {
            mask: true,
            ..band
        })
    }

    fn create_mask_band(&self, band: BandH) -> Result<BandH> {
        let size = self
            .dataset_size(band.dataset)
            .ok_or_else(|| self.no_dataset(band.dataset))?;
        self.with_band_mut(band, |b| {
            if b.mask.is_none() {
                b.mask = Some(vec![255.0; size.pixel_count()]);
            }
        })?;
        Ok(BandH { mask: true, ..band })
    }

    fn band_io<T: Pixel>(
        &self,
        band: BandH,
        window: Window,
        buffer: BandBuffer<'_, T>,
        resampling: Resampling,
    ) -> i32 {
        if buffer.mode() == IoMode::Read && !resampling.supports_transfer() {
            return self.failed_io(
                ErrorCode::NotSupported,
                format!("{} resampling is not supported for raster I/O", resampling),
            );
        }

        let Some(mut ds) = self.datasets.get_mut(&band.dataset.0) else {
            return self.failed_io(
                ErrorCode::ObjectNull,
                format!("dataset {} does not exist", band.dataset.0),
            );
        };
        let (width, height) = (ds.width, ds.height);
        if !window.fits(Dimensions::new(width, height)) {
            return self.failed_io(
                ErrorCode::IllegalArg,
                format!(
                    "access window out of range: {}x{} at ({}, {}) on a {}x{} band",
                    window.width, window.height, window.x_offset, window.y_offset, width, height
                ),
            );
        }
        let Some(mem_band) = band.index.checked_sub(1).and_then(|i| ds.bands.get_mut(i)) else {
            return self.failed_io(
                ErrorCode::ObjectNull,
                format!("band {} does not exist", band.index),
            );
        };

        let (dtype, nodata, values) = if band.mask {
            match mem_band.mask.as_mut() {
                Some(mask) => (DataType::U8, None, mask),
                None => {
                    return self.failed_io(
                        ErrorCode::ObjectNull,
                        format!("band {} has no mask", band.index),
                    )
                }
            }
        } else {
            (mem_band.dtype, mem_band.nodata, &mut mem_band.data)
        };

        match buffer {
            BandBuffer::Read(view) => {
                if view.is_empty() {
                    return IO_OK;
                }
                read_window(values, width, height, nodata, window, view, resampling)
            }
            BandBuffer::Write(view) => write_window(values, width, dtype, window, view),
        }
        IO_OK
    }

    fn dataset_io<T: Pixel>(
        &self,
        ds: DatasetH,
        window: Window,
        mut buffer: MultiBandBuffer<'_, T>,
        bands: &[usize],
        resampling: Resampling,
    ) -> i32 {
        if buffer.shape().0 != bands.len() {
            return self.failed_io(
                ErrorCode::IllegalArg,
                format!(
                    "buffer has {} bands but {} were selected",
                    buffer.shape().0,
                    bands.len()
                ),
            );
        }
        for (i, &index) in bands.iter().enumerate() {
            let band = BandH {
                dataset: ds,
                index,
                mask: false,
            };
            let Some(slice) = buffer.band(i) else {
                return self.failed_io(ErrorCode::ObjectNull, format!("no buffer slice for band {}", index));
            };
            let status = self.band_io(band, window, slice, resampling);
            if status != IO_OK {
                return status;
            }
        }
        IO_OK
    }

    fn create_gen_img_proj_transformer(
        &self,
        src: DatasetH,
        dst: Option<DatasetH>,
        options: &OptionList,
    ) -> Result<TransformerH> {
        if let Some(order) = options.get("MAX_GCP_ORDER") {
            if !matches!(order.trim(), "1" | "-1") {
                return Err(self.fail(NativeError::failure(
                    ErrorCode::NotSupported,
                    format!("GCP polynomial order {} is not supported", order),
                )));
            }
        }
        let gcps_ok = options.get_bool("GCPS_OK").unwrap_or(false);
        let check_with_invert = options
            .get_bool("CHECK_WITH_INVERT_PROJ")
            .or_else(|| self.config_option("CHECK_WITH_INVERT_PROJ").map(|v| parse_bool(&v)))
            .unwrap_or(false);

        let src_info = self.georef_info(src)?;
        let src_method = options.get("SRC_METHOD");
        let src_georef =
            GenImgProj::side_georef(src_method, src_info.transform, &src_info.gcps, gcps_ok)
                .map_err(|e| self.fail(e))?;
        let src_uses_gcps = match src_method {
            Some(m) => m.eq_ignore_ascii_case("GCP_POLYNOMIAL"),
            None => src_info.transform.is_none(),
        };
        let src_crs = match self.parse_crs_option(options, "SRC_SRS")? {
            Some(crs) => Some(crs),
            None if src_uses_gcps => src_info.gcp_crs.or(src_info.crs),
            None => src_info.crs,
        };

        let (dst_georef, dst_crs) = match dst {
            Some(dst) => {
                let info = self.georef_info(dst)?;
                let georef = GenImgProj::side_georef(
                    options.get("DST_METHOD"),
                    info.transform,
                    &info.gcps,
                    gcps_ok,
                )
                .map_err(|e| self.fail(e))?;
                let crs = match self.parse_crs_option(options, "DST_SRS")? {
                    Some(crs) => Some(crs),
                    None if info.transform.is_none() => info.gcp_crs.or(info.crs),
                    None => info.crs,
                };
                (Some(georef), crs)
            }
            None => (
                None,
                self.parse_crs_option(options, "DST_SRS")?.or_else(|| src_crs.clone()),
            ),
        };

        let kind = TransformerKind::GenImgProj(GenImgProj {
            src: src_georef,
            dst: dst_georef,
            src_crs,
            dst_crs,
            check_with_invert,
        });
        // surfaces a missing transformation path now rather than mid-warp
        LiveTransformer::new(&kind).map_err(|e| {
            self.push_report(NativeError::failure(ErrorCode::AppDefined, e.to_string()));
            e
        })?;

        let id = self.next_id();
        self.transformers.insert(id, kind);
        debug!(id, src = src.0, dst = ?dst.map(|d| d.0), "created image-to-image transformer");
        Ok(TransformerH(id))
    }

    fn create_approx_transformer(&self, inner: TransformerH, max_error: f64) -> Result<TransformerH> {
        if !(max_error >= 0.0) {
            return Err(self.fail(NativeError::failure(
                ErrorCode::IllegalArg,
                format!("invalid approximation error {}", max_error),
            )));
        }
        let Some((_, inner_kind)) = self.transformers.remove(&inner.0) else {
            return Err(self.fail(NativeError::failure(
                ErrorCode::ObjectNull,
                format!("transformer {} does not exist", inner.0),
            )));
        };

        let id = self.next_id();
        self.transformers.insert(
            id,
            TransformerKind::Approx {
                inner: Box::new(inner_kind),
                max_error,
            },
        );
        debug!(id, inner = inner.0, max_error, "created approximate transformer");
        Ok(TransformerH(id))
    }

    fn destroy_transformer(&self, transformer: TransformerH) {
        if self.transformers.remove(&transformer.0).is_some() {
            trace!(id = transformer.0, "destroyed transformer");
        }
    }

    fn transform(
        &self,
        transformer: TransformerH,
        dst_to_src: bool,
        xs: &mut [f64],
        ys: &mut [f64],
    ) -> Vec<bool> {
        let kind = self.transformers.get(&transformer.0).map(|k| k.clone());
        let live = kind.as_ref().map(LiveTransformer::new);
        match live {
            Some(Ok(live)) => live.transform(dst_to_src, xs, ys),
            Some(Err(e)) => {
                self.push_report(NativeError::failure(ErrorCode::AppDefined, e.to_string()));
                vec![false; xs.len()]
            }
            None => {
                self.push_report(NativeError::failure(
                    ErrorCode::ObjectNull,
                    format!("transformer {} does not exist", transformer.0),
                ));
                vec![false; xs.len()]
            }
        }
    }

    fn chunk_and_warp_image(&self, options: &WarpOptions, window: Window) -> Result<()> {
        self.warp(options, window, 1)
    }

    fn chunk_and_warp_multi(&self, options: &WarpOptions, window: Window) -> Result<()> {
        self.warp(options, window, Self::thread_count(&options.options))
    }

    fn suggested_warp_output(
        &self,
        ds: DatasetH,
        transformer: TransformerH,
        max_error: f64,
    ) -> Result<SuggestedWarpOutput> {
        let size = self.dataset_size(ds).ok_or_else(|| self.no_dataset(ds))?;
        let kind = match self.transformers.get(&transformer.0) {
            Some(k) => k.clone(),
            None => {
                return Err(self.fail(NativeError::failure(
                    ErrorCode::ObjectNull,
                    format!("transformer {} does not exist", transformer.0),
                )))
            }
        };
        let live = LiveTransformer::new(&kind)?;

        let suggestion = suggest_output(&live, size.width, size.height, max_error)
            .map_err(|e| self.fail(e))?;
        if suggestion.failed > 0 {
            self.push_report(NativeError::failure(
                ErrorCode::AppDefined,
                format!(
                    "Reprojection failed for {} of {} points, further errors will be suppressed on the transform object.",
                    suggestion.failed, suggestion.total
                ),
            ));
        }
        Ok(suggestion.output)
    }

    fn config_option(&self, key: &str) -> Option<String> {
        self.config.get(&key.to_uppercase()).map(|v| v.clone())
    }

    fn set_config_option(&self, key: &str, value: Option<&str>) {
        let key = key.to_uppercase();
        match value {
            Some(v) => {
                self.config.insert(key, v.to_string());
            }
            None => {
                self.config.remove(&key);
            }
        }
    }

    fn error_reports(&self) -> Vec<NativeError> {
        self.errors
            .get(&thread::current().id())
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    fn truncate_error_reports(&self, len: usize) {
        let id = thread::current().id();
        if len == 0 {
            self.errors.remove(&id);
        } else if let Some(mut reports) = self.errors.get_mut(&id) {
            reports.truncate(len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IDENTITY_GEO_TRANSFORM;
    use ndarray::{array, Array2, Array3};

    fn engine() -> MemEngine {
        let engine = MemEngine::new();
        engine.register_drivers();
        engine
    }

    fn dataset(engine: &MemEngine, width: usize, height: usize, count: usize, dtype: DataType) -> DatasetH {
        engine
            .create_dataset(MEM_DRIVER, "test", width, height, count, dtype)
            .unwrap()
    }

    #[test]
    fn test_create_requires_registered_driver() {
        let engine = MemEngine::new();
        let result = engine.create_dataset(MEM_DRIVER, "x", 2, 2, 1, DataType::U8);
        assert!(matches!(result, Err(Error::Native(ref r)) if r.code == ErrorCode::OpenFailed));
        assert_eq!(engine.error_reports().len(), 1);

        engine.register_drivers();
        assert!(engine.has_driver("mem"));
        let ds = dataset(&engine, 2, 2, 1, DataType::U8);
        assert_eq!(engine.open_dataset_count(), 1);
        engine.close_dataset(ds);
        assert_eq!(engine.open_dataset_count(), 0);
    }

    #[test]
    fn test_band_io_roundtrip_coerces_to_band_type() {
        let engine = engine();
        let ds = dataset(&engine, 3, 2, 1, DataType::U8);
        let band = engine.band(ds, 1).unwrap();

        let input = array![[1.4f64, 300.0, -2.0], [7.0, 8.6, 9.0]];
        let status = engine.band_io(band, Window::new(0, 0, 3, 2), BandBuffer::Write(input.view()), Resampling::Nearest);
        assert_eq!(status, IO_OK);

        let mut out = Array2::<f64>::zeros((2, 3));
        let status = engine.band_io(band, Window::new(0, 0, 3, 2), BandBuffer::Read(out.view_mut()), Resampling::Nearest);
        assert_eq!(status, IO_OK);
        assert_eq!(out, array![[1.0, 255.0, 0.0], [7.0, 9.0, 9.0]]);
    }

    #[test]
    fn test_band_io_window_out_of_range() {
        let engine = engine();
        let ds = dataset(&engine, 2, 2, 1, DataType::F32);
        let band = engine.band(ds, 1).unwrap();
        let mut out = Array2::<f32>::zeros((2, 2));
        let status = engine.band_io(band, Window::new(1, 1, 2, 2), BandBuffer::Read(out.view_mut()), Resampling::Nearest);
        assert_eq!(status, 3);
        let reports = engine.error_reports();
        assert!(reports.last().unwrap().message.contains("access window out of range"));
    }

    #[test]
    fn test_band_io_honours_strides() {
        let engine = engine();
        let ds = dataset(&engine, 2, 2, 1, DataType::I16);
        let band = engine.band(ds, 1).unwrap();
        let input = array![[1i16, 2], [3, 4]];
        // transposed view is not contiguous in standard order
        engine.band_io(band, Window::new(0, 0, 2, 2), BandBuffer::Write(input.t()), Resampling::Nearest);

        let mut out = Array2::<i16>::zeros((2, 2));
        engine.band_io(band, Window::new(0, 0, 2, 2), BandBuffer::Read(out.view_mut()), Resampling::Nearest);
        assert_eq!(out, array![[1, 3], [2, 4]]);
    }

    #[test]
    fn test_read_decimates_and_replicates() {
        let engine = engine();
        let ds = dataset(&engine, 4, 4, 1, DataType::F64);
        let band = engine.band(ds, 1).unwrap();
        let input = Array2::from_shape_fn((4, 4), |(r, c)| (r * 4 + c) as f64);
        engine.band_io(band, Window::new(0, 0, 4, 4), BandBuffer::Write(input.view()), Resampling::Nearest);

        let mut small = Array2::<f64>::zeros((2, 2));
        engine.band_io(band, Window::new(0, 0, 4, 4), BandBuffer::Read(small.view_mut()), Resampling::Nearest);
        assert_eq!(small, array![[5.0, 7.0], [13.0, 15.0]]);

        engine.band_io(band, Window::new(0, 0, 4, 4), BandBuffer::Read(small.view_mut()), Resampling::Average);
        assert_eq!(small, array![[2.5, 4.5], [10.5, 12.5]]);

        let mut large = Array2::<f64>::zeros((4, 4));
        engine.band_io(band, Window::new(0, 0, 2, 2), BandBuffer::Read(large.view_mut()), Resampling::Nearest);
        assert_eq!(large.row(0).to_vec(), vec![0.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn test_unsupported_transfer_resampling() {
        let engine = engine();
        let ds = dataset(&engine, 2, 2, 1, DataType::U8);
        let band = engine.band(ds, 1).unwrap();
        let mut out = Array2::<u8>::zeros((1, 1));
        let status = engine.band_io(band, Window::new(0, 0, 2, 2), BandBuffer::Read(out.view_mut()), Resampling::Max);
        assert_eq!(status, 3);
    }

    #[test]
    fn test_masks_are_explicit() {
        let engine = engine();
        let ds = dataset(&engine, 2, 2, 2, DataType::U8);
        let band = engine.band(ds, 2).unwrap();
        assert!(engine.mask_band(band).is_none());

        let mask = engine.create_mask_band(band).unwrap();
        assert_eq!(engine.mask_band(band), Some(mask));
        assert_eq!(engine.band_dtype(mask), Some(DataType::U8));

        let mut out = Array2::<u8>::zeros((2, 2));
        let status = engine.band_io(mask, Window::new(0, 0, 2, 2), BandBuffer::Read(out.view_mut()), Resampling::Nearest);
        assert_eq!(status, IO_OK);
        assert!(out.iter().all(|v| *v == 255));
    }

    #[test]
    fn test_nodata_deletion_capability() {
        let engine = engine();
        let ds = dataset(&engine, 1, 1, 1, DataType::U8);
        let band = engine.band(ds, 1).unwrap();
        engine.set_band_nodata(band, 9.0).unwrap();
        assert_eq!(engine.band_nodata(band), Some(9.0));
        engine.delete_band_nodata(band).unwrap();
        assert_eq!(engine.band_nodata(band), None);

        let old = MemEngine::without_nodata_deletion();
        old.register_drivers();
        let ds = dataset(&old, 1, 1, 1, DataType::U8);
        let band = old.band(ds, 1).unwrap();
        assert!(matches!(old.delete_band_nodata(band), Err(Error::Unsupported(_))));
    }

    #[test]
    fn test_dataset_io_checks_band_axis() {
        let engine = engine();
        let ds = dataset(&engine, 2, 2, 2, DataType::U8);
        let data = Array3::<u8>::zeros((1, 2, 2));
        let status = engine.dataset_io(ds, Window::new(0, 0, 2, 2), MultiBandBuffer::Write(data.view()), &[1, 2], Resampling::Nearest);
        assert_eq!(status, 3);
    }

    #[test]
    fn test_approx_takes_ownership_of_inner() {
        let engine = engine();
        let crs = Crs::from_epsg(4326).unwrap();
        let src = dataset(&engine, 4, 4, 1, DataType::U8);
        let dst = dataset(&engine, 4, 4, 1, DataType::U8);
        for ds in [src, dst] {
            engine.set_geo_transform(ds, &[0.0, 1.0, 0.0, 4.0, 0.0, -1.0]).unwrap();
            engine.set_crs(ds, &crs).unwrap();
        }

        let exact = engine
            .create_gen_img_proj_transformer(src, Some(dst), &OptionList::new())
            .unwrap();
        assert_eq!(engine.transformer_count(), 1);
        let approx = engine.create_approx_transformer(exact, 0.125).unwrap();
        assert_eq!(engine.transformer_count(), 1);

        let mut xs = [0.5, 1.5, 2.5, 3.5];
        let mut ys = [0.5; 4];
        assert_eq!(engine.transform(approx, true, &mut xs, &mut ys), vec![true; 4]);
        for (x, expected) in xs.iter().zip([0.5, 1.5, 2.5, 3.5]) {
            assert!((x - expected).abs() < 1e-9);
        }

        engine.destroy_transformer(approx);
        assert_eq!(engine.transformer_count(), 0);
    }

    #[test]
    fn test_transformer_needs_georeferencing() {
        let engine = engine();
        let src = dataset(&engine, 4, 4, 1, DataType::U8);
        let result = engine.create_gen_img_proj_transformer(src, None, &OptionList::new());
        assert!(result.is_err());
        assert_eq!(engine.transformer_count(), 0);

        let options = OptionList::new().with("SRC_METHOD", "NO_GEOTRANSFORM");
        assert!(engine.create_gen_img_proj_transformer(src, None, &options).is_ok());

        let options = OptionList::new().with("GCPS_OK", "TRUE").with("MAX_GCP_ORDER", 2);
        let result = engine.create_gen_img_proj_transformer(src, None, &options);
        assert!(matches!(result, Err(Error::Unsupported(_))));
    }

    #[test]
    fn test_warp_identity_copies_pixels() {
        let engine = engine();
        let crs = Crs::from_epsg(3857).unwrap();
        let src = dataset(&engine, 3, 3, 1, DataType::F32);
        let dst = dataset(&engine, 3, 3, 1, DataType::F32);
        for ds in [src, dst] {
            engine.set_geo_transform(ds, &[10.0, 2.0, 0.0, 20.0, 0.0, -2.0]).unwrap();
            engine.set_crs(ds, &crs).unwrap();
        }
        let input = Array2::from_shape_fn((3, 3), |(r, c)| (r * 3 + c) as f32);
        let band = engine.band(src, 1).unwrap();
        engine.band_io(band, Window::new(0, 0, 3, 3), BandBuffer::Write(input.view()), Resampling::Nearest);

        let t = engine.create_gen_img_proj_transformer(src, Some(dst), &OptionList::new()).unwrap();
        let mut options = WarpOptions::new(src, dst, t);
        options.src_bands = vec![1];
        options.dst_bands = vec![1];
        for threads in ["1", "3"] {
            options.options.set("NUM_THREADS", threads);
            engine.chunk_and_warp_multi(&options, Window::new(0, 0, 3, 3)).unwrap();

            let mut out = Array2::<f32>::zeros((3, 3));
            engine.band_io(engine.band(dst, 1).unwrap(), Window::new(0, 0, 3, 3), BandBuffer::Read(out.view_mut()), Resampling::Nearest);
            assert_eq!(out, input);
        }
        engine.destroy_transformer(t);
    }

    #[test]
    fn test_warp_init_dest_and_nodata() {
        let engine = engine();
        let crs = Crs::from_epsg(4326).unwrap();
        let src = dataset(&engine, 2, 2, 1, DataType::U8);
        let dst = dataset(&engine, 4, 2, 1, DataType::U8);
        engine.set_geo_transform(src, &[0.0, 1.0, 0.0, 2.0, 0.0, -1.0]).unwrap();
        engine.set_geo_transform(dst, &[0.0, 1.0, 0.0, 2.0, 0.0, -1.0]).unwrap();
        engine.set_crs(src, &crs).unwrap();
        engine.set_crs(dst, &crs).unwrap();
        let input = array![[5u8, 6], [7, 0]];
        engine.band_io(engine.band(src, 1).unwrap(), Window::new(0, 0, 2, 2), BandBuffer::Write(input.view()), Resampling::Nearest);

        let t = engine.create_gen_img_proj_transformer(src, Some(dst), &OptionList::new()).unwrap();
        let mut options = WarpOptions::new(src, dst, t);
        options.src_bands = vec![1];
        options.dst_bands = vec![1];
        options.src_nodata_real = Some(vec![0.0]);
        options.dst_nodata_real = Some(vec![99.0]);
        options.options.set("INIT_DEST", "NO_DATA");
        engine.chunk_and_warp_image(&options, Window::new(0, 0, 4, 2)).unwrap();

        let mut out = Array2::<u8>::zeros((2, 4));
        engine.band_io(engine.band(dst, 1).unwrap(), Window::new(0, 0, 4, 2), BandBuffer::Read(out.view_mut()), Resampling::Nearest);
        assert_eq!(out, array![[5, 6, 99, 99], [7, 99, 99, 99]]);
        engine.destroy_transformer(t);
    }

    #[test]
    fn test_warp_rejects_gauss() {
        let engine = engine();
        let ds = dataset(&engine, 2, 2, 1, DataType::U8);
        engine.set_geo_transform(ds, &IDENTITY_GEO_TRANSFORM).unwrap();
        let t = engine.create_gen_img_proj_transformer(ds, Some(ds), &OptionList::new()).unwrap();
        let mut options = WarpOptions::new(ds, ds, t);
        options.resampling = Resampling::Gauss;
        options.src_bands = vec![1];
        options.dst_bands = vec![1];
        let result = engine.chunk_and_warp_image(&options, Window::new(0, 0, 2, 2));
        assert!(matches!(result, Err(Error::Unsupported(_))));
    }

    #[test]
    fn test_suggested_output_identity() {
        let engine = engine();
        let ds = dataset(&engine, 20, 10, 1, DataType::U8);
        let gt = [100.0, 5.0, 0.0, 200.0, 0.0, -5.0];
        engine.set_geo_transform(ds, &gt).unwrap();
        engine.set_crs(ds, &Crs::from_epsg(32633).unwrap()).unwrap();
        let options = OptionList::new().with("DST_SRS", "EPSG:32633");
        let t = engine.create_gen_img_proj_transformer(ds, None, &options).unwrap();

        let out = engine.suggested_warp_output(ds, t, 1000.0).unwrap();
        assert_eq!((out.width, out.height), (20, 10));
        for (a, b) in out.geo_transform.iter().zip(gt.iter()) {
            assert!((a - b).abs() < 1e-9);
        }
        assert!(engine.error_reports().is_empty());
    }

    #[test]
    fn test_config_options_and_error_stack_are_scoped() {
        let engine = engine();
        engine.set_config_option("check_with_invert_proj", Some("YES"));
        assert_eq!(engine.config_option("CHECK_WITH_INVERT_PROJ").as_deref(), Some("YES"));
        engine.set_config_option("CHECK_WITH_INVERT_PROJ", None);
        assert!(engine.config_option("CHECK_WITH_INVERT_PROJ").is_none());

        engine.close_dataset(DatasetH(999));
        let _ = engine.set_crs(DatasetH(999), &Crs::from_epsg(4326).unwrap());
        assert_eq!(engine.error_reports().len(), 1);
        let other = std::thread::scope(|s| s.spawn(|| engine.error_reports().len()).join().unwrap());
        assert_eq!(other, 0);
        let _ = engine.set_crs(DatasetH(998), &Crs::from_epsg(4326).unwrap());
        engine.truncate_error_reports(1);
        assert_eq!(engine.error_reports().len(), 1);
        assert!(engine.error_reports()[0].message.contains("999"));
        engine.clear_error_reports();
        assert!(engine.error_reports().is_empty());
    }
}
