#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicIsize, Ordering};
use std::io::Write;
use std::sync::{Arc, Mutex, Once};

use tracing_subscriber::fmt::MakeWriter;

use rasterbridge::engine::{SuggestedWarpOutput, WarpOptions};
use rasterbridge::{
    BandBuffer, BandH, Crs, DataType, DatasetH, Dimensions, Error, ErrorCode, Gcp, GeoTransform,
    MemEngine, MultiBandBuffer, NativeError, OptionList, Pixel, RasterEngine, Resampling,
    Result, TransformerH, Window,
};

/// Routes crate logs to the test harness, filtered by `RUST_LOG`
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Log sink shared between a test and the subscriber it installs
#[derive(Clone, Default)]
pub struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    pub fn contents(&self) -> String {
        let bytes = self.0.lock().unwrap_or_else(|e| e.into_inner());
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = CapturedLogs;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Runs `f` with warnings and errors written to a buffer instead of the harness
pub fn capture_warnings<R>(f: impl FnOnce() -> R) -> (R, String) {
    let logs = CapturedLogs::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(logs.clone())
        .with_max_level(tracing::Level::WARN)
        .with_ansi(false)
        .finish();
    let result = tracing::subscriber::with_default(subscriber, f);
    (result, logs.contents())
}

/// Engine calls that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    CreateDataset,
    SetGeoTransform,
    SetCrs,
    BandIo,
    GenImgProj,
    Approx,
    Warp,
    SuggestedOutput,
}

/// Wraps [`MemEngine`], counting live handles and injecting failures
pub struct CountingEngine {
    inner: MemEngine,
    datasets: AtomicIsize,
    transformers: AtomicIsize,
    /// step -> number of successful calls left before it fails
    failures: Mutex<HashMap<Step, usize>>,
    io_status: Mutex<Option<i32>>,
}

impl CountingEngine {
    pub fn new() -> Self {
        init_tracing();
        Self {
            inner: MemEngine::new(),
            datasets: AtomicIsize::new(0),
            transformers: AtomicIsize::new(0),
            failures: Mutex::new(HashMap::new()),
            io_status: Mutex::new(None),
        }
    }

    /// Fails `step` after `after` successful calls
    pub fn fail_at(&self, step: Step, after: usize) {
        self.failures.lock().unwrap().insert(step, after);
    }

    /// Makes every band transfer return `status`
    pub fn io_status(&self, status: i32) {
        *self.io_status.lock().unwrap() = Some(status);
    }

    pub fn live_datasets(&self) -> isize {
        self.datasets.load(Ordering::SeqCst)
    }

    pub fn live_transformers(&self) -> isize {
        self.transformers.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &MemEngine {
        &self.inner
    }

    /// Asserts the stub and the wrapped engine agree that nothing leaked
    pub fn assert_no_leaks(&self, owned_datasets: usize) {
        assert_eq!(self.live_datasets(), owned_datasets as isize);
        assert_eq!(self.live_transformers(), 0);
        assert_eq!(self.inner.open_dataset_count(), owned_datasets);
        assert_eq!(self.inner.transformer_count(), 0);
    }

    fn injected(&self, step: Step) -> Option<Error> {
        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(&step) {
            Some(0) => {
                failures.remove(&step);
                Some(NativeError::failure(ErrorCode::AppDefined, format!("injected failure at {:?}", step)).into())
            }
            Some(left) => {
                *left -= 1;
                None
            }
            None => None,
        }
    }
}

impl RasterEngine for CountingEngine {
    fn register_drivers(&self) {
        self.inner.register_drivers()
    }

    fn has_driver(&self, name: &str) -> bool {
        self.inner.has_driver(name)
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
        if let Some(e) = self.injected(Step::CreateDataset) {
            return Err(e);
        }
        let ds = self.inner.create_dataset(driver, name, width, height, count, dtype)?;
        self.datasets.fetch_add(1, Ordering::SeqCst);
        Ok(ds)
    }

    fn close_dataset(&self, ds: DatasetH) {
        if self.inner.dataset_size(ds).is_some() {
            self.datasets.fetch_sub(1, Ordering::SeqCst);
        }
        self.inner.close_dataset(ds)
    }

    fn dataset_size(&self, ds: DatasetH) -> Option<Dimensions> {
        self.inner.dataset_size(ds)
    }

    fn band_count(&self, ds: DatasetH) -> usize {
        self.inner.band_count(ds)
    }

    fn set_geo_transform(&self, ds: DatasetH, transform: &GeoTransform) -> Result<()> {
        if let Some(e) = self.injected(Step::SetGeoTransform) {
            return Err(e);
        }
        self.inner.set_geo_transform(ds, transform)
    }

    fn geo_transform(&self, ds: DatasetH) -> Option<GeoTransform> {
        self.inner.geo_transform(ds)
    }

    fn set_gcps(&self, ds: DatasetH, gcps: &[Gcp], crs: Option<&Crs>) -> Result<()> {
        self.inner.set_gcps(ds, gcps, crs)
    }

    fn gcps(&self, ds: DatasetH) -> Vec<Gcp> {
        self.inner.gcps(ds)
    }

    fn set_crs(&self, ds: DatasetH, crs: &Crs) -> Result<()> {
        if let Some(e) = self.injected(Step::SetCrs) {
            return Err(e);
        }
        self.inner.set_crs(ds, crs)
    }

    fn crs(&self, ds: DatasetH) -> Option<Crs> {
        self.inner.crs(ds)
    }

    fn band(&self, ds: DatasetH, index: usize) -> Option<BandH> {
        self.inner.band(ds, index)
    }

    fn band_dtype(&self, band: BandH) -> Option<DataType> {
        self.inner.band_dtype(band)
    }

    fn band_nodata(&self, band: BandH) -> Option<f64> {
        self.inner.band_nodata(band)
    }

    fn set_band_nodata(&self, band: BandH, value: f64) -> Result<()> {
        self.inner.set_band_nodata(band, value)
    }

    fn delete_band_nodata(&self, band: BandH) -> Result<()> {
        self.inner.delete_band_nodata(band)
    }

    fn mask_band(&self, band: BandH) -> Option<BandH> {
        self.inner.mask_band(band)
    }

    fn create_mask_band(&self, band: BandH) -> Result<BandH> {
        self.inner.create_mask_band(band)
    }

    fn band_io<T: Pixel>(
        &self,
        band: BandH,
        window: Window,
        buffer: BandBuffer<'_, T>,
        resampling: Resampling,
    ) -> i32 {
        if let Some(status) = *self.io_status.lock().unwrap() {
            return status;
        }
        if self.injected(Step::BandIo).is_some() {
            return 3;
        }
        self.inner.band_io(band, window, buffer, resampling)
    }

    fn dataset_io<T: Pixel>(
        &self,
        ds: DatasetH,
        window: Window,
        buffer: MultiBandBuffer<'_, T>,
        bands: &[usize],
        resampling: Resampling,
    ) -> i32 {
        if let Some(status) = *self.io_status.lock().unwrap() {
            return status;
        }
        if self.injected(Step::BandIo).is_some() {
            return 3;
        }
        self.inner.dataset_io(ds, window, buffer, bands, resampling)
    }

    fn create_gen_img_proj_transformer(
        &self,
        src: DatasetH,
        dst: Option<DatasetH>,
        options: &OptionList,
    ) -> Result<TransformerH> {
        if let Some(e) = self.injected(Step::GenImgProj) {
            return Err(e);
        }
        let t = self.inner.create_gen_img_proj_transformer(src, dst, options)?;
        self.transformers.fetch_add(1, Ordering::SeqCst);
        Ok(t)
    }

    fn create_approx_transformer(&self, inner: TransformerH, max_error: f64) -> Result<TransformerH> {
        if let Some(e) = self.injected(Step::Approx) {
            return Err(e);
        }
        // the inner transformer is consumed, so the live count is unchanged
        self.inner.create_approx_transformer(inner, max_error)
    }

    fn destroy_transformer(&self, transformer: TransformerH) {
        let before = self.inner.transformer_count();
        self.inner.destroy_transformer(transformer);
        if self.inner.transformer_count() < before {
            self.transformers.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn transform(&self, transformer: TransformerH, dst_to_src: bool, xs: &mut [f64], ys: &mut [f64]) -> Vec<bool> {
        self.inner.transform(transformer, dst_to_src, xs, ys)
    }

    fn chunk_and_warp_image(&self, options: &WarpOptions, window: Window) -> Result<()> {
        if let Some(e) = self.injected(Step::Warp) {
            return Err(e);
        }
        self.inner.chunk_and_warp_image(options, window)
    }

    fn chunk_and_warp_multi(&self, options: &WarpOptions, window: Window) -> Result<()> {
        if let Some(e) = self.injected(Step::Warp) {
            return Err(e);
        }
        self.inner.chunk_and_warp_multi(options, window)
    }

    fn suggested_warp_output(&self, ds: DatasetH, transformer: TransformerH, max_error: f64) -> Result<SuggestedWarpOutput> {
        if let Some(e) = self.injected(Step::SuggestedOutput) {
            return Err(e);
        }
        self.inner.suggested_warp_output(ds, transformer, max_error)
    }

    fn config_option(&self, key: &str) -> Option<String> {
        self.inner.config_option(key)
    }

    fn set_config_option(&self, key: &str, value: Option<&str>) {
        self.inner.set_config_option(key, value)
    }

    fn error_reports(&self) -> Vec<NativeError> {
        self.inner.error_reports()
    }

    fn truncate_error_reports(&self, len: usize) {
        self.inner.truncate_error_reports(len)
    }
}

/// North-up geotransform with 1-unit pixels and its top-left corner at (x, 4)
pub fn unit_transform(x: f64) -> GeoTransform {
    [x, 1.0, 0.0, 4.0, 0.0, -1.0]
}
