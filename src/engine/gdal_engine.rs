//! [`RasterEngine`] on top of GDAL.
//!
//! Datasets live in GDAL's MEM driver, transfers go through `GDALRasterIOEx`
//! and reprojection through the GenImgProj/approximate transformers and the
//! chunked warper. GDAL reports are routed through a CPL error handler into a
//! per-thread stack, which is what [`RasterEngine::error_reports`] exposes.

use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Once;

use dashmap::DashMap;
use gdal::cpl::CslStringList;
use gdal::DriverManager;
use gdal_sys::{CPLErr, GDALRIOResampleAlg, GDALRWFlag, GDALResampleAlg};
use libc::{c_char, c_int, c_void};
use ndarray::{ArrayView2, ArrayViewMut2};
use tracing::{debug, trace, warn};

use crate::config::{OptionList, Resampling};
use crate::engine::{
    BandBuffer, BandH, DatasetH, MultiBandBuffer, RasterEngine, SuggestedWarpOutput,
    TransformerH, WarpOptions, IO_OK,
};
use crate::error::{Error, ErrorClass, ErrorCode, NativeError, Result};
use crate::projection::Crs;
use crate::types::{DataType, Dimensions, Gcp, GeoTransform, Pixel, Window};

/// Transformer callback shared by GenImgProj and approximate transformers
type TransformFn = unsafe extern "C" fn(
    *mut c_void,
    c_int,
    c_int,
    *mut f64,
    *mut f64,
    *mut f64,
    *mut c_int,
) -> c_int;

thread_local! {
    static REPORTS: RefCell<Vec<NativeError>> = const { RefCell::new(Vec::new()) };
}

static INSTALL_HANDLER: Once = Once::new();

/// CPL error handler; runs on the thread that raised the report
unsafe extern "C" fn record_report(class: CPLErr::Type, code: c_int, message: *const c_char) {
    let message = if message.is_null() {
        String::new()
    } else {
        CStr::from_ptr(message).to_string_lossy().into_owned()
    };
    let class = ErrorClass::from_code(class as i32).unwrap_or(ErrorClass::Failure);
    if class == ErrorClass::Debug {
        trace!(%message, "gdal debug");
        return;
    }
    let report = NativeError::new(class, ErrorCode::from_code(code), message);
    trace!(%report, "native report");
    // the stack is gone while the thread is being torn down
    let _ = REPORTS.try_with(|reports| reports.borrow_mut().push(report));
}

/// A GDAL handle held in the engine's registry.
///
/// A handle may be used from any thread, but not from two at once.
#[derive(Debug, Clone, Copy)]
struct Raw(*mut c_void);

// SAFETY: GDAL datasets and transformers are not bound to the thread that
// created them; the registry only hands out copies of the pointer.
unsafe impl Send for Raw {}
unsafe impl Sync for Raw {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flavor {
    GenImgProj,
    Approx,
}

impl Flavor {
    fn callback(self) -> TransformFn {
        match self {
            Flavor::GenImgProj => gdal_sys::GDALGenImgProjTransform as TransformFn,
            Flavor::Approx => gdal_sys::GDALApproxTransform as TransformFn,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RawTransformer {
    arg: Raw,
    flavor: Flavor,
}

/// Approximate transformer borrowed around an inner one for a single call
struct BorrowedApprox(*mut c_void);

impl Drop for BorrowedApprox {
    fn drop(&mut self) {
        if !self.0.is_null() {
            unsafe { gdal_sys::GDALDestroyTransformer(self.0) };
        }
    }
}

/// Warp options plus the operation built from them.
///
/// The transformer referenced by the options is owned by the engine registry
/// and is detached before the options are destroyed.
struct WarpOperation {
    options: *mut gdal_sys::GDALWarpOptions,
    operation: gdal_sys::GDALWarpOperationH,
}

impl Drop for WarpOperation {
    fn drop(&mut self) {
        unsafe {
            if !self.operation.is_null() {
                gdal_sys::GDALDestroyWarpOperation(self.operation);
            }
            if !self.options.is_null() {
                (*self.options).pTransformerArg = ptr::null_mut();
                gdal_sys::GDALDestroyWarpOptions(self.options);
            }
        }
    }
}

/// Copies `values` into a CPL-allocated array that GDAL frees with its owner
unsafe fn cpl_array<T: Copy>(values: &[T]) -> *mut T {
    let array = gdal_sys::CPLMalloc(std::mem::size_of::<T>() * values.len()).cast::<T>();
    ptr::copy_nonoverlapping(values.as_ptr(), array, values.len());
    array
}

fn warp_algorithm(resampling: Resampling) -> Option<GDALResampleAlg::Type> {
    let alg = match resampling {
        Resampling::Nearest => GDALResampleAlg::GRA_NearestNeighbour,
        Resampling::Bilinear => GDALResampleAlg::GRA_Bilinear,
        Resampling::Cubic => GDALResampleAlg::GRA_Cubic,
        Resampling::CubicSpline => GDALResampleAlg::GRA_CubicSpline,
        Resampling::Lanczos => GDALResampleAlg::GRA_Lanczos,
        Resampling::Average => GDALResampleAlg::GRA_Average,
        Resampling::Mode => GDALResampleAlg::GRA_Mode,
        Resampling::Max => GDALResampleAlg::GRA_Max,
        Resampling::Min => GDALResampleAlg::GRA_Min,
        Resampling::Med => GDALResampleAlg::GRA_Med,
        Resampling::Q1 => GDALResampleAlg::GRA_Q1,
        Resampling::Q3 => GDALResampleAlg::GRA_Q3,
        Resampling::Sum => GDALResampleAlg::GRA_Sum,
        Resampling::Rms => GDALResampleAlg::GRA_RMS,
        Resampling::Gauss => return None,
    };
    Some(alg)
}

fn transfer_algorithm(resampling: Resampling) -> Option<GDALRIOResampleAlg::Type> {
    let alg = match resampling {
        Resampling::Nearest => GDALRIOResampleAlg::GRIORA_NearestNeighbour,
        Resampling::Bilinear => GDALRIOResampleAlg::GRIORA_Bilinear,
        Resampling::Cubic => GDALRIOResampleAlg::GRIORA_Cubic,
        Resampling::CubicSpline => GDALRIOResampleAlg::GRIORA_CubicSpline,
        Resampling::Lanczos => GDALRIOResampleAlg::GRIORA_Lanczos,
        Resampling::Average => GDALRIOResampleAlg::GRIORA_Average,
        Resampling::Mode => GDALRIOResampleAlg::GRIORA_Mode,
        Resampling::Gauss => GDALRIOResampleAlg::GRIORA_Gauss,
        Resampling::Rms => GDALRIOResampleAlg::GRIORA_RMS,
        _ => return None,
    };
    Some(alg)
}

fn to_c_int(value: usize) -> Option<c_int> {
    c_int::try_from(value).ok()
}

fn c_string(value: &str) -> Result<CString> {
    CString::new(value).map_err(|e| Error::InvalidInput(format!("interior NUL in {:?}: {}", value, e)))
}

fn csl_from(options: &OptionList) -> Result<CslStringList> {
    let mut csl = CslStringList::new();
    for (key, value) in options.iter() {
        csl.set_name_value(key, value)?;
    }
    Ok(csl)
}

/// Raster engine backed by GDAL.
///
/// GDAL's driver registry, config options and error handler are process-wide,
/// so every `GdalEngine` shares them; datasets and transformers are tracked per
/// engine and released when it is dropped.
pub struct GdalEngine {
    datasets: DashMap<u64, Raw>,
    transformers: DashMap<u64, RawTransformer>,
    next_id: AtomicU64,
}

impl Default for GdalEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl GdalEngine {
    pub fn new() -> Self {
        INSTALL_HANDLER.call_once(|| {
            unsafe { gdal_sys::CPLSetErrorHandler(Some(record_report)) };
            debug!("installed CPL error handler");
        });
        Self {
            datasets: DashMap::new(),
            transformers: DashMap::new(),
            next_id: AtomicU64::new(1),
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

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn push_report(&self, report: NativeError) {
        trace!(%report, "native report");
        let _ = REPORTS.try_with(|reports| reports.borrow_mut().push(report));
    }

    /// Records `report` on the error stack and translates it
    fn fail(&self, report: NativeError) -> Error {
        self.push_report(report.clone());
        report.into()
    }

    /// Translates the failure GDAL just reported, or records `fallback`
    /// when the call failed silently
    fn gdal_failure(&self, base: usize, fallback: &str) -> Error {
        let reported = REPORTS
            .try_with(|reports| {
                reports
                    .borrow()
                    .iter()
                    .skip(base)
                    .rev()
                    .find(|r| r.is_fatal_or_failure())
                    .cloned()
            })
            .ok()
            .flatten();
        match reported {
            Some(report) => report.into(),
            None => self.fail(NativeError::failure(ErrorCode::AppDefined, fallback)),
        }
    }

    fn check(&self, base: usize, err: CPLErr::Type, context: &str) -> Result<()> {
        if err == CPLErr::CE_None {
            Ok(())
        } else {
            Err(self.gdal_failure(base, &format!("{} failed", context)))
        }
    }

    fn stack_depth() -> usize {
        REPORTS.try_with(|r| r.borrow().len()).unwrap_or(0)
    }

    fn raw_dataset(&self, ds: DatasetH) -> Result<gdal_sys::GDALDatasetH> {
        self.datasets.get(&ds.0).map(|r| r.0).ok_or_else(|| {
            self.fail(NativeError::failure(
                ErrorCode::ObjectNull,
                format!("dataset {} does not exist", ds.0),
            ))
        })
    }

    fn raw_band(&self, band: BandH) -> Option<gdal_sys::GDALRasterBandH> {
        let ds = self.datasets.get(&band.dataset.0)?.0;
        let index = to_c_int(band.index)?;
        if index < 1 || index > unsafe { gdal_sys::GDALGetRasterCount(ds) } {
            return None;
        }
        let raw = unsafe { gdal_sys::GDALGetRasterBand(ds, index) };
        if raw.is_null() {
            return None;
        }
        if band.mask {
            let mask = unsafe { gdal_sys::GDALGetMaskBand(raw) };
            (!mask.is_null()).then_some(mask)
        } else {
            Some(raw)
        }
    }

    fn require_band(&self, band: BandH) -> Result<gdal_sys::GDALRasterBandH> {
        self.raw_band(band).ok_or_else(|| {
            self.fail(NativeError::failure(
                ErrorCode::ObjectNull,
                format!("band {} of dataset {} does not exist", band.index, band.dataset.0),
            ))
        })
    }

    fn raw_transformer(&self, transformer: TransformerH) -> Result<RawTransformer> {
        self.transformers.get(&transformer.0).map(|t| *t).ok_or_else(|| {
            self.fail(NativeError::failure(
                ErrorCode::ObjectNull,
                format!("transformer {} does not exist", transformer.0),
            ))
        })
    }

    fn failed_io(&self, code: ErrorCode, message: String) -> i32 {
        self.push_report(NativeError::failure(code, message));
        ErrorClass::Failure.code()
    }

    /// Shared body of the single and multi-threaded warps
    fn warp(&self, options: &WarpOptions, window: Window, multi: bool) -> Result<()> {
        let Some(alg) = warp_algorithm(options.resampling) else {
            return Err(self.fail(NativeError::failure(
                ErrorCode::NotSupported,
                format!("{} resampling is not supported by the warper", options.resampling),
            )));
        };
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
        let band_count = options.src_bands.len();
        for nodata in [
            &options.src_nodata_real,
            &options.src_nodata_imag,
            &options.dst_nodata_real,
            &options.dst_nodata_imag,
        ]
        .into_iter()
        .flatten()
        {
            if nodata.len() != band_count {
                return Err(self.fail(NativeError::failure(
                    ErrorCode::IllegalArg,
                    format!("{} nodata values for {} bands", nodata.len(), band_count),
                )));
            }
        }
        let to_bands = |bands: &[usize]| -> Option<Vec<c_int>> {
            bands.iter().map(|b| to_c_int(*b)).collect()
        };
        let (Some(src_bands), Some(dst_bands)) =
            (to_bands(&options.src_bands), to_bands(&options.dst_bands))
        else {
            return Err(self.fail(NativeError::failure(ErrorCode::IllegalArg, "invalid band index")));
        };
        let (Some(x), Some(y), Some(width), Some(height)) = (
            to_c_int(window.x_offset),
            to_c_int(window.y_offset),
            to_c_int(window.width),
            to_c_int(window.height),
        ) else {
            return Err(self.fail(NativeError::failure(
                ErrorCode::IllegalArg,
                "warp window out of range",
            )));
        };

        let src = self.raw_dataset(options.src)?;
        let dst = self.raw_dataset(options.dst)?;
        let transformer = self.raw_transformer(options.transformer)?;
        let csl = csl_from(&options.options)?;

        let base = Self::stack_depth();
        let mut warp = WarpOperation {
            options: unsafe { gdal_sys::GDALCreateWarpOptions() },
            operation: ptr::null_mut(),
        };
        if warp.options.is_null() {
            return Err(self.gdal_failure(base, "could not allocate warp options"));
        }

        unsafe {
            let o = warp.options;
            (*o).papszWarpOptions = gdal_sys::CSLDuplicate(csl.as_ptr() as _);
            (*o).hSrcDS = src;
            (*o).hDstDS = dst;
            (*o).eResampleAlg = alg;
            (*o).nBandCount = band_count as c_int;
            (*o).panSrcBands = cpl_array(&src_bands);
            (*o).panDstBands = cpl_array(&dst_bands);
            if let Some(values) = &options.src_nodata_real {
                (*o).padfSrcNoDataReal = cpl_array(values);
            }
            if let Some(values) = &options.src_nodata_imag {
                (*o).padfSrcNoDataImag = cpl_array(values);
            }
            if let Some(values) = &options.dst_nodata_real {
                (*o).padfDstNoDataReal = cpl_array(values);
            }
            if let Some(values) = &options.dst_nodata_imag {
                (*o).padfDstNoDataImag = cpl_array(values);
            }
            (*o).pfnTransformer = Some(transformer.flavor.callback());
            (*o).pTransformerArg = transformer.arg.0;

            warp.operation = gdal_sys::GDALCreateWarpOperation(o);
        }
        if warp.operation.is_null() {
            return Err(self.gdal_failure(base, "could not create warp operation"));
        }

        let err = unsafe {
            if multi {
                gdal_sys::GDALChunkAndWarpMulti(warp.operation, x, y, width, height)
            } else {
                gdal_sys::GDALChunkAndWarpImage(warp.operation, x, y, width, height)
            }
        };
        trace!(src = options.src.0, dst = options.dst.0, multi, ?window, "warped window");
        self.check(base, err, "warp")
    }
}

impl Drop for GdalEngine {
    fn drop(&mut self) {
        if !self.transformers.is_empty() || !self.datasets.is_empty() {
            warn!(
                transformers = self.transformers.len(),
                datasets = self.datasets.len(),
                "releasing handles left open"
            );
        }
        for (_, transformer) in std::mem::take(&mut self.transformers) {
            unsafe { gdal_sys::GDALDestroyTransformer(transformer.arg.0) };
        }
        for (_, ds) in std::mem::take(&mut self.datasets) {
            unsafe { gdal_sys::GDALClose(ds.0) };
        }
    }
}

fn read_band<T: Pixel>(
    raw: gdal_sys::GDALRasterBandH,
    window: [c_int; 4],
    mut view: ArrayViewMut2<'_, T>,
    extra: &mut gdal_sys::GDALRasterIOExtraArg,
) -> Option<CPLErr::Type> {
    let (rows, cols) = view.dim();
    let (row_stride, col_stride) = (view.strides()[0], view.strides()[1]);
    let size = std::mem::size_of::<T>() as i64;
    let err = unsafe {
        gdal_sys::GDALRasterIOEx(
            raw,
            GDALRWFlag::GF_Read,
            window[0],
            window[1],
            window[2],
            window[3],
            view.as_mut_ptr().cast::<c_void>(),
            to_c_int(cols)?,
            to_c_int(rows)?,
            T::DATA_TYPE.code() as gdal_sys::GDALDataType::Type,
            col_stride as i64 * size,
            row_stride as i64 * size,
            extra,
        )
    };
    Some(err)
}

fn write_band<T: Pixel>(
    raw: gdal_sys::GDALRasterBandH,
    window: [c_int; 4],
    view: ArrayView2<'_, T>,
    extra: &mut gdal_sys::GDALRasterIOExtraArg,
) -> Option<CPLErr::Type> {
    let (rows, cols) = view.dim();
    let (row_stride, col_stride) = (view.strides()[0], view.strides()[1]);
    let size = std::mem::size_of::<T>() as i64;
    // GDAL only reads from the buffer in write mode
    let err = unsafe {
        gdal_sys::GDALRasterIOEx(
            raw,
            GDALRWFlag::GF_Write,
            window[0],
            window[1],
            window[2],
            window[3],
            view.as_ptr() as *mut c_void,
            to_c_int(cols)?,
            to_c_int(rows)?,
            T::DATA_TYPE.code() as gdal_sys::GDALDataType::Type,
            col_stride as i64 * size,
            row_stride as i64 * size,
            extra,
        )
    };
    Some(err)
}

impl RasterEngine for GdalEngine {
    fn register_drivers(&self) {
        DriverManager::register_all();
        debug!(count = DriverManager::count(), "registered GDAL drivers");
    }

    fn has_driver(&self, name: &str) -> bool {
        let Ok(name) = CString::new(name) else {
            return false;
        };
        !unsafe { gdal_sys::GDALGetDriverByName(name.as_ptr()) }.is_null()
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
        let c_driver = c_string(driver)?;
        let handle = unsafe { gdal_sys::GDALGetDriverByName(c_driver.as_ptr()) };
        if handle.is_null() {
            return Err(self.fail(NativeError::failure(
                ErrorCode::OpenFailed,
                format!("driver {} is not registered", driver),
            )));
        }
        let (Some(w), Some(h), Some(bands)) = (to_c_int(width), to_c_int(height), to_c_int(count))
        else {
            return Err(self.fail(NativeError::failure(
                ErrorCode::IllegalArg,
                format!("invalid dataset size {}x{}x{}", count, height, width),
            )));
        };
        if w == 0 || h == 0 {
            return Err(self.fail(NativeError::failure(
                ErrorCode::IllegalArg,
                format!("invalid dataset size {}x{}", width, height),
            )));
        }

        let c_name = c_string(name)?;
        let base = Self::stack_depth();
        let raw = unsafe {
            gdal_sys::GDALCreate(
                handle,
                c_name.as_ptr(),
                w,
                h,
                bands,
                dtype.code() as gdal_sys::GDALDataType::Type,
                ptr::null_mut(),
            )
        };
        if raw.is_null() {
            return Err(self.gdal_failure(base, &format!("could not create dataset {}", name)));
        }

        let id = self.next_id();
        self.datasets.insert(id, Raw(raw));
        trace!(id, name, width, height, count, %dtype, "created dataset");
        Ok(DatasetH(id))
    }

    fn close_dataset(&self, ds: DatasetH) {
        match self.datasets.remove(&ds.0) {
            Some((_, raw)) => unsafe {
                gdal_sys::GDALClose(raw.0);
            },
            None => trace!(id = ds.0, "close of unknown dataset ignored"),
        }
    }

    fn dataset_size(&self, ds: DatasetH) -> Option<Dimensions> {
        let raw = self.datasets.get(&ds.0)?.0;
        let (width, height) =
            unsafe { (gdal_sys::GDALGetRasterXSize(raw), gdal_sys::GDALGetRasterYSize(raw)) };
        Some(Dimensions::new(
            usize::try_from(width).ok()?,
            usize::try_from(height).ok()?,
        ))
    }

    fn band_count(&self, ds: DatasetH) -> usize {
        self.datasets
            .get(&ds.0)
            .map(|raw| unsafe { gdal_sys::GDALGetRasterCount(raw.0) })
            .and_then(|count| usize::try_from(count).ok())
            .unwrap_or(0)
    }

    fn set_geo_transform(&self, ds: DatasetH, transform: &GeoTransform) -> Result<()> {
        let raw = self.raw_dataset(ds)?;
        let mut transform = *transform;
        let base = Self::stack_depth();
        let err = unsafe { gdal_sys::GDALSetGeoTransform(raw, transform.as_mut_ptr()) };
        self.check(base, err, "setting the geotransform")
    }

    fn geo_transform(&self, ds: DatasetH) -> Option<GeoTransform> {
        let raw = self.datasets.get(&ds.0)?.0;
        let mut transform = [0.0; 6];
        let err = unsafe { gdal_sys::GDALGetGeoTransform(raw, transform.as_mut_ptr()) };
        (err == CPLErr::CE_None).then_some(transform)
    }

    fn set_gcps(&self, ds: DatasetH, gcps: &[Gcp], crs: Option<&Crs>) -> Result<()> {
        let raw = self.raw_dataset(ds)?;
        let Some(count) = to_c_int(gcps.len()) else {
            return Err(self.fail(NativeError::failure(ErrorCode::IllegalArg, "too many GCPs")));
        };
        let ids = gcps
            .iter()
            .map(|gcp| c_string(&gcp.id))
            .collect::<Result<Vec<_>>>()?;
        let info = CString::default();
        let list: Vec<gdal_sys::GDAL_GCP> = gcps
            .iter()
            .zip(&ids)
            .map(|(gcp, id)| gdal_sys::GDAL_GCP {
                pszId: id.as_ptr() as *mut c_char,
                pszInfo: info.as_ptr() as *mut c_char,
                dfGCPPixel: gcp.pixel,
                dfGCPLine: gcp.line,
                dfGCPX: gcp.x,
                dfGCPY: gcp.y,
                dfGCPZ: gcp.z,
            })
            .collect();
        let wkt = c_string(crs.map_or("", |c| c.wkt()))?;

        let base = Self::stack_depth();
        let err = unsafe { gdal_sys::GDALSetGCPs(raw, count, list.as_ptr(), wkt.as_ptr()) };
        self.check(base, err, "setting GCPs")
    }

    fn gcps(&self, ds: DatasetH) -> Vec<Gcp> {
        let Some(raw) = self.datasets.get(&ds.0).map(|r| r.0) else {
            return Vec::new();
        };
        let count = unsafe { gdal_sys::GDALGetGCPCount(raw) };
        let list = unsafe { gdal_sys::GDALGetGCPs(raw) };
        if count <= 0 || list.is_null() {
            return Vec::new();
        }
        let list = unsafe { std::slice::from_raw_parts(list, count as usize) };
        list.iter()
            .map(|gcp| {
                let id = if gcp.pszId.is_null() {
                    String::new()
                } else {
                    unsafe { CStr::from_ptr(gcp.pszId) }.to_string_lossy().into_owned()
                };
                Gcp {
                    id,
                    pixel: gcp.dfGCPPixel,
                    line: gcp.dfGCPLine,
                    x: gcp.dfGCPX,
                    y: gcp.dfGCPY,
                    z: gcp.dfGCPZ,
                }
            })
            .collect()
    }

    fn set_crs(&self, ds: DatasetH, crs: &Crs) -> Result<()> {
        let raw = self.raw_dataset(ds)?;
        let wkt = c_string(crs.wkt())?;
        let base = Self::stack_depth();
        let err = unsafe { gdal_sys::GDALSetProjection(raw, wkt.as_ptr()) };
        self.check(base, err, "setting the CRS")
    }

    fn crs(&self, ds: DatasetH) -> Option<Crs> {
        let raw = self.datasets.get(&ds.0)?.0;
        let wkt = unsafe { gdal_sys::GDALGetProjectionRef(raw) };
        if wkt.is_null() {
            return None;
        }
        let wkt = unsafe { CStr::from_ptr(wkt) }.to_string_lossy();
        if wkt.is_empty() {
            return None;
        }
        Crs::from_user_input(&wkt).ok()
    }

    fn band(&self, ds: DatasetH, index: usize) -> Option<BandH> {
        let band = BandH {
            dataset: ds,
            index,
            mask: false,
        };
        self.raw_band(band).map(|_| band)
    }

    fn band_dtype(&self, band: BandH) -> Option<DataType> {
        let raw = self.raw_band(band)?;
        DataType::from_code(unsafe { gdal_sys::GDALGetRasterDataType(raw) } as i32)
    }

    fn band_nodata(&self, band: BandH) -> Option<f64> {
        if band.mask {
            return None;
        }
        let raw = self.raw_band(band)?;
        let mut has_nodata: c_int = 0;
        let value = unsafe { gdal_sys::GDALGetRasterNoDataValue(raw, &mut has_nodata) };
        (has_nodata != 0).then_some(value)
    }

    fn set_band_nodata(&self, band: BandH, value: f64) -> Result<()> {
        let raw = self.require_band(band)?;
        let base = Self::stack_depth();
        let err = unsafe { gdal_sys::GDALSetRasterNoDataValue(raw, value) };
        self.check(base, err, "setting the nodata value")
    }

    fn delete_band_nodata(&self, band: BandH) -> Result<()> {
        let raw = self.require_band(band)?;
        let base = Self::stack_depth();
        let err = unsafe { gdal_sys::GDALDeleteRasterNoDataValue(raw) };
        self.check(base, err, "deleting the nodata value")
    }

    /// Every GDAL band has a mask; without an explicit one it is derived from
    /// the nodata value or reports every pixel valid
    fn mask_band(&self, band: BandH) -> Option<BandH> {
        if band.mask {
            return None;
        }
        let mask = BandH { mask: true, ..band };
        self.raw_band(mask).map(|_| mask)
    }

    fn create_mask_band(&self, band: BandH) -> Result<BandH> {
        let raw = self.require_band(band)?;
        let base = Self::stack_depth();
        let err = unsafe { gdal_sys::GDALCreateMaskBand(raw, 0) };
        self.check(base, err, "creating the mask band")?;
        Ok(BandH { mask: true, ..band })
    }

    fn band_io<T: Pixel>(
        &self,
        band: BandH,
        window: Window,
        buffer: BandBuffer<'_, T>,
        resampling: Resampling,
    ) -> i32 {
        let Some(alg) = transfer_algorithm(resampling) else {
            return self.failed_io(
                ErrorCode::NotSupported,
                format!("{} resampling is not supported for raster I/O", resampling),
            );
        };
        let Some(size) = self.dataset_size(band.dataset) else {
            return self.failed_io(
                ErrorCode::ObjectNull,
                format!("dataset {} does not exist", band.dataset.0),
            );
        };
        let in_range = (
            to_c_int(window.x_offset),
            to_c_int(window.y_offset),
            to_c_int(window.width),
            to_c_int(window.height),
        );
        let (true, (Some(x), Some(y), Some(w), Some(h))) = (window.fits(size), in_range) else {
            return self.failed_io(
                ErrorCode::IllegalArg,
                format!(
                    "access window out of range: {}x{} at ({}, {}) on a {}x{} band",
                    window.width, window.height, window.x_offset, window.y_offset, size.width, size.height
                ),
            );
        };
        let Some(raw) = self.raw_band(band) else {
            return self.failed_io(ErrorCode::ObjectNull, format!("band {} does not exist", band.index));
        };
        let (rows, cols) = buffer.shape();
        if rows == 0 || cols == 0 {
            return IO_OK;
        }

        let mut extra: gdal_sys::GDALRasterIOExtraArg = unsafe { std::mem::zeroed() };
        extra.nVersion = 1;
        extra.eResampleAlg = alg;

        let window = [x, y, w, h];
        let err = match buffer {
            BandBuffer::Read(view) => read_band(raw, window, view, &mut extra),
            BandBuffer::Write(view) => write_band(raw, window, view, &mut extra),
        };
        match err {
            Some(err) => err as i32,
            None => self.failed_io(ErrorCode::IllegalArg, format!("buffer of {}x{} is too large", rows, cols)),
        }
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
        let src_raw = self.raw_dataset(src)?;
        let dst_raw = match dst {
            Some(dst) => self.raw_dataset(dst)?,
            None => ptr::null_mut(),
        };
        let csl = csl_from(options)?;

        let base = Self::stack_depth();
        let arg = unsafe {
            gdal_sys::GDALCreateGenImgProjTransformer2(src_raw, dst_raw, csl.as_ptr() as _)
        };
        if arg.is_null() {
            return Err(self.gdal_failure(base, "could not create the image-to-image transformer"));
        }

        let id = self.next_id();
        self.transformers.insert(
            id,
            RawTransformer {
                arg: Raw(arg),
                flavor: Flavor::GenImgProj,
            },
        );
        debug!(id, src = src.0, dst = ?dst.map(|d| d.0), "created image-to-image transformer");
        Ok(TransformerH(id))
    }

    fn create_approx_transformer(&self, inner: TransformerH, max_error: f64) -> Result<TransformerH> {
        if max_error.is_nan() || max_error < 0.0 {
            return Err(self.fail(NativeError::failure(
                ErrorCode::IllegalArg,
                format!("invalid approximation error {}", max_error),
            )));
        }
        let Some((_, raw_inner)) = self.transformers.remove(&inner.0) else {
            return Err(self.fail(NativeError::failure(
                ErrorCode::ObjectNull,
                format!("transformer {} does not exist", inner.0),
            )));
        };

        let base = Self::stack_depth();
        let arg = unsafe {
            gdal_sys::GDALCreateApproxTransformer(
                Some(raw_inner.flavor.callback()),
                raw_inner.arg.0,
                max_error,
            )
        };
        if arg.is_null() {
            self.transformers.insert(inner.0, raw_inner);
            return Err(self.gdal_failure(base, "could not create the approximate transformer"));
        }
        unsafe { gdal_sys::GDALApproxTransformerOwnsSubtransformer(arg, 1) };

        let id = self.next_id();
        self.transformers.insert(
            id,
            RawTransformer {
                arg: Raw(arg),
                flavor: Flavor::Approx,
            },
        );
        debug!(id, inner = inner.0, max_error, "created approximate transformer");
        Ok(TransformerH(id))
    }

    fn destroy_transformer(&self, transformer: TransformerH) {
        if let Some((_, raw)) = self.transformers.remove(&transformer.0) {
            unsafe { gdal_sys::GDALDestroyTransformer(raw.arg.0) };
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
        let count = xs.len().min(ys.len());
        let Ok(raw) = self.raw_transformer(transformer) else {
            return vec![false; count];
        };
        let Some(n) = to_c_int(count) else {
            self.push_report(NativeError::failure(ErrorCode::IllegalArg, "too many points"));
            return vec![false; count];
        };
        let mut zs = vec![0.0; count];
        let mut success: Vec<c_int> = vec![0; count];
        unsafe {
            (raw.flavor.callback())(
                raw.arg.0,
                c_int::from(dst_to_src),
                n,
                xs.as_mut_ptr(),
                ys.as_mut_ptr(),
                zs.as_mut_ptr(),
                success.as_mut_ptr(),
            );
        }
        success.into_iter().map(|ok| ok != 0).collect()
    }

    fn chunk_and_warp_image(&self, options: &WarpOptions, window: Window) -> Result<()> {
        self.warp(options, window, false)
    }

    fn chunk_and_warp_multi(&self, options: &WarpOptions, window: Window) -> Result<()> {
        self.warp(options, window, true)
    }

    fn suggested_warp_output(
        &self,
        ds: DatasetH,
        transformer: TransformerH,
        max_error: f64,
    ) -> Result<SuggestedWarpOutput> {
        let raw_ds = self.raw_dataset(ds)?;
        let raw = self.raw_transformer(transformer)?;

        let base = Self::stack_depth();
        let approx = if max_error > 0.0 {
            let arg = unsafe {
                gdal_sys::GDALCreateApproxTransformer(Some(raw.flavor.callback()), raw.arg.0, max_error)
            };
            if arg.is_null() {
                return Err(self.gdal_failure(base, "could not create the approximate transformer"));
            }
            Some(BorrowedApprox(arg))
        } else {
            None
        };
        let (callback, arg): (TransformFn, *mut c_void) = match &approx {
            Some(approx) => (gdal_sys::GDALApproxTransform as TransformFn, approx.0),
            None => (raw.flavor.callback(), raw.arg.0),
        };

        let mut geo_transform = [0.0; 6];
        let mut extents = [0.0; 4];
        let (mut pixels, mut lines): (c_int, c_int) = (0, 0);
        let err = unsafe {
            gdal_sys::GDALSuggestedWarpOutput2(
                raw_ds,
                Some(callback),
                arg,
                geo_transform.as_mut_ptr(),
                &mut pixels,
                &mut lines,
                extents.as_mut_ptr(),
                0,
            )
        };
        drop(approx);
        self.check(base, err, "suggesting the warp output")?;

        match (usize::try_from(pixels), usize::try_from(lines)) {
            (Ok(width), Ok(height)) if width > 0 && height > 0 => Ok(SuggestedWarpOutput {
                geo_transform,
                width,
                height,
            }),
            _ => Err(self.fail(NativeError::failure(
                ErrorCode::AppDefined,
                format!("degenerate output grid {}x{}", pixels, lines),
            ))),
        }
    }

    fn config_option(&self, key: &str) -> Option<String> {
        let key = CString::new(key).ok()?;
        let value = unsafe { gdal_sys::CPLGetConfigOption(key.as_ptr(), ptr::null()) };
        if value.is_null() {
            return None;
        }
        Some(unsafe { CStr::from_ptr(value) }.to_string_lossy().into_owned())
    }

    fn set_config_option(&self, key: &str, value: Option<&str>) {
        let Ok(c_key) = CString::new(key) else {
            warn!(key, "config key with interior NUL ignored");
            return;
        };
        match value.map(CString::new) {
            Some(Ok(v)) => unsafe { gdal_sys::CPLSetConfigOption(c_key.as_ptr(), v.as_ptr()) },
            Some(Err(_)) => warn!(key, "config value with interior NUL ignored"),
            None => unsafe { gdal_sys::CPLSetConfigOption(c_key.as_ptr(), ptr::null()) },
        }
    }

    fn error_reports(&self) -> Vec<NativeError> {
        REPORTS.try_with(|r| r.borrow().clone()).unwrap_or_default()
    }

    fn truncate_error_reports(&self, len: usize) {
        let _ = REPORTS.try_with(|r| r.borrow_mut().truncate(len));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MEM_DRIVER;
    use crate::types::IDENTITY_GEO_TRANSFORM;
    use ndarray::{array, Array2, Array3};

    fn engine() -> GdalEngine {
        let engine = GdalEngine::new();
        engine.register_drivers();
        engine
    }

    #[test]
    fn test_mem_driver_round_trip() {
        let engine = engine();
        assert!(engine.has_driver(MEM_DRIVER));
        let ds = engine.create_dataset(MEM_DRIVER, "roundtrip", 3, 2, 1, DataType::I16).unwrap();
        assert_eq!(engine.dataset_size(ds), Some(Dimensions::new(3, 2)));
        assert_eq!(engine.band_count(ds), 1);
        let band = engine.band(ds, 1).unwrap();
        assert_eq!(engine.band_dtype(band), Some(DataType::I16));
        assert!(engine.band(ds, 2).is_none());

        let input = array![[1i16, -2, 3], [4, 5, -6]];
        let window = Window::new(0, 0, 3, 2);
        assert_eq!(engine.band_io(band, window, BandBuffer::Write(input.view()), Resampling::Nearest), IO_OK);
        let mut output = Array2::<f64>::zeros((2, 3));
        assert_eq!(engine.band_io(band, window, BandBuffer::Read(output.view_mut()), Resampling::Nearest), IO_OK);
        assert_eq!(output, input.mapv(f64::from));

        engine.close_dataset(ds);
        assert_eq!(engine.open_dataset_count(), 0);
    }

    #[test]
    fn test_transposed_buffer_strides() {
        let engine = engine();
        let ds = engine.create_dataset(MEM_DRIVER, "strides", 2, 3, 1, DataType::U8).unwrap();
        let band = engine.band(ds, 1).unwrap();
        let source = array![[1u8, 2, 3], [4, 5, 6]];
        let transposed = source.t();
        let window = Window::new(0, 0, 2, 3);
        assert_eq!(engine.band_io(band, window, BandBuffer::Write(transposed), Resampling::Nearest), IO_OK);

        let mut output = Array2::<u8>::zeros((3, 2));
        engine.band_io(band, window, BandBuffer::Read(output.view_mut()), Resampling::Nearest);
        assert_eq!(output, array![[1, 4], [2, 5], [3, 6]]);
        engine.close_dataset(ds);
    }

    #[test]
    fn test_window_out_of_range_is_reported() {
        let engine = engine();
        let ds = engine.create_dataset(MEM_DRIVER, "range", 2, 2, 1, DataType::U8).unwrap();
        let band = engine.band(ds, 1).unwrap();
        let base = engine.error_reports().len();

        let mut out = Array2::<u8>::zeros((1, 1));
        let status = engine.band_io(
            band,
            Window::new(usize::MAX, 0, 1, 1),
            BandBuffer::Read(out.view_mut()),
            Resampling::Nearest,
        );
        assert_eq!(status, ErrorClass::Failure.code());
        let reports = engine.error_reports();
        assert!(reports[base..].iter().any(|r| r.message.contains("access window out of range")));
        engine.truncate_error_reports(base);
        engine.close_dataset(ds);
    }

    #[test]
    fn test_georeferencing_and_nodata() {
        let engine = engine();
        let ds = engine.create_dataset(MEM_DRIVER, "georef", 4, 4, 1, DataType::F32).unwrap();
        assert!(engine.geo_transform(ds).is_none());
        let gt = [10.0, 2.0, 0.0, 20.0, 0.0, -2.0];
        engine.set_geo_transform(ds, &gt).unwrap();
        assert_eq!(engine.geo_transform(ds), Some(gt));

        let crs = Crs::from_epsg(32631).unwrap();
        engine.set_crs(ds, &crs).unwrap();
        let stored = engine.crs(ds).unwrap();
        assert_eq!(stored.epsg(), Some(32631));
        assert!(!stored.is_geographic());

        let band = engine.band(ds, 1).unwrap();
        assert_eq!(engine.band_nodata(band), None);
        engine.set_band_nodata(band, -9999.0).unwrap();
        assert_eq!(engine.band_nodata(band), Some(-9999.0));
        engine.delete_band_nodata(band).unwrap();
        assert_eq!(engine.band_nodata(band), None);

        let mask = engine.create_mask_band(band).unwrap();
        assert_eq!(engine.mask_band(band), Some(mask));
        assert_eq!(engine.band_dtype(mask), Some(DataType::U8));
        engine.close_dataset(ds);
    }

    #[test]
    fn test_gcps_round_trip() {
        let engine = engine();
        let ds = engine.create_dataset(MEM_DRIVER, "gcps", 4, 4, 1, DataType::U8).unwrap();
        let gcps = vec![
            Gcp::new(0.0, 0.0, 0.0, 4.0, 0.0),
            Gcp::new(4.0, 0.0, 4.0, 4.0, 0.0),
            Gcp::new(0.0, 4.0, 0.0, 0.0, 0.0),
        ];
        engine.set_gcps(ds, &gcps, Some(&Crs::from_epsg(4326).unwrap())).unwrap();
        let stored = engine.gcps(ds);
        assert_eq!(stored.len(), 3);
        assert_eq!((stored[1].pixel, stored[1].x), (4.0, 4.0));
        engine.close_dataset(ds);
    }

    #[test]
    fn test_identity_warp_and_transformer_ownership() {
        let engine = engine();
        let crs = Crs::from_epsg(4326).unwrap();
        let make = |name: &str| {
            let ds = engine.create_dataset(MEM_DRIVER, name, 4, 4, 1, DataType::U8).unwrap();
            engine.set_geo_transform(ds, &IDENTITY_GEO_TRANSFORM).unwrap();
            engine.set_crs(ds, &crs).unwrap();
            ds
        };
        let (src, dst) = (make("src"), make("dst"));
        let data = Array3::from_shape_fn((1, 4, 4), |(_, r, c)| (r * 4 + c) as u8);
        let status = engine.dataset_io(src, Window::new(0, 0, 4, 4), MultiBandBuffer::Write(data.view()), &[1], Resampling::Nearest);
        assert_eq!(status, IO_OK);

        let exact = engine.create_gen_img_proj_transformer(src, Some(dst), &OptionList::new()).unwrap();
        let approx = engine.create_approx_transformer(exact, 0.125).unwrap();
        assert_eq!(engine.transformer_count(), 1);

        let (mut xs, mut ys) = (vec![0.5, 3.5], vec![0.5, 2.5]);
        assert_eq!(engine.transform(approx, true, &mut xs, &mut ys), vec![true, true]);
        assert!((xs[1] - 3.5).abs() < 1e-6 && (ys[1] - 2.5).abs() < 1e-6);

        let mut options = WarpOptions::new(src, dst, approx);
        options.src_bands = vec![1];
        options.dst_bands = vec![1];
        options.options.set("INIT_DEST", 0);
        engine.chunk_and_warp_image(&options, Window::new(0, 0, 4, 4)).unwrap();

        let mut out = Array3::<u8>::zeros((1, 4, 4));
        engine.dataset_io(dst, Window::new(0, 0, 4, 4), MultiBandBuffer::Read(out.view_mut()), &[1], Resampling::Nearest);
        assert_eq!(out, data);

        engine.destroy_transformer(approx);
        assert_eq!(engine.transformer_count(), 0);
        engine.close_dataset(src);
        engine.close_dataset(dst);
    }

    #[test]
    fn test_warp_rejects_gauss() {
        let engine = engine();
        let base = engine.error_reports().len();
        let mut options = WarpOptions::new(DatasetH(1), DatasetH(2), TransformerH(3));
        options.resampling = Resampling::Gauss;
        let result = engine.chunk_and_warp_image(&options, Window::new(0, 0, 1, 1));
        assert!(matches!(result, Err(Error::Unsupported(_))));
        engine.truncate_error_reports(base);
    }

    #[test]
    fn test_suggested_output_identity() {
        let engine = engine();
        let ds = engine.create_dataset(MEM_DRIVER, "suggest", 4, 4, 1, DataType::U8).unwrap();
        let gt = [0.0, 1.0, 0.0, 4.0, 0.0, -1.0];
        engine.set_geo_transform(ds, &gt).unwrap();
        engine.set_crs(ds, &Crs::from_epsg(4326).unwrap()).unwrap();
        let options = OptionList::new().with("DST_SRS", "EPSG:4326");
        let transformer = engine.create_gen_img_proj_transformer(ds, None, &options).unwrap();

        let out = engine.suggested_warp_output(ds, transformer, 0.125).unwrap();
        assert_eq!((out.width, out.height), (4, 4));
        for (a, b) in out.geo_transform.iter().zip(gt.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
        engine.destroy_transformer(transformer);
        engine.close_dataset(ds);
    }

    #[test]
    fn test_error_handler_records_gdal_reports() {
        let engine = engine();
        let base = engine.error_reports().len();
        let ds = engine.create_dataset(MEM_DRIVER, "errors", 2, 2, 1, DataType::U8).unwrap();
        let options = OptionList::new().with("DST_SRS", "EPSG:999999");
        assert!(engine.create_gen_img_proj_transformer(ds, None, &options).is_err());
        assert!(engine.error_reports().len() > base);
        engine.truncate_error_reports(base);
        assert_eq!(engine.error_reports().len(), base);
        engine.close_dataset(ds);
    }

    #[test]
    fn test_config_options() {
        let engine = GdalEngine::new();
        engine.set_config_option("RASTERBRIDGE_TEST_OPTION", Some("YES"));
        assert_eq!(engine.config_option("RASTERBRIDGE_TEST_OPTION").as_deref(), Some("YES"));
        engine.set_config_option("RASTERBRIDGE_TEST_OPTION", None);
        assert!(engine.config_option("RASTERBRIDGE_TEST_OPTION").is_none());
    }
}
