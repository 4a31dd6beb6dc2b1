//! Output grid estimation for reprojection.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::OptionList;
use crate::engine::RasterEngine;
use crate::env::ErrorCapture;
use crate::error::{Error, NativeError, Result};
use crate::projection::Crs;
use crate::types::{Bounds, DataType, Gcp, GeoTransform};
use crate::warp::scratch::{Georeference, ScratchDataset, TransformerGuard};

/// Error budget handed to the extent suggestion, in pixels
pub const SUGGESTION_MAX_ERROR: f64 = 1000.0;

/// Optional inputs of [`estimate_transform`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EstimateOptions {
    pub left: Option<f64>,
    pub bottom: Option<f64>,
    pub right: Option<f64>,
    pub top: Option<f64>,
    pub gcps: Vec<Gcp>,
    /// Target pixel size (x, y), both positive
    pub resolution: Option<(f64, f64)>,
    pub dst_width: Option<usize>,
    pub dst_height: Option<usize>,
}

impl EstimateOptions {
    pub fn from_bounds(bounds: Bounds) -> Self {
        Self {
            left: Some(bounds.left),
            bottom: Some(bounds.bottom),
            right: Some(bounds.right),
            top: Some(bounds.top),
            ..Self::default()
        }
    }

    pub fn from_gcps(gcps: Vec<Gcp>) -> Self {
        Self {
            gcps,
            ..Self::default()
        }
    }

    fn bounds(&self) -> Result<Option<Bounds>> {
        match (self.left, self.bottom, self.right, self.top) {
            (Some(left), Some(bottom), Some(right), Some(top)) => {
                Ok(Some(Bounds::new(left, bottom, right, top)))
            }
            (None, None, None, None) => Ok(None),
            _ => Err(Error::Configuration(
                "bounds must specify all of left, bottom, right and top".to_string(),
            )),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.resolution.is_some() && (self.dst_width.is_some() || self.dst_height.is_some()) {
            return Err(Error::Configuration(
                "resolution cannot be combined with dst_width or dst_height".to_string(),
            ));
        }
        if self.dst_width.is_some() != self.dst_height.is_some() {
            return Err(Error::Configuration(
                "dst_width and dst_height must be given together".to_string(),
            ));
        }
        if let Some((x, y)) = self.resolution {
            if !(x > 0.0 && y > 0.0) {
                return Err(Error::Configuration(format!(
                    "invalid resolution ({}, {})",
                    x, y
                )));
            }
        }
        if self.dst_width == Some(0) || self.dst_height == Some(0) {
            return Err(Error::Configuration(
                "dst_width and dst_height must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Output grid computed by [`estimate_transform`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransformEstimate {
    pub transform: GeoTransform,
    pub width: usize,
    pub height: usize,
}

fn is_suppressed_reprojection_failure(report: &NativeError) -> bool {
    report.message.contains("further errors will be suppressed")
}

/// Computes the output grid covering a `width` x `height` raster in `src_crs`
/// once reprojected to `dst_crs`.
///
/// The raster is georeferenced by complete `bounds` or, failing that, GCPs.
/// Points that cannot be reprojected are logged and skipped rather than
/// failing the estimate.
pub fn estimate_transform<E: RasterEngine>(
    engine: &E,
    src_crs: &Crs,
    dst_crs: &Crs,
    width: usize,
    height: usize,
    options: &EstimateOptions,
) -> Result<TransformEstimate> {
    options.validate()?;
    let georef = match options.bounds()? {
        Some(bounds) => Georeference::new(bounds.to_geo_transform(width, height), src_crs.clone()),
        None if !options.gcps.is_empty() => {
            Georeference::from_gcps(options.gcps.clone(), src_crs.clone())
        }
        None => {
            return Err(Error::Configuration(
                "either bounds or gcps must be specified".to_string(),
            ))
        }
    };

    let capture = ErrorCapture::new(engine);
    let scratch = ScratchDataset::create(engine, width, height, 1, DataType::U8, &georef)?;

    let mut transformer_options = OptionList::new();
    transformer_options.set("DST_SRS", dst_crs.definition());
    if georef.transform.is_none() {
        transformer_options.set_bool("GCPS_OK", true);
    }
    let transformer =
        engine.create_gen_img_proj_transformer(scratch.handle(), None, &transformer_options)?;
    let _transformer_guard = TransformerGuard::new(engine, transformer);

    let suggested =
        engine.suggested_warp_output(scratch.handle(), transformer, SUGGESTION_MAX_ERROR)?;
    for report in capture.check_ignoring(is_suppressed_reprojection_failure)? {
        warn!(message = %report.message, "some points could not be reprojected");
    }

    let (transform, out_width, out_height) =
        match (options.resolution, options.dst_width, options.dst_height) {
            (Some((xres, yres)), _, _) => {
                let extent_x = suggested.width as f64 * suggested.geo_transform[1];
                let extent_y = suggested.height as f64 * -suggested.geo_transform[5];
                (
                    [
                        suggested.geo_transform[0],
                        xres,
                        0.0,
                        suggested.geo_transform[3],
                        0.0,
                        -yres,
                    ],
                    ((extent_x / xres).ceil() as usize).max(1),
                    ((extent_y / yres).ceil() as usize).max(1),
                )
            }
            (None, Some(w), Some(h)) => {
                let mut gt = suggested.geo_transform;
                gt[1] *= suggested.width as f64 / w as f64;
                gt[5] *= suggested.height as f64 / h as f64;
                (gt, w, h)
            }
            _ => (suggested.geo_transform, suggested.width, suggested.height),
        };

    debug!(?transform, width = out_width, height = out_height, "estimated output grid");
    Ok(TransformEstimate {
        transform,
        width: out_width,
        height: out_height,
    })
}

/// Snaps an output grid outward to whole multiples of `resolution`
pub fn aligned_target(
    transform: &GeoTransform,
    width: usize,
    height: usize,
    resolution: (f64, f64),
) -> Result<TransformEstimate> {
    let (xres, yres) = resolution;
    if !(xres > 0.0 && yres > 0.0) {
        return Err(Error::Configuration(format!(
            "invalid resolution ({}, {})",
            xres, yres
        )));
    }

    let xmin = transform[0];
    let ymax = transform[3];
    let xmax = xmin + width as f64 * transform[1];
    let ymin = ymax + height as f64 * transform[5];

    let xmin = (xmin / xres).floor() * xres;
    let xmax = (xmax / xres).ceil() * xres;
    let ymin = (ymin / yres).floor() * yres;
    let ymax = (ymax / yres).ceil() * yres;

    Ok(TransformEstimate {
        transform: [xmin, xres, 0.0, ymax, 0.0, -yres],
        width: (((xmax - xmin) / xres).round() as usize).max(1),
        height: (((ymax - ymin) / yres).round() as usize).max(1),
    })
}
