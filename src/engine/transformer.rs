//! Pixel-to-pixel transformers used by the in-memory engine.
//!
//! A transformer is stored as a plain description; a [`LiveTransformer`]
//! with its own PROJ contexts is built from it wherever points are actually
//! transformed, one per worker thread.

use crate::error::{ErrorCode, NativeError};
use crate::projection::{Coordinate, CoordinateTransformer, Crs};
use crate::types::{GeoTransform, GeoTransformEx, Gcp};

/// Pixel/line <-> georeferenced mapping of one side of a transformer
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PixelGeoref {
    pub forward: GeoTransform,
    pub inverse: GeoTransform,
}

impl PixelGeoref {
    pub(crate) fn from_geo_transform(transform: &GeoTransform) -> Result<Self, NativeError> {
        let inverse = transform.invert().ok_or_else(|| {
            NativeError::failure(ErrorCode::AppDefined, "geotransform is not invertible")
        })?;
        Ok(Self {
            forward: *transform,
            inverse,
        })
    }

    /// First order polynomial fitted to `gcps` by least squares
    pub(crate) fn from_gcps(gcps: &[Gcp]) -> Result<Self, NativeError> {
        if gcps.len() < 3 {
            return Err(NativeError::failure(
                ErrorCode::AppDefined,
                format!("at least 3 GCPs are needed for a first order fit, got {}", gcps.len()),
            ));
        }
        let rows: Vec<[f64; 3]> = gcps.iter().map(|g| [1.0, g.pixel, g.line]).collect();
        let xs: Vec<f64> = gcps.iter().map(|g| g.x).collect();
        let ys: Vec<f64> = gcps.iter().map(|g| g.y).collect();

        let singular = || {
            NativeError::failure(ErrorCode::AppDefined, "GCPs are collinear, cannot fit a polynomial")
        };
        let ax = least_squares(&rows, &xs).ok_or_else(singular)?;
        let ay = least_squares(&rows, &ys).ok_or_else(singular)?;
        Self::from_geo_transform(&[ax[0], ax[1], ax[2], ay[0], ay[1], ay[2]])
    }

    fn identity() -> Self {
        Self {
            forward: crate::types::IDENTITY_GEO_TRANSFORM,
            inverse: crate::types::IDENTITY_GEO_TRANSFORM,
        }
    }
}

/// Solves the 3-parameter normal equations of `rows * a = b`
fn least_squares(rows: &[[f64; 3]], b: &[f64]) -> Option<[f64; 3]> {
    let mut ata = [[0.0f64; 3]; 3];
    let mut atb = [0.0f64; 3];
    for (row, value) in rows.iter().zip(b) {
        for i in 0..3 {
            atb[i] += row[i] * value;
            for j in 0..3 {
                ata[i][j] += row[i] * row[j];
            }
        }
    }

    // Gaussian elimination with partial pivoting
    let mut m = [[0.0f64; 4]; 3];
    for i in 0..3 {
        m[i][..3].copy_from_slice(&ata[i]);
        m[i][3] = atb[i];
    }
    for col in 0..3 {
        let pivot = (col..3).max_by(|&a, &b| m[a][col].abs().total_cmp(&m[b][col].abs()))?;
        if m[pivot][col].abs() < 1e-12 {
            return None;
        }
        m.swap(col, pivot);
        for row in 0..3 {
            if row != col {
                let factor = m[row][col] / m[col][col];
                for k in col..4 {
                    m[row][k] -= factor * m[col][k];
                }
            }
        }
    }
    Some([m[0][3] / m[0][0], m[1][3] / m[1][1], m[2][3] / m[2][2]])
}

/// Exact generic image-to-image transformer
#[derive(Debug, Clone)]
pub(crate) struct GenImgProj {
    pub src: PixelGeoref,
    /// `None` leaves results in destination georeferenced coordinates
    pub dst: Option<PixelGeoref>,
    pub src_crs: Option<Crs>,
    pub dst_crs: Option<Crs>,
    pub check_with_invert: bool,
}

impl GenImgProj {
    /// Pixel mapping of a dataset side per `SRC_METHOD`
    pub(crate) fn side_georef(
        method: Option<&str>,
        transform: Option<GeoTransform>,
        gcps: &[Gcp],
        gcps_ok: bool,
    ) -> Result<PixelGeoref, NativeError> {
        match method.map(|m| m.to_uppercase()).as_deref() {
            Some("NO_GEOTRANSFORM") => Ok(PixelGeoref::identity()),
            Some("GEOTRANSFORM") => match transform {
                Some(t) => PixelGeoref::from_geo_transform(&t),
                None => Err(NativeError::failure(
                    ErrorCode::AppDefined,
                    "SRC_METHOD=GEOTRANSFORM but the dataset has no geotransform",
                )),
            },
            Some("GCP_POLYNOMIAL") => PixelGeoref::from_gcps(gcps),
            Some(other) => Err(NativeError::failure(
                ErrorCode::NotSupported,
                format!("unsupported transformer method {}", other),
            )),
            None => {
                if let Some(t) = transform {
                    PixelGeoref::from_geo_transform(&t)
                } else if gcps_ok && !gcps.is_empty() {
                    PixelGeoref::from_gcps(gcps)
                } else {
                    Err(NativeError::failure(
                        ErrorCode::AppDefined,
                        "unable to compute a transformation between pixel/line and georeferenced coordinates",
                    ))
                }
            }
        }
    }
}

/// Transformer descriptions held in the engine registry
#[derive(Debug, Clone)]
pub(crate) enum TransformerKind {
    GenImgProj(GenImgProj),
    Approx {
        inner: Box<TransformerKind>,
        max_error: f64,
    },
}

impl TransformerKind {
    /// The exact transformer at the bottom of the chain
    pub(crate) fn exact(&self) -> &GenImgProj {
        match self {
            TransformerKind::GenImgProj(g) => g,
            TransformerKind::Approx { inner, .. } => inner.exact(),
        }
    }

    /// Tolerance of the outermost approximation, if any
    pub(crate) fn max_error(&self) -> Option<f64> {
        match self {
            TransformerKind::GenImgProj(_) => None,
            TransformerKind::Approx { max_error, .. } => Some(*max_error),
        }
    }
}

/// A transformer ready to transform points on the current thread
pub(crate) struct LiveTransformer {
    spec: GenImgProj,
    max_error: Option<f64>,
    to_dst: Option<CoordinateTransformer>,
    to_src: Option<CoordinateTransformer>,
}

impl LiveTransformer {
    pub(crate) fn new(kind: &TransformerKind) -> crate::error::Result<Self> {
        let spec = kind.exact().clone();
        let (to_dst, to_src) = match (&spec.src_crs, &spec.dst_crs) {
            (Some(src), Some(dst)) if !src.is_equivalent(dst) => (
                Some(CoordinateTransformer::new(src, dst)?),
                Some(CoordinateTransformer::new(dst, src)?),
            ),
            _ => (None, None),
        };
        Ok(Self {
            spec,
            max_error: kind.max_error(),
            to_dst,
            to_src,
        })
    }

    /// Transforms points in place, returning per-point success
    pub(crate) fn transform(&self, dst_to_src: bool, xs: &mut [f64], ys: &mut [f64]) -> Vec<bool> {
        match self.max_error {
            Some(max_error) if is_scanline(xs, ys) => {
                self.approximate(dst_to_src, xs, ys, max_error)
            }
            _ => self.exact(dst_to_src, xs, ys),
        }
    }

    fn exact(&self, dst_to_src: bool, xs: &mut [f64], ys: &mut [f64]) -> Vec<bool> {
        let originals = if self.spec.check_with_invert {
            Some((xs.to_vec(), ys.to_vec()))
        } else {
            None
        };

        let mut ok = self.exact_once(dst_to_src, xs, ys);

        if let Some((ox, oy)) = originals {
            let mut bx = xs.to_vec();
            let mut by = ys.to_vec();
            let back = self.exact_once(!dst_to_src, &mut bx, &mut by);
            for i in 0..ok.len() {
                let drift = (bx[i] - ox[i]).abs() + (by[i] - oy[i]).abs();
                if ok[i] && (!back[i] || drift > 0.1) {
                    ok[i] = false;
                    xs[i] = f64::INFINITY;
                    ys[i] = f64::INFINITY;
                }
            }
        }
        ok
    }

    fn exact_once(&self, dst_to_src: bool, xs: &mut [f64], ys: &mut [f64]) -> Vec<bool> {
        let (from, projection, to) = if dst_to_src {
            (self.spec.dst.as_ref().map(|g| &g.forward), &self.to_src, Some(&self.spec.src.inverse))
        } else {
            (Some(&self.spec.src.forward), &self.to_dst, self.spec.dst.as_ref().map(|g| &g.inverse))
        };

        let mut ok = vec![true; xs.len()];
        for i in 0..xs.len() {
            let (mut x, mut y) = (xs[i], ys[i]);
            if let Some(gt) = from {
                (x, y) = gt.apply(x, y);
            }
            if let Some(projection) = projection {
                match projection.transform(Coordinate::new(x, y)) {
                    Ok(c) => (x, y) = (c.x, c.y),
                    Err(_) => {
                        ok[i] = false;
                        xs[i] = f64::INFINITY;
                        ys[i] = f64::INFINITY;
                        continue;
                    }
                }
            }
            if let Some(gt) = to {
                (x, y) = gt.apply(x, y);
            }
            xs[i] = x;
            ys[i] = y;
        }
        ok
    }

    /// Linear interpolation along a scanline with recursive subdivision
    fn approximate(&self, dst_to_src: bool, xs: &mut [f64], ys: &mut [f64], max_error: f64) -> Vec<bool> {
        let n = xs.len();
        let input_x = xs.to_vec();
        let y = ys[0];

        let mut ends_x = [input_x[0], input_x[n - 1]];
        let mut ends_y = [y, y];
        let ends_ok = self.exact(dst_to_src, &mut ends_x, &mut ends_y);
        if ends_ok.contains(&false) {
            return self.exact(dst_to_src, xs, ys);
        }

        let mut ok = vec![true; n];
        let mut stack = vec![(0usize, n - 1, (ends_x[0], ends_y[0]), (ends_x[1], ends_y[1]))];
        while let Some((lo, hi, a, b)) = stack.pop() {
            xs[lo] = a.0;
            ys[lo] = a.1;
            xs[hi] = b.0;
            ys[hi] = b.1;
            if hi <= lo + 1 {
                continue;
            }

            let mid = (lo + hi) / 2;
            let mut mx = [input_x[mid]];
            let mut my = [y];
            if !self.exact(dst_to_src, &mut mx, &mut my)[0] {
                let (sx, sy) = (&mut xs[lo + 1..hi], &mut ys[lo + 1..hi]);
                sx.copy_from_slice(&input_x[lo + 1..hi]);
                sy.fill(y);
                let inner_ok = self.exact(dst_to_src, sx, sy);
                ok[lo + 1..hi].copy_from_slice(&inner_ok);
                continue;
            }

            let t = (input_x[mid] - input_x[lo]) / (input_x[hi] - input_x[lo]);
            let ix = a.0 + t * (b.0 - a.0);
            let iy = a.1 + t * (b.1 - a.1);
            let error = (mx[0] - ix).abs() + (my[0] - iy).abs();

            if error > max_error {
                stack.push((lo, mid, a, (mx[0], my[0])));
                stack.push((mid, hi, (mx[0], my[0]), b));
            } else {
                for i in lo + 1..hi {
                    let t = (input_x[i] - input_x[lo]) / (input_x[hi] - input_x[lo]);
                    xs[i] = a.0 + t * (b.0 - a.0);
                    ys[i] = a.1 + t * (b.1 - a.1);
                }
            }
        }
        ok
    }
}

/// True for at least three points on one row with increasing x
fn is_scanline(xs: &[f64], ys: &[f64]) -> bool {
    xs.len() >= 3
        && ys.iter().all(|y| *y == ys[0])
        && xs.windows(2).all(|w| w[1] > w[0])
}
