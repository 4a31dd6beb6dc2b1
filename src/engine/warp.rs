//! Inverse-mapping warp and output extent suggestion for the in-memory engine.

use crate::config::Resampling;
use crate::engine::resample::{sample, Grid};
use crate::engine::transformer::LiveTransformer;
use crate::engine::SuggestedWarpOutput;
use crate::error::{ErrorCode, NativeError};
use crate::types::Window;

/// Snapshot of one source band taken before warping
pub(crate) struct SourceBand {
    pub data: Vec<f64>,
    pub mask: Option<Vec<f64>>,
}

/// Everything needed to compute destination rows, shared by all workers
pub(crate) struct WarpJob {
    pub src_width: usize,
    pub src_height: usize,
    pub sources: Vec<SourceBand>,
    pub src_nodata: Option<Vec<f64>>,
    pub unified_nodata: bool,
    pub resampling: Resampling,
    pub window: Window,
    pub scale: (f64, f64),
}

/// Warped samples of one destination row, per band; `None` leaves the pixel alone
pub(crate) type RowSamples = Vec<Vec<Option<f64>>>;

impl WarpJob {
    fn grids(&self) -> Vec<Grid<'_>> {
        self.sources
            .iter()
            .enumerate()
            .map(|(i, band)| {
                Grid::new(&band.data, self.src_width, self.src_height)
                    .with_nodata(self.src_nodata.as_ref().and_then(|n| n.get(i).copied()))
                    .with_mask(band.mask.as_deref())
            })
            .collect()
    }

    /// Computes row `row` of the window (0-based within the window)
    pub(crate) fn warp_row(&self, live: &LiveTransformer, row: usize) -> RowSamples {
        let width = self.window.width;
        let mut xs: Vec<f64> = (0..width)
            .map(|c| (self.window.x_offset + c) as f64 + 0.5)
            .collect();
        let mut ys = vec![(self.window.y_offset + row) as f64 + 0.5; width];
        let ok = live.transform(true, &mut xs, &mut ys);

        let grids = self.grids();
        let mut out: RowSamples = vec![vec![None; width]; grids.len()];
        for col in 0..width {
            if !ok[col] {
                continue;
            }
            let (x, y) = (xs[col], ys[col]);
            let samples: Vec<Option<f64>> = grids
                .iter()
                .map(|g| sample(g, self.resampling, x, y, self.scale))
                .collect();

            if self.unified_nodata {
                // a pixel is nodata only when every band is
                if samples.iter().all(Option::is_none) {
                    continue;
                }
                for (b, grid) in grids.iter().enumerate() {
                    out[b][col] = samples[b].or_else(|| grid.raw(x.floor() as i64, y.floor() as i64));
                }
            } else {
                for (b, value) in samples.into_iter().enumerate() {
                    out[b][col] = value;
                }
            }
        }
        out
    }
}

/// Size of one destination pixel in source pixels, measured at the window centre
pub(crate) fn estimate_scale(live: &LiveTransformer, window: Window) -> (f64, f64) {
    let cx = window.x_offset as f64 + window.width as f64 / 2.0;
    let cy = window.y_offset as f64 + window.height as f64 / 2.0;
    let mut xs = [cx, cx + 1.0, cx];
    let mut ys = [cy, cy, cy + 1.0];
    let ok = live.transform(true, &mut xs, &mut ys);
    if ok.contains(&false) {
        return (1.0, 1.0);
    }
    let sx = ((xs[1] - xs[0]).powi(2) + (ys[1] - ys[0]).powi(2)).sqrt();
    let sy = ((xs[2] - xs[0]).powi(2) + (ys[2] - ys[0]).powi(2)).sqrt();
    (sx, sy)
}

/// Outcome of sampling the source grid for extent suggestion
pub(crate) struct Suggestion {
    pub output: SuggestedWarpOutput,
    pub failed: usize,
    pub total: usize,
}

const EDGE_STEPS: usize = 20;
const MAX_SUBDIVISION_DEPTH: usize = 6;

/// Computes a square-pixel destination grid covering the transformed source.
///
/// The source boundary is sampled with 21 points per edge and subdivided where
/// linear interpolation between neighbours deviates by more than
/// `1 / max_error` of the segment length. An interior grid is added when edge
/// points fail.
pub(crate) fn suggest_output(
    live: &LiveTransformer,
    width: usize,
    height: usize,
    max_error: f64,
) -> Result<Suggestion, NativeError> {
    let (w, h) = (width as f64, height as f64);
    let mut points: Vec<(f64, f64)> = Vec::new();
    let mut total = 0;
    let mut failed = 0;

    let edges: [Box<dyn Fn(f64) -> (f64, f64)>; 4] = [
        Box::new(move |t: f64| (t * w, 0.0)),
        Box::new(move |t: f64| (w, t * h)),
        Box::new(move |t: f64| (t * w, h)),
        Box::new(move |t: f64| (0.0, t * h)),
    ];

    for edge in &edges {
        let params: Vec<f64> = (0..=EDGE_STEPS).map(|i| i as f64 / EDGE_STEPS as f64).collect();
        let (mut xs, mut ys): (Vec<f64>, Vec<f64>) = params.iter().map(|t| edge(*t)).unzip();
        let ok = live.transform(false, &mut xs, &mut ys);
        total += ok.len();
        failed += ok.iter().filter(|ok| !**ok).count();

        for i in 0..params.len() {
            if ok[i] {
                points.push((xs[i], ys[i]));
            }
            if i + 1 < params.len() && ok[i] && ok[i + 1] {
                subdivide(
                    live,
                    edge.as_ref(),
                    (params[i], (xs[i], ys[i])),
                    (params[i + 1], (xs[i + 1], ys[i + 1])),
                    max_error,
                    0,
                    &mut points,
                );
            }
        }
    }

    if failed > 0 {
        for i in 0..=EDGE_STEPS {
            let (mut xs, mut ys): (Vec<f64>, Vec<f64>) = (0..=EDGE_STEPS)
                .map(|j| (j as f64 / EDGE_STEPS as f64 * w, i as f64 / EDGE_STEPS as f64 * h))
                .unzip();
            let ok = live.transform(false, &mut xs, &mut ys);
            total += ok.len();
            failed += ok.iter().filter(|ok| !**ok).count();
            points.extend(
                xs.iter()
                    .zip(&ys)
                    .zip(&ok)
                    .filter(|(_, ok)| **ok)
                    .map(|((x, y), _)| (*x, *y)),
            );
        }
    }

    if points.is_empty() {
        return Err(NativeError::failure(
            ErrorCode::AppDefined,
            "too many points failed to transform, unable to compute output bounds",
        ));
    }

    let (min_x, max_x, min_y, max_y) = points.iter().fold(
        (f64::INFINITY, f64::NEG_INFINITY, f64::INFINITY, f64::NEG_INFINITY),
        |(x0, x1, y0, y1), (x, y)| (x0.min(*x), x1.max(*x), y0.min(*y), y1.max(*y)),
    );

    let src_diagonal = (w * w + h * h).sqrt();
    let dst_diagonal = ((max_x - min_x).powi(2) + (max_y - min_y).powi(2)).sqrt();
    let res = dst_diagonal / src_diagonal;
    if !(res.is_finite() && res > 0.0) {
        return Err(NativeError::failure(
            ErrorCode::AppDefined,
            "transformed source extent is degenerate",
        ));
    }

    let out_width = (((max_x - min_x) / res).round() as usize).max(1);
    let out_height = (((max_y - min_y) / res).round() as usize).max(1);
    let output = SuggestedWarpOutput {
        geo_transform: [min_x, res, 0.0, max_y, 0.0, -res],
        width: out_width,
        height: out_height,
    };

    Ok(Suggestion {
        output,
        failed,
        total,
    })
}

fn subdivide(
    live: &LiveTransformer,
    edge: &dyn Fn(f64) -> (f64, f64),
    a: (f64, (f64, f64)),
    b: (f64, (f64, f64)),
    max_error: f64,
    depth: usize,
    points: &mut Vec<(f64, f64)>,
) {
    if depth >= MAX_SUBDIVISION_DEPTH {
        return;
    }
    let t = 0.5 * (a.0 + b.0);
    let (px, py) = edge(t);
    let mut xs = [px];
    let mut ys = [py];
    if !live.transform(false, &mut xs, &mut ys)[0] {
        return;
    }

    let (ax, ay) = a.1;
    let (bx, by) = b.1;
    let deviation = (xs[0] - 0.5 * (ax + bx)).hypot(ys[0] - 0.5 * (ay + by));
    let length = (bx - ax).hypot(by - ay);
    if deviation <= length / max_error {
        return;
    }

    let mid = (t, (xs[0], ys[0]));
    points.push(mid.1);
    subdivide(live, edge, a, mid, max_error, depth + 1, points);
    subdivide(live, edge, mid, b, max_error, depth + 1, points);
}
