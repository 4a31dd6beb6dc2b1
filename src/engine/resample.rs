//! Nodata-aware sampling kernels shared by raster I/O and warping.
//!
//! Sample coordinates are continuous pixel/line positions with pixel centres
//! at `i + 0.5`. Invalid source cells (nodata, masked, NaN, outside the grid)
//! never contribute; interpolating kernels renormalize over the valid cells.

use std::f64::consts::PI;

use crate::config::Resampling;

/// Read-only view of one band's samples
#[derive(Clone, Copy)]
pub(crate) struct Grid<'a> {
    data: &'a [f64],
    width: usize,
    height: usize,
    nodata: Option<f64>,
    mask: Option<&'a [f64]>,
}

impl<'a> Grid<'a> {
    pub(crate) fn new(data: &'a [f64], width: usize, height: usize) -> Self {
        Self {
            data,
            width,
            height,
            nodata: None,
            mask: None,
        }
    }

    pub(crate) fn with_nodata(mut self, nodata: Option<f64>) -> Self {
        self.nodata = nodata;
        self
    }

    pub(crate) fn with_mask(mut self, mask: Option<&'a [f64]>) -> Self {
        self.mask = mask;
        self
    }

    /// The stored value, valid or not
    pub(crate) fn raw(&self, col: i64, row: i64) -> Option<f64> {
        if col < 0 || row < 0 || col as usize >= self.width || row as usize >= self.height {
            return None;
        }
        Some(self.data[row as usize * self.width + col as usize])
    }

    /// The stored value if it is valid data
    pub(crate) fn valid(&self, col: i64, row: i64) -> Option<f64> {
        let value = self.raw(col, row)?;
        if value.is_nan() || self.nodata.is_some_and(|nd| is_nodata(value, nd)) {
            return None;
        }
        if let Some(mask) = self.mask {
            if mask[row as usize * self.width + col as usize] == 0.0 {
                return None;
            }
        }
        Some(value)
    }

    fn contains(&self, x: f64, y: f64) -> bool {
        x >= 0.0 && y >= 0.0 && x < self.width as f64 && y < self.height as f64
    }
}

pub(crate) fn is_nodata(value: f64, nodata: f64) -> bool {
    if nodata.is_nan() {
        value.is_nan()
    } else {
        value == nodata
    }
}

/// Samples `grid` at (`x`, `y`).
///
/// `scale` is the size of one output pixel in source pixels, used by the
/// area-based methods to size their footprint.
pub(crate) fn sample(
    grid: &Grid<'_>,
    method: Resampling,
    x: f64,
    y: f64,
    scale: (f64, f64),
) -> Option<f64> {
    if !grid.contains(x, y) {
        return None;
    }

    match method {
        Resampling::Nearest => grid.valid(x.floor() as i64, y.floor() as i64),
        Resampling::Bilinear => convolve(grid, x, y, 1, triangle),
        Resampling::Cubic => convolve(grid, x, y, 2, keys_cubic),
        Resampling::CubicSpline => convolve(grid, x, y, 2, cubic_bspline),
        Resampling::Lanczos => convolve(grid, x, y, 3, lanczos3),
        Resampling::Gauss => gauss(grid, x, y, scale),
        _ => area(grid, method, x, y, scale),
    }
}

/// Separable kernel over a (2 * radius)^2 neighbourhood
fn convolve(grid: &Grid<'_>, x: f64, y: f64, radius: i64, kernel: fn(f64) -> f64) -> Option<f64> {
    let cx = x - 0.5;
    let cy = y - 0.5;
    let ix = cx.floor() as i64;
    let iy = cy.floor() as i64;

    let mut sum = 0.0;
    let mut weight_sum = 0.0;
    for row in (iy - radius + 1)..=(iy + radius) {
        let wy = kernel(cy - row as f64);
        if wy == 0.0 {
            continue;
        }
        for col in (ix - radius + 1)..=(ix + radius) {
            let w = kernel(cx - col as f64) * wy;
            if w == 0.0 {
                continue;
            }
            if let Some(v) = grid.valid(col, row) {
                sum += w * v;
                weight_sum += w;
            }
        }
    }

    if weight_sum.abs() < 1e-12 {
        None
    } else {
        Some(sum / weight_sum)
    }
}

fn triangle(t: f64) -> f64 {
    (1.0 - t.abs()).max(0.0)
}

fn keys_cubic(t: f64) -> f64 {
    const A: f64 = -0.5;
    let t = t.abs();
    if t <= 1.0 {
        (A + 2.0) * t.powi(3) - (A + 3.0) * t.powi(2) + 1.0
    } else if t < 2.0 {
        A * t.powi(3) - 5.0 * A * t.powi(2) + 8.0 * A * t - 4.0 * A
    } else {
        0.0
    }
}

fn cubic_bspline(t: f64) -> f64 {
    let t = t.abs();
    if t < 1.0 {
        (4.0 - 6.0 * t.powi(2) + 3.0 * t.powi(3)) / 6.0
    } else if t < 2.0 {
        (2.0 - t).powi(3) / 6.0
    } else {
        0.0
    }
}

fn lanczos3(t: f64) -> f64 {
    const A: f64 = 3.0;
    if t == 0.0 {
        1.0
    } else if t.abs() < A {
        let pt = PI * t;
        A * pt.sin() * (pt / A).sin() / (pt * pt)
    } else {
        0.0
    }
}

fn gauss(grid: &Grid<'_>, x: f64, y: f64, scale: (f64, f64)) -> Option<f64> {
    let sigma_x = 0.5 * scale.0.max(1.0);
    let sigma_y = 0.5 * scale.1.max(1.0);
    let radius = (3.0 * sigma_x.max(sigma_y)).ceil() as i64;
    let cx = x - 0.5;
    let cy = y - 0.5;
    let ix = cx.round() as i64;
    let iy = cy.round() as i64;

    let mut sum = 0.0;
    let mut weight_sum = 0.0;
    for row in (iy - radius)..=(iy + radius) {
        let dy = (cy - row as f64) / sigma_y;
        for col in (ix - radius)..=(ix + radius) {
            let dx = (cx - col as f64) / sigma_x;
            if let Some(v) = grid.valid(col, row) {
                let w = (-0.5 * (dx * dx + dy * dy)).exp();
                sum += w * v;
                weight_sum += w;
            }
        }
    }

    if weight_sum == 0.0 {
        None
    } else {
        Some(sum / weight_sum)
    }
}

/// Statistics over the source cells covered by the output pixel footprint
fn area(grid: &Grid<'_>, method: Resampling, x: f64, y: f64, scale: (f64, f64)) -> Option<f64> {
    let half_x = 0.5 * scale.0.max(1.0);
    let half_y = 0.5 * scale.1.max(1.0);
    let (x0, x1) = (x - half_x, x + half_x);
    let (y0, y1) = (y - half_y, y + half_y);

    let mut values: Vec<(f64, f64)> = Vec::new();
    for row in (y0.floor() as i64)..(y1.ceil() as i64) {
        let wy = (y1.min(row as f64 + 1.0) - y0.max(row as f64)).max(0.0);
        for col in (x0.floor() as i64)..(x1.ceil() as i64) {
            let wx = (x1.min(col as f64 + 1.0) - x0.max(col as f64)).max(0.0);
            let w = wx * wy;
            if w <= 0.0 {
                continue;
            }
            if let Some(v) = grid.valid(col, row) {
                values.push((v, w));
            }
        }
    }
    if values.is_empty() {
        return None;
    }

    let weight_sum: f64 = values.iter().map(|(_, w)| w).sum();
    let result = match method {
        Resampling::Average => values.iter().map(|(v, w)| v * w).sum::<f64>() / weight_sum,
        Resampling::Sum => values.iter().map(|(v, w)| v * w).sum::<f64>(),
        Resampling::Rms => {
            (values.iter().map(|(v, w)| v * v * w).sum::<f64>() / weight_sum).sqrt()
        }
        Resampling::Max => values.iter().map(|(v, _)| *v).fold(f64::NEG_INFINITY, f64::max),
        Resampling::Min => values.iter().map(|(v, _)| *v).fold(f64::INFINITY, f64::min),
        Resampling::Mode => mode(values.iter().map(|(v, _)| *v).collect()),
        Resampling::Med => quantile(values.iter().map(|(v, _)| *v).collect(), 0.5),
        Resampling::Q1 => quantile(values.iter().map(|(v, _)| *v).collect(), 0.25),
        Resampling::Q3 => quantile(values.iter().map(|(v, _)| *v).collect(), 0.75),
        // interpolating kernels are dispatched before reaching here
        _ => values[0].0,
    };
    Some(result)
}

/// Most frequent value, smallest on ties
fn mode(mut values: Vec<f64>) -> f64 {
    values.sort_by(f64::total_cmp);
    let mut best = values[0];
    let mut best_count = 0;
    let mut i = 0;
    while i < values.len() {
        let mut j = i;
        while j < values.len() && values[j] == values[i] {
            j += 1;
        }
        if j - i > best_count {
            best_count = j - i;
            best = values[i];
        }
        i = j;
    }
    best
}

fn quantile(mut values: Vec<f64>, q: f64) -> f64 {
    values.sort_by(f64::total_cmp);
    let index = ((values.len() - 1) as f64 * q).floor() as usize;
    values[index]
}
