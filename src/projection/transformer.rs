use proj::Proj;
use tracing::debug;

use crate::error::{Error, Result};
use crate::projection::coordinate::Coordinate;
use crate::projection::crs::Crs;
use crate::types::Bounds;

/// Transforms coordinates between two coordinate reference systems.
///
/// Equivalent source and target systems short-circuit to an identity
/// transformation, no PROJ context is created for them. A transformer owns its
/// PROJ context and must not be shared between threads; build one per worker.
pub struct CoordinateTransformer {
    proj: Option<Proj>,
    source: Crs,
    target: Crs,
}

impl CoordinateTransformer {
    /// Creates a new transformer from source to target CRS
    pub fn new(source: &Crs, target: &Crs) -> Result<Self> {
        let proj = if source.is_equivalent(target) {
            None
        } else {
            let proj = Proj::new_known_crs(source.definition(), target.definition(), None)
                .map_err(|e| {
                    Error::Crs(format!(
                        "no transformation from {} to {}: {}",
                        source, target, e
                    ))
                })?;
            Some(proj)
        };
        debug!(source = %source, target = %target, identity = proj.is_none(), "created coordinate transformer");

        Ok(Self {
            proj,
            source: source.clone(),
            target: target.clone(),
        })
    }

    /// Returns true if no projection is performed
    pub fn is_identity(&self) -> bool {
        self.proj.is_none()
    }

    /// Transforms a coordinate from source to target CRS, carrying z unchanged
    pub fn transform(&self, coord: Coordinate) -> Result<Coordinate> {
        let Some(proj) = &self.proj else {
            return Ok(coord);
        };
        let (x, y) = proj
            .convert((coord.x, coord.y))
            .map_err(|e| Error::Crs(format!("transformation failed: {}", e)))?;

        if !x.is_finite() || !y.is_finite() {
            return Err(Error::Crs(format!(
                "point ({}, {}) has no finite image in {}",
                coord.x, coord.y, self.target
            )));
        }
        Ok(Coordinate::new_3d(x, y, coord.z))
    }

    /// Transforms points in place and reports per-point success.
    ///
    /// Points that fail are set to infinity and flagged `false`.
    pub fn transform_xy(&self, xs: &mut [f64], ys: &mut [f64]) -> Vec<bool> {
        xs.iter_mut()
            .zip(ys.iter_mut())
            .map(|(x, y)| match self.transform(Coordinate::new(*x, *y)) {
                Ok(c) => {
                    *x = c.x;
                    *y = c.y;
                    true
                }
                Err(_) => {
                    *x = f64::INFINITY;
                    *y = f64::INFINITY;
                    false
                }
            })
            .collect()
    }

    /// Creates the transformer for the opposite direction
    pub fn inverse(&self) -> Result<Self> {
        Self::new(&self.target, &self.source)
    }

    pub fn source(&self) -> &Crs {
        &self.source
    }

    pub fn target(&self) -> &Crs {
        &self.target
    }
}

/// Transforms parallel coordinate arrays between two systems.
///
/// `zs`, when given, must have the same length as `xs` and is carried through.
pub fn transform_points(
    source: &Crs,
    target: &Crs,
    xs: &[f64],
    ys: &[f64],
    zs: Option<&[f64]>,
) -> Result<(Vec<f64>, Vec<f64>, Option<Vec<f64>>)> {
    if xs.len() != ys.len() || zs.is_some_and(|zs| zs.len() != xs.len()) {
        return Err(Error::InvalidInput(
            "coordinate arrays must have the same length".to_string(),
        ));
    }

    let transformer = CoordinateTransformer::new(source, target)?;
    let mut out_x = Vec::with_capacity(xs.len());
    let mut out_y = Vec::with_capacity(xs.len());
    for (i, (&x, &y)) in xs.iter().zip(ys).enumerate() {
        let z = zs.map_or(0.0, |zs| zs[i]);
        let c = transformer.transform(Coordinate::new_3d(x, y, z))?;
        out_x.push(c.x);
        out_y.push(c.y);
    }
    Ok((out_x, out_y, zs.map(|zs| zs.to_vec())))
}

/// Transforms a bounding box, densifying each edge with `densify_pts` extra points.
///
/// Points that cannot be transformed are skipped; the call fails only when no
/// point of the boundary has an image in the target system.
pub fn transform_bounds(
    source: &Crs,
    target: &Crs,
    bounds: &Bounds,
    densify_pts: usize,
) -> Result<Bounds> {
    let transformer = CoordinateTransformer::new(source, target)?;
    if transformer.is_identity() {
        return Ok(*bounds);
    }

    let steps = densify_pts + 1;
    let mut xs = Vec::with_capacity(4 * steps);
    let mut ys = Vec::with_capacity(4 * steps);
    for i in 0..steps {
        let t = i as f64 / steps as f64;
        let dx = bounds.left + t * bounds.width();
        let dy = bounds.bottom + t * bounds.height();
        // bottom, right, top and left edges walked counter-clockwise
        xs.extend_from_slice(&[dx, bounds.right, bounds.right - t * bounds.width(), bounds.left]);
        ys.extend_from_slice(&[bounds.bottom, dy, bounds.top, bounds.top - t * bounds.height()]);
    }

    let ok = transformer.transform_xy(&mut xs, &mut ys);
    let mut result: Option<Bounds> = None;
    for ((x, y), _) in xs.iter().zip(&ys).zip(&ok).filter(|(_, ok)| **ok) {
        let b = result.get_or_insert(Bounds::new(*x, *y, *x, *y));
        b.left = b.left.min(*x);
        b.right = b.right.max(*x);
        b.bottom = b.bottom.min(*y);
        b.top = b.top.max(*y);
    }

    result.ok_or_else(|| {
        Error::Crs(format!(
            "bounds have no finite image in {}",
            transformer.target()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_transformer() {
        let crs = Crs::from_epsg(4326).unwrap();
        let transformer = CoordinateTransformer::new(&crs, &crs).unwrap();
        assert!(transformer.is_identity());

        let c = transformer.transform(Coordinate::new_3d(12.5, 41.9, 30.0)).unwrap();
        assert_eq!(c, Coordinate::new_3d(12.5, 41.9, 30.0));
        assert!(transformer.inverse().unwrap().is_identity());
    }

    #[test]
    fn test_transform_xy_identity_marks_success() {
        let crs = Crs::from_epsg(3857).unwrap();
        let transformer = CoordinateTransformer::new(&crs, &crs).unwrap();
        let mut xs = vec![1.0, 2.0];
        let mut ys = vec![3.0, 4.0];
        let ok = transformer.transform_xy(&mut xs, &mut ys);
        assert_eq!(ok, vec![true, true]);
        assert_eq!(xs, vec![1.0, 2.0]);
    }

    #[test]
    fn test_transform_points_length_mismatch() {
        let crs = Crs::from_epsg(4326).unwrap();
        let result = transform_points(&crs, &crs, &[1.0, 2.0], &[1.0], None);
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_transform_points_identity_carries_z() {
        let crs = Crs::from_epsg(4326).unwrap();
        let (xs, ys, zs) =
            transform_points(&crs, &crs, &[1.0, 2.0], &[3.0, 4.0], Some(&[5.0, 6.0])).unwrap();
        assert_eq!(xs, vec![1.0, 2.0]);
        assert_eq!(ys, vec![3.0, 4.0]);
        assert_eq!(zs, Some(vec![5.0, 6.0]));
    }

    #[test]
    fn test_transform_bounds_identity() {
        let crs = Crs::from_epsg(4326).unwrap();
        let bounds = Bounds::new(-10.0, -5.0, 10.0, 5.0);
        assert_eq!(transform_bounds(&crs, &crs, &bounds, 21).unwrap(), bounds);
    }
}
