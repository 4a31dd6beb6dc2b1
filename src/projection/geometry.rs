//! GeoJSON-like geometries and their transformation between CRSs.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::projection::coordinate::{round_to, Coordinate};
use crate::projection::crs::Crs;
use crate::projection::transformer::CoordinateTransformer;

/// A coordinate tuple: x, y and optionally z
pub type Position = Vec<f64>;

/// Vector geometry in GeoJSON layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Geometry {
    Point { coordinates: Position },
    MultiPoint { coordinates: Vec<Position> },
    LineString { coordinates: Vec<Position> },
    MultiLineString { coordinates: Vec<Vec<Position>> },
    Polygon { coordinates: Vec<Vec<Position>> },
    MultiPolygon { coordinates: Vec<Vec<Vec<Position>>> },
    GeometryCollection { geometries: Vec<Geometry> },
}

impl Geometry {
    /// Parses a GeoJSON geometry object
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::InvalidInput(format!("invalid geometry: {}", e)))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidInput(format!("unserializable geometry: {}", e)))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Geometry::Point { .. } => "Point",
            Geometry::MultiPoint { .. } => "MultiPoint",
            Geometry::LineString { .. } => "LineString",
            Geometry::MultiLineString { .. } => "MultiLineString",
            Geometry::Polygon { .. } => "Polygon",
            Geometry::MultiPolygon { .. } => "MultiPolygon",
            Geometry::GeometryCollection { .. } => "GeometryCollection",
        }
    }
}

/// Transforms `geometry` from `source` to `target`.
///
/// `antimeridian_offset` is always passed on as the dateline offset; lines and
/// polygons are cut at the antimeridian only when `antimeridian_cutting` is set
/// and the target is geographic. A non-negative `precision` rounds every
/// coordinate to that many decimals; geometry collections cannot be rounded.
pub fn transform_geometry(
    source: &Crs,
    target: &Crs,
    geometry: &Geometry,
    antimeridian_cutting: bool,
    antimeridian_offset: f64,
    precision: i32,
) -> Result<Geometry> {
    let transformer = CoordinateTransformer::new(source, target)?;
    let transformed =
        GeometryTransform::new(&transformer, antimeridian_cutting, antimeridian_offset)
            .apply(geometry)?;
    if precision >= 0 {
        round_geometry(&transformed, precision as u32)
    } else {
        Ok(transformed)
    }
}

/// Recursively rounds every coordinate component to `digits` decimals
pub fn round_geometry(geometry: &Geometry, digits: u32) -> Result<Geometry> {
    let round = |p: &Position| p.iter().map(|v| round_to(*v, digits)).collect::<Position>();
    let round_line = |l: &Vec<Position>| l.iter().map(round).collect::<Vec<_>>();
    let round_poly = |p: &Vec<Vec<Position>>| p.iter().map(round_line).collect::<Vec<_>>();

    let rounded = match geometry {
        Geometry::Point { coordinates } => Geometry::Point {
            coordinates: round(coordinates),
        },
        Geometry::MultiPoint { coordinates } => Geometry::MultiPoint {
            coordinates: round_line(coordinates),
        },
        Geometry::LineString { coordinates } => Geometry::LineString {
            coordinates: round_line(coordinates),
        },
        Geometry::MultiLineString { coordinates } => Geometry::MultiLineString {
            coordinates: round_poly(coordinates),
        },
        Geometry::Polygon { coordinates } => Geometry::Polygon {
            coordinates: round_poly(coordinates),
        },
        Geometry::MultiPolygon { coordinates } => Geometry::MultiPolygon {
            coordinates: coordinates.iter().map(round_poly).collect(),
        },
        Geometry::GeometryCollection { .. } => {
            return Err(Error::Unsupported(
                "rounding coordinates of a GeometryCollection is not supported".to_string(),
            ))
        }
    };
    Ok(rounded)
}

/// Applies a coordinate transformation plus dateline handling to geometries
struct GeometryTransform<'a> {
    transformer: &'a CoordinateTransformer,
    wrap_dateline: bool,
    dateline_offset: f64,
}

impl<'a> GeometryTransform<'a> {
    fn new(transformer: &'a CoordinateTransformer, wrap_dateline: bool, dateline_offset: f64) -> Self {
        let geographic = transformer.target().is_geographic();
        if wrap_dateline && !geographic {
            debug!(target = %transformer.target(), "dateline wrapping ignored for projected target");
        }

        Self {
            transformer,
            wrap_dateline: wrap_dateline && geographic,
            dateline_offset,
        }
    }

    fn apply(&self, geometry: &Geometry) -> Result<Geometry> {
        let result = match geometry {
            Geometry::Point { coordinates } => {
                let mut p = self.position(coordinates)?;
                if self.wrap_dateline {
                    p[0] = wrap_lon(p[0]);
                }
                Geometry::Point { coordinates: p }
            }
            Geometry::MultiPoint { coordinates } => {
                let mut points = self.line(coordinates)?;
                if self.wrap_dateline {
                    points.iter_mut().for_each(|p| p[0] = wrap_lon(p[0]));
                }
                Geometry::MultiPoint { coordinates: points }
            }
            Geometry::LineString { coordinates } => {
                let line = self.line(coordinates)?;
                if self.wrap_dateline {
                    let mut parts = self.split_line(&line);
                    if parts.len() == 1 {
                        Geometry::LineString {
                            coordinates: parts.remove(0),
                        }
                    } else {
                        Geometry::MultiLineString { coordinates: parts }
                    }
                } else {
                    Geometry::LineString { coordinates: line }
                }
            }
            Geometry::MultiLineString { coordinates } => {
                let mut lines = Vec::with_capacity(coordinates.len());
                for line in coordinates {
                    let line = self.line(line)?;
                    if self.wrap_dateline {
                        lines.extend(self.split_line(&line));
                    } else {
                        lines.push(line);
                    }
                }
                Geometry::MultiLineString { coordinates: lines }
            }
            Geometry::Polygon { coordinates } => {
                let rings = self.polygon(coordinates)?;
                if self.wrap_dateline {
                    let mut parts = self.cut_polygon(&rings);
                    if parts.len() == 1 {
                        Geometry::Polygon {
                            coordinates: parts.remove(0),
                        }
                    } else {
                        Geometry::MultiPolygon { coordinates: parts }
                    }
                } else {
                    Geometry::Polygon { coordinates: rings }
                }
            }
            Geometry::MultiPolygon { coordinates } => {
                let mut polygons = Vec::with_capacity(coordinates.len());
                for polygon in coordinates {
                    let rings = self.polygon(polygon)?;
                    if self.wrap_dateline {
                        polygons.extend(self.cut_polygon(&rings));
                    } else {
                        polygons.push(rings);
                    }
                }
                Geometry::MultiPolygon {
                    coordinates: polygons,
                }
            }
            Geometry::GeometryCollection { geometries } => Geometry::GeometryCollection {
                geometries: geometries
                    .iter()
                    .map(|g| self.apply(g))
                    .collect::<Result<_>>()?,
            },
        };
        Ok(result)
    }

    fn position(&self, position: &Position) -> Result<Position> {
        let c = self.transformer.transform(Coordinate::from_position(position)?)?;
        let mut out = position.clone();
        c.write_xy(&mut out);
        Ok(out)
    }

    fn line(&self, line: &[Position]) -> Result<Vec<Position>> {
        line.iter().map(|p| self.position(p)).collect()
    }

    fn polygon(&self, rings: &[Vec<Position>]) -> Result<Vec<Vec<Position>>> {
        rings.iter().map(|r| self.line(r)).collect()
    }

    /// True if the segment a -> b jumps across the antimeridian
    fn crosses(&self, a: f64, b: f64) -> bool {
        let near = 180.0 - self.dateline_offset;
        (a >= near && b <= -near) || (a <= -near && b >= near)
    }

    fn split_line(&self, line: &[Position]) -> Vec<Vec<Position>> {
        let mut parts = Vec::new();
        let mut current: Vec<Position> = Vec::new();

        for p in line {
            let mut p = p.clone();
            p[0] = wrap_lon(p[0]);

            if let Some(prev) = current.last() {
                if self.crosses(prev[0], p[0]) {
                    let (edge, opposite, shift) = if prev[0] > 0.0 {
                        (180.0, -180.0, 360.0)
                    } else {
                        (-180.0, 180.0, -360.0)
                    };
                    let mut unwrapped = p.clone();
                    unwrapped[0] += shift;
                    let t = (edge - prev[0]) / (unwrapped[0] - prev[0]);

                    let mut end = interpolate(prev, &unwrapped, t);
                    end[0] = edge;
                    let mut start = end.clone();
                    start[0] = opposite;

                    current.push(end);
                    parts.push(std::mem::take(&mut current));
                    current.push(start);
                }
            }
            current.push(p);
        }
        if !current.is_empty() {
            parts.push(current);
        }
        parts
    }

    /// Unwraps longitudes so the ring is continuous across the antimeridian
    fn unwrap_ring(&self, ring: &[Position]) -> Vec<Position> {
        let mut out: Vec<Position> = Vec::with_capacity(ring.len());
        let mut shift = 0.0;
        let mut prev_raw: Option<f64> = None;

        for p in ring {
            let raw = wrap_lon(p[0]);
            if let Some(prev) = prev_raw {
                if self.crosses(prev, raw) {
                    shift += if prev > 0.0 { 360.0 } else { -360.0 };
                }
            }
            prev_raw = Some(raw);
            let mut q = p.clone();
            q[0] = raw + shift;
            out.push(q);
        }
        out
    }

    fn cut_polygon(&self, rings: &[Vec<Position>]) -> Vec<Vec<Vec<Position>>> {
        let crossing = rings.iter().any(|ring| {
            ring.windows(2)
                .any(|w| self.crosses(wrap_lon(w[0][0]), wrap_lon(w[1][0])))
        });
        if !crossing || rings.is_empty() {
            let wrapped = rings
                .iter()
                .map(|ring| {
                    ring.iter()
                        .map(|p| {
                            let mut p = p.clone();
                            p[0] = wrap_lon(p[0]);
                            p
                        })
                        .collect()
                })
                .collect();
            return vec![wrapped];
        }

        let exterior = self.unwrap_ring(&rings[0]);
        let anchor = exterior.first().map_or(0.0, |p| p[0]);
        let interiors: Vec<Vec<Position>> = rings[1..]
            .iter()
            .map(|ring| {
                let mut ring = self.unwrap_ring(ring);
                if let Some(first) = ring.first().map(|p| p[0]) {
                    let k = ((anchor - first) / 360.0).round();
                    ring.iter_mut().for_each(|p| p[0] += 360.0 * k);
                }
                ring
            })
            .collect();

        let (min_x, max_x) = exterior
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), p| {
                (lo.min(p[0]), hi.max(p[0]))
            });
        let first_band = ((min_x + 180.0) / 360.0).floor() as i64;
        let last_band = ((max_x + 180.0) / 360.0).floor() as i64;

        let mut polygons = Vec::new();
        for band in first_band..=last_band {
            let lo = -180.0 + 360.0 * band as f64;
            let hi = lo + 360.0;
            let shift = -360.0 * band as f64;

            let outer = clip_ring(&exterior, lo, hi);
            if ring_area(&outer).abs() < 1e-12 {
                continue;
            }
            let mut polygon = vec![shift_ring(outer, shift)];
            for interior in &interiors {
                let hole = clip_ring(interior, lo, hi);
                if ring_area(&hole).abs() >= 1e-12 {
                    polygon.push(shift_ring(hole, shift));
                }
            }
            polygons.push(polygon);
        }
        polygons
    }
}

/// Normalizes a longitude into [-180, 180]
fn wrap_lon(lon: f64) -> f64 {
    if (-180.0..=180.0).contains(&lon) || !lon.is_finite() {
        lon
    } else {
        (lon + 180.0).rem_euclid(360.0) - 180.0
    }
}

fn interpolate(a: &Position, b: &Position, t: f64) -> Position {
    a.iter()
        .zip(b.iter())
        .map(|(u, v)| u + t * (v - u))
        .collect()
}

fn shift_ring(mut ring: Vec<Position>, shift: f64) -> Vec<Position> {
    ring.iter_mut().for_each(|p| p[0] += shift);
    ring
}

/// Clips a closed ring to the vertical band lo <= x <= hi
fn clip_ring(ring: &[Position], lo: f64, hi: f64) -> Vec<Position> {
    let open: Vec<Position> = match ring.split_last() {
        Some((last, rest)) if !rest.is_empty() && rest[0] == *last => rest.to_vec(),
        _ => ring.to_vec(),
    };
    let clipped = clip_half_plane(&open, |x| x >= lo, lo);
    let mut clipped = clip_half_plane(&clipped, |x| x <= hi, hi);
    if let Some(first) = clipped.first().cloned() {
        clipped.push(first);
    }
    clipped
}

fn clip_half_plane(points: &[Position], inside: impl Fn(f64) -> bool, boundary: f64) -> Vec<Position> {
    let n = points.len();
    let mut out = Vec::with_capacity(n + 2);
    for i in 0..n {
        let cur = &points[i];
        let prev = &points[(i + n - 1) % n];
        let cur_in = inside(cur[0]);
        let prev_in = inside(prev[0]);

        if cur_in != prev_in {
            let t = (boundary - prev[0]) / (cur[0] - prev[0]);
            let mut p = interpolate(prev, cur, t);
            p[0] = boundary;
            out.push(p);
        }
        if cur_in {
            out.push(cur.clone());
        }
    }
    out
}

/// Shoelace area of a closed ring
fn ring_area(ring: &[Position]) -> f64 {
    if ring.len() < 4 {
        return 0.0;
    }
    ring.windows(2)
        .map(|w| w[0][0] * w[1][1] - w[1][0] * w[0][1])
        .sum::<f64>()
        / 2.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wgs84() -> Crs {
        Crs::from_epsg(4326).unwrap()
    }

    fn extent(ring: &[Position]) -> (f64, f64) {
        ring.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), p| {
            (lo.min(p[0]), hi.max(p[0]))
        })
    }

    #[test]
    fn test_point_at_origin_rounded() {
        let point = Geometry::Point {
            coordinates: vec![0.0, 0.0],
        };
        let result = transform_geometry(&wgs84(), &wgs84(), &point, false, 10.0, 2).unwrap();
        assert_eq!(result, point);

        let point = Geometry::Point {
            coordinates: vec![0.123456, -7.891011],
        };
        let result = transform_geometry(&wgs84(), &wgs84(), &point, false, 10.0, 2).unwrap();
        assert_eq!(
            result,
            Geometry::Point {
                coordinates: vec![0.12, -7.89]
            }
        );
    }

    #[test]
    fn test_negative_precision_keeps_coordinates() {
        let line = Geometry::LineString {
            coordinates: vec![vec![1.23456, 2.34567], vec![3.45678, 4.56789]],
        };
        let result = transform_geometry(&wgs84(), &wgs84(), &line, false, 10.0, -1).unwrap();
        assert_eq!(result, line);
    }

    #[test]
    fn test_collection_rounding_is_unsupported() {
        let collection = Geometry::GeometryCollection {
            geometries: vec![Geometry::Point {
                coordinates: vec![1.0, 2.0],
            }],
        };
        let result = transform_geometry(&wgs84(), &wgs84(), &collection, false, 10.0, 3);
        assert!(matches!(result, Err(Error::Unsupported(_))));

        let result = transform_geometry(&wgs84(), &wgs84(), &collection, false, 10.0, -1).unwrap();
        assert_eq!(result, collection);
    }

    #[test]
    fn test_line_cut_at_antimeridian() {
        let line = Geometry::LineString {
            coordinates: vec![vec![175.0, 0.0], vec![-175.0, 10.0]],
        };
        let result = transform_geometry(&wgs84(), &wgs84(), &line, true, 10.0, -1).unwrap();
        assert_eq!(
            result,
            Geometry::MultiLineString {
                coordinates: vec![
                    vec![vec![175.0, 0.0], vec![180.0, 5.0]],
                    vec![vec![-180.0, 5.0], vec![-175.0, 10.0]],
                ]
            }
        );

        let uncut = transform_geometry(&wgs84(), &wgs84(), &line, false, 10.0, -1).unwrap();
        assert_eq!(uncut, line);
    }

    #[test]
    fn test_offset_controls_crossing_detection() {
        let line = Geometry::LineString {
            coordinates: vec![vec![165.0, 0.0], vec![-165.0, 0.0]],
        };
        let narrow = transform_geometry(&wgs84(), &wgs84(), &line, true, 10.0, -1).unwrap();
        assert_eq!(narrow.type_name(), "LineString");

        let wide = transform_geometry(&wgs84(), &wgs84(), &line, true, 20.0, -1).unwrap();
        assert_eq!(wide.type_name(), "MultiLineString");
    }

    #[test]
    fn test_polygon_cut_at_antimeridian() {
        let polygon = Geometry::Polygon {
            coordinates: vec![vec![
                vec![175.0, -5.0],
                vec![-175.0, -5.0],
                vec![-175.0, 5.0],
                vec![175.0, 5.0],
                vec![175.0, -5.0],
            ]],
        };
        let result = transform_geometry(&wgs84(), &wgs84(), &polygon, true, 10.0, -1).unwrap();
        let Geometry::MultiPolygon { coordinates } = result else {
            panic!("expected a MultiPolygon");
        };
        assert_eq!(coordinates.len(), 2);

        let mut extents: Vec<(f64, f64)> = coordinates.iter().map(|p| extent(&p[0])).collect();
        extents.sort_by(|a, b| a.0.total_cmp(&b.0));
        assert_eq!(extents, vec![(-180.0, -175.0), (175.0, 180.0)]);
        for polygon in &coordinates {
            let ring = &polygon[0];
            assert_eq!(ring.first(), ring.last());
        }
    }

    #[test]
    fn test_polygon_away_from_dateline_untouched() {
        let polygon = Geometry::Polygon {
            coordinates: vec![vec![
                vec![0.0, 0.0],
                vec![1.0, 0.0],
                vec![1.0, 1.0],
                vec![0.0, 0.0],
            ]],
        };
        let result = transform_geometry(&wgs84(), &wgs84(), &polygon, true, 10.0, -1).unwrap();
        assert_eq!(result, polygon);
    }

    #[test]
    fn test_cutting_ignored_for_projected_target() {
        let mercator = Crs::from_epsg(3857).unwrap();
        let line = Geometry::LineString {
            coordinates: vec![vec![175.0, 0.0], vec![-175.0, 10.0]],
        };
        let result = transform_geometry(&mercator, &mercator, &line, true, 10.0, -1).unwrap();
        assert_eq!(result, line);
    }

    #[test]
    fn test_dateline_flags_reach_transform() {
        let transformer = CoordinateTransformer::new(&wgs84(), &wgs84()).unwrap();
        let transform = GeometryTransform::new(&transformer, true, 20.0);
        assert!(transform.wrap_dateline);
        assert_eq!(transform.dateline_offset, 20.0);
        assert!(!GeometryTransform::new(&transformer, false, 20.0).wrap_dateline);

        let mercator = Crs::from_epsg(3857).unwrap();
        let transformer = CoordinateTransformer::new(&mercator, &mercator).unwrap();
        assert!(!GeometryTransform::new(&transformer, true, 20.0).wrap_dateline);
    }

    #[test]
    fn test_line_cut_in_other_geographic_crs() {
        let line = Geometry::LineString {
            coordinates: vec![vec![175.0, 0.0], vec![-175.0, 10.0]],
        };
        for code in [4230, 4979] {
            let crs = Crs::from_epsg(code).unwrap();
            let result = transform_geometry(&crs, &crs, &line, true, 10.0, -1).unwrap();
            assert_eq!(result.type_name(), "MultiLineString", "EPSG:{}", code);
        }
    }

    #[test]
    fn test_wgs84_to_web_mercator() {
        let point = Geometry::Point {
            coordinates: vec![10.0, 0.0],
        };
        let mercator = Crs::from_epsg(3857).unwrap();
        let result = transform_geometry(&wgs84(), &mercator, &point, false, 10.0, 1).unwrap();
        assert_eq!(
            result,
            Geometry::Point {
                coordinates: vec![1113194.9, 0.0]
            }
        );

        let back = transform_geometry(&mercator, &wgs84(), &result, false, 10.0, 6).unwrap();
        assert_eq!(
            back,
            Geometry::Point {
                coordinates: vec![10.0, 0.0]
            }
        );
    }

    #[test]
    fn test_short_position_is_invalid() {
        let point = Geometry::Point {
            coordinates: vec![1.0],
        };
        let result = transform_geometry(&wgs84(), &wgs84(), &point, false, 10.0, -1);
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_geojson_roundtrip_shape() {
        let geometry = Geometry::from_json(r#"{"type": "Point", "coordinates": [1.5, 2.5]}"#).unwrap();
        assert_eq!(
            geometry,
            Geometry::Point {
                coordinates: vec![1.5, 2.5]
            }
        );
        assert!(geometry.to_json().unwrap().contains("\"type\":\"Point\""));
        assert!(Geometry::from_json(r#"{"type": "Circle"}"#).is_err());
    }

    #[test]
    fn test_wrap_lon() {
        assert_eq!(wrap_lon(190.0), -170.0);
        assert_eq!(wrap_lon(-190.0), 170.0);
        assert_eq!(wrap_lon(180.0), 180.0);
    }
}
