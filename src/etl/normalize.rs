use geo::{Coord, Geometry, LineString, Simplify};

use crate::data::feature::{GeometryKind, Shape};
use crate::data::{MicroCoord, MICRO};
use crate::errors::{Error, Result};

/// Snaps, deduplicates and simplifies raw geometries.
///
/// All work after snapping happens on integer microdegrees, so the result only
/// depends on the input coordinates and the settings.
#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    /// Douglas-Peucker tolerance in microdegrees.
    epsilon: f64,
}

impl Normalizer {
    /// `tolerance` is in degrees; 0 disables simplification.
    pub fn new(tolerance: f64) -> Self {
        Normalizer {
            epsilon: tolerance * MICRO,
        }
    }

    pub fn normalize(&self, geometry: &Geometry<f64>, precision: u8) -> Result<Shape> {
        match geometry {
            Geometry::Point(point) => self.point(point.0, precision),
            Geometry::MultiPoint(points) if points.0.len() == 1 => self.point(points.0[0].0, precision),
            Geometry::LineString(line) => self.line(line, precision),
            Geometry::MultiLineString(lines) if lines.0.len() == 1 => self.line(&lines.0[0], precision),
            Geometry::Polygon(polygon) => self.polygon(polygon.exterior(), precision),
            other => Err(Error::degenerate(format!("unsupported geometry {}", geometry_name(other)))),
        }
    }

    fn point(&self, coord: Coord<f64>, precision: u8) -> Result<Shape> {
        Ok(Shape::single(GeometryKind::Point, vec![snap(coord, precision)?]))
    }

    fn line(&self, line: &LineString<f64>, precision: u8) -> Result<Shape> {
        let points = dedup(snap_all(line, precision)?);
        let points = self.simplify(points);
        if points.len() < 2 {
            return Err(Error::degenerate("line collapsed to a single point"));
        }
        Ok(Shape::single(GeometryKind::Line, points))
    }

    fn polygon(&self, ring: &LineString<f64>, precision: u8) -> Result<Shape> {
        let mut points = dedup(snap_all(ring, precision)?);
        close_ring(&mut points);
        validate_ring(&points)?;
        let points = self.simplify(points);
        validate_ring(&points)?;
        Ok(Shape::single(GeometryKind::Polygon, points))
    }

    fn simplify(&self, points: Vec<MicroCoord>) -> Vec<MicroCoord> {
        if self.epsilon <= 0.0 || points.len() < 3 {
            return points;
        }
        let line: LineString<f64> = points
            .iter()
            .map(|p| Coord { x: p.lon as f64, y: p.lat as f64 })
            .collect();
        // the kept vertices are a subset of integer inputs, so the casts are exact
        line.simplify(&self.epsilon)
            .0
            .into_iter()
            .map(|c| MicroCoord::new(c.y as i32, c.x as i32))
            .collect()
    }
}

fn geometry_name(geometry: &Geometry<f64>) -> &'static str {
    match geometry {
        Geometry::Point(_) => "Point",
        Geometry::Line(_) => "Line",
        Geometry::LineString(_) => "LineString",
        Geometry::Polygon(_) => "Polygon",
        Geometry::MultiPoint(_) => "MultiPoint",
        Geometry::MultiLineString(_) => "MultiLineString",
        Geometry::MultiPolygon(_) => "MultiPolygon",
        Geometry::GeometryCollection(_) => "GeometryCollection",
        Geometry::Rect(_) => "Rect",
        Geometry::Triangle(_) => "Triangle",
    }
}

/// Rounds a degree coordinate to the precision grid, half away from zero.
pub fn snap(coord: Coord<f64>, precision: u8) -> Result<MicroCoord> {
    let (lon, lat) = (coord.x, coord.y);
    if !lat.is_finite() || !lon.is_finite() {
        return Err(Error::degenerate("non-finite coordinate"));
    }
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return Err(Error::degenerate(format!("coordinate {lat},{lon} out of range")));
    }
    let precision = precision.min(6);
    let scale = 10f64.powi(i32::from(precision));
    let step = MICRO / scale;
    let snap_one = |value: f64| ((value * scale).round() * step).round() as i32;
    Ok(MicroCoord::new(snap_one(lat), snap_one(lon)))
}

fn snap_all(line: &LineString<f64>, precision: u8) -> Result<Vec<MicroCoord>> {
    line.0.iter().map(|c| snap(*c, precision)).collect()
}

fn dedup(mut points: Vec<MicroCoord>) -> Vec<MicroCoord> {
    points.dedup();
    points
}

fn close_ring(points: &mut Vec<MicroCoord>) {
    if let (Some(first), Some(last)) = (points.first().copied(), points.last().copied()) {
        if first != last {
            points.push(first);
        }
    }
}

fn validate_ring(points: &[MicroCoord]) -> Result<()> {
    if points.len() < 4 {
        return Err(Error::degenerate(format!("ring has {} points, needs at least 4", points.len())));
    }
    let mut distinct = points[..points.len() - 1].to_vec();
    distinct.sort();
    distinct.dedup();
    if distinct.len() < 3 {
        return Err(Error::degenerate("ring has fewer than 3 distinct vertices"));
    }
    if ring_area2(points) == 0 {
        return Err(Error::degenerate("ring has no area"));
    }
    if self_intersects(points) {
        return Err(Error::degenerate("ring intersects itself"));
    }
    Ok(())
}

/// Twice the signed area of a closed ring.
pub fn ring_area2(points: &[MicroCoord]) -> i128 {
    points
        .windows(2)
        .map(|w| {
            i128::from(w[0].lon) * i128::from(w[1].lat) - i128::from(w[1].lon) * i128::from(w[0].lat)
        })
        .sum()
}

fn orientation(a: MicroCoord, b: MicroCoord, c: MicroCoord) -> i64 {
    let value = (i64::from(b.lon) - i64::from(a.lon)) * (i64::from(c.lat) - i64::from(a.lat))
        - (i64::from(b.lat) - i64::from(a.lat)) * (i64::from(c.lon) - i64::from(a.lon));
    value.signum()
}

fn on_segment(a: MicroCoord, b: MicroCoord, p: MicroCoord) -> bool {
    p.lon >= a.lon.min(b.lon) && p.lon <= a.lon.max(b.lon) && p.lat >= a.lat.min(b.lat) && p.lat <= a.lat.max(b.lat)
}

fn segments_intersect(a: MicroCoord, b: MicroCoord, c: MicroCoord, d: MicroCoord) -> bool {
    let o1 = orientation(a, b, c);
    let o2 = orientation(a, b, d);
    let o3 = orientation(c, d, a);
    let o4 = orientation(c, d, b);
    if o1 != o2 && o3 != o4 {
        return true;
    }
    (o1 == 0 && on_segment(a, b, c))
        || (o2 == 0 && on_segment(a, b, d))
        || (o3 == 0 && on_segment(c, d, a))
        || (o4 == 0 && on_segment(c, d, b))
}

/// Checks every pair of non-adjacent ring edges.
fn self_intersects(points: &[MicroCoord]) -> bool {
    let edges = points.len() - 1;
    for i in 0..edges {
        for j in (i + 2)..edges {
            // first and last edge share the closing vertex
            if i == 0 && j == edges - 1 {
                continue;
            }
            if segments_intersect(points[i], points[i + 1], points[j], points[j + 1]) {
                return true;
            }
        }
    }
    false
}
