//! Web Mercator tile grid with exact integer tile edges.
//!
//! Edges are rounded to microdegrees once, so every stage agrees on which tile
//! owns a coordinate. A tile owns the half-open range `(west, east]` x
//! `[south, north)`: coordinates on a shared edge go to the tile with the lower
//! row or column index. The first row and column also own their outer edge.

use std::collections::BTreeSet;
use std::f64::consts::PI;
use std::ops::RangeInclusive;

use crate::config::ZoomInterval;
use crate::data::feature::{GeometryKind, Shape};
use crate::data::tile::TileKey;
use crate::data::{MicroBox, MicroCoord, MICRO};
use crate::etl::normalize::ring_area2;

pub const MAX_ZOOM: u8 = 21;

/// Northern limit of the Web Mercator projection in degrees.
const MAX_LATITUDE: f64 = 85.051_128_779_806_59;

pub fn tile_count(zoom: u8) -> u32 {
    1u32 << zoom
}

/// Longitude of the western edge of `col`, for `col` in `0..=2^zoom`.
pub fn col_west(zoom: u8, col: u32) -> i32 {
    let n = f64::from(tile_count(zoom));
    ((f64::from(col) / n * 360.0 - 180.0) * MICRO).round() as i32
}

/// Latitude of the northern edge of `row`, for `row` in `0..=2^zoom`.
pub fn row_north(zoom: u8, row: u32) -> i32 {
    let n = f64::from(tile_count(zoom));
    let lat = (PI * (1.0 - 2.0 * f64::from(row) / n)).sinh().atan().to_degrees();
    (lat * MICRO).round() as i32
}

pub fn tile_bounds(key: &TileKey) -> MicroBox {
    MicroBox {
        south: row_north(key.zoom, key.row + 1),
        west: col_west(key.zoom, key.col),
        north: row_north(key.zoom, key.row),
        east: col_west(key.zoom, key.col + 1),
    }
}

/// North-west corner, the reference point for delta encoding.
pub fn tile_origin(key: &TileKey) -> MicroCoord {
    MicroCoord::new(row_north(key.zoom, key.row), col_west(key.zoom, key.col))
}

pub fn col_of(zoom: u8, lon: i32) -> u32 {
    let n = tile_count(zoom);
    let estimate = ((f64::from(lon) / MICRO + 180.0) / 360.0 * f64::from(n)).floor();
    let mut col = (estimate.max(0.0) as u32).min(n - 1);
    while col > 0 && lon <= col_west(zoom, col) {
        col -= 1;
    }
    while col + 1 < n && lon > col_west(zoom, col + 1) {
        col += 1;
    }
    col
}

pub fn row_of(zoom: u8, lat: i32) -> u32 {
    let n = tile_count(zoom);
    let phi = (f64::from(lat) / MICRO).clamp(-MAX_LATITUDE, MAX_LATITUDE).to_radians();
    let estimate = ((1.0 - (phi.tan() + 1.0 / phi.cos()).ln() / PI) / 2.0 * f64::from(n)).floor();
    let mut row = (estimate.max(0.0) as u32).min(n - 1);
    while row > 0 && lat >= row_north(zoom, row) {
        row -= 1;
    }
    while row + 1 < n && lat < row_north(zoom, row + 1) {
        row += 1;
    }
    row
}

/// Rectangular block of tiles at one zoom level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileRange {
    pub zoom: u8,
    pub rows: RangeInclusive<u32>,
    pub cols: RangeInclusive<u32>,
}

impl TileRange {
    pub fn of_box(zoom: u8, bbox: &MicroBox) -> TileRange {
        TileRange {
            zoom,
            rows: row_of(zoom, bbox.north)..=row_of(zoom, bbox.south),
            cols: col_of(zoom, bbox.west)..=col_of(zoom, bbox.east),
        }
    }

    pub fn contains(&self, key: &TileKey) -> bool {
        key.zoom == self.zoom && self.rows.contains(&key.row) && self.cols.contains(&key.col)
    }

    pub fn intersect(&self, other: &TileRange) -> Option<TileRange> {
        let rows = *self.rows.start().max(other.rows.start())..=*self.rows.end().min(other.rows.end());
        let cols = *self.cols.start().max(other.cols.start())..=*self.cols.end().min(other.cols.end());
        if rows.is_empty() || cols.is_empty() {
            return None;
        }
        Some(TileRange { zoom: self.zoom, rows, cols })
    }

    pub fn keys(&self) -> impl Iterator<Item = TileKey> + '_ {
        self.rows
            .clone()
            .flat_map(move |row| self.cols.clone().map(move |col| TileKey::new(self.zoom, row, col)))
    }
}

/// Assigns shapes to the tiles of every configured base zoom.
#[derive(Debug, Clone)]
pub struct TileGrid {
    bbox: MicroBox,
    intervals: Vec<ZoomInterval>,
    ranges: Vec<TileRange>,
}

impl TileGrid {
    pub fn new(bbox: MicroBox, intervals: Vec<ZoomInterval>) -> Self {
        let ranges = intervals
            .iter()
            .map(|interval| TileRange::of_box(interval.base, &bbox))
            .collect();
        TileGrid { bbox, intervals, ranges }
    }

    /// True if a feature visible from `zoom_min` to `zoom_max` shows up in any interval.
    pub fn covers(&self, zoom_min: u8, zoom_max: u8) -> bool {
        self.intervals.iter().any(|interval| interval.overlaps(zoom_min, zoom_max))
    }

    /// Clipped copies of `shape` per tile it intersects, ordered by tile key.
    pub fn assign(&self, shape: &Shape, zoom_min: u8, zoom_max: u8) -> Vec<(TileKey, Shape)> {
        let Some(envelope) = shape.envelope() else {
            return Vec::new();
        };
        if !envelope.intersects(&self.bbox) {
            return Vec::new();
        }

        let mut out = Vec::new();
        for (interval, range) in self.intervals.iter().zip(&self.ranges) {
            if !interval.overlaps(zoom_min, zoom_max) {
                continue;
            }
            for key in candidate_tiles(shape, &envelope, range) {
                if let Some(clipped) = clip_shape(shape, &key) {
                    out.push((key, clipped));
                }
            }
        }
        out
    }
}

/// Tiles worth clipping against. Points have exactly one owner, lines walk
/// the grid segment by segment, polygons need their whole envelope.
fn candidate_tiles(shape: &Shape, envelope: &MicroBox, range: &TileRange) -> BTreeSet<TileKey> {
    let zoom = range.zoom;
    let mut keys = BTreeSet::new();
    match shape.kind {
        GeometryKind::Point => {
            for point in shape.points() {
                let key = TileKey::new(zoom, row_of(zoom, point.lat), col_of(zoom, point.lon));
                if range.contains(&key) {
                    keys.insert(key);
                }
            }
        }
        GeometryKind::Line => {
            for part in &shape.parts {
                for segment in part.windows(2) {
                    segment_tiles(segment[0], segment[1], range, &mut keys);
                }
            }
        }
        GeometryKind::Polygon => {
            if let Some(block) = TileRange::of_box(zoom, envelope).intersect(range) {
                keys.extend(block.keys());
            }
        }
    }
    keys
}

/// Adds the tiles of `range` that segment `a`-`b` passes through, one column
/// strip at a time. Rows get one microdegree of slack against rounding; the
/// clipper discards tiles that are only touched.
fn segment_tiles(a: MicroCoord, b: MicroCoord, range: &TileRange, keys: &mut BTreeSet<TileKey>) {
    let zoom = range.zoom;
    let (west, east) = if a.lon <= b.lon { (a, b) } else { (b, a) };
    let first_col = col_of(zoom, west.lon).max(*range.cols.start());
    let last_col = col_of(zoom, east.lon).min(*range.cols.end());
    let lat_at = |lon: i32| -> i32 {
        let lon = lon.clamp(west.lon, east.lon);
        let t = (f64::from(lon) - f64::from(west.lon)) / (f64::from(east.lon) - f64::from(west.lon));
        (f64::from(west.lat) + t * (f64::from(east.lat) - f64::from(west.lat))).round() as i32
    };

    for col in first_col..=last_col {
        let (lat_a, lat_b) = if west.lon == east.lon {
            (west.lat, east.lat)
        } else {
            (lat_at(col_west(zoom, col)), lat_at(col_west(zoom, col + 1)))
        };
        let first_row = row_of(zoom, lat_a.max(lat_b).saturating_add(1)).max(*range.rows.start());
        let last_row = row_of(zoom, lat_a.min(lat_b).saturating_sub(1)).min(*range.rows.end());
        for row in first_row..=last_row {
            keys.insert(TileKey::new(zoom, row, col));
        }
    }
}

/// A tile's rectangle and the shared edges it does not own: the western edge
/// belongs to the column to the west, the northern edge to the row above.
struct TileFrame {
    bounds: MicroBox,
    open_west: bool,
    open_north: bool,
}

impl TileFrame {
    fn of(key: &TileKey) -> TileFrame {
        TileFrame {
            bounds: tile_bounds(key),
            open_west: key.col > 0,
            open_north: key.row > 0,
        }
    }

    /// False for a segment lying on an edge owned by the neighbour.
    fn owns_segment(&self, a: MicroCoord, b: MicroCoord) -> bool {
        let on_west = a.lon == self.bounds.west && b.lon == self.bounds.west;
        let on_north = a.lat == self.bounds.north && b.lat == self.bounds.north;
        !(self.open_west && on_west) && !(self.open_north && on_north)
    }
}

/// Clips a shape to the tile `key`, `None` if nothing with extent remains.
/// Points and line runs on a shared edge stay with the lower-index tile.
pub fn clip_shape(shape: &Shape, key: &TileKey) -> Option<Shape> {
    let frame = TileFrame::of(key);
    let parts: Vec<Vec<MicroCoord>> = match shape.kind {
        GeometryKind::Point => shape
            .parts
            .iter()
            .filter(|part| {
                part.iter()
                    .all(|p| row_of(key.zoom, p.lat) == key.row && col_of(key.zoom, p.lon) == key.col)
            })
            .cloned()
            .collect(),
        GeometryKind::Line => shape.parts.iter().flat_map(|part| clip_line(part, &frame)).collect(),
        GeometryKind::Polygon => shape
            .parts
            .iter()
            .filter_map(|ring| clip_ring(ring, &frame.bounds))
            .collect(),
    };
    if parts.is_empty() {
        return None;
    }
    Some(Shape { kind: shape.kind, parts })
}

/// Liang-Barsky parameters of the part of segment `a`-`b` inside `bounds`.
fn clip_segment(a: MicroCoord, b: MicroCoord, bounds: &MicroBox) -> Option<(f64, f64)> {
    let (x0, y0) = (f64::from(a.lon), f64::from(a.lat));
    let dx = f64::from(b.lon) - x0;
    let dy = f64::from(b.lat) - y0;
    let checks = [
        (-dx, x0 - f64::from(bounds.west)),
        (dx, f64::from(bounds.east) - x0),
        (-dy, y0 - f64::from(bounds.south)),
        (dy, f64::from(bounds.north) - y0),
    ];

    let (mut t0, mut t1) = (0.0f64, 1.0f64);
    for (p, q) in checks {
        if p == 0.0 {
            if q < 0.0 {
                return None;
            }
            continue;
        }
        let t = q / p;
        if p < 0.0 {
            if t > t1 {
                return None;
            }
            t0 = t0.max(t);
        } else {
            if t < t0 {
                return None;
            }
            t1 = t1.min(t);
        }
    }
    Some((t0, t1))
}

fn lerp(a: MicroCoord, b: MicroCoord, t: f64) -> MicroCoord {
    if t <= 0.0 {
        return a;
    }
    if t >= 1.0 {
        return b;
    }
    MicroCoord::new(
        (f64::from(a.lat) + t * (f64::from(b.lat) - f64::from(a.lat))).round() as i32,
        (f64::from(a.lon) + t * (f64::from(b.lon) - f64::from(a.lon))).round() as i32,
    )
}

fn clip_line(points: &[MicroCoord], frame: &TileFrame) -> Vec<Vec<MicroCoord>> {
    fn flush(current: &mut Vec<MicroCoord>, parts: &mut Vec<Vec<MicroCoord>>) {
        let mut part = std::mem::take(current);
        part.dedup();
        if part.len() >= 2 {
            parts.push(part);
        }
    }

    let mut parts = Vec::new();
    let mut current: Vec<MicroCoord> = Vec::new();
    for segment in points.windows(2) {
        let (a, b) = (segment[0], segment[1]);
        match clip_segment(a, b, &frame.bounds) {
            None => flush(&mut current, &mut parts),
            Some((t0, t1)) => {
                let (start, end) = (lerp(a, b, t0), lerp(a, b, t1));
                if !frame.owns_segment(start, end) {
                    flush(&mut current, &mut parts);
                    continue;
                }
                if t0 > 0.0 || current.last() != Some(&start) {
                    flush(&mut current, &mut parts);
                    current.push(start);
                }
                current.push(end);
                if t1 < 1.0 {
                    flush(&mut current, &mut parts);
                }
            }
        }
    }
    flush(&mut current, &mut parts);
    parts
}

#[derive(Clone, Copy)]
enum Edge {
    West(f64),
    East(f64),
    South(f64),
    North(f64),
}

impl Edge {
    fn inside(self, (x, y): (f64, f64)) -> bool {
        match self {
            Edge::West(c) => x >= c,
            Edge::East(c) => x <= c,
            Edge::South(c) => y >= c,
            Edge::North(c) => y <= c,
        }
    }

    fn cross(self, (x1, y1): (f64, f64), (x2, y2): (f64, f64)) -> (f64, f64) {
        match self {
            Edge::West(c) | Edge::East(c) => (c, y1 + (c - x1) / (x2 - x1) * (y2 - y1)),
            Edge::South(c) | Edge::North(c) => (x1 + (c - y1) / (y2 - y1) * (x2 - x1), c),
        }
    }
}

/// Sutherland-Hodgman clipping of a closed ring.
fn clip_ring(ring: &[MicroCoord], bounds: &MicroBox) -> Option<Vec<MicroCoord>> {
    let open = &ring[..ring.len().saturating_sub(1)];
    let mut points: Vec<(f64, f64)> = open.iter().map(|p| (f64::from(p.lon), f64::from(p.lat))).collect();
    let edges = [
        Edge::West(f64::from(bounds.west)),
        Edge::East(f64::from(bounds.east)),
        Edge::South(f64::from(bounds.south)),
        Edge::North(f64::from(bounds.north)),
    ];

    for edge in edges {
        if points.is_empty() {
            return None;
        }
        let input = std::mem::take(&mut points);
        let mut previous = input[input.len() - 1];
        for &current in &input {
            match (edge.inside(current), edge.inside(previous)) {
                (true, true) => points.push(current),
                (true, false) => {
                    points.push(edge.cross(previous, current));
                    points.push(current);
                }
                (false, true) => points.push(edge.cross(previous, current)),
                (false, false) => (),
            }
            previous = current;
        }
    }

    let mut out: Vec<MicroCoord> = points
        .into_iter()
        .map(|(x, y)| MicroCoord::new(y.round() as i32, x.round() as i32))
        .collect();
    out.dedup();
    while out.len() > 1 && out.first() == out.last() {
        out.pop();
    }
    let first = *out.first()?;
    out.push(first);
    if out.len() < 4 || ring_area2(&out) == 0 {
        return None;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(zoom: u8, row: u32, col: u32) -> TileKey {
        TileKey::new(zoom, row, col)
    }

    #[test]
    fn tile_edges_match_web_mercator() {
        assert_eq!(col_west(0, 0), -180_000_000);
        assert_eq!(col_west(0, 1), 180_000_000);
        assert_eq!(row_north(0, 0), 85_051_129);
        assert_eq!(row_north(1, 1), 0);
        assert_eq!(row_north(0, 1), -85_051_129);
        let bounds = tile_bounds(&key(12, 5, 7));
        assert_eq!(bounds.west, col_west(12, 7));
        assert_eq!(bounds.east, col_west(12, 8));
        assert!(bounds.south < bounds.north);
    }

    #[test]
    fn boundary_coordinates_go_to_lower_index() {
        let zoom = 12;
        let edge = col_west(zoom, 8);
        assert_eq!(col_of(zoom, edge), 7);
        assert_eq!(col_of(zoom, edge + 1), 8);
        assert_eq!(col_of(zoom, edge - 1), 7);

        let edge = row_north(zoom, 6);
        assert_eq!(row_of(zoom, edge), 5);
        assert_eq!(row_of(zoom, edge - 1), 6);
        assert_eq!(row_of(zoom, edge + 1), 5);
    }

    #[test]
    fn outer_edges_stay_in_grid() {
        assert_eq!(col_of(3, -180_000_000), 0);
        assert_eq!(col_of(3, 180_000_000), 7);
        assert_eq!(row_of(3, 90_000_000), 0);
        assert_eq!(row_of(3, -90_000_000), 7);
    }

    #[test]
    fn cell_lookup_agrees_with_bounds() {
        for lon in [-179_999_999, -77_123_456, 0, 1, 11_500_000, 179_999_999] {
            for lat in [-84_000_000, -1, 0, 1, 47_500_000, 84_000_000] {
                let k = key(10, row_of(10, lat), col_of(10, lon));
                let b = tile_bounds(&k);
                assert!(b.west <= lon && lon <= b.east, "{lon} not in {b:?}");
                assert!(b.south <= lat && lat <= b.north, "{lat} not in {b:?}");
            }
        }
    }

    fn grid(zoom: u8) -> TileGrid {
        let bbox = MicroBox {
            south: -85_100_000,
            west: -180_000_000,
            north: 85_100_000,
            east: 180_000_000,
        };
        TileGrid::new(bbox, vec![ZoomInterval { base: zoom, min: zoom, max: zoom }])
    }

    #[test]
    fn crossing_line_is_split_at_the_edge() {
        let zoom = 12;
        let left = tile_bounds(&key(zoom, 5, 7));
        let right = tile_bounds(&key(zoom, 5, 8));
        let lat = (left.north + left.south) / 2;
        let a = MicroCoord::new(lat, (left.west + left.east) / 2);
        let b = MicroCoord::new(lat, (right.west + right.east) / 2);
        let shape = Shape::single(GeometryKind::Line, vec![a, b]);

        let assigned = grid(zoom).assign(&shape, 10, 16);
        let keys: Vec<TileKey> = assigned.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec![key(zoom, 5, 7), key(zoom, 5, 8)]);

        let boundary = MicroCoord::new(lat, left.east);
        assert_eq!(assigned[0].1.parts, vec![vec![a, boundary]]);
        assert_eq!(assigned[1].1.parts, vec![vec![boundary, b]]);
    }

    #[test]
    fn clipped_copies_cover_the_line() {
        let zoom = 9;
        let line = vec![
            MicroCoord::new(47_100_000, 11_000_000),
            MicroCoord::new(47_900_000, 12_300_000),
            MicroCoord::new(47_300_000, 13_100_000),
        ];
        let shape = Shape::single(GeometryKind::Line, line.clone());
        let assigned = grid(zoom).assign(&shape, 0, 21);
        assert!(assigned.len() > 2);

        // every clipped part stays in its tile, and the clipped lengths add up
        let length = |points: &[MicroCoord]| -> f64 {
            points
                .windows(2)
                .map(|w| {
                    let dx = f64::from(w[1].lon - w[0].lon);
                    let dy = f64::from(w[1].lat - w[0].lat);
                    (dx * dx + dy * dy).sqrt()
                })
                .sum()
        };
        let mut total = 0.0;
        for (k, clipped) in &assigned {
            let b = tile_bounds(k);
            for part in &clipped.parts {
                assert!(part
                    .iter()
                    .all(|p| b.west <= p.lon && p.lon <= b.east && b.south <= p.lat && p.lat <= b.north));
                total += length(part);
            }
        }
        let original = length(&line);
        assert!((total - original).abs() < 10.0, "{total} vs {original}");

        // original vertices all appear in some tile
        for vertex in &line {
            assert!(assigned.iter().any(|(_, s)| s.points().any(|p| p == vertex)));
        }
    }

    #[test]
    fn line_along_an_edge_belongs_to_one_side() {
        let zoom = 12;
        let left = tile_bounds(&key(zoom, 5, 7));
        let shape = Shape::single(
            GeometryKind::Line,
            vec![
                MicroCoord::new(left.south + 100, left.east),
                MicroCoord::new(left.north - 100, left.east),
            ],
        );
        let keys: Vec<TileKey> = grid(zoom).assign(&shape, 0, 21).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![key(zoom, 5, 7)]);
    }

    #[test]
    fn runs_along_a_shared_edge_stay_with_the_owner() {
        let zoom = 12;
        let g = grid(zoom);
        let left = tile_bounds(&key(zoom, 5, 7));
        let right = tile_bounds(&key(zoom, 5, 8));
        let parts_of = |assigned: &[(TileKey, Shape)], k: TileKey| -> Vec<Vec<MicroCoord>> {
            assigned.iter().find(|(tile, _)| *tile == k).unwrap().1.parts.clone()
        };

        // west from the middle of (5,8) to the column edge, then north along it
        let lat = (left.north + left.south) / 2;
        let inside = MicroCoord::new(lat, (right.west + right.east) / 2);
        let corner = MicroCoord::new(lat, left.east);
        let top = MicroCoord::new(left.north - 100, left.east);
        let assigned = g.assign(&Shape::single(GeometryKind::Line, vec![inside, corner, top]), 0, 21);
        assert_eq!(assigned.len(), 2);
        assert_eq!(parts_of(&assigned, key(zoom, 5, 7)), vec![vec![corner, top]]);
        assert_eq!(parts_of(&assigned, key(zoom, 5, 8)), vec![vec![inside, corner]]);

        // north from the middle of (6,7) to the row edge, then east along it
        let below = tile_bounds(&key(zoom, 6, 7));
        let lon = (left.west + left.east) / 2;
        let inside = MicroCoord::new((below.north + below.south) / 2, lon);
        let corner = MicroCoord::new(left.south, lon);
        let end = MicroCoord::new(left.south, left.east - 100);
        let assigned = g.assign(&Shape::single(GeometryKind::Line, vec![inside, corner, end]), 0, 21);
        assert_eq!(assigned.len(), 2);
        assert_eq!(parts_of(&assigned, key(zoom, 5, 7)), vec![vec![corner, end]]);
        assert_eq!(parts_of(&assigned, key(zoom, 6, 7)), vec![vec![inside, corner]]);
    }

    #[test]
    fn diagonal_segment_visits_only_crossed_tiles() {
        let zoom = 14;
        let start = tile_bounds(&key(zoom, 5750, 8700));
        let end = tile_bounds(&key(zoom, 5790, 8740));
        let a = MicroCoord::new((start.north + start.south) / 2, (start.west + start.east) / 2);
        let b = MicroCoord::new((end.north + end.south) / 2, (end.west + end.east) / 2);
        let shape = Shape::single(GeometryKind::Line, vec![a, b]);
        let envelope = shape.envelope().unwrap();
        let block = TileRange::of_box(zoom, &envelope);

        let candidates = candidate_tiles(&shape, &envelope, &block);
        assert!(candidates.len() < 200, "{} candidates", candidates.len());

        let hit: BTreeSet<TileKey> = block.keys().filter(|k| clip_shape(&shape, k).is_some()).collect();
        let assigned: BTreeSet<TileKey> = candidates.into_iter().filter(|k| clip_shape(&shape, k).is_some()).collect();
        assert_eq!(assigned, hit);
        assert!(hit.len() >= 41);
    }

    #[test]
    fn points_and_zoom_filter() {
        let zoom = 12;
        let left = tile_bounds(&key(zoom, 5, 7));
        let corner = MicroCoord::new(left.south, left.east);
        let shape = Shape::single(GeometryKind::Point, vec![corner]);
        let g = grid(zoom);
        let keys: Vec<TileKey> = g.assign(&shape, 0, 21).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![key(zoom, 5, 7)]);
        assert!(g.assign(&shape, 13, 21).is_empty());
        assert!(!g.covers(13, 21));
        assert!(g.covers(0, 12));
    }

    #[test]
    fn polygon_is_clipped_per_tile() {
        let zoom = 10;
        let b = tile_bounds(&key(zoom, 300, 500));
        let margin = 1000;
        let ring = vec![
            MicroCoord::new(b.south - margin, b.west - margin),
            MicroCoord::new(b.south - margin, b.east + margin),
            MicroCoord::new(b.north + margin, b.east + margin),
            MicroCoord::new(b.north + margin, b.west - margin),
            MicroCoord::new(b.south - margin, b.west - margin),
        ];
        let shape = Shape::single(GeometryKind::Polygon, ring);
        let assigned = grid(zoom).assign(&shape, 0, 21);
        assert_eq!(assigned.len(), 9);

        let center = assigned.iter().find(|(k, _)| *k == key(zoom, 300, 500)).unwrap();
        let clipped = &center.1.parts[0];
        assert_eq!(clipped.len(), 5);
        assert_eq!(clipped.first(), clipped.last());
        let mut corners = clipped[..4].to_vec();
        corners.sort();
        let mut expected = vec![
            MicroCoord::new(b.south, b.west),
            MicroCoord::new(b.south, b.east),
            MicroCoord::new(b.north, b.east),
            MicroCoord::new(b.north, b.west),
        ];
        expected.sort();
        assert_eq!(corners, expected);
    }

    #[test]
    fn shapes_outside_the_bbox_are_not_assigned() {
        let shape = Shape::single(GeometryKind::Point, vec![MicroCoord::new(89_000_000, 0)]);
        assert!(grid(5).assign(&shape, 0, 21).is_empty());
    }
}
