//! Traces prominence masks into `liftyline=<level>` polygons.
//!
//! Outlines run along sample corners with the area on the left. Diagonal
//! neighbours belong to the same outline. Once traced, the cells inside an
//! outline are flipped, so holes come back later as polygons of their own.

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use geo::{Coord, LineString, Polygon};
use log::{debug, info};
use quick_xml::escape::escape;

use crate::config::{BoundingBox, ElevationConfig};
use crate::data::feature::{Feature, FeatureId};
use crate::errors::{Error, Result};
use crate::etl::elevation::{prominence_masks, ElevationGrid, Mask, SampleFrame};

pub const LIFTY_KEY: &str = "liftyline";

/// Traced features are numbered from here, clear of OSM ids.
pub const FEATURE_ID_BASE: FeatureId = 1 << 48;

/// (row, col) on the grid of sample corners.
type Vertex = (i64, i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Heading {
    Up,
    Right,
    Down,
    Left,
}

impl Heading {
    fn advance(self, (row, col): Vertex) -> Vertex {
        match self {
            Heading::Up => (row - 1, col),
            Heading::Right => (row, col + 1),
            Heading::Down => (row + 1, col),
            Heading::Left => (row, col - 1),
        }
    }

    fn right(self) -> Heading {
        match self {
            Heading::Up => Heading::Right,
            Heading::Right => Heading::Down,
            Heading::Down => Heading::Left,
            Heading::Left => Heading::Up,
        }
    }

    fn left(self) -> Heading {
        match self {
            Heading::Up => Heading::Left,
            Heading::Right => Heading::Up,
            Heading::Down => Heading::Right,
            Heading::Left => Heading::Down,
        }
    }

    /// The cells ahead of corner `at`, on the left and on the right.
    fn cells_ahead(self, (row, col): Vertex) -> (Vertex, Vertex) {
        let (north_west, north_east) = ((row - 1, col - 1), (row - 1, col));
        let (south_west, south_east) = ((row, col - 1), (row, col));
        match self {
            Heading::Up => (north_west, north_east),
            Heading::Right => (north_east, south_east),
            Heading::Down => (south_east, south_west),
            Heading::Left => (south_west, north_west),
        }
    }
}

/// Walks the outline of the area whose first cell in row-major order is
/// `(row, col)`. Returns the corners visited, without repeating the first.
fn trace_outline(mask: &Mask, row: i64, col: i64) -> Vec<Vertex> {
    let start = (row, col + 1);
    let mut heading = Heading::Left;
    let mut at = heading.advance(start);
    let mut outline = vec![start];
    while at != start {
        outline.push(at);
        let (left, right) = heading.cells_ahead(at);
        heading = if mask.get(right.0, right.1) {
            heading.right()
        } else if mask.get(left.0, left.1) {
            heading
        } else {
            heading.left()
        };
        at = heading.advance(at);
    }
    outline
}

/// Flips every cell inside `outline`, row by row between pairs of vertical
/// edges. Clears the traced area and sets the cells of its holes.
fn flip_inside(mask: &mut Mask, outline: &[Vertex]) {
    let mut crossings: Vec<Vertex> = outline
        .iter()
        .zip(outline.iter().cycle().skip(1))
        .filter(|(a, b)| a.1 == b.1)
        .map(|(a, b)| (a.0.min(b.0), a.1))
        .collect();
    crossings.sort_unstable();
    for pair in crossings.chunks_exact(2) {
        let (row, from) = pair[0];
        for col in from..pair[1].1 {
            mask.flip(row as usize, col as usize);
        }
    }
}

/// Twice the signed area, negative for outlines with the area on the left.
fn area2(ring: &[Vertex]) -> i64 {
    ring.iter()
        .zip(ring.iter().cycle().skip(1))
        .map(|(a, b)| a.1 * b.0 - b.1 * a.0)
        .sum()
}

/// Splits an outline at corners it passes twice, where areas touch
/// diagonally, and keeps the loops around set cells.
fn split_loops(outline: &[Vertex]) -> Vec<Vec<Vertex>> {
    let mut loops = Vec::new();
    let mut path: Vec<Vertex> = Vec::with_capacity(outline.len());
    let mut seen: HashMap<Vertex, usize> = HashMap::new();
    for &vertex in outline.iter().chain(outline.first()) {
        match seen.get(&vertex) {
            Some(&at) => {
                let closed = path.split_off(at);
                for dropped in &closed[1..] {
                    seen.remove(dropped);
                }
                path.push(vertex);
                if area2(&closed) < 0 {
                    loops.push(closed);
                } else {
                    debug!(corners = closed.len(); "Skipping hole loop");
                }
            }
            None => {
                seen.insert(vertex, path.len());
                path.push(vertex);
            }
        }
    }
    loops
}

/// Compass direction from `a` to `b` in eighths, 0 is north, clockwise.
fn direction(a: Vertex, b: Vertex) -> u8 {
    match ((b.0 - a.0).signum(), (b.1 - a.1).signum()) {
        (-1, 0) => 0,
        (-1, 1) => 1,
        (0, 1) => 2,
        (1, 1) => 3,
        (1, 0) => 4,
        (1, -1) => 5,
        (0, -1) => 6,
        _ => 7,
    }
}

fn turns_right(from: u8, to: u8) -> bool {
    (to + 8 - from) % 8 == 2
}

/// Cuts single inner corners into 45° edges, then drops corners between
/// edges running the same way.
fn smooth(mut ring: Vec<Vertex>) -> Vec<Vertex> {
    let heading = |ring: &[Vertex], edge: usize| direction(ring[edge], ring[(edge + 1) % ring.len()]);
    let mut edge = 0;
    while edge < ring.len() && ring.len() > 4 {
        let n = ring.len();
        let (before, previous) = (heading(&ring, (edge + n - 2) % n), heading(&ring, (edge + n - 1) % n));
        let (current, next) = (heading(&ring, edge), heading(&ring, (edge + 1) % n));
        if turns_right(previous, current) && !turns_right(before, previous) && !turns_right(current, next) {
            ring.remove(edge);
        } else {
            edge += 1;
        }
    }

    let n = ring.len();
    (0..n)
        .filter(|&i| heading(&ring, (i + n - 1) % n) != heading(&ring, i))
        .map(|i| ring[i])
        .collect()
}

/// Streams the traced polygons of every mask as features, lowest level first.
pub struct LiftyAreas {
    frame: SampleFrame,
    masks: Vec<Mask>,
    level: usize,
    /// Every cell of the current mask before this one is clear.
    cursor: usize,
    pending: VecDeque<Vec<Vertex>>,
    next_id: FeatureId,
}

impl LiftyAreas {
    pub fn new(frame: SampleFrame, masks: Vec<Mask>) -> Self {
        LiftyAreas {
            frame,
            masks,
            level: 0,
            cursor: 0,
            pending: VecDeque::new(),
            next_id: FEATURE_ID_BASE,
        }
    }

    /// Reads the elevation tiles for `bbox` and derives one mask per cutoff.
    pub fn from_tiles(config: &ElevationConfig, bbox: &BoundingBox) -> Result<Self> {
        let grid = ElevationGrid::read_tiles(&config.tiles_dir, bbox)?;
        let masks = prominence_masks(&grid, config)?;
        info!(levels = masks.len(), rows = grid.rows, cols = grid.cols; "Prominence masks calculated");
        Ok(LiftyAreas::new(grid.frame, masks))
    }

    fn feature(&mut self, ring: &[Vertex]) -> Feature {
        let mut coords: Vec<Coord<f64>> = ring
            .iter()
            .map(|&(row, col)| Coord {
                x: self.frame.corner_longitude(col),
                y: self.frame.corner_latitude(row),
            })
            .collect();
        if let Some(first) = coords.first().copied() {
            coords.push(first);
        }
        let id = self.next_id;
        self.next_id += 1;
        Feature::new(
            id,
            Polygon::new(LineString::new(coords), vec![]),
            vec![(LIFTY_KEY.to_string(), (self.level + 1).to_string())],
        )
    }
}

impl Iterator for LiftyAreas {
    type Item = Result<Feature>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(ring) = self.pending.pop_front() {
                return Some(Ok(self.feature(&ring)));
            }
            let mask = self.masks.get_mut(self.level)?;
            match mask.next_set(self.cursor) {
                Some(index) => {
                    self.cursor = index;
                    let (row, col) = ((index / mask.cols) as i64, (index % mask.cols) as i64);
                    let outline = trace_outline(mask, row, col);
                    flip_inside(mask, &outline);
                    self.pending.extend(split_loops(&outline).into_iter().map(smooth));
                }
                None => {
                    debug!(level = self.level + 1, traced = self.next_id - FEATURE_ID_BASE; "Mask traced");
                    self.masks[self.level] = Mask::default();
                    self.level += 1;
                    self.cursor = 0;
                }
            }
        }
    }
}

/// Writes polygon features as closed OSM ways tagged `area=yes`, so the
/// traced areas can be inspected or fed to other OSM tools. Returns the
/// number of ways written.
pub fn write_osm<I>(path: &Path, bbox: &BoundingBox, features: I) -> Result<u64>
where
    I: Iterator<Item = Result<Feature>>,
{
    let file = File::create(path).map_err(|err| Error::from(err).context(path.display()))?;
    let mut out = BufWriter::new(file);
    writeln!(out, "<?xml version=\"1.0\" encoding=\"UTF-8\"?>")?;
    writeln!(out, "<osm version=\"0.6\" generator=\"liftylines\">")?;
    writeln!(
        out,
        "  <bounds minlat=\"{}\" minlon=\"{}\" maxlat=\"{}\" maxlon=\"{}\"/>",
        bbox.min_lat, bbox.min_lon, bbox.max_lat, bbox.max_lon
    )?;

    let mut next_node = FEATURE_ID_BASE;
    let mut ways = 0u64;
    for feature in features {
        let feature = feature?;
        let geo::Geometry::Polygon(polygon) = &feature.geometry else {
            debug!(feature_id = feature.id; "Skipping non-polygon feature");
            continue;
        };
        let ring = &polygon.exterior().0;
        let corners = &ring[..ring.len().saturating_sub(1)];
        let first_node = next_node;
        for coord in corners {
            writeln!(out, "  <node id=\"{next_node}\" lat=\"{:.6}\" lon=\"{:.6}\"/>", coord.y, coord.x)?;
            next_node += 1;
        }
        writeln!(out, "  <way id=\"{}\">", feature.id)?;
        for node in (first_node..next_node).chain(std::iter::once(first_node)) {
            writeln!(out, "    <nd ref=\"{node}\"/>")?;
        }
        for (key, value) in &feature.tags {
            writeln!(out, "    <tag k=\"{}\" v=\"{}\"/>", escape(key), escape(value))?;
        }
        writeln!(out, "    <tag k=\"area\" v=\"yes\"/>")?;
        writeln!(out, "  </way>")?;
        ways += 1;
    }
    writeln!(out, "</osm>")?;
    out.flush()?;
    info!(path = path.display().to_string(), ways = ways; "Wrote OSM file");
    Ok(ways)
}
