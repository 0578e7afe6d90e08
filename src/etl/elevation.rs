//! Elevation samples from SRTM `.hgt` tiles and the prominence masks derived
//! from them.
//!
//! A sample grid covers the bounding box rounded to whole samples, north row
//! first. Prominence is the topographic position index (TPI): how far a sample
//! rises above the mean of an elliptic window around it.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use rayon::prelude::*;

use crate::config::{BoundingBox, ElevationConfig};
use crate::errors::{Error, Result};

/// One-arc-second tiles, 3601 samples per side.
pub const SAMPLES_PER_DEGREE: u32 = 3600;

/// Places sample rows and columns on the globe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleFrame {
    pub samples_per_degree: u32,
    /// Latitude of row 0, in samples.
    pub north: i64,
    /// Longitude of column 0, in samples.
    pub west: i64,
}

impl SampleFrame {
    /// Latitude of the corner grid line `y`. Corner line 0 lies half a sample
    /// north of row 0.
    pub fn corner_latitude(&self, y: i64) -> f64 {
        (self.north as f64 + 0.5 - y as f64) / f64::from(self.samples_per_degree)
    }

    /// Longitude of the corner grid line `x`, half a sample west of column `x`.
    pub fn corner_longitude(&self, x: i64) -> f64 {
        (self.west as f64 - 0.5 + x as f64) / f64::from(self.samples_per_degree)
    }
}

#[derive(Debug, Clone)]
pub struct ElevationGrid {
    pub frame: SampleFrame,
    pub rows: usize,
    pub cols: usize,
    /// Meters, row major.
    data: Vec<i16>,
}

impl ElevationGrid {
    /// A zeroed grid covering `bbox` rounded to whole samples.
    fn covering(bbox: &BoundingBox, samples_per_degree: u32) -> Result<Self> {
        let scale = f64::from(samples_per_degree);
        let north = (bbox.max_lat * scale).round() as i64;
        let south = (bbox.min_lat * scale).round() as i64;
        let west = (bbox.min_lon * scale).round() as i64;
        let east = (bbox.max_lon * scale).round() as i64;
        if north <= south || east <= west {
            return Err(Error::config(format!("bounding box {bbox} is smaller than one elevation sample")));
        }
        let rows = (north - south + 1) as usize;
        let cols = (east - west + 1) as usize;
        Ok(ElevationGrid {
            frame: SampleFrame { samples_per_degree, north, west },
            rows,
            cols,
            data: vec![0; rows * cols],
        })
    }

    /// Reads every one-arc-second tile the bounding box touches from `tiles_dir`.
    pub fn read_tiles(tiles_dir: &Path, bbox: &BoundingBox) -> Result<Self> {
        Self::read_tiles_at(tiles_dir, bbox, SAMPLES_PER_DEGREE)
    }

    fn read_tiles_at(tiles_dir: &Path, bbox: &BoundingBox, samples_per_degree: u32) -> Result<Self> {
        let mut grid = Self::covering(bbox, samples_per_degree)?;
        let spd = i64::from(samples_per_degree);
        let south = grid.frame.north - grid.rows as i64 + 1;
        let east = grid.frame.west + grid.cols as i64 - 1;
        let lats = south.div_euclid(spd)..=(grid.frame.north + spd - 1).div_euclid(spd) - 1;
        let lons = grid.frame.west.div_euclid(spd)..=(east + spd - 1).div_euclid(spd) - 1;
        for lat in lats {
            for lon in lons.clone() {
                grid.load_tile(&tile_path(tiles_dir, lat, lon), lat, lon)?;
            }
        }
        info!(rows = grid.rows, cols = grid.cols; "Elevation data loaded");
        Ok(grid)
    }

    fn load_tile(&mut self, path: &Path, lat: i64, lon: i64) -> Result<()> {
        debug!(path = path.display().to_string(); "Reading elevation tile");
        let bytes = fs::read(path).map_err(|err| Error::from(err).context(path.display()))?;
        let side = self.frame.samples_per_degree as usize + 1;
        if bytes.len() != side * side * 2 {
            return Err(Error::input(format!(
                "{}: expected {} bytes for {} samples per degree, found {}",
                path.display(),
                side * side * 2,
                self.frame.samples_per_degree,
                bytes.len()
            )));
        }
        let spd = i64::from(self.frame.samples_per_degree);
        let first_row = self.frame.north - (lat + 1) * spd;
        let first_col = lon * spd - self.frame.west;
        let cols = first_col.max(0)..(first_col + side as i64).min(self.cols as i64);
        for tile_row in 0..side {
            let row = first_row + tile_row as i64;
            if row < 0 || row >= self.rows as i64 {
                continue;
            }
            for col in cols.clone() {
                let offset = (tile_row * side + (col - first_col) as usize) * 2;
                self.data[row as usize * self.cols + col as usize] =
                    i16::from_be_bytes([bytes[offset], bytes[offset + 1]]);
            }
        }
        Ok(())
    }

    pub fn get(&self, row: usize, col: usize) -> i16 {
        self.data[row * self.cols + col]
    }

    /// Latitude of the southern row, in degrees.
    pub fn min_latitude(&self) -> f64 {
        (self.frame.north - self.rows as i64 + 1) as f64 / f64::from(self.frame.samples_per_degree)
    }
}

/// `N47E012.hgt` names the tile whose south-west corner is at 47°N 12°E.
pub fn tile_name(lat: i64, lon: i64) -> String {
    format!(
        "{}{:02}{}{:03}.hgt",
        if lat >= 0 { 'N' } else { 'S' },
        lat.abs(),
        if lon >= 0 { 'E' } else { 'W' },
        lon.abs()
    )
}

pub fn tile_path(tiles_dir: &Path, lat: i64, lon: i64) -> PathBuf {
    tiles_dir.join(tile_name(lat, lon))
}

/// A boolean raster over the sample grid.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mask {
    pub rows: usize,
    pub cols: usize,
    cells: Vec<bool>,
}

impl Mask {
    /// Builds a mask from rows of `#` (set) and `.` (clear).
    #[cfg(test)]
    pub(crate) fn from_rows(rows: &[&str]) -> Self {
        let cols = rows.first().map_or(0, |row| row.len());
        let cells = rows.iter().flat_map(|row| row.bytes().map(|b| b == b'#')).collect();
        Mask { rows: rows.len(), cols, cells }
    }

    /// Cells outside the grid read as clear.
    pub fn get(&self, row: i64, col: i64) -> bool {
        if row < 0 || col < 0 || row >= self.rows as i64 || col >= self.cols as i64 {
            return false;
        }
        self.cells[row as usize * self.cols + col as usize]
    }

    pub fn flip(&mut self, row: usize, col: usize) {
        let cell = &mut self.cells[row * self.cols + col];
        *cell = !*cell;
    }

    /// Index of the first set cell at or after `from`, in row-major order.
    pub fn next_set(&self, from: usize) -> Option<usize> {
        self.cells.get(from..)?.iter().position(|&cell| cell).map(|at| from + at)
    }

    pub fn count(&self) -> usize {
        self.cells.iter().filter(|&&cell| cell).count()
    }
}

/// Rows of the elliptic window: the half width of each row and the number of
/// samples inside.
#[derive(Debug)]
struct Window {
    ry: usize,
    rx: usize,
    half_widths: Vec<Option<usize>>,
    count: usize,
}

impl Window {
    /// `radius` is in latitude samples. The longitude radius is stretched by the
    /// latitude so the window stays round on the ground.
    fn ellipse(radius: f64, min_lat: f64) -> Window {
        let radius_lon = radius / min_lat.to_radians().cos();
        let ry = radius.round() as i64;
        let rx = radius_lon.round() as i64;
        let mut half_widths = Vec::with_capacity((2 * ry + 1) as usize);
        let mut count = 0;
        for dy in -ry..=ry {
            let ny = dy as f64 / radius;
            let mut right = None;
            for dx in -rx..=rx {
                let nx = dx as f64 / radius_lon;
                if nx * nx + ny * ny <= 1.0 {
                    count += 1;
                    if dx >= 0 {
                        right = Some(dx as usize);
                    }
                }
            }
            half_widths.push(right);
        }
        Window {
            ry: ry as usize,
            rx: rx as usize,
            half_widths,
            count,
        }
    }
}

/// Positive TPI per sample for one window radius. Samples closer than the
/// radius to the grid edge, and samples above `mountain_cutoff` meters, get 0.
pub fn tpi(grid: &ElevationGrid, radius: f64, mountain_cutoff: f64) -> Result<Vec<f32>> {
    let window = Window::ellipse(radius, grid.min_latitude());
    let (rows, cols) = (grid.rows, grid.cols);
    if rows < 2 * window.ry + 1 || cols < 2 * window.rx + 1 {
        return Err(Error::config(format!(
            "bounding box of {rows}x{cols} samples is too small for a TPI radius of {radius}"
        )));
    }

    let width = cols + 1;
    let mut prefix = vec![0i32; rows * width];
    prefix
        .par_chunks_mut(width)
        .zip(grid.data.par_chunks(cols))
        .for_each(|(sums, row)| {
            let mut total = 0i32;
            for (x, &value) in row.iter().enumerate() {
                total += i32::from(value);
                sums[x + 1] = total;
            }
        });

    let mut values = vec![0f32; rows * cols];
    values.par_chunks_mut(cols).enumerate().for_each(|(y, out)| {
        if y < window.ry || y + window.ry >= rows {
            return;
        }
        for x in window.rx..cols - window.rx {
            let mut sum = 0i64;
            for (d, half) in window.half_widths.iter().enumerate() {
                let Some(half) = *half else { continue };
                let sums = &prefix[(y + d - window.ry) * width..][..width];
                sum += i64::from(sums[x + half + 1] - sums[x - half]);
            }
            let elevation = f64::from(grid.get(y, x));
            let value = elevation - sum as f64 / window.count as f64;
            if elevation <= mountain_cutoff && value > 0.0 {
                out[x] = value as f32;
            }
        }
    });
    Ok(values)
}

/// One mask per cutoff: samples whose combined small and large radius TPI
/// exceeds the cutoff.
pub fn prominence_masks(grid: &ElevationGrid, config: &ElevationConfig) -> Result<Vec<Mask>> {
    let small = tpi(grid, config.radius_small, config.mountain_cutoff)?;
    let large = tpi(grid, config.radius_large, config.mountain_cutoff)?;
    let combined: Vec<f32> = small
        .par_iter()
        .zip(large.par_iter())
        .map(|(s, l)| (s * s + l * l).sqrt())
        .collect();
    drop((small, large));

    let masks: Vec<Mask> = config
        .tpi_cutoffs
        .iter()
        .map(|&cutoff| Mask {
            rows: grid.rows,
            cols: grid.cols,
            cells: combined.par_iter().map(|&value| f64::from(value) > cutoff).collect(),
        })
        .collect();
    for (level, mask) in masks.iter().enumerate() {
        debug!(level = level + 1, cells = mask.count(); "Prominence mask ready");
    }
    Ok(masks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> SampleFrame {
        SampleFrame {
            samples_per_degree: SAMPLES_PER_DEGREE,
            north: 100,
            west: 0,
        }
    }

    /// Flat ground at 500m with a 3x3 square at the centre raised by `height`.
    fn plateau(size: usize, height: i16) -> ElevationGrid {
        let mut data = vec![500i16; size * size];
        let centre = size / 2;
        for y in centre - 1..=centre + 1 {
            for x in centre - 1..=centre + 1 {
                data[y * size + x] = 500 + height;
            }
        }
        ElevationGrid { frame: frame(), rows: size, cols: size, data }
    }

    fn write_tile(dir: &Path, lat: i64, lon: i64, side: usize, value: impl Fn(usize, usize) -> i16) {
        let mut bytes = Vec::with_capacity(side * side * 2);
        for row in 0..side {
            for col in 0..side {
                bytes.extend_from_slice(&value(row, col).to_be_bytes());
            }
        }
        fs::write(tile_path(dir, lat, lon), bytes).unwrap();
    }

    #[test]
    fn names_tiles_by_south_west_corner() {
        assert_eq!(tile_name(47, 12), "N47E012.hgt");
        assert_eq!(tile_name(-1, -75), "S01W075.hgt");
        assert_eq!(tile_name(0, 0), "N00E000.hgt");
    }

    #[test]
    fn reads_tiles_into_the_rounded_box() {
        let dir = tempfile::tempdir().unwrap();
        // 10 samples per degree, value encodes the position inside the tile
        write_tile(dir.path(), 47, 12, 11, |row, col| (row * 100 + col) as i16);
        write_tile(dir.path(), 47, 13, 11, |row, col| -((row * 100 + col) as i16));

        let bbox = BoundingBox::new(47.2, 12.5, 47.81, 13.3).unwrap();
        let grid = ElevationGrid::read_tiles_at(dir.path(), &bbox, 10).unwrap();
        assert_eq!(grid.frame.north, 478);
        assert_eq!(grid.frame.west, 125);
        assert_eq!((grid.rows, grid.cols), (7, 9));
        // row 0 is 47.8N, which is tile row 2; column 0 is 12.5E, tile column 5
        assert_eq!(grid.get(0, 0), 205);
        assert_eq!(grid.get(6, 4), 809);
        // 13.0E is shared by both tiles, the eastern tile is read last
        assert_eq!(grid.get(0, 5), -200);
        assert_eq!(grid.get(0, 8), -203);
        assert!((grid.min_latitude() - 47.2).abs() < 1e-9);
    }

    #[test]
    fn missing_or_truncated_tiles_fail() {
        let dir = tempfile::tempdir().unwrap();
        let bbox = BoundingBox::new(47.2, 12.5, 47.8, 12.9).unwrap();
        let err = ElevationGrid::read_tiles_at(dir.path(), &bbox, 10).unwrap_err();
        assert_eq!(err.kind, crate::errors::ErrorKind::IoFailure);
        assert!(err.message.contains("N47E012.hgt"));

        fs::write(tile_path(dir.path(), 47, 12), [0u8; 10]).unwrap();
        let err = ElevationGrid::read_tiles_at(dir.path(), &bbox, 10).unwrap_err();
        assert_eq!(err.kind, crate::errors::ErrorKind::InvalidInput);
    }

    #[test]
    fn window_covers_the_ellipse() {
        let window = Window::ellipse(1.0, 0.0);
        assert_eq!((window.ry, window.rx), (1, 1));
        assert_eq!(window.half_widths, vec![Some(0), Some(1), Some(0)]);
        assert_eq!(window.count, 5);

        // a degree of longitude shrinks with latitude, so the window widens
        let window = Window::ellipse(3.0, 45.0);
        assert_eq!((window.ry, window.rx), (3, 4));
        assert_eq!(window.half_widths[0], Some(0));
        assert_eq!(window.half_widths[3], Some(4));
    }

    #[test]
    fn plateau_stands_out_of_flat_ground() {
        let grid = plateau(21, 90);
        let values = tpi(&grid, 2.0, 1000.0).unwrap();
        let at = |y: usize, x: usize| values[y * 21 + x];
        // 9 of the 13 window samples around the centre are raised
        assert!((at(10, 10) - (90.0 - 9.0 * 90.0 / 13.0)).abs() < 1e-3);
        assert_eq!(at(0, 0), 0.0);
        assert_eq!(at(3, 3), 0.0);
        // next to the plateau the ground sits below its window mean
        assert_eq!(at(10, 12), 0.0);
    }

    #[test]
    fn mountains_above_the_cutoff_are_ignored() {
        let grid = plateau(21, 900);
        let values = tpi(&grid, 2.0, 1000.0).unwrap();
        assert!(values.iter().all(|&value| value == 0.0));
    }

    #[test]
    fn masks_follow_the_cutoffs() {
        let grid = plateau(41, 200);
        let mut config = ElevationConfig::new("tiles");
        config.radius_small = 2.0;
        config.radius_large = 5.0;
        config.tpi_cutoffs = vec![10.0, 100.0, 10_000.0];
        let masks = prominence_masks(&grid, &config).unwrap();
        assert_eq!(masks.len(), 3);
        assert!(masks[0].get(20, 20));
        assert!(masks[1].get(20, 20));
        assert!(masks[0].count() >= masks[1].count());
        assert_eq!(masks[2].count(), 0);
        assert!(!masks[0].get(0, 0));
    }

    #[test]
    fn small_boxes_are_rejected() {
        let grid = plateau(5, 10);
        let err = tpi(&grid, 15.0, 1000.0).unwrap_err();
        assert_eq!(err.kind, crate::errors::ErrorKind::InvalidConfig);
    }

    #[test]
    fn masks_parse_and_scan() {
        let mut mask = Mask::from_rows(&["..#", "#..", "..."]);
        assert_eq!((mask.rows, mask.cols), (3, 3));
        assert_eq!(mask.next_set(0), Some(2));
        assert_eq!(mask.next_set(3), Some(3));
        mask.flip(1, 0);
        mask.flip(0, 2);
        assert_eq!(mask.next_set(0), None);
        assert!(!mask.get(-1, 0));
        assert!(!mask.get(0, 3));
    }
}
