use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::data::{MicroBox, MicroCoord};
use crate::errors::{Error, Result};
use crate::etl::tile_grid::MAX_ZOOM;

pub const DEFAULT_BBOX: &str = "47,12,48,13";
pub const DEFAULT_ZOOM_INTERVALS: &str = "5,0,7,10,8,10,11,11,21";
pub const DEFAULT_TAG_MAPPING: &str = "resources/lifty-tag-mapping.xml";
pub const DEFAULT_PRECISION: u8 = 6;
pub const DEFAULT_BATCH_SIZE: usize = 50_000;
pub const DEFAULT_SHARDS: usize = 16;
pub const DEFAULT_TPI_CUTOFFS: &str = "10,15,20";
pub const DEFAULT_RADIUS_SMALL: f64 = 5.0;
pub const DEFAULT_RADIUS_LARGE: f64 = 15.0;
pub const DEFAULT_MOUNTAIN_CUTOFF: f64 = 1000.0;
/// Bounding boxes above this many square degrees take long to read and need a lot of memory.
pub const HUGE_BBOX_DIMENSION: f64 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub min_lon: f64,
    pub max_lat: f64,
    pub max_lon: f64,
}

impl BoundingBox {
    pub fn new(min_lat: f64, min_lon: f64, max_lat: f64, max_lon: f64) -> Result<Self> {
        let values = [min_lat, min_lon, max_lat, max_lon];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(Error::config("bounding box contains a non-finite value"));
        }
        if !(-90.0..=90.0).contains(&min_lat) || !(-90.0..=90.0).contains(&max_lat) {
            return Err(Error::config("latitude out of [-90,90]"));
        }
        if !(-180.0..=180.0).contains(&min_lon) || !(-180.0..=180.0).contains(&max_lon) {
            return Err(Error::config("longitude out of [-180,180]"));
        }
        if min_lat >= max_lat {
            return Err(Error::config("minLat >= maxLat"));
        }
        if min_lon >= max_lon {
            return Err(Error::config("minLon >= maxLon"));
        }
        Ok(BoundingBox { min_lat, min_lon, max_lat, max_lon })
    }

    /// Parses `minLat,minLon,maxLat,maxLon`.
    pub fn parse(text: &str) -> Result<Self> {
        let values = text
            .split(',')
            .map(|part| part.trim().parse::<f64>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|err| Error::config(format!("invalid bounding box {text:?}: {err}")))?;
        if values.len() != 4 {
            return Err(Error::config(format!(
                "invalid bounding box {text:?}: you must provide 4 values minLat,minLon,maxLat,maxLon"
            )));
        }
        BoundingBox::new(values[0], values[1], values[2], values[3])
    }

    pub fn to_micro(&self) -> MicroBox {
        let south_west = MicroCoord::from_degrees(self.min_lat, self.min_lon);
        let north_east = MicroCoord::from_degrees(self.max_lat, self.max_lon);
        MicroBox {
            south: south_west.lat,
            west: south_west.lon,
            north: north_east.lat,
            east: north_east.lon,
        }
    }

    pub fn dimension(&self) -> f64 {
        (self.max_lat - self.min_lat) * (self.max_lon - self.min_lon)
    }
}

impl std::fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{},{},{}", self.min_lat, self.min_lon, self.max_lat, self.max_lon)
    }
}

/// Tiles are cut at `base` zoom and serve renderers from `min` to `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoomInterval {
    pub base: u8,
    pub min: u8,
    pub max: u8,
}

impl ZoomInterval {
    pub fn new(base: u8, min: u8, max: u8) -> Result<Self> {
        if max > MAX_ZOOM {
            return Err(Error::config(format!("zoom level {max} exceeds {MAX_ZOOM}")));
        }
        if !(min <= base && base <= max) {
            return Err(Error::config(format!(
                "zoom interval {base},{min},{max} needs min <= base <= max"
            )));
        }
        Ok(ZoomInterval { base, min, max })
    }

    /// Parses `base,min,max[,base,min,max...]`. Intervals must be ascending and
    /// must not overlap.
    pub fn parse_list(text: &str) -> Result<Vec<ZoomInterval>> {
        let values = text
            .split(',')
            .map(|part| part.trim().parse::<u8>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|err| Error::config(format!("invalid zoom intervals {text:?}: {err}")))?;
        if values.is_empty() || values.len() % 3 != 0 {
            return Err(Error::config(format!(
                "invalid zoom intervals {text:?}: expected triples of base,min,max"
            )));
        }
        let intervals = values
            .chunks(3)
            .map(|chunk| ZoomInterval::new(chunk[0], chunk[1], chunk[2]))
            .collect::<Result<Vec<_>>>()?;
        validate_intervals(&intervals)?;
        Ok(intervals)
    }

    /// True if features visible from `zoom_min` to `zoom_max` show up in this interval.
    pub fn overlaps(&self, zoom_min: u8, zoom_max: u8) -> bool {
        zoom_min <= self.max && self.min <= zoom_max
    }
}

pub fn format_intervals(intervals: &[ZoomInterval]) -> String {
    intervals
        .iter()
        .map(|i| format!("{},{},{}", i.base, i.min, i.max))
        .collect::<Vec<_>>()
        .join(",")
}

fn validate_intervals(intervals: &[ZoomInterval]) -> Result<()> {
    if intervals.is_empty() {
        return Err(Error::config("at least one zoom interval is required"));
    }
    for pair in intervals.windows(2) {
        if pair[1].min <= pair[0].max {
            return Err(Error::config(format!(
                "zoom intervals {},{},{} and {},{},{} overlap or are not ascending",
                pair[0].base, pair[0].min, pair[0].max, pair[1].base, pair[1].min, pair[1].max
            )));
        }
    }
    Ok(())
}

/// Validated settings for one map build.
#[derive(Debug, Clone, PartialEq)]
pub struct MapConfig {
    pub bbox: BoundingBox,
    pub zoom_intervals: Vec<ZoomInterval>,
    /// Douglas-Peucker tolerance in degrees, 0 disables simplification.
    pub simplification_tolerance: f64,
    /// Decimal digits kept from every coordinate, at most 6.
    pub precision: u8,
    /// Features processed between two flush checks.
    pub batch_size: usize,
    /// Input arrives in non-increasing order of the features' northern edge.
    pub input_sorted: bool,
    pub output: PathBuf,
    pub tag_mapping: PathBuf,
    pub shards: usize,
    pub progress: bool,
    /// Fixed creation timestamp in unix milliseconds, for reproducible output.
    pub created_ms: Option<i64>,
}

impl MapConfig {
    pub fn new(bbox: BoundingBox, zoom_intervals: Vec<ZoomInterval>, output: impl Into<PathBuf>) -> Self {
        MapConfig {
            bbox,
            zoom_intervals,
            simplification_tolerance: 0.0,
            precision: DEFAULT_PRECISION,
            batch_size: DEFAULT_BATCH_SIZE,
            input_sorted: false,
            output: output.into(),
            tag_mapping: PathBuf::from(DEFAULT_TAG_MAPPING),
            shards: DEFAULT_SHARDS,
            progress: false,
            created_ms: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        BoundingBox::new(self.bbox.min_lat, self.bbox.min_lon, self.bbox.max_lat, self.bbox.max_lon)?;
        for interval in &self.zoom_intervals {
            ZoomInterval::new(interval.base, interval.min, interval.max)?;
        }
        validate_intervals(&self.zoom_intervals)?;
        if !self.simplification_tolerance.is_finite() || self.simplification_tolerance < 0.0 {
            return Err(Error::config("simplification tolerance must be a non-negative number"));
        }
        if self.precision > DEFAULT_PRECISION {
            return Err(Error::config(format!("precision must be at most {DEFAULT_PRECISION} digits")));
        }
        if self.batch_size == 0 {
            return Err(Error::config("batch size must be positive"));
        }
        if self.shards == 0 {
            return Err(Error::config("shard count must be positive"));
        }
        if self.output.file_name().is_none() {
            return Err(Error::config(format!("output path {} has no file name", self.output.display())));
        }
        Ok(())
    }

    /// Directory receiving the output file, also used for staging.
    pub fn output_dir(&self) -> PathBuf {
        match self.output.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}

/// Settings for deriving `liftyline` areas from elevation tiles.
#[derive(Debug, Clone, PartialEq)]
pub struct ElevationConfig {
    /// Directory holding the `.hgt` tiles.
    pub tiles_dir: PathBuf,
    /// One area level per cutoff, in meters of combined TPI.
    pub tpi_cutoffs: Vec<f64>,
    /// Window radii in arc seconds of latitude.
    pub radius_small: f64,
    pub radius_large: f64,
    /// Samples higher than this many meters never count as prominent.
    pub mountain_cutoff: f64,
    /// Also writes the traced areas here as OSM XML, and reads them back from it.
    pub osm_output: Option<PathBuf>,
}

impl ElevationConfig {
    pub fn new(tiles_dir: impl Into<PathBuf>) -> Self {
        ElevationConfig {
            tiles_dir: tiles_dir.into(),
            tpi_cutoffs: vec![10.0, 15.0, 20.0],
            radius_small: DEFAULT_RADIUS_SMALL,
            radius_large: DEFAULT_RADIUS_LARGE,
            mountain_cutoff: DEFAULT_MOUNTAIN_CUTOFF,
            osm_output: None,
        }
    }

    /// Parses comma separated cutoffs.
    pub fn parse_cutoffs(text: &str) -> Result<Vec<f64>> {
        text.split(',')
            .map(|part| part.trim().parse::<f64>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|err| Error::config(format!("invalid TPI cutoffs {text:?}: {err}")))
    }

    pub fn validate(&self) -> Result<()> {
        if self.tpi_cutoffs.is_empty() {
            return Err(Error::config("at least one TPI cutoff is required"));
        }
        if self.tpi_cutoffs.iter().any(|cutoff| !cutoff.is_finite() || *cutoff < 0.0) {
            return Err(Error::config("TPI cutoffs must be non-negative numbers"));
        }
        for radius in [self.radius_small, self.radius_large] {
            if !radius.is_finite() || radius < 0.5 {
                return Err(Error::config(format!("TPI radius {radius} must be at least half an arc second")));
            }
        }
        if !self.mountain_cutoff.is_finite() {
            return Err(Error::config("mountain cutoff must be a number"));
        }
        Ok(())
    }
}

/// Settings as read from a JSON config file or the command line. Every field is
/// optional; later sources override earlier ones field by field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct UserConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub map_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bbox: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zoom_intervals: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub simplification: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub precision: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_sorted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag_mapping: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shards: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hgt_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tpi_cutoffs: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub radius_small: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub radius_large: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mountain_cutoff: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub write_osm: Option<bool>,
}

impl UserConfig {
    /// Fields set in `other` win.
    pub fn merge(self, other: UserConfig) -> UserConfig {
        UserConfig {
            data_path: other.data_path.or(self.data_path),
            working_dir: other.working_dir.or(self.working_dir),
            map_name: other.map_name.or(self.map_name),
            bbox: other.bbox.or(self.bbox),
            zoom_intervals: other.zoom_intervals.or(self.zoom_intervals),
            simplification: other.simplification.or(self.simplification),
            precision: other.precision.or(self.precision),
            batch_size: other.batch_size.or(self.batch_size),
            input_sorted: other.input_sorted.or(self.input_sorted),
            tag_mapping: other.tag_mapping.or(self.tag_mapping),
            shards: other.shards.or(self.shards),
            timestamp: other.timestamp.or(self.timestamp),
            hgt_dir: other.hgt_dir.or(self.hgt_dir),
            tpi_cutoffs: other.tpi_cutoffs.or(self.tpi_cutoffs),
            radius_small: other.radius_small.or(self.radius_small),
            radius_large: other.radius_large.or(self.radius_large),
            mountain_cutoff: other.mountain_cutoff.or(self.mountain_cutoff),
            write_osm: other.write_osm.or(self.write_osm),
        }
    }

    pub fn working_dir(&self) -> PathBuf {
        self.working_dir.clone().unwrap_or_else(|| PathBuf::from("."))
    }

    /// The map name, falling back to the working directory's name.
    pub fn map_name(&self) -> Result<String> {
        if let Some(name) = self.map_name.as_ref().filter(|name| !name.is_empty()) {
            return Ok(name.clone());
        }
        let dir = self.working_dir().canonicalize()?;
        dir.file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string)
            .ok_or_else(|| Error::config("cannot derive a map name from the working directory"))
    }

    pub fn to_map_config(&self) -> Result<MapConfig> {
        let bbox = BoundingBox::parse(self.bbox.as_deref().unwrap_or(DEFAULT_BBOX))?;
        let intervals = ZoomInterval::parse_list(
            self.zoom_intervals.as_deref().unwrap_or(DEFAULT_ZOOM_INTERVALS),
        )?;
        let output = self.working_dir().join(format!("{}.map", self.map_name()?));

        let mut config = MapConfig::new(bbox, intervals, output);
        if let Some(tolerance) = self.simplification {
            config.simplification_tolerance = tolerance;
        }
        if let Some(precision) = self.precision {
            config.precision = precision;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        config.input_sorted = self.input_sorted.unwrap_or(false);
        if let Some(tag_mapping) = &self.tag_mapping {
            config.tag_mapping = tag_mapping.clone();
        }
        if let Some(shards) = self.shards {
            config.shards = shards;
        }
        config.created_ms = self.timestamp;
        config.validate()?;
        Ok(config)
    }

    /// Elevation settings, if an elevation tile directory is configured.
    pub fn to_elevation_config(&self) -> Result<Option<ElevationConfig>> {
        let Some(tiles_dir) = &self.hgt_dir else {
            return Ok(None);
        };
        let mut config = ElevationConfig::new(tiles_dir.clone());
        config.tpi_cutoffs =
            ElevationConfig::parse_cutoffs(self.tpi_cutoffs.as_deref().unwrap_or(DEFAULT_TPI_CUTOFFS))?;
        if let Some(radius) = self.radius_small {
            config.radius_small = radius;
        }
        if let Some(radius) = self.radius_large {
            config.radius_large = radius;
        }
        if let Some(cutoff) = self.mountain_cutoff {
            config.mountain_cutoff = cutoff;
        }
        if self.write_osm.unwrap_or(false) {
            config.osm_output = Some(self.working_dir().join(format!("{}.osm", self.map_name()?)));
        }
        config.validate()?;
        Ok(Some(config))
    }
}

pub fn load_user_config(path: &Path) -> Result<UserConfig> {
    let file = File::open(path).map_err(|err| Error::from(err).context(path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .map_err(|err| Error::from(err).context(path.display()))
}

pub fn write_user_config(path: &Path, config: &UserConfig) -> Result<()> {
    let file = File::create(path).map_err(|err| Error::from(err).context(path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), config)?;
    Ok(())
}
