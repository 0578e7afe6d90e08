use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info, warn};
use structured_logger::json::new_writer;
use structured_logger::Builder;

use liftylines::config::{load_user_config, write_user_config, UserConfig, HUGE_BBOX_DIMENSION};
use liftylines::data::feature::Feature;
use liftylines::errors::{Error, Result};
use liftylines::etl::build_map::{build_map, RunStatus};
use liftylines::etl::lifty_areas::{write_osm, LiftyAreas};
use liftylines::etl::parse_osm::OsmXmlSource;
use liftylines::etl::render_theme::write_render_theme;
use liftylines::etl::tag_mapping::TagMapping;

/// Builds a tiled binary map of aerialways, pistes and prominent terrain from an
/// OSM extract and elevation tiles.
#[derive(Parser, Debug, Clone)]
#[command(name = "liftylines", version)]
struct Args {
    /// OSM XML input, `.osm` or `.osm.xz`.
    #[arg(long, short)]
    input: Option<PathBuf>,

    /// minLat,minLon,maxLat,maxLon
    #[arg(long)]
    bbox: Option<String>,

    /// Output file name without extension. Defaults to the working directory's name.
    #[arg(long)]
    map_name: Option<String>,

    #[arg(long)]
    working_dir: Option<PathBuf>,

    /// base,min,max[,base,min,max...]
    #[arg(long)]
    zoom_intervals: Option<String>,

    /// Simplification tolerance in degrees, 0 keeps every point.
    #[arg(long)]
    simplification: Option<f64>,

    /// Decimal digits kept per coordinate.
    #[arg(long)]
    precision: Option<u8>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    shards: Option<usize>,

    /// Input is sorted north to south; finished tiles are moved to disk early.
    #[arg(long, default_value_t = false)]
    sorted: bool,

    #[arg(long)]
    tag_mapping: Option<PathBuf>,

    /// JSON config file; command line values override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Writes the effective configuration as JSON.
    #[arg(long)]
    write_config: Option<PathBuf>,

    /// Writes a render theme for the tag mapping.
    #[arg(long)]
    theme: Option<PathBuf>,

    /// Creation time in unix milliseconds, for reproducible output.
    #[arg(long)]
    timestamp: Option<i64>,

    /// Directory of SRTM `.hgt` tiles; traces prominent terrain into `liftyline` areas.
    #[arg(long)]
    hgt_dir: Option<PathBuf>,

    /// TPI cutoffs in meters, one area level each. Lower cutoffs mark more terrain.
    #[arg(long)]
    tpi_cutoffs: Option<String>,

    /// Small TPI radius in arc seconds of latitude.
    #[arg(long)]
    radius_small: Option<f64>,

    /// Large TPI radius in arc seconds of latitude.
    #[arg(long)]
    radius_large: Option<f64>,

    /// Terrain above this many meters is never marked.
    #[arg(long)]
    mountain_cutoff: Option<f64>,

    /// Writes the traced areas to `<map-name>.osm` and builds the map from that file.
    #[arg(long, default_value_t = false)]
    write_osm: bool,

    #[arg(long, default_value_t = false)]
    progress: bool,

    #[arg(long, default_value_t = false)]
    debug: bool,
}

impl Args {
    fn to_user_config(&self) -> UserConfig {
        UserConfig {
            data_path: self.input.clone(),
            working_dir: self.working_dir.clone(),
            map_name: self.map_name.clone(),
            bbox: self.bbox.clone(),
            zoom_intervals: self.zoom_intervals.clone(),
            simplification: self.simplification,
            precision: self.precision,
            batch_size: self.batch_size,
            input_sorted: self.sorted.then_some(true),
            tag_mapping: self.tag_mapping.clone(),
            shards: self.shards,
            timestamp: self.timestamp,
            hgt_dir: self.hgt_dir.clone(),
            tpi_cutoffs: self.tpi_cutoffs.clone(),
            radius_small: self.radius_small,
            radius_large: self.radius_large,
            mountain_cutoff: self.mountain_cutoff,
            write_osm: self.write_osm.then_some(true),
        }
    }
}

fn setup_logging(debug: bool) {
    Builder::with_level(if debug { "debug" } else { "info" })
        .with_target_writer("*", new_writer(io::stdout()))
        .init();
}

fn run(args: &Args) -> Result<RunStatus> {
    let file_config = match &args.config {
        Some(path) => load_user_config(path)?,
        None => UserConfig::default(),
    };
    let user_config = file_config.merge(args.to_user_config());
    if let Some(path) = &args.write_config {
        write_user_config(path, &user_config)?;
        info!(path = path.display().to_string(); "Wrote config");
    }

    let mut config = user_config.to_map_config()?;
    config.progress = args.progress;
    info!(
        bbox = config.bbox.to_string(),
        output = config.output.display().to_string(),
        sorted = config.input_sorted;
        "Configuration loaded"
    );

    if config.bbox.dimension() > HUGE_BBOX_DIMENSION {
        warn!(
            bbox = config.bbox.to_string(),
            dimension = config.bbox.dimension();
            "Huge bounding box, expect large elevation reads and high memory use"
        );
    }

    if let Some(theme) = &args.theme {
        write_render_theme(&TagMapping::load(&config.tag_mapping)?, theme)?;
    }

    let mut sources: Vec<Box<dyn Iterator<Item = Result<Feature>>>> = Vec::new();
    if let Some(data_path) = &user_config.data_path {
        sources.push(Box::new(OsmXmlSource::open(data_path)?));
    }
    if let Some(elevation) = user_config.to_elevation_config()? {
        let areas = LiftyAreas::from_tiles(&elevation, &config.bbox)?;
        match &elevation.osm_output {
            Some(osm_path) => {
                write_osm(osm_path, &config.bbox, areas)?;
                sources.push(Box::new(OsmXmlSource::open(osm_path)?));
            }
            None => sources.push(Box::new(areas)),
        }
    }
    if sources.is_empty() {
        return Err(Error::config("nothing to build, use --input, --hgt-dir or their config keys"));
    }
    let report = build_map(&config, sources.into_iter().flatten())?;
    info!(report = serde_json::to_string(&report)?; "Run report");
    Ok(report.status())
}

fn main() -> ExitCode {
    let args = Args::parse();
    setup_logging(args.debug);

    match run(&args) {
        Ok(RunStatus::Complete) => ExitCode::SUCCESS,
        Ok(RunStatus::Partial { dropped }) => {
            warn!(dropped = dropped; "Map written, some features were dropped");
            ExitCode::from(3)
        }
        Err(err) => {
            error!(kind = format!("{:?}", err.kind), err = err.message; "Map build failed");
            ExitCode::FAILURE
        }
    }
}
