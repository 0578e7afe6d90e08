//! Streams features through resolution, normalization and tiling into the
//! tile store, then hands the store to the map writer.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};
use rayon::prelude::*;
use serde::Serialize;

use crate::config::MapConfig;
use crate::data::feature::{Feature, GeometryKind};
use crate::data::tile::{TileEntry, TileKey};
use crate::errors::{Error, ErrorKind, Result};
use crate::etl::map_writer::{now_ms, MapHeader, MapWriter};
use crate::etl::normalize::Normalizer;
use crate::etl::tag_mapping::TagMapping;
use crate::etl::tile_grid::TileGrid;
use crate::etl::tile_store::TileStore;
use crate::etl::Etl;

pub const ETL_NAME: &str = "build_map";

/// Features skipped per reason.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DropCounts {
    pub unresolved_tags: u64,
    pub degenerate_geometry: u64,
    /// Outside the bounding box, or visible at no configured base zoom.
    pub out_of_scope: u64,
}

impl DropCounts {
    pub fn total(&self) -> u64 {
        self.unresolved_tags + self.degenerate_geometry + self.out_of_scope
    }

    fn count(&mut self, reason: DropReason) {
        match reason {
            DropReason::UnresolvedTags => self.unresolved_tags += 1,
            DropReason::DegenerateGeometry => self.degenerate_geometry += 1,
            DropReason::OutOfScope => self.out_of_scope += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DropReason {
    UnresolvedTags,
    DegenerateGeometry,
    OutOfScope,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub features_read: u64,
    /// Features with at least one tile entry, each counted once.
    pub features_written: u64,
    pub tile_entries_written: u64,
    pub tiles_written: u64,
    pub tiles_staged: u64,
    pub dropped: DropCounts,
    pub bytes: u64,
    pub output: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Complete,
    /// Artifact written, but some features were skipped.
    Partial { dropped: u64 },
}

impl RunReport {
    pub fn status(&self) -> RunStatus {
        match self.dropped.total() {
            0 => RunStatus::Complete,
            dropped => RunStatus::Partial { dropped },
        }
    }
}

/// The per-feature stages. Shared read-only by the worker threads.
struct FeaturePipeline {
    mapping: Arc<TagMapping>,
    normalizer: Normalizer,
    grid: TileGrid,
    precision: u8,
}

/// What happened to one feature. `north` is the northern edge of its
/// normalized envelope, used to advance the sweep line.
struct Outcome {
    north: Option<i32>,
    placed: std::result::Result<Vec<(TileKey, TileEntry)>, DropReason>,
}

impl Outcome {
    fn dropped(north: Option<i32>, reason: DropReason) -> Outcome {
        Outcome {
            north,
            placed: Err(reason),
        }
    }
}

impl FeaturePipeline {
    fn place(&self, seq: u64, mut feature: Feature) -> Outcome {
        let Some(kind) = feature.kind() else {
            debug!(feature_id = feature.id; "Unsupported geometry type");
            return Outcome::dropped(None, DropReason::DegenerateGeometry);
        };
        feature.resolved = self.mapping.resolve_for(kind, &feature.tags);
        if feature.resolved.is_none() && kind == GeometryKind::Polygon && feature.ring_to_line() {
            feature.resolved = self.mapping.resolve_for(GeometryKind::Line, &feature.tags);
        }
        let Some(resolution) = &feature.resolved else {
            debug!(feature_id = feature.id; "No mapping rule matches");
            return Outcome::dropped(None, DropReason::UnresolvedTags);
        };

        let shape = match self.normalizer.normalize(&feature.geometry, self.precision) {
            Ok(shape) => shape,
            Err(err) => {
                debug!(feature_id = feature.id, err = err.message; "Dropping degenerate geometry");
                return Outcome::dropped(None, DropReason::DegenerateGeometry);
            }
        };
        let north = shape.envelope().map(|envelope| envelope.north);
        if !self.grid.covers(resolution.zoom_min, resolution.zoom_max) {
            return Outcome::dropped(north, DropReason::OutOfScope);
        }

        let tag = resolution.tag_ref();
        let entries: Vec<(TileKey, TileEntry)> = self
            .grid
            .assign(&shape, resolution.zoom_min, resolution.zoom_max)
            .into_iter()
            .map(|(key, clipped)| {
                let entry = TileEntry {
                    feature_id: feature.id,
                    seq,
                    tag: tag.clone(),
                    shape: clipped,
                };
                (key, entry)
            })
            .collect();
        if entries.is_empty() {
            return Outcome::dropped(north, DropReason::OutOfScope);
        }
        Outcome {
            north,
            placed: Ok(entries),
        }
    }
}

/// Running state of the transform phase.
#[derive(Default)]
pub struct Sweep {
    features_read: u64,
    dropped: DropCounts,
    /// Lowest northern edge seen so far, in microdegrees.
    frontier: Option<i32>,
    order_violated: bool,
    tiles_flushed: u64,
}

pub struct MapBuildEtl<S> {
    config: MapConfig,
    pipeline: FeaturePipeline,
    source: Option<S>,
}

impl<S: Iterator<Item = Result<Feature>>> MapBuildEtl<S> {
    pub fn new(config: MapConfig, mapping: Arc<TagMapping>, source: S) -> MapBuildEtl<S> {
        let pipeline = FeaturePipeline {
            mapping,
            normalizer: Normalizer::new(config.simplification_tolerance),
            grid: TileGrid::new(config.bbox.to_micro(), config.zoom_intervals.clone()),
            precision: config.precision,
        };
        MapBuildEtl {
            config,
            pipeline,
            source: Some(source),
        }
    }

    fn run_batch(&self, store: &TileStore, batch: Vec<(u64, Feature)>, sweep: &mut Sweep) -> Result<()> {
        let pipeline = &self.pipeline;
        let outcomes: Vec<Outcome> = batch
            .into_par_iter()
            .map(|(seq, feature)| pipeline.place(seq, feature))
            .collect();

        let mut placed = Vec::new();
        for outcome in outcomes {
            if let Some(north) = outcome.north {
                match sweep.frontier {
                    Some(frontier) if north > frontier => {
                        if !sweep.order_violated {
                            warn!(north = north, frontier = frontier; "Input is not sorted north to south, late features are merged from staging");
                            sweep.order_violated = true;
                        }
                    }
                    _ => sweep.frontier = Some(north),
                }
            }
            match outcome.placed {
                Ok(entries) => placed.extend(entries),
                Err(reason) => sweep.dropped.count(reason),
            }
        }

        placed
            .into_par_iter()
            .try_for_each(|(key, entry)| store.insert(key, entry))?;

        if self.config.input_sorted {
            if let Some(frontier) = sweep.frontier {
                sweep.tiles_flushed += store.flush_north_of(frontier)? as u64;
            }
        }
        Ok(())
    }
}

impl<S: Iterator<Item = Result<Feature>>> Etl for MapBuildEtl<S> {
    type Input = (S, TileStore);
    type Output = (TileStore, Sweep);
    type Report = RunReport;

    fn etl_name(&self) -> &str {
        ETL_NAME
    }

    fn clean(&self, _dir: &Path) -> Result<()> {
        if self.config.output.exists() {
            fs::remove_file(&self.config.output)?;
        }
        Ok(())
    }

    fn extract(&mut self, dir: &Path) -> Result<Self::Input> {
        self.clean(dir)?;
        let source = self
            .source
            .take()
            .ok_or_else(|| Error::config("feature source already consumed"))?;
        let store = TileStore::new(self.config.shards, dir)?;
        Ok((source, store))
    }

    fn transform(&mut self, (source, store): Self::Input) -> Result<Self::Output> {
        let mut sweep = Sweep::default();
        let mut batch = Vec::with_capacity(self.config.batch_size);
        for item in source {
            let feature = item.map_err(|err| err.context("reading input"))?;
            batch.push((sweep.features_read, feature));
            sweep.features_read += 1;
            if batch.len() >= self.config.batch_size {
                self.run_batch(&store, std::mem::take(&mut batch), &mut sweep)?;
                debug!(features_read = sweep.features_read, resident_tiles = store.resident_tiles()?; "Batch done");
            }
        }
        if !batch.is_empty() {
            self.run_batch(&store, batch, &mut sweep)?;
        }
        info!(
            features_read = sweep.features_read,
            dropped = sweep.dropped.total(),
            tiles_flushed = sweep.tiles_flushed;
            "Input consumed"
        );
        Ok((store, sweep))
    }

    fn load(&mut self, _dir: &Path, (store, sweep): Self::Output) -> Result<Self::Report> {
        let created_ms = match self.config.created_ms {
            Some(created_ms) => created_ms,
            None => now_ms()?,
        };
        let header = MapHeader::new(
            created_ms,
            self.config.bbox.to_micro(),
            self.config.precision,
            self.pipeline.mapping.version.clone(),
            &self.config.zoom_intervals,
        );
        let summary = MapWriter::new(&self.config.output, self.config.progress).write(&store, header)?;

        Ok(RunReport {
            features_read: sweep.features_read,
            features_written: summary.features_written,
            tile_entries_written: summary.tile_entries_written,
            tiles_written: summary.tiles_written,
            tiles_staged: store.staged_tiles()? as u64,
            dropped: sweep.dropped,
            bytes: summary.bytes,
            output: self.config.output.clone(),
        })
    }
}

/// Builds one map file from `source`. The tag mapping is loaded before the
/// source is touched, so a broken table aborts without reading any input.
pub fn build_map<S>(config: &MapConfig, source: S) -> Result<RunReport>
where
    S: Iterator<Item = Result<Feature>>,
{
    config.validate()?;
    let mapping = TagMapping::load(&config.tag_mapping)
        .map_err(|err| err.with_kind(ErrorKind::MalformedMappingTable))?;
    let mut etl = MapBuildEtl::new(config.clone(), Arc::new(mapping), source);
    let report = etl.process(&config.output_dir())?;
    info!(
        output = report.output.display().to_string(),
        features_read = report.features_read,
        features_written = report.features_written,
        tile_entries_written = report.tile_entries_written,
        tiles_written = report.tiles_written,
        unresolved_tags = report.dropped.unresolved_tags,
        degenerate_geometry = report.dropped.degenerate_geometry,
        out_of_scope = report.dropped.out_of_scope;
        "Map built"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::collections::BTreeSet;

    use geo::{line_string, point, polygon};

    use super::*;
    use crate::config::{BoundingBox, ZoomInterval, DEFAULT_BBOX, DEFAULT_TAG_MAPPING, DEFAULT_ZOOM_INTERVALS};
    use crate::etl::map_reader::MapReader;
    use crate::etl::tile_grid::tile_bounds;

    const TABLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<tag-mapping version="3" profile-name="liftylines" default-zoom-max="18">
  <points>
    <osm-tag key="aerialway" value="station" type-code="10" zoom-min="13"/>
    <osm-tag key="aerialway" value="pylon" type-code="11" zoom-min="17"/>
  </points>
  <lines>
    <osm-tag key="aerialway" value="cable_car" type-code="42" zoom-min="10" zoom-max="16"/>
    <osm-tag key="aerialway" value="*" type-code="40" zoom-min="12"/>
  </lines>
  <areas>
    <osm-tag key="landuse" value="winter_sports" type-code="80" zoom-min="9"/>
  </areas>
</tag-mapping>
"#;

    fn degrees(micro: i32) -> f64 {
        f64::from(micro) / 1e6
    }

    /// Config covering tiles (12,5,7) and (12,5,8) with a single base zoom 12.
    fn setup(dir: &Path) -> MapConfig {
        let mapping = dir.join("mapping.xml");
        fs::write(&mapping, TABLE).unwrap();
        let west = tile_bounds(&TileKey::new(12, 5, 7));
        let east = tile_bounds(&TileKey::new(12, 5, 8));
        let bbox = BoundingBox::new(
            degrees(west.south) + 0.001,
            degrees(west.west) + 0.001,
            degrees(west.north) - 0.001,
            degrees(east.east) - 0.001,
        )
        .unwrap();
        let intervals = vec![ZoomInterval::new(12, 10, 16).unwrap()];
        let mut config = MapConfig::new(bbox, intervals, dir.join("alps.map"));
        config.tag_mapping = mapping;
        config.created_ms = Some(1_700_000_000_000);
        config.batch_size = 2;
        config
    }

    /// A cable car from the middle of tile (12,5,7) to the middle of (12,5,8).
    fn cable_car(id: u64) -> Feature {
        let west = tile_bounds(&TileKey::new(12, 5, 7));
        let east = tile_bounds(&TileKey::new(12, 5, 8));
        let lat = degrees((west.north + west.south) / 2);
        let line = line_string![
            (x: degrees((west.west + west.east) / 2), y: lat),
            (x: degrees((east.west + east.east) / 2), y: lat),
        ];
        Feature::with_tags(id, line, &[("aerialway", "cable_car"), ("name", "Pendelbahn")])
    }

    fn ok(features: Vec<Feature>) -> impl Iterator<Item = Result<Feature>> {
        features.into_iter().map(Ok)
    }

    #[test]
    fn cable_car_spans_two_tiles() {
        let dir = tempfile::tempdir().unwrap();
        let config = setup(dir.path());
        let report = build_map(&config, ok(vec![cable_car(4711)])).unwrap();

        assert_eq!(report.status(), RunStatus::Complete);
        assert_eq!(report.features_read, 1);
        assert_eq!(report.features_written, 1);
        assert_eq!(report.tile_entries_written, 2);
        assert_eq!(report.tiles_written, 2);

        let reader = MapReader::open(&config.output).unwrap();
        assert_eq!(reader.header().intervals.len(), 1);
        let interval = &reader.header().intervals[0].interval;
        assert!(interval.min <= 12 && 12 <= interval.max);
        let tiles = reader.tiles(0).unwrap();
        let keys: Vec<TileKey> = tiles.iter().map(|t| t.key).collect();
        assert_eq!(keys, vec![TileKey::new(12, 5, 7), TileKey::new(12, 5, 8)]);
        for tile in &tiles {
            assert_eq!(tile.entries.len(), 1);
            assert_eq!(tile.entries[0].feature_id, 4711);
            assert_eq!(tile.entries[0].tag.type_code, 42);
        }
    }

    #[test]
    fn unresolved_and_degenerate_features_are_counted() {
        let dir = tempfile::tempdir().unwrap();
        let config = setup(dir.path());
        let west = tile_bounds(&TileKey::new(12, 5, 7));
        let (lat, lon) = (degrees(west.south + 1000), degrees(west.west + 1000));
        let features = vec![
            cable_car(1),
            Feature::with_tags(2, line_string![(x: lon, y: lat), (x: lon + 0.01, y: lat)], &[("highway", "path")]),
            Feature::with_tags(3, line_string![(x: lon, y: lat), (x: lon, y: lat)], &[("aerialway", "drag_lift")]),
            // pylons show from zoom 17, past the interval's 10-16
            Feature::with_tags(4, point!(x: lon, y: lat), &[("aerialway", "pylon")]),
            Feature::with_tags(
                5,
                polygon![(x: 10.0, y: 47.0), (x: 10.1, y: 47.0), (x: 10.1, y: 47.1)],
                &[("landuse", "winter_sports")],
            ),
        ];
        let report = build_map(&config, ok(features)).unwrap();

        assert_eq!(report.features_read, 5);
        assert_eq!(report.features_written, 1);
        assert_eq!(
            report.dropped,
            DropCounts {
                unresolved_tags: 1,
                degenerate_geometry: 1,
                out_of_scope: 2,
            }
        );
        assert_eq!(report.status(), RunStatus::Partial { dropped: 4 });
        assert!(config.output.exists());
    }

    #[test]
    fn malformed_mapping_aborts_before_reading_input() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = setup(dir.path());
        let broken = dir.path().join("broken.xml");
        fs::write(&broken, "<tag-mapping version=\"1\"><lines><osm-tag key=\"aerialway\"").unwrap();
        config.tag_mapping = broken;

        let polled = Cell::new(false);
        let source = std::iter::from_fn(|| {
            polled.set(true);
            None
        });
        let err = build_map(&config, source).unwrap_err();
        assert_eq!(err.kind, ErrorKind::MalformedMappingTable);
        assert!(!polled.get());
        assert!(!config.output.exists());
    }

    #[test]
    fn input_errors_abort_without_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let config = setup(dir.path());
        let source = vec![Ok(cable_car(1)), Err(Error::input("truncated file"))].into_iter();
        let err = build_map(&config, source).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidInput);
        assert!(err.message.contains("reading input"));
        assert!(!config.output.exists());
    }

    fn many_features() -> Vec<Feature> {
        let west = tile_bounds(&TileKey::new(12, 5, 7));
        let east = tile_bounds(&TileKey::new(12, 5, 8));
        let mut features = Vec::new();
        // north to south, alternating tiles
        for i in 0..12u64 {
            let lat = degrees(west.north - 1_500 - 300 * i as i32);
            let lon = degrees(if i % 2 == 0 { west.west + 30_000 } else { east.west + 30_000 });
            features.push(Feature::with_tags(
                100 - i,
                line_string![(x: lon, y: lat), (x: lon + 0.02, y: lat - 0.0005)],
                &[("aerialway", "chair_lift")],
            ));
        }
        features.push(cable_car(7));
        features
    }

    #[test]
    fn output_is_reproducible() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = setup(dir.path());

        let first = build_map(&config, ok(many_features())).unwrap();
        let reference = fs::read(&config.output).unwrap();
        build_map(&config, ok(many_features())).unwrap();
        assert_eq!(fs::read(&config.output).unwrap(), reference);

        config.input_sorted = true;
        config.batch_size = 1;
        config.shards = 3;
        let swept = build_map(&config, ok(many_features())).unwrap();
        assert_eq!(fs::read(&config.output).unwrap(), reference);
        assert_eq!(swept.tile_entries_written, first.tile_entries_written);
        assert_eq!(swept.features_written, 13);
    }

    #[test]
    fn rules_show_up_in_every_overlapping_interval() {
        let dir = tempfile::tempdir().unwrap();
        let bbox = BoundingBox::parse(DEFAULT_BBOX).unwrap();
        let intervals = ZoomInterval::parse_list(DEFAULT_ZOOM_INTERVALS).unwrap();
        let mut config = MapConfig::new(bbox, intervals, dir.path().join("alps.map"));
        config.tag_mapping = Path::new(env!("CARGO_MANIFEST_DIR")).join(DEFAULT_TAG_MAPPING);
        config.created_ms = Some(1_700_000_000_000);

        let (lat, lon) = (47.5, 12.5);
        let lift = |id: u64, tags: &[(&str, &str)], dx: f64| {
            Feature::with_tags(id, line_string![(x: lon + dx, y: lat), (x: lon + dx + 0.01, y: lat + 0.005)], tags)
        };
        let features = vec![
            lift(1, &[("aerialway", "drag_lift")], 0.0),
            lift(2, &[("aerialway", "magic_carpet")], 0.02),
            lift(3, &[("aerialway", "cable_car")], 0.04),
            lift(4, &[("piste:type", "nordic")], 0.06),
            Feature::with_tags(5, point!(x: lon, y: lat - 0.01), &[("aerialway", "station")]),
            Feature::with_tags(6, point!(x: lon + 0.01, y: lat - 0.01), &[("aerialway", "pylon")]),
        ];
        let report = build_map(&config, ok(features)).unwrap();
        assert_eq!(report.status(), RunStatus::Complete);
        assert_eq!(report.features_written, 6);

        let reader = MapReader::open(&config.output).unwrap();
        let codes = |interval: usize| -> BTreeSet<u16> {
            reader
                .tiles(interval)
                .unwrap()
                .iter()
                .flat_map(|tile| tile.entries.iter().map(|entry| entry.tag.type_code))
                .collect()
        };
        // 5,0,7 shows nothing, 10,8,10 only the cable car, 11,11,21 everything
        assert!(codes(0).is_empty());
        assert_eq!(codes(1), BTreeSet::from([42]));
        assert_eq!(codes(2), BTreeSet::from([10, 11, 42, 45, 46, 61]));
    }

    #[test]
    fn closed_ways_fall_back_to_line_rules() {
        let dir = tempfile::tempdir().unwrap();
        let config = setup(dir.path());
        let west = tile_bounds(&TileKey::new(12, 5, 7));
        let (s, w) = (degrees(west.south + 2_000), degrees(west.west + 2_000));
        let ring = |id: u64, tags: &[(&str, &str)]| {
            Feature::with_tags(
                id,
                polygon![(x: w, y: s), (x: w + 0.01, y: s), (x: w + 0.01, y: s + 0.01), (x: w, y: s + 0.01)],
                tags,
            )
        };
        let features = vec![
            ring(1, &[("landuse", "winter_sports")]),
            ring(2, &[("aerialway", "magic_carpet")]),
            // explicitly an area, so line rules do not apply
            ring(3, &[("aerialway", "magic_carpet"), ("area", "yes")]),
        ];
        let report = build_map(&config, ok(features)).unwrap();
        assert_eq!(report.features_written, 2);
        assert_eq!(report.dropped.unresolved_tags, 1);

        let reader = MapReader::open(&config.output).unwrap();
        let tiles = reader.tiles(0).unwrap();
        assert_eq!(tiles.len(), 1);
        let mut entries: Vec<_> = tiles[0].entries.iter().map(|e| (e.feature_id, e.kind, e.tag.type_code)).collect();
        entries.sort();
        assert_eq!(entries, vec![(1, GeometryKind::Polygon, 80), (2, GeometryKind::Line, 40)]);
        // the line keeps the closing point
        let line = tiles[0].entries.iter().find(|e| e.feature_id == 2).unwrap();
        assert_eq!(line.parts[0].len(), 5);
        assert_eq!(line.parts[0].first(), line.parts[0].last());
    }

    /// Short chair lifts running down the default box, north to south.
    fn lifts_down_the_alps() -> Vec<Feature> {
        (0..10u64)
            .map(|i| {
                let (lat, lon) = (47.95 - 0.09 * i as f64, 12.1 + 0.07 * i as f64);
                Feature::with_tags(
                    200 + i,
                    line_string![(x: lon, y: lat), (x: lon + 0.02, y: lat - 0.005)],
                    &[("aerialway", "chair_lift")],
                )
            })
            .collect()
    }

    #[test]
    fn sorted_input_stages_finished_tiles() {
        let dir = tempfile::tempdir().unwrap();
        let mapping = dir.path().join("mapping.xml");
        fs::write(&mapping, TABLE).unwrap();
        let bbox = BoundingBox::parse(DEFAULT_BBOX).unwrap();
        let mut config = MapConfig::new(bbox, vec![ZoomInterval::new(12, 10, 16).unwrap()], dir.path().join("alps.map"));
        config.tag_mapping = mapping;
        config.created_ms = Some(1_700_000_000_000);

        let mut features = lifts_down_the_alps();
        // arrives after its tile was staged, so the writer merges both copies
        let mut late = features[0].clone();
        late.id = 299;
        features.push(late);

        let reference_report = build_map(&config, ok(features.clone())).unwrap();
        assert_eq!(reference_report.tiles_staged, 0);
        let reference = fs::read(&config.output).unwrap();

        config.input_sorted = true;
        config.batch_size = 1;
        config.shards = 4;
        let swept = build_map(&config, ok(features)).unwrap();
        assert!(swept.tiles_staged > 0);
        assert_eq!(fs::read(&config.output).unwrap(), reference);
        assert_eq!(swept.tiles_written, reference_report.tiles_written);
        assert_eq!(swept.features_written, 11);

        let reader = MapReader::open(&config.output).unwrap();
        let first = reader
            .tiles(0)
            .unwrap()
            .into_iter()
            .find(|tile| tile.entries.iter().any(|e| e.feature_id == 200))
            .unwrap();
        let ids: Vec<u64> = first.entries.iter().map(|e| e.feature_id).collect();
        assert_eq!(ids, vec![200, 299]);
    }
}
