//! Two-pass writer of the tiled binary map file.
//!
//! Pass 1 encodes every tile once to learn its length. Pass 2 writes the header,
//! the per-interval indices and the blocks, re-encoding each tile and checking
//! it against the length from pass 1. The result is only moved to the output
//! path after [`MapReader`] accepted it.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info};
use tempfile::NamedTempFile;

use crate::config::ZoomInterval;
use crate::data::tile::{TagRef, Tile, TileKey};
use crate::data::MicroBox;
use crate::errors::{Error, Result};
use crate::etl::encoding::{put_string, put_vs, put_vu};
use crate::etl::map_reader::MapReader;
use crate::etl::tile_grid::tile_origin;
use crate::etl::tile_store::TileSource;

pub const MAGIC: &[u8; 8] = b"LIFTYMAP";
pub const FORMAT_VERSION: u16 = 1;
pub const WRITER_NAME: &str = concat!("liftylines ", env!("CARGO_PKG_VERSION"));

/// Bytes before the header length field ends: magic, version, length.
pub const HEADER_PREFIX_LEN: usize = 8 + 2 + 4;
/// One index record: row, col, absolute block offset.
pub const INDEX_ENTRY_LEN: u64 = 4 + 4 + 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntervalInfo {
    pub interval: ZoomInterval,
    pub tile_count: u32,
    pub index_offset: u64,
    pub blocks_offset: u64,
    pub blocks_length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapHeader {
    pub created_ms: i64,
    pub bbox: MicroBox,
    pub precision: u8,
    pub mapping_version: String,
    pub writer: String,
    pub tags: Vec<TagRef>,
    pub intervals: Vec<IntervalInfo>,
}

impl MapHeader {
    /// Header skeleton; the writer fills in tags, counts and offsets.
    pub fn new(
        created_ms: i64,
        bbox: MicroBox,
        precision: u8,
        mapping_version: impl Into<String>,
        intervals: &[ZoomInterval],
    ) -> MapHeader {
        MapHeader {
            created_ms,
            bbox,
            precision,
            mapping_version: mapping_version.into(),
            writer: WRITER_NAME.to_string(),
            tags: Vec::new(),
            intervals: intervals
                .iter()
                .map(|interval| IntervalInfo {
                    interval: *interval,
                    tile_count: 0,
                    index_offset: 0,
                    blocks_offset: 0,
                    blocks_length: 0,
                })
                .collect(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC);
        buf.extend(FORMAT_VERSION.to_be_bytes());
        buf.extend(0u32.to_be_bytes());

        buf.extend(self.created_ms.to_be_bytes());
        for value in [self.bbox.south, self.bbox.west, self.bbox.north, self.bbox.east] {
            buf.extend(value.to_be_bytes());
        }
        buf.push(self.precision);
        put_string(&mut buf, &self.mapping_version);
        put_string(&mut buf, &self.writer);

        put_vu(&mut buf, self.tags.len() as u64);
        for tag in &self.tags {
            buf.extend(tag.type_code.to_be_bytes());
            put_string(&mut buf, &tag.key);
            put_string(&mut buf, &tag.value);
        }

        buf.push(u8::try_from(self.intervals.len())?);
        for info in &self.intervals {
            buf.extend([info.interval.base, info.interval.min, info.interval.max]);
            buf.extend(info.tile_count.to_be_bytes());
            buf.extend(info.index_offset.to_be_bytes());
            buf.extend(info.blocks_offset.to_be_bytes());
            buf.extend(info.blocks_length.to_be_bytes());
        }

        let header_len = u32::try_from(buf.len() - HEADER_PREFIX_LEN)?;
        buf[10..HEADER_PREFIX_LEN].copy_from_slice(&header_len.to_be_bytes());
        Ok(buf)
    }
}

pub fn now_ms() -> Result<i64> {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|err| Error::config(format!("system clock before 1970: {err}")))?;
    Ok(i64::try_from(elapsed.as_millis())?)
}

/// Encodes one tile block. Every entry's tag must be in `tag_index`.
pub fn encode_block(tile: &Tile, tag_index: &BTreeMap<&TagRef, u64>) -> Result<Vec<u8>> {
    let origin = tile_origin(&tile.key);
    let mut buf = Vec::new();
    put_vu(&mut buf, tile.entries.len() as u64);
    for entry in &tile.entries {
        let tag = tag_index.get(&entry.tag).ok_or_else(|| {
            Error::inconsistent(format!(
                "tag {}={} of feature {} missing from tag table",
                entry.tag.key, entry.tag.value, entry.feature_id
            ))
        })?;
        put_vu(&mut buf, entry.feature_id);
        put_vu(&mut buf, *tag);
        buf.push(entry.shape.kind.code());
        put_vu(&mut buf, entry.shape.parts.len() as u64);
        for part in &entry.shape.parts {
            put_vu(&mut buf, part.len() as u64);
            let mut previous = origin;
            for point in part {
                put_vs(&mut buf, i64::from(point.lat) - i64::from(previous.lat));
                put_vs(&mut buf, i64::from(point.lon) - i64::from(previous.lon));
                previous = *point;
            }
        }
    }
    Ok(buf)
}

/// Block lengths of one zoom interval, in index order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntervalSizes {
    keys: Vec<TileKey>,
    lengths: Vec<u64>,
}

impl IntervalSizes {
    pub fn keys(&self) -> &[TileKey] {
        &self.keys
    }

    pub fn lengths(&self) -> &[u64] {
        &self.lengths
    }

    pub fn total(&self) -> u64 {
        self.lengths.iter().sum()
    }
}

/// Output of pass 1, read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileSizeTable {
    intervals: Vec<IntervalSizes>,
}

impl TileSizeTable {
    pub fn intervals(&self) -> &[IntervalSizes] {
        &self.intervals
    }

    /// Fills counts and offsets of `header` from the measured sizes.
    fn lay_out(&self, header: &mut MapHeader) -> Result<()> {
        let mut cursor = header.encode()?.len() as u64;
        for (info, sizes) in header.intervals.iter_mut().zip(&self.intervals) {
            info.tile_count = u32::try_from(sizes.keys.len())?;
            info.index_offset = cursor;
            cursor += sizes.keys.len() as u64 * INDEX_ENTRY_LEN;
            info.blocks_offset = cursor;
            info.blocks_length = sizes.total();
            cursor += info.blocks_length;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub tiles_written: u64,
    pub tile_entries_written: u64,
    /// Distinct input features with at least one entry.
    pub features_written: u64,
    pub bytes: u64,
}

pub struct MapWriter {
    output: PathBuf,
    progress: bool,
}

impl MapWriter {
    pub fn new(output: impl Into<PathBuf>, progress: bool) -> MapWriter {
        MapWriter {
            output: output.into(),
            progress,
        }
    }

    fn output_dir(&self) -> &Path {
        match self.output.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }

    pub fn write(&self, source: &impl TileSource, mut header: MapHeader) -> Result<WriteSummary> {
        let tags = source.tags()?;
        let tag_index: BTreeMap<&TagRef, u64> = tags.iter().enumerate().map(|(i, tag)| (tag, i as u64)).collect();
        header.tags = tags.clone();

        let (sizes, mut summary) = self.measure(source, &header, &tag_index)?;
        sizes.lay_out(&mut header)?;

        let temp = NamedTempFile::new_in(self.output_dir())
            .map_err(|err| Error::from(err).context(format!("temporary file in {}", self.output_dir().display())))?;
        summary.bytes = self.emit(source, &header, &sizes, &tag_index, &temp)?;
        verify(temp.path(), &header, &sizes)?;

        temp.persist(&self.output)?;
        info!(
            output = self.output.display().to_string(),
            tiles = summary.tiles_written,
            entries = summary.tile_entries_written,
            bytes = summary.bytes;
            "Map file written"
        );
        Ok(summary)
    }

    /// Pass 1.
    fn measure(
        &self,
        source: &impl TileSource,
        header: &MapHeader,
        tag_index: &BTreeMap<&TagRef, u64>,
    ) -> Result<(TileSizeTable, WriteSummary)> {
        let mut summary = WriteSummary::default();
        let mut features = BTreeSet::new();
        let mut intervals = Vec::with_capacity(header.intervals.len());

        for info in &header.intervals {
            let keys = source.tile_keys(info.interval.base)?;
            let mut lengths = Vec::with_capacity(keys.len());
            for key in &keys {
                let tile = source.load_tile(key)?;
                lengths.push(encode_block(&tile, tag_index)?.len() as u64);
                summary.tile_entries_written += tile.entries.len() as u64;
                features.extend(tile.entries.iter().map(|entry| entry.seq));
            }
            summary.tiles_written += keys.len() as u64;
            debug!(zoom = info.interval.base, tiles = keys.len(); "Measured tile blocks");
            intervals.push(IntervalSizes { keys, lengths });
        }
        summary.features_written = features.len() as u64;
        Ok((TileSizeTable { intervals }, summary))
    }

    /// Pass 2. Returns the number of bytes written.
    fn emit(
        &self,
        source: &impl TileSource,
        header: &MapHeader,
        sizes: &TileSizeTable,
        tag_index: &BTreeMap<&TagRef, u64>,
        temp: &NamedTempFile,
    ) -> Result<u64> {
        let mut out = BufWriter::new(temp.as_file());
        let head = header.encode()?;
        out.write_all(&head)?;
        let mut position = head.len() as u64;

        for (info, interval) in header.intervals.iter().zip(sizes.intervals()) {
            if position != info.index_offset {
                return Err(Error::inconsistent(format!(
                    "index of zoom {} planned at {} but starts at {position}",
                    info.interval.base, info.index_offset
                )));
            }
            let mut offset = info.blocks_offset;
            for (key, length) in interval.keys.iter().zip(&interval.lengths) {
                out.write_all(&key.row.to_be_bytes())?;
                out.write_all(&key.col.to_be_bytes())?;
                out.write_all(&offset.to_be_bytes())?;
                offset += length;
            }
            position += interval.keys.len() as u64 * INDEX_ENTRY_LEN;
            let iter: Box<dyn Iterator<Item = usize>> = if self.progress {
                Box::new(tqdm::tqdm(0..interval.keys.len()))
            } else {
                Box::new(0..interval.keys.len())
            };
            for i in iter {
                let key = &interval.keys[i];
                let block = encode_block(&source.load_tile(key)?, tag_index)?;
                if block.len() as u64 != interval.lengths[i] {
                    return Err(Error::inconsistent(format!(
                        "tile {key} encoded to {} bytes, expected {}",
                        block.len(),
                        interval.lengths[i]
                    )));
                }
                out.write_all(&block)?;
                position += block.len() as u64;
            }
        }
        out.flush()?;
        drop(out);
        temp.as_file().sync_all()?;
        Ok(position)
    }
}

/// Re-reads the finished temporary file and compares it with what pass 1 planned.
fn verify(path: &Path, header: &MapHeader, sizes: &TileSizeTable) -> Result<()> {
    let reader = MapReader::open(path).map_err(|err| err.context("self-check"))?;
    if reader.header() != header {
        return Err(Error::inconsistent("self-check: header read back differs from header written"));
    }
    for (i, interval) in sizes.intervals().iter().enumerate() {
        let index = reader.tile_index(i)?;
        let keys: Vec<TileKey> = index.iter().map(|entry| entry.key).collect();
        let lengths: Vec<u64> = index.iter().map(|entry| entry.length).collect();
        if keys != interval.keys || lengths != interval.lengths {
            return Err(Error::inconsistent(format!(
                "self-check: index of zoom {} does not match the size table",
                header.intervals[i].interval.base
            )));
        }
        for entry in &index {
            reader.read_tile(i, entry)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::data::feature::{GeometryKind, Shape};
    use crate::data::tile::TileEntry;
    use crate::data::MicroCoord;
    use crate::errors::ErrorKind;
    use crate::etl::tile_grid::tile_bounds;

    fn tag(code: u16, value: &str) -> TagRef {
        TagRef {
            type_code: code,
            key: "aerialway".to_string(),
            value: value.to_string(),
        }
    }

    fn sample_tiles() -> BTreeMap<TileKey, Tile> {
        let mut tiles = BTreeMap::new();
        for (col, id) in [(7u32, 1u64), (8, 1), (9, 2)] {
            let key = TileKey::new(12, 5, col);
            let b = tile_bounds(&key);
            let mut tile = Tile::new(key);
            tile.entries.push(TileEntry {
                feature_id: id,
                seq: id,
                tag: tag(42, "cable_car"),
                shape: Shape::single(
                    GeometryKind::Line,
                    vec![MicroCoord::new(b.north - 10, b.west + 10), MicroCoord::new(b.south + 5, b.east)],
                ),
            });
            tiles.insert(key, tile);
        }
        let key = TileKey::new(8, 0, 3);
        let b = tile_bounds(&key);
        let mut tile = Tile::new(key);
        tile.entries.push(TileEntry {
            feature_id: 7,
            seq: 3,
            tag: tag(10, "station"),
            shape: Shape::single(GeometryKind::Point, vec![MicroCoord::new(b.north - 100, b.west + 100)]),
        });
        tiles.insert(key, tile);
        tiles
    }

    fn header() -> MapHeader {
        let intervals = [
            ZoomInterval { base: 8, min: 5, max: 9 },
            ZoomInterval { base: 12, min: 10, max: 21 },
        ];
        let bbox = MicroBox {
            south: 47_000_000,
            west: 12_000_000,
            north: 48_000_000,
            east: 13_000_000,
        };
        MapHeader::new(1_700_000_000_000, bbox, 6, "1", &intervals)
    }

    #[test]
    fn offsets_match_first_pass() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("alps.map");
        let tiles = sample_tiles();
        let summary = MapWriter::new(&output, false).write(&tiles, header()).unwrap();
        assert_eq!(summary.tiles_written, 4);
        assert_eq!(summary.tile_entries_written, 4);
        assert_eq!(summary.features_written, 3);
        assert_eq!(summary.bytes, std::fs::metadata(&output).unwrap().len());

        let reader = MapReader::open(&output).unwrap();
        let codes: Vec<u16> = reader.header().tags.iter().map(|t| t.type_code).collect();
        assert_eq!(codes, vec![10, 42]);

        let tag_table = reader.header().tags.clone();
        let tag_index: BTreeMap<&TagRef, u64> = tag_table.iter().enumerate().map(|(i, t)| (t, i as u64)).collect();
        for (i, info) in reader.header().intervals.iter().enumerate() {
            let index = reader.tile_index(i).unwrap();
            assert_eq!(index.len() as u32, info.tile_count);
            let mut expected_offset = info.blocks_offset;
            for entry in &index {
                let block = encode_block(&tiles[&entry.key], &tag_index).unwrap();
                assert_eq!(entry.offset, expected_offset);
                assert_eq!(entry.length, block.len() as u64);
                expected_offset += entry.length;

                let decoded = reader.read_tile(i, entry).unwrap();
                assert_eq!(decoded.entries.len(), 1);
                assert_eq!(decoded.entries[0].parts, tiles[&entry.key].entries[0].shape.parts);
            }
            assert_eq!(expected_offset, info.blocks_offset + info.blocks_length);
        }
    }

    #[test]
    fn identical_input_gives_identical_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("a.map");
        let second = dir.path().join("b.map");
        MapWriter::new(&first, false).write(&sample_tiles(), header()).unwrap();
        MapWriter::new(&second, false).write(&sample_tiles(), header()).unwrap();
        assert_eq!(std::fs::read(first).unwrap(), std::fs::read(second).unwrap());
    }

    /// Returns a different tile the second time a key is loaded.
    struct DriftingSource {
        tiles: BTreeMap<TileKey, Tile>,
        loads: Cell<usize>,
    }

    impl TileSource for DriftingSource {
        fn tile_keys(&self, zoom: u8) -> Result<Vec<TileKey>> {
            self.tiles.tile_keys(zoom)
        }

        fn tags(&self) -> Result<Vec<TagRef>> {
            self.tiles.tags()
        }

        fn load_tile(&self, key: &TileKey) -> Result<Tile> {
            self.loads.set(self.loads.get() + 1);
            let mut tile = self.tiles.load_tile(key)?;
            if self.loads.get() > self.tiles.len() {
                let mut extra = tile.entries[0].clone();
                extra.feature_id += 1000;
                tile.entries.push(extra);
            }
            Ok(tile)
        }
    }

    #[test]
    fn size_mismatch_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("alps.map");
        let source = DriftingSource {
            tiles: sample_tiles(),
            loads: Cell::new(0),
        };
        let err = MapWriter::new(&output, false).write(&source, header()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InconsistentIndex);
        assert!(!output.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn header_length_counts_bytes_after_the_field() {
        let bytes = header().encode().unwrap();
        let declared = u32::from_be_bytes(bytes[10..14].try_into().unwrap()) as usize;
        assert_eq!(declared, bytes.len() - HEADER_PREFIX_LEN);
        assert_eq!(&bytes[..8], MAGIC);
    }
}
