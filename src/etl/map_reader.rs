//! Reader of the tiled binary map file. Used by the writer's self-check and by
//! anyone who wants to inspect an artifact.

use std::fs;
use std::path::Path;

use crate::config::ZoomInterval;
use crate::data::feature::{FeatureId, GeometryKind};
use crate::data::tile::{TagRef, TileKey};
use crate::data::{MicroBox, MicroCoord};
use crate::errors::{Error, Result};
use crate::etl::encoding::ByteReader;
use crate::etl::map_writer::{IntervalInfo, MapHeader, FORMAT_VERSION, HEADER_PREFIX_LEN, INDEX_ENTRY_LEN, MAGIC};
use crate::etl::tile_grid::tile_origin;

/// Location of one tile block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub key: TileKey,
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedEntry {
    pub feature_id: FeatureId,
    pub tag: TagRef,
    pub kind: GeometryKind,
    pub parts: Vec<Vec<MicroCoord>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedTile {
    pub key: TileKey,
    pub entries: Vec<DecodedEntry>,
}

pub struct MapReader {
    data: Vec<u8>,
    header: MapHeader,
}

impl MapHeader {
    fn read(reader: &mut ByteReader) -> Result<MapHeader> {
        if reader.bytes(MAGIC.len())? != MAGIC {
            return Err(Error::inconsistent("not a lifty map file"));
        }
        let version = reader.u16()?;
        if version != FORMAT_VERSION {
            return Err(Error::inconsistent(format!("unsupported format version {version}")));
        }
        let header_len = reader.u32()? as usize;

        let created_ms = reader.i64()?;
        let bbox = MicroBox {
            south: reader.i32()?,
            west: reader.i32()?,
            north: reader.i32()?,
            east: reader.i32()?,
        };
        let precision = reader.u8()?;
        let mapping_version = reader.string()?;
        let writer = reader.string()?;

        let tag_count = reader.vu()?;
        let mut tags = Vec::new();
        for _ in 0..tag_count {
            tags.push(TagRef {
                type_code: reader.u16()?,
                key: reader.string()?,
                value: reader.string()?,
            });
        }

        let interval_count = reader.u8()?;
        let mut intervals = Vec::with_capacity(interval_count as usize);
        for _ in 0..interval_count {
            intervals.push(IntervalInfo {
                interval: ZoomInterval {
                    base: reader.u8()?,
                    min: reader.u8()?,
                    max: reader.u8()?,
                },
                tile_count: reader.u32()?,
                index_offset: reader.u64()?,
                blocks_offset: reader.u64()?,
                blocks_length: reader.u64()?,
            });
        }

        if reader.position() != HEADER_PREFIX_LEN + header_len {
            return Err(Error::inconsistent(format!(
                "header declares {header_len} bytes but holds {}",
                reader.position() - HEADER_PREFIX_LEN
            )));
        }
        Ok(MapHeader {
            created_ms,
            bbox,
            precision,
            mapping_version,
            writer,
            tags,
            intervals,
        })
    }
}

impl MapReader {
    pub fn open(path: &Path) -> Result<MapReader> {
        let data = fs::read(path).map_err(|err| Error::from(err).context(path.display()))?;
        MapReader::from_bytes(data)
    }

    /// Parses the header and checks that the sections tile the file exactly.
    pub fn from_bytes(data: Vec<u8>) -> Result<MapReader> {
        let mut reader = ByteReader::new(&data);
        let header = MapHeader::read(&mut reader)?;
        let mut cursor = reader.position() as u64;
        for info in &header.intervals {
            if info.index_offset != cursor {
                return Err(Error::inconsistent(format!(
                    "index of zoom {} at {} but previous section ends at {cursor}",
                    info.interval.base, info.index_offset
                )));
            }
            let blocks_offset = info.index_offset + u64::from(info.tile_count) * INDEX_ENTRY_LEN;
            if info.blocks_offset != blocks_offset {
                return Err(Error::inconsistent(format!(
                    "blocks of zoom {} at {} but index ends at {blocks_offset}",
                    info.interval.base, info.blocks_offset
                )));
            }
            cursor = info.blocks_offset + info.blocks_length;
        }
        if cursor != data.len() as u64 {
            return Err(Error::inconsistent(format!(
                "sections end at {cursor} but the file has {} bytes",
                data.len()
            )));
        }
        Ok(MapReader { data, header })
    }

    pub fn header(&self) -> &MapHeader {
        &self.header
    }

    pub fn tile_index(&self, interval: usize) -> Result<Vec<IndexEntry>> {
        let info = self
            .header
            .intervals
            .get(interval)
            .ok_or_else(|| Error::inconsistent(format!("no zoom interval #{interval}")))?;
        let mut reader = ByteReader::at(&self.data, usize::try_from(info.index_offset)?);
        let mut raw = Vec::with_capacity(info.tile_count as usize);
        for _ in 0..info.tile_count {
            let row = reader.u32()?;
            let col = reader.u32()?;
            raw.push((TileKey::new(info.interval.base, row, col), reader.u64()?));
        }

        let blocks_end = info.blocks_offset + info.blocks_length;
        let mut entries = Vec::with_capacity(raw.len());
        let mut expected = info.blocks_offset;
        for (i, (key, offset)) in raw.iter().enumerate() {
            if *offset != expected {
                return Err(Error::inconsistent(format!("tile {key} at {offset}, expected {expected}")));
            }
            let end = raw.get(i + 1).map(|(_, next)| *next).unwrap_or(blocks_end);
            if end < *offset || end > blocks_end {
                return Err(Error::inconsistent(format!("tile {key} ends at {end}, outside its blocks")));
            }
            if i > 0 && raw[i - 1].0 >= *key {
                return Err(Error::inconsistent(format!("tile {key} out of order in index")));
            }
            entries.push(IndexEntry {
                key: *key,
                offset: *offset,
                length: end - offset,
            });
            expected = end;
        }
        if expected != blocks_end {
            return Err(Error::inconsistent(format!(
                "zoom {} blocks end at {expected}, header says {blocks_end}",
                info.interval.base
            )));
        }
        Ok(entries)
    }

    pub fn read_tile(&self, interval: usize, entry: &IndexEntry) -> Result<DecodedTile> {
        let start = usize::try_from(entry.offset)?;
        let block = ByteReader::at(&self.data, start).bytes(usize::try_from(entry.length)?)?;
        let mut reader = ByteReader::new(block);
        let origin = tile_origin(&entry.key);

        let count = reader.vu()?;
        let mut entries = Vec::new();
        for _ in 0..count {
            let feature_id = reader.vu()?;
            let tag_index = usize::try_from(reader.vu()?)?;
            let tag = self.header.tags.get(tag_index).cloned().ok_or_else(|| {
                Error::inconsistent(format!("tile {} refers to missing tag #{tag_index}", entry.key))
            })?;
            let code = reader.u8()?;
            let kind = GeometryKind::from_code(code)
                .ok_or_else(|| Error::inconsistent(format!("unknown geometry kind {code}")))?;

            let part_count = reader.vu()?;
            let mut parts = Vec::new();
            for _ in 0..part_count {
                let point_count = reader.vu()?;
                let mut previous = origin;
                let mut part = Vec::new();
                for _ in 0..point_count {
                    let lat = i64::from(previous.lat) + reader.vs()?;
                    let lon = i64::from(previous.lon) + reader.vs()?;
                    previous = MicroCoord::new(i32::try_from(lat)?, i32::try_from(lon)?);
                    part.push(previous);
                }
                parts.push(part);
            }
            entries.push(DecodedEntry {
                feature_id,
                tag,
                kind,
                parts,
            });
        }
        if reader.remaining() != 0 {
            return Err(Error::inconsistent(format!(
                "tile {} (zoom interval #{interval}) has {} trailing bytes",
                entry.key,
                reader.remaining()
            )));
        }
        Ok(DecodedTile {
            key: entry.key,
            entries,
        })
    }

    /// All tiles of one zoom interval, decoded.
    pub fn tiles(&self, interval: usize) -> Result<Vec<DecodedTile>> {
        self.tile_index(interval)?
            .iter()
            .map(|entry| self.read_tile(interval, entry))
            .collect()
    }
}
