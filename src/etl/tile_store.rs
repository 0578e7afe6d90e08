//! Sharded in-memory tile store with a disk staging file for flushed tiles.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use log::debug;
use rkyv::AlignedVec;

use crate::data::tile::{TagRef, Tile, TileEntry, TileKey};
use crate::errors::{Error, ErrorKind, Result};
use crate::etl::tile_grid::tile_bounds;

/// Read access to finished tiles, as needed by the map writer.
pub trait TileSource {
    /// Keys of all non-empty tiles at `zoom`, ordered by (row, col).
    fn tile_keys(&self, zoom: u8) -> Result<Vec<TileKey>>;

    /// Every distinct tag referenced by any entry, sorted.
    fn tags(&self) -> Result<Vec<TagRef>>;

    /// The complete tile with entries in serialization order.
    fn load_tile(&self, key: &TileKey) -> Result<Tile>;
}

impl TileSource for BTreeMap<TileKey, Tile> {
    fn tile_keys(&self, zoom: u8) -> Result<Vec<TileKey>> {
        Ok(self
            .iter()
            .filter(|(key, tile)| key.zoom == zoom && !tile.entries.is_empty())
            .map(|(key, _)| *key)
            .collect())
    }

    fn tags(&self) -> Result<Vec<TagRef>> {
        let tags: BTreeSet<&TagRef> = self.values().flat_map(|tile| &tile.entries).map(|e| &e.tag).collect();
        Ok(tags.into_iter().cloned().collect())
    }

    fn load_tile(&self, key: &TileKey) -> Result<Tile> {
        let mut tile = self
            .get(key)
            .cloned()
            .ok_or_else(|| Error::inconsistent(format!("no tile {key}")))?;
        tile.sort_entries();
        Ok(tile)
    }
}

#[derive(Default)]
struct Shard {
    tiles: BTreeMap<TileKey, Tile>,
    tags: BTreeSet<TagRef>,
}

struct SpillRecord {
    offset: u64,
    len: usize,
}

struct Staging {
    file: File,
    end: u64,
    records: BTreeMap<TileKey, Vec<SpillRecord>>,
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| Error::new(ErrorKind::InconsistentIndex, "tile store lock poisoned by a panicked worker"))
}

pub struct TileStore {
    shards: Vec<Mutex<Shard>>,
    staging: Mutex<Staging>,
}

impl TileStore {
    /// Creates a store whose staging file lives in `staging_dir`. The file is
    /// anonymous and disappears when the store is dropped.
    pub fn new(shards: usize, staging_dir: &Path) -> Result<TileStore> {
        let file = tempfile::tempfile_in(staging_dir)
            .map_err(|err| Error::from(err).context(format!("staging file in {}", staging_dir.display())))?;
        Ok(TileStore {
            shards: (0..shards.max(1)).map(|_| Mutex::new(Shard::default())).collect(),
            staging: Mutex::new(Staging {
                file,
                end: 0,
                records: BTreeMap::new(),
            }),
        })
    }

    fn shard_of(&self, key: &TileKey) -> &Mutex<Shard> {
        let mixed = u64::from(key.row)
            .wrapping_mul(31)
            .wrapping_add(u64::from(key.col))
            .wrapping_mul(31)
            .wrapping_add(u64::from(key.zoom));
        &self.shards[(mixed % self.shards.len() as u64) as usize]
    }

    pub fn insert(&self, key: TileKey, entry: TileEntry) -> Result<()> {
        let mut shard = lock(self.shard_of(&key))?;
        if !shard.tags.contains(&entry.tag) {
            shard.tags.insert(entry.tag.clone());
        }
        shard
            .tiles
            .entry(key)
            .or_insert_with(|| Tile::new(key))
            .entries
            .push(entry);
        Ok(())
    }

    /// Moves every resident tile whose southern edge lies strictly north of
    /// `frontier` (microdegrees) to the staging file. Returns the number of
    /// tiles moved.
    pub fn flush_north_of(&self, frontier: i32) -> Result<usize> {
        let mut flushed = 0;
        for shard in &self.shards {
            let done: Vec<Tile> = {
                let mut shard = lock(shard)?;
                let keys: Vec<TileKey> = shard
                    .tiles
                    .keys()
                    .filter(|key| tile_bounds(key).south > frontier)
                    .copied()
                    .collect();
                keys.iter().filter_map(|key| shard.tiles.remove(key)).collect()
            };
            if done.is_empty() {
                continue;
            }
            let mut staging = lock(&self.staging)?;
            for tile in done {
                stage(&mut staging, &tile)?;
                flushed += 1;
            }
        }
        if flushed > 0 {
            debug!(tiles = flushed, frontier = frontier; "Flushed tiles to staging");
        }
        Ok(flushed)
    }

    pub fn resident_tiles(&self) -> Result<usize> {
        let mut count = 0;
        for shard in &self.shards {
            count += lock(shard)?.tiles.len();
        }
        Ok(count)
    }

    /// Distinct tiles with at least one fragment on disk.
    pub fn staged_tiles(&self) -> Result<usize> {
        Ok(lock(&self.staging)?.records.len())
    }
}

fn stage(staging: &mut Staging, tile: &Tile) -> Result<()> {
    let bytes = rkyv::to_bytes::<_, 1024>(tile)
        .map_err(|err| Error::new(ErrorKind::IoFailure, format!("cannot serialize tile {}: {err:?}", tile.key)))?;
    let offset = staging.end;
    staging.file.seek(SeekFrom::Start(offset))?;
    staging.file.write_all(&bytes)?;
    staging.end += bytes.len() as u64;
    staging.records.entry(tile.key).or_default().push(SpillRecord {
        offset,
        len: bytes.len(),
    });
    Ok(())
}

fn unstage(staging: &mut Staging, record: &SpillRecord) -> Result<Tile> {
    let mut buf = vec![0u8; record.len];
    staging.file.seek(SeekFrom::Start(record.offset))?;
    staging.file.read_exact(&mut buf)?;

    let mut aligned = AlignedVec::with_capacity(buf.len());
    aligned.extend_from_slice(&buf);
    rkyv::from_bytes::<Tile>(&aligned).map_err(|err| {
        Error::inconsistent(format!("staged tile at offset {} is corrupt: {err:?}", record.offset))
    })
}

impl TileSource for TileStore {
    fn tile_keys(&self, zoom: u8) -> Result<Vec<TileKey>> {
        let mut keys: BTreeSet<TileKey> = BTreeSet::new();
        for shard in &self.shards {
            keys.extend(lock(shard)?.tiles.keys().filter(|key| key.zoom == zoom));
        }
        keys.extend(lock(&self.staging)?.records.keys().filter(|key| key.zoom == zoom));
        Ok(keys.into_iter().collect())
    }

    fn tags(&self) -> Result<Vec<TagRef>> {
        let mut tags = BTreeSet::new();
        for shard in &self.shards {
            tags.extend(lock(shard)?.tags.iter().cloned());
        }
        Ok(tags.into_iter().collect())
    }

    fn load_tile(&self, key: &TileKey) -> Result<Tile> {
        let mut tile = Tile::new(*key);
        let mut found = false;
        {
            let mut staging = lock(&self.staging)?;
            let records: Vec<(u64, usize)> = staging
                .records
                .get(key)
                .map(|records| records.iter().map(|r| (r.offset, r.len)).collect())
                .unwrap_or_default();
            for (offset, len) in records {
                let fragment = unstage(&mut staging, &SpillRecord { offset, len })?;
                tile.merge(fragment);
                found = true;
            }
        }
        if let Some(resident) = lock(self.shard_of(key))?.tiles.get(key) {
            tile.entries.extend(resident.entries.iter().cloned());
            found = true;
        }
        if !found {
            return Err(Error::inconsistent(format!("no tile {key} in store")));
        }
        tile.sort_entries();
        Ok(tile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::feature::{GeometryKind, Shape};
    use crate::data::MicroCoord;
    use crate::etl::tile_grid::row_north;

    fn entry(feature_id: u64, seq: u64, code: u16) -> TileEntry {
        TileEntry {
            feature_id,
            seq,
            tag: TagRef {
                type_code: code,
                key: "aerialway".to_string(),
                value: format!("v{code}"),
            },
            shape: Shape::single(GeometryKind::Point, vec![MicroCoord::new(47_000_000, 12_000_000)]),
        }
    }

    #[test]
    fn merges_entries_and_tags_across_shards() {
        let dir = tempfile::tempdir().unwrap();
        let store = TileStore::new(4, dir.path()).unwrap();
        let a = TileKey::new(12, 5, 7);
        let b = TileKey::new(12, 5, 8);
        store.insert(a, entry(9, 2, 42)).unwrap();
        store.insert(b, entry(9, 2, 42)).unwrap();
        store.insert(a, entry(3, 1, 10)).unwrap();
        store.insert(TileKey::new(8, 1, 1), entry(4, 0, 10)).unwrap();

        assert_eq!(store.tile_keys(12).unwrap(), vec![a, b]);
        assert_eq!(store.tile_keys(8).unwrap().len(), 1);
        let codes: Vec<u16> = store.tags().unwrap().iter().map(|t| t.type_code).collect();
        assert_eq!(codes, vec![10, 42]);

        let tile = store.load_tile(&a).unwrap();
        let ids: Vec<u64> = tile.entries.iter().map(|e| e.feature_id).collect();
        assert_eq!(ids, vec![3, 9]);
        assert!(store.load_tile(&TileKey::new(12, 0, 0)).is_err());
    }

    #[test]
    fn flushed_tiles_come_back_with_late_fragments() {
        let dir = tempfile::tempdir().unwrap();
        let store = TileStore::new(2, dir.path()).unwrap();
        let north = TileKey::new(10, 100, 7);
        let south = TileKey::new(10, 200, 7);
        store.insert(north, entry(5, 5, 10)).unwrap();
        store.insert(south, entry(6, 6, 10)).unwrap();

        // sweep line between the two tiles
        let frontier = row_north(10, 150);
        assert_eq!(store.flush_north_of(frontier).unwrap(), 1);
        assert_eq!(store.resident_tiles().unwrap(), 1);
        assert_eq!(store.staged_tiles().unwrap(), 1);

        // a feature arriving out of order still lands in the flushed tile
        store.insert(north, entry(1, 7, 10)).unwrap();
        assert_eq!(store.flush_north_of(frontier).unwrap(), 1);
        store.insert(north, entry(8, 8, 10)).unwrap();

        let tile = store.load_tile(&north).unwrap();
        let ids: Vec<u64> = tile.entries.iter().map(|e| e.feature_id).collect();
        assert_eq!(ids, vec![1, 5, 8]);
        assert_eq!(store.tile_keys(10).unwrap(), vec![north, south]);
        assert_eq!(store.load_tile(&south).unwrap().entries.len(), 1);
    }

    #[test]
    fn map_source_sorts_entries() {
        let key = TileKey::new(3, 1, 2);
        let mut tile = Tile::new(key);
        tile.entries.push(entry(2, 1, 40));
        tile.entries.push(entry(1, 0, 42));
        let source = BTreeMap::from([(key, tile)]);
        let loaded = source.load_tile(&key).unwrap();
        assert_eq!(loaded.entries[0].feature_id, 1);
        assert_eq!(source.tags().unwrap().len(), 2);
        assert!(source.tile_keys(4).unwrap().is_empty());
    }
}
