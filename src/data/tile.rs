use std::fmt;

use super::feature::{FeatureId, Shape};

/// Address of a tile in the Web Mercator grid. Rows grow southwards, columns
/// eastwards.
#[derive(rkyv::Archive, rkyv::Deserialize, rkyv::Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[archive(check_bytes)]
pub struct TileKey {
    pub zoom: u8,
    pub row: u32,
    pub col: u32,
}

impl TileKey {
    pub fn new(zoom: u8, row: u32, col: u32) -> Self {
        TileKey { zoom, row, col }
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{},{})", self.zoom, self.row, self.col)
    }
}

/// The tag that made a feature visible: its type code and the OSM pair that
/// matched. Entries of the artifact's tag table.
#[derive(rkyv::Archive, rkyv::Deserialize, rkyv::Serialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[archive(check_bytes)]
pub struct TagRef {
    pub type_code: u16,
    pub key: String,
    pub value: String,
}

/// A feature's copy clipped to one tile.
#[derive(rkyv::Archive, rkyv::Deserialize, rkyv::Serialize, Debug, Clone, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct TileEntry {
    pub feature_id: FeatureId,
    /// Position of the feature in the input stream, breaks ties between equal ids.
    pub seq: u64,
    pub tag: TagRef,
    pub shape: Shape,
}

#[derive(rkyv::Archive, rkyv::Deserialize, rkyv::Serialize, Debug, Clone, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct Tile {
    pub key: TileKey,
    pub entries: Vec<TileEntry>,
}

impl Tile {
    pub fn new(key: TileKey) -> Self {
        Tile {
            key,
            entries: Vec::new(),
        }
    }

    /// Puts entries into serialization order, independent of insertion order.
    pub fn sort_entries(&mut self) {
        self.entries.sort_by_key(|entry| (entry.feature_id, entry.seq));
    }

    /// Appends the entries of another fragment of the same tile.
    pub fn merge(&mut self, other: Tile) {
        debug_assert_eq!(self.key, other.key);
        self.entries.extend(other.entries);
    }
}
