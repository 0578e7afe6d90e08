pub mod feature;
pub mod tile;

/// Fixed-point scale of all stored coordinates: one unit is a microdegree.
pub const MICRO: f64 = 1_000_000.0;

/// A coordinate snapped to the microdegree grid.
#[derive(rkyv::Archive, rkyv::Deserialize, rkyv::Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[archive(check_bytes)]
pub struct MicroCoord {
    pub lat: i32,
    pub lon: i32,
}

impl MicroCoord {
    pub fn new(lat: i32, lon: i32) -> Self {
        MicroCoord { lat, lon }
    }

    pub fn from_degrees(lat: f64, lon: f64) -> Self {
        MicroCoord {
            lat: (lat * MICRO).round() as i32,
            lon: (lon * MICRO).round() as i32,
        }
    }
}

/// Axis-aligned rectangle in microdegrees, edges included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MicroBox {
    pub south: i32,
    pub west: i32,
    pub north: i32,
    pub east: i32,
}

impl MicroBox {
    pub fn of_points<'a>(points: impl IntoIterator<Item = &'a MicroCoord>) -> Option<MicroBox> {
        let mut iter = points.into_iter();
        let first = iter.next()?;
        let mut bbox = MicroBox {
            south: first.lat,
            west: first.lon,
            north: first.lat,
            east: first.lon,
        };
        for point in iter {
            bbox.south = bbox.south.min(point.lat);
            bbox.north = bbox.north.max(point.lat);
            bbox.west = bbox.west.min(point.lon);
            bbox.east = bbox.east.max(point.lon);
        }
        Some(bbox)
    }

    pub fn intersects(&self, other: &MicroBox) -> bool {
        self.west <= other.east
            && other.west <= self.east
            && self.south <= other.north
            && other.south <= self.north
    }
}
