use geo::Geometry;
use serde::Serialize;

use super::{MicroBox, MicroCoord};
use crate::etl::tag_mapping::Resolution;

pub type FeatureId = u64;

/// One real-world entity as delivered by the input reader.
#[derive(Debug, Clone)]
pub struct Feature {
    pub id: FeatureId,
    /// x is longitude, y is latitude.
    pub geometry: Geometry<f64>,
    pub tags: Vec<(String, String)>,
    pub resolved: Option<Resolution>,
}

impl Feature {
    pub fn new(id: FeatureId, geometry: impl Into<Geometry<f64>>, tags: Vec<(String, String)>) -> Self {
        Feature {
            id,
            geometry: geometry.into(),
            tags,
            resolved: None,
        }
    }

    /// Convenience for building tag lists from literals.
    pub fn with_tags(id: FeatureId, geometry: impl Into<Geometry<f64>>, tags: &[(&str, &str)]) -> Self {
        Feature::new(
            id,
            geometry,
            tags.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        )
    }

    /// Turns a closed way read as an area back into a line, for rings that only
    /// line rules match. Features tagged `area=yes` stay areas.
    pub fn ring_to_line(&mut self) -> bool {
        if self.tags.iter().any(|(k, v)| k == "area" && v == "yes") {
            return false;
        }
        match &self.geometry {
            Geometry::Polygon(polygon) => {
                self.geometry = Geometry::LineString(polygon.exterior().clone());
                true
            }
            _ => false,
        }
    }

    /// The kind of shape this feature normalizes to, if its geometry type is supported.
    pub fn kind(&self) -> Option<GeometryKind> {
        match &self.geometry {
            Geometry::Point(_) => Some(GeometryKind::Point),
            Geometry::MultiPoint(points) if points.0.len() == 1 => Some(GeometryKind::Point),
            Geometry::LineString(_) => Some(GeometryKind::Line),
            Geometry::MultiLineString(lines) if lines.0.len() == 1 => Some(GeometryKind::Line),
            Geometry::Polygon(_) => Some(GeometryKind::Polygon),
            _ => None,
        }
    }
}

#[derive(rkyv::Archive, rkyv::Deserialize, rkyv::Serialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[archive(check_bytes)]
pub enum GeometryKind {
    Point,
    Line,
    Polygon,
}

impl GeometryKind {
    pub fn code(self) -> u8 {
        match self {
            GeometryKind::Point => 0,
            GeometryKind::Line => 1,
            GeometryKind::Polygon => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<GeometryKind> {
        match code {
            0 => Some(GeometryKind::Point),
            1 => Some(GeometryKind::Line),
            2 => Some(GeometryKind::Polygon),
            _ => None,
        }
    }
}

/// Normalized geometry on the microdegree grid.
///
/// Freshly normalized shapes have exactly one part. Copies clipped to a tile can
/// have several, e.g. a line that leaves a tile and comes back.
#[derive(rkyv::Archive, rkyv::Deserialize, rkyv::Serialize, Debug, Clone, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct Shape {
    pub kind: GeometryKind,
    pub parts: Vec<Vec<MicroCoord>>,
}

impl Shape {
    pub fn single(kind: GeometryKind, points: Vec<MicroCoord>) -> Self {
        Shape {
            kind,
            parts: vec![points],
        }
    }

    pub fn points(&self) -> impl Iterator<Item = &MicroCoord> {
        self.parts.iter().flatten()
    }

    pub fn envelope(&self) -> Option<MicroBox> {
        MicroBox::of_points(self.points())
    }

    pub fn point_count(&self) -> usize {
        self.parts.iter().map(Vec::len).sum()
    }
}
