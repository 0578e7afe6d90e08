//! Streaming reader turning an OSM XML extract into features.
//!
//! Tagged nodes become points. Open ways become lines, closed ways become
//! polygons unless tagged `area=no`. Relations are skipped.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::str;

use geo::{Coord, LineString, Point, Polygon};
use log::{debug, warn};
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use xz::bufread::XzDecoder;

use crate::data::feature::{Feature, FeatureId};
use crate::errors::{Error, Result};

struct PendingNode {
    id: FeatureId,
    coord: Coord<f64>,
    tags: Vec<(String, String)>,
}

struct PendingWay {
    id: FeatureId,
    refs: Vec<u64>,
    tags: Vec<(String, String)>,
}

enum ParserState {
    Top,
    Node(PendingNode),
    Way(PendingWay),
    /// Inside a relation or an element that failed to parse.
    Skipping,
}

/// One XML event, detached from the reader's buffer.
enum Step {
    Open { element: Element, empty: bool },
    Close(Vec<u8>),
    Eof,
    Ignore,
}

enum Element {
    Node(Result<PendingNode>),
    Way(Result<FeatureId>),
    Tag(Result<(String, String)>),
    Nd(Result<u64>),
    Relation,
    Other,
}

pub struct OsmXmlSource<R: BufRead> {
    reader: Reader<R>,
    buf: Vec<u8>,
    nodes: HashMap<u64, Coord<f64>>,
    state: ParserState,
    finished: bool,
}

impl OsmXmlSource<Box<dyn BufRead>> {
    /// Opens `.osm` files, or `.osm.xz` files decompressed on the fly.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|err| Error::from(err).context(path.display()))?;
        let file_reader = BufReader::new(file);
        let input: Box<dyn BufRead> = if path.extension().is_some_and(|ext| ext == "xz") {
            Box::new(BufReader::new(XzDecoder::new(file_reader)))
        } else {
            Box::new(file_reader)
        };
        Ok(OsmXmlSource::from_reader(input))
    }
}

impl<R: BufRead> OsmXmlSource<R> {
    pub fn from_reader(input: R) -> Self {
        let mut reader = Reader::from_reader(input);
        reader.trim_text(true);
        OsmXmlSource {
            reader,
            buf: Vec::new(),
            nodes: HashMap::new(),
            state: ParserState::Top,
            finished: false,
        }
    }

    fn parse_node(el: &BytesStart) -> Result<PendingNode> {
        let mut id: Option<u64> = None;
        let mut lat: Option<f64> = None;
        let mut lon: Option<f64> = None;

        for attribute_res in el.attributes() {
            let attribute = attribute_res?;
            match attribute.key.as_ref() {
                b"id" => id = Some(str::from_utf8(&attribute.value)?.parse()?),
                b"lat" => lat = Some(str::from_utf8(&attribute.value)?.parse()?),
                b"lon" => lon = Some(str::from_utf8(&attribute.value)?.parse()?),
                _ => (),
            }
        }

        match (id, lat, lon) {
            (Some(id), Some(lat), Some(lon)) => Ok(PendingNode {
                id,
                coord: Coord { x: lon, y: lat },
                tags: Vec::new(),
            }),
            _ => Err(Error::input("node without id, lat or lon")),
        }
    }

    fn attribute(el: &BytesStart, name: &str) -> Result<String> {
        let attribute = el
            .try_get_attribute(name)?
            .ok_or_else(|| Error::input(format!("missing attribute {name}")))?;
        Ok(attribute.unescape_value()?.into_owned())
    }

    fn element(el: &BytesStart) -> Element {
        match el.name().as_ref() {
            b"node" => Element::Node(Self::parse_node(el)),
            b"way" => Element::Way(Self::attribute(el, "id").and_then(|id| Ok(id.parse()?))),
            b"tag" => Element::Tag(Self::attribute(el, "k").and_then(|k| Ok((k, Self::attribute(el, "v")?)))),
            b"nd" => Element::Nd(Self::attribute(el, "ref").and_then(|r| Ok(r.parse()?))),
            b"relation" => Element::Relation,
            _ => Element::Other,
        }
    }

    fn read_step(&mut self) -> Result<Step> {
        let step = match self.reader.read_event_into(&mut self.buf)? {
            Event::Eof => Step::Eof,
            Event::Start(e) => Step::Open {
                element: Self::element(&e),
                empty: false,
            },
            Event::Empty(e) => Step::Open {
                element: Self::element(&e),
                empty: true,
            },
            Event::End(e) => Step::Close(e.name().as_ref().to_vec()),
            _ => Step::Ignore,
        };
        // nothing borrows the buffer past this point
        self.buf.clear();
        Ok(step)
    }

    fn finish_node(&mut self, node: PendingNode) -> Option<Feature> {
        self.nodes.insert(node.id, node.coord);
        if node.tags.is_empty() {
            return None;
        }
        Some(Feature::new(node.id, Point(node.coord), node.tags))
    }

    fn finish_way(&self, way: PendingWay) -> Option<Feature> {
        if way.tags.is_empty() {
            return None;
        }
        let mut coords = Vec::with_capacity(way.refs.len());
        for node_ref in &way.refs {
            match self.nodes.get(node_ref) {
                Some(coord) => coords.push(*coord),
                None => {
                    warn!(way_id = way.id, node_id = *node_ref; "Skipping way referencing unknown node");
                    return None;
                }
            }
        }
        let closed = way.refs.len() >= 4 && way.refs.first() == way.refs.last();
        let not_area = way.tags.iter().any(|(k, v)| k == "area" && v == "no");
        let line = LineString::new(coords);
        if closed && !not_area {
            Some(Feature::new(way.id, Polygon::new(line, vec![]), way.tags))
        } else {
            Some(Feature::new(way.id, line, way.tags))
        }
    }

    fn at_top(&self) -> bool {
        matches!(self.state, ParserState::Top)
    }

    fn skip_malformed(&mut self, err: Error, empty: bool) {
        warn!(err = err.message; "Skipping malformed element");
        if !empty {
            self.state = ParserState::Skipping;
        }
    }

    fn open_element(&mut self, element: Element, empty: bool) -> Option<Feature> {
        match element {
            Element::Node(node) if self.at_top() => match node {
                Ok(node) if empty => return self.finish_node(node),
                Ok(node) => self.state = ParserState::Node(node),
                Err(err) => self.skip_malformed(err, empty),
            },
            Element::Way(id) if self.at_top() => match id {
                Ok(id) if !empty => {
                    self.state = ParserState::Way(PendingWay {
                        id,
                        refs: Vec::new(),
                        tags: Vec::new(),
                    })
                }
                Ok(_) => (),
                Err(err) => self.skip_malformed(err, empty),
            },
            Element::Relation if self.at_top() && !empty => self.state = ParserState::Skipping,
            Element::Tag(tag) => match (&mut self.state, tag) {
                (ParserState::Node(PendingNode { tags, .. }) | ParserState::Way(PendingWay { tags, .. }), Ok(tag)) => {
                    tags.push(tag)
                }
                (ParserState::Node(_) | ParserState::Way(_), Err(err)) => {
                    warn!(err = err.message; "Skipping malformed tag")
                }
                _ => (),
            },
            Element::Nd(node_ref) => {
                let mut broken = false;
                if let ParserState::Way(way) = &mut self.state {
                    match node_ref {
                        Ok(node_ref) => way.refs.push(node_ref),
                        Err(err) => {
                            warn!(way_id = way.id, err = err.message; "Skipping way with malformed node reference");
                            broken = true;
                        }
                    }
                }
                if broken {
                    self.state = ParserState::Skipping;
                }
            }
            _ => (),
        }
        None
    }

    fn close_element(&mut self, name: &[u8]) -> Option<Feature> {
        match name {
            b"node" | b"way" | b"relation" => {
                match std::mem::replace(&mut self.state, ParserState::Top) {
                    ParserState::Node(node) => self.finish_node(node),
                    ParserState::Way(way) => self.finish_way(way),
                    _ => None,
                }
            }
            _ => None,
        }
    }
}

impl<R: BufRead> Iterator for OsmXmlSource<R> {
    type Item = Result<Feature>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.finished {
            let step = match self.read_step() {
                Ok(step) => step,
                Err(err) => {
                    self.finished = true;
                    return Some(Err(err.context(format!("XML at byte {}", self.reader.buffer_position()))));
                }
            };
            let feature = match step {
                Step::Open { element, empty } => self.open_element(element, empty),
                Step::Close(name) => self.close_element(&name),
                Step::Eof => {
                    debug!(nodes = self.nodes.len(); "Reached end of OSM input");
                    self.finished = true;
                    None
                }
                Step::Ignore => None,
            };
            if let Some(feature) = feature {
                return Some(Ok(feature));
            }
        }
        None
    }
}
