use std::{fs, path::Path, str};

use log::{debug, info};
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use regex::Regex;

use crate::data::feature::GeometryKind;
use crate::data::tile::TagRef;
use crate::errors::{Error, Result};
use crate::etl::tile_grid::MAX_ZOOM;

pub const WILDCARD: &str = "*";

/// Which kind of feature a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureClass {
    Point,
    Line,
    Area,
}

impl FeatureClass {
    fn from_section(name: &[u8]) -> Option<FeatureClass> {
        match name {
            b"points" => Some(FeatureClass::Point),
            b"lines" => Some(FeatureClass::Line),
            b"areas" => Some(FeatureClass::Area),
            _ => None,
        }
    }

    pub fn accepts(self, kind: GeometryKind) -> bool {
        matches!(
            (self, kind),
            (FeatureClass::Point, GeometryKind::Point)
                | (FeatureClass::Line, GeometryKind::Line)
                | (FeatureClass::Area, GeometryKind::Polygon)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagRule {
    pub key: String,
    /// A concrete value or [`WILDCARD`].
    pub value: String,
    pub type_code: u16,
    pub zoom_min: u8,
    pub zoom_max: u8,
    pub class: FeatureClass,
}

impl TagRule {
    fn matches(&self, key: &str, value: &str) -> bool {
        self.key == key && (self.value == WILDCARD || value.split(';').any(|v| v.trim() == self.value))
    }
}

/// Result of a successful lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Position of the winning rule in the table.
    pub rule: usize,
    pub type_code: u16,
    pub zoom_min: u8,
    pub zoom_max: u8,
    pub class: FeatureClass,
    /// The OSM pair that matched, with the value as found on the feature.
    pub key: String,
    pub value: String,
}

impl Resolution {
    pub fn tag_ref(&self) -> TagRef {
        TagRef {
            type_code: self.type_code,
            key: self.key.clone(),
            value: self.value.clone(),
        }
    }
}

/// Immutable rule table, loaded once and shared by every stage.
#[derive(Debug, Clone)]
pub struct TagMapping {
    pub version: String,
    pub profile_name: String,
    rules: Vec<TagRule>,
}

impl TagMapping {
    pub fn load(path: &Path) -> Result<TagMapping> {
        let xml = fs::read_to_string(path)
            .map_err(|err| Error::mapping(err.to_string()).context(path.display()))?;
        let mapping = TagMapping::parse(&xml).map_err(|err| err.context(path.display()))?;
        info!(
            path = path.display().to_string(),
            rules = mapping.rules.len(),
            version = mapping.version.as_str();
            "Loaded tag mapping"
        );
        Ok(mapping)
    }

    pub fn parse(xml: &str) -> Result<TagMapping> {
        TableParser::new()?.parse(xml)
    }

    pub fn rules(&self) -> &[TagRule] {
        &self.rules
    }

    /// First rule, in declared order, matching any of the tags.
    pub fn resolve(&self, tags: &[(String, String)]) -> Option<Resolution> {
        self.find(tags, |_| true)
    }

    /// Like [`TagMapping::resolve`], restricted to rules for this geometry kind.
    pub fn resolve_for(&self, kind: GeometryKind, tags: &[(String, String)]) -> Option<Resolution> {
        self.find(tags, |rule| rule.class.accepts(kind))
    }

    fn find(&self, tags: &[(String, String)], applies: impl Fn(&TagRule) -> bool) -> Option<Resolution> {
        for (index, rule) in self.rules.iter().enumerate() {
            if !applies(rule) {
                continue;
            }
            if let Some((key, value)) = tags.iter().find(|(k, v)| rule.matches(k, v)) {
                return Some(Resolution {
                    rule: index,
                    type_code: rule.type_code,
                    zoom_min: rule.zoom_min,
                    zoom_max: rule.zoom_max,
                    class: rule.class,
                    key: key.clone(),
                    value: value.clone(),
                });
            }
        }
        None
    }
}

struct TableParser {
    key_pattern: Regex,
    version: Option<String>,
    profile_name: String,
    default_zoom_min: u8,
    default_zoom_max: u8,
    section: Option<FeatureClass>,
    seen_root: bool,
    rules: Vec<TagRule>,
}

impl TableParser {
    fn new() -> Result<Self> {
        Ok(TableParser {
            key_pattern: Regex::new(r"^[A-Za-z0-9_:.\-]+$").map_err(|err| Error::mapping(err.to_string()))?,
            version: None,
            profile_name: String::new(),
            default_zoom_min: 0,
            default_zoom_max: MAX_ZOOM,
            section: None,
            seen_root: false,
            rules: Vec::new(),
        })
    }

    fn parse(mut self, xml: &str) -> Result<TagMapping> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);
        let mut depth = 0usize;

        loop {
            let event = reader
                .read_event()
                .map_err(|err| Error::mapping(format!("XML error at byte {}: {err}", reader.buffer_position())))?;
            match event {
                Event::Eof => break,
                Event::Start(e) => {
                    depth += 1;
                    self.open(&e, false)?
                }
                Event::Empty(e) => self.open(&e, true)?,
                Event::End(e) => {
                    depth = depth.saturating_sub(1);
                    if FeatureClass::from_section(e.name().as_ref()).is_some() {
                        self.section = None;
                    }
                }
                Event::Text(_) => return Err(Error::mapping("unexpected text content")),
                _ => (),
            }
        }

        if !self.seen_root {
            return Err(Error::mapping("missing <tag-mapping> root element"));
        }
        if depth != 0 {
            return Err(Error::mapping("unexpected end of file inside an element"));
        }
        if self.rules.is_empty() {
            return Err(Error::mapping("tag mapping defines no rules"));
        }
        debug!(rules = self.rules.len(); "Parsed tag mapping");
        Ok(TagMapping {
            version: self.version.unwrap_or_else(|| "0".to_string()),
            profile_name: self.profile_name,
            rules: self.rules,
        })
    }

    fn open(&mut self, e: &BytesStart, empty: bool) -> Result<()> {
        let name = e.name();
        match name.as_ref() {
            b"tag-mapping" => self.open_root(e),
            b"osm-tag" => {
                let class = self
                    .section
                    .ok_or_else(|| Error::mapping("<osm-tag> outside of <points>, <lines> or <areas>"))?;
                let rule = self.parse_rule(e, class)?;
                self.rules.push(rule);
                Ok(())
            }
            section => match FeatureClass::from_section(section) {
                Some(class) if self.seen_root => {
                    if !empty {
                        self.section = Some(class);
                    }
                    Ok(())
                }
                _ => Err(Error::mapping(format!(
                    "unexpected element <{}>",
                    String::from_utf8_lossy(section)
                ))),
            },
        }
    }

    fn open_root(&mut self, e: &BytesStart) -> Result<()> {
        if self.seen_root {
            return Err(Error::mapping("nested <tag-mapping> element"));
        }
        self.seen_root = true;
        for (key, value) in attributes(e)? {
            match key.as_str() {
                "version" => self.version = Some(value),
                "profile-name" => self.profile_name = value,
                "default-zoom-min" => self.default_zoom_min = parse_zoom(&key, &value)?,
                "default-zoom-max" => self.default_zoom_max = parse_zoom(&key, &value)?,
                _ => (),
            }
        }
        if self.default_zoom_min > self.default_zoom_max {
            return Err(Error::mapping("default-zoom-min exceeds default-zoom-max"));
        }
        Ok(())
    }

    fn parse_rule(&self, e: &BytesStart, class: FeatureClass) -> Result<TagRule> {
        let mut key = None;
        let mut value = None;
        let mut type_code = None;
        let mut zoom_min = self.default_zoom_min;
        let mut zoom_max = self.default_zoom_max;

        for (name, text) in attributes(e)? {
            match name.as_str() {
                "key" => key = Some(text),
                "value" => value = Some(text),
                "type-code" => {
                    type_code = Some(text.parse::<u16>().map_err(|err| {
                        Error::mapping(format!("invalid type-code {text:?}: {err}"))
                    })?)
                }
                "zoom-min" => zoom_min = parse_zoom(&name, &text)?,
                "zoom-max" => zoom_max = parse_zoom(&name, &text)?,
                _ => (),
            }
        }

        let key = key.ok_or_else(|| Error::mapping("<osm-tag> without key"))?;
        if !self.key_pattern.is_match(&key) {
            return Err(Error::mapping(format!("invalid OSM key {key:?}")));
        }
        let value = value
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::mapping(format!("<osm-tag key={key:?}> without value")))?;
        let type_code = type_code.ok_or_else(|| Error::mapping(format!("<osm-tag key={key:?}> without type-code")))?;
        if zoom_min > zoom_max {
            return Err(Error::mapping(format!(
                "<osm-tag key={key:?} value={value:?}> has zoom-min {zoom_min} > zoom-max {zoom_max}"
            )));
        }
        if self
            .rules
            .iter()
            .any(|rule| rule.class == class && rule.key == key && rule.value == value)
        {
            return Err(Error::mapping(format!("duplicate rule {key}={value}")));
        }

        Ok(TagRule {
            key,
            value,
            type_code,
            zoom_min,
            zoom_max,
            class,
        })
    }
}

fn attributes(e: &BytesStart) -> Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    for attribute_res in e.attributes() {
        let attribute = attribute_res.map_err(|err| Error::mapping(err.to_string()))?;
        let key = str::from_utf8(attribute.key.as_ref())
            .map_err(|err| Error::mapping(err.to_string()))?
            .to_string();
        let value = attribute
            .unescape_value()
            .map_err(|err| Error::mapping(err.to_string()))?
            .to_string();
        out.push((key, value));
    }
    Ok(out)
}

fn parse_zoom(name: &str, text: &str) -> Result<u8> {
    let zoom = text
        .parse::<u8>()
        .map_err(|err| Error::mapping(format!("invalid {name} {text:?}: {err}")))?;
    if zoom > MAX_ZOOM {
        return Err(Error::mapping(format!("{name} {zoom} exceeds {MAX_ZOOM}")));
    }
    Ok(zoom)
}
