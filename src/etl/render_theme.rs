//! Render theme matching the tag mapping, so the map can be viewed right away.

use std::fs;
use std::path::Path;

use log::info;
use quick_xml::escape::escape;

use crate::errors::{Error, Result};
use crate::etl::tag_mapping::{FeatureClass, TagMapping, WILDCARD};

const GRADIENT_START: (u8, u8, u8) = (0xff, 0x7f, 0x00);
const GRADIENT_END: (u8, u8, u8) = (0x80, 0x40, 0x00);

/// Colour `i` of `n`, from light orange to dark brown.
pub fn gradient(i: usize, n: usize) -> String {
    let t = if n <= 1 { 0.0 } else { i as f64 / (n - 1) as f64 };
    let mix = |a: u8, b: u8| (f64::from(a) + t * (f64::from(b) - f64::from(a))).round() as u8;
    format!(
        "#{:02x}{:02x}{:02x}",
        mix(GRADIENT_START.0, GRADIENT_END.0),
        mix(GRADIENT_START.1, GRADIENT_END.1),
        mix(GRADIENT_START.2, GRADIENT_END.2)
    )
}

pub fn render_theme(mapping: &TagMapping) -> String {
    let rules = mapping.rules();
    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    xml.push_str("<rendertheme xmlns=\"http://mapsforge.org/renderTheme\" version=\"5\" map-background=\"#ffffff\">\n");
    for (i, rule) in rules.iter().enumerate() {
        let colour = gradient(i, rules.len());
        let value = if rule.value == WILDCARD { "*".to_string() } else { escape(&rule.value).into_owned() };
        xml.push_str(&format!(
            "  <m k=\"{}\" v=\"{}\" zoom-min=\"{}\" zoom-max=\"{}\">\n",
            escape(&rule.key),
            value,
            rule.zoom_min,
            rule.zoom_max
        ));
        let symbol = match rule.class {
            FeatureClass::Point => format!("    <circle r=\"4\" fill=\"{colour}\"/>\n"),
            FeatureClass::Line => format!("    <line stroke=\"{colour}\" stroke-width=\"2\"/>\n"),
            FeatureClass::Area => format!("    <area fill=\"{colour}\"/>\n"),
        };
        xml.push_str(&symbol);
        xml.push_str("  </m>\n");
    }
    xml.push_str("</rendertheme>\n");
    xml
}

pub fn write_render_theme(mapping: &TagMapping, path: &Path) -> Result<()> {
    fs::write(path, render_theme(mapping)).map_err(|err| Error::from(err).context(path.display()))?;
    info!(path = path.display().to_string(), rules = mapping.rules().len(); "Wrote render theme");
    Ok(())
}
