pub mod build_map;
pub mod elevation;
pub mod encoding;
pub mod lifty_areas;
pub mod map_reader;
pub mod map_writer;
pub mod normalize;
pub mod parse_osm;
pub mod render_theme;
pub mod tag_mapping;
pub mod tile_grid;
pub mod tile_store;

use std::path::Path;
use log::{info, error, warn};

use crate::errors::Result;


pub trait Etl {
    type Input;
    type Output;
    type Report;

    fn etl_name(&self) -> &str;

    /// Removes whatever a failed run left in `dir`.
    fn clean(&self, dir: &Path) -> Result<()>;

    fn extract(&mut self, dir: &Path) -> Result<Self::Input>;
    fn transform(&mut self, input: Self::Input) -> Result<Self::Output>;
    fn load(&mut self, dir: &Path, output: Self::Output) -> Result<Self::Report>;

    fn process(&mut self, dir: &Path) -> Result<Self::Report> {
        info!(etl_name = self.etl_name(); "Starting ETL process");
        let report = match self.run_phases(dir) {
            Ok(report) => report,
            Err(err) => {
                if let Err(clean_err) = self.clean(dir) {
                    warn!(etl_name = self.etl_name(), err = clean_err.message; "Cleanup after failure failed");
                }
                return Err(err);
            }
        };
        info!(etl_name = self.etl_name(); "Process finished");
        Ok(report)
    }

    fn run_phases(&mut self, dir: &Path) -> Result<Self::Report> {
        info!(etl_name = self.etl_name(); "Extracting");
        let input = match self.extract(dir) {
            Ok(input) => Ok(input),
            Err(err) => {
                error!(etl_name = self.etl_name(), err = err.message; "Extraction failed with error");
                Err(err)
            },
        }?;

        info!(etl_name = self.etl_name(); "Transforming");
        let output = match self.transform(input) {
            Ok(output) => Ok(output),
            Err(err) => {
                error!(etl_name = self.etl_name(), err = err.message; "Transformation failed with error");
                Err(err)
            },
        }?;

        info!(etl_name = self.etl_name(); "Loading");
        match self.load(dir, output) {
            Ok(report) => Ok(report),
            Err(err) => {
                error!(etl_name = self.etl_name(), err = err.message; "Loading failed with error");
                Err(err)
            },
        }
    }
}
