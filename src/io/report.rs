//! Report naming and writing.
//!
//! Every report interval writes one raster per variable, named
//! `{timestep}_{variable}_{YYYY-MM-DD-HHMM}.asc`. With a fixed timestep and
//! variable the names sort chronologically.

use chrono::NaiveDateTime;
use tracing::debug;

use super::store::GridStore;
use crate::config::RoutingMode;
use crate::error::HydroResult;
use crate::grid::Grid;

pub const REPORT_EXTENSION: &str = "asc";
const DATE_FORMAT: &str = "%Y-%m-%d-%H%M";

/// Variables written each report interval for a routing mode.
pub fn report_variables(mode: RoutingMode) -> &'static [&'static str] {
    match mode {
        RoutingMode::Both => &["discharge", "int_s", "gw_s", "seepage", "reinfiltration", "height"],
        RoutingMode::Surface => &["discharge", "int_s", "height"],
        RoutingMode::Subsurface => &["gw_s", "seepage", "groundwater_height"],
    }
}

fn format_timestep(timestep: f64) -> String {
    if timestep.fract() == 0.0 && timestep.abs() < 1e15 {
        format!("{}", timestep as i64)
    } else {
        format!("{timestep}")
    }
}

pub fn output_name(timestep: f64, variable: &str, when: NaiveDateTime) -> String {
    format!(
        "{}_{}_{}.{}",
        format_timestep(timestep),
        variable,
        when.format(DATE_FORMAT),
        REPORT_EXTENSION
    )
}

/// Name for the initial-condition snapshot of a variable.
pub fn initial_name(timestep: f64, variable: &str, when: NaiveDateTime) -> String {
    output_name(timestep, &format!("ini_{variable}"), when)
}

#[derive(Debug, Clone)]
pub struct Reporter {
    timestep: f64,
    written: usize,
}

impl Reporter {
    pub fn new(timestep: f64) -> Self {
        Self { timestep, written: 0 }
    }

    /// Write each `(variable, field)` pair for `when`.
    pub fn write<S: GridStore + ?Sized>(
        &mut self,
        store: &S,
        when: NaiveDateTime,
        fields: &[(&str, &Grid<f64>)],
    ) -> HydroResult<()> {
        for (variable, grid) in fields {
            let name = output_name(self.timestep, variable, when);
            store.write(grid, &name)?;
            self.written += 1;
        }
        debug!(time = %when, layers = fields.len(), "report written");
        Ok(())
    }

    pub fn write_initial<S: GridStore + ?Sized>(
        &mut self,
        store: &S,
        when: NaiveDateTime,
        fields: &[(&str, &Grid<f64>)],
    ) -> HydroResult<()> {
        for (variable, grid) in fields {
            store.write(grid, &initial_name(self.timestep, variable, when))?;
            self.written += 1;
        }
        Ok(())
    }

    /// Rasters written so far.
    pub fn written(&self) -> usize {
        self.written
    }
}
