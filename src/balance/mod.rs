//! Domain water balance.
//!
//! Volumes are m³ of water. Groundwater storage is converted from saturated
//! soil volume with the porosity; channel storage is height times channel
//! area.

use serde::Serialize;

use crate::grid::Grid;
use crate::state::{HydroState, Landscape};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StorageSnapshot {
    pub surface: f64,
    pub groundwater: f64,
    pub interception: f64,
}

impl StorageSnapshot {
    pub fn capture(landscape: &Landscape, state: &HydroState) -> Self {
        Self {
            surface: state.height.sum() * landscape.channel_area,
            groundwater: water_volume(&state.groundwater, &landscape.porosity),
            interception: state.interception.sum(),
        }
    }

    pub fn total(&self) -> f64 {
        self.surface + self.groundwater + self.interception
    }
}

fn water_volume(groundwater: &Grid<f64>, porosity: &Grid<f64>) -> f64 {
    groundwater
        .iter()
        .zip(porosity.iter())
        .map(|(s, p)| s * p)
        .sum()
}

/// Running totals of water entering and leaving the modelled stores.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MassBalance {
    pub initial: StorageSnapshot,
    pub precipitation: f64,
    pub evaporation: f64,
    pub percolation: f64,
    /// Water leaving through sink cells of the surface network
    pub outflow: f64,
    /// Water leaving a store that the routing mode does not advance
    pub untracked: f64,
}

impl MassBalance {
    pub fn new(initial: StorageSnapshot) -> Self {
        Self {
            initial,
            ..Self::default()
        }
    }

    pub fn inputs(&self) -> f64 {
        self.precipitation
    }

    pub fn outputs(&self) -> f64 {
        self.evaporation + self.percolation + self.outflow + self.untracked
    }

    /// Storage change not explained by the fluxes.
    pub fn residual(&self, current: &StorageSnapshot) -> f64 {
        (current.total() - self.initial.total()) - (self.inputs() - self.outputs())
    }

    /// Residual relative to the larger of total throughput and initial
    /// storage.
    pub fn relative_error(&self, current: &StorageSnapshot) -> f64 {
        let scale = (self.inputs() + self.outputs()).max(self.initial.total());
        if scale > 0.0 {
            self.residual(current).abs() / scale
        } else {
            0.0
        }
    }
}

/// Returned by a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub substeps: u64,
    pub updates: u64,
    pub reports: u64,
    pub balance: MassBalance,
    pub final_storage: StorageSnapshot,
    pub residual: f64,
    pub relative_error: f64,
    pub max_discharge: f64,
}
