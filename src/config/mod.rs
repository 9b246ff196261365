// ============================================================================
// Simulation Configuration
//
// One explicit value tree, built once and handed to every component that
// needs it. Nothing reads settings from ambient state.
//
//   paths      - where inputs come from and where reports go
//   time       - start/end, routing sub-step, update and report intervals
//   model      - physical constants and channel geometry
//   processes  - which vertical fluxes are switched on
//   routing    - mode and the ordering/coupling choices
// ============================================================================

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::drainage::BoundaryMode;
use crate::error::{HydroError, HydroResult};
use crate::flux::SurfaceOrder;
use crate::io::forcing::{divides_hour, DEFAULT_RESOLUTION_MIN};
use crate::routing::{KinematicAlpha, LateralInflowMode};

// ---------------------------------------------------------------------------
// Routing mode
// ---------------------------------------------------------------------------

/// Which stores are advanced each routing sub-step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RoutingMode {
    Surface,
    Subsurface,
    #[default]
    Both,
}

impl RoutingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingMode::Surface => "surface",
            RoutingMode::Subsurface => "subsurface",
            RoutingMode::Both => "both",
        }
    }

    pub fn routes_surface(&self) -> bool {
        matches!(self, RoutingMode::Surface | RoutingMode::Both)
    }

    pub fn routes_subsurface(&self) -> bool {
        matches!(self, RoutingMode::Subsurface | RoutingMode::Both)
    }
}

impl fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoutingMode {
    type Err = HydroError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "surface" => Ok(RoutingMode::Surface),
            "subsurface" => Ok(RoutingMode::Subsurface),
            "both" => Ok(RoutingMode::Both),
            other => Err(HydroError::UnknownRoutingMode(other.to_string())),
        }
    }
}

impl TryFrom<String> for RoutingMode {
    type Error = HydroError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RoutingMode> for String {
    fn from(mode: RoutingMode) -> Self {
        mode.as_str().to_string()
    }
}

/// When the groundwater drainage directions are re-derived from the
/// groundwater-height field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroundwaterRefresh {
    /// Before each flux update.
    #[default]
    EveryUpdate,
    /// Only when a report is written.
    EveryReport,
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Source of a forcing series. Values are in mm/h.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ForcingSource {
    /// Header-less `dd/mm/YYYY HH:MM,value` rows, one every
    /// `resolution_min` minutes.
    Csv {
        path: PathBuf,
        #[serde(default = "default_resolution_min")]
        resolution_min: u32,
    },
    Constant { mm_per_hour: f64 },
}

fn default_resolution_min() -> u32 {
    DEFAULT_RESOLUTION_MIN
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathConfig {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub dem: String,
    pub land_use: String,
    pub soil: String,
    /// Surface drainage directions. Computed from the DEM when absent.
    pub ldd: Option<String>,
    pub initial_groundwater: String,
    pub initial_height: String,
    pub initial_discharge: String,
    pub initial_interception: String,
    pub soil_table: PathBuf,
    pub land_use_table: PathBuf,
    pub precipitation: ForcingSource,
    pub evapotranspiration: ForcingSource,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            input_dir:            PathBuf::from("input"),
            output_dir:           PathBuf::from("output"),
            dem:                  "dem".into(),
            land_use:             "land_use".into(),
            soil:                 "soil".into(),
            ldd:                  None,
            initial_groundwater:  "ini_gw_s".into(),
            initial_height:       "ini_height".into(),
            initial_discharge:    "ini_discharge".into(),
            initial_interception: "ini_int_s".into(),
            soil_table:           PathBuf::from("input/soil.csv"),
            land_use_table:       PathBuf::from("input/land_use.csv"),
            precipitation:        ForcingSource::Constant { mm_per_hour: 0.0 },
            evapotranspiration:   ForcingSource::Constant { mm_per_hour: 0.0 },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeConfig {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    /// Routing sub-step [s]
    pub timestep: f64,
    pub substeps_per_update: u64,
    pub substeps_per_report: u64,
}

impl Default for TimeConfig {
    fn default() -> Self {
        let start = NaiveDate::from_ymd_opt(2023, 1, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .unwrap_or_default();
        Self {
            start,
            end:                 start + Duration::hours(24),
            timestep:            10.0,   // 10 s routing sub-step
            substeps_per_update: 30,     // 5 min forcing resolution
            substeps_per_report: 360,    // hourly maps
        }
    }
}

impl TimeConfig {
    /// Number of routing sub-steps between `start` and `end`.
    pub fn total_substeps(&self) -> u64 {
        let seconds = (self.end - self.start).num_milliseconds() as f64 / 1000.0;
        if self.timestep <= 0.0 || seconds <= 0.0 {
            return 0;
        }
        (seconds / self.timestep).floor() as u64
    }

    /// Length of one flux-update interval [s].
    pub fn update_interval(&self) -> f64 {
        self.timestep * self.substeps_per_update as f64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelParams {
    /// Cell edge length [m]
    pub resolution: f64,
    /// Channel width [m]
    pub channel_width: f64,
    /// Bed slope used by the stage-discharge relation [m/m]
    pub channel_slope: f64,
    /// Depth of the impermeable layer below the DEM [m]
    pub impermeable_layer_depth: f64,
    /// Groundwater base level [m]
    pub groundwater_base: f64,
    /// Depth of the initial water table below the DEM [m]
    pub water_below_dem: f64,
    /// Floor for discharge and other strictly positive quantities
    pub min_value: f64,
    pub alpha: KinematicAlpha,
    pub beta: f64,
    /// Share of saturated conductivity lost to deep percolation
    pub percolation_fraction: f64,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            resolution:              5.0,
            channel_width:           1.0,
            channel_slope:           0.008,
            impermeable_layer_depth: 5.0,
            groundwater_base:        0.0,
            water_below_dem:         1.0,
            min_value:               1e-20,
            alpha:                   KinematicAlpha::default(),
            beta:                    0.6,
            percolation_fraction:    0.1,
        }
    }
}

impl ModelParams {
    #[inline]
    pub fn cell_area(&self) -> f64 {
        self.resolution * self.resolution
    }

    /// Channel length per cell; one cell edge.
    #[inline]
    pub fn channel_length(&self) -> f64 {
        self.resolution
    }

    #[inline]
    pub fn channel_area(&self) -> f64 {
        self.channel_width * self.channel_length()
    }

    /// mm/h over one cell to m³/s.
    #[inline]
    pub fn forcing_factor(&self) -> f64 {
        self.cell_area() / 1000.0 / 3600.0
    }
}

/// Switches for the vertical fluxes. A disabled flux evaluates to zero (or
/// to the identity for interception).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    pub precipitation: bool,
    pub evapotranspiration: bool,
    pub interception: bool,
    pub infiltration: bool,
    pub channel_infiltration: bool,
    pub percolation: bool,
    pub groundwater_flow: bool,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            precipitation:        true,
            evapotranspiration:   true,
            interception:         true,
            infiltration:         true,
            channel_infiltration: true,
            percolation:          false,
            groundwater_flow:     true,
        }
    }
}

impl ProcessConfig {
    /// Everything off; useful for isolating the router.
    pub fn none() -> Self {
        Self {
            precipitation:        false,
            evapotranspiration:   false,
            interception:         false,
            infiltration:         false,
            channel_infiltration: false,
            percolation:          false,
            groundwater_flow:     false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub mode: RoutingMode,
    pub surface_order: SurfaceOrder,
    pub lateral_inflow: LateralInflowMode,
    pub groundwater_refresh: GroundwaterRefresh,
    pub boundary: BoundaryMode,
}

// ---------------------------------------------------------------------------
// Root
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub paths: PathConfig,
    pub time: TimeConfig,
    pub model: ModelParams,
    pub processes: ProcessConfig,
    pub routing: RoutingConfig,
}

impl SimulationConfig {
    /// Read and validate a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> HydroResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| HydroError::io(path, e))?;
        let config = Self::from_json(&text)?;
        tracing::debug!(path = %path.display(), mode = %config.routing.mode, "configuration loaded");
        Ok(config)
    }

    pub fn from_json(text: &str) -> HydroResult<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the loop cannot run with. Called before any state is
    /// allocated.
    pub fn validate(&self) -> HydroResult<()> {
        let t = &self.time;
        let m = &self.model;
        if !(t.timestep > 0.0) {
            return Err(HydroError::config(format!("timestep must be positive, got {}", t.timestep)));
        }
        if t.substeps_per_update == 0 || t.substeps_per_report == 0 {
            return Err(HydroError::config("substeps_per_update and substeps_per_report must be at least 1"));
        }
        if t.end <= t.start {
            return Err(HydroError::config(format!("end {} is not after start {}", t.end, t.start)));
        }
        for (name, value) in [
            ("resolution", m.resolution),
            ("channel_width", m.channel_width),
            ("channel_slope", m.channel_slope),
            ("impermeable_layer_depth", m.impermeable_layer_depth),
            ("min_value", m.min_value),
            ("beta", m.beta),
        ] {
            if !(value > 0.0) || !value.is_finite() {
                return Err(HydroError::config(format!("{name} must be positive and finite, got {value}")));
            }
        }
        if !(0.0..=1.0).contains(&m.percolation_fraction) {
            return Err(HydroError::config(format!(
                "percolation_fraction must lie in [0, 1], got {}",
                m.percolation_fraction
            )));
        }
        if let KinematicAlpha::Fixed(a) = m.alpha {
            if !(a > 0.0) {
                return Err(HydroError::config(format!("fixed alpha must be positive, got {a}")));
            }
        }
        for source in [&self.paths.precipitation, &self.paths.evapotranspiration] {
            match source {
                ForcingSource::Constant { mm_per_hour } if *mm_per_hour < 0.0 => {
                    return Err(HydroError::config("constant forcing cannot be negative"));
                }
                ForcingSource::Csv { path, resolution_min } if !divides_hour(*resolution_min) => {
                    return Err(HydroError::config(format!(
                        "resolution_min {resolution_min} for {} must divide 60",
                        path.display()
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}
