//! hydrobase: cell-based rainfall-runoff and groundwater model.
//!
//! Architecture:
//! - Struct-of-arrays rasters (grid module) with rayon cell kernels
//! - CSR donor graph (graph module) under a D8 drainage network (drainage module)
//! - Vertical water balance and lateral groundwater flow (flux module)
//! - Kinematic-wave channel routing solved per basin (routing module)
//! - Multirate clock: report / flux update / routing sub-step (clock, simulation)
//!
//! Each update interval samples forcing, recomputes fluxes, then applies them
//! over a run of routing sub-steps in one of three coupling modes.

pub mod balance;
pub mod clock;
pub mod config;
pub mod drainage;
pub mod error;
pub mod flux;
pub mod graph;
pub mod grid;
pub mod io;
pub mod routing;
pub mod simulation;
pub mod state;

pub use balance::{MassBalance, RunSummary, StorageSnapshot};
pub use config::{RoutingMode, SimulationConfig};
pub use drainage::{BoundaryMode, DrainageNetwork};
pub use error::{HydroError, HydroResult};
pub use grid::{Grid, Shape};
pub use io::{AsciiGridStore, GridStore, MemoryStore};
pub use simulation::Simulation;
pub use state::{HydroState, Landscape};
