//! Vertical water balance and lateral groundwater flow.
//!
//! Every flux here is a pure function of the current stores and forcing.
//! Per-cell kernels are plain functions on `f64` so they can be tested in
//! isolation; [`FluxCalculator::update`] broadcasts them over the grid with
//! rayon and adds the one cross-cell term, lateral groundwater flow, through
//! the groundwater drainage network.
//!
//! Units:
//! - forcing and vertical rates: m³/s of water per cell
//! - groundwater storage and `gw_flux`: m³ of saturated soil, per sub-step
//! - channel infiltration potential: m/s over the cell
//!
//! Degenerate inputs never raise. A zero denominator yields a zero ratio and
//! negative differences are clamped before being used as quantities.

use serde::{Deserialize, Serialize};

use crate::config::{ProcessConfig, SimulationConfig};
use crate::drainage::DrainageNetwork;
use crate::grid::{par_from_fn, zeros, Grid, Shape};
use crate::state::{HydroState, Landscape};

/// Order in which surface water is offered to evaporation and infiltration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SurfaceOrder {
    /// Evaporation takes its share of throughfall first.
    #[default]
    EvaporationFirst,
    /// Infiltration takes its share first; evaporation sees the remainder.
    InfiltrationFirst,
}

/// Scalars the kernels need besides per-cell fields.
#[derive(Debug, Clone, Copy)]
pub struct FluxConstants {
    pub cell_area: f64,
    pub resolution: f64,
    /// Routing sub-step [s]
    pub timestep: f64,
    pub substeps_per_update: f64,
    pub min_value: f64,
    pub percolation_fraction: f64,
}

impl FluxConstants {
    pub fn from_config(config: &SimulationConfig) -> Self {
        Self {
            cell_area: config.model.cell_area(),
            resolution: config.model.resolution,
            timestep: config.time.timestep,
            substeps_per_update: config.time.substeps_per_update as f64,
            min_value: config.model.min_value,
            percolation_fraction: config.model.percolation_fraction,
        }
    }

    /// Length of one update interval [s].
    #[inline]
    pub fn interval(&self) -> f64 {
        self.timestep * self.substeps_per_update
    }
}

/// Fluxes held constant over one update interval.
#[derive(Debug, Clone)]
pub struct FluxUpdate {
    /// Net water reaching the channel [m³/s]
    pub sw_flux: Grid<f64>,
    /// Change in groundwater storage per sub-step [m³ soil]
    pub gw_flux: Grid<f64>,
    /// Unused infiltration capacity available to channel water [m/s]
    pub pot_channel_infiltration: Grid<f64>,
    /// Domain totals for the balance [m³/s]
    pub totals: FluxTotals,
}

impl FluxUpdate {
    /// No flux anywhere; the state before the first update.
    pub fn zeros(shape: Shape) -> Self {
        Self {
            sw_flux: zeros(shape),
            gw_flux: zeros(shape),
            pot_channel_infiltration: zeros(shape),
            totals: FluxTotals::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FluxTotals {
    pub precipitation: f64,
    pub evaporation: f64,
    pub percolation: f64,
    /// Net vertical gain of soil water
    pub soil_recharge: f64,
}

/// Per-cell result of the vertical balance.
#[derive(Debug, Clone, Copy, Default)]
struct CellBalance {
    interception: f64,
    sw_flux: f64,
    /// Net vertical gain of soil water [m³/s]
    soil_water: f64,
    /// Soil evaporation plus percolation [m³/s]
    soil_loss: f64,
    channel_infiltration: f64,
    precipitation: f64,
    evaporation: f64,
    percolation: f64,
}

pub struct FluxCalculator {
    processes: ProcessConfig,
    order: SurfaceOrder,
    k: FluxConstants,
}

impl FluxCalculator {
    pub fn new(processes: ProcessConfig, order: SurfaceOrder, constants: FluxConstants) -> Self {
        Self {
            processes,
            order,
            k: constants,
        }
    }

    // -----------------------------------------------------------------------
    // Per-cell kernels
    // -----------------------------------------------------------------------

    /// Canopy interception over one update interval.
    ///
    /// Returns `(new_storage, precip_through, evap_remaining)`. Canopy water
    /// above `max_storage` is shed into `precip_through`, and evaporative
    /// demand not met from the canopy is passed on as `evap_remaining`.
    pub fn interception(
        &self,
        storage: f64,
        max_storage: f64,
        precip: f64,
        ref_evap: f64,
        throughfall: f64,
    ) -> (f64, f64, f64) {
        if !self.processes.interception {
            return (storage, precip, ref_evap);
        }
        let dt = self.k.interval();
        let precip = precip.max(0.0);
        let ref_evap = ref_evap.max(0.0);
        let intercepted = (1.0 - throughfall.clamp(0.0, 1.0)) * precip;
        let canopy = storage.max(0.0) + intercepted * dt;
        let canopy_evap = canopy.min(ref_evap * dt);
        let mut new_storage = canopy - canopy_evap;
        let surplus = (new_storage - max_storage.max(0.0)).max(0.0);
        new_storage -= surplus;
        let precip_through = precip - intercepted + surplus / dt;
        let evap_remaining = (ref_evap - canopy_evap / dt).max(0.0);
        (new_storage, precip_through, evap_remaining)
    }

    /// `(actual, unmet)`; actual evaporation is capped by available water.
    pub fn evapotranspiration(&self, available_water: f64, potential_evap: f64) -> (f64, f64) {
        if !self.processes.evapotranspiration {
            return (0.0, 0.0);
        }
        let potential = potential_evap.max(0.0);
        let actual = available_water.max(0.0).min(potential);
        (actual, (potential - actual).max(0.0))
    }

    /// Infiltration into the soil column.
    ///
    /// Returns `(direct_infiltration, potential_channel_infiltration)`. The
    /// second term is capacity left after surface water has infiltrated,
    /// expressed per unit cell area so it can be applied to channel water.
    #[allow(clippy::too_many_arguments)]
    pub fn infiltration(
        &self,
        gw_storage: f64,
        max_gw_storage: f64,
        ks: f64,
        permeability: f64,
        porosity: f64,
        available_water: f64,
        evap: f64,
    ) -> (f64, f64) {
        if !self.processes.infiltration {
            return (0.0, 0.0);
        }
        let capacity = ((max_gw_storage - gw_storage) * porosity / self.k.interval()).max(0.0);
        let potential = (ks * permeability * self.k.cell_area).min(capacity).max(0.0);
        let surface = (available_water - evap).max(0.0);
        let direct = potential.min(surface);
        let channel = if self.processes.channel_infiltration && self.k.cell_area > 0.0 {
            (potential - direct) / self.k.cell_area
        } else {
            0.0
        };
        (direct, channel)
    }

    /// Deep drainage out of the bottom of the soil column [m³/s water].
    /// Scales with relative saturation above the wilting floor.
    pub fn percolation(&self, gw_storage: f64, min_gw: f64, max_gw: f64, ks: f64, porosity: f64) -> f64 {
        if !self.processes.percolation {
            return 0.0;
        }
        let span = max_gw - min_gw;
        if span <= 0.0 {
            return 0.0;
        }
        let saturation = ((gw_storage - min_gw) / span).clamp(0.0, 1.0);
        let rate = self.k.percolation_fraction * ks * self.k.cell_area * saturation;
        let available = (gw_storage - min_gw).max(0.0) * porosity / self.k.interval();
        rate.min(available)
    }

    /// Lateral groundwater flow out of one cell, in storage units per
    /// sub-step.
    ///
    /// `reserved` is storage already committed to vertical losses over the
    /// update interval. Lateral flow only draws on what is left above the
    /// wilting floor, so the cell never drains below it.
    #[allow(clippy::too_many_arguments)]
    pub fn lateral_flow_cell(
        &self,
        is_sink: bool,
        gw_storage: f64,
        min_gw: f64,
        reserved: f64,
        gw_height: f64,
        downstream_height: f64,
        impermeable_height: f64,
        ks: f64,
    ) -> f64 {
        if is_sink {
            return 0.0;
        }
        let n = self.k.substeps_per_update.max(1.0);
        if gw_storage < min_gw {
            return self.k.min_value.min(gw_storage.max(0.0) / n);
        }
        let res = self.k.resolution;
        let gradient = if res > 0.0 { (gw_height - downstream_height) / res } else { 0.0 };
        let thickness = (gw_height - impermeable_height).max(0.0);
        let flow = (ks * gradient * self.k.timestep * thickness * res).max(0.0);
        let budget = (gw_storage - min_gw - reserved.max(0.0)).max(0.0);
        if flow * n > budget {
            budget / n
        } else {
            flow
        }
    }

    // -----------------------------------------------------------------------
    // Grid operators
    // -----------------------------------------------------------------------

    /// Lateral groundwater outflow for every cell along `drainage`.
    /// `reserved` is per-cell storage held back for vertical losses.
    pub fn groundwater_lateral_flow(
        &self,
        landscape: &Landscape,
        gw_storage: &Grid<f64>,
        gw_height: &Grid<f64>,
        reserved: &Grid<f64>,
        drainage: &DrainageNetwork,
    ) -> Grid<f64> {
        let shape = landscape.shape;
        if !self.processes.groundwater_flow {
            return zeros(shape);
        }
        let downstream = drainage.downstream(gw_height);
        par_from_fn(shape, |(r, c)| {
            self.lateral_flow_cell(
                drainage.is_sink(shape.flat_index(r, c)),
                gw_storage[[r, c]],
                landscape.min_groundwater[[r, c]],
                reserved[[r, c]],
                gw_height[[r, c]],
                downstream[[r, c]],
                landscape.impermeable_height[[r, c]],
                landscape.ks[[r, c]],
            )
        })
    }

    /// Compute all fluxes for one update interval. Writes the new
    /// interception storage into `state` and returns the rest.
    pub fn update(
        &self,
        landscape: &Landscape,
        state: &mut HydroState,
        precipitation: &Grid<f64>,
        ref_evaporation: &Grid<f64>,
    ) -> FluxUpdate {
        let shape = landscape.shape;
        let interval = self.k.interval();
        let use_precip = self.processes.precipitation;
        let use_evap = self.processes.evapotranspiration;

        let cells = par_from_fn(shape, |(r, c)| {
            let idx = [r, c];
            let precip = if use_precip { precipitation[idx].max(0.0) } else { 0.0 };
            let ref_evap = if use_evap { ref_evaporation[idx].max(0.0) } else { 0.0 };
            let gw = state.groundwater[idx];
            let min_gw = landscape.min_groundwater[idx];
            let max_gw = landscape.max_groundwater[idx];
            let porosity = landscape.porosity[idx];
            let ks = landscape.ks[idx];

            let (int_s, through, evap_rem) = self.interception(
                state.interception[idx],
                landscape.max_interception[idx],
                precip,
                ref_evap,
                landscape.throughfall[idx],
            );
            let canopy_evap = if self.processes.interception { ref_evap - evap_rem } else { 0.0 };

            let infiltrate = |evap: f64| {
                self.infiltration(gw, max_gw, ks, landscape.permeability[idx], porosity, through, evap)
            };
            let (surface_evap, unmet, direct, channel) = match self.order {
                SurfaceOrder::EvaporationFirst => {
                    let (actual, unmet) = self.evapotranspiration(through, evap_rem);
                    let (direct, channel) = infiltrate(actual);
                    (actual, unmet, direct, channel)
                }
                SurfaceOrder::InfiltrationFirst => {
                    let (direct, channel) = infiltrate(0.0);
                    let (actual, unmet) = self.evapotranspiration(through - direct, evap_rem);
                    (actual, unmet, direct, channel)
                }
            };

            // Unmet demand is drawn from soil water above the wilting floor.
            let soil_available = (gw - min_gw).max(0.0) * porosity / interval;
            let soil_evap = unmet.min(soil_available);
            let percolation = self
                .percolation(gw, min_gw, max_gw, ks, porosity)
                .min((soil_available - soil_evap).max(0.0));

            CellBalance {
                interception: int_s,
                sw_flux: (through - surface_evap - direct).max(0.0),
                soil_water: direct - soil_evap - percolation,
                soil_loss: soil_evap + percolation,
                channel_infiltration: channel,
                precipitation: precip,
                evaporation: canopy_evap + surface_evap + soil_evap,
                percolation,
            }
        });

        state.interception = cells.mapv(|b| b.interception);

        let gw_height = landscape.groundwater_height(&state.groundwater);
        let drainage = &state.groundwater_drainage;
        let reserved = par_from_fn(shape, |(r, c)| {
            let porosity = landscape.porosity[[r, c]];
            if porosity > 0.0 {
                cells[[r, c]].soil_loss * interval / porosity
            } else {
                0.0
            }
        });
        let lateral =
            self.groundwater_lateral_flow(landscape, &state.groundwater, &gw_height, &reserved, drainage);
        let inflow = drainage.upstream_sum(&lateral);
        let dt = self.k.timestep;

        let gw_flux = par_from_fn(shape, |(r, c)| {
            let idx = [r, c];
            let porosity = landscape.porosity[idx];
            let vertical = if porosity > 0.0 {
                cells[idx].soil_water * dt / porosity
            } else {
                0.0
            };
            vertical + inflow[idx] - lateral[idx]
        });

        let totals = cells.iter().fold(FluxTotals::default(), |acc, b| FluxTotals {
            precipitation: acc.precipitation + b.precipitation,
            evaporation: acc.evaporation + b.evaporation,
            percolation: acc.percolation + b.percolation,
            soil_recharge: acc.soil_recharge + b.soil_water,
        });

        FluxUpdate {
            sw_flux: cells.mapv(|b| b.sw_flux),
            gw_flux,
            pot_channel_infiltration: cells.mapv(|b| b.channel_infiltration),
            totals,
        }
    }
}

/// Apply one sub-step of groundwater change and shed anything above
/// capacity. Returns `(new_storage, seepage)` where seepage is the water
/// volume released, `(storage - max) * porosity`.
#[inline]
pub fn apply_groundwater_flux(storage: f64, flux: f64, max_storage: f64, porosity: f64) -> (f64, f64) {
    let updated = (storage + flux).max(0.0);
    if updated > max_storage {
        let seepage = (updated - max_storage) * porosity;
        (max_storage, seepage)
    } else {
        (updated, 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constants() -> FluxConstants {
        FluxConstants {
            cell_area: 100.0,
            resolution: 10.0,
            timestep: 1.0,
            substeps_per_update: 10.0,
            min_value: 1e-20,
            percolation_fraction: 0.5,
        }
    }

    fn calc() -> FluxCalculator {
        FluxCalculator::new(ProcessConfig::default(), SurfaceOrder::default(), constants())
    }

    #[test]
    fn test_capacity_clamp() {
        let porosity = 0.35;
        let (s, seepage) = apply_groundwater_flux(9.5, 1.0, 10.0, porosity);
        assert_eq!(s, 10.0);
        assert!((seepage - 0.5 * porosity).abs() < 1e-12);
    }

    #[test]
    fn test_groundwater_flux_never_negative() {
        let (s, seepage) = apply_groundwater_flux(0.2, -1.0, 10.0, 0.3);
        assert_eq!(s, 0.0);
        assert_eq!(seepage, 0.0);
    }

    #[test]
    fn test_interception_conserves_water() {
        let f = calc();
        let dt = constants().interval();
        let (storage, max, precip, evap, tf) = (0.05, 0.1, 0.02, 0.001, 0.6);
        let (s, through, rem) = f.interception(storage, max, precip, evap, tf);
        assert!(s <= max && s >= 0.0);
        let canopy_evap = (evap - rem) * dt;
        let lhs = storage + precip * dt;
        let rhs = s + through * dt + canopy_evap;
        assert!((lhs - rhs).abs() < 1e-12, "{lhs} vs {rhs}");
    }

    #[test]
    fn test_interception_sheds_surplus() {
        let f = calc();
        // 0.5 m³/s intercepted for 10 s into an empty 1 m³ canopy.
        let (s, through, rem) = f.interception(0.0, 1.0, 1.0, 0.0, 0.5);
        assert_eq!(s, 1.0);
        assert!((through - (0.5 + 4.0 / 10.0)).abs() < 1e-12);
        assert_eq!(rem, 0.0);
    }

    #[test]
    fn test_interception_disabled_is_identity() {
        let mut p = ProcessConfig::default();
        p.interception = false;
        let f = FluxCalculator::new(p, SurfaceOrder::default(), constants());
        assert_eq!(f.interception(0.3, 1.0, 2.0, 0.1, 0.5), (0.3, 2.0, 0.1));
    }

    #[test]
    fn test_evapotranspiration_split() {
        let f = calc();
        assert_eq!(f.evapotranspiration(1.0, 0.4), (0.4, 0.0));
        assert_eq!(f.evapotranspiration(0.1, 0.4), (0.1, 0.30000000000000004));
        assert_eq!(f.evapotranspiration(-1.0, 0.4), (0.0, 0.4));
    }

    #[test]
    fn test_infiltration_capped_by_capacity_and_supply() {
        let f = calc();
        // Potential = 1e-3 * 1 * 100 = 0.1 m³/s; capacity = (10 - 9) * 0.5 / 10 = 0.05.
        let (direct, channel) = f.infiltration(9.0, 10.0, 1e-3, 1.0, 0.5, 1.0, 0.0);
        assert!((direct - 0.05).abs() < 1e-12);
        assert_eq!(channel, 0.0);

        // Supply-limited: 0.02 available, 0.01 evaporates first.
        let (direct, channel) = f.infiltration(0.0, 10.0, 1e-3, 1.0, 0.5, 0.02, 0.01);
        assert!((direct - 0.01).abs() < 1e-12);
        assert!((channel - 0.09 / 100.0).abs() < 1e-15);

        // Full store.
        assert_eq!(f.infiltration(12.0, 10.0, 1e-3, 1.0, 0.5, 1.0, 0.0), (0.0, 0.0));
    }

    #[test]
    fn test_disabled_processes_return_zero() {
        let f = FluxCalculator::new(ProcessConfig::none(), SurfaceOrder::default(), constants());
        assert_eq!(f.evapotranspiration(1.0, 1.0), (0.0, 0.0));
        assert_eq!(f.infiltration(0.0, 10.0, 1.0, 1.0, 0.5, 1.0, 0.0), (0.0, 0.0));
        assert_eq!(f.percolation(5.0, 1.0, 10.0, 1e-3, 0.4), 0.0);
    }

    #[test]
    fn test_percolation_bounded_by_storage_above_floor() {
        let f = calc();
        assert_eq!(f.percolation(1.0, 1.0, 10.0, 1.0, 0.4), 0.0);
        let rate = f.percolation(10.0, 1.0, 10.0, 1.0, 0.4);
        // Unbounded rate would be 0.5 * 1 * 100 = 50; cap is 9 * 0.4 / 10.
        assert!((rate - 0.36).abs() < 1e-12);
    }

    #[test]
    fn test_lateral_flow_rules() {
        let f = calc();
        // Sink
        assert_eq!(f.lateral_flow_cell(true, 5.0, 1.0, 0.0, 3.0, 2.0, 0.0, 1e-4), 0.0);
        // Below wilting floor
        assert_eq!(f.lateral_flow_cell(false, 0.5, 1.0, 0.0, 3.0, 2.0, 0.0, 1e-4), 1e-20);
        assert_eq!(f.lateral_flow_cell(false, 0.0, 1.0, 0.0, 3.0, 2.0, 0.0, 1e-4), 0.0);
        // Free flow: 1e-4 * 0.1 * 1 * 3 * 10 = 3e-4
        let q = f.lateral_flow_cell(false, 50.0, 1.0, 0.0, 3.0, 2.0, 0.0, 1e-4);
        assert!((q - 3e-4).abs() < 1e-15);
        // Capped to storage above the floor spread over the interval
        let q = f.lateral_flow_cell(false, 1.001, 1.0, 0.0, 3.0, 2.0, 0.0, 1.0);
        assert!((q - 0.001 / 10.0).abs() < 1e-15);
    }

    #[test]
    fn test_lateral_flow_shares_budget_with_vertical_losses() {
        let f = calc();
        // 40 above the floor, 30 already taken by evaporation and percolation.
        let q = f.lateral_flow_cell(false, 50.0, 10.0, 30.0, 3.0, 2.0, 0.0, 1.0);
        assert!((q - 10.0 / 10.0).abs() < 1e-12);
        // Vertical losses use everything: nothing left to flow sideways.
        assert_eq!(f.lateral_flow_cell(false, 50.0, 10.0, 40.0, 3.0, 2.0, 0.0, 1.0), 0.0);
    }

    #[test]
    fn test_zero_resolution_gives_zero_gradient() {
        let k = FluxConstants { resolution: 0.0, ..constants() };
        let f = FluxCalculator::new(ProcessConfig::default(), SurfaceOrder::default(), k);
        assert_eq!(f.lateral_flow_cell(false, 5.0, 1.0, 0.0, 3.0, 2.0, 0.0, 1.0), 0.0);
    }
}
