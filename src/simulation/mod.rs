// ============================================================================
// Simulation Driver
//
// Owns every field of a run and advances them through three nested loops:
//
//   LoadForcing   -> sample precipitation and evapotranspiration
//   ComputeFluxes -> vertical balance and lateral groundwater flow
//   Route         -> one routing sub-step, repeated until the update
//                    interval closes
//
// Reports are written whenever the clock closes a report interval.
// ============================================================================

use std::borrow::Cow;

use tracing::{debug, info, warn};

use crate::balance::{MassBalance, RunSummary, StorageSnapshot};
use crate::clock::{Phase, SimulationClock};
use crate::config::{ForcingSource, GroundwaterRefresh, RoutingMode, SimulationConfig};
use crate::drainage::DrainageNetwork;
use crate::error::{HydroError, HydroResult};
use crate::flux::{apply_groundwater_flux, FluxCalculator, FluxConstants, FluxUpdate};
use crate::grid::{filled, min_max, ones, par_from_fn, Grid};
use crate::io::forcing::Forcing;
use crate::io::report::{report_variables, Reporter};
use crate::io::store::GridStore;
use crate::io::tables::{LandUseTable, SoilTable};
use crate::routing::{KinematicWaveRouter, LateralInflowMode};
use crate::state::{check_shape, HydroState, Landscape};

/// Volumes leaving the modelled stores during one sub-step [m³].
#[derive(Debug, Clone, Copy, Default)]
struct SubstepLosses {
    outflow: f64,
    untracked: f64,
}

/// Per-cell result of the coupled surface/subsurface sub-step.
#[derive(Debug, Clone, Copy, Default)]
struct CoupledCell {
    groundwater: f64,
    height: f64,
    seepage: f64,
    reinfiltration: f64,
}

pub struct Simulation<S: GridStore> {
    config: SimulationConfig,
    landscape: Landscape,
    state: HydroState,
    store: S,

    precipitation: Forcing,
    evapotranspiration: Forcing,
    precipitation_grid: Grid<f64>,
    evaporation_grid: Grid<f64>,

    flux: FluxCalculator,
    fluxes: FluxUpdate,
    router: KinematicWaveRouter,

    clock: SimulationClock,
    phase: Phase,
    reporter: Reporter,
    balance: MassBalance,
    max_discharge: f64,
}

impl<S: GridStore> Simulation<S> {
    pub fn new(
        config: SimulationConfig,
        landscape: Landscape,
        state: HydroState,
        store: S,
        precipitation: Forcing,
        evapotranspiration: Forcing,
    ) -> HydroResult<Self> {
        config.validate()?;
        let shape = landscape.shape;
        for (name, g) in [
            ("groundwater", &state.groundwater),
            ("height", &state.height),
            ("discharge", &state.discharge),
            ("interception", &state.interception),
        ] {
            check_shape(name, shape, g)?;
        }

        let flux = FluxCalculator::new(
            config.processes,
            config.routing.surface_order,
            FluxConstants::from_config(&config),
        );
        let router = KinematicWaveRouter::new(config.model.beta, config.time.timestep, config.model.min_value);
        let clock = SimulationClock::new(config.time.clone());
        let phase = if clock.is_finished() { Phase::Finished } else { Phase::LoadForcing };
        let balance = MassBalance::new(StorageSnapshot::capture(&landscape, &state));
        let max_discharge = min_max(&state.discharge).1;

        Ok(Self {
            reporter: Reporter::new(config.time.timestep),
            precipitation_grid: filled(shape, 0.0),
            evaporation_grid: filled(shape, 0.0),
            fluxes: FluxUpdate::zeros(shape),
            config,
            landscape,
            state,
            store,
            precipitation,
            evapotranspiration,
            flux,
            router,
            clock,
            phase,
            balance,
            max_discharge,
        })
    }

    /// Build a run from the rasters and tables named in `config`.
    ///
    /// The DEM, land-use and soil maps are required. Everything else falls
    /// back to a derived default with a warning when missing.
    pub fn from_store(config: SimulationConfig, store: S) -> HydroResult<Self> {
        config.validate()?;
        let paths = &config.paths;

        let dem = store.read(&paths.dem)?;
        let shape = crate::grid::Shape::of(&dem);
        let land_use = store.read(&paths.land_use)?;
        check_shape(&paths.land_use, shape, &land_use)?;
        let soil = store.read(&paths.soil)?;
        check_shape(&paths.soil, shape, &soil)?;

        let soil_table = or_default(SoilTable::from_csv(&paths.soil_table), "soil table")?;
        let land_use_table = or_default(LandUseTable::from_csv(&paths.land_use_table), "land-use table")?;

        let surface_drainage = match &paths.ldd {
            Some(name) => match store.read(name) {
                Ok(codes) => {
                    check_shape(name, shape, &codes)?;
                    DrainageNetwork::from_ldd_field(&codes)?
                }
                Err(e) if e.is_missing_input() => {
                    warn!(input = %name, "ldd not found, deriving from dem");
                    let derived = DrainageNetwork::compute(&dem, config.model.resolution, config.routing.boundary);
                    store.write(&derived.ldd_codes().mapv(f64::from), name)?;
                    derived
                }
                Err(e) => return Err(e),
            },
            None => DrainageNetwork::compute(&dem, config.model.resolution, config.routing.boundary),
        };
        info!(
            rows = shape.rows,
            cols = shape.cols,
            sinks = surface_drainage.sink_count(),
            largest_catchment = min_max(&surface_drainage.accumulate(&ones(shape))).1,
            "surface drainage ready"
        );

        let landscape = Landscape::new(
            &config,
            dem,
            soil_table.apply(&soil),
            land_use_table.apply(&land_use),
            surface_drainage,
        )?;
        let state = HydroState::initialize(&store, &config, &landscape)?;
        let precipitation = open_forcing(&config.paths.precipitation, "precipitation")?;
        let evapotranspiration = open_forcing(&config.paths.evapotranspiration, "evapotranspiration")?;

        Self::new(config, landscape, state, store, precipitation, evapotranspiration)
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn landscape(&self) -> &Landscape {
        &self.landscape
    }

    pub fn state(&self) -> &HydroState {
        &self.state
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn clock(&self) -> &SimulationClock {
        &self.clock
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn balance(&self) -> &MassBalance {
        &self.balance
    }

    pub fn storage(&self) -> StorageSnapshot {
        StorageSnapshot::capture(&self.landscape, &self.state)
    }

    // -----------------------------------------------------------------------
    // Time loop
    // -----------------------------------------------------------------------

    /// Run to the end of the configured period.
    pub fn run(&mut self) -> HydroResult<RunSummary> {
        info!(
            mode = %self.config.routing.mode,
            substeps = self.clock.total_substeps(),
            start = %self.clock.start(),
            "simulation started"
        );
        self.write_initial()?;
        while self.step()? != Phase::Finished {}

        let summary = self.summary();
        info!(
            residual = summary.residual,
            relative_error = summary.relative_error,
            outflow = summary.balance.outflow,
            reports = summary.reports,
            "simulation finished"
        );
        Ok(summary)
    }

    /// Execute the current phase and return the next one.
    pub fn step(&mut self) -> HydroResult<Phase> {
        self.phase = match self.phase {
            Phase::LoadForcing => {
                self.load_forcing();
                Phase::ComputeFluxes
            }
            Phase::ComputeFluxes => {
                self.compute_fluxes();
                Phase::Route
            }
            Phase::Route => {
                let losses = self.route_substep();
                let tick = self.clock.advance_substep();
                self.accumulate(losses);
                if tick.fire_report {
                    self.report()?;
                }
                if self.clock.is_finished() {
                    Phase::Finished
                } else if tick.fire_update {
                    Phase::LoadForcing
                } else {
                    Phase::Route
                }
            }
            Phase::Finished => Phase::Finished,
        };
        Ok(self.phase)
    }

    pub fn summary(&self) -> RunSummary {
        let final_storage = self.storage();
        RunSummary {
            substeps: self.clock.substep,
            updates: self.clock.update,
            reports: self.clock.report,
            residual: self.balance.residual(&final_storage),
            relative_error: self.balance.relative_error(&final_storage),
            balance: self.balance.clone(),
            final_storage,
            max_discharge: self.max_discharge,
        }
    }

    fn load_forcing(&mut self) {
        let now = self.clock.now();
        let factor = self.config.model.forcing_factor();
        let precip = self.precipitation.mm_per_hour(now) * factor;
        let evap = self.evapotranspiration.mm_per_hour(now) * factor;
        self.precipitation_grid.fill(precip);
        self.evaporation_grid.fill(evap);
    }

    fn compute_fluxes(&mut self) {
        if self.config.routing.groundwater_refresh == GroundwaterRefresh::EveryUpdate {
            self.refresh_groundwater_drainage();
        }
        self.fluxes = self.flux.update(
            &self.landscape,
            &mut self.state,
            &self.precipitation_grid,
            &self.evaporation_grid,
        );
        let t = self.fluxes.totals;
        debug!(
            update = self.clock.update,
            precipitation = t.precipitation,
            evaporation = t.evaporation,
            soil_recharge = t.soil_recharge,
            "fluxes updated"
        );
    }

    /// Groundwater never moves in surface-only runs, so its network is
    /// left as initialised.
    fn refresh_groundwater_drainage(&mut self) {
        if !self.config.routing.mode.routes_subsurface() {
            return;
        }
        let gw_height = self.landscape.groundwater_height(&self.state.groundwater);
        self.state.groundwater_drainage = DrainageNetwork::compute(
            &gw_height,
            self.landscape.resolution,
            self.config.routing.boundary,
        );
    }

    fn accumulate(&mut self, losses: SubstepLosses) {
        let dt = self.clock.timestep();
        let t = self.fluxes.totals;
        self.balance.precipitation += t.precipitation * dt;
        self.balance.evaporation += t.evaporation * dt;
        self.balance.percolation += t.percolation * dt;
        self.balance.outflow += losses.outflow;
        self.balance.untracked += losses.untracked;
    }

    // -----------------------------------------------------------------------
    // Routing sub-step
    // -----------------------------------------------------------------------

    fn route_substep(&mut self) -> SubstepLosses {
        match self.config.routing.mode {
            RoutingMode::Surface => self.route_surface(),
            RoutingMode::Subsurface => self.route_subsurface(),
            RoutingMode::Both => self.route_both(),
        }
    }

    /// Surface water only. Soil recharge leaves the tracked stores.
    fn route_surface(&mut self) -> SubstepLosses {
        let dt = self.clock.timestep();
        let ca = self.landscape.channel_area;
        let lateral = match self.config.routing.lateral_inflow {
            LateralInflowMode::Storage => {
                if ca > 0.0 {
                    ndarray::Zip::from(&mut self.state.height)
                        .and(&self.fluxes.sw_flux)
                        .par_for_each(|h, &sw| *h += sw * dt / ca);
                }
                filled(self.landscape.shape, self.config.model.min_value)
            }
            LateralInflowMode::Router => per_unit_length(&self.fluxes.sw_flux, &self.landscape.channel_length),
        };
        let outflow = self.route_channel(&lateral);
        SubstepLosses {
            outflow,
            untracked: self.fluxes.totals.soil_recharge * dt,
        }
    }

    /// Groundwater only. Surface flux and seepage leave the tracked stores.
    fn route_subsurface(&mut self) -> SubstepLosses {
        let dt = self.clock.timestep();
        let l = &self.landscape;
        let mut seepage_total = 0.0;
        ndarray::Zip::from(&mut self.state.groundwater)
            .and(&mut self.state.seepage)
            .and(&self.fluxes.gw_flux)
            .and(&l.max_groundwater)
            .and(&l.porosity)
            .for_each(|gw, seep, &flux, &max, &porosity| {
                let (storage, seepage) = apply_groundwater_flux(*gw, flux, max, porosity);
                *gw = storage;
                *seep = seepage;
                seepage_total += seepage;
            });
        SubstepLosses {
            outflow: 0.0,
            untracked: self.fluxes.sw_flux.sum() * dt + seepage_total,
        }
    }

    /// Coupled sub-step: channel water reinfiltrates, saturated soil seeps
    /// into the channel, then the channel is routed.
    fn route_both(&mut self) -> SubstepLosses {
        let dt = self.clock.timestep();
        let l = &self.landscape;
        let ca = l.channel_area;
        let storage_mode = self.config.routing.lateral_inflow == LateralInflowMode::Storage;
        let state = &self.state;
        let fluxes = &self.fluxes;

        let cells = par_from_fn(l.shape, |(r, c)| {
            let idx = [r, c];
            let porosity = l.porosity[idx];
            let height = state.height[idx];
            let depth = if porosity > 0.0 && ca > 0.0 {
                height.min(fluxes.pot_channel_infiltration[idx] * dt).max(0.0)
            } else {
                0.0
            };
            let added = if depth > 0.0 { depth * ca / porosity } else { 0.0 };
            let (groundwater, seepage) = apply_groundwater_flux(
                state.groundwater[idx],
                fluxes.gw_flux[idx] + added,
                l.max_groundwater[idx],
                porosity,
            );
            let mut h = height - depth;
            if storage_mode && ca > 0.0 {
                h += (fluxes.sw_flux[idx] * dt + seepage) / ca;
            }
            CoupledCell {
                groundwater,
                height: h.max(0.0),
                seepage,
                reinfiltration: depth * ca,
            }
        });

        let lateral = if storage_mode {
            filled(l.shape, self.config.model.min_value)
        } else {
            let inflow = par_from_fn(l.shape, |(r, c)| {
                fluxes.sw_flux[[r, c]] + if dt > 0.0 { cells[[r, c]].seepage / dt } else { 0.0 }
            });
            per_unit_length(&inflow, &l.channel_length)
        };

        self.state.groundwater = cells.mapv(|x| x.groundwater);
        self.state.height = cells.mapv(|x| x.height);
        self.state.seepage = cells.mapv(|x| x.seepage);
        self.state.reinfiltration = cells.mapv(|x| x.reinfiltration);

        let outflow = self.route_channel(&lateral);
        SubstepLosses { outflow, untracked: 0.0 }
    }

    /// Height to discharge, one kinematic-wave step, discharge back to
    /// height. Returns the volume that left through sinks.
    fn route_channel(&mut self, lateral: &Grid<f64>) -> f64 {
        let l = &self.landscape;
        let q = l.discharge_from_height(&self.state.height, self.config.model.min_value);
        let routed = self
            .router
            .route(&l.surface_drainage, &q, lateral, &l.alpha, &l.channel_length);
        let outflow = self.router.outflow(&l.surface_drainage, &routed);
        self.state.height = l.height_from_discharge(&routed);
        self.max_discharge = self.max_discharge.max(min_max(&routed).1);
        self.state.discharge = routed;
        outflow
    }

    // -----------------------------------------------------------------------
    // Reporting
    // -----------------------------------------------------------------------

    fn write_initial(&mut self) -> HydroResult<()> {
        let when = self.clock.start();
        let layers = report_layers(&self.landscape, &self.state, self.config.routing.mode);
        let fields: Vec<(&str, &Grid<f64>)> = layers.iter().map(|(v, g)| (*v, g.as_ref())).collect();
        self.reporter.write_initial(&self.store, when, &fields)
    }

    fn report(&mut self) -> HydroResult<()> {
        let when = self.clock.now();
        let layers = report_layers(&self.landscape, &self.state, self.config.routing.mode);
        let fields: Vec<(&str, &Grid<f64>)> = layers.iter().map(|(v, g)| (*v, g.as_ref())).collect();
        self.reporter.write(&self.store, when, &fields)?;

        info!(
            progress = self.clock.progress(),
            clock = %self.clock.summary(),
            storage = self.storage().total(),
            outflow = self.balance.outflow,
            "report"
        );

        if self.config.routing.groundwater_refresh == GroundwaterRefresh::EveryReport {
            self.refresh_groundwater_drainage();
        }
        Ok(())
    }

    /// Rasters written so far, initial snapshot included.
    pub fn reports_written(&self) -> usize {
        self.reporter.written()
    }
}

fn report_layers<'a>(
    landscape: &Landscape,
    state: &'a HydroState,
    mode: RoutingMode,
) -> Vec<(&'static str, Cow<'a, Grid<f64>>)> {
    report_variables(mode)
        .iter()
        .filter_map(|&variable| {
            let layer = match variable {
                "discharge" => Cow::Borrowed(&state.discharge),
                "int_s" => Cow::Borrowed(&state.interception),
                "gw_s" => Cow::Borrowed(&state.groundwater),
                "seepage" => Cow::Borrowed(&state.seepage),
                "reinfiltration" => Cow::Borrowed(&state.reinfiltration),
                "height" => Cow::Borrowed(&state.height),
                "groundwater_height" => Cow::Owned(landscape.groundwater_height(&state.groundwater)),
                _ => return None,
            };
            Some((variable, layer))
        })
        .collect()
}

fn per_unit_length(flux: &Grid<f64>, length: &Grid<f64>) -> Grid<f64> {
    crate::grid::par_map2(flux, length, |q, dx| if dx > 0.0 { q / dx } else { 0.0 })
}

/// A missing forcing file reads as zero forcing.
fn open_forcing(source: &ForcingSource, name: &str) -> HydroResult<Forcing> {
    match Forcing::from_source(source) {
        Ok(f) => Ok(f),
        Err(e) if e.is_missing_input() => {
            warn!(forcing = name, error = %e, "forcing not found, reading as zero");
            Ok(Forcing::Constant(0.0))
        }
        Err(e) => Err(e),
    }
}

/// A missing lookup table leaves every category at the defaults.
fn or_default<T: Default>(loaded: HydroResult<T>, name: &str) -> HydroResult<T> {
    match loaded {
        Ok(t) => Ok(t),
        Err(HydroError::MissingInput { path }) => {
            warn!(table = name, path = %path.display(), "lookup table not found, using defaults");
            Ok(T::default())
        }
        Err(e) => Err(e),
    }
}
