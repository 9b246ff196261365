//! Whole-run scenarios through `Simulation` with an in-memory store.

use chrono::Duration;

use hydrobase::clock::Phase;
use hydrobase::config::{GroundwaterRefresh, RoutingMode, SimulationConfig};
use hydrobase::drainage::{BoundaryMode, DrainageNetwork};
use hydrobase::flux::{apply_groundwater_flux, SurfaceOrder};
use hydrobase::grid::{par_from_fn, Shape};
use hydrobase::io::forcing::Forcing;
use hydrobase::io::tables::{LandUseFields, SoilFields};
use hydrobase::routing::LateralInflowMode;
use hydrobase::{HydroError, HydroState, Landscape, MemoryStore, Simulation};

const TOLERANCE: f64 = 1e-6;

fn config(mode: RoutingMode) -> SimulationConfig {
    let mut c = SimulationConfig::default();
    c.routing.mode = mode;
    c.routing.boundary = BoundaryMode::InDomain;
    c.model.resolution = 10.0;
    c.model.impermeable_layer_depth = 2.0;
    c.time.timestep = 5.0;
    c.time.substeps_per_update = 12;
    c.time.substeps_per_report = 72;
    c.time.end = c.time.start + Duration::hours(1);
    c
}

/// 5x5 valley sloping towards the middle of the bottom edge.
fn valley(config: &SimulationConfig) -> (Landscape, HydroState) {
    let shape = Shape::new(5, 5);
    let dem = par_from_fn(shape, |(r, c)| {
        10.0 + (4 - r) as f64 * 0.5 + (c as f64 - 2.0).abs() * 0.3
    });
    let drainage = DrainageNetwork::compute(&dem, config.model.resolution, config.routing.boundary);
    let landscape = Landscape::new(
        config,
        dem,
        SoilFields::uniform(shape, 2e-6, 0.4, 0.1),
        LandUseFields::uniform(shape, 0.045, 0.8, 0.001, 0.9),
        drainage,
    )
    .unwrap();
    let state = HydroState::initialize(&MemoryStore::new(), config, &landscape).unwrap();
    (landscape, state)
}

fn simulation(config: SimulationConfig, rain: f64, evap: f64) -> Simulation<MemoryStore> {
    let (landscape, state) = valley(&config);
    Simulation::new(
        config,
        landscape,
        state,
        MemoryStore::new(),
        Forcing::Constant(rain),
        Forcing::Constant(evap),
    )
    .unwrap()
}

fn assert_closes(sim: &mut Simulation<MemoryStore>) {
    let summary = sim.run().unwrap();
    assert_eq!(sim.phase(), Phase::Finished);
    assert!(summary.balance.precipitation > 0.0);
    assert!(
        summary.relative_error < TOLERANCE,
        "residual {} (relative {})",
        summary.residual,
        summary.relative_error
    );
}

#[test]
fn test_capacity_clamp() {
    let porosity = 0.4;
    let (storage, seepage) = apply_groundwater_flux(9.5, 1.0, 10.0, porosity);
    assert_eq!(storage, 10.0);
    assert!((seepage - 0.5 * porosity).abs() < 1e-12);
}

#[test]
fn test_balance_closes_in_coupled_mode() {
    let mut sim = simulation(config(RoutingMode::Both), 20.0, 0.5);
    assert_closes(&mut sim);
    assert!(sim.balance().outflow > 0.0);
}

#[test]
fn test_balance_closes_in_surface_mode() {
    let mut sim = simulation(config(RoutingMode::Surface), 20.0, 0.5);
    let groundwater = sim.state().groundwater.clone();
    assert_closes(&mut sim);
    assert_eq!(sim.state().groundwater, groundwater);
    assert!(sim.balance().untracked > 0.0);
}

#[test]
fn test_balance_closes_in_subsurface_mode() {
    let mut sim = simulation(config(RoutingMode::Subsurface), 20.0, 0.5);
    assert_closes(&mut sim);
    assert_eq!(sim.balance().outflow, 0.0);
}

#[test]
fn test_balance_closes_with_variants() {
    let mut c = config(RoutingMode::Both);
    c.processes.percolation = true;
    c.routing.surface_order = SurfaceOrder::InfiltrationFirst;
    c.routing.lateral_inflow = LateralInflowMode::Router;
    c.routing.groundwater_refresh = GroundwaterRefresh::EveryReport;
    let mut sim = simulation(c, 40.0, 0.2);
    assert_closes(&mut sim);
    assert!(sim.balance().percolation > 0.0);
}

/// Steep 1x3 slope with a saturated, highly conductive soil column. Every
/// groundwater sink is active at once.
fn draining_slope(evap_mm_per_hour: f64) -> Simulation<MemoryStore> {
    let mut c = config(RoutingMode::Subsurface);
    c.processes.percolation = true;
    c.time.timestep = 10.0;
    c.time.substeps_per_update = 30;
    c.time.substeps_per_report = 30;
    c.time.end = c.time.start + Duration::minutes(5);

    let shape = Shape::new(1, 3);
    let dem = par_from_fn(shape, |(_, col)| 10.0 - col as f64);
    let drainage = DrainageNetwork::compute(&dem, c.model.resolution, c.routing.boundary);
    let landscape = Landscape::new(
        &c,
        dem,
        SoilFields::uniform(shape, 1.0, 0.4, 0.1),
        LandUseFields::uniform(shape, 0.045, 0.8, 0.001, 0.9),
        drainage,
    )
    .unwrap();
    let store = MemoryStore::new();
    store.insert(&c.paths.initial_groundwater, landscape.max_groundwater.clone());
    let state = HydroState::initialize(&store, &c, &landscape).unwrap();
    Simulation::new(
        c,
        landscape,
        state,
        store,
        Forcing::Constant(0.0),
        Forcing::Constant(evap_mm_per_hour),
    )
    .unwrap()
}

#[test]
fn test_groundwater_sinks_share_storage_above_floor() {
    for evap in [20_000.0, 50.0, 0.0] {
        let mut sim = draining_slope(evap);
        assert_eq!(sim.landscape().max_groundwater[[0, 0]], 200.0);
        assert_eq!(sim.landscape().min_groundwater[[0, 0]], 50.0);

        let summary = sim.run().unwrap();
        assert!(
            summary.relative_error < TOLERANCE,
            "evap {evap}: residual {} (relative {})",
            summary.residual,
            summary.relative_error
        );
        let l = sim.landscape();
        for (&gw, &min) in sim.state().groundwater.iter().zip(l.min_groundwater.iter()) {
            assert!(gw >= min - 1e-9, "evap {evap}: storage {gw} below floor {min}");
        }
    }
}

#[test]
fn test_stores_stay_non_negative() {
    let mut sim = simulation(config(RoutingMode::Both), 80.0, 2.0);
    sim.run().unwrap();
    let l = sim.landscape();
    let s = sim.state();
    let min = sim.config().model.min_value;
    assert!(s.height.iter().all(|&h| h >= 0.0));
    assert!(s.discharge.iter().all(|&q| q >= min));
    assert!(s.seepage.iter().all(|&v| v >= 0.0));
    assert!(s.reinfiltration.iter().all(|&v| v >= 0.0));
    for (&gw, &max) in s.groundwater.iter().zip(l.max_groundwater.iter()) {
        assert!(gw >= 0.0 && gw <= max);
    }
    for (&int, &max) in s.interception.iter().zip(l.max_interception.iter()) {
        assert!(int >= 0.0 && int <= max + 1e-12);
    }
}

#[test]
fn test_dry_run_moves_no_water_to_the_outlet() {
    let mut c = config(RoutingMode::Surface);
    c.processes = hydrobase::config::ProcessConfig::none();
    let mut sim = simulation(c, 0.0, 0.0);
    let summary = sim.run().unwrap();
    assert_eq!(summary.balance.precipitation, 0.0);
    assert!(summary.balance.outflow < 1e-9);
}

#[test]
fn test_unknown_mode_is_rejected() {
    let err = SimulationConfig::from_json(r#"{ "routing": { "mode": "overland" } }"#).unwrap_err();
    assert!(matches!(err, HydroError::Json(_)));
    assert!(err.to_string().contains("overland"));
    assert!("overland".parse::<RoutingMode>().is_err());
}

#[test]
fn test_invalid_config_fails_before_running() {
    let mut c = config(RoutingMode::Both);
    let (landscape, state) = valley(&c);
    c.time.timestep = 0.0;
    let result = Simulation::new(
        c,
        landscape,
        state,
        MemoryStore::new(),
        Forcing::Constant(0.0),
        Forcing::Constant(0.0),
    );
    assert!(matches!(result, Err(HydroError::Config { .. })));
}

#[test]
fn test_reports_follow_mode_and_interval() {
    let mut sim = simulation(config(RoutingMode::Subsurface), 10.0, 0.0);
    sim.run().unwrap();
    let names = sim.store().names();
    // 720 sub-steps of 5 s reported every 72: ten reports of three layers,
    // plus the initial snapshot.
    assert_eq!(names.len(), 33);
    assert!(names.contains(&"5_groundwater_height_2023-01-01-0006.asc".to_string()));
    assert!(names.contains(&"5_gw_s_2023-01-01-0100.asc".to_string()));
    assert!(!names.iter().any(|n| n.contains("discharge")));
}
