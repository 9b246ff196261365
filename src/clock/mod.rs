// ============================================================================
// Multirate Clock
//
// Three nested intervals, all counted in routing sub-steps:
//
//   Report interval  (hours)   - write state, optionally refresh gw drainage
//   Update interval  (minutes) - sample forcing, recompute fluxes
//   Routing sub-step (seconds) - apply fluxes, route discharge
//
// Accumulators fire the outer intervals when the sub-step that closes them
// completes.
// ============================================================================

use chrono::{Duration, NaiveDateTime};

use crate::config::TimeConfig;

/// Phase of the time loop within one update interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    LoadForcing,
    ComputeFluxes,
    Route,
    Finished,
}

#[derive(Debug, Clone)]
pub struct SimulationClock {
    /// Completed routing sub-steps
    pub substep: u64,
    /// Completed update intervals
    pub update: u64,
    /// Completed report intervals
    pub report: u64,
    /// Simulated time since start [s]
    pub elapsed_s: f64,
    update_accumulator: u64,
    report_accumulator: u64,
    total_substeps: u64,
    config: TimeConfig,
}

/// Which outer intervals closed on this sub-step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickResult {
    pub fire_update: bool,
    pub fire_report: bool,
}

impl SimulationClock {
    pub fn new(config: TimeConfig) -> Self {
        Self {
            substep:            0,
            update:             0,
            report:             0,
            elapsed_s:          0.0,
            update_accumulator: 0,
            report_accumulator: 0,
            total_substeps:     config.total_substeps(),
            config,
        }
    }

    /// Advance one routing sub-step.
    pub fn advance_substep(&mut self) -> TickResult {
        self.substep += 1;
        self.elapsed_s = self.substep as f64 * self.config.timestep;
        self.update_accumulator += 1;
        self.report_accumulator += 1;

        let fire_update = self.update_accumulator >= self.config.substeps_per_update;
        if fire_update {
            self.update_accumulator = 0;
            self.update += 1;
        }
        let fire_report = self.report_accumulator >= self.config.substeps_per_report;
        if fire_report {
            self.report_accumulator = 0;
            self.report += 1;
        }
        TickResult { fire_update, fire_report }
    }

    pub fn is_finished(&self) -> bool {
        self.substep >= self.total_substeps
    }

    pub fn total_substeps(&self) -> u64 {
        self.total_substeps
    }

    pub fn timestep(&self) -> f64 {
        self.config.timestep
    }

    /// Timestamp at the current position of the clock.
    pub fn now(&self) -> NaiveDateTime {
        self.config.start + Duration::milliseconds((self.elapsed_s * 1000.0).round() as i64)
    }

    pub fn start(&self) -> NaiveDateTime {
        self.config.start
    }

    /// Fraction of the run completed, in [0, 1].
    pub fn progress(&self) -> f64 {
        if self.total_substeps == 0 {
            1.0
        } else {
            self.substep as f64 / self.total_substeps as f64
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "{} | sub-step {}/{} | update {} | report {}",
            self.now().format("%Y-%m-%d %H:%M:%S"),
            self.substep,
            self.total_substeps,
            self.update,
            self.report
        )
    }
}
