//! Model state as struct-of-arrays.
//!
//! [`Landscape`] holds everything that is fixed for a run: terrain, soil and
//! land-use parameters, derived capacities and the surface drainage network.
//! [`HydroState`] holds the stores that the time loop advances.

use tracing::warn;

use crate::config::SimulationConfig;
use crate::drainage::DrainageNetwork;
use crate::error::{HydroError, HydroResult};
use crate::grid::{floor_in_place, par_map, par_map2, zeros, Grid, Shape};
use crate::io::store::GridStore;
use crate::io::tables::{LandUseFields, SoilFields};
use crate::routing::{KinematicAlpha, StageDischarge};

/// Clamp range for the square root of the bed slope.
const SQRT_SLOPE_MIN: f64 = 1e-5;
const SQRT_SLOPE_MAX: f64 = 0.05;

/// Static fields. Capacities are in m³ of soil (groundwater) or water
/// (interception).
#[derive(Debug, Clone)]
pub struct Landscape {
    pub shape: Shape,
    pub resolution: f64,
    pub cell_area: f64,

    // === Terrain ===
    /// Surface elevation [m]
    pub dem: Grid<f64>,
    /// Elevation of the impermeable layer [m]
    pub impermeable_height: Grid<f64>,

    // === Soil ===
    /// Saturated hydraulic conductivity [m/s]
    pub ks: Grid<f64>,
    pub porosity: Grid<f64>,
    pub wilting_point: Grid<f64>,
    /// Saturated soil volume at full storage [m³]
    pub max_groundwater: Grid<f64>,
    /// Storage below which lateral outflow stops [m³]
    pub min_groundwater: Grid<f64>,

    // === Land use ===
    pub mannings: Grid<f64>,
    pub permeability: Grid<f64>,
    /// Canopy capacity [m³]
    pub max_interception: Grid<f64>,
    pub throughfall: Grid<f64>,

    // === Channel ===
    /// Stage-discharge coefficient n / (sqrt(S) * w)
    pub coefficient: Grid<f64>,
    /// Kinematic-wave alpha per cell
    pub alpha: Grid<f64>,
    /// Channel length per cell [m]
    pub channel_length: Grid<f64>,
    /// Wetted channel area per cell [m²]
    pub channel_area: f64,

    pub surface_drainage: DrainageNetwork,
}

impl Landscape {
    pub fn new(
        config: &SimulationConfig,
        dem: Grid<f64>,
        soil: SoilFields,
        land: LandUseFields,
        surface_drainage: DrainageNetwork,
    ) -> HydroResult<Self> {
        let shape = Shape::of(&dem);
        for (name, g) in [
            ("ks", &soil.ks),
            ("porosity", &soil.porosity),
            ("wilting_point", &soil.wilting_point),
            ("mannings", &land.mannings),
            ("permeability", &land.permeability),
            ("interception", &land.interception_depth),
            ("throughfall", &land.throughfall),
        ] {
            check_shape(name, shape, g)?;
        }
        if surface_drainage.shape() != shape {
            return Err(HydroError::ShapeMismatch {
                name: "ldd".into(),
                expected: shape.dim(),
                found: surface_drainage.shape().dim(),
            });
        }

        let m = &config.model;
        let cell_area = m.cell_area();
        let depth = m.impermeable_layer_depth;

        let impermeable_height = par_map(&dem, |h| h - depth);
        let max_groundwater = crate::grid::filled(shape, depth * cell_area);
        let min_groundwater = par_map2(&soil.wilting_point, &soil.porosity, |wp, por| {
            if por > 0.0 {
                (depth * cell_area * wp / por).min(depth * cell_area)
            } else {
                0.0
            }
        });
        let max_interception = par_map(&land.interception_depth, |d| d.max(0.0) * cell_area);

        let sqrt_slope = m.channel_slope.sqrt().clamp(SQRT_SLOPE_MIN, SQRT_SLOPE_MAX);
        let width = m.channel_width;
        let coefficient = par_map(&land.mannings, |n| n / (sqrt_slope * width));
        let alpha = match m.alpha {
            KinematicAlpha::Fixed(a) => crate::grid::filled(shape, a),
            KinematicAlpha::StageConsistent => {
                par_map(&coefficient, |c| StageDischarge::new(c).kinematic_alpha(width))
            }
        };

        Ok(Self {
            shape,
            resolution: m.resolution,
            cell_area,
            dem,
            impermeable_height,
            ks: soil.ks,
            porosity: soil.porosity,
            wilting_point: soil.wilting_point,
            max_groundwater,
            min_groundwater,
            mannings: land.mannings,
            permeability: land.permeability,
            max_interception,
            throughfall: land.throughfall,
            coefficient,
            alpha,
            channel_length: crate::grid::filled(shape, m.channel_length()),
            channel_area: m.channel_area(),
            surface_drainage,
        })
    }

    /// Water-table elevation for a groundwater storage field.
    pub fn groundwater_height(&self, groundwater: &Grid<f64>) -> Grid<f64> {
        let ca = self.cell_area;
        par_map2(&self.impermeable_height, groundwater, |base, s| base + s / ca)
    }

    /// Initial groundwater storage when no raster is supplied: the water
    /// table sits `water_below_dem` under the surface, but never below the
    /// groundwater base level.
    pub fn default_groundwater(&self, groundwater_base: f64, water_below_dem: f64) -> Grid<f64> {
        let ca = self.cell_area;
        let mut out = zeros(self.shape);
        ndarray::Zip::from(&mut out)
            .and(&self.dem)
            .and(&self.impermeable_height)
            .and(&self.max_groundwater)
            .par_for_each(|s, &dem, &base, &max| {
                let table = if dem > groundwater_base + water_below_dem {
                    dem - water_below_dem
                } else {
                    groundwater_base
                };
                *s = ((table - base) * ca).clamp(0.0, max);
            });
        out
    }

    /// Discharge for a height field through the stage-discharge relation.
    pub fn discharge_from_height(&self, height: &Grid<f64>, floor: f64) -> Grid<f64> {
        let mut q = par_map2(height, &self.coefficient, |h, c| {
            StageDischarge::new(c).discharge_from_height(h)
        });
        floor_in_place(&mut q, floor);
        q
    }

    pub fn height_from_discharge(&self, discharge: &Grid<f64>) -> Grid<f64> {
        par_map2(discharge, &self.coefficient, |q, c| {
            StageDischarge::new(c).height_from_discharge(q)
        })
    }
}

/// Dynamic stores advanced by the time loop.
#[derive(Debug, Clone)]
pub struct HydroState {
    /// Saturated soil volume above the impermeable layer [m³]
    pub groundwater: Grid<f64>,
    /// Channel water height [m]
    pub height: Grid<f64>,
    /// Channel discharge [m³/s]
    pub discharge: Grid<f64>,
    /// Canopy water [m³]
    pub interception: Grid<f64>,
    /// Water leaving saturated soil in the last sub-step [m³]
    pub seepage: Grid<f64>,
    /// Channel water returned to the soil in the last sub-step [m³]
    pub reinfiltration: Grid<f64>,
    pub groundwater_drainage: DrainageNetwork,
}

impl HydroState {
    /// Load initial stores from `store`, deriving any that are missing.
    pub fn initialize<S: GridStore + ?Sized>(
        store: &S,
        config: &SimulationConfig,
        landscape: &Landscape,
    ) -> HydroResult<Self> {
        let paths = &config.paths;
        let m = &config.model;
        let shape = landscape.shape;

        let groundwater = match read_optional(store, &paths.initial_groundwater, shape)? {
            Some(mut g) => {
                ndarray::Zip::from(&mut g)
                    .and(&landscape.max_groundwater)
                    .par_for_each(|s, &max| *s = s.clamp(0.0, max));
                g
            }
            None => landscape.default_groundwater(m.groundwater_base, m.water_below_dem),
        };

        let height = match read_optional(store, &paths.initial_height, shape)? {
            Some(h) => par_map(&h, |v| v.max(0.0)),
            None => zeros(shape),
        };

        let discharge = match read_optional(store, &paths.initial_discharge, shape)? {
            Some(mut q) => {
                floor_in_place(&mut q, m.min_value);
                q
            }
            None => landscape.discharge_from_height(&height, m.min_value),
        };

        let interception = match read_optional(store, &paths.initial_interception, shape)? {
            Some(mut s) => {
                ndarray::Zip::from(&mut s)
                    .and(&landscape.max_interception)
                    .par_for_each(|v, &max| *v = v.clamp(0.0, max));
                s
            }
            None => zeros(shape),
        };

        let gw_height = landscape.groundwater_height(&groundwater);
        let groundwater_drainage =
            DrainageNetwork::compute(&gw_height, landscape.resolution, config.routing.boundary);

        Ok(Self {
            groundwater,
            height,
            discharge,
            interception,
            seepage: zeros(shape),
            reinfiltration: zeros(shape),
            groundwater_drainage,
        })
    }
}

pub(crate) fn check_shape(name: &str, expected: Shape, grid: &Grid<f64>) -> HydroResult<()> {
    if grid.dim() != expected.dim() {
        return Err(HydroError::ShapeMismatch {
            name: name.to_string(),
            expected: expected.dim(),
            found: grid.dim(),
        });
    }
    Ok(())
}

/// Read an initial-condition raster. A missing one is logged and reported as
/// `None` so the caller can derive a default.
fn read_optional<S: GridStore + ?Sized>(
    store: &S,
    name: &str,
    shape: Shape,
) -> HydroResult<Option<Grid<f64>>> {
    match store.read(name) {
        Ok(g) => {
            check_shape(name, shape, &g)?;
            Ok(Some(g))
        }
        Err(e) if e.is_missing_input() => {
            warn!(input = name, "initial state not found, deriving default");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drainage::BoundaryMode;
    use crate::grid::filled;
    use crate::io::store::MemoryStore;

    fn landscape(dem: Grid<f64>, config: &SimulationConfig) -> Landscape {
        let shape = Shape::of(&dem);
        let drainage =
            DrainageNetwork::compute(&dem, config.model.resolution, BoundaryMode::Outlet);
        Landscape::new(
            config,
            dem,
            SoilFields::uniform(shape, 1e-5, 0.4, 0.1),
            LandUseFields::uniform(shape, 0.045, 0.8, 0.001, 0.9),
            drainage,
        )
        .unwrap()
    }

    #[test]
    fn test_capacities() {
        let mut config = SimulationConfig::default();
        config.model.resolution = 2.0;
        config.model.impermeable_layer_depth = 3.0;
        let l = landscape(filled(Shape::new(2, 2), 10.0), &config);
        assert_eq!(l.max_groundwater[[0, 0]], 12.0);
        assert!((l.min_groundwater[[0, 0]] - 12.0 * 0.1 / 0.4).abs() < 1e-12);
        assert!((l.max_interception[[0, 0]] - 0.004).abs() < 1e-15);
        assert_eq!(l.impermeable_height[[1, 1]], 7.0);
    }

    #[test]
    fn test_default_groundwater_follows_dem_or_base() {
        let mut config = SimulationConfig::default();
        config.model.resolution = 1.0;
        config.model.impermeable_layer_depth = 5.0;
        let mut dem = filled(Shape::new(1, 2), 10.0);
        dem[[0, 1]] = 2.0;
        let l = landscape(dem, &config);
        let gw = l.default_groundwater(1.5, 1.0);
        // Cell 0: table at 9, base at 5.
        assert_eq!(gw[[0, 0]], 4.0);
        // Cell 1: dem 2 <= 2.5 so the table sits at the base level 1.5,
        // 4.5 above the impermeable layer at -3.
        assert_eq!(gw[[0, 1]], 4.5);
    }

    #[test]
    fn test_missing_initial_state_is_derived() {
        let config = SimulationConfig::default();
        let l = landscape(filled(Shape::new(3, 3), 4.0), &config);
        let store = MemoryStore::new();
        let s = HydroState::initialize(&store, &config, &l).unwrap();
        assert_eq!(s.height.sum(), 0.0);
        assert!(s.discharge.iter().all(|&q| q == config.model.min_value));
        assert_eq!(s.interception.sum(), 0.0);
        assert!(s.groundwater.iter().all(|&g| g > 0.0));
    }

    #[test]
    fn test_loaded_state_with_wrong_shape_fails() {
        let config = SimulationConfig::default();
        let l = landscape(filled(Shape::new(3, 3), 4.0), &config);
        let store = MemoryStore::new();
        store.insert(&config.paths.initial_height, zeros(Shape::new(2, 2)));
        let err = HydroState::initialize(&store, &config, &l).unwrap_err();
        assert!(matches!(err, HydroError::ShapeMismatch { .. }));
    }
}
