//! D8 drainage network: a single downstream pointer per cell.
//!
//! The network is stored as a receiver array (`receivers[i] == i` marks a
//! sink) plus a CSR donor graph and a topological stack. `downstream` and
//! `upstream_sum` are the only operators the flux and routing code use to
//! reach across cells.
//!
//! Directions are exchanged with the outside world as PCRaster LDD keypad
//! codes:
//!
//! ```text
//!   7 8 9
//!   4 5 6      5 = sink / pit
//!   1 2 3
//! ```

use std::collections::VecDeque;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{HydroError, HydroResult};
use crate::graph::DonorGraph;
use crate::grid::{par_from_fn, Grid, Shape};

/// LDD code of a sink cell.
pub const SINK_CODE: u8 = 5;

/// Neighbour scan order (N, NE, E, SE, S, SW, W, NW) with the matching LDD
/// code. Slope ties resolve to the earliest entry.
const D8_OFFSETS: [(i32, i32, u8); 8] = [
    (-1, 0, 8),
    (-1, 1, 9),
    (0, 1, 6),
    (1, 1, 3),
    (1, 0, 2),
    (1, -1, 1),
    (0, -1, 4),
    (-1, -1, 7),
];

/// How cells on the domain edge are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryMode {
    /// Every edge cell is a sink; water leaves the domain there.
    #[default]
    Outlet,
    /// Edge cells drain to lower in-domain neighbours like interior cells.
    InDomain,
}

#[derive(Debug, Clone)]
pub struct DrainageNetwork {
    shape: Shape,
    receivers: Vec<usize>,
    donors: DonorGraph,
    /// Outlets first; iterate in reverse for upstream-to-downstream order.
    stack: Vec<usize>,
    /// Independent trees, each listed upstream to downstream.
    basins: Vec<Vec<usize>>,
    /// Position of each cell inside its basin list.
    basin_slot: Vec<usize>,
}

impl DrainageNetwork {
    /// Steepest-descent D8 directions on `height`. Diagonal neighbours are at
    /// `resolution * sqrt(2)`. Cells with no strictly lower neighbour are sinks.
    pub fn compute(height: &Grid<f64>, resolution: f64, boundary: BoundaryMode) -> Self {
        let shape = Shape::of(height);
        let diag = resolution * std::f64::consts::SQRT_2;

        let recv_grid = par_from_fn(shape, |(r, c)| {
            let i = shape.flat_index(r, c);
            if boundary == BoundaryMode::Outlet && shape.is_boundary(r, c) {
                return i;
            }
            let hi = height[[r, c]];
            let mut best_slope = 0.0;
            let mut best = i;
            for &(dr, dc, _) in D8_OFFSETS.iter() {
                let Some((nr, nc)) = shape.offset(r, c, dr, dc) else {
                    continue;
                };
                let dist = if dr != 0 && dc != 0 { diag } else { resolution };
                let s = (hi - height[[nr, nc]]) / dist;
                if s > best_slope {
                    best_slope = s;
                    best = shape.flat_index(nr, nc);
                }
            }
            best
        });

        let receivers: Vec<usize> = recv_grid.iter().copied().collect();
        Self::from_parts(shape, receivers)
    }

    /// Build from PCRaster LDD codes. Rejects unknown codes, pointers that
    /// leave the grid, and cycles.
    pub fn from_ldd(codes: &Grid<u8>) -> HydroResult<Self> {
        let shape = Shape::of(codes);
        let mut receivers = Vec::with_capacity(shape.len());
        for ((r, c), &code) in codes.indexed_iter() {
            let i = shape.flat_index(r, c);
            if code == SINK_CODE {
                receivers.push(i);
                continue;
            }
            let Some(&(dr, dc, _)) = D8_OFFSETS.iter().find(|o| o.2 == code) else {
                return Err(HydroError::InvalidDrainage {
                    message: format!("unknown LDD code {code} at ({r}, {c})"),
                });
            };
            let Some((nr, nc)) = shape.offset(r, c, dr, dc) else {
                return Err(HydroError::InvalidDrainage {
                    message: format!("LDD code {code} at ({r}, {c}) points off the grid"),
                });
            };
            receivers.push(shape.flat_index(nr, nc));
        }

        let net = Self::from_parts(shape, receivers);
        if net.stack.len() != shape.len() {
            return Err(HydroError::InvalidDrainage {
                message: format!(
                    "{} cells are part of a cycle and never reach a sink",
                    shape.len() - net.stack.len()
                ),
            });
        }
        Ok(net)
    }

    /// Same as [`from_ldd`](Self::from_ldd) for a field read from a float
    /// raster.
    pub fn from_ldd_field(field: &Grid<f64>) -> HydroResult<Self> {
        let mut codes = Grid::<u8>::zeros(field.dim());
        for ((r, c), &v) in field.indexed_iter() {
            let rounded = v.round();
            if !(1.0..=9.0).contains(&rounded) {
                return Err(HydroError::InvalidDrainage {
                    message: format!("LDD value {v} at ({r}, {c}) is not a keypad code"),
                });
            }
            codes[[r, c]] = rounded as u8;
        }
        Self::from_ldd(&codes)
    }

    fn from_parts(shape: Shape, receivers: Vec<usize>) -> Self {
        let donors = DonorGraph::from_receivers(&receivers);
        let stack = compute_stack_order(&receivers, &donors);
        let basins = split_basins(&receivers, &stack);
        let mut basin_slot = vec![0usize; receivers.len()];
        for basin in &basins {
            for (k, &i) in basin.iter().enumerate() {
                basin_slot[i] = k;
            }
        }
        Self {
            shape,
            receivers,
            donors,
            stack,
            basins,
            basin_slot,
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn receivers(&self) -> &[usize] {
        &self.receivers
    }

    #[inline]
    pub fn receiver(&self, i: usize) -> usize {
        self.receivers[i]
    }

    #[inline]
    pub fn donors_of(&self, i: usize) -> &[usize] {
        self.donors.donors_of(i)
    }

    #[inline]
    pub fn is_sink(&self, i: usize) -> bool {
        self.receivers[i] == i
    }

    pub fn stack(&self) -> &[usize] {
        &self.stack
    }

    pub fn basins(&self) -> &[Vec<usize>] {
        &self.basins
    }

    #[inline]
    pub fn basin_slot(&self, i: usize) -> usize {
        self.basin_slot[i]
    }

    /// Every other cell contributes exactly one donor edge.
    pub fn sink_count(&self) -> usize {
        self.donors.num_nodes() - self.donors.num_edges()
    }

    /// PCRaster codes for the current receivers, for writing back to disk.
    pub fn ldd_codes(&self) -> Grid<u8> {
        let shape = self.shape;
        par_from_fn(shape, |(r, c)| {
            let i = shape.flat_index(r, c);
            let j = self.receivers[i];
            if i == j {
                return SINK_CODE;
            }
            let (jr, jc) = shape.grid_index(j);
            let dr = jr as i32 - r as i32;
            let dc = jc as i32 - c as i32;
            D8_OFFSETS
                .iter()
                .find(|o| o.0 == dr && o.1 == dc)
                .map_or(SINK_CODE, |o| o.2)
        })
    }

    // -----------------------------------------------------------------------
    // Topology operators
    // -----------------------------------------------------------------------

    /// Value of `field` at each cell's receiver. Sinks return their own value.
    pub fn downstream(&self, field: &Grid<f64>) -> Grid<f64> {
        let shape = self.shape;
        let flat = field.as_slice();
        par_from_fn(shape, |(r, c)| {
            let j = self.receivers[shape.flat_index(r, c)];
            match flat {
                Some(s) => s[j],
                None => {
                    let (jr, jc) = shape.grid_index(j);
                    field[[jr, jc]]
                }
            }
        })
    }

    /// Sum of `field` over each cell's donors; zero where there are none.
    pub fn upstream_sum(&self, field: &Grid<f64>) -> Grid<f64> {
        let shape = self.shape;
        par_from_fn(shape, |(r, c)| {
            self.donors
                .donors_of(shape.flat_index(r, c))
                .iter()
                .map(|&d| {
                    let (dr, dc) = shape.grid_index(d);
                    field[[dr, dc]]
                })
                .sum()
        })
    }

    /// Number of cells draining directly into each cell.
    pub fn upstream_count(&self) -> Grid<f64> {
        let shape = self.shape;
        par_from_fn(shape, |(r, c)| {
            self.donors.degree(shape.flat_index(r, c)) as f64
        })
    }

    /// Sum of `weight` over each cell and everything upstream of it.
    pub fn accumulate(&self, weight: &Grid<f64>) -> Grid<f64> {
        let shape = self.shape;
        let mut acc: Vec<f64> = weight.iter().copied().collect();
        for &i in self.stack.iter().rev() {
            let j = self.receivers[i];
            if j != i {
                acc[j] += acc[i];
            }
        }
        Grid::from_shape_vec(shape.dim(), acc).unwrap_or_else(|_| Grid::zeros(shape.dim()))
    }
}

/// BFS from sinks through the donor graph: sinks first, ridges last. Cells
/// on a cycle are never reached.
fn compute_stack_order(receivers: &[usize], donors: &DonorGraph) -> Vec<usize> {
    let n = receivers.len();
    let mut stack = Vec::with_capacity(n);
    let mut queue: VecDeque<usize> = (0..n).filter(|&i| receivers[i] == i).collect();
    while let Some(i) = queue.pop_front() {
        stack.push(i);
        queue.extend(donors.donors_of(i).iter().copied());
    }
    stack
}

/// Group the stack by outlet and reverse each group to get
/// upstream-to-downstream order per basin.
fn split_basins(receivers: &[usize], stack: &[usize]) -> Vec<Vec<usize>> {
    let n = receivers.len();
    let mut basin_of = vec![usize::MAX; n];
    let mut basins: Vec<Vec<usize>> = Vec::new();
    for &i in stack {
        let j = receivers[i];
        let b = if j == i {
            basins.push(Vec::new());
            basins.len() - 1
        } else {
            basin_of[j]
        };
        basin_of[i] = b;
        basins[b].push(i);
    }
    basins.par_iter_mut().for_each(|b| b.reverse());
    basins
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{filled, ones};

    fn bowl() -> Grid<f64> {
        let mut h = filled(Shape::new(3, 3), 1.0);
        h[[1, 1]] = 0.0;
        h
    }

    #[test]
    fn test_bowl_in_domain_drains_to_center() {
        let net = DrainageNetwork::compute(&bowl(), 1.0, BoundaryMode::InDomain);
        for i in 0..9 {
            assert_eq!(net.receiver(i), 4, "cell {i}");
        }
        assert_eq!(net.sink_count(), 1);
        assert_eq!(net.ldd_codes()[[0, 0]], 3);
        assert_eq!(net.ldd_codes()[[0, 1]], 2);
        assert_eq!(net.ldd_codes()[[1, 2]], 4);
        assert_eq!(net.ldd_codes()[[1, 1]], SINK_CODE);
    }

    #[test]
    fn test_outlet_boundary_makes_edges_sinks() {
        let net = DrainageNetwork::compute(&bowl(), 1.0, BoundaryMode::Outlet);
        assert_eq!(net.sink_count(), 9);
        assert_eq!(net.basins().len(), 9);
    }

    #[test]
    fn test_steepest_descent_uses_diagonal_distance() {
        // NE neighbour drops 1.3 over sqrt(2), E neighbour drops 1.0 over 1.
        let mut h = filled(Shape::new(3, 3), 5.0);
        h[[1, 1]] = 2.0;
        h[[0, 2]] = 0.7;
        h[[1, 2]] = 1.0;
        let net = DrainageNetwork::compute(&h, 1.0, BoundaryMode::InDomain);
        assert_eq!(net.receiver(4), 5);
    }

    #[test]
    fn test_flat_is_sink() {
        let net = DrainageNetwork::compute(&ones(Shape::new(4, 4)), 10.0, BoundaryMode::InDomain);
        assert_eq!(net.sink_count(), 16);
        assert_eq!(net.upstream_sum(&ones(Shape::new(4, 4))).sum(), 0.0);
    }

    #[test]
    fn test_upstream_sum_of_ones_counts_donors() {
        let net = DrainageNetwork::compute(&bowl(), 1.0, BoundaryMode::InDomain);
        let counts = net.upstream_sum(&ones(Shape::new(3, 3)));
        assert_eq!(counts[[1, 1]], 8.0);
        assert_eq!(counts[[0, 0]], 0.0);
        assert_eq!(counts, net.upstream_count());
    }

    #[test]
    fn test_every_non_sink_contributes_once() {
        let shape = Shape::new(6, 5);
        let h = par_from_fn(shape, |(r, c)| ((r * 7 + c * 3) % 5) as f64 + r as f64 * 0.1);
        let net = DrainageNetwork::compute(&h, 1.0, BoundaryMode::InDomain);
        let total = net.upstream_sum(&ones(shape)).sum();
        let non_sinks = (shape.len() - net.sink_count()) as f64;
        assert_eq!(total, non_sinks);
        for i in 0..shape.len() {
            let j = net.receiver(i);
            if j != i {
                let (r, c) = shape.grid_index(i);
                let (jr, jc) = shape.grid_index(j);
                assert!(h[[jr, jc]] < h[[r, c]]);
            }
        }
    }

    #[test]
    fn test_downstream_sink_returns_own_value() {
        let net = DrainageNetwork::compute(&bowl(), 1.0, BoundaryMode::InDomain);
        let mut v = filled(Shape::new(3, 3), 2.0);
        v[[1, 1]] = 9.0;
        let d = net.downstream(&v);
        assert!(d.iter().all(|&x| x == 9.0));
    }

    #[test]
    fn test_stack_orders_donors_before_receivers() {
        let shape = Shape::new(8, 8);
        let h = par_from_fn(shape, |(r, c)| (r as f64 - 3.5).powi(2) + (c as f64 * 1.3).sin());
        let net = DrainageNetwork::compute(&h, 1.0, BoundaryMode::InDomain);
        assert_eq!(net.stack().len(), shape.len());
        let mut pos = vec![0usize; shape.len()];
        for (k, &i) in net.stack().iter().enumerate() {
            pos[i] = k;
        }
        for i in 0..shape.len() {
            let j = net.receiver(i);
            if j != i {
                assert!(pos[j] < pos[i]);
            }
        }
        let cells: usize = net.basins().iter().map(Vec::len).sum();
        assert_eq!(cells, shape.len());
    }

    #[test]
    fn test_ldd_round_trip() {
        let net = DrainageNetwork::compute(&bowl(), 1.0, BoundaryMode::InDomain);
        let again = DrainageNetwork::from_ldd(&net.ldd_codes()).unwrap();
        assert_eq!(again.receivers(), net.receivers());
    }

    #[test]
    fn test_from_ldd_rejects_cycle() {
        // 6 then 4: two cells pointing at each other.
        let mut codes = filled(Shape::new(1, 3), 5u8);
        codes[[0, 0]] = 6;
        codes[[0, 1]] = 4;
        let err = DrainageNetwork::from_ldd(&codes).unwrap_err();
        assert!(matches!(err, HydroError::InvalidDrainage { .. }));
    }

    #[test]
    fn test_sink_count_matches_receivers() {
        let shape = Shape::new(7, 6);
        let h = par_from_fn(shape, |(r, c)| ((r * 5 + c * 11) % 7) as f64);
        for boundary in [BoundaryMode::Outlet, BoundaryMode::InDomain] {
            let net = DrainageNetwork::compute(&h, 1.0, boundary);
            let expected = (0..shape.len()).filter(|&i| net.receiver(i) == i).count();
            assert_eq!(net.sink_count(), expected);
        }
    }

    #[test]
    fn test_from_ldd_rejects_off_grid() {
        let codes = filled(Shape::new(1, 1), 8u8);
        assert!(DrainageNetwork::from_ldd(&codes).is_err());
        let field = filled(Shape::new(1, 1), 0.0);
        assert!(DrainageNetwork::from_ldd_field(&field).is_err());
    }

    #[test]
    fn test_accumulate_counts_upstream_cells() {
        let net = DrainageNetwork::compute(&bowl(), 1.0, BoundaryMode::InDomain);
        let acc = net.accumulate(&ones(Shape::new(3, 3)));
        assert_eq!(acc[[1, 1]], 9.0);
        assert_eq!(acc[[0, 0]], 1.0);
    }
}
