//! Dense per-cell fields.
//!
//! Every state and parameter field is a contiguous `Array2` in row-major
//! order, and each model pass touches only the arrays it needs. Cellwise
//! kernels run through `ndarray::Zip` with rayon, so results never depend on
//! how the grid is split across threads.

use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};

/// A dense 2D field. Row 0 is the northern edge.
pub type Grid<T> = Array2<T>;

/// Grid dimensions plus flat-index helpers shared by the drainage code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    pub rows: usize,
    pub cols: usize,
}

impl Shape {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }

    pub fn of<T>(grid: &Grid<T>) -> Self {
        let (rows, cols) = grid.dim();
        Self { rows, cols }
    }

    #[inline]
    pub fn dim(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn flat_index(&self, row: usize, col: usize) -> usize {
        row * self.cols + col
    }

    #[inline]
    pub fn grid_index(&self, idx: usize) -> (usize, usize) {
        (idx / self.cols, idx % self.cols)
    }

    #[inline]
    pub fn is_boundary(&self, row: usize, col: usize) -> bool {
        row == 0 || col == 0 || row + 1 == self.rows || col + 1 == self.cols
    }

    /// Offset a cell by `(dr, dc)`, returning `None` when it leaves the grid.
    #[inline]
    pub fn offset(&self, row: usize, col: usize, dr: i32, dc: i32) -> Option<(usize, usize)> {
        let r = row as i64 + dr as i64;
        let c = col as i64 + dc as i64;
        if r < 0 || c < 0 || r >= self.rows as i64 || c >= self.cols as i64 {
            None
        } else {
            Some((r as usize, c as usize))
        }
    }
}

// ---------------------------------------------------------------------------
// Factories
// ---------------------------------------------------------------------------

pub fn zeros(shape: Shape) -> Grid<f64> {
    Array2::zeros(shape.dim())
}

pub fn ones(shape: Shape) -> Grid<f64> {
    Array2::ones(shape.dim())
}

pub fn filled<T: Clone>(shape: Shape, value: T) -> Grid<T> {
    Array2::from_elem(shape.dim(), value)
}

// ---------------------------------------------------------------------------
// Data-parallel kernels
// ---------------------------------------------------------------------------

/// Build a field by evaluating `f` at every `(row, col)` in parallel.
pub fn par_from_fn<T, F>(shape: Shape, f: F) -> Grid<T>
where
    T: Clone + Default + Send + Sync,
    F: Fn((usize, usize)) -> T + Sync + Send,
{
    let mut out = filled(shape, T::default());
    Zip::indexed(&mut out).par_for_each(|idx, v| *v = f(idx));
    out
}

/// Parallel elementwise map of one field.
pub fn par_map<F>(a: &Grid<f64>, f: F) -> Grid<f64>
where
    F: Fn(f64) -> f64 + Sync + Send,
{
    Zip::from(a).par_map_collect(|&x| f(x))
}

/// Parallel elementwise combination of two fields of the same shape.
pub fn par_map2<F>(a: &Grid<f64>, b: &Grid<f64>, f: F) -> Grid<f64>
where
    F: Fn(f64, f64) -> f64 + Sync + Send,
{
    Zip::from(a).and(b).par_map_collect(|&x, &y| f(x, y))
}

/// Clamp every cell to `>= floor` in place.
pub fn floor_in_place(g: &mut Grid<f64>, floor: f64) {
    g.par_mapv_inplace(|v| if v < floor || v.is_nan() { floor } else { v });
}

pub fn min_max(g: &Grid<f64>) -> (f64, f64) {
    g.iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)))
}
