//! Grid persistence.
//!
//! The model only needs `read(name) -> grid` and `write(grid, name)`.
//! [`AsciiGridStore`] keeps rasters as ESRI ASCII grids on disk and
//! [`MemoryStore`] keeps them in a map for tests and embedding.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};

use crate::error::{HydroError, HydroResult};
use crate::grid::Grid;

pub trait GridStore: Send + Sync {
    fn read(&self, name: &str) -> HydroResult<Grid<f64>>;
    fn write(&self, grid: &Grid<f64>, name: &str) -> HydroResult<()>;
    fn exists(&self, name: &str) -> bool;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryStore {
    grids: RwLock<HashMap<String, Grid<f64>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: &str, grid: Grid<f64>) {
        self.grids.write().insert(name.to_string(), grid);
    }

    pub fn get(&self, name: &str) -> Option<Grid<f64>> {
        self.grids.read().get(name).cloned()
    }

    /// Stored names in sorted order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.grids.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.grids.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl GridStore for MemoryStore {
    fn read(&self, name: &str) -> HydroResult<Grid<f64>> {
        self.get(name).ok_or_else(|| HydroError::MissingInput {
            path: PathBuf::from(name),
        })
    }

    fn write(&self, grid: &Grid<f64>, name: &str) -> HydroResult<()> {
        self.insert(name, grid.clone());
        Ok(())
    }

    fn exists(&self, name: &str) -> bool {
        self.grids.read().contains_key(name)
    }
}

// ---------------------------------------------------------------------------
// ESRI ASCII grid store
// ---------------------------------------------------------------------------

/// Georeference carried from the first raster read to every raster written.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AsciiHeader {
    pub xllcorner: f64,
    pub yllcorner: f64,
    pub cellsize: f64,
    pub nodata: f64,
}

impl Default for AsciiHeader {
    fn default() -> Self {
        Self {
            xllcorner: 0.0,
            yllcorner: 0.0,
            cellsize: 1.0,
            nodata: -9999.0,
        }
    }
}

#[derive(Debug)]
pub struct AsciiGridStore {
    input_dir: PathBuf,
    output_dir: PathBuf,
    header: Mutex<Option<AsciiHeader>>,
}

impl AsciiGridStore {
    pub fn new(input_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            input_dir: input_dir.into(),
            output_dir: output_dir.into(),
            header: Mutex::new(None),
        }
    }

    pub fn with_cellsize(self, cellsize: f64) -> Self {
        *self.header.lock() = Some(AsciiHeader {
            cellsize,
            ..AsciiHeader::default()
        });
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn resolve(dir: &Path, name: &str) -> PathBuf {
        let p = dir.join(name);
        if p.extension().is_some() {
            p
        } else {
            p.with_extension("asc")
        }
    }

    pub fn input_path(&self, name: &str) -> PathBuf {
        Self::resolve(&self.input_dir, name)
    }

    pub fn output_path(&self, name: &str) -> PathBuf {
        Self::resolve(&self.output_dir, name)
    }
}

impl GridStore for AsciiGridStore {
    fn read(&self, name: &str) -> HydroResult<Grid<f64>> {
        let path = self.input_path(name);
        let text = std::fs::read_to_string(&path).map_err(|e| HydroError::io(&path, e))?;
        let (header, grid) = parse_ascii_grid(&text, &path)?;
        let mut slot = self.header.lock();
        if slot.is_none() {
            *slot = Some(header);
        }
        Ok(grid)
    }

    fn write(&self, grid: &Grid<f64>, name: &str) -> HydroResult<()> {
        let path = self.output_path(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| HydroError::io(parent, e))?;
        }
        let header = self.header.lock().unwrap_or_default();
        let text = format_ascii_grid(grid, &header);
        std::fs::write(&path, text).map_err(|e| HydroError::io(&path, e))
    }

    fn exists(&self, name: &str) -> bool {
        self.input_path(name).is_file()
    }
}

/// Parse an ESRI ASCII grid. NODATA cells become 0.0.
pub fn parse_ascii_grid(text: &str, path: &Path) -> HydroResult<(AsciiHeader, Grid<f64>)> {
    let mut header = AsciiHeader::default();
    let mut nrows: Option<usize> = None;
    let mut ncols: Option<usize> = None;
    let mut values: Vec<f64> = Vec::new();
    let mut in_body = false;

    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut tokens = line.split_whitespace();
        let first = tokens.next().unwrap_or_default();
        if !in_body && first.parse::<f64>().is_err() {
            let value = tokens
                .next()
                .ok_or_else(|| HydroError::parse(path, lineno + 1, format!("header '{first}' has no value")))?;
            let num = |v: &str| {
                v.parse::<f64>()
                    .map_err(|_| HydroError::parse(path, lineno + 1, format!("bad number '{v}'")))
            };
            match first.to_ascii_lowercase().as_str() {
                "ncols" => ncols = Some(num(value)? as usize),
                "nrows" => nrows = Some(num(value)? as usize),
                "xllcorner" | "xllcenter" => header.xllcorner = num(value)?,
                "yllcorner" | "yllcenter" => header.yllcorner = num(value)?,
                "cellsize" => header.cellsize = num(value)?,
                "nodata_value" => header.nodata = num(value)?,
                other => {
                    return Err(HydroError::parse(path, lineno + 1, format!("unknown header '{other}'")));
                }
            }
            continue;
        }
        in_body = true;
        for tok in line.split_whitespace() {
            let v: f64 = tok
                .parse()
                .map_err(|_| HydroError::parse(path, lineno + 1, format!("bad value '{tok}'")))?;
            values.push(if v == header.nodata { 0.0 } else { v });
        }
    }

    let (Some(rows), Some(cols)) = (nrows, ncols) else {
        return Err(HydroError::parse(path, 1, "missing nrows/ncols header"));
    };
    if values.len() != rows * cols {
        return Err(HydroError::parse(
            path,
            text.lines().count(),
            format!("expected {} values, found {}", rows * cols, values.len()),
        ));
    }
    let grid = Grid::from_shape_vec((rows, cols), values)
        .map_err(|e| HydroError::parse(path, 1, e.to_string()))?;
    Ok((header, grid))
}

pub fn format_ascii_grid(grid: &Grid<f64>, header: &AsciiHeader) -> String {
    let (rows, cols) = grid.dim();
    let mut out = String::with_capacity(rows * cols * 12 + 128);
    let _ = writeln!(out, "ncols {cols}");
    let _ = writeln!(out, "nrows {rows}");
    let _ = writeln!(out, "xllcorner {}", header.xllcorner);
    let _ = writeln!(out, "yllcorner {}", header.yllcorner);
    let _ = writeln!(out, "cellsize {}", header.cellsize);
    let _ = writeln!(out, "NODATA_value {}", header.nodata);
    for row in grid.rows() {
        let line: Vec<String> = row.iter().map(|v| format!("{v:e}")).collect();
        out.push_str(&line.join(" "));
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{par_from_fn, Shape};

    #[test]
    fn test_memory_store_round_trip() {
        let store = MemoryStore::new();
        assert!(store.read("dem").unwrap_err().is_missing_input());
        let g = par_from_fn(Shape::new(2, 3), |(r, c)| (r + c) as f64);
        store.write(&g, "dem").unwrap();
        assert!(store.exists("dem"));
        assert_eq!(store.read("dem").unwrap(), g);
        assert_eq!(store.names(), vec!["dem".to_string()]);
    }

    #[test]
    fn test_parse_ascii_grid_with_nodata() {
        let text = "ncols 3\nnrows 2\nxllcorner 10\nyllcorner 20\ncellsize 5\nNODATA_value -9999\n1 2 3\n4 -9999 6\n";
        let (h, g) = parse_ascii_grid(text, Path::new("t.asc")).unwrap();
        assert_eq!(h.cellsize, 5.0);
        assert_eq!(h.xllcorner, 10.0);
        assert_eq!(g.dim(), (2, 3));
        assert_eq!(g[[1, 1]], 0.0);
        assert_eq!(g[[1, 2]], 6.0);
    }

    #[test]
    fn test_parse_ascii_grid_rejects_short_body() {
        let text = "ncols 3\nnrows 2\n1 2 3\n";
        let err = parse_ascii_grid(text, Path::new("t.asc")).unwrap_err();
        assert!(matches!(err, HydroError::Parse { .. }));
    }

    #[test]
    fn test_ascii_store_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = AsciiGridStore::new(dir.path(), dir.path()).with_cellsize(5.0);
        let g = par_from_fn(Shape::new(3, 4), |(r, c)| r as f64 * 0.25 - c as f64 * 1e-7);
        store.write(&g, "state").unwrap();
        assert!(store.exists("state"));
        let back = store.read("state").unwrap();
        for (a, b) in g.iter().zip(back.iter()) {
            assert!((a - b).abs() < 1e-15);
        }
        assert!(store.read("nothing").unwrap_err().is_missing_input());
    }
}
