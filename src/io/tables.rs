//! Category lookup tables.
//!
//! Soil and land-use maps carry integer category codes. A small CSV table
//! joins each code to its physical properties; codes missing from the table
//! keep the defaults.
//!
//! ```text
//! soil.csv      ID,Ks[,porosity,wilting_point]     Ks in m/day
//! land_use.csv  Code,Friction,Permeability,Interception,f
//! ```

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use serde::Deserialize;

use crate::error::{HydroError, HydroResult};
use crate::grid::{filled, par_from_fn, Grid, Shape};

const SECONDS_PER_DAY: f64 = 86_400.0;

// ---------------------------------------------------------------------------
// Soil
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SoilProperties {
    /// Saturated conductivity [m/day]
    pub ks: f64,
    pub porosity: f64,
    pub wilting_point: f64,
}

impl Default for SoilProperties {
    fn default() -> Self {
        Self {
            ks:            0.05,
            porosity:      0.35,
            wilting_point: 0.15,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SoilRecord {
    #[serde(rename = "ID")]
    id: i64,
    #[serde(rename = "Ks")]
    ks: f64,
    #[serde(default)]
    porosity: Option<f64>,
    #[serde(default)]
    wilting_point: Option<f64>,
}

/// Per-cell soil parameters, `ks` already in m/s.
#[derive(Debug, Clone)]
pub struct SoilFields {
    pub ks: Grid<f64>,
    pub porosity: Grid<f64>,
    pub wilting_point: Grid<f64>,
}

impl SoilFields {
    pub fn uniform(shape: Shape, ks_m_per_s: f64, porosity: f64, wilting_point: f64) -> Self {
        Self {
            ks: filled(shape, ks_m_per_s),
            porosity: filled(shape, porosity),
            wilting_point: filled(shape, wilting_point),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SoilTable {
    entries: HashMap<i64, SoilProperties>,
    pub defaults: SoilProperties,
}

impl SoilTable {
    pub fn from_csv(path: &Path) -> HydroResult<Self> {
        let file = std::fs::File::open(path).map_err(|e| HydroError::io(path, e))?;
        Self::from_reader(file, path)
    }

    pub fn from_reader<R: Read>(reader: R, path: &Path) -> HydroResult<Self> {
        let defaults = SoilProperties::default();
        let records: Vec<SoilRecord> = read_records(reader, path)?;
        let entries = records
            .into_iter()
            .map(|r| {
                let props = SoilProperties {
                    ks: r.ks,
                    porosity: r.porosity.unwrap_or(defaults.porosity),
                    wilting_point: r.wilting_point.unwrap_or(defaults.wilting_point),
                };
                (r.id, props)
            })
            .collect();
        Ok(Self { entries, defaults })
    }

    pub fn get(&self, code: i64) -> SoilProperties {
        self.entries.get(&code).copied().unwrap_or(self.defaults)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Join a category map against the table.
    pub fn apply(&self, categories: &Grid<f64>) -> SoilFields {
        let props = lookup(categories, |code| self.get(code));
        SoilFields {
            ks: props.map(|p| p.ks / SECONDS_PER_DAY),
            porosity: props.map(|p| p.porosity),
            wilting_point: props.map(|p| p.wilting_point),
        }
    }
}

// ---------------------------------------------------------------------------
// Land use
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LandUseProperties {
    /// Manning's n
    pub mannings: f64,
    pub permeability: f64,
    /// Canopy storage depth [m]
    pub interception: f64,
    /// Throughfall fraction
    pub throughfall: f64,
}

impl Default for LandUseProperties {
    fn default() -> Self {
        Self {
            mannings:     0.045,
            permeability: 0.8,
            interception: 0.001,
            throughfall:  0.9,
        }
    }
}

#[derive(Debug, Deserialize)]
struct LandUseRecord {
    #[serde(rename = "Code")]
    code: i64,
    #[serde(rename = "Friction")]
    friction: f64,
    #[serde(rename = "Permeability")]
    permeability: f64,
    #[serde(rename = "Interception")]
    interception: f64,
    #[serde(rename = "f")]
    throughfall: f64,
}

#[derive(Debug, Clone)]
pub struct LandUseFields {
    pub mannings: Grid<f64>,
    pub permeability: Grid<f64>,
    pub interception_depth: Grid<f64>,
    pub throughfall: Grid<f64>,
}

impl LandUseFields {
    pub fn uniform(shape: Shape, mannings: f64, permeability: f64, interception_depth: f64, throughfall: f64) -> Self {
        Self {
            mannings: filled(shape, mannings),
            permeability: filled(shape, permeability),
            interception_depth: filled(shape, interception_depth),
            throughfall: filled(shape, throughfall),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LandUseTable {
    entries: HashMap<i64, LandUseProperties>,
    pub defaults: LandUseProperties,
}

impl LandUseTable {
    pub fn from_csv(path: &Path) -> HydroResult<Self> {
        let file = std::fs::File::open(path).map_err(|e| HydroError::io(path, e))?;
        Self::from_reader(file, path)
    }

    pub fn from_reader<R: Read>(reader: R, path: &Path) -> HydroResult<Self> {
        let records: Vec<LandUseRecord> = read_records(reader, path)?;
        let entries = records
            .into_iter()
            .map(|r| {
                (
                    r.code,
                    LandUseProperties {
                        mannings: r.friction,
                        permeability: r.permeability,
                        interception: r.interception,
                        throughfall: r.throughfall,
                    },
                )
            })
            .collect();
        Ok(Self {
            entries,
            defaults: LandUseProperties::default(),
        })
    }

    pub fn get(&self, code: i64) -> LandUseProperties {
        self.entries.get(&code).copied().unwrap_or(self.defaults)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn apply(&self, categories: &Grid<f64>) -> LandUseFields {
        let props = lookup(categories, |code| self.get(code));
        LandUseFields {
            mannings: props.map(|p| p.mannings),
            permeability: props.map(|p| p.permeability),
            interception_depth: props.map(|p| p.interception),
            throughfall: props.map(|p| p.throughfall),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared
// ---------------------------------------------------------------------------

fn read_records<R: Read, T: for<'de> Deserialize<'de>>(reader: R, path: &Path) -> HydroResult<Vec<T>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader);
    let mut out = Vec::new();
    for result in rdr.deserialize() {
        let record: T = result.map_err(|e| {
            let line = e.position().map_or(0, |p| p.line() as usize);
            HydroError::parse(path, line, e.to_string())
        })?;
        out.push(record);
    }
    Ok(out)
}

/// Category maps are stored as floats; codes are the rounded values.
fn lookup<P, F>(categories: &Grid<f64>, get: F) -> Grid<P>
where
    P: Clone + Default + Send + Sync,
    F: Fn(i64) -> P + Sync + Send,
{
    let shape = Shape::of(categories);
    par_from_fn(shape, |(r, c)| get(categories[[r, c]].round() as i64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_soil_table_join_and_units() {
        let csv = "ID,Ks\n1,0.864\n2, 8.64\n";
        let table = SoilTable::from_reader(csv.as_bytes(), Path::new("soil.csv")).unwrap();
        assert_eq!(table.len(), 2);
        let mut cats = filled(Shape::new(1, 3), 1.0);
        cats[[0, 1]] = 2.0;
        cats[[0, 2]] = 7.0;
        let f = table.apply(&cats);
        assert!((f.ks[[0, 0]] - 1e-5).abs() < 1e-18);
        assert!((f.ks[[0, 1]] - 1e-4).abs() < 1e-18);
        assert!((f.ks[[0, 2]] - 0.05 / 86_400.0).abs() < 1e-18);
        assert_eq!(f.porosity[[0, 0]], 0.35);
        assert_eq!(f.wilting_point[[0, 2]], 0.15);
    }

    #[test]
    fn test_soil_table_optional_columns() {
        let csv = "ID,Ks,porosity,wilting_point\n3,1.0,0.4,0.1\n";
        let table = SoilTable::from_reader(csv.as_bytes(), Path::new("soil.csv")).unwrap();
        assert_eq!(table.get(3).porosity, 0.4);
        assert_eq!(table.get(3).wilting_point, 0.1);
    }

    #[test]
    fn test_land_use_table() {
        let csv = "Code,Friction,Permeability,Interception,LAI,f,Crop_type\n\
                   10,0.013,0.1,0.0,0.0,1.0,0\n\
                   20,0.1,0.9,0.002,3.5,0.7,1\n";
        let table = LandUseTable::from_reader(csv.as_bytes(), Path::new("lu.csv")).unwrap();
        let mut cats = filled(Shape::new(2, 2), 10.0);
        cats[[1, 0]] = 20.0;
        cats[[1, 1]] = 99.0;
        let f = table.apply(&cats);
        assert_eq!(f.mannings[[0, 0]], 0.013);
        assert_eq!(f.throughfall[[1, 0]], 0.7);
        assert_eq!(f.interception_depth[[1, 0]], 0.002);
        assert_eq!(f.permeability[[1, 1]], 0.8);
    }

    #[test]
    fn test_bad_table_reports_line() {
        let csv = "ID,Ks\n1,abc\n";
        let err = SoilTable::from_reader(csv.as_bytes(), Path::new("soil.csv")).unwrap_err();
        match err {
            HydroError::Parse { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected {other:?}"),
        }
    }
}
