//! Forcing series: precipitation and reference evapotranspiration in mm/h.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

use chrono::{Duration, NaiveDateTime, Timelike};
use tracing::debug;

use crate::config::ForcingSource;
use crate::error::{HydroError, HydroResult};

const TIMESTAMP_FORMAT: &str = "%d/%m/%Y %H:%M";
/// Resolution of a series when the configuration does not name one [minutes].
pub const DEFAULT_RESOLUTION_MIN: u32 = 5;

/// Resolutions must tile the hour, since timestamps are rounded down on
/// the minute of the hour.
pub fn divides_hour(resolution_min: u32) -> bool {
    resolution_min > 0 && 60 % resolution_min == 0
}

/// Header-less `dd/mm/YYYY HH:MM,value` rows keyed by timestamp.
#[derive(Debug, Clone)]
pub struct TimeSeries {
    values: BTreeMap<NaiveDateTime, f64>,
    resolution_min: u32,
}

impl TimeSeries {
    pub fn new(resolution_min: u32) -> HydroResult<Self> {
        if !divides_hour(resolution_min) {
            return Err(HydroError::config(format!(
                "forcing resolution of {resolution_min} min does not divide the hour"
            )));
        }
        Ok(Self {
            values: BTreeMap::new(),
            resolution_min,
        })
    }

    pub fn from_csv(path: &Path, resolution_min: u32) -> HydroResult<Self> {
        let file = std::fs::File::open(path).map_err(|e| HydroError::io(path, e))?;
        Self::from_reader(file, path, resolution_min)
    }

    pub fn from_reader<R: Read>(reader: R, path: &Path, resolution_min: u32) -> HydroResult<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(false)
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(reader);
        let mut series = Self::new(resolution_min)?;
        for (row, result) in rdr.records().enumerate() {
            let record = result.map_err(|e| {
                let line = e.position().map_or(row + 1, |p| p.line() as usize);
                HydroError::parse(path, line, e.to_string())
            })?;
            let line = record.position().map_or(row + 1, |p| p.line() as usize);
            if record.iter().all(|f| f.is_empty()) {
                continue;
            }
            let stamp = record
                .get(0)
                .ok_or_else(|| HydroError::parse(path, line, "missing timestamp"))?;
            let value = record
                .get(1)
                .ok_or_else(|| HydroError::parse(path, line, "missing value"))?;
            let t = NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT)
                .map_err(|e| HydroError::parse(path, line, format!("bad timestamp '{stamp}': {e}")))?;
            let v: f64 = value
                .parse()
                .map_err(|_| HydroError::parse(path, line, format!("bad value '{value}'")))?;
            series.insert(t, v);
        }
        Ok(series)
    }

    pub fn insert(&mut self, t: NaiveDateTime, value: f64) {
        self.values.insert(t, value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Round `t` down to the series resolution.
    pub fn round_down(&self, t: NaiveDateTime) -> NaiveDateTime {
        let minute_offset = t.minute() % self.resolution_min;
        let truncated = t - Duration::minutes(minute_offset as i64);
        truncated
            .with_second(0)
            .and_then(|x| x.with_nanosecond(0))
            .unwrap_or(truncated)
    }

    /// Entry active at `t`, if the series has one.
    pub fn value_at(&self, t: NaiveDateTime) -> Option<f64> {
        self.values.get(&self.round_down(t)).copied()
    }

    /// Entry active at `t`; a missing sample reads as zero.
    pub fn sample(&self, t: NaiveDateTime) -> f64 {
        match self.value_at(t) {
            Some(v) => v,
            None => {
                debug!(time = %t, "no forcing sample, using zero");
                0.0
            }
        }
    }
}

/// A forcing input resolved from configuration.
#[derive(Debug, Clone)]
pub enum Forcing {
    Series(TimeSeries),
    Constant(f64),
}

impl Forcing {
    pub fn from_source(source: &ForcingSource) -> HydroResult<Self> {
        match source {
            ForcingSource::Csv { path, resolution_min } => {
                Ok(Forcing::Series(TimeSeries::from_csv(path, *resolution_min)?))
            }
            ForcingSource::Constant { mm_per_hour } => Ok(Forcing::Constant(*mm_per_hour)),
        }
    }

    /// Rate at `t` [mm/h], never negative.
    pub fn mm_per_hour(&self, t: NaiveDateTime) -> f64 {
        let v = match self {
            Forcing::Series(s) => s.sample(t),
            Forcing::Constant(v) => *v,
        };
        v.max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2023, 6, 14)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn series() -> TimeSeries {
        let csv = "14/06/2023 10:00,1.5\n14/06/2023 10:05,3.0\n\n14/06/2023 10:15, 0.25\n";
        TimeSeries::from_reader(csv.as_bytes(), Path::new("p.csv"), 5).unwrap()
    }

    #[test]
    fn test_rounds_down_to_resolution() {
        let s = series();
        assert_eq!(s.len(), 3);
        assert_eq!(s.value_at(at(10, 0, 0)), Some(1.5));
        assert_eq!(s.value_at(at(10, 4, 59)), Some(1.5));
        assert_eq!(s.value_at(at(10, 7, 30)), Some(3.0));
        assert_eq!(s.value_at(at(10, 17, 0)), Some(0.25));
    }

    #[test]
    fn test_missing_sample_is_zero() {
        let s = series();
        assert_eq!(s.value_at(at(10, 12, 0)), None);
        assert_eq!(s.sample(at(10, 12, 0)), 0.0);
        assert_eq!(s.sample(at(23, 0, 0)), 0.0);
    }

    #[test]
    fn test_hourly_series() {
        let csv = "14/06/2023 10:00,1.0\n14/06/2023 11:00,2.0\n";
        let s = TimeSeries::from_reader(csv.as_bytes(), Path::new("p.csv"), 60).unwrap();
        assert_eq!(s.value_at(at(10, 59, 59)), Some(1.0));
        assert_eq!(s.value_at(at(11, 30, 0)), Some(2.0));

        let s = TimeSeries::from_reader(csv.as_bytes(), Path::new("p.csv"), 15).unwrap();
        assert_eq!(s.value_at(at(10, 14, 0)), Some(1.0));
        assert_eq!(s.value_at(at(10, 15, 0)), None);
    }

    #[test]
    fn test_resolution_must_divide_the_hour() {
        assert!(divides_hour(1) && divides_hour(5) && divides_hour(60));
        assert!(!divides_hour(0) && !divides_hour(7) && !divides_hour(90));
        let err = TimeSeries::from_reader("".as_bytes(), Path::new("p.csv"), 7).unwrap_err();
        assert!(matches!(err, HydroError::Config { .. }));
    }

    #[test]
    fn test_bad_rows_fail_with_line() {
        let csv = "14/06/2023 10:00,1.5\n2023-06-14 10:05,3.0\n";
        let err = TimeSeries::from_reader(csv.as_bytes(), Path::new("p.csv"), 5).unwrap_err();
        assert!(matches!(err, HydroError::Parse { line: 2, .. }));
    }

    #[test]
    fn test_constant_forcing() {
        let f = Forcing::from_source(&ForcingSource::Constant { mm_per_hour: 2.0 }).unwrap();
        assert_eq!(f.mm_per_hour(at(0, 0, 0)), 2.0);
        let f = Forcing::Constant(-1.0);
        assert_eq!(f.mm_per_hour(at(0, 0, 0)), 0.0);
    }

    #[test]
    fn test_missing_file_is_missing_input() {
        let source = ForcingSource::Csv {
            path: "definitely/not/here.csv".into(),
            resolution_min: DEFAULT_RESOLUTION_MIN,
        };
        let err = Forcing::from_source(&source).unwrap_err();
        assert!(err.is_missing_input());
    }
}
