//! Tabular lookup objects: curves, time series, and time patterns
//!
//! Curves are typed (x, y) tables with linear interpolation; time series
//! are (datetime, value) tables supporting both interpolated and stepwise
//! lookups; patterns are monthly/daily/hourly/weekend multiplier arrays
//! applied to dry-weather inflows.

use crate::error::{EngineError, Result};
use chrono::{Datelike, NaiveDateTime, Timelike, Weekday};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Semantics attached to a curve's (x, y) columns.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CurveKind {
    /// surface area (ft²) vs. depth (ft) for a storage node
    Storage,
    /// diverted flow vs. total inflow for a divider node
    Diversion,
    /// water surface elevation vs. hour of day for an outfall
    Tidal,
    /// flow vs. head for an outlet link
    Rating,
    /// control setting vs. controller variable
    Control,
    /// section width vs. depth for a custom cross section
    Shape,
    /// discharge coefficient vs. head for a weir
    Weir,
    /// flow vs. wet-well volume (stepwise)
    Pump1,
    /// flow vs. inlet depth (stepwise)
    Pump2,
    /// flow vs. head difference (continuous)
    Pump3,
    /// flow vs. inlet depth (continuous)
    Pump4,
}

/// A typed table of (x, y) values with ascending x.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Curve {
    pub id: String,
    pub kind: CurveKind,
    pub points: Vec<(f64, f64)>,
}

impl Curve {
    /// Check that x-values strictly increase.
    pub fn validate(&self) -> Result<()> {
        if self.points.is_empty() {
            return Err(EngineError::CurveSequence(self.id.clone()));
        }
        for pair in self.points.windows(2) {
            if pair[1].0 <= pair[0].0 {
                return Err(EngineError::CurveSequence(self.id.clone()));
            }
        }
        Ok(())
    }

    /// Linear interpolation with end-slope extrapolation beyond the table.
    pub fn lookup(&self, x: f64) -> f64 {
        interpolate(&self.points, x, true)
    }

    /// Linear interpolation clamped to the end values.
    pub fn lookup_clamped(&self, x: f64) -> f64 {
        interpolate(&self.points, x, false)
    }

    /// Stepwise lookup: the y of the last point whose x does not exceed `x`.
    pub fn lookup_step(&self, x: f64) -> f64 {
        let mut y = self.points.first().map(|p| p.1).unwrap_or(0.0);
        for &(px, py) in &self.points {
            if px > x {
                break;
            }
            y = py;
        }
        y
    }

    /// Inverse lookup on the y column (assumes y also increases).
    pub fn reverse_lookup(&self, y: f64) -> f64 {
        let flipped: Vec<(f64, f64)> = self.points.iter().map(|&(a, b)| (b, a)).collect();
        interpolate(&flipped, y, true)
    }

    /// Integral of y dx from the first x up to `x`, by trapezoids. Used to
    /// turn a storage area curve into a depth-volume relation.
    pub fn integral(&self, x: f64) -> f64 {
        let mut total = 0.0;
        if self.points.is_empty() {
            return 0.0;
        }
        // area below the first tabulated depth uses the first y value
        let (x0, y0) = self.points[0];
        if x <= x0 {
            return y0 * x.max(0.0);
        }
        total += y0 * x0.max(0.0);
        let mut prev = self.points[0];
        for &(px, py) in &self.points[1..] {
            if x <= px {
                let y_at = prev.1 + (py - prev.1) * (x - prev.0) / (px - prev.0);
                total += 0.5 * (prev.1 + y_at) * (x - prev.0);
                return total;
            }
            total += 0.5 * (prev.1 + py) * (px - prev.0);
            prev = (px, py);
        }
        // beyond the table, extend with the last y
        total + prev.1 * (x - prev.0)
    }
}

fn interpolate(points: &[(f64, f64)], x: f64, extrapolate: bool) -> f64 {
    match points {
        [] => 0.0,
        [only] => only.1,
        _ => {
            let first = points[0];
            let last = points[points.len() - 1];
            if x <= first.0 {
                if !extrapolate {
                    return first.1;
                }
                let second = points[1];
                let slope = (second.1 - first.1) / (second.0 - first.0);
                return (first.1 + slope * (x - first.0)).max(0.0);
            }
            if x >= last.0 {
                if !extrapolate {
                    return last.1;
                }
                let prev = points[points.len() - 2];
                let slope = (last.1 - prev.1) / (last.0 - prev.0);
                return last.1 + slope * (x - last.0);
            }
            let hi = points.partition_point(|p| p.0 < x);
            let (x0, y0) = points[hi - 1];
            let (x1, y1) = points[hi];
            y0 + (y1 - y0) * (x - x0) / (x1 - x0)
        }
    }
}

/// One time series entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub time: NaiveDateTime,
    pub value: f64,
}

/// A (datetime, value) table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSeries {
    pub id: String,
    pub points: Vec<SeriesPoint>,
}

/// CSV record for time series rows: `time,value` with ISO 8601 times.
#[derive(Debug, Deserialize)]
struct SeriesCsvRecord {
    time: NaiveDateTime,
    value: f64,
}

impl TimeSeries {
    pub fn validate(&self) -> Result<()> {
        for pair in self.points.windows(2) {
            if pair[1].time <= pair[0].time {
                return Err(EngineError::TimeSeriesSequence(self.id.clone()));
            }
        }
        Ok(())
    }

    /// Load a `time,value` CSV file into a series.
    pub fn from_csv(id: &str, path: &Path) -> Result<Self> {
        let mut reader =
            csv::Reader::from_path(path).map_err(|e| EngineError::TableFile {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        let mut points = Vec::new();
        for record in reader.deserialize() {
            let rec: SeriesCsvRecord = record.map_err(|e| EngineError::TableFile {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
            points.push(SeriesPoint {
                time: rec.time,
                value: rec.value,
            });
        }
        let series = TimeSeries {
            id: id.to_string(),
            points,
        };
        series.validate()?;
        Ok(series)
    }

    /// Linear interpolation between bracketing entries; the end values hold
    /// outside the table.
    pub fn interpolate(&self, t: NaiveDateTime) -> f64 {
        let pts: Vec<(f64, f64)> = self
            .points
            .iter()
            .map(|p| (timestamp(p.time), p.value))
            .collect();
        interpolate(&pts, timestamp(t), false)
    }

    /// Stepwise lookup: the value recorded at or before `t`, zero before the
    /// first entry. Rainfall series use this form.
    pub fn step_value(&self, t: NaiveDateTime) -> f64 {
        let mut value = 0.0;
        for p in &self.points {
            if p.time > t {
                break;
            }
            value = p.value;
        }
        value
    }

    /// Sum of `value * interval` over entries fully covered by [t0, t1),
    /// treating each entry as holding until the next. Used for cumulative
    /// rainfall checks.
    pub fn stepwise_integral(&self, t0: NaiveDateTime, t1: NaiveDateTime) -> f64 {
        let mut total = 0.0;
        for (i, p) in self.points.iter().enumerate() {
            let start = p.time.max(t0);
            let end = match self.points.get(i + 1) {
                Some(next) => next.time.min(t1),
                None => t1,
            };
            if end > start {
                total += p.value * (end - start).num_seconds() as f64;
            }
        }
        total
    }
}

fn timestamp(t: NaiveDateTime) -> f64 {
    t.and_utc().timestamp() as f64 + t.and_utc().timestamp_subsec_nanos() as f64 * 1e-9
}

/// Pattern cadence.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PatternKind {
    /// one multiplier per month
    Monthly,
    /// one multiplier per day of week (Sunday first)
    Daily,
    /// one multiplier per hour of day
    Hourly,
    /// hourly multipliers applied on weekend days only
    Weekend,
}

impl PatternKind {
    fn expected_len(self) -> usize {
        match self {
            PatternKind::Monthly => 12,
            PatternKind::Daily => 7,
            PatternKind::Hourly | PatternKind::Weekend => 24,
        }
    }
}

/// A periodic multiplier table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    pub id: String,
    pub kind: PatternKind,
    pub factors: Vec<f64>,
}

impl Pattern {
    pub fn validate(&self) -> Result<()> {
        if self.factors.len() != self.kind.expected_len() {
            return Err(EngineError::InputFormat(format!(
                "pattern {} needs {} factors",
                self.id,
                self.kind.expected_len()
            )));
        }
        Ok(())
    }

    /// Multiplier in effect at `t`. A weekend pattern contributes 1.0 on
    /// weekdays; an hourly pattern applies every day.
    pub fn factor_at(&self, t: NaiveDateTime) -> f64 {
        match self.kind {
            PatternKind::Monthly => self.factors[t.month0() as usize],
            PatternKind::Daily => self.factors[t.weekday().num_days_from_sunday() as usize],
            PatternKind::Hourly => self.factors[t.hour() as usize],
            PatternKind::Weekend => match t.weekday() {
                Weekday::Sat | Weekday::Sun => self.factors[t.hour() as usize],
                _ => 1.0,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::NaiveDate;

    fn dt(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    fn storage_curve() -> Curve {
        Curve {
            id: "SC1".into(),
            kind: CurveKind::Storage,
            points: vec![(0.0, 100.0), (4.0, 300.0), (8.0, 300.0)],
        }
    }

    #[test]
    fn curve_interpolates_and_extrapolates() {
        let c = storage_curve();
        assert_relative_eq!(c.lookup(2.0), 200.0);
        assert_relative_eq!(c.lookup(6.0), 300.0);
        // end-slope extrapolation keeps the flat tail flat
        assert_relative_eq!(c.lookup(10.0), 300.0);
    }

    #[test]
    fn curve_integral_gives_storage_volume() {
        let c = storage_curve();
        // ∫ area d(depth): trapezoid from 0..4 plus rectangle 4..6
        assert_relative_eq!(c.integral(4.0), 800.0);
        assert_relative_eq!(c.integral(6.0), 1400.0);
    }

    #[test]
    fn non_increasing_curve_is_rejected() {
        let c = Curve {
            id: "BAD".into(),
            kind: CurveKind::Rating,
            points: vec![(0.0, 0.0), (1.0, 2.0), (1.0, 3.0)],
        };
        assert!(matches!(c.validate(), Err(EngineError::CurveSequence(_))));
    }

    #[test]
    fn series_stepwise_and_interpolated_lookups() {
        let ts = TimeSeries {
            id: "RAIN".into(),
            points: vec![
                SeriesPoint {
                    time: dt(2024, 6, 1, 0, 0),
                    value: 0.0,
                },
                SeriesPoint {
                    time: dt(2024, 6, 1, 1, 0),
                    value: 1.0,
                },
                SeriesPoint {
                    time: dt(2024, 6, 1, 2, 0),
                    value: 0.5,
                },
            ],
        };
        ts.validate().unwrap();
        assert_relative_eq!(ts.step_value(dt(2024, 6, 1, 1, 30)), 1.0);
        assert_relative_eq!(ts.interpolate(dt(2024, 6, 1, 1, 30)), 0.75);
        assert_relative_eq!(ts.step_value(dt(2024, 5, 31, 0, 0)), 0.0);
    }

    #[test]
    fn weekend_pattern_is_neutral_on_weekdays() {
        let p = Pattern {
            id: "WKND".into(),
            kind: PatternKind::Weekend,
            factors: vec![2.0; 24],
        };
        p.validate().unwrap();
        // 2024-06-03 is a Monday; 2024-06-01 a Saturday
        assert_relative_eq!(p.factor_at(dt(2024, 6, 3, 10, 0)), 1.0);
        assert_relative_eq!(p.factor_at(dt(2024, 6, 1, 10, 0)), 2.0);
    }
}
