//! Rain gages
//!
//! A gage turns its rainfall record into the intensity seen by the
//! subcatchments that reference it. Records may arrive as intensities,
//! interval volumes, or cumulative volumes; the gage normalizes all three
//! to an internal intensity in ft/s. A runtime override set through the
//! API takes precedence over the record until cleared.

use crate::error::{EngineError, Result};
use crate::table::TimeSeries;
use crate::units::{Quantity, UnitConverter};
use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// How recorded rainfall values are to be interpreted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RainFormat {
    /// values are intensities (in/hr or mm/hr)
    #[default]
    Intensity,
    /// values are depths accumulated over one recording interval
    Volume,
    /// values are running cumulative depths
    Cumulative,
}

/// Where a gage's rainfall comes from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum GageSource {
    /// a named time series in the project
    Series { series: String },
    /// an external rainfall interface file
    File { path: String, station: String },
}

/// A rain gage definition plus its runtime state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gage {
    pub id: String,
    #[serde(flatten)]
    pub source: GageSource,
    pub format: RainFormat,
    /// recording interval, seconds
    pub interval: f64,
    /// multiplier applied to snow catch (gage undercatch correction)
    #[serde(default = "default_snow_catch")]
    pub snow_catch: f64,

    // --- runtime state ---
    /// resolved index of the source series
    #[serde(skip)]
    pub series_index: Option<usize>,
    /// gage sharing this gage's record, if any
    #[serde(skip)]
    pub co_gage: Option<usize>,
    /// current rainfall intensity (ft/s)
    #[serde(skip)]
    pub rainfall: f64,
    /// current snowfall intensity (ft/s), split off by the snowpack's
    /// dividing temperature
    #[serde(skip)]
    pub snowfall: f64,
    /// rainfall override set through the API (ft/s)
    #[serde(skip)]
    pub api_rainfall: Option<f64>,
    /// whether any subcatchment references this gage
    #[serde(skip)]
    pub is_used: bool,
}

fn default_snow_catch() -> f64 {
    1.0
}

impl Gage {
    /// Series name referenced by this gage, if series-sourced.
    pub fn series_ref(&self) -> Option<&str> {
        match &self.source {
            GageSource::Series { series } => Some(series),
            GageSource::File { .. } => None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval <= 0.0 {
            return Err(EngineError::GageFormat(self.id.clone()));
        }
        Ok(())
    }

    /// Update the current rainfall intensity for the step beginning at `t`.
    ///
    /// `series` is the resolved source record with values still in user
    /// units; `uc` converts them. Returns the intensity in ft/s.
    pub fn set_state(&mut self, t: NaiveDateTime, series: Option<&TimeSeries>, uc: &UnitConverter) -> f64 {
        if let Some(rate) = self.api_rainfall {
            self.rainfall = rate;
            return self.rainfall;
        }
        let Some(ts) = series else {
            self.rainfall = 0.0;
            return 0.0;
        };
        let intensity_user = match self.format {
            RainFormat::Intensity => ts.step_value(t),
            RainFormat::Volume => {
                // depth per recording interval
                ts.step_value(t) * 3600.0 / self.interval
            }
            RainFormat::Cumulative => {
                let t0 = t - Duration::seconds(self.interval as i64);
                let delta = (ts.step_value(t) - ts.step_value(t0)).max(0.0);
                delta * 3600.0 / self.interval
            }
        };
        // volume/cumulative formats carry depths; scale them as depth/hour
        let internal = match self.format {
            RainFormat::Intensity => uc.to_internal(Quantity::Rainfall, intensity_user),
            _ => uc.to_internal(Quantity::RainDepth, intensity_user) / 3600.0,
        };
        self.rainfall = internal.max(0.0);
        self.rainfall
    }

    /// Split total precipitation into rain and snow at the dividing
    /// temperature (°F); called by the snowmelt step.
    pub fn split_snow(&mut self, air_temp: f64, divide_temp: f64) {
        if air_temp <= divide_temp {
            self.snowfall = self.rainfall * self.snow_catch;
            self.rainfall = 0.0;
        } else {
            self.snowfall = 0.0;
        }
    }

    /// Total precipitation rate, rain plus snow (ft/s).
    pub fn precipitation(&self) -> f64 {
        self.rainfall + self.snowfall
    }
}

/// Gages that share a time series must agree on the recording interval.
pub fn check_shared_series(gages: &[Gage]) -> Result<()> {
    for (i, a) in gages.iter().enumerate() {
        for b in gages.iter().skip(i + 1) {
            if let (Some(sa), Some(sb)) = (a.series_ref(), b.series_ref()) {
                if sa.eq_ignore_ascii_case(sb) && (a.interval - b.interval).abs() > f64::EPSILON {
                    return Err(EngineError::GageInterval(a.id.clone(), b.id.clone()));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::SeriesPoint;
    use crate::units::FlowUnits;
    use approx::assert_relative_eq;
    use chrono::NaiveDate;

    fn dt(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn gage(format: RainFormat) -> Gage {
        Gage {
            id: "G1".into(),
            source: GageSource::Series {
                series: "RAIN".into(),
            },
            format,
            interval: 3600.0,
            snow_catch: 1.0,
            series_index: Some(0),
            co_gage: None,
            rainfall: 0.0,
            snowfall: 0.0,
            api_rainfall: None,
            is_used: true,
        }
    }

    fn series() -> TimeSeries {
        TimeSeries {
            id: "RAIN".into(),
            points: vec![
                SeriesPoint {
                    time: dt(0, 0),
                    value: 1.0,
                },
                SeriesPoint {
                    time: dt(1, 0),
                    value: 2.0,
                },
            ],
        }
    }

    #[test]
    fn intensity_record_converts_to_feet_per_second() {
        let mut g = gage(RainFormat::Intensity);
        let uc = UnitConverter::new(FlowUnits::Cfs);
        let r = g.set_state(dt(0, 30), Some(&series()), &uc);
        assert_relative_eq!(r, 1.0 / 43200.0, max_relative = 1e-12);
    }

    #[test]
    fn volume_record_spreads_depth_over_interval() {
        let mut g = gage(RainFormat::Volume);
        let uc = UnitConverter::new(FlowUnits::Cfs);
        // 1 inch over one hour = 1 in/hr
        let r = g.set_state(dt(0, 30), Some(&series()), &uc);
        assert_relative_eq!(r, 1.0 / 43200.0, max_relative = 1e-12);
    }

    #[test]
    fn api_override_wins_until_cleared() {
        let mut g = gage(RainFormat::Intensity);
        let uc = UnitConverter::new(FlowUnits::Cfs);
        g.api_rainfall = Some(4.0 / 43200.0);
        let r = g.set_state(dt(0, 30), Some(&series()), &uc);
        assert_relative_eq!(r, 4.0 / 43200.0, max_relative = 1e-12);
        g.api_rainfall = None;
        let r = g.set_state(dt(0, 30), Some(&series()), &uc);
        assert_relative_eq!(r, 1.0 / 43200.0, max_relative = 1e-12);
    }

    #[test]
    fn shared_series_with_unequal_intervals_is_rejected() {
        let mut g2 = gage(RainFormat::Intensity);
        g2.id = "G2".into();
        g2.interval = 900.0;
        let gages = vec![gage(RainFormat::Intensity), g2];
        assert!(matches!(
            check_shared_series(&gages),
            Err(EngineError::GageInterval(_, _))
        ));
    }

    #[test]
    fn cold_step_moves_rain_into_snow() {
        let mut g = gage(RainFormat::Intensity);
        let uc = UnitConverter::new(FlowUnits::Cfs);
        g.set_state(dt(0, 30), Some(&series()), &uc);
        g.split_snow(20.0, 34.0);
        assert_relative_eq!(g.rainfall, 0.0);
        assert!(g.snowfall > 0.0);
    }
}
