//! Node inflows: external, dry-weather, and RDII
//!
//! Each node keeps a small vector of inflow records traversed in
//! insertion order. External inflows read a time series scaled and offset
//! per record; dry-weather inflows apply up to four periodic patterns to
//! a baseline; RDII inflows convolve gage rainfall with an RTK triple of
//! unit hydrographs.

use crate::error::{EngineError, Result};
use crate::table::{Pattern, TimeSeries};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// What an external inflow record carries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum InflowKind {
    #[default]
    Flow,
    /// pollutant concentration riding on the node's flow
    Concentration,
    /// pollutant mass rate
    Mass,
}

/// A user-supplied inflow at a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalInflow {
    pub node: String,
    #[serde(default)]
    pub kind: InflowKind,
    /// pollutant name for quality inflows
    #[serde(default)]
    pub pollutant: Option<String>,
    /// time series name; a constant baseline may stand alone
    #[serde(default)]
    pub series: Option<String>,
    #[serde(default = "one")]
    pub scale: f64,
    #[serde(default)]
    pub baseline: f64,
    /// optional pattern applied to the baseline
    #[serde(default)]
    pub pattern: Option<String>,

    #[serde(skip)]
    pub node_index: usize,
    #[serde(skip)]
    pub pollut_index: Option<usize>,
    #[serde(skip)]
    pub series_index: Option<usize>,
    #[serde(skip)]
    pub pattern_index: Option<usize>,
}

fn one() -> f64 {
    1.0
}

impl ExternalInflow {
    /// Inflow value at `t` (cfs for flow records, user quality units
    /// otherwise; the caller converts).
    pub fn value_at(
        &self,
        t: NaiveDateTime,
        series: Option<&TimeSeries>,
        pattern: Option<&Pattern>,
    ) -> f64 {
        let mut v = self.baseline;
        if let Some(p) = pattern {
            v *= p.factor_at(t);
        }
        if let Some(ts) = series {
            v += self.scale * ts.interpolate(t);
        }
        v
    }
}

/// Dry-weather inflow: baseline times stacked patterns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DryWeatherInflow {
    pub node: String,
    #[serde(default)]
    pub pollutant: Option<String>,
    pub baseline: f64,
    /// up to four pattern names (monthly, daily, hourly, weekend)
    #[serde(default)]
    pub patterns: Vec<String>,

    #[serde(skip)]
    pub node_index: usize,
    #[serde(skip)]
    pub pollut_index: Option<usize>,
    #[serde(skip)]
    pub pattern_indexes: Vec<usize>,
}

impl DryWeatherInflow {
    pub fn value_at(&self, t: NaiveDateTime, patterns: &[&Pattern]) -> f64 {
        patterns
            .iter()
            .fold(self.baseline, |v, p| v * p.factor_at(t))
    }
}

/// One RTK triad: response fraction, time to peak, recession ratio.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct RtkParams {
    /// fraction of rainfall entering the sewer through this pathway
    pub r: f64,
    /// time to peak, s
    pub t: f64,
    /// ratio of recession time to time to peak
    pub k: f64,
}

impl RtkParams {
    /// Triangular unit-hydrograph ordinate at time `tau` after a rain
    /// impulse, per second of base time.
    fn ordinate(&self, tau: f64) -> f64 {
        if self.r <= 0.0 || self.t <= 0.0 {
            return 0.0;
        }
        let tb = self.t * (1.0 + self.k);
        if tau < 0.0 || tau >= tb {
            return 0.0;
        }
        let peak = 2.0 / tb;
        if tau <= self.t {
            peak * tau / self.t
        } else {
            peak * (tb - tau) / (tb - self.t)
        }
    }
}

/// A set of three unit hydrographs (short, medium, long response).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitHydrograph {
    pub id: String,
    pub gage: String,
    pub short: RtkParams,
    pub medium: RtkParams,
    pub long: RtkParams,

    #[serde(skip)]
    pub gage_index: usize,
}

impl UnitHydrograph {
    pub fn validate(&self) -> Result<()> {
        let total_r = self.short.r + self.medium.r + self.long.r;
        if total_r > 1.0 + 1e-9 {
            return Err(EngineError::UnitHydRatios(self.id.clone()));
        }
        for p in [&self.short, &self.medium, &self.long] {
            if p.r > 0.0 && (p.t <= 0.0 || p.k < 0.0) {
                return Err(EngineError::UnitHydTimes(self.id.clone()));
            }
        }
        Ok(())
    }

    /// Longest response time across the three pathways, s.
    pub fn base_time(&self) -> f64 {
        [self.short, self.medium, self.long]
            .iter()
            .map(|p| p.t * (1.0 + p.k))
            .fold(0.0, f64::max)
    }
}

/// RDII attachment at a node: convolution of gage rainfall against a
/// unit-hydrograph set over a contributing sewershed area.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RdiiInflow {
    pub node: String,
    pub unit_hydrograph: String,
    /// contributing sewershed area, ft²
    pub area: f64,

    #[serde(skip)]
    pub node_index: usize,
    #[serde(skip)]
    pub uh_index: usize,
    /// ring buffer of past rainfall intensities (ft/s), newest last
    #[serde(skip)]
    pub rain_history: Vec<f64>,
    #[serde(skip)]
    pub history_step: f64,
}

impl RdiiInflow {
    pub fn validate(&self) -> Result<()> {
        if self.area <= 0.0 {
            return Err(EngineError::RdiiArea(self.node.clone()));
        }
        Ok(())
    }

    /// Size the rainfall history to cover the hydrograph base time.
    pub fn initialize(&mut self, uh: &UnitHydrograph, tstep: f64) {
        let slots = (uh.base_time() / tstep).ceil() as usize + 1;
        self.rain_history = vec![0.0; slots.max(1)];
        self.history_step = tstep;
    }

    /// Push this step's rainfall and return the RDII inflow (cfs).
    pub fn step(&mut self, uh: &UnitHydrograph, rainfall: f64, tstep: f64) -> f64 {
        if self.rain_history.is_empty() {
            self.initialize(uh, tstep);
        }
        self.rain_history.rotate_left(1);
        let n = self.rain_history.len();
        self.rain_history[n - 1] = rainfall;

        // convolve history against the three triangles
        let mut flow = 0.0;
        for (age, &rain) in self.rain_history.iter().rev().enumerate() {
            if rain <= 0.0 {
                continue;
            }
            let tau = age as f64 * self.history_step;
            let mut u = 0.0;
            for p in [&uh.short, &uh.medium, &uh.long] {
                u += p.r * p.ordinate(tau);
            }
            flow += rain * u * self.history_step;
        }
        flow * self.area
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn rtk_ordinates_integrate_to_unity() {
        let p = RtkParams {
            r: 1.0,
            t: 3600.0,
            k: 2.0,
        };
        let dt = 60.0;
        let mut sum = 0.0;
        let mut tau = 0.0;
        while tau < p.t * (1.0 + p.k) {
            sum += p.ordinate(tau) * dt;
            tau += dt;
        }
        assert_relative_eq!(sum, 1.0, max_relative = 0.02);
    }

    #[test]
    fn response_ratios_above_one_are_rejected() {
        let uh = UnitHydrograph {
            id: "UH1".into(),
            gage: "G1".into(),
            short: RtkParams {
                r: 0.6,
                t: 1800.0,
                k: 1.0,
            },
            medium: RtkParams {
                r: 0.5,
                t: 3600.0,
                k: 2.0,
            },
            long: RtkParams::default(),
            gage_index: 0,
        };
        assert!(matches!(
            uh.validate(),
            Err(EngineError::UnitHydRatios(_))
        ));
    }

    #[test]
    fn rdii_total_volume_matches_r_times_rainfall() {
        let uh = UnitHydrograph {
            id: "UH1".into(),
            gage: "G1".into(),
            short: RtkParams {
                r: 0.3,
                t: 1800.0,
                k: 1.0,
            },
            medium: RtkParams::default(),
            long: RtkParams::default(),
            gage_index: 0,
        };
        let area = 10.0 * 43560.0;
        let mut rdii = RdiiInflow {
            node: "J1".into(),
            unit_hydrograph: "UH1".into(),
            area,
            node_index: 0,
            uh_index: 0,
            rain_history: Vec::new(),
            history_step: 0.0,
        };
        let tstep = 300.0;
        let rain = 1.0 / 43200.0; // 1 in/hr
        let mut volume = 0.0;
        // one hour of rain, then long enough for the response to pass
        for i in 0..120 {
            let r = if i < 12 { rain } else { 0.0 };
            volume += rdii.step(&uh, r, tstep) * tstep;
        }
        let rainfall_volume = rain * 3600.0 * area;
        assert_relative_eq!(volume, 0.3 * rainfall_volume, max_relative = 0.05);
    }

    #[test]
    fn dry_weather_inflow_stacks_patterns() {
        use crate::table::{Pattern, PatternKind};
        use chrono::NaiveDate;
        let dwf = DryWeatherInflow {
            node: "J1".into(),
            pollutant: None,
            baseline: 2.0,
            patterns: vec!["H".into()],
            node_index: 0,
            pollut_index: None,
            pattern_indexes: vec![],
        };
        let hourly = Pattern {
            id: "H".into(),
            kind: PatternKind::Hourly,
            factors: (0..24).map(|h| if h < 12 { 0.5 } else { 1.5 }).collect(),
        };
        let morning = NaiveDate::from_ymd_opt(2024, 6, 3)
            .unwrap()
            .and_hms_opt(6, 0, 0)
            .unwrap();
        assert_relative_eq!(dwf.value_at(morning, &[&hourly]), 1.0);
    }
}
