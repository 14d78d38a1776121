//! Pollutants, land uses, buildup and washoff
//!
//! Pollutant mass accumulates on subcatchment surfaces between storms
//! according to each land use's buildup function and is stripped during
//! wet steps by its washoff function. Concentrations are carried in
//! user units (mass per liter); loads are mass per second with flow in
//! cfs.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};

/// Liters per cubic foot, linking concentration and flow units.
pub const L_PER_FT3: f64 = 28.317;

/// Concentration units of a pollutant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConcUnits {
    #[default]
    MgPerL,
    UgPerL,
    CountPerL,
}

impl ConcUnits {
    /// Factor converting this unit's mass to milligrams for load totals.
    pub fn mass_factor(self) -> f64 {
        match self {
            ConcUnits::MgPerL => 1.0,
            ConcUnits::UgPerL => 1.0e-3,
            ConcUnits::CountPerL => 1.0,
        }
    }
}

/// A pollutant definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pollutant {
    pub id: String,
    #[serde(default)]
    pub units: ConcUnits,
    /// concentration in rainfall
    #[serde(default)]
    pub rain_concen: f64,
    /// concentration in groundwater inflow
    #[serde(default)]
    pub gw_concen: f64,
    /// concentration in RDII inflow
    #[serde(default)]
    pub rdii_concen: f64,
    /// concentration in dry-weather flow
    #[serde(default)]
    pub dwf_concen: f64,
    #[serde(default)]
    pub init_concen: f64,
    /// first-order decay rate in conveyance, 1/s
    #[serde(default)]
    pub decay_rate: f64,
    /// buildup and washoff only when snow is present
    #[serde(default)]
    pub snow_only: bool,
    /// fraction of another pollutant's runoff concentration added in
    #[serde(default)]
    pub co_pollutant: Option<String>,
    #[serde(default)]
    pub co_fraction: f64,

    #[serde(skip)]
    pub co_index: Option<usize>,
}

/// Buildup as a function of antecedent dry days.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "function", rename_all = "lowercase")]
pub enum BuildupFunc {
    #[default]
    None,
    /// B = min(max, coeff·t^expon)
    Power { max: f64, coeff: f64, expon: f64 },
    /// B = max·(1 − e^(−rate·t))
    Exponential { max: f64, rate: f64 },
    /// B = max·t / (half_sat + t)
    Saturation { max: f64, half_sat: f64 },
}

impl BuildupFunc {
    /// Mass per unit area after `days` dry days.
    pub fn mass_at(&self, days: f64) -> f64 {
        let t = days.max(0.0);
        match *self {
            BuildupFunc::None => 0.0,
            BuildupFunc::Power { max, coeff, expon } => (coeff * t.powf(expon)).min(max),
            BuildupFunc::Exponential { max, rate } => max * (1.0 - (-rate * t).exp()),
            BuildupFunc::Saturation { max, half_sat } => {
                if half_sat + t > 0.0 {
                    max * t / (half_sat + t)
                } else {
                    0.0
                }
            }
        }
    }

    /// Dry days equivalent to an existing mass, the inverse of
    /// [`BuildupFunc::mass_at`]. Lets washoff rewind the buildup clock.
    pub fn days_of(&self, mass: f64) -> f64 {
        let b = mass.max(0.0);
        match *self {
            BuildupFunc::None => 0.0,
            BuildupFunc::Power { max, coeff, expon } => {
                if coeff <= 0.0 || expon <= 0.0 {
                    return 0.0;
                }
                (b.min(max) / coeff).powf(1.0 / expon)
            }
            BuildupFunc::Exponential { max, rate } => {
                if max <= 0.0 || rate <= 0.0 || b >= max {
                    return if b >= max { f64::INFINITY } else { 0.0 };
                }
                -(1.0 - b / max).ln() / rate
            }
            BuildupFunc::Saturation { max, half_sat } => {
                if b >= max {
                    return f64::INFINITY;
                }
                half_sat * b / (max - b)
            }
        }
    }
}

/// Washoff of built-up mass during runoff.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "function", rename_all = "lowercase")]
pub enum WashoffFunc {
    #[default]
    None,
    /// load = coeff·q^expon·B with q the runoff rate in in/hr
    Exponential { coeff: f64, expon: f64 },
    /// load = coeff·Q^expon with Q the runoff in cfs
    Rating { coeff: f64, expon: f64 },
    /// constant event-mean concentration, mass/L
    Emc { concen: f64 },
}

impl WashoffFunc {
    /// Washoff load (mass/s).
    ///
    /// * `runoff` — subcatchment runoff, cfs
    /// * `runoff_rate` — the same runoff as a depth rate, ft/s
    /// * `buildup` — available surface mass
    pub fn load(&self, runoff: f64, runoff_rate: f64, buildup: f64) -> f64 {
        match *self {
            WashoffFunc::None => 0.0,
            WashoffFunc::Exponential { coeff, expon } => {
                let q_inhr = runoff_rate * 43200.0;
                // coeff carries 1/hr; convert to 1/s
                coeff / 3600.0 * q_inhr.powf(expon) * buildup
            }
            WashoffFunc::Rating { coeff, expon } => coeff * runoff.powf(expon),
            WashoffFunc::Emc { concen } => concen * runoff * L_PER_FT3,
        }
    }
}

/// Per-pollutant loading functions of one land use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanduseLoad {
    pub pollutant: String,
    #[serde(default)]
    pub buildup: BuildupFunc,
    #[serde(default)]
    pub washoff: WashoffFunc,

    #[serde(skip)]
    pub pollut_index: usize,
}

/// A land-use category.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Landuse {
    pub id: String,
    #[serde(default)]
    pub loads: Vec<LanduseLoad>,
}

/// Fraction of a subcatchment under one land use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Coverage {
    pub subcatch: String,
    pub landuse: String,
    /// fraction of the subcatchment area, 0..1
    pub fraction: f64,

    #[serde(skip)]
    pub subcatch_index: usize,
    #[serde(skip)]
    pub landuse_index: usize,
}

/// Initial surface buildup specified directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitialLoading {
    pub subcatch: String,
    pub pollutant: String,
    /// mass per acre
    pub buildup: f64,

    #[serde(skip)]
    pub subcatch_index: usize,
    #[serde(skip)]
    pub pollut_index: usize,
}

/// Surface buildup bookkeeping for one (subcatchment, landuse, pollutant)
/// triple.
#[derive(Debug, Clone, Default)]
pub struct BuildupState {
    /// accumulated mass
    pub mass: f64,
    /// equivalent antecedent dry days
    pub days: f64,
}

impl BuildupState {
    /// Advance buildup over a dry interval.
    pub fn accumulate(&mut self, func: &BuildupFunc, area_acres: f64, tstep_days: f64) {
        self.days += tstep_days;
        self.mass = func.mass_at(self.days) * area_acres;
    }

    /// Remove washed-off mass and rewind the clock to match.
    pub fn remove(&mut self, func: &BuildupFunc, area_acres: f64, mass: f64) {
        self.mass = (self.mass - mass).max(0.0);
        if area_acres > 0.0 {
            self.days = func.days_of(self.mass / area_acres);
        }
    }
}

pub fn validate_pollutant(p: &Pollutant) -> Result<()> {
    if p.decay_rate < 0.0 || p.co_fraction < 0.0 {
        return Err(EngineError::InputFormat(format!(
            "pollutant {} has negative coefficients",
            p.id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn power_buildup_saturates_at_its_maximum() {
        let f = BuildupFunc::Power {
            max: 50.0,
            coeff: 10.0,
            expon: 0.5,
        };
        assert_relative_eq!(f.mass_at(4.0), 20.0);
        assert_relative_eq!(f.mass_at(100.0), 50.0);
    }

    #[test]
    fn buildup_inverse_round_trips() {
        let funcs = [
            BuildupFunc::Power {
                max: 50.0,
                coeff: 10.0,
                expon: 0.5,
            },
            BuildupFunc::Exponential {
                max: 40.0,
                rate: 0.2,
            },
            BuildupFunc::Saturation {
                max: 60.0,
                half_sat: 3.0,
            },
        ];
        for f in &funcs {
            for days in [0.5, 2.0, 7.0] {
                let mass = f.mass_at(days);
                assert_relative_eq!(f.days_of(mass), days, max_relative = 1e-9);
            }
        }
    }

    #[test]
    fn exponential_washoff_depletes_buildup() {
        let f = WashoffFunc::Exponential {
            coeff: 2.0,
            expon: 1.0,
        };
        // 0.5 in/hr runoff on 100 units of buildup
        let rate = 0.5 / 43200.0;
        let load = f.load(5.0, rate, 100.0);
        assert_relative_eq!(load, 2.0 / 3600.0 * 0.5 * 100.0);
    }

    #[test]
    fn emc_washoff_is_concentration_times_flow() {
        let f = WashoffFunc::Emc { concen: 10.0 };
        let load = f.load(2.0, 0.0, 0.0);
        assert_relative_eq!(load, 10.0 * 2.0 * L_PER_FT3);
    }

    #[test]
    fn buildup_state_rewinds_its_clock_on_washoff() {
        let f = BuildupFunc::Exponential {
            max: 40.0,
            rate: 0.2,
        };
        let mut state = BuildupState::default();
        state.accumulate(&f, 2.0, 5.0);
        let before_days = state.days;
        state.remove(&f, 2.0, state.mass * 0.5);
        assert!(state.days < before_days);
        // building back up continues from the rewound clock
        state.accumulate(&f, 2.0, 0.0);
        assert!(state.mass > 0.0);
    }
}
