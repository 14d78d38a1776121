//! Snow accumulation and melt
//!
//! Precipitation falling while the air is at or below the gage's dividing
//! temperature accumulates as a snowpack on the subcatchment's plowable,
//! impervious, and pervious fractions. Melt follows a degree-day law
//! `melt = dhm·(Ta − Tbase)`, passes through the pack's free-water
//! capacity, and then joins rainfall in the runoff step. An areal
//! depletion factor ramps coverage down as the pack thins.
//!
//! Depths are ft of water equivalent, rates ft/s, temperatures °F.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};

/// Melt parameters for one surface fraction of a snowpack.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SnowMeltParams {
    /// melt coefficient, ft/s per °F
    pub dhm: f64,
    /// base melt temperature, °F
    pub tbase: f64,
    /// free water holding capacity as a fraction of pack depth
    pub fwc: f64,
    /// snow depth at 100% areal coverage, ft
    pub sd100: f64,
}

impl Default for SnowMeltParams {
    fn default() -> Self {
        SnowMeltParams {
            dhm: 0.001 / 43200.0,
            tbase: 32.0,
            fwc: 0.1,
            sd100: 0.1,
        }
    }
}

/// A snowpack parameter set, shared by subcatchments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snowpack {
    pub id: String,
    /// fraction of impervious area that is plowable
    #[serde(default)]
    pub plowable_frac: f64,
    /// snow depth at which plowing begins, ft
    #[serde(default)]
    pub plow_depth: f64,
    pub plowable: SnowMeltParams,
    pub imperv: SnowMeltParams,
    pub perv: SnowMeltParams,
}

impl Snowpack {
    pub fn validate(&self) -> Result<()> {
        for p in [&self.plowable, &self.imperv, &self.perv] {
            if p.dhm < 0.0 || p.fwc < 0.0 || p.fwc > 1.0 {
                return Err(EngineError::SnowpackParams(self.id.clone()));
            }
        }
        if !(0.0..=1.0).contains(&self.plowable_frac) {
            return Err(EngineError::SnowpackParams(self.id.clone()));
        }
        Ok(())
    }
}

/// Live snow state for one surface fraction.
#[derive(Debug, Clone, Copy, Default)]
pub struct SnowState {
    /// snow water equivalent, ft
    pub depth: f64,
    /// free water held in the pack, ft
    pub free_water: f64,
}

impl SnowState {
    /// Advance one step; returns the melt rate released to runoff (ft/s).
    fn step(&mut self, p: &SnowMeltParams, snowfall: f64, air_temp: f64, tstep: f64) -> f64 {
        self.depth += snowfall * tstep;
        if self.depth <= 0.0 {
            return 0.0;
        }
        // areal depletion: thin packs cover only part of the surface
        let coverage = (self.depth / p.sd100).min(1.0);
        let mut melt = if air_temp > p.tbase {
            p.dhm * (air_temp - p.tbase) * coverage
        } else {
            0.0
        };
        melt = melt.min(self.depth / tstep);
        self.depth -= melt * tstep;
        // melt first fills the pack's free-water pores
        self.free_water += melt * tstep;
        let capacity = p.fwc * self.depth;
        let release = (self.free_water - capacity).max(0.0);
        self.free_water -= release;
        release / tstep
    }
}

/// Snow state of one subcatchment.
#[derive(Debug, Clone, Default)]
pub struct SubcatchSnow {
    pub pack_index: usize,
    pub plowable: SnowState,
    pub imperv: SnowState,
    pub perv: SnowState,
}

impl SubcatchSnow {
    /// Advance all three fractions; returns the area-weighted melt rate
    /// joining rainfall (ft/s). `frac_imperv` splits the surface.
    pub fn step(
        &mut self,
        pack: &Snowpack,
        snowfall: f64,
        air_temp: f64,
        frac_imperv: f64,
        tstep: f64,
    ) -> f64 {
        let f_plow = frac_imperv * pack.plowable_frac;
        let f_imp = frac_imperv * (1.0 - pack.plowable_frac);
        let f_perv = 1.0 - frac_imperv;
        let mut melt = 0.0;
        if f_plow > 0.0 {
            melt += f_plow * self.plowable.step(&pack.plowable, snowfall, air_temp, tstep);
        }
        if f_imp > 0.0 {
            melt += f_imp * self.imperv.step(&pack.imperv, snowfall, air_temp, tstep);
        }
        if f_perv > 0.0 {
            melt += f_perv * self.perv.step(&pack.perv, snowfall, air_temp, tstep);
        }
        melt
    }

    /// Mean snow water equivalent over the subcatchment, ft.
    pub fn mean_depth(&self, pack: &Snowpack, frac_imperv: f64) -> f64 {
        let f_plow = frac_imperv * pack.plowable_frac;
        let f_imp = frac_imperv * (1.0 - pack.plowable_frac);
        let f_perv = 1.0 - frac_imperv;
        f_plow * self.plowable.depth + f_imp * self.imperv.depth + f_perv * self.perv.depth
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pack() -> Snowpack {
        Snowpack {
            id: "SP1".into(),
            plowable_frac: 0.0,
            plow_depth: 0.0,
            plowable: SnowMeltParams::default(),
            imperv: SnowMeltParams::default(),
            perv: SnowMeltParams::default(),
        }
    }

    #[test]
    fn cold_weather_accumulates_without_melt() {
        let p = pack();
        let mut snow = SubcatchSnow::default();
        let snowfall = 1.0 / 43200.0;
        let melt = snow.step(&p, snowfall, 20.0, 0.5, 3600.0);
        assert_eq!(melt, 0.0);
        assert!(snow.mean_depth(&p, 0.5) > 0.0);
    }

    #[test]
    fn warm_weather_melts_the_pack_out() {
        let p = pack();
        let mut snow = SubcatchSnow::default();
        snow.imperv.depth = 0.05;
        snow.perv.depth = 0.05;
        let mut total_melt = 0.0;
        for _ in 0..2000 {
            total_melt += snow.step(&p, 0.0, 50.0, 0.5, 3600.0) * 3600.0;
        }
        assert!(snow.mean_depth(&p, 0.5) < 1e-6);
        // everything that melted was released once free water filled
        assert!(total_melt > 0.04);
    }

    #[test]
    fn melt_stops_at_base_temperature() {
        let p = pack();
        let mut state = SnowState {
            depth: 0.1,
            free_water: 0.0,
        };
        let melt = state.step(&p.imperv, 0.0, 32.0, 3600.0);
        assert_eq!(melt, 0.0);
    }
}
