//! Groundwater
//!
//! An optional two-zone aquifer beneath a subcatchment. Infiltration from
//! the pervious surface percolates through an upper unsaturated zone into
//! a lower saturated zone whose water table drives a lateral flow to the
//! receiving node:
//!
//! ```text
//! qgw = a1·(Hgw − Hcb)^b1 − a2·(Hsw − Hcb)^b2 + a3·Hgw·Hsw
//! ```
//!
//! with `Hgw` the water table height, `Hsw` the receiving channel water
//! height, and `Hcb` the channel bottom height, all above the aquifer
//! bottom. Evapotranspiration not satisfied at the surface draws the
//! upper zone down.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};

/// Aquifer parameter set shared by subcatchments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Aquifer {
    pub id: String,
    pub porosity: f64,
    pub wilt_point: f64,
    pub field_capacity: f64,
    /// saturated hydraulic conductivity, ft/s
    pub ksat: f64,
    /// slope of conductivity vs. moisture deficit
    pub k_slope: f64,
    /// slope of tension vs. moisture deficit
    pub tension_slope: f64,
    /// fraction of evaporation demand reaching the upper zone
    pub evap_frac: f64,
    /// depth below the water table to which evaporation can reach, ft
    #[serde(default)]
    pub evap_depth: f64,
    /// seepage rate to deep groundwater, ft/s
    #[serde(default)]
    pub deep_seepage: f64,
    /// aquifer bottom elevation, ft
    pub bottom_elev: f64,
    /// initial water table elevation, ft
    pub water_table: f64,
    /// initial upper-zone moisture content
    pub init_moisture: f64,
}

impl Aquifer {
    pub fn validate(&self) -> Result<()> {
        let ok = self.porosity > 0.0
            && self.porosity <= 1.0
            && self.wilt_point < self.field_capacity
            && self.field_capacity < self.porosity
            && self.ksat >= 0.0
            && self.water_table >= self.bottom_elev;
        if ok {
            Ok(())
        } else {
            Err(EngineError::AquiferParams(self.id.clone()))
        }
    }
}

/// Lateral groundwater flow expression coefficients.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GwFlowCoeffs {
    pub a1: f64,
    pub b1: f64,
    #[serde(default)]
    pub a2: f64,
    #[serde(default)]
    pub b2: f64,
    #[serde(default)]
    pub a3: f64,
}

/// Groundwater attachment on one subcatchment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Groundwater {
    /// subcatchment the aquifer lies beneath
    pub subcatch: String,
    /// aquifer parameter set name
    pub aquifer: String,
    /// receiving node name
    pub node: String,
    /// ground surface elevation, ft
    pub surface_elev: f64,
    /// receiving channel bottom elevation, ft
    pub channel_bottom: f64,
    #[serde(flatten)]
    pub coeffs: GwFlowCoeffs,

    // --- runtime state ---
    #[serde(skip)]
    pub aquifer_index: usize,
    #[serde(skip)]
    pub node_index: usize,
    /// water table elevation, ft
    #[serde(skip)]
    pub water_table: f64,
    /// upper-zone moisture content
    #[serde(skip)]
    pub moisture: f64,
    /// lateral flow of the last step, cfs
    #[serde(skip)]
    pub flow: f64,
    /// deep seepage loss of the last step, cfs
    #[serde(skip)]
    pub seepage: f64,
    /// cumulative totals, ft³
    #[serde(skip)]
    pub total_infil: f64,
    #[serde(skip)]
    pub total_outflow: f64,
    #[serde(skip)]
    pub total_evap: f64,
    #[serde(skip)]
    pub total_seepage: f64,
}

impl Groundwater {
    pub fn initialize(&mut self, aq: &Aquifer) {
        self.water_table = aq.water_table;
        self.moisture = aq.init_moisture.clamp(aq.wilt_point, aq.porosity);
        self.flow = 0.0;
        self.seepage = 0.0;
        self.total_infil = 0.0;
        self.total_outflow = 0.0;
        self.total_evap = 0.0;
        self.total_seepage = 0.0;
    }

    /// Advance the aquifer one step.
    ///
    /// * `infil` — infiltration delivered from the surface, ft/s over `area`
    /// * `evap_unused` — surface evaporation demand not met above, ft/s
    /// * `channel_depth` — water depth in the receiving channel, ft
    ///
    /// Returns the lateral flow to the node, cfs.
    pub fn step(
        &mut self,
        aq: &Aquifer,
        area: f64,
        infil: f64,
        evap_unused: f64,
        channel_depth: f64,
        tstep: f64,
    ) -> f64 {
        let total_depth = self.surface_elev - aq.bottom_elev;
        if total_depth <= 0.0 || area <= 0.0 {
            self.flow = 0.0;
            return 0.0;
        }
        let hgw = (self.water_table - aq.bottom_elev).clamp(0.0, total_depth);
        let upper_depth = (total_depth - hgw).max(0.0);

        // upper zone: take surface infiltration, percolate downward
        let deficit = aq.porosity - self.moisture;
        let perc = if self.moisture > aq.field_capacity && upper_depth > 0.0 {
            aq.ksat * (-(deficit) * aq.k_slope).exp()
        } else {
            0.0
        };
        let evap = if upper_depth > 0.0 {
            (evap_unused * aq.evap_frac)
                .min((self.moisture - aq.wilt_point).max(0.0) * upper_depth / tstep)
        } else {
            0.0
        };
        if upper_depth > 0.0 {
            let net = infil - perc - evap;
            self.moisture =
                (self.moisture + net * tstep / upper_depth).clamp(aq.wilt_point, aq.porosity);
        }

        // lower zone: rise with percolation, fall with outflows
        let hsw = channel_depth.max(0.0);
        let hcb = (self.channel_bottom - aq.bottom_elev).max(0.0);
        let mut qgw = 0.0;
        if hgw > hcb {
            let c = &self.coeffs;
            qgw = c.a1 * (hgw - hcb).powf(c.b1);
            if hsw > 0.0 {
                qgw -= c.a2 * hsw.powf(c.b2);
            }
            qgw += c.a3 * hgw * hsw;
            qgw = qgw.max(0.0);
        }
        let seep = aq.deep_seepage;
        let dh = (perc - qgw - seep) * tstep / aq.porosity.max(1e-6);
        self.water_table = (self.water_table + dh).clamp(aq.bottom_elev, self.surface_elev);

        self.flow = qgw * area;
        self.seepage = seep * area;
        self.total_infil += infil * area * tstep;
        self.total_outflow += self.flow * tstep;
        self.total_evap += evap * area * tstep;
        self.total_seepage += self.seepage * tstep;
        self.flow
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aquifer() -> Aquifer {
        Aquifer {
            id: "AQ1".into(),
            porosity: 0.45,
            wilt_point: 0.1,
            field_capacity: 0.2,
            ksat: 0.5 / 43200.0,
            k_slope: 10.0,
            tension_slope: 15.0,
            evap_frac: 0.35,
            evap_depth: 0.0,
            deep_seepage: 0.0,
            bottom_elev: 0.0,
            water_table: 5.0,
            init_moisture: 0.25,
        }
    }

    fn gw() -> Groundwater {
        Groundwater {
            subcatch: "S1".into(),
            aquifer: "AQ1".into(),
            node: "J1".into(),
            surface_elev: 20.0,
            channel_bottom: 3.0,
            coeffs: GwFlowCoeffs {
                a1: 1.0e-5,
                b1: 1.5,
                a2: 0.0,
                b2: 0.0,
                a3: 0.0,
            },
            aquifer_index: 0,
            node_index: 0,
            water_table: 0.0,
            moisture: 0.0,
            flow: 0.0,
            seepage: 0.0,
            total_infil: 0.0,
            total_outflow: 0.0,
            total_evap: 0.0,
            total_seepage: 0.0,
        }
    }

    #[test]
    fn water_table_above_channel_produces_flow() {
        let aq = aquifer();
        let mut g = gw();
        g.initialize(&aq);
        let q = g.step(&aq, 43560.0, 0.0, 0.0, 0.0, 300.0);
        assert!(q > 0.0);
    }

    #[test]
    fn water_table_below_channel_is_silent() {
        let aq = aquifer();
        let mut g = gw();
        g.initialize(&aq);
        g.water_table = 2.0; // below the 3 ft channel bottom
        let q = g.step(&aq, 43560.0, 0.0, 0.0, 0.0, 300.0);
        assert_eq!(q, 0.0);
    }

    #[test]
    fn sustained_outflow_draws_the_table_down() {
        let aq = aquifer();
        let mut g = gw();
        g.initialize(&aq);
        let start = g.water_table;
        for _ in 0..1000 {
            g.step(&aq, 43560.0, 0.0, 0.0, 0.0, 300.0);
        }
        assert!(g.water_table < start);
    }

    #[test]
    fn inverted_moisture_limits_are_rejected() {
        let mut aq = aquifer();
        aq.field_capacity = 0.05;
        assert!(matches!(
            aq.validate(),
            Err(EngineError::AquiferParams(_))
        ));
    }
}
