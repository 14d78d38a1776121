//! Subcatchments and runoff generation
//!
//! A subcatchment is a planar surface split into three sub-areas:
//! impervious with depression storage, impervious without, and pervious.
//! Each wet step it takes rainfall (plus snowmelt and runon), loses water
//! to evaporation and infiltration, and releases the excess through a
//! nonlinear-reservoir overland flow equation. Sub-area runoff may be
//! routed internally before it leaves for the outlet; a subcatchment with
//! no outlet recycles its runoff onto itself.
//!
//! Internally: areas ft², depths ft, rates ft/s, flows cfs.

use crate::error::{EngineError, Result};
use crate::infil::{Infil, InfilParams};
use crate::lid::LidUnit;
use serde::{Deserialize, Serialize};

/// Runoff below this rate is treated as zero (cfs).
const MIN_RUNOFF_FLOW: f64 = 0.001;

/// Where subcatchment runoff is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutletRef {
    /// closed catchment: runoff ponds back onto the subcatchment
    #[default]
    Recycle,
    Node(usize),
    Subcatch(usize),
}

/// Internal routing of sub-area runoff.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SubareaRouting {
    /// both sub-areas discharge to the outlet
    #[default]
    ToOutlet,
    /// pervious runoff crosses the impervious area first
    ToImperv,
    /// impervious runoff crosses the pervious area first
    ToPerv,
}

/// The three overland-flow compartments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubareaKind {
    /// impervious, no depression storage
    ImpervZero,
    /// impervious with depression storage
    ImpervStored,
    Perv,
}

/// Runtime state of one sub-area.
#[derive(Debug, Clone, Default)]
pub struct Subarea {
    /// fraction of the subcatchment footprint
    pub frac: f64,
    /// depression storage, ft
    pub dstore: f64,
    pub roughness: f64,
    /// Manning conveyance term for the nonlinear reservoir
    pub alpha: f64,
    /// current ponded depth, ft
    pub depth: f64,
    /// current runoff, ft/s over the sub-area
    pub runoff: f64,
    /// inflow routed in from a sibling sub-area, ft/s
    pub routed_inflow: f64,
}

impl Subarea {
    /// Advance the sub-area moisture balance one step. `inflow` and
    /// `losses` are rates over the sub-area (ft/s); returns runoff ft/s.
    fn update(&mut self, inflow: f64, losses: f64, tstep: f64) -> f64 {
        let net = inflow + self.routed_inflow - losses;
        if self.alpha <= 0.0 {
            // no conveyance: pure reservoir, excess above storage spills
            self.depth = (self.depth + net * tstep).max(0.0);
            let spill = (self.depth - self.dstore).max(0.0);
            self.runoff = spill / tstep;
            self.depth -= spill;
            return self.runoff;
        }
        // nonlinear reservoir solved by fixed-point iteration on the
        // average depth over the step
        let d1 = self.depth;
        let mut d2 = d1;
        for _ in 0..12 {
            let d_avg = 0.5 * (d1 + d2);
            let q = if d_avg > self.dstore {
                self.alpha * (d_avg - self.dstore).powf(5.0 / 3.0)
            } else {
                0.0
            };
            let next = (d1 + (net - q) * tstep).max(0.0);
            if (next - d2).abs() < 1.0e-8 {
                d2 = next;
                break;
            }
            d2 = next;
        }
        let d_avg = 0.5 * (d1 + d2);
        self.runoff = if d_avg > self.dstore {
            self.alpha * (d_avg - self.dstore).powf(5.0 / 3.0)
        } else {
            0.0
        };
        // runoff cannot exceed the water actually present
        let max_runoff = (d1 - d2) / tstep + net;
        self.runoff = self.runoff.clamp(0.0, max_runoff.max(0.0));
        self.depth = (d1 + (net - self.runoff) * tstep).max(0.0);
        self.runoff
    }
}

/// Cumulative subcatchment totals, ft³ except where noted.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SubcatchTotals {
    pub precip: f64,
    pub runon: f64,
    pub evap: f64,
    pub infil: f64,
    pub runoff: f64,
    pub imperv_runoff: f64,
    pub perv_runoff: f64,
    /// peak runoff, cfs
    pub max_flow: f64,
}

/// A subcatchment definition plus its runtime state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subcatchment {
    pub id: String,
    pub gage: String,
    /// outlet node or subcatchment name; absent = closed catchment
    #[serde(default)]
    pub outlet: Option<String>,
    /// footprint, ft² internal (acres in user documents)
    pub area: f64,
    /// characteristic overland flow width, ft
    pub width: f64,
    /// surface slope, ft/ft
    pub slope: f64,
    /// fraction impervious, 0..1
    pub frac_imperv: f64,
    /// Manning n of impervious / pervious surface
    pub n_imperv: f64,
    pub n_perv: f64,
    /// depression storage, ft
    pub dstore_imperv: f64,
    pub dstore_perv: f64,
    /// fraction of the impervious area with no depression storage
    pub pct_zero_storage: f64,
    #[serde(default)]
    pub routing: SubareaRouting,
    /// fraction of routed sub-area runoff that takes the internal path
    #[serde(default = "one")]
    pub pct_routed: f64,
    pub infiltration: InfilParams,
    /// optional snowpack name
    #[serde(default)]
    pub snowpack: Option<String>,
    #[serde(default)]
    pub lid_units: Vec<LidUnit>,

    // --- runtime state ---
    #[serde(skip)]
    pub gage_index: usize,
    #[serde(skip)]
    pub outlet_ref: OutletRef,
    #[serde(skip)]
    pub subareas: [Subarea; 3],
    #[serde(skip)]
    pub infil_state: Option<Infil>,
    /// current rainfall + snowmelt intensity, ft/s
    #[serde(skip)]
    pub rainfall: f64,
    /// runon from upstream subcatchments and LID drains, cfs
    #[serde(skip)]
    pub runon: f64,
    /// runoff at the end of the last step, cfs
    #[serde(skip)]
    pub new_runoff: f64,
    #[serde(skip)]
    pub old_runoff: f64,
    /// losses over the last step, cfs
    #[serde(skip)]
    pub evap_loss: f64,
    #[serde(skip)]
    pub infil_loss: f64,
    /// this step's runoff split by source sub-area, cfs
    #[serde(skip)]
    pub imperv_runoff: f64,
    #[serde(skip)]
    pub perv_runoff: f64,
    #[serde(skip)]
    pub totals: SubcatchTotals,
    /// per-pollutant surface buildup, mass
    #[serde(skip)]
    pub buildup: Vec<f64>,
    /// per-pollutant concentration in ponded/runoff water, mass/ft³
    #[serde(skip)]
    pub ponded_qual: Vec<f64>,
    /// per-pollutant washoff load rate this step, mass/s
    #[serde(skip)]
    pub washoff_load: Vec<f64>,
}

fn one() -> f64 {
    1.0
}

impl Subcatchment {
    pub fn validate(&self) -> Result<()> {
        if self.area <= 0.0 || self.width < 0.0 {
            return Err(EngineError::InputFormat(format!(
                "subcatchment {} has a non-positive area",
                self.id
            )));
        }
        if !(0.0..=1.0).contains(&self.frac_imperv)
            || !(0.0..=1.0).contains(&self.pct_zero_storage)
        {
            return Err(EngineError::InputFormat(format!(
                "subcatchment {} fractions must lie in 0..1",
                self.id
            )));
        }
        if !self.infiltration.is_valid() {
            return Err(EngineError::InputFormat(format!(
                "subcatchment {} has invalid infiltration parameters",
                self.id
            )));
        }
        let lid_area: f64 = self.lid_units.iter().map(|u| u.total_area()).sum();
        if lid_area > self.area * (1.0 + 1.0e-6) {
            return Err(EngineError::LidAreas(self.id.clone()));
        }
        let captured: f64 = self
            .lid_units
            .iter()
            .map(|u| u.from_imperv * self.area * self.frac_imperv)
            .sum();
        if captured > self.area * self.frac_imperv * (1.0 + 1.0e-6) {
            return Err(EngineError::LidCaptureArea(self.id.clone()));
        }
        Ok(())
    }

    /// Area not occupied by LID units, ft².
    pub fn non_lid_area(&self) -> f64 {
        let lid_area: f64 = self.lid_units.iter().map(|u| u.total_area()).sum();
        (self.area - lid_area).max(0.0)
    }

    /// Set up sub-areas and infiltration state for a run.
    pub fn initialize(&mut self, npollut: usize) {
        let area = self.non_lid_area();
        let imperv = self.frac_imperv;
        let fracs = [
            imperv * self.pct_zero_storage,
            imperv * (1.0 - self.pct_zero_storage),
            1.0 - imperv,
        ];
        let params = [
            (0.0, self.n_imperv),
            (self.dstore_imperv, self.n_imperv),
            (self.dstore_perv, self.n_perv),
        ];
        for (i, sa) in self.subareas.iter_mut().enumerate() {
            sa.frac = fracs[i];
            sa.dstore = params[i].0;
            sa.roughness = params[i].1;
            sa.depth = 0.0;
            sa.runoff = 0.0;
            sa.routed_inflow = 0.0;
            let sub_area = area * sa.frac;
            sa.alpha = if sub_area > 0.0 && sa.roughness > 0.0 {
                1.49 * self.width * self.slope.max(0.0).sqrt() / (sa.roughness * sub_area)
            } else {
                0.0
            };
        }
        let mut infil = Infil::new(&self.infiltration);
        infil.initialize();
        self.infil_state = Some(infil);
        self.rainfall = 0.0;
        self.runon = 0.0;
        self.new_runoff = 0.0;
        self.old_runoff = 0.0;
        self.totals = SubcatchTotals::default();
        self.buildup = vec![0.0; npollut];
        self.ponded_qual = vec![0.0; npollut];
        self.washoff_load = vec![0.0; npollut];
    }

    /// Advance runoff one hydrologic step.
    ///
    /// `rainfall` is the gage intensity plus any snowmelt (ft/s) and
    /// `evap_rate` the potential evaporation (ft/s). LID capture is
    /// handled by the caller, which passes the fraction of the step's
    /// surface inflow remaining on the non-LID area and adds LID surface
    /// returns through [`Subcatchment::add_runon`]. Returns runoff in cfs.
    pub fn compute_runoff(&mut self, rainfall: f64, evap_rate: f64, tstep: f64) -> f64 {
        let area = self.non_lid_area();
        self.rainfall = rainfall;
        self.old_runoff = self.new_runoff;
        if area <= 0.0 {
            self.new_runoff = 0.0;
            return 0.0;
        }
        // runon and recycled runoff spread over the whole surface
        let runon_rate = self.runon / area;
        let inflow = rainfall + runon_rate;

        // internal routing: senders run first, the receiver sees their
        // routed flow within the same step
        let (senders, receiver, order): (&[usize], Option<usize>, [usize; 3]) =
            match self.routing {
                SubareaRouting::ToOutlet => (&[], None, [0, 1, 2]),
                SubareaRouting::ToPerv => (&[0, 1], Some(2), [0, 1, 2]),
                SubareaRouting::ToImperv => (&[2], Some(1), [2, 0, 1]),
            };
        let receiver_area = receiver.map(|r| area * self.subareas[r].frac).unwrap_or(0.0);

        let mut evap_vol = 0.0;
        let mut infil_vol = 0.0;
        let mut imperv_runoff = 0.0;
        let mut perv_runoff = 0.0;
        let mut outlet_flow = 0.0;
        let mut routed_cfs = 0.0;

        for &i in &order {
            let sa_area = area * self.subareas[i].frac;
            if sa_area <= 0.0 {
                self.subareas[i].runoff = 0.0;
                continue;
            }
            // losses: evaporation everywhere, infiltration on pervious only
            let evap = evap_rate.min(inflow + self.subareas[i].depth / tstep.max(1.0));
            let infil = if i == 2 {
                let available = (inflow - evap).max(0.0);
                self.infil_state
                    .as_mut()
                    .map(|inf| inf.rate(available, self.subareas[i].depth, tstep))
                    .unwrap_or(0.0)
            } else {
                0.0
            };

            self.subareas[i].routed_inflow = if Some(i) == receiver {
                routed_cfs / sa_area
            } else {
                0.0
            };
            let q = self.subareas[i].update(inflow, evap + infil, tstep);

            evap_vol += evap * sa_area * tstep;
            infil_vol += infil * sa_area * tstep;

            let q_cfs = q * sa_area;
            if senders.contains(&i) && receiver_area > 0.0 {
                routed_cfs += q_cfs * self.pct_routed;
                outlet_flow += q_cfs * (1.0 - self.pct_routed);
            } else {
                outlet_flow += q_cfs;
            }
            if i == 2 {
                perv_runoff += q_cfs;
            } else {
                imperv_runoff += q_cfs;
            }
        }

        let runoff = if outlet_flow >= MIN_RUNOFF_FLOW {
            outlet_flow
        } else {
            0.0
        };
        self.new_runoff = runoff;
        self.evap_loss = evap_vol / tstep;
        self.infil_loss = infil_vol / tstep;
        self.imperv_runoff = imperv_runoff;
        self.perv_runoff = perv_runoff;

        self.totals.precip += rainfall * area * tstep;
        self.totals.runon += self.runon * tstep;
        self.totals.evap += evap_vol;
        self.totals.infil += infil_vol;
        self.totals.runoff += runoff * tstep;
        self.totals.imperv_runoff += imperv_runoff * tstep;
        self.totals.perv_runoff += perv_runoff * tstep;
        self.totals.max_flow = self.totals.max_flow.max(runoff);

        self.runon = 0.0;
        runoff
    }

    /// Queue inflow (cfs) arriving from an upstream subcatchment, a LID
    /// drain, or the subcatchment's own recycled runoff.
    pub fn add_runon(&mut self, flow: f64) {
        self.runon += flow;
    }

    /// Ponded depth averaged over the subcatchment, ft.
    pub fn ponded_depth(&self) -> f64 {
        self.subareas
            .iter()
            .map(|sa| sa.depth * sa.frac)
            .sum::<f64>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const IN_PER_HR: f64 = 1.0 / 43200.0;

    fn basic() -> Subcatchment {
        Subcatchment {
            id: "S1".into(),
            gage: "G1".into(),
            outlet: Some("J1".into()),
            area: 15.0 * 43560.0,
            width: 500.0,
            slope: 0.01,
            frac_imperv: 0.5,
            n_imperv: 0.012,
            n_perv: 0.1,
            dstore_imperv: 0.05 / 12.0,
            dstore_perv: 0.1 / 12.0,
            pct_zero_storage: 0.25,
            routing: SubareaRouting::ToOutlet,
            pct_routed: 1.0,
            infiltration: InfilParams::Horton {
                max_rate: 3.0 * IN_PER_HR,
                min_rate: 0.5 * IN_PER_HR,
                decay: 4.0 / 3600.0,
                dry_time: 7.0 * 86400.0,
                max_volume: 0.0,
            },
            snowpack: None,
            lid_units: Vec::new(),
            gage_index: 0,
            outlet_ref: OutletRef::Node(0),
            subareas: Default::default(),
            infil_state: None,
            rainfall: 0.0,
            runon: 0.0,
            new_runoff: 0.0,
            old_runoff: 0.0,
            evap_loss: 0.0,
            infil_loss: 0.0,
            imperv_runoff: 0.0,
            perv_runoff: 0.0,
            totals: SubcatchTotals::default(),
            buildup: Vec::new(),
            ponded_qual: Vec::new(),
            washoff_load: Vec::new(),
        }
    }

    #[test]
    fn subarea_fractions_sum_to_one() {
        let mut s = basic();
        s.initialize(0);
        let total: f64 = s.subareas.iter().map(|sa| sa.frac).sum();
        assert_relative_eq!(total, 1.0, max_relative = 1e-12);
    }

    #[test]
    fn dry_subcatchment_produces_no_runoff() {
        let mut s = basic();
        s.initialize(0);
        for _ in 0..10 {
            assert_eq!(s.compute_runoff(0.0, 0.0, 300.0), 0.0);
        }
    }

    #[test]
    fn mass_balance_closes_during_a_storm() {
        let mut s = basic();
        s.initialize(0);
        let tstep = 300.0;
        // 2 hours of 1 in/hr rain, then 4 hours of drainage
        for i in 0..72 {
            let rain = if i < 24 { IN_PER_HR } else { 0.0 };
            s.compute_runoff(rain, 0.0, tstep);
        }
        let stored: f64 = s
            .subareas
            .iter()
            .map(|sa| sa.depth * sa.frac * s.non_lid_area())
            .sum();
        let residual = s.totals.precip + s.totals.runon
            - s.totals.evap
            - s.totals.infil
            - s.totals.runoff
            - stored;
        let pct = residual.abs() / s.totals.precip * 100.0;
        assert!(pct < 1.0, "runoff continuity error {pct}%");
        assert!(s.totals.runoff > 0.0);
        assert!(s.totals.infil > 0.0);
    }

    #[test]
    fn impervious_area_sheds_more_than_pervious() {
        let mut s = basic();
        s.initialize(0);
        let tstep = 300.0;
        for _ in 0..24 {
            s.compute_runoff(IN_PER_HR, 0.0, tstep);
        }
        assert!(s.totals.imperv_runoff > s.totals.perv_runoff);
    }

    #[test]
    fn lid_area_cannot_exceed_subcatchment_area() {
        let mut s = basic();
        s.lid_units.push(LidUnit {
            process: "BC".into(),
            number: 1000,
            area: 10_000.0,
            full_width: 10.0,
            init_sat: 0.0,
            from_imperv: 0.1,
            from_perv: 0.0,
            to_perv: false,
            drain_to: Default::default(),
            process_index: 0,
            drain_node: None,
            drain_subcatch: None,
            surface_depth: 0.0,
            pave_depth: 0.0,
            soil_moisture: 0.0,
            storage_depth: 0.0,
            drain_open: false,
            dry_time: 0.0,
            clog_depth: 0.0,
            regen_elapsed: 0.0,
            flux: Default::default(),
            totals: Default::default(),
        });
        assert!(matches!(s.validate(), Err(EngineError::LidAreas(_))));
    }
}
