//! Water quality routing
//!
//! Surface buildup and washoff feed pollutant loads into node lateral
//! inflows; nodes mix as CSTRs (or plug-flow reactors for storage units
//! so configured); links advect their upstream node's concentration
//! through their stored volume with first-order decay; treatment
//! expressions then adjust node concentrations in dependency order.
//!
//! Concentrations are mass per liter, volumes ft³, flows cfs, loads
//! mass per second.

use crate::node::{NodeKind, ReactorKind};
use crate::pollut::{BuildupState, Landuse, L_PER_FT3};
use crate::project::Project;
use crate::subcatch::Subcatchment;
use crate::treatment::{self, Treatment, TreatmentContext, TreatmentKind};
use std::collections::VecDeque;

/// One slug of a plug-flow reactor.
#[derive(Debug, Clone)]
struct Slug {
    volume: f64,
    conc: Vec<f64>,
}

/// Surface pollutant bookkeeping of one subcatchment.
#[derive(Debug, Clone, Default)]
pub struct SurfaceQuality {
    /// (landuse index, area fraction)
    pub coverage: Vec<(usize, f64)>,
    /// buildup per coverage entry and pollutant
    pub buildup: Vec<Vec<BuildupState>>,
}

impl SurfaceQuality {
    pub fn new(coverage: Vec<(usize, f64)>, npollut: usize) -> Self {
        let buildup = coverage
            .iter()
            .map(|_| vec![BuildupState::default(); npollut])
            .collect();
        SurfaceQuality { coverage, buildup }
    }

    /// Seed initial buildup mass spread uniformly over the coverages.
    pub fn seed(&mut self, pollut: usize, mass: f64) {
        let n = self.buildup.len().max(1) as f64;
        for per_cov in &mut self.buildup {
            if let Some(state) = per_cov.get_mut(pollut) {
                state.mass = mass / n;
            }
        }
    }

    /// Dry-weather buildup over `tstep` seconds.
    pub fn accumulate(&mut self, sub: &Subcatchment, landuses: &[Landuse], tstep: f64) {
        let area_acres = sub.area * 2.2956e-5;
        let days = tstep / 86400.0;
        for (ci, &(li, frac)) in self.coverage.iter().enumerate() {
            for load in &landuses[li].loads {
                let state = &mut self.buildup[ci][load.pollut_index];
                state.accumulate(&load.buildup, area_acres * frac, days);
            }
        }
    }

    /// Wet-step washoff; returns per-pollutant loads (mass/s) and
    /// depletes buildup.
    pub fn washoff(
        &mut self,
        sub: &Subcatchment,
        landuses: &[Landuse],
        runoff: f64,
        tstep: f64,
        npollut: usize,
    ) -> Vec<f64> {
        let mut loads = vec![0.0; npollut];
        if runoff <= 0.0 {
            return loads;
        }
        let runoff_rate = runoff / sub.area.max(1.0);
        let area_acres = sub.area * 2.2956e-5;
        for (ci, &(li, frac)) in self.coverage.iter().enumerate() {
            for load in &landuses[li].loads {
                let state = &mut self.buildup[ci][load.pollut_index];
                let mut w = load
                    .washoff
                    .load(runoff * frac, runoff_rate, state.mass);
                // cannot wash off more than is there
                w = w.min(state.mass / tstep);
                if w > 0.0 {
                    state.remove(&load.buildup, area_acres * frac, w * tstep);
                    loads[load.pollut_index] += w;
                }
            }
        }
        loads
    }

    /// Total surface mass of one pollutant.
    pub fn total_mass(&self, pollut: usize) -> f64 {
        self.buildup
            .iter()
            .filter_map(|b| b.get(pollut))
            .map(|s| s.mass)
            .sum()
    }
}

/// Reactor and surface state for a run.
#[derive(Debug, Clone, Default)]
pub struct QualityEngine {
    pub surfaces: Vec<SurfaceQuality>,
    /// plug-flow queues per node (empty for CSTR nodes)
    plug: Vec<VecDeque<Slug>>,
    /// scratch lateral loads per node and pollutant, mass/s
    pub lateral_load: Vec<Vec<f64>>,
    /// cumulative washoff mass per pollutant
    pub total_washoff: Vec<f64>,
}

impl QualityEngine {
    pub fn new(project: &Project) -> Self {
        let npollut = project.npollut();
        let nsub = project.subcatchments.len();
        let mut surfaces: Vec<SurfaceQuality> = (0..nsub)
            .map(|si| {
                let coverage: Vec<(usize, f64)> = project
                    .coverages
                    .iter()
                    .filter(|c| c.subcatch_index == si)
                    .map(|c| (c.landuse_index, c.fraction))
                    .collect();
                SurfaceQuality::new(coverage, npollut)
            })
            .collect();
        for loading in &project.loadings {
            let area_acres = project.subcatchments[loading.subcatch_index].area * 2.2956e-5;
            surfaces[loading.subcatch_index]
                .seed(loading.pollut_index, loading.buildup * area_acres);
        }
        QualityEngine {
            surfaces,
            plug: project.nodes.iter().map(|_| VecDeque::new()).collect(),
            lateral_load: vec![vec![0.0; npollut]; project.nodes.len()],
            total_washoff: vec![0.0; npollut],
        }
    }

    pub fn clear_lateral_loads(&mut self) {
        for loads in &mut self.lateral_load {
            loads.iter_mut().for_each(|l| *l = 0.0);
        }
    }

    /// Add a pollutant load at a node (mass/s).
    pub fn add_lateral_load(&mut self, node: usize, pollut: usize, load: f64) {
        self.lateral_load[node][pollut] += load;
    }

    /// Route quality through one node over `tstep`.
    ///
    /// `link_inflows` iterates (flow into the node, upstream concentration
    /// slice) pairs for every inflowing link.
    pub fn route_node(
        &mut self,
        project: &mut Project,
        node_index: usize,
        link_inflows: &[(f64, Vec<f64>)],
        tstep: f64,
    ) {
        let npollut = project.npollut();
        if npollut == 0 {
            return;
        }
        let node = &project.nodes[node_index];
        let v1 = node.old_volume;
        let v2 = node.new_volume;
        let outflow = node.outflow.max(0.0);
        let plug_kind = match &node.kind {
            NodeKind::Storage(s) => s.mixing,
            _ => ReactorKind::Cstr,
        };

        // mass inflow per pollutant
        let mut mass_in = vec![0.0; npollut];
        let mut flow_in = 0.0;
        for (q, conc) in link_inflows {
            flow_in += q.max(0.0);
            for p in 0..npollut {
                mass_in[p] += q.max(0.0) * conc.get(p).copied().unwrap_or(0.0);
            }
        }
        for p in 0..npollut {
            // lateral loads arrive as mass/s; fold into flow-concentration
            mass_in[p] += self.lateral_load[node_index][p] / L_PER_FT3;
        }
        flow_in += node.new_lat_flow.max(0.0);

        match plug_kind {
            ReactorKind::Cstr => {
                let node = &mut project.nodes[node_index];
                for p in 0..npollut {
                    let c1 = node.old_qual[p];
                    let denom = v2 + outflow * tstep;
                    let mut c2 = if denom > 1e-6 {
                        (c1 * v1 + mass_in[p] * tstep) / denom
                    } else if flow_in > 1e-6 {
                        mass_in[p] / flow_in
                    } else {
                        c1
                    };
                    let decay = project.pollutants[p].decay_rate;
                    if decay > 0.0 {
                        c2 *= (-decay * tstep).exp();
                    }
                    node.new_qual[p] = c2.max(0.0);
                }
            }
            ReactorKind::Plug => {
                // push this step's inflow as a new slug, pop outflow
                let queue = &mut self.plug[node_index];
                let vin = flow_in * tstep;
                if vin > 0.0 {
                    let conc: Vec<f64> = mass_in
                        .iter()
                        .map(|&m| if flow_in > 0.0 { m / flow_in } else { 0.0 })
                        .collect();
                    queue.push_back(Slug {
                        volume: vin,
                        conc,
                    });
                }
                let mut vout = outflow * tstep;
                let mut mass_out = vec![0.0; npollut];
                let mut v_released = 0.0;
                while vout > 0.0 {
                    let Some(front) = queue.front_mut() else {
                        break;
                    };
                    let take = front.volume.min(vout);
                    for p in 0..npollut {
                        mass_out[p] += take * front.conc[p];
                    }
                    front.volume -= take;
                    v_released += take;
                    vout -= take;
                    if front.volume <= 1e-9 {
                        queue.pop_front();
                    }
                }
                let node = &mut project.nodes[node_index];
                for p in 0..npollut {
                    let c_out = if v_released > 0.0 {
                        mass_out[p] / v_released
                    } else {
                        0.0
                    };
                    let decay = project.pollutants[p].decay_rate;
                    node.new_qual[p] = if decay > 0.0 {
                        c_out * (-decay * tstep).exp()
                    } else {
                        c_out
                    };
                }
            }
        }

        self.apply_treatment(project, node_index, flow_in, tstep);
    }

    /// Apply the node's treatment expressions in dependency order.
    fn apply_treatment(
        &mut self,
        project: &mut Project,
        node_index: usize,
        inflow: f64,
        tstep: f64,
    ) {
        let at_node: Vec<usize> = (0..project.treatments.len())
            .filter(|&ti| project.treatments[ti].node_index == node_index)
            .collect();
        if at_node.is_empty() {
            return;
        }
        let refs: Vec<&Treatment> = at_node.iter().map(|&ti| &project.treatments[ti]).collect();
        let Ok(order) = treatment::evaluation_order(&project.nodes[node_index].id, &refs) else {
            return; // cycles were rejected at start
        };
        let node = &project.nodes[node_index];
        let ctx = TreatmentContext {
            hrt: if inflow > 1e-6 {
                node.new_volume / inflow / 3600.0
            } else {
                0.0
            },
            dt: tstep,
            flow: inflow,
            depth: node.new_depth,
            area: 0.0,
        };
        let conc = node.new_qual.clone();
        let mut removals = vec![0.0; project.npollut()];
        let mut updated = conc.clone();
        for &pos in &order {
            let t = refs[pos];
            let Some(program) = &t.program else { continue };
            let value = program.eval(&ctx, &conc, &removals);
            match t.kind {
                TreatmentKind::Removal => {
                    let r = value.clamp(0.0, 1.0);
                    removals[t.pollut_index] = r;
                    updated[t.pollut_index] = conc[t.pollut_index] * (1.0 - r);
                }
                TreatmentKind::Concentration => {
                    let c = value.max(0.0).min(conc[t.pollut_index].max(value.max(0.0)));
                    updated[t.pollut_index] = c;
                    if conc[t.pollut_index] > 0.0 {
                        removals[t.pollut_index] =
                            (1.0 - c / conc[t.pollut_index]).clamp(0.0, 1.0);
                    }
                }
            }
        }
        project.nodes[node_index].new_qual = updated;
    }

    /// Advect quality through one link: complete mixing of the upstream
    /// node's water with the link's stored volume.
    pub fn route_link(&self, project: &mut Project, link_index: usize, tstep: f64) {
        let npollut = project.npollut();
        if npollut == 0 {
            return;
        }
        let link = &project.links[link_index];
        let q = link.new_flow.abs();
        let upstream = if link.new_flow >= 0.0 {
            link.node1
        } else {
            link.node2
        };
        let c_up: Vec<f64> = project.nodes[upstream].new_qual.clone();
        let v1 = link.old_volume;
        let v2 = link.new_volume;
        let link = &mut project.links[link_index];
        for p in 0..npollut {
            let c1 = link.old_qual[p];
            let denom = v2 + q * tstep;
            let mut c2 = if denom > 1e-6 {
                (c1 * v1 + c_up[p] * q * tstep) / denom
            } else {
                c_up[p]
            };
            let decay = project.pollutants[p].decay_rate;
            if decay > 0.0 {
                c2 *= (-decay * tstep).exp();
            }
            link.new_qual[p] = c2.max(0.0);
            link.total_load[p] += c2 * q * tstep * L_PER_FT3;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::Project;
    use approx::assert_relative_eq;

    fn project_with_storage() -> Project {
        let json = r#"{
            "options": {
                "flow_units": "CFS",
                "start": "2024-06-01T00:00:00",
                "end": "2024-06-01T06:00:00"
            },
            "pollutants": [{"id": "TSS", "units": "mg-per-l"}],
            "nodes": [
                {"id": "SU1", "kind": "storage", "shape": "functional",
                 "coeff": 0.0, "expon": 0.0, "constant": 1000.0,
                 "invert": 0.0, "full_depth": 10.0},
                {"id": "O1", "kind": "outfall", "boundary": "free", "invert": 0.0}
            ],
            "links": [{
                "id": "C1", "type": "conduit", "from_node": "SU1", "to_node": "O1",
                "length": 100.0, "roughness": 0.013,
                "shape": {"shape": "circular", "diameter": 2.0}
            }]
        }"#;
        Project::from_json(json).unwrap()
    }

    #[test]
    fn cstr_approaches_inflow_concentration() {
        let mut project = project_with_storage();
        let npollut = 1;
        for n in &mut project.nodes {
            n.initialize(npollut, None);
        }
        for l in &mut project.links {
            l.initialize(npollut);
        }
        let mut quality = QualityEngine::new(&project);
        let tstep = 60.0;
        // steady 100 cfs through a full 10000 ft³ tank at 10 mg/L inflow
        let volume = 10_000.0;
        project.nodes[0].old_volume = volume;
        project.nodes[0].new_volume = volume;
        project.nodes[0].outflow = 100.0;
        let inflow = vec![(100.0, vec![10.0])];
        // several residence times past the spin-up
        let steps = (8.0 * volume / 100.0 / tstep) as usize;
        for _ in 0..steps {
            quality.route_node(&mut project, 0, &inflow, tstep);
            project.nodes[0].advance();
        }
        assert_relative_eq!(project.nodes[0].new_qual[0], 10.0, max_relative = 0.02);
    }

    #[test]
    fn plug_flow_delays_the_front() {
        let mut project = project_with_storage();
        if let NodeKind::Storage(ref mut s) = project.nodes[0].kind {
            s.mixing = ReactorKind::Plug;
        }
        for n in &mut project.nodes {
            n.initialize(1, None);
        }
        let mut quality = QualityEngine::new(&project);
        let tstep = 10.0;
        let volume = 10_000.0;
        project.nodes[0].old_volume = volume;
        project.nodes[0].new_volume = volume;
        project.nodes[0].outflow = 100.0;
        // prime the tank with clean water
        quality.plug[0].push_back(Slug {
            volume,
            conc: vec![0.0],
        });
        let inflow = vec![(100.0, vec![10.0])];
        // before one residence time the outflow is still clean
        let steps_half = (0.5 * volume / 100.0 / tstep) as usize;
        for _ in 0..steps_half {
            quality.route_node(&mut project, 0, &inflow, tstep);
            project.nodes[0].advance();
        }
        assert!(project.nodes[0].new_qual[0] < 0.1);
        // well past one residence time the front has broken through
        for _ in 0..(3 * steps_half) {
            quality.route_node(&mut project, 0, &inflow, tstep);
            project.nodes[0].advance();
        }
        assert!(project.nodes[0].new_qual[0] > 9.0);
    }

    #[test]
    fn washoff_depletes_surface_mass() {
        use crate::pollut::{BuildupFunc, Landuse, LanduseLoad, WashoffFunc};
        let mut surface = SurfaceQuality::new(vec![(0, 1.0)], 1);
        surface.seed(0, 100.0);
        let landuses = vec![Landuse {
            id: "RES".into(),
            loads: vec![LanduseLoad {
                pollutant: "TSS".into(),
                buildup: BuildupFunc::Power {
                    max: 50.0,
                    coeff: 10.0,
                    expon: 0.5,
                },
                washoff: WashoffFunc::Exponential {
                    coeff: 4.0,
                    expon: 1.0,
                },
                pollut_index: 0,
            }],
        }];
        let sub = sub_for_test();
        let before = surface.total_mass(0);
        let loads = surface.washoff(&sub, &landuses, 10.0, 300.0, 1);
        assert!(loads[0] > 0.0);
        assert!(surface.total_mass(0) < before);
    }

    fn sub_for_test() -> crate::subcatch::Subcatchment {
        use crate::infil::InfilParams;
        crate::subcatch::Subcatchment {
            id: "S1".into(),
            gage: "G1".into(),
            outlet: None,
            area: 10.0 * 43560.0,
            width: 100.0,
            slope: 0.01,
            frac_imperv: 0.5,
            n_imperv: 0.012,
            n_perv: 0.1,
            dstore_imperv: 0.0,
            dstore_perv: 0.0,
            pct_zero_storage: 0.0,
            routing: Default::default(),
            pct_routed: 1.0,
            infiltration: InfilParams::CurveNumber {
                curve_number: 80.0,
                dry_time: 7.0,
            },
            snowpack: None,
            lid_units: Vec::new(),
            gage_index: 0,
            outlet_ref: Default::default(),
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
            totals: Default::default(),
            buildup: Vec::new(),
            ponded_qual: Vec::new(),
            washoff_load: Vec::new(),
        }
    }
}
