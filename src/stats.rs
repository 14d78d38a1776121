//! Per-element simulation statistics
//!
//! Owned by the runtime controller for exactly the duration of a run.
//! Every routing step updates node, link, storage, outfall, and pump
//! tables; element updates are independent, so the sweep runs as a
//! parallel map with each element folding into its own slot.

use crate::link::LinkKind;
use crate::node::NodeKind;
use crate::pollut::L_PER_FT3;
use crate::project::Project;
use chrono::NaiveDateTime;
use rayon::prelude::*;
use serde::Serialize;

/// Running node statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NodeStats {
    pub depth_sum: f64,
    pub max_depth: f64,
    pub max_depth_date: Option<NaiveDateTime>,
    pub time_flooded: f64,
    pub time_surcharged: f64,
    pub time_courant_critical: f64,
    pub max_inflow: f64,
    pub max_inflow_date: Option<NaiveDateTime>,
    pub max_overflow: f64,
    pub max_overflow_date: Option<NaiveDateTime>,
    pub max_ponded_volume: f64,
    pub steps: u64,
}

impl NodeStats {
    pub fn avg_depth(&self) -> f64 {
        if self.steps > 0 {
            self.depth_sum / self.steps as f64
        } else {
            0.0
        }
    }
}

/// Running link statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LinkStats {
    pub max_flow: f64,
    pub max_flow_date: Option<NaiveDateTime>,
    pub max_velocity: f64,
    pub max_depth: f64,
    /// seconds spent in each flow class
    pub time_in_class: [f64; 10],
    /// count of flow reversals
    pub flow_turns: u64,
    /// sign of the previous step's flow
    last_flow_sign: i8,
    pub time_courant_critical: f64,
    pub steps: u64,
}

/// Running pump statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PumpStats {
    /// seconds the pump ran
    pub utilization: f64,
    pub min_flow: f64,
    pub flow_sum: f64,
    pub max_flow: f64,
    pub volume: f64,
    /// kilowatt-hours consumed (from the pump's rated power, if any)
    pub energy: f64,
    pub start_ups: u64,
    was_on: bool,
    pub on_steps: u64,
}

impl PumpStats {
    pub fn avg_flow(&self) -> f64 {
        if self.on_steps > 0 {
            self.flow_sum / self.on_steps as f64
        } else {
            0.0
        }
    }
}

/// Running storage-unit statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StorageStats {
    pub init_volume: f64,
    pub volume_sum: f64,
    pub max_volume: f64,
    pub max_volume_date: Option<NaiveDateTime>,
    pub evap_loss: f64,
    pub exfil_loss: f64,
    pub steps: u64,
}

impl StorageStats {
    pub fn avg_volume(&self) -> f64 {
        if self.steps > 0 {
            self.volume_sum / self.steps as f64
        } else {
            0.0
        }
    }
}

/// Running outfall statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OutfallStats {
    pub flow_sum: f64,
    pub max_flow: f64,
    /// total pollutant load discharged, mass per pollutant
    pub total_load: Vec<f64>,
    /// steps with nonzero discharge
    pub flow_steps: u64,
    pub steps: u64,
}

impl OutfallStats {
    pub fn avg_flow(&self) -> f64 {
        if self.flow_steps > 0 {
            self.flow_sum / self.flow_steps as f64
        } else {
            0.0
        }
    }
}

/// The statistics tables for one run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Stats {
    pub nodes: Vec<NodeStats>,
    pub links: Vec<LinkStats>,
    /// present only for pump links
    pub pumps: Vec<Option<PumpStats>>,
    /// present only for storage nodes
    pub storages: Vec<Option<StorageStats>>,
    /// present only for outfall nodes
    pub outfalls: Vec<Option<OutfallStats>>,
    pub routing_steps: u64,
    pub routing_step_sum: f64,
    pub min_routing_step: f64,
}

impl Stats {
    pub fn new(project: &Project) -> Self {
        let npollut = project.npollut();
        Stats {
            nodes: vec![NodeStats::default(); project.nodes.len()],
            links: vec![LinkStats::default(); project.links.len()],
            pumps: project
                .links
                .iter()
                .map(|l| l.is_pump().then(PumpStats::default))
                .collect(),
            storages: project
                .nodes
                .iter()
                .map(|n| {
                    n.is_storage().then(|| StorageStats {
                        init_volume: n.new_volume,
                        ..Default::default()
                    })
                })
                .collect(),
            outfalls: project
                .nodes
                .iter()
                .map(|n| {
                    n.is_outfall().then(|| OutfallStats {
                        total_load: vec![0.0; npollut],
                        ..Default::default()
                    })
                })
                .collect(),
            routing_steps: 0,
            routing_step_sum: 0.0,
            min_routing_step: f64::MAX,
        }
    }

    /// Fold one routing step into the tables.
    pub fn update(&mut self, project: &Project, tstep: f64, date: NaiveDateTime) {
        self.routing_steps += 1;
        self.routing_step_sum += tstep;
        self.min_routing_step = self.min_routing_step.min(tstep);

        // node tables: each entry folds independently
        self.nodes
            .par_iter_mut()
            .zip(project.nodes.par_iter())
            .for_each(|(stats, node)| {
                stats.steps += 1;
                stats.depth_sum += node.new_depth;
                if node.new_depth > stats.max_depth {
                    stats.max_depth = node.new_depth;
                    stats.max_depth_date = Some(date);
                }
                if node.overflow > 0.0 {
                    stats.time_flooded += tstep;
                    if node.overflow > stats.max_overflow {
                        stats.max_overflow = node.overflow;
                        stats.max_overflow_date = Some(date);
                    }
                }
                let crown_depth = node.crown_elev - node.invert;
                if crown_depth > 0.0 && node.new_depth > crown_depth && !node.is_storage() {
                    stats.time_surcharged += tstep;
                }
                if node.inflow > stats.max_inflow {
                    stats.max_inflow = node.inflow;
                    stats.max_inflow_date = Some(date);
                }
                if node.new_depth > node.full_depth && node.ponded_area > 0.0 {
                    let ponded = (node.new_depth - node.full_depth) * node.ponded_area;
                    stats.max_ponded_volume = stats.max_ponded_volume.max(ponded);
                }
            });

        self.links
            .par_iter_mut()
            .zip(project.links.par_iter())
            .for_each(|(stats, link)| {
                stats.steps += 1;
                let q = link.new_flow.abs();
                if q > stats.max_flow {
                    stats.max_flow = q;
                    stats.max_flow_date = Some(date);
                }
                let area = link.xsect.area_of_depth(link.new_depth);
                if area > crate::units::FUDGE {
                    stats.max_velocity = stats.max_velocity.max(q / area);
                }
                stats.max_depth = stats.max_depth.max(link.new_depth);
                stats.time_in_class[link.flow_class.index()] += tstep;
                let sign = if link.new_flow > crate::units::TINY {
                    1
                } else if link.new_flow < -crate::units::TINY {
                    -1
                } else {
                    0
                };
                if sign != 0 && stats.last_flow_sign != 0 && sign != stats.last_flow_sign {
                    stats.flow_turns += 1;
                }
                if sign != 0 {
                    stats.last_flow_sign = sign;
                }
            });

        // pump tables
        for (li, slot) in self.pumps.iter_mut().enumerate() {
            let Some(stats) = slot else { continue };
            let link = &project.links[li];
            let on = link.setting > 0.0 && link.new_flow > 0.0;
            if on {
                stats.utilization += tstep;
                stats.on_steps += 1;
                stats.flow_sum += link.new_flow;
                stats.max_flow = stats.max_flow.max(link.new_flow);
                stats.min_flow = if stats.on_steps == 1 {
                    link.new_flow
                } else {
                    stats.min_flow.min(link.new_flow)
                };
                stats.volume += link.new_flow * tstep;
                if let LinkKind::Pump(_) = &link.kind {
                    // energy at the crude water-power estimate: γQH/550 hp
                    let head = (project.nodes[link.node2].head()
                        - project.nodes[link.node1].head())
                    .max(0.0);
                    let hp = 62.4 * link.new_flow * head / 550.0;
                    stats.energy += hp * 0.7457 * tstep / 3600.0;
                }
            }
            if on && !stats.was_on {
                stats.start_ups += 1;
            }
            stats.was_on = on;
        }

        // storage tables
        for (ni, slot) in self.storages.iter_mut().enumerate() {
            let Some(stats) = slot else { continue };
            let node = &project.nodes[ni];
            stats.steps += 1;
            stats.volume_sum += node.new_volume;
            if node.new_volume > stats.max_volume {
                stats.max_volume = node.new_volume;
                stats.max_volume_date = Some(date);
            }
            if let NodeKind::Storage(s) = &node.kind {
                stats.evap_loss += s.evap_loss * tstep;
                stats.exfil_loss += s.seepage_loss * tstep;
            }
        }

        // outfall tables
        for (ni, slot) in self.outfalls.iter_mut().enumerate() {
            let Some(stats) = slot else { continue };
            let node = &project.nodes[ni];
            stats.steps += 1;
            if node.outflow > crate::units::TINY {
                stats.flow_steps += 1;
                stats.flow_sum += node.outflow;
                stats.max_flow = stats.max_flow.max(node.outflow);
                for (p, load) in stats.total_load.iter_mut().enumerate() {
                    *load += node.new_qual.get(p).copied().unwrap_or(0.0)
                        * node.outflow
                        * tstep
                        * L_PER_FT3;
                }
            }
        }
    }

    /// Record a Courant-limited step against the element that forced it.
    pub fn note_critical_link(&mut self, link: usize, tstep: f64) {
        if let Some(stats) = self.links.get_mut(link) {
            stats.time_courant_critical += tstep;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::Project;

    fn pump_project() -> Project {
        let json = r#"{
            "options": {
                "flow_units": "CFS",
                "route_model": "dynamic-wave",
                "start": "2024-06-01T00:00:00",
                "end": "2024-06-01T06:00:00"
            },
            "curves": [{
                "id": "PC1", "kind": "pump2",
                "points": [[0.0, 0.0], [2.0, 1.5], [6.0, 1.5]]
            }],
            "nodes": [
                {"id": "W1", "kind": "storage", "shape": "functional",
                 "coeff": 0.0, "expon": 0.0, "constant": 100.0,
                 "invert": 0.0, "full_depth": 10.0},
                {"id": "O1", "kind": "outfall", "boundary": "free", "invert": 0.0}
            ],
            "links": [{
                "id": "P1", "type": "pump", "kind": "depth", "curve": "PC1",
                "startup_depth": 4.0, "shutoff_depth": 2.0, "init_on": false,
                "from_node": "W1", "to_node": "O1"
            }]
        }"#;
        let mut p = Project::from_json(json).unwrap();
        for n in &mut p.nodes {
            n.initialize(0, None);
        }
        for l in &mut p.links {
            l.initialize(0);
        }
        p
    }

    #[test]
    fn pump_hysteresis_counts_one_startup_and_one_shutdown() {
        use crate::routing::{self, RoutingState};
        let mut p = pump_project();
        let mut state = RoutingState::new(&p).unwrap();
        let mut stats = Stats::new(&p);
        let date = p.options.start;
        let tstep = 10.0;
        // ramp the well up past startup, then let the pump empty it
        for step in 0..1000 {
            p.nodes[0].new_lat_flow = if step < 300 { 2.0 } else { 0.0 };
            routing::execute(&mut p, &mut state, tstep, 0.0).unwrap();
            stats.update(&p, tstep, date);
        }
        let pump = stats.pumps[0].as_ref().unwrap();
        assert_eq!(pump.start_ups, 1, "exactly one start-up");
        assert!(!pump.was_on, "pump shut down after the well drained");
        assert!(pump.utilization > 0.0);
        assert!(p.nodes[0].new_depth < 4.0);
    }

    #[test]
    fn flow_turn_counter_sees_sign_changes() {
        let p = pump_project();
        let mut stats = Stats::new(&p);
        let date = p.options.start;
        let mut project = p;
        project.links[0].new_flow = 1.0;
        stats.update(&project, 10.0, date);
        project.links[0].new_flow = -1.0;
        stats.update(&project, 10.0, date);
        project.links[0].new_flow = 1.0;
        stats.update(&project, 10.0, date);
        assert_eq!(stats.links[0].flow_turns, 2);
    }

    #[test]
    fn every_step_lands_in_exactly_one_flow_class() {
        let p = pump_project();
        let mut stats = Stats::new(&p);
        stats.update(&p, 10.0, p.options.start);
        let total: f64 = stats.links[0].time_in_class.iter().sum();
        assert!((total - 10.0).abs() < 1e-9);
    }
}
