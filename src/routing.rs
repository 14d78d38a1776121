//! Flow routing kernels
//!
//! All kernels share one contract per routing step: refresh node lateral
//! inflows, compute link flows, apply the node continuity update, and
//! tag conduits with a flow class. The steady kernel translates inflows
//! instantly down the topological order; the kinematic kernels route
//! each conduit as a nonlinear reservoir in topological order, the
//! extended variant admitting backflow under an adverse head gradient.
//! The dynamic-wave kernel lives in [`crate::dynwave`].

use crate::error::Result;
use crate::link::{FlowClass, LinkKind};
use crate::node::{diverted_flow, NodeKind};
use crate::project::{Project, RouteModel};
use crate::table::Curve;
use log::warn;

/// Mutable per-run routing scratch shared by the kernels.
#[derive(Debug, Clone, Default)]
pub struct RoutingState {
    /// links in topological order (steady / kinematic)
    pub topo_links: Vec<usize>,
    /// nodes in topological order
    pub topo_nodes: Vec<usize>,
    /// iterations used by the last dynamic-wave step
    pub trials: usize,
    /// whether the last step converged
    pub converged: bool,
    /// count of steps that failed to converge
    pub non_converged_steps: usize,
    /// dynamic-wave scratch owned by the solver
    pub dyn_state: crate::dynwave::DynState,
}

impl RoutingState {
    pub fn new(project: &Project) -> Result<Self> {
        let mut state = RoutingState::default();
        if !matches!(project.options.route_model, RouteModel::DynamicWave) {
            state.topo_links = project.topo_order()?;
            state.topo_nodes = topo_nodes(project);
        }
        state.dyn_state = crate::dynwave::DynState::new(project);
        state.converged = true;
        Ok(state)
    }
}

/// Nodes ordered so every node appears after all its upstream nodes.
fn topo_nodes(project: &Project) -> Vec<usize> {
    let mut indeg: Vec<usize> = project.nodes.iter().map(|n| n.in_links.len()).collect();
    let mut ready: Vec<usize> = (0..project.nodes.len())
        .filter(|&i| indeg[i] == 0)
        .collect();
    let mut order = Vec::with_capacity(project.nodes.len());
    while let Some(ni) = ready.pop() {
        order.push(ni);
        for &li in &project.nodes[ni].out_links {
            let dn = project.links[li].node2;
            indeg[dn] -= 1;
            if indeg[dn] == 0 {
                ready.push(dn);
            }
        }
    }
    order
}

/// Execute one routing step of length `tstep` seconds. `evap_rate` is
/// the potential evaporation drawn from exposed storage surfaces, ft/s.
pub fn execute(
    project: &mut Project,
    state: &mut RoutingState,
    tstep: f64,
    evap_rate: f64,
) -> Result<f64> {
    // move last step's state into the "old" slots
    for n in &mut project.nodes {
        n.advance();
        n.inflow = 0.0;
        n.outflow = 0.0;
        n.overflow = 0.0;
        n.losses = 0.0;
    }
    for l in &mut project.links {
        l.advance();
    }

    let used = match project.options.route_model {
        RouteModel::None => {
            no_routing(project);
            tstep
        }
        RouteModel::Steady => {
            steady_step(project, state, tstep);
            tstep
        }
        RouteModel::KinematicWave => {
            kinematic_step(project, state, tstep, false, evap_rate);
            tstep
        }
        RouteModel::ExtendedKinematicWave => {
            kinematic_step(project, state, tstep, true, evap_rate);
            tstep
        }
        RouteModel::DynamicWave => crate::dynwave::step(project, state, tstep, evap_rate)?,
    };
    if !state.converged {
        state.non_converged_steps += 1;
        warn!(
            "dynamic wave failed to converge in {} trials; keeping last depths",
            state.trials
        );
    }
    Ok(used)
}

/// With routing disabled, lateral inflows leave the system at once.
fn no_routing(project: &mut Project) {
    for n in &mut project.nodes {
        n.inflow = n.new_lat_flow;
        n.outflow = n.new_lat_flow;
        n.new_depth = 0.0;
        n.new_volume = 0.0;
    }
    for l in &mut project.links {
        l.new_flow = 0.0;
        l.flow_class = FlowClass::Dry;
    }
}

/// Look up a node's storage curve, if any.
pub fn storage_curve<'a>(project: &'a Project, node: usize) -> Option<&'a Curve> {
    match &project.nodes[node].kind {
        NodeKind::Storage(s) => s.curve_index.map(|i| &project.curves[i]),
        _ => None,
    }
}

/// Split a node's outflow among its outgoing links. Dividers follow
/// their rule; other nodes send everything down their only outlet.
fn apportion_outflow(project: &mut Project, ni: usize, available: f64, tstep: f64) {
    let out_links = project.nodes[ni].out_links.clone();
    if out_links.is_empty() || available <= 0.0 {
        for &li in &out_links {
            project.links[li].new_flow = 0.0;
        }
        return;
    }
    match project.nodes[ni].kind.clone() {
        NodeKind::Divider(dv) => {
            let diverted_link = dv.link_index.unwrap_or(out_links[0]);
            let other: usize = *out_links
                .iter()
                .find(|&&l| l != diverted_link)
                .unwrap_or(&out_links[0]);
            let curve = dv.curve_index.map(|i| project.curves[i].clone());
            let full_flow = match &project.links[other].kind {
                LinkKind::Conduit(c) => c.qfull,
                _ => f64::MAX,
            };
            let qd = diverted_flow(&dv.rule, available, curve.as_ref(), full_flow);
            set_link_flow(project, diverted_link, qd, tstep);
            set_link_flow(project, other, available - qd, tstep);
        }
        _ => {
            let li = out_links[0];
            set_link_flow(project, li, available, tstep);
            for &extra in out_links.iter().skip(1) {
                project.links[extra].new_flow = 0.0;
            }
        }
    }
}

/// Give a link its steady/kinematic flow, honoring regulator relations
/// and the flow limit, and set depth and volume to match.
fn set_link_flow(project: &mut Project, li: usize, inflow: f64, tstep: f64) {
    let n1 = project.links[li].node1;
    let depth1 = project.nodes[n1].new_depth;
    let head1 = project.nodes[n1].head();
    let n2 = project.links[li].node2;
    let head2 = project.nodes[n2].head();
    let link = &project.links[li];
    let mut q = match &link.kind {
        LinkKind::Conduit(_) => inflow,
        LinkKind::Pump(p) => {
            let curve = p.curve_index.map(|i| &project.curves[i]);
            let driver = match p.kind {
                crate::link::PumpKind::Volume => project.nodes[n1].new_volume,
                crate::link::PumpKind::Head => (head2 - head1).max(0.0),
                _ => depth1,
            };
            project.links[li].pump_flow(driver, inflow, curve)
        }
        LinkKind::Orifice(_) => {
            let crest = project.nodes[n1].invert + link.offset1;
            link.orifice_flow((head1 - crest).max(0.0), (head2 - crest).max(0.0))
        }
        LinkKind::Weir(w) => {
            let crest = project.nodes[n1].invert + link.offset1;
            let curve = w.curve_index.map(|i| &project.curves[i]);
            link.weir_flow((head1 - crest).max(0.0), curve)
        }
        LinkKind::Outlet(o) => {
            let crest = project.nodes[n1].invert + link.offset1;
            let curve = o.curve_index.map(|i| &project.curves[i]);
            let head = if o.head_is_difference {
                head1 - head2
            } else {
                head1 - crest
            };
            link.outlet_flow(head.max(0.0), curve)
        }
    };
    let link = &mut project.links[li];
    if link.max_flow > 0.0 {
        q = q.min(link.max_flow);
    }
    link.new_flow = q;
    let _ = tstep;
}

/// 4.I.1 — steady flow: every link instantly carries the sum of its
/// upstream lateral inflows; conduits take normal depth.
fn steady_step(project: &mut Project, state: &mut RoutingState, tstep: f64) {
    let order = state.topo_nodes.clone();
    for &ni in &order {
        // total inflow: lateral plus all routed upstream links
        let lat = project.nodes[ni].new_lat_flow;
        let upstream: f64 = project.nodes[ni]
            .in_links
            .iter()
            .map(|&li| project.links[li].new_flow.max(0.0))
            .sum();
        let inflow = (lat + upstream).max(0.0);
        project.nodes[ni].inflow = inflow;
        project.nodes[ni].outflow = inflow;
        if !project.nodes[ni].is_outfall() {
            apportion_outflow(project, ni, inflow, tstep);
        }
        project.nodes[ni].new_depth = 0.0;
        project.nodes[ni].new_volume = 0.0;
    }
    // conduit depths at normal flow
    for li in 0..project.links.len() {
        let q = project.links[li].new_flow;
        if project.links[li].is_conduit() {
            let depth = project.links[li].normal_depth(q);
            let link = &mut project.links[li];
            link.new_depth = depth;
            let area = link.xsect.area_of_depth(depth);
            if let LinkKind::Conduit(c) = &link.kind {
                link.new_volume = area * c.length * c.barrels as f64;
            }
            link.flow_class = classify_simple(q, depth, link.xsect.yfull);
        }
    }
}

/// 4.I.2 — kinematic wave: conduits behave as nonlinear reservoirs
/// emptied at Manning's normal flow, processed in topological order.
/// The extended variant lets an adverse head gradient push flow back.
fn kinematic_step(
    project: &mut Project,
    state: &mut RoutingState,
    tstep: f64,
    extended: bool,
    evap_rate: f64,
) {
    let node_order = state.topo_nodes.clone();
    for &ni in &node_order {
        let lat = project.nodes[ni].new_lat_flow;
        let upstream: f64 = project.nodes[ni]
            .in_links
            .iter()
            .map(|&li| project.links[li].new_flow.max(0.0))
            .sum();
        let inflow = lat + upstream;
        project.nodes[ni].inflow = inflow;

        match project.nodes[ni].kind.clone() {
            NodeKind::Outfall(_) => {
                project.nodes[ni].outflow = inflow;
                project.nodes[ni].new_depth = 0.0;
                project.nodes[ni].new_volume = 0.0;
            }
            NodeKind::Storage(st) => {
                // storage continuity with losses, then the outlet links
                let curve = st.curve_index.map(|i| project.curves[i].clone());
                let node = &project.nodes[ni];
                let v1 = node.old_volume;
                let area = node.surface_area(node.old_depth, curve.as_ref()).max(0.0);
                let evap = st.evap_frac * evap_rate * area;
                let seep = if node.old_depth > 0.0 { st.seepage * area } else { 0.0 };
                let losses = evap + seep;
                // outflow demanded by the outlet links at the old head
                let mut v2 = v1 + (inflow - losses) * tstep;
                apportion_outflow(project, ni, (v2 / tstep).max(0.0), tstep);
                let q_out: f64 = project.nodes[ni]
                    .out_links
                    .iter()
                    .map(|&li| project.links[li].new_flow.max(0.0))
                    .sum();
                v2 = (v2 - q_out * tstep).max(0.0);
                let node = &mut project.nodes[ni];
                node.losses = losses;
                node.outflow = q_out;
                node.new_volume = v2;
                node.new_depth = node.depth_of_volume(v2, curve.as_ref());
                let flood = node.flood_depth();
                if node.new_depth >= flood && flood > 0.0 {
                    let over_vol = v2 - node.volume(flood, curve.as_ref());
                    if over_vol > 0.0 {
                        node.overflow = over_vol / tstep;
                        node.new_volume = v2 - over_vol;
                        node.new_depth = flood;
                    }
                }
            }
            _ => {
                // junctions and dividers pass flow through; what the
                // outlet conduits cannot accept floods or ponds
                apportion_outflow(project, ni, inflow, tstep);
                let q_out: f64 = project.nodes[ni]
                    .out_links
                    .iter()
                    .map(|&li| project.links[li].new_flow.max(0.0))
                    .sum();
                let node = &mut project.nodes[ni];
                node.outflow = q_out;
                let excess = inflow - q_out;
                if node.ponded_area > 0.0 {
                    let v2 = (node.old_volume + excess * tstep).max(0.0);
                    node.new_volume = v2;
                    node.new_depth = if v2 > 0.0 {
                        node.full_depth + v2 / node.ponded_area
                    } else {
                        0.0
                    };
                } else {
                    if excess > 1e-9 {
                        node.overflow = excess;
                    }
                    node.new_volume = 0.0;
                    node.new_depth = 0.0;
                }
            }
        }

        // now route each outgoing conduit as a reservoir
        let out_links = project.nodes[ni].out_links.clone();
        for li in out_links {
            if project.links[li].is_conduit() {
                route_conduit_kinematic(project, li, tstep, extended);
            }
        }
    }
}

/// Advance one conduit with an implicit nonlinear-reservoir update:
/// `V2 = V1 + (Qin − Q(V2))·dt`, with `Q(V)` Manning's normal flow at
/// the average flow area.
fn route_conduit_kinematic(project: &mut Project, li: usize, tstep: f64, extended: bool) {
    let qin = project.links[li].new_flow.max(0.0); // set by apportion
    let (length, barrels) = match &project.links[li].kind {
        LinkKind::Conduit(c) => (c.length, c.barrels as f64),
        _ => return,
    };
    let v1 = project.links[li].old_volume;
    let link = &project.links[li];
    // fixed-point iteration on the outflow
    let mut qout = link.old_flow.max(0.0);
    for _ in 0..8 {
        let v_trial = (v1 + (qin - qout) * tstep).max(0.0);
        let area = v_trial / (length * barrels);
        let depth = link.xsect.depth_of_area(area);
        let q_normal = link.normal_flow(depth) * barrels;
        let next = 0.5 * (qout + q_normal);
        if (next - qout).abs() < 1e-6 {
            qout = next;
            break;
        }
        qout = next;
    }
    // the conduit cannot release more than it holds, and the stored
    // volume must agree with the final outflow
    qout = qout.min(v1 / tstep + qin);
    let v2 = (v1 + (qin - qout) * tstep).max(0.0);

    let mut reverse = 0.0;
    if extended {
        let h1 = project.nodes[project.links[li].node1].head();
        let h2 = project.nodes[project.links[li].node2].head();
        if h2 > h1 {
            // downstream head exceeds upstream: back up at a rate set by
            // the head difference over the conduit length
            let dh = h2 - h1;
            let area = project.links[li].xsect.area_of_depth(dh.min(project.links[li].xsect.yfull));
            reverse = (crate::units::GRAVITY * dh / length).sqrt() * area;
            qout = 0.0;
        }
    }

    let link = &mut project.links[li];
    link.new_flow = if reverse > 0.0 { -reverse } else { qout };
    link.new_volume = v2;
    let area = v2 / (length * barrels);
    let depth = link.xsect.depth_of_area(area);
    link.new_depth = depth;
    link.flow_class = classify_simple(link.new_flow, depth, link.xsect.yfull);
}

/// Minimal flow classification for the non-dynamic kernels.
fn classify_simple(flow: f64, depth: f64, yfull: f64) -> FlowClass {
    if flow.abs() < crate::units::TINY && depth < crate::units::FUDGE {
        FlowClass::Dry
    } else if yfull > 0.0 && depth >= yfull * 0.999 {
        FlowClass::AllFull
    } else {
        FlowClass::Subcritical
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn two_junction_project(route_model: &str) -> Project {
        let json = format!(
            r#"{{
            "options": {{
                "flow_units": "CFS",
                "route_model": "{route_model}",
                "start": "2024-06-01T00:00:00",
                "end": "2024-06-01T06:00:00"
            }},
            "nodes": [
                {{"id": "J1", "kind": "junction", "invert": 100.4, "full_depth": 10.0}},
                {{"id": "J2", "kind": "junction", "invert": 100.0, "full_depth": 10.0}},
                {{"id": "O1", "kind": "outfall", "boundary": "free", "invert": 99.6}}
            ],
            "links": [
                {{"id": "C1", "type": "conduit", "from_node": "J1", "to_node": "J2",
                 "length": 400.0, "roughness": 0.01,
                 "shape": {{"shape": "rect-open", "height": 4.0, "width": 2.0}}}},
                {{"id": "C2", "type": "conduit", "from_node": "J2", "to_node": "O1",
                 "length": 400.0, "roughness": 0.01,
                 "shape": {{"shape": "rect-open", "height": 4.0, "width": 2.0}}}}
            ]
        }}"#
        );
        let mut p = Project::from_json(&json).unwrap();
        for n in &mut p.nodes {
            n.initialize(0, None);
        }
        for l in &mut p.links {
            l.initialize(0);
        }
        p
    }

    #[test]
    fn steady_flow_translates_inflow_to_normal_depth() {
        let mut p = two_junction_project("steady");
        let mut state = RoutingState::new(&p).unwrap();
        p.nodes[0].new_lat_flow = 5.0;
        execute(&mut p, &mut state, 20.0, 0.0).unwrap();
        assert_relative_eq!(p.links[0].new_flow, 5.0);
        assert_relative_eq!(p.links[1].new_flow, 5.0);
        // hand-solved Manning normal depth for 5 cfs
        assert_relative_eq!(p.links[0].new_depth, 0.882, epsilon = 0.01);
        assert_relative_eq!(p.nodes[2].outflow, 5.0);
    }

    #[test]
    fn kinematic_wave_conserves_volume() {
        let mut p = two_junction_project("kinematic-wave");
        let mut state = RoutingState::new(&p).unwrap();
        let tstep = 20.0;
        let mut inflow_vol = 0.0;
        let mut outflow_vol = 0.0;
        // an hour of steady inflow, then an hour of drain-down
        for step in 0..360 {
            let q = if step < 180 { 5.0 } else { 0.0 };
            p.nodes[0].new_lat_flow = q;
            execute(&mut p, &mut state, tstep, 0.0).unwrap();
            inflow_vol += q * tstep;
            outflow_vol += p.nodes[2].outflow * tstep;
        }
        let stored: f64 = p.links.iter().map(|l| l.new_volume).sum();
        assert_relative_eq!(
            inflow_vol,
            outflow_vol + stored,
            max_relative = 0.01
        );
        assert!(outflow_vol > 0.9 * inflow_vol);
    }

    #[test]
    fn kinematic_outflow_lags_and_attenuates() {
        let mut p = two_junction_project("kinematic-wave");
        let mut state = RoutingState::new(&p).unwrap();
        p.nodes[0].new_lat_flow = 5.0;
        execute(&mut p, &mut state, 20.0, 0.0).unwrap();
        // on the first step the wave has not yet reached the outfall
        assert!(p.nodes[2].outflow < 5.0);
    }

    #[test]
    fn every_step_tags_each_conduit_with_one_class() {
        let mut p = two_junction_project("kinematic-wave");
        let mut state = RoutingState::new(&p).unwrap();
        for step in 0..50 {
            p.nodes[0].new_lat_flow = if step < 25 { 3.0 } else { 0.0 };
            execute(&mut p, &mut state, 20.0, 0.0).unwrap();
            for l in &p.links {
                assert!(FlowClass::ALL.contains(&l.flow_class));
            }
        }
    }
}
