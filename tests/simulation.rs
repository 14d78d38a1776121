//! End-to-end simulation scenarios
//!
//! Each test builds a small network, runs the full lifecycle through the
//! public API, and checks the outcome against a hand calculation with a
//! stated tolerance.

use approx::assert_relative_eq;
use stormflow::engine::{Engine, EngineState, ObjectKind};
use stormflow::project::Project;

fn temp_paths(tag: &str) -> (std::path::PathBuf, std::path::PathBuf) {
    let dir = std::env::temp_dir();
    (
        dir.join(format!("stormflow_{tag}.rpt")),
        dir.join(format!("stormflow_{tag}.out")),
    )
}

/// Two junctions and a rectangular conduit under steady 5 cfs inflow.
#[test]
fn steady_flow_screening_network() {
    let json = r#"{
        "options": {
            "flow_units": "CFS",
            "route_model": "steady",
            "start": "2024-06-01T00:00:00",
            "end": "2024-06-01T01:00:00",
            "route_step": 60.0
        },
        "external_inflows": [
            {"node": "J1", "kind": "flow", "baseline": 5.0}
        ],
        "nodes": [
            {"id": "J1", "kind": "junction", "invert": 100.4, "full_depth": 10.0},
            {"id": "O1", "kind": "outfall", "boundary": "free", "invert": 100.0}
        ],
        "links": [{
            "id": "C1", "type": "conduit", "from_node": "J1", "to_node": "O1",
            "length": 400.0, "roughness": 0.01,
            "shape": {"shape": "rect-open", "height": 4.0, "width": 2.0}
        }]
    }"#;
    let project = Project::from_json(json).unwrap();
    let (rpt, out) = temp_paths("steady");
    let mut engine = Engine::from_project(project, &rpt, &out);
    engine.start(false).unwrap();
    while engine.step().unwrap() > 0.0 {}

    // solving Manning's equation by hand for 5 cfs in this channel gives
    // normal depth 0.882 ft and velocity 2.84 ft/s
    let link = &engine.project().links[0];
    assert_relative_eq!(link.new_flow, 5.0, max_relative = 1e-6);
    assert_relative_eq!(link.new_depth, 0.882, epsilon = 0.01);
    let v = link.new_flow / link.xsect.area_of_depth(link.new_depth);
    assert_relative_eq!(v, 2.84, epsilon = 0.02);

    engine.end().unwrap();
    engine.report().unwrap();
    assert!(rpt.exists());
    std::fs::remove_file(&rpt).ok();
}

/// A bioretention cell takes a one-hour pulse; the drain discharges a
/// bounded share and the unit's water balance closes.
#[test]
fn bioretention_cell_pulse() {
    let json = r#"{
        "options": {
            "flow_units": "CFS",
            "route_model": "kinematic-wave",
            "start": "2024-06-01T00:00:00",
            "end": "2024-06-01T08:00:00",
            "wet_step": 300.0,
            "dry_step": 300.0,
            "route_step": 30.0
        },
        "gages": [{
            "id": "G1", "source": "series", "series": "PULSE",
            "format": "intensity", "interval": 3600.0
        }],
        "series": [{
            "id": "PULSE",
            "points": [
                {"time": "2024-06-01T00:00:00", "value": 1.0},
                {"time": "2024-06-01T01:00:00", "value": 0.0}
            ]
        }],
        "lid_processes": [{
            "id": "BC", "kind": "bio-cell",
            "surface": {"thickness": 6.0, "void_frac": 1.0,
                        "roughness": 0.1, "slope": 0.01},
            "soil": {"thickness": 12.0, "porosity": 0.5,
                     "field_capacity": 0.2, "wilt_point": 0.1,
                     "ksat": 0.5, "k_slope": 10.0, "suction": 3.5},
            "storage": {"thickness": 12.0, "void_frac": 0.75, "ksat": 0.5},
            "drain": {"coeff": 0.5, "expon": 0.5, "offset": 0.0}
        }],
        "subcatchments": [{
            "id": "S1", "gage": "G1", "outlet": "J1",
            "area": 0.05, "width": 50.0, "slope": 0.01,
            "frac_imperv": 0.8, "n_imperv": 0.012, "n_perv": 0.1,
            "dstore_imperv": 0.05, "dstore_perv": 0.1,
            "pct_zero_storage": 0.25,
            "infiltration": {
                "model": "horton",
                "max_rate": 3.0, "min_rate": 0.5,
                "decay": 4.0, "dry_time": 7.0
            },
            "lid_units": [{
                "process": "BC", "number": 1, "area": 50.0,
                "full_width": 10.0, "from_imperv": 0.5,
                "drain_to": {"kind": "node", "name": "J1"}
            }]
        }],
        "nodes": [
            {"id": "J1", "kind": "junction", "invert": 100.0, "full_depth": 8.0},
            {"id": "O1", "kind": "outfall", "boundary": "free", "invert": 99.5}
        ],
        "links": [{
            "id": "C1", "type": "conduit", "from_node": "J1", "to_node": "O1",
            "length": 200.0, "roughness": 0.013,
            "shape": {"shape": "circular", "diameter": 1.5}
        }]
    }"#;
    let project = Project::from_json(json).unwrap();
    let (rpt, out) = temp_paths("biocell");
    let mut engine = Engine::from_project(project, &rpt, &out);
    engine.start(false).unwrap();
    while engine.step().unwrap() > 0.0 {}
    engine.end().unwrap();

    let unit = &engine.project().subcatchments[0].lid_units[0];
    let proc = &engine.project().lid_processes[0];
    assert!(unit.totals.inflow > 0.0, "the cell saw the storm");
    let residual = unit.totals.residual(unit.stored_volume(proc));
    assert!(
        residual.abs() < 1e-3,
        "LID water balance residual {residual}"
    );
    // the drain passes some but not all of the inflow
    assert!(unit.totals.drain_outflow > 0.0);
    assert!(unit.totals.drain_outflow < unit.totals.inflow);
}

/// A CSTR storage node fed at constant concentration reaches the inflow
/// concentration and its cumulative outfall load closes against what
/// came in.
#[test]
fn cstr_load_closure() {
    let json = r#"{
        "options": {
            "flow_units": "CFS",
            "route_model": "kinematic-wave",
            "start": "2024-06-01T00:00:00",
            "end": "2024-06-02T00:00:00",
            "route_step": 60.0,
            "wet_step": 300.0,
            "dry_step": 300.0
        },
        "pollutants": [{"id": "TSS", "units": "mg-per-l"}],
        "external_inflows": [
            {"node": "SU1", "kind": "flow", "baseline": 100.0},
            {"node": "SU1", "kind": "concentration", "pollutant": "TSS",
             "baseline": 10.0}
        ],
        "nodes": [
            {"id": "SU1", "kind": "storage", "shape": "functional",
             "coeff": 0.0, "expon": 0.0, "constant": 5000.0,
             "invert": 0.0, "full_depth": 20.0, "init_depth": 2.0},
            {"id": "O1", "kind": "outfall", "boundary": "free", "invert": -1.0}
        ],
        "links": [{
            "id": "W1", "type": "weir", "kind": "transverse", "coeff": 3.3,
            "from_node": "SU1", "to_node": "O1", "offset1": 2.0,
            "shape": {"shape": "rect-open", "height": 3.0, "width": 10.0}
        }]
    }"#;
    let project = Project::from_json(json).unwrap();
    let (rpt, out) = temp_paths("cstr");
    let mut engine = Engine::from_project(project, &rpt, &out);
    engine.start(false).unwrap();
    while engine.step().unwrap() > 0.0 {}

    // after a day at 100 cfs through a 5000 ft² tank, many residence
    // times have passed: the mixed concentration matches the inflow
    let node = &engine.project().nodes[0];
    assert_relative_eq!(node.new_qual[0], 10.0, max_relative = 0.02);

    engine.end().unwrap();
    let mb = engine.mass_balance().unwrap();
    let q = &mb.quality[0];
    let closure = (q.lateral_inflow + q.init_stored
        - q.outflow_load
        - q.final_stored
        - q.reacted)
        .abs();
    assert!(
        closure / q.lateral_inflow < 0.01,
        "pollutant closure residual {}",
        closure / q.lateral_inflow
    );
}

/// Cyclic treatment expressions are rejected before any stepping.
#[test]
fn cyclic_treatment_is_rejected() {
    let json = r#"{
        "options": {
            "flow_units": "CFS",
            "start": "2024-06-01T00:00:00",
            "end": "2024-06-01T06:00:00"
        },
        "pollutants": [
            {"id": "TSS", "units": "mg-per-l"},
            {"id": "Lead", "units": "ug-per-l"}
        ],
        "treatments": [
            {"node": "SU1", "pollutant": "TSS", "kind": "removal",
             "expr": "0.5 * R_Lead"},
            {"node": "SU1", "pollutant": "Lead", "kind": "removal",
             "expr": "0.2 * R_TSS"}
        ],
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
    let err = Project::from_json(json).unwrap_err();
    assert_eq!(err.code(), 161, "cyclic treatment must be error 161");
}

/// Dynamic wave on a two-conduit line: flow reaches the outfall, the
/// network drains afterwards, and continuity closes.
#[test]
fn dynamic_wave_fills_and_drains() {
    let json = r#"{
        "options": {
            "flow_units": "CFS",
            "route_model": "dynamic-wave",
            "start": "2024-06-01T00:00:00",
            "end": "2024-06-01T04:00:00",
            "route_step": 10.0,
            "variable_step": 0.75,
            "min_route_step": 0.5,
            "max_trials": 8,
            "head_tol": 0.005
        },
        "external_inflows": [
            {"node": "J1", "kind": "flow", "baseline": 8.0,
             "series": "HYDRO", "scale": 1.0}
        ],
        "series": [{
            "id": "HYDRO",
            "points": [
                {"time": "2024-06-01T00:00:00", "value": 0.0},
                {"time": "2024-06-01T01:00:00", "value": 0.0},
                {"time": "2024-06-01T01:30:00", "value": -8.0},
                {"time": "2024-06-01T04:00:00", "value": -8.0}
            ]
        }],
        "nodes": [
            {"id": "J1", "kind": "junction", "invert": 100.8, "full_depth": 12.0},
            {"id": "J2", "kind": "junction", "invert": 100.4, "full_depth": 12.0},
            {"id": "O1", "kind": "outfall", "boundary": "free", "invert": 100.0}
        ],
        "links": [
            {"id": "C1", "type": "conduit", "from_node": "J1", "to_node": "J2",
             "length": 400.0, "roughness": 0.015,
             "shape": {"shape": "circular", "diameter": 3.0}},
            {"id": "C2", "type": "conduit", "from_node": "J2", "to_node": "O1",
             "length": 400.0, "roughness": 0.015,
             "shape": {"shape": "circular", "diameter": 3.0}}
        ]
    }"#;
    let project = Project::from_json(json).unwrap();
    let (rpt, out) = temp_paths("dynwave");
    let mut engine = Engine::from_project(project, &rpt, &out);
    engine.start(false).unwrap();
    while engine.step().unwrap() > 0.0 {}
    assert_eq!(engine.state(), EngineState::Ended);

    let stats = engine.statistics().unwrap();
    assert!(stats.links[1].max_flow > 6.0, "flow reached the outfall");
    engine.end().unwrap();
    let mb = engine.mass_balance().unwrap();
    assert!(
        mb.routing.pct_error().abs() < 2.0,
        "dynamic wave continuity error {}",
        mb.routing.pct_error()
    );
}

/// Control rules drive a gate from the wet-well depth.
#[test]
fn control_rule_closes_an_orifice() {
    let json = r#"{
        "options": {
            "flow_units": "CFS",
            "route_model": "dynamic-wave",
            "start": "2024-06-01T00:00:00",
            "end": "2024-06-01T02:00:00",
            "route_step": 10.0
        },
        "external_inflows": [
            {"node": "SU1", "kind": "flow", "baseline": 10.0}
        ],
        "controls": [{
            "id": "GATE1",
            "premises": [
                {"var": "node-depth", "node": "SU1", "op": "gt", "value": 6.0}
            ],
            "then": [{"action": "set-link-setting", "link": "R1", "value": 0.0}],
            "else": [{"action": "set-link-setting", "link": "R1", "value": 1.0}],
            "priority": 1.0
        }],
        "nodes": [
            {"id": "SU1", "kind": "storage", "shape": "functional",
             "coeff": 0.0, "expon": 0.0, "constant": 500.0,
             "invert": 0.0, "full_depth": 12.0},
            {"id": "O1", "kind": "outfall", "boundary": "free", "invert": -1.0}
        ],
        "links": [{
            "id": "R1", "type": "orifice", "kind": "side", "coeff": 0.65,
            "from_node": "SU1", "to_node": "O1",
            "shape": {"shape": "circular", "diameter": 1.0}
        }]
    }"#;
    let project = Project::from_json(json).unwrap();
    let (rpt, out) = temp_paths("controls");
    let mut engine = Engine::from_project(project, &rpt, &out);
    engine.start(false).unwrap();
    while engine.step().unwrap() > 0.0 {}
    // 10 cfs into 500 ft² raises the well past 6 ft within the run, at
    // which point the rule has shut the gate
    let depth = engine.project().nodes[0].new_depth;
    assert!(depth > 6.0, "well depth {depth}");
    assert_eq!(engine.project().links[0].setting, 0.0);
}

/// Outfall stage and node inflow overrides persist between steps.
#[test]
fn api_overrides_persist() {
    let json = r#"{
        "options": {
            "flow_units": "CFS",
            "route_model": "dynamic-wave",
            "start": "2024-06-01T00:00:00",
            "end": "2024-06-01T01:00:00",
            "route_step": 30.0
        },
        "nodes": [
            {"id": "J1", "kind": "junction", "invert": 100.0, "full_depth": 10.0},
            {"id": "O1", "kind": "outfall", "boundary": "free", "invert": 99.0}
        ],
        "links": [{
            "id": "C1", "type": "conduit", "from_node": "J1", "to_node": "O1",
            "length": 300.0, "roughness": 0.013,
            "shape": {"shape": "circular", "diameter": 2.0}
        }]
    }"#;
    let project = Project::from_json(json).unwrap();
    let (rpt, out) = temp_paths("api");
    let mut engine = Engine::from_project(project, &rpt, &out);
    engine.start(false).unwrap();
    let o1 = engine.index_of(ObjectKind::Node, "O1").unwrap();
    let j1 = engine.index_of(ObjectKind::Node, "J1").unwrap();
    engine.set_outfall_stage(o1, 100.5).unwrap();
    engine.set_node_inflow(j1, 3.0).unwrap();
    for _ in 0..20 {
        engine.step().unwrap();
    }
    // the boundary honored the override: outfall depth = stage - invert
    let depth = engine.project().nodes[o1].new_depth;
    assert_relative_eq!(depth, 1.5, max_relative = 1e-6);
    // and the injected inflow is moving water
    assert!(engine.project().nodes[j1].new_lat_flow > 2.9);
}
