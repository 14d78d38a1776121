//! Runtime controller
//!
//! The [`Engine`] owns the project and walks the lifecycle
//! `Opened → Started → Ended`, advancing the coupled hydrologic and
//! hydraulic state one routing step at a time. Between steps the live
//! get/set API may override gage rainfall, link settings, outfall
//! stages, and node inflows; every call is legal only in the states its
//! contract names and fails with an API-band error otherwise.
//!
//! Per step the sequence is fixed: gages → subcatchments (→ LID units)
//! → node lateral inflows → control rules → routing → quality → mass
//! balance → statistics → results sink.

use crate::error::{EngineError, Result};
use crate::massbal::MassBalance;
use crate::output::{OutputWriter, SystemResults};
use crate::project::Project;
use crate::quality::QualityEngine;
use crate::routing::{self, RoutingState};
use crate::snow::SubcatchSnow;
use crate::stats::Stats;
use crate::subcatch::OutletRef;
use crate::units::Quantity;
use chrono::{Duration, NaiveDateTime};
use log::info;
use std::path::{Path, PathBuf};

/// Object kinds addressable through the introspection API. The
/// discriminants match the classic engine's object-type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ObjectKind {
    Gage = 0,
    Subcatchment = 1,
    Node = 2,
    Link = 3,
    Pollutant = 4,
    LidProcess = 5,
}

/// Lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Opened,
    Started,
    Ended,
}

/// Node properties exposed through get/set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeProperty {
    Invert,
    FullDepth,
    SurchargeDepth,
    PondedArea,
    InitDepth,
    Depth,
    Head,
    Volume,
    LateralInflow,
    TotalInflow,
    Overflow,
}

/// Link properties exposed through get/set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkProperty {
    Offset1,
    Offset2,
    InitFlow,
    FlowLimit,
    Flow,
    Depth,
    Velocity,
    Volume,
    Setting,
    TargetSetting,
}

/// Subcatchment properties exposed through get/set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubcatchProperty {
    Area,
    Width,
    Slope,
    FracImperv,
    Rainfall,
    Evaporation,
    Infiltration,
    Runoff,
}

/// Per-run state owned by the controller, dropped at `end`.
struct Runtime {
    routing: RoutingState,
    quality: QualityEngine,
    massbal: MassBalance,
    stats: Stats,
    snow: Vec<Option<SubcatchSnow>>,
    output: Option<OutputWriter>,
    /// total horizon, ms
    total_ms: f64,
    /// elapsed routing time, ms
    routing_ms: f64,
    /// hydrology has been computed up to here, ms
    runoff_ms: f64,
    /// next reporting instant, ms
    report_ms: f64,
    /// next rule evaluation instant, ms
    rule_ms: f64,
    /// runoff queued for each node by the hydrology layer, cfs
    runoff_inflow: Vec<f64>,
    gw_inflow: Vec<f64>,
    rdii_inflow: Vec<f64>,
    /// this step's dry-weather and external inflow totals, cfs
    dwf_flow: f64,
    ext_flow: f64,
    /// accumulated system results between reports
    system: SystemResults,
}

/// The engine: project plus lifecycle and run state.
pub struct Engine {
    project: Project,
    report_path: PathBuf,
    out_path: PathBuf,
    state: EngineState,
    runtime: Option<Runtime>,
    /// totals preserved after `end` for `report`
    final_massbal: Option<MassBalance>,
    final_stats: Option<Stats>,
    last_error: i32,
}

impl Engine {
    /// Open a project file together with its report and results paths.
    pub fn open(
        inp: impl AsRef<Path>,
        rpt: impl AsRef<Path>,
        out: impl AsRef<Path>,
    ) -> Result<Engine> {
        let project = Project::from_file(inp.as_ref())?;
        project.warn_unused();
        Ok(Engine {
            project,
            report_path: rpt.as_ref().to_path_buf(),
            out_path: out.as_ref().to_path_buf(),
            state: EngineState::Opened,
            runtime: None,
            final_massbal: None,
            final_stats: None,
            last_error: 0,
        })
    }

    /// Open from an already materialized project (used by embedders and
    /// tests; the text parser collaborator produces the same store).
    pub fn from_project(
        project: Project,
        rpt: impl AsRef<Path>,
        out: impl AsRef<Path>,
    ) -> Engine {
        Engine {
            project,
            report_path: rpt.as_ref().to_path_buf(),
            out_path: out.as_ref().to_path_buf(),
            state: EngineState::Opened,
            runtime: None,
            final_massbal: None,
            final_stats: None,
            last_error: 0,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    pub fn last_error_code(&self) -> i32 {
        self.last_error
    }

    fn record<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(ref e) = result {
            self.last_error = e.code();
        }
        result
    }

    /// Begin a simulation run.
    pub fn start(&mut self, save_results: bool) -> Result<()> {
        let r = self.start_inner(save_results);
        self.record(r)
    }

    fn start_inner(&mut self, save_results: bool) -> Result<()> {
        if self.state == EngineState::Started {
            return Err(EngineError::ApiSimRunning);
        }
        // size the worker pool for the dynamic-wave parallel loops; the
        // global pool can only be built once per process, so later runs
        // keep the first size
        if self.project.options.num_threads > 0 {
            let _ = rayon::ThreadPoolBuilder::new()
                .num_threads(self.project.options.num_threads)
                .build_global();
        }
        let npollut = self.project.npollut();

        for si in 0..self.project.subcatchments.len() {
            self.project.subcatchments[si].initialize(npollut);
            let ids: Vec<usize> = (0..self.project.subcatchments[si].lid_units.len()).collect();
            for ui in ids {
                let pi = self.project.subcatchments[si].lid_units[ui].process_index;
                let proc = self.project.lid_processes[pi].clone();
                self.project.subcatchments[si].lid_units[ui].initialize(&proc);
            }
        }
        for ni in 0..self.project.nodes.len() {
            let curve = routing::storage_curve(&self.project, ni).cloned();
            self.project.nodes[ni].initialize(npollut, curve.as_ref());
        }
        for l in &mut self.project.links {
            l.initialize(npollut);
        }
        for gi in 0..self.project.groundwater.len() {
            let aq = self.project.groundwater[gi].aquifer_index;
            let aq = self.project.aquifers[aq].clone();
            self.project.groundwater[gi].initialize(&aq);
        }
        let tstep = self.project.options.route_step;
        for ri in 0..self.project.rdii_inflows.len() {
            let uh = self.project.rdii_inflows[ri].uh_index;
            let uh = self.project.unit_hydrographs[uh].clone();
            self.project.rdii_inflows[ri].initialize(&uh, self.project.options.wet_step.max(tstep));
        }

        let routing_state = RoutingState::new(&self.project)?;
        let mut stats = Stats::new(&self.project);
        // storage init volumes after node initialization
        for (ni, slot) in stats.storages.iter_mut().enumerate() {
            if let Some(s) = slot {
                s.init_volume = self.project.nodes[ni].new_volume;
            }
        }

        let mut massbal = MassBalance::new(npollut);
        massbal.routing.init_storage = self.total_stored_volume();
        massbal.runoff.init_storage = self.surface_stored_volume();
        massbal.gwater.init_storage = self.gw_stored_volume();

        let quality = QualityEngine::new(&self.project);
        for (p, totals) in massbal.quality.iter_mut().enumerate() {
            totals.initial_buildup = quality
                .surfaces
                .iter()
                .map(|s| s.total_mass(p))
                .sum();
        }

        let snow = self
            .project
            .subcatchments
            .iter()
            .map(|s| s.snowpack.as_ref().map(|_| SubcatchSnow::default()))
            .collect();

        let output = if save_results {
            Some(OutputWriter::create(&self.out_path, &self.project)?)
        } else {
            None
        };

        let total_ms =
            (self.project.options.end - self.project.options.start).num_milliseconds() as f64;
        let report_start_ms = self
            .project
            .options
            .report_start
            .map(|rs| (rs - self.project.options.start).num_milliseconds() as f64)
            .unwrap_or(0.0);

        let nnode = self.project.nodes.len();
        self.runtime = Some(Runtime {
            routing: routing_state,
            quality,
            massbal,
            stats,
            snow,
            output,
            total_ms,
            routing_ms: 0.0,
            runoff_ms: 0.0,
            report_ms: report_start_ms + self.project.options.report_step * 1000.0,
            rule_ms: 0.0,
            runoff_inflow: vec![0.0; nnode],
            gw_inflow: vec![0.0; nnode],
            rdii_inflow: vec![0.0; nnode],
            dwf_flow: 0.0,
            ext_flow: 0.0,
            system: SystemResults::default(),
        });
        self.state = EngineState::Started;
        info!(
            "simulation started: {} -> {}",
            self.project.options.start, self.project.options.end
        );
        Ok(())
    }

    /// Advance one routing step. Returns the elapsed simulated time in
    /// milliseconds, or 0 once the horizon is reached.
    pub fn step(&mut self) -> Result<f64> {
        let r = self.step_inner();
        self.record(r)
    }

    fn step_inner(&mut self) -> Result<f64> {
        if self.state != EngineState::Started {
            return Err(EngineError::ApiSimNotRunning);
        }
        let runtime = self.runtime.as_mut().expect("runtime exists in Started");

        if runtime.routing_ms >= runtime.total_ms {
            self.state = EngineState::Ended;
            return Ok(0.0);
        }

        // hydrology runs ahead of routing at its own cadence
        while runtime.runoff_ms <= runtime.routing_ms {
            hydrology_step(&mut self.project, runtime)?;
        }

        let date = self.project.options.start
            + Duration::milliseconds(runtime.routing_ms as i64);

        // node lateral inflows for this routing step
        assemble_lateral_inflows(&mut self.project, runtime, date);

        // control rules at their cadence
        if runtime.routing_ms >= runtime.rule_ms {
            apply_control_rules(&mut self.project, runtime.routing_ms / 3.6e6, date);
            let rule_step = self.project.options.rule_step;
            runtime.rule_ms += if rule_step > 0.0 {
                rule_step * 1000.0
            } else {
                0.0
            };
            if rule_step <= 0.0 {
                runtime.rule_ms = runtime.routing_ms; // every step
            }
        }

        // routing step, possibly shortened by the Courant criterion
        let remaining_s = (runtime.total_ms - runtime.routing_ms) / 1000.0;
        let remaining_report_s = (runtime.report_ms - runtime.routing_ms) / 1000.0;
        let max_step = self
            .project
            .options
            .route_step
            .min(remaining_s)
            .min(remaining_report_s.max(self.project.options.min_route_step));
        let evap = self.project.evap_rate(date);
        runtime.routing.dyn_state.now = date;
        let used = routing::execute(&mut self.project, &mut runtime.routing, max_step, evap)?;
        runtime.routing_ms += used * 1000.0;

        // water quality rides on the finished flow field
        if !self.project.options.ignore_quality && self.project.npollut() > 0 {
            route_quality(&mut self.project, runtime, used);
        }

        update_mass_balance(&mut self.project, runtime, used);
        let step_date = self.project.options.start
            + Duration::milliseconds(runtime.routing_ms as i64);
        runtime.stats.update(&self.project, used, step_date);
        accumulate_system_results(&self.project, runtime, used);

        // results sink at the reporting cadence
        if runtime.routing_ms + 1.0 >= runtime.report_ms {
            if let Some(writer) = runtime.output.as_mut() {
                let sys = runtime.system;
                writer.save_period(&self.project, step_date, &sys)?;
            }
            runtime.system = SystemResults::default();
            runtime.report_ms += self.project.options.report_step * 1000.0;
        }

        if runtime.routing_ms >= runtime.total_ms {
            self.state = EngineState::Ended;
            return Ok(0.0);
        }
        Ok(runtime.routing_ms)
    }

    /// Call [`Engine::step`] until `seconds` of simulated time pass.
    pub fn stride(&mut self, seconds: f64) -> Result<f64> {
        if self.state != EngineState::Started {
            let err: Result<f64> = Err(EngineError::ApiSimNotRunning);
            return self.record(err);
        }
        let start_ms = self.runtime.as_ref().map(|r| r.routing_ms).unwrap_or(0.0);
        let target = start_ms + seconds * 1000.0;
        let mut elapsed = start_ms;
        while elapsed < target {
            elapsed = self.step()?;
            if elapsed == 0.0 {
                return Ok(0.0);
            }
        }
        Ok(elapsed)
    }

    /// Finish the run: fix final storages and drop the run-scoped state.
    pub fn end(&mut self) -> Result<()> {
        if self.state != EngineState::Started && self.state != EngineState::Ended {
            let err: Result<()> = Err(EngineError::ApiSimNotRunning);
            return self.record(err);
        }
        let final_total = self.total_stored_volume();
        let final_surface = self.surface_stored_volume();
        let final_gw = self.gw_stored_volume();
        if let Some(mut runtime) = self.runtime.take() {
            runtime.massbal.routing.final_storage = final_total;
            runtime.massbal.runoff.final_storage = final_surface;
            runtime.massbal.gwater.final_storage = final_gw;
            for (p, totals) in runtime.massbal.quality.iter_mut().enumerate() {
                totals.final_buildup = runtime
                    .quality
                    .surfaces
                    .iter()
                    .map(|s| s.total_mass(p))
                    .sum();
                totals.final_stored = self
                    .project
                    .nodes
                    .iter()
                    .map(|n| {
                        n.new_qual.get(p).copied().unwrap_or(0.0)
                            * n.new_volume
                            * crate::pollut::L_PER_FT3
                    })
                    .sum();
            }
            if let Some(writer) = runtime.output.take() {
                writer.close()?;
            }
            self.final_massbal = Some(runtime.massbal);
            self.final_stats = Some(runtime.stats);
        }
        self.state = EngineState::Ended;
        Ok(())
    }

    /// Write the plain-text run summary to the report file.
    pub fn report(&mut self) -> Result<()> {
        if self.state != EngineState::Ended {
            let err: Result<()> = Err(EngineError::ApiSimNotRunning);
            return self.record(err);
        }
        let mut text = String::new();
        for line in &self.project.title {
            text.push_str(line);
            text.push('\n');
        }
        if let Some(mb) = &self.final_massbal {
            text.push_str("\nFlow Routing Continuity\n");
            text.push_str(&format!(
                "  total inflow (ft3) ....... {:.3}\n",
                mb.routing.total_inflow()
            ));
            text.push_str(&format!(
                "  total outflow (ft3) ...... {:.3}\n",
                mb.routing.total_outflow()
            ));
            text.push_str(&format!(
                "  continuity error (%) ..... {:.3}\n",
                mb.routing.pct_error()
            ));
            text.push_str("\nRunoff Continuity\n");
            text.push_str(&format!(
                "  continuity error (%) ..... {:.3}\n",
                mb.runoff.pct_error()
            ));
        }
        std::fs::write(&self.report_path, text).map_err(|e| EngineError::RptFile {
            path: self.report_path.clone(),
            source: e,
        })?;
        Ok(())
    }

    /// Release everything; the engine value is consumed.
    pub fn close(mut self) -> Result<()> {
        if let Some(runtime) = self.runtime.take() {
            if let Some(writer) = runtime.output {
                writer.close()?;
            }
        }
        Ok(())
    }

    // ----- introspection -------------------------------------------------

    pub fn count(&self, kind: ObjectKind) -> usize {
        match kind {
            ObjectKind::Gage => self.project.gages.len(),
            ObjectKind::Subcatchment => self.project.subcatchments.len(),
            ObjectKind::Node => self.project.nodes.len(),
            ObjectKind::Link => self.project.links.len(),
            ObjectKind::Pollutant => self.project.pollutants.len(),
            ObjectKind::LidProcess => self.project.lid_processes.len(),
        }
    }

    pub fn object_id(&self, kind: ObjectKind, index: usize) -> Result<&str> {
        let id = match kind {
            ObjectKind::Gage => self.project.gages.get(index).map(|o| o.id.as_str()),
            ObjectKind::Subcatchment => self
                .project
                .subcatchments
                .get(index)
                .map(|o| o.id.as_str()),
            ObjectKind::Node => self.project.nodes.get(index).map(|o| o.id.as_str()),
            ObjectKind::Link => self.project.links.get(index).map(|o| o.id.as_str()),
            ObjectKind::Pollutant => self.project.pollutants.get(index).map(|o| o.id.as_str()),
            ObjectKind::LidProcess => self
                .project
                .lid_processes
                .get(index)
                .map(|o| o.id.as_str()),
        };
        id.ok_or(EngineError::ApiOutOfBounds)
    }

    pub fn index_of(&self, kind: ObjectKind, name: &str) -> Result<usize> {
        let ix = &self.project.indexes;
        let found = match kind {
            ObjectKind::Gage => ix.gages.find(name),
            ObjectKind::Subcatchment => ix.subcatchments.find(name),
            ObjectKind::Node => ix.nodes.find(name),
            ObjectKind::Link => ix.links.find(name),
            ObjectKind::Pollutant => ix.pollutants.find(name),
            ObjectKind::LidProcess => ix.lid_processes.find(name),
        };
        found.ok_or(EngineError::UndefinedName {
            kind: "object",
            name: name.to_string(),
        })
    }

    // ----- getters and setters ------------------------------------------

    pub fn node_property(&self, index: usize, prop: NodeProperty) -> Result<f64> {
        let node = self
            .project
            .nodes
            .get(index)
            .ok_or(EngineError::ApiOutOfBounds)?;
        let uc = &self.project.units;
        let v = match prop {
            NodeProperty::Invert => uc.to_user(Quantity::Length, node.invert),
            NodeProperty::FullDepth => uc.to_user(Quantity::Length, node.full_depth),
            NodeProperty::SurchargeDepth => {
                uc.to_user(Quantity::Length, node.surcharge_depth)
            }
            NodeProperty::PondedArea => node.ponded_area,
            NodeProperty::InitDepth => uc.to_user(Quantity::Length, node.init_depth),
            NodeProperty::Depth => uc.to_user(Quantity::Length, node.new_depth),
            NodeProperty::Head => uc.to_user(Quantity::Length, node.head()),
            NodeProperty::Volume => uc.to_user(Quantity::Volume, node.new_volume),
            NodeProperty::LateralInflow => uc.to_user(Quantity::Flow, node.new_lat_flow),
            NodeProperty::TotalInflow => uc.to_user(Quantity::Flow, node.inflow),
            NodeProperty::Overflow => uc.to_user(Quantity::Flow, node.overflow),
        };
        Ok(v)
    }

    pub fn set_node_property(
        &mut self,
        index: usize,
        prop: NodeProperty,
        value: f64,
    ) -> Result<()> {
        let r = self.set_node_property_inner(index, prop, value);
        self.record(r)
    }

    fn set_node_property_inner(
        &mut self,
        index: usize,
        prop: NodeProperty,
        value: f64,
    ) -> Result<()> {
        let uc = self.project.units;
        let node = self
            .project
            .nodes
            .get_mut(index)
            .ok_or(EngineError::ApiOutOfBounds)?;
        match prop {
            NodeProperty::Invert => node.invert = uc.to_internal(Quantity::Length, value),
            NodeProperty::FullDepth => {
                node.full_depth = uc.to_internal(Quantity::Length, value)
            }
            NodeProperty::SurchargeDepth => {
                node.surcharge_depth = uc.to_internal(Quantity::Length, value)
            }
            NodeProperty::PondedArea => node.ponded_area = value,
            NodeProperty::InitDepth => {
                node.init_depth = uc.to_internal(Quantity::Length, value)
            }
            _ => return Err(EngineError::ApiWrongType),
        }
        Ok(())
    }

    pub fn link_property(&self, index: usize, prop: LinkProperty) -> Result<f64> {
        let link = self
            .project
            .links
            .get(index)
            .ok_or(EngineError::ApiOutOfBounds)?;
        let uc = &self.project.units;
        let v = match prop {
            LinkProperty::Offset1 => uc.to_user(Quantity::Length, link.offset1),
            LinkProperty::Offset2 => uc.to_user(Quantity::Length, link.offset2),
            LinkProperty::InitFlow => uc.to_user(Quantity::Flow, link.init_flow),
            LinkProperty::FlowLimit => uc.to_user(Quantity::Flow, link.max_flow),
            LinkProperty::Flow => {
                uc.to_user(Quantity::Flow, link.new_flow * link.direction as f64)
            }
            LinkProperty::Depth => uc.to_user(Quantity::Length, link.new_depth),
            LinkProperty::Velocity => {
                let area = link.xsect.area_of_depth(link.new_depth);
                if area > crate::units::FUDGE {
                    uc.to_user(Quantity::Length, link.new_flow.abs() / area)
                } else {
                    0.0
                }
            }
            LinkProperty::Volume => uc.to_user(Quantity::Volume, link.new_volume),
            LinkProperty::Setting => link.setting,
            LinkProperty::TargetSetting => link.target_setting,
        };
        Ok(v)
    }

    /// Move a link's target setting; safe between steps while running.
    pub fn set_link_setting(&mut self, index: usize, setting: f64) -> Result<()> {
        let r = (|| {
            let link = self
                .project
                .links
                .get_mut(index)
                .ok_or(EngineError::ApiOutOfBounds)?;
            link.target_setting = setting.clamp(0.0, 1.0);
            link.update_setting(f64::MAX);
            Ok(())
        })();
        self.record(r)
    }

    pub fn subcatch_property(&self, index: usize, prop: SubcatchProperty) -> Result<f64> {
        let s = self
            .project
            .subcatchments
            .get(index)
            .ok_or(EngineError::ApiOutOfBounds)?;
        let uc = &self.project.units;
        let v = match prop {
            SubcatchProperty::Area => uc.to_user(Quantity::LandArea, s.area),
            SubcatchProperty::Width => uc.to_user(Quantity::Length, s.width),
            SubcatchProperty::Slope => s.slope,
            SubcatchProperty::FracImperv => s.frac_imperv,
            SubcatchProperty::Rainfall => uc.to_user(Quantity::Rainfall, s.rainfall),
            SubcatchProperty::Evaporation => uc.to_user(Quantity::Flow, s.evap_loss),
            SubcatchProperty::Infiltration => uc.to_user(Quantity::Flow, s.infil_loss),
            SubcatchProperty::Runoff => uc.to_user(Quantity::Flow, s.new_runoff),
        };
        Ok(v)
    }

    /// Override a gage's rainfall (user intensity units) until cleared
    /// with a negative value.
    pub fn set_gage_precip(&mut self, index: usize, intensity: f64) -> Result<()> {
        let r = (|| {
            let uc = self.project.units;
            let gage = self
                .project
                .gages
                .get_mut(index)
                .ok_or(EngineError::ApiOutOfBounds)?;
            gage.api_rainfall = if intensity < 0.0 {
                None
            } else {
                Some(uc.to_internal(Quantity::Rainfall, intensity))
            };
            Ok(())
        })();
        self.record(r)
    }

    pub fn gage_precip(&self, index: usize) -> Result<f64> {
        let gage = self
            .project
            .gages
            .get(index)
            .ok_or(EngineError::ApiOutOfBounds)?;
        Ok(self
            .project
            .units
            .to_user(Quantity::Rainfall, gage.precipitation()))
    }

    /// Fix an outfall's stage elevation (user length units); a NaN
    /// restores the configured boundary.
    pub fn set_outfall_stage(&mut self, index: usize, stage: f64) -> Result<()> {
        let r = (|| {
            let uc = self.project.units;
            let node = self
                .project
                .nodes
                .get_mut(index)
                .ok_or(EngineError::ApiOutOfBounds)?;
            match &mut node.kind {
                crate::node::NodeKind::Outfall(of) => {
                    of.api_stage = if stage.is_nan() {
                        None
                    } else {
                        Some(uc.to_internal(Quantity::Length, stage))
                    };
                    Ok(())
                }
                _ => Err(EngineError::ApiWrongType),
            }
        })();
        self.record(r)
    }

    /// Override a node's external lateral inflow (user flow units);
    /// persists until changed again.
    pub fn set_node_inflow(&mut self, index: usize, flow: f64) -> Result<()> {
        let r = (|| {
            let uc = self.project.units;
            let node = self
                .project
                .nodes
                .get_mut(index)
                .ok_or(EngineError::ApiOutOfBounds)?;
            node.api_lat_flow = Some(uc.to_internal(Quantity::Flow, flow));
            Ok(())
        })();
        self.record(r)
    }

    /// Change a LID process's surface slope; the derived conveyance term
    /// is recomputed immediately.
    pub fn set_lid_surface_slope(&mut self, index: usize, slope: f64) -> Result<()> {
        let r = (|| {
            let proc = self
                .project
                .lid_processes
                .get_mut(index)
                .ok_or(EngineError::ApiOutOfBounds)?;
            let surface = proc.surface.as_mut().ok_or(EngineError::ApiWrongType)?;
            surface.slope = slope.max(0.0);
            proc.update_alphas();
            Ok(())
        })();
        self.record(r)
    }

    /// Change a LID process's surface roughness; the derived conveyance
    /// term is recomputed immediately.
    pub fn set_lid_surface_roughness(&mut self, index: usize, roughness: f64) -> Result<()> {
        let r = (|| {
            let proc = self
                .project
                .lid_processes
                .get_mut(index)
                .ok_or(EngineError::ApiOutOfBounds)?;
            let surface = proc.surface.as_mut().ok_or(EngineError::ApiWrongType)?;
            surface.roughness = roughness.max(0.0);
            proc.update_alphas();
            Ok(())
        })();
        self.record(r)
    }

    // ----- run results ---------------------------------------------------

    pub fn mass_balance(&self) -> Option<&MassBalance> {
        self.runtime
            .as_ref()
            .map(|r| &r.massbal)
            .or(self.final_massbal.as_ref())
    }

    pub fn statistics(&self) -> Option<&Stats> {
        self.runtime
            .as_ref()
            .map(|r| &r.stats)
            .or(self.final_stats.as_ref())
    }

    // ----- internal volume audits ---------------------------------------

    fn total_stored_volume(&self) -> f64 {
        let nodes: f64 = self.project.nodes.iter().map(|n| n.new_volume).sum();
        let links: f64 = self.project.links.iter().map(|l| l.new_volume).sum();
        nodes + links
    }

    fn surface_stored_volume(&self) -> f64 {
        self.project
            .subcatchments
            .iter()
            .map(|s| {
                let ponded: f64 = s
                    .subareas
                    .iter()
                    .map(|sa| sa.depth * sa.frac * s.non_lid_area())
                    .sum();
                let lid: f64 = s
                    .lid_units
                    .iter()
                    .map(|u| {
                        let proc = &self.project.lid_processes[u.process_index];
                        u.stored_volume(proc)
                    })
                    .sum();
                ponded + lid
            })
            .sum()
    }

    fn gw_stored_volume(&self) -> f64 {
        self.project
            .gw_of_subcatch
            .iter()
            .enumerate()
            .filter_map(|(si, slot)| slot.map(|gi| (si, gi)))
            .map(|(si, gi)| {
                let gw = &self.project.groundwater[gi];
                let aq = &self.project.aquifers[gw.aquifer_index];
                let area = self.project.subcatchments[si].area;
                (gw.water_table - aq.bottom_elev).max(0.0) * aq.porosity * area
            })
            .sum()
    }
}

/// One hydrology (runoff) step at the wet/dry cadence: gages, snowmelt,
/// subcatchment runoff, LID units, groundwater, RDII, surface quality.
fn hydrology_step(project: &mut Project, runtime: &mut Runtime) -> Result<()> {
    let date =
        project.options.start + Duration::milliseconds(runtime.runoff_ms as i64);
    let uc = project.units;

    // gage state
    for g in &mut project.gages {
        if project.options.ignore_rainfall {
            g.rainfall = 0.0;
            g.snowfall = 0.0;
            continue;
        }
        let series = g.series_index.map(|i| project.series[i].clone());
        g.set_state(date, series.as_ref(), &uc);
    }
    let air_temp = project.air_temp(date);
    if let Some(temp) = air_temp {
        if !project.options.ignore_snowmelt {
            let divide = project.climate.snow_temp;
            for g in &mut project.gages {
                g.split_snow(temp, divide);
            }
        }
    }

    let wet = project
        .gages
        .iter()
        .any(|g| g.rainfall > 0.0 || g.snowfall > 0.0)
        || project
            .subcatchments
            .iter()
            .any(|s| s.new_runoff > 0.0 || s.ponded_depth() > crate::units::FUDGE);
    let tstep = if wet {
        project.options.wet_step
    } else {
        project.options.dry_step
    };
    let evap = project.evap_rate(date);

    for q in runtime.runoff_inflow.iter_mut() {
        *q = 0.0;
    }
    for q in runtime.gw_inflow.iter_mut() {
        *q = 0.0;
    }
    for q in runtime.rdii_inflow.iter_mut() {
        *q = 0.0;
    }

    let nsub = project.subcatchments.len();
    for si in 0..nsub {
        let gage_index = project.subcatchments[si].gage_index;
        let mut rain = project.gages[gage_index].rainfall;
        let snowfall = project.gages[gage_index].snowfall;

        // snowmelt joins rainfall
        if let (Some(pack_name), Some(temp)) = (
            project.subcatchments[si].snowpack.clone(),
            air_temp,
        ) {
            if let (Some(snow), Some(pi)) = (
                runtime.snow[si].as_mut(),
                project.indexes.snowpacks.find(&pack_name),
            ) {
                let pack = &project.snowpacks[pi];
                let frac_imperv = project.subcatchments[si].frac_imperv;
                rain += snow.step(pack, snowfall, temp, frac_imperv, tstep);
                runtime.system.snow_depth = snow.mean_depth(pack, frac_imperv);
            }
        }

        let runoff = project.subcatchments[si].compute_runoff(rain, evap, tstep);
        let mut to_outlet = runoff;

        // LID units capture their share of runoff plus direct rainfall
        let nunits = project.subcatchments[si].lid_units.len();
        for ui in 0..nunits {
            let unit_area = project.subcatchments[si].lid_units[ui].total_area();
            if unit_area <= 0.0 {
                continue;
            }
            let captured = {
                let s = &project.subcatchments[si];
                let u = &s.lid_units[ui];
                (u.from_imperv * s.imperv_runoff + u.from_perv * s.perv_runoff)
                    .min(to_outlet)
            };
            to_outlet -= captured;
            let inflow_rate = rain + captured / unit_area;
            let pi = project.subcatchments[si].lid_units[ui].process_index;
            let proc = project.lid_processes[pi].clone();
            let drain_curve = proc
                .drain
                .as_ref()
                .and_then(|d| d.curve.as_ref())
                .and_then(|name| project.indexes.curves.find(name))
                .map(|ci| project.curves[ci].clone());
            let out = project.subcatchments[si].lid_units[ui].step(
                &proc,
                inflow_rate,
                evap,
                None,
                drain_curve.as_ref(),
                tstep,
            );

            runtime.massbal.runoff.evap += out.evap * tstep;
            runtime.massbal.runoff.infil += out.infil * tstep;
            let (drain_node, drain_sub) = {
                let u = &project.subcatchments[si].lid_units[ui];
                (u.drain_node, u.drain_subcatch)
            };
            match (drain_node, drain_sub) {
                (Some(ni), _) => {
                    runtime.runoff_inflow[ni] += out.drain_flow;
                    runtime.massbal.runoff.drains += out.drain_flow * tstep;
                }
                (None, Some(oi)) => {
                    project.subcatchments[oi].add_runon(out.drain_flow);
                }
                _ => {
                    // undrained water returns to the surface with the
                    // overflow
                    project.subcatchments[si].add_runon(out.drain_flow);
                }
            }
            project.subcatchments[si].add_runon(out.surface_return);
        }

        // surface water quality
        let npollut = project.npollut();
        if npollut > 0 && !project.options.ignore_quality {
            if to_outlet > 0.0 {
                let landuses = std::mem::take(&mut project.landuses);
                let loads = runtime.surface_washoff(si, project, &landuses, to_outlet, tstep);
                project.landuses = landuses;
                for (p, load) in loads.iter().enumerate() {
                    runtime.massbal.quality[p].washoff += load * tstep;
                }
                project.subcatchments[si].washoff_load = loads;
            } else {
                let landuses = std::mem::take(&mut project.landuses);
                runtime.quality.surfaces[si].accumulate(
                    &project.subcatchments[si],
                    &landuses,
                    tstep,
                );
                project.landuses = landuses;
                project.subcatchments[si].washoff_load = vec![0.0; npollut];
            }
        }

        // groundwater beneath the subcatchment
        if let Some(gi) = project.gw_of_subcatch[si] {
            if !project.options.ignore_groundwater {
                let aq = project.aquifers[project.groundwater[gi].aquifer_index].clone();
                let area = project.subcatchments[si].area;
                let infil_rate = project.subcatchments[si].infil_loss / area.max(1.0);
                let node = project.groundwater[gi].node_index;
                let channel_depth = project.nodes[node].new_depth;
                let gw = &mut project.groundwater[gi];
                let flow = gw.step(&aq, area, infil_rate, evap, channel_depth, tstep);
                runtime.gw_inflow[node] += flow;
                runtime.massbal.gwater.infil += infil_rate * area * tstep;
                runtime.massbal.gwater.lateral_flow += flow * tstep;
                runtime.massbal.gwater.deep_seepage += gw.seepage * tstep;
            }
        }

        // deliver runoff to the outlet
        let (outlet_ref, non_lid, evap_loss, infil_loss) = {
            let s = &project.subcatchments[si];
            (s.outlet_ref, s.non_lid_area(), s.evap_loss, s.infil_loss)
        };
        runtime.massbal.runoff.precip += rain * non_lid * tstep;
        runtime.massbal.runoff.evap += evap_loss * tstep;
        runtime.massbal.runoff.infil += infil_loss * tstep;
        match outlet_ref {
            OutletRef::Node(ni) => {
                runtime.runoff_inflow[ni] += to_outlet;
                runtime.massbal.runoff.runoff += to_outlet * tstep;
            }
            OutletRef::Subcatch(oi) => {
                runtime.massbal.runoff.runon += to_outlet * tstep;
                project.subcatchments[oi].add_runon(to_outlet);
            }
            OutletRef::Recycle => {
                project.subcatchments[si].add_runon(to_outlet);
            }
        }
    }

    // RDII convolution against gage rainfall
    if !project.options.ignore_rdii {
        for ri in 0..project.rdii_inflows.len() {
            let uh_index = project.rdii_inflows[ri].uh_index;
            let uh = project.unit_hydrographs[uh_index].clone();
            let rain = project.gages[uh.gage_index].rainfall;
            let node = project.rdii_inflows[ri].node_index;
            let flow = project.rdii_inflows[ri].step(&uh, rain, tstep);
            runtime.rdii_inflow[node] += flow;
        }
    }

    runtime.system.rainfall = project
        .gages
        .iter()
        .filter(|g| g.is_used)
        .map(|g| g.rainfall)
        .fold(0.0, f64::max);
    if let Some(t) = air_temp {
        runtime.system.temperature = t;
    }
    runtime.runoff_ms += tstep * 1000.0;
    Ok(())
}

impl Runtime {
    /// Wet-step washoff wrapper keeping the borrow checker happy while
    /// both the surfaces and the subcatchment are in play.
    fn surface_washoff(
        &mut self,
        si: usize,
        project: &Project,
        landuses: &[crate::pollut::Landuse],
        runoff: f64,
        tstep: f64,
    ) -> Vec<f64> {
        self.quality.surfaces[si].washoff(
            &project.subcatchments[si],
            landuses,
            runoff,
            tstep,
            project.npollut(),
        )
    }
}

/// Combine runoff, groundwater, RDII, dry-weather, and external inflows
/// into each node's lateral inflow, and their loads into the quality
/// layer.
fn assemble_lateral_inflows(project: &mut Project, runtime: &mut Runtime, date: NaiveDateTime) {
    let npollut = project.npollut();
    runtime.quality.clear_lateral_loads();
    runtime.dwf_flow = 0.0;
    runtime.ext_flow = 0.0;

    let mut lat = vec![0.0; project.nodes.len()];
    for ni in 0..project.nodes.len() {
        lat[ni] = runtime.runoff_inflow[ni] + runtime.gw_inflow[ni] + runtime.rdii_inflow[ni];
    }

    // external inflows, unless overridden through the API
    let mut ext = vec![0.0; project.nodes.len()];
    for inflow in &project.external_inflows {
        if !matches!(inflow.kind, crate::inflow::InflowKind::Flow) {
            continue;
        }
        let series = inflow.series_index.map(|i| &project.series[i]);
        let pattern = inflow.pattern_index.map(|i| &project.patterns[i]);
        ext[inflow.node_index] += inflow.value_at(date, series, pattern);
    }
    let mut dwf = vec![0.0; project.nodes.len()];
    for record in &project.dwf_inflows {
        if record.pollut_index.is_some() {
            continue;
        }
        let patterns: Vec<&crate::table::Pattern> = record
            .pattern_indexes
            .iter()
            .map(|&i| &project.patterns[i])
            .collect();
        dwf[record.node_index] += record.value_at(date, &patterns);
    }

    for (ni, node) in project.nodes.iter_mut().enumerate() {
        let ext_here = node.api_lat_flow.unwrap_or(ext[ni]);
        node.new_lat_flow = lat[ni] + ext_here + dwf[ni];
        runtime.ext_flow += ext_here;
        runtime.dwf_flow += dwf[ni];
    }

    // pollutant loads riding the inflows
    if npollut > 0 && !project.options.ignore_quality {
        for si in 0..project.subcatchments.len() {
            if let OutletRef::Node(ni) = project.subcatchments[si].outlet_ref {
                let loads = project.subcatchments[si].washoff_load.clone();
                for (p, load) in loads.iter().enumerate() {
                    runtime.quality.add_lateral_load(ni, p, *load);
                }
            }
        }
        for inflow in &project.external_inflows {
            let Some(p) = inflow.pollut_index else { continue };
            let series = inflow.series_index.map(|i| &project.series[i]);
            let pattern = inflow.pattern_index.map(|i| &project.patterns[i]);
            let value = inflow.value_at(date, series, pattern);
            let load = match inflow.kind {
                crate::inflow::InflowKind::Mass => value,
                crate::inflow::InflowKind::Concentration => {
                    value * ext[inflow.node_index] * crate::pollut::L_PER_FT3
                }
                crate::inflow::InflowKind::Flow => 0.0,
            };
            runtime.quality.add_lateral_load(inflow.node_index, p, load);
        }
        for record in &project.dwf_inflows {
            let Some(p) = record.pollut_index else { continue };
            let patterns: Vec<&crate::table::Pattern> = record
                .pattern_indexes
                .iter()
                .map(|&i| &project.patterns[i])
                .collect();
            let conc = record.value_at(date, &patterns);
            let load = conc * dwf[record.node_index] * crate::pollut::L_PER_FT3;
            runtime.quality.add_lateral_load(record.node_index, p, load);
        }
    }
}

/// Evaluate every control rule against the live model and apply the
/// winning actions.
fn apply_control_rules(project: &mut Project, sim_hours: f64, date: NaiveDateTime) {
    use crate::controls::{RuleAction, RuleClock, RuleVar};
    if project.controls.is_empty() {
        return;
    }
    let clock = RuleClock {
        sim_hours,
        now: date,
    };
    let lookup = |var: &RuleVar| -> Option<f64> {
        if let Some(v) = clock.value(var) {
            return Some(v);
        }
        match var {
            RuleVar::NodeDepth { node } => project
                .indexes
                .nodes
                .find(node)
                .map(|ni| project.nodes[ni].new_depth),
            RuleVar::NodeHead { node } => project
                .indexes
                .nodes
                .find(node)
                .map(|ni| project.nodes[ni].head()),
            RuleVar::NodeInflow { node } => project
                .indexes
                .nodes
                .find(node)
                .map(|ni| project.nodes[ni].inflow),
            RuleVar::LinkFlow { link } => project
                .indexes
                .links
                .find(link)
                .map(|li| project.links[li].new_flow),
            RuleVar::LinkDepth { link } => project
                .indexes
                .links
                .find(link)
                .map(|li| project.links[li].new_depth),
            RuleVar::LinkSetting { link } | RuleVar::PumpStatus { link } => project
                .indexes
                .links
                .find(link)
                .map(|li| project.links[li].setting),
            _ => None,
        }
    };
    let fired: Vec<(usize, bool)> = project
        .controls
        .iter()
        .enumerate()
        .map(|(i, rule)| (i, rule.evaluate(&lookup)))
        .collect();
    let rules = &project.controls;
    let winners: Vec<RuleAction> = crate::controls::winning_actions(
        fired.iter().map(|&(i, holds)| (&rules[i], holds)),
    )
    .into_iter()
    .cloned()
    .collect();

    let tstep = project.options.route_step;
    let uc = project.units;
    for action in winners {
        match action {
            RuleAction::SetLinkSetting { link, value } => {
                if let Some(li) = project.indexes.links.find(&link) {
                    project.links[li].target_setting = value.clamp(0.0, 1.0);
                    project.links[li].update_setting(tstep);
                }
            }
            RuleAction::SetPumpStatus { link, on } => {
                if let Some(li) = project.indexes.links.find(&link) {
                    project.links[li].target_setting = if on { 1.0 } else { 0.0 };
                    project.links[li].update_setting(tstep);
                }
            }
            RuleAction::SetNodeInflow { node, value } => {
                if let Some(ni) = project.indexes.nodes.find(&node) {
                    project.nodes[ni].api_lat_flow =
                        Some(uc.to_internal(Quantity::Flow, value));
                }
            }
            RuleAction::SetOutfallStage { node, value } => {
                if let Some(ni) = project.indexes.nodes.find(&node) {
                    if let crate::node::NodeKind::Outfall(of) = &mut project.nodes[ni].kind {
                        of.api_stage = Some(uc.to_internal(Quantity::Length, value));
                    }
                }
            }
        }
    }
}

/// Route quality through nodes (upstream first where an order exists)
/// and then links.
fn route_quality(project: &mut Project, runtime: &mut Runtime, tstep: f64) {
    let order: Vec<usize> = if runtime.routing.topo_nodes.is_empty() {
        (0..project.nodes.len()).collect()
    } else {
        runtime.routing.topo_nodes.clone()
    };
    for ni in order {
        let inflows: Vec<(f64, Vec<f64>)> = project.nodes[ni]
            .in_links
            .iter()
            .map(|&li| {
                let l = &project.links[li];
                (l.new_flow.max(0.0), l.old_qual.clone())
            })
            .collect();
        runtime
            .quality
            .route_node(project, ni, &inflows, tstep);
    }
    for li in 0..project.links.len() {
        runtime.quality.route_link(project, li, tstep);
    }
    // outfall discharge loads
    for (p, totals) in runtime.massbal.quality.iter_mut().enumerate() {
        for n in project.nodes.iter().filter(|n| n.is_outfall()) {
            totals.outflow_load += n.new_qual.get(p).copied().unwrap_or(0.0)
                * n.outflow
                * tstep
                * crate::pollut::L_PER_FT3;
        }
    }
}

/// Fold one routing step into the mass-balance counters.
fn update_mass_balance(project: &Project, runtime: &mut Runtime, tstep: f64) {
    let wet: f64 = runtime.runoff_inflow.iter().sum();
    let gw: f64 = runtime.gw_inflow.iter().sum();
    let rdii: f64 = runtime.rdii_inflow.iter().sum();
    let routing = &mut runtime.massbal.routing;
    routing.wet_inflow += wet * tstep;
    routing.gw_inflow += gw * tstep;
    routing.rdii_inflow += rdii * tstep;
    routing.ext_inflow += runtime.ext_flow * tstep;
    routing.dw_inflow += runtime.dwf_flow * tstep;
    for n in &project.nodes {
        routing.flooding += n.overflow * tstep;
        if n.is_outfall() {
            routing.outflow += n.outflow * tstep;
        }
        if let crate::node::NodeKind::Storage(s) = &n.kind {
            routing.evap_loss += s.evap_loss * tstep;
            routing.seepage_loss += s.seepage_loss * tstep;
        }
    }
    // pollutant loads entering the conveyance system this step
    for loads in &runtime.quality.lateral_load {
        for (p, load) in loads.iter().enumerate() {
            runtime.massbal.quality[p].lateral_inflow += load * tstep;
        }
    }
}

/// Keep the running system-results snapshot current for the next report.
fn accumulate_system_results(project: &Project, runtime: &mut Runtime, _tstep: f64) {
    let sys = &mut runtime.system;
    sys.runoff = runtime.runoff_inflow.iter().sum();
    sys.gw_inflow = runtime.gw_inflow.iter().sum();
    sys.rdii_inflow = runtime.rdii_inflow.iter().sum();
    sys.dw_inflow = runtime.dwf_flow;
    sys.ext_inflow = runtime.ext_flow;
    sys.total_inflow =
        sys.runoff + sys.gw_inflow + sys.rdii_inflow + sys.dw_inflow + sys.ext_inflow;
    sys.flooding = project.nodes.iter().map(|n| n.overflow).sum();
    sys.outflow = project
        .nodes
        .iter()
        .filter(|n| n.is_outfall())
        .map(|n| n.outflow)
        .sum();
    sys.storage = project.nodes.iter().map(|n| n.new_volume).sum::<f64>()
        + project.links.iter().map(|l| l.new_volume).sum::<f64>();
    sys.infil = project
        .subcatchments
        .iter()
        .map(|s| s.infil_loss)
        .sum();
    sys.evap = project.evap_rate(
        project.options.start + Duration::milliseconds(runtime.routing_ms as i64),
    );
    sys.pet = sys.evap;
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn project_json() -> String {
        r#"{
            "options": {
                "flow_units": "CFS",
                "route_model": "kinematic-wave",
                "start": "2024-06-01T00:00:00",
                "end": "2024-06-01T06:00:00",
                "wet_step": 300.0,
                "dry_step": 300.0,
                "route_step": 20.0,
                "report_step": 900.0
            },
            "gages": [{
                "id": "G1", "source": "series", "series": "RAIN",
                "format": "intensity", "interval": 3600.0
            }],
            "series": [{
                "id": "RAIN",
                "points": [
                    {"time": "2024-06-01T00:00:00", "value": 1.0},
                    {"time": "2024-06-01T02:00:00", "value": 0.0}
                ]
            }],
            "subcatchments": [{
                "id": "S1", "gage": "G1", "outlet": "J1",
                "area": 15.0, "width": 500.0, "slope": 0.01,
                "frac_imperv": 0.5, "n_imperv": 0.012, "n_perv": 0.1,
                "dstore_imperv": 0.05, "dstore_perv": 0.1,
                "pct_zero_storage": 0.25,
                "infiltration": {
                    "model": "horton",
                    "max_rate": 3.0, "min_rate": 0.5,
                    "decay": 4.0, "dry_time": 7.0
                }
            }],
            "nodes": [
                {"id": "J1", "kind": "junction", "invert": 100.0, "full_depth": 10.0},
                {"id": "O1", "kind": "outfall", "boundary": "free", "invert": 99.0}
            ],
            "links": [{
                "id": "C1", "type": "conduit", "from_node": "J1", "to_node": "O1",
                "length": 400.0, "roughness": 0.013,
                "shape": {"shape": "circular", "diameter": 2.0}
            }]
        }"#
        .to_string()
    }

    fn opened_engine() -> Engine {
        let project = Project::from_json(&project_json()).unwrap();
        let dir = std::env::temp_dir();
        Engine::from_project(
            project,
            dir.join("stormflow_test.rpt"),
            dir.join("stormflow_test.out"),
        )
    }

    #[test]
    fn lifecycle_enforces_state_order() {
        let mut engine = opened_engine();
        assert_eq!(engine.state(), EngineState::Opened);
        // stepping before start is an API error
        let err = engine.step().unwrap_err();
        assert_eq!(err.code(), 503);
        assert_eq!(engine.last_error_code(), 503);

        engine.start(false).unwrap();
        assert_eq!(engine.state(), EngineState::Started);
        let elapsed = engine.step().unwrap();
        assert!(elapsed > 0.0);
        engine.end().unwrap();
        assert_eq!(engine.state(), EngineState::Ended);
        engine.report().unwrap();
        engine.close().unwrap();
    }

    #[test]
    fn run_to_completion_returns_zero() {
        let mut engine = opened_engine();
        engine.start(false).unwrap();
        let mut elapsed = engine.step().unwrap();
        let mut guard = 0;
        while elapsed > 0.0 {
            elapsed = engine.step().unwrap();
            guard += 1;
            assert!(guard < 10_000, "simulation failed to terminate");
        }
        assert_eq!(engine.state(), EngineState::Ended);
    }

    #[test]
    fn storm_produces_runoff_and_outflow() {
        let mut engine = opened_engine();
        engine.start(false).unwrap();
        while engine.step().unwrap() > 0.0 {}
        engine.end().unwrap();
        let mb = engine.mass_balance().unwrap();
        assert!(mb.runoff.precip > 0.0);
        assert!(mb.routing.wet_inflow > 0.0);
        assert!(mb.routing.outflow > 0.0);
        // system-wide continuity within the reported tolerance
        assert!(
            mb.routing.pct_error().abs() < 2.0,
            "routing continuity error {}",
            mb.routing.pct_error()
        );
        assert!(
            mb.runoff.pct_error().abs() < 1.0,
            "runoff continuity error {}",
            mb.runoff.pct_error()
        );
    }

    #[test]
    fn gage_override_drives_cumulative_precip() {
        let mut engine = opened_engine();
        engine.start(false).unwrap();
        engine.set_gage_precip(0, 4.0).unwrap();
        // six hours at 4 in/hr over the whole horizon
        while engine.step().unwrap() > 0.0 {}
        let area = engine.project().subcatchments[0].non_lid_area();
        let expected = 4.0 / 43200.0 * 6.0 * 3600.0 * area;
        let mb = engine.mass_balance().unwrap();
        assert_relative_eq!(mb.runoff.precip, expected, max_relative = 0.02);
        // runoff matches precip minus losses within half a percent
        let balance = mb.runoff.precip + mb.runoff.runon
            - mb.runoff.evap
            - mb.runoff.infil
            - mb.runoff.drains;
        let stored = mb.runoff.final_storage; // zero until end()
        assert!(mb.runoff.runoff <= balance - stored + 1e-6);
        engine.end().unwrap();
        let mb = engine.mass_balance().unwrap();
        let residual = (mb.runoff.precip - mb.runoff.evap - mb.runoff.infil
            - mb.runoff.runoff
            - mb.runoff.final_storage)
            .abs();
        assert!(
            residual / mb.runoff.precip < 0.005,
            "override runoff residual {}",
            residual / mb.runoff.precip
        );
    }

    #[test]
    fn stride_covers_the_requested_span() {
        let mut engine = opened_engine();
        engine.start(false).unwrap();
        let elapsed = engine.stride(1800.0).unwrap();
        assert!(elapsed >= 1800.0 * 1000.0);
    }

    #[test]
    fn introspection_maps_names_and_indexes() {
        let engine = opened_engine();
        assert_eq!(engine.count(ObjectKind::Node), 2);
        assert_eq!(engine.index_of(ObjectKind::Node, "o1").unwrap(), 1);
        assert_eq!(engine.object_id(ObjectKind::Link, 0).unwrap(), "C1");
        assert!(engine.object_id(ObjectKind::Link, 9).is_err());
    }

    #[test]
    fn binary_results_are_written_when_requested() {
        let dir = std::env::temp_dir();
        let out = dir.join("stormflow_engine_results.out");
        let project = Project::from_json(&project_json()).unwrap();
        let mut engine =
            Engine::from_project(project, dir.join("stormflow_engine.rpt"), &out);
        engine.start(true).unwrap();
        while engine.step().unwrap() > 0.0 {}
        engine.end().unwrap();
        let bytes = std::fs::read(&out).unwrap();
        assert!(bytes.len() > 64);
        let head = i32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let tail = i32::from_le_bytes(bytes[bytes.len() - 4..].try_into().unwrap());
        assert_eq!(head, crate::output::MAGIC);
        assert_eq!(tail, crate::output::MAGIC);
        std::fs::remove_file(&out).ok();
    }
}
