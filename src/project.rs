//! The project store
//!
//! A [`Project`] owns every model object in typed vectors; all
//! cross-references are resolved to stable indices at open time through
//! per-kind case-insensitive name indexes. The JSON project document
//! maps 1:1 onto this structure; the text-format parser used by the CLI
//! wrapper of the classic engine is an external collaborator that
//! produces the same store.

use crate::controls::ControlRule;
use crate::error::{EngineError, Result};
use crate::gage::{check_shared_series, Gage};
use crate::gwater::{Aquifer, Groundwater};
use crate::index::NameIndex;
use crate::inflow::{DryWeatherInflow, ExternalInflow, RdiiInflow, UnitHydrograph};
use crate::lid::LidProcess;
use crate::link::{Link, LinkKind};
use crate::node::{DividerRule, Node, NodeKind, OutfallBoundary, StorageShape};
use crate::pollut::{Coverage, InitialLoading, Landuse, Pollutant};
use crate::snow::Snowpack;
use crate::subcatch::{OutletRef, Subcatchment};
use crate::table::{Curve, Pattern, TimeSeries};
use crate::treatment::{self, Treatment};
use crate::units::{FlowUnits, UnitConverter};
use crate::xsect::{ForceMainEquation, Transect, Xsect};
use chrono::{NaiveDate, NaiveDateTime};
use log::warn;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Flow routing method.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RouteModel {
    /// no routing: inflows appear instantly at outfalls
    None,
    Steady,
    #[default]
    KinematicWave,
    ExtendedKinematicWave,
    DynamicWave,
}

/// Inertial term damping under dynamic wave.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum InertialDamping {
    None,
    #[default]
    Partial,
    Full,
}

/// Surcharge representation under dynamic wave.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SurchargeMethod {
    #[default]
    Extran,
    Slot,
}

/// Potential evaporation source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum Evaporation {
    #[default]
    None,
    /// constant rate, user units (in/day or mm/day)
    Constant { rate: f64 },
    /// one rate per month, user units
    Monthly { rates: Vec<f64> },
    /// rates from a time series
    Series { series: String },
}

/// Air temperature source for snowmelt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum Temperature {
    #[default]
    None,
    Constant { value: f64 },
    Series { series: String },
}

/// Climate drivers.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Climate {
    #[serde(default)]
    pub evaporation: Evaporation,
    #[serde(default)]
    pub temperature: Temperature,
    /// gage rainfall below this temperature falls as snow, °F
    #[serde(default = "default_divide_temp")]
    pub snow_temp: f64,

    #[serde(skip)]
    pub evap_series: Option<usize>,
    #[serde(skip)]
    pub temp_series: Option<usize>,
}

fn default_divide_temp() -> f64 {
    34.0
}

/// Analysis options, mirroring the classic `[OPTIONS]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    pub flow_units: FlowUnits,
    pub route_model: RouteModel,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub report_start: Option<NaiveDateTime>,
    /// hydrology step during rainfall, s
    pub wet_step: f64,
    /// hydrology step in dry weather, s
    pub dry_step: f64,
    /// routing step, s
    pub route_step: f64,
    /// control-rule evaluation step, s (0 = every routing step)
    pub rule_step: f64,
    /// reporting interval, s
    pub report_step: f64,
    pub allow_ponding: bool,
    pub inertial_damping: InertialDamping,
    pub surcharge_method: SurchargeMethod,
    pub force_main_equation: ForceMainEquation,
    /// limit computed flows to normal flow (dynamic wave)
    pub normal_flow_limited: bool,
    /// Courant factor for variable routing steps (0 disables)
    pub variable_step: f64,
    /// smallest allowed routing step, s
    pub min_route_step: f64,
    /// iteration cap for the dynamic-wave solver
    pub max_trials: usize,
    /// node head convergence tolerance, ft
    pub head_tol: f64,
    /// system flow imbalance reported as steady state, fraction
    pub sys_flow_tol: f64,
    pub lat_flow_tol: f64,
    /// minimum nodal surface area under dynamic wave, ft²
    pub min_surf_area: f64,
    /// worker threads for dynamic-wave loops (0 = rayon default)
    pub num_threads: usize,
    pub skip_steady_state: bool,
    pub ignore_rainfall: bool,
    pub ignore_snowmelt: bool,
    pub ignore_groundwater: bool,
    pub ignore_rdii: bool,
    pub ignore_routing: bool,
    pub ignore_quality: bool,
}

impl Default for Options {
    fn default() -> Self {
        let day = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        Options {
            flow_units: FlowUnits::Cfs,
            route_model: RouteModel::KinematicWave,
            start: day.and_hms_opt(0, 0, 0).unwrap(),
            end: day.and_hms_opt(6, 0, 0).unwrap(),
            report_start: None,
            wet_step: 300.0,
            dry_step: 3600.0,
            route_step: 20.0,
            rule_step: 0.0,
            report_step: 900.0,
            allow_ponding: false,
            inertial_damping: InertialDamping::Partial,
            surcharge_method: SurchargeMethod::Extran,
            force_main_equation: ForceMainEquation::HazenWilliams,
            normal_flow_limited: true,
            variable_step: 0.0,
            min_route_step: 0.5,
            max_trials: 8,
            head_tol: 0.005,
            sys_flow_tol: 0.05,
            lat_flow_tol: 0.05,
            min_surf_area: 12.566,
            num_threads: 0,
            skip_steady_state: false,
            ignore_rainfall: false,
            ignore_snowmelt: false,
            ignore_groundwater: false,
            ignore_rdii: false,
            ignore_routing: false,
            ignore_quality: false,
        }
    }
}

impl Options {
    pub fn validate(&self) -> Result<()> {
        if self.end <= self.start {
            return Err(EngineError::StartDate);
        }
        if let Some(rs) = self.report_start {
            if rs >= self.end {
                return Err(EngineError::ReportDate);
            }
        }
        if self.report_step <= 0.0 || self.route_step <= 0.0 {
            return Err(EngineError::ReportStep);
        }
        Ok(())
    }
}

/// Name indexes for every object kind, rebuilt at open.
#[derive(Debug, Clone, Default)]
pub struct Indexes {
    pub gages: NameIndex,
    pub subcatchments: NameIndex,
    pub nodes: NameIndex,
    pub links: NameIndex,
    pub pollutants: NameIndex,
    pub landuses: NameIndex,
    pub curves: NameIndex,
    pub series: NameIndex,
    pub patterns: NameIndex,
    pub transects: NameIndex,
    pub aquifers: NameIndex,
    pub unit_hydrographs: NameIndex,
    pub snowpacks: NameIndex,
    pub lid_processes: NameIndex,
}

/// The complete model: object stores plus options.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Project {
    pub title: Vec<String>,
    pub options: Options,
    pub climate: Climate,
    pub gages: Vec<Gage>,
    pub subcatchments: Vec<Subcatchment>,
    pub nodes: Vec<Node>,
    pub links: Vec<Link>,
    pub pollutants: Vec<Pollutant>,
    pub landuses: Vec<Landuse>,
    pub coverages: Vec<Coverage>,
    pub loadings: Vec<InitialLoading>,
    pub curves: Vec<Curve>,
    pub series: Vec<TimeSeries>,
    pub patterns: Vec<Pattern>,
    pub transects: Vec<Transect>,
    pub aquifers: Vec<Aquifer>,
    pub groundwater: Vec<Groundwater>,
    pub unit_hydrographs: Vec<UnitHydrograph>,
    pub snowpacks: Vec<Snowpack>,
    pub lid_processes: Vec<LidProcess>,
    pub external_inflows: Vec<ExternalInflow>,
    pub dwf_inflows: Vec<DryWeatherInflow>,
    pub rdii_inflows: Vec<RdiiInflow>,
    pub treatments: Vec<Treatment>,
    pub controls: Vec<ControlRule>,

    #[serde(skip)]
    pub indexes: Indexes,
    #[serde(skip)]
    pub units: UnitConverter,
    /// groundwater records per subcatchment, resolved at open
    #[serde(skip)]
    pub gw_of_subcatch: Vec<Option<usize>>,
}

impl Project {
    /// Materialize a project from its JSON document.
    pub fn from_json(json: &str) -> Result<Project> {
        let mut project: Project = serde_json::from_str(json)
            .map_err(|e| EngineError::InputFormat(e.to_string()))?;
        project.open()?;
        Ok(project)
    }

    /// Load and open a project file.
    pub fn from_file(path: &Path) -> Result<Project> {
        let json = fs::read_to_string(path).map_err(|e| EngineError::InpFile {
            path: path.to_path_buf(),
            source: e,
        })?;
        Project::from_json(&json)
    }

    /// Build the name indexes, convert user units to internal, resolve
    /// every cross-reference, and validate invariants. Idempotent only in
    /// the sense that it is called exactly once per open.
    pub fn open(&mut self) -> Result<()> {
        self.options.validate()?;
        self.units = UnitConverter::new(self.options.flow_units);
        self.convert_units();
        self.build_indexes()?;
        self.resolve_tables()?;
        self.resolve_hydrology()?;
        self.resolve_network()?;
        self.resolve_quality()?;
        self.check_topology()?;
        Ok(())
    }

    fn build_indexes(&mut self) -> Result<()> {
        let ix = &mut self.indexes;
        for (i, g) in self.gages.iter().enumerate() {
            ix.gages.insert(&g.id, i)?;
        }
        for (i, s) in self.subcatchments.iter().enumerate() {
            ix.subcatchments.insert(&s.id, i)?;
        }
        for (i, n) in self.nodes.iter().enumerate() {
            ix.nodes.insert(&n.id, i)?;
        }
        for (i, l) in self.links.iter().enumerate() {
            ix.links.insert(&l.id, i)?;
        }
        for (i, p) in self.pollutants.iter().enumerate() {
            ix.pollutants.insert(&p.id, i)?;
        }
        for (i, l) in self.landuses.iter().enumerate() {
            ix.landuses.insert(&l.id, i)?;
        }
        for (i, c) in self.curves.iter().enumerate() {
            ix.curves.insert(&c.id, i)?;
        }
        for (i, t) in self.series.iter().enumerate() {
            ix.series.insert(&t.id, i)?;
        }
        for (i, p) in self.patterns.iter().enumerate() {
            ix.patterns.insert(&p.id, i)?;
        }
        for (i, t) in self.transects.iter().enumerate() {
            ix.transects.insert(&t.id, i)?;
        }
        for (i, a) in self.aquifers.iter().enumerate() {
            ix.aquifers.insert(&a.id, i)?;
        }
        for (i, u) in self.unit_hydrographs.iter().enumerate() {
            ix.unit_hydrographs.insert(&u.id, i)?;
        }
        for (i, s) in self.snowpacks.iter().enumerate() {
            ix.snowpacks.insert(&s.id, i)?;
        }
        for (i, p) in self.lid_processes.iter().enumerate() {
            ix.lid_processes.insert(&p.id, i)?;
        }
        Ok(())
    }

    /// Convert user-unit dimensions to the internal foot-second system.
    /// Rates read repeatedly at runtime (rain series, evaporation) are
    /// converted where they are read instead.
    fn convert_units(&mut self) {
        use crate::infil::InfilParams;
        use crate::units::Quantity::*;
        let uc = self.units;
        for s in &mut self.subcatchments {
            s.area = uc.to_internal(LandArea, s.area);
            s.width = uc.to_internal(Length, s.width);
            s.dstore_imperv = uc.to_internal(RainDepth, s.dstore_imperv);
            s.dstore_perv = uc.to_internal(RainDepth, s.dstore_perv);
            match &mut s.infiltration {
                InfilParams::Horton {
                    max_rate,
                    min_rate,
                    decay,
                    dry_time,
                    max_volume,
                }
                | InfilParams::ModHorton {
                    max_rate,
                    min_rate,
                    decay,
                    dry_time,
                    max_volume,
                } => {
                    *max_rate = uc.to_internal(Rainfall, *max_rate);
                    *min_rate = uc.to_internal(Rainfall, *min_rate);
                    *decay /= 3600.0; // 1/hr to 1/s
                    *dry_time *= 86400.0; // days to s
                    *max_volume = uc.to_internal(RainDepth, *max_volume);
                }
                InfilParams::GreenAmpt { suction, ksat, .. }
                | InfilParams::ModGreenAmpt { suction, ksat, .. } => {
                    *suction = uc.to_internal(RainDepth, *suction);
                    *ksat = uc.to_internal(Rainfall, *ksat);
                }
                InfilParams::CurveNumber { dry_time, .. } => {
                    *dry_time *= 86400.0;
                }
            }
            for u in &mut s.lid_units {
                u.area = uc.to_internal(Length, uc.to_internal(Length, u.area));
                u.full_width = uc.to_internal(Length, u.full_width);
            }
        }
        for p in &mut self.lid_processes {
            if let Some(l) = &mut p.surface {
                l.thickness = uc.to_internal(RainDepth, l.thickness);
            }
            if let Some(l) = &mut p.pavement {
                l.thickness = uc.to_internal(RainDepth, l.thickness);
                l.ksat = uc.to_internal(Rainfall, l.ksat);
            }
            if let Some(l) = &mut p.soil {
                l.thickness = uc.to_internal(RainDepth, l.thickness);
                l.ksat = uc.to_internal(Rainfall, l.ksat);
                l.suction = uc.to_internal(RainDepth, l.suction);
            }
            if let Some(l) = &mut p.storage {
                l.thickness = uc.to_internal(RainDepth, l.thickness);
                l.ksat = uc.to_internal(Rainfall, l.ksat);
            }
            if let Some(l) = &mut p.drain {
                l.offset = uc.to_internal(RainDepth, l.offset);
                l.h_open = uc.to_internal(RainDepth, l.h_open);
                l.h_close = uc.to_internal(RainDepth, l.h_close);
                l.delay *= 3600.0; // hours to s
            }
            if let Some(l) = &mut p.drainmat {
                l.thickness = uc.to_internal(RainDepth, l.thickness);
            }
        }
        for a in &mut self.aquifers {
            a.ksat = uc.to_internal(Rainfall, a.ksat);
            a.deep_seepage = uc.to_internal(Rainfall, a.deep_seepage);
            a.bottom_elev = uc.to_internal(Length, a.bottom_elev);
            a.water_table = uc.to_internal(Length, a.water_table);
        }
        for gw in &mut self.groundwater {
            gw.surface_elev = uc.to_internal(Length, gw.surface_elev);
            gw.channel_bottom = uc.to_internal(Length, gw.channel_bottom);
        }
        for sp in &mut self.snowpacks {
            for p in [&mut sp.plowable, &mut sp.imperv, &mut sp.perv] {
                p.dhm = uc.to_internal(Rainfall, p.dhm);
                p.sd100 = uc.to_internal(RainDepth, p.sd100);
            }
        }
        for inflow in &mut self.external_inflows {
            if matches!(inflow.kind, crate::inflow::InflowKind::Flow) {
                inflow.baseline = uc.to_internal(Flow, inflow.baseline);
                inflow.scale = uc.to_internal(Flow, inflow.scale);
            }
        }
        for dwf in &mut self.dwf_inflows {
            if dwf.pollutant.is_none() {
                dwf.baseline = uc.to_internal(Flow, dwf.baseline);
            }
        }
        for rdii in &mut self.rdii_inflows {
            rdii.area = uc.to_internal(LandArea, rdii.area);
        }
        for uh in &mut self.unit_hydrographs {
            // times to peak arrive in hours
            uh.short.t *= 3600.0;
            uh.medium.t *= 3600.0;
            uh.long.t *= 3600.0;
        }
        for n in &mut self.nodes {
            n.invert = uc.to_internal(Length, n.invert);
            n.full_depth = uc.to_internal(Length, n.full_depth);
            n.surcharge_depth = uc.to_internal(Length, n.surcharge_depth);
            n.init_depth = uc.to_internal(Length, n.init_depth);
            // ponded area arrives in ft²/m²
            if matches!(uc.system, crate::units::UnitSystem::SI) {
                n.ponded_area *= 0.3048 * 0.3048;
            }
        }
        for l in &mut self.links {
            l.offset1 = uc.to_internal(Length, l.offset1);
            l.offset2 = uc.to_internal(Length, l.offset2);
            l.init_flow = uc.to_internal(Flow, l.init_flow);
            if l.max_flow > 0.0 {
                l.max_flow = uc.to_internal(Flow, l.max_flow);
            }
            if let LinkKind::Conduit(ref mut c) = l.kind {
                c.length = uc.to_internal(Length, c.length);
            }
        }
    }

    fn resolve_tables(&mut self) -> Result<()> {
        for c in &self.curves {
            c.validate()?;
        }
        for t in &self.series {
            t.validate()?;
        }
        for p in &self.patterns {
            p.validate()?;
        }
        for t in &self.transects {
            t.validate()?;
        }
        Ok(())
    }

    fn resolve_hydrology(&mut self) -> Result<()> {
        for g in &mut self.gages {
            g.validate()?;
            let sref = g.series_ref().map(str::to_string);
            if let Some(series) = sref {
                g.series_index = Some(self.indexes.series.find(&series).ok_or_else(|| {
                    EngineError::GageSeries(g.id.clone())
                })?);
            }
        }
        check_shared_series(&self.gages)?;
        // co-gages: gages sharing the same series index
        for i in 0..self.gages.len() {
            for j in 0..i {
                if self.gages[i].series_index.is_some()
                    && self.gages[i].series_index == self.gages[j].series_index
                {
                    self.gages[i].co_gage = Some(j);
                    break;
                }
            }
        }

        for aq in &self.aquifers {
            aq.validate()?;
        }
        for sp in &self.snowpacks {
            sp.validate()?;
        }
        for uh in &mut self.unit_hydrographs {
            uh.validate()?;
            uh.gage_index = self
                .indexes
                .gages
                .find(&uh.gage)
                .ok_or_else(|| EngineError::UndefinedName {
                    kind: "gage",
                    name: uh.gage.clone(),
                })?;
        }
        for p in &mut self.lid_processes {
            p.validate()?;
        }

        self.gw_of_subcatch = vec![None; self.subcatchments.len()];
        for (gi, gw) in self.groundwater.iter_mut().enumerate() {
            gw.aquifer_index =
                self.indexes
                    .aquifers
                    .find(&gw.aquifer)
                    .ok_or_else(|| EngineError::UndefinedName {
                        kind: "aquifer",
                        name: gw.aquifer.clone(),
                    })?;
            gw.node_index = self
                .indexes
                .nodes
                .find(&gw.node)
                .ok_or_else(|| EngineError::UndefinedName {
                    kind: "node",
                    name: gw.node.clone(),
                })?;
            let si = self
                .indexes
                .subcatchments
                .find(&gw.subcatch)
                .ok_or_else(|| EngineError::UndefinedName {
                    kind: "subcatchment",
                    name: gw.subcatch.clone(),
                })?;
            self.gw_of_subcatch[si] = Some(gi);
        }

        let nsub = self.subcatchments.len();
        for si in 0..nsub {
            // subcatchment gage and outlet
            let gage_name = self.subcatchments[si].gage.clone();
            let gage_index = self
                .indexes
                .gages
                .find(&gage_name)
                .ok_or_else(|| EngineError::UndefinedName {
                    kind: "gage",
                    name: gage_name,
                })?;
            self.gages[gage_index].is_used = true;
            self.subcatchments[si].gage_index = gage_index;

            let outlet = self.subcatchments[si].outlet.clone();
            self.subcatchments[si].outlet_ref = match outlet {
                None => OutletRef::Recycle,
                Some(name) => {
                    if name.eq_ignore_ascii_case(&self.subcatchments[si].id) {
                        OutletRef::Recycle
                    } else if let Some(ni) = self.indexes.nodes.find(&name) {
                        OutletRef::Node(ni)
                    } else if let Some(oi) = self.indexes.subcatchments.find(&name) {
                        OutletRef::Subcatch(oi)
                    } else {
                        return Err(EngineError::SubcatchOutlet(
                            self.subcatchments[si].id.clone(),
                        ));
                    }
                }
            };

            // snowpack reference
            if let Some(ref sp) = self.subcatchments[si].snowpack {
                if self.indexes.snowpacks.find(sp).is_none() {
                    return Err(EngineError::UndefinedName {
                        kind: "snowpack",
                        name: sp.clone(),
                    });
                }
            }

            // LID units
            let ids: Vec<String> = self.subcatchments[si]
                .lid_units
                .iter()
                .map(|u| u.process.clone())
                .collect();
            for (ui, pid) in ids.iter().enumerate() {
                let pi = self.indexes.lid_processes.find(pid).ok_or_else(|| {
                    EngineError::UndefinedName {
                        kind: "LID process",
                        name: pid.clone(),
                    }
                })?;
                self.subcatchments[si].lid_units[ui].process_index = pi;
                let drain_to = self.subcatchments[si].lid_units[ui].drain_to.clone();
                match drain_to {
                    crate::lid::DrainDest::None => {}
                    crate::lid::DrainDest::Node(ref n) => {
                        let ni = self.indexes.nodes.find(n).ok_or_else(|| {
                            EngineError::UndefinedName {
                                kind: "node",
                                name: n.clone(),
                            }
                        })?;
                        self.subcatchments[si].lid_units[ui].drain_node = Some(ni);
                    }
                    crate::lid::DrainDest::Subcatch(ref s) => {
                        let oi = self.indexes.subcatchments.find(s).ok_or_else(|| {
                            EngineError::UndefinedName {
                                kind: "subcatchment",
                                name: s.clone(),
                            }
                        })?;
                        self.subcatchments[si].lid_units[ui].drain_subcatch = Some(oi);
                    }
                }
            }
            self.subcatchments[si].validate()?;
        }

        Ok(())
    }

    fn resolve_network(&mut self) -> Result<()> {
        // link endpoints, cross sections, conduit geometry
        for li in 0..self.links.len() {
            let (from, to) = (
                self.links[li].from_node.clone(),
                self.links[li].to_node.clone(),
            );
            let n1 = self
                .indexes
                .nodes
                .find(&from)
                .ok_or_else(|| EngineError::UndefinedName {
                    kind: "node",
                    name: from,
                })?;
            let n2 = self
                .indexes
                .nodes
                .find(&to)
                .ok_or_else(|| EngineError::UndefinedName {
                    kind: "node",
                    name: to,
                })?;
            self.links[li].node1 = n1;
            self.links[li].node2 = n2;
            self.links[li].validate()?;

            // build the cross section
            if let Some(spec) = self.links[li].shape.clone() {
                let transect = spec
                    .transect_ref()
                    .map(|name| {
                        self.indexes.transects.find(name).map(|i| &self.transects[i]).ok_or_else(
                            || EngineError::UndefinedName {
                                kind: "transect",
                                name: name.to_string(),
                            },
                        )
                    })
                    .transpose()?;
                let curve = spec
                    .curve_ref()
                    .map(|name| {
                        self.indexes.curves.find(name).map(|i| &self.curves[i]).ok_or_else(
                            || EngineError::NoCurve(self.links[li].id.clone()),
                        )
                    })
                    .transpose()?;
                self.links[li].xsect = Xsect::build(&spec, transect, curve)?;
            } else {
                self.links[li].xsect = Xsect::dummy();
            }

            let (i1, i2) = (
                self.nodes[self.links[li].node1].invert,
                self.nodes[self.links[li].node2].invert,
            );
            self.links[li].compute_conduit_geometry(i1, i2)?;

            // regulator curve references
            let id = self.links[li].id.clone();
            match &mut self.links[li].kind {
                LinkKind::Pump(p) => {
                    if let Some(ref curve) = p.curve {
                        p.curve_index = Some(self.indexes.curves.find(curve).ok_or_else(
                            || EngineError::NoCurve(id.clone()),
                        )?);
                    }
                }
                LinkKind::Weir(w) => {
                    if let Some(ref curve) = w.coeff_curve {
                        w.curve_index = Some(self.indexes.curves.find(curve).ok_or_else(
                            || EngineError::NoCurve(id.clone()),
                        )?);
                    }
                }
                LinkKind::Outlet(o) => {
                    if let crate::link::OutletRelation::Rating { ref curve } = o.relation {
                        o.curve_index = Some(self.indexes.curves.find(curve).ok_or_else(
                            || EngineError::NoCurve(id.clone()),
                        )?);
                    }
                }
                _ => {}
            }
        }

        // node connectivity and crown elevations
        for n in &mut self.nodes {
            n.in_links.clear();
            n.out_links.clear();
            n.crown_elev = n.invert;
        }
        for (li, l) in self.links.iter().enumerate() {
            self.nodes[l.node1].out_links.push(li);
            self.nodes[l.node2].in_links.push(li);
            if l.is_conduit() {
                let crown1 = l.crown_elev(self.nodes[l.node1].invert, l.offset1);
                let crown2 = l.crown_elev(self.nodes[l.node2].invert, l.offset2);
                let n1 = &mut self.nodes[l.node1];
                n1.crown_elev = n1.crown_elev.max(crown1);
                let n2 = &mut self.nodes[l.node2];
                n2.crown_elev = n2.crown_elev.max(crown2);
            }
        }

        // node payload references and invariants
        for ni in 0..self.nodes.len() {
            self.nodes[ni].validate()?;
            let id = self.nodes[ni].id.clone();
            match &self.nodes[ni].kind {
                NodeKind::Outfall(_) => {
                    let total =
                        self.nodes[ni].in_links.len() + self.nodes[ni].out_links.len();
                    if total != 1 {
                        return Err(EngineError::Outfall(id));
                    }
                }
                NodeKind::Divider(_) => {
                    if self.nodes[ni].out_links.len() != 2 {
                        return Err(EngineError::DividerLinks(id));
                    }
                }
                _ => {}
            }
            // resolve payload names
            let node = &mut self.nodes[ni];
            match &mut node.kind {
                NodeKind::Outfall(of) => {
                    match &of.boundary {
                        OutfallBoundary::Tidal { curve } => {
                            of.curve_index =
                                Some(self.indexes.curves.find(curve).ok_or_else(|| {
                                    EngineError::NoCurve(id.clone())
                                })?);
                        }
                        OutfallBoundary::Series { series } => {
                            of.series_index =
                                Some(self.indexes.series.find(series).ok_or_else(|| {
                                    EngineError::UndefinedName {
                                        kind: "time series",
                                        name: series.clone(),
                                    }
                                })?);
                        }
                        _ => {}
                    }
                    if let Some(ref s) = of.route_to {
                        of.route_to_index =
                            Some(self.indexes.subcatchments.find(s).ok_or_else(|| {
                                EngineError::UndefinedName {
                                    kind: "subcatchment",
                                    name: s.clone(),
                                }
                            })?);
                    }
                }
                NodeKind::Storage(st) => {
                    if let StorageShape::Tabular { curve } = &st.shape {
                        st.curve_index =
                            Some(self.indexes.curves.find(curve).ok_or_else(|| {
                                EngineError::NoCurve(id.clone())
                            })?);
                    }
                }
                NodeKind::Divider(dv) => {
                    let li = self.indexes.links.find(&dv.link).ok_or_else(|| {
                        EngineError::DividerLink(id.clone())
                    })?;
                    dv.link_index = Some(li);
                    if let DividerRule::Tabular { curve } = &dv.rule {
                        dv.curve_index =
                            Some(self.indexes.curves.find(curve).ok_or_else(|| {
                                EngineError::NoCurve(id.clone())
                            })?);
                    }
                }
                NodeKind::Junction => {}
            }
        }

        // divider diversion links must leave the divider
        for ni in 0..self.nodes.len() {
            if let NodeKind::Divider(dv) = &self.nodes[ni].kind {
                if let Some(li) = dv.link_index {
                    if self.links[li].node1 != ni {
                        return Err(EngineError::DividerLink(self.nodes[ni].id.clone()));
                    }
                }
            }
        }

        // regulators other than outlets must ride on storage or junction
        // nodes; pumps draw from any node, weirs and orifices from any,
        // so only flag regulators that leave an outfall
        for l in &self.links {
            if l.kind.is_regulator() && self.nodes[l.node1].is_outfall() {
                return Err(EngineError::Regulator(l.id.clone()));
            }
        }

        // inflow references
        for inflow in &mut self.external_inflows {
            inflow.node_index = self
                .indexes
                .nodes
                .find(&inflow.node)
                .ok_or_else(|| EngineError::UndefinedName {
                    kind: "node",
                    name: inflow.node.clone(),
                })?;
            if let Some(ref series) = inflow.series {
                inflow.series_index =
                    Some(self.indexes.series.find(series).ok_or_else(|| {
                        EngineError::ApiSeriesIndex
                    })?);
            }
            if let Some(ref pattern) = inflow.pattern {
                inflow.pattern_index =
                    Some(self.indexes.patterns.find(pattern).ok_or_else(|| {
                        EngineError::ApiPatternIndex
                    })?);
            }
            if let Some(ref pollut) = inflow.pollutant {
                inflow.pollut_index =
                    Some(self.indexes.pollutants.find(pollut).ok_or_else(|| {
                        EngineError::ApiPollutIndex
                    })?);
            }
        }
        for dwf in &mut self.dwf_inflows {
            dwf.node_index = self
                .indexes
                .nodes
                .find(&dwf.node)
                .ok_or_else(|| EngineError::UndefinedName {
                    kind: "node",
                    name: dwf.node.clone(),
                })?;
            if let Some(ref pollut) = dwf.pollutant {
                dwf.pollut_index =
                    Some(self.indexes.pollutants.find(pollut).ok_or_else(|| {
                        EngineError::ApiPollutIndex
                    })?);
            }
            dwf.pattern_indexes = dwf
                .patterns
                .iter()
                .map(|p| {
                    self.indexes
                        .patterns
                        .find(p)
                        .ok_or(EngineError::ApiPatternIndex)
                })
                .collect::<Result<Vec<_>>>()?;
        }
        for rdii in &mut self.rdii_inflows {
            rdii.validate()?;
            rdii.node_index = self
                .indexes
                .nodes
                .find(&rdii.node)
                .ok_or_else(|| EngineError::UndefinedName {
                    kind: "node",
                    name: rdii.node.clone(),
                })?;
            rdii.uh_index = self
                .indexes
                .unit_hydrographs
                .find(&rdii.unit_hydrograph)
                .ok_or_else(|| EngineError::UndefinedName {
                    kind: "unit hydrograph",
                    name: rdii.unit_hydrograph.clone(),
                })?;
        }
        Ok(())
    }

    fn resolve_quality(&mut self) -> Result<()> {
        for pi in 0..self.pollutants.len() {
            crate::pollut::validate_pollutant(&self.pollutants[pi])?;
            if let Some(co) = self.pollutants[pi].co_pollutant.clone() {
                let idx = self.indexes.pollutants.find(&co).ok_or_else(|| {
                    EngineError::UndefinedName {
                        kind: "pollutant",
                        name: co,
                    }
                })?;
                self.pollutants[pi].co_index = Some(idx);
            }
        }
        for lu in &mut self.landuses {
            for load in &mut lu.loads {
                load.pollut_index = self
                    .indexes
                    .pollutants
                    .find(&load.pollutant)
                    .ok_or_else(|| EngineError::UndefinedName {
                        kind: "pollutant",
                        name: load.pollutant.clone(),
                    })?;
            }
        }
        for cov in &mut self.coverages {
            cov.subcatch_index = self
                .indexes
                .subcatchments
                .find(&cov.subcatch)
                .ok_or_else(|| EngineError::UndefinedName {
                    kind: "subcatchment",
                    name: cov.subcatch.clone(),
                })?;
            cov.landuse_index = self
                .indexes
                .landuses
                .find(&cov.landuse)
                .ok_or_else(|| EngineError::UndefinedName {
                    kind: "land use",
                    name: cov.landuse.clone(),
                })?;
        }
        for load in &mut self.loadings {
            load.subcatch_index = self
                .indexes
                .subcatchments
                .find(&load.subcatch)
                .ok_or_else(|| EngineError::UndefinedName {
                    kind: "subcatchment",
                    name: load.subcatch.clone(),
                })?;
            load.pollut_index = self
                .indexes
                .pollutants
                .find(&load.pollutant)
                .ok_or_else(|| EngineError::UndefinedName {
                    kind: "pollutant",
                    name: load.pollutant.clone(),
                })?;
        }

        // compile treatment expressions and prove the DAG is acyclic
        let names: Vec<String> = self.pollutants.iter().map(|p| p.id.clone()).collect();
        let lookup = move |name: &str| {
            names
                .iter()
                .position(|n| n.eq_ignore_ascii_case(name))
        };
        for t in &mut self.treatments {
            t.node_index = self
                .indexes
                .nodes
                .find(&t.node)
                .ok_or_else(|| EngineError::UndefinedName {
                    kind: "node",
                    name: t.node.clone(),
                })?;
            t.pollut_index = self
                .indexes
                .pollutants
                .find(&t.pollutant)
                .ok_or_else(|| EngineError::UndefinedName {
                    kind: "pollutant",
                    name: t.pollutant.clone(),
                })?;
            t.program = Some(treatment::compile(&t.expr, &lookup).map_err(|_| {
                EngineError::TreatmentExpr(t.pollutant.clone(), t.node.clone())
            })?);
        }
        for ni in 0..self.nodes.len() {
            let at_node: Vec<&Treatment> = self
                .treatments
                .iter()
                .filter(|t| t.node_index == ni)
                .collect();
            if !at_node.is_empty() {
                treatment::evaluation_order(&self.nodes[ni].id, &at_node)?;
            }
        }

        for rule in &self.controls {
            rule.validate()?;
        }
        Ok(())
    }

    /// Topology checks shared by all routing models, plus the acyclicity
    /// requirement of the steady and kinematic kernels.
    fn check_topology(&self) -> Result<()> {
        if !self.links.is_empty() && !self.nodes.iter().any(|n| n.is_outfall()) {
            return Err(EngineError::NoOutlets);
        }
        let kinematic = matches!(
            self.options.route_model,
            RouteModel::Steady | RouteModel::KinematicWave | RouteModel::ExtendedKinematicWave
        );
        if kinematic {
            for n in &self.nodes {
                if !n.is_outfall() && !n.is_divider() && n.out_links.len() > 1 {
                    return Err(EngineError::MultipleOutlets(n.id.clone()));
                }
            }
            self.topo_order()?;
        }
        Ok(())
    }

    /// Topological order of links for the steady/kinematic sweeps; errors
    /// on a cycle.
    pub fn topo_order(&self) -> Result<Vec<usize>> {
        let mut in_degree: Vec<usize> = self
            .nodes
            .iter()
            .map(|n| n.in_links.len())
            .collect();
        let mut ready: Vec<usize> = (0..self.nodes.len())
            .filter(|&ni| in_degree[ni] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.links.len());
        let mut seen_nodes = 0;
        while let Some(ni) = ready.pop() {
            seen_nodes += 1;
            for &li in &self.nodes[ni].out_links {
                order.push(li);
                let dn = self.links[li].node2;
                in_degree[dn] -= 1;
                if in_degree[dn] == 0 {
                    ready.push(dn);
                }
            }
        }
        if seen_nodes != self.nodes.len() {
            let cyclic = self
                .links
                .iter()
                .find(|l| !order.contains(&self.indexes.links.find(&l.id).unwrap_or(usize::MAX)))
                .map(|l| l.id.clone())
                .unwrap_or_default();
            return Err(EngineError::NetworkLoop(cyclic));
        }
        Ok(order)
    }

    /// Pollutant count, used to size per-element quality vectors.
    pub fn npollut(&self) -> usize {
        self.pollutants.len()
    }

    /// Evaporation rate at `t`, internal ft/s.
    pub fn evap_rate(&self, t: NaiveDateTime) -> f64 {
        use crate::units::Quantity;
        let user = match &self.climate.evaporation {
            Evaporation::None => 0.0,
            Evaporation::Constant { rate } => *rate,
            Evaporation::Monthly { rates } => {
                use chrono::Datelike;
                rates
                    .get(t.month0() as usize)
                    .copied()
                    .unwrap_or(0.0)
            }
            Evaporation::Series { series } => self
                .indexes
                .series
                .find(series)
                .map(|i| self.series[i].interpolate(t))
                .unwrap_or(0.0),
        };
        self.units.to_internal(Quantity::EvapRate, user)
    }

    /// Air temperature at `t`, °F, if climate data exists.
    pub fn air_temp(&self, t: NaiveDateTime) -> Option<f64> {
        match &self.climate.temperature {
            Temperature::None => None,
            Temperature::Constant { value } => Some(self.units.to_internal(
                crate::units::Quantity::Temperature,
                *value,
            )),
            Temperature::Series { series } => self.indexes.series.find(series).map(|i| {
                self.units
                    .to_internal(crate::units::Quantity::Temperature, self.series[i].interpolate(t))
            }),
        }
    }

    /// Log a validation warning that does not stop the run.
    pub fn warn_unused(&self) {
        for g in &self.gages {
            if !g.is_used {
                warn!("rain gage {} is not used by any subcatchment", g.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json() -> String {
        r#"{
            "options": {
                "flow_units": "CFS",
                "route_model": "kinematic-wave",
                "start": "2024-06-01T00:00:00",
                "end": "2024-06-01T06:00:00"
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
                "length": 400.0, "roughness": 0.01,
                "shape": {"shape": "circular", "diameter": 2.0}
            }]
        }"#
        .to_string()
    }

    #[test]
    fn minimal_project_opens_and_links_up() {
        let p = Project::from_json(&minimal_json()).unwrap();
        assert_eq!(p.indexes.nodes.find("j1"), Some(0));
        assert_eq!(p.subcatchments[0].gage_index, 0);
        assert!(matches!(
            p.subcatchments[0].outlet_ref,
            OutletRef::Node(0)
        ));
        // 15 acres became ft²
        assert!((p.subcatchments[0].area - 15.0 * 43560.0).abs() / (15.0 * 43560.0) < 1e-3);
        assert_eq!(p.nodes[0].out_links, vec![0]);
        assert_eq!(p.nodes[1].in_links, vec![0]);
        assert!(p.links[0].xsect.afull > 0.0);
    }

    #[test]
    fn duplicate_names_fail_to_open() {
        let json = minimal_json().replace("\"id\": \"O1\"", "\"id\": \"J1\"");
        assert!(matches!(
            Project::from_json(&json),
            Err(EngineError::DuplicateName(_))
        ));
    }

    #[test]
    fn unknown_outlet_fails_to_open() {
        let json = minimal_json().replace("\"outlet\": \"J1\"", "\"outlet\": \"NOPE\"");
        assert!(matches!(
            Project::from_json(&json),
            Err(EngineError::SubcatchOutlet(_))
        ));
    }

    #[test]
    fn outfall_with_two_links_is_rejected() {
        let mut json: serde_json::Value =
            serde_json::from_str(&minimal_json()).unwrap();
        let extra = serde_json::json!({
            "id": "C2", "type": "conduit", "from_node": "J1", "to_node": "O1",
            "length": 300.0, "roughness": 0.013,
            "shape": {"shape": "circular", "diameter": 1.5}
        });
        json["links"].as_array_mut().unwrap().push(extra);
        let text = serde_json::to_string(&json).unwrap();
        assert!(matches!(
            Project::from_json(&text),
            Err(EngineError::Outfall(_))
        ));
    }
}

