//! Links of the drainage network
//!
//! Links connect two nodes and carry one of five payloads: conduit,
//! pump, orifice, weir, or outlet. Conduits are the only links with real
//! geometry; the others are regulators whose flow follows a head
//! relation and whose `setting` can be moved by control rules.
//!
//! Lengths and heads are ft, flows cfs.

use crate::error::{EngineError, Result};
use crate::table::Curve;
use crate::units::{GRAVITY, PHI};
use crate::xsect::{ShapeSpec, Xsect};
use serde::{Deserialize, Serialize};

/// Minimum conduit slope used when the profile is nearly flat.
pub const MIN_SLOPE: f64 = 1.0e-5;

/// Flow regime tag assigned to every conduit on every step.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum FlowClass {
    #[default]
    Dry,
    UpDry,
    DnDry,
    Subcritical,
    Supercritical,
    UpCritical,
    DnCritical,
    UpFull,
    DnFull,
    AllFull,
}

impl FlowClass {
    pub const ALL: [FlowClass; 10] = [
        FlowClass::Dry,
        FlowClass::UpDry,
        FlowClass::DnDry,
        FlowClass::Subcritical,
        FlowClass::Supercritical,
        FlowClass::UpCritical,
        FlowClass::DnCritical,
        FlowClass::UpFull,
        FlowClass::DnFull,
        FlowClass::AllFull,
    ];

    pub fn index(self) -> usize {
        Self::ALL.iter().position(|&c| c == self).unwrap()
    }
}

/// Conduit payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConduitData {
    /// conduit length, ft
    pub length: f64,
    /// Manning roughness (or force-main coefficient via the section)
    pub roughness: f64,
    #[serde(default = "one_barrel")]
    pub barrels: u32,
    /// entrance / exit / average minor loss coefficients
    #[serde(default)]
    pub loss_inlet: f64,
    #[serde(default)]
    pub loss_outlet: f64,
    #[serde(default)]
    pub loss_avg: f64,
    /// seepage rate through the wetted perimeter, ft/s
    #[serde(default)]
    pub seepage: f64,
    #[serde(default)]
    pub flap_gate: bool,

    // --- derived at project open ---
    #[serde(skip)]
    pub slope: f64,
    /// Manning conveyance factor: PHI/n · Afull · Rfull^⅔
    #[serde(skip)]
    pub beta: f64,
    /// full-flow capacity at the bed slope, cfs per barrel
    #[serde(skip)]
    pub qfull: f64,
    /// gravity wave celerity at full depth, ft/s
    #[serde(skip)]
    pub full_celerity: f64,
}

fn one_barrel() -> u32 {
    1
}

/// How a pump's curve maps its driver to flow.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PumpKind {
    /// flow steps with wet-well volume
    Volume,
    /// flow steps with inlet depth
    #[default]
    Depth,
    /// flow varies continuously with delivered head
    Head,
    /// flow varies continuously with inlet depth
    ContinuousDepth,
    /// outflow equals inflow
    Ideal,
}

/// Pump payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PumpData {
    #[serde(default)]
    pub kind: PumpKind,
    #[serde(default)]
    pub curve: Option<String>,
    /// inlet depth that switches the pump on, ft
    #[serde(default)]
    pub startup_depth: f64,
    /// inlet depth that switches the pump off, ft
    #[serde(default)]
    pub shutoff_depth: f64,
    /// pump starts the simulation running
    #[serde(default = "yes")]
    pub init_on: bool,

    #[serde(skip)]
    pub curve_index: Option<usize>,
}

fn yes() -> bool {
    true
}

/// Orifice orientation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OrificeKind {
    #[default]
    Side,
    Bottom,
}

/// Orifice payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrificeData {
    #[serde(default)]
    pub kind: OrificeKind,
    /// discharge coefficient
    pub coeff: f64,
    #[serde(default)]
    pub flap_gate: bool,
    /// seconds for the gate to move full range under control
    #[serde(default)]
    pub open_close_time: f64,
}

/// Weir crest form.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum WeirKind {
    #[default]
    Transverse,
    Sideflow,
    VNotch,
    Trapezoidal,
    Roadway,
}

/// Weir payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WeirData {
    #[serde(default)]
    pub kind: WeirKind,
    /// discharge coefficient for the rectangular part
    pub coeff: f64,
    /// discharge coefficient for the triangular sides (trapezoidal)
    #[serde(default)]
    pub end_coeff: f64,
    /// number of end contractions
    #[serde(default)]
    pub end_contractions: u32,
    /// side slope of the notch, run per rise
    #[serde(default)]
    pub side_slope: f64,
    #[serde(default)]
    pub flap_gate: bool,
    /// weir can pressurize and act as an orifice
    #[serde(default)]
    pub can_surcharge: bool,
    /// optional discharge-coefficient curve (head → coeff)
    #[serde(default)]
    pub coeff_curve: Option<String>,

    #[serde(skip)]
    pub curve_index: Option<usize>,
}

/// Outlet head-flow relation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "relation", rename_all = "lowercase")]
pub enum OutletRelation {
    /// flow = coeff·head^expon
    Power { coeff: f64, expon: f64 },
    /// flow from a rating curve
    Rating { curve: String },
}

/// Outlet payload: a user-defined head-discharge device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutletData {
    #[serde(flatten)]
    pub relation: OutletRelation,
    /// head measured from water surface (true) or above the offset (false)
    #[serde(default)]
    pub head_is_difference: bool,
    #[serde(default)]
    pub flap_gate: bool,

    #[serde(skip)]
    pub curve_index: Option<usize>,
}

/// Kind-specific payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LinkKind {
    Conduit(ConduitData),
    Pump(PumpData),
    Orifice(OrificeData),
    Weir(WeirData),
    Outlet(OutletData),
}

impl LinkKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            LinkKind::Conduit(_) => "conduit",
            LinkKind::Pump(_) => "pump",
            LinkKind::Orifice(_) => "orifice",
            LinkKind::Weir(_) => "weir",
            LinkKind::Outlet(_) => "outlet",
        }
    }

    pub fn is_regulator(&self) -> bool {
        matches!(
            self,
            LinkKind::Pump(_) | LinkKind::Orifice(_) | LinkKind::Weir(_) | LinkKind::Outlet(_)
        )
    }
}

/// A link definition plus routing state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Link {
    pub id: String,
    #[serde(flatten)]
    pub kind: LinkKind,
    pub from_node: String,
    pub to_node: String,
    /// inlet / outlet offsets above the node inverts, ft
    #[serde(default)]
    pub offset1: f64,
    #[serde(default)]
    pub offset2: f64,
    #[serde(default)]
    pub init_flow: f64,
    /// maximum allowed |flow|, cfs (0 = unlimited)
    #[serde(default)]
    pub max_flow: f64,
    /// cross section for conduits, orifices and weirs
    #[serde(default)]
    pub shape: Option<ShapeSpec>,

    // --- resolved at project open ---
    #[serde(skip)]
    pub node1: usize,
    #[serde(skip)]
    pub node2: usize,
    #[serde(skip)]
    pub xsect: Xsect,

    // --- routing state ---
    /// +1, or −1 after an adverse-slope reversal
    #[serde(skip)]
    pub direction: i8,
    /// fraction open (conduit: unused; pump: on/off; orifice/weir: gate)
    #[serde(skip)]
    pub setting: f64,
    #[serde(skip)]
    pub target_setting: f64,
    #[serde(skip)]
    pub old_flow: f64,
    #[serde(skip)]
    pub new_flow: f64,
    #[serde(skip)]
    pub old_depth: f64,
    #[serde(skip)]
    pub new_depth: f64,
    #[serde(skip)]
    pub old_volume: f64,
    #[serde(skip)]
    pub new_volume: f64,
    /// free-surface widths at the two ends, for node surface area, ft²/ft
    #[serde(skip)]
    pub surf_area1: f64,
    #[serde(skip)]
    pub surf_area2: f64,
    #[serde(skip)]
    pub froude: f64,
    #[serde(skip)]
    pub flow_class: FlowClass,
    /// ∂Q/∂h of a regulator at the current operating point
    #[serde(skip)]
    pub dq_dh: f64,
    #[serde(skip)]
    pub old_qual: Vec<f64>,
    #[serde(skip)]
    pub new_qual: Vec<f64>,
    /// cumulative pollutant mass carried, per pollutant
    #[serde(skip)]
    pub total_load: Vec<f64>,
}

impl Link {
    pub fn validate(&self) -> Result<()> {
        match &self.kind {
            LinkKind::Conduit(c) => {
                if c.length <= 0.0 {
                    return Err(EngineError::LinkLength(self.id.clone()));
                }
                if c.roughness <= 0.0 {
                    return Err(EngineError::LinkRoughness(self.id.clone()));
                }
                if c.barrels == 0 {
                    return Err(EngineError::ConduitBarrels(self.id.clone()));
                }
                if self.shape.is_none() {
                    return Err(EngineError::NoCrossSection(self.id.clone()));
                }
            }
            LinkKind::Pump(p) => {
                if p.kind != PumpKind::Ideal && p.curve.is_none() {
                    return Err(EngineError::PumpLimits(self.id.clone()));
                }
                if p.shutoff_depth > p.startup_depth && p.startup_depth > 0.0 {
                    return Err(EngineError::PumpLimits(self.id.clone()));
                }
            }
            LinkKind::Orifice(o) => {
                if o.coeff <= 0.0 {
                    return Err(EngineError::InputFormat(format!(
                        "orifice {} needs a positive discharge coefficient",
                        self.id
                    )));
                }
                if self.shape.is_none() {
                    return Err(EngineError::NoCrossSection(self.id.clone()));
                }
            }
            LinkKind::Weir(w) => {
                if w.coeff <= 0.0 {
                    return Err(EngineError::InputFormat(format!(
                        "weir {} needs a positive discharge coefficient",
                        self.id
                    )));
                }
                if self.shape.is_none() {
                    return Err(EngineError::NoCrossSection(self.id.clone()));
                }
            }
            LinkKind::Outlet(_) => {}
        }
        Ok(())
    }

    pub fn is_conduit(&self) -> bool {
        matches!(self.kind, LinkKind::Conduit(_))
    }

    pub fn is_pump(&self) -> bool {
        matches!(self.kind, LinkKind::Pump(_))
    }

    /// Crown elevation at the upstream end, ft.
    pub fn crown_elev(&self, node_invert: f64, offset: f64) -> f64 {
        node_invert + offset + self.xsect.yfull
    }

    /// Derive conduit slope and conveyance once node inverts are known.
    /// An adverse slope reverses the link: ends, offsets, and the sign of
    /// reported flow all flip.
    pub fn compute_conduit_geometry(&mut self, invert1: f64, invert2: f64) -> Result<()> {
        self.direction = 1;
        let length = match &self.kind {
            LinkKind::Conduit(c) => c.length,
            _ => return Ok(()),
        };
        let z1 = invert1 + self.offset1;
        let z2 = invert2 + self.offset2;
        let mut slope = (z1 - z2) / length;
        if slope.abs() < MIN_SLOPE {
            slope = if slope < 0.0 { -MIN_SLOPE } else { MIN_SLOPE };
        }
        if slope < 0.0 {
            self.reverse();
            slope = -slope;
        }
        let LinkKind::Conduit(ref mut c) = self.kind else {
            return Ok(());
        };
        c.slope = slope;
        c.beta = PHI / c.roughness * self.xsect.afull * self.xsect.rfull.powf(2.0 / 3.0);
        c.qfull = c.beta * slope.sqrt();
        c.full_celerity = (GRAVITY * self.xsect.afull / self.xsect.wmax.max(1e-6)).sqrt();
        Ok(())
    }

    /// Swap the link's ends; used for adverse-slope conduits.
    pub fn reverse(&mut self) {
        std::mem::swap(&mut self.node1, &mut self.node2);
        std::mem::swap(&mut self.from_node, &mut self.to_node);
        std::mem::swap(&mut self.offset1, &mut self.offset2);
        self.direction = -self.direction;
    }

    /// Prepare routing state for a run. The direction set by the
    /// adverse-slope check at open time is preserved.
    pub fn initialize(&mut self, npollut: usize) {
        if self.direction == 0 {
            self.direction = 1;
        }
        self.setting = match &self.kind {
            LinkKind::Pump(p) => {
                if p.init_on {
                    1.0
                } else {
                    0.0
                }
            }
            _ => 1.0,
        };
        self.target_setting = self.setting;
        self.old_flow = self.init_flow;
        self.new_flow = self.init_flow;
        self.old_depth = 0.0;
        self.new_depth = 0.0;
        self.old_volume = 0.0;
        self.new_volume = 0.0;
        self.froude = 0.0;
        self.flow_class = FlowClass::Dry;
        self.dq_dh = 0.0;
        self.old_qual = vec![0.0; npollut];
        self.new_qual = vec![0.0; npollut];
        self.total_load = vec![0.0; npollut];
    }

    pub fn advance(&mut self) {
        self.old_flow = self.new_flow;
        self.old_depth = self.new_depth;
        self.old_volume = self.new_volume;
        self.old_qual.clone_from(&self.new_qual);
    }

    /// Manning normal flow through a conduit at `depth`, cfs (one barrel).
    pub fn normal_flow(&self, depth: f64) -> f64 {
        let LinkKind::Conduit(ref c) = self.kind else {
            return 0.0;
        };
        let a = self.xsect.area_of_depth(depth);
        let r = self.xsect.hrad_of_depth(depth);
        PHI / c.roughness * a * r.powf(2.0 / 3.0) * c.slope.sqrt()
    }

    /// Depth giving a target normal flow, by bisection, ft.
    pub fn normal_depth(&self, flow: f64) -> f64 {
        if flow <= 0.0 {
            return 0.0;
        }
        let mut lo = 0.0;
        let mut hi = self.xsect.yfull;
        if self.normal_flow(hi) <= flow {
            return hi;
        }
        for _ in 0..40 {
            let mid = 0.5 * (lo + hi);
            if self.normal_flow(mid) < flow {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        0.5 * (lo + hi)
    }

    /// Orifice discharge for the given up/downstream heads above the
    /// orifice invert, cfs. Reverse heads give negative flow unless a
    /// flap gate blocks it.
    pub fn orifice_flow(&self, head1: f64, head2: f64) -> f64 {
        let LinkKind::Orifice(ref o) = self.kind else {
            return 0.0;
        };
        let area = self.xsect.afull * self.setting.clamp(0.0, 1.0);
        if area <= 0.0 {
            return 0.0;
        }
        let (hu, hd, sign) = if head1 >= head2 {
            (head1, head2, 1.0)
        } else {
            if o.flap_gate {
                return 0.0;
            }
            (head2, head1, -1.0)
        };
        if hu <= 0.0 {
            return 0.0;
        }
        let yfull = self.xsect.yfull;
        if hu < yfull {
            // unsubmerged: treat the opening as a weir
            return sign * o.coeff * self.xsect.wmax * hu.powf(1.5);
        }
        let head = (hu - hd.max(yfull * 0.5)).max(hu - hd).max(0.0);
        sign * o.coeff * area * (2.0 * GRAVITY * head).sqrt()
    }

    /// Weir discharge for a head above the crest, cfs.
    pub fn weir_flow(&self, head: f64, coeff_curve: Option<&Curve>) -> f64 {
        let LinkKind::Weir(ref w) = self.kind else {
            return 0.0;
        };
        if head <= 0.0 {
            return 0.0;
        }
        let h = (head * self.setting.clamp(0.0, 1.0)).min(self.xsect.yfull);
        let length = self.xsect.wmax;
        let cw = match coeff_curve {
            Some(c) => c.lookup_clamped(h),
            None => w.coeff,
        };
        // end contractions shorten the effective crest
        let eff_len = (length - 0.1 * w.end_contractions as f64 * h).max(0.0);
        match w.kind {
            WeirKind::Transverse | WeirKind::Roadway => cw * eff_len * h.powf(1.5),
            WeirKind::Sideflow => cw * eff_len * h.powf(5.0 / 3.0),
            WeirKind::VNotch => cw * w.side_slope * h.powf(2.5),
            WeirKind::Trapezoidal => {
                cw * eff_len * h.powf(1.5) + w.end_coeff * w.side_slope * h.powf(2.5)
            }
        }
    }

    /// Outlet discharge for a driving head, cfs.
    pub fn outlet_flow(&self, head: f64, curve: Option<&Curve>) -> f64 {
        let LinkKind::Outlet(ref o) = self.kind else {
            return 0.0;
        };
        if head <= 0.0 {
            return 0.0;
        }
        let q = match &o.relation {
            OutletRelation::Power { coeff, expon } => coeff * head.powf(*expon),
            OutletRelation::Rating { .. } => {
                curve.map(|c| c.lookup_clamped(head)).unwrap_or(0.0)
            }
        };
        q * self.setting.clamp(0.0, 1.0)
    }

    /// Pump discharge given the driving variable per the pump kind:
    /// wet-well volume (ft³), inlet depth (ft), or delivered head (ft).
    pub fn pump_flow(&self, driver: f64, inflow: f64, curve: Option<&Curve>) -> f64 {
        let LinkKind::Pump(ref p) = self.kind else {
            return 0.0;
        };
        if self.setting <= 0.0 {
            return 0.0;
        }
        let q = match p.kind {
            PumpKind::Ideal => inflow,
            PumpKind::Volume | PumpKind::Depth => curve
                .map(|c| c.lookup_step(driver))
                .unwrap_or(0.0),
            PumpKind::Head | PumpKind::ContinuousDepth => curve
                .map(|c| c.lookup_clamped(driver))
                .unwrap_or(0.0),
        };
        q.max(0.0) * self.setting
    }

    /// Apply a control-rule target immediately or, for timed gates, move
    /// toward it.
    pub fn update_setting(&mut self, tstep: f64) {
        let rate = match &self.kind {
            LinkKind::Orifice(o) if o.open_close_time > 0.0 => tstep / o.open_close_time,
            _ => 1.0,
        };
        let delta = self.target_setting - self.setting;
        if delta.abs() <= rate {
            self.setting = self.target_setting;
        } else {
            self.setting += delta.signum() * rate;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn conduit() -> Link {
        Link {
            id: "C1".into(),
            kind: LinkKind::Conduit(ConduitData {
                length: 400.0,
                roughness: 0.01,
                barrels: 1,
                loss_inlet: 0.0,
                loss_outlet: 0.0,
                loss_avg: 0.0,
                seepage: 0.0,
                flap_gate: false,
                slope: 0.0,
                beta: 0.0,
                qfull: 0.0,
                full_celerity: 0.0,
            }),
            from_node: "J1".into(),
            to_node: "J2".into(),
            offset1: 0.0,
            offset2: 0.0,
            init_flow: 0.0,
            max_flow: 0.0,
            shape: Some(ShapeSpec::RectOpen {
                height: 4.0,
                width: 2.0,
            }),
            node1: 0,
            node2: 1,
            xsect: Xsect::build(
                &ShapeSpec::RectOpen {
                    height: 4.0,
                    width: 2.0,
                },
                None,
                None,
            )
            .unwrap(),
            direction: 1,
            setting: 1.0,
            target_setting: 1.0,
            old_flow: 0.0,
            new_flow: 0.0,
            old_depth: 0.0,
            new_depth: 0.0,
            old_volume: 0.0,
            new_volume: 0.0,
            surf_area1: 0.0,
            surf_area2: 0.0,
            froude: 0.0,
            flow_class: FlowClass::Dry,
            dq_dh: 0.0,
            old_qual: Vec::new(),
            new_qual: Vec::new(),
            total_load: Vec::new(),
        }
    }

    #[test]
    fn normal_depth_matches_manning_hand_calc() {
        let mut c = conduit();
        // 0.001 slope over 400 ft: drop of 0.4 ft
        c.compute_conduit_geometry(100.4, 100.0).unwrap();
        // 5 cfs in a 2 ft wide rectangular channel, n = 0.01, S = 0.001:
        // solving Q = (1.486/n)·A·R^⅔·√S by hand gives y = 0.882 ft,
        // v = 2.84 ft/s
        let depth = c.normal_depth(5.0);
        assert_relative_eq!(depth, 0.882, epsilon = 0.01);
        let v = 5.0 / c.xsect.area_of_depth(depth);
        assert_relative_eq!(v, 2.84, epsilon = 0.02);
    }

    #[test]
    fn adverse_slope_reverses_the_link() {
        let mut c = conduit();
        c.compute_conduit_geometry(100.0, 100.4).unwrap();
        assert_eq!(c.direction, -1);
        assert_eq!(c.from_node, "J2");
        let LinkKind::Conduit(ref data) = c.kind else {
            unreachable!()
        };
        assert!(data.slope > 0.0);
    }

    #[test]
    fn zero_length_conduit_is_invalid() {
        let mut c = conduit();
        if let LinkKind::Conduit(ref mut d) = c.kind {
            d.length = 0.0;
        }
        assert!(matches!(c.validate(), Err(EngineError::LinkLength(_))));
    }

    #[test]
    fn orifice_flow_follows_the_square_root_of_head() {
        let mut c = conduit();
        c.kind = LinkKind::Orifice(OrificeData {
            kind: OrificeKind::Side,
            coeff: 0.65,
            flap_gate: false,
            open_close_time: 0.0,
        });
        c.xsect = Xsect::build(&ShapeSpec::Circular { diameter: 1.0 }, None, None).unwrap();
        let q1 = c.orifice_flow(3.0, 0.0);
        let q2 = c.orifice_flow(9.0, 0.0);
        assert!(q1 > 0.0);
        // submerged flow scales with sqrt(h): tripling head ≈ √3 ratio
        assert_relative_eq!(q2 / q1, 3.0_f64.sqrt(), max_relative = 0.05);
    }

    #[test]
    fn flap_gate_blocks_reverse_orifice_flow() {
        let mut c = conduit();
        c.kind = LinkKind::Orifice(OrificeData {
            kind: OrificeKind::Side,
            coeff: 0.65,
            flap_gate: true,
            open_close_time: 0.0,
        });
        c.xsect = Xsect::build(&ShapeSpec::Circular { diameter: 1.0 }, None, None).unwrap();
        assert_eq!(c.orifice_flow(0.0, 5.0), 0.0);
    }

    #[test]
    fn vnotch_weir_follows_h_to_the_five_halves() {
        let mut c = conduit();
        c.kind = LinkKind::Weir(WeirData {
            kind: WeirKind::VNotch,
            coeff: 2.5,
            end_coeff: 0.0,
            end_contractions: 0,
            side_slope: 2.0,
            flap_gate: false,
            can_surcharge: false,
            coeff_curve: None,
            curve_index: None,
        });
        c.xsect = Xsect::build(
            &ShapeSpec::Triangular {
                height: 2.0,
                top_width: 8.0,
            },
            None,
            None,
        )
        .unwrap();
        let q1 = c.weir_flow(0.5, None);
        let q2 = c.weir_flow(1.0, None);
        assert_relative_eq!(q2 / q1, 2.0_f64.powf(2.5), max_relative = 1e-9);
    }

    #[test]
    fn gate_setting_moves_at_its_timed_rate() {
        let mut c = conduit();
        c.kind = LinkKind::Orifice(OrificeData {
            kind: OrificeKind::Side,
            coeff: 0.65,
            flap_gate: false,
            open_close_time: 100.0,
        });
        c.setting = 0.0;
        c.target_setting = 1.0;
        c.update_setting(25.0);
        assert_relative_eq!(c.setting, 0.25);
        c.update_setting(100.0);
        assert_relative_eq!(c.setting, 1.0);
    }
}
