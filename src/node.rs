//! Nodes of the drainage network
//!
//! Nodes are junctions, outfalls, storage units, or flow dividers. Each
//! kind carries its own payload; the shared fields cover elevation,
//! depth limits, ponding, and the runtime depth/volume/inflow state the
//! routing kernels update in place.
//!
//! Elevations and depths are ft, areas ft², flows cfs.

use crate::error::{EngineError, Result};
use crate::table::Curve;
use serde::{Deserialize, Serialize};

/// Outfall boundary condition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "boundary", rename_all = "lowercase")]
pub enum OutfallBoundary {
    /// critical-depth boundary
    Free,
    /// normal-depth boundary
    Normal,
    /// fixed stage elevation, ft
    Fixed { stage: f64 },
    /// stage from a tidal curve (hour of day → elevation)
    Tidal { curve: String },
    /// stage from a time series
    Series { series: String },
}

/// Outfall payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutfallData {
    #[serde(flatten)]
    pub boundary: OutfallBoundary,
    /// backflow prevented by a flap gate
    #[serde(default)]
    pub flap_gate: bool,
    /// optional subcatchment receiving the outfall discharge as runon
    #[serde(default)]
    pub route_to: Option<String>,

    #[serde(skip)]
    pub curve_index: Option<usize>,
    #[serde(skip)]
    pub series_index: Option<usize>,
    #[serde(skip)]
    pub route_to_index: Option<usize>,
    /// stage set through the API, overrides the boundary until cleared
    #[serde(skip)]
    pub api_stage: Option<f64>,
    /// current boundary stage elevation, ft
    #[serde(skip)]
    pub stage: f64,
}

/// Storage depth-area relation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "shape", rename_all = "lowercase")]
pub enum StorageShape {
    /// area from a storage curve (depth → area)
    Tabular { curve: String },
    /// area = coeff·depth^expon + constant
    Functional {
        coeff: f64,
        expon: f64,
        constant: f64,
    },
}

/// Pollutant mixing model of a storage unit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReactorKind {
    /// continuously stirred: outflow at the mixed concentration
    #[default]
    Cstr,
    /// first-in-first-out slug advection
    Plug,
}

/// Storage-unit payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageData {
    #[serde(flatten)]
    pub shape: StorageShape,
    /// fraction of potential evaporation applied to the surface
    #[serde(default)]
    pub evap_frac: f64,
    /// exfiltration rate through the wetted bottom, ft/s
    #[serde(default)]
    pub seepage: f64,
    #[serde(default)]
    pub mixing: ReactorKind,

    #[serde(skip)]
    pub curve_index: Option<usize>,
    /// losses of the current step, cfs
    #[serde(skip)]
    pub evap_loss: f64,
    #[serde(skip)]
    pub seepage_loss: f64,
}

/// How a divider splits its inflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "rule", rename_all = "lowercase")]
pub enum DividerRule {
    /// everything above a cutoff flow diverts
    Cutoff { flow: f64 },
    /// diverted flow from a diversion curve (inflow → diverted)
    Tabular { curve: String },
    /// weir-type diversion between a minimum flow and a full-depth flow
    Weir {
        min_flow: f64,
        max_depth: f64,
        coeff: f64,
    },
    /// everything beyond the non-diverted link's full capacity diverts
    Overflow,
}

/// Divider payload; the diverted link receives the excess.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DividerData {
    pub link: String,
    #[serde(flatten)]
    pub rule: DividerRule,

    #[serde(skip)]
    pub link_index: Option<usize>,
    #[serde(skip)]
    pub curve_index: Option<usize>,
}

/// Kind-specific payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum NodeKind {
    Junction,
    Outfall(OutfallData),
    Storage(StorageData),
    Divider(DividerData),
}

impl NodeKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            NodeKind::Junction => "junction",
            NodeKind::Outfall(_) => "outfall",
            NodeKind::Storage(_) => "storage",
            NodeKind::Divider(_) => "divider",
        }
    }
}

/// A node definition plus routing state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(flatten)]
    pub kind: NodeKind,
    /// invert elevation, ft
    pub invert: f64,
    /// distance from invert to ground rim, ft
    #[serde(default)]
    pub full_depth: f64,
    /// additional depth above the rim before flooding, ft
    #[serde(default)]
    pub surcharge_depth: f64,
    /// area over which floodwater ponds, ft²
    #[serde(default)]
    pub ponded_area: f64,
    #[serde(default)]
    pub init_depth: f64,

    // --- topology, filled at project open ---
    /// links entering the node
    #[serde(skip)]
    pub in_links: Vec<usize>,
    /// links leaving the node
    #[serde(skip)]
    pub out_links: Vec<usize>,
    /// crown elevation of the highest connected conduit, ft
    #[serde(skip)]
    pub crown_elev: f64,

    // --- routing state ---
    #[serde(skip)]
    pub old_depth: f64,
    #[serde(skip)]
    pub new_depth: f64,
    #[serde(skip)]
    pub old_volume: f64,
    #[serde(skip)]
    pub new_volume: f64,
    /// lateral inflow (runoff + gw + rdii + external), cfs
    #[serde(skip)]
    pub old_lat_flow: f64,
    #[serde(skip)]
    pub new_lat_flow: f64,
    /// total inflow including upstream links, cfs
    #[serde(skip)]
    pub inflow: f64,
    #[serde(skip)]
    pub outflow: f64,
    /// flooding overflow of the current step, cfs
    #[serde(skip)]
    pub overflow: f64,
    /// storage evaporation + seepage of the current step, cfs
    #[serde(skip)]
    pub losses: f64,
    /// lateral inflow override set through the API
    #[serde(skip)]
    pub api_lat_flow: Option<f64>,
    /// per-pollutant concentrations, mass/ft³
    #[serde(skip)]
    pub old_qual: Vec<f64>,
    #[serde(skip)]
    pub new_qual: Vec<f64>,
}

impl Node {
    pub fn validate(&self) -> Result<()> {
        if self.init_depth > self.full_depth && self.full_depth > 0.0 {
            return Err(EngineError::NodeDepth(self.id.clone()));
        }
        Ok(())
    }

    pub fn is_outfall(&self) -> bool {
        matches!(self.kind, NodeKind::Outfall(_))
    }

    pub fn is_storage(&self) -> bool {
        matches!(self.kind, NodeKind::Storage(_))
    }

    pub fn is_divider(&self) -> bool {
        matches!(self.kind, NodeKind::Divider(_))
    }

    /// Hydraulic head, ft.
    pub fn head(&self) -> f64 {
        self.invert + self.new_depth
    }

    /// Depth at which the node starts to flood, ft.
    pub fn flood_depth(&self) -> f64 {
        self.full_depth + self.surcharge_depth
    }

    /// Free surface area at `depth`, ft². Storage units read their shape;
    /// other nodes expose only the ponded area above the rim.
    pub fn surface_area(&self, depth: f64, curve: Option<&Curve>) -> f64 {
        match &self.kind {
            NodeKind::Storage(s) => match &s.shape {
                StorageShape::Tabular { .. } => {
                    curve.map(|c| c.lookup(depth).max(0.0)).unwrap_or(0.0)
                }
                StorageShape::Functional {
                    coeff,
                    expon,
                    constant,
                } => {
                    let d = depth.max(0.0);
                    (coeff * d.powf(*expon) + constant).max(0.0)
                }
            },
            _ => {
                if depth > self.full_depth && self.ponded_area > 0.0 {
                    self.ponded_area
                } else {
                    0.0
                }
            }
        }
    }

    /// Stored volume at `depth`, ft³. Junctions and dividers store only
    /// ponded water; storage units integrate their area relation.
    pub fn volume(&self, depth: f64, curve: Option<&Curve>) -> f64 {
        match &self.kind {
            NodeKind::Storage(s) => match &s.shape {
                StorageShape::Tabular { .. } => {
                    curve.map(|c| c.integral(depth)).unwrap_or(0.0)
                }
                StorageShape::Functional {
                    coeff,
                    expon,
                    constant,
                } => {
                    let d = depth.max(0.0);
                    coeff * d.powf(expon + 1.0) / (expon + 1.0) + constant * d
                }
            },
            _ => {
                let over = (depth - self.full_depth).max(0.0);
                over * self.ponded_area
            }
        }
    }

    /// Invert of [`Node::volume`] for storage units, by bisection.
    pub fn depth_of_volume(&self, volume: f64, curve: Option<&Curve>) -> f64 {
        if volume <= 0.0 {
            return 0.0;
        }
        let max_depth = self.flood_depth().max(1.0);
        if self.volume(max_depth, curve) <= volume {
            return max_depth;
        }
        let mut lo = 0.0;
        let mut hi = max_depth;
        for _ in 0..40 {
            let mid = 0.5 * (lo + hi);
            if self.volume(mid, curve) < volume {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        0.5 * (lo + hi)
    }

    /// Prepare routing state for a run.
    pub fn initialize(&mut self, npollut: usize, curve: Option<&Curve>) {
        self.old_depth = self.init_depth;
        self.new_depth = self.init_depth;
        self.old_volume = self.volume(self.init_depth, curve);
        self.new_volume = self.old_volume;
        self.old_lat_flow = 0.0;
        self.new_lat_flow = 0.0;
        self.inflow = 0.0;
        self.outflow = 0.0;
        self.overflow = 0.0;
        self.losses = 0.0;
        self.old_qual = vec![0.0; npollut];
        self.new_qual = vec![0.0; npollut];
        if let NodeKind::Outfall(of) = &mut self.kind {
            of.stage = self.invert;
        }
    }

    /// Move this step's state into the previous slot.
    pub fn advance(&mut self) {
        self.old_depth = self.new_depth;
        self.old_volume = self.new_volume;
        self.old_lat_flow = self.new_lat_flow;
        self.old_qual.clone_from(&self.new_qual);
    }
}

/// Flow a divider sends down its diversion link for a given inflow.
pub fn diverted_flow(
    rule: &DividerRule,
    inflow: f64,
    curve: Option<&Curve>,
    full_flow_non_diverted: f64,
) -> f64 {
    match rule {
        DividerRule::Cutoff { flow } => (inflow - flow).max(0.0),
        DividerRule::Tabular { .. } => curve
            .map(|c| c.lookup_clamped(inflow).clamp(0.0, inflow))
            .unwrap_or(0.0),
        DividerRule::Weir {
            min_flow,
            max_depth,
            coeff,
        } => {
            if inflow <= *min_flow {
                0.0
            } else {
                // linear-proportional weir diversion up to the full depth
                let qmax = coeff * max_depth.powf(1.5);
                let frac = ((inflow - min_flow) / (qmax - min_flow).max(1e-9)).clamp(0.0, 1.0);
                (frac * (inflow - min_flow)).min(inflow)
            }
        }
        DividerRule::Overflow => (inflow - full_flow_non_diverted).max(0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::CurveKind;
    use approx::assert_relative_eq;

    fn junction() -> Node {
        Node {
            id: "J1".into(),
            kind: NodeKind::Junction,
            invert: 100.0,
            full_depth: 10.0,
            surcharge_depth: 0.0,
            ponded_area: 500.0,
            init_depth: 0.0,
            in_links: Vec::new(),
            out_links: Vec::new(),
            crown_elev: 0.0,
            old_depth: 0.0,
            new_depth: 0.0,
            old_volume: 0.0,
            new_volume: 0.0,
            old_lat_flow: 0.0,
            new_lat_flow: 0.0,
            inflow: 0.0,
            outflow: 0.0,
            overflow: 0.0,
            losses: 0.0,
            api_lat_flow: None,
            old_qual: Vec::new(),
            new_qual: Vec::new(),
        }
    }

    #[test]
    fn junction_ponds_only_above_the_rim() {
        let n = junction();
        assert_eq!(n.volume(5.0, None), 0.0);
        assert_relative_eq!(n.volume(12.0, None), 2.0 * 500.0);
        assert_eq!(n.surface_area(5.0, None), 0.0);
        assert_relative_eq!(n.surface_area(12.0, None), 500.0);
    }

    #[test]
    fn functional_storage_integrates_its_area() {
        let mut n = junction();
        n.kind = NodeKind::Storage(StorageData {
            shape: StorageShape::Functional {
                coeff: 0.0,
                expon: 0.0,
                constant: 200.0,
            },
            evap_frac: 0.0,
            seepage: 0.0,
            mixing: ReactorKind::Cstr,
            curve_index: None,
            evap_loss: 0.0,
            seepage_loss: 0.0,
        });
        assert_relative_eq!(n.volume(3.0, None), 600.0);
        assert_relative_eq!(n.depth_of_volume(600.0, None), 3.0, max_relative = 1e-6);
    }

    #[test]
    fn tabular_storage_uses_its_curve() {
        let mut n = junction();
        n.kind = NodeKind::Storage(StorageData {
            shape: StorageShape::Tabular {
                curve: "SC1".into(),
            },
            evap_frac: 0.0,
            seepage: 0.0,
            mixing: ReactorKind::Cstr,
            curve_index: Some(0),
            evap_loss: 0.0,
            seepage_loss: 0.0,
        });
        let curve = Curve {
            id: "SC1".into(),
            kind: CurveKind::Storage,
            points: vec![(0.0, 100.0), (10.0, 100.0)],
        };
        assert_relative_eq!(n.volume(4.0, Some(&curve)), 400.0);
    }

    #[test]
    fn init_depth_above_full_depth_is_invalid() {
        let mut n = junction();
        n.init_depth = 20.0;
        assert!(matches!(n.validate(), Err(EngineError::NodeDepth(_))));
    }

    #[test]
    fn cutoff_divider_passes_the_excess() {
        let rule = DividerRule::Cutoff { flow: 2.0 };
        assert_eq!(diverted_flow(&rule, 1.0, None, 0.0), 0.0);
        assert_relative_eq!(diverted_flow(&rule, 5.0, None, 0.0), 3.0);
    }
}
