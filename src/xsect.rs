//! Cross-section geometry
//!
//! Pure functions mapping (shape, depth) to flow area, top width, and
//! hydraulic radius, plus the inverse depth-from-area lookup used by the
//! routing kernels.
//!
//! Simple shapes (circular, rectangular, trapezoidal, triangular) are
//! analytic. Every other shape is described by a width-versus-depth
//! profile and compiled once, when the project opens, into a normalized
//! depth table that is interpolated afterwards. Irregular sections build
//! their table from a surveyed transect, custom sections from a shape
//! curve.

use crate::error::{EngineError, Result};
use crate::table::Curve;
use serde::{Deserialize, Serialize};

/// Number of rows in a compiled section table.
const TABLE_ROWS: usize = 51;

/// Sub-samples per table row during compilation.
const SUB_STEPS: usize = 10;

/// Slot width as a fraction of the maximum section width, for the
/// Preissmann slot surcharge method.
const SLOT_WIDTH_FRACTION: f64 = 0.01;

/// Force-main friction formulation, selected project-wide.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ForceMainEquation {
    #[default]
    HazenWilliams,
    DarcyWeisbach,
}

/// User-facing shape descriptor. Dimensions are internal feet once the
/// project has been opened.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "shape", rename_all = "kebab-case")]
pub enum ShapeSpec {
    /// Zero-area placeholder link
    Dummy,
    Circular {
        diameter: f64,
    },
    FilledCircular {
        diameter: f64,
        sediment_depth: f64,
    },
    RectClosed {
        height: f64,
        width: f64,
    },
    RectOpen {
        height: f64,
        width: f64,
    },
    Trapezoidal {
        height: f64,
        base_width: f64,
        /// horizontal run per unit rise, left side
        left_slope: f64,
        right_slope: f64,
    },
    Triangular {
        height: f64,
        top_width: f64,
    },
    Parabolic {
        height: f64,
        top_width: f64,
    },
    PowerFunction {
        height: f64,
        top_width: f64,
        exponent: f64,
    },
    RectTriangular {
        height: f64,
        top_width: f64,
        triangle_height: f64,
    },
    RectRound {
        height: f64,
        top_width: f64,
        bottom_radius: f64,
    },
    ModBasket {
        height: f64,
        top_width: f64,
        top_radius: f64,
    },
    HorizEllipse {
        height: f64,
        width: f64,
    },
    VertEllipse {
        height: f64,
        width: f64,
    },
    Arch {
        height: f64,
        width: f64,
    },
    Egg {
        height: f64,
    },
    Horseshoe {
        height: f64,
    },
    /// Natural channel built from a surveyed transect.
    Irregular {
        transect: String,
    },
    /// Closed section whose width profile comes from a shape curve giving
    /// width/height versus depth/height.
    Custom {
        height: f64,
        curve: String,
    },
    /// Pressurized circular main; roughness is Hazen-Williams C or
    /// Darcy-Weisbach roughness height per the project option.
    ForceMain {
        diameter: f64,
        roughness: f64,
    },
}

impl ShapeSpec {
    /// Name of the transect this shape references, if any.
    pub fn transect_ref(&self) -> Option<&str> {
        match self {
            ShapeSpec::Irregular { transect } => Some(transect),
            _ => None,
        }
    }

    /// Name of the shape curve this shape references, if any.
    pub fn curve_ref(&self) -> Option<&str> {
        match self {
            ShapeSpec::Custom { curve, .. } => Some(curve),
            _ => None,
        }
    }
}

/// A surveyed channel cross section: station-elevation pairs with
/// separate Manning roughness for the overbanks and the main channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transect {
    pub id: String,
    /// (station, elevation) pairs, stations non-decreasing
    pub stations: Vec<(f64, f64)>,
    pub n_left: f64,
    pub n_main: f64,
    pub n_right: f64,
    /// station marking the left end of the main channel
    pub left_bank: f64,
    /// station marking the right end of the main channel
    pub right_bank: f64,
}

impl Transect {
    pub fn validate(&self) -> Result<()> {
        if self.stations.len() < 3 {
            return Err(EngineError::InputFormat(format!(
                "transect {} needs at least 3 stations",
                self.id
            )));
        }
        for pair in self.stations.windows(2) {
            if pair[1].0 < pair[0].0 {
                return Err(EngineError::InputFormat(format!(
                    "transect {} stations must not decrease",
                    self.id
                )));
            }
        }
        Ok(())
    }

    fn invert(&self) -> f64 {
        self.stations
            .iter()
            .map(|s| s.1)
            .fold(f64::INFINITY, f64::min)
    }

    fn crown(&self) -> f64 {
        self.stations
            .iter()
            .map(|s| s.1)
            .fold(f64::NEG_INFINITY, f64::max)
    }

    /// Flow area, top width, and wetted perimeter at a water surface
    /// `depth` above the transect invert.
    fn properties(&self, depth: f64) -> (f64, f64, f64) {
        let wsel = self.invert() + depth;
        let mut area = 0.0;
        let mut width = 0.0;
        let mut perim = 0.0;
        for seg in self.stations.windows(2) {
            let (x1, z1) = seg[0];
            let (x2, z2) = seg[1];
            let d1 = (wsel - z1).max(0.0);
            let d2 = (wsel - z2).max(0.0);
            if d1 <= 0.0 && d2 <= 0.0 {
                continue;
            }
            let dx = x2 - x1;
            let dz = z2 - z1;
            if d1 > 0.0 && d2 > 0.0 {
                area += 0.5 * (d1 + d2) * dx;
                width += dx;
                perim += (dx * dx + dz * dz).sqrt();
            } else {
                // segment crosses the waterline; only a fraction is wet
                let dmax = d1.max(d2);
                let wet_frac = if dz.abs() > f64::EPSILON {
                    (dmax / dz.abs()).min(1.0)
                } else {
                    1.0
                };
                let wdx = dx * wet_frac;
                area += 0.5 * dmax * wdx;
                width += wdx;
                perim += (wdx * wdx + dmax * dmax).sqrt();
            }
        }
        (area, width, perim)
    }
}

/// Compiled geometry table with rows at uniform depth fractions.
#[derive(Debug, Clone, Default)]
struct SectionTable {
    area: Vec<f64>,
    width: Vec<f64>,
    hrad: Vec<f64>,
}

impl SectionTable {
    fn lookup(col: &[f64], frac: f64) -> f64 {
        let frac = frac.clamp(0.0, 1.0);
        let pos = frac * (col.len() - 1) as f64;
        let i = (pos.floor() as usize).min(col.len() - 2);
        let t = pos - i as f64;
        col[i] * (1.0 - t) + col[i + 1] * t
    }

    /// Compile from a symmetric width profile. Closed sections add the
    /// soffit width to the full-depth wetted perimeter.
    fn from_profile(yfull: f64, closed: bool, w: &dyn Fn(f64) -> f64) -> SectionTable {
        let n = TABLE_ROWS;
        let mut area = vec![0.0; n];
        let mut width = vec![0.0; n];
        let mut perim = vec![0.0; n];
        let dy = yfull / ((n - 1) * SUB_STEPS) as f64;
        let mut a = 0.0;
        let mut prev_w = w(0.0).max(0.0);
        let mut p = prev_w; // a flat bottom counts as bed perimeter
        width[0] = prev_w;
        perim[0] = p;
        let mut row = 1;
        for i in 1..=((n - 1) * SUB_STEPS) {
            let y = i as f64 * dy;
            let wy = w(y).max(0.0);
            a += 0.5 * (prev_w + wy) * dy;
            let dhw = 0.5 * (wy - prev_w);
            p += 2.0 * (dy * dy + dhw * dhw).sqrt();
            prev_w = wy;
            if i % SUB_STEPS == 0 {
                area[row] = a;
                width[row] = wy;
                perim[row] = p;
                row += 1;
            }
        }
        if closed {
            perim[n - 1] += prev_w;
        }
        let hrad = area
            .iter()
            .zip(&perim)
            .map(|(&a, &p)| if p > 0.0 { a / p } else { 0.0 })
            .collect();
        SectionTable { area, width, hrad }
    }

    fn from_transect(tr: &Transect) -> (SectionTable, f64) {
        let yfull = tr.crown() - tr.invert();
        let n = TABLE_ROWS;
        let mut area = vec![0.0; n];
        let mut width = vec![0.0; n];
        let mut hrad = vec![0.0; n];
        for row in 0..n {
            let depth = yfull * row as f64 / (n - 1) as f64;
            let (a, w, p) = tr.properties(depth);
            area[row] = a;
            width[row] = w;
            hrad[row] = if p > 0.0 { a / p } else { 0.0 };
        }
        (SectionTable { area, width, hrad }, yfull)
    }
}

/// A link cross section ready for routing: shape parameters plus derived
/// full-depth properties.
#[derive(Debug, Clone, Default)]
pub struct Xsect {
    pub spec: Option<ShapeSpec>,
    /// depth when flowing full (ft)
    pub yfull: f64,
    /// area when flowing full (ft²)
    pub afull: f64,
    /// hydraulic radius when flowing full (ft)
    pub rfull: f64,
    /// maximum top width (ft)
    pub wmax: f64,
    closed: bool,
    table: Option<SectionTable>,
}

fn check_dims(height: f64, width: f64, shape: &str) -> Result<()> {
    if height <= 0.0 || width <= 0.0 {
        return Err(EngineError::BadCrossSection(shape.into()));
    }
    Ok(())
}

impl Xsect {
    pub fn dummy() -> Self {
        Xsect {
            spec: Some(ShapeSpec::Dummy),
            ..Default::default()
        }
    }

    /// Compile a shape descriptor. Irregular shapes need their transect and
    /// custom shapes their shape curve; the caller resolves those names.
    pub fn build(
        spec: &ShapeSpec,
        transect_obj: Option<&Transect>,
        curve_obj: Option<&Curve>,
    ) -> Result<Xsect> {
        use ShapeSpec::*;
        let mut x = Xsect {
            spec: Some(spec.clone()),
            ..Default::default()
        };
        match *spec {
            Dummy => {}
            Circular { diameter } | ForceMain { diameter, .. } => {
                check_dims(diameter, diameter, "circular")?;
                x.yfull = diameter;
                x.afull = std::f64::consts::FRAC_PI_4 * diameter * diameter;
                x.rfull = 0.25 * diameter;
                x.wmax = diameter;
                x.closed = true;
            }
            FilledCircular {
                diameter,
                sediment_depth,
            } => {
                if diameter <= 0.0 || sediment_depth < 0.0 || sediment_depth >= diameter {
                    return Err(EngineError::BadCrossSection("filled-circular".into()));
                }
                x.yfull = diameter - sediment_depth;
                x.afull = std::f64::consts::FRAC_PI_4 * diameter * diameter
                    - circular_segment_area(diameter, sediment_depth);
                x.wmax = if sediment_depth < 0.5 * diameter {
                    diameter
                } else {
                    circular_width(diameter, sediment_depth)
                };
                let perim = std::f64::consts::PI * diameter
                    - circular_arc(diameter, sediment_depth)
                    + circular_width(diameter, sediment_depth);
                x.rfull = x.afull / perim;
                x.closed = true;
            }
            RectClosed { height, width } => {
                check_dims(height, width, "rect-closed")?;
                x.yfull = height;
                x.afull = height * width;
                x.wmax = width;
                x.rfull = x.afull / (2.0 * (height + width));
                x.closed = true;
            }
            RectOpen { height, width } => {
                check_dims(height, width, "rect-open")?;
                x.yfull = height;
                x.afull = height * width;
                x.wmax = width;
                x.rfull = x.afull / (width + 2.0 * height);
            }
            Trapezoidal {
                height,
                base_width,
                left_slope,
                right_slope,
            } => {
                if height <= 0.0 || base_width < 0.0 || left_slope < 0.0 || right_slope < 0.0 {
                    return Err(EngineError::BadCrossSection("trapezoidal".into()));
                }
                let s = 0.5 * (left_slope + right_slope);
                x.yfull = height;
                x.afull = height * (base_width + s * height);
                x.wmax = base_width + 2.0 * s * height;
                let perim = base_width
                    + height
                        * ((1.0 + left_slope * left_slope).sqrt()
                            + (1.0 + right_slope * right_slope).sqrt());
                x.rfull = x.afull / perim;
            }
            Triangular { height, top_width } => {
                check_dims(height, top_width, "triangular")?;
                let s = 0.5 * top_width / height;
                x.yfull = height;
                x.afull = s * height * height;
                x.wmax = top_width;
                x.rfull = x.afull / (2.0 * height * (1.0 + s * s).sqrt());
            }
            Parabolic { height, top_width } => {
                check_dims(height, top_width, "parabolic")?;
                x.compile(height, false, &|y: f64| top_width * (y / height).sqrt());
            }
            PowerFunction {
                height,
                top_width,
                exponent,
            } => {
                check_dims(height, top_width, "power")?;
                if exponent <= 0.0 {
                    return Err(EngineError::BadCrossSection("power".into()));
                }
                x.compile(height, false, &|y: f64| {
                    top_width * (y / height).powf(1.0 / exponent)
                });
            }
            RectTriangular {
                height,
                top_width,
                triangle_height,
            } => {
                check_dims(height, top_width, "rect-triangular")?;
                if triangle_height <= 0.0 || triangle_height > height {
                    return Err(EngineError::BadCrossSection("rect-triangular".into()));
                }
                let s = 0.5 * top_width / triangle_height;
                x.compile(height, false, &|y: f64| {
                    if y < triangle_height {
                        2.0 * s * y
                    } else {
                        top_width
                    }
                });
            }
            RectRound {
                height,
                top_width,
                bottom_radius,
            } => {
                check_dims(height, top_width, "rect-round")?;
                if 2.0 * bottom_radius < top_width {
                    return Err(EngineError::BadCrossSection("rect-round".into()));
                }
                let yb = bottom_radius
                    - (bottom_radius * bottom_radius - 0.25 * top_width * top_width).sqrt();
                x.compile(height, false, &|y: f64| {
                    if y < yb {
                        circular_width(2.0 * bottom_radius, y)
                    } else {
                        top_width
                    }
                });
            }
            ModBasket {
                height,
                top_width,
                top_radius,
            } => {
                check_dims(height, top_width, "mod-basket")?;
                if 2.0 * top_radius < top_width {
                    return Err(EngineError::BadCrossSection("mod-basket".into()));
                }
                // rise of the circular arch above the rectangular walls
                let rise =
                    top_radius - (top_radius * top_radius - 0.25 * top_width * top_width).sqrt();
                let wall_top = height - rise;
                if wall_top < 0.0 {
                    return Err(EngineError::BadCrossSection("mod-basket".into()));
                }
                let arch_center = wall_top - (top_radius - rise);
                x.compile(height, true, &|y: f64| {
                    if y <= wall_top {
                        top_width
                    } else {
                        let half = (top_radius * top_radius - (y - arch_center).powi(2))
                            .max(0.0)
                            .sqrt();
                        (2.0 * half).min(top_width)
                    }
                });
            }
            HorizEllipse { height, width } | VertEllipse { height, width } => {
                check_dims(height, width, "ellipse")?;
                x.compile(height, true, &|y: f64| {
                    let t = 2.0 * y / height - 1.0;
                    width * (1.0 - t * t).max(0.0).sqrt()
                });
            }
            Arch { height, width } => {
                check_dims(height, width, "arch")?;
                // flat invert under a half-elliptical crown
                x.compile(height, true, &|y: f64| {
                    let t = y / height;
                    width * (1.0 - t * t).max(0.0).sqrt()
                });
            }
            Egg { height } => {
                if height <= 0.0 {
                    return Err(EngineError::BadCrossSection("egg".into()));
                }
                let b = 2.0 * height / 3.0;
                x.compile(height, true, &|y: f64| egg_width(b, y));
            }
            Horseshoe { height } => {
                if height <= 0.0 {
                    return Err(EngineError::BadCrossSection("horseshoe".into()));
                }
                x.compile(height, true, &|y: f64| horseshoe_width(height, y));
            }
            Irregular { .. } => {
                let tr = transect_obj.ok_or_else(|| EngineError::UndefinedName {
                    kind: "transect",
                    name: spec.transect_ref().unwrap_or("").to_string(),
                })?;
                tr.validate()?;
                let (table, yfull) = SectionTable::from_transect(tr);
                x.yfull = yfull;
                x.afull = *table.area.last().unwrap();
                x.rfull = *table.hrad.last().unwrap();
                x.wmax = table.width.iter().cloned().fold(0.0, f64::max);
                x.table = Some(table);
            }
            Custom { height, .. } => {
                if height <= 0.0 {
                    return Err(EngineError::BadCrossSection("custom".into()));
                }
                let c = curve_obj.ok_or_else(|| {
                    EngineError::NoCurve(spec.curve_ref().unwrap_or("").to_string())
                })?;
                c.validate()?;
                x.compile(height, true, &|y: f64| {
                    (height * c.lookup_clamped(y / height)).max(0.0)
                });
            }
        }
        Ok(x)
    }

    /// Compile a width profile into the section table and derived fields.
    fn compile(&mut self, yfull: f64, closed: bool, w: &dyn Fn(f64) -> f64) {
        let table = SectionTable::from_profile(yfull, closed, w);
        self.yfull = yfull;
        self.afull = *table.area.last().unwrap();
        self.rfull = *table.hrad.last().unwrap();
        self.wmax = table.width.iter().cloned().fold(0.0, f64::max);
        self.closed = closed;
        self.table = Some(table);
    }

    /// Whether the section has a crown (can pressurize).
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_dummy(&self) -> bool {
        matches!(self.spec, Some(ShapeSpec::Dummy) | None)
    }

    /// Width of the Preissmann slot used above the crown during surcharge.
    pub fn slot_width(&self) -> f64 {
        (SLOT_WIDTH_FRACTION * self.wmax).max(0.001)
    }

    /// Flow area at `depth` above the invert (ft²).
    pub fn area_of_depth(&self, depth: f64) -> f64 {
        use ShapeSpec::*;
        let y = depth.clamp(0.0, self.yfull);
        if let Some(table) = &self.table {
            return SectionTable::lookup(&table.area, y / self.yfull);
        }
        match self.spec {
            Some(Circular { diameter }) | Some(ForceMain { diameter, .. }) => {
                circular_segment_area(diameter, y)
            }
            Some(FilledCircular {
                diameter,
                sediment_depth,
            }) => {
                circular_segment_area(diameter, y + sediment_depth)
                    - circular_segment_area(diameter, sediment_depth)
            }
            Some(RectClosed { width, .. }) | Some(RectOpen { width, .. }) => width * y,
            Some(Trapezoidal {
                base_width,
                left_slope,
                right_slope,
                ..
            }) => {
                let s = 0.5 * (left_slope + right_slope);
                y * (base_width + s * y)
            }
            Some(Triangular {
                height, top_width, ..
            }) => {
                let s = 0.5 * top_width / height;
                s * y * y
            }
            _ => 0.0,
        }
    }

    /// Free-surface top width at `depth` (ft). Zero at the crown of a
    /// closed section; the dynamic-wave solver substitutes the slot width
    /// during surcharge.
    pub fn width_of_depth(&self, depth: f64) -> f64 {
        use ShapeSpec::*;
        let y = depth.clamp(0.0, self.yfull);
        if let Some(table) = &self.table {
            return SectionTable::lookup(&table.width, y / self.yfull);
        }
        match self.spec {
            Some(Circular { diameter }) | Some(ForceMain { diameter, .. }) => {
                circular_width(diameter, y)
            }
            Some(FilledCircular {
                diameter,
                sediment_depth,
            }) => circular_width(diameter, y + sediment_depth),
            Some(RectClosed { width, .. }) | Some(RectOpen { width, .. }) => width,
            Some(Trapezoidal {
                base_width,
                left_slope,
                right_slope,
                ..
            }) => base_width + (left_slope + right_slope) * y,
            Some(Triangular {
                height, top_width, ..
            }) => top_width * y / height,
            _ => 0.0,
        }
    }

    /// Hydraulic radius at `depth` (ft).
    pub fn hrad_of_depth(&self, depth: f64) -> f64 {
        use ShapeSpec::*;
        let y = depth.clamp(0.0, self.yfull);
        if y <= 0.0 {
            return 0.0;
        }
        if let Some(table) = &self.table {
            return SectionTable::lookup(&table.hrad, y / self.yfull);
        }
        match self.spec {
            Some(Circular { diameter }) | Some(ForceMain { diameter, .. }) => {
                let p = circular_arc(diameter, y);
                if p > 0.0 {
                    circular_segment_area(diameter, y) / p
                } else {
                    0.0
                }
            }
            Some(FilledCircular {
                diameter,
                sediment_depth,
            }) => {
                let a = circular_segment_area(diameter, y + sediment_depth)
                    - circular_segment_area(diameter, sediment_depth);
                let p = circular_arc(diameter, y + sediment_depth)
                    - circular_arc(diameter, sediment_depth)
                    + circular_width(diameter, sediment_depth);
                if p > 0.0 {
                    a / p
                } else {
                    0.0
                }
            }
            Some(RectClosed { width, height }) => {
                let mut p = width + 2.0 * y;
                if y >= height {
                    p += width;
                }
                width * y / p
            }
            Some(RectOpen { width, .. }) => width * y / (width + 2.0 * y),
            Some(Trapezoidal {
                base_width,
                left_slope,
                right_slope,
                ..
            }) => {
                let s = 0.5 * (left_slope + right_slope);
                let a = y * (base_width + s * y);
                let p = base_width
                    + y * ((1.0 + left_slope * left_slope).sqrt()
                        + (1.0 + right_slope * right_slope).sqrt());
                a / p
            }
            Some(Triangular {
                height, top_width, ..
            }) => {
                let s = 0.5 * top_width / height;
                s * y * y / (2.0 * y * (1.0 + s * s).sqrt())
            }
            _ => 0.0,
        }
    }

    /// Invert of [`Xsect::area_of_depth`], by bisection on the monotone
    /// area function.
    pub fn depth_of_area(&self, area: f64) -> f64 {
        if area <= 0.0 {
            return 0.0;
        }
        if area >= self.afull {
            return self.yfull;
        }
        let mut lo = 0.0;
        let mut hi = self.yfull;
        for _ in 0..40 {
            let mid = 0.5 * (lo + hi);
            if self.area_of_depth(mid) < area {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        0.5 * (lo + hi)
    }
}

fn circular_theta(diameter: f64, depth: f64) -> f64 {
    let ratio = (1.0 - 2.0 * depth / diameter).clamp(-1.0, 1.0);
    2.0 * ratio.acos()
}

fn circular_segment_area(diameter: f64, depth: f64) -> f64 {
    let theta = circular_theta(diameter, depth);
    diameter * diameter / 8.0 * (theta - theta.sin())
}

fn circular_width(diameter: f64, depth: f64) -> f64 {
    let d = depth.clamp(0.0, diameter);
    2.0 * (d * (diameter - d)).max(0.0).sqrt()
}

fn circular_arc(diameter: f64, depth: f64) -> f64 {
    0.5 * diameter * circular_theta(diameter, depth)
}

/// Width of the classic three-arc egg section: overall width `b`, height
/// `1.5 b`, crown radius `b/2`, invert radius `b/4`, flank radius `3b/2`.
fn egg_width(b: f64, y: f64) -> f64 {
    if y < 0.0 {
        return 0.0;
    }
    if y <= 0.1 * b {
        // invert arc, radius b/4 centered at b/4
        2.0 * ((0.25 * b).powi(2) - (y - 0.25 * b).powi(2)).max(0.0).sqrt()
    } else if y <= b {
        // flank arcs, radius 3b/2 centered at (±b, b)
        2.0 * (((1.5 * b).powi(2) - (y - b).powi(2)).max(0.0).sqrt() - b).max(0.0)
    } else if y <= 1.5 * b {
        // crown semicircle, radius b/2
        2.0 * ((0.5 * b).powi(2) - (y - b).powi(2)).max(0.0).sqrt()
    } else {
        0.0
    }
}

/// Width of the standard horseshoe section of height and width `d`:
/// invert arc radius `d`, side arcs radius `d`, crown semicircle `d/2`.
fn horseshoe_width(d: f64, y: f64) -> f64 {
    if y < 0.0 || y > d {
        return 0.0;
    }
    if y <= 0.5 * d {
        let invert = (d * d - (y - d).powi(2)).max(0.0).sqrt();
        let side = ((d * d - (y - 0.5 * d).powi(2)).max(0.0).sqrt() - 0.5 * d).max(0.0);
        2.0 * invert.min(side)
    } else {
        2.0 * ((0.5 * d).powi(2) - (y - 0.5 * d).powi(2)).max(0.0).sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn circular_properties_at_half_and_full_depth() {
        let x = Xsect::build(&ShapeSpec::Circular { diameter: 4.0 }, None, None).unwrap();
        assert_relative_eq!(x.afull, std::f64::consts::PI * 4.0, max_relative = 1e-12);
        assert_relative_eq!(x.rfull, 1.0);
        // half full: area πD²/8, hydraulic radius D/4, width D
        assert_relative_eq!(
            x.area_of_depth(2.0),
            std::f64::consts::PI * 2.0,
            max_relative = 1e-9
        );
        assert_relative_eq!(x.hrad_of_depth(2.0), 1.0, max_relative = 1e-9);
        assert_relative_eq!(x.width_of_depth(2.0), 4.0, max_relative = 1e-9);
    }

    #[test]
    fn rectangular_geometry_is_exact() {
        let x = Xsect::build(
            &ShapeSpec::RectOpen {
                height: 3.0,
                width: 2.0,
            },
            None,
            None,
        )
        .unwrap();
        assert_relative_eq!(x.area_of_depth(1.5), 3.0);
        assert_relative_eq!(x.width_of_depth(1.5), 2.0);
        assert_relative_eq!(x.hrad_of_depth(1.5), 3.0 / 5.0);
        assert!(!x.is_closed());
    }

    #[test]
    fn depth_of_area_inverts_area_of_depth() {
        let shapes = [
            ShapeSpec::Circular { diameter: 3.0 },
            ShapeSpec::Trapezoidal {
                height: 4.0,
                base_width: 5.0,
                left_slope: 2.0,
                right_slope: 1.0,
            },
            ShapeSpec::Egg { height: 3.0 },
            ShapeSpec::Parabolic {
                height: 2.0,
                top_width: 6.0,
            },
        ];
        for spec in &shapes {
            let x = Xsect::build(spec, None, None).unwrap();
            for frac in [0.1, 0.35, 0.6, 0.9] {
                let y = frac * x.yfull;
                let a = x.area_of_depth(y);
                assert_relative_eq!(x.depth_of_area(a), y, max_relative = 1e-3);
            }
        }
    }

    #[test]
    fn egg_section_narrows_toward_the_invert() {
        let x = Xsect::build(&ShapeSpec::Egg { height: 3.0 }, None, None).unwrap();
        assert!(x.is_closed());
        // widest at 2/3 height, narrow near the bottom
        assert!(x.width_of_depth(2.0) > x.width_of_depth(0.3));
        assert_relative_eq!(x.wmax, 2.0, max_relative = 0.02);
        assert!(x.afull > 0.0 && x.afull < 3.0 * 2.0);
    }

    #[test]
    fn horseshoe_full_area_matches_construction() {
        let x = Xsect::build(&ShapeSpec::Horseshoe { height: 2.0 }, None, None).unwrap();
        // the three-arc construction closes at ~0.83 d²
        assert_relative_eq!(x.afull, 0.83 * 4.0, max_relative = 0.02);
        assert_relative_eq!(x.wmax, 2.0, max_relative = 0.02);
    }

    #[test]
    fn transect_section_builds_from_stations() {
        let tr = Transect {
            id: "TR1".into(),
            stations: vec![(0.0, 10.0), (10.0, 5.0), (20.0, 5.0), (30.0, 10.0)],
            n_left: 0.06,
            n_main: 0.035,
            n_right: 0.06,
            left_bank: 10.0,
            right_bank: 20.0,
        };
        let x = Xsect::build(
            &ShapeSpec::Irregular {
                transect: "TR1".into(),
            },
            Some(&tr),
            None,
        )
        .unwrap();
        assert_relative_eq!(x.yfull, 5.0);
        // full section: trapezoid area = (10 + 30)/2 * 5
        assert_relative_eq!(x.afull, 100.0, max_relative = 1e-6);
        assert!(!x.is_closed());
    }

    #[test]
    fn custom_shape_requires_its_curve() {
        let spec = ShapeSpec::Custom {
            height: 4.0,
            curve: "SHAPE1".into(),
        };
        assert!(matches!(
            Xsect::build(&spec, None, None),
            Err(EngineError::NoCurve(_))
        ));
    }

    #[test]
    fn slot_width_scales_with_section_width() {
        let x = Xsect::build(&ShapeSpec::Circular { diameter: 10.0 }, None, None).unwrap();
        assert_relative_eq!(x.slot_width(), 0.1);
    }
}
