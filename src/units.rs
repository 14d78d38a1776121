//! Unit system and conversion factors
//!
//! The engine computes exclusively in a foot-second system (feet, ft/s,
//! cfs, acres, °F, mg). User-facing numbers are converted on the way in
//! and out through [`UnitConverter::ucf`], so no conversion factor ever
//! appears inside a numerical loop.

use serde::{Deserialize, Serialize};

/// Gravitational acceleration in the internal unit system (ft/s²).
pub const GRAVITY: f64 = 32.2;

/// Manning equation units factor for the internal system.
pub const PHI: f64 = 1.486;

/// Generic small value.
pub const TINY: f64 = 1.0e-6;

/// Effective zero.
pub const ZERO: f64 = 1.0e-10;

/// Generic large value.
pub const BIG: f64 = 1.0e10;

/// Minimum depth/area used by dynamic wave routing (ft, ft²).
pub const FUDGE: f64 = 0.0001;

/// Overall measurement system.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum UnitSystem {
    /// US customary units (feet, inches, cfs, acres)
    #[default]
    US,
    /// SI metric units (meters, millimeters, cms, hectares)
    SI,
}

/// User choice of flow units; implies the measurement system.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum FlowUnits {
    /// cubic feet per second
    #[default]
    Cfs,
    /// gallons per minute
    Gpm,
    /// million gallons per day
    Mgd,
    /// cubic meters per second
    Cms,
    /// liters per second
    Lps,
    /// million liters per day
    Mld,
}

impl FlowUnits {
    /// The measurement system implied by the flow units.
    pub fn system(self) -> UnitSystem {
        match self {
            FlowUnits::Cfs | FlowUnits::Gpm | FlowUnits::Mgd => UnitSystem::US,
            FlowUnits::Cms | FlowUnits::Lps | FlowUnits::Mld => UnitSystem::SI,
        }
    }

    /// User flow units per internal cfs.
    fn per_cfs(self) -> f64 {
        match self {
            FlowUnits::Cfs => 1.0,
            FlowUnits::Gpm => 448.831,
            FlowUnits::Mgd => 0.64632,
            FlowUnits::Cms => 0.02832,
            FlowUnits::Lps => 28.317,
            FlowUnits::Mld => 2.4466,
        }
    }
}

/// Quantities that cross the user/internal boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantity {
    /// in/hr or mm/hr, internally ft/s
    Rainfall,
    /// in or mm, internally ft
    RainDepth,
    /// in/day or mm/day, internally ft/s
    EvapRate,
    /// ft or m, internally ft
    Length,
    /// acres or hectares, internally ft²
    LandArea,
    /// ft³ or m³, internally ft³
    Volume,
    /// mph or km/h, internally mph
    WindSpeed,
    /// °F or °C, internally °F (scale factor only; offset applied at I/O)
    Temperature,
    /// lb or kg, internally mg
    Mass,
    /// cfs/acre or cms/ha, internally ft/s
    GwFlow,
    /// user flow units, internally cfs
    Flow,
}

/// Converts between user units and the internal foot-second system.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct UnitConverter {
    pub system: UnitSystem,
    pub flow_units: FlowUnits,
}

impl UnitConverter {
    pub fn new(flow_units: FlowUnits) -> Self {
        Self {
            system: flow_units.system(),
            flow_units,
        }
    }

    /// Units conversion factor: `internal * ucf = user`, `user / ucf = internal`.
    pub fn ucf(&self, quantity: Quantity) -> f64 {
        use Quantity::*;
        let us = matches!(self.system, UnitSystem::US);
        match quantity {
            Rainfall => {
                if us {
                    43200.0
                } else {
                    1_097_280.0
                }
            }
            RainDepth => {
                if us {
                    12.0
                } else {
                    304.8
                }
            }
            EvapRate => {
                if us {
                    1_036_800.0
                } else {
                    26_334_720.0
                }
            }
            Length => {
                if us {
                    1.0
                } else {
                    0.3048
                }
            }
            LandArea => {
                if us {
                    2.2956e-5
                } else {
                    9.2903e-6
                }
            }
            Volume => {
                if us {
                    1.0
                } else {
                    0.02832
                }
            }
            WindSpeed => {
                if us {
                    1.0
                } else {
                    1.608
                }
            }
            Temperature => {
                if us {
                    1.0
                } else {
                    1.8
                }
            }
            Mass => {
                if us {
                    2.203e-6
                } else {
                    1.0e-6
                }
            }
            GwFlow => {
                if us {
                    43560.0
                } else {
                    3929.0
                }
            }
            Flow => self.flow_units.per_cfs(),
        }
    }

    /// Convert a user-supplied value to internal units.
    pub fn to_internal(&self, quantity: Quantity, value: f64) -> f64 {
        if quantity == Quantity::Temperature && self.system == UnitSystem::SI {
            return value * 1.8 + 32.0;
        }
        value / self.ucf(quantity)
    }

    /// Convert an internal value to user units.
    pub fn to_user(&self, quantity: Quantity, value: f64) -> f64 {
        if quantity == Quantity::Temperature && self.system == UnitSystem::SI {
            return (value - 32.0) / 1.8;
        }
        value * self.ucf(quantity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn flow_units_imply_system() {
        assert_eq!(FlowUnits::Mgd.system(), UnitSystem::US);
        assert_eq!(FlowUnits::Lps.system(), UnitSystem::SI);
    }

    #[test]
    fn round_trip_is_identity() {
        let quantities = [
            Quantity::Rainfall,
            Quantity::RainDepth,
            Quantity::EvapRate,
            Quantity::Length,
            Quantity::LandArea,
            Quantity::Volume,
            Quantity::WindSpeed,
            Quantity::Temperature,
            Quantity::Mass,
            Quantity::GwFlow,
            Quantity::Flow,
        ];
        for flow in [
            FlowUnits::Cfs,
            FlowUnits::Gpm,
            FlowUnits::Mgd,
            FlowUnits::Cms,
            FlowUnits::Lps,
            FlowUnits::Mld,
        ] {
            let uc = UnitConverter::new(flow);
            for q in quantities {
                let v = 3.7;
                let round = uc.to_internal(q, uc.to_user(q, v));
                assert_relative_eq!(round, v, max_relative = 1e-6);
            }
        }
    }

    #[test]
    fn rainfall_intensity_converts_to_feet_per_second() {
        let uc = UnitConverter::new(FlowUnits::Cfs);
        // 1 in/hr = 1/43200 ft/s
        assert_relative_eq!(
            uc.to_internal(Quantity::Rainfall, 1.0),
            1.0 / 43200.0,
            max_relative = 1e-12
        );
    }

    #[test]
    fn si_temperature_uses_affine_conversion() {
        let uc = UnitConverter::new(FlowUnits::Cms);
        assert_relative_eq!(uc.to_internal(Quantity::Temperature, 0.0), 32.0);
        assert_relative_eq!(uc.to_user(Quantity::Temperature, 212.0), 100.0);
    }
}
