//! Engine error types
//!
//! Every externally callable function resolves to a numeric error code in
//! the classic bands: 1xx validation and runtime-numerical errors, 2xx
//! input errors, 3xx file errors, 4xx system errors, 5xx API misuse.
//! Warnings are not errors; they go to the `log` facade and never change
//! a return code.

use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Engine errors with their classic numeric codes.
#[derive(Error, Debug)]
pub enum EngineError {
    // --- runtime numerical errors -------------------------------------
    #[error("kinematic wave solution failed for link {0}")]
    KinWaveFailed(String),
    #[error("water balance ODE solver failed for {0}")]
    OdeSolverFailed(String),
    #[error("routing time step fell below the minimum allowed")]
    TimeStepFailed,

    // --- subcatchment errors ------------------------------------------
    #[error("subcatchment {0} has an invalid outlet")]
    SubcatchOutlet(String),
    #[error("aquifer {0} has invalid parameters")]
    AquiferParams(String),

    // --- conduit / pump errors ----------------------------------------
    #[error("link {0} has zero or negative length")]
    LinkLength(String),
    #[error("link {0} has an invalid roughness")]
    LinkRoughness(String),
    #[error("conduit {0} must have at least one barrel")]
    ConduitBarrels(String),
    #[error("link {0} has no cross section")]
    NoCrossSection(String),
    #[error("link {0} has an invalid cross section")]
    BadCrossSection(String),
    #[error("{0} references an undefined curve")]
    NoCurve(String),
    #[error("pump {0} has an invalid pump curve")]
    PumpLimits(String),

    // --- topology errors ----------------------------------------------
    #[error("a cycle exists in the drainage network at link {0}")]
    NetworkLoop(String),
    #[error("node {0} has more than one outlet link")]
    MultipleOutlets(String),
    #[error("dummy link {0} must discharge to an outfall")]
    DummyLink(String),

    // --- node errors ---------------------------------------------------
    #[error("divider {0} does not have exactly two outlet links")]
    DividerLinks(String),
    #[error("divider {0} has an invalid diversion link")]
    DividerLink(String),
    #[error("node {0} initial depth exceeds its maximum depth")]
    NodeDepth(String),
    #[error("regulator link {0} must be sited on a storage node")]
    Regulator(String),
    #[error("outfall {0} has more than one connected link")]
    Outfall(String),
    #[error("the network has no outfall nodes")]
    NoOutlets,

    // --- RDII errors ----------------------------------------------------
    #[error("unit hydrograph {0} has invalid time base parameters")]
    UnitHydTimes(String),
    #[error("unit hydrograph {0} response ratios exceed 1.0")]
    UnitHydRatios(String),
    #[error("node {0} has an invalid RDII sewer area")]
    RdiiArea(String),

    // --- rain gage errors -----------------------------------------------
    #[error("rain gage {0} has an invalid data format")]
    GageFormat(String),
    #[error("rain gage {0} references an undefined time series")]
    GageSeries(String),
    #[error("rain gages {0} and {1} use the same series with different recording intervals")]
    GageInterval(String, String),

    // --- water quality errors -------------------------------------------
    #[error("treatment expressions at node {0} are cyclic")]
    CyclicTreatment(String),
    #[error("treatment expression for {0} at node {1} cannot be parsed")]
    TreatmentExpr(String, String),

    // --- curve / time series errors --------------------------------------
    #[error("curve {0} has non-increasing x-values")]
    CurveSequence(String),
    #[error("time series {0} has non-increasing times")]
    TimeSeriesSequence(String),

    // --- snow / LID errors ------------------------------------------------
    #[error("snowpack {0} has invalid parameters")]
    SnowpackParams(String),
    #[error("LID process {0} has an invalid layer for its type")]
    LidLayer(String),
    #[error("LID process {0} has invalid layer parameters")]
    LidParams(String),
    #[error("LID units on subcatchment {0} exceed its area")]
    LidAreas(String),
    #[error("LID units on subcatchment {0} capture more impervious runoff than exists")]
    LidCaptureArea(String),

    // --- simulation date errors -------------------------------------------
    #[error("simulation start date is after the end date")]
    StartDate,
    #[error("report start date is after the simulation ends")]
    ReportDate,
    #[error("report step is smaller than the routing step allows")]
    ReportStep,

    // --- input errors -------------------------------------------------------
    #[error("project input is malformed: {0}")]
    InputFormat(String),
    #[error("duplicate element name {0}")]
    DuplicateName(String),
    #[error("undefined {kind} named {name}")]
    UndefinedName { kind: &'static str, name: String },
    #[error("invalid number {0}")]
    InvalidNumber(String),
    #[error("invalid date/time {0}")]
    InvalidDate(String),
    #[error("control rule {0} is malformed: {1}")]
    RuleFormat(String, String),

    // --- file errors ---------------------------------------------------------
    #[error("invalid file name {0}")]
    FileName(PathBuf),
    #[error("cannot open project file {path}: {source}")]
    InpFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot open report file {path}: {source}")]
    RptFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot open results file {path}: {source}")]
    OutFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("error writing results file: {0}")]
    OutWrite(#[from] std::io::Error),
    #[error("cannot read time series file {path}: {reason}")]
    TableFile { path: PathBuf, reason: String },

    // --- API misuse errors -----------------------------------------------------
    #[error("object kind is out of bounds")]
    ApiObjectType,
    #[error("no project is open")]
    ApiInputNotOpen,
    #[error("no simulation is running")]
    ApiSimNotRunning,
    #[error("a simulation is running; the operation is only legal between runs")]
    ApiSimRunning,
    #[error("requested property does not apply to this object subtype")]
    ApiWrongType,
    #[error("object index is out of bounds")]
    ApiOutOfBounds,
    #[error("invalid pollutant index")]
    ApiPollutIndex,
    #[error("invalid inflow type")]
    ApiInflowType,
    #[error("invalid time series index")]
    ApiSeriesIndex,
    #[error("invalid pattern index")]
    ApiPatternIndex,
}

impl EngineError {
    /// The numeric code reported at the external API boundary.
    pub fn code(&self) -> i32 {
        use EngineError::*;
        match self {
            KinWaveFailed(_) => 103,
            OdeSolverFailed(_) => 105,
            TimeStepFailed => 107,
            SubcatchOutlet(_) => 108,
            AquiferParams(_) => 109,
            LinkLength(_) => 111,
            LinkRoughness(_) => 113,
            ConduitBarrels(_) => 114,
            NoCrossSection(_) => 117,
            BadCrossSection(_) => 119,
            NoCurve(_) => 121,
            PumpLimits(_) => 122,
            NetworkLoop(_) => 131,
            MultipleOutlets(_) => 133,
            DummyLink(_) => 134,
            DividerLinks(_) => 135,
            DividerLink(_) => 136,
            NodeDepth(_) => 138,
            Regulator(_) => 139,
            Outfall(_) => 141,
            NoOutlets => 145,
            UnitHydTimes(_) => 151,
            UnitHydRatios(_) => 153,
            RdiiArea(_) => 155,
            GageFormat(_) => 157,
            GageSeries(_) => 158,
            GageInterval(_, _) => 159,
            CyclicTreatment(_) => 161,
            CurveSequence(_) => 171,
            TimeSeriesSequence(_) => 173,
            SnowpackParams(_) => 182,
            LidLayer(_) => 184,
            LidParams(_) => 185,
            LidAreas(_) => 187,
            LidCaptureArea(_) => 188,
            StartDate => 191,
            ReportDate => 193,
            ReportStep => 195,
            InputFormat(_) => 200,
            DuplicateName(_) => 207,
            UndefinedName { .. } => 209,
            InvalidNumber(_) => 211,
            InvalidDate(_) => 213,
            RuleFormat(_, _) => 217,
            TreatmentExpr(_, _) => 233,
            FileName(_) => 301,
            InpFile { .. } => 303,
            RptFile { .. } => 305,
            OutFile { .. } => 307,
            OutWrite(_) => 309,
            TableFile { .. } => 361,
            ApiObjectType => 501,
            ApiInputNotOpen => 502,
            ApiSimNotRunning => 503,
            ApiWrongType => 504,
            ApiSimRunning => 510,
            ApiOutOfBounds => 505,
            ApiPollutIndex => 506,
            ApiInflowType => 507,
            ApiSeriesIndex => 508,
            ApiPatternIndex => 509,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_fall_in_their_bands() {
        assert_eq!(EngineError::TimeStepFailed.code(), 107);
        assert_eq!(EngineError::DuplicateName("J1".into()).code(), 207);
        assert_eq!(EngineError::ApiInputNotOpen.code(), 502);
        assert_eq!(EngineError::ApiSimNotRunning.code(), 503);
        assert_eq!(EngineError::ApiSimRunning.code(), 510);
    }

    #[test]
    fn messages_name_the_offending_element() {
        let err = EngineError::UndefinedName {
            kind: "node",
            name: "OUT-9".into(),
        };
        assert!(err.to_string().contains("OUT-9"));
        assert!(EngineError::ApiSimRunning
            .to_string()
            .contains("between runs"));
    }
}
