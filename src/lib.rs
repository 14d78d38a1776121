//! # Stormflow
//!
//! A discrete-time urban stormwater runoff and drainage network
//! simulation engine. Given a drainage network — rain gages,
//! subcatchments, nodes, links, pollutants, and control rules — and a
//! simulation horizon, the engine advances the coupled hydrologic and
//! hydraulic state in time, producing per-element time series,
//! cumulative mass-balance statistics, and a binary results file.
//!
//! ## Overview
//!
//! The library is organized into several modules:
//!
//! - [`project`] - The project store: typed object vectors, options, and
//!   open-time validation
//! - [`index`] - Case-insensitive element name index
//! - [`units`] - Unit system and conversion factors
//! - [`table`] - Curves, time series, and time patterns
//! - [`xsect`] - Cross-section geometry
//! - [`gage`] - Rain gages
//! - [`infil`] - Infiltration models (Horton, Green-Ampt, Curve Number)
//! - [`lid`] - Low-impact-development units
//! - [`subcatch`] - Subcatchments and runoff generation
//! - [`gwater`] - Groundwater
//! - [`snow`] - Snow accumulation and melt
//! - [`inflow`] - External, dry-weather, and RDII inflows
//! - [`node`] / [`link`] - The drainage network elements
//! - [`pollut`] / [`treatment`] / [`quality`] - The pollutant kernel
//! - [`controls`] - Control rules
//! - [`routing`] / [`dynwave`] - Flow routing kernels
//! - [`massbal`] / [`stats`] - Mass balance and statistics
//! - [`output`] - Binary results file
//! - [`engine`] - The runtime controller and live API
//!
//! ## Example
//!
//! ```no_run
//! use stormflow::engine::Engine;
//!
//! let mut engine = Engine::open("model.json", "model.rpt", "model.out").unwrap();
//! engine.start(true).unwrap();
//! while engine.step().unwrap() > 0.0 {}
//! engine.end().unwrap();
//! engine.report().unwrap();
//! engine.close().unwrap();
//! ```

pub mod controls;
pub mod dynwave;
pub mod engine;
pub mod error;
pub mod gage;
pub mod gwater;
pub mod index;
pub mod infil;
pub mod inflow;
pub mod lid;
pub mod link;
pub mod massbal;
pub mod node;
pub mod output;
pub mod pollut;
pub mod project;
pub mod quality;
pub mod routing;
pub mod snow;
pub mod stats;
pub mod subcatch;
pub mod table;
pub mod treatment;
pub mod units;
pub mod xsect;

pub use engine::{Engine, EngineState, ObjectKind};
pub use error::{EngineError, Result};
pub use project::Project;
