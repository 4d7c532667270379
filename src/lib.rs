//! Iterative-fit calibration of PHENIX track-matching residuals and EMCal
//! timing offsets.
//!
//! Each program reads a YAML or JSON input file, pulls histograms from a
//! histogram source, fits projections with shrinking parameter bounds and
//! writes whitespace-separated parameter tables next to PNG plots.
#![warn(clippy::all, rust_2018_idioms)]

pub mod calibration;
pub mod config;
pub mod error;
pub mod fitter;
pub mod histoer;
pub mod output;
pub mod util;
