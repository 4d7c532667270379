pub mod check_residuals;
pub mod check_timing;
pub mod combination;
pub mod residuals;
pub mod run_offset;
pub mod tower_offset;
pub mod trend;

use crate::fitter::common::Value;

/// Fitted peak position and width of one accepted projection.
#[derive(Debug, Clone, Copy, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct CalibrationPoint {
    /// Position on the scan axis (pT or ADC).
    pub x: f64,
    pub mean: Value,
    pub sigma: Value,
    /// Entries in the projection that was fitted.
    pub integral: f64,
    /// Area under the signal peak.
    pub signal_yield: f64,
}
