use std::fmt::Display;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;

use crate::error::CalibrationError;
use crate::fitter::common::ParameterRole;
use crate::fitter::main_fitter::FitModel;
use crate::fitter::outlier_gate::{GateRule, OutlierGate};
use crate::fitter::refiner::{ShrinkRule, ShrinkSchedule};
use crate::fitter::uncertainty::UncertaintyEstimator;

#[derive(Debug, Clone, Copy, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct BinRange {
    pub min: f64,
    pub max: f64,
}

impl BinRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn center(&self) -> f64 {
        0.5 * (self.min + self.max)
    }

    pub fn as_tuple(&self) -> (f64, f64) {
        (self.min, self.max)
    }

    fn validate(&self, what: &str) -> Result<(), CalibrationError> {
        if self.min.is_finite() && self.max.is_finite() && self.min < self.max {
            Ok(())
        } else {
            Err(CalibrationError::Config(format!(
                "{what} range {self} must satisfy min < max"
            )))
        }
    }
}

impl Display for BinRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{}", self.min, self.max)
    }
}

/// A trend model with optional starting values.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct TrendFit {
    #[serde(flatten)]
    pub model: FitModel,
    #[serde(default)]
    pub seeds: Option<Vec<f64>>,
}

impl TrendFit {
    fn validate(&self, what: &str) -> Result<(), CalibrationError> {
        match &self.seeds {
            Some(seeds) if seeds.len() != self.model.number_of_parameters() => {
                Err(CalibrationError::Config(format!(
                    "{what}: {} seed(s) given for a model with {} parameter(s)",
                    seeds.len(),
                    self.model.number_of_parameters()
                )))
            }
            _ => Ok(()),
        }
    }
}

fn non_empty<T>(items: &[T], what: &str) -> Result<(), CalibrationError> {
    if items.is_empty() {
        Err(CalibrationError::Config(format!("no {what} configured")))
    } else {
        Ok(())
    }
}

fn positive_tries(tries: usize) -> Result<(), CalibrationError> {
    if tries == 0 {
        Err(CalibrationError::Config(
            "number_of_fit_tries must be at least 1".to_owned(),
        ))
    } else {
        Ok(())
    }
}

fn default_fit_tries() -> usize {
    5
}

fn default_trend_shrink() -> ShrinkSchedule {
    ShrinkSchedule::uniform(ShrinkRule::Offset {
        below: 6.0,
        above: 4.0,
        power: 3,
    })
}

/// Input file for one of the calibration programs.
///
/// Every file names the program it was written for in `status`. A directory
/// may be given instead of a file, in which case `<dir>/<status>.yaml` (then
/// `.json`) is read.
pub trait CalibrationConfig: DeserializeOwned {
    const STATUS: &'static str;

    fn validate(&self) -> Result<(), CalibrationError>;

    fn load(path: &Path) -> Result<Self, CalibrationError> {
        let path = resolve(path, Self::STATUS)?;
        let text = std::fs::read_to_string(&path)?;

        #[derive(serde::Deserialize)]
        struct Status {
            status: String,
        }

        let is_json = path.extension().and_then(|ext| ext.to_str()) == Some("json");
        let status: Status = if is_json {
            serde_json::from_str(&text)?
        } else {
            serde_yaml::from_str(&text)?
        };
        if status.status != Self::STATUS {
            return Err(CalibrationError::Status {
                expected: Self::STATUS.to_owned(),
                found: status.status,
            });
        }

        let config: Self = if is_json {
            serde_json::from_str(&text)?
        } else {
            serde_yaml::from_str(&text)?
        };
        config.validate()?;

        log::info!("Loaded {} configuration from {}", Self::STATUS, path.display());
        Ok(config)
    }
}

fn resolve(path: &Path, status: &str) -> Result<PathBuf, CalibrationError> {
    if path.is_file() {
        return Ok(path.to_path_buf());
    }
    if path.is_dir() {
        for extension in ["yaml", "json"] {
            let candidate = path.join(format!("{status}.{extension}"));
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        return Err(CalibrationError::Config(format!(
            "directory {} holds neither {status}.yaml nor {status}.json",
            path.display()
        )));
    }
    Err(CalibrationError::Config(format!(
        "input file {} does not exist",
        path.display()
    )))
}

/// Per detector and residual variable settings.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct VariableCalibration {
    /// Fits with `|mean|` or `|sigma|` at or above this are outliers.
    pub abs_max: f64,
    /// Fits with `|sigma|` below this are treated as collapsed.
    #[serde(default)]
    pub abs_min: f64,
    pub means_fit: ChargeFits,
    pub sigmas_fit: ChargeFits,
}

impl VariableCalibration {
    pub fn gate(&self) -> OutlierGate {
        OutlierGate::new(vec![
            GateRule::new(ParameterRole::Mean, 0.0, self.abs_max),
            GateRule::new(ParameterRole::Sigma, self.abs_min, self.abs_max),
        ])
    }
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ChargeFits {
    pub pos: TrendFit,
    pub neg: TrendFit,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct DetectorConfig {
    pub name: String,
    pub dphi: VariableCalibration,
    pub dz: VariableCalibration,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ResidualsConfig {
    pub status: String,
    pub run_name: String,
    pub input_file: PathBuf,
    pub output_dir: PathBuf,
    pub detectors_to_calibrate: Vec<DetectorConfig>,
    pub pt_bins: Vec<BinRange>,
    pub zdc_bins: Vec<BinRange>,
    pub centrality_bins: Vec<BinRange>,
    #[serde(default = "default_fit_tries")]
    pub number_of_fit_tries: usize,
    #[serde(default = "ResidualsConfig::default_min_integral")]
    pub min_integral: f64,
    #[serde(default)]
    pub draw_distributions: bool,
    #[serde(default = "ResidualsConfig::default_signal_model")]
    pub signal_model: FitModel,
    #[serde(default = "ResidualsConfig::default_shrink")]
    pub shrink: ShrinkSchedule,
    #[serde(default = "default_trend_shrink")]
    pub trend_shrink: ShrinkSchedule,
    #[serde(default)]
    pub uncertainty: UncertaintyEstimator,
}

impl ResidualsConfig {
    fn default_min_integral() -> f64 {
        300.0
    }

    fn default_signal_model() -> FitModel {
        FitModel::GaussianWithBackground
    }

    pub fn default_shrink() -> ShrinkSchedule {
        use ParameterRole::{Amplitude, BackgroundAmplitude, BackgroundMean, BackgroundSigma, Mean, Sigma};

        ShrinkSchedule::uniform(ShrinkRule::Scale { k: 2.0, power: 3 })
            .with(Amplitude, ShrinkRule::Scale { k: 2.0, power: 3 })
            .with(
                Mean,
                ShrinkRule::Offset {
                    below: 6.0,
                    above: 4.0,
                    power: 3,
                },
            )
            .with(Sigma, ShrinkRule::Scale { k: 5.0, power: 3 })
            .with(BackgroundAmplitude, ShrinkRule::Scale { k: 5.0, power: 2 })
            .with(
                BackgroundMean,
                ShrinkRule::Offset {
                    below: 6.0,
                    above: 4.0,
                    power: 2,
                },
            )
            .with(BackgroundSigma, ShrinkRule::Scale { k: 5.0, power: 2 })
    }
}

impl CalibrationConfig for ResidualsConfig {
    const STATUS: &'static str = "sigmalized_residuals";

    fn validate(&self) -> Result<(), CalibrationError> {
        non_empty(&self.detectors_to_calibrate, "detectors_to_calibrate")?;
        non_empty(&self.pt_bins, "pt_bins")?;
        non_empty(&self.zdc_bins, "zdc_bins")?;
        non_empty(&self.centrality_bins, "centrality_bins")?;
        positive_tries(self.number_of_fit_tries)?;

        for bin in &self.pt_bins {
            bin.validate("pT")?;
        }
        for bin in &self.zdc_bins {
            bin.validate("zDC")?;
        }
        for bin in &self.centrality_bins {
            bin.validate("centrality")?;
        }
        if self.min_integral < 0.0 {
            return Err(CalibrationError::Config(
                "min_integral must not be negative".to_owned(),
            ));
        }
        if !matches!(
            self.signal_model,
            FitModel::Gaussian | FitModel::GaussianWithBackground
        ) {
            return Err(CalibrationError::Config(format!(
                "signal_model must be gaussian or gaussian_with_background, not {:?}",
                self.signal_model
            )));
        }

        for detector in &self.detectors_to_calibrate {
            for (name, variable) in [("dphi", &detector.dphi), ("dz", &detector.dz)] {
                let what = format!("{} {name}", detector.name);
                if variable.abs_max <= variable.abs_min {
                    return Err(CalibrationError::Config(format!(
                        "{what}: abs_max must be larger than abs_min"
                    )));
                }
                variable.means_fit.pos.validate(&what)?;
                variable.means_fit.neg.validate(&what)?;
                variable.sigmas_fit.pos.validate(&what)?;
                variable.sigmas_fit.neg.validate(&what)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct TowerSectorConfig {
    pub name: String,
    pub number_of_y_towers: usize,
    pub number_of_z_towers: usize,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct TowerOffsetConfig {
    pub status: String,
    pub run_name: String,
    pub input_file: PathBuf,
    pub output_dir: PathBuf,
    pub sectors_to_calibrate: Vec<TowerSectorConfig>,
    /// ADC bins whose upper edge is below this are not used.
    #[serde(default = "TowerOffsetConfig::default_fit_adc_min")]
    pub fit_adc_min: f64,
    #[serde(default = "default_fit_tries")]
    pub number_of_fit_tries: usize,
    #[serde(default)]
    pub draw_distributions: bool,
    #[serde(default = "TowerOffsetConfig::default_shrink")]
    pub shrink: ShrinkSchedule,
}

impl TowerOffsetConfig {
    fn default_fit_adc_min() -> f64 {
        200.0
    }

    fn default_shrink() -> ShrinkSchedule {
        ShrinkSchedule::uniform(ShrinkRule::Scale { k: 2.0, power: 2 })
    }
}

impl CalibrationConfig for TowerOffsetConfig {
    const STATUS: &'static str = "emc_tower_offset";

    fn validate(&self) -> Result<(), CalibrationError> {
        non_empty(&self.sectors_to_calibrate, "sectors_to_calibrate")?;
        positive_tries(self.number_of_fit_tries)?;
        for sector in &self.sectors_to_calibrate {
            if sector.number_of_y_towers == 0 || sector.number_of_z_towers == 0 {
                return Err(CalibrationError::Config(format!(
                    "sector {} has no towers",
                    sector.name
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct RunSectorConfig {
    pub name: String,
    pub adc_ranges: Vec<BinRange>,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct RunOffsetConfig {
    pub status: String,
    pub run_name: String,
    pub input_file: PathBuf,
    pub output_dir: PathBuf,
    pub run_numbers: Vec<u32>,
    pub sectors_to_calibrate: Vec<RunSectorConfig>,
    /// Runs with fewer entries are written as bad.
    #[serde(default = "RunOffsetConfig::default_integral")]
    pub min_run_integral: f64,
    /// Minimum entries in the time window before merged ADC bins are fitted.
    #[serde(default = "RunOffsetConfig::default_integral")]
    pub min_integral: f64,
    #[serde(default = "RunOffsetConfig::default_time_window")]
    pub time_window: BinRange,
    pub mean_vs_adc_fit: TrendFit,
    #[serde(default = "default_fit_tries")]
    pub number_of_fit_tries: usize,
    #[serde(default = "RunOffsetConfig::default_gate")]
    pub gate: OutlierGate,
    #[serde(default = "RunOffsetConfig::default_shrink")]
    pub shrink: ShrinkSchedule,
    #[serde(default = "default_trend_shrink")]
    pub trend_shrink: ShrinkSchedule,
    #[serde(default)]
    pub draw_distributions: bool,
}

impl RunOffsetConfig {
    fn default_integral() -> f64 {
        1000.0
    }

    fn default_time_window() -> BinRange {
        BinRange::new(-10.0, 10.0)
    }

    fn default_gate() -> OutlierGate {
        OutlierGate::new(vec![
            GateRule::new(ParameterRole::Mean, 0.0, 10.0),
            GateRule::new(ParameterRole::Sigma, 0.0, 5.0),
        ])
    }

    pub fn default_shrink() -> ShrinkSchedule {
        ShrinkSchedule::uniform(ShrinkRule::Scale { k: 1.0, power: 2 }).with(
            ParameterRole::Mean,
            ShrinkRule::Spread {
                k: 1.0,
                power: 2,
                width: ParameterRole::Sigma,
            },
        )
    }
}

impl CalibrationConfig for RunOffsetConfig {
    const STATUS: &'static str = "emc_run_by_run_offset";

    fn validate(&self) -> Result<(), CalibrationError> {
        non_empty(&self.sectors_to_calibrate, "sectors_to_calibrate")?;
        non_empty(&self.run_numbers, "run_numbers")?;
        positive_tries(self.number_of_fit_tries)?;
        self.time_window.validate("time window")?;
        self.mean_vs_adc_fit.validate("mean_vs_adc_fit")?;
        for sector in &self.sectors_to_calibrate {
            non_empty(&sector.adc_ranges, &format!("adc_ranges for sector {}", sector.name))?;
            for range in &sector.adc_ranges {
                range.validate("ADC")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESIDUALS: &str = "
status: sigmalized_residuals
run_name: Run14HeAu200
input_file: data/sum.json
output_dir: output
detectors_to_calibrate:
  - name: PC2
    dphi:
      abs_max: 1.0
      means_fit:
        pos: {kind: polynomial, degree: 2}
        neg: {kind: polynomial, degree: 2, seeds: [0.0, 0.1, 0.0]}
      sigmas_fit:
        pos: {kind: exp_polynomial, degree: 1}
        neg: {kind: exp_polynomial, degree: 1}
    dz:
      abs_max: 2.0
      abs_min: 0.05
      means_fit:
        pos: {kind: power_law_offset}
        neg: {kind: power_law_offset}
      sigmas_fit:
        pos: {kind: exponential_offset}
        neg: {kind: exponential_offset}
pt_bins: [{min: 0.5, max: 1.0}, {min: 1.0, max: 2.0}]
zdc_bins: [{min: -30, max: 0}, {min: 0, max: 30}]
centrality_bins: [{min: 0, max: 93}]
";

    fn write(dir: &Path, name: &str, text: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn test_load_residuals_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "residuals.yaml", RESIDUALS);
        let config = ResidualsConfig::load(&path).unwrap();

        assert_eq!(config.number_of_fit_tries, 5);
        assert_eq!(config.min_integral, 300.0);
        assert_eq!(config.signal_model, FitModel::GaussianWithBackground);
        assert_eq!(
            config.detectors_to_calibrate[0].dphi.means_fit.neg.seeds,
            Some(vec![0.0, 0.1, 0.0])
        );
        assert_eq!(
            config.shrink.rule_for(ParameterRole::Sigma),
            ShrinkRule::Scale { k: 5.0, power: 3 }
        );
        assert_eq!(config.detectors_to_calibrate[0].dz.gate().rules[1].min_abs, 0.05);
    }

    #[test]
    fn test_directory_lookup_and_status() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "sigmalized_residuals.yaml", RESIDUALS);
        assert!(ResidualsConfig::load(dir.path()).is_ok());

        let error = TowerOffsetConfig::load(dir.path()).unwrap_err();
        assert!(matches!(error, CalibrationError::Config(_)));

        let path = write(dir.path(), "wrong.yaml", &RESIDUALS.replace("sigmalized_residuals", "emc_tower_offset"));
        let error = ResidualsConfig::load(&path).unwrap_err();
        assert!(matches!(error, CalibrationError::Status { .. }));
    }

    #[test]
    fn test_validation_fails_before_fitting() {
        let dir = tempfile::tempdir().unwrap();

        let path = write(dir.path(), "a.yaml", &RESIDUALS.replace("centrality_bins: [{min: 0, max: 93}]", "centrality_bins: []"));
        assert!(matches!(ResidualsConfig::load(&path), Err(CalibrationError::Config(_))));

        let path = write(dir.path(), "b.yaml", &RESIDUALS.replace("{min: 1.0, max: 2.0}", "{min: 2.0, max: 1.0}"));
        assert!(matches!(ResidualsConfig::load(&path), Err(CalibrationError::Config(_))));

        let path = write(dir.path(), "c.yaml", &RESIDUALS.replace("seeds: [0.0, 0.1, 0.0]", "seeds: [0.0]"));
        assert!(matches!(ResidualsConfig::load(&path), Err(CalibrationError::Config(_))));

        assert!(matches!(
            ResidualsConfig::load(&dir.path().join("missing.yaml")),
            Err(CalibrationError::Config(_))
        ));
    }

    #[test]
    fn test_run_offset_defaults_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "run.json",
            r#"{
                "status": "emc_run_by_run_offset",
                "run_name": "Run14",
                "input_file": "data/runs.json",
                "output_dir": "output",
                "run_numbers": [414988, 414989],
                "sectors_to_calibrate": [{"name": "W0", "adc_ranges": [{"min": 100, "max": 4000}]}],
                "mean_vs_adc_fit": {"kind": "exponential_offset"}
            }"#,
        );
        let config = RunOffsetConfig::load(&path).unwrap();

        assert_eq!(config.time_window, BinRange::new(-10.0, 10.0));
        assert_eq!(config.min_run_integral, 1000.0);
        assert_eq!(config.gate.rules.len(), 2);
        assert!(matches!(
            config.shrink.rule_for(ParameterRole::Mean),
            ShrinkRule::Spread { .. }
        ));
        assert_eq!(config.mean_vs_adc_fit.model, FitModel::ExponentialOffset);
    }
}
