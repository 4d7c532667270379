use std::fmt::Display;
use std::path::PathBuf;

use super::combination::{BinCombination, Charge, ResidualVariable};
use super::trend::fit_trend;
use super::CalibrationPoint;
use crate::config::{BinRange, DetectorConfig, ResidualsConfig, TrendFit, VariableCalibration};
use crate::error::CalibrationError;
use crate::fitter::common::{Data, ParameterRole, Value};
use crate::fitter::levmar::FitPrimitive;
use crate::fitter::main_fitter::{FitFunction, FitModel};
use crate::fitter::models::gaussian::GaussianParams;
use crate::fitter::refiner::{FitResult, IterativeRefiner, RangePolicy};
use crate::histoer::axis::Axis;
use crate::histoer::histo2d::histogram2d::Histogram2D;
use crate::histoer::histo3d::histogram3d::Histogram3D;
use crate::histoer::projector::{BinProjector, Projection, Rejection};
use crate::histoer::source::HistogramSource;
use crate::output::colormaps::ColorScale;
use crate::output::parameter_table::ParameterTable;
use crate::output::plot::{padded_range, PlotCanvas, PlotPoint, BLUE, GREY, RED};
use crate::util::processer::Processor;

/// The fit range is re-centred on `mean ± 5 sigma` between attempts.
const PEAK_WINDOW_SIGMAS: f64 = 5.0;

/// One detector, residual variable and charge: the unit that owns one
/// calibration parameter file.
#[derive(Debug, Clone, Copy)]
pub struct ResidualUnit<'a> {
    pub detector: &'a DetectorConfig,
    pub variable: ResidualVariable,
    pub charge: Charge,
}

impl ResidualUnit<'_> {
    pub fn calibration(&self) -> &VariableCalibration {
        match self.variable {
            ResidualVariable::Dphi => &self.detector.dphi,
            ResidualVariable::Dz => &self.detector.dz,
        }
    }

    /// Trend models for the means and the sigmas.
    pub fn trends(&self) -> (&TrendFit, &TrendFit) {
        let calibration = self.calibration();
        match self.charge {
            Charge::Positive => (&calibration.means_fit.pos, &calibration.sigmas_fit.pos),
            Charge::Negative => (&calibration.means_fit.neg, &calibration.sigmas_fit.neg),
        }
    }

    fn file_stem(&self) -> String {
        format!("{}_{}", self.variable.name(), self.charge.short())
    }
}

impl Display for ResidualUnit<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}, {}",
            self.detector.name,
            self.variable.name(),
            self.charge.label()
        )
    }
}

/// Units for the whole configuration, or for one detector and/or variable.
pub fn units<'a>(
    config: &'a ResidualsConfig,
    detector: Option<usize>,
    variable: Option<ResidualVariable>,
) -> Result<Vec<ResidualUnit<'a>>, CalibrationError> {
    let detectors: Vec<&DetectorConfig> = match detector {
        Some(index) => vec![config.detectors_to_calibrate.get(index).ok_or_else(|| {
            CalibrationError::Config(format!(
                "detector index {index} is out of range ({} detector(s) configured)",
                config.detectors_to_calibrate.len()
            ))
        })?],
        None => config.detectors_to_calibrate.iter().collect(),
    };
    let variables: Vec<ResidualVariable> = match variable {
        Some(variable) => vec![variable],
        None => ResidualVariable::ALL.to_vec(),
    };

    let mut units = Vec::new();
    for detector in detectors {
        for &variable in &variables {
            for charge in Charge::ALL {
                units.push(ResidualUnit {
                    detector,
                    variable,
                    charge,
                });
            }
        }
    }
    Ok(units)
}

/// Calibration points of one (centrality, zDC) cell and the trends through them.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CombinationResult {
    pub centrality: BinRange,
    pub zdc: BinRange,
    pub points: Vec<CalibrationPoint>,
    pub means_fit: FitFunction,
    pub sigmas_fit: FitFunction,
    pub means_result: FitResult,
    pub sigmas_result: FitResult,
}

impl CombinationResult {
    /// Means parameters followed by sigmas parameters.
    pub fn table_row(&self) -> Vec<f64> {
        let mut row = self.means_fit.values();
        row.extend(self.sigmas_fit.values());
        row
    }
}

pub struct ResidualsCalibration<'a> {
    pub config: &'a ResidualsConfig,
    pub source: &'a HistogramSource,
    output: PathBuf,
}

impl<'a> ResidualsCalibration<'a> {
    pub fn new(config: &'a ResidualsConfig, source: &'a HistogramSource) -> Self {
        Self {
            config,
            source,
            output: config.output_dir.join(&config.run_name),
        }
    }

    pub fn table_path(&self, unit: &ResidualUnit<'_>) -> PathBuf {
        self.output.join("CalibrationParameters").join(format!(
            "cal_{}_s{}_{}.txt",
            unit.detector.name,
            unit.variable.name(),
            unit.charge.short()
        ))
    }

    pub fn points_path(&self, unit: &ResidualUnit<'_>) -> PathBuf {
        self.output
            .join(&unit.detector.name)
            .join(format!("points_{}.json", unit.file_stem()))
    }

    fn plot_path(&self, unit: &ResidualUnit<'_>, name: &str) -> PathBuf {
        self.output
            .join(&unit.detector.name)
            .join("plots")
            .join(format!("{}{name}.png", unit.file_stem()))
    }

    /// Calibrates every (centrality, zDC) cell of `unit` and writes its
    /// parameter table, points and plots.
    pub fn calibrate_unit<P: FitPrimitive + ?Sized>(
        &self,
        unit: &ResidualUnit<'_>,
        primitive: &mut P,
    ) -> Result<Vec<CombinationResult>, CalibrationError> {
        let (means_trend, sigmas_trend) = unit.trends();
        let mut table = ParameterTable::new(format!(
            "{} {}",
            means_trend.model.number_of_parameters(),
            sigmas_trend.model.number_of_parameters()
        ));

        let mut results = Vec::new();
        for centrality in &self.config.centrality_bins {
            let first = results.len();
            for zdc in &self.config.zdc_bins {
                let combination = BinCombination {
                    detector: unit.detector.name.clone(),
                    variable: unit.variable,
                    charge: unit.charge,
                    centrality: *centrality,
                    zdc: *zdc,
                    pt: None,
                };
                let hist = self.source.histogram3d(&combination.histogram_key())?;

                let result = self.fit_combination(unit, &combination, hist, primitive)?;
                table.push_values(&result.table_row());
                self.plot_trends(unit, &combination, &result)?;
                results.push(result);
            }
            self.plot_heatmaps(unit, centrality, &results[first..])?;
        }

        table.write(&self.table_path(unit))?;

        let path = self.points_path(unit);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let writer = std::io::BufWriter::new(std::fs::File::create(&path)?);
        serde_json::to_writer_pretty(writer, &results)?;

        log::info!(
            "{unit}: {} point(s) in {} cell(s)",
            results.iter().map(|result| result.points.len()).sum::<usize>(),
            results.len()
        );
        Ok(results)
    }

    /// Scans the pT bins of one combination and fits the trends through the
    /// accepted points.
    pub fn fit_combination<P: FitPrimitive + ?Sized>(
        &self,
        unit: &ResidualUnit<'_>,
        combination: &BinCombination,
        hist: &Histogram3D,
        primitive: &mut P,
    ) -> Result<CombinationResult, CalibrationError> {
        let projector = BinProjector::new(self.config.min_integral);
        let mut points = Vec::new();

        for pt in &self.config.pt_bins {
            let context = combination.with_pt(*pt);
            match projector.project_x(hist, pt.as_tuple(), combination.centrality.as_tuple()) {
                Ok(projection) => {
                    if let Some(point) = self.fit_projection(unit, &context, *pt, &projection, primitive)? {
                        points.push(point);
                    }
                }
                Err(rejection @ Rejection::InsufficientStatistics { .. }) => {
                    log::info!("Skipping {context}: {rejection}");
                }
                Err(rejection) => log::warn!("Skipping {context}: {rejection}"),
            }
        }

        if points.is_empty() {
            return Err(CalibrationError::NoAcceptedPoints {
                combination: combination.to_string(),
            });
        }

        // Relative errors keep single very precise points from dominating the trend
        let mut means = Data::default();
        let mut sigmas = Data::default();
        for point in &points {
            let sigma = point.sigma.value;
            means.push(point.x, point.mean.value, 1.0 + point.mean.uncertainty / sigma);
            sigmas.push(point.x, sigma, 1.0 + point.sigma.uncertainty / sigma);
        }

        let (means_trend, sigmas_trend) = unit.trends();
        let n_tries = self.config.number_of_fit_tries;
        let (means_fit, means_result) = fit_trend(primitive, means_trend, &self.config.trend_shrink, &means, n_tries);
        let (sigmas_fit, sigmas_result) = fit_trend(primitive, sigmas_trend, &self.config.trend_shrink, &sigmas, n_tries);

        Ok(CombinationResult {
            centrality: combination.centrality,
            zdc: combination.zdc,
            points,
            means_fit,
            sigmas_fit,
            means_result,
            sigmas_result,
        })
    }

    /// Fits one accepted projection. `None` when the data is too sparse or the
    /// outlier gate rejects the fit.
    pub fn fit_projection<P: FitPrimitive + ?Sized>(
        &self,
        unit: &ResidualUnit<'_>,
        context: &BinCombination,
        pt: BinRange,
        projection: &Projection,
        primitive: &mut P,
    ) -> Result<Option<CalibrationPoint>, CalibrationError> {
        let hist = &projection.histogram;
        let axis = &hist.axis;
        let data = hist.to_data();
        let bin_width = axis.bin_width(0);
        let maximum = hist.maximum();
        let (min_bin_x, max_bin_x) = (axis.min(), axis.max());
        let (min_x, max_x) = (projection.min_x, projection.max_x);
        let n_tries = self.config.number_of_fit_tries;

        // A narrow single Gaussian around zero seeds the signal shape
        let mut prefit = FitFunction::new(
            FitModel::Gaussian,
            &[1.0, 0.0, 2.0 * bin_width],
            (min_bin_x / 5.0, max_bin_x / 5.0),
        );
        prefit.set_limits(0, maximum / 2.0, maximum);
        prefit.set_limits(1, min_bin_x / 5.0, max_bin_x / 5.0);
        prefit.set_limits(2, bin_width, max_bin_x / 5.0);
        let prefit_result = IterativeRefiner::new(&self.config.shrink).refine(primitive, &mut prefit, &data, n_tries);
        if !prefit_result.is_fitted() {
            log::info!("Skipping {context}: too few populated bins to fit");
            return Ok(None);
        }

        let model = self.config.signal_model.clone();
        let seeds = [prefit.value(0), prefit.value(1), prefit.value(2), 1.0, 0.0, max_x / 2.0];
        let mut main = FitFunction::new(model.clone(), &seeds[..model.number_of_parameters()], (min_bin_x, max_bin_x));
        main.set_limits(0, maximum / 2.0, maximum);
        main.set_limits(1, min_x / 10.0, max_x / 10.0);
        main.set_limits(2, bin_width, (2.0 * max_x + min_x) / 3.0);
        if model == FitModel::GaussianWithBackground {
            main.set_limits(3, maximum / 20.0, maximum);
            main.set_limits(4, 2.0 * min_x, 2.0 * max_x);
            main.set_limits(5, max_x / 3.0, 3.0 * max_x);
        }

        let refiner = IterativeRefiner::new(&self.config.shrink).with_range_policy(RangePolicy::AroundPeak {
            n_sigma: PEAK_WINDOW_SIGMAS,
            axis,
        });
        let result = refiner.refine(primitive, &mut main, &data, n_tries);
        if let Some(outcome) = &result.outcome {
            log::debug!(
                "{context}: chi2/ndf {}/{} after {} iteration(s)",
                outcome.chi2,
                outcome.ndf,
                outcome.iterations
            );
        }

        if let Some((rule, value)) = unit.calibration().gate().violation(&main) {
            log::info!(
                "Rejecting {context}: {:?} {value} is outside {} <= |v| < {}",
                rule.role,
                rule.min_abs,
                rule.max_abs
            );
            return Ok(None);
        }

        let (Some(mean_index), Some(sigma_index)) = (
            main.index_of(ParameterRole::Mean),
            main.index_of(ParameterRole::Sigma),
        ) else {
            return Ok(None);
        };

        let alternates = self.config.uncertainty.alternate_fits(primitive, &main, &data);
        let mean = Value {
            value: main.value(mean_index),
            uncertainty: alternates.uncertainty(mean_index, &main),
        };
        let sigma = Value {
            value: main.value(sigma_index).abs(),
            uncertainty: alternates.uncertainty(sigma_index, &main),
        };
        let amplitude = Value {
            value: main.value(0),
            uncertainty: main.parameters[0].uncertainty,
        };

        if self.config.draw_distributions {
            self.plot_distribution(unit, context, projection, &prefit, &main)?;
        }

        Ok(Some(CalibrationPoint {
            x: pt.center(),
            mean,
            sigma,
            integral: projection.integral,
            signal_yield: GaussianParams::new(amplitude, mean, sigma, bin_width).area.value,
        }))
    }

    fn plot_distribution(
        &self,
        unit: &ResidualUnit<'_>,
        context: &BinCombination,
        projection: &Projection,
        prefit: &FitFunction,
        main: &FitFunction,
    ) -> Result<(), CalibrationError> {
        let hist = &projection.histogram;
        let (x_min, x_max) = (hist.axis.min(), hist.axis.max());
        let mut canvas = PlotCanvas::new(800, 600, (x_min, x_max), (0.0, 1.1 * hist.maximum()));
        canvas.draw_histogram(hist, BLUE);
        canvas.draw_curve(&prefit.curve(prefit.range.0, prefit.range.1, 200), GREY);
        canvas.draw_curve(&main.curve(main.range.0, main.range.1, 400), RED);

        let pt = context.pt.map(|pt| format!("_pT{}-{}", pt.min, pt.max)).unwrap_or_default();
        canvas.save(&self.plot_path(unit, &format!("{}{pt}", context.path_suffix())))
    }

    fn plot_trends(
        &self,
        unit: &ResidualUnit<'_>,
        combination: &BinCombination,
        result: &CombinationResult,
    ) -> Result<(), CalibrationError> {
        let x_range = padded_range(result.points.iter().map(|point| point.x));
        let panels = [
            ("_means", 0.0, &result.means_fit, result.points.iter().map(|p| (p.mean, p.x)).collect::<Vec<_>>()),
            ("_sigmas", 1.0, &result.sigmas_fit, result.points.iter().map(|p| (p.sigma, p.x)).collect::<Vec<_>>()),
        ];

        for (name, reference, trend, values) in panels {
            let points: Vec<PlotPoint> = values
                .iter()
                .map(|(value, x)| PlotPoint {
                    x: *x,
                    y: value.value,
                    error: value.uncertainty,
                })
                .collect();
            let y_range = padded_range(
                points
                    .iter()
                    .flat_map(|p| [p.y - p.error, p.y + p.error])
                    .chain([reference]),
            );

            let mut canvas = PlotCanvas::new(800, 600, x_range, y_range);
            canvas.draw_reference(reference);
            canvas.draw_curve(&trend.curve(trend.range.0, trend.range.1, 200), RED);
            canvas.draw_points(&points, BLUE);
            canvas.save(&self.plot_path(unit, &format!("{}{name}", combination.path_suffix())))?;
        }
        Ok(())
    }

    /// Means and sigmas, and their relative deviation from the trends, vs
    /// zDC and pT for one centrality class.
    fn plot_heatmaps(
        &self,
        unit: &ResidualUnit<'_>,
        centrality: &BinRange,
        results: &[CombinationResult],
    ) -> Result<(), CalibrationError> {
        let (Ok(zdc_axis), Ok(pt_axis)) = (
            contiguous_axis(&self.config.zdc_bins),
            contiguous_axis(&self.config.pt_bins),
        ) else {
            log::debug!("{unit}: zDC or pT bins are not contiguous, no heatmaps drawn");
            return Ok(());
        };

        let new_map = |name: &str| {
            let mut map = Histogram2D::new(name, zdc_axis.clone(), pt_axis.clone());
            map.contents.iter_mut().for_each(|content| *content = f64::NAN);
            map
        };
        let mut means = new_map("means");
        let mut sigmas = new_map("sigmas");
        let mut means_diff = new_map("means diff");
        let mut sigmas_diff = new_map("sigmas diff");

        for result in results {
            let Some(x_bin) = zdc_axis.find_bin(result.zdc.center()) else {
                continue;
            };
            for point in &result.points {
                let Some(y_bin) = pt_axis.find_bin(point.x) else {
                    continue;
                };
                let (mean, sigma) = (point.mean.value, point.sigma.value);
                means.set_content(x_bin, y_bin, mean);
                sigmas.set_content(x_bin, y_bin, sigma);
                means_diff.set_content(x_bin, y_bin, ((mean - result.means_fit.eval(point.x)) / mean).abs());
                sigmas_diff.set_content(x_bin, y_bin, ((sigma - result.sigmas_fit.eval(point.x)) / sigma).abs());
            }
        }

        let suffix = format!("_c{}-{}", centrality.min, centrality.max);
        for map in [means, sigmas, means_diff, sigmas_diff] {
            let x_range = (map.x.min(), map.x.max());
            let y_range = (map.y.min(), map.y.max());
            let mut canvas = PlotCanvas::new(800, 600, x_range, y_range);
            canvas.draw_heatmap(&map, &ColorScale::spanning(&map.contents));
            let name = format!("{suffix}_{}", map.name.replace(' ', "_"));
            canvas.save(&self.plot_path(unit, &name))?;
        }
        Ok(())
    }
}

/// Axis whose bins are `bins`, when they tile a range without gaps.
fn contiguous_axis(bins: &[BinRange]) -> Result<Axis, String> {
    let mut edges: Vec<f64> = bins.iter().map(|bin| bin.min).collect();
    if let Some(last) = bins.last() {
        edges.push(last.max);
    }
    if bins.windows(2).any(|pair| pair[0].max != pair[1].min) {
        return Err("bins leave gaps".to_owned());
    }
    Axis::from_edges(edges)
}

/// Runs the residual calibration over the selected units.
pub fn run(
    config: &ResidualsConfig,
    processor: &Processor,
    detector: Option<usize>,
    variable: Option<ResidualVariable>,
) -> Result<(), CalibrationError> {
    let units = units(config, detector, variable)?;
    let source = HistogramSource::open(&config.input_file)?;
    let calibration = ResidualsCalibration::new(config, &source);

    processor.run("Sigmalized residuals", &units, |unit, fitter| {
        calibration.calibrate_unit(unit, fitter).map(|_| ())
    })
}
