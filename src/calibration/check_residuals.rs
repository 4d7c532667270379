use std::path::PathBuf;

use super::combination::{BinCombination, ResidualVariable};
use super::residuals::{units, ResidualUnit, ResidualsCalibration};
use super::trend::scan_range;
use super::CalibrationPoint;
use crate::config::{BinRange, ResidualsConfig};
use crate::error::CalibrationError;
use crate::fitter::common::{ParameterRole, Value};
use crate::fitter::levmar::FitPrimitive;
use crate::fitter::main_fitter::{FitFunction, FitModel};
use crate::fitter::models::gaussian::GaussianParams;
use crate::fitter::refiner::IterativeRefiner;
use crate::histoer::axis::Axis;
use crate::histoer::histo1d::histogram1d::Histogram;
use crate::histoer::histo3d::histogram3d::Histogram3D;
use crate::histoer::projector::{BinProjector, Projection, Rejection};
use crate::histoer::source::HistogramSource;
use crate::output::parameter_table::ParameterTable;
use crate::output::plot::{padded_range, PlotCanvas, PlotPoint, BLACK, BLUE, GREY, RED};
use crate::util::processer::Processor;

/// Window of the sigmalized distribution that is fitted.
const SIGMALIZED_WINDOW: (f64, f64) = (-5.0, 5.0);

/// Window of the narrow Gaussian that seeds the main fit.
const PREFIT_WINDOW: (f64, f64) = (-0.5, 0.5);

const CELL_COLORS: [image::Rgb<u8>; 4] = [BLUE, RED, BLACK, GREY];

/// Means and sigma trends of one unit, read back from its calibration table
/// in (centrality, zDC) order.
pub type CellTrends = Vec<(FitFunction, FitFunction)>;

/// Sigmalized means and sigmas of one (centrality, zDC) cell and the
/// correction that would bring them to 0 and 1.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CellCheck {
    pub centrality: BinRange,
    pub zdc: BinRange,
    pub points: Vec<CalibrationPoint>,
    /// Added to the sigmalized value: minus the weighted mean of the means.
    pub mean_shift: f64,
    /// Multiplies the sigmalized value: one over the weighted mean of the sigmas.
    pub sigma_scale: f64,
}

impl CellCheck {
    fn new(centrality: BinRange, zdc: BinRange, points: Vec<CalibrationPoint>) -> Self {
        // weights from the alternate-fit spread relative to the width, not the fit errors
        let weights: Vec<f64> = points
            .iter()
            .map(|point| (1.0 + point.mean.uncertainty / point.sigma.value).powi(-2))
            .collect();
        let total: f64 = weights.iter().sum();
        let weighted = |value: fn(&CalibrationPoint) -> f64| {
            points.iter().zip(&weights).map(|(point, w)| w * value(point)).sum::<f64>() / total
        };

        Self {
            centrality,
            zdc,
            mean_shift: -weighted(|point| point.mean.value),
            sigma_scale: 1.0 / weighted(|point| point.sigma.value),
            points,
        }
    }
}

/// The residual projection on the sigmalized axis `s = (x - mean) / sigma`.
///
/// The map is linear within one pT bin, so the contents carry over unchanged
/// and only the bin edges move. `None` when `sigma` is not a positive number.
pub fn sigmalize(hist: &Histogram, mean: f64, sigma: f64) -> Option<Histogram> {
    if !(sigma.is_finite() && sigma > 0.0 && mean.is_finite()) {
        return None;
    }
    let edges = hist.axis.edges().iter().map(|edge| (edge - mean) / sigma).collect();
    let axis = Axis::from_edges(edges).ok()?;
    Some(Histogram::with_contents(
        &format!("s{}", hist.name),
        axis,
        hist.contents.clone(),
        hist.sumw2.clone(),
    ))
}

/// Applies written residual calibrations to the residual histograms and
/// fits the sigmalized distributions, which should peak at 0 with width 1.
pub struct ResidualsCheck<'a> {
    pub config: &'a ResidualsConfig,
    pub source: &'a HistogramSource,
    output: PathBuf,
}

impl<'a> ResidualsCheck<'a> {
    pub fn new(config: &'a ResidualsConfig, source: &'a HistogramSource) -> Self {
        Self {
            config,
            source,
            output: config.output_dir.join(&config.run_name),
        }
    }

    pub fn recal_path(&self, unit: &ResidualUnit<'_>) -> PathBuf {
        self.output.join("CalibrationParameters").join(format!(
            "recal_{}_s{}_{}.txt",
            unit.detector.name,
            unit.variable.name(),
            unit.charge.short()
        ))
    }

    fn plot_path(&self, unit: &ResidualUnit<'_>, name: &str, centrality: &BinRange) -> PathBuf {
        self.output.join(&unit.detector.name).join("check").join(format!(
            "{name}_s{}_{}_c{}-{}.png",
            unit.variable.name(),
            unit.charge.short(),
            centrality.min,
            centrality.max
        ))
    }

    /// Reads the calibration table of `unit` and rebuilds its trend curves.
    pub fn load_trends(&self, unit: &ResidualUnit<'_>) -> Result<CellTrends, CalibrationError> {
        let path = ResidualsCalibration::new(self.config, self.source).table_path(unit);
        let table = ParameterTable::read(&path)?;
        let malformed = |reason: String| CalibrationError::Table {
            path: path.clone(),
            reason,
        };

        let (means_trend, sigmas_trend) = unit.trends();
        let (n_means, n_sigmas) = (
            means_trend.model.number_of_parameters(),
            sigmas_trend.model.number_of_parameters(),
        );
        let expected_header = [n_means as f64, n_sigmas as f64];
        if table.header_values() != expected_header {
            return Err(malformed(format!(
                "header \"{}\" does not match the configured trends ({n_means} {n_sigmas})",
                table.header()
            )));
        }
        let cells = self.config.centrality_bins.len() * self.config.zdc_bins.len();
        if table.len() != cells {
            return Err(malformed(format!("{} row(s) for {cells} cell(s)", table.len())));
        }

        let range = scan_range(self.config.pt_bins.iter().map(BinRange::center));
        (0..cells)
            .map(|row| {
                let values = table.values(row).unwrap_or_default();
                if values.len() != n_means + n_sigmas {
                    return Err(malformed(format!(
                        "row {} has {} value(s), expected {}",
                        row + 1,
                        values.len(),
                        n_means + n_sigmas
                    )));
                }
                Ok((
                    FitFunction::new(means_trend.model.clone(), &values[..n_means], range),
                    FitFunction::new(sigmas_trend.model.clone(), &values[n_means..], range),
                ))
            })
            .collect()
    }

    /// Checks every cell of `unit` and writes `recal_<detector>_s<variable>_<charge>.txt`:
    /// header `1 1`, then `mean_shift sigma_scale` per cell.
    pub fn check_unit<P: FitPrimitive + ?Sized>(
        &self,
        unit: &ResidualUnit<'_>,
        primitive: &mut P,
    ) -> Result<Vec<CellCheck>, CalibrationError> {
        let trends = self.load_trends(unit)?;
        let mut table = ParameterTable::new("1 1");
        let mut cells = Vec::with_capacity(trends.len());

        let mut trends = trends.iter();
        for centrality in &self.config.centrality_bins {
            let first = cells.len();
            for zdc in &self.config.zdc_bins {
                let combination = BinCombination {
                    detector: unit.detector.name.clone(),
                    variable: unit.variable,
                    charge: unit.charge,
                    centrality: *centrality,
                    zdc: *zdc,
                    pt: None,
                };
                let (means_fit, sigmas_fit) = trends.next().ok_or_else(|| {
                    CalibrationError::Config(format!("no calibration row for {combination}"))
                })?;
                let hist = self.source.histogram3d(&combination.histogram_key())?;

                let cell = self.check_cell(&combination, hist, (means_fit, sigmas_fit), primitive)?;
                table.push_values(&[cell.mean_shift, cell.sigma_scale]);
                cells.push(cell);
            }
            self.plot_centrality(unit, centrality, &cells[first..])?;
        }

        table.write(&self.recal_path(unit))?;

        let worst_mean = cells.iter().flat_map(|cell| &cell.points).map(|p| p.mean.value.abs()).fold(0.0, f64::max);
        let worst_sigma = cells
            .iter()
            .flat_map(|cell| &cell.points)
            .map(|p| (p.sigma.value - 1.0).abs())
            .fold(0.0, f64::max);
        log::info!("{unit}: sigmalized |mean| <= {worst_mean:.3}, |sigma - 1| <= {worst_sigma:.3}");
        Ok(cells)
    }

    /// Sigmalizes and fits every pT bin of one combination.
    pub fn check_cell<P: FitPrimitive + ?Sized>(
        &self,
        combination: &BinCombination,
        hist: &Histogram3D,
        (means_fit, sigmas_fit): (&FitFunction, &FitFunction),
        primitive: &mut P,
    ) -> Result<CellCheck, CalibrationError> {
        let projector = BinProjector::new(self.config.min_integral);
        let mut points = Vec::new();

        for pt in &self.config.pt_bins {
            let context = combination.with_pt(*pt);
            let projection = match projector.project_x(hist, pt.as_tuple(), combination.centrality.as_tuple()) {
                Ok(projection) => projection,
                Err(rejection @ Rejection::InsufficientStatistics { .. }) => {
                    log::info!("Skipping {context}: {rejection}");
                    continue;
                }
                Err(rejection) => {
                    log::warn!("Skipping {context}: {rejection}");
                    continue;
                }
            };

            let (mean, sigma) = (means_fit.eval(pt.center()), sigmas_fit.eval(pt.center()));
            let Some(sigmalized) = sigmalize(&projection.histogram, mean, sigma) else {
                log::warn!("Skipping {context}: calibrated sigma {sigma} cannot sigmalize");
                continue;
            };
            let sigmalized = Projection {
                histogram: sigmalized,
                ..projection
            };
            if let Some(point) = self.fit_sigmalized(&context, *pt, &sigmalized, primitive) {
                points.push(point);
            }
        }

        if points.is_empty() {
            return Err(CalibrationError::NoAcceptedPoints {
                combination: combination.to_string(),
            });
        }
        Ok(CellCheck::new(combination.centrality, combination.zdc, points))
    }

    /// Gaussian plus wide Gaussian background on the sigmalized axis, seeded
    /// by a narrow Gaussian around zero.
    fn fit_sigmalized<P: FitPrimitive + ?Sized>(
        &self,
        context: &BinCombination,
        pt: BinRange,
        projection: &Projection,
        primitive: &mut P,
    ) -> Option<CalibrationPoint> {
        let hist = &projection.histogram;
        let data = hist.to_data();
        let maximum = hist.maximum();

        let mut prefit = FitFunction::new(FitModel::Gaussian, &[1.0, 0.0, 1.0], PREFIT_WINDOW);
        prefit.set_limits(0, maximum / 2.0, maximum);
        prefit.set_limits(1, -0.5, 0.5);
        prefit.set_limits(2, 0.5, 2.0);
        primitive.fit(&mut prefit, &data);

        let seeds = [prefit.value(0), prefit.value(1), prefit.value(2), maximum / 20.0, 0.0, 2.0];
        let mut main = FitFunction::new(FitModel::GaussianWithBackground, &seeds, SIGMALIZED_WINDOW);
        main.set_limits(0, maximum / 2.0, maximum);
        main.set_limits(1, -0.5, 0.5);
        main.set_limits(2, 0.5, 2.0);
        main.set_limits(3, maximum / 20.0, maximum);
        main.set_limits(4, -10.0, 10.0);
        main.set_limits(5, 2.0, 50.0);

        let result = IterativeRefiner::new(&self.config.shrink).refine(
            primitive,
            &mut main,
            &data,
            self.config.number_of_fit_tries,
        );
        if !result.is_fitted() {
            log::info!("Skipping {context}: too few populated bins to fit");
            return None;
        }

        let (mean_index, sigma_index) = (1, 2);
        let (mean, sigma) = (main.value(mean_index), main.value(sigma_index).abs());
        if mean.abs() > 1.0 || (sigma - 1.0).abs() > 1.0 {
            log::info!("Rejecting {context}: sigmalized mean {mean}, sigma {sigma}");
            return None;
        }

        let alternates = self.config.uncertainty.alternate_fits(primitive, &main, &data);
        let mean = Value {
            value: mean,
            uncertainty: alternates.uncertainty(mean_index, &main),
        };
        let sigma = Value {
            value: sigma,
            uncertainty: alternates.uncertainty(sigma_index, &main),
        };
        let amplitude = main
            .index_of(ParameterRole::Amplitude)
            .map(|i| Value {
                value: main.value(i),
                uncertainty: main.parameters[i].uncertainty,
            })
            .unwrap_or_default();

        Some(CalibrationPoint {
            x: pt.center(),
            mean,
            sigma,
            integral: projection.integral,
            signal_yield: GaussianParams::new(amplitude, mean, sigma, hist.axis.bin_width(0)).area.value,
        })
    }

    /// Sigmalized means and sigmas vs pT for every zDC cell of one centrality class.
    fn plot_centrality(
        &self,
        unit: &ResidualUnit<'_>,
        centrality: &BinRange,
        cells: &[CellCheck],
    ) -> Result<(), CalibrationError> {
        let x_range = padded_range(self.config.pt_bins.iter().flat_map(|pt| [pt.min, pt.max]));
        let panels: [(&str, f64, (f64, f64), fn(&CalibrationPoint) -> Value); 2] = [
            ("means", 0.0, (-1.0, 1.0), |point| point.mean),
            ("sigmas", 1.0, (0.0, 2.0), |point| point.sigma),
        ];

        for (name, reference, y_range, value) in panels {
            let mut canvas = PlotCanvas::new(800, 600, x_range, y_range);
            canvas.draw_reference(reference);
            for (cell, color) in cells.iter().zip(CELL_COLORS.iter().cycle()) {
                let points: Vec<PlotPoint> = cell
                    .points
                    .iter()
                    .map(|point| PlotPoint {
                        x: point.x,
                        y: value(point).value,
                        error: value(point).uncertainty,
                    })
                    .collect();
                canvas.draw_points(&points, *color);
            }
            canvas.save(&self.plot_path(unit, name, centrality))?;
        }
        Ok(())
    }
}

/// Checks the written residual calibrations of the selected units.
pub fn run(
    config: &ResidualsConfig,
    processor: &Processor,
    detector: Option<usize>,
    variable: Option<ResidualVariable>,
) -> Result<(), CalibrationError> {
    let units = units(config, detector, variable)?;
    let source = HistogramSource::open(&config.input_file)?;
    let check = ResidualsCheck::new(config, &source);

    processor.run("Sigmalized residuals check", &units, |unit, fitter| {
        check.check_unit(unit, fitter).map(|_| ())
    })
}
