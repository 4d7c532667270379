use std::fmt::Display;
use std::path::{Path, PathBuf};

use super::trend::fit_trend;
use super::CalibrationPoint;
use crate::config::{RunOffsetConfig, RunSectorConfig};
use crate::error::CalibrationError;
use crate::fitter::common::{Data, ParameterRole, Value};
use crate::fitter::levmar::FitPrimitive;
use crate::fitter::main_fitter::{FitFunction, FitModel};
use crate::fitter::models::gaussian::GaussianParams;
use crate::fitter::outlier_gate::OutlierGate;
use crate::fitter::refiner::IterativeRefiner;
use crate::histoer::histo2d::histogram2d::Histogram2D;
use crate::histoer::projector::{BinProjector, MergedSlice};
use crate::histoer::source::HistogramSource;
use crate::output::parameter_table::ParameterTable;
use crate::output::plot::{padded_range, PlotCanvas, PlotPoint, BLUE, GREY, RED};
use crate::util::processer::Processor;

/// Name of the t (y) vs ADC (x) histogram of one sector in one run.
pub fn histogram_key(sector: &str, run: u32) -> String {
    format!("traw vs ADC: {sector}, run {run}")
}

/// Result for one run of a sector. `trend` is `None` for runs written as bad.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RunOffset {
    pub run: u32,
    pub points: Vec<CalibrationPoint>,
    pub trend: Option<FitFunction>,
}

impl RunOffset {
    fn bad(run: u32) -> Self {
        Self {
            run,
            points: Vec::new(),
            trend: None,
        }
    }

    fn push_to(&self, table: &mut ParameterTable) {
        match &self.trend {
            Some(trend) => table.push_row(&[self.run, 1], &trend.values()),
            None => table.push_row(&[self.run, 0], &[]),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RunSectorUnit<'a> {
    pub sector: &'a RunSectorConfig,
}

impl Display for RunSectorUnit<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sector {} (run by run)", self.sector.name)
    }
}

pub struct RunOffsetCalibration<'a> {
    pub config: &'a RunOffsetConfig,
    pub source: &'a HistogramSource,
    output: PathBuf,
}

impl<'a> RunOffsetCalibration<'a> {
    pub fn new(config: &'a RunOffsetConfig, source: &'a HistogramSource) -> Self {
        Self {
            config,
            source,
            output: config.output_dir.join(&config.run_name),
        }
    }

    pub fn table_path(&self, sector: &RunSectorConfig) -> PathBuf {
        self.output
            .join("CalibrationParameters")
            .join(format!("run_offset_{}.txt", sector.name))
    }

    /// Fits every configured run of the sector and writes
    /// `run_offset_<sector>.txt`: the number of runs, then `run 1 p...` for
    /// calibrated runs and `run 0` for bad ones.
    pub fn calibrate_sector<P: FitPrimitive + ?Sized>(
        &self,
        unit: &RunSectorUnit<'_>,
        primitive: &mut P,
    ) -> Result<Vec<RunOffset>, CalibrationError> {
        let sector = unit.sector;
        let mut table = ParameterTable::new(self.config.run_numbers.len());
        let mut runs = Vec::with_capacity(self.config.run_numbers.len());

        for &run in &self.config.run_numbers {
            let hist = self.source.histogram2d(&histogram_key(&sector.name, run))?;
            let offset = self.calibrate_run(sector, run, hist, primitive)?;
            offset.push_to(&mut table);
            runs.push(offset);
        }

        table.write(&self.table_path(sector))?;
        log::info!(
            "{unit}: {} of {} run(s) calibrated",
            runs.iter().filter(|run| run.trend.is_some()).count(),
            runs.len()
        );
        Ok(runs)
    }

    pub fn calibrate_run<P: FitPrimitive + ?Sized>(
        &self,
        sector: &RunSectorConfig,
        run: u32,
        hist: &Histogram2D,
        primitive: &mut P,
    ) -> Result<RunOffset, CalibrationError> {
        let integral = hist.integral();
        if integral < self.config.min_run_integral {
            log::info!(
                "Sector {} run {run}: {integral} entries is below {}, written as bad",
                sector.name,
                self.config.min_run_integral
            );
            return Ok(RunOffset::bad(run));
        }

        let projector = BinProjector::new(self.config.min_integral);
        let mut points = Vec::new();
        for adc_range in &sector.adc_ranges {
            for slice in projector.merge_scan(hist, adc_range.as_tuple(), self.config.time_window.as_tuple()) {
                if let Some(point) = self.fit_slice(sector, run, &slice, primitive)? {
                    points.push(point);
                }
            }
        }

        if points.is_empty() {
            // one run without usable slices does not spoil the rest of the sector
            log::error!(
                "Sector {} run {run}: no accepted fit in any ADC range, written as bad",
                sector.name
            );
            return Ok(RunOffset::bad(run));
        }

        // unweighted: every accepted slice counts the same
        let mut means = Data::default();
        for point in &points {
            means.push(point.x, point.mean.value, 1.0);
        }
        let (trend, _) = fit_trend(
            primitive,
            &self.config.mean_vs_adc_fit,
            &self.config.trend_shrink,
            &means,
            self.config.number_of_fit_tries,
        );

        self.plot_run(sector, run, &points, &trend)?;
        Ok(RunOffset {
            run,
            points,
            trend: Some(trend),
        })
    }

    fn fit_slice<P: FitPrimitive + ?Sized>(
        &self,
        sector: &RunSectorConfig,
        run: u32,
        slice: &MergedSlice,
        primitive: &mut P,
    ) -> Result<Option<CalibrationPoint>, CalibrationError> {
        let context = format!("Sector {} run {run}", sector.name);
        let Some((point, function)) = fit_time_peak(self.config, &self.config.gate, &context, slice, primitive) else {
            return Ok(None);
        };

        if self.config.draw_distributions {
            let projection = &slice.projection;
            let (t_min, t_max) = (projection.axis.min(), projection.axis.max());
            let mut canvas = PlotCanvas::new(800, 600, (t_min, t_max), (0.0, 1.1 * projection.maximum()));
            canvas.draw_histogram(projection, BLUE);
            canvas.draw_curve(&function.curve(function.range.0, function.range.1, 400), RED);
            canvas.save(
                &self
                    .output
                    .join(&sector.name)
                    .join(format!("t_run{run}_adc{}-{}.png", slice.first_bin, slice.last_bin)),
            )?;
        }
        Ok(Some(point))
    }

    fn plot_run(
        &self,
        sector: &RunSectorConfig,
        run: u32,
        points: &[CalibrationPoint],
        trend: &FitFunction,
    ) -> Result<(), CalibrationError> {
        plot_time_parameters(
            &self.output.join(&sector.name).join(format!("tcorr_par_vs_adc_{run}.png")),
            points,
            trend,
        )
    }
}

/// Gaussian plus linear background over the time window of one merged slice.
/// `None` when the slice is too sparse to fit or `gate` rejects the fit.
pub(crate) fn fit_time_peak<P: FitPrimitive + ?Sized>(
    config: &RunOffsetConfig,
    gate: &OutlierGate,
    context: &str,
    slice: &MergedSlice,
    primitive: &mut P,
) -> Option<(CalibrationPoint, FitFunction)> {
    let projection = &slice.projection;
    let data = projection.to_data();

    let mut function = FitFunction::new(
        FitModel::GaussianWithLinear,
        &[projection.maximum(), 0.0, 0.5, 1.0, 1.0],
        config.time_window.as_tuple(),
    );
    let result = IterativeRefiner::new(&config.shrink).refine(primitive, &mut function, &data, config.number_of_fit_tries);
    if !result.is_fitted() {
        return None;
    }

    if let Some((rule, value)) = gate.violation(&function) {
        log::info!(
            "{context}, ADC bins {}-{}: {:?} {value} is outside {} <= |v| < {}",
            slice.first_bin,
            slice.last_bin,
            rule.role,
            rule.min_abs,
            rule.max_abs
        );
        return None;
    }

    let parameter = |role: ParameterRole| {
        function
            .index_of(role)
            .map(|i| Value {
                value: function.parameters[i].value,
                uncertainty: function.parameters[i].uncertainty,
            })
            .unwrap_or_default()
    };
    let amplitude = parameter(ParameterRole::Amplitude);
    let mean = parameter(ParameterRole::Mean);
    let mut sigma = parameter(ParameterRole::Sigma);
    sigma.value = sigma.value.abs();

    let point = CalibrationPoint {
        x: slice.x,
        mean,
        sigma,
        integral: slice.integral,
        signal_yield: GaussianParams::new(amplitude, mean, sigma, projection.axis.bin_width(0)).area.value,
    };
    Some((point, function))
}

/// Means (red) and sigmas (blue) vs ADC with the mean trend.
pub(crate) fn plot_time_parameters(
    path: &Path,
    points: &[CalibrationPoint],
    trend: &FitFunction,
) -> Result<(), CalibrationError> {
    let as_points = |value: fn(&CalibrationPoint) -> Value| -> Vec<PlotPoint> {
        points
            .iter()
            .map(|point| PlotPoint {
                x: point.x,
                y: value(point).value,
                error: value(point).uncertainty,
            })
            .collect()
    };
    let means = as_points(|point| point.mean);
    let sigmas = as_points(|point| point.sigma);

    let x_range = padded_range(points.iter().map(|point| point.x));
    let y_range = padded_range(means.iter().chain(&sigmas).flat_map(|p| [p.y - 0.5, p.y + 0.5]));
    let mut canvas = PlotCanvas::new(600, 600, x_range, y_range);
    canvas.draw_reference(0.0);
    canvas.draw_curve(&trend.curve(x_range.0, x_range.1, 400), GREY);
    canvas.draw_points(&means, RED);
    canvas.draw_points(&sigmas, BLUE);
    canvas.save(path)
}

pub fn units(config: &RunOffsetConfig, sector: Option<usize>) -> Result<Vec<RunSectorUnit<'_>>, CalibrationError> {
    match sector {
        Some(index) => {
            let sector = config.sectors_to_calibrate.get(index).ok_or_else(|| {
                CalibrationError::Config(format!(
                    "sector index {index} is out of range ({} sector(s) configured)",
                    config.sectors_to_calibrate.len()
                ))
            })?;
            Ok(vec![RunSectorUnit { sector }])
        }
        None => Ok(config
            .sectors_to_calibrate
            .iter()
            .map(|sector| RunSectorUnit { sector })
            .collect()),
    }
}

pub fn run(config: &RunOffsetConfig, processor: &Processor, sector: Option<usize>) -> Result<(), CalibrationError> {
    let units = units(config, sector)?;
    let source = HistogramSource::open(&config.input_file)?;
    let calibration = RunOffsetCalibration::new(config, &source);

    processor.run("EMC run-by-run offset", &units, |unit, fitter| {
        calibration.calibrate_sector(unit, fitter).map(|_| ())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CalibrationConfig;
    use crate::fitter::levmar::LevMarFitter;
    use crate::fitter::outlier_gate::GateRule;
    use crate::histoer::axis::Axis;
    use crate::histoer::source::Distribution;

    fn config(dir: &std::path::Path) -> RunOffsetConfig {
        let path = dir.join("emc_run_by_run_offset.yaml");
        std::fs::write(
            &path,
            format!(
                "
status: emc_run_by_run_offset
run_name: test
input_file: unused.json
output_dir: {}
run_numbers: [414988, 414989]
sectors_to_calibrate:
  - name: W0
    adc_ranges: [{{min: 0, max: 2000}}]
mean_vs_adc_fit: {{kind: polynomial, degree: 1}}
",
                dir.display()
            ),
        )
        .unwrap();
        RunOffsetConfig::load(dir).unwrap()
    }

    fn true_mean(adc: f64) -> f64 {
        0.5 + 0.0005 * adc
    }

    fn source(dir: &std::path::Path) -> HistogramSource {
        let axes = || (Axis::uniform(20, 0.0, 2000.0), Axis::uniform(80, -20.0, 20.0));

        let (adc, time) = axes();
        let mut good = Histogram2D::new(&histogram_key("W0", 414988), adc, time);
        for adc_bin in 0..good.x.bins() {
            let adc = good.x.bin_center(adc_bin);
            for t_bin in 0..good.y.bins() {
                let t = good.y.bin_center(t_bin);
                let count = (150.0 * (-0.5 * (t - true_mean(adc)).powi(2)).exp()).round();
                if count > 0.0 {
                    good.fill(adc, t, count);
                }
            }
        }

        let (adc, time) = axes();
        let mut bad = Histogram2D::new(&histogram_key("W0", 414989), adc, time);
        bad.fill(500.0, 0.0, 10.0);

        HistogramSource::from_distributions(
            &dir.join("runs.json"),
            vec![Distribution::Histogram2D(good), Distribution::Histogram2D(bad)],
        )
        .unwrap()
    }

    #[test]
    fn test_runs_of_a_sector() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let source = source(dir.path());
        let calibration = RunOffsetCalibration::new(&config, &source);
        let units = units(&config, None).unwrap();

        let runs = calibration.calibrate_sector(&units[0], &mut LevMarFitter::new()).unwrap();
        assert_eq!(runs.len(), 2);

        // ~750 entries per ADC bin: pairs of bins are merged to pass 1000
        let good = &runs[0];
        assert_eq!(good.points.len(), 10);
        for point in &good.points {
            assert!(point.integral >= 1000.0);
            assert!((point.mean.value - true_mean(point.x)).abs() < 0.05, "{point:?}");
            assert!((point.sigma.value - 1.0).abs() < 0.1, "{point:?}");
        }
        assert_eq!(good.points[0].x, 100.0);

        let trend = good.trend.as_ref().unwrap();
        assert!((trend.eval(1000.0) - true_mean(1000.0)).abs() < 0.05);
        assert!(runs[1].trend.is_none());

        let table = std::fs::read_to_string(calibration.table_path(units[0].sector)).unwrap();
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "2");
        assert!(lines[1].starts_with("414988 1 "));
        assert_eq!(lines[1].split_whitespace().count(), 4);
        assert_eq!(lines[2], "414989 0");
    }

    fn table_lines(calibration: &RunOffsetCalibration<'_>, sector: &RunSectorConfig) -> Vec<String> {
        std::fs::read_to_string(calibration.table_path(sector))
            .unwrap()
            .lines()
            .map(str::to_owned)
            .collect()
    }

    #[test]
    fn test_low_integral_run_is_bad() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.min_run_integral = 1e6;
        let source = source(dir.path());
        let calibration = RunOffsetCalibration::new(&config, &source);
        let units = units(&config, None).unwrap();

        let runs = calibration.calibrate_sector(&units[0], &mut LevMarFitter::new()).unwrap();
        for run in &runs {
            assert!(run.trend.is_none(), "{run:?}");
            assert!(run.points.is_empty());
        }
        assert_eq!(table_lines(&calibration, units[0].sector), ["2", "414988 0", "414989 0"]);
        assert!(!dir.path().join("test/W0/tcorr_par_vs_adc_414988.png").exists());
    }

    #[test]
    fn test_run_with_every_fit_gated_is_bad() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        // every true mean lies between 0.5 and 1.5
        config.gate = OutlierGate::new(vec![GateRule::new(ParameterRole::Mean, 0.0, 0.1)]);
        let source = source(dir.path());
        let calibration = RunOffsetCalibration::new(&config, &source);
        let units = units(&config, None).unwrap();

        let runs = calibration.calibrate_sector(&units[0], &mut LevMarFitter::new()).unwrap();
        assert_eq!(runs[0].run, 414988);
        assert!(runs[0].trend.is_none());
        assert!(runs[0].points.is_empty());
        assert_eq!(table_lines(&calibration, units[0].sector), ["2", "414988 0", "414989 0"]);
    }

    #[test]
    fn test_missing_run_names_the_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.run_numbers.push(1);
        let source = source(dir.path());
        let calibration = RunOffsetCalibration::new(&config, &source);
        let units = units(&config, Some(0)).unwrap();

        match calibration.calibrate_sector(&units[0], &mut LevMarFitter::new()) {
            Err(CalibrationError::MissingHistogram { key, .. }) => assert_eq!(key, "traw vs ADC: W0, run 1"),
            other => panic!("unexpected result {other:?}"),
        }
    }
}
