use std::path::PathBuf;

use fnv::FnvHashMap;

use super::run_offset::{self, fit_time_peak, plot_time_parameters, RunOffsetCalibration, RunSectorUnit};
use super::trend::fit_trend;
use super::CalibrationPoint;
use crate::config::{RunOffsetConfig, RunSectorConfig};
use crate::error::CalibrationError;
use crate::fitter::common::{Data, ParameterRole};
use crate::fitter::levmar::FitPrimitive;
use crate::fitter::main_fitter::FitFunction;
use crate::fitter::outlier_gate::{GateRule, OutlierGate};
use crate::histoer::histo2d::histogram2d::Histogram2D;
use crate::histoer::projector::BinProjector;
use crate::histoer::source::HistogramSource;
use crate::output::parameter_table::ParameterTable;
use crate::util::processer::Processor;

/// Name given to a raw t vs ADC histogram once the run offset is removed.
pub fn corrected_key(sector: &str, run: u32) -> String {
    format!("tcorr vs ADC: {sector}, run {run}")
}

/// Corrected peaks outside these bounds are dropped.
fn check_gate() -> OutlierGate {
    OutlierGate::new(vec![
        GateRule::new(ParameterRole::Mean, 0.0, 5.0),
        GateRule::new(ParameterRole::Sigma, 0.1, 3.0),
    ])
}

/// Copy of a t (y) vs ADC (x) histogram with every ADC column moved by
/// `-offset(ADC)`.
///
/// Content landing between two bin centers is shared between them, so the
/// mean time of a column moves by exactly the offset. Content pushed past the
/// ends of the time axis is lost.
pub fn shift_times(hist: &Histogram2D, name: &str, offset: impl Fn(f64) -> f64) -> Histogram2D {
    let mut shifted = Histogram2D::new(name, hist.x.clone(), hist.y.clone());
    let mut sumw2 = vec![0.0; shifted.contents.len()];
    let centers = hist.y.bin_centers();

    for x_bin in 0..hist.x.bins() {
        let shift = offset(hist.x.bin_center(x_bin));
        let shift = if shift.is_finite() { shift } else { 0.0 };

        for (y_bin, center) in centers.iter().enumerate() {
            let content = hist.content(x_bin, y_bin);
            if content == 0.0 {
                continue;
            }
            let t = center - shift;
            if t < hist.y.min() || t > hist.y.max() {
                continue;
            }

            let upper = centers.partition_point(|&c| c <= t);
            let deposits = if upper == 0 {
                [(0, 1.0), (0, 0.0)]
            } else if upper == centers.len() {
                [(upper - 1, 1.0), (upper - 1, 0.0)]
            } else {
                let lower = upper - 1;
                let share = (t - centers[lower]) / (centers[upper] - centers[lower]);
                [(lower, 1.0 - share), (upper, share)]
            };

            let error_squared = hist.error_squared(x_bin, y_bin);
            for (target, share) in deposits {
                if share > 0.0 {
                    let index = shifted.index(x_bin, target);
                    shifted.contents[index] += share * content;
                    // errors stay Poisson-like
                    sumw2[index] += share * error_squared;
                }
            }
        }
    }

    shifted.sumw2 = Some(sumw2);
    shifted
}

/// Corrected time peaks of one run. `trend` is `None` when no slice passed.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RunCheck {
    pub run: u32,
    pub points: Vec<CalibrationPoint>,
    pub trend: Option<FitFunction>,
}

/// Removes the written run-by-run offsets from the raw timing histograms and
/// fits the corrected peaks, which should sit at zero for every ADC.
pub struct TimingCheck<'a> {
    pub config: &'a RunOffsetConfig,
    pub source: &'a HistogramSource,
    output: PathBuf,
}

impl<'a> TimingCheck<'a> {
    pub fn new(config: &'a RunOffsetConfig, source: &'a HistogramSource) -> Self {
        Self {
            config,
            source,
            output: config.output_dir.join(&config.run_name),
        }
    }

    pub fn summary_path(&self, sector: &RunSectorConfig) -> PathBuf {
        self.output.join(&sector.name).join("timing_check.json")
    }

    /// Offset curve per run from `run_offset_<sector>.txt`, `None` for runs
    /// written as bad.
    pub fn load_offsets(&self, sector: &RunSectorConfig) -> Result<FnvHashMap<u32, Option<FitFunction>>, CalibrationError> {
        let path = RunOffsetCalibration::new(self.config, self.source).table_path(sector);
        let table = ParameterTable::read(&path)?;
        let malformed = |reason: String| CalibrationError::Table {
            path: path.clone(),
            reason,
        };

        let declared = table.header_values();
        if declared != [table.len() as f64] {
            return Err(malformed(format!(
                "header \"{}\" does not match its {} row(s)",
                table.header(),
                table.len()
            )));
        }

        let model = &self.config.mean_vs_adc_fit.model;
        let mut offsets = FnvHashMap::default();
        for row in 0..table.len() {
            let values = table.values(row).unwrap_or_default();
            let offset = match values.as_slice() {
                [run, flag] if *flag == 0.0 => (*run, None),
                [run, flag, parameters @ ..] if *flag == 1.0 && parameters.len() == model.number_of_parameters() => {
                    (*run, Some(FitFunction::new(model.clone(), parameters, (0.0, f64::INFINITY))))
                }
                _ => return Err(malformed(format!("row {} is neither \"run 0\" nor \"run 1 p...\"", row + 1))),
            };
            offsets.insert(offset.0 as u32, offset.1);
        }
        Ok(offsets)
    }

    /// Checks every calibrated run of the sector and writes the corrected
    /// peaks to `timing_check.json`.
    pub fn check_sector<P: FitPrimitive + ?Sized>(
        &self,
        unit: &RunSectorUnit<'_>,
        primitive: &mut P,
    ) -> Result<Vec<RunCheck>, CalibrationError> {
        let sector = unit.sector;
        let offsets = self.load_offsets(sector)?;
        let mut runs = Vec::new();

        for &run in &self.config.run_numbers {
            let trend = match offsets.get(&run) {
                Some(Some(trend)) => trend,
                Some(None) => {
                    log::info!("Sector {} run {run}: written as bad, not checked", sector.name);
                    continue;
                }
                None => {
                    return Err(CalibrationError::Config(format!(
                        "run {run} is missing from the run offsets of sector {}",
                        sector.name
                    )));
                }
            };

            let raw = self.source.histogram2d(&run_offset::histogram_key(&sector.name, run))?;
            let corrected = shift_times(raw, &corrected_key(&sector.name, run), |adc| trend.eval(adc));
            runs.push(self.check_run(sector, run, &corrected, primitive)?);
        }

        let path = self.summary_path(sector);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let writer = std::io::BufWriter::new(std::fs::File::create(&path)?);
        serde_json::to_writer_pretty(writer, &runs)?;

        let worst = runs
            .iter()
            .flat_map(|run| &run.points)
            .map(|point| point.mean.value.abs())
            .fold(0.0, f64::max);
        log::info!("{unit}: {} run(s) checked, corrected |mean| <= {worst:.3}", runs.len());
        Ok(runs)
    }

    /// Fits the merged ADC slices of one corrected histogram.
    pub fn check_run<P: FitPrimitive + ?Sized>(
        &self,
        sector: &RunSectorConfig,
        run: u32,
        corrected: &Histogram2D,
        primitive: &mut P,
    ) -> Result<RunCheck, CalibrationError> {
        let projector = BinProjector::new(self.config.min_integral);
        let gate = check_gate();
        let context = format!("Sector {} run {run} (corrected)", sector.name);

        let mut points = Vec::new();
        for adc_range in &sector.adc_ranges {
            for slice in projector.merge_scan(corrected, adc_range.as_tuple(), self.config.time_window.as_tuple()) {
                if let Some((point, _)) = fit_time_peak(self.config, &gate, &context, &slice, primitive) {
                    points.push(point);
                }
            }
        }

        if points.is_empty() {
            log::warn!("{context}: no accepted fit in any ADC range");
            return Ok(RunCheck {
                run,
                points,
                trend: None,
            });
        }

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

        plot_time_parameters(
            &self.output.join(&sector.name).join(format!("check_tcorr_par_vs_adc_{run}.png")),
            &points,
            &trend,
        )?;
        Ok(RunCheck {
            run,
            points,
            trend: Some(trend),
        })
    }
}

pub fn run(config: &RunOffsetConfig, processor: &Processor, sector: Option<usize>) -> Result<(), CalibrationError> {
    let units = run_offset::units(config, sector)?;
    let source = HistogramSource::open(&config.input_file)?;
    let check = TimingCheck::new(config, &source);

    processor.run("EMC timing check", &units, |unit, fitter| {
        check.check_sector(unit, fitter).map(|_| ())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CalibrationConfig;
    use crate::fitter::levmar::LevMarFitter;
    use crate::histoer::axis::Axis;
    use crate::histoer::source::Distribution;

    fn config(dir: &std::path::Path) -> RunOffsetConfig {
        std::fs::write(
            dir.join("emc_run_by_run_offset.yaml"),
            format!(
                "
status: emc_run_by_run_offset
run_name: test
input_file: unused.json
output_dir: {}
run_numbers: [414990, 414991]
sectors_to_calibrate:
  - name: E1
    adc_ranges: [{{min: 0, max: 2000}}]
mean_vs_adc_fit: {{kind: polynomial, degree: 1}}
",
                dir.display()
            ),
        )
        .unwrap();
        RunOffsetConfig::load(dir).unwrap()
    }

    fn raw_mean(adc: f64) -> f64 {
        -1.0 + 0.001 * adc
    }

    fn source(dir: &std::path::Path) -> HistogramSource {
        let axes = || (Axis::uniform(20, 0.0, 2000.0), Axis::uniform(80, -20.0, 20.0));

        let (adc, time) = axes();
        let mut good = Histogram2D::new(&run_offset::histogram_key("E1", 414990), adc, time);
        for adc_bin in 0..good.x.bins() {
            let adc = good.x.bin_center(adc_bin);
            for t_bin in 0..good.y.bins() {
                let t = good.y.bin_center(t_bin);
                let count = (200.0 * (-0.5 * (t - raw_mean(adc)).powi(2)).exp()).round();
                if count > 0.0 {
                    good.fill(adc, t, count);
                }
            }
        }

        let (adc, time) = axes();
        let mut empty = Histogram2D::new(&run_offset::histogram_key("E1", 414991), adc, time);
        empty.fill(500.0, 0.0, 3.0);

        HistogramSource::from_distributions(
            &dir.join("runs.json"),
            vec![Distribution::Histogram2D(good), Distribution::Histogram2D(empty)],
        )
        .unwrap()
    }

    #[test]
    fn test_shift_keeps_the_column_mean() {
        let mut hist = Histogram2D::new("t", Axis::uniform(2, 0.0, 2.0), Axis::uniform(20, -5.0, 5.0));
        for (t, weight) in [(-0.75, 10.0), (-0.25, 30.0), (0.25, 30.0), (0.75, 10.0)] {
            hist.fill(0.5, t, weight);
            hist.fill(1.5, t, weight);
        }

        let shifted = shift_times(&hist, "tcorr", |adc| if adc < 1.0 { 0.3 } else { -1.0 });
        let first = shifted.y_projection(0, 0);
        let second = shifted.y_projection(1, 1);

        assert!((first.mean() + 0.3).abs() < 1e-12, "{}", first.mean());
        assert!((second.mean() - 1.0).abs() < 1e-12, "{}", second.mean());
        assert!((shifted.integral() - hist.integral()).abs() < 1e-9);
        assert_eq!(shifted.name, "tcorr");
    }

    #[test]
    fn test_corrected_runs_peak_at_zero() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let source = source(dir.path());
        let units = run_offset::units(&config, None).unwrap();
        let mut fitter = LevMarFitter::new();

        RunOffsetCalibration::new(&config, &source)
            .calibrate_sector(&units[0], &mut fitter)
            .unwrap();
        let check = TimingCheck::new(&config, &source);
        let runs = check.check_sector(&units[0], &mut fitter).unwrap();

        // the run written as bad is not checked
        assert_eq!(runs.len(), 1);
        let run = &runs[0];
        assert_eq!(run.run, 414990);
        assert!(!run.points.is_empty());
        for point in &run.points {
            assert!(point.mean.value.abs() < 0.1, "{point:?}");
            assert!((point.sigma.value - 1.0).abs() < 0.15, "{point:?}");
        }
        let trend = run.trend.as_ref().unwrap();
        assert!(trend.eval(1000.0).abs() < 0.1);
        assert!(check.summary_path(units[0].sector).is_file());
        assert!(dir.path().join("test/E1/check_tcorr_par_vs_adc_414990.png").is_file());
    }

    #[test]
    fn test_offset_rows_are_validated() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let source = source(dir.path());
        let check = TimingCheck::new(&config, &source);
        let sector = &config.sectors_to_calibrate[0];
        let path = RunOffsetCalibration::new(&config, &source).table_path(sector);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();

        std::fs::write(&path, "2\n414990 1 0.5 0.001\n414991 0\n").unwrap();
        let offsets = check.load_offsets(sector).unwrap();
        assert!(offsets[&414991].is_none());
        assert!((offsets[&414990].as_ref().unwrap().eval(500.0) - 1.0).abs() < 1e-12);

        std::fs::write(&path, "2\n414990 1 0.5\n414991 0\n").unwrap();
        assert!(matches!(check.load_offsets(sector), Err(CalibrationError::Table { .. })));

        // run 414991 is configured but has no row
        std::fs::write(&path, "1\n414990 0\n").unwrap();
        let unit = RunSectorUnit { sector };
        assert!(matches!(
            check.check_sector(&unit, &mut LevMarFitter::new()),
            Err(CalibrationError::Config(_))
        ));
    }
}
