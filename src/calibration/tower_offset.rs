use std::fmt::Display;
use std::path::PathBuf;

use crate::config::{TowerOffsetConfig, TowerSectorConfig};
use crate::error::CalibrationError;
use crate::fitter::common::Data;
use crate::fitter::levmar::FitPrimitive;
use crate::fitter::main_fitter::{FitFunction, FitModel};
use crate::fitter::refiner::IterativeRefiner;
use crate::histoer::histo2d::histogram2d::Histogram2D;
use crate::histoer::source::HistogramSource;
use crate::output::colormaps::ColorScale;
use crate::output::parameter_table::ParameterTable;
use crate::output::plot::{padded_range, PlotCanvas, PlotPoint, BLUE, RED};
use crate::util::processer::Processor;

/// Slowing of the timing signal at small amplitude: `t = c0 + c1 * ADC^c2`.
const OFFSET_MODEL: FitModel = FitModel::PowerLawOffset;

/// Bins holding less than this are treated as empty.
const EMPTY_BIN: f64 = 1e-15;

/// Name of the t vs ADC vs z tower histogram of one y tower row.
pub fn histogram_key(sector: &str, iy: usize) -> String {
    format!("traw vs ADC vs iz: {sector}, iy{iy}")
}

/// Offset curve of one tower, `None` for towers without hits above the ADC cut.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct TowerOffset {
    pub iy: usize,
    pub iz: usize,
    pub parameters: Option<Vec<f64>>,
}

impl TowerOffset {
    fn push_to(&self, table: &mut ParameterTable) {
        match &self.parameters {
            Some(parameters) => table.push_row(&[1], parameters),
            None => table.push_row(&[0], &[]),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SectorUnit<'a> {
    pub sector: &'a TowerSectorConfig,
}

impl Display for SectorUnit<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sector {}", self.sector.name)
    }
}

/// The t (x) vs ADC (y) distribution of one tower.
struct TowerSlice<'a> {
    sector: &'a TowerSectorConfig,
    iy: usize,
    iz: usize,
    hist: Histogram2D,
}

impl Display for TowerSlice<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} iy{} iz{}", self.sector.name, self.iy, self.iz)
    }
}

pub struct TowerOffsetCalibration<'a> {
    pub config: &'a TowerOffsetConfig,
    pub source: &'a HistogramSource,
    output: PathBuf,
}

impl<'a> TowerOffsetCalibration<'a> {
    pub fn new(config: &'a TowerOffsetConfig, source: &'a HistogramSource) -> Self {
        Self {
            config,
            source,
            output: config.output_dir.join(&config.run_name),
        }
    }

    pub fn table_path(&self, sector: &TowerSectorConfig) -> PathBuf {
        self.output
            .join("CalibrationParameters")
            .join(format!("tower_offset_{}.txt", sector.name))
    }

    /// Fits every tower of the sector and writes `tower_offset_<sector>.txt`.
    pub fn calibrate_sector<P: FitPrimitive + ?Sized>(
        &self,
        unit: &SectorUnit<'_>,
        primitive: &mut P,
    ) -> Result<Vec<TowerOffset>, CalibrationError> {
        let sector = unit.sector;
        let mut table = ParameterTable::new(format!(
            "{} {}",
            sector.number_of_y_towers, sector.number_of_z_towers
        ));
        let mut towers = Vec::with_capacity(sector.number_of_y_towers * sector.number_of_z_towers);

        for iy in 0..sector.number_of_y_towers {
            let key = histogram_key(&sector.name, iy);
            let hist = self.source.histogram3d(&key)?;
            if hist.z.bins() != sector.number_of_z_towers {
                return Err(CalibrationError::Config(format!(
                    "sector {} has {} z towers but \"{key}\" has {} z bins",
                    sector.name,
                    sector.number_of_z_towers,
                    hist.z.bins()
                )));
            }

            for iz in 0..sector.number_of_z_towers {
                let slice = TowerSlice {
                    sector,
                    iy,
                    iz,
                    hist: hist.z_slice(iz),
                };
                let tower = TowerOffset {
                    iy,
                    iz,
                    parameters: self.fit_tower(&slice, primitive)?.map(|function| function.values()),
                };
                tower.push_to(&mut table);
                towers.push(tower);
            }
        }

        table.write(&self.table_path(sector))?;
        log::info!(
            "{unit}: {} of {} tower(s) calibrated",
            towers.iter().filter(|tower| tower.parameters.is_some()).count(),
            towers.len()
        );
        Ok(towers)
    }

    /// Mean time per ADC bin of a t (x) vs ADC (y) slice, with the lowest and
    /// highest populated time edges. `None` when nothing lies above the ADC cut.
    pub fn mean_time_vs_adc(&self, slice: &Histogram2D) -> Option<(Data, f64, f64)> {
        let adc = &slice.y;
        let first_adc = (0..adc.bins()).find(|&bin| adc.bin_up_edge(bin) >= self.config.fit_adc_min)?;
        let last_adc = adc.bins() - 1;
        if slice.integral_between((0, slice.x.bins() - 1), (first_adc, last_adc)) < EMPTY_BIN {
            return None;
        }

        let mut data = Data::default();
        let mut min_t = f64::INFINITY;
        let mut max_t = f64::NEG_INFINITY;
        for bin in first_adc..=last_adc {
            let times = slice.x_projection(bin, bin);
            if times.integral() < EMPTY_BIN {
                continue;
            }
            data.push(adc.bin_center(bin), times.mean(), times.mean_error());

            if let Some(first) = times.first_populated_bin(EMPTY_BIN) {
                min_t = min_t.min(times.axis.bin_low_edge(first));
            }
            if let Some(last) = times.last_populated_bin(EMPTY_BIN) {
                max_t = max_t.max(times.axis.bin_up_edge(last));
            }
        }
        Some((data, min_t, max_t))
    }

    /// Offset curve of one tower, fitted over the ADC span of its mean points
    /// widened by a factor 1.5 on both sides.
    fn fit_tower<P: FitPrimitive + ?Sized>(
        &self,
        tower: &TowerSlice<'_>,
        primitive: &mut P,
    ) -> Result<Option<FitFunction>, CalibrationError> {
        let Some((data, min_t, max_t)) = self.mean_time_vs_adc(&tower.hist) else {
            log::debug!("{tower}: no hits above ADC {}", self.config.fit_adc_min);
            return Ok(None);
        };

        let min_adc = data.x.iter().copied().fold(f64::INFINITY, f64::min);
        let max_adc = data.x.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mut function = FitFunction::new(OFFSET_MODEL, &[min_t, 50.0, -1.0], (min_adc / 1.5, max_adc * 1.5));
        IterativeRefiner::new(&self.config.shrink).refine(primitive, &mut function, &data, self.config.number_of_fit_tries);

        if self.config.draw_distributions {
            self.plot_tower(tower, &data, &function, (min_t, max_t))?;
        }
        Ok(Some(function))
    }

    fn plot_tower(
        &self,
        tower: &TowerSlice<'_>,
        data: &Data,
        function: &FitFunction,
        time_range: (f64, f64),
    ) -> Result<(), CalibrationError> {
        let TowerSlice { sector, iy, iz, hist: slice } = tower;
        let directory = self.output.join(&sector.name);

        let mut canvas = PlotCanvas::new(800, 600, (slice.x.min(), slice.x.max()), (slice.y.min(), slice.y.max()));
        let populated: Vec<f64> = slice.contents.iter().copied().filter(|&c| c > 0.0).collect();
        let scale = ColorScale {
            log_norm: true,
            ..ColorScale::spanning(&populated)
        };
        canvas.draw_heatmap(slice, &scale);
        canvas.save(&directory.join(format!("t_vs_adc_iy{iy}_iz{iz}.png")))?;

        let points: Vec<PlotPoint> = (0..data.len())
            .map(|i| PlotPoint {
                x: data.x[i],
                y: data.y[i],
                error: data.err[i],
            })
            .collect();
        let x_range = (slice.y.min(), slice.y.max());
        let y_range = padded_range([time_range.0 - 5.0, time_range.1 + 5.0]);
        let mut canvas = PlotCanvas::new(800, 600, x_range, y_range);
        canvas.draw_points(&points, BLUE);
        canvas.draw_curve(&function.curve(function.range.0.max(1.0), function.range.1, 400), RED);
        canvas.save(&directory.join(format!("mean_iy{iy}_iz{iz}.png")))
    }
}

/// Sectors for the whole configuration, or only the one at `sector`.
pub fn units(config: &TowerOffsetConfig, sector: Option<usize>) -> Result<Vec<SectorUnit<'_>>, CalibrationError> {
    match sector {
        Some(index) => {
            let sector = config.sectors_to_calibrate.get(index).ok_or_else(|| {
                CalibrationError::Config(format!(
                    "sector index {index} is out of range ({} sector(s) configured)",
                    config.sectors_to_calibrate.len()
                ))
            })?;
            Ok(vec![SectorUnit { sector }])
        }
        None => Ok(config
            .sectors_to_calibrate
            .iter()
            .map(|sector| SectorUnit { sector })
            .collect()),
    }
}

pub fn run(config: &TowerOffsetConfig, processor: &Processor, sector: Option<usize>) -> Result<(), CalibrationError> {
    let units = units(config, sector)?;
    let source = HistogramSource::open(&config.input_file)?;
    let calibration = TowerOffsetCalibration::new(config, &source);

    processor.run("EMC tower offset", &units, |unit, fitter| {
        calibration.calibrate_sector(unit, fitter).map(|_| ())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fitter::levmar::LevMarFitter;
    use crate::histoer::axis::Axis;
    use crate::histoer::histo3d::histogram3d::Histogram3D;
    use crate::histoer::source::Distribution;

    fn config(output_dir: &std::path::Path, number_of_z_towers: usize) -> TowerOffsetConfig {
        let text = format!(
            "
status: emc_tower_offset
run_name: test
input_file: unused.json
output_dir: {}
sectors_to_calibrate:
  - {{name: W0, number_of_y_towers: 1, number_of_z_towers: {number_of_z_towers}}}
",
            output_dir.display()
        );
        serde_yaml::from_str(&text).unwrap()
    }

    /// z tower 0 has hits across the ADC range, tower 1 in a single ADC bin,
    /// tower 2 none.
    fn source(dir: &std::path::Path) -> HistogramSource {
        let mut hist = Histogram3D::new(
            &histogram_key("W0", 0),
            Axis::uniform(40, -10.0, 10.0),
            Axis::uniform(20, 0.0, 4000.0),
            Axis::uniform(3, 0.0, 3.0),
        );
        for adc_bin in 1..20 {
            let adc = hist.y.bin_center(adc_bin);
            let t = 2.0 + 50.0 / adc;
            for (offset, weight) in [(-1.0, 10.0), (-0.5, 40.0), (0.0, 60.0), (0.5, 40.0), (1.0, 10.0)] {
                hist.fill(t + offset, adc, 0.5, weight);
            }
        }
        hist.fill(-3.2, 1100.0, 1.5, 20.0);
        hist.fill(-2.2, 1100.0, 1.5, 20.0);

        HistogramSource::from_distributions(&dir.join("sum.json"), vec![Distribution::Histogram3D(hist)]).unwrap()
    }

    #[test]
    fn test_sector_table() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), 3);
        let source = source(dir.path());
        let calibration = TowerOffsetCalibration::new(&config, &source);
        let units = units(&config, None).unwrap();

        let towers = calibration.calibrate_sector(&units[0], &mut LevMarFitter::new()).unwrap();
        assert_eq!(towers.len(), 3);

        // every ADC bin has its mean in the [2.0, 2.5) time bin
        let full = towers[0].parameters.as_ref().unwrap();
        let function = FitFunction::new(FitModel::PowerLawOffset, full, (0.0, 4000.0));
        for adc in [500.0, 1500.0, 3500.0] {
            assert!((function.eval(adc) - 2.25).abs() < 0.1, "{full:?}");
        }

        // one ADC bin cannot constrain the curve: minT and no slope
        assert_eq!(towers[1].parameters, Some(vec![-3.5, 0.0, 0.0]));
        assert_eq!(towers[2].parameters, None);

        let table = std::fs::read_to_string(calibration.table_path(units[0].sector)).unwrap();
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines[0], "1 3");
        assert!(lines[1].starts_with("1 "));
        assert_eq!(lines[1].split_whitespace().count(), 4);
        assert_eq!(lines[2], "1 -3.5 0 0");
        assert_eq!(lines[3], "0");
    }

    #[test]
    fn test_fit_range_follows_the_mean_points() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), 1);
        let source = source(dir.path());
        let calibration = TowerOffsetCalibration::new(&config, &source);

        // hits only between 1000 and 3000 on an axis reaching 40000
        let mut hist = Histogram2D::new("slice", Axis::uniform(40, -10.0, 10.0), Axis::uniform(200, 0.0, 40000.0));
        for adc in [1100.0, 1500.0, 2100.0, 2900.0] {
            let t = 2.0 + 50.0 / adc;
            for (offset, weight) in [(-0.5, 20.0), (0.0, 40.0), (0.5, 20.0)] {
                hist.fill(t + offset, adc, weight);
            }
        }
        let slice = TowerSlice {
            sector: &config.sectors_to_calibrate[0],
            iy: 0,
            iz: 0,
            hist,
        };

        let function = calibration
            .fit_tower(&slice, &mut LevMarFitter::new())
            .unwrap()
            .unwrap();
        let (low, high) = function.range;
        assert!((low - 1100.0 / 1.5).abs() < 1e-9, "{low}");
        assert!((high - 2900.0 * 1.5).abs() < 1e-9, "{high}");
        assert!(high < 40000.0);
    }

    #[test]
    fn test_z_tower_mismatch_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), 4);
        let source = source(dir.path());
        let calibration = TowerOffsetCalibration::new(&config, &source);
        let units = units(&config, Some(0)).unwrap();

        assert!(matches!(
            calibration.calibrate_sector(&units[0], &mut LevMarFitter::new()),
            Err(CalibrationError::Config(_))
        ));
        assert!(super::units(&config, Some(1)).is_err());
    }
}
