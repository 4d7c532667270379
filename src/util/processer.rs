use std::fmt::Display;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;

use crate::error::CalibrationError;
use crate::fitter::levmar::LevMarFitter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorSettings {
    /// Worker threads; `None` uses the available parallelism.
    pub threads: Option<usize>,
    pub show_progress: bool,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            threads: None,
            show_progress: true,
        }
    }
}

/// Runs independent calibration units on a bounded worker pool.
///
/// Every unit gets a fresh [`LevMarFitter`], so no fit state is ever shared
/// between threads. A unit that fails is logged and the others carry on; the
/// failures are reported together once the pool drains.
#[derive(Debug, Clone, Copy, Default)]
pub struct Processor {
    pub settings: ProcessorSettings,
}

impl Processor {
    pub fn new(settings: ProcessorSettings) -> Self {
        Self { settings }
    }

    fn progress_bar(&self, label: &str, len: usize) -> ProgressBar {
        if !self.settings.show_progress {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(len as u64);
        let style = ProgressStyle::with_template(
            "{msg} [{elapsed_precise}] {wide_bar} {pos}/{len} units",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
        bar.set_message(label.to_owned());
        bar.enable_steady_tick(Duration::from_millis(200));
        bar
    }

    pub fn run<U, F>(&self, label: &str, units: &[U], work: F) -> Result<(), CalibrationError>
    where
        U: Display + Sync,
        F: Fn(&U, &mut LevMarFitter) -> Result<(), CalibrationError> + Sync,
    {
        if self.settings.threads == Some(0) {
            return Err(CalibrationError::Config(
                "number of threads must be at least 1".to_owned(),
            ));
        }

        let mut builder = rayon::ThreadPoolBuilder::new();
        if let Some(threads) = self.settings.threads {
            builder = builder.num_threads(threads);
        }
        let pool = builder.build()?;

        log::info!(
            "{label}: {} unit(s) on {} thread(s)",
            units.len(),
            pool.current_num_threads()
        );

        let bar = self.progress_bar(label, units.len());
        let failures: Vec<String> = pool.install(|| {
            units
                .par_iter()
                .filter_map(|unit| {
                    let mut fitter = LevMarFitter::new();
                    let result = work(unit, &mut fitter);
                    bar.inc(1);
                    match result {
                        Ok(()) => {
                            log::debug!("{unit}: done after {} fit(s)", fitter.calls());
                            None
                        }
                        Err(err) => {
                            log::error!("{unit}: {err}");
                            Some(format!("{unit}: {err}"))
                        }
                    }
                })
                .collect()
        });
        bar.finish_and_clear();

        if failures.is_empty() {
            log::info!("{label}: all {} unit(s) finished", units.len());
            Ok(())
        } else {
            Err(CalibrationError::UnitsFailed(failures))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fitter::common::Data;
    use crate::fitter::levmar::FitPrimitive;
    use crate::fitter::main_fitter::{FitFunction, FitModel};

    fn quiet(threads: usize) -> Processor {
        Processor::new(ProcessorSettings {
            threads: Some(threads),
            show_progress: false,
        })
    }

    #[test]
    fn test_each_unit_owns_a_fitter() {
        let units: Vec<usize> = (0..16).collect();
        let calls = std::sync::atomic::AtomicUsize::new(0);

        quiet(4)
            .run("test", &units, |&unit, fitter| {
                let mut data = Data::default();
                for i in 0..5 {
                    data.push(i as f64, (unit + 2 * i) as f64, 1.0);
                }
                let mut function = FitFunction::new(FitModel::Polynomial { degree: 1 }, &[0.0, 1.0], (-1.0, 5.0));
                fitter.fit(&mut function, &data);
                assert_eq!(fitter.calls(), 1);
                assert!((function.value(1) - 2.0).abs() < 1e-6);
                calls.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                Ok(())
            })
            .unwrap();
        assert_eq!(calls.into_inner(), 16);
    }

    #[test]
    fn test_failures_are_collected() {
        let units = vec!["a", "b", "c"];
        let error = quiet(2)
            .run("test", &units, |unit, _| {
                if *unit == "b" {
                    Err(CalibrationError::Config("bad unit".to_owned()))
                } else {
                    Ok(())
                }
            })
            .unwrap_err();
        match error {
            CalibrationError::UnitsFailed(failures) => {
                assert_eq!(failures, vec!["b: Invalid configuration: bad unit".to_owned()]);
            }
            other => panic!("unexpected error {other}"),
        }

        assert!(matches!(
            quiet(0).run("test", &units, |_, _| Ok(())),
            Err(CalibrationError::Config(_))
        ));
    }
}
