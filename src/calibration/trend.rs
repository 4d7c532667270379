use crate::config::TrendFit;
use crate::fitter::common::Data;
use crate::fitter::levmar::FitPrimitive;
use crate::fitter::main_fitter::FitFunction;
use crate::fitter::refiner::{FitResult, IterativeRefiner, ShrinkSchedule};

/// Fit range for a trend over scan positions `x`: `[min / 1.05, max * 1.05]`.
///
/// Scan axes (pT, ADC) are positive, so this always widens the range.
pub fn scan_range(x: impl IntoIterator<Item = f64>) -> (f64, f64) {
    let (min, max) = x
        .into_iter()
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
    if min > max {
        return (0.0, 0.0);
    }
    (min / 1.05, max * 1.05)
}

/// Smooths accumulated calibration points with `trend`, seeded from the
/// configuration when given and from the data otherwise.
pub fn fit_trend<P: FitPrimitive + ?Sized>(
    primitive: &mut P,
    trend: &TrendFit,
    schedule: &ShrinkSchedule,
    data: &Data,
    n_tries: usize,
) -> (FitFunction, FitResult) {
    let range = scan_range(data.x.iter().copied());
    let seeds = trend
        .seeds
        .clone()
        .unwrap_or_else(|| trend.model.seeds(data));

    let mut function = FitFunction::new(trend.model.clone(), &seeds, range);
    let result = IterativeRefiner::new(schedule).refine(primitive, &mut function, data, n_tries);

    log::debug!(
        "Trend {:?} over {} point(s): {:?}",
        trend.model,
        data.len(),
        function.values()
    );
    (function, result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fitter::levmar::LevMarFitter;
    use crate::fitter::main_fitter::FitModel;
    use crate::fitter::refiner::ShrinkRule;

    #[test]
    fn test_scan_range() {
        let (low, high) = scan_range([1.0, 4.0, 2.5]);
        assert!((low - 1.0 / 1.05).abs() < 1e-12);
        assert!((high - 4.2).abs() < 1e-12);
    }

    #[test]
    fn test_linear_trend_recovered() {
        let mut data = Data::default();
        for i in 0..8 {
            let x = 0.5 + 0.5 * i as f64;
            data.push(x, 0.3 - 0.1 * x, 1.0);
        }
        let trend = TrendFit {
            model: FitModel::Polynomial { degree: 1 },
            seeds: Some(vec![0.25, -0.05]),
        };
        let schedule = ShrinkSchedule::uniform(ShrinkRule::Offset {
            below: 6.0,
            above: 4.0,
            power: 3,
        });

        let (function, result) = fit_trend(&mut LevMarFitter::new(), &trend, &schedule, &data, 5);
        assert!(result.is_fitted());
        assert!((function.value(0) - 0.3).abs() < 1e-4);
        assert!((function.value(1) + 0.1).abs() < 1e-4);
    }
}
