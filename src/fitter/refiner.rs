use fnv::FnvHashMap;

use super::common::{Data, ParameterRole, Value};
use super::levmar::{FitOutcome, FitPrimitive};
use super::main_fitter::FitFunction;
use crate::histoer::axis::Axis;

/// How the search bounds of one parameter narrow after attempt `i`.
///
/// With `s(i) = 1 + k / i^power`:
/// - `scale`: `[v / s, v * s]`
/// - `offset`: `[v (1 - below / i^power), v (1 + above / i^power)]`
/// - `spread`: `v ± |w| (s - 1)` where `w` is the value of the `width` parameter
#[derive(Debug, Clone, Copy, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShrinkRule {
    Scale { k: f64, power: i32 },
    Offset { below: f64, above: f64, power: i32 },
    Spread { k: f64, power: i32, width: ParameterRole },
}

impl ShrinkRule {
    pub fn factor(k: f64, power: i32, attempt: usize) -> f64 {
        1.0 + k / (attempt.max(1) as f64).powi(power)
    }

    /// Raw bounds for `value` after `attempt`, before intersecting with the old ones.
    pub fn bounds(&self, value: f64, attempt: usize, width: f64) -> (f64, f64) {
        let (a, b) = match *self {
            ShrinkRule::Scale { k, power } => {
                let s = Self::factor(k, power, attempt);
                (value / s, value * s)
            }
            ShrinkRule::Offset {
                below,
                above,
                power,
            } => {
                let i_n = (attempt.max(1) as f64).powi(power);
                (value * (1.0 - below / i_n), value * (1.0 + above / i_n))
            }
            ShrinkRule::Spread { k, power, .. } => {
                let half = width.abs() * (Self::factor(k, power, attempt) - 1.0);
                (value - half, value + half)
            }
        };
        (a.min(b), a.max(b))
    }
}

/// Shrink rules keyed by parameter role, with a fallback for roles not listed.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ShrinkSchedule {
    pub default: ShrinkRule,
    #[serde(default)]
    pub by_role: FnvHashMap<ParameterRole, ShrinkRule>,
}

impl ShrinkSchedule {
    pub fn uniform(rule: ShrinkRule) -> Self {
        Self {
            default: rule,
            by_role: FnvHashMap::default(),
        }
    }

    pub fn with(mut self, role: ParameterRole, rule: ShrinkRule) -> Self {
        self.by_role.insert(role, rule);
        self
    }

    pub fn rule_for(&self, role: ParameterRole) -> ShrinkRule {
        self.by_role.get(&role).copied().unwrap_or(self.default)
    }
}

/// What happens to the fit range between attempts.
#[derive(Debug, Clone, Copy)]
pub enum RangePolicy<'a> {
    Fixed,
    /// Re-centre on `mean ± n_sigma * sigma`, snapped outwards to bin edges of `axis`.
    AroundPeak { n_sigma: f64, axis: &'a Axis },
}

impl RangePolicy<'_> {
    fn update(&self, function: &mut FitFunction) {
        let RangePolicy::AroundPeak { n_sigma, axis } = *self else {
            return;
        };
        let (Some(mean), Some(sigma)) = (
            function.value_of(ParameterRole::Mean),
            function.value_of(ParameterRole::Sigma),
        ) else {
            return;
        };
        let half = n_sigma * sigma.abs();
        if !half.is_finite() || half <= 0.0 || !mean.is_finite() {
            return;
        }

        let low = axis.bin_low_edge(axis.find_bin_clamped(mean - half));
        let high = axis.bin_up_edge(axis.find_bin_clamped(mean + half));
        if low < high {
            function.range = (low, high);
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct FitResult {
    pub parameters: Vec<Value>,
    /// Bounds in force at the start of each attempt.
    pub bound_history: Vec<Vec<(f64, f64)>>,
    /// Outcome of the last attempt, `None` when the data was too sparse to fit.
    pub outcome: Option<FitOutcome>,
}

impl FitResult {
    pub fn is_fitted(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn value(&self, index: usize) -> f64 {
        self.parameters[index].value
    }
}

/// Repeats the fit primitive, narrowing the parameter bounds around each
/// result so later attempts search an ever smaller box.
#[derive(Debug, Clone, Copy)]
pub struct IterativeRefiner<'a> {
    pub schedule: &'a ShrinkSchedule,
    pub range_policy: RangePolicy<'a>,
}

impl<'a> IterativeRefiner<'a> {
    pub fn new(schedule: &'a ShrinkSchedule) -> Self {
        Self {
            schedule,
            range_policy: RangePolicy::Fixed,
        }
    }

    pub fn with_range_policy(mut self, range_policy: RangePolicy<'a>) -> Self {
        self.range_policy = range_policy;
        self
    }

    pub fn refine<P: FitPrimitive + ?Sized>(
        &self,
        primitive: &mut P,
        function: &mut FitFunction,
        data: &Data,
        n_tries: usize,
    ) -> FitResult {
        let mut bound_history = Vec::with_capacity(n_tries);

        // A curve through fewer than two points is undefined
        if data.distinct_usable_points() < 2 {
            log::debug!(
                "{} usable point(s), skipping the {:?} fit",
                data.distinct_usable_points(),
                function.model
            );
            for (i, parameter) in function.parameters.iter_mut().enumerate() {
                if i > 0 {
                    parameter.value = 0.0;
                }
                parameter.uncertainty = 0.0;
            }
            return FitResult {
                parameters: values(function),
                bound_history,
                outcome: None,
            };
        }

        let mut outcome = None;
        for attempt in 1..=n_tries {
            bound_history.push(function.bounds());
            outcome = Some(primitive.fit(function, data));

            if attempt < n_tries {
                self.shrink(function, attempt);
                self.range_policy.update(function);
            }
        }

        FitResult {
            parameters: values(function),
            bound_history,
            outcome,
        }
    }

    fn shrink(&self, function: &mut FitFunction, attempt: usize) {
        let snapshot = function.values();
        let roles: Vec<ParameterRole> = function.parameters.iter().map(|p| p.role).collect();
        for (i, parameter) in function.parameters.iter_mut().enumerate() {
            let value = snapshot[i];
            let rule = self.schedule.rule_for(parameter.role);
            let width = match rule {
                ShrinkRule::Spread { width, .. } => roles
                    .iter()
                    .position(|&role| role == width)
                    .map_or(value, |j| snapshot[j]),
                _ => 0.0,
            };

            let (low, high) = rule.bounds(value, attempt, width);
            if !(low.is_finite() && high.is_finite()) || low == high {
                // a zero value collapses the box; keep the previous one
                continue;
            }

            parameter.set_limits(low.max(parameter.min), high.min(parameter.max));
        }
    }
}

fn values(function: &FitFunction) -> Vec<Value> {
    function
        .parameters
        .iter()
        .map(|p| Value {
            value: p.value,
            uncertainty: p.uncertainty,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fitter::levmar::LevMarFitter;
    use crate::fitter::main_fitter::FitModel;

    /// Pushes every parameter away from its current value, as a poorly
    /// behaved minimiser would, and counts its calls.
    struct Wanderer {
        calls: usize,
    }

    impl FitPrimitive for Wanderer {
        fn fit(&mut self, function: &mut FitFunction, _data: &Data) -> FitOutcome {
            self.calls += 1;
            let pushed: Vec<f64> = function
                .values()
                .iter()
                .enumerate()
                .map(|(i, v)| v * 1.7 + if i % 2 == 0 { 0.3 } else { -0.9 })
                .collect();
            function.set_values(&pushed);
            FitOutcome {
                chi2: 1.0,
                ndf: 1,
                converged: true,
                iterations: 1,
            }
        }
    }

    fn gaussian_data(mean: f64, sigma: f64, amplitude: f64) -> Data {
        let mut data = Data::default();
        for i in 0..100 {
            let x = -5.0 + 0.1 * (i as f64 + 0.5);
            let y = (amplitude * (-0.5 * ((x - mean) / sigma).powi(2)).exp()).round();
            data.push(x, y, y.sqrt());
        }
        data
    }

    fn assert_monotonic(result: &FitResult) {
        for pair in result.bound_history.windows(2) {
            for (before, after) in pair[0].iter().zip(&pair[1]) {
                let (w0, w1) = (before.1 - before.0, after.1 - after.0);
                assert!(w1 <= w0, "{before:?} -> {after:?}");
            }
        }
    }

    #[test]
    fn test_bound_widths_never_grow() {
        let rules = [
            ShrinkRule::Scale { k: 2.0, power: 3 },
            ShrinkRule::Scale { k: 5.0, power: 2 },
            ShrinkRule::Offset {
                below: 6.0,
                above: 4.0,
                power: 3,
            },
            ShrinkRule::Offset {
                below: 0.5,
                above: 2.0,
                power: 2,
            },
            ShrinkRule::Spread {
                k: 1.0,
                power: 2,
                width: ParameterRole::Sigma,
            },
        ];
        let data = gaussian_data(0.2, 0.8, 1000.0);

        for rule in rules {
            let schedule = ShrinkSchedule::uniform(rule);
            let refiner = IterativeRefiner::new(&schedule);

            let mut function = FitFunction::new(FitModel::Gaussian, &[900.0, 0.1, 1.0], (-5.0, 5.0));
            function.set_limits(0, 100.0, 2000.0);
            function.set_limits(1, -1.0, 1.0);
            let result = refiner.refine(&mut Wanderer { calls: 0 }, &mut function, &data, 6);
            assert_eq!(result.bound_history.len(), 6);
            assert_monotonic(&result);

            let mut function = FitFunction::new(FitModel::GaussianWithLinear, &[900.0, 0.1, 1.0, 3.0, -0.5], (-5.0, 5.0));
            let result = refiner.refine(&mut LevMarFitter::new(), &mut function, &data, 5);
            assert_monotonic(&result);
        }
    }

    #[test]
    fn test_sparse_data_skips_fitting() {
        let mut data = Data::default();
        data.push(1.0, 10.0, 3.0);
        data.push(1.0, 12.0, 3.0);
        data.push(2.0, 0.0, 0.0);

        let schedule = ShrinkSchedule::uniform(ShrinkRule::Scale { k: 2.0, power: 2 });
        let mut primitive = Wanderer { calls: 0 };
        let mut function = FitFunction::new(FitModel::PowerLawOffset, &[4.5, 50.0, -1.0], (0.0, 10.0));
        let result = IterativeRefiner::new(&schedule).refine(&mut primitive, &mut function, &data, 5);

        assert_eq!(primitive.calls, 0);
        assert!(!result.is_fitted());
        assert_eq!(function.values(), vec![4.5, 0.0, 0.0]);
        assert_eq!(result.value(0), 4.5);
        assert!(result.bound_history.is_empty());
    }

    #[test]
    fn test_refine_single_gaussian() {
        let data = gaussian_data(0.2, 0.8, 1000.0);
        let axis = Axis::uniform(100, -5.0, 5.0);
        let schedule = ShrinkSchedule::uniform(ShrinkRule::Scale { k: 2.0, power: 3 })
            .with(
                ParameterRole::Mean,
                ShrinkRule::Offset {
                    below: 6.0,
                    above: 4.0,
                    power: 3,
                },
            )
            .with(ParameterRole::Sigma, ShrinkRule::Scale { k: 5.0, power: 3 });
        let refiner = IterativeRefiner::new(&schedule).with_range_policy(RangePolicy::AroundPeak { n_sigma: 5.0, axis: &axis });

        let mut function = FitFunction::new(FitModel::Gaussian, &[700.0, 0.0, 1.2], (-5.0, 5.0));
        function.set_limits(0, 500.0, 1500.0);
        function.set_limits(1, -1.0, 1.0);
        function.set_limits(2, 0.1, 1.0);

        let mut fitter = LevMarFitter::new();
        let result = refiner.refine(&mut fitter, &mut function, &data, 5);

        assert_eq!(fitter.calls(), 5);
        assert!(result.is_fitted());
        assert!((result.value(1) - 0.2).abs() < 0.01);
        assert!((result.value(2) - 0.8).abs() < 0.02);
        assert!(function.range.0 >= -5.0 && function.range.1 <= 5.0);
    }

    #[test]
    fn test_zero_value_keeps_bounds() {
        let schedule = ShrinkSchedule::uniform(ShrinkRule::Scale { k: 2.0, power: 2 });
        let mut function = FitFunction::new(FitModel::Polynomial { degree: 1 }, &[0.0, 2.0], (0.0, 10.0));
        function.set_limits(0, -1.0, 1.0);
        IterativeRefiner::new(&schedule).shrink(&mut function, 1);

        assert_eq!(function.bounds()[0], (-1.0, 1.0));
        assert_eq!(function.bounds()[1], (2.0 / 3.0, 6.0));
    }
}
