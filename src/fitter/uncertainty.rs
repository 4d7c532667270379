use super::common::{Data, ParameterRole};
use super::levmar::FitPrimitive;
use super::main_fitter::FitFunction;

/// Settings for the alternate-range fits.
#[derive(Debug, Clone, Copy, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct UncertaintyEstimator {
    /// Alternate ranges per family, `n = 1..=multiples`.
    pub multiples: usize,
    /// Range half width per multiple, in sigmas.
    pub step: f64,
    /// Amplitudes may move within `[v / f, v * f]`.
    pub amplitude_factor: f64,
    /// Sigma and background mean may move within `[v / f, v * f]`.
    pub shape_factor: f64,
}

impl Default for UncertaintyEstimator {
    fn default() -> Self {
        Self {
            multiples: 4,
            step: 2.0,
            amplitude_factor: 1.2,
            shape_factor: 1.5,
        }
    }
}

/// The same quantity for each family of alternate ranges.
#[derive(Debug, Clone, PartialEq)]
pub struct Families<T> {
    pub symmetric: Vec<T>,
    pub right: Vec<T>,
    pub left: Vec<T>,
}

impl<T> Default for Families<T> {
    fn default() -> Self {
        Self {
            symmetric: Vec::new(),
            right: Vec::new(),
            left: Vec::new(),
        }
    }
}

impl<T> Families<T> {
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.symmetric.iter().chain(&self.right).chain(&self.left)
    }

    pub fn len(&self) -> usize {
        self.symmetric.len() + self.right.len() + self.left.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub type AlternateFits = Families<FitFunction>;

impl AlternateFits {
    /// Robust uncertainty of parameter `index` of `main`.
    pub fn uncertainty(&self, index: usize, main: &FitFunction) -> f64 {
        spread(
            main.value(index),
            main.parameters[index].uncertainty,
            self.iter().map(|alternate| alternate.value(index)),
        )
    }
}

impl UncertaintyEstimator {
    /// Fit ranges around `mean` for the three families.
    pub fn alternate_ranges(&self, mean: f64, sigma: f64) -> Families<(f64, f64)> {
        let sigma = sigma.abs();
        let reach = |n: usize| n as f64 * self.step * sigma;
        let multiples = 1..=self.multiples;

        Families {
            symmetric: multiples.clone().map(|n| (mean - reach(n), mean + reach(n))).collect(),
            right: multiples.clone().map(|n| (mean - sigma, mean + reach(n))).collect(),
            left: multiples.map(|n| (mean - reach(n), mean + sigma)).collect(),
        }
    }

    /// Copy of `main` seeded with its values and bounded around them, over `range`.
    fn alternate_function(&self, main: &FitFunction, range: (f64, f64)) -> FitFunction {
        let mut alternate = main.clone();
        alternate.range = range;

        for parameter in alternate.parameters.iter_mut() {
            let factor = match parameter.role {
                role if role.is_amplitude() => self.amplitude_factor,
                ParameterRole::Sigma | ParameterRole::BackgroundMean => self.shape_factor,
                _ => {
                    parameter.min = f64::NEG_INFINITY;
                    parameter.max = f64::INFINITY;
                    continue;
                }
            };
            let value = parameter.value;
            if value == 0.0 || !value.is_finite() {
                parameter.min = f64::NEG_INFINITY;
                parameter.max = f64::INFINITY;
            } else {
                parameter.set_limits(value / factor, value * factor);
            }
        }

        alternate
    }

    /// Runs one constrained fit per alternate range.
    pub fn alternate_fits<P: FitPrimitive + ?Sized>(
        &self,
        primitive: &mut P,
        main: &FitFunction,
        data: &Data,
    ) -> AlternateFits {
        let (Some(mean), Some(sigma)) = (
            main.value_of(ParameterRole::Mean),
            main.value_of(ParameterRole::Sigma),
        ) else {
            return AlternateFits::default();
        };

        let ranges = self.alternate_ranges(mean, sigma);
        let mut fit_all = |ranges: &[(f64, f64)]| -> Vec<FitFunction> {
            ranges
                .iter()
                .map(|&range| {
                    let mut alternate = self.alternate_function(main, range);
                    primitive.fit(&mut alternate, data);
                    alternate
                })
                .collect()
        };

        AlternateFits {
            symmetric: fit_all(&ranges.symmetric),
            right: fit_all(&ranges.right),
            left: fit_all(&ranges.left),
        }
    }
}

/// Sample standard deviation of `{main} ∪ alternates` about the main value,
/// `sqrt(Σ (a - main)² / (n - 1))`, with non-finite alternates dropped.
///
/// Falls back to `main_error` (or 0 when that is not finite) when the
/// alternates all agree with the main value.
pub fn spread(main_value: f64, main_error: f64, alternates: impl IntoIterator<Item = f64>) -> f64 {
    let fallback = if main_error.is_finite() { main_error.abs() } else { 0.0 };

    let mut squared: Vec<f64> = alternates
        .into_iter()
        .filter(|value| value.is_finite())
        .map(|value| (value - main_value).powi(2))
        .collect();
    if squared.is_empty() {
        return fallback;
    }

    // summed in sorted order so the result does not depend on family order
    squared.sort_by(f64::total_cmp);
    let n = squared.len() + 1;
    let deviation = (squared.iter().sum::<f64>() / (n - 1) as f64).sqrt();

    if deviation > 0.0 && deviation.is_finite() {
        deviation
    } else {
        fallback
    }
}
