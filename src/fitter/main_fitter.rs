use super::common::{Data, Parameter, ParameterRole};
use super::models::exponential::{exp_polynomial, exponential_offset, seed_exp_polynomial};
use super::models::gaussian::gaussian;
use super::models::linear::linear;
use super::models::polynomial::{polynomial, seed_coefficients};
use super::models::powerlaw::power_law_offset;

/// Closed set of parametric shapes, selected in the configuration by `kind`.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FitModel {
    /// A*exp(-(x-mu)^2/(2 sigma^2))
    Gaussian,
    /// Signal Gaussian plus a wide background Gaussian.
    GaussianWithBackground,
    /// Gaussian plus c0 + c1*x.
    GaussianWithLinear,
    Polynomial { degree: usize },
    /// exp(c0 + c1*x + ...)
    ExpPolynomial { degree: usize },
    /// c0 + c1*x^c2
    PowerLawOffset,
    /// c0 + c1*exp(c2*x)
    ExponentialOffset,
}

impl FitModel {
    pub fn parameter_roles(&self) -> Vec<(String, ParameterRole)> {
        use ParameterRole::{
            Amplitude, BackgroundAmplitude, BackgroundMean, BackgroundSigma, Coefficient, Mean,
            Sigma,
        };

        let named = |names: &[(&str, ParameterRole)]| {
            names
                .iter()
                .map(|(name, role)| ((*name).to_owned(), *role))
                .collect::<Vec<_>>()
        };

        match self {
            FitModel::Gaussian => named(&[("amplitude", Amplitude), ("mean", Mean), ("sigma", Sigma)]),
            FitModel::GaussianWithBackground => named(&[
                ("amplitude", Amplitude),
                ("mean", Mean),
                ("sigma", Sigma),
                ("background amplitude", BackgroundAmplitude),
                ("background mean", BackgroundMean),
                ("background sigma", BackgroundSigma),
            ]),
            FitModel::GaussianWithLinear => named(&[
                ("amplitude", Amplitude),
                ("mean", Mean),
                ("sigma", Sigma),
                ("intercept", Coefficient),
                ("slope", Coefficient),
            ]),
            FitModel::Polynomial { degree } | FitModel::ExpPolynomial { degree } => (0..=*degree)
                .map(|i| (format!("c{i}"), Coefficient))
                .collect(),
            FitModel::PowerLawOffset | FitModel::ExponentialOffset => {
                named(&[("c0", Coefficient), ("c1", Coefficient), ("c2", Coefficient)])
            }
        }
    }

    pub fn number_of_parameters(&self) -> usize {
        match self {
            FitModel::Gaussian => 3,
            FitModel::GaussianWithBackground => 6,
            FitModel::GaussianWithLinear => 5,
            FitModel::Polynomial { degree } | FitModel::ExpPolynomial { degree } => degree + 1,
            FitModel::PowerLawOffset | FitModel::ExponentialOffset => 3,
        }
    }

    pub fn evaluate(&self, x: f64, p: &[f64]) -> f64 {
        match self {
            FitModel::Gaussian => gaussian(x, p[0], p[1], p[2]),
            FitModel::GaussianWithBackground => {
                gaussian(x, p[0], p[1], p[2]) + gaussian(x, p[3], p[4], p[5])
            }
            FitModel::GaussianWithLinear => gaussian(x, p[0], p[1], p[2]) + linear(x, p[3], p[4]),
            FitModel::Polynomial { .. } => polynomial(x, p),
            FitModel::ExpPolynomial { .. } => exp_polynomial(x, p),
            FitModel::PowerLawOffset => power_law_offset(x, p[0], p[1], p[2]),
            FitModel::ExponentialOffset => exponential_offset(x, p[0], p[1], p[2]),
        }
    }

    /// Starting values used when the configuration gives none.
    ///
    /// Polynomial shapes are seeded from an unconstrained regression over `data`
    /// when there are enough usable points.
    pub fn seeds(&self, data: &Data) -> Vec<f64> {
        let (x, y): (Vec<f64>, Vec<f64>) = (0..data.len())
            .filter(|&i| data.is_usable(i))
            .map(|i| (data.x[i], data.y[i]))
            .unzip();

        let regressed = match self {
            FitModel::Polynomial { degree } => seed_coefficients(&x, &y, *degree),
            FitModel::ExpPolynomial { degree } => seed_exp_polynomial(&x, &y, *degree),
            _ => None,
        };
        if let Some(seeds) = regressed {
            return seeds;
        }

        let mean_y = if y.is_empty() {
            0.0
        } else {
            y.iter().sum::<f64>() / y.len() as f64
        };
        match self {
            FitModel::Gaussian | FitModel::GaussianWithBackground | FitModel::GaussianWithLinear => {
                let mut seeds = vec![0.0; self.number_of_parameters()];
                seeds[0] = y.iter().copied().fold(0.0, f64::max);
                seeds[2] = 1.0;
                if let FitModel::GaussianWithBackground = self {
                    seeds[3] = 0.1 * seeds[0];
                    seeds[5] = 3.0;
                }
                seeds
            }
            FitModel::Polynomial { .. } => {
                let mut seeds = vec![0.0; self.number_of_parameters()];
                seeds[0] = mean_y;
                seeds
            }
            FitModel::ExpPolynomial { .. } => {
                let mut seeds = vec![0.0; self.number_of_parameters()];
                seeds[0] = if mean_y > 0.0 { mean_y.ln() } else { 0.0 };
                seeds
            }
            FitModel::PowerLawOffset | FitModel::ExponentialOffset => vec![mean_y, 1.0, -1.0],
        }
    }
}

/// A model together with its current parameter values, bounds and fit range.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct FitFunction {
    pub model: FitModel,
    pub parameters: Vec<Parameter>,
    pub range: (f64, f64),
}

impl FitFunction {
    pub fn new(model: FitModel, seeds: &[f64], range: (f64, f64)) -> Self {
        let parameters = model
            .parameter_roles()
            .into_iter()
            .enumerate()
            .map(|(i, (name, role))| Parameter::new(&name, role, seeds.get(i).copied().unwrap_or(0.0)))
            .collect();
        Self {
            model,
            parameters,
            range,
        }
    }

    pub fn values(&self) -> Vec<f64> {
        self.parameters.iter().map(|p| p.value).collect()
    }

    pub fn value(&self, index: usize) -> f64 {
        self.parameters[index].value
    }

    pub fn set_values(&mut self, values: &[f64]) {
        for (parameter, &value) in self.parameters.iter_mut().zip(values) {
            parameter.value = parameter.clamp(value);
        }
    }

    pub fn set_limits(&mut self, index: usize, a: f64, b: f64) {
        self.parameters[index].set_limits(a, b);
    }

    pub fn bounds(&self) -> Vec<(f64, f64)> {
        self.parameters.iter().map(|p| (p.min, p.max)).collect()
    }

    pub fn index_of(&self, role: ParameterRole) -> Option<usize> {
        self.parameters.iter().position(|p| p.role == role)
    }

    pub fn value_of(&self, role: ParameterRole) -> Option<f64> {
        self.index_of(role).map(|i| self.parameters[i].value)
    }

    pub fn eval(&self, x: f64) -> f64 {
        self.model.evaluate(x, &self.values())
    }

    /// Samples the function on a regular grid, for plotting.
    pub fn curve(&self, x_min: f64, x_max: f64, number_points: usize) -> Vec<[f64; 2]> {
        let values = self.values();
        let step = (x_max - x_min) / number_points.saturating_sub(1).max(1) as f64;
        (0..number_points)
            .map(|i| {
                let x = x_min + step * i as f64;
                [x, self.model.evaluate(x, &values)]
            })
            .filter(|point| point[1].is_finite())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_from_config_key() {
        let model: FitModel = serde_yaml::from_str("kind: polynomial\ndegree: 2").unwrap();
        assert_eq!(model, FitModel::Polynomial { degree: 2 });
        assert_eq!(model.number_of_parameters(), 3);

        let model: FitModel = serde_json::from_str(r#"{"kind": "gaussian_with_background"}"#).unwrap();
        assert_eq!(model.parameter_roles().len(), model.number_of_parameters());
        assert_eq!(model.parameter_roles()[4].1, ParameterRole::BackgroundMean);
    }

    #[test]
    fn test_function_evaluation() {
        let function = FitFunction::new(FitModel::GaussianWithLinear, &[10.0, 0.0, 1.0, 2.0, 0.5], (-5.0, 5.0));
        assert!((function.eval(0.0) - 12.0).abs() < 1e-12);
        assert_eq!(function.value_of(ParameterRole::Sigma), Some(1.0));
        assert_eq!(function.curve(-1.0, 1.0, 3).len(), 3);
    }

    #[test]
    fn test_polynomial_seeds_from_data() {
        let mut data = Data::default();
        for x in [1.0, 2.0, 3.0, 4.0] {
            data.push(x, 2.0 + 0.5 * x, 1.0);
        }
        let seeds = FitModel::Polynomial { degree: 1 }.seeds(&data);
        assert!((seeds[0] - 2.0).abs() < 1e-6);
        assert!((seeds[1] - 0.5).abs() < 1e-6);
    }
}
