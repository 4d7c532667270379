use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use nalgebra::storage::Owned;
use nalgebra::{DMatrix, DVector, Dyn};

use super::common::Data;
use super::main_fitter::FitFunction;

/// Summary of one call to the fit primitive.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct FitOutcome {
    pub chi2: f64,
    pub ndf: usize,
    pub converged: bool,
    pub iterations: usize,
}

/// A bounded least-squares minimiser.
///
/// It takes the function's current parameter values as seeds, never moves a
/// parameter outside `[min, max]`, keeps parameters with `min == max` fixed, and
/// only uses points inside `function.range`. The result is written back into
/// `function`. Implementations may keep scratch state, so each worker thread
/// owns its own instance.
pub trait FitPrimitive {
    fn fit(&mut self, function: &mut FitFunction, data: &Data) -> FitOutcome;
}

/// Maps a bounded external parameter onto an unbounded internal one, so the
/// unconstrained minimiser can never step outside the limits.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Transform {
    Free,
    Lower(f64),
    Upper(f64),
    Both(f64, f64),
}

impl Transform {
    /// Distance kept from a bound so the internal derivative does not vanish.
    const EDGE: f64 = 1e-9;

    fn of(min: f64, max: f64) -> Self {
        match (min.is_finite(), max.is_finite()) {
            (true, true) => Transform::Both(min, max),
            (true, false) => Transform::Lower(min),
            (false, true) => Transform::Upper(max),
            (false, false) => Transform::Free,
        }
    }

    fn to_internal(self, value: f64) -> f64 {
        match self {
            Transform::Free => value,
            Transform::Lower(lo) => ((value - lo + 1.0).max(1.0 + Self::EDGE).powi(2) - 1.0).sqrt(),
            Transform::Upper(hi) => ((hi - value + 1.0).max(1.0 + Self::EDGE).powi(2) - 1.0).sqrt(),
            Transform::Both(lo, hi) => {
                let normalised = 2.0 * (value - lo) / (hi - lo) - 1.0;
                normalised.clamp(-1.0 + Self::EDGE, 1.0 - Self::EDGE).asin()
            }
        }
    }

    fn to_external(self, internal: f64) -> f64 {
        match self {
            Transform::Free => internal,
            Transform::Lower(lo) => lo - 1.0 + (internal * internal + 1.0).sqrt(),
            Transform::Upper(hi) => hi + 1.0 - (internal * internal + 1.0).sqrt(),
            Transform::Both(lo, hi) => (lo + 0.5 * (hi - lo) * (internal.sin() + 1.0)).clamp(lo, hi),
        }
    }

    /// `d external / d internal`
    fn derivative(self, internal: f64) -> f64 {
        match self {
            Transform::Free => 1.0,
            Transform::Lower(_) => internal / (internal * internal + 1.0).sqrt(),
            Transform::Upper(_) => -internal / (internal * internal + 1.0).sqrt(),
            Transform::Both(lo, hi) => 0.5 * (hi - lo) * internal.cos(),
        }
    }
}

/// The points and free parameters of one fit, seen through the bound transforms.
struct BoundedProblem<'a> {
    function: &'a FitFunction,
    data: &'a Data,
    points: &'a [usize],
    free: Vec<(usize, Transform)>,
    external: Vec<f64>,
    internal: DVector<f64>,
    // the solver needs at least as many residuals as parameters; extra rows are zero
    rows: usize,
}

impl<'a> BoundedProblem<'a> {
    fn new(function: &'a FitFunction, data: &'a Data, points: &'a [usize], external: Vec<f64>) -> Self {
        let free: Vec<(usize, Transform)> = function
            .parameters
            .iter()
            .enumerate()
            .filter(|(_, p)| !p.is_fixed())
            .map(|(j, p)| (j, Transform::of(p.min, p.max)))
            .collect();
        let internal = DVector::from_iterator(
            free.len(),
            free.iter().map(|&(j, transform)| transform.to_internal(external[j])),
        );
        let rows = points.len().max(free.len());
        Self {
            function,
            data,
            points,
            free,
            external,
            internal,
            rows,
        }
    }

    fn jacobian_columns(&self) -> Vec<usize> {
        self.free.iter().map(|&(j, _)| j).collect()
    }
}

impl LeastSquaresProblem<f64, Dyn, Dyn> for BoundedProblem<'_> {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, internal: &DVector<f64>) {
        self.internal.copy_from(internal);
        for (k, &(j, transform)) in self.free.iter().enumerate() {
            self.external[j] = transform.to_external(internal[k]);
        }
    }

    fn params(&self) -> DVector<f64> {
        self.internal.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let mut residuals = DVector::zeros(self.rows);
        for (row, &i) in self.points.iter().enumerate() {
            let r = (self.function.model.evaluate(self.data.x[i], &self.external) - self.data.y[i]) / self.data.err[i];
            if !r.is_finite() {
                return None;
            }
            residuals[row] = r;
        }
        Some(residuals)
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let mut jacobian = external_jacobian(self.function, &self.external, &self.jacobian_columns(), self.data, self.points);
        for (k, &(_, transform)) in self.free.iter().enumerate() {
            let chain = transform.derivative(self.internal[k]);
            jacobian.column_mut(k).scale_mut(chain);
        }
        if jacobian.nrows() < self.rows {
            jacobian = jacobian.resize_vertically(self.rows, 0.0);
        }
        Some(jacobian)
    }
}

/// `d residual / d parameter` in external space by central differences, falling
/// back to one-sided steps next to a bound.
fn external_jacobian(
    function: &FitFunction,
    parameters: &[f64],
    free: &[usize],
    data: &Data,
    points: &[usize],
) -> DMatrix<f64> {
    let mut jacobian = DMatrix::zeros(points.len(), free.len());
    let mut shifted = parameters.to_vec();

    for (column, &j) in free.iter().enumerate() {
        let parameter = &function.parameters[j];
        let h = f64::EPSILON.sqrt() * parameters[j].abs().max(1e-4);
        let up = (parameters[j] + h).min(parameter.max);
        let down = (parameters[j] - h).max(parameter.min);
        let step = up - down;
        if step <= 0.0 {
            continue;
        }

        for (row, &i) in points.iter().enumerate() {
            shifted[j] = up;
            let f_up = function.model.evaluate(data.x[i], &shifted);
            shifted[j] = down;
            let f_down = function.model.evaluate(data.x[i], &shifted);
            let derivative = (f_up - f_down) / step;
            jacobian[(row, column)] = if derivative.is_finite() {
                derivative / data.err[i]
            } else {
                0.0
            };
        }
        shifted[j] = parameters[j];
    }

    jacobian
}

/// [`FitPrimitive`] on top of the `levenberg_marquardt` solver.
#[derive(Debug, Clone)]
pub struct LevMarFitter {
    /// Evaluation budget of the solver, in units of `free parameters + 1`.
    pub patience: usize,
    pub tolerance: f64,
    calls: usize,
}

impl Default for LevMarFitter {
    fn default() -> Self {
        Self {
            patience: 200,
            tolerance: 1e-10,
            calls: 0,
        }
    }
}

impl LevMarFitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of fits performed by this instance.
    pub fn calls(&self) -> usize {
        self.calls
    }

    fn points_in_range(function: &FitFunction, data: &Data) -> Vec<usize> {
        let (low, high) = function.range;
        (0..data.len())
            .filter(|&i| data.is_usable(i) && data.x[i] >= low && data.x[i] <= high)
            .collect()
    }

    fn chi2(function: &FitFunction, parameters: &[f64], data: &Data, points: &[usize]) -> f64 {
        points
            .iter()
            .map(|&i| {
                let residual = (data.y[i] - function.model.evaluate(data.x[i], parameters)) / data.err[i];
                residual * residual
            })
            .sum()
    }

    // Unscaled (J^T J)^-1 in external space; fixed parameters get zero
    fn set_uncertainties(function: &mut FitFunction, data: &Data, points: &[usize], free: &[usize]) {
        let parameters = function.values();
        let jacobian = external_jacobian(function, &parameters, free, data, points);
        let covariance = (jacobian.transpose() * &jacobian).try_inverse();
        for parameter in function.parameters.iter_mut() {
            parameter.uncertainty = 0.0;
        }
        if let Some(covariance) = covariance {
            for (k, &j) in free.iter().enumerate() {
                let variance = covariance[(k, k)];
                if variance.is_finite() && variance >= 0.0 {
                    function.parameters[j].uncertainty = variance.sqrt();
                }
            }
        }
    }
}

impl FitPrimitive for LevMarFitter {
    fn fit(&mut self, function: &mut FitFunction, data: &Data) -> FitOutcome {
        self.calls += 1;

        let points = Self::points_in_range(function, data);
        let free: Vec<usize> = (0..function.parameters.len())
            .filter(|&j| !function.parameters[j].is_fixed())
            .collect();

        let parameters: Vec<f64> = function
            .parameters
            .iter()
            .map(|p| p.clamp(p.value))
            .collect();
        let seed_chi2 = Self::chi2(function, &parameters, data, &points);
        let ndf = points.len().saturating_sub(free.len());

        if points.is_empty() || free.is_empty() || !seed_chi2.is_finite() {
            log::debug!(
                "Nothing to fit: {} point(s), {} free parameter(s), chi2 {seed_chi2}",
                points.len(),
                free.len()
            );
            function.set_values(&parameters);
            return FitOutcome {
                chi2: seed_chi2,
                ndf,
                converged: false,
                iterations: 0,
            };
        }

        let problem = BoundedProblem::new(function, data, &points, parameters.clone());
        let (problem, report) = LevenbergMarquardt::new()
            .with_patience(self.patience)
            .with_ftol(self.tolerance)
            .with_xtol(self.tolerance)
            .minimize(problem);

        let mut fitted = problem.external;
        let mut chi2 = Self::chi2(function, &fitted, data, &points);
        if !chi2.is_finite() || chi2 > seed_chi2 {
            // the solver gave up somewhere worse than where it started
            fitted = parameters;
            chi2 = seed_chi2;
        }
        for (parameter, value) in function.parameters.iter().zip(fitted.iter_mut()) {
            *value = parameter.clamp(*value);
        }
        function.set_values(&fitted);
        Self::set_uncertainties(function, data, &points, &free);

        let converged = report.termination.was_successful();
        log::debug!(
            "{:?} fit finished after {} evaluation(s) ({:?}): chi2/ndf = {chi2:.3}/{ndf}",
            function.model,
            report.number_of_evaluations,
            report.termination
        );

        FitOutcome {
            chi2,
            ndf,
            converged,
            iterations: report.number_of_evaluations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fitter::main_fitter::FitModel;

    fn gaussian_data(mean: f64, sigma: f64, amplitude: f64) -> Data {
        let mut data = Data::default();
        for i in 0..80 {
            let x = -4.0 + 0.1 * (i as f64 + 0.5);
            let y = (amplitude * (-0.5 * ((x - mean) / sigma).powi(2)).exp()).round();
            data.push(x, y, y.sqrt());
        }
        data
    }

    #[test]
    fn test_fit_gaussian() {
        let data = gaussian_data(0.2, 0.8, 1000.0);
        let mut function = FitFunction::new(FitModel::Gaussian, &[800.0, 0.0, 1.0], (-4.0, 4.0));
        let mut fitter = LevMarFitter::new();
        let outcome = fitter.fit(&mut function, &data);

        assert!(outcome.converged);
        assert!((function.value(1) - 0.2).abs() < 1e-3);
        assert!((function.value(2) - 0.8).abs() < 1e-3);
        assert!(function.parameters[1].uncertainty > 0.0);
        assert_eq!(fitter.calls(), 1);
    }

    #[test]
    fn test_bounds_are_respected() {
        let data = gaussian_data(0.2, 0.8, 1000.0);
        let mut function = FitFunction::new(FitModel::Gaussian, &[800.0, 0.0, 1.0], (-4.0, 4.0));
        function.set_limits(1, -0.1, 0.1);
        function.set_limits(0, 1000.0, 1000.0);

        LevMarFitter::new().fit(&mut function, &data);

        assert!(function.value(1) <= 0.1 && function.value(1) >= -0.1);
        // the best mean inside the box is its upper edge
        assert!(function.value(1) > 0.08, "{}", function.value(1));
        assert_eq!(function.value(0), 1000.0);
        assert_eq!(function.parameters[0].uncertainty, 0.0);
    }

    #[test]
    fn test_one_sided_bound() {
        let data = gaussian_data(0.2, 0.8, 1000.0);
        let mut function = FitFunction::new(FitModel::Gaussian, &[800.0, 0.0, 1.5], (-4.0, 4.0));
        function.parameters[2].min = 1.0;

        LevMarFitter::new().fit(&mut function, &data);

        assert!(function.value(2) >= 1.0);
        assert!(function.value(2) < 1.05, "{}", function.value(2));
        assert!((function.value(1) - 0.2).abs() < 0.05);
    }

    #[test]
    fn test_transform_round_trip_stays_inside() {
        for transform in [
            Transform::Both(-2.0, 3.0),
            Transform::Lower(1.0),
            Transform::Upper(-1.0),
            Transform::Free,
        ] {
            for internal in [-50.0, -1.3, 0.0, 0.7, 12.0] {
                let external = transform.to_external(internal);
                match transform {
                    Transform::Both(lo, hi) => assert!(external >= lo && external <= hi),
                    Transform::Lower(lo) => assert!(external >= lo),
                    Transform::Upper(hi) => assert!(external <= hi),
                    Transform::Free => assert_eq!(external, internal),
                }
            }
        }
        let transform = Transform::Both(-2.0, 3.0);
        assert!((transform.to_external(transform.to_internal(0.5)) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_fewer_points_than_parameters() {
        let mut data = Data::default();
        data.push(1.0, 3.0, 1.0);
        data.push(2.0, 5.0, 1.0);
        let mut function = FitFunction::new(FitModel::Polynomial { degree: 2 }, &[0.0, 0.0, 0.0], (0.0, 5.0));
        let outcome = LevMarFitter::new().fit(&mut function, &data);

        assert_eq!(outcome.ndf, 0);
        assert!(outcome.chi2 < 1e-6, "{outcome:?}");
    }

    #[test]
    fn test_range_restricts_points() {
        let mut data = Data::default();
        for x in [1.0, 2.0, 3.0, 10.0] {
            let y = if x < 5.0 { 2.0 * x } else { 100.0 };
            data.push(x, y, 1.0);
        }
        let mut function = FitFunction::new(FitModel::Polynomial { degree: 1 }, &[0.0, 1.0], (0.0, 5.0));
        let outcome = LevMarFitter::new().fit(&mut function, &data);

        assert_eq!(outcome.ndf, 1);
        assert!(function.value(0).abs() < 1e-6);
        assert!((function.value(1) - 2.0).abs() < 1e-6);
    }
}
