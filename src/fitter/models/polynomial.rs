use compute::predict::PolynomialRegressor;

// c0 + c1*x + c2*x^2 + ...
pub fn polynomial(x: f64, coefficients: &[f64]) -> f64 {
    coefficients.iter().rev().fold(0.0, |acc, c| acc * x + c)
}

/// Least-squares polynomial coefficients used to seed a constrained fit.
///
/// Returns `None` when there are not enough points for the requested degree.
pub fn seed_coefficients(x_data: &[f64], y_data: &[f64], degree: usize) -> Option<Vec<f64>> {
    if x_data.len() < degree + 1 {
        log::debug!("Not enough data points to seed polynomial of degree {degree}");
        return None;
    }

    let mut regressor = PolynomialRegressor::new(degree);
    regressor.fit(x_data, y_data);

    let coefficients = regressor.coef.clone();
    if coefficients.len() != degree + 1 || coefficients.iter().any(|c| !c.is_finite()) {
        log::debug!("Polynomial seed failed: {coefficients:?}");
        return None;
    }
    Some(coefficients)
}
