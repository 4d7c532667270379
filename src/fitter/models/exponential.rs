use super::polynomial::{polynomial, seed_coefficients};

// exp(c0 + c1*x + ...)
pub fn exp_polynomial(x: f64, coefficients: &[f64]) -> f64 {
    polynomial(x, coefficients).exp()
}

// c0 + c1*exp(c2*x)
pub fn exponential_offset(x: f64, offset: f64, amplitude: f64, rate: f64) -> f64 {
    offset + amplitude * (rate * x).exp()
}

/// Seeds an exponential polynomial from a polynomial fit of `ln(y)`.
pub fn seed_exp_polynomial(x_data: &[f64], y_data: &[f64], degree: usize) -> Option<Vec<f64>> {
    if y_data.iter().any(|&y| y <= 0.0) {
        return None;
    }
    let log_y: Vec<f64> = y_data.iter().map(|y| y.ln()).collect();
    seed_coefficients(x_data, &log_y, degree)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exp_polynomial_seed() {
        let x = vec![0.5, 1.0, 2.0, 3.0];
        let y: Vec<f64> = x.iter().map(|x| exp_polynomial(*x, &[0.2, -0.4])).collect();
        let seeds = seed_exp_polynomial(&x, &y, 1).unwrap();
        assert!((seeds[0] - 0.2).abs() < 1e-6);
        assert!((seeds[1] + 0.4).abs() < 1e-6);

        assert!(seed_exp_polynomial(&x, &[1.0, 0.0, 1.0, 1.0], 1).is_none());
    }

    #[test]
    fn test_exponential_offset() {
        assert!((exponential_offset(0.0, 1.0, 2.0, 5.0) - 3.0).abs() < 1e-12);
    }
}
