// c0 + c1*x^c2, defined for x > 0
pub fn power_law_offset(x: f64, offset: f64, amplitude: f64, exponent: f64) -> f64 {
    offset + amplitude * x.powf(exponent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_law_offset() {
        assert!((power_law_offset(4.0, 1.0, 50.0, -1.0) - 13.5).abs() < 1e-12);
        assert!((power_law_offset(100.0, -3.0, 0.0, 0.0) + 3.0).abs() < 1e-12);
    }
}
