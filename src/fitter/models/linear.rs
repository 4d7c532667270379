pub fn linear(x: f64, intercept: f64, slope: f64) -> f64 {
    intercept + slope * x
}
