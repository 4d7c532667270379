use crate::fitter::common::Value;

pub fn gaussian(x: f64, amplitude: f64, mean: f64, sigma: f64) -> f64 {
    if sigma.abs() < f64::MIN_POSITIVE {
        return 0.0;
    }
    let z = (x - mean) / sigma;
    amplitude * (-0.5 * z * z).exp()
}

#[derive(Clone, Copy, Debug, serde::Serialize, serde::Deserialize)]
pub struct GaussianParams {
    pub amplitude: Value,
    pub mean: Value,
    pub sigma: Value,
    pub fwhm: Value,
    pub area: Value,
}

impl GaussianParams {
    pub fn new(amplitude: Value, mean: Value, sigma: Value, bin_width: f64) -> Self {
        let sigma = Value {
            value: sigma.value.abs(),
            uncertainty: sigma.uncertainty,
        };

        GaussianParams {
            amplitude,
            mean,
            sigma,
            fwhm: Value {
                value: Self::calculate_fwhm(sigma.value),
                uncertainty: Self::calculate_fwhm(sigma.uncertainty),
            },
            area: Value {
                value: Self::calculate_area(amplitude.value, sigma.value, bin_width),
                uncertainty: Self::area_uncertainty(amplitude, sigma, bin_width),
            },
        }
    }

    fn calculate_fwhm(sigma: f64) -> f64 {
        2.0 * (2.0 * f64::ln(2.0)).sqrt() * sigma
    }

    // Counts under the peak for a histogram with the given bin width
    fn calculate_area(amplitude: f64, sigma: f64, bin_width: f64) -> f64 {
        amplitude * sigma * (2.0 * std::f64::consts::PI).sqrt() / bin_width
    }

    fn area_uncertainty(amplitude: Value, sigma: Value, bin_width: f64) -> f64 {
        let two_pi_sqrt = (2.0 * std::f64::consts::PI).sqrt();
        ((sigma.value * two_pi_sqrt * amplitude.uncertainty).powi(2)
            + (amplitude.value * two_pi_sqrt * sigma.uncertainty).powi(2))
        .sqrt()
            / bin_width
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gaussian_shape() {
        assert!((gaussian(0.2, 1000.0, 0.2, 0.8) - 1000.0).abs() < 1e-9);
        assert!((gaussian(1.0, 1000.0, 0.2, 0.8) - 1000.0 * (-0.5_f64).exp()).abs() < 1e-9);
        assert_eq!(gaussian(1.0, 1.0, 1.0, 0.0), 0.0);
    }

    #[test]
    fn test_area_and_fwhm() {
        let zero = Value {
            value: 0.0,
            uncertainty: 0.0,
        };
        let params = GaussianParams::new(
            Value {
                value: 100.0,
                uncertainty: 0.0,
            },
            zero,
            Value {
                value: -2.0,
                uncertainty: 0.0,
            },
            0.5,
        );
        assert!((params.sigma.value - 2.0).abs() < 1e-12);
        assert!((params.fwhm.value - 4.709_640_090_061_899).abs() < 1e-9);
        assert!((params.area.value - 100.0 * 2.0 * (2.0 * std::f64::consts::PI).sqrt() / 0.5).abs() < 1e-9);
    }
}
