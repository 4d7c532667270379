use image::Rgb;

/// Maps values in `[min, max]` onto the viridis colormap.
#[derive(Debug, Copy, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ColorScale {
    pub min: f64,
    pub max: f64,
    pub log_norm: bool,
    pub reverse: bool,
}

impl ColorScale {
    pub fn new(min: f64, max: f64) -> Self {
        Self {
            min,
            max,
            log_norm: false,
            reverse: false,
        }
    }

    /// Scale spanning the finite values of `values`.
    pub fn spanning(values: &[f64]) -> Self {
        let (min, max) = values
            .iter()
            .filter(|v| v.is_finite())
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        if min > max {
            Self::new(0.0, 1.0)
        } else {
            Self::new(min, max)
        }
    }

    /// `None` marks a value that should be left blank (non-finite, or not
    /// positive on a log scale).
    pub fn color(&self, value: f64) -> Option<Rgb<u8>> {
        if !value.is_finite() || (self.log_norm && value <= 0.0) {
            return None;
        }

        let normalized = if self.max > self.min {
            if self.log_norm {
                let min = self.min.max(f64::MIN_POSITIVE);
                (value.log10() - min.log10()) / (self.max.log10() - min.log10())
            } else {
                (value - self.min) / (self.max - self.min)
            }
        } else {
            0.0
        }
        .clamp(0.0, 1.0);

        let normalized = if self.reverse {
            1.0 - normalized
        } else {
            normalized
        };
        Some(interpolate(&VIRIDIS, normalized as f32))
    }
}

fn interpolate(color_data: &[(f32, u8, u8, u8)], normalized: f32) -> Rgb<u8> {
    let mut lower = color_data[0];
    let mut upper = color_data[0];
    for color in color_data.iter().skip(1) {
        if color.0 >= normalized {
            upper = *color;
            break;
        }
        lower = *color;
    }

    let scale = if upper.0 > lower.0 {
        (normalized - lower.0) / (upper.0 - lower.0)
    } else {
        0.0
    };
    let channel = |a: u8, b: u8| (f32::from(a) + scale * (f32::from(b) - f32::from(a))).clamp(0.0, 255.0) as u8;

    Rgb([
        channel(lower.1, upper.1),
        channel(lower.2, upper.2),
        channel(lower.3, upper.3),
    ])
}

// scalar,RGB_r,RGB_g,RGB_b
const VIRIDIS: [(f32, u8, u8, u8); 32] = [
    (0.0, 68, 1, 84),
    (0.032_258_064, 71, 13, 96),
    (0.064_516_13, 72, 25, 107),
    (0.096_774_19, 72, 36, 116),
    (0.129_032_25, 71, 46, 124),
    (0.161_290_32, 69, 56, 130),
    (0.193_548_38, 65, 66, 134),
    (0.225_806_44, 62, 75, 137),
    (0.258_064_5, 58, 84, 140),
    (0.290_322_57, 54, 93, 141),
    (0.322_580_64, 50, 101, 142),
    (0.354_838_7, 46, 109, 142),
    (0.387_096_76, 43, 117, 142),
    (0.419_354_83, 40, 125, 142),
    (0.451_612_9, 37, 133, 142),
    (0.483_870_95, 34, 140, 141),
    (0.516_129, 32, 148, 140),
    (0.548_387_1, 30, 156, 137),
    (0.580_645_14, 32, 163, 134),
    (0.612_903_24, 37, 171, 130),
    (0.645_161_3, 45, 178, 125),
    (0.677_419_36, 57, 186, 118),
    (0.709_677_4, 72, 193, 110),
    (0.741_935_5, 88, 199, 101),
    (0.774_193_5, 106, 205, 91),
    (0.806_451_6, 126, 211, 79),
    (0.838_709_65, 146, 215, 66),
    (0.870_967_75, 168, 219, 52),
    (0.903_225_8, 190, 223, 38),
    (0.935_483_9, 212, 226, 27),
    (0.967_741_9, 233, 228, 26),
    (1.0, 253, 231, 37),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoints() {
        let scale = ColorScale::new(0.0, 10.0);
        assert_eq!(scale.color(0.0), Some(Rgb([68, 1, 84])));
        assert_eq!(scale.color(10.0), Some(Rgb([253, 231, 37])));
        assert_eq!(scale.color(20.0), Some(Rgb([253, 231, 37])));
        assert_eq!(scale.color(f64::NAN), None);

        let reversed = ColorScale {
            reverse: true,
            ..scale
        };
        assert_eq!(reversed.color(0.0), Some(Rgb([253, 231, 37])));
    }

    #[test]
    fn test_log_scale_blanks_empty_bins() {
        let scale = ColorScale {
            log_norm: true,
            ..ColorScale::spanning(&[1.0, 100.0, f64::NAN])
        };
        assert_eq!(scale.color(0.0), None);
        assert_eq!(scale.color(1.0), Some(Rgb([68, 1, 84])));
    }
}
