#[derive(PartialEq, Default, Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct Data {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub err: Vec<f64>,
}

impl Data {
    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    pub fn push(&mut self, x: f64, y: f64, err: f64) {
        self.x.push(x);
        self.y.push(y);
        self.err.push(err);
    }

    // A point takes part in a fit only when its error can be used as a weight
    pub fn is_usable(&self, i: usize) -> bool {
        self.err[i] > 0.0 && self.err[i].is_finite() && self.y[i].is_finite()
    }

    /// Number of usable points at distinct x positions.
    pub fn distinct_usable_points(&self) -> usize {
        let mut xs: Vec<f64> = (0..self.len())
            .filter(|&i| self.is_usable(i))
            .map(|i| self.x[i])
            .collect();
        xs.sort_by(f64::total_cmp);
        xs.dedup();
        xs.len()
    }
}

#[derive(PartialEq, Debug, Default, Clone, Copy, serde::Deserialize, serde::Serialize)]
pub struct Value {
    pub value: f64,
    pub uncertainty: f64,
}

/// What a parameter means to the model. Shrink schedules, alternate-fit bounds
/// and outlier thresholds are keyed by role rather than by position.
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterRole {
    Amplitude,
    Mean,
    Sigma,
    BackgroundAmplitude,
    BackgroundMean,
    BackgroundSigma,
    Coefficient,
}

impl ParameterRole {
    pub fn is_amplitude(&self) -> bool {
        matches!(self, ParameterRole::Amplitude | ParameterRole::BackgroundAmplitude)
    }
}

#[derive(PartialEq, Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct Parameter {
    pub name: String,
    pub role: ParameterRole,
    pub min: f64,
    pub max: f64,
    pub value: f64,
    pub uncertainty: f64,
}

impl Default for Parameter {
    fn default() -> Self {
        Self {
            name: String::new(),
            role: ParameterRole::Coefficient,
            min: f64::NEG_INFINITY,
            max: f64::INFINITY,
            value: 0.0,
            uncertainty: 0.0,
        }
    }
}

impl Parameter {
    pub fn new(name: &str, role: ParameterRole, value: f64) -> Self {
        Self {
            name: name.to_owned(),
            role,
            value,
            ..Default::default()
        }
    }

    // A parameter whose bounds collapsed to a point does not vary
    pub fn is_fixed(&self) -> bool {
        self.min == self.max
    }

    pub fn width(&self) -> f64 {
        self.max - self.min
    }

    pub fn set_limits(&mut self, a: f64, b: f64) {
        self.min = a.min(b);
        self.max = a.max(b);
        self.value = self.clamp(self.value);
    }

    pub fn clamp(&self, value: f64) -> f64 {
        value.max(self.min).min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usable_points() {
        let data = Data {
            x: vec![0.0, 1.0, 1.0, 2.0, 3.0],
            y: vec![1.0, 2.0, 2.0, 0.0, f64::NAN],
            err: vec![1.0, 1.0, 1.0, 0.0, 1.0],
        };
        assert_eq!(data.distinct_usable_points(), 2);
    }

    #[test]
    fn test_set_limits_orders_and_clamps() {
        let mut parameter = Parameter::new("p", ParameterRole::Coefficient, -1.0);
        parameter.set_limits(-0.5, -2.0);
        assert_eq!((parameter.min, parameter.max), (-2.0, -0.5));
        assert_eq!(parameter.value, -1.0);

        parameter.set_limits(0.0, 1.0);
        assert_eq!(parameter.value, 0.0);
    }
}
