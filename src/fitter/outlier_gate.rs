use super::common::ParameterRole;
use super::main_fitter::FitFunction;

/// Plausible magnitude window for one parameter: `min_abs <= |v| < max_abs`.
#[derive(Debug, Clone, Copy, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct GateRule {
    pub role: ParameterRole,
    #[serde(default)]
    pub min_abs: f64,
    pub max_abs: f64,
}

impl GateRule {
    pub fn new(role: ParameterRole, min_abs: f64, max_abs: f64) -> Self {
        Self {
            role,
            min_abs,
            max_abs,
        }
    }

    pub fn accepts(&self, value: f64) -> bool {
        let magnitude = value.abs();
        magnitude >= self.min_abs && magnitude < self.max_abs
    }
}

/// Rejects fits whose shape parameters are implausibly large or collapsed.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(transparent)]
pub struct OutlierGate {
    pub rules: Vec<GateRule>,
}

impl OutlierGate {
    pub fn new(rules: Vec<GateRule>) -> Self {
        Self { rules }
    }

    /// The first rule the function fails, if any. A rule whose role the model
    /// does not have is ignored; a NaN value fails.
    pub fn violation(&self, function: &FitFunction) -> Option<(GateRule, f64)> {
        self.rules.iter().find_map(|rule| {
            let value = function.value_of(rule.role)?;
            (!rule.accepts(value)).then_some((*rule, value))
        })
    }

    pub fn accept(&self, function: &FitFunction) -> bool {
        self.violation(function).is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fitter::main_fitter::FitModel;

    fn gaussian(mean: f64, sigma: f64) -> FitFunction {
        FitFunction::new(FitModel::Gaussian, &[100.0, mean, sigma], (-5.0, 5.0))
    }

    #[test]
    fn test_boundary_is_rejected_every_time() {
        let gate = OutlierGate::new(vec![
            GateRule::new(ParameterRole::Mean, 0.0, 1.0),
            GateRule::new(ParameterRole::Sigma, 0.01, 1.0),
        ]);

        for _ in 0..10 {
            assert!(gate.accept(&gaussian(0.2, 0.8)));
            assert!(!gate.accept(&gaussian(1.0, 0.8)));
            assert!(!gate.accept(&gaussian(-1.0, 0.8)));
            assert!(!gate.accept(&gaussian(0.2, 1.0)));
            assert!(gate.accept(&gaussian(0.2, 0.01)));
            assert!(!gate.accept(&gaussian(0.2, 0.005)));
        }
    }

    #[test]
    fn test_violation_names_the_rule() {
        let gate = OutlierGate::new(vec![GateRule::new(ParameterRole::Sigma, 0.0, 5.0)]);
        let (rule, value) = gate.violation(&gaussian(0.0, -7.0)).unwrap();
        assert_eq!(rule.role, ParameterRole::Sigma);
        assert_eq!(value, -7.0);
        assert!(!gate.accept(&gaussian(0.0, f64::NAN)));

        // roles the model lacks are not gated
        let gate = OutlierGate::new(vec![GateRule::new(ParameterRole::BackgroundSigma, 0.0, 1.0)]);
        assert!(gate.accept(&gaussian(0.0, 3.0)));
    }

    #[test]
    fn test_gate_from_config() {
        let gate: OutlierGate = serde_yaml::from_str("- role: mean\n  max_abs: 10.0\n- role: sigma\n  min_abs: 0.1\n  max_abs: 5.0").unwrap();
        assert_eq!(gate.rules.len(), 2);
        assert_eq!(gate.rules[0].min_abs, 0.0);
    }
}
