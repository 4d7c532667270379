use std::fmt::Display;

use crate::config::BinRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Charge {
    Positive,
    Negative,
}

impl Charge {
    pub const ALL: [Charge; 2] = [Charge::Positive, Charge::Negative];

    /// Form used in histogram names.
    pub fn label(&self) -> &'static str {
        match self {
            Charge::Positive => "charge>0",
            Charge::Negative => "charge<0",
        }
    }

    /// Form used in file names.
    pub fn short(&self) -> &'static str {
        match self {
            Charge::Positive => "pos",
            Charge::Negative => "neg",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResidualVariable {
    Dphi,
    Dz,
}

impl ResidualVariable {
    pub const ALL: [ResidualVariable; 2] = [ResidualVariable::Dphi, ResidualVariable::Dz];

    pub fn name(&self) -> &'static str {
        match self {
            ResidualVariable::Dphi => "dphi",
            ResidualVariable::Dz => "dz",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|variable| variable.name() == name)
    }
}

/// One independent calibration point of the residual scan.
#[derive(Debug, Clone, PartialEq)]
pub struct BinCombination {
    pub detector: String,
    pub variable: ResidualVariable,
    pub charge: Charge,
    pub centrality: BinRange,
    pub zdc: BinRange,
    pub pt: Option<BinRange>,
}

impl BinCombination {
    /// Name of the residual vs pT vs centrality histogram for this combination.
    pub fn histogram_key(&self) -> String {
        format!(
            "{} vs pT vs centrality: {}, {}, {}<zDC<{}",
            self.variable.name(),
            self.detector,
            self.charge.label(),
            self.zdc.min,
            self.zdc.max
        )
    }

    pub fn with_pt(&self, pt: BinRange) -> Self {
        Self {
            pt: Some(pt),
            ..self.clone()
        }
    }

    /// Suffix for per-combination output files, e.g. `_c0-20_zDC-30-0`.
    pub fn path_suffix(&self) -> String {
        format!(
            "_c{}-{}_zDC{}-{}",
            self.centrality.min, self.centrality.max, self.zdc.min, self.zdc.max
        )
    }
}

impl Display for BinCombination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}, {}, {} at {}<zDC<{}, centrality {}-{}%",
            self.variable.name(),
            self.detector,
            self.charge.label(),
            self.zdc.min,
            self.zdc.max,
            self.centrality.min,
            self.centrality.max
        )?;
        if let Some(pt) = &self.pt {
            write!(f, ", {}<pT<{}", pt.min, pt.max)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_key_and_context() {
        let combination = BinCombination {
            detector: "PC2".to_owned(),
            variable: ResidualVariable::Dz,
            charge: Charge::Negative,
            centrality: BinRange::new(0.0, 20.0),
            zdc: BinRange::new(-30.0, -20.0),
            pt: None,
        };
        assert_eq!(
            combination.histogram_key(),
            "dz vs pT vs centrality: PC2, charge<0, -30<zDC<-20"
        );
        assert_eq!(combination.path_suffix(), "_c0-20_zDC-30--20");

        let with_pt = combination.with_pt(BinRange::new(1.0, 1.5));
        assert_eq!(
            with_pt.to_string(),
            "dz, PC2, charge<0 at -30<zDC<-20, centrality 0-20%, 1<pT<1.5"
        );
        assert_eq!(ResidualVariable::from_name("dphi"), Some(ResidualVariable::Dphi));
    }
}
