use crate::fitter::common::Data;
use crate::histoer::axis::Axis;

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Histogram {
    pub name: String,
    pub axis: Axis,
    pub contents: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sumw2: Option<Vec<f64>>,
}

impl Histogram {
    pub fn new(name: &str, axis: Axis) -> Self {
        let bins = axis.bins();
        Histogram {
            name: name.to_owned(),
            axis,
            contents: vec![0.0; bins],
            sumw2: None,
        }
    }

    pub fn with_contents(name: &str, axis: Axis, contents: Vec<f64>, sumw2: Option<Vec<f64>>) -> Self {
        Histogram {
            name: name.to_owned(),
            axis,
            contents,
            sumw2,
        }
    }

    pub fn check_shape(&self) -> Result<(), String> {
        let bins = self.axis.bins();
        if self.contents.len() != bins {
            return Err(format!(
                "{}: {} contents for {} bins",
                self.name,
                self.contents.len(),
                bins
            ));
        }
        if let Some(sumw2) = &self.sumw2 {
            if sumw2.len() != bins {
                return Err(format!("{}: {} errors for {} bins", self.name, sumw2.len(), bins));
            }
        }
        Ok(())
    }

    // Add a weighted value to the histogram; values outside the axis are dropped
    pub fn fill(&mut self, value: f64, weight: f64) {
        if let Some(bin) = self.axis.find_bin(value) {
            self.contents[bin] += weight;
            if let Some(sumw2) = &mut self.sumw2 {
                sumw2[bin] += weight * weight;
            }
        }
    }

    pub fn bins(&self) -> usize {
        self.contents.len()
    }

    pub fn content(&self, bin: usize) -> f64 {
        self.contents[bin]
    }

    // Bin error from the stored sum of squared weights, or Poisson if none was stored
    pub fn error(&self, bin: usize) -> f64 {
        match &self.sumw2 {
            Some(sumw2) => sumw2[bin].sqrt(),
            None => self.contents[bin].abs().sqrt(),
        }
    }

    pub fn integral(&self) -> f64 {
        self.contents.iter().sum()
    }

    pub fn integral_between(&self, first_bin: usize, last_bin: usize) -> f64 {
        self.contents[first_bin..=last_bin].iter().sum()
    }

    pub fn maximum_bin(&self) -> usize {
        self.contents
            .iter()
            .enumerate()
            .fold((0, f64::NEG_INFINITY), |(best, max), (bin, &value)| {
                if value > max { (bin, value) } else { (best, max) }
            })
            .0
    }

    pub fn maximum(&self) -> f64 {
        self.contents[self.maximum_bin()]
    }

    /// Index of the first bin whose content exceeds `threshold`.
    pub fn first_populated_bin(&self, threshold: f64) -> Option<usize> {
        self.contents.iter().position(|&c| c > threshold)
    }

    /// Index of the last bin whose content exceeds `threshold`.
    pub fn last_populated_bin(&self, threshold: f64) -> Option<usize> {
        self.contents.iter().rposition(|&c| c > threshold)
    }

    // Bin centers, contents and errors as fit data
    pub fn to_data(&self) -> Data {
        let bins = 0..self.bins();
        Data {
            x: bins.clone().map(|bin| self.axis.bin_center(bin)).collect(),
            y: self.contents.clone(),
            err: bins.map(|bin| self.error(bin)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_and_errors() {
        let mut hist = Histogram::new("h", Axis::uniform(4, 0.0, 4.0));
        hist.fill(0.5, 1.0);
        hist.fill(0.5, 1.0);
        hist.fill(3.999, 4.0);
        hist.fill(7.0, 1.0);

        assert_eq!(hist.contents, vec![2.0, 0.0, 0.0, 4.0]);
        assert!((hist.error(0) - 2.0_f64.sqrt()).abs() < 1e-12);
        assert!((hist.integral() - 6.0).abs() < 1e-12);
        assert_eq!(hist.maximum_bin(), 3);
        assert_eq!(hist.first_populated_bin(1e-7), Some(0));
        assert_eq!(hist.last_populated_bin(1e-7), Some(3));
    }

    #[test]
    fn test_weighted_errors() {
        let mut hist = Histogram::with_contents("h", Axis::uniform(2, 0.0, 2.0), vec![0.0; 2], Some(vec![0.0; 2]));
        hist.fill(0.2, 3.0);
        hist.fill(0.4, 4.0);
        assert!((hist.error(0) - 5.0).abs() < 1e-12);
        assert!(hist.check_shape().is_ok());
    }
}
