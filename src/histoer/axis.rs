/// Ordered bin edges of a histogram axis.
///
/// On input an axis is either uniform (`{bins, min, max}`) or given by explicit
/// edges (`{edges: [...]}`). Bin `i` covers `[edges[i], edges[i + 1])`, with the
/// last bin closed on the right.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(try_from = "AxisSpec", into = "AxisSpec")]
pub struct Axis {
    edges: Vec<f64>,
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(untagged)]
pub enum AxisSpec {
    Uniform { bins: usize, min: f64, max: f64 },
    Edges { edges: Vec<f64> },
}

impl TryFrom<AxisSpec> for Axis {
    type Error = String;

    fn try_from(spec: AxisSpec) -> Result<Self, Self::Error> {
        match spec {
            AxisSpec::Uniform { bins, min, max } => {
                if bins == 0 || !(min < max) {
                    return Err(format!(
                        "uniform axis needs at least one bin and min < max (got {bins} bins, {min}..{max})"
                    ));
                }
                Ok(Axis::uniform(bins, min, max))
            }
            AxisSpec::Edges { edges } => Axis::from_edges(edges),
        }
    }
}

impl From<Axis> for AxisSpec {
    fn from(axis: Axis) -> Self {
        AxisSpec::Edges { edges: axis.edges }
    }
}

impl Axis {
    pub fn uniform(bins: usize, min: f64, max: f64) -> Self {
        let width = (max - min) / bins as f64;
        let mut edges: Vec<f64> = (0..bins).map(|i| min + i as f64 * width).collect();
        edges.push(max);
        Self { edges }
    }

    pub fn from_edges(edges: Vec<f64>) -> Result<Self, String> {
        if edges.len() < 2 {
            return Err("an axis needs at least two edges".to_owned());
        }
        if edges.windows(2).any(|w| !(w[0] < w[1])) {
            return Err("axis edges must be strictly increasing".to_owned());
        }
        Ok(Self { edges })
    }

    pub fn bins(&self) -> usize {
        self.edges.len() - 1
    }

    pub fn min(&self) -> f64 {
        self.edges[0]
    }

    pub fn max(&self) -> f64 {
        self.edges[self.edges.len() - 1]
    }

    pub fn edges(&self) -> &[f64] {
        &self.edges
    }

    pub fn bin_low_edge(&self, bin: usize) -> f64 {
        self.edges[bin]
    }

    pub fn bin_up_edge(&self, bin: usize) -> f64 {
        self.edges[bin + 1]
    }

    pub fn bin_center(&self, bin: usize) -> f64 {
        0.5 * (self.edges[bin] + self.edges[bin + 1])
    }

    pub fn bin_width(&self, bin: usize) -> f64 {
        self.edges[bin + 1] - self.edges[bin]
    }

    pub fn bin_centers(&self) -> Vec<f64> {
        (0..self.bins()).map(|bin| self.bin_center(bin)).collect()
    }

    // Get the bin index for a given x position.
    pub fn find_bin(&self, x: f64) -> Option<usize> {
        if !(x >= self.min() && x <= self.max()) {
            return None;
        }
        if x == self.max() {
            return Some(self.bins() - 1);
        }
        Some(self.edges.partition_point(|&edge| edge <= x) - 1)
    }

    /// Like `find_bin` but clamps values outside the axis to the first or last bin.
    pub fn find_bin_clamped(&self, x: f64) -> usize {
        if x < self.min() {
            0
        } else {
            self.find_bin(x).unwrap_or(self.bins() - 1)
        }
    }

    /// Converts a physical range into the inclusive bin range enclosing it.
    ///
    /// The limits are nudged inwards by 1e-6 so that a range aligned with bin
    /// edges does not pick up the neighbouring bins. Returns `None` when the
    /// range does not overlap the axis.
    pub fn bin_range(&self, min: f64, max: f64) -> Option<(usize, usize)> {
        let (low, high) = (min + 1e-6, max - 1e-6);
        if high < self.min() || low > self.max() || low > high {
            return None;
        }
        Some((self.find_bin_clamped(low), self.find_bin_clamped(high)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_bin_uniform() {
        let axis = Axis::uniform(10, -1.0, 1.0);
        assert_eq!(axis.find_bin(-1.0), Some(0));
        assert_eq!(axis.find_bin(-0.8), Some(1));
        assert_eq!(axis.find_bin(0.05), Some(5));
        assert_eq!(axis.find_bin(1.0), Some(9));
        assert_eq!(axis.find_bin(1.01), None);
        assert_eq!(axis.find_bin(f64::NAN), None);
    }

    #[test]
    fn test_bin_range_is_enclosing_and_inclusive() {
        let axis = Axis::from_edges(vec![0.0, 0.5, 1.0, 2.0, 4.0]).unwrap();
        assert_eq!(axis.bin_range(0.5, 2.0), Some((1, 2)));
        assert_eq!(axis.bin_range(0.7, 3.0), Some((1, 3)));
        assert_eq!(axis.bin_range(-5.0, 0.2), Some((0, 0)));
        assert_eq!(axis.bin_range(5.0, 6.0), None);
    }

    #[test]
    fn test_axis_spec_parsing() {
        let axis: Axis = serde_json::from_str(r#"{"bins": 4, "min": 0.0, "max": 2.0}"#).unwrap();
        assert_eq!(axis.bins(), 4);
        assert!((axis.bin_center(3) - 1.75).abs() < 1e-12);

        let axis: Axis = serde_json::from_str(r#"{"edges": [0.0, 1.0, 3.0]}"#).unwrap();
        assert!((axis.bin_width(1) - 2.0).abs() < 1e-12);

        assert!(serde_json::from_str::<Axis>(r#"{"edges": [0.0, 0.0]}"#).is_err());
        assert!(serde_json::from_str::<Axis>(r#"{"bins": 0, "min": 0.0, "max": 1.0}"#).is_err());
    }
}
