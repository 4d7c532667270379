use crate::histoer::axis::Axis;

/// Dense 2D histogram. Contents are stored row by row with the x index running fastest.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Histogram2D {
    pub name: String,
    pub x: Axis,
    pub y: Axis,
    pub contents: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sumw2: Option<Vec<f64>>,
}

impl Histogram2D {
    pub fn new(name: &str, x: Axis, y: Axis) -> Self {
        let size = x.bins() * y.bins();
        Self {
            name: name.to_owned(),
            x,
            y,
            contents: vec![0.0; size],
            sumw2: None,
        }
    }

    pub fn check_shape(&self) -> Result<(), String> {
        let size = self.x.bins() * self.y.bins();
        if self.contents.len() != size {
            return Err(format!(
                "{}: {} contents for {}x{} bins",
                self.name,
                self.contents.len(),
                self.x.bins(),
                self.y.bins()
            ));
        }
        if self.sumw2.as_ref().is_some_and(|sumw2| sumw2.len() != size) {
            return Err(format!("{}: error array does not match the bins", self.name));
        }
        Ok(())
    }

    #[inline]
    pub fn index(&self, x_bin: usize, y_bin: usize) -> usize {
        y_bin * self.x.bins() + x_bin
    }

    pub fn fill(&mut self, x: f64, y: f64, weight: f64) {
        if let (Some(x_bin), Some(y_bin)) = (self.x.find_bin(x), self.y.find_bin(y)) {
            let index = self.index(x_bin, y_bin);
            self.contents[index] += weight;
            if let Some(sumw2) = &mut self.sumw2 {
                sumw2[index] += weight * weight;
            }
        }
    }

    pub fn content(&self, x_bin: usize, y_bin: usize) -> f64 {
        self.contents[self.index(x_bin, y_bin)]
    }

    pub fn set_content(&mut self, x_bin: usize, y_bin: usize, value: f64) {
        let index = self.index(x_bin, y_bin);
        self.contents[index] = value;
    }

    pub fn error_squared(&self, x_bin: usize, y_bin: usize) -> f64 {
        let index = self.index(x_bin, y_bin);
        match &self.sumw2 {
            Some(sumw2) => sumw2[index],
            None => self.contents[index].abs(),
        }
    }

    pub fn integral(&self) -> f64 {
        self.contents.iter().sum()
    }

    // Integral over an inclusive rectangle of bins
    pub fn integral_between(&self, x_bins: (usize, usize), y_bins: (usize, usize)) -> f64 {
        let mut sum = 0.0;
        for y_bin in y_bins.0..=y_bins.1 {
            for x_bin in x_bins.0..=x_bins.1 {
                sum += self.content(x_bin, y_bin);
            }
        }
        sum
    }

    pub fn min_max(&self) -> (f64, f64) {
        self.contents
            .iter()
            .filter(|c| c.is_finite())
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(min, max), &c| {
                (min.min(c), max.max(c))
            })
    }
}
