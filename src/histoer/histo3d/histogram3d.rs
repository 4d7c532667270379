use crate::histoer::axis::Axis;

/// Dense 3D histogram. The x index runs fastest, then y, then z.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Histogram3D {
    pub name: String,
    pub x: Axis,
    pub y: Axis,
    pub z: Axis,
    pub contents: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sumw2: Option<Vec<f64>>,
}

impl Histogram3D {
    pub fn new(name: &str, x: Axis, y: Axis, z: Axis) -> Self {
        let size = x.bins() * y.bins() * z.bins();
        Self {
            name: name.to_owned(),
            x,
            y,
            z,
            contents: vec![0.0; size],
            sumw2: None,
        }
    }

    pub fn check_shape(&self) -> Result<(), String> {
        let size = self.x.bins() * self.y.bins() * self.z.bins();
        if self.contents.len() != size {
            return Err(format!(
                "{}: {} contents for {}x{}x{} bins",
                self.name,
                self.contents.len(),
                self.x.bins(),
                self.y.bins(),
                self.z.bins()
            ));
        }
        if self.sumw2.as_ref().is_some_and(|sumw2| sumw2.len() != size) {
            return Err(format!("{}: error array does not match the bins", self.name));
        }
        Ok(())
    }

    #[inline]
    pub fn index(&self, x_bin: usize, y_bin: usize, z_bin: usize) -> usize {
        (z_bin * self.y.bins() + y_bin) * self.x.bins() + x_bin
    }

    pub fn fill(&mut self, x: f64, y: f64, z: f64, weight: f64) {
        if let (Some(x_bin), Some(y_bin), Some(z_bin)) =
            (self.x.find_bin(x), self.y.find_bin(y), self.z.find_bin(z))
        {
            let index = self.index(x_bin, y_bin, z_bin);
            self.contents[index] += weight;
            if let Some(sumw2) = &mut self.sumw2 {
                sumw2[index] += weight * weight;
            }
        }
    }

    pub fn content(&self, x_bin: usize, y_bin: usize, z_bin: usize) -> f64 {
        self.contents[self.index(x_bin, y_bin, z_bin)]
    }

    pub fn error_squared(&self, x_bin: usize, y_bin: usize, z_bin: usize) -> f64 {
        let index = self.index(x_bin, y_bin, z_bin);
        match &self.sumw2 {
            Some(sumw2) => sumw2[index],
            None => self.contents[index].abs(),
        }
    }

    pub fn integral(&self) -> f64 {
        self.contents.iter().sum()
    }
}
