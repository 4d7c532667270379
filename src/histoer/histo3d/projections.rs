use crate::histoer::histo1d::histogram1d::Histogram;
use crate::histoer::histo2d::histogram2d::Histogram2D;

use super::histogram3d::Histogram3D;

impl Histogram3D {
    /// Distribution along x summed over inclusive y and z bin ranges.
    pub fn x_projection(&self, y_bins: (usize, usize), z_bins: (usize, usize)) -> Histogram {
        let mut contents = vec![0.0; self.x.bins()];
        let mut sumw2 = vec![0.0; self.x.bins()];

        for z_bin in z_bins.0..=z_bins.1 {
            for y_bin in y_bins.0..=y_bins.1 {
                for x_bin in 0..self.x.bins() {
                    contents[x_bin] += self.content(x_bin, y_bin, z_bin);
                    sumw2[x_bin] += self.error_squared(x_bin, y_bin, z_bin);
                }
            }
        }

        Histogram::with_contents(
            &format!(
                "{}_px_y{}-{}_z{}-{}",
                self.name, y_bins.0, y_bins.1, z_bins.0, z_bins.1
            ),
            self.x.clone(),
            contents,
            Some(sumw2),
        )
    }

    /// The (x, y) plane of a single z bin.
    pub fn z_slice(&self, z_bin: usize) -> Histogram2D {
        let plane = self.x.bins() * self.y.bins();
        let start = z_bin * plane;

        let sumw2 = (start..start + plane)
            .map(|index| match &self.sumw2 {
                Some(sumw2) => sumw2[index],
                None => self.contents[index].abs(),
            })
            .collect();

        Histogram2D {
            name: format!("{}_z{z_bin}", self.name),
            x: self.x.clone(),
            y: self.y.clone(),
            contents: self.contents[start..start + plane].to_vec(),
            sumw2: Some(sumw2),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::histoer::axis::Axis;
    use crate::histoer::histo3d::histogram3d::Histogram3D;

    fn cube() -> Histogram3D {
        let mut hist = Histogram3D::new(
            "cube",
            Axis::uniform(4, -2.0, 2.0),
            Axis::uniform(2, 0.0, 2.0),
            Axis::uniform(2, 0.0, 100.0),
        );
        hist.fill(-1.5, 0.5, 10.0, 1.0);
        hist.fill(0.5, 0.5, 60.0, 2.0);
        hist.fill(0.5, 1.5, 60.0, 3.0);
        hist
    }

    #[test]
    fn test_x_projection_respects_ranges() {
        let hist = cube();
        assert_eq!(hist.x_projection((0, 1), (0, 1)).contents, vec![1.0, 0.0, 5.0, 0.0]);
        assert_eq!(hist.x_projection((0, 0), (1, 1)).contents, vec![0.0, 0.0, 2.0, 0.0]);
    }

    #[test]
    fn test_z_slice() {
        let hist = cube();
        let slice = hist.z_slice(1);
        assert_eq!(slice.content(2, 0), 2.0);
        assert_eq!(slice.content(2, 1), 3.0);
        assert!((slice.integral() - 5.0).abs() < 1e-12);
        assert!(slice.check_shape().is_ok());
    }
}
