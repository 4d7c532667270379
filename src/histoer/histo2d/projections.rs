use crate::histoer::histo1d::histogram1d::Histogram;

use super::histogram2d::Histogram2D;

impl Histogram2D {
    /// Distribution along y summed over the x bins `first..=last`.
    pub fn y_projection(&self, first: usize, last: usize) -> Histogram {
        let mut contents = vec![0.0; self.y.bins()];
        let mut sumw2 = vec![0.0; self.y.bins()];

        for (y_bin, (content, error)) in contents.iter_mut().zip(sumw2.iter_mut()).enumerate() {
            for x_bin in first..=last {
                *content += self.content(x_bin, y_bin);
                *error += self.error_squared(x_bin, y_bin);
            }
        }

        Histogram::with_contents(
            &format!("{}_py_{first}_{last}", self.name),
            self.y.clone(),
            contents,
            Some(sumw2),
        )
    }

    /// Distribution along x summed over the y bins `first..=last`.
    pub fn x_projection(&self, first: usize, last: usize) -> Histogram {
        let mut contents = vec![0.0; self.x.bins()];
        let mut sumw2 = vec![0.0; self.x.bins()];

        for y_bin in first..=last {
            for x_bin in 0..self.x.bins() {
                contents[x_bin] += self.content(x_bin, y_bin);
                sumw2[x_bin] += self.error_squared(x_bin, y_bin);
            }
        }

        Histogram::with_contents(
            &format!("{}_px_{first}_{last}", self.name),
            self.x.clone(),
            contents,
            Some(sumw2),
        )
    }
}

#[cfg(test)]
mod tests {
    use crate::histoer::axis::Axis;
    use crate::histoer::histo2d::histogram2d::Histogram2D;

    #[test]
    fn test_projections() {
        let mut hist = Histogram2D::new("h", Axis::uniform(3, 0.0, 3.0), Axis::uniform(2, 0.0, 2.0));
        hist.fill(0.5, 0.5, 1.0);
        hist.fill(1.5, 0.5, 2.0);
        hist.fill(2.5, 1.5, 4.0);

        let py = hist.y_projection(0, 1);
        assert_eq!(py.contents, vec![3.0, 0.0]);
        assert!((py.error(0) - 3.0_f64.sqrt()).abs() < 1e-12);

        let px = hist.x_projection(1, 1);
        assert_eq!(px.contents, vec![0.0, 0.0, 4.0]);
    }
}
