use super::histogram1d::Histogram;

impl Histogram {
    // Calculate the integral, mean and standard deviation between two bins (inclusive).
    pub fn get_statistics(&self, start_bin: usize, end_bin: usize) -> (f64, f64, f64) {
        let end_bin = end_bin.min(self.bins().saturating_sub(1));

        let mut sum_product = 0.0;
        let mut total_count = 0.0;

        for bin in start_bin..=end_bin {
            let bin_center = self.axis.bin_center(bin);
            sum_product += self.contents[bin] * bin_center;
            total_count += self.contents[bin];
        }

        if total_count <= 0.0 {
            (0.0, 0.0, 0.0)
        } else {
            let mean = sum_product / total_count;

            let mut sum_squared_diff = 0.0;

            for bin in start_bin..=end_bin {
                let diff = self.axis.bin_center(bin) - mean;
                sum_squared_diff += self.contents[bin] * diff * diff;
            }

            let stdev = (sum_squared_diff / total_count).sqrt();

            (total_count, mean, stdev)
        }
    }

    pub fn mean(&self) -> f64 {
        self.get_statistics(0, self.bins() - 1).1
    }

    // Error on the mean, stdev / sqrt(N) with N the integral
    pub fn mean_error(&self) -> f64 {
        let (integral, _, stdev) = self.get_statistics(0, self.bins() - 1);
        if integral > 0.0 {
            stdev / integral.sqrt()
        } else {
            0.0
        }
    }
}
