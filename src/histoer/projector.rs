use std::fmt::Display;

use super::histo1d::histogram1d::Histogram;
use super::histo2d::histogram2d::Histogram2D;
use super::histo3d::histogram3d::Histogram3D;

/// Bins holding less than this are treated as empty when trimming a projection.
const POPULATED_BIN_THRESHOLD: f64 = 1e-7;

/// Why a projection was not handed to the fitter. These are recoverable: the
/// caller logs them and moves on to the next bin.
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    InsufficientStatistics { integral: f64, threshold: f64 },
    Malformed { min_x: f64, max_x: f64 },
    OutsideAxis { min: f64, max: f64 },
}

impl Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::InsufficientStatistics { integral, threshold } => {
                write!(f, "integral {integral} is below the threshold {threshold}")
            }
            Rejection::Malformed { min_x, max_x } => {
                write!(f, "populated range is malformed (min {min_x} > max {max_x})")
            }
            Rejection::OutsideAxis { min, max } => {
                write!(f, "range {min}..{max} does not overlap the histogram axis")
            }
        }
    }
}

/// A 1D slice that passed the statistics gate.
#[derive(Debug, Clone)]
pub struct Projection {
    pub histogram: Histogram,
    pub integral: f64,
    /// Low edge of the first populated bin.
    pub min_x: f64,
    /// Up edge of the last populated bin.
    pub max_x: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BinProjector {
    pub min_integral: f64,
}

impl BinProjector {
    pub fn new(min_integral: f64) -> Self {
        Self { min_integral }
    }

    // The threshold is inclusive: an integral exactly at the minimum passes
    pub fn accepts(&self, integral: f64) -> bool {
        integral >= self.min_integral
    }

    /// Projects a 3D histogram onto x for physical ranges on y and z.
    pub fn project_x(
        &self,
        hist: &Histogram3D,
        y_range: (f64, f64),
        z_range: (f64, f64),
    ) -> Result<Projection, Rejection> {
        let y_bins = hist.y.bin_range(y_range.0, y_range.1).ok_or(Rejection::OutsideAxis {
            min: y_range.0,
            max: y_range.1,
        })?;
        let z_bins = hist.z.bin_range(z_range.0, z_range.1).ok_or(Rejection::OutsideAxis {
            min: z_range.0,
            max: z_range.1,
        })?;

        self.check(hist.x_projection(y_bins, z_bins))
    }

    /// Applies the statistics gate and finds the populated edges of a slice.
    pub fn check(&self, histogram: Histogram) -> Result<Projection, Rejection> {
        let integral = histogram.integral();
        if !self.accepts(integral) {
            return Err(Rejection::InsufficientStatistics {
                integral,
                threshold: self.min_integral,
            });
        }

        let first = histogram.first_populated_bin(POPULATED_BIN_THRESHOLD);
        let last = histogram.last_populated_bin(POPULATED_BIN_THRESHOLD);
        let (min_x, max_x) = match (first, last) {
            (Some(first), Some(last)) => (
                histogram.axis.bin_low_edge(first),
                histogram.axis.bin_up_edge(last),
            ),
            _ => (0.0, -1.0),
        };
        if min_x > max_x {
            return Err(Rejection::Malformed { min_x, max_x });
        }

        Ok(Projection {
            histogram,
            integral,
            min_x,
            max_x,
        })
    }

    /// Greedy left-to-right merge of the x bins of `hist` within `x_range`.
    ///
    /// Bins are accumulated until the integral inside `y_window` reaches the
    /// threshold, then the merged slice is emitted and the marker jumps past it.
    /// Trailing bins that never reach the threshold are dropped.
    pub fn merge_scan<'a>(
        &self,
        hist: &'a Histogram2D,
        x_range: (f64, f64),
        y_window: (f64, f64),
    ) -> MergeScan<'a> {
        let x_bins = hist.x.bin_range(x_range.0, x_range.1);
        let y_bins = (
            hist.y.find_bin_clamped(y_window.0),
            hist.y.find_bin_clamped(y_window.1),
        );
        let (marker, last) = match x_bins {
            Some((first, last)) => (first, Some(last)),
            None => (0, None),
        };
        MergeScan {
            hist,
            projector: *self,
            y_bins,
            marker,
            next_bin: marker,
            last,
        }
    }
}

/// One group of merged bins produced by [`MergeScan`].
#[derive(Debug, Clone)]
pub struct MergedSlice {
    pub first_bin: usize,
    pub last_bin: usize,
    /// Midpoint between the centers of the first and last merged bins.
    pub x: f64,
    pub integral: f64,
    pub projection: Histogram,
}

pub struct MergeScan<'a> {
    hist: &'a Histogram2D,
    projector: BinProjector,
    y_bins: (usize, usize),
    marker: usize,
    next_bin: usize,
    last: Option<usize>,
}

impl MergeScan<'_> {
    /// First bin of the group currently being accumulated.
    pub fn marker(&self) -> usize {
        self.marker
    }
}

impl Iterator for MergeScan<'_> {
    type Item = MergedSlice;

    fn next(&mut self) -> Option<Self::Item> {
        let last = self.last?;
        while self.next_bin <= last {
            let bin = self.next_bin;
            self.next_bin += 1;

            let integral = self
                .hist
                .integral_between((self.marker, bin), self.y_bins);
            if !self.projector.accepts(integral) {
                continue;
            }

            let first_bin = self.marker;
            self.marker = bin + 1;

            return Some(MergedSlice {
                first_bin,
                last_bin: bin,
                x: 0.5 * (self.hist.x.bin_center(first_bin) + self.hist.x.bin_center(bin)),
                integral,
                projection: self.hist.y_projection(first_bin, bin),
            });
        }
        None
    }
}
