use std::path::Path;

use image::{Rgb, RgbImage};
use rayon::prelude::*;

use super::colormaps::ColorScale;
use crate::error::CalibrationError;
use crate::histoer::histo1d::histogram1d::Histogram;
use crate::histoer::histo2d::histogram2d::Histogram2D;

pub const BLACK: Rgb<u8> = Rgb([0, 0, 0]);
pub const BLUE: Rgb<u8> = Rgb([31, 119, 180]);
pub const RED: Rgb<u8> = Rgb([214, 39, 40]);
pub const GREY: Rgb<u8> = Rgb([160, 160, 160]);
const WHITE: Rgb<u8> = Rgb([255, 255, 255]);

const MARGIN: u32 = 40;
const NUMBER_TICKS: u32 = 5;

/// A point with a vertical error bar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlotPoint {
    pub x: f64,
    pub y: f64,
    pub error: f64,
}

/// Data range covering `values`, padded by 5% on each side.
pub fn padded_range(values: impl IntoIterator<Item = f64>) -> (f64, f64) {
    let (min, max) = values
        .into_iter()
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
    if min > max {
        return (0.0, 1.0);
    }
    let pad = if max > min { 0.05 * (max - min) } else { 0.5 * min.abs().max(1.0) };
    (min - pad, max + pad)
}

/// Diagnostic plot rendered straight into a PNG.
///
/// Data coordinates map linearly onto the area inside a fixed margin; anything
/// drawn outside that area is clipped.
pub struct PlotCanvas {
    image: RgbImage,
    x_range: (f64, f64),
    y_range: (f64, f64),
}

impl PlotCanvas {
    pub fn new(width: u32, height: u32, x_range: (f64, f64), y_range: (f64, f64)) -> Self {
        let width = width.max(2 * MARGIN + 10);
        let height = height.max(2 * MARGIN + 10);
        let mut canvas = Self {
            image: RgbImage::from_pixel(width, height, WHITE),
            x_range: ordered(x_range),
            y_range: ordered(y_range),
        };
        canvas.draw_frame();
        canvas
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    fn plot_area(&self) -> (i64, i64, i64, i64) {
        (
            i64::from(MARGIN),
            i64::from(MARGIN),
            i64::from(self.width() - MARGIN),
            i64::from(self.height() - MARGIN),
        )
    }

    /// Pixel position of a data point; y grows upwards.
    pub fn to_pixel(&self, x: f64, y: f64) -> Option<(i64, i64)> {
        if !x.is_finite() || !y.is_finite() {
            return None;
        }
        let (left, top, right, bottom) = self.plot_area();
        let fx = (x - self.x_range.0) / (self.x_range.1 - self.x_range.0);
        let fy = (y - self.y_range.0) / (self.y_range.1 - self.y_range.0);
        let px = left as f64 + fx * (right - left) as f64;
        let py = bottom as f64 - fy * (bottom - top) as f64;
        // far off-canvas values would overflow the line walk
        if px.abs() > 1e6 || py.abs() > 1e6 {
            return None;
        }
        Some((px.round() as i64, py.round() as i64))
    }

    fn put(&mut self, x: i64, y: i64, color: Rgb<u8>, clip: bool) {
        let (left, top, right, bottom) = self.plot_area();
        if clip && (x < left || x > right || y < top || y > bottom) {
            return;
        }
        if x >= 0 && y >= 0 && x < i64::from(self.width()) && y < i64::from(self.height()) {
            self.image.put_pixel(x as u32, y as u32, color);
        }
    }

    /// Bresenham line between two pixel positions.
    fn line(&mut self, from: (i64, i64), to: (i64, i64), color: Rgb<u8>, clip: bool) {
        let (mut x0, mut y0) = from;
        let (x1, y1) = to;
        let dx = (x1 - x0).abs();
        let dy = -(y1 - y0).abs();
        let sx = if x0 < x1 { 1 } else { -1 };
        let sy = if y0 < y1 { 1 } else { -1 };
        let mut err = dx + dy;

        loop {
            self.put(x0, y0, color, clip);
            if x0 == x1 && y0 == y1 {
                break;
            }
            let e2 = 2 * err;
            if e2 >= dy {
                err += dy;
                x0 += sx;
            }
            if e2 <= dx {
                err += dx;
                y0 += sy;
            }
        }
    }

    fn draw_frame(&mut self) {
        let (left, top, right, bottom) = self.plot_area();
        self.line((left, top), (right, top), BLACK, false);
        self.line((right, top), (right, bottom), BLACK, false);
        self.line((right, bottom), (left, bottom), BLACK, false);
        self.line((left, bottom), (left, top), BLACK, false);

        for i in 0..=NUMBER_TICKS {
            let fraction = f64::from(i) / f64::from(NUMBER_TICKS);
            let x = left + (fraction * (right - left) as f64).round() as i64;
            let y = bottom - (fraction * (bottom - top) as f64).round() as i64;
            self.line((x, bottom), (x, bottom + 5), BLACK, false);
            self.line((left - 5, y), (left, y), BLACK, false);
        }
    }

    /// Dashed horizontal reference line at `y`.
    pub fn draw_reference(&mut self, y: f64) {
        let Some((_, py)) = self.to_pixel(self.x_range.0, y) else {
            return;
        };
        let (left, _, right, _) = self.plot_area();
        for x in (left..=right).step_by(6) {
            self.line((x, py), ((x + 2).min(right), py), GREY, true);
        }
    }

    pub fn draw_points(&mut self, points: &[PlotPoint], color: Rgb<u8>) {
        for point in points {
            let Some((px, py)) = self.to_pixel(point.x, point.y) else {
                continue;
            };
            if point.error.is_finite() && point.error > 0.0 {
                if let (Some(high), Some(low)) = (
                    self.to_pixel(point.x, point.y + point.error),
                    self.to_pixel(point.x, point.y - point.error),
                ) {
                    self.line(low, high, color, true);
                    self.line((px - 2, high.1), (px + 2, high.1), color, true);
                    self.line((px - 2, low.1), (px + 2, low.1), color, true);
                }
            }
            for dx in -2..=2 {
                for dy in -2..=2 {
                    self.put(px + dx, py + dy, color, true);
                }
            }
        }
    }

    pub fn draw_curve(&mut self, curve: &[[f64; 2]], color: Rgb<u8>) {
        let pixels: Vec<(i64, i64)> = curve
            .iter()
            .filter_map(|point| self.to_pixel(point[0], point[1]))
            .collect();
        for pair in pixels.windows(2) {
            self.line(pair[0], pair[1], color, true);
        }
    }

    /// Step outline of a 1D histogram.
    pub fn draw_histogram(&mut self, hist: &Histogram, color: Rgb<u8>) {
        let mut previous: Option<(i64, i64)> = None;
        for bin in 0..hist.bins() {
            let content = hist.content(bin);
            let (Some(low), Some(high)) = (
                self.to_pixel(hist.axis.bin_low_edge(bin), content),
                self.to_pixel(hist.axis.bin_up_edge(bin), content),
            ) else {
                previous = None;
                continue;
            };
            if let Some(previous) = previous {
                self.line(previous, low, color, true);
            }
            self.line(low, high, color, true);
            previous = Some(high);
        }
    }

    /// Fills the plot area with the bin contents of `hist`, colored by `scale`.
    /// Bins the scale leaves blank stay white.
    pub fn draw_heatmap(&mut self, hist: &Histogram2D, scale: &ColorScale) {
        let (left, top, right, bottom) = self.plot_area();
        let width = self.width() as usize;
        let (x_range, y_range) = (self.x_range, self.y_range);

        let to_data = |px: i64, py: i64| {
            let fx = (px - left) as f64 / (right - left) as f64;
            let fy = (bottom - py) as f64 / (bottom - top) as f64;
            (
                x_range.0 + fx * (x_range.1 - x_range.0),
                y_range.0 + fy * (y_range.1 - y_range.0),
            )
        };

        self.image
            .par_chunks_mut(width * 3)
            .enumerate()
            .for_each(|(row, pixels)| {
                let py = row as i64;
                if py <= top || py >= bottom {
                    return;
                }
                for px in (left + 1)..right {
                    let (x, y) = to_data(px, py);
                    let (Some(x_bin), Some(y_bin)) = (hist.x.find_bin(x), hist.y.find_bin(y)) else {
                        continue;
                    };
                    if let Some(color) = scale.color(hist.content(x_bin, y_bin)) {
                        let offset = px as usize * 3;
                        pixels[offset..offset + 3].copy_from_slice(&color.0);
                    }
                }
            });
    }

    pub fn pixel(&self, x: u32, y: u32) -> Rgb<u8> {
        *self.image.get_pixel(x, y)
    }

    pub fn save(&self, path: &Path) -> Result<(), CalibrationError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.image.save(path)?;
        log::debug!("Saved plot {}", path.display());
        Ok(())
    }
}

fn ordered(range: (f64, f64)) -> (f64, f64) {
    let (a, b) = range;
    if !(a.is_finite() && b.is_finite()) {
        (0.0, 1.0)
    } else if a < b {
        (a, b)
    } else if a > b {
        (b, a)
    } else {
        (a - 0.5, a + 0.5)
    }
}
