//! Retinal disk localisation with a gradient Hough transform.

use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage};
use imageproc::edges::canny;
use imageproc::filter::gaussian_blur_f32;
use ndarray::{Array2, Array3};

use crate::config::RoiConfig;
use crate::imaging::{filter3x3, SOBEL_X, SOBEL_Y};

const WORKING_BLUR_SIGMA: f32 = 2.0;
const MIN_WORKING_SIDE: u32 = 16;

/// A detected circle in the coordinates of the image passed to `detect`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetinalDisk {
    pub center_x: f32,
    pub center_y: f32,
    pub radius: f32,
    /// Accumulator peak over circumference, in [0, 1].
    pub confidence: f32,
}

impl RetinalDisk {
    /// Bounding square of the disk grown by `padding_ratio * radius` on each
    /// side and clamped to a `width x height` frame, as `(x, y, w, h)`.
    pub fn crop_rect(&self, width: u32, height: u32, padding_ratio: f32) -> (u32, u32, u32, u32) {
        let half = self.radius * (1.0 + padding_ratio.max(0.0));
        let clamp_x = |v: f32| v.round().clamp(0.0, width as f32) as u32;
        let clamp_y = |v: f32| v.round().clamp(0.0, height as f32) as u32;
        let x0 = clamp_x(self.center_x - half);
        let x1 = clamp_x(self.center_x + half);
        let y0 = clamp_y(self.center_y - half);
        let y1 = clamp_y(self.center_y + half);
        if x1 <= x0 || y1 <= y0 {
            return (0, 0, width, height);
        }
        (x0, y0, x1 - x0, y1 - y0)
    }
}

pub struct DiskDetector {
    config: RoiConfig,
}

impl DiskDetector {
    pub fn new(config: RoiConfig) -> Self {
        Self { config }
    }

    /// Returns the strongest circle whose confidence reaches the configured
    /// minimum, or `None`.
    pub fn detect(&self, image: &RgbImage) -> Option<RetinalDisk> {
        let (width, height) = image.dimensions();
        let longest = width.max(height);
        if longest == 0 {
            return None;
        }
        let scale = (self.config.working_size as f32 / longest as f32).min(1.0);
        let work_w = ((width as f32 * scale).round() as u32).max(1);
        let work_h = ((height as f32 * scale).round() as u32).max(1);
        if work_w.min(work_h) < MIN_WORKING_SIDE {
            log::debug!("Image too small for disk search: {}x{}", width, height);
            return None;
        }

        // imageproc's canny asserts this ordering.
        let thresholds_ordered = self.config.canny_low <= self.config.canny_high;
        if !thresholds_ordered {
            log::warn!(
                "Canny thresholds inverted ({} > {}), skipping disk search",
                self.config.canny_low,
                self.config.canny_high
            );
            return None;
        }

        let gray = imageops::grayscale(image);
        let small = imageops::resize(&gray, work_w, work_h, FilterType::Triangle);
        let smooth = gaussian_blur_f32(&small, WORKING_BLUR_SIGMA);
        let edges = canny(&smooth, self.config.canny_low, self.config.canny_high);

        let short = work_w.min(work_h) as f32;
        let r_min = (self.config.min_radius_ratio * short).ceil() as usize;
        let r_max = (self.config.max_radius_ratio * short).floor() as usize;
        if r_min < 3 || r_max < r_min {
            return None;
        }

        let best = hough_peak(&smooth, &edges, r_min, r_max)?;
        if best.confidence < self.config.min_confidence {
            log::warn!(
                "Retinal disk not found (best confidence {:.2} < {:.2}), using full frame",
                best.confidence,
                self.config.min_confidence
            );
            return None;
        }
        Some(RetinalDisk {
            center_x: best.center_x / scale,
            center_y: best.center_y / scale,
            radius: best.radius / scale,
            confidence: best.confidence,
        })
    }
}

/// Every edge pixel votes along its gradient direction, both ways, at each
/// candidate radius. The peak's 3x3 neighbourhood sum is divided by the
/// circumference of its radius.
fn hough_peak(smooth: &GrayImage, edges: &GrayImage, r_min: usize, r_max: usize) -> Option<RetinalDisk> {
    let (w, h) = (edges.width() as usize, edges.height() as usize);
    let plane = Array2::from_shape_fn((h, w), |(y, x)| smooth.get_pixel(x as u32, y as u32)[0] as f32);
    let gx = filter3x3(&plane, &SOBEL_X);
    let gy = filter3x3(&plane, &SOBEL_Y);

    let radii = r_max - r_min + 1;
    let mut acc = Array3::<u32>::zeros((radii, h, w));
    let mut edge_count = 0usize;
    for (x, y, p) in edges.enumerate_pixels() {
        if p[0] == 0 {
            continue;
        }
        let (dx, dy) = (gx[[y as usize, x as usize]], gy[[y as usize, x as usize]]);
        let magnitude = (dx * dx + dy * dy).sqrt();
        if magnitude < 1e-3 {
            continue;
        }
        edge_count += 1;
        let (ux, uy) = (dx / magnitude, dy / magnitude);
        for (ri, r) in (r_min..=r_max).enumerate() {
            for sign in [-1.0f32, 1.0] {
                let cx = (x as f32 + sign * r as f32 * ux).round();
                let cy = (y as f32 + sign * r as f32 * uy).round();
                if cx >= 0.0 && cy >= 0.0 && (cx as usize) < w && (cy as usize) < h {
                    acc[[ri, cy as usize, cx as usize]] += 1;
                }
            }
        }
    }
    if edge_count == 0 {
        return None;
    }

    let mut best: Option<RetinalDisk> = None;
    for ri in 0..radii {
        let r = (r_min + ri) as f32;
        let circumference = 2.0 * std::f32::consts::PI * r;
        for y in 0..h {
            for x in 0..w {
                if acc[[ri, y, x]] == 0 {
                    continue;
                }
                let mut votes = 0u32;
                for ny in y.saturating_sub(1)..(y + 2).min(h) {
                    for nx in x.saturating_sub(1)..(x + 2).min(w) {
                        votes += acc[[ri, ny, nx]];
                    }
                }
                let confidence = (votes as f32 / circumference).min(1.0);
                if best.is_none_or(|b| confidence > b.confidence) {
                    best = Some(RetinalDisk {
                        center_x: x as f32,
                        center_y: y as f32,
                        radius: r,
                        confidence,
                    });
                }
            }
        }
    }
    best
}
