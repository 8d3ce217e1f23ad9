//! Small numeric helpers over single-channel `f32` planes.
//!
//! A plane is an `Array2<f32>` indexed `[y, x]`. Every filter here replicates
//! the border pixels, so a constant plane stays constant after filtering.

use image::imageops::{self, FilterType};
use image::{ImageBuffer, Luma, RgbImage};
use imageproc::filter;
use ndarray::{Array2, Zip};

type GrayF32 = ImageBuffer<Luma<f32>, Vec<f32>>;

pub const SOBEL_X: [f32; 9] = [-1.0, 0.0, 1.0, -2.0, 0.0, 2.0, -1.0, 0.0, 1.0];
pub const SOBEL_Y: [f32; 9] = [-1.0, -2.0, -1.0, 0.0, 0.0, 0.0, 1.0, 2.0, 1.0];
pub const LAPLACIAN: [f32; 9] = [0.0, 1.0, 0.0, 1.0, -4.0, 1.0, 0.0, 1.0, 0.0];

const EPS: f32 = 1e-12;

/// ITU-R BT.601 luma on the 0..255 scale.
pub fn luma_plane(image: &RgbImage) -> Array2<f32> {
    let (w, h) = image.dimensions();
    Array2::from_shape_fn((h as usize, w as usize), |(y, x)| {
        let p = image.get_pixel(x as u32, y as u32);
        0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32
    })
}

/// 3x3 correlation via imageproc; borders pad by continuity.
pub fn filter3x3(plane: &Array2<f32>, kernel: &[f32; 9]) -> Array2<f32> {
    if plane.is_empty() {
        return plane.clone();
    }
    let filtered: GrayF32 = filter::filter3x3(&to_gray(plane), kernel);
    from_gray(&filtered)
}

/// Gaussian blur. `sigma <= 0` returns the input unchanged.
pub fn gaussian_blur(plane: &Array2<f32>, sigma: f32) -> Array2<f32> {
    if sigma <= 0.0 || plane.is_empty() {
        return plane.clone();
    }
    from_gray(&filter::gaussian_blur_f32(&to_gray(plane), sigma))
}

/// Sobel gradient magnitude.
pub fn gradient_magnitude(plane: &Array2<f32>) -> Array2<f32> {
    let gx = filter3x3(plane, &SOBEL_X);
    let gy = filter3x3(plane, &SOBEL_Y);
    let mut magnitude = Array2::<f32>::zeros(plane.dim());
    Zip::from(&mut magnitude)
        .and(&gx)
        .and(&gy)
        .for_each(|m, &a, &b| *m = (a * a + b * b).sqrt());
    magnitude
}

fn to_gray(plane: &Array2<f32>) -> GrayF32 {
    let (h, w) = plane.dim();
    ImageBuffer::from_fn(w as u32, h as u32, |x, y| Luma([plane[[y as usize, x as usize]]]))
}

fn from_gray(image: &GrayF32) -> Array2<f32> {
    Array2::from_shape_fn((image.height() as usize, image.width() as usize), |(y, x)| {
        image.get_pixel(x as u32, y as u32)[0]
    })
}

/// Bilinear resize (the `Triangle` filter is bilinear when upsampling).
///
/// `imageops::resize` clamps float pixels to [0, 1], so values are mapped
/// into that range for the resize and mapped back afterwards.
pub fn resize_plane(plane: &Array2<f32>, width: u32, height: u32) -> Array2<f32> {
    let (h, w) = plane.dim();
    if h == 0 || w == 0 || width == 0 || height == 0 {
        return Array2::zeros((height as usize, width as usize));
    }
    let (lo, hi) = plane
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let span = if hi - lo > EPS { hi - lo } else { 1.0 };
    let unit = to_gray(&plane.mapv(|v| (v - lo) / span));
    let resized = imageops::resize(&unit, width, height, FilterType::Triangle);
    from_gray(&resized).mapv(|v| v * span + lo)
}

/// Min-max normalization into [0, 1]. A flat plane maps to zeros.
pub fn normalize_unit(plane: &Array2<f32>) -> Array2<f32> {
    let (lo, hi) = plane
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    if !lo.is_finite() || !hi.is_finite() || hi - lo <= EPS {
        return Array2::zeros(plane.dim());
    }
    plane.mapv(|v| ((v - lo) / (hi - lo)).clamp(0.0, 1.0))
}

/// Mean and population standard deviation; (0, 0) for an empty plane.
pub fn mean_std(plane: &Array2<f32>) -> (f64, f64) {
    let n = plane.len();
    if n == 0 {
        return (0.0, 0.0);
    }
    let mean = plane.iter().map(|&v| v as f64).sum::<f64>() / n as f64;
    let var = plane
        .iter()
        .map(|&v| {
            let d = v as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n as f64;
    (mean, var.max(0.0).sqrt())
}

/// Nearest-rank percentile, `p` in [0, 1].
pub fn percentile(values: &[f32], p: f32) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let k = ((sorted.len() as f32 - 1.0) * p.clamp(0.0, 1.0)).round() as usize;
    sorted[k]
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn filters_keep_constant_planes_constant() {
        let plane = Array2::from_elem((9, 13), 77.0f32);
        let blurred = gaussian_blur(&plane, 1.1);
        assert!(blurred.iter().all(|&v| (v - 77.0).abs() < 1e-3));
        let lap = filter3x3(&plane, &LAPLACIAN);
        assert!(lap.iter().all(|&v| v.abs() < 1e-4));
        assert!(gradient_magnitude(&plane).iter().all(|&v| v.abs() < 1e-4));
    }

    #[test]
    fn sobel_responds_to_a_vertical_edge_only_across_it() {
        let step = Array2::from_shape_fn((6, 8), |(_, x)| if x < 4 { 0.0 } else { 10.0 });
        let g = gradient_magnitude(&step);
        assert!((g[[3, 3]] - 40.0).abs() < 1e-4);
        assert_eq!(g[[3, 0]], 0.0);
        assert_eq!(g[[3, 7]], 0.0);
        assert_eq!(filter3x3(&step, &SOBEL_Y)[[3, 3]], 0.0);
    }

    #[test]
    fn blur_spreads_an_impulse_symmetrically() {
        let mut impulse = Array2::<f32>::zeros((9, 9));
        impulse[[4, 4]] = 1.0;
        let b = gaussian_blur(&impulse, 1.0);
        assert!(b[[4, 4]] < 1.0);
        assert!((b[[4, 3]] - b[[4, 5]]).abs() < 1e-6);
        assert!((b[[3, 4]] - b[[5, 4]]).abs() < 1e-6);
        assert!((b.sum() - 1.0).abs() < 1e-4);
        assert_eq!(gaussian_blur(&impulse, 0.0), impulse);
    }

    #[test]
    fn normalize_guards_flat_input() {
        let flat = Array2::from_elem((4, 4), 3.0f32);
        assert!(normalize_unit(&flat).iter().all(|&v| v == 0.0));
        let ramp = Array2::from_shape_fn((2, 3), |(y, x)| (y * 3 + x) as f32);
        let n = normalize_unit(&ramp);
        assert_eq!(n[[0, 0]], 0.0);
        assert_eq!(n[[1, 2]], 1.0);
    }

    #[test]
    fn resize_changes_shape_and_preserves_range() {
        let plane = Array2::from_shape_fn((4, 4), |(y, x)| ((x + y) % 2) as f32);
        let up = resize_plane(&plane, 37, 21);
        assert_eq!(up.dim(), (21, 37));
        assert!(up.iter().all(|&v| (-1e-4..=1.0 + 1e-4).contains(&v)));

        let scaled = resize_plane(&plane.mapv(|v| v * 200.0 + 10.0), 8, 8);
        assert!(scaled.iter().all(|&v| (10.0 - 1e-2..=210.0 + 1e-2).contains(&v)));
        assert!(scaled.iter().any(|&v| v > 100.0));
    }

    #[test]
    fn luma_of_white_is_255() {
        let img = RgbImage::from_pixel(2, 2, Rgb([255, 255, 255]));
        assert!(luma_plane(&img).iter().all(|&v| (v - 255.0).abs() < 1e-3));
    }

    #[test]
    fn percentile_and_stats() {
        let values: Vec<f32> = (0..=100).map(|v| v as f32).collect();
        assert_eq!(percentile(&values, 0.9), 90.0);
        assert_eq!(percentile(&[], 0.5), 0.0);
        let (mean, std) = mean_std(&Array2::from_elem((3, 3), 5.0));
        assert_eq!(mean, 5.0);
        assert_eq!(std, 0.0);
    }
}
