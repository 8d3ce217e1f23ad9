//! Contrast-limited adaptive histogram equalization on luma, followed by a
//! light denoise and an unsharp mask.

use image::{Rgb, RgbImage};
use ndarray::Array2;

use crate::config::PreprocessConfig;
use crate::imaging::gaussian_blur;

const BINS: usize = 256;

pub fn enhance(image: &RgbImage, config: &PreprocessConfig) -> RgbImage {
    let [y, cb, cr] = to_ycbcr(image);
    let y = clahe(&y, config.clahe.clip_limit, config.clahe.tile_grid);
    let [r, g, b] = from_ycbcr(&y, &cb, &cr);

    let sharpen = |plane: Array2<f32>| {
        let denoised = gaussian_blur(&plane, config.blur_sigma);
        unsharp_mask(&denoised, config.blur_sigma, config.unsharp_gain)
    };
    merge_rgb(&sharpen(r), &sharpen(g), &sharpen(b))
}

/// `(1 + gain) * plane - gain * blur(plane)`.
pub fn unsharp_mask(plane: &Array2<f32>, sigma: f32, gain: f32) -> Array2<f32> {
    let blurred = gaussian_blur(plane, sigma);
    plane * (1.0 + gain) - &blurred * gain
}

/// CLAHE over a 0..255 plane.
///
/// The plane is split into a `grid x grid` array of tiles (fewer when the
/// image is smaller than the grid). Each tile's histogram is clipped at
/// `clip_limit * area / 256`, the excess is spread over all bins, and the
/// per-tile lookup tables are blended bilinearly between tile centers.
pub fn clahe(plane: &Array2<f32>, clip_limit: f32, grid: usize) -> Array2<f32> {
    let (h, w) = plane.dim();
    if h == 0 || w == 0 {
        return plane.clone();
    }
    let tiles_y = grid.clamp(1, h);
    let tiles_x = grid.clamp(1, w);
    let bounds = |n: usize, tiles: usize| -> Vec<usize> { (0..=tiles).map(|i| i * n / tiles).collect() };
    let ys = bounds(h, tiles_y);
    let xs = bounds(w, tiles_x);
    let bin = |v: f32| v.round().clamp(0.0, 255.0) as usize;

    let mut luts = vec![[0f32; BINS]; tiles_y * tiles_x];
    for ty in 0..tiles_y {
        for tx in 0..tiles_x {
            let mut hist = [0usize; BINS];
            for y in ys[ty]..ys[ty + 1] {
                for x in xs[tx]..xs[tx + 1] {
                    hist[bin(plane[[y, x]])] += 1;
                }
            }
            let area = (ys[ty + 1] - ys[ty]) * (xs[tx + 1] - xs[tx]);
            luts[ty * tiles_x + tx] = tile_lut(&mut hist, area, clip_limit);
        }
    }

    let tile_h = h as f32 / tiles_y as f32;
    let tile_w = w as f32 / tiles_x as f32;
    Array2::from_shape_fn((h, w), |(y, x)| {
        let (ty0, ty1, wy) = neighbours(y, tile_h, tiles_y);
        let (tx0, tx1, wx) = neighbours(x, tile_w, tiles_x);
        let v = bin(plane[[y, x]]);
        let top = luts[ty0 * tiles_x + tx0][v] * (1.0 - wx) + luts[ty0 * tiles_x + tx1][v] * wx;
        let bottom = luts[ty1 * tiles_x + tx0][v] * (1.0 - wx) + luts[ty1 * tiles_x + tx1][v] * wx;
        top * (1.0 - wy) + bottom * wy
    })
}

fn tile_lut(hist: &mut [usize; BINS], area: usize, clip_limit: f32) -> [f32; BINS] {
    let mut lut = [0f32; BINS];
    if area == 0 {
        for (v, out) in lut.iter_mut().enumerate() {
            *out = v as f32;
        }
        return lut;
    }
    let clip = ((clip_limit * area as f32 / BINS as f32) as usize).max(1);
    let mut excess = 0usize;
    for count in hist.iter_mut() {
        if *count > clip {
            excess += *count - clip;
            *count = clip;
        }
    }
    let per_bin = excess / BINS;
    let mut residual = excess % BINS;
    for count in hist.iter_mut() {
        *count += per_bin;
    }
    if residual > 0 {
        let step = (BINS / residual).max(1);
        let mut i = 0;
        while i < BINS && residual > 0 {
            hist[i] += 1;
            residual -= 1;
            i += step;
        }
    }

    let scale = 255.0 / area as f32;
    let mut cumulative = 0usize;
    for (v, out) in lut.iter_mut().enumerate() {
        cumulative += hist[v];
        *out = (cumulative as f32 * scale).min(255.0);
    }
    lut
}

/// The two tile indices whose centers bracket `pos`, and the weight of the
/// second one.
fn neighbours(pos: usize, tile: f32, tiles: usize) -> (usize, usize, f32) {
    let f = (pos as f32 + 0.5) / tile - 0.5;
    if f <= 0.0 {
        return (0, 0, 0.0);
    }
    let t0 = (f.floor() as usize).min(tiles - 1);
    let t1 = (t0 + 1).min(tiles - 1);
    let weight = if t1 == t0 { 0.0 } else { f - t0 as f32 };
    (t0, t1, weight)
}

/// Full-range (JFIF) YCbCr planes.
fn to_ycbcr(image: &RgbImage) -> [Array2<f32>; 3] {
    let (w, h) = image.dimensions();
    let shape = (h as usize, w as usize);
    let mut y_plane = Array2::<f32>::zeros(shape);
    let mut cb_plane = Array2::<f32>::zeros(shape);
    let mut cr_plane = Array2::<f32>::zeros(shape);
    for (x, y, p) in image.enumerate_pixels() {
        let (r, g, b) = (p[0] as f32, p[1] as f32, p[2] as f32);
        let idx = [y as usize, x as usize];
        y_plane[idx] = 0.299 * r + 0.587 * g + 0.114 * b;
        cb_plane[idx] = 128.0 - 0.168_736 * r - 0.331_264 * g + 0.5 * b;
        cr_plane[idx] = 128.0 + 0.5 * r - 0.418_688 * g - 0.081_312 * b;
    }
    [y_plane, cb_plane, cr_plane]
}

fn from_ycbcr(y: &Array2<f32>, cb: &Array2<f32>, cr: &Array2<f32>) -> [Array2<f32>; 3] {
    let r = ndarray::Zip::from(y).and(cr).map_collect(|&y, &cr| y + 1.402 * (cr - 128.0));
    let g = ndarray::Zip::from(y)
        .and(cb)
        .and(cr)
        .map_collect(|&y, &cb, &cr| y - 0.344_136 * (cb - 128.0) - 0.714_136 * (cr - 128.0));
    let b = ndarray::Zip::from(y).and(cb).map_collect(|&y, &cb| y + 1.772 * (cb - 128.0));
    [r, g, b]
}

fn merge_rgb(r: &Array2<f32>, g: &Array2<f32>, b: &Array2<f32>) -> RgbImage {
    let (h, w) = r.dim();
    let px = |v: f32| v.round().clamp(0.0, 255.0) as u8;
    RgbImage::from_fn(w as u32, h as u32, |x, y| {
        let idx = [y as usize, x as usize];
        Rgb([px(r[idx]), px(g[idx]), px(b[idx])])
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::mean_std;

    #[test]
    fn clahe_keeps_uniform_planes_uniform() {
        let plane = Array2::from_elem((64, 64), 128.0f32);
        let out = clahe(&plane, 2.0, 8);
        let first = out[[0, 0]];
        assert!(out.iter().all(|&v| (v - first).abs() < 1e-3));
        assert!((0.0..=255.0).contains(&first));
    }

    #[test]
    fn clahe_widens_a_narrow_histogram() {
        let plane = Array2::from_shape_fn((128, 128), |(y, x)| 100.0 + ((x + y) % 40) as f32);
        let (_, before) = mean_std(&plane);
        let (_, after) = mean_std(&clahe(&plane, 2.0, 8));
        assert!(after > before * 1.5, "std {before} -> {after}");
    }

    #[test]
    fn clahe_survives_images_smaller_than_the_grid() {
        let plane = Array2::from_elem((3, 5), 0.0f32);
        let out = clahe(&plane, 2.0, 8);
        assert_eq!(out.dim(), (3, 5));
        assert!(out.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn ycbcr_round_trips() {
        let img = RgbImage::from_fn(16, 16, |x, y| Rgb([(x * 16) as u8, (y * 16) as u8, 77]));
        let [y, cb, cr] = to_ycbcr(&img);
        let [r, g, b] = from_ycbcr(&y, &cb, &cr);
        let back = merge_rgb(&r, &g, &b);
        for (a, b) in img.pixels().zip(back.pixels()) {
            for c in 0..3 {
                assert!((a[c] as i32 - b[c] as i32).abs() <= 1);
            }
        }
    }

    #[test]
    fn unsharp_mask_amplifies_edges_only() {
        let step = Array2::from_shape_fn((16, 16), |(_, x)| if x < 8 { 50.0 } else { 200.0 });
        let out = unsharp_mask(&step, 1.1, 0.5);
        assert!((out[[8, 0]] - 50.0).abs() < 1e-2);
        assert!(out[[8, 7]] < 50.0);
        assert!(out[[8, 8]] > 200.0);
    }

    #[test]
    fn enhance_preserves_dimensions() {
        let img = RgbImage::from_fn(33, 17, |x, y| Rgb([(x * 7) as u8, (y * 9) as u8, 30]));
        let out = enhance(&img, &PreprocessConfig::default());
        assert_eq!(out.dimensions(), (33, 17));
    }
}
