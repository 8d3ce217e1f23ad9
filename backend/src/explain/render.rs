//! Composes the six-panel explanation figure and the native-size overlay.

use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, ImageFormat, Luma, Rgb, RgbImage};
use imageproc::contours::find_contours;
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_line_segment_mut};
use imageproc::rect::Rect;
use ndarray::Array2;
use shared::HeatmapStats;
use std::io::Cursor;

use super::ExplainError;
use crate::config::ExplainConfig;
use crate::imaging::{mean_std, percentile, resize_plane};

const GAP: u32 = 8;
const COLUMNS: u32 = 3;
const ROWS: u32 = 2;
const BACKGROUND: Rgb<u8> = Rgb([0, 0, 0]);
const CONTOUR: Rgb<u8> = Rgb([0, 255, 255]);
const CROSSHAIR: Rgb<u8> = Rgb([255, 255, 255]);
const TRACK: Rgb<u8> = Rgb([48, 48, 48]);

pub struct Rendered {
    pub figure_png: Vec<u8>,
    pub overlay_png: Vec<u8>,
}

pub fn jet(v: f32) -> Rgb<u8> {
    let v = v.clamp(0.0, 1.0);
    let channel = |offset: f32| ((1.5 - (4.0 * v - offset).abs()).clamp(0.0, 1.0) * 255.0).round() as u8;
    Rgb([channel(3.0), channel(2.0), channel(1.0)])
}

pub fn hot(v: f32) -> Rgb<u8> {
    let v = v.clamp(0.0, 1.0);
    let channel = |offset: f32| ((3.0 * v - offset).clamp(0.0, 1.0) * 255.0).round() as u8;
    Rgb([channel(0.0), channel(1.0), channel(2.0)])
}

pub fn compute_stats(map: &Array2<f32>, config: &ExplainConfig) -> HeatmapStats {
    let mut max_value = 0.0f32;
    let mut max_location = (0u32, 0u32);
    for ((y, x), &v) in map.indexed_iter() {
        if v > max_value {
            max_value = v;
            max_location = (x as u32, y as u32);
        }
    }
    let (mean, std_dev) = mean_std(map);
    let values: Vec<f32> = map.iter().copied().collect();
    let covered = values.iter().filter(|&&v| v >= config.coverage_threshold).count();
    HeatmapStats {
        max_value,
        max_location,
        mean: mean as f32,
        std_dev: std_dev as f32,
        contour_threshold: percentile(&values, config.contour_percentile),
        coverage_threshold: config.coverage_threshold,
        coverage_percent: 100.0 * covered as f32 / values.len().max(1) as f32,
    }
}

pub fn render(
    original: &RgbImage,
    map: &Array2<f32>,
    stats: &HeatmapStats,
    config: &ExplainConfig,
) -> Result<Rendered, ExplainError> {
    let (width, height) = original.dimensions();
    if map.dim() != (height as usize, width as usize) {
        return Err(ExplainError::Render(format!(
            "map is {:?}, image is {}x{}",
            map.dim(),
            width,
            height
        )));
    }
    let size = config.panel_size;
    let heatmap = colorize(map, jet);
    let overlay = blend(original, &heatmap, config.overlay_alpha);

    let panels = [
        fit_panel(original, size),
        fit_panel(&heatmap, size),
        fit_panel(&overlay, size),
        contour_panel(original, map, stats.contour_threshold, config),
        histogram_panel(map, config.histogram_bins, size),
        stats_panel(map, stats, size),
    ];

    let mut figure = RgbImage::from_pixel(
        COLUMNS * size + (COLUMNS + 1) * GAP,
        ROWS * size + (ROWS + 1) * GAP,
        BACKGROUND,
    );
    for (i, panel) in panels.iter().enumerate() {
        let (col, row) = (i as u32 % COLUMNS, i as u32 / COLUMNS);
        let x = GAP + col * (size + GAP);
        let y = GAP + row * (size + GAP);
        imageops::overlay(&mut figure, panel, x as i64, y as i64);
    }

    Ok(Rendered {
        figure_png: encode_png(figure)?,
        overlay_png: encode_png(overlay)?,
    })
}

fn encode_png(image: RgbImage) -> Result<Vec<u8>, ExplainError> {
    let mut buffer = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image)
        .write_to(&mut buffer, ImageFormat::Png)
        .map_err(|e| ExplainError::Render(e.to_string()))?;
    Ok(buffer.into_inner())
}

fn colorize(map: &Array2<f32>, palette: fn(f32) -> Rgb<u8>) -> RgbImage {
    let (h, w) = map.dim();
    RgbImage::from_fn(w as u32, h as u32, |x, y| palette(map[[y as usize, x as usize]]))
}

fn blend(base: &RgbImage, top: &RgbImage, alpha: f32) -> RgbImage {
    RgbImage::from_fn(base.width(), base.height(), |x, y| {
        let (b, t) = (base.get_pixel(x, y), top.get_pixel(x, y));
        let mix = |c: usize| ((1.0 - alpha) * b[c] as f32 + alpha * t[c] as f32).round() as u8;
        Rgb([mix(0), mix(1), mix(2)])
    })
}

/// Largest size with the image's aspect ratio that fits a `size` square.
fn fit_dims(width: u32, height: u32, size: u32) -> (u32, u32) {
    let scale = (size as f32 / width.max(1) as f32).min(size as f32 / height.max(1) as f32);
    (
        ((width as f32 * scale).round() as u32).clamp(1, size),
        ((height as f32 * scale).round() as u32).clamp(1, size),
    )
}

fn center_on_black(image: &RgbImage, size: u32) -> RgbImage {
    let mut panel = RgbImage::from_pixel(size, size, BACKGROUND);
    let x = (size - image.width().min(size)) / 2;
    let y = (size - image.height().min(size)) / 2;
    imageops::overlay(&mut panel, image, x as i64, y as i64);
    panel
}

fn fit_panel(image: &RgbImage, size: u32) -> RgbImage {
    let (w, h) = fit_dims(image.width(), image.height(), size);
    center_on_black(&imageops::resize(image, w, h, FilterType::Triangle), size)
}

/// Hot-colormap blend with the outline of the region at or above
/// `threshold`. Contours are traced after scaling so they stay one pixel
/// wide in the panel.
fn contour_panel(original: &RgbImage, map: &Array2<f32>, threshold: f32, config: &ExplainConfig) -> RgbImage {
    let size = config.panel_size;
    let (w, h) = fit_dims(original.width(), original.height(), size);
    let scaled_map = resize_plane(map, w, h);
    let base = imageops::resize(original, w, h, FilterType::Triangle);
    let mut panel = blend(&base, &colorize(&scaled_map, hot), config.contour_alpha);

    let mask = GrayImage::from_fn(w, h, |x, y| {
        let v = scaled_map[[y as usize, x as usize]];
        Luma([if v > 0.0 && v >= threshold { 255 } else { 0 }])
    });
    for contour in find_contours::<u32>(&mask) {
        for point in contour.points {
            panel.put_pixel(point.x, point.y, CONTOUR);
        }
    }
    center_on_black(&panel, size)
}

fn histogram_panel(map: &Array2<f32>, bins: usize, size: u32) -> RgbImage {
    let mut panel = RgbImage::from_pixel(size, size, BACKGROUND);
    let bins = bins.max(1);
    let mut counts = vec![0usize; bins];
    for &v in map.iter() {
        let bin = ((v.clamp(0.0, 1.0) * bins as f32) as usize).min(bins - 1);
        counts[bin] += 1;
    }
    let peak = counts.iter().copied().max().unwrap_or(0).max(1);

    let margin = size / 10;
    let (left, right) = (margin, size - margin);
    let (top, bottom) = (margin, size - margin);
    let plot_w = (right - left) as f32;
    let plot_h = (bottom - top) as f32;
    for (i, &count) in counts.iter().enumerate() {
        let x0 = left + (i as f32 * plot_w / bins as f32) as u32;
        let x1 = left + ((i + 1) as f32 * plot_w / bins as f32) as u32;
        let bar_h = ((count as f32 / peak as f32) * plot_h).round() as u32;
        if bar_h == 0 || x1 <= x0 {
            continue;
        }
        let color = jet((i as f32 + 0.5) / bins as f32);
        draw_filled_rect_mut(
            &mut panel,
            Rect::at(x0 as i32, (bottom - bar_h) as i32).of_size((x1 - x0).max(1), bar_h),
            color,
        );
    }
    let axis = Rgb([160, 160, 160]);
    draw_line_segment_mut(&mut panel, (left as f32, bottom as f32), (right as f32, bottom as f32), axis);
    draw_line_segment_mut(&mut panel, (left as f32, top as f32), (left as f32, bottom as f32), axis);
    panel
}

/// Mini-map with a crosshair on the peak, gauges for peak, mean and
/// coverage, and the colour scale.
fn stats_panel(map: &Array2<f32>, stats: &HeatmapStats, size: u32) -> RgbImage {
    let mut panel = RgbImage::from_pixel(size, size, BACKGROUND);
    let margin = size / 16;
    let (h, w) = map.dim();

    let mini_box = size / 2;
    let (mw, mh) = fit_dims(w as u32, h as u32, mini_box);
    let mini = colorize(&resize_plane(map, mw, mh), jet);
    let (mx, my) = (margin + (mini_box - mw) / 2, margin + (mini_box - mh) / 2);
    imageops::overlay(&mut panel, &mini, mx as i64, my as i64);
    draw_hollow_rect_mut(
        &mut panel,
        Rect::at(mx as i32, my as i32).of_size(mw, mh),
        Rgb([96, 96, 96]),
    );

    let sx = mw as f32 / w.max(1) as f32;
    let sy = mh as f32 / h.max(1) as f32;
    let cx = mx as f32 + (stats.max_location.0 as f32 + 0.5) * sx;
    let cy = my as f32 + (stats.max_location.1 as f32 + 0.5) * sy;
    draw_line_segment_mut(&mut panel, (mx as f32, cy), ((mx + mw) as f32, cy), CROSSHAIR);
    draw_line_segment_mut(&mut panel, (cx, my as f32), (cx, (my + mh) as f32), CROSSHAIR);

    let gauge_left = margin + mini_box + margin;
    let gauge_w = size.saturating_sub(gauge_left + margin).max(1);
    let gauge_h = (size / 20).max(4);
    let gauges = [
        stats.max_value,
        stats.mean,
        stats.coverage_percent / 100.0,
    ];
    for (i, &value) in gauges.iter().enumerate() {
        let y = margin + i as u32 * (gauge_h * 3) + gauge_h;
        let track = Rect::at(gauge_left as i32, y as i32).of_size(gauge_w, gauge_h);
        draw_filled_rect_mut(&mut panel, track, TRACK);
        let filled = (value.clamp(0.0, 1.0) * gauge_w as f32).round() as u32;
        if filled > 0 {
            draw_filled_rect_mut(
                &mut panel,
                Rect::at(gauge_left as i32, y as i32).of_size(filled, gauge_h),
                jet(value),
            );
        }
    }

    let strip_top = margin + mini_box + margin;
    let strip_h = (size / 12).max(4);
    let strip_w = size - 2 * margin;
    for dx in 0..strip_w {
        let color = jet(dx as f32 / (strip_w - 1).max(1) as f32);
        for dy in 0..strip_h {
            panel.put_pixel(margin + dx, strip_top + dy, color);
        }
    }
    panel
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(width: usize, height: usize, cx: f32, cy: f32) -> Array2<f32> {
        Array2::from_shape_fn((height, width), |(y, x)| {
            let d2 = (x as f32 - cx).powi(2) + (y as f32 - cy).powi(2);
            (-d2 / 200.0).exp()
        })
    }

    #[test]
    fn colormaps_span_their_endpoints() {
        assert_eq!(jet(0.0), Rgb([0, 0, 128]));
        assert_eq!(jet(1.0), Rgb([128, 0, 0]));
        assert_eq!(hot(0.0), Rgb([0, 0, 0]));
        assert_eq!(hot(1.0), Rgb([255, 255, 255]));
    }

    #[test]
    fn stats_locate_the_peak() {
        let map = blob(120, 80, 90.0, 20.0);
        let stats = compute_stats(&map, &ExplainConfig::default());
        assert_eq!(stats.max_location, (90, 20));
        assert!((stats.max_value - 1.0).abs() < 1e-6);
        assert!(stats.mean > 0.0 && stats.mean < 0.2);
        assert!(stats.contour_threshold > stats.mean);
        assert!(stats.coverage_percent > 0.0 && stats.coverage_percent < 5.0);
    }

    #[test]
    fn figure_is_a_three_by_two_grid_and_overlay_is_native() {
        let original = RgbImage::from_fn(150, 90, |x, y| Rgb([x as u8, y as u8, 60]));
        let map = blob(150, 90, 40.0, 45.0);
        let config = ExplainConfig::default();
        let stats = compute_stats(&map, &config);
        let rendered = render(&original, &map, &stats, &config).unwrap();

        let figure = image::load_from_memory(&rendered.figure_png).unwrap();
        assert_eq!(figure.width(), 3 * 320 + 4 * GAP);
        assert_eq!(figure.height(), 2 * 320 + 3 * GAP);
        let overlay = image::load_from_memory(&rendered.overlay_png).unwrap();
        assert_eq!((overlay.width(), overlay.height()), (150, 90));
    }

    #[test]
    fn zero_map_still_renders() {
        let original = RgbImage::from_pixel(64, 64, Rgb([10, 20, 30]));
        let map = Array2::zeros((64, 64));
        let config = ExplainConfig::default();
        let stats = compute_stats(&map, &config);
        assert_eq!(stats.max_value, 0.0);
        assert_eq!(stats.coverage_percent, 0.0);
        assert!(render(&original, &map, &stats, &config).is_ok());
    }

    #[test]
    fn mismatched_map_is_a_render_error() {
        let original = RgbImage::new(10, 10);
        let err = render(
            &original,
            &Array2::zeros((5, 5)),
            &compute_stats(&Array2::zeros((5, 5)), &ExplainConfig::default()),
            &ExplainConfig::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, ExplainError::Render(_)));
    }
}
