use image::RgbImage;
use serde::Serialize;
use shared::QualityVerdict;
use std::fmt;

use crate::config::QualityConfig;
use crate::imaging::{filter3x3, luma_plane, mean_std, LAPLACIAN};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityIssue {
    Blurry,
    TooDark,
    TooBright,
    LowContrast,
    LowResolution,
}

impl fmt::Display for QualityIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QualityIssue::Blurry => "blurry",
            QualityIssue::TooDark => "too_dark",
            QualityIssue::TooBright => "too_bright",
            QualityIssue::LowContrast => "low_contrast",
            QualityIssue::LowResolution => "low_resolution",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QualityReport {
    /// Variance of the Laplacian of the 0..255 luma.
    pub sharpness: f64,
    /// Mean luma, 0..255.
    pub brightness: f64,
    /// Luma standard deviation.
    pub contrast: f64,
    pub width: u32,
    pub height: u32,
    pub issues: Vec<QualityIssue>,
    pub verdict: QualityVerdict,
}

pub struct QualityAssessor {
    config: QualityConfig,
}

impl QualityAssessor {
    pub fn new(config: QualityConfig) -> Self {
        Self { config }
    }

    pub fn assess(&self, image: &RgbImage) -> QualityReport {
        let (width, height) = image.dimensions();
        let gray = luma_plane(image);
        let (_, laplacian_std) = mean_std(&filter3x3(&gray, &LAPLACIAN));
        let sharpness = laplacian_std * laplacian_std;
        let (brightness, contrast) = mean_std(&gray);

        let c = &self.config;
        let mut issues = Vec::new();
        if sharpness < c.blur_threshold {
            issues.push(QualityIssue::Blurry);
        }
        if brightness < c.dark_threshold {
            issues.push(QualityIssue::TooDark);
        }
        if brightness > c.bright_threshold {
            issues.push(QualityIssue::TooBright);
        }
        if contrast < c.low_contrast_threshold {
            issues.push(QualityIssue::LowContrast);
        }
        if width.min(height) < c.min_resolution {
            issues.push(QualityIssue::LowResolution);
        }

        let verdict = verdict_for(issues.len());
        log::debug!(
            "Quality {}x{}: sharpness={:.1} brightness={:.1} contrast={:.1} -> {} {:?}",
            width,
            height,
            sharpness,
            brightness,
            contrast,
            verdict,
            issues
        );
        QualityReport {
            sharpness,
            brightness,
            contrast,
            width,
            height,
            issues,
            verdict,
        }
    }
}

fn verdict_for(issue_count: usize) -> QualityVerdict {
    match issue_count {
        0 => QualityVerdict::Excellent,
        1 => QualityVerdict::Good,
        2 => QualityVerdict::Fair,
        _ => QualityVerdict::Poor,
    }
}
