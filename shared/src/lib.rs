use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumCount, EnumIter, EnumString};

/// Canonical label enumeration. The declaration order is the classifier's
/// output vector order and must not change.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
    EnumIter,
    EnumCount,
)]
pub enum Disease {
    #[strum(serialize = "Normal")]
    #[serde(rename = "Normal")]
    Normal,
    #[strum(serialize = "Diabetic Retinopathy")]
    #[serde(rename = "Diabetic Retinopathy")]
    DiabeticRetinopathy,
    #[strum(serialize = "Glaucoma")]
    #[serde(rename = "Glaucoma")]
    Glaucoma,
    #[strum(serialize = "Cataract")]
    #[serde(rename = "Cataract")]
    Cataract,
    #[strum(serialize = "Age-related Macular Degeneration")]
    #[serde(rename = "Age-related Macular Degeneration")]
    MacularDegeneration,
    #[strum(serialize = "Hypertensive Retinopathy")]
    #[serde(rename = "Hypertensive Retinopathy")]
    HypertensiveRetinopathy,
}

impl Disease {
    pub const ALL: [Disease; 6] = [
        Disease::Normal,
        Disease::DiabeticRetinopathy,
        Disease::Glaucoma,
        Disease::Cataract,
        Disease::MacularDegeneration,
        Disease::HypertensiveRetinopathy,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Ordered from worst to best so verdicts compare naturally.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
pub enum QualityVerdict {
    Poor,
    Fair,
    Good,
    Excellent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassConfidence {
    pub class: Disease,
    pub confidence: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityMetrics {
    pub sharpness: f64,
    pub brightness: f64,
    pub contrast: f64,
    pub width: u32,
    pub height: u32,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTimings {
    pub preprocess_ms: f64,
    pub inference_ms: f64,
    pub explanation_ms: Option<f64>,
    pub total_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeatmapStats {
    pub max_value: f32,
    pub max_location: (u32, u32),
    pub mean: f32,
    pub std_dev: f32,
    pub contour_threshold: f32,
    pub coverage_threshold: f32,
    pub coverage_percent: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSummary {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictResponse {
    pub request_id: String,
    pub disease: Disease,
    pub confidence: f32,
    pub all_predictions: Vec<ClassConfidence>,
    /// Seconds, heatmap generation included.
    pub processing_time: f64,
    pub image_quality: QualityVerdict,
    pub quality_metrics: QualityMetrics,
    pub timings: StageTimings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heatmap: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heatmap_overlay: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heatmap_layer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heatmap_strategy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heatmap_stats: Option<HeatmapStats>,
    pub timestamp: String,
    pub model_info: ModelSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub model_loaded: bool,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfoResponse {
    pub name: String,
    pub version: String,
    pub architecture: String,
    pub input_shape: [usize; 3],
    pub num_classes: usize,
    pub class_names: Vec<Disease>,
    pub gradcam_layer: Option<String>,
    pub trained: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use strum::{EnumCount, IntoEnumIterator};

    #[test]
    fn canonical_order_matches_iteration_order() {
        let iterated: Vec<Disease> = Disease::iter().collect();
        assert_eq!(iterated, Disease::ALL.to_vec());
        assert_eq!(Disease::COUNT, 6);
        for (i, d) in Disease::ALL.iter().enumerate() {
            assert_eq!(d.index(), i);
        }
    }

    #[test]
    fn labels_display_and_parse() {
        assert_eq!(
            Disease::MacularDegeneration.to_string(),
            "Age-related Macular Degeneration"
        );
        assert_eq!(
            Disease::from_str("Diabetic Retinopathy").unwrap(),
            Disease::DiabeticRetinopathy
        );
        let json = serde_json::to_string(&Disease::HypertensiveRetinopathy).unwrap();
        assert_eq!(json, "\"Hypertensive Retinopathy\"");
    }

    #[test]
    fn verdicts_are_ordered_worst_first() {
        assert!(QualityVerdict::Poor < QualityVerdict::Fair);
        assert!(QualityVerdict::Good < QualityVerdict::Excellent);
        assert_eq!(QualityVerdict::Fair.to_string(), "Fair");
    }

    #[test]
    fn optional_heatmap_fields_are_omitted() {
        let response = PredictResponse {
            request_id: "r".into(),
            disease: Disease::Normal,
            confidence: 0.9,
            all_predictions: vec![ClassConfidence {
                class: Disease::Normal,
                confidence: 0.9,
            }],
            processing_time: 0.5,
            image_quality: QualityVerdict::Good,
            quality_metrics: QualityMetrics {
                sharpness: 120.0,
                brightness: 90.0,
                contrast: 40.0,
                width: 512,
                height: 512,
                issues: vec![],
            },
            timings: StageTimings {
                preprocess_ms: 1.0,
                inference_ms: 2.0,
                explanation_ms: None,
                total_ms: 3.0,
            },
            heatmap: None,
            heatmap_overlay: None,
            heatmap_layer: None,
            heatmap_strategy: None,
            heatmap_stats: None,
            timestamp: "2024-01-01T00:00:00Z".into(),
            model_info: ModelSummary {
                name: "RetinaCNN".into(),
                version: "1.0.0".into(),
            },
        };
        let value = serde_json::to_value(&response).unwrap();
        assert!(value.get("heatmap").is_none());
        assert_eq!(value["all_predictions"][0]["class"], "Normal");
        assert_eq!(value["image_quality"], "Good");
    }
}
