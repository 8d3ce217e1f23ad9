use chrono::{DateTime, Utc};
use shared::{ClassConfidence, Disease, ModelSummary, PredictResponse, QualityMetrics};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::explain::{Explainer, HeatmapArtifact};
use crate::model::{ClassDistribution, InferenceEngine, ModelError, ModelSlot};
use crate::preprocess::{PreprocessError, Preprocessor, QualityReport, RawImage, RetinalDisk};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Preprocess(#[from] PreprocessError),
    #[error(transparent)]
    Model(#[from] ModelError),
}

#[derive(Debug, Clone, Copy)]
pub struct StageTimings {
    pub preprocess: Duration,
    pub inference: Duration,
    /// Only set when a heatmap was requested.
    pub explanation: Option<Duration>,
    pub total: Duration,
}

#[derive(Debug, Clone)]
pub struct PredictionResult {
    pub request_id: Uuid,
    pub disease: Disease,
    pub confidence: f32,
    pub distribution: ClassDistribution,
    pub quality: QualityReport,
    pub roi: Option<RetinalDisk>,
    pub heatmap: Option<HeatmapArtifact>,
    pub timings: StageTimings,
    pub model: ModelSummary,
    pub timestamp: DateTime<Utc>,
}

impl PredictionResult {
    /// Wall time from receipt to assembly, heatmap included.
    pub fn processing_time(&self) -> Duration {
        self.timings.total
    }

    pub fn to_response(&self) -> PredictResponse {
        let ms = |d: Duration| d.as_secs_f64() * 1000.0;
        PredictResponse {
            request_id: self.request_id.to_string(),
            disease: self.disease,
            confidence: self.confidence,
            all_predictions: self
                .distribution
                .ranked()
                .into_iter()
                .map(|(class, confidence)| ClassConfidence { class, confidence })
                .collect(),
            processing_time: self.timings.total.as_secs_f64(),
            image_quality: self.quality.verdict,
            quality_metrics: QualityMetrics {
                sharpness: self.quality.sharpness,
                brightness: self.quality.brightness,
                contrast: self.quality.contrast,
                width: self.quality.width,
                height: self.quality.height,
                issues: self.quality.issues.iter().map(|i| i.to_string()).collect(),
            },
            timings: shared::StageTimings {
                preprocess_ms: ms(self.timings.preprocess),
                inference_ms: ms(self.timings.inference),
                explanation_ms: self.timings.explanation.map(ms),
                total_ms: ms(self.timings.total),
            },
            heatmap: self.heatmap.as_ref().map(HeatmapArtifact::figure_base64),
            heatmap_overlay: self.heatmap.as_ref().map(HeatmapArtifact::overlay_base64),
            heatmap_layer: self.heatmap.as_ref().map(|h| h.layer.clone()),
            heatmap_strategy: self.heatmap.as_ref().map(|h| h.strategy.clone()),
            heatmap_stats: self.heatmap.as_ref().map(|h| h.stats.clone()),
            timestamp: self.timestamp.to_rfc3339(),
            model_info: self.model.clone(),
        }
    }
}

#[derive(Clone)]
pub struct Pipeline {
    preprocessor: Arc<Preprocessor>,
    engine: InferenceEngine,
    explainer: Arc<Explainer>,
}

impl Pipeline {
    pub fn new(config: &AppConfig, slot: ModelSlot) -> Self {
        Self {
            preprocessor: Arc::new(Preprocessor::new(config.preprocess.clone(), config.quality.clone())),
            engine: InferenceEngine::new(slot),
            explainer: Arc::new(Explainer::new(config.explain.clone())),
        }
    }

    pub fn engine(&self) -> &InferenceEngine {
        &self.engine
    }

    /// Preprocess, classify and optionally explain one upload. A heatmap
    /// failure leaves `heatmap` empty and never fails the request.
    pub fn handle_predict(&self, raw: &RawImage, want_heatmap: bool) -> Result<PredictionResult, PipelineError> {
        let started = Instant::now();
        let request_id = Uuid::new_v4();
        let digest = raw.digest();

        let preprocessed = self.preprocessor.preprocess(raw)?;
        let preprocess = started.elapsed();

        let model = self.engine.model()?;
        let inference_started = Instant::now();
        let distribution = self.engine.predict(&preprocessed.tensor)?;
        let inference = inference_started.elapsed();
        let (disease, confidence) = distribution.top();

        let (heatmap, explanation) = if want_heatmap {
            let explain_started = Instant::now();
            let heatmap = self
                .explainer
                .explain(model.as_ref(), &preprocessed.tensor, &preprocessed.display, disease);
            (heatmap, Some(explain_started.elapsed()))
        } else {
            (None, None)
        };

        let timings = StageTimings {
            preprocess,
            inference,
            explanation,
            total: started.elapsed(),
        };
        let metadata = model.metadata();
        log::info!(
            "Request {} [{}]: {} ({:.3}), quality {}, preprocess {:.1}ms, inference {:.1}ms, explanation {}, total {:.1}ms",
            request_id,
            &digest[..12],
            disease,
            confidence,
            preprocessed.quality.verdict,
            timings.preprocess.as_secs_f64() * 1000.0,
            timings.inference.as_secs_f64() * 1000.0,
            match (timings.explanation, &heatmap) {
                (Some(d), Some(h)) => format!("{:.1}ms via {}", d.as_secs_f64() * 1000.0, h.strategy),
                (Some(d), None) => format!("{:.1}ms, no heatmap", d.as_secs_f64() * 1000.0),
                (None, _) => "skipped".to_string(),
            },
            timings.total.as_secs_f64() * 1000.0
        );

        Ok(PredictionResult {
            request_id,
            disease,
            confidence,
            distribution,
            quality: preprocessed.quality,
            roi: preprocessed.roi,
            heatmap,
            timings,
            model: ModelSummary {
                name: metadata.name.clone(),
                version: metadata.version.clone(),
            },
            timestamp: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::stub::StubModel;
    use crate::model::{Architecture, Classifier, RetinaCnn};
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    const PROBS: [f32; 6] = [0.1, 0.05, 0.05, 0.6, 0.15, 0.05];

    fn fundus_png() -> Vec<u8> {
        let img = RgbImage::from_fn(320, 256, |x, y| {
            let (dx, dy) = (x as f32 - 160.0, y as f32 - 128.0);
            if dx * dx + dy * dy < 100.0 * 100.0 {
                Rgb([200, 90 + (x % 40) as u8, 40 + (y % 30) as u8])
            } else {
                Rgb([0, 0, 0])
            }
        });
        let mut cursor = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut cursor, ImageFormat::Png)
            .unwrap();
        cursor.into_inner()
    }

    fn pipeline_with(model: Arc<dyn Classifier>) -> Pipeline {
        Pipeline::new(&AppConfig::default(), ModelSlot::with_model(model))
    }

    #[test]
    fn top_class_is_the_argmax_of_the_distribution() {
        let pipeline = pipeline_with(Arc::new(StubModel::new(PROBS)));
        let result = pipeline
            .handle_predict(&RawImage::new(fundus_png(), "image/png"), false)
            .unwrap();
        assert_eq!(result.disease, Disease::Cataract);
        assert_eq!(result.confidence, 0.6);
        assert_eq!(result.distribution.top(), (result.disease, result.confidence));
        assert!(result.heatmap.is_none());
        assert!(result.timings.explanation.is_none());

        let response = result.to_response();
        assert_eq!(response.all_predictions.len(), 6);
        assert_eq!(response.all_predictions[0].class, Disease::Cataract);
        assert_eq!(response.all_predictions[1].class, Disease::MacularDegeneration);
        assert!(response.heatmap.is_none());
    }

    #[test]
    fn heatmap_costs_time_and_is_attached_when_requested() {
        let pipeline = pipeline_with(Arc::new(RetinaCnn::initialize(&Architecture::tiny(), 9)));
        let raw = RawImage::new(fundus_png(), "image/png");

        let with = pipeline.handle_predict(&raw, true).unwrap();
        let without = pipeline.handle_predict(&raw, false).unwrap();

        let heatmap = with.heatmap.as_ref().expect("heatmap requested");
        assert_eq!(heatmap.strategy, "grad-cam");
        assert!(with.timings.explanation.is_some());
        assert!(without.heatmap.is_none());
        assert!(without.processing_time() < with.processing_time());

        let response = with.to_response();
        assert!(response.heatmap.is_some());
        assert_eq!(response.heatmap_layer.as_deref(), Some("block4_conv2"));
        assert!(response.timings.explanation_ms.is_some());
    }

    #[test]
    fn overlay_matches_the_cropped_display_image() {
        let pipeline = pipeline_with(Arc::new(StubModel::new(PROBS)));
        let result = pipeline
            .handle_predict(&RawImage::new(fundus_png(), "image/png"), true)
            .unwrap();
        let heatmap = result.heatmap.expect("fallback heatmap");
        let overlay = image::load_from_memory(&heatmap.overlay_png).unwrap();
        let disk = result.roi.expect("fixture disk should be detected");
        assert!((disk.center_x - 160.0).abs() < 8.0, "{disk:?}");
        assert!((disk.radius - 100.0).abs() < 8.0, "{disk:?}");
        let (_, _, w, h) = disk.crop_rect(320, 256, AppConfig::default().preprocess.roi.padding_ratio);
        assert!(w < 320);
        assert_eq!((overlay.width(), overlay.height()), (w, h));
        assert_eq!(result.quality.width, 320);
    }

    #[test]
    fn corrupt_upload_never_reaches_the_model() {
        let stub = Arc::new(StubModel::new(PROBS));
        let pipeline = pipeline_with(stub.clone());
        let mut bytes = fundus_png();
        bytes.truncate(60);
        let err = pipeline
            .handle_predict(&RawImage::new(bytes, "image/jpeg"), true)
            .unwrap_err();
        assert!(matches!(err, PipelineError::Preprocess(PreprocessError::InvalidImage(_))));
        assert_eq!(stub.predict_calls(), 0);
    }

    #[test]
    fn empty_slot_reports_model_unavailable() {
        let pipeline = Pipeline::new(&AppConfig::default(), ModelSlot::new());
        let err = pipeline
            .handle_predict(&RawImage::new(fundus_png(), "image/png"), false)
            .unwrap_err();
        assert!(matches!(err, PipelineError::Model(ModelError::Unavailable)));
    }
}
