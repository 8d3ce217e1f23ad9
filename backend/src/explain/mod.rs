pub mod render;
pub mod strategy;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use image::RgbImage;
use shared::{Disease, HeatmapStats};

use crate::config::ExplainConfig;
use crate::model::Classifier;
use crate::preprocess::NormalizedTensor;
pub use strategy::{AttentionMap, AttentionStrategy, GradCam, PixelGradient};

#[derive(Debug, thiserror::Error)]
pub enum ExplainError {
    #[error("Layer not found: {0}")]
    LayerNotFound(String),
    #[error("Layer has no spatial extent: {0}")]
    NotSpatial(String),
    #[error("Gradients unsupported by {0}")]
    GradientUnsupported(String),
    #[error("Backend error: {0}")]
    Backend(String),
    #[error("Degenerate attention map: {0}")]
    Degenerate(String),
    #[error("Render error: {0}")]
    Render(String),
}

#[derive(Debug, Clone)]
pub struct HeatmapArtifact {
    /// The six-panel figure.
    pub figure_png: Vec<u8>,
    /// Heatmap blended over the original, at the original's size.
    pub overlay_png: Vec<u8>,
    pub layer: String,
    pub strategy: String,
    pub stats: HeatmapStats,
}

impl HeatmapArtifact {
    pub fn figure_base64(&self) -> String {
        STANDARD.encode(&self.figure_png)
    }

    pub fn overlay_base64(&self) -> String {
        STANDARD.encode(&self.overlay_png)
    }
}

pub struct Explainer {
    strategies: Vec<Box<dyn AttentionStrategy>>,
    config: ExplainConfig,
}

impl Explainer {
    pub fn new(config: ExplainConfig) -> Self {
        let strategies = strategy::build(
            &config.strategies,
            config.gradcam_layer.clone(),
            config.fallback_blur_sigma,
        );
        Self::with_strategies(strategies, config)
    }

    pub fn with_strategies(strategies: Vec<Box<dyn AttentionStrategy>>, config: ExplainConfig) -> Self {
        if strategies.is_empty() {
            log::warn!("No explanation strategies configured; heatmaps will never be produced");
        }
        Self { strategies, config }
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Tries each strategy in order and renders the first map produced.
    /// Every failure is logged; `None` means nothing could be rendered.
    pub fn explain(
        &self,
        model: &dyn Classifier,
        tensor: &NormalizedTensor,
        original: &RgbImage,
        class: Disease,
    ) -> Option<HeatmapArtifact> {
        let (width, height) = original.dimensions();
        for strategy in &self.strategies {
            let attention = match strategy.attend(model, tensor, class, width, height) {
                Ok(attention) => attention,
                Err(e) => {
                    log::warn!("Explanation strategy {} failed: {}", strategy.name(), e);
                    continue;
                }
            };
            let stats = render::compute_stats(&attention.map, &self.config);
            match render::render(original, &attention.map, &stats, &self.config) {
                Ok(rendered) => {
                    log::debug!(
                        "Heatmap from {} ({}), peak {:.2} at {:?}",
                        strategy.name(),
                        attention.source,
                        stats.max_value,
                        stats.max_location
                    );
                    return Some(HeatmapArtifact {
                        figure_png: rendered.figure_png,
                        overlay_png: rendered.overlay_png,
                        layer: attention.source,
                        strategy: strategy.name().to_string(),
                        stats,
                    });
                }
                Err(e) => {
                    log::warn!("Rendering {} heatmap failed: {}", strategy.name(), e);
                    return None;
                }
            }
        }
        log::warn!("All explanation strategies failed for {}", class);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::stub::StubModel;
    use crate::model::{Architecture, RetinaCnn};
    use image::Rgb;
    use ndarray::Array3;

    const PROBS: [f32; 6] = [0.05, 0.05, 0.7, 0.1, 0.05, 0.05];

    fn tensor() -> NormalizedTensor {
        NormalizedTensor::try_from_array(Array3::from_shape_fn((224, 224, 3), |(y, x, c)| {
            if (x as i32 - 112).pow(2) + (y as i32 - 112).pow(2) < 60 * 60 {
                0.6 + 0.1 * c as f32
            } else {
                0.1
            }
        }))
        .unwrap()
    }

    fn original() -> RgbImage {
        RgbImage::from_fn(300, 200, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 90]))
    }

    fn explainer(strategies: &[&str]) -> Explainer {
        Explainer::new(ExplainConfig {
            strategies: strategies.iter().map(|s| s.to_string()).collect(),
            ..ExplainConfig::default()
        })
    }

    #[test]
    fn grad_cam_only_without_gradients_yields_nothing() {
        let model = StubModel::new(PROBS);
        let artifact = explainer(&["grad-cam"]).explain(&model, &tensor(), &original(), Disease::Glaucoma);
        assert!(artifact.is_none());
    }

    #[test]
    fn default_chain_falls_back_to_pixel_gradient() {
        let model = StubModel::new(PROBS);
        let explainer = Explainer::new(ExplainConfig::default());
        assert_eq!(explainer.strategy_names(), vec!["grad-cam", "pixel-gradient"]);
        let artifact = explainer
            .explain(&model, &tensor(), &original(), Disease::Glaucoma)
            .expect("fallback should render");
        assert_eq!(artifact.strategy, "pixel-gradient");
        assert_eq!(artifact.layer, strategy::LUMINANCE_SOURCE);

        let overlay = image::load_from_memory(&artifact.overlay_png).unwrap();
        assert_eq!((overlay.width(), overlay.height()), (300, 200));
        assert!(!artifact.figure_base64().is_empty());
    }

    #[test]
    fn native_model_explains_with_grad_cam() {
        let model = RetinaCnn::initialize(&Architecture::tiny(), 21);
        let artifact = Explainer::new(ExplainConfig::default())
            .explain(&model, &tensor(), &original(), Disease::Cataract)
            .expect("grad-cam should succeed");
        assert_eq!(artifact.strategy, "grad-cam");
        assert_eq!(artifact.layer, "block4_conv2");
        assert!((0.0..=1.0).contains(&artifact.stats.max_value));
    }

    #[test]
    fn unknown_layer_still_explains_with_grad_cam() {
        let model = RetinaCnn::initialize(&Architecture::tiny(), 21);
        let explainer = Explainer::new(ExplainConfig {
            gradcam_layer: Some("no_such_layer".to_string()),
            ..ExplainConfig::default()
        });
        let artifact = explainer
            .explain(&model, &tensor(), &original(), Disease::Normal)
            .unwrap();
        assert_eq!(artifact.strategy, "grad-cam");
        assert_eq!(artifact.layer, "block4_conv2");
    }

    #[test]
    fn empty_chain_yields_nothing() {
        let model = StubModel::new(PROBS);
        assert!(explainer(&[]).explain(&model, &tensor(), &original(), Disease::Normal).is_none());
    }
}
