use ndarray::{Array2, Axis, Zip};
use shared::Disease;

use super::ExplainError;
use crate::imaging::{gaussian_blur, gradient_magnitude, normalize_unit, resize_plane};
use crate::model::Classifier;
use crate::preprocess::NormalizedTensor;

pub const GRAD_CAM: &str = "grad-cam";
pub const PIXEL_GRADIENT: &str = "pixel-gradient";

/// Source name recorded for maps that do not come from a model layer.
pub const LUMINANCE_SOURCE: &str = "input-luminance";

/// A saliency map in [0, 1] at the requested output size, indexed `[y, x]`.
#[derive(Debug, Clone)]
pub struct AttentionMap {
    pub map: Array2<f32>,
    /// Model layer (or input channel) the map was derived from.
    pub source: String,
}

pub trait AttentionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn attend(
        &self,
        model: &dyn Classifier,
        tensor: &NormalizedTensor,
        class: Disease,
        width: u32,
        height: u32,
    ) -> Result<AttentionMap, ExplainError>;
}

pub struct GradCam {
    layer: Option<String>,
}

impl GradCam {
    /// `None` uses the model's default layer.
    pub fn new(layer: Option<String>) -> Self {
        Self { layer }
    }
}

impl AttentionStrategy for GradCam {
    fn name(&self) -> &'static str {
        GRAD_CAM
    }

    fn attend(
        &self,
        model: &dyn Classifier,
        tensor: &NormalizedTensor,
        class: Disease,
        width: u32,
        height: u32,
    ) -> Result<AttentionMap, ExplainError> {
        let layer = self
            .layer
            .clone()
            .or_else(|| model.metadata().gradcam_layer.clone())
            .ok_or_else(|| ExplainError::LayerNotFound("model exposes no default layer".to_string()))?;
        let cam = match grad_cam(model, tensor, &layer, class) {
            Err(err @ (ExplainError::LayerNotFound(_) | ExplainError::NotSpatial(_))) => {
                let Some(fallback) = fallback_layer(model, &layer) else {
                    return Err(err);
                };
                log::warn!("Grad-CAM on {} failed ({}), retrying on {}", layer, err, fallback);
                grad_cam(model, tensor, &fallback, class).map_err(|_| err)?
            }
            other => other?,
        };
        let map = resize_plane(&cam.map, width, height).mapv(|v| v.clamp(0.0, 1.0));
        Ok(AttentionMap {
            map,
            source: cam.source,
        })
    }
}

/// The last convolution the model exposes, else its default layer, skipping
/// the layer that already failed.
fn fallback_layer(model: &dyn Classifier, failed: &str) -> Option<String> {
    let last_conv = model
        .layer_names()
        .into_iter()
        .rev()
        .find(|name| name.contains("conv"));
    last_conv
        .into_iter()
        .chain(model.metadata().gradcam_layer.clone())
        .find(|name| name != failed)
}

/// Normalized Grad-CAM at the layer's own resolution.
fn grad_cam(
    model: &dyn Classifier,
    tensor: &NormalizedTensor,
    layer: &str,
    class: Disease,
) -> Result<AttentionMap, ExplainError> {
    let lg = model.activation_gradient(tensor, layer, class)?;
    if lg.activations.dim() != lg.gradients.dim() {
        return Err(ExplainError::Backend(format!(
            "activation shape {:?} does not match gradient shape {:?}",
            lg.activations.dim(),
            lg.gradients.dim()
        )));
    }
    let (channels, h, w) = lg.activations.dim();
    if channels == 0 || h == 0 || w == 0 {
        return Err(ExplainError::NotSpatial(layer.to_string()));
    }

    let weights = lg
        .gradients
        .mean_axis(Axis(2))
        .and_then(|a| a.mean_axis(Axis(1)))
        .ok_or_else(|| ExplainError::Degenerate("empty gradient".to_string()))?;
    let mut cam = Array2::<f32>::zeros((h, w));
    for (c, activation) in lg.activations.axis_iter(Axis(0)).enumerate() {
        let weight = weights[c];
        Zip::from(&mut cam).and(&activation).for_each(|m, &a| *m += weight * a);
    }
    if cam.iter().any(|v| !v.is_finite()) {
        return Err(ExplainError::Degenerate(format!("non-finite values in {layer} map")));
    }
    cam.mapv_inplace(|v| v.max(0.0));
    let max = cam.iter().copied().fold(0.0f32, f32::max);
    if max > 0.0 {
        cam.mapv_inplace(|v| v / max);
    } else {
        log::debug!("Grad-CAM map for {} is all zero", layer);
    }
    Ok(AttentionMap {
        map: cam,
        source: layer.to_string(),
    })
}

/// Edge energy of the input itself. Needs nothing from the model.
pub struct PixelGradient {
    sigma: f32,
}

impl PixelGradient {
    pub fn new(sigma: f32) -> Self {
        Self { sigma }
    }
}

impl AttentionStrategy for PixelGradient {
    fn name(&self) -> &'static str {
        PIXEL_GRADIENT
    }

    fn attend(
        &self,
        _model: &dyn Classifier,
        tensor: &NormalizedTensor,
        _class: Disease,
        width: u32,
        height: u32,
    ) -> Result<AttentionMap, ExplainError> {
        let magnitude = gradient_magnitude(&tensor.luminance());
        let smoothed = normalize_unit(&gaussian_blur(&magnitude, self.sigma));
        let map = resize_plane(&smoothed, width, height).mapv(|v| v.clamp(0.0, 1.0));
        Ok(AttentionMap {
            map,
            source: LUMINANCE_SOURCE.to_string(),
        })
    }
}

/// Builds the named strategies in order. Unknown names are skipped.
pub fn build(names: &[String], gradcam_layer: Option<String>, fallback_sigma: f32) -> Vec<Box<dyn AttentionStrategy>> {
    names
        .iter()
        .filter_map(|name| -> Option<Box<dyn AttentionStrategy>> {
            match name.as_str() {
                GRAD_CAM => Some(Box::new(GradCam::new(gradcam_layer.clone()))),
                PIXEL_GRADIENT => Some(Box::new(PixelGradient::new(fallback_sigma))),
                other => {
                    log::warn!("Unknown explanation strategy '{}' ignored", other);
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Architecture, LayerGradient, RetinaCnn};
    use crate::model::stub::{STUB_LAYER, StubModel};
    use ndarray::Array3;

    const PROBS: [f32; 6] = [0.1, 0.5, 0.1, 0.1, 0.1, 0.1];

    fn tensor(f: impl Fn(usize, usize) -> f32) -> NormalizedTensor {
        NormalizedTensor::try_from_array(Array3::from_shape_fn((224, 224, 3), |(y, x, _)| f(y, x))).unwrap()
    }

    fn hot_spot_gradient(weight: f32) -> LayerGradient {
        let mut activations = Array3::<f32>::zeros((2, 7, 7));
        activations[[0, 2, 5]] = 3.0;
        activations[[1, 4, 1]] = 1.0;
        LayerGradient {
            activations,
            gradients: Array3::from_elem((2, 7, 7), weight),
        }
    }

    #[test]
    fn grad_cam_peaks_where_weighted_activation_peaks() {
        let model = StubModel::new(PROBS).with_gradient(hot_spot_gradient(0.2));
        let out = GradCam::new(None)
            .attend(&model, &tensor(|_, _| 0.5), Disease::DiabeticRetinopathy, 140, 70)
            .unwrap();
        assert_eq!(out.source, STUB_LAYER);
        assert_eq!(out.map.dim(), (70, 140));
        assert!(out.map.iter().all(|v| (0.0..=1.0).contains(v)));
        let (peak, _) = out
            .map
            .indexed_iter()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .unwrap();
        // Cell (row 2, col 5) of a 7x7 grid scaled to 140x70.
        assert!((peak.1 as f32 - 5.5 * 20.0).abs() <= 20.0, "{peak:?}");
        assert!((peak.0 as f32 - 2.5 * 10.0).abs() <= 10.0, "{peak:?}");
    }

    #[test]
    fn negative_evidence_gives_an_all_zero_map() {
        let model = StubModel::new(PROBS).with_gradient(hot_spot_gradient(-1.0));
        let out = GradCam::new(None)
            .attend(&model, &tensor(|_, _| 0.5), Disease::Normal, 32, 32)
            .unwrap();
        assert!(out.map.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn grad_cam_reports_missing_gradient_support() {
        let plain = StubModel::new(PROBS);
        let err = GradCam::new(None)
            .attend(&plain, &tensor(|_, _| 0.5), Disease::Normal, 8, 8)
            .unwrap_err();
        assert!(matches!(err, ExplainError::GradientUnsupported(_)));

        let err = GradCam::new(Some("block9_conv2".into()))
            .attend(&plain, &tensor(|_, _| 0.5), Disease::Normal, 8, 8)
            .unwrap_err();
        assert!(matches!(err, ExplainError::GradientUnsupported(_)));
    }

    #[test]
    fn unknown_layer_retries_on_the_last_convolution() {
        let model = StubModel::new(PROBS).with_gradient(hot_spot_gradient(1.0));
        let out = GradCam::new(Some("block9_conv2".into()))
            .attend(&model, &tensor(|_, _| 0.5), Disease::Normal, 8, 8)
            .unwrap();
        assert_eq!(out.source, STUB_LAYER);
        assert!(out.map.iter().any(|&v| v > 0.0));
    }

    #[test]
    fn non_spatial_layer_retries_on_the_last_convolution() {
        let model = RetinaCnn::initialize(&Architecture::tiny(), 5);
        let out = GradCam::new(Some("dense1".into()))
            .attend(&model, &tensor(|y, x| ((x * 7 + y * 3) % 17) as f32 / 17.0), Disease::Normal, 56, 56)
            .unwrap();
        assert_eq!(out.source, "block4_conv2");
        assert_eq!(out.map.dim(), (56, 56));
    }

    #[test]
    fn non_finite_maps_are_degenerate() {
        let mut lg = hot_spot_gradient(1.0);
        lg.activations[[0, 0, 0]] = f32::NAN;
        let model = StubModel::new(PROBS).with_gradient(lg);
        let err = GradCam::new(None)
            .attend(&model, &tensor(|_, _| 0.5), Disease::Normal, 8, 8)
            .unwrap_err();
        assert!(matches!(err, ExplainError::Degenerate(_)));
    }

    #[test]
    fn pixel_gradient_follows_image_edges() {
        let model = StubModel::new(PROBS);
        let step = tensor(|_, x| if x < 112 { 0.1 } else { 0.9 });
        let out = PixelGradient::new(2.5)
            .attend(&model, &step, Disease::Normal, 224, 224)
            .unwrap();
        assert_eq!(out.source, LUMINANCE_SOURCE);
        assert!(out.map[[100, 111]] > 0.9);
        assert!(out.map[[100, 20]] < 0.05);
        assert_eq!(model.predict_calls(), 0);
    }

    #[test]
    fn build_keeps_order_and_skips_unknown_names() {
        let names = vec!["pixel-gradient".to_string(), "lime".to_string(), "grad-cam".to_string()];
        let chain = build(&names, None, 2.5);
        let built: Vec<&str> = chain.iter().map(|s| s.name()).collect();
        assert_eq!(built, vec![PIXEL_GRADIENT, GRAD_CAM]);
    }
}
