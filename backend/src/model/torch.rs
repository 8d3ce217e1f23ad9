//! TorchScript backend. Enabled with the `torch` feature.
//!
//! The module's `forward` takes a `[1, 3, 224, 224]` float tensor. Grad-CAM
//! is available when the script also exports `features` (input to the last
//! conv feature map) and `head` (feature map to logits).

use ndarray::Array3;
use shared::Disease;
use std::path::Path;
use std::sync::Mutex;
use tch::{CModule, Device, Kind, Tensor};

use super::{ClassDistribution, Classifier, LayerGradient, ModelError, ModelMetadata, NUM_CLASSES};
use crate::explain::ExplainError;
use crate::preprocess::{CHANNELS, NormalizedTensor, TARGET_SIZE};

pub const FEATURES_LAYER: &str = "features";

pub struct TorchScriptModel {
    module: Mutex<CModule>,
    device: Device,
    metadata: ModelMetadata,
}

impl TorchScriptModel {
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        std::fs::metadata(path).map_err(|source| ModelError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let device = Device::cuda_if_available();
        let module = CModule::load_on_device(path, device).map_err(|e| ModelError::Backend(e.to_string()))?;
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "torchscript".to_string());
        let mut metadata = ModelMetadata::new(stem, "1.0.0", "torchscript");
        metadata.gradcam_layer = Some(FEATURES_LAYER.to_string());
        log::info!("Loaded TorchScript module {} on {:?}", path.display(), device);
        Ok(Self {
            module: Mutex::new(module),
            device,
            metadata,
        })
    }

    fn input(&self, tensor: &NormalizedTensor) -> Result<Tensor, ModelError> {
        let chw = tensor.to_chw();
        let values = chw
            .as_slice()
            .ok_or_else(|| ModelError::Backend("non-contiguous input tensor".to_string()))?;
        Ok(Tensor::from_slice(values)
            .view([1, CHANNELS as i64, TARGET_SIZE as i64, TARGET_SIZE as i64])
            .to_device(self.device))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, CModule>, ModelError> {
        self.module
            .lock()
            .map_err(|_| ModelError::Backend("module mutex poisoned".to_string()))
    }
}

fn to_vec(tensor: &Tensor) -> Result<Vec<f32>, ModelError> {
    tensor
        .to_kind(Kind::Float)
        .to_device(Device::Cpu)
        .view([-1])
        .try_into()
        .map_err(|e: tch::TchError| ModelError::Backend(e.to_string()))
}

fn to_chw(tensor: &Tensor) -> Result<Array3<f32>, ModelError> {
    let size = tensor.size();
    let &[1, c, h, w] = size.as_slice() else {
        return Err(ModelError::Backend(format!("expected [1, C, H, W], got {size:?}")));
    };
    Array3::from_shape_vec((c as usize, h as usize, w as usize), to_vec(tensor)?)
        .map_err(|e| ModelError::Backend(e.to_string()))
}

impl Classifier for TorchScriptModel {
    fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    fn predict(&self, tensor: &NormalizedTensor) -> Result<ClassDistribution, ModelError> {
        let input = self.input(tensor)?;
        let module = self.lock()?;
        let output = tch::no_grad(|| module.forward_ts(&[input])).map_err(|e| ModelError::Backend(e.to_string()))?;
        let values = to_vec(&output)?;
        if values.len() != NUM_CLASSES {
            return Err(ModelError::OutputShape(values.len()));
        }
        // Scripts exported with a trailing softmax already yield probabilities.
        let sum: f32 = values.iter().sum();
        if values.iter().all(|v| *v >= 0.0) && (sum - 1.0).abs() < 1e-4 {
            ClassDistribution::from_probabilities(&values)
        } else {
            ClassDistribution::from_logits(&values)
        }
    }

    fn layer_names(&self) -> Vec<String> {
        vec![FEATURES_LAYER.to_string()]
    }

    fn activation_gradient(
        &self,
        tensor: &NormalizedTensor,
        layer: &str,
        class: Disease,
    ) -> Result<LayerGradient, ExplainError> {
        if layer != FEATURES_LAYER {
            return Err(ExplainError::LayerNotFound(layer.to_string()));
        }
        let backend = |e: tch::TchError| ExplainError::Backend(e.to_string());
        let input = self.input(tensor).map_err(|e| ExplainError::Backend(e.to_string()))?;
        let module = self.lock().map_err(|e| ExplainError::Backend(e.to_string()))?;

        let features = module
            .method_ts("features", &[input])
            .map_err(|e| ExplainError::GradientUnsupported(e.to_string()))?
            .detach()
            .set_requires_grad(true);
        let logits = module
            .method_ts("head", &[features.shallow_clone()])
            .map_err(|e| ExplainError::GradientUnsupported(e.to_string()))?;
        let score = logits.view([-1]).get(class.index() as i64);
        let gradients = Tensor::f_run_backward(&[&score], &[&features], false, false).map_err(backend)?;
        let gradient = gradients
            .first()
            .ok_or_else(|| ExplainError::Backend("no gradient returned".to_string()))?;

        let activations = to_chw(&features.detach()).map_err(|e| ExplainError::NotSpatial(e.to_string()))?;
        let gradients = to_chw(gradient).map_err(|e| ExplainError::Backend(e.to_string()))?;
        Ok(LayerGradient {
            activations,
            gradients,
        })
    }
}
