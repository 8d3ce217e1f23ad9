pub mod native;
#[cfg(test)]
pub(crate) mod stub;
#[cfg(feature = "torch")]
pub mod torch;

use ndarray::Array3;
use serde::Serialize;
use shared::Disease;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use crate::config::{BackendKind, ModelConfig};
use crate::explain::ExplainError;
use crate::preprocess::{CHANNELS, NormalizedTensor, TARGET_SIZE};

pub use native::{Architecture, RetinaCnn};

pub const NUM_CLASSES: usize = 6;
const SUM_TOLERANCE: f32 = 1e-4;

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("Model is not loaded")]
    Unavailable,
    #[error("Failed to read model file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid weights: {0}")]
    InvalidWeights(String),
    #[error("Backend error: {0}")]
    Backend(String),
    #[error("Model produced {0} outputs, expected {NUM_CLASSES}")]
    OutputShape(usize),
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelMetadata {
    pub name: String,
    pub version: String,
    pub architecture: String,
    pub input_shape: [usize; 3],
    pub class_names: Vec<Disease>,
    /// Layer Grad-CAM uses when none is configured.
    pub gradcam_layer: Option<String>,
    /// False when the weights were generated rather than loaded.
    pub trained: bool,
}

impl ModelMetadata {
    pub fn new(name: impl Into<String>, version: impl Into<String>, architecture: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            architecture: architecture.into(),
            input_shape: [TARGET_SIZE, TARGET_SIZE, CHANNELS],
            class_names: Disease::ALL.to_vec(),
            gradcam_layer: None,
            trained: true,
        }
    }

    pub fn to_response(&self) -> shared::ModelInfoResponse {
        shared::ModelInfoResponse {
            name: self.name.clone(),
            version: self.version.clone(),
            architecture: self.architecture.clone(),
            input_shape: self.input_shape,
            num_classes: self.class_names.len(),
            class_names: self.class_names.clone(),
            gradcam_layer: self.gradcam_layer.clone(),
            trained: self.trained,
        }
    }
}

/// Probabilities for the six classes in canonical order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassDistribution {
    probabilities: [f32; NUM_CLASSES],
}

impl ClassDistribution {
    pub fn from_probabilities(values: &[f32]) -> Result<Self, ModelError> {
        if values.len() != NUM_CLASSES {
            return Err(ModelError::OutputShape(values.len()));
        }
        if values.iter().any(|p| !p.is_finite() || *p < 0.0) {
            return Err(ModelError::Backend(format!(
                "non-finite or negative probability in {values:?}"
            )));
        }
        let sum: f32 = values.iter().sum();
        if (sum - 1.0).abs() > SUM_TOLERANCE {
            return Err(ModelError::Backend(format!(
                "probabilities sum to {sum}, expected 1"
            )));
        }
        let mut probabilities = [0f32; NUM_CLASSES];
        probabilities.copy_from_slice(values);
        Ok(Self { probabilities })
    }

    /// Numerically stable softmax over raw scores.
    pub fn from_logits(logits: &[f32]) -> Result<Self, ModelError> {
        if logits.len() != NUM_CLASSES {
            return Err(ModelError::OutputShape(logits.len()));
        }
        if logits.iter().any(|v| !v.is_finite()) {
            return Err(ModelError::Backend(format!("non-finite logits {logits:?}")));
        }
        let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exp: Vec<f64> = logits.iter().map(|&v| ((v - max) as f64).exp()).collect();
        let sum: f64 = exp.iter().sum();
        let probabilities: Vec<f32> = exp.iter().map(|e| (e / sum) as f32).collect();
        Self::from_probabilities(&probabilities)
    }

    pub fn as_array(&self) -> &[f32; NUM_CLASSES] {
        &self.probabilities
    }

    /// Argmax; ties resolve to the earlier class.
    pub fn top(&self) -> (Disease, f32) {
        let mut best = 0;
        for (i, &p) in self.probabilities.iter().enumerate() {
            if p > self.probabilities[best] {
                best = i;
            }
        }
        (Disease::ALL[best], self.probabilities[best])
    }

    /// Sorted by descending probability, stable for ties.
    pub fn ranked(&self) -> Vec<(Disease, f32)> {
        let mut ranked: Vec<(Disease, f32)> = Disease::ALL
            .iter()
            .map(|d| (*d, self.probabilities[d.index()]))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        ranked
    }
}

/// Activations of one spatial layer and the gradient of a class score with
/// respect to them, both `(channels, height, width)`.
#[derive(Debug, Clone)]
pub struct LayerGradient {
    pub activations: Array3<f32>,
    pub gradients: Array3<f32>,
}

pub trait Classifier: Send + Sync {
    fn metadata(&self) -> &ModelMetadata;

    fn predict(&self, tensor: &NormalizedTensor) -> Result<ClassDistribution, ModelError>;

    fn layer_names(&self) -> Vec<String> {
        Vec::new()
    }

    /// Gradient of the pre-softmax score of `class` with respect to the
    /// output of `layer`.
    fn activation_gradient(
        &self,
        _tensor: &NormalizedTensor,
        _layer: &str,
        _class: Disease,
    ) -> Result<LayerGradient, ExplainError> {
        Err(ExplainError::GradientUnsupported(self.metadata().name.clone()))
    }
}

/// Write-once holder for the process-wide model.
#[derive(Clone, Default)]
pub struct ModelSlot {
    inner: Arc<OnceLock<Arc<dyn Classifier>>>,
}

impl ModelSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(model: Arc<dyn Classifier>) -> Self {
        let slot = Self::new();
        let _ = slot.inner.set(model);
        slot
    }

    /// Returns false when the slot was already filled.
    pub fn fill(&self, model: Arc<dyn Classifier>) -> bool {
        self.inner.set(model).is_ok()
    }

    pub fn get(&self) -> Option<Arc<dyn Classifier>> {
        self.inner.get().cloned()
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.get().is_some()
    }
}

#[derive(Clone)]
pub struct InferenceEngine {
    slot: ModelSlot,
}

impl InferenceEngine {
    pub fn new(slot: ModelSlot) -> Self {
        Self { slot }
    }

    pub fn model(&self) -> Result<Arc<dyn Classifier>, ModelError> {
        self.slot.get().ok_or(ModelError::Unavailable)
    }

    pub fn is_ready(&self) -> bool {
        self.slot.is_loaded()
    }

    pub fn predict(&self, tensor: &NormalizedTensor) -> Result<ClassDistribution, ModelError> {
        let model = self.model()?;
        let distribution = model.predict(tensor)?;
        // Backends may build the distribution themselves; re-check the sum.
        ClassDistribution::from_probabilities(distribution.as_array())
    }
}

/// Loads the configured backend from disk.
pub fn load(config: &ModelConfig) -> Result<Arc<dyn Classifier>, ModelError> {
    match config.backend {
        BackendKind::Native => Ok(Arc::new(RetinaCnn::load(&config.weights_path)?)),
        #[cfg(feature = "torch")]
        BackendKind::Torch => Ok(Arc::new(torch::TorchScriptModel::load(&config.weights_path)?)),
        #[cfg(not(feature = "torch"))]
        BackendKind::Torch => Err(ModelError::Backend(
            "torch backend requested but the binary was built without the `torch` feature"
                .to_string(),
        )),
    }
}
