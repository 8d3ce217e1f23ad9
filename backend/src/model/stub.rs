//! Deterministic classifier used by unit tests across the crate.

use shared::Disease;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{ClassDistribution, Classifier, LayerGradient, ModelError, ModelMetadata};
use crate::explain::ExplainError;
use crate::preprocess::NormalizedTensor;

pub(crate) const STUB_LAYER: &str = "stub_conv";

pub(crate) struct StubModel {
    metadata: ModelMetadata,
    probabilities: [f32; 6],
    gradient: Option<LayerGradient>,
    calls: AtomicUsize,
}

impl StubModel {
    pub(crate) fn new(probabilities: [f32; 6]) -> Self {
        let mut metadata = ModelMetadata::new("StubModel", "0.0.0", "stub");
        metadata.gradcam_layer = Some(STUB_LAYER.to_string());
        Self {
            metadata,
            probabilities,
            gradient: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn with_gradient(mut self, gradient: LayerGradient) -> Self {
        self.gradient = Some(gradient);
        self
    }

    pub(crate) fn predict_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Classifier for StubModel {
    fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    fn predict(&self, _tensor: &NormalizedTensor) -> Result<ClassDistribution, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        ClassDistribution::from_probabilities(&self.probabilities)
    }

    fn layer_names(&self) -> Vec<String> {
        vec![STUB_LAYER.to_string()]
    }

    fn activation_gradient(
        &self,
        _tensor: &NormalizedTensor,
        layer: &str,
        _class: Disease,
    ) -> Result<LayerGradient, ExplainError> {
        match &self.gradient {
            Some(g) if layer == STUB_LAYER => Ok(g.clone()),
            Some(_) => Err(ExplainError::LayerNotFound(layer.to_string())),
            None => Err(ExplainError::GradientUnsupported(self.metadata.name.clone())),
        }
    }
}
