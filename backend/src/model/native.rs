//! Pure ndarray implementation of the fundus CNN.
//!
//! Feature maps are `(channels, height, width)`. Flat activations after
//! global pooling are kept as `(units, 1, 1)` so every layer has the same
//! shape type. Convolutions are 3x3, stride 1, zero "same" padding and run
//! as a single matrix product over an im2col buffer.

use ndarray::{Array1, Array2, Array3, Axis, Zip};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use shared::Disease;
use std::collections::HashMap;
use std::path::Path;

use super::{ClassDistribution, Classifier, LayerGradient, ModelError, ModelMetadata, NUM_CLASSES};
use crate::explain::ExplainError;
use crate::preprocess::{CHANNELS, NormalizedTensor};

pub const MODEL_NAME: &str = "RetinaCNN";
const DEFAULT_VERSION: &str = "1.0.0";
/// Keras BatchNormalization default.
const BN_EPSILON: f32 = 1e-3;
const KERNEL: usize = 3;
const TAPS: usize = KERNEL * KERNEL;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Architecture {
    pub block_channels: Vec<usize>,
    pub dense_units: Vec<usize>,
}

impl Default for Architecture {
    fn default() -> Self {
        Self {
            block_channels: vec![32, 64, 128, 256],
            dense_units: vec![512, 256],
        }
    }
}

impl Architecture {
    /// Same topology at a fraction of the width, for tests and smoke runs.
    pub fn tiny() -> Self {
        Self {
            block_channels: vec![4, 8, 8, 8],
            dense_units: vec![16, 8],
        }
    }

    pub fn describe(&self) -> String {
        let join = |v: &[usize]| {
            v.iter()
                .map(|n| n.to_string())
                .collect::<Vec<_>>()
                .join("-")
        };
        format!(
            "conv[{}] gap dense[{}] softmax[{}]",
            join(&self.block_channels),
            join(&self.dense_units),
            NUM_CLASSES
        )
    }

    fn validate(&self) -> Result<(), ModelError> {
        if self.block_channels.is_empty() || self.block_channels.contains(&0) {
            return Err(ModelError::InvalidWeights(
                "at least one conv block with non-zero width is required".to_string(),
            ));
        }
        if self.dense_units.contains(&0) {
            return Err(ModelError::InvalidWeights("dense width must be non-zero".to_string()));
        }
        Ok(())
    }
}

struct Conv2d {
    /// `(out, in * 9)`, columns ordered channel-major then kernel row, col.
    kernel: Array2<f32>,
    bias: Array1<f32>,
}

struct BatchNorm {
    gamma: Array1<f32>,
    beta: Array1<f32>,
    moving_mean: Array1<f32>,
    moving_variance: Array1<f32>,
    scale: Array1<f32>,
    shift: Array1<f32>,
}

impl BatchNorm {
    fn new(gamma: Array1<f32>, beta: Array1<f32>, moving_mean: Array1<f32>, moving_variance: Array1<f32>) -> Self {
        let scale = Zip::from(&gamma)
            .and(&moving_variance)
            .map_collect(|&g, &v| g / (v + BN_EPSILON).sqrt());
        let shift = Zip::from(&beta)
            .and(&moving_mean)
            .and(&scale)
            .map_collect(|&b, &m, &s| b - m * s);
        Self {
            gamma,
            beta,
            moving_mean,
            moving_variance,
            scale,
            shift,
        }
    }

    fn identity(channels: usize) -> Self {
        Self::new(
            Array1::ones(channels),
            Array1::zeros(channels),
            Array1::zeros(channels),
            Array1::ones(channels),
        )
    }
}

struct Dense {
    /// `(out, in)`.
    weight: Array2<f32>,
    bias: Array1<f32>,
}

enum Op {
    /// Convolution followed by ReLU.
    Conv(Conv2d),
    Norm(BatchNorm),
    MaxPool,
    Dropout,
    GlobalPool,
    Dense { dense: Dense, relu: bool },
}

struct Layer {
    name: String,
    op: Op,
}

/// Outputs of every layer from one forward pass, `outputs[0]` being the
/// input itself.
struct Tape {
    outputs: Vec<Array3<f32>>,
    argmax: Vec<Option<Vec<usize>>>,
}

pub struct RetinaCnn {
    architecture: Architecture,
    layers: Vec<Layer>,
    metadata: ModelMetadata,
}

impl RetinaCnn {
    /// He-uniform kernels, zero biases, identity batch-norm statistics.
    pub fn initialize(architecture: &Architecture, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut he = |rows: usize, cols: usize, fan_in: usize| {
            let limit = (6.0 / fan_in as f32).sqrt();
            Array2::from_shape_simple_fn((rows, cols), || rng.random_range(-limit..limit))
        };

        let mut layers = Vec::new();
        let mut channels = CHANNELS;
        for (b, &width) in architecture.block_channels.iter().enumerate() {
            let conv1 = Conv2d {
                kernel: he(width, channels * TAPS, channels * TAPS),
                bias: Array1::zeros(width),
            };
            let conv2 = Conv2d {
                kernel: he(width, width * TAPS, width * TAPS),
                bias: Array1::zeros(width),
            };
            push_block(&mut layers, b + 1, conv1, BatchNorm::identity(width), conv2);
            channels = width;
        }
        layers.push(Layer {
            name: "global_pool".to_string(),
            op: Op::GlobalPool,
        });
        let mut units = channels;
        for (d, &width) in architecture.dense_units.iter().enumerate() {
            let dense = Dense {
                weight: he(width, units, units),
                bias: Array1::zeros(width),
            };
            push_dense(&mut layers, d + 1, dense, BatchNorm::identity(width));
            units = width;
        }
        layers.push(Layer {
            name: "predictions".to_string(),
            op: Op::Dense {
                dense: Dense {
                    weight: he(NUM_CLASSES, units, units),
                    bias: Array1::zeros(NUM_CLASSES),
                },
                relu: false,
            },
        });

        let mut metadata = Self::metadata_for(architecture, "untrained");
        metadata.trained = false;
        Self {
            architecture: architecture.clone(),
            layers,
            metadata,
        }
    }

    /// Loads a safetensors file; the architecture is inferred from the
    /// tensor shapes.
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let bytes = std::fs::read(path).map_err(|source| ModelError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let model = Self::from_bytes(&bytes)?;
        log::info!(
            "Loaded {} v{} ({}) from {}",
            model.metadata.name,
            model.metadata.version,
            model.architecture.describe(),
            path.display()
        );
        Ok(model)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ModelError> {
        let invalid = |e: safetensors::SafeTensorError| ModelError::InvalidWeights(e.to_string());
        let (_, header) = SafeTensors::read_metadata(bytes).map_err(invalid)?;
        let info = header.metadata().clone().unwrap_or_default();
        let tensors = SafeTensors::deserialize(bytes).map_err(invalid)?;
        let reader = WeightReader { tensors: &tensors };

        let mut layers = Vec::new();
        let mut architecture = Architecture {
            block_channels: Vec::new(),
            dense_units: Vec::new(),
        };
        let mut channels = CHANNELS;
        let mut b = 1;
        while let Some(shape) = reader.shape(&format!("block{b}_conv1.weight")) {
            let width = shape.first().copied().unwrap_or(0);
            let conv1 = reader.conv(&format!("block{b}_conv1"), width, channels)?;
            let bn = reader.norm(&format!("block{b}_bn"), width)?;
            let conv2 = reader.conv(&format!("block{b}_conv2"), width, width)?;
            push_block(&mut layers, b, conv1, bn, conv2);
            architecture.block_channels.push(width);
            channels = width;
            b += 1;
        }
        layers.push(Layer {
            name: "global_pool".to_string(),
            op: Op::GlobalPool,
        });
        let mut units = channels;
        let mut d = 1;
        while let Some(shape) = reader.shape(&format!("dense{d}.weight")) {
            let width = shape.first().copied().unwrap_or(0);
            let dense = reader.dense(&format!("dense{d}"), width, units)?;
            let bn = reader.norm(&format!("dense{d}_bn"), width)?;
            push_dense(&mut layers, d, dense, bn);
            architecture.dense_units.push(width);
            units = width;
            d += 1;
        }
        layers.push(Layer {
            name: "predictions".to_string(),
            op: Op::Dense {
                dense: reader.dense("predictions", NUM_CLASSES, units)?,
                relu: false,
            },
        });
        architecture.validate()?;

        let version = info
            .get("version")
            .cloned()
            .unwrap_or_else(|| DEFAULT_VERSION.to_string());
        let mut metadata = Self::metadata_for(&architecture, &version);
        metadata.trained = info.get("trained").is_none_or(|v| v != "false");
        Ok(Self {
            architecture,
            layers,
            metadata,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        let mut entries: Vec<(String, Vec<usize>, Vec<u8>)> = Vec::new();
        let mut add = |key: String, shape: Vec<usize>, values: &[f32]| {
            let bytes = values.iter().flat_map(|v| v.to_le_bytes()).collect();
            entries.push((key, shape, bytes));
        };
        for layer in &self.layers {
            let name = &layer.name;
            match &layer.op {
                Op::Conv(conv) => {
                    let (out, cols) = conv.kernel.dim();
                    let kernel = conv.kernel.as_standard_layout();
                    add(
                        format!("{name}.weight"),
                        vec![out, cols / TAPS, KERNEL, KERNEL],
                        kernel.as_slice().unwrap_or(&[]),
                    );
                    add(format!("{name}.bias"), vec![out], &conv.bias.to_vec());
                }
                Op::Dense { dense, .. } => {
                    let weight = dense.weight.as_standard_layout();
                    add(
                        format!("{name}.weight"),
                        dense.weight.shape().to_vec(),
                        weight.as_slice().unwrap_or(&[]),
                    );
                    add(format!("{name}.bias"), vec![dense.bias.len()], &dense.bias.to_vec());
                }
                Op::Norm(bn) => {
                    let n = bn.gamma.len();
                    add(format!("{name}.gamma"), vec![n], &bn.gamma.to_vec());
                    add(format!("{name}.beta"), vec![n], &bn.beta.to_vec());
                    add(format!("{name}.moving_mean"), vec![n], &bn.moving_mean.to_vec());
                    add(format!("{name}.moving_variance"), vec![n], &bn.moving_variance.to_vec());
                }
                Op::MaxPool | Op::Dropout | Op::GlobalPool => {}
            }
        }

        let views = entries
            .iter()
            .map(|(key, shape, bytes)| {
                TensorView::new(Dtype::F32, shape.clone(), bytes)
                    .map(|view| (key.clone(), view))
                    .map_err(|e| ModelError::InvalidWeights(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let info: HashMap<String, String> = HashMap::from([
            ("name".to_string(), self.metadata.name.clone()),
            ("version".to_string(), self.metadata.version.clone()),
            ("trained".to_string(), self.metadata.trained.to_string()),
        ]);
        safetensors::serialize_to_file(views, &Some(info), path)
            .map_err(|e| ModelError::InvalidWeights(e.to_string()))
    }

    pub fn architecture(&self) -> &Architecture {
        &self.architecture
    }

    fn metadata_for(architecture: &Architecture, version: &str) -> ModelMetadata {
        let mut metadata = ModelMetadata::new(MODEL_NAME, version, architecture.describe());
        metadata.gradcam_layer = Some(format!("block{}_conv2", architecture.block_channels.len()));
        metadata
    }

    pub(crate) fn layer_index(&self, name: &str) -> Option<usize> {
        self.layers.iter().position(|l| l.name == name)
    }

    fn is_spatial(&self, index: usize) -> bool {
        self.layers[..=index]
            .iter()
            .all(|l| !matches!(l.op, Op::GlobalPool | Op::Dense { .. }))
    }

    /// Runs `layers[start..]` on `input` and returns the logits.
    pub(crate) fn forward_from(&self, start: usize, input: Array3<f32>) -> Result<Vec<f32>, ModelError> {
        let mut x = input;
        for layer in &self.layers[start..] {
            x = forward(layer, &x)?.0;
        }
        Ok(x.iter().copied().collect())
    }

    fn forward_taped(&self, input: Array3<f32>) -> Result<Tape, ModelError> {
        let mut tape = Tape {
            outputs: Vec::with_capacity(self.layers.len() + 1),
            argmax: Vec::with_capacity(self.layers.len()),
        };
        tape.outputs.push(input);
        for layer in &self.layers {
            let (output, argmax) = forward(layer, &tape.outputs[tape.outputs.len() - 1])?;
            tape.outputs.push(output);
            tape.argmax.push(argmax);
        }
        Ok(tape)
    }

    /// Gradient of the `class` logit with respect to the output of
    /// `layers[index]`.
    pub(crate) fn layer_gradient(
        &self,
        tensor: &NormalizedTensor,
        index: usize,
        class: Disease,
    ) -> Result<LayerGradient, ModelError> {
        let tape = self.forward_taped(tensor.to_chw())?;
        let logits = &tape.outputs[self.layers.len()];
        if logits.len() != NUM_CLASSES {
            return Err(ModelError::OutputShape(logits.len()));
        }
        let mut grad = Array3::<f32>::zeros(logits.dim());
        grad[[class.index(), 0, 0]] = 1.0;
        for i in (index + 1..self.layers.len()).rev() {
            grad = backward(&self.layers[i], &grad, &tape, i)?;
        }
        Ok(LayerGradient {
            activations: tape.outputs[index + 1].clone(),
            gradients: grad,
        })
    }
}

impl Classifier for RetinaCnn {
    fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    fn predict(&self, tensor: &NormalizedTensor) -> Result<ClassDistribution, ModelError> {
        let logits = self.forward_from(0, tensor.to_chw())?;
        ClassDistribution::from_logits(&logits)
    }

    fn layer_names(&self) -> Vec<String> {
        self.layers.iter().map(|l| l.name.clone()).collect()
    }

    fn activation_gradient(
        &self,
        tensor: &NormalizedTensor,
        layer: &str,
        class: Disease,
    ) -> Result<LayerGradient, ExplainError> {
        let index = self
            .layer_index(layer)
            .ok_or_else(|| ExplainError::LayerNotFound(layer.to_string()))?;
        if !self.is_spatial(index) {
            return Err(ExplainError::NotSpatial(layer.to_string()));
        }
        self.layer_gradient(tensor, index, class)
            .map_err(|e| ExplainError::Backend(e.to_string()))
    }
}

fn push_block(layers: &mut Vec<Layer>, b: usize, conv1: Conv2d, bn: BatchNorm, conv2: Conv2d) {
    let named = |suffix: &str, op: Op| Layer {
        name: format!("block{b}_{suffix}"),
        op,
    };
    layers.push(named("conv1", Op::Conv(conv1)));
    layers.push(named("bn", Op::Norm(bn)));
    layers.push(named("conv2", Op::Conv(conv2)));
    layers.push(named("pool", Op::MaxPool));
    layers.push(named("dropout", Op::Dropout));
}

fn push_dense(layers: &mut Vec<Layer>, d: usize, dense: Dense, bn: BatchNorm) {
    layers.push(Layer {
        name: format!("dense{d}"),
        op: Op::Dense { dense, relu: true },
    });
    layers.push(Layer {
        name: format!("dense{d}_bn"),
        op: Op::Norm(bn),
    });
    layers.push(Layer {
        name: format!("dense{d}_dropout"),
        op: Op::Dropout,
    });
}

fn shape_error(layer: &str, detail: String) -> ModelError {
    ModelError::Backend(format!("{layer}: {detail}"))
}

fn relu(v: f32) -> f32 {
    v.max(0.0)
}

fn forward(layer: &Layer, input: &Array3<f32>) -> Result<(Array3<f32>, Option<Vec<usize>>), ModelError> {
    let (c, h, w) = input.dim();
    match &layer.op {
        Op::Conv(conv) => {
            if conv.kernel.ncols() != c * TAPS {
                return Err(shape_error(
                    &layer.name,
                    format!("expects {} input channels, got {c}", conv.kernel.ncols() / TAPS),
                ));
            }
            let mut out = conv.kernel.dot(&im2col(input));
            out += &conv.bias.view().insert_axis(Axis(1));
            out.mapv_inplace(relu);
            let out = out
                .into_shape_with_order((conv.bias.len(), h, w))
                .map_err(|e| shape_error(&layer.name, e.to_string()))?;
            Ok((out, None))
        }
        Op::Norm(bn) => {
            if bn.scale.len() != c {
                return Err(shape_error(&layer.name, format!("{c} channels, {} statistics", bn.scale.len())));
            }
            let mut out = input.clone();
            for (ci, mut channel) in out.axis_iter_mut(Axis(0)).enumerate() {
                let (s, t) = (bn.scale[ci], bn.shift[ci]);
                channel.mapv_inplace(|v| v * s + t);
            }
            Ok((out, None))
        }
        Op::MaxPool => {
            let (oh, ow) = (h / 2, w / 2);
            if oh == 0 || ow == 0 {
                return Err(shape_error(&layer.name, format!("feature map {h}x{w} too small to pool")));
            }
            let mut out = Array3::<f32>::zeros((c, oh, ow));
            let mut argmax = Vec::with_capacity(c * oh * ow);
            for ci in 0..c {
                for y in 0..oh {
                    for x in 0..ow {
                        let mut best = (2 * y, 2 * x);
                        for (dy, dx) in [(0, 1), (1, 0), (1, 1)] {
                            let (sy, sx) = (2 * y + dy, 2 * x + dx);
                            if input[[ci, sy, sx]] > input[[ci, best.0, best.1]] {
                                best = (sy, sx);
                            }
                        }
                        out[[ci, y, x]] = input[[ci, best.0, best.1]];
                        argmax.push((ci * h + best.0) * w + best.1);
                    }
                }
            }
            Ok((out, Some(argmax)))
        }
        Op::Dropout => Ok((input.clone(), None)),
        Op::GlobalPool => {
            let area = (h * w).max(1) as f32;
            let means = input.sum_axis(Axis(2)).sum_axis(Axis(1)) / area;
            let out = means
                .into_shape_with_order((c, 1, 1))
                .map_err(|e| shape_error(&layer.name, e.to_string()))?;
            Ok((out, None))
        }
        Op::Dense { dense, relu: with_relu } => {
            if dense.weight.ncols() != input.len() {
                return Err(shape_error(
                    &layer.name,
                    format!("expects {} inputs, got {}", dense.weight.ncols(), input.len()),
                ));
            }
            let x: Array1<f32> = input.iter().copied().collect();
            let mut y = dense.weight.dot(&x) + &dense.bias;
            if *with_relu {
                y.mapv_inplace(relu);
            }
            let units = y.len();
            let out = y
                .into_shape_with_order((units, 1, 1))
                .map_err(|e| shape_error(&layer.name, e.to_string()))?;
            Ok((out, None))
        }
    }
}

/// Propagates `grad` (w.r.t. the output of layer `index`) to the layer's
/// input.
fn backward(layer: &Layer, grad: &Array3<f32>, tape: &Tape, index: usize) -> Result<Array3<f32>, ModelError> {
    let input = &tape.outputs[index];
    let output = &tape.outputs[index + 1];
    let (c, h, w) = input.dim();
    match &layer.op {
        Op::Conv(conv) => {
            let masked = Zip::from(grad)
                .and(output)
                .map_collect(|&g, &o| if o > 0.0 { g } else { 0.0 });
            let out_channels = conv.bias.len();
            let flat = masked
                .into_shape_with_order((out_channels, h * w))
                .map_err(|e| shape_error(&layer.name, e.to_string()))?;
            Ok(col2im(&conv.kernel.t().dot(&flat), c, h, w))
        }
        Op::Norm(bn) => {
            let mut out = grad.clone();
            for (ci, mut channel) in out.axis_iter_mut(Axis(0)).enumerate() {
                let s = bn.scale[ci];
                channel.mapv_inplace(|g| g * s);
            }
            Ok(out)
        }
        Op::MaxPool => {
            let argmax = tape.argmax[index]
                .as_ref()
                .ok_or_else(|| shape_error(&layer.name, "missing pooling indices".to_string()))?;
            let mut out = Array3::<f32>::zeros((c, h, w));
            {
                let flat = out
                    .as_slice_mut()
                    .ok_or_else(|| shape_error(&layer.name, "non-contiguous gradient".to_string()))?;
                for (&target, &g) in argmax.iter().zip(grad.iter()) {
                    flat[target] += g;
                }
            }
            Ok(out)
        }
        Op::Dropout => Ok(grad.clone()),
        Op::GlobalPool => {
            let area = (h * w).max(1) as f32;
            Ok(Array3::from_shape_fn((c, h, w), |(ci, _, _)| grad[[ci, 0, 0]] / area))
        }
        Op::Dense { dense, relu: with_relu } => {
            let g: Array1<f32> = grad
                .iter()
                .zip(output.iter())
                .map(|(&g, &o)| if !*with_relu || o > 0.0 { g } else { 0.0 })
                .collect();
            let dx = dense.weight.t().dot(&g);
            dx.into_shape_with_order((c, h, w))
                .map_err(|e| shape_error(&layer.name, e.to_string()))
        }
    }
}

fn im2col(input: &Array3<f32>) -> Array2<f32> {
    let (c, h, w) = input.dim();
    let mut cols = Array2::<f32>::zeros((c * TAPS, h * w));
    for ci in 0..c {
        for ky in 0..KERNEL {
            for kx in 0..KERNEL {
                let mut row = cols.row_mut(ci * TAPS + ky * KERNEL + kx);
                for y in 0..h {
                    let Some(sy) = (y + ky).checked_sub(1).filter(|&sy| sy < h) else {
                        continue;
                    };
                    for x in 0..w {
                        if let Some(sx) = (x + kx).checked_sub(1).filter(|&sx| sx < w) {
                            row[y * w + x] = input[[ci, sy, sx]];
                        }
                    }
                }
            }
        }
    }
    cols
}

/// Adjoint of `im2col`.
fn col2im(cols: &Array2<f32>, c: usize, h: usize, w: usize) -> Array3<f32> {
    let mut out = Array3::<f32>::zeros((c, h, w));
    for ci in 0..c {
        for ky in 0..KERNEL {
            for kx in 0..KERNEL {
                let row = cols.row(ci * TAPS + ky * KERNEL + kx);
                for y in 0..h {
                    let Some(sy) = (y + ky).checked_sub(1).filter(|&sy| sy < h) else {
                        continue;
                    };
                    for x in 0..w {
                        if let Some(sx) = (x + kx).checked_sub(1).filter(|&sx| sx < w) {
                            out[[ci, sy, sx]] += row[y * w + x];
                        }
                    }
                }
            }
        }
    }
    out
}

struct WeightReader<'a, 'data> {
    tensors: &'a SafeTensors<'data>,
}

impl WeightReader<'_, '_> {
    fn shape(&self, key: &str) -> Option<Vec<usize>> {
        self.tensors.tensor(key).ok().map(|t| t.shape().to_vec())
    }

    fn read(&self, key: &str, expected: &[usize]) -> Result<Vec<f32>, ModelError> {
        let view = self
            .tensors
            .tensor(key)
            .map_err(|_| ModelError::InvalidWeights(format!("missing tensor {key}")))?;
        if view.dtype() != Dtype::F32 {
            return Err(ModelError::InvalidWeights(format!(
                "{key} has dtype {:?}, expected F32",
                view.dtype()
            )));
        }
        if view.shape() != expected {
            return Err(ModelError::InvalidWeights(format!(
                "{key} has shape {:?}, expected {expected:?}",
                view.shape()
            )));
        }
        Ok(view
            .data()
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect())
    }

    fn vector(&self, key: &str, len: usize) -> Result<Array1<f32>, ModelError> {
        Ok(Array1::from(self.read(key, &[len])?))
    }

    fn matrix(&self, key: &str, shape: &[usize], rows: usize, cols: usize) -> Result<Array2<f32>, ModelError> {
        Array2::from_shape_vec((rows, cols), self.read(key, shape)?)
            .map_err(|e| ModelError::InvalidWeights(format!("{key}: {e}")))
    }

    fn conv(&self, name: &str, out: usize, inp: usize) -> Result<Conv2d, ModelError> {
        Ok(Conv2d {
            kernel: self.matrix(&format!("{name}.weight"), &[out, inp, KERNEL, KERNEL], out, inp * TAPS)?,
            bias: self.vector(&format!("{name}.bias"), out)?,
        })
    }

    fn dense(&self, name: &str, out: usize, inp: usize) -> Result<Dense, ModelError> {
        Ok(Dense {
            weight: self.matrix(&format!("{name}.weight"), &[out, inp], out, inp)?,
            bias: self.vector(&format!("{name}.bias"), out)?,
        })
    }

    fn norm(&self, name: &str, len: usize) -> Result<BatchNorm, ModelError> {
        let variance = self.vector(&format!("{name}.moving_variance"), len)?;
        if variance.iter().any(|v| !(*v >= 0.0)) {
            return Err(ModelError::InvalidWeights(format!("{name} has negative variance")));
        }
        Ok(BatchNorm::new(
            self.vector(&format!("{name}.gamma"), len)?,
            self.vector(&format!("{name}.beta"), len)?,
            self.vector(&format!("{name}.moving_mean"), len)?,
            variance,
        ))
    }
}
