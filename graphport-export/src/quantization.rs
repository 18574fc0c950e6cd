#[cfg(test)]
#[path = "../tests/unit/quantization_test.rs"]
mod quantization_test;

use anyhow::Result;
use log::{debug, info, warn};
use rayon::prelude::*;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::ExportError;
use crate::kernels::round_half_to_even;
use crate::models::{Embedding, Layer, LayerKind, Linear, ModelAdapter, ModelParameters, QuantizedWeight, Weight};
use crate::tensor::{Tensor, TensorData};
use crate::utils::ProgressTracker;

/// Numeric representation the exported model should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuantizationTarget {
    #[default]
    Disabled,
    Int8,
}

impl FromStr for QuantizationTarget {
    type Err = ExportError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "disabled" | "none" => Ok(Self::Disabled),
            "int8" => Ok(Self::Int8),
            _ => Err(ExportError::configuration(format!(
                "unknown quantization target '{value}', expected disabled or int8"
            ))),
        }
    }
}

impl fmt::Display for QuantizationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => f.write_str("disabled"),
            Self::Int8 => f.write_str("int8"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuantizationConfig {
    pub target: QuantizationTarget,
    /// Layer kinds to rewrite.
    pub layer_kinds: Vec<LayerKind>,
    /// Quantize activations at run time instead of dequantizing weights.
    pub activations: bool,
    /// Fail on targeted layers that cannot be quantized instead of skipping them.
    pub strict: bool,
}

impl Default for QuantizationConfig {
    fn default() -> Self {
        Self { target: QuantizationTarget::Disabled, layer_kinds: vec![LayerKind::Linear], activations: true, strict: false }
    }
}

impl QuantizationConfig {
    /// Dynamic int8 quantization of linear layers.
    pub fn int8() -> Self {
        Self { target: QuantizationTarget::Int8, ..Self::default() }
    }

    pub fn with_layer_kinds(mut self, layer_kinds: Vec<LayerKind>) -> Self {
        self.layer_kinds = layer_kinds;
        self
    }

    pub fn with_activations(mut self, activations: bool) -> Self {
        self.activations = activations;
        self
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }
}

/// Symmetric int8 values with one scale per channel.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedChannels {
    pub values: Vec<i8>,
    pub scales: Vec<f32>,
    pub max_error: f32,
}

/// Quantizes a 2-D f32 tensor to symmetric int8 (range [-127, 127]) with one
/// scale per slice along `axis`. Rounding is half-to-even.
pub fn quantize_per_channel(weights: &Tensor, axis: usize) -> Result<QuantizedChannels> {
    let &[rows, cols] = weights.shape() else {
        return Err(ExportError::shape_mismatch(format!("expected a 2-D weight, got {:?}", weights.shape())).into());
    };
    if axis > 1 {
        return Err(ExportError::shape_mismatch(format!("channel axis {axis} out of range for a 2-D weight")).into());
    }
    let data = weights.as_f32()?;

    let channels = if axis == 0 { rows } else { cols };
    let channel_of = |index: usize| if axis == 0 { index / cols } else { index % cols };
    let channel_values = |channel: usize| -> Box<dyn Iterator<Item = f32> + '_> {
        if axis == 0 {
            Box::new(data[channel * cols..(channel + 1) * cols].iter().copied())
        } else {
            Box::new((0..rows).map(move |row| data[row * cols + channel]))
        }
    };

    // A channel of zeros keeps scale 1.0 so dequantization stays exact.
    let scales: Vec<f32> = (0..channels)
        .into_par_iter()
        .map(|channel| {
            let channel_max = channel_values(channel).map(f32::abs).fold(0.0f32, f32::max);
            if channel_max > 0.0 { channel_max / 127.0 } else { 1.0 }
        })
        .collect();

    let (values, errors): (Vec<i8>, Vec<f32>) = data
        .par_iter()
        .enumerate()
        .map(|(index, &weight)| {
            let scale = scales[channel_of(index)];
            let quantized = round_half_to_even(weight / scale).clamp(-127.0, 127.0) as i8;
            let error = (f32::from(quantized) * scale - weight).abs();
            (quantized, error)
        })
        .unzip();

    let max_error = errors.into_iter().fold(0.0f32, f32::max);
    Ok(QuantizedChannels { values, scales, max_error })
}

fn quantize_weight(weight: &Tensor, axis: usize, dynamic_activations: bool) -> Result<(QuantizedWeight, f32)> {
    let quantized = quantize_per_channel(weight, axis)?;
    let channels = quantized.scales.len();

    let weight = QuantizedWeight {
        values: Arc::new(Tensor::new(weight.shape().to_vec(), TensorData::I8(quantized.values))?),
        scales: Arc::new(Tensor::vector_f32(quantized.scales)),
        zero_points: Arc::new(Tensor::from_i8(vec![channels], vec![0; channels])?),
        axis,
        dynamic_activations,
    };
    Ok((weight, quantized.max_error))
}

/// Builds a model whose targeted layers hold int8 weights.
///
/// The input model is left untouched and every tensor that is not rewritten
/// is shared with it. Input and output names and shapes stay the same; the
/// numeric error introduced is reported but not checked against a tolerance.
pub fn quantize(model: &dyn ModelAdapter, config: &QuantizationConfig) -> Result<Box<dyn ModelAdapter>> {
    let parameters = model.parameters();
    if config.target == QuantizationTarget::Disabled {
        debug!("Quantization disabled, keeping float weights");
        return model.with_parameters(parameters.clone());
    }

    let targeted: Vec<(&String, &Layer)> =
        parameters.layers.iter().filter(|(_, layer)| config.layer_kinds.contains(&layer.kind())).collect();

    if config.strict {
        if let Some((name, layer)) = targeted.iter().find(|(_, layer)| matches!(layer, Layer::LayerNorm(_))) {
            return Err(ExportError::UnsupportedLayer { layer: name.to_string(), kind: layer.kind().to_string() }.into());
        }
    }

    let mut layers = parameters.layers.clone();
    let mut max_error = 0.0f32;
    let mut quantized_count = 0usize;
    let progress = ProgressTracker::new(targeted.len(), "Quantizing");

    for (i, &(name, layer)) in targeted.iter().enumerate() {
        progress.set_current(i + 1, Some(name));

        let rewritten = match layer {
            Layer::Linear(Linear { weight: Weight::F32(weight), bias }) => {
                let (weight, error) = quantize_weight(weight, 1, config.activations)?;
                max_error = max_error.max(error);
                Layer::Linear(Linear { weight: Weight::Int8(weight), bias: Arc::clone(bias) })
            }
            Layer::Embedding(Embedding { weight: Weight::F32(weight) }) => {
                let (weight, error) = quantize_weight(weight, 0, false)?;
                max_error = max_error.max(error);
                Layer::Embedding(Embedding { weight: Weight::Int8(weight) })
            }
            Layer::Linear(_) | Layer::Embedding(_) => {
                debug!("Layer '{name}' is already quantized");
                continue;
            }
            Layer::LayerNorm(_) => {
                warn!("Layer '{name}' of kind {} cannot be quantized, keeping float weights", layer.kind());
                continue;
            }
        };

        layers.insert(name.clone(), rewritten);
        quantized_count += 1;
    }

    info!("Quantized {quantized_count} layers to int8 with max error: {max_error:.8}");
    model.with_parameters(ModelParameters::new(parameters.config.clone(), layers))
}
