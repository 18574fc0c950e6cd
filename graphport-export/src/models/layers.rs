use anyhow::Result;
use std::f32::consts::SQRT_2;
use std::sync::Arc;

use crate::error::ExportError;
use crate::tensor::{DType, Tensor};
use crate::tracer::{Tracer, ValueId};

/// Symmetric int8 weights with one scale per channel along `axis`.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedWeight {
    pub values: Arc<Tensor>,
    pub scales: Arc<Tensor>,
    pub zero_points: Arc<Tensor>,
    pub axis: usize,
    /// Quantize activations at run time and multiply in integers.
    pub dynamic_activations: bool,
}

impl QuantizedWeight {
    fn trace_dequantized(&self, tracer: &mut Tracer, name: &str) -> Result<ValueId> {
        let values = tracer.parameter(&format!("{name}.weight_quantized"), &self.values);
        let scales = tracer.parameter(&format!("{name}.weight_scale"), &self.scales);
        let zero_points = tracer.parameter(&format!("{name}.weight_zero_point"), &self.zero_points);
        tracer.dequantize_linear(values, scales, zero_points, Some(self.axis))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Weight {
    F32(Arc<Tensor>),
    Int8(QuantizedWeight),
}

impl Weight {
    pub fn is_quantized(&self) -> bool {
        matches!(self, Self::Int8(_))
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            Self::F32(tensor) => tensor.shape(),
            Self::Int8(quantized) => quantized.values.shape(),
        }
    }

    fn trace(&self, tracer: &mut Tracer, name: &str) -> Result<ValueId> {
        match self {
            Self::F32(tensor) => Ok(tracer.parameter(&format!("{name}.weight"), tensor)),
            Self::Int8(quantized) => quantized.trace_dequantized(tracer, name),
        }
    }
}

fn expect_shape(name: &str, tensor: &Tensor, rank: usize) -> Result<(), ExportError> {
    if tensor.rank() != rank || tensor.dtype() != DType::F32 {
        return Err(ExportError::shape_mismatch(format!(
            "{name} must be a rank {rank} f32 tensor, got {:?} {:?}",
            tensor.dtype(),
            tensor.shape()
        )));
    }
    Ok(())
}

/// Dense layer `y = x W + b` with `W` stored as `[in_features, out_features]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Linear {
    pub weight: Weight,
    pub bias: Arc<Tensor>,
}

impl Linear {
    pub fn new(weight: Arc<Tensor>, bias: Arc<Tensor>) -> Result<Self> {
        expect_shape("linear weight", &weight, 2)?;
        expect_shape("linear bias", &bias, 1)?;
        if bias.shape()[0] != weight.shape()[1] {
            return Err(ExportError::shape_mismatch(format!(
                "linear bias {:?} does not match weight {:?}",
                bias.shape(),
                weight.shape()
            ))
            .into());
        }
        Ok(Self { weight: Weight::F32(weight), bias })
    }

    pub fn in_features(&self) -> usize {
        self.weight.shape()[0]
    }

    pub fn out_features(&self) -> usize {
        self.weight.shape()[1]
    }

    pub fn trace(&self, tracer: &mut Tracer, name: &str, x: ValueId) -> Result<ValueId> {
        let bias = tracer.parameter(&format!("{name}.bias"), &self.bias);

        let y = match &self.weight {
            Weight::Int8(quantized) if quantized.dynamic_activations => {
                let (xq, x_scale, x_zero_point) = tracer.dynamic_quantize_linear(x)?;
                let wq = tracer.parameter(&format!("{name}.weight_quantized"), &quantized.values);
                let w_zero_point = tracer.parameter(&format!("{name}.weight_zero_point"), &quantized.zero_points);
                let accumulated = tracer.matmul_integer(xq, wq, x_zero_point, w_zero_point)?;
                let accumulated = tracer.cast(accumulated, DType::F32)?;
                let y = tracer.mul(accumulated, x_scale)?;
                let w_scale = tracer.parameter(&format!("{name}.weight_scale"), &quantized.scales);
                tracer.mul(y, w_scale)?
            }
            weight => {
                let w = weight.trace(tracer, name)?;
                tracer.matmul(x, w)?
            }
        };

        tracer.add(y, bias)
    }
}

/// Lookup table with one row per index.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub weight: Weight,
}

impl Embedding {
    pub fn new(weight: Arc<Tensor>) -> Result<Self> {
        expect_shape("embedding table", &weight, 2)?;
        Ok(Self { weight: Weight::F32(weight) })
    }

    pub fn num_embeddings(&self) -> usize {
        self.weight.shape()[0]
    }

    pub fn embedding_dim(&self) -> usize {
        self.weight.shape()[1]
    }

    pub fn trace(&self, tracer: &mut Tracer, name: &str, indices: ValueId) -> Result<ValueId> {
        let table = self.weight.trace(tracer, name)?;
        tracer.gather(table, indices)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LayerNorm {
    pub gamma: Arc<Tensor>,
    pub beta: Arc<Tensor>,
    pub eps: f32,
}

impl LayerNorm {
    pub fn new(gamma: Arc<Tensor>, beta: Arc<Tensor>, eps: f32) -> Result<Self> {
        expect_shape("layer norm weight", &gamma, 1)?;
        expect_shape("layer norm bias", &beta, 1)?;
        if gamma.shape() != beta.shape() {
            return Err(ExportError::shape_mismatch("layer norm weight and bias differ in size").into());
        }
        Ok(Self { gamma, beta, eps })
    }

    /// Normalizes over the last axis, as one operator when the opset allows it.
    pub fn trace(&self, tracer: &mut Tracer, name: &str, x: ValueId) -> Result<ValueId> {
        let gamma = tracer.parameter(&format!("{name}.weight"), &self.gamma);
        let beta = tracer.parameter(&format!("{name}.bias"), &self.beta);

        if tracer.supports_fused_layer_norm() {
            return tracer.layer_normalization(x, gamma, beta, self.eps);
        }

        let mean = tracer.reduce_mean(x, -1)?;
        let centered = tracer.sub(x, mean)?;
        let two = tracer.scalar(2.0);
        let squared = tracer.pow(centered, two)?;
        let variance = tracer.reduce_mean(squared, -1)?;
        let eps = tracer.scalar(self.eps);
        let variance = tracer.add(variance, eps)?;
        let std = tracer.sqrt(variance)?;
        let normalized = tracer.div(centered, std)?;
        let scaled = tracer.mul(normalized, gamma)?;
        tracer.add(scaled, beta)
    }
}

/// Exact GELU: `0.5 * x * (1 + erf(x / sqrt(2)))`.
pub fn gelu(tracer: &mut Tracer, x: ValueId) -> Result<ValueId> {
    let sqrt_2 = tracer.scalar(SQRT_2);
    let scaled = tracer.div(x, sqrt_2)?;
    let erf = tracer.erf(scaled)?;
    let one = tracer.scalar(1.0);
    let shifted = tracer.add(erf, one)?;
    let y = tracer.mul(x, shifted)?;
    let half = tracer.scalar(0.5);
    tracer.mul(y, half)
}
