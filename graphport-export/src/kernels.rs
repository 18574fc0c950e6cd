//! Eager numeric kernels.
//!
//! Every traced operator is evaluated by one of these functions while the
//! tracer records it, so their semantics follow the operator definitions of
//! the graph format (numpy broadcasting, `Reshape` with `0`/`-1`, uint8
//! dynamic quantization and so on).

#[cfg(test)]
#[path = "../tests/unit/kernels_test.rs"]
mod kernels_test;

use anyhow::Result;
use rayon::prelude::*;

use crate::error::ExportError;
use crate::tensor::{DType, Tensor, TensorData, strides};

/// Element-wise binary operators with broadcasting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

impl BinaryOp {
    pub const fn op_type(self) -> &'static str {
        match self {
            Self::Add => "Add",
            Self::Sub => "Sub",
            Self::Mul => "Mul",
            Self::Div => "Div",
            Self::Pow => "Pow",
        }
    }

    #[inline]
    fn apply_f32(self, a: f32, b: f32) -> f32 {
        match self {
            Self::Add => a + b,
            Self::Sub => a - b,
            Self::Mul => a * b,
            Self::Div => a / b,
            Self::Pow => a.powf(b),
        }
    }

    fn apply_i64(self, a: i64, b: i64) -> Result<i64> {
        match self {
            Self::Add => Ok(a.wrapping_add(b)),
            Self::Sub => Ok(a.wrapping_sub(b)),
            Self::Mul => Ok(a.wrapping_mul(b)),
            Self::Div => a.checked_div(b).ok_or_else(|| anyhow::anyhow!("Integer division by zero")),
            Self::Pow => anyhow::bail!("Pow is not defined for integer tensors"),
        }
    }
}

/// Numpy-style broadcast of two shapes.
pub fn broadcast_shape(a: &[usize], b: &[usize]) -> Result<Vec<usize>> {
    let rank = a.len().max(b.len());
    (0..rank)
        .map(|axis| match (aligned_dim(a, rank, axis), aligned_dim(b, rank, axis)) {
            (x, y) if x == y => Ok(x),
            (1, y) => Ok(y),
            (x, 1) => Ok(x),
            _ => Err(ExportError::shape_mismatch(format!("shapes {a:?} and {b:?} cannot be broadcast")).into()),
        })
        .collect()
}

fn aligned_dim(shape: &[usize], rank: usize, axis: usize) -> usize {
    let offset = rank - shape.len();
    if axis < offset { 1 } else { shape[axis - offset] }
}

/// For every element of `output`, the flat index of the broadcast source element in `input`.
fn broadcast_index_map(input: &[usize], output: &[usize]) -> Vec<usize> {
    let rank = output.len();
    let offset = rank - input.len();
    let input_strides = strides(input);
    let effective: Vec<usize> = (0..rank)
        .map(|axis| if axis < offset || input[axis - offset] == 1 { 0 } else { input_strides[axis - offset] })
        .collect();
    let output_strides = strides(output);
    let n = output.iter().product::<usize>();

    (0..n)
        .map(|flat| (0..rank).map(|axis| (flat / output_strides[axis]) % output[axis] * effective[axis]).sum())
        .collect()
}

/// Applies `op` element-wise with broadcasting. Both operands must share an element type.
pub fn binary(op: BinaryOp, a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let shape = broadcast_shape(a.shape(), b.shape())?;
    let ia = broadcast_index_map(a.shape(), &shape);
    let ib = broadcast_index_map(b.shape(), &shape);

    match (a.data(), b.data()) {
        (TensorData::F32(x), TensorData::F32(y)) => {
            let data = ia.iter().zip(&ib).map(|(&i, &j)| op.apply_f32(x[i], y[j])).collect();
            Tensor::from_f32(shape, data)
        }
        (TensorData::I64(x), TensorData::I64(y)) => {
            let data = ia.iter().zip(&ib).map(|(&i, &j)| op.apply_i64(x[i], y[j])).collect::<Result<Vec<_>>>()?;
            Tensor::from_i64(shape, data)
        }
        (x, y) => Err(ExportError::shape_mismatch(format!(
            "{} expects operands of the same element type, got {:?} and {:?}",
            op.op_type(),
            x.dtype(),
            y.dtype()
        ))
        .into()),
    }
}

/// Applies `f` to every element of an f32 tensor.
pub fn unary_f32(t: &Tensor, f: impl Fn(f32) -> f32) -> Result<Tensor> {
    let data = t.as_f32()?.iter().map(|&x| f(x)).collect();
    Tensor::from_f32(t.shape().to_vec(), data)
}

/// Error function, Abramowitz & Stegun 7.1.26 (|error| < 1.5e-7).
pub fn erf(x: f32) -> f32 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = f64::from(x.abs());
    let t = 1.0 / (1.0 + 0.327_591_1 * x);
    let poly = ((((1.061_405_429 * t - 1.453_152_027) * t + 1.421_413_741) * t - 0.284_496_736) * t
        + 0.254_829_592)
        * t;
    sign * (1.0 - poly * (-x * x).exp()) as f32
}

/// Splits two matmul operand shapes into `(batch, m, k, n, rhs_batched, output_shape)`.
fn matmul_dims(a: &[usize], b: &[usize]) -> Result<(usize, usize, usize, usize, bool, Vec<usize>)> {
    if a.len() < 2 || b.len() < 2 {
        return Err(ExportError::shape_mismatch(format!("MatMul needs rank >= 2 operands, got {a:?} and {b:?}")).into());
    }

    let (a_batch, a_mat) = a.split_at(a.len() - 2);
    let (b_batch, b_mat) = b.split_at(b.len() - 2);
    let (m, k) = (a_mat[0], a_mat[1]);
    let (kb, n) = (b_mat[0], b_mat[1]);

    if k != kb {
        return Err(ExportError::shape_mismatch(format!("MatMul inner dimensions differ: {a:?} x {b:?}")).into());
    }

    let rhs_batched = !b_batch.is_empty();
    if rhs_batched && a_batch != b_batch {
        return Err(ExportError::shape_mismatch(format!("MatMul batch dimensions differ: {a:?} x {b:?}")).into());
    }

    let mut output_shape = a_batch.to_vec();
    output_shape.extend([m, n]);
    Ok((a_batch.iter().product(), m, k, n, rhs_batched, output_shape))
}

/// Batched f32 matrix product `[.., m, k] x [k, n]` or `[.., m, k] x [.., k, n]`.
pub fn matmul(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let (batch, m, k, n, rhs_batched, output_shape) = matmul_dims(a.shape(), b.shape())?;
    let x = a.as_f32()?;
    let w = b.as_f32()?;
    let mut out = vec![0.0f32; batch * m * n];

    if n > 0 {
        out.par_chunks_mut(n).enumerate().for_each(|(row, out_row)| {
            let w_offset = if rhs_batched { (row / m) * k * n } else { 0 };
            let x_row = &x[row * k..(row + 1) * k];
            for (p, &xv) in x_row.iter().enumerate() {
                let w_row = &w[w_offset + p * n..w_offset + (p + 1) * n];
                out_row.iter_mut().zip(w_row).for_each(|(o, &wv)| *o += xv * wv);
            }
        });
    }

    Tensor::from_f32(output_shape, out)
}

/// Integer matrix product of uint8 activations and int8 weights, accumulated in i32.
///
/// `b_zero_point` is either a scalar or one value per output column.
pub fn matmul_integer(a: &Tensor, b: &Tensor, a_zero_point: &Tensor, b_zero_point: &Tensor) -> Result<Tensor> {
    let (batch, m, k, n, rhs_batched, output_shape) = matmul_dims(a.shape(), b.shape())?;
    if rhs_batched {
        return Err(ExportError::shape_mismatch("MatMulInteger expects 2-D weights").into());
    }

    let x = a.as_u8()?;
    let w = b.as_i8()?;
    let a_zp = i32::from(a_zero_point.as_u8()?.first().copied().unwrap_or(0));
    let b_zp = b_zero_point.as_i8()?;
    if b_zp.len() != 1 && b_zp.len() != n {
        return Err(ExportError::shape_mismatch(format!(
            "MatMulInteger weight zero point has {} values for {n} columns",
            b_zp.len()
        ))
        .into());
    }
    let column_zp = |col: usize| i32::from(if b_zp.len() == 1 { b_zp[0] } else { b_zp[col] });

    let mut out = vec![0i32; batch * m * n];
    if n > 0 {
        out.par_chunks_mut(n).enumerate().for_each(|(row, out_row)| {
            let x_row = &x[row * k..(row + 1) * k];
            for (p, &xv) in x_row.iter().enumerate() {
                let xv = i32::from(xv) - a_zp;
                let w_row = &w[p * n..(p + 1) * n];
                for (col, (o, &wv)) in out_row.iter_mut().zip(w_row).enumerate() {
                    *o += xv * (i32::from(wv) - column_zp(col));
                }
            }
        });
    }

    Tensor::new(output_shape, TensorData::I32(out))
}

/// Permutes axes: output axis `i` is input axis `perm[i]`.
pub fn transpose(t: &Tensor, perm: &[usize]) -> Result<Tensor> {
    let rank = t.rank();
    let mut seen = vec![false; rank];
    if perm.len() != rank || perm.iter().any(|&p| p >= rank || std::mem::replace(&mut seen[p], true)) {
        return Err(ExportError::shape_mismatch(format!("invalid permutation {perm:?} for rank {rank}")).into());
    }

    let input_strides = strides(t.shape());
    let output_shape: Vec<usize> = perm.iter().map(|&p| t.shape()[p]).collect();
    let output_strides = strides(&output_shape);
    let n = t.numel();

    let indices: Vec<usize> = (0..n)
        .map(|flat| {
            (0..rank)
                .map(|axis| (flat / output_strides[axis]) % output_shape[axis] * input_strides[perm[axis]])
                .sum()
        })
        .collect();

    Tensor::new(output_shape, t.data().select(&indices))
}

/// Resolves a reshape target: `0` copies the input dimension, `-1` is inferred.
pub fn resolve_reshape(input: &[usize], target: &[i64]) -> Result<Vec<usize>> {
    let numel = input.iter().product::<usize>();
    let mut shape = Vec::with_capacity(target.len());
    let mut inferred = None;

    for (axis, &dim) in target.iter().enumerate() {
        match dim {
            0 => shape.push(*input.get(axis).ok_or_else(|| {
                ExportError::shape_mismatch(format!("reshape target {target:?} copies missing axis {axis} of {input:?}"))
            })?),
            -1 if inferred.is_none() => {
                inferred = Some(axis);
                shape.push(1);
            }
            d if d > 0 => shape.push(d as usize),
            _ => return Err(ExportError::shape_mismatch(format!("invalid reshape target {target:?}")).into()),
        }
    }

    if let Some(axis) = inferred {
        let known = shape.iter().enumerate().filter(|&(i, _)| i != axis).map(|(_, &d)| d).product::<usize>();
        if known == 0 || numel % known != 0 {
            return Err(ExportError::shape_mismatch(format!("cannot reshape {input:?} into {target:?}")).into());
        }
        shape[axis] = numel / known;
    }

    if shape.iter().product::<usize>() != numel {
        return Err(ExportError::shape_mismatch(format!("cannot reshape {input:?} into {target:?}")).into());
    }

    Ok(shape)
}

pub fn reshape(t: &Tensor, target: &[i64]) -> Result<Tensor> {
    let shape = resolve_reshape(t.shape(), target)?;
    t.clone().with_shape(shape)
}

/// Gathers along axis 0: output shape is `indices.shape ++ table.shape[1..]`.
pub fn gather(table: &Tensor, indices: &Tensor) -> Result<Tensor> {
    let Some((&rows, rest)) = table.shape().split_first() else {
        return Err(ExportError::shape_mismatch("Gather needs a table of rank >= 1").into());
    };
    let inner = rest.iter().product::<usize>();

    let flat = indices
        .as_i64()?
        .iter()
        .map(|&index| {
            let row = if index < 0 { index + rows as i64 } else { index };
            if row < 0 || row as usize >= rows {
                return Err(ExportError::shape_mismatch(format!(
                    "index {index} out of range for a table with {rows} rows"
                ))
                .into());
            }
            let start = row as usize * inner;
            Ok(start..start + inner)
        })
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .flatten()
        .collect::<Vec<_>>();

    let mut shape = indices.shape().to_vec();
    shape.extend_from_slice(rest);
    Tensor::new(shape, table.data().select(&flat))
}

/// Inserts size-one axes; negative axes count from the end of the output.
pub fn unsqueeze(t: &Tensor, axes: &[i64]) -> Result<Tensor> {
    let output_rank = (t.rank() + axes.len()) as i64;
    let mut normalized = axes
        .iter()
        .map(|&axis| {
            let axis = if axis < 0 { axis + output_rank } else { axis };
            if (0..output_rank).contains(&axis) {
                Ok(axis as usize)
            } else {
                Err(ExportError::shape_mismatch(format!("Unsqueeze axis {axis} out of range")).into())
            }
        })
        .collect::<Result<Vec<_>>>()?;
    normalized.sort_unstable();

    let mut shape = t.shape().to_vec();
    for axis in normalized {
        shape.insert(axis, 1);
    }
    t.clone().with_shape(shape)
}

fn last_axis(t: &Tensor, axis: i64, op: &str) -> Result<usize> {
    let rank = t.rank() as i64;
    if rank == 0 || (axis != -1 && axis != rank - 1) {
        anyhow::bail!("{op} is only implemented over the last axis (got axis {axis} for rank {rank})");
    }
    Ok(t.shape()[t.rank() - 1])
}

/// Mean over one trailing axis, keeping it with size one.
pub fn reduce_mean(t: &Tensor, axis: i64) -> Result<Tensor> {
    let width = last_axis(t, axis, "ReduceMean")?;
    let x = t.as_f32()?;
    let data = if width == 0 { Vec::new() } else { x.chunks(width).map(|row| row.iter().sum::<f32>() / width as f32).collect() };

    let mut shape = t.shape().to_vec();
    if let Some(last) = shape.last_mut() {
        *last = 1;
    }
    Tensor::from_f32(shape, data)
}

/// Numerically stable softmax over the last axis.
pub fn softmax(t: &Tensor, axis: i64) -> Result<Tensor> {
    let width = last_axis(t, axis, "Softmax")?;
    let mut data = t.as_f32()?.to_vec();
    if width > 0 {
        data.par_chunks_mut(width).for_each(|row| {
            let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let mut sum = 0.0f32;
            for v in row.iter_mut() {
                *v = (*v - max).exp();
                sum += *v;
            }
            row.iter_mut().for_each(|v| *v /= sum);
        });
    }
    Tensor::from_f32(t.shape().to_vec(), data)
}

/// Layer normalization over the last axis: `(x - mean) / sqrt(var + eps) * gamma + beta`.
pub fn layer_norm(x: &Tensor, gamma: &Tensor, beta: &Tensor, eps: f32) -> Result<Tensor> {
    let width = last_axis(x, -1, "LayerNormalization")?;
    let (g, b) = (gamma.as_f32()?, beta.as_f32()?);
    if g.len() != width || b.len() != width {
        return Err(ExportError::shape_mismatch(format!(
            "layer norm over {width} features got {} weights and {} biases",
            g.len(),
            b.len()
        ))
        .into());
    }

    let mut data = x.as_f32()?.to_vec();
    if width > 0 {
        data.par_chunks_mut(width).for_each(|row| {
            let mean = row.iter().sum::<f32>() / width as f32;
            let var = row.iter().map(|&v| (v - mean).powi(2)).sum::<f32>() / width as f32;
            let inv_std = 1.0 / (var + eps).sqrt();
            row.iter_mut().zip(g.iter().zip(b)).for_each(|(v, (&gi, &bi))| *v = (*v - mean) * inv_std * gi + bi);
        });
    }
    Tensor::from_f32(x.shape().to_vec(), data)
}

/// Element type conversion.
pub fn cast(t: &Tensor, to: DType) -> Result<Tensor> {
    let shape = t.shape().to_vec();
    let data = match (t.data(), to) {
        (data, to) if data.dtype() == to => data.clone(),
        (TensorData::I64(v), DType::F32) => TensorData::F32(v.iter().map(|&x| x as f32).collect()),
        (TensorData::I32(v), DType::F32) => TensorData::F32(v.iter().map(|&x| x as f32).collect()),
        (TensorData::I8(v), DType::F32) => TensorData::F32(v.iter().map(|&x| f32::from(x)).collect()),
        (TensorData::U8(v), DType::F32) => TensorData::F32(v.iter().map(|&x| f32::from(x)).collect()),
        (TensorData::F32(v), DType::I64) => TensorData::I64(v.iter().map(|&x| x as i64).collect()),
        (TensorData::I32(v), DType::I64) => TensorData::I64(v.iter().map(|&x| i64::from(x)).collect()),
        (data, to) => anyhow::bail!("Cast from {:?} to {to:?} is not supported", data.dtype()),
    };
    Tensor::new(shape, data)
}

/// 1-D int64 tensor holding the dimensions of `t`.
pub fn shape_of(t: &Tensor) -> Tensor {
    Tensor::vector_i64(t.shape().iter().map(|&d| d as i64).collect())
}

/// `[start, start + delta, ..)` up to (excluding) `limit`.
pub fn range(start: i64, limit: i64, delta: i64) -> Result<Tensor> {
    if delta == 0 {
        anyhow::bail!("Range delta must not be zero");
    }
    let count = ((limit - start) as f64 / delta as f64).ceil().max(0.0) as i64;
    Ok(Tensor::vector_i64((0..count).map(|i| start + i * delta).collect()))
}

/// `(q - zero_point) * scale`, with per-tensor or per-axis scale and zero point.
pub fn dequantize_linear(q: &Tensor, scale: &Tensor, zero_point: &Tensor, axis: usize) -> Result<Tensor> {
    let values = q.as_i8()?;
    let scales = scale.as_f32()?;
    let zero_points = zero_point.as_i8()?;

    let channels = if scales.len() == 1 {
        1
    } else {
        let dim = *q.shape().get(axis).ok_or_else(|| {
            ExportError::shape_mismatch(format!("DequantizeLinear axis {axis} out of range for {:?}", q.shape()))
        })?;
        if dim != scales.len() {
            return Err(ExportError::shape_mismatch(format!(
                "DequantizeLinear has {} scales for axis of size {dim}",
                scales.len()
            ))
            .into());
        }
        dim
    };
    if zero_points.len() != scales.len() {
        return Err(ExportError::shape_mismatch("DequantizeLinear scale and zero point lengths differ").into());
    }

    let axis_stride = if channels == 1 { 1 } else { strides(q.shape())[axis] };
    let data = values
        .iter()
        .enumerate()
        .map(|(i, &v)| {
            let c = if channels == 1 { 0 } else { (i / axis_stride) % channels };
            (f32::from(v) - f32::from(zero_points[c])) * scales[c]
        })
        .collect();
    Tensor::from_f32(q.shape().to_vec(), data)
}

/// Asymmetric uint8 quantization with a range computed from the data itself.
///
/// Returns `(y, y_scale, y_zero_point)`; the range always includes zero.
pub fn dynamic_quantize_linear(x: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
    let values = x.as_f32()?;
    let min = values.iter().copied().fold(0.0f32, f32::min);
    let max = values.iter().copied().fold(0.0f32, f32::max);
    let scale = (max - min) / 255.0;

    let zero_point = if scale > 0.0 { round_half_to_even(-min / scale).clamp(0.0, 255.0) } else { 0.0 };
    let quantized = values
        .iter()
        .map(|&v| {
            if scale > 0.0 { (round_half_to_even(v / scale) + zero_point).clamp(0.0, 255.0) as u8 } else { zero_point as u8 }
        })
        .collect();

    Ok((
        Tensor::new(x.shape().to_vec(), TensorData::U8(quantized))?,
        Tensor::scalar_f32(scale),
        Tensor::new(Vec::new(), TensorData::U8(vec![zero_point as u8]))?,
    ))
}

/// Round half to even (banker's rounding) to match PyTorch's torch.round() behavior
#[inline]
pub fn round_half_to_even(x: f32) -> f32 {
    let rounded = x.round();
    if (x - rounded).abs() != 0.5 {
        return rounded;
    }

    // Exactly halfway: `round` went away from zero, step back if that is odd
    if rounded as i64 % 2 == 0 {
        rounded
    } else if x >= 0.0 {
        rounded - 1.0
    } else {
        rounded + 1.0
    }
}
