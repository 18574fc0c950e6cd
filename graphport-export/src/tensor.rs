use anyhow::Result;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

use crate::error::ExportError;

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F32,
    I64,
    I32,
    I8,
    U8,
}

impl DType {
    pub const fn size_in_bytes(self) -> usize {
        match self {
            Self::F32 | Self::I32 => 4,
            Self::I64 => 8,
            Self::I8 | Self::U8 => 1,
        }
    }

    /// Element type code used by the `to` attribute of `Cast` nodes.
    pub const fn type_code(self) -> i64 {
        match self {
            Self::F32 => 1,
            Self::U8 => 2,
            Self::I8 => 3,
            Self::I32 => 6,
            Self::I64 => 7,
        }
    }

    pub fn from_type_code(code: i64) -> Result<Self> {
        match code {
            1 => Ok(Self::F32),
            2 => Ok(Self::U8),
            3 => Ok(Self::I8),
            6 => Ok(Self::I32),
            7 => Ok(Self::I64),
            _ => anyhow::bail!("Unknown element type code: {code}"),
        }
    }
}

/// Flat element storage of a tensor.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    I64(Vec<i64>),
    I32(Vec<i32>),
    I8(Vec<i8>),
    U8(Vec<u8>),
}

impl TensorData {
    pub fn len(&self) -> usize {
        match self {
            Self::F32(v) => v.len(),
            Self::I64(v) => v.len(),
            Self::I32(v) => v.len(),
            Self::I8(v) => v.len(),
            Self::U8(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> DType {
        match self {
            Self::F32(_) => DType::F32,
            Self::I64(_) => DType::I64,
            Self::I32(_) => DType::I32,
            Self::I8(_) => DType::I8,
            Self::U8(_) => DType::U8,
        }
    }

    /// Picks elements by flat index, in order.
    pub(crate) fn select(&self, indices: &[usize]) -> Self {
        fn pick<T: Copy>(data: &[T], indices: &[usize]) -> Vec<T> {
            indices.iter().map(|&i| data[i]).collect()
        }

        match self {
            Self::F32(v) => Self::F32(pick(v, indices)),
            Self::I64(v) => Self::I64(pick(v, indices)),
            Self::I32(v) => Self::I32(pick(v, indices)),
            Self::I8(v) => Self::I8(pick(v, indices)),
            Self::U8(v) => Self::U8(pick(v, indices)),
        }
    }
}

/// Owned, row-major n-dimensional tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: TensorData,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: TensorData) -> Result<Self> {
        let expected = shape.iter().product::<usize>();
        if expected != data.len() {
            return Err(ExportError::shape_mismatch(format!(
                "shape {shape:?} needs {expected} elements, got {}",
                data.len()
            ))
            .into());
        }
        Ok(Self { shape, data })
    }

    pub fn from_f32(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        Self::new(shape, TensorData::F32(data))
    }

    pub fn from_i64(shape: Vec<usize>, data: Vec<i64>) -> Result<Self> {
        Self::new(shape, TensorData::I64(data))
    }

    pub fn from_i8(shape: Vec<usize>, data: Vec<i8>) -> Result<Self> {
        Self::new(shape, TensorData::I8(data))
    }

    pub fn scalar_f32(value: f32) -> Self {
        Self { shape: Vec::new(), data: TensorData::F32(vec![value]) }
    }

    pub fn scalar_i64(value: i64) -> Self {
        Self { shape: Vec::new(), data: TensorData::I64(vec![value]) }
    }

    pub fn vector_i64(values: Vec<i64>) -> Self {
        Self { shape: vec![values.len()], data: TensorData::I64(values) }
    }

    pub fn vector_f32(values: Vec<f32>) -> Self {
        Self { shape: vec![values.len()], data: TensorData::F32(values) }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn into_data(self) -> TensorData {
        self.data
    }

    pub fn byte_len(&self) -> usize {
        self.numel() * self.dtype().size_in_bytes()
    }

    pub fn as_f32(&self) -> Result<&[f32]> {
        match &self.data {
            TensorData::F32(v) => Ok(v),
            other => Err(self.dtype_error(DType::F32, other.dtype())),
        }
    }

    pub fn as_i64(&self) -> Result<&[i64]> {
        match &self.data {
            TensorData::I64(v) => Ok(v),
            other => Err(self.dtype_error(DType::I64, other.dtype())),
        }
    }

    pub fn as_i32(&self) -> Result<&[i32]> {
        match &self.data {
            TensorData::I32(v) => Ok(v),
            other => Err(self.dtype_error(DType::I32, other.dtype())),
        }
    }

    pub fn as_i8(&self) -> Result<&[i8]> {
        match &self.data {
            TensorData::I8(v) => Ok(v),
            other => Err(self.dtype_error(DType::I8, other.dtype())),
        }
    }

    pub fn as_u8(&self) -> Result<&[u8]> {
        match &self.data {
            TensorData::U8(v) => Ok(v),
            other => Err(self.dtype_error(DType::U8, other.dtype())),
        }
    }

    fn dtype_error(&self, expected: DType, actual: DType) -> anyhow::Error {
        ExportError::shape_mismatch(format!(
            "expected {expected:?} tensor, got {actual:?} with shape {:?}",
            self.shape
        ))
        .into()
    }

    /// Same data viewed with another shape of equal element count.
    pub fn with_shape(self, shape: Vec<usize>) -> Result<Self> {
        Self::new(shape, self.data)
    }

    /// Writes the raw elements in little-endian order.
    pub fn write_le<W: Write>(&self, writer: &mut W) -> Result<()> {
        match &self.data {
            TensorData::F32(v) => v.iter().try_for_each(|&x| writer.write_f32::<LittleEndian>(x))?,
            TensorData::I64(v) => v.iter().try_for_each(|&x| writer.write_i64::<LittleEndian>(x))?,
            TensorData::I32(v) => v.iter().try_for_each(|&x| writer.write_i32::<LittleEndian>(x))?,
            TensorData::I8(v) => v.iter().try_for_each(|&x| writer.write_i8(x))?,
            TensorData::U8(v) => writer.write_all(v)?,
        }
        Ok(())
    }

    /// Reads `shape.product()` little-endian elements of `dtype`.
    pub fn read_le<R: Read>(reader: &mut R, dtype: DType, shape: Vec<usize>) -> Result<Self> {
        let n = shape.iter().product::<usize>();
        let data = match dtype {
            DType::F32 => {
                let mut v = vec![0.0f32; n];
                reader.read_f32_into::<LittleEndian>(&mut v)?;
                TensorData::F32(v)
            }
            DType::I64 => {
                let mut v = vec![0i64; n];
                reader.read_i64_into::<LittleEndian>(&mut v)?;
                TensorData::I64(v)
            }
            DType::I32 => {
                let mut v = vec![0i32; n];
                reader.read_i32_into::<LittleEndian>(&mut v)?;
                TensorData::I32(v)
            }
            DType::I8 => {
                let mut v = vec![0i8; n];
                reader.read_i8_into(&mut v)?;
                TensorData::I8(v)
            }
            DType::U8 => {
                let mut v = vec![0u8; n];
                reader.read_exact(&mut v)?;
                TensorData::U8(v)
            }
        };
        Self::new(shape, data)
    }
}

/// Row-major strides of `shape`.
pub(crate) fn strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}
