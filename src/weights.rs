//! Constant buffers owned by one lowering session.
//!
//! Every buffer lives in a [`WeightStore`] until the store is dropped; a
//! [`ShapedWeights`] is a cheap typed/shaped view that refers to its buffer
//! by handle. Layers keep handles, so the store has to travel with the network
//! it was built for.

use half::f16;
use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};

use crate::error::GraphError;
use crate::graph::DataType;

/// Largest rank (excluding the implicit batch dim) the backend accepts.
pub const MAX_DIMS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WeightHandle(pub usize);

/// Element types a weight buffer can hold.
pub trait WeightElement: bytemuck::Pod {
    const DTYPE: DataType;
    fn to_f32(self) -> f32;
    fn from_f32(value: f32) -> Self;
}

impl WeightElement for f32 {
    const DTYPE: DataType = DataType::Float32;
    fn to_f32(self) -> f32 {
        self
    }
    fn from_f32(value: f32) -> Self {
        value
    }
}

impl WeightElement for f16 {
    const DTYPE: DataType = DataType::Float16;
    fn to_f32(self) -> f32 {
        f16::to_f32(self)
    }
    fn from_f32(value: f32) -> Self {
        f16::from_f32(value)
    }
}

impl WeightElement for i32 {
    const DTYPE: DataType = DataType::Int32;
    fn to_f32(self) -> f32 {
        self as f32
    }
    fn from_f32(value: f32) -> Self {
        value as i32
    }
}

impl WeightElement for i8 {
    const DTYPE: DataType = DataType::Int8;
    fn to_f32(self) -> f32 {
        self as f32
    }
    fn from_f32(value: f32) -> Self {
        value as i8
    }
}

pub fn is_weight_type(dtype: DataType) -> bool {
    matches!(
        dtype,
        DataType::Float32 | DataType::Float16 | DataType::Int32 | DataType::Int8
    )
}

/// `{type, buffer, count}` as consumed by layer constructors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendWeights {
    pub dtype: DataType,
    pub handle: Option<WeightHandle>,
    pub count: usize,
}

impl BackendWeights {
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapedWeights {
    dtype: DataType,
    dims: Vec<i32>,
    handle: Option<WeightHandle>,
}

impl ShapedWeights {
    /// Weights with no data, used for absent bias slots.
    pub fn empty(dtype: DataType) -> Self {
        Self {
            dtype,
            dims: Vec::new(),
            handle: None,
        }
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn dims(&self) -> &[i32] {
        &self.dims
    }

    pub fn handle(&self) -> Option<WeightHandle> {
        self.handle
    }

    /// Element count. Rank-0 weights hold nothing; scalar constants are
    /// stored with dims `[1]`.
    pub fn count(&self) -> usize {
        weight_dims_count(&self.dims)
    }

    pub fn size_bytes(&self) -> usize {
        self.count() * self.dtype.bytes_per_element()
    }

    /// Same buffer under another shape with the same element count.
    pub fn reshaped(&self, dims: Vec<i32>) -> Result<Self, GraphError> {
        if weight_dims_count(&dims) != self.count() {
            return Err(GraphError::internal(format!(
                "Cannot view weights of shape {:?} as {:?}",
                self.dims, dims
            )));
        }
        Ok(Self {
            dtype: self.dtype,
            dims,
            handle: self.handle,
        })
    }

    pub fn backend_weights(&self) -> BackendWeights {
        BackendWeights {
            dtype: self.dtype,
            handle: self.handle,
            count: self.count(),
        }
    }
}

pub(crate) fn weight_dims_count(dims: &[i32]) -> usize {
    if dims.is_empty() {
        return 0;
    }
    dims.iter().map(|d| (*d).max(0) as usize).product()
}

/// 4-byte aligned storage so typed views of any weight type are valid.
#[derive(Debug, Default)]
struct WeightBuffer {
    words: Vec<u32>,
    len: usize,
}

impl WeightBuffer {
    fn zeroed(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(4)],
            len,
        }
    }

    fn bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<u32, u8>(&self.words)[..self.len]
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut bytemuck::cast_slice_mut::<u32, u8>(&mut self.words)[..len]
    }
}

#[derive(Debug, Default)]
pub struct WeightStore {
    buffers: Vec<WeightBuffer>,
}

impl WeightStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Allocate a zeroed buffer of `product(dims)` elements.
    pub fn get_temp_weights(
        &mut self,
        dtype: DataType,
        dims: &[i32],
    ) -> Result<ShapedWeights, GraphError> {
        if dims.len() > MAX_DIMS + 1 || dims.iter().any(|d| *d < 0) {
            return Err(GraphError::internal(format!(
                "Invalid weight dims {:?}",
                dims
            )));
        }
        if !is_weight_type(dtype) {
            return Err(GraphError::internal(format!(
                "Unsupported weight type {:?}",
                dtype
            )));
        }
        let count = weight_dims_count(dims);
        let handle = WeightHandle(self.buffers.len());
        self.buffers
            .push(WeightBuffer::zeroed(count * dtype.bytes_per_element()));
        Ok(ShapedWeights {
            dtype,
            dims: dims.to_vec(),
            handle: Some(handle),
        })
    }

    pub fn get_temp_weights_like(
        &mut self,
        weights: &ShapedWeights,
    ) -> Result<ShapedWeights, GraphError> {
        self.get_temp_weights(weights.dtype, &weights.dims)
    }

    /// Allocate weights and fill them from `values`.
    pub fn weights_from_values<T: WeightElement>(
        &mut self,
        dims: &[i32],
        values: &[T],
    ) -> Result<ShapedWeights, GraphError> {
        let weights = self.get_temp_weights(T::DTYPE, dims)?;
        let dst = self.values_mut::<T>(&weights)?;
        if dst.len() != values.len() {
            return Err(GraphError::internal(format!(
                "Expected {} values for weights of shape {:?}, got {}",
                dst.len(),
                dims,
                values.len()
            )));
        }
        dst.copy_from_slice(values);
        Ok(weights)
    }

    pub fn bytes(&self, weights: &ShapedWeights) -> &[u8] {
        match weights.handle {
            Some(WeightHandle(index)) => self
                .buffers
                .get(index)
                .map(|buffer| &buffer.bytes()[..weights.size_bytes().min(buffer.len)])
                .unwrap_or(&[]),
            None => &[],
        }
    }

    pub fn bytes_mut(&mut self, weights: &ShapedWeights) -> Result<&mut [u8], GraphError> {
        let size = weights.size_bytes();
        let buffer = weights
            .handle
            .and_then(|WeightHandle(index)| self.buffers.get_mut(index))
            .ok_or_else(|| GraphError::internal("Weights are not backed by the store"))?;
        if size > buffer.len {
            return Err(GraphError::internal("Weights view exceeds its buffer"));
        }
        Ok(&mut buffer.bytes_mut()[..size])
    }

    pub fn bytes_by_handle(&self, handle: WeightHandle) -> Option<&[u8]> {
        self.buffers.get(handle.0).map(WeightBuffer::bytes)
    }

    pub fn values<T: WeightElement>(&self, weights: &ShapedWeights) -> Result<&[T], GraphError> {
        check_element_type::<T>(weights)?;
        bytemuck::try_cast_slice(self.bytes(weights))
            .map_err(|err| GraphError::internal(format!("Bad weight buffer: {}", err)))
    }

    pub fn values_mut<T: WeightElement>(
        &mut self,
        weights: &ShapedWeights,
    ) -> Result<&mut [T], GraphError> {
        check_element_type::<T>(weights)?;
        bytemuck::try_cast_slice_mut(self.bytes_mut(weights)?)
            .map_err(|err| GraphError::internal(format!("Bad weight buffer: {}", err)))
    }

    /// Values widened to f32, whatever the stored type.
    pub fn values_as_f32(&self, weights: &ShapedWeights) -> Result<Vec<f32>, GraphError> {
        Ok(match weights.dtype {
            DataType::Float32 => self.values::<f32>(weights)?.to_vec(),
            DataType::Float16 => widen(self.values::<f16>(weights)?),
            DataType::Int32 => widen(self.values::<i32>(weights)?),
            DataType::Int8 => widen(self.values::<i8>(weights)?),
            other => {
                return Err(GraphError::internal(format!(
                    "Unsupported weight type {:?}",
                    other
                )))
            }
        })
    }

    pub fn export(&self) -> ExportedWeights {
        ExportedWeights {
            buffers: self.buffers.iter().map(|b| b.bytes().to_vec()).collect(),
        }
    }
}

fn widen<T: WeightElement>(values: &[T]) -> Vec<f32> {
    values.iter().map(|v| v.to_f32()).collect()
}

fn check_element_type<T: WeightElement>(weights: &ShapedWeights) -> Result<(), GraphError> {
    if weights.dtype != T::DTYPE {
        return Err(GraphError::internal(format!(
            "Weights hold {:?}, requested {:?}",
            weights.dtype,
            T::DTYPE
        )));
    }
    Ok(())
}

/// Serializable snapshot of every buffer in a store, indexed by handle.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedWeights {
    #[serde_as(as = "Vec<Base64>")]
    pub buffers: Vec<Vec<u8>>,
}

/// Copy float32 weights into a new float16 buffer, rounding to nearest even.
pub fn convert_fp32_to_fp16(
    store: &mut WeightStore,
    weights: &ShapedWeights,
) -> Result<ShapedWeights, GraphError> {
    let src = store.values::<f32>(weights)?.to_vec();
    let converted: Vec<f16> = src.into_iter().map(f16::from_f32).collect();
    let dims = weights.dims.clone();
    let out = store.get_temp_weights(DataType::Float16, &dims)?;
    store.values_mut::<f16>(&out)?.copy_from_slice(&converted);
    Ok(out)
}

/// `(min, max)` over the weight values.
pub fn weight_range(store: &WeightStore, weights: &ShapedWeights) -> Result<(f32, f32), GraphError> {
    let values = match weights.dtype {
        DataType::Float32 | DataType::Float16 | DataType::Int32 => store.values_as_f32(weights)?,
        other => {
            return Err(GraphError::unimplemented(format!(
                "Data type not supported for weight range: {:?}",
                other
            )))
        }
    };
    Ok(values
        .iter()
        .fold(None, |acc: Option<(f32, f32)>, v| match acc {
            None => Some((*v, *v)),
            Some((lo, hi)) => Some((lo.min(*v), hi.max(*v))),
        })
        .unwrap_or((0.0, 0.0)))
}
