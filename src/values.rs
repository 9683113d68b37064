//! Values flowing between converters: a backend tensor or a constant buffer.

use std::fmt;

use crate::error::GraphError;
use crate::graph::DataType;
use crate::network::TensorId;
use crate::weights::ShapedWeights;

/// A tensor that exists in the network being built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorHandle {
    pub id: TensorId,
    pub dtype: DataType,
    /// Dims without the implicit batch dim.
    pub dims: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TensorOrWeights {
    /// A live network tensor. `batch_size` is `-1` when unknown.
    Tensor {
        tensor: TensorHandle,
        batch_size: i32,
    },
    /// Shape and type of a tensor that has not been built. Only validation
    /// produces these.
    Placeholder {
        dtype: DataType,
        dims: Vec<i32>,
        batch_size: i32,
    },
    Weights(ShapedWeights),
}

impl TensorOrWeights {
    pub fn from_tensor(tensor: TensorHandle) -> Self {
        TensorOrWeights::Tensor {
            tensor,
            batch_size: -1,
        }
    }

    pub fn placeholder(dtype: DataType, dims: Vec<i32>, batch_size: i32) -> Self {
        TensorOrWeights::Placeholder {
            dtype,
            dims,
            batch_size,
        }
    }

    /// Placeholders count as tensors.
    pub fn is_tensor(&self) -> bool {
        !self.is_weights()
    }

    pub fn is_weights(&self) -> bool {
        matches!(self, TensorOrWeights::Weights(_))
    }

    pub fn tensor(&self) -> Result<&TensorHandle, GraphError> {
        match self {
            TensorOrWeights::Tensor { tensor, .. } => Ok(tensor),
            TensorOrWeights::Placeholder { .. } => Err(GraphError::internal(
                "Placeholder value has no network tensor",
            )),
            TensorOrWeights::Weights(_) => {
                Err(GraphError::internal("Weights value accessed as a tensor"))
            }
        }
    }

    pub fn weights(&self) -> Result<&ShapedWeights, GraphError> {
        match self {
            TensorOrWeights::Weights(weights) => Ok(weights),
            _ => Err(GraphError::internal("Tensor value accessed as weights")),
        }
    }

    pub fn dims(&self) -> &[i32] {
        match self {
            TensorOrWeights::Tensor { tensor, .. } => &tensor.dims,
            TensorOrWeights::Placeholder { dims, .. } => dims,
            TensorOrWeights::Weights(weights) => weights.dims(),
        }
    }

    pub fn dtype(&self) -> DataType {
        match self {
            TensorOrWeights::Tensor { tensor, .. } => tensor.dtype,
            TensorOrWeights::Placeholder { dtype, .. } => *dtype,
            TensorOrWeights::Weights(weights) => weights.dtype(),
        }
    }

    /// `-1` for weights and for tensors of unknown batch.
    pub fn batch_size(&self) -> i32 {
        match self {
            TensorOrWeights::Tensor { batch_size, .. }
            | TensorOrWeights::Placeholder { batch_size, .. } => *batch_size,
            TensorOrWeights::Weights(_) => -1,
        }
    }

    pub fn set_batch_size(&mut self, value: i32) {
        match self {
            TensorOrWeights::Tensor { batch_size, .. }
            | TensorOrWeights::Placeholder { batch_size, .. } => *batch_size = value,
            TensorOrWeights::Weights(_) => {}
        }
    }

    pub fn kind_name(&self) -> &'static str {
        if self.is_tensor() {
            "tensor"
        } else {
            "weights"
        }
    }
}

impl From<TensorHandle> for TensorOrWeights {
    fn from(tensor: TensorHandle) -> Self {
        TensorOrWeights::from_tensor(tensor)
    }
}

impl From<ShapedWeights> for TensorOrWeights {
    fn from(weights: ShapedWeights) -> Self {
        TensorOrWeights::Weights(weights)
    }
}

impl fmt::Display for TensorOrWeights {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TensorOrWeights(type={}, dtype={:?}, dims={:?}",
            self.kind_name(),
            self.dtype(),
            self.dims()
        )?;
        if self.is_tensor() {
            write!(f, ", batch_size={}", self.batch_size())?;
        }
        write!(f, ")")
    }
}
