use crate::error::GraphError;
use crate::graph::{DataType, TensorData};
use crate::values::TensorOrWeights;
use crate::weights::{ShapedWeights, WeightStore};

use super::OpConverterParams;

/// Turn a `Const` node into weights. Runs the same way in both phases, since
/// the validator needs the weights as inputs of the nodes it probes.
pub fn convert_const(params: &mut OpConverterParams<'_>) -> Result<(), GraphError> {
    if !params.inputs.is_empty() {
        return Err(GraphError::invalid_argument(format!(
            "Constant node is expected to have empty input list: {}",
            params.name()
        )));
    }
    let tensor: TensorData = params.attrs.get("value")?;
    let dtype: DataType = params.attrs.get("dtype")?;
    if dtype != tensor.dtype {
        return Err(GraphError::invalid_argument(format!(
            "DataType mismatch between attr ({:?}) and tensor ({:?})",
            dtype, tensor.dtype
        )));
    }
    let weights = tensor_to_weights(&tensor, params.weight_store)
        .map_err(|err| match err {
            GraphError::Internal { reason } => GraphError::internal(format!(
                "Cannot parse weight tensor of {}: {}",
                params.node.name, reason
            )),
            other => other,
        })?;
    params.outputs.push(TensorOrWeights::from(weights));
    Ok(())
}

/// Small integer types are widened to int32; everything else is copied as is.
fn tensor_to_weights(
    tensor: &TensorData,
    store: &mut WeightStore,
) -> Result<ShapedWeights, GraphError> {
    let stored = match tensor.dtype {
        DataType::Int8 | DataType::Uint8 | DataType::Int16 | DataType::Uint16 => DataType::Int32,
        DataType::Float32 | DataType::Float16 | DataType::Int32 => tensor.dtype,
        other => {
            return Err(GraphError::invalid_argument(format!(
                "Unsupported data type {:?}",
                other
            )))
        }
    };
    let count = tensor.element_count();
    if count == 0 {
        return Ok(ShapedWeights::empty(stored));
    }
    if tensor.data.len() != count * tensor.dtype.bytes_per_element() {
        return Err(GraphError::internal(format!(
            "{} bytes for {} elements of {:?}",
            tensor.data.len(),
            count,
            tensor.dtype
        )));
    }

    let mut dims = tensor
        .shape
        .iter()
        .map(|d| i32::try_from(*d))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| GraphError::invalid_argument("Constant dims overflow int32"))?;
    if dims.is_empty() {
        dims.push(1);
    }

    if stored == tensor.dtype {
        let weights = store.get_temp_weights(stored, &dims)?;
        store.bytes_mut(&weights)?.copy_from_slice(&tensor.data);
        return Ok(weights);
    }

    let widened: Vec<i32> = match tensor.dtype {
        DataType::Int8 => tensor.data.iter().map(|b| i32::from(*b as i8)).collect(),
        DataType::Uint8 => tensor.data.iter().map(|b| i32::from(*b)).collect(),
        DataType::Int16 => tensor
            .data
            .chunks_exact(2)
            .map(|c| i32::from(i16::from_le_bytes([c[0], c[1]])))
            .collect(),
        DataType::Uint16 => tensor
            .data
            .chunks_exact(2)
            .map(|c| i32::from(u16::from_le_bytes([c[0], c[1]])))
            .collect(),
        other => {
            return Err(GraphError::internal(format!(
                "Unexpected DataType: {:?}",
                other
            )))
        }
    };
    store.weights_from_values(&dims, &widened)
}

/// `Identity` and `Snapshot` forward their input.
pub fn convert_identity(params: &mut OpConverterParams<'_>) -> Result<(), GraphError> {
    let Some(input) = params.inputs.first().cloned() else {
        return Err(GraphError::invalid_argument(format!(
            "{} expects an input, at {}",
            params.op(),
            params.name()
        )));
    };
    if params.validation_only {
        return Ok(());
    }
    params.outputs.push(input);
    Ok(())
}
