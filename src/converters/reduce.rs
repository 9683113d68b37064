use crate::error::GraphError;
use crate::graph::DataType;
use crate::network::{ReduceOp, TopKOp};
use crate::shape_inference::convert_axis;
use crate::values::TensorOrWeights;

use super::{allow_data_types, check_input_kinds, int_values, OpConverterParams, FLOAT_TYPES};

pub fn convert_softmax(params: &mut OpConverterParams<'_>) -> Result<(), GraphError> {
    check_input_kinds(params, &[("logits", false)])?;
    allow_data_types(params, &FLOAT_TYPES, "T")?;
    let rank = params.inputs[0].dims().len();
    if rank == 0 {
        return Err(GraphError::invalid_argument(format!(
            "Softmax cannot apply on the batch dimension, at {}",
            params.name()
        )));
    }
    if params.validation_only {
        return Ok(());
    }

    let input = params.inputs[0].tensor()?.clone();
    let (builder, _) = params.build()?;
    let output = builder.layer(|net| net.add_softmax(input.id, 1 << (rank - 1)))?;
    // Softmax outputs are probabilities.
    builder.provide_quantization_range(&output, 0.0, 1.0);
    params.push_tensor(output);
    Ok(())
}

pub fn convert_reduce(params: &mut OpConverterParams<'_>) -> Result<(), GraphError> {
    check_input_kinds(params, &[("input", false), ("axis", true)])?;
    allow_data_types(params, &FLOAT_TYPES, "T")?;
    if params.attrs.get_or("Tidx", DataType::Int32)? != DataType::Int32 {
        return Err(GraphError::unimplemented("Tidx supports only DT_INT32"));
    }
    let tf_axes = int_values(&*params.weight_store, params.inputs[1].weights()?)?;
    if tf_axes.is_empty() {
        return Err(GraphError::invalid_argument(format!(
            "Reduce on all dimensions including batch is not supported, at {}",
            params.name()
        )));
    }
    let rank = params.inputs[0].dims().len();
    let mut axes = 0u32;
    for tf_axis in tf_axes {
        axes |= 1 << convert_axis(tf_axis, rank, params.name())?;
    }
    let op = match params.op() {
        "Sum" => ReduceOp::Sum,
        "Prod" => ReduceOp::Prod,
        "Max" => ReduceOp::Max,
        "Min" => ReduceOp::Min,
        "Mean" => ReduceOp::Avg,
        other => {
            return Err(GraphError::unimplemented(format!(
                "Op not supported {}, at {}",
                other,
                params.name()
            )))
        }
    };
    if params.validation_only {
        return Ok(());
    }

    let keep_dims = params.attrs.get_or("keep_dims", false)?;
    let input = params.inputs[0].tensor()?.clone();
    let (builder, _) = params.build()?;
    let output = builder.layer(|net| net.add_reduce(input.id, op, axes, keep_dims))?;
    params.push_tensor(output);
    Ok(())
}

/// ArgMin and ArgMax: a top-1 over `dimension` whose index output loses
/// the reduced axis.
pub fn convert_arg_min_max(params: &mut OpConverterParams<'_>) -> Result<(), GraphError> {
    check_input_kinds(params, &[("input", false), ("dimension", true)])?;
    allow_data_types(params, &FLOAT_TYPES, "T")?;
    // Int64 indices have no backend type.
    let output_type = params.attrs.get_or("output_type", DataType::Int64)?;
    if output_type != DataType::Int32 {
        return Err(GraphError::unimplemented(format!(
            "Output type {:?} is not supported, at {}",
            output_type,
            params.name()
        )));
    }
    let tf_axis = int_values(&*params.weight_store, params.inputs[1].weights()?)?
        .first()
        .copied()
        .ok_or_else(|| {
            GraphError::invalid_argument(format!(
                "Dimension for {} must not be empty, at {}",
                params.op(),
                params.name()
            ))
        })?;
    let dims = params.inputs[0].dims().to_vec();
    let axis = convert_axis(tf_axis, dims.len(), params.name())?;
    let op = match params.op() {
        "ArgMin" => TopKOp::Min,
        "ArgMax" => TopKOp::Max,
        _ => return Err(GraphError::invalid_argument("Unsupported ArgMin/Max operation")),
    };
    if params.validation_only {
        return Ok(());
    }

    let input = params.inputs[0].tensor()?.clone();
    let mut squeezed = dims;
    squeezed.remove(axis);
    let (builder, store) = params.build()?;
    let (_, indices) = builder
        .network_mut()
        .add_top_k(input.id, op, 1, 1 << axis)?;
    let indices = builder.handle(indices)?;
    let output =
        builder.prepare_tensor_for_shape(store, &TensorOrWeights::from(indices), &squeezed)?;
    params.push_tensor(output);
    Ok(())
}

/// TopKV2 along the last axis. Outputs are always sorted.
pub fn convert_top_k(params: &mut OpConverterParams<'_>) -> Result<(), GraphError> {
    check_input_kinds(params, &[("input", false), ("k", true)])?;
    allow_data_types(params, &FLOAT_TYPES, "T")?;
    let dims = params.inputs[0].dims().to_vec();
    if dims.is_empty() {
        return Err(GraphError::invalid_argument(format!(
            "TopK cannot apply on the batch dimension, at {}",
            params.name()
        )));
    }
    let k = match int_values(&*params.weight_store, params.inputs[1].weights()?)?.as_slice() {
        [k] => *k,
        _ => {
            return Err(GraphError::invalid_argument(format!(
                "k value of TopK should be a scalar, at {}",
                params.name()
            )))
        }
    };
    let last = dims[dims.len() - 1];
    if k <= 0 || (last >= 0 && k > last) {
        return Err(GraphError::invalid_argument(format!(
            "k={} is out of range for a last dimension of {}, at {}",
            k,
            last,
            params.name()
        )));
    }
    if params.validation_only {
        return Ok(());
    }

    let input = params.inputs[0].tensor()?.clone();
    let axes = 1 << (dims.len() - 1);
    let (builder, _) = params.build()?;
    let (values, indices) = builder
        .network_mut()
        .add_top_k(input.id, TopKOp::Max, k, axes)?;
    let values = builder.handle(values)?;
    let indices = builder.handle(indices)?;
    params.push_tensor(values);
    params.push_tensor(indices);
    Ok(())
}
