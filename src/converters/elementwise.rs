use crate::error::GraphError;
use crate::graph::DataType;
use crate::network::ElementWiseOp;
use crate::shape_inference::compute_broadcast_shapes;

use super::{
    allow_data_types, check_input_kinds, create_broadcastable_scalar_constant, OpConverterParams,
    FLOAT_TYPES,
};

fn element_wise_op(op: &str) -> Option<ElementWiseOp> {
    Some(match op {
        "Add" => ElementWiseOp::Sum,
        "Mul" => ElementWiseOp::Prod,
        "Sub" => ElementWiseOp::Sub,
        "Div" | "RealDiv" => ElementWiseOp::Div,
        "Minimum" => ElementWiseOp::Min,
        "Maximum" => ElementWiseOp::Max,
        "Pow" => ElementWiseOp::Pow,
        _ => return None,
    })
}

/// Two-operand arithmetic with numpy-style broadcasting. Constant operands are
/// materialized at their broadcast shape.
pub fn convert_binary(params: &mut OpConverterParams<'_>) -> Result<(), GraphError> {
    let node = params.node;
    if params.inputs.len() != 2 {
        return Err(GraphError::invalid_argument(format!(
            "Binary ops require two inputs, at {}",
            node.name
        )));
    }
    let lhs = params.inputs[0].clone();
    let rhs = params.inputs[1].clone();
    if lhs.is_weights() && rhs.is_weights() {
        return Err(GraphError::unimplemented(format!(
            "Constant folding is left to the source framework, binary op received both inputs as constants at: {}",
            node.name
        )));
    }
    let Some(op) = element_wise_op(&node.op) else {
        return Err(GraphError::unimplemented(format!(
            "Binary op {} not supported at: {}",
            node.op, node.name
        )));
    };
    let (lhs_dims, rhs_dims) = compute_broadcast_shapes(&lhs, &rhs).map_err(|err| {
        GraphError::invalid_argument(format!(
            "Unsupported binary op broadcast scheme for op {}: {}",
            node.name, err
        ))
    })?;
    let dtype: DataType = params.attrs.get("T")?;
    for operand in [&lhs, &rhs] {
        if operand.dtype() != dtype {
            return Err(GraphError::invalid_argument(format!(
                "Operand type {:?} does not match T={:?}, at {}",
                operand.dtype(),
                dtype,
                node.name
            )));
        }
    }
    if params.validation_only {
        return Ok(());
    }

    let (builder, store) = params.build()?;
    let prepared = builder
        .prepare_tensor_for_shape(store, &lhs, &lhs_dims)
        .and_then(|l| Ok((l, builder.prepare_tensor_for_shape(store, &rhs, &rhs_dims)?)));
    let (tensor_l, tensor_r) = prepared.map_err(|err| {
        GraphError::internal(format!("Failed to convert binary op {}: {}", node.name, err))
    })?;
    tracing::trace!(op = ?op, lhs = ?lhs_dims, rhs = ?rhs_dims, "binary op");
    let output = builder.layer(|net| net.add_element_wise(tensor_l.id, tensor_r.id, op))?;
    params.push_tensor(output);
    Ok(())
}

/// `x^2` as a power layer against a broadcast constant.
pub fn convert_square(params: &mut OpConverterParams<'_>) -> Result<(), GraphError> {
    check_input_kinds(params, &[("x", false)])?;
    allow_data_types(params, &FLOAT_TYPES, "T")?;
    if params.validation_only {
        return Ok(());
    }
    let input = params.inputs[0].tensor()?.clone();
    let two = create_broadcastable_scalar_constant(params, 2.0, &input.dims)?;
    let (builder, _) = params.build()?;
    let output = builder.layer(|net| net.add_element_wise(input.id, two.id, ElementWiseOp::Pow))?;
    params.push_tensor(output);
    Ok(())
}
