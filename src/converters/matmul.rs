//! MatMul and BatchMatMul. Constant operands are transposed while lowering
//! so the matrix layer only sees plain constants.

use crate::builder::{check_shape_for_reshape, NetworkBuilder};
use crate::error::GraphError;
use crate::network::MatrixOp;
use crate::reorder::reorder_ck_to_kc;
use crate::shape_inference::{has_static_shape, infer_matrix_multiply_shape, remove_batch_dimension};
use crate::values::{TensorHandle, TensorOrWeights};
use crate::weights::{ShapedWeights, WeightStore};

use super::{allow_data_types, check_input_kinds, OpConverterParams, FLOAT_TYPES};

fn matrix_op(rank: usize, transpose: bool) -> MatrixOp {
    match (rank < 2, transpose) {
        (true, _) => MatrixOp::Vector,
        (false, true) => MatrixOp::Transpose,
        (false, false) => MatrixOp::None,
    }
}

/// A fully connected layer applies when `a` is an image-like tensor and `b`
/// a constant. The layer wants `[K, C]` weights, so `b` is pre-transposed.
fn use_fully_connected(a: &TensorOrWeights, b: &TensorOrWeights, transpose_a: bool) -> bool {
    !transpose_a && a.is_tensor() && b.is_weights() && a.dims().len() >= 3
}

fn check_operands(
    params: &OpConverterParams<'_>,
    a: &TensorOrWeights,
    b: &TensorOrWeights,
    transpose_a: bool,
    transpose_b: bool,
) -> Result<(), GraphError> {
    let incompatible = || {
        GraphError::invalid_argument(format!(
            "Incompatible matrix shapes {:?} and {:?} for {}, at {}",
            a.dims(),
            b.dims(),
            params.op(),
            params.name()
        ))
    };
    if b.is_weights() && b.dims().len() != 2 {
        return Err(incompatible());
    }
    if use_fully_connected(a, b, transpose_a) {
        let a_dims = a.dims();
        let inner = &a_dims[a_dims.len() - 3..];
        let k = if transpose_b { b.dims()[1] } else { b.dims()[0] };
        if has_static_shape(inner) && inner.iter().product::<i32>() != k {
            return Err(incompatible());
        }
        return Ok(());
    }
    infer_matrix_multiply_shape(
        a.dims(),
        matrix_op(a.dims().len(), transpose_a),
        b.dims(),
        matrix_op(b.dims().len(), transpose_b),
    )
    .map(|_| ())
    .map_err(|_| incompatible())
}

/// Constant operands become constant layers, transposed up front when asked.
/// Clears `transpose` once it has been applied.
fn prepare_operand(
    builder: &mut NetworkBuilder,
    store: &mut WeightStore,
    operand: &TensorOrWeights,
    transpose: &mut bool,
) -> Result<TensorHandle, GraphError> {
    match operand {
        TensorOrWeights::Weights(weights) => {
            let weights = if *transpose {
                *transpose = false;
                reorder_ck_to_kc(store, weights)?
            } else {
                weights.clone()
            };
            builder.create_constant_layer(&weights, weights.dims())
        }
        _ => Ok(operand.tensor()?.clone()),
    }
}

fn matmul_helper(
    params: &mut OpConverterParams<'_>,
    a: &TensorOrWeights,
    b: &TensorOrWeights,
    mut transpose_a: bool,
    mut transpose_b: bool,
) -> Result<TensorHandle, GraphError> {
    let (builder, store) = params.build()?;
    if use_fully_connected(a, b, transpose_a) {
        let input = a.tensor()?;
        let raw = b.weights()?;
        let kernel = if transpose_b {
            raw.clone()
        } else {
            reorder_ck_to_kc(store, raw)?
        };
        let num_outputs = kernel.dims()[0];
        let bias = ShapedWeights::empty(kernel.dtype()).backend_weights();
        return builder.layer(|net| {
            net.add_fully_connected(input.id, num_outputs, kernel.backend_weights(), bias)
        });
    }

    let a = prepare_operand(builder, store, a, &mut transpose_a)?;
    let b = prepare_operand(builder, store, b, &mut transpose_b)?;
    let op0 = matrix_op(a.dims.len(), transpose_a);
    let op1 = matrix_op(b.dims.len(), transpose_b);
    builder.layer(|net| net.add_matrix_multiply(a.id, op0, b.id, op1))
}

pub fn convert_matmul(params: &mut OpConverterParams<'_>) -> Result<(), GraphError> {
    check_input_kinds(params, &[("a", false), ("b", true)])?;
    allow_data_types(params, &FLOAT_TYPES, "T")?;
    let transpose_a = params.attrs.get_or("transpose_a", false)?;
    let transpose_b = params.attrs.get_or("transpose_b", false)?;
    let (a, b) = (params.inputs[0].clone(), params.inputs[1].clone());
    check_operands(params, &a, &b, transpose_a, transpose_b)?;
    if params.validation_only {
        return Ok(());
    }
    let output = matmul_helper(params, &a, &b, transpose_a, transpose_b)?;
    params.push_tensor(output);
    Ok(())
}

pub fn convert_batch_matmul(params: &mut OpConverterParams<'_>) -> Result<(), GraphError> {
    allow_data_types(params, &FLOAT_TYPES, "T")?;
    if params.inputs.len() != 2 {
        return Err(GraphError::invalid_argument(format!(
            "{} got {} inputs but expected 2, at {}",
            params.op(),
            params.inputs.len(),
            params.name()
        )));
    }
    if params.inputs.iter().all(TensorOrWeights::is_weights) {
        return Err(GraphError::invalid_argument(
            "All inputs are weights, but Grappler is expected to fold them.",
        ));
    }
    let transpose_a = params.attrs.get_or("adj_x", false)?;
    let transpose_b = params.attrs.get_or("adj_y", false)?;

    // Constants carry the batch dim, which has to be 1 so it broadcasts.
    let mut operands = Vec::with_capacity(2);
    for input in params.inputs.clone() {
        let mut dims = input.dims().to_vec();
        if input.is_weights() {
            if dims.first() != Some(&1) {
                return Err(GraphError::invalid_argument(format!(
                    "Input weight attempts to broadcast across batch dimension for BatchMatMul, at {}",
                    params.name()
                )));
            }
            dims = remove_batch_dimension(&dims)?;
        }
        let operand = if params.validation_only {
            check_shape_for_reshape(&input, &dims)?;
            TensorOrWeights::placeholder(input.dtype(), dims, input.batch_size())
        } else {
            let (builder, store) = params.build()?;
            TensorOrWeights::from(builder.prepare_tensor_for_shape(store, &input, &dims)?)
        };
        operands.push(operand);
    }
    let (a, b) = (&operands[0], &operands[1]);
    check_operands(params, a, b, transpose_a, transpose_b)?;
    if params.validation_only {
        return Ok(());
    }
    let output = matmul_helper(params, a, b, transpose_a, transpose_b)?;
    params.push_tensor(output);
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::converters::testing::*;
    use crate::error::ErrorKind;
    use crate::graph::{AttrValue, NodeDef};
    use crate::network::{LayerKind, MatrixOp};

    fn matmul(transpose_b: bool) -> NodeDef {
        typed("mm", "MatMul").with_attr("transpose_b", AttrValue::B(transpose_b))
    }

    fn ops(lowered: &Lowered) -> (MatrixOp, MatrixOp) {
        match &lowered.network.layers().last().unwrap().kind {
            LayerKind::MatrixMultiply { op0, op1 } => (*op0, *op1),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn vector_times_constant_matrix() {
        let b: Vec<f32> = (0..12).map(|v| v as f32).collect();
        let lowered = lower(
            &matmul(false),
            &[tensor("a", &[1, 4]), consts("b", &[4, 3], &b)],
        )
        .unwrap();
        assert_eq!(lowered.layer_types(), vec!["Constant", "MatrixMultiply"]);
        assert_eq!(lowered.output_dims(0), vec![3]);
        assert_eq!(ops(&lowered), (MatrixOp::Vector, MatrixOp::None));
    }

    #[test]
    fn transposed_constants_are_reordered() {
        let b: Vec<f32> = (0..12).map(|v| v as f32).collect();
        let lowered = lower(
            &matmul(true),
            &[tensor("a", &[1, 4]), consts("b", &[3, 4], &b)],
        )
        .unwrap();
        assert_eq!(ops(&lowered), (MatrixOp::Vector, MatrixOp::None));
        assert_eq!(lowered.output_dims(0), vec![3]);
        let constant = lowered.network.layers()[0].outputs[0];
        assert_eq!(lowered.network.dims(constant).unwrap(), vec![4, 3]);
    }

    #[test]
    fn image_inputs_use_fully_connected() {
        let b = vec![1.0f32; 12];
        let lowered = lower(
            &matmul(false),
            &[tensor("a", &[1, 2, 2, 1]), consts("b", &[4, 3], &b)],
        )
        .unwrap();
        assert_eq!(lowered.layer_types(), vec!["FullyConnected"]);
        assert_eq!(lowered.output_dims(0), vec![3, 1, 1]);
    }

    #[test]
    fn mismatched_inner_dims_are_rejected() {
        let err = lower(
            &matmul(false),
            &[tensor("a", &[1, 5]), consts("b", &[4, 3], &[0.0; 12])],
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn batch_matmul_of_two_tensors() {
        let node = typed("bmm", "BatchMatMul").with_attr("adj_y", AttrValue::B(true));
        let lowered = lower(
            &node,
            &[tensor("x", &[1, 2, 3, 4]), tensor("y", &[1, 2, 5, 4])],
        )
        .unwrap();
        assert_eq!(lowered.output_dims(0), vec![2, 3, 5]);
        assert_eq!(ops(&lowered), (MatrixOp::None, MatrixOp::Transpose));
    }

    #[test]
    fn batch_matmul_constants_drop_their_batch() {
        let node = typed("bmm", "BatchMatMul");
        let lowered = lower(
            &node,
            &[tensor("x", &[1, 2, 3, 4]), consts("y", &[1, 4, 5], &[0.5; 20])],
        )
        .unwrap();
        assert_eq!(lowered.layer_types(), vec!["Constant", "MatrixMultiply"]);
        assert_eq!(lowered.output_dims(0), vec![2, 3, 5]);

        let err = lower(
            &node,
            &[tensor("x", &[1, 2, 3, 4]), consts("y", &[2, 4, 5], &[0.5; 40])],
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let err = lower(
            &node,
            &[consts("x", &[1, 3, 4], &[0.5; 12]), consts("y", &[1, 4, 5], &[0.5; 20])],
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }
}
