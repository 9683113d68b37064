use crate::builder::check_shape_for_reshape;
use crate::error::GraphError;
use crate::graph::DataType;
use crate::shape_inference::{convert_axis, reshape_may_change_batch_dim, verify_shapes_match};
use crate::values::TensorOrWeights;
use crate::weights::MAX_DIMS;

use super::{
    allow_data_types, check_input_kinds, int_values, OpConverterParams, FLOAT_AND_INT_TYPES,
    FLOAT_TYPES,
};

/// The single value of a constant axis input.
pub(super) fn scalar_axis(
    params: &OpConverterParams<'_>,
    index: usize,
) -> Result<i32, GraphError> {
    let values = int_values(&*params.weight_store, params.inputs[index].weights()?)?;
    match values.as_slice() {
        [axis] => Ok(*axis),
        _ => Err(GraphError::invalid_argument(format!(
            "Axis for {} must be a scalar, at {}",
            params.op(),
            params.name()
        ))),
    }
}

/// Reshape `input` to `dims`, or only check that it can be reshaped when
/// validating.
fn reshape_to(
    params: &mut OpConverterParams<'_>,
    input: &TensorOrWeights,
    dims: &[i32],
) -> Result<(), GraphError> {
    if params.validation_only {
        return check_shape_for_reshape(input, dims);
    }
    let (builder, store) = params.build()?;
    let output = builder.prepare_tensor_for_shape(store, input, dims)?;
    params.push_tensor(output);
    Ok(())
}

pub fn convert_transpose(params: &mut OpConverterParams<'_>) -> Result<(), GraphError> {
    check_input_kinds(params, &[("x", false), ("perm", true)])?;
    allow_data_types(params, &FLOAT_AND_INT_TYPES, "T")?;
    let perm = int_values(&*params.weight_store, params.inputs[1].weights()?)?;
    if perm.len() != params.inputs[0].dims().len() + 1 {
        return Err(GraphError::invalid_argument(
            "Rank of perm for transpose does not match with that of the input.",
        ));
    }
    if perm[0] != 0 {
        return Err(GraphError::unimplemented(
            "Transpose at batch dimension is not supported.",
        ));
    }
    // Every axis exactly once.
    let mut seen = vec![false; perm.len()];
    let mut order = Vec::with_capacity(perm.len());
    for p in &perm {
        match usize::try_from(*p) {
            Ok(axis) if axis < seen.len() && !seen[axis] => {
                seen[axis] = true;
                order.push(axis);
            }
            _ => {
                return Err(GraphError::invalid_argument(format!(
                    "Invalid permutation {:?}, at {}",
                    perm,
                    params.name()
                )))
            }
        }
    }
    if params.validation_only {
        return Ok(());
    }
    let input = params.inputs[0].tensor()?.clone();
    let (builder, _) = params.build()?;
    let output = builder.transpose_tensor(&input, &order)?;
    params.push_tensor(output);
    Ok(())
}

/// The first entry of the shape constant is the batch slot. Reshapes that
/// might move data across the batch dim are rejected.
pub fn convert_reshape(params: &mut OpConverterParams<'_>) -> Result<(), GraphError> {
    check_input_kinds(params, &[("tensor", false), ("shape", true)])?;
    allow_data_types(params, &FLOAT_AND_INT_TYPES, "T")?;
    let shape_weights = params.inputs[1].weights()?;
    if shape_weights.count() == 0 {
        return Err(GraphError::unimplemented(format!(
            "Reshape to shape=[] is not supported, at {}",
            params.name()
        )));
    }
    let shape = int_values(&*params.weight_store, shape_weights)?;
    if shape.iter().any(|d| *d < -1) || shape.iter().filter(|d| **d == -1).count() > 1 {
        return Err(GraphError::invalid_argument(format!(
            "Reshape dims {:?} must be non-negative with at most one -1, at {}",
            shape,
            params.name()
        )));
    }
    let input = params.inputs[0].clone();
    let (reshape_batch, reshape_dims) = (shape[0], &shape[1..]);
    tracing::debug!(
        input_batch = input.batch_size(),
        input_dims = ?input.dims(),
        reshape_batch,
        ?reshape_dims,
        "reshape"
    );
    if reshape_may_change_batch_dim(input.batch_size(), input.dims(), reshape_batch, reshape_dims)
    {
        return Err(GraphError::unimplemented(format!(
            "Reshape on batch dimension is not supported, at {}",
            params.name()
        )));
    }
    reshape_to(params, &input, reshape_dims)
}

pub fn convert_expand_dims(params: &mut OpConverterParams<'_>) -> Result<(), GraphError> {
    check_input_kinds(params, &[("input", false), ("axis", true)])?;
    allow_data_types(params, &FLOAT_AND_INT_TYPES, "T")?;
    let input = params.inputs[0].clone();
    let axis = scalar_axis(params, 1)?;
    // One past the last dim is a valid insertion point.
    let axis = convert_axis(axis, input.dims().len() + 1, params.name())?;
    let mut dims = input.dims().to_vec();
    dims.insert(axis, 1);
    reshape_to(params, &input, &dims)
}

pub fn convert_squeeze(params: &mut OpConverterParams<'_>) -> Result<(), GraphError> {
    check_input_kinds(params, &[("input", false)])?;
    allow_data_types(params, &FLOAT_AND_INT_TYPES, "T")?;
    let input = params.inputs[0].clone();
    let squeeze_dims: Vec<i32> = params.attrs.get_or("squeeze_dims", Vec::new())?;
    if squeeze_dims.is_empty() {
        return Err(GraphError::unimplemented(format!(
            "Squeeze is only implemented for explicit dims, at {}",
            params.name()
        )));
    }
    let mut keep: Vec<Option<i32>> = input.dims().iter().copied().map(Some).collect();
    for tf_axis in squeeze_dims {
        let axis = convert_axis(tf_axis, keep.len(), params.name())?;
        if keep[axis] != Some(1) {
            return Err(GraphError::invalid_argument(format!(
                "Dimension {} with size {} cannot be squeezed because it must be size 1, at {}",
                tf_axis,
                keep[axis].unwrap_or(0),
                params.name()
            )));
        }
        keep[axis] = None;
    }
    let dims: Vec<i32> = keep.into_iter().flatten().collect();
    reshape_to(params, &input, &dims)
}

/// Expand every input at `axis`, then concatenate along it.
pub fn convert_pack(params: &mut OpConverterParams<'_>) -> Result<(), GraphError> {
    let n: i64 = params.attrs.get("N")?;
    if n < 1 || usize::try_from(n).ok() != Some(params.inputs.len()) {
        return Err(GraphError::invalid_argument(format!(
            "Number of inputs for Pack is inconsistent with N attribute, at {}",
            params.name()
        )));
    }
    let labels: Vec<String> = (0..params.inputs.len())
        .map(|i| format!("values_{}", i))
        .collect();
    let expected: Vec<(&str, bool)> = labels.iter().map(|l| (l.as_str(), false)).collect();
    check_input_kinds(params, &expected)?;
    allow_data_types(params, &FLOAT_TYPES, "T")?;
    if params.inputs.len() > 1 {
        verify_shapes_match(&params.inputs, None, params.name())?;
    }
    let axis: i32 = params.attrs.get("axis")?;
    let mut dims = params.inputs[0].dims().to_vec();
    let axis = convert_axis(axis, dims.len() + 1, params.name())?;
    dims.insert(axis, 1);

    let inputs = params.inputs.clone();
    if params.validation_only {
        for input in &inputs {
            check_shape_for_reshape(input, &dims)?;
        }
        return Ok(());
    }
    let (builder, store) = params.build()?;
    let expanded = inputs
        .iter()
        .map(|input| builder.prepare_tensor_for_shape(store, input, &dims))
        .collect::<Result<Vec<_>, _>>()?;
    let output = match expanded.as_slice() {
        [single] => single.clone(),
        _ => {
            let ids: Vec<_> = expanded.iter().map(|t| t.id).collect();
            builder.layer(|net| net.add_concatenation(&ids, axis))?
        }
    };
    params.push_tensor(output);
    Ok(())
}

/// `ConcatV2`: `N` tensors followed by a constant axis.
pub fn convert_concat(params: &mut OpConverterParams<'_>) -> Result<(), GraphError> {
    let n: i64 = params.attrs.get("N")?;
    let n = usize::try_from(n)
        .ok()
        .filter(|n| *n >= 1 && n + 1 == params.inputs.len())
        .ok_or_else(|| {
            GraphError::invalid_argument(format!(
                "Number of inputs for ConcatV2 is inconsistent with N attribute, at {}",
                params.name()
            ))
        })?;
    let labels: Vec<String> = (0..n).map(|i| format!("values_{}", i)).collect();
    let mut expected: Vec<(&str, bool)> = labels.iter().map(|l| (l.as_str(), false)).collect();
    expected.push(("axis", true));
    check_input_kinds(params, &expected)?;
    allow_data_types(params, &FLOAT_TYPES, "T")?;
    let axis = scalar_axis(params, n)?;
    let axis = convert_axis(axis, params.inputs[0].dims().len(), params.name())?;
    verify_shapes_match(&params.inputs[..n], Some(axis), params.name())?;
    if params.validation_only {
        return Ok(());
    }
    let ids = params.inputs[..n]
        .iter()
        .map(|input| input.tensor().map(|t| t.id))
        .collect::<Result<Vec<_>, _>>()?;
    let (builder, _) = params.build()?;
    let output = builder.layer(|net| net.add_concatenation(&ids, axis))?;
    params.push_tensor(output);
    Ok(())
}

/// Constant padding of at most two of the spatial axes of a rank-4 input.
/// Channel padding is done by swapping the channel axis into the width slot.
pub fn convert_pad(params: &mut OpConverterParams<'_>) -> Result<(), GraphError> {
    check_input_kinds(params, &[("tensor", false), ("paddings", true)])?;
    allow_data_types(params, &FLOAT_TYPES, "T")?;
    let nb_dims = params.inputs[0].dims().len() + 1;
    let pads_weights = params.inputs[1].weights()?;
    if nb_dims != 4 || pads_weights.dims() != [4, 2] {
        return Err(GraphError::invalid_argument(format!(
            "Pad only supports explicit padding on 4 dimensional tensor, at {}",
            params.name()
        )));
    }
    let padding_type: DataType = params.attrs.get("Tpaddings")?;
    if padding_type != DataType::Int32 {
        return Err(GraphError::unimplemented("Tpaddings supports only DT_INT32"));
    }
    let pads = int_values(&*params.weight_store, pads_weights)?;
    let pad_index: Vec<usize> = (0..nb_dims)
        .filter(|i| pads[2 * i] != 0 || pads[2 * i + 1] != 0)
        .collect();

    if pad_index.is_empty() {
        let input = params.inputs[0].clone();
        params.outputs.push(input);
        return Ok(());
    }
    if pad_index.len() > 2 {
        return Err(GraphError::invalid_argument(
            "Padding layer does not support padding on > 2",
        ));
    }
    if pad_index[0] == 0 {
        return Err(GraphError::invalid_argument(
            "Padding layer does not support padding on batch dimension",
        ));
    }
    // Swapping C into the W slot would collide with a W padding.
    if pad_index == [1, 3] {
        return Err(GraphError::unimplemented(
            "Padding layer does not support padding on dimension 1 and 3 yet",
        ));
    }
    if params.validation_only {
        return Ok(());
    }

    let swap_channel = pad_index[0] == 1;
    let mut pre = [0; 2];
    let mut post = [0; 2];
    for &index in &pad_index {
        let slot = if index == 1 { 3 } else { index };
        pre[slot - 2] = pads[2 * index];
        post[slot - 2] = pads[2 * index + 1];
    }

    let input = params.inputs[0].tensor()?.clone();
    let (builder, _) = params.build()?;
    let tensor = if swap_channel {
        builder.transpose_tensor(&input, &[0, 3, 2, 1])?
    } else {
        input
    };
    let padded = builder.layer(|net| net.add_padding(tensor.id, pre, post))?;
    builder.mark_quantization_ranges_as_inferrable(&tensor, &padded);
    let output = if swap_channel {
        builder.transpose_tensor(&padded, &[0, 3, 2, 1])?
    } else {
        padded
    };
    params.push_tensor(output);
    Ok(())
}

/// `GatherV2` with tensor indices of batch 1. The gather layer folds the
/// index batch away, so a unit dim is restored at `axis`.
pub fn convert_gather(params: &mut OpConverterParams<'_>) -> Result<(), GraphError> {
    check_input_kinds(params, &[("params", false), ("indices", false), ("axis", true)])?;
    allow_data_types(params, &FLOAT_AND_INT_TYPES, "Tparams")?;
    let axis = scalar_axis(params, 2)?;
    let data = params.inputs[0].clone();
    let indices = params.inputs[1].clone();
    let axis = convert_axis(axis, data.dims().len(), params.name())?;
    if indices.batch_size() != 1 {
        return Err(GraphError::invalid_argument(
            "Only indices with batch 1 are supported.",
        ));
    }
    let output_rank = data.dims().len() + indices.dims().len() + 1;
    if output_rank > MAX_DIMS + 1 {
        return Err(GraphError::invalid_argument(format!(
            "Result of gather has dimension greater than {}",
            MAX_DIMS + 1
        )));
    }
    if params.validation_only {
        return Ok(());
    }

    let (data, indices) = (data.tensor()?.clone(), indices.tensor()?.clone());
    let (builder, store) = params.build()?;
    let gathered = builder.layer(|net| net.add_gather(data.id, indices.id, axis))?;
    if gathered.dims.len() != output_rank - 2 {
        return Err(GraphError::internal(format!(
            "Get unexpected output dimensions of gather layer. Expect nbDims: {}, actual nbDims: {}",
            output_rank - 2,
            gathered.dims.len()
        )));
    }
    let mut dims = gathered.dims.clone();
    dims.insert(axis, 1);
    let output = builder.prepare_tensor_for_shape(store, &TensorOrWeights::from(gathered), &dims)?;
    params.push_tensor(output);
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::converters::testing::*;
    use crate::error::ErrorKind;
    use crate::graph::{AttrValue, DataType, NodeDef};
    use crate::network::LayerKind;

    #[test]
    fn transpose_keeps_the_batch_in_front() {
        let node = typed("t", "Transpose");
        let lowered = lower(
            &node,
            &[tensor("x", &[1, 2, 3, 4]), int_consts("perm", &[4], &[0, 3, 1, 2])],
        )
        .unwrap();
        assert_eq!(lowered.output_dims(0), vec![4, 2, 3]);
        assert_eq!(lowered.layer_types(), vec!["Shuffle"]);

        let err = lower(
            &node,
            &[tensor("x", &[1, 2, 3, 4]), int_consts("perm", &[4], &[1, 0, 2, 3])],
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unimplemented);

        let err = lower(
            &node,
            &[tensor("x", &[1, 2, 3, 4]), int_consts("perm", &[3], &[0, 2, 1])],
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn reshape_batch_rules() {
        let node = typed("r", "Reshape");
        let x = || tensor("x", &[4, 6]);
        let ok = lower(&node, &[x(), int_consts("s", &[3], &[4, 2, 3])]).unwrap();
        assert_eq!(ok.output_dims(0), vec![2, 3]);
        let ok = lower(&node, &[x(), int_consts("s", &[2], &[-1, 6])]).unwrap();
        assert_eq!(ok.output_dims(0), vec![6]);
        assert!(ok.network.layers().is_empty());

        for shape in [vec![-1, 24], vec![2, 12]] {
            let err = lower(&node, &[x(), int_consts("s", &[2], &shape)]).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Unimplemented, "shape {:?}", shape);
        }
        let err = lower(&node, &[x(), int_consts("s", &[0], &[])]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unimplemented);
    }

    #[test]
    fn reshape_rejects_malformed_dims() {
        let node = typed("r", "Reshape");
        let x = || tensor("x", &[1, 2, 12]);
        for shape in [vec![1, -2, 12], vec![1, -1, -1], vec![-1, 2, -1]] {
            let err = lower(&node, &[x(), int_consts("s", &[3], &shape)]).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument, "shape {:?}", shape);
        }
        let ok = lower(&node, &[x(), int_consts("s", &[3], &[1, -1, 4])]).unwrap();
        assert_eq!(ok.output_dims(0), vec![6, 4]);
    }

    #[test]
    fn transpose_perm_must_be_a_permutation() {
        let node = typed("t", "Transpose");
        for perm in [[0, 3, 3, 1], [0, 1, 2, 4], [0, -1, 2, 3]] {
            let err = lower(
                &node,
                &[tensor("x", &[1, 2, 3, 4]), int_consts("perm", &[4], &perm)],
            )
            .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument, "perm {:?}", perm);
        }
    }

    #[test]
    fn reshape_with_fixed_batch_checks_element_count() {
        let err = lower(
            &typed("r", "Reshape"),
            &[tensor("x", &[2, 3, 4]), int_consts("s", &[2], &[2, 5])],
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn expand_dims_accepts_the_end_position() {
        let node = typed("e", "ExpandDims");
        let lowered = lower(
            &node,
            &[tensor("x", &[1, 2, 3]), int_consts("axis", &[], &[-1])],
        )
        .unwrap();
        assert_eq!(lowered.output_dims(0), vec![2, 3, 1]);

        let err = lower(
            &node,
            &[tensor("x", &[1, 2, 3]), int_consts("axis", &[], &[0])],
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unimplemented);

        let err = lower(
            &node,
            &[tensor("x", &[1, 2, 3]), int_consts("axis", &[2], &[1, 2])],
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn squeeze_needs_explicit_unit_dims() {
        let squeeze = |dims: Vec<i64>| {
            typed("s", "Squeeze").with_attr("squeeze_dims", AttrValue::ListI(dims))
        };
        let lowered = lower(&squeeze(vec![2]), &[tensor("x", &[1, 2, 1, 3])]).unwrap();
        assert_eq!(lowered.output_dims(0), vec![2, 3]);

        let err = lower(&squeeze(vec![1]), &[tensor("x", &[1, 2, 1, 3])]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = lower(&squeeze(vec![2, -2]), &[tensor("x", &[1, 2, 1, 3])]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = lower(&typed("s", "Squeeze"), &[tensor("x", &[1, 1])]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unimplemented);
    }

    fn pack(n: i64, axis: i64) -> NodeDef {
        typed("p", "Pack")
            .with_attr("N", AttrValue::I(n))
            .with_attr("axis", AttrValue::I(axis))
    }

    #[test]
    fn pack_expands_then_concatenates() {
        let lowered = lower(
            &pack(2, 1),
            &[tensor("a", &[1, 2, 3]), tensor("b", &[1, 2, 3])],
        )
        .unwrap();
        assert_eq!(lowered.output_dims(0), vec![2, 2, 3]);
        assert_eq!(
            lowered.layer_types(),
            vec!["Shuffle", "Shuffle", "Concatenation"]
        );

        let single = lower(&pack(1, -1), &[tensor("a", &[1, 2, 3])]).unwrap();
        assert_eq!(single.output_dims(0), vec![2, 3, 1]);
        assert_eq!(single.layer_types(), vec!["Shuffle"]);
    }

    #[test]
    fn pack_rejects_mismatched_inputs() {
        let err = lower(
            &pack(2, 1),
            &[tensor("a", &[1, 2, 3]), tensor("b", &[1, 2, 4])],
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = lower(&pack(3, 1), &[tensor("a", &[1, 2])]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn concat_along_channels() {
        let node = typed("c", "ConcatV2").with_attr("N", AttrValue::I(2));
        let lowered = lower(
            &node,
            &[
                tensor("a", &[1, 2, 3]),
                tensor("b", &[1, 2, 5]),
                int_consts("axis", &[], &[2]),
            ],
        )
        .unwrap();
        assert_eq!(lowered.output_dims(0), vec![2, 8]);
        match &lowered.network.layers()[0].kind {
            LayerKind::Concatenation { axis } => assert_eq!(*axis, 1),
            other => panic!("unexpected {:?}", other),
        }

        let err = lower(
            &node,
            &[
                tensor("a", &[1, 2, 3]),
                tensor("b", &[1, 4, 5]),
                int_consts("axis", &[], &[2]),
            ],
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let err = lower(
            &node,
            &[
                tensor("a", &[1, 2, 3]),
                tensor("b", &[1, 2, 3]),
                int_consts("axis", &[], &[0]),
            ],
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unimplemented);
    }

    fn pad() -> NodeDef {
        typed("pad", "Pad").with_attr("Tpaddings", AttrValue::Type(DataType::Int32))
    }

    #[test]
    fn pad_spatial_axes() {
        let lowered = lower(
            &pad(),
            &[
                tensor("x", &[1, 3, 4, 4]),
                int_consts("p", &[4, 2], &[0, 0, 0, 0, 1, 1, 2, 0]),
            ],
        )
        .unwrap();
        assert_eq!(lowered.output_dims(0), vec![3, 6, 6]);
        match &lowered.network.layers()[0].kind {
            LayerKind::Padding { pre, post } => {
                assert_eq!(*pre, [1, 2]);
                assert_eq!(*post, [1, 0]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn pad_channels_through_a_transpose() {
        let lowered = lower(
            &pad(),
            &[
                tensor("x", &[1, 3, 4, 4]),
                int_consts("p", &[4, 2], &[0, 0, 1, 1, 0, 0, 0, 0]),
            ],
        )
        .unwrap();
        assert_eq!(lowered.output_dims(0), vec![5, 4, 4]);
        assert_eq!(lowered.layer_types(), vec!["Shuffle", "Padding", "Shuffle"]);
    }

    #[test]
    fn pad_edge_cases() {
        let zeros = lower(
            &pad(),
            &[tensor("x", &[1, 3, 4, 4]), int_consts("p", &[4, 2], &[0; 8])],
        )
        .unwrap();
        assert!(zeros.network.layers().is_empty());
        assert_eq!(zeros.output_dims(0), vec![3, 4, 4]);

        for pads in [[1, 0, 0, 0, 0, 0, 0, 0], [0, 0, 1, 0, 1, 0, 1, 0]] {
            let err = lower(
                &pad(),
                &[tensor("x", &[1, 3, 4, 4]), int_consts("p", &[4, 2], &pads)],
            )
            .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        }
        let err = lower(
            &pad(),
            &[
                tensor("x", &[1, 3, 4, 4]),
                int_consts("p", &[4, 2], &[0, 0, 1, 0, 0, 0, 1, 0]),
            ],
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unimplemented);
        let err = lower(
            &pad(),
            &[tensor("x", &[1, 4, 4]), int_consts("p", &[3, 2], &[0; 6])],
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    fn gather() -> NodeDef {
        NodeDef::new("g", "GatherV2").with_attr("Tparams", AttrValue::Type(DataType::Float32))
    }

    #[test]
    fn gather_restores_the_index_batch() {
        let lowered = lower(
            &gather(),
            &[
                tensor("x", &[1, 5, 6]),
                tensor_of("i", DataType::Int32, &[1, 3]),
                int_consts("axis", &[], &[1]),
            ],
        )
        .unwrap();
        assert_eq!(lowered.layer_types(), vec!["Gather", "Shuffle"]);
        assert_eq!(lowered.output_dims(0), vec![1, 3, 6]);
    }

    #[test]
    fn gather_needs_unit_index_batch() {
        let err = lower(
            &gather(),
            &[
                tensor("x", &[2, 5, 6]),
                tensor_of("i", DataType::Int32, &[2, 3]),
                int_consts("axis", &[], &[1]),
            ],
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }
}
