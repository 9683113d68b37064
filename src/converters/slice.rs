//! Slicing family. Every op here is reduced to `(begin, size, stride)` over
//! the input dims with a synthetic batch entry at index 0, which is checked
//! and then dropped before the slice layer is added.

use crate::error::GraphError;
use crate::shape_inference::convert_axis;
use crate::values::{TensorHandle, TensorOrWeights};

use super::shape_ops::scalar_axis;
use super::{allow_data_types, check_input_kinds, int_values, OpConverterParams, FLOAT_AND_INT_TYPES};

/// Bounds-check a canonical slice and add the layer. Returns `None` when
/// validating. Dims that are not known statically are only checked for a
/// non-negative begin; a size of `-1` on such a dim means "to the end".
fn strided_slice_helper(
    params: &mut OpConverterParams<'_>,
    input: &TensorOrWeights,
    begin: &[i32],
    size: &[i32],
    stride: &[i32],
) -> Result<Option<TensorHandle>, GraphError> {
    let dims = input.dims();
    let rank = dims.len() + 1;
    if begin.len() != rank || size.len() != rank || stride.len() != rank {
        return Err(GraphError::internal(format!(
            "Slice of rank {} got begin {:?}, size {:?}, stride {:?}, at {}",
            rank,
            begin,
            size,
            stride,
            params.name()
        )));
    }
    for i in 1..rank {
        let dim = dims[i - 1];
        let known = dim >= 0;
        if begin[i] < 0 || (known && begin[i] > dim) {
            return Err(GraphError::invalid_argument(format!(
                "\"begin\" for dimension {} in {} is out of range, at {}",
                i,
                params.op(),
                params.name()
            )));
        }
        let end = begin[i] + size[i];
        if known && (end < 0 || end > dim) {
            return Err(GraphError::invalid_argument(format!(
                "\"begin\" + \"size\" for dimension {} in {} is out of range, at {}",
                i,
                params.op(),
                params.name()
            )));
        }
        if size[i] <= 0 && !(!known && size[i] == -1) {
            return Err(GraphError::invalid_argument(format!(
                "\"size\" cannot be negative or zero for {}, at {}",
                params.op(),
                params.name()
            )));
        }
    }
    if params.validation_only {
        return Ok(None);
    }
    let tensor = input.tensor()?.clone();
    let (start, size, stride) = (begin[1..].to_vec(), size[1..].to_vec(), stride[1..].to_vec());
    let (builder, _) = params.build()?;
    let output = builder.layer(|net| net.add_slice(tensor.id, start, size, stride))?;
    Ok(Some(output))
}

fn batch_dim_error(params: &OpConverterParams<'_>) -> GraphError {
    GraphError::unimplemented(format!(
        "The batch dimension cannot be modified, at {}",
        params.name()
    ))
}

pub fn convert_slice(params: &mut OpConverterParams<'_>) -> Result<(), GraphError> {
    check_input_kinds(params, &[("input", false), ("begin", true), ("size", true)])?;
    allow_data_types(params, &FLOAT_AND_INT_TYPES, "T")?;
    let store = &*params.weight_store;
    let begin = int_values(store, params.inputs[1].weights()?)?;
    let mut size = int_values(store, params.inputs[2].weights()?)?;
    let input = params.inputs[0].clone();

    let mut input_dims = vec![input.batch_size()];
    input_dims.extend_from_slice(input.dims());
    if begin.len() != input_dims.len() || size.len() != input_dims.len() {
        return Err(GraphError::invalid_argument(format!(
            "Length of begin and size arguments must equal rank of input for Slice, at {}",
            params.name()
        )));
    }
    // With an unknown batch only `-1` provably keeps it.
    let batch = input_dims[0];
    let size_is_modified = size[0] != -1 && (batch <= 0 || size[0] != batch);
    if begin[0] != 0 || size_is_modified {
        return Err(batch_dim_error(params));
    }
    for i in 1..input_dims.len() {
        if size[i] == -1 && input_dims[i] >= 0 {
            size[i] = input_dims[i] - begin[i];
        }
    }
    let stride = vec![1; begin.len()];
    if let Some(output) = strided_slice_helper(params, &input, &begin, &size, &stride)? {
        params.push_tensor(output);
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
struct SliceMasks {
    begin: i64,
    end: i64,
    ellipsis: i64,
}

impl SliceMasks {
    fn bit(mask: i64, index: usize) -> bool {
        index < 64 && (mask >> index) & 1 == 1
    }
}

/// Resolve a possibly negative index against `dim` and clamp it into range.
/// Negative indices cannot be resolved against an unknown dim.
fn canonical_index(index: i32, dim: i32, node: &str) -> Result<i32, GraphError> {
    if dim < 0 {
        if index < 0 {
            return Err(GraphError::unimplemented(format!(
                "Negative slice index on a dimension of unknown size, at {}",
                node
            )));
        }
        return Ok(index);
    }
    let index = if index < 0 { index + dim } else { index };
    Ok(index.clamp(0, dim))
}

/// Expand the sparse `begin/end/strides` spec over every input dim (batch
/// included) and return dense `(begin, size, stride)`. Sizes of dims that
/// run to an unknown end are `-1`.
fn canonicalize_strided_slice(
    input_dims: &[i32],
    begin: &[i32],
    end: &[i32],
    strides: &[i32],
    masks: SliceMasks,
    node: &str,
) -> Result<(Vec<i32>, Vec<i32>, Vec<i32>), GraphError> {
    let sparse_rank = begin.len();
    let rank = input_dims.len();
    let ellipses: Vec<usize> = (0..sparse_rank)
        .filter(|i| SliceMasks::bit(masks.ellipsis, *i))
        .collect();
    // Which sparse entry drives each dense dim. `None` takes the whole dim.
    let dense: Vec<Option<usize>> = match ellipses.as_slice() {
        [] => {
            if sparse_rank > rank {
                return Err(GraphError::invalid_argument(format!(
                    "Index out of range using input dim {}; input has only {} dims, at {}",
                    sparse_rank, rank, node
                )));
            }
            (0..rank).map(|i| (i < sparse_rank).then_some(i)).collect()
        }
        [at] => {
            let after = sparse_rank - at - 1;
            if at + after > rank {
                return Err(GraphError::invalid_argument(format!(
                    "Slice spec of {} entries does not fit rank {}, at {}",
                    sparse_rank, rank, node
                )));
            }
            let covered = rank - at - after;
            (0..*at)
                .map(Some)
                .chain(std::iter::repeat(None).take(covered))
                .chain((at + 1..sparse_rank).map(Some))
                .collect()
        }
        _ => {
            return Err(GraphError::invalid_argument(format!(
                "Multiple ellipses in slice spec not allowed, at {}",
                node
            )))
        }
    };

    let mut out_begin = Vec::with_capacity(rank);
    let mut out_size = Vec::with_capacity(rank);
    let mut out_stride = Vec::with_capacity(rank);
    for (dim, sparse) in input_dims.iter().copied().zip(&dense) {
        let Some(j) = *sparse else {
            out_begin.push(0);
            out_size.push(dim);
            out_stride.push(1);
            continue;
        };
        let stride = strides[j];
        if stride == 0 {
            return Err(GraphError::invalid_argument(format!(
                "strides[{}] must be non-zero, at {}",
                j, node
            )));
        }
        if stride < 0 {
            return Err(GraphError::unimplemented(format!(
                "Negative or zero stride values are not supported for StridedSlice, at {}",
                node
            )));
        }
        let b = if SliceMasks::bit(masks.begin, j) {
            0
        } else {
            canonical_index(begin[j], dim, node)?
        };
        let e = if SliceMasks::bit(masks.end, j) {
            dim
        } else {
            canonical_index(end[j], dim, node)?
        };
        out_begin.push(b);
        out_size.push(if e < 0 { -1 } else { (e - b + stride - 1) / stride });
        out_stride.push(stride);
    }

    // The batch entry must select the whole batch with stride 1.
    if let Some(j) = dense.first().copied().flatten() {
        let batch = input_dims[0];
        let begin_is_modified = !SliceMasks::bit(masks.begin, j) && out_begin[0] != 0;
        let stride_is_modified = out_stride[0] != 1;
        let end_is_modified = !SliceMasks::bit(masks.end, j)
            && (batch <= 0 || out_begin[0] + out_size[0] != batch);
        if begin_is_modified || stride_is_modified || end_is_modified {
            return Err(GraphError::unimplemented(format!(
                "The batch dimension cannot be modified, at {}",
                node
            )));
        }
    }
    Ok((out_begin, out_size, out_stride))
}

pub fn convert_strided_slice(params: &mut OpConverterParams<'_>) -> Result<(), GraphError> {
    check_input_kinds(
        params,
        &[("input", false), ("begin", true), ("end", true), ("strides", true)],
    )?;
    allow_data_types(params, &FLOAT_AND_INT_TYPES, "T")?;
    for attr in ["new_axis_mask", "shrink_axis_mask"] {
        if params.attrs.get_or::<i64>(attr, 0)? != 0 {
            return Err(GraphError::unimplemented(format!(
                "{} is not supported for StridedSlice, at {}",
                attr,
                params.name()
            )));
        }
    }
    let masks = SliceMasks {
        begin: params.attrs.get_or("begin_mask", 0)?,
        end: params.attrs.get_or("end_mask", 0)?,
        ellipsis: params.attrs.get_or("ellipsis_mask", 0)?,
    };

    let store = &*params.weight_store;
    let begin = int_values(store, params.inputs[1].weights()?)?;
    let end = int_values(store, params.inputs[2].weights()?)?;
    let strides = int_values(store, params.inputs[3].weights()?)?;
    if begin.len() != end.len() || begin.len() != strides.len() {
        return Err(GraphError::invalid_argument(format!(
            "Length of begin, end, and stride must be equal, at {}",
            params.name()
        )));
    }
    let input = params.inputs[0].clone();
    let mut input_dims = vec![input.batch_size().max(-1)];
    input_dims.extend_from_slice(input.dims());
    let (begin, size, stride) =
        canonicalize_strided_slice(&input_dims, &begin, &end, &strides, masks, params.name())?;
    tracing::debug!(?begin, ?size, ?stride, "strided slice");
    if let Some(output) = strided_slice_helper(params, &input, &begin, &size, &stride)? {
        params.push_tensor(output);
    }
    Ok(())
}

/// Cut `input` into `num_splits` equal slices along `tf_axis`. Unpack also
/// drops the split axis from every slice.
fn split_helper(
    params: &mut OpConverterParams<'_>,
    input: &TensorOrWeights,
    tf_axis: i32,
    num_splits: i64,
    squeeze_after: bool,
) -> Result<(), GraphError> {
    let dims = input.dims().to_vec();
    let axis = convert_axis(tf_axis, dims.len(), params.name())?;
    let num = i32::try_from(num_splits)
        .ok()
        .filter(|n| *n > 0)
        .ok_or_else(|| {
            GraphError::invalid_argument(format!(
                "Number of splits must be positive, got {}, at {}",
                num_splits,
                params.name()
            ))
        })?;
    if squeeze_after && dims[axis] != num {
        return Err(GraphError::invalid_argument(format!(
            "Dimension {} has size {} which is not equal to num of {}, at {}",
            tf_axis,
            dims[axis],
            num,
            params.name()
        )));
    }
    if dims[axis] % num != 0 {
        return Err(GraphError::invalid_argument(format!(
            "Dimension {} of size {} is not evenly divisble by {}, at {}",
            tf_axis,
            dims[axis],
            num,
            params.name()
        )));
    }

    let split_size = dims[axis] / num;
    let mut begin = vec![0; dims.len() + 1];
    let mut size = vec![1];
    size.extend_from_slice(&dims);
    size[axis + 1] = split_size;
    let stride = vec![1; dims.len() + 1];

    let mut slices = Vec::with_capacity(num as usize);
    for i in 0..num {
        begin[axis + 1] = i * split_size;
        if let Some(slice) = strided_slice_helper(params, input, &begin, &size, &stride)? {
            slices.push(slice);
        }
    }
    if params.validation_only {
        return Ok(());
    }

    if squeeze_after {
        let mut squeezed = size[1..].to_vec();
        squeezed.remove(axis);
        let (builder, store) = params.build()?;
        slices = slices
            .into_iter()
            .map(|slice| {
                builder.prepare_tensor_for_shape(store, &TensorOrWeights::from(slice), &squeezed)
            })
            .collect::<Result<Vec<_>, _>>()?;
    }
    for slice in slices {
        params.push_tensor(slice);
    }
    Ok(())
}

pub fn convert_split(params: &mut OpConverterParams<'_>) -> Result<(), GraphError> {
    check_input_kinds(params, &[("axis", true), ("value", false)])?;
    allow_data_types(params, &FLOAT_AND_INT_TYPES, "T")?;
    let axis = scalar_axis(params, 0)?;
    let num_split: i64 = params.attrs.get("num_split")?;
    let input = params.inputs[1].clone();
    split_helper(params, &input, axis, num_split, false)
}

pub fn convert_unpack(params: &mut OpConverterParams<'_>) -> Result<(), GraphError> {
    check_input_kinds(params, &[("value", false)])?;
    allow_data_types(params, &FLOAT_AND_INT_TYPES, "T")?;
    let input = params.inputs[0].clone();
    if input.dims().is_empty() {
        return Err(GraphError::unimplemented(format!(
            "Input \"value\" for Unpack must be rank 2 or greater, at {}",
            params.name()
        )));
    }
    let axis: i32 = params.attrs.get("axis")?;
    let num: i64 = params.attrs.get("num")?;
    split_helper(params, &input, axis, num, true)
}
