/// Shape algebra for lowering: broadcasting, axis normalization, batch-dim
/// checks, and the output shapes of every network layer.
///
/// All dims here exclude the implicit batch dim unless a function says
/// otherwise. `-1` marks a dim that is not known statically.
use crate::error::GraphError;
use crate::network::{ConvolutionSpec, Hw, MatrixOp, ShuffleSpec};
use crate::values::TensorOrWeights;
use crate::weights::weight_dims_count;

pub fn has_static_shape(dims: &[i32]) -> bool {
    dims.iter().all(|d| *d >= 0)
}

/// Element count of tensor dims. Rank 0 counts one element; `-1` means some
/// dim is unknown.
pub fn tensor_dims_count(dims: &[i32]) -> i64 {
    if !has_static_shape(dims) {
        return -1;
    }
    dims.iter().map(|d| i64::from(*d)).product()
}

fn dims_have_same_size(lhs: &[i32], rhs: &[i32], is_tensor: bool) -> bool {
    if is_tensor {
        tensor_dims_count(lhs) == tensor_dims_count(rhs)
    } else {
        weight_dims_count(lhs) == weight_dims_count(rhs)
    }
}

/// True when both shapes are fully known and hold the same number of elements.
pub fn are_dims_static_with_same_size(lhs: &[i32], rhs: &[i32], is_tensor: bool) -> bool {
    has_static_shape(lhs) && has_static_shape(rhs) && dims_have_same_size(lhs, rhs, is_tensor)
}

/// True when both shapes are fully known and the element counts differ.
pub fn are_dims_static_with_different_size(lhs: &[i32], rhs: &[i32], is_tensor: bool) -> bool {
    has_static_shape(lhs) && has_static_shape(rhs) && !dims_have_same_size(lhs, rhs, is_tensor)
}

pub fn remove_batch_dimension(dims: &[i32]) -> Result<Vec<i32>, GraphError> {
    if dims.len() < 2 {
        return Err(GraphError::invalid_argument(
            "Dropping batch dimension requires dims with rank>=2.",
        ));
    }
    Ok(dims[1..].to_vec())
}

/// Bring two elementwise operands to the same rank.
///
/// 1. A weights operand with a higher rank than the other side carries a batch
///    dim, which is dropped when it is `1` or unknown and rejected otherwise.
/// 2. Equal ranks are returned unchanged.
/// 3. Otherwise the lower rank is left-padded with `1`s and every position has
///    to be equal or `1` on one side.
pub fn compute_broadcast_shapes(
    lhs: &TensorOrWeights,
    rhs: &TensorOrWeights,
) -> Result<(Vec<i32>, Vec<i32>), GraphError> {
    let mut l = lhs.dims().to_vec();
    let mut r = rhs.dims().to_vec();

    if lhs.is_weights() && l.len() > r.len() {
        l = strip_weight_batch(&l)?;
    }
    if rhs.is_weights() && r.len() > l.len() {
        r = strip_weight_batch(&r)?;
    }

    if l.len() == r.len() {
        tracing::trace!(lhs = ?l, rhs = ?r, "broadcast shapes already aligned");
        return Ok((l, r));
    }

    if l.len() < r.len() {
        l = left_pad_ones(&l, r.len());
    } else {
        r = left_pad_ones(&r, l.len());
    }

    for (a, b) in l.iter().zip(&r) {
        if a != b && *a != 1 && *b != 1 {
            return Err(GraphError::invalid_argument(format!(
                "Infeasible broadcast scheme (batch_dim: {}, {:?} vs batch_dim: {}, {:?})",
                l[0], l, r[0], r
            )));
        }
    }
    tracing::trace!(lhs = ?l, rhs = ?r, "broadcast shapes");
    Ok((l, r))
}

fn strip_weight_batch(dims: &[i32]) -> Result<Vec<i32>, GraphError> {
    if dims[0] != -1 && dims[0] != 1 {
        return Err(GraphError::invalid_argument(
            "Cannot broadcast weights with non-trivial batch dimension",
        ));
    }
    remove_batch_dimension(dims)
}

fn left_pad_ones(dims: &[i32], rank: usize) -> Vec<i32> {
    let mut out = vec![1; rank - dims.len()];
    out.extend_from_slice(dims);
    out
}

/// Map a source axis (batch included, negative allowed) onto the network's
/// batch-less axis numbering.
pub fn convert_axis(axis: i32, nb_dims: usize, node: &str) -> Result<usize, GraphError> {
    let with_batch = nb_dims as i32 + 1;
    if axis < -with_batch || axis >= with_batch {
        return Err(GraphError::invalid_argument(format!(
            "Axis value of {} is out of bounds, must be in range [{}, {}), at {}",
            axis, -with_batch, with_batch, node
        )));
    }
    let axis = if axis < 0 { axis + with_batch } else { axis };
    if axis == 0 {
        return Err(GraphError::unimplemented(format!(
            "Manipulation of the batch dimension is not supported, at {}",
            node
        )));
    }
    Ok((axis - 1) as usize)
}

/// `(pre, post)` padding per spatial dim for SAME padding. `kernel` is the
/// effective (dilated) kernel size. The extra element goes to the end.
pub fn create_same_padding(
    stride: Hw,
    kernel: Hw,
    input: Hw,
) -> Result<[(i32, i32); 2], GraphError> {
    if stride.iter().any(|s| *s <= 0) {
        return Err(GraphError::invalid_argument(format!(
            "SAME padding needs positive strides, got {:?}",
            stride
        )));
    }
    let mut padding = [(0, 0); 2];
    for i in 0..2 {
        let total = ((input[i] - 1) / stride[i]) * stride[i] + kernel[i] - input[i];
        let total = total.max(0);
        let left = total / 2;
        padding[i] = (left, total - left);
        tracing::trace!(
            dim = i,
            input = input[i],
            stride = stride[i],
            kernel = kernel[i],
            pre = left,
            post = total - left,
            "same padding"
        );
    }
    Ok(padding)
}

/// Conservative check that a reshape cannot move data across the batch dim.
///
/// With a known input batch, the reshape keeps the batch slot either as the
/// same value, or as `-1` with both non-batch shapes static and equal in size.
/// With an unknown input batch, the non-batch shapes have to be static and
/// equal in size. Anything else may change the batch dim.
pub fn reshape_may_change_batch_dim(
    input_batch: i32,
    input_dims: &[i32],
    reshape_batch: i32,
    reshape_dims: &[i32],
) -> bool {
    if input_batch > 0 {
        if reshape_batch == -1 {
            !are_dims_static_with_same_size(input_dims, reshape_dims, true)
        } else {
            reshape_batch != input_batch
        }
    } else {
        !are_dims_static_with_same_size(input_dims, reshape_dims, true)
    }
}

/// All inputs share one rank and agree on every dim except `masked_dim`.
pub fn verify_shapes_match(
    inputs: &[TensorOrWeights],
    masked_dim: Option<usize>,
    node: &str,
) -> Result<(), GraphError> {
    let Some((first, rest)) = inputs.split_first() else {
        return Ok(());
    };
    let dims_0 = first.dims();
    for input in rest {
        let dims_i = input.dims();
        if dims_i.len() != dims_0.len() {
            return Err(GraphError::invalid_argument(format!(
                "Received inputs with inconsistent rank, at {}",
                node
            )));
        }
        let mismatch = dims_0
            .iter()
            .zip(dims_i)
            .enumerate()
            .any(|(j, (a, b))| a != b && Some(j) != masked_dim);
        if mismatch {
            return Err(GraphError::invalid_argument(format!(
                "Received inputs with inconsistent shape, at {}",
                node
            )));
        }
    }
    Ok(())
}

fn permute(dims: &[i32], order: &[usize]) -> Result<Vec<i32>, GraphError> {
    let mut seen = vec![false; dims.len()];
    if order.len() != dims.len() {
        return Err(GraphError::internal(format!(
            "Permutation {:?} does not match rank {}",
            order,
            dims.len()
        )));
    }
    for p in order {
        match seen.get_mut(*p) {
            Some(flag) if !*flag => *flag = true,
            _ => {
                return Err(GraphError::internal(format!(
                    "Invalid permutation {:?}",
                    order
                )))
            }
        }
    }
    Ok(order.iter().map(|p| dims[*p]).collect())
}

/// Shuffle = first transpose, then reshape, then second transpose.
pub fn infer_shuffle_shape(input: &[i32], spec: &ShuffleSpec) -> Result<Vec<i32>, GraphError> {
    let mut dims = match &spec.first_transpose {
        Some(order) => permute(input, order)?,
        None => input.to_vec(),
    };

    if let Some(reshape) = &spec.reshape {
        let mut out = Vec::with_capacity(reshape.len());
        let mut inferred = None;
        for (i, d) in reshape.iter().enumerate() {
            match *d {
                0 => out.push(*dims.get(i).ok_or_else(|| {
                    GraphError::internal(format!(
                        "Reshape copies dim {} of {:?} which does not exist",
                        i, dims
                    ))
                })?),
                -1 if inferred.is_none() => {
                    inferred = Some(i);
                    out.push(-1);
                }
                d if d > 0 => out.push(d),
                _ => {
                    return Err(GraphError::internal(format!(
                        "Invalid reshape dims {:?}",
                        reshape
                    )))
                }
            }
        }
        let total = tensor_dims_count(&dims);
        match inferred {
            Some(i) if total >= 0 => {
                let known: i64 = out
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| *j != i)
                    .map(|(_, d)| i64::from(*d))
                    .product();
                if known == 0 || total % known != 0 {
                    return Err(GraphError::internal(format!(
                        "Cannot infer reshape {:?} of {:?}",
                        reshape, dims
                    )));
                }
                out[i] = (total / known) as i32;
            }
            Some(_) => {}
            None => {
                if total >= 0 && tensor_dims_count(&out) != total {
                    return Err(GraphError::internal(format!(
                        "Reshape {:?} changes the element count of {:?}",
                        reshape, dims
                    )));
                }
            }
        }
        dims = out;
    }

    match &spec.second_transpose {
        Some(order) => permute(&dims, order),
        None => Ok(dims),
    }
}

/// Elementwise layers need equal ranks; each dim pair is equal or has a `1`.
pub fn infer_elementwise_shape(lhs: &[i32], rhs: &[i32]) -> Result<Vec<i32>, GraphError> {
    if lhs.len() != rhs.len() {
        return Err(GraphError::internal(format!(
            "Elementwise operands {:?} and {:?} have different ranks",
            lhs, rhs
        )));
    }
    lhs.iter()
        .zip(rhs)
        .map(|(a, b)| match (*a, *b) {
            (a, b) if a == b => Ok(a),
            (1, b) => Ok(b),
            (a, 1) => Ok(a),
            _ => Err(GraphError::internal(format!(
                "Elementwise operands {:?} and {:?} do not broadcast",
                lhs, rhs
            ))),
        })
        .collect()
}

fn split_chw(dims: &[i32], what: &str) -> Result<(usize, i32, i32, i32), GraphError> {
    let rank = dims.len();
    if rank < 3 {
        return Err(GraphError::internal(format!(
            "{} needs a CHW input, got {:?}",
            what, dims
        )));
    }
    Ok((rank - 3, dims[rank - 3], dims[rank - 2], dims[rank - 1]))
}

fn check_kernel_count(dims_c: i32, spec: &ConvolutionSpec, what: &str) -> Result<(), GraphError> {
    if spec.groups <= 0 || dims_c % spec.groups != 0 || spec.num_outputs % spec.groups != 0 {
        return Err(GraphError::internal(format!(
            "{} with {} groups does not divide {} input and {} output channels",
            what, spec.groups, dims_c, spec.num_outputs
        )));
    }
    let expected = (dims_c / spec.groups) as i64
        * spec.num_outputs as i64
        * spec.kernel[0] as i64
        * spec.kernel[1] as i64;
    if spec.kernel_weights.count as i64 != expected {
        return Err(GraphError::internal(format!(
            "{} kernel has {} values, expected {}",
            what, spec.kernel_weights.count, expected
        )));
    }
    if !spec.bias_weights.is_empty() && spec.bias_weights.count as i64 != spec.num_outputs as i64 {
        return Err(GraphError::internal(format!(
            "{} bias has {} values for {} outputs",
            what, spec.bias_weights.count, spec.num_outputs
        )));
    }
    Ok(())
}

fn check_stride(stride: Hw, what: &str) -> Result<(), GraphError> {
    if stride.iter().any(|s| *s <= 0) {
        return Err(GraphError::internal(format!("{} stride {:?}", what, stride)));
    }
    Ok(())
}

fn positive(dims: Vec<i32>, what: &str) -> Result<Vec<i32>, GraphError> {
    if dims.iter().any(|d| *d <= 0) {
        return Err(GraphError::internal(format!(
            "{} would produce empty dims {:?}",
            what, dims
        )));
    }
    Ok(dims)
}

/// `[K, (H + 2p - k_eff) / s + 1, ...]` over the trailing CHW dims.
pub fn infer_conv_shape(input: &[i32], spec: &ConvolutionSpec) -> Result<Vec<i32>, GraphError> {
    let (prefix, c, h, w) = split_chw(input, "Convolution")?;
    check_kernel_count(c, spec, "Convolution")?;
    check_stride(spec.stride, "Convolution")?;
    let mut out = input[..prefix].to_vec();
    out.push(spec.num_outputs);
    for (i, size) in [h, w].into_iter().enumerate() {
        let effective = spec.kernel[i] + (spec.kernel[i] - 1) * (spec.dilation[i] - 1);
        out.push((size + 2 * spec.padding[i] - effective) / spec.stride[i] + 1);
    }
    positive(out, "Convolution")
}

/// `[K, (H - 1) * s + k - 2p, ...]` over the trailing CHW dims.
pub fn infer_deconv_shape(input: &[i32], spec: &ConvolutionSpec) -> Result<Vec<i32>, GraphError> {
    let (prefix, c, h, w) = split_chw(input, "Deconvolution")?;
    check_kernel_count(c, spec, "Deconvolution")?;
    check_stride(spec.stride, "Deconvolution")?;
    let mut out = input[..prefix].to_vec();
    out.push(spec.num_outputs);
    for (i, size) in [h, w].into_iter().enumerate() {
        out.push((size - 1) * spec.stride[i] + spec.kernel[i] - 2 * spec.padding[i]);
    }
    positive(out, "Deconvolution")
}

/// Padding applies to the last two dims. Negative values crop.
pub fn infer_padding_shape(input: &[i32], pre: Hw, post: Hw) -> Result<Vec<i32>, GraphError> {
    let (prefix, c, h, w) = split_chw(input, "Padding")?;
    let mut out = input[..prefix].to_vec();
    out.extend([c, h + pre[0] + post[0], w + pre[1] + post[1]]);
    positive(out, "Padding")
}

pub fn infer_pool_shape(
    input: &[i32],
    window: Hw,
    stride: Hw,
    padding: Hw,
) -> Result<Vec<i32>, GraphError> {
    let (prefix, c, h, w) = split_chw(input, "Pooling")?;
    check_stride(stride, "Pooling")?;
    let mut out = input[..prefix].to_vec();
    out.push(c);
    for (i, size) in [h, w].into_iter().enumerate() {
        out.push((size + 2 * padding[i] - window[i]) / stride[i] + 1);
    }
    positive(out, "Pooling")
}

pub fn infer_concat_shape(inputs: &[Vec<i32>], axis: usize) -> Result<Vec<i32>, GraphError> {
    let first = inputs
        .first()
        .ok_or_else(|| GraphError::internal("Concatenation needs at least one input"))?;
    if axis >= first.len() {
        return Err(GraphError::internal(format!(
            "Concatenation axis {} out of bounds for {:?}",
            axis, first
        )));
    }
    let mut out = first.clone();
    out[axis] = 0;
    for shape in inputs {
        if shape.len() != first.len()
            || shape
                .iter()
                .zip(first)
                .enumerate()
                .any(|(j, (a, b))| j != axis && a != b)
        {
            return Err(GraphError::internal(format!(
                "Concatenation inputs {:?} disagree outside axis {}",
                inputs, axis
            )));
        }
        out[axis] += shape[axis];
    }
    Ok(out)
}

pub fn infer_slice_shape(
    input: &[i32],
    start: &[i32],
    size: &[i32],
    stride: &[i32],
) -> Result<Vec<i32>, GraphError> {
    let rank = input.len();
    if start.len() != rank || size.len() != rank || stride.len() != rank {
        return Err(GraphError::internal(format!(
            "Slice start {:?}, size {:?}, stride {:?} do not match rank of {:?}",
            start, size, stride, input
        )));
    }
    for i in 0..rank {
        let last = start[i] + (size[i] - 1) * stride[i];
        if start[i] < 0 || size[i] <= 0 || stride[i] <= 0 || (input[i] >= 0 && last >= input[i]) {
            return Err(GraphError::internal(format!(
                "Slice of dim {} (start {}, size {}, stride {}) is outside {:?}",
                i, start[i], size[i], stride[i], input
            )));
        }
    }
    Ok(size.to_vec())
}

fn check_axes(axes: u32, rank: usize, what: &str) -> Result<(), GraphError> {
    if axes == 0 || (rank < 32 && axes >> rank != 0) {
        return Err(GraphError::internal(format!(
            "{} axes {:#b} do not fit rank {}",
            what, axes, rank
        )));
    }
    Ok(())
}

pub fn infer_reduce_shape(input: &[i32], axes: u32, keep_dims: bool) -> Result<Vec<i32>, GraphError> {
    check_axes(axes, input.len(), "Reduce")?;
    Ok(input
        .iter()
        .enumerate()
        .filter_map(|(i, d)| match ((axes >> i) & 1 == 1, keep_dims) {
            (false, _) => Some(*d),
            (true, true) => Some(1),
            (true, false) => None,
        })
        .collect())
}

pub fn infer_topk_shape(input: &[i32], k: i32, axes: u32) -> Result<Vec<i32>, GraphError> {
    check_axes(axes, input.len(), "TopK")?;
    if axes.count_ones() != 1 {
        return Err(GraphError::internal(format!(
            "TopK reduces exactly one axis, got {:#b}",
            axes
        )));
    }
    let axis = axes.trailing_zeros() as usize;
    if k <= 0 || (input[axis] >= 0 && k > input[axis]) {
        return Err(GraphError::internal(format!(
            "TopK k={} does not fit dim {} of {:?}",
            k, axis, input
        )));
    }
    let mut out = input.to_vec();
    out[axis] = k;
    Ok(out)
}

/// Data dims with `axis` replaced by the index dims.
pub fn infer_gather_shape(data: &[i32], indices: &[i32], axis: usize) -> Result<Vec<i32>, GraphError> {
    if axis >= data.len() {
        return Err(GraphError::internal(format!(
            "Gather axis {} out of bounds for {:?}",
            axis, data
        )));
    }
    let mut out = data[..axis].to_vec();
    out.extend_from_slice(indices);
    out.extend_from_slice(&data[axis + 1..]);
    Ok(out)
}

/// The trailing CHW dims collapse into `[K, 1, 1]`.
pub fn infer_fully_connected_shape(input: &[i32], num_outputs: i32) -> Result<Vec<i32>, GraphError> {
    let (prefix, _, _, _) = split_chw(input, "Fully connected")?;
    if num_outputs <= 0 {
        return Err(GraphError::internal(format!(
            "Fully connected layer with {} outputs",
            num_outputs
        )));
    }
    let mut out = input[..prefix].to_vec();
    out.extend([num_outputs, 1, 1]);
    Ok(out)
}

/// Matrix product over the last two dims; leading dims broadcast. A `Vector`
/// operand is rank 1 and contributes no output dim.
pub fn infer_matrix_multiply_shape(
    a: &[i32],
    op0: MatrixOp,
    b: &[i32],
    op1: MatrixOp,
) -> Result<Vec<i32>, GraphError> {
    let fail = || {
        GraphError::internal(format!(
            "Matrix multiply of {:?} ({:?}) and {:?} ({:?}) is malformed",
            a, op0, b, op1
        ))
    };
    let matrix = |dims: &[i32], op: MatrixOp| -> Option<(Vec<i32>, i32, i32)> {
        match op {
            MatrixOp::Vector if dims.len() == 1 => Some((Vec::new(), 1, dims[0])),
            MatrixOp::None | MatrixOp::Transpose if dims.len() >= 2 => {
                let n = dims.len();
                let (rows, cols) = (dims[n - 2], dims[n - 1]);
                let (rows, cols) = if op == MatrixOp::Transpose {
                    (cols, rows)
                } else {
                    (rows, cols)
                };
                Some((dims[..n - 2].to_vec(), rows, cols))
            }
            _ => None,
        }
    };
    let (a_batch, m, k_a) = matrix(a, op0).ok_or_else(fail)?;
    let (b_batch, k_b, n) = match op1 {
        MatrixOp::Vector if b.len() == 1 => (Vec::new(), b[0], 1),
        _ => matrix(b, op1).ok_or_else(fail)?,
    };
    if k_a != k_b {
        return Err(fail());
    }
    let batch = if a_batch.is_empty() {
        b_batch
    } else if b_batch.is_empty() {
        a_batch
    } else {
        infer_elementwise_shape(&a_batch, &b_batch).map_err(|_| fail())?
    };
    let mut out = batch;
    if op0 != MatrixOp::Vector {
        out.push(m);
    }
    if op1 != MatrixOp::Vector {
        out.push(n);
    }
    Ok(out)
}
