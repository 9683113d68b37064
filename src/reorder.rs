//! Strided copies that move weights into the layouts layers expect.

use half::f16;

use crate::error::GraphError;
use crate::graph::DataType;
use crate::weights::{ShapedWeights, WeightElement, WeightStore};

/// `dst[n, c, h, w] (ostrides) = src[n, c, h, w] (istrides)` over `shape`.
pub fn reorder4<T: Copy>(
    shape: [usize; 4],
    src: &[T],
    istrides: [usize; 4],
    dst: &mut [T],
    ostrides: [usize; 4],
) {
    for n in 0..shape[0] {
        for c in 0..shape[1] {
            for h in 0..shape[2] {
                for w in 0..shape[3] {
                    dst[n * ostrides[0] + c * ostrides[1] + h * ostrides[2] + w * ostrides[3]] =
                        src[n * istrides[0] + c * istrides[1] + h * istrides[2] + w * istrides[3]];
                }
            }
        }
    }
}

pub fn reorder2<T: Copy>(
    shape: [usize; 2],
    src: &[T],
    istrides: [usize; 2],
    dst: &mut [T],
    ostrides: [usize; 2],
) {
    for h in 0..shape[0] {
        for w in 0..shape[1] {
            dst[h * ostrides[0] + w * ostrides[1]] = src[h * istrides[0] + w * istrides[1]];
        }
    }
}

fn unsupported(dtype: DataType) -> GraphError {
    GraphError::internal(format!(
        "Unsupported type in reorder, expected fp32 or fp16 but got {:?}",
        dtype
    ))
}

fn dim(weights: &ShapedWeights, index: usize) -> Result<usize, GraphError> {
    weights
        .dims()
        .get(index)
        .map(|d| (*d).max(0) as usize)
        .ok_or_else(|| {
            GraphError::internal(format!(
                "Weights of shape {:?} have no dim {}",
                weights.dims(),
                index
            ))
        })
}

fn copy_with<T: WeightElement>(
    store: &mut WeightStore,
    src: &ShapedWeights,
    dst: &ShapedWeights,
    reorder: impl FnOnce(&[T], &mut [T]),
) -> Result<(), GraphError> {
    let input = store.values::<T>(src)?.to_vec();
    let output = store.values_mut::<T>(dst)?;
    if input.len() != output.len() {
        return Err(GraphError::internal(format!(
            "Reorder needs equal sizes, got {} and {} elements",
            input.len(),
            output.len()
        )));
    }
    reorder(&input, output);
    Ok(())
}

/// Transpose a `[C, K]` matrix into a new `[K, C]` buffer.
pub fn reorder_ck_to_kc(
    store: &mut WeightStore,
    weights: &ShapedWeights,
) -> Result<ShapedWeights, GraphError> {
    if weights.dims().len() != 2 {
        return Err(GraphError::internal(format!(
            "CK to KC reorder needs rank 2 weights, got {:?}",
            weights.dims()
        )));
    }
    let c = dim(weights, 0)?;
    let k = dim(weights, 1)?;
    let out = store
        .get_temp_weights_like(weights)?
        .reshaped(vec![k as i32, c as i32])?;
    let istrides = [1, k];
    let ostrides = [c, 1];
    match weights.dtype() {
        DataType::Float32 => copy_with::<f32>(store, weights, &out, |src, dst| {
            reorder2([k, c], src, istrides, dst, ostrides)
        })?,
        DataType::Float16 => copy_with::<f16>(store, weights, &out, |src, dst| {
            reorder2([k, c], src, istrides, dst, ostrides)
        })?,
        other => return Err(unsupported(other)),
    }
    Ok(out)
}

/// Reorder an `[R, S, C, K]` kernel into `[K/g, C*g, R, S]` for `num_groups`
/// groups. Depthwise kernels arrive as `[R, S, C, 1]` with `g = C`.
pub fn reorder_rsck_to_kcrs(
    store: &mut WeightStore,
    weights: &ShapedWeights,
    num_groups: usize,
) -> Result<ShapedWeights, GraphError> {
    if weights.dims().len() != 4 || num_groups == 0 {
        return Err(GraphError::internal(format!(
            "RSCK to KCRS reorder needs rank 4 weights and groups > 0, got {:?} / {}",
            weights.dims(),
            num_groups
        )));
    }
    let r = dim(weights, 0)?;
    let s = dim(weights, 1)?;
    let c = dim(weights, 2)? / num_groups;
    let k = dim(weights, 3)? * num_groups;
    tracing::trace!(num_groups, r, s, c, k, "reorder RSCK to KCRS");
    let out = store.get_temp_weights_like(weights)?.reshaped(vec![
        (k / num_groups) as i32,
        (c * num_groups) as i32,
        r as i32,
        s as i32,
    ])?;
    let istrides = [1, k, s * k * c, c * k];
    let ostrides = [c * r * s, r * s, s, 1];
    match weights.dtype() {
        DataType::Float32 => copy_with::<f32>(store, weights, &out, |src, dst| {
            reorder4([k, c, r, s], src, istrides, dst, ostrides)
        })?,
        DataType::Float16 => copy_with::<f16>(store, weights, &out, |src, dst| {
            reorder4([k, c, r, s], src, istrides, dst, ostrides)
        })?,
        other => return Err(unsupported(other)),
    }
    Ok(out)
}
