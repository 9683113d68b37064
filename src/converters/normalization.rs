//! BiasAdd and inference-mode FusedBatchNorm, both lowered to scale layers.

use half::f16;

use crate::engine::PrecisionMode;
use crate::error::GraphError;
use crate::graph::DataType;
use crate::network::{ScaleMode, ShuffleSpec};
use crate::weights::{convert_fp32_to_fp16, ShapedWeights};

use super::{allow_data_types, check_input_kinds, OpConverterParams, FLOAT_TYPES};

/// Scale layers work on CHW: channels lead and the input is rank 3. Other
/// layouts are moved there and back with a shuffle on each side.
pub fn convert_bias_add(params: &mut OpConverterParams<'_>) -> Result<(), GraphError> {
    check_input_kinds(params, &[("value", false), ("bias", true)])?;
    allow_data_types(params, &FLOAT_TYPES, "T")?;
    let original_dims = params.inputs[0].dims().to_vec();
    let rank = original_dims.len();
    if rank == 0 {
        return Err(GraphError::invalid_argument(format!(
            "BiasAdd needs at least one non-batch dimension, at {}",
            params.name()
        )));
    }
    let data_format: String = params.attrs.get_or("data_format", "NHWC".to_string())?;
    let channel_index = if data_format == "NHWC" { rank - 1 } else { 0 };
    let bias = params.inputs[1].weights()?.clone();
    let channels = original_dims[channel_index];
    if bias.count() != 1 && channels >= 0 && bias.count() != channels as usize {
        return Err(GraphError::invalid_argument(format!(
            "Bias of {} values does not match {} channels, at {}",
            bias.count(),
            channels,
            params.name()
        )));
    }
    if params.validation_only {
        return Ok(());
    }

    let mut permutation: Vec<usize> = (0..rank).collect();
    permutation.swap(0, channel_index);
    let reshaped = channel_index != 0 || rank != 3;
    tracing::debug!(?permutation, reshaped, "bias add layout");

    let input = params.inputs[0].tensor()?.clone();
    let (builder, store) = params.build()?;
    let mut tensor = input.clone();
    if reshaped {
        // `0` copies the dim; `-1` folds the rest into the last one.
        let spec = ShuffleSpec {
            first_transpose: (channel_index != 0).then(|| permutation.clone()),
            reshape: Some(vec![
                0,
                if rank >= 2 { 0 } else { 1 },
                if rank >= 3 { -1 } else { 1 },
            ]),
            second_transpose: None,
        };
        tensor = builder.layer(|net| net.add_shuffle(input.id, spec))?;
        builder.mark_quantization_ranges_as_inferrable(&input, &tensor);
    }

    let mut bias = bias;
    if builder.precision_mode() == PrecisionMode::Fp16 && bias.dtype() == DataType::Float32 {
        bias = convert_fp32_to_fp16(store, &bias)?;
    }
    let mode = if bias.count() == 1 {
        ScaleMode::Uniform
    } else {
        ScaleMode::Channel
    };
    let empty = ShapedWeights::empty(bias.dtype()).backend_weights();
    let shift = bias.backend_weights();
    let mut output = builder.layer(|net| net.add_scale(tensor.id, mode, shift, empty, empty))?;

    if reshaped {
        let mut restored = original_dims.clone();
        restored.swap(0, channel_index);
        let spec = ShuffleSpec {
            first_transpose: None,
            reshape: Some(restored),
            second_transpose: (channel_index != 0).then_some(permutation),
        };
        let scaled = output;
        output = builder.layer(|net| net.add_shuffle(scaled.id, spec))?;
        builder.mark_quantization_ranges_as_inferrable(&scaled, &output);
    }
    params.push_tensor(output);
    Ok(())
}

/// Folds `scale / sqrt(variance + epsilon)` and `offset - mean * scale` into
/// one scale layer. Parameters hold either one value or one per channel.
pub fn convert_fused_batch_norm(params: &mut OpConverterParams<'_>) -> Result<(), GraphError> {
    check_input_kinds(
        params,
        &[
            ("x", false),
            ("scale", true),
            ("offset", true),
            ("mean", true),
            ("variance", true),
        ],
    )?;
    allow_data_types(params, &FLOAT_TYPES, "T")?;
    let epsilon: f32 = params.attrs.get_or("epsilon", 1e-4)?;
    let data_format: String = params.attrs.get_or("data_format", "NHWC".to_string())?;
    if data_format != "NCHW" {
        return Err(GraphError::unimplemented(format!(
            "{} only supports data_format=NCHW, at {}",
            params.op(),
            params.name()
        )));
    }
    if params.attrs.get_or("is_training", true)? {
        tracing::warn!(
            node = params.name(),
            "{} only supports is_training=false. Models exported for inference must freeze batch statistics.",
            params.op()
        );
        return Err(GraphError::unimplemented(format!(
            "{} only supports is_training=false, at {}",
            params.op(),
            params.name()
        )));
    }

    let parameters: Vec<ShapedWeights> = params.inputs[1..]
        .iter()
        .map(|input| input.weights().cloned())
        .collect::<Result<_, _>>()?;
    let parameter_type = parameters[0].dtype();
    if !FLOAT_TYPES.contains(&parameter_type) {
        return Err(GraphError::unimplemented(format!(
            "Only float32 or float16 weight data type is supported, for node {} got {:?}",
            params.name(),
            parameter_type
        )));
    }
    if parameters.iter().any(|w| w.dtype() != parameter_type) {
        return Err(GraphError::unimplemented(format!(
            "Inconsistent parameter type for batchnorm is not supported, at: {}",
            params.name()
        )));
    }
    let nweight = parameters.iter().map(ShapedWeights::count).max().unwrap_or(0);
    if parameters
        .iter()
        .any(|w| w.count() != nweight && w.count() != 1)
    {
        return Err(GraphError::invalid_argument(format!(
            "Inconsistent batchnorm parameter count, at: {}",
            params.name()
        )));
    }
    let channels = params.inputs[0].dims().first().copied().unwrap_or(-1);
    if nweight != 1 && channels >= 0 && nweight != channels as usize {
        return Err(GraphError::invalid_argument(format!(
            "Batchnorm has {} parameters for {} channels, at {}",
            nweight,
            channels,
            params.name()
        )));
    }
    if params.validation_only {
        return Ok(());
    }

    let input = params.inputs[0].tensor()?.clone();
    let (builder, store) = params.build()?;
    let values = parameters
        .iter()
        .map(|w| store.values_as_f32(w))
        .collect::<Result<Vec<_>, _>>()?;
    let at = |j: usize, i: usize| {
        let v = &values[j];
        if v.len() == 1 {
            v[0]
        } else {
            v[i]
        }
    };
    let mut combined_scale = Vec::with_capacity(nweight);
    let mut combined_offset = Vec::with_capacity(nweight);
    for i in 0..nweight {
        let (scale, offset, mean, variance) = (at(0, i), at(1, i), at(2, i), at(3, i));
        let s = scale / (variance + epsilon).sqrt();
        combined_scale.push(s);
        combined_offset.push(offset - mean * s);
    }

    let shape = parameters
        .iter()
        .find(|w| w.count() == nweight)
        .map(|w| w.dims().to_vec())
        .unwrap_or_else(|| vec![1]);
    let (scale, offset) = match parameter_type {
        DataType::Float16 => {
            let narrow = |v: &[f32]| v.iter().copied().map(f16::from_f32).collect::<Vec<_>>();
            (
                store.weights_from_values(&shape, &narrow(&combined_scale))?,
                store.weights_from_values(&shape, &narrow(&combined_offset))?,
            )
        }
        _ => (
            store.weights_from_values(&shape, &combined_scale)?,
            store.weights_from_values(&shape, &combined_offset)?,
        ),
    };
    let mode = if nweight == 1 {
        ScaleMode::Uniform
    } else {
        ScaleMode::Channel
    };
    let power = ShapedWeights::empty(parameter_type).backend_weights();
    let output = builder.layer(|net| {
        net.add_scale(
            input.id,
            mode,
            offset.backend_weights(),
            scale.backend_weights(),
            power,
        )
    })?;
    params.push_tensor(output);
    Ok(())
}
