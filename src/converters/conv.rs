use crate::builder::NetworkBuilder;
use crate::engine::PrecisionMode;
use crate::error::GraphError;
use crate::graph::DataType;
use crate::network::{ConvolutionSpec, Hw};
use crate::reorder::reorder_rsck_to_kcrs;
use crate::shape_inference::create_same_padding;
use crate::values::TensorHandle;
use crate::weights::{convert_fp32_to_fp16, ShapedWeights};

use super::{allow_data_types, check_input_kinds, int_values, OpConverterParams, FLOAT_TYPES};

/// Positions of the channel and spatial dims in a 4-d source layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct Layout {
    pub nhwc: bool,
    pub c: usize,
    pub h: usize,
    pub w: usize,
}

impl Layout {
    pub fn from_attr(params: &OpConverterParams<'_>) -> Result<Self, GraphError> {
        let format: String = params.attrs.get_or("data_format", "NHWC".to_string())?;
        match format.as_str() {
            "NHWC" => Ok(Self {
                nhwc: true,
                c: 3,
                h: 1,
                w: 2,
            }),
            "NCHW" => Ok(Self {
                nhwc: false,
                c: 1,
                h: 2,
                w: 3,
            }),
            other => Err(GraphError::unimplemented(format!(
                "Data format {} is not supported, at {}",
                other,
                params.name()
            ))),
        }
    }

    pub fn hw(&self, values: &[i64]) -> Hw {
        [values[self.h] as i32, values[self.w] as i32]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Padding {
    Same,
    Valid,
}

impl Padding {
    pub fn from_attr(params: &OpConverterParams<'_>) -> Result<Self, GraphError> {
        let padding: String = params.attrs.get("padding")?;
        match padding.as_str() {
            "SAME" => Ok(Padding::Same),
            "VALID" => Ok(Padding::Valid),
            other => Err(GraphError::unimplemented(format!(
                "Unsupported padding type: {}, at {}",
                other,
                params.name()
            ))),
        }
    }
}

/// Spatial ops need a CHW/HWC tensor once the batch is stripped.
pub(super) fn check_image_rank(params: &OpConverterParams<'_>, index: usize) -> Result<(), GraphError> {
    let rank = params.inputs[index].dims().len();
    if rank != 3 {
        return Err(GraphError::invalid_argument(format!(
            "{} expects a rank 4 input including batch, got rank {}, at {}",
            params.op(),
            rank + 1,
            params.name()
        )));
    }
    Ok(())
}

/// Apply asymmetric padding as its own layer; the returned padding is what
/// is left for the consuming layer.
pub(super) fn apply_padding(
    builder: &mut NetworkBuilder,
    tensor: TensorHandle,
    padding: [(i32, i32); 2],
) -> Result<(TensorHandle, Hw), GraphError> {
    if padding[0].0 == padding[0].1 && padding[1].0 == padding[1].1 {
        return Ok((tensor, [padding[0].0, padding[1].0]));
    }
    tracing::trace!(?padding, "asymmetric padding");
    let pre = [padding[0].0, padding[1].0];
    let post = [padding[0].1, padding[1].1];
    let padded = builder.layer(|net| net.add_padding(tensor.id, pre, post))?;
    builder.mark_quantization_ranges_as_inferrable(&tensor, &padded);
    Ok((padded, [0, 0]))
}

fn four(params: &OpConverterParams<'_>, key: &str, default: Vec<i64>) -> Result<Vec<i64>, GraphError> {
    let values: Vec<i64> = params.attrs.get_or(key, default)?;
    if values.len() != 4 {
        return Err(GraphError::invalid_argument(format!(
            "Convolution {} field must specify 4 dimensions, at {}",
            key,
            params.name()
        )));
    }
    Ok(values)
}

/// Spatial strides, windows and sizes must all be at least one.
pub(super) fn check_positive(
    params: &OpConverterParams<'_>,
    key: &str,
    values: Hw,
) -> Result<(), GraphError> {
    if values.iter().any(|v| *v <= 0) {
        return Err(GraphError::invalid_argument(format!(
            "{} must be positive in the spatial dimensions, got {:?}, at {}",
            key,
            values,
            params.name()
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConvKind {
    Regular,
    Depthwise,
    BackpropInput,
}

pub fn convert_conv2d(params: &mut OpConverterParams<'_>) -> Result<(), GraphError> {
    convert_conv2d_helper(params, ConvKind::Regular)
}

pub fn convert_conv2d_depthwise(params: &mut OpConverterParams<'_>) -> Result<(), GraphError> {
    convert_conv2d_helper(params, ConvKind::Depthwise)
}

pub fn convert_conv2d_backprop_input(params: &mut OpConverterParams<'_>) -> Result<(), GraphError> {
    convert_conv2d_helper(params, ConvKind::BackpropInput)
}

fn convert_conv2d_helper(params: &mut OpConverterParams<'_>, kind: ConvKind) -> Result<(), GraphError> {
    let backprop = kind == ConvKind::BackpropInput;
    // Backprop inputs are (output size, filter, input).
    let tensor_index = if backprop {
        check_input_kinds(
            params,
            &[("input_sizes", true), ("filter", true), ("out_backprop", false)],
        )?;
        2
    } else {
        check_input_kinds(params, &[("input", false), ("filter", true)])?;
        0
    };
    allow_data_types(params, &FLOAT_TYPES, "T")?;
    let mut kernel = params.inputs[1].weights()?.clone();
    if kernel.dims().len() != 4 {
        return Err(GraphError::invalid_argument(format!(
            "Conv2D expects kernel of dimension 4, at {}",
            params.name()
        )));
    }
    check_image_rank(params, tensor_index)?;
    let layout = Layout::from_attr(params)?;

    let dilations = four(params, "dilations", vec![1, 1, 1, 1])?;
    if dilations[0] != 1 || dilations[layout.c] != 1 {
        return Err(GraphError::unimplemented(format!(
            "Dilation rate must be 1 for batch and channel dimensions, at {}",
            params.name()
        )));
    }
    let dilation = layout.hw(&dilations);
    if backprop && dilation != [1, 1] {
        return Err(GraphError::unimplemented(format!(
            "Dilation with Conv2DBackpropInput (conv2d_transpose) is not supported, at {}",
            params.name()
        )));
    }
    let strides = four(params, "strides", vec![1, 1, 1, 1])?;
    if strides[0] != 1 || strides[layout.c] != 1 {
        return Err(GraphError::unimplemented(format!(
            "Stride must be 1 for batch and channel dimensions, at {}",
            params.name()
        )));
    }
    let stride = layout.hw(&strides);
    check_positive(params, "strides", stride)?;
    check_positive(params, "dilations", dilation)?;
    let padding = Padding::from_attr(params)?;

    // RSCK for forward kernels, RSKC for backprop filters.
    let dims = params.inputs[tensor_index].dims().to_vec();
    let channels = dims[layout.c - 1];
    let kernel_channels = kernel.dims()[if backprop { 3 } else { 2 }];
    if channels > 0 && kernel_channels != channels {
        return Err(GraphError::invalid_argument(format!(
            "{} kernel expects {} input channels but the input has {}, at {}",
            params.op(),
            kernel_channels,
            channels,
            params.name()
        )));
    }
    if !backprop && padding == Padding::Valid {
        let window = [kernel.dims()[0], kernel.dims()[1]];
        for i in 0..2 {
            let size = dims[[layout.h, layout.w][i] - 1];
            let effective = window[i] + (window[i] - 1) * (dilation[i] - 1);
            if size > 0 && size < effective {
                return Err(GraphError::invalid_argument(format!(
                    "{} kernel of extent {} does not fit input extent {}, at {}",
                    params.op(),
                    effective,
                    size,
                    params.name()
                )));
            }
        }
    }
    let output_size = if backprop {
        let store = &*params.weight_store;
        let sizes = int_values(store, params.inputs[0].weights()?)?;
        if sizes.len() != 4 {
            return Err(GraphError::invalid_argument(format!(
                "input_sizes must hold 4 values, at {}",
                params.name()
            )));
        }
        let size = [sizes[layout.h], sizes[layout.w]];
        check_positive(params, "input_sizes", size)?;
        Some(size)
    } else {
        None
    };
    if params.validation_only {
        return Ok(());
    }

    let node = params.node;
    let input = params.inputs[tensor_index].tensor()?.clone();
    let (builder, store) = params.build()?;
    let mut tensor = if layout.nhwc {
        builder.transpose_tensor(&input, &[0, 3, 1, 2])?
    } else {
        input
    };
    let num_groups = match kind {
        ConvKind::Depthwise => tensor.dims[0],
        _ => 1,
    };
    if num_groups <= 0 {
        return Err(GraphError::invalid_argument(format!(
            "Depthwise convolution needs a known channel count, at {}",
            node.name
        )));
    }

    if builder.precision_mode() == PrecisionMode::Fp16 && kernel.dtype() == DataType::Float32 {
        kernel = convert_fp32_to_fp16(store, &kernel)?;
    }
    // RSCK becomes KCRS; a backprop filter is RSKC and becomes CKRS the same way.
    let weights = reorder_rsck_to_kcrs(store, &kernel, num_groups as usize)?;
    let output_axis = if backprop { 1 } else { 0 };
    let num_outputs = weights.dims()[output_axis] * num_groups;
    let kernel_size = [weights.dims()[2], weights.dims()[3]];

    let pads = match padding {
        Padding::Same => {
            let effective = [
                kernel_size[0] + (kernel_size[0] - 1) * (dilation[0] - 1),
                kernel_size[1] + (kernel_size[1] - 1) * (dilation[1] - 1),
            ];
            let spatial = output_size.unwrap_or([tensor.dims[1], tensor.dims[2]]);
            create_same_padding(stride, effective, spatial)?
        }
        Padding::Valid => [(0, 0), (0, 0)],
    };
    let (padded, symmetric) = apply_padding(builder, tensor, pads)?;
    tensor = padded;

    let spec = ConvolutionSpec {
        num_outputs,
        kernel: kernel_size,
        stride,
        padding: symmetric,
        dilation,
        groups: num_groups,
        kernel_weights: weights.backend_weights(),
        bias_weights: ShapedWeights::empty(weights.dtype()).backend_weights(),
    };
    tracing::debug!(
        node = %node.name,
        kernel = ?spec.kernel,
        stride = ?spec.stride,
        groups = num_groups,
        "convolution"
    );
    let mut output = if backprop {
        builder.layer(|net| net.add_deconvolution(tensor.id, spec))?
    } else {
        builder.layer(|net| net.add_convolution(tensor.id, spec))?
    };
    if layout.nhwc {
        output = builder.transpose_tensor(&output, &[0, 2, 3, 1])?;
    }
    params.push_tensor(output);
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::converters::testing::*;
    use crate::engine::PrecisionMode;
    use crate::error::ErrorKind;
    use crate::graph::{AttrValue, DataType, NodeDef};
    use crate::network::LayerKind;

    fn conv(op: &str, format: &str, padding: &str) -> NodeDef {
        typed("conv", op)
            .with_attr("data_format", AttrValue::S(format.into()))
            .with_attr("padding", AttrValue::S(padding.into()))
            .with_attr("strides", AttrValue::ListI(vec![1, 1, 1, 1]))
            .with_attr("dilations", AttrValue::ListI(vec![1, 1, 1, 1]))
    }

    #[test]
    fn nhwc_conv_is_wrapped_in_transposes() {
        let lowered = lower(
            &conv("Conv2D", "NHWC", "VALID"),
            &[
                tensor("x", &[1, 4, 4, 2]),
                consts("w", &[3, 3, 2, 5], &[0.5; 90]),
            ],
        )
        .unwrap();
        assert_eq!(
            lowered.layer_types(),
            vec!["Shuffle", "Convolution", "Shuffle"]
        );
        assert_eq!(lowered.output_dims(0), vec![2, 2, 5]);
    }

    #[test]
    fn same_padding_splits_odd_totals() {
        let node = conv("Conv2D", "NCHW", "SAME")
            .with_attr("strides", AttrValue::ListI(vec![1, 1, 2, 2]));
        let lowered = lower(
            &node,
            &[tensor("x", &[1, 1, 8, 8]), consts("w", &[3, 3, 1, 1], &[1.0; 9])],
        )
        .unwrap();
        assert_eq!(lowered.layer_types(), vec!["Padding", "Convolution"]);
        match &lowered.network.layers()[0].kind {
            LayerKind::Padding { pre, post } => {
                assert_eq!(*pre, [0, 0]);
                assert_eq!(*post, [1, 1]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(lowered.output_dims(0), vec![1, 4, 4]);
    }

    #[test]
    fn depthwise_uses_one_group_per_channel() {
        let lowered = lower(
            &conv("DepthwiseConv2dNative", "NCHW", "SAME"),
            &[
                tensor("x", &[1, 3, 5, 5]),
                consts("w", &[3, 3, 3, 2], &[1.0; 54]),
            ],
        )
        .unwrap();
        match &lowered.network.layers()[0].kind {
            LayerKind::Convolution(spec) => {
                assert_eq!(spec.groups, 3);
                assert_eq!(spec.num_outputs, 6);
                assert_eq!(spec.padding, [1, 1]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(lowered.output_dims(0), vec![6, 5, 5]);
    }

    #[test]
    fn backprop_input_becomes_deconvolution() {
        let node = conv("Conv2DBackpropInput", "NCHW", "VALID")
            .with_attr("strides", AttrValue::ListI(vec![1, 1, 2, 2]));
        let lowered = lower(
            &node,
            &[
                int_consts("sizes", &[4], &[1, 4, 6, 6]),
                consts("w", &[2, 2, 4, 3], &[1.0; 48]),
                tensor("x", &[1, 3, 3, 3]),
            ],
        )
        .unwrap();
        assert_eq!(lowered.layer_types(), vec!["Deconvolution"]);
        assert_eq!(lowered.output_dims(0), vec![4, 6, 6]);
    }

    #[test]
    fn fp16_mode_converts_kernels() {
        let lowered = Harness::precision(PrecisionMode::Fp16)
            .lower(
                &conv("Conv2D", "NCHW", "VALID"),
                &[tensor("x", &[1, 1, 2, 2]), consts("w", &[1, 1, 1, 1], &[3.0])],
            )
            .unwrap();
        match &lowered.network.layers()[0].kind {
            LayerKind::Convolution(spec) => {
                assert_eq!(spec.kernel_weights.dtype, DataType::Float16)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn rejects_batch_strides_and_unknown_formats() {
        let node = conv("Conv2D", "NHWC", "VALID")
            .with_attr("strides", AttrValue::ListI(vec![2, 1, 1, 1]));
        let inputs = [tensor("x", &[1, 4, 4, 1]), consts("w", &[1, 1, 1, 1], &[1.0])];
        assert_eq!(lower(&node, &inputs).unwrap_err().kind(), ErrorKind::Unimplemented);

        let node = conv("Conv2D", "NCDHW", "VALID");
        assert_eq!(lower(&node, &inputs).unwrap_err().kind(), ErrorKind::Unimplemented);

        let node = conv("Conv2D", "NHWC", "VALID");
        let err = lower(&node, &[tensor("x", &[1, 4, 4, 1]), consts("w", &[1, 1], &[1.0])])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn zero_spatial_strides_are_rejected() {
        let inputs = [tensor("x", &[1, 1, 8, 8]), consts("w", &[3, 3, 1, 1], &[1.0; 9])];
        for padding in ["SAME", "VALID"] {
            let node = conv("Conv2D", "NCHW", padding)
                .with_attr("strides", AttrValue::ListI(vec![1, 1, 0, 1]));
            let err = lower(&node, &inputs).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument);
            assert!(err.to_string().contains("strides"));
        }
        let node = conv("Conv2D", "NCHW", "VALID")
            .with_attr("dilations", AttrValue::ListI(vec![1, 1, 1, -1]));
        assert_eq!(lower(&node, &inputs).unwrap_err().kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn kernel_channels_must_match_the_input() {
        let err = lower(
            &conv("Conv2D", "NCHW", "VALID"),
            &[tensor("x", &[1, 3, 5, 5]), consts("w", &[3, 3, 2, 4], &[1.0; 72])],
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(err.to_string().contains("input channels"));

        let err = lower(
            &conv("DepthwiseConv2dNative", "NHWC", "SAME"),
            &[tensor("x", &[1, 5, 5, 3]), consts("w", &[3, 3, 4, 1], &[1.0; 36])],
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn valid_kernel_larger_than_input_is_rejected() {
        let err = lower(
            &conv("Conv2D", "NHWC", "VALID"),
            &[tensor("x", &[1, 2, 6, 1]), consts("w", &[3, 3, 1, 1], &[1.0; 9])],
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        // Dilation grows the window past the input as well.
        let node = conv("Conv2D", "NCHW", "VALID")
            .with_attr("dilations", AttrValue::ListI(vec![1, 1, 3, 1]));
        let err = lower(
            &node,
            &[tensor("x", &[1, 1, 5, 5]), consts("w", &[3, 3, 1, 1], &[1.0; 9])],
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        // SAME keeps any input size.
        let lowered = lower(
            &conv("Conv2D", "NCHW", "SAME"),
            &[tensor("x", &[1, 1, 2, 2]), consts("w", &[3, 3, 1, 1], &[1.0; 9])],
        )
        .unwrap();
        assert_eq!(lowered.output_dims(0), vec![1, 2, 2]);
    }

    #[test]
    fn backprop_rejects_empty_output_sizes() {
        let node = conv("Conv2DBackpropInput", "NCHW", "VALID");
        let err = lower(
            &node,
            &[
                int_consts("sizes", &[4], &[1, 4, 0, 6]),
                consts("w", &[2, 2, 4, 3], &[1.0; 48]),
                tensor("x", &[1, 3, 3, 3]),
            ],
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }
}
