use crate::error::GraphError;
use crate::network::PoolingKind;
use crate::shape_inference::create_same_padding;

use super::conv::{apply_padding, check_image_rank, check_positive, Layout, Padding};
use super::{allow_data_types, check_input_kinds, OpConverterParams, FLOAT_TYPES};

pub fn convert_pool(params: &mut OpConverterParams<'_>) -> Result<(), GraphError> {
    check_input_kinds(params, &[("input", false)])?;
    allow_data_types(params, &FLOAT_TYPES, "T")?;
    let kind = match params.op() {
        "MaxPool" => PoolingKind::Max,
        "AvgPool" => PoolingKind::Average,
        other => {
            return Err(GraphError::unimplemented(format!(
                "Unsupported pooling type: {}, at {}",
                other,
                params.name()
            )))
        }
    };
    let padding = Padding::from_attr(params)?;
    check_image_rank(params, 0)?;
    let layout = Layout::from_attr(params)?;
    let strides: Vec<i64> = params.attrs.get("strides")?;
    let ksize: Vec<i64> = params.attrs.get("ksize")?;
    if strides.len() != 4 || ksize.len() != 4 {
        return Err(GraphError::invalid_argument(format!(
            "Pooling strides and ksize must specify 4 dimensions, at {}",
            params.name()
        )));
    }
    let stride = layout.hw(&strides);
    let window = layout.hw(&ksize);
    check_positive(params, "strides", stride)?;
    check_positive(params, "ksize", window)?;
    if padding == Padding::Valid {
        let dims = params.inputs[0].dims();
        for i in 0..2 {
            let size = dims[[layout.h, layout.w][i] - 1];
            if size > 0 && size < window[i] {
                return Err(GraphError::invalid_argument(format!(
                    "Pooling window {:?} does not fit input extent {}, at {}",
                    window,
                    size,
                    params.name()
                )));
            }
        }
    }
    if params.validation_only {
        return Ok(());
    }

    let input = params.inputs[0].tensor()?.clone();
    let (builder, _) = params.build()?;
    let tensor = if layout.nhwc {
        builder.transpose_tensor(&input, &[0, 3, 1, 2])?
    } else {
        input
    };
    let pads = match padding {
        Padding::Same => create_same_padding(stride, window, [tensor.dims[1], tensor.dims[2]])?,
        Padding::Valid => [(0, 0), (0, 0)],
    };
    let (tensor, symmetric) = apply_padding(builder, tensor, pads)?;
    let mut output =
        builder.layer(|net| net.add_pooling(tensor.id, kind, window, stride, symmetric))?;
    builder.mark_quantization_ranges_as_inferrable(&tensor, &output);
    if layout.nhwc {
        output = builder.transpose_tensor(&output, &[0, 2, 3, 1])?;
    }
    params.push_tensor(output);
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::converters::testing::*;
    use crate::error::ErrorKind;
    use crate::graph::{AttrValue, NodeDef};
    use crate::network::{LayerKind, PoolingKind};

    fn pool(op: &str, padding: &str) -> NodeDef {
        typed("pool", op)
            .with_attr("data_format", AttrValue::S("NHWC".into()))
            .with_attr("padding", AttrValue::S(padding.into()))
            .with_attr("strides", AttrValue::ListI(vec![1, 2, 2, 1]))
            .with_attr("ksize", AttrValue::ListI(vec![1, 2, 2, 1]))
    }

    #[test]
    fn max_pool_valid() {
        let lowered = lower(&pool("MaxPool", "VALID"), &[tensor("x", &[1, 6, 6, 3])]).unwrap();
        assert_eq!(lowered.layer_types(), vec!["Shuffle", "Pooling", "Shuffle"]);
        assert_eq!(lowered.output_dims(0), vec![3, 3, 3]);
        match &lowered.network.layers()[1].kind {
            LayerKind::Pooling { kind, window, .. } => {
                assert_eq!(*kind, PoolingKind::Max);
                assert_eq!(*window, [2, 2]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn avg_pool_same_pads_odd_inputs() {
        let node = pool("AvgPool", "SAME")
            .with_attr("strides", AttrValue::ListI(vec![1, 1, 1, 1]));
        let lowered = lower(&node, &[tensor("x", &[1, 5, 5, 2])]).unwrap();
        assert_eq!(
            lowered.layer_types(),
            vec!["Shuffle", "Padding", "Pooling", "Shuffle"]
        );
        assert_eq!(lowered.output_dims(0), vec![5, 5, 2]);
    }

    #[test]
    fn unknown_padding_is_rejected() {
        let err = lower(&pool("MaxPool", "EXPLICIT"), &[tensor("x", &[1, 4, 4, 1])]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unimplemented);
    }

    #[test]
    fn zero_strides_and_windows_are_rejected() {
        let input = [tensor("x", &[1, 4, 4, 1])];
        for padding in ["SAME", "VALID"] {
            let node = pool("MaxPool", padding)
                .with_attr("strides", AttrValue::ListI(vec![1, 0, 2, 1]));
            let err = lower(&node, &input).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        }
        let node = pool("AvgPool", "VALID").with_attr("ksize", AttrValue::ListI(vec![1, 2, 0, 1]));
        assert_eq!(lower(&node, &input).unwrap_err().kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn valid_window_larger_than_input_is_rejected() {
        let node = pool("MaxPool", "VALID").with_attr("ksize", AttrValue::ListI(vec![1, 5, 2, 1]));
        let err = lower(&node, &[tensor("x", &[1, 4, 4, 1])]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }
}
