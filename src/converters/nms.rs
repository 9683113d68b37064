use crate::error::GraphError;
use crate::graph::DataType;
use crate::network::PluginField;
use crate::values::{TensorHandle, TensorOrWeights};
use crate::weights::ShapedWeights;

use super::{check_input_kinds, int_values, OpConverterParams};

/// Name of the batched NMS plugin the backend provides.
pub const BATCHED_NMS_PLUGIN: &str = "BatchedNMS_TRT";

fn check_scalar_input(
    params: &OpConverterParams<'_>,
    index: usize,
    label: &str,
) -> Result<ShapedWeights, GraphError> {
    let weights = params.inputs[index].weights()?.clone();
    if weights.dims().len() != 1 {
        return Err(GraphError::invalid_argument(format!(
            "BatchedNMS {} must be 0-D, at {}",
            label,
            params.name()
        )));
    }
    Ok(weights)
}

fn first_int(params: &OpConverterParams<'_>, weights: &ShapedWeights) -> Result<i32, GraphError> {
    int_values(&*params.weight_store, weights)?
        .first()
        .copied()
        .ok_or_else(|| GraphError::invalid_argument(format!("Empty size input, at {}", params.name())))
}

fn first_float(params: &OpConverterParams<'_>, weights: &ShapedWeights) -> Result<f32, GraphError> {
    params
        .weight_store
        .values_as_f32(weights)?
        .first()
        .copied()
        .ok_or_else(|| {
            GraphError::invalid_argument(format!("Empty threshold input, at {}", params.name()))
        })
}

/// CombinedNonMaxSuppression as one batched NMS plugin layer. Outputs are
/// pushed as boxes, scores, classes, then the detection count.
pub fn convert_combined_nms(params: &mut OpConverterParams<'_>) -> Result<(), GraphError> {
    check_input_kinds(
        params,
        &[
            ("boxes", false),
            ("scores", false),
            ("max_output_size_per_class", true),
            ("max_total_size", true),
            ("iou_threshold", true),
            ("score_threshold", true),
        ],
    )?;
    let boxes_dims = params.inputs[0].dims().to_vec();
    let scores_dims = params.inputs[1].dims().to_vec();
    if boxes_dims.len() != 3 {
        return Err(GraphError::invalid_argument(format!(
            "BatchedNMS input boxes must be 3-D excluding batch, at {}",
            params.name()
        )));
    }
    if scores_dims.len() < 2 {
        return Err(GraphError::invalid_argument(format!(
            "BatchedNMS input scores must be 2-D excluding batch, at {}",
            params.name()
        )));
    }
    let num_classes = scores_dims[1];
    if boxes_dims[1] != 1 && boxes_dims[1] != num_classes {
        return Err(GraphError::invalid_argument(format!(
            "BatchedNMS third dimension of boxes must be either 1 or num_classes, at {}",
            params.name()
        )));
    }

    let per_class = check_scalar_input(params, 2, "max_output_size_per_class")?;
    let max_size_per_class = first_int(params, &per_class)?;
    if max_size_per_class <= 0 {
        return Err(GraphError::invalid_argument(format!(
            "BatchedNMS max_output_size_per_class should be > 0, at {}",
            params.name()
        )));
    }
    let total = check_scalar_input(params, 3, "max_total_size")?;
    let max_total_size = first_int(params, &total)?;
    if max_total_size <= 0 {
        return Err(GraphError::invalid_argument(format!(
            "BatchedNMS max_total_size should be > 0, at {}",
            params.name()
        )));
    }
    let iou = check_scalar_input(params, 4, "iou_threshold")?;
    let iou_threshold = first_float(params, &iou)?;
    if !(0.0..=1.0).contains(&iou_threshold) {
        return Err(GraphError::invalid_argument(format!(
            "BatchedNMS iou_threshold must be in [0, 1], at {}",
            params.name()
        )));
    }
    let score = check_scalar_input(params, 5, "score_threshold")?;
    if params.validation_only {
        return Ok(());
    }

    let score_threshold = first_float(params, &score)?;
    let share_location = boxes_dims[1] == 1;
    let pad_per_class = params.attrs.get_or("pad_per_class", false)?;
    let top_k = if pad_per_class {
        (max_size_per_class * num_classes).min(max_total_size)
    } else {
        max_total_size
    };
    let keep_top_k = top_k;
    // Coordinates are always normalized and no class is background.
    let fields: Vec<PluginField> = [
        ("shareLocation", f32::from(u8::from(share_location))),
        ("backgroundLabelId", -1.0),
        ("numClasses", num_classes as f32),
        ("topK", top_k as f32),
        ("keepTopK", keep_top_k as f32),
        ("scoreThreshold", score_threshold),
        ("iouThreshold", iou_threshold),
        ("isNormalized", 1.0),
    ]
    .into_iter()
    .map(|(name, value)| PluginField {
        name: name.to_string(),
        values: vec![value],
    })
    .collect();
    tracing::debug!(node = params.name(), top_k, share_location, "batched nms");

    let boxes = params.inputs[0].tensor()?.id;
    let scores = params.inputs[1].tensor()?.id;
    let (builder, store) = params.build()?;
    let outputs = builder.network_mut().add_plugin(
        BATCHED_NMS_PLUGIN,
        fields,
        &[boxes, scores],
        vec![
            (DataType::Int32, vec![1]),
            (DataType::Float32, vec![keep_top_k, 4]),
            (DataType::Float32, vec![keep_top_k, 1]),
            (DataType::Float32, vec![keep_top_k, 1]),
        ],
    )?;
    let handles = outputs
        .into_iter()
        .map(|id| builder.handle(id))
        .collect::<Result<Vec<_>, _>>()?;

    let mut shrink_last_dim = |tensor: &TensorHandle| {
        let Some((last, rest)) = tensor.dims.split_last() else {
            return Err(GraphError::internal("Expect last dims to be 1, for a rank 0 tensor"));
        };
        if *last != 1 {
            return Err(GraphError::internal(format!(
                "Expect last dims to be 1, for tensor {:?}",
                tensor.dims
            )));
        }
        builder.prepare_tensor_for_shape(store, &TensorOrWeights::from(tensor.clone()), rest)
    };
    let nmsed_scores = shrink_last_dim(&handles[2])?;
    let nmsed_classes = shrink_last_dim(&handles[3])?;
    let num_detections = shrink_last_dim(&handles[0])?;

    params.push_tensor(handles[1].clone());
    params.push_tensor(nmsed_scores);
    params.push_tensor(nmsed_classes);
    params.push_tensor(num_detections);
    Ok(())
}
