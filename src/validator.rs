//! Validate-only probe: decides whether a node can be lowered without touching
//! a network. Inputs come from the producing nodes and the statically inferred
//! graph properties instead of a live session.

use std::sync::Arc;

use crate::attributes::NodeAttributes;
use crate::converters::{convert_const, is_quantize_op, OpConverterParams, OpConverterRegistry};
use crate::engine::{ConversionParams, PrecisionMode};
use crate::error::GraphError;
use crate::graph::{DataType, GraphProperties, NodeDef, PartialShape};
use crate::plugin::PluginFactory;
use crate::values::TensorOrWeights;
use crate::weights::{WeightStore, MAX_DIMS};

/// Types a network tensor can carry.
fn backend_type(dtype: DataType) -> Option<DataType> {
    match dtype {
        DataType::Float32 | DataType::Float16 | DataType::Int32 => Some(dtype),
        _ => None,
    }
}

/// Check a source tensor against what an implicit-batch network accepts and
/// split its shape into `(dtype, dims without batch, batch size)`.
///
/// Unknown non-batch dims pass while validating and fail when building.
pub fn validate_tensor_properties(
    producer_op: &str,
    dtype: DataType,
    shape: &PartialShape,
    validation_only: bool,
) -> Result<(DataType, Vec<i32>, i32), GraphError> {
    let dtype = backend_type(dtype)
        .ok_or_else(|| GraphError::unimplemented(format!("Unsupported data type {:?}", dtype)))?;
    let rank = shape
        .rank()
        .ok_or_else(|| GraphError::invalid_argument("Input tensor rank is unknown."))?;
    if rank > MAX_DIMS + 1 {
        return Err(GraphError::out_of_range(format!(
            "Input tensor rank is greater than {}",
            MAX_DIMS + 1
        )));
    }
    if producer_op != "Const" && rank < 1 {
        return Err(GraphError::invalid_argument(
            "Scalar input tensor is not supported since the first dimension is treated as batch dimension by the backend",
        ));
    }

    let batch_size = shape.dims.first().map(|d| *d as i32).unwrap_or(-1);
    let dims: Vec<i32> = shape.dims.iter().skip(1).map(|d| *d as i32).collect();
    for (d, size) in dims.iter().enumerate() {
        if *size == 0 {
            return Err(GraphError::unimplemented(format!(
                "Input tensor with shape {:?} is an empty tensor, which is not supported",
                shape.dims
            )));
        }
        if !validation_only && *size < 0 {
            return Err(GraphError::invalid_argument(format!(
                "Input tensor with shape {:?} has an unknown non-batch dimension at dim {}",
                shape.dims,
                d + 1
            )));
        }
    }
    Ok((dtype, dims, batch_size))
}

/// Value a producing node's output would have in a build session: weights for
/// constants, a placeholder tensor for everything else.
pub fn convert_to_tensor_or_weights(
    node: &NodeDef,
    output_port: usize,
    properties: &GraphProperties,
    params: &ConversionParams,
    weight_store: &mut WeightStore,
) -> Result<TensorOrWeights, GraphError> {
    if node.op == "Const" {
        if output_port != 0 {
            return Err(GraphError::invalid_argument(
                "Const node should only have one output.",
            ));
        }
        let mut outputs = Vec::new();
        let mut const_params = OpConverterParams {
            node,
            attrs: NodeAttributes::new(node),
            inputs: Vec::new(),
            outputs: &mut outputs,
            validation_only: true,
            weight_store,
            precision_mode: params.precision_mode,
            use_calibration: params.use_calibration,
            builder: None,
        };
        convert_const(&mut const_params)?;
        return outputs
            .into_iter()
            .next()
            .ok_or_else(|| GraphError::internal(format!("Const {} produced no output", node.name)));
    }

    let output = properties
        .output_properties(&node.name)
        .and_then(|outputs| outputs.get(output_port))
        .ok_or_else(|| GraphError::invalid_argument("Shape and data type are unknown"))?;
    let (dtype, dims, batch_size) =
        validate_tensor_properties(&node.op, output.dtype, &output.shape, true)?;
    Ok(TensorOrWeights::placeholder(dtype, dims, batch_size))
}

pub struct NodeValidator {
    registry: Arc<OpConverterRegistry>,
    plugin_factory: Option<Arc<dyn PluginFactory>>,
}

impl NodeValidator {
    pub fn new(registry: Arc<OpConverterRegistry>) -> Self {
        Self {
            registry,
            plugin_factory: None,
        }
    }

    pub fn with_plugin_factory(mut self, factory: Arc<dyn PluginFactory>) -> Self {
        self.plugin_factory = Some(factory);
        self
    }

    /// Run the node's converter in validate-only mode. `input_nodes` lists the
    /// producer and output port of every data input, in order.
    pub fn validate_node(
        &self,
        node: &NodeDef,
        input_nodes: &[(&NodeDef, usize)],
        params: &ConversionParams,
        properties: &GraphProperties,
    ) -> Result<(), GraphError> {
        if let Some(factory) = &self.plugin_factory {
            if factory.is_plugin(&node.op) {
                return Ok(());
            }
        }
        let quantize_without_int8 =
            is_quantize_op(&node.op) && params.precision_mode != PrecisionMode::Int8;
        let converter = self
            .registry
            .get(&node.op)
            .filter(|_| !quantize_without_int8)
            .ok_or_else(|| GraphError::unimplemented(format!("Op type {} is not supported.", node.op)))?;

        let mut weight_store = WeightStore::new();
        let mut inputs = Vec::with_capacity(input_nodes.len());
        for (i, (input_node, port)) in input_nodes.iter().enumerate() {
            let value =
                convert_to_tensor_or_weights(input_node, *port, properties, params, &mut weight_store)
                    .map_err(|err| {
                        GraphError::internal(format!(
                            "Failed to convert input with index {} to a TensorOrWeights: {}",
                            i, err
                        ))
                    })?;
            inputs.push(value);
        }

        let mut outputs = Vec::new();
        let mut converter_params = OpConverterParams {
            node,
            attrs: NodeAttributes::new(node),
            inputs,
            outputs: &mut outputs,
            validation_only: true,
            weight_store: &mut weight_store,
            precision_mode: params.precision_mode,
            use_calibration: params.use_calibration,
            builder: None,
        };
        let result = converter(&mut converter_params);
        tracing::trace!(node = %node.name, op = %node.op, ok = result.is_ok(), "validated node");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::graph::{AttrValue, TensorData, TensorProperties};

    fn shape(dims: &[i64]) -> PartialShape {
        PartialShape::new(dims.to_vec())
    }

    #[test]
    fn tensor_properties_split_off_the_batch() {
        let (dtype, dims, batch) =
            validate_tensor_properties("Placeholder", DataType::Float32, &shape(&[8, 3, 4]), false)
                .unwrap();
        assert_eq!(dtype, DataType::Float32);
        assert_eq!(dims, vec![3, 4]);
        assert_eq!(batch, 8);

        let (_, dims, batch) =
            validate_tensor_properties("Const", DataType::Int32, &shape(&[]), false).unwrap();
        assert!(dims.is_empty());
        assert_eq!(batch, -1);
    }

    #[test]
    fn tensor_property_errors() {
        let cases = [
            ("Placeholder", DataType::Int64, shape(&[1, 2]), false, ErrorKind::Unimplemented),
            ("Placeholder", DataType::Float32, PartialShape::unknown(), true, ErrorKind::InvalidArgument),
            ("Placeholder", DataType::Float32, shape(&[1; 10]), true, ErrorKind::OutOfRange),
            ("Placeholder", DataType::Float32, shape(&[]), true, ErrorKind::InvalidArgument),
            ("Placeholder", DataType::Float32, shape(&[1, 0, 3]), true, ErrorKind::Unimplemented),
            ("Placeholder", DataType::Float32, shape(&[1, -1, 3]), false, ErrorKind::InvalidArgument),
        ];
        for (op, dtype, shape, validation_only, kind) in cases {
            let err = validate_tensor_properties(op, dtype, &shape, validation_only).unwrap_err();
            assert_eq!(err.kind(), kind, "{:?}", shape);
        }
        // Unknown non-batch dims are fine while probing.
        assert!(
            validate_tensor_properties("Placeholder", DataType::Float32, &shape(&[-1, -1, 3]), true)
                .is_ok()
        );
    }

    #[test]
    fn inputs_without_properties_fail_as_internal() {
        let validator = NodeValidator::new(Arc::new(OpConverterRegistry::with_defaults()));
        let producer = NodeDef::new("x", "Placeholder");
        let node = NodeDef::new("r", "Relu")
            .with_input("x")
            .with_attr("T", AttrValue::Type(DataType::Float32));
        let err = validator
            .validate_node(
                &node,
                &[(&producer, 0)],
                &ConversionParams::default(),
                &GraphProperties::default(),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(err.to_string().contains("Shape and data type are unknown"));
    }

    #[test]
    fn const_inputs_need_port_zero() {
        let producer = NodeDef::new("c", "Const")
            .with_attr("dtype", AttrValue::Type(DataType::Float32))
            .with_attr("value", AttrValue::Tensor(TensorData::from_f32(vec![1], &[1.0])));
        let mut store = WeightStore::new();
        let params = ConversionParams::default();
        let properties = GraphProperties::default();
        let value =
            convert_to_tensor_or_weights(&producer, 0, &properties, &params, &mut store).unwrap();
        assert!(value.is_weights());
        let err = convert_to_tensor_or_weights(&producer, 1, &properties, &params, &mut store)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn placeholders_come_from_graph_properties() {
        let mut properties = GraphProperties::default();
        properties.insert(
            "split",
            vec![
                TensorProperties {
                    dtype: DataType::Float32,
                    shape: shape(&[2, 3]),
                },
                TensorProperties {
                    dtype: DataType::Float16,
                    shape: shape(&[-1, 5, -1]),
                },
            ],
        );
        let producer = NodeDef::new("split", "Split");
        let mut store = WeightStore::new();
        let value = convert_to_tensor_or_weights(
            &producer,
            1,
            &properties,
            &ConversionParams::default(),
            &mut store,
        )
        .unwrap();
        assert_eq!(
            value,
            TensorOrWeights::placeholder(DataType::Float16, vec![5, -1], -1)
        );
    }

    #[test]
    fn unknown_ops_are_unsupported() {
        let validator = NodeValidator::new(Arc::new(OpConverterRegistry::with_defaults()));
        let err = validator
            .validate_node(
                &NodeDef::new("w", "Where"),
                &[],
                &ConversionParams::default(),
                &GraphProperties::default(),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unimplemented);
        assert!(err.to_string().contains("Op type Where is not supported."));
    }
}
