//! Per-op lowering routines and the table that dispatches to them.
//!
//! Every converter runs twice over the lifetime of a graph: once with
//! `validation_only` set, where inputs may be shape-only placeholders and no
//! network exists, and once to build layers. Both runs go through the same
//! checks in the same order, so a node the validator accepts is a node the
//! converter can lower.

use std::collections::HashMap;

use crate::attributes::NodeAttributes;
use crate::builder::NetworkBuilder;
use crate::engine::PrecisionMode;
use crate::error::GraphError;
use crate::graph::{DataType, NodeDef};
use crate::values::{TensorHandle, TensorOrWeights};
use crate::weights::{ShapedWeights, WeightStore};

mod activation;
mod constant;
mod conv;
mod elementwise;
mod matmul;
mod nms;
mod normalization;
mod plugin;
mod pool;
mod quantize;
mod reduce;
mod shape_ops;
mod slice;

pub use constant::convert_const;
pub use plugin::convert_plugin;

/// Ops that only carry a quantization range. The validator accepts them in
/// INT8 mode only.
pub const QUANTIZE_OPS: [&str; 4] = [
    "QuantizeAndDequantizeV2",
    "QuantizeAndDequantizeV3",
    "FakeQuantWithMinMaxVars",
    "FakeQuantWithMinMaxArgs",
];

pub fn is_quantize_op(op: &str) -> bool {
    QUANTIZE_OPS.contains(&op)
}

/// Everything one converter call can see.
pub struct OpConverterParams<'a> {
    pub node: &'a NodeDef,
    pub attrs: NodeAttributes<'a>,
    pub inputs: Vec<TensorOrWeights>,
    pub outputs: &'a mut Vec<TensorOrWeights>,
    pub validation_only: bool,
    pub weight_store: &'a mut WeightStore,
    pub precision_mode: PrecisionMode,
    pub use_calibration: bool,
    /// `None` while validating.
    pub builder: Option<&'a mut NetworkBuilder>,
}

impl<'a> OpConverterParams<'a> {
    pub fn op(&self) -> &'a str {
        &self.node.op
    }

    pub fn name(&self) -> &'a str {
        &self.node.name
    }

    /// Network and weight store for the build phase.
    pub fn build(&mut self) -> Result<(&mut NetworkBuilder, &mut WeightStore), GraphError> {
        let builder = self.builder.as_deref_mut().ok_or_else(|| {
            GraphError::internal(format!(
                "Converter for {} needs a network outside validation",
                self.node.name
            ))
        })?;
        Ok((builder, &mut *self.weight_store))
    }

    pub fn push_tensor(&mut self, tensor: TensorHandle) {
        self.outputs.push(TensorOrWeights::from(tensor));
    }
}

pub type OpConverter = fn(&mut OpConverterParams<'_>) -> Result<(), GraphError>;

/// Op type name to converter. Built once and shared by every session.
pub struct OpConverterRegistry {
    converters: HashMap<&'static str, OpConverter>,
}

impl OpConverterRegistry {
    pub fn empty() -> Self {
        Self {
            converters: HashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register("Const", constant::convert_const);
        registry.register("Identity", constant::convert_identity);
        registry.register("Snapshot", constant::convert_identity);

        for op in ["Add", "Mul", "Sub", "Div", "RealDiv", "Maximum", "Minimum", "Pow"] {
            registry.register(op, elementwise::convert_binary);
        }
        registry.register("Square", elementwise::convert_square);

        for op in ["Relu", "Sigmoid", "Tanh"] {
            registry.register(op, activation::convert_activation);
        }
        registry.register("LeakyRelu", activation::convert_leaky_relu);
        registry.register("Relu6", activation::convert_relu6);
        for op in activation::UNARY_OPS {
            registry.register(op, activation::convert_unary);
        }
        registry.register("Rsqrt", activation::convert_rsqrt);

        registry.register("Transpose", shape_ops::convert_transpose);
        registry.register("Reshape", shape_ops::convert_reshape);
        registry.register("ExpandDims", shape_ops::convert_expand_dims);
        registry.register("Squeeze", shape_ops::convert_squeeze);
        registry.register("Pack", shape_ops::convert_pack);
        registry.register("ConcatV2", shape_ops::convert_concat);
        registry.register("Pad", shape_ops::convert_pad);
        registry.register("GatherV2", shape_ops::convert_gather);

        registry.register("Slice", slice::convert_slice);
        registry.register("StridedSlice", slice::convert_strided_slice);
        registry.register("Split", slice::convert_split);
        registry.register("Unpack", slice::convert_unpack);

        registry.register("Conv2D", conv::convert_conv2d);
        registry.register("DepthwiseConv2dNative", conv::convert_conv2d_depthwise);
        registry.register("Conv2DBackpropInput", conv::convert_conv2d_backprop_input);
        registry.register("AvgPool", pool::convert_pool);
        registry.register("MaxPool", pool::convert_pool);

        registry.register("BiasAdd", normalization::convert_bias_add);
        registry.register("FusedBatchNorm", normalization::convert_fused_batch_norm);
        registry.register("FusedBatchNormV2", normalization::convert_fused_batch_norm);

        registry.register("MatMul", matmul::convert_matmul);
        registry.register("BatchMatMul", matmul::convert_batch_matmul);

        registry.register("Softmax", reduce::convert_softmax);
        for op in ["Sum", "Prod", "Max", "Min", "Mean"] {
            registry.register(op, reduce::convert_reduce);
        }
        registry.register("ArgMin", reduce::convert_arg_min_max);
        registry.register("ArgMax", reduce::convert_arg_min_max);
        registry.register("TopKV2", reduce::convert_top_k);

        registry.register("CombinedNonMaxSuppression", nms::convert_combined_nms);
        for op in QUANTIZE_OPS {
            registry.register(op, quantize::convert_quantize);
        }
        registry
    }

    pub fn register(&mut self, op: &'static str, converter: OpConverter) {
        self.converters.insert(op, converter);
    }

    pub fn available_ops(&self) -> Vec<&'static str> {
        let mut keys: Vec<_> = self.converters.keys().copied().collect();
        keys.sort_unstable();
        keys
    }

    pub fn contains(&self, op: &str) -> bool {
        self.converters.contains_key(op)
    }

    pub fn get(&self, op: &str) -> Option<OpConverter> {
        self.converters.get(op).copied()
    }
}

impl Default for OpConverterRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Arity and tensor/weights kind of every input. `true` means the input has
/// to be a constant.
pub fn check_input_kinds(
    params: &OpConverterParams<'_>,
    expected: &[(&str, bool)],
) -> Result<(), GraphError> {
    let node = params.node;
    if params.inputs.len() != expected.len() {
        return Err(GraphError::invalid_argument(format!(
            "{} got {} inputs but expected {}, at {}",
            node.op,
            params.inputs.len(),
            expected.len(),
            node.name
        )));
    }
    for (input, (label, is_weight)) in params.inputs.iter().zip(expected) {
        if *is_weight && input.is_tensor() {
            return Err(GraphError::unimplemented(format!(
                "The input \"{}\" for {} must be a constant, at {}",
                label, node.op, node.name
            )));
        }
        if !*is_weight && input.is_weights() {
            return Err(GraphError::unimplemented(format!(
                "The input \"{}\" for {} must be a tensor, at {}",
                label, node.op, node.name
            )));
        }
    }
    Ok(())
}

/// The type named by `attr` has to be one of `allowed`.
pub fn allow_data_types(
    params: &OpConverterParams<'_>,
    allowed: &[DataType],
    attr: &str,
) -> Result<(), GraphError> {
    if !params.attrs.contains(attr) {
        return Err(GraphError::invalid_argument(format!(
            "Attribute with name {} not found.",
            attr
        )));
    }
    let dtype: DataType = params.attrs.get(attr)?;
    if !allowed.contains(&dtype) {
        let names: Vec<String> = allowed.iter().map(|d| format!("{:?}", d)).collect();
        return Err(GraphError::unimplemented(format!(
            "Data type {:?} is not supported for {}, must be one of [{}], at {}",
            dtype,
            params.node.op,
            names.join(", "),
            params.node.name
        )));
    }
    Ok(())
}

pub(crate) const FLOAT_TYPES: [DataType; 2] = [DataType::Float32, DataType::Float16];
pub(crate) const FLOAT_AND_INT_TYPES: [DataType; 3] =
    [DataType::Float32, DataType::Float16, DataType::Int32];

/// Integer payload of a constant input such as a permutation or an axis.
pub fn int_values(store: &WeightStore, weights: &ShapedWeights) -> Result<Vec<i32>, GraphError> {
    if weights.dtype() != DataType::Int32 {
        return Err(GraphError::unimplemented(format!(
            "Expected int32 constant, got {:?}",
            weights.dtype()
        )));
    }
    Ok(store.values::<i32>(weights)?.to_vec())
}

/// A one-element constant of `value` whose rank matches `dims`, so it
/// broadcasts against a tensor of that shape. Its range is pinned to `value`.
pub fn create_broadcastable_scalar_constant(
    params: &mut OpConverterParams<'_>,
    value: f32,
    dims: &[i32],
) -> Result<TensorHandle, GraphError> {
    let dtype = params.attrs.get_or("T", DataType::Float32)?;
    let ones = vec![1; dims.len()];
    let (builder, store) = params.build()?;
    let weights = match dtype {
        DataType::Float32 => store.weights_from_values(&ones, &[value])?,
        DataType::Float16 => store.weights_from_values(&ones, &[half::f16::from_f32(value)])?,
        other => {
            return Err(GraphError::invalid_argument(format!(
                "Unsupported data type {:?}",
                other
            )))
        }
    };
    let tensor = builder.create_constant_layer(&weights, &ones)?;
    builder.provide_quantization_range(&tensor, value, value);
    Ok(tensor)
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::error::ErrorKind;
    use crate::graph::AttrValue;

    #[test]
    fn default_table_covers_every_supported_op() {
        let registry = OpConverterRegistry::with_defaults();
        for op in [
            "Const", "Identity", "Snapshot", "Add", "RealDiv", "Pow", "Relu", "LeakyRelu",
            "Relu6", "Neg", "Atanh", "Floor", "Rsqrt", "Square", "Transpose", "Reshape",
            "ExpandDims", "Squeeze", "Slice", "StridedSlice", "Split", "Unpack", "Pack",
            "ConcatV2", "Pad", "GatherV2", "Conv2D", "DepthwiseConv2dNative",
            "Conv2DBackpropInput", "AvgPool", "MaxPool", "BiasAdd", "FusedBatchNorm",
            "FusedBatchNormV2", "MatMul", "BatchMatMul", "Softmax", "Mean", "ArgMax",
            "TopKV2", "CombinedNonMaxSuppression", "FakeQuantWithMinMaxArgs",
        ] {
            assert!(registry.contains(op), "{} is not registered", op);
        }
        assert!(registry.get("While").is_none());
        let ops = registry.available_ops();
        assert!(ops.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn registered_converters_can_be_replaced() {
        fn reject(_: &mut OpConverterParams<'_>) -> Result<(), GraphError> {
            Err(GraphError::unimplemented("nope"))
        }
        let mut registry = OpConverterRegistry::empty();
        registry.register("Relu", reject);
        assert_eq!(registry.available_ops(), vec!["Relu"]);
    }

    #[test]
    fn kind_mismatch_names_the_operand() {
        let node = typed("t", "Transpose");
        let err = lower(&node, &[tensor("x", &[1, 2, 3]), tensor("perm", &[1, 3])]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unimplemented);
        assert!(err.to_string().contains("\"perm\" for Transpose must be a constant"));

        let err = lower(&node, &[tensor("x", &[1, 2, 3])]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(err.to_string().contains("got 1 inputs but expected 2"));
    }

    #[test]
    fn data_type_checks_report_allowed_types() {
        let node = NodeDef::new("r", "Relu").with_attr("T", AttrValue::Type(DataType::Int32));
        let err = lower(&node, &[tensor_of("x", DataType::Int32, &[1, 4])]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unimplemented);
        assert!(err.to_string().contains("must be one of [Float32, Float16]"));

        let err = lower(&NodeDef::new("r", "Relu"), &[tensor("x", &[1, 4])]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(err.to_string().contains("Attribute with name T not found."));
    }
}
