//! Driver that lowers a whole segment graph into one engine network.
//!
//! The segment graph brackets its body with `EngineInputPH_<slot>` placeholders
//! and `EngineOutputPH_<slot>` identities. Placeholders become network inputs,
//! identities name and mark the network outputs, and every other node goes
//! through a [`Converter`] session.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::attributes::NodeAttributes;
use crate::converter::Converter;
use crate::converters::OpConverterRegistry;
use crate::error::GraphError;
use crate::graph::{
    DataType, GraphDef, InputRef, NodeDef, PartialShape, ENGINE_INPUT_PREFIX, ENGINE_OUTPUT_PREFIX,
};
use crate::network::Network;
use crate::plugin::PluginFactory;
use crate::validator::validate_tensor_properties;
use crate::weights::{ExportedWeights, WeightStore};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum PrecisionMode {
    #[default]
    Fp32,
    Fp16,
    Int8,
}

/// Knobs of one lowering run.
#[derive(Debug, Clone)]
pub struct ConversionParams {
    pub precision_mode: PrecisionMode,
    /// INT8 ranges come from calibration, so missing ones are not reported.
    pub use_calibration: bool,
    pub max_batch_size: i32,
    pub max_workspace_size_bytes: usize,
}

impl Default for ConversionParams {
    fn default() -> Self {
        Self {
            precision_mode: PrecisionMode::Fp32,
            use_calibration: false,
            max_batch_size: 1,
            max_workspace_size_bytes: 1 << 30,
        }
    }
}

/// Binds the value named `source_tensor_name` as engine output `dest_node_name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOutputInfo {
    pub source_tensor_name: String,
    pub dest_node_name: String,
    pub dtype: DataType,
}

/// Network plus the build settings the backend consumes with it.
#[derive(Debug)]
pub struct Engine {
    pub network: Network,
    pub weights: WeightStore,
    pub precision_mode: PrecisionMode,
    pub max_batch_size: i32,
    pub max_workspace_size_bytes: usize,
}

#[derive(Debug, Serialize)]
pub struct EngineExport<'a> {
    pub precision_mode: PrecisionMode,
    pub max_batch_size: i32,
    pub max_workspace_size_bytes: usize,
    pub network: &'a Network,
    pub weights: ExportedWeights,
}

impl Engine {
    pub fn export(&self) -> EngineExport<'_> {
        EngineExport {
            precision_mode: self.precision_mode,
            max_batch_size: self.max_batch_size,
            max_workspace_size_bytes: self.max_workspace_size_bytes,
            network: &self.network,
            weights: self.weights.export(),
        }
    }
}

fn parse_slot(name: &str, prefix: &str) -> Result<usize, GraphError> {
    name[prefix.len()..].parse::<usize>().map_err(|_| {
        GraphError::invalid_argument(format!("Failed to parse slot number from {}", name))
    })
}

fn input_shape(
    node: &NodeDef,
    slot: usize,
    input_shapes: &[PartialShape],
) -> Result<PartialShape, GraphError> {
    if let Some(shape) = input_shapes.get(slot) {
        return Ok(shape.clone());
    }
    let attrs = NodeAttributes::new(node);
    if attrs.contains("shape") {
        return attrs.get::<PartialShape>("shape");
    }
    Err(GraphError::invalid_argument(format!(
        "No shape is known for input slot {} ({})",
        slot, node.name
    )))
}

/// Lower `graph` into an engine network. `input_shapes[slot]` gives the full
/// shape (batch included) of engine input `slot`; a placeholder's own `shape`
/// attribute is the fallback.
pub fn convert_graph_def_to_engine(
    graph: &GraphDef,
    input_shapes: &[PartialShape],
    params: &ConversionParams,
    registry: Arc<OpConverterRegistry>,
    plugin_factory: Option<Arc<dyn PluginFactory>>,
) -> Result<Engine, GraphError> {
    tracing::info!(
        nodes = graph.nodes.len(),
        precision = ?params.precision_mode,
        max_batch_size = params.max_batch_size,
        "converting graph to engine"
    );
    let mut converter = Converter::new(registry, params);
    if let Some(factory) = plugin_factory {
        converter = converter.with_plugin_factory(factory);
    }

    let mut output_slots: Vec<Option<EngineOutputInfo>> = Vec::new();
    for node in &graph.nodes {
        let name = node.name.as_str();
        if name.starts_with(ENGINE_INPUT_PREFIX) && node.op == "Placeholder" {
            let slot = parse_slot(name, ENGINE_INPUT_PREFIX)?;
            let dtype: DataType = NodeAttributes::new(node)
                .get("dtype")
                .map_err(|err| err.in_node(name))?;
            let shape = input_shape(node, slot, input_shapes)?;
            let (dtype, dims, batch_size) =
                validate_tensor_properties(&node.op, dtype, &shape, false).map_err(|err| {
                    let err = err.prefixed(&format!(
                        "Validation failed for {} and input slot {}: ",
                        name, slot
                    ));
                    tracing::warn!(%err, "engine input rejected");
                    err
                })?;
            tracing::debug!(name, slot, ?dims, batch_size, "engine input");
            converter
                .add_input_tensor(name, dtype, &dims, batch_size)
                .map_err(|err| err.in_node(name))?;
        } else if name.starts_with(ENGINE_OUTPUT_PREFIX) && node.op == "Identity" {
            let slot = parse_slot(name, ENGINE_OUTPUT_PREFIX)?;
            let dtype: DataType = NodeAttributes::new(node)
                .get("T")
                .map_err(|err| err.in_node(name))?;
            if !matches!(
                dtype,
                DataType::Float32 | DataType::Float16 | DataType::Int32
            ) {
                return Err(GraphError::invalid_argument(format!(
                    "Unsupported data type {:?} for engine output {}",
                    dtype, name
                )));
            }
            let source = node
                .inputs
                .first()
                .map(|input| InputRef::parse(input).value_name())
                .ok_or_else(|| {
                    GraphError::invalid_argument(format!("Engine output {} has no input", name))
                })?;
            if output_slots.len() <= slot {
                output_slots.resize(slot + 1, None);
            }
            output_slots[slot] = Some(EngineOutputInfo {
                source_tensor_name: source,
                dest_node_name: name.to_string(),
                dtype,
            });
        } else {
            converter
                .convert_node(node)
                .map_err(|err| err.in_node(name))?;
        }
    }

    let outputs = output_slots
        .into_iter()
        .enumerate()
        .map(|(slot, output)| {
            output.ok_or_else(|| {
                GraphError::invalid_argument(format!("Engine output slot {} is not bound", slot))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    converter.rename_and_mark_outputs(&outputs)?;
    converter.maybe_apply_quantization_ranges()?;

    let batch_size = converter.batch_size();
    if batch_size > params.max_batch_size {
        tracing::warn!(
            batch_size,
            max_batch_size = params.max_batch_size,
            "input batch size exceeds the engine's max batch size"
        );
    }
    let lowered = converter.finish();
    tracing::info!(
        layers = lowered.network.layers().len(),
        inputs = lowered.network.inputs().len(),
        outputs = lowered.network.outputs().len(),
        weights = lowered.weights.len(),
        "engine network built"
    );
    Ok(Engine {
        network: lowered.network,
        weights: lowered.weights,
        precision_mode: params.precision_mode,
        max_batch_size: params.max_batch_size,
        max_workspace_size_bytes: params.max_workspace_size_bytes,
    })
}

#[cfg(test)]
mod tests {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;

    use super::*;
    use crate::error::ErrorKind;
    use crate::loader::{load_graph_from_str, parse_shape_spec};
    use crate::plugin::testing::EchoFactory;

    fn registry() -> Arc<OpConverterRegistry> {
        Arc::new(OpConverterRegistry::with_defaults())
    }

    fn run(json: &str, params: &ConversionParams) -> Result<Engine, GraphError> {
        let document = load_graph_from_str(json)?;
        convert_graph_def_to_engine(
            &document.graph,
            &document.input_shapes,
            params,
            registry(),
            None,
        )
    }

    fn encode(values: &[f32]) -> String {
        STANDARD.encode(bytemuck::cast_slice::<f32, u8>(values))
    }

    const RELU_GRAPH: &str = r#"{
        "graph": {"nodes": [
            {"name": "EngineInputPH_0", "op": "Placeholder",
             "attributes": {"dtype": {"type": "float32"}}},
            {"name": "relu", "op": "Relu", "inputs": ["EngineInputPH_0"],
             "attributes": {"T": {"type": "float32"}}},
            {"name": "EngineOutputPH_0", "op": "Identity", "inputs": ["relu:0"],
             "attributes": {"T": {"type": "float32"}}}
        ]},
        "input_shapes": [{"dims": [2, 3, 4]}]
    }"#;

    #[test]
    fn relu_graph_lowers_end_to_end() {
        let engine = run(RELU_GRAPH, &ConversionParams::default()).unwrap();
        let network = &engine.network;
        assert_eq!(network.layers().len(), 1);
        let input = network.tensor(network.inputs()[0]).unwrap();
        assert_eq!(input.name, "EngineInputPH_0");
        assert_eq!(input.dims, vec![3, 4]);
        let output = network.tensor(network.outputs()[0]).unwrap();
        assert_eq!(output.name, "EngineOutputPH_0");
        assert!(output.is_output);
        assert_eq!(output.dims, vec![3, 4]);
        assert_eq!(engine.max_batch_size, 1);

        let json = serde_json::to_value(engine.export()).unwrap();
        assert_eq!(json["precision_mode"], "fp32");
        assert_eq!(json["network"]["layers"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn constants_feed_binary_ops() {
        let json = format!(
            r#"{{
            "graph": {{"nodes": [
                {{"name": "EngineInputPH_0", "op": "Placeholder",
                  "attributes": {{"dtype": {{"type": "float32"}},
                                  "shape": {{"shape": {{"dims": [1, 2]}}}}}}}},
                {{"name": "bias", "op": "Const",
                  "attributes": {{"dtype": {{"type": "float32"}},
                                  "value": {{"tensor": {{"dtype": "float32", "shape": [2],
                                                        "data": "{}"}}}}}}}},
                {{"name": "add", "op": "Add", "inputs": ["EngineInputPH_0", "bias"],
                  "attributes": {{"T": {{"type": "float32"}}}}}},
                {{"name": "EngineOutputPH_0", "op": "Identity", "inputs": ["add"],
                  "attributes": {{"T": {{"type": "float32"}}}}}}
            ]}}
        }}"#,
            encode(&[1.0, 2.0])
        );
        let engine = run(&json, &ConversionParams::default()).unwrap();
        let types: Vec<_> = engine
            .network
            .layers()
            .iter()
            .map(|layer| layer.kind.type_name())
            .collect();
        assert_eq!(types, vec!["Constant", "ElementWise"]);
        assert_eq!(engine.weights.len(), 1);
        let output = engine.network.tensor(engine.network.outputs()[0]).unwrap();
        assert_eq!(output.dims, vec![2]);
    }

    #[test]
    fn failing_nodes_are_named() {
        let json = RELU_GRAPH.replace(r#""op": "Relu""#, r#""op": "Erf""#);
        let err = run(&json, &ConversionParams::default()).unwrap_err();
        assert_eq!(err.node(), Some("relu"));
        assert_eq!(err.kind(), ErrorKind::Unimplemented);
    }

    #[test]
    fn unknown_input_dims_fail_validation() {
        let json = RELU_GRAPH.replace("[2, 3, 4]", "[2, -1, 4]");
        let err = run(&json, &ConversionParams::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(err
            .to_string()
            .contains("Validation failed for EngineInputPH_0 and input slot 0"));
    }

    #[test]
    fn bad_slots_and_missing_outputs_are_rejected() {
        let json = RELU_GRAPH.replace("EngineInputPH_0", "EngineInputPH_x");
        let err = run(&json, &ConversionParams::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(err.to_string().contains("Failed to parse slot number"));

        let json = RELU_GRAPH.replace("EngineOutputPH_0", "EngineOutputPH_1");
        let err = run(&json, &ConversionParams::default()).unwrap_err();
        assert!(err.to_string().contains("Engine output slot 0 is not bound"));
    }

    #[test]
    fn input_shapes_from_the_command_line() {
        let document = load_graph_from_str(RELU_GRAPH).unwrap();
        let shapes = vec![parse_shape_spec("4x5").unwrap()];
        let engine = convert_graph_def_to_engine(
            &document.graph,
            &shapes,
            &ConversionParams::default(),
            registry(),
            None,
        )
        .unwrap();
        let input = engine.network.tensor(engine.network.inputs()[0]).unwrap();
        assert_eq!(input.dims, vec![5]);
    }

    #[test]
    fn int8_graph_applies_fake_quant_ranges() {
        let json = RELU_GRAPH.replace(
            r#"{"name": "relu", "op": "Relu", "inputs": ["EngineInputPH_0"],"#,
            r#"{"name": "fq", "op": "FakeQuantWithMinMaxArgs", "inputs": ["EngineInputPH_0"],
                "attributes": {"min": {"f": -4.0}, "max": {"f": 4.0}}},
               {"name": "relu", "op": "Relu", "inputs": ["fq"],"#,
        );
        let params = ConversionParams {
            precision_mode: PrecisionMode::Int8,
            ..ConversionParams::default()
        };
        let engine = run(&json, &params).unwrap();
        let input = engine.network.tensor(engine.network.inputs()[0]).unwrap();
        assert_eq!(input.dynamic_range, Some((-4.0, 4.0)));
    }

    #[test]
    fn plugin_ops_go_through_the_factory() {
        let json = RELU_GRAPH.replace(r#""op": "Relu""#, r#""op": "Echo""#);
        let document = load_graph_from_str(&json).unwrap();
        let engine = convert_graph_def_to_engine(
            &document.graph,
            &document.input_shapes,
            &ConversionParams::default(),
            registry(),
            Some(Arc::new(EchoFactory {
                op: "Echo",
                reject: None,
            })),
        )
        .unwrap();
        assert_eq!(engine.network.layers()[0].kind.type_name(), "Plugin");
    }
}
