//! One build session: the value table, the network under construction and
//! the weights its layers point into.

use std::collections::HashMap;
use std::sync::Arc;

use crate::attributes::NodeAttributes;
use crate::builder::NetworkBuilder;
use crate::converters::{convert_plugin, OpConverterParams, OpConverterRegistry};
use crate::engine::{ConversionParams, EngineOutputInfo};
use crate::error::GraphError;
use crate::graph::{DataType, InputRef, NodeDef, ENGINE_INPUT_PREFIX, ENGINE_OUTPUT_PREFIX};
use crate::network::{Network, ShuffleSpec};
use crate::plugin::PluginFactory;
use crate::values::TensorOrWeights;
use crate::weights::WeightStore;

/// What a finished session hands over. The network refers to buffers in
/// `weights` by handle, so the two travel together.
#[derive(Debug)]
pub struct LoweredNetwork {
    pub network: Network,
    pub weights: WeightStore,
}

pub struct Converter {
    registry: Arc<OpConverterRegistry>,
    plugin_factory: Option<Arc<dyn PluginFactory>>,
    builder: NetworkBuilder,
    weight_store: WeightStore,
    values: HashMap<String, TensorOrWeights>,
    batch_size: i32,
}

impl Converter {
    pub fn new(registry: Arc<OpConverterRegistry>, params: &ConversionParams) -> Self {
        Self {
            registry,
            plugin_factory: None,
            builder: NetworkBuilder::new(params.precision_mode, params.use_calibration),
            weight_store: WeightStore::new(),
            values: HashMap::new(),
            batch_size: -1,
        }
    }

    pub fn with_plugin_factory(mut self, factory: Arc<dyn PluginFactory>) -> Self {
        self.plugin_factory = Some(factory);
        self
    }

    /// Batch size every tensor of the session shares, `-1` until an input
    /// fixes it.
    pub fn batch_size(&self) -> i32 {
        self.batch_size
    }

    pub fn network(&self) -> &Network {
        self.builder.network()
    }

    pub fn weight_store(&self) -> &WeightStore {
        &self.weight_store
    }

    fn maybe_update_batch_size(&mut self, batch_size: i32) -> Result<(), GraphError> {
        if self.batch_size >= 0 && batch_size >= 0 && self.batch_size != batch_size {
            return Err(GraphError::invalid_argument(format!(
                "Provided batch size does not match converter batch size: {} vs {}",
                batch_size, self.batch_size
            )));
        }
        if self.batch_size < 0 && batch_size >= 0 {
            self.batch_size = batch_size;
        }
        Ok(())
    }

    /// Bind a network input. `dims` exclude the batch dim.
    pub fn add_input_tensor(
        &mut self,
        name: &str,
        dtype: DataType,
        dims: &[i32],
        batch_size: i32,
    ) -> Result<(), GraphError> {
        self.maybe_update_batch_size(batch_size)
            .map_err(|err| err.prefixed(&format!("Batch size doesn't match for tensor {}: ", name)))?;
        let tensor = self.builder.add_input(name, dtype, dims)?;
        tracing::debug!(name, ?dtype, ?dims, batch_size, "added input tensor");
        self.add_tensor_or_weights(name, TensorOrWeights::from(tensor))
            .map_err(|err| err.prefixed("Failed to add input tensor: "))
    }

    fn add_tensor_or_weights(
        &mut self,
        name: &str,
        mut value: TensorOrWeights,
    ) -> Result<(), GraphError> {
        if value.is_tensor() {
            value.set_batch_size(self.batch_size);
        }
        if self.values.contains_key(name) {
            return Err(GraphError::AlreadyExists {
                name: name.to_string(),
            });
        }
        self.values.insert(name.to_string(), value);
        Ok(())
    }

    pub fn get_tensor_or_weights(&self, name: &str) -> Result<&TensorOrWeights, GraphError> {
        self.values.get(name).ok_or_else(|| {
            GraphError::not_found(format!(
                "Tensor or weights with name {} could not be found.",
                name
            ))
        })
    }

    fn get_inputs(&self, node: &NodeDef) -> Result<Vec<TensorOrWeights>, GraphError> {
        let mut inputs = Vec::with_capacity(node.inputs.len());
        for input in &node.inputs {
            let reference = InputRef::parse(input);
            if let InputRef::Control(_) = reference {
                continue;
            }
            let name = reference.value_name();
            let value = self.values.get(&name).ok_or_else(|| {
                GraphError::invalid_argument(format!(
                    "Node {} should have an input named '{}' but it is not available",
                    node.name, name
                ))
            })?;
            inputs.push(value.clone());
        }
        Ok(inputs)
    }

    /// Lower one node and publish its outputs as `name`, `name:1`, ...
    pub fn convert_node(&mut self, node: &NodeDef) -> Result<(), GraphError> {
        let inputs = self.get_inputs(node)?;
        let precision_mode = self.builder.precision_mode();
        let use_calibration = self.builder.use_calibration();
        let mut outputs = Vec::new();
        let mut params = OpConverterParams {
            node,
            attrs: NodeAttributes::new(node),
            inputs,
            outputs: &mut outputs,
            validation_only: false,
            weight_store: &mut self.weight_store,
            precision_mode,
            use_calibration,
            builder: Some(&mut self.builder),
        };
        match &self.plugin_factory {
            Some(factory) if factory.is_plugin(&node.op) => {
                convert_plugin(&mut params, factory.as_ref())?
            }
            _ => {
                let converter = self.registry.get(&node.op).ok_or_else(|| {
                    GraphError::unimplemented(format!("No converter registered for op: {}", node.op))
                })?;
                converter(&mut params)?
            }
        }
        tracing::trace!(node = %node.name, op = %node.op, outputs = outputs.len(), "converted node");

        for (i, output) in outputs.into_iter().enumerate() {
            let name = match i {
                0 => node.name.clone(),
                i => format!("{}:{}", node.name, i),
            };
            // Engine inputs keep their binding name.
            if let TensorOrWeights::Tensor { tensor, .. } = &output {
                let current = &self.builder.network().tensor(tensor.id)?.name;
                if !current.starts_with(ENGINE_INPUT_PREFIX) {
                    self.builder.network_mut().set_tensor_name(tensor.id, &name)?;
                }
            }
            self.add_tensor_or_weights(&name, output).map_err(|err| {
                err.prefixed(&format!("Failed to add output for node {}: ", node.name))
            })?;
        }
        Ok(())
    }

    /// Name, mark and retype the engine outputs. A tensor already bound as an
    /// engine input or output is copied through an identity shuffle first so
    /// no tensor carries two binding names.
    pub fn rename_and_mark_outputs(&mut self, outputs: &[EngineOutputInfo]) -> Result<(), GraphError> {
        for output in outputs {
            let value = self.get_tensor_or_weights(&output.source_tensor_name)?;
            if value.is_weights() {
                return Err(GraphError::invalid_argument(format!(
                    "Output {} is weights not tensor",
                    output.source_tensor_name
                )));
            }
            let mut tensor = value.tensor()?.clone();
            let current = &self.builder.network().tensor(tensor.id)?.name;
            if current.starts_with(ENGINE_INPUT_PREFIX) || current.starts_with(ENGINE_OUTPUT_PREFIX) {
                let identity = ShuffleSpec {
                    first_transpose: None,
                    reshape: None,
                    second_transpose: None,
                };
                let copy = self.builder.layer(|net| net.add_shuffle(tensor.id, identity))?;
                self.builder.mark_quantization_ranges_as_inferrable(&tensor, &copy);
                tensor = copy;
            }
            let network = self.builder.network_mut();
            network.set_tensor_name(tensor.id, &output.dest_node_name)?;
            network.mark_output(tensor.id)?;
            network.set_tensor_type(tensor.id, output.dtype)?;
            tracing::debug!(
                source = %output.source_tensor_name,
                name = %output.dest_node_name,
                dtype = ?output.dtype,
                "marked engine output"
            );
        }
        Ok(())
    }

    pub fn maybe_apply_quantization_ranges(&mut self) -> Result<(), GraphError> {
        self.builder.maybe_apply_quantization_ranges()
    }

    pub fn finish(self) -> LoweredNetwork {
        LoweredNetwork {
            network: self.builder.into_network(),
            weights: self.weight_store,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::PrecisionMode;
    use crate::error::ErrorKind;
    use crate::graph::{AttrValue, TensorData};

    fn converter() -> Converter {
        Converter::new(
            Arc::new(OpConverterRegistry::with_defaults()),
            &ConversionParams::default(),
        )
    }

    fn relu(name: &str, input: &str) -> NodeDef {
        NodeDef::new(name, "Relu")
            .with_input(input)
            .with_attr("T", AttrValue::Type(DataType::Float32))
    }

    fn constant(name: &str, values: &[f32]) -> NodeDef {
        NodeDef::new(name, "Const")
            .with_attr("dtype", AttrValue::Type(DataType::Float32))
            .with_attr(
                "value",
                AttrValue::Tensor(TensorData::from_f32(vec![values.len() as i64], values)),
            )
    }

    #[test]
    fn batch_size_is_fixed_by_the_first_known_input() {
        let mut c = converter();
        c.add_input_tensor("a", DataType::Float32, &[3], -1).unwrap();
        assert_eq!(c.batch_size(), -1);
        c.add_input_tensor("b", DataType::Float32, &[3], 4).unwrap();
        c.add_input_tensor("c", DataType::Float32, &[3], -1).unwrap();
        assert_eq!(c.batch_size(), 4);
        assert_eq!(c.get_tensor_or_weights("c").unwrap().batch_size(), 4);

        let err = c.add_input_tensor("d", DataType::Float32, &[3], 2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(err
            .to_string()
            .contains("Batch size doesn't match for tensor d"));
    }

    #[test]
    fn duplicate_inputs_are_rejected() {
        let mut c = converter();
        c.add_input_tensor("a", DataType::Float32, &[3], 1).unwrap();
        let err = c.add_input_tensor("a", DataType::Float32, &[3], 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn control_inputs_and_port_zero_are_resolved() {
        let mut c = converter();
        c.add_input_tensor("x", DataType::Float32, &[2, 2], 1).unwrap();
        c.convert_node(&constant("dep", &[1.0])).unwrap();
        let node = relu("r", "x:0").with_input("^dep");
        c.convert_node(&node).unwrap();
        let out = c.get_tensor_or_weights("r").unwrap().tensor().unwrap().clone();
        assert_eq!(c.network().tensor(out.id).unwrap().name, "r");
        assert_eq!(c.get_tensor_or_weights("r").unwrap().batch_size(), 1);
    }

    #[test]
    fn missing_inputs_and_unknown_ops_fail() {
        let mut c = converter();
        let err = c.convert_node(&relu("r", "nowhere")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(err.to_string().contains("should have an input named 'nowhere'"));

        c.add_input_tensor("x", DataType::Float32, &[2], 1).unwrap();
        let err = c
            .convert_node(&NodeDef::new("w", "Where").with_input("x"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unimplemented);

        let err = c.get_tensor_or_weights("w").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn duplicate_node_outputs_are_rejected() {
        let mut c = converter();
        c.add_input_tensor("x", DataType::Float32, &[2], 1).unwrap();
        c.convert_node(&relu("r", "x")).unwrap();
        let err = c.convert_node(&relu("r", "x")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[test]
    fn engine_inputs_keep_their_name_through_identity() {
        let mut c = converter();
        let input = format!("{}0", ENGINE_INPUT_PREFIX);
        c.add_input_tensor(&input, DataType::Float32, &[2], 1).unwrap();
        c.convert_node(&NodeDef::new("id", "Identity").with_input(input.as_str()))
            .unwrap();
        let id = c.get_tensor_or_weights("id").unwrap().tensor().unwrap().id;
        assert_eq!(c.network().tensor(id).unwrap().name, input);
    }

    #[test]
    fn outputs_bound_twice_are_duplicated() {
        let mut c = converter();
        let input = format!("{}0", ENGINE_INPUT_PREFIX);
        c.add_input_tensor(&input, DataType::Float32, &[2], 1).unwrap();
        c.convert_node(&relu("r", &input)).unwrap();
        let outputs = [
            EngineOutputInfo {
                source_tensor_name: "r".into(),
                dest_node_name: format!("{}0", ENGINE_OUTPUT_PREFIX),
                dtype: DataType::Float32,
            },
            EngineOutputInfo {
                source_tensor_name: "r".into(),
                dest_node_name: format!("{}1", ENGINE_OUTPUT_PREFIX),
                dtype: DataType::Float16,
            },
            EngineOutputInfo {
                source_tensor_name: input.clone(),
                dest_node_name: format!("{}2", ENGINE_OUTPUT_PREFIX),
                dtype: DataType::Float32,
            },
        ];
        c.rename_and_mark_outputs(&outputs).unwrap();
        let network = c.finish().network;
        let names: Vec<_> = network
            .outputs()
            .iter()
            .map(|id| network.tensor(*id).unwrap().name.clone())
            .collect();
        assert_eq!(
            names,
            vec!["EngineOutputPH_0", "EngineOutputPH_1", "EngineOutputPH_2"]
        );
        let second = network.tensor(network.outputs()[1]).unwrap();
        assert_eq!(second.dtype, DataType::Float16);
        let types: Vec<_> = network.layers().iter().map(|l| l.kind.type_name()).collect();
        assert_eq!(types, vec!["Activation", "Shuffle", "Shuffle"]);
        assert_eq!(network.tensor(network.inputs()[0]).unwrap().name, input);
    }

    #[test]
    fn weights_cannot_be_outputs() {
        let mut c = converter();
        c.convert_node(&constant("w", &[1.0, 2.0])).unwrap();
        let err = c
            .rename_and_mark_outputs(&[EngineOutputInfo {
                source_tensor_name: "w".into(),
                dest_node_name: "out".into(),
                dtype: DataType::Float32,
            }])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = c
            .rename_and_mark_outputs(&[EngineOutputInfo {
                source_tensor_name: "missing".into(),
                dest_node_name: "out".into(),
                dtype: DataType::Float32,
            }])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn int8_ranges_are_applied_on_request() {
        let params = ConversionParams {
            precision_mode: PrecisionMode::Int8,
            ..ConversionParams::default()
        };
        let mut c = Converter::new(Arc::new(OpConverterRegistry::with_defaults()), &params);
        c.add_input_tensor("x", DataType::Float32, &[4], 1).unwrap();
        c.convert_node(
            &NodeDef::new("q", "FakeQuantWithMinMaxArgs")
                .with_input("x")
                .with_attr("min", AttrValue::F(-2.0))
                .with_attr("max", AttrValue::F(1.0)),
        )
        .unwrap();
        c.convert_node(&relu("r", "q")).unwrap();
        c.maybe_apply_quantization_ranges().unwrap();
        let network = c.finish().network;
        let x = network.inputs()[0];
        assert_eq!(network.tensor(x).unwrap().dynamic_range, Some((-2.0, 2.0)));
    }
}
