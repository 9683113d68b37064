use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};

/// Node-name prefix of the placeholders that become engine inputs. The suffix is
/// the input slot.
pub const ENGINE_INPUT_PREFIX: &str = "EngineInputPH_";
/// Node-name prefix of the identity nodes that become engine outputs.
pub const ENGINE_OUTPUT_PREFIX: &str = "EngineOutputPH_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Float32,
    Float16,
    Int32,
    Int8,
    Uint8,
    Int16,
    Uint16,
    Int64,
    Bool,
}

impl DataType {
    pub fn bytes_per_element(self) -> usize {
        match self {
            DataType::Float32 => 4,
            DataType::Float16 => 2,
            DataType::Int32 => 4,
            DataType::Int8 => 1,
            DataType::Uint8 => 1,
            DataType::Int16 => 2,
            DataType::Uint16 => 2,
            DataType::Int64 => 8,
            DataType::Bool => 1,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, DataType::Float32 | DataType::Float16)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialShape {
    #[serde(default)]
    pub unknown_rank: bool,
    #[serde(default)]
    pub dims: Vec<i64>,
}

impl PartialShape {
    pub fn new(dims: Vec<i64>) -> Self {
        Self {
            unknown_rank: false,
            dims,
        }
    }

    pub fn unknown() -> Self {
        Self {
            unknown_rank: true,
            dims: Vec::new(),
        }
    }

    /// Rank, or `None` when unknown.
    pub fn rank(&self) -> Option<usize> {
        (!self.unknown_rank).then_some(self.dims.len())
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorData {
    pub dtype: DataType,
    #[serde(default)]
    pub shape: Vec<i64>,
    #[serde_as(as = "Base64")]
    #[serde(default)]
    pub data: Vec<u8>,
}

impl TensorData {
    pub fn element_count(&self) -> usize {
        self.shape.iter().map(|d| (*d).max(0) as usize).product()
    }

    pub fn from_f32(shape: Vec<i64>, values: &[f32]) -> Self {
        Self {
            dtype: DataType::Float32,
            shape,
            data: bytemuck::cast_slice(values).to_vec(),
        }
    }

    pub fn from_i32(shape: Vec<i64>, values: &[i32]) -> Self {
        Self {
            dtype: DataType::Int32,
            shape,
            data: bytemuck::cast_slice(values).to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttrValue {
    I(i64),
    F(f32),
    B(bool),
    S(String),
    Type(DataType),
    ListI(Vec<i64>),
    ListF(Vec<f32>),
    Shape(PartialShape),
    Tensor(TensorData),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeDef {
    pub name: String,
    pub op: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub attributes: HashMap<String, AttrValue>,
}

impl NodeDef {
    pub fn new(name: impl Into<String>, op: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op: op.into(),
            ..Self::default()
        }
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.inputs.push(input.into());
        self
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: AttrValue) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }
}

/// A parsed input reference of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputRef<'a> {
    /// `^name`, ordering only.
    Control(&'a str),
    /// `name` or `name:i`.
    Data { node: &'a str, port: usize },
}

impl<'a> InputRef<'a> {
    pub fn parse(input: &'a str) -> Self {
        if let Some(node) = input.strip_prefix('^') {
            return InputRef::Control(node);
        }
        if let Some((node, port)) = input.rsplit_once(':') {
            if let Ok(port) = port.parse::<usize>() {
                return InputRef::Data { node, port };
            }
        }
        InputRef::Data {
            node: input,
            port: 0,
        }
    }

    /// Name the value table stores this output under.
    pub fn value_name(&self) -> String {
        match self {
            InputRef::Control(node) => format!("^{}", node),
            InputRef::Data { node, port: 0 } => (*node).to_string(),
            InputRef::Data { node, port } => format!("{}:{}", node, port),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphDef {
    #[serde(default)]
    pub nodes: Vec<NodeDef>,
}

impl GraphDef {
    pub fn node(&self, name: &str) -> Option<&NodeDef> {
        self.nodes.iter().find(|node| node.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorProperties {
    pub dtype: DataType,
    #[serde(default)]
    pub shape: PartialShape,
}

/// Statically inferred output properties, keyed by node name then output port.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GraphProperties {
    outputs: HashMap<String, Vec<TensorProperties>>,
}

impl GraphProperties {
    pub fn insert(&mut self, node: impl Into<String>, outputs: Vec<TensorProperties>) {
        self.outputs.insert(node.into(), outputs);
    }

    pub fn has_output_properties(&self, node: &str) -> bool {
        self.outputs.contains_key(node)
    }

    pub fn output_properties(&self, node: &str) -> Option<&[TensorProperties]> {
        self.outputs.get(node).map(Vec::as_slice)
    }
}

/// On-disk document accepted by the loader.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphDocument {
    pub graph: GraphDef,
    #[serde(default)]
    pub properties: GraphProperties,
    #[serde(default)]
    pub input_shapes: Vec<PartialShape>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_input_references() {
        assert_eq!(InputRef::parse("^dep"), InputRef::Control("dep"));
        assert_eq!(
            InputRef::parse("conv"),
            InputRef::Data {
                node: "conv",
                port: 0
            }
        );
        assert_eq!(InputRef::parse("conv:0").value_name(), "conv");
        assert_eq!(InputRef::parse("topk:1").value_name(), "topk:1");
        assert_eq!(
            InputRef::parse("scope/name:x"),
            InputRef::Data {
                node: "scope/name:x",
                port: 0
            }
        );
    }

    #[test]
    fn attr_values_use_short_tags() {
        let node: NodeDef = serde_json::from_str(
            r#"{"name": "c", "op": "Conv2D", "inputs": ["x", "w"],
                "attributes": {"strides": {"list_i": [1, 2, 2, 1]},
                               "padding": {"s": "SAME"},
                               "T": {"type": "float32"}}}"#,
        )
        .unwrap();
        assert_eq!(
            node.attributes["strides"],
            AttrValue::ListI(vec![1, 2, 2, 1])
        );
        assert_eq!(node.attributes["T"], AttrValue::Type(DataType::Float32));
    }

    #[test]
    fn tensor_data_round_trips_base64() {
        let tensor = TensorData::from_f32(vec![2], &[1.0, -2.0]);
        let json = serde_json::to_string(&tensor).unwrap();
        let back: TensorData = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tensor);
        assert_eq!(back.element_count(), 2);
    }
}
