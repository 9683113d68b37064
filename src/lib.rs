pub mod attributes;
pub mod builder;
pub mod converter;
pub mod converters;
pub mod debug;
pub mod engine;
pub mod error;
pub mod graph;
pub mod graphviz;
pub mod loader;
pub mod network;
pub mod plugin;
pub mod quantization;
pub mod reorder;
pub mod shape_inference;
pub mod validator;
pub mod values;
pub mod weights;

pub use attributes::NodeAttributes;
pub use converter::{Converter, LoweredNetwork};
pub use converters::{OpConverter, OpConverterParams, OpConverterRegistry};
pub use engine::{
    convert_graph_def_to_engine, ConversionParams, Engine, EngineOutputInfo, PrecisionMode,
};
pub use error::{ErrorKind, GraphError};
pub use graph::{
    AttrValue, DataType, GraphDef, GraphDocument, GraphProperties, InputRef, NodeDef,
    PartialShape, TensorData, TensorProperties, ENGINE_INPUT_PREFIX, ENGINE_OUTPUT_PREFIX,
};
pub use graphviz::network_to_dot;
pub use loader::{load_graph_from_path, load_graph_from_str, parse_shape_spec};
pub use network::Network;
pub use plugin::{Plugin, PluginFactory};
pub use validator::{validate_tensor_properties, NodeValidator};
pub use values::{TensorHandle, TensorOrWeights};
pub use weights::{ShapedWeights, WeightStore};
