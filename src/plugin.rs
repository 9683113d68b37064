//! Custom operations supplied from outside the crate.

use crate::error::GraphError;
use crate::graph::DataType;

/// Type and dims (batch excluded) of one plugin input or output.
pub type TensorDescriptor = (DataType, Vec<i32>);

/// An instantiated custom operation.
pub trait Plugin: Send {
    /// Receive one node attribute flattened to floats. `false` rejects it.
    fn set_attribute(&mut self, key: &str, values: &[f32]) -> bool;

    fn output_descriptors(
        &self,
        inputs: &[TensorDescriptor],
    ) -> Result<Vec<TensorDescriptor>, GraphError>;
}

/// Decides which op types are custom and builds a plugin for each use.
pub trait PluginFactory: Send + Sync {
    fn is_plugin(&self, op: &str) -> bool;

    fn create_plugin(&self, op: &str) -> Option<Box<dyn Plugin>>;
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;

    use super::*;

    /// Elementwise plugin that echoes its first input and records attributes.
    #[derive(Debug, Default)]
    pub struct EchoPlugin {
        pub attributes: HashMap<String, Vec<f32>>,
        pub reject: Option<String>,
    }

    impl Plugin for EchoPlugin {
        fn set_attribute(&mut self, key: &str, values: &[f32]) -> bool {
            if self.reject.as_deref() == Some(key) {
                return false;
            }
            self.attributes.insert(key.to_string(), values.to_vec());
            true
        }

        fn output_descriptors(
            &self,
            inputs: &[TensorDescriptor],
        ) -> Result<Vec<TensorDescriptor>, GraphError> {
            inputs
                .first()
                .cloned()
                .map(|first| vec![first])
                .ok_or_else(|| GraphError::invalid_argument("Echo plugin needs an input"))
        }
    }

    /// Treats `op` as a plugin; attribute `reject` makes `set_attribute` fail.
    pub struct EchoFactory {
        pub op: &'static str,
        pub reject: Option<String>,
    }

    impl PluginFactory for EchoFactory {
        fn is_plugin(&self, op: &str) -> bool {
            op == self.op
        }

        fn create_plugin(&self, op: &str) -> Option<Box<dyn Plugin>> {
            self.is_plugin(op).then(|| {
                Box::new(EchoPlugin {
                    attributes: HashMap::new(),
                    reject: self.reject.clone(),
                }) as Box<dyn Plugin>
            })
        }
    }
}
