//! Typed read-only access to the attributes of a source node.

use std::collections::HashMap;

use crate::error::GraphError;
use crate::graph::{AttrValue, DataType, NodeDef, PartialShape, TensorData};

/// Conversion from a stored [`AttrValue`] into a concrete Rust type.
pub trait FromAttr: Sized {
    const EXPECTED: &'static str;
    fn from_attr(value: &AttrValue) -> Option<Self>;
}

impl FromAttr for i64 {
    const EXPECTED: &'static str = "int";
    fn from_attr(value: &AttrValue) -> Option<Self> {
        match value {
            AttrValue::I(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromAttr for i32 {
    const EXPECTED: &'static str = "int";
    fn from_attr(value: &AttrValue) -> Option<Self> {
        match value {
            AttrValue::I(v) => i32::try_from(*v).ok(),
            _ => None,
        }
    }
}

impl FromAttr for f32 {
    const EXPECTED: &'static str = "float";
    fn from_attr(value: &AttrValue) -> Option<Self> {
        match value {
            AttrValue::F(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromAttr for bool {
    const EXPECTED: &'static str = "bool";
    fn from_attr(value: &AttrValue) -> Option<Self> {
        match value {
            AttrValue::B(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromAttr for String {
    const EXPECTED: &'static str = "string";
    fn from_attr(value: &AttrValue) -> Option<Self> {
        match value {
            AttrValue::S(v) => Some(v.clone()),
            _ => None,
        }
    }
}

impl FromAttr for DataType {
    const EXPECTED: &'static str = "type";
    fn from_attr(value: &AttrValue) -> Option<Self> {
        match value {
            AttrValue::Type(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromAttr for Vec<i64> {
    const EXPECTED: &'static str = "list(int)";
    fn from_attr(value: &AttrValue) -> Option<Self> {
        match value {
            AttrValue::ListI(v) => Some(v.clone()),
            _ => None,
        }
    }
}

impl FromAttr for Vec<i32> {
    const EXPECTED: &'static str = "list(int)";
    fn from_attr(value: &AttrValue) -> Option<Self> {
        match value {
            AttrValue::ListI(v) => v.iter().map(|x| i32::try_from(*x).ok()).collect(),
            _ => None,
        }
    }
}

impl FromAttr for Vec<f32> {
    const EXPECTED: &'static str = "list(float)";
    fn from_attr(value: &AttrValue) -> Option<Self> {
        match value {
            AttrValue::ListF(v) => Some(v.clone()),
            _ => None,
        }
    }
}

impl FromAttr for PartialShape {
    const EXPECTED: &'static str = "shape";
    fn from_attr(value: &AttrValue) -> Option<Self> {
        match value {
            AttrValue::Shape(v) => Some(v.clone()),
            _ => None,
        }
    }
}

impl FromAttr for TensorData {
    const EXPECTED: &'static str = "tensor";
    fn from_attr(value: &AttrValue) -> Option<Self> {
        match value {
            AttrValue::Tensor(v) => Some(v.clone()),
            _ => None,
        }
    }
}

/// View over a node's attribute map. Built once per conversion call.
#[derive(Debug, Clone, Copy)]
pub struct NodeAttributes<'a> {
    node: &'a str,
    attrs: &'a HashMap<String, AttrValue>,
}

impl<'a> NodeAttributes<'a> {
    pub fn new(node: &'a NodeDef) -> Self {
        Self {
            node: &node.name,
            attrs: &node.attributes,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.attrs.contains_key(key)
    }

    pub fn raw(&self, key: &str) -> Option<&'a AttrValue> {
        self.attrs.get(key)
    }

    pub fn keys(&self) -> Vec<&'a str> {
        let mut keys: Vec<_> = self.attrs.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    /// Required attribute. A missing key or a value of another type is a bug in
    /// the graph producer, reported as `Internal`.
    pub fn get<T: FromAttr>(&self, key: &str) -> Result<T, GraphError> {
        let value = self.attrs.get(key).ok_or_else(|| {
            GraphError::internal(format!(
                "Attribute with name {} not found on node {}",
                key, self.node
            ))
        })?;
        self.decode(key, value)
    }

    /// Attribute with a fallback used only when the key is absent.
    pub fn get_or<T: FromAttr>(&self, key: &str, default: T) -> Result<T, GraphError> {
        match self.attrs.get(key) {
            Some(value) => self.decode(key, value),
            None => Ok(default),
        }
    }

    /// Attribute flattened to a float list, as handed to plugins. Values that
    /// have no numeric reading become an empty list.
    pub fn get_float_list(&self, key: &str) -> Vec<f32> {
        match self.attrs.get(key) {
            Some(AttrValue::ListF(v)) => v.clone(),
            Some(AttrValue::ListI(v)) => v.iter().map(|x| *x as f32).collect(),
            Some(AttrValue::F(v)) => vec![*v],
            Some(AttrValue::I(v)) => vec![*v as f32],
            _ => Vec::new(),
        }
    }

    fn decode<T: FromAttr>(&self, key: &str, value: &AttrValue) -> Result<T, GraphError> {
        T::from_attr(value).ok_or_else(|| {
            GraphError::internal(format!(
                "Attribute {} of node {} is not of type {}",
                key,
                self.node,
                T::EXPECTED
            ))
        })
    }
}
