//! In-memory layer graph handed to the inference backend.
//!
//! Tensors and layers live in two arenas indexed by [`TensorId`] and
//! [`LayerId`]. Every `add_*` call computes the output dims of the new layer and
//! refuses malformed requests with `GraphError::Internal`, the way a backend
//! would hand back a null layer.

use serde::Serialize;

use crate::error::GraphError;
use crate::graph::DataType;
use crate::shape_inference::{
    infer_concat_shape, infer_conv_shape, infer_deconv_shape, infer_elementwise_shape,
    infer_fully_connected_shape, infer_gather_shape, infer_matrix_multiply_shape,
    infer_padding_shape, infer_pool_shape, infer_reduce_shape, infer_shuffle_shape,
    infer_slice_shape, infer_topk_shape,
};
use crate::weights::{weight_dims_count, BackendWeights, ShapedWeights, MAX_DIMS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TensorId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct LayerId(pub usize);

#[derive(Debug, Clone, Serialize)]
pub struct TensorInfo {
    pub name: String,
    pub dtype: DataType,
    /// Dims without the implicit batch dim.
    pub dims: Vec<i32>,
    pub is_input: bool,
    pub is_output: bool,
    pub dynamic_range: Option<(f32, f32)>,
    pub producer: Option<LayerId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementWiseOp {
    Sum,
    Prod,
    Max,
    Min,
    Sub,
    Div,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationKind {
    Relu,
    Sigmoid,
    Tanh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOp {
    Exp,
    Log,
    Sqrt,
    Recip,
    Abs,
    Neg,
    Sin,
    Cos,
    Tan,
    Sinh,
    Cosh,
    Asin,
    Acos,
    Atan,
    Asinh,
    Acosh,
    Atanh,
    Ceil,
    Floor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolingKind {
    Max,
    Average,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleMode {
    Uniform,
    Channel,
    Elementwise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReduceOp {
    Sum,
    Prod,
    Max,
    Min,
    Avg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TopKOp {
    Max,
    Min,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatrixOp {
    None,
    Transpose,
    Vector,
}

/// Height/width pair.
pub type Hw = [i32; 2];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShuffleSpec {
    pub first_transpose: Option<Vec<usize>>,
    /// `0` copies the input dim at that position, `-1` is inferred.
    pub reshape: Option<Vec<i32>>,
    pub second_transpose: Option<Vec<usize>>,
}

impl ShuffleSpec {
    pub fn reshape(dims: Vec<i32>) -> Self {
        Self {
            first_transpose: None,
            reshape: Some(dims),
            second_transpose: None,
        }
    }

    pub fn transpose(order: Vec<usize>) -> Self {
        Self {
            first_transpose: Some(order),
            reshape: None,
            second_transpose: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConvolutionSpec {
    pub num_outputs: i32,
    pub kernel: Hw,
    pub stride: Hw,
    /// Symmetric padding; asymmetric padding goes through a padding layer.
    pub padding: Hw,
    pub dilation: Hw,
    pub groups: i32,
    pub kernel_weights: BackendWeights,
    pub bias_weights: BackendWeights,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginField {
    pub name: String,
    pub values: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerKind {
    Constant {
        weights: BackendWeights,
        dims: Vec<i32>,
    },
    Shuffle(ShuffleSpec),
    ElementWise {
        op: ElementWiseOp,
    },
    Activation {
        kind: ActivationKind,
    },
    Unary {
        op: UnaryOp,
    },
    Convolution(ConvolutionSpec),
    Deconvolution(ConvolutionSpec),
    Padding {
        pre: Hw,
        post: Hw,
    },
    Pooling {
        kind: PoolingKind,
        window: Hw,
        stride: Hw,
        padding: Hw,
    },
    Scale {
        mode: ScaleMode,
        shift: BackendWeights,
        scale: BackendWeights,
        power: BackendWeights,
    },
    Concatenation {
        axis: usize,
    },
    Slice {
        start: Vec<i32>,
        size: Vec<i32>,
        stride: Vec<i32>,
    },
    Reduce {
        op: ReduceOp,
        axes: u32,
        keep_dims: bool,
    },
    SoftMax {
        axes: u32,
    },
    TopK {
        op: TopKOp,
        k: i32,
        axes: u32,
    },
    Gather {
        axis: usize,
    },
    FullyConnected {
        num_outputs: i32,
        kernel_weights: BackendWeights,
        bias_weights: BackendWeights,
    },
    MatrixMultiply {
        op0: MatrixOp,
        op1: MatrixOp,
    },
    Plugin {
        plugin: String,
        fields: Vec<PluginField>,
    },
}

impl LayerKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            LayerKind::Constant { .. } => "Constant",
            LayerKind::Shuffle(_) => "Shuffle",
            LayerKind::ElementWise { .. } => "ElementWise",
            LayerKind::Activation { .. } => "Activation",
            LayerKind::Unary { .. } => "Unary",
            LayerKind::Convolution(_) => "Convolution",
            LayerKind::Deconvolution(_) => "Deconvolution",
            LayerKind::Padding { .. } => "Padding",
            LayerKind::Pooling { .. } => "Pooling",
            LayerKind::Scale { .. } => "Scale",
            LayerKind::Concatenation { .. } => "Concatenation",
            LayerKind::Slice { .. } => "Slice",
            LayerKind::Reduce { .. } => "Reduce",
            LayerKind::SoftMax { .. } => "SoftMax",
            LayerKind::TopK { .. } => "TopK",
            LayerKind::Gather { .. } => "Gather",
            LayerKind::FullyConnected { .. } => "FullyConnected",
            LayerKind::MatrixMultiply { .. } => "MatrixMultiply",
            LayerKind::Plugin { .. } => "Plugin",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Layer {
    pub name: String,
    pub kind: LayerKind,
    pub inputs: Vec<TensorId>,
    pub outputs: Vec<TensorId>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Network {
    tensors: Vec<TensorInfo>,
    layers: Vec<Layer>,
    inputs: Vec<TensorId>,
    outputs: Vec<TensorId>,
}

impl Network {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tensors(&self) -> &[TensorInfo] {
        &self.tensors
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn inputs(&self) -> &[TensorId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TensorId] {
        &self.outputs
    }

    pub fn tensor(&self, id: TensorId) -> Result<&TensorInfo, GraphError> {
        self.tensors
            .get(id.0)
            .ok_or_else(|| GraphError::internal(format!("Unknown tensor id {}", id.0)))
    }

    fn tensor_mut(&mut self, id: TensorId) -> Result<&mut TensorInfo, GraphError> {
        self.tensors
            .get_mut(id.0)
            .ok_or_else(|| GraphError::internal(format!("Unknown tensor id {}", id.0)))
    }

    pub fn dims(&self, id: TensorId) -> Result<Vec<i32>, GraphError> {
        Ok(self.tensor(id)?.dims.clone())
    }

    pub fn dtype(&self, id: TensorId) -> Result<DataType, GraphError> {
        Ok(self.tensor(id)?.dtype)
    }

    pub fn find_tensor(&self, name: &str) -> Option<TensorId> {
        self.tensors
            .iter()
            .position(|t| t.name == name)
            .map(TensorId)
    }

    pub fn add_input(
        &mut self,
        name: &str,
        dtype: DataType,
        dims: &[i32],
    ) -> Result<TensorId, GraphError> {
        if dims.len() > MAX_DIMS {
            return Err(GraphError::internal(format!(
                "Input {} has rank {} above the limit of {}",
                name,
                dims.len(),
                MAX_DIMS
            )));
        }
        if self.inputs.iter().any(|id| self.tensors[id.0].name == name) {
            return Err(GraphError::internal(format!(
                "Network input {} is already bound",
                name
            )));
        }
        let id = self.push_tensor(name.to_string(), dtype, dims.to_vec(), None);
        self.tensors[id.0].is_input = true;
        self.inputs.push(id);
        Ok(id)
    }

    pub fn mark_output(&mut self, id: TensorId) -> Result<(), GraphError> {
        self.tensor_mut(id)?.is_output = true;
        if !self.outputs.contains(&id) {
            self.outputs.push(id);
        }
        Ok(())
    }

    pub fn set_tensor_name(&mut self, id: TensorId, name: &str) -> Result<(), GraphError> {
        self.tensor_mut(id)?.name = name.to_string();
        Ok(())
    }

    pub fn set_tensor_type(&mut self, id: TensorId, dtype: DataType) -> Result<(), GraphError> {
        self.tensor_mut(id)?.dtype = dtype;
        Ok(())
    }

    pub fn set_dynamic_range(&mut self, id: TensorId, min: f32, max: f32) -> Result<(), GraphError> {
        self.tensor_mut(id)?.dynamic_range = Some((min, max));
        Ok(())
    }

    fn push_tensor(
        &mut self,
        name: String,
        dtype: DataType,
        dims: Vec<i32>,
        producer: Option<LayerId>,
    ) -> TensorId {
        let id = TensorId(self.tensors.len());
        self.tensors.push(TensorInfo {
            name,
            dtype,
            dims,
            is_input: false,
            is_output: false,
            dynamic_range: None,
            producer,
        });
        id
    }

    fn push_layer(
        &mut self,
        kind: LayerKind,
        inputs: Vec<TensorId>,
        outputs: Vec<(DataType, Vec<i32>)>,
    ) -> Result<Vec<TensorId>, GraphError> {
        for input in &inputs {
            self.tensor(*input)?;
        }
        for (_, dims) in &outputs {
            if dims.len() > MAX_DIMS {
                return Err(GraphError::internal(format!(
                    "{} layer would produce rank {} above the limit of {}",
                    kind.type_name(),
                    dims.len(),
                    MAX_DIMS
                )));
            }
        }
        let layer_id = LayerId(self.layers.len());
        let name = format!("(Unnamed Layer* {}) [{}]", layer_id.0, kind.type_name());
        let output_ids: Vec<TensorId> = outputs
            .into_iter()
            .enumerate()
            .map(|(i, (dtype, dims))| {
                self.push_tensor(format!("{}_output_{}", name, i), dtype, dims, Some(layer_id))
            })
            .collect();
        tracing::trace!(layer = %name, outputs = output_ids.len(), "added layer");
        self.layers.push(Layer {
            name,
            kind,
            inputs,
            outputs: output_ids.clone(),
        });
        Ok(output_ids)
    }

    fn single(
        &mut self,
        kind: LayerKind,
        inputs: Vec<TensorId>,
        dtype: DataType,
        dims: Vec<i32>,
    ) -> Result<TensorId, GraphError> {
        let outputs = self.push_layer(kind, inputs, vec![(dtype, dims)])?;
        outputs
            .first()
            .copied()
            .ok_or_else(|| GraphError::internal("Layer produced no output"))
    }

    pub fn add_constant(
        &mut self,
        weights: &ShapedWeights,
        dims: &[i32],
    ) -> Result<TensorId, GraphError> {
        let count = weight_dims_count(dims);
        if count != weights.count() {
            return Err(GraphError::internal(format!(
                "Constant dims {:?} do not match {} weight values",
                dims,
                weights.count()
            )));
        }
        self.single(
            LayerKind::Constant {
                weights: weights.backend_weights(),
                dims: dims.to_vec(),
            },
            Vec::new(),
            weights.dtype(),
            dims.to_vec(),
        )
    }

    pub fn add_shuffle(&mut self, input: TensorId, spec: ShuffleSpec) -> Result<TensorId, GraphError> {
        let (dtype, dims) = self.describe(input)?;
        let out = infer_shuffle_shape(&dims, &spec)?;
        self.single(LayerKind::Shuffle(spec), vec![input], dtype, out)
    }

    pub fn add_element_wise(
        &mut self,
        lhs: TensorId,
        rhs: TensorId,
        op: ElementWiseOp,
    ) -> Result<TensorId, GraphError> {
        let (dtype, l) = self.describe(lhs)?;
        let r = self.dims(rhs)?;
        let out = infer_elementwise_shape(&l, &r)?;
        self.single(LayerKind::ElementWise { op }, vec![lhs, rhs], dtype, out)
    }

    pub fn add_activation(
        &mut self,
        input: TensorId,
        kind: ActivationKind,
    ) -> Result<TensorId, GraphError> {
        let (dtype, dims) = self.describe(input)?;
        self.single(LayerKind::Activation { kind }, vec![input], dtype, dims)
    }

    pub fn add_unary(&mut self, input: TensorId, op: UnaryOp) -> Result<TensorId, GraphError> {
        let (dtype, dims) = self.describe(input)?;
        self.single(LayerKind::Unary { op }, vec![input], dtype, dims)
    }

    pub fn add_convolution(
        &mut self,
        input: TensorId,
        spec: ConvolutionSpec,
    ) -> Result<TensorId, GraphError> {
        let (dtype, dims) = self.describe(input)?;
        let out = infer_conv_shape(&dims, &spec)?;
        self.single(LayerKind::Convolution(spec), vec![input], dtype, out)
    }

    pub fn add_deconvolution(
        &mut self,
        input: TensorId,
        spec: ConvolutionSpec,
    ) -> Result<TensorId, GraphError> {
        let (dtype, dims) = self.describe(input)?;
        let out = infer_deconv_shape(&dims, &spec)?;
        self.single(LayerKind::Deconvolution(spec), vec![input], dtype, out)
    }

    pub fn add_padding(&mut self, input: TensorId, pre: Hw, post: Hw) -> Result<TensorId, GraphError> {
        let (dtype, dims) = self.describe(input)?;
        let out = infer_padding_shape(&dims, pre, post)?;
        self.single(LayerKind::Padding { pre, post }, vec![input], dtype, out)
    }

    pub fn add_pooling(
        &mut self,
        input: TensorId,
        kind: PoolingKind,
        window: Hw,
        stride: Hw,
        padding: Hw,
    ) -> Result<TensorId, GraphError> {
        let (dtype, dims) = self.describe(input)?;
        let out = infer_pool_shape(&dims, window, stride, padding)?;
        self.single(
            LayerKind::Pooling {
                kind,
                window,
                stride,
                padding,
            },
            vec![input],
            dtype,
            out,
        )
    }

    pub fn add_scale(
        &mut self,
        input: TensorId,
        mode: ScaleMode,
        shift: BackendWeights,
        scale: BackendWeights,
        power: BackendWeights,
    ) -> Result<TensorId, GraphError> {
        let (dtype, dims) = self.describe(input)?;
        let expected = match mode {
            ScaleMode::Uniform => 1,
            ScaleMode::Channel => dims.first().map(|c| (*c).max(0) as usize).unwrap_or(0),
            ScaleMode::Elementwise => dims.iter().map(|d| (*d).max(0) as usize).product(),
        };
        for (label, w) in [("shift", &shift), ("scale", &scale), ("power", &power)] {
            if !w.is_empty() && w.count != expected {
                return Err(GraphError::internal(format!(
                    "Scale {} has {} values, {:?} mode over {:?} needs {}",
                    label, w.count, mode, dims, expected
                )));
            }
        }
        self.single(
            LayerKind::Scale {
                mode,
                shift,
                scale,
                power,
            },
            vec![input],
            dtype,
            dims,
        )
    }

    pub fn add_concatenation(
        &mut self,
        inputs: &[TensorId],
        axis: usize,
    ) -> Result<TensorId, GraphError> {
        let first = inputs
            .first()
            .ok_or_else(|| GraphError::internal("Concatenation needs at least one input"))?;
        let dtype = self.dtype(*first)?;
        let shapes = inputs
            .iter()
            .map(|id| self.dims(*id))
            .collect::<Result<Vec<_>, _>>()?;
        let out = infer_concat_shape(&shapes, axis)?;
        self.single(
            LayerKind::Concatenation { axis },
            inputs.to_vec(),
            dtype,
            out,
        )
    }

    pub fn add_slice(
        &mut self,
        input: TensorId,
        start: Vec<i32>,
        size: Vec<i32>,
        stride: Vec<i32>,
    ) -> Result<TensorId, GraphError> {
        let (dtype, dims) = self.describe(input)?;
        let out = infer_slice_shape(&dims, &start, &size, &stride)?;
        self.single(
            LayerKind::Slice {
                start,
                size,
                stride,
            },
            vec![input],
            dtype,
            out,
        )
    }

    pub fn add_reduce(
        &mut self,
        input: TensorId,
        op: ReduceOp,
        axes: u32,
        keep_dims: bool,
    ) -> Result<TensorId, GraphError> {
        let (dtype, dims) = self.describe(input)?;
        let out = infer_reduce_shape(&dims, axes, keep_dims)?;
        self.single(
            LayerKind::Reduce { op, axes, keep_dims },
            vec![input],
            dtype,
            out,
        )
    }

    pub fn add_softmax(&mut self, input: TensorId, axes: u32) -> Result<TensorId, GraphError> {
        let (dtype, dims) = self.describe(input)?;
        if axes == 0 || axes >> dims.len() != 0 {
            return Err(GraphError::internal(format!(
                "Softmax axes {:#b} do not fit rank {}",
                axes,
                dims.len()
            )));
        }
        self.single(LayerKind::SoftMax { axes }, vec![input], dtype, dims)
    }

    /// Returns `(values, indices)`.
    pub fn add_top_k(
        &mut self,
        input: TensorId,
        op: TopKOp,
        k: i32,
        axes: u32,
    ) -> Result<(TensorId, TensorId), GraphError> {
        let (dtype, dims) = self.describe(input)?;
        let out = infer_topk_shape(&dims, k, axes)?;
        let outputs = self.push_layer(
            LayerKind::TopK { op, k, axes },
            vec![input],
            vec![(dtype, out.clone()), (DataType::Int32, out)],
        )?;
        match outputs.as_slice() {
            [values, indices] => Ok((*values, *indices)),
            _ => Err(GraphError::internal("TopK layer must have two outputs")),
        }
    }

    pub fn add_gather(
        &mut self,
        data: TensorId,
        indices: TensorId,
        axis: usize,
    ) -> Result<TensorId, GraphError> {
        let (dtype, data_dims) = self.describe(data)?;
        let index_dims = self.dims(indices)?;
        let out = infer_gather_shape(&data_dims, &index_dims, axis)?;
        self.single(LayerKind::Gather { axis }, vec![data, indices], dtype, out)
    }

    pub fn add_fully_connected(
        &mut self,
        input: TensorId,
        num_outputs: i32,
        kernel_weights: BackendWeights,
        bias_weights: BackendWeights,
    ) -> Result<TensorId, GraphError> {
        let (dtype, dims) = self.describe(input)?;
        let out = infer_fully_connected_shape(&dims, num_outputs)?;
        let per_output: usize = dims
            .iter()
            .rev()
            .take(3)
            .map(|d| (*d).max(0) as usize)
            .product();
        if kernel_weights.count != per_output * num_outputs.max(0) as usize {
            return Err(GraphError::internal(format!(
                "Fully connected kernel has {} values, expected {}x{}",
                kernel_weights.count, num_outputs, per_output
            )));
        }
        self.single(
            LayerKind::FullyConnected {
                num_outputs,
                kernel_weights,
                bias_weights,
            },
            vec![input],
            dtype,
            out,
        )
    }

    pub fn add_matrix_multiply(
        &mut self,
        a: TensorId,
        op0: MatrixOp,
        b: TensorId,
        op1: MatrixOp,
    ) -> Result<TensorId, GraphError> {
        let (dtype, a_dims) = self.describe(a)?;
        let b_dims = self.dims(b)?;
        let out = infer_matrix_multiply_shape(&a_dims, op0, &b_dims, op1)?;
        self.single(LayerKind::MatrixMultiply { op0, op1 }, vec![a, b], dtype, out)
    }

    /// Plugin layers report their own output descriptors.
    pub fn add_plugin(
        &mut self,
        plugin: &str,
        fields: Vec<PluginField>,
        inputs: &[TensorId],
        outputs: Vec<(DataType, Vec<i32>)>,
    ) -> Result<Vec<TensorId>, GraphError> {
        self.push_layer(
            LayerKind::Plugin {
                plugin: plugin.to_string(),
                fields,
            },
            inputs.to_vec(),
            outputs,
        )
    }

    fn describe(&self, id: TensorId) -> Result<(DataType, Vec<i32>), GraphError> {
        let info = self.tensor(id)?;
        Ok((info.dtype, info.dims.clone()))
    }
}
