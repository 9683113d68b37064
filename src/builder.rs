//! Network-building state shared by the converters of one session.

use std::collections::BTreeSet;

use crate::engine::PrecisionMode;
use crate::error::GraphError;
use crate::graph::DataType;
use crate::network::{Network, ShuffleSpec, TensorId};
use crate::quantization::QuantizationRanges;
use crate::shape_inference::are_dims_static_with_different_size;
use crate::values::{TensorHandle, TensorOrWeights};
use crate::weights::{weight_range, ShapedWeights, WeightStore};

/// Fails when `input` cannot be viewed as `dims` because both shapes are
/// static and hold different element counts.
pub fn check_shape_for_reshape(input: &TensorOrWeights, dims: &[i32]) -> Result<(), GraphError> {
    if are_dims_static_with_different_size(input.dims(), dims, input.is_tensor()) {
        return Err(GraphError::invalid_argument(format!(
            "Incompatible shapes: {:?} vs. {:?}",
            input.dims(),
            dims
        )));
    }
    Ok(())
}

#[derive(Debug)]
pub struct NetworkBuilder {
    network: Network,
    quantization: QuantizationRanges,
    precision_mode: PrecisionMode,
    use_calibration: bool,
}

impl NetworkBuilder {
    pub fn new(precision_mode: PrecisionMode, use_calibration: bool) -> Self {
        Self {
            network: Network::new(),
            quantization: QuantizationRanges::new(),
            precision_mode,
            use_calibration,
        }
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn network_mut(&mut self) -> &mut Network {
        &mut self.network
    }

    pub fn quantization(&self) -> &QuantizationRanges {
        &self.quantization
    }

    pub fn precision_mode(&self) -> PrecisionMode {
        self.precision_mode
    }

    pub fn use_calibration(&self) -> bool {
        self.use_calibration
    }

    pub fn into_network(self) -> Network {
        self.network
    }

    pub fn handle(&self, id: TensorId) -> Result<TensorHandle, GraphError> {
        let info = self.network.tensor(id)?;
        Ok(TensorHandle {
            id,
            dtype: info.dtype,
            dims: info.dims.clone(),
        })
    }

    /// Run one `Network::add_*` call and wrap its output.
    pub fn layer(
        &mut self,
        add: impl FnOnce(&mut Network) -> Result<TensorId, GraphError>,
    ) -> Result<TensorHandle, GraphError> {
        let id = add(&mut self.network)?;
        self.handle(id)
    }

    pub fn add_input(
        &mut self,
        name: &str,
        dtype: DataType,
        dims: &[i32],
    ) -> Result<TensorHandle, GraphError> {
        let id = self.network.add_input(name, dtype, dims).map_err(|_| {
            GraphError::invalid_argument(format!(
                "Failed to create Input layer tensor {} rank={}",
                name,
                dims.len()
            ))
        })?;
        self.handle(id)
    }

    pub fn provide_quantization_range(&mut self, tensor: &TensorHandle, min: f32, max: f32) {
        self.quantization.provide_range(tensor.id, min, max);
    }

    pub fn mark_quantization_ranges_as_inferrable(
        &mut self,
        input: &TensorHandle,
        output: &TensorHandle,
    ) {
        self.quantization.mark_inferrable(input.id, output.id);
    }

    pub fn create_constant_layer(
        &mut self,
        weights: &ShapedWeights,
        dims: &[i32],
    ) -> Result<TensorHandle, GraphError> {
        self.layer(|net| net.add_constant(weights, dims))
    }

    /// View `input` as a tensor of `dims`. Tensors get a reshape only when the
    /// dims differ; weights become a constant layer.
    pub fn prepare_tensor_for_shape(
        &mut self,
        store: &WeightStore,
        input: &TensorOrWeights,
        dims: &[i32],
    ) -> Result<TensorHandle, GraphError> {
        check_shape_for_reshape(input, dims)?;
        match input {
            TensorOrWeights::Weights(weights) => {
                let tensor = self.create_constant_layer(weights, dims)?;
                if self.precision_mode == PrecisionMode::Int8 && !self.use_calibration {
                    let (mut min, mut max) = weight_range(store, weights)?;
                    if min == 0.0 && max == 0.0 {
                        min = -127.0;
                        max = 127.0;
                    }
                    self.provide_quantization_range(&tensor, min, max);
                }
                Ok(tensor)
            }
            _ => {
                let tensor = input.tensor()?.clone();
                if tensor.dims == dims {
                    return Ok(tensor);
                }
                let output = self.layer(|net| {
                    net.add_shuffle(tensor.id, ShuffleSpec::reshape(dims.to_vec()))
                })?;
                self.mark_quantization_ranges_as_inferrable(&tensor, &output);
                Ok(output)
            }
        }
    }

    /// Transpose with a permutation that includes the batch axis, which must
    /// stay in place.
    pub fn transpose_tensor(
        &mut self,
        input: &TensorHandle,
        order_with_batch: &[usize],
    ) -> Result<TensorHandle, GraphError> {
        if order_with_batch.len() != input.dims.len() + 1 {
            return Err(GraphError::invalid_argument(
                "Rank of perm for transpose does not match with that of the input.",
            ));
        }
        if order_with_batch[0] != 0 {
            return Err(GraphError::unimplemented(
                "Transpose at batch dimension is not supported.",
            ));
        }
        let order = order_with_batch[1..]
            .iter()
            .map(|p| {
                p.checked_sub(1).ok_or_else(|| {
                    GraphError::invalid_argument(format!(
                        "Invalid permutation {:?}",
                        order_with_batch
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        tracing::debug!(?order, "transpose tensor");
        let spec = ShuffleSpec {
            first_transpose: Some(order),
            reshape: Some(vec![0; input.dims.len()]),
            second_transpose: None,
        };
        let output = self.layer(|net| net.add_shuffle(input.id, spec))?;
        self.mark_quantization_ranges_as_inferrable(input, &output);
        Ok(output)
    }

    /// Propagate and apply symmetric dynamic ranges. Only INT8 builds use them.
    pub fn maybe_apply_quantization_ranges(&mut self) -> Result<(), GraphError> {
        if self.precision_mode != PrecisionMode::Int8 {
            return Ok(());
        }
        let inferred = self.quantization.propagate();
        tracing::debug!(inferred, "propagated quantization ranges");
        let mut ranges: Vec<_> = self
            .quantization
            .ranges()
            .iter()
            .map(|(id, range)| (*id, *range))
            .collect();
        ranges.sort_by_key(|(id, _)| *id);
        for (id, range) in ranges {
            tracing::debug!(tensor = %self.network.tensor(id)?.name, range, "setting range");
            self.network.set_dynamic_range(id, -range, range)?;
        }

        if !self.use_calibration {
            let touched: BTreeSet<TensorId> = self
                .network
                .layers()
                .iter()
                .flat_map(|layer| layer.inputs.iter().chain(&layer.outputs).copied())
                .collect();
            for id in touched {
                if self.quantization.range(id).is_none() {
                    tracing::warn!(
                        tensor = %self.network.tensor(id)?.name,
                        "Quantization range was not found. This is okay if the backend does not need the range (e.g. due to node fusion)."
                    );
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn reshape_is_skipped_when_dims_match() {
        let store = WeightStore::new();
        let mut b = NetworkBuilder::new(PrecisionMode::Fp32, false);
        let x = b.add_input("x", DataType::Float32, &[2, 3]).unwrap();
        let value = TensorOrWeights::from(x.clone());
        let same = b.prepare_tensor_for_shape(&store, &value, &[2, 3]).unwrap();
        assert_eq!(same.id, x.id);
        let flat = b.prepare_tensor_for_shape(&store, &value, &[6]).unwrap();
        assert_eq!(flat.dims, vec![6]);
        assert_eq!(b.network().layers().len(), 1);
        let err = b
            .prepare_tensor_for_shape(&store, &value, &[7])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn int8_constants_get_weight_ranges() {
        let mut store = WeightStore::new();
        let w = store.weights_from_values(&[3], &[-2.0f32, 0.5, 1.0]).unwrap();
        let zeros = store.get_temp_weights(DataType::Float32, &[2]).unwrap();
        let mut b = NetworkBuilder::new(PrecisionMode::Int8, false);
        let c = b
            .prepare_tensor_for_shape(&store, &TensorOrWeights::from(w), &[3])
            .unwrap();
        let z = b
            .prepare_tensor_for_shape(&store, &TensorOrWeights::from(zeros), &[2])
            .unwrap();
        assert_eq!(b.quantization().range(c.id), Some(2.0));
        assert_eq!(b.quantization().range(z.id), Some(127.0));
    }

    #[test]
    fn transpose_rejects_batch_moves() {
        let mut b = NetworkBuilder::new(PrecisionMode::Fp32, false);
        let x = b.add_input("x", DataType::Float32, &[2, 3, 4]).unwrap();
        let t = b.transpose_tensor(&x, &[0, 3, 1, 2]).unwrap();
        assert_eq!(t.dims, vec![4, 2, 3]);
        assert_eq!(
            b.transpose_tensor(&x, &[1, 0, 2, 3]).unwrap_err().kind(),
            ErrorKind::Unimplemented
        );
        assert_eq!(
            b.transpose_tensor(&x, &[0, 1, 2]).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn ranges_flow_through_transposes_in_int8() {
        let mut b = NetworkBuilder::new(PrecisionMode::Int8, true);
        let x = b.add_input("x", DataType::Float32, &[2, 3]).unwrap();
        let t = b.transpose_tensor(&x, &[0, 2, 1]).unwrap();
        b.provide_quantization_range(&x, -4.0, 2.0);
        b.maybe_apply_quantization_ranges().unwrap();
        let info = b.network().tensor(t.id).unwrap();
        assert_eq!(info.dynamic_range, Some((-4.0, 4.0)));
    }

    #[test]
    fn ranges_are_ignored_outside_int8() {
        let mut b = NetworkBuilder::new(PrecisionMode::Fp16, false);
        let x = b.add_input("x", DataType::Float32, &[2]).unwrap();
        b.provide_quantization_range(&x, 0.0, 1.0);
        b.maybe_apply_quantization_ranges().unwrap();
        assert_eq!(b.network().tensor(x.id).unwrap().dynamic_range, None);
    }
}
