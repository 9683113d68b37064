//! Quantization ranges recorded while building, and their propagation.

use std::collections::HashMap;

use crate::network::TensorId;

#[derive(Debug, Clone, Default)]
pub struct QuantizationRanges {
    ranges: HashMap<TensorId, f32>,
    infer_edges: Vec<(TensorId, TensorId)>,
}

impl QuantizationRanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `max(|min|, |max|)`; ranges applied to tensors are symmetric.
    pub fn provide_range(&mut self, tensor: TensorId, min: f32, max: f32) {
        self.ranges.insert(tensor, min.abs().max(max.abs()));
    }

    /// The two tensors share a range, in both directions.
    pub fn mark_inferrable(&mut self, input: TensorId, output: TensorId) {
        self.infer_edges.push((input, output));
        self.infer_edges.push((output, input));
    }

    pub fn range(&self, tensor: TensorId) -> Option<f32> {
        self.ranges.get(&tensor).copied()
    }

    pub fn ranges(&self) -> &HashMap<TensorId, f32> {
        &self.ranges
    }

    pub fn pending_edges(&self) -> usize {
        self.infer_edges.len()
    }

    /// Copy ranges along infer edges until a full pass adds nothing. Edges
    /// whose destination has a range are dropped. Returns the number of
    /// ranges added.
    pub fn propagate(&mut self) -> usize {
        let mut added = 0;
        loop {
            let mut progress = false;
            let mut i = 0;
            while i < self.infer_edges.len() {
                let (src, dst) = self.infer_edges[i];
                if !self.ranges.contains_key(&dst) {
                    if let Some(range) = self.ranges.get(&src).copied() {
                        self.ranges.insert(dst, range);
                        progress = true;
                        added += 1;
                        tracing::debug!(from = src.0, to = dst.0, range, "copy quantization range");
                    }
                }
                // Removal keeps insertion order so earlier edges win.
                if self.ranges.contains_key(&dst) {
                    self.infer_edges.remove(i);
                } else {
                    i += 1;
                }
            }
            if !progress {
                return added;
            }
        }
    }
}
