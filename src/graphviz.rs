use std::fmt::Write;

use crate::network::{LayerKind, Network, TensorInfo};

pub fn network_to_dot(network: &Network) -> String {
    let mut dot = String::from("digraph network {\n");
    dot.push_str("  rankdir=LR;\n");
    dot.push_str("  node [fontname=\"Helvetica\"];\n");
    dot.push_str("  edge [fontname=\"Helvetica\"];\n\n");

    for (idx, tensor) in network.tensors().iter().enumerate() {
        let (shape, fill) = if tensor.is_input {
            ("oval", "#d0e6ff")
        } else if tensor.is_output {
            ("doublecircle", "#d6f5d6")
        } else {
            ("ellipse", "#f0f0f0")
        };
        let label = escape_label(&tensor_label(tensor));
        let _ = writeln!(
            dot,
            "  tensor_{} [shape={},style=filled,fillcolor=\"{}\",label=\"{}\"];",
            idx, shape, fill, label
        );
    }

    dot.push('\n');

    for (idx, layer) in network.layers().iter().enumerate() {
        let node_id = format!("layer_{}", idx);
        let mut label_lines = vec![format!("{} (#{})", layer.kind.type_name(), idx)];
        if !layer.name.is_empty() {
            label_lines.push(layer.name.clone());
        }
        if let LayerKind::Plugin { plugin, .. } = &layer.kind {
            label_lines.push(plugin.clone());
        }
        let label = escape_label(&label_lines.join("\n"));
        let _ = writeln!(
            dot,
            "  {} [shape=box,style=rounded,label=\"{}\"];",
            node_id, label
        );

        for (input_idx, tensor) in layer.inputs.iter().enumerate() {
            let _ = writeln!(
                dot,
                "  tensor_{} -> {} [label=\"in{}\"];",
                tensor.0, node_id, input_idx
            );
        }
        for (output_idx, tensor) in layer.outputs.iter().enumerate() {
            let _ = writeln!(
                dot,
                "  {} -> tensor_{} [label=\"out{}\"];",
                node_id, tensor.0, output_idx
            );
        }
    }

    dot.push_str("}\n");
    dot
}

fn tensor_label(tensor: &TensorInfo) -> String {
    let mut lines = vec![
        tensor.name.clone(),
        format!("{:?}", tensor.dtype),
        format_dims(&tensor.dims),
    ];
    if let Some((min, max)) = tensor.dynamic_range {
        lines.push(format!("range [{}, {}]", min, max));
    }
    lines.join("\n")
}

fn escape_label(label: &str) -> String {
    label
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

/// Dims as `Nx3x4`; the implicit batch dim always leads.
fn format_dims(dims: &[i32]) -> String {
    std::iter::once("N".to_string())
        .chain(dims.iter().map(|d| match d {
            -1 => "?".to_string(),
            d => d.to_string(),
        }))
        .collect::<Vec<_>>()
        .join("x")
}

#[cfg(test)]
mod tests {
    use super::network_to_dot;
    use crate::graph::DataType;
    use crate::network::{ActivationKind, Network};

    #[test]
    fn exports_graphviz_with_tensors_and_layers() {
        let mut network = Network::new();
        let x = network.add_input("x", DataType::Float32, &[3, 4]).unwrap();
        let y = network.add_activation(x, ActivationKind::Relu).unwrap();
        network.set_tensor_name(y, "relu \"out\"").unwrap();
        network.mark_output(y).unwrap();
        network.set_dynamic_range(y, -2.0, 2.0).unwrap();

        let dot = network_to_dot(&network);
        assert!(dot.starts_with("digraph network {"));
        assert!(dot.contains("tensor_0 [shape=oval"));
        assert!(dot.contains("label=\"x\\nFloat32\\nNx3x4\""));
        assert!(dot.contains("tensor_1 [shape=doublecircle"));
        assert!(dot.contains("relu \\\"out\\\""));
        assert!(dot.contains("range [-2, 2]"));
        assert!(dot.contains("layer_0 [shape=box,style=rounded,label=\"Activation (#0)"));
        assert!(dot.contains("tensor_0 -> layer_0 [label=\"in0\"];"));
        assert!(dot.contains("layer_0 -> tensor_1 [label=\"out0\"];"));
        assert!(dot.trim_end().ends_with('}'));
    }
}
