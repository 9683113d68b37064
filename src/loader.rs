use std::fs;
use std::path::Path;

use crate::error::GraphError;
use crate::graph::{GraphDocument, PartialShape};

/// Load a graph document (`graph`, `properties`, `input_shapes`) from a `.json` file.
pub fn load_graph_from_path(path: impl AsRef<Path>) -> Result<GraphDocument, GraphError> {
    let path_ref = path.as_ref();
    match path_ref.extension().and_then(|ext| ext.to_str()) {
        Some("json") => {}
        other => {
            return Err(GraphError::invalid_argument(format!(
                "Unsupported file extension: {:?}. Use .json",
                other
            )));
        }
    }
    let contents = fs::read_to_string(path_ref).map_err(|err| GraphError::io(path_ref, err))?;
    load_graph_from_str(&contents)
}

pub fn load_graph_from_str(contents: &str) -> Result<GraphDocument, GraphError> {
    let document: GraphDocument = serde_json::from_str(contents)?;
    tracing::debug!(
        nodes = document.graph.nodes.len(),
        input_shapes = document.input_shapes.len(),
        "loaded graph document"
    );
    Ok(document)
}

/// Parse a shape written as `1x28x28x3`. `?` marks an unknown dim, `*` an
/// unknown rank and `scalar` a rank-0 shape.
pub fn parse_shape_spec(spec: &str) -> Result<PartialShape, GraphError> {
    let spec = spec.trim();
    match spec {
        "*" => return Ok(PartialShape::unknown()),
        "scalar" | "" => return Ok(PartialShape::new(Vec::new())),
        _ => {}
    }
    let dims = spec
        .split(['x', 'X', ','])
        .map(|part| match part.trim() {
            "?" | "-1" => Ok(-1),
            digits => digits.parse::<i64>().ok().filter(|d| *d >= 0).ok_or_else(|| {
                GraphError::invalid_argument(format!(
                    "Invalid dimension `{}` in shape `{}`",
                    digits, spec
                ))
            }),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(PartialShape::new(dims))
}
