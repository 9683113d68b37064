use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use rustnn_lower::{
    convert_graph_def_to_engine, debug::init_tracing, load_graph_from_path, network_to_dot,
    parse_shape_spec, ConversionParams, GraphDocument, GraphError, InputRef, NodeValidator,
    OpConverterRegistry, PrecisionMode, ENGINE_INPUT_PREFIX, ENGINE_OUTPUT_PREFIX,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Lower dataflow graphs into backend layer networks", long_about = None)]
struct Cli {
    /// Path to a JSON graph document (`graph`, `properties`, `input_shapes`).
    graph: PathBuf,
    /// Precision the backend should build the engine in.
    #[arg(long, value_enum, default_value_t = PrecisionMode::Fp32)]
    precision: PrecisionMode,
    /// INT8 ranges come from calibration; do not warn about missing ones.
    #[arg(long)]
    use_calibration: bool,
    #[arg(long, default_value_t = 1)]
    max_batch_size: i32,
    #[arg(long, default_value_t = 1 << 30)]
    max_workspace_size: usize,
    /// Shape of an engine input, batch first (`1x28x28x3`, `?` for unknown).
    /// Repeat once per slot; overrides the document's `input_shapes`.
    #[arg(long = "input-shape")]
    input_shapes: Vec<String>,
    /// Only probe every node with the validator and report the unsupported ones.
    #[arg(long)]
    validate_only: bool,
    /// Optional path to write a Graphviz DOT export of the network.
    #[arg(long)]
    export_dot: Option<PathBuf>,
    /// Optional path to write the network and its weights as JSON.
    #[arg(long)]
    export_json: Option<PathBuf>,
}

fn validate_nodes(
    document: &GraphDocument,
    registry: Arc<OpConverterRegistry>,
    params: &ConversionParams,
) -> Result<(), GraphError> {
    let validator = NodeValidator::new(registry);
    let mut rejected = 0;
    for node in &document.graph.nodes {
        if node.name.starts_with(ENGINE_INPUT_PREFIX) || node.name.starts_with(ENGINE_OUTPUT_PREFIX)
        {
            continue;
        }
        let mut inputs = Vec::new();
        for input in &node.inputs {
            if let InputRef::Data { node: producer, port } = InputRef::parse(input) {
                let producer = document.graph.node(producer).ok_or_else(|| {
                    GraphError::not_found(format!("Input {} of {} is not in the graph", input, node.name))
                })?;
                inputs.push((producer, port));
            }
        }
        if let Err(err) = validator.validate_node(node, &inputs, params, &document.properties) {
            rejected += 1;
            println!("  - {} ({}): {}", node.name, node.op, err);
        }
    }
    println!(
        "{} of {} nodes can be lowered.",
        document.graph.nodes.len() - rejected,
        document.graph.nodes.len()
    );
    Ok(())
}

fn run() -> Result<(), GraphError> {
    let cli = Cli::parse();
    init_tracing();
    let mut document = load_graph_from_path(&cli.graph)?;
    if !cli.input_shapes.is_empty() {
        document.input_shapes = cli
            .input_shapes
            .iter()
            .map(|spec| parse_shape_spec(spec))
            .collect::<Result<_, _>>()?;
    }
    let params = ConversionParams {
        precision_mode: cli.precision,
        use_calibration: cli.use_calibration,
        max_batch_size: cli.max_batch_size,
        max_workspace_size_bytes: cli.max_workspace_size,
    };
    let registry = Arc::new(OpConverterRegistry::with_defaults());

    if cli.validate_only {
        return validate_nodes(&document, registry, &params);
    }

    let engine = convert_graph_def_to_engine(
        &document.graph,
        &document.input_shapes,
        &params,
        registry,
        None,
    )?;
    let network = &engine.network;
    println!(
        "Lowered graph from `{}` into {} layers ({:?}, max batch {}).",
        cli.graph.display(),
        network.layers().len(),
        engine.precision_mode,
        engine.max_batch_size
    );
    println!("Inputs:");
    for id in network.inputs() {
        let tensor = network.tensor(*id)?;
        println!("  - {}: {:?} {:?}", tensor.name, tensor.dtype, tensor.dims);
    }
    println!("Outputs:");
    for id in network.outputs() {
        let tensor = network.tensor(*id)?;
        println!("  - {}: {:?} {:?}", tensor.name, tensor.dtype, tensor.dims);
    }

    if let Some(dot_path) = cli.export_dot {
        let dot = network_to_dot(network);
        std::fs::write(&dot_path, dot).map_err(|err| GraphError::export(dot_path.clone(), err))?;
        println!("Exported Graphviz DOT to `{}`.", dot_path.display());
    }

    if let Some(json_path) = cli.export_json {
        let json = serde_json::to_string_pretty(&engine.export())?;
        std::fs::write(&json_path, json)
            .map_err(|err| GraphError::export(json_path.clone(), err))?;
        println!("Exported network JSON to `{}`.", json_path.display());
    }
    Ok(())
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {}", err);
        std::process::exit(1);
    }
}
