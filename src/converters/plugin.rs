use crate::error::GraphError;
use crate::network::PluginField;
use crate::plugin::{PluginFactory, TensorDescriptor};

use super::OpConverterParams;

/// Lower a node whose op the plugin factory claims. Every attribute is
/// handed to the plugin as a float list, and every plugin output is pushed.
pub fn convert_plugin(
    params: &mut OpConverterParams<'_>,
    factory: &dyn PluginFactory,
) -> Result<(), GraphError> {
    let mut inputs = Vec::with_capacity(params.inputs.len());
    for (i, input) in params.inputs.iter().enumerate() {
        if input.is_weights() {
            return Err(GraphError::invalid_argument(format!(
                "Input {} of plugin {} must be a tensor, at {}",
                i,
                params.op(),
                params.name()
            )));
        }
        inputs.push(input.clone());
    }
    if params.validation_only {
        return Ok(());
    }

    let mut plugin = factory.create_plugin(params.op()).ok_or_else(|| {
        GraphError::not_found(format!("No plugin can be created for op {}", params.op()))
    })?;
    let mut fields = Vec::new();
    for key in params.attrs.keys() {
        let values = params.attrs.get_float_list(key);
        if !plugin.set_attribute(key, &values) {
            return Err(GraphError::invalid_argument("plugin SetAttribute failed"));
        }
        fields.push(PluginField {
            name: key.to_string(),
            values,
        });
    }

    let handles = inputs
        .iter()
        .map(|input| input.tensor().cloned())
        .collect::<Result<Vec<_>, _>>()?;
    let descriptors: Vec<TensorDescriptor> = handles
        .iter()
        .map(|h| (h.dtype, h.dims.clone()))
        .collect();
    let outputs = plugin.output_descriptors(&descriptors)?;
    let ids: Vec<_> = handles.iter().map(|h| h.id).collect();

    let op = params.op();
    let (builder, _) = params.build()?;
    let outputs = builder.network_mut().add_plugin(op, fields, &ids, outputs)?;
    let outputs = outputs
        .into_iter()
        .map(|id| builder.handle(id))
        .collect::<Result<Vec<_>, _>>()?;
    for output in outputs {
        params.push_tensor(output);
    }
    Ok(())
}
