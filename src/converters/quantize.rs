use crate::error::GraphError;

use super::{check_input_kinds, OpConverterParams};

/// Quantization ops add no layer. They record the range of their input and
/// forward it.
pub fn convert_quantize(params: &mut OpConverterParams<'_>) -> Result<(), GraphError> {
    let (min, max) = match params.op() {
        "FakeQuantWithMinMaxArgs" => {
            check_input_kinds(params, &[("input", false)])?;
            if !params.attrs.contains("min") || !params.attrs.contains("max") {
                return Err(GraphError::invalid_argument(format!(
                    "Min or max attribute not found for {} at {}",
                    params.op(),
                    params.name()
                )));
            }
            (params.attrs.get::<f32>("min")?, params.attrs.get::<f32>("max")?)
        }
        op @ ("FakeQuantWithMinMaxVars" | "QuantizeAndDequantizeV2" | "QuantizeAndDequantizeV3") => {
            let mut expected = match op {
                "FakeQuantWithMinMaxVars" => vec![("input", false), ("min", true), ("max", true)],
                _ => vec![("input", false), ("input_min", true), ("input_max", true)],
            };
            if op == "QuantizeAndDequantizeV3" {
                expected.push(("num_bits", true));
            }
            check_input_kinds(params, &expected)?;
            (first_value(params, 1)?, first_value(params, 2)?)
        }
        other => {
            return Err(GraphError::invalid_argument(format!(
                "Unknown quantization op {}, at {}",
                other,
                params.name()
            )))
        }
    };
    if params.validation_only {
        return Ok(());
    }

    let input = params.inputs[0].clone();
    let tensor = input.tensor()?.clone();
    let (builder, _) = params.build()?;
    builder.provide_quantization_range(&tensor, min, max);
    params.outputs.push(input);
    Ok(())
}

fn first_value(params: &OpConverterParams<'_>, index: usize) -> Result<f32, GraphError> {
    let values = params
        .weight_store
        .values_as_f32(params.inputs[index].weights()?)?;
    values.first().copied().ok_or_else(|| {
        GraphError::invalid_argument(format!(
            "Range input {} of {} is empty, at {}",
            index,
            params.op(),
            params.name()
        ))
    })
}

#[cfg(test)]
mod tests {
    use crate::converters::testing::*;
    use crate::engine::PrecisionMode;
    use crate::error::ErrorKind;
    use crate::graph::{AttrValue, NodeDef};

    fn range_of(lowered: &Lowered) -> Option<(f32, f32)> {
        let id = lowered.outputs[0].tensor().unwrap().id;
        lowered.network.tensor(id).unwrap().dynamic_range
    }

    #[test]
    fn min_max_attrs_set_the_input_range() {
        let node = typed("q", "FakeQuantWithMinMaxArgs")
            .with_attr("min", AttrValue::F(-3.0))
            .with_attr("max", AttrValue::F(2.0));
        let lowered = Harness::precision(PrecisionMode::Int8)
            .lower(&node, &[tensor("x", &[1, 4])])
            .unwrap();
        assert!(lowered.network.layers().is_empty());
        assert_eq!(range_of(&lowered), Some((-3.0, 3.0)));

        let missing = typed("q", "FakeQuantWithMinMaxArgs").with_attr("min", AttrValue::F(0.0));
        let err = Harness::precision(PrecisionMode::Int8)
            .lower(&missing, &[tensor("x", &[1, 4])])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn range_inputs_are_read_from_constants() {
        let node = NodeDef::new("q", "QuantizeAndDequantizeV3");
        let lowered = Harness::precision(PrecisionMode::Int8)
            .lower(
                &node,
                &[
                    tensor("x", &[1, 4]),
                    consts("lo", &[], &[-1.5]),
                    consts("hi", &[], &[6.0]),
                    int_consts("bits", &[], &[8]),
                ],
            )
            .unwrap();
        assert_eq!(range_of(&lowered), Some((-6.0, 6.0)));
    }

    #[test]
    fn quantize_ops_need_int8() {
        let node = typed("q", "FakeQuantWithMinMaxVars");
        let inputs = [
            tensor("x", &[1, 4]),
            consts("lo", &[], &[-1.0]),
            consts("hi", &[], &[1.0]),
        ];
        let err = Harness::default().validate(&node, &inputs).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unimplemented);
        assert!(Harness::precision(PrecisionMode::Int8)
            .validate(&node, &inputs)
            .is_ok());
    }
}
