use std::f32::consts::{FRAC_PI_2, PI};

use crate::engine::PrecisionMode;
use crate::error::GraphError;
use crate::network::{ActivationKind, ElementWiseOp, UnaryOp};

use super::{
    allow_data_types, check_input_kinds, create_broadcastable_scalar_constant, OpConverterParams,
    FLOAT_TYPES,
};

pub(super) const UNARY_OPS: [&str; 19] = [
    "Neg", "Exp", "Log", "Sqrt", "Abs", "Reciprocal", "Sin", "Cos", "Tan", "Sinh", "Cosh", "Asin",
    "Acos", "Atan", "Asinh", "Acosh", "Atanh", "Ceil", "Floor",
];

fn unary_op(op: &str) -> Option<UnaryOp> {
    Some(match op {
        "Neg" => UnaryOp::Neg,
        "Exp" => UnaryOp::Exp,
        "Log" => UnaryOp::Log,
        "Sqrt" => UnaryOp::Sqrt,
        "Abs" => UnaryOp::Abs,
        "Reciprocal" => UnaryOp::Recip,
        "Sin" => UnaryOp::Sin,
        "Cos" => UnaryOp::Cos,
        "Tan" => UnaryOp::Tan,
        "Sinh" => UnaryOp::Sinh,
        "Cosh" => UnaryOp::Cosh,
        "Asin" => UnaryOp::Asin,
        "Acos" => UnaryOp::Acos,
        "Atan" => UnaryOp::Atan,
        "Asinh" => UnaryOp::Asinh,
        "Acosh" => UnaryOp::Acosh,
        "Atanh" => UnaryOp::Atanh,
        "Ceil" => UnaryOp::Ceil,
        "Floor" => UnaryOp::Floor,
        _ => return None,
    })
}

fn check_single_float_input(params: &OpConverterParams<'_>, label: &str) -> Result<(), GraphError> {
    check_input_kinds(params, &[(label, false)])?;
    allow_data_types(params, &FLOAT_TYPES, "T")
}

pub fn convert_activation(params: &mut OpConverterParams<'_>) -> Result<(), GraphError> {
    check_single_float_input(params, "input")?;
    let kind = match params.op() {
        "Relu" => ActivationKind::Relu,
        "Sigmoid" => ActivationKind::Sigmoid,
        "Tanh" => ActivationKind::Tanh,
        other => {
            return Err(GraphError::unimplemented(format!(
                "Activation op: {} not supported at: {}",
                other,
                params.name()
            )))
        }
    };
    if params.validation_only {
        return Ok(());
    }
    let input = params.inputs[0].tensor()?.clone();
    let (builder, _) = params.build()?;
    let output = builder.layer(|net| net.add_activation(input.id, kind))?;
    match kind {
        ActivationKind::Sigmoid => builder.provide_quantization_range(&output, 0.0, 1.0),
        ActivationKind::Tanh => builder.provide_quantization_range(&output, -1.0, 1.0),
        ActivationKind::Relu => {}
    }
    params.push_tensor(output);
    Ok(())
}

/// `max(x, alpha * x)`, valid for `alpha` in `[0, 1]`.
pub fn convert_leaky_relu(params: &mut OpConverterParams<'_>) -> Result<(), GraphError> {
    check_single_float_input(params, "input")?;
    let alpha: f32 = params.attrs.get("alpha")?;
    if !(0.0..=1.0).contains(&alpha) {
        return Err(GraphError::unimplemented(format!(
            "Alpha value for LeakyRelu must be between 0 and 1, at {}",
            params.name()
        )));
    }
    if params.validation_only {
        return Ok(());
    }
    let input = params.inputs[0].tensor()?.clone();
    let alpha_tensor = create_broadcastable_scalar_constant(params, alpha, &input.dims)?;
    let (builder, _) = params.build()?;
    let scaled =
        builder.layer(|net| net.add_element_wise(input.id, alpha_tensor.id, ElementWiseOp::Prod))?;
    let output = builder.layer(|net| net.add_element_wise(input.id, scaled.id, ElementWiseOp::Max))?;
    builder.mark_quantization_ranges_as_inferrable(&output, &scaled);
    params.push_tensor(output);
    Ok(())
}

/// `min(relu(x), 6)`. Both the relu and the result are pinned to `[0, 6]`.
pub fn convert_relu6(params: &mut OpConverterParams<'_>) -> Result<(), GraphError> {
    check_single_float_input(params, "input")?;
    if params.validation_only {
        return Ok(());
    }
    let input = params.inputs[0].tensor()?.clone();
    let relu = {
        let (builder, _) = params.build()?;
        let relu = builder.layer(|net| net.add_activation(input.id, ActivationKind::Relu))?;
        builder.provide_quantization_range(&relu, 0.0, 6.0);
        relu
    };
    let six = create_broadcastable_scalar_constant(params, 6.0, &relu.dims)?;
    let (builder, _) = params.build()?;
    let output = builder.layer(|net| net.add_element_wise(relu.id, six.id, ElementWiseOp::Min))?;
    builder.provide_quantization_range(&output, 0.0, 6.0);
    params.push_tensor(output);
    Ok(())
}

pub fn convert_unary(params: &mut OpConverterParams<'_>) -> Result<(), GraphError> {
    check_single_float_input(params, "x")?;
    let Some(op) = unary_op(params.op()) else {
        return Err(GraphError::unimplemented(format!(
            "Unary op: {} not supported at: {}",
            params.op(),
            params.name()
        )));
    };
    if params.validation_only {
        return Ok(());
    }
    let input = params.inputs[0].tensor()?.clone();
    let (builder, _) = params.build()?;
    let output = builder.layer(|net| net.add_unary(input.id, op))?;
    match op {
        UnaryOp::Sin | UnaryOp::Cos => builder.provide_quantization_range(&output, -1.0, 1.0),
        UnaryOp::Asin | UnaryOp::Atan => {
            builder.provide_quantization_range(&output, -FRAC_PI_2, FRAC_PI_2)
        }
        UnaryOp::Acos => builder.provide_quantization_range(&output, 0.0, PI),
        // Symmetric ranges survive sign changes.
        UnaryOp::Neg | UnaryOp::Abs => builder.mark_quantization_ranges_as_inferrable(&input, &output),
        _ => {}
    }
    params.push_tensor(output);
    Ok(())
}

/// `1 / sqrt(x)` as two unary layers. The intermediate tensor needs its own
/// range, so INT8 without calibration is rejected.
pub fn convert_rsqrt(params: &mut OpConverterParams<'_>) -> Result<(), GraphError> {
    check_single_float_input(params, "x")?;
    if params.precision_mode == PrecisionMode::Int8 && !params.use_calibration {
        return Err(GraphError::unimplemented(format!(
            "Intermediate quantization range cannot be determined without calibration for Rsqrt, consider replacing with Sqrt -> FakeQuant -> Reciprocal ops, at {}",
            params.name()
        )));
    }
    if params.validation_only {
        return Ok(());
    }
    let input = params.inputs[0].tensor()?.clone();
    let (builder, _) = params.build()?;
    let sqrt = builder.layer(|net| net.add_unary(input.id, UnaryOp::Sqrt))?;
    let output = builder.layer(|net| net.add_unary(sqrt.id, UnaryOp::Recip))?;
    params.push_tensor(output);
    Ok(())
}
