//! Operator availability per opset version.

use crate::error::ExportError;
use crate::graph::Node;

/// Lowest opset the exporter can target.
pub const MIN_OPSET: u32 = 9;
/// Highest opset the exporter can target.
pub const MAX_OPSET: u32 = 17;
pub const DEFAULT_OPSET: u32 = 13;

/// First opset that allows `Unsqueeze` axes to be passed as an input.
pub const UNSQUEEZE_AXES_AS_INPUT: u32 = 13;
/// First opset with a fused `LayerNormalization`.
pub const FUSED_LAYER_NORM: u32 = 17;

#[rustfmt::skip]
const OPERATORS: &[(&str, u32)] = &[
    ("Add", 7),
    ("Cast", 6),
    ("DequantizeLinear", 10),
    ("Div", 7),
    ("DynamicQuantizeLinear", 11),
    ("Erf", 9),
    ("Gather", 1),
    ("Identity", 1),
    ("LayerNormalization", 17),
    ("MatMul", 9),
    ("MatMulInteger", 10),
    ("Mul", 7),
    ("Pow", 7),
    ("Range", 11),
    ("ReduceMean", 1),
    ("Reshape", 5),
    ("Shape", 1),
    ("Softmax", 1),
    ("Sqrt", 6),
    ("Sub", 7),
    ("Transpose", 1),
    ("Unsqueeze", 1),
];

/// Opset that introduced `op_type`, if the format knows it at all.
pub fn since_version(op_type: &str) -> Option<u32> {
    OPERATORS.iter().find(|(name, _)| *name == op_type).map(|&(_, version)| version)
}

/// Lowest opset able to express `node`, including attribute-dependent variants.
pub fn required_opset(node: &Node) -> Option<u32> {
    let base = since_version(&node.op_type)?;
    let variant = match node.op_type.as_str() {
        // per-axis scales
        "DequantizeLinear" if node.attributes.contains_key("axis") => 13,
        _ => base,
    };
    Some(base.max(variant))
}

pub fn validate_opset(opset: u32) -> Result<(), ExportError> {
    if (MIN_OPSET..=MAX_OPSET).contains(&opset) {
        Ok(())
    } else {
        Err(ExportError::configuration(format!(
            "opset {opset} is not supported, expected {MIN_OPSET}..={MAX_OPSET}"
        )))
    }
}

/// Fails when `node` cannot be represented in `opset`.
pub fn check_node(node: &Node, opset: u32) -> Result<(), ExportError> {
    match required_opset(node) {
        Some(required) if required <= opset => Ok(()),
        _ => Err(ExportError::UnsupportedOperator {
            op_type: node.op_type.clone(),
            node: node.name.clone(),
            opset,
        }),
    }
}
