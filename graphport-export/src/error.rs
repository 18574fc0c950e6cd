use thiserror::Error;

/// Failures that abort an export run.
///
/// Every pipeline function returns `anyhow::Result`, so callers that need to
/// react to a specific failure use `err.downcast_ref::<ExportError>()`.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExportError {
    /// Invalid padding policy, unsupported opset and similar option errors.
    /// Always raised before any model evaluation.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid dynamic axis spec for tensor '{tensor}': {reason}")]
    InvalidAxisSpec { tensor: String, reason: String },

    #[error("operator '{op_type}' (node '{node}') has no representation in opset {opset}")]
    UnsupportedOperator { op_type: String, node: String, opset: u32 },

    #[error("layer '{layer}' of kind {kind} cannot be quantized")]
    UnsupportedLayer { layer: String, kind: String },

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
}

impl ExportError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn shape_mismatch(message: impl Into<String>) -> Self {
        Self::ShapeMismatch(message.into())
    }

    pub fn invalid_axis(tensor: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidAxisSpec { tensor: tensor.into(), reason: reason.into() }
    }

    /// True for the errors that are detected before the model runs.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::InvalidAxisSpec { .. })
    }
}

/// Extracts the typed export error from an `anyhow` chain, if there is one.
pub fn export_error(err: &anyhow::Error) -> Option<&ExportError> {
    err.chain().find_map(|cause| cause.downcast_ref::<ExportError>())
}
