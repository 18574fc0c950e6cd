use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::ExportError;

pub const BATCH_AXIS: (usize, &str) = (0, "batch");
pub const SEQUENCE_AXIS: (usize, &str) = (1, "seq");

/// Declares which tensor dimensions stay symbolic in the exported graph.
///
/// Maps a tensor name to `{dimension index -> symbolic name}`. Dimensions not
/// listed are fixed to the size they had during the trace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DynamicAxisSpec(BTreeMap<String, BTreeMap<usize, String>>);

impl DynamicAxisSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// The same axis mapping applied to every tensor in `tensors`.
    pub fn uniform<'a>(tensors: impl IntoIterator<Item = &'a str>, axes: &[(usize, &str)]) -> Self {
        let axes: BTreeMap<usize, String> = axes.iter().map(|&(axis, name)| (axis, name.to_string())).collect();
        Self(tensors.into_iter().map(|tensor| (tensor.to_string(), axes.clone())).collect())
    }

    /// `{0: "batch", 1: "seq"}` on every tensor in `tensors`.
    pub fn batch_and_sequence<'a>(tensors: impl IntoIterator<Item = &'a str>) -> Self {
        Self::uniform(tensors, &[BATCH_AXIS, SEQUENCE_AXIS])
    }

    pub fn with_axis(mut self, tensor: &str, axis: usize, name: &str) -> Self {
        self.insert(tensor, axis, name);
        self
    }

    pub fn insert(&mut self, tensor: &str, axis: usize, name: &str) {
        self.0.entry(tensor.to_string()).or_default().insert(axis, name.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn tensor_names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn axes(&self, tensor: &str) -> Option<&BTreeMap<usize, String>> {
        self.0.get(tensor)
    }

    pub fn symbol(&self, tensor: &str, axis: usize) -> Option<&str> {
        self.0.get(tensor).and_then(|axes| axes.get(&axis)).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &BTreeMap<usize, String>)> {
        self.0.iter().map(|(name, axes)| (name.as_str(), axes))
    }

    /// Every referenced tensor must be one of `known`, and every symbolic name non-empty.
    pub fn validate_names(&self, known: &[&str]) -> Result<(), ExportError> {
        for (tensor, axes) in &self.0 {
            if !known.contains(&tensor.as_str()) {
                return Err(ExportError::invalid_axis(
                    tensor,
                    format!("not a declared input or output (known: {known:?})"),
                ));
            }
            if let Some((axis, _)) = axes.iter().find(|(_, name)| name.trim().is_empty()) {
                return Err(ExportError::invalid_axis(tensor, format!("axis {axis} has an empty symbolic name")));
            }
        }
        Ok(())
    }

    /// Every referenced axis of `tensor` must exist in a tensor of rank `rank`.
    pub fn validate_rank(&self, tensor: &str, rank: usize) -> Result<(), ExportError> {
        match self.0.get(tensor).and_then(|axes| axes.keys().find(|&&axis| axis >= rank)) {
            Some(axis) => Err(ExportError::invalid_axis(tensor, format!("axis {axis} out of range for rank {rank}"))),
            None => Ok(()),
        }
    }
}
