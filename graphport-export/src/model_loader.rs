#[cfg(test)]
#[path = "../tests/unit/model_loader_test.rs"]
mod model_loader_test;

use anyhow::{Context, Result};
use log::{debug, info};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::config_loader::{ModelConfig, load_model_config};
use crate::error::ExportError;
use crate::kernels;
use crate::models::{Embedding, Layer, LayerKind, LayerNorm, Linear, ModelAdapter, ModelParameters, Task};
use crate::models::{create_model, layer_layout};
use crate::tensor::Tensor;
use crate::tensor_reader::TensorReader;

const WORD_EMBEDDINGS: &str = "embeddings.word_embeddings";

/// Loads `config.json` and the safetensors weights of a model directory into a ready adapter.
pub fn load_model(model_dir: &Path) -> Result<Box<dyn ModelAdapter>> {
    let config = load_model_config(model_dir)?;
    config.validate()?;

    let reader = TensorReader::new(model_dir)?;
    debug!("Tensor names: {:?}", reader.tensor_names()?);

    let parameters = load_parameters(&reader, config)
        .with_context(|| format!("Failed to load weights from {}", model_dir.display()))?;
    info!("Loaded {} layers", parameters.layers.len());

    create_model(parameters)
}

fn load_parameters(reader: &TensorReader, config: ModelConfig) -> Result<ModelParameters> {
    let loader = LayerLoader { reader, prefixes: [config.family().base_prefix()], eps: config.layer_norm_eps };
    let mlm_decoder = (config.task() == Task::MaskedLm).then(|| config.family().mlm_head());

    let mut layers = BTreeMap::new();
    for (name, kind) in layer_layout(&config) {
        let layer = match kind {
            LayerKind::Linear => match &mlm_decoder {
                Some(head) if name == head.decoder => Layer::Linear(loader.decoder(head.decoder, head.bias)?),
                _ => Layer::Linear(loader.linear(&name)?),
            },
            LayerKind::Embedding => Layer::Embedding(Embedding::new(loader.require(&format!("{name}.weight"))?)?),
            LayerKind::LayerNorm => Layer::LayerNorm(loader.layer_norm(&name)?),
        };
        layers.insert(name, layer);
    }

    Ok(ModelParameters::new(config, layers))
}

struct LayerLoader<'a> {
    reader: &'a TensorReader,
    prefixes: [&'static str; 1],
    eps: f32,
}

impl LayerLoader<'_> {
    fn find(&self, name: &str) -> Result<Option<Arc<Tensor>>> {
        Ok(self.reader.find(name, &self.prefixes)?.map(Arc::new))
    }

    fn require(&self, name: &str) -> Result<Arc<Tensor>> {
        self.find(name)?.ok_or_else(|| ExportError::configuration(format!("tensor '{name}' not found")).into())
    }

    /// Checkpoints store dense weights as `[out, in]`.
    fn linear(&self, name: &str) -> Result<Linear> {
        let weight = self.require(&format!("{name}.weight"))?;
        let bias = self.require(&format!("{name}.bias"))?;
        Linear::new(Arc::new(transpose_2d(&weight)?), bias)
    }

    /// The decoder falls back to the word embeddings and to the standalone head bias.
    fn decoder(&self, name: &str, head_bias: &str) -> Result<Linear> {
        let weight = match self.find(&format!("{name}.weight"))? {
            Some(weight) => weight,
            None => {
                debug!("Tying {name} to {WORD_EMBEDDINGS}");
                self.require(&format!("{WORD_EMBEDDINGS}.weight"))?
            }
        };
        let weight = transpose_2d(&weight)?;

        let bias = match self.find(&format!("{name}.bias"))? {
            Some(bias) => bias,
            None => match self.find(head_bias)? {
                Some(bias) => bias,
                None => {
                    let out_features = weight.shape().get(1).copied().unwrap_or_default();
                    Arc::new(Tensor::vector_f32(vec![0.0; out_features]))
                }
            },
        };
        Linear::new(Arc::new(weight), bias)
    }

    fn layer_norm(&self, name: &str) -> Result<LayerNorm> {
        let gamma = match self.find(&format!("{name}.weight"))? {
            Some(gamma) => gamma,
            None => self.require(&format!("{name}.gamma"))?,
        };
        let beta = match self.find(&format!("{name}.bias"))? {
            Some(beta) => beta,
            None => self.require(&format!("{name}.beta"))?,
        };
        LayerNorm::new(gamma, beta, self.eps)
    }
}

fn transpose_2d(tensor: &Tensor) -> Result<Tensor> {
    if tensor.rank() != 2 {
        return Err(ExportError::shape_mismatch(format!("expected a 2-D weight, got {:?}", tensor.shape())).into());
    }
    kernels::transpose(tensor, &[1, 0])
}
