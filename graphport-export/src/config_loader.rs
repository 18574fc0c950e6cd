#[cfg(test)]
#[path = "../tests/unit/config_loader_test.rs"]
mod config_loader_test;

use anyhow::{Context, Result};
use log::info;
use serde::Deserialize;
use std::{collections::BTreeMap, fs::File, io::Read, path::Path};

use crate::error::ExportError;
use crate::models::{ArchitectureId, ModelFamily, Task};

/// Architecture metadata of an encoder model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    pub architecture: ArchitectureId,
    pub hidden_size: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    pub intermediate_size: usize,
    pub vocab_size: usize,
    pub max_position_embeddings: usize,
    pub type_vocab_size: usize,
    pub layer_norm_eps: f32,
    pub pad_token_id: u32,
    /// Label names ordered by id; empty for heads without labels.
    pub labels: Vec<String>,
}

impl ModelConfig {
    pub fn family(&self) -> ModelFamily {
        self.architecture.family()
    }

    pub fn task(&self) -> Task {
        self.architecture.task()
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_heads
    }

    pub fn num_labels(&self) -> usize {
        self.labels.len()
    }

    /// First position id; RoBERTa skips the padding row and everything before it.
    pub fn position_offset(&self) -> usize {
        match self.family() {
            ModelFamily::Bert => 0,
            ModelFamily::Roberta => self.pad_token_id as usize + 1,
        }
    }

    /// Longest sequence the position table can embed.
    pub fn max_sequence_length(&self) -> usize {
        self.max_position_embeddings.saturating_sub(self.position_offset())
    }

    /// Checks the relations between dimensions that the encoder relies on.
    pub fn validate(&self) -> Result<(), ExportError> {
        let positive = [
            ("hidden_size", self.hidden_size),
            ("num_hidden_layers", self.num_layers),
            ("num_attention_heads", self.num_heads),
            ("intermediate_size", self.intermediate_size),
            ("vocab_size", self.vocab_size),
            ("max_position_embeddings", self.max_position_embeddings),
            ("type_vocab_size", self.type_vocab_size),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ExportError::configuration(format!("{name} must be positive")));
        }
        if self.hidden_size % self.num_heads != 0 {
            return Err(ExportError::configuration(format!(
                "hidden_size {} is not divisible by num_attention_heads {}",
                self.hidden_size, self.num_heads
            )));
        }
        if self.position_offset() >= self.max_position_embeddings {
            return Err(ExportError::configuration(format!(
                "position offset {} leaves no room in {} position embeddings",
                self.position_offset(),
                self.max_position_embeddings
            )));
        }
        if self.task() == Task::TokenClassification && self.labels.is_empty() {
            return Err(ExportError::configuration("token classification needs at least one label"));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct HFConfig {
    #[serde(default)]
    architectures: Option<Vec<String>>,
    #[serde(default)]
    model_type: Option<String>,
    hidden_size: usize,
    num_hidden_layers: usize,
    num_attention_heads: usize,
    intermediate_size: usize,
    vocab_size: usize,
    max_position_embeddings: usize,
    #[serde(default = "default_type_vocab_size")]
    type_vocab_size: usize,
    #[serde(default = "default_layer_norm_eps")]
    layer_norm_eps: f32,
    #[serde(default = "default_hidden_act")]
    hidden_act: String,
    #[serde(default)]
    pad_token_id: Option<u32>,
    #[serde(default)]
    id2label: Option<BTreeMap<String, String>>,
    #[serde(default)]
    num_labels: Option<usize>,
}

fn default_type_vocab_size() -> usize {
    2
}

fn default_layer_norm_eps() -> f32 {
    1e-12
}

fn default_hidden_act() -> String {
    "gelu".to_string()
}

/// Load model configuration from `config.json` in HuggingFace format.
pub fn load_model_config(model_dir: &Path) -> Result<ModelConfig> {
    let config_path = model_dir.join("config.json");
    let mut file = File::open(&config_path)
        .with_context(|| format!("Failed to open config.json at {}", config_path.display()))?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;

    let config = parse_model_config(&contents)?;

    info!("Model configuration loaded:");
    info!("   • Architecture: {:?}", config.architecture);
    info!("   • Hidden size: {}", config.hidden_size);
    info!("   • Layers: {}", config.num_layers);
    info!("   • Attention heads: {}", config.num_heads);
    info!("   • Intermediate size: {}", config.intermediate_size);
    info!("   • Vocabulary size: {}", config.vocab_size);
    info!("   • Max positions: {}", config.max_position_embeddings);
    if !config.labels.is_empty() {
        info!("   • Labels: {:?}", config.labels);
    }
    info!("");

    Ok(config)
}

/// Parses the contents of a `config.json` file.
pub fn parse_model_config(contents: &str) -> Result<ModelConfig> {
    let hf_config: HFConfig =
        serde_json::from_str(contents).map_err(|err| anyhow::anyhow!("Failed to parse config.json: {}", err))?;

    let architecture = match (hf_config.architectures.as_deref(), hf_config.model_type.as_deref()) {
        (Some([single]), _) => ArchitectureId::try_from(single.as_str())?,
        (Some(architectures), _) if architectures.len() > 1 => {
            anyhow::bail!("Multiple architectures are not supported: {architectures:?}")
        }
        (_, Some(model_type)) => ArchitectureId::from_model_type(model_type)?,
        _ => anyhow::bail!("Cannot determine architecture"),
    };

    if hf_config.hidden_act != "gelu" {
        return Err(ExportError::configuration(format!(
            "activation '{}' is not supported, only 'gelu' is",
            hf_config.hidden_act
        ))
        .into());
    }

    let labels = labels(hf_config.id2label.as_ref(), hf_config.num_labels, architecture.task())?;

    let config = ModelConfig {
        architecture,
        hidden_size: hf_config.hidden_size,
        num_layers: hf_config.num_hidden_layers,
        num_heads: hf_config.num_attention_heads,
        intermediate_size: hf_config.intermediate_size,
        vocab_size: hf_config.vocab_size,
        max_position_embeddings: hf_config.max_position_embeddings,
        type_vocab_size: hf_config.type_vocab_size,
        layer_norm_eps: hf_config.layer_norm_eps,
        pad_token_id: hf_config.pad_token_id.unwrap_or(architecture.family().default_pad_token_id()),
        labels,
    };
    config.validate()?;

    Ok(config)
}

/// Label names ordered by id. Only classification heads carry labels.
fn labels(id2label: Option<&BTreeMap<String, String>>, num_labels: Option<usize>, task: Task) -> Result<Vec<String>> {
    if task != Task::TokenClassification {
        return Ok(Vec::new());
    }

    match (id2label, num_labels) {
        (Some(id2label), _) if !id2label.is_empty() => {
            let mut indexed = id2label
                .iter()
                .map(|(id, label)| {
                    id.parse::<usize>()
                        .map(|id| (id, label.clone()))
                        .map_err(|_| anyhow::anyhow!("id2label key '{id}' is not an integer"))
                })
                .collect::<Result<Vec<_>>>()?;
            indexed.sort_by_key(|(id, _)| *id);

            if indexed.iter().enumerate().any(|(expected, (id, _))| expected != *id) {
                anyhow::bail!("id2label ids must be contiguous from 0, got {:?}", id2label.keys());
            }
            Ok(indexed.into_iter().map(|(_, label)| label).collect())
        }
        (_, Some(count)) => Ok((0..count).map(|i| format!("LABEL_{i}")).collect()),
        _ => Ok((0..2).map(|i| format!("LABEL_{i}")).collect()),
    }
}
