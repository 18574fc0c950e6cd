use anyhow::Result;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::config_loader::ModelConfig;
use crate::error::ExportError;
use crate::tensor::Tensor;
use crate::tokenizer_adapter::EncodedBatch;
use crate::tracer::{Tracer, ValueId};

mod encoder;
mod heads;
mod layers;

pub use heads::{FeatureExtraction, MaskedLm, TokenClassification};
pub use layers::{Embedding, LayerNorm, Linear, QuantizedWeight, Weight};

pub const INPUT_IDS: &str = "input_ids";
pub const ATTENTION_MASK: &str = "attention_mask";
pub const TOKEN_TYPE_IDS: &str = "token_type_ids";

/// Architecture name as found in `config.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchitectureId {
    BertModel,
    BertForTokenClassification,
    BertForMaskedLM,
    RobertaModel,
    RobertaForTokenClassification,
    RobertaForMaskedLM,
}

impl TryFrom<&str> for ArchitectureId {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self> {
        match value {
            "BertModel" => Ok(Self::BertModel),
            "BertForTokenClassification" => Ok(Self::BertForTokenClassification),
            "BertForMaskedLM" => Ok(Self::BertForMaskedLM),
            "RobertaModel" | "XLMRobertaModel" => Ok(Self::RobertaModel),
            "RobertaForTokenClassification" | "XLMRobertaForTokenClassification" => {
                Ok(Self::RobertaForTokenClassification)
            }
            "RobertaForMaskedLM" | "XLMRobertaForMaskedLM" => Ok(Self::RobertaForMaskedLM),
            _ => Err(ExportError::configuration(format!("unknown architecture: {value}")).into()),
        }
    }
}

impl ArchitectureId {
    /// Bare backbone for a `model_type` when `architectures` is absent.
    pub fn from_model_type(model_type: &str) -> Result<Self> {
        match model_type {
            "bert" => Ok(Self::BertModel),
            "roberta" | "xlm-roberta" => Ok(Self::RobertaModel),
            _ => Err(ExportError::configuration(format!("unknown model type: {model_type}")).into()),
        }
    }

    pub fn family(self) -> ModelFamily {
        match self {
            Self::BertModel | Self::BertForTokenClassification | Self::BertForMaskedLM => ModelFamily::Bert,
            Self::RobertaModel | Self::RobertaForTokenClassification | Self::RobertaForMaskedLM => ModelFamily::Roberta,
        }
    }

    pub fn task(self) -> Task {
        match self {
            Self::BertModel | Self::RobertaModel => Task::FeatureExtraction,
            Self::BertForTokenClassification | Self::RobertaForTokenClassification => Task::TokenClassification,
            Self::BertForMaskedLM | Self::RobertaForMaskedLM => Task::MaskedLm,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    Bert,
    Roberta,
}

/// Names of the masked language modelling head layers.
pub struct MlmHeadLayers {
    pub dense: &'static str,
    pub layer_norm: &'static str,
    pub decoder: &'static str,
    /// Standalone decoder bias, used when the decoder has none of its own.
    pub bias: &'static str,
}

impl ModelFamily {
    pub fn input_names(self) -> &'static [&'static str] {
        match self {
            Self::Bert => &[INPUT_IDS, ATTENTION_MASK, TOKEN_TYPE_IDS],
            Self::Roberta => &[INPUT_IDS, ATTENTION_MASK],
        }
    }

    pub fn uses_token_type_ids(self) -> bool {
        self.input_names().contains(&TOKEN_TYPE_IDS)
    }

    pub fn default_pad_token_id(self) -> u32 {
        match self {
            Self::Bert => 0,
            Self::Roberta => 1,
        }
    }

    /// Prefix of the backbone weights inside task checkpoints.
    pub fn base_prefix(self) -> &'static str {
        match self {
            Self::Bert => "bert.",
            Self::Roberta => "roberta.",
        }
    }

    pub fn mlm_head(self) -> MlmHeadLayers {
        match self {
            Self::Bert => MlmHeadLayers {
                dense: "cls.predictions.transform.dense",
                layer_norm: "cls.predictions.transform.LayerNorm",
                decoder: "cls.predictions.decoder",
                bias: "cls.predictions.bias",
            },
            Self::Roberta => MlmHeadLayers {
                dense: "lm_head.dense",
                layer_norm: "lm_head.layer_norm",
                decoder: "lm_head.decoder",
                bias: "lm_head.bias",
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    TokenClassification,
    MaskedLm,
    FeatureExtraction,
}

impl Task {
    pub fn output_names(self) -> &'static [&'static str] {
        match self {
            Self::TokenClassification | Self::MaskedLm => &["logits"],
            Self::FeatureExtraction => &["last_hidden_state"],
        }
    }
}

/// Kind of a parameterized layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LayerKind {
    Linear,
    Embedding,
    LayerNorm,
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Linear => "Linear",
            Self::Embedding => "Embedding",
            Self::LayerNorm => "LayerNorm",
        };
        f.write_str(name)
    }
}

impl FromStr for LayerKind {
    type Err = ExportError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "linear" => Ok(Self::Linear),
            "embedding" => Ok(Self::Embedding),
            "layernorm" | "layer_norm" | "layer-norm" => Ok(Self::LayerNorm),
            _ => Err(ExportError::configuration(format!("unknown layer kind: {value}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Layer {
    Linear(Linear),
    Embedding(Embedding),
    LayerNorm(LayerNorm),
}

impl Layer {
    pub fn kind(&self) -> LayerKind {
        match self {
            Self::Linear(_) => LayerKind::Linear,
            Self::Embedding(_) => LayerKind::Embedding,
            Self::LayerNorm(_) => LayerKind::LayerNorm,
        }
    }
}

/// Named layers plus the architecture they belong to.
///
/// Tensors are shared: cloning the parameters or deriving quantized ones from
/// them never copies weights that stay unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelParameters {
    pub config: ModelConfig,
    pub layers: BTreeMap<String, Layer>,
}

impl ModelParameters {
    pub fn new(config: ModelConfig, layers: BTreeMap<String, Layer>) -> Self {
        Self { config, layers }
    }

    pub fn layer(&self, name: &str) -> Result<&Layer> {
        self.layers.get(name).ok_or_else(|| anyhow::anyhow!("Layer '{name}' not found"))
    }

    pub fn linear(&self, name: &str) -> Result<&Linear> {
        match self.layer(name)? {
            Layer::Linear(linear) => Ok(linear),
            other => anyhow::bail!("Layer '{name}' is a {}, expected Linear", other.kind()),
        }
    }

    pub fn embedding(&self, name: &str) -> Result<&Embedding> {
        match self.layer(name)? {
            Layer::Embedding(embedding) => Ok(embedding),
            other => anyhow::bail!("Layer '{name}' is a {}, expected Embedding", other.kind()),
        }
    }

    pub fn layer_norm(&self, name: &str) -> Result<&LayerNorm> {
        match self.layer(name)? {
            Layer::LayerNorm(norm) => Ok(norm),
            other => anyhow::bail!("Layer '{name}' is a {}, expected LayerNorm", other.kind()),
        }
    }

    /// Number of layers whose weights are stored as int8.
    pub fn quantized_layer_count(&self) -> usize {
        self.layers
            .values()
            .filter(|layer| match layer {
                Layer::Linear(linear) => linear.weight.is_quantized(),
                Layer::Embedding(embedding) => embedding.weight.is_quantized(),
                Layer::LayerNorm(_) => false,
            })
            .count()
    }
}

impl fmt::Debug for dyn ModelAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelAdapter")
            .field("inputs", &self.input_names())
            .field("outputs", &self.output_names())
            .finish_non_exhaustive()
    }
}

/// A trained network seen as a pure function from named inputs to named outputs.
pub trait ModelAdapter: Send + Sync {
    fn task(&self) -> Task;

    /// Declared inputs, in the order the graph consumes them.
    fn input_names(&self) -> &[&'static str];

    fn output_names(&self) -> &[&'static str];

    fn parameters(&self) -> &ModelParameters;

    /// The same architecture over other parameters.
    fn with_parameters(&self, parameters: ModelParameters) -> Result<Box<dyn ModelAdapter>>;

    /// Runs the forward computation on `inputs` (one per declared input) and
    /// returns one value per declared output.
    fn trace(&self, tracer: &mut Tracer, inputs: &[ValueId]) -> Result<Vec<ValueId>>;

    /// Eager evaluation of the forward computation.
    fn forward(&self, batch: &EncodedBatch) -> Result<BTreeMap<String, Tensor>> {
        let mut tracer = Tracer::eager();
        let inputs = bind_inputs(&mut tracer, self.input_names(), batch, |_| None)?;
        let outputs = self.trace(&mut tracer, &inputs)?;

        Ok(self
            .output_names()
            .iter()
            .zip(outputs)
            .map(|(name, id)| (name.to_string(), tracer.tensor(id).clone()))
            .collect())
    }
}

/// Registers the batch fields as tracer inputs in declared order.
///
/// The batch must carry exactly the declared inputs.
pub fn bind_inputs<'a>(
    tracer: &mut Tracer,
    input_names: &[&str],
    batch: &EncodedBatch,
    dynamic: impl Fn(&str) -> Option<&'a BTreeMap<usize, String>>,
) -> Result<Vec<ValueId>> {
    let provided = batch.field_names();
    if provided.len() != input_names.len() || input_names.iter().any(|name| !provided.contains(name)) {
        return Err(ExportError::shape_mismatch(format!(
            "model expects inputs {input_names:?}, batch provides {provided:?}"
        ))
        .into());
    }

    input_names
        .iter()
        .map(|&name| {
            let tensor = batch.field(name).ok_or_else(|| ExportError::shape_mismatch(format!("missing input {name}")))?;
            Ok(tracer.input(name, tensor.clone(), dynamic(name)))
        })
        .collect()
}

/// Every layer the configured architecture reads, backbone first.
pub fn layer_layout(config: &ModelConfig) -> Vec<(String, LayerKind)> {
    let mut layout = encoder::layer_layout(config.num_layers);
    layout.extend(heads::layer_layout(config));
    layout
}

/// Picks the adapter variant that matches the configured task.
pub fn create_model(parameters: ModelParameters) -> Result<Box<dyn ModelAdapter>> {
    parameters.config.validate()?;

    Ok(match parameters.config.task() {
        Task::TokenClassification => Box::new(TokenClassification::new(parameters)?),
        Task::MaskedLm => Box::new(MaskedLm::new(parameters)?),
        Task::FeatureExtraction => Box::new(FeatureExtraction::new(parameters)?),
    })
}
