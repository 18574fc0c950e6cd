//! Task heads on top of the shared encoder.

use anyhow::Result;

use super::layers::gelu;
use super::{LayerKind, ModelAdapter, ModelConfig, ModelParameters, Task, encoder};
use crate::error::ExportError;
use crate::tracer::{Tracer, ValueId};

const CLASSIFIER: &str = "classifier";

/// Head layers of a task, in the order the forward pass reads them.
pub(super) fn layer_layout(config: &ModelConfig) -> Vec<(String, LayerKind)> {
    match config.task() {
        Task::TokenClassification => vec![(CLASSIFIER.to_string(), LayerKind::Linear)],
        Task::MaskedLm => {
            let head = config.family().mlm_head();
            vec![
                (head.dense.to_string(), LayerKind::Linear),
                (head.layer_norm.to_string(), LayerKind::LayerNorm),
                (head.decoder.to_string(), LayerKind::Linear),
            ]
        }
        Task::FeatureExtraction => Vec::new(),
    }
}

fn expect_task(parameters: &ModelParameters, task: Task) -> Result<()> {
    if parameters.config.task() != task {
        return Err(ExportError::configuration(format!(
            "{:?} parameters cannot drive a {task:?} model",
            parameters.config.architecture
        ))
        .into());
    }
    encoder::validate(parameters)
}

/// Per-token classification: `logits (batch, seq, num_labels)`.
#[derive(Debug, Clone)]
pub struct TokenClassification {
    parameters: ModelParameters,
}

impl TokenClassification {
    pub fn new(parameters: ModelParameters) -> Result<Self> {
        expect_task(&parameters, Task::TokenClassification)?;
        let config = &parameters.config;
        encoder::expect_linear(&parameters, CLASSIFIER, config.hidden_size, config.num_labels())?;
        Ok(Self { parameters })
    }

    pub fn labels(&self) -> &[String] {
        &self.parameters.config.labels
    }
}

impl ModelAdapter for TokenClassification {
    fn task(&self) -> Task {
        Task::TokenClassification
    }

    fn input_names(&self) -> &[&'static str] {
        self.parameters.config.family().input_names()
    }

    fn output_names(&self) -> &[&'static str] {
        Task::TokenClassification.output_names()
    }

    fn parameters(&self) -> &ModelParameters {
        &self.parameters
    }

    fn with_parameters(&self, parameters: ModelParameters) -> Result<Box<dyn ModelAdapter>> {
        Ok(Box::new(Self::new(parameters)?))
    }

    fn trace(&self, tracer: &mut Tracer, inputs: &[ValueId]) -> Result<Vec<ValueId>> {
        let hidden = encoder::trace(&self.parameters, tracer, inputs)?;
        let logits = tracer.scope(CLASSIFIER, |t| self.parameters.linear(CLASSIFIER)?.trace(t, CLASSIFIER, hidden))?;
        Ok(vec![logits])
    }
}

/// Masked language modelling: `logits (batch, seq, vocab_size)`.
#[derive(Debug, Clone)]
pub struct MaskedLm {
    parameters: ModelParameters,
}

impl MaskedLm {
    pub fn new(parameters: ModelParameters) -> Result<Self> {
        expect_task(&parameters, Task::MaskedLm)?;
        let config = &parameters.config;
        let head = config.family().mlm_head();
        encoder::expect_linear(&parameters, head.dense, config.hidden_size, config.hidden_size)?;
        encoder::expect_layer_norm(&parameters, head.layer_norm, config.hidden_size)?;
        encoder::expect_linear(&parameters, head.decoder, config.hidden_size, config.vocab_size)?;
        Ok(Self { parameters })
    }
}

impl ModelAdapter for MaskedLm {
    fn task(&self) -> Task {
        Task::MaskedLm
    }

    fn input_names(&self) -> &[&'static str] {
        self.parameters.config.family().input_names()
    }

    fn output_names(&self) -> &[&'static str] {
        Task::MaskedLm.output_names()
    }

    fn parameters(&self) -> &ModelParameters {
        &self.parameters
    }

    fn with_parameters(&self, parameters: ModelParameters) -> Result<Box<dyn ModelAdapter>> {
        Ok(Box::new(Self::new(parameters)?))
    }

    fn trace(&self, tracer: &mut Tracer, inputs: &[ValueId]) -> Result<Vec<ValueId>> {
        let hidden = encoder::trace(&self.parameters, tracer, inputs)?;
        let head = self.parameters.config.family().mlm_head();

        let logits = tracer.scope("lm_head", |t| {
            let transformed = self.parameters.linear(head.dense)?.trace(t, head.dense, hidden)?;
            let transformed = gelu(t, transformed)?;
            let transformed = self.parameters.layer_norm(head.layer_norm)?.trace(t, head.layer_norm, transformed)?;
            self.parameters.linear(head.decoder)?.trace(t, head.decoder, transformed)
        })?;
        Ok(vec![logits])
    }
}

/// Bare encoder: `last_hidden_state (batch, seq, hidden)`.
#[derive(Debug, Clone)]
pub struct FeatureExtraction {
    parameters: ModelParameters,
}

impl FeatureExtraction {
    pub fn new(parameters: ModelParameters) -> Result<Self> {
        expect_task(&parameters, Task::FeatureExtraction)?;
        Ok(Self { parameters })
    }
}

impl ModelAdapter for FeatureExtraction {
    fn task(&self) -> Task {
        Task::FeatureExtraction
    }

    fn input_names(&self) -> &[&'static str] {
        self.parameters.config.family().input_names()
    }

    fn output_names(&self) -> &[&'static str] {
        Task::FeatureExtraction.output_names()
    }

    fn parameters(&self) -> &ModelParameters {
        &self.parameters
    }

    fn with_parameters(&self, parameters: ModelParameters) -> Result<Box<dyn ModelAdapter>> {
        Ok(Box::new(Self::new(parameters)?))
    }

    fn trace(&self, tracer: &mut Tracer, inputs: &[ValueId]) -> Result<Vec<ValueId>> {
        Ok(vec![encoder::trace(&self.parameters, tracer, inputs)?])
    }
}
