//! # graphport-export
//!
//! A Rust library for exporting BERT-family encoders from HuggingFace format
//! to a static, portable computation graph bundled with its tokenizer.
//!
//! ## Examples
//!
//! ### Exporting a model
//!
//! ```rust,no_run
//! use graphport_export::{ExportOptions, QuantizationTarget, export_model};
//!
//! # fn main() -> anyhow::Result<()> {
//! let options = ExportOptions::builder()
//!     .opset_version(Some(13))
//!     .quantization(Some(QuantizationTarget::Int8))
//!     .build()?;
//!
//! let report = export_model("path/to/huggingface/model", "output/bundle", &options)?;
//! println!("{} bytes written to {}", report.size_bytes, report.graph_path.display());
//! # Ok(())
//! # }
//! ```

pub mod config_loader;
pub mod dynamic_axes;
pub mod error;
pub mod graph;
pub mod graph_exporter;
pub mod kernels;
pub mod model_loader;
pub mod models;
pub mod opset;
pub mod packager;
pub mod quantization;
pub mod tensor;
mod tensor_reader;
pub mod tokenizer_adapter;
pub mod tracer;
mod utils;

#[cfg(test)]
#[path = "../tests/unit/fixtures.rs"]
mod fixtures;

pub use config_loader::{ModelConfig, load_model_config, parse_model_config};
pub use dynamic_axes::DynamicAxisSpec;
pub use error::{ExportError, export_error};
pub use graph::{ExportedGraph, GraphMetadata};
pub use graph_exporter::GraphExporter;
pub use model_loader::load_model;
pub use models::{ModelAdapter, ModelParameters, Task, create_model};
pub use packager::package;
pub use quantization::{QuantizationConfig, QuantizationTarget, quantize};
pub use tensor::{DType, Tensor};
pub use tokenizer_adapter::{EncodedBatch, PaddingPolicy, Sequence, TokenizerAdapter, TokenizerOptions};

use anyhow::{Context, Result};
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};

use crate::models::TOKEN_TYPE_IDS;

/// Default sample sentence traced when none is given.
pub const DEFAULT_SAMPLE_TEXT: &str = "Jan Kowalski lives in Krakow.";
pub const DEFAULT_GRAPH_FILE_NAME: &str = "model.graph";

/// Settings of one export run.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportOptions {
    pub padding_policy: PaddingPolicy,
    pub opset_version: u32,
    pub quantization: QuantizationConfig,
    /// Upper bound on encoded sample length.
    pub max_length: Option<usize>,
    pub sample_texts: Vec<String>,
    pub sample_pairs: Vec<(String, String)>,
    /// `None` marks `{0: "batch", 1: "seq"}` on every declared input and output.
    pub dynamic_axes: Option<DynamicAxisSpec>,
    pub add_special_tokens: bool,
    pub graph_file_name: String,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            padding_policy: PaddingPolicy::LongestInBatch,
            opset_version: opset::DEFAULT_OPSET,
            quantization: QuantizationConfig::default(),
            max_length: None,
            sample_texts: vec![DEFAULT_SAMPLE_TEXT.to_string()],
            sample_pairs: Vec::new(),
            dynamic_axes: None,
            add_special_tokens: true,
            graph_file_name: DEFAULT_GRAPH_FILE_NAME.to_string(),
        }
    }
}

impl ExportOptions {
    pub fn builder() -> ExportOptionsBuilder {
        ExportOptionsBuilder::default()
    }

    /// Checks every option that can be checked without loading the model.
    pub fn validate(&self) -> Result<(), ExportError> {
        opset::validate_opset(self.opset_version)?;
        self.padding_policy.validate()?;
        if self.sample_texts.is_empty() && self.sample_pairs.is_empty() {
            return Err(ExportError::configuration("at least one sample text is needed to trace the model"));
        }
        if self.graph_file_name.trim().is_empty() {
            return Err(ExportError::configuration("graph file name is empty"));
        }
        Ok(())
    }

    fn sequences(&self) -> Vec<Sequence> {
        self.sample_texts
            .iter()
            .map(Sequence::single)
            .chain(self.sample_pairs.iter().map(|(first, second)| Sequence::pair(first, second)))
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct ExportOptionsBuilder {
    padding_policy: Option<PaddingPolicy>,
    opset_version: Option<u32>,
    quantization: Option<QuantizationTarget>,
    strict_quantization: Option<bool>,
    max_length: Option<usize>,
    sample_texts: Vec<String>,
    sample_pairs: Vec<(String, String)>,
    dynamic_axes: Option<DynamicAxisSpec>,
    add_special_tokens: Option<bool>,
    graph_file_name: Option<String>,
}

impl ExportOptionsBuilder {
    pub fn padding_policy(mut self, policy: Option<PaddingPolicy>) -> Self {
        self.padding_policy = policy;
        self
    }
    pub fn opset_version(mut self, opset: Option<u32>) -> Self {
        self.opset_version = opset;
        self
    }
    pub fn quantization(mut self, target: Option<QuantizationTarget>) -> Self {
        self.quantization = target;
        self
    }
    pub fn strict_quantization(mut self, strict: Option<bool>) -> Self {
        self.strict_quantization = strict;
        self
    }
    pub fn max_length(mut self, max_length: Option<usize>) -> Self {
        self.max_length = max_length;
        self
    }
    pub fn sample_text(mut self, text: impl Into<String>) -> Self {
        self.sample_texts.push(text.into());
        self
    }
    pub fn sample_pair(mut self, first: impl Into<String>, second: impl Into<String>) -> Self {
        self.sample_pairs.push((first.into(), second.into()));
        self
    }
    pub fn dynamic_axes(mut self, dynamic_axes: DynamicAxisSpec) -> Self {
        self.dynamic_axes = Some(dynamic_axes);
        self
    }
    pub fn add_special_tokens(mut self, add: Option<bool>) -> Self {
        self.add_special_tokens = add;
        self
    }
    pub fn graph_file_name(mut self, name: impl Into<String>) -> Self {
        self.graph_file_name = Some(name.into());
        self
    }
    pub fn build(self) -> Result<ExportOptions, ExportError> {
        let defaults = ExportOptions::default();
        let quantization = QuantizationConfig {
            target: self.quantization.unwrap_or_default(),
            strict: self.strict_quantization.unwrap_or(false),
            ..QuantizationConfig::default()
        };
        let sample_texts = if self.sample_texts.is_empty() && self.sample_pairs.is_empty() {
            defaults.sample_texts
        } else {
            self.sample_texts
        };

        let options = ExportOptions {
            padding_policy: self.padding_policy.unwrap_or(defaults.padding_policy),
            opset_version: self.opset_version.unwrap_or(defaults.opset_version),
            quantization,
            max_length: self.max_length,
            sample_texts,
            sample_pairs: self.sample_pairs,
            dynamic_axes: self.dynamic_axes,
            add_special_tokens: self.add_special_tokens.unwrap_or(defaults.add_special_tokens),
            graph_file_name: self.graph_file_name.unwrap_or(defaults.graph_file_name),
        };
        options.validate()?;
        Ok(options)
    }
}

/// Sample length bound by the position table, failing when a requested length exceeds it.
fn sample_length_limit(options: &ExportOptions, config: &ModelConfig) -> Result<usize, ExportError> {
    let limit = config.max_sequence_length();
    let fixed_length = match options.padding_policy {
        PaddingPolicy::FixedLength(length) => Some(length),
        _ => None,
    };
    if let Some(length) = fixed_length.into_iter().chain(options.max_length).find(|&length| length > limit) {
        return Err(ExportError::configuration(format!(
            "sample length {length} exceeds the {limit} positions the model can embed"
        )));
    }
    Ok(options.max_length.unwrap_or(limit))
}

/// What an export run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportReport {
    pub graph_path: PathBuf,
    pub size_bytes: u64,
    pub input_names: Vec<String>,
    pub output_names: Vec<String>,
}

/// Exports the model in `model_dir` into an artifact bundle in `output_dir`.
///
/// That is:
/// - load `config.json`, the safetensors weights and the tokenizer
/// - encode the sample texts into a representative batch
/// - optionally quantize dense layers to int8
/// - trace the model into a static graph written as `output_dir/model.graph`
/// - persist the tokenizer files next to it
///
/// On failure no file written by this run is left in `output_dir`.
pub fn export_model(
    model_dir: impl AsRef<Path>,
    output_dir: impl AsRef<Path>,
    options: &ExportOptions,
) -> Result<ExportReport> {
    let (model_dir, output_dir) = (model_dir.as_ref(), output_dir.as_ref());

    options.validate()?;
    let exporter = GraphExporter::new(options.opset_version)?;

    info!("🚀 Starting model export...");
    info!("📁 Model directory: {}", model_dir.display());
    info!("💾 Output directory: {}", output_dir.display());
    info!("");

    let model = load_model(model_dir)?;

    info!("🔤 Loading tokenizer...");
    let tokenizer_options = TokenizerOptions {
        return_token_type_ids: model.input_names().contains(&TOKEN_TYPE_IDS),
        max_length: Some(sample_length_limit(options, &model.parameters().config)?),
    };
    let tokenizer = TokenizerAdapter::from_dir(model_dir, tokenizer_options)?;
    let sample = tokenizer.encode(&options.sequences(), options.padding_policy, options.add_special_tokens)?;
    info!("   • Sample batch: {} x {} ({})", sample.batch_size(), sample.sequence_length(), options.padding_policy);
    info!("");

    let model = if options.quantization.target == QuantizationTarget::Disabled {
        model
    } else {
        info!("🧮 Quantizing model to {}...", options.quantization.target);
        quantize(model.as_ref(), &options.quantization)?
    };

    let dynamic_axes = match &options.dynamic_axes {
        Some(dynamic_axes) => dynamic_axes.clone(),
        None => DynamicAxisSpec::batch_and_sequence(model.input_names().iter().chain(model.output_names()).copied()),
    };

    fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create output directory {}", output_dir.display()))?;
    let graph_path = output_dir.join(&options.graph_file_name);

    info!("🕸️ Exporting graph...");
    let graph = exporter.export(model.as_ref(), &sample, &dynamic_axes, &graph_path)?;
    info!("");

    info!("📦 Packaging tokenizer...");
    let new_files: Vec<PathBuf> = TokenizerAdapter::FILE_NAMES
        .iter()
        .map(|name| output_dir.join(name))
        .filter(|path| !path.exists())
        .collect();
    if let Err(err) = package(&graph_path, &tokenizer, output_dir) {
        for path in std::iter::once(&graph_path).chain(new_files.iter().filter(|path| path.is_file())) {
            if let Err(remove_err) = fs::remove_file(path) {
                warn!("Failed to remove {}: {remove_err}", path.display());
            }
        }
        return Err(err);
    }

    let size_bytes = fs::metadata(&graph_path)?.len();
    info!("");
    info!("✅ Export finished: {} ({size_bytes} bytes)", graph_path.display());

    Ok(ExportReport {
        graph_path,
        size_bytes,
        input_names: graph.input_names().into_iter().map(str::to_string).collect(),
        output_names: graph.output_names().into_iter().map(str::to_string).collect(),
    })
}
