#[cfg(test)]
#[path = "../tests/unit/tokenizer_adapter_test.rs"]
mod tokenizer_adapter_test;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde_json::{Map, Value};
use std::{
    fmt,
    fs::{self, File},
    io::Read,
    path::Path,
    str::FromStr,
};
use tokenizers::{
    EncodeInput, Encoding, PaddingDirection, PaddingParams, PaddingStrategy, PostProcessor, Tokenizer, TruncationParams,
};

use crate::error::ExportError;
use crate::models::{ATTENTION_MASK, INPUT_IDS, TOKEN_TYPE_IDS};
use crate::tensor::Tensor;

/// How examples of different lengths are brought to one sequence length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PaddingPolicy {
    /// No padding; every example must already have the same length.
    None,
    /// Pad to the longest example of the batch.
    #[default]
    LongestInBatch,
    /// Truncate, then pad, to exactly this many tokens.
    FixedLength(usize),
}

impl PaddingPolicy {
    /// Parses a policy name; `fixed-length` takes its length from `max_length`.
    pub fn parse(name: &str, max_length: Option<usize>) -> Result<Self, ExportError> {
        match name.parse::<Self>()? {
            Self::FixedLength(_) => match max_length {
                Some(0) => Err(ExportError::configuration("fixed-length padding needs a length above zero")),
                Some(length) => Ok(Self::FixedLength(length)),
                None => Err(ExportError::configuration("fixed-length padding needs a length")),
            },
            policy => Ok(policy),
        }
    }

    pub fn validate(self) -> Result<(), ExportError> {
        match self {
            Self::FixedLength(0) => Err(ExportError::configuration("fixed-length padding needs a length above zero")),
            _ => Ok(()),
        }
    }
}

impl FromStr for PaddingPolicy {
    type Err = ExportError;

    /// `fixed-length` parses with a placeholder length; see [`PaddingPolicy::parse`].
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "none" => Ok(Self::None),
            "longest-in-batch" | "longest" => Ok(Self::LongestInBatch),
            "fixed-length" => Ok(Self::FixedLength(0)),
            _ => Err(ExportError::configuration(format!(
                "unknown padding policy '{value}', expected none, longest-in-batch or fixed-length"
            ))),
        }
    }
}

impl fmt::Display for PaddingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::LongestInBatch => f.write_str("longest-in-batch"),
            Self::FixedLength(length) => write!(f, "fixed-length({length})"),
        }
    }
}

/// One example to encode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sequence {
    Single(String),
    Pair(String, String),
}

impl Sequence {
    pub fn single(text: impl Into<String>) -> Self {
        Self::Single(text.into())
    }

    pub fn pair(first: impl Into<String>, second: impl Into<String>) -> Self {
        Self::Pair(first.into(), second.into())
    }

    fn to_input(&self) -> EncodeInput<'_> {
        match self {
            Self::Single(text) => EncodeInput::Single(text.as_str().into()),
            Self::Pair(first, second) => EncodeInput::Dual(first.as_str().into(), second.as_str().into()),
        }
    }
}

/// Integer model inputs, all shaped `(batch, sequence_length)`.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedBatch {
    pub input_ids: Tensor,
    pub attention_mask: Tensor,
    pub token_type_ids: Option<Tensor>,
}

impl EncodedBatch {
    pub fn new(input_ids: Tensor, attention_mask: Tensor, token_type_ids: Option<Tensor>) -> Result<Self> {
        let shape = input_ids.shape();
        let consistent = shape.len() == 2
            && attention_mask.shape() == shape
            && token_type_ids.as_ref().is_none_or(|types| types.shape() == shape);
        if !consistent {
            return Err(ExportError::shape_mismatch(format!(
                "batch tensors disagree: input_ids {:?}, attention_mask {:?}, token_type_ids {:?}",
                shape,
                attention_mask.shape(),
                token_type_ids.as_ref().map(Tensor::shape)
            ))
            .into());
        }
        Ok(Self { input_ids, attention_mask, token_type_ids })
    }

    pub fn batch_size(&self) -> usize {
        self.input_ids.shape()[0]
    }

    pub fn sequence_length(&self) -> usize {
        self.input_ids.shape()[1]
    }

    /// Names of the present fields, in canonical order.
    pub fn field_names(&self) -> Vec<&'static str> {
        let mut names = vec![INPUT_IDS, ATTENTION_MASK];
        if self.token_type_ids.is_some() {
            names.push(TOKEN_TYPE_IDS);
        }
        names
    }

    pub fn field(&self, name: &str) -> Option<&Tensor> {
        match name {
            INPUT_IDS => Some(&self.input_ids),
            ATTENTION_MASK => Some(&self.attention_mask),
            TOKEN_TYPE_IDS => self.token_type_ids.as_ref(),
            _ => None,
        }
    }

    /// Rows whose attention mask has no valid position.
    pub fn fully_masked_rows(&self) -> Result<Vec<usize>> {
        let width = self.sequence_length();
        if width == 0 {
            return Ok((0..self.batch_size()).collect());
        }
        Ok(self
            .attention_mask
            .as_i64()?
            .chunks(width)
            .enumerate()
            .filter(|(_, row)| row.iter().all(|&m| m == 0))
            .map(|(i, _)| i)
            .collect())
    }
}

/// Per-model tokenizer settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizerOptions {
    /// Whether batches carry `token_type_ids`.
    pub return_token_type_ids: bool,
    /// Upper bound on encoded length for policies without their own length.
    pub max_length: Option<usize>,
}

impl Default for TokenizerOptions {
    fn default() -> Self {
        Self { return_token_type_ids: true, max_length: None }
    }
}

/// Vocabulary plus encoding rules, loaded from a `tokenizer.json`.
#[derive(Clone)]
pub struct TokenizerAdapter {
    tokenizer: Tokenizer,
    config: Option<Map<String, Value>>,
    options: TokenizerOptions,
}

impl fmt::Debug for TokenizerAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenizerAdapter")
            .field("vocab_size", &self.vocab_size())
            .field("has_config", &self.config.is_some())
            .field("options", &self.options)
            .finish()
    }
}

impl TokenizerAdapter {
    pub const TOKENIZER_FILE_NAME: &'static str = "tokenizer.json";
    pub const TOKENIZER_CONFIG_FILE_NAME: &'static str = "tokenizer_config.json";
    pub const SPECIAL_TOKENS_MAP_FILE_NAME: &'static str = "special_tokens_map.json";
    /// Every file [`TokenizerAdapter::persist`] writes.
    pub const FILE_NAMES: [&'static str; 3] =
        [Self::TOKENIZER_FILE_NAME, Self::TOKENIZER_CONFIG_FILE_NAME, Self::SPECIAL_TOKENS_MAP_FILE_NAME];

    const WELL_KNOWN_PAD_TOKENS: &'static [&'static str] = &["[PAD]", "<pad>"];
    const SPECIAL_TOKEN_KEYS: &'static [&'static str] =
        &["bos_token", "eos_token", "unk_token", "sep_token", "pad_token", "cls_token", "mask_token"];
    #[rustfmt::skip]
    const WELL_KNOWN_SPECIAL_TOKENS: &'static [(&'static str, &'static [&'static str])] = &[
        ("bos_token", &["<s>"]),
        ("eos_token", &["</s>"]),
        ("unk_token", &["[UNK]", "<unk>"]),
        ("sep_token", &["[SEP]", "</s>"]),
        ("pad_token", &["[PAD]", "<pad>"]),
        ("cls_token", &["[CLS]", "<s>"]),
        ("mask_token", &["[MASK]", "<mask>"]),
    ];

    pub fn new(tokenizer: Tokenizer, config: Option<Map<String, Value>>, options: TokenizerOptions) -> Self {
        Self { tokenizer, config, options }
    }

    /// Loads `tokenizer.json` and, when present, `tokenizer_config.json` from `dir`.
    pub fn from_dir(dir: &Path, options: TokenizerOptions) -> Result<Self> {
        let tokenizer_path = dir.join(Self::TOKENIZER_FILE_NAME);
        if !tokenizer_path.exists() {
            anyhow::bail!("tokenizer.json not found in model directory: {}", dir.display());
        }

        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|err| anyhow::anyhow!("Failed to load tokenizer from {}: {err}", tokenizer_path.display()))?;

        let config_path = dir.join(Self::TOKENIZER_CONFIG_FILE_NAME);
        let config = if config_path.exists() {
            match load_json_file(&config_path)? {
                Value::Object(object) => Some(object),
                other => anyhow::bail!("tokenizer_config.json must hold an object, found {other}"),
            }
        } else {
            warn!("tokenizer_config.json not found, special tokens come from tokenizer.json only");
            None
        };

        let adapter = Self::new(tokenizer, config, options);
        info!("📊 Found {} tokens in vocabulary", adapter.vocab_size());
        Ok(adapter)
    }

    pub fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }

    pub fn return_token_type_ids(&self) -> bool {
        self.options.return_token_type_ids
    }

    pub fn options(&self) -> &TokenizerOptions {
        &self.options
    }

    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.tokenizer.token_to_id(token)
    }

    /// The `tokenizer_config.json` object as loaded.
    pub fn config(&self) -> Option<&Map<String, Value>> {
        self.config.as_ref()
    }

    /// Padding token and its id.
    pub fn pad_token(&self) -> Result<(String, u32), ExportError> {
        if let Some(padding) = self.tokenizer.get_padding() {
            return Ok((padding.pad_token.clone(), padding.pad_id));
        }

        let configured = self.config_token("pad_token");
        configured
            .iter()
            .map(String::as_str)
            .chain(Self::WELL_KNOWN_PAD_TOKENS.iter().copied())
            .find_map(|token| self.token_to_id(token).map(|id| (token.to_string(), id)))
            .ok_or_else(|| ExportError::configuration("tokenizer defines no padding token"))
    }

    pub fn pad_token_id(&self) -> Result<u32, ExportError> {
        self.pad_token().map(|(_, id)| id)
    }

    /// A special token from `tokenizer_config.json`, given as a string or as `{"content": ..}`.
    fn config_token(&self, key: &str) -> Option<String> {
        match self.config.as_ref()?.get(key)? {
            Value::String(token) => Some(token.clone()),
            Value::Object(object) => object.get("content")?.as_str().map(str::to_string),
            _ => None,
        }
    }

    /// Encodes `sequences` into a rectangular batch.
    pub fn encode(
        &self,
        sequences: &[Sequence],
        padding_policy: PaddingPolicy,
        add_special_tokens: bool,
    ) -> Result<EncodedBatch> {
        padding_policy.validate()?;
        if sequences.is_empty() {
            return Err(ExportError::shape_mismatch("cannot encode an empty list of sequences").into());
        }

        let mut tokenizer = self.tokenizer.clone();
        let (strategy, max_length) = match padding_policy {
            PaddingPolicy::None => (None, self.options.max_length),
            PaddingPolicy::LongestInBatch => (Some(PaddingStrategy::BatchLongest), self.options.max_length),
            PaddingPolicy::FixedLength(length) => (Some(PaddingStrategy::Fixed(length)), Some(length)),
        };

        let padding = match strategy {
            Some(strategy) => {
                let (pad_token, pad_id) = self.pad_token()?;
                Some(PaddingParams {
                    strategy,
                    direction: PaddingDirection::Right,
                    pad_to_multiple_of: None,
                    pad_id,
                    pad_type_id: 0,
                    pad_token,
                })
            }
            None => None,
        };
        tokenizer.with_padding(padding);

        if let Some(max_length) = max_length {
            let has_pair = sequences.iter().any(|sequence| matches!(sequence, Sequence::Pair(..)));
            let added = self.added_tokens(has_pair, add_special_tokens);
            if max_length <= added {
                return Err(ExportError::configuration(format!(
                    "maximum length {max_length} leaves no room for text next to {added} special tokens"
                ))
                .into());
            }
        }
        let truncation = max_length.map(|max_length| TruncationParams { max_length, ..Default::default() });
        tokenizer
            .with_truncation(truncation)
            .map_err(|err| ExportError::configuration(format!("invalid truncation: {err}")))?;

        let inputs = sequences.iter().map(Sequence::to_input).collect::<Vec<_>>();
        let encodings = tokenizer
            .encode_batch(inputs, add_special_tokens)
            .map_err(|err| anyhow::anyhow!("Failed to encode batch: {err}"))?;

        self.to_batch(&encodings)
    }

    /// Special tokens the post-processor inserts around one example.
    fn added_tokens(&self, is_pair: bool, add_special_tokens: bool) -> usize {
        match self.tokenizer.get_post_processor() {
            Some(processor) if add_special_tokens => processor.added_tokens(is_pair),
            _ => 0,
        }
    }

    fn to_batch(&self, encodings: &[Encoding]) -> Result<EncodedBatch> {
        let sequence_length = encodings.first().map(Encoding::len).unwrap_or(0);
        if let Some(ragged) = encodings.iter().find(|encoding| encoding.len() != sequence_length) {
            return Err(ExportError::shape_mismatch(format!(
                "examples have different lengths ({sequence_length} and {}) and padding is disabled",
                ragged.len()
            ))
            .into());
        }

        let shape = vec![encodings.len(), sequence_length];
        let collect = |field: fn(&Encoding) -> &[u32]| -> Vec<i64> {
            encodings.iter().flat_map(|encoding| field(encoding).iter().map(|&v| i64::from(v))).collect()
        };

        let input_ids = Tensor::from_i64(shape.clone(), collect(Encoding::get_ids))?;
        let attention_mask = Tensor::from_i64(shape.clone(), collect(Encoding::get_attention_mask))?;
        let token_type_ids = if self.options.return_token_type_ids {
            Some(Tensor::from_i64(shape, collect(Encoding::get_type_ids))?)
        } else {
            None
        };

        debug!("Encoded {} examples to {} tokens each", encodings.len(), sequence_length);
        EncodedBatch::new(input_ids, attention_mask, token_type_ids)
    }

    /// Writes the tokenizer files into `directory`, creating it when needed.
    ///
    /// Existing files with other names are left alone.
    pub fn persist(&self, directory: &Path) -> Result<()> {
        fs::create_dir_all(directory)
            .with_context(|| format!("Failed to create directory {}", directory.display()))?;

        let tokenizer_path = directory.join(Self::TOKENIZER_FILE_NAME);
        self.tokenizer
            .save(&tokenizer_path, false)
            .map_err(|err| anyhow::anyhow!("Failed to write {}: {err}", tokenizer_path.display()))?;

        let config = match &self.config {
            Some(config) => Value::Object(config.clone()),
            None => self.synthesized_config(),
        };
        write_json_file(&directory.join(Self::TOKENIZER_CONFIG_FILE_NAME), &config)?;
        write_json_file(&directory.join(Self::SPECIAL_TOKENS_MAP_FILE_NAME), &self.special_tokens_map())?;

        info!("💾 Written tokenizer files to {}", directory.display());
        Ok(())
    }

    fn synthesized_config(&self) -> Value {
        let mut config = Map::new();
        config.insert("tokenizer_class".to_string(), Value::from("PreTrainedTokenizerFast"));
        if let Ok((pad_token, _)) = self.pad_token() {
            config.insert("pad_token".to_string(), Value::from(pad_token));
        }
        if let Some(max_length) = self.options.max_length {
            config.insert("model_max_length".to_string(), Value::from(max_length));
        }
        Value::Object(config)
    }

    /// Special tokens from the config, falling back to well-known tokens of the vocabulary.
    fn special_tokens_map(&self) -> Value {
        let from_config: Map<String, Value> = Self::SPECIAL_TOKEN_KEYS
            .iter()
            .filter_map(|&key| Some((key.to_string(), self.config.as_ref()?.get(key)?.clone())))
            .collect();
        if !from_config.is_empty() {
            return Value::Object(from_config);
        }

        Value::Object(
            Self::WELL_KNOWN_SPECIAL_TOKENS
                .iter()
                .filter_map(|&(key, candidates)| {
                    let token = candidates.iter().find(|token| self.token_to_id(token).is_some())?;
                    Some((key.to_string(), Value::from(*token)))
                })
                .collect(),
        )
    }
}

/// Load and parse a JSON file
fn load_json_file(path: &Path) -> Result<Value> {
    let mut file = File::open(path)?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;

    serde_json::from_str(&contents).with_context(|| format!("Failed to parse JSON from {}", path.display()))
}

fn write_json_file(path: &Path, value: &Value) -> Result<()> {
    let contents = serde_json::to_string_pretty(value)?;
    fs::write(path, contents).with_context(|| format!("Failed to write {}", path.display()))
}
