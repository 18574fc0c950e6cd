//! Tiny token classifiers written to disk in HuggingFace layout.

use anyhow::Result;
use safetensors::{Dtype, tensor::TensorView};
use std::fs;
use std::path::Path;

pub const TOKENIZER_JSON: &str = include_str!("../fixtures/tokenizer.json");
pub const TOKENIZER_CONFIG_JSON: &str = include_str!("../fixtures/tokenizer_config.json");

pub const HIDDEN: usize = 64;
pub const INTERMEDIATE: usize = 128;
pub const VOCAB: usize = 32;
pub const MAX_POSITIONS: usize = 32;
pub const NUM_LAYERS: usize = 2;
pub const NUM_LABELS: usize = 3;

/// What distinguishes one on-disk checkpoint flavour from another.
pub struct Checkpoint {
    pub architecture: &'static str,
    pub model_type: &'static str,
    /// Backbone prefix of the tensor names.
    pub prefix: &'static str,
    pub type_vocab_size: usize,
    pub pad_token_id: u32,
}

pub const BERT: Checkpoint = Checkpoint {
    architecture: "BertForTokenClassification",
    model_type: "bert",
    prefix: "bert.",
    type_vocab_size: 2,
    pad_token_id: 0,
};

pub const XLM_ROBERTA: Checkpoint = Checkpoint {
    architecture: "XLMRobertaForTokenClassification",
    model_type: "xlm-roberta",
    prefix: "roberta.",
    type_vocab_size: 1,
    pad_token_id: 1,
};

pub fn config_json(checkpoint: &Checkpoint) -> String {
    let Checkpoint { architecture, model_type, type_vocab_size, pad_token_id, .. } = checkpoint;
    format!(
        r#"{{
            "architectures": ["{architecture}"],
            "model_type": "{model_type}",
            "hidden_size": {HIDDEN},
            "num_hidden_layers": {NUM_LAYERS},
            "num_attention_heads": 4,
            "intermediate_size": {INTERMEDIATE},
            "vocab_size": {VOCAB},
            "max_position_embeddings": {MAX_POSITIONS},
            "type_vocab_size": {type_vocab_size},
            "layer_norm_eps": 1e-12,
            "hidden_act": "gelu",
            "pad_token_id": {pad_token_id},
            "id2label": {{"0": "O", "1": "B-PER", "2": "I-PER"}}
        }}"#
    )
}

/// Checkpoint tensor names and shapes, dense weights as `[out, in]`.
fn checkpoint_layout(checkpoint: &Checkpoint) -> Vec<(String, Vec<usize>)> {
    let base = checkpoint.prefix;
    let mut layout = vec![
        (format!("{base}embeddings.word_embeddings.weight"), vec![VOCAB, HIDDEN]),
        (format!("{base}embeddings.position_embeddings.weight"), vec![MAX_POSITIONS, HIDDEN]),
        (format!("{base}embeddings.token_type_embeddings.weight"), vec![checkpoint.type_vocab_size, HIDDEN]),
        (format!("{base}embeddings.LayerNorm.weight"), vec![HIDDEN]),
        (format!("{base}embeddings.LayerNorm.bias"), vec![HIDDEN]),
    ];

    for i in 0..NUM_LAYERS {
        let prefix = format!("{base}encoder.layer.{i}");
        let dense = [
            ("attention.self.query", HIDDEN, HIDDEN),
            ("attention.self.key", HIDDEN, HIDDEN),
            ("attention.self.value", HIDDEN, HIDDEN),
            ("attention.output.dense", HIDDEN, HIDDEN),
            ("intermediate.dense", INTERMEDIATE, HIDDEN),
            ("output.dense", HIDDEN, INTERMEDIATE),
        ];
        for (name, out_features, in_features) in dense {
            layout.push((format!("{prefix}.{name}.weight"), vec![out_features, in_features]));
            layout.push((format!("{prefix}.{name}.bias"), vec![out_features]));
        }
        for norm in ["attention.output.LayerNorm", "output.LayerNorm"] {
            layout.push((format!("{prefix}.{norm}.weight"), vec![HIDDEN]));
            layout.push((format!("{prefix}.{norm}.bias"), vec![HIDDEN]));
        }
    }

    layout.push(("classifier.weight".to_string(), vec![NUM_LABELS, HIDDEN]));
    layout.push(("classifier.bias".to_string(), vec![NUM_LABELS]));
    layout
}

fn values(name: &str, count: usize, seed: usize) -> Vec<f32> {
    let wave = |i: usize| ((i * 7 + seed * 13) as f32 * 0.61).sin();
    if name.ends_with("LayerNorm.weight") {
        (0..count).map(|i| 1.0 + 0.1 * wave(i)).collect()
    } else {
        (0..count).map(|i| 0.3 * wave(i)).collect()
    }
}

fn write_safetensors(path: &Path, checkpoint: &Checkpoint) -> Result<()> {
    let buffers: Vec<(String, Vec<usize>, Vec<u8>)> = checkpoint_layout(checkpoint)
        .into_iter()
        .enumerate()
        .map(|(seed, (name, shape))| {
            let count = shape.iter().product();
            let bytes = values(&name, count, seed).iter().flat_map(|v| v.to_le_bytes()).collect();
            (name, shape, bytes)
        })
        .collect();

    let views = buffers
        .iter()
        .map(|(name, shape, bytes)| Ok((name.as_str(), TensorView::new(Dtype::F32, shape.clone(), bytes)?)))
        .collect::<Result<Vec<_>>>()?;
    let tensor_list: Vec<(&str, &TensorView)> = views.iter().map(|(name, view)| (*name, view)).collect();

    fs::write(path, safetensors::serialize(tensor_list, &None)?)?;
    Ok(())
}

/// Writes a BERT token classifier into `dir`.
pub fn write_model_dir(dir: &Path) -> Result<()> {
    write_checkpoint_dir(dir, &BERT)
}

/// Writes `config.json`, `model.safetensors`, `tokenizer.json` and `tokenizer_config.json` into `dir`.
pub fn write_checkpoint_dir(dir: &Path, checkpoint: &Checkpoint) -> Result<()> {
    fs::create_dir_all(dir)?;
    fs::write(dir.join("config.json"), config_json(checkpoint))?;
    write_safetensors(&dir.join("model.safetensors"), checkpoint)?;
    fs::write(dir.join("tokenizer.json"), TOKENIZER_JSON)?;
    fs::write(dir.join("tokenizer_config.json"), TOKENIZER_CONFIG_JSON)?;
    Ok(())
}

/// File names in `dir`, sorted.
pub fn file_names(dir: &Path) -> Result<Vec<String>> {
    let mut names = fs::read_dir(dir)?
        .map(|entry| Ok(entry?.file_name().to_string_lossy().into_owned()))
        .collect::<Result<Vec<_>>>()?;
    names.sort();
    Ok(names)
}
