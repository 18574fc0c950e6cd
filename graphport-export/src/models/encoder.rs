//! Transformer encoder backbone shared by every task head.

use anyhow::Result;

use super::layers::gelu;
use super::{LayerKind, ModelFamily, ModelParameters};
use crate::error::ExportError;
use crate::tensor::{DType, Tensor};
use crate::tracer::{Tracer, ValueId};

const WORD_EMBEDDINGS: &str = "embeddings.word_embeddings";
const POSITION_EMBEDDINGS: &str = "embeddings.position_embeddings";
const TOKEN_TYPE_EMBEDDINGS: &str = "embeddings.token_type_embeddings";
const EMBEDDINGS_NORM: &str = "embeddings.LayerNorm";

/// Additive bias for masked attention scores.
const MASKED_SCORE: f32 = -10000.0;

/// Backbone layers, in the order the forward pass reads them.
pub(super) fn layer_layout(num_layers: usize) -> Vec<(String, LayerKind)> {
    let mut layout = vec![
        (WORD_EMBEDDINGS.to_string(), LayerKind::Embedding),
        (POSITION_EMBEDDINGS.to_string(), LayerKind::Embedding),
        (TOKEN_TYPE_EMBEDDINGS.to_string(), LayerKind::Embedding),
        (EMBEDDINGS_NORM.to_string(), LayerKind::LayerNorm),
    ];
    for i in 0..num_layers {
        layout.extend(
            [
                ("attention.self.query", LayerKind::Linear),
                ("attention.self.key", LayerKind::Linear),
                ("attention.self.value", LayerKind::Linear),
                ("attention.output.dense", LayerKind::Linear),
                ("attention.output.LayerNorm", LayerKind::LayerNorm),
                ("intermediate.dense", LayerKind::Linear),
                ("output.dense", LayerKind::Linear),
                ("output.LayerNorm", LayerKind::LayerNorm),
            ]
            .map(|(component, kind)| (format!("encoder.layer.{i}.{component}"), kind)),
        );
    }
    layout
}

pub(super) fn expect_linear(parameters: &ModelParameters, name: &str, in_features: usize, out_features: usize) -> Result<()> {
    let linear = parameters.linear(name)?;
    if (linear.in_features(), linear.out_features()) != (in_features, out_features) {
        return Err(ExportError::shape_mismatch(format!(
            "{name} maps {} -> {}, expected {in_features} -> {out_features}",
            linear.in_features(),
            linear.out_features()
        ))
        .into());
    }
    Ok(())
}

fn expect_embedding(parameters: &ModelParameters, name: &str, rows: usize, dim: usize) -> Result<()> {
    let embedding = parameters.embedding(name)?;
    if embedding.num_embeddings() < rows || embedding.embedding_dim() != dim {
        return Err(ExportError::shape_mismatch(format!(
            "{name} is [{}, {}], expected [{rows}, {dim}]",
            embedding.num_embeddings(),
            embedding.embedding_dim()
        ))
        .into());
    }
    Ok(())
}

pub(super) fn expect_layer_norm(parameters: &ModelParameters, name: &str, dim: usize) -> Result<()> {
    let norm = parameters.layer_norm(name)?;
    if norm.gamma.shape() != [dim] {
        return Err(ExportError::shape_mismatch(format!("{name} has {:?} weights, expected [{dim}]", norm.gamma.shape())).into());
    }
    Ok(())
}

/// Checks that every backbone layer exists and agrees with the configuration.
pub(super) fn validate(parameters: &ModelParameters) -> Result<()> {
    let config = &parameters.config;
    let (hidden, intermediate) = (config.hidden_size, config.intermediate_size);

    expect_embedding(parameters, WORD_EMBEDDINGS, config.vocab_size, hidden)?;
    expect_embedding(parameters, POSITION_EMBEDDINGS, config.max_position_embeddings, hidden)?;
    expect_embedding(parameters, TOKEN_TYPE_EMBEDDINGS, config.type_vocab_size, hidden)?;
    expect_layer_norm(parameters, EMBEDDINGS_NORM, hidden)?;

    for i in 0..config.num_layers {
        let prefix = format!("encoder.layer.{i}");
        for projection in ["attention.self.query", "attention.self.key", "attention.self.value", "attention.output.dense"] {
            expect_linear(parameters, &format!("{prefix}.{projection}"), hidden, hidden)?;
        }
        expect_layer_norm(parameters, &format!("{prefix}.attention.output.LayerNorm"), hidden)?;
        expect_linear(parameters, &format!("{prefix}.intermediate.dense"), hidden, intermediate)?;
        expect_linear(parameters, &format!("{prefix}.output.dense"), intermediate, hidden)?;
        expect_layer_norm(parameters, &format!("{prefix}.output.LayerNorm"), hidden)?;
    }

    Ok(())
}

/// Runs the backbone and returns the last hidden state `(batch, seq, hidden)`.
pub(super) fn trace(parameters: &ModelParameters, tracer: &mut Tracer, inputs: &[ValueId]) -> Result<ValueId> {
    let family = parameters.config.family();
    let (input_ids, attention_mask, token_type_ids) = match (family, inputs) {
        (ModelFamily::Bert, &[ids, mask, types]) => (ids, mask, Some(types)),
        (ModelFamily::Roberta, &[ids, mask]) => (ids, mask, None),
        _ => {
            return Err(ExportError::shape_mismatch(format!(
                "{family:?} encoder expects {} inputs, got {}",
                family.input_names().len(),
                inputs.len()
            ))
            .into());
        }
    };

    let mut hidden = tracer.scope("embeddings", |t| embeddings(parameters, t, input_ids, token_type_ids))?;
    let mask = tracer.scope("attention_mask", |t| extended_attention_mask(t, attention_mask))?;

    for i in 0..parameters.config.num_layers {
        hidden = tracer.scope(&format!("layer_{i}"), |t| encoder_layer(parameters, t, i, hidden, mask))?;
    }

    Ok(hidden)
}

fn embeddings(
    parameters: &ModelParameters,
    tracer: &mut Tracer,
    input_ids: ValueId,
    token_type_ids: Option<ValueId>,
) -> Result<ValueId> {
    let words = parameters.embedding(WORD_EMBEDDINGS)?.trace(tracer, WORD_EMBEDDINGS, input_ids)?;

    let positions = position_ids(tracer, input_ids, parameters.config.position_offset())?;
    let positions = parameters.embedding(POSITION_EMBEDDINGS)?.trace(tracer, POSITION_EMBEDDINGS, positions)?;
    let hidden = tracer.add(words, positions)?;

    // Without token type ids every token uses the first row.
    let token_types = match token_type_ids {
        Some(ids) => ids,
        None => tracer.constant(Tensor::scalar_i64(0)),
    };
    let token_types = parameters.embedding(TOKEN_TYPE_EMBEDDINGS)?.trace(tracer, TOKEN_TYPE_EMBEDDINGS, token_types)?;
    let hidden = tracer.add(hidden, token_types)?;

    parameters.layer_norm(EMBEDDINGS_NORM)?.trace(tracer, EMBEDDINGS_NORM, hidden)
}

/// `[[offset, offset + 1, .., offset + seq - 1]]`, derived from the runtime shape of `input_ids`.
fn position_ids(tracer: &mut Tracer, input_ids: ValueId, offset: usize) -> Result<ValueId> {
    let shape = tracer.shape_of(input_ids)?;
    let sequence_axis = tracer.constant(Tensor::scalar_i64(1));
    let sequence_length = tracer.gather(shape, sequence_axis)?;

    let start = tracer.constant(Tensor::scalar_i64(0));
    let step = tracer.constant(Tensor::scalar_i64(1));
    let mut positions = tracer.range(start, sequence_length, step)?;

    if offset > 0 {
        let offset = tracer.constant(Tensor::scalar_i64(offset as i64));
        positions = tracer.add(positions, offset)?;
    }

    tracer.unsqueeze(positions, &[0])
}

/// `(1 - mask) * -10000` shaped `(batch, 1, 1, seq)` for broadcasting over heads and queries.
fn extended_attention_mask(tracer: &mut Tracer, attention_mask: ValueId) -> Result<ValueId> {
    let mask = tracer.cast(attention_mask, DType::F32)?;
    let one = tracer.scalar(1.0);
    let inverted = tracer.sub(one, mask)?;
    let masked_score = tracer.scalar(MASKED_SCORE);
    let bias = tracer.mul(inverted, masked_score)?;
    tracer.unsqueeze(bias, &[1, 2])
}

fn encoder_layer(
    parameters: &ModelParameters,
    tracer: &mut Tracer,
    index: usize,
    hidden: ValueId,
    mask: ValueId,
) -> Result<ValueId> {
    let prefix = format!("encoder.layer.{index}");

    let attention = tracer.scope("attention", |t| self_attention(parameters, t, &prefix, hidden, mask))?;
    let dense = format!("{prefix}.attention.output.dense");
    let attention = parameters.linear(&dense)?.trace(tracer, &dense, attention)?;
    let attention = tracer.add(attention, hidden)?;
    let norm = format!("{prefix}.attention.output.LayerNorm");
    let attention = parameters.layer_norm(&norm)?.trace(tracer, &norm, attention)?;

    let intermediate = format!("{prefix}.intermediate.dense");
    let ffn = tracer.scope("intermediate", |t| {
        let projected = parameters.linear(&intermediate)?.trace(t, &intermediate, attention)?;
        gelu(t, projected)
    })?;
    let output = format!("{prefix}.output.dense");
    let ffn = parameters.linear(&output)?.trace(tracer, &output, ffn)?;
    let ffn = tracer.add(ffn, attention)?;
    let norm = format!("{prefix}.output.LayerNorm");
    parameters.layer_norm(&norm)?.trace(tracer, &norm, ffn)
}

/// Multi-head scaled dot-product attention, returning the merged context `(batch, seq, hidden)`.
fn self_attention(
    parameters: &ModelParameters,
    tracer: &mut Tracer,
    prefix: &str,
    hidden: ValueId,
    mask: ValueId,
) -> Result<ValueId> {
    let config = &parameters.config;
    let heads = [0, 0, config.num_heads as i64, config.head_dim() as i64];

    let project = |tracer: &mut Tracer, component: &str, perm: &[usize]| -> Result<ValueId> {
        let name = format!("{prefix}.attention.self.{component}");
        let projected = parameters.linear(&name)?.trace(tracer, &name, hidden)?;
        let split = tracer.reshape(projected, &heads)?;
        tracer.transpose(split, perm)
    };

    let query = project(tracer, "query", &[0, 2, 1, 3])?;
    let key = project(tracer, "key", &[0, 2, 3, 1])?;
    let value = project(tracer, "value", &[0, 2, 1, 3])?;

    let scores = tracer.matmul(query, key)?;
    let scale = tracer.scalar((config.head_dim() as f32).sqrt());
    let scores = tracer.div(scores, scale)?;
    let scores = tracer.add(scores, mask)?;
    let probabilities = tracer.softmax(scores, -1)?;

    let context = tracer.matmul(probabilities, value)?;
    let context = tracer.transpose(context, &[0, 2, 1, 3])?;
    tracer.reshape(context, &[0, 0, -1])
}
