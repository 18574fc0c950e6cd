use super::*;
use crate::error::export_error;
use crate::fixtures::{max_abs_diff, sample_batch, tiny_model};
use crate::tensor::DType;
use anyhow::Result;

const QUERY: &str = "encoder.layer.0.attention.self.query";
const WORD_EMBEDDINGS: &str = "embeddings.word_embeddings";

fn quantized_weight(model: &dyn ModelAdapter, name: &str) -> QuantizedWeight {
    let weight = match model.parameters().layer(name).unwrap() {
        Layer::Linear(linear) => &linear.weight,
        Layer::Embedding(embedding) => &embedding.weight,
        Layer::LayerNorm(_) => panic!("{name} has no weight matrix"),
    };
    match weight {
        Weight::Int8(quantized) => quantized.clone(),
        Weight::F32(_) => panic!("{name} was not quantized"),
    }
}

#[test]
fn test_per_output_channel_scales_round_half_to_even() -> Result<()> {
    let weights = Tensor::from_f32(vec![2, 2], vec![127.0, -63.5, 2.5, 0.5])?;
    let quantized = quantize_per_channel(&weights, 1)?;

    assert_eq!(quantized.scales, [1.0, 0.5]);
    assert_eq!(quantized.values, [127, -127, 2, 1]);
    assert_eq!(quantized.max_error, 0.5);
    Ok(())
}

#[test]
fn test_per_row_scales() -> Result<()> {
    let weights = Tensor::from_f32(vec![2, 2], vec![127.0, -63.5, 2.5, 0.5])?;
    let quantized = quantize_per_channel(&weights, 0)?;

    assert_eq!(quantized.scales[0], 1.0);
    assert!((quantized.scales[1] - 2.5 / 127.0).abs() < 1e-9);
    assert_eq!(quantized.values, [127, -64, 127, 25]);
    Ok(())
}

#[test]
fn test_zero_channel_keeps_unit_scale() -> Result<()> {
    let weights = Tensor::from_f32(vec![2, 2], vec![0.0, 1.0, 0.0, -1.0])?;
    let quantized = quantize_per_channel(&weights, 1)?;

    assert_eq!(quantized.scales[0], 1.0);
    assert_eq!(quantized.values, [0, 127, 0, -127]);
    assert_eq!(quantized.max_error, 0.0);
    Ok(())
}

#[test]
fn test_values_stay_in_symmetric_range() -> Result<()> {
    let data: Vec<f32> = (0..64).map(|i| (i as f32 - 31.5) * 0.37).collect();
    let quantized = quantize_per_channel(&Tensor::from_f32(vec![8, 8], data)?, 1)?;
    assert!(quantized.values.iter().all(|&v| v >= -127));
    assert!(quantized.values.iter().any(|&v| v == 127 || v == -127));
    Ok(())
}

#[test]
fn test_rejects_non_matrix_weights() -> Result<()> {
    assert!(quantize_per_channel(&Tensor::vector_f32(vec![1.0, 2.0]), 0).is_err());
    assert!(quantize_per_channel(&Tensor::from_f32(vec![1, 2], vec![1.0, 2.0])?, 2).is_err());
    Ok(())
}

#[test]
fn test_target_parsing() -> Result<()> {
    assert_eq!("int8".parse::<QuantizationTarget>()?, QuantizationTarget::Int8);
    assert_eq!("disabled".parse::<QuantizationTarget>()?, QuantizationTarget::Disabled);
    assert!("fp16".parse::<QuantizationTarget>().unwrap_err().is_configuration());
    assert_eq!(QuantizationTarget::Int8.to_string(), "int8");
    Ok(())
}

#[test]
fn test_disabled_keeps_parameters() -> Result<()> {
    let model = tiny_model("BertForTokenClassification");
    let copy = quantize(model.as_ref(), &QuantizationConfig::default())?;

    assert_eq!(copy.parameters(), model.parameters());
    assert_eq!(copy.parameters().quantized_layer_count(), 0);
    Ok(())
}

#[test]
fn test_int8_rewrites_linear_layers_only() -> Result<()> {
    let model = tiny_model("BertForTokenClassification");
    let quantized = quantize(model.as_ref(), &QuantizationConfig::int8())?;

    assert_eq!(quantized.parameters().quantized_layer_count(), 7);
    assert_eq!(model.parameters().quantized_layer_count(), 0);
    assert!(!quantized.parameters().embedding(WORD_EMBEDDINGS)?.weight.is_quantized());

    let weight = quantized_weight(quantized.as_ref(), QUERY);
    assert_eq!(weight.axis, 1);
    assert!(weight.dynamic_activations);
    assert_eq!(weight.values.dtype(), DType::I8);
    assert_eq!(weight.scales.shape(), &[8]);
    assert_eq!(weight.zero_points.as_i8()?, &[0; 8]);

    let original = model.parameters().linear(QUERY)?;
    assert!(Arc::ptr_eq(&quantized.parameters().linear(QUERY)?.bias, &original.bias));
    let norm = "embeddings.LayerNorm";
    assert!(Arc::ptr_eq(&quantized.parameters().layer_norm(norm)?.gamma, &model.parameters().layer_norm(norm)?.gamma));
    Ok(())
}

#[test]
fn test_quantized_model_keeps_interface_and_stays_close() -> Result<()> {
    let model = tiny_model("BertForTokenClassification");
    let quantized = quantize(model.as_ref(), &QuantizationConfig::int8())?;

    assert_eq!(quantized.input_names(), model.input_names());
    assert_eq!(quantized.output_names(), model.output_names());

    let batch = sample_batch(true);
    let expected = model.forward(&batch)?;
    let actual = quantized.forward(&batch)?;
    assert_eq!(actual["logits"].shape(), expected["logits"].shape());
    assert!(max_abs_diff(&actual["logits"], &expected["logits"]) < 0.25);
    Ok(())
}

#[test]
fn test_embeddings_are_quantized_weight_only() -> Result<()> {
    let model = tiny_model("BertForTokenClassification");
    let config = QuantizationConfig::int8().with_layer_kinds(vec![LayerKind::Embedding]);
    let quantized = quantize(model.as_ref(), &config)?;

    assert_eq!(quantized.parameters().quantized_layer_count(), 3);
    let weight = quantized_weight(quantized.as_ref(), WORD_EMBEDDINGS);
    assert_eq!(weight.axis, 0);
    assert!(!weight.dynamic_activations);
    assert_eq!(weight.scales.shape(), &[32]);
    assert!(!quantized.parameters().linear(QUERY)?.weight.is_quantized());

    let outputs = quantized.forward(&sample_batch(true))?;
    assert_eq!(outputs["logits"].shape(), &[2, 5, 3]);
    Ok(())
}

#[test]
fn test_layer_norm_is_skipped_unless_strict() -> Result<()> {
    let model = tiny_model("BertForTokenClassification");
    let config = QuantizationConfig::int8().with_layer_kinds(vec![LayerKind::LayerNorm]);

    let lenient = quantize(model.as_ref(), &config)?;
    assert_eq!(lenient.parameters(), model.parameters());

    let err = quantize(model.as_ref(), &config.with_strict(true)).unwrap_err();
    match export_error(&err) {
        Some(ExportError::UnsupportedLayer { layer, kind }) => {
            assert_eq!(layer, "embeddings.LayerNorm");
            assert_eq!(kind, "LayerNorm");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    Ok(())
}

#[test]
fn test_already_quantized_layers_are_left_alone() -> Result<()> {
    let model = tiny_model("BertForTokenClassification");
    let once = quantize(model.as_ref(), &QuantizationConfig::int8())?;
    let twice = quantize(once.as_ref(), &QuantizationConfig::int8().with_activations(false))?;

    assert_eq!(twice.parameters(), once.parameters());
    assert!(quantized_weight(twice.as_ref(), QUERY).dynamic_activations);
    Ok(())
}
