use super::*;
use crate::error::export_error;
use anyhow::Result;
use tempfile::TempDir;

const TOKENIZER_JSON: &str = include_str!("../fixtures/tokenizer.json");
const TOKENIZER_CONFIG_JSON: &str = include_str!("../fixtures/tokenizer_config.json");

const CLS: i64 = 2;
const SEP: i64 = 3;

fn tokenizer() -> Tokenizer {
    TOKENIZER_JSON.parse().unwrap()
}

fn adapter(options: TokenizerOptions) -> TokenizerAdapter {
    TokenizerAdapter::new(tokenizer(), None, options)
}

fn sentences() -> Vec<Sequence> {
    vec![Sequence::single("Jan Kowalski lives in Krakow."), Sequence::single("hello world")]
}

fn is_shape_mismatch(err: &anyhow::Error) -> bool {
    matches!(export_error(err), Some(ExportError::ShapeMismatch(_)))
}

#[test]
fn test_longest_in_batch_pads_to_longest_example() -> Result<()> {
    let batch = adapter(TokenizerOptions::default()).encode(&sentences(), PaddingPolicy::LongestInBatch, true)?;

    assert_eq!(batch.input_ids.shape(), &[2, 8]);
    assert_eq!(batch.input_ids.as_i64()?, &[CLS, 5, 6, 7, 8, 9, 10, SEP, CLS, 15, 16, SEP, 0, 0, 0, 0]);
    assert_eq!(batch.attention_mask.as_i64()?, &[1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 0, 0, 0, 0]);
    assert_eq!(batch.token_type_ids.as_ref().map(Tensor::shape), Some(&[2usize, 8][..]));
    assert_eq!(batch.field_names(), [INPUT_IDS, ATTENTION_MASK, TOKEN_TYPE_IDS]);
    assert!(batch.fully_masked_rows()?.is_empty());
    Ok(())
}

#[test]
fn test_fixed_length_truncates_and_pads() -> Result<()> {
    let adapter = adapter(TokenizerOptions::default());

    let short = adapter.encode(&sentences(), PaddingPolicy::FixedLength(4), true)?;
    assert_eq!(short.input_ids.as_i64()?, &[CLS, 5, 6, SEP, CLS, 15, 16, SEP]);

    let long = adapter.encode(&sentences(), PaddingPolicy::FixedLength(10), true)?;
    assert_eq!(long.sequence_length(), 10);
    assert_eq!(long.attention_mask.as_i64()?[8..10], [0, 0]);
    Ok(())
}

#[test]
fn test_no_padding_requires_equal_lengths() -> Result<()> {
    let adapter = adapter(TokenizerOptions::default());

    let err = adapter.encode(&sentences(), PaddingPolicy::None, true).unwrap_err();
    assert!(is_shape_mismatch(&err));

    let same = [Sequence::single("hello world"), Sequence::single("anna works")];
    let batch = adapter.encode(&same, PaddingPolicy::None, true)?;
    assert_eq!(batch.input_ids.shape(), &[2, 4]);
    Ok(())
}

#[test]
fn test_empty_input_is_rejected() {
    let err = adapter(TokenizerOptions::default()).encode(&[], PaddingPolicy::LongestInBatch, true).unwrap_err();
    assert!(is_shape_mismatch(&err));
}

#[test]
fn test_zero_fixed_length_is_a_configuration_error() {
    let err = adapter(TokenizerOptions::default()).encode(&sentences(), PaddingPolicy::FixedLength(0), true).unwrap_err();
    assert!(export_error(&err).is_some_and(ExportError::is_configuration));
}

#[test]
fn test_pairs_carry_segment_ids() -> Result<()> {
    let batch = adapter(TokenizerOptions::default()).encode(&[Sequence::pair("hello", "world")], PaddingPolicy::None, true)?;

    assert_eq!(batch.input_ids.as_i64()?, &[CLS, 15, SEP, 16, SEP]);
    assert_eq!(batch.token_type_ids.as_ref().map(Tensor::as_i64).transpose()?, Some(&[0, 0, 0, 1, 1][..]));
    Ok(())
}

#[test]
fn test_options_control_token_types_and_special_tokens() -> Result<()> {
    let options = TokenizerOptions { return_token_type_ids: false, max_length: None };
    let batch = adapter(options).encode(&[Sequence::single("hello world")], PaddingPolicy::LongestInBatch, false)?;

    assert_eq!(batch.input_ids.as_i64()?, &[15, 16]);
    assert!(batch.token_type_ids.is_none());
    assert_eq!(batch.field_names(), [INPUT_IDS, ATTENTION_MASK]);
    assert!(batch.field(TOKEN_TYPE_IDS).is_none());
    Ok(())
}

#[test]
fn test_max_length_bounds_longest_in_batch() -> Result<()> {
    let options = TokenizerOptions { max_length: Some(5), ..TokenizerOptions::default() };
    let batch = adapter(options).encode(&sentences(), PaddingPolicy::LongestInBatch, true)?;
    assert_eq!(batch.input_ids.shape(), &[2, 5]);
    Ok(())
}

#[test]
fn test_lengths_must_leave_room_for_special_tokens() -> Result<()> {
    let unbounded = adapter(TokenizerOptions::default());
    let is_configuration = |err: &anyhow::Error| export_error(err).is_some_and(ExportError::is_configuration);

    for length in [1, 2] {
        let err = unbounded.encode(&sentences(), PaddingPolicy::FixedLength(length), true).unwrap_err();
        assert!(is_configuration(&err));
    }
    let shortest = unbounded.encode(&sentences(), PaddingPolicy::FixedLength(3), true)?;
    assert_eq!(shortest.input_ids.as_i64()?, &[CLS, 5, SEP, CLS, 15, SEP]);

    let pair = [Sequence::pair("hello", "world")];
    assert!(is_configuration(&unbounded.encode(&pair, PaddingPolicy::FixedLength(3), true).unwrap_err()));

    let without_special = unbounded.encode(&sentences(), PaddingPolicy::FixedLength(1), false)?;
    assert_eq!(without_special.input_ids.as_i64()?, &[5, 15]);

    let bounded = TokenizerOptions { max_length: Some(2), ..TokenizerOptions::default() };
    let err = adapter(bounded).encode(&sentences(), PaddingPolicy::LongestInBatch, true).unwrap_err();
    assert!(is_configuration(&err));
    Ok(())
}

#[test]
fn test_padding_policy_parsing() -> Result<()> {
    assert_eq!(PaddingPolicy::parse("none", None)?, PaddingPolicy::None);
    assert_eq!(PaddingPolicy::parse("longest", None)?, PaddingPolicy::LongestInBatch);
    assert_eq!(PaddingPolicy::parse("longest-in-batch", Some(8))?, PaddingPolicy::LongestInBatch);
    assert_eq!(PaddingPolicy::parse("fixed-length", Some(16))?, PaddingPolicy::FixedLength(16));
    assert_eq!(PaddingPolicy::default(), PaddingPolicy::LongestInBatch);
    Ok(())
}

#[test]
fn test_invalid_padding_policies() {
    assert!(PaddingPolicy::parse("fixed-length", None).unwrap_err().is_configuration());
    assert!(PaddingPolicy::parse("fixed-length", Some(0)).unwrap_err().is_configuration());
    assert!(PaddingPolicy::parse("bogus", Some(8)).unwrap_err().is_configuration());
    assert_eq!(PaddingPolicy::FixedLength(12).to_string(), "fixed-length(12)");
}

#[test]
fn test_pad_token_resolution() -> Result<()> {
    let adapter = adapter(TokenizerOptions::default());
    assert_eq!(adapter.pad_token()?, ("[PAD]".to_string(), 0));

    let config: Map<String, Value> = serde_json::from_str(r#"{"pad_token": {"content": "[MASK]"}}"#)?;
    let configured = TokenizerAdapter::new(tokenizer(), Some(config), TokenizerOptions::default());
    assert_eq!(configured.pad_token_id()?, 4);
    Ok(())
}

#[test]
fn test_from_dir_reads_both_files() -> Result<()> {
    let temp_dir = TempDir::new()?;
    fs::write(temp_dir.path().join("tokenizer.json"), TOKENIZER_JSON)?;
    fs::write(temp_dir.path().join("tokenizer_config.json"), TOKENIZER_CONFIG_JSON)?;

    let adapter = TokenizerAdapter::from_dir(temp_dir.path(), TokenizerOptions::default())?;
    assert_eq!(adapter.vocab_size(), 17);
    assert_eq!(adapter.token_to_id("krakow"), Some(9));
    assert_eq!(adapter.config().and_then(|config| config.get("model_max_length")), Some(&Value::from(64)));
    Ok(())
}

#[test]
fn test_from_dir_without_tokenizer_fails() {
    let temp_dir = TempDir::new().unwrap();
    let err = TokenizerAdapter::from_dir(temp_dir.path(), TokenizerOptions::default()).unwrap_err();
    assert!(err.to_string().contains("tokenizer.json"));
}

#[test]
fn test_persist_writes_reloadable_files() -> Result<()> {
    let source = TempDir::new()?;
    fs::write(source.path().join("tokenizer.json"), TOKENIZER_JSON)?;
    fs::write(source.path().join("tokenizer_config.json"), TOKENIZER_CONFIG_JSON)?;
    let adapter = TokenizerAdapter::from_dir(source.path(), TokenizerOptions::default())?;

    let output = TempDir::new()?;
    fs::write(output.path().join("model.graph"), b"graph")?;
    adapter.persist(output.path())?;

    assert_eq!(fs::read(output.path().join("model.graph"))?, b"graph");

    let reloaded = TokenizerAdapter::from_dir(output.path(), TokenizerOptions::default())?;
    let texts = sentences();
    assert_eq!(
        reloaded.encode(&texts, PaddingPolicy::LongestInBatch, true)?,
        adapter.encode(&texts, PaddingPolicy::LongestInBatch, true)?
    );
    assert_eq!(reloaded.config(), adapter.config());

    let special_tokens: Value = serde_json::from_str(&fs::read_to_string(output.path().join("special_tokens_map.json"))?)?;
    assert_eq!(special_tokens["pad_token"], "[PAD]");
    assert_eq!(special_tokens["cls_token"], "[CLS]");
    Ok(())
}

#[test]
fn test_persist_synthesizes_missing_config() -> Result<()> {
    let options = TokenizerOptions { max_length: Some(32), ..TokenizerOptions::default() };
    let output = TempDir::new()?;
    adapter(options).persist(&output.path().join("bundle"))?;

    let config: Value = serde_json::from_str(&fs::read_to_string(output.path().join("bundle/tokenizer_config.json"))?)?;
    assert_eq!(config["pad_token"], "[PAD]");
    assert_eq!(config["model_max_length"], 32);

    let special_tokens: Value =
        serde_json::from_str(&fs::read_to_string(output.path().join("bundle/special_tokens_map.json"))?)?;
    assert_eq!(special_tokens["unk_token"], "[UNK]");
    assert_eq!(special_tokens["mask_token"], "[MASK]");
    assert!(special_tokens.get("bos_token").is_none());
    Ok(())
}

#[test]
fn test_batch_consistency_and_masked_rows() -> Result<()> {
    let ids = Tensor::from_i64(vec![2, 2], vec![2, 3, 0, 0])?;
    let mask = Tensor::from_i64(vec![2, 2], vec![1, 1, 0, 0])?;
    let batch = EncodedBatch::new(ids.clone(), mask, None)?;
    assert_eq!(batch.fully_masked_rows()?, [1]);

    let wrong_mask = Tensor::from_i64(vec![1, 4], vec![1, 1, 0, 0])?;
    assert!(is_shape_mismatch(&EncodedBatch::new(ids, wrong_mask, None).unwrap_err()));
    Ok(())
}
