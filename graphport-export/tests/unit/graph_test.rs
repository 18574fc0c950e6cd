use super::*;
use anyhow::Result;
use tempfile::TempDir;

fn sample_graph() -> Result<ExportedGraph> {
    let weight = Tensor::from_f32(vec![2, 2], vec![1.0, -2.0, 0.5, 4.0])?;
    let quantized = Tensor::from_i8(vec![2], vec![-127, 127])?;
    let shape = Tensor::vector_i64(vec![0, 0, -1]);

    Ok(ExportedGraph {
        producer: ExportedGraph::PRODUCER.to_string(),
        opset: 13,
        inputs: vec![TensorSpec {
            name: "input_ids".to_string(),
            dtype: DType::I64,
            dims: vec![DimSpec::Symbolic("batch".to_string()), DimSpec::Symbolic("seq".to_string())],
        }],
        outputs: vec![TensorSpec {
            name: "logits".to_string(),
            dtype: DType::F32,
            dims: vec![DimSpec::Symbolic("batch".to_string()), DimSpec::Symbolic("seq".to_string()), DimSpec::Fixed(2)],
        }],
        nodes: vec![Node {
            name: "classifier/MatMul_0".to_string(),
            op_type: "MatMul".to_string(),
            inputs: vec!["input_ids".to_string(), "classifier.weight".to_string()],
            outputs: vec!["logits".to_string()],
            attributes: BTreeMap::from([
                ("epsilon".to_string(), Attribute::Float(1e-12)),
                ("perm".to_string(), Attribute::Ints(vec![0, 2, 1, 3])),
                ("to".to_string(), Attribute::Int(1)),
            ]),
        }],
        initializers: vec![
            Initializer { name: "classifier.weight".to_string(), tensor: Arc::new(weight) },
            Initializer { name: "classifier.weight_quantized".to_string(), tensor: Arc::new(quantized) },
            Initializer { name: "Constant_0".to_string(), tensor: Arc::new(shape) },
        ],
        dynamic_axes: DynamicAxisSpec::batch_and_sequence(["input_ids", "logits"]),
    })
}

#[test]
fn test_write_and_read_back() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let path = temp_dir.path().join("model.graph");
    let graph = sample_graph()?;

    let size = graph.write(&path)?;
    assert_eq!(size, fs::metadata(&path)?.len());

    let loaded = ExportedGraph::read(&path)?;
    assert_eq!(loaded, graph);
    assert_eq!(loaded.initializer("Constant_0").map(|t| t.as_i64().unwrap().to_vec()), Some(vec![0, 0, -1]));
    assert!(loaded.initializer("missing").is_none());
    Ok(())
}

#[test]
fn test_metadata_offsets_are_contiguous() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let path = temp_dir.path().join("model.graph");
    sample_graph()?.write(&path)?;

    let metadata = ExportedGraph::read_metadata(&path)?;
    let layout: Vec<(u64, u64)> = metadata.initializers.iter().map(|entry| (entry.offset, entry.length)).collect();
    assert_eq!(layout, [(0, 16), (16, 2), (18, 24)]);
    assert_eq!(metadata.data_size(), 42);
    assert_eq!(metadata.input_names(), ["input_ids"]);
    assert_eq!(metadata.output_names(), ["logits"]);
    assert_eq!(metadata.op_histogram().get("MatMul"), Some(&1));
    assert_eq!(metadata.dynamic_axes.symbol("logits", 1), Some("seq"));
    Ok(())
}

#[test]
fn test_writes_are_deterministic() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let first = temp_dir.path().join("first.graph");
    let second = temp_dir.path().join("second.graph");

    sample_graph()?.write(&first)?;
    sample_graph()?.write(&second)?;
    assert_eq!(fs::read(&first)?, fs::read(&second)?);
    Ok(())
}

#[test]
fn test_failed_write_leaves_nothing_behind() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let path = temp_dir.path().join("missing").join("model.graph");

    assert!(sample_graph()?.write(&path).is_err());
    assert!(!path.exists());
    assert_eq!(fs::read_dir(temp_dir.path())?.count(), 0);
    Ok(())
}

#[test]
fn test_write_replaces_existing_file_without_temporaries() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let path = temp_dir.path().join("model.graph");
    fs::write(&path, b"stale")?;

    sample_graph()?.write(&path)?;
    assert_eq!(ExportedGraph::read(&path)?, sample_graph()?);

    let names: Vec<String> =
        fs::read_dir(temp_dir.path())?.map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned())).collect::<Result<_, _>>()?;
    assert_eq!(names, ["model.graph"]);
    Ok(())
}

#[test]
fn test_rejects_bad_magic_and_version() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let path = temp_dir.path().join("model.graph");
    sample_graph()?.write(&path)?;
    let bytes = fs::read(&path)?;

    let mut bad_magic = bytes.clone();
    bad_magic[0] ^= 0xff;
    let bad_magic_path = temp_dir.path().join("bad_magic.graph");
    fs::write(&bad_magic_path, &bad_magic)?;
    let err = ExportedGraph::read_metadata(&bad_magic_path).unwrap_err();
    assert!(format!("{err:#}").contains("bad magic"));

    let mut bad_version = bytes.clone();
    bad_version[4] = 9;
    let bad_version_path = temp_dir.path().join("bad_version.graph");
    fs::write(&bad_version_path, &bad_version)?;
    assert!(ExportedGraph::read(&bad_version_path).is_err());

    let truncated_path = temp_dir.path().join("truncated.graph");
    fs::write(&truncated_path, &bytes[..bytes.len() - 4])?;
    assert!(ExportedGraph::read(&truncated_path).is_err());
    Ok(())
}

#[test]
fn test_op_histogram_counts_nodes() -> Result<()> {
    let mut graph = sample_graph()?;
    let mut extra = graph.nodes[0].clone();
    extra.name = "classifier/MatMul_1".to_string();
    graph.nodes.push(extra);

    assert_eq!(graph.op_histogram().get("MatMul"), Some(&2));
    assert_eq!(graph.op_histogram().len(), 1);
    Ok(())
}
