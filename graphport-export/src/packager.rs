use anyhow::{Context, Result};
use log::{info, warn};
use std::fs;
use std::path::Path;

use crate::tokenizer_adapter::TokenizerAdapter;

/// Persists the tokenizer next to an exported graph so both load as one bundle.
///
/// `output_dir` is created when missing and never cleared. Concurrent exports
/// into the same directory are not coordinated.
pub fn package(graph_path: &Path, tokenizer: &TokenizerAdapter, output_dir: &Path) -> Result<()> {
    if !graph_path.is_file() {
        anyhow::bail!("Graph file {} does not exist", graph_path.display());
    }

    fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create output directory {}", output_dir.display()))?;

    let graph_dir = graph_path.parent().and_then(|dir| fs::canonicalize(dir).ok());
    if graph_dir != fs::canonicalize(output_dir).ok() {
        warn!(
            "Graph file {} is not inside {}, the bundle will not be self-contained",
            graph_path.display(),
            output_dir.display()
        );
    }

    tokenizer.persist(output_dir)?;
    info!("📦 Packaged tokenizer with {} next to the graph in {}", graph_file_name(graph_path), output_dir.display());
    Ok(())
}

fn graph_file_name(graph_path: &Path) -> String {
    graph_path.file_name().map(|name| name.to_string_lossy().into_owned()).unwrap_or_default()
}
