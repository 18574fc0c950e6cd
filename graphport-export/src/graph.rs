#[cfg(test)]
#[path = "../tests/unit/graph_test.rs"]
mod graph_test;

use anyhow::{Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;

use crate::dynamic_axes::DynamicAxisSpec;
use crate::tensor::{DType, Tensor};

/// Node attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Attribute {
    Int(i64),
    Float(f32),
    Ints(Vec<i64>),
    String(String),
}

/// One operator application in the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub op_type: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, Attribute>,
}

/// A graph input/output dimension: fixed by the trace or symbolic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DimSpec {
    Fixed(usize),
    Symbolic(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorSpec {
    pub name: String,
    pub dtype: DType,
    pub dims: Vec<DimSpec>,
}

/// Location of one initializer inside the data section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitializerEntry {
    pub name: String,
    pub dtype: DType,
    pub shape: Vec<usize>,
    pub offset: u64,
    pub length: u64,
}

/// Everything in a graph file except the initializer data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphMetadata {
    pub producer: String,
    pub opset: u32,
    pub inputs: Vec<TensorSpec>,
    pub outputs: Vec<TensorSpec>,
    pub nodes: Vec<Node>,
    pub initializers: Vec<InitializerEntry>,
    pub dynamic_axes: DynamicAxisSpec,
}

impl GraphMetadata {
    pub fn input_names(&self) -> Vec<&str> {
        self.inputs.iter().map(|spec| spec.name.as_str()).collect()
    }

    pub fn output_names(&self) -> Vec<&str> {
        self.outputs.iter().map(|spec| spec.name.as_str()).collect()
    }

    pub fn op_histogram(&self) -> BTreeMap<&str, usize> {
        op_histogram(&self.nodes)
    }

    /// Total size of the initializer data section in bytes.
    pub fn data_size(&self) -> u64 {
        self.initializers.iter().map(|entry| entry.length).sum()
    }
}

fn op_histogram(nodes: &[Node]) -> BTreeMap<&str, usize> {
    let mut histogram = BTreeMap::new();
    for node in nodes {
        *histogram.entry(node.op_type.as_str()).or_default() += 1;
    }
    histogram
}

#[derive(Debug, Clone, PartialEq)]
pub struct Initializer {
    pub name: String,
    pub tensor: Arc<Tensor>,
}

/// Static computation graph produced by one trace.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportedGraph {
    pub producer: String,
    pub opset: u32,
    pub inputs: Vec<TensorSpec>,
    pub outputs: Vec<TensorSpec>,
    pub nodes: Vec<Node>,
    pub initializers: Vec<Initializer>,
    pub dynamic_axes: DynamicAxisSpec,
}

impl ExportedGraph {
    const MAGIC_NUMBER: u32 = 0x31687067; // "gph1" in ASCII
    const VERSION: u32 = 1;
    pub const PRODUCER: &'static str = concat!("graphport ", env!("CARGO_PKG_VERSION"));

    pub fn input_names(&self) -> Vec<&str> {
        self.inputs.iter().map(|spec| spec.name.as_str()).collect()
    }

    pub fn output_names(&self) -> Vec<&str> {
        self.outputs.iter().map(|spec| spec.name.as_str()).collect()
    }

    /// Number of nodes per operator type.
    pub fn op_histogram(&self) -> BTreeMap<&str, usize> {
        op_histogram(&self.nodes)
    }

    pub fn initializer(&self, name: &str) -> Option<&Tensor> {
        self.initializers.iter().find(|init| init.name == name).map(|init| init.tensor.as_ref())
    }

    pub fn metadata(&self) -> GraphMetadata {
        let mut offset = 0u64;
        let initializers = self
            .initializers
            .iter()
            .map(|init| {
                let length = init.tensor.byte_len() as u64;
                let entry = InitializerEntry {
                    name: init.name.clone(),
                    dtype: init.tensor.dtype(),
                    shape: init.tensor.shape().to_vec(),
                    offset,
                    length,
                };
                offset += length;
                entry
            })
            .collect();

        GraphMetadata {
            producer: self.producer.clone(),
            opset: self.opset,
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            nodes: self.nodes.clone(),
            initializers,
            dynamic_axes: self.dynamic_axes.clone(),
        }
    }

    /// Writes the graph to `path` atomically and returns the file size.
    ///
    /// The bytes go to a temporary file next to `path` that is renamed into
    /// place only once everything was written; on failure nothing is left behind.
    pub fn write(&self, path: &Path) -> Result<u64> {
        let directory = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let mut temp_file = tempfile::Builder::new()
            .prefix(".graph-")
            .suffix(".partial")
            .tempfile_in(directory)
            .with_context(|| format!("Failed to create temporary file in {}", directory.display()))?;

        {
            let mut writer = BufWriter::new(temp_file.as_file_mut());
            self.write_to(&mut writer)?;
            writer.flush()?;
        }

        temp_file
            .persist(path)
            .with_context(|| format!("Failed to move graph into place at {}", path.display()))?;

        Ok(fs::metadata(path)?.len())
    }

    /// Serializes header, metadata and initializer data.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let metadata = serde_json::to_vec(&self.metadata())?;

        writer.write_u32::<LittleEndian>(Self::MAGIC_NUMBER)?;
        writer.write_u32::<LittleEndian>(Self::VERSION)?;
        writer.write_u32::<LittleEndian>(self.opset)?;
        writer.write_u64::<LittleEndian>(metadata.len() as u64)?;
        writer.write_all(&metadata)?;

        self.initializers.iter().try_for_each(|init| init.tensor.write_le(writer))
    }

    /// Reads only the header and metadata of a graph file.
    pub fn read_metadata(path: &Path) -> Result<GraphMetadata> {
        let file = File::open(path).with_context(|| format!("Failed to open graph file {}", path.display()))?;
        let file_size = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        Self::read_metadata_from(&mut reader, file_size)
            .with_context(|| format!("Failed to read graph file {}", path.display()))
    }

    /// Reads a complete graph file, initializer data included.
    pub fn read(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Failed to open graph file {}", path.display()))?;
        let file_size = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let metadata = Self::read_metadata_from(&mut reader, file_size)
            .with_context(|| format!("Failed to read graph file {}", path.display()))?;

        let mut expected_offset = 0u64;
        let initializers = metadata
            .initializers
            .iter()
            .map(|entry| {
                if entry.offset != expected_offset {
                    anyhow::bail!("Initializer '{}' is not contiguous (offset {})", entry.name, entry.offset);
                }
                expected_offset += entry.length;
                let tensor = Tensor::read_le(&mut reader, entry.dtype, entry.shape.clone())
                    .with_context(|| format!("Failed to read initializer '{}'", entry.name))?;
                Ok(Initializer { name: entry.name.clone(), tensor: Arc::new(tensor) })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            producer: metadata.producer,
            opset: metadata.opset,
            inputs: metadata.inputs,
            outputs: metadata.outputs,
            nodes: metadata.nodes,
            initializers,
            dynamic_axes: metadata.dynamic_axes,
        })
    }

    fn read_metadata_from<R: Read>(reader: &mut R, file_size: u64) -> Result<GraphMetadata> {
        let magic = reader.read_u32::<LittleEndian>()?;
        if magic != Self::MAGIC_NUMBER {
            anyhow::bail!("Not a graph file: bad magic number {magic:#010x}");
        }

        let version = reader.read_u32::<LittleEndian>()?;
        if version != Self::VERSION {
            anyhow::bail!("Unsupported graph file version {version}, expected {}", Self::VERSION);
        }

        let opset = reader.read_u32::<LittleEndian>()?;
        let metadata_len = reader.read_u64::<LittleEndian>()?;
        if metadata_len > file_size {
            anyhow::bail!("Metadata length {metadata_len} exceeds file size {file_size}");
        }

        let mut metadata = vec![0u8; metadata_len as usize];
        reader.read_exact(&mut metadata)?;
        let metadata: GraphMetadata = serde_json::from_slice(&metadata).context("Failed to parse graph metadata")?;

        if metadata.opset != opset {
            anyhow::bail!("Header opset {opset} disagrees with metadata opset {}", metadata.opset);
        }

        Ok(metadata)
    }
}
