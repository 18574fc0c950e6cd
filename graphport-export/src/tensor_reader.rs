use anyhow::{Context, Result};
use half::{bf16, f16};
use log::{debug, info};
use memmap2::Mmap;
use safetensors::{Dtype, SafeTensors, tensor::TensorView};
use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    fs::File,
    mem,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use crate::tensor::Tensor;

/// Memory-mapped reader over every `*.safetensors` file of a model directory.
#[derive(Debug)]
pub(crate) struct TensorReader {
    safetensors_files: Vec<PathBuf>,
    mmap_cache: Arc<Mutex<MmapCache>>,
}

impl TensorReader {
    pub fn new(model_dir: &Path) -> Result<Self> {
        let mut safetensors_files = std::fs::read_dir(model_dir)
            .with_context(|| format!("Failed to read directory: {}", model_dir.display()))?
            .filter_map(|entry| {
                let path = entry.ok()?.path();
                matches!(path.extension(), Some(ext) if ext == "safetensors").then_some(path)
            })
            .collect::<Vec<_>>();
        // Shards are searched in a stable order.
        safetensors_files.sort();

        if safetensors_files.is_empty() {
            anyhow::bail!("No SafeTensors files found in {}", model_dir.display());
        }

        info!("Found {} safetensor files", safetensors_files.len());

        Ok(TensorReader { safetensors_files, mmap_cache: Arc::new(Mutex::new(MmapCache::new(10))) })
    }

    /// Loads a tensor by exact name as f32, keeping its shape.
    pub fn load_tensor(&self, tensor_name: &str) -> Result<Option<Tensor>> {
        for filename in &self.safetensors_files {
            let mmap = self.get_mmap(filename)?;
            let safetensors = SafeTensors::deserialize(&mmap)
                .with_context(|| format!("Failed to deserialize {}", filename.display()))?;

            if let Ok(view) = safetensors.tensor(tensor_name) {
                let data = Self::convert_tensor_to_f32(&view, tensor_name)?;
                return Tensor::from_f32(view.shape().to_vec(), data).map(Some);
            }
        }
        Ok(None)
    }

    /// Looks a tensor up under each prefix in turn, the bare name last.
    pub fn find(&self, name: &str, prefixes: &[&str]) -> Result<Option<Tensor>> {
        for prefix in prefixes.iter().copied().chain(std::iter::once("")) {
            let candidate = format!("{prefix}{name}");
            if let Some(tensor) = self.load_tensor(&candidate)? {
                debug!("Loaded {candidate} {:?}", tensor.shape());
                return Ok(Some(tensor));
            }
        }
        Ok(None)
    }

    pub fn tensor_names(&self) -> Result<BTreeSet<String>> {
        let mut names = BTreeSet::new();
        for filename in &self.safetensors_files {
            let mmap = self.get_mmap(filename)?;
            let safetensors = SafeTensors::deserialize(&mmap)
                .with_context(|| format!("Failed to deserialize {}", filename.display()))?;
            names.extend(safetensors.names().into_iter().cloned());
        }
        Ok(names)
    }

    fn convert_tensor_to_f32(tensor_view: &TensorView<'_>, tensor_name: &str) -> Result<Vec<f32>> {
        let tensor_data = tensor_view.data();
        let dtype = tensor_view.dtype();
        let expected_elements = tensor_view.shape().iter().product::<usize>();

        match dtype {
            Dtype::F32 => {
                Self::validate_tensor_size(tensor_data.len(), expected_elements * mem::size_of::<f32>(), tensor_name, "F32")?;
                Ok(Self::convert_f32_data(tensor_data))
            }
            Dtype::F16 => {
                Self::validate_tensor_size(tensor_data.len(), expected_elements * 2, tensor_name, "F16")?;
                Ok(Self::convert_half_data(tensor_data, |bytes| f16::from_le_bytes(bytes).to_f32()))
            }
            Dtype::BF16 => {
                Self::validate_tensor_size(tensor_data.len(), expected_elements * 2, tensor_name, "BF16")?;
                Ok(Self::convert_half_data(tensor_data, |bytes| bf16::from_le_bytes(bytes).to_f32()))
            }
            _ => anyhow::bail!("Unsupported tensor dtype {dtype:?} for {tensor_name}"),
        }
    }

    fn validate_tensor_size(actual_bytes: usize, expected_bytes: usize, tensor_name: &str, dtype_name: &str) -> Result<()> {
        if actual_bytes != expected_bytes {
            anyhow::bail!(
                "{dtype_name} tensor {tensor_name} size mismatch. Expected {expected_bytes} bytes, got {actual_bytes}"
            );
        }
        Ok(())
    }

    fn convert_f32_data(data: &[u8]) -> Vec<f32> {
        data.chunks_exact(mem::size_of::<f32>())
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect()
    }

    fn convert_half_data(data: &[u8], convert: fn([u8; 2]) -> f32) -> Vec<f32> {
        data.chunks_exact(2).map(|chunk| convert([chunk[0], chunk[1]])).collect()
    }

    fn get_mmap(&self, path: &Path) -> Result<Arc<Mmap>> {
        let mut cache = self.mmap_cache.lock().map_err(|_| anyhow::anyhow!("Failed to acquire cache lock"))?;

        if let Some(cached_mmap) = cache.get(path) {
            return Ok(cached_mmap);
        }

        let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;

        // SAFETY: All file-backed memory map constructors are marked `unsafe` because of the potential for
        // *Undefined Behavior* (UB) using the map if the underlying file is subsequently modified, in or
        // out of process.
        let mmap = Arc::new(unsafe { Mmap::map(&file) }.with_context(|| format!("Failed to memory map {}", path.display()))?);

        cache.insert(path.to_path_buf(), Arc::clone(&mmap));
        Ok(mmap)
    }
}

/// LRU cache of memory mappings.
#[derive(Debug)]
struct MmapCache {
    cache: HashMap<PathBuf, Arc<Mmap>>,
    access_order: VecDeque<PathBuf>,
    max_size: usize,
}

impl MmapCache {
    fn new(max_size: usize) -> Self {
        Self { cache: HashMap::new(), access_order: VecDeque::new(), max_size }
    }

    fn get(&mut self, path: &Path) -> Option<Arc<Mmap>> {
        let mmap = self.cache.get(path)?;
        if let Some(pos) = self.access_order.iter().position(|p| p == path) {
            self.access_order.remove(pos);
        }
        self.access_order.push_front(path.to_path_buf());
        Some(Arc::clone(mmap))
    }

    fn insert(&mut self, path: PathBuf, mmap: Arc<Mmap>) {
        if let Some(pos) = self.access_order.iter().position(|p| p == &path) {
            self.access_order.remove(pos);
        }

        while self.cache.len() >= self.max_size {
            let Some(lru_path) = self.access_order.pop_back() else { break };
            self.cache.remove(&lru_path);
        }

        self.cache.insert(path.clone(), mmap);
        self.access_order.push_front(path);
    }
}
