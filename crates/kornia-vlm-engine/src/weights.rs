//! Checkpoint tensors: reading them from disk, tracking their consumption while the
//! module graph is built, and merging optional low-rank adapters.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Shape, Tensor};
use serde::Deserialize;

use crate::error::VlmError;

const SINGLE_FILE: &str = "model.safetensors";
const INDEX_FILE: &str = "model.safetensors.index.json";

/// Tensors keyed by their checkpoint name.
#[derive(Debug, Clone, Default)]
pub struct WeightTable {
    tensors: HashMap<String, Tensor>,
}

impl WeightTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) -> Option<Tensor> {
        self.tensors.insert(name.into(), tensor)
    }

    pub fn remove(&mut self, name: &str) -> Option<Tensor> {
        self.tensors.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    /// Tensor names in lexicographic order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tensors.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Tensor)> {
        self.tensors.iter()
    }

    /// Replace the leading `from` of every matching name by `to`.
    pub fn rename_prefix(mut self, from: &str, to: &str) -> Self {
        for name in self.names() {
            if let Some(rest) = name.strip_prefix(from) {
                if let Some(tensor) = self.tensors.remove(&name) {
                    self.tensors.insert(format!("{to}{rest}"), tensor);
                }
            }
        }
        self
    }

    /// Rename a single tensor if present.
    pub fn rename(mut self, from: &str, to: &str) -> Self {
        if let Some(tensor) = self.tensors.remove(from) {
            self.tensors.insert(to.to_string(), tensor);
        }
        self
    }

    /// Drop every tensor whose name matches `predicate`.
    pub fn drop_where(mut self, predicate: impl Fn(&str) -> bool) -> Self {
        self.tensors.retain(|name, _| !predicate(name));
        self
    }
}

impl FromIterator<(String, Tensor)> for WeightTable {
    fn from_iter<I: IntoIterator<Item = (String, Tensor)>>(iter: I) -> Self {
        Self {
            tensors: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for WeightTable {
    type Item = (String, Tensor);
    type IntoIter = std::collections::hash_map::IntoIter<String, Tensor>;

    fn into_iter(self) -> Self::IntoIter {
        self.tensors.into_iter()
    }
}

#[derive(Deserialize)]
struct ShardIndex {
    weight_map: HashMap<String, String>,
}

/// Reads serialized tensors, independent of any model semantics.
#[derive(Debug, Clone)]
pub struct TensorStore {
    files: Vec<PathBuf>,
}

impl TensorStore {
    pub fn from_files(files: Vec<PathBuf>) -> Self {
        Self { files }
    }

    /// Locate the weight files of a checkpoint directory.
    ///
    /// A shard index takes precedence over a single `model.safetensors`, which takes
    /// precedence over any other `*.safetensors` files found in the directory.
    pub fn discover(dir: &Path) -> Result<Self, VlmError> {
        let index = dir.join(INDEX_FILE);
        if index.is_file() {
            return Ok(Self::from_files(Self::shards_from_index(&index)?));
        }

        let single = dir.join(SINGLE_FILE);
        if single.is_file() {
            return Ok(Self::from_files(vec![single]));
        }

        let entries = std::fs::read_dir(dir).map_err(|e| {
            VlmError::WeightsUnreadable(format!("cannot list {}: {e}", dir.display()))
        })?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
                name.ends_with(".safetensors") && !name.starts_with("adapter")
            })
            .collect();
        files.sort();

        if files.is_empty() {
            return Err(VlmError::WeightsUnreadable(format!(
                "no safetensors files in {}",
                dir.display()
            )));
        }
        Ok(Self::from_files(files))
    }

    /// Shard file paths listed in a `model.safetensors.index.json`, sorted and deduplicated.
    pub fn shards_from_index(index: &Path) -> Result<Vec<PathBuf>, VlmError> {
        let unreadable = |e: String| {
            VlmError::WeightsUnreadable(format!("shard index {}: {e}", index.display()))
        };
        let data = std::fs::read_to_string(index).map_err(|e| unreadable(e.to_string()))?;
        let parsed: ShardIndex =
            serde_json::from_str(&data).map_err(|e| unreadable(e.to_string()))?;

        let dir = index.parent().unwrap_or_else(|| Path::new("."));
        let shards: HashSet<&String> = parsed.weight_map.values().collect();
        let mut files: Vec<PathBuf> = shards.into_iter().map(|f| dir.join(f)).collect();
        files.sort();
        Ok(files)
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Read every tensor, casting floating point tensors to `dtype`.
    pub fn load(&self, dtype: DType, device: &Device) -> Result<WeightTable, VlmError> {
        let mut table = WeightTable::new();
        for file in &self.files {
            let tensors = candle_core::safetensors::load(file, device).map_err(|e| {
                VlmError::WeightsUnreadable(format!("{}: {e}", file.display()))
            })?;

            for (name, tensor) in tensors {
                let tensor = if tensor.dtype().is_float() && tensor.dtype() != dtype {
                    tensor.to_dtype(dtype).map_err(|e| {
                        VlmError::WeightsUnreadable(format!("casting `{name}`: {e}"))
                    })?
                } else {
                    tensor
                };
                if table.contains(&name) {
                    return Err(VlmError::WeightsUnreadable(format!(
                        "tensor `{name}` appears in more than one file"
                    )));
                }
                table.insert(name, tensor);
            }
            log::debug!("read {}", file.display());
        }
        Ok(table)
    }
}

/// Outcome of moving a sanitized table into a module graph.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Parameter names filled from the table, in injection order.
    pub injected: Vec<String>,
    /// Checkpoint tensors nothing asked for, sorted.
    pub unused: Vec<String>,
}

/// Hands sanitized tensors to module constructors, checking each against the
/// destination shape.
pub struct WeightInjector {
    table: WeightTable,
    injected: Vec<String>,
}

impl WeightInjector {
    pub fn new(table: WeightTable) -> Self {
        Self {
            table,
            injected: Vec::new(),
        }
    }

    fn check(name: &str, tensor: &Tensor, shape: &Shape) -> Result<(), VlmError> {
        if tensor.dims() != shape.dims() {
            return Err(VlmError::WeightShapeMismatch {
                name: name.to_string(),
                expected: shape.dims().to_vec(),
                actual: tensor.dims().to_vec(),
            });
        }
        Ok(())
    }

    /// Move the tensor `name` out of the table.
    pub fn take<S: Into<Shape>>(&mut self, name: &str, shape: S) -> Result<Tensor, VlmError> {
        let shape = shape.into();
        let tensor = self
            .table
            .remove(name)
            .ok_or_else(|| VlmError::MissingWeights(name.to_string()))?;
        Self::check(name, &tensor, &shape)?;
        self.injected.push(name.to_string());
        Ok(tensor)
    }

    /// Like [`WeightInjector::take`] for parameters the checkpoint may legitimately omit.
    pub fn take_optional<S: Into<Shape>>(
        &mut self,
        name: &str,
        shape: S,
    ) -> Result<Option<Tensor>, VlmError> {
        if self.table.contains(name) {
            self.take(name, shape).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Clone the tensor `name` without consuming it, for parameters shared between modules.
    pub fn share<S: Into<Shape>>(&self, name: &str, shape: S) -> Result<Tensor, VlmError> {
        let shape = shape.into();
        let tensor = self
            .table
            .get(name)
            .ok_or_else(|| VlmError::MissingWeights(name.to_string()))?;
        Self::check(name, tensor, &shape)?;
        Ok(tensor.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.table.contains(name)
    }

    /// Consume the injector, warning about leftover tensors.
    pub fn finish(self) -> LoadReport {
        let unused = self.table.names();
        if !unused.is_empty() {
            log::warn!(
                "{} checkpoint tensors were not used: {}",
                unused.len(),
                unused.join(", ")
            );
        }
        LoadReport {
            injected: self.injected,
            unused,
        }
    }
}

/// A low-rank adapter merged into base weights as `W += scale * B @ A`.
#[derive(Debug, Clone)]
pub struct LoraAdapter {
    // target parameter name -> (A: (rank, in), B: (out, rank))
    pairs: BTreeMap<String, (Tensor, Tensor)>,
    scale: f64,
}

impl LoraAdapter {
    const PEFT_PREFIX: &'static str = "base_model.model.";

    /// Read a PEFT-style adapter file.
    pub fn from_safetensors(path: impl AsRef<Path>, scale: f64) -> Result<Self, VlmError> {
        let path = path.as_ref();
        let tensors = candle_core::safetensors::load(path, &Device::Cpu)
            .map_err(|e| VlmError::WeightsUnreadable(format!("{}: {e}", path.display())))?;
        Self::from_tensors(tensors, scale)
    }

    /// Pair up `<param>.lora_A.weight` and `<param>.lora_B.weight` entries.
    pub fn from_tensors(tensors: HashMap<String, Tensor>, scale: f64) -> Result<Self, VlmError> {
        let mut a_parts = HashMap::new();
        let mut b_parts = HashMap::new();
        for (name, tensor) in tensors {
            let name = name
                .strip_prefix(Self::PEFT_PREFIX)
                .map(str::to_string)
                .unwrap_or(name);
            if let Some(base) = name.strip_suffix(".lora_A.weight") {
                a_parts.insert(format!("{base}.weight"), tensor);
            } else if let Some(base) = name.strip_suffix(".lora_B.weight") {
                b_parts.insert(format!("{base}.weight"), tensor);
            }
        }

        let mut pairs = BTreeMap::new();
        for (target, a) in a_parts {
            let b = b_parts.remove(&target).ok_or_else(|| {
                VlmError::WeightsUnreadable(format!("adapter has no lora_B for `{target}`"))
            })?;
            pairs.insert(target, (a, b));
        }
        if let Some(target) = b_parts.keys().next() {
            return Err(VlmError::WeightsUnreadable(format!(
                "adapter has no lora_A for `{target}`"
            )));
        }

        Ok(Self { pairs, scale })
    }

    /// Parameter names this adapter modifies.
    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.pairs.keys().map(String::as_str)
    }

    /// Add every low-rank update to its target in `table`. Returns the number of
    /// updated parameters.
    pub fn merge_into(&self, table: &mut WeightTable) -> Result<usize, VlmError> {
        for (target, (a, b)) in &self.pairs {
            let base = table
                .remove(target)
                .ok_or_else(|| VlmError::MissingWeights(target.clone()))?;

            let (out_dim, in_dim) = base.dims2().map_err(|_| VlmError::WeightShapeMismatch {
                name: target.clone(),
                expected: vec![b.dims()[0], a.dims().last().copied().unwrap_or(0)],
                actual: base.dims().to_vec(),
            })?;
            let consistent = a.rank() == 2
                && b.rank() == 2
                && a.dims()[0] == b.dims()[1]
                && a.dims()[1] == in_dim
                && b.dims()[0] == out_dim;
            if !consistent {
                return Err(VlmError::WeightShapeMismatch {
                    name: target.clone(),
                    expected: vec![out_dim, in_dim],
                    actual: vec![b.dims()[0], a.dims().last().copied().unwrap_or(0)],
                });
            }

            let merged = (|| {
                let a = a.to_device(base.device())?.to_dtype(DType::F32)?;
                let b = b.to_device(base.device())?.to_dtype(DType::F32)?;
                let delta = (b.matmul(&a)? * self.scale)?;
                (base.to_dtype(DType::F32)? + delta)?.to_dtype(base.dtype())
            })()
            .map_err(|e| {
                VlmError::WeightsUnreadable(format!("merging adapter into `{target}`: {e}"))
            })?;
            table.insert(target.clone(), merged);
        }
        log::info!("merged {} adapter updates", self.pairs.len());
        Ok(self.pairs.len())
    }
}
