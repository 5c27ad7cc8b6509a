//! Weight loading and parameter dictionaries.
//!
//! Loads a HF model directory (config.json + safetensors shards) into an
//! ordered name → tensor map, the Rust counterpart of a PyTorch state dict.

pub mod quant;
pub mod safetensors_io;

use crate::error::{Result, SurgeonError};
use crate::weights::safetensors_io::MmapSafetensors;
use half::{bf16, f16};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

/// Model configuration (subset of config.json relevant to MoE routing).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelConfig {
    pub hidden_size: usize,
    pub moe_intermediate_size: usize,
    pub n_routed_experts: usize,
    pub num_experts_per_tok: usize,
    pub num_hidden_layers: usize,
    #[serde(default = "default_first_k_dense")]
    pub first_k_dense_replace: usize,
    #[serde(default = "default_scoring_func")]
    pub scoring_func: String,
    #[serde(default = "default_aux_loss_alpha")]
    pub aux_loss_alpha: f32,
    #[serde(default = "default_true")]
    pub seq_aux: bool,
    #[serde(default)]
    pub norm_topk_prob: bool,
    #[serde(default = "default_hidden_act")]
    pub hidden_act: String,
}

fn default_first_k_dense() -> usize {
    1
}

fn default_scoring_func() -> String {
    "softmax".to_string()
}

fn default_aux_loss_alpha() -> f32 {
    0.001
}

fn default_true() -> bool {
    true
}

fn default_hidden_act() -> String {
    "silu".to_string()
}

impl ModelConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| SurgeonError::io(path, e))?;
        serde_json::from_str(&text).map_err(|e| SurgeonError::json(path.display().to_string(), e))
    }

    /// Number of decoder layers carrying a routed MoE block.
    pub fn num_moe_layers(&self) -> usize {
        self.num_hidden_layers.saturating_sub(self.first_k_dense_replace)
    }
}

/// Element types found in HF safetensors checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    F64,
    F32,
    F16,
    BF16,
    I64,
    I32,
    I16,
    I8,
    U8,
    Bool,
}

impl DType {
    pub fn from_name(name: &str) -> Result<Self> {
        Ok(match name {
            "F64" => DType::F64,
            "F32" => DType::F32,
            "F16" => DType::F16,
            "BF16" => DType::BF16,
            "I64" => DType::I64,
            "I32" => DType::I32,
            "I16" => DType::I16,
            "I8" => DType::I8,
            "U8" => DType::U8,
            "BOOL" => DType::Bool,
            other => return Err(SurgeonError::UnsupportedDtype(other.to_string())),
        })
    }

    /// Safetensors header spelling.
    pub fn name(self) -> &'static str {
        match self {
            DType::F64 => "F64",
            DType::F32 => "F32",
            DType::F16 => "F16",
            DType::BF16 => "BF16",
            DType::I64 => "I64",
            DType::I32 => "I32",
            DType::I16 => "I16",
            DType::I8 => "I8",
            DType::U8 => "U8",
            DType::Bool => "BOOL",
        }
    }

    /// Bytes per element.
    pub fn size(self) -> usize {
        match self {
            DType::F64 | DType::I64 => 8,
            DType::F32 | DType::I32 => 4,
            DType::F16 | DType::BF16 | DType::I16 => 2,
            DType::I8 | DType::U8 | DType::Bool => 1,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, DType::F64 | DType::F32 | DType::F16 | DType::BF16)
    }
}

/// An immutable tensor: dtype, shape and little-endian bytes.
///
/// Bytes are shared, so cloning a tensor (and therefore a `ParamDict`) is cheap.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    dtype: DType,
    shape: Vec<usize>,
    data: Arc<[u8]>,
}

impl Tensor {
    pub fn new(dtype: DType, shape: Vec<usize>, data: Vec<u8>) -> Result<Self> {
        let expected = byte_len(&shape, dtype)
            .ok_or_else(|| SurgeonError::dims("tensor bytes", &shape, &[data.len()]))?;
        if data.len() != expected {
            return Err(SurgeonError::dims("tensor bytes", &[expected], &[data.len()]));
        }
        Ok(Tensor { dtype, shape, data: data.into() })
    }

    /// Encode f32 values as `dtype` (float dtypes only).
    pub fn from_f32(values: &[f32], shape: &[usize], dtype: DType) -> Result<Self> {
        let numel = shape.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d));
        if numel != Some(values.len()) {
            return Err(SurgeonError::dims("tensor values", shape, &[values.len()]));
        }
        let mut data = Vec::with_capacity(values.len() * dtype.size());
        match dtype {
            DType::F64 => values.iter().for_each(|&v| data.extend_from_slice(&(v as f64).to_le_bytes())),
            DType::F32 => values.iter().for_each(|&v| data.extend_from_slice(&v.to_le_bytes())),
            DType::F16 => values.iter().for_each(|&v| data.extend_from_slice(&f16::from_f32(v).to_le_bytes())),
            DType::BF16 => values.iter().for_each(|&v| data.extend_from_slice(&bf16::from_f32(v).to_le_bytes())),
            other => return Err(SurgeonError::UnsupportedDtype(format!("{} from f32", other.name()))),
        }
        Tensor::new(dtype, shape.to_vec(), data)
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }

    /// Decode to f32 (float dtypes only).
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        let d = &self.data;
        Ok(match self.dtype {
            DType::F64 => d
                .chunks_exact(8)
                .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f32)
                .collect(),
            DType::F32 => d.chunks_exact(4).map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect(),
            DType::F16 => d.chunks_exact(2).map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32()).collect(),
            DType::BF16 => d.chunks_exact(2).map(|c| bf16::from_le_bytes([c[0], c[1]]).to_f32()).collect(),
            other => return Err(SurgeonError::UnsupportedDtype(format!("{} to f32", other.name()))),
        })
    }

    /// Fail with `DimensionMismatch` unless the shape is exactly `expected`.
    pub fn expect_shape(&self, name: &str, expected: &[usize]) -> Result<()> {
        if self.shape != expected {
            return Err(SurgeonError::dims(name, expected, &self.shape));
        }
        Ok(())
    }
}

/// Bytes held by a `shape` tensor of `dtype`; `None` if the size overflows.
pub fn byte_len(shape: &[usize], dtype: DType) -> Option<usize> {
    shape.iter().try_fold(dtype.size(), |acc, &d| acc.checked_mul(d))
}

/// Ordered parameter name → tensor map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamDict {
    tensors: BTreeMap<String, Tensor>,
}

impl ParamDict {
    pub fn new() -> Self {
        ParamDict::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) -> Option<Tensor> {
        self.tensors.insert(name.into(), tensor)
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    pub fn require(&self, name: &str) -> Result<&Tensor> {
        self.get(name).ok_or_else(|| SurgeonError::MissingTensor(name.to_string()))
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.tensors.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Tensor)> {
        self.tensors.iter()
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn extend(&mut self, other: ParamDict) {
        self.tensors.extend(other.tensors);
    }

    /// Total parameter bytes.
    pub fn size_bytes(&self) -> usize {
        self.tensors.values().map(Tensor::size_bytes).sum()
    }
}

impl FromIterator<(String, Tensor)> for ParamDict {
    fn from_iter<I: IntoIterator<Item = (String, Tensor)>>(iter: I) -> Self {
        ParamDict { tensors: iter.into_iter().collect() }
    }
}

/// Names of the three expert projections, in state-dict order.
pub const EXPERT_PROJS: [&str; 3] = ["gate_proj", "up_proj", "down_proj"];

pub fn gate_key(prefix: &str, layer_idx: usize) -> String {
    format!("{prefix}.layers.{layer_idx}.mlp.gate.weight")
}

pub fn expert_key(prefix: &str, layer_idx: usize, expert_idx: usize, proj: &str) -> String {
    format!("{prefix}.layers.{layer_idx}.mlp.experts.{expert_idx}.{proj}.weight")
}

/// The three projection keys of one expert.
pub fn expert_keys(prefix: &str, layer_idx: usize, expert_idx: usize) -> [String; 3] {
    EXPERT_PROJS.map(|proj| expert_key(prefix, layer_idx, expert_idx, proj))
}

/// Safetensors shard index: maps tensor names to shard filenames.
#[derive(Deserialize)]
struct SafetensorsIndex {
    weight_map: HashMap<String, String>,
}

/// Load config.json and every tensor from a HF model directory.
///
/// Reads `model.safetensors.index.json` when present, else `model.safetensors`.
pub fn load_model_dir(model_dir: &Path) -> Result<(ModelConfig, ParamDict)> {
    let start = std::time::Instant::now();

    let config = ModelConfig::from_file(&model_dir.join("config.json"))?;
    log::info!(
        "Model config: hidden={}, moe_intermediate={}, experts={}, top-{}, layers={}, first_dense={}",
        config.hidden_size, config.moe_intermediate_size, config.n_routed_experts,
        config.num_experts_per_tok, config.num_hidden_layers, config.first_k_dense_replace,
    );

    let index_path = model_dir.join("model.safetensors.index.json");
    let shard_names: Vec<String> = if index_path.exists() {
        let index_str = std::fs::read_to_string(&index_path).map_err(|e| SurgeonError::io(&index_path, e))?;
        let index: SafetensorsIndex = serde_json::from_str(&index_str)
            .map_err(|e| SurgeonError::json("safetensors index", e))?;
        let mut names: Vec<String> = index.weight_map.into_values().collect();
        names.sort();
        names.dedup();
        names
    } else {
        vec!["model.safetensors".to_string()]
    };

    let mut params = ParamDict::new();
    for name in &shard_names {
        let shard = MmapSafetensors::open(&model_dir.join(name))?;
        for tensor_name in shard.names() {
            params.insert(tensor_name, shard.tensor(tensor_name)?);
        }
        log::info!("Loaded shard {name}: {} tensors", shard.len());
    }

    log::info!(
        "Loaded {} tensors from {} shard(s) in {:.1}s",
        params.len(),
        shard_names.len(),
        start.elapsed().as_secs_f64(),
    );
    Ok((config, params))
}

/// Auto-detect the prefix in front of `.layers.` for expert weights.
/// Returns "model" for DeepSeek/Qwen-style checkpoints.
pub fn detect_layers_prefix(params: &ParamDict) -> Result<String> {
    for key in params.keys() {
        if let Some(pos) = key.find(".layers.") {
            if key.contains(".mlp.experts.") {
                return Ok(key[..pos].to_string());
            }
        }
    }
    Err(SurgeonError::MissingTensor("no `.layers.N.mlp.experts.` tensors in checkpoint".to_string()))
}
