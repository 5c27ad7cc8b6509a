//! MoE layer model: a routing gate plus a list of expert slots.
//!
//! Each slot holds either a standard full-precision expert or a quantized one,
//! chosen explicitly per slot. Expert compute follows the DeepSeek MLP:
//!   1. gate_out = x @ gate_proj^T, up_out = x @ up_proj^T
//!   2. hidden = act(gate_out) * up_out
//!   3. out = hidden @ down_proj^T
//! and an MoE layer sums the selected experts' outputs weighted by the gate.

use crate::error::{Result, SurgeonError};
use crate::gate::{GateConfig, GateOutput, MoeGate};
use crate::kernel::matvec::{matvec_dense, matvec_quantized, matvec_quantized_parallel};
use crate::weights::quant::{QuantSpec, QuantizedMatrix};
use crate::weights::{expert_keys, gate_key, DType, ModelConfig, ParamDict, Tensor};
use rand::distributions::{Distribution, Uniform};
use rand::Rng;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Where an expert's weights are meant to live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Device {
    #[default]
    Cpu,
    Cuda(usize),
}

impl FromStr for Device {
    type Err = SurgeonError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cpu" => Ok(Device::Cpu),
            "cuda" => Ok(Device::Cuda(0)),
            _ => s
                .strip_prefix("cuda:")
                .and_then(|ordinal| ordinal.parse().ok())
                .map(Device::Cuda)
                .ok_or_else(|| SurgeonError::InvalidPlan(format!("unknown device {s:?} (cpu, cuda, cuda:N)"))),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
        }
    }
}

/// Expert MLP activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Silu,
    GeluTanh,
}

impl Activation {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "silu" | "swish" => Ok(Activation::Silu),
            "gelu_new" | "gelu_pytorch_tanh" => Ok(Activation::GeluTanh),
            other => Err(SurgeonError::NotImplemented(format!("expert activation {other}"))),
        }
    }

    #[inline]
    fn apply(self, x: f32) -> f32 {
        match self {
            Activation::Silu => x * fast_sigmoid(x),
            Activation::GeluTanh => {
                0.5 * x * (1.0 + ((2.0 / std::f32::consts::PI).sqrt() * (x + 0.044715 * x * x * x)).tanh())
            }
        }
    }
}

/// Fast sigmoid approximation: 1 / (1 + exp(-x))
#[inline]
fn fast_sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Full-precision expert, projections kept in their checkpoint dtype.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseExpert {
    /// gate_proj: [intermediate_size, hidden_size]
    pub gate_proj: Tensor,
    /// up_proj: [intermediate_size, hidden_size]
    pub up_proj: Tensor,
    /// down_proj: [hidden_size, intermediate_size]
    pub down_proj: Tensor,
    pub device: Device,
}

impl DenseExpert {
    pub fn new(gate_proj: Tensor, up_proj: Tensor, down_proj: Tensor) -> Result<Self> {
        let [inter, hidden] = match gate_proj.shape() {
            &[i, h] => [i, h],
            other => return Err(SurgeonError::dims("gate_proj", &[0, 0], other)),
        };
        up_proj.expect_shape("up_proj", &[inter, hidden])?;
        down_proj.expect_shape("down_proj", &[hidden, inter])?;
        Ok(DenseExpert { gate_proj, up_proj, down_proj, device: Device::Cpu })
    }

    /// Freshly initialised expert: each projection Kaiming-uniform, U(-1/√fan_in, 1/√fan_in).
    pub fn kaiming<R: Rng>(hidden_size: usize, intermediate_size: usize, dtype: DType, rng: &mut R) -> Result<Self> {
        let mut linear = |out_features: usize, in_features: usize| {
            let bound = 1.0 / (in_features.max(1) as f32).sqrt();
            let dist = Uniform::new_inclusive(-bound, bound);
            let values: Vec<f32> = (0..out_features * in_features).map(|_| dist.sample(&mut *rng)).collect();
            Tensor::from_f32(&values, &[out_features, in_features], dtype)
        };
        let gate_proj = linear(intermediate_size, hidden_size)?;
        let up_proj = linear(intermediate_size, hidden_size)?;
        let down_proj = linear(hidden_size, intermediate_size)?;
        DenseExpert::new(gate_proj, up_proj, down_proj)
    }

    pub fn from_params(params: &ParamDict, prefix: &str, layer_idx: usize, expert_idx: usize) -> Result<Self> {
        let [gate, up, down] = expert_keys(prefix, layer_idx, expert_idx);
        DenseExpert::new(
            params.require(&gate)?.clone(),
            params.require(&up)?.clone(),
            params.require(&down)?.clone(),
        )
    }

    pub fn hidden_size(&self) -> usize {
        self.gate_proj.shape()[1]
    }

    pub fn intermediate_size(&self) -> usize {
        self.gate_proj.shape()[0]
    }

    pub fn dtype(&self) -> DType {
        self.gate_proj.dtype()
    }
}

/// Expert whose three projections are stored quantized.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedExpert {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub spec: QuantSpec,
    /// dtype used when the expert is exported to a parameter dictionary.
    pub dtype: DType,
    pub gate: QuantizedMatrix,
    pub up: QuantizedMatrix,
    pub down: QuantizedMatrix,
    pub device: Device,
}

impl QuantizedExpert {
    /// Empty expert of the given dimensions; weights arrive via `load_state`.
    pub fn with_dims(hidden_size: usize, intermediate_size: usize, spec: QuantSpec) -> Self {
        let (h, i, g, b) = (hidden_size, intermediate_size, spec.group_size, spec.bits);
        QuantizedExpert {
            hidden_size,
            intermediate_size,
            spec,
            dtype: DType::BF16,
            gate: QuantizedMatrix::zeros(i, h, g, b),
            up: QuantizedMatrix::zeros(i, h, g, b),
            down: QuantizedMatrix::zeros(h, i, g, b),
            device: Device::Cpu,
        }
    }

    /// Quantize `source`'s weights into this expert.
    ///
    /// Every projection must match this expert's dimensions exactly.
    pub fn load_state(&mut self, source: &DenseExpert) -> Result<()> {
        let (h, i) = (self.hidden_size, self.intermediate_size);
        source.gate_proj.expect_shape("gate_proj.weight", &[i, h])?;
        source.up_proj.expect_shape("up_proj.weight", &[i, h])?;
        source.down_proj.expect_shape("down_proj.weight", &[h, i])?;

        let QuantSpec { bits, group_size } = self.spec;
        self.gate = QuantizedMatrix::quantize(&source.gate_proj.to_f32_vec()?, i, h, group_size, bits)?;
        self.up = QuantizedMatrix::quantize(&source.up_proj.to_f32_vec()?, i, h, group_size, bits)?;
        self.down = QuantizedMatrix::quantize(&source.down_proj.to_f32_vec()?, h, i, group_size, bits)?;
        self.dtype = source.dtype();
        Ok(())
    }

    pub fn to_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn storage_bytes(&self) -> usize {
        self.gate.storage_bytes() + self.up.storage_bytes() + self.down.storage_bytes()
    }
}

/// One expert slot.
#[derive(Debug, Clone, PartialEq)]
pub enum Expert {
    Standard(DenseExpert),
    Quantized(QuantizedExpert),
}

impl Expert {
    pub fn hidden_size(&self) -> usize {
        match self {
            Expert::Standard(e) => e.hidden_size(),
            Expert::Quantized(e) => e.hidden_size,
        }
    }

    pub fn intermediate_size(&self) -> usize {
        match self {
            Expert::Standard(e) => e.intermediate_size(),
            Expert::Quantized(e) => e.intermediate_size,
        }
    }

    pub fn device(&self) -> Device {
        match self {
            Expert::Standard(e) => e.device,
            Expert::Quantized(e) => e.device,
        }
    }

    /// Storage label for logs: checkpoint dtype or quantized width.
    pub fn kind(&self) -> &'static str {
        match self {
            Expert::Standard(e) => e.dtype().name(),
            Expert::Quantized(e) => e.spec.bits.name(),
        }
    }

    pub fn storage_bytes(&self) -> usize {
        match self {
            Expert::Standard(e) => e.gate_proj.size_bytes() + e.up_proj.size_bytes() + e.down_proj.size_bytes(),
            Expert::Quantized(e) => e.storage_bytes(),
        }
    }

    /// Projection tensors in `[gate, up, down]` order; quantized slots dequantize.
    pub fn tensors(&self) -> Result<[Tensor; 3]> {
        match self {
            Expert::Standard(e) => Ok([e.gate_proj.clone(), e.up_proj.clone(), e.down_proj.clone()]),
            Expert::Quantized(e) => {
                let export = |m: &QuantizedMatrix| Tensor::from_f32(&m.dequantize(), &m.shape(), e.dtype);
                Ok([export(&e.gate)?, export(&e.up)?, export(&e.down)?])
            }
        }
    }
}

/// Scratch buffers for expert computation (reused across calls).
pub struct ExpertScratch {
    pub gate_out: Vec<f32>,
    pub up_out: Vec<f32>,
    /// act(gate) * up, input of down_proj.
    pub hidden: Vec<f32>,
    pub expert_out: Vec<f32>,
}

impl ExpertScratch {
    pub fn new(hidden_size: usize, intermediate_size: usize) -> Self {
        ExpertScratch {
            gate_out: vec![0.0f32; intermediate_size],
            up_out: vec![0.0f32; intermediate_size],
            hidden: vec![0.0f32; intermediate_size],
            expert_out: vec![0.0f32; hidden_size],
        }
    }
}

/// Compute a single expert's output: act(x @ gate^T) * (x @ up^T) @ down^T
///
/// Result is written to `scratch.expert_out`.
pub fn expert_forward(
    expert: &Expert,
    activation: &[f32],
    act: Activation,
    scratch: &mut ExpertScratch,
    parallel: bool,
) -> Result<()> {
    let (h, i) = (expert.hidden_size(), expert.intermediate_size());
    if activation.len() != h {
        return Err(SurgeonError::dims("expert input", &[h], &[activation.len()]));
    }
    if scratch.gate_out.len() != i || scratch.expert_out.len() != h {
        *scratch = ExpertScratch::new(h, i);
    }

    match expert {
        Expert::Standard(e) => {
            matvec_dense(&e.gate_proj.to_f32_vec()?, h, activation, &mut scratch.gate_out);
            matvec_dense(&e.up_proj.to_f32_vec()?, h, activation, &mut scratch.up_out);
        }
        Expert::Quantized(e) => {
            let matvec: fn(&QuantizedMatrix, &[f32], &mut [f32]) =
                if parallel { matvec_quantized_parallel } else { matvec_quantized };
            matvec(&e.gate, activation, &mut scratch.gate_out);
            matvec(&e.up, activation, &mut scratch.up_out);
        }
    }

    for ((hid, &g), &u) in scratch.hidden.iter_mut().zip(&scratch.gate_out).zip(&scratch.up_out) {
        *hid = act.apply(g) * u;
    }

    match expert {
        Expert::Standard(e) => matvec_dense(&e.down_proj.to_f32_vec()?, i, &scratch.hidden, &mut scratch.expert_out),
        Expert::Quantized(e) if parallel => matvec_quantized_parallel(&e.down, &scratch.hidden, &mut scratch.expert_out),
        Expert::Quantized(e) => matvec_quantized(&e.down, &scratch.hidden, &mut scratch.expert_out),
    }
    Ok(())
}

/// One decoder layer's routed MoE block.
#[derive(Debug, Clone, PartialEq)]
pub struct MoeLayer {
    /// Absolute decoder layer index.
    pub layer_idx: usize,
    pub gate: MoeGate,
    /// dtype the gate weight is exported in.
    pub gate_dtype: DType,
    pub experts: Vec<Expert>,
}

impl MoeLayer {
    pub fn from_params(
        params: &ParamDict,
        gate_config: &GateConfig,
        prefix: &str,
        layer_idx: usize,
    ) -> Result<Self> {
        let gate_name = gate_key(prefix, layer_idx);
        let gate_tensor = params.require(&gate_name)?;
        let n_experts = match gate_tensor.shape() {
            &[n, h] if h == gate_config.hidden_size => n,
            other => {
                return Err(SurgeonError::dims(gate_name, &[0, gate_config.hidden_size], other));
            }
        };
        let gate = MoeGate::new(gate_config.clone(), n_experts, gate_tensor.to_f32_vec()?)?;

        let experts = (0..n_experts)
            .map(|e| DenseExpert::from_params(params, prefix, layer_idx, e).map(Expert::Standard))
            .collect::<Result<Vec<_>>>()?;

        Ok(MoeLayer { layer_idx, gate, gate_dtype: gate_tensor.dtype(), experts })
    }

    pub fn num_slots(&self) -> usize {
        self.experts.len()
    }

    /// Live parameters of this layer, every slot included.
    pub fn state_dict(&self, prefix: &str) -> Result<ParamDict> {
        let mut params = ParamDict::new();
        params.insert(
            gate_key(prefix, self.layer_idx),
            Tensor::from_f32(self.gate.weight(), &[self.gate.n_experts, self.gate.config.hidden_size], self.gate_dtype)?,
        );
        for (idx, expert) in self.experts.iter().enumerate() {
            for (key, tensor) in expert_keys(prefix, self.layer_idx, idx).into_iter().zip(expert.tensors()?) {
                params.insert(key, tensor);
            }
        }
        Ok(params)
    }

    pub fn storage_bytes(&self) -> usize {
        self.gate.weight().len() * self.gate_dtype.size()
            + self.experts.iter().map(Expert::storage_bytes).sum::<usize>()
    }

    /// Route one token and combine the selected experts' outputs.
    pub fn forward_token(
        &self,
        activation: &[f32],
        act: Activation,
        scratch: &mut ExpertScratch,
        parallel: bool,
    ) -> Result<(GateOutput, Vec<f32>)> {
        let routing = self.gate.forward(activation, 1, 1, false)?;
        let mut output = vec![0.0f32; activation.len()];

        for (&eidx, &weight) in routing.topk_idx.iter().zip(&routing.topk_weight) {
            let expert = self.experts.get(eidx).ok_or_else(|| {
                SurgeonError::InvalidPlan(format!(
                    "layer {}: gate routed to slot {eidx} of {}",
                    self.layer_idx,
                    self.experts.len()
                ))
            })?;
            expert_forward(expert, activation, act, scratch, parallel)?;

            // Accumulate: output += weight * expert_out
            for (o, &v) in output.iter_mut().zip(&scratch.expert_out) {
                *o += weight * v;
            }
        }
        Ok((routing, output))
    }
}

/// Every routed MoE layer of a checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct MoeModel {
    pub config: ModelConfig,
    /// Tensor-name prefix in front of `.layers.`.
    pub prefix: String,
    /// Keyed by absolute decoder layer index.
    pub layers: BTreeMap<usize, MoeLayer>,
}

impl MoeModel {
    /// Collect layers `first_k_dense_replace..num_hidden_layers` from a checkpoint.
    pub fn from_params(config: &ModelConfig, params: &ParamDict, prefix: &str) -> Result<Self> {
        let gate_config = GateConfig::from_model(config)?;
        let mut layers = BTreeMap::new();
        for layer_idx in config.first_k_dense_replace..config.num_hidden_layers {
            layers.insert(layer_idx, MoeLayer::from_params(params, &gate_config, prefix, layer_idx)?);
        }
        log::info!("Collected {} MoE layers ({}..{})", layers.len(), config.first_k_dense_replace, config.num_hidden_layers);
        Ok(MoeModel { config: config.clone(), prefix: prefix.to_string(), layers })
    }

    pub fn layer(&self, layer_idx: usize) -> Option<&MoeLayer> {
        self.layers.get(&layer_idx)
    }

    /// Live parameters of every MoE layer.
    pub fn state_dict(&self) -> Result<ParamDict> {
        let mut params = ParamDict::new();
        for layer in self.layers.values() {
            params.extend(layer.state_dict(&self.prefix)?);
        }
        Ok(params)
    }

    pub fn storage_bytes(&self) -> usize {
        self.layers.values().map(MoeLayer::storage_bytes).sum()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::weights::quant::QuantBits;

    pub(crate) fn tiny_config(hidden: usize, inter: usize, experts: usize, layers: usize) -> ModelConfig {
        ModelConfig {
            hidden_size: hidden,
            moe_intermediate_size: inter,
            n_routed_experts: experts,
            num_experts_per_tok: 2,
            num_hidden_layers: layers,
            first_k_dense_replace: 1,
            scoring_func: "softmax".into(),
            aux_loss_alpha: 0.001,
            seq_aux: true,
            norm_topk_prob: true,
            hidden_act: "silu".into(),
        }
    }

    fn fill(rows: usize, cols: usize, seed: usize) -> Vec<f32> {
        (0..rows * cols)
            .map(|i| (((i + seed * 131) * 37 + 11) % 101) as f32 / 101.0 - 0.5)
            .collect()
    }

    /// Synthetic checkpoint: dense layer 0 plus MoE layers with distinct expert weights.
    pub(crate) fn tiny_params(config: &ModelConfig) -> ParamDict {
        let (h, i, n) = (config.hidden_size, config.moe_intermediate_size, config.n_routed_experts);
        let mut params = ParamDict::new();
        params.insert("model.embed_tokens.weight", Tensor::from_f32(&fill(10, h, 0), &[10, h], DType::BF16).unwrap());
        params.insert(
            "model.layers.0.mlp.up_proj.weight",
            Tensor::from_f32(&fill(i, h, 1), &[i, h], DType::BF16).unwrap(),
        );
        for layer in config.first_k_dense_replace..config.num_hidden_layers {
            params.insert(gate_key("model", layer), Tensor::from_f32(&fill(n, h, layer), &[n, h], DType::BF16).unwrap());
            for e in 0..n {
                let seed = layer * 100 + e;
                let [g, u, d] = expert_keys("model", layer, e);
                params.insert(g, Tensor::from_f32(&fill(i, h, seed), &[i, h], DType::BF16).unwrap());
                params.insert(u, Tensor::from_f32(&fill(i, h, seed + 7), &[i, h], DType::BF16).unwrap());
                params.insert(d, Tensor::from_f32(&fill(h, i, seed + 13), &[h, i], DType::BF16).unwrap());
            }
        }
        params.insert("model.norm.weight", Tensor::from_f32(&vec![1.0; h], &[h], DType::BF16).unwrap());
        params
    }

    #[test]
    fn test_device_parse() {
        assert_eq!("cpu".parse::<Device>().unwrap(), Device::Cpu);
        assert_eq!("cuda".parse::<Device>().unwrap(), Device::Cuda(0));
        assert_eq!("cuda:3".parse::<Device>().unwrap(), Device::Cuda(3));
        assert!("tpu".parse::<Device>().is_err());
        assert_eq!(Device::Cuda(1).to_string(), "cuda:1");
    }

    #[test]
    fn test_model_from_params_and_state_dict_roundtrip() {
        let config = tiny_config(16, 8, 4, 3);
        let params = tiny_params(&config);
        let model = MoeModel::from_params(&config, &params, "model").unwrap();
        assert_eq!(model.layers.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(model.layer(1).unwrap().num_slots(), 4);

        let state = model.state_dict().unwrap();
        for (name, tensor) in state.iter() {
            assert_eq!(params.get(name), Some(tensor), "{name}");
        }
        // gate + 4 experts × 3 projections, per layer
        assert_eq!(state.len(), 2 * (1 + 12));
    }

    #[test]
    fn test_dense_expert_rejects_inconsistent_shapes() {
        let t = |r: usize, c: usize| Tensor::from_f32(&vec![0.0; r * c], &[r, c], DType::BF16).unwrap();
        assert!(DenseExpert::new(t(8, 16), t(8, 16), t(16, 8)).is_ok());
        assert!(matches!(
            DenseExpert::new(t(8, 16), t(8, 12), t(16, 8)),
            Err(SurgeonError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_kaiming_expert_shapes_and_bounds() {
        use rand::rngs::StdRng;
        use rand::SeedableRng;

        let mut rng = StdRng::seed_from_u64(11);
        let e = DenseExpert::kaiming(16, 4, DType::BF16, &mut rng).unwrap();
        assert_eq!(e.gate_proj.shape(), &[4, 16]);
        assert_eq!(e.down_proj.shape(), &[16, 4]);
        assert_eq!(e.dtype(), DType::BF16);
        // bf16 rounding may nudge a value just past the bound
        assert!(e.gate_proj.to_f32_vec().unwrap().iter().all(|w| w.abs() <= 0.25 * 1.01));
        assert!(e.down_proj.to_f32_vec().unwrap().iter().all(|w| w.abs() <= 0.5 * 1.01));
        assert_ne!(e.gate_proj, e.up_proj);

        let again = DenseExpert::kaiming(16, 4, DType::BF16, &mut StdRng::seed_from_u64(11)).unwrap();
        assert_eq!(again, e);
    }

    #[test]
    fn test_quantized_load_state_dimension_mismatch() {
        let config = tiny_config(16, 8, 2, 2);
        let params = tiny_params(&config);
        let dense = DenseExpert::from_params(&params, "model", 1, 0).unwrap();

        let mut wrong = QuantizedExpert::with_dims(16, 12, QuantSpec::default());
        let err = wrong.load_state(&dense).unwrap_err();
        assert!(matches!(err, SurgeonError::DimensionMismatch { .. }), "{err}");

        let mut right = QuantizedExpert::with_dims(16, 8, QuantSpec { bits: QuantBits::Int4, group_size: 8 });
        right.load_state(&dense).unwrap();
        assert!(right.storage_bytes() < Expert::Standard(dense).storage_bytes());
    }

    #[test]
    fn test_quantized_expert_tracks_dense_output() {
        let config = tiny_config(32, 16, 2, 2);
        let params = tiny_params(&config);
        let dense = DenseExpert::from_params(&params, "model", 1, 1).unwrap();
        let mut quant = QuantizedExpert::with_dims(32, 16, QuantSpec { bits: QuantBits::Int8, group_size: 16 });
        quant.load_state(&dense).unwrap();

        let x: Vec<f32> = (0..32).map(|i| ((i * 3 + 1) as f32 / 32.0 - 0.5) * 0.2).collect();
        let mut scratch = ExpertScratch::new(32, 16);
        expert_forward(&Expert::Standard(dense), &x, Activation::Silu, &mut scratch, false).unwrap();
        let reference = scratch.expert_out.clone();
        expert_forward(&Expert::Quantized(quant), &x, Activation::Silu, &mut scratch, true).unwrap();

        let max_diff = reference
            .iter()
            .zip(&scratch.expert_out)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f32, f32::max);
        let rms = (reference.iter().map(|v| v * v).sum::<f32>() / 32.0).sqrt();
        assert!(rms > 1e-5);
        assert!(max_diff < rms * 0.1 + 1e-4, "max_diff {max_diff} rms {rms}");
    }

    #[test]
    fn test_forward_token_combines_top_k() {
        let config = tiny_config(16, 8, 4, 2);
        let params = tiny_params(&config);
        let model = MoeModel::from_params(&config, &params, "model").unwrap();
        let layer = model.layer(1).unwrap();

        let x: Vec<f32> = (0..16).map(|i| (i as f32 / 16.0) - 0.4).collect();
        let mut scratch = ExpertScratch::new(16, 8);
        let (routing, out) = layer.forward_token(&x, Activation::Silu, &mut scratch, false).unwrap();
        assert_eq!(routing.topk_idx.len(), 2);

        // Same result by hand
        let mut expected = vec![0.0f32; 16];
        for (&e, &w) in routing.topk_idx.iter().zip(&routing.topk_weight) {
            expert_forward(&layer.experts[e], &x, Activation::Silu, &mut scratch, false).unwrap();
            expected.iter_mut().zip(&scratch.expert_out).for_each(|(o, v)| *o += w * v);
        }
        assert_eq!(out, expected);
    }

    #[test]
    fn test_activation_parse() {
        assert_eq!(Activation::parse("silu").unwrap(), Activation::Silu);
        assert!(matches!(Activation::parse("relu2"), Err(SurgeonError::NotImplemented(_))));
        assert!((Activation::Silu.apply(0.0)).abs() < 1e-7);
    }
}
