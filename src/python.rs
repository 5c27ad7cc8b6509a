//! Python bindings.
//!
//! ```python
//! import expert_surgeon as es
//! hot, ratios = es.aggregate_routing("routing/wnli.json", 64, 27)
//! s = es.ExpertSurgeon(device="cuda:0", bits=4)
//! s.load("/models/deepseek-moe-16b-base")
//! s.apply(hot)
//! s.save("/tmp/merged.safetensors")
//! ```

use crate::error::SurgeonError;
use crate::moe::{Device, MoeModel};
use crate::routing::{aggregate, RoutingRecord};
use crate::surgery::{apply_plan, merge_state_dicts, mutated_keys, probe, quant_plan, SurgeryContext, SurgeryPlan};
use crate::weights::quant::{QuantBits, QuantSpec};
use crate::weights::safetensors_io::write_safetensors;
use crate::weights::{detect_layers_prefix, load_model_dir, ParamDict};
use pyo3::exceptions::PyRuntimeError;
use pyo3::prelude::*;
use std::collections::BTreeMap;
use std::path::Path;

impl From<SurgeonError> for PyErr {
    fn from(e: SurgeonError) -> Self {
        PyRuntimeError::new_err(e.to_string())
    }
}

/// Hot expert per layer and the per-layer imbalance ratios of a routing record.
#[pyfunction]
fn aggregate_routing(path: &str, expert_count: usize, layer_count: usize) -> PyResult<(Vec<usize>, BTreeMap<usize, f64>)> {
    let record = RoutingRecord::load(Path::new(path))?;
    let report = aggregate(&record, expert_count, layer_count)?;
    Ok((report.hot_experts, report.imbalance))
}

struct Loaded {
    raw: ParamDict,
    model: MoeModel,
    operated: Option<(MoeModel, SurgeryPlan)>,
}

#[pyclass]
pub struct ExpertSurgeon {
    ctx: SurgeryContext,
    loaded: Option<Loaded>,
}

impl ExpertSurgeon {
    fn loaded(&self) -> PyResult<&Loaded> {
        self.loaded
            .as_ref()
            .ok_or_else(|| PyRuntimeError::new_err("Model not loaded; call load() first"))
    }
}

#[pymethods]
impl ExpertSurgeon {
    #[new]
    #[pyo3(signature = (device="cpu", bits=4, group_size=None, gate_init="fresh", expert_init="fresh", seed=0))]
    pub fn new(
        device: &str,
        bits: u8,
        group_size: Option<usize>,
        gate_init: &str,
        expert_init: &str,
        seed: u64,
    ) -> PyResult<Self> {
        let quant = QuantSpec {
            bits: QuantBits::from_bits(bits)?,
            group_size: group_size.unwrap_or(QuantSpec::default().group_size),
        };
        let ctx = SurgeryContext {
            device: device.parse::<Device>()?,
            quant,
            gate_init: gate_init.parse()?,
            expert_init: expert_init.parse()?,
            seed,
        };
        Ok(ExpertSurgeon { ctx, loaded: None })
    }

    /// Load config.json and safetensors weights from a model directory.
    pub fn load(&mut self, model_dir: &str) -> PyResult<()> {
        let (config, raw) = load_model_dir(Path::new(model_dir))?;
        let prefix = detect_layers_prefix(&raw)?;
        let model = MoeModel::from_params(&config, &raw, &prefix)?;
        self.loaded = Some(Loaded { raw, model, operated: None });
        Ok(())
    }

    /// Operate on layers `first_layer..`; `quant_experts` defaults to plan 0.
    ///
    /// Returns `(layer, quantized expert, duplicate slot)` per layer.
    #[pyo3(signature = (hot_experts, quant_experts=None, first_layer=1))]
    pub fn apply(
        &mut self,
        hot_experts: Vec<usize>,
        quant_experts: Option<Vec<usize>>,
        first_layer: usize,
    ) -> PyResult<Vec<(usize, usize, usize)>> {
        let ctx = self.ctx;
        let loaded = self
            .loaded
            .as_mut()
            .ok_or_else(|| PyRuntimeError::new_err("Model not loaded; call load() first"))?;
        let quant = match quant_experts {
            Some(q) => q,
            None => quant_plan(0)?,
        };
        let plan = SurgeryPlan::new(first_layer, &hot_experts, &quant)?;
        let (new_model, report) = apply_plan(&loaded.model, &plan, &ctx)?;
        loaded.operated = Some((new_model, plan));
        Ok(report
            .layers
            .iter()
            .map(|l| (l.layer_idx, l.quant_expert, l.duplicate_slot))
            .collect())
    }

    /// Output RMS of each operated layer on the probe activation.
    pub fn probe(&self) -> PyResult<Vec<f32>> {
        let loaded = self.loaded()?;
        let (model, plan) = loaded
            .operated
            .as_ref()
            .ok_or_else(|| PyRuntimeError::new_err("No surgery applied; call apply() first"))?;
        let layers: Vec<usize> = plan.target_layers().collect();
        Ok(probe(model, &layers, None)?.into_iter().map(|r| r.rms).collect())
    }

    /// Write the merged parameter dictionary as safetensors.
    pub fn save(&self, path: &str) -> PyResult<()> {
        let loaded = self.loaded()?;
        let (model, plan) = loaded
            .operated
            .as_ref()
            .ok_or_else(|| PyRuntimeError::new_err("No surgery applied; call apply() first"))?;
        let merged = merge_state_dicts(&loaded.raw, &model.state_dict()?, &mutated_keys(&model.prefix, plan))?;
        write_safetensors(Path::new(path), &merged)?;
        Ok(())
    }

    /// Number of MoE layers loaded.
    pub fn num_moe_layers(&self) -> PyResult<usize> {
        Ok(self.loaded()?.model.layers.len())
    }

    /// Routed experts per layer before surgery.
    pub fn num_experts(&self) -> PyResult<usize> {
        Ok(self.loaded()?.model.config.n_routed_experts)
    }
}

#[pymodule]
fn expert_surgeon(m: &Bound<'_, PyModule>) -> PyResult<()> {
    env_logger::init();
    m.add_function(wrap_pyfunction!(aggregate_routing, m)?)?;
    m.add_class::<ExpertSurgeon>()?;
    Ok(())
}
