//! End-to-end runs over a model directory: load, operate, merge, write.
//!
//! The CLI builds a job from its arguments and hands it here, so a whole run
//! can be driven (and tested) without going through argument parsing.

use crate::error::Result;
use crate::moe::MoeModel;
use crate::routing::{aggregate, RoutingRecord, RoutingRecorder, UsageReport};
use crate::surgery::{
    apply_plan, merge_state_dicts, mutated_keys, probe, quantize_model, quantized_keys, ProbeResult, SurgeryContext,
    SurgeryPlan, SurgeryReport,
};
use crate::weights::safetensors_io::write_safetensors;
use crate::weights::{detect_layers_prefix, expert_keys, load_model_dir, ParamDict};
use std::path::PathBuf;

fn mb(bytes: usize) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

/// One duplicate-and-quantize run.
#[derive(Debug, Clone)]
pub struct SurgeryJob {
    /// HF model directory (config.json + safetensors).
    pub model_dir: PathBuf,
    pub routing_path: PathBuf,
    pub expert_count: usize,
    pub layer_count: usize,
    pub first_layer: usize,
    /// Expert to quantize per target layer.
    pub quant_experts: Vec<usize>,
    pub ctx: SurgeryContext,
    pub output: Option<PathBuf>,
    /// Where to save the routing of the post-surgery pass.
    pub record_routing: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct SurgeryOutcome {
    pub usage: UsageReport,
    pub report: SurgeryReport,
    pub merged: ParamDict,
    pub post_surgery: Vec<ProbeResult>,
}

pub fn run_surgery(job: &SurgeryJob) -> Result<SurgeryOutcome> {
    let (config, raw) = load_model_dir(&job.model_dir)?;
    let raw_bytes = raw.size_bytes();
    log::info!("Memory occupied by parameters: {:.1} MB", mb(raw_bytes));

    let record = RoutingRecord::load(&job.routing_path)?;
    let usage = aggregate(&record, job.expert_count, job.layer_count)?;
    let plan = SurgeryPlan::new(job.first_layer, &usage.hot_experts, &job.quant_experts)?;

    let prefix = detect_layers_prefix(&raw)?;
    let model = MoeModel::from_params(&config, &raw, &prefix)?;
    let ctx = &job.ctx;
    log::info!(
        "Surgery: {} layers from {}, {} group {}, gate {:?}, experts {:?}, device {}",
        plan.directives.len(),
        job.first_layer,
        ctx.quant.bits.name(),
        ctx.quant.group_size,
        ctx.gate_init,
        ctx.expert_init,
        ctx.device,
    );

    let (operated, report) = apply_plan(&model, &plan, ctx)?;
    for layer_idx in plan.target_layers() {
        if let Some(layer) = operated.layer(layer_idx) {
            for (idx, expert) in layer.experts.iter().enumerate() {
                for key in expert_keys(&prefix, layer_idx, idx) {
                    log::debug!("{key}: {}", expert.kind());
                }
            }
        }
    }
    log::info!(
        "Memory occupied by parameters after surgery: {:.1} MB",
        mb(raw_bytes - model.storage_bytes() + operated.storage_bytes())
    );

    let merged = merge_state_dicts(&raw, &operated.state_dict()?, &mutated_keys(&prefix, &plan))?;
    log::info!("Merged state: {} tensors", merged.len());

    let layers: Vec<usize> = plan.target_layers().collect();
    let post_surgery = match &job.record_routing {
        Some(path) => {
            let mut recorder = RoutingRecorder::new();
            let results = probe(&operated, &layers, Some(&mut recorder))?;
            recorder.into_record().save(path)?;
            log::info!("Post-surgery routing written to {}", path.display());
            results
        }
        None => probe(&operated, &layers, None)?,
    };

    if let Some(path) = &job.output {
        write_safetensors(path, &merged)?;
        log::info!("Merged weights written to {}", path.display());
    }
    Ok(SurgeryOutcome { usage, report, merged, post_surgery })
}

/// Quantize one expert in a range of layers, gate width unchanged.
#[derive(Debug, Clone)]
pub struct QuantizeJob {
    pub model_dir: PathBuf,
    pub expert: usize,
    /// Decoder layers `first_layer..last_layer`.
    pub first_layer: usize,
    pub last_layer: usize,
    pub ctx: SurgeryContext,
    pub output: Option<PathBuf>,
}

pub fn run_quantize(job: &QuantizeJob) -> Result<ParamDict> {
    let (config, raw) = load_model_dir(&job.model_dir)?;
    log::info!("Memory occupied by parameters: {:.1} MB", mb(raw.size_bytes()));

    let prefix = detect_layers_prefix(&raw)?;
    let model = MoeModel::from_params(&config, &raw, &prefix)?;
    // Clamp to the layers that exist; the default range is sized for the full model
    let last_layer = job.last_layer.min(config.num_hidden_layers);
    let layers: Vec<usize> = (job.first_layer..last_layer).collect();

    let quantized = quantize_model(&model, &layers, job.expert, &job.ctx)?;
    log::info!("Memory occupied by parameters after quantization: {:.1} MB", mb(quantized.storage_bytes()));

    let merged = merge_state_dicts(&raw, &quantized.state_dict()?, &quantized_keys(&prefix, &layers, job.expert))?;
    if let Some(path) = &job.output {
        write_safetensors(path, &merged)?;
        log::info!("Quantized weights written to {}", path.display());
    }
    Ok(merged)
}
