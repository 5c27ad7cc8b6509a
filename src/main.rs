//! expert-surgeon CLI
//!
//! # Commands
//!
//! - `aggregate` - hot expert and imbalance ratio per layer from a routing record
//! - `surgery` - duplicate and quantize experts, merge and optionally save the weights
//! - `quantize` - quantize one expert across a range of layers, no duplication
//! - `prompts` - build prompts from a JSONL dataset split

use clap::{Args, Parser, Subcommand};
use expert_surgeon::moe::Device;
use expert_surgeon::pipeline::{run_quantize, run_surgery, QuantizeJob, SurgeryJob};
use expert_surgeon::prompt::{build_prompts, load_jsonl, PromptFields, PromptType, RunNames};
use expert_surgeon::routing::{aggregate, RoutingRecord, UsageReport};
use expert_surgeon::surgery::{quant_plan, ExpertInit, GateInit, SurgeryContext};
use expert_surgeon::weights::quant::{QuantBits, QuantSpec, DEFAULT_GROUP_SIZE};
use expert_surgeon::{Result, SurgeonError};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

/// Expert duplication and quantization surgery for MoE checkpoints
#[derive(Parser)]
#[command(name = "expert-surgeon")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Summarize a routing record: hot expert and imbalance ratio per layer
    ///
    /// Examples:
    ///   expert-surgeon aggregate glue wnli --routing-dir results/raw/mmlu
    Aggregate {
        #[command(flatten)]
        run: RunArgs,

        #[command(flatten)]
        routing: RoutingArgs,

        /// Write the full usage report as JSON (stdout if omitted)
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Duplicate and quantize one expert per MoE layer
    ///
    /// Examples:
    ///   expert-surgeon surgery glue wnli test 2 --model-dir ./deepseek-moe-16b-base
    ///   expert-surgeon surgery piqa none test 3 --sub-one goal --sub-two sol1 --sub-three sol2
    Surgery(SurgeryArgs),
    /// Quantize one expert in every layer of a range, keeping N slots per layer
    ///
    /// Examples:
    ///   expert-surgeon quantize glue wnli test 2 --model-dir ./deepseek-moe-16b-base --expert 0
    Quantize(QuantizeArgs),
    /// Print the prompts built from a JSONL dataset split, one JSON string per line
    Prompts {
        /// Prompt construction type: 1, 2 or 3 fields
        #[arg(value_name = "TYPE")]
        prompt_type: PromptType,

        /// JSONL export of the dataset split
        #[arg(long)]
        dataset_file: PathBuf,

        #[command(flatten)]
        fields: FieldArgs,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Dataset identifier (e.g. glue, Rowan/hellaswag)
    data: String,

    /// Sub-dataset name, or `none`
    dataset: String,
}

#[derive(Args)]
struct RoutingArgs {
    /// Directory holding `<output_name>.json` routing records
    #[arg(long, default_value = "routing")]
    routing_dir: PathBuf,

    /// Experts per layer tallied from the record
    #[arg(long, default_value = "64")]
    expert_count: usize,

    /// MoE layers per example in the record
    #[arg(long, default_value = "27")]
    layer_count: usize,
}

#[derive(Args)]
struct FieldArgs {
    /// First prompt field
    #[arg(long, default_value = "question")]
    sub_one: String,

    /// Second prompt field
    #[arg(long, default_value = "sentence")]
    sub_two: String,

    /// Third prompt field
    #[arg(long, default_value = "sentence")]
    sub_three: String,
}

impl From<FieldArgs> for PromptFields {
    fn from(f: FieldArgs) -> Self {
        PromptFields { sub_one: f.sub_one, sub_two: f.sub_two, sub_three: f.sub_three }
    }
}

#[derive(Args)]
struct SurgeryArgs {
    #[command(flatten)]
    run: RunArgs,

    /// Dataset split (test, validation, ...)
    subset: String,

    /// Prompt construction type: 1, 2 or 3 fields
    #[arg(value_name = "TYPE")]
    prompt_type: PromptType,

    #[command(flatten)]
    fields: FieldArgs,

    /// JSONL export of the split; prompts are built and counted when given
    #[arg(long)]
    dataset_file: Option<PathBuf>,

    /// Row of the quantization plan table
    #[arg(long, default_value = "0")]
    task_idx: usize,

    /// Explicit expert to quantize per layer, overriding --task-idx
    #[arg(long, value_delimiter = ',')]
    quant_experts: Option<Vec<usize>>,

    /// HF model directory (config.json + safetensors)
    #[arg(long)]
    model_dir: PathBuf,

    #[command(flatten)]
    routing: RoutingArgs,

    /// First decoder layer the plan applies to
    #[arg(long, default_value = "1")]
    first_layer: usize,

    /// Quantization width: 4 or 8
    #[arg(long, default_value = "4")]
    quant_bits: u8,

    /// Values per quantization group
    #[arg(long, default_value_t = DEFAULT_GROUP_SIZE)]
    group_size: usize,

    /// Compute device for quantized experts: cpu, cuda, cuda:N
    #[arg(long, default_value = "cuda:0")]
    device: Device,

    /// Widened gate initialisation: fresh or inherit
    #[arg(long, default_value = "fresh")]
    gate_init: GateInit,

    /// Standard slot initialisation: fresh or inherit
    #[arg(long, default_value = "fresh")]
    expert_init: ExpertInit,

    /// Seed for gate and expert initialisation
    #[arg(long, default_value = "0")]
    seed: u64,

    /// Write the merged weights as safetensors
    #[arg(long)]
    output: Option<PathBuf>,

    /// Write the post-surgery routing as a routing record
    #[arg(long)]
    record_routing: Option<PathBuf>,
}

#[derive(Args)]
struct QuantizeArgs {
    #[command(flatten)]
    run: RunArgs,

    /// Dataset split (test, validation, ...)
    subset: String,

    /// Prompt construction type: 1, 2 or 3 fields
    #[arg(value_name = "TYPE")]
    prompt_type: PromptType,

    #[command(flatten)]
    fields: FieldArgs,

    /// JSONL export of the split; prompts are built and counted when given
    #[arg(long)]
    dataset_file: Option<PathBuf>,

    /// HF model directory (config.json + safetensors)
    #[arg(long)]
    model_dir: PathBuf,

    /// Expert quantized in every layer of the range
    #[arg(long, default_value = "0")]
    expert: usize,

    /// First decoder layer quantized
    #[arg(long, default_value = "1")]
    first_layer: usize,

    /// End of the layer range (exclusive)
    #[arg(long, default_value = "27")]
    last_layer: usize,

    /// Quantization width: 4 or 8
    #[arg(long, default_value = "4")]
    quant_bits: u8,

    /// Values per quantization group
    #[arg(long, default_value_t = DEFAULT_GROUP_SIZE)]
    group_size: usize,

    /// Compute device for quantized experts: cpu, cuda, cuda:N
    #[arg(long, default_value = "cuda:0")]
    device: Device,

    /// Write the merged weights as safetensors
    #[arg(long)]
    output: Option<PathBuf>,
}

fn load_usage(run: &RunArgs, routing: &RoutingArgs) -> Result<UsageReport> {
    let names = RunNames::new(&run.data, &run.dataset);
    let path = names.routing_path(&routing.routing_dir);
    log::info!("Run {} (folder {}), routing record {}", names.output_name, names.folder_name, path.display());

    let record = RoutingRecord::load(&path)?;
    aggregate(&record, routing.expert_count, routing.layer_count)
}

fn run_aggregate(run: RunArgs, routing: RoutingArgs, output: Option<PathBuf>) -> Result<()> {
    let report = load_usage(&run, &routing)?;
    let json = serde_json::to_string_pretty(&report).map_err(|e| SurgeonError::json("usage report", e))?;
    match output {
        Some(path) => std::fs::write(&path, json).map_err(|e| SurgeonError::io(&path, e))?,
        None => println!("{json}"),
    }
    Ok(())
}

fn run_prompts(prompt_type: PromptType, dataset_file: &Path, fields: PromptFields) -> Result<()> {
    let records = load_jsonl(dataset_file)?;
    for prompt in build_prompts(&records, prompt_type, &fields)? {
        let line = serde_json::to_string(&prompt).map_err(|e| SurgeonError::json("prompt", e))?;
        println!("{line}");
    }
    Ok(())
}

fn count_prompts(subset: &str, prompt_type: PromptType, dataset_file: Option<&Path>, fields: FieldArgs) -> Result<()> {
    log::info!("Split {subset}, prompt type {prompt_type:?}");
    if let Some(path) = dataset_file {
        let prompts = build_prompts(&load_jsonl(path)?, prompt_type, &fields.into())?;
        log::info!("Built {} prompts", prompts.len());
    }
    Ok(())
}

fn surgery(args: SurgeryArgs) -> Result<()> {
    count_prompts(&args.subset, args.prompt_type, args.dataset_file.as_deref(), args.fields)?;

    let names = RunNames::new(&args.run.data, &args.run.dataset);
    let routing_path = names.routing_path(&args.routing.routing_dir);
    log::info!("Run {} (folder {}), routing record {}", names.output_name, names.folder_name, routing_path.display());

    let quant_experts = match args.quant_experts {
        Some(list) => list,
        None => quant_plan(args.task_idx)?,
    };
    let job = SurgeryJob {
        model_dir: args.model_dir,
        routing_path,
        expert_count: args.routing.expert_count,
        layer_count: args.routing.layer_count,
        first_layer: args.first_layer,
        quant_experts,
        ctx: SurgeryContext {
            device: args.device,
            quant: QuantSpec { bits: QuantBits::from_bits(args.quant_bits)?, group_size: args.group_size },
            gate_init: args.gate_init,
            expert_init: args.expert_init,
            seed: args.seed,
        },
        output: args.output,
        record_routing: args.record_routing,
    };
    run_surgery(&job)?;
    Ok(())
}

fn quantize(args: QuantizeArgs) -> Result<()> {
    count_prompts(&args.subset, args.prompt_type, args.dataset_file.as_deref(), args.fields)?;
    let names = RunNames::new(&args.run.data, &args.run.dataset);
    log::info!("Run {} (folder {}), expert {}", names.output_name, names.folder_name, args.expert);

    let job = QuantizeJob {
        model_dir: args.model_dir,
        expert: args.expert,
        first_layer: args.first_layer,
        last_layer: args.last_layer,
        ctx: SurgeryContext {
            device: args.device,
            quant: QuantSpec { bits: QuantBits::from_bits(args.quant_bits)?, group_size: args.group_size },
            ..SurgeryContext::default()
        },
        output: args.output,
    };
    run_quantize(&job)?;
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Aggregate { run, routing, output } => run_aggregate(run, routing, output),
        Commands::Surgery(args) => surgery(args),
        Commands::Quantize(args) => quantize(args),
        Commands::Prompts { prompt_type, dataset_file, fields } => run_prompts(prompt_type, &dataset_file, fields.into()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
