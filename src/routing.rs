//! Expert-usage aggregation over recorded routing decisions.
//!
//! A routing record maps each evaluation example to its per-layer,
//! per-token expert selections:
//!
//! ```text
//! { "<example id>": [ [ [e, e, ...], ... ],   // layer 0: one list per token
//!                     [ [e, e, ...], ... ],   // layer 1
//!                     ... ], ... }
//! ```
//!
//! Aggregation flattens every token of every example per layer, tallies
//! expert ids, and reports the hottest expert and the load-imbalance ratio
//! `max_count / (token_slots / expert_count)`.

use crate::error::{Result, SurgeonError};
use crate::gate::GateOutput;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::BufWriter;
use std::path::Path;

/// Experts per token, per layer.
pub type ExampleRouting = Vec<Vec<Vec<usize>>>;

/// Recorded routing of an evaluation pass, keyed by example id.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct RoutingRecord {
    pub examples: BTreeMap<String, ExampleRouting>,
}

impl RoutingRecord {
    /// Read and validate a routing-record JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| SurgeonError::io(path, e))?;
        let record = Self::from_json_str(&text)
            .map_err(|e| match e {
                SurgeonError::Json { source, .. } => SurgeonError::json(path.display().to_string(), source),
                other => other,
            })?;
        log::info!("Loaded routing record {}: {} examples", path.display(), record.examples.len());
        Ok(record)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text).map_err(|e| SurgeonError::json("routing record", e))?;
        Self::from_value(&value)
    }

    /// Walk the JSON tree, rejecting anything but `object → layers → tokens → ids`.
    pub fn from_value(value: &Value) -> Result<Self> {
        let root = value
            .as_object()
            .ok_or_else(|| SurgeonError::MalformedRecord("top level is not an object".into()))?;

        let mut examples = BTreeMap::new();
        for (id, layers) in root {
            let layers = layers
                .as_array()
                .ok_or_else(|| SurgeonError::MalformedRecord(format!("example {id}: not a list of layers")))?;
            let mut parsed_layers = Vec::with_capacity(layers.len());
            for (layer_idx, tokens) in layers.iter().enumerate() {
                let tokens = tokens.as_array().ok_or_else(|| {
                    SurgeonError::MalformedRecord(format!("example {id}, layer {layer_idx}: not a list of tokens"))
                })?;
                let mut parsed_tokens = Vec::with_capacity(tokens.len());
                for (tok_idx, experts) in tokens.iter().enumerate() {
                    let experts = experts.as_array().ok_or_else(|| {
                        SurgeonError::MalformedRecord(format!(
                            "example {id}, layer {layer_idx}, token {tok_idx}: not a list of experts"
                        ))
                    })?;
                    let ids = experts
                        .iter()
                        .map(|e| expert_id(e, id, layer_idx, tok_idx))
                        .collect::<Result<Vec<usize>>>()?;
                    parsed_tokens.push(ids);
                }
                parsed_layers.push(parsed_tokens);
            }
            examples.insert(id.clone(), parsed_layers);
        }
        Ok(RoutingRecord { examples })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path).map_err(|e| SurgeonError::io(path, e))?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)
            .map_err(|e| SurgeonError::json(path.display().to_string(), e))?;
        log::info!("Wrote routing record for {} examples to {}", self.examples.len(), path.display());
        Ok(())
    }
}

fn expert_id(value: &Value, id: &str, layer_idx: usize, tok_idx: usize) -> Result<usize> {
    let at = || format!("example {id}, layer {layer_idx}, token {tok_idx}");
    match value {
        Value::Array(_) => Err(SurgeonError::MalformedRecord(format!("{}: nested structure in expert list", at()))),
        Value::Number(n) => n
            .as_u64()
            .map(|v| v as usize)
            .ok_or_else(|| SurgeonError::MalformedRecord(format!("{}: expert id {n} is not a non-negative integer", at()))),
        other => Err(SurgeonError::MalformedRecord(format!("{}: expert id {other} is not a number", at()))),
    }
}

/// Per-layer usage statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageReport {
    /// Most-selected expert per layer (lowest index on ties).
    pub hot_experts: Vec<usize>,
    /// Layer index → max count / uniform share.
    pub imbalance: BTreeMap<usize, f64>,
    /// Layer → count per expert id `0..expert_count`.
    pub tallies: Vec<Vec<u64>>,
    /// Layer → total token slots, including ids outside the tallied range.
    pub token_slots: Vec<u64>,
}

/// Tally expert usage per layer across all examples.
pub fn aggregate(record: &RoutingRecord, expert_count: usize, layer_count: usize) -> Result<UsageReport> {
    if expert_count == 0 {
        return Err(SurgeonError::InvalidPlan("expert count must be > 0".into()));
    }

    let mut tallies = vec![vec![0u64; expert_count]; layer_count];
    let mut token_slots = vec![0u64; layer_count];
    let mut out_of_range = vec![0u64; layer_count];

    for (id, layers) in &record.examples {
        if layers.len() > layer_count {
            return Err(SurgeonError::MalformedRecord(format!(
                "example {id} has {} layers, expected at most {layer_count}",
                layers.len()
            )));
        }
        for (layer_idx, tokens) in layers.iter().enumerate() {
            for &expert in tokens.iter().flatten() {
                token_slots[layer_idx] += 1;
                match tallies[layer_idx].get_mut(expert) {
                    Some(count) => *count += 1,
                    None => out_of_range[layer_idx] += 1,
                }
            }
        }
    }

    let mut hot_experts = Vec::with_capacity(layer_count);
    let mut imbalance = BTreeMap::new();
    for layer_idx in 0..layer_count {
        let counts = &tallies[layer_idx];
        let total = token_slots[layer_idx];
        if total == 0 {
            return Err(SurgeonError::MalformedRecord(format!("layer {layer_idx} has no routed tokens")));
        }
        if out_of_range[layer_idx] > 0 {
            log::warn!(
                "Layer {layer_idx}: {} of {total} selections name experts >= {expert_count}; \
                 counted in the total but not tallied",
                out_of_range[layer_idx],
            );
        }

        let (hot, max_count) = first_max(counts);
        let ratio = max_count as f64 / (total as f64 / expert_count as f64);
        log::info!("Layer {layer_idx}: hot expert {hot} ({max_count}/{total} slots), imbalance {ratio:.3}");

        hot_experts.push(hot);
        imbalance.insert(layer_idx, ratio);
    }

    Ok(UsageReport { hot_experts, imbalance, tallies, token_slots })
}

/// Index and value of the first maximum.
fn first_max(counts: &[u64]) -> (usize, u64) {
    let mut best = (0, counts[0]);
    for (i, &c) in counts.iter().enumerate().skip(1) {
        if c > best.1 {
            best = (i, c);
        }
    }
    best
}

/// Builds a routing record from gate outputs, one example at a time.
#[derive(Debug, Default)]
pub struct RoutingRecorder {
    record: RoutingRecord,
    current: Option<(String, ExampleRouting)>,
}

impl RoutingRecorder {
    pub fn new() -> Self {
        RoutingRecorder::default()
    }

    /// Start a new example, closing any open one.
    pub fn begin_example(&mut self, id: impl Into<String>) {
        self.finish_example();
        self.current = Some((id.into(), Vec::new()));
    }

    /// Append the next layer's selections to the open example.
    pub fn record_layer(&mut self, output: &GateOutput) -> Result<()> {
        let (id, layers) = self
            .current
            .as_mut()
            .ok_or_else(|| SurgeonError::MalformedRecord("gate output recorded outside an example".into()))?;
        log::debug!("Recording layer {} of example {id}: {} tokens", layers.len(), output.num_tokens());
        layers.push(output.experts_per_token().map(<[usize]>::to_vec).collect());
        Ok(())
    }

    pub fn finish_example(&mut self) {
        if let Some((id, layers)) = self.current.take() {
            self.record.examples.insert(id, layers);
        }
    }

    pub fn into_record(mut self) -> RoutingRecord {
        self.finish_example();
        self.record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hot_expert_and_ratio_example() {
        let _ = env_logger::try_init();
        // 2 examples, 1 layer, 4 experts; expert 2 takes 9 of 12 slots.
        let json = r#"{
            "0": [[[2, 2], [2, 0], [2, 1]]],
            "1": [[[2, 2], [2, 3], [2, 2]]]
        }"#;
        let record = RoutingRecord::from_json_str(json).unwrap();
        let report = aggregate(&record, 4, 1).unwrap();
        assert_eq!(report.hot_experts, vec![2]);
        assert_eq!(report.token_slots, vec![12]);
        assert_eq!(report.tallies[0], vec![1, 1, 9, 1]);
        assert!((report.imbalance[&0] - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_uniform_usage_ratio_is_one() {
        let json = r#"{
            "a": [[[0, 1], [2, 3]], [[3, 2], [1, 0]]],
            "b": [[[1, 0], [3, 2]], [[0, 3], [2, 1]]]
        }"#;
        let report = aggregate(&RoutingRecord::from_json_str(json).unwrap(), 4, 2).unwrap();
        for layer in 0..2 {
            assert!((report.imbalance[&layer] - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_hot_expert_is_argmax_with_lowest_tie() {
        let json = r#"{"x": [[[3, 1], [1, 3]], [[0, 2], [2, 0]], [[5, 5], [4, 5]]]}"#;
        let report = aggregate(&RoutingRecord::from_json_str(json).unwrap(), 8, 3).unwrap();
        assert_eq!(report.hot_experts, vec![1, 0, 5]);
        for (layer, counts) in report.tallies.iter().enumerate() {
            let max = *counts.iter().max().unwrap();
            assert_eq!(counts[report.hot_experts[layer]], max);
            assert_eq!(counts.iter().position(|&c| c == max).unwrap(), report.hot_experts[layer]);
        }
    }

    #[test]
    fn test_nested_structure_fails_loudly() {
        let json = r#"{"0": [[[1, [2, 3]]]]}"#;
        let err = RoutingRecord::from_json_str(json).unwrap_err();
        assert!(matches!(err, SurgeonError::MalformedRecord(ref m) if m.contains("nested")), "{err}");
    }

    #[test]
    fn test_flat_layer_rejected() {
        // Token entry is a bare id instead of a list
        let err = RoutingRecord::from_json_str(r#"{"0": [[1, 2]]}"#).unwrap_err();
        assert!(matches!(err, SurgeonError::MalformedRecord(_)));
    }

    #[test]
    fn test_negative_id_rejected() {
        assert!(RoutingRecord::from_json_str(r#"{"0": [[[-1]]]}"#).is_err());
    }

    #[test]
    fn test_bad_json_and_missing_file() {
        assert!(matches!(RoutingRecord::from_json_str("{not json"), Err(SurgeonError::Json { .. })));
        assert!(matches!(
            RoutingRecord::load(Path::new("/nonexistent/routing.json")),
            Err(SurgeonError::Io { .. })
        ));
    }

    #[test]
    fn test_too_many_layers() {
        let record = RoutingRecord::from_json_str(r#"{"0": [[[0]], [[1]]]}"#).unwrap();
        assert!(matches!(aggregate(&record, 2, 1), Err(SurgeonError::MalformedRecord(_))));
    }

    #[test]
    fn test_empty_layer_fails() {
        let record = RoutingRecord::from_json_str(r#"{"0": [[[0]]]}"#).unwrap();
        assert!(matches!(aggregate(&record, 2, 2), Err(SurgeonError::MalformedRecord(_))));
    }

    #[test]
    fn test_out_of_range_ids_count_toward_total() {
        let _ = env_logger::try_init();
        let record = RoutingRecord::from_json_str(r#"{"0": [[[0, 9], [0, 1]]]}"#).unwrap();
        let report = aggregate(&record, 2, 1).unwrap();
        assert_eq!(report.hot_experts, vec![0]);
        assert_eq!(report.token_slots, vec![4]);
        // 2 / (4 / 2)
        assert!((report.imbalance[&0] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_recorder_output_feeds_aggregate() {
        let _ = env_logger::try_init();
        let mut recorder = RoutingRecorder::new();
        assert!(recorder
            .record_layer(&GateOutput { top_k: 1, topk_idx: vec![0], topk_weight: vec![1.0], aux_loss: None })
            .is_err());

        for (id, first) in [("0", 1usize), ("1", 1)] {
            recorder.begin_example(id);
            recorder
                .record_layer(&GateOutput {
                    top_k: 2,
                    topk_idx: vec![first, 0, first, 2],
                    topk_weight: vec![0.5; 4],
                    aux_loss: None,
                })
                .unwrap();
        }
        let record = recorder.into_record();
        assert_eq!(record.examples["0"], vec![vec![vec![1, 0], vec![1, 2]]]);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routing.json");
        record.save(&path).unwrap();
        let loaded = RoutingRecord::load(&path).unwrap();
        assert_eq!(loaded, record);

        let report = aggregate(&loaded, 3, 1).unwrap();
        assert_eq!(report.hot_experts, vec![1]);
        assert!((report.imbalance[&0] - 4.0 / (8.0 / 3.0)).abs() < 1e-12);
    }
}
