//! Prompt construction from dataset records, and run naming.

use crate::error::{Result, SurgeonError};
use serde_json::{Map, Value};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// How many dataset fields are joined into one prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptType {
    One,
    Two,
    Three,
}

impl PromptType {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "1" => Ok(PromptType::One),
            "2" => Ok(PromptType::Two),
            "3" => Ok(PromptType::Three),
            other => Err(SurgeonError::InvalidPlan(format!("prompt type must be 1, 2 or 3, got {other:?}"))),
        }
    }

    pub fn field_count(self) -> usize {
        match self {
            PromptType::One => 1,
            PromptType::Two => 2,
            PromptType::Three => 3,
        }
    }
}

impl FromStr for PromptType {
    type Err = SurgeonError;

    fn from_str(s: &str) -> Result<Self> {
        PromptType::parse(s)
    }
}

/// Dataset field names supplying the prompt pieces, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptFields {
    pub sub_one: String,
    pub sub_two: String,
    pub sub_three: String,
}

impl Default for PromptFields {
    fn default() -> Self {
        PromptFields {
            sub_one: "question".to_string(),
            sub_two: "sentence".to_string(),
            sub_three: "sentence".to_string(),
        }
    }
}

/// One dataset record: a JSON object keyed by field name.
pub type Record = Map<String, Value>;

/// Read a JSONL export of a dataset split. Blank lines are skipped.
pub fn load_jsonl(path: &Path) -> Result<Vec<Record>> {
    let file = std::fs::File::open(path).map_err(|e| SurgeonError::io(path, e))?;
    let mut records = Vec::new();
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| SurgeonError::io(path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(&line)
            .map_err(|e| SurgeonError::json(format!("{}:{}", path.display(), lineno + 1), e))?;
        match value {
            Value::Object(map) => records.push(map),
            _ => {
                return Err(SurgeonError::MalformedRecord(format!(
                    "{}:{}: expected a JSON object per line",
                    path.display(),
                    lineno + 1
                )));
            }
        }
    }
    log::info!("Loaded {} records from {}", records.len(), path.display());
    Ok(records)
}

/// Concatenate the selected fields of every record, with no separator.
pub fn build_prompts(records: &[Record], prompt_type: PromptType, fields: &PromptFields) -> Result<Vec<String>> {
    let names = [fields.sub_one.as_str(), fields.sub_two.as_str(), fields.sub_three.as_str()];
    let names = &names[..prompt_type.field_count()];

    records
        .iter()
        .enumerate()
        .map(|(i, record)| {
            let mut prompt = String::new();
            for &name in names {
                match record.get(name) {
                    Some(Value::String(text)) => prompt.push_str(text),
                    Some(other) => {
                        return Err(SurgeonError::MalformedRecord(format!(
                            "record {i}: field {name:?} is not a string ({other})"
                        )));
                    }
                    None => {
                        return Err(SurgeonError::MalformedRecord(format!("record {i}: missing field {name:?}")));
                    }
                }
            }
            Ok(prompt)
        })
        .collect()
}

/// Names derived from the dataset identifier and sub-dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunNames {
    /// Stem of the routing record and result files.
    pub output_name: String,
    /// `glue`, `mmlu` or `other`.
    pub folder_name: String,
}

fn last_component(s: &str) -> &str {
    s.rsplit('/').next().unwrap_or(s)
}

impl RunNames {
    /// `subset == "none"` means the dataset has no sub-dataset.
    pub fn new(data: &str, subset: &str) -> Self {
        let folder = last_component(data);
        let folder_name = if matches!(folder, "glue" | "mmlu") { folder } else { "other" };
        let output_name = last_component(if subset == "none" { data } else { subset });
        RunNames { output_name: output_name.to_string(), folder_name: folder_name.to_string() }
    }

    /// `<routing_dir>/<output_name>.json`
    pub fn routing_path(&self, routing_dir: &Path) -> PathBuf {
        routing_dir.join(format!("{}.json", self.output_name))
    }
}
