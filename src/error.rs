//! Error taxonomy for aggregation and surgery.
//!
//! Every failure aborts the run; nothing here is retried.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SurgeonError {
    /// File missing or unreadable.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON that does not parse or does not have the expected shape.
    #[error("failed to parse {what}: {source}")]
    Json {
        what: String,
        #[source]
        source: serde_json::Error,
    },

    /// Routing record violates its representation (upstream recording bug).
    #[error("malformed routing record: {0}")]
    MalformedRecord(String),

    /// Configuration the gate or experts cannot honour.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("dimension mismatch for {name}: expected {expected:?}, got {actual:?}")]
    DimensionMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("tensor not found: {0}")]
    MissingTensor(String),

    #[error("invalid safetensors file {}: {reason}", path.display())]
    Safetensors { path: PathBuf, reason: String },

    #[error("unsupported dtype: {0}")]
    UnsupportedDtype(String),

    #[error("invalid surgery plan: {0}")]
    InvalidPlan(String),
}

pub type Result<T> = std::result::Result<T, SurgeonError>;

impl SurgeonError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SurgeonError::Io { path: path.into(), source }
    }

    pub fn json(what: impl Into<String>, source: serde_json::Error) -> Self {
        SurgeonError::Json { what: what.into(), source }
    }

    pub(crate) fn dims(name: impl Into<String>, expected: &[usize], actual: &[usize]) -> Self {
        SurgeonError::DimensionMismatch {
            name: name.into(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dimension_mismatch_message() {
        let err = SurgeonError::dims("experts.3.up_proj.weight", &[8, 16], &[8, 12]);
        let msg = err.to_string();
        assert!(msg.contains("experts.3.up_proj.weight"));
        assert!(msg.contains("[8, 16]"));
        assert!(msg.contains("[8, 12]"));
    }

    #[test]
    fn test_io_error_keeps_path() {
        let source = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = SurgeonError::io("/tmp/missing.json", source);
        assert!(err.to_string().contains("/tmp/missing.json"));
    }
}
