//! Safetensors file reading via mmap, and writing of parameter dictionaries.
//!
//! File layout: `u64` little-endian header length, JSON header mapping tensor
//! names to `{dtype, shape, data_offsets}` (plus an optional `__metadata__`
//! entry), then the raw tensor bytes.

use crate::error::{Result, SurgeonError};
use crate::weights::{byte_len, DType, ParamDict, Tensor};
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

const METADATA_KEY: &str = "__metadata__";

/// Where one tensor lives inside the data section.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorInfo {
    pub dtype: DType,
    pub shape: Vec<usize>,
    /// `[start, end)` relative to the start of the data section.
    pub data_offsets: [usize; 2],
}

#[derive(Deserialize)]
struct RawTensorInfo {
    dtype: String,
    shape: Vec<usize>,
    data_offsets: [usize; 2],
}

#[derive(Serialize)]
struct HeaderEntry<'a> {
    dtype: &'a str,
    shape: &'a [usize],
    data_offsets: [usize; 2],
}

/// A memory-mapped safetensors file with lazy tensor access.
pub struct MmapSafetensors {
    path: PathBuf,
    mmap: Mmap,
    data_start: usize,
    tensors: BTreeMap<String, TensorInfo>,
}

impl MmapSafetensors {
    /// Open, mmap and index a safetensors file.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| SurgeonError::io(path, e))?;
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| SurgeonError::io(path, e))?;
        let bad = |reason: String| SurgeonError::Safetensors { path: path.to_path_buf(), reason };

        if mmap.len() < 8 {
            return Err(bad(format!("file too small for header ({} bytes)", mmap.len())));
        }
        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&mmap[..8]);
        let header_len = usize::try_from(u64::from_le_bytes(len_bytes))
            .map_err(|_| bad("header length exceeds usize".into()))?;
        let data_start = 8usize
            .checked_add(header_len)
            .filter(|&end| end <= mmap.len())
            .ok_or_else(|| bad(format!("header length {header_len} runs past end of file")))?;

        let header: HashMap<String, serde_json::Value> =
            serde_json::from_slice(&mmap[8..data_start])
                .map_err(|e| SurgeonError::json(format!("safetensors header of {}", path.display()), e))?;

        let data_len = mmap.len() - data_start;
        let mut tensors = BTreeMap::new();
        for (name, value) in header {
            if name == METADATA_KEY {
                continue;
            }
            let raw: RawTensorInfo = serde_json::from_value(value)
                .map_err(|e| SurgeonError::json(format!("header entry {name}"), e))?;
            let dtype = DType::from_name(&raw.dtype)?;
            let [start, end] = raw.data_offsets;
            let expected = byte_len(&raw.shape, dtype)
                .ok_or_else(|| bad(format!("tensor {name}: shape {:?} overflows the address space", raw.shape)))?;
            if start > end || end > data_len || end - start != expected {
                return Err(bad(format!(
                    "tensor {name}: offsets [{start}, {end}) do not hold {expected} bytes \
                     within {data_len} data bytes"
                )));
            }
            tensors.insert(name, TensorInfo { dtype, shape: raw.shape, data_offsets: raw.data_offsets });
        }

        log::debug!("Opened {}: {} tensors", path.display(), tensors.len());

        Ok(MmapSafetensors { path: path.to_path_buf(), mmap, data_start, tensors })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn tensor_info(&self, name: &str) -> Option<&TensorInfo> {
        self.tensors.get(name)
    }

    /// Tensor names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Zero-copy view of a tensor's bytes.
    pub fn tensor_bytes(&self, name: &str) -> Result<&[u8]> {
        let info = self
            .tensors
            .get(name)
            .ok_or_else(|| SurgeonError::MissingTensor(name.to_string()))?;
        let [start, end] = info.data_offsets;
        Ok(&self.mmap[self.data_start + start..self.data_start + end])
    }

    /// Copy a tensor out of the mapping.
    pub fn tensor(&self, name: &str) -> Result<Tensor> {
        let bytes = self.tensor_bytes(name)?;
        let info = &self.tensors[name];
        Tensor::new(info.dtype, info.shape.clone(), bytes.to_vec())
    }
}

/// Write every tensor of `params` into a single safetensors file.
pub fn write_safetensors(path: &Path, params: &ParamDict) -> Result<()> {
    let mut header = BTreeMap::new();
    let mut offset = 0usize;
    for (name, tensor) in params.iter() {
        let end = offset + tensor.size_bytes();
        header.insert(
            name.as_str(),
            HeaderEntry { dtype: tensor.dtype().name(), shape: tensor.shape(), data_offsets: [offset, end] },
        );
        offset = end;
    }

    let mut header_bytes = serde_json::to_vec(&header)
        .map_err(|e| SurgeonError::json("safetensors header", e))?;
    // Data section starts 8-byte aligned.
    while header_bytes.len() % 8 != 0 {
        header_bytes.push(b' ');
    }

    let file = File::create(path).map_err(|e| SurgeonError::io(path, e))?;
    let mut w = BufWriter::new(file);
    let io = |e: std::io::Error| SurgeonError::io(path, e);
    w.write_all(&(header_bytes.len() as u64).to_le_bytes()).map_err(io)?;
    w.write_all(&header_bytes).map_err(io)?;
    for (_, tensor) in params.iter() {
        w.write_all(tensor.bytes()).map_err(io)?;
    }
    w.flush().map_err(io)?;

    log::info!(
        "Wrote {} tensors ({:.1} MB) to {}",
        params.len(),
        offset as f64 / (1024.0 * 1024.0),
        path.display(),
    );
    Ok(())
}
