//! Symmetric per-group integer quantization for expert projections.
//!
//! Layout per matrix `[rows, cols]`:
//! - `packed`: each row padded to whole `u32` words, `32 / bits` values per word,
//!   lowest column in the lowest bits
//! - `scales`: `[rows, ceil(cols / group_size)]` bf16, one per group
//!
//! A value dequantizes as `q * scale` with `q` sign-extended from `bits`.

use crate::error::{Result, SurgeonError};
use half::bf16;
use rayon::prelude::*;

/// Values per quantization group (bitsandbytes 4-bit blocksize).
pub const DEFAULT_GROUP_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantBits {
    Int4,
    Int8,
}

impl QuantBits {
    pub fn from_bits(bits: u8) -> Result<Self> {
        match bits {
            4 => Ok(QuantBits::Int4),
            8 => Ok(QuantBits::Int8),
            other => Err(SurgeonError::NotImplemented(format!(
                "{other}-bit expert quantization (supported: 4, 8)"
            ))),
        }
    }

    pub fn bits(self) -> u32 {
        match self {
            QuantBits::Int4 => 4,
            QuantBits::Int8 => 8,
        }
    }

    fn values_per_word(self) -> usize {
        32 / self.bits() as usize
    }

    fn qmax(self) -> i32 {
        (1 << (self.bits() - 1)) - 1
    }

    fn qmin(self) -> i32 {
        -(1 << (self.bits() - 1))
    }

    fn mask(self) -> u32 {
        (1u32 << self.bits()) - 1
    }

    /// Short label used in logs.
    pub fn name(self) -> &'static str {
        match self {
            QuantBits::Int4 => "int4",
            QuantBits::Int8 => "int8",
        }
    }
}

/// Quantization settings applied to every replaced expert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuantSpec {
    pub bits: QuantBits,
    pub group_size: usize,
}

impl Default for QuantSpec {
    fn default() -> Self {
        QuantSpec { bits: QuantBits::Int4, group_size: DEFAULT_GROUP_SIZE }
    }
}

/// A row-major weight matrix stored at reduced precision.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedMatrix {
    pub rows: usize,
    pub cols: usize,
    pub group_size: usize,
    pub bits: QuantBits,
    pub packed: Vec<u32>,
    pub scales: Vec<bf16>,
}

impl QuantizedMatrix {
    /// Quantize `values` (`rows * cols`, row-major).
    pub fn quantize(
        values: &[f32],
        rows: usize,
        cols: usize,
        group_size: usize,
        bits: QuantBits,
    ) -> Result<Self> {
        if values.len() != rows * cols {
            return Err(SurgeonError::dims("quantize input", &[rows * cols], &[values.len()]));
        }
        if group_size == 0 {
            return Err(SurgeonError::InvalidPlan("quantization group size must be > 0".into()));
        }
        if cols == 0 {
            return Ok(QuantizedMatrix {
                rows,
                cols,
                group_size,
                bits,
                packed: Vec::new(),
                scales: Vec::new(),
            });
        }

        let per_row: Vec<(Vec<u32>, Vec<bf16>)> = values
            .par_chunks(cols)
            .map(|row| quantize_row(row, group_size, bits))
            .collect();

        let words_per_row = words_per_row(cols, bits);
        let groups = cols.div_ceil(group_size);
        let mut packed = Vec::with_capacity(rows * words_per_row);
        let mut scales = Vec::with_capacity(rows * groups);
        for (p, s) in per_row {
            packed.extend(p);
            scales.extend(s);
        }

        Ok(QuantizedMatrix { rows, cols, group_size, bits, packed, scales })
    }

    /// All-zero matrix of the given shape, ready to receive weights.
    pub fn zeros(rows: usize, cols: usize, group_size: usize, bits: QuantBits) -> Self {
        let group_size = group_size.max(1);
        QuantizedMatrix {
            rows,
            cols,
            group_size,
            bits,
            packed: vec![0u32; rows * words_per_row(cols, bits)],
            scales: vec![bf16::ZERO; rows * cols.div_ceil(group_size)],
        }
    }

    pub fn shape(&self) -> [usize; 2] {
        [self.rows, self.cols]
    }

    fn words_per_row(&self) -> usize {
        words_per_row(self.cols, self.bits)
    }

    fn groups_per_row(&self) -> usize {
        self.cols.div_ceil(self.group_size)
    }

    /// Dequantize one row into `out` (`cols` values).
    pub fn dequantize_row(&self, row: usize, out: &mut [f32]) {
        debug_assert_eq!(out.len(), self.cols);
        let vpw = self.bits.values_per_word();
        let shift_back = 32 - self.bits.bits();
        let words = &self.packed[row * self.words_per_row()..(row + 1) * self.words_per_row()];
        let scales = &self.scales[row * self.groups_per_row()..(row + 1) * self.groups_per_row()];

        for (col, slot) in out.iter_mut().enumerate() {
            let word = words[col / vpw];
            let raw = (word >> ((col % vpw) as u32 * self.bits.bits())) & self.bits.mask();
            let q = ((raw << shift_back) as i32) >> shift_back;
            *slot = q as f32 * scales[col / self.group_size].to_f32();
        }
    }

    pub fn dequantize(&self) -> Vec<f32> {
        let mut out = vec![0.0f32; self.rows * self.cols];
        if self.cols == 0 {
            return out;
        }
        out.par_chunks_mut(self.cols)
            .enumerate()
            .for_each(|(row, chunk)| self.dequantize_row(row, chunk));
        out
    }

    /// Bytes held by packed values and scales.
    pub fn storage_bytes(&self) -> usize {
        self.packed.len() * 4 + self.scales.len() * 2
    }
}

fn words_per_row(cols: usize, bits: QuantBits) -> usize {
    cols.div_ceil(bits.values_per_word())
}

fn quantize_row(row: &[f32], group_size: usize, bits: QuantBits) -> (Vec<u32>, Vec<bf16>) {
    let vpw = bits.values_per_word();
    let mut packed = vec![0u32; words_per_row(row.len(), bits)];
    let mut scales = Vec::with_capacity(row.len().div_ceil(group_size));

    for (g, group) in row.chunks(group_size).enumerate() {
        let max_abs = group.iter().fold(0.0f32, |m, v| m.max(v.abs()));
        // Round the scale first so quantize and dequantize agree exactly.
        let scale = bf16::from_f32(max_abs / bits.qmax() as f32);
        scales.push(scale);
        let s = scale.to_f32();

        for (i, &v) in group.iter().enumerate() {
            let q = if s == 0.0 {
                0
            } else {
                ((v / s).round() as i32).clamp(bits.qmin(), bits.qmax())
            };
            let col = g * group_size + i;
            packed[col / vpw] |= (q as u32 & bits.mask()) << ((col % vpw) as u32 * bits.bits());
        }
    }

    (packed, scales)
}
