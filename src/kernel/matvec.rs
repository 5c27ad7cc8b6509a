//! Mat-vec kernels for a single token: `y = W x` with `W` stored `[rows, cols]`.
//!
//! Quantized weights are dequantized one row at a time into a scratch row, so
//! the full-precision matrix is never materialized.

use crate::weights::quant::QuantizedMatrix;
use rayon::prelude::*;

/// Rows per rayon task in the parallel kernel.
const ROWS_PER_TASK: usize = 64;

/// Dense f32 mat-vec.
pub fn matvec_dense(weight: &[f32], cols: usize, x: &[f32], out: &mut [f32]) {
    assert_eq!(x.len(), cols);
    assert_eq!(weight.len(), out.len() * cols);

    for (row, y) in weight.chunks_exact(cols).zip(out.iter_mut()) {
        *y = dot(row, x);
    }
}

/// Quantized mat-vec, single thread.
pub fn matvec_quantized(weight: &QuantizedMatrix, x: &[f32], out: &mut [f32]) {
    assert_eq!(x.len(), weight.cols);
    assert_eq!(out.len(), weight.rows);

    let mut scratch = vec![0.0f32; weight.cols];
    for (r, y) in out.iter_mut().enumerate() {
        weight.dequantize_row(r, &mut scratch);
        *y = dot(&scratch, x);
    }
}

/// Quantized mat-vec split across rayon tasks by output row.
pub fn matvec_quantized_parallel(weight: &QuantizedMatrix, x: &[f32], out: &mut [f32]) {
    assert_eq!(x.len(), weight.cols);
    assert_eq!(out.len(), weight.rows);

    out.par_chunks_mut(ROWS_PER_TASK)
        .enumerate()
        .for_each(|(chunk_idx, ys)| {
            let mut scratch = vec![0.0f32; weight.cols];
            for (i, y) in ys.iter_mut().enumerate() {
                weight.dequantize_row(chunk_idx * ROWS_PER_TASK + i, &mut scratch);
                *y = dot(&scratch, x);
            }
        });
}

#[inline]
fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
