//! Expert surgery for Mixture-of-Experts checkpoints.
//!
//! Aggregates recorded routing decisions into per-layer hot experts, then
//! rebuilds each routed MoE layer with one extra expert slot: a designated
//! expert is quantized in place and duplicated into the new slot, and the
//! gate is widened to match.

pub mod error;
pub mod gate;
pub mod kernel;
pub mod moe;
pub mod pipeline;
pub mod prompt;
pub mod routing;
pub mod surgery;
pub mod weights;

#[cfg(feature = "python")]
mod python;

pub use error::{Result, SurgeonError};
