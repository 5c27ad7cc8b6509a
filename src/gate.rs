//! Top-k softmax routing gate with a configurable expert count.
//!
//! Given a `[bsz, seq_len, hidden]` batch the gate returns, per token, the
//! `top_k` selected experts, their weights, and (training only) the
//! auxiliary load-balancing loss.

use crate::error::{Result, SurgeonError};
use crate::weights::ModelConfig;
use half::bf16;
use rand::distributions::{Distribution, Uniform};
use rand::Rng;

/// Added to the top-k weight sum before renormalizing.
const NORM_EPS: f32 = 1e-20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoringFunc {
    Softmax,
}

impl ScoringFunc {
    /// Only softmax scoring is supported.
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "softmax" => Ok(ScoringFunc::Softmax),
            other => Err(SurgeonError::NotImplemented(format!(
                "insupportable scoring function for MoE gating: {other}"
            ))),
        }
    }
}

/// Routing hyper-parameters shared by every gate of a model.
#[derive(Debug, Clone, PartialEq)]
pub struct GateConfig {
    pub top_k: usize,
    pub scoring_func: ScoringFunc,
    pub aux_loss_alpha: f32,
    pub seq_aux: bool,
    pub norm_topk_prob: bool,
    pub hidden_size: usize,
}

impl GateConfig {
    pub fn from_model(config: &ModelConfig) -> Result<Self> {
        Ok(GateConfig {
            top_k: config.num_experts_per_tok,
            scoring_func: ScoringFunc::parse(&config.scoring_func)?,
            aux_loss_alpha: config.aux_loss_alpha,
            seq_aux: config.seq_aux,
            norm_topk_prob: config.norm_topk_prob,
            hidden_size: config.hidden_size,
        })
    }
}

/// Result of routing one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct GateOutput {
    pub top_k: usize,
    /// `[tokens * top_k]`, highest score first within each token.
    pub topk_idx: Vec<usize>,
    /// `[tokens * top_k]`, aligned with `topk_idx`.
    pub topk_weight: Vec<f32>,
    /// Only present in training mode with a positive alpha.
    pub aux_loss: Option<f32>,
}

impl GateOutput {
    pub fn num_tokens(&self) -> usize {
        if self.top_k == 0 {
            0
        } else {
            self.topk_idx.len() / self.top_k
        }
    }

    /// Selected experts of each token.
    pub fn experts_per_token(&self) -> impl Iterator<Item = &[usize]> {
        self.topk_idx.chunks(self.top_k.max(1))
    }
}

/// A routing gate over `n_experts` slots.
#[derive(Debug, Clone, PartialEq)]
pub struct MoeGate {
    pub config: GateConfig,
    pub n_experts: usize,
    /// `[n_experts, hidden_size]`, row-major, held at bf16 precision.
    weight: Vec<f32>,
}

impl MoeGate {
    pub fn new(config: GateConfig, n_experts: usize, weight: Vec<f32>) -> Result<Self> {
        if weight.len() != n_experts * config.hidden_size {
            return Err(SurgeonError::dims(
                "gate weight",
                &[n_experts, config.hidden_size],
                &[weight.len()],
            ));
        }
        if config.top_k == 0 || config.top_k > n_experts {
            return Err(SurgeonError::InvalidPlan(format!(
                "top_k {} must be in 1..={n_experts}",
                config.top_k
            )));
        }
        let weight = weight.into_iter().map(|w| bf16::from_f32(w).to_f32()).collect();
        Ok(MoeGate { config, n_experts, weight })
    }

    /// Fresh gate, Kaiming-uniform with a = √5: U(-1/√fan_in, 1/√fan_in).
    pub fn kaiming<R: Rng>(config: GateConfig, n_experts: usize, rng: &mut R) -> Result<Self> {
        let fan_in = config.hidden_size.max(1) as f32;
        let bound = 1.0 / fan_in.sqrt();
        let dist = Uniform::new_inclusive(-bound, bound);
        let weight = (0..n_experts * config.hidden_size).map(|_| dist.sample(rng)).collect();
        MoeGate::new(config, n_experts, weight)
    }

    pub fn weight(&self) -> &[f32] {
        &self.weight
    }

    pub fn row(&self, expert_idx: usize) -> &[f32] {
        let h = self.config.hidden_size;
        &self.weight[expert_idx * h..(expert_idx + 1) * h]
    }

    /// Route a `[bsz, seq_len, hidden]` batch.
    pub fn forward(&self, hidden: &[f32], bsz: usize, seq_len: usize, training: bool) -> Result<GateOutput> {
        let h = self.config.hidden_size;
        if hidden.len() != bsz * seq_len * h {
            return Err(SurgeonError::dims("gate input", &[bsz, seq_len, h], &[hidden.len()]));
        }
        let n = self.n_experts;
        let k = self.config.top_k;
        let tokens = bsz * seq_len;

        let mut scores = vec![0.0f32; tokens * n];
        for (x, row_scores) in hidden.chunks_exact(h).zip(scores.chunks_exact_mut(n)) {
            for (e, s) in row_scores.iter_mut().enumerate() {
                *s = self.row(e).iter().zip(x).map(|(w, v)| w * v).sum();
            }
            match self.config.scoring_func {
                ScoringFunc::Softmax => softmax_in_place(row_scores),
            }
        }

        let mut topk_idx = Vec::with_capacity(tokens * k);
        let mut topk_weight = Vec::with_capacity(tokens * k);
        for row_scores in scores.chunks_exact(n) {
            let picked = top_k(row_scores, k);
            let mut weights: Vec<f32> = picked.iter().map(|&e| row_scores[e]).collect();
            if k > 1 && self.config.norm_topk_prob {
                let denom = weights.iter().sum::<f32>() + NORM_EPS;
                weights.iter_mut().for_each(|w| *w /= denom);
            }
            topk_idx.extend(picked);
            topk_weight.extend(weights);
        }

        let aux_loss = if training && self.config.aux_loss_alpha > 0.0 {
            Some(if self.config.seq_aux {
                self.seq_aux_loss(&scores, &topk_idx, bsz, seq_len)
            } else {
                self.global_aux_loss(&scores, &topk_idx, tokens)
            })
        } else {
            None
        };

        Ok(GateOutput { top_k: k, topk_idx, topk_weight, aux_loss })
    }

    /// Per-sequence: `ce[b, e] = count_b(e) / (seq_len * k / n)`,
    /// loss = mean over b of Σ_e ce[b, e] * mean_s P[b, s, e], times alpha.
    fn seq_aux_loss(&self, scores: &[f32], topk_idx: &[usize], bsz: usize, seq_len: usize) -> f32 {
        let n = self.n_experts;
        let k = self.config.top_k;
        if bsz == 0 || seq_len == 0 {
            return 0.0;
        }
        let expected = (seq_len * k) as f32 / n as f32;

        let mut total = 0.0f32;
        for b in 0..bsz {
            let mut ce = vec![0.0f32; n];
            for &e in &topk_idx[b * seq_len * k..(b + 1) * seq_len * k] {
                ce[e] += 1.0;
            }
            ce.iter_mut().for_each(|c| *c /= expected);

            let mut mean_score = vec![0.0f32; n];
            for row in scores[b * seq_len * n..(b + 1) * seq_len * n].chunks_exact(n) {
                mean_score.iter_mut().zip(row).for_each(|(m, s)| *m += s);
            }
            mean_score.iter_mut().for_each(|m| *m /= seq_len as f32);

            total += ce.iter().zip(&mean_score).map(|(c, p)| c * p).sum::<f32>();
        }
        total / bsz as f32 * self.config.aux_loss_alpha
    }

    /// Global: `fi = (count(e) / (tokens * k)) * n`, `Pi = mean_t P[t, e]`,
    /// loss = Σ_e Pi * fi, times alpha.
    fn global_aux_loss(&self, scores: &[f32], topk_idx: &[usize], tokens: usize) -> f32 {
        let n = self.n_experts;
        if tokens == 0 {
            return 0.0;
        }

        let mut ce = vec![0.0f32; n];
        for &e in topk_idx {
            ce[e] += 1.0;
        }
        let slots = topk_idx.len() as f32;

        let mut pi = vec![0.0f32; n];
        for row in scores.chunks_exact(n) {
            pi.iter_mut().zip(row).for_each(|(p, s)| *p += s);
        }

        (0..n)
            .map(|e| (pi[e] / tokens as f32) * (ce[e] / slots * n as f32))
            .sum::<f32>()
            * self.config.aux_loss_alpha
    }
}

fn softmax_in_place(row: &mut [f32]) {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for v in row.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    row.iter_mut().for_each(|v| *v /= sum);
}

/// Indices of the `k` largest scores, descending; equal scores keep the lower index first.
fn top_k(scores: &[f32], k: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]).then(a.cmp(&b)));
    order.truncate(k);
    order
}
