use std::cmp::Ordering;

use ndarray::Array1;

use super::{eligible_softmax, is_eligible, EXCLUDED};
use crate::config::SamplingConfig;
use crate::error::{DecodeError, DecodeResult};

/// Top-k followed by top-p (nucleus) cutoff over temperature-scaled scores.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NucleusFilter {
    top_k: usize,
    top_p: f32,
}

impl NucleusFilter {
    pub fn new(top_k: usize, top_p: f32) -> Self {
        Self { top_k, top_p }
    }

    pub fn from_config(config: &SamplingConfig) -> Self {
        Self::new(config.top_k(), config.top_p())
    }

    /// Applies both cutoffs. Fails if no entry is left eligible.
    pub fn apply(&self, scores: Array1<f32>) -> DecodeResult<Array1<f32>> {
        let scores = self.top_k(scores);
        let scores = self.top_p(scores);

        if !scores.iter().any(|&s| is_eligible(s)) {
            return Err(DecodeError::invariant(
                "nucleus filter left no eligible tokens",
            ));
        }
        Ok(scores)
    }

    /// Excludes every score strictly below the k-th largest. Ties at the
    /// k-th value are all kept.
    pub fn top_k(&self, mut scores: Array1<f32>) -> Array1<f32> {
        if self.top_k == 0 || self.top_k >= scores.len() {
            return scores;
        }

        let mut sorted: Vec<f32> = scores.iter().copied().filter(|&s| is_eligible(s)).collect();
        if sorted.len() <= self.top_k {
            return scores;
        }
        sorted.sort_unstable_by(|a, b| b.total_cmp(a));
        let kth = sorted[self.top_k - 1];

        scores.mapv_inplace(|s| if s < kth { EXCLUDED } else { s });
        scores
    }

    /// Keeps the smallest descending prefix whose cumulative probability
    /// reaches `top_p`. The first token crossing the threshold is kept.
    pub fn top_p(&self, mut scores: Array1<f32>) -> Array1<f32> {
        if self.top_p >= 1.0 {
            return scores;
        }
        let Some(probs) = eligible_softmax(&scores) else {
            return scores;
        };

        let mut order: Vec<usize> = (0..scores.len()).filter(|&i| is_eligible(scores[i])).collect();
        order.sort_by(|&a, &b| scores[b].partial_cmp(&scores[a]).unwrap_or(Ordering::Equal));

        // Exclusion is decided on the mass *before* each token, which is the
        // mask shifted right by one: the head is never removed.
        let mut cumulative = 0.0f32;
        for idx in order {
            if cumulative > self.top_p {
                scores[idx] = EXCLUDED;
            }
            cumulative += probs[idx];
        }
        scores
    }
}
