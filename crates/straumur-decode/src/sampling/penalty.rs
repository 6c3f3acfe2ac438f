use std::collections::HashSet;

use ndarray::Array1;

use crate::config::SamplingConfig;

/// Dampens the scores of recently generated tokens.
///
/// The lookback covers the last `2 * window` generated tokens. Every distinct
/// id found there has its score divided by the penalty, once.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RepetitionPenalizer {
    penalty: f32,
    window: usize,
}

impl RepetitionPenalizer {
    pub fn new(penalty: f32, window: usize) -> Self {
        Self { penalty, window }
    }

    pub fn from_config(config: &SamplingConfig) -> Self {
        Self::new(config.repetition_penalty(), config.repetition_window())
    }

    pub fn is_noop(&self) -> bool {
        self.penalty == 1.0
    }

    /// The slice of `history` the penalty looks at.
    pub fn lookback<'a>(&self, history: &'a [u32]) -> &'a [u32] {
        let span = history.len().min(self.window.saturating_mul(2));
        &history[history.len() - span..]
    }

    /// Returns the penalized scores. `history` is only read.
    ///
    /// Ids outside the vocabulary are ignored.
    pub fn apply(&self, mut scores: Array1<f32>, history: &[u32]) -> Array1<f32> {
        if self.is_noop() {
            return scores;
        }

        let seen: HashSet<u32> = self.lookback(history).iter().copied().collect();
        for token_id in seen {
            let idx = token_id as usize;
            if idx < scores.len() {
                scores[idx] /= self.penalty;
            }
        }
        scores
    }
}
