//! Score shaping and token selection.
//!
//! A decode step runs these in a fixed order:
//!
//! 1. [`RepetitionPenalizer`] on the raw scores
//! 2. [`apply_temperature`]
//! 3. [`NucleusFilter`] (top-k, then top-p)
//! 4. [`Sampler`] (softmax over eligible entries, one weighted draw)
//!
//! Excluded entries are represented as `f32::NEG_INFINITY`.

mod filter;
mod penalty;
mod sampler;

pub use filter::NucleusFilter;
pub use penalty::RepetitionPenalizer;
pub use sampler::{apply_temperature, Sampler};

use ndarray::Array1;

/// Excluded value written by the filters.
pub const EXCLUDED: f32 = f32::NEG_INFINITY;

/// An entry can be sampled if it is a real number above the excluded sentinel.
#[inline]
pub fn is_eligible(score: f32) -> bool {
    score > EXCLUDED && !score.is_nan()
}

/// Softmax restricted to eligible entries. Excluded entries get probability 0.
///
/// Returns `None` when nothing is eligible.
pub fn eligible_softmax(scores: &Array1<f32>) -> Option<Array1<f32>> {
    let max = scores
        .iter()
        .copied()
        .filter(|&s| is_eligible(s))
        .fold(None, |acc: Option<f32>, s| Some(acc.map_or(s, |m| m.max(s))))?;

    let mut probs = scores.mapv(|s| if is_eligible(s) { (s - max).exp() } else { 0.0 });
    let sum = probs.sum();
    if sum <= 0.0 || !sum.is_finite() {
        return None;
    }
    probs /= sum;
    Some(probs)
}
