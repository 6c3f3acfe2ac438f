use ndarray::Array1;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::eligible_softmax;
use crate::error::{DecodeError, DecodeResult};

/// Divides every score by `temperature`. Excluded entries stay excluded.
pub fn apply_temperature(scores: Array1<f32>, temperature: f32) -> Array1<f32> {
    if temperature == 1.0 {
        return scores;
    }
    scores / temperature
}

/// Draws one token id from a filtered score vector.
///
/// The only state is the random source, so a seeded sampler is reproducible.
pub struct Sampler<R: Rng = StdRng> {
    rng: R,
}

impl Sampler<StdRng> {
    pub fn seeded(seed: u64) -> Self {
        Self::new(StdRng::seed_from_u64(seed))
    }

    pub fn from_entropy() -> Self {
        Self::new(StdRng::from_entropy())
    }
}

impl<R: Rng> Sampler<R> {
    pub fn new(rng: R) -> Self {
        Self { rng }
    }

    /// Probability of each entry, renormalized over the eligible ones.
    pub fn probabilities(scores: &Array1<f32>) -> DecodeResult<Array1<f32>> {
        eligible_softmax(scores)
            .ok_or_else(|| DecodeError::invariant("cannot sample from an empty distribution"))
    }

    pub fn sample(&mut self, scores: &Array1<f32>) -> DecodeResult<u32> {
        let probs = Self::probabilities(scores)?;
        let dist = WeightedIndex::new(probs.iter().copied())
            .map_err(|e| DecodeError::invariant(format!("invalid sampling weights: {e}")))?;
        Ok(dist.sample(&mut self.rng) as u32)
    }
}

impl<R: Rng> std::fmt::Debug for Sampler<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sampler").finish_non_exhaustive()
    }
}
