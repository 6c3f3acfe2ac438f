//! Validated request configuration.
//!
//! Every value here is checked when it is built. Nothing is clamped: an
//! out-of-range temperature or nucleus threshold is rejected with
//! [`DecodeError::InvalidConfig`] before a backend is ever touched.

use serde::{Deserialize, Serialize};

use crate::error::{DecodeError, DecodeResult};

// ============================================================================
// Defaults
// ============================================================================

pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_TOP_K: usize = 50;
pub const DEFAULT_TOP_P: f32 = 0.9;
pub const DEFAULT_REPETITION_PENALTY: f32 = 1.5;
pub const DEFAULT_REPETITION_WINDOW: usize = 10;
pub const DEFAULT_MAX_STEPS: usize = 100;

// ============================================================================
// SamplingConfig
// ============================================================================

/// Parameters controlling how the next token is chosen.
///
/// - `top_k == 0` disables top-k.
/// - `top_p == 1.0` disables nucleus filtering.
/// - `repetition_penalty == 1.0` disables the penalty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawSamplingConfig")]
pub struct SamplingConfig {
    temperature: f32,
    top_k: usize,
    top_p: f32,
    repetition_penalty: f32,
    repetition_window: usize,
}

impl SamplingConfig {
    pub fn new(
        temperature: f32,
        top_k: usize,
        top_p: f32,
        repetition_penalty: f32,
        repetition_window: usize,
    ) -> DecodeResult<Self> {
        if !temperature.is_finite() || temperature <= 0.0 {
            return Err(DecodeError::invalid(format!(
                "temperature must be a finite value > 0, got {temperature}"
            )));
        }
        if !top_p.is_finite() || top_p <= 0.0 || top_p > 1.0 {
            return Err(DecodeError::invalid(format!(
                "top_p must be in (0, 1], got {top_p}"
            )));
        }
        if !repetition_penalty.is_finite() || repetition_penalty < 1.0 {
            return Err(DecodeError::invalid(format!(
                "repetition_penalty must be a finite value >= 1.0, got {repetition_penalty}"
            )));
        }
        if repetition_window == 0 {
            return Err(DecodeError::invalid("repetition_window must be at least 1"));
        }

        Ok(Self {
            temperature,
            top_k,
            top_p,
            repetition_penalty,
            repetition_window,
        })
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    pub fn top_p(&self) -> f32 {
        self.top_p
    }

    pub fn repetition_penalty(&self) -> f32 {
        self.repetition_penalty
    }

    pub fn repetition_window(&self) -> usize {
        self.repetition_window
    }

    /// Returns a copy with a different nucleus threshold.
    pub fn with_top_p(&self, top_p: f32) -> DecodeResult<Self> {
        Self::new(
            self.temperature,
            self.top_k,
            top_p,
            self.repetition_penalty,
            self.repetition_window,
        )
    }
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: DEFAULT_TEMPERATURE,
            top_k: DEFAULT_TOP_K,
            top_p: DEFAULT_TOP_P,
            repetition_penalty: DEFAULT_REPETITION_PENALTY,
            repetition_window: DEFAULT_REPETITION_WINDOW,
        }
    }
}

/// Unchecked form used for deserialization; converted through [`SamplingConfig::new`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct RawSamplingConfig {
    temperature: f32,
    top_k: usize,
    top_p: f32,
    repetition_penalty: f32,
    repetition_window: usize,
}

impl Default for RawSamplingConfig {
    fn default() -> Self {
        let d = SamplingConfig::default();
        Self {
            temperature: d.temperature,
            top_k: d.top_k,
            top_p: d.top_p,
            repetition_penalty: d.repetition_penalty,
            repetition_window: d.repetition_window,
        }
    }
}

impl TryFrom<RawSamplingConfig> for SamplingConfig {
    type Error = DecodeError;

    fn try_from(raw: RawSamplingConfig) -> DecodeResult<Self> {
        Self::new(
            raw.temperature,
            raw.top_k,
            raw.top_p,
            raw.repetition_penalty,
            raw.repetition_window,
        )
    }
}

// ============================================================================
// StoppingConfig
// ============================================================================

/// Conditions that end a decode.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StoppingConfig {
    /// Matched as substrings of the cumulative decoded text, in order.
    pub stop_strings: Vec<String>,
    /// Left unset to take the backend's end-of-sequence id.
    pub eos_token_id: Option<u32>,
    /// Length of the repeating block checked for cycles. `0` disables the check.
    pub cycle_window: usize,
}

impl StoppingConfig {
    pub fn new<I, S>(stop_strings: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            stop_strings: stop_strings.into_iter().map(Into::into).collect(),
            eos_token_id: None,
            cycle_window: DEFAULT_REPETITION_WINDOW,
        }
    }

    pub fn with_eos_token_id(mut self, id: u32) -> Self {
        self.eos_token_id = Some(id);
        self
    }

    pub fn with_cycle_window(mut self, window: usize) -> Self {
        self.cycle_window = window;
        self
    }

    pub fn validate(&self) -> DecodeResult<()> {
        if let Some(pos) = self.stop_strings.iter().position(|s| s.is_empty()) {
            return Err(DecodeError::invalid(format!(
                "stop string #{pos} is empty and would match immediately"
            )));
        }
        Ok(())
    }
}

// ============================================================================
// GenerationRequest
// ============================================================================

/// One immutable decode job.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    prompt: String,
    sampling: SamplingConfig,
    stopping: StoppingConfig,
    max_steps: usize,
    seed: Option<u64>,
}

impl GenerationRequest {
    pub fn new(
        prompt: impl Into<String>,
        sampling: SamplingConfig,
        stopping: StoppingConfig,
        max_steps: usize,
    ) -> DecodeResult<Self> {
        let prompt = prompt.into();
        if prompt.trim().is_empty() {
            return Err(DecodeError::invalid("prompt is empty"));
        }
        if max_steps == 0 {
            return Err(DecodeError::invalid("max_steps must be at least 1"));
        }
        stopping.validate()?;

        Ok(Self {
            prompt,
            sampling,
            stopping,
            max_steps,
            seed: None,
        })
    }

    /// Fixes the sampler's random source for reproducible output.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn sampling(&self) -> &SamplingConfig {
        &self.sampling
    }

    pub fn stopping(&self) -> &StoppingConfig {
        &self.stopping
    }

    pub fn max_steps(&self) -> usize {
        self.max_steps
    }

    pub fn seed(&self) -> Option<u64> {
        self.seed
    }
}
