//! Stop conditions for a decode.

use std::fmt;

use crate::config::StoppingConfig;

/// Why a step did or did not end the decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Continue,
    EndOfSequence,
    StopStringMatched(String),
    RepetitionCycleDetected,
    MaxStepsReached,
}

impl StopReason {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StopReason::Continue)
    }

    /// Whether text decoded on this step is forwarded to the consumer.
    ///
    /// Only a step that hit the step limit flushes its text. The other
    /// terminal reasons drop whatever the final token produced.
    pub fn emits_pending_text(&self) -> bool {
        matches!(self, StopReason::Continue | StopReason::MaxStepsReached)
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Continue => write!(f, "continue"),
            StopReason::EndOfSequence => write!(f, "end of sequence"),
            StopReason::StopStringMatched(s) => write!(f, "stop string {s:?}"),
            StopReason::RepetitionCycleDetected => write!(f, "repetition cycle"),
            StopReason::MaxStepsReached => write!(f, "max steps"),
        }
    }
}

/// True when the last `window` tokens repeat the `window` tokens before them.
pub fn ends_in_cycle(history: &[u32], window: usize) -> bool {
    if window == 0 || history.len() < 2 * window {
        return false;
    }
    let n = history.len();
    history[n - window..] == history[n - 2 * window..n - window]
}

/// Checks a decode's history against its stop conditions.
///
/// Conditions are checked in a fixed order and the first match wins:
/// end-of-sequence, stop string, repetition cycle, step limit.
#[derive(Debug, Clone)]
pub struct StoppingEvaluator {
    stop_strings: Vec<String>,
    eos_token_id: u32,
    cycle_window: usize,
    max_steps: usize,
}

impl StoppingEvaluator {
    pub fn new(config: &StoppingConfig, eos_token_id: u32, max_steps: usize) -> Self {
        Self {
            stop_strings: config.stop_strings.clone(),
            eos_token_id: config.eos_token_id.unwrap_or(eos_token_id),
            cycle_window: config.cycle_window,
            max_steps,
        }
    }

    pub fn eos_token_id(&self) -> u32 {
        self.eos_token_id
    }

    /// `history` holds every generated token, the newest last. One token is
    /// generated per step, so its length is the step count.
    pub fn evaluate(&self, history: &[u32], text: &str) -> StopReason {
        if history.last() == Some(&self.eos_token_id) {
            return StopReason::EndOfSequence;
        }
        if let Some(s) = self.stop_strings.iter().find(|s| text.contains(s.as_str())) {
            return StopReason::StopStringMatched(s.clone());
        }
        if ends_in_cycle(history, self.cycle_window) {
            return StopReason::RepetitionCycleDetected;
        }
        if history.len() >= self.max_steps {
            return StopReason::MaxStepsReached;
        }
        StopReason::Continue
    }
}
