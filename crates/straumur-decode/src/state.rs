use crate::diff::SuffixDiffer;
use crate::error::DecodeResult;

/// Per-decode mutable state. Owned by exactly one running decode.
#[derive(Debug, Default)]
pub struct GenerationState {
    token_history: Vec<u32>,
    cumulative_text: String,
    differ: SuffixDiffer,
}

impl GenerationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_token(&mut self, token_id: u32) {
        self.token_history.push(token_id);
    }

    pub fn set_text(&mut self, text: String) {
        self.cumulative_text = text;
    }

    pub fn token_history(&self) -> &[u32] {
        &self.token_history
    }

    pub fn cumulative_text(&self) -> &str {
        &self.cumulative_text
    }

    pub fn last_emitted_text(&self) -> &str {
        self.differ.emitted()
    }

    pub fn steps(&self) -> usize {
        self.token_history.len()
    }

    /// Text that appeared since the last call, with partial characters held back.
    pub fn take_diff(&mut self) -> DecodeResult<String> {
        self.differ.diff(&self.cumulative_text)
    }

    /// Everything not yet emitted, including a held-back partial character.
    pub fn take_rest(&mut self) -> DecodeResult<String> {
        self.differ.flush(&self.cumulative_text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_tracks_history_and_emission() {
        let mut state = GenerationState::new();
        state.push_token(4);
        state.set_text("Hi".into());
        assert_eq!(state.take_diff().unwrap(), "Hi");

        state.push_token(5);
        state.set_text("Hi there".into());
        assert_eq!(state.steps(), 2);
        assert_eq!(state.token_history(), &[4, 5]);
        assert_eq!(state.take_rest().unwrap(), " there");
        assert_eq!(state.last_emitted_text(), state.cumulative_text());
    }
}
