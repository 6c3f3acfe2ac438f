//! Incremental text emission.

use crate::error::{DecodeError, DecodeResult};

const REPLACEMENT: char = '\u{FFFD}';

/// Turns successive snapshots of the decoded text into newly appeared suffixes.
///
/// A trailing U+FFFD usually means the last token ended inside a multi-byte
/// character, so it is held back until the next snapshot resolves it or
/// [`SuffixDiffer::flush`] is called.
#[derive(Debug, Clone, Default)]
pub struct SuffixDiffer {
    emitted: String,
}

impl SuffixDiffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything emitted so far.
    pub fn emitted(&self) -> &str {
        &self.emitted
    }

    /// Returns the text added since the last emission. Empty when nothing new
    /// is decodable yet.
    pub fn diff(&mut self, cumulative: &str) -> DecodeResult<String> {
        let pending = self.pending(cumulative)?;
        let ready = pending.trim_end_matches(REPLACEMENT);
        let out = ready.to_string();
        self.emitted.push_str(&out);
        Ok(out)
    }

    /// Like [`SuffixDiffer::diff`] but emits a trailing U+FFFD as well.
    pub fn flush(&mut self, cumulative: &str) -> DecodeResult<String> {
        let out = self.pending(cumulative)?.to_string();
        self.emitted.push_str(&out);
        Ok(out)
    }

    fn pending<'a>(&self, cumulative: &'a str) -> DecodeResult<&'a str> {
        if cumulative.len() < self.emitted.len() {
            return Err(DecodeError::invariant(format!(
                "decoded text shrank below emitted text ({} < {} bytes)",
                cumulative.len(),
                self.emitted.len()
            )));
        }
        if !cumulative.starts_with(self.emitted.as_str()) {
            return Err(DecodeError::invariant(
                "decoded text no longer starts with the emitted text",
            ));
        }
        Ok(&cumulative[self.emitted.len()..])
    }
}
