use std::fmt;
use std::str::FromStr;

use crate::error::{StraumurError, StraumurResult};
use crate::protocol::InboundMessage;

/// How a question is answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuestionKind {
    /// Streamed from the language model, fragment by fragment.
    Auto,
    /// Answered once by the extractive answerer.
    Masked,
}

impl QuestionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            QuestionKind::Auto => "auto",
            QuestionKind::Masked => "masked",
        }
    }
}

impl FromStr for QuestionKind {
    type Err = StraumurError;

    fn from_str(s: &str) -> StraumurResult<Self> {
        match s {
            "auto" => Ok(QuestionKind::Auto),
            "masked" => Ok(QuestionKind::Masked),
            other => Err(StraumurError::UnknownKind(other.to_string())),
        }
    }
}

impl fmt::Display for QuestionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated question: non-blank text and a known kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    kind: QuestionKind,
    text: String,
}

impl Question {
    pub fn new(kind: QuestionKind, text: &str) -> StraumurResult<Self> {
        let text = text.trim();
        if text.is_empty() {
            return Err(StraumurError::EmptyQuestion);
        }
        Ok(Self {
            kind,
            text: text.to_string(),
        })
    }

    /// Validates a wire message. A blank question is reported before an unknown kind.
    pub fn from_message(message: &InboundMessage) -> StraumurResult<Self> {
        if message.question.trim().is_empty() {
            return Err(StraumurError::EmptyQuestion);
        }
        let kind = message.kind.as_deref().unwrap_or_default().parse()?;
        Self::new(kind, &message.question)
    }

    pub fn kind(&self) -> QuestionKind {
        self.kind
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}
