//! Wire messages exchanged with clients.
//!
//! Inbound: `{"type": "auto" | "masked", "question": "..."}`.
//! Outbound success frames are `{"answer": "..."}`. Errors are plain text
//! starting with `Error`, so they can never be mistaken for an answer frame.

use serde::{Deserialize, Serialize};

use crate::error::{StraumurError, StraumurResult};

/// Payload of the last frame of a streamed answer.
pub const END_MARKER: &str = "[END]";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InboundMessage {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub question: String,
}

impl InboundMessage {
    pub fn parse(text: &str) -> StraumurResult<Self> {
        serde_json::from_str(text).map_err(|e| StraumurError::InvalidMessage(e.to_string()))
    }
}

#[derive(Serialize)]
struct AnswerPayload<'a> {
    answer: &'a str,
}

/// One frame sent to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Answer(String),
    Error(String),
}

impl OutboundFrame {
    pub fn end() -> Self {
        OutboundFrame::Answer(END_MARKER.to_string())
    }

    pub fn is_end(&self) -> bool {
        matches!(self, OutboundFrame::Answer(a) if a == END_MARKER)
    }

    /// The user-visible text for an error.
    pub fn from_error(err: &StraumurError) -> Self {
        let text = match err {
            StraumurError::EmptyQuestion => "Error: No question provided.".to_string(),
            StraumurError::UnknownKind(_) => "Error: Unknown question type.".to_string(),
            other => format!("Error processing message: {other}"),
        };
        OutboundFrame::Error(text)
    }

    /// Serializes the frame for a text message.
    pub fn to_text(&self) -> String {
        match self {
            OutboundFrame::Answer(answer) => {
                serde_json::to_string(&AnswerPayload { answer }).unwrap_or_else(|e| {
                    log::error!("Failed to encode answer frame: {}", e);
                    format!("Error processing message: {e}")
                })
            }
            OutboundFrame::Error(text) => text.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_inbound() {
        let msg = InboundMessage::parse(r#"{"type": "auto", "question": " hi "}"#).unwrap();
        assert_eq!(msg.kind.as_deref(), Some("auto"));
        assert_eq!(msg.question, " hi ");

        let msg = InboundMessage::parse("{}").unwrap();
        assert_eq!(msg.kind, None);
        assert!(msg.question.is_empty());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let err = InboundMessage::parse("not json").unwrap_err();
        assert!(matches!(err, StraumurError::InvalidMessage(_)));
        assert!(InboundMessage::parse(r#"{"question": 3}"#).is_err());
    }

    #[test]
    fn test_answer_frame_json() {
        let frame = OutboundFrame::Answer("a \"quoted\"\nline".into());
        let value: serde_json::Value = serde_json::from_str(&frame.to_text()).unwrap();
        assert_eq!(value["answer"], "a \"quoted\"\nline");

        assert_eq!(OutboundFrame::end().to_text(), r#"{"answer":"[END]"}"#);
        assert!(OutboundFrame::end().is_end());
    }

    #[test]
    fn test_error_frames_are_plain_text() {
        let frame = OutboundFrame::from_error(&StraumurError::EmptyQuestion);
        assert_eq!(frame.to_text(), "Error: No question provided.");

        let frame = OutboundFrame::from_error(&StraumurError::UnknownKind("x".into()));
        assert_eq!(frame.to_text(), "Error: Unknown question type.");

        let frame = OutboundFrame::from_error(&StraumurError::NoExtractor);
        assert!(frame.to_text().starts_with("Error processing message: "));
        assert!(serde_json::from_str::<serde_json::Value>(&frame.to_text()).is_err());
    }
}
