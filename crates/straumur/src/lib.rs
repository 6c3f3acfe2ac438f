//! Streaming question answering.
//!
//! `straumur` frames a user's question as a prompt, decodes an answer through
//! [`straumur_decode`] and exposes the result as a stream of text fragments
//! ending in [`END_MARKER`]. Extractive single-shot answers go through the
//! [`Extractor`] trait instead.

pub mod config;
pub mod config_loader;
pub mod error;
pub mod extractive;
pub mod prompt;
pub mod protocol;
pub mod request;
pub mod service;

pub use config::{BusyPolicy, StraumurConfig};
pub use config_loader::{load_config, load_config_from_path};
pub use error::{StraumurError, StraumurResult};
pub use extractive::Extractor;
pub use prompt::PromptTemplate;
pub use protocol::{InboundMessage, OutboundFrame, END_MARKER};
pub use request::{Question, QuestionKind};
pub use service::{Answer, AnswerService, AnswerStream};

pub use straumur_decode;
