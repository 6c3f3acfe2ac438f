//! Single-shot extractive answering.

use async_trait::async_trait;

/// Answers a question in one piece, for example by span extraction over a
/// fixed context. Used for `masked` questions.
#[async_trait]
pub trait Extractor: Send + Sync + 'static {
    async fn extract(&self, question: &str) -> anyhow::Result<String>;
}
