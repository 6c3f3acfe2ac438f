//! Question answering on top of the decode loop.

use std::pin::Pin;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use log::{debug, info};
use straumur_decode::{
    CancellationToken, DecodeLoop, ExecutionBackend, Fragment, GenerationRequest, SamplingConfig,
    SharedOracle, StoppingConfig,
};

use crate::config::StraumurConfig;
use crate::error::{StraumurError, StraumurResult};
use crate::extractive::Extractor;
use crate::prompt::PromptTemplate;
use crate::protocol::{InboundMessage, END_MARKER};
use crate::request::{Question, QuestionKind};

/// Streamed answer text. The last item is always [`END_MARKER`] unless the
/// stream fails or is cancelled.
pub type AnswerStream = Pin<Box<dyn Stream<Item = StraumurResult<String>> + Send>>;

/// The result of answering one question.
pub enum Answer {
    Stream(AnswerStream),
    Single(String),
}

impl std::fmt::Debug for Answer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Answer::Stream(_) => f.write_str("Answer::Stream(..)"),
            Answer::Single(s) => f.debug_tuple("Answer::Single").field(s).finish(),
        }
    }
}

/// Answers questions against one shared backend.
///
/// The service owns the backend's lifecycle: requests borrow it through the
/// decode loop, and [`AnswerService::shutdown`] releases it.
pub struct AnswerService<B> {
    decode_loop: DecodeLoop<B>,
    extractor: Option<Arc<dyn Extractor>>,
    sampling: SamplingConfig,
    template: PromptTemplate,
    max_steps: usize,
    cycle_window: usize,
}

impl<B> Clone for AnswerService<B> {
    fn clone(&self) -> Self {
        Self {
            decode_loop: self.decode_loop.clone(),
            extractor: self.extractor.clone(),
            sampling: self.sampling.clone(),
            template: self.template,
            max_steps: self.max_steps,
            cycle_window: self.cycle_window,
        }
    }
}

impl<B: ExecutionBackend> AnswerService<B> {
    pub fn new(oracle: SharedOracle<B>, config: &StraumurConfig) -> StraumurResult<Self> {
        config.validate()?;

        let mut decode_loop = DecodeLoop::new(oracle);
        if let Some(policy) = config.backend.yield_policy() {
            decode_loop = decode_loop.with_yield_policy(policy);
        }
        info!(
            "Answer service ready: {} backend, yield {:?}, template {:?}",
            decode_loop.oracle().backend().device(),
            decode_loop.yield_policy().pause(),
            config.generation.template
        );

        Ok(Self {
            decode_loop,
            extractor: None,
            sampling: config.answer_sampling()?,
            template: config.generation.template,
            max_steps: config.generation.max_steps,
            cycle_window: config.generation.cycle_window,
        })
    }

    /// Installs the answerer used for `masked` questions.
    pub fn with_extractor(mut self, extractor: impl Extractor) -> Self {
        self.extractor = Some(Arc::new(extractor));
        self
    }

    pub fn decode_loop(&self) -> &DecodeLoop<B> {
        &self.decode_loop
    }

    /// Builds the decode request for a question. Nothing touches the backend.
    pub fn build_request(&self, question: &str) -> StraumurResult<GenerationRequest> {
        let question = question.trim();
        if question.is_empty() {
            return Err(StraumurError::EmptyQuestion);
        }
        let stopping = StoppingConfig::new(self.template.stop_strings().iter().copied())
            .with_cycle_window(self.cycle_window);
        let request = GenerationRequest::new(
            self.template.render(question),
            self.sampling.clone(),
            stopping,
            self.max_steps,
        )?;
        Ok(request)
    }

    /// Streams the model's answer, ending with [`END_MARKER`].
    ///
    /// Validation happens here, before the stream exists, so a rejected
    /// question never reaches the backend.
    pub fn stream_answer(
        &self,
        question: &str,
        cancel: CancellationToken,
    ) -> StraumurResult<AnswerStream> {
        let request = self.build_request(question)?;
        debug!("Streaming answer for {:?}", question.trim());

        let stream = self.decode_loop.stream(request, cancel).map(|item| {
            item.map(|fragment| match fragment {
                Fragment::Text(text) => text,
                Fragment::End(reason) => {
                    debug!("Answer finished: {}", reason);
                    END_MARKER.to_string()
                }
            })
            .map_err(StraumurError::from)
        });
        Ok(Box::pin(stream))
    }

    pub async fn extract_answer(&self, question: &str) -> StraumurResult<String> {
        let question = question.trim();
        if question.is_empty() {
            return Err(StraumurError::EmptyQuestion);
        }
        let extractor = self.extractor.as_ref().ok_or(StraumurError::NoExtractor)?;
        extractor
            .extract(question)
            .await
            .map_err(StraumurError::Extraction)
    }

    pub async fn answer(
        &self,
        question: &Question,
        cancel: CancellationToken,
    ) -> StraumurResult<Answer> {
        match question.kind() {
            QuestionKind::Auto => Ok(Answer::Stream(self.stream_answer(question.text(), cancel)?)),
            QuestionKind::Masked => Ok(Answer::Single(self.extract_answer(question.text()).await?)),
        }
    }

    /// Parses and answers one raw client message.
    pub async fn handle_message(
        &self,
        raw: &str,
        cancel: CancellationToken,
    ) -> StraumurResult<Answer> {
        let message = InboundMessage::parse(raw)?;
        let question = Question::from_message(&message)?;
        self.answer(&question, cancel).await
    }

    /// Releases the backend. Waits for any in-flight step to finish first.
    pub async fn shutdown(&self) -> StraumurResult<()> {
        self.decode_loop.oracle().release().await?;
        Ok(())
    }
}
