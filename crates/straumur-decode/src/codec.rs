//! Adapter from a raw logits scorer plus a HuggingFace tokenizer to an
//! [`ExecutionBackend`].

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use ndarray::Array1;
use tokenizers::Tokenizer;

use crate::backend::{DeviceKind, ExecutionBackend, YieldPolicy};

/// A model that only knows token ids.
#[async_trait]
pub trait LogitsScorer: Send + Sync + 'static {
    async fn score(&self, token_ids: &[u32], attention_mask: &[u32]) -> Result<Array1<f32>>;

    async fn release(&self) -> Result<()> {
        Ok(())
    }
}

/// Text/id conversion backed by a `tokenizers` tokenizer.
pub struct HfCodec {
    tokenizer: Tokenizer,
    eos_token_id: u32,
}

impl HfCodec {
    pub fn new(tokenizer: Tokenizer, eos_token_id: u32) -> Self {
        Self {
            tokenizer,
            eos_token_id,
        }
    }

    /// Loads `tokenizer.json` and looks up the id of `eos_token`.
    pub fn from_file(path: impl AsRef<Path>, eos_token: &str) -> Result<Self> {
        let path = path.as_ref();
        let tokenizer = Tokenizer::from_file(path)
            .map_err(|e| anyhow!(e))
            .with_context(|| format!("failed to load tokenizer from {}", path.display()))?;
        Self::with_eos_token(tokenizer, eos_token)
    }

    pub fn from_bytes(bytes: impl AsRef<[u8]>, eos_token: &str) -> Result<Self> {
        let tokenizer = Tokenizer::from_bytes(bytes).map_err(|e| anyhow!(e))?;
        Self::with_eos_token(tokenizer, eos_token)
    }

    fn with_eos_token(tokenizer: Tokenizer, eos_token: &str) -> Result<Self> {
        let eos_token_id = tokenizer
            .token_to_id(eos_token)
            .ok_or_else(|| anyhow!("tokenizer has no token {eos_token:?}"))?;
        Ok(Self::new(tokenizer, eos_token_id))
    }

    pub fn eos_token_id(&self) -> u32 {
        self.eos_token_id
    }

    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self.tokenizer.encode(text, false).map_err(|e| anyhow!(e))?;
        Ok(encoding.get_ids().to_vec())
    }

    pub fn decode(&self, token_ids: &[u32]) -> Result<String> {
        self.tokenizer.decode(token_ids, true).map_err(|e| anyhow!(e))
    }
}

impl std::fmt::Debug for HfCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HfCodec")
            .field("vocab_size", &self.tokenizer.get_vocab_size(true))
            .field("eos_token_id", &self.eos_token_id)
            .finish()
    }
}

/// A [`LogitsScorer`] and an [`HfCodec`] running on one device.
pub struct TokenizedBackend<S> {
    scorer: S,
    codec: HfCodec,
    device: DeviceKind,
    yield_policy: Option<YieldPolicy>,
}

impl<S: LogitsScorer> TokenizedBackend<S> {
    pub fn new(scorer: S, codec: HfCodec, device: DeviceKind) -> Self {
        Self {
            scorer,
            codec,
            device,
            yield_policy: None,
        }
    }

    /// Replaces the device's default pause between steps.
    pub fn with_yield_policy(mut self, policy: YieldPolicy) -> Self {
        self.yield_policy = Some(policy);
        self
    }

    pub fn codec(&self) -> &HfCodec {
        &self.codec
    }
}

#[async_trait]
impl<S: LogitsScorer> ExecutionBackend for TokenizedBackend<S> {
    async fn score(&self, token_ids: &[u32], attention_mask: &[u32]) -> Result<Array1<f32>> {
        self.scorer.score(token_ids, attention_mask).await
    }

    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        self.codec.encode(text)
    }

    fn decode(&self, token_ids: &[u32]) -> Result<String> {
        self.codec.decode(token_ids)
    }

    fn eos_token_id(&self) -> u32 {
        self.codec.eos_token_id()
    }

    fn device(&self) -> DeviceKind {
        self.device
    }

    fn yield_policy(&self) -> YieldPolicy {
        self.yield_policy
            .unwrap_or_else(|| self.device.default_yield_policy())
    }

    async fn release(&self) -> Result<()> {
        self.scorer.release().await
    }
}
