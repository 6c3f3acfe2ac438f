//! Execution backend capability.
//!
//! A backend is chosen once when the service starts and is then the only
//! thing a decode talks to: it scores token sequences, converts between text
//! and ids, and says how long a decode should pause between steps.

use std::fmt;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use ndarray::Array1;
use serde::{Deserialize, Serialize};

// ============================================================================
// Device kind and yield policy
// ============================================================================

/// Hardware a backend runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    #[default]
    Cpu,
    Metal,
    Cuda,
}

impl DeviceKind {
    /// Pause between steps when the backend does not override it.
    ///
    /// CPU decodes pause longest so they do not starve other connections.
    pub fn default_yield_policy(self) -> YieldPolicy {
        match self {
            DeviceKind::Cpu => YieldPolicy::new(Duration::from_millis(5)),
            DeviceKind::Metal => YieldPolicy::new(Duration::from_millis(1)),
            DeviceKind::Cuda => YieldPolicy::immediate(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceKind::Cpu => "cpu",
            DeviceKind::Metal => "metal",
            DeviceKind::Cuda => "cuda",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a decode suspends at the end of each step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct YieldPolicy {
    pause: Duration,
}

impl YieldPolicy {
    pub fn new(pause: Duration) -> Self {
        Self { pause }
    }

    /// Hands control back to the scheduler without sleeping.
    pub fn immediate() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn pause(&self) -> Duration {
        self.pause
    }

    pub async fn suspend(&self) {
        if self.pause.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.pause).await;
        }
    }
}

// ============================================================================
// Backend trait
// ============================================================================

/// The scoring oracle plus its tokenizer.
#[async_trait]
pub trait ExecutionBackend: Send + Sync + 'static {
    /// Scores for the position after `token_ids`, one per vocabulary entry.
    async fn score(&self, token_ids: &[u32], attention_mask: &[u32]) -> Result<Array1<f32>>;

    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Must return the same text for the same ids. Special tokens are skipped.
    fn decode(&self, token_ids: &[u32]) -> Result<String>;

    fn eos_token_id(&self) -> u32;

    fn device(&self) -> DeviceKind;

    fn yield_policy(&self) -> YieldPolicy {
        self.device().default_yield_policy()
    }

    /// Backends that can score several sequences at once skip the oracle lock.
    fn supports_concurrent_scoring(&self) -> bool {
        false
    }

    /// Frees model resources. Called once by the owning service on shutdown.
    async fn release(&self) -> Result<()> {
        Ok(())
    }
}
