use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use ndarray::Array1;
use straumur_decode::{DeviceKind, ExecutionBackend, SharedOracle};
use straumur::{AnswerService, OutboundFrame, StraumurConfig};
use tokio::sync::mpsc;

pub(crate) const PIECES: &[&str] = &["<eos>", "Four", ".", " and", " more"];

/// Follows a fixed token script, one entry per score call, cycling.
pub(crate) struct MockBackend {
    script: Vec<u32>,
    delay: Duration,
    pub(crate) calls: AtomicUsize,
    pub(crate) released: AtomicBool,
}

impl MockBackend {
    /// "Four." then end of sequence.
    pub(crate) fn answering() -> Self {
        Self::scripted(&[1, 2, 0], Duration::ZERO)
    }

    /// Never finishes on its own.
    pub(crate) fn endless(delay: Duration) -> Self {
        Self::scripted(&[3, 4], delay)
    }

    fn scripted(script: &[u32], delay: Duration) -> Self {
        Self {
            script: script.to_vec(),
            delay,
            calls: AtomicUsize::new(0),
            released: AtomicBool::new(false),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExecutionBackend for MockBackend {
    async fn score(&self, _ids: &[u32], _mask: &[u32]) -> Result<Array1<f32>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let mut scores = Array1::zeros(PIECES.len());
        scores[self.script[call % self.script.len()] as usize] = 100.0;
        Ok(scores)
    }

    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text.split_whitespace().map(|_| 1).collect())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        Ok(ids.iter().map(|&id| PIECES[id as usize]).collect())
    }

    fn eos_token_id(&self) -> u32 {
        0
    }

    fn device(&self) -> DeviceKind {
        DeviceKind::Cuda
    }

    async fn release(&self) -> Result<()> {
        self.released.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub(crate) fn service(backend: Arc<MockBackend>) -> AnswerService<MockBackend> {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut config = StraumurConfig::default();
    config.generation.cycle_window = 0;
    AnswerService::new(SharedOracle::from_arc(backend), &config).unwrap()
}

pub(crate) async fn next_frame(rx: &mut mpsc::Receiver<OutboundFrame>) -> Option<OutboundFrame> {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a frame")
}
