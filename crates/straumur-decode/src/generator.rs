//! The decode loop.
//!
//! Each step runs: score, penalize, temperature, filter, sample, append,
//! evaluate stop conditions, diff, suspend. A decode ends with exactly one
//! [`Fragment::End`] when a stop condition fires. A cancelled decode ends
//! without it.

use std::time::{Duration, Instant};

use async_stream::try_stream;
use futures::{Stream, StreamExt, TryStreamExt};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::backend::{ExecutionBackend, YieldPolicy};
use crate::cancellation::CancellationToken;
use crate::config::GenerationRequest;
use crate::error::{DecodeError, DecodeResult};
use crate::oracle::SharedOracle;
use crate::sampling::{apply_temperature, NucleusFilter, RepetitionPenalizer, Sampler};
use crate::state::GenerationState;
use crate::stopping::{StopReason, StoppingEvaluator};

/// One item of a decode stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    /// Newly decoded text. Never empty.
    Text(String),
    /// The decode finished. Always the last item of a completed stream.
    End(StopReason),
}

/// A finished decode, collected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub stop_reason: StopReason,
}

/// Drives decodes against a shared backend.
///
/// Cloning is cheap; every clone queues on the same oracle lease.
///
/// # Example
/// ```ignore
/// let decode_loop = DecodeLoop::new(SharedOracle::new(backend));
/// let (token, handle) = CancellationToken::new();
/// let stream = decode_loop.stream(request, token);
/// futures::pin_mut!(stream);
/// while let Some(fragment) = stream.next().await {
///     match fragment? {
///         Fragment::Text(t) => print!("{t}"),
///         Fragment::End(reason) => println!("\n[{reason}]"),
///     }
/// }
/// ```
pub struct DecodeLoop<B> {
    oracle: SharedOracle<B>,
    yield_policy: Option<YieldPolicy>,
}

impl<B> Clone for DecodeLoop<B> {
    fn clone(&self) -> Self {
        Self {
            oracle: self.oracle.clone(),
            yield_policy: self.yield_policy,
        }
    }
}

impl<B: ExecutionBackend> DecodeLoop<B> {
    pub fn new(oracle: SharedOracle<B>) -> Self {
        Self {
            oracle,
            yield_policy: None,
        }
    }

    /// Overrides the backend's pause between steps.
    pub fn with_yield_policy(mut self, policy: YieldPolicy) -> Self {
        self.yield_policy = Some(policy);
        self
    }

    pub fn oracle(&self) -> &SharedOracle<B> {
        &self.oracle
    }

    pub fn yield_policy(&self) -> YieldPolicy {
        self.yield_policy
            .unwrap_or_else(|| self.oracle.backend().yield_policy())
    }

    /// Lazily decodes `request`. Nothing runs until the stream is polled and
    /// dropping the stream stops the decode at its next await point.
    pub fn stream(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
    ) -> impl Stream<Item = DecodeResult<Fragment>> + Send + 'static {
        let mut run = DecodeRun::new(self.oracle.clone(), request, cancel, self.yield_policy());

        try_stream! {
            loop {
                match run.advance().await? {
                    Step::Continue(text) => {
                        if let Some(text) = text {
                            yield Fragment::Text(text);
                        }
                        run.suspend().await;
                    }
                    Step::Finished { text, reason } => {
                        if let Some(text) = text {
                            yield Fragment::Text(text);
                        }
                        run.log_summary();
                        yield Fragment::End(reason);
                        break;
                    }
                    Step::Cancelled => {
                        debug!("Decode cancelled after {} steps", run.state.steps());
                        break;
                    }
                }
            }
        }
    }

    /// Runs the decode on its own task and forwards fragments over a channel.
    ///
    /// Dropping the returned stream stops the task at the next step boundary.
    pub fn spawn(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
    ) -> ReceiverStream<DecodeResult<Fragment>> {
        let (tx, rx) = mpsc::channel::<DecodeResult<Fragment>>(32);
        let stream = self.stream(request, cancel);

        tokio::spawn(async move {
            futures::pin_mut!(stream);
            loop {
                if tx.is_closed() {
                    debug!("Fragment receiver dropped, stopping decode");
                    break;
                }
                let Some(item) = stream.next().await else {
                    break;
                };
                if tx.send(item).await.is_err() {
                    break;
                }
            }
        });

        ReceiverStream::new(rx)
    }

    /// Decodes to completion and returns the concatenated text.
    pub async fn complete(&self, request: GenerationRequest) -> DecodeResult<Completion> {
        let fragments: Vec<Fragment> = self
            .stream(request, CancellationToken::never())
            .try_collect()
            .await?;

        let mut text = String::new();
        let mut stop_reason = None;
        for fragment in fragments {
            match fragment {
                Fragment::Text(t) => text.push_str(&t),
                Fragment::End(reason) => stop_reason = Some(reason),
            }
        }
        let stop_reason =
            stop_reason.ok_or_else(|| DecodeError::invariant("decode ended without a stop reason"))?;
        Ok(Completion { text, stop_reason })
    }
}

impl<B> std::fmt::Debug for DecodeLoop<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodeLoop")
            .field("yield_policy", &self.yield_policy)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Per-request run
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LoopPhase {
    Initialized,
    Running,
    Completed(StopReason),
    Aborted,
}

#[derive(Debug)]
pub(crate) enum Step {
    Continue(Option<String>),
    Finished {
        text: Option<String>,
        reason: StopReason,
    },
    Cancelled,
}

fn non_empty(text: String) -> Option<String> {
    (!text.is_empty()).then_some(text)
}

pub(crate) struct DecodeRun<B> {
    oracle: SharedOracle<B>,
    request: GenerationRequest,
    cancel: CancellationToken,
    yield_policy: YieldPolicy,

    penalizer: RepetitionPenalizer,
    filter: NucleusFilter,
    sampler: Sampler,
    evaluator: StoppingEvaluator,

    input_ids: Vec<u32>,
    attention_mask: Vec<u32>,
    pub(crate) state: GenerationState,
    pub(crate) phase: LoopPhase,

    started: Option<Instant>,
    backend_time: Duration,
    sampling_time: Duration,
}

impl<B: ExecutionBackend> DecodeRun<B> {
    pub(crate) fn new(
        oracle: SharedOracle<B>,
        request: GenerationRequest,
        cancel: CancellationToken,
        yield_policy: YieldPolicy,
    ) -> Self {
        let penalizer = RepetitionPenalizer::from_config(request.sampling());
        let filter = NucleusFilter::from_config(request.sampling());
        let sampler = match request.seed() {
            Some(seed) => Sampler::seeded(seed),
            None => Sampler::from_entropy(),
        };
        let evaluator = StoppingEvaluator::new(
            request.stopping(),
            oracle.backend().eos_token_id(),
            request.max_steps(),
        );

        Self {
            penalizer,
            filter,
            sampler,
            evaluator,
            oracle,
            request,
            cancel,
            yield_policy,
            input_ids: Vec::new(),
            attention_mask: Vec::new(),
            state: GenerationState::new(),
            phase: LoopPhase::Initialized,
            started: None,
            backend_time: Duration::ZERO,
            sampling_time: Duration::ZERO,
        }
    }

    /// Runs one step. Any error moves the run to `Aborted`.
    pub(crate) async fn advance(&mut self) -> DecodeResult<Step> {
        match self.step().await {
            Ok(step) => Ok(step),
            Err(e) => {
                warn!("Decode aborted after {} steps: {}", self.state.steps(), e);
                self.phase = LoopPhase::Aborted;
                Err(e)
            }
        }
    }

    async fn step(&mut self) -> DecodeResult<Step> {
        match self.phase {
            LoopPhase::Completed(_) | LoopPhase::Aborted => {
                return Err(DecodeError::invariant("decode stepped after termination"));
            }
            LoopPhase::Initialized => self.start()?,
            LoopPhase::Running => {}
        }

        if self.cancel.is_cancelled() {
            self.phase = LoopPhase::Aborted;
            return Ok(Step::Cancelled);
        }

        // Score under the lease, then give it up before doing anything else.
        let t_backend = Instant::now();
        let scores = {
            let Some(lease) = self.oracle.acquire(&self.cancel).await else {
                self.phase = LoopPhase::Aborted;
                return Ok(Step::Cancelled);
            };
            lease
                .score(&self.input_ids, &self.attention_mask)
                .await
                .map_err(DecodeError::Oracle)?
        };
        self.backend_time += t_backend.elapsed();

        if scores.is_empty() {
            return Err(DecodeError::invariant("backend returned an empty score vector"));
        }

        let t_sampling = Instant::now();
        let sampling = self.request.sampling();
        let scores = self.penalizer.apply(scores, self.state.token_history());
        let scores = apply_temperature(scores, sampling.temperature());
        let scores = self.filter.apply(scores)?;
        let token_id = self.sampler.sample(&scores)?;
        self.sampling_time += t_sampling.elapsed();

        self.state.push_token(token_id);
        self.input_ids.push(token_id);
        self.attention_mask.push(1);

        if token_id != self.evaluator.eos_token_id() {
            let text = self
                .oracle
                .backend()
                .decode(self.state.token_history())
                .map_err(DecodeError::Oracle)?;
            self.state.set_text(text);
        }

        let reason = self
            .evaluator
            .evaluate(self.state.token_history(), self.state.cumulative_text());
        debug!("Step {}: token {} ({})", self.state.steps(), token_id, reason);

        match reason {
            StopReason::Continue => Ok(Step::Continue(non_empty(self.state.take_diff()?))),
            reason => {
                let text = if reason.emits_pending_text() {
                    non_empty(self.state.take_rest()?)
                } else {
                    None
                };
                self.phase = LoopPhase::Completed(reason.clone());
                Ok(Step::Finished { text, reason })
            }
        }
    }

    fn start(&mut self) -> DecodeResult<()> {
        let prompt_ids = self
            .oracle
            .backend()
            .encode(self.request.prompt())
            .map_err(DecodeError::Oracle)?;
        if prompt_ids.is_empty() {
            return Err(DecodeError::invalid("prompt encoded to zero tokens"));
        }

        debug!(
            "Starting decode: {} prompt tokens, max {} steps",
            prompt_ids.len(),
            self.request.max_steps()
        );
        self.attention_mask = vec![1; prompt_ids.len()];
        self.input_ids = prompt_ids;
        self.phase = LoopPhase::Running;
        self.started = Some(Instant::now());
        Ok(())
    }

    pub(crate) async fn suspend(&self) {
        self.yield_policy.suspend().await;
    }

    fn log_summary(&self) {
        let steps = self.state.steps();
        let Some(started) = self.started else {
            return;
        };
        let total = started.elapsed();
        let reason = match &self.phase {
            LoopPhase::Completed(reason) => reason.to_string(),
            other => format!("{other:?}"),
        };

        if steps > 0 && total.as_secs_f64() > 0.0 {
            info!("-------------------- Decode Performance --------------------");
            info!("Stop reason:  {}", reason);
            info!("Total Tokens: {}", steps);
            info!("Total Time:   {:.3}s", total.as_secs_f64());
            info!("Overall T/s:  {:.2}", steps as f64 / total.as_secs_f64());
            info!("  - Backend:  {:?} per token", self.backend_time / steps as u32);
            info!("  - Sampling: {:?} per token", self.sampling_time / steps as u32);
            info!("------------------------------------------------------------");
        } else {
            info!("Decode complete ({}) after {} tokens", reason, steps);
        }
    }
}
