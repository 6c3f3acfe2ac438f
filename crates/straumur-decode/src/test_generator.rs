use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use ndarray::Array1;

use crate::codec::tests::WORD_TOKENIZER;
use crate::generator::{DecodeRun, LoopPhase, Step};
use crate::prelude::*;
use crate::{HfCodec, LogitsScorer, TokenizedBackend};

const EOS: u32 = 0;
const PROMPT: u32 = 1;

/// Token id -> text piece. Decoding concatenates pieces, EOS included.
const PIECES: &[&str] = &["</s>", "?", "Hel", "lo", " world", "!", "==", "END==", "é"];

/// Puts nearly all probability mass on a scripted token at each call.
struct ScriptedBackend {
    script: Vec<u32>,
    calls: AtomicUsize,
    inflight: AtomicUsize,
    max_inflight: AtomicUsize,
    delay: Option<Duration>,
    pause: Option<Duration>,
    fail_on_call: Option<usize>,
    last_input: Mutex<(Vec<u32>, Vec<u32>)>,
}

impl ScriptedBackend {
    fn new(script: &[u32]) -> Self {
        Self {
            script: script.to_vec(),
            calls: AtomicUsize::new(0),
            inflight: AtomicUsize::new(0),
            max_inflight: AtomicUsize::new(0),
            delay: None,
            pause: None,
            fail_on_call: None,
            last_input: Mutex::new((Vec::new(), Vec::new())),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn pausing(mut self, pause: Duration) -> Self {
        self.pause = Some(pause);
        self
    }

    fn failing_on(mut self, call: usize) -> Self {
        self.fail_on_call = Some(call);
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExecutionBackend for ScriptedBackend {
    async fn score(&self, token_ids: &[u32], attention_mask: &[u32]) -> Result<Array1<f32>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_on_call == Some(call) {
            return Err(anyhow!("device lost"));
        }

        let now = self.inflight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_inflight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.inflight.fetch_sub(1, Ordering::SeqCst);

        *self.last_input.lock().unwrap() = (token_ids.to_vec(), attention_mask.to_vec());

        let target = self.script[call % self.script.len()] as usize;
        let mut scores = Array1::zeros(PIECES.len());
        scores[target] = 100.0;
        Ok(scores)
    }

    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text.split_whitespace().map(|_| PROMPT).collect())
    }

    fn decode(&self, token_ids: &[u32]) -> Result<String> {
        Ok(token_ids.iter().map(|&id| PIECES[id as usize]).collect())
    }

    fn eos_token_id(&self) -> u32 {
        EOS
    }

    fn device(&self) -> DeviceKind {
        DeviceKind::Cuda
    }

    fn yield_policy(&self) -> YieldPolicy {
        match self.pause {
            Some(pause) => YieldPolicy::new(pause),
            None => self.device().default_yield_policy(),
        }
    }
}

fn request(stops: &[&str], cycle_window: usize, max_steps: usize) -> GenerationRequest {
    let sampling = SamplingConfig::new(0.7, 50, 0.9, 1.5, cycle_window.max(1)).unwrap();
    let stopping = StoppingConfig::new(stops.iter().copied()).with_cycle_window(cycle_window);
    GenerationRequest::new("Q: what is this? A:", sampling, stopping, max_steps)
        .unwrap()
        .with_seed(11)
}

async fn run(backend: Arc<ScriptedBackend>, req: GenerationRequest) -> Vec<Fragment> {
    let _ = env_logger::builder().is_test(true).try_init();
    DecodeLoop::new(SharedOracle::from_arc(backend))
        .stream(req, CancellationToken::never())
        .try_collect()
        .await
        .unwrap()
}

fn text_of(fragments: &[Fragment]) -> String {
    fragments
        .iter()
        .filter_map(|f| match f {
            Fragment::Text(t) => Some(t.as_str()),
            Fragment::End(_) => None,
        })
        .collect()
}

// ============== End-to-end scenarios ==============

#[tokio::test]
async fn test_eos_first_emits_only_end() {
    let backend = Arc::new(ScriptedBackend::new(&[EOS]));
    let fragments = run(backend.clone(), request(&[], 10, 100)).await;

    assert_eq!(fragments, vec![Fragment::End(StopReason::EndOfSequence)]);
    assert_eq!(backend.calls(), 1);
}

#[tokio::test]
async fn test_max_steps_emits_all_text_then_end() {
    let backend = Arc::new(ScriptedBackend::new(&[2, 3, 4, 5, 6]));
    let fragments = run(backend.clone(), request(&[], 10, 5)).await;

    assert_eq!(
        fragments.last(),
        Some(&Fragment::End(StopReason::MaxStepsReached))
    );
    assert_eq!(text_of(&fragments), "Hello world!==");
    assert_eq!(fragments.len(), 6);
    assert_eq!(backend.calls(), 5);
}

#[tokio::test]
async fn test_two_token_cycle_stops_after_four_tokens() {
    let backend = Arc::new(ScriptedBackend::new(&[2, 3]));
    let fragments = run(backend.clone(), request(&[], 2, 100)).await;

    assert_eq!(
        fragments.last(),
        Some(&Fragment::End(StopReason::RepetitionCycleDetected))
    );
    assert_eq!(backend.calls(), 4);
    // The terminal step's text is not forwarded.
    assert_eq!(text_of(&fragments), "HelloHel");
}

#[tokio::test]
async fn test_stop_string_spanning_tokens() {
    let backend = Arc::new(ScriptedBackend::new(&[2, 3, 6, 7, 4]));
    let fragments = run(backend.clone(), request(&["==END=="], 10, 100)).await;

    assert_eq!(
        fragments.last(),
        Some(&Fragment::End(StopReason::StopStringMatched("==END==".into())))
    );
    assert_eq!(text_of(&fragments), "Hello==");
    assert_eq!(backend.calls(), 4);
}

#[tokio::test]
async fn test_eos_wins_over_stop_string_in_same_step() {
    // "</s>" would match the stop string if the EOS step were decoded.
    let backend = Arc::new(ScriptedBackend::new(&[2, EOS]));
    let fragments = run(backend.clone(), request(&["</s>"], 10, 100)).await;

    assert_eq!(
        fragments,
        vec![
            Fragment::Text("Hel".into()),
            Fragment::End(StopReason::EndOfSequence)
        ]
    );
}

#[tokio::test]
async fn test_score_sees_prompt_and_growing_mask() {
    let backend = Arc::new(ScriptedBackend::new(&[2, 3, 4]));
    run(backend.clone(), request(&[], 10, 3)).await;

    let (ids, mask) = backend.last_input.lock().unwrap().clone();
    // Five prompt words, then the two tokens generated before the last call.
    assert_eq!(ids, vec![PROMPT, PROMPT, PROMPT, PROMPT, PROMPT, 2, 3]);
    assert_eq!(mask, vec![1; 7]);
}

#[tokio::test]
async fn test_seeded_runs_are_identical() {
    struct Flat;

    #[async_trait]
    impl ExecutionBackend for Flat {
        async fn score(&self, _ids: &[u32], _mask: &[u32]) -> Result<Array1<f32>> {
            Ok(Array1::zeros(PIECES.len()))
        }
        fn encode(&self, _text: &str) -> Result<Vec<u32>> {
            Ok(vec![PROMPT])
        }
        fn decode(&self, ids: &[u32]) -> Result<String> {
            Ok(ids.iter().map(|&id| PIECES[id as usize]).collect())
        }
        fn eos_token_id(&self) -> u32 {
            EOS
        }
        fn device(&self) -> DeviceKind {
            DeviceKind::Cuda
        }
    }

    let decode_loop = DecodeLoop::new(SharedOracle::new(Flat));
    let a = decode_loop.complete(request(&[], 0, 8)).await.unwrap();
    let b = decode_loop.complete(request(&[], 0, 8)).await.unwrap();
    assert_eq!(a, b);
}

// ============== Cancellation and errors ==============

#[tokio::test]
async fn test_cancel_stops_without_end_marker() {
    let backend = Arc::new(ScriptedBackend::new(&[2, 3, 4, 5]));
    let decode_loop = DecodeLoop::new(SharedOracle::from_arc(backend.clone()));
    let (token, handle) = CancellationToken::new();

    let stream = decode_loop.stream(request(&[], 10, 100), token);
    futures::pin_mut!(stream);

    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first, Fragment::Text("Hel".into()));

    handle.cancel();
    assert!(stream.next().await.is_none());
    assert_eq!(backend.calls(), 1);
}

#[tokio::test]
async fn test_already_cancelled_never_scores() {
    let backend = Arc::new(ScriptedBackend::new(&[2]));
    let decode_loop = DecodeLoop::new(SharedOracle::from_arc(backend.clone()));

    let fragments: Vec<Fragment> = decode_loop
        .stream(request(&[], 10, 100), CancellationToken::already_cancelled())
        .try_collect()
        .await
        .unwrap();
    assert!(fragments.is_empty());
    assert_eq!(backend.calls(), 0);
}

#[tokio::test]
async fn test_oracle_failure_aborts() {
    let backend = Arc::new(ScriptedBackend::new(&[2, 3, 4]).failing_on(1));
    let decode_loop = DecodeLoop::new(SharedOracle::from_arc(backend.clone()));

    let items: Vec<DecodeResult<Fragment>> = decode_loop
        .stream(request(&[], 10, 100), CancellationToken::never())
        .collect()
        .await;

    assert_eq!(items.len(), 2);
    assert!(matches!(items[0], Ok(Fragment::Text(_))));
    match &items[1] {
        Err(DecodeError::Oracle(e)) => assert!(e.to_string().contains("device lost")),
        other => panic!("expected oracle error, got {other:?}"),
    }
    assert!(!decode_loop.oracle().is_busy());
}

#[tokio::test]
async fn test_run_phases() {
    let oracle = SharedOracle::new(ScriptedBackend::new(&[2, EOS]));
    let mut run = DecodeRun::new(
        oracle,
        request(&[], 10, 100),
        CancellationToken::never(),
        YieldPolicy::immediate(),
    );
    assert_eq!(run.phase, LoopPhase::Initialized);

    assert!(matches!(run.advance().await.unwrap(), Step::Continue(Some(_))));
    assert_eq!(run.phase, LoopPhase::Running);

    assert!(matches!(run.advance().await.unwrap(), Step::Finished { text: None, .. }));
    assert_eq!(run.phase, LoopPhase::Completed(StopReason::EndOfSequence));

    assert!(matches!(run.advance().await, Err(DecodeError::Invariant(_))));
    assert_eq!(run.phase, LoopPhase::Aborted);
}

// ============== Step suspension ==============

#[tokio::test]
async fn test_backend_pause_runs_between_steps() {
    let backend = Arc::new(ScriptedBackend::new(&[2, 3, 4, 5]).pausing(Duration::from_millis(20)));
    let decode_loop = DecodeLoop::new(SharedOracle::from_arc(backend.clone()));
    assert_eq!(decode_loop.yield_policy().pause(), Duration::from_millis(20));

    let started = std::time::Instant::now();
    let fragments: Vec<Fragment> = decode_loop
        .stream(request(&[], 0, 4), CancellationToken::never())
        .try_collect()
        .await
        .unwrap();

    // Three continuing steps pause, the final one does not.
    assert_eq!(text_of(&fragments), "Hello world!");
    assert!(started.elapsed() >= Duration::from_millis(60), "{:?}", started.elapsed());
}

#[tokio::test]
async fn test_loop_yield_policy_overrides_backend() {
    let backend = Arc::new(ScriptedBackend::new(&[2, 3, 4, 5]));
    assert_eq!(backend.yield_policy(), YieldPolicy::immediate());

    let decode_loop = DecodeLoop::new(SharedOracle::from_arc(backend))
        .with_yield_policy(YieldPolicy::new(Duration::from_millis(25)));
    assert_eq!(decode_loop.yield_policy().pause(), Duration::from_millis(25));

    let started = std::time::Instant::now();
    let completion = decode_loop.complete(request(&[], 0, 3)).await.unwrap();
    assert_eq!(completion.text, "Hello world");
    assert!(started.elapsed() >= Duration::from_millis(50), "{:?}", started.elapsed());
}

// ============== Channel-based stream ==============

#[tokio::test]
async fn test_spawn_matches_stream() {
    let backend = Arc::new(ScriptedBackend::new(&[2, 3, 4, 5]));
    let decode_loop = DecodeLoop::new(SharedOracle::from_arc(backend.clone()));

    let fragments: Vec<Fragment> = decode_loop
        .spawn(request(&[], 10, 4), CancellationToken::never())
        .try_collect()
        .await
        .unwrap();
    assert_eq!(text_of(&fragments), "Hello world!");
    assert_eq!(
        fragments.last(),
        Some(&Fragment::End(StopReason::MaxStepsReached))
    );
}

#[tokio::test]
async fn test_dropping_receiver_stops_task() {
    let backend = Arc::new(
        ScriptedBackend::new(&[2, 3, 4, 5, 6, 7]).with_delay(Duration::from_millis(5)),
    );
    let decode_loop = DecodeLoop::new(SharedOracle::from_arc(backend.clone()));

    let mut rx = decode_loop.spawn(request(&[], 0, 1000), CancellationToken::never());
    rx.next().await.unwrap().unwrap();
    drop(rx);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let settled = backend.calls();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(backend.calls(), settled);
    assert!(settled < 1000);
}

// ============== Oracle exclusion ==============

#[tokio::test]
async fn test_concurrent_decodes_never_overlap_scoring() {
    let backend = Arc::new(
        ScriptedBackend::new(&[2, 3, 4, 5]).with_delay(Duration::from_millis(2)),
    );
    let decode_loop = DecodeLoop::new(SharedOracle::from_arc(backend.clone()));

    let a = decode_loop.complete(request(&[], 0, 6));
    let b = decode_loop.complete(request(&[], 0, 6));
    let (a, b) = tokio::join!(a, b);
    a.unwrap();
    b.unwrap();

    assert_eq!(backend.calls(), 12);
    assert_eq!(backend.max_inflight.load(Ordering::SeqCst), 1);
}

// ============== Tokenizer-backed backend ==============

struct FavorWorld;

#[async_trait]
impl LogitsScorer for FavorWorld {
    async fn score(&self, token_ids: &[u32], _mask: &[u32]) -> Result<Array1<f32>> {
        let mut scores = Array1::zeros(5);
        // hello -> world -> [EOS]
        let next = match token_ids.last() {
            Some(2) => 3,
            Some(3) => 1,
            _ => 2,
        };
        scores[next] = 50.0;
        Ok(scores)
    }
}

#[tokio::test]
async fn test_tokenized_backend_end_to_end() {
    let codec = HfCodec::from_bytes(WORD_TOKENIZER, "[EOS]").unwrap();
    let backend = TokenizedBackend::new(FavorWorld, codec, DeviceKind::Cpu)
        .with_yield_policy(YieldPolicy::immediate());
    let decode_loop = DecodeLoop::new(SharedOracle::new(backend));

    let req = GenerationRequest::new(
        "again",
        SamplingConfig::default(),
        StoppingConfig::default(),
        10,
    )
    .unwrap()
    .with_seed(3);
    let completion = decode_loop.complete(req).await.unwrap();

    assert_eq!(completion.stop_reason, StopReason::EndOfSequence);
    assert_eq!(completion.text, "hello world");
}
