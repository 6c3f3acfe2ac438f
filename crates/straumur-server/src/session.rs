//! Per-connection question handling, independent of the socket type.
//!
//! A session owns one worker task that answers questions strictly one at a
//! time and writes [`OutboundFrame`]s to a channel the transport drains.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use log::{debug, warn};
use straumur_decode::{CancelHandle, CancellationToken, ExecutionBackend};
use straumur::{Answer, AnswerService, BusyPolicy, OutboundFrame};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const BUSY_MESSAGE: &str = "Error: A question is already being answered.";

/// Questions a `Queue` session will hold before the reader waits.
const INBOX_CAPACITY: usize = 16;

pub struct Session {
    inbox: mpsc::Sender<String>,
    out: mpsc::Sender<OutboundFrame>,
    busy: Arc<AtomicBool>,
    policy: BusyPolicy,
    cancel: CancelHandle,
    worker: JoinHandle<()>,
}

impl Session {
    pub fn start<B: ExecutionBackend>(
        service: AnswerService<B>,
        policy: BusyPolicy,
        out: mpsc::Sender<OutboundFrame>,
    ) -> Self {
        let (token, cancel) = CancellationToken::new();
        let (inbox, rx) = mpsc::channel(INBOX_CAPACITY);
        let busy = Arc::new(AtomicBool::new(false));

        let worker = tokio::spawn(run_worker(
            service,
            rx,
            out.clone(),
            token,
            cancel.clone(),
            busy.clone(),
        ));

        Self {
            inbox,
            out,
            busy,
            policy,
            cancel,
            worker,
        }
    }

    /// Hands a raw client message to the worker, or rejects it when the
    /// policy is `Reject` and a question is in progress.
    pub async fn submit(&self, raw: String) {
        let claimed = self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        if !claimed && self.policy == BusyPolicy::Reject {
            debug!("Rejecting question while another is in progress");
            let _ = self.out.send(OutboundFrame::Error(BUSY_MESSAGE.into())).await;
            return;
        }
        if self.inbox.send(raw).await.is_err() {
            warn!("Session worker is gone, dropping message");
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Cancels whatever the session is doing. Registered with the connection
    /// registry so shutdown can reach it.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Cancels the active answer, drops queued questions and waits for the
    /// worker to finish its current step.
    pub async fn close(self) {
        self.cancel.cancel();
        drop(self.inbox);
        if let Err(e) = self.worker.await {
            warn!("Session worker failed: {}", e);
        }
    }
}

async fn run_worker<B: ExecutionBackend>(
    service: AnswerService<B>,
    mut inbox: mpsc::Receiver<String>,
    out: mpsc::Sender<OutboundFrame>,
    token: CancellationToken,
    cancel: CancelHandle,
    busy: Arc<AtomicBool>,
) {
    loop {
        let raw = tokio::select! {
            _ = token.cancelled() => break,
            raw = inbox.recv() => match raw {
                Some(raw) => raw,
                None => break,
            },
        };

        busy.store(true, Ordering::Release);
        let delivered = answer_one(&service, &raw, token.clone(), &out).await;
        busy.store(false, Ordering::Release);

        if !delivered {
            debug!("Client went away mid-answer");
            cancel.cancel();
            break;
        }
    }
}

/// Answers one message. Returns false when the outbound channel is closed.
async fn answer_one<B: ExecutionBackend>(
    service: &AnswerService<B>,
    raw: &str,
    token: CancellationToken,
    out: &mpsc::Sender<OutboundFrame>,
) -> bool {
    match service.handle_message(raw, token).await {
        Ok(Answer::Stream(mut stream)) => {
            while let Some(item) = stream.next().await {
                let frame = match item {
                    Ok(text) => OutboundFrame::Answer(text),
                    Err(e) => {
                        warn!("Answer stream failed: {}", e);
                        return out.send(OutboundFrame::from_error(&e)).await.is_ok();
                    }
                };
                if out.send(frame).await.is_err() {
                    return false;
                }
            }
            true
        }
        Ok(Answer::Single(text)) => out.send(OutboundFrame::Answer(text)).await.is_ok(),
        Err(e) => {
            if !e.is_validation() {
                warn!("Failed to answer message: {}", e);
            }
            out.send(OutboundFrame::from_error(&e)).await.is_ok()
        }
    }
}
