//! Live connection registry.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;
use straumur_decode::CancelHandle;
use tokio::sync::{oneshot, Mutex};

pub type ConnectionId = u64;

struct Entry {
    cancel: CancelHandle,
    close: oneshot::Sender<()>,
}

#[derive(Default)]
struct Entries {
    live: BTreeMap<ConnectionId, Entry>,
    closed: bool,
}

/// Tracks open connections so shutdown can close each of them.
///
/// Ids increase monotonically and enumeration is in id order, so shutdown
/// closes connections oldest first. Once closed, the registry turns away
/// late arrivals by closing them on registration.
#[derive(Default)]
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    entries: Mutex<Entries>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a connection. The receiver fires when the registry closes it.
    pub async fn register(&self, cancel: CancelHandle) -> (ConnectionId, oneshot::Receiver<()>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (close, closed) = oneshot::channel();
        let mut entries = self.entries.lock().await;
        if entries.closed {
            debug!("Connection {} arrived after shutdown, closing it", id);
            cancel.cancel();
            let _ = close.send(());
        } else {
            entries.live.insert(id, Entry { cancel, close });
        }
        (id, closed)
    }

    /// Forgets a connection that ended on its own. Returns false if it was
    /// already removed.
    pub async fn remove(&self, id: ConnectionId) -> bool {
        self.entries.lock().await.live.remove(&id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.live.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.live.is_empty()
    }

    pub async fn ids(&self) -> Vec<ConnectionId> {
        self.entries.lock().await.live.keys().copied().collect()
    }

    /// Whether [`close_all`](Self::close_all) has run.
    pub async fn is_closed(&self) -> bool {
        self.entries.lock().await.closed
    }

    /// Cancels and signals every live connection, in id order, and refuses
    /// later registrations. Returns the ids that were closed.
    pub async fn close_all(&self) -> Vec<ConnectionId> {
        let entries = {
            let mut entries = self.entries.lock().await;
            entries.closed = true;
            std::mem::take(&mut entries.live)
        };
        let mut closed = Vec::with_capacity(entries.len());
        for (id, entry) in entries {
            debug!("Closing connection {}", id);
            entry.cancel.cancel();
            // The connection may already be on its way out.
            let _ = entry.close.send(());
            closed.push(id);
        }
        closed
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
