//! Watch events with sequence numbers usable as resume tokens.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use porch_core::{PorchError, PorchResult};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug)]
pub struct WatchEvent<T> {
    /// Monotonic per store; pass back as `since` to resume.
    pub seq: u64,
    pub kind: EventKind,
    pub object: Arc<T>,
}

// manual impl: the payload is shared, so `T` need not be `Clone`
impl<T> Clone for WatchEvent<T> {
    fn clone(&self) -> Self {
        Self { seq: self.seq, kind: self.kind, object: Arc::clone(&self.object) }
    }
}

/// Initial events (snapshot or replay) followed by the live stream.
pub struct Watch<T> {
    pub initial: Vec<WatchEvent<T>>,
    pub rx: broadcast::Receiver<WatchEvent<T>>,
}

/// Broadcast fan-out plus a bounded replay buffer.
pub struct EventLog<T> {
    tx: broadcast::Sender<WatchEvent<T>>,
    recent: Mutex<VecDeque<WatchEvent<T>>>,
    seq: AtomicU64,
    cap: usize,
}

impl<T: Send + Sync + 'static> EventLog<T> {
    pub fn new(cap: usize) -> Self {
        let (tx, _) = broadcast::channel(cap.max(1));
        Self { tx, recent: Mutex::new(VecDeque::with_capacity(cap)), seq: AtomicU64::new(0), cap: cap.max(1) }
    }

    pub fn last_seq(&self) -> u64 { self.seq.load(Ordering::SeqCst) }

    pub fn emit(&self, kind: EventKind, object: Arc<T>) -> u64 {
        // hold the buffer lock so subscribers see a consistent cut
        let mut recent = match self.recent.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let ev = WatchEvent { seq, kind, object };
        if recent.len() >= self.cap {
            recent.pop_front();
        }
        recent.push_back(ev.clone());
        let _ = self.tx.send(ev);
        seq
    }

    /// Subscribe; with `since`, also return the buffered events after it.
    /// A token older than the buffer fails with `Conflict`.
    pub fn subscribe(&self, since: Option<u64>) -> PorchResult<(Vec<WatchEvent<T>>, broadcast::Receiver<WatchEvent<T>>)> {
        let recent = self.recent.lock().map_err(|_| PorchError::backend("event log lock poisoned"))?;
        let rx = self.tx.subscribe();
        let Some(since) = since else { return Ok((Vec::new(), rx)) };
        let oldest = recent.front().map(|e| e.seq).unwrap_or(self.last_seq() + 1);
        if since + 1 < oldest && since < self.last_seq() {
            return Err(PorchError::conflict(format!("resume token {since} is too old (oldest buffered {oldest})")));
        }
        Ok((recent.iter().filter(|e| e.seq > since).cloned().collect(), rx))
    }
}
