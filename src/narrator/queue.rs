//! Ordered, append-only buffer of synthesized chunks.
//!
//! One producer appends, one consumer reads by index. Appended chunks are
//! never mutated, so reads of written entries need no coordination beyond
//! the short lock around the backing vector. Consumers that run ahead of the
//! producer park on a watch channel instead of polling.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use super::chunk::AudioChunk;
use super::error::QueueError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct QueueState {
    len: usize,
    producing: bool,
}

pub struct ChunkQueue {
    chunks: RwLock<Vec<Arc<AudioChunk>>>,
    state: watch::Sender<QueueState>,
}

impl Default for ChunkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkQueue {
    pub fn new() -> Self {
        let (state, _) = watch::channel(QueueState::default());
        Self {
            chunks: RwLock::new(Vec::new()),
            state,
        }
    }

    /// Append a chunk whose index must equal the current length.
    pub fn append(&self, chunk: AudioChunk) -> Result<usize, QueueError> {
        let mut chunks = self.chunks.write().unwrap_or_else(PoisonError::into_inner);
        let expected = chunks.len();
        let got = chunk.source_index();
        if got != expected {
            warn!("Rejected chunk {got}: queue expects index {expected}");
            return Err(QueueError::NonContiguous { expected, got });
        }

        chunks.push(Arc::new(chunk));
        let len = chunks.len();
        self.state.send_modify(|s| s.len = len);
        debug!("Queued chunk {got} ({len} total)");
        Ok(got)
    }

    pub fn get(&self, index: usize) -> Result<Arc<AudioChunk>, QueueError> {
        let chunks = self.chunks.read().unwrap_or_else(PoisonError::into_inner);
        chunks.get(index).cloned().ok_or(QueueError::NotFound {
            index,
            len: chunks.len(),
        })
    }

    pub fn len(&self) -> usize {
        self.chunks.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Index the next appended chunk has to carry.
    pub fn next_index(&self) -> usize {
        self.len()
    }

    /// Discard every chunk. Callers must have superseded the producer first.
    pub fn clear(&self) {
        let mut chunks = self.chunks.write().unwrap_or_else(PoisonError::into_inner);
        let dropped = chunks.len();
        chunks.clear();
        self.state.send_modify(|s| {
            s.len = 0;
            s.producing = false;
        });
        if dropped > 0 {
            debug!("Cleared {dropped} queued chunks");
        }
    }

    /// Mark whether a producer may still append more chunks.
    pub fn set_producing(&self, producing: bool) {
        self.state.send_if_modified(|s| {
            let changed = s.producing != producing;
            s.producing = producing;
            changed
        });
    }

    pub fn is_producing(&self) -> bool {
        self.state.borrow().producing
    }

    /// Wait until `index` is appended.
    ///
    /// Resolves `None` once the index is absent and no producer is attached.
    pub async fn wait_for(&self, index: usize) -> Option<Arc<AudioChunk>> {
        let mut rx = self.state.subscribe();
        loop {
            // Mark the state seen before looking, so an append in between still wakes us.
            let producing = rx.borrow_and_update().producing;
            if let Ok(chunk) = self.get(index) {
                return Some(chunk);
            }
            if !producing {
                return None;
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    }

    pub fn total_duration(&self) -> Duration {
        let chunks = self.chunks.read().unwrap_or_else(PoisonError::into_inner);
        chunks.iter().map(|c| c.duration()).sum()
    }

    /// Summed duration of every chunk that precedes `index`.
    pub fn duration_before(&self, index: usize) -> Duration {
        let chunks = self.chunks.read().unwrap_or_else(PoisonError::into_inner);
        let end = index.min(chunks.len());
        chunks[..end].iter().map(|c| c.duration()).sum()
    }
}
