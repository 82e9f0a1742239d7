//! Streaming sessions and the single live-session slot.
//!
//! Every "synthesize this text" request runs as one `StreamingSession`. The
//! registry guarantees only one of them can append to the queue: superseding,
//! ending and appending all happen under the same lock, so a session that has
//! been replaced can never slip a chunk in after the queue was cleared.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::chunk::{AudioChunk, SynthesizedAudio};
use super::error::{QueueError, StreamError, SynthesisError};
use super::queue::ChunkQueue;

/// What a finished session produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: u64,
    pub chunks: usize,
    pub failed_units: usize,
    pub cancelled: bool,
}

type Outcome = Option<Result<SessionSummary, StreamError>>;

pub struct StreamingSession {
    id: u64,
    cancel: CancellationToken,
    complete: AtomicBool,
    appended: AtomicUsize,
    failed_units: AtomicUsize,
    outcome: watch::Sender<Outcome>,
}

impl StreamingSession {
    fn new(id: u64) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            id,
            cancel: CancellationToken::new(),
            complete: AtomicBool::new(false),
            appended: AtomicUsize::new(0),
            failed_units: AtomicUsize::new(0),
            outcome,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Flag the session as superseded. Monotonic.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// True once all input was fed and every in-flight unit was drained.
    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    /// True once the session stopped producing, for whatever reason.
    pub fn is_finished(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    pub fn chunks_appended(&self) -> usize {
        self.appended.load(Ordering::Acquire)
    }

    pub fn failed_units(&self) -> usize {
        self.failed_units.load(Ordering::Acquire)
    }

    /// The terminal synthesis failure, if the session ended on one.
    pub fn error(&self) -> Option<SynthesisError> {
        match &*self.outcome.borrow() {
            Some(Err(StreamError::Synthesis(e))) => Some(e.clone()),
            _ => None,
        }
    }

    /// Wait for the session to end and return how it went.
    pub async fn finished(&self) -> Result<SessionSummary, StreamError> {
        let mut rx = self.outcome.subscribe();
        let result = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone().unwrap_or_else(|| Ok(self.summary())),
            Err(_) => Ok(self.summary()),
        };
        result
    }

    pub(crate) fn record_failed_unit(&self) {
        self.failed_units.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn finish(&self, error: Option<SynthesisError>) {
        let outcome = match error {
            Some(e) => Err(StreamError::Synthesis(e)),
            None => {
                if !self.is_cancelled() {
                    self.complete.store(true, Ordering::Release);
                }
                Ok(self.summary())
            }
        };
        self.outcome.send_replace(Some(outcome));
    }

    fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id,
            chunks: self.chunks_appended(),
            failed_units: self.failed_units(),
            cancelled: self.is_cancelled(),
        }
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    live: Mutex<Option<Arc<StreamingSession>>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new session: supersede the live one and reset the queue.
    pub fn begin(&self, queue: &ChunkQueue) -> Arc<StreamingSession> {
        let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(old) = live.take() {
            old.cancel();
            info!("Session {} superseded", old.id());
        }
        queue.clear();

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let session = Arc::new(StreamingSession::new(id));
        queue.set_producing(true);
        *live = Some(session.clone());
        info!("Session {id} started");
        session
    }

    /// Supersede the live session without touching queued audio.
    pub fn cancel_live(&self, queue: &ChunkQueue) -> bool {
        let live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        match live.as_ref() {
            Some(session) if !session.is_cancelled() => {
                session.cancel();
                queue.set_producing(false);
                info!("Session {} cancelled", session.id());
                true
            }
            _ => false,
        }
    }

    /// Supersede the live session and discard every queued chunk.
    pub fn end(&self, queue: &ChunkQueue) {
        let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(old) = live.take() {
            old.cancel();
            debug!("Session {} ended", old.id());
        }
        queue.clear();
    }

    /// Append the audio of sentence `unit` on behalf of `session`, only while
    /// it is still the live one.
    ///
    /// Returns `Ok(None)` when the session was superseded; its audio is dropped.
    pub fn append(
        &self,
        session: &StreamingSession,
        queue: &ChunkQueue,
        audio: SynthesizedAudio,
        unit: usize,
    ) -> Result<Option<usize>, QueueError> {
        let live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        if session.is_cancelled() || !is_live(&live, session) {
            debug!("Dropping chunk from superseded session {}", session.id());
            return Ok(None);
        }

        // Only the live session appends, so the queue holds nothing but its chunks.
        let chunk = AudioChunk::new(audio, queue.next_index()).with_unit(unit);
        let index = queue.append(chunk)?;
        session.appended.fetch_add(1, Ordering::AcqRel);
        Ok(Some(index))
    }

    /// Detach `session` from the queue once it stops producing.
    pub fn release(&self, session: &StreamingSession, queue: &ChunkQueue) {
        let live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        if is_live(&live, session) {
            queue.set_producing(false);
        }
    }

    pub fn current(&self) -> Option<Arc<StreamingSession>> {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

fn is_live(live: &Option<Arc<StreamingSession>>, session: &StreamingSession) -> bool {
    live.as_ref().is_some_and(|s| s.id() == session.id())
}
