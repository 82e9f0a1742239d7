//! Playback state machine over the chunk queue.
//!
//! STOPPED → PLAYING ⇄ PAUSED → STOPPED
//!
//! Every play/seek/resume starts a fresh consumer loop tagged with a run
//! generation; pause/seek/stop bump the generation and cancel the loop, so a
//! completion arriving late from an older loop never touches current state.
//! The controller is the only owner of the sounding handle and tears down the
//! previous one before any new chunk starts.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::chunk::AudioChunk;
use super::error::PlaybackError;
use super::queue::ChunkQueue;
use super::session::SessionRegistry;
use super::sink::{AudioOutput, SoundingHandle};

/// Speeds visited by `cycle_speed`, in order.
pub const SPEED_STEPS: [f32; 4] = [1.0, 1.5, 2.0, 0.5];

const MIN_SPEED: f32 = 0.25;
const MAX_SPEED: f32 = 4.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackStatus {
    Stopped,
    Playing,
    Paused,
}

impl std::fmt::Display for PlaybackStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "STOPPED"),
            Self::Playing => write!(f, "PLAYING"),
            Self::Paused => write!(f, "PAUSED"),
        }
    }
}

struct Sounding {
    index: usize,
    handle: Arc<dyn SoundingHandle>,
    // Media time played before `since`, at earlier speeds.
    played: Duration,
    since: Instant,
    speed: f32,
}

impl Sounding {
    fn position(&self) -> Duration {
        self.played + self.since.elapsed().mul_f32(self.speed)
    }
}

/// The consumer loop currently allowed to drive playback.
struct ActiveRun {
    generation: u64,
    cancel: CancellationToken,
    sounding: Option<Sounding>,
}

struct PlayerState {
    status: PlaybackStatus,
    current_index: usize,
    generation: u64,
    // Some exactly while status == Playing.
    active: Option<ActiveRun>,
    speed: f32,
}

impl PlayerState {
    /// Cancel the running loop and silence its chunk. Idempotent.
    fn teardown(&mut self) {
        self.generation += 1;
        if let Some(run) = self.active.take() {
            run.cancel.cancel();
            if let Some(sounding) = run.sounding {
                sounding.handle.stop();
            }
        }
    }

    fn run_mut(&mut self, generation: u64) -> Option<&mut ActiveRun> {
        self.active
            .as_mut()
            .filter(|run| run.generation == generation)
    }
}

pub struct PlaybackController {
    queue: Arc<ChunkQueue>,
    sessions: Arc<SessionRegistry>,
    output: Arc<dyn AudioOutput>,
    state: Mutex<PlayerState>,
}

impl PlaybackController {
    pub fn new(
        queue: Arc<ChunkQueue>,
        sessions: Arc<SessionRegistry>,
        output: Arc<dyn AudioOutput>,
        speed: f32,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue,
            sessions,
            output,
            state: Mutex::new(PlayerState {
                status: PlaybackStatus::Stopped,
                current_index: 0,
                generation: 0,
                active: None,
                speed: clamp_speed(speed),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, PlayerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> PlaybackStatus {
        self.lock().status
    }

    pub fn current_index(&self) -> usize {
        self.lock().current_index
    }

    pub fn speed(&self) -> f32 {
        self.lock().speed
    }

    /// Index and media-time position of the chunk currently sounding.
    pub fn sounding_progress(&self) -> Option<(usize, Duration)> {
        let state = self.lock();
        let sounding = state.active.as_ref()?.sounding.as_ref()?;
        Some((sounding.index, sounding.position()))
    }

    /// Start (or restart) playback at `from`.
    pub fn play(self: &Arc<Self>, from: usize) -> Result<(), PlaybackError> {
        let len = self.queue.len();
        if from >= len {
            warn!("Play from chunk {from} refused: {len} chunks available");
            return Err(PlaybackError::NoAudioAvailable);
        }
        self.start_run(from);
        Ok(())
    }

    /// Hard-stop the sounding chunk, keeping its index for resume.
    pub fn pause(&self) {
        let mut state = self.lock();
        if state.status != PlaybackStatus::Playing {
            return;
        }
        state.teardown();
        state.status = PlaybackStatus::Paused;
        info!(
            "State: PLAYING → PAUSED at chunk {}",
            state.current_index
        );
    }

    /// Continue from the preserved index, restarting that chunk from its start.
    pub fn resume(self: &Arc<Self>) -> Result<(), PlaybackError> {
        let (status, index) = {
            let state = self.lock();
            (state.status, state.current_index)
        };
        if status == PlaybackStatus::Playing {
            return Ok(());
        }

        let len = self.queue.len();
        if len == 0 {
            warn!("Resume refused: no audio chunks available");
            return Err(PlaybackError::NoAudioAvailable);
        }
        // Paused while waiting on the producer: keep waiting for that chunk.
        let index = if index < len || self.queue.is_producing() {
            index
        } else {
            len - 1
        };
        self.start_run(index);
        Ok(())
    }

    pub fn toggle(self: &Arc<Self>) -> Result<(), PlaybackError> {
        match self.status() {
            PlaybackStatus::Playing => {
                self.pause();
                Ok(())
            }
            PlaybackStatus::Paused | PlaybackStatus::Stopped => self.resume(),
        }
    }

    /// Jump to `index`, clamped to the chunks available right now.
    pub fn seek(self: &Arc<Self>, index: i64) -> Result<usize, PlaybackError> {
        if index < 0 {
            return Err(PlaybackError::InvalidSeekIndex(index));
        }
        let len = self.queue.len();
        if len == 0 {
            return Err(PlaybackError::NoAudioAvailable);
        }

        let target = usize::try_from(index).unwrap_or(usize::MAX).min(len - 1);
        if target as i64 != index {
            debug!("Seek to {index} clamped to {target}");
        }
        self.start_run(target);
        Ok(target)
    }

    /// Stop everything: playback, the live stream, and all queued audio.
    pub fn stop(&self) {
        let mut state = self.lock();
        let previous = state.status;
        state.teardown();
        state.status = PlaybackStatus::Stopped;
        state.current_index = 0;
        self.sessions.end(&self.queue);
        self.output.release();
        drop(state);

        if previous != PlaybackStatus::Stopped {
            info!("State: {previous} → STOPPED");
        }
    }

    pub fn set_speed(&self, speed: f32) -> f32 {
        let speed = clamp_speed(speed);
        let mut state = self.lock();
        state.speed = speed;
        if let Some(sounding) = state.active.as_mut().and_then(|run| run.sounding.as_mut()) {
            sounding.played = sounding.position();
            sounding.since = Instant::now();
            sounding.speed = speed;
            sounding.handle.set_speed(speed);
        }
        info!("Playback speed set to {speed}x");
        speed
    }

    /// Step through `SPEED_STEPS`; unknown speeds go back to 1.0.
    pub fn cycle_speed(&self) -> f32 {
        let current = self.speed();
        let next = SPEED_STEPS
            .iter()
            .position(|s| (s - current).abs() < f32::EPSILON)
            .map(|i| SPEED_STEPS[(i + 1) % SPEED_STEPS.len()])
            .unwrap_or(1.0);
        self.set_speed(next)
    }

    fn start_run(self: &Arc<Self>, from: usize) {
        let mut state = self.lock();
        let previous = state.status;
        state.teardown();

        let generation = state.generation;
        let cancel = CancellationToken::new();
        state.current_index = from;
        state.status = PlaybackStatus::Playing;
        state.active = Some(ActiveRun {
            generation,
            cancel: cancel.clone(),
            sounding: None,
        });
        drop(state);

        info!("State: {previous} → PLAYING from chunk {from}");
        let player = self.clone();
        tokio::spawn(async move { player.run(generation, cancel).await });
    }

    /// Consumer loop: play chunks in order until content ends or the run is cancelled.
    async fn run(self: Arc<Self>, generation: u64, cancel: CancellationToken) {
        loop {
            let Some(index) = self.index_for(generation) else {
                return;
            };

            let chunk = tokio::select! {
                chunk = self.queue.wait_for(index) => chunk,
                _ = cancel.cancelled() => return,
            };
            let Some(chunk) = chunk else {
                self.finish(generation);
                return;
            };

            let handle = match self.begin_sound(generation, &chunk) {
                Ok(Some(handle)) => handle,
                Ok(None) => return,
                Err(e) => {
                    warn!("Playback of chunk {index} failed: {e}");
                    self.abort(generation);
                    return;
                }
            };

            tokio::select! {
                _ = handle.finished() => {}
                _ = cancel.cancelled() => return,
            }

            if !self.advance(generation, index) {
                return;
            }
        }
    }

    fn index_for(&self, generation: u64) -> Option<usize> {
        let mut state = self.lock();
        state.run_mut(generation)?;
        Some(state.current_index)
    }

    /// Start sounding `chunk` for this run. `Ok(None)` when the run is stale.
    fn begin_sound(
        &self,
        generation: u64,
        chunk: &AudioChunk,
    ) -> Result<Option<Arc<dyn SoundingHandle>>, PlaybackError> {
        let mut state = self.lock();
        let speed = state.speed;
        let Some(run) = state.run_mut(generation) else {
            return Ok(None);
        };

        if let Some(previous) = run.sounding.take() {
            previous.handle.stop();
        }
        let handle = self.output.start(chunk, speed)?;
        run.sounding = Some(Sounding {
            index: chunk.source_index(),
            handle: handle.clone(),
            played: Duration::ZERO,
            since: Instant::now(),
            speed,
        });
        debug!("Playing chunk {}/{}", chunk.source_index() + 1, self.queue.len());
        Ok(Some(handle))
    }

    /// Natural completion of `index`: move on to the next chunk.
    fn advance(&self, generation: u64, index: usize) -> bool {
        let mut state = self.lock();
        let Some(run) = state.run_mut(generation) else {
            return false;
        };
        run.sounding = None;
        state.current_index = index + 1;
        true
    }

    /// End of content: no further chunk exists and none is coming.
    fn finish(&self, generation: u64) {
        let mut state = self.lock();
        if state.run_mut(generation).is_none() {
            return;
        }
        state.active = None;
        state.status = PlaybackStatus::Stopped;
        state.current_index = 0;
        info!("State: PLAYING → STOPPED (end of content)");
    }

    /// Output failure: stop where we are so a later play can retry.
    fn abort(&self, generation: u64) {
        let mut state = self.lock();
        if state.run_mut(generation).is_none() {
            return;
        }
        state.teardown();
        state.status = PlaybackStatus::Stopped;
        info!("State: PLAYING → STOPPED (output failure)");
    }
}

fn clamp_speed(speed: f32) -> f32 {
    if speed.is_finite() && speed > 0.0 {
        speed.clamp(MIN_SPEED, MAX_SPEED)
    } else {
        1.0
    }
}
