//! Narrator: text → queued audio chunks → sequential playback.
//!
//! Data flow:
//! 1. `StreamCoordinator` feeds text units into a `StreamingSynthesizer`
//! 2. finished chunks are appended to the `ChunkQueue` under the live session
//! 3. `PlaybackController` consumes the queue by index, one sounding chunk at a time
//! 4. `UiStateTracker` projects all of it into a `PlaybackView` for presentation
//!
//! `Narrator` wires the components together around one shared queue and
//! session registry.

pub mod api;
pub mod chunk;
pub mod error;
pub mod espeak;
pub mod kokoro;
pub mod player;
pub mod queue;
pub mod session;
pub mod sink;
pub mod splitter;
pub mod stream;
pub mod synth;
pub mod ui_state;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::{Arc, Mutex, PoisonError};

use tracing::info;

use error::StreamError;
use player::PlaybackController;
use queue::ChunkQueue;
use session::{SessionRegistry, StreamingSession};
use sink::AudioOutput;
use stream::{StreamCoordinator, StreamInput, StreamOptions, StreamSettings};
use synth::ChunkSynthesizer;
use ui_state::{PlaybackView, UiStateTracker};

pub struct Narrator {
    queue: Arc<ChunkQueue>,
    sessions: Arc<SessionRegistry>,
    player: Arc<PlaybackController>,
    coordinator: StreamCoordinator,
    voice: String,
    /// First sentence of the content currently loaded.
    loaded: Mutex<Option<String>>,
}

impl Narrator {
    pub fn new(
        synth: ChunkSynthesizer,
        output: Arc<dyn AudioOutput>,
        settings: StreamSettings,
        speed: f32,
        voice: impl Into<String>,
    ) -> Self {
        let queue = Arc::new(ChunkQueue::new());
        let sessions = Arc::new(SessionRegistry::new());
        let player = PlaybackController::new(queue.clone(), sessions.clone(), output, speed);
        let coordinator = StreamCoordinator::new(
            synth,
            queue.clone(),
            sessions.clone(),
            player.clone(),
            settings,
        );

        Self {
            queue,
            sessions,
            player,
            coordinator,
            voice: voice.into(),
            loaded: Mutex::new(None),
        }
    }

    pub fn player(&self) -> &Arc<PlaybackController> {
        &self.player
    }

    pub fn coordinator(&self) -> &StreamCoordinator {
        &self.coordinator
    }

    pub fn tracker(&self) -> UiStateTracker {
        UiStateTracker::new(self.player.clone(), self.queue.clone(), self.sessions.clone())
    }

    pub fn view(&self) -> PlaybackView {
        self.tracker().snapshot()
    }

    /// Register the content about to be narrated.
    ///
    /// Content is identified by its first sentence. When it differs from what
    /// was loaded before, everything belonging to the old content is stopped
    /// and discarded. Returns whether the content changed.
    pub fn load_content(&self, sentences: &[String]) -> bool {
        let first = sentences.iter().find(|s| !s.trim().is_empty()).cloned();
        let mut loaded = self.loaded.lock().unwrap_or_else(PoisonError::into_inner);
        if *loaded == first {
            return false;
        }

        if loaded.is_some() {
            info!("New content loaded, resetting playback");
            self.player.stop();
        }
        *loaded = first;
        true
    }

    /// Stream `input`, using the configured voice unless one is given.
    pub async fn stream(
        &self,
        input: StreamInput,
        also_play: bool,
        voice: Option<String>,
    ) -> Result<Arc<StreamingSession>, StreamError> {
        let options = StreamOptions {
            also_play,
            voice: voice.unwrap_or_else(|| self.voice.clone()),
        };
        self.coordinator.start_streaming(input, options).await
    }
}
