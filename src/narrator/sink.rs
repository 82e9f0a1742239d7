//! Audio output: the only place samples reach the sound device.
//!
//! `AudioOutput` owns the device context; each played chunk gets its own
//! `SoundingHandle`. Only the playback controller calls into this module.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use rodio::buffer::SamplesBuffer;
use rodio::{OutputStream, OutputStreamBuilder, Sink};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::chunk::AudioChunk;
use super::error::PlaybackError;

/// A chunk that is currently sounding.
#[async_trait]
pub trait SoundingHandle: Send + Sync {
    /// Resolves when the chunk ends naturally or after `stop`.
    async fn finished(&self);

    /// Hard stop. Safe to call more than once.
    fn stop(&self);

    fn set_speed(&self, speed: f32);
}

pub trait AudioOutput: Send + Sync {
    /// Start sounding `chunk` once at `speed`.
    fn start(&self, chunk: &AudioChunk, speed: f32)
        -> Result<Arc<dyn SoundingHandle>, PlaybackError>;

    /// Tear down the device context; the next `start` reopens it.
    fn release(&self) {}
}

/// rodio-backed output. The device stream is opened lazily on first use and
/// reused for every chunk until released.
#[derive(Default)]
pub struct RodioOutput {
    stream: Mutex<Option<OutputStream>>,
}

impl RodioOutput {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AudioOutput for RodioOutput {
    fn start(
        &self,
        chunk: &AudioChunk,
        speed: f32,
    ) -> Result<Arc<dyn SoundingHandle>, PlaybackError> {
        let mut guard = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
        let stream = match guard.take() {
            Some(stream) => stream,
            None => {
                let mut stream = OutputStreamBuilder::open_default_stream()
                    .map_err(|e| PlaybackError::Output(format!("Failed to open audio output: {e}")))?;
                stream.log_on_drop(false);
                info!("Audio output opened");
                stream
            }
        };

        // rodio 0.21: Sink::connect_new takes &Mixer
        let sink = Sink::connect_new(stream.mixer());
        *guard = Some(stream);

        sink.set_speed(speed);
        sink.append(SamplesBuffer::new(
            1,
            chunk.sample_rate(),
            chunk.samples().to_vec(),
        ));
        debug!(
            "Sounding chunk {} ({:.1}s at {speed}x)",
            chunk.source_index(),
            chunk.duration().as_secs_f32()
        );

        Ok(Arc::new(RodioHandle {
            sink: Arc::new(sink),
            stopped: CancellationToken::new(),
        }))
    }

    fn release(&self) {
        if self
            .stream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
        {
            info!("Audio output released");
        }
    }
}

struct RodioHandle {
    sink: Arc<Sink>,
    stopped: CancellationToken,
}

#[async_trait]
impl SoundingHandle for RodioHandle {
    async fn finished(&self) {
        let sink = self.sink.clone();
        let drained = tokio::task::spawn_blocking(move || sink.sleep_until_end());
        tokio::select! {
            _ = drained => {}
            _ = self.stopped.cancelled() => {}
        }
    }

    fn stop(&self) {
        if !self.stopped.is_cancelled() {
            self.stopped.cancel();
            self.sink.stop();
        }
    }

    fn set_speed(&self, speed: f32) {
        self.sink.set_speed(speed);
    }
}
