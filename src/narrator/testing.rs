//! Test doubles shared by the narrator unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::chunk::{AudioChunk, SynthesizedAudio};
use super::error::{PlaybackError, SynthesisError};
use super::sink::{AudioOutput, SoundingHandle};
use super::synth::{
    ChunkResult, ChunkStream, FeedUnit, OneShotSynthesizer, StreamingSynthesizer,
    SynthesizedUnit, TextFeed,
};

/// Sample rate of scripted audio: one sample per millisecond.
pub const TEST_RATE: u32 = 1000;

/// Length of every scripted chunk, in samples (and milliseconds).
const CHUNK_MS: usize = 100;

/// Scripted audio for `text`: every sample carries the text length.
fn scripted_audio(text: &str) -> SynthesizedAudio {
    SynthesizedAudio::new(vec![text.len() as f32; CHUNK_MS], TEST_RATE)
}

/// One-shot backend with scripted latency and failures.
///
/// Each chunk's samples carry the sentence length, so tests can tell which
/// input a queued chunk came from.
pub struct ScriptedSynth {
    delay: Duration,
    fail_on: Vec<String>,
    silent_on: Vec<String>,
    unavailable: bool,
    unavailable_mid_stream: bool,
    spoken: Mutex<Vec<String>>,
    finished_at: Mutex<Vec<Instant>>,
}

impl ScriptedSynth {
    pub fn new() -> Self {
        Self {
            delay: Duration::ZERO,
            fail_on: Vec::new(),
            silent_on: Vec::new(),
            unavailable: false,
            unavailable_mid_stream: false,
            spoken: Mutex::new(Vec::new()),
            finished_at: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing_on(mut self, text: &str) -> Self {
        self.fail_on.push(text.to_string());
        self
    }

    pub fn silent_on(mut self, text: &str) -> Self {
        self.silent_on.push(text.to_string());
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }

    pub fn unavailable_mid_stream(mut self) -> Self {
        self.unavailable_mid_stream = true;
        self
    }

    pub fn spoken(&self) -> Vec<String> {
        self.spoken.lock().unwrap().clone()
    }

    pub fn finished_at(&self) -> Vec<Instant> {
        self.finished_at.lock().unwrap().clone()
    }
}

#[async_trait]
impl OneShotSynthesizer for ScriptedSynth {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn probe(&self, _voice: &str) -> Result<(), SynthesisError> {
        if self.unavailable {
            return Err(SynthesisError::Unavailable("scripted backend offline".into()));
        }
        Ok(())
    }

    async fn synthesize(&self, text: &str, _voice: &str) -> ChunkResult {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.unavailable_mid_stream {
            return Err(SynthesisError::Unavailable("scripted backend lost".into()));
        }
        self.spoken.lock().unwrap().push(text.to_string());
        self.finished_at.lock().unwrap().push(Instant::now());

        if self.fail_on.iter().any(|f| f == text) {
            return Err(SynthesisError::Interrupted(format!("scripted failure on {text:?}")));
        }
        if self.silent_on.iter().any(|f| f == text) {
            return Ok(SynthesizedAudio::new(Vec::new(), TEST_RATE));
        }

        Ok(scripted_audio(text))
    }
}

/// Native streaming backend: every pushed unit becomes one chunk, each
/// arriving after its own scripted delay (cycled when units outnumber delays).
pub struct ScriptedStream {
    delays: Vec<Duration>,
    spoken: Arc<Mutex<Vec<String>>>,
}

impl ScriptedStream {
    pub fn new(delays: &[u64]) -> Self {
        Self {
            delays: delays.iter().map(|ms| Duration::from_millis(*ms)).collect(),
            spoken: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn spoken(&self) -> Vec<String> {
        self.spoken.lock().unwrap().clone()
    }
}

#[async_trait]
impl StreamingSynthesizer for ScriptedStream {
    async fn open(&self, _voice: &str) -> Result<(TextFeed, ChunkStream), SynthesisError> {
        let (feed, mut source) = TextFeed::channel(4);
        let (out, stream) = ChunkStream::channel(4);
        let delays = self.delays.clone();
        let spoken = self.spoken.clone();

        tokio::spawn(async move {
            let mut unit = 0;
            while let Some(FeedUnit::Fragment(text) | FeedUnit::Sentence(text)) =
                source.recv().await
            {
                let index = unit;
                unit += 1;
                if text.trim().is_empty() {
                    continue;
                }
                if out.is_closed() {
                    return;
                }

                if !delays.is_empty() {
                    tokio::time::sleep(delays[index % delays.len()]).await;
                }
                spoken.lock().unwrap().push(text.clone());
                let result = Ok(scripted_audio(&text));
                if out.send(SynthesizedUnit { unit: index, result }).await.is_err() {
                    return;
                }
            }
        });
        Ok((feed, stream))
    }
}

#[derive(Default)]
struct OutputCounters {
    live: AtomicUsize,
    max_live: AtomicUsize,
    releases: AtomicUsize,
    started: Mutex<Vec<(usize, Instant)>>,
    speeds: Mutex<Vec<f32>>,
}

/// Output that "plays" a chunk by sleeping for its duration.
#[derive(Clone, Default)]
pub struct RecordingOutput {
    counters: Arc<OutputCounters>,
    failing: Arc<AtomicBool>,
}

impl RecordingOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Indices in the order they started sounding.
    pub fn started(&self) -> Vec<usize> {
        self.counters.started.lock().unwrap().iter().map(|(i, _)| *i).collect()
    }

    pub fn started_at(&self, index: usize) -> Option<Instant> {
        self.counters
            .started
            .lock()
            .unwrap()
            .iter()
            .find(|(i, _)| *i == index)
            .map(|(_, at)| *at)
    }

    pub fn live(&self) -> usize {
        self.counters.live.load(Ordering::SeqCst)
    }

    pub fn max_live(&self) -> usize {
        self.counters.max_live.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.counters.releases.load(Ordering::SeqCst)
    }

    pub fn last_speed(&self) -> Option<f32> {
        self.counters.speeds.lock().unwrap().last().copied()
    }
}

impl AudioOutput for RecordingOutput {
    fn start(
        &self,
        chunk: &AudioChunk,
        speed: f32,
    ) -> Result<Arc<dyn SoundingHandle>, PlaybackError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PlaybackError::Output("device unplugged".into()));
        }

        let live = self.counters.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_live.fetch_max(live, Ordering::SeqCst);
        self.counters
            .started
            .lock()
            .unwrap()
            .push((chunk.source_index(), Instant::now()));
        self.counters.speeds.lock().unwrap().push(speed);

        Ok(Arc::new(RecordingHandle {
            duration: chunk.duration().div_f32(speed),
            stopped: CancellationToken::new(),
            ended: AtomicBool::new(false),
            counters: self.counters.clone(),
        }))
    }

    fn release(&self) {
        self.counters.releases.fetch_add(1, Ordering::SeqCst);
    }
}

struct RecordingHandle {
    duration: Duration,
    stopped: CancellationToken,
    ended: AtomicBool,
    counters: Arc<OutputCounters>,
}

impl RecordingHandle {
    fn end(&self) {
        if !self.ended.swap(true, Ordering::SeqCst) {
            self.counters.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl SoundingHandle for RecordingHandle {
    async fn finished(&self) {
        tokio::select! {
            _ = tokio::time::sleep(self.duration) => self.end(),
            _ = self.stopped.cancelled() => {}
        }
    }

    fn stop(&self) {
        self.stopped.cancel();
        self.end();
    }

    fn set_speed(&self, speed: f32) {
        self.counters.speeds.lock().unwrap().push(speed);
    }
}

/// Poll `cond` on virtual time until it holds; false after ~10 simulated seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..2000 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}
