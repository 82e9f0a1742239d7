//! Synthesis capabilities: one-shot per unit, or streaming over a text feed.
//!
//! Backends only need to implement `OneShotSynthesizer`; `SegmentingStream`
//! turns any of them into a `StreamingSynthesizer` that accepts pushed text,
//! segments it into sentences and yields one chunk per sentence in order.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::chunk::SynthesizedAudio;
use super::error::SynthesisError;
use super::splitter::SentenceSplitter;

pub type ChunkResult = Result<SynthesizedAudio, SynthesisError>;

#[async_trait]
pub trait OneShotSynthesizer: Send + Sync {
    fn name(&self) -> &str;

    /// Check the backend can serve `voice` before any text is submitted.
    async fn probe(&self, _voice: &str) -> Result<(), SynthesisError> {
        Ok(())
    }

    /// Synthesize one unit of text into one complete chunk of audio.
    async fn synthesize(&self, text: &str, voice: &str) -> ChunkResult;
}

#[async_trait]
pub trait StreamingSynthesizer: Send + Sync {
    /// Open a stream: push text into the feed, pull chunks from the stream.
    ///
    /// Fails with `Unavailable` before producing anything if the backend
    /// cannot be used.
    async fn open(&self, voice: &str) -> Result<(TextFeed, ChunkStream), SynthesisError>;
}

/// Unit of input pushed into a streaming backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedUnit {
    /// Raw text that still needs sentence segmentation.
    Fragment(String),
    /// A complete sentence, synthesized as exactly one chunk.
    Sentence(String),
}

enum FeedMessage {
    Unit(FeedUnit),
    End,
}

/// Producer end of a streaming backend's input.
///
/// Dropping the feed without `close()` abandons the input: text still
/// buffered in the backend is discarded instead of synthesized.
pub struct TextFeed {
    tx: mpsc::Sender<FeedMessage>,
}

impl TextFeed {
    pub fn channel(capacity: usize) -> (Self, TextSource) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, TextSource { rx, ended: false })
    }

    /// Push one unit, waiting while the backend is saturated.
    ///
    /// Returns false once the backend stopped accepting input.
    pub async fn push(&self, unit: FeedUnit) -> bool {
        self.tx.send(FeedMessage::Unit(unit)).await.is_ok()
    }

    /// Signal that all input was pushed.
    pub async fn close(self) {
        let _ = self.tx.send(FeedMessage::End).await;
    }
}

/// Backend end of a `TextFeed`.
pub struct TextSource {
    rx: mpsc::Receiver<FeedMessage>,
    ended: bool,
}

impl TextSource {
    /// Next pushed unit; `None` once the input was closed or abandoned.
    pub async fn recv(&mut self) -> Option<FeedUnit> {
        if self.ended {
            return None;
        }
        match self.rx.recv().await? {
            FeedMessage::Unit(unit) => Some(unit),
            FeedMessage::End => {
                self.ended = true;
                None
            }
        }
    }

    /// True once the producer closed the feed, as opposed to dropping it.
    pub fn completed(&self) -> bool {
        self.ended
    }
}

/// One result of a streaming backend, tagged with the sentence it came from.
///
/// `unit` counts every sentence the backend took on, including ones that
/// failed or produced no audio, so it stays aligned with the input.
#[derive(Debug)]
pub struct SynthesizedUnit {
    pub unit: usize,
    pub result: ChunkResult,
}

/// Consumer end of a streaming backend's output.
pub struct ChunkStream {
    rx: mpsc::Receiver<SynthesizedUnit>,
}

impl ChunkStream {
    pub fn channel(capacity: usize) -> (mpsc::Sender<SynthesizedUnit>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self { rx })
    }

    /// Next synthesized unit, or `None` once input is exhausted.
    pub async fn next(&mut self) -> Option<SynthesizedUnit> {
        self.rx.recv().await
    }
}

/// Streaming adapter over a one-shot backend.
pub struct SegmentingStream<S: ?Sized> {
    backend: Arc<S>,
    capacity: usize,
}

impl<S: OneShotSynthesizer + ?Sized + 'static> SegmentingStream<S> {
    pub fn new(backend: Arc<S>, capacity: usize) -> Self {
        Self { backend, capacity }
    }
}

#[async_trait]
impl<S: OneShotSynthesizer + ?Sized + 'static> StreamingSynthesizer for SegmentingStream<S> {
    async fn open(&self, voice: &str) -> Result<(TextFeed, ChunkStream), SynthesisError> {
        self.backend.probe(voice).await?;

        let (feed, source) = TextFeed::channel(self.capacity);
        let (out, stream) = ChunkStream::channel(self.capacity);
        tokio::spawn(run_segmenter(
            self.backend.clone(),
            voice.to_string(),
            source,
            out,
        ));
        Ok((feed, stream))
    }
}

async fn run_segmenter<S: OneShotSynthesizer + ?Sized>(
    backend: Arc<S>,
    voice: String,
    mut source: TextSource,
    out: mpsc::Sender<SynthesizedUnit>,
) {
    let mut splitter = SentenceSplitter::new();
    let mut next_unit = 0;

    while let Some(unit) = source.recv().await {
        // Pending fragment text first, then the sentence itself; a blank
        // sentence still takes its place in the numbering.
        let ready: Vec<Option<String>> = match unit {
            FeedUnit::Fragment(text) => splitter.push(&text).into_iter().map(Some).collect(),
            FeedUnit::Sentence(text) => {
                let text = text.trim();
                splitter
                    .finish()
                    .into_iter()
                    .map(Some)
                    .chain([(!text.is_empty()).then(|| text.to_string())])
                    .collect()
            }
        };

        for sentence in ready {
            let unit = next_unit;
            next_unit += 1;
            let Some(sentence) = sentence else {
                continue;
            };
            if !emit(&*backend, &voice, unit, &sentence, &out).await {
                return;
            }
        }
    }

    if !source.completed() || out.is_closed() {
        debug!("{} stream abandoned", backend.name());
        return;
    }
    if let Some(rest) = splitter.finish() {
        emit(&*backend, &voice, next_unit, &rest, &out).await;
    }
    debug!("{} stream drained", backend.name());
}

/// Synthesize one sentence and forward it. False means stop producing.
async fn emit<S: OneShotSynthesizer + ?Sized>(
    backend: &S,
    voice: &str,
    unit: usize,
    sentence: &str,
    out: &mpsc::Sender<SynthesizedUnit>,
) -> bool {
    // Nobody is listening any more; leave the sentence unstarted.
    if out.is_closed() {
        return false;
    }

    let result = backend.synthesize(sentence, voice).await;
    let terminal = match &result {
        Err(e) if e.is_terminal() => {
            warn!("{} became unavailable: {e}", backend.name());
            true
        }
        _ => false,
    };
    out.send(SynthesizedUnit { unit, result }).await.is_ok() && !terminal
}

/// The two interchangeable ways of producing chunks.
#[derive(Clone)]
pub enum ChunkSynthesizer {
    OneShot(Arc<dyn OneShotSynthesizer>),
    Streaming(Arc<dyn StreamingSynthesizer>),
}

impl ChunkSynthesizer {
    /// Streaming view of this synthesizer; one-shot backends get segmented.
    pub fn into_streaming(self, capacity: usize) -> Arc<dyn StreamingSynthesizer> {
        match self {
            Self::OneShot(backend) => Arc::new(SegmentingStream::new(backend, capacity)),
            Self::Streaming(backend) => backend,
        }
    }
}
