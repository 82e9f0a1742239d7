//! Drives synthesis into the chunk queue, one live session at a time.
//!
//! Each `start_streaming` call supersedes the previous session and runs two
//! loops joined in one task: the feed loop pushes text units into the
//! synthesizer under its backpressure, the collect loop appends finished
//! chunks and kicks off playback when the first one lands.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::chunk::SynthesizedAudio;
use super::error::{StreamError, SynthesisError};
use super::player::{PlaybackController, PlaybackStatus};
use super::queue::ChunkQueue;
use super::session::{SessionRegistry, StreamingSession};
use super::splitter::{split_sentences, split_tokens};
use super::synth::{
    ChunkStream, ChunkSynthesizer, FeedUnit, StreamingSynthesizer, SynthesizedUnit, TextFeed,
};

/// Granularity at which plain text is fed to the synthesizer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamUnit {
    /// One feed unit per sentence.
    #[default]
    Sentence,
    /// Word tokens, segmented into sentences by the synthesizer.
    Token,
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub feed_delay: Duration,
    pub feed_capacity: usize,
    pub unit: StreamUnit,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            feed_delay: Duration::from_millis(20),
            feed_capacity: 8,
            unit: StreamUnit::Sentence,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamInput {
    Text(String),
    /// Pre-segmented sentences; every chunk's `unit_index` is the position
    /// of the sentence it was read from, blank entries included.
    Sentences(Vec<String>),
}

impl StreamInput {
    /// Feed units for this input, empty when there is nothing to say.
    fn into_units(self, unit: StreamUnit) -> Vec<FeedUnit> {
        match self {
            Self::Text(text) => match unit {
                StreamUnit::Token => split_tokens(&text)
                    .into_iter()
                    .map(|t| FeedUnit::Fragment(t.to_string()))
                    .collect(),
                StreamUnit::Sentence => split_sentences(&text)
                    .into_iter()
                    .map(|s| FeedUnit::Sentence(s.to_string()))
                    .collect(),
            },
            Self::Sentences(sentences) => {
                if sentences.iter().all(|s| s.trim().is_empty()) {
                    return Vec::new();
                }
                sentences.into_iter().map(FeedUnit::Sentence).collect()
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub also_play: bool,
    pub voice: String,
}

pub struct StreamCoordinator {
    synth: Arc<dyn StreamingSynthesizer>,
    queue: Arc<ChunkQueue>,
    sessions: Arc<SessionRegistry>,
    player: Arc<PlaybackController>,
    settings: StreamSettings,
}

impl StreamCoordinator {
    pub fn new(
        synth: ChunkSynthesizer,
        queue: Arc<ChunkQueue>,
        sessions: Arc<SessionRegistry>,
        player: Arc<PlaybackController>,
        settings: StreamSettings,
    ) -> Self {
        Self {
            synth: synth.into_streaming(settings.feed_capacity),
            queue,
            sessions,
            player,
            settings,
        }
    }

    /// Supersede whatever is streaming and start synthesizing `input`.
    ///
    /// Returns once the backend accepted the session; production continues
    /// in the background. Watch the returned session for completion.
    pub async fn start_streaming(
        &self,
        input: StreamInput,
        options: StreamOptions,
    ) -> Result<Arc<StreamingSession>, StreamError> {
        let units = input.into_units(self.settings.unit);
        if units.is_empty() {
            return Err(StreamError::EmptyInput);
        }

        // Old content goes away entirely: playback, session and queued audio.
        self.player.stop();
        let session = self.sessions.begin(&self.queue);

        let (feed, chunks) = match self.synth.open(&options.voice).await {
            Ok(opened) => opened,
            Err(e) => {
                warn!("Session {} failed to start: {e}", session.id());
                self.sessions.release(&session, &self.queue);
                session.finish(Some(e.clone()));
                return Err(e.into());
            }
        };

        info!(
            "Session {}: streaming {} units (also_play: {})",
            session.id(),
            units.len(),
            options.also_play
        );

        let collector = Collector {
            queue: self.queue.clone(),
            sessions: self.sessions.clone(),
            player: self.player.clone(),
            also_play: options.also_play,
        };
        let delay = self.settings.feed_delay;
        let task_session = session.clone();
        tokio::spawn(async move {
            let session = task_session;
            let ((), error) = tokio::join!(
                feed_units(&session, feed, units, delay),
                collector.run(&session, chunks),
            );

            collector.sessions.release(&session, &collector.queue);
            session.finish(error);
            if session.is_complete() {
                info!(
                    "Session {} complete: {} chunks, {} failed units",
                    session.id(),
                    session.chunks_appended(),
                    session.failed_units()
                );
            }
        });

        Ok(session)
    }

    /// Supersede the live session, keeping the audio it already produced.
    pub fn cancel(&self) -> bool {
        self.sessions.cancel_live(&self.queue)
    }

    pub fn current_session(&self) -> Option<Arc<StreamingSession>> {
        self.sessions.current()
    }

    pub fn is_streaming(&self) -> bool {
        self.current_session().is_some_and(|s| !s.is_finished())
    }
}

/// Push every unit, pacing by `delay`, until done or superseded.
async fn feed_units(session: &StreamingSession, feed: TextFeed, units: Vec<FeedUnit>, delay: Duration) {
    let total = units.len();
    for (i, unit) in units.into_iter().enumerate() {
        if session.is_cancelled() {
            info!("Session {}: cancelled before unit {}/{total}", session.id(), i + 1);
            return;
        }
        if i > 0 && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let accepted = tokio::select! {
            accepted = feed.push(unit) => accepted,
            _ = session.cancelled() => false,
        };
        if !accepted {
            debug!("Session {}: feed closed at unit {}/{total}", session.id(), i + 1);
            return;
        }
    }

    tokio::select! {
        _ = feed.close() => {}
        _ = session.cancelled() => {}
    }
}

struct Collector {
    queue: Arc<ChunkQueue>,
    sessions: Arc<SessionRegistry>,
    player: Arc<PlaybackController>,
    also_play: bool,
}

impl Collector {
    /// Append chunks in arrival order. Returns the error that ended the session, if any.
    async fn run(&self, session: &StreamingSession, mut chunks: ChunkStream) -> Option<SynthesisError> {
        loop {
            let next = tokio::select! {
                next = chunks.next() => next,
                _ = session.cancelled() => return None,
            };
            let Some(SynthesizedUnit { unit, result }) = next else {
                return None;
            };

            match result {
                Ok(audio) => {
                    if !self.append(session, audio, unit) {
                        return None;
                    }
                }
                Err(e) if e.is_terminal() => {
                    warn!("Session {} aborted: {e}", session.id());
                    return Some(e);
                }
                Err(e) => {
                    warn!("Session {}: skipping unit {unit}: {e}", session.id());
                    session.record_failed_unit();
                }
            }
        }
    }

    /// False once this session may no longer append.
    fn append(&self, session: &StreamingSession, audio: SynthesizedAudio, unit: usize) -> bool {
        if audio.is_empty() {
            debug!("Session {}: unit {unit} produced no audio", session.id());
            return true;
        }

        let duration = audio.duration();
        match self.sessions.append(session, &self.queue, audio, unit) {
            Ok(Some(index)) => {
                debug!(
                    "Session {}: chunk {index} (unit {unit}) ready ({:.1}s)",
                    session.id(),
                    duration.as_secs_f32()
                );
                if index == 0
                    && self.also_play
                    && !session.is_cancelled()
                    && self.player.status() == PlaybackStatus::Stopped
                {
                    if let Err(e) = self.player.play(0) {
                        warn!("Session {}: could not start playback: {e}", session.id());
                    }
                }
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!("Session {}: {e}", session.id());
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::narrator::error::PlaybackError;
    use crate::narrator::synth::OneShotSynthesizer;
    use crate::narrator::testing::{wait_until, RecordingOutput, ScriptedStream, ScriptedSynth};

    struct Rig {
        queue: Arc<ChunkQueue>,
        output: RecordingOutput,
        player: Arc<PlaybackController>,
        coordinator: StreamCoordinator,
    }

    fn rig(synth: Arc<ScriptedSynth>, unit: StreamUnit) -> Rig {
        let backend: Arc<dyn OneShotSynthesizer> = synth;
        rig_with(ChunkSynthesizer::OneShot(backend), unit)
    }

    fn rig_with(synth: ChunkSynthesizer, unit: StreamUnit) -> Rig {
        let queue = Arc::new(ChunkQueue::new());
        let sessions = Arc::new(SessionRegistry::new());
        let output = RecordingOutput::new();
        let player = PlaybackController::new(
            queue.clone(),
            sessions.clone(),
            Arc::new(output.clone()),
            1.0,
        );
        let coordinator = StreamCoordinator::new(
            synth,
            queue.clone(),
            sessions,
            player.clone(),
            StreamSettings {
                unit,
                ..StreamSettings::default()
            },
        );
        Rig {
            queue,
            output,
            player,
            coordinator,
        }
    }

    fn sentences(list: &[&str]) -> StreamInput {
        StreamInput::Sentences(list.iter().map(|s| s.to_string()).collect())
    }

    fn options(also_play: bool) -> StreamOptions {
        StreamOptions {
            also_play,
            voice: "am_onyx".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn playback_overlaps_production() {
        let synth = Arc::new(ScriptedSynth::new().with_delay(Duration::from_millis(50)));
        let rig = rig(synth.clone(), StreamUnit::Sentence);

        let session = rig
            .coordinator
            .start_streaming(sentences(&["One.", "Two.", "Three."]), options(true))
            .await
            .unwrap();

        assert!(wait_until(|| session.is_finished()
            && rig.player.status() == PlaybackStatus::Stopped)
        .await);

        let first_sound = rig.output.started_at(0).unwrap();
        let last_synth = synth.finished_at()[2];
        assert!(first_sound < last_synth);

        assert!(session.is_complete());
        assert_eq!(rig.player.current_index(), 0);
        assert_eq!(rig.queue.len(), 3);
        assert_eq!(rig.output.started(), vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn stream_only_then_play_from_middle() {
        let synth = Arc::new(ScriptedSynth::new().with_delay(Duration::from_millis(10)));
        let rig = rig(synth, StreamUnit::Sentence);

        let session = rig
            .coordinator
            .start_streaming(sentences(&["A.", "B.", "C.", "D.", "E."]), options(false))
            .await
            .unwrap();
        assert!(session.finished().await.is_ok());
        assert!(rig.output.started().is_empty());
        assert_eq!(rig.player.status(), PlaybackStatus::Stopped);

        rig.player.play(2).unwrap();
        assert!(wait_until(|| rig.player.status() == PlaybackStatus::Stopped).await);
        assert_eq!(rig.output.started(), vec![2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn new_stream_supersedes_in_flight_one() {
        let synth = Arc::new(ScriptedSynth::new().with_delay(Duration::from_millis(50)));
        let rig = rig(synth, StreamUnit::Sentence);
        let first = ["The first story begins here.", "It goes on for a while."];
        let second = ["B1.", "B two.", "B three."];

        let a = rig
            .coordinator
            .start_streaming(sentences(&first), options(false))
            .await
            .unwrap();
        let b = rig
            .coordinator
            .start_streaming(sentences(&second), options(false))
            .await
            .unwrap();

        let summary = b.finished().await.unwrap();
        assert_eq!(summary.chunks, 3);
        assert!(a.is_cancelled());
        assert!(a.finished().await.unwrap().cancelled);

        // Give the superseded backend time to deliver whatever it had in flight.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(rig.queue.len(), 3);
        for (i, text) in second.iter().enumerate() {
            let chunk = rig.queue.get(i).unwrap();
            assert_eq!(chunk.samples()[0], text.len() as f32);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_backend_fails_start() {
        let synth = Arc::new(ScriptedSynth::new().unavailable());
        let rig = rig(synth, StreamUnit::Sentence);

        let err = rig
            .coordinator
            .start_streaming(sentences(&["Hello."]), options(true))
            .await
            .err();
        assert!(matches!(
            err,
            Some(StreamError::Synthesis(SynthesisError::Unavailable(_)))
        ));

        let session = rig.coordinator.current_session().unwrap();
        assert!(session.error().is_some());
        assert!(!rig.coordinator.is_streaming());
        assert!(!rig.queue.is_producing());
        assert_eq!(rig.player.play(0), Err(PlaybackError::NoAudioAvailable));
    }

    #[tokio::test(start_paused = true)]
    async fn backend_lost_mid_stream_ends_session_with_error() {
        let synth = Arc::new(ScriptedSynth::new().unavailable_mid_stream());
        let rig = rig(synth, StreamUnit::Sentence);

        let session = rig
            .coordinator
            .start_streaming(sentences(&["One.", "Two."]), options(true))
            .await
            .unwrap();

        assert!(session.finished().await.is_err());
        assert!(!session.is_complete());
        assert!(rig.queue.is_empty());
        assert_eq!(rig.player.status(), PlaybackStatus::Stopped);
        assert!(rig.output.started().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn interrupted_and_silent_units_are_skipped() {
        let synth = Arc::new(
            ScriptedSynth::new()
                .failing_on("Bad one.")
                .silent_on("Quiet."),
        );
        let rig = rig(synth, StreamUnit::Sentence);

        let session = rig
            .coordinator
            .start_streaming(
                sentences(&["Good one.", "Bad one.", "Quiet.", "Good two."]),
                options(false),
            )
            .await
            .unwrap();

        let summary = session.finished().await.unwrap();
        assert_eq!(summary.chunks, 2);
        assert_eq!(summary.failed_units, 1);
        assert!(session.is_complete());
        assert_eq!(rig.queue.get(1).unwrap().samples()[0], "Good two.".len() as f32);
    }

    #[tokio::test(start_paused = true)]
    async fn chunks_remember_their_sentence_after_skips() {
        let synth = Arc::new(ScriptedSynth::new().failing_on("Bad.").silent_on("Hush."));
        let rig = rig(synth, StreamUnit::Sentence);
        let input = ["A.", "Bad.", "", "Hush.", "Cee longer."];

        let session = rig
            .coordinator
            .start_streaming(sentences(&input), options(false))
            .await
            .unwrap();
        session.finished().await.unwrap();

        assert_eq!(rig.queue.len(), 2);
        let units: Vec<usize> = (0..2).map(|i| rig.queue.get(i).unwrap().unit_index()).collect();
        assert_eq!(units, vec![0, 4]);
        let last = rig.queue.get(1).unwrap();
        assert_eq!(last.samples()[0], input[last.unit_index()].len() as f32);
    }

    #[tokio::test(start_paused = true)]
    async fn all_blank_sentences_are_rejected() {
        let rig = rig(Arc::new(ScriptedSynth::new()), StreamUnit::Sentence);
        let err = rig
            .coordinator
            .start_streaming(sentences(&["", "  "]), options(true))
            .await
            .err();
        assert_eq!(err, Some(StreamError::EmptyInput));
    }

    #[tokio::test(start_paused = true)]
    async fn token_feed_is_segmented_into_sentences() {
        let synth = Arc::new(ScriptedSynth::new());
        let rig = rig(synth.clone(), StreamUnit::Token);

        let session = rig
            .coordinator
            .start_streaming(StreamInput::Text("Rent went up. I moved out.".into()), options(false))
            .await
            .unwrap();

        session.finished().await.unwrap();
        assert_eq!(synth.spoken(), vec!["Rent went up.", "I moved out."]);
        assert_eq!(rig.queue.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_drops_unfinished_token_sentence() {
        let synth = Arc::new(ScriptedSynth::new());
        let rig = rig(synth.clone(), StreamUnit::Token);

        let session = rig
            .coordinator
            .start_streaming(
                StreamInput::Text("one two three four five six seven eight".into()),
                options(false),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(rig.coordinator.cancel());
        assert!(session.finished().await.unwrap().cancelled);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(synth.spoken().is_empty());
        assert!(rig.queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn native_streaming_backend_feeds_playback() {
        let synth = Arc::new(ScriptedStream::new(&[30, 5, 120, 10]));
        let backend: Arc<dyn StreamingSynthesizer> = synth.clone();
        let rig = rig_with(ChunkSynthesizer::Streaming(backend), StreamUnit::Sentence);
        let input = ["One.", "", "Three is longer.", "Four.", "Five."];

        let session = rig
            .coordinator
            .start_streaming(sentences(&input), options(true))
            .await
            .unwrap();
        assert!(wait_until(|| session.is_finished()
            && rig.player.status() == PlaybackStatus::Stopped)
        .await);

        assert!(session.is_complete());
        assert_eq!(synth.spoken(), vec!["One.", "Three is longer.", "Four.", "Five."]);
        assert_eq!(rig.output.started(), vec![0, 1, 2, 3]);
        assert_eq!(rig.output.max_live(), 1);
        let units: Vec<usize> = (0..4).map(|i| rig.queue.get(i).unwrap().unit_index()).collect();
        assert_eq!(units, vec![0, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn native_streaming_backend_is_superseded() {
        let synth = Arc::new(ScriptedStream::new(&[80]));
        let backend: Arc<dyn StreamingSynthesizer> = synth.clone();
        let rig = rig_with(ChunkSynthesizer::Streaming(backend), StreamUnit::Sentence);

        let a = rig
            .coordinator
            .start_streaming(sentences(&["Old one.", "Old two.", "Old three."]), options(false))
            .await
            .unwrap();
        assert!(wait_until(|| rig.queue.len() == 1).await);
        let b = rig
            .coordinator
            .start_streaming(sentences(&["New.", "Newer."]), options(false))
            .await
            .unwrap();

        assert!(a.finished().await.unwrap().cancelled);
        assert_eq!(b.finished().await.unwrap().chunks, 2);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(rig.queue.len(), 2);
        assert_eq!(rig.queue.get(0).unwrap().samples()[0], "New.".len() as f32);
        assert_eq!(rig.queue.get(1).unwrap().samples()[0], "Newer.".len() as f32);
    }

    #[tokio::test(start_paused = true)]
    async fn seek_past_produced_chunks_clamps_without_waiting() {
        let synth = Arc::new(ScriptedSynth::new().with_delay(Duration::from_millis(50)));
        let rig = rig(synth, StreamUnit::Sentence);

        let session = rig
            .coordinator
            .start_streaming(
                sentences(&["One.", "Two.", "Three.", "Four.", "Five.", "Six."]),
                options(false),
            )
            .await
            .unwrap();
        assert!(wait_until(|| rig.queue.len() == 2).await);
        assert!(rig.queue.is_producing());

        assert_eq!(rig.player.seek(10), Ok(1));
        assert_eq!(rig.player.current_index(), 1);
        assert_eq!(rig.player.status(), PlaybackStatus::Playing);
        assert!(!session.is_finished());

        assert!(wait_until(|| !rig.output.started().is_empty()).await);
        assert_eq!(rig.output.started()[0], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn blank_input_is_rejected_without_touching_state() {
        let rig = rig(Arc::new(ScriptedSynth::new()), StreamUnit::Sentence);
        let err = rig
            .coordinator
            .start_streaming(StreamInput::Text("  \n".into()), options(true))
            .await
            .err();

        assert_eq!(err, Some(StreamError::EmptyInput));
        assert!(rig.coordinator.current_session().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_ends_stream_and_discards_audio() {
        let synth = Arc::new(ScriptedSynth::new().with_delay(Duration::from_millis(50)));
        let rig = rig(synth, StreamUnit::Sentence);

        let session = rig
            .coordinator
            .start_streaming(sentences(&["One.", "Two.", "Three.", "Four."]), options(true))
            .await
            .unwrap();
        assert!(wait_until(|| rig.queue.len() >= 2).await);

        rig.player.stop();
        let summary = session.finished().await.unwrap();
        assert!(summary.cancelled);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(rig.queue.is_empty());
        assert_eq!(rig.player.status(), PlaybackStatus::Stopped);
        assert_eq!(rig.output.live(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_keeps_produced_audio_playable() {
        let synth = Arc::new(ScriptedSynth::new().with_delay(Duration::from_millis(50)));
        let rig = rig(synth, StreamUnit::Sentence);

        let session = rig
            .coordinator
            .start_streaming(sentences(&["One.", "Two.", "Three.", "Four."]), options(false))
            .await
            .unwrap();
        assert!(wait_until(|| rig.queue.len() == 2).await);

        assert!(rig.coordinator.cancel());
        session.finished().await.unwrap();
        assert!(!rig.coordinator.is_streaming());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(rig.queue.len(), 2);
        rig.player.play(0).unwrap();
        assert!(wait_until(|| rig.player.status() == PlaybackStatus::Stopped).await);
        assert_eq!(rig.output.started(), vec![0, 1]);
    }
}
