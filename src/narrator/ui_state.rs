//! Read-only projection of playback state for presentation layers.

use std::sync::Arc;
use serde::Serialize;

use super::player::{PlaybackController, PlaybackStatus};
use super::queue::ChunkQueue;
use super::session::SessionRegistry;

/// Words read aloud per second, used for estimates before audio exists.
const WORDS_PER_SECOND: f64 = 3.8;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaybackView {
    pub status: PlaybackStatus,
    pub current_index: usize,
    /// Sentence the chunk at `current_index` was read from, for highlighting.
    pub current_unit: Option<usize>,
    pub total_chunks: usize,
    pub is_still_streaming: bool,
    /// Whole seconds of audio before the playback position, at 1x.
    pub elapsed: u64,
    /// Whole seconds of audio queued so far, at 1x.
    pub total: u64,
    pub speed: f32,
    pub error: Option<String>,
}

impl PlaybackView {
    pub fn clock(&self) -> String {
        format!(
            "{} / {}",
            format_clock(self.elapsed),
            format_clock(self.total)
        )
    }
}

/// Polls the live components and reports only views that changed.
pub struct UiStateTracker {
    player: Arc<PlaybackController>,
    queue: Arc<ChunkQueue>,
    sessions: Arc<SessionRegistry>,
    last: Option<PlaybackView>,
}

impl UiStateTracker {
    pub fn new(
        player: Arc<PlaybackController>,
        queue: Arc<ChunkQueue>,
        sessions: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            player,
            queue,
            sessions,
            last: None,
        }
    }

    pub fn snapshot(&self) -> PlaybackView {
        let current_index = self.player.current_index();
        let mut elapsed = self.queue.duration_before(current_index);
        if let Some((index, position)) = self.player.sounding_progress() {
            if index == current_index {
                let chunk_len = self
                    .queue
                    .get(index)
                    .map(|c| c.duration())
                    .unwrap_or_default();
                elapsed += position.min(chunk_len);
            }
        }

        let session = self.sessions.current();
        PlaybackView {
            status: self.player.status(),
            current_index,
            current_unit: self.queue.get(current_index).ok().map(|c| c.unit_index()),
            total_chunks: self.queue.len(),
            is_still_streaming: session.as_ref().is_some_and(|s| !s.is_finished()),
            elapsed: elapsed.as_secs(),
            total: self.queue.total_duration().as_secs(),
            speed: self.player.speed(),
            error: session.and_then(|s| s.error()).map(|e| e.to_string()),
        }
    }

    /// The current view, or `None` if nothing changed since the last poll.
    pub fn poll(&mut self) -> Option<PlaybackView> {
        let view = self.snapshot();
        if self.last.as_ref() == Some(&view) {
            return None;
        }
        self.last = Some(view.clone());
        Some(view)
    }
}

/// `m:ss`
pub fn format_clock(secs: u64) -> String {
    format!("{}:{:02}", secs / 60, secs % 60)
}

pub fn reading_time_secs(text: &str) -> u64 {
    let words = text.split_whitespace().count();
    (words as f64 / WORDS_PER_SECOND).ceil() as u64
}

/// Human estimate like "42 sec", "1:05m" or "2m".
pub fn format_reading_time(text: &str) -> String {
    let secs = reading_time_secs(text);
    if secs < 60 {
        return format!("{secs} sec");
    }
    match (secs / 60, secs % 60) {
        (minutes, 0) => format!("{minutes}m"),
        (minutes, seconds) => format!("{minutes}:{seconds:02}m"),
    }
}
