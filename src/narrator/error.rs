//! Error taxonomy for synthesis, queueing, playback and streaming.

use thiserror::Error;

/// Failures raised by a synthesis backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SynthesisError {
    /// The backend cannot be used at all (missing model, program or hardware).
    #[error("synthesis unavailable: {0}")]
    Unavailable(String),

    /// The backend failed while synthesizing one unit; the unit is discarded.
    #[error("synthesis interrupted: {0}")]
    Interrupted(String),

    #[error("cannot synthesize empty text")]
    EmptyText,
}

impl SynthesisError {
    /// Whether the owning session has to give up entirely.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("no chunk at index {index} (queue holds {len})")]
    NotFound { index: usize, len: usize },

    #[error("chunk index {got} is not contiguous, expected {expected}")]
    NonContiguous { expected: usize, got: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlaybackError {
    #[error("no audio available")]
    NoAudioAvailable,

    #[error("invalid seek index {0}")]
    InvalidSeekIndex(i64),

    #[error("audio output failed: {0}")]
    Output(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error(transparent)]
    Synthesis(#[from] SynthesisError),

    #[error("nothing to stream")]
    EmptyInput,
}
