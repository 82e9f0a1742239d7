//! Synthesized audio and the indexed chunks the queue holds.

use std::time::Duration;

/// Sample rate used when a backend does not report one (Kokoro's native rate).
pub const DEFAULT_SAMPLE_RATE: u32 = 24000;

/// Raw output of one synthesis unit: mono f32 samples plus their rate.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesizedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl SynthesizedAudio {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration(&self) -> Duration {
        samples_duration(self.samples.len(), self.sample_rate)
    }
}

/// One playable unit at a fixed position in the session.
///
/// `source_index` is the chunk's place in the queue. `unit_index` is the
/// sentence it was synthesized from; the two drift apart once a sentence
/// fails or comes back silent.
///
/// Immutable once built; the queue hands out shared references.
#[derive(Debug, PartialEq)]
pub struct AudioChunk {
    samples: Vec<f32>,
    sample_rate: u32,
    source_index: usize,
    unit_index: usize,
}

impl AudioChunk {
    pub fn new(audio: SynthesizedAudio, source_index: usize) -> Self {
        Self {
            samples: audio.samples,
            sample_rate: audio.sample_rate,
            source_index,
            unit_index: source_index,
        }
    }

    pub fn with_unit(mut self, unit_index: usize) -> Self {
        self.unit_index = unit_index;
        self
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn source_index(&self) -> usize {
        self.source_index
    }

    pub fn unit_index(&self) -> usize {
        self.unit_index
    }

    pub fn duration(&self) -> Duration {
        samples_duration(self.samples.len(), self.sample_rate)
    }
}

fn samples_duration(len: usize, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    let nanos = len as u128 * 1_000_000_000 / sample_rate as u128;
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}
