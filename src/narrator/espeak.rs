//! System speech backend: one `espeak-ng --stdout` process per unit.

use std::io::{Cursor, ErrorKind};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::chunk::SynthesizedAudio;
use super::error::SynthesisError;
use super::synth::{ChunkResult, OneShotSynthesizer};
use crate::config::TTSConfig;

pub struct EspeakSynthesizer {
    program: String,
    wpm: u32,
}

impl EspeakSynthesizer {
    pub fn new(program: impl Into<String>, wpm: u32) -> Self {
        Self {
            program: program.into(),
            wpm,
        }
    }

    pub fn from_config(config: &TTSConfig) -> Self {
        Self::new(&config.espeak_program, config.espeak_wpm)
    }

    async fn run(&self, args: &[&str]) -> Result<Vec<u8>, SynthesisError> {
        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound | ErrorKind::PermissionDenied => {
                    SynthesisError::Unavailable(format!("cannot run {}: {e}", self.program))
                }
                _ => SynthesisError::Interrupted(format!("{} failed to start: {e}", self.program)),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SynthesisError::Interrupted(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl OneShotSynthesizer for EspeakSynthesizer {
    fn name(&self) -> &str {
        "espeak"
    }

    async fn probe(&self, voice: &str) -> Result<(), SynthesisError> {
        let voices = self.run(&["--voices"]).await?;
        let listing = String::from_utf8_lossy(&voices);
        if !listing.lines().skip(1).any(|line| lists_voice(line, voice)) {
            return Err(SynthesisError::Unavailable(format!("Voice not found: {voice}")));
        }
        Ok(())
    }

    async fn synthesize(&self, text: &str, voice: &str) -> ChunkResult {
        let text = text.trim();
        if text.is_empty() {
            return Err(SynthesisError::EmptyText);
        }

        let wpm = self.wpm.to_string();
        // "--" keeps text starting with '-' from being read as a flag
        let wav = self
            .run(&["--stdout", "-v", voice, "-s", &wpm, "--", text])
            .await?;
        let audio = decode_wav(&wav)?;
        debug!(
            "espeak produced {} samples at {}Hz",
            audio.samples.len(),
            audio.sample_rate
        );
        Ok(audio)
    }
}

/// Whether one row of `espeak-ng --voices` names `voice` (by language or name).
fn lists_voice(line: &str, voice: &str) -> bool {
    let fields: Vec<&str> = line.split_whitespace().collect();
    // Pty Language Age/Gender VoiceName File Other
    fields.get(1).is_some_and(|lang| lang.eq_ignore_ascii_case(voice))
        || fields.get(3).is_some_and(|name| name.eq_ignore_ascii_case(voice))
        || fields.get(4).is_some_and(|file| file.eq_ignore_ascii_case(voice))
}

/// Decode mono 16-bit WAV from espeak's stdout.
///
/// espeak writes a streaming header with placeholder sizes, so a truncated
/// final sample is tolerated rather than treated as corruption.
fn decode_wav(bytes: &[u8]) -> Result<SynthesizedAudio, SynthesisError> {
    let reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| SynthesisError::Interrupted(format!("Invalid WAV from espeak: {e}")))?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let samples: Vec<f32> = reader
        .into_samples::<i16>()
        .map_while(Result::ok)
        .step_by(channels)
        .map(|s| s as f32 / i16::MAX as f32)
        .collect();

    Ok(SynthesizedAudio::new(samples, spec.sample_rate))
}
