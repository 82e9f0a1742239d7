//! Configuration management for narrator-rs.
//!
//! Loads config from YAML files in standard locations. Every section and
//! field is optional; anything missing takes its default.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::narrator::stream::{StreamSettings, StreamUnit};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TtsBackend {
    /// Kokoro ONNX neural model
    #[default]
    Kokoro,
    /// espeak-ng system speech
    Espeak,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TTSConfig {
    pub backend: TtsBackend,
    pub voice: String,
    pub model_path: String,
    pub voices_path: String,
    pub tokenizer_path: String,
    pub espeak_program: String,
    pub espeak_voice: String,
    pub espeak_wpm: u32,
}

impl Default for TTSConfig {
    fn default() -> Self {
        Self {
            backend: TtsBackend::Kokoro,
            voice: "am_onyx".into(),
            model_path: String::new(),
            voices_path: String::new(),
            tokenizer_path: String::new(),
            espeak_program: "espeak-ng".into(),
            espeak_voice: "en-us".into(),
            espeak_wpm: 175,
        }
    }
}

impl TTSConfig {
    /// Voice name understood by the selected backend.
    pub fn active_voice(&self) -> &str {
        match self.backend {
            TtsBackend::Kokoro => &self.voice,
            TtsBackend::Espeak => &self.espeak_voice,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub feed_delay_ms: u64,
    pub feed_capacity: usize,
    pub unit: StreamUnit,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            feed_delay_ms: 20,
            feed_capacity: 8,
            unit: StreamUnit::Sentence,
        }
    }
}

impl StreamingConfig {
    pub fn settings(&self) -> StreamSettings {
        StreamSettings {
            feed_delay: Duration::from_millis(self.feed_delay_ms),
            feed_capacity: self.feed_capacity.max(1),
            unit: self.unit,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub speed: f32,
    pub poll_interval_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            speed: 1.0,
            poll_interval_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8768,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub tts: TTSConfig,
    pub streaming: StreamingConfig,
    pub playback: PlaybackConfig,
    pub api: ApiConfig,
}

impl Config {
    /// Load configuration from YAML file.
    ///
    /// Searches standard locations if no path is provided:
    /// 1. ./config.yaml
    /// 2. ~/.config/narrator/config.yaml
    /// 3. /etc/narrator/config.yaml
    pub fn load(path: Option<&Path>) -> Self {
        let resolved = path.map(PathBuf::from).or_else(|| {
            let candidates = [
                std::env::current_dir().ok().map(|d| d.join("config.yaml")),
                dirs::home_dir().map(|h| h.join(".config/narrator/config.yaml")),
                Some(PathBuf::from("/etc/narrator/config.yaml")),
            ];
            candidates.into_iter().flatten().find(|p| p.exists())
        });

        let Some(config_path) = resolved else {
            info!("No config file found, using defaults");
            return Self::default();
        };

        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match Self::parse(&contents) {
                Ok(config) => {
                    info!("Loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {e}, using defaults", config_path.display());
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read {}: {e}, using defaults", config_path.display());
                Self::default()
            }
        }
    }

    pub fn parse(contents: &str) -> Result<Self, serde_yml::Error> {
        serde_yml::from_str(contents)
    }
}
