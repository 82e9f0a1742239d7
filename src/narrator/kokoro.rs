//! Kokoro neural backend: text → phonemes → ONNX inference → f32 audio (24kHz).
//!
//! Pipeline per unit:
//! 1. Sentence → phonemes (misaki-rs G2P)
//! 2. Phonemes → token IDs (tokenizer.json vocabulary)
//! 3. Token IDs + voice style + speed → ONNX inference → samples
//!
//! The model is loaded on first use, on the blocking pool. A load failure
//! makes the backend permanently unavailable for this process.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use ndarray::{Array2, Array3};
use ndarray_npy::NpzReader;
use ort::value::Tensor;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::chunk::{SynthesizedAudio, DEFAULT_SAMPLE_RATE};
use super::error::SynthesisError;
use super::synth::{ChunkResult, OneShotSynthesizer};
use crate::config::TTSConfig;

const MAX_TOKENS: usize = 510; // Voice style array first dimension
const STYLE_DIM: usize = 256;
/// Speech rate fed to the model. Playback speed is applied at the output.
const MODEL_SPEED: f32 = 1.0;

#[derive(Debug, Clone)]
pub struct KokoroPaths {
    pub model: PathBuf,
    pub voices: PathBuf,
    pub tokenizer: PathBuf,
}

impl KokoroPaths {
    /// Configured paths, falling back to the stock file names in the working directory.
    pub fn from_config(config: &TTSConfig) -> Self {
        let base_dir = std::env::current_dir().unwrap_or_default();
        let pick = |configured: &str, default: &str| {
            if configured.is_empty() {
                base_dir.join(default)
            } else {
                PathBuf::from(configured)
            }
        };

        Self {
            model: pick(&config.model_path, "kokoro-v1.0.onnx"),
            voices: pick(&config.voices_path, "voices-v1.0.bin"),
            tokenizer: pick(&config.tokenizer_path, "tokenizer.json"),
        }
    }
}

struct KokoroModel {
    // ort 2.0 Session::run needs &mut
    session: Mutex<ort::session::Session>,
    phonemizer: misaki_rs::G2P,
    vocab: HashMap<char, i64>,
    /// name → style vectors indexed by token count, shape (510, 256)
    voices: HashMap<String, Array2<f32>>,
}

pub struct KokoroSynthesizer {
    paths: KokoroPaths,
    model: OnceCell<Result<Arc<KokoroModel>, SynthesisError>>,
}

impl KokoroSynthesizer {
    pub fn new(paths: KokoroPaths) -> Self {
        Self {
            paths,
            model: OnceCell::new(),
        }
    }

    async fn model(&self) -> Result<Arc<KokoroModel>, SynthesisError> {
        self.model
            .get_or_init(|| {
                let paths = self.paths.clone();
                async move {
                    tokio::task::spawn_blocking(move || load_model(&paths))
                        .await
                        .map_err(|e| format!("model loader panicked: {e}"))
                        .and_then(|loaded| loaded)
                        .map(Arc::new)
                        .map_err(SynthesisError::Unavailable)
                }
            })
            .await
            .clone()
    }
}

#[async_trait]
impl OneShotSynthesizer for KokoroSynthesizer {
    fn name(&self) -> &str {
        "kokoro"
    }

    async fn probe(&self, voice: &str) -> Result<(), SynthesisError> {
        let model = self.model().await?;
        if !model.voices.contains_key(voice) {
            let mut known: Vec<&str> = model.voices.keys().map(String::as_str).collect();
            known.sort_unstable();
            return Err(SynthesisError::Unavailable(format!(
                "Voice not found: {voice} (available: {})",
                known.join(", ")
            )));
        }
        Ok(())
    }

    async fn synthesize(&self, text: &str, voice: &str) -> ChunkResult {
        if text.trim().is_empty() {
            return Err(SynthesisError::EmptyText);
        }
        let model = self.model().await?;
        let text = text.to_string();
        let voice = voice.to_string();

        tokio::task::spawn_blocking(move || {
            let t_gen = Instant::now();
            let samples = generate_audio(&model, &text, &voice, MODEL_SPEED)?;
            debug!(
                "Generated {} samples ({:.1}s) in {}ms",
                samples.len(),
                samples.len() as f32 / DEFAULT_SAMPLE_RATE as f32,
                t_gen.elapsed().as_millis()
            );
            Ok(SynthesizedAudio::new(samples, DEFAULT_SAMPLE_RATE))
        })
        .await
        .map_err(|e| SynthesisError::Interrupted(format!("generation task failed: {e}")))?
    }
}

/// Load the ONNX model, tokenizer, voices, and phonemizer. Blocking.
fn load_model(paths: &KokoroPaths) -> Result<KokoroModel, String> {
    let t0 = Instant::now();

    info!("Loading tokenizer from {}", paths.tokenizer.display());
    let vocab = load_tokenizer(&paths.tokenizer)?;
    info!("Tokenizer loaded: {} tokens", vocab.len());

    info!("Loading voices from {}", paths.voices.display());
    let voices = load_voices(&paths.voices)?;
    info!("Loaded {} voices", voices.len());

    info!("Loading ONNX model from {}", paths.model.display());
    let session = ort::session::Session::builder()
        .map_err(|e| format!("Failed to create ONNX session builder: {e}"))?
        .with_optimization_level(ort::session::builder::GraphOptimizationLevel::Level3)
        .map_err(|e| format!("Failed to set optimization level: {e}"))?
        .with_intra_threads(4)
        .map_err(|e| format!("Failed to set thread count: {e}"))?
        .commit_from_file(&paths.model)
        .map_err(|e| format!("Failed to load ONNX model: {e}"))?;

    let phonemizer = misaki_rs::G2P::new(misaki_rs::Language::EnglishUS);

    info!("Kokoro loaded in {}ms", t0.elapsed().as_millis());
    Ok(KokoroModel {
        session: Mutex::new(session),
        phonemizer,
        vocab,
        voices,
    })
}

/// Map phonemes to vocabulary IDs, padded with 0 on both ends.
fn tokenize(phonemes: &str, vocab: &HashMap<char, i64>) -> Vec<i64> {
    let mut token_ids: Vec<i64> = Vec::with_capacity(phonemes.len() + 2);
    token_ids.push(0);
    // Unknown characters are skipped
    token_ids.extend(phonemes.chars().filter_map(|ch| vocab.get(&ch).copied()));
    token_ids.push(0);
    token_ids.truncate(MAX_TOKENS);
    token_ids
}

fn generate_audio(
    model: &KokoroModel,
    text: &str,
    voice: &str,
    speed: f32,
) -> Result<Vec<f32>, SynthesisError> {
    let interrupted = SynthesisError::Interrupted;

    let (phonemes, _tokens) = model
        .phonemizer
        .g2p(text)
        .map_err(|e| interrupted(format!("Phonemization failed: {e}")))?;
    if phonemes.is_empty() {
        return Ok(Vec::new());
    }

    let token_ids = tokenize(&phonemes, &model.vocab);
    let n_tokens = token_ids.len();

    let styles = model
        .voices
        .get(voice)
        .ok_or_else(|| SynthesisError::Unavailable(format!("Voice not found: {voice}")))?;
    // Style row is chosen by token count, clamped to the table
    let style_idx = n_tokens.saturating_sub(2).min(styles.nrows().saturating_sub(1));
    let style_vec: Vec<f32> = styles.row(style_idx).to_vec();

    let tokens_tensor = Array2::from_shape_vec((1, n_tokens), token_ids)
        .map_err(|e| interrupted(format!("Failed to create tokens tensor: {e}")))
        .and_then(|a| {
            Tensor::from_array(a).map_err(|e| interrupted(format!("Failed to create tokens ort tensor: {e}")))
        })?;
    let style_tensor = Array2::from_shape_vec((1, STYLE_DIM), style_vec)
        .map_err(|e| interrupted(format!("Failed to create style tensor: {e}")))
        .and_then(|a| {
            Tensor::from_array(a).map_err(|e| interrupted(format!("Failed to create style ort tensor: {e}")))
        })?;
    let speed_tensor = Tensor::from_array(ndarray::Array1::from_vec(vec![speed]))
        .map_err(|e| interrupted(format!("Failed to create speed ort tensor: {e}")))?;

    let mut session = model.session.lock().unwrap_or_else(PoisonError::into_inner);
    let outputs = session
        .run(ort::inputs![
            "tokens" => tokens_tensor,
            "style" => style_tensor,
            "speed" => speed_tensor
        ])
        .map_err(|e| interrupted(format!("ONNX inference failed: {e}")))?;

    // ort 2.0: try_extract_tensor returns (&Shape, &[T])
    let (_name, first_output) = outputs
        .iter()
        .next()
        .ok_or_else(|| interrupted("No output tensor from model".into()))?;
    let (_shape, audio) = first_output
        .try_extract_tensor::<f32>()
        .map_err(|e| interrupted(format!("Failed to extract audio tensor: {e}")))?;

    Ok(audio.to_vec())
}

/// Load tokenizer vocabulary from tokenizer.json.
fn load_tokenizer(path: &Path) -> Result<HashMap<char, i64>, String> {
    let contents =
        fs::read_to_string(path).map_err(|e| format!("Failed to read tokenizer: {e}"))?;
    parse_vocab(&contents)
}

fn parse_vocab(contents: &str) -> Result<HashMap<char, i64>, String> {
    let data: serde_json::Value = serde_json::from_str(contents)
        .map_err(|e| format!("Failed to parse tokenizer JSON: {e}"))?;

    let vocab = data["model"]["vocab"]
        .as_object()
        .ok_or("Missing model.vocab in tokenizer.json")?;

    let mut map = HashMap::new();
    for (token, id) in vocab {
        let id = id.as_i64().ok_or("Token ID is not an integer")?;
        // Each token should be a single character
        if let Some(ch) = token.chars().next() {
            map.insert(ch, id);
        }
    }
    Ok(map)
}

/// Load all voice styles from an NPZ file.
fn load_voices(path: &Path) -> Result<HashMap<String, Array2<f32>>, String> {
    let file = fs::File::open(path).map_err(|e| format!("Failed to open voices file: {e}"))?;
    let mut npz =
        NpzReader::new(file).map_err(|e| format!("Failed to read NPZ voices file: {e}"))?;

    let names: Vec<String> = npz
        .names()
        .map_err(|e| format!("Failed to list NPZ entries: {e}"))?
        .into_iter()
        .map(|n| n.trim_end_matches(".npy").to_string())
        .collect();

    let mut voices = HashMap::new();
    for name in names {
        let arr: Array3<f32> = npz
            .by_name(&format!("{name}.npy"))
            .map_err(|e| format!("Failed to read voice '{name}': {e}"))?;

        // (510, 1, 256) → (510, 256)
        let (dim0, dim2) = (arr.shape()[0], arr.shape()[2]);
        let styles = arr
            .into_shape_with_order((dim0, dim2))
            .map_err(|e| format!("Failed to reshape voice '{name}': {e}"))?;
        voices.insert(name, styles);
    }
    Ok(voices)
}
