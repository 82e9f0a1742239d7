//! narrator-rs: streaming text-to-speech reader with resumable playback.

mod config;
mod narrator;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::TtsBackend;
use narrator::api::{start_control_api, ControlApiState};
use narrator::espeak::EspeakSynthesizer;
use narrator::kokoro::{KokoroPaths, KokoroSynthesizer};
use narrator::player::PlaybackStatus;
use narrator::sink::RodioOutput;
use narrator::splitter::split_sentences;
use narrator::stream::StreamInput;
use narrator::synth::ChunkSynthesizer;
use narrator::ui_state::{format_reading_time, PlaybackView};
use narrator::Narrator;

#[derive(Parser, Debug)]
#[command(name = "narrator-rs", about = "Streaming text-to-speech reader")]
struct Args {
    /// Text file to read aloud ("-" for stdin)
    file: Option<PathBuf>,

    /// Path to config.yaml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Synthesis backend
    #[arg(short, long, value_enum)]
    backend: Option<TtsBackend>,

    /// Voice for the selected backend
    #[arg(long)]
    voice: Option<String>,

    /// Do not start the control API
    #[arg(long)]
    no_api: bool,

    /// Synthesize without starting playback
    #[arg(long)]
    stream_only: bool,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging (suppress noisy ort internals)
    let filter = if args.verbose {
        EnvFilter::new("debug,ort=info")
    } else {
        EnvFilter::new("info,ort=warn")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("narrator-rs starting");

    let mut config = config::Config::load(args.config.as_deref());
    if let Some(backend) = args.backend {
        config.tts.backend = backend;
    }
    if let Some(voice) = args.voice {
        match config.tts.backend {
            TtsBackend::Kokoro => config.tts.voice = voice,
            TtsBackend::Espeak => config.tts.espeak_voice = voice,
        }
    }
    info!(
        "Backend: {:?} (voice: {})",
        config.tts.backend,
        config.tts.active_voice()
    );

    let synth = match config.tts.backend {
        TtsBackend::Kokoro => ChunkSynthesizer::OneShot(Arc::new(KokoroSynthesizer::new(
            KokoroPaths::from_config(&config.tts),
        ))),
        TtsBackend::Espeak => {
            ChunkSynthesizer::OneShot(Arc::new(EspeakSynthesizer::from_config(&config.tts)))
        }
    };

    let narrator = Arc::new(Narrator::new(
        synth,
        Arc::new(RodioOutput::new()),
        config.streaming.settings(),
        config.playback.speed,
        config.tts.active_voice(),
    ));

    let api_enabled = config.api.enabled && !args.no_api;
    if api_enabled {
        let state = ControlApiState {
            narrator: narrator.clone(),
        };
        start_control_api(state, config.api.port).await;
    }

    if let Some(path) = &args.file {
        let text = read_input(path).await?;
        let sentences: Vec<String> = split_sentences(&text)
            .into_iter()
            .map(str::to_string)
            .collect();
        info!(
            "Read {} sentences from {} (about {})",
            sentences.len(),
            path.display(),
            format_reading_time(&text)
        );

        narrator.load_content(&sentences);
        if let Err(e) = narrator
            .stream(StreamInput::Sentences(sentences), !args.stream_only, None)
            .await
        {
            warn!("Streaming failed: {e}");
            if !api_enabled {
                return Err(e.into());
            }
        }
    } else if !api_enabled {
        warn!("Nothing to read and control API disabled, exiting");
        return Ok(());
    }

    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Ctrl-C received, shutting down");
    };
    present(&narrator, config.playback.poll_interval_ms, api_enabled, ctrl_c).await;

    narrator.player().stop();
    info!("narrator-rs stopped");
    Ok(())
}

async fn read_input(path: &Path) -> std::io::Result<String> {
    if path == Path::new("-") {
        tokio::task::spawn_blocking(|| std::io::read_to_string(std::io::stdin())).await?
    } else {
        tokio::fs::read_to_string(path).await
    }
}

/// Log every changed view until `shutdown` resolves, or until everything is
/// done when no API client can start more work.
async fn present(
    narrator: &Narrator,
    poll_interval_ms: u64,
    keep_running: bool,
    shutdown: impl Future<Output = ()>,
) {
    let mut tracker = narrator.tracker();
    let mut poll_interval = tokio::time::interval(Duration::from_millis(poll_interval_ms.max(10)));
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = poll_interval.tick() => {
                if let Some(view) = tracker.poll() {
                    log_view(&view);
                }
                let idle = narrator.player().status() == PlaybackStatus::Stopped
                    && !narrator.coordinator().is_streaming();
                if idle && !keep_running {
                    break;
                }
            }
            _ = &mut shutdown => break,
        }
    }
}

fn log_view(view: &PlaybackView) {
    if let Some(error) = &view.error {
        warn!("{} | error: {error}", view.status);
        return;
    }

    let position = if view.total_chunks == 0 {
        0
    } else {
        (view.current_index + 1).min(view.total_chunks)
    };
    info!(
        "{} | chunk {position}/{}{} | {} | {}x",
        view.status,
        view.total_chunks,
        if view.is_still_streaming { "+" } else { "" },
        view.clock(),
        view.speed
    );
}
