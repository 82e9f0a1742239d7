//! HTTP control API for presentation layers.
//!
//! A local page (or script) polls `GET /status` and issues transport
//! commands. Runs on port 8768 (configurable) using axum.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::stream::StreamInput;
use super::ui_state::PlaybackView;
use super::Narrator;

#[derive(Clone)]
pub struct ControlApiState {
    pub narrator: Arc<Narrator>,
}

// --- Request/Response types ---

#[derive(Deserialize)]
struct StreamRequest {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    sentences: Option<Vec<String>>,
    #[serde(default = "default_also_play")]
    also_play: bool,
    #[serde(default)]
    voice: Option<String>,
}

fn default_also_play() -> bool {
    true
}

#[derive(Deserialize)]
struct IndexRequest {
    index: i64,
}

#[derive(Deserialize)]
struct SpeedRequest {
    #[serde(default)]
    speed: Option<f32>,
}

#[derive(Serialize)]
struct SimpleResponse {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    speed: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    session: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl SimpleResponse {
    fn ok(status: &str) -> Self {
        Self {
            status: status.into(),
            index: None,
            speed: None,
            session: None,
            error: None,
        }
    }

    fn err(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::ok("error")
        }
    }

    fn from_result<E: std::fmt::Display>(status: &str, result: Result<(), E>) -> Self {
        match result {
            Ok(()) => Self::ok(status),
            Err(e) => Self::err(e.to_string()),
        }
    }
}

/// Build the axum router.
pub fn router(state: ControlApiState) -> Router {
    Router::new()
        .route("/status", get(handle_status))
        .route("/stream", post(handle_stream))
        .route("/play", post(handle_play))
        .route("/pause", post(handle_pause))
        .route("/resume", post(handle_resume))
        .route("/toggle", post(handle_toggle))
        .route("/seek", post(handle_seek))
        .route("/stop", post(handle_stop))
        .route("/cancel", post(handle_cancel))
        .route("/speed", post(handle_speed))
        .with_state(state)
}

/// Start the control API as a background tokio task.
pub async fn start_control_api(state: ControlApiState, port: u16) {
    let app = router(state);
    let addr = format!("127.0.0.1:{port}");
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            warn!("Failed to bind control API on {addr}: {e}");
            return;
        }
    };
    info!("Control API listening on {addr}");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!("Control API server error: {e}");
        }
    });
}

// --- Handlers ---

async fn handle_status(State(state): State<ControlApiState>) -> Json<PlaybackView> {
    Json(state.narrator.view())
}

async fn handle_stream(
    State(state): State<ControlApiState>,
    Json(req): Json<StreamRequest>,
) -> Json<SimpleResponse> {
    let input = match (req.sentences, req.text) {
        (Some(sentences), _) => {
            state.narrator.load_content(&sentences);
            StreamInput::Sentences(sentences)
        }
        (None, Some(text)) => StreamInput::Text(text),
        (None, None) => return Json(SimpleResponse::err("text or sentences required")),
    };

    info!("HTTP /stream (also_play={})", req.also_play);
    match state.narrator.stream(input, req.also_play, req.voice).await {
        Ok(session) => Json(SimpleResponse {
            session: Some(session.id()),
            ..SimpleResponse::ok("streaming")
        }),
        Err(e) => Json(SimpleResponse::err(e.to_string())),
    }
}

async fn handle_play(
    State(state): State<ControlApiState>,
    Json(req): Json<IndexRequest>,
) -> Json<SimpleResponse> {
    let Ok(from) = usize::try_from(req.index) else {
        return Json(SimpleResponse::err(format!("invalid index {}", req.index)));
    };
    let result = state.narrator.player().play(from);
    Json(SimpleResponse::from_result("playing", result))
}

async fn handle_pause(State(state): State<ControlApiState>) -> Json<SimpleResponse> {
    state.narrator.player().pause();
    Json(SimpleResponse::ok("paused"))
}

async fn handle_resume(State(state): State<ControlApiState>) -> Json<SimpleResponse> {
    let result = state.narrator.player().resume();
    Json(SimpleResponse::from_result("playing", result))
}

async fn handle_toggle(State(state): State<ControlApiState>) -> Json<SimpleResponse> {
    let player = state.narrator.player();
    match player.toggle() {
        Ok(()) => Json(SimpleResponse::ok(&player.status().to_string().to_lowercase())),
        Err(e) => Json(SimpleResponse::err(e.to_string())),
    }
}

async fn handle_seek(
    State(state): State<ControlApiState>,
    Json(req): Json<IndexRequest>,
) -> Json<SimpleResponse> {
    match state.narrator.player().seek(req.index) {
        Ok(index) => Json(SimpleResponse {
            index: Some(index),
            ..SimpleResponse::ok("playing")
        }),
        Err(e) => Json(SimpleResponse::err(e.to_string())),
    }
}

async fn handle_stop(State(state): State<ControlApiState>) -> Json<SimpleResponse> {
    state.narrator.player().stop();
    Json(SimpleResponse::ok("stopped"))
}

/// Stop synthesizing but keep what was already produced.
async fn handle_cancel(State(state): State<ControlApiState>) -> Json<SimpleResponse> {
    if state.narrator.coordinator().cancel() {
        Json(SimpleResponse::ok("cancelled"))
    } else {
        Json(SimpleResponse::ok("idle"))
    }
}

async fn handle_speed(
    State(state): State<ControlApiState>,
    req: Option<Json<SpeedRequest>>,
) -> Json<SimpleResponse> {
    let player = state.narrator.player();
    let speed = match req.and_then(|Json(r)| r.speed) {
        Some(speed) => player.set_speed(speed),
        None => player.cycle_speed(),
    };
    Json(SimpleResponse {
        speed: Some(speed),
        ..SimpleResponse::ok("ok")
    })
}
