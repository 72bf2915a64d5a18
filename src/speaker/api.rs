//! HTTP control API for the speech controller.
//!
//! Lets other local processes queue, cancel and configure speech while the
//! assistant runs. Binds to 127.0.0.1 only.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use super::controller::{Priority, Source, UtteranceId, UtteranceStatus};
use super::skill::SpeakSkill;
use crate::router::SpeechMode;
use crate::tts::{VoiceOptions, VoiceSettings};

#[derive(Clone)]
pub struct SpeechApiState {
    pub skill: SpeakSkill,
    pub speech_mode: SpeechMode,
}

// --- Request/Response types ---

#[derive(Deserialize)]
struct SpeakRequest {
    text: String,
    #[serde(default)]
    interrupt: bool,
    /// Hold the response until the utterance is terminal.
    #[serde(default)]
    wait: bool,
}

#[derive(Deserialize, Default)]
struct CancelRequest {
    #[serde(default)]
    id: Option<u64>,
}

#[derive(Deserialize)]
struct SpeechModeRequest {
    /// Absent toggles.
    #[serde(default)]
    enabled: Option<bool>,
}

#[derive(Serialize)]
struct StatusResponse {
    backend: String,
    speaking: Option<UtteranceId>,
    queued: usize,
    idle: bool,
    speech_mode: bool,
    settings: VoiceSettings,
    voices: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct ApiResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancelled: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speech_mode: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ApiResponse {
    fn ok(status: &str) -> Self {
        Self {
            status: status.into(),
            ..Self::default()
        }
    }

    fn err(message: impl Into<String>) -> Self {
        Self {
            status: "error".into(),
            error: Some(message.into()),
            ..Self::default()
        }
    }

    fn utterance(id: UtteranceId, status: &UtteranceStatus) -> Self {
        Self {
            id: Some(id.raw()),
            state: Some(status.state.to_string()),
            detail: status.detail.clone(),
            ..Self::ok("ok")
        }
    }
}

type Reply = (StatusCode, Json<ApiResponse>);

fn bad_request(message: impl Into<String>) -> Reply {
    (StatusCode::BAD_REQUEST, Json(ApiResponse::err(message)))
}

/// Build the axum router.
pub fn router(state: SpeechApiState) -> Router {
    Router::new()
        .route("/status", get(handle_status))
        .route("/speak", post(handle_speak))
        .route("/cancel", post(handle_cancel))
        .route("/configure", post(handle_configure))
        .route("/speech-mode", post(handle_speech_mode))
        .route("/utterances/{id}", get(handle_utterance))
        .with_state(state)
}

/// Start the API server as a background tokio task.
pub async fn start_api(state: SpeechApiState, port: u16) {
    let app = router(state);
    let addr = format!("127.0.0.1:{port}");
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            warn!("Failed to bind speech API on {addr}: {e}");
            return;
        }
    };
    info!("Speech API listening on {addr}");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!("Speech API server error: {e}");
        }
    });
}

// --- Handlers ---

async fn handle_status(State(state): State<SpeechApiState>) -> Json<StatusResponse> {
    let controller = state.skill.controller();
    let status = controller.status();
    Json(StatusResponse {
        backend: status.backend,
        speaking: status.speaking,
        queued: status.queued,
        idle: status.idle,
        speech_mode: state.speech_mode.get(),
        settings: status.settings,
        voices: controller.voices().to_vec(),
    })
}

async fn handle_speak(State(state): State<SpeechApiState>, Json(req): Json<SpeakRequest>) -> Reply {
    let preview: String = req.text.chars().take(80).collect();
    info!(
        "HTTP /speak: \"{}{}\" ({} chars, interrupt={})",
        preview.replace('\n', " "),
        if req.text.chars().count() > 80 { "..." } else { "" },
        req.text.len(),
        req.interrupt,
    );

    let priority = if req.interrupt { Priority::Interrupt } else { Priority::Normal };
    let mut handle = match state.skill.submit(&req.text, priority, Source::Api) {
        Ok(h) => h,
        Err(e) => return bad_request(e.to_string()),
    };

    let status = if req.wait { handle.wait().await } else { handle.status() };
    (StatusCode::OK, Json(ApiResponse::utterance(handle.id(), &status)))
}

async fn handle_cancel(State(state): State<SpeechApiState>, body: Option<Json<CancelRequest>>) -> Reply {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let controller = state.skill.controller();
    let cancelled = match req.id {
        Some(id) => usize::from(controller.cancel(UtteranceId::from_raw(id))),
        None => controller.cancel_all(),
    };
    (
        StatusCode::OK,
        Json(ApiResponse {
            cancelled: Some(cancelled),
            ..ApiResponse::ok("cancelled")
        }),
    )
}

async fn handle_configure(State(state): State<SpeechApiState>, Json(body): Json<Value>) -> Reply {
    let options = match VoiceOptions::from_json(&body) {
        Ok(o) => o,
        Err(e) => return bad_request(e.to_string()),
    };
    match state.skill.controller().configure(&options) {
        Ok(settings) => (
            StatusCode::OK,
            Json(ApiResponse {
                settings: serde_json::to_value(settings).ok(),
                ..ApiResponse::ok("ok")
            }),
        ),
        Err(e) => bad_request(e.to_string()),
    }
}

async fn handle_speech_mode(State(state): State<SpeechApiState>, Json(req): Json<SpeechModeRequest>) -> Reply {
    let enabled = req.enabled.unwrap_or(!state.speech_mode.get());
    state.speech_mode.set(enabled);
    info!("Speech mode {} via API", if enabled { "on" } else { "off" });
    (
        StatusCode::OK,
        Json(ApiResponse {
            speech_mode: Some(enabled),
            ..ApiResponse::ok("ok")
        }),
    )
}

async fn handle_utterance(State(state): State<SpeechApiState>, Path(id): Path<u64>) -> Reply {
    let id = UtteranceId::from_raw(id);
    match state.skill.controller().state(id) {
        Some(status) => (StatusCode::OK, Json(ApiResponse::utterance(id, &status))),
        None => (StatusCode::NOT_FOUND, Json(ApiResponse::err(format!("unknown utterance {id}")))),
    }
}
