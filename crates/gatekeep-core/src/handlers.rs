use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::{client::Disposition, engine::LinkState, AppState};

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// ── Status ────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub link: LinkState,
    pub validation_ttl_secs: u64,
    pub tracked_modules: usize,
}

pub async fn status(State(state): State<AppState>) -> Response {
    let engine = state.gate.engine();
    Json(StatusResponse {
        link: engine.get_current_link_state(),
        validation_ttl_secs: engine.validation_ttl().as_secs(),
        tracked_modules: state.gate.tracker().all_records().len(),
    })
    .into_response()
}

// ── Link / unlink ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct LinkRequest {
    pub token: String,
}

pub async fn link(State(state): State<AppState>, Json(body): Json<LinkRequest>) -> Response {
    let token = body.token.trim();
    if token.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "token is required"})),
        )
            .into_response();
    }

    match state.gate.link(token).await {
        Ok(outcome) => match outcome.disposition {
            Disposition::Granted => {
                info!(server = %state.gate.settings().server_name, "audit: server.link");
                Json(json!({
                    "linked": true,
                    "message": outcome.message,
                    "server": state.gate.settings().server_name,
                }))
                .into_response()
            }
            Disposition::Denied => (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": format!("linking failed: {}", outcome.message)})),
            )
                .into_response(),
            Disposition::Unreachable => (
                StatusCode::BAD_GATEWAY,
                Json(json!({"error": format!("linking failed: {}", outcome.message)})),
            )
                .into_response(),
        },
        Err(e) => internal_error(e.into()),
    }
}

pub async fn unlink(State(state): State<AppState>) -> Response {
    match state.gate.unlink() {
        Ok(()) => {
            info!("audit: server.unlink");
            Json(json!({"unlinked": true})).into_response()
        }
        Err(e) => internal_error(e.into()),
    }
}

// ── Modules ───────────────────────────────────────────────────────────────────

pub async fn list_modules(State(state): State<AppState>) -> Response {
    Json(state.gate.module_status().await).into_response()
}

pub async fn reload_modules(State(state): State<AppState>) -> Response {
    let summary = state.gate.reload_modules().await;
    info!(
        checked = summary.checked,
        denied = summary.denied,
        "audit: modules.reload"
    );
    Json(json!({
        "summary": summary,
        "modules": state.gate.module_status().await,
    }))
    .into_response()
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn internal_error(e: anyhow::Error) -> Response {
    tracing::error!(error = %e, "internal error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "internal server error"})),
    )
        .into_response()
}
