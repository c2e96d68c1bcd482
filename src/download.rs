//! HTTP download collaborator: serves raw artifact bytes by room code and
//! player index. The in-progress and final variants differ only in which
//! room-state predicate gates them.

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use std::sync::Arc;

use crate::state::AppState;

/// GET /api/project/{code}/{index} — the artifact currently assigned to
/// slot `index`, available while the game is in progress.
pub async fn project_download(
    Path((code, index)): Path<(String, usize)>,
    State(state): State<Arc<AppState>>,
) -> Response {
    artifact_response(&state, &code, index, |started, _ended| started).await
}

/// GET /api/result/{code}/{index} — the finished artifact, available once
/// the game has ended.
pub async fn result_download(
    Path((code, index)): Path<(String, usize)>,
    State(state): State<Arc<AppState>>,
) -> Response {
    artifact_response(&state, &code, index, |_started, ended| ended).await
}

async fn artifact_response(
    state: &Arc<AppState>,
    code: &str,
    index: usize,
    gate: fn(bool, bool) -> bool,
) -> Response {
    let rooms = state.rooms.read().await;
    let artifact = rooms.get(code).filter(|room| gate(room.started, room.ended))
        .and_then(|room| room.projects.get(index))
        .filter(|artifact| !artifact.buffer.is_empty());

    match artifact {
        Some(artifact) => (
            [
                (header::CONTENT_TYPE, "application/octet-stream".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{}\"", artifact.filename),
                ),
            ],
            artifact.buffer.clone(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
