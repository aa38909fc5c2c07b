use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::session::{PreviousSession, SessionInfo};

use super::error::ApiError;
use super::AppState;

#[derive(Serialize)]
pub(super) struct HealthResponse {
    status: &'static str,
    terminals: usize,
}

pub(super) async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        terminals: state.registry.len(),
    })
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct CreateTerminalRequest {
    deck_id: Option<String>,
    title: Option<String>,
}

#[derive(Serialize)]
pub(super) struct CreateTerminalResponse {
    id: String,
    title: String,
}

pub(super) async fn create_terminal(
    State(state): State<AppState>,
    body: Result<Json<CreateTerminalRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CreateTerminalResponse>), ApiError> {
    let Json(req) = body.map_err(|e| ApiError::InvalidRequest(e.body_text()))?;
    let deck_id = req
        .deck_id
        .filter(|d| !d.is_empty())
        .ok_or_else(|| ApiError::InvalidRequest("deckId is required".into()))?;

    let info = state.registry.create(&deck_id, req.title)?;
    Ok((
        StatusCode::CREATED,
        Json(CreateTerminalResponse {
            id: info.id.to_string(),
            title: info.title,
        }),
    ))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ListTerminalsQuery {
    deck_id: Option<String>,
}

pub(super) async fn list_terminals(
    State(state): State<AppState>,
    Query(query): Query<ListTerminalsQuery>,
) -> Result<Json<Vec<SessionInfo>>, ApiError> {
    let deck_id = query
        .deck_id
        .filter(|d| !d.is_empty())
        .ok_or_else(|| ApiError::InvalidRequest("deckId is required".into()))?;
    Ok(Json(state.registry.list(&deck_id)))
}

pub(super) async fn stop_terminal(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.registry.stop(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
pub(super) struct StopDeckResponse {
    stopped: usize,
}

pub(super) async fn stop_deck_terminals(
    State(state): State<AppState>,
    Path(deck_id): Path<String>,
) -> Json<StopDeckResponse> {
    let stopped = state.registry.remove_deck(&deck_id);
    if stopped > 0 {
        tracing::info!(deck = %deck_id, stopped, "stopped deck terminals");
    }
    Json(StopDeckResponse { stopped })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct DeckStatusResponse {
    deck_id: String,
    terminals: usize,
    /// Last failed attempt to start a terminal in this deck.
    last_error: Option<String>,
}

pub(super) async fn deck_status(
    State(state): State<AppState>,
    Path(deck_id): Path<String>,
) -> Json<DeckStatusResponse> {
    Json(DeckStatusResponse {
        terminals: state.registry.list(&deck_id).len(),
        last_error: state.registry.last_error(&deck_id),
        deck_id,
    })
}

pub(super) async fn previous_terminals(
    State(state): State<AppState>,
    Path(deck_id): Path<String>,
) -> Json<Vec<PreviousSession>> {
    Json(state.registry.previous(&deck_id))
}
