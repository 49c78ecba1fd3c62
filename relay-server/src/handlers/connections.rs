//! Requests a client makes on behalf of its open stream.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path, State,
        rejection::{JsonRejection, PathRejection},
    },
    routing::{post, put},
};
use shared::models::{ClientEvent, NicknameEvent, NicknameRequest, PublishAck, PublishRequest};
use tracing::{info, instrument};

use crate::{
    app_state::AppState,
    bus::BroadcastEvent,
    connection::{Connection, ConnectionId},
    http::error::{ApiError, AppResult},
};

pub const MAX_NICKNAME_CHARS: usize = 32;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/connections/{id}/messages", post(publish_message))
        .route("/api/connections/{id}/nickname", put(change_nickname))
}

async fn require_connection(
    state: &AppState,
    id: Result<Path<ConnectionId>, PathRejection>,
) -> AppResult<Arc<Connection>> {
    let Path(id) = id.map_err(|rejection| ApiError::validation(rejection.body_text()))?;
    state
        .registry
        .get(id)
        .await
        .ok_or_else(|| ApiError::unknown_connection(id))
}

fn validate_nickname(raw: &str) -> AppResult<String> {
    let nickname = raw.trim();
    if nickname.is_empty() {
        return Err(ApiError::validation("nickname must not be empty"));
    }
    if nickname.chars().count() > MAX_NICKNAME_CHARS {
        return Err(ApiError::validation(format!(
            "nickname must be at most {MAX_NICKNAME_CHARS} characters"
        )));
    }
    Ok(nickname.to_string())
}

/// Acknowledges only once the message is durably stored.
///
/// Content and token are taken as sent; only a body without `content` is
/// rejected.
///
/// The publish runs on its own task so a client that hangs up mid-request
/// cannot cancel it between the insert and the broadcast.
#[instrument(skip(state, id, payload))]
async fn publish_message(
    State(state): State<Arc<AppState>>,
    id: Result<Path<ConnectionId>, PathRejection>,
    payload: Result<Json<PublishRequest>, JsonRejection>,
) -> AppResult<Json<PublishAck>> {
    let Json(request) = payload.map_err(|rejection| ApiError::validation(rejection.body_text()))?;
    let connection = require_connection(&state, id).await?;
    let author = connection.nickname().await;

    let publisher = state.publisher.clone();
    let PublishRequest {
        content,
        idempotency_token,
    } = request;
    let outcome = tokio::spawn(async move {
        publisher
            .publish(content, idempotency_token, author)
            .await
    })
    .await
    .map_err(|err| ApiError::internal_server_error(format!("publish task failed: {err}")))??;

    Ok(Json(outcome.into()))
}

#[instrument(skip(state, id, payload))]
async fn change_nickname(
    State(state): State<Arc<AppState>>,
    id: Result<Path<ConnectionId>, PathRejection>,
    payload: Result<Json<NicknameRequest>, JsonRejection>,
) -> AppResult<Json<NicknameEvent>> {
    let Json(request) = payload.map_err(|rejection| ApiError::validation(rejection.body_text()))?;
    let nickname = validate_nickname(&request.nickname)?;
    let connection = require_connection(&state, id).await?;

    let previous = connection.rename(nickname.clone()).await;
    info!(connection_id = %connection.id(), from = %previous, to = %nickname, "nickname changed");

    state
        .registry
        .emit_one(
            connection.id(),
            ClientEvent::Nickname(NicknameEvent {
                nickname: nickname.clone(),
            }),
        )
        .await;
    state
        .fanout
        .broadcast_all(BroadcastEvent::presence(format!(
            "{previous} is now known as {nickname}"
        )))
        .await;

    Ok(Json(NicknameEvent { nickname }))
}
