use crate::dtos::RenameInput;
use crate::middleware::UserId;
use crate::services::parse_session_id;
use crate::startup::AppState;
use crate::turn::{self, framer::event_stream_response, TurnRequest};
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    response::Response,
    Json,
};
use service_core::chat::{
    DeleteResponse, HistoryResponse, RenameSessionRequest, SessionResponse, SessionView,
    StreamRequest,
};
use service_core::error::AppError;
use validator::Validate;

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    body.map(|Json(value)| value)
        .map_err(|rejection| AppError::bad_request(rejection.body_text()))
}

/// Start a streaming turn.
#[tracing::instrument(skip(state, body), fields(user_id = %user_id.0))]
pub async fn stream_chat(
    State(state): State<AppState>,
    user_id: UserId,
    body: Result<Json<StreamRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let request = TurnRequest::parse(json_body(body)?)?;
    let handle = turn::start_turn(&state, &user_id.0, request).await?;

    tracing::info!(
        session_id = %handle.session_id,
        created = handle.created,
        "Chat stream opened"
    );

    // The task outlives this handler and logs its own outcome.
    Ok(event_stream_response(handle.frames))
}

#[tracing::instrument(skip(state), fields(user_id = %user_id.0))]
pub async fn history(
    State(state): State<AppState>,
    user_id: UserId,
) -> Result<Json<HistoryResponse>, AppError> {
    let sessions = state.store.list(&user_id.0).await?;

    Ok(Json(HistoryResponse {
        sessions: sessions.into_iter().map(SessionView::from).collect(),
    }))
}

#[tracing::instrument(skip(state, body), fields(user_id = %user_id.0))]
pub async fn rename_session(
    State(state): State<AppState>,
    user_id: UserId,
    Path(id): Path<String>,
    body: Result<Json<RenameSessionRequest>, JsonRejection>,
) -> Result<Json<SessionResponse>, AppError> {
    let id = parse_session_id(&id)?;
    let body = json_body(body)?;

    let input = RenameInput {
        title: body.title.as_deref().map(str::trim).unwrap_or_default().to_string(),
    };
    input.validate()?;

    let session = state
        .store
        .rename(&id, &user_id.0, &input.title)
        .await?
        .ok_or_else(|| AppError::not_found("Chat not found"))?;

    tracing::info!(session_id = %id, "Chat session renamed");

    Ok(Json(SessionResponse {
        session: session.into(),
    }))
}

#[tracing::instrument(skip(state), fields(user_id = %user_id.0))]
pub async fn delete_session(
    State(state): State<AppState>,
    user_id: UserId,
    Path(id): Path<String>,
) -> Result<Json<DeleteResponse>, AppError> {
    let id = parse_session_id(&id)?;

    if !state.store.delete(&id, &user_id.0).await? {
        return Err(AppError::not_found("Chat not found"));
    }

    tracing::info!(session_id = %id, "Chat session deleted");

    Ok(Json(DeleteResponse { ok: true }))
}
