use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use parley_gateway::recall::RecallError;
use parley_gateway::router::RouteError;
use parley_types::api::{Claims, MessageResponse, SendMessageRequest};

use crate::auth::AppState;
use crate::internal_error;
use crate::middleware::current_user;

/// POST /messages: synchronous direct send. Same path as a `chat` frame on the
/// gateway, but failures come back to the caller.
pub async fn send_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let sender = current_user(&state, &claims).await?;
    let (message, _report) = state
        .router
        .send_direct(&sender, &req.to, req.content)
        .await
        .map_err(route_status)?;

    Ok((
        StatusCode::CREATED,
        Json(MessageResponse::new(message, sender.username)),
    ))
}

/// DELETE /messages/{message_id}: recall one of the caller's messages.
pub async fn recall_message(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let (message, _report) = state
        .router
        .recall(claims.sub, message_id)
        .await
        .map_err(recall_status)?;

    Ok(Json(MessageResponse::new(message, claims.username)))
}

pub(crate) fn route_status(e: RouteError) -> StatusCode {
    match e {
        RouteError::Malformed(_) => StatusCode::BAD_REQUEST,
        RouteError::UnknownRecipient(_) | RouteError::UnknownConversation(_) => StatusCode::NOT_FOUND,
        RouteError::NotMember { .. } => StatusCode::FORBIDDEN,
        RouteError::Recall(e) => recall_status(e),
        e @ (RouteError::Store(_) | RouteError::Encode(_)) => internal_error("send", e),
    }
}

pub(crate) fn recall_status(e: RecallError) -> StatusCode {
    match e {
        RecallError::NotFound(_) => StatusCode::NOT_FOUND,
        RecallError::Forbidden(_) => StatusCode::FORBIDDEN,
        RecallError::AlreadyRecalled(_) => StatusCode::CONFLICT,
        e @ (RecallError::Store(_) | RecallError::Encode(_)) => internal_error("recall", e),
    }
}
