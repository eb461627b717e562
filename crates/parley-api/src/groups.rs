use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::info;
use uuid::Uuid;

use parley_gateway::store::blocking;
use parley_types::api::{
    Claims, ConversationResponse, CreateGroupRequest, MessageResponse, SendGroupMessageRequest,
};

use crate::auth::AppState;
use crate::internal_error;
use crate::messages::route_status;
use crate::middleware::current_user;

/// POST /groups: create a named group. Members are notified over the gateway.
pub async fn create_group(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateGroupRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let name = req.name.trim().to_string();
    if name.is_empty() || name.len() > 64 {
        return Err(StatusCode::BAD_REQUEST);
    }

    let stores = state.router.stores().clone();
    let creator = claims.sub;
    let requested = req.members;

    let created = blocking(move || {
        for member in &requested {
            if stores.users.user_by_id(*member)?.is_none() {
                return Ok(None);
            }
        }
        let group = stores.conversations.create_group(&name, creator, &requested)?;
        let member_ids: Vec<Uuid> = stores
            .conversations
            .members(group.id)?
            .into_iter()
            .map(|m| m.user_id)
            .collect();
        Ok(Some((group, member_ids)))
    })
    .await
    .map_err(|e| internal_error("create group", e))?;

    let (group, member_ids) = created.ok_or(StatusCode::BAD_REQUEST)?;

    let report = state.router.notify_group_created(&group, &member_ids);
    info!(
        "{} created group {} with {} members ({} online)",
        claims.username,
        group.id,
        member_ids.len(),
        report.queued
    );

    Ok((
        StatusCode::CREATED,
        Json(ConversationResponse::new(group, member_ids)),
    ))
}

/// POST /groups/{id}/messages: synchronous group send.
pub async fn send_group_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendGroupMessageRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let sender = current_user(&state, &claims).await?;
    let (message, _report) = state
        .router
        .send_group(&sender, conversation_id, req.content)
        .await
        .map_err(route_status)?;

    Ok((
        StatusCode::CREATED,
        Json(MessageResponse::new(message, sender.username)),
    ))
}
