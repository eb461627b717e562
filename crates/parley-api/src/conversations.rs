use std::collections::HashMap;
use std::collections::hash_map::Entry;

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use uuid::Uuid;

use parley_gateway::store::blocking;
use parley_types::api::{Claims, ConversationResponse, MessageResponse};
use parley_types::models::ConversationKind;

use crate::auth::AppState;
use crate::internal_error;

const MAX_LIMIT: u32 = 200;

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    50
}

/// GET /conversations: every conversation the caller belongs to.
pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let conversations = state.router.stores().conversations.clone();
    let users = state.router.stores().users.clone();
    let user_id = claims.sub;

    let result = blocking(move || {
        conversations
            .conversations_for_user(user_id)?
            .into_iter()
            .map(|c| {
                let member_ids: Vec<Uuid> = conversations
                    .members(c.id)?
                    .into_iter()
                    .map(|m| m.user_id)
                    .collect();
                let other_user = match c.kind {
                    ConversationKind::Single => member_ids
                        .iter()
                        .find(|id| **id != user_id)
                        .map(|id| users.user_by_id(*id))
                        .transpose()?
                        .flatten()
                        .map(|u| u.username),
                    ConversationKind::Group => None,
                };
                Ok(ConversationResponse {
                    other_user,
                    ..ConversationResponse::new(c, member_ids)
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()
    })
    .await
    .map_err(|e| internal_error("list conversations", e))?;

    Ok(Json(result))
}

/// GET /conversations/{id}/messages: the newest `limit` messages, oldest first.
pub async fn recent_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<MessageQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    load_messages(&state, conversation_id, claims.sub, query.limit, Window::Recent).await
}

/// GET /conversations/{id}/history: from the first message, oldest first.
pub async fn history(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<MessageQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    load_messages(&state, conversation_id, claims.sub, query.limit, Window::FromStart).await
}

#[derive(Clone, Copy)]
enum Window {
    Recent,
    FromStart,
}

async fn load_messages(
    state: &AppState,
    conversation_id: Uuid,
    user_id: Uuid,
    limit: u32,
    window: Window,
) -> Result<Json<Vec<MessageResponse>>, StatusCode> {
    let stores = state.router.stores().clone();
    let limit = limit.clamp(1, MAX_LIMIT);

    let messages = blocking(move || {
        if stores.conversations.conversation(conversation_id)?.is_none() {
            return Ok(None);
        }
        if !stores.conversations.is_member(conversation_id, user_id)? {
            return Ok(Some(Err(StatusCode::FORBIDDEN)));
        }
        let messages = match window {
            Window::Recent => stores.messages.list_recent_messages(conversation_id, limit)?,
            Window::FromStart => stores.messages.list_messages(conversation_id, limit)?,
        };

        let mut usernames: HashMap<Uuid, String> = HashMap::new();
        for message in &messages {
            if let Entry::Vacant(slot) = usernames.entry(message.sender_id) {
                let username = stores
                    .users
                    .user_by_id(message.sender_id)?
                    .map(|u| u.username)
                    .unwrap_or_default();
                slot.insert(username);
            }
        }

        let responses = messages
            .into_iter()
            .map(|m| {
                let username = usernames.get(&m.sender_id).cloned().unwrap_or_default();
                MessageResponse::new(m, username)
            })
            .collect::<Vec<_>>();
        Ok(Some(Ok(responses)))
    })
    .await
    .map_err(|e| internal_error("load messages", e))?
    .ok_or(StatusCode::NOT_FOUND)??;

    Ok(Json(messages))
}
