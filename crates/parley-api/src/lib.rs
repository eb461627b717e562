pub mod auth;
pub mod conversations;
pub mod groups;
pub mod messages;
pub mod middleware;

use axum::{
    Router,
    http::StatusCode,
    middleware as axum_middleware,
    routing::{delete, get, post},
};
use tracing::error;

pub use auth::{AppState, AppStateInner};

/// All REST routes under `/api/v1`. Everything except register/login needs a
/// bearer token.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login));

    let protected_routes = Router::new()
        .route("/messages", post(messages::send_message))
        .route("/messages/{message_id}", delete(messages::recall_message))
        .route("/conversations", get(conversations::list_conversations))
        .route("/conversations/{conversation_id}/messages", get(conversations::recent_messages))
        .route("/conversations/{conversation_id}/history", get(conversations::history))
        .route("/groups", post(groups::create_group))
        .route("/groups/{conversation_id}/messages", post(groups::send_group_message))
        .layer(axum_middleware::from_fn_with_state(state.clone(), middleware::require_auth));

    Router::new().nest(
        "/api/v1",
        public_routes.merge(protected_routes).with_state(state),
    )
}

/// Log an unexpected failure and turn it into a 500.
pub(crate) fn internal_error(context: &str, e: impl std::fmt::Display) -> StatusCode {
    error!("{} failed: {}", context, e);
    StatusCode::INTERNAL_SERVER_ERROR
}
