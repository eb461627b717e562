use axum::{
    extract::{Request, State},
    http::{StatusCode, header},
    middleware::Next,
    response::Response,
};
use tracing::debug;

use parley_gateway::auth::AuthVerifier;
use parley_gateway::store::blocking;
use parley_types::api::Claims;
use parley_types::models::User;

use crate::auth::AppState;

/// Extract and validate the JWT from the Authorization header.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let claims = state.auth.verify(token).map_err(|e| {
        debug!("Rejected bearer token: {}", e);
        StatusCode::UNAUTHORIZED
    })?;

    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}

/// Resolve the caller's user record; a token for a user that no longer exists
/// is treated as unauthenticated.
pub async fn current_user(state: &AppState, claims: &Claims) -> Result<User, StatusCode> {
    let users = state.router.stores().users.clone();
    let user_id = claims.sub;
    blocking(move || users.user_by_id(user_id))
        .await
        .map_err(|e| crate::internal_error("user lookup", e))?
        .ok_or(StatusCode::UNAUTHORIZED)
}
