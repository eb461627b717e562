use std::sync::Arc;

use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier, password_hash::SaltString};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use rand_core::OsRng;
use uuid::Uuid;

use parley_db::Database;
use parley_gateway::MessageRouter;
use parley_gateway::auth::JwtAuth;
use parley_gateway::store::blocking;
use parley_types::api::{LoginRequest, LoginResponse, RegisterRequest, RegisterResponse};

use crate::internal_error;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub auth: Arc<JwtAuth>,
    pub router: MessageRouter,
}

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    // Validate input
    if req.username.len() < 3 || req.username.len() > 32 {
        return Err(StatusCode::BAD_REQUEST);
    }
    if req.password.len() < 8 {
        return Err(StatusCode::BAD_REQUEST);
    }

    let user_id = Uuid::new_v4();
    let db = state.db.clone();
    let username = req.username.clone();
    let created = blocking(move || {
        // Check if username is taken
        if db.get_user_by_username(&username)?.is_some() {
            return Ok(false);
        }

        // Hash password with Argon2id
        let salt = SaltString::generate(&mut OsRng);
        let password_hash = Argon2::default()
            .hash_password(req.password.as_bytes(), &salt)
            .map_err(|e| anyhow::anyhow!("password hashing failed: {}", e))?
            .to_string();

        db.create_user(&user_id.to_string(), &username, &password_hash)?;
        Ok(true)
    })
    .await
    .map_err(|e| internal_error("register", e))?;

    if !created {
        return Err(StatusCode::CONFLICT);
    }

    let token = state
        .auth
        .issue(user_id, &req.username)
        .map_err(|e| internal_error("token issue", e))?;

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse { user_id, token }),
    ))
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let db = state.db.clone();
    let username = req.username.clone();
    let user = blocking(move || db.get_user_by_username(&username))
        .await
        .map_err(|e| internal_error("login lookup", e))?
        .ok_or(StatusCode::UNAUTHORIZED)?;

    // Verify password
    let parsed_hash = PasswordHash::new(&user.password)
        .map_err(|e| internal_error("stored hash parse", e))?;
    Argon2::default()
        .verify_password(req.password.as_bytes(), &parsed_hash)
        .map_err(|_| StatusCode::UNAUTHORIZED)?;

    let user_id: Uuid = user
        .id
        .parse()
        .map_err(|e| internal_error("user id parse", e))?;
    let token = state
        .auth
        .issue(user_id, &user.username)
        .map_err(|e| internal_error("token issue", e))?;

    Ok(Json(LoginResponse {
        user_id,
        username: user.username,
        token,
    }))
}
