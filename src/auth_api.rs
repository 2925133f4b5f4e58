// src/auth_api.rs
//
// HTTP handlers for authentication, user administration and API tokens.
// All handlers except login run behind the bearer middleware, which
// validates the token and injects `Claims` as a request extension.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Sqlite};
use std::sync::Arc;
use tracing::info;

use crate::auth::{ApiToken, Claims, PasswordService, User};
use crate::AppState;

// ==================== Request/Response types ====================

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub user: UserResponse,
}

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub id: i64,
    pub username: String,
    pub role: String,
    pub enabled: bool,
    pub email: Option<String>,
    pub created_at: String,
    pub last_login: Option<String>,
}

impl From<User> for UserResponse {
    fn from(u: User) -> Self {
        Self {
            id: u.id,
            username: u.username,
            role: u.role,
            enabled: u.enabled,
            email: u.email,
            created_at: u.created_at,
            last_login: u.last_login,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
    pub password: String,
    pub role: String,
    pub email: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateUserRequest {
    pub password: Option<String>,
    pub role: Option<String>,
    pub enabled: Option<bool>,
    pub email: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

#[derive(Debug, Serialize)]
pub struct ChangePasswordResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateTokenRequest {
    pub name: String,
    pub expires_in_days: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct CreateTokenResponse {
    pub token: String,
    pub token_info: ApiTokenResponse,
}

#[derive(Debug, Serialize)]
pub struct ApiTokenResponse {
    pub id: i64,
    pub name: String,
    pub user_id: i64,
    pub expires_at: Option<String>,
    pub created_at: String,
    pub last_used: Option<String>,
    pub revoked: bool,
}

impl From<ApiToken> for ApiTokenResponse {
    fn from(t: ApiToken) -> Self {
        Self {
            id: t.id,
            name: t.name,
            user_id: t.user_id,
            expires_at: t.expires_at,
            created_at: t.created_at,
            last_used: t.last_used,
            revoked: t.revoked,
        }
    }
}

// ==================== Helpers ====================

fn json_error(status: StatusCode, msg: impl std::fmt::Display) -> Response {
    (status, Json(serde_json::json!({ "error": msg.to_string() }))).into_response()
}

fn require_admin(claims: &Claims) -> Result<(), Response> {
    if claims.role != "admin" {
        return Err(json_error(StatusCode::FORBIDDEN, "Admin access required"));
    }
    Ok(())
}

/// Resolve the acting user's id. Session tokens carry it in `sub`; API
/// tokens carry the token id there, so the owning row is consulted.
async fn user_id_from_claims(db: &Pool<Sqlite>, claims: &Claims) -> Result<i64, Response> {
    let sub: i64 = claims
        .sub
        .parse()
        .map_err(|_| json_error(StatusCode::INTERNAL_SERVER_ERROR, "Invalid token subject"))?;

    if claims.token_type == "api" {
        let owner: Option<(i64,)> = sqlx::query_as("SELECT user_id FROM api_tokens WHERE id = ?")
            .bind(sub)
            .fetch_optional(db)
            .await
            .map_err(|e| json_error(StatusCode::INTERNAL_SERVER_ERROR, e))?;
        owner
            .map(|(id,)| id)
            .ok_or_else(|| json_error(StatusCode::UNAUTHORIZED, "Unknown token"))
    } else {
        Ok(sub)
    }
}

// ==================== Session ====================

/// POST /api/auth/login
pub async fn login(
    State(st): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> impl IntoResponse {
    match st.auth.authenticate(&req.username, &req.password).await {
        Ok((user, token)) => {
            let response = LoginResponse { token, user: user.into() };
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(e) => json_error(StatusCode::UNAUTHORIZED, e),
    }
}

/// GET /api/auth/me
pub async fn get_current_user(
    State(st): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
) -> impl IntoResponse {
    let user_id = match user_id_from_claims(&st.db, &claims).await {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(&st.db)
        .await
    {
        Ok(Some(user)) => (StatusCode::OK, Json(UserResponse::from(user))).into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "User not found"),
        Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

/// POST /api/auth/change-password
/// Changes the caller's password after verifying the current one.
pub async fn change_password(
    State(st): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<ChangePasswordRequest>,
) -> impl IntoResponse {
    // API tokens cannot rotate the owning user's password
    if claims.token_type != "session" {
        return json_error(
            StatusCode::FORBIDDEN,
            "Password changes require an interactive session",
        );
    }

    if req.new_password.len() < 8 {
        return json_error(
            StatusCode::BAD_REQUEST,
            "Password must be at least 8 characters",
        );
    }

    let user_id = match user_id_from_claims(&st.db, &claims).await {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match change_password_internal(&st.db, user_id, &req.current_password, &req.new_password).await
    {
        Ok(()) => {
            info!("password changed for user_id={} username={}", user_id, claims.username);
            (
                StatusCode::OK,
                Json(ChangePasswordResponse {
                    success: true,
                    message: "Password changed successfully".to_string(),
                }),
            )
                .into_response()
        }
        Err(e) => {
            info!(
                "password change failed for user_id={} username={}: {}",
                user_id, claims.username, e
            );
            json_error(StatusCode::UNAUTHORIZED, format!("Password change failed: {}", e))
        }
    }
}

async fn change_password_internal(
    db: &Pool<Sqlite>,
    user_id: i64,
    current_password: &str,
    new_password: &str,
) -> Result<()> {
    let mut tx = db.begin().await?;

    let user: (i64, String, String) =
        sqlx::query_as("SELECT id, username, password_hash FROM users WHERE id = ? AND enabled = 1")
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| anyhow!("User not found or disabled"))?;

    let (uid, username, current_hash) = user;

    if !PasswordService::verify_password(current_password, &current_hash)? {
        // failed attempts are part of the audit trail
        sqlx::query(
            "INSERT INTO password_changes (user_id, username, success, failure_reason) \
             VALUES (?, ?, 0, ?)",
        )
        .bind(uid)
        .bind(&username)
        .bind("Invalid current password")
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        return Err(anyhow!("Current password is incorrect"));
    }

    let new_hash = PasswordService::hash_password(new_password)?;

    sqlx::query(
        "UPDATE users \
         SET password_hash = ?, \
             password_changed_at = strftime('%Y-%m-%dT%H:%M:%fZ','now'), \
             updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now') \
         WHERE id = ?",
    )
    .bind(&new_hash)
    .bind(uid)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "INSERT INTO password_changes (user_id, username, success) \
         VALUES (?, ?, 1)",
    )
    .bind(uid)
    .bind(&username)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(())
}

// ==================== User management (admin only) ====================

/// GET /api/users
pub async fn list_users(
    State(st): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
) -> impl IntoResponse {
    if let Err(resp) = require_admin(&claims) {
        return resp;
    }

    match st.auth.list_users().await {
        Ok(users) => {
            let response: Vec<UserResponse> = users.into_iter().map(UserResponse::from).collect();
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

/// POST /api/users
pub async fn create_user(
    State(st): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateUserRequest>,
) -> impl IntoResponse {
    if let Err(resp) = require_admin(&claims) {
        return resp;
    }

    if req.role != "admin" && req.role != "operator" {
        return json_error(StatusCode::BAD_REQUEST, "Role must be 'admin' or 'operator'");
    }

    match st
        .auth
        .create_user(&req.username, &req.password, &req.role, req.email.as_deref())
        .await
    {
        Ok(user) => (StatusCode::CREATED, Json(UserResponse::from(user))).into_response(),
        Err(e) => json_error(StatusCode::BAD_REQUEST, e),
    }
}

/// GET /api/users/{id}
pub async fn get_user(
    State(st): State<Arc<AppState>>,
    Path(user_id): Path<i64>,
    Extension(claims): Extension<Claims>,
) -> impl IntoResponse {
    if let Err(resp) = require_admin(&claims) {
        return resp;
    }

    match sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(&st.db)
        .await
    {
        Ok(Some(user)) => (StatusCode::OK, Json(UserResponse::from(user))).into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "User not found"),
        Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

/// PUT /api/users/{id}
pub async fn update_user(
    State(st): State<Arc<AppState>>,
    Path(user_id): Path<i64>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<UpdateUserRequest>,
) -> impl IntoResponse {
    if let Err(resp) = require_admin(&claims) {
        return resp;
    }

    // The bootstrap admin (id 1) can never be demoted or disabled
    if user_id == 1 {
        if let Some(role) = &req.role {
            if role != "admin" {
                return json_error(StatusCode::FORBIDDEN, "Cannot change admin user role");
            }
        }
        if req.enabled == Some(false) {
            return json_error(StatusCode::FORBIDDEN, "Cannot disable admin user");
        }
    }

    if let Some(role) = &req.role {
        if role != "admin" && role != "operator" {
            return json_error(StatusCode::BAD_REQUEST, "Role must be 'admin' or 'operator'");
        }
    }

    // Build the update from the supplied fields
    let mut updates = Vec::new();
    let mut values: Vec<String> = Vec::new();

    if let Some(password) = req.password {
        match PasswordService::hash_password(&password) {
            Ok(hash) => {
                updates.push("password_hash = ?");
                values.push(hash);
            }
            Err(e) => {
                return json_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Password hashing failed: {}", e),
                );
            }
        }
    }

    if let Some(role) = req.role {
        updates.push("role = ?");
        values.push(role);
    }

    if let Some(enabled) = req.enabled {
        updates.push("enabled = ?");
        values.push(if enabled { "1".to_string() } else { "0".to_string() });
    }

    if let Some(email) = req.email {
        updates.push("email = ?");
        values.push(email);
    }

    if updates.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "No fields to update");
    }

    updates.push("updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')");

    let query_str = format!("UPDATE users SET {} WHERE id = ? RETURNING *", updates.join(", "));

    let mut query = sqlx::query_as::<_, User>(&query_str);
    for val in values {
        query = query.bind(val);
    }
    query = query.bind(user_id);

    match query.fetch_optional(&st.db).await {
        Ok(Some(user)) => (StatusCode::OK, Json(UserResponse::from(user))).into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "User not found"),
        Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

/// DELETE /api/users/{id}
pub async fn delete_user(
    State(st): State<Arc<AppState>>,
    Path(user_id): Path<i64>,
    Extension(claims): Extension<Claims>,
) -> impl IntoResponse {
    if let Err(resp) = require_admin(&claims) {
        return resp;
    }

    if user_id == 1 {
        return json_error(StatusCode::FORBIDDEN, "Cannot delete admin user");
    }

    match sqlx::query("DELETE FROM users WHERE id = ?")
        .bind(user_id)
        .execute(&st.db)
        .await
    {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

// ==================== API token management ====================

/// GET /api/tokens
pub async fn list_my_tokens(
    State(st): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
) -> impl IntoResponse {
    let user_id = match user_id_from_claims(&st.db, &claims).await {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match st.auth.list_user_tokens(user_id).await {
        Ok(tokens) => {
            let response: Vec<ApiTokenResponse> =
                tokens.into_iter().map(ApiTokenResponse::from).collect();
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

/// POST /api/tokens
pub async fn create_api_token(
    State(st): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateTokenRequest>,
) -> impl IntoResponse {
    let user_id = match user_id_from_claims(&st.db, &claims).await {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match st.auth.create_api_token(&req.name, user_id, req.expires_in_days).await {
        Ok((token_record, token)) => {
            let response = CreateTokenResponse { token, token_info: token_record.into() };
            (StatusCode::CREATED, Json(response)).into_response()
        }
        Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

/// DELETE /api/tokens/{id}
pub async fn revoke_api_token(
    State(st): State<Arc<AppState>>,
    Path(token_id): Path<i64>,
    Extension(claims): Extension<Claims>,
) -> impl IntoResponse {
    let user_id = match user_id_from_claims(&st.db, &claims).await {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    // Only the owner or an admin may revoke a token
    let token_user: Option<(i64,)> =
        match sqlx::query_as("SELECT user_id FROM api_tokens WHERE id = ?")
            .bind(token_id)
            .fetch_optional(&st.db)
            .await
        {
            Ok(r) => r,
            Err(e) => return json_error(StatusCode::INTERNAL_SERVER_ERROR, e),
        };

    match token_user {
        Some((owner_id,)) if owner_id == user_id || claims.role == "admin" => {
            match st.auth.revoke_token(token_id).await {
                Ok(()) => StatusCode::NO_CONTENT.into_response(),
                Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, e),
            }
        }
        Some(_) => json_error(StatusCode::FORBIDDEN, "Not authorized to revoke this token"),
        None => json_error(StatusCode::NOT_FOUND, "Token not found"),
    }
}
