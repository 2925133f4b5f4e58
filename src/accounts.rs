// src/accounts.rs
//
// GL account CRUD. Accounts are soft-deleted and external_id uniqueness
// among live accounts is checked here, not constrained in the schema, so
// a retired account may keep its old ledger code.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::models::{CreateAccount, GlAccount, UpdateAccount};
use crate::AppState;

#[derive(Deserialize)]
pub struct ListAccountsQuery {
    #[serde(default)]
    pub include_deleted: bool,
}

/// GET /api/gl/accounts
pub async fn list_accounts(
    State(st): State<Arc<AppState>>,
    Query(q): Query<ListAccountsQuery>,
) -> Result<Json<Vec<GlAccount>>, (StatusCode, String)> {
    let sql = if q.include_deleted {
        "SELECT * FROM gl_accounts ORDER BY name"
    } else {
        "SELECT * FROM gl_accounts WHERE deleted = 0 ORDER BY name"
    };
    let accounts = sqlx::query_as::<_, GlAccount>(sql)
        .fetch_all(&st.db)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(accounts))
}

/// GET /api/gl/accounts/{id}
pub async fn get_account(
    State(st): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<GlAccount>, (StatusCode, String)> {
    let account = sqlx::query_as::<_, GlAccount>("SELECT * FROM gl_accounts WHERE id = ?")
        .bind(id)
        .fetch_optional(&st.db)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .ok_or((StatusCode::NOT_FOUND, "Account not found".to_string()))?;
    Ok(Json(account))
}

/// POST /api/gl/accounts
pub async fn create_account(
    State(st): State<Arc<AppState>>,
    Json(req): Json<CreateAccount>,
) -> Result<(StatusCode, Json<GlAccount>), (StatusCode, String)> {
    if req.name.trim().is_empty() || req.external_id.trim().is_empty() {
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            "name and external_id must not be empty".to_string(),
        ));
    }

    ensure_external_id_free(&st, &req.external_id, None).await?;

    let account = sqlx::query_as::<_, GlAccount>(
        "INSERT INTO gl_accounts (name, external_id) VALUES (?, ?) RETURNING *",
    )
    .bind(req.name.trim())
    .bind(req.external_id.trim())
    .fetch_one(&st.db)
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok((StatusCode::CREATED, Json(account)))
}

/// PUT /api/gl/accounts/{id}
pub async fn update_account(
    State(st): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateAccount>,
) -> Result<Json<GlAccount>, (StatusCode, String)> {
    let current = sqlx::query_as::<_, GlAccount>(
        "SELECT * FROM gl_accounts WHERE id = ? AND deleted = 0",
    )
    .bind(id)
    .fetch_optional(&st.db)
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
    .ok_or((StatusCode::NOT_FOUND, "Account not found".to_string()))?;

    let name = req.name.unwrap_or(current.name);
    let external_id = req.external_id.unwrap_or(current.external_id);
    if name.trim().is_empty() || external_id.trim().is_empty() {
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            "name and external_id must not be empty".to_string(),
        ));
    }

    ensure_external_id_free(&st, &external_id, Some(id)).await?;

    let account = sqlx::query_as::<_, GlAccount>(
        "UPDATE gl_accounts SET name = ?, external_id = ?, \
         updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now') \
         WHERE id = ? RETURNING *",
    )
    .bind(name.trim())
    .bind(external_id.trim())
    .bind(id)
    .fetch_one(&st.db)
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(account))
}

/// DELETE /api/gl/accounts/{id}
///
/// Soft delete. Refused while any live rule still allocates to the account,
/// otherwise those rules would point at a tombstone.
pub async fn delete_account(
    State(st): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, (StatusCode, String)> {
    let exists: Option<(i64,)> =
        sqlx::query_as("SELECT id FROM gl_accounts WHERE id = ? AND deleted = 0")
            .bind(id)
            .fetch_optional(&st.db)
            .await
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    if exists.is_none() {
        return Err((StatusCode::NOT_FOUND, "Account not found".to_string()));
    }

    let referencing: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM gl_rules WHERE account_id = ? AND deleted = 0")
            .bind(id)
            .fetch_one(&st.db)
            .await
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    if referencing > 0 {
        return Err((
            StatusCode::CONFLICT,
            format!("Account is referenced by {referencing} active rule(s)"),
        ));
    }

    sqlx::query(
        "UPDATE gl_accounts SET deleted = 1, \
         updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now') WHERE id = ?",
    )
    .bind(id)
    .execute(&st.db)
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(StatusCode::NO_CONTENT)
}

async fn ensure_external_id_free(
    st: &AppState,
    external_id: &str,
    exclude: Option<i64>,
) -> Result<(), (StatusCode, String)> {
    let taken: Option<(i64,)> = sqlx::query_as(
        "SELECT id FROM gl_accounts WHERE external_id = ? AND deleted = 0 AND id != ?",
    )
    .bind(external_id.trim())
    .bind(exclude.unwrap_or(-1))
    .fetch_optional(&st.db)
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    if taken.is_some() {
        return Err((
            StatusCode::CONFLICT,
            format!("external_id '{}' is already in use", external_id.trim()),
        ));
    }
    Ok(())
}
