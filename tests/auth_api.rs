//! Integration tests for authentication: login, the bearer middleware,
//! user administration, password change auditing, and API tokens.

mod common;

use axum::http::{Method, StatusCode};
use common::*;
use serde_json::json;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

#[sqlx::test]
async fn login_issues_a_usable_session_token(opts: SqlitePoolOptions, copts: SqliteConnectOptions) {
    let app = build_test_app(pool_of_one(opts, copts).await).await;
    let token = login(&app).await;

    let response = get(&app, "/api/auth/me", &token).await;
    assert_eq!(response.status(), StatusCode::OK);
    let me = body_json(response).await;
    assert_eq!(me["username"], "admin");
    assert_eq!(me["role"], "admin");
}

#[sqlx::test]
async fn wrong_credentials_are_401(opts: SqlitePoolOptions, copts: SqliteConnectOptions) {
    let app = build_test_app(pool_of_one(opts, copts).await).await;

    let response = send(
        &app,
        Method::POST,
        "/api/auth/login",
        None,
        Some(json!({ "username": "admin", "password": "nope" })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[sqlx::test]
async fn api_requires_a_bearer_token(opts: SqlitePoolOptions, copts: SqliteConnectOptions) {
    let app = build_test_app(pool_of_one(opts, copts).await).await;

    let response = send(&app, Method::GET, "/api/gl/accounts", None, None).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = send(&app, Method::GET, "/api/gl/accounts", Some("garbage"), None).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // the health probe stays open
    let response = send(&app, Method::GET, "/healthz", None, None).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[sqlx::test]
async fn operators_cannot_manage_users(opts: SqlitePoolOptions, copts: SqliteConnectOptions) {
    let app = build_test_app(pool_of_one(opts, copts).await).await;
    let admin_token = login(&app).await;

    let response = post_json(
        &app,
        "/api/users",
        &admin_token,
        json!({ "username": "ops", "password": "hunter2boat", "role": "operator" }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = send(
        &app,
        Method::POST,
        "/api/auth/login",
        None,
        Some(json!({ "username": "ops", "password": "hunter2boat" })),
    )
    .await;
    let ops_token = body_json(response).await["token"].as_str().unwrap().to_string();

    // operator can use the GL surface...
    let response = get(&app, "/api/gl/accounts", &ops_token).await;
    assert_eq!(response.status(), StatusCode::OK);

    // ...but not the user admin surface
    let response = get(&app, "/api/users", &ops_token).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[sqlx::test]
async fn bootstrap_admin_is_protected(opts: SqlitePoolOptions, copts: SqliteConnectOptions) {
    let app = build_test_app(pool_of_one(opts, copts).await).await;
    let token = login(&app).await;

    let response = put_json(&app, "/api/users/1", &token, json!({ "role": "operator" })).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = put_json(&app, "/api/users/1", &token, json!({ "enabled": false })).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = delete(&app, "/api/users/1", &token).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[sqlx::test]
async fn disabled_users_cannot_log_in(opts: SqlitePoolOptions, copts: SqliteConnectOptions) {
    let app = build_test_app(pool_of_one(opts, copts).await).await;
    let admin_token = login(&app).await;

    let response = post_json(
        &app,
        "/api/users",
        &admin_token,
        json!({ "username": "temp", "password": "hunter2boat", "role": "operator" }),
    )
    .await;
    let user_id = body_json(response).await["id"].as_i64().unwrap();

    let response =
        put_json(&app, &format!("/api/users/{user_id}"), &admin_token, json!({ "enabled": false }))
            .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = send(
        &app,
        Method::POST,
        "/api/auth/login",
        None,
        Some(json!({ "username": "temp", "password": "hunter2boat" })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[sqlx::test]
async fn password_change_verifies_the_current_password(opts: SqlitePoolOptions, copts: SqliteConnectOptions) {
    let app = build_test_app(pool_of_one(opts, copts).await).await;
    let token = login(&app).await;

    let response = post_json(
        &app,
        "/api/auth/change-password",
        &token,
        json!({ "current_password": "wrong", "new_password": "a-long-password" }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = post_json(
        &app,
        "/api/auth/change-password",
        &token,
        json!({ "current_password": "admin", "new_password": "short" }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = post_json(
        &app,
        "/api/auth/change-password",
        &token,
        json!({ "current_password": "admin", "new_password": "a-long-password" }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    // old password is gone, new one works
    let response = send(
        &app,
        Method::POST,
        "/api/auth/login",
        None,
        Some(json!({ "username": "admin", "password": "admin" })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = send(
        &app,
        Method::POST,
        "/api/auth/login",
        None,
        Some(json!({ "username": "admin", "password": "a-long-password" })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[sqlx::test]
async fn api_tokens_work_until_revoked(opts: SqlitePoolOptions, copts: SqliteConnectOptions) {
    let app = build_test_app(pool_of_one(opts, copts).await).await;
    let session = login(&app).await;

    let response = post_json(
        &app,
        "/api/tokens",
        &session,
        json!({ "name": "batch engine", "expires_in_days": 30 }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = body_json(response).await;
    let api_token = created["token"].as_str().unwrap().to_string();
    let token_id = created["token_info"]["id"].as_i64().unwrap();

    // the API token authenticates like a session
    let response = get(&app, "/api/gl/accounts", &api_token).await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = delete(&app, &format!("/api/tokens/{token_id}"), &session).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    // revocation applies before the JWT expiry
    let response = get(&app, "/api/gl/accounts", &api_token).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[sqlx::test]
async fn api_tokens_cannot_change_passwords(opts: SqlitePoolOptions, copts: SqliteConnectOptions) {
    let app = build_test_app(pool_of_one(opts, copts).await).await;
    let session = login(&app).await;

    let response =
        post_json(&app, "/api/tokens", &session, json!({ "name": "batch engine" })).await;
    let api_token = body_json(response).await["token"].as_str().unwrap().to_string();

    let response = post_json(
        &app,
        "/api/auth/change-password",
        &api_token,
        json!({ "current_password": "admin", "new_password": "a-long-password" }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}
