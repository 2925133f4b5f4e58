//! Shared helpers for the API integration tests: build the production
//! router on a per-test pool and drive it with `tower::ServiceExt::oneshot`.
#![allow(dead_code)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tower::ServiceExt;

use gl_admin_server::auth::AuthService;
use gl_admin_server::rules::PriorityTable;
use gl_admin_server::{app, AppState};

/// The SQLite driver can finish a `RETURNING` write's commit on the
/// connection's worker thread after `fetch_one` resolves, so a follow-up
/// read on a different pool connection may briefly see stale state. The
/// API tests chain writes and reads back to back, so they run on a
/// single-connection pool to keep every request's view serialised.
pub async fn pool_of_one(opts: SqlitePoolOptions, copts: SqliteConnectOptions) -> SqlitePool {
    opts.max_connections(1)
        .connect_with(copts)
        .await
        .expect("connect single-connection test pool")
}

/// Mirror main.rs: same router, same middleware, test secret, bootstrap
/// admin seeded so `login` works immediately.
pub async fn build_test_app(pool: SqlitePool) -> Router {
    let auth = AuthService::new(pool.clone(), "test-secret".to_string(), 24);
    auth.ensure_bootstrap_admin("admin")
        .await
        .expect("bootstrap admin");
    let state = Arc::new(AppState::new(pool, auth, PriorityTable::standard()));
    app(state)
}

pub async fn send(
    app: &Router,
    method: Method,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> Response {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(t) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {t}"));
    }
    let request = match body {
        Some(v) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(v.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    app.clone().oneshot(request).await.unwrap()
}

pub async fn get(app: &Router, uri: &str, token: &str) -> Response {
    send(app, Method::GET, uri, Some(token), None).await
}

pub async fn post_json(app: &Router, uri: &str, token: &str, body: Value) -> Response {
    send(app, Method::POST, uri, Some(token), Some(body)).await
}

pub async fn put_json(app: &Router, uri: &str, token: &str, body: Value) -> Response {
    send(app, Method::PUT, uri, Some(token), Some(body)).await
}

pub async fn delete(app: &Router, uri: &str, token: &str) -> Response {
    send(app, Method::DELETE, uri, Some(token), None).await
}

pub async fn body_text(response: Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub async fn body_json(response: Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap_or(Value::Null)
}

/// Log in as the bootstrap admin and return the session token.
pub async fn login(app: &Router) -> String {
    let response = send(
        app,
        Method::POST,
        "/api/auth/login",
        None,
        Some(json!({ "username": "admin", "password": "admin" })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    body_json(response).await["token"]
        .as_str()
        .expect("login response carries a token")
        .to_string()
}

/// Create a GL account and return its id.
pub async fn seed_account(app: &Router, token: &str, name: &str, external_id: &str) -> i64 {
    let response = post_json(
        app,
        "/api/gl/accounts",
        token,
        json!({ "name": name, "external_id": external_id }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    body_json(response).await["id"].as_i64().unwrap()
}

/// Create a rule set and return its id.
pub async fn seed_rule_set(
    app: &Router,
    token: &str,
    name: &str,
    set_type: &str,
    start: &str,
    end: &str,
) -> i64 {
    let response = post_json(
        app,
        "/api/gl/rule-sets",
        token,
        json!({ "name": name, "set_type": set_type, "start_date": start, "end_date": end }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    body_json(response).await["id"].as_i64().unwrap()
}

/// Add a rule to a set and return its id.
pub async fn seed_rule(
    app: &Router,
    token: &str,
    set_id: i64,
    rule_kind: &str,
    target_id: Option<i64>,
    target_label: Option<&str>,
    account_id: i64,
) -> i64 {
    let response = post_json(
        app,
        &format!("/api/gl/rule-sets/{set_id}/rules"),
        token,
        json!({
            "rule_kind": rule_kind,
            "target_id": target_id,
            "target_label": target_label,
            "account_id": account_id,
        }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    body_json(response).await["id"].as_i64().unwrap()
}
