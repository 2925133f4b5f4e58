//! Integration tests for allocation-run monitoring: the start/finish
//! reporting contract and the operator-facing listing and stats.

mod common;

use axum::http::StatusCode;
use common::*;
use serde_json::json;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

async fn start_run(app: &axum::Router, token: &str, trigger: &str) -> i64 {
    let response = post_json(
        app,
        "/api/gl/batch-runs",
        token,
        json!({
            "trigger_kind": trigger,
            "set_type": "revenue",
            "period_start": "2024-03-01",
            "period_end": "2024-03-31",
        }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    body_json(response).await["id"].as_i64().unwrap()
}

#[sqlx::test]
async fn run_lifecycle_start_then_finish(opts: SqlitePoolOptions, copts: SqliteConnectOptions) {
    let app = build_test_app(pool_of_one(opts, copts).await).await;
    let token = login(&app).await;

    let id = start_run(&app, &token, "scheduled").await;

    let response = put_json(
        &app,
        &format!("/api/gl/batch-runs/{id}/finish"),
        &token,
        json!({
            "status": "succeeded",
            "bookings_processed": 120,
            "lines_written": 240,
            "unresolved_count": 3,
        }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let run = body_json(response).await;
    assert_eq!(run["status"], "succeeded");
    assert_eq!(run["bookings_processed"], 120);
    assert!(run["finished_at"].is_string());

    // a finished run cannot be finished again
    let response = put_json(
        &app,
        &format!("/api/gl/batch-runs/{id}/finish"),
        &token,
        json!({ "status": "succeeded" }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[sqlx::test]
async fn invalid_trigger_and_status_are_rejected(opts: SqlitePoolOptions, copts: SqliteConnectOptions) {
    let app = build_test_app(pool_of_one(opts, copts).await).await;
    let token = login(&app).await;

    let response = post_json(
        &app,
        "/api/gl/batch-runs",
        &token,
        json!({
            "trigger_kind": "cron",
            "period_start": "2024-03-01",
            "period_end": "2024-03-31",
        }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let id = start_run(&app, &token, "manual").await;
    let response = put_json(
        &app,
        &format!("/api/gl/batch-runs/{id}/finish"),
        &token,
        json!({ "status": "done" }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[sqlx::test]
async fn failed_runs_require_an_error_message(opts: SqlitePoolOptions, copts: SqliteConnectOptions) {
    let app = build_test_app(pool_of_one(opts, copts).await).await;
    let token = login(&app).await;

    let id = start_run(&app, &token, "scheduled").await;

    let response = put_json(
        &app,
        &format!("/api/gl/batch-runs/{id}/finish"),
        &token,
        json!({ "status": "failed" }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let response = put_json(
        &app,
        &format!("/api/gl/batch-runs/{id}/finish"),
        &token,
        json!({ "status": "failed", "error_message": "ledger backend timeout" }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["error_message"], "ledger backend timeout");
}

#[sqlx::test]
async fn finishing_an_unknown_run_is_404(opts: SqlitePoolOptions, copts: SqliteConnectOptions) {
    let app = build_test_app(pool_of_one(opts, copts).await).await;
    let token = login(&app).await;

    let response = put_json(
        &app,
        "/api/gl/batch-runs/999/finish",
        &token,
        json!({ "status": "succeeded" }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[sqlx::test]
async fn listing_filters_by_status(opts: SqlitePoolOptions, copts: SqliteConnectOptions) {
    let app = build_test_app(pool_of_one(opts, copts).await).await;
    let token = login(&app).await;

    let first = start_run(&app, &token, "scheduled").await;
    start_run(&app, &token, "manual").await;
    put_json(
        &app,
        &format!("/api/gl/batch-runs/{first}/finish"),
        &token,
        json!({ "status": "succeeded" }),
    )
    .await;

    let response = get(&app, "/api/gl/batch-runs", &token).await;
    assert_eq!(body_json(response).await.as_array().unwrap().len(), 2);

    let response = get(&app, "/api/gl/batch-runs?status=running", &token).await;
    let running = body_json(response).await;
    assert_eq!(running.as_array().unwrap().len(), 1);
    assert_eq!(running[0]["status"], "running");

    let response = get(&app, "/api/gl/batch-runs?status=failed", &token).await;
    assert!(body_json(response).await.as_array().unwrap().is_empty());
}

#[sqlx::test]
async fn stats_aggregate_counts_and_unresolved(opts: SqlitePoolOptions, copts: SqliteConnectOptions) {
    let app = build_test_app(pool_of_one(opts, copts).await).await;
    let token = login(&app).await;

    let a = start_run(&app, &token, "scheduled").await;
    let b = start_run(&app, &token, "scheduled").await;
    start_run(&app, &token, "manual").await;
    put_json(
        &app,
        &format!("/api/gl/batch-runs/{a}/finish"),
        &token,
        json!({ "status": "succeeded", "unresolved_count": 4 }),
    )
    .await;
    put_json(
        &app,
        &format!("/api/gl/batch-runs/{b}/finish"),
        &token,
        json!({ "status": "failed", "error_message": "boom", "unresolved_count": 2 }),
    )
    .await;

    let response = get(&app, "/api/gl/batch-runs/stats", &token).await;
    assert_eq!(response.status(), StatusCode::OK);
    let stats = body_json(response).await;
    assert_eq!(stats["total_runs"], 3);
    assert_eq!(stats["last_24h_runs"], 3);
    assert_eq!(stats["status_counts"]["running"], 1);
    assert_eq!(stats["status_counts"]["succeeded"], 1);
    assert_eq!(stats["status_counts"]["failed"], 1);
    assert_eq!(stats["unresolved_last_24h"], 6);
    assert!(stats["avg_duration_seconds"].is_number());
}
