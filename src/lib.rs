// src/lib.rs
//
// gl-admin-server: HTTP service owning GL allocation configuration
// (accounts, rule sets, rules), rule resolution, batch-run monitoring,
// invoice-batch review/export, and authentication. The router lives here
// so integration tests drive the same stack main() serves.

pub mod accounts;
pub mod auth;
pub mod auth_api;
pub mod batch_runs;
pub mod dates;
pub mod export;
pub mod invoice_batches;
pub mod models;
pub mod rule_sets;
pub mod rules;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use sqlx::{Pool, Sqlite};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};

use crate::auth::AuthService;
use crate::batch_runs::RunRecorder;
use crate::rules::PriorityTable;

#[derive(Clone)]
pub struct AppState {
    pub db: Pool<Sqlite>,
    pub auth: AuthService,
    pub runs: RunRecorder,
    pub priorities: PriorityTable,
}

impl AppState {
    pub fn new(db: Pool<Sqlite>, auth: AuthService, priorities: PriorityTable) -> Self {
        let runs = RunRecorder::new(db.clone());
        Self { db, auth, runs, priorities }
    }
}

/// The full application: health probe, static admin UI mount, and the
/// bearer-protected API (login excepted).
pub fn app(state: Arc<AppState>) -> Router {
    let protected = api_router()
        .route_layer(axum::middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .nest_service("/static", ServeDir::new("static"))
        .route("/", get(|| async { axum::response::Redirect::temporary("/static/index.html") }))
        .nest(
            "/api",
            Router::new()
                .route("/auth/login", post(auth_api::login))
                .merge(protected),
        )
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

fn api_router() -> Router<Arc<AppState>> {
    Router::new()
        // session + users + tokens
        .route("/auth/me", get(auth_api::get_current_user))
        .route("/auth/change-password", post(auth_api::change_password))
        .route("/users", get(auth_api::list_users).post(auth_api::create_user))
        .route(
            "/users/{id}",
            get(auth_api::get_user)
                .put(auth_api::update_user)
                .delete(auth_api::delete_user),
        )
        .route("/tokens", get(auth_api::list_my_tokens).post(auth_api::create_api_token))
        .route("/tokens/{id}", axum::routing::delete(auth_api::revoke_api_token))
        // GL accounts
        .route("/gl/accounts", get(accounts::list_accounts).post(accounts::create_account))
        .route(
            "/gl/accounts/{id}",
            get(accounts::get_account)
                .put(accounts::update_account)
                .delete(accounts::delete_account),
        )
        // rule sets + rules
        .route(
            "/gl/rule-sets",
            get(rule_sets::list_rule_sets).post(rule_sets::create_rule_set),
        )
        .route("/gl/rule-sets/suggested-range", get(rule_sets::suggested_range))
        .route(
            "/gl/rule-sets/{id}",
            get(rule_sets::get_rule_set)
                .put(rule_sets::update_rule_set)
                .delete(rule_sets::delete_rule_set),
        )
        .route("/gl/rule-sets/{id}/rules", post(rule_sets::create_rule))
        .route("/gl/rule-sets/{id}/copy-rules", post(rule_sets::copy_rules))
        .route("/gl/rule-sets/{id}/resolve", post(rule_sets::resolve_in_set))
        .route(
            "/gl/rules/{id}",
            put(rule_sets::update_rule).delete(rule_sets::delete_rule),
        )
        .route("/gl/resolve", get(rule_sets::resolve_on_date))
        // batch runs
        .route(
            "/gl/batch-runs",
            get(batch_runs::list_runs).post(batch_runs::start_run),
        )
        .route("/gl/batch-runs/stats", get(batch_runs::run_stats))
        .route("/gl/batch-runs/{id}/finish", put(batch_runs::finish_run))
        // invoice batches
        .route(
            "/gl/invoice-batches",
            get(invoice_batches::list_batches).post(invoice_batches::create_batch),
        )
        .route(
            "/gl/invoice-batches/{id}",
            get(invoice_batches::preview_batch).delete(invoice_batches::delete_batch),
        )
        .route("/gl/invoice-batches/{id}/status", post(invoice_batches::transition_batch))
        .route("/gl/invoice-batches/{id}/lines", post(invoice_batches::append_lines))
        .route("/gl/invoice-batches/{id}/export", post(invoice_batches::export_batch))
}

/// Bearer middleware: validates the session or API token and injects the
/// decoded `Claims` for handlers to consume.
async fn require_auth(
    State(st): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let token = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::to_string);

    let Some(token) = token else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "Missing bearer token" })),
        )
            .into_response();
    };

    match st.auth.validate_token(&token).await {
        Ok(claims) => {
            req.extensions_mut().insert(claims);
            next.run(req).await
        }
        Err(e) => (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}
