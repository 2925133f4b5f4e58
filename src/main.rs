use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gl_admin_server::auth::AuthService;
use gl_admin_server::rules::PriorityTable;
use gl_admin_server::{app, AppState};

fn ensure_sqlite_parent(db_url: &str) -> std::io::Result<()> {
    if !db_url.starts_with("sqlite:") { return Ok(()); }
    if db_url.contains(":memory:") { return Ok(()); }

    let path_str = if let Some(rest) = db_url.strip_prefix("sqlite://") {
        rest
    } else if let Some(rest) = db_url.strip_prefix("sqlite:") {
        rest
    } else { return Ok(()); };

    if path_str.is_empty() { return Ok(()); }
    let p = std::path::Path::new(path_str);
    if let Some(parent) = p.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("gl_admin_server=info".parse()?),
        )
        .init();

    let db_url = std::env::var("GLADMIN_DB").unwrap_or_else(|_| "sqlite://gladmin.db".to_string());
    let jwt_secret =
        std::env::var("GLADMIN_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".to_string());
    let session_hours: i64 = std::env::var("GLADMIN_SESSION_HOURS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(24);
    let bootstrap_password =
        std::env::var("GLADMIN_BOOTSTRAP_ADMIN_PASSWORD").unwrap_or_else(|_| "admin".to_string());

    // Evaluation order is configuration; a malformed table stops startup.
    let priorities = match std::env::var("GLADMIN_RULE_PRIORITIES") {
        Ok(spec) => spec.parse::<PriorityTable>()?,
        Err(_) => PriorityTable::standard(),
    };

    ensure_sqlite_parent(&db_url).ok();

    let conn_opts = SqliteConnectOptions::from_str(&db_url)?.create_if_missing(true);
    let db = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(conn_opts)
        .await?;
    sqlx::migrate!().run(&db).await?;

    let auth = AuthService::new(db.clone(), jwt_secret, session_hours);
    auth.ensure_bootstrap_admin(&bootstrap_password).await?;

    let state = Arc::new(AppState::new(db, auth, priorities));
    let router = app(state);

    let port: u16 = std::env::var("GLADMIN_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;
    info!("GL admin server listening on http://{addr}  (UI: /)");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}
