// src/batch_runs.rs
//
// Allocation-run monitoring. The external batch engine reports when a run
// starts and finishes; operators read recent runs and aggregate stats.
// Rows are append-only from the engine's point of view.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Sqlite};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument};

use crate::models::RuleSetType;
use crate::AppState;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BatchRun {
    pub id: i64,
    pub status: String,
    pub trigger_kind: String,
    pub set_type: Option<RuleSetType>,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub bookings_processed: i64,
    pub lines_written: i64,
    pub unresolved_count: i64,
    pub error_message: Option<String>,
    pub started_at: String,
    pub finished_at: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StartRunRequest {
    pub trigger_kind: String,
    pub set_type: Option<RuleSetType>,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
}

#[derive(Debug, Deserialize)]
pub struct FinishRunRequest {
    pub status: String,
    #[serde(default)]
    pub bookings_processed: i64,
    #[serde(default)]
    pub lines_written: i64,
    #[serde(default)]
    pub unresolved_count: i64,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RunFilters {
    pub status: Option<String>,
    pub set_type: Option<RuleSetType>,
    pub since: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RunStats {
    pub total_runs: i64,
    pub last_24h_runs: i64,
    pub status_counts: HashMap<String, i64>,
    pub avg_duration_seconds: Option<f64>,
    pub unresolved_last_24h: i64,
}

#[derive(Clone)]
pub struct RunRecorder {
    pub db: Pool<Sqlite>,
}

impl RunRecorder {
    pub fn new(db: Pool<Sqlite>) -> Self {
        Self { db }
    }

    #[instrument(skip(self))]
    pub async fn record_started(&self, req: &StartRunRequest) -> Result<BatchRun, sqlx::Error> {
        let run = sqlx::query_as::<_, BatchRun>(
            "INSERT INTO batch_runs (status, trigger_kind, set_type, period_start, period_end) \
             VALUES ('running', ?, ?, ?, ?) RETURNING *",
        )
        .bind(&req.trigger_kind)
        .bind(req.set_type)
        .bind(req.period_start)
        .bind(req.period_end)
        .fetch_one(&self.db)
        .await?;

        info!(
            run_id = run.id,
            trigger = %run.trigger_kind,
            period_start = %run.period_start,
            period_end = %run.period_end,
            "allocation run started"
        );
        Ok(run)
    }

    /// Close out a run. Only a row still in `running` can be finished.
    pub async fn record_finished(
        &self,
        run_id: i64,
        req: &FinishRunRequest,
    ) -> Result<Option<BatchRun>, sqlx::Error> {
        let run = sqlx::query_as::<_, BatchRun>(
            "UPDATE batch_runs SET status = ?, bookings_processed = ?, lines_written = ?, \
             unresolved_count = ?, error_message = ?, \
             finished_at = strftime('%Y-%m-%dT%H:%M:%fZ','now') \
             WHERE id = ? AND status = 'running' RETURNING *",
        )
        .bind(&req.status)
        .bind(req.bookings_processed)
        .bind(req.lines_written)
        .bind(req.unresolved_count)
        .bind(req.error_message.as_deref())
        .bind(run_id)
        .fetch_optional(&self.db)
        .await?;

        if let Some(ref run) = run {
            info!(
                run_id = run.id,
                status = %run.status,
                bookings = run.bookings_processed,
                lines = run.lines_written,
                unresolved = run.unresolved_count,
                "allocation run finished"
            );
        }
        Ok(run)
    }

    pub async fn list_recent(
        &self,
        limit: i64,
        offset: i64,
        filters: RunFilters,
    ) -> Result<Vec<BatchRun>, sqlx::Error> {
        // Separate queries per filter combination instead of dynamic SQL
        match filters {
            RunFilters { status: Some(status), set_type: Some(st), since: Some(since) } => {
                sqlx::query_as::<_, BatchRun>(
                    "SELECT * FROM batch_runs WHERE status = ? AND set_type = ? AND started_at >= ? \
                     ORDER BY started_at DESC LIMIT ? OFFSET ?",
                )
                .bind(status)
                .bind(st)
                .bind(since)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.db)
                .await
            }
            RunFilters { status: Some(status), set_type: Some(st), since: None } => {
                sqlx::query_as::<_, BatchRun>(
                    "SELECT * FROM batch_runs WHERE status = ? AND set_type = ? \
                     ORDER BY started_at DESC LIMIT ? OFFSET ?",
                )
                .bind(status)
                .bind(st)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.db)
                .await
            }
            RunFilters { status: Some(status), set_type: None, since: Some(since) } => {
                sqlx::query_as::<_, BatchRun>(
                    "SELECT * FROM batch_runs WHERE status = ? AND started_at >= ? \
                     ORDER BY started_at DESC LIMIT ? OFFSET ?",
                )
                .bind(status)
                .bind(since)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.db)
                .await
            }
            RunFilters { status: Some(status), set_type: None, since: None } => {
                sqlx::query_as::<_, BatchRun>(
                    "SELECT * FROM batch_runs WHERE status = ? \
                     ORDER BY started_at DESC LIMIT ? OFFSET ?",
                )
                .bind(status)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.db)
                .await
            }
            RunFilters { status: None, set_type: Some(st), since: Some(since) } => {
                sqlx::query_as::<_, BatchRun>(
                    "SELECT * FROM batch_runs WHERE set_type = ? AND started_at >= ? \
                     ORDER BY started_at DESC LIMIT ? OFFSET ?",
                )
                .bind(st)
                .bind(since)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.db)
                .await
            }
            RunFilters { status: None, set_type: Some(st), since: None } => {
                sqlx::query_as::<_, BatchRun>(
                    "SELECT * FROM batch_runs WHERE set_type = ? \
                     ORDER BY started_at DESC LIMIT ? OFFSET ?",
                )
                .bind(st)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.db)
                .await
            }
            RunFilters { status: None, set_type: None, since: Some(since) } => {
                sqlx::query_as::<_, BatchRun>(
                    "SELECT * FROM batch_runs WHERE started_at >= ? \
                     ORDER BY started_at DESC LIMIT ? OFFSET ?",
                )
                .bind(since)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.db)
                .await
            }
            RunFilters { status: None, set_type: None, since: None } => {
                sqlx::query_as::<_, BatchRun>(
                    "SELECT * FROM batch_runs ORDER BY started_at DESC LIMIT ? OFFSET ?",
                )
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.db)
                .await
            }
        }
    }

    pub async fn stats(&self) -> Result<RunStats, sqlx::Error> {
        let total_runs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM batch_runs")
            .fetch_one(&self.db)
            .await?;

        let last_24h_runs: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM batch_runs WHERE started_at >= datetime('now', '-1 day')",
        )
        .fetch_one(&self.db)
        .await?;

        let status_rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) as count FROM batch_runs GROUP BY status ORDER BY count DESC",
        )
        .fetch_all(&self.db)
        .await?;

        let avg_duration_seconds: Option<f64> = sqlx::query_scalar(
            "SELECT AVG((julianday(finished_at) - julianday(started_at)) * 86400.0) \
             FROM batch_runs WHERE finished_at IS NOT NULL",
        )
        .fetch_one(&self.db)
        .await?;

        let unresolved_last_24h: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(unresolved_count), 0) FROM batch_runs \
             WHERE started_at >= datetime('now', '-1 day')",
        )
        .fetch_one(&self.db)
        .await?;

        Ok(RunStats {
            total_runs,
            last_24h_runs,
            status_counts: status_rows.into_iter().collect(),
            avg_duration_seconds,
            unresolved_last_24h,
        })
    }
}

// ==================== HTTP handlers ====================

/// POST /api/gl/batch-runs
pub async fn start_run(
    State(st): State<Arc<AppState>>,
    Json(req): Json<StartRunRequest>,
) -> Result<(StatusCode, Json<BatchRun>), (StatusCode, String)> {
    if req.trigger_kind != "scheduled" && req.trigger_kind != "manual" {
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            "trigger_kind must be 'scheduled' or 'manual'".to_string(),
        ));
    }
    if req.period_start > req.period_end {
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            "period_start must not be after period_end".to_string(),
        ));
    }

    let run = st
        .runs
        .record_started(&req)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok((StatusCode::CREATED, Json(run)))
}

/// PUT /api/gl/batch-runs/{id}/finish
pub async fn finish_run(
    State(st): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<FinishRunRequest>,
) -> Result<Json<BatchRun>, (StatusCode, String)> {
    if req.status != "succeeded" && req.status != "failed" {
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            "status must be 'succeeded' or 'failed'".to_string(),
        ));
    }
    if req.status == "failed" && req.error_message.as_deref().unwrap_or("").is_empty() {
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            "a failed run requires an error_message".to_string(),
        ));
    }

    let exists: Option<(String,)> = sqlx::query_as("SELECT status FROM batch_runs WHERE id = ?")
        .bind(id)
        .fetch_optional(&st.db)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    match exists {
        None => Err((StatusCode::NOT_FOUND, "Run not found".to_string())),
        Some((status,)) if status != "running" => Err((
            StatusCode::CONFLICT,
            format!("Run already finished with status '{status}'"),
        )),
        Some(_) => {
            let run = st
                .runs
                .record_finished(id, &req)
                .await
                .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
                .ok_or((StatusCode::CONFLICT, "Run already finished".to_string()))?;
            Ok(Json(run))
        }
    }
}

#[derive(Deserialize)]
pub struct ListRunsQuery {
    pub status: Option<String>,
    pub set_type: Option<RuleSetType>,
    pub since: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// GET /api/gl/batch-runs
pub async fn list_runs(
    State(st): State<Arc<AppState>>,
    Query(q): Query<ListRunsQuery>,
) -> Result<Json<Vec<BatchRun>>, (StatusCode, String)> {
    let limit = q.limit.unwrap_or(50).clamp(1, 500);
    let offset = q.offset.unwrap_or(0).max(0);
    let filters = RunFilters { status: q.status, set_type: q.set_type, since: q.since };

    let runs = st
        .runs
        .list_recent(limit, offset, filters)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(runs))
}

/// GET /api/gl/batch-runs/stats
pub async fn run_stats(
    State(st): State<Arc<AppState>>,
) -> Result<Json<RunStats>, (StatusCode, String)> {
    let stats = st
        .runs
        .stats()
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(stats))
}
