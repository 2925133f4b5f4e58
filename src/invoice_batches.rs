// src/invoice_batches.rs
//
// Invoice batches: reviewable sets of ledger lines moving through
// draft -> in_review -> approved -> exported, with reject (in_review ->
// draft) and reopen (approved -> in_review) as the only backward edges.
// Lines append only while the batch is draft; export is the terminal step
// and produces the XML ledger document.

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::export::{build_document, render_document, ExportLine};
use crate::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum BatchStatus {
    Draft,
    InReview,
    Approved,
    Exported,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Draft => "draft",
            BatchStatus::InReview => "in_review",
            BatchStatus::Approved => "approved",
            BatchStatus::Exported => "exported",
        }
    }

    /// The review workflow graph. `exported` is terminal and only ever
    /// reached through the export endpoint.
    pub fn can_transition(self, to: BatchStatus) -> bool {
        use BatchStatus::*;
        matches!(
            (self, to),
            (Draft, InReview) | (InReview, Approved) | (InReview, Draft) | (Approved, InReview)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct InvoiceBatch {
    pub id: i64,
    pub name: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub status: BatchStatus,
    pub deleted: bool,
    pub exported_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct InvoiceLine {
    pub id: i64,
    pub batch_id: i64,
    pub booking_ref: String,
    pub description: Option<String>,
    pub account_id: i64,
    pub amount_cents: i64,
    pub currency: String,
    pub entry_date: NaiveDate,
    pub created_at: String,
}

#[derive(Deserialize)]
pub struct CreateBatch {
    pub name: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
}

#[derive(Deserialize)]
pub struct TransitionRequest {
    pub status: BatchStatus,
}

#[derive(Deserialize)]
pub struct NewLine {
    pub booking_ref: String,
    pub description: Option<String>,
    pub account_id: i64,
    pub amount_cents: i64,
    #[serde(default = "default_currency")]
    pub currency: String,
    pub entry_date: NaiveDate,
}

fn default_currency() -> String {
    "EUR".to_string()
}

#[derive(Deserialize)]
pub struct AppendLinesRequest {
    pub lines: Vec<NewLine>,
}

/// Per-account rollup shown in the preview: one row per (account, currency).
#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct AccountTotal {
    pub account_id: i64,
    pub account_name: String,
    pub account_external_id: String,
    pub currency: String,
    pub line_count: i64,
    pub total_cents: i64,
}

#[derive(Serialize)]
pub struct BatchPreview {
    pub batch: InvoiceBatch,
    pub lines: Vec<InvoiceLine>,
    pub totals: Vec<AccountTotal>,
}

// ==================== Handlers ====================

#[derive(Deserialize)]
pub struct ListBatchesQuery {
    pub status: Option<BatchStatus>,
    #[serde(default)]
    pub include_deleted: bool,
}

/// GET /api/gl/invoice-batches
pub async fn list_batches(
    State(st): State<Arc<AppState>>,
    Query(q): Query<ListBatchesQuery>,
) -> Result<Json<Vec<InvoiceBatch>>, (StatusCode, String)> {
    let rows = match (q.status, q.include_deleted) {
        (Some(status), false) => {
            sqlx::query_as::<_, InvoiceBatch>(
                "SELECT * FROM invoice_batches WHERE status = ? AND deleted = 0 \
                 ORDER BY period_start DESC",
            )
            .bind(status)
            .fetch_all(&st.db)
            .await
        }
        (Some(status), true) => {
            sqlx::query_as::<_, InvoiceBatch>(
                "SELECT * FROM invoice_batches WHERE status = ? ORDER BY period_start DESC",
            )
            .bind(status)
            .fetch_all(&st.db)
            .await
        }
        (None, false) => {
            sqlx::query_as::<_, InvoiceBatch>(
                "SELECT * FROM invoice_batches WHERE deleted = 0 ORDER BY period_start DESC",
            )
            .fetch_all(&st.db)
            .await
        }
        (None, true) => {
            sqlx::query_as::<_, InvoiceBatch>(
                "SELECT * FROM invoice_batches ORDER BY period_start DESC",
            )
            .fetch_all(&st.db)
            .await
        }
    }
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(rows))
}

/// POST /api/gl/invoice-batches
pub async fn create_batch(
    State(st): State<Arc<AppState>>,
    Json(req): Json<CreateBatch>,
) -> Result<(StatusCode, Json<InvoiceBatch>), (StatusCode, String)> {
    if req.name.trim().is_empty() {
        return Err((StatusCode::UNPROCESSABLE_ENTITY, "name must not be empty".to_string()));
    }
    if req.period_start > req.period_end {
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            "period_start must not be after period_end".to_string(),
        ));
    }

    let batch = sqlx::query_as::<_, InvoiceBatch>(
        "INSERT INTO invoice_batches (name, period_start, period_end) \
         VALUES (?, ?, ?) RETURNING *",
    )
    .bind(req.name.trim())
    .bind(req.period_start)
    .bind(req.period_end)
    .fetch_one(&st.db)
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok((StatusCode::CREATED, Json(batch)))
}

/// GET /api/gl/invoice-batches/{id}
///
/// The batch, its lines, and per-account totals grouped by currency.
pub async fn preview_batch(
    State(st): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<BatchPreview>, (StatusCode, String)> {
    let batch = fetch_live_batch(&st, id).await?;

    let lines = sqlx::query_as::<_, InvoiceLine>(
        "SELECT * FROM invoice_lines WHERE batch_id = ? ORDER BY entry_date, id",
    )
    .bind(id)
    .fetch_all(&st.db)
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    let totals = sqlx::query_as::<_, AccountTotal>(
        "SELECT l.account_id, a.name AS account_name, a.external_id AS account_external_id, \
         l.currency, COUNT(*) AS line_count, SUM(l.amount_cents) AS total_cents \
         FROM invoice_lines l JOIN gl_accounts a ON a.id = l.account_id \
         WHERE l.batch_id = ? GROUP BY l.account_id, l.currency ORDER BY a.name, l.currency",
    )
    .bind(id)
    .fetch_all(&st.db)
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(BatchPreview { batch, lines, totals }))
}

/// POST /api/gl/invoice-batches/{id}/status
pub async fn transition_batch(
    State(st): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<TransitionRequest>,
) -> Result<Json<InvoiceBatch>, (StatusCode, String)> {
    let batch = fetch_live_batch(&st, id).await?;

    if !batch.status.can_transition(req.status) {
        return Err((
            StatusCode::CONFLICT,
            format!(
                "Cannot move batch from '{}' to '{}'",
                batch.status.as_str(),
                req.status.as_str()
            ),
        ));
    }

    let updated = sqlx::query_as::<_, InvoiceBatch>(
        "UPDATE invoice_batches SET status = ?, \
         updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now') \
         WHERE id = ? RETURNING *",
    )
    .bind(req.status)
    .bind(id)
    .fetch_one(&st.db)
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    info!(
        batch_id = id,
        from = batch.status.as_str(),
        to = req.status.as_str(),
        "invoice batch status changed"
    );
    Ok(Json(updated))
}

/// POST /api/gl/invoice-batches/{id}/lines
///
/// Append lines. Only draft batches accept lines; every line's account
/// must be live. All lines land in one transaction.
pub async fn append_lines(
    State(st): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<AppendLinesRequest>,
) -> Result<(StatusCode, Json<Vec<InvoiceLine>>), (StatusCode, String)> {
    let batch = fetch_live_batch(&st, id).await?;
    if batch.status != BatchStatus::Draft {
        return Err((
            StatusCode::CONFLICT,
            format!("Lines can only be added to draft batches, this one is '{}'", batch.status.as_str()),
        ));
    }
    if req.lines.is_empty() {
        return Err((StatusCode::UNPROCESSABLE_ENTITY, "no lines supplied".to_string()));
    }

    for line in &req.lines {
        if line.booking_ref.trim().is_empty() {
            return Err((
                StatusCode::UNPROCESSABLE_ENTITY,
                "booking_ref must not be empty".to_string(),
            ));
        }
        let live: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM gl_accounts WHERE id = ? AND deleted = 0")
                .bind(line.account_id)
                .fetch_optional(&st.db)
                .await
                .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
        if live.is_none() {
            return Err((
                StatusCode::UNPROCESSABLE_ENTITY,
                format!("account_id {} does not reference an active account", line.account_id),
            ));
        }
    }

    let mut tx = st
        .db
        .begin()
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    let mut inserted = Vec::with_capacity(req.lines.len());
    for line in &req.lines {
        let row = sqlx::query_as::<_, InvoiceLine>(
            "INSERT INTO invoice_lines \
             (batch_id, booking_ref, description, account_id, amount_cents, currency, entry_date) \
             VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING *",
        )
        .bind(id)
        .bind(line.booking_ref.trim())
        .bind(&line.description)
        .bind(line.account_id)
        .bind(line.amount_cents)
        .bind(&line.currency)
        .bind(line.entry_date)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
        inserted.push(row);
    }

    tx.commit()
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok((StatusCode::CREATED, Json(inserted)))
}

/// POST /api/gl/invoice-batches/{id}/export
///
/// Render the XML ledger document and move the batch to `exported`. Only
/// an approved batch may export; the status change and timestamp land
/// before the document is returned.
pub async fn export_batch(
    State(st): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let batch = fetch_live_batch(&st, id).await?;
    if batch.status != BatchStatus::Approved {
        return Err((
            StatusCode::CONFLICT,
            format!("Only approved batches can be exported, this one is '{}'", batch.status.as_str()),
        ));
    }

    let lines = sqlx::query_as::<_, ExportLine>(
        "SELECT l.booking_ref, l.description, a.external_id AS account_external_id, \
         l.amount_cents, l.currency, l.entry_date \
         FROM invoice_lines l JOIN gl_accounts a ON a.id = l.account_id \
         WHERE l.batch_id = ? ORDER BY l.entry_date, l.id",
    )
    .bind(id)
    .fetch_all(&st.db)
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    let doc = build_document(&batch, &lines);
    let xml = render_document(&doc)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    sqlx::query(
        "UPDATE invoice_batches SET status = 'exported', \
         exported_at = strftime('%Y-%m-%dT%H:%M:%fZ','now'), \
         updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now') \
         WHERE id = ?",
    )
    .bind(id)
    .execute(&st.db)
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    info!(
        batch_id = id,
        document_id = %doc.document_id,
        lines = lines.len(),
        "invoice batch exported"
    );

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, "application/xml".parse().unwrap());
    Ok((StatusCode::OK, headers, xml))
}

/// DELETE /api/gl/invoice-batches/{id}
///
/// Soft delete. Exported batches are part of the downstream record and
/// stay visible.
pub async fn delete_batch(
    State(st): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, (StatusCode, String)> {
    let batch = fetch_live_batch(&st, id).await?;
    if batch.status == BatchStatus::Exported {
        return Err((
            StatusCode::CONFLICT,
            "Exported batches cannot be deleted".to_string(),
        ));
    }

    sqlx::query(
        "UPDATE invoice_batches SET deleted = 1, \
         updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now') WHERE id = ?",
    )
    .bind(id)
    .execute(&st.db)
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(StatusCode::NO_CONTENT)
}

async fn fetch_live_batch(st: &AppState, id: i64) -> Result<InvoiceBatch, (StatusCode, String)> {
    sqlx::query_as::<_, InvoiceBatch>(
        "SELECT * FROM invoice_batches WHERE id = ? AND deleted = 0",
    )
    .bind(id)
    .fetch_optional(&st.db)
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
    .ok_or((StatusCode::NOT_FOUND, "Invoice batch not found".to_string()))
}

#[cfg(test)]
mod tests {
    use super::BatchStatus::*;

    #[test]
    fn workflow_allows_only_the_review_edges() {
        assert!(Draft.can_transition(InReview));
        assert!(InReview.can_transition(Approved));
        assert!(InReview.can_transition(Draft));
        assert!(Approved.can_transition(InReview));

        // no skipping ahead or resurrecting
        assert!(!Draft.can_transition(Approved));
        assert!(!Draft.can_transition(Exported));
        assert!(!InReview.can_transition(Exported));
        assert!(!Approved.can_transition(Draft));
        assert!(!Approved.can_transition(Exported)); // export endpoint only
        assert!(!Exported.can_transition(Draft));
        assert!(!Exported.can_transition(InReview));
        assert!(!Exported.can_transition(Approved));
    }

    #[test]
    fn no_self_transitions() {
        for s in [Draft, InReview, Approved, Exported] {
            assert!(!s.can_transition(s));
        }
    }
}
