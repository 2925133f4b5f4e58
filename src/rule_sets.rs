// src/rule_sets.rs
//
// Rule sets and the rules inside them: CRUD with the schedule invariant
// (same-type windows never overlap), rule invariants (single default,
// unique (kind, target)), bulk copy between sets, and the resolution
// endpoints that run the priority resolver against stored rules.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

use crate::dates::{find_conflict, suggest_range, DateRange, DateRangeError};
use crate::models::{
    CopyRulesRequest, CopyRulesResult, CreateRule, CreateRuleSet, GlAccount, GlRule, GlRuleSet,
    GlRuleView, ResolveResponse, RuleSetDetail, RuleSetType, SuggestedRange, UpdateRule,
    UpdateRuleSet,
};
use crate::rules::{audit_rules, display_order, resolve, BookingClass, RuleKind};
use crate::AppState;

const RULE_VIEW_SQL: &str = "SELECT r.id, r.rule_kind, r.target_id, r.target_label, \
     r.account_id, a.name AS account_name, a.external_id AS account_external_id, \
     r.created_at, r.updated_at \
     FROM gl_rules r JOIN gl_accounts a ON a.id = r.account_id \
     WHERE r.gl_rule_set_id = ? AND r.deleted = 0";

// ==================== Rule sets ====================

#[derive(Deserialize)]
pub struct ListRuleSetsQuery {
    pub set_type: Option<RuleSetType>,
    #[serde(default)]
    pub include_deleted: bool,
}

/// GET /api/gl/rule-sets
pub async fn list_rule_sets(
    State(st): State<Arc<AppState>>,
    Query(q): Query<ListRuleSetsQuery>,
) -> Result<Json<Vec<GlRuleSet>>, (StatusCode, String)> {
    let rows = match (q.set_type, q.include_deleted) {
        (Some(t), false) => {
            sqlx::query_as::<_, GlRuleSet>(
                "SELECT * FROM gl_rule_sets WHERE set_type = ? AND deleted = 0 ORDER BY start_date",
            )
            .bind(t)
            .fetch_all(&st.db)
            .await
        }
        (Some(t), true) => {
            sqlx::query_as::<_, GlRuleSet>(
                "SELECT * FROM gl_rule_sets WHERE set_type = ? ORDER BY start_date",
            )
            .bind(t)
            .fetch_all(&st.db)
            .await
        }
        (None, false) => {
            sqlx::query_as::<_, GlRuleSet>(
                "SELECT * FROM gl_rule_sets WHERE deleted = 0 ORDER BY start_date",
            )
            .fetch_all(&st.db)
            .await
        }
        (None, true) => {
            sqlx::query_as::<_, GlRuleSet>("SELECT * FROM gl_rule_sets ORDER BY start_date")
                .fetch_all(&st.db)
                .await
        }
    }
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(rows))
}

/// POST /api/gl/rule-sets
pub async fn create_rule_set(
    State(st): State<Arc<AppState>>,
    Json(req): Json<CreateRuleSet>,
) -> Result<(StatusCode, Json<GlRuleSet>), (StatusCode, String)> {
    if req.name.trim().is_empty() {
        return Err((StatusCode::UNPROCESSABLE_ENTITY, "name must not be empty".to_string()));
    }
    let range = DateRange::new(req.start_date, req.end_date)
        .map_err(|e| (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))?;

    check_schedule(&st, &range, req.set_type, None).await?;

    let set = sqlx::query_as::<_, GlRuleSet>(
        "INSERT INTO gl_rule_sets (name, set_type, start_date, end_date) \
         VALUES (?, ?, ?, ?) RETURNING *",
    )
    .bind(req.name.trim())
    .bind(req.set_type)
    .bind(req.start_date)
    .bind(req.end_date)
    .fetch_one(&st.db)
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    info!(
        rule_set_id = set.id,
        set_type = set.set_type.as_str(),
        "rule set created"
    );
    Ok((StatusCode::CREATED, Json(set)))
}

/// GET /api/gl/rule-sets/{id}
///
/// The set, its rules in display order, and the integrity warnings the
/// resolver would see.
pub async fn get_rule_set(
    State(st): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<RuleSetDetail>, (StatusCode, String)> {
    let rule_set = fetch_live_set(&st, id).await?;

    let mut views = sqlx::query_as::<_, GlRuleView>(RULE_VIEW_SQL)
        .bind(id)
        .fetch_all(&st.db)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    display_order(&st.priorities, &mut views);

    let rules = fetch_live_rules(&st, id).await?;
    let warnings = audit_rules(&rules).iter().map(|w| w.to_string()).collect();

    Ok(Json(RuleSetDetail { rule_set, rules: views, warnings }))
}

/// PUT /api/gl/rule-sets/{id}
///
/// Rename and/or move the window. The overlap check re-runs excluding this
/// set's own row. `set_type` is create-time-only.
pub async fn update_rule_set(
    State(st): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateRuleSet>,
) -> Result<Json<GlRuleSet>, (StatusCode, String)> {
    let current = fetch_live_set(&st, id).await?;

    let name = req.name.unwrap_or(current.name);
    if name.trim().is_empty() {
        return Err((StatusCode::UNPROCESSABLE_ENTITY, "name must not be empty".to_string()));
    }
    let start = req.start_date.unwrap_or(current.start_date);
    let end = req.end_date.unwrap_or(current.end_date);
    let range = DateRange::new(start, end)
        .map_err(|e| (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))?;

    check_schedule(&st, &range, current.set_type, Some(id)).await?;

    let set = sqlx::query_as::<_, GlRuleSet>(
        "UPDATE gl_rule_sets SET name = ?, start_date = ?, end_date = ?, \
         updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now') \
         WHERE id = ? RETURNING *",
    )
    .bind(name.trim())
    .bind(start)
    .bind(end)
    .bind(id)
    .fetch_one(&st.db)
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(set))
}

/// DELETE /api/gl/rule-sets/{id}
///
/// Soft delete, cascading to the set's rules in the same transaction.
pub async fn delete_rule_set(
    State(st): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, (StatusCode, String)> {
    fetch_live_set(&st, id).await?;

    let mut tx = st
        .db
        .begin()
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    sqlx::query(
        "UPDATE gl_rule_sets SET deleted = 1, \
         updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now') WHERE id = ?",
    )
    .bind(id)
    .execute(&mut *tx)
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    sqlx::query(
        "UPDATE gl_rules SET deleted = 1, \
         updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now') \
         WHERE gl_rule_set_id = ? AND deleted = 0",
    )
    .bind(id)
    .execute(&mut *tx)
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    tx.commit()
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    info!(rule_set_id = id, "rule set soft-deleted with its rules");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct SuggestedRangeQuery {
    pub set_type: RuleSetType,
    pub prev_end: Option<NaiveDate>,
    pub next_start: Option<NaiveDate>,
}

/// GET /api/gl/rule-sets/suggested-range
///
/// Pre-fill dates for a new set. With no explicit neighbours the latest
/// existing end of that type is used, so the plain add flow proposes the
/// next period.
pub async fn suggested_range(
    State(st): State<Arc<AppState>>,
    Query(q): Query<SuggestedRangeQuery>,
) -> Result<Json<SuggestedRange>, (StatusCode, String)> {
    let prev_end = match (q.prev_end, q.next_start) {
        (None, None) => {
            sqlx::query_scalar::<_, Option<NaiveDate>>(
                "SELECT MAX(end_date) FROM gl_rule_sets WHERE set_type = ? AND deleted = 0",
            )
            .bind(q.set_type)
            .fetch_one(&st.db)
            .await
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        }
        _ => q.prev_end,
    };

    let today = Utc::now().date_naive();
    let range = suggest_range(today, prev_end, q.next_start).map_err(|e| match e {
        DateRangeError::NoGap { .. } => (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()),
        DateRangeError::Invalid { .. } => (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()),
    })?;

    Ok(Json(SuggestedRange { start_date: range.start, end_date: range.end }))
}

// ==================== Rules ====================

/// POST /api/gl/rule-sets/{id}/rules
pub async fn create_rule(
    State(st): State<Arc<AppState>>,
    Path(set_id): Path<i64>,
    Json(req): Json<CreateRule>,
) -> Result<(StatusCode, Json<GlRule>), (StatusCode, String)> {
    fetch_live_set(&st, set_id).await?;

    match req.rule_kind {
        RuleKind::Default => {
            if req.target_id.is_some() {
                return Err((
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "default rules carry no target_id".to_string(),
                ));
            }
        }
        kind => {
            if req.target_id.is_none() {
                return Err((
                    StatusCode::UNPROCESSABLE_ENTITY,
                    format!("{kind} rules require a target_id"),
                ));
            }
        }
    }

    ensure_live_account(&st, req.account_id).await?;
    ensure_rule_slot_free(&st, set_id, req.rule_kind, req.target_id, None).await?;

    let rule = sqlx::query_as::<_, GlRule>(
        "INSERT INTO gl_rules (gl_rule_set_id, rule_kind, target_id, target_label, account_id) \
         VALUES (?, ?, ?, ?, ?) RETURNING *",
    )
    .bind(set_id)
    .bind(req.rule_kind)
    .bind(req.target_id)
    .bind(req.target_label)
    .bind(req.account_id)
    .fetch_one(&st.db)
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok((StatusCode::CREATED, Json(rule)))
}

/// PUT /api/gl/rules/{id}
///
/// Retarget or reassign a rule. `rule_kind` never changes; a default rule's
/// target stays null.
pub async fn update_rule(
    State(st): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateRule>,
) -> Result<Json<GlRule>, (StatusCode, String)> {
    let current = sqlx::query_as::<_, GlRule>(
        "SELECT * FROM gl_rules WHERE id = ? AND deleted = 0",
    )
    .bind(id)
    .fetch_optional(&st.db)
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
    .ok_or((StatusCode::NOT_FOUND, "Rule not found".to_string()))?;

    let target_id = match current.rule_kind {
        RuleKind::Default => {
            if req.target_id.is_some() {
                return Err((
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "default rules carry no target_id".to_string(),
                ));
            }
            None
        }
        _ => req.target_id.or(current.target_id),
    };
    let target_label = req.target_label.or(current.target_label);
    let account_id = req.account_id.unwrap_or(current.account_id);

    ensure_live_account(&st, account_id).await?;
    ensure_rule_slot_free(&st, current.gl_rule_set_id, current.rule_kind, target_id, Some(id))
        .await?;

    let rule = sqlx::query_as::<_, GlRule>(
        "UPDATE gl_rules SET target_id = ?, target_label = ?, account_id = ?, \
         updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now') \
         WHERE id = ? RETURNING *",
    )
    .bind(target_id)
    .bind(target_label)
    .bind(account_id)
    .bind(id)
    .fetch_one(&st.db)
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(rule))
}

/// DELETE /api/gl/rules/{id}
///
/// Soft delete. Default rules are refused: a live set must keep its
/// fallback, so the default can only be re-pointed, never removed.
pub async fn delete_rule(
    State(st): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, (StatusCode, String)> {
    let rule = sqlx::query_as::<_, GlRule>(
        "SELECT * FROM gl_rules WHERE id = ? AND deleted = 0",
    )
    .bind(id)
    .fetch_optional(&st.db)
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
    .ok_or((StatusCode::NOT_FOUND, "Rule not found".to_string()))?;

    if rule.rule_kind == RuleKind::Default {
        return Err((
            StatusCode::CONFLICT,
            "The default rule cannot be deleted; update its account instead".to_string(),
        ));
    }

    sqlx::query(
        "UPDATE gl_rules SET deleted = 1, \
         updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now') WHERE id = ?",
    )
    .bind(id)
    .execute(&st.db)
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/gl/rule-sets/{id}/copy-rules
///
/// Seed a fresh set from an existing one. The target must still be empty;
/// `rule_kind`, `target_id`, `target_label` and `account_id` are preserved,
/// new rows get new ids and timestamps, all in one transaction.
pub async fn copy_rules(
    State(st): State<Arc<AppState>>,
    Path(target_id): Path<i64>,
    Json(req): Json<CopyRulesRequest>,
) -> Result<Json<CopyRulesResult>, (StatusCode, String)> {
    fetch_live_set(&st, target_id).await?;
    let source = sqlx::query_as::<_, GlRuleSet>(
        "SELECT * FROM gl_rule_sets WHERE id = ? AND deleted = 0",
    )
    .bind(req.source_rule_set_id)
    .fetch_optional(&st.db)
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
    .ok_or((StatusCode::NOT_FOUND, "Source rule set not found".to_string()))?;

    let existing: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM gl_rules WHERE gl_rule_set_id = ? AND deleted = 0",
    )
    .bind(target_id)
    .fetch_one(&st.db)
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    if existing > 0 {
        return Err((
            StatusCode::CONFLICT,
            "Target rule set already has rules".to_string(),
        ));
    }

    let source_rules = fetch_live_rules(&st, source.id).await?;

    let mut tx = st
        .db
        .begin()
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    let mut copied: u32 = 0;
    for r in &source_rules {
        sqlx::query(
            "INSERT INTO gl_rules (gl_rule_set_id, rule_kind, target_id, target_label, account_id) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(target_id)
        .bind(r.rule_kind)
        .bind(r.target_id)
        .bind(&r.target_label)
        .bind(r.account_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
        copied += 1;
    }

    tx.commit()
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    info!(
        source_rule_set_id = source.id,
        target_rule_set_id = target_id,
        rules_copied = copied,
        "rules copied between rule sets"
    );
    Ok(Json(CopyRulesResult {
        source_rule_set_id: source.id,
        target_rule_set_id: target_id,
        rules_copied: copied,
    }))
}

// ==================== Resolution ====================

/// POST /api/gl/rule-sets/{id}/resolve
pub async fn resolve_in_set(
    State(st): State<Arc<AppState>>,
    Path(set_id): Path<i64>,
    Json(booking): Json<BookingClass>,
) -> Result<Json<ResolveResponse>, (StatusCode, Json<serde_json::Value>)> {
    let set = fetch_live_set(&st, set_id)
        .await
        .map_err(|(s, m)| (s, Json(serde_json::json!({ "error": m }))))?;
    run_resolution(&st, &set, &booking).await
}

#[derive(Deserialize)]
pub struct ResolveQuery {
    pub set_type: RuleSetType,
    pub on_date: NaiveDate,
    pub resource_id: Option<i64>,
    pub product_type_id: Option<i64>,
    pub product_sub_type_id: Option<i64>,
}

/// GET /api/gl/resolve
///
/// Find the active set of the given type covering `on_date` (unique by the
/// overlap invariant), then resolve the booking inside it.
pub async fn resolve_on_date(
    State(st): State<Arc<AppState>>,
    Query(q): Query<ResolveQuery>,
) -> Result<Json<ResolveResponse>, (StatusCode, Json<serde_json::Value>)> {
    let sets = sqlx::query_as::<_, GlRuleSet>(
        "SELECT * FROM gl_rule_sets WHERE set_type = ? AND deleted = 0",
    )
    .bind(q.set_type)
    .fetch_all(&st.db)
    .await
    .map_err(internal)?;

    let set = sets
        .into_iter()
        .find(|rs| rs.range().contains(q.on_date))
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({
                    "error": format!(
                        "no active {} rule set covers {}",
                        q.set_type.as_str(),
                        q.on_date
                    )
                })),
            )
        })?;

    let booking = BookingClass {
        resource_id: q.resource_id,
        product_type_id: q.product_type_id,
        product_sub_type_id: q.product_sub_type_id,
    };
    run_resolution(&st, &set, &booking).await
}

async fn run_resolution(
    st: &AppState,
    set: &GlRuleSet,
    booking: &BookingClass,
) -> Result<Json<ResolveResponse>, (StatusCode, Json<serde_json::Value>)> {
    let rules = fetch_live_rules(st, set.id)
        .await
        .map_err(|(s, m)| (s, Json(serde_json::json!({ "error": m }))))?;

    let resolution = resolve(&st.priorities, &rules, booking).map_err(|e| {
        (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({ "error": e.to_string(), "kind": "no_default_rule" })),
        )
    })?;

    let account = sqlx::query_as::<_, GlAccount>("SELECT * FROM gl_accounts WHERE id = ?")
        .bind(resolution.rule.account_id)
        .fetch_one(&st.db)
        .await
        .map_err(internal)?;

    Ok(Json(ResolveResponse {
        rule: resolution.rule.clone(),
        account,
        warnings: resolution.warnings.iter().map(|w| w.to_string()).collect(),
    }))
}

// ==================== Helpers ====================

fn internal<E: std::fmt::Display>(e: E) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": e.to_string() })),
    )
}

async fn fetch_live_set(st: &AppState, id: i64) -> Result<GlRuleSet, (StatusCode, String)> {
    sqlx::query_as::<_, GlRuleSet>("SELECT * FROM gl_rule_sets WHERE id = ? AND deleted = 0")
        .bind(id)
        .fetch_optional(&st.db)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .ok_or((StatusCode::NOT_FOUND, "Rule set not found".to_string()))
}

async fn fetch_live_rules(st: &AppState, set_id: i64) -> Result<Vec<GlRule>, (StatusCode, String)> {
    sqlx::query_as::<_, GlRule>(
        "SELECT * FROM gl_rules WHERE gl_rule_set_id = ? AND deleted = 0 ORDER BY id",
    )
    .bind(set_id)
    .fetch_all(&st.db)
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

/// 409 naming the conflicting set when the candidate window collides with a
/// live set of the same type.
async fn check_schedule(
    st: &AppState,
    candidate: &DateRange,
    set_type: RuleSetType,
    exclude: Option<i64>,
) -> Result<(), (StatusCode, String)> {
    let existing = sqlx::query_as::<_, GlRuleSet>(
        "SELECT * FROM gl_rule_sets WHERE set_type = ? AND deleted = 0",
    )
    .bind(set_type)
    .fetch_all(&st.db)
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    if let Some(hit) = find_conflict(candidate, set_type, &existing, exclude) {
        return Err((
            StatusCode::CONFLICT,
            format!(
                "Date range overlaps {} rule set '{}' ({} to {})",
                set_type.as_str(),
                hit.name,
                hit.start_date,
                hit.end_date
            ),
        ));
    }
    Ok(())
}

/// Single-default and (kind, target) uniqueness among live rules of one set.
async fn ensure_rule_slot_free(
    st: &AppState,
    set_id: i64,
    kind: RuleKind,
    target_id: Option<i64>,
    exclude: Option<i64>,
) -> Result<(), (StatusCode, String)> {
    let taken: Option<(i64,)> = match kind {
        RuleKind::Default => {
            sqlx::query_as(
                "SELECT id FROM gl_rules WHERE gl_rule_set_id = ? AND rule_kind = 'default' \
                 AND deleted = 0 AND id != ?",
            )
            .bind(set_id)
            .bind(exclude.unwrap_or(-1))
            .fetch_optional(&st.db)
            .await
        }
        _ => {
            sqlx::query_as(
                "SELECT id FROM gl_rules WHERE gl_rule_set_id = ? AND rule_kind = ? \
                 AND target_id = ? AND deleted = 0 AND id != ?",
            )
            .bind(set_id)
            .bind(kind)
            .bind(target_id)
            .bind(exclude.unwrap_or(-1))
            .fetch_optional(&st.db)
            .await
        }
    }
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    if taken.is_some() {
        let msg = match kind {
            RuleKind::Default => "Rule set already has a default rule".to_string(),
            _ => format!(
                "A {kind} rule for target {} already exists in this rule set",
                target_id.unwrap_or(-1)
            ),
        };
        return Err((StatusCode::CONFLICT, msg));
    }
    Ok(())
}

async fn ensure_live_account(st: &AppState, account_id: i64) -> Result<(), (StatusCode, String)> {
    let live: Option<(i64,)> =
        sqlx::query_as("SELECT id FROM gl_accounts WHERE id = ? AND deleted = 0")
            .bind(account_id)
            .fetch_optional(&st.db)
            .await
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    if live.is_none() {
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("account_id {account_id} does not reference an active account"),
        ));
    }
    Ok(())
}
