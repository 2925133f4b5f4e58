// src/models.rs

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::dates::DateRange;
use crate::rules::RuleKind;

/// Lane a rule set belongs to. Sets of different types may overlap in time;
/// sets of the same type never may.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum RuleSetType {
    Revenue,
    Commission,
    CancellationFee,
}

impl RuleSetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleSetType::Revenue => "revenue",
            RuleSetType::Commission => "commission",
            RuleSetType::CancellationFee => "cancellation_fee",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct GlAccount {
    pub id: i64,
    pub name: String,
    pub external_id: String,
    pub deleted: bool,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Deserialize)]
pub struct CreateAccount {
    pub name: String,
    pub external_id: String,
}

#[derive(Deserialize)]
pub struct UpdateAccount {
    pub name: Option<String>,
    pub external_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct GlRuleSet {
    pub id: i64,
    pub name: String,
    pub set_type: RuleSetType,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub deleted: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl GlRuleSet {
    /// The set's active window as a closed interval. Rows are validated at
    /// write time, so this never re-checks the bounds.
    pub fn range(&self) -> DateRange {
        DateRange {
            start: self.start_date,
            end: self.end_date,
        }
    }
}

#[derive(Deserialize)]
pub struct CreateRuleSet {
    pub name: String,
    pub set_type: RuleSetType,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

#[derive(Deserialize)]
pub struct UpdateRuleSet {
    pub name: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct GlRule {
    pub id: i64,
    pub gl_rule_set_id: i64,
    pub rule_kind: RuleKind,
    pub target_id: Option<i64>,
    pub target_label: Option<String>,
    pub account_id: i64,
    pub deleted: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// Rule row joined with its account, as listed in the rule-set detail view.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct GlRuleView {
    pub id: i64,
    pub rule_kind: RuleKind,
    pub target_id: Option<i64>,
    pub target_label: Option<String>,
    pub account_id: i64,
    pub account_name: String,
    pub account_external_id: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Deserialize)]
pub struct CreateRule {
    pub rule_kind: RuleKind,
    pub target_id: Option<i64>,
    pub target_label: Option<String>,
    pub account_id: i64,
}

#[derive(Deserialize)]
pub struct UpdateRule {
    pub target_id: Option<i64>,
    pub target_label: Option<String>,
    pub account_id: Option<i64>,
}

#[derive(Serialize)]
pub struct RuleSetDetail {
    pub rule_set: GlRuleSet,
    pub rules: Vec<GlRuleView>,
    pub warnings: Vec<String>,
}

#[derive(Deserialize)]
pub struct CopyRulesRequest {
    pub source_rule_set_id: i64,
}

#[derive(Serialize)]
pub struct CopyRulesResult {
    pub source_rule_set_id: i64,
    pub target_rule_set_id: i64,
    pub rules_copied: u32,
}

#[derive(Serialize)]
pub struct ResolveResponse {
    pub rule: GlRule,
    pub account: GlAccount,
    pub warnings: Vec<String>,
}

#[derive(Serialize)]
pub struct SuggestedRange {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}
