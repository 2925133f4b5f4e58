// src/rules.rs

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{GlRule, GlRuleView};

/// Precedence class of a rule. Every kind except `Default` matches a booking
/// by comparing `target_id` against the corresponding classification id;
/// `Default` matches unconditionally and carries no target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum RuleKind {
    Resource,
    ProductSubType,
    ProductType,
    Default,
}

impl RuleKind {
    pub const ALL: [RuleKind; 4] = [
        RuleKind::Resource,
        RuleKind::ProductSubType,
        RuleKind::ProductType,
        RuleKind::Default,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::Resource => "resource",
            RuleKind::ProductSubType => "product_sub_type",
            RuleKind::ProductType => "product_type",
            RuleKind::Default => "default",
        }
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleKind {
    type Err = PriorityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "resource" => Ok(RuleKind::Resource),
            "product_sub_type" => Ok(RuleKind::ProductSubType),
            "product_type" => Ok(RuleKind::ProductType),
            "default" => Ok(RuleKind::Default),
            other => Err(PriorityError::UnknownKind(other.to_string())),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PriorityError {
    #[error("unknown rule kind '{0}'")]
    UnknownKind(String),
    #[error("malformed priority entry '{0}', expected kind=rank")]
    BadEntry(String),
    #[error("rule kind '{0}' listed twice")]
    DuplicateKind(RuleKind),
    #[error("rank {0} assigned to more than one rule kind")]
    DuplicateRank(u8),
    #[error("rule kind '{0}' missing from priority table")]
    MissingKind(RuleKind),
}

/// Evaluation order of the rule kinds, lower rank first. Injected at startup
/// (`GLADMIN_RULE_PRIORITIES`) so the precedence lives in configuration
/// instead of being scattered through evaluation code.
#[derive(Debug, Clone)]
pub struct PriorityTable {
    // (kind, rank), sorted by rank ascending
    ranks: Vec<(RuleKind, u8)>,
}

impl PriorityTable {
    /// The documented order: resource=1, product_sub_type=2, product_type=3,
    /// default=4.
    pub fn standard() -> Self {
        Self {
            ranks: vec![
                (RuleKind::Resource, 1),
                (RuleKind::ProductSubType, 2),
                (RuleKind::ProductType, 3),
                (RuleKind::Default, 4),
            ],
        }
    }

    /// Build a table from explicit pairs. All four kinds must appear exactly
    /// once with distinct ranks.
    pub fn new(pairs: Vec<(RuleKind, u8)>) -> Result<Self, PriorityError> {
        let mut ranks: Vec<(RuleKind, u8)> = Vec::with_capacity(4);
        for (kind, rank) in pairs {
            if ranks.iter().any(|(k, _)| *k == kind) {
                return Err(PriorityError::DuplicateKind(kind));
            }
            if ranks.iter().any(|(_, r)| *r == rank) {
                return Err(PriorityError::DuplicateRank(rank));
            }
            ranks.push((kind, rank));
        }
        for kind in RuleKind::ALL {
            if !ranks.iter().any(|(k, _)| *k == kind) {
                return Err(PriorityError::MissingKind(kind));
            }
        }
        ranks.sort_by_key(|(_, r)| *r);
        Ok(Self { ranks })
    }

    pub fn rank(&self, kind: RuleKind) -> u8 {
        // every kind is present by construction
        self.ranks
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, r)| *r)
            .unwrap_or(u8::MAX)
    }

    /// Kinds in ascending rank order.
    pub fn evaluation_order(&self) -> impl Iterator<Item = RuleKind> + '_ {
        self.ranks.iter().map(|(k, _)| *k)
    }
}

impl Default for PriorityTable {
    fn default() -> Self {
        Self::standard()
    }
}

impl FromStr for PriorityTable {
    type Err = PriorityError;

    /// Parses the config form, e.g.
    /// `resource=1,product_sub_type=2,product_type=3,default=4`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut pairs = Vec::new();
        for entry in s.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let (kind, rank) = entry
                .split_once('=')
                .ok_or_else(|| PriorityError::BadEntry(entry.to_string()))?;
            let kind: RuleKind = kind.trim().parse()?;
            let rank: u8 = rank
                .trim()
                .parse()
                .map_err(|_| PriorityError::BadEntry(entry.to_string()))?;
            pairs.push((kind, rank));
        }
        Self::new(pairs)
    }
}

/// A booking's classification as supplied by the caller. Any id may be
/// unknown; an absent id simply never matches rules of that kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BookingClass {
    pub resource_id: Option<i64>,
    pub product_type_id: Option<i64>,
    pub product_sub_type_id: Option<i64>,
}

impl BookingClass {
    fn id_for(&self, kind: RuleKind) -> Option<i64> {
        match kind {
            RuleKind::Resource => self.resource_id,
            RuleKind::ProductSubType => self.product_sub_type_id,
            RuleKind::ProductType => self.product_type_id,
            RuleKind::Default => None,
        }
    }
}

/// Data-integrity flag attached to resolutions and rule-set listings. These
/// describe states that predate the write-time checks (or bypassed them) and
/// must stay visible to operators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityWarning {
    MissingDefault,
    DuplicateDefaults { count: usize },
    DuplicateTargets { kind: RuleKind, target_id: i64, count: usize },
}

impl fmt::Display for IntegrityWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityWarning::MissingDefault => {
                write!(f, "rule set has no default rule")
            }
            IntegrityWarning::DuplicateDefaults { count } => {
                write!(f, "rule set has {count} default rules, lowest id wins")
            }
            IntegrityWarning::DuplicateTargets { kind, target_id, count } => {
                write!(
                    f,
                    "{count} {kind} rules share target {target_id}, lowest id wins"
                )
            }
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("no rule matched and the rule set has no default rule")]
    NoDefaultRule,
}

#[derive(Debug)]
pub struct Resolution<'a> {
    pub rule: &'a GlRule,
    pub warnings: Vec<IntegrityWarning>,
}

/// Pick the single rule that allocates a booking's transaction line.
///
/// Kinds are evaluated in the table's rank order; the first kind with a
/// matching non-deleted rule wins. `Default` matches unconditionally. Within
/// one kind the lowest rule id wins deterministically, with a warning when
/// more than one candidate existed. No match and no default rule is an error,
/// never a silent allocation.
pub fn resolve<'a>(
    table: &PriorityTable,
    rules: &'a [GlRule],
    booking: &BookingClass,
) -> Result<Resolution<'a>, ResolveError> {
    for kind in table.evaluation_order() {
        if kind == RuleKind::Default {
            let defaults: Vec<&GlRule> = rules
                .iter()
                .filter(|r| !r.deleted && r.rule_kind == RuleKind::Default)
                .collect();
            if let Some(winner) = defaults.iter().copied().min_by_key(|r| r.id) {
                let warnings = if defaults.len() > 1 {
                    vec![IntegrityWarning::DuplicateDefaults { count: defaults.len() }]
                } else {
                    Vec::new()
                };
                return Ok(Resolution { rule: winner, warnings });
            }
            continue;
        }

        let Some(want) = booking.id_for(kind) else {
            continue;
        };
        let matches: Vec<&GlRule> = rules
            .iter()
            .filter(|r| !r.deleted && r.rule_kind == kind && r.target_id == Some(want))
            .collect();
        if let Some(winner) = matches.iter().copied().min_by_key(|r| r.id) {
            let warnings = if matches.len() > 1 {
                vec![IntegrityWarning::DuplicateTargets {
                    kind,
                    target_id: want,
                    count: matches.len(),
                }]
            } else {
                Vec::new()
            };
            return Ok(Resolution { rule: winner, warnings });
        }
    }
    Err(ResolveError::NoDefaultRule)
}

/// Integrity flags for a rule collection, independent of any booking. Used by
/// the rule-set detail view so operators see the same problems the resolver
/// would trip over.
pub fn audit_rules(rules: &[GlRule]) -> Vec<IntegrityWarning> {
    let mut warnings = Vec::new();

    let defaults = rules
        .iter()
        .filter(|r| !r.deleted && r.rule_kind == RuleKind::Default)
        .count();
    if defaults == 0 {
        warnings.push(IntegrityWarning::MissingDefault);
    } else if defaults > 1 {
        warnings.push(IntegrityWarning::DuplicateDefaults { count: defaults });
    }

    let mut seen: HashMap<(RuleKind, i64), usize> = HashMap::new();
    for r in rules.iter().filter(|r| !r.deleted) {
        if r.rule_kind == RuleKind::Default {
            continue;
        }
        if let Some(target) = r.target_id {
            *seen.entry((r.rule_kind, target)).or_insert(0) += 1;
        }
    }
    let mut dups: Vec<((RuleKind, i64), usize)> =
        seen.into_iter().filter(|(_, n)| *n > 1).collect();
    dups.sort_by_key(|(key, _)| *key);
    for ((kind, target_id), count) in dups {
        warnings.push(IntegrityWarning::DuplicateTargets { kind, target_id, count });
    }
    warnings
}

/// Ordering for rule listings: rank ascending, then case-insensitive target
/// label. Display only; evaluation never consults labels.
pub fn display_order(table: &PriorityTable, rules: &mut [GlRuleView]) {
    rules.sort_by_key(|r| {
        (
            table.rank(r.rule_kind),
            r.target_label.as_deref().unwrap_or("").to_lowercase(),
            r.id,
        )
    });
}
