// src/dates.rs

use chrono::{Datelike, Days, Months, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{GlRuleSet, RuleSetType};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DateRangeError {
    #[error("start_date {start} must be strictly before end_date {end}")]
    Invalid { start: NaiveDate, end: NaiveDate },
    #[error("no room for a rule set between {prev_end} and {next_start}")]
    NoGap { prev_end: NaiveDate, next_start: NaiveDate },
}

/// Inclusive validity window of a rule set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, DateRangeError> {
        if start >= end {
            return Err(DateRangeError::Invalid { start, end });
        }
        Ok(Self { start, end })
    }

    /// Closed-interval intersection: a shared boundary day counts as overlap.
    pub fn overlaps(&self, other: &DateRange) -> bool {
        self.start <= other.end && self.end >= other.start
    }

    pub fn contains(&self, day: NaiveDate) -> bool {
        self.start <= day && day <= self.end
    }
}

/// First rule set of the same type whose window intersects `candidate`,
/// ignoring soft-deleted rows and (on update) the row being edited.
pub fn find_conflict<'a>(
    candidate: &DateRange,
    set_type: RuleSetType,
    existing: &'a [GlRuleSet],
    exclude: Option<i64>,
) -> Option<&'a GlRuleSet> {
    existing.iter().find(|rs| {
        !rs.deleted
            && rs.set_type == set_type
            && Some(rs.id) != exclude
            && candidate.overlaps(&rs.range())
    })
}

fn first_of_month(day: NaiveDate) -> NaiveDate {
    NaiveDate::from_ymd_opt(day.year(), day.month(), 1).unwrap_or(day)
}

fn last_of_month(day: NaiveDate) -> NaiveDate {
    first_of_month(day) + Months::new(1) - Days::new(1)
}

/// Suggest a window for a new rule set from its neighbours.
///
/// With no neighbours: twelve months starting at the current month. With
/// only a successor: twelve months ending the day before it. With only a
/// predecessor: twelve months starting the month after it ends. Between two
/// neighbours: the gap, snapped to month boundaries where the gap allows it.
pub fn suggest_range(
    today: NaiveDate,
    prev_end: Option<NaiveDate>,
    next_start: Option<NaiveDate>,
) -> Result<DateRange, DateRangeError> {
    match (prev_end, next_start) {
        (None, None) => {
            let start = first_of_month(today);
            let end = last_of_month(start + Months::new(11));
            DateRange::new(start, end)
        }
        (None, Some(next)) => {
            let end = next - Days::new(1);
            let start = first_of_month(end - Months::new(11));
            DateRange::new(start, end)
        }
        (Some(prev), None) => {
            let start = first_of_month(prev) + Months::new(1);
            let end = last_of_month(start + Months::new(11));
            DateRange::new(start, end)
        }
        (Some(prev), Some(next)) => {
            let lo = prev + Days::new(1);
            let hi = next - Days::new(1);
            if lo >= hi {
                return Err(DateRangeError::NoGap { prev_end: prev, next_start: next });
            }
            let aligned_lo = if lo.day() == 1 {
                lo
            } else {
                first_of_month(lo) + Months::new(1)
            };
            let aligned_hi = if hi == last_of_month(hi) {
                hi
            } else {
                first_of_month(hi) - Days::new(1)
            };
            let start = if aligned_lo <= hi { aligned_lo } else { lo };
            let end = if aligned_hi >= lo { aligned_hi } else { hi };
            if start < end {
                DateRange::new(start, end)
            } else {
                DateRange::new(lo, hi)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn set(id: i64, set_type: RuleSetType, start: NaiveDate, end: NaiveDate) -> GlRuleSet {
        GlRuleSet {
            id,
            name: format!("set {id}"),
            set_type,
            start_date: start,
            end_date: end,
            deleted: false,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn rejects_empty_and_inverted_ranges() {
        assert!(DateRange::new(d(2024, 1, 1), d(2024, 1, 1)).is_err());
        assert!(DateRange::new(d(2024, 2, 1), d(2024, 1, 1)).is_err());
        assert!(DateRange::new(d(2024, 1, 1), d(2024, 1, 2)).is_ok());
    }

    #[test]
    fn overlap_is_symmetric() {
        let a = DateRange::new(d(2024, 1, 1), d(2024, 6, 30)).unwrap();
        let b = DateRange::new(d(2024, 6, 1), d(2024, 12, 31)).unwrap();
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
    }

    #[test]
    fn shared_boundary_day_counts_as_overlap() {
        let a = DateRange::new(d(2024, 1, 1), d(2024, 1, 31)).unwrap();
        let b = DateRange::new(d(2024, 1, 31), d(2024, 2, 28)).unwrap();
        assert!(a.overlaps(&b));
    }

    #[test]
    fn adjacent_ranges_do_not_overlap() {
        let a = DateRange::new(d(2024, 1, 1), d(2024, 1, 31)).unwrap();
        let b = DateRange::new(d(2024, 2, 1), d(2024, 2, 29)).unwrap();
        assert!(!a.overlaps(&b));
        assert!(!b.overlaps(&a));
    }

    #[test]
    fn containment_counts_as_overlap() {
        let outer = DateRange::new(d(2024, 1, 1), d(2024, 12, 31)).unwrap();
        let inner = DateRange::new(d(2024, 5, 1), d(2024, 5, 31)).unwrap();
        assert!(outer.overlaps(&inner));
        assert!(inner.overlaps(&outer));
    }

    #[test]
    fn contains_checks_both_endpoints() {
        let r = DateRange::new(d(2024, 3, 1), d(2024, 3, 31)).unwrap();
        assert!(r.contains(d(2024, 3, 1)));
        assert!(r.contains(d(2024, 3, 31)));
        assert!(!r.contains(d(2024, 4, 1)));
        assert!(!r.contains(d(2024, 2, 29)));
    }

    #[test]
    fn conflict_lookup_respects_type_and_exclusion() {
        let existing = vec![
            set(1, RuleSetType::Revenue, d(2024, 1, 1), d(2024, 12, 31)),
            set(2, RuleSetType::Commission, d(2024, 1, 1), d(2024, 12, 31)),
        ];
        let candidate = DateRange::new(d(2024, 6, 1), d(2025, 5, 31)).unwrap();

        let hit = find_conflict(&candidate, RuleSetType::Revenue, &existing, None);
        assert_eq!(hit.map(|rs| rs.id), Some(1));
        // same window, different type: allowed
        assert!(find_conflict(&candidate, RuleSetType::CancellationFee, &existing, None).is_none());
        // editing set 1 itself must not conflict with its own row
        assert!(find_conflict(&candidate, RuleSetType::Revenue, &existing, Some(1)).is_none());
    }

    #[test]
    fn conflict_lookup_skips_deleted_rows() {
        let mut gone = set(1, RuleSetType::Revenue, d(2024, 1, 1), d(2024, 12, 31));
        gone.deleted = true;
        let candidate = DateRange::new(d(2024, 6, 1), d(2024, 7, 1)).unwrap();
        assert!(find_conflict(&candidate, RuleSetType::Revenue, &[gone], None).is_none());
    }

    #[test]
    fn suggestion_without_neighbours_covers_twelve_months() {
        let r = suggest_range(d(2024, 3, 15), None, None).unwrap();
        assert_eq!(r.start, d(2024, 3, 1));
        assert_eq!(r.end, d(2025, 2, 28));
    }

    #[test]
    fn suggestion_before_a_successor_ends_the_day_before() {
        let r = suggest_range(d(2024, 3, 15), None, Some(d(2025, 1, 1))).unwrap();
        assert_eq!(r.end, d(2024, 12, 31));
        assert_eq!(r.start, d(2024, 1, 1));
    }

    #[test]
    fn suggestion_after_a_predecessor_starts_the_next_month() {
        let r = suggest_range(d(2024, 3, 15), Some(d(2024, 12, 31)), None).unwrap();
        assert_eq!(r.start, d(2025, 1, 1));
        assert_eq!(r.end, d(2025, 12, 31));
        // predecessor ending mid-month still snaps forward
        let r = suggest_range(d(2024, 3, 15), Some(d(2024, 6, 10)), None).unwrap();
        assert_eq!(r.start, d(2024, 7, 1));
        assert_eq!(r.end, d(2025, 6, 30));
    }

    #[test]
    fn suggestion_between_neighbours_snaps_to_whole_months() {
        let r = suggest_range(
            d(2024, 3, 15),
            Some(d(2024, 1, 31)),
            Some(d(2025, 1, 1)),
        )
        .unwrap();
        assert_eq!(r.start, d(2024, 2, 1));
        assert_eq!(r.end, d(2024, 12, 31));
    }

    #[test]
    fn narrow_gap_falls_back_to_the_raw_bounds() {
        // no whole month fits between Jan 5 and Feb 10
        let r = suggest_range(d(2024, 3, 15), Some(d(2024, 1, 5)), Some(d(2024, 2, 10))).unwrap();
        assert_eq!(r.start, d(2024, 1, 6));
        assert_eq!(r.end, d(2024, 2, 9));
    }

    #[test]
    fn touching_neighbours_leave_no_gap() {
        let err =
            suggest_range(d(2024, 3, 15), Some(d(2024, 1, 31)), Some(d(2024, 2, 1))).unwrap_err();
        assert_eq!(
            err,
            DateRangeError::NoGap {
                prev_end: d(2024, 1, 31),
                next_start: d(2024, 2, 1),
            }
        );
    }

    #[test]
    fn leap_february_gets_its_29th() {
        let r = suggest_range(d(2023, 3, 10), None, None).unwrap();
        assert_eq!(r.start, d(2023, 3, 1));
        assert_eq!(r.end, d(2024, 2, 29));
    }
}
