// src/validation.rs

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

use crate::reconciliation::AttendanceRow;
use crate::source_formats::is_missing_time;

/// A single rule failure on one attendance row.
///
/// Rule order is fixed: `MissingTime` is checked first, then
/// `IdenticalTimes`. Every failing rule is reported, not just the first
/// one, which matches what the HRMS page showed operators (the joined
/// error list per row).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ValidationFailure {
    #[error("Missing IN or OUT time")]
    MissingTime,
    #[error("IN time and OUT time are same")]
    IdenticalTimes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    Valid,
    Invalid(BTreeSet<ValidationFailure>),
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationResult::Valid)
    }
}

/// Validate a single row. Pure, no side effects.
///
/// Rule 1 (MissingTime): either punch absent or zero-like ("", "00:00",
/// "null", ...).
/// Rule 2 (IdenticalTimes): both punches present and equal after trimming.
/// Equality is string equality with no tolerance window.
///
/// Rows flagged `skip_validation` are an operator override and are accepted
/// as-is without running the rules.
pub fn validate(row: &AttendanceRow) -> ValidationResult {
    if row.skip_validation {
        return ValidationResult::Valid;
    }

    let mut reasons = BTreeSet::new();

    let in_missing = is_missing_time(&row.in_time);
    let out_missing = is_missing_time(&row.out_time);

    if in_missing || out_missing {
        reasons.insert(ValidationFailure::MissingTime);
    }

    if !in_missing && !out_missing && row.in_time.trim() == row.out_time.trim() {
        reasons.insert(ValidationFailure::IdenticalTimes);
    }

    if reasons.is_empty() {
        ValidationResult::Valid
    } else {
        ValidationResult::Invalid(reasons)
    }
}
