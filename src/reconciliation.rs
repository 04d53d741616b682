// src/reconciliation.rs
//
// The reconciliation pipeline: club raw punches into a per-employee
// preview, partition it through the row validator, and run the operator
// correction loop until every row sits in the validated set.

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::source_formats::{format_time, DeviceRow, NormalizedRow, RawSource, DEFAULT_SHIFT};
use crate::validation::{validate, ValidationFailure, ValidationResult};

// --- Row model ---

/// One reconciled attendance row, one employee-day.
///
/// Punch times are kept as strings on this side of the pipeline: operator
/// edits arrive as text, a blank string means "no punch", and the validator
/// compares them as strings. `source_label`/`out_source_label` name the
/// device or app that produced each punch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRow {
    pub employee_id: String,
    pub employee_name: String,
    pub date: NaiveDate,
    pub shift: String,
    #[serde(default)]
    pub in_time: String,
    #[serde(default)]
    pub out_time: String,
    #[serde(default)]
    pub source_label: String,
    #[serde(default)]
    pub out_source_label: String,
    #[serde(default)]
    pub skip_validation: bool,
}

/// A row that failed validation, kept with its original preview index so
/// the correction table stays stable across re-validation rounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidRow {
    pub index: usize,
    pub row: AttendanceRow,
    pub reasons: BTreeSet<ValidationFailure>,
}

impl InvalidRow {
    /// Operator-facing rule messages, in rule order.
    pub fn error_messages(&self) -> Vec<String> {
        self.reasons.iter().map(|r| r.to_string()).collect()
    }
}

// --- Raw bundle ---

/// Raw rows per source, exactly as parsed from the uploads plus the app
/// check-ins pulled from the HRMS.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RawAttendanceBundle {
    pub zicom: Vec<DeviceRow>,
    pub essl: Vec<DeviceRow>,
    pub mantra: Vec<DeviceRow>,
    pub other: Vec<DeviceRow>,
    pub app: Vec<DeviceRow>,
}

impl RawAttendanceBundle {
    pub fn get(&self, source: RawSource) -> &[DeviceRow] {
        match source {
            RawSource::ZicomRegal => &self.zicom,
            RawSource::EsslWestcott => &self.essl,
            RawSource::Mantra => &self.mantra,
            RawSource::Other => &self.other,
            RawSource::App => &self.app,
        }
    }

    pub fn set(&mut self, source: RawSource, rows: Vec<DeviceRow>) {
        match source {
            RawSource::ZicomRegal => self.zicom = rows,
            RawSource::EsslWestcott => self.essl = rows,
            RawSource::Mantra => self.mantra = rows,
            RawSource::Other => self.other = rows,
            RawSource::App => self.app = rows,
        }
    }

    pub fn all_rows(&self) -> impl Iterator<Item = &DeviceRow> {
        self.zicom
            .iter()
            .chain(&self.essl)
            .chain(&self.mantra)
            .chain(&self.other)
            .chain(&self.app)
    }

    pub fn total_rows(&self) -> usize {
        self.all_rows().count()
    }

    pub fn is_empty(&self) -> bool {
        self.all_rows().next().is_none()
    }
}

// --- Preview builder (punch clubbing) ---

#[derive(Debug, Clone)]
struct Punch {
    time: NaiveTime,
    source: String,
}

/// Club every punch for an employee-day across all sources: sort the pool,
/// first punch becomes the in time, last punch the out time. One output row
/// per employee per day, days in order, employees in id order.
pub fn build_preview(rows: &[NormalizedRow]) -> BTreeMap<String, Vec<AttendanceRow>> {
    let mut name_cache: HashMap<String, String> = HashMap::new();
    let mut by_emp_day: BTreeMap<String, BTreeMap<NaiveDate, (String, Vec<Punch>)>> =
        BTreeMap::new();

    for row in rows {
        if !row.employee_name.is_empty() {
            name_cache
                .entry(row.employee_id.clone())
                .or_insert_with(|| row.employee_name.clone());
        }
        let day_entry = by_emp_day
            .entry(row.employee_id.clone())
            .or_default()
            .entry(row.date)
            .or_insert_with(|| (row.shift.clone(), Vec::new()));
        if let Some(t) = row.in_time {
            day_entry.1.push(Punch {
                time: t,
                source: row.source.clone(),
            });
        }
        if let Some(t) = row.out_time {
            day_entry.1.push(Punch {
                time: t,
                source: row.source.clone(),
            });
        }
    }

    let mut preview = BTreeMap::new();
    for (emp_id, days) in by_emp_day {
        let emp_name = name_cache.get(&emp_id).cloned().unwrap_or_default();
        let mut emp_rows = Vec::with_capacity(days.len());
        for (date, (shift, mut punches)) in days {
            punches.sort_by_key(|p| p.time);
            let first = punches.first();
            let last = punches.last();
            emp_rows.push(AttendanceRow {
                employee_id: emp_id.clone(),
                employee_name: emp_name.clone(),
                date,
                shift: if shift.is_empty() {
                    DEFAULT_SHIFT.to_string()
                } else {
                    shift
                },
                in_time: format_time(first.map(|p| p.time)),
                out_time: format_time(last.map(|p| p.time)),
                source_label: first.map(|p| p.source.clone()).unwrap_or_default(),
                out_source_label: last.map(|p| p.source.clone()).unwrap_or_default(),
                skip_validation: false,
            });
        }
        preview.insert(emp_id, emp_rows);
    }
    preview
}

/// Flatten the per-employee preview into one indexed sequence (employee id
/// order, then date order) for display and validation.
pub fn flatten_preview(preview: &BTreeMap<String, Vec<AttendanceRow>>) -> Vec<AttendanceRow> {
    preview.values().flatten().cloned().collect()
}

// --- Partitioner / merger ---

#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub validated: BTreeMap<String, Vec<AttendanceRow>>,
    pub non_validated: Vec<InvalidRow>,
}

impl ValidationReport {
    pub fn total_valid(&self) -> usize {
        self.validated.values().map(Vec::len).sum()
    }

    pub fn total_invalid(&self) -> usize {
        self.non_validated.len()
    }
}

/// Partition rows into valid (grouped per employee, input order kept within
/// each group) and invalid (flat, original index kept).
pub fn partition(rows: &[AttendanceRow]) -> ValidationReport {
    partition_indexed(rows.iter().cloned().enumerate())
}

fn partition_indexed(rows: impl IntoIterator<Item = (usize, AttendanceRow)>) -> ValidationReport {
    let mut report = ValidationReport::default();
    for (index, row) in rows {
        match validate(&row) {
            ValidationResult::Valid => {
                report
                    .validated
                    .entry(row.employee_id.clone())
                    .or_default()
                    .push(row);
            }
            ValidationResult::Invalid(reasons) => {
                report.non_validated.push(InvalidRow { index, row, reasons });
            }
        }
    }
    report
}

/// Append newly validated rows to the per-employee sequences. Existing
/// entries are never overwritten; prior order is preserved.
pub fn merge_corrected(
    existing: &mut BTreeMap<String, Vec<AttendanceRow>>,
    newly_valid: BTreeMap<String, Vec<AttendanceRow>>,
) {
    for (emp_id, rows) in newly_valid {
        existing.entry(emp_id).or_default().extend(rows);
    }
}

// --- Pagination ---

/// Slice one page out of `items`. `page_number` is clamped to
/// `[1, ceil(len / page_size)]`; a zero page size is treated as one.
/// Stateless and pure.
pub fn page<T>(items: &[T], page_number: usize, page_size: usize) -> &[T] {
    let size = page_size.max(1);
    let total_pages = items.len().div_ceil(size).max(1);
    let p = page_number.clamp(1, total_pages);
    let start = (p - 1) * size;
    let end = (start + size).min(items.len());
    &items[start..end]
}

/// Number of pages `items` spans at `page_size` (at least one).
pub fn total_pages(len: usize, page_size: usize) -> usize {
    len.div_ceil(page_size.max(1)).max(1)
}

// --- Correction loop ---

/// Operator edit of one non-validated row, keyed by the row's preview
/// index. `None` time fields leave the current value untouched.
#[derive(Debug, Clone, Deserialize)]
pub struct RowCorrection {
    pub index: usize,
    #[serde(default)]
    pub in_time: Option<String>,
    #[serde(default)]
    pub out_time: Option<String>,
    #[serde(default)]
    pub skip_validation: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CorrectionOutcome {
    pub accepted: usize,
    pub revalidated: usize,
    pub still_invalid: usize,
}

// --- Session ---

/// In-memory state of one reconciliation run, owned by the page session
/// that drives it. Created empty, populated by raw import, partitioned by
/// validation, mutated only by the correction loop, and dropped once the
/// import commit succeeds.
///
/// Invariant: after `run_validation`, every preview row lives in exactly
/// one of `validated` / `non_validated`; corrections move rows between the
/// two and never discard any.
#[derive(Debug, Clone, Default)]
pub struct ReconciliationSession {
    pub raw: RawAttendanceBundle,
    pub period: Option<(NaiveDate, NaiveDate)>,
    pub unmapped_rows: usize,
    pub preview: Vec<AttendanceRow>,
    pub validated: BTreeMap<String, Vec<AttendanceRow>>,
    pub non_validated: Vec<InvalidRow>,
}

impl ReconciliationSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the raw bundle for a payroll period. Resets any downstream
    /// preview/validation state from a previous load.
    pub fn set_raw(&mut self, raw: RawAttendanceBundle, from: NaiveDate, to: NaiveDate) {
        self.raw = raw;
        self.period = Some((from, to));
        self.preview.clear();
        self.validated.clear();
        self.non_validated.clear();
    }

    /// Build the merged preview from the raw bundle. Returns the number of
    /// preview rows.
    pub fn build_preview(&mut self, allotments: &HashMap<(String, String), String>) -> usize {
        let device_rows: Vec<DeviceRow> = self.raw.all_rows().cloned().collect();
        let (normalized, skipped) = crate::source_formats::normalize_rows(&device_rows, allotments);
        self.unmapped_rows = skipped;
        let grouped = build_preview(&normalized);
        self.preview = flatten_preview(&grouped);
        self.validated.clear();
        self.non_validated.clear();
        self.preview.len()
    }

    /// Partition the preview into validated / non-validated sets.
    pub fn run_validation(&mut self) -> (usize, usize) {
        let report = partition(&self.preview);
        self.validated = report.validated;
        self.non_validated = report.non_validated;
        (self.total_valid(), self.non_validated.len())
    }

    /// One round of the correction loop.
    ///
    /// Rows whose correction sets `skip_validation` are accepted straight
    /// into the valid set (operator override, validator not re-run). The
    /// rest are re-run through the validator with any edited times; rows
    /// that still fail stay pending under their original index.
    pub fn apply_corrections(&mut self, corrections: &[RowCorrection]) -> CorrectionOutcome {
        let by_index: HashMap<usize, &RowCorrection> =
            corrections.iter().map(|c| (c.index, c)).collect();

        let pending = std::mem::take(&mut self.non_validated);
        let mut accepted: BTreeMap<String, Vec<AttendanceRow>> = BTreeMap::new();
        let mut resubmitted: Vec<(usize, AttendanceRow)> = Vec::new();
        let mut outcome = CorrectionOutcome::default();

        for mut invalid in pending {
            if let Some(correction) = by_index.get(&invalid.index) {
                if let Some(in_time) = &correction.in_time {
                    invalid.row.in_time = in_time.clone();
                }
                if let Some(out_time) = &correction.out_time {
                    invalid.row.out_time = out_time.clone();
                }
                if correction.skip_validation {
                    invalid.row.skip_validation = true;
                    accepted
                        .entry(invalid.row.employee_id.clone())
                        .or_default()
                        .push(invalid.row);
                    outcome.accepted += 1;
                    continue;
                }
            }
            outcome.revalidated += 1;
            resubmitted.push((invalid.index, invalid.row));
        }

        merge_corrected(&mut self.validated, accepted);

        let report = partition_indexed(resubmitted);
        merge_corrected(&mut self.validated, report.validated);
        self.non_validated = report.non_validated;
        outcome.still_invalid = self.non_validated.len();
        outcome
    }

    pub fn total_valid(&self) -> usize {
        self.validated.values().map(Vec::len).sum()
    }

    /// True once every row has reached the valid set.
    pub fn is_fully_validated(&self) -> bool {
        self.non_validated.is_empty() && !self.validated.is_empty()
    }
}
