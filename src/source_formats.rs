// src/source_formats.rs
//
// Parsers for the raw attendance dumps the payroll operators upload. Each
// biometric vendor exports a different sheet layout; everything is funneled
// into `DeviceRow` and then normalized into `NormalizedRow` for the
// reconciliation pipeline. Uploads are CSV exports of the vendor sheets,
// column geometry preserved.

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use thiserror::Error;
use tracing::warn;

// --- Errors ---

#[derive(Error, Debug)]
pub enum SourceFormatError {
    #[error("CSV parse error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Missing required column: {0}")]
    MissingColumn(String),

    #[error("Invalid or missing period cell in Zicom Regal sheet")]
    InvalidPeriod,

    #[error("No day-number header row found in Zicom Regal sheet")]
    MissingDayHeader,
}

// --- Sources ---

/// Originating device/vendor of a raw attendance file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RawSource {
    ZicomRegal,
    EsslWestcott,
    Mantra,
    Other,
    App,
}

impl RawSource {
    /// Human-facing source label attached to each raw row.
    pub fn label(self) -> &'static str {
        match self {
            RawSource::ZicomRegal => "Zicom Regal",
            RawSource::EsslWestcott => "ESSL Westcott",
            RawSource::Mantra => "Mantra",
            RawSource::Other => "Other",
            RawSource::App => "App",
        }
    }

    /// Stable key used in upload field names and export targets.
    pub fn key(self) -> &'static str {
        match self {
            RawSource::ZicomRegal => "zicom",
            RawSource::EsslWestcott => "essl",
            RawSource::Mantra => "mantra",
            RawSource::Other => "other",
            RawSource::App => "app",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "zicom" => Some(RawSource::ZicomRegal),
            "essl" => Some(RawSource::EsslWestcott),
            "mantra" => Some(RawSource::Mantra),
            "other" => Some(RawSource::Other),
            "app" => Some(RawSource::App),
            _ => None,
        }
    }
}

// --- Row shapes ---

/// A raw row as it came off a device dump or the check-in app, before
/// employee resolution. Times stay strings here; anything zero-like means
/// "no punch".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRow {
    #[serde(default)]
    pub device_id: String,
    pub device: String,
    #[serde(default)]
    pub employee_id: Option<String>,
    pub employee_name: String,
    pub attendance_date: NaiveDate,
    pub shift: String,
    #[serde(default)]
    pub in_time: String,
    #[serde(default)]
    pub out_time: String,
}

/// A device row resolved to an employee with parsed punch times. Input to
/// the preview builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedRow {
    pub employee_id: String,
    pub employee_name: String,
    pub date: NaiveDate,
    pub shift: String,
    pub in_time: Option<NaiveTime>,
    pub out_time: Option<NaiveTime>,
    pub source: String,
}

pub const DEFAULT_SHIFT: &str = "Regular";

// --- Lenient time/date handling ---

// Values the device dumps use for "no punch recorded". Compared after
// trimming and lowercasing.
static MISSING_TIME_STRINGS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "", "0", "00", "none", "null", "nat", "00:00", "00:00:00", "0:0", "0:00", "00:0",
    ]
    .into_iter()
    .collect()
});

/// True if a time value is blank or zero-like.
pub fn is_missing_time(val: &str) -> bool {
    MISSING_TIME_STRINGS.contains(val.trim().to_ascii_lowercase().as_str())
}

const TIME_ONLY_FORMATS: &[&str] = &[
    "%H:%M:%S",
    "%H:%M",
    "%H:%M:%S%.f",
    "%I:%M:%S %p",
    "%I:%M %p",
];

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %I:%M:%S %p",
    "%Y-%m-%d %I:%M %p",
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
    "%d-%m-%Y %H:%M:%S",
    "%d-%m-%Y %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d-%b-%Y", "%d/%m/%Y", "%Y/%m/%d", "%d-%m-%Y"];

/// Parse a time cell in any of the formats the vendor dumps use. Returns
/// `None` for blank/zero-like or unparseable values.
pub fn parse_time_lenient(value: &str) -> Option<NaiveTime> {
    let s = value.trim();
    if is_missing_time(s) {
        return None;
    }
    for fmt in TIME_ONLY_FORMATS {
        if let Ok(t) = NaiveTime::parse_from_str(s, fmt) {
            return Some(t);
        }
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.time());
        }
    }
    None
}

/// Parse a date cell, trying each known vendor format in turn.
pub fn parse_date_lenient(value: &str) -> Option<NaiveDate> {
    let s = value.trim();
    if s.is_empty() {
        return None;
    }
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Some(d);
        }
    }
    // Last resort: datetime cells where only the date part matters.
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.date());
        }
    }
    None
}

/// Format a parsed punch back to the canonical wire form.
pub fn format_time(t: Option<NaiveTime>) -> String {
    match t {
        Some(t) => t.format("%H:%M:%S").to_string(),
        None => String::new(),
    }
}

/// Merge split header cells like `Attendance,Device,Id` back into
/// `Attendance Device Id`. Some dumps break one logical header across
/// several cells; the terminating words below close a group.
pub fn merge_split_headers(cells: &[String]) -> Vec<String> {
    const PARTS: &[&str] = &[
        "attendance", "device", "id", "employee", "name", "date", "shift", "in", "out", "time",
    ];
    const TERMINATORS: &[&str] = &["id", "name", "date", "shift", "time"];

    let mut merged = Vec::new();
    let mut pending: Vec<String> = Vec::new();
    for cell in cells {
        let text = cell.trim();
        if text.is_empty() {
            continue;
        }
        let lower = text.to_ascii_lowercase();
        if PARTS.contains(&lower.as_str()) {
            pending.push(text.to_string());
            if TERMINATORS.contains(&lower.as_str()) {
                merged.push(pending.join(" "));
                pending.clear();
            }
        } else {
            merged.push(text.to_string());
        }
    }
    if !pending.is_empty() {
        merged.push(pending.join(" "));
    }
    merged
}

fn header_index(headers: &[String]) -> HashMap<String, usize> {
    headers
        .iter()
        .enumerate()
        .map(|(i, h)| (h.trim().to_ascii_lowercase(), i))
        .collect()
}

fn require_columns(
    index: &HashMap<String, usize>,
    required: &[&str],
) -> Result<(), SourceFormatError> {
    for col in required {
        if !index.contains_key(*col) {
            return Err(SourceFormatError::MissingColumn((*col).to_string()));
        }
    }
    Ok(())
}

fn field<'a>(record: &'a csv::StringRecord, idx: Option<&usize>) -> &'a str {
    idx.and_then(|i| record.get(*i)).unwrap_or("").trim()
}

// --- Zicom Regal ("Att.log report" sheet) ---

// Punch cells look like "09:00-18:15" or "09:00   18:15"; a lone "09:00"
// means only the in punch registered.
static PUNCH_CELL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{1,2}:\d{2})(?:[^0-9]+(\d{1,2}:\d{2}))?$").expect("punch cell regex")
});

/// Parse the Zicom Regal attendance log export.
///
/// Layout (CSV export of the xlsx, columns preserved): a period cell
/// `01-Apr-2025 ~ 30-Apr-2025` near the top, a day-number header row, then
/// repeating employee blocks of an `ID:` row (device id in the third cell,
/// name in the eleventh) followed by one row of punch cells aligned with the
/// day columns.
pub fn parse_zicom(data: &[u8]) -> Result<Vec<DeviceRow>, SourceFormatError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(Cursor::new(data));

    let records: Vec<csv::StringRecord> = reader.records().collect::<Result<_, _>>()?;

    // Period cell gives the month the day columns belong to.
    let period_start = records
        .iter()
        .take(4)
        .flat_map(|r| r.iter())
        .find(|cell| cell.contains('~'))
        .and_then(|cell| parse_date_lenient(cell.split('~').next().unwrap_or("")))
        .ok_or(SourceFormatError::InvalidPeriod)?;

    // Day header: the row whose cells are the day numbers, position mapped
    // to column index.
    let mut day_columns: Vec<(usize, u32)> = Vec::new();
    let mut day_header_row = None;
    for (row_idx, record) in records.iter().enumerate() {
        let days: Vec<(usize, u32)> = record
            .iter()
            .enumerate()
            .filter_map(|(col, cell)| {
                cell.trim()
                    .parse::<u32>()
                    .ok()
                    .filter(|d| (1..=31).contains(d))
                    .map(|d| (col, d))
            })
            .collect();
        if days.len() >= 2 {
            day_columns = days;
            day_header_row = Some(row_idx);
            break;
        }
    }
    if day_header_row.is_none() {
        return Err(SourceFormatError::MissingDayHeader);
    }

    let mut rows = Vec::new();
    let mut i = day_header_row.unwrap_or(0) + 1;
    while i < records.len() {
        let record = &records[i];
        if record.get(0).map(str::trim) != Some("ID:") {
            i += 1;
            continue;
        }
        let device_id = record.get(2).unwrap_or("").trim().to_string();
        let emp_name = record.get(10).unwrap_or("").trim().to_string();
        let Some(punch_record) = records.get(i + 1) else {
            break;
        };

        for (col, day) in &day_columns {
            let cell = punch_record.get(*col).unwrap_or("").trim();
            if cell.is_empty() {
                continue;
            }
            let Some(caps) = PUNCH_CELL_RE.captures(cell) else {
                warn!("Unrecognized Zicom punch cell '{}' for device id {}", cell, device_id);
                continue;
            };
            let in_time = caps
                .get(1)
                .and_then(|m| parse_time_lenient(m.as_str()))
                .map(|t| format_time(Some(t)))
                .unwrap_or_default();
            let out_time = caps
                .get(2)
                .and_then(|m| parse_time_lenient(m.as_str()))
                .map(|t| format_time(Some(t)))
                .unwrap_or_default();

            let Some(date) =
                NaiveDate::from_ymd_opt(period_start.year(), period_start.month(), *day)
            else {
                continue;
            };
            rows.push(DeviceRow {
                device_id: device_id.clone(),
                device: RawSource::ZicomRegal.label().to_string(),
                employee_id: None,
                employee_name: emp_name.clone(),
                attendance_date: date,
                shift: DEFAULT_SHIFT.to_string(),
                in_time,
                out_time,
            });
        }
        i += 2;
    }
    Ok(rows)
}

// --- ESSL Westcott ("Final" sheet) ---

/// Parse the ESSL Westcott export: headered rows with `ID`, `G` (name),
/// `Date`, `In Time`, `Out Time`. Rows missing id/name/date are skipped;
/// exact repeats are dropped.
pub fn parse_essl(data: &[u8]) -> Result<Vec<DeviceRow>, SourceFormatError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(Cursor::new(data));

    let headers: Vec<String> = reader.headers()?.iter().map(|h| h.to_string()).collect();
    let index = header_index(&headers);
    require_columns(&index, &["id", "g", "date", "in time", "out time"])?;

    let mut rows = Vec::new();
    let mut seen = HashSet::new();
    for record in reader.records() {
        let record = record?;
        let device_id = field(&record, index.get("id"));
        let emp_name = field(&record, index.get("g"));
        let date_val = field(&record, index.get("date"));
        if device_id.is_empty() || emp_name.is_empty() || date_val.is_empty() {
            continue;
        }
        let Some(date) = parse_date_lenient(date_val) else {
            continue;
        };
        let in_time = format_time(parse_time_lenient(field(&record, index.get("in time"))));
        let out_time = format_time(parse_time_lenient(field(&record, index.get("out time"))));

        let key = (device_id.to_string(), date, in_time.clone(), out_time.clone());
        if !seen.insert(key) {
            continue;
        }
        rows.push(DeviceRow {
            device_id: device_id.to_string(),
            device: RawSource::EsslWestcott.label().to_string(),
            employee_id: None,
            employee_name: emp_name.to_string(),
            attendance_date: date,
            shift: DEFAULT_SHIFT.to_string(),
            in_time,
            out_time,
        });
    }
    Ok(rows)
}

// --- Mantra (generic dump, first row header) ---

/// Parse the Mantra dump. Header cells are sometimes split across columns
/// (`Attendance,Device,Id`), so they are merged before lookup.
pub fn parse_mantra(data: &[u8]) -> Result<Vec<DeviceRow>, SourceFormatError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(Cursor::new(data));

    let mut records = reader.records();
    let raw_header: Vec<String> = match records.next() {
        Some(r) => r?.iter().map(|h| h.to_string()).collect(),
        None => return Ok(Vec::new()),
    };
    let header = merge_split_headers(&raw_header);
    let index = header_index(&header);
    require_columns(
        &index,
        &[
            "attendance device id",
            "attendance device",
            "employee name",
            "attendance date",
            "in time",
            "out time",
        ],
    )?;

    let mut rows = Vec::new();
    let mut seen = HashSet::new();
    for record in records {
        let record = record?;
        if record.iter().all(|v| v.trim().is_empty()) {
            continue;
        }
        let device_id = field(&record, index.get("attendance device id"));
        let device = field(&record, index.get("attendance device"));
        let emp_name = field(&record, index.get("employee name"));
        let date_val = field(&record, index.get("attendance date"));
        if device_id.is_empty() || emp_name.is_empty() || date_val.is_empty() {
            continue;
        }
        let Some(date) = parse_date_lenient(date_val) else {
            continue;
        };
        let in_time = format_time(parse_time_lenient(field(&record, index.get("in time"))));
        let out_time = format_time(parse_time_lenient(field(&record, index.get("out time"))));

        let key = (
            device_id.to_string(),
            emp_name.to_string(),
            date,
            in_time.clone(),
            out_time.clone(),
        );
        if !seen.insert(key) {
            continue;
        }
        rows.push(DeviceRow {
            device_id: device_id.to_string(),
            device: if device.is_empty() {
                RawSource::Mantra.label().to_string()
            } else {
                device.to_string()
            },
            employee_id: None,
            employee_name: emp_name.to_string(),
            attendance_date: date,
            shift: DEFAULT_SHIFT.to_string(),
            in_time,
            out_time,
        });
    }
    Ok(rows)
}

// --- Generic "Other" template ---

/// Parse the hand-filled template: `Employee`, `Employee Name`,
/// `Attendance Date`, optional `Shift`, `In Time`, `Out Time`. These rows
/// already carry the employee id.
pub fn parse_other(data: &[u8]) -> Result<Vec<DeviceRow>, SourceFormatError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(Cursor::new(data));

    let headers: Vec<String> = reader.headers()?.iter().map(|h| h.to_string()).collect();
    let index = header_index(&headers);
    require_columns(
        &index,
        &[
            "employee",
            "employee name",
            "attendance date",
            "in time",
            "out time",
        ],
    )?;

    let mut rows = Vec::new();
    let mut seen = HashSet::new();
    for record in reader.records() {
        let record = record?;
        let employee = field(&record, index.get("employee"));
        let emp_name = field(&record, index.get("employee name"));
        let date_val = field(&record, index.get("attendance date"));
        if employee.is_empty() || emp_name.is_empty() || date_val.is_empty() {
            continue;
        }
        let Some(date) = parse_date_lenient(date_val) else {
            continue;
        };
        let shift = {
            let s = field(&record, index.get("shift"));
            if s.is_empty() {
                DEFAULT_SHIFT.to_string()
            } else {
                s.to_string()
            }
        };
        let in_time = format_time(parse_time_lenient(field(&record, index.get("in time"))));
        let out_time = format_time(parse_time_lenient(field(&record, index.get("out time"))));

        let key = (employee.to_string(), date, in_time.clone(), out_time.clone());
        if !seen.insert(key) {
            continue;
        }
        rows.push(DeviceRow {
            device_id: String::new(),
            device: RawSource::Other.label().to_string(),
            employee_id: Some(employee.to_string()),
            employee_name: emp_name.to_string(),
            attendance_date: date,
            shift,
            in_time,
            out_time,
        });
    }
    Ok(rows)
}

// --- Normalization ---

/// Resolve device rows to employees and parse punch times.
///
/// Rows with a direct employee id keep it; device rows go through the
/// device-allotment mapping `(device, device_id) -> employee`. Rows that
/// resolve to no employee are dropped (second return value counts them).
pub fn normalize_rows(
    rows: &[DeviceRow],
    allotments: &HashMap<(String, String), String>,
) -> (Vec<NormalizedRow>, usize) {
    let mut normalized = Vec::new();
    let mut skipped = 0usize;

    for row in rows {
        let employee_id = match &row.employee_id {
            Some(id) if !id.is_empty() => Some(id.clone()),
            _ => {
                if row.device_id.is_empty() {
                    None
                } else {
                    allotments
                        .get(&(row.device.clone(), row.device_id.clone()))
                        .cloned()
                }
            }
        };
        let Some(employee_id) = employee_id else {
            skipped += 1;
            continue;
        };

        normalized.push(NormalizedRow {
            employee_id,
            employee_name: row.employee_name.clone(),
            date: row.attendance_date,
            shift: if row.shift.trim().is_empty() {
                DEFAULT_SHIFT.to_string()
            } else {
                row.shift.trim().to_string()
            },
            in_time: parse_time_lenient(&row.in_time),
            out_time: parse_time_lenient(&row.out_time),
            source: row.device.clone(),
        });
    }
    (normalized, skipped)
}
