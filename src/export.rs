// src/export.rs
//
// CSV renditions of the sheets the page offered as downloads: the upload
// template, the per-source raw tables, the merged/validated sheet, and the
// payload handed to the HRMS data import.

use std::collections::BTreeMap;
use thiserror::Error;

use crate::reconciliation::AttendanceRow;
use crate::source_formats::DeviceRow;

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("CSV write error: {0}")]
    Csv(#[from] csv::Error),

    #[error("CSV buffer error: {0}")]
    Buffer(String),
}

const TEMPLATE_HEADERS: [&str; 6] = [
    "Employee",
    "Employee Name",
    "Attendance Date",
    "Shift",
    "In Time",
    "Out Time",
];

const RAW_HEADERS: [&str; 7] = [
    "Device Id",
    "Device",
    "Employee Name",
    "Attendance Date",
    "Shift",
    "In Time",
    "Out Time",
];

const SHEET_HEADERS: [&str; 8] = [
    "Employee",
    "Employee Name",
    "Attendance Date",
    "Shift",
    "Log In From",
    "In Time",
    "Log Out From",
    "Out Time",
];

// Display exports use the sheet-style date; the import payload uses ISO so
// the HRMS importer parses it without locale guessing.
const DISPLAY_DATE_FORMAT: &str = "%d-%b-%Y";
const IMPORT_DATE_FORMAT: &str = "%Y-%m-%d";

fn finish(writer: csv::Writer<Vec<u8>>) -> Result<Vec<u8>, ExportError> {
    writer
        .into_inner()
        .map_err(|e| ExportError::Buffer(e.to_string()))
}

/// The blank upload template for the generic "Other" source.
pub fn template_csv() -> Result<Vec<u8>, ExportError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(TEMPLATE_HEADERS)?;
    finish(writer)
}

/// One raw source table, as parsed.
pub fn raw_rows_csv(rows: &[DeviceRow]) -> Result<Vec<u8>, ExportError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(RAW_HEADERS)?;
    for row in rows {
        writer.write_record([
            row.device_id.as_str(),
            row.device.as_str(),
            row.employee_name.as_str(),
            &row.attendance_date.format(DISPLAY_DATE_FORMAT).to_string(),
            row.shift.as_str(),
            row.in_time.as_str(),
            row.out_time.as_str(),
        ])?;
    }
    finish(writer)
}

fn write_sheet_rows<'a>(
    writer: &mut csv::Writer<Vec<u8>>,
    rows: impl Iterator<Item = &'a AttendanceRow>,
    date_format: &str,
) -> Result<(), ExportError> {
    for row in rows {
        writer.write_record([
            row.employee_id.as_str(),
            row.employee_name.as_str(),
            &row.date.format(date_format).to_string(),
            row.shift.as_str(),
            row.source_label.as_str(),
            row.in_time.as_str(),
            row.out_source_label.as_str(),
            row.out_time.as_str(),
        ])?;
    }
    Ok(())
}

/// Merged preview (or any flat row sequence) in display form.
pub fn sheet_csv(rows: &[AttendanceRow]) -> Result<Vec<u8>, ExportError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(SHEET_HEADERS)?;
    write_sheet_rows(&mut writer, rows.iter(), DISPLAY_DATE_FORMAT)?;
    finish(writer)
}

/// Validated set in display form, employees in id order.
pub fn validated_sheet_csv(
    validated: &BTreeMap<String, Vec<AttendanceRow>>,
) -> Result<Vec<u8>, ExportError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(SHEET_HEADERS)?;
    write_sheet_rows(&mut writer, validated.values().flatten(), DISPLAY_DATE_FORMAT)?;
    finish(writer)
}

/// The import payload: same columns as the validated sheet but ISO dates,
/// employees in id order.
pub fn import_sheet_csv(
    validated: &BTreeMap<String, Vec<AttendanceRow>>,
) -> Result<Vec<u8>, ExportError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(SHEET_HEADERS)?;
    write_sheet_rows(&mut writer, validated.values().flatten(), IMPORT_DATE_FORMAT)?;
    finish(writer)
}
