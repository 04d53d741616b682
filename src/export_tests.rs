// src/export_tests.rs

#[cfg(test)]
mod tests {
    use crate::export::*;
    use crate::reconciliation::AttendanceRow;
    use crate::source_formats::DeviceRow;
    use chrono::NaiveDate;
    use std::collections::BTreeMap;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 4, d).unwrap()
    }

    fn row(emp: &str, day: u32) -> AttendanceRow {
        AttendanceRow {
            employee_id: emp.to_string(),
            employee_name: "Asha Verma".to_string(),
            date: date(day),
            shift: "Regular".to_string(),
            in_time: "09:02:00".to_string(),
            out_time: "18:31:00".to_string(),
            source_label: "Mantra".to_string(),
            out_source_label: "App".to_string(),
            skip_validation: false,
        }
    }

    fn lines(bytes: Vec<u8>) -> Vec<String> {
        String::from_utf8(bytes)
            .unwrap()
            .lines()
            .map(|l| l.to_string())
            .collect()
    }

    #[test]
    fn template_has_the_upload_columns() {
        let lines = lines(template_csv().unwrap());
        assert_eq!(
            lines,
            vec!["Employee,Employee Name,Attendance Date,Shift,In Time,Out Time"]
        );
    }

    #[test]
    fn raw_export_keeps_device_fields() {
        let rows = vec![DeviceRow {
            device_id: "7".to_string(),
            device: "Mantra Gate".to_string(),
            employee_id: None,
            employee_name: "Asha Verma".to_string(),
            attendance_date: date(1),
            shift: "Regular".to_string(),
            in_time: "09:02:00".to_string(),
            out_time: "18:31:00".to_string(),
        }];
        let lines = lines(raw_rows_csv(&rows).unwrap());
        assert_eq!(
            lines[0],
            "Device Id,Device,Employee Name,Attendance Date,Shift,In Time,Out Time"
        );
        assert_eq!(
            lines[1],
            "7,Mantra Gate,Asha Verma,01-Apr-2025,Regular,09:02:00,18:31:00"
        );
    }

    #[test]
    fn sheet_export_uses_display_dates_and_both_source_labels() {
        let lines = lines(sheet_csv(&[row("EMP-0001", 5)]).unwrap());
        assert_eq!(
            lines[0],
            "Employee,Employee Name,Attendance Date,Shift,Log In From,In Time,Log Out From,Out Time"
        );
        assert_eq!(
            lines[1],
            "EMP-0001,Asha Verma,05-Apr-2025,Regular,Mantra,09:02:00,App,18:31:00"
        );
    }

    #[test]
    fn validated_export_orders_employees_by_id() {
        let mut validated = BTreeMap::new();
        validated.insert("EMP-0002".to_string(), vec![row("EMP-0002", 1)]);
        validated.insert("EMP-0001".to_string(), vec![row("EMP-0001", 1), row("EMP-0001", 2)]);
        let lines = lines(validated_sheet_csv(&validated).unwrap());
        assert_eq!(lines.len(), 4);
        assert!(lines[1].starts_with("EMP-0001,"));
        assert!(lines[2].starts_with("EMP-0001,"));
        assert!(lines[3].starts_with("EMP-0002,"));
    }

    #[test]
    fn import_payload_uses_iso_dates() {
        let mut validated = BTreeMap::new();
        validated.insert("EMP-0001".to_string(), vec![row("EMP-0001", 5)]);
        let lines = lines(import_sheet_csv(&validated).unwrap());
        assert_eq!(
            lines[1],
            "EMP-0001,Asha Verma,2025-04-05,Regular,Mantra,09:02:00,App,18:31:00"
        );
    }

    #[test]
    fn empty_sets_export_headers_only() {
        assert_eq!(lines(sheet_csv(&[]).unwrap()).len(), 1);
        let validated: BTreeMap<String, Vec<AttendanceRow>> = BTreeMap::new();
        assert_eq!(lines(validated_sheet_csv(&validated).unwrap()).len(), 1);
    }
}
