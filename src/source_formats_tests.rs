// src/source_formats_tests.rs

#[cfg(test)]
mod tests {
    use crate::source_formats::*;
    use chrono::NaiveDate;
    use std::collections::HashMap;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    // --- Lenient time/date parsing ---

    #[test]
    fn missing_time_strings_are_recognized() {
        for v in ["", "  ", "0", "00", "None", "NULL", "NaT", "00:00", "00:00:00"] {
            assert!(is_missing_time(v), "'{}' should be missing", v);
        }
        assert!(!is_missing_time("09:00:00"));
        assert!(!is_missing_time("00:01"));
    }

    #[test]
    fn time_parsing_accepts_vendor_formats() {
        let expect = chrono::NaiveTime::from_hms_opt(9, 5, 0).unwrap();
        for v in [
            "09:05:00",
            "09:05",
            "9:05 AM",
            "09:05:00 AM",
            "2025-04-01 09:05:00",
            "01/04/2025 09:05",
        ] {
            assert_eq!(parse_time_lenient(v), Some(expect), "failed on '{}'", v);
        }
    }

    #[test]
    fn zero_like_and_junk_times_parse_to_none() {
        for v in ["", "00:00", "00:00:00", "lunch", "25:99"] {
            assert_eq!(parse_time_lenient(v), None, "'{}' should not parse", v);
        }
    }

    #[test]
    fn date_parsing_accepts_vendor_formats() {
        let expect = date(2025, 4, 1);
        for v in ["2025-04-01", "01-Apr-2025", "01/04/2025", "2025/04/01", "01-04-2025"] {
            assert_eq!(parse_date_lenient(v), Some(expect), "failed on '{}'", v);
        }
        assert_eq!(parse_date_lenient("2025-04-01 09:00:00"), Some(expect));
        assert_eq!(parse_date_lenient("not a date"), None);
    }

    #[test]
    fn format_time_round_trips_to_wire_form() {
        assert_eq!(format_time(parse_time_lenient("9:05 AM")), "09:05:00");
        assert_eq!(format_time(None), "");
    }

    // --- Split headers ---

    #[test]
    fn split_header_cells_are_merged() {
        let cells: Vec<String> = [
            "Attendance", "Device", "Id", "Employee", "Name", "Attendance", "Date", "In", "Time",
            "Out", "Time",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(
            merge_split_headers(&cells),
            vec![
                "Attendance Device Id".to_string(),
                "Employee Name".to_string(),
                "Attendance Date".to_string(),
                "In Time".to_string(),
                "Out Time".to_string(),
            ]
        );
    }

    #[test]
    fn trailing_header_group_is_flushed() {
        let cells: Vec<String> = ["In", "Time", "Attendance", "Device"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            merge_split_headers(&cells),
            vec!["In Time".to_string(), "Attendance Device".to_string()]
        );
    }

    #[test]
    fn whole_headers_pass_through_unchanged() {
        let cells: Vec<String> = ["Punch Station", "Operator"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            merge_split_headers(&cells),
            vec!["Punch Station".to_string(), "Operator".to_string()]
        );
    }

    // --- Zicom Regal ---

    #[test]
    fn zicom_blocks_expand_into_dated_rows() {
        let csv = "\
Att.log report,,,,,,,,,,,
01-Apr-2025 ~ 30-Apr-2025,,,,,,,,,,,
,1,2,3,,,,,,,,
ID:,,7,,,,,,,,Asha Verma,
,09:00-18:05,09:10,,,,,,,,,
ID:,,8,,,,,,,,Bala Nair,
,,08:45  17:50,,,,,,,,,
";
        let rows = parse_zicom(csv.as_bytes()).unwrap();
        assert_eq!(rows.len(), 3);

        let first = &rows[0];
        assert_eq!(first.device_id, "7");
        assert_eq!(first.employee_name, "Asha Verma");
        assert_eq!(first.attendance_date, date(2025, 4, 1));
        assert_eq!(first.in_time, "09:00:00");
        assert_eq!(first.out_time, "18:05:00");

        // Lone punch cell carries only the in time.
        let second = &rows[1];
        assert_eq!(second.attendance_date, date(2025, 4, 2));
        assert_eq!(second.in_time, "09:10:00");
        assert_eq!(second.out_time, "");

        let third = &rows[2];
        assert_eq!(third.device_id, "8");
        assert_eq!(third.attendance_date, date(2025, 4, 2));
        assert_eq!(third.in_time, "08:45:00");
        assert_eq!(third.out_time, "17:50:00");
    }

    #[test]
    fn zicom_without_period_cell_is_rejected() {
        let csv = "Att.log report,,,\n,1,2,3\n";
        assert!(matches!(
            parse_zicom(csv.as_bytes()),
            Err(SourceFormatError::InvalidPeriod)
        ));
    }

    #[test]
    fn zicom_without_day_header_is_rejected() {
        let csv = "01-Apr-2025 ~ 30-Apr-2025,,\nID:,,7,,,,,,,,Asha Verma\n";
        assert!(matches!(
            parse_zicom(csv.as_bytes()),
            Err(SourceFormatError::MissingDayHeader)
        ));
    }

    // --- ESSL Westcott ---

    #[test]
    fn essl_rows_parse_and_dedupe() {
        let csv = "\
ID,G,Date,In Time,Out Time
12,Asha Verma,01-Apr-2025,09:00,18:05
12,Asha Verma,01-Apr-2025,09:00,18:05
13,Bala Nair,01-Apr-2025,00:00,18:00
,,02-Apr-2025,09:00,18:00
";
        let rows = parse_essl(csv.as_bytes()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].device_id, "12");
        assert_eq!(rows[0].device, "ESSL Westcott");
        assert_eq!(rows[0].in_time, "09:00:00");
        // Zero-like in time comes through as an empty punch.
        assert_eq!(rows[1].in_time, "");
        assert_eq!(rows[1].out_time, "18:00:00");
    }

    #[test]
    fn essl_missing_column_is_rejected() {
        let csv = "ID,Date,In Time,Out Time\n12,01-Apr-2025,09:00,18:00\n";
        assert!(matches!(
            parse_essl(csv.as_bytes()),
            Err(SourceFormatError::MissingColumn(col)) if col == "g"
        ));
    }

    // --- Mantra ---

    #[test]
    fn mantra_parses_with_split_headers() {
        let csv = "\
Attendance,Device,Id,Employee,Name,Attendance,Date,In,Time,Out,Time,Attendance,Device
7,Asha Verma,2025-04-01,09:02,18:31,Mantra Gate
7,Asha Verma,2025-04-01,09:02,18:31,Mantra Gate
";
        let rows = parse_mantra(csv.as_bytes()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].device_id, "7");
        assert_eq!(rows[0].device, "Mantra Gate");
        assert_eq!(rows[0].employee_name, "Asha Verma");
        assert_eq!(rows[0].attendance_date, date(2025, 4, 1));
        assert_eq!(rows[0].in_time, "09:02:00");
        assert_eq!(rows[0].out_time, "18:31:00");
    }

    #[test]
    fn mantra_missing_column_is_rejected() {
        let csv = "Employee Name,Attendance Date,In Time,Out Time\nAsha,2025-04-01,09:00,18:00\n";
        assert!(matches!(
            parse_mantra(csv.as_bytes()),
            Err(SourceFormatError::MissingColumn(_))
        ));
    }

    // --- Other template ---

    #[test]
    fn other_template_rows_carry_employee_ids() {
        let csv = "\
Employee,Employee Name,Attendance Date,Shift,In Time,Out Time
EMP-0001,Asha Verma,01-Apr-2025,Night,21:00,06:00
EMP-0002,Bala Nair,01-Apr-2025,,09:00,18:00
";
        let rows = parse_other(csv.as_bytes()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].employee_id.as_deref(), Some("EMP-0001"));
        assert_eq!(rows[0].shift, "Night");
        assert_eq!(rows[1].shift, "Regular");
    }

    // --- Normalization ---

    fn device_row(device: &str, device_id: &str, employee_id: Option<&str>) -> DeviceRow {
        DeviceRow {
            device_id: device_id.to_string(),
            device: device.to_string(),
            employee_id: employee_id.map(|s| s.to_string()),
            employee_name: "Asha Verma".to_string(),
            attendance_date: date(2025, 4, 1),
            shift: String::new(),
            in_time: "09:00:00".to_string(),
            out_time: "18:00:00".to_string(),
        }
    }

    #[test]
    fn normalization_maps_device_ids_through_allotments() {
        let allotments: HashMap<(String, String), String> = HashMap::from([(
            ("Mantra".to_string(), "7".to_string()),
            "EMP-0001".to_string(),
        )]);
        let rows = vec![
            device_row("Mantra", "7", None),
            device_row("Mantra", "99", None),
            device_row("Other", "", Some("EMP-0002")),
            device_row("Zicom Regal", "", None),
        ];
        let (normalized, skipped) = normalize_rows(&rows, &allotments);
        assert_eq!(skipped, 2);
        assert_eq!(normalized.len(), 2);
        assert_eq!(normalized[0].employee_id, "EMP-0001");
        assert_eq!(normalized[0].shift, "Regular");
        assert_eq!(normalized[1].employee_id, "EMP-0002");
    }

    #[test]
    fn normalization_parses_punch_times() {
        let allotments = HashMap::new();
        let mut row = device_row("Other", "", Some("EMP-0001"));
        row.in_time = "9:00 AM".to_string();
        row.out_time = "00:00".to_string();
        let (normalized, _) = normalize_rows(&[row], &allotments);
        assert_eq!(
            normalized[0].in_time,
            chrono::NaiveTime::from_hms_opt(9, 0, 0)
        );
        assert_eq!(normalized[0].out_time, None);
    }
}
