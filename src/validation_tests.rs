// src/validation_tests.rs

#[cfg(test)]
mod tests {
    use crate::reconciliation::AttendanceRow;
    use crate::validation::{validate, ValidationFailure, ValidationResult};
    use chrono::NaiveDate;
    use std::collections::BTreeSet;

    fn make_row(in_time: &str, out_time: &str) -> AttendanceRow {
        AttendanceRow {
            employee_id: "EMP-0001".to_string(),
            employee_name: "Asha Verma".to_string(),
            date: NaiveDate::from_ymd_opt(2025, 4, 7).unwrap(),
            shift: "Regular".to_string(),
            in_time: in_time.to_string(),
            out_time: out_time.to_string(),
            source_label: "Mantra".to_string(),
            out_source_label: "Mantra".to_string(),
            skip_validation: false,
        }
    }

    fn reasons(result: ValidationResult) -> BTreeSet<ValidationFailure> {
        match result {
            ValidationResult::Valid => BTreeSet::new(),
            ValidationResult::Invalid(reasons) => reasons,
        }
    }

    #[test]
    fn distinct_present_times_are_valid() {
        let row = make_row("09:02:00", "18:31:00");
        assert!(validate(&row).is_valid());
    }

    #[test]
    fn blank_out_time_fails_missing_rule() {
        let row = make_row("09:02:00", "");
        let got = reasons(validate(&row));
        assert_eq!(got, BTreeSet::from([ValidationFailure::MissingTime]));
    }

    #[test]
    fn zero_like_values_count_as_missing() {
        for zero in ["0", "00", "00:00", "00:00:00", "0:00", "none", "NULL", "NaT"] {
            let row = make_row(zero, "18:31:00");
            assert_eq!(
                reasons(validate(&row)),
                BTreeSet::from([ValidationFailure::MissingTime]),
                "value '{}' should read as a missing punch",
                zero
            );
        }
    }

    #[test]
    fn both_punches_missing_reports_missing_once() {
        let row = make_row("", "00:00");
        let got = reasons(validate(&row));
        // Identical-times only applies when both punches are present.
        assert_eq!(got, BTreeSet::from([ValidationFailure::MissingTime]));
    }

    #[test]
    fn equal_present_times_fail_identical_rule() {
        let row = make_row("09:02:00", "09:02:00");
        let got = reasons(validate(&row));
        assert_eq!(got, BTreeSet::from([ValidationFailure::IdenticalTimes]));
    }

    #[test]
    fn equality_check_trims_whitespace() {
        let row = make_row(" 09:02:00", "09:02:00 ");
        let got = reasons(validate(&row));
        assert_eq!(got, BTreeSet::from([ValidationFailure::IdenticalTimes]));
    }

    #[test]
    fn near_equal_times_are_not_identical() {
        // String equality, no tolerance window.
        let row = make_row("09:02:00", "09:02:01");
        assert!(validate(&row).is_valid());
    }

    #[test]
    fn skip_validation_overrides_the_rules() {
        let mut row = make_row("09:02:00", "09:02:00");
        row.skip_validation = true;
        assert!(validate(&row).is_valid());

        let mut row = make_row("", "");
        row.skip_validation = true;
        assert!(validate(&row).is_valid());
    }

    #[test]
    fn failure_messages_match_operator_text() {
        assert_eq!(
            ValidationFailure::MissingTime.to_string(),
            "Missing IN or OUT time"
        );
        assert_eq!(
            ValidationFailure::IdenticalTimes.to_string(),
            "IN time and OUT time are same"
        );
    }
}
