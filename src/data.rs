//! Cell-level coercion shared by inference, evaluation, and remapping.
//!
//! Dataset cells arrive as text; rule values arrive as JSON scalars. Both are
//! funnelled through the helpers here so the inferencer and the evaluator
//! agree on what "numeric", "date", and "empty" mean.

use anyhow::{Result, anyhow};
use chrono::{NaiveDate, NaiveDateTime};
use heck::ToSnakeCase;
use serde_json::Value as JsonValue;

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%m/%d/%Y", "%Y/%m/%d", "%d-%m-%Y"];

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%SZ",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%d/%m/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

pub fn parse_naive_date(value: &str) -> Result<NaiveDate> {
    for fmt in DATE_FORMATS {
        if let Ok(parsed) = NaiveDate::parse_from_str(value, fmt) {
            return Ok(parsed);
        }
    }
    Err(anyhow!("Failed to parse '{value}' as date"))
}

pub fn parse_naive_datetime(value: &str) -> Result<NaiveDateTime> {
    for fmt in DATETIME_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(value, fmt) {
            return Ok(parsed);
        }
    }
    Err(anyhow!("Failed to parse '{value}' as datetime"))
}

/// Calendar date of a cell, accepting plain dates and datetimes.
pub fn coerce_date(value: &str) -> Option<NaiveDate> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    parse_naive_date(trimmed)
        .ok()
        .or_else(|| parse_naive_datetime(trimmed).ok().map(|dt| dt.date()))
}

/// Numeric value of a cell.
///
/// Accepts surrounding whitespace, a leading `+`, and comma thousands
/// separators. Non-finite spellings such as `NaN` or `inf` are rejected.
pub fn coerce_number(value: &str) -> Option<f64> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    let unsigned = trimmed.strip_prefix('+').unwrap_or(trimmed);
    let parsed = if unsigned.contains(',') {
        if !has_valid_grouping(unsigned) {
            return None;
        }
        unsigned.replace(',', "").parse::<f64>().ok()?
    } else {
        unsigned.parse::<f64>().ok()?
    };
    parsed.is_finite().then_some(parsed)
}

fn has_valid_grouping(value: &str) -> bool {
    let digits = value.strip_prefix('-').unwrap_or(value);
    let integer = digits.split('.').next().unwrap_or_default();
    let mut groups = integer.split(',');
    let Some(first) = groups.next() else {
        return false;
    };
    if first.is_empty() || first.len() > 3 || !first.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    groups.all(|group| group.len() == 3 && group.bytes().all(|b| b.is_ascii_digit()))
}

/// `true` for a missing cell or one holding only whitespace.
pub fn is_blank(value: Option<&str>) -> bool {
    value.is_none_or(|v| v.trim().is_empty())
}

/// Text form of a JSON scalar used as a rule operand; `null` has none.
pub fn json_to_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Bool(b) => Some(b.to_string()),
        JsonValue::Number(n) => Some(number_text(n)),
        other => Some(other.to_string()),
    }
}

/// Whole-valued floats print without a fractional part (`1.0` reads as `1`).
fn number_text(n: &serde_json::Number) -> String {
    match n.as_f64() {
        Some(v) if n.is_f64() && v.fract() == 0.0 && v.abs() < 1e15 => format!("{v:.0}"),
        _ => n.to_string(),
    }
}

pub fn json_to_number(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        JsonValue::String(s) => coerce_number(s),
        _ => None,
    }
}

pub fn json_to_date(value: &JsonValue) -> Option<NaiveDate> {
    match value {
        JsonValue::String(s) => coerce_date(s),
        _ => None,
    }
}

/// Lower snake-case form of a column name used for fuzzy matching.
pub fn normalize_column_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' => c,
            _ => '_',
        })
        .collect::<String>()
        .to_snake_case()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalize_column_name_splits_camel_case_and_punctuation() {
        assert_eq!(normalize_column_name("Patient ID"), "patient_id");
        assert_eq!(normalize_column_name("patientAge"), "patient_age");
        assert_eq!(normalize_column_name("BMI-at-baseline"), "bmi_at_baseline");
    }

    #[test]
    fn coerce_number_accepts_formatted_numeric_strings() {
        assert_eq!(coerce_number(" 42 "), Some(42.0));
        assert_eq!(coerce_number("+3.5"), Some(3.5));
        assert_eq!(coerce_number("-1,234.25"), Some(-1234.25));
        assert_eq!(coerce_number("1e3"), Some(1000.0));
    }

    #[test]
    fn coerce_number_rejects_text_and_non_finite_values() {
        assert_eq!(coerce_number("abc"), None);
        assert_eq!(coerce_number("NaN"), None);
        assert_eq!(coerce_number("inf"), None);
        assert_eq!(coerce_number("1,2"), None);
        assert_eq!(coerce_number(""), None);
    }

    #[test]
    fn coerce_date_supports_dates_and_datetimes() {
        let expected = NaiveDate::from_ymd_opt(2024, 5, 6).unwrap();
        assert_eq!(coerce_date("2024-05-06"), Some(expected));
        assert_eq!(coerce_date("2024/05/06"), Some(expected));
        assert_eq!(coerce_date("2024-05-06T14:30:00"), Some(expected));
        assert_eq!(coerce_date("2024"), None);
    }

    #[test]
    fn is_blank_covers_missing_and_whitespace() {
        assert!(is_blank(None));
        assert!(is_blank(Some("   ")));
        assert!(!is_blank(Some("0")));
    }

    #[test]
    fn json_operands_convert_to_text_and_numbers() {
        assert_eq!(json_to_text(&json!(18)), Some("18".to_string()));
        assert_eq!(json_to_text(&json!(null)), None);
        assert_eq!(json_to_text(&json!(1.0)), Some("1".to_string()));
        assert_eq!(json_to_text(&json!(2.5)), Some("2.5".to_string()));
        assert_eq!(json_to_number(&json!("18.5")), Some(18.5));
        assert_eq!(json_to_number(&json!(true)), None);
        assert_eq!(
            json_to_date(&json!("2020-01-31")),
            NaiveDate::from_ymd_opt(2020, 1, 31)
        );
    }
}
