//! Resolution of column specs against decoded fields.
//!
//! A column spec is either a reference to a field of the message (optionally
//! written as `$.Field`) or a constant: a quoted string or a bare number. A
//! field that is present always wins over the constant reading of the spec.

use crate::value::{parse_decimal, FieldMap, FieldValue};
use std::collections::BTreeMap;

/// Resolve one column spec; `None` means the column is absent
pub fn resolve(spec: &str, fields: &FieldMap) -> Option<FieldValue> {
    let spec = spec.trim();
    let field_name = spec.strip_prefix("$.").unwrap_or(spec);

    if let Some(value) = fields.get(field_name) {
        return Some(value.clone());
    }

    literal(spec)
}

fn literal(spec: &str) -> Option<FieldValue> {
    let mut chars = spec.chars();
    match (chars.next(), chars.next_back()) {
        (Some(open @ ('"' | '\'')), Some(close)) if open == close && spec.len() >= 2 => {
            Some(FieldValue::String(spec[1..spec.len() - 1].to_string()))
        }
        _ => parse_decimal(spec).map(FieldValue::from),
    }
}

/// Resolve every mapped column, omitting the ones that are absent
pub fn resolve_columns(
    column_mapping: &BTreeMap<String, String>,
    fields: &FieldMap,
) -> Vec<(String, FieldValue)> {
    column_mapping
        .iter()
        .filter_map(|(column, spec)| resolve(spec, fields).map(|value| (column.clone(), value)))
        .collect()
}

/// Rename row columns to payload fields.
///
/// This is a direct key rename: mapped columns missing from the row are
/// skipped. An empty mapping passes every column through unchanged.
pub fn rename(field_mapping: &BTreeMap<String, String>, row: &FieldMap) -> FieldMap {
    if field_mapping.is_empty() {
        return row.clone();
    }

    let mut payload = FieldMap::with_capacity(field_mapping.len());
    for (column, field) in field_mapping {
        if let Some(value) = row.get(column) {
            payload.insert(field.clone(), value.clone());
        }
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn message() -> FieldMap {
        let mut fields = FieldMap::new();
        fields.insert("Threshold", "5");
        fields.insert("Value", Decimal::from_str("82.5").unwrap());
        fields.insert("75", "field named like a number");
        fields
    }

    #[test]
    fn test_field_presence_wins() {
        let fields = message();
        assert_eq!(resolve("Threshold", &fields), Some(FieldValue::from("5")));
        assert_eq!(resolve("threshold", &fields), Some(FieldValue::from("5")));
        assert_eq!(
            resolve("75", &fields),
            Some(FieldValue::from("field named like a number"))
        );
    }

    #[test]
    fn test_json_path_prefix() {
        let fields = message();
        assert_eq!(
            resolve("$.Value", &fields),
            Some(FieldValue::from(Decimal::from_str("82.5").unwrap()))
        );
        assert_eq!(resolve("$.Missing", &fields), None);
    }

    #[test]
    fn test_constants() {
        let fields = message();
        assert_eq!(
            resolve("\"HighTemperature\"", &fields),
            Some(FieldValue::from("HighTemperature"))
        );
        assert_eq!(resolve("'x'", &fields), Some(FieldValue::from("x")));
        assert_eq!(
            resolve("75.0", &fields),
            Some(FieldValue::from(Decimal::from_str("75.0").unwrap()))
        );
        assert_eq!(resolve("Unknown", &fields), None);
        assert_eq!(resolve("\"", &fields), None);
    }

    #[test]
    fn test_resolve_columns_omits_absent() {
        let mapping: BTreeMap<String, String> = [
            ("Reading", "Value"),
            ("AlertType", "\"HighTemperature\""),
            ("Missing", "NotThere"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let columns = resolve_columns(&mapping, &message());
        let names: Vec<&str> = columns.iter().map(|(c, _)| c.as_str()).collect();
        assert_eq!(names, vec!["AlertType", "Reading"]);
    }

    #[test]
    fn test_rename() {
        let mut row = FieldMap::new();
        row.insert("id", 1i64);
        row.insert("monitor_id", 3i64);
        row.insert("reading", "21.5");

        let mapping: BTreeMap<String, String> = [("ID", "RecordId"), ("Reading", "Value")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        let payload = rename(&mapping, &row);
        assert_eq!(payload.len(), 2);
        assert_eq!(payload.get("RecordId"), Some(&FieldValue::from(1i64)));
        assert_eq!(payload.get("Value"), Some(&FieldValue::from("21.5")));

        assert_eq!(rename(&BTreeMap::new(), &row), row);
    }
}
