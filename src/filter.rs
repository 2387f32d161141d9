//! Comparison filters attached to table mappings.
//!
//! The grammar is deliberately tiny: `<field> <op> <value>` where `op` is one
//! of `>`, `<`, `>=`, `<=`, `=`, `!=` and `value` is a bare number or a quoted
//! string. A filter that cannot be parsed lets the message through.

use crate::error::{BridgeError, BridgeResult};
use crate::value::{parse_decimal, parse_float, FieldMap};
use std::cmp::Ordering;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Gt,
    Lt,
    Ge,
    Le,
    Eq,
    Ne,
}

impl Operator {
    // Longest tokens first so `>=` is not read as `>`
    const TOKENS: [(&'static str, Operator); 6] = [
        (">=", Operator::Ge),
        ("<=", Operator::Le),
        ("!=", Operator::Ne),
        (">", Operator::Gt),
        ("<", Operator::Lt),
        ("=", Operator::Eq),
    ];

    fn holds(self, ordering: Ordering) -> bool {
        match self {
            Operator::Gt => ordering == Ordering::Greater,
            Operator::Lt => ordering == Ordering::Less,
            Operator::Ge => ordering != Ordering::Less,
            Operator::Le => ordering != Ordering::Greater,
            Operator::Eq => ordering == Ordering::Equal,
            Operator::Ne => ordering != Ordering::Equal,
        }
    }
}

/// A parsed `<field> <op> <value>` predicate
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub op: Operator,
    /// Literal with surrounding quotes removed
    pub value: String,
}

impl Filter {
    pub fn parse(condition: &str) -> BridgeResult<Self> {
        let condition = condition.trim();
        let malformed = || BridgeError::filter(format!("Invalid filter condition: {}", condition));

        let field_len = condition
            .find(|c: char| !(c.is_alphanumeric() || c == '_'))
            .unwrap_or(condition.len());
        if field_len == 0 {
            return Err(malformed());
        }
        let (field, rest) = condition.split_at(field_len);
        let rest = rest.trim_start();

        let (op, rest) = Operator::TOKENS
            .iter()
            .find_map(|(token, op)| rest.strip_prefix(*token).map(|r| (*op, r)))
            .ok_or_else(malformed)?;

        let literal = rest.trim();
        let value = match literal.chars().next() {
            Some(quote @ ('\'' | '"')) => {
                if literal.len() < 2 || !literal.ends_with(quote) {
                    return Err(malformed());
                }
                literal[1..literal.len() - 1].to_string()
            }
            Some(_) if parse_decimal(literal).is_some() || parse_float(literal).is_some() => {
                literal.to_string()
            }
            _ => return Err(malformed()),
        };

        Ok(Self {
            field: field.to_string(),
            op,
            value,
        })
    }

    /// Evaluate against a message. A missing field excludes the message.
    pub fn evaluate(&self, fields: &FieldMap) -> bool {
        let Some(actual) = fields.get(&self.field) else {
            warn!(
                "Field '{}' not found in message data for filter",
                self.field
            );
            return false;
        };

        if let (Some(lhs), Some(rhs)) = (actual.as_decimal(), parse_decimal(&self.value)) {
            return self.op.holds(lhs.cmp(&rhs));
        }
        // Magnitudes beyond the decimal range still compare numerically
        if let (Some(lhs), Some(rhs)) = (actual.as_f64(), parse_float(&self.value)) {
            if let Some(ordering) = lhs.partial_cmp(&rhs) {
                return self.op.holds(ordering);
            }
        }

        let lhs = actual.as_text().to_lowercase();
        let rhs = self.value.to_lowercase();
        match self.op {
            Operator::Eq => lhs == rhs,
            Operator::Ne => lhs != rhs,
            _ => {
                warn!(
                    "Non-numeric operands for ordering comparison on '{}', allowing message",
                    self.field
                );
                true
            }
        }
    }
}

/// Parse and evaluate a filter condition, failing open on malformed input
pub fn evaluate(condition: &str, fields: &FieldMap) -> bool {
    match Filter::parse(condition) {
        Ok(filter) => filter.evaluate(fields),
        Err(e) => {
            warn!("{}; allowing message by default", e);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::FieldValue;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn reading(value: &str) -> FieldMap {
        let mut fields = FieldMap::new();
        fields.insert("Value", Decimal::from_str(value).unwrap());
        fields.insert("SensorType", "Temperature");
        fields
    }

    #[test]
    fn test_parse_operators() {
        let ge = Filter::parse("Value >= 75").unwrap();
        assert_eq!(ge.op, Operator::Ge);
        assert_eq!(ge.value, "75");

        let ne = Filter::parse("SensorType!='humidity'").unwrap();
        assert_eq!(ne.field, "SensorType");
        assert_eq!(ne.op, Operator::Ne);
        assert_eq!(ne.value, "humidity");

        assert_eq!(Filter::parse("  Value<=1.5 ").unwrap().op, Operator::Le);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(Filter::parse("").is_err());
        assert!(Filter::parse("Value").is_err());
        assert!(Filter::parse("Value ~ 3").is_err());
        assert!(Filter::parse("Value > ").is_err());
        assert!(Filter::parse("Status = active").is_err());
        assert!(Filter::parse("Status = 'active").is_err());
    }

    #[test]
    fn test_numeric_comparisons() {
        assert!(evaluate("Value > 75.0", &reading("82.5")));
        assert!(!evaluate("Value > 75.0", &reading("70")));
        assert!(evaluate("Value >= 70", &reading("70")));
        assert!(evaluate("Value <= 70", &reading("70")));
        assert!(evaluate("Value = 70.00", &reading("70")));
        assert!(evaluate("Value != 71", &reading("70")));
        assert!(evaluate("value < 100", &reading("70")));
    }

    #[test]
    fn test_out_of_range_numbers_compare_as_floats() {
        let mut fields = FieldMap::new();
        fields.insert("Value", 1e300f64);
        fields.insert("Tiny", -1e300f64);

        assert!(!evaluate("Value < 5", &fields));
        assert!(evaluate("Value > 5", &fields));
        assert!(evaluate("Tiny < 0", &fields));
        assert!(evaluate("Value >= 1e299", &fields));
        assert!(!evaluate("Value = 1e299", &fields));
    }

    #[test]
    fn test_numeric_string_field_compares_numerically() {
        let mut fields = FieldMap::new();
        fields.insert("Threshold", "5");
        assert!(evaluate("Threshold > 4", &fields));
        assert!(evaluate("Threshold = '5.0'", &fields));
    }

    #[test]
    fn test_string_equality_ignores_case() {
        let fields = reading("1");
        assert!(evaluate("SensorType = 'temperature'", &fields));
        assert!(evaluate("sensortype = \"TEMPERATURE\"", &fields));
        assert!(!evaluate("SensorType != 'Temperature'", &fields));
    }

    #[test]
    fn test_fail_policies() {
        let fields = reading("1");
        // Missing field excludes the message
        assert!(!evaluate("Humidity > 3", &fields));
        // Malformed filter fails open
        assert!(evaluate("this is not a filter", &fields));
        // Ordering on non-numeric operands fails open
        assert!(evaluate("SensorType > 'a'", &fields));
        // Booleans compare as text
        let mut flags = FieldMap::new();
        flags.insert("Active", FieldValue::Bool(true));
        assert!(evaluate("Active = 'TRUE'", &flags));
    }

    #[test]
    fn test_evaluation_is_deterministic() {
        let fields = reading("75.0");
        let first = evaluate("Value >= 75", &fields);
        let second = evaluate("Value >= 75", &fields);
        assert_eq!(first, second);
        assert!(first);
    }
}
