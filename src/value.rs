//! Typed values for decoded messages and polled rows.
//!
//! Payloads and rows are loosely typed, so they are carried as a small
//! tagged union inside an ordered container. Lookups ignore ASCII case while
//! keys keep the casing they arrived with.

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use std::fmt;
use std::str::FromStr;

/// Numeric value, exact when possible
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    /// Exact decimal representation
    Decimal(Decimal),
    /// Floating point fallback when the value has no exact decimal form
    Float(f64),
}

impl Number {
    /// Decimal view of the number (`None` for non-finite floats)
    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            Number::Decimal(d) => Some(*d),
            Number::Float(f) => Decimal::from_f64(*f),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Number::Decimal(d) => d.to_f64(),
            Number::Float(f) => Some(*f),
        }
    }

    /// Integer view, only when the number has no fractional part
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Number::Decimal(d) if d.fract().is_zero() => d.to_i64(),
            Number::Float(f) if f.fract() == 0.0 => f.to_i64(),
            _ => None,
        }
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Number::Decimal(d) => write!(f, "{}", d),
            Number::Float(v) => write!(f, "{}", v),
        }
    }
}

/// A single decoded value
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    String(String),
    Number(Number),
    Bool(bool),
    Null,
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Numeric view: numbers directly, strings when they parse as a decimal
    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            FieldValue::Number(n) => n.as_decimal(),
            FieldValue::String(s) => parse_decimal(s.trim()),
            FieldValue::Bool(_) | FieldValue::Null => None,
        }
    }

    /// Floating point view for values outside the decimal range
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => n.as_f64(),
            FieldValue::String(s) => parse_float(s),
            FieldValue::Bool(_) | FieldValue::Null => None,
        }
    }

    /// Textual form used for comparisons, topic substitution and record ids
    pub fn as_text(&self) -> String {
        self.to_string()
    }

    /// Convert to a JSON value for the outbound wire payload
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            FieldValue::String(s) => serde_json::Value::String(s.clone()),
            FieldValue::Bool(b) => serde_json::Value::Bool(*b),
            FieldValue::Null => serde_json::Value::Null,
            FieldValue::Number(Number::Decimal(d)) => {
                serde_json::Number::from_str(&d.normalize().to_string())
                    .map(serde_json::Value::Number)
                    .unwrap_or(serde_json::Value::Null)
            }
            FieldValue::Number(Number::Float(f)) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::String(s) => f.write_str(s),
            FieldValue::Number(n) => write!(f, "{}", n),
            FieldValue::Bool(b) => write!(f, "{}", b),
            FieldValue::Null => Ok(()),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::String(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::String(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Number(Number::Decimal(Decimal::from(value)))
    }
}

impl From<Decimal> for FieldValue {
    fn from(value: Decimal) -> Self {
        FieldValue::Number(Number::Decimal(value))
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Number(Number::Float(value))
    }
}

/// Parse a decimal literal, accepting scientific notation
pub fn parse_decimal(text: &str) -> Option<Decimal> {
    if text.is_empty() {
        return None;
    }
    Decimal::from_str(text)
        .ok()
        .or_else(|| Decimal::from_scientific(text).ok())
}

/// Parse a finite floating point literal
pub fn parse_float(text: &str) -> Option<f64> {
    text.trim().parse::<f64>().ok().filter(|f| f.is_finite())
}

/// Ordered key → value container with case-insensitive lookup
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldMap {
    entries: Vec<(String, FieldValue)>,
}

impl FieldMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Insert a value; a key that already exists (ignoring case) is replaced in place
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<FieldValue>) {
        let key = key.into();
        let value = value.into();
        match self.position(&key) {
            Some(idx) => self.entries[idx] = (key, value),
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.position(key).map(|idx| &self.entries[idx].1)
    }

    /// Stored key and value for a case-insensitive lookup
    pub fn get_entry(&self, key: &str) -> Option<(&str, &FieldValue)> {
        self.position(key)
            .map(|idx| (self.entries[idx].0.as_str(), &self.entries[idx].1))
    }

    /// Remove a key, returning its value
    pub fn remove(&mut self, key: &str) -> Option<FieldValue> {
        self.position(key).map(|i| self.entries.remove(i).1)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.position(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|(k, _)| k.eq_ignore_ascii_case(key))
    }
}

impl<K: Into<String>, V: Into<FieldValue>> FromIterator<(K, V)> for FieldMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = FieldMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

impl IntoIterator for FieldMap {
    type Item = (String, FieldValue);
    type IntoIter = std::vec::IntoIter<(String, FieldValue)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_lookup_preserves_case() {
        let mut map = FieldMap::new();
        map.insert("MonitorId", 3i64);
        map.insert("Value", "82.5");

        assert_eq!(map.get("monitorid"), Some(&FieldValue::from(3i64)));
        assert_eq!(map.get_entry("VALUE").map(|(k, _)| k), Some("Value"));
        assert!(map.get("missing").is_none());
        assert_eq!(map.keys().collect::<Vec<_>>(), vec!["MonitorId", "Value"]);
    }

    #[test]
    fn test_insert_replaces_existing_key_in_place() {
        let mut map = FieldMap::new();
        map.insert("a", 1i64);
        map.insert("b", 2i64);
        map.insert("A", 3i64);

        assert_eq!(map.len(), 2);
        assert_eq!(map.keys().collect::<Vec<_>>(), vec!["A", "b"]);
        assert_eq!(map.get("a"), Some(&FieldValue::from(3i64)));

        assert_eq!(map.remove("B"), Some(FieldValue::from(2i64)));
        assert_eq!(map.remove("b"), None);
        assert_eq!(map.keys().collect::<Vec<_>>(), vec!["A"]);
    }

    #[test]
    fn test_numeric_views() {
        assert_eq!(
            FieldValue::from("  75.0 ").as_decimal(),
            Some(Decimal::from_str("75.0").unwrap())
        );
        assert_eq!(FieldValue::from("1e3").as_decimal(), Some(Decimal::from(1000)));
        assert_eq!(FieldValue::from("abc").as_decimal(), None);
        assert_eq!(FieldValue::Bool(true).as_decimal(), None);
        assert_eq!(FieldValue::from("2.5e300").as_f64(), Some(2.5e300));
        assert_eq!(FieldValue::from("inf").as_f64(), None);
        assert_eq!(Number::Float(4.0).as_i64(), Some(4));
        assert_eq!(Number::Decimal(Decimal::from_str("4.5").unwrap()).as_i64(), None);
    }

    #[test]
    fn test_text_and_json_forms() {
        assert_eq!(FieldValue::Null.as_text(), "");
        assert_eq!(FieldValue::Bool(false).as_text(), "false");
        assert_eq!(FieldValue::from(Decimal::from_str("82.5").unwrap()).as_text(), "82.5");

        assert_eq!(FieldValue::from(7i64).to_json(), serde_json::json!(7));
        assert_eq!(
            FieldValue::from(Decimal::from_str("82.5").unwrap()).to_json(),
            serde_json::json!(82.5)
        );
        assert_eq!(FieldValue::Null.to_json(), serde_json::Value::Null);
    }
}
