//! Payload decoding (bytes → [`FieldMap`]) and outbound encoding.
//!
//! Supported formats:
//! - `JSON`: every top-level property becomes one field. Numbers keep an exact
//!   decimal form where they have one; nested objects and arrays are kept as
//!   their JSON text.
//! - `TEXT`: the whole UTF-8 payload becomes a single `Payload` field.
//! - `BINARY`: the payload is base64 encoded into `Payload`, with its length in `Size`.

use crate::error::{BridgeError, BridgeResult};
use crate::value::{parse_decimal, FieldMap, FieldValue, Number};
use base64::Engine;
use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;

/// Payload formats understood by the decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFormat {
    Json,
    Text,
    Binary,
}

impl FromStr for PayloadFormat {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "JSON" => Ok(PayloadFormat::Json),
            "TEXT" => Ok(PayloadFormat::Text),
            "BINARY" => Ok(PayloadFormat::Binary),
            other => Err(BridgeError::decode(format!(
                "Unsupported message format: {}",
                other
            ))),
        }
    }
}

/// Decode a raw payload using the named format
pub fn decode(payload: &[u8], format: &str) -> BridgeResult<FieldMap> {
    match format.parse::<PayloadFormat>()? {
        PayloadFormat::Json => decode_json(payload),
        PayloadFormat::Text => {
            let text = std::str::from_utf8(payload)
                .map_err(|e| BridgeError::decode(format!("Payload is not valid UTF-8: {}", e)))?;
            let mut fields = FieldMap::with_capacity(1);
            fields.insert("Payload", text);
            Ok(fields)
        }
        PayloadFormat::Binary => {
            let mut fields = FieldMap::with_capacity(2);
            fields.insert(
                "Payload",
                base64::engine::general_purpose::STANDARD.encode(payload),
            );
            fields.insert("Size", payload.len() as i64);
            Ok(fields)
        }
    }
}

fn decode_json(payload: &[u8]) -> BridgeResult<FieldMap> {
    let root: Value = serde_json::from_slice(payload)
        .map_err(|e| BridgeError::decode(format!("Malformed JSON payload: {}", e)))?;

    let Value::Object(object) = root else {
        return Err(BridgeError::decode("JSON payload must be an object"));
    };

    let mut fields = FieldMap::with_capacity(object.len());
    for (name, value) in object {
        fields.insert(name, json_to_field(value));
    }
    Ok(fields)
}

fn json_to_field(value: Value) -> FieldValue {
    match value {
        Value::String(s) => FieldValue::String(s),
        Value::Bool(b) => FieldValue::Bool(b),
        Value::Null => FieldValue::Null,
        Value::Number(n) => FieldValue::Number(json_number(&n)),
        nested @ (Value::Array(_) | Value::Object(_)) => FieldValue::String(nested.to_string()),
    }
}

fn json_number(n: &serde_json::Number) -> Number {
    // The number keeps its literal text, so exact decimals survive untouched
    if let Some(d) = parse_decimal(n.as_str()) {
        return Number::Decimal(d);
    }
    if let Some(i) = n.as_i64() {
        return Number::Decimal(Decimal::from(i));
    }
    Number::Float(n.as_f64().unwrap_or(f64::NAN))
}

/// Encode a field map as a flat JSON object
pub fn encode(fields: &FieldMap) -> BridgeResult<Vec<u8>> {
    let object: serde_json::Map<String, Value> = fields
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_json()))
        .collect();

    serde_json::to_vec(&Value::Object(object))
        .map_err(|e| BridgeError::publish(format!("Failed to encode payload: {}", e)))
}
