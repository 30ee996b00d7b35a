//! JSON object validation helpers
//!
//! Data-channel payloads arrive as free-form JSON; every handler checks the
//! fields it relies on before reading them, so that accessors below never
//! have to deal with a missing or mistyped value.

use serde_json::Value;

use crate::error::{AppError, Result};

/// Expected JSON kind of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonType {
    /// Integer that fits in an `i32`
    Int,
    /// Integer that fits in a `u32`
    UInt,
    Bool,
    String,
    Array,
    Object,
}

impl JsonType {
    fn matches(self, value: &Value) -> bool {
        match self {
            JsonType::Int => value
                .as_i64()
                .is_some_and(|n| i32::try_from(n).is_ok()),
            JsonType::UInt => value
                .as_u64()
                .is_some_and(|n| u32::try_from(n).is_ok()),
            JsonType::Bool => value.is_boolean(),
            JsonType::String => value.is_string(),
            JsonType::Array => value.is_array(),
            JsonType::Object => value.is_object(),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            JsonType::Int => "int",
            JsonType::UInt => "uint",
            JsonType::Bool => "bool",
            JsonType::String => "string",
            JsonType::Array => "array",
            JsonType::Object => "object",
        }
    }
}

fn validate_field(
    obj: &serde_json::Map<String, Value>,
    msg_type: &str,
    name: &str,
    expected: JsonType,
    required: bool,
) -> Result<()> {
    match obj.get(name) {
        None if !required => Ok(()),
        Some(value) if expected.matches(value) => Ok(()),
        _ => {
            let mut message = format!(
                "Expected a field named '{}' of type '{}'",
                name,
                expected.name()
            );
            if !msg_type.is_empty() {
                message.push_str(&format!(" in message of type '{}'", msg_type));
            }
            message.push('.');
            Err(AppError::BadRequest(message))
        }
    }
}

/// Ensure `obj` is an object carrying every `required` field with the right
/// kind, and that any `optional` field that is present has the right kind.
pub fn validate_json_object(
    obj: &Value,
    msg_type: &str,
    required: &[(&str, JsonType)],
    optional: &[(&str, JsonType)],
) -> Result<()> {
    let map = obj.as_object().ok_or_else(|| {
        AppError::BadRequest("Expected object with name-value pairs".to_string())
    })?;

    for (name, expected) in required {
        validate_field(map, msg_type, name, *expected, true)?;
    }
    for (name, expected) in optional {
        validate_field(map, msg_type, name, *expected, false)?;
    }
    Ok(())
}

/// Parse a data-channel frame as a JSON value
pub fn parse_json_frame(data: &[u8]) -> Result<Value> {
    serde_json::from_slice(data)
        .map_err(|e| AppError::BadRequest(format!("Invalid JSON object: {}", e)))
}

/// Read a validated `Int` field
pub fn get_i32(obj: &Value, name: &str) -> i32 {
    obj.get(name)
        .and_then(Value::as_i64)
        .and_then(|n| i32::try_from(n).ok())
        .unwrap_or_default()
}

/// Read a string field, empty when absent
pub fn get_str<'a>(obj: &'a Value, name: &str) -> &'a str {
    obj.get(name).and_then(Value::as_str).unwrap_or_default()
}

/// Read an array of integers; `None` if any element is not an `i32`
pub fn get_i32_array(obj: &Value, name: &str) -> Option<Vec<i32>> {
    obj.get(name)?
        .as_array()?
        .iter()
        .map(|v| v.as_i64().and_then(|n| i32::try_from(n).ok()))
        .collect()
}
