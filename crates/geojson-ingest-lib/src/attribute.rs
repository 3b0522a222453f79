//! Attribute typing and stringification
//!
//! Every attribute is stored as canonical text plus a type tag. Numbers keep the
//! spelling they had in the input, booleans become `"true"`/`"false"`, and composite
//! values are stringified as JSON. A per-key forced type can override the natural type.

use crate::{IngestError, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Spellings that a forced boolean treats as false
const FALSE_ALIASES: [&str; 4] = ["false", "0", "null", ""];

/// Type tag of a stored attribute value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum AttributeType {
    String,
    Number,
    Bool,
    Null,
}

impl AttributeType {
    /// Type byte stored in the pool, following vector-tile value numbering
    pub fn code(self) -> u8 {
        match self {
            AttributeType::String => 0,
            AttributeType::Number => 2,
            AttributeType::Bool => 6,
            AttributeType::Null => 7,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(AttributeType::String),
            2 => Some(AttributeType::Number),
            6 => Some(AttributeType::Bool),
            7 => Some(AttributeType::Null),
            _ => None,
        }
    }
}

impl fmt::Display for AttributeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AttributeType::String => "String",
            AttributeType::Number => "Number",
            AttributeType::Bool => "Boolean",
            AttributeType::Null => "Null",
        };
        f.write_str(name)
    }
}

/// Type that an attribute key is coerced to regardless of its input type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ForcedType {
    String,
    Float,
    Int,
    Bool,
}

impl FromStr for ForcedType {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "string" => Ok(ForcedType::String),
            "float" => Ok(ForcedType::Float),
            "int" => Ok(ForcedType::Int),
            "bool" => Ok(ForcedType::Bool),
            other => Err(IngestError::UnknownAttributeType(other.to_string())),
        }
    }
}

/// Parse a `key:type` forced-type specification
///
/// The type is taken after the last colon so keys may themselves contain colons.
pub fn parse_forced_type(spec: &str) -> Result<(String, ForcedType)> {
    let (key, kind) = spec
        .rsplit_once(':')
        .ok_or_else(|| IngestError::InvalidAttributeSpec(spec.to_string()))?;
    Ok((key.to_string(), kind.parse()?))
}

/// A typed, stringified attribute value
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttributeValue {
    pub attr_type: AttributeType,
    pub text: String,
}

impl AttributeValue {
    pub fn new(attr_type: AttributeType, text: impl Into<String>) -> Self {
        Self {
            attr_type,
            text: text.into(),
        }
    }
}

/// One `key → value` pair of a feature
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Attribute {
    pub key: String,
    pub value: AttributeValue,
}

/// Encode one raw attribute value
///
/// Returns `None` for values that produce no attribute (JSON null without a forced
/// type). Strings are always valid UTF-8 here, the reader stops at anything else and
/// describes it with [`check_utf8`].
///
/// # Arguments
/// * `key` - Attribute key, used to look up `forced`
/// * `value` - Raw JSON value
/// * `forced` - Forced types by key
pub fn encode_attribute(
    key: &str,
    value: &Value,
    forced: &BTreeMap<String, ForcedType>,
) -> Option<AttributeValue> {
    let (mut attr_type, mut text) = match value {
        Value::String(s) => (AttributeType::String, s.clone()),
        Value::Number(n) => (AttributeType::Number, n.to_string()),
        Value::Bool(b) => (AttributeType::Bool, b.to_string()),
        Value::Null => (AttributeType::Null, "null".to_string()),
        // Composite values are kept as their JSON text
        Value::Array(_) | Value::Object(_) => (AttributeType::String, value.to_string()),
    };

    if let Some(forced) = forced.get(key) {
        (attr_type, text) = coerce(*forced, text);
    }

    match attr_type {
        AttributeType::Null => None,
        _ => Some(AttributeValue::new(attr_type, text)),
    }
}

/// Apply a forced type to already stringified text
fn coerce(forced: ForcedType, text: String) -> (AttributeType, String) {
    match forced {
        ForcedType::String => (AttributeType::String, text),
        ForcedType::Float => (AttributeType::Number, format!("{:.6}", leading_float(&text))),
        ForcedType::Int => {
            if text.is_empty() {
                (AttributeType::Number, "0".to_string())
            } else if text.bytes().all(|c| c.is_ascii_digit()) {
                (AttributeType::Number, text)
            } else {
                let rounded = leading_float(&text).round();
                let rounded = if rounded == 0.0 { 0.0 } else { rounded };
                (AttributeType::Number, format!("{rounded:.0}"))
            }
        }
        ForcedType::Bool => {
            if FALSE_ALIASES.contains(&text.as_str()) {
                (AttributeType::Bool, "false".to_string())
            } else {
                (AttributeType::Bool, "true".to_string())
            }
        }
    }
}

/// Parse the longest numeric prefix of `text`, or 0 if there is none
///
/// Leading whitespace is skipped and trailing garbage is ignored.
pub fn leading_float(text: &str) -> f64 {
    let s = text.trim_start();
    let bytes = s.as_bytes();
    let mut end = 0;

    if end < bytes.len() && (bytes[end] == b'+' || bytes[end] == b'-') {
        end += 1;
    }
    let digits_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if end < bytes.len() && bytes[end] == b'.' {
        end += 1;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
    }
    if end == digits_start || (end == digits_start + 1 && bytes[digits_start] == b'.') {
        return 0.0;
    }

    // Exponent only counts if it has digits
    if end < bytes.len() && (bytes[end] == b'e' || bytes[end] == b'E') {
        let mut exp_end = end + 1;
        if exp_end < bytes.len() && (bytes[exp_end] == b'+' || bytes[exp_end] == b'-') {
            exp_end += 1;
        }
        let exp_digits = exp_end;
        while exp_end < bytes.len() && bytes[exp_end].is_ascii_digit() {
            exp_end += 1;
        }
        if exp_end > exp_digits {
            end = exp_end;
        }
    }

    s[..end].parse().unwrap_or(0.0)
}

/// Validate that `bytes` are UTF-8, returning a description of the problem if not
pub fn check_utf8(bytes: &[u8]) -> Option<String> {
    match std::str::from_utf8(bytes) {
        Ok(_) => None,
        Err(err) => {
            let at = err.valid_up_to();
            let len = err.error_len().unwrap_or(bytes.len() - at);
            let offending: Vec<String> = bytes[at..at + len]
                .iter()
                .map(|b| format!("0x{b:02x}"))
                .collect();
            Some(format!(
                "\"{}\" is not valid UTF-8 ({} at byte {})",
                String::from_utf8_lossy(bytes),
                offending.join(" "),
                at
            ))
        }
    }
}
